use std::fmt;
use std::mem;

use groupexec_error::{GroupExecError, Result};

use crate::datatype::DataType;

/// A single owned scalar value.
///
/// Nullness is not a variant; a nullable value is carried as `Option<Datum>`
/// so that "null" and "no value yet" can be told apart by the holder.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Binary(Vec<u8>),

    /// Element values, in order. Elements may individually be null.
    List(Vec<Option<Datum>>),

    /// Field values, in declaration order. Used for composite transition
    /// states like avg's (sum, count).
    Struct(Vec<Option<Datum>>),
}

impl Datum {
    pub fn datatype(&self) -> DataType {
        match self {
            Datum::Boolean(_) => DataType::Boolean,
            Datum::Int32(_) => DataType::Int32,
            Datum::Int64(_) => DataType::Int64,
            Datum::Float64(_) => DataType::Float64,
            Datum::Utf8(_) => DataType::Utf8,
            Datum::Binary(_) => DataType::Binary,
            // Element type is not recoverable from an empty list.
            Datum::List(elems) => DataType::List(Box::new(
                elems
                    .iter()
                    .flatten()
                    .next()
                    .map(|d| d.datatype())
                    .unwrap_or(DataType::Any),
            )),
            Datum::Struct(fields) => DataType::Struct(
                fields
                    .iter()
                    .map(|f| f.as_ref().map(|d| d.datatype()).unwrap_or(DataType::Any))
                    .collect(),
            ),
        }
    }

    /// Bytes of transient allocation held by this value, beyond the enum
    /// itself. Used for memory accounting of transition states and hash
    /// entries.
    pub fn heap_size(&self) -> usize {
        match self {
            Datum::Boolean(_) | Datum::Int32(_) | Datum::Int64(_) | Datum::Float64(_) => 0,
            Datum::Utf8(s) => s.len(),
            Datum::Binary(b) => b.len(),
            Datum::List(elems) | Datum::Struct(elems) => {
                elems.len() * mem::size_of::<Option<Datum>>()
                    + elems
                        .iter()
                        .flatten()
                        .map(|d| d.heap_size())
                        .sum::<usize>()
            }
        }
    }

    pub fn try_as_bool(&self) -> Result<bool> {
        match self {
            Datum::Boolean(v) => Ok(*v),
            other => Err(GroupExecError::new(format!(
                "Not a bool: {other}"
            ))),
        }
    }

    pub fn try_as_i64(&self) -> Result<i64> {
        match self {
            Datum::Int32(v) => Ok(*v as i64),
            Datum::Int64(v) => Ok(*v),
            other => Err(GroupExecError::new(format!("Not an integer: {other}"))),
        }
    }

    pub fn try_as_f64(&self) -> Result<f64> {
        match self {
            Datum::Float64(v) => Ok(*v),
            other => Err(GroupExecError::new(format!("Not a float: {other}"))),
        }
    }

    pub fn try_as_str(&self) -> Result<&str> {
        match self {
            Datum::Utf8(s) => Ok(s),
            other => Err(GroupExecError::new(format!("Not a string: {other}"))),
        }
    }

    pub fn try_as_bytes(&self) -> Result<&[u8]> {
        match self {
            Datum::Binary(b) => Ok(b),
            other => Err(GroupExecError::new(format!("Not binary: {other}"))),
        }
    }

    pub fn try_into_list(self) -> Result<Vec<Option<Datum>>> {
        match self {
            Datum::List(elems) => Ok(elems),
            other => Err(GroupExecError::new(format!("Not a list: {other}"))),
        }
    }

    pub fn try_into_struct(self) -> Result<Vec<Option<Datum>>> {
        match self {
            Datum::Struct(fields) => Ok(fields),
            other => Err(GroupExecError::new(format!("Not a struct: {other}"))),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_opt(f: &mut fmt::Formatter<'_>, v: &Option<Datum>) -> fmt::Result {
            match v {
                Some(d) => write!(f, "{d}"),
                None => write!(f, "NULL"),
            }
        }

        match self {
            Datum::Boolean(v) => write!(f, "{v}"),
            Datum::Int32(v) => write!(f, "{v}"),
            Datum::Int64(v) => write!(f, "{v}"),
            Datum::Float64(v) => write!(f, "{v}"),
            Datum::Utf8(v) => write!(f, "{v}"),
            Datum::Binary(v) => write!(f, "<binary {}>", v.len()),
            Datum::List(elems) => {
                write!(f, "[")?;
                for (idx, elem) in elems.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write_opt(f, elem)?;
                }
                write!(f, "]")
            }
            Datum::Struct(fields) => {
                write!(f, "(")?;
                for (idx, field) in fields.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write_opt(f, field)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<bool> for Datum {
    fn from(v: bool) -> Self {
        Datum::Boolean(v)
    }
}

impl From<i32> for Datum {
    fn from(v: i32) -> Self {
        Datum::Int32(v)
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int64(v)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Float64(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Utf8(v.to_string())
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Self {
        Datum::Utf8(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_size_counts_nested_allocations() {
        let flat = Datum::Int64(4);
        assert_eq!(0, flat.heap_size());

        let s = Datum::Utf8("hello".to_string());
        assert_eq!(5, s.heap_size());

        let list = Datum::List(vec![Some(Datum::Utf8("ab".to_string())), None]);
        assert!(list.heap_size() >= 2);
    }

    #[test]
    fn datatype_of_empty_list_is_any_element() {
        let list = Datum::List(Vec::new());
        assert_eq!(DataType::List(Box::new(DataType::Any)), list.datatype());
    }
}
