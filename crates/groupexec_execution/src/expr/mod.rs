pub mod aggregate_expr;

use std::collections::BTreeSet;

use groupexec_error::{GroupExecError, Result};
use groupexec_row::datatype::DataType;
use groupexec_row::datum::Datum;
use groupexec_row::field::Schema;
use groupexec_row::row::Row;

/// A compiled scalar expression evaluated against a single row.
///
/// This is the executor-side remnant of the planner's expression tree: by the
/// time the aggregate node sees it, argument expressions have been reduced to
/// column references and constants.
#[derive(Debug, Clone, PartialEq)]
pub enum PhysicalScalarExpression {
    /// Reference a column in the input row.
    Column(usize),
    /// A constant, possibly null.
    Literal(Option<Datum>),
}

impl PhysicalScalarExpression {
    pub fn eval(&self, row: &Row) -> Result<Option<Datum>> {
        match self {
            Self::Column(idx) => {
                if *idx >= row.num_columns() {
                    return Err(GroupExecError::new(format!(
                        "Column {idx} out of range for row with {} columns",
                        row.num_columns()
                    )));
                }
                Ok(row.columns[*idx].clone())
            }
            Self::Literal(v) => Ok(v.clone()),
        }
    }

    /// Evaluate as a predicate. SQL three-valued logic: null is not true.
    pub fn eval_bool(&self, row: &Row) -> Result<bool> {
        match self.eval(row)? {
            Some(Datum::Boolean(b)) => Ok(b),
            Some(other) => Err(GroupExecError::new(format!(
                "Predicate did not evaluate to a boolean: {other}"
            ))),
            None => Ok(false),
        }
    }

    pub fn datatype(&self, input: &Schema) -> Result<DataType> {
        match self {
            Self::Column(idx) => {
                let field = input.fields.get(*idx).ok_or_else(|| {
                    GroupExecError::new(format!(
                        "Column {idx} out of range for schema with {} columns",
                        input.num_columns()
                    ))
                })?;
                Ok(field.datatype.clone())
            }
            Self::Literal(Some(v)) => Ok(v.datatype()),
            Self::Literal(None) => Ok(DataType::Any),
        }
    }

    /// Whether evaluation can yield different results on identical inputs.
    /// Column references and constants never can; this exists so the
    /// aggregate dedup pass has an honest volatility check to call.
    pub fn is_volatile(&self) -> bool {
        false
    }

    pub fn collect_columns(&self, acc: &mut BTreeSet<usize>) {
        if let Self::Column(idx) = self {
            acc.insert(*idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_column_and_literal() {
        let row: Row = [Some(Datum::Int64(3)), None].into_iter().collect();

        assert_eq!(
            Some(Datum::Int64(3)),
            PhysicalScalarExpression::Column(0).eval(&row).unwrap()
        );
        assert_eq!(None, PhysicalScalarExpression::Column(1).eval(&row).unwrap());
        assert_eq!(
            Some(Datum::Boolean(true)),
            PhysicalScalarExpression::Literal(Some(Datum::Boolean(true)))
                .eval(&row)
                .unwrap()
        );
    }

    #[test]
    fn null_predicate_is_not_true() {
        let row = Row::nulls(1);
        assert!(!PhysicalScalarExpression::Column(0).eval_bool(&row).unwrap());
    }
}
