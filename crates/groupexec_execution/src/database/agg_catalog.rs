//! Aggregate metadata resolution and access checks.

use std::fmt::Debug;

use groupexec_error::{ErrorKind, GroupExecError, Result};
use groupexec_row::datatype::DataType;
use groupexec_row::datum::Datum;
use hashbrown::HashMap;
use once_cell::sync::Lazy;

use crate::expr::aggregate_expr::AggregateId;
use crate::functions::aggregate::{AggregateMeta, BUILTIN_AGGREGATES};

/// EXECUTE checks for aggregates and their component functions.
///
/// The executor asks once per function at init; a denial is fatal with a
/// structured permission error.
pub trait AccessPolicy: Debug + Send + Sync {
    fn check_execute(&self, function_name: &str) -> Result<()>;
}

/// Policy that grants everything. The default for embedded use.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn check_execute(&self, _function_name: &str) -> Result<()> {
        Ok(())
    }
}

pub fn permission_denied(function_name: &str) -> GroupExecError {
    GroupExecError::with_kind(
        format!("Permission denied for function {function_name}"),
        ErrorKind::PermissionDenied,
    )
}

/// Registry of aggregate definitions keyed by id.
#[derive(Debug, Clone)]
pub struct AggregateCatalog {
    by_id: HashMap<u32, AggregateMeta>,
}

static BUILTIN_CATALOG: Lazy<AggregateCatalog> =
    Lazy::new(|| AggregateCatalog::new(BUILTIN_AGGREGATES.clone()));

impl AggregateCatalog {
    pub fn new(entries: impl IntoIterator<Item = AggregateMeta>) -> Self {
        AggregateCatalog {
            by_id: entries.into_iter().map(|meta| (meta.id.0, meta)).collect(),
        }
    }

    /// The builtin aggregates.
    pub fn builtin() -> &'static AggregateCatalog {
        &BUILTIN_CATALOG
    }

    /// Builtin aggregates plus additional entries. Extra entries shadow
    /// builtins with the same id.
    pub fn builtin_with(entries: impl IntoIterator<Item = AggregateMeta>) -> Self {
        let mut catalog = Self::builtin().clone();
        for meta in entries {
            catalog.by_id.insert(meta.id.0, meta);
        }
        catalog
    }

    pub fn lookup(&self, id: AggregateId) -> Result<&AggregateMeta> {
        self.by_id.get(&id.0).ok_or_else(|| {
            GroupExecError::new(format!("Unknown aggregate function: {id}"))
        })
    }

    /// Look up by SQL name and argument types. Convenience for plan builders
    /// and tests; execution always goes through ids.
    pub fn lookup_by_name(&self, name: &str, arg_types: &[DataType]) -> Result<&AggregateMeta> {
        let mut candidates = self
            .by_id
            .values()
            .filter(|meta| meta.name == name)
            .peekable();

        if candidates.peek().is_none() {
            return Err(GroupExecError::new(format!(
                "Unknown aggregate function: {name}"
            )));
        }

        candidates
            .find(|meta| meta.signature().matches(arg_types))
            .ok_or_else(|| {
                GroupExecError::new(format!(
                    "No signature of aggregate {name} matches the given argument types"
                ))
            })
    }

    /// Resolve an aggregate for execution: look it up, then verify EXECUTE on
    /// the aggregate and on every component function.
    pub fn resolve(&self, id: AggregateId, access: &dyn AccessPolicy) -> Result<&AggregateMeta> {
        let meta = self.lookup(id)?;

        access
            .check_execute(meta.name)
            .map_err(|_| permission_denied(meta.name))?;

        let mut components = vec![meta.trans_fn.name];
        if let Some(f) = &meta.final_fn {
            components.push(f.name);
        }
        if let Some(f) = &meta.combine_fn {
            components.push(f.name);
        }
        if let Some(f) = &meta.serial_fn {
            components.push(f.name);
        }
        if let Some(f) = &meta.deserial_fn {
            components.push(f.name);
        }

        for name in components {
            access
                .check_execute(name)
                .map_err(|_| permission_denied(name))?;
        }

        Ok(meta)
    }
}

/// Parse an initial value from its catalog text form against the declared
/// transition type.
pub fn get_agg_init_val(text: &str, trans_type: &DataType) -> Result<Datum> {
    let parse_err = |detail: &str| {
        GroupExecError::with_kind(
            format!("Invalid initial value {text:?} for type {trans_type}: {detail}"),
            ErrorKind::Configuration,
        )
    };

    match trans_type {
        DataType::Boolean => match text {
            "t" | "true" => Ok(Datum::Boolean(true)),
            "f" | "false" => Ok(Datum::Boolean(false)),
            _ => Err(parse_err("expected boolean literal")),
        },
        DataType::Int32 => text
            .parse::<i32>()
            .map(Datum::Int32)
            .map_err(|_| parse_err("expected integer literal")),
        DataType::Int64 => text
            .parse::<i64>()
            .map(Datum::Int64)
            .map_err(|_| parse_err("expected integer literal")),
        DataType::Float64 => text
            .parse::<f64>()
            .map(Datum::Float64)
            .map_err(|_| parse_err("expected float literal")),
        DataType::Utf8 => Ok(Datum::Utf8(text.to_string())),
        DataType::Struct(fields) => {
            let inner = text
                .strip_prefix('{')
                .and_then(|t| t.strip_suffix('}'))
                .ok_or_else(|| parse_err("expected {..} literal"))?;

            let parts: Vec<_> = if inner.is_empty() {
                Vec::new()
            } else {
                inner.split(',').map(|p| p.trim()).collect()
            };

            if parts.len() != fields.len() {
                return Err(parse_err("wrong number of struct fields"));
            }

            let values = parts
                .iter()
                .zip(fields)
                .map(|(part, field_type)| get_agg_init_val(part, field_type).map(Some))
                .collect::<Result<Vec<_>>>()?;

            Ok(Datum::Struct(values))
        }
        other => Err(GroupExecError::with_kind(
            format!("Initial values of type {other} are not supported"),
            ErrorKind::Configuration,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::aggregate::{avg, count, sum};

    #[derive(Debug)]
    struct DenyList(&'static [&'static str]);

    impl AccessPolicy for DenyList {
        fn check_execute(&self, function_name: &str) -> Result<()> {
            if self.0.contains(&function_name) {
                return Err(permission_denied(function_name));
            }
            Ok(())
        }
    }

    #[test]
    fn resolve_checks_component_functions() {
        let catalog = AggregateCatalog::builtin();

        catalog.resolve(avg::AVG_INT64, &AllowAll).unwrap();

        // Denying the serialize component blocks the whole aggregate.
        let err = catalog
            .resolve(avg::AVG_INT64, &DenyList(&["int8_avg_serialize"]))
            .unwrap_err();
        assert_eq!(ErrorKind::PermissionDenied, err.kind());
    }

    #[test]
    fn lookup_by_name_picks_matching_signature() {
        let catalog = AggregateCatalog::builtin();

        let meta = catalog
            .lookup_by_name("sum", &[DataType::Int64])
            .unwrap();
        assert_eq!(sum::SUM_INT64, meta.id);

        let meta = catalog
            .lookup_by_name("sum", &[DataType::Float64])
            .unwrap();
        assert_eq!(sum::SUM_FLOAT64, meta.id);

        let meta = catalog.lookup_by_name("count", &[]).unwrap();
        assert_eq!(count::COUNT_STAR, meta.id);
    }

    #[test]
    fn init_val_parses_struct_literal() {
        let parsed = get_agg_init_val(
            "{0,0}",
            &DataType::Struct(vec![DataType::Float64, DataType::Int64]),
        )
        .unwrap();
        assert_eq!(
            Datum::Struct(vec![Some(Datum::Float64(0.0)), Some(Datum::Int64(0))]),
            parsed
        );
    }

    #[test]
    fn init_val_rejects_malformed_literal() {
        let err = get_agg_init_val("nope", &DataType::Int64).unwrap_err();
        assert_eq!(ErrorKind::Configuration, err.kind());
    }
}
