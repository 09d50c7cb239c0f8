use groupexec_error::{GroupExecError, Result};
use groupexec_row::datatype::DataType;
use groupexec_row::datum::Datum;

use super::{AggFnContext, AggregateMeta, FinalModify, TransFn};
use crate::expr::aggregate_expr::AggregateId;

pub const BOOL_AND: AggregateId = AggregateId(9);
pub const BOOL_OR: AggregateId = AggregateId(10);

pub fn entries() -> Vec<AggregateMeta> {
    vec![
        bool_entry(BOOL_AND, "bool_and", "booland_statefunc", booland_statefunc),
        bool_entry(BOOL_OR, "bool_or", "boolor_statefunc", boolor_statefunc),
    ]
}

fn bool_entry(
    id: AggregateId,
    name: &'static str,
    fn_name: &'static str,
    func: super::RawTransitionFn,
) -> AggregateMeta {
    AggregateMeta {
        id,
        name,
        arg_types: vec![DataType::Boolean],
        result_type: DataType::Boolean,
        trans_type: DataType::Boolean,
        internal_state: false,
        init_value: None,
        trans_fn: TransFn {
            name: fn_name,
            strict: true,
            func,
        },
        final_fn: None,
        num_final_extra_args: 0,
        combine_fn: Some(TransFn {
            name: fn_name,
            strict: true,
            func,
        }),
        serial_fn: None,
        deserial_fn: None,
        final_modify: FinalModify::ReadOnly,
        trans_space: 0,
    }
}

fn both(state: Option<Datum>, args: &[Option<Datum>]) -> Result<(bool, bool)> {
    match (&state, &args[0]) {
        (Some(s), Some(a)) => Ok((s.try_as_bool()?, a.try_as_bool()?)),
        _ => Err(GroupExecError::new("Unexpected null in strict function")),
    }
}

fn booland_statefunc(
    _ctx: &mut AggFnContext,
    state: Option<Datum>,
    args: &[Option<Datum>],
) -> Result<Option<Datum>> {
    let (s, a) = both(state, args)?;
    Ok(Some(Datum::Boolean(s && a)))
}

fn boolor_statefunc(
    _ctx: &mut AggFnContext,
    state: Option<Datum>,
    args: &[Option<Datum>],
) -> Result<Option<Datum>> {
    let (s, a) = both(state, args)?;
    Ok(Some(Datum::Boolean(s || a)))
}
