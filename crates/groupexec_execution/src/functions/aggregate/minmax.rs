use std::cmp::Ordering;

use groupexec_error::{GroupExecError, Result};
use groupexec_row::datatype::DataType;
use groupexec_row::datum::Datum;
use groupexec_row::sort::datum_cmp;

use super::{AggFnContext, AggregateMeta, FinalModify, TransFn};
use crate::expr::aggregate_expr::AggregateId;

pub const MIN: AggregateId = AggregateId(7);
pub const MAX: AggregateId = AggregateId(8);

pub fn entries() -> Vec<AggregateMeta> {
    vec![min_max_entry(MIN, "min", "smaller", smaller), min_max_entry(MAX, "max", "larger", larger)]
}

fn min_max_entry(
    id: AggregateId,
    name: &'static str,
    fn_name: &'static str,
    func: super::RawTransitionFn,
) -> AggregateMeta {
    AggregateMeta {
        id,
        name,
        arg_types: vec![DataType::Any],
        result_type: DataType::Any,
        trans_type: DataType::Any,
        internal_state: false,
        // Strict with a null initial value: the first input is adopted
        // verbatim, so the transition function only ever sees two values.
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

fn pick(
    state: Option<Datum>,
    args: &[Option<Datum>],
    keep_state_on: Ordering,
) -> Result<Option<Datum>> {
    let (state, arg) = match (state, &args[0]) {
        (Some(s), Some(a)) => (s, a),
        _ => return Err(GroupExecError::new("Unexpected null in strict function")),
    };

    if datum_cmp(&state, arg) == keep_state_on || datum_cmp(&state, arg) == Ordering::Equal {
        Ok(Some(state))
    } else {
        Ok(Some(arg.clone()))
    }
}

fn smaller(
    _ctx: &mut AggFnContext,
    state: Option<Datum>,
    args: &[Option<Datum>],
) -> Result<Option<Datum>> {
    pick(state, args, Ordering::Less)
}

fn larger(
    _ctx: &mut AggFnContext,
    state: Option<Datum>,
    args: &[Option<Datum>],
) -> Result<Option<Datum>> {
    pick(state, args, Ordering::Greater)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smaller_keeps_minimum() {
        let mut ctx = AggFnContext::outside_aggregate();
        let state = Some(Datum::Int64(5));
        let state = smaller(&mut ctx, state, &[Some(Datum::Int64(3))]).unwrap();
        let state = smaller(&mut ctx, state, &[Some(Datum::Int64(9))]).unwrap();
        assert_eq!(Some(Datum::Int64(3)), state);
    }

    #[test]
    fn larger_works_on_strings() {
        let mut ctx = AggFnContext::outside_aggregate();
        let state = Some(Datum::from("apple"));
        let state = larger(&mut ctx, state, &[Some(Datum::from("pear"))]).unwrap();
        assert_eq!(Some(Datum::from("pear")), state);
    }
}
