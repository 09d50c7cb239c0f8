use groupexec_error::{GroupExecError, Result};
use groupexec_row::datatype::DataType;
use groupexec_row::datum::Datum;

use super::{AggFnContext, AggregateMeta, FinalModify, TransFn};
use crate::expr::aggregate_expr::AggregateId;

pub const COUNT_STAR: AggregateId = AggregateId(1);
pub const COUNT_ANY: AggregateId = AggregateId(2);

pub fn entries() -> Vec<AggregateMeta> {
    vec![
        AggregateMeta {
            id: COUNT_STAR,
            name: "count",
            arg_types: Vec::new(),
            result_type: DataType::Int64,
            trans_type: DataType::Int64,
            internal_state: false,
            init_value: Some("0"),
            trans_fn: TransFn {
                name: "int8inc",
                strict: false,
                func: count_star_transfn,
            },
            final_fn: None,
            num_final_extra_args: 0,
            combine_fn: Some(TransFn {
                name: "int8pl",
                strict: true,
                func: count_combine,
            }),
            serial_fn: None,
            deserial_fn: None,
            final_modify: FinalModify::ReadOnly,
            trans_space: 0,
        },
        AggregateMeta {
            id: COUNT_ANY,
            name: "count",
            arg_types: vec![DataType::Any],
            result_type: DataType::Int64,
            trans_type: DataType::Int64,
            internal_state: false,
            init_value: Some("0"),
            // Strict: null inputs are skipped without a call, which is what
            // makes count(x) count only non-null values.
            trans_fn: TransFn {
                name: "int8inc_any",
                strict: true,
                func: count_any_transfn,
            },
            final_fn: None,
            num_final_extra_args: 0,
            combine_fn: Some(TransFn {
                name: "int8pl",
                strict: true,
                func: count_combine,
            }),
            serial_fn: None,
            deserial_fn: None,
            final_modify: FinalModify::ReadOnly,
            trans_space: 0,
        },
    ]
}

fn current_count(state: &Option<Datum>) -> Result<i64> {
    match state {
        Some(d) => d.try_as_i64(),
        None => Err(GroupExecError::new("count state unexpectedly null")),
    }
}

fn count_star_transfn(
    _ctx: &mut AggFnContext,
    state: Option<Datum>,
    _args: &[Option<Datum>],
) -> Result<Option<Datum>> {
    Ok(Some(Datum::Int64(current_count(&state)? + 1)))
}

fn count_any_transfn(
    _ctx: &mut AggFnContext,
    state: Option<Datum>,
    _args: &[Option<Datum>],
) -> Result<Option<Datum>> {
    Ok(Some(Datum::Int64(current_count(&state)? + 1)))
}

fn count_combine(
    _ctx: &mut AggFnContext,
    state: Option<Datum>,
    args: &[Option<Datum>],
) -> Result<Option<Datum>> {
    let other = match &args[0] {
        Some(d) => d.try_as_i64()?,
        None => 0,
    };
    Ok(Some(Datum::Int64(current_count(&state)? + other)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_increments_regardless_of_value() {
        let mut ctx = AggFnContext::outside_aggregate();
        let state = Some(Datum::Int64(0));
        let state = count_star_transfn(&mut ctx, state, &[]).unwrap();
        let state = count_star_transfn(&mut ctx, state, &[]).unwrap();
        assert_eq!(Some(Datum::Int64(2)), state);
    }

    #[test]
    fn combine_adds_counts() {
        let mut ctx = AggFnContext::outside_aggregate();
        let combined = count_combine(
            &mut ctx,
            Some(Datum::Int64(3)),
            &[Some(Datum::Int64(4))],
        )
        .unwrap();
        assert_eq!(Some(Datum::Int64(7)), combined);
    }
}
