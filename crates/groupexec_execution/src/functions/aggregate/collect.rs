//! Collection aggregates: array_agg and string_agg.

use std::mem;

use groupexec_error::{ErrorKind, GroupExecError, Result};
use groupexec_row::datatype::DataType;
use groupexec_row::datum::Datum;

use super::{AggContextKind, AggFnContext, AggregateMeta, FinalFn, FinalModify, TransFn};
use crate::expr::aggregate_expr::AggregateId;

pub const ARRAY_AGG: AggregateId = AggregateId(11);
pub const STRING_AGG: AggregateId = AggregateId(12);

pub fn entries() -> Vec<AggregateMeta> {
    vec![
        AggregateMeta {
            id: ARRAY_AGG,
            name: "array_agg",
            arg_types: vec![DataType::Any],
            result_type: DataType::List(Box::new(DataType::Any)),
            trans_type: DataType::List(Box::new(DataType::Any)),
            internal_state: false,
            init_value: None,
            // Not strict: array_agg collects nulls, so the transition
            // function must be called on null input too.
            trans_fn: TransFn {
                name: "array_agg_transfn",
                strict: false,
                func: array_agg_transfn,
            },
            final_fn: Some(FinalFn {
                name: "array_agg_finalfn",
                strict: false,
                func: array_agg_finalfn,
            }),
            num_final_extra_args: 0,
            combine_fn: Some(TransFn {
                name: "array_agg_combine",
                strict: false,
                func: array_agg_combine,
            }),
            serial_fn: None,
            deserial_fn: None,
            // The final function hands the accumulated list out without
            // copying; the state cannot back more than one aggregate.
            final_modify: FinalModify::ReadWrite,
            trans_space: 64,
        },
        AggregateMeta {
            id: STRING_AGG,
            name: "string_agg",
            arg_types: vec![DataType::Utf8, DataType::Utf8],
            result_type: DataType::Utf8,
            trans_type: DataType::Utf8,
            internal_state: false,
            init_value: None,
            trans_fn: TransFn {
                name: "string_agg_transfn",
                strict: false,
                func: string_agg_transfn,
            },
            final_fn: None,
            num_final_extra_args: 0,
            combine_fn: None,
            serial_fn: None,
            deserial_fn: None,
            final_modify: FinalModify::ReadOnly,
            trans_space: 32,
        },
    ]
}

fn require_aggregate_context(ctx: &AggFnContext) -> Result<()> {
    if ctx.kind() == AggContextKind::None {
        return Err(GroupExecError::with_kind(
            "Collection transition function called in non-aggregate context",
            ErrorKind::UserFunction,
        ));
    }
    Ok(())
}

fn array_agg_transfn(
    ctx: &mut AggFnContext,
    state: Option<Datum>,
    args: &[Option<Datum>],
) -> Result<Option<Datum>> {
    require_aggregate_context(ctx)?;

    let mut elems = match state {
        Some(d) => d.try_into_list()?,
        None => Vec::new(),
    };

    let elem = args[0].clone();
    ctx.charge_group_memory(
        mem::size_of::<Option<Datum>>() + elem.as_ref().map(|d| d.heap_size()).unwrap_or(0),
    );
    elems.push(elem);

    Ok(Some(Datum::List(elems)))
}

fn array_agg_combine(
    ctx: &mut AggFnContext,
    state: Option<Datum>,
    args: &[Option<Datum>],
) -> Result<Option<Datum>> {
    let other = match &args[0] {
        Some(d) => d.clone().try_into_list()?,
        None => return Ok(state),
    };

    let mut elems = match state {
        Some(d) => d.try_into_list()?,
        None => Vec::new(),
    };

    ctx.charge_group_memory(
        other.len() * mem::size_of::<Option<Datum>>()
            + other
                .iter()
                .flatten()
                .map(|d| d.heap_size())
                .sum::<usize>(),
    );
    elems.extend(other);

    Ok(Some(Datum::List(elems)))
}

fn array_agg_finalfn(
    _ctx: &mut AggFnContext,
    state: &Option<Datum>,
    _extra: &[Option<Datum>],
) -> Result<Option<Datum>> {
    // Aggregating zero rows produces null, not an empty array.
    Ok(state.clone())
}

fn string_agg_transfn(
    ctx: &mut AggFnContext,
    state: Option<Datum>,
    args: &[Option<Datum>],
) -> Result<Option<Datum>> {
    require_aggregate_context(ctx)?;

    // A null value contributes nothing; a null delimiter joins adjacent
    // values directly.
    let value = match &args[0] {
        Some(d) => d.try_as_str()?,
        None => return Ok(state),
    };

    match state {
        None => {
            ctx.charge_group_memory(value.len());
            Ok(Some(Datum::Utf8(value.to_string())))
        }
        Some(Datum::Utf8(mut acc)) => {
            let delim = match &args[1] {
                Some(d) => d.try_as_str()?,
                None => "",
            };
            ctx.charge_group_memory(delim.len() + value.len());
            acc.push_str(delim);
            acc.push_str(value);
            Ok(Some(Datum::Utf8(acc)))
        }
        Some(other) => Err(GroupExecError::new(format!(
            "Malformed string_agg state: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::expr::aggregate_expr::AggregateRef;

    fn test_ctx<'a>(
        group: &'a Arena,
        tmp: &'a Arena,
        aggref: &'a AggregateRef,
    ) -> AggFnContext<'a> {
        AggFnContext::for_aggregate(group, tmp, aggref, false)
    }

    #[test]
    fn array_agg_collects_nulls_and_charges_memory() {
        let group = Arena::new("group");
        let tmp = Arena::new("tmp");
        let aggref = AggregateRef::simple(ARRAY_AGG, vec![]);
        let mut ctx = test_ctx(&group, &tmp, &aggref);

        let state = array_agg_transfn(&mut ctx, None, &[Some(Datum::from("a"))]).unwrap();
        let state = array_agg_transfn(&mut ctx, state, &[None]).unwrap();

        assert_eq!(
            Some(Datum::List(vec![Some(Datum::from("a")), None])),
            state
        );
        assert!(group.allocated() > 0);
    }

    #[test]
    fn array_agg_refuses_plain_call_context() {
        let mut ctx = AggFnContext::outside_aggregate();
        let err = array_agg_transfn(&mut ctx, None, &[None]).unwrap_err();
        assert_eq!(ErrorKind::UserFunction, err.kind());
    }

    #[test]
    fn string_agg_joins_with_delimiter() {
        let group = Arena::new("group");
        let tmp = Arena::new("tmp");
        let aggref = AggregateRef::simple(STRING_AGG, vec![]);
        let mut ctx = test_ctx(&group, &tmp, &aggref);

        let delim = Some(Datum::from(","));
        let state = string_agg_transfn(&mut ctx, None, &[Some(Datum::from("x")), delim.clone()])
            .unwrap();
        let state = string_agg_transfn(&mut ctx, state, &[None, delim.clone()]).unwrap();
        let state = string_agg_transfn(&mut ctx, state, &[Some(Datum::from("y")), delim]).unwrap();

        assert_eq!(Some(Datum::from("x,y")), state);
    }
}
