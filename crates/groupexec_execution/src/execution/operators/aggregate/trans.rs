//! Transition-state management: initialize, advance, and finalize one
//! group's state for one transition descriptor.

use groupexec_error::{ErrorKind, GroupExecError, Result};
use groupexec_row::datum::Datum;
use groupexec_row::row::Row;
use smallvec::SmallVec;

use super::build::{AggregateDescriptor, TransitionDescriptor};
use crate::arena::Arena;
use crate::expr::aggregate_expr::AggregateRef;
use crate::functions::aggregate::AggFnContext;

/// Mutable per-(group, transition) state.
#[derive(Debug, Clone, Default)]
pub struct GroupState {
    pub value: Option<Datum>,

    /// Distinguishes "strict transition function with a null initial value,
    /// still waiting for the first non-null input" from a legitimately null
    /// running value. Implies `value.is_none()`.
    pub no_value_yet: bool,
}

fn user_fn_error(name: &str, err: GroupExecError) -> GroupExecError {
    GroupExecError {
        msg: format!("Aggregate function {name} failed: {}", err.msg),
        kind: ErrorKind::UserFunction,
        source: err.source,
    }
}

/// Copy the cached initial value into a fresh group state, charging the
/// owning arena for it.
pub fn initialize_group_state(pertrans: &TransitionDescriptor, arena: &Arena) -> GroupState {
    match &pertrans.init_value {
        Some(init) => {
            arena.charge(init.heap_size());
            GroupState {
                value: Some(init.clone()),
                no_value_yet: false,
            }
        }
        None => GroupState {
            value: None,
            no_value_yet: true,
        },
    }
}

/// Advance one group state with one argument tuple.
pub fn advance_transition(
    pertrans: &TransitionDescriptor,
    aggref: &AggregateRef,
    state: &mut GroupState,
    args: &[Option<Datum>],
    group_arena: &Arena,
    tmp_arena: &Arena,
) -> Result<()> {
    if pertrans.trans_fn.strict {
        if args.iter().any(|a| a.is_none()) {
            return Ok(());
        }
        if state.no_value_yet {
            // Adopt the first non-null input verbatim. Init-time validation
            // guarantees binary compatibility of input and transition type.
            let adopted = args[0].clone();
            group_arena.charge(adopted.as_ref().map(|d| d.heap_size()).unwrap_or(0));
            state.value = adopted;
            state.no_value_yet = false;
            return Ok(());
        }
        if state.value.is_none() {
            // A strict function's null state stays null for good.
            return Ok(());
        }
    }

    let mut ctx = AggFnContext::for_aggregate(group_arena, tmp_arena, aggref, pertrans.shared);
    let prior = state.value.take();
    let next = (pertrans.trans_fn.func)(&mut ctx, prior, args)
        .map_err(|e| user_fn_error(pertrans.trans_fn.name, e))?;

    state.value = next;
    state.no_value_yet = false;
    Ok(())
}

/// Merge one partial state into a group state using the combine function.
pub fn advance_combine(
    pertrans: &TransitionDescriptor,
    aggref: &AggregateRef,
    state: &mut GroupState,
    partial: Option<Datum>,
    group_arena: &Arena,
    tmp_arena: &Arena,
) -> Result<()> {
    let combine = pertrans.combine_fn.ok_or_else(|| {
        GroupExecError::new("Combine requested for an aggregate without a combine function")
    })?;

    if combine.strict {
        if partial.is_none() {
            return Ok(());
        }
        if state.value.is_none() {
            // First partial state for this group: take it as-is. The types
            // are identical by construction, no call needed.
            group_arena.charge(partial.as_ref().map(|d| d.heap_size()).unwrap_or(0));
            state.value = partial;
            state.no_value_yet = false;
            return Ok(());
        }
    }

    let mut ctx = AggFnContext::for_aggregate(group_arena, tmp_arena, aggref, pertrans.shared);
    let prior = state.value.take();
    let args: SmallVec<[Option<Datum>; 1]> = smallvec::smallvec![partial];
    let next = (combine.func)(&mut ctx, prior, &args)
        .map_err(|e| user_fn_error(combine.name, e))?;

    state.value = next;
    state.no_value_yet = false;
    Ok(())
}

/// Compute the final value of one aggregate for one group.
///
/// Direct arguments are evaluated unconditionally for their side effects,
/// then passed (padded with null fillers) to the final function when one
/// exists. Without a final function the state itself is the result.
pub fn finalize_aggregate(
    peragg: &AggregateDescriptor,
    pertrans: &TransitionDescriptor,
    aggref: &AggregateRef,
    state: &GroupState,
    rep_row: &Row,
    output_arena: &Arena,
    tmp_arena: &Arena,
) -> Result<Option<Datum>> {
    let mut extra: SmallVec<[Option<Datum>; 4]> = SmallVec::new();
    for expr in &peragg.direct_args {
        extra.push(expr.eval(rep_row)?);
    }
    while extra.len() < peragg.num_final_extra_args {
        extra.push(None);
    }

    let result = match &peragg.final_fn {
        Some(final_fn) => {
            if final_fn.strict && (state.value.is_none() || extra.iter().any(|a| a.is_none())) {
                None
            } else {
                let mut ctx =
                    AggFnContext::for_aggregate(output_arena, tmp_arena, aggref, pertrans.shared);
                (final_fn.func)(&mut ctx, &state.value, &extra)
                    .map_err(|e| user_fn_error(final_fn.name, e))?
            }
        }
        None => state.value.clone(),
    };

    output_arena.charge(result.as_ref().map(|d| d.heap_size()).unwrap_or(0));
    Ok(result)
}

/// Partial-aggregation finalization: serialize the state when a serialize
/// function exists, otherwise hand the state out directly.
pub fn finalize_partial(
    pertrans: &TransitionDescriptor,
    state: &GroupState,
    output_arena: &Arena,
) -> Result<Option<Datum>> {
    let result = match (&pertrans.serial_fn, &state.value) {
        (Some(serial), Some(value)) => {
            Some((serial.func)(value).map_err(|e| user_fn_error(serial.name, e))?)
        }
        (Some(_), None) => None,
        (None, value) => value.clone(),
    };

    output_arena.charge(result.as_ref().map(|d| d.heap_size()).unwrap_or(0));
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::agg_catalog::{AggregateCatalog, AllowAll};
    use crate::functions::aggregate::sum;

    fn sum_int64_pertrans() -> (TransitionDescriptor, AggregateRef) {
        let meta = AggregateCatalog::builtin()
            .resolve(sum::SUM_INT64, &AllowAll)
            .unwrap();
        let aggref = AggregateRef::simple(
            sum::SUM_INT64,
            vec![crate::expr::PhysicalScalarExpression::Column(0)],
        );
        let pertrans = TransitionDescriptor {
            aggref_idx: 0,
            trans_fn: meta.trans_fn,
            num_trans_inputs: 1,
            trans_type: meta.trans_type.clone(),
            internal_state: meta.internal_state,
            init_value: None,
            combine_fn: meta.combine_fn,
            serial_fn: meta.serial_fn,
            deserial_fn: meta.deserial_fn,
            args: aggref.args.clone(),
            filter: None,
            distinct: false,
            sort_keys: Vec::new(),
            trans_space: 0,
            shared: false,
            deserialize_input: false,
        };
        (pertrans, aggref)
    }

    #[test]
    fn strict_null_init_adopts_first_value_without_a_call() {
        let (pertrans, aggref) = sum_int64_pertrans();
        let group = Arena::new("group");
        let tmp = Arena::new("tmp");

        let mut state = initialize_group_state(&pertrans, &group);
        assert!(state.no_value_yet);

        // All-null input leaves the state untouched.
        advance_transition(&pertrans, &aggref, &mut state, &[None], &group, &tmp).unwrap();
        assert!(state.no_value_yet);
        assert_eq!(None, state.value);

        // First non-null input is adopted verbatim.
        advance_transition(
            &pertrans,
            &aggref,
            &mut state,
            &[Some(Datum::Int64(7))],
            &group,
            &tmp,
        )
        .unwrap();
        assert!(!state.no_value_yet);
        assert_eq!(Some(Datum::Int64(7)), state.value);

        // Subsequent inputs go through the transition function.
        advance_transition(
            &pertrans,
            &aggref,
            &mut state,
            &[Some(Datum::Int64(5))],
            &group,
            &tmp,
        )
        .unwrap();
        assert_eq!(Some(Datum::Int64(12)), state.value);
    }

    #[test]
    fn finalize_without_final_fn_returns_state() {
        let (pertrans, aggref) = sum_int64_pertrans();
        let group = Arena::new("group");
        let tmp = Arena::new("tmp");
        let out = Arena::new("out");

        let peragg = AggregateDescriptor {
            aggref_idx: 0,
            agg_id: sum::SUM_INT64,
            name: "sum",
            final_fn: None,
            num_final_extra_args: 0,
            direct_args: Vec::new(),
            result_type: groupexec_row::datatype::DataType::Int64,
            shareable: true,
            transno: 0,
        };

        let state = GroupState {
            value: Some(Datum::Int64(42)),
            no_value_yet: false,
        };
        let result =
            finalize_aggregate(&peragg, &pertrans, &aggref, &state, &Row::empty(), &out, &tmp)
                .unwrap();
        assert_eq!(Some(Datum::Int64(42)), result);
        drop(group);
    }

    #[test]
    fn strict_combine_adopts_first_partial_state() {
        let (pertrans, aggref) = sum_int64_pertrans();
        let group = Arena::new("group");
        let tmp = Arena::new("tmp");

        let mut state = initialize_group_state(&pertrans, &group);
        advance_combine(
            &pertrans,
            &aggref,
            &mut state,
            Some(Datum::Int64(10)),
            &group,
            &tmp,
        )
        .unwrap();
        assert_eq!(Some(Datum::Int64(10)), state.value);

        advance_combine(
            &pertrans,
            &aggref,
            &mut state,
            Some(Datum::Int64(5)),
            &group,
            &tmp,
        )
        .unwrap();
        assert_eq!(Some(Datum::Int64(15)), state.value);
    }
}
