//! Sorted aggregate input: buffers for DISTINCT / ORDER BY argument tuples,
//! sorted and optionally deduplicated before feeding the transition function.

use std::cmp::Ordering;

use groupexec_error::Result;
use groupexec_row::datum::Datum;
use groupexec_row::row::Row;
use groupexec_row::sort::{compare_key, grouping_eq, SortKey};
use smallvec::SmallVec;

use super::build::TransitionDescriptor;
use super::trans::{advance_transition, GroupState};
use crate::arena::Arena;
use crate::execution::operators::sort::row_sort::RowSorter;
use crate::expr::aggregate_expr::AggregateRef;
use crate::runtime::CancelToken;

/// Buffered input for one (transition state, grouping set) pair. Created
/// lazily when the first argument tuple arrives for a group and consumed at
/// the group boundary.
#[derive(Debug)]
pub enum SortInput {
    /// Datum-keyed buffer for single-argument aggregates.
    Single(DatumSortBuffer),
    /// Tuple-keyed buffer for multi-argument aggregates.
    Multi(RowSortBuffer),
}

impl SortInput {
    pub fn new(pertrans: &TransitionDescriptor) -> Self {
        if pertrans.num_trans_inputs == 1 {
            SortInput::Single(DatumSortBuffer {
                key: pertrans.sort_keys[0],
                values: Vec::new(),
            })
        } else {
            SortInput::Multi(RowSortBuffer {
                sorter: RowSorter::new(pertrans.sort_keys.clone()),
            })
        }
    }

    pub fn push(&mut self, args: &[Option<Datum>]) -> Result<()> {
        match self {
            SortInput::Single(buf) => {
                buf.values.push(args[0].clone());
                Ok(())
            }
            SortInput::Multi(buf) => buf.sorter.push(Row {
                columns: args.to_vec(),
            }),
        }
    }

    /// Sort, deduplicate when requested, and feed the surviving tuples to
    /// the transition function. Consumes the buffer; its memory is released
    /// when the group completes regardless of later HAVING filtering.
    pub fn process(
        self,
        pertrans: &TransitionDescriptor,
        aggref: &AggregateRef,
        state: &mut GroupState,
        group_arena: &Arena,
        tmp_arena: &Arena,
        cancel: &CancelToken,
    ) -> Result<()> {
        match self {
            SortInput::Single(buf) => process_ordered_aggregate_single(
                pertrans, aggref, state, buf, group_arena, tmp_arena, cancel,
            ),
            SortInput::Multi(buf) => process_ordered_aggregate_multi(
                pertrans, aggref, state, buf, group_arena, tmp_arena, cancel,
            ),
        }
    }
}

#[derive(Debug)]
pub struct DatumSortBuffer {
    key: SortKey,
    values: Vec<Option<Datum>>,
}

#[derive(Debug)]
pub struct RowSortBuffer {
    sorter: RowSorter,
}

/// Single-column path: a datum sort, then a scan suppressing runs of equal
/// consecutive values when DISTINCT. The ordering comparator gates the runs;
/// the equality comparator is the tiebreaker within a run.
fn process_ordered_aggregate_single(
    pertrans: &TransitionDescriptor,
    aggref: &AggregateRef,
    state: &mut GroupState,
    mut buf: DatumSortBuffer,
    group_arena: &Arena,
    tmp_arena: &Arena,
    cancel: &CancelToken,
) -> Result<()> {
    let key = buf.key;
    buf.values.sort_by(|a, b| compare_key(a, b, &key));

    let mut prev: Option<Option<Datum>> = None;
    for value in buf.values {
        cancel.check()?;

        if pertrans.distinct {
            if let Some(prev_value) = &prev {
                let ordered_equal = compare_key(prev_value, &value, &key) == Ordering::Equal;
                if ordered_equal && grouping_eq(prev_value, &value) {
                    continue;
                }
            }
        }

        let args: SmallVec<[Option<Datum>; 1]> = smallvec::smallvec![value.clone()];
        advance_transition(pertrans, aggref, state, &args, group_arena, tmp_arena)?;
        tmp_arena.reset_memory();

        if pertrans.distinct {
            prev = Some(value);
        }
    }

    Ok(())
}

/// Multi-column path: a tuple sort with a retained previous tuple for the
/// duplicate check. Retention moves the row instead of copying it.
fn process_ordered_aggregate_multi(
    pertrans: &TransitionDescriptor,
    aggref: &AggregateRef,
    state: &mut GroupState,
    buf: RowSortBuffer,
    group_arena: &Arena,
    tmp_arena: &Arena,
    cancel: &CancelToken,
) -> Result<()> {
    let mut sorter = buf.sorter;
    sorter.sort();

    let mut prev: Option<Row> = None;
    while let Some(row) = sorter.next()? {
        cancel.check()?;

        if pertrans.distinct {
            if let Some(prev_row) = &prev {
                let duplicate = prev_row
                    .columns
                    .iter()
                    .zip(row.columns.iter())
                    .all(|(a, b)| grouping_eq(a, b));
                if duplicate {
                    continue;
                }
            }
        }

        advance_transition(
            pertrans,
            aggref,
            state,
            &row.columns[..pertrans.num_trans_inputs],
            group_arena,
            tmp_arena,
        )?;
        tmp_arena.reset_memory();

        if pertrans.distinct {
            prev = Some(row);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::agg_catalog::{AggregateCatalog, AllowAll};
    use crate::expr::aggregate_expr::AggregateRef;
    use crate::expr::PhysicalScalarExpression::Column;
    use crate::functions::aggregate::{collect, sum};
    use crate::execution::operators::aggregate::trans::initialize_group_state;

    fn pertrans_for(
        agg_id: crate::expr::aggregate_expr::AggregateId,
        aggref: &AggregateRef,
        sort_keys: Vec<SortKey>,
    ) -> TransitionDescriptor {
        let meta = AggregateCatalog::builtin().resolve(agg_id, &AllowAll).unwrap();
        TransitionDescriptor {
            aggref_idx: 0,
            trans_fn: meta.trans_fn,
            num_trans_inputs: aggref.args.len(),
            trans_type: meta.trans_type.clone(),
            internal_state: meta.internal_state,
            init_value: None,
            combine_fn: meta.combine_fn,
            serial_fn: meta.serial_fn,
            deserial_fn: meta.deserial_fn,
            args: aggref.args.clone(),
            filter: None,
            distinct: aggref.distinct,
            sort_keys,
            trans_space: meta.trans_space,
            shared: false,
            deserialize_input: false,
        }
    }

    #[test]
    fn distinct_suppresses_duplicate_runs() {
        let aggref = AggregateRef::simple(sum::SUM_INT64, vec![Column(0)]).with_distinct();
        let pertrans = pertrans_for(sum::SUM_INT64, &aggref, vec![SortKey::asc(0)]);

        let group = Arena::new("group");
        let tmp = Arena::new("tmp");
        let cancel = CancelToken::new();

        let mut buf = SortInput::new(&pertrans);
        for v in [3i64, 1, 3, 2, 1, 3] {
            buf.push(&[Some(Datum::Int64(v))]).unwrap();
        }

        let mut state = initialize_group_state(&pertrans, &group);
        buf.process(&pertrans, &aggref, &mut state, &group, &tmp, &cancel)
            .unwrap();

        // sum over distinct {1, 2, 3}
        assert_eq!(Some(Datum::Int64(6)), state.value);
    }

    #[test]
    fn order_by_feeds_values_in_key_order() {
        let aggref = AggregateRef::simple(collect::ARRAY_AGG, vec![Column(0)]).with_order_by(
            vec![crate::expr::aggregate_expr::AggOrderBy {
                arg_idx: 0,
                descending: true,
                nulls_first: false,
            }],
        );
        let pertrans = pertrans_for(
            collect::ARRAY_AGG,
            &aggref,
            vec![SortKey {
                column: 0,
                descending: true,
                nulls_first: false,
            }],
        );

        let group = Arena::new("group");
        let tmp = Arena::new("tmp");
        let cancel = CancelToken::new();

        let mut buf = SortInput::new(&pertrans);
        for v in [1i64, 3, 2] {
            buf.push(&[Some(Datum::Int64(v))]).unwrap();
        }

        let mut state = initialize_group_state(&pertrans, &group);
        buf.process(&pertrans, &aggref, &mut state, &group, &tmp, &cancel)
            .unwrap();

        assert_eq!(
            Some(Datum::List(vec![
                Some(Datum::Int64(3)),
                Some(Datum::Int64(2)),
                Some(Datum::Int64(1)),
            ])),
            state.value
        );
    }

    #[test]
    fn multi_column_distinct_compares_whole_tuple() {
        let aggref = AggregateRef::simple(
            collect::STRING_AGG,
            vec![Column(0), Column(1)],
        )
        .with_distinct();
        let pertrans = pertrans_for(
            collect::STRING_AGG,
            &aggref,
            vec![SortKey::asc(0), SortKey::asc(1)],
        );

        let group = Arena::new("group");
        let tmp = Arena::new("tmp");
        let cancel = CancelToken::new();

        let delim = Some(Datum::from(","));
        let mut buf = SortInput::new(&pertrans);
        buf.push(&[Some(Datum::from("a")), delim.clone()]).unwrap();
        buf.push(&[Some(Datum::from("a")), delim.clone()]).unwrap();
        buf.push(&[Some(Datum::from("b")), delim.clone()]).unwrap();

        let mut state = initialize_group_state(&pertrans, &group);
        buf.process(&pertrans, &aggref, &mut state, &group, &tmp, &cancel)
            .unwrap();

        assert_eq!(Some(Datum::from("a,b")), state.value);
    }
}
