//! The compiled transition program: one entry point fusing argument
//! evaluation, FILTER, and every per-tuple state update of the active phase.
//!
//! The program is a cache key, not an API surface: it is rebuilt whenever
//! (phase, sort-enabled, hash-enabled, spilling, input source) changes, and
//! callers treat it as opaque.

use groupexec_error::{GroupExecError, Result};
use groupexec_row::datum::Datum;
use groupexec_row::row::Row;
use smallvec::SmallVec;

use super::build::TransitionDescriptor;
use super::hash_table::GroupHashTable;
use super::ordered::SortInput;
use super::trans::{advance_combine, advance_transition, GroupState};
use crate::arena::Arena;
use crate::expr::aggregate_expr::AggregateRef;

/// Where the phase's input rows come from. Spilled tuples carry their own
/// column encoding; a program compiled for one source must be rebuilt when
/// the source changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    Child,
    SpillTape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionProgram {
    /// Feed DISTINCT / ORDER BY argument tuples into sort buffers.
    pub do_sort: bool,
    /// Update hashed-set states for entries the lookup pass resolved.
    pub do_hash: bool,
    /// Lookup misses spill to tape instead of creating groups. The spill
    /// write itself happens in the lookup pass; the program's part is to
    /// accept rows whose hash entry is missing. Outside spill mode a
    /// missing entry is a bug, not a spilled row.
    pub spill_mode: bool,
    /// Combine partial states instead of running transition functions.
    pub combine: bool,
    pub source: InputSource,
}

/// Mutable state the program advances for one input row.
pub struct AdvanceContext<'a> {
    pub row: &'a Row,
    pub pertrans: &'a [TransitionDescriptor],
    pub aggrefs: &'a [AggregateRef],

    /// Number of sorted grouping sets active in the current phase.
    pub numsets: usize,
    /// Sorted-set states, indexed `[setno][transno]`.
    pub pergroups: &'a mut [Vec<GroupState>],
    /// Sorted aggregate input buffers, indexed `[transno][setno]`.
    pub sort_buffers: &'a mut [Vec<Option<SortInput>>],
    pub set_arenas: &'a [Arena],

    /// Hashed-set tables and the entry each one resolved for this row.
    /// `None` means the row missed (it was spilled) or the set is inactive.
    pub hash_tables: &'a mut [GroupHashTable],
    pub hash_pergroup: &'a [Option<usize>],
    pub hash_arena: &'a Arena,

    pub tmp_arena: &'a Arena,
}

impl TransitionProgram {
    /// Advance all transition states for one input row.
    pub fn advance(&self, ctx: &mut AdvanceContext) -> Result<()> {
        for (transno, pertrans) in ctx.pertrans.iter().enumerate() {
            let aggref = &ctx.aggrefs[pertrans.aggref_idx];

            if let Some(filter) = &pertrans.filter {
                if !filter.eval_bool(ctx.row)? {
                    continue;
                }
            }

            let mut args: SmallVec<[Option<Datum>; 4]> =
                SmallVec::with_capacity(pertrans.args.len());
            for arg in &pertrans.args {
                args.push(arg.eval(ctx.row)?);
            }

            if self.combine {
                self.advance_one_combine(ctx, transno, pertrans, aggref, args)?;
                continue;
            }

            if pertrans.has_sort_input() && self.do_sort {
                // Buffer the argument tuple for every active sorted set; the
                // transition function runs at the group boundary.
                for setno in 0..ctx.numsets {
                    let buffer = ctx.sort_buffers[transno][setno]
                        .get_or_insert_with(|| SortInput::new(pertrans));
                    buffer.push(&args)?;
                }
                continue;
            }

            if self.do_sort {
                for setno in 0..ctx.numsets {
                    advance_transition(
                        pertrans,
                        aggref,
                        &mut ctx.pergroups[setno][transno],
                        &args,
                        &ctx.set_arenas[setno],
                        ctx.tmp_arena,
                    )?;
                }
            }

            if self.do_hash {
                for (setno, entry) in ctx.hash_pergroup.iter().enumerate() {
                    match entry {
                        Some(group_idx) => {
                            let state =
                                &mut ctx.hash_tables[setno].group_mut(*group_idx).states[transno];
                            advance_transition(
                                pertrans,
                                aggref,
                                state,
                                &args,
                                ctx.hash_arena,
                                ctx.tmp_arena,
                            )?;
                        }
                        None => self.check_spilled_entry(setno)?,
                    }
                }
            }
        }

        Ok(())
    }

    /// A row without a hash entry was written to a spill partition by the
    /// lookup pass. That only happens under the spilling program; any other
    /// program losing an entry means the lookup pass was skipped.
    fn check_spilled_entry(&self, setno: usize) -> Result<()> {
        if !self.spill_mode {
            return Err(GroupExecError::new(format!(
                "Missing hash entry for grouping set {setno} while not spilling"
            )));
        }
        Ok(())
    }

    fn advance_one_combine(
        &self,
        ctx: &mut AdvanceContext,
        transno: usize,
        pertrans: &TransitionDescriptor,
        aggref: &AggregateRef,
        args: SmallVec<[Option<Datum>; 4]>,
    ) -> Result<()> {
        // Combine mode: the single "argument" is the partial state column.
        let mut partial = args.into_iter().next().flatten();

        if pertrans.deserialize_input {
            if let (Some(deserial), Some(value)) = (&pertrans.deserial_fn, &partial) {
                partial = Some((deserial.func)(value)?);
            }
        }

        if self.do_sort {
            for setno in 0..ctx.numsets {
                advance_combine(
                    pertrans,
                    aggref,
                    &mut ctx.pergroups[setno][transno],
                    partial.clone(),
                    &ctx.set_arenas[setno],
                    ctx.tmp_arena,
                )?;
            }
        }

        if self.do_hash {
            for (setno, entry) in ctx.hash_pergroup.iter().enumerate() {
                match entry {
                    Some(group_idx) => {
                        let state =
                            &mut ctx.hash_tables[setno].group_mut(*group_idx).states[transno];
                        advance_combine(
                            pertrans,
                            aggref,
                            state,
                            partial.clone(),
                            ctx.hash_arena,
                            ctx.tmp_arena,
                        )?;
                    }
                    None => self.check_spilled_entry(setno)?,
                }
            }
        }

        Ok(())
    }
}
