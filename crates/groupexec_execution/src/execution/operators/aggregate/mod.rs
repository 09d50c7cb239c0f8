//! Aggregate executor node.
//!
//! Pulls rows from a child plan node and computes SQL aggregates over them,
//! grouped by any mix of sorted rollups and hashed grouping sets. Hash
//! tables respect a memory budget by partitioning overflow to disk and
//! recursively re-aggregating the spilled partitions.

pub mod build;
pub mod hash_table;
pub mod ordered;
pub mod phase;
pub mod plan;
pub mod program;
pub mod spill;
pub mod trans;

use std::collections::VecDeque;

use groupexec_error::{ErrorKind, GroupExecError, Result};
use groupexec_row::datum::Datum;
use groupexec_row::field::Schema;
use groupexec_row::row::Row;
use groupexec_row::sort::grouping_eq;
use tracing::debug;

use self::build::{build_aggregates, AggregateDescriptor, TransitionDescriptor};
use self::hash_table::{choose_num_buckets, GroupHashTable};
use self::ordered::SortInput;
use self::phase::{build_phases, AggPhase};
use self::plan::{AggSplit, AggStrategy, AggregatePlan, HashedSetPlan, RollupPlan};
use self::program::{AdvanceContext, InputSource, TransitionProgram};
use self::spill::{SpillBatch, SpillPartitions};
use self::trans::{finalize_aggregate, finalize_partial, initialize_group_state, GroupState};
use super::sort::row_sort::RowSorter;
use super::util::hash::hash_group_columns;
use super::{ExecFlags, RowSource};
use crate::arena::Arena;
use crate::config::ExecConfig;
use crate::database::agg_catalog::{AccessPolicy, AggregateCatalog};
use crate::expr::aggregate_expr::AggregateRef;
use crate::expr::PhysicalScalarExpression;
use crate::runtime::CancelToken;

/// Observability snapshot of the hash engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashAggMetrics {
    /// Peak bytes accounted to the hash arena.
    pub mem_peak: usize,
    /// Bytes written to spill tapes, recursive spills included.
    pub disk_used: u64,
    /// Spill batches created.
    pub num_batches: u64,
}

#[derive(Debug)]
pub struct AggregateNode {
    // Immutable for the query.
    aggrefs: Vec<AggregateRef>,
    group_columns: Vec<usize>,
    having: Option<PhysicalScalarExpression>,
    split: AggSplit,
    hashed_sets: Vec<HashedSetPlan>,
    strategy: AggStrategy,
    peraggs: Vec<AggregateDescriptor>,
    pertrans: Vec<TransitionDescriptor>,
    peragg_for_aggref: Vec<usize>,
    needed_columns: Vec<bool>,
    input_schema: Schema,
    output_schema: Schema,
    phases: Vec<AggPhase>,
    config: ExecConfig,
    cancel: CancelToken,
    child: Box<dyn RowSource>,

    // Sorted-phase working state.
    current_phase: usize,
    projected_set: i32,
    input_done: bool,
    agg_done: bool,
    grp_first_row: Option<Row>,
    rep_row: Row,
    /// Sorted-set transition states, `[setno][transno]`.
    pergroups: Vec<Vec<GroupState>>,
    /// Sorted aggregate input buffers, `[transno][setno]`.
    sort_buffers: Vec<Vec<Option<SortInput>>>,
    set_arenas: Vec<Arena>,
    /// Sorted input feeding the current phase, when it isn't the child.
    sort_out: Option<RowSorter>,
    /// Collects the current phase's input for the next phase.
    sort_in: Option<RowSorter>,

    // Hash working state.
    hash_tables: Vec<GroupHashTable>,
    hash_spills: Vec<Option<SpillPartitions>>,
    hash_pergroup: Vec<Option<usize>>,
    hash_batches: VecDeque<SpillBatch>,
    hash_no_new_groups: bool,
    hash_spilled: bool,
    table_filled: bool,
    hash_mem_limit: usize,
    hash_ngroups_limit: u64,
    hash_entry_size: usize,
    hash_ngroups_current: u64,
    hash_drain_set: usize,
    hash_drain_idx: usize,
    metrics: HashAggMetrics,

    tmp_arena: Arena,
    output_arena: Arena,
    hash_arena: Arena,
    ended: bool,
}

impl AggregateNode {
    pub fn init(
        mut plan: AggregatePlan,
        child: Box<dyn RowSource>,
        config: ExecConfig,
        catalog: &AggregateCatalog,
        access: &dyn AccessPolicy,
        flags: ExecFlags,
        cancel: CancelToken,
    ) -> Result<Self> {
        if flags.backward || flags.mark {
            return Err(GroupExecError::with_kind(
                "Aggregate node does not support BACKWARD or MARK",
                ErrorKind::Configuration,
            ));
        }
        // flags.rewind is only a hint; the hashed strategy buffers its
        // results internally anyway, so the hint is cleared (ignored).

        // Normalize ungrouped aggregation to a single empty grouping set.
        if plan.rollups.is_empty() && plan.hashed_sets.is_empty() {
            plan.rollups.push(RollupPlan::plain());
        }

        let input_schema = child.output_schema().clone();
        let built = build_aggregates(&plan, &input_schema, &config, catalog, access)?;
        let strategy = plan.strategy();
        let phases = build_phases(&plan);

        let maxsets = phases[1..].iter().map(|p| p.num_sets()).max().unwrap_or(0);
        let numtrans = built.pertrans.len();

        let hash_arena = Arena::new("agg hash");

        let mut node = AggregateNode {
            aggrefs: plan.aggregates,
            group_columns: plan.group_columns,
            having: plan.having,
            split: plan.split,
            hashed_sets: plan.hashed_sets,
            strategy,
            peraggs: built.peraggs,
            pertrans: built.pertrans,
            peragg_for_aggref: built.peragg_for_aggref,
            needed_columns: built.needed_columns,
            input_schema,
            output_schema: built.output_schema,
            phases,
            config,
            cancel,
            child,

            current_phase: 0,
            projected_set: -1,
            input_done: false,
            agg_done: false,
            grp_first_row: None,
            rep_row: Row::empty(),
            pergroups: vec![vec![GroupState::default(); numtrans]; maxsets],
            sort_buffers: (0..numtrans)
                .map(|_| (0..maxsets).map(|_| None).collect())
                .collect(),
            set_arenas: (0..maxsets).map(|_| Arena::new("agg per-set")).collect(),
            sort_out: None,
            sort_in: None,

            hash_tables: Vec::new(),
            hash_spills: Vec::new(),
            hash_pergroup: Vec::new(),
            hash_batches: VecDeque::new(),
            hash_no_new_groups: false,
            hash_spilled: false,
            table_filled: false,
            hash_mem_limit: built.hash_mem_limit,
            hash_ngroups_limit: built.hash_ngroups_limit,
            hash_entry_size: built.hash_entry_size,
            hash_ngroups_current: 0,
            hash_drain_set: 0,
            hash_drain_idx: 0,
            metrics: HashAggMetrics::default(),

            tmp_arena: Arena::new("agg tmp"),
            output_arena: Arena::new("agg output"),
            hash_arena,
            ended: false,
        };

        node.build_initial_hash_tables();
        if node.strategy == AggStrategy::Hashed {
            node.current_phase = 0;
        } else {
            node.initialize_phase(1)?;
        }

        Ok(node)
    }

    pub fn metrics(&self) -> HashAggMetrics {
        self.metrics
    }

    pub fn next(&mut self) -> Result<Option<Row>> {
        if self.agg_done || self.ended {
            return Ok(None);
        }

        match self.strategy {
            AggStrategy::Hashed => {
                if !self.table_filled {
                    self.fill_hash_tables()?;
                }
                self.retrieve_hash()
            }
            _ => self.retrieve_direct(),
        }
    }

    /// Release every resource the node holds: sorts, tapes, hash state, and
    /// the arenas (whose shutdown callbacks run here).
    pub fn end(&mut self) {
        self.sort_in = None;
        self.sort_out = None;
        self.hash_batches.clear();
        self.hash_spills.clear();
        self.hash_tables.clear();
        for buffers in &mut self.sort_buffers {
            for buf in buffers.iter_mut() {
                *buf = None;
            }
        }
        for arena in &self.set_arenas {
            arena.reset();
        }
        self.tmp_arena.reset();
        self.output_arena.reset();
        self.hash_arena.reset();
        self.agg_done = true;
        self.ended = true;
    }

    pub fn rescan(&mut self) -> Result<()> {
        self.ended = false;

        // A hashed aggregation that never spilled still holds every group in
        // memory; restart iteration without touching the child.
        if self.strategy == AggStrategy::Hashed && self.table_filled && !self.hash_spilled {
            self.hash_drain_set = 0;
            self.hash_drain_idx = 0;
            self.agg_done = false;
            return Ok(());
        }

        self.agg_done = false;
        self.input_done = false;
        self.projected_set = -1;
        self.grp_first_row = None;
        self.rep_row = Row::empty();
        self.sort_in = None;
        self.sort_out = None;
        for buffers in &mut self.sort_buffers {
            for buf in buffers.iter_mut() {
                *buf = None;
            }
        }
        for arena in &self.set_arenas {
            arena.reset();
        }
        self.tmp_arena.reset();
        self.output_arena.reset();
        self.hash_arena.reset();

        self.hash_batches.clear();
        self.hash_no_new_groups = false;
        self.hash_spilled = false;
        self.table_filled = false;
        self.hash_ngroups_current = 0;
        self.hash_drain_set = 0;
        self.hash_drain_idx = 0;
        self.recompile_programs(false, InputSource::Child);
        self.build_initial_hash_tables();

        if self.strategy == AggStrategy::Hashed {
            self.current_phase = 0;
        } else {
            self.initialize_phase(1)?;
        }

        self.child.rescan()
    }

    fn build_initial_hash_tables(&mut self) {
        let mem_limit = self.hash_mem_limit;
        let entry_size = self.hash_entry_size;
        let arena = &self.hash_arena;
        self.hash_tables = self
            .hashed_sets
            .iter()
            .map(|set| {
                GroupHashTable::new(
                    choose_num_buckets(set.num_groups_hint.max(1), mem_limit, entry_size),
                    arena,
                )
            })
            .collect();
        self.hash_spills = self.hashed_sets.iter().map(|_| None).collect();
        self.hash_pergroup = vec![None; self.hashed_sets.len()];
    }

    // ------------------------- phase management -------------------------

    fn initialize_phase(&mut self, newphase: usize) -> Result<()> {
        if newphase == 0 {
            self.current_phase = 0;
            return Ok(());
        }

        // Phases after the first sorted one read the rows collected during
        // the previous phase, re-sorted when the key order differs.
        if newphase > 1 {
            let mut sorter = self.sort_in.take().ok_or_else(|| {
                GroupExecError::new("No materialized input for the next sorted phase")
            })?;
            if self.phases[newphase].sort_keys != self.phases[newphase - 1].sort_keys {
                debug!(phase = newphase, "re-sorting input for next grouping-set phase");
                sorter.sort();
            } else {
                sorter.assume_sorted();
            }
            self.sort_out = Some(sorter);
        }

        // Collect this phase's input for the phase after it.
        self.sort_in = if newphase + 1 < self.phases.len() {
            Some(RowSorter::new(self.phases[newphase + 1].sort_keys.clone()))
        } else {
            None
        };

        self.current_phase = newphase;
        Ok(())
    }

    fn fetch_input_tuple(&mut self) -> Result<Option<Row>> {
        self.cancel.check()?;
        let row = match &mut self.sort_out {
            Some(sorter) => sorter.next()?,
            None => self.child.next()?,
        };
        if let (Some(row_ref), Some(sort_in)) = (&row, &mut self.sort_in) {
            sort_in.push(row_ref.clone())?;
        }
        Ok(row)
    }

    fn initialize_aggregates(&mut self, num_reset: usize) {
        for setno in 0..num_reset {
            for transno in 0..self.pertrans.len() {
                self.pergroups[setno][transno] =
                    initialize_group_state(&self.pertrans[transno], &self.set_arenas[setno]);
                // Sort buffers are created lazily when input arrives.
                self.sort_buffers[transno][setno] = None;
            }
        }
    }

    fn advance_current_phase(&mut self, row: &Row) -> Result<()> {
        let phase = &self.phases[self.current_phase];
        let mut ctx = AdvanceContext {
            row,
            pertrans: &self.pertrans,
            aggrefs: &self.aggrefs,
            numsets: phase.num_sets(),
            pergroups: &mut self.pergroups,
            sort_buffers: &mut self.sort_buffers,
            set_arenas: &self.set_arenas,
            hash_tables: &mut self.hash_tables,
            hash_pergroup: &self.hash_pergroup,
            hash_arena: &self.hash_arena,
            tmp_arena: &self.tmp_arena,
        };
        phase.program.advance(&mut ctx)
    }

    /// Rebuild the transition programs after a mode change. A program is a
    /// small flag set rather than compiled code, so recompilation is a swap;
    /// phases whose program already matches are left untouched.
    fn recompile_programs(&mut self, spill_mode: bool, source: InputSource) {
        for phase in &mut self.phases {
            let next = TransitionProgram {
                spill_mode,
                source,
                ..phase.program
            };
            if next != phase.program {
                phase.program = next;
            }
        }
    }

    // ------------------------- sorted retrieval -------------------------

    fn retrieve_direct(&mut self) -> Result<Option<Row>> {
        if self.current_phase == 0 {
            return self.retrieve_hash();
        }

        loop {
            if self.agg_done {
                return Ok(None);
            }

            let numsets = self.phases[self.current_phase].num_sets();

            // Clear the output scope and the per-set scopes whose groups are
            // complete. Shutdown callbacks registered by aggregates run now.
            self.output_arena.reset();
            let num_reset = if self.projected_set >= 0 && (self.projected_set as usize) < numsets {
                self.projected_set as usize + 1
            } else {
                numsets
            };
            for setno in 0..num_reset {
                self.set_arenas[setno].reset();
            }

            // Input exhausted and all grouping sets of this phase projected:
            // move to the next phase, switch to draining hash tables, or
            // finish.
            if self.input_done && self.projected_set >= numsets as i32 - 1 {
                if self.current_phase < self.phases.len() - 1 {
                    self.initialize_phase(self.current_phase + 1)?;
                    self.input_done = false;
                    self.projected_set = -1;
                    continue;
                } else if self.strategy == AggStrategy::Mixed {
                    // Sorted phases done; the hash tables filled alongside
                    // them are ready to drain.
                    self.initialize_phase(0)?;
                    self.table_filled = true;
                    self.hash_drain_set = 0;
                    self.hash_drain_idx = 0;
                    return self.retrieve_hash();
                } else {
                    self.agg_done = true;
                    return Ok(None);
                }
            }

            // Size of the next grouping set after the last projected one;
            // its prefix decides whether that set's group also ended.
            let next_set_size =
                if self.projected_set >= 0 && (self.projected_set as usize) < numsets - 1 {
                    self.phases[self.current_phase].set_sizes[self.projected_set as usize + 1]
                } else {
                    0
                };

            let crossed_boundary = self.input_done
                || (self.projected_set != -1
                    && (self.projected_set as usize) < numsets - 1
                    && next_set_size > 0
                    && match &self.grp_first_row {
                        Some(pending) => {
                            let cols = &self.phases[self.current_phase].group_columns
                                [..next_set_size];
                            !prefix_eq(&self.rep_row, pending, cols)
                        }
                        None => false,
                    });

            if crossed_boundary {
                self.projected_set += 1;
            } else {
                // The next projection starts over from the most specific set.
                self.projected_set = 0;

                if self.grp_first_row.is_none() {
                    match self.fetch_input_tuple()? {
                        Some(row) => self.grp_first_row = Some(row),
                        None => {
                            // No input at all for this phase. Only grouping
                            // sets of size zero still project a row.
                            self.input_done = true;
                            let set_sizes = &self.phases[self.current_phase].set_sizes;
                            let mut setno = 0usize;
                            while setno < numsets && set_sizes[setno] > 0 {
                                setno += 1;
                            }
                            self.projected_set = setno as i32;
                            if setno >= numsets {
                                continue;
                            }
                        }
                    }
                }

                self.initialize_aggregates(num_reset);

                if self.grp_first_row.is_some() {
                    self.run_group()?;
                } else {
                    // Empty input: project against an all-null representative.
                    self.rep_row = Row::nulls(self.input_schema.num_columns());
                }
            }

            let current_set = self.projected_set as usize;
            if current_set < numsets {
                if let Some(row) = self.project_sorted_set(current_set)? {
                    return Ok(Some(row));
                }
            }
            // Group filtered out by HAVING (or nothing to project); there
            // may be more groups.
        }
    }

    /// Consume one group's worth of input rows, advancing all active states.
    /// On return either `grp_first_row` holds the next group's first tuple
    /// or the input is exhausted.
    fn run_group(&mut self) -> Result<()> {
        let first = match self.grp_first_row.take() {
            Some(row) => row,
            None => return Ok(()),
        };
        self.rep_row = first;

        let mut current = self.rep_row.clone();
        loop {
            self.cancel.check()?;

            // During the first sorted phase of a mixed aggregation, the
            // hash tables are updated in the same pass.
            if self.strategy == AggStrategy::Mixed && self.current_phase == 1 {
                self.lookup_hash_entries(&current)?;
            }

            self.advance_current_phase(&current)?;
            self.tmp_arena.reset_memory();

            match self.fetch_input_tuple()? {
                None => {
                    if self.strategy == AggStrategy::Mixed && self.current_phase == 1 {
                        self.hash_finish_initial_spills()?;
                    }
                    self.input_done = true;
                    return Ok(());
                }
                Some(next_row) => {
                    let cols = &self.phases[self.current_phase].group_columns;
                    if !cols.is_empty() && !prefix_eq(&self.rep_row, &next_row, cols) {
                        self.grp_first_row = Some(next_row);
                        return Ok(());
                    }
                    current = next_row;
                }
            }
        }
    }

    /// Finalize the states of one sorted grouping set and project its output
    /// row, applying HAVING.
    fn project_sorted_set(&mut self, setno: usize) -> Result<Option<Row>> {
        // Ordered aggregate input runs its buffered sort now, feeding the
        // transition function before finalization.
        for transno in 0..self.pertrans.len() {
            if let Some(buffer) = self.sort_buffers[transno][setno].take() {
                let pertrans = &self.pertrans[transno];
                let aggref = &self.aggrefs[pertrans.aggref_idx];
                buffer.process(
                    pertrans,
                    aggref,
                    &mut self.pergroups[setno][transno],
                    &self.set_arenas[setno],
                    &self.tmp_arena,
                    &self.cancel,
                )?;
            }
        }

        let mut results = Vec::with_capacity(self.peraggs.len());
        for peragg in &self.peraggs {
            let pertrans = &self.pertrans[peragg.transno];
            let aggref = &self.aggrefs[peragg.aggref_idx];
            let state = &self.pergroups[setno][peragg.transno];
            let value = if self.split.serialize_output {
                finalize_partial(pertrans, state, &self.output_arena)?
            } else {
                finalize_aggregate(
                    peragg,
                    pertrans,
                    aggref,
                    state,
                    &self.rep_row,
                    &self.output_arena,
                    &self.tmp_arena,
                )?
            };
            results.push(value);
        }

        let set_cols = self.phases[self.current_phase].columns_for_set(setno);
        let out = self.build_output_row(set_cols, &self.rep_row, &results);
        self.apply_having(out)
    }

    /// Output row: the full grouping-column list (nulled where a column is
    /// not part of the emitting set) followed by one value per aggregate
    /// reference.
    fn build_output_row(
        &self,
        set_cols: &[usize],
        rep: &Row,
        results: &[Option<Datum>],
    ) -> Row {
        let mut columns =
            Vec::with_capacity(self.group_columns.len() + self.peragg_for_aggref.len());
        for &col in &self.group_columns {
            if set_cols.contains(&col) {
                columns.push(rep.columns[col].clone());
            } else {
                columns.push(None);
            }
        }
        for &aggno in &self.peragg_for_aggref {
            columns.push(results[aggno].clone());
        }
        Row { columns }
    }

    fn apply_having(&self, row: Row) -> Result<Option<Row>> {
        if let Some(having) = &self.having {
            if !having.eval_bool(&row)? {
                return Ok(None);
            }
        }
        Ok(Some(row))
    }

    // ------------------------- hashed retrieval -------------------------

    /// Find or create hash entries for this row in every hashed grouping
    /// set. Entries that can't be created (memory limit reached) leave a
    /// `None` and the row is written to that set's spill partition instead.
    fn lookup_hash_entries(&mut self, row: &Row) -> Result<()> {
        for setno in 0..self.hashed_sets.len() {
            let key: Row = self.hashed_sets[setno]
                .group_columns
                .iter()
                .map(|&c| row.columns[c].clone())
                .collect();
            let hash = hash_group_columns(key.columns.iter());

            match self.lookup_one_hash_entry(setno, &key, hash)? {
                Some(group_idx) => self.hash_pergroup[setno] = Some(group_idx),
                None => {
                    // Miss under the memory limit: route the whole input row
                    // to this set's spill, narrowed to the needed columns.
                    if self.hash_spills[setno].is_none() {
                        let hint = match self.hashed_sets[setno].num_groups_hint {
                            0 => self.hash_ngroups_current.max(1),
                            hint => hint,
                        };
                        self.hash_spills[setno] = Some(SpillPartitions::init(
                            None,
                            0,
                            hint,
                            self.hash_entry_size,
                            self.config.work_mem,
                        )?);
                    }
                    let Some(partitions) = self.hash_spills[setno].as_mut() else {
                        return Err(GroupExecError::new("Spill partitions missing after init"));
                    };
                    let written =
                        partitions.write_tuple(0, row, hash, Some(&self.needed_columns))?;
                    self.metrics.disk_used += written as u64;
                    self.hash_pergroup[setno] = None;
                }
            }
        }
        Ok(())
    }

    /// Find or create one set's entry, updating the memory accounting and
    /// entering spill mode at the limit. `None` means the caller must spill.
    fn lookup_one_hash_entry(
        &mut self,
        setno: usize,
        key: &Row,
        hash: u32,
    ) -> Result<Option<usize>> {
        let allow_new = !self.hash_no_new_groups;
        let pertrans = &self.pertrans;
        let arena = &self.hash_arena;

        let outcome = self.hash_tables[setno].find_or_create(
            key,
            hash,
            allow_new,
            || {
                pertrans
                    .iter()
                    .map(|pt| initialize_group_state(pt, arena))
                    .collect()
            },
            arena,
        )?;

        let Some(res) = outcome else {
            return Ok(None);
        };

        if res.is_new {
            self.hash_ngroups_current += 1;

            // Memory is polled from the arena, not tracked by hand, so
            // transition functions that grow state are accounted for.
            let mem_current = self.hash_arena.allocated();
            if mem_current > self.metrics.mem_peak {
                self.metrics.mem_peak = mem_current;
            }

            // For small budgets even an empty table may exceed the limit;
            // never spill before holding at least one group.
            if self.hash_ngroups_current > 0
                && (mem_current > self.hash_mem_limit
                    || self.hash_ngroups_current > self.hash_ngroups_limit)
            {
                self.hash_no_new_groups = true;
                if !self.hash_spilled {
                    self.hash_spilled = true;
                    let source = self.phases[0].program.source;
                    self.recompile_programs(true, source);
                    debug!(
                        ngroups = self.hash_ngroups_current,
                        mem_current, "hash aggregation entering spill mode"
                    );
                }
            }
        }

        Ok(Some(res.group_idx))
    }

    /// Hashed strategy: read the entire child into the hash tables (and
    /// spill partitions), then switch to draining.
    fn fill_hash_tables(&mut self) -> Result<()> {
        loop {
            self.cancel.check()?;
            let Some(row) = self.child.next()? else { break };

            self.lookup_hash_entries(&row)?;
            self.advance_current_phase(&row)?;
            self.tmp_arena.reset_memory();
        }

        self.hash_finish_initial_spills()?;
        self.table_filled = true;
        self.hash_drain_set = 0;
        self.hash_drain_idx = 0;
        Ok(())
    }

    /// Wrap every non-empty first-level spill partition into batches on the
    /// shared FIFO worklist.
    fn hash_finish_initial_spills(&mut self) -> Result<()> {
        for setno in 0..self.hash_spills.len() {
            if let Some(partitions) = self.hash_spills[setno].take() {
                let batches = partitions.finish(setno, 0)?;
                self.metrics.num_batches += batches.len() as u64;
                self.hash_batches.extend(batches);
            }
        }
        Ok(())
    }

    fn retrieve_hash(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.retrieve_hash_in_memory()? {
                return Ok(Some(row));
            }
            if !self.refill_hash_table()? {
                self.agg_done = true;
                return Ok(None);
            }
        }
    }

    /// Walk the in-memory tables across all hashed grouping sets.
    fn retrieve_hash_in_memory(&mut self) -> Result<Option<Row>> {
        loop {
            self.cancel.check()?;

            if self.hash_drain_set >= self.hash_tables.len() {
                return Ok(None);
            }
            if self.hash_drain_idx >= self.hash_tables[self.hash_drain_set].num_groups() {
                self.hash_drain_set += 1;
                self.hash_drain_idx = 0;
                continue;
            }

            let setno = self.hash_drain_set;
            let group_idx = self.hash_drain_idx;
            self.hash_drain_idx += 1;

            // Per-output-tuple scope; shutdown callbacks stay armed since
            // other groups of the same aggregation are still live.
            self.output_arena.reset_memory();

            // Rebuild a full-width representative from the entry's key.
            let set_cols = self.hashed_sets[setno].group_columns.clone();
            let mut rep = Row::nulls(self.input_schema.num_columns());
            {
                let entry = self.hash_tables[setno].group(group_idx);
                for (i, &col) in set_cols.iter().enumerate() {
                    rep.columns[col] = entry.key.columns[i].clone();
                }
            }

            let mut results = Vec::with_capacity(self.peraggs.len());
            for peragg in &self.peraggs {
                let pertrans = &self.pertrans[peragg.transno];
                let aggref = &self.aggrefs[peragg.aggref_idx];
                let entry = self.hash_tables[setno].group(group_idx);
                let state = &entry.states[peragg.transno];
                let value = if self.split.serialize_output {
                    finalize_partial(pertrans, state, &self.output_arena)?
                } else {
                    finalize_aggregate(
                        peragg,
                        pertrans,
                        aggref,
                        state,
                        &rep,
                        &self.output_arena,
                        &self.tmp_arena,
                    )?
                };
                results.push(value);
            }

            let out = self.build_output_row(&set_cols, &rep, &results);
            if let Some(row) = self.apply_having(out)? {
                return Ok(Some(row));
            }
        }
    }

    /// Reload one spill batch into a rebuilt hash table. Returns false when
    /// the worklist is empty and hashed output is exhausted.
    fn refill_hash_table(&mut self) -> Result<bool> {
        let Some(mut batch) = self.hash_batches.pop_front() else {
            return Ok(false);
        };

        debug!(
            setno = batch.setno,
            input_tuples = batch.input_tuples,
            input_bits = batch.input_bits,
            "refilling hash table from spill batch"
        );

        // Each batch holds data for a single grouping set; the others see no
        // rows while it reloads.
        for entry in self.hash_pergroup.iter_mut() {
            *entry = None;
        }

        // Release all hash-table memory and rebuild one table sized by the
        // batch's tuple count. That is an overestimate of the group count,
        // deliberately: common values have mostly been finalized already,
        // and oversizing beats re-spilling.
        self.hash_arena.reset();
        let nbuckets =
            choose_num_buckets(batch.input_tuples, self.hash_mem_limit, self.hash_entry_size);
        for (setno, table) in self.hash_tables.iter_mut().enumerate() {
            let size = if setno == batch.setno { nbuckets } else { 2 };
            *table = GroupHashTable::new(size, &self.hash_arena);
        }
        self.hash_no_new_groups = false;
        self.hash_ngroups_current = 0;

        // Spilled tuples carry the spill row format rather than the child's
        // slot layout; the transition program is recompiled for it.
        if self.phases[0].program.source != InputSource::SpillTape {
            self.recompile_programs(self.hash_spilled, InputSource::SpillTape);
        }

        let mut batch_spill: Option<SpillPartitions> = None;

        loop {
            self.cancel.check()?;
            let Some((hash, row)) = batch.read_next()? else {
                break;
            };

            let key: Row = self.hashed_sets[batch.setno]
                .group_columns
                .iter()
                .map(|&c| row.columns[c].clone())
                .collect();

            match self.lookup_one_hash_entry(batch.setno, &key, hash)? {
                Some(group_idx) => self.hash_pergroup[batch.setno] = Some(group_idx),
                None => {
                    // No memory for another group: spill again, consuming
                    // the next window of hash bits. The same tape set is
                    // reused, which allocates no extra space while
                    // re-spilling.
                    if batch_spill.is_none() {
                        batch_spill = Some(SpillPartitions::init(
                            Some(batch.tape_set.clone()),
                            batch.input_bits,
                            batch.input_tuples,
                            self.hash_entry_size,
                            self.config.work_mem,
                        )?);
                    }
                    let Some(partitions) = batch_spill.as_mut() else {
                        return Err(GroupExecError::new("Spill partitions missing after init"));
                    };
                    let written = partitions.write_tuple(
                        batch.input_bits,
                        &row,
                        hash,
                        Some(&self.needed_columns),
                    )?;
                    self.metrics.disk_used += written as u64;
                    self.hash_pergroup[batch.setno] = None;
                }
            }

            self.advance_current_phase(&row)?;
            self.tmp_arena.reset_memory();
        }

        // Refresh the rolling per-entry size estimate from what this batch
        // actually built.
        if self.hash_ngroups_current > 0 {
            self.hash_entry_size =
                (self.hash_arena.allocated() / self.hash_ngroups_current as usize).max(1);
        }

        if let Some(partitions) = batch_spill {
            let batches = partitions.finish(batch.setno, batch.input_bits)?;
            self.metrics.num_batches += batches.len() as u64;
            self.hash_batches.extend(batches);
        }
        batch.close()?;

        self.hash_drain_set = 0;
        self.hash_drain_idx = 0;
        Ok(true)
    }
}

impl RowSource for AggregateNode {
    fn next(&mut self) -> Result<Option<Row>> {
        AggregateNode::next(self)
    }

    fn rescan(&mut self) -> Result<()> {
        AggregateNode::rescan(self)
    }

    fn output_schema(&self) -> &Schema {
        &self.output_schema
    }
}

impl Drop for AggregateNode {
    fn drop(&mut self) {
        if !self.ended {
            self.end();
        }
    }
}

/// Grouping equality of two rows on a list of columns.
fn prefix_eq(a: &Row, b: &Row, cols: &[usize]) -> bool {
    cols.iter()
        .all(|&col| grouping_eq(&a.columns[col], &b.columns[col]))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use groupexec_row::datatype::DataType;
    use groupexec_row::field::{Field, Schema};

    use super::plan::{AggSplit, HashedSetPlan, RollupPlan};
    use super::*;
    use crate::database::agg_catalog::{permission_denied, AllowAll};
    use crate::execution::operators::test_util::{int64_schema, int_row, int_source, opt_int_row};
    use crate::execution::operators::values::ValuesSource;
    use crate::expr::aggregate_expr::{AggOrderBy, AggregateId};
    use crate::expr::PhysicalScalarExpression::{Column, Literal};
    use crate::functions::aggregate::{
        avg, boolean, collect, count, minmax, sum, AggFnContext, AggregateMeta, FinalModify,
        TransFn,
    };

    fn make_node(plan: AggregatePlan, source: ValuesSource, config: ExecConfig) -> AggregateNode {
        AggregateNode::init(
            plan,
            Box::new(source),
            config,
            AggregateCatalog::builtin(),
            &AllowAll,
            ExecFlags::default(),
            CancelToken::new(),
        )
        .unwrap()
    }

    fn drain(node: &mut AggregateNode) -> Vec<Row> {
        let mut rows = Vec::new();
        while let Some(row) = node.next().unwrap() {
            rows.push(row);
        }
        rows
    }

    fn run(plan: AggregatePlan, source: ValuesSource, config: ExecConfig) -> Vec<Row> {
        let mut node = make_node(plan, source, config);
        drain(&mut node)
    }

    /// Order-insensitive row comparison for hashed output.
    fn assert_same_multiset(mut a: Vec<Row>, mut b: Vec<Row>) {
        let key = |r: &Row| format!("{:?}", r);
        a.sort_by_key(key);
        b.sort_by_key(key);
        similar_asserts::assert_eq!(a, b);
    }

    #[test]
    fn plain_count_distinct_sum() {
        // x in {1,1,2,3,3,3}: count(*), count(distinct x), sum(x)
        let source = int_source(1, &[&[1], &[1], &[2], &[3], &[3], &[3]]);
        let plan = AggregatePlan::plain(vec![
            AggregateRef::star_call(count::COUNT_STAR),
            AggregateRef::simple(count::COUNT_ANY, vec![Column(0)]).with_distinct(),
            AggregateRef::simple(sum::SUM_INT64, vec![Column(0)]),
        ]);

        let rows = run(plan, source, ExecConfig::default());
        assert_eq!(vec![int_row(&[6, 3, 13])], rows);
    }

    #[test]
    fn plain_aggregation_of_empty_input_emits_one_row() {
        let source = int_source(1, &[]);
        let plan = AggregatePlan::plain(vec![
            AggregateRef::star_call(count::COUNT_STAR),
            AggregateRef::simple(sum::SUM_INT64, vec![Column(0)]),
        ]);

        let rows = run(plan, source, ExecConfig::default());
        assert_eq!(1, rows.len());
        assert_eq!(
            Row::from_iter([Some(Datum::Int64(0)), None]),
            rows[0]
        );
    }

    #[test]
    fn sorted_group_by_emits_groups_in_input_order() {
        let source = int_source(2, &[&[1, 10], &[1, 20], &[2, 5], &[3, 1], &[3, 2]]);
        let plan = AggregatePlan::sorted(
            vec![0],
            vec![
                AggregateRef::simple(sum::SUM_INT64, vec![Column(1)]),
                AggregateRef::star_call(count::COUNT_STAR),
            ],
        );

        let rows = run(plan, source, ExecConfig::default());
        assert_eq!(
            vec![
                int_row(&[1, 30, 2]),
                int_row(&[2, 5, 1]),
                int_row(&[3, 3, 2]),
            ],
            rows
        );
    }

    #[test]
    fn sorted_group_by_of_empty_input_emits_no_rows() {
        let source = int_source(2, &[]);
        let plan = AggregatePlan::sorted(
            vec![0],
            vec![AggregateRef::star_call(count::COUNT_STAR)],
        );
        assert!(run(plan, source, ExecConfig::default()).is_empty());
    }

    #[test]
    fn null_group_keys_form_their_own_group() {
        let source = ValuesSource::new(
            int64_schema(2),
            vec![
                opt_int_row(&[None, Some(1)]),
                opt_int_row(&[Some(1), Some(2)]),
                opt_int_row(&[None, Some(3)]),
            ],
        );
        let plan = AggregatePlan::hashed(
            vec![0],
            vec![AggregateRef::simple(sum::SUM_INT64, vec![Column(1)])],
        );

        let rows = run(plan, source, ExecConfig::default());
        assert_same_multiset(
            rows,
            vec![opt_int_row(&[None, Some(4)]), opt_int_row(&[Some(1), Some(2)])],
        );
    }

    #[test]
    fn hashed_group_by_spills_under_tiny_work_mem() {
        // (a,1),(a,2),(b,3) with room for roughly one entry: all but one
        // group spill, and the final multiset is unaffected.
        let schema = Schema::new([
            Field::new("k", DataType::Utf8),
            Field::new("v", DataType::Int64),
        ]);
        let rows = vec![
            Row::from_iter([Datum::from("a"), Datum::Int64(1)]),
            Row::from_iter([Datum::from("a"), Datum::Int64(2)]),
            Row::from_iter([Datum::from("b"), Datum::Int64(3)]),
        ];
        let source = ValuesSource::new(schema, rows);
        let plan = AggregatePlan::hashed(
            vec![0],
            vec![AggregateRef::simple(sum::SUM_INT64, vec![Column(1)])],
        );

        let mut node = make_node(plan, source, ExecConfig::with_work_mem(64));
        let out = drain(&mut node);

        assert_same_multiset(
            out,
            vec![
                Row::from_iter([Datum::from("a"), Datum::Int64(3)]),
                Row::from_iter([Datum::from("b"), Datum::Int64(3)]),
            ],
        );
        let metrics = node.metrics();
        assert!(metrics.disk_used > 0);
        assert!(metrics.num_batches > 0);
    }

    #[test]
    fn spill_transparency_across_memory_budgets() {
        // The result multiset is independent of work_mem and of the induced
        // spill depth.
        let data: Vec<[i64; 2]> = (0..200).map(|i| [i % 50, i]).collect();
        let rows: Vec<&[i64]> = data.iter().map(|r| r.as_slice()).collect();
        let plan = || {
            AggregatePlan::hashed(
                vec![0],
                vec![
                    AggregateRef::simple(sum::SUM_INT64, vec![Column(1)]),
                    AggregateRef::star_call(count::COUNT_STAR),
                ],
            )
        };

        let reference = run(
            plan(),
            int_source(2, &rows),
            ExecConfig {
                work_mem: usize::MAX / 2,
                hashagg_mem_overflow: true,
            },
        );
        assert_eq!(50, reference.len());

        for work_mem in [64, 256, 4096, 64 * 1024] {
            let out = run(plan(), int_source(2, &rows), ExecConfig::with_work_mem(work_mem));
            assert_same_multiset(reference.clone(), out);
        }
    }

    #[test]
    fn recursive_spill_narrows_partitions_until_done() {
        // With room for one group at a time, every batch re-spills its
        // misses using the next window of hash bits; recursion still
        // terminates and loses nothing.
        let data: Vec<[i64; 2]> = (0..100).map(|i| [i, i * 10]).collect();
        let rows: Vec<&[i64]> = data.iter().map(|r| r.as_slice()).collect();

        let plan = AggregatePlan::hashed(
            vec![0],
            vec![AggregateRef::simple(sum::SUM_INT64, vec![Column(1)])],
        );
        let mut node = make_node(plan, int_source(2, &rows), ExecConfig::with_work_mem(64));
        let out = drain(&mut node);

        assert_eq!(100, out.len());
        let expected: Vec<Row> = (0..100).map(|i| int_row(&[i, i * 10])).collect();
        assert_same_multiset(expected, out);
        assert!(node.metrics().num_batches > 4);
    }

    #[test]
    fn grouping_sets_rollup_projects_every_set() {
        // GROUPING SETS ((a,b),(a),()) over (1,1),(1,2),(2,1) with count(*).
        let source = int_source(2, &[&[1, 1], &[1, 2], &[2, 1]]);
        let plan = AggregatePlan {
            group_columns: vec![0, 1],
            rollups: vec![RollupPlan::rollup(vec![0, 1])],
            hashed_sets: Vec::new(),
            aggregates: vec![AggregateRef::star_call(count::COUNT_STAR)],
            having: None,
            split: AggSplit::simple(),
        };

        let rows = run(plan, source, ExecConfig::default());
        assert_eq!(
            vec![
                opt_int_row(&[Some(1), Some(1), Some(1)]),
                opt_int_row(&[Some(1), Some(2), Some(1)]),
                opt_int_row(&[Some(1), None, Some(2)]),
                opt_int_row(&[Some(2), Some(1), Some(1)]),
                opt_int_row(&[Some(2), None, Some(1)]),
                opt_int_row(&[None, None, Some(3)]),
            ],
            rows
        );
    }

    #[test]
    fn grouping_sets_empty_input_projects_only_empty_sets() {
        let source = int_source(2, &[]);
        let plan = AggregatePlan {
            group_columns: vec![0, 1],
            rollups: vec![RollupPlan::rollup(vec![0, 1])],
            hashed_sets: Vec::new(),
            aggregates: vec![AggregateRef::star_call(count::COUNT_STAR)],
            having: None,
            split: AggSplit::simple(),
        };

        let rows = run(plan, source, ExecConfig::default());
        assert_eq!(vec![opt_int_row(&[None, None, Some(0)])], rows);
    }

    #[test]
    fn multiple_rollups_resort_between_phases() {
        // Two rollups with different key orders: (a) then (b). Input sorted
        // by a; the second phase re-sorts internally.
        let source = int_source(2, &[&[1, 2], &[1, 1], &[2, 1], &[2, 2]]);
        let plan = AggregatePlan {
            group_columns: vec![0, 1],
            rollups: vec![RollupPlan::simple(vec![0]), RollupPlan::simple(vec![1])],
            hashed_sets: Vec::new(),
            aggregates: vec![AggregateRef::star_call(count::COUNT_STAR)],
            having: None,
            split: AggSplit::simple(),
        };

        let rows = run(plan, source, ExecConfig::default());
        assert_eq!(
            vec![
                opt_int_row(&[Some(1), None, Some(2)]),
                opt_int_row(&[Some(2), None, Some(2)]),
                opt_int_row(&[None, Some(1), Some(2)]),
                opt_int_row(&[None, Some(2), Some(2)]),
            ],
            rows
        );
    }

    #[test]
    fn mixed_strategy_runs_sorted_phases_then_drains_hash() {
        // Sorted rollup over a plus a hashed set over b: one pass over the
        // input feeds both.
        let source = int_source(2, &[&[1, 7], &[1, 8], &[2, 7]]);
        let plan = AggregatePlan {
            group_columns: vec![0, 1],
            rollups: vec![RollupPlan::rollup(vec![0])],
            hashed_sets: vec![HashedSetPlan::new(vec![1])],
            aggregates: vec![AggregateRef::star_call(count::COUNT_STAR)],
            having: None,
            split: AggSplit::simple(),
        };
        assert_eq!(AggStrategy::Mixed, plan.strategy());

        let rows = run(plan, source, ExecConfig::default());

        // Sorted output first, in input order.
        assert_eq!(
            vec![
                opt_int_row(&[Some(1), None, Some(2)]),
                opt_int_row(&[Some(2), None, Some(1)]),
                opt_int_row(&[None, None, Some(3)]),
            ],
            rows[..3].to_vec()
        );
        // Hashed output afterwards, order implementation-defined.
        assert_same_multiset(
            rows[3..].to_vec(),
            vec![
                opt_int_row(&[None, Some(7), Some(2)]),
                opt_int_row(&[None, Some(8), Some(1)]),
            ],
        );
    }

    #[test]
    fn hash_and_sort_strategies_agree() {
        let data: Vec<[i64; 2]> = (0..60).map(|i| [i % 7, i]).collect();
        let rows: Vec<&[i64]> = data.iter().map(|r| r.as_slice()).collect();
        let aggs = || {
            vec![
                AggregateRef::simple(sum::SUM_INT64, vec![Column(1)]),
                AggregateRef::simple(minmax::MIN, vec![Column(1)]),
                AggregateRef::simple(minmax::MAX, vec![Column(1)]),
                AggregateRef::star_call(count::COUNT_STAR),
            ]
        };

        // Sorted path needs sorted input.
        let mut sorted_data = data.clone();
        sorted_data.sort();
        let sorted_rows: Vec<&[i64]> = sorted_data.iter().map(|r| r.as_slice()).collect();

        let sorted_out = run(
            AggregatePlan::sorted(vec![0], aggs()),
            int_source(2, &sorted_rows),
            ExecConfig::default(),
        );
        let hashed_out = run(
            AggregatePlan::hashed(vec![0], aggs()),
            int_source(2, &rows),
            ExecConfig::default(),
        );

        assert_same_multiset(sorted_out, hashed_out);
    }

    #[test]
    fn distinct_matches_manual_dedup() {
        let values = [5i64, 3, 5, 1, 3, 3, 9, 1];
        let rows: Vec<Vec<i64>> = values.iter().map(|&v| vec![v]).collect();
        let row_refs: Vec<&[i64]> = rows.iter().map(|r| r.as_slice()).collect();

        let distinct_out = run(
            AggregatePlan::plain(vec![
                AggregateRef::simple(sum::SUM_INT64, vec![Column(0)]).with_distinct(),
            ]),
            int_source(1, &row_refs),
            ExecConfig::default(),
        );

        let mut dedup: Vec<i64> = values.to_vec();
        dedup.sort_unstable();
        dedup.dedup();
        let dedup_rows: Vec<Vec<i64>> = dedup.iter().map(|&v| vec![v]).collect();
        let dedup_refs: Vec<&[i64]> = dedup_rows.iter().map(|r| r.as_slice()).collect();
        let plain_out = run(
            AggregatePlan::plain(vec![AggregateRef::simple(
                sum::SUM_INT64,
                vec![Column(0)],
            )]),
            int_source(1, &dedup_refs),
            ExecConfig::default(),
        );

        assert_eq!(plain_out, distinct_out);
    }

    #[test]
    fn ordered_array_agg_respects_order_by() {
        let source = int_source(2, &[&[1, 3], &[1, 1], &[1, 2]]);
        let plan = AggregatePlan::sorted(
            vec![0],
            vec![AggregateRef::simple(collect::ARRAY_AGG, vec![Column(1)])
                .with_order_by(vec![AggOrderBy::asc(0)])],
        );

        let rows = run(plan, source, ExecConfig::default());
        assert_eq!(1, rows.len());
        assert_eq!(
            Some(Datum::List(vec![
                Some(Datum::Int64(1)),
                Some(Datum::Int64(2)),
                Some(Datum::Int64(3)),
            ])),
            rows[0].columns[1]
        );
    }

    #[test]
    fn filter_clause_gates_transition_input() {
        // count(*) FILTER (WHERE v > threshold) approximated with a literal
        // false filter next to an unfiltered count.
        let source = int_source(1, &[&[1], &[2], &[3]]);
        let plan = AggregatePlan::plain(vec![
            AggregateRef::star_call(count::COUNT_STAR),
            AggregateRef::star_call(count::COUNT_STAR)
                .with_filter(Literal(Some(Datum::Boolean(false)))),
        ]);

        let rows = run(plan, source, ExecConfig::default());
        assert_eq!(vec![int_row(&[3, 0])], rows);
    }

    #[test]
    fn having_filters_output_groups() {
        // HAVING references the output row; here it keeps groups whose
        // bool_or column came out true.
        let schema = Schema::new([
            Field::new("k", DataType::Int64),
            Field::new("flag", DataType::Boolean),
        ]);
        let rows = vec![
            Row::from_iter([Datum::Int64(1), Datum::Boolean(false)]),
            Row::from_iter([Datum::Int64(1), Datum::Boolean(false)]),
            Row::from_iter([Datum::Int64(2), Datum::Boolean(true)]),
        ];

        // Output: [k, count, bool_or]; keep rows where column 2 is true.
        let plan = AggregatePlan::sorted(
            vec![0],
            vec![
                AggregateRef::star_call(count::COUNT_STAR),
                AggregateRef::simple(boolean::BOOL_OR, vec![Column(1)]),
            ],
        )
        .with_having(Column(2));

        let out = run(plan, ValuesSource::new(schema, rows), ExecConfig::default());

        assert_eq!(1, out.len());
        assert_eq!(Some(Datum::Int64(2)), out[0].columns[0]);
    }

    #[test]
    fn two_phase_partial_aggregation_matches_single_pass() {
        let data: Vec<[i64; 2]> = (0..40).map(|i| [i % 4, i]).collect();
        let rows: Vec<&[i64]> = data.iter().map(|r| r.as_slice()).collect();

        let aggs = vec![
            AggregateRef::simple(sum::SUM_INT64, vec![Column(1)]),
            AggregateRef::simple(avg::AVG_INT64, vec![Column(1)]),
            AggregateRef::star_call(count::COUNT_STAR),
        ];

        let single = run(
            AggregatePlan::hashed(vec![0], aggs.clone()),
            int_source(2, &rows),
            ExecConfig::default(),
        );

        // Stage one: aggregate and serialize partial states.
        let partial_plan = AggregatePlan::hashed(vec![0], aggs)
            .with_split(AggSplit::initial_serial());
        let partial_node = make_node(partial_plan, int_source(2, &rows), ExecConfig::default());

        // Stage two: combine the partial states. Input columns: [k, sum
        // state, avg state, count state].
        let combine_plan = AggregatePlan::hashed(
            vec![0],
            vec![
                AggregateRef::simple(sum::SUM_INT64, vec![Column(1)]),
                AggregateRef::simple(avg::AVG_INT64, vec![Column(2)]),
                AggregateRef::simple(count::COUNT_STAR, vec![Column(3)]),
            ],
        )
        .with_split(AggSplit::final_deserial());

        let mut combine_node = AggregateNode::init(
            combine_plan,
            Box::new(partial_node),
            ExecConfig::default(),
            AggregateCatalog::builtin(),
            &AllowAll,
            ExecFlags::default(),
            CancelToken::new(),
        )
        .unwrap();
        let combined = drain(&mut combine_node);

        assert_same_multiset(single, combined);
    }

    #[test]
    fn strict_transfn_with_all_null_input_never_runs() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        fn counting_add(
            _ctx: &mut AggFnContext,
            state: Option<Datum>,
            args: &[Option<Datum>],
        ) -> groupexec_error::Result<Option<Datum>> {
            CALLS.fetch_add(1, Ordering::Relaxed);
            let s = state.and_then(|d| d.try_as_i64().ok()).unwrap_or(0);
            let a = args[0].as_ref().and_then(|d| d.try_as_i64().ok()).unwrap_or(0);
            Ok(Some(Datum::Int64(s + a)))
        }

        let counting_id = AggregateId(9001);
        let catalog = AggregateCatalog::builtin_with([AggregateMeta {
            id: counting_id,
            name: "counting_sum",
            arg_types: vec![DataType::Int64],
            result_type: DataType::Int64,
            trans_type: DataType::Int64,
            internal_state: false,
            init_value: None,
            trans_fn: TransFn {
                name: "counting_add",
                strict: true,
                func: counting_add,
            },
            final_fn: None,
            num_final_extra_args: 0,
            combine_fn: None,
            serial_fn: None,
            deserial_fn: None,
            final_modify: FinalModify::ReadOnly,
            trans_space: 0,
        }]);

        let source = ValuesSource::new(
            int64_schema(1),
            vec![opt_int_row(&[None]), opt_int_row(&[None]), opt_int_row(&[None])],
        );
        let mut node = AggregateNode::init(
            AggregatePlan::plain(vec![AggregateRef::simple(counting_id, vec![Column(0)])]),
            Box::new(source),
            ExecConfig::default(),
            &catalog,
            &AllowAll,
            ExecFlags::default(),
            CancelToken::new(),
        )
        .unwrap();

        let rows = drain(&mut node);
        assert_eq!(vec![Row::nulls(1)], rows);
        assert_eq!(0, CALLS.load(Ordering::Relaxed));
    }

    #[test]
    fn duplicate_aggregates_invoke_the_transfn_once_per_row() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        fn counting_add(
            _ctx: &mut AggFnContext,
            state: Option<Datum>,
            args: &[Option<Datum>],
        ) -> groupexec_error::Result<Option<Datum>> {
            CALLS.fetch_add(1, Ordering::Relaxed);
            let s = state.and_then(|d| d.try_as_i64().ok()).unwrap_or(0);
            let a = args[0].as_ref().and_then(|d| d.try_as_i64().ok()).unwrap_or(0);
            Ok(Some(Datum::Int64(s + a)))
        }

        let counting_id = AggregateId(9002);
        let catalog = AggregateCatalog::builtin_with([AggregateMeta {
            id: counting_id,
            name: "counting_sum2",
            arg_types: vec![DataType::Int64],
            result_type: DataType::Int64,
            trans_type: DataType::Int64,
            internal_state: false,
            init_value: Some("0"),
            trans_fn: TransFn {
                name: "counting_add2",
                strict: true,
                func: counting_add,
            },
            final_fn: None,
            num_final_extra_args: 0,
            combine_fn: None,
            serial_fn: None,
            deserial_fn: None,
            final_modify: FinalModify::ReadOnly,
            trans_space: 0,
        }]);

        // Three identical references, four input rows: the shared transition
        // state advances once per row, same as a single reference would.
        let source = int_source(1, &[&[1], &[2], &[3], &[4]]);
        let mut node = AggregateNode::init(
            AggregatePlan::plain(vec![
                AggregateRef::simple(counting_id, vec![Column(0)]),
                AggregateRef::simple(counting_id, vec![Column(0)]),
                AggregateRef::simple(counting_id, vec![Column(0)]),
            ]),
            Box::new(source),
            ExecConfig::default(),
            &catalog,
            &AllowAll,
            ExecFlags::default(),
            CancelToken::new(),
        )
        .unwrap();

        let rows = drain(&mut node);
        assert_eq!(vec![int_row(&[10, 10, 10])], rows);
        assert_eq!(4, CALLS.load(Ordering::Relaxed));
    }

    #[test]
    fn backward_and_mark_flags_are_rejected() {
        let source = int_source(1, &[]);
        let err = AggregateNode::init(
            AggregatePlan::plain(vec![AggregateRef::star_call(count::COUNT_STAR)]),
            Box::new(source),
            ExecConfig::default(),
            AggregateCatalog::builtin(),
            &AllowAll,
            ExecFlags {
                backward: true,
                ..Default::default()
            },
            CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(ErrorKind::Configuration, err.kind());
    }

    #[test]
    fn permission_denial_fails_init() {
        #[derive(Debug)]
        struct DenySum;
        impl AccessPolicy for DenySum {
            fn check_execute(&self, function_name: &str) -> groupexec_error::Result<()> {
                if function_name == "int8pl" {
                    return Err(permission_denied(function_name));
                }
                Ok(())
            }
        }

        let source = int_source(1, &[]);
        let err = AggregateNode::init(
            AggregatePlan::plain(vec![AggregateRef::simple(
                sum::SUM_INT64,
                vec![Column(0)],
            )]),
            Box::new(source),
            ExecConfig::default(),
            AggregateCatalog::builtin(),
            &DenySum,
            ExecFlags::default(),
            CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(ErrorKind::PermissionDenied, err.kind());
    }

    #[test]
    fn cancellation_aborts_execution() {
        let data: Vec<[i64; 1]> = (0..100).map(|i| [i]).collect();
        let rows: Vec<&[i64]> = data.iter().map(|r| r.as_slice()).collect();
        let cancel = CancelToken::new();

        let mut node = AggregateNode::init(
            AggregatePlan::hashed(
                vec![0],
                vec![AggregateRef::star_call(count::COUNT_STAR)],
            ),
            Box::new(int_source(1, &rows)),
            ExecConfig::default(),
            AggregateCatalog::builtin(),
            &AllowAll,
            ExecFlags::default(),
            cancel.clone(),
        )
        .unwrap();

        cancel.cancel();
        let err = node.next().unwrap_err();
        assert_eq!(ErrorKind::Cancelled, err.kind());
    }

    #[test]
    fn rescan_without_spill_reuses_the_hash_table() {
        let source = int_source(2, &[&[1, 1], &[2, 2], &[1, 3]]);
        let plan = AggregatePlan::hashed(
            vec![0],
            vec![AggregateRef::simple(sum::SUM_INT64, vec![Column(1)])],
        );

        let mut node = make_node(plan, source, ExecConfig::default());
        let first = drain(&mut node);
        assert_eq!(2, first.len());

        node.rescan().unwrap();
        let second = drain(&mut node);
        assert_same_multiset(first, second);
    }

    #[test]
    fn rescan_after_spill_rebuilds_from_the_child() {
        let data: Vec<[i64; 2]> = (0..50).map(|i| [i, i]).collect();
        let rows: Vec<&[i64]> = data.iter().map(|r| r.as_slice()).collect();
        let plan = AggregatePlan::hashed(
            vec![0],
            vec![AggregateRef::simple(sum::SUM_INT64, vec![Column(1)])],
        );

        let mut node = make_node(plan, int_source(2, &rows), ExecConfig::with_work_mem(64));
        let first = drain(&mut node);
        assert_eq!(50, first.len());

        node.rescan().unwrap();
        let second = drain(&mut node);
        assert_same_multiset(first, second);
    }

    #[test]
    fn string_agg_and_bool_aggregates_over_groups() {
        let schema = Schema::new([
            Field::new("k", DataType::Int64),
            Field::new("s", DataType::Utf8),
            Field::new("b", DataType::Boolean),
        ]);
        let rows = vec![
            Row::from_iter([Datum::Int64(1), Datum::from("x"), Datum::Boolean(true)]),
            Row::from_iter([Datum::Int64(1), Datum::from("y"), Datum::Boolean(true)]),
            Row::from_iter([Datum::Int64(2), Datum::from("z"), Datum::Boolean(false)]),
        ];
        let plan = AggregatePlan::sorted(
            vec![0],
            vec![
                AggregateRef::simple(
                    collect::STRING_AGG,
                    vec![Column(1), Literal(Some(Datum::from(",")))],
                ),
                AggregateRef::simple(boolean::BOOL_AND, vec![Column(2)]),
            ],
        );

        let out = run(plan, ValuesSource::new(schema, rows), ExecConfig::default());
        assert_eq!(
            vec![
                Row::from_iter([Datum::Int64(1), Datum::from("x,y"), Datum::Boolean(true)]),
                Row::from_iter([Datum::Int64(2), Datum::from("z"), Datum::Boolean(false)]),
            ],
            out
        );
    }

    #[test]
    fn hashed_output_after_spill_covers_every_group_exactly_once() {
        // Conservation under spilling: every input row lands in exactly one
        // group, and each group is emitted exactly once.
        let data: Vec<[i64; 2]> = (0..120).map(|i| [i % 30, 1]).collect();
        let rows: Vec<&[i64]> = data.iter().map(|r| r.as_slice()).collect();

        let plan = AggregatePlan::hashed(
            vec![0],
            vec![AggregateRef::star_call(count::COUNT_STAR)],
        );
        let out = run(plan, int_source(2, &rows), ExecConfig::with_work_mem(64));

        assert_eq!(30, out.len());
        let total: i64 = out
            .iter()
            .map(|r| match &r.columns[1] {
                Some(Datum::Int64(n)) => *n,
                other => panic!("unexpected count: {other:?}"),
            })
            .sum();
        assert_eq!(120, total);
    }
}
