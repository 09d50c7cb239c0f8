//! Phase table for grouping-set execution. Phase 0 is the hashed phase,
//! empty when nothing is hashed; phases 1..N are the sorted rollups.

use groupexec_row::sort::SortKey;

use super::plan::{AggStrategy, AggregatePlan};
use super::program::{InputSource, TransitionProgram};

#[derive(Debug)]
pub struct AggPhase {
    pub strategy: AggStrategy,

    /// Grouping columns of this phase in its key order. Empty for the hashed
    /// phase (each hashed set keeps its own columns) and for plain phases.
    pub group_columns: Vec<usize>,

    /// Grouping-set prefix lengths, most specific first.
    pub set_sizes: Vec<usize>,

    /// Input key order this phase requires.
    pub sort_keys: Vec<SortKey>,

    /// Compiled transition program driving all per-tuple work in this phase.
    pub program: TransitionProgram,
}

impl AggPhase {
    pub fn num_sets(&self) -> usize {
        self.set_sizes.len()
    }

    /// Columns of one of this phase's grouping sets.
    pub fn columns_for_set(&self, setno: usize) -> &[usize] {
        &self.group_columns[..self.set_sizes[setno]]
    }
}

pub fn build_phases(plan: &AggregatePlan) -> Vec<AggPhase> {
    let strategy = plan.strategy();
    let mixed = strategy == AggStrategy::Mixed;
    let combine = plan.split.combine_input;

    let mut phases = Vec::with_capacity(plan.rollups.len() + 1);

    // Phase 0: the hashed phase, even when empty.
    phases.push(AggPhase {
        strategy: AggStrategy::Hashed,
        group_columns: Vec::new(),
        set_sizes: Vec::new(),
        sort_keys: Vec::new(),
        program: TransitionProgram {
            do_sort: false,
            do_hash: !plan.hashed_sets.is_empty(),
            spill_mode: false,
            combine,
            source: InputSource::Child,
        },
    });

    for (idx, rollup) in plan.rollups.iter().enumerate() {
        let phase_strategy = if rollup.group_columns.is_empty() {
            AggStrategy::Plain
        } else {
            AggStrategy::Sorted
        };

        phases.push(AggPhase {
            strategy: phase_strategy,
            group_columns: rollup.group_columns.clone(),
            set_sizes: rollup.set_sizes.clone(),
            sort_keys: rollup.sort_keys.clone(),
            program: TransitionProgram {
                do_sort: true,
                // In mixed mode the first sorted phase also feeds the hash
                // tables.
                do_hash: mixed && idx == 0,
                spill_mode: false,
                combine,
                source: InputSource::Child,
            },
        });
    }

    phases
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::operators::aggregate::plan::{HashedSetPlan, RollupPlan};

    #[test]
    fn mixed_plan_hashes_during_first_sorted_phase_only() {
        let plan = AggregatePlan {
            group_columns: vec![0, 1],
            rollups: vec![RollupPlan::rollup(vec![0, 1]), RollupPlan::simple(vec![1])],
            hashed_sets: vec![HashedSetPlan::new(vec![0])],
            aggregates: Vec::new(),
            having: None,
            split: Default::default(),
        };

        let phases = build_phases(&plan);
        assert_eq!(3, phases.len());
        assert!(phases[0].program.do_hash);
        assert!(phases[1].program.do_hash);
        assert!(!phases[2].program.do_hash);
        assert_eq!(vec![2, 1, 0], phases[1].set_sizes);
    }

    #[test]
    fn plain_plan_gets_empty_hashed_phase() {
        let plan = AggregatePlan::plain(Vec::new());
        let phases = build_phases(&plan);
        assert_eq!(2, phases.len());
        assert!(!phases[0].program.do_hash);
        assert_eq!(AggStrategy::Plain, phases[1].strategy);
        assert_eq!(vec![0], phases[1].set_sizes);
    }
}
