use groupexec_row::sort::SortKey;

use crate::expr::aggregate_expr::AggregateRef;
use crate::expr::PhysicalScalarExpression;

/// Retrieval strategy the node advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggStrategy {
    /// Single ungrouped result row.
    Plain,
    /// Group boundaries detected on sorted input.
    Sorted,
    /// Hash tables over unsorted input.
    Hashed,
    /// Sorted phases first, hash tables filled alongside and drained last.
    Mixed,
}

/// One rollup: an ordered list of grouping sets sharing a single sort order,
/// processed in one sorted phase.
#[derive(Debug, Clone, PartialEq)]
pub struct RollupPlan {
    /// Grouping columns (input column indices) in this rollup's key order.
    pub group_columns: Vec<usize>,

    /// Sort order the phase's input must have, aligned with `group_columns`.
    pub sort_keys: Vec<SortKey>,

    /// Grouping-set sizes as prefix lengths of `group_columns`, most specific
    /// first. `ROLLUP (a, b)` is `[2, 1, 0]`.
    pub set_sizes: Vec<usize>,
}

impl RollupPlan {
    /// Single grouping set over sorted input, `GROUP BY a, b, ...`.
    pub fn simple(group_columns: Vec<usize>) -> Self {
        let sort_keys = group_columns.iter().map(|&c| SortKey::asc(c)).collect();
        let set_sizes = vec![group_columns.len()];
        RollupPlan {
            group_columns,
            sort_keys,
            set_sizes,
        }
    }

    /// Full rollup: every prefix of `group_columns` down to the empty set.
    pub fn rollup(group_columns: Vec<usize>) -> Self {
        let sort_keys = group_columns.iter().map(|&c| SortKey::asc(c)).collect();
        let set_sizes = (0..=group_columns.len()).rev().collect();
        RollupPlan {
            group_columns,
            sort_keys,
            set_sizes,
        }
    }

    /// The ungrouped "rollup": one empty grouping set.
    pub fn plain() -> Self {
        RollupPlan {
            group_columns: Vec::new(),
            sort_keys: Vec::new(),
            set_sizes: vec![0],
        }
    }

    pub fn columns_for_set(&self, set_size: usize) -> &[usize] {
        &self.group_columns[..set_size]
    }
}

/// One hashed grouping set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedSetPlan {
    /// Grouping columns (input column indices) keying this set's hash table.
    pub group_columns: Vec<usize>,

    /// Planner estimate of distinct groups, used to size the first spill's
    /// partition count. Zero means unknown.
    pub num_groups_hint: u64,
}

impl HashedSetPlan {
    pub fn new(group_columns: Vec<usize>) -> Self {
        HashedSetPlan {
            group_columns,
            num_groups_hint: 0,
        }
    }
}

/// Partial-aggregation mode of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggSplit {
    /// Input rows carry partial transition states; combine them instead of
    /// running the transition function.
    pub combine_input: bool,

    /// Partial states in the input are serialized and must be decoded.
    pub deserialize_input: bool,

    /// Emit serialized transition states instead of final results.
    pub serialize_output: bool,
}

impl AggSplit {
    /// Ordinary single-node aggregation.
    pub fn simple() -> Self {
        AggSplit::default()
    }

    /// First stage of two-phase aggregation: aggregate and emit serialized
    /// partial states.
    pub fn initial_serial() -> Self {
        AggSplit {
            combine_input: false,
            deserialize_input: false,
            serialize_output: true,
        }
    }

    /// Second stage: deserialize incoming partial states, combine, finalize.
    pub fn final_deserial() -> Self {
        AggSplit {
            combine_input: true,
            deserialize_input: true,
            serialize_output: false,
        }
    }
}

/// Plan description handed to the aggregate node at init.
#[derive(Debug, Clone)]
pub struct AggregatePlan {
    /// Union of all grouping columns, in output order. Output rows are these
    /// columns (nulled where absent from the emitting grouping set) followed
    /// by one column per aggregate.
    pub group_columns: Vec<usize>,

    /// Sorted phases, one per rollup. The child must deliver rows in the
    /// first rollup's key order; later rollups re-sort internally.
    pub rollups: Vec<RollupPlan>,

    /// Hashed grouping sets, processed in a single pass over the input.
    pub hashed_sets: Vec<HashedSetPlan>,

    pub aggregates: Vec<AggregateRef>,

    /// HAVING predicate, evaluated against the output row.
    pub having: Option<PhysicalScalarExpression>,

    pub split: AggSplit,
}

impl AggregatePlan {
    /// Ungrouped aggregation over the whole input.
    pub fn plain(aggregates: Vec<AggregateRef>) -> Self {
        AggregatePlan {
            group_columns: Vec::new(),
            rollups: vec![RollupPlan::plain()],
            hashed_sets: Vec::new(),
            aggregates,
            having: None,
            split: AggSplit::simple(),
        }
    }

    /// `GROUP BY` over sorted input.
    pub fn sorted(group_columns: Vec<usize>, aggregates: Vec<AggregateRef>) -> Self {
        AggregatePlan {
            group_columns: group_columns.clone(),
            rollups: vec![RollupPlan::simple(group_columns)],
            hashed_sets: Vec::new(),
            aggregates,
            having: None,
            split: AggSplit::simple(),
        }
    }

    /// `GROUP BY` using a hash table.
    pub fn hashed(group_columns: Vec<usize>, aggregates: Vec<AggregateRef>) -> Self {
        AggregatePlan {
            group_columns: group_columns.clone(),
            rollups: Vec::new(),
            hashed_sets: vec![HashedSetPlan::new(group_columns)],
            aggregates,
            having: None,
            split: AggSplit::simple(),
        }
    }

    pub fn with_having(mut self, having: PhysicalScalarExpression) -> Self {
        self.having = Some(having);
        self
    }

    pub fn with_split(mut self, split: AggSplit) -> Self {
        self.split = split;
        self
    }

    /// Strategy implied by the plan shape.
    pub fn strategy(&self) -> AggStrategy {
        let has_hash = !self.hashed_sets.is_empty();
        let has_sorted = !self.rollups.is_empty();

        match (has_sorted, has_hash) {
            (true, true) => AggStrategy::Mixed,
            (false, true) => AggStrategy::Hashed,
            (true, false) => {
                if self.rollups.len() == 1 && self.rollups[0].group_columns.is_empty() {
                    AggStrategy::Plain
                } else {
                    AggStrategy::Sorted
                }
            }
            // Normalized to a plain rollup at init.
            (false, false) => AggStrategy::Plain,
        }
    }
}
