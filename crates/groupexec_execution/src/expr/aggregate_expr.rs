use std::fmt;

use super::PhysicalScalarExpression;

/// Identifier of a catalog aggregate. Distinct signatures of the same SQL
/// name carry distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AggregateId(pub u32);

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agg#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    Normal,
    /// Ordered-set aggregate; `direct_args` are passed through to the final
    /// function.
    OrderedSet,
}

/// Ordering requirement on one aggregated argument, for `agg(x ORDER BY ...)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggOrderBy {
    /// Index into the aggregate's argument list.
    pub arg_idx: usize,
    pub descending: bool,
    pub nulls_first: bool,
}

impl AggOrderBy {
    pub fn asc(arg_idx: usize) -> Self {
        AggOrderBy {
            arg_idx,
            descending: false,
            nulls_first: false,
        }
    }
}

/// A single aggregate call in the plan's target list.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRef {
    pub agg_id: AggregateId,
    pub kind: AggKind,

    /// Aggregated argument expressions, evaluated per input row.
    pub args: Vec<PhysicalScalarExpression>,

    /// Direct (non-aggregated) arguments, evaluated once per group against
    /// the representative row.
    pub direct_args: Vec<PhysicalScalarExpression>,

    /// Deduplicate the argument tuple before feeding the transition function.
    pub distinct: bool,

    /// Sort requirements on the argument tuple.
    pub order_by: Vec<AggOrderBy>,

    /// FILTER (WHERE ...) clause over the input row.
    pub filter: Option<PhysicalScalarExpression>,

    /// `count(*)` style reference with no argument list.
    pub star: bool,

    /// Last argument is variadic.
    pub variadic: bool,

    /// Collation the aggregated input is evaluated under. 0 is the default
    /// collation; only identity matters to the executor (dedup compares it).
    pub input_collation: u32,

    /// Collation of the result. As with `input_collation`, identity only.
    pub result_collation: u32,
}

impl AggregateRef {
    /// Plain `agg(args...)` call.
    pub fn simple(agg_id: AggregateId, args: Vec<PhysicalScalarExpression>) -> Self {
        AggregateRef {
            agg_id,
            kind: AggKind::Normal,
            args,
            direct_args: Vec::new(),
            distinct: false,
            order_by: Vec::new(),
            filter: None,
            star: false,
            variadic: false,
            input_collation: 0,
            result_collation: 0,
        }
    }

    /// `count(*)`.
    pub fn star_call(agg_id: AggregateId) -> Self {
        AggregateRef {
            star: true,
            ..Self::simple(agg_id, Vec::new())
        }
    }

    pub fn with_distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn with_order_by(mut self, order_by: Vec<AggOrderBy>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn with_filter(mut self, filter: PhysicalScalarExpression) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Whether any input expression is volatile. Volatile aggregates are
    /// never deduplicated.
    pub fn contains_volatile(&self) -> bool {
        self.args.iter().any(|e| e.is_volatile())
            || self.direct_args.iter().any(|e| e.is_volatile())
            || self.filter.as_ref().map(|e| e.is_volatile()).unwrap_or(false)
    }

    /// Number of arguments fed to the transition function.
    pub fn num_trans_inputs(&self) -> usize {
        self.args.len()
    }
}
