//! Init-time construction of per-aggregate and per-transition descriptors:
//! catalog resolution, permission checks, validation, deduplication, and the
//! hash memory limits.

use std::collections::BTreeSet;
use std::mem;

use groupexec_error::{ErrorKind, GroupExecError, Result};
use groupexec_row::datatype::DataType;
use groupexec_row::datum::Datum;
use groupexec_row::field::{Field, Schema};
use groupexec_row::sort::SortKey;

use super::plan::AggregatePlan;
use super::spill::HASH_PARTITION_MEM;
use super::trans::GroupState;
use crate::config::ExecConfig;
use crate::database::agg_catalog::{get_agg_init_val, AccessPolicy, AggregateCatalog};
use crate::expr::aggregate_expr::{AggregateId, AggregateRef};
use crate::expr::PhysicalScalarExpression;
use crate::functions::aggregate::{FinalFn, StateCodecFn, TransFn};

fn config_error(msg: impl Into<String>) -> GroupExecError {
    GroupExecError::with_kind(msg, ErrorKind::Configuration)
}

/// Per-aggregate execution descriptor. Immutable for the query.
#[derive(Debug, Clone)]
pub struct AggregateDescriptor {
    /// Plan aggregate this descriptor was built from.
    pub aggref_idx: usize,
    pub agg_id: AggregateId,
    pub name: &'static str,
    pub final_fn: Option<FinalFn>,
    pub num_final_extra_args: usize,
    pub direct_args: Vec<PhysicalScalarExpression>,
    pub result_type: DataType,
    /// False when the final function may scribble on the transition value.
    pub shareable: bool,
    /// Transition state backing this aggregate.
    pub transno: usize,
}

/// Per-transition-state descriptor. Several aggregates may reference one.
#[derive(Debug, Clone)]
pub struct TransitionDescriptor {
    /// Representative plan aggregate, used as the call context's parse node.
    pub aggref_idx: usize,
    pub trans_fn: TransFn,
    pub num_trans_inputs: usize,
    pub trans_type: DataType,
    pub internal_state: bool,
    pub init_value: Option<Datum>,
    pub combine_fn: Option<TransFn>,
    pub serial_fn: Option<StateCodecFn>,
    pub deserial_fn: Option<StateCodecFn>,
    /// Argument expressions over the input row.
    pub args: Vec<PhysicalScalarExpression>,
    pub filter: Option<PhysicalScalarExpression>,
    pub distinct: bool,
    /// Sort order of the buffered argument tuple for DISTINCT / ORDER BY
    /// input. Keys index positions in the argument tuple, not input columns.
    pub sort_keys: Vec<SortKey>,
    pub trans_space: usize,
    /// Bound to more than one aggregate.
    pub shared: bool,
    /// Incoming partial states are serialized and must be decoded before
    /// combining.
    pub deserialize_input: bool,
}

impl TransitionDescriptor {
    /// Whether inputs are buffered and sorted before feeding the transition
    /// function.
    pub fn has_sort_input(&self) -> bool {
        !self.sort_keys.is_empty()
    }
}

/// Everything the node needs out of descriptor construction.
#[derive(Debug)]
pub struct BuildOutput {
    pub peraggs: Vec<AggregateDescriptor>,
    pub pertrans: Vec<TransitionDescriptor>,
    /// Descriptor index per plan aggregate (deduplicated references collapse
    /// onto one descriptor).
    pub peragg_for_aggref: Vec<usize>,
    /// Input columns that must survive into spill tuples.
    pub needed_columns: Vec<bool>,
    pub output_schema: Schema,
    pub hash_mem_limit: usize,
    pub hash_ngroups_limit: u64,
    pub hash_entry_size: usize,
}

/// Estimated in-memory footprint of one hash entry.
pub fn hash_entry_size_estimate(num_trans: usize, trans_space: usize, key_width: usize) -> usize {
    mem::size_of::<super::hash_table::GroupEntry>()
        + num_trans * mem::size_of::<GroupState>()
        + key_width * mem::size_of::<Option<Datum>>()
        + trans_space
}

pub fn build_aggregates(
    plan: &AggregatePlan,
    input_schema: &Schema,
    config: &ExecConfig,
    catalog: &AggregateCatalog,
    access: &dyn AccessPolicy,
) -> Result<BuildOutput> {
    validate_plan_shape(plan, input_schema)?;

    let mut peraggs: Vec<AggregateDescriptor> = Vec::new();
    let mut pertrans: Vec<TransitionDescriptor> = Vec::new();
    let mut peragg_for_aggref = Vec::with_capacity(plan.aggregates.len());
    let mut trans_space_total = 0usize;

    let use_hashing = !plan.hashed_sets.is_empty();

    for (aggref_idx, aggref) in plan.aggregates.iter().enumerate() {
        // First pass: an identical aggregate reference with no volatile
        // inputs shares the whole descriptor.
        if let Some(existing) = find_compatible_peragg(aggref, &peraggs, &plan.aggregates) {
            peragg_for_aggref.push(existing);
            continue;
        }

        let meta = catalog.resolve(aggref.agg_id, access)?;

        let arg_types = aggref
            .args
            .iter()
            .map(|e| e.datatype(input_schema))
            .collect::<Result<Vec<_>>>()?;

        // In combine mode the single "argument" is the upstream partial
        // state, not a regular aggregate input; the declared signature does
        // not apply to it.
        if !plan.split.combine_input {
            if !meta.signature().matches(&arg_types) {
                return Err(config_error(format!(
                    "Aggregate {} does not accept the given argument types",
                    meta.name
                )));
            }
        } else if aggref.args.len() != 1 {
            return Err(config_error(format!(
                "Aggregate {} in combine mode takes exactly one partial-state input",
                meta.name
            )));
        }

        let init_value = match meta.init_value {
            Some(text) => Some(get_agg_init_val(text, &meta.trans_type)?),
            None => None,
        };

        validate_aggregate(plan, aggref, meta, &arg_types, init_value.is_none(), use_hashing)?;

        let resolved_trans = resolve_type(&meta.trans_type, &arg_types);
        // A serializing partial node emits transition states, not final
        // values; its output columns are typed accordingly.
        let resolved_result = if plan.split.serialize_output {
            if meta.serial_fn.is_some() {
                DataType::Binary
            } else {
                resolved_trans.clone()
            }
        } else {
            resolve_type(&meta.result_type, &arg_types)
        };

        let shareable = meta.shareable();
        let sort_keys = sort_input_keys(aggref);

        // Second pass: another aggregate with matching transition-phase
        // inputs may share just the transition state.
        let transno = match find_compatible_pertrans(
            aggref,
            meta.trans_fn,
            &resolved_trans,
            meta.serial_fn,
            meta.deserial_fn,
            &init_value,
            shareable,
            &peraggs,
            &mut pertrans,
            &plan.aggregates,
        ) {
            Some(transno) => transno,
            None => {
                trans_space_total += meta.trans_space;
                pertrans.push(TransitionDescriptor {
                    aggref_idx,
                    trans_fn: meta.trans_fn,
                    num_trans_inputs: aggref.num_trans_inputs(),
                    trans_type: resolved_trans,
                    internal_state: meta.internal_state,
                    init_value,
                    combine_fn: meta.combine_fn,
                    serial_fn: meta.serial_fn,
                    deserial_fn: meta.deserial_fn,
                    args: aggref.args.clone(),
                    filter: aggref.filter.clone(),
                    distinct: aggref.distinct,
                    sort_keys,
                    trans_space: meta.trans_space,
                    shared: false,
                    deserialize_input: plan.split.deserialize_input,
                });
                pertrans.len() - 1
            }
        };

        peragg_for_aggref.push(peraggs.len());
        peraggs.push(AggregateDescriptor {
            aggref_idx,
            agg_id: aggref.agg_id,
            name: meta.name,
            final_fn: meta.final_fn,
            num_final_extra_args: meta.num_final_extra_args,
            direct_args: aggref.direct_args.clone(),
            result_type: resolved_result,
            shareable,
            transno,
        });
    }

    let needed_columns = compute_needed_columns(plan, input_schema);
    let output_schema = output_schema(plan, input_schema, &peraggs, &peragg_for_aggref)?;

    // Hash memory thresholds. For small budgets even empty tables exceed the
    // limit, so the entry limit never goes below one group.
    let max_key_width = plan
        .hashed_sets
        .iter()
        .map(|s| s.group_columns.len())
        .max()
        .unwrap_or(0);
    let hash_entry_size = hash_entry_size_estimate(pertrans.len(), trans_space_total, max_key_width);

    let (hash_mem_limit, hash_ngroups_limit) = if config.hashagg_mem_overflow {
        (usize::MAX, u64::MAX)
    } else {
        let mem_limit = if config.work_mem > HASH_PARTITION_MEM * 2 {
            config.work_mem - HASH_PARTITION_MEM
        } else {
            config.work_mem
        };
        let ngroups = if mem_limit > hash_entry_size {
            (mem_limit / hash_entry_size) as u64
        } else {
            1
        };
        (mem_limit, ngroups)
    };

    Ok(BuildOutput {
        peraggs,
        pertrans,
        peragg_for_aggref,
        needed_columns,
        output_schema,
        hash_mem_limit,
        hash_ngroups_limit,
        hash_entry_size,
    })
}

fn validate_plan_shape(plan: &AggregatePlan, input_schema: &Schema) -> Result<()> {
    let ncols = input_schema.num_columns();

    let col_in_range = |col: usize| -> Result<()> {
        if col >= ncols {
            return Err(config_error(format!(
                "Grouping column {col} out of range for input with {ncols} columns"
            )));
        }
        Ok(())
    };

    for col in &plan.group_columns {
        col_in_range(*col)?;
    }

    for rollup in &plan.rollups {
        for col in &rollup.group_columns {
            col_in_range(*col)?;
        }
        if rollup.set_sizes.is_empty() {
            return Err(config_error("Rollup with no grouping sets"));
        }
        if rollup.set_sizes[0] != rollup.group_columns.len() {
            return Err(config_error(
                "Rollup's most specific grouping set must cover all its columns",
            ));
        }
        if rollup.set_sizes.windows(2).any(|w| w[0] < w[1]) {
            return Err(config_error(
                "Rollup grouping sets must be ordered most specific first",
            ));
        }
        if rollup.sort_keys.len() != rollup.group_columns.len() {
            return Err(config_error("Rollup sort keys must cover its columns"));
        }
        for col in rollup.group_columns.iter() {
            if !plan.group_columns.contains(col) {
                return Err(config_error(format!(
                    "Rollup grouping column {col} missing from the output grouping columns"
                )));
            }
        }
    }

    for set in &plan.hashed_sets {
        for col in &set.group_columns {
            col_in_range(*col)?;
            if !plan.group_columns.contains(col) {
                return Err(config_error(format!(
                    "Hashed grouping column {col} missing from the output grouping columns"
                )));
            }
        }
    }

    Ok(())
}

fn validate_aggregate(
    plan: &AggregatePlan,
    aggref: &AggregateRef,
    meta: &crate::functions::aggregate::AggregateMeta,
    arg_types: &[DataType],
    init_is_null: bool,
    use_hashing: bool,
) -> Result<()> {
    let has_sort_input = aggref.distinct || !aggref.order_by.is_empty();

    if has_sort_input && use_hashing {
        return Err(config_error(format!(
            "Aggregate {} with DISTINCT or ORDER BY input requires a sorted strategy",
            meta.name
        )));
    }

    for ob in &aggref.order_by {
        if ob.arg_idx >= aggref.args.len() {
            return Err(config_error(format!(
                "Aggregate {} ORDER BY references argument {} of {}",
                meta.name,
                ob.arg_idx,
                aggref.args.len()
            )));
        }
    }

    // A strict transition function starting from a null state adopts the
    // first input value verbatim, which requires binary compatibility
    // between the input and transition types.
    if meta.trans_fn.strict && init_is_null && !plan.split.combine_input {
        let first = arg_types.first().ok_or_else(|| {
            config_error(format!(
                "Aggregate {} has a strict transition function with a null initial \
                 value but no input to adopt",
                meta.name
            ))
        })?;
        let resolved_trans = resolve_type(&meta.trans_type, arg_types);
        if !first.binary_compatible_with(&resolved_trans) {
            return Err(config_error(format!(
                "Aggregate {}: input type {first} is not compatible with transition type \
                 {resolved_trans} required by a strict transition function with null initial value",
                meta.name
            )));
        }
    }

    if plan.split.combine_input {
        if has_sort_input {
            return Err(config_error(format!(
                "Aggregate {} cannot combine partial states with DISTINCT or ORDER BY input",
                meta.name
            )));
        }
        let combine = meta.combine_fn.ok_or_else(|| {
            config_error(format!(
                "Aggregate {} has no combine function but the node combines partial states",
                meta.name
            ))
        })?;
        if meta.internal_state {
            if combine.strict {
                return Err(config_error(format!(
                    "Combine function of aggregate {} must not be strict: its transition \
                     state is internal",
                    meta.name
                )));
            }
            if plan.split.deserialize_input && meta.deserial_fn.is_none() {
                return Err(config_error(format!(
                    "Aggregate {} has an internal transition state but no deserialize function",
                    meta.name
                )));
            }
        }
    }

    if plan.split.serialize_output && meta.internal_state && meta.serial_fn.is_none() {
        return Err(config_error(format!(
            "Aggregate {} has an internal transition state but no serialize function",
            meta.name
        )));
    }

    Ok(())
}

/// `Any` declarations resolve to the first argument's type.
fn resolve_type(declared: &DataType, arg_types: &[DataType]) -> DataType {
    match declared {
        DataType::Any => arg_types.first().cloned().unwrap_or(DataType::Any),
        DataType::List(inner) if **inner == DataType::Any => DataType::List(Box::new(
            arg_types.first().cloned().unwrap_or(DataType::Any),
        )),
        other => other.clone(),
    }
}

/// Sort order of the buffered argument tuple for DISTINCT / ORDER BY input.
/// DISTINCT without an explicit order sorts on every argument ascending.
fn sort_input_keys(aggref: &AggregateRef) -> Vec<SortKey> {
    if !aggref.order_by.is_empty() {
        aggref
            .order_by
            .iter()
            .map(|ob| SortKey {
                column: ob.arg_idx,
                descending: ob.descending,
                nulls_first: ob.nulls_first,
            })
            .collect()
    } else if aggref.distinct {
        (0..aggref.args.len()).map(SortKey::asc).collect()
    } else {
        Vec::new()
    }
}

/// Two aggregate references share one descriptor iff the references are
/// entirely identical and contain nothing volatile.
fn find_compatible_peragg(
    aggref: &AggregateRef,
    peraggs: &[AggregateDescriptor],
    aggrefs: &[AggregateRef],
) -> Option<usize> {
    if aggref.contains_volatile() {
        return None;
    }
    peraggs
        .iter()
        .position(|existing| &aggrefs[existing.aggref_idx] == aggref)
}

/// Transition-state sharing: the transition-phase inputs must match (all the
/// reference's properties except which aggregate function it names), both
/// final functions must permit sharing, and the transition-side catalog rows
/// must be interchangeable.
#[allow(clippy::too_many_arguments)]
fn find_compatible_pertrans(
    aggref: &AggregateRef,
    trans_fn: TransFn,
    trans_type: &DataType,
    serial_fn: Option<StateCodecFn>,
    deserial_fn: Option<StateCodecFn>,
    init_value: &Option<Datum>,
    new_shareable: bool,
    peraggs: &[AggregateDescriptor],
    pertrans: &mut [TransitionDescriptor],
    aggrefs: &[AggregateRef],
) -> Option<usize> {
    if !new_shareable || aggref.contains_volatile() {
        return None;
    }

    for existing in peraggs {
        if !existing.shareable {
            continue;
        }

        let candidate = &aggrefs[existing.aggref_idx];
        let inputs_match = candidate.args == aggref.args
            && candidate.order_by == aggref.order_by
            && candidate.distinct == aggref.distinct
            && candidate.filter == aggref.filter
            && candidate.star == aggref.star
            && candidate.variadic == aggref.variadic
            && candidate.kind == aggref.kind
            && candidate.input_collation == aggref.input_collation;
        if !inputs_match {
            continue;
        }

        let pt = &mut pertrans[existing.transno];
        let trans_match = pt.trans_fn == trans_fn
            && pt.trans_type == *trans_type
            && codec_eq(pt.serial_fn, serial_fn)
            && codec_eq(pt.deserial_fn, deserial_fn)
            && pt.init_value == *init_value;
        if trans_match {
            pt.shared = true;
            return Some(existing.transno);
        }
    }

    None
}

fn codec_eq(a: Option<StateCodecFn>, b: Option<StateCodecFn>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Input columns that must be materialized into spill tuples: grouping keys
/// plus everything the aggregate argument, filter, and direct-argument
/// expressions read.
fn compute_needed_columns(plan: &AggregatePlan, input_schema: &Schema) -> Vec<bool> {
    let mut needed = BTreeSet::new();

    needed.extend(plan.group_columns.iter().copied());
    for rollup in &plan.rollups {
        needed.extend(rollup.group_columns.iter().copied());
    }
    for set in &plan.hashed_sets {
        needed.extend(set.group_columns.iter().copied());
    }
    for aggref in &plan.aggregates {
        for expr in aggref
            .args
            .iter()
            .chain(aggref.direct_args.iter())
            .chain(aggref.filter.iter())
        {
            expr.collect_columns(&mut needed);
        }
    }

    (0..input_schema.num_columns())
        .map(|col| needed.contains(&col))
        .collect()
}

fn output_schema(
    plan: &AggregatePlan,
    input_schema: &Schema,
    peraggs: &[AggregateDescriptor],
    peragg_for_aggref: &[usize],
) -> Result<Schema> {
    let mut fields = Vec::with_capacity(plan.group_columns.len() + plan.aggregates.len());

    for &col in &plan.group_columns {
        fields.push(input_schema.fields[col].clone());
    }
    for aggno in peragg_for_aggref {
        let peragg = &peraggs[*aggno];
        fields.push(Field::new(peragg.name, peragg.result_type.clone()));
    }

    Ok(Schema::new(fields))
}
