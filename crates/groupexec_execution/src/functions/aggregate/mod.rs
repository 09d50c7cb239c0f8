pub mod avg;
pub mod boolean;
pub mod collect;
pub mod count;
pub mod minmax;
pub mod sum;

use std::fmt;

use groupexec_error::{ErrorKind, GroupExecError, Result};
use groupexec_row::datatype::DataType;
use groupexec_row::datum::Datum;
use groupexec_row::encoding;
use groupexec_row::row::Row;
use once_cell::sync::Lazy;

use super::Signature;
use crate::arena::{Arena, ResetCallback};
use crate::expr::aggregate_expr::{AggregateId, AggregateRef};

/// All builtin aggregates, in catalog order.
pub static BUILTIN_AGGREGATES: Lazy<Vec<AggregateMeta>> = Lazy::new(|| {
    let mut entries = Vec::new();
    entries.extend(count::entries());
    entries.extend(sum::entries());
    entries.extend(avg::entries());
    entries.extend(minmax::entries());
    entries.extend(boolean::entries());
    entries.extend(collect::entries());
    entries
});

pub type RawTransitionFn =
    fn(&mut AggFnContext, Option<Datum>, &[Option<Datum>]) -> Result<Option<Datum>>;

pub type RawFinalFn =
    fn(&mut AggFnContext, &Option<Datum>, &[Option<Datum>]) -> Result<Option<Datum>>;

pub type RawStateCodecFn = fn(&Datum) -> Result<Datum>;

/// A resolved transition (or combine) function: the pointer plus the small
/// amount of metadata call sites need. Resolved once at node init and cached;
/// never looked up per call.
#[derive(Clone, Copy)]
pub struct TransFn {
    pub name: &'static str,
    pub strict: bool,
    pub func: RawTransitionFn,
}

impl fmt::Debug for TransFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransFn")
            .field("name", &self.name)
            .field("strict", &self.strict)
            .finish()
    }
}

impl PartialEq for TransFn {
    /// Function identity is the catalog-level name, not the code pointer.
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for TransFn {}

#[derive(Clone, Copy)]
pub struct FinalFn {
    pub name: &'static str,
    pub strict: bool,
    pub func: RawFinalFn,
}

impl fmt::Debug for FinalFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalFn")
            .field("name", &self.name)
            .field("strict", &self.strict)
            .finish()
    }
}

/// Serialize or deserialize handle for shipping transition state across
/// process boundaries during partial aggregation.
#[derive(Clone, Copy)]
pub struct StateCodecFn {
    pub name: &'static str,
    pub strict: bool,
    pub func: RawStateCodecFn,
}

impl fmt::Debug for StateCodecFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCodecFn")
            .field("name", &self.name)
            .finish()
    }
}

impl PartialEq for StateCodecFn {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// What the final function is allowed to do to the transition value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalModify {
    /// Never modifies the transition value.
    ReadOnly,
    /// May modify, but the aggregate is still safe to share.
    Shareable,
    /// Scribbles on the transition value; the state must not be shared.
    ReadWrite,
}

/// Catalog row for one aggregate signature.
#[derive(Debug, Clone)]
pub struct AggregateMeta {
    pub id: AggregateId,
    pub name: &'static str,
    pub arg_types: Vec<DataType>,
    /// `Any` means "same as the first argument" and is resolved at plan time.
    pub result_type: DataType,
    pub trans_type: DataType,
    /// State is an implementation-internal representation that cannot cross a
    /// process boundary without the serialize/deserialize pair.
    pub internal_state: bool,
    /// Initial value in text form, parsed against `trans_type` at init.
    pub init_value: Option<&'static str>,
    pub trans_fn: TransFn,
    pub final_fn: Option<FinalFn>,
    /// Extra (direct) arguments the final function accepts beyond the state.
    pub num_final_extra_args: usize,
    pub combine_fn: Option<TransFn>,
    pub serial_fn: Option<StateCodecFn>,
    pub deserial_fn: Option<StateCodecFn>,
    pub final_modify: FinalModify,
    /// Estimated per-group state growth in bytes, for hash entry sizing.
    pub trans_space: usize,
}

impl AggregateMeta {
    /// Whether the final function permits sharing the transition state with
    /// another aggregate.
    pub fn shareable(&self) -> bool {
        self.final_modify != FinalModify::ReadWrite
    }

    pub fn signature(&self) -> Signature {
        Signature {
            arg_types: self.arg_types.clone(),
            return_type: self.result_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggContextKind {
    /// Not called as part of an aggregate. User-facing functions reached
    /// outside aggregation see this.
    None,
    Aggregate,
}

/// Call-time context handed to aggregate support functions.
///
/// This is the executor's side of the aggregate-support API: transition and
/// final functions use it to find the group scope, account state growth,
/// inspect the call they serve, and register shutdown callbacks.
pub struct AggFnContext<'a> {
    kind: AggContextKind,
    group_arena: Option<&'a Arena>,
    tmp_arena: Option<&'a Arena>,
    aggref: Option<&'a AggregateRef>,
    state_shared: bool,
}

impl<'a> AggFnContext<'a> {
    pub fn outside_aggregate() -> AggFnContext<'static> {
        AggFnContext {
            kind: AggContextKind::None,
            group_arena: None,
            tmp_arena: None,
            aggref: None,
            state_shared: false,
        }
    }

    pub fn for_aggregate(
        group_arena: &'a Arena,
        tmp_arena: &'a Arena,
        aggref: &'a AggregateRef,
        state_shared: bool,
    ) -> Self {
        AggFnContext {
            kind: AggContextKind::Aggregate,
            group_arena: Some(group_arena),
            tmp_arena: Some(tmp_arena),
            aggref: Some(aggref),
            state_shared,
        }
    }

    pub fn kind(&self) -> AggContextKind {
        self.kind
    }

    /// The arena scoping the current group's state, when aggregating.
    pub fn aggregate_context(&self) -> Option<&'a Arena> {
        self.group_arena
    }

    /// Parse node of the aggregate call being served.
    pub fn aggref(&self) -> Option<&'a AggregateRef> {
        self.aggref
    }

    /// Short-lived scope safe to reset between calls.
    pub fn temp_arena(&self) -> Option<&'a Arena> {
        self.tmp_arena
    }

    /// Whether the transition value may be referenced by more than one
    /// aggregate. Conservatively true outside an aggregate context, so
    /// callers never scribble on a value they don't own.
    pub fn state_is_shared(&self) -> bool {
        match self.kind {
            AggContextKind::None => true,
            AggContextKind::Aggregate => self.state_shared,
        }
    }

    /// Register a callback to run when the current group's scope is reset.
    pub fn register_shutdown_callback(&self, cb: ResetCallback) -> Result<()> {
        match self.group_arena {
            Some(arena) => {
                arena.register_reset_callback(cb);
                Ok(())
            }
            None => Err(GroupExecError::new(
                "Shutdown callback registered outside an aggregate context",
            )),
        }
    }

    /// Account state growth against the group scope. Growing transition
    /// functions report here so the hash memory limit sees them.
    pub fn charge_group_memory(&self, bytes: usize) {
        if let Some(arena) = self.group_arena {
            arena.charge(bytes);
        }
    }

    pub fn release_group_memory(&self, bytes: usize) {
        if let Some(arena) = self.group_arena {
            arena.release(bytes);
        }
    }
}

impl fmt::Debug for AggFnContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggFnContext")
            .field("kind", &self.kind)
            .field("state_shared", &self.state_shared)
            .finish_non_exhaustive()
    }
}

/// Default state serializer: the single-column row encoding of the state.
pub fn encode_state(state: &Datum) -> Result<Datum> {
    let row = Row {
        columns: vec![Some(state.clone())],
    };
    let mut buf = Vec::new();
    encoding::encode_row(&row, None, &mut buf);
    Ok(Datum::Binary(buf))
}

/// Inverse of [`encode_state`].
pub fn decode_state(serialized: &Datum) -> Result<Datum> {
    let bytes = serialized.try_as_bytes()?;
    let row = encoding::decode_row(bytes)?;
    match row.columns.into_iter().next() {
        Some(Some(datum)) => Ok(datum),
        _ => Err(GroupExecError::with_kind(
            "Serialized aggregate state decoded to null",
            ErrorKind::UserFunction,
        )),
    }
}
