//! Executor plan-node surface and the child-plan contract.

pub mod aggregate;
pub mod sort;
pub mod values;

pub(crate) mod util;

#[cfg(test)]
pub(crate) mod test_util;

use std::fmt::Debug;

use groupexec_error::Result;
use groupexec_row::field::Schema;
use groupexec_row::row::Row;

/// Pull-model row producer. The aggregate node drives its child through this
/// and implements it itself, so nodes compose into chains.
pub trait RowSource: Debug + Send {
    /// Produce the next row, or `None` at end of stream. End of stream is
    /// signalled once; callers must not rely on repeated `None`.
    fn next(&mut self) -> Result<Option<Row>>;

    /// Reset to the start of the stream.
    fn rescan(&mut self) -> Result<()>;

    fn output_schema(&self) -> &Schema;
}

/// Execution flags passed at node init.
///
/// `backward` and `mark` are capabilities this node does not provide and must
/// reject. `rewind` is a hint that a rescan without parameter changes may
/// happen; the hashed strategy buffers internally anyway and clears it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecFlags {
    pub backward: bool,
    pub mark: bool,
    pub rewind: bool,
}
