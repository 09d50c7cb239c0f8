/// Executor configuration.
///
/// Parameters arrive through the execution-state handle; there is no
/// process-wide state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecConfig {
    /// Memory budget in bytes for hash aggregation. When the hash tables
    /// outgrow it, the executor partitions overflow to disk.
    pub work_mem: usize,

    /// Disables hash memory enforcement entirely. Hash state grows unbounded.
    pub hashagg_mem_overflow: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        ExecConfig {
            work_mem: 4 * 1024 * 1024,
            hashagg_mem_overflow: false,
        }
    }
}

impl ExecConfig {
    pub fn with_work_mem(work_mem: usize) -> Self {
        ExecConfig {
            work_mem,
            ..Default::default()
        }
    }
}
