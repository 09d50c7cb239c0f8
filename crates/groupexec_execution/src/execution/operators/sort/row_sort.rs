use groupexec_error::{GroupExecError, Result};
use groupexec_row::row::Row;
use groupexec_row::sort::{compare_rows, SortKey};

/// Accumulating row sorter.
///
/// Rows are pushed while unsorted, sorted once, then drained in key order.
/// Used for inter-phase re-sorts between grouping-set rollups and as the
/// backing buffer for multi-column sorted aggregate input.
#[derive(Debug)]
pub struct RowSorter {
    keys: Vec<SortKey>,
    rows: Vec<Row>,
    mem_bytes: usize,
    sorted: bool,
    drain_idx: usize,
}

impl RowSorter {
    pub fn new(keys: Vec<SortKey>) -> Self {
        RowSorter {
            keys,
            rows: Vec::new(),
            mem_bytes: 0,
            sorted: false,
            drain_idx: 0,
        }
    }

    pub fn push(&mut self, row: Row) -> Result<()> {
        if self.sorted {
            return Err(GroupExecError::new(
                "Attempted to push into a sorter that already sorted",
            ));
        }
        self.mem_bytes += row.heap_size();
        self.rows.push(row);
        Ok(())
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Approximate bytes buffered. Not enforced here; the caller owns the
    /// budget.
    pub fn mem_bytes(&self) -> usize {
        self.mem_bytes
    }

    /// Finish input and establish key order. A stable sort keeps the input
    /// order of key-equal rows, which sorted aggregate input relies on for
    /// deterministic duplicate suppression.
    pub fn sort(&mut self) {
        if !self.sorted {
            let keys = std::mem::take(&mut self.keys);
            self.rows.sort_by(|a, b| compare_rows(a, b, &keys));
            self.keys = keys;
            self.sorted = true;
        }
    }

    /// Mark the buffered rows as already being in key order, skipping the
    /// sort. For phase transitions where the previous phase's order matches.
    pub fn assume_sorted(&mut self) {
        self.sorted = true;
    }

    /// Next row in key order. Errors if `sort` hasn't run.
    pub fn next(&mut self) -> Result<Option<Row>> {
        if !self.sorted {
            return Err(GroupExecError::new("Sorter drained before sorting"));
        }
        if self.drain_idx >= self.rows.len() {
            return Ok(None);
        }
        let row = std::mem::take(&mut self.rows[self.drain_idx]);
        self.drain_idx += 1;
        Ok(Some(row))
    }
}
