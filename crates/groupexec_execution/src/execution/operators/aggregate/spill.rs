//! Hash-aggregation spill machinery: partitioned overflow tapes, the spilled
//! tuple format, and the batches that reintroduce spilled data.

use std::sync::Arc;

use groupexec_error::{ErrorKind, GroupExecError, Result};
use groupexec_row::encoding::{decode_row, encode_row};
use groupexec_row::row::Row;
use groupexec_tape::{TapeSet, BLOCK_SIZE};
use parking_lot::Mutex;
use tracing::debug;

/// Multiplied into the estimated memory need when choosing a partition
/// count, so that partitions undershoot the budget rather than overshoot.
pub const HASH_PARTITION_FACTOR: f64 = 1.50;
pub const HASH_MIN_PARTITIONS: usize = 4;
pub const HASH_MAX_PARTITIONS: usize = 256;

/// Approximate work_mem reserved for open partition buffers rather than hash
/// entries.
pub const HASH_PARTITION_MEM: usize = HASH_MIN_PARTITIONS * BLOCK_SIZE;

/// Tape sets are shared between the partitions that write them and the
/// batches that read them; re-spilling a batch extends the same set.
pub type SharedTapeSet = Arc<Mutex<TapeSet>>;

/// Determine the number of partitions to create when spilling.
fn choose_num_spill_partitions(input_groups: u64, entry_size: usize, work_mem: usize) -> usize {
    // Avoid creating so many partitions that the memory requirements of the
    // open partition files (estimated at BLOCK_SIZE for buffering) are
    // greater than 1/4 of work_mem.
    let partition_limit = (work_mem / 4) / BLOCK_SIZE;

    // Pessimistically estimate that each input tuple creates a new group.
    let mem_needed = HASH_PARTITION_FACTOR * input_groups as f64 * entry_size as f64;

    // Make enough partitions that each one is likely to fit in memory.
    let mut npartitions = 1 + (mem_needed / work_mem.max(1) as f64) as usize;

    if npartitions > partition_limit {
        npartitions = partition_limit;
    }
    npartitions.clamp(HASH_MIN_PARTITIONS, HASH_MAX_PARTITIONS)
}

/// Ceiling log2, for power-of-two partition counts.
fn log2_ceil(n: usize) -> u8 {
    n.next_power_of_two().trailing_zeros() as u8
}

/// Route a hash to a partition using the next window of high-order bits.
/// `input_bits` high bits were consumed by earlier recursion levels.
pub const fn partition_for_hash(hash: u32, input_bits: u8, partition_bits: u8) -> usize {
    if partition_bits == 0 {
        0
    } else {
        ((hash << input_bits) >> (32 - partition_bits)) as usize
    }
}

/// Open spill partitions for one hash table that hit its memory limit.
#[derive(Debug)]
pub struct SpillPartitions {
    tape_set: SharedTapeSet,
    partition_bits: u8,
    /// Tape number per partition. Dense within the set but not necessarily
    /// starting at zero: re-spills extend an existing set.
    tapes: Vec<usize>,
    ntuples: Vec<u64>,
    nbytes: Vec<u64>,
}

impl SpillPartitions {
    /// Open partitions on a fresh tape set (first spill of a table) or by
    /// extending the set a batch was read from (recursive spill).
    pub fn init(
        existing: Option<SharedTapeSet>,
        input_bits: u8,
        input_groups: u64,
        entry_size: usize,
        work_mem: usize,
    ) -> Result<Self> {
        let npartitions = choose_num_spill_partitions(input_groups, entry_size, work_mem);
        let mut partition_bits = log2_ceil(npartitions);

        // Never consume hash bits beyond the 32 we have: a deeper recursion
        // level must get a disjoint (possibly empty) window.
        if partition_bits + input_bits >= 32 {
            partition_bits = 32 - input_bits.min(32);
        }
        let npartitions = 1usize << partition_bits;

        let (tape_set, first_tape) = match existing {
            None => {
                let set = TapeSet::create(npartitions)?;
                (Arc::new(Mutex::new(set)), 0)
            }
            Some(set) => {
                let first = set.lock().extend(npartitions)?;
                (set, first)
            }
        };

        debug!(
            npartitions,
            partition_bits, input_bits, "initialized hash agg spill partitions"
        );

        Ok(SpillPartitions {
            tape_set,
            partition_bits,
            tapes: (first_tape..first_tape + npartitions).collect(),
            ntuples: vec![0; npartitions],
            nbytes: vec![0; npartitions],
        })
    }

    pub fn num_partitions(&self) -> usize {
        self.tapes.len()
    }

    pub fn partition_bits(&self) -> u8 {
        self.partition_bits
    }

    /// Write one tuple to its partition: `u32` hash, `u32` length (the
    /// length field included), then the minimal row image. Columns not in
    /// `keep` are stored as null placeholders.
    ///
    /// Returns the number of bytes written.
    pub fn write_tuple(
        &mut self,
        input_bits: u8,
        row: &Row,
        hash: u32,
        keep: Option<&[bool]>,
    ) -> Result<usize> {
        let partition = partition_for_hash(hash, input_bits, self.partition_bits);

        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&hash.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        encode_row(row, keep, &mut buf);

        let len = (buf.len() - 4) as u32;
        buf[4..8].copy_from_slice(&len.to_le_bytes());

        self.tape_set.lock().write(self.tapes[partition], &buf)?;
        self.ntuples[partition] += 1;
        self.nbytes[partition] += buf.len() as u64;

        Ok(buf.len())
    }

    /// Close out the partitions: rewind every non-empty tape and wrap it in a
    /// batch recording how many high hash bits are consumed so far.
    pub fn finish(self, setno: usize, input_bits: u8) -> Result<Vec<SpillBatch>> {
        let consumed_bits = input_bits + self.partition_bits;
        let mut batches = Vec::new();

        for (idx, tape) in self.tapes.iter().copied().enumerate() {
            let mut set = self.tape_set.lock();
            if self.ntuples[idx] == 0 {
                set.close_tape(tape)?;
                continue;
            }
            set.rewind_for_read(tape)?;
            drop(set);

            batches.push(SpillBatch {
                tape_set: self.tape_set.clone(),
                tape,
                setno,
                input_tuples: self.ntuples[idx],
                input_bits: consumed_bits,
            });
        }

        debug!(
            setno,
            num_batches = batches.len(),
            consumed_bits,
            "finished hash agg spill partitions"
        );

        Ok(batches)
    }
}

/// A deferred unit of work: one rewound partition tape, to be re-aggregated
/// when the in-memory tables drain.
#[derive(Debug)]
pub struct SpillBatch {
    pub tape_set: SharedTapeSet,
    pub tape: usize,
    /// Grouping set the spilled tuples belong to.
    pub setno: usize,
    pub input_tuples: u64,
    /// High-order hash bits consumed by the partitioning that produced this
    /// batch. A re-spill starts its window here.
    pub input_bits: u8,
}

impl SpillBatch {
    /// Read the next spilled tuple. `None` at end of tape; a torn tuple is
    /// an I/O error.
    pub fn read_next(&mut self) -> Result<Option<(u32, Row)>> {
        let mut set = self.tape_set.lock();

        let mut header = [0u8; 4];
        let n = set.read(self.tape, &mut header)?;
        if n == 0 {
            return Ok(None);
        }
        if n < 4 {
            return Err(short_read("hash"));
        }
        let hash = u32::from_le_bytes(header);

        let n = set.read(self.tape, &mut header)?;
        if n < 4 {
            return Err(short_read("length"));
        }
        let len = u32::from_le_bytes(header) as usize;
        if len < 4 {
            return Err(short_read("length"));
        }

        let mut payload = vec![0u8; len - 4];
        let n = set.read(self.tape, &mut payload)?;
        if n < payload.len() {
            return Err(short_read("tuple"));
        }
        drop(set);

        let row = decode_row(&payload)?;
        Ok(Some((hash, row)))
    }

    /// Release the batch's tape early.
    pub fn close(&self) -> Result<()> {
        self.tape_set.lock().close_tape(self.tape)
    }
}

fn short_read(what: &str) -> GroupExecError {
    GroupExecError::with_kind(
        format!("Unexpected end of spill tape reading {what}"),
        ErrorKind::Io,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use groupexec_row::datum::Datum;

    fn row(k: i64, v: i64) -> Row {
        [Datum::Int64(k), Datum::Int64(v)].into_iter().collect()
    }

    #[test]
    fn partition_count_is_power_of_two_within_bounds() {
        let spill = SpillPartitions::init(None, 0, 1_000_000, 64, 64 * 1024).unwrap();
        let n = spill.num_partitions();
        assert!(n.is_power_of_two());
        assert!((HASH_MIN_PARTITIONS..=HASH_MAX_PARTITIONS).contains(&n));
        assert_eq!(n, 1 << spill.partition_bits());
    }

    #[test]
    fn partition_bits_truncate_at_hash_width() {
        // 30 bits already consumed leaves a 2-bit window at most.
        let spill = SpillPartitions::init(None, 30, 1_000_000, 64, 1024 * 1024).unwrap();
        assert!(spill.partition_bits() + 30 <= 32);

        // All bits consumed: a single partition with an empty window.
        let spill = SpillPartitions::init(None, 32, 1_000, 64, 1024 * 1024).unwrap();
        assert_eq!(0, spill.partition_bits());
        assert_eq!(1, spill.num_partitions());
    }

    #[test]
    fn high_bits_route_partitions() {
        // partition_bits 2 → the top two bits pick the partition.
        assert_eq!(0, partition_for_hash(0x0000_0000, 0, 2));
        assert_eq!(3, partition_for_hash(0xC000_0000, 0, 2));
        // With 2 input bits consumed, the next window is bits 27..30.
        assert_eq!(1, partition_for_hash(0x1000_0000, 2, 2));
    }

    #[test]
    fn write_finish_read_roundtrip() {
        let mut spill = SpillPartitions::init(None, 0, 10, 64, 1024 * 1024).unwrap();

        let written = spill.write_tuple(0, &row(1, 10), 0x8000_0001, None).unwrap();
        assert!(written > 8);
        spill.write_tuple(0, &row(2, 20), 0x8000_0002, None).unwrap();

        let mut batches = spill.finish(0, 0).unwrap();
        assert_eq!(1, batches.len());
        let batch = &mut batches[0];
        assert_eq!(2, batch.input_tuples);
        assert!(batch.input_bits > 0);

        let (hash, tuple) = batch.read_next().unwrap().unwrap();
        assert_eq!(0x8000_0001, hash);
        assert_eq!(row(1, 10), tuple);

        let (hash, tuple) = batch.read_next().unwrap().unwrap();
        assert_eq!(0x8000_0002, hash);
        assert_eq!(row(2, 20), tuple);

        assert!(batch.read_next().unwrap().is_none());
    }

    #[test]
    fn respill_extends_the_same_tape_set() {
        let mut spill = SpillPartitions::init(None, 0, 10, 64, 1024 * 1024).unwrap();
        spill.write_tuple(0, &row(1, 1), 0x0000_0001, None).unwrap();
        let batches = spill.finish(0, 0).unwrap();
        let batch = &batches[0];

        let tapes_before = batch.tape_set.lock().tape_count();
        let respill = SpillPartitions::init(
            Some(batch.tape_set.clone()),
            batch.input_bits,
            batch.input_tuples,
            64,
            1024 * 1024,
        )
        .unwrap();
        let tapes_after = batch.tape_set.lock().tape_count();

        assert_eq!(
            tapes_before + respill.num_partitions(),
            tapes_after
        );
        // The recursion level consumes a disjoint, later bit window.
        assert!(batch.input_bits + respill.partition_bits() <= 32);
    }

    #[test]
    fn empty_partitions_produce_no_batches() {
        let mut spill = SpillPartitions::init(None, 0, 10, 64, 1024 * 1024).unwrap();
        // Everything lands in one partition.
        spill.write_tuple(0, &row(1, 1), 0, None).unwrap();
        spill.write_tuple(0, &row(2, 2), 0, None).unwrap();

        let batches = spill.finish(0, 0).unwrap();
        assert_eq!(1, batches.len());
    }
}
