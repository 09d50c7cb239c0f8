//! Grouping hash table: open-addressed entry array over densely stored
//! groups, each group holding its representative key and one state slot per
//! transition descriptor.

use std::mem;

use groupexec_error::{GroupExecError, Result};
use groupexec_row::row::Row;
use groupexec_row::sort::grouping_eq;

use super::trans::GroupState;
use crate::arena::Arena;

const LOAD_FACTOR: f64 = 0.75;

const EMPTY: u32 = u32::MAX;

/// One slot in the probe array: the full hash plus the index of the group it
/// points at.
#[derive(Debug, Clone, Copy)]
struct EntryKey {
    hash: u32,
    group_idx: u32,
}

impl EntryKey {
    const fn empty() -> Self {
        EntryKey {
            hash: 0,
            group_idx: EMPTY,
        }
    }

    const fn is_empty(&self) -> bool {
        self.group_idx == EMPTY
    }
}

/// A group resident in the table.
#[derive(Debug)]
pub struct GroupEntry {
    pub hash: u32,
    /// Representative grouping-key values, in the grouping set's column
    /// order.
    pub key: Row,
    /// One state per transition descriptor.
    pub states: Vec<GroupState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupResult {
    pub group_idx: usize,
    pub is_new: bool,
}

#[derive(Debug)]
pub struct GroupHashTable {
    entries: Vec<EntryKey>,
    groups: Vec<GroupEntry>,
    num_occupied: usize,
}

/// Pick an initial bucket count: the lowest power of two covering the group
/// estimate without the bucket array itself blowing the memory budget.
pub fn choose_num_buckets(ngroups_hint: u64, mem_limit: usize, entry_size: usize) -> usize {
    let max_buckets = (mem_limit / entry_size.max(1)).max(2);

    let mut nbuckets: usize = 2;
    while (nbuckets as u64) < ngroups_hint && nbuckets < max_buckets {
        nbuckets <<= 1;
    }
    if nbuckets > max_buckets && nbuckets > 2 {
        nbuckets >>= 1;
    }
    nbuckets.next_power_of_two()
}

impl GroupHashTable {
    pub fn new(nbuckets: usize, arena: &Arena) -> Self {
        let capacity = nbuckets.next_power_of_two().max(2);
        arena.charge(capacity * mem::size_of::<EntryKey>());
        GroupHashTable {
            entries: vec![EntryKey::empty(); capacity],
            groups: Vec::new(),
            num_occupied: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group(&self, idx: usize) -> &GroupEntry {
        &self.groups[idx]
    }

    pub fn group_mut(&mut self, idx: usize) -> &mut GroupEntry {
        &mut self.groups[idx]
    }

    /// Find the group for `key`, creating it when absent and allowed.
    ///
    /// `allow_new = false` is the "no new groups" mode entered under memory
    /// pressure: an existing group is returned, a miss yields `None` and the
    /// caller spills the tuple.
    ///
    /// New groups charge their key and state footprint to `arena`; the probe
    /// array's growth is charged there too, so polling the arena sees the
    /// table's full footprint.
    pub fn find_or_create(
        &mut self,
        key: &Row,
        hash: u32,
        allow_new: bool,
        init_states: impl FnOnce() -> Vec<GroupState>,
        arena: &Arena,
    ) -> Result<Option<LookupResult>> {
        if allow_new {
            self.resize_if_needed(1, arena)?;
        }

        let cap = self.capacity();
        let mask = cap - 1;
        let mut offset = hash as usize & mask;
        let mut iter_count = 0;

        loop {
            let ent = self.entries[offset];

            if ent.is_empty() {
                if !allow_new {
                    return Ok(None);
                }

                let group_idx = self.groups.len();
                let states = init_states();
                arena.charge(
                    key.heap_size()
                        + mem::size_of::<GroupEntry>()
                        + states.len() * mem::size_of::<GroupState>(),
                );
                self.groups.push(GroupEntry {
                    hash,
                    key: key.clone(),
                    states,
                });
                self.entries[offset] = EntryKey {
                    hash,
                    group_idx: group_idx as u32,
                };
                self.num_occupied += 1;

                return Ok(Some(LookupResult {
                    group_idx,
                    is_new: true,
                }));
            }

            if ent.hash == hash {
                let group = &self.groups[ent.group_idx as usize];
                let equal = group.key.num_columns() == key.num_columns()
                    && group
                        .key
                        .columns
                        .iter()
                        .zip(key.columns.iter())
                        .all(|(a, b)| grouping_eq(a, b));
                if equal {
                    return Ok(Some(LookupResult {
                        group_idx: ent.group_idx as usize,
                        is_new: false,
                    }));
                }
            }

            offset = (offset + 1) & mask;

            if iter_count > cap {
                // The table is resized ahead of inserts, so a full wrap means
                // an accounting bug rather than a full table.
                return Err(GroupExecError::new("Hash table completely full"));
            }
            iter_count += 1;
        }
    }

    fn resize_if_needed(&mut self, num_inputs: usize, arena: &Arena) -> Result<()> {
        let possible_occupied = num_inputs + self.num_occupied;

        let mut new_capacity = self.capacity();
        while (possible_occupied as f64) / (new_capacity as f64) >= LOAD_FACTOR {
            new_capacity *= 2;
        }

        if new_capacity != self.capacity() {
            self.resize(new_capacity, arena)?;
        }

        Ok(())
    }

    fn resize(&mut self, new_capacity: usize, arena: &Arena) -> Result<()> {
        if new_capacity < self.capacity() {
            return Err(GroupExecError::new("Cannot reduce capacity"));
        }

        arena.charge((new_capacity - self.capacity()) * mem::size_of::<EntryKey>());

        let mask = new_capacity - 1;
        let mut new_entries = vec![EntryKey::empty(); new_capacity];

        for ent in self.entries.drain(..) {
            if ent.is_empty() {
                continue;
            }
            let mut offset = ent.hash as usize & mask;
            while !new_entries[offset].is_empty() {
                offset = (offset + 1) & mask;
            }
            new_entries[offset] = ent;
        }

        self.entries = new_entries;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groupexec_row::datum::Datum;

    fn key(v: i64) -> Row {
        [Datum::Int64(v)].into_iter().collect()
    }

    fn no_states() -> Vec<GroupState> {
        Vec::new()
    }

    #[test]
    fn insert_and_find() {
        let arena = Arena::new("hash");
        let mut table = GroupHashTable::new(16, &arena);

        let first = table
            .find_or_create(&key(1), 4, true, no_states, &arena)
            .unwrap()
            .unwrap();
        assert!(first.is_new);

        let again = table
            .find_or_create(&key(1), 4, true, no_states, &arena)
            .unwrap()
            .unwrap();
        assert!(!again.is_new);
        assert_eq!(first.group_idx, again.group_idx);

        assert_eq!(1, table.num_groups());
    }

    #[test]
    fn hash_collisions_stay_distinct() {
        let arena = Arena::new("hash");
        let mut table = GroupHashTable::new(16, &arena);

        // Same hash for three different keys.
        for v in [1, 2, 3] {
            table
                .find_or_create(&key(v), 44, true, no_states, &arena)
                .unwrap()
                .unwrap();
        }
        assert_eq!(3, table.num_groups());
    }

    #[test]
    fn grows_past_initial_capacity() {
        let arena = Arena::new("hash");
        let mut table = GroupHashTable::new(2, &arena);

        for v in 0..33 {
            table
                .find_or_create(&key(v), 44, true, no_states, &arena)
                .unwrap()
                .unwrap();
        }
        assert_eq!(33, table.num_groups());
        assert!(table.capacity() >= 64);
    }

    #[test]
    fn no_new_groups_mode_reports_misses() {
        let arena = Arena::new("hash");
        let mut table = GroupHashTable::new(16, &arena);

        table
            .find_or_create(&key(1), 4, true, no_states, &arena)
            .unwrap()
            .unwrap();

        let hit = table
            .find_or_create(&key(1), 4, false, no_states, &arena)
            .unwrap();
        assert!(hit.is_some());

        let miss = table
            .find_or_create(&key(2), 5, false, no_states, &arena)
            .unwrap();
        assert_eq!(None, miss);
    }

    #[test]
    fn null_keys_group_together() {
        let arena = Arena::new("hash");
        let mut table = GroupHashTable::new(16, &arena);

        let null_key = Row::nulls(1);
        let first = table
            .find_or_create(&null_key, 9, true, no_states, &arena)
            .unwrap()
            .unwrap();
        let again = table
            .find_or_create(&null_key, 9, true, no_states, &arena)
            .unwrap()
            .unwrap();
        assert!(!again.is_new);
        assert_eq!(first.group_idx, again.group_idx);
    }

    #[test]
    fn bucket_choice_covers_estimate_within_memory() {
        assert_eq!(1024, choose_num_buckets(1000, usize::MAX, 64));
        // Tight memory caps the bucket count.
        assert!(choose_num_buckets(1_000_000, 4096, 64) <= 64);
    }
}
