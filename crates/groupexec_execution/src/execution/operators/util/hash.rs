use ahash::RandomState;
use groupexec_row::datum::Datum;

/// State used for all grouping-hash computation.
///
/// Seeds are fixed so that a value hashes identically on every call; the
/// spill machinery depends on re-hashing spilled tuples to the same 32-bit
/// value on reload.
pub const HASH_RANDOM_STATE: RandomState = RandomState::with_seeds(0, 0, 0, 0);

/// Hash a sequence of nullable grouping datums into the executor's 32-bit
/// grouping hash.
///
/// The spill partitioner consumes this hash from the high-order bit down, so
/// the fold keeps the full 64-bit mixing in both halves.
pub fn hash_group_columns<'a>(columns: impl Iterator<Item = &'a Option<Datum>>) -> u32 {
    let mut hash = 0u64;
    for (idx, col) in columns.enumerate() {
        let col_hash = hash_nullable_datum(col);
        hash = if idx == 0 {
            col_hash
        } else {
            combine_hashes(col_hash, hash)
        };
    }
    ((hash >> 32) as u32) ^ (hash as u32)
}

fn hash_nullable_datum(datum: &Option<Datum>) -> u64 {
    match datum {
        Some(d) => hash_datum(d),
        None => null_hash_value(),
    }
}

fn hash_datum(datum: &Datum) -> u64 {
    match datum {
        Datum::Boolean(v) => HASH_RANDOM_STATE.hash_one(v),
        Datum::Int32(v) => HASH_RANDOM_STATE.hash_one(v),
        Datum::Int64(v) => HASH_RANDOM_STATE.hash_one(v),
        // Floats don't implement Hash; hash the bit pattern.
        Datum::Float64(v) => HASH_RANDOM_STATE.hash_one(v.to_ne_bytes()),
        Datum::Utf8(v) => HASH_RANDOM_STATE.hash_one(v.as_str()),
        Datum::Binary(v) => HASH_RANDOM_STATE.hash_one(v.as_slice()),
        Datum::List(elems) | Datum::Struct(elems) => {
            let mut hash = HASH_RANDOM_STATE.hash_one(elems.len());
            for elem in elems {
                hash = combine_hashes(hash_nullable_datum(elem), hash);
            }
            hash
        }
    }
}

/// Combines two hashes into one hash.
const fn combine_hashes(l: u64, r: u64) -> u64 {
    let hash = (17 * 37u64).wrapping_add(l);
    hash.wrapping_mul(37).wrapping_add(r)
}

/// All nulls hash to the same value.
///
/// _What_ that value is is arbitrary, but it needs to be consistent.
fn null_hash_value() -> u64 {
    HASH_RANDOM_STATE.hash_one(1u64)
}
