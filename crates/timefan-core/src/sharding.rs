//! Jump-Consistent Shard Routing
//!
//! Stateless mapping from a 64-bit series hash to a shard index, using
//! Lamport's jump-consistent hash. Two properties the write path relies on:
//!
//! - **Deterministic**: any broker computes the same shard for the same hash,
//!   so routing needs no shared table
//! - **Bounded re-mapping**: growing from N to N+1 shards moves only ~1/(N+1)
//!   of the keys; all moved keys land on the new shard

use crate::models::ShardId;

/// Maps `key` to a bucket in `[0, num_buckets)`.
///
/// `num_buckets` of zero is treated as one bucket so a misconfigured caller
/// degrades to single-shard routing instead of panicking.
pub fn jump_consistent_hash(key: u64, num_buckets: u32) -> ShardId {
    let buckets = num_buckets.max(1) as i64;
    let mut key = key;
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b.wrapping_add(1) as f64) * ((1u64 << 31) as f64 / ((key >> 33).wrapping_add(1) as f64)))
            as i64;
    }
    b as ShardId
}
