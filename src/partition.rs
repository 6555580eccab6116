//! Deterministic principal-to-partition hashing.
//!
//! The partition space is fixed at deployment time; it exists so that
//! horizontal sharding never requires a data migration. A single-instance
//! deployment still stamps every aggregate row with its partition.

/// Fixed number of logical partitions. A capacity decision, not a scaling
/// decision; never changes after the first deployment.
pub const PARTITION_COUNT: u32 = 256;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Maps a principal to its partition. Stable and deterministic: the same
/// principal always lands on the same partition. FNV-1a, same as the
/// write-side key, so read queries always match flushed rows.
pub fn partition_for(principal_id: &str) -> i64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in principal_id.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    i64::from(hash % PARTITION_COUNT)
}
