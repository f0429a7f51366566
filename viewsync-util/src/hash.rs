//! Stable 64-bit hashing for query deduplication and identity.
//!
//! All hashes produced here use xxh3, so they are stable across processes and
//! across restarts. Do not swap the hasher without migrating persisted state
//! that embeds these hashes.

use std::hash::{Hash, Hasher};

use xxhash_rust::xxh3::Xxh3;

/// Hash any hashable value with xxh3.
pub fn hash<T: Hash + ?Sized>(t: &T) -> u64 {
    let mut hasher = Xxh3::new();
    t.hash(&mut hasher);
    hasher.finish()
}

/// Hash a byte slice directly with xxh3, without going through [`Hash`].
///
/// Use this for canonical serialized forms (e.g. canonical JSON), where the
/// bytes themselves are the identity.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}
