use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use viewsync_errors::SyncError;

/// A client identifier, unique within its client group.
pub type ClientId = String;

/// A client group identifier. One view syncer instance exists per group.
pub type ClientGroupId = String;

/// The externally visible name of a query within a client group.
///
/// Multiple query ids may resolve (after permission transformation) to the
/// same [`TransformationHash`]; IVM work is deduplicated per hash, while CVR
/// bookkeeping (refcounts, desired-query state) is kept per id.
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct QueryId(String);

impl QueryId {
    /// Wrap a raw query id.
    pub fn new(id: impl Into<String>) -> Self {
        QueryId(id.into())
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QueryId {
    fn from(s: &str) -> Self {
        QueryId(s.to_owned())
    }
}

impl From<String> for QueryId {
    fn from(s: String) -> Self {
        QueryId(s)
    }
}

/// A stable 64-bit hash of a permission-transformed query AST.
///
/// `t1 == t2` **only if** the transformed ASTs are identical, so one IVM
/// pipeline per hash suffices. The hash is computed over the canonical JSON
/// serialization of the transformed AST with xxh3, which is stable across
/// processes; hashes are persisted in the CVR.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct TransformationHash(u64);

impl TransformationHash {
    /// Wrap a raw hash value.
    pub fn new(hash: u64) -> Self {
        TransformationHash(hash)
    }

    /// The raw hash value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransformationHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t_{:016x}", self.0)
    }
}

impl FromStr for TransformationHash {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mk_err = || SyncError::Internal(format!("invalid transformation hash: {s}"));
        Ok(TransformationHash(
            u64::from_str_radix(s.strip_prefix("t_").ok_or_else(mk_err)?, 16)
                .map_err(|_| mk_err())?,
        ))
    }
}
