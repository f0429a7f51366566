//! The upstream contract: an opaque source of replica snapshots and ordered
//! table diffs between them, keyed by a monotonic state version.

use std::fmt;
use std::sync::Arc;

use viewsync_data::{Row, RowKey, StateVersion};
use viewsync_errors::{ResetPipelinesSignal, SyncResult};

use crate::source::SnapshotReader;

pub mod memory;

/// A read snapshot of the replica at one state version.
#[derive(Clone)]
pub struct Snapshot {
    /// The state version of the snapshot.
    pub version: StateVersion,
    /// Read access to the snapshot's tables.
    pub reader: Arc<dyn SnapshotReader>,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("version", &self.version)
            .finish()
    }
}

/// One changed row between two consecutive snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableDiff {
    /// The changed table.
    pub table: String,
    /// The union-key identity of the changed row.
    pub row_key: RowKey,
    /// The row before the change; `None` for inserts.
    pub prev: Option<Row>,
    /// The row after the change; `None` for deletes.
    pub next: Option<Row>,
}

/// The ordered diff from one snapshot to the next.
#[derive(Debug)]
pub struct ReplicaDiff {
    /// The version advanced from.
    pub prev: StateVersion,
    /// The snapshot advanced to.
    pub curr: Snapshot,
    /// All row changes, in replication order.
    pub changes: Vec<TableDiff>,
}

/// What [`ReplicaSnapshotter::advance`] produced.
#[derive(Debug)]
pub enum DiffOutcome {
    /// The replica advanced; apply these changes.
    Diff(ReplicaDiff),
    /// The diff cannot be expressed incrementally (e.g. a schema change);
    /// pipelines must be rebuilt against a fresh snapshot.
    ResetRequired(ResetPipelinesSignal),
}

/// The source of replica snapshots and diffs for one client group.
///
/// Implementations wrap the actual replication machinery (which is an
/// external collaborator); the pipeline driver only consumes this interface.
pub trait ReplicaSnapshotter: Send {
    /// Attach to the current snapshot.
    fn init(&mut self) -> SyncResult<Snapshot>;

    /// Advance one step and describe what changed.
    fn advance(&mut self) -> SyncResult<DiffOutcome>;

    /// Fast-forward to the current snapshot without computing diffs. Used
    /// when a fresh hydrate will follow anyway.
    fn advance_without_diff(&mut self) -> SyncResult<Snapshot>;

    /// The version at which this replica was initialised. Opaque and totally
    /// ordered; CVRs created against this replica must never be ahead of it.
    fn replica_version(&self) -> StateVersion;

    /// The state version of the snapshot the snapshotter is currently at.
    fn current_version(&self) -> StateVersion;
}
