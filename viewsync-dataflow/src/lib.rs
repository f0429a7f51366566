//! Incremental view maintenance for viewsync.
//!
//! This crate turns transformed query ASTs into [`Pipeline`]s — arenas of
//! IVM operators — and drives them against replica snapshots: the
//! [`PipelineDriver`] hydrates new queries with an initial fetch and then
//! maintains every pipeline incrementally as the replica advances, emitting
//! [`RowChange`]s that the CVR layer turns into client patches.

pub mod replica;

mod driver;
mod ops;
mod ordering;
mod pipeline;
mod source;
mod storage;
mod types;

pub use driver::{
    AdvanceOutcome, Advancement, PipelineDriver, ADVANCE_PROGRESS_CHECK_EVERY,
};
pub use pipeline::{EvalContext, OpId, Pipeline};
pub use replica::{DiffOutcome, ReplicaDiff, ReplicaSnapshotter, Snapshot, TableDiff};
pub use source::{SnapshotReader, TableSource};
pub use storage::ClientGroupStorage;
pub use types::{Constraint, FetchRequest, RowChange, SourceChange};
