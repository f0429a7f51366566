//! Client view records (CVRs).
//!
//! A CVR is the persisted description of exactly what one client group has
//! synced: its clients, its queries (with TTL state), and a refcount per
//! `(query, row)` pair. The view syncer mutates it only through the updaters
//! in this crate, and flushes are guarded by an ownership token so that two
//! syncer generations can never corrupt the same group.

pub mod store;

mod types;
mod updater;

pub use store::memory::MemoryCvrStore;
pub use store::postgres::PostgresCvrStore;
pub use store::{CvrFlush, CvrStore, OwnershipToken, RowCatchup};
pub use types::{
    clamp_ttl, ClientQueryState, ClientRecord, CvrSnapshot, Patch, PatchToVersion, QueryKind,
    QueryRecord, RowRecord, TtlClock, MAX_TTL_MS,
};
pub use updater::{CvrConfigDrivenUpdater, CvrQueryDrivenUpdater};
