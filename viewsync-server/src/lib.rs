//! The view syncer: the stateful per-client-group service that keeps client
//! replicas consistent with the upstream database.
//!
//! One [`ViewSyncer`] exists per client group. It compiles the group's
//! declarative queries into IVM pipelines (via `viewsync-dataflow`),
//! maintains the group's persisted client view record (via `viewsync-cvr`),
//! and streams minimal ordered patch sequences — *pokes* — to every
//! connected client as the replica advances and as queries are added,
//! removed, or expire.

pub mod config;
pub mod ttl;

mod client;
mod poker;
mod view_syncer;

pub use client::{ClientHandler, DOWNSTREAM_BUFFER};
pub use config::Options;
pub use poker::{PokeHandler, PATCHES_PER_PART};
pub use view_syncer::{AuthToken, ViewSyncer, ViewSyncerOptions, CVR_ROW_BATCH};
