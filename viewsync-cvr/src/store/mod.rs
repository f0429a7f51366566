//! Persistent backing for client view records.
//!
//! The store is shared across view-syncer generations but owned at any
//! instant by the holder of the current ownership token; every flush
//! re-verifies the token and fails with `OwnershipLost` when a newer owner
//! has taken over, at which point the losing instance must stop cleanly.

use async_trait::async_trait;
use viewsync_data::{
    ClientGroupId, ClientId, ClientSchema, CvrVersion, QueryId, RowId, StateVersion,
};
use viewsync_errors::SyncResult;

use crate::types::{ClientRecord, CvrSnapshot, QueryRecord, RowRecord, TtlClock};

pub mod memory;
pub mod postgres;

/// Identifies one view-syncer instance's claim on a client group: the task
/// that created it and the wall-clock time of the claiming connection. A
/// newer `last_connect_time` wins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnershipToken {
    /// Stable id of the running task (process/container).
    pub task_id: String,
    /// Wall-clock milliseconds of the connection that claimed ownership.
    pub last_connect_time: u64,
}

/// The write set of one CVR flush. Only touched records appear; the store
/// keeps tombstones for deleted queries and rows so that reconnecting
/// clients can be caught up from any older version.
#[derive(Clone, Debug, PartialEq)]
pub struct CvrFlush {
    /// The version this flush moves the CVR to.
    pub version: CvrVersion,
    /// The replica version the CVR is initialised at.
    pub replica_version: Option<StateVersion>,
    /// The group's client schema, if declared.
    pub client_schema: Option<ClientSchema>,
    /// Upserted client records.
    pub clients: Vec<ClientRecord>,
    /// Deleted client ids.
    pub deleted_clients: Vec<ClientId>,
    /// Upserted query records.
    pub queries: Vec<QueryRecord>,
    /// Queries deleted at `version` (kept as tombstones).
    pub deleted_queries: Vec<QueryId>,
    /// Upserted row records.
    pub rows: Vec<(RowId, RowRecord)>,
    /// Rows deleted at `version` (kept as tombstones).
    pub deleted_rows: Vec<RowId>,
}

impl CvrFlush {
    /// Merge an older (config-driven) write set with a newer (query-driven)
    /// one into a single atomic flush. The newer flush wins on scalars and
    /// on records both touched.
    pub fn merge(older: CvrFlush, newer: CvrFlush) -> CvrFlush {
        let mut merged = older;
        merged.version = newer.version;
        merged.replica_version = newer.replica_version.or(merged.replica_version);
        merged.client_schema = newer.client_schema.or(merged.client_schema);

        for client in newer.clients {
            merged.clients.retain(|c| c.id != client.id);
            merged.clients.push(client);
        }
        merged.deleted_clients.extend(newer.deleted_clients);
        let deleted_clients = merged.deleted_clients.clone();
        merged.clients.retain(|c| !deleted_clients.contains(&c.id));

        for query in newer.queries {
            merged.queries.retain(|q| q.id != query.id);
            merged.queries.push(query);
        }
        merged.deleted_queries.extend(newer.deleted_queries);
        let deleted_queries = merged.deleted_queries.clone();
        merged.queries.retain(|q| !deleted_queries.contains(&q.id));

        merged.rows = newer.rows;
        merged.deleted_rows = newer.deleted_rows;
        merged
    }
}

/// A historical row-state entry used for client catch-up: either a live
/// record (put) or a tombstone (del).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowCatchup {
    /// The row.
    pub id: RowId,
    /// The record as of its `patch_version`; empty refcounts mean the row
    /// was deleted.
    pub record: RowRecord,
}

/// The persistent CVR backing store.
#[async_trait]
pub trait CvrStore: Send + Sync {
    /// Load (or create) the CVR for a client group, claiming ownership with
    /// `token`. An existing claim with a newer `last_connect_time` wins and
    /// this load fails with `OwnershipLost`.
    async fn load(
        &self,
        client_group_id: &ClientGroupId,
        token: &OwnershipToken,
    ) -> SyncResult<CvrSnapshot>;

    /// Atomically apply a flush. Fails with `OwnershipLost` if `token` no
    /// longer owns the group; no writes are applied in that case.
    async fn flush(
        &self,
        client_group_id: &ClientGroupId,
        token: &OwnershipToken,
        flush: CvrFlush,
        ttl_clock: TtlClock,
        last_active: u64,
    ) -> SyncResult<()>;

    /// Persist only the TTL clock and activity time (the periodic clock
    /// flush and the disconnect flush). Subject to the same ownership check.
    async fn touch(
        &self,
        client_group_id: &ClientGroupId,
        token: &OwnershipToken,
        ttl_clock: TtlClock,
        last_active: u64,
    ) -> SyncResult<()>;

    /// Row states (including tombstones) with `after < patch_version <=
    /// upto`, for catching up a client whose base cookie is behind.
    async fn catchup_rows(
        &self,
        client_group_id: &ClientGroupId,
        after: &CvrVersion,
        upto: &CvrVersion,
    ) -> SyncResult<Vec<RowCatchup>>;

    /// Query records (including tombstones) with `after < patch_version <=
    /// upto`, used to replay got-query changes to a lagging client.
    async fn catchup_queries(
        &self,
        client_group_id: &ClientGroupId,
        after: &CvrVersion,
        upto: &CvrVersion,
    ) -> SyncResult<Vec<(QueryRecord, bool)>>;
}
