//! An in-process CVR store for tests and single-process deployments.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use viewsync_data::{ClientGroupId, CvrVersion, QueryId, RowId};
use viewsync_errors::{SyncError, SyncResult};

use crate::store::{CvrFlush, CvrStore, OwnershipToken, RowCatchup};
use crate::types::{CvrSnapshot, QueryRecord, RowRecord, TtlClock};

#[derive(Clone, Debug)]
struct StoredGroup {
    owner: OwnershipToken,
    snapshot: CvrSnapshot,
    /// Tombstones for deleted rows, keyed by row id, valued by the version
    /// at which they were deleted.
    row_tombstones: BTreeMap<RowId, CvrVersion>,
    /// Tombstones for deleted queries.
    query_tombstones: BTreeMap<QueryId, (QueryRecord, CvrVersion)>,
}

/// A [`CvrStore`] holding everything in memory, with full catch-up history
/// via tombstones.
#[derive(Debug, Default)]
pub struct MemoryCvrStore {
    groups: Mutex<HashMap<ClientGroupId, StoredGroup>>,
}

impl MemoryCvrStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_owner(group: &StoredGroup, token: &OwnershipToken) -> SyncResult<()> {
        if group.owner != *token {
            return Err(SyncError::OwnershipLost {
                client_group_id: group.snapshot.client_group_id.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CvrStore for MemoryCvrStore {
    async fn load(
        &self,
        client_group_id: &ClientGroupId,
        token: &OwnershipToken,
    ) -> SyncResult<CvrSnapshot> {
        let mut groups = self.groups.lock();
        match groups.get_mut(client_group_id) {
            None => {
                let snapshot = CvrSnapshot::new(client_group_id.clone());
                groups.insert(
                    client_group_id.clone(),
                    StoredGroup {
                        owner: token.clone(),
                        snapshot: snapshot.clone(),
                        row_tombstones: BTreeMap::new(),
                        query_tombstones: BTreeMap::new(),
                    },
                );
                Ok(snapshot)
            }
            Some(group) => {
                if group.owner.last_connect_time > token.last_connect_time {
                    return Err(SyncError::OwnershipLost {
                        client_group_id: client_group_id.clone(),
                    });
                }
                group.owner = token.clone();
                Ok(group.snapshot.clone())
            }
        }
    }

    async fn flush(
        &self,
        client_group_id: &ClientGroupId,
        token: &OwnershipToken,
        flush: CvrFlush,
        ttl_clock: TtlClock,
        last_active: u64,
    ) -> SyncResult<()> {
        let mut groups = self.groups.lock();
        let group = groups
            .get_mut(client_group_id)
            .ok_or_else(|| SyncError::Storage(format!("unknown client group {client_group_id}")))?;
        Self::check_owner(group, token)?;

        let snapshot = &mut group.snapshot;
        snapshot.version = flush.version.clone();
        snapshot.replica_version = flush.replica_version.clone();
        if flush.client_schema.is_some() {
            snapshot.client_schema = flush.client_schema.clone();
        }
        snapshot.ttl_clock = ttl_clock;
        snapshot.last_active = last_active;

        for client in flush.clients {
            snapshot.clients.insert(client.id.clone(), client);
        }
        for client_id in flush.deleted_clients {
            snapshot.clients.remove(&client_id);
        }
        for query in flush.queries {
            group.query_tombstones.remove(&query.id);
            snapshot.queries.insert(query.id.clone(), query);
        }
        for query_id in flush.deleted_queries {
            if let Some(record) = snapshot.queries.remove(&query_id) {
                group
                    .query_tombstones
                    .insert(query_id, (record, flush.version.clone()));
            }
        }
        for (row_id, record) in flush.rows {
            group.row_tombstones.remove(&row_id);
            snapshot.rows.insert(row_id, record);
        }
        for row_id in flush.deleted_rows {
            snapshot.rows.remove(&row_id);
            group.row_tombstones.insert(row_id, flush.version.clone());
        }
        Ok(())
    }

    async fn touch(
        &self,
        client_group_id: &ClientGroupId,
        token: &OwnershipToken,
        ttl_clock: TtlClock,
        last_active: u64,
    ) -> SyncResult<()> {
        let mut groups = self.groups.lock();
        let group = groups
            .get_mut(client_group_id)
            .ok_or_else(|| SyncError::Storage(format!("unknown client group {client_group_id}")))?;
        Self::check_owner(group, token)?;
        group.snapshot.ttl_clock = ttl_clock;
        group.snapshot.last_active = last_active;
        Ok(())
    }

    async fn catchup_rows(
        &self,
        client_group_id: &ClientGroupId,
        after: &CvrVersion,
        upto: &CvrVersion,
    ) -> SyncResult<Vec<RowCatchup>> {
        let groups = self.groups.lock();
        let Some(group) = groups.get(client_group_id) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (row_id, record) in &group.snapshot.rows {
            if record.patch_version > *after && record.patch_version <= *upto {
                out.push(RowCatchup {
                    id: row_id.clone(),
                    record: record.clone(),
                });
            }
        }
        for (row_id, deleted_at) in &group.row_tombstones {
            if *deleted_at > *after && *deleted_at <= *upto {
                out.push(RowCatchup {
                    id: row_id.clone(),
                    record: RowRecord {
                        patch_version: deleted_at.clone(),
                        ref_counts: BTreeMap::new(),
                    },
                });
            }
        }
        Ok(out)
    }

    async fn catchup_queries(
        &self,
        client_group_id: &ClientGroupId,
        after: &CvrVersion,
        upto: &CvrVersion,
    ) -> SyncResult<Vec<(QueryRecord, bool)>> {
        let groups = self.groups.lock();
        let Some(group) = groups.get(client_group_id) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for record in group.snapshot.queries.values() {
            if let Some(pv) = &record.patch_version {
                if *pv > *after && *pv <= *upto {
                    out.push((record.clone(), false));
                }
            }
        }
        for (record, deleted_at) in group.query_tombstones.values() {
            if *deleted_at > *after && *deleted_at <= *upto {
                out.push((record.clone(), true));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use viewsync_data::{RowKey, StateVersion};

    use super::*;

    fn token(task: &str, connect: u64) -> OwnershipToken {
        OwnershipToken {
            task_id: task.to_owned(),
            last_connect_time: connect,
        }
    }

    fn flush_at(version: &str) -> CvrFlush {
        CvrFlush {
            version: version.parse().unwrap(),
            replica_version: Some(StateVersion::new("00")),
            client_schema: None,
            clients: Vec::new(),
            deleted_clients: Vec::new(),
            queries: Vec::new(),
            deleted_queries: Vec::new(),
            rows: Vec::new(),
            deleted_rows: Vec::new(),
        }
    }

    #[tokio::test]
    async fn load_creates_then_reloads() {
        let store = MemoryCvrStore::new();
        let group = "g1".to_owned();
        let snapshot = store.load(&group, &token("t1", 1)).await.unwrap();
        assert!(snapshot.is_empty());

        store
            .flush(&group, &token("t1", 1), flush_at("01"), TtlClock::ZERO, 5)
            .await
            .unwrap();
        let reloaded = store.load(&group, &token("t1", 2)).await.unwrap();
        assert_eq!(reloaded.version.cookie(), "01");
        assert_eq!(reloaded.last_active, 5);
    }

    #[tokio::test]
    async fn newer_owner_wins_and_older_flush_fails() {
        let store = MemoryCvrStore::new();
        let group = "g1".to_owned();
        let first = token("t1", 100);
        let second = token("t2", 200);
        store.load(&group, &first).await.unwrap();
        // A second instance connects later and takes over.
        store.load(&group, &second).await.unwrap();

        let err = store
            .flush(&group, &first, flush_at("01"), TtlClock::ZERO, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::OwnershipLost { .. }));

        store
            .flush(&group, &second, flush_at("01"), TtlClock::ZERO, 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_load_is_rejected() {
        let store = MemoryCvrStore::new();
        let group = "g1".to_owned();
        store.load(&group, &token("t2", 200)).await.unwrap();
        let err = store.load(&group, &token("t1", 100)).await.unwrap_err();
        assert!(matches!(err, SyncError::OwnershipLost { .. }));
    }

    #[tokio::test]
    async fn catchup_rows_include_tombstones() {
        let store = MemoryCvrStore::new();
        let group = "g1".to_owned();
        let owner = token("t1", 1);
        store.load(&group, &owner).await.unwrap();

        let live = RowId::new("", "issue", RowKey::from_iter([("id", 1i64)]));
        let dead = RowId::new("", "issue", RowKey::from_iter([("id", 2i64)]));
        let mut flush = flush_at("02");
        flush.rows = vec![(
            live.clone(),
            RowRecord {
                patch_version: "02".parse().unwrap(),
                ref_counts: [(QueryId::from("q1"), 1i64)].into(),
            },
        )];
        flush.deleted_rows = vec![dead.clone()];
        store
            .flush(&group, &owner, flush, TtlClock::ZERO, 0)
            .await
            .unwrap();

        let catchup = store
            .catchup_rows(&group, &"01".parse().unwrap(), &"02".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(catchup.len(), 2);
        let dead_entry = catchup.iter().find(|c| c.id == dead).unwrap();
        assert!(!dead_entry.record.is_referenced());
        let live_entry = catchup.iter().find(|c| c.id == live).unwrap();
        assert!(live_entry.record.is_referenced());

        // Nothing to catch up for a client already at 02.
        let none = store
            .catchup_rows(&group, &"02".parse().unwrap(), &"02".parse().unwrap())
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
