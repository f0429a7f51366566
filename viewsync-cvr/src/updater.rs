//! CVR updaters: the only way the CVR is mutated.
//!
//! An updater takes a working copy of the [`CvrSnapshot`], accumulates
//! changes, and produces both the patches to include in the outgoing poke and
//! a [`CvrFlush`] describing exactly what to persist. Version bumping is
//! lazy: a flush that applies no externally visible change bumps nothing.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;
use viewsync_ast::SelectAst;
use viewsync_client::{ClientPatch, QueryPatch, RowPatch};
use viewsync_data::{
    ClientId, ClientSchema, CvrVersion, QueryId, RowId, StateVersion, TransformationHash,
};
use viewsync_dataflow::RowChange;
use viewsync_errors::{SyncError, SyncResult};

use crate::store::CvrFlush;
use crate::types::{
    ClientQueryState, ClientRecord, CvrSnapshot, Patch, PatchToVersion, QueryKind, QueryRecord,
    RowRecord, TtlClock,
};

/// Applies configuration changes: clients joining/leaving, desired queries
/// added, removed, or inactivated, client schema declarations.
///
/// Bumps the minor version iff any externally visible change was applied.
#[derive(Debug)]
pub struct CvrConfigDrivenUpdater {
    cvr: CvrSnapshot,
    orig_version: CvrVersion,
    changed: bool,
    patches: Vec<PatchToVersion>,
    touched_clients: BTreeSet<ClientId>,
    deleted_clients: BTreeSet<ClientId>,
    touched_queries: BTreeSet<QueryId>,
}

impl CvrConfigDrivenUpdater {
    /// Start updating a working copy of `cvr`.
    pub fn new(cvr: CvrSnapshot) -> Self {
        let orig_version = cvr.version.clone();
        CvrConfigDrivenUpdater {
            cvr,
            orig_version,
            changed: false,
            patches: Vec::new(),
            touched_clients: BTreeSet::new(),
            deleted_clients: BTreeSet::new(),
            touched_queries: BTreeSet::new(),
        }
    }

    /// The version patches produced so far will move clients to.
    pub fn version(&self) -> &CvrVersion {
        &self.cvr.version
    }

    /// Read access to the working snapshot.
    pub fn cvr(&self) -> &CvrSnapshot {
        &self.cvr
    }

    fn touch(&mut self) -> CvrVersion {
        if !self.changed {
            self.changed = true;
            self.cvr.version = self.orig_version.next_minor();
        }
        self.cvr.version.clone()
    }

    fn push_patch(&mut self, patch: Patch) {
        let to_version = self.touch();
        self.patches.push(PatchToVersion { patch, to_version });
    }

    /// Ensure a client record exists, emitting a client patch when it is new.
    pub fn ensure_client(&mut self, client_id: &ClientId) {
        if self.cvr.clients.contains_key(client_id) {
            return;
        }
        self.cvr.clients.insert(
            client_id.clone(),
            ClientRecord {
                id: client_id.clone(),
                desired: BTreeSet::new(),
            },
        );
        self.touched_clients.insert(client_id.clone());
        self.push_patch(Patch::Client(ClientPatch::Put {
            client_id: client_id.clone(),
        }));
    }

    /// Record the client's expected schema. The schema is immutable per CVR;
    /// declaring a different one is a mismatch.
    pub fn set_client_schema(&mut self, schema: &ClientSchema) -> SyncResult<()> {
        match &self.cvr.client_schema {
            None => {
                self.cvr.client_schema = Some(schema.clone());
                Ok(())
            }
            Some(existing) if existing == schema => Ok(()),
            Some(_) => Err(SyncError::ClientSchemaMismatch(
                "client schema differs from the schema this client group was created with".into(),
            )),
        }
    }

    /// Add or re-activate a desired query for a client.
    pub fn put_desired_query(
        &mut self,
        client_id: &ClientId,
        query_id: &QueryId,
        ast: Option<&SelectAst>,
        name: Option<&str>,
        args: Option<&serde_json::Value>,
        ttl: Option<u64>,
    ) -> SyncResult<()> {
        self.ensure_client(client_id);
        let kind = match (ast, name) {
            (Some(ast), None) => QueryKind::Client { ast: ast.clone() },
            (None, Some(name)) => QueryKind::Custom {
                name: name.to_owned(),
                args: args.cloned().unwrap_or(serde_json::Value::Null),
            },
            _ => {
                return Err(SyncError::InvalidQuery(format!(
                    "desired query {query_id} must carry exactly one of ast or name"
                )))
            }
        };

        let record = self
            .cvr
            .queries
            .entry(query_id.clone())
            .or_insert_with(|| QueryRecord {
                id: query_id.clone(),
                kind,
                client_state: BTreeMap::new(),
                transformation_hash: None,
                patch_version: None,
            });
        let new_state = ClientQueryState {
            ttl,
            inactivated_at: None,
        };
        let state_changed = record.client_state.get(client_id) != Some(&new_state);
        record.client_state.insert(client_id.clone(), new_state);

        let client = self
            .cvr
            .clients
            .get_mut(client_id)
            .expect("ensure_client inserted the record");
        let newly_desired = client.desired.insert(query_id.clone());

        if state_changed || newly_desired {
            self.touched_queries.insert(query_id.clone());
            self.touched_clients.insert(client_id.clone());
            self.push_patch(Patch::DesiredQuery {
                client_id: client_id.clone(),
                patch: QueryPatch::Put {
                    hash: query_id.clone(),
                    ast: ast.cloned(),
                    name: name.map(str::to_owned),
                    args: args.cloned(),
                    ttl,
                },
            });
        }
        Ok(())
    }

    /// Inactivate a desired query for a client: the query starts aging on
    /// the TTL clock but its rows stay synced until it expires.
    pub fn del_desired_query(&mut self, client_id: &ClientId, query_id: &QueryId, now: TtlClock) {
        let Some(record) = self.cvr.queries.get_mut(query_id) else {
            return;
        };
        let Some(state) = record.client_state.get_mut(client_id) else {
            return;
        };
        if state.inactivated_at.is_some() {
            return;
        }
        state.inactivated_at = Some(now);
        if let Some(client) = self.cvr.clients.get_mut(client_id) {
            client.desired.remove(query_id);
        }
        self.touched_queries.insert(query_id.clone());
        self.touched_clients.insert(client_id.clone());
        self.push_patch(Patch::DesiredQuery {
            client_id: client_id.clone(),
            patch: QueryPatch::Del {
                hash: query_id.clone(),
            },
        });
    }

    /// Inactivate every desired query of a client.
    pub fn clear_desired_queries(&mut self, client_id: &ClientId, now: TtlClock) {
        let query_ids: Vec<QueryId> = self
            .cvr
            .clients
            .get(client_id)
            .map(|c| c.desired.iter().cloned().collect())
            .unwrap_or_default();
        for query_id in query_ids {
            self.del_desired_query(client_id, &query_id, now);
        }
    }

    /// Delete clients outright: their records go away and their desired
    /// queries are inactivated so the TTL clock can reap them.
    pub fn delete_clients(&mut self, client_ids: &[ClientId], now: TtlClock) -> Vec<ClientId> {
        let mut deleted = Vec::new();
        for client_id in client_ids {
            if !self.cvr.clients.contains_key(client_id) {
                continue;
            }
            self.clear_desired_queries(client_id, now);
            for (query_id, record) in self.cvr.queries.iter_mut() {
                if record.client_state.remove(client_id).is_some() {
                    self.touched_queries.insert(query_id.clone());
                }
            }
            self.cvr.clients.remove(client_id);
            self.deleted_clients.insert(client_id.clone());
            self.touched_clients.remove(client_id);
            self.push_patch(Patch::Client(ClientPatch::Del {
                client_id: client_id.clone(),
            }));
            deleted.push(client_id.clone());
        }
        deleted
    }

    /// Inactivate the desired queries of every client not named in `active`.
    /// Used when a connection declares the set of live clients of its group.
    pub fn inactivate_clients_outside(&mut self, active: &BTreeSet<ClientId>, now: TtlClock) {
        let absent: Vec<ClientId> = self
            .cvr
            .clients
            .keys()
            .filter(|id| !active.contains(*id))
            .cloned()
            .collect();
        for client_id in absent {
            self.clear_desired_queries(&client_id, now);
        }
    }

    /// Finish: the updated snapshot, what to persist, and the patches for the
    /// outgoing poke. `flush` is `None` when nothing visible changed.
    pub fn done(self) -> (CvrSnapshot, Option<CvrFlush>, Vec<PatchToVersion>) {
        if !self.changed {
            return (self.cvr, None, Vec::new());
        }
        let flush = CvrFlush {
            version: self.cvr.version.clone(),
            replica_version: self.cvr.replica_version.clone(),
            client_schema: self.cvr.client_schema.clone(),
            clients: self
                .touched_clients
                .iter()
                .filter_map(|id| self.cvr.clients.get(id).cloned())
                .collect(),
            deleted_clients: self.deleted_clients.iter().cloned().collect(),
            queries: self
                .touched_queries
                .iter()
                .filter_map(|id| self.cvr.queries.get(id).cloned())
                .collect(),
            deleted_queries: Vec::new(),
            rows: Vec::new(),
            deleted_rows: Vec::new(),
        };
        (self.cvr, Some(flush), self.patches)
    }
}

/// Accumulates row updates during hydration or advancement, maintaining
/// per-query refcounts and emitting row patches on presence toggles.
#[derive(Debug)]
pub struct CvrQueryDrivenUpdater {
    cvr: CvrSnapshot,
    orig_version: CvrVersion,
    /// The version may never move below this (unflushed config-driven bumps
    /// already applied to the working snapshot).
    floor: CvrVersion,
    target_state_version: StateVersion,
    changed: bool,
    /// hash → query ids, for resolving pipeline row changes to refcounts.
    hash_to_queries: BTreeMap<TransformationHash, Vec<QueryId>>,
    /// Rows whose refcounts were touched this cycle; candidates for
    /// unreferenced-row deletion and flush upserts.
    touched_rows: BTreeSet<RowId>,
    touched_queries: BTreeSet<QueryId>,
    removed_queries: BTreeSet<QueryId>,
    deleted_rows: BTreeSet<RowId>,
}

impl CvrQueryDrivenUpdater {
    /// Start a query-driven update that will land the CVR at
    /// `target_state_version`.
    pub fn new(cvr: CvrSnapshot, target_state_version: StateVersion) -> Self {
        let base = cvr.version.clone();
        Self::with_base(cvr, base, target_state_version)
    }

    /// Like [`new`](Self::new), but versioning against `base_version` — the
    /// CVR version before any unflushed config-driven changes — so that a
    /// connect's config bump and its hydration land on one version.
    pub fn with_base(
        cvr: CvrSnapshot,
        base_version: CvrVersion,
        target_state_version: StateVersion,
    ) -> Self {
        let floor = cvr.version.clone();
        CvrQueryDrivenUpdater {
            cvr,
            orig_version: base_version,
            floor,
            target_state_version,
            changed: false,
            hash_to_queries: BTreeMap::new(),
            touched_rows: BTreeSet::new(),
            touched_queries: BTreeSet::new(),
            removed_queries: BTreeSet::new(),
            deleted_rows: BTreeSet::new(),
        }
    }

    /// The version patches produced so far will move clients to.
    pub fn version(&self) -> &CvrVersion {
        &self.cvr.version
    }

    /// Read access to the working snapshot.
    pub fn cvr(&self) -> &CvrSnapshot {
        &self.cvr
    }

    fn touch(&mut self) -> CvrVersion {
        if !self.changed {
            self.changed = true;
            let candidate = self
                .orig_version
                .advance_to(self.target_state_version.clone());
            self.cvr.version = candidate.max(self.floor.clone());
        }
        self.cvr.version.clone()
    }

    /// Record that `query_id` executed (or re-executed) with the given
    /// transformation hash, returning a got-query put patch if the query's
    /// materialization state changed.
    pub fn executed(
        &mut self,
        query_id: &QueryId,
        hash: TransformationHash,
    ) -> Option<PatchToVersion> {
        self.hash_to_queries
            .entry(hash)
            .or_default()
            .push(query_id.clone());
        let record = self.cvr.queries.get_mut(query_id)?;
        let first_materialization = record.patch_version.is_none();
        let hash_changed = record.transformation_hash != Some(hash);
        if !first_materialization && !hash_changed {
            return None;
        }
        record.transformation_hash = Some(hash);
        if hash_changed && !first_materialization {
            // The query re-materializes under a new transformation: its old
            // refcounts are stale and are replaced by the fresh hydration.
            for (row_id, record) in self.cvr.rows.iter_mut() {
                if record.ref_counts.remove(query_id).is_some() {
                    self.touched_rows.insert(row_id.clone());
                }
            }
        }
        self.touched_queries.insert(query_id.clone());
        let to_version = self.touch();
        if let Some(record) = self.cvr.queries.get_mut(query_id) {
            record.patch_version = Some(to_version.clone());
        }
        Some(PatchToVersion {
            patch: Patch::GotQuery(QueryPatch::Put {
                hash: query_id.clone(),
                ast: None,
                name: None,
                args: None,
                ttl: None,
            }),
            to_version,
        })
    }

    /// Record that the transformation hash of `query_id` is unchanged and its
    /// rows are already in the CVR (a silent re-hydration after restart).
    pub fn unchanged(&mut self, query_id: &QueryId, hash: TransformationHash) {
        self.hash_to_queries
            .entry(hash)
            .or_default()
            .push(query_id.clone());
    }

    /// Remove a query outright: a got-del patch is emitted, the record is
    /// dropped, and every row refcount entry for it is released.
    pub fn removed(&mut self, query_id: &QueryId) -> Option<PatchToVersion> {
        self.cvr.queries.remove(query_id)?;
        self.removed_queries.insert(query_id.clone());
        self.touched_queries.remove(query_id);
        for client in self.cvr.clients.values_mut() {
            client.desired.remove(query_id);
        }
        for (row_id, record) in self.cvr.rows.iter_mut() {
            if record.ref_counts.remove(query_id).is_some() {
                self.touched_rows.insert(row_id.clone());
            }
        }
        let to_version = self.touch();
        Some(PatchToVersion {
            patch: Patch::GotQuery(QueryPatch::Del {
                hash: query_id.clone(),
            }),
            to_version,
        })
    }

    /// Apply a batch of pipeline row changes, returning the row patches to
    /// stage into the poke.
    ///
    /// Presence patches are emitted on zero-to-positive toggles; content
    /// patches on edits. The poker collapses duplicates per row, so a row is
    /// visible at most once per poke.
    pub fn received(&mut self, changes: &[RowChange]) -> SyncResult<Vec<PatchToVersion>> {
        let mut patches = Vec::new();
        for change in changes {
            let queries = self
                .hash_to_queries
                .get(&change.hash())
                .cloned()
                .unwrap_or_default();
            if queries.is_empty() {
                warn!(hash = %change.hash(), "row change for untracked pipeline");
                continue;
            }
            let row_id = change.id().clone();
            match change {
                RowChange::Add { row, .. } => {
                    let to_version = self.touch();
                    let record = self
                        .cvr
                        .rows
                        .entry(row_id.clone())
                        .or_insert_with(|| RowRecord {
                            patch_version: to_version.clone(),
                            ref_counts: BTreeMap::new(),
                        });
                    let was_referenced = record.is_referenced();
                    for query_id in &queries {
                        *record.ref_counts.entry(query_id.clone()).or_insert(0) += 1;
                    }
                    record.patch_version = to_version.clone();
                    self.touched_rows.insert(row_id.clone());
                    if !was_referenced {
                        patches.push(PatchToVersion {
                            patch: Patch::Row(RowPatch::Put {
                                id: row_id,
                                contents: row.client_contents(),
                            }),
                            to_version,
                        });
                    }
                }
                RowChange::Edit { row, .. } => {
                    if self.cvr.rows.contains_key(&row_id) {
                        let to_version = self.touch();
                        let record = self
                            .cvr
                            .rows
                            .get_mut(&row_id)
                            .expect("checked contains_key above");
                        record.patch_version = to_version.clone();
                        self.touched_rows.insert(row_id.clone());
                        patches.push(PatchToVersion {
                            patch: Patch::Row(RowPatch::Put {
                                id: row_id,
                                contents: row.client_contents(),
                            }),
                            to_version,
                        });
                    }
                }
                RowChange::Remove { .. } => {
                    if !self.cvr.rows.contains_key(&row_id) {
                        continue;
                    }
                    let to_version = self.touch();
                    let record = self
                        .cvr
                        .rows
                        .get_mut(&row_id)
                        .expect("checked contains_key above");
                    for query_id in &queries {
                        match record.ref_counts.get_mut(query_id) {
                            Some(count) => {
                                *count -= 1;
                                if *count <= 0 {
                                    record.ref_counts.remove(query_id);
                                }
                            }
                            None => {
                                warn!(row = %change.id(), query = %query_id, "refcount underflow");
                            }
                        }
                    }
                    record.patch_version = to_version;
                    self.touched_rows.insert(row_id);
                }
            }
        }
        Ok(patches)
    }

    /// Emit delete patches for every touched row whose refcounts dropped to
    /// zero, removing the records.
    pub fn delete_unreferenced_rows(&mut self) -> Vec<PatchToVersion> {
        let unreferenced: Vec<RowId> = self
            .touched_rows
            .iter()
            .filter(|id| {
                self.cvr
                    .rows
                    .get(*id)
                    .is_some_and(|record| !record.is_referenced())
            })
            .cloned()
            .collect();
        let mut patches = Vec::new();
        for row_id in unreferenced {
            self.cvr.rows.remove(&row_id);
            self.touched_rows.remove(&row_id);
            self.deleted_rows.insert(row_id.clone());
            let to_version = self.touch();
            patches.push(PatchToVersion {
                patch: Patch::Row(RowPatch::Del { id: row_id }),
                to_version,
            });
        }
        patches
    }

    /// Finish: the updated snapshot, what to persist (`None` when nothing
    /// changed), and the queries that were removed.
    pub fn done(mut self) -> (CvrSnapshot, Option<CvrFlush>, Vec<QueryId>) {
        let removed = self.removed_queries.iter().cloned().collect();
        if !self.changed {
            return (self.cvr, None, removed);
        }
        if self.cvr.replica_version.is_none() {
            self.cvr.replica_version = Some(self.target_state_version.clone());
        }
        let flush = CvrFlush {
            version: self.cvr.version.clone(),
            replica_version: self.cvr.replica_version.clone(),
            client_schema: self.cvr.client_schema.clone(),
            clients: Vec::new(),
            deleted_clients: Vec::new(),
            queries: self
                .touched_queries
                .iter()
                .filter_map(|id| self.cvr.queries.get(id).cloned())
                .collect(),
            deleted_queries: self.removed_queries.iter().cloned().collect(),
            rows: self
                .touched_rows
                .iter()
                .filter_map(|id| self.cvr.rows.get(id).map(|r| (id.clone(), r.clone())))
                .collect(),
            deleted_rows: self.deleted_rows.iter().cloned().collect(),
        };
        (self.cvr, Some(flush), removed)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use viewsync_data::{Row, RowKey, Value};

    use super::*;

    fn row_id(id: i64) -> RowId {
        RowId::new("", "issue", RowKey::from_iter([("id", id)]))
    }

    fn row(id: i64, title: &str) -> Row {
        Row::from_iter([("id", Value::from(id)), ("title", Value::from(title))])
    }

    fn hash(n: u64) -> TransformationHash {
        TransformationHash::new(n)
    }

    #[test]
    fn config_updater_bumps_minor_only_on_visible_change() {
        let cvr = CvrSnapshot::new("g1");
        let mut updater = CvrConfigDrivenUpdater::new(cvr);
        // Deleting a non-existent client is not a visible change.
        updater.delete_clients(&["nope".to_owned()], TtlClock::ZERO);
        let (cvr, flush, patches) = updater.done();
        assert!(flush.is_none());
        assert!(patches.is_empty());
        assert_eq!(cvr.version.cookie(), "00");

        let mut updater = CvrConfigDrivenUpdater::new(cvr);
        updater
            .put_desired_query(
                &"c1".to_owned(),
                &QueryId::from("q1"),
                Some(&SelectAst::table("issue")),
                None,
                None,
                Some(5_000),
            )
            .unwrap();
        let (cvr, flush, patches) = updater.done();
        assert!(flush.is_some());
        assert_eq!(cvr.version.cookie(), "00:01");
        // Client put + desired query put.
        assert_eq!(patches.len(), 2);
        assert!(patches.iter().all(|p| p.to_version == cvr.version));
    }

    #[test]
    fn reactivating_before_expiry_clears_inactivation() {
        let cvr = CvrSnapshot::new("g1");
        let mut updater = CvrConfigDrivenUpdater::new(cvr);
        let c1 = "c1".to_owned();
        let q1 = QueryId::from("q1");
        updater
            .put_desired_query(&c1, &q1, Some(&SelectAst::table("issue")), None, None, None)
            .unwrap();
        updater.del_desired_query(&c1, &q1, TtlClock::from_millis(10));
        updater
            .put_desired_query(&c1, &q1, Some(&SelectAst::table("issue")), None, None, None)
            .unwrap();
        let (cvr, _, _) = updater.done();
        let state = &cvr.queries[&q1].client_state[&c1];
        assert_eq!(state.inactivated_at, None);
    }

    fn updater_with_query(hash_n: u64) -> CvrQueryDrivenUpdater {
        let cvr = CvrSnapshot::new("g1");
        let mut config = CvrConfigDrivenUpdater::new(cvr);
        config
            .put_desired_query(
                &"c1".to_owned(),
                &QueryId::from("q1"),
                Some(&SelectAst::table("issue")),
                None,
                None,
                None,
            )
            .unwrap();
        let (cvr, _, _) = config.done();
        let mut updater = CvrQueryDrivenUpdater::new(cvr, StateVersion::new("01"));
        updater.executed(&QueryId::from("q1"), hash(hash_n));
        updater
    }

    #[test]
    fn add_toggles_presence_once() {
        let mut updater = updater_with_query(7);
        let changes = vec![
            RowChange::Add {
                hash: hash(7),
                id: row_id(1),
                row: row(1, "a"),
            },
            RowChange::Add {
                hash: hash(7),
                id: row_id(1),
                row: row(1, "a"),
            },
        ];
        let patches = updater.received(&changes).unwrap();
        // Two refcount increments, one visible put.
        assert_eq!(patches.len(), 1);
        let (cvr, flush, _) = updater.done();
        assert!(flush.is_some());
        assert_eq!(cvr.rows[&row_id(1)].ref_counts[&QueryId::from("q1")], 2);
    }

    #[test]
    fn remove_deletes_only_at_zero() {
        let mut updater = updater_with_query(7);
        updater
            .received(&[
                RowChange::Add {
                    hash: hash(7),
                    id: row_id(1),
                    row: row(1, "a"),
                },
                RowChange::Add {
                    hash: hash(7),
                    id: row_id(1),
                    row: row(1, "a"),
                },
            ])
            .unwrap();

        updater
            .received(&[RowChange::Remove {
                hash: hash(7),
                id: row_id(1),
            }])
            .unwrap();
        assert!(updater.delete_unreferenced_rows().is_empty());

        updater
            .received(&[RowChange::Remove {
                hash: hash(7),
                id: row_id(1),
            }])
            .unwrap();
        let deletes = updater.delete_unreferenced_rows();
        assert_eq!(deletes.len(), 1);
        assert!(matches!(
            &deletes[0].patch,
            Patch::Row(RowPatch::Del { id }) if *id == row_id(1)
        ));
        let (cvr, flush, _) = updater.done();
        assert!(cvr.rows.is_empty());
        let flush = flush.unwrap();
        assert_eq!(flush.deleted_rows, vec![row_id(1)]);
    }

    #[test]
    fn removed_query_releases_its_refcounts() {
        let mut updater = updater_with_query(7);
        updater
            .received(&[RowChange::Add {
                hash: hash(7),
                id: row_id(1),
                row: row(1, "a"),
            }])
            .unwrap();
        let got_del = updater.removed(&QueryId::from("q1")).unwrap();
        assert!(matches!(
            &got_del.patch,
            Patch::GotQuery(QueryPatch::Del { hash }) if hash.as_str() == "q1"
        ));
        let deletes = updater.delete_unreferenced_rows();
        assert_eq!(deletes.len(), 1);
    }

    #[test]
    fn version_advances_to_target_state_version() {
        let mut updater = updater_with_query(7);
        updater
            .received(&[RowChange::Add {
                hash: hash(7),
                id: row_id(1),
                row: row(1, "a"),
            }])
            .unwrap();
        let (cvr, _, _) = updater.done();
        assert_eq!(cvr.version.cookie(), "01");
        assert_eq!(cvr.replica_version, Some(StateVersion::new("01")));
    }

    #[test]
    fn no_changes_mean_no_flush_and_no_bump() {
        let cvr = CvrSnapshot::new("g1");
        let before = cvr.version.clone();
        let updater = CvrQueryDrivenUpdater::new(cvr, StateVersion::new("05"));
        let (cvr, flush, _) = updater.done();
        assert!(flush.is_none());
        assert_eq!(cvr.version, before);
    }
}
