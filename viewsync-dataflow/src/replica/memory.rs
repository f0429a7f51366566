//! An in-process replica: a shared handle that tests (and single-process
//! deployments) write rows and commit versions through, plus a
//! [`ReplicaSnapshotter`] over the committed history.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use viewsync_data::{Row, RowKey, StateVersion, TableSpec};
use viewsync_errors::{internal_err, ResetPipelinesSignal, SyncResult};

use crate::replica::{DiffOutcome, ReplicaDiff, ReplicaSnapshotter, Snapshot, TableDiff};
use crate::source::SnapshotReader;
use crate::types::FetchRequest;

type Tables = BTreeMap<String, BTreeMap<RowKey, Row>>;

/// One committed version: an immutable copy of all tables plus the diff that
/// produced it.
struct VersionState {
    version: StateVersion,
    specs: Arc<BTreeMap<String, TableSpec>>,
    tables: Arc<Tables>,
    diffs: Vec<TableDiff>,
    /// True if this commit changed the schema; snapshotters positioned
    /// before it must reset instead of diffing across it.
    schema_change: bool,
}

struct Shared {
    specs: Arc<BTreeMap<String, TableSpec>>,
    working: Tables,
    staged: Vec<TableDiff>,
    staged_schema_change: bool,
    committed: Vec<VersionState>,
}

/// Write half of the in-process replica.
#[derive(Clone)]
pub struct MemoryReplicaHandle {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryReplicaHandle {
    /// Create a replica over the given table specs, with no committed
    /// versions yet. Call [`commit`](Self::commit) at least once before
    /// attaching a snapshotter.
    pub fn new(specs: impl IntoIterator<Item = TableSpec>) -> Self {
        let specs: BTreeMap<String, TableSpec> = specs
            .into_iter()
            .map(|spec| (spec.table.clone(), spec))
            .collect();
        MemoryReplicaHandle {
            shared: Arc::new(Mutex::new(Shared {
                specs: Arc::new(specs),
                working: Tables::new(),
                staged: Vec::new(),
                staged_schema_change: false,
                committed: Vec::new(),
            })),
        }
    }

    /// Insert or replace a row, staging the diff for the next commit.
    ///
    /// # Panics
    ///
    /// Panics if the table is unknown or the row lacks its key columns.
    pub fn put_row(&self, table: &str, row: Row) {
        let mut shared = self.shared.lock();
        let spec = shared.specs.get(table).expect("unknown table").clone();
        let key = row.key(&spec.union_key()).expect("row lacks key columns");
        let prev = shared
            .working
            .entry(table.to_owned())
            .or_default()
            .insert(key.clone(), row.clone());
        shared.staged.push(TableDiff {
            table: table.to_owned(),
            row_key: key,
            prev,
            next: Some(row),
        });
    }

    /// Delete a row by key, staging the diff for the next commit. A no-op if
    /// the row does not exist.
    pub fn delete_row(&self, table: &str, key: &RowKey) {
        let mut shared = self.shared.lock();
        let Some(prev) = shared
            .working
            .get_mut(table)
            .and_then(|t| t.remove(key))
        else {
            return;
        };
        shared.staged.push(TableDiff {
            table: table.to_owned(),
            row_key: key.clone(),
            prev: Some(prev),
            next: None,
        });
    }

    /// Replace the schema. The next commit carries a schema-change marker,
    /// forcing snapshotters positioned before it to reset.
    pub fn change_schema(&self, specs: impl IntoIterator<Item = TableSpec>) {
        let mut shared = self.shared.lock();
        shared.specs = Arc::new(
            specs
                .into_iter()
                .map(|spec| (spec.table.clone(), spec))
                .collect(),
        );
        shared.staged_schema_change = true;
    }

    /// Commit everything staged since the last commit as `version`.
    ///
    /// # Panics
    ///
    /// Panics if `version` does not sort after the last committed version.
    pub fn commit(&self, version: &str) {
        let version = StateVersion::new(version);
        let mut shared = self.shared.lock();
        if let Some(last) = shared.committed.last() {
            assert!(
                version > last.version,
                "commit version {version} must exceed {}",
                last.version
            );
        }
        let state = VersionState {
            version,
            specs: Arc::clone(&shared.specs),
            tables: Arc::new(shared.working.clone()),
            diffs: std::mem::take(&mut shared.staged),
            schema_change: std::mem::take(&mut shared.staged_schema_change),
        };
        shared.committed.push(state);
    }

    /// A snapshotter over this replica's committed history.
    pub fn snapshotter(&self) -> MemoryReplica {
        MemoryReplica {
            shared: Arc::clone(&self.shared),
            position: None,
            replica_version: None,
        }
    }
}

/// Read half: a [`ReplicaSnapshotter`] positioned within the committed
/// history of a [`MemoryReplicaHandle`].
pub struct MemoryReplica {
    shared: Arc<Mutex<Shared>>,
    /// Index into `committed` of the version we are at.
    position: Option<usize>,
    replica_version: Option<StateVersion>,
}

impl MemoryReplica {
    fn snapshot_at(&self, shared: &Shared, index: usize) -> Snapshot {
        let state = &shared.committed[index];
        Snapshot {
            version: state.version.clone(),
            reader: Arc::new(MemorySnapshot {
                version: state.version.clone(),
                specs: Arc::clone(&state.specs),
                tables: Arc::clone(&state.tables),
            }),
        }
    }
}

impl ReplicaSnapshotter for MemoryReplica {
    fn init(&mut self) -> SyncResult<Snapshot> {
        let shared = self.shared.lock();
        if shared.committed.is_empty() {
            return Err(internal_err!("memory replica has no committed versions"));
        }
        let index = shared.committed.len() - 1;
        self.position = Some(index);
        let snapshot = self.snapshot_at(&shared, index);
        self.replica_version
            .get_or_insert_with(|| snapshot.version.clone());
        Ok(snapshot)
    }

    fn advance(&mut self) -> SyncResult<DiffOutcome> {
        let shared = self.shared.lock();
        let position = self
            .position
            .ok_or_else(|| internal_err!("advance before init"))?;
        let next = position + 1;
        if next >= shared.committed.len() {
            // Nothing new; an empty diff at the current version.
            let curr = self.snapshot_at(&shared, position);
            return Ok(DiffOutcome::Diff(ReplicaDiff {
                prev: curr.version.clone(),
                curr,
                changes: Vec::new(),
            }));
        }
        if shared.committed[next].schema_change {
            return Ok(DiffOutcome::ResetRequired(ResetPipelinesSignal));
        }
        let prev = shared.committed[position].version.clone();
        let curr = self.snapshot_at(&shared, next);
        let changes = shared.committed[next].diffs.clone();
        self.position = Some(next);
        Ok(DiffOutcome::Diff(ReplicaDiff { prev, curr, changes }))
    }

    fn advance_without_diff(&mut self) -> SyncResult<Snapshot> {
        let shared = self.shared.lock();
        if shared.committed.is_empty() {
            return Err(internal_err!("memory replica has no committed versions"));
        }
        let index = shared.committed.len() - 1;
        self.position = Some(index);
        Ok(self.snapshot_at(&shared, index))
    }

    fn replica_version(&self) -> StateVersion {
        self.replica_version
            .clone()
            .unwrap_or_else(|| StateVersion::new("00"))
    }

    fn current_version(&self) -> StateVersion {
        let shared = self.shared.lock();
        match self.position {
            Some(index) => shared.committed[index].version.clone(),
            None => StateVersion::new("00"),
        }
    }
}

/// A [`SnapshotReader`] over one committed version.
struct MemorySnapshot {
    version: StateVersion,
    specs: Arc<BTreeMap<String, TableSpec>>,
    tables: Arc<Tables>,
}

impl SnapshotReader for MemorySnapshot {
    fn state_version(&self) -> &StateVersion {
        &self.version
    }

    fn table_specs(&self) -> &BTreeMap<String, TableSpec> {
        &self.specs
    }

    fn scan(
        &self,
        table: &str,
        request: &FetchRequest,
    ) -> SyncResult<Box<dyn Iterator<Item = Row> + Send>> {
        let rows = self.tables.get(table).cloned().unwrap_or_default();
        let mut matched: Vec<Row> = rows
            .into_iter()
            .filter(|(key, row)| {
                request.constraint.admits(row)
                    && request.start.as_ref().is_none_or(|start| key > start)
            })
            .map(|(_, row)| row)
            .collect();
        if request.reverse {
            matched.reverse();
        }
        Ok(Box::new(matched.into_iter()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use vec1::vec1;
    use viewsync_data::{ColumnType, Value};

    use super::*;

    fn spec() -> TableSpec {
        TableSpec {
            schema: String::new(),
            table: "issue".into(),
            columns: [("id".to_owned(), ColumnType::Integer)].into(),
            primary_key: vec1!["id".to_owned()],
            unique_keys: vec![],
        }
    }

    fn row(id: i64) -> Row {
        Row::from_iter([("id", Value::from(id))])
    }

    #[test]
    fn snapshots_are_immutable_across_commits() {
        let handle = MemoryReplicaHandle::new([spec()]);
        handle.put_row("issue", row(1));
        handle.commit("00");
        let mut snapshotter = handle.snapshotter();
        let s0 = snapshotter.init().unwrap();

        handle.put_row("issue", row(2));
        handle.commit("01");

        // The old snapshot still sees exactly one row.
        let seen: Vec<Row> = s0
            .reader
            .scan("issue", &FetchRequest::all())
            .unwrap()
            .collect();
        assert_eq!(seen, vec![row(1)]);
    }

    #[test]
    fn advance_yields_committed_diffs_in_order() {
        let handle = MemoryReplicaHandle::new([spec()]);
        handle.commit("00");
        let mut snapshotter = handle.snapshotter();
        snapshotter.init().unwrap();

        handle.put_row("issue", row(1));
        handle.commit("01");

        match snapshotter.advance().unwrap() {
            DiffOutcome::Diff(diff) => {
                assert_eq!(diff.prev, StateVersion::new("00"));
                assert_eq!(diff.curr.version, StateVersion::new("01"));
                assert_eq!(diff.changes.len(), 1);
                assert_eq!(diff.changes[0].next, Some(row(1)));
                assert_eq!(diff.changes[0].prev, None);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn schema_change_requires_reset() {
        let handle = MemoryReplicaHandle::new([spec()]);
        handle.commit("00");
        let mut snapshotter = handle.snapshotter();
        snapshotter.init().unwrap();

        handle.change_schema([spec()]);
        handle.commit("01");

        assert!(matches!(
            snapshotter.advance().unwrap(),
            DiffOutcome::ResetRequired(_)
        ));
        // After a reset the driver fast-forwards; the snapshotter lands on
        // the post-change version.
        let snapshot = snapshotter.advance_without_diff().unwrap();
        assert_eq!(snapshot.version, StateVersion::new("01"));
    }
}
