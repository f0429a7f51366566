use std::collections::HashMap;

use ahash::RandomState;
use serde::de::DeserializeOwned;
use serde::Serialize;
use viewsync_data::TransformationHash;
use viewsync_errors::{internal_err, SyncResult};

use crate::pipeline::OpId;
use crate::types::Constraint;

/// Scratch key/value storage for operators, scoped to one client group.
///
/// Exclusively owned by the [`PipelineDriver`](crate::PipelineDriver) and
/// destroyed with it. Operators address their state by `(pipeline hash,
/// operator id, constraint)`, so per-correlation state (e.g. one take window
/// per parent row) falls out of the keying; values are serialized JSON so the
/// store itself stays opaque.
#[derive(Debug, Default)]
pub struct ClientGroupStorage {
    entries: HashMap<StorageKey, serde_json::Value, RandomState>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct StorageKey {
    pipeline: TransformationHash,
    op: OpId,
    scope: String,
}

impl ClientGroupStorage {
    /// A fresh, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(pipeline: TransformationHash, op: OpId, scope: &Constraint) -> StorageKey {
        StorageKey {
            pipeline,
            op,
            // Constraints are sorted maps, so this serialization is canonical.
            scope: serde_json::to_string(scope).expect("constraint serialization is infallible"),
        }
    }

    /// Read the state an operator stored under `scope`, if any.
    pub fn get<T: DeserializeOwned>(
        &self,
        pipeline: TransformationHash,
        op: OpId,
        scope: &Constraint,
    ) -> SyncResult<Option<T>> {
        match self.entries.get(&Self::key(pipeline, op, scope)) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| internal_err!("corrupt operator storage: {e}")),
        }
    }

    /// Store operator state under `scope`.
    pub fn put<T: Serialize>(
        &mut self,
        pipeline: TransformationHash,
        op: OpId,
        scope: &Constraint,
        value: &T,
    ) -> SyncResult<()> {
        let value =
            serde_json::to_value(value).map_err(|e| internal_err!("unserializable state: {e}"))?;
        self.entries.insert(Self::key(pipeline, op, scope), value);
        Ok(())
    }

    /// Drop all state belonging to one pipeline. Called when the pipeline is
    /// destroyed.
    pub fn purge_pipeline(&mut self, pipeline: TransformationHash) {
        self.entries.retain(|k, _| k.pipeline != pipeline);
    }

    /// Drop everything. Called on driver reset/shutdown.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of stored entries, for introspection.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_state_round_trips() {
        let mut storage = ClientGroupStorage::new();
        let h = TransformationHash::new(1);
        let scope = Constraint::from_iter([("issueId", 1i64)]);
        storage.put(h, OpId(3), &scope, &vec![1u32, 2, 3]).unwrap();

        let got: Option<Vec<u32>> = storage.get(h, OpId(3), &scope).unwrap();
        assert_eq!(got, Some(vec![1, 2, 3]));

        // A different scope sees nothing.
        let other: Option<Vec<u32>> = storage
            .get(h, OpId(3), &Constraint::from_iter([("issueId", 2i64)]))
            .unwrap();
        assert_eq!(other, None);
    }

    #[test]
    fn purge_pipeline_is_scoped_to_the_hash() {
        let mut storage = ClientGroupStorage::new();
        let scope = Constraint::none();
        storage
            .put(TransformationHash::new(1), OpId(0), &scope, &1u8)
            .unwrap();
        storage
            .put(TransformationHash::new(2), OpId(0), &scope, &2u8)
            .unwrap();
        storage.purge_pipeline(TransformationHash::new(1));
        assert_eq!(storage.len(), 1);
        let kept: Option<u8> = storage
            .get(TransformationHash::new(2), OpId(0), &scope)
            .unwrap();
        assert_eq!(kept, Some(2));
    }
}
