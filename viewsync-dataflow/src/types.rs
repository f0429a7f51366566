use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use viewsync_data::{Row, RowId, RowKey, TransformationHash, Value};

/// A change to one table, as delivered by the replication source and as
/// emitted (normalized) by a [`TableSource`](crate::TableSource).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceChange {
    /// A row was inserted.
    Add(Row),
    /// A row was deleted.
    Remove(Row),
    /// A row was updated in place. The union-key columns of `old` and `new`
    /// are equal; edits that change the union key are normalized to
    /// `Remove(old)` then `Add(new)` before reaching any operator.
    Edit {
        /// The row before the update.
        old: Row,
        /// The row after the update.
        new: Row,
    },
}

impl SourceChange {
    /// The post-change row, if the row still exists.
    pub fn row(&self) -> Option<&Row> {
        match self {
            SourceChange::Add(row) | SourceChange::Edit { new: row, .. } => Some(row),
            SourceChange::Remove(_) => None,
        }
    }
}

impl fmt::Display for SourceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceChange::Add(row) => write!(f, "add {row}"),
            SourceChange::Remove(row) => write!(f, "remove {row}"),
            SourceChange::Edit { old, new } => write!(f, "edit {old} -> {new}"),
        }
    }
}

/// A change to the output of one query pipeline, tagged with the pipeline's
/// transformation hash. This is what hydration and advancement produce and
/// what the CVR updater consumes.
///
/// `Add` and `Remove` move the per-query refcount of the row; `Edit` replaces
/// contents without touching refcounts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RowChange {
    /// The pipeline now produces this row (through one more output path).
    Add {
        /// The pipeline.
        hash: TransformationHash,
        /// The row's identity.
        id: RowId,
        /// Full row contents.
        row: Row,
    },
    /// The contents of an already-produced row changed.
    Edit {
        /// The pipeline.
        hash: TransformationHash,
        /// The row's identity.
        id: RowId,
        /// The new contents.
        row: Row,
    },
    /// The pipeline produces this row through one fewer output path.
    Remove {
        /// The pipeline.
        hash: TransformationHash,
        /// The row's identity.
        id: RowId,
    },
}

impl RowChange {
    /// The pipeline this change belongs to.
    pub fn hash(&self) -> TransformationHash {
        match self {
            RowChange::Add { hash, .. }
            | RowChange::Edit { hash, .. }
            | RowChange::Remove { hash, .. } => *hash,
        }
    }

    /// The identity of the changed row.
    pub fn id(&self) -> &RowId {
        match self {
            RowChange::Add { id, .. }
            | RowChange::Edit { id, .. }
            | RowChange::Remove { id, .. } => id,
        }
    }
}

/// Equality constraints on a scan: column = value for every entry.
///
/// Kept sorted (BTreeMap) so constraints have a canonical form usable as a
/// storage key for per-correlation operator state.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Constraint(pub BTreeMap<String, Value>);

impl Constraint {
    /// The unconstrained scan.
    pub fn none() -> Self {
        Constraint(BTreeMap::new())
    }

    /// Build from column/value pairs.
    pub fn from_iter<K, V, I>(iter: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Constraint(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// True if there are no constraints.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if `row` satisfies every constraint.
    pub fn admits(&self, row: &Row) -> bool {
        self.0
            .iter()
            .all(|(col, val)| row.get(col) == Some(val))
    }

    /// The constrained column names.
    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (col, val)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " AND ")?;
            }
            write!(f, "{col} = {val}")?;
        }
        Ok(())
    }
}

/// A request against a [`TableSource`](crate::TableSource) scan.
///
/// Rows are yielded in primary-key order (or reverse). When `constraint`
/// equates a prefix of the primary key the scan uses an index seek; when it
/// covers a whole unique key it is a point lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchRequest {
    /// Equality constraints to apply.
    pub constraint: Constraint,
    /// Exclusive start cursor, in primary-key order.
    pub start: Option<RowKey>,
    /// Scan in reverse primary-key order.
    pub reverse: bool,
}

impl FetchRequest {
    /// An unconstrained forward scan.
    pub fn all() -> Self {
        FetchRequest::default()
    }

    /// A forward scan with the given constraint.
    pub fn constrained(constraint: Constraint) -> Self {
        FetchRequest {
            constraint,
            ..Default::default()
        }
    }
}
