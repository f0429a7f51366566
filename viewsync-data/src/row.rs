use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use viewsync_errors::{internal_err, SyncResult};

use crate::Value;

/// The hidden column carrying the opaque, lexically ordered per-row version.
///
/// It is never part of a table's declared column set and is stripped from row
/// contents before they are sent to clients.
pub const ROW_VERSION_COLUMN: &str = "_0_version";

/// Render a row-shaped `(name, value)` map as `{a: 1, b: "x"}`.
macro_rules! fmt_row_like {
    () => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{{")?;
            for (i, (name, value)) in self.0.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{name}: {value}")?;
            }
            write!(f, "}}")
        }
    };
}

/// An immutable row: an opaque mapping from column name to [`Value`].
///
/// Rows are cheap to clone (the column map is behind an [`Arc`]) and
/// deterministic to serialize (the map is a [`BTreeMap`]).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Arc<BTreeMap<String, Value>>);

impl Row {
    /// Build a row from column/value pairs.
    pub fn new(columns: BTreeMap<String, Value>) -> Self {
        Row(Arc::new(columns))
    }

    /// Convenience constructor from `(name, value)` pairs.
    pub fn from_iter<K, V, I>(iter: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Row(Arc::new(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    /// The value of a column, if present.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Iterate over all columns, including [`ROW_VERSION_COLUMN`].
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// The number of columns, including the hidden version column.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The opaque row version, if the row carries one.
    pub fn version(&self) -> Option<&str> {
        self.0.get(ROW_VERSION_COLUMN).and_then(Value::as_str)
    }

    /// The row's contents as sent to clients: all columns except the hidden
    /// version column.
    pub fn client_contents(&self) -> BTreeMap<String, Value> {
        self.0
            .iter()
            .filter(|(name, _)| name.as_str() != ROW_VERSION_COLUMN)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Project the given key columns out of this row.
    ///
    /// Fails if any key column is absent, which indicates the row and the
    /// table spec it was validated against have diverged.
    pub fn key(&self, key_columns: &BTreeSet<String>) -> SyncResult<RowKey> {
        key_columns
            .iter()
            .map(|col| {
                self.0
                    .get(col)
                    .cloned()
                    .map(|v| (col.clone(), v))
                    .ok_or_else(|| internal_err!("row is missing key column {col}"))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(RowKey)
    }

    /// The values of the named columns, in the given order. `None` if any
    /// column is missing.
    pub fn values(&self, columns: &[String]) -> Option<Vec<Value>> {
        columns.iter().map(|c| self.0.get(c).cloned()).collect()
    }
}

impl fmt::Display for Row {
    fmt_row_like!();
}

/// The union-key projection of a row: the canonical row identity.
///
/// The union key of a table is the set union of the columns of all its unique
/// indexes, so two rows with equal [`RowKey`]s are the same logical row.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RowKey(BTreeMap<String, Value>);

impl RowKey {
    /// Build a key from column/value pairs.
    pub fn from_iter<K, V, I>(iter: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        RowKey(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// The value of a key column.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Iterate over the key columns in column-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// The key column names.
    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

impl fmt::Display for RowKey {
    fmt_row_like!();
}

/// The globally unique identity of a row: `(schema, table, union key)`.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct RowId {
    /// The schema the table lives in. The default schema is the empty string.
    pub schema: String,
    /// The table name.
    pub table: String,
    /// The union-key projection identifying the row within the table.
    pub row_key: RowKey,
}

impl RowId {
    /// Build a row id.
    pub fn new(schema: impl Into<String>, table: impl Into<String>, row_key: RowKey) -> Self {
        RowId {
            schema: schema.into(),
            table: table.into(),
            row_key,
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.schema.is_empty() {
            write!(f, "{}/{}", self.table, self.row_key)
        } else {
            write!(f, "{}.{}/{}", self.schema, self.table, self.row_key)
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn issue_row() -> Row {
        Row::from_iter([
            ("id", Value::from(1i64)),
            ("title", Value::from("a")),
            (ROW_VERSION_COLUMN, Value::from("0a")),
        ])
    }

    #[test]
    fn client_contents_strips_version_column() {
        let contents = issue_row().client_contents();
        assert!(!contents.contains_key(ROW_VERSION_COLUMN));
        assert_eq!(contents.len(), 2);
    }

    #[test]
    fn key_projects_union_columns() {
        let key_cols: BTreeSet<String> = ["id".to_owned()].into();
        let key = issue_row().key(&key_cols).unwrap();
        assert_eq!(key, RowKey::from_iter([("id", 1i64)]));
    }

    #[test]
    fn key_fails_on_missing_column() {
        let key_cols: BTreeSet<String> = ["nope".to_owned()].into();
        issue_row().key(&key_cols).unwrap_err();
    }

    #[test]
    fn row_id_serializes_camel_case() {
        let id = RowId::new("", "issue", RowKey::from_iter([("id", 1i64)]));
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"schema": "", "table": "issue", "rowKey": {"id": 1}})
        );
    }
}
