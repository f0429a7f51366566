use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use vec1::Vec1;
use viewsync_errors::{SyncError, SyncResult};

use crate::{Row, Value, ROW_VERSION_COLUMN};

/// The declared type of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Booleans.
    Boolean,
    /// 64-bit signed integers.
    Integer,
    /// Double-precision floats.
    Double,
    /// Text.
    Text,
    /// Opaque JSON documents.
    Json,
}

impl ColumnType {
    /// True if `value` inhabits this type. `NULL` inhabits every type.
    pub fn admits(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Integer, Value::Integer(_)) => true,
            (ColumnType::Double, Value::Double(_) | Value::Integer(_)) => true,
            (ColumnType::Text, Value::Text(_)) => true,
            (ColumnType::Json, Value::Json(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Integer => "integer",
            ColumnType::Double => "double",
            ColumnType::Text => "text",
            ColumnType::Json => "json",
        };
        write!(f, "{s}")
    }
}

/// The physical description of one replica table: declared columns, primary
/// key, and unique keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSpec {
    /// The schema the table lives in; empty string for the default schema.
    #[serde(default)]
    pub schema: String,
    /// The table name.
    pub table: String,
    /// Declared columns and their types. Does not include the hidden row
    /// version column.
    pub columns: BTreeMap<String, ColumnType>,
    /// The primary key columns, in index order.
    pub primary_key: Vec1<String>,
    /// Additional unique keys beyond the primary key.
    #[serde(default)]
    pub unique_keys: Vec<Vec<String>>,
}

impl TableSpec {
    /// The union key: the set union of the columns of all unique indexes
    /// (primary key included). This is the canonical row identity.
    pub fn union_key(&self) -> BTreeSet<String> {
        self.primary_key
            .iter()
            .chain(self.unique_keys.iter().flatten())
            .cloned()
            .collect()
    }

    /// Validate that a fetched row's columns agree with the declared column
    /// set, and that each value inhabits its declared type.
    ///
    /// The hidden [`ROW_VERSION_COLUMN`] is permitted and ignored.
    pub fn check_row(&self, row: &Row) -> SyncResult<()> {
        for (name, value) in row.iter() {
            if name == ROW_VERSION_COLUMN {
                continue;
            }
            match self.columns.get(name) {
                None => {
                    return Err(SyncError::SchemaMismatch {
                        table: self.table.clone(),
                        message: format!("row has undeclared column {name}"),
                    })
                }
                Some(ty) if !ty.admits(value) => {
                    return Err(SyncError::SchemaMismatch {
                        table: self.table.clone(),
                        message: format!("column {name} has non-{ty} value {value}"),
                    })
                }
                Some(_) => {}
            }
        }
        for name in self.columns.keys() {
            if row.get(name).is_none() {
                return Err(SyncError::SchemaMismatch {
                    table: self.table.clone(),
                    message: format!("row is missing declared column {name}"),
                });
            }
        }
        Ok(())
    }
}

/// The column types a client expects, used to detect incompatible schema
/// drift between the client's generated bindings and the replica.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientSchema {
    /// Expected column types, by table.
    pub tables: BTreeMap<String, BTreeMap<String, ColumnType>>,
}

impl ClientSchema {
    /// Verify this client schema against the replica's physical table specs.
    ///
    /// Every table and column the client names must exist with the same type;
    /// columns the client does not name are allowed to exist on the server.
    pub fn verify(&self, specs: &BTreeMap<String, TableSpec>) -> SyncResult<()> {
        for (table, columns) in &self.tables {
            let spec = specs.get(table).ok_or_else(|| {
                SyncError::ClientSchemaMismatch(format!("table {table} does not exist"))
            })?;
            for (column, client_ty) in columns {
                match spec.columns.get(column) {
                    None => {
                        return Err(SyncError::ClientSchemaMismatch(format!(
                            "column {table}.{column} does not exist"
                        )))
                    }
                    Some(server_ty) if server_ty != client_ty => {
                        return Err(SyncError::ClientSchemaMismatch(format!(
                            "column {table}.{column} is {server_ty}, client expects {client_ty}"
                        )))
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use vec1::vec1;

    use super::*;

    fn issue_spec() -> TableSpec {
        TableSpec {
            schema: String::new(),
            table: "issue".into(),
            columns: [
                ("id".to_owned(), ColumnType::Integer),
                ("title".to_owned(), ColumnType::Text),
                ("ownerId".to_owned(), ColumnType::Text),
            ]
            .into(),
            primary_key: vec1!["id".to_owned()],
            unique_keys: vec![vec!["ownerId".to_owned(), "title".to_owned()]],
        }
    }

    #[test]
    fn union_key_is_union_of_unique_indexes() {
        assert_eq!(
            issue_spec().union_key(),
            ["id".to_owned(), "ownerId".to_owned(), "title".to_owned()].into()
        );
    }

    #[test]
    fn check_row_accepts_valid_rows_and_version_column() {
        let row = Row::from_iter([
            ("id", Value::from(1i64)),
            ("title", Value::from("a")),
            ("ownerId", Value::from("u1")),
            (ROW_VERSION_COLUMN, Value::from("0a")),
        ]);
        issue_spec().check_row(&row).unwrap();
    }

    #[test]
    fn check_row_rejects_undeclared_and_missing_columns() {
        let extra = Row::from_iter([
            ("id", Value::from(1i64)),
            ("title", Value::from("a")),
            ("ownerId", Value::from("u1")),
            ("nope", Value::from(2i64)),
        ]);
        assert!(matches!(
            issue_spec().check_row(&extra),
            Err(SyncError::SchemaMismatch { .. })
        ));

        let missing = Row::from_iter([("id", Value::from(1i64))]);
        assert!(matches!(
            issue_spec().check_row(&missing),
            Err(SyncError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn client_schema_type_drift_is_a_mismatch() {
        let schema = ClientSchema {
            tables: [(
                "issue".to_owned(),
                [("id".to_owned(), ColumnType::Text)].into(),
            )]
            .into(),
        };
        let specs: BTreeMap<_, _> = [("issue".to_owned(), issue_spec())].into();
        assert!(matches!(
            schema.verify(&specs),
            Err(SyncError::ClientSchemaMismatch(_))
        ));
    }
}
