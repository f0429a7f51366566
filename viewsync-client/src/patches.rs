use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use viewsync_ast::SelectAst;
use viewsync_data::{ClientId, QueryId, RowId, Value};

/// A change to a client's query set, used both upstream (desired queries) and
/// downstream (desired/got query confirmations).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum QueryPatch {
    /// Add or update a query.
    #[serde(rename_all = "camelCase")]
    Put {
        /// The query's external id.
        hash: QueryId,
        /// Inline AST, for client-defined queries.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ast: Option<SelectAst>,
        /// Name of a server-resolved (custom) query.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Arguments of a server-resolved (custom) query.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<serde_json::Value>,
        /// Time-to-live after inactivation, in milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl: Option<u64>,
    },
    /// Remove (inactivate) a query.
    Del {
        /// The query's external id.
        hash: QueryId,
    },
    /// Remove all queries.
    Clear,
}

impl QueryPatch {
    /// The query id this patch refers to, if any (`clear` has none).
    pub fn hash(&self) -> Option<&QueryId> {
        match self {
            QueryPatch::Put { hash, .. } | QueryPatch::Del { hash } => Some(hash),
            QueryPatch::Clear => None,
        }
    }
}

/// A change to the set of rows a client has.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum RowPatch {
    /// The row is (now) part of the client view; `contents` is the full row.
    Put {
        /// The row's identity.
        id: RowId,
        /// Full row contents, minus hidden columns.
        contents: BTreeMap<String, Value>,
    },
    /// The row is no longer part of the client view.
    Del {
        /// The row's identity.
        id: RowId,
    },
}

impl RowPatch {
    /// The identity of the patched row.
    pub fn id(&self) -> &RowId {
        match self {
            RowPatch::Put { id, .. } | RowPatch::Del { id } => id,
        }
    }

    /// True for [`RowPatch::Put`].
    pub fn is_put(&self) -> bool {
        matches!(self, RowPatch::Put { .. })
    }
}

/// A change to the set of clients known to the group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ClientPatch {
    /// A client joined the group.
    #[serde(rename_all = "camelCase")]
    Put {
        /// The client's id.
        client_id: ClientId,
    },
    /// A client was deleted from the group.
    #[serde(rename_all = "camelCase")]
    Del {
        /// The client's id.
        client_id: ClientId,
    },
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use viewsync_data::RowKey;

    use super::*;

    #[test]
    fn query_patch_wire_shape() {
        let patch = QueryPatch::Put {
            hash: "q1".into(),
            ast: Some(SelectAst::table("issue")),
            name: None,
            args: None,
            ttl: Some(5_000),
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["op"], "put");
        assert_eq!(json["hash"], "q1");
        assert_eq!(json["ttl"], 5_000);
        assert!(json.get("name").is_none());
    }

    #[test]
    fn row_patch_wire_shape() {
        let patch = RowPatch::Put {
            id: RowId::new("", "issue", RowKey::from_iter([("id", 1i64)])),
            contents: [("id".to_owned(), Value::from(1i64))].into(),
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "op": "put",
                "id": {"schema": "", "table": "issue", "rowKey": {"id": 1}},
                "contents": {"id": 1},
            })
        );
    }

    #[test]
    fn del_round_trips() {
        let patch = RowPatch::Del {
            id: RowId::new("", "issue", RowKey::from_iter([("id", 2i64)])),
        };
        let json = serde_json::to_string(&patch).unwrap();
        let back: RowPatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, patch);
    }
}
