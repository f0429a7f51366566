use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use viewsync_data::{ClientGroupId, ClientId, ClientSchema};
use viewsync_errors::SyncError;

use crate::{ClientPatch, QueryPatch, RowPatch};

/// Opens a poke: everything up to the matching [`PokeEnd`] moves the client
/// from `base_cookie` to `cookie`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeStart {
    /// Correlates the start/part/end frames of one poke.
    pub poke_id: String,
    /// The CVR version the client is at; `None` for a brand-new client view.
    pub base_cookie: Option<String>,
    /// The CVR version the poke moves the client to.
    pub cookie: String,
    /// Supported client schema version range, when it changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_versions: Option<SchemaVersions>,
}

/// The range of client schema versions the server supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersions {
    /// Oldest supported schema version.
    pub min_supported_version: u32,
    /// Newest supported schema version.
    pub max_supported_version: u32,
}

/// One batch of patches within a poke. All fields are optional; frames carry
/// only the patch groups that are non-empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokePart {
    /// Correlates with the surrounding [`PokeStart`].
    pub poke_id: String,
    /// Per-client desired-query confirmations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_queries_patches: Option<BTreeMap<ClientId, Vec<QueryPatch>>>,
    /// Queries whose results are now (or no longer) materialized for the
    /// group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub got_queries_patch: Option<Vec<QueryPatch>>,
    /// Row puts/deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_patch: Option<Vec<RowPatch>>,
    /// Client membership changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients_patch: Option<Vec<ClientPatch>>,
}

impl PokePart {
    /// A part frame with no patches (used as a chunk seed).
    pub fn new(poke_id: impl Into<String>) -> Self {
        PokePart {
            poke_id: poke_id.into(),
            ..Default::default()
        }
    }

    /// True if this part carries no patches at all.
    pub fn is_empty(&self) -> bool {
        self.desired_queries_patches.is_none()
            && self.got_queries_patch.is_none()
            && self.rows_patch.is_none()
            && self.clients_patch.is_none()
    }
}

/// Closes a poke. A cancelled poke must be discarded by the client without
/// committing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeEnd {
    /// Correlates with the surrounding [`PokeStart`].
    pub poke_id: String,
    /// The committed cookie; absent when cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    /// True if the poke was abandoned and must not be applied.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancel: bool,
}

/// Clients and client groups that were deleted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteClientsBody {
    /// Deleted client ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_ids: Vec<ClientId>,
    /// Deleted client group ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_group_ids: Vec<ClientGroupId>,
}

/// The introspection operations a client may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InspectOp {
    /// List the group's queries with their ttl/inactivation state.
    Queries,
    /// A snapshot of per-group metrics.
    Metrics,
    /// The server version string.
    Version,
}

/// An introspection request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectRequest {
    /// Which introspection to run.
    pub op: InspectOp,
    /// Correlation id echoed in the response.
    pub id: String,
}

/// The response to an [`InspectRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectResponse {
    /// The operation this responds to.
    pub op: InspectOp,
    /// Correlation id from the request.
    pub id: String,
    /// Operation-specific payload.
    pub value: serde_json::Value,
}

/// Client-surfaced error kinds.
///
/// These are the wire-visible classification; the richer [`SyncError`] is
/// internal. `ResetPipelinesSignal` deliberately has no kind here — it is
/// never surfaced to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum ErrorKind {
    /// The server has no compatible state for this client; client must reset.
    ClientNotFound,
    /// The client's base cookie is ahead of the server's state for the group.
    InvalidConnectionRequestBaseCookie,
    /// A push (mutation) message was malformed.
    InvalidPush,
    /// The presented credentials were rejected.
    Unauthorized,
    /// Mutations are being rate limited.
    MutationRateLimited,
    /// A mutation failed upstream.
    MutationFailed,
    /// Previously accepted credentials were invalidated.
    AuthInvalidated,
    /// The client's schema version is outside the supported range.
    SchemaVersionNotSupported,
    /// The client's expected column types disagree with the replica.
    ClientSchemaMismatch,
    /// Anything else; the client should report and reconnect.
    Internal,
}

impl From<&SyncError> for ErrorKind {
    fn from(err: &SyncError) -> Self {
        match err {
            SyncError::ClientNotFound(_) => ErrorKind::ClientNotFound,
            SyncError::InvalidConnectionRequestBaseCookie { .. } => {
                ErrorKind::InvalidConnectionRequestBaseCookie
            }
            SyncError::SchemaVersionNotSupported(_) => ErrorKind::SchemaVersionNotSupported,
            SyncError::ClientSchemaMismatch(_) | SyncError::SchemaMismatch { .. } => {
                ErrorKind::ClientSchemaMismatch
            }
            SyncError::InvalidQuery(_) => ErrorKind::InvalidPush,
            SyncError::Unauthorized(_) => ErrorKind::Unauthorized,
            SyncError::AuthInvalidated(_) => ErrorKind::AuthInvalidated,
            SyncError::MutationFailed(_) => ErrorKind::MutationFailed,
            SyncError::MutationRateLimited(_) => ErrorKind::MutationRateLimited,
            SyncError::InvalidPush(_) => ErrorKind::InvalidPush,
            SyncError::OwnershipLost { .. }
            | SyncError::Storage(_)
            | SyncError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// A client-surfaced error frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Classification the client dispatches on.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl From<&SyncError> for ErrorBody {
    fn from(err: &SyncError) -> Self {
        ErrorBody {
            kind: err.into(),
            message: err.to_string(),
        }
    }
}

/// Frames sent to the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Downstream {
    /// Open a poke.
    #[serde(rename = "pokeStart")]
    PokeStart(PokeStart),
    /// One batch of patches within a poke.
    #[serde(rename = "pokePart")]
    PokePart(PokePart),
    /// Close (commit or cancel) a poke.
    #[serde(rename = "pokeEnd")]
    PokeEnd(PokeEnd),
    /// Confirm deletion of clients/groups.
    #[serde(rename = "deleteClients")]
    DeleteClients(DeleteClientsBody),
    /// Answer an introspection request.
    #[serde(rename = "inspect-response")]
    InspectResponse(InspectResponse),
    /// Terminal error for this connection.
    #[serde(rename = "error")]
    Error(ErrorBody),
}

/// Messages received from the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Upstream {
    /// First message on every connection.
    #[serde(rename = "initConnection", rename_all = "camelCase")]
    InitConnection {
        /// The client's full desired-query set (or a delta against its
        /// previous connection).
        desired_queries_patch: Vec<QueryPatch>,
        /// Expected column types, checked against the replica.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_schema: Option<ClientSchema>,
        /// Clients/groups the caller knows to be deleted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deleted: Option<DeleteClientsBody>,
        /// Clients of this group known to be alive; desired queries of
        /// clients outside this set are inactivated.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active_clients: Option<Vec<ClientId>>,
    },
    /// Mutate the desired-query set mid-connection.
    #[serde(rename = "changeDesiredQueries", rename_all = "camelCase")]
    ChangeDesiredQueries {
        /// The changes.
        desired_queries_patch: Vec<QueryPatch>,
    },
    /// Delete clients and/or whole groups.
    #[serde(rename = "deleteClients")]
    DeleteClients(DeleteClientsBody),
    /// Introspection.
    #[serde(rename = "inspect")]
    Inspect(InspectRequest),
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn downstream_frames_are_type_tagged() {
        let frame = Downstream::PokeStart(PokeStart {
            poke_id: "p1".into(),
            base_cookie: None,
            cookie: "00:01".into(),
            schema_versions: None,
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "pokeStart");
        assert_eq!(json["baseCookie"], serde_json::Value::Null);
        assert_eq!(json["cookie"], "00:01");
    }

    #[test]
    fn poke_end_omits_cancel_when_false() {
        let end = Downstream::PokeEnd(PokeEnd {
            poke_id: "p1".into(),
            cookie: Some("01".into()),
            cancel: false,
        });
        let json = serde_json::to_value(&end).unwrap();
        assert!(json.get("cancel").is_none());

        let cancelled = Downstream::PokeEnd(PokeEnd {
            poke_id: "p1".into(),
            cookie: None,
            cancel: true,
        });
        let json = serde_json::to_value(&cancelled).unwrap();
        assert_eq!(json["cancel"], true);
    }

    #[test]
    fn upstream_init_connection_round_trips() {
        let msg = Upstream::InitConnection {
            desired_queries_patch: vec![QueryPatch::Put {
                hash: "q1".into(),
                ast: Some(viewsync_ast::SelectAst::table("issue")),
                name: None,
                args: None,
                ttl: None,
            }],
            client_schema: None,
            deleted: None,
            active_clients: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"initConnection\""));
        let back: Upstream = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn inspect_response_tag_uses_dash() {
        let frame = Downstream::InspectResponse(InspectResponse {
            op: InspectOp::Version,
            id: "i1".into(),
            value: serde_json::json!("0.1.0"),
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "inspect-response");
    }
}
