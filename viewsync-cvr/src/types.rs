use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use viewsync_ast::SelectAst;
use viewsync_client::{ClientPatch, QueryPatch, RowPatch};
use viewsync_data::{
    ClientGroupId, ClientId, ClientSchema, CvrVersion, QueryId, RowId, StateVersion,
    TransformationHash,
};

/// The longest TTL a client may request; longer requests are clamped.
pub const MAX_TTL_MS: u64 = 10 * 60 * 1000;

/// Clamp a requested TTL into `[0, MAX_TTL_MS]`. A missing TTL expires
/// immediately upon inactivation.
pub fn clamp_ttl(ttl: Option<u64>) -> u64 {
    ttl.unwrap_or(0).min(MAX_TTL_MS)
}

/// A logical clock counting only wall time during which at least one client
/// of the group was connected. Wall-clock gaps while disconnected do not age
/// queries.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TtlClock(u64);

impl TtlClock {
    /// Time zero.
    pub const ZERO: TtlClock = TtlClock(0);

    /// A clock at the given number of connected-milliseconds.
    pub fn from_millis(millis: u64) -> Self {
        TtlClock(millis)
    }

    /// The clock value in milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// The clock advanced by `millis`.
    pub fn plus(&self, millis: u64) -> Self {
        TtlClock(self.0.saturating_add(millis))
    }
}

/// Per-client desired state of one query.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientQueryState {
    /// Requested time-to-live after inactivation, in milliseconds. Clamped
    /// through [`clamp_ttl`] when evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// The TTL-clock reading at which the client inactivated the query;
    /// `None` while the query is actively desired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactivated_at: Option<TtlClock>,
}

/// What kind of query a record describes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum QueryKind {
    /// A user-desired query with an inline AST.
    Client {
        /// The client-provided AST (before permission transformation).
        ast: SelectAst,
    },
    /// A named server-resolved query.
    Custom {
        /// The server-side query name.
        name: String,
        /// Arguments to the named query.
        args: serde_json::Value,
    },
    /// A system query. Never expires.
    Internal {
        /// The system-defined AST.
        ast: SelectAst,
    },
}

/// One query tracked by the CVR.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecord {
    /// The query's external id.
    pub id: QueryId,
    /// What kind of query this is.
    #[serde(flatten)]
    pub kind: QueryKind,
    /// Desire state per client.
    #[serde(default)]
    pub client_state: BTreeMap<ClientId, ClientQueryState>,
    /// The hash of the permission-transformed AST, once transformed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation_hash: Option<TransformationHash>,
    /// The CVR version at which the query's materialization last changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_version: Option<CvrVersion>,
}

impl QueryRecord {
    /// True for internal (system) queries, which never expire.
    pub fn is_internal(&self) -> bool {
        matches!(self.kind, QueryKind::Internal { .. })
    }

    /// True if no client desires this query at all.
    pub fn is_undesired(&self) -> bool {
        !self.is_internal() && self.client_state.is_empty()
    }

    /// True iff every client has inactivated the query and every clamped TTL
    /// has elapsed on the group's TTL clock.
    pub fn is_expired(&self, clock: TtlClock) -> bool {
        if self.is_internal() || self.client_state.is_empty() {
            return false;
        }
        self.client_state.values().all(|state| match state.inactivated_at {
            None => false,
            Some(at) => at.plus(clamp_ttl(state.ttl)) <= clock,
        })
    }

    /// The TTL-clock reading at which this query becomes expired, if every
    /// client has inactivated it.
    pub fn expires_at(&self) -> Option<TtlClock> {
        if self.is_internal() || self.client_state.is_empty() {
            return None;
        }
        self.client_state
            .values()
            .map(|state| {
                state
                    .inactivated_at
                    .map(|at| at.plus(clamp_ttl(state.ttl)))
            })
            .collect::<Option<Vec<_>>>()
            .and_then(|expiries| expiries.into_iter().max())
    }
}

/// One client known to the group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    /// The client id.
    pub id: ClientId,
    /// The ids of the queries this client desires.
    #[serde(default)]
    pub desired: BTreeSet<QueryId>,
}

/// Per-row bookkeeping: which queries currently produce the row, and with
/// what multiplicity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowRecord {
    /// The CVR version at which the row's patch state last changed.
    pub patch_version: CvrVersion,
    /// Strictly positive refcounts per query id; a query's entry disappears
    /// when its count reaches zero, and a record with no entries is a
    /// tombstone awaiting (or recording) a delete patch.
    #[serde(default)]
    pub ref_counts: BTreeMap<QueryId, i64>,
}

impl RowRecord {
    /// True if any query still produces this row.
    pub fn is_referenced(&self) -> bool {
        self.ref_counts.values().any(|c| *c > 0)
    }
}

/// The in-memory image of one client group's client view record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CvrSnapshot {
    /// The client group this record describes.
    pub client_group_id: ClientGroupId,
    /// The current version; strictly monotonically non-decreasing across
    /// flushes.
    pub version: CvrVersion,
    /// The replica version at which this CVR was initialised. Immutable for
    /// the CVR's lifetime; `None` until the first hydration.
    pub replica_version: Option<StateVersion>,
    /// The column types the group's clients expect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_schema: Option<ClientSchema>,
    /// Clients of the group.
    #[serde(default)]
    pub clients: BTreeMap<ClientId, ClientRecord>,
    /// Queries tracked for the group.
    #[serde(default)]
    pub queries: BTreeMap<QueryId, QueryRecord>,
    /// Rows the group has synced.
    #[serde(default)]
    pub rows: BTreeMap<RowId, RowRecord>,
    /// Connection-gated logical time for TTL accounting.
    #[serde(default)]
    pub ttl_clock: TtlClock,
    /// Wall-clock milliseconds since the epoch of the group's last activity.
    #[serde(default)]
    pub last_active: u64,
}

impl CvrSnapshot {
    /// A brand-new CVR for `client_group_id`.
    pub fn new(client_group_id: impl Into<ClientGroupId>) -> Self {
        CvrSnapshot {
            client_group_id: client_group_id.into(),
            version: CvrVersion::initial(StateVersion::new("00")),
            replica_version: None,
            client_schema: None,
            clients: BTreeMap::new(),
            queries: BTreeMap::new(),
            rows: BTreeMap::new(),
            ttl_clock: TtlClock::ZERO,
            last_active: 0,
        }
    }

    /// True if this CVR has never synced anything.
    pub fn is_empty(&self) -> bool {
        self.replica_version.is_none() && self.queries.is_empty() && self.rows.is_empty()
    }

    /// All query ids whose transformation hash is `hash`.
    pub fn queries_for_hash(&self, hash: TransformationHash) -> Vec<QueryId> {
        self.queries
            .values()
            .filter(|q| q.transformation_hash == Some(hash))
            .map(|q| q.id.clone())
            .collect()
    }

    /// The earliest TTL-clock reading at which some query expires, if any
    /// query is fully inactivated.
    pub fn earliest_expiration(&self) -> Option<TtlClock> {
        self.queries.values().filter_map(QueryRecord::expires_at).min()
    }
}

/// A patch together with the CVR version it moves a client to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchToVersion {
    /// The patch payload.
    pub patch: Patch,
    /// The version a client is at after applying it.
    pub to_version: CvrVersion,
}

/// Any patch the CVR layer can stage for a poke.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Patch {
    /// A row put/delete.
    Row(RowPatch),
    /// A per-client desired-query confirmation.
    DesiredQuery {
        /// The client whose desired set changed.
        client_id: ClientId,
        /// The change.
        patch: QueryPatch,
    },
    /// A group-level got-query change (results materialized or dropped).
    GotQuery(QueryPatch),
    /// A client membership change.
    Client(ClientPatch),
}
