//! Error types for the viewsync workspace.
//!
//! There are two distinct notions of "error" in this system:
//!
//! * [`SyncError`] — the workspace-wide error type. Everything fallible
//!   returns [`SyncResult`], and errors raised under the view-syncer lock
//!   ultimately fail the originating client's subscription.
//! * [`ResetPipelinesSignal`] — *not* an error. It is a typed signal meaning
//!   "the IVM pipelines must be torn down and rebuilt" (schema change, or the
//!   slow-advance circuit breaker tripping). It is carried in result sum
//!   types and matched by the reconcile loop; it is never surfaced to
//!   clients.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for the whole workspace.
pub type SyncResult<T> = Result<T, SyncError>;

/// Internal signal indicating that the IVM pipelines must be rebuilt.
///
/// Raised by the snapshot diff iterator on replica schema changes and by the
/// slow-advance circuit breaker. Callers convert this into a pipeline reset
/// followed by re-hydration on the next reconcile tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetPipelinesSignal;

impl std::fmt::Display for ResetPipelinesSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pipelines must be reset")
    }
}

/// The workspace error type.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SyncError {
    /// The client group's persisted state is ahead of the replica, or the
    /// client presented a base cookie for state this server never had. Fatal
    /// to the client group; the client must reset.
    #[error("client not found: {0}")]
    ClientNotFound(String),

    /// The client's base cookie is ahead of a non-empty client view record.
    #[error("invalid base cookie: client at {base_cookie}, server at {server_version}")]
    InvalidConnectionRequestBaseCookie {
        /// The cookie the client presented.
        base_cookie: String,
        /// The version the server has for the group.
        server_version: String,
    },

    /// The client's declared schema version is not supported by this server.
    #[error("schema version not supported: {0}")]
    SchemaVersionNotSupported(String),

    /// The client's declared column types disagree with the replica's tables.
    #[error("client schema mismatch: {0}")]
    ClientSchemaMismatch(String),

    /// A fetched row's columns disagree with the declared column set of its
    /// table.
    #[error("schema mismatch in table {table}: {message}")]
    SchemaMismatch {
        /// The table whose declared columns were violated.
        table: String,
        /// What disagreed.
        message: String,
    },

    /// A structurally invalid query (bad correlation arity, limit or ordering
    /// on a junction edge, empty table name, ...).
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Token mismatch: the presented token is not acceptable for this client
    /// group.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A previously accepted token was invalidated upstream.
    #[error("authentication invalidated: {0}")]
    AuthInvalidated(String),

    /// Pass-through from the mutation collaborator.
    #[error("mutation failed: {0}")]
    MutationFailed(String),

    /// Pass-through from the mutation collaborator.
    #[error("mutation rate limited: {0}")]
    MutationRateLimited(String),

    /// Pass-through from the mutation collaborator.
    #[error("invalid push: {0}")]
    InvalidPush(String),

    /// A concurrent view-syncer instance took ownership of the client group;
    /// this instance must stop cleanly without further writes.
    #[error("ownership of client group {client_group_id} lost to another instance")]
    OwnershipLost {
        /// The client group whose ownership was lost.
        client_group_id: String,
    },

    /// An error from the CVR backing store.
    #[error("cvr storage error: {0}")]
    Storage(String),

    /// An invariant was violated. Always indicates a bug.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl SyncError {
    /// True if this error is fatal to the whole client group (as opposed to a
    /// single connection).
    pub fn is_fatal_to_client_group(&self) -> bool {
        matches!(
            self,
            SyncError::ClientNotFound(_)
                | SyncError::ClientSchemaMismatch(_)
                | SyncError::OwnershipLost { .. }
        )
    }
}

/// Construct a [`SyncError::Internal`] with file/line context, without
/// returning it.
#[macro_export]
macro_rules! internal_err {
    ($($fmt:tt)*) => {
        $crate::SyncError::Internal(format!(
            "{} (at {}:{})",
            format_args!($($fmt)*),
            file!(),
            line!(),
        ))
    };
}

/// Return early with a [`SyncError::Internal`].
#[macro_export]
macro_rules! internal {
    ($($fmt:tt)*) => {
        return Err($crate::internal_err!($($fmt)*).into())
    };
}
