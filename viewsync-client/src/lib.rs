//! The client-facing protocol of the view syncer: downstream frames (pokes,
//! errors, inspect responses), upstream messages (connection initiation,
//! desired-query changes), and the patch types both directions share.
//!
//! Transport framing (HTTP/WebSocket) is an external collaborator; this crate
//! only defines the serialized shapes.

mod frames;
mod patches;

pub mod metrics;

pub use frames::{
    DeleteClientsBody, Downstream, ErrorBody, ErrorKind, InspectOp, InspectRequest,
    InspectResponse, PokeEnd, PokePart, PokeStart, SchemaVersions, Upstream,
};
pub use patches::{ClientPatch, QueryPatch, RowPatch};
