//! The data model shared by every crate in the viewsync workspace: opaque row
//! values, rows and their union-key identities, replica and client-view-record
//! versions, and the hashed identifiers used to deduplicate query pipelines.

mod ids;
mod row;
mod schema;
mod value;
mod version;

pub use ids::{ClientId, ClientGroupId, QueryId, TransformationHash};
pub use row::{Row, RowId, RowKey, ROW_VERSION_COLUMN};
pub use schema::{ClientSchema, ColumnType, TableSpec};
pub use value::Value;
pub use version::{CvrVersion, StateVersion};
