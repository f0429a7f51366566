use async_trait::async_trait;
use thiserror::Error;
use viewsync_data::TransformationHash;
use viewsync_errors::{SyncError, SyncResult};
use viewsync_util::hash::hash_bytes;

use crate::SelectAst;

/// A query after permission transformation, together with the hash keying its
/// IVM pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformedQuery {
    /// The transformed query.
    pub ast: SelectAst,
    /// Hash of the canonical serialization of `ast`.
    pub hash: TransformationHash,
}

impl TransformedQuery {
    /// Wrap an already-transformed AST, computing its hash.
    pub fn new(ast: SelectAst) -> Self {
        let hash = transformation_hash(&ast);
        TransformedQuery { ast, hash }
    }
}

/// Compute the transformation hash of an AST: xxh3 of its canonical JSON
/// serialization.
///
/// Canonical means: struct field order as declared, defaulted fields omitted,
/// maps sorted. Equal ASTs always hash equal; distinct ASTs may collide with
/// the usual 64-bit probability, which the system tolerates (a collision
/// merely aliases two pipelines).
pub fn transformation_hash(ast: &SelectAst) -> TransformationHash {
    let bytes = serde_json::to_vec(ast).expect("AST serialization is infallible");
    TransformationHash::new(hash_bytes(&bytes))
}

/// The authorizer shim: transforms a client query into the
/// permission-constrained query that actually runs.
///
/// Permission rule evaluation itself is an external collaborator; the view
/// syncer only consumes its output. Implementations must be deterministic —
/// the transformation hash of the output is persisted and compared across
/// reconnects to decide whether pipelines can be reused.
pub trait QueryTransformer: Send + Sync {
    /// Transform `ast`, returning the query to run and its hash.
    fn transform(&self, ast: &SelectAst) -> SyncResult<TransformedQuery>;
}

/// A [`QueryTransformer`] that applies no permission constraints.
#[derive(Clone, Copy, Debug, Default)]
pub struct PermissiveAuthorizer;

impl QueryTransformer for PermissiveAuthorizer {
    fn transform(&self, ast: &SelectAst) -> SyncResult<TransformedQuery> {
        ast.validate()?;
        Ok(TransformedQuery::new(ast.clone()))
    }
}

/// Errors from resolving a named (custom) query with an external resolver.
#[derive(Debug, Error)]
pub enum CustomQueryError {
    /// The resolver rejected the caller's credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Previously accepted credentials were invalidated (e.g. upstream 401).
    #[error("auth invalidated: {0}")]
    AuthInvalidated(String),
    /// The resolver could not be reached or answered malformed data.
    #[error("custom query resolution failed: {0}")]
    Resolution(String),
}

impl From<CustomQueryError> for SyncError {
    fn from(err: CustomQueryError) -> Self {
        match err {
            CustomQueryError::Unauthorized(m) => SyncError::Unauthorized(m),
            CustomQueryError::AuthInvalidated(m) => SyncError::AuthInvalidated(m),
            CustomQueryError::Resolution(m) => SyncError::Internal(m),
        }
    }
}

/// Resolver for named server-side queries, referenced by `(name, args)`
/// instead of an inline AST.
///
/// Typically backed by an HTTP endpoint (`query.url` in the configuration);
/// the transport is a collaborator, so the core only sees this trait.
#[async_trait]
pub trait CustomQueryTransformer: Send + Sync {
    /// Resolve and transform the named query.
    async fn transform_custom(
        &self,
        name: &str,
        args: &serde_json::Value,
    ) -> Result<TransformedQuery, CustomQueryError>;
}

#[cfg(test)]
mod tests {
    use viewsync_data::Value;

    use super::*;
    use crate::{CompareOp, Condition};

    #[test]
    fn hash_is_stable_and_discriminating() {
        let a = SelectAst::table("issue");
        let b = SelectAst {
            where_clause: Some(Condition::Compare {
                column: "closed".into(),
                op: CompareOp::Eq,
                value: Value::from(false),
            }),
            ..SelectAst::table("issue")
        };
        assert_eq!(transformation_hash(&a), transformation_hash(&a));
        assert_ne!(transformation_hash(&a), transformation_hash(&b));
    }

    #[test]
    fn permissive_authorizer_is_identity() {
        let ast = SelectAst::table("issue");
        let t = PermissiveAuthorizer.transform(&ast).unwrap();
        assert_eq!(t.ast, ast);
        assert_eq!(t.hash, transformation_hash(&ast));
    }

    #[test]
    fn permissive_authorizer_still_validates() {
        let ast = SelectAst::table("");
        assert!(PermissiveAuthorizer.transform(&ast).is_err());
    }
}
