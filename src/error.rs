//! The closed error taxonomy for the engine (spec §7).
//!
//! Every fatal condition the engine can hit is one variant of [`CoreError`].
//! Programmer errors (bad status transitions, malformed queries) are still
//! returned as `Err` rather than panicking, so embedders can decide whether
//! to treat them as recoverable; library code never panics on caller input.

use crate::collection::CollectionStatus;
use crate::key::Key;

/// A single schema validation failure, `{ message, path[] }` in the spec.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SchemaIssue {
    pub message: String,
    pub path: Vec<String>,
}

/// The closed error taxonomy described in spec §7.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(String),

    #[error("duplicate key: {key}")]
    DuplicateKey { key: Key },

    #[error("missing key: {key}")]
    MissingKey { key: Key },

    #[error("update changed the key of record {original} to {attempted}")]
    ImmutableKey { original: Key, attempted: Key },

    #[error("schema validation failed with {} issue(s)", issues.len())]
    SchemaValidation { issues: Vec<SchemaIssue> },

    #[error("invalid collection status transition: {from:?} -> {to:?}")]
    StatusTransition {
        from: CollectionStatus,
        to: CollectionStatus,
    },

    #[error("usage error: {0}")]
    Usage(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("subscription listener error: {0}")]
    Subscription(String),

    #[error("sync cleanup error: {0}")]
    SyncCleanup(String),

    #[error("mutation function failed: {0}")]
    MutationFn(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
