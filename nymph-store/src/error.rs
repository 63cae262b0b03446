//! Error types for the store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected a statement. Carries the offending plan text.
    #[error("query failed: {source} (query: {query})")]
    QueryFailed {
        query: String,
        #[source]
        source: rusqlite::Error,
    },

    /// A value listed by the class's unique constraints is already taken.
    #[error("unique constraint violation on {etype}: {unique}")]
    EntityUniqueConstraint { etype: String, unique: String },

    /// Malformed input: missing transaction name, failed validation and so on.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Another handle's transaction held the store past the lock timeout.
    #[error("store busy: {0}")]
    Busy(String),

    /// The database could not be opened.
    #[error("unable to connect: {0}")]
    UnableToConnect(String),

    /// The configuration still holds its placeholder values.
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// A reference could not be resolved.
    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Query(#[from] nymph_query::QueryError),

    #[error(transparent)]
    Model(#[from] nymph_model::Error),
}

impl StoreError {
    pub(crate) fn query_failed(query: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::QueryFailed {
            query: query.into(),
            source,
        }
    }

    /// True when the failure means a table for some etype does not exist yet.
    pub fn is_missing_table(&self) -> bool {
        matches!(self, Self::QueryFailed { source, .. } if source.to_string().contains("no such table"))
    }
}
