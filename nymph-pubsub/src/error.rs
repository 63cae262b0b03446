//! Error types for the publisher.

use nymph_query::QueryError;
use nymph_store::StoreError;
use thiserror::Error;

use crate::protocol::ConnectionId;

/// Result type for publisher operations.
pub type PubSubResult<T> = Result<T, PubSubError>;

#[derive(Debug, Error)]
pub enum PubSubError {
    /// Malformed or incomplete client message.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("query error: {0}")]
    Query(#[from] QueryError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<nymph_model::Error> for PubSubError {
    fn from(e: nymph_model::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
