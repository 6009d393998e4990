//! Unified error types for the strategy aggregator.

use thiserror::Error;

use crate::types::SourceId;

#[derive(Debug, Error)]
pub enum Error {
    /// The only fatal condition: a source never managed its first subscription.
    #[error("initial subscription to {stream} at {endpoint} failed: {reason}")]
    Subscribe {
        stream: SourceId,
        endpoint: String,
        reason: String,
    },

    #[error("cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single inbound message could not be turned into a snapshot.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotObject,

    #[error("missing or non-integer `{field}` revision field")]
    Revision { field: &'static str },

    #[error("missing `{key}` entry")]
    MissingEntity { key: &'static str },
}

/// The strategy computation failed. Never fatal; the previous recommendation
/// stays in place.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("strategy endpoint unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    #[error("strategy endpoint returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("malformed strategy response: {0}")]
    Decode(String),
}

impl StrategyError {
    /// `true` for transport failures, `false` for malformed responses.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        !matches!(self, StrategyError::Decode(_))
    }
}
