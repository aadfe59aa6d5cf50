//! Core error model.

use thiserror::Error;

/// Result type used across the core crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Keep this focused on deterministic failures of the job model (decoding,
/// encoding, identifier validation). Store and transport concerns belong to the infra
/// layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier (node id, queue name) was invalid.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A serialized job could not be parsed.
    #[error("malformed job payload: {0}")]
    Decode(String),

    /// A job could not be serialized.
    #[error("failed to encode job {jid}: {reason}")]
    Encode { jid: String, reason: String },
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }
}
