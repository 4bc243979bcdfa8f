//! Error Types
//!
//! Every fallible operation in the crate returns [`Result`]. Configuration
//! problems are detected before any message is sent; communication problems
//! abort the current run on the rank that observed them.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransposeError {
    /// Grid geometry, matrix size or policy do not fit together
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The transport reported a failure or a peer broke the protocol
    #[error("communication failure on rank {rank}: {reason}")]
    CommunicationFailure { rank: usize, reason: String },

    /// A receive did not complete within the configured timeout
    #[error("rank {rank} timed out after {waited:?} waiting for rank {peer}")]
    CommunicationTimeout {
        rank: usize,
        peer: usize,
        waited: Duration,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

impl TransposeError {
    pub fn config(message: impl Into<String>) -> Self {
        TransposeError::Configuration(message.into())
    }

    pub fn comm(rank: usize, reason: impl Into<String>) -> Self {
        TransposeError::CommunicationFailure {
            rank,
            reason: reason.into(),
        }
    }

    /// Configuration errors are detected at setup and never retried
    pub fn is_configuration(&self) -> bool {
        matches!(self, TransposeError::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, TransposeError>;
