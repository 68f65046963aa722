//! Error taxonomy for the analysis pipeline.

use std::time::Duration;
use thiserror::Error;

/// Failure of the ledger's backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ledger store unavailable: {reason}")]
    Unavailable { reason: String },
}

impl StoreError {
    pub fn unavailable(reason: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            reason: reason.to_string(),
        }
    }
}

/// Signals returned by the reasoning service for a single attempt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("rate limited by reasoning service")]
    RateLimited {
        /// Server-provided hint, if any.
        retry_after: Option<Duration>,
    },

    #[error("input too large for reasoning service: {0}")]
    InputTooLarge(String),

    #[error("malformed output: {0}")]
    MalformedOutput(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Run-level fatal conditions. Per-entry failures never surface here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}
