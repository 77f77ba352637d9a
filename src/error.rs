//! Error types for engine configuration and lifecycle control

use crate::JobStatus;
use thiserror::Error;

/// Errors surfaced synchronously by the engine's control surface
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The requested edge is not part of the job state machine
    #[error("invalid job state transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// `start`/`count` called before a source and parser were attached
    #[error("no data source configured")]
    SourceNotConfigured,

    /// The attached source was already streamed once
    #[error("data source already consumed")]
    SourceConsumed,

    /// `resume` called on a job that was aborted
    #[error("cannot resume an aborted job")]
    CannotResumeAborted,

    /// Chunk limits with `max_records` below the minimum of 1
    #[error("chunk limit max_records must be at least 1")]
    InvalidChunkLimit,
}

impl EngineError {
    /// Check whether this error is a state-machine violation
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, EngineError::InvalidTransition { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = EngineError::InvalidTransition {
            from: JobStatus::Completed,
            to: JobStatus::Processing,
        };
        assert_eq!(
            err.to_string(),
            "invalid job state transition: COMPLETED -> PROCESSING"
        );
        assert!(err.is_invalid_transition());
        assert!(!EngineError::SourceNotConfigured.is_invalid_transition());
    }
}
