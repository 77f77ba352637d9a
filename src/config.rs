//! Engine configuration and chunk limits
//!
//! Defaults are tuned for typical import jobs: sequential batches of 100
//! records with no retries. Minimums are clamped rather than rejected so a
//! zero never turns into a busy-loop or an empty batch.

use crate::error::EngineError;
use crate::store::JobConfigSnapshot;
use std::time::Duration;

/// Configuration for a batch engine
///
/// # Example
///
/// ```
/// use accretion::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig {
///     batch_size: 500,
///     max_retries: 3,
///     retry_delay: Duration::from_millis(250),
///     ..EngineConfig::default()
/// };
/// assert!(config.continue_on_error == false);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Records per batch (minimum 1)
    pub batch_size: usize,
    /// Parallel batch limit; 1 means strict sequential execution
    pub max_concurrent_batches: usize,
    /// Swallow record-level failures instead of failing the job
    pub continue_on_error: bool,
    /// Retry count for processor failures only; validation and hook
    /// failures are never retried
    pub max_retries: u32,
    /// Base backoff, doubled on every further attempt
    pub retry_delay: Duration,
    /// Skip records whose every column value is null or empty
    pub skip_empty_rows: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_concurrent_batches: 1,
            continue_on_error: false,
            max_retries: 0,
            retry_delay: Duration::from_millis(1000),
            skip_empty_rows: false,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamp sizes to their minimum of 1
    pub(crate) fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.max_concurrent_batches = self.max_concurrent_batches.max(1);
        self
    }

    /// The part of the configuration persisted with the job state
    pub(crate) fn snapshot(&self) -> JobConfigSnapshot {
        JobConfigSnapshot {
            batch_size: self.batch_size,
            continue_on_error: self.continue_on_error,
        }
    }
}

/// Limits for one chunked-execution window
///
/// A chunk ends at the first batch boundary crossed after either limit
/// trips; the current batch always completes first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkLimits {
    /// Stop after this many records (minimum 1)
    pub max_records: Option<u64>,
    /// Stop after this much wall-clock time
    pub max_duration: Option<Duration>,
}

impl ChunkLimits {
    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        if self.max_records == Some(0) {
            return Err(EngineError::InvalidChunkLimit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_concurrent_batches, 1);
        assert!(!config.continue_on_error);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.retry_delay, Duration::from_millis(1000));
        assert!(!config.skip_empty_rows);
    }

    #[test]
    fn test_normalized_clamps_minimums() {
        let config = EngineConfig {
            batch_size: 0,
            max_concurrent_batches: 0,
            ..EngineConfig::default()
        }
        .normalized();
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_concurrent_batches, 1);
    }

    #[test]
    fn test_chunk_limit_floor() {
        let limits = ChunkLimits {
            max_records: Some(0),
            max_duration: None,
        };
        assert_eq!(limits.validate(), Err(EngineError::InvalidChunkLimit));

        let limits = ChunkLimits {
            max_records: Some(1),
            max_duration: None,
        };
        assert!(limits.validate().is_ok());
    }
}
