//! Accretion: Streaming Batch Engine for Validated Record Imports
//!
//! # Overview
//!
//! Accretion ingests an arbitrarily large sequence of records from an
//! abstract source, partitions it into fixed-size batches, and dispatches
//! each record through a caller-supplied processor with validation, retry,
//! and lifecycle hooks. Job state is persisted through a pluggable store
//! port, giving crash-proof resumption, serverless-style chunked execution,
//! and atomic multi-worker batch claims.
//!
//! # Features
//!
//! - **Streaming batches**: fixed-size batches over a lazy record stream;
//!   the whole input is never buffered
//! - **Record pipeline**: validate, lifecycle hooks, processor retries with
//!   exponential backoff
//! - **Lifecycle control**: pause/resume/abort through a cooperative state
//!   machine
//! - **Chunked execution**: bounded windows that pause cleanly at batch
//!   boundaries for serverless callers
//! - **Crash recovery**: restore a persisted job and skip completed batches
//! - **Distributed claims**: prepare once, then claim-and-process from any
//!   number of workers with exactly-once finalisation
//!
//! # Example
//!
//! ```no_run
//! use accretion::{BatchEngine, EngineConfig, EventKind, MemoryStore, processor_fn};
//! use std::sync::Arc;
//!
//! # use accretion::{DataSource, Parser, SourceChunk, RawRecord};
//! # use futures::stream::{BoxStream, StreamExt};
//! # struct CsvSource;
//! # #[async_trait::async_trait]
//! # impl DataSource for CsvSource {
//! #     fn read(self: Box<Self>) -> BoxStream<'static, anyhow::Result<SourceChunk>> {
//! #         futures::stream::empty().boxed()
//! #     }
//! # }
//! # struct CsvParser;
//! # #[async_trait::async_trait]
//! # impl Parser for CsvParser {
//! #     async fn parse(&mut self, _chunk: SourceChunk) -> anyhow::Result<Vec<RawRecord>> {
//! #         Ok(Vec::new())
//! #     }
//! # }
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let engine = BatchEngine::new(
//!         EngineConfig {
//!             batch_size: 200,
//!             continue_on_error: true,
//!             ..EngineConfig::default()
//!         },
//!         store,
//!     );
//!
//!     engine.from_source(Box::new(CsvSource), Box::new(CsvParser));
//!     engine.on(EventKind::BatchCompleted, |event| {
//!         println!("batch done for job {}", event.job_id);
//!     });
//!
//!     engine
//!         .start(Arc::new(processor_fn(|record, _ctx| async move {
//!             // insert the record somewhere
//!             let _ = record.data();
//!             Ok(())
//!         })))
//!         .await?;
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod backends;
pub mod config;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod events;
pub mod hooks;
pub mod record;
pub mod source;
pub mod store;

mod context;
mod pipeline;
mod splitter;

pub use backends::memory::MemoryStore;
pub use config::{ChunkLimits, EngineConfig};
pub use distributed::{DistributedCoordinator, PrepareOutcome, WorkerBatchOutcome};
pub use engine::{BatchEngine, ChunkOutcome, JobSnapshot};
pub use error::EngineError;
pub use events::{Event, EventBus, EventKind, EventPayload, JobSummary, SubscriptionId};
pub use hooks::{
    processor_fn, FnProcessor, LifecycleHooks, ProcessingContext, RecordProcessor, ValidateFn,
};
pub use record::{
    is_empty_row, ErrorCategory, ProcessedRecord, RawRecord, RecordStatus, Severity,
    ValidationError, ValidationOutcome,
};
pub use source::{DataSource, Parser, SourceChunk, SourceMetadata};
pub use store::{
    BatchMeta, BatchReservation, BatchStateUpdate, BatchStatus, ClaimOutcome, ClaimRefusal,
    DistributedBatch, DistributedStateStore, DistributedStatus, JobConfigSnapshot, JobProgress,
    JobState, StateStore,
};

/// Job lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Freshly created, nothing streamed yet
    Created,
    /// A preview pass is running
    Previewing,
    /// A preview pass finished
    Previewed,
    /// The scheduler is executing batches
    Processing,
    /// Suspended by `pause` or by chunk exhaustion; resumable
    Paused,
    /// All records ran; terminal
    Completed,
    /// Cancelled by `abort`; terminal
    Aborted,
    /// An unhandled failure stopped the job; terminal
    Failed,
}

impl JobStatus {
    /// The state-machine edges; everything else is an invalid transition
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, Previewing)
                | (Created, Processing)
                | (Previewing, Previewed)
                | (Previewing, Failed)
                | (Previewed, Processing)
                | (Processing, Paused)
                | (Processing, Completed)
                | (Processing, Aborted)
                | (Processing, Failed)
                | (Paused, Processing)
                | (Paused, Aborted)
        )
    }

    /// Terminal states forbid further mutation except recovery restore
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Aborted | JobStatus::Failed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Created => write!(f, "CREATED"),
            JobStatus::Previewing => write!(f, "PREVIEWING"),
            JobStatus::Previewed => write!(f, "PREVIEWED"),
            JobStatus::Processing => write!(f, "PROCESSING"),
            JobStatus::Paused => write!(f, "PAUSED"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Aborted => write!(f, "ABORTED"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATED" => Ok(JobStatus::Created),
            "PREVIEWING" => Ok(JobStatus::Previewing),
            "PREVIEWED" => Ok(JobStatus::Previewed),
            "PROCESSING" => Ok(JobStatus::Processing),
            "PAUSED" => Ok(JobStatus::Paused),
            "COMPLETED" => Ok(JobStatus::Completed),
            "ABORTED" => Ok(JobStatus::Aborted),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid job status: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_display() {
        assert_eq!(JobStatus::Created.to_string(), "CREATED");
        assert_eq!(JobStatus::Processing.to_string(), "PROCESSING");
        assert_eq!(JobStatus::Aborted.to_string(), "ABORTED");
    }

    #[test]
    fn test_job_status_parse() {
        use std::str::FromStr;
        assert_eq!(JobStatus::from_str("paused").unwrap(), JobStatus::Paused);
        assert_eq!(
            JobStatus::from_str("COMPLETED").unwrap(),
            JobStatus::Completed
        );
        assert!(JobStatus::from_str("invalid").is_err());
    }

    #[test]
    fn test_transition_edges() {
        use JobStatus::*;
        let all = [
            Created, Previewing, Previewed, Processing, Paused, Completed, Aborted, Failed,
        ];

        let allowed = [
            (Created, Previewing),
            (Created, Processing),
            (Previewing, Previewed),
            (Previewing, Failed),
            (Previewed, Processing),
            (Processing, Paused),
            (Processing, Completed),
            (Processing, Aborted),
            (Processing, Failed),
            (Paused, Processing),
            (Paused, Aborted),
        ];

        for from in all {
            for to in all {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "edge {} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        use JobStatus::*;
        let all = [
            Created, Previewing, Previewed, Processing, Paused, Completed, Aborted, Failed,
        ];
        for terminal in [Completed, Aborted, Failed] {
            assert!(terminal.is_terminal());
            for to in all {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_job_status_serde_wire_names() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Previewed).unwrap(),
            "\"PREVIEWED\""
        );
        let status: JobStatus = serde_json::from_str("\"ABORTED\"").unwrap();
        assert_eq!(status, JobStatus::Aborted);
    }
}
