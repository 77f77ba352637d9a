//! Processor, validator, and lifecycle-hook ports
//!
//! Hooks receive an owned snapshot of the record plus a
//! [`ProcessingContext`]; `after_validate` additionally returns the record,
//! and its returned error list is authoritative.

use crate::record::{ProcessedRecord, RawRecord, ValidationOutcome};
use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Context handed to hooks and the processor for one record
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub job_id: String,
    pub batch_id: String,
    pub batch_index: usize,
    pub record_index: u64,
    /// Records observed so far; exact only once the stream has ended
    pub total_records: u64,
    /// Cooperative cancel signal; long-running processors should honour it
    pub cancel: CancellationToken,
}

/// The caller-supplied record processor
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn process(&self, record: &ProcessedRecord, ctx: &ProcessingContext) -> Result<()>;
}

/// Adapter turning an async closure into a [`RecordProcessor`]
pub struct FnProcessor<F>(F);

#[async_trait]
impl<F, Fut> RecordProcessor for FnProcessor<F>
where
    F: Fn(ProcessedRecord, ProcessingContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn process(&self, record: &ProcessedRecord, ctx: &ProcessingContext) -> Result<()> {
        (self.0)(record.clone(), ctx.clone()).await
    }
}

/// Wrap an async closure as a processor
///
/// ```
/// use accretion::processor_fn;
///
/// let processor = processor_fn(|record, _ctx| async move {
///     let _ = record.index;
///     Ok(())
/// });
/// # let _ = processor;
/// ```
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(ProcessedRecord, ProcessingContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    FnProcessor(f)
}

/// Synchronous validation port: raw mapping in, findings and an optional
/// parsed projection out
pub type ValidateFn = dyn Fn(&RawRecord) -> ValidationOutcome + Send + Sync;

type Hook =
    Box<dyn Fn(ProcessedRecord, ProcessingContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

type RecordHook = Box<
    dyn Fn(ProcessedRecord, ProcessingContext) -> BoxFuture<'static, Result<ProcessedRecord>>
        + Send
        + Sync,
>;

/// Optional async lifecycle hooks around validation and processing
///
/// A failing hook fails its record (never the retry loop); `after_validate`
/// runs even for invalid records, `before_process` only for records that
/// passed validation.
#[derive(Default)]
pub struct LifecycleHooks {
    pub(crate) before_validate: Option<Hook>,
    pub(crate) after_validate: Option<RecordHook>,
    pub(crate) before_process: Option<Hook>,
    pub(crate) after_process: Option<Hook>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before_validate<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ProcessedRecord, ProcessingContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before_validate = Some(Box::new(move |record, ctx| Box::pin(hook(record, ctx))));
        self
    }

    pub fn on_after_validate<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ProcessedRecord, ProcessingContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ProcessedRecord>> + Send + 'static,
    {
        self.after_validate = Some(Box::new(move |record, ctx| Box::pin(hook(record, ctx))));
        self
    }

    pub fn on_before_process<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ProcessedRecord, ProcessingContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before_process = Some(Box::new(move |record, ctx| Box::pin(hook(record, ctx))));
        self
    }

    pub fn on_after_process<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ProcessedRecord, ProcessingContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.after_process = Some(Box::new(move |record, ctx| Box::pin(hook(record, ctx))));
        self
    }
}
