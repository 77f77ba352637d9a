//! Batch splitter: fixed-size groups over a lazy record stream
//!
//! The splitter pulls records on demand and yields a group only when it
//! fills or the stream ends, so the consumer controls the pull rate and the
//! whole input is never buffered. Record order is preserved; nothing is
//! duplicated or dropped.

use crate::context::JobContext;
use crate::record::{is_empty_row, ProcessedRecord};
use crate::source::RecordFeed;
use anyhow::Result;
use std::sync::Arc;

/// A lazy stream of pending records with monotonically assigned indices
///
/// When an observer context is attached, each assigned index bumps the
/// context's running record total. When `skip_empty` is set (the
/// distributed prepare path), empty rows are dropped before an index is
/// assigned.
pub(crate) struct RecordStream {
    feed: RecordFeed,
    skip_empty: bool,
    next_index: u64,
    observer: Option<Arc<JobContext>>,
}

impl RecordStream {
    pub fn new(feed: RecordFeed, skip_empty: bool, observer: Option<Arc<JobContext>>) -> Self {
        Self {
            feed,
            skip_empty,
            next_index: 0,
            observer,
        }
    }

    pub async fn next(&mut self) -> Result<Option<ProcessedRecord>> {
        loop {
            let Some(raw) = self.feed.next().await? else {
                return Ok(None);
            };
            if self.skip_empty && is_empty_row(&raw) {
                continue;
            }
            let index = self.next_index;
            self.next_index += 1;
            if let Some(ctx) = &self.observer {
                ctx.observe_record(index);
            }
            return Ok(Some(ProcessedRecord::pending(index, raw)));
        }
    }
}

/// A group of up to `batch_size` records with its 0-based batch index
#[derive(Debug)]
pub(crate) struct RecordBatch {
    pub index: usize,
    pub records: Vec<ProcessedRecord>,
}

/// Splits a record stream into fixed-size batches
///
/// The final group may be short; an exhausted stream yields `None`.
pub(crate) struct BatchSplitter {
    batch_size: usize,
    next_batch_index: usize,
}

impl BatchSplitter {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            next_batch_index: 0,
        }
    }

    pub async fn next_batch(&mut self, stream: &mut RecordStream) -> Result<Option<RecordBatch>> {
        let mut records = Vec::with_capacity(self.batch_size);
        while records.len() < self.batch_size {
            match stream.next().await? {
                Some(record) => records.push(record),
                None => break,
            }
        }
        if records.is_empty() {
            return Ok(None);
        }
        let index = self.next_batch_index;
        self.next_batch_index += 1;
        Ok(Some(RecordBatch { index, records }))
    }
}
