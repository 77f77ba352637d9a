//! Data-source and parser ports
//!
//! Concrete sources (buffers, files, HTTP bodies) and parsers (CSV, JSON,
//! XML) live outside the engine; the engine only pulls chunks through a
//! parser into raw records. `read` consumes the boxed source, so a source
//! can only ever be streamed once.

use crate::record::RawRecord;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::VecDeque;

/// One element of a source's chunk stream
#[derive(Debug, Clone)]
pub enum SourceChunk {
    Text(String),
    Bytes(Vec<u8>),
}

impl SourceChunk {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SourceChunk::Text(s) => s.as_bytes(),
            SourceChunk::Bytes(b) => b,
        }
    }
}

/// Descriptive metadata a source may know about its input
#[derive(Debug, Clone, Default)]
pub struct SourceMetadata {
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
}

/// An abstract chunked input
#[async_trait]
pub trait DataSource: Send {
    /// Stream the input once; consuming the source makes re-reading a
    /// compile-time impossibility
    fn read(self: Box<Self>) -> BoxStream<'static, Result<SourceChunk>>;

    /// A small prefix of the input, for format sniffing by collaborators
    async fn sample(&mut self, _max_bytes: Option<usize>) -> Result<String> {
        Ok(String::new())
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata::default()
    }
}

/// Turns source chunks into raw records
///
/// `parse` may buffer partial records across chunk boundaries; `finish`
/// flushes whatever remains once the stream ends.
#[async_trait]
pub trait Parser: Send {
    async fn parse(&mut self, chunk: SourceChunk) -> Result<Vec<RawRecord>>;

    async fn finish(&mut self) -> Result<Vec<RawRecord>> {
        Ok(Vec::new())
    }
}

/// Pulls chunks through the parser and hands out raw records one at a time
pub(crate) struct RecordFeed {
    chunks: BoxStream<'static, Result<SourceChunk>>,
    parser: Box<dyn Parser>,
    queue: VecDeque<RawRecord>,
    done: bool,
}

impl RecordFeed {
    pub fn new(source: Box<dyn DataSource>, parser: Box<dyn Parser>) -> Self {
        Self {
            chunks: source.read(),
            parser,
            queue: VecDeque::new(),
            done: false,
        }
    }

    pub async fn next(&mut self) -> Result<Option<RawRecord>> {
        loop {
            if let Some(record) = self.queue.pop_front() {
                return Ok(Some(record));
            }
            if self.done {
                return Ok(None);
            }
            match self.chunks.next().await {
                Some(chunk) => {
                    let records = self.parser.parse(chunk?).await?;
                    self.queue.extend(records);
                }
                None => {
                    self.done = true;
                    let records = self.parser.finish().await?;
                    self.queue.extend(records);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct ChunkedSource(Vec<&'static str>);

    #[async_trait]
    impl DataSource for ChunkedSource {
        fn read(self: Box<Self>) -> BoxStream<'static, Result<SourceChunk>> {
            futures::stream::iter(
                self.0
                    .into_iter()
                    .map(|s| Ok(SourceChunk::Text(s.to_string())))
                    .collect::<Vec<_>>(),
            )
            .boxed()
        }
    }

    /// Splits on commas, buffering a trailing fragment across chunks
    struct CommaParser {
        pending: String,
    }

    impl CommaParser {
        fn record(value: &str) -> RawRecord {
            let mut raw = RawRecord::new();
            raw.insert("value".into(), json!(value));
            raw
        }
    }

    #[async_trait]
    impl Parser for CommaParser {
        async fn parse(&mut self, chunk: SourceChunk) -> Result<Vec<RawRecord>> {
            self.pending
                .push_str(std::str::from_utf8(chunk.as_bytes())?);
            let mut out = Vec::new();
            while let Some(pos) = self.pending.find(',') {
                let value: String = self.pending.drain(..=pos).take(pos).collect();
                out.push(Self::record(&value));
            }
            Ok(out)
        }

        async fn finish(&mut self) -> Result<Vec<RawRecord>> {
            if self.pending.is_empty() {
                return Ok(Vec::new());
            }
            let value = std::mem::take(&mut self.pending);
            Ok(vec![Self::record(&value)])
        }
    }

    #[tokio::test]
    async fn test_feed_reassembles_across_chunk_boundaries() {
        let source = Box::new(ChunkedSource(vec!["a,b", "c,d", "e"]));
        let parser = Box::new(CommaParser {
            pending: String::new(),
        });
        let mut feed = RecordFeed::new(source, parser);

        let mut values = Vec::new();
        while let Some(record) = feed.next().await.unwrap() {
            values.push(record["value"].as_str().unwrap().to_string());
        }
        assert_eq!(values, vec!["a", "bc", "de"]);
    }

    #[tokio::test]
    async fn test_feed_empty_source() {
        let source = Box::new(ChunkedSource(vec![]));
        let parser = Box::new(CommaParser {
            pending: String::new(),
        });
        let mut feed = RecordFeed::new(source, parser);
        assert!(feed.next().await.unwrap().is_none());
    }
}
