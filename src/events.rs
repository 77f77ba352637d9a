//! Typed publish/subscribe for lifecycle events
//!
//! Events form a closed union keyed by [`EventKind`]. Delivery is
//! synchronous inside [`EventBus::emit`] and in subscription order: first
//! every handler registered for the event's kind, then every wildcard
//! handler. A panicking handler is isolated; the remaining handlers still
//! receive the event.
//!
//! Subscriptions are identified by [`SubscriptionId`] tokens; closures have
//! no identity in Rust, so unsubscribing takes the token returned at
//! registration.

use crate::store::JobProgress;
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Event kinds, one per payload variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JobStarted,
    JobCompleted,
    JobPaused,
    JobAborted,
    JobFailed,
    JobProgress,
    BatchStarted,
    BatchCompleted,
    BatchFailed,
    RecordProcessed,
    RecordFailed,
    RecordRetried,
    ChunkCompleted,
    BatchClaimed,
    DistributedPrepared,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::JobStarted => "job:started",
            EventKind::JobCompleted => "job:completed",
            EventKind::JobPaused => "job:paused",
            EventKind::JobAborted => "job:aborted",
            EventKind::JobFailed => "job:failed",
            EventKind::JobProgress => "job:progress",
            EventKind::BatchStarted => "batch:started",
            EventKind::BatchCompleted => "batch:completed",
            EventKind::BatchFailed => "batch:failed",
            EventKind::RecordProcessed => "record:processed",
            EventKind::RecordFailed => "record:failed",
            EventKind::RecordRetried => "record:retried",
            EventKind::ChunkCompleted => "chunk:completed",
            EventKind::BatchClaimed => "batch:claimed",
            EventKind::DistributedPrepared => "distributed:prepared",
        };
        write!(f, "{}", name)
    }
}

/// Final counts reported with `job:completed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
    /// `max(0, total - processed - failed)`
    pub skipped: u64,
    pub elapsed_ms: u64,
}

/// Event-specific payload
#[derive(Debug, Clone)]
pub enum EventPayload {
    JobStarted,
    JobCompleted {
        summary: JobSummary,
    },
    JobPaused,
    JobAborted,
    JobFailed {
        error: String,
    },
    JobProgress {
        progress: JobProgress,
    },
    BatchStarted {
        batch_id: String,
        batch_index: usize,
        record_count: usize,
    },
    BatchCompleted {
        batch_id: String,
        batch_index: usize,
        processed_count: u64,
        failed_count: u64,
    },
    BatchFailed {
        batch_id: String,
        batch_index: usize,
        error: String,
    },
    RecordProcessed {
        record_index: u64,
    },
    RecordFailed {
        record_index: u64,
        error: String,
    },
    RecordRetried {
        record_index: u64,
        attempt: u32,
        error: String,
    },
    ChunkCompleted {
        done: bool,
        processed_records: u64,
        failed_records: u64,
    },
    BatchClaimed {
        batch_id: String,
        batch_index: usize,
        worker_id: String,
    },
    DistributedPrepared {
        total_records: u64,
        total_batches: usize,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::JobStarted => EventKind::JobStarted,
            EventPayload::JobCompleted { .. } => EventKind::JobCompleted,
            EventPayload::JobPaused => EventKind::JobPaused,
            EventPayload::JobAborted => EventKind::JobAborted,
            EventPayload::JobFailed { .. } => EventKind::JobFailed,
            EventPayload::JobProgress { .. } => EventKind::JobProgress,
            EventPayload::BatchStarted { .. } => EventKind::BatchStarted,
            EventPayload::BatchCompleted { .. } => EventKind::BatchCompleted,
            EventPayload::BatchFailed { .. } => EventKind::BatchFailed,
            EventPayload::RecordProcessed { .. } => EventKind::RecordProcessed,
            EventPayload::RecordFailed { .. } => EventKind::RecordFailed,
            EventPayload::RecordRetried { .. } => EventKind::RecordRetried,
            EventPayload::ChunkCompleted { .. } => EventKind::ChunkCompleted,
            EventPayload::BatchClaimed { .. } => EventKind::BatchClaimed,
            EventPayload::DistributedPrepared { .. } => EventKind::DistributedPrepared,
        }
    }
}

/// Envelope delivered to handlers
#[derive(Debug, Clone)]
pub struct Event {
    /// Wall-clock milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    pub job_id: String,
    pub payload: EventPayload,
}

impl Event {
    pub(crate) fn new(job_id: &str, payload: EventPayload) -> Self {
        Self {
            timestamp_ms: Utc::now().timestamp_millis(),
            job_id: job_id.to_string(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Token returned by `subscribe`; required to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct BusInner {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
    any: Vec<(SubscriptionId, Handler)>,
}

/// Synchronous event bus
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        // A handler can only panic outside the lock, so poisoning here means
        // a bug elsewhere; recover rather than propagate the panic.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a handler for one event kind
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler; returns whether it was present
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        if let Some(handlers) = inner.by_kind.get_mut(&kind) {
            let before = handlers.len();
            handlers.retain(|(h, _)| *h != id);
            return handlers.len() != before;
        }
        false
    }

    /// Register a wildcard handler, invoked after type-matched handlers
    pub fn subscribe_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.any.push((id, Arc::new(handler)));
        id
    }

    /// Remove a wildcard handler; returns whether it was present
    pub fn unsubscribe_any(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.any.len();
        inner.any.retain(|(h, _)| *h != id);
        inner.any.len() != before
    }

    /// Deliver an event synchronously to all matching handlers
    ///
    /// Handlers run outside the subscriber lock, so a handler may subscribe
    /// or unsubscribe re-entrantly; such changes take effect from the next
    /// emit.
    pub fn emit(&self, event: &Event) {
        let (matched, any) = {
            let inner = self.lock();
            let matched: Vec<Handler> = inner
                .by_kind
                .get(&event.kind())
                .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default();
            let any: Vec<Handler> = inner.any.iter().map(|(_, h)| h.clone()).collect();
            (matched, any)
        };

        for handler in matched.into_iter().chain(any) {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(kind = %event.kind(), job_id = %event.job_id, "event handler panicked; continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(payload: EventPayload) -> Event {
        Event::new("job-1", payload)
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(EventKind::JobStarted.to_string(), "job:started");
        assert_eq!(
            EventKind::DistributedPrepared.to_string(),
            "distributed:prepared"
        );
    }

    #[test]
    fn test_typed_handlers_before_wildcard() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        bus.subscribe_any(move |_| o.lock().unwrap().push("any"));
        let o = order.clone();
        bus.subscribe(EventKind::JobStarted, move |_| {
            o.lock().unwrap().push("typed")
        });

        bus.emit(&event(EventPayload::JobStarted));
        assert_eq!(*order.lock().unwrap(), vec!["typed", "any"]);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::JobStarted, |_| panic!("boom"));
        let s = seen.clone();
        bus.subscribe(EventKind::JobStarted, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&event(EventPayload::JobStarted));
        assert_eq!(seen.load(Ordering::SeqCst), 1, "second handler still ran");
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let s = seen.clone();
        let id = bus.subscribe(EventKind::JobPaused, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&event(EventPayload::JobPaused));
        assert!(bus.unsubscribe(EventKind::JobPaused, id));
        bus.emit(&event(EventPayload::JobPaused));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!bus.unsubscribe(EventKind::JobPaused, id), "already removed");
    }

    #[test]
    fn test_only_matching_kind_delivered() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let s = seen.clone();
        bus.subscribe(EventKind::RecordProcessed, move |e| {
            assert_eq!(e.job_id, "job-1");
            s.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&event(EventPayload::RecordProcessed { record_index: 7 }));
        bus.emit(&event(EventPayload::RecordFailed {
            record_index: 8,
            error: "x".into(),
        }));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
