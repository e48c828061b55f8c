// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Internal pub/sub event bus: every lifecycle occurrence in the agent loop
//! (session, message/part, tool, permission, hook, token manager, subagent,
//! MCP, system) is published here, batched, and fanned out to subscribers.
//!
//! This is distinct from [`crate::events::AgentEvent`], which remains the
//! CLI-facing streamed output; the bus is the structural/observability layer
//! underneath it. A subscriber *could* bridge bus events into `AgentEvent`s,
//! but nothing requires it to.
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;

/// The sealed lifecycle event hierarchy.
#[derive(Debug, Clone)]
pub enum Event {
    SessionStarted { session_id: String },
    SessionEnded { session_id: String },
    PartCreated { part_id: String, kind: String },
    PartUpdated { part_id: String, kind: String, status: String },
    ToolCallStarted { call_id: String, tool_name: String },
    ToolCallFinished { call_id: String, tool_name: String, is_error: bool },
    PermissionRequested { tool_name: String, resource: String },
    PermissionDecided { tool_name: String, resource: String, action: String },
    HookTriggered { trigger: String, hook_name: String },
    HookVetoed { trigger: String, hook_name: String, reason: String },
    OutputTruncated { call_id: String, original_bytes: usize, truncated_bytes: usize, spill_path: Option<String> },
    OutputsPruned { reclaimed_tokens: u64, pruned_count: usize },
    ContextCompacted { tokens_before: u64, tokens_after: u64, strategy: String },
    SubSessionCreated { sub_session_id: String, slug: String, parent_id: String },
    SubSessionProgress { sub_session_id: String, message: String },
    SubSessionEnded { sub_session_id: String, status: String },
    McpServerConnected { server: String },
    McpServerDisconnected { server: String, reason: Option<String> },
    SystemError { message: String },
}

impl Event {
    /// Coarse category used for subscription filtering, mirroring the
    /// groupings the variants are documented under above.
    pub fn category(&self) -> &'static str {
        match self {
            Event::SessionStarted { .. } | Event::SessionEnded { .. } => "session",
            Event::PartCreated { .. } | Event::PartUpdated { .. } => "part",
            Event::ToolCallStarted { .. } | Event::ToolCallFinished { .. } => "tool",
            Event::PermissionRequested { .. } | Event::PermissionDecided { .. } => "permission",
            Event::HookTriggered { .. } | Event::HookVetoed { .. } => "hook",
            Event::OutputTruncated { .. } | Event::OutputsPruned { .. } | Event::ContextCompacted { .. } => "token",
            Event::SubSessionCreated { .. } | Event::SubSessionProgress { .. } | Event::SubSessionEnded { .. } => "subagent",
            Event::McpServerConnected { .. } | Event::McpServerDisconnected { .. } => "mcp",
            Event::SystemError { .. } => "system",
        }
    }
}

/// An envelope wrapping a published [`Event`] with bus-assigned metadata.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub id: u64,
    pub timestamp_ms: u64,
    pub source: String,
    pub event: Event,
}

/// Returned by `subscribe`; dropping or calling [`Subscription::dispose`]
/// unregisters the handler.
pub struct Subscription {
    id: u64,
    bus: Arc<EventBusInner>,
}

impl Subscription {
    pub fn dispose(self) {
        // Drop impl does the work; this makes intent explicit at call sites.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

type Handler = Box<dyn Fn(&EventEnvelope) + Send + Sync>;

struct Subscriber {
    id: u64,
    category: Option<&'static str>,
    filter: Option<Box<dyn Fn(&Event) -> bool + Send + Sync>>,
    handler: Handler,
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("event bus already disposed")]
    AlreadyDisposed,
}

const BATCH_SIZE: usize = 100;
const BATCH_WINDOW: Duration = Duration::from_millis(16);

struct EventBusInner {
    subscribers: StdMutex<Vec<Subscriber>>,
    next_sub_id: AtomicU64,
    next_event_id: AtomicU64,
    disposed: AtomicBool,
}

impl EventBusInner {
    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().retain(|s| s.id != id);
    }
}

/// Batches published events (N=100 or a 16ms window, whichever comes first)
/// and fans them out to subscribers on a single consumer task. Handler
/// panics/errors are caught and logged, never halting the rest of the batch.
pub struct EventBus {
    inner: Arc<EventBusInner>,
    queue_tx: mpsc::UnboundedSender<EventEnvelope>,
    consumer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<EventEnvelope>();
        let inner = Arc::new(EventBusInner {
            subscribers: StdMutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(1),
            next_event_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        });

        let consumer_inner = inner.clone();
        let consumer = tokio::spawn(async move {
            let mut batch: Vec<EventEnvelope> = Vec::with_capacity(BATCH_SIZE);
            let mut ticker = interval(BATCH_WINDOW);
            loop {
                tokio::select! {
                    maybe = queue_rx.recv() => {
                        match maybe {
                            Some(env) => {
                                batch.push(env);
                                if batch.len() >= BATCH_SIZE {
                                    dispatch_batch(&consumer_inner, &mut batch).await;
                                }
                            }
                            None => {
                                dispatch_batch(&consumer_inner, &mut batch).await;
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if !batch.is_empty() {
                            dispatch_batch(&consumer_inner, &mut batch).await;
                        }
                    }
                }
            }
        });

        Arc::new(Self {
            inner,
            queue_tx,
            consumer: Mutex::new(Some(consumer)),
        })
    }

    /// Publish an event; `source` identifies the emitting component
    /// (e.g. `"agent"`, `"supervisor:review"`).
    pub fn publish(&self, source: impl Into<String>, event: Event) -> Result<(), EventBusError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(EventBusError::AlreadyDisposed);
        }
        let envelope = EventEnvelope {
            id: self.inner.next_event_id.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: monotonic_ms(),
            source: source.into(),
            event,
        };
        // An unbounded channel only errors if the receiver is gone, which
        // only happens after dispose(); treat that the same as disposed.
        self.queue_tx
            .send(envelope)
            .map_err(|_| EventBusError::AlreadyDisposed)
    }

    /// Subscribe to every event in `category` (see [`Event::category`]).
    pub fn subscribe(
        self: &Arc<Self>,
        category: &'static str,
        handler: impl Fn(&EventEnvelope) + Send + Sync + 'static,
    ) -> Result<Subscription, EventBusError> {
        self.subscribe_filtered(Some(category), None, handler)
    }

    /// Subscribe to every event, regardless of category.
    pub fn subscribe_all(
        self: &Arc<Self>,
        handler: impl Fn(&EventEnvelope) + Send + Sync + 'static,
    ) -> Result<Subscription, EventBusError> {
        self.subscribe_filtered(None, None, handler)
    }

    /// Subscribe with an additional predicate evaluated per-event.
    pub fn subscribe_filtered(
        self: &Arc<Self>,
        category: Option<&'static str>,
        filter: Option<Box<dyn Fn(&Event) -> bool + Send + Sync>>,
        handler: impl Fn(&EventEnvelope) + Send + Sync + 'static,
    ) -> Result<Subscription, EventBusError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(EventBusError::AlreadyDisposed);
        }
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let sub = Subscriber {
            id,
            category,
            filter,
            handler: Box::new(handler),
        };
        self.inner.subscribers.lock().unwrap().push(sub);
        Ok(Subscription {
            id,
            bus: self.inner.clone(),
        })
    }

    /// Stop accepting further publishes/subscribes and abort the consumer
    /// task. Safe to call multiple times.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.consumer.lock().await.take() {
            handle.abort();
        }
    }
}

async fn dispatch_batch(inner: &Arc<EventBusInner>, batch: &mut Vec<EventEnvelope>) {
    if batch.is_empty() {
        return;
    }
    let subs = inner.subscribers.lock().unwrap();
    for envelope in batch.iter() {
        for sub in subs.iter() {
            if let Some(cat) = sub.category {
                if envelope.event.category() != cat {
                    continue;
                }
            }
            if let Some(filter) = &sub.filter {
                if !filter(&envelope.event) {
                    continue;
                }
            }
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (sub.handler)(envelope);
            }));
            if let Err(panic) = result {
                tracing::error!(
                    subscriber_id = sub.id,
                    event_id = envelope.id,
                    "event bus handler panicked: {:?}",
                    panic
                );
            }
        }
    }
    batch.clear();
}

fn monotonic_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A no-op handler registry snapshot, useful for tests that just want to
/// assert events got published without caring about fan-out timing.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Arc<std::sync::Mutex<Vec<Event>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> impl Fn(&EventEnvelope) + Send + Sync + 'static {
        let events = self.events.clone();
        move |envelope: &EventEnvelope| {
            events.lock().unwrap().push(envelope.event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new();
        let sink = RecordingSink::new();
        let _sub = bus.subscribe_all(sink.handler()).unwrap();

        bus.publish("test", Event::SessionStarted { session_id: "s1".into() }).unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        matches!(events[0], Event::SessionStarted { .. });
    }

    #[tokio::test]
    async fn category_filter_excludes_other_categories() {
        let bus = EventBus::new();
        let sink = RecordingSink::new();
        let _sub = bus.subscribe("tool", sink.handler()).unwrap();

        bus.publish("test", Event::SessionStarted { session_id: "s1".into() }).unwrap();
        bus.publish(
            "test",
            Event::ToolCallStarted { call_id: "c1".into(), tool_name: "bash".into() },
        )
        .unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn dispose_rejects_further_publish() {
        let bus = EventBus::new();
        bus.dispose().await;
        let result = bus.publish("test", Event::SessionStarted { session_id: "s1".into() });
        assert!(matches!(result, Err(EventBusError::AlreadyDisposed)));
    }

    #[tokio::test]
    async fn dispose_rejects_further_subscribe() {
        let bus = EventBus::new();
        bus.dispose().await;
        let sink = RecordingSink::new();
        let result = bus.subscribe_all(sink.handler());
        assert!(matches!(result, Err(EventBusError::AlreadyDisposed)));
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let bus = EventBus::new();
        let sink = RecordingSink::new();
        let sub = bus.subscribe_all(sink.handler()).unwrap();
        drop(sub);
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        bus.publish("test", Event::SessionStarted { session_id: "s1".into() }).unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        assert_eq!(sink.events.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn handler_panic_does_not_stop_other_handlers() {
        let bus = EventBus::new();
        let sink = RecordingSink::new();
        let _panicking = bus
            .subscribe_all(|_env: &EventEnvelope| panic!("boom"))
            .unwrap();
        let _sub = bus.subscribe_all(sink.handler()).unwrap();

        bus.publish("test", Event::SessionStarted { session_id: "s1".into() }).unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn batches_on_size_threshold() {
        let bus = EventBus::new();
        let sink = RecordingSink::new();
        let _sub = bus.subscribe_all(sink.handler()).unwrap();

        for i in 0..150 {
            bus.publish(
                "test",
                Event::SubSessionProgress {
                    sub_session_id: "s".into(),
                    message: format!("tick {i}"),
                },
            )
            .unwrap();
        }
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert_eq!(sink.events.lock().unwrap().len(), 150);
    }
}
