//! The event bus.
//!
//! Append-only, thread-safe fan-out of [`AnimaEvent`]s. Each subscriber
//! gets its own queue consumed as a lazy sequence. A slow subscriber may
//! lose `agent_stream_chunk` events (bounded in-flight budget) but never
//! loses any other kind; per-project ordering is preserved because
//! publishing happens under one lock in emission order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use anima_types::AnimaEvent;

/// Max in-flight stream-chunk events per subscriber before chunks drop.
const CHUNK_BACKLOG_LIMIT: usize = 256;

struct Subscriber {
    tx: mpsc::Sender<AnimaEvent>,
    pending_chunks: Arc<AtomicUsize>,
    project_filter: Option<String>,
}

/// Fan-out hub for all project events.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to all events, or only one project's.
    pub fn subscribe(&self, project_filter: Option<&str>) -> EventStream {
        let (tx, rx) = mpsc::channel();
        let pending_chunks = Arc::new(AtomicUsize::new(0));
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber {
                tx,
                pending_chunks: Arc::clone(&pending_chunks),
                project_filter: project_filter.map(String::from),
            });
        EventStream { rx, pending_chunks }
    }

    /// Publish one event to every matching subscriber. Dead subscribers are
    /// pruned; lagging subscribers lose only droppable events.
    pub fn publish(&self, event: AnimaEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|sub| {
            if let Some(filter) = &sub.project_filter {
                if filter != &event.project_id {
                    return true;
                }
            }

            if event.is_droppable() {
                if sub.pending_chunks.load(Ordering::Acquire) >= CHUNK_BACKLOG_LIMIT {
                    debug!(project = event.project_id, "dropping stream chunk for slow subscriber");
                    return true;
                }
                sub.pending_chunks.fetch_add(1, Ordering::AcqRel);
            }

            sub.tx.send(event.clone()).is_ok()
        });
    }

    /// Number of live subscribers (for tests and status).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A lazy, single-consumer sequence of events.
pub struct EventStream {
    rx: mpsc::Receiver<AnimaEvent>,
    pending_chunks: Arc<AtomicUsize>,
}

impl EventStream {
    /// Blocking receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<AnimaEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                self.note_consumed(&event);
                Some(event)
            }
            Err(_) => None,
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<AnimaEvent> {
        match self.rx.try_recv() {
            Ok(event) => {
                self.note_consumed(&event);
                Some(event)
            }
            Err(_) => None,
        }
    }

    fn note_consumed(&self, event: &AnimaEvent) {
        if event.is_droppable() {
            self.pending_chunks.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Iterator for EventStream {
    type Item = AnimaEvent;

    fn next(&mut self) -> Option<AnimaEvent> {
        match self.rx.recv() {
            Ok(event) => {
                self.note_consumed(&event);
                Some(event)
            }
            Err(_) => None,
        }
    }
}
