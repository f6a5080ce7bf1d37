//! Shared control surface between the supervisor and a project's worker.
//!
//! Pause/cancel must interrupt an in-flight round, so they are flags the
//! control API can set from any thread; the round-interrupt token wakes the
//! blocked wait. Commands that only matter while the worker is idle (wake,
//! resume, approve) travel through the worker's mailbox instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anima_types::EventKind;

use crate::cancel::CancellationToken;

/// Callback the engine and scheduler use to publish events. The supervisor
/// wires it to the bus with the project id attached.
pub type EventSink = Arc<dyn Fn(EventKind) + Send + Sync>;

/// An event sink that discards everything (tests, detached runs).
pub fn null_sink() -> EventSink {
    Arc::new(|_| {})
}

/// Control flags shared between the control API and one project's worker.
pub struct ProjectControls {
    /// User asked to cancel the in-progress milestone.
    cancel_milestone: AtomicBool,
    /// User asked to pause the project.
    pause: AtomicBool,
    /// Wakes any in-flight round wait. Reset by the worker after handling.
    pub round_interrupt: CancellationToken,
    /// Process-wide shutdown, owned by the supervisor. Never reset.
    pub shutdown: CancellationToken,
}

impl ProjectControls {
    pub fn new(shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            cancel_milestone: AtomicBool::new(false),
            pause: AtomicBool::new(false),
            round_interrupt: CancellationToken::new(),
            shutdown,
        })
    }

    /// Request cancellation of the current milestone.
    pub fn request_cancel(&self) {
        self.cancel_milestone.store(true, Ordering::Release);
        self.round_interrupt.cancel();
    }

    /// Request a pause.
    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::Release);
        self.round_interrupt.cancel();
    }

    /// Consume the cancel request, if any.
    pub fn take_cancel(&self) -> bool {
        self.cancel_milestone.swap(false, Ordering::AcqRel)
    }

    /// Consume the pause request, if any.
    pub fn take_pause(&self) -> bool {
        self.pause.swap(false, Ordering::AcqRel)
    }

    /// Whether anything should interrupt a blocking wait right now.
    pub fn interrupted(&self) -> bool {
        self.round_interrupt.is_cancelled() || self.shutdown.is_cancelled()
    }

    /// Clear the round interrupt after the worker has acted on it.
    pub fn clear_interrupt(&self) {
        self.round_interrupt.reset();
    }
}
