//! Fire-and-forget notifications from core threads to whatever front-end is
//! attached. Delivery order and timing on the receiving side are the
//! front-end's business.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::call::CallSnapshot;

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// Human-readable status line.
    Log(String),
    /// Call state or caller info changed; redraw the call display.
    CallChanged(CallSnapshot),
    /// An incoming call started ringing: raise and focus the window.
    Raise,
    /// One period of the ring alert elapsed: beep.
    Alert,
    /// The incoming-call listener lost its link while it was meant to run.
    ListenerLost,
}

/// Receiving end of core notifications. Must be callable from any thread.
pub trait UiSink: Send + Sync {
    fn post(&self, event: UiEvent);
}

impl UiSink for UnboundedSender<UiEvent> {
    fn post(&self, event: UiEvent) {
        // A closed front-end just stops listening.
        let _ = self.send(event);
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl UiSink for NullSink {
    fn post(&self, _event: UiEvent) {}
}

/// Cheap handle the core passes around for user-facing messages. Every
/// message is traced and posted to the sink.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn UiSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn UiSink>) -> Self {
        Self { sink }
    }

    pub fn log(&self, msg: impl Into<String>) {
        let msg = msg.into();
        info!(target: "hfp_bridge::ui", "{msg}");
        self.sink.post(UiEvent::Log(msg));
    }

    pub fn post(&self, event: UiEvent) {
        self.sink.post(event);
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}
