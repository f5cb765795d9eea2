use std::sync::Arc;

use uuid::Uuid;

use crate::codec::ErrorCode;
use crate::signaling::OutboundSignal;
use crate::state::CallMode;

/// Events emitted by the call facade to native UI listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    IncomingCall { session_id: Uuid, from: String, mode: CallMode },
    StatusChanged { session_id: Uuid, status: CallStatus },
    LocalStreamReady { session_id: Uuid, stream_id: String },
    RemoteStreamReady { session_id: Uuid, stream_id: String },
    SignalingProduced(OutboundSignal),
    MuteChanged { session_id: Uuid, muted: bool },
    VideoChanged { session_id: Uuid, enabled: bool },
    Error { session_id: Uuid, code: ErrorCode, message: String },
}

/// What the UI shows for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// Incoming call the user has not accepted yet.
    Ringing,
    Connecting,
    Connected,
    Ended,
    Failed,
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait CallEventListener: Send + Sync {
    fn on_event(&self, event: CallEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone)]
pub struct EventEmitter {
    listeners: Arc<std::sync::RwLock<Vec<Arc<dyn CallEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(std::sync::RwLock::new(Vec::new())),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn CallEventListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    pub fn emit(&self, event: CallEvent) {
        let listeners = self.listeners.read().unwrap();
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
