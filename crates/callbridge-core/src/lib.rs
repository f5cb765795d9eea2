//! Callbridge core: one-to-one audio/video calls.
//!
//! Pure Rust crate with no platform dependencies. The host shell drives a
//! [`CallFacade`]; media work runs in a [`MediaSessionController`] reached
//! only through the JSON envelope channel. Real WebRTC stacks plug in behind
//! the traits in [`media`].

pub mod channel;
pub mod codec;
pub mod controller;
pub mod errors;
pub mod events;
pub mod facade;
pub mod ice_queue;
pub mod logging;
pub mod media;
pub mod settings;
pub mod signaling;
pub mod state;

pub use codec::{Command, ErrorCode, Event};
pub use controller::MediaSessionController;
pub use errors::CallError;
pub use events::{CallEvent, CallEventListener, CallStatus};
pub use facade::{CallFacade, CallSession};
pub use logging::init_logging;
pub use settings::{Settings, SettingsStore};
pub use signaling::{IceCandidate, OutboundSignal, SessionDescription, SignalingMessage, SignalingRelay};
pub use state::{CallMode, CallRole, CallState};
