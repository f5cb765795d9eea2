//! Seams to the platform media engine.
//!
//! The controller never touches a camera, a microphone or a WebRTC stack
//! directly; it goes through [`MediaDevices`], [`LocalMediaStream`] and
//! [`PeerConnection`]. Platform shells provide real implementations, and
//! [`loopback`] provides an in-memory one.

pub mod loopback;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::CallError;
use crate::settings::Settings;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::state::CallMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn for_mode(mode: CallMode) -> Self {
        Self { audio: true, video: mode.is_video() }
    }
}

/// Peer connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<String>,
}

impl From<&Settings> for RtcConfiguration {
    fn from(settings: &Settings) -> Self {
        Self { ice_servers: settings.ice_servers.clone() }
    }
}

/// Camera/microphone capture owned by a single session.
pub trait LocalMediaStream: Send + Sync {
    fn id(&self) -> &str;
    fn has_video(&self) -> bool;
    fn audio_enabled(&self) -> bool;
    fn set_audio_enabled(&mut self, enabled: bool);
    fn video_enabled(&self) -> bool;
    fn set_video_enabled(&mut self, enabled: bool);
    /// Release the capture devices. Called exactly once per stream.
    fn stop(&mut self);
}

/// Notifications pushed by the peer connection primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    RemoteTrack { stream_id: String },
}

/// Handle given to a peer connection so it can report candidates and tracks
/// back to the controller's event loop.
#[derive(Debug, Clone)]
pub struct PeerObserver {
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerObserver {
    pub fn new(tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { tx }
    }

    pub fn on_ice_candidate(&self, candidate: IceCandidate) {
        self.notify(PeerEvent::IceCandidate(candidate));
    }

    pub fn on_remote_track(&self, stream_id: impl Into<String>) {
        self.notify(PeerEvent::RemoteTrack { stream_id: stream_id.into() });
    }

    fn notify(&self, event: PeerEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("peer event dropped: controller is gone");
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send {
    async fn add_local_stream(&mut self, stream: &dyn LocalMediaStream) -> Result<(), CallError>;
    async fn create_offer(&mut self) -> Result<SessionDescription, CallError>;
    async fn create_answer(&mut self) -> Result<SessionDescription, CallError>;
    async fn set_local_description(&mut self, description: SessionDescription) -> Result<(), CallError>;
    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<(), CallError>;
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError>;
    async fn close(&mut self);
}

/// Device and peer-connection factory provided by the platform.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Box<dyn LocalMediaStream>, CallError>;

    async fn create_peer_connection(
        &self,
        config: &RtcConfiguration,
        observer: PeerObserver,
    ) -> Result<Box<dyn PeerConnection>, CallError>;
}
