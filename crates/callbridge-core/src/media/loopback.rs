//! In-memory media backend.
//!
//! Produces syntactically plausible SDP and host candidates without touching
//! any device. Every side effect is recorded in a [`LoopbackProbe`] so callers
//! can check what the controller did to the "hardware".

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    LocalMediaStream, MediaConstraints, MediaDevices, PeerConnection, PeerObserver,
    RtcConfiguration,
};
use crate::errors::CallError;
use crate::signaling::{IceCandidate, SessionDescription};

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Refuse `get_user_media`, as if the user denied the permission prompt.
    pub deny_media: bool,
    /// Report a remote track once both descriptions are set.
    pub auto_remote_track: bool,
    /// Host candidates gathered after each local description.
    pub local_candidates: usize,
    /// Refuse to create a peer connection.
    pub fail_peer_connection: bool,
    /// Refuse to attach the local stream to a new peer connection.
    pub fail_add_stream: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            deny_media: false,
            auto_remote_track: true,
            local_candidates: 2,
            fail_peer_connection: false,
            fail_add_stream: false,
        }
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    media_requests: usize,
    streams_stopped: usize,
    peers_created: usize,
    peers_closed: usize,
    applied_candidates: Vec<IceCandidate>,
    remote_descriptions: Vec<SessionDescription>,
    observer: Option<PeerObserver>,
}

/// Shared record of what happened to the loopback devices.
#[derive(Debug, Clone, Default)]
pub struct LoopbackProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl LoopbackProbe {
    pub fn media_requests(&self) -> usize {
        self.state.lock().unwrap().media_requests
    }

    pub fn streams_stopped(&self) -> usize {
        self.state.lock().unwrap().streams_stopped
    }

    pub fn peers_created(&self) -> usize {
        self.state.lock().unwrap().peers_created
    }

    pub fn peers_closed(&self) -> usize {
        self.state.lock().unwrap().peers_closed
    }

    /// Candidates accepted by the peer connection, in application order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().applied_candidates.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().unwrap().remote_descriptions.clone()
    }

    /// Simulate remote media arriving on the most recent peer connection.
    /// Returns false when no peer connection was ever created.
    pub fn emit_remote_track(&self, stream_id: &str) -> bool {
        let observer = self.state.lock().unwrap().observer.clone();
        match observer {
            Some(observer) => {
                observer.on_remote_track(stream_id);
                true
            }
            None => false,
        }
    }
}

pub struct LoopbackDevices {
    config: LoopbackConfig,
    probe: LoopbackProbe,
}

impl LoopbackDevices {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            probe: LoopbackProbe::default(),
        }
    }

    pub fn probe(&self) -> LoopbackProbe {
        self.probe.clone()
    }
}

impl Default for LoopbackDevices {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Box<dyn LocalMediaStream>, CallError> {
        self.probe.state.lock().unwrap().media_requests += 1;
        if self.config.deny_media {
            return Err(CallError::MediaAcquisition(
                "permission denied for camera/microphone".into(),
            ));
        }
        Ok(Box::new(LoopbackStream {
            id: format!("local-{}", Uuid::new_v4()),
            has_video: constraints.video,
            audio_enabled: constraints.audio,
            video_enabled: constraints.video,
            probe: self.probe.clone(),
        }))
    }

    async fn create_peer_connection(
        &self,
        config: &RtcConfiguration,
        observer: PeerObserver,
    ) -> Result<Box<dyn PeerConnection>, CallError> {
        if self.config.fail_peer_connection {
            return Err(CallError::MediaAcquisition("peer connection unavailable".into()));
        }
        let serial = {
            let mut state = self.probe.state.lock().unwrap();
            state.peers_created += 1;
            state.observer = Some(observer.clone());
            state.peers_created
        };
        tracing::debug!(serial, ice_servers = ?config.ice_servers, "loopback peer connection created");
        Ok(Box::new(LoopbackPeer {
            serial,
            config: self.config.clone(),
            observer,
            probe: self.probe.clone(),
            has_video: false,
            local: None,
            remote: None,
            remote_track_sent: false,
            closed: false,
        }))
    }
}

struct LoopbackStream {
    id: String,
    has_video: bool,
    audio_enabled: bool,
    video_enabled: bool,
    probe: LoopbackProbe,
}

impl LocalMediaStream for LoopbackStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn has_video(&self) -> bool {
        self.has_video
    }

    fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    fn set_audio_enabled(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
    }

    fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    fn set_video_enabled(&mut self, enabled: bool) {
        if self.has_video {
            self.video_enabled = enabled;
        }
    }

    fn stop(&mut self) {
        self.audio_enabled = false;
        self.video_enabled = false;
        self.probe.state.lock().unwrap().streams_stopped += 1;
    }
}

struct LoopbackPeer {
    serial: usize,
    config: LoopbackConfig,
    observer: PeerObserver,
    probe: LoopbackProbe,
    has_video: bool,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_track_sent: bool,
    closed: bool,
}

impl LoopbackPeer {
    fn sdp(&self, role: &str) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=callbridge-{role}\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            self.serial
        );
        if self.has_video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        sdp
    }

    fn ensure_open(&self) -> Result<(), CallError> {
        if self.closed {
            return Err(CallError::SignalingApply("peer connection is closed".into()));
        }
        Ok(())
    }

    fn maybe_report_remote_track(&mut self) {
        if self.config.auto_remote_track
            && !self.remote_track_sent
            && self.local.is_some()
            && self.remote.is_some()
        {
            self.remote_track_sent = true;
            self.observer.on_remote_track(format!("remote-{}", self.serial));
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn add_local_stream(&mut self, stream: &dyn LocalMediaStream) -> Result<(), CallError> {
        self.ensure_open()?;
        if self.config.fail_add_stream {
            return Err(CallError::MediaAcquisition(format!("cannot attach stream {}", stream.id())));
        }
        self.has_video = stream.has_video();
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, CallError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, CallError> {
        self.ensure_open()?;
        if self.remote.is_none() {
            return Err(CallError::SignalingApply("cannot answer without a remote offer".into()));
        }
        Ok(SessionDescription::answer(self.sdp("answer")))
    }

    async fn set_local_description(&mut self, description: SessionDescription) -> Result<(), CallError> {
        self.ensure_open()?;
        self.local = Some(description);
        for n in 0..self.config.local_candidates {
            self.observer.on_ice_candidate(IceCandidate {
                candidate: format!(
                    "candidate:{n} 1 udp 2122260223 127.0.0.1 {} typ host",
                    50_000 + self.serial * 100 + n
                ),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            });
        }
        self.maybe_report_remote_track();
        Ok(())
    }

    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<(), CallError> {
        self.ensure_open()?;
        if !description.sdp.starts_with("v=0") {
            return Err(CallError::SignalingApply("malformed session description".into()));
        }
        self.probe.state.lock().unwrap().remote_descriptions.push(description.clone());
        self.remote = Some(description);
        self.maybe_report_remote_track();
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError> {
        self.ensure_open()?;
        if self.remote.is_none() {
            return Err(CallError::SignalingApply(
                "candidate applied before remote description".into(),
            ));
        }
        self.probe.state.lock().unwrap().applied_candidates.push(candidate);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
        self.probe.state.lock().unwrap().peers_closed += 1;
    }
}
