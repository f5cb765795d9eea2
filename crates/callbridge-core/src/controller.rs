use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::channel::{CommandReceiver, EventSender};
use crate::codec::{Command, Event};
use crate::errors::CallError;
use crate::ice_queue::IceCandidateQueue;
use crate::media::{
    LocalMediaStream, MediaConstraints, MediaDevices, PeerConnection, PeerEvent, PeerObserver,
    RtcConfiguration,
};
use crate::signaling::{IceCandidate, SessionDescription};
use crate::state::{CallMode, CallState};

/// Sandbox-side owner of one call's peer connection and local media.
///
/// Commands and peer notifications are handled strictly one at a time, so
/// the candidate queue and the track set need no locking. Every outcome,
/// failures included, leaves through the event channel.
pub struct MediaSessionController {
    devices: Arc<dyn MediaDevices>,
    rtc_config: RtcConfiguration,
    events: EventSender,
    state: CallState,
    mode: Option<CallMode>,
    local_stream: Option<Box<dyn LocalMediaStream>>,
    peer: Option<Box<dyn PeerConnection>>,
    candidates: IceCandidateQueue,
    remote_description_set: bool,
    /// Remote stream seen before negotiation finished.
    early_remote_stream: Option<String>,
    remote_stream: Option<String>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
}

impl MediaSessionController {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        rtc_config: RtcConfiguration,
        events: EventSender,
    ) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            devices,
            rtc_config,
            events,
            state: CallState::Idle,
            mode: None,
            local_stream: None,
            peer: None,
            candidates: IceCandidateQueue::new(),
            remote_description_set: false,
            early_remote_stream: None,
            remote_stream: None,
            peer_tx,
            peer_rx,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn queued_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Event loop: runs until the host drops its command sender, then tears
    /// down whatever is left.
    pub async fn run(mut self, mut commands: CommandReceiver) {
        tracing::debug!("media session controller started");
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.end_call().await;
                        break;
                    }
                },
                Some(event) = self.peer_rx.recv() => self.handle_peer_event(event).await,
            }
        }
        tracing::debug!(state = %self.state, "media session controller stopped");
    }

    pub async fn handle_command(&mut self, command: Command) {
        if self.state.is_closing() && command != Command::EndCall {
            tracing::debug!(command = command.kind(), state = %self.state, "ignoring command on closed session");
            if self.state == CallState::Failed && references_peer(&command) {
                self.report(&CallError::InvalidState(format!(
                    "{}: no peer connection, local media failed",
                    command.kind()
                )));
            }
            return;
        }

        match command {
            Command::Init { is_video } => self.init(CallMode::from_is_video(is_video)).await,
            Command::CreateOffer => self.create_offer().await,
            Command::CreateAnswer { offer } => self.create_answer(offer).await,
            Command::HandleAnswer { answer } => self.handle_answer(answer).await,
            Command::AddIceCandidate { candidate } => self.add_ice_candidate(candidate).await,
            Command::ToggleMute => self.toggle_mute(),
            Command::ToggleVideo => self.toggle_video(),
            Command::SwitchCamera => {
                tracing::debug!("switchCamera is not supported; ignoring");
            }
            Command::EndCall => self.end_call().await,
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        if self.state.is_closing() {
            tracing::debug!(?event, "ignoring peer event on closed session");
            return;
        }
        match event {
            PeerEvent::IceCandidate(candidate) => {
                self.emit(Event::IceCandidate { candidate });
            }
            PeerEvent::RemoteTrack { stream_id } => self.on_remote_track(stream_id),
        }
    }

    /// Drain peer notifications that are already queued. Used when driving
    /// the controller by hand instead of through [`run`](Self::run).
    pub async fn pump_peer_events(&mut self) {
        while let Ok(event) = self.peer_rx.try_recv() {
            self.handle_peer_event(event).await;
        }
    }

    async fn init(&mut self, mode: CallMode) {
        if self.state != CallState::Idle {
            self.report(&CallError::InvalidState(format!("init while {}", self.state)));
            return;
        }
        self.mode = Some(mode);
        self.transition(CallState::Initializing);

        let stream = match self.devices.get_user_media(MediaConstraints::for_mode(mode)).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(e).await;
                return;
            }
        };
        let stream_id = stream.id().to_string();
        tracing::info!(%stream_id, ?mode, "local media acquired");
        self.emit(Event::LocalStream { id: stream_id });

        let observer = PeerObserver::new(self.peer_tx.clone());
        let mut peer = match self.devices.create_peer_connection(&self.rtc_config, observer).await {
            Ok(peer) => peer,
            Err(e) => {
                self.local_stream = Some(stream);
                self.fail(e).await;
                return;
            }
        };
        if let Err(e) = peer.add_local_stream(stream.as_ref()).await {
            self.local_stream = Some(stream);
            self.peer = Some(peer);
            self.fail(e).await;
            return;
        }
        self.local_stream = Some(stream);
        self.peer = Some(peer);
    }

    async fn create_offer(&mut self) {
        if let Err(e) = self.expect_state(CallState::Initializing, "createOffer") {
            self.report(&e);
            return;
        }
        let result = match self.peer.as_mut() {
            Some(peer) => negotiate_offer(peer.as_mut()).await,
            None => Err(no_peer("createOffer")),
        };
        match result {
            Ok(offer) => {
                self.emit(Event::Offer { sdp: offer.sdp });
                self.transition(CallState::AwaitingRemoteDescription);
            }
            Err(e) => self.report(&e),
        }
    }

    async fn create_answer(&mut self, offer: SessionDescription) {
        if let Err(e) = self.expect_state(CallState::Initializing, "createAnswer") {
            self.report(&e);
            return;
        }
        let Some(peer) = self.peer.as_mut() else {
            self.report(&no_peer("createAnswer"));
            return;
        };
        if let Err(e) = peer.set_remote_description(offer).await {
            self.report(&e);
            return;
        }
        self.remote_description_set = true;

        match negotiate_answer(peer.as_mut()).await {
            Ok(answer) => {
                self.emit(Event::Answer { sdp: answer.sdp });
                self.transition(CallState::Negotiating);
                self.flush_candidates().await;
                self.promote_early_remote_stream();
            }
            Err(e) => self.report(&e),
        }
    }

    async fn handle_answer(&mut self, answer: SessionDescription) {
        if let Err(e) = self.expect_state(CallState::AwaitingRemoteDescription, "handleAnswer") {
            self.report(&e);
            return;
        }
        let Some(peer) = self.peer.as_mut() else {
            self.report(&no_peer("handleAnswer"));
            return;
        };
        if let Err(e) = peer.set_remote_description(answer).await {
            self.report(&e);
            return;
        }
        self.remote_description_set = true;
        self.transition(CallState::Negotiating);
        self.flush_candidates().await;
        self.promote_early_remote_stream();
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) {
        match self.peer.as_mut() {
            Some(peer) if self.remote_description_set => {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    self.report(&e);
                }
            }
            _ => {
                self.candidates.enqueue(candidate);
                tracing::debug!(queued = self.candidates.len(), "remote candidate queued");
            }
        }
    }

    async fn flush_candidates(&mut self) {
        let Some(oldest) = self.candidates.oldest() else {
            return;
        };
        let waited_ms = (Utc::now() - oldest).num_milliseconds();
        let pending = self.candidates.drain();
        tracing::debug!(count = pending.len(), waited_ms, "applying queued remote candidates");
        for candidate in pending {
            let result = match self.peer.as_mut() {
                Some(peer) => peer.add_ice_candidate(candidate).await,
                None => Err(no_peer("addIceCandidate")),
            };
            if let Err(e) = result {
                self.report(&e);
            }
        }
    }

    fn on_remote_track(&mut self, stream_id: String) {
        if self.remote_stream.is_some() {
            tracing::debug!(%stream_id, "additional remote track ignored");
            return;
        }
        match self.state {
            CallState::Negotiating => self.connect_remote(stream_id),
            CallState::Initializing | CallState::AwaitingRemoteDescription => {
                tracing::debug!(%stream_id, state = %self.state, "remote track before negotiation finished");
                if self.early_remote_stream.is_none() {
                    self.early_remote_stream = Some(stream_id);
                }
            }
            _ => tracing::debug!(%stream_id, state = %self.state, "remote track ignored"),
        }
    }

    fn promote_early_remote_stream(&mut self) {
        if let Some(stream_id) = self.early_remote_stream.take() {
            self.connect_remote(stream_id);
        }
    }

    fn connect_remote(&mut self, stream_id: String) {
        tracing::info!(%stream_id, "remote media flowing");
        self.remote_stream = Some(stream_id.clone());
        self.emit(Event::RemoteStream { id: stream_id });
        self.transition(CallState::Connected);
    }

    fn toggle_mute(&mut self) {
        let Some(stream) = self.local_stream.as_mut() else {
            self.report(&CallError::InvalidState("toggleMute: no local media".into()));
            return;
        };
        let enabled = !stream.audio_enabled();
        stream.set_audio_enabled(enabled);
        self.emit(Event::MuteStatus { muted: !enabled });
    }

    fn toggle_video(&mut self) {
        if self.mode == Some(CallMode::Audio) {
            self.report(&CallError::UnsupportedOperation(
                "toggleVideo on an audio-only call".into(),
            ));
            return;
        }
        let Some(stream) = self.local_stream.as_mut() else {
            self.report(&CallError::InvalidState("toggleVideo: no local media".into()));
            return;
        };
        let enabled = !stream.video_enabled();
        stream.set_video_enabled(enabled);
        self.emit(Event::VideoStatus { enabled });
    }

    async fn end_call(&mut self) {
        if self.state.is_closing() {
            tracing::debug!(state = %self.state, "endCall on closed session");
            return;
        }
        self.transition(CallState::Ending);
        self.teardown().await;
        self.transition(CallState::Ended);
    }

    async fn fail(&mut self, error: CallError) {
        tracing::error!("media session failed: {error}");
        self.report(&error);
        self.teardown().await;
        self.transition(CallState::Failed);
    }

    /// Release everything the session holds. Safe to call more than once.
    async fn teardown(&mut self) {
        if let Some(mut stream) = self.local_stream.take() {
            stream.stop();
            tracing::info!(stream_id = stream.id(), "local media stopped");
        }
        if let Some(mut peer) = self.peer.take() {
            peer.close().await;
            tracing::info!("peer connection closed");
        }
        if !self.candidates.is_empty() {
            tracing::debug!(discarded = self.candidates.len(), "discarding queued candidates");
        }
        self.candidates.clear();
        self.remote_description_set = false;
        self.early_remote_stream = None;
    }

    fn expect_state(&self, expected: CallState, op: &str) -> Result<(), CallError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CallError::InvalidState(format!("{op} while {}", self.state)))
        }
    }

    fn transition(&mut self, next: CallState) {
        if self.state == next {
            return;
        }
        tracing::info!(from = %self.state, to = %next, "call state");
        self.state = next;
        self.emit(Event::StateChanged { state: next });
    }

    fn report(&self, error: &CallError) {
        tracing::warn!("{error}");
        self.emit(Event::error(error));
    }

    fn emit(&self, event: Event) {
        self.events.emit(&event);
    }
}

fn references_peer(command: &Command) -> bool {
    matches!(
        command,
        Command::CreateOffer
            | Command::CreateAnswer { .. }
            | Command::HandleAnswer { .. }
            | Command::AddIceCandidate { .. }
    )
}

fn no_peer(op: &str) -> CallError {
    CallError::InvalidState(format!("{op}: no peer connection"))
}

async fn negotiate_offer(peer: &mut dyn PeerConnection) -> Result<SessionDescription, CallError> {
    let offer = peer.create_offer().await?;
    peer.set_local_description(offer.clone()).await?;
    Ok(offer)
}

async fn negotiate_answer(peer: &mut dyn PeerConnection) -> Result<SessionDescription, CallError> {
    let answer = peer.create_answer().await?;
    peer.set_local_description(answer.clone()).await?;
    Ok(answer)
}
