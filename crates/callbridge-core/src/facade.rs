//! Host-side entry point for calls.
//!
//! `CallFacade` owns at most one [`CallSession`] at a time. Each user action
//! becomes one command to a per-session [`MediaSessionController`] task, and
//! the controller's events come back through a pump task that updates the
//! session record, forwards signaling to the [`SignalingRelay`] and notifies
//! listeners.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::{self, CommandSender, EventReceiver};
use crate::codec::{Command, ErrorCode, Event};
use crate::controller::MediaSessionController;
use crate::errors::CallError;
use crate::events::{CallEvent, CallEventListener, CallStatus, EventEmitter};
use crate::media::{MediaDevices, RtcConfiguration};
use crate::settings::Settings;
use crate::signaling::{
    IceCandidate, OutboundSignal, SessionDescription, SignalingMessage, SignalingRelay,
};
use crate::state::{CallMode, CallRole, CallState};

/// Ended session ids remembered so late signaling for them is dropped quietly.
const RECENTLY_ENDED_CAPACITY: usize = 16;

/// Snapshot of the active call as the host sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    pub id: Uuid,
    /// The remote party: callee for outgoing calls, caller for incoming ones.
    pub peer: String,
    pub role: CallRole,
    pub mode: CallMode,
    /// Last state reported by the controller.
    pub state: CallState,
    pub local_stream_id: Option<String>,
    pub remote_stream_id: Option<String>,
    pub muted: bool,
    pub video_enabled: bool,
    /// Offer received for an incoming call, consumed once local media is up.
    pub pending_offer: Option<SessionDescription>,
    /// Outgoing calls start accepted; incoming ones ring until `accept_call`.
    pub accepted: bool,
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    fn new(id: Uuid, peer: String, role: CallRole, mode: CallMode) -> Self {
        Self {
            id,
            peer,
            role,
            mode,
            state: CallState::Idle,
            local_stream_id: None,
            remote_stream_id: None,
            muted: false,
            video_enabled: mode.is_video(),
            pending_offer: None,
            accepted: role == CallRole::Caller,
            started_at: Utc::now(),
        }
    }

    pub fn status(&self) -> CallStatus {
        match self.state {
            CallState::Connected => CallStatus::Connected,
            CallState::Failed => CallStatus::Failed,
            CallState::Ending | CallState::Ended => CallStatus::Ended,
            _ if !self.accepted => CallStatus::Ringing,
            _ => CallStatus::Connecting,
        }
    }
}

struct ActiveCall {
    session: CallSession,
    commands: CommandSender,
    watchdog: Option<JoinHandle<()>>,
}

impl ActiveCall {
    fn send(&self, command: Command) -> Result<(), CallError> {
        tracing::debug!(session_id = %self.session.id, command = command.kind(), "sending command");
        self.commands.send(&command)
    }

    fn require_local_media(&self, op: &str) -> Result<(), CallError> {
        if self.session.local_stream_id.is_none() {
            return Err(CallError::InvalidState(format!("{op}: no local media yet")));
        }
        Ok(())
    }
}

#[derive(Default)]
struct FacadeState {
    active: Option<ActiveCall>,
    recently_ended: VecDeque<Uuid>,
}

impl FacadeState {
    /// The active call, but only if it is the session `session_id` names.
    fn current(&mut self, session_id: Uuid) -> Option<&mut ActiveCall> {
        self.active.as_mut().filter(|active| active.session.id == session_id)
    }

    fn remember_ended(&mut self, session_id: Uuid) {
        self.recently_ended.push_back(session_id);
        if self.recently_ended.len() > RECENTLY_ENDED_CAPACITY {
            self.recently_ended.pop_front();
        }
    }

    fn was_ended(&self, session_id: Uuid) -> bool {
        self.recently_ended.contains(&session_id)
    }
}

struct Shared {
    state: Mutex<FacadeState>,
    emitter: EventEmitter,
    relay: Arc<dyn SignalingRelay>,
}

pub struct CallFacade {
    shared: Arc<Shared>,
    devices: Arc<dyn MediaDevices>,
    settings: Settings,
}

impl CallFacade {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        relay: Arc<dyn SignalingRelay>,
        settings: Settings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(FacadeState::default()),
                emitter: EventEmitter::new(),
                relay,
            }),
            devices,
            settings,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn CallEventListener>) {
        self.shared.emitter.add_listener(listener);
    }

    pub async fn session(&self) -> Option<CallSession> {
        let state = self.shared.state.lock().await;
        state.active.as_ref().map(|active| active.session.clone())
    }

    pub async fn status(&self) -> Option<CallStatus> {
        let state = self.shared.state.lock().await;
        state.active.as_ref().map(|active| active.session.status())
    }

    /// Place an outgoing call. Fails with [`CallError::SessionActive`] while
    /// another session exists; the existing session is left untouched.
    pub async fn start_call(&self, callee: &str, mode: CallMode) -> Result<Uuid, CallError> {
        let mut state = self.shared.state.lock().await;
        if let Some(active) = &state.active {
            tracing::warn!(active = %active.session.id, callee, "start_call rejected: session already active");
            return Err(CallError::SessionActive);
        }

        let session = CallSession::new(Uuid::new_v4(), callee.to_string(), CallRole::Caller, mode);
        let session_id = session.id;
        let active = self.open(session);
        active.send(Command::Init { is_video: mode.is_video() })?;
        let status = active.session.status();
        state.active = Some(active);

        tracing::info!(%session_id, callee, ?mode, "outgoing call");
        self.shared.emitter.emit(CallEvent::StatusChanged { session_id, status });
        Ok(session_id)
    }

    /// An offer arrived from the signaling transport. When idle this opens a
    /// ringing callee session.
    ///
    /// This is the one operation that sends no command: the controller stays
    /// idle while the call rings, and [`accept_call`](Self::accept_call) sends
    /// its `init`.
    pub async fn receive_offer(
        &self,
        session_id: Uuid,
        from: &str,
        mode: CallMode,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        let mut state = self.shared.state.lock().await;
        if state.was_ended(session_id) {
            tracing::debug!(%session_id, "offer for ended session ignored");
            return Ok(());
        }
        if let Some(active) = &state.active {
            if active.session.id == session_id {
                tracing::debug!(%session_id, "duplicate offer ignored");
                return Ok(());
            }
            tracing::warn!(%session_id, from, "incoming call rejected: session already active");
            return Err(CallError::SessionActive);
        }

        let mut session = CallSession::new(session_id, from.to_string(), CallRole::Callee, mode);
        session.pending_offer = Some(offer);
        state.active = Some(self.open(session));

        tracing::info!(%session_id, from, ?mode, "incoming call");
        let emitter = &self.shared.emitter;
        emitter.emit(CallEvent::IncomingCall { session_id, from: from.to_string(), mode });
        emitter.emit(CallEvent::StatusChanged { session_id, status: CallStatus::Ringing });
        Ok(())
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        let mut state = self.shared.state.lock().await;
        let active = state.active.as_mut().ok_or(CallError::NoActiveSession)?;
        if active.session.role != CallRole::Callee || active.session.accepted {
            return Err(CallError::InvalidState("no incoming call to accept".into()));
        }
        active.send(Command::Init { is_video: active.session.mode.is_video() })?;
        active.session.accepted = true;

        let session_id = active.session.id;
        tracing::info!(%session_id, "incoming call accepted");
        self.shared.emitter.emit(CallEvent::StatusChanged {
            session_id,
            status: active.session.status(),
        });
        Ok(())
    }

    pub async fn decline_call(&self) {
        let mut state = self.shared.state.lock().await;
        end_active(&mut state, &self.shared.emitter, "declined");
    }

    /// Answer from the callee. Ignored unless it belongs to the active session.
    pub async fn receive_answer(
        &self,
        session_id: Uuid,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        let mut state = self.shared.state.lock().await;
        let Some(active) = state.current(session_id) else {
            tracing::debug!(%session_id, "answer for inactive session ignored");
            return Ok(());
        };
        if active.session.role != CallRole::Caller {
            tracing::warn!(%session_id, "answer received on incoming call ignored");
            return Ok(());
        }
        active.send(Command::HandleAnswer { answer })
    }

    /// Remote candidate from the signaling transport. Ignored unless it
    /// belongs to the active session.
    pub async fn receive_ice_candidate(
        &self,
        session_id: Uuid,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        let mut state = self.shared.state.lock().await;
        let Some(active) = state.current(session_id) else {
            tracing::debug!(%session_id, "candidate for inactive session ignored");
            return Ok(());
        };
        active.send(Command::AddIceCandidate { candidate })
    }

    /// Flips the mirrored flag right away; the controller's `muteStatus`
    /// confirmation overwrites it. Refused with `InvalidState` until local
    /// media is up.
    pub async fn toggle_mute(&self) -> Result<(), CallError> {
        let mut state = self.shared.state.lock().await;
        let active = state.active.as_mut().ok_or(CallError::NoActiveSession)?;
        active.require_local_media("toggle_mute")?;
        active.send(Command::ToggleMute)?;
        active.session.muted = !active.session.muted;
        Ok(())
    }

    pub async fn toggle_video(&self) -> Result<(), CallError> {
        let mut state = self.shared.state.lock().await;
        let active = state.active.as_mut().ok_or(CallError::NoActiveSession)?;
        active.require_local_media("toggle_video")?;
        active.send(Command::ToggleVideo)?;
        // Audio calls get an error event back instead of a status.
        if active.session.mode.is_video() {
            active.session.video_enabled = !active.session.video_enabled;
        }
        Ok(())
    }

    pub async fn switch_camera(&self) -> Result<(), CallError> {
        let mut state = self.shared.state.lock().await;
        let active = state.active.as_ref().ok_or(CallError::NoActiveSession)?;
        active.send(Command::SwitchCamera)
    }

    /// Hang up. Always accepted, even with no session.
    pub async fn end_call(&self) {
        let mut state = self.shared.state.lock().await;
        end_active(&mut state, &self.shared.emitter, "local hangup");
    }

    fn open(&self, session: CallSession) -> ActiveCall {
        let (host, sandbox) = channel::pair();
        let controller = MediaSessionController::new(
            self.devices.clone(),
            RtcConfiguration::from(&self.settings),
            sandbox.events,
        );
        tokio::spawn(controller.run(sandbox.commands));
        tokio::spawn(pump(self.shared.clone(), session.id, host.events));

        let watchdog = self.settings.negotiation_timeout_secs.map(|secs| {
            tokio::spawn(watchdog(self.shared.clone(), session.id, Duration::from_secs(secs)))
        });

        ActiveCall { session, commands: host.commands, watchdog }
    }
}

impl Drop for CallFacade {
    fn drop(&mut self) {
        // The pump keeps `Shared` alive, so the controller would otherwise
        // never see its command channel close.
        match self.shared.state.try_lock() {
            Ok(mut state) => end_active(&mut state, &self.shared.emitter, "facade dropped"),
            Err(_) => tracing::debug!("facade dropped while its state was locked; session left running"),
        }
    }
}

fn end_active(state: &mut FacadeState, emitter: &EventEmitter, reason: &str) {
    let Some(mut active) = state.active.take() else {
        tracing::debug!(reason, "end_call with no active session");
        return;
    };
    if let Err(e) = active.send(Command::EndCall) {
        tracing::debug!("controller already gone: {e}");
    }
    if let Some(watchdog) = active.watchdog.take() {
        watchdog.abort();
    }

    let session_id = active.session.id;
    state.remember_ended(session_id);
    tracing::info!(%session_id, reason, "call ended");
    emitter.emit(CallEvent::StatusChanged { session_id, status: CallStatus::Ended });
}

/// Applies one session's controller events until the controller goes away.
async fn pump(shared: Arc<Shared>, session_id: Uuid, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        let mut state = shared.state.lock().await;
        let Some(active) = state.current(session_id) else {
            tracing::debug!(%session_id, event = event.kind(), "event for inactive session ignored");
            continue;
        };

        let before = active.session.status();
        apply_event(active, event, &shared);
        let after = active.session.status();
        if before != after {
            tracing::info!(%session_id, ?after, "call status changed");
            shared.emitter.emit(CallEvent::StatusChanged { session_id, status: after });
        }

        if active.session.state == CallState::Failed {
            if let Some(mut failed) = state.active.take() {
                if let Some(watchdog) = failed.watchdog.take() {
                    watchdog.abort();
                }
            }
            state.remember_ended(session_id);
        }
    }
    tracing::debug!(%session_id, "event pump stopped");
}

fn apply_event(active: &mut ActiveCall, event: Event, shared: &Shared) {
    let session_id = active.session.id;
    let emitter = &shared.emitter;
    match event {
        Event::LocalStream { id } => {
            active.session.local_stream_id = Some(id.clone());
            emitter.emit(CallEvent::LocalStreamReady { session_id, stream_id: id });

            let next = match active.session.role {
                CallRole::Caller => Some(Command::CreateOffer),
                CallRole::Callee => active
                    .session
                    .pending_offer
                    .take()
                    .map(|offer| Command::CreateAnswer { offer }),
            };
            if let Some(command) = next {
                if let Err(e) = active.send(command) {
                    tracing::warn!(%session_id, "failed to continue negotiation: {e}");
                }
            }
        }
        Event::RemoteStream { id } => {
            active.session.remote_stream_id = Some(id.clone());
            emitter.emit(CallEvent::RemoteStreamReady { session_id, stream_id: id });
        }
        Event::Offer { sdp } => {
            forward(active, SignalingMessage::Offer(SessionDescription::offer(sdp)), shared)
        }
        Event::Answer { sdp } => {
            forward(active, SignalingMessage::Answer(SessionDescription::answer(sdp)), shared)
        }
        Event::IceCandidate { candidate } => {
            forward(active, SignalingMessage::IceCandidate(candidate), shared)
        }
        Event::MuteStatus { muted } => {
            active.session.muted = muted;
            emitter.emit(CallEvent::MuteChanged { session_id, muted });
        }
        Event::VideoStatus { enabled } => {
            active.session.video_enabled = enabled;
            emitter.emit(CallEvent::VideoChanged { session_id, enabled });
        }
        Event::Error { code, message } => {
            tracing::warn!(%session_id, ?code, "controller error: {message}");
            emitter.emit(CallEvent::Error { session_id, code, message });
        }
        Event::StateChanged { state } => {
            tracing::debug!(%session_id, %state, "controller state");
            active.session.state = state;
        }
    }
}

fn forward(active: &ActiveCall, message: SignalingMessage, shared: &Shared) {
    let signal = OutboundSignal {
        session_id: active.session.id,
        peer: active.session.peer.clone(),
        mode: active.session.mode,
        message,
    };
    shared.relay.forward(signal.clone());
    shared.emitter.emit(CallEvent::SignalingProduced(signal));
}

async fn watchdog(shared: Arc<Shared>, session_id: Uuid, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    let mut state = shared.state.lock().await;
    match state.current(session_id) {
        Some(active) if active.session.state != CallState::Connected => {}
        _ => return,
    }
    tracing::warn!(%session_id, ?timeout, "call did not connect in time");
    shared.emitter.emit(CallEvent::Error {
        session_id,
        code: ErrorCode::Timeout,
        message: format!("call did not connect within {}s", timeout.as_secs()),
    });
    end_active(&mut state, &shared.emitter, "negotiation timeout");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::loopback::{LoopbackConfig, LoopbackDevices, LoopbackProbe};
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct RecordingRelay {
        sent: std::sync::Mutex<Vec<OutboundSignal>>,
        tx: Option<mpsc::UnboundedSender<OutboundSignal>>,
    }

    impl RecordingRelay {
        fn sent(&self) -> Vec<OutboundSignal> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl SignalingRelay for RecordingRelay {
        fn forward(&self, signal: OutboundSignal) {
            if let Some(tx) = &self.tx {
                let _ = tx.send(signal.clone());
            }
            self.sent.lock().unwrap().push(signal);
        }
    }

    struct ChannelListener(mpsc::UnboundedSender<CallEvent>);

    impl CallEventListener for ChannelListener {
        fn on_event(&self, event: CallEvent) {
            let _ = self.0.send(event);
        }
    }

    struct Harness {
        facade: Arc<CallFacade>,
        events: mpsc::UnboundedReceiver<CallEvent>,
        probe: LoopbackProbe,
        relay: Arc<RecordingRelay>,
    }

    impl Harness {
        fn new(config: LoopbackConfig, settings: Settings) -> Self {
            Self::with_relay(config, settings, RecordingRelay::default())
        }

        fn with_relay(config: LoopbackConfig, settings: Settings, relay: RecordingRelay) -> Self {
            let devices = LoopbackDevices::new(config);
            let probe = devices.probe();
            let relay = Arc::new(relay);
            let facade = CallFacade::new(Arc::new(devices), relay.clone(), settings);
            let (tx, events) = mpsc::unbounded_channel();
            facade.add_listener(Arc::new(ChannelListener(tx)));
            Self { facade: Arc::new(facade), events, probe, relay }
        }

        async fn wait_for(&mut self, pred: impl Fn(&CallEvent) -> bool) -> CallEvent {
            tokio::time::timeout(WAIT, async {
                loop {
                    let event = self.events.recv().await.expect("listener channel closed");
                    if pred(&event) {
                        return event;
                    }
                }
            })
            .await
            .expect("timed out waiting for event")
        }

        async fn wait_status(&mut self, expected: CallStatus) {
            self.wait_for(|e| matches!(e, CallEvent::StatusChanged { status, .. } if *status == expected))
                .await;
        }

        async fn wait_state(&self, expected: CallState) {
            tokio::time::timeout(WAIT, async {
                loop {
                    if self.facade.session().await.map(|s| s.state) == Some(expected) {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("session never reached expected state");
        }

        fn drain(&mut self) -> Vec<CallEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    /// Let spawned tasks run until nothing is left to do.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn start_call_acquires_media_and_relays_offer() {
        let mut h = Harness::new(LoopbackConfig::default(), Settings::default());
        let id = h.facade.start_call("provider-42", CallMode::Video).await.unwrap();

        h.wait_for(|e| matches!(e, CallEvent::LocalStreamReady { .. })).await;
        h.wait_for(|e| {
            matches!(e, CallEvent::SignalingProduced(s) if matches!(s.message, SignalingMessage::Offer(_)))
        })
        .await;
        h.wait_state(CallState::AwaitingRemoteDescription).await;

        let session = h.facade.session().await.unwrap();
        assert_eq!(session.id, id);
        assert_eq!(session.role, CallRole::Caller);
        assert_eq!(session.peer, "provider-42");
        assert!(session.local_stream_id.is_some());
        assert_eq!(session.status(), CallStatus::Connecting);

        let offer = h.relay.sent().into_iter().next().unwrap();
        assert_eq!(offer.session_id, id);
        assert_eq!(offer.peer, "provider-42");
        assert_eq!(offer.mode, CallMode::Video);
        match offer.message {
            SignalingMessage::Offer(sd) => assert!(sd.sdp.contains("m=video")),
            other => panic!("expected offer, got {other:?}"),
        }
        assert_eq!(h.probe.media_requests(), 1);
    }

    #[tokio::test]
    async fn second_start_call_is_rejected() {
        let h = Harness::new(LoopbackConfig::default(), Settings::default());
        let first = h.facade.start_call("a", CallMode::Audio).await.unwrap();
        h.wait_state(CallState::AwaitingRemoteDescription).await;

        let err = h.facade.start_call("b", CallMode::Video).await.unwrap_err();
        assert_eq!(err, CallError::SessionActive);
        settle().await;

        let session = h.facade.session().await.unwrap();
        assert_eq!(session.id, first);
        assert_eq!(session.peer, "a");
        assert_eq!(h.probe.media_requests(), 1);
        assert_eq!(h.probe.peers_created(), 1);
    }

    #[tokio::test]
    async fn end_call_without_session_is_accepted() {
        let mut h = Harness::new(LoopbackConfig::default(), Settings::default());
        h.facade.end_call().await;
        h.facade.end_call().await;
        assert!(h.facade.session().await.is_none());
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn end_call_releases_media_and_session() {
        let mut h = Harness::new(LoopbackConfig::default(), Settings::default());
        let id = h.facade.start_call("a", CallMode::Video).await.unwrap();
        h.wait_state(CallState::AwaitingRemoteDescription).await;

        h.facade.end_call().await;
        h.facade.end_call().await;
        assert!(h.facade.session().await.is_none());

        let probe = h.probe.clone();
        eventually(|| probe.streams_stopped() == 1 && probe.peers_closed() == 1).await;

        let ended: Vec<_> = h
            .drain()
            .into_iter()
            .filter(|e| matches!(e, CallEvent::StatusChanged { status: CallStatus::Ended, .. }))
            .collect();
        assert_eq!(ended, vec![CallEvent::StatusChanged { session_id: id, status: CallStatus::Ended }]);

        // A new call can start straight away.
        h.facade.start_call("b", CallMode::Audio).await.unwrap();
    }

    #[tokio::test]
    async fn signaling_for_other_sessions_is_ignored() {
        let mut h = Harness::new(LoopbackConfig::default(), Settings::default());
        let old = h.facade.start_call("a", CallMode::Audio).await.unwrap();
        h.wait_state(CallState::AwaitingRemoteDescription).await;
        h.facade.end_call().await;

        let current = h.facade.start_call("b", CallMode::Audio).await.unwrap();
        h.wait_state(CallState::AwaitingRemoteDescription).await;

        let answer = SessionDescription::answer("v=0\r\ns=remote\r\n");
        h.facade.receive_answer(old, answer.clone()).await.unwrap();
        h.facade.receive_answer(Uuid::new_v4(), answer.clone()).await.unwrap();
        h.facade
            .receive_ice_candidate(Uuid::new_v4(), IceCandidate::new("candidate:9 1 udp 1 10.0.0.9 9 typ host"))
            .await
            .unwrap();
        settle().await;
        assert!(h.probe.remote_descriptions().is_empty());
        assert_eq!(h.facade.session().await.unwrap().state, CallState::AwaitingRemoteDescription);

        h.facade.receive_answer(current, answer).await.unwrap();
        h.wait_status(CallStatus::Connected).await;
        assert_eq!(h.probe.remote_descriptions().len(), 1);
    }

    #[tokio::test]
    async fn early_candidates_reach_the_peer_after_the_answer() {
        let mut h = Harness::new(LoopbackConfig::default(), Settings::default());
        let id = h.facade.start_call("a", CallMode::Audio).await.unwrap();
        h.wait_state(CallState::AwaitingRemoteDescription).await;

        h.facade.receive_ice_candidate(id, IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 1 typ host")).await.unwrap();
        h.facade.receive_ice_candidate(id, IceCandidate::new("candidate:2 1 udp 1 10.0.0.2 2 typ host")).await.unwrap();
        settle().await;
        assert!(h.probe.applied_candidates().is_empty());

        h.facade.receive_answer(id, SessionDescription::answer("v=0\r\ns=remote\r\n")).await.unwrap();
        h.wait_status(CallStatus::Connected).await;

        let applied: Vec<_> = h.probe.applied_candidates().into_iter().map(|c| c.candidate).collect();
        assert_eq!(
            applied,
            vec![
                "candidate:1 1 udp 1 10.0.0.1 1 typ host".to_string(),
                "candidate:2 1 udp 1 10.0.0.2 2 typ host".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn media_failure_reports_and_frees_the_session() {
        let config = LoopbackConfig { deny_media: true, ..Default::default() };
        let mut h = Harness::new(config, Settings::default());
        let id = h.facade.start_call("a", CallMode::Video).await.unwrap();

        let error = h.wait_for(|e| matches!(e, CallEvent::Error { .. })).await;
        match error {
            CallEvent::Error { session_id, code, .. } => {
                assert_eq!(session_id, id);
                assert_eq!(code, ErrorCode::MediaAcquisition);
            }
            other => panic!("expected error, got {other:?}"),
        }
        h.wait_status(CallStatus::Failed).await;
        assert!(h.facade.session().await.is_none());
        assert!(h.relay.sent().is_empty());

        h.facade.start_call("a", CallMode::Audio).await.unwrap();
    }

    #[tokio::test]
    async fn toggle_mute_is_mirrored_optimistically() {
        let mut h = Harness::new(LoopbackConfig::default(), Settings::default());
        h.facade.start_call("a", CallMode::Audio).await.unwrap();
        h.wait_state(CallState::AwaitingRemoteDescription).await;

        h.facade.toggle_mute().await.unwrap();
        assert!(h.facade.session().await.unwrap().muted);

        let confirmed = h.wait_for(|e| matches!(e, CallEvent::MuteChanged { .. })).await;
        assert!(matches!(confirmed, CallEvent::MuteChanged { muted: true, .. }));
        assert!(h.facade.session().await.unwrap().muted);
    }

    #[tokio::test]
    async fn toggle_video_on_audio_call_reports_unsupported() {
        let mut h = Harness::new(LoopbackConfig::default(), Settings::default());
        h.facade.start_call("a", CallMode::Audio).await.unwrap();
        h.wait_state(CallState::AwaitingRemoteDescription).await;
        h.drain();

        h.facade.toggle_video().await.unwrap();
        let error = h.wait_for(|e| matches!(e, CallEvent::Error { .. })).await;
        assert!(matches!(error, CallEvent::Error { code: ErrorCode::UnsupportedOperation, .. }));

        settle().await;
        assert!(!h.drain().iter().any(|e| matches!(e, CallEvent::VideoChanged { .. })));
        let session = h.facade.session().await.unwrap();
        assert!(!session.video_enabled);
        assert_eq!(session.state, CallState::AwaitingRemoteDescription);
    }

    #[tokio::test]
    async fn toggles_need_a_session() {
        let h = Harness::new(LoopbackConfig::default(), Settings::default());
        assert_eq!(h.facade.toggle_mute().await, Err(CallError::NoActiveSession));
        assert_eq!(h.facade.toggle_video().await, Err(CallError::NoActiveSession));
        assert_eq!(h.facade.switch_camera().await, Err(CallError::NoActiveSession));
        assert_eq!(h.facade.accept_call().await, Err(CallError::NoActiveSession));
    }

    #[tokio::test]
    async fn incoming_call_rings_until_accepted() {
        let mut h = Harness::new(LoopbackConfig::default(), Settings::default());
        let id = Uuid::new_v4();
        let offer = SessionDescription::offer("v=0\r\ns=remote-offer\r\n");
        h.facade.receive_offer(id, "patient-7", CallMode::Audio, offer.clone()).await.unwrap();

        let incoming = h.wait_for(|e| matches!(e, CallEvent::IncomingCall { .. })).await;
        assert_eq!(
            incoming,
            CallEvent::IncomingCall { session_id: id, from: "patient-7".into(), mode: CallMode::Audio }
        );
        h.wait_status(CallStatus::Ringing).await;
        settle().await;
        assert_eq!(h.probe.media_requests(), 0);

        // Re-delivery of the same offer changes nothing.
        h.facade.receive_offer(id, "patient-7", CallMode::Audio, offer).await.unwrap();
        assert_eq!(h.facade.status().await, Some(CallStatus::Ringing));

        h.facade.accept_call().await.unwrap();
        h.wait_status(CallStatus::Connecting).await;
        h.wait_status(CallStatus::Connected).await;

        let session = h.facade.session().await.unwrap();
        assert_eq!(session.role, CallRole::Callee);
        assert!(session.pending_offer.is_none());
        assert!(session.remote_stream_id.is_some());
        assert!(h.relay.sent().iter().any(|s| matches!(s.message, SignalingMessage::Answer(_))));
        assert_eq!(
            h.facade.accept_call().await,
            Err(CallError::InvalidState("no incoming call to accept".into()))
        );
    }

    #[tokio::test]
    async fn toggles_on_ringing_call_leave_the_mirror_alone() {
        let mut h = Harness::new(LoopbackConfig::default(), Settings::default());
        let id = Uuid::new_v4();
        h.facade
            .receive_offer(id, "patient-7", CallMode::Video, SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();

        assert!(matches!(h.facade.toggle_mute().await, Err(CallError::InvalidState(_))));
        assert!(matches!(h.facade.toggle_video().await, Err(CallError::InvalidState(_))));
        let session = h.facade.session().await.unwrap();
        assert!(!session.muted);
        assert!(session.video_enabled);

        h.facade.accept_call().await.unwrap();
        h.wait_for(|e| {
            assert!(!matches!(e, CallEvent::Error { .. } | CallEvent::MuteChanged { .. }), "unexpected {e:?}");
            matches!(e, CallEvent::StatusChanged { status: CallStatus::Connected, .. })
        })
        .await;
        let session = h.facade.session().await.unwrap();
        assert!(!session.muted);
        assert!(session.video_enabled);

        h.facade.toggle_mute().await.unwrap();
        let confirmed = h.wait_for(|e| matches!(e, CallEvent::MuteChanged { .. })).await;
        assert_eq!(confirmed, CallEvent::MuteChanged { session_id: id, muted: true });
    }

    #[tokio::test]
    async fn declined_call_never_touches_media() {
        let mut h = Harness::new(LoopbackConfig::default(), Settings::default());
        let id = Uuid::new_v4();
        let offer = SessionDescription::offer("v=0\r\n");
        h.facade.receive_offer(id, "x", CallMode::Video, offer.clone()).await.unwrap();
        h.facade.decline_call().await;
        h.wait_status(CallStatus::Ended).await;
        settle().await;

        assert!(h.facade.session().await.is_none());
        assert_eq!(h.probe.media_requests(), 0);

        // A late copy of the declined offer does not ring again.
        h.facade.receive_offer(id, "x", CallMode::Video, offer).await.unwrap();
        assert!(h.facade.session().await.is_none());
    }

    #[tokio::test]
    async fn incoming_call_while_busy_is_rejected() {
        let h = Harness::new(LoopbackConfig::default(), Settings::default());
        let current = h.facade.start_call("a", CallMode::Audio).await.unwrap();
        let err = h
            .facade
            .receive_offer(Uuid::new_v4(), "b", CallMode::Audio, SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap_err();
        assert_eq!(err, CallError::SessionActive);
        assert_eq!(h.facade.session().await.unwrap().id, current);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out() {
        let settings = Settings { negotiation_timeout_secs: Some(1), ..Default::default() };
        let mut h = Harness::new(LoopbackConfig::default(), settings);
        let id = h.facade.start_call("a", CallMode::Audio).await.unwrap();

        let error = h.wait_for(|e| matches!(e, CallEvent::Error { .. })).await;
        assert!(matches!(error, CallEvent::Error { session_id, code: ErrorCode::Timeout, .. } if session_id == id));
        h.wait_status(CallStatus::Ended).await;
        assert!(h.facade.session().await.is_none());

        let probe = h.probe.clone();
        eventually(|| probe.peers_closed() == 1).await;
    }

    #[tokio::test]
    async fn two_facades_connect_through_a_relay() {
        let (caller_tx, mut caller_out) = mpsc::unbounded_channel();
        let (callee_tx, mut callee_out) = mpsc::unbounded_channel();
        let mut caller = Harness::with_relay(
            LoopbackConfig::default(),
            Settings::default(),
            RecordingRelay { tx: Some(caller_tx), ..Default::default() },
        );
        let mut callee = Harness::with_relay(
            LoopbackConfig::default(),
            Settings::default(),
            RecordingRelay { tx: Some(callee_tx), ..Default::default() },
        );

        let to_callee = callee.facade.clone();
        tokio::spawn(async move {
            while let Some(signal) = caller_out.recv().await {
                let id = signal.session_id;
                let _ = match signal.message {
                    SignalingMessage::Offer(sd) => to_callee.receive_offer(id, "alice", signal.mode, sd).await,
                    SignalingMessage::Answer(sd) => to_callee.receive_answer(id, sd).await,
                    SignalingMessage::IceCandidate(c) => to_callee.receive_ice_candidate(id, c).await,
                };
            }
        });
        let to_caller = caller.facade.clone();
        tokio::spawn(async move {
            while let Some(signal) = callee_out.recv().await {
                let id = signal.session_id;
                let _ = match signal.message {
                    SignalingMessage::Offer(sd) => to_caller.receive_offer(id, "bob", signal.mode, sd).await,
                    SignalingMessage::Answer(sd) => to_caller.receive_answer(id, sd).await,
                    SignalingMessage::IceCandidate(c) => to_caller.receive_ice_candidate(id, c).await,
                };
            }
        });

        let id = caller.facade.start_call("bob", CallMode::Video).await.unwrap();
        callee.wait_for(|e| matches!(e, CallEvent::IncomingCall { session_id, .. } if *session_id == id)).await;
        callee.facade.accept_call().await.unwrap();

        callee.wait_status(CallStatus::Connected).await;
        caller.wait_status(CallStatus::Connected).await;

        let caller_session = caller.facade.session().await.unwrap();
        let callee_session = callee.facade.session().await.unwrap();
        assert_eq!(caller_session.id, callee_session.id);
        assert_eq!(callee_session.peer, "alice");
        assert!(caller_session.remote_stream_id.is_some());
        assert!(callee_session.remote_stream_id.is_some());

        // Both sides end up with the other side's candidates applied.
        let (caller_probe, callee_probe) = (caller.probe.clone(), callee.probe.clone());
        eventually(|| caller_probe.applied_candidates().len() == 2 && callee_probe.applied_candidates().len() == 2)
            .await;

        caller.facade.end_call().await;
        callee.facade.end_call().await;
        eventually(|| caller_probe.peers_closed() == 1 && callee_probe.peers_closed() == 1).await;
    }
}
