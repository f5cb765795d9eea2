//! Two in-process call endpoints wired back to back over the loopback media
//! backend. Places a call, waits for it to connect, mutes, then hangs up.
//!
//! Usage: `callbridge-demo [data-dir]`. Settings are read from
//! `<data-dir>/call_settings.json` when a directory is given.

use std::sync::Arc;
use std::time::Duration;

use callbridge_core::media::loopback::LoopbackDevices;
use callbridge_core::{
    CallError, CallEvent, CallEventListener, CallFacade, CallStatus, OutboundSignal, Settings,
    SettingsStore, SignalingMessage, SignalingRelay,
};
use tokio::sync::mpsc;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ── Relay: outbound signaling → channel ───────────────────────────────

struct ChannelRelay {
    tx: mpsc::UnboundedSender<OutboundSignal>,
}

impl SignalingRelay for ChannelRelay {
    fn forward(&self, signal: OutboundSignal) {
        if self.tx.send(signal).is_err() {
            tracing::warn!("relay receiver gone, signal dropped");
        }
    }
}

/// Delivers everything one endpoint produces to the other one.
async fn route(
    mut signals: mpsc::UnboundedReceiver<OutboundSignal>,
    from: &'static str,
    to: Arc<CallFacade>,
) {
    while let Some(signal) = signals.recv().await {
        let id = signal.session_id;
        let result = match signal.message {
            SignalingMessage::Offer(offer) => {
                let result = to.receive_offer(id, from, signal.mode, offer).await;
                if result.is_ok() {
                    // Auto-answer.
                    if let Err(e) = to.accept_call().await {
                        tracing::warn!("accept failed: {e}");
                    }
                }
                result
            }
            SignalingMessage::Answer(answer) => to.receive_answer(id, answer).await,
            SignalingMessage::IceCandidate(candidate) => {
                to.receive_ice_candidate(id, candidate).await
            }
        };
        if let Err(e) = result {
            tracing::warn!(from, "delivery failed: {e}");
        }
    }
}

// ── Listener: log events, surface status changes ──────────────────────

struct LogListener {
    name: &'static str,
    statuses: mpsc::UnboundedSender<CallStatus>,
}

impl CallEventListener for LogListener {
    fn on_event(&self, event: CallEvent) {
        match event {
            CallEvent::StatusChanged { status, .. } => {
                tracing::info!(endpoint = self.name, ?status, "status");
                let _ = self.statuses.send(status);
            }
            CallEvent::SignalingProduced(signal) => {
                tracing::debug!(endpoint = self.name, peer = %signal.peer, message = ?signal.message, "signal out");
            }
            CallEvent::Error { code, message, .. } => {
                tracing::error!(endpoint = self.name, ?code, "{message}");
            }
            other => tracing::info!(endpoint = self.name, event = ?other, "event"),
        }
    }
}

fn endpoint(
    name: &'static str,
    settings: &Settings,
) -> (
    Arc<CallFacade>,
    mpsc::UnboundedReceiver<OutboundSignal>,
    mpsc::UnboundedReceiver<CallStatus>,
) {
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let facade = CallFacade::new(
        Arc::new(LoopbackDevices::default()),
        Arc::new(ChannelRelay { tx: signal_tx }),
        settings.clone(),
    );
    facade.add_listener(Arc::new(LogListener { name, statuses: status_tx }));
    (Arc::new(facade), signal_rx, status_rx)
}

async fn wait_connected(statuses: &mut mpsc::UnboundedReceiver<CallStatus>) -> Result<(), CallError> {
    let wait = async {
        while let Some(status) = statuses.recv().await {
            match status {
                CallStatus::Connected => return Ok(()),
                CallStatus::Failed | CallStatus::Ended => {
                    return Err(CallError::InvalidState(format!("call stopped: {status:?}")));
                }
                CallStatus::Ringing | CallStatus::Connecting => {}
            }
        }
        Err(CallError::ChannelClosed)
    };
    tokio::time::timeout(CONNECT_TIMEOUT, wait)
        .await
        .map_err(|_| CallError::InvalidState("call did not connect in time".into()))?
}

#[tokio::main]
async fn main() -> Result<(), CallError> {
    callbridge_core::init_logging();

    let settings = match std::env::args().nth(1) {
        Some(dir) => SettingsStore::new(&dir).get(),
        None => Settings::default(),
    };
    tracing::info!(?settings, "starting demo");

    let (alice, alice_out, mut alice_status) = endpoint("alice", &settings);
    let (bob, bob_out, mut bob_status) = endpoint("bob", &settings);
    tokio::spawn(route(alice_out, "alice", bob.clone()));
    tokio::spawn(route(bob_out, "bob", alice.clone()));

    let session_id = alice.start_call("bob", settings.default_mode).await?;
    tracing::info!(%session_id, "call placed");

    wait_connected(&mut alice_status).await?;
    wait_connected(&mut bob_status).await?;
    tracing::info!(%session_id, "both sides connected");

    alice.toggle_mute().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    if let Some(session) = alice.session().await {
        tracing::info!(muted = session.muted, remote = ?session.remote_stream_id, "alice session");
    }

    alice.end_call().await;
    bob.end_call().await;
    // Give the controllers a moment to release media before exiting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
