//! Envelope codec for the host/sandbox boundary.
//!
//! Every command and event crosses the channel as `{"type": ..., "data": {...}}`.
//! Both directions are closed enums; `decode` matches the tag exhaustively and
//! turns anything it does not know into [`CallError::ChannelDecode`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::errors::CallError;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::state::CallState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "empty_data")]
    pub data: Value,
}

fn empty_data() -> Value {
    Value::Object(Map::new())
}

impl Envelope {
    pub fn new(kind: &str, data: Value) -> Self {
        Self { kind: kind.to_string(), data }
    }

    fn bare(kind: &str) -> Self {
        Self::new(kind, empty_data())
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, CallError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| CallError::ChannelDecode(format!("{}: {e}", self.kind)))
    }

    /// JSON text form carried by the channel.
    pub fn to_wire(&self) -> String {
        json!({ "type": self.kind, "data": self.data }).to_string()
    }

    pub fn from_wire(text: &str) -> Result<Self, CallError> {
        serde_json::from_str(text).map_err(|e| CallError::ChannelDecode(e.to_string()))
    }
}

/// Anything that crosses the boundary inside an [`Envelope`].
pub trait Message: Sized {
    fn encode(&self) -> Envelope;
    fn decode(envelope: &Envelope) -> Result<Self, CallError>;
}

pub fn to_wire<M: Message>(message: &M) -> String {
    message.encode().to_wire()
}

pub fn from_wire<M: Message>(text: &str) -> Result<M, CallError> {
    M::decode(&Envelope::from_wire(text)?)
}

// ── Commands: host → controller ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init { is_video: bool },
    CreateOffer,
    CreateAnswer { offer: SessionDescription },
    HandleAnswer { answer: SessionDescription },
    AddIceCandidate { candidate: IceCandidate },
    ToggleMute,
    ToggleVideo,
    SwitchCamera,
    EndCall,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitData {
    is_video: bool,
}

#[derive(Deserialize)]
struct CreateAnswerData {
    offer: SessionDescription,
}

#[derive(Deserialize)]
struct HandleAnswerData {
    answer: SessionDescription,
}

#[derive(Deserialize)]
struct CandidateData {
    candidate: IceCandidate,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::CreateOffer => "createOffer",
            Self::CreateAnswer { .. } => "createAnswer",
            Self::HandleAnswer { .. } => "handleAnswer",
            Self::AddIceCandidate { .. } => "addIceCandidate",
            Self::ToggleMute => "toggleMute",
            Self::ToggleVideo => "toggleVideo",
            Self::SwitchCamera => "switchCamera",
            Self::EndCall => "endCall",
        }
    }
}

impl Message for Command {
    fn encode(&self) -> Envelope {
        let kind = self.kind();
        match self {
            Self::Init { is_video } => Envelope::new(kind, json!({ "isVideo": is_video })),
            Self::CreateAnswer { offer } => Envelope::new(kind, json!({ "offer": offer })),
            Self::HandleAnswer { answer } => Envelope::new(kind, json!({ "answer": answer })),
            Self::AddIceCandidate { candidate } => {
                Envelope::new(kind, json!({ "candidate": candidate }))
            }
            Self::CreateOffer
            | Self::ToggleMute
            | Self::ToggleVideo
            | Self::SwitchCamera
            | Self::EndCall => Envelope::bare(kind),
        }
    }

    fn decode(envelope: &Envelope) -> Result<Self, CallError> {
        let command = match envelope.kind.as_str() {
            "init" => {
                let InitData { is_video } = envelope.payload()?;
                Self::Init { is_video }
            }
            "createOffer" => Self::CreateOffer,
            "createAnswer" => {
                let CreateAnswerData { offer } = envelope.payload()?;
                Self::CreateAnswer { offer }
            }
            "handleAnswer" => {
                let HandleAnswerData { answer } = envelope.payload()?;
                Self::HandleAnswer { answer }
            }
            "addIceCandidate" => {
                let CandidateData { candidate } = envelope.payload()?;
                Self::AddIceCandidate { candidate }
            }
            "toggleMute" => Self::ToggleMute,
            "toggleVideo" => Self::ToggleVideo,
            "switchCamera" => Self::SwitchCamera,
            "endCall" => Self::EndCall,
            other => {
                return Err(CallError::ChannelDecode(format!("unknown command type: {other}")));
            }
        };
        Ok(command)
    }
}

// ── Events: controller → host ─────────────────────────────────────────

/// Classifies an `error` event so the host can pick a user-facing reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    MediaAcquisition,
    SignalingApply,
    UnsupportedOperation,
    InvalidState,
    /// Raised host-side when a session never connects within the configured window.
    Timeout,
    #[default]
    Internal,
}

impl From<&CallError> for ErrorCode {
    fn from(e: &CallError) -> Self {
        match e {
            CallError::MediaAcquisition(_) => ErrorCode::MediaAcquisition,
            CallError::SignalingApply(_) => ErrorCode::SignalingApply,
            CallError::UnsupportedOperation(_) => ErrorCode::UnsupportedOperation,
            CallError::InvalidState(_) | CallError::SessionActive | CallError::NoActiveSession => {
                ErrorCode::InvalidState
            }
            CallError::ChannelDecode(_) | CallError::ChannelClosed => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    LocalStream { id: String },
    RemoteStream { id: String },
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
    MuteStatus { muted: bool },
    VideoStatus { enabled: bool },
    Error { code: ErrorCode, message: String },
    StateChanged { state: CallState },
}

#[derive(Deserialize)]
struct StreamData {
    id: String,
}

#[derive(Deserialize)]
struct SdpData {
    sdp: String,
}

#[derive(Deserialize)]
struct MuteData {
    muted: bool,
}

#[derive(Deserialize)]
struct VideoData {
    enabled: bool,
}

#[derive(Deserialize)]
struct ErrorData {
    message: String,
    #[serde(default)]
    code: ErrorCode,
}

#[derive(Deserialize)]
struct StateData {
    state: CallState,
}

impl Event {
    pub fn error(err: &CallError) -> Self {
        Self::Error { code: err.into(), message: err.to_string() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::LocalStream { .. } => "localStream",
            Self::RemoteStream { .. } => "remoteStream",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "iceCandidate",
            Self::MuteStatus { .. } => "muteStatus",
            Self::VideoStatus { .. } => "videoStatus",
            Self::Error { .. } => "error",
            Self::StateChanged { .. } => "stateChanged",
        }
    }
}

impl Message for Event {
    fn encode(&self) -> Envelope {
        let data = match self {
            Self::LocalStream { id } | Self::RemoteStream { id } => json!({ "id": id }),
            Self::Offer { sdp } | Self::Answer { sdp } => json!({ "sdp": sdp }),
            Self::IceCandidate { candidate } => json!({ "candidate": candidate }),
            Self::MuteStatus { muted } => json!({ "muted": muted }),
            Self::VideoStatus { enabled } => json!({ "enabled": enabled }),
            Self::Error { code, message } => json!({ "message": message, "code": code }),
            Self::StateChanged { state } => json!({ "state": state }),
        };
        Envelope::new(self.kind(), data)
    }

    fn decode(envelope: &Envelope) -> Result<Self, CallError> {
        let event = match envelope.kind.as_str() {
            "localStream" => {
                let StreamData { id } = envelope.payload()?;
                Self::LocalStream { id }
            }
            "remoteStream" => {
                let StreamData { id } = envelope.payload()?;
                Self::RemoteStream { id }
            }
            "offer" => {
                let SdpData { sdp } = envelope.payload()?;
                Self::Offer { sdp }
            }
            "answer" => {
                let SdpData { sdp } = envelope.payload()?;
                Self::Answer { sdp }
            }
            "iceCandidate" => {
                let CandidateData { candidate } = envelope.payload()?;
                Self::IceCandidate { candidate }
            }
            "muteStatus" => {
                let MuteData { muted } = envelope.payload()?;
                Self::MuteStatus { muted }
            }
            "videoStatus" => {
                let VideoData { enabled } = envelope.payload()?;
                Self::VideoStatus { enabled }
            }
            "error" => {
                let ErrorData { message, code } = envelope.payload()?;
                Self::Error { code, message }
            }
            "stateChanged" => {
                let StateData { state } = envelope.payload()?;
                Self::StateChanged { state }
            }
            other => {
                return Err(CallError::ChannelDecode(format!("unknown event type: {other}")));
            }
        };
        Ok(event)
    }
}
