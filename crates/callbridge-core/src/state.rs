use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a media session in the negotiation state machine.
///
/// The happy path only moves forward:
/// `Idle → Initializing → AwaitingRemoteDescription → Negotiating → Connected → Ending → Ended`.
/// The callee skips `AwaitingRemoteDescription`. `Failed` is terminal and
/// reachable from any state that is not already terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallState {
    Idle,
    Initializing,
    AwaitingRemoteDescription,
    Negotiating,
    Connected,
    Ending,
    Ended,
    Failed,
}

impl CallState {
    /// `Ending`, `Ended` or `Failed`.
    pub fn is_closing(self) -> bool {
        matches!(self, CallState::Ending | CallState::Ended | CallState::Failed)
    }

    /// States in which the controller holds local media tracks.
    pub fn has_local_media(self) -> bool {
        matches!(
            self,
            CallState::Initializing
                | CallState::AwaitingRemoteDescription
                | CallState::Negotiating
                | CallState::Connected
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::AwaitingRemoteDescription => "awaiting-remote-description",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Ending => "ending",
            Self::Ended => "ended",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallMode {
    Audio,
    Video,
}

impl CallMode {
    pub fn from_is_video(is_video: bool) -> Self {
        if is_video { CallMode::Video } else { CallMode::Audio }
    }

    pub fn is_video(self) -> bool {
        self == CallMode::Video
    }
}

/// Which side initiated the session. Fixed for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallRole {
    Caller,
    Callee,
}
