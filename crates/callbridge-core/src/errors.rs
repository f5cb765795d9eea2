use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),
    #[error("signaling apply failed: {0}")]
    SignalingApply(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("channel decode failed: {0}")]
    ChannelDecode(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("a call session is already active")]
    SessionActive,
    #[error("no active call session")]
    NoActiveSession,
    #[error("channel closed")]
    ChannelClosed,
}

impl From<serde_json::Error> for CallError {
    fn from(e: serde_json::Error) -> Self {
        CallError::ChannelDecode(e.to_string())
    }
}
