use bridge_protocol::{BridgeError, ErrorCode, TransportError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpeakError>;

/// Failure reported to the speech host for one speak request
#[derive(Error, Debug)]
pub enum SpeakError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Voice not found: {0}")]
    VoiceNotFound(String),

    #[error("Synthesis engine failure: {0}")]
    EngineFailure(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),

    #[error("Timed out waiting for model server: {0}")]
    Timeout(String),

    #[error("Could not connect to model server: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Audio sink error: {0}")]
    Sink(String),
}

impl From<BridgeError> for SpeakError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Server { code, message } => match code {
                ErrorCode::EmptyText => SpeakError::InvalidArgument(message),
                ErrorCode::InvalidVoice => SpeakError::VoiceNotFound(message),
                ErrorCode::ModelError => SpeakError::EngineFailure(message),
                ErrorCode::Unknown | ErrorCode::Other(_) => {
                    SpeakError::Unexpected(format!("server error {}: {}", code, message))
                }
            },
            BridgeError::Protocol(e) => SpeakError::Unexpected(e.to_string()),
            BridgeError::Transport(e) => match e {
                TransportError::ConnectTimeout { .. } => SpeakError::Timeout(e.to_string()),
                TransportError::ConnectFailed { .. } => SpeakError::ConnectionFailed(e.to_string()),
                TransportError::Broken | TransportError::NotConnected | TransportError::Io(_) => {
                    SpeakError::Transport(e.to_string())
                }
            },
        }
    }
}
