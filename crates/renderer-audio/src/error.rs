//! Error taxonomy for the audio core.

use thiserror::Error;

/// Errors surfaced by [`crate::decode::Decoder`] and format negotiation.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to open {uri}: {reason}")]
    Open { uri: String, reason: String },

    #[error("no audio stream found in {uri}")]
    NoAudioStream { uri: String },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("seek is not supported for raw DSD streams")]
    SeekUnsupported,

    #[error("seek failed: {0}")]
    SeekFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    pub fn open(uri: &str, reason: impl ToString) -> Self {
        DecodeError::Open {
            uri: uri.to_string(),
            reason: reason.to_string(),
        }
    }
}
