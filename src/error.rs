//! Error taxonomy for one voice turn.
//!
//! Every failure inside the turn pipeline is a `TurnError`. The controller
//! reports it through the event sink and logs it; nothing escapes to the
//! caller of `TurnController::run`.

use std::time::Duration;

/// Errors that can end (or, for playback, degrade) a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnError {
    /// Microphone permission refused or no usable input device.
    MicrophoneDenied(String),
    /// Encoded container is below the minimum viable size.
    CaptureTooShort { bytes: usize, minimum: usize },
    /// Transcription endpoint returned `success: false` or a non-2xx status.
    TranscriptionFailed(String),
    /// An `error` event arrived on the generation stream.
    StreamError(String),
    /// Transport-level failure or disconnect.
    NetworkFailure(String),
    /// A bounded wait on the backend expired.
    NetworkTimeout { operation: &'static str, after: Duration },
    /// The output driver rejected one queued unit.
    PlaybackFailure(String),
    /// A new capture was requested while a turn is in flight.
    Busy(String),
}

impl TurnError {
    /// Stable identifier used in `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MicrophoneDenied(_) => "MicrophoneDenied",
            Self::CaptureTooShort { .. } => "CaptureTooShort",
            Self::TranscriptionFailed(_) => "TranscriptionFailed",
            Self::StreamError(_) => "StreamError",
            Self::NetworkFailure(_) => "NetworkFailure",
            Self::NetworkTimeout { .. } => "NetworkTimeout",
            Self::PlaybackFailure(_) => "PlaybackFailure",
            Self::Busy(_) => "Busy",
        }
    }

    /// Whether this error aborts the turn. Playback failures skip one unit;
    /// busy rejections leave the running turn untouched.
    pub fn aborts_turn(&self) -> bool {
        !matches!(self, Self::PlaybackFailure(_) | Self::Busy(_))
    }
}

impl std::fmt::Display for TurnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MicrophoneDenied(msg) => write!(f, "Microphone unavailable: {}", msg),
            Self::CaptureTooShort { bytes, minimum } => write!(
                f,
                "Recording too short or empty ({} bytes, need at least {})",
                bytes, minimum
            ),
            Self::TranscriptionFailed(msg) => write!(f, "Transcription failed: {}", msg),
            Self::StreamError(msg) => write!(f, "Response stream error: {}", msg),
            Self::NetworkFailure(msg) => write!(f, "Network error: {}", msg),
            Self::NetworkTimeout { operation, after } => write!(
                f,
                "Timed out waiting for {} after {:.1}s",
                operation,
                after.as_secs_f64()
            ),
            Self::PlaybackFailure(msg) => write!(f, "Playback error: {}", msg),
            Self::Busy(msg) => write!(f, "Busy: {}", msg),
        }
    }
}

impl std::error::Error for TurnError {}

impl From<reqwest::Error> for TurnError {
    fn from(e: reqwest::Error) -> Self {
        Self::NetworkFailure(e.to_string())
    }
}
