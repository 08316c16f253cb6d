//! Turn state machine states and legal transitions.

/// Where the current turn is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// No turn in progress. Manual start (or a pending auto-restart) leaves it.
    Idle,
    /// Microphone open, frames accumulating, silence detector running.
    Capturing,
    /// Capture stopped; container being exported and size-checked.
    Encoding,
    /// Container uploaded, waiting for the transcript.
    AwaitingTranscript,
    /// Generation stream open; text and audio events arriving.
    Streaming,
    /// Stream finished (or one-shot speech fetched); queue still playing.
    Draining,
}

impl TurnState {
    /// Whether `self -> next` is a legal edge. Every state may fall back to
    /// `Idle` (completion, error, or teardown).
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, next),
            (_, Idle)
                | (Idle, Capturing)
                | (Idle, Draining)
                | (Capturing, Encoding)
                | (Encoding, AwaitingTranscript)
                | (AwaitingTranscript, Streaming)
                | (Streaming, Draining)
        )
    }

    /// Default status line shown while in this state.
    pub fn status_message(self) -> &'static str {
        match self {
            Self::Idle => "Your turn",
            Self::Capturing => "Listening... (stops after silence)",
            Self::Encoding => "Processing audio...",
            Self::AwaitingTranscript => "Transcribing...",
            Self::Streaming => "Thinking...",
            Self::Draining => "Speaking...",
        }
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Capturing => write!(f, "capturing"),
            Self::Encoding => write!(f, "encoding"),
            Self::AwaitingTranscript => write!(f, "awaiting_transcript"),
            Self::Streaming => write!(f, "streaming"),
            Self::Draining => write!(f, "draining"),
        }
    }
}
