//! Client side of the speech/LLM/TTS backend.
//!
//! Provides a dyn-compatible `VoiceBackend` trait with an HTTP implementation
//! for the three collaborator endpoints:
//! - `POST /api/transcribe` (multipart WAV upload)
//! - `POST /api/chat_and_speak_stream` (streamed text + audio events)
//! - `POST /api/speak` (one-shot synthesis)

pub mod http;
pub mod sse;

use std::future::Future;
use std::pin::Pin;

use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::audio::EncodedAudioContainer;
use crate::conversation::Turn;
use crate::error::TurnError;

pub use http::HttpBackend;

/// One event from the generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental response text.
    Text(String),
    /// Base64-encoded compressed audio for one speakable fragment.
    Audio(String),
    Done,
    Error(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, TurnError>> + Send>>;

pub type BackendFuture<T> = Pin<Box<dyn Future<Output = Result<T, TurnError>> + Send>>;

/// Body of the streaming generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    pub text: String,
    pub history: Vec<Turn>,
}

/// Transcription endpoint response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscribeResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TranscribeResponse {
    /// Resolve to the transcript, or the reason there is none.
    pub fn into_transcript(self) -> Result<String, TurnError> {
        if !self.success {
            return Err(TurnError::TranscriptionFailed(
                self.error
                    .unwrap_or_else(|| "Backend reported failure".to_string()),
            ));
        }
        match self.text {
            Some(text) if !text.trim().is_empty() => Ok(text),
            Some(_) => Err(TurnError::TranscriptionFailed(
                "No speech recognized".to_string(),
            )),
            None => Err(TurnError::TranscriptionFailed(
                "Response contained no text".to_string(),
            )),
        }
    }
}

/// Backend collaborator used by the turn controller.
///
/// Futures are `'static` so the controller can hold them across loop
/// iterations while it keeps servicing commands.
pub trait VoiceBackend: Send + Sync {
    /// Upload a WAV container and return the transcript.
    fn transcribe(&self, audio: EncodedAudioContainer) -> BackendFuture<String>;

    /// Open the generation stream for the latest user turn.
    fn chat_and_speak(&self, request: ChatRequest) -> BackendFuture<EventStream>;

    /// Synthesize `text` and return compressed audio bytes.
    fn speak(&self, text: String) -> BackendFuture<Vec<u8>>;
}
