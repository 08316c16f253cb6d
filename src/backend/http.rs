//! HTTP implementation of `VoiceBackend` over reqwest.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::multipart;
use tracing::{debug, info};

use super::sse::decode_event_stream;
use super::{BackendFuture, ChatRequest, EventStream, TranscribeResponse, VoiceBackend};
use crate::audio::EncodedAudioContainer;
use crate::config::VoiceLoopConfig;
use crate::error::TurnError;

/// Backend reached over plain HTTP at `base_url`.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    transcribe_timeout: Duration,
    first_byte_timeout: Duration,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, transcribe_timeout: Duration, first_byte_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            transcribe_timeout,
            first_byte_timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &VoiceLoopConfig) -> Self {
        Self::new(
            &config.backend_url,
            config.transcribe_timeout(),
            config.first_byte_timeout(),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Read the `error` field of a JSON failure body, falling back to the raw
/// body text.
async fn error_message(resp: reqwest::Response) -> String {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<TranscribeResponse>(&body) {
        Ok(TranscribeResponse {
            error: Some(msg), ..
        }) => msg,
        _ if body.trim().is_empty() => format!("HTTP {}", status),
        _ => format!("HTTP {}: {}", status, body.trim()),
    }
}

async fn post_transcription(
    client: reqwest::Client,
    url: String,
    audio: EncodedAudioContainer,
) -> Result<String, TurnError> {
    let file_part = multipart::Part::bytes(audio.into_bytes())
        .file_name("recording.wav")
        .mime_str("audio/wav")?;
    let form = multipart::Form::new().part("audio", file_part);

    let resp = client.post(&url).multipart(form).send().await?;
    if !resp.status().is_success() {
        return Err(TurnError::TranscriptionFailed(error_message(resp).await));
    }
    let text = resp.text().await?;
    let body: TranscribeResponse = serde_json::from_str(&text).map_err(|e| {
        TurnError::TranscriptionFailed(format!("Unreadable transcription response: {}", e))
    })?;
    body.into_transcript()
}

/// Send the generation request and wait for the first body chunk.
async fn open_response_stream(
    client: reqwest::Client,
    url: String,
    request: ChatRequest,
) -> Result<EventStream, TurnError> {
    let resp = client.post(&url).json(&request).send().await?;
    if !resp.status().is_success() {
        return Err(TurnError::NetworkFailure(error_message(resp).await));
    }
    let mut body = resp.bytes_stream();
    let first = match body.next().await {
        Some(chunk) => Some(chunk?),
        None => None,
    };
    Ok(decode_event_stream(first, body))
}

async fn post_speech(client: reqwest::Client, url: String, text: String) -> Result<Vec<u8>, TurnError> {
    let body = serde_json::json!({ "text": text });
    let resp = client.post(&url).json(&body).send().await?;
    if !resp.status().is_success() {
        return Err(TurnError::NetworkFailure(error_message(resp).await));
    }
    Ok(resp.bytes().await?.to_vec())
}

impl VoiceBackend for HttpBackend {
    fn transcribe(&self, audio: EncodedAudioContainer) -> BackendFuture<String> {
        let client = self.client.clone();
        let url = self.url("/api/transcribe");
        let timeout = self.transcribe_timeout;

        Box::pin(async move {
            debug!(bytes = audio.len(), url = %url, "Sending audio for transcription");
            match tokio::time::timeout(timeout, post_transcription(client, url, audio)).await {
                Ok(result) => result,
                Err(_) => Err(TurnError::NetworkTimeout {
                    operation: "transcription",
                    after: timeout,
                }),
            }
        })
    }

    fn chat_and_speak(&self, request: ChatRequest) -> BackendFuture<EventStream> {
        let client = self.client.clone();
        let url = self.url("/api/chat_and_speak_stream");
        let timeout = self.first_byte_timeout;

        Box::pin(async move {
            debug!(history = request.history.len(), "Opening response stream");
            match tokio::time::timeout(timeout, open_response_stream(client, url, request)).await {
                Ok(Ok(stream)) => {
                    info!("Response stream opened");
                    Ok(stream)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(TurnError::NetworkTimeout {
                    operation: "first response byte",
                    after: timeout,
                }),
            }
        })
    }

    fn speak(&self, text: String) -> BackendFuture<Vec<u8>> {
        let client = self.client.clone();
        let url = self.url("/api/speak");
        let timeout = self.transcribe_timeout;

        Box::pin(async move {
            info!(text_len = text.len(), "Speech synthesis request");
            match tokio::time::timeout(timeout, post_speech(client, url, text)).await {
                Ok(result) => result,
                Err(_) => Err(TurnError::NetworkTimeout {
                    operation: "speech synthesis",
                    after: timeout,
                }),
            }
        })
    }
}
