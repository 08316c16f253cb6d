//! IPC protocol types for the front end driving this process.
//!
//! Events use `{"event": "<name>", "data": {...}}` format (voice-loop -> UI).
//! Commands use `{"command": "<name>", ...}` format (UI -> voice-loop).

pub mod bridge;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Events: voice-loop -> UI (stdout)
// ---------------------------------------------------------------------------

/// All events emitted as JSON lines.
///
/// Serialized as `{"event": "<variant>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum VoiceEvent {
    Starting {},
    Ready {},
    /// Turn state machine moved to `state`.
    StateChange { state: String },
    /// Human-readable status line.
    Status { message: String },
    RecordingStart {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    RecordingStop { reason: String },
    Transcription { text: String },
    /// Incremental assistant text.
    ResponseDelta { text: String },
    /// Full assistant text for the turn.
    Response { text: String },
    SpeakingStart {},
    SpeakingEnd {},
    Error { kind: String, message: String },
    Pong {},
    AudioDevices {
        input: Vec<AudioDeviceInfo>,
        output: Vec<AudioDeviceInfo>,
    },
    Stopping {},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: i32,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Commands: UI -> voice-loop (stdin)
// ---------------------------------------------------------------------------

/// All commands received as JSON lines.
///
/// Deserialized from `{"command": "<variant>", ...}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum VoiceCommand {
    /// Push-to-talk press.
    StartRecording {},
    /// Push-to-talk release.
    StopRecording {},
    SetAutoRestart {
        enabled: bool,
    },
    SetSilenceDetection {
        enabled: bool,
    },
    /// Speak text through the playback queue without a conversation turn.
    SystemSpeak {
        text: String,
    },
    ListAudioDevices {},
    Ping {},
    Stop {},
}

/// Receiver of controller events: the status indicator.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: VoiceEvent);
}
