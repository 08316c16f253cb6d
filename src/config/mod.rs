//! Configuration reading and data directory paths.

pub mod paths;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use paths::get_data_dir;

/// voice_loop.json shape. Every field is optional on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceLoopConfig {
    /// Base URL of the speech/LLM/TTS backend.
    pub backend_url: String,
    /// Input device name; `None` uses the system default.
    pub input_device: Option<String>,
    /// Output device name; `None` uses the system default.
    pub output_device: Option<String>,
    /// Channels recorded into the WAV container.
    pub channels: u16,
    pub silence_detection: bool,
    /// Normalized RMS below which input counts as silent.
    pub silence_threshold: f32,
    pub silence_grace_ms: u64,
    pub silence_duration_ms: u64,
    /// Samples kept in the analyser window.
    pub analyser_window: usize,
    pub analyser_tick_ms: u64,
    pub min_container_bytes: usize,
    pub auto_restart: bool,
    pub restart_delay_ms: u64,
    pub playback_gap_ms: u64,
    pub playback_volume: f32,
    pub transcribe_timeout_ms: u64,
    pub first_byte_timeout_ms: u64,
}

impl Default for VoiceLoopConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:5000".to_string(),
            input_device: None,
            output_device: None,
            channels: 1,
            silence_detection: true,
            silence_threshold: 0.02,
            silence_grace_ms: 1000,
            silence_duration_ms: 2500,
            analyser_window: 2048,
            analyser_tick_ms: 16,
            min_container_bytes: 100,
            auto_restart: true,
            restart_delay_ms: 1000,
            playback_gap_ms: 50,
            playback_volume: 1.0,
            transcribe_timeout_ms: 30_000,
            first_byte_timeout_ms: 20_000,
        }
    }
}

impl VoiceLoopConfig {
    pub fn silence_grace(&self) -> Duration {
        Duration::from_millis(self.silence_grace_ms)
    }

    pub fn silence_duration(&self) -> Duration {
        Duration::from_millis(self.silence_duration_ms)
    }

    pub fn analyser_tick(&self) -> Duration {
        // A zero period would make tokio's interval panic.
        Duration::from_millis(self.analyser_tick_ms.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn playback_gap(&self) -> Duration {
        Duration::from_millis(self.playback_gap_ms)
    }

    pub fn transcribe_timeout(&self) -> Duration {
        Duration::from_millis(self.transcribe_timeout_ms)
    }

    pub fn first_byte_timeout(&self) -> Duration {
        Duration::from_millis(self.first_byte_timeout_ms)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.backend_url.starts_with("http://") || self.backend_url.starts_with("https://")) {
            return Err(format!("backendUrl must be an http(s) URL, got '{}'", self.backend_url));
        }
        if self.channels == 0 {
            return Err("channels must be at least 1".into());
        }
        if !(self.silence_threshold > 0.0 && self.silence_threshold <= 1.0) {
            return Err(format!(
                "silenceThreshold must be in (0, 1], got {}",
                self.silence_threshold
            ));
        }
        if self.analyser_window == 0 {
            return Err("analyserWindow must be at least 1".into());
        }
        if !(0.0..=2.0).contains(&self.playback_volume) {
            return Err(format!(
                "playbackVolume must be in [0, 2], got {}",
                self.playback_volume
            ));
        }
        Ok(())
    }
}

/// Read voice_loop.json from the data directory, falling back to defaults.
pub fn read_voice_loop_config() -> VoiceLoopConfig {
    read_json_file(&get_config_path()).unwrap_or_default()
}

/// Path to voice_loop.json.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("voice_loop.json")
}

/// Generic helper: read a JSON file and deserialize it.
fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}
