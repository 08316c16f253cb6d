//! Voice Loop: push-to-talk voice conversation client.
//!
//! Captures microphone audio, stops on silence, uploads a WAV container for
//! transcription, streams the assistant's reply as text and audio, and plays
//! the audio back in order. A front end drives it with JSON-line IPC on
//! stdin/stdout.

pub mod audio;
pub mod backend;
pub mod config;
pub mod controller;
pub mod conversation;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod playback;
pub mod vad;
