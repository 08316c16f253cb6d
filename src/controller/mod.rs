//! Turn controller: drives one conversational turn at a time.
//!
//! Everything the turn waits on (commands, microphone frames, the analyser
//! tick, the silence deadline, backend futures, stream events, playback
//! completion, the inter-unit gap and the auto-restart delay) is a branch of
//! a single `select!` loop. Resources for the current phase live in `Option`
//! fields and are released by dropping them, so there is never more than one
//! turn, one microphone stream or one playing unit in flight.

mod state;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::{
    list_devices, list_output_devices, Analyser, AudioSession, CaptureFrame, MicOpening, MicStream,
    Microphone,
};
use crate::backend::{BackendFuture, ChatRequest, EventStream, StreamEvent, VoiceBackend};
use crate::config::VoiceLoopConfig;
use crate::conversation::ConversationHistory;
use crate::error::TurnError;
use crate::ipc::{AudioDeviceInfo, EventSink, VoiceCommand, VoiceEvent};
use crate::playback::{AudioOutput, PlaybackDone, PlaybackQueue};
use crate::vad::{SilenceConfig, SilenceDetector, SilenceSignal};

pub use state::TurnState;

/// Controller tuning, derived from `VoiceLoopConfig`.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub silence: SilenceConfig,
    pub silence_detection: bool,
    /// Requested capture channel count; capped by what the device delivers.
    pub channels: u16,
    pub analyser_window: usize,
    pub analyser_tick: Duration,
    pub min_container_bytes: usize,
    pub auto_restart: bool,
    pub restart_delay: Duration,
    pub playback_gap: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&VoiceLoopConfig::default())
    }
}

impl From<&VoiceLoopConfig> for ControllerSettings {
    fn from(config: &VoiceLoopConfig) -> Self {
        Self {
            silence: SilenceConfig {
                threshold: config.silence_threshold,
                grace: config.silence_grace(),
                duration: config.silence_duration(),
            },
            silence_detection: config.silence_detection,
            channels: config.channels,
            analyser_window: config.analyser_window,
            analyser_tick: config.analyser_tick(),
            min_container_bytes: config.min_container_bytes,
            auto_restart: config.auto_restart,
            restart_delay: config.restart_delay(),
            playback_gap: config.playback_gap(),
        }
    }
}

/// What the in-flight turn was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnKind {
    Conversation,
    /// One-shot `system_speak`: no history, no auto-restart.
    SystemSpeech,
}

pub struct TurnController {
    settings: ControllerSettings,
    backend: Arc<dyn VoiceBackend>,
    microphone: Box<dyn Microphone>,
    output: Box<dyn AudioOutput>,
    events: Arc<dyn EventSink>,

    state: TurnState,
    kind: TurnKind,
    turn_id: Option<Uuid>,
    history: ConversationHistory,

    // Capturing
    mic_opening: Option<MicOpening>,
    mic: Option<MicStream>,
    session: Option<AudioSession>,
    analyser: Analyser,
    silence: SilenceDetector,

    // Backend
    transcription: Option<BackendFuture<String>>,
    opening: Option<BackendFuture<EventStream>>,
    stream: Option<EventStream>,
    synthesis: Option<BackendFuture<Vec<u8>>>,
    response: String,

    // Playback
    queue: PlaybackQueue,
    playing: Option<PlaybackDone>,
    speaking: bool,
    gap_until: Option<Instant>,

    restart_at: Option<Instant>,
}

impl TurnController {
    pub fn new(
        settings: ControllerSettings,
        backend: Arc<dyn VoiceBackend>,
        microphone: Box<dyn Microphone>,
        output: Box<dyn AudioOutput>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let mut silence = SilenceDetector::new(settings.silence, Instant::now().into_std());
        silence.set_enabled(settings.silence_detection);
        let analyser = Analyser::new(settings.analyser_window);

        Self {
            settings,
            backend,
            microphone,
            output,
            events,
            state: TurnState::Idle,
            kind: TurnKind::Conversation,
            turn_id: None,
            history: ConversationHistory::new(),
            mic_opening: None,
            mic: None,
            session: None,
            analyser,
            silence,
            transcription: None,
            opening: None,
            stream: None,
            synthesis: None,
            response: String::new(),
            queue: PlaybackQueue::new(),
            playing: None,
            speaking: false,
            gap_until: None,
            restart_at: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn auto_restart(&self) -> bool {
        self.settings.auto_restart
    }

    /// Drive turns until a `stop` command arrives or the command channel
    /// closes, then release everything.
    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<VoiceCommand>) {
        let mut tick = tokio::time::interval(self.settings.analyser_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.emit_status(self.state.status_message());

        loop {
            let capturing = self.state == TurnState::Capturing;
            let silence_deadline = self
                .silence
                .deadline()
                .filter(|_| capturing)
                .map(Instant::from_std);
            let gap_until = self.gap_until;
            let restart_at = self.restart_at;

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        info!("Command channel closed");
                        break;
                    }
                },
                result = poll_slot(&mut self.mic_opening), if self.mic_opening.is_some() => {
                    self.mic_opening = None;
                    self.on_mic_opened(result);
                }
                frame = next_frame(&mut self.mic), if capturing => self.on_frame(frame),
                _ = tick.tick(), if capturing => self.on_tick(),
                _ = sleep_until(silence_deadline), if silence_deadline.is_some() => {
                    self.on_silence_deadline();
                }
                result = poll_slot(&mut self.transcription), if self.transcription.is_some() => {
                    self.transcription = None;
                    self.on_transcript(result);
                }
                result = poll_slot(&mut self.opening), if self.opening.is_some() => {
                    self.opening = None;
                    self.on_stream_opened(result);
                }
                item = next_event(&mut self.stream), if self.stream.is_some() => {
                    self.on_stream_item(item);
                }
                result = poll_slot(&mut self.synthesis), if self.synthesis.is_some() => {
                    self.synthesis = None;
                    self.on_synthesis(result);
                }
                result = poll_slot(&mut self.playing), if self.playing.is_some() => {
                    self.playing = None;
                    let result = result.unwrap_or_else(|_| Err("Playback driver went away".to_string()));
                    self.on_unit_finished(result);
                }
                _ = sleep_until(gap_until), if gap_until.is_some() => {
                    self.gap_until = None;
                    self.play_next();
                }
                _ = sleep_until(restart_at), if restart_at.is_some() => {
                    self.restart_at = None;
                    if !self.is_busy() {
                        info!("Auto-restarting capture");
                        self.start_capture();
                    }
                }
            }
        }

        self.dispose();
    }

    /// Release the microphone, drop any open request or stream, stop playback
    /// and clear the queue. Leaves the controller `Idle`.
    pub fn dispose(&mut self) {
        self.release_turn();
        self.restart_at = None;
        if self.state != TurnState::Idle {
            self.transition(TurnState::Idle);
        }
        info!("Turn controller disposed");
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Returns `false` when the controller should shut down.
    fn handle_command(&mut self, command: VoiceCommand) -> bool {
        debug!(?command, state = %self.state, "Handling command");
        match command {
            VoiceCommand::StartRecording {} => {
                self.restart_at = None;
                self.start_capture();
            }
            VoiceCommand::StopRecording {} => {
                if self.state == TurnState::Capturing {
                    self.finish_capture("manual");
                } else if self.mic_opening.take().is_some() {
                    info!("Released before the microphone opened");
                    self.emit_status(self.state.status_message());
                } else {
                    debug!(state = %self.state, "stop_recording ignored outside capture");
                }
            }
            VoiceCommand::SetAutoRestart { enabled } => {
                self.settings.auto_restart = enabled;
                if !enabled {
                    self.restart_at = None;
                }
                info!(enabled, "Auto-restart toggled");
                self.emit_status(if enabled {
                    "Auto-restart enabled"
                } else {
                    "Auto-restart disabled"
                });
            }
            VoiceCommand::SetSilenceDetection { enabled } => {
                self.settings.silence_detection = enabled;
                self.silence.set_enabled(enabled);
                info!(enabled, "Silence detection toggled");
            }
            VoiceCommand::SystemSpeak { text } => self.start_system_speech(text),
            VoiceCommand::ListAudioDevices {} => {
                self.events.emit(VoiceEvent::AudioDevices {
                    input: device_infos(list_devices()),
                    output: device_infos(list_output_devices()),
                });
            }
            VoiceCommand::Ping {} => self.events.emit(VoiceEvent::Pong {}),
            VoiceCommand::Stop {} => {
                info!("Stop requested");
                return false;
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Capturing
    // -----------------------------------------------------------------------

    /// A turn is in flight, or the microphone is still being acquired.
    fn is_busy(&self) -> bool {
        self.state != TurnState::Idle || self.mic_opening.is_some()
    }

    fn busy_error(&self) -> TurnError {
        if self.mic_opening.is_some() {
            TurnError::Busy("Microphone is still opening".to_string())
        } else {
            TurnError::Busy(format!("A turn is already {}", self.state))
        }
    }

    /// Ask for the microphone. The state stays `Idle` until it is granted.
    fn start_capture(&mut self) {
        if self.is_busy() {
            self.report(self.busy_error());
            return;
        }
        self.mic = None;
        debug!("Requesting microphone");
        self.mic_opening = Some(self.microphone.open());
        self.emit_status("Requesting microphone...");
    }

    /// Idle -> Capturing once the device is streaming.
    fn on_mic_opened(&mut self, result: Result<MicStream, TurnError>) {
        let mic = match result {
            Ok(mic) => mic,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        if self.state != TurnState::Idle {
            warn!(state = %self.state, "Microphone opened outside idle; releasing it");
            return;
        }

        let now = Instant::now().into_std();
        let channels = self.settings.channels.min(mic.channels).max(1);
        let mut session = AudioSession::new(mic.sample_rate, channels, now);
        session.clear();
        session.record();

        self.analyser.reset();
        self.silence.reset(now);
        self.silence.set_enabled(self.settings.silence_detection);
        self.kind = TurnKind::Conversation;
        self.turn_id = Some(session.id());

        info!(
            turn = %session.id(),
            sample_rate = mic.sample_rate,
            device_channels = mic.channels,
            channels,
            "Capture started"
        );
        self.events.emit(VoiceEvent::RecordingStart {
            session_id: session.id().to_string(),
        });

        self.session = Some(session);
        self.mic = Some(mic);
        self.transition(TurnState::Capturing);
    }

    fn on_frame(&mut self, frame: Option<CaptureFrame>) {
        match frame {
            Some(frame) => {
                if let Some(session) = self.session.as_mut() {
                    session.push_frame(&frame);
                }
                self.analyser.feed(&frame);
            }
            None => {
                warn!("Input stream ended during capture");
                self.finish_capture("input_closed");
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now().into_std();
        if self.silence.observe(&self.analyser.snapshot(), now) == SilenceSignal::Stop {
            self.on_silence();
        }
    }

    fn on_silence_deadline(&mut self) {
        let now = Instant::now().into_std();
        if self.silence.poll(now) == SilenceSignal::Stop {
            self.on_silence();
        }
    }

    fn on_silence(&mut self) {
        info!(rms = self.silence.last_rms(), "Silence detected, stopping capture");
        self.finish_capture("silence");
    }

    /// Capturing -> Encoding -> AwaitingTranscript.
    fn finish_capture(&mut self, reason: &str) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.stop();
        self.silence.cancel();
        self.mic = None;

        self.events.emit(VoiceEvent::RecordingStop {
            reason: reason.to_string(),
        });
        self.transition(TurnState::Encoding);

        let container = session.export();
        let held = Instant::now()
            .into_std()
            .saturating_duration_since(session.started_at());
        info!(
            turn = %session.id(),
            reason,
            held_ms = held.as_millis() as u64,
            frames = session.frame_count(),
            bytes = container.len(),
            "Capture finished"
        );
        drop(session);

        if container.len() < self.settings.min_container_bytes {
            self.fail(TurnError::CaptureTooShort {
                bytes: container.len(),
                minimum: self.settings.min_container_bytes,
            });
            return;
        }

        self.transition(TurnState::AwaitingTranscript);
        self.transcription = Some(self.backend.transcribe(container));
    }

    // -----------------------------------------------------------------------
    // Backend
    // -----------------------------------------------------------------------

    /// AwaitingTranscript -> Streaming. The user turn is in the history
    /// before the request that carries it is opened.
    fn on_transcript(&mut self, result: Result<String, TurnError>) {
        let text = match result {
            Ok(text) => text,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        info!(turn = ?self.turn_id, chars = text.len(), "Transcript received");
        self.events.emit(VoiceEvent::Transcription { text: text.clone() });
        self.history.push_user(text.clone());

        self.response.clear();
        self.queue.clear();
        self.transition(TurnState::Streaming);

        let request = ChatRequest {
            text,
            history: self.history.turns().to_vec(),
        };
        self.opening = Some(self.backend.chat_and_speak(request));
    }

    fn on_stream_opened(&mut self, result: Result<EventStream, TurnError>) {
        match result {
            Ok(stream) => {
                debug!("Generation stream open");
                self.stream = Some(stream);
            }
            Err(e) => self.fail(e),
        }
    }

    fn on_stream_item(&mut self, item: Option<Result<StreamEvent, TurnError>>) {
        match item {
            Some(Ok(StreamEvent::Text(text))) => {
                self.response.push_str(&text);
                self.events.emit(VoiceEvent::ResponseDelta { text });
            }
            Some(Ok(StreamEvent::Audio(encoded))) => {
                match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
                    Ok(bytes) => {
                        let id = self.queue.enqueue(bytes);
                        debug!(unit = id, pending = self.queue.pending_len(), "Audio unit queued");
                        if !self.queue.is_playing() && self.gap_until.is_none() {
                            self.play_next();
                        }
                    }
                    Err(e) => self.report(TurnError::PlaybackFailure(format!(
                        "Audio chunk is not valid base64: {}",
                        e
                    ))),
                }
            }
            Some(Ok(StreamEvent::Done)) => {
                self.stream = None;
                self.complete_stream();
            }
            Some(Ok(StreamEvent::Error(message))) => self.fail(TurnError::StreamError(message)),
            Some(Err(e)) => self.fail(e),
            None => {
                warn!("Generation stream ended without a done event");
                self.stream = None;
                self.complete_stream();
            }
        }
    }

    /// Streaming -> Draining, or straight to Idle when nothing is left to play.
    fn complete_stream(&mut self) {
        self.queue.mark_stream_done();
        let response = std::mem::take(&mut self.response);
        info!(turn = ?self.turn_id, chars = response.len(), "Response complete");
        self.history.push_assistant(response.clone());
        self.events.emit(VoiceEvent::Response { text: response });

        if self.queue.is_idle() {
            self.finish_turn();
        } else {
            self.transition(TurnState::Draining);
        }
    }

    fn start_system_speech(&mut self, text: String) {
        if self.is_busy() {
            self.report(self.busy_error());
            return;
        }
        self.restart_at = None;
        self.kind = TurnKind::SystemSpeech;
        self.turn_id = Some(Uuid::new_v4());
        self.queue.clear();
        info!(turn = ?self.turn_id, chars = text.len(), "System speech requested");
        self.transition(TurnState::Draining);
        self.synthesis = Some(self.backend.speak(text));
    }

    fn on_synthesis(&mut self, result: Result<Vec<u8>, TurnError>) {
        match result {
            Ok(bytes) => {
                self.queue.enqueue(bytes);
                self.queue.mark_stream_done();
                self.play_next();
            }
            Err(e) => self.fail(e),
        }
    }

    // -----------------------------------------------------------------------
    // Playback
    // -----------------------------------------------------------------------

    /// Start the next pending unit. A unit the driver refuses is skipped.
    fn play_next(&mut self) {
        while let Some(unit) = self.queue.start_next() {
            let id = unit.id;
            match self.output.play(unit) {
                Ok(done) => {
                    debug!(unit = id, "Unit playing");
                    if !self.speaking {
                        self.speaking = true;
                        self.events.emit(VoiceEvent::SpeakingStart {});
                    }
                    self.playing = Some(done);
                    return;
                }
                Err(e) => {
                    self.queue.finish_current();
                    self.report(e);
                }
            }
        }
        self.check_drained();
    }

    fn on_unit_finished(&mut self, result: Result<(), String>) {
        let finished = self.queue.finish_current();
        match result {
            Ok(()) => {
                debug!(unit = ?finished, "Unit finished");
                if self.queue.pending_len() > 0 {
                    self.gap_until = Some(Instant::now() + self.settings.playback_gap);
                } else {
                    self.check_drained();
                }
            }
            Err(message) => {
                self.report(TurnError::PlaybackFailure(message));
                self.play_next();
            }
        }
    }

    fn check_drained(&mut self) {
        if self.state == TurnState::Draining && self.queue.is_drained() {
            self.finish_turn();
        }
    }

    /// End of a successful turn.
    fn finish_turn(&mut self) {
        if self.speaking {
            self.speaking = false;
            self.events.emit(VoiceEvent::SpeakingEnd {});
        }
        self.queue.clear();
        self.gap_until = None;

        let restart = self.settings.auto_restart && self.kind == TurnKind::Conversation;
        info!(turn = ?self.turn_id, restart, "Turn complete");
        self.turn_id = None;
        self.transition(TurnState::Idle);

        if restart {
            self.restart_at = Some(Instant::now() + self.settings.restart_delay);
        }
    }

    // -----------------------------------------------------------------------
    // Errors and state
    // -----------------------------------------------------------------------

    /// Report a non-fatal error, or abort the turn for a fatal one.
    fn report(&mut self, e: TurnError) {
        if e.aborts_turn() {
            self.fail(e);
            return;
        }
        warn!(kind = e.kind(), "{}", e);
        self.emit_error(&e);
    }

    /// Abort the turn: surface the error, release everything, go `Idle`
    /// without scheduling a restart.
    fn fail(&mut self, e: TurnError) {
        if !e.aborts_turn() {
            self.report(e);
            return;
        }
        error!(turn = ?self.turn_id, kind = e.kind(), state = %self.state, "Turn aborted: {}", e);
        self.emit_error(&e);
        self.release_turn();
        self.restart_at = None;
        self.transition_with_status(TurnState::Idle, &e.to_string());
    }

    fn release_turn(&mut self) {
        self.mic_opening = None;
        if let Some(mut session) = self.session.take() {
            session.stop();
            session.clear();
        }
        self.mic = None;
        self.silence.cancel();
        self.transcription = None;
        self.opening = None;
        self.stream = None;
        self.synthesis = None;
        self.response.clear();

        if self.playing.take().is_some() {
            self.output.stop();
        }
        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!(dropped, "Discarded queued audio");
        }
        self.gap_until = None;
        if self.speaking {
            self.speaking = false;
            self.events.emit(VoiceEvent::SpeakingEnd {});
        }
        self.turn_id = None;
    }

    fn transition(&mut self, next: TurnState) {
        self.transition_with_status(next, next.status_message());
    }

    fn transition_with_status(&mut self, next: TurnState, status: &str) {
        if !self.state.can_transition_to(next) {
            error!(from = %self.state, to = %next, "Illegal turn transition");
            return;
        }
        debug!(from = %self.state, to = %next, "Turn state");
        self.state = next;
        self.events.emit(VoiceEvent::StateChange {
            state: next.to_string(),
        });
        self.emit_status(status);
    }

    fn emit_status(&self, message: &str) {
        self.events.emit(VoiceEvent::Status {
            message: message.to_string(),
        });
    }

    fn emit_error(&self, e: &TurnError) {
        self.events.emit(VoiceEvent::Error {
            kind: e.kind().to_string(),
            message: e.to_string(),
        });
    }
}

fn device_infos(names: Vec<String>) -> Vec<AudioDeviceInfo> {
    names
        .into_iter()
        .enumerate()
        .map(|(i, name)| AudioDeviceInfo { id: i as i32, name })
        .collect()
}

// ---------------------------------------------------------------------------
// select! helpers: an empty slot never resolves.
// ---------------------------------------------------------------------------

async fn next_frame(mic: &mut Option<MicStream>) -> Option<CaptureFrame> {
    match mic {
        Some(mic) => mic.frames.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_event(stream: &mut Option<EventStream>) -> Option<Result<StreamEvent, TurnError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn poll_slot<F>(slot: &mut Option<F>) -> F::Output
where
    F: Future + Unpin,
{
    match slot {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
