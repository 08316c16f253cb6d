use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use futures_util::stream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::*;
use crate::audio::EncodedAudioContainer;
use crate::conversation::{Role, Turn};
use crate::playback::AudioUnit;

const RATE: u32 = 16_000;
const BLOCK: usize = 1024;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

fn tone_block() -> Vec<f32> {
    (0..BLOCK)
        .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
        .collect()
}

/// Half a second of speech followed by half a second of silence.
fn speech_then_silence() -> Vec<CaptureFrame> {
    let mut frames = Vec::new();
    for _ in 0..8 {
        frames.push(vec![tone_block()]);
    }
    for _ in 0..8 {
        frames.push(vec![vec![0.0; BLOCK]]);
    }
    frames
}

struct FakeMicrophone {
    frames: Vec<CaptureFrame>,
    deny: bool,
    open_delay: Duration,
    opens: Arc<AtomicUsize>,
    // Senders stay alive so the stream only ends when the controller drops it.
    live: Vec<mpsc::UnboundedSender<CaptureFrame>>,
}

impl FakeMicrophone {
    fn new(frames: Vec<CaptureFrame>) -> Self {
        Self {
            frames,
            deny: false,
            open_delay: Duration::ZERO,
            opens: Arc::new(AtomicUsize::new(0)),
            live: Vec::new(),
        }
    }

    fn denied() -> Self {
        Self {
            deny: true,
            ..Self::new(Vec::new())
        }
    }
}

impl Microphone for FakeMicrophone {
    fn open(&mut self) -> MicOpening {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay = self.open_delay;
        if self.deny {
            return Box::pin(async move {
                tokio::time::sleep(delay).await;
                Err(TurnError::MicrophoneDenied("permission refused".into()))
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for frame in &self.frames {
            let _ = tx.send(frame.clone());
        }
        self.live.push(tx);
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(MicStream::detached(RATE, 1, rx))
        })
    }
}

#[derive(Clone)]
struct FakeBackend {
    transcript: Result<String, TurnError>,
    events: Vec<StreamEvent>,
    speech: Vec<u8>,
    uploads: Arc<Mutex<Vec<usize>>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl FakeBackend {
    fn new(transcript: &str, events: Vec<StreamEvent>) -> Self {
        Self {
            transcript: Ok(transcript.to_string()),
            events,
            speech: b"speech".to_vec(),
            uploads: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl VoiceBackend for FakeBackend {
    fn transcribe(&self, audio: EncodedAudioContainer) -> BackendFuture<String> {
        self.uploads.lock().unwrap().push(audio.len());
        let result = self.transcript.clone();
        Box::pin(async move { result })
    }

    fn chat_and_speak(&self, request: ChatRequest) -> BackendFuture<EventStream> {
        self.requests.lock().unwrap().push(request);
        let events = self.events.clone();
        Box::pin(async move {
            let stream: EventStream = Box::pin(stream::iter(events.into_iter().map(Ok)));
            Ok(stream)
        })
    }

    fn speak(&self, _text: String) -> BackendFuture<Vec<u8>> {
        let bytes = self.speech.clone();
        Box::pin(async move { Ok(bytes) })
    }
}

#[derive(Debug, Clone)]
struct Played {
    bytes: Vec<u8>,
    started: Instant,
    ended: Instant,
}

/// Plays every unit for a fixed duration. `reject` is refused up front and
/// `corrupt` fails once it has "played".
struct FakeOutput {
    duration: Duration,
    log: Arc<Mutex<Vec<Played>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

impl FakeOutput {
    fn new(duration: Duration) -> Self {
        Self {
            duration,
            log: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            stops: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl AudioOutput for FakeOutput {
    fn play(&mut self, unit: AudioUnit) -> Result<PlaybackDone, TurnError> {
        if unit.bytes == b"reject" {
            return Err(TurnError::PlaybackFailure("unsupported format".into()));
        }
        let (tx, rx) = oneshot::channel();
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let duration = self.duration;
        let log = Arc::clone(&self.log);
        let active = Arc::clone(&self.active);
        let started = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            active.fetch_sub(1, Ordering::SeqCst);
            log.lock().unwrap().push(Played {
                bytes: unit.bytes.clone(),
                started,
                ended: Instant::now(),
            });
            let result = if unit.bytes == b"corrupt" {
                Err("decode failed".to_string())
            } else {
                Ok(())
            };
            let _ = tx.send(result);
        });
        Ok(rx)
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

struct ChannelSink(mpsc::UnboundedSender<(Instant, VoiceEvent)>);

impl EventSink for ChannelSink {
    fn emit(&self, event: VoiceEvent) {
        let _ = self.0.send((Instant::now(), event));
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    commands: mpsc::UnboundedSender<VoiceCommand>,
    events: mpsc::UnboundedReceiver<(Instant, VoiceEvent)>,
    seen: Vec<VoiceEvent>,
    task: JoinHandle<TurnController>,
}

impl Harness {
    fn spawn(
        settings: ControllerSettings,
        backend: FakeBackend,
        microphone: FakeMicrophone,
        output: FakeOutput,
    ) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let mut controller = TurnController::new(
            settings,
            Arc::new(backend),
            Box::new(microphone),
            Box::new(output),
            Arc::new(ChannelSink(event_tx)),
        );
        let task = tokio::spawn(async move {
            controller.run(command_rx).await;
            controller
        });
        Self {
            commands,
            events,
            seen: Vec::new(),
            task,
        }
    }

    fn send(&self, command: VoiceCommand) {
        self.commands.send(command).unwrap();
    }

    async fn wait_for(&mut self, pred: impl Fn(&VoiceEvent) -> bool) -> (Instant, VoiceEvent) {
        loop {
            let (at, event) = tokio::time::timeout(Duration::from_secs(120), self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            self.seen.push(event.clone());
            if pred(&event) {
                return (at, event);
            }
        }
    }

    async fn wait_for_state(&mut self, state: &str) -> Instant {
        self.wait_for(|e| matches!(e, VoiceEvent::StateChange { state: s } if s == state))
            .await
            .0
    }

    async fn shutdown(self) -> (TurnController, Vec<VoiceEvent>) {
        let Harness {
            commands,
            mut events,
            mut seen,
            task,
        } = self;
        commands.send(VoiceCommand::Stop {}).unwrap();
        let controller = task.await.unwrap();
        while let Ok((_, event)) = events.try_recv() {
            seen.push(event);
        }
        (controller, seen)
    }
}

fn manual_settings() -> ControllerSettings {
    ControllerSettings {
        auto_restart: false,
        ..ControllerSettings::default()
    }
}

fn audio(bytes: &[u8]) -> StreamEvent {
    StreamEvent::Audio(base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn error_kind(event: &VoiceEvent) -> Option<&str> {
    match event {
        VoiceEvent::Error { kind, .. } => Some(kind.as_str()),
        _ => None,
    }
}

fn user(content: &str) -> Turn {
    Turn {
        role: Role::User,
        content: content.into(),
    }
}

fn assistant(content: &str) -> Turn {
    Turn {
        role: Role::Assistant,
        content: content.into(),
    }
}

// ---------------------------------------------------------------------------
// Turns
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_full_turn_appends_user_then_assistant() {
    let backend = FakeBackend::new(
        "Bonjour",
        vec![
            StreamEvent::Text("Bon".into()),
            audio(b"one"),
            StreamEvent::Text("jour".into()),
            StreamEvent::Done,
        ],
    );
    let requests = Arc::clone(&backend.requests);
    let uploads = Arc::clone(&backend.uploads);
    let output = FakeOutput::new(Duration::from_millis(300));
    let log = Arc::clone(&output.log);

    let mut h = Harness::spawn(
        manual_settings(),
        backend,
        FakeMicrophone::new(speech_then_silence()),
        output,
    );
    h.send(VoiceCommand::StartRecording {});
    h.wait_for(|e| matches!(e, VoiceEvent::SpeakingEnd {})).await;
    h.wait_for_state("idle").await;
    let (controller, seen) = h.shutdown().await;

    // The request already carried the user turn.
    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].text, "Bonjour");
    assert_eq!(requests[0].history, vec![user("Bonjour")]);

    assert_eq!(
        controller.history().turns(),
        &[user("Bonjour"), assistant("Bonjour")]
    );
    assert_eq!(controller.state(), TurnState::Idle);

    let uploads = uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0] > 100);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].bytes, b"one");

    let states: Vec<&str> = seen
        .iter()
        .filter_map(|e| match e {
            VoiceEvent::StateChange { state } => Some(state.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            "capturing",
            "encoding",
            "awaiting_transcript",
            "streaming",
            "draining",
            "idle"
        ]
    );
    assert!(seen.contains(&VoiceEvent::RecordingStop {
        reason: "silence".into()
    }));
    assert!(seen.contains(&VoiceEvent::Response {
        text: "Bonjour".into()
    }));
}

#[tokio::test(start_paused = true)]
async fn test_silence_stops_capture_after_grace_and_duration() {
    let backend = FakeBackend::new("Salut", vec![StreamEvent::Done]);
    let mut h = Harness::spawn(
        manual_settings(),
        backend,
        FakeMicrophone::new(speech_then_silence()),
        FakeOutput::new(Duration::from_millis(10)),
    );
    h.send(VoiceCommand::StartRecording {});
    let started = h.wait_for_state("capturing").await;
    let stopped = h
        .wait_for(|e| matches!(e, VoiceEvent::RecordingStop { .. }))
        .await
        .0;

    // Silent from the first tick: arms at the end of the grace period, fires
    // one silence duration later.
    let elapsed = stopped.duration_since(started);
    assert!(elapsed >= Duration::from_millis(3500), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3600), "{:?}", elapsed);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_stop_with_detection_disabled() {
    let backend = FakeBackend::new("Salut", vec![StreamEvent::Text("Oui".into()), StreamEvent::Done]);
    let mut h = Harness::spawn(
        manual_settings(),
        backend,
        FakeMicrophone::new(speech_then_silence()),
        FakeOutput::new(Duration::from_millis(10)),
    );
    h.send(VoiceCommand::SetSilenceDetection { enabled: false });
    h.send(VoiceCommand::StartRecording {});
    h.wait_for_state("capturing").await;

    // Well past where silence would have fired.
    tokio::time::sleep(Duration::from_secs(10)).await;
    h.send(VoiceCommand::StopRecording {});
    h.wait_for(|e| matches!(e, VoiceEvent::RecordingStop { reason } if reason == "manual"))
        .await;
    h.wait_for_state("idle").await;

    let (controller, seen) = h.shutdown().await;
    assert!(!seen
        .iter()
        .any(|e| matches!(e, VoiceEvent::RecordingStop { reason } if reason == "silence")));
    assert_eq!(controller.history().last(), Some(&assistant("Oui")));
}

#[tokio::test(start_paused = true)]
async fn test_stream_without_done_still_completes() {
    let backend = FakeBackend::new("Salut", vec![StreamEvent::Text("Salut !".into())]);
    let mut h = Harness::spawn(
        manual_settings(),
        backend,
        FakeMicrophone::new(speech_then_silence()),
        FakeOutput::new(Duration::from_millis(10)),
    );
    h.send(VoiceCommand::StartRecording {});
    h.wait_for_state("streaming").await;
    h.wait_for_state("idle").await;

    let (controller, seen) = h.shutdown().await;
    assert_eq!(controller.history().last(), Some(&assistant("Salut !")));
    // Nothing queued, so the turn never drains.
    assert!(!seen
        .iter()
        .any(|e| matches!(e, VoiceEvent::StateChange { state } if state == "draining")));
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_microphone_denied_stays_idle() {
    let backend = FakeBackend::new("unused", Vec::new());
    let uploads = Arc::clone(&backend.uploads);
    let mic = FakeMicrophone::denied();
    let opens = Arc::clone(&mic.opens);

    let mut h = Harness::spawn(
        ControllerSettings::default(),
        backend,
        mic,
        FakeOutput::new(Duration::from_millis(10)),
    );
    h.send(VoiceCommand::StartRecording {});
    let (_, event) = h.wait_for(|e| error_kind(e).is_some()).await;
    assert_eq!(error_kind(&event), Some("MicrophoneDenied"));

    // Auto-restart is on, but errors never schedule one.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let (controller, seen) = h.shutdown().await;

    assert_eq!(controller.state(), TurnState::Idle);
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert!(!seen
        .iter()
        .any(|e| matches!(e, VoiceEvent::RecordingStart { .. })));
    assert!(uploads.lock().unwrap().is_empty());
    assert!(controller.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_empty_capture_is_too_short() {
    let backend = FakeBackend::new("unused", Vec::new());
    let uploads = Arc::clone(&backend.uploads);
    let mut h = Harness::spawn(
        manual_settings(),
        backend,
        FakeMicrophone::new(Vec::new()),
        FakeOutput::new(Duration::from_millis(10)),
    );
    h.send(VoiceCommand::StartRecording {});
    let (_, event) = h.wait_for(|e| error_kind(e).is_some()).await;
    assert_eq!(error_kind(&event), Some("CaptureTooShort"));

    let (controller, _) = h.shutdown().await;
    assert_eq!(controller.state(), TurnState::Idle);
    assert!(uploads.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transcription_failure_aborts_before_streaming() {
    let mut backend = FakeBackend::new("unused", Vec::new());
    backend.transcript = Err(TurnError::TranscriptionFailed("No speech recognized".into()));
    let requests = Arc::clone(&backend.requests);
    let mut h = Harness::spawn(
        manual_settings(),
        backend,
        FakeMicrophone::new(speech_then_silence()),
        FakeOutput::new(Duration::from_millis(10)),
    );
    h.send(VoiceCommand::StartRecording {});
    let (_, event) = h.wait_for(|e| error_kind(e).is_some()).await;
    assert_eq!(error_kind(&event), Some("TranscriptionFailed"));
    h.wait_for(|e| matches!(e, VoiceEvent::Status { message } if message.contains("No speech recognized")))
        .await;

    let (controller, _) = h.shutdown().await;
    assert!(requests.lock().unwrap().is_empty());
    assert!(controller.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transcription_timeout_aborts_without_restart() {
    let mut backend = FakeBackend::new("unused", Vec::new());
    backend.transcript = Err(TurnError::NetworkTimeout {
        operation: "transcription",
        after: Duration::from_secs(30),
    });
    let requests = Arc::clone(&backend.requests);
    let mic = FakeMicrophone::new(speech_then_silence());
    let opens = Arc::clone(&mic.opens);
    let mut h = Harness::spawn(
        ControllerSettings::default(),
        backend,
        mic,
        FakeOutput::new(Duration::from_millis(10)),
    );
    h.send(VoiceCommand::StartRecording {});
    let (_, event) = h.wait_for(|e| error_kind(e).is_some()).await;
    assert_eq!(error_kind(&event), Some("NetworkTimeout"));
    h.wait_for_state("idle").await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    let (controller, _) = h.shutdown().await;
    assert_eq!(controller.state(), TurnState::Idle);
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert!(requests.lock().unwrap().is_empty());
    assert!(controller.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stream_error_aborts_without_restart() {
    let backend = FakeBackend::new(
        "Bonjour",
        vec![
            StreamEvent::Text("partial".into()),
            StreamEvent::Error("model overloaded".into()),
            StreamEvent::Text("never seen".into()),
        ],
    );
    let mic = FakeMicrophone::new(speech_then_silence());
    let opens = Arc::clone(&mic.opens);
    let mut h = Harness::spawn(
        ControllerSettings::default(),
        backend,
        mic,
        FakeOutput::new(Duration::from_millis(10)),
    );
    h.send(VoiceCommand::StartRecording {});
    let (_, event) = h.wait_for(|e| error_kind(e).is_some()).await;
    assert_eq!(error_kind(&event), Some("StreamError"));
    h.wait_for_state("idle").await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    let (controller, seen) = h.shutdown().await;
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert_eq!(controller.history().turns(), &[user("Bonjour")]);
    assert!(!seen
        .iter()
        .any(|e| matches!(e, VoiceEvent::ResponseDelta { text } if text == "never seen")));
}

#[tokio::test(start_paused = true)]
async fn test_start_while_busy_is_rejected() {
    let backend = FakeBackend::new("Bonjour", vec![StreamEvent::Done]);
    let mic = FakeMicrophone::new(speech_then_silence());
    let opens = Arc::clone(&mic.opens);
    let mut h = Harness::spawn(
        manual_settings(),
        backend,
        mic,
        FakeOutput::new(Duration::from_millis(10)),
    );
    h.send(VoiceCommand::StartRecording {});
    h.wait_for_state("capturing").await;
    h.send(VoiceCommand::StartRecording {});
    let (_, event) = h.wait_for(|e| error_kind(e).is_some()).await;
    assert_eq!(error_kind(&event), Some("Busy"));

    // The running turn is unaffected.
    h.wait_for_state("idle").await;
    let (controller, _) = h.shutdown().await;
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert_eq!(controller.history().len(), 2);
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_units_play_in_order_one_at_a_time() {
    let backend = FakeBackend::new(
        "Raconte",
        vec![
            audio(b"a"),
            StreamEvent::Text("Il était ".into()),
            audio(b"b"),
            StreamEvent::Text("une fois".into()),
            audio(b"c"),
            StreamEvent::Done,
        ],
    );
    let output = FakeOutput::new(Duration::from_millis(200));
    let log = Arc::clone(&output.log);
    let max_active = Arc::clone(&output.max_active);
    let mut h = Harness::spawn(
        manual_settings(),
        backend,
        FakeMicrophone::new(speech_then_silence()),
        output,
    );
    h.send(VoiceCommand::StartRecording {});
    h.wait_for(|e| matches!(e, VoiceEvent::SpeakingEnd {})).await;
    let (controller, _) = h.shutdown().await;

    let log = log.lock().unwrap();
    let order: Vec<&[u8]> = log.iter().map(|p| p.bytes.as_slice()).collect();
    assert_eq!(order, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    for pair in log.windows(2) {
        assert!(pair[1].started >= pair[0].ended + Duration::from_millis(50));
    }
    assert_eq!(
        controller.history().last(),
        Some(&assistant("Il était une fois"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_units_are_skipped() {
    let backend = FakeBackend::new(
        "Bonjour",
        vec![
            audio(b"reject"),
            audio(b"corrupt"),
            audio(b"good"),
            StreamEvent::Text("Bonjour".into()),
            StreamEvent::Done,
        ],
    );
    let output = FakeOutput::new(Duration::from_millis(100));
    let log = Arc::clone(&output.log);
    let mut h = Harness::spawn(
        manual_settings(),
        backend,
        FakeMicrophone::new(speech_then_silence()),
        output,
    );
    h.send(VoiceCommand::StartRecording {});
    h.wait_for(|e| matches!(e, VoiceEvent::SpeakingEnd {})).await;
    h.wait_for_state("idle").await;
    let (controller, seen) = h.shutdown().await;

    let failures = seen
        .iter()
        .filter(|e| error_kind(e) == Some("PlaybackFailure"))
        .count();
    assert_eq!(failures, 2);
    let played: Vec<Vec<u8>> = log.lock().unwrap().iter().map(|p| p.bytes.clone()).collect();
    assert_eq!(played, vec![b"corrupt".to_vec(), b"good".to_vec()]);
    assert_eq!(controller.history().last(), Some(&assistant("Bonjour")));
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_playback_releases_output() {
    let backend = FakeBackend::new("Bonjour", vec![audio(b"long"), audio(b"longer"), StreamEvent::Done]);
    let output = FakeOutput::new(Duration::from_secs(30));
    let stops = Arc::clone(&output.stops);
    let mut h = Harness::spawn(
        manual_settings(),
        backend,
        FakeMicrophone::new(speech_then_silence()),
        output,
    );
    h.send(VoiceCommand::StartRecording {});
    h.wait_for(|e| matches!(e, VoiceEvent::SpeakingStart {})).await;
    h.wait_for_state("draining").await;

    let (controller, seen) = h.shutdown().await;
    assert_eq!(controller.state(), TurnState::Idle);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert!(seen.contains(&VoiceEvent::SpeakingEnd {}));
}

// ---------------------------------------------------------------------------
// Restart and system speech
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_auto_restart_begins_capture_within_delay() {
    let backend = FakeBackend::new("Bonjour", vec![audio(b"one"), StreamEvent::Done]);
    let mic = FakeMicrophone::new(speech_then_silence());
    let opens = Arc::clone(&mic.opens);
    let settings = ControllerSettings::default();
    let delay = settings.restart_delay;
    let mut h = Harness::spawn(settings, backend, mic, FakeOutput::new(Duration::from_millis(100)));

    h.send(VoiceCommand::StartRecording {});
    h.wait_for(|e| matches!(e, VoiceEvent::RecordingStart { .. })).await;
    let idle_at = h.wait_for_state("idle").await;
    let (restart_at, _) = h
        .wait_for(|e| matches!(e, VoiceEvent::RecordingStart { .. }))
        .await;

    let waited = restart_at.duration_since(idle_at);
    assert!(waited >= delay && waited < delay + Duration::from_millis(100), "{:?}", waited);

    let (controller, _) = h.shutdown().await;
    assert_eq!(opens.load(Ordering::SeqCst), 2);
    assert_eq!(controller.state(), TurnState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_disabling_auto_restart_cancels_pending_restart() {
    let backend = FakeBackend::new("Bonjour", vec![StreamEvent::Done]);
    let mic = FakeMicrophone::new(speech_then_silence());
    let opens = Arc::clone(&mic.opens);
    let mut h = Harness::spawn(
        ControllerSettings::default(),
        backend,
        mic,
        FakeOutput::new(Duration::from_millis(10)),
    );
    h.send(VoiceCommand::StartRecording {});
    h.wait_for_state("idle").await;
    h.send(VoiceCommand::SetAutoRestart { enabled: false });

    tokio::time::sleep(Duration::from_secs(5)).await;
    let (controller, _) = h.shutdown().await;
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert!(!controller.auto_restart());
}

#[tokio::test(start_paused = true)]
async fn test_system_speak_plays_without_touching_history() {
    let backend = FakeBackend::new("unused", Vec::new());
    let mic = FakeMicrophone::new(speech_then_silence());
    let opens = Arc::clone(&mic.opens);
    let output = FakeOutput::new(Duration::from_millis(100));
    let log = Arc::clone(&output.log);
    let mut h = Harness::spawn(ControllerSettings::default(), backend, mic, output);

    h.send(VoiceCommand::SystemSpeak {
        text: "Bienvenue".into(),
    });
    h.wait_for(|e| matches!(e, VoiceEvent::SpeakingEnd {})).await;
    h.wait_for_state("idle").await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    let (controller, _) = h.shutdown().await;
    assert!(controller.history().is_empty());
    assert_eq!(opens.load(Ordering::SeqCst), 0);
    assert_eq!(log.lock().unwrap()[0].bytes, b"speech");
}

#[tokio::test(start_paused = true)]
async fn test_ping_pong() {
    let mut h = Harness::spawn(
        manual_settings(),
        FakeBackend::new("unused", Vec::new()),
        FakeMicrophone::new(Vec::new()),
        FakeOutput::new(Duration::from_millis(10)),
    );
    h.send(VoiceCommand::Ping {});
    h.wait_for(|e| matches!(e, VoiceEvent::Pong {})).await;
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_commands_are_served_while_microphone_opens() {
    let mut mic = FakeMicrophone::new(speech_then_silence());
    mic.open_delay = Duration::from_secs(3);
    let opens = Arc::clone(&mic.opens);
    let mut h = Harness::spawn(
        manual_settings(),
        FakeBackend::new("Bonjour", vec![StreamEvent::Done]),
        mic,
        FakeOutput::new(Duration::from_millis(10)),
    );
    let sent_at = Instant::now();
    h.send(VoiceCommand::StartRecording {});
    h.send(VoiceCommand::Ping {});
    h.send(VoiceCommand::StartRecording {});

    let (pong_at, _) = h.wait_for(|e| matches!(e, VoiceEvent::Pong {})).await;
    assert!(pong_at.duration_since(sent_at) < Duration::from_millis(100));

    let (_, event) = h.wait_for(|e| error_kind(e).is_some()).await;
    assert_eq!(error_kind(&event), Some("Busy"));

    let capturing_at = h.wait_for_state("capturing").await;
    assert!(capturing_at.duration_since(sent_at) >= Duration::from_secs(3));

    h.wait_for_state("idle").await;
    h.shutdown().await;
    assert_eq!(opens.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_release_before_microphone_opens_cancels_capture() {
    let mut mic = FakeMicrophone::new(speech_then_silence());
    mic.open_delay = Duration::from_secs(3);
    let mut h = Harness::spawn(
        manual_settings(),
        FakeBackend::new("Bonjour", vec![StreamEvent::Done]),
        mic,
        FakeOutput::new(Duration::from_millis(10)),
    );
    h.send(VoiceCommand::StartRecording {});
    h.send(VoiceCommand::StopRecording {});
    h.send(VoiceCommand::Ping {});
    h.wait_for(|e| matches!(e, VoiceEvent::Pong {})).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    let (controller, seen) = h.shutdown().await;
    assert_eq!(controller.state(), TurnState::Idle);
    assert!(!seen
        .iter()
        .any(|e| matches!(e, VoiceEvent::RecordingStart { .. })));
}
