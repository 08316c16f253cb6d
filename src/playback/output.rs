//! Audio output driver: decodes a unit and plays it through rodio.
//!
//! Each unit plays on its own blocking thread that owns the rodio
//! `OutputStream` and `Sink`. Completion (or failure) is reported over a
//! oneshot channel so the controller can await it alongside everything else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::{OutputStream, OutputStreamHandle, Sink};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::decode::decode_audio;
use super::queue::AudioUnit;
use crate::error::TurnError;

/// Resolves when the unit has finished playing, or with the reason it could
/// not be played.
pub type PlaybackDone = oneshot::Receiver<Result<(), String>>;

/// Plays one unit at a time. The controller never calls `play` while a
/// previous unit's `PlaybackDone` is still pending.
pub trait AudioOutput: Send {
    fn play(&mut self, unit: AudioUnit) -> Result<PlaybackDone, TurnError>;

    /// Stop current playback immediately.
    fn stop(&mut self);
}

/// rodio-backed output on the default (or named) device.
pub struct RodioOutput {
    output_device: Option<String>,
    volume: f32,
    current_cancel: Option<Arc<AtomicBool>>,
}

impl RodioOutput {
    pub fn new(output_device: Option<String>, volume: f32) -> Self {
        Self {
            output_device,
            volume,
            current_cancel: None,
        }
    }
}

impl AudioOutput for RodioOutput {
    fn play(&mut self, unit: AudioUnit) -> Result<PlaybackDone, TurnError> {
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        self.current_cancel = Some(Arc::clone(&cancel));
        let device = self.output_device.clone();
        let volume = self.volume;

        std::thread::Builder::new()
            .name("voice-loop-playback".into())
            .spawn(move || {
                let result = play_unit(&unit, device.as_deref(), volume, &cancel);
                let _ = done_tx.send(result);
            })
            .map_err(|e| TurnError::PlaybackFailure(format!("Failed to spawn playback thread: {e}")))?;

        Ok(done_rx)
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.current_cancel.take() {
            cancel.store(true, Ordering::SeqCst);
        }
    }
}

/// Open the audio output stream for a named or default device.
fn open_output_stream(
    output_device_name: Option<&str>,
) -> Result<(OutputStream, OutputStreamHandle), String> {
    if let Some(name) = output_device_name {
        let host = cpal::default_host();
        let device = host
            .output_devices()
            .map_err(|e| format!("Failed to enumerate output devices: {}", e))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false));

        match device {
            Some(dev) => OutputStream::try_from_device(&dev)
                .map_err(|e| format!("Failed to open output device '{}': {}", name, e)),
            None => {
                warn!(
                    device = %name,
                    "Configured output device not found, falling back to default"
                );
                OutputStream::try_default()
                    .map_err(|e| format!("No audio output device available: {}", e))
            }
        }
    } else {
        OutputStream::try_default().map_err(|e| format!("No audio output device available: {}", e))
    }
}

/// Decode and play one unit, blocking until it ends or is cancelled.
fn play_unit(
    unit: &AudioUnit,
    output_device_name: Option<&str>,
    volume: f32,
    cancel: &AtomicBool,
) -> Result<(), String> {
    let audio = decode_audio(&unit.bytes)?;
    debug!(
        unit = unit.id,
        samples = audio.samples.len(),
        sample_rate = audio.sample_rate,
        channels = audio.channels,
        "Unit decoded"
    );

    let (_stream, stream_handle) = open_output_stream(output_device_name)?;
    let sink = Sink::try_new(&stream_handle)
        .map_err(|e| format!("Failed to create audio sink: {}", e))?;
    sink.set_volume(volume.clamp(0.0, 2.0));
    sink.append(rodio::buffer::SamplesBuffer::new(
        audio.channels,
        audio.sample_rate,
        audio.samples,
    ));

    while !sink.empty() {
        if cancel.load(Ordering::SeqCst) {
            info!(unit = unit.id, "Playback cancelled");
            sink.stop();
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    sink.sleep_until_end();

    Ok(())
}
