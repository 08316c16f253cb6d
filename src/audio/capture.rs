//! Microphone capture via cpal.
//!
//! The cpal stream is owned by a dedicated thread for its whole lifetime.
//! Each driver callback is de-interleaved into one copied block per channel
//! and sent to the controller over an unbounded channel, so blocks arrive in
//! the order the driver delivered them. Dropping the `MicStream` stops the
//! thread and releases the device.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::TurnError;

/// One driver block: `frame[channel]` holds that channel's samples.
pub type CaptureFrame = Vec<Vec<f32>>;

/// How long opening waits for the device thread to report back. Long enough
/// for a user to answer an OS permission prompt.
const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves once the device is streaming, or with the reason it is not.
pub type MicOpening = Pin<Box<dyn Future<Output = Result<MicStream, TurnError>> + Send>>;

/// Source of microphone streams. Only one stream is open at a time; the
/// controller drops the previous one before opening another.
pub trait Microphone: Send {
    /// Start acquiring the device. The returned future is awaited by the
    /// controller alongside everything else, so it must not block.
    fn open(&mut self) -> MicOpening;
}

/// A live input stream.
pub struct MicStream {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: mpsc::UnboundedReceiver<CaptureFrame>,
    _guard: Option<CaptureGuard>,
}

impl MicStream {
    /// Wrap a frame channel that has no device behind it.
    pub fn detached(
        sample_rate: u32,
        channels: u16,
        frames: mpsc::UnboundedReceiver<CaptureFrame>,
    ) -> Self {
        Self {
            sample_rate,
            channels,
            frames,
            _guard: None,
        }
    }
}

impl std::fmt::Debug for MicStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicStream")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

/// Tells the device thread to release its stream on drop. The thread is
/// woken but not joined; it exits on its own.
struct CaptureGuard {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.thread.thread().unpark();
        debug!("Capture thread signalled to stop");
    }
}

/// List available input device names.
pub fn list_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    if let Ok(devices) = host.input_devices() {
        for dev in devices {
            if let Ok(name) = dev.name() {
                names.push(name);
            }
        }
    }
    names
}

/// List available output device names.
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    if let Ok(devices) = host.output_devices() {
        for dev in devices {
            if let Ok(name) = dev.name() {
                names.push(name);
            }
        }
    }
    names
}

/// Find and configure the input device.
fn resolve_device(device_name: Option<&str>) -> Result<(cpal::Device, StreamConfig), String> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| format!("Failed to enumerate input devices: {e}"))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| format!("Input device not found: {name}"))?
    } else {
        host.default_input_device()
            .ok_or_else(|| "No default input device available".to_string())?
    };

    let dev_name = device.name().unwrap_or_else(|_| "unknown".into());
    info!(device = %dev_name, "Selected input device");

    let default_config = device
        .default_input_config()
        .map_err(|e| format!("Failed to get default input config: {e}"))?;

    let stream_config = StreamConfig {
        channels: default_config.channels(),
        sample_rate: default_config.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };

    Ok((device, stream_config))
}

/// Split an interleaved driver buffer into one owned block per channel.
pub(crate) fn deinterleave(data: &[f32], channels: u16) -> CaptureFrame {
    let ch = channels.max(1) as usize;
    let mut frame: CaptureFrame = (0..ch).map(|_| Vec::with_capacity(data.len() / ch)).collect();
    for chunk in data.chunks_exact(ch) {
        for (c, &sample) in chunk.iter().enumerate() {
            frame[c].push(sample);
        }
    }
    frame
}

/// cpal-backed microphone.
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    device_name: Option<String>,
}

impl CpalMicrophone {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl Microphone for CpalMicrophone {
    fn open(&mut self) -> MicOpening {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(u32, u16), String>>();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let device_name = self.device_name.clone();

        let spawned = std::thread::Builder::new()
            .name("voice-loop-capture".into())
            .spawn(move || {
                let (device, config) = match resolve_device(device_name.as_deref()) {
                    Ok(resolved) => resolved,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let channels = config.channels;
                let sample_rate = config.sample_rate.0;

                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                        // Receiver gone means the session ended; the guard
                        // will stop us shortly.
                        let _ = frame_tx.send(deinterleave(data, channels));
                    },
                    move |err| {
                        error!("Audio input stream error: {}", err);
                    },
                    None,
                );
                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("Failed to build input stream: {e}")));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(format!("Failed to start input stream: {e}")));
                    return;
                }

                if ready_tx.send(Ok((sample_rate, channels))).is_err() {
                    // Opening was abandoned (timeout or teardown).
                    return;
                }
                info!(sample_rate, channels, "Audio capture started");

                while !stop_for_thread.load(Ordering::SeqCst) {
                    std::thread::park_timeout(Duration::from_millis(200));
                }
                drop(stream);
                debug!("Audio capture released");
            });

        Box::pin(async move {
            let thread = spawned.map_err(|e| {
                TurnError::MicrophoneDenied(format!("Failed to spawn capture thread: {e}"))
            })?;

            match tokio::time::timeout(OPEN_TIMEOUT, ready_rx).await {
                Ok(Ok(Ok((sample_rate, channels)))) => Ok(MicStream {
                    sample_rate,
                    channels,
                    frames: frame_rx,
                    _guard: Some(CaptureGuard { stop, thread }),
                }),
                Ok(Ok(Err(msg))) => Err(TurnError::MicrophoneDenied(msg)),
                Ok(Err(_)) => Err(TurnError::MicrophoneDenied(
                    "Capture thread exited before the device started".into(),
                )),
                Err(_) => {
                    // Detach: the thread drops the stream itself once it
                    // sees the flag or fails to report readiness.
                    stop.store(true, Ordering::SeqCst);
                    thread.thread().unpark();
                    warn!(after = ?OPEN_TIMEOUT, "Input device did not start in time");
                    Err(TurnError::MicrophoneDenied(
                        "Input device did not start in time".into(),
                    ))
                }
            }
        })
    }
}
