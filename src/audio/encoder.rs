//! Capture encoder: per-channel sample accumulation and WAV export.
//!
//! Frames arrive from the capture driver in delivery order. Each frame is
//! copied before it is stored, so a driver that reuses its buffers cannot
//! alias into the session.

use std::time::Instant;

use uuid::Uuid;

/// Size of the canonical PCM WAV header.
pub const WAV_HEADER_LEN: usize = 44;

const BITS_PER_SAMPLE: u16 = 16;
const BYTES_PER_SAMPLE: u16 = BITS_PER_SAMPLE / 8;
const PCM_FORMAT: u16 = 1;

/// One capture cycle's raw audio.
#[derive(Debug)]
pub struct AudioSession {
    id: Uuid,
    sample_rate: u32,
    channels: u16,
    started_at: Instant,
    recording: bool,
    /// `buffers[channel]` is the ordered list of copied blocks for that channel.
    buffers: Vec<Vec<Vec<f32>>>,
}

impl AudioSession {
    pub fn new(sample_rate: u32, channels: u16, started_at: Instant) -> Self {
        let channels = channels.max(1);
        Self {
            id: Uuid::new_v4(),
            sample_rate,
            channels,
            started_at,
            recording: false,
            buffers: vec![Vec::new(); channels as usize],
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Start accepting frames.
    pub fn record(&mut self) {
        self.recording = true;
    }

    /// Stop accepting frames. Buffered audio is kept for `export`.
    pub fn stop(&mut self) {
        self.recording = false;
    }

    /// Discard everything buffered so far.
    pub fn clear(&mut self) {
        for channel in &mut self.buffers {
            channel.clear();
        }
    }

    /// Append one frame (one block per input channel).
    ///
    /// Returns `false` if the session is not recording and the frame was
    /// dropped. A frame with fewer channels than the session duplicates its
    /// first channel into the missing ones.
    pub fn push_frame<S: AsRef<[f32]>>(&mut self, frame: &[S]) -> bool {
        if !self.recording {
            return false;
        }
        let Some(first) = frame.first() else {
            return false;
        };
        for (ch, channel) in self.buffers.iter_mut().enumerate() {
            let block = frame.get(ch).unwrap_or(first);
            channel.push(block.as_ref().to_vec());
        }
        true
    }

    /// Number of blocks appended to the first channel.
    pub fn frame_count(&self) -> usize {
        self.buffers.first().map_or(0, Vec::len)
    }

    /// Total samples per channel.
    pub fn samples_per_channel(&self) -> usize {
        self.buffers
            .first()
            .map_or(0, |blocks| blocks.iter().map(Vec::len).sum())
    }

    /// Build a WAV container from everything accumulated since the last
    /// `clear`.
    pub fn export(&self) -> EncodedAudioContainer {
        let merged: Vec<Vec<f32>> = self.buffers.iter().map(|b| merge_blocks(b)).collect();
        let samples = interleave(&merged);
        EncodedAudioContainer::encode(&samples, self.sample_rate, self.channels)
    }
}

fn merge_blocks(blocks: &[Vec<f32>]) -> Vec<f32> {
    let len = blocks.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(len);
    for block in blocks {
        out.extend_from_slice(block);
    }
    out
}

fn interleave(channels: &[Vec<f32>]) -> Vec<f32> {
    match channels {
        [] => Vec::new(),
        [mono] => mono.clone(),
        _ => {
            let len = channels[0].len();
            let mut out = Vec::with_capacity(len * channels.len());
            for i in 0..len {
                for channel in channels {
                    out.push(channel.get(i).copied().unwrap_or(0.0));
                }
            }
            out
        }
    }
}

/// Convert one float sample to 16-bit PCM.
///
/// Clamped to [-1, 1], then scaled by 32767 on the positive side and 32768
/// on the negative side, rounding to nearest.
pub fn sample_to_i16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

/// Immutable 16-bit PCM WAV bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAudioContainer {
    bytes: Vec<u8>,
}

impl EncodedAudioContainer {
    /// Encode interleaved samples as a canonical 44-byte-header WAV file.
    pub fn encode(interleaved: &[f32], sample_rate: u32, channels: u16) -> Self {
        let data_size = (interleaved.len() * BYTES_PER_SAMPLE as usize) as u32;
        let mut buf = Vec::with_capacity(WAV_HEADER_LEN + data_size as usize);

        // RIFF header
        buf.extend_from_slice(b"RIFF");
        buf.extend_from_slice(&(36 + data_size).to_le_bytes());
        buf.extend_from_slice(b"WAVE");

        // fmt sub-chunk
        buf.extend_from_slice(b"fmt ");
        buf.extend_from_slice(&16u32.to_le_bytes());
        buf.extend_from_slice(&PCM_FORMAT.to_le_bytes());
        buf.extend_from_slice(&channels.to_le_bytes());
        buf.extend_from_slice(&sample_rate.to_le_bytes());
        let byte_rate = sample_rate * channels as u32 * BYTES_PER_SAMPLE as u32;
        buf.extend_from_slice(&byte_rate.to_le_bytes());
        let block_align = channels * BYTES_PER_SAMPLE;
        buf.extend_from_slice(&block_align.to_le_bytes());
        buf.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

        // data sub-chunk
        buf.extend_from_slice(b"data");
        buf.extend_from_slice(&data_size.to_le_bytes());
        for &sample in interleaved {
            buf.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
        }

        Self { bytes: buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Payload bytes after the header.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[WAV_HEADER_LEN.min(self.bytes.len())..]
    }
}

/// Format fields recovered from a WAV header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub data_len: u32,
}

impl WavHeader {
    /// Parse the fixed 44-byte header written by `EncodedAudioContainer`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < WAV_HEADER_LEN
            || &bytes[0..4] != b"RIFF"
            || &bytes[8..12] != b"WAVE"
            || &bytes[12..16] != b"fmt "
            || &bytes[36..40] != b"data"
        {
            return None;
        }
        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let u32_at =
            |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        if u16_at(20) != PCM_FORMAT {
            return None;
        }
        Some(Self {
            channels: u16_at(22),
            sample_rate: u32_at(24),
            bits_per_sample: u16_at(34),
            data_len: u32_at(40),
        })
    }
}
