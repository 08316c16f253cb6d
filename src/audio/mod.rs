//! Audio capture, analysis window, and WAV encoding.

pub mod analyser;
pub mod capture;
pub mod encoder;

pub use analyser::Analyser;
pub use capture::{
    list_devices, list_output_devices, CaptureFrame, CpalMicrophone, MicOpening, MicStream, Microphone,
};
pub use encoder::{AudioSession, EncodedAudioContainer, WavHeader};
