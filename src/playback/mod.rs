//! Streaming playback: ordered queue, decoding, and the output driver.

pub mod decode;
pub mod output;
pub mod queue;

pub use output::{AudioOutput, PlaybackDone, RodioOutput};
pub use queue::{AudioUnit, PlaybackQueue};
