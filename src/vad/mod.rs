//! Silence detection for auto-stopping capture.

pub mod energy;
pub mod silence;

pub use silence::{SilenceConfig, SilenceDetector, SilenceSignal};
