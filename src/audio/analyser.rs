//! Time-domain analyser: a sliding window over the most recent input.
//!
//! Holds the last `window` mono samples so the silence detector can sample
//! the live amplitude envelope on every tick, independent of how the driver
//! sizes its blocks.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct Analyser {
    window: usize,
    samples: VecDeque<f32>,
}

impl Analyser {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }

    /// Feed one frame (one block per channel). Channels are averaged to mono.
    pub fn feed<S: AsRef<[f32]>>(&mut self, frame: &[S]) {
        let Some(first) = frame.first() else {
            return;
        };
        let len = first.as_ref().len();
        let ch = frame.len() as f32;
        for i in 0..len {
            let sum: f32 = frame
                .iter()
                .map(|block| block.as_ref().get(i).copied().unwrap_or(0.0))
                .sum();
            self.push(sum / ch);
        }
    }

    fn push(&mut self, sample: f32) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Copy of the current window, oldest sample first.
    pub fn snapshot(&self) -> Vec<f32> {
        self.samples.iter().copied().collect()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}
