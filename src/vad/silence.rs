//! Debounced silence trigger for push-to-talk capture.
//!
//! Each observation computes the RMS of the analyser window. After the
//! startup grace period, a sub-threshold sample arms a stop deadline if none
//! is pending; any sample at or above threshold disarms it. The deadline
//! fires at most once per session.

use std::time::{Duration, Instant};

use super::energy;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilenceConfig {
    /// Normalized RMS below which input counts as silent.
    pub threshold: f32,
    /// Window after capture start during which silence is ignored.
    pub grace: Duration,
    /// How long silence must last before stop fires.
    pub duration: Duration,
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            grace: Duration::from_millis(1000),
            duration: Duration::from_millis(2500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceSignal {
    Continue,
    Stop,
}

#[derive(Debug, Clone)]
pub struct SilenceDetector {
    config: SilenceConfig,
    enabled: bool,
    started_at: Instant,
    deadline: Option<Instant>,
    last_rms: f32,
    fired: bool,
}

impl SilenceDetector {
    pub fn new(config: SilenceConfig, started_at: Instant) -> Self {
        Self {
            config,
            enabled: true,
            started_at,
            deadline: None,
            last_rms: 0.0,
            fired: false,
        }
    }

    /// Re-arm for a new capture session.
    pub fn reset(&mut self, started_at: Instant) {
        self.started_at = started_at;
        self.deadline = None;
        self.last_rms = 0.0;
        self.fired = false;
    }

    /// Disabling also drops any pending deadline.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.deadline = None;
        }
    }

    /// Drop the pending deadline without firing.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Pending stop deadline, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn last_rms(&self) -> f32 {
        self.last_rms
    }

    #[cfg(test)]
    fn has_fired(&self) -> bool {
        self.fired
    }

    /// Fire the pending deadline if it has passed.
    pub fn poll(&mut self, now: Instant) -> SilenceSignal {
        match self.deadline {
            Some(deadline) if !self.fired && now >= deadline => {
                self.deadline = None;
                self.fired = true;
                SilenceSignal::Stop
            }
            _ => SilenceSignal::Continue,
        }
    }

    /// Feed one analyser snapshot taken at `now`.
    pub fn observe(&mut self, samples: &[f32], now: Instant) -> SilenceSignal {
        if self.fired {
            return SilenceSignal::Continue;
        }
        // A deadline that expired between ticks fires before the new sample
        // gets a chance to cancel it.
        if self.poll(now) == SilenceSignal::Stop {
            return SilenceSignal::Stop;
        }

        self.last_rms = energy::rms(samples);

        if now.saturating_duration_since(self.started_at) < self.config.grace || !self.enabled {
            return SilenceSignal::Continue;
        }

        if self.last_rms < self.config.threshold {
            if self.deadline.is_none() {
                self.deadline = Some(now + self.config.duration);
            }
        } else {
            self.deadline = None;
        }
        SilenceSignal::Continue
    }
}
