//! Ambient noise level
//!
//! The microphone ADC is read on every IO poll. A short rolling average drives
//! the per-class announcement volume; once per second the average is also
//! pushed into a small history used for status display.

use crate::ControllerError;
use crate::config::{
    ADC_AVERAGE_COUNT, ADC_FULL_SCALE, CLOCK_TICK_MS, NOISE_HISTORY_LEN, NOISE_HISTORY_SCALE,
    POLL_PERIOD_MS,
};

/// Source of averaged raw ADC readings
pub trait AmbientSensor {
    fn read_average(&mut self, samples: u32) -> Result<u32, ControllerError>;
}

const POLLS_PER_SECOND: u32 = (CLOCK_TICK_MS / POLL_PERIOD_MS) as u32;

#[derive(Debug, Clone)]
pub struct NoiseAverager {
    window: [u32; ADC_AVERAGE_COUNT],
    average: u32,
    polls: u32,
    history: [u8; NOISE_HISTORY_LEN],
}

impl Default for NoiseAverager {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseAverager {
    pub const fn new() -> Self {
        Self {
            window: [0; ADC_AVERAGE_COUNT],
            average: 0,
            polls: 0,
            history: [0; NOISE_HISTORY_LEN],
        }
    }

    /// Add one reading; returns the new rolling average.
    pub fn push(&mut self, sample: u32) -> u32 {
        self.window.rotate_left(1);
        self.window[ADC_AVERAGE_COUNT - 1] = sample;
        let sum: u64 = self.window.iter().map(|&s| u64::from(s)).sum();
        self.average = (sum / ADC_AVERAGE_COUNT as u64) as u32;

        self.polls += 1;
        if self.polls >= POLLS_PER_SECOND {
            self.polls = 0;
            self.history.rotate_left(1);
            self.history[NOISE_HISTORY_LEN - 1] = scale_for_history(self.average);
        }
        self.average
    }

    pub fn average(&self) -> u32 {
        self.average
    }

    /// Oldest first.
    pub fn history(&self) -> &[u8; NOISE_HISTORY_LEN] {
        &self.history
    }
}

/// Map a raw reading onto 0..=150, rounding to nearest.
fn scale_for_history(raw: u32) -> u8 {
    let scaled = (u64::from(raw) * u64::from(NOISE_HISTORY_SCALE) + u64::from(ADC_FULL_SCALE) / 2)
        / u64::from(ADC_FULL_SCALE);
    scaled.min(u64::from(NOISE_HISTORY_SCALE)) as u8
}
