//! Pedestrian countdown driver
//!
//! Advanced once per clock tick. While the green tracker's countdown is active
//! the remaining seconds drop by one per tick: first through a silent phase
//! (values above `count_from`), then through the speaking phase where every
//! new value is handed to the scheduler as a voice number. The countdown
//! deactivates on the tick that reaches `count_to`.

use crate::light_tracker::LightTracker;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::info;

#[derive(Debug, Clone, Default)]
pub struct CountdownDriver {
    running: Option<u32>,
    /// Tracker measurement the running value belongs to
    measurement: u32,
    silent: bool,
}

impl CountdownDriver {
    pub const fn new() -> Self {
        Self {
            running: None,
            measurement: 0,
            silent: true,
        }
    }

    /// One 1 s step. Returns the countdown value to announce, if any.
    pub fn tick(&mut self, tracker: &mut LightTracker, count_from: u8, count_to: u8) -> Option<u32> {
        if !tracker.is_countdown_active() {
            self.running = None;
            return None;
        }
        // A new measurement opened between two ticks.
        if self.measurement != tracker.measurement_count() {
            self.measurement = tracker.measurement_count();
            self.running = None;
        }

        let from = u32::from(count_from);
        let to = u32::from(count_to);
        let current = match self.running {
            Some(value) => value,
            None => {
                let start = tracker.countdown_current();
                self.silent = start > from;
                info!("[COUNTDOWN] Start {} ({}..={})", start, to, from);
                start
            }
        };

        if current <= to {
            self.finish(tracker, current);
            return None;
        }

        let next = current - 1;
        if self.silent && next <= from {
            self.silent = false;
            info!("[COUNTDOWN] Speaking phase from {}", next);
        }
        tracker.set_countdown_current(next);

        if next <= to {
            self.finish(tracker, next);
        } else {
            self.running = Some(next);
        }

        if self.silent { None } else { Some(next) }
    }

    fn finish(&mut self, tracker: &mut LightTracker, at: u32) {
        tracker.finish_countdown();
        self.running = None;
        info!("[COUNTDOWN] Done at {}", at);
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }
}

/// One-slot handoff of the latest countdown value from the tick to the scheduler.
///
/// A value not taken before the next tick is replaced; the scheduler polls far
/// more often than once per second.
pub struct VoiceHandoff(Signal<CriticalSectionRawMutex, u32>);

impl Default for VoiceHandoff {
    fn default() -> Self {
        Self::new()
    }
}

impl VoiceHandoff {
    pub const fn new() -> Self {
        Self(Signal::new())
    }

    pub fn publish(&self, count: u32) {
        self.0.signal(count);
    }

    pub fn take(&self) -> Option<u32> {
        self.0.try_take()
    }
}
