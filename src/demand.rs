//! Pedestrian demand button monitoring
//!
//! [`DemandMonitor`] debounces the demand feedback line and watches for a line
//! that sits at one level for too long. [`DemandLatch`] holds the
//! `isDemandActive` request until green answers it.

use crate::debounce::DebouncedInput;
use log::{info, warn};

/// Alarm text raised for a stuck demand line
pub const STUCK_ALARM_MESSAGE: &str = "Pedestrian feedback stuck for too long";

/// Level at which the line was found stuck
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckLevel {
    Low,
    High,
}

/// Outcome of one monitor poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DemandUpdate {
    pub confirmed: bool,
    /// Confirmed LOW to HIGH this poll; re-arms one-shot request audio
    pub rearm: bool,
    pub stuck: Option<StuckLevel>,
}

#[derive(Debug, Clone)]
pub struct DemandMonitor {
    input: DebouncedInput,
    confirmed: bool,
    initialized: bool,
    state_start_ms: u64,
    low_threshold_ms: u64,
    high_threshold_ms: u64,
}

impl DemandMonitor {
    pub const fn new(low_threshold_ms: u64, high_threshold_ms: u64) -> Self {
        Self {
            input: DebouncedInput::new(),
            confirmed: false,
            initialized: false,
            state_start_ms: 0,
            low_threshold_ms,
            high_threshold_ms,
        }
    }

    pub fn update(&mut self, raw: bool, now_ms: u64) -> DemandUpdate {
        self.input.update(raw);
        let next = self.input.confirmed();

        // Cold boot: take whatever the line shows, no alarm bookkeeping yet.
        if !self.initialized {
            self.initialized = true;
            self.confirmed = next;
            self.state_start_ms = now_ms;
            info!("[DEMAND] Initial state: {}", level_name(next));
            return DemandUpdate {
                confirmed: next,
                ..DemandUpdate::default()
            };
        }

        let rearm = !self.confirmed && next;
        let mut stuck = None;

        if next != self.confirmed {
            self.confirmed = next;
            self.state_start_ms = now_ms;
            info!("[DEMAND] New state: {} (timer reset)", level_name(next));
        } else {
            let elapsed = now_ms.saturating_sub(self.state_start_ms);
            let (threshold, level) = if next {
                (self.high_threshold_ms, StuckLevel::High)
            } else {
                (self.low_threshold_ms, StuckLevel::Low)
            };
            if elapsed >= threshold {
                warn!("[DEMAND] Line stuck {} for {}ms", level_name(next), elapsed);
                self.state_start_ms = now_ms;
                stuck = Some(level);
            }
        }

        DemandUpdate {
            confirmed: self.confirmed,
            rearm,
            stuck,
        }
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed
    }
}

fn level_name(level: bool) -> &'static str {
    if level { "HIGH" } else { "LOW" }
}

/// `isDemandActive`: set by a confirmed press while green is dark, cleared by green.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DemandLatch {
    active: bool,
}

impl DemandLatch {
    pub const fn new() -> Self {
        Self { active: false }
    }

    pub fn update(&mut self, demand_confirmed: bool, green_confirmed: bool) -> bool {
        if demand_confirmed && !self.active && !green_confirmed {
            self.active = true;
            info!("[DEMAND] Request latched");
        }
        if green_confirmed && self.active {
            self.active = false;
            info!("[DEMAND] Request answered by green");
        }
        self.active
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}
