//! Light-timing tracker
//!
//! Infers how long a monitored signal (green or red) stays lit by watching the
//! debounced feedback line. A measurement opens on the first light-on after at
//! least 2 s of darkness, accumulates steady and flashing light, and closes
//! once the light has stayed off for 2 s. The closed total, in whole seconds,
//! seeds the pedestrian countdown of the next cycle.

use crate::config::{FLASH_MAX_MS, FLASH_MIN_MS, MEASUREMENT_END_DARK_MS, MIN_DARK_BEFORE_MEASURE_MS};
use crate::debounce::DebouncedInput;
use log::{debug, info};

/// Mode of the light as of the last edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightMode {
    Off,
    On,
    Flash,
}

/// Tracker state as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// Dark, and the next light-on may open a measurement
    DarkWaiting,
    /// Light on, not inside a flash sequence
    SteadyOn,
    /// Light off inside a measurement
    SteadyOff,
    /// Inside a 400..=800 ms on/off sequence
    Flashing,
}

/// Result of a closed measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub steady_ms: u64,
    pub flash_ms: u64,
    /// (steady + flash) / 1000, truncated
    pub seconds: u32,
}

#[derive(Debug, Clone)]
pub struct LightTracker {
    label: &'static str,
    input: DebouncedInput,
    last_state: bool,
    light_mode: LightMode,
    flash_mode: bool,

    light_start_ms: u64,
    dark_start_ms: u64,
    last_light_ms: u64,
    last_dark_ms: u64,
    last_light_off_ms: u64,

    total_flash_ms: u64,
    total_steady_ms: u64,

    waiting_for_dark: bool,
    counting: bool,
    measurement_count: u32,

    countdown_start: u32,
    countdown_current: u32,
    countdown_active: bool,
}

impl LightTracker {
    pub const fn new(label: &'static str) -> Self {
        Self {
            label,
            input: DebouncedInput::new(),
            last_state: false,
            light_mode: LightMode::Off,
            flash_mode: false,
            light_start_ms: 0,
            dark_start_ms: 0,
            last_light_ms: 0,
            last_dark_ms: 0,
            last_light_off_ms: 0,
            total_flash_ms: 0,
            total_steady_ms: 0,
            waiting_for_dark: true,
            counting: false,
            measurement_count: 0,
            countdown_start: 0,
            countdown_current: 0,
            countdown_active: false,
        }
    }

    /// Debounce a raw sample and track the resulting confirmed level.
    pub fn update(&mut self, raw: bool, now_ms: u64) -> Option<Measurement> {
        self.input.update(raw);
        self.track(self.input.confirmed(), now_ms)
    }

    /// Track an already-confirmed level. Returns the measurement closed by this call.
    pub fn track(&mut self, confirmed: bool, now_ms: u64) -> Option<Measurement> {
        if confirmed && !self.last_state {
            self.on_light_on(now_ms);
        } else if !confirmed && self.last_state {
            self.on_light_off(now_ms);
        }

        if self.counting
            && !confirmed
            && now_ms.saturating_sub(self.last_light_off_ms) > MEASUREMENT_END_DARK_MS
        {
            return Some(self.close_measurement());
        }
        None
    }

    fn on_light_on(&mut self, now_ms: u64) {
        self.last_dark_ms = now_ms.saturating_sub(self.dark_start_ms);
        self.light_start_ms = now_ms;
        self.light_mode = LightMode::On;
        self.last_state = true;

        if self.waiting_for_dark && self.last_dark_ms >= MIN_DARK_BEFORE_MEASURE_MS {
            self.counting = true;
            self.waiting_for_dark = false;
            self.total_flash_ms = 0;
            self.total_steady_ms = 0;
            self.measurement_count = self.measurement_count.saturating_add(1);

            // The first measurement after reset saw a partial cycle.
            self.countdown_active = self.measurement_count >= 2;
            if self.countdown_active {
                info!(
                    "[{}] Countdown ACTIVE (measurement #{})",
                    self.label, self.measurement_count
                );
            } else {
                info!("[{}] First measurement, countdown not active", self.label);
            }
            info!("[{}] Measurement STARTED", self.label);
        }
    }

    fn on_light_off(&mut self, now_ms: u64) {
        self.last_light_ms = now_ms.saturating_sub(self.light_start_ms);
        self.last_light_off_ms = now_ms;
        self.dark_start_ms = now_ms;
        self.light_mode = LightMode::Off;
        self.last_state = false;

        if in_flash_band(self.last_light_ms) && in_flash_band(self.last_dark_ms) {
            if !self.flash_mode {
                self.flash_mode = true;
                info!("[{}] Flash sequence STARTED", self.label);
            }
            self.light_mode = LightMode::Flash;
            self.total_flash_ms += self.last_light_ms + self.last_dark_ms;
            debug!(
                "[{}] Flash added: {}ms on + {}ms off",
                self.label, self.last_light_ms, self.last_dark_ms
            );
        } else {
            if self.flash_mode {
                self.flash_mode = false;
                info!("[{}] Flash sequence ENDED", self.label);
            }
            if self.counting && self.last_light_ms > FLASH_MAX_MS {
                self.total_steady_ms += self.last_light_ms;
                debug!("[{}] Steady light added: {}ms", self.label, self.last_light_ms);
            }
        }
    }

    fn close_measurement(&mut self) -> Measurement {
        let total = self.total_steady_ms + self.total_flash_ms;
        let seconds = u32::try_from(total / 1000).unwrap_or(u32::MAX);
        info!(
            "[{}] Measurement ENDED | steady {}ms | flash {}ms | total {}ms",
            self.label, self.total_steady_ms, self.total_flash_ms, total
        );

        self.countdown_start = seconds;
        self.countdown_current = seconds;
        self.countdown_active = false;
        self.counting = false;
        self.waiting_for_dark = true;

        Measurement {
            steady_ms: self.total_steady_ms,
            flash_ms: self.total_flash_ms,
            seconds,
        }
    }

    pub fn state(&self) -> TrackerState {
        if self.flash_mode {
            TrackerState::Flashing
        } else if self.last_state {
            TrackerState::SteadyOn
        } else if self.waiting_for_dark {
            TrackerState::DarkWaiting
        } else {
            TrackerState::SteadyOff
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn confirmed(&self) -> bool {
        self.last_state
    }

    pub fn light_mode(&self) -> LightMode {
        self.light_mode
    }

    pub fn is_counting(&self) -> bool {
        self.counting
    }

    pub fn is_waiting_for_dark(&self) -> bool {
        self.waiting_for_dark
    }

    pub fn measurement_count(&self) -> u32 {
        self.measurement_count
    }

    pub fn total_flash_ms(&self) -> u64 {
        self.total_flash_ms
    }

    pub fn total_steady_ms(&self) -> u64 {
        self.total_steady_ms
    }

    pub fn countdown_start(&self) -> u32 {
        self.countdown_start
    }

    pub fn countdown_current(&self) -> u32 {
        self.countdown_current
    }

    pub fn is_countdown_active(&self) -> bool {
        self.countdown_active
    }

    /// Written by the 1 s countdown driver only.
    pub fn set_countdown_current(&mut self, value: u32) {
        self.countdown_current = value;
    }

    pub fn finish_countdown(&mut self) {
        self.countdown_active = false;
    }
}

fn in_flash_band(duration_ms: u64) -> bool {
    (FLASH_MIN_MS..=FLASH_MAX_MS).contains(&duration_ms)
}
