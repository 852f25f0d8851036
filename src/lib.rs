#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

//! ESP32-C3 Pedestrian Crossing Audio Controller Library
//!
//! This library provides the signal-tracking and audio-scheduling core of a
//! pedestrian-crossing announcer: debounced traffic-light feedback lines,
//! green/red light timing, demand-button monitoring, and the arbiter that
//! decides which announcement plays next over I2S.

pub mod alarm;
pub mod ambient;
pub mod audio_config;
pub mod clock;
pub mod countdown;
pub mod debounce;
pub mod demand;
pub mod light_tracker;
pub mod playback;
pub mod scheduler;
pub mod shared;
pub mod storage;

#[cfg(feature = "firmware")]
pub mod speaker;

/// Project version information
pub const VERSION: &str = "0.1.0-dev";

/// Default configuration constants
pub mod config {
    /// IO polling period (debounce, trackers, demand)
    pub const POLL_PERIOD_MS: u64 = 50;

    /// Playback-decision pass period
    pub const SCHEDULER_PERIOD_MS: u64 = 10;

    /// Wall clock / countdown tick
    pub const CLOCK_TICK_MS: u64 = 1000;

    /// Minimum gap between the end of one clip and the start of the next
    pub const MIN_SILENCE_MS: u64 = 700;

    /// Gap between the two clips of a request sequence
    pub const REQUEST_SEQUENCE_GAP_MS: u64 = 50;

    /// Flash band, both phases inclusive
    pub const FLASH_MIN_MS: u64 = 400;
    pub const FLASH_MAX_MS: u64 = 800;

    /// Dark time required before a new measurement may start
    pub const MIN_DARK_BEFORE_MEASURE_MS: u64 = 2000;

    /// Dark time after the last light-off that closes a measurement
    pub const MEASUREMENT_END_DARK_MS: u64 = 2000;

    /// I2S output rate; clips must be recorded at this rate
    pub const CLIP_SAMPLE_RATE_HZ: u32 = 16_000;

    /// Ambient sensor range assumed by the volume interpolation
    pub const VOLUME_ADC_RANGE: u32 = 4048;

    /// Upper bound of the sample scale factor (100 % volume)
    pub const MAX_VOLUME_FACTOR: f32 = 0.5;

    /// Scale factor used until the first clip sets its own
    pub const DEFAULT_VOLUME_FACTOR: f32 = 0.02;

    /// ADC conversions averaged into one ambient reading
    pub const ADC_SAMPLE_COUNT: u32 = 16;

    /// Ambient readings in the rolling average
    pub const ADC_AVERAGE_COUNT: usize = 10;

    /// Full scale of the 12-bit ADC, used for the noise history only
    pub const ADC_FULL_SCALE: u32 = 4095;

    /// Noise history: one entry per second, scaled 0..=NOISE_HISTORY_SCALE
    pub const NOISE_HISTORY_LEN: usize = 15;
    pub const NOISE_HISTORY_SCALE: u32 = 150;

    /// Alarm ring capacity, message bound and JSON export cap
    pub const MAX_ALARMS: usize = 50;
    pub const ALARM_MESSAGE_LEN: usize = 64;
    pub const ALARM_EXPORT_ROWS: usize = 50;

    /// Longest clip file name
    pub const CLIP_NAME_LEN: usize = 50;

    /// Numbered countdown voices (1..=30)
    pub const VOICE_COUNT: usize = 30;

    /// Number of stored audio profiles
    pub const PROFILE_COUNT: usize = 4;

    /// Demand line stuck thresholds
    /// Read from environment variables at compile time (minutes)
    pub const DEMAND_STUCK_LOW_MS: u64 =
        parse_minutes(env!("CROSSING_DEMAND_STUCK_LOW_MIN")) as u64 * 60_000;
    pub const DEMAND_STUCK_HIGH_MS: u64 =
        parse_minutes(env!("CROSSING_DEMAND_STUCK_HIGH_MIN")) as u64 * 60_000;

    /// Diagnostic label printed in boot banners
    pub const DEVICE_LABEL: &str = env!("CROSSING_DEVICE_LABEL");

    /// build.rs only exports validated decimal values.
    const fn parse_minutes(raw: &str) -> u32 {
        let bytes = raw.as_bytes();
        let mut value = 0u32;
        let mut i = 0;
        while i < bytes.len() {
            value = value * 10 + (bytes[i] - b'0') as u32;
            i += 1;
        }
        value
    }
}

/// Error types for the crossing controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerError {
    /// Flash read, write or erase failed
    Flash,
    /// Blob does not fit its flash sector
    BlobTooLarge,
    /// Stored blob failed its length or CRC check
    BlobCorrupt,
    /// Nothing stored under the key yet
    BlobMissing,
    /// Key has no flash sector assigned
    UnknownKey,
    /// Serialization failed
    Encode,
    /// Deserialization failed
    Decode,
    /// Clip file missing on the card
    ClipNotFound,
    /// Clip is not a playable PCM WAV
    ClipFormat,
    /// I2S or card I/O failed mid-playback
    Audio,
    /// Digital input or ADC read failed
    Input,
}

impl core::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ControllerError::Flash => write!(f, "flash access failed"),
            ControllerError::BlobTooLarge => write!(f, "blob exceeds sector size"),
            ControllerError::BlobCorrupt => write!(f, "stored blob is corrupt"),
            ControllerError::BlobMissing => write!(f, "no blob stored"),
            ControllerError::UnknownKey => write!(f, "unknown blob key"),
            ControllerError::Encode => write!(f, "serialization failed"),
            ControllerError::Decode => write!(f, "deserialization failed"),
            ControllerError::ClipNotFound => write!(f, "clip not found"),
            ControllerError::ClipFormat => write!(f, "clip is not a PCM WAV"),
            ControllerError::Audio => write!(f, "audio output failed"),
            ControllerError::Input => write!(f, "input read failed"),
        }
    }
}
