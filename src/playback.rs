//! Playback service interface
//!
//! The scheduler never touches I2S. It hands a [`PlaybackRequest`] (one clip, or
//! a two-clip request sequence) to the playback task, which runs it through a
//! [`ClipPlayer`]. Durations come from a [`ClipCatalog`] so the scheduler can
//! book the time a sequence will occupy before it is actually played.

use crate::ControllerError;
use crate::audio_config::ClipName;
use crate::config::{MAX_VOLUME_FACTOR, REQUEST_SEQUENCE_GAP_MS, VOLUME_ADC_RANGE};
use core::sync::atomic::{AtomicBool, Ordering};
use embassy_time::Timer;
use log::{info, warn};

/// Interrupt request for the clip currently being played.
///
/// Checked by the player once per output chunk.
#[derive(Debug, Default)]
pub struct StopFlag(AtomicBool);

impl StopFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Busy flag of the playback task
#[derive(Debug, Default)]
pub struct PlaybackStatus {
    playing: AtomicBool,
}

impl PlaybackStatus {
    pub const fn new() -> Self {
        Self {
            playing: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub fn set_busy(&self, busy: bool) {
        self.playing.store(busy, Ordering::Release);
    }
}

/// What the scheduler asks the playback task to play
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackRequest {
    pub first: ClipName,
    /// Second half of a request sequence, played after a short gap
    pub second: Option<ClipName>,
    pub volume: f32,
}

impl PlaybackRequest {
    pub fn single(name: ClipName, volume: f32) -> Self {
        Self {
            first: name,
            second: None,
            volume,
        }
    }
}

/// Plays one clip to completion or until `stop` is raised.
#[allow(async_fn_in_trait)]
pub trait ClipPlayer {
    async fn play(&mut self, name: &str, volume: f32, stop: &StopFlag) -> Result<(), ControllerError>;
}

/// Clip length lookup, used for scheduling only.
pub trait ClipCatalog {
    fn duration_ms(&mut self, name: &str) -> Result<u64, ControllerError>;
}

/// Play a request: the first clip, then the optional second one 50 ms later.
///
/// The busy flag is held for the whole sequence. The stop flag is cleared once
/// up front; an interrupt during the first clip or the gap drops the second.
pub async fn run_request<P: ClipPlayer>(
    player: &mut P,
    request: &PlaybackRequest,
    stop: &StopFlag,
    status: &PlaybackStatus,
) -> Result<(), ControllerError> {
    status.set_busy(true);
    let result = play_sequence(player, request, stop).await;
    status.set_busy(false);
    result
}

async fn play_sequence<P: ClipPlayer>(
    player: &mut P,
    request: &PlaybackRequest,
    stop: &StopFlag,
) -> Result<(), ControllerError> {
    info!("[AUDIO] Playing {}", request.first);
    stop.clear();
    player.play(&request.first, request.volume, stop).await?;

    if let Some(second) = &request.second {
        if !stop.is_requested() {
            Timer::after_millis(REQUEST_SEQUENCE_GAP_MS).await;
        }
        // a stop raised during the first clip or the gap ends the sequence
        if stop.is_requested() {
            warn!("[AUDIO] Sequence interrupted, skipping {}", second);
            return Ok(());
        }
        info!("[AUDIO] Playing {}", second);
        player.play(second, request.volume, stop).await?;
    }
    Ok(())
}

/// Linear volume between two percentages, driven by the ambient reading.
///
/// The reading is clamped to `0..=VOLUME_ADC_RANGE`; 100 % maps to `MAX_VOLUME_FACTOR`.
pub fn volume_factor(min_percent: u8, max_percent: u8, ambient: u32) -> f32 {
    let min = f32::from(min_percent) / 100.0 * MAX_VOLUME_FACTOR;
    let max = f32::from(max_percent) / 100.0 * MAX_VOLUME_FACTOR;
    let level = ambient.min(VOLUME_ADC_RANGE) as f32 / VOLUME_ADC_RANGE as f32;
    level * (max - min) + min
}

/// Format of a PCM WAV file and where its samples start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub data_offset: u32,
    pub data_len: u32,
}

const WAVE_FORMAT_PCM: u16 = 1;

impl WavHeader {
    /// Parse the RIFF chunks up to the start of `data`.
    ///
    /// `bytes` only needs to cover the headers, not the samples.
    pub fn parse(bytes: &[u8]) -> Result<Self, ControllerError> {
        if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
            return Err(ControllerError::ClipFormat);
        }

        let mut format: Option<(u16, u16, u32, u16)> = None;
        let mut pos = 12usize;
        while pos + 8 <= bytes.len() {
            let id = &bytes[pos..pos + 4];
            let size = read_u32(bytes, pos + 4)?;
            let body = pos + 8;

            match id {
                b"fmt " => {
                    let audio_format = read_u16(bytes, body)?;
                    let channels = read_u16(bytes, body + 2)?;
                    let sample_rate = read_u32(bytes, body + 4)?;
                    let bits = read_u16(bytes, body + 14)?;
                    format = Some((audio_format, channels, sample_rate, bits));
                }
                b"data" => {
                    let (audio_format, channels, sample_rate, bits_per_sample) =
                        format.ok_or(ControllerError::ClipFormat)?;
                    if audio_format != WAVE_FORMAT_PCM
                        || channels == 0
                        || sample_rate == 0
                        || bits_per_sample != 16
                    {
                        return Err(ControllerError::ClipFormat);
                    }
                    return Ok(Self {
                        channels,
                        sample_rate,
                        bits_per_sample,
                        data_offset: u32::try_from(body).map_err(|_| ControllerError::ClipFormat)?,
                        data_len: size,
                    });
                }
                _ => {}
            }

            // Chunks are word aligned.
            let padded = usize::try_from(size).map_err(|_| ControllerError::ClipFormat)? + (size as usize & 1);
            pos = body.checked_add(padded).ok_or(ControllerError::ClipFormat)?;
        }
        Err(ControllerError::ClipFormat)
    }

    pub fn byte_rate(&self) -> u64 {
        u64::from(self.sample_rate) * u64::from(self.channels) * u64::from(self.bits_per_sample / 8)
    }

    /// Playing time, rounded up to the next millisecond.
    pub fn duration_ms(&self) -> u64 {
        let rate = self.byte_rate();
        if rate == 0 {
            return 0;
        }
        (u64::from(self.data_len) * 1000).div_ceil(rate)
    }
}

fn read_u16(bytes: &[u8], at: usize) -> Result<u16, ControllerError> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(ControllerError::ClipFormat)
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, ControllerError> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(ControllerError::ClipFormat)
}

/// Scale 16-bit little-endian samples in place. A trailing odd byte is left alone.
pub fn scale_samples(pcm: &mut [u8], factor: f32) {
    for frame in pcm.chunks_exact_mut(2) {
        let sample = i16::from_le_bytes([frame[0], frame[1]]);
        let scaled = (f32::from(sample) * factor) as i32;
        let clamped = scaled.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        frame.copy_from_slice(&clamped.to_le_bytes());
    }
}
