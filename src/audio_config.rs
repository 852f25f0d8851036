//! Audio configuration profiles
//!
//! Four [`AudioProfile`]s are stored in flash. Once per second a [`PlanSource`]
//! picks one of them and the scheduler works from the resulting
//! [`AudioConfiguration`] snapshot until the next tick. The numbered countdown
//! voices are shared by all profiles and live in an immutable
//! [`CountdownVoices`] table built when the voice set is loaded.

use crate::clock::DeviceTime;
use crate::config::{CLIP_NAME_LEN, PROFILE_COUNT, VOICE_COUNT};
use crate::playback::volume_factor;
use heapless::{String, Vec};
use log::warn;
use serde::{Deserialize, Serialize};

/// File name of a clip on the card, relative to its root.
pub type ClipName = String<CLIP_NAME_LEN>;

/// Name stored for "no clip configured".
pub const ABSENT_CLIP: &str = "-";

/// Flash keys of the four profiles, indexed by profile number.
pub const PROFILE_KEYS: [&str; PROFILE_COUNT] = ["defconf", "alt1conf", "alt2conf", "alt3conf"];

/// Flash key of the shared countdown voice names.
pub const VOICES_KEY: &str = "audio_configs";

/// Builds a clip name, truncating at a char boundary if it is too long.
pub fn clip_name(name: &str) -> ClipName {
    let mut out = ClipName::new();
    for ch in name.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// `None` for the `"-"` sentinel or an empty name.
pub fn configured(name: &ClipName) -> Option<&ClipName> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == ABSENT_CLIP {
        None
    } else {
        Some(name)
    }
}

/// Volume bounds in percent (0..=100)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRange {
    pub min: u8,
    pub max: u8,
}

impl Default for VolumeRange {
    fn default() -> Self {
        Self { min: 10, max: 60 }
    }
}

impl VolumeRange {
    pub const fn new(min: u8, max: u8) -> Self {
        Self { min, max }
    }

    /// Sample scale factor for the given ambient reading.
    pub fn factor(&self, ambient: u32) -> f32 {
        volume_factor(self.min, self.max, ambient)
    }
}

/// Delay between periodic request announcements, by stored code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPeriod {
    /// Play once per demand episode
    Once,
    Every(u64),
}

impl RequestPeriod {
    const DELAYS_MS: [u64; 9] = [1000, 2000, 3000, 4000, 5000, 10_000, 15_000, 30_000, 60_000];

    /// Codes 1..=9 index the delay table; 0 and anything unknown are one-shot.
    pub fn from_code(code: u8) -> Self {
        match code {
            1..=9 => RequestPeriod::Every(Self::DELAYS_MS[usize::from(code - 1)]),
            _ => RequestPeriod::Once,
        }
    }

    pub fn delay_ms(&self) -> Option<u64> {
        match self {
            RequestPeriod::Once => None,
            RequestPeriod::Every(ms) => Some(*ms),
        }
    }
}

/// One stored configuration profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioProfile {
    pub idle_active: bool,
    pub idle_sound: ClipName,
    pub idle_volume: VolumeRange,
    pub idle_continues_after_request: bool,

    pub request_active: bool,
    pub request_sound_1: ClipName,
    pub request_sound_2: ClipName,
    /// Code into the request delay table, see [`RequestPeriod::from_code`]
    pub request_period: u8,
    pub request_volume: VolumeRange,

    pub green_active: bool,
    pub green_sound: ClipName,
    pub green_volume: VolumeRange,
    pub green_count_from: u8,
    pub green_count_to: u8,
    pub green_action: ClipName,
}

impl Default for AudioProfile {
    fn default() -> Self {
        Self {
            idle_active: false,
            idle_sound: clip_name(ABSENT_CLIP),
            idle_volume: VolumeRange::default(),
            idle_continues_after_request: false,
            request_active: false,
            request_sound_1: clip_name(ABSENT_CLIP),
            request_sound_2: clip_name(ABSENT_CLIP),
            request_period: 0,
            request_volume: VolumeRange::default(),
            green_active: false,
            green_sound: clip_name(ABSENT_CLIP),
            green_volume: VolumeRange::default(),
            green_count_from: 10,
            green_count_to: 0,
            green_action: clip_name(ABSENT_CLIP),
        }
    }
}

impl AudioProfile {
    pub fn request_period(&self) -> RequestPeriod {
        RequestPeriod::from_code(self.request_period)
    }
}

/// Stored names of the numbered countdown voices, `names[0]` speaks "1".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSet {
    pub names: Vec<ClipName, VOICE_COUNT>,
}

impl Default for VoiceSet {
    fn default() -> Self {
        let mut names = Vec::new();
        for n in 1..=VOICE_COUNT {
            let mut name = ClipName::new();
            let _ = core::fmt::write(&mut name, format_args!("{}.wav", n));
            let _ = names.push(name);
        }
        Self { names }
    }
}

/// Read-only lookup from a countdown value to its voice clip.
#[derive(Debug, Clone, PartialEq)]
pub struct CountdownVoices {
    table: [Option<ClipName>; VOICE_COUNT],
}

impl CountdownVoices {
    pub fn new(voices: &VoiceSet) -> Self {
        let table = core::array::from_fn(|i| voices.names.get(i).and_then(configured).cloned());
        Self { table }
    }

    /// Clip for `count` in 1..=30; 0, out-of-range and unconfigured values have none.
    pub fn get(&self, count: u32) -> Option<&ClipName> {
        let index = usize::try_from(count).ok()?.checked_sub(1)?;
        self.table.get(index)?.as_ref()
    }
}

/// Snapshot the scheduler reads during one second
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfiguration {
    pub profile_index: u8,
    pub profile: AudioProfile,
}

impl Default for AudioConfiguration {
    fn default() -> Self {
        Self {
            profile_index: 0,
            profile: AudioProfile::default(),
        }
    }
}

/// Picks the active profile for a moment in time.
pub trait PlanSource {
    fn active_profile(&self, now: &DeviceTime) -> u8;
}

/// Always selects the same profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixedPlan(pub u8);

impl PlanSource for FixedPlan {
    fn active_profile(&self, _now: &DeviceTime) -> u8 {
        self.0
    }
}

/// All stored profiles plus the shared voice table
#[derive(Debug, Clone)]
pub struct ProfileTable {
    profiles: [AudioProfile; PROFILE_COUNT],
    voices: CountdownVoices,
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self::new(Default::default(), &VoiceSet::default())
    }
}

impl ProfileTable {
    pub fn new(profiles: [AudioProfile; PROFILE_COUNT], voices: &VoiceSet) -> Self {
        Self {
            profiles,
            voices: CountdownVoices::new(voices),
        }
    }

    pub fn profile(&self, index: usize) -> Option<&AudioProfile> {
        self.profiles.get(index)
    }

    pub fn profiles(&self) -> &[AudioProfile; PROFILE_COUNT] {
        &self.profiles
    }

    pub fn set_profile(&mut self, index: usize, profile: AudioProfile) -> bool {
        match self.profiles.get_mut(index) {
            Some(slot) => {
                *slot = profile;
                true
            }
            None => false,
        }
    }

    /// Rebuilds the lookup table from a new voice set.
    pub fn set_voices(&mut self, voices: &VoiceSet) {
        self.voices = CountdownVoices::new(voices);
    }

    pub fn voices(&self) -> &CountdownVoices {
        &self.voices
    }

    /// Resolve the plan into a snapshot; unknown indices fall back to profile 0.
    pub fn current(&self, plan: &impl PlanSource, now: &DeviceTime) -> AudioConfiguration {
        let wanted = plan.active_profile(now);
        let index = if usize::from(wanted) < PROFILE_COUNT {
            wanted
        } else {
            warn!("[CONFIG] Plan selected profile {}, using default", wanted);
            0
        };
        AudioConfiguration {
            profile_index: index,
            profile: self.profiles[usize::from(index)].clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_codes_map_to_delay_table() {
        assert_eq!(RequestPeriod::from_code(0), RequestPeriod::Once);
        assert_eq!(RequestPeriod::from_code(1).delay_ms(), Some(1000));
        assert_eq!(RequestPeriod::from_code(6).delay_ms(), Some(10_000));
        assert_eq!(RequestPeriod::from_code(9).delay_ms(), Some(60_000));
        assert_eq!(RequestPeriod::from_code(10), RequestPeriod::Once);
    }

    #[test]
    fn dash_and_empty_names_are_absent() {
        assert!(configured(&clip_name("-")).is_none());
        assert!(configured(&clip_name("")).is_none());
        assert!(configured(&clip_name(" - ")).is_none());
        assert_eq!(configured(&clip_name("idle.wav")).map(|n| n.as_str()), Some("idle.wav"));
    }

    #[test]
    fn long_names_are_truncated() {
        let long = "a".repeat(80);
        assert_eq!(clip_name(&long).len(), CLIP_NAME_LEN);
    }

    #[test]
    fn voice_table_is_one_based() {
        let mut set = VoiceSet::default();
        set.names[4] = clip_name("-");
        let voices = CountdownVoices::new(&set);
        assert_eq!(voices.get(1).map(|n| n.as_str()), Some("1.wav"));
        assert_eq!(voices.get(30).map(|n| n.as_str()), Some("30.wav"));
        assert!(voices.get(0).is_none());
        assert!(voices.get(31).is_none());
        assert!(voices.get(5).is_none());
    }

    #[test]
    fn plan_outside_table_falls_back_to_default() {
        let mut table = ProfileTable::default();
        let mut alt = AudioProfile::default();
        alt.idle_active = true;
        assert!(table.set_profile(2, alt.clone()));
        assert!(!table.set_profile(4, alt.clone()));

        let now = DeviceTime::default();
        let picked = table.current(&FixedPlan(2), &now);
        assert_eq!(picked.profile_index, 2);
        assert_eq!(picked.profile, alt);

        let fallback = table.current(&FixedPlan(7), &now);
        assert_eq!(fallback.profile_index, 0);
        assert!(!fallback.profile.idle_active);
    }

    #[test]
    fn profile_survives_postcard() {
        let mut profile = AudioProfile::default();
        profile.request_sound_1 = clip_name("bekleyin.wav");
        profile.request_period = 6;
        let mut buf = [0u8; 512];
        let bytes = postcard::to_slice(&profile, &mut buf).unwrap();
        let back: AudioProfile = postcard::from_bytes(bytes).unwrap();
        assert_eq!(back, profile);
    }
}
