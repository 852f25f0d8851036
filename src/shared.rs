//! Shared controller state
//!
//! Every task works through one [`Controller`]. Mutable state lives in a
//! critical-section mutex and is only touched inside short, non-blocking
//! closures; anything that may block (SD card probing, flash commits, I2S
//! output) runs outside the lock on copies or through signals:
//!
//! - the clock tick hands countdown values to the scheduler through a [`VoiceHandoff`],
//! - the scheduler hands [`PlaybackRequest`]s to the playback task (latest wins),
//! - writers raise [`PersistRequests`] flags and the persistence task commits them.

use crate::ControllerError;
use crate::alarm::{ALARM_KEY, AlarmLog};
use crate::ambient::{AmbientSensor, NoiseAverager};
use crate::audio_config::{
    AudioConfiguration, AudioProfile, ClipName, CountdownVoices, PROFILE_KEYS, PlanSource,
    ProfileTable, VOICES_KEY, VoiceSet, configured,
};
use crate::clock::DeviceTime;
use crate::config::{
    ADC_SAMPLE_COUNT, DEFAULT_VOLUME_FACTOR, DEMAND_STUCK_HIGH_MS, DEMAND_STUCK_LOW_MS,
    NOISE_HISTORY_LEN, PROFILE_COUNT,
};
use crate::countdown::{CountdownDriver, VoiceHandoff};
use crate::demand::{DemandLatch, DemandMonitor, STUCK_ALARM_MESSAGE};
use crate::light_tracker::LightTracker;
use crate::playback::{
    ClipCatalog, ClipPlayer, PlaybackRequest, PlaybackStatus, StopFlag, run_request,
};
use crate::scheduler::{PlaybackScheduler, SchedulerInputs, SchedulerOutput};
use crate::storage::{self, BlobStore, PendingWrites, PersistKind, PersistRequests};
use core::cell::RefCell;
use core::fmt::Write;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embedded_hal::digital::InputPin;
use heapless::String;
use log::{error, info, warn};

const AMBIENT_ALARM: &str = "Ambient sensor read failed";
const INPUT_ALARM: &str = "Feedback input read failed";

/// Values shown on the status page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStatus {
    /// Last measured green duration in seconds
    pub green_seconds: u32,
    /// Last measured red duration in seconds
    pub red_seconds: u32,
    pub demand_pressed: bool,
}

/// The three polled feedback lines, high = lit / pressed
pub struct FeedbackPins<G, R, D> {
    pub green: G,
    pub red: R,
    pub demand: D,
}

pub struct ControllerState {
    pub green: LightTracker,
    pub red: LightTracker,
    pub demand: DemandMonitor,
    pub latch: DemandLatch,
    pub countdown: CountdownDriver,
    pub profiles: ProfileTable,
    pub voice_names: VoiceSet,
    pub configuration: AudioConfiguration,
    /// Bumped whenever `configuration` or the voice table changes
    pub config_generation: u32,
    pub time: DeviceTime,
    pub alarms: AlarmLog,
    pub status: DeviceStatus,
    pub noise: NoiseAverager,
    pub test_clip: Option<ClipName>,
    /// Confirmed demand press not yet seen by the scheduler
    pub rearm_pending: bool,
}

impl ControllerState {
    pub fn new() -> Self {
        let voice_names = VoiceSet::default();
        Self {
            green: LightTracker::new("GREEN"),
            red: LightTracker::new("RED"),
            demand: DemandMonitor::new(DEMAND_STUCK_LOW_MS, DEMAND_STUCK_HIGH_MS),
            latch: DemandLatch::new(),
            countdown: CountdownDriver::new(),
            profiles: ProfileTable::new(Default::default(), &voice_names),
            voice_names,
            configuration: AudioConfiguration::default(),
            config_generation: 0,
            time: DeviceTime::default(),
            alarms: AlarmLog::new(),
            status: DeviceStatus::default(),
            noise: NoiseAverager::new(),
            test_clip: None,
            rearm_pending: false,
        }
    }

    /// Log an alarm stamped with the controller clock. Returns whether it was new.
    fn raise(&mut self, message: &str) -> bool {
        self.alarms.log(message, Some(&self.time))
    }
}

impl Default for ControllerState {
    fn default() -> Self {
        Self::new()
    }
}

/// State owned by the scheduler task between passes
pub struct SchedulerContext {
    scheduler: PlaybackScheduler,
    configuration: AudioConfiguration,
    voices: CountdownVoices,
    generation: Option<u32>,
}

impl Default for SchedulerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerContext {
    pub fn new() -> Self {
        Self {
            scheduler: PlaybackScheduler::new(),
            configuration: AudioConfiguration::default(),
            voices: CountdownVoices::new(&VoiceSet::default()),
            generation: None,
        }
    }

    pub fn configuration(&self) -> &AudioConfiguration {
        &self.configuration
    }
}

/// Live values the scheduler copies out of the shared state
struct LiveSignals {
    demand_active: bool,
    green_confirmed: bool,
    countdown_active: bool,
    ambient: u32,
    rearm: bool,
    test_clip: Option<ClipName>,
}

pub struct Controller {
    state: Mutex<CriticalSectionRawMutex, RefCell<ControllerState>>,
    voice: VoiceHandoff,
    requests: Signal<CriticalSectionRawMutex, PlaybackRequest>,
    stop: StopFlag,
    playback: PlaybackStatus,
    persist: PersistRequests,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(ControllerState::new())),
            voice: VoiceHandoff::new(),
            requests: Signal::new(),
            stop: StopFlag::new(),
            playback: PlaybackStatus::new(),
            persist: PersistRequests::new(),
        }
    }

    /// Run `f` on the shared state inside the critical section. `f` must not block.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ControllerState) -> R) -> R {
        self.state.lock(|cell| f(&mut cell.borrow_mut()))
    }

    /// Log an alarm and schedule the log for persistence.
    pub fn raise_alarm(&self, message: &str) {
        if self.with_state(|s| s.raise(message)) {
            self.persist.request(PersistKind::Alarms);
        }
    }

    /// Restore profiles, voices and alarms. Missing blobs keep defaults silently.
    pub fn load(&self, store: &mut impl BlobStore) {
        let mut profiles: [AudioProfile; PROFILE_COUNT] = Default::default();
        for (slot, key) in profiles.iter_mut().zip(PROFILE_KEYS) {
            match storage::load::<AudioProfile>(store, key) {
                Ok(profile) => *slot = profile,
                Err(e) => self.report_load_error(key, e),
            }
        }
        let voices = match storage::load::<VoiceSet>(store, VOICES_KEY) {
            Ok(voices) => voices,
            Err(e) => {
                self.report_load_error(VOICES_KEY, e);
                VoiceSet::default()
            }
        };
        let alarms = match storage::load::<AlarmLog>(store, ALARM_KEY) {
            Ok(alarms) => Some(alarms),
            Err(e) => {
                self.report_load_error(ALARM_KEY, e);
                None
            }
        };

        self.with_state(|s| {
            s.profiles = ProfileTable::new(profiles, &voices);
            s.voice_names = voices;
            if let Some(mut restored) = alarms {
                // Faults raised while loading come after the restored history.
                for entry in s.alarms.iter() {
                    restored.log(&entry.message, Some(&entry.time));
                }
                s.alarms = restored;
            }
            s.config_generation = s.config_generation.wrapping_add(1);
        });
        info!("[FLASH] Configuration loaded");
    }

    fn report_load_error(&self, key: &str, error: ControllerError) {
        if error == ControllerError::BlobMissing {
            info!("[FLASH] '{}' not stored yet, using defaults", key);
            return;
        }
        error!("[FLASH] Reading '{}' failed: {}", key, error);
        let mut message: String<64> = String::new();
        let _ = write!(message, "Flash read failed: {}", key);
        self.raise_alarm(&message);
    }

    /// IO poll: ambient level, demand button and both light trackers.
    pub fn io_pass<G, R, D>(
        &self,
        pins: &mut FeedbackPins<G, R, D>,
        sensor: &mut impl AmbientSensor,
        now_ms: u64,
    ) where
        G: InputPin,
        R: InputPin,
        D: InputPin,
    {
        let ambient = sensor.read_average(ADC_SAMPLE_COUNT);
        let demand_raw = pins.demand.is_high();
        let green_raw = pins.green.is_high();
        let red_raw = pins.red.is_high();
        let input_failed = demand_raw.is_err() || green_raw.is_err() || red_raw.is_err();

        let new_alarm = self.with_state(|s| {
            let mut new_alarm = false;
            match ambient {
                Ok(sample) => {
                    s.noise.push(sample);
                }
                Err(_) => new_alarm |= s.raise(AMBIENT_ALARM),
            }
            if input_failed {
                new_alarm |= s.raise(INPUT_ALARM);
            }

            // A failed read keeps the last confirmed level.
            let demand_level = demand_raw.unwrap_or(s.demand.confirmed());
            let demand = s.demand.update(demand_level, now_ms);
            if demand.rearm {
                s.rearm_pending = true;
            }
            if demand.stuck.is_some() {
                new_alarm |= s.raise(STUCK_ALARM_MESSAGE);
            }

            let green_level = green_raw.unwrap_or(s.green.confirmed());
            if let Some(m) = s.green.update(green_level, now_ms) {
                s.status.green_seconds = m.seconds;
            }
            let red_level = red_raw.unwrap_or(s.red.confirmed());
            if let Some(m) = s.red.update(red_level, now_ms) {
                s.status.red_seconds = m.seconds;
            }

            s.latch.update(demand.confirmed, s.green.confirmed());
            s.status.demand_pressed = demand.confirmed;
            new_alarm
        });

        if new_alarm {
            self.persist.request(PersistKind::Alarms);
        }
    }

    /// One scheduling pass. Clip probing runs outside the critical section.
    pub fn scheduler_pass(
        &self,
        ctx: &mut SchedulerContext,
        catalog: &mut impl ClipCatalog,
        now_ms: u64,
    ) -> SchedulerOutput {
        let live = self.with_state(|s| {
            if ctx.generation != Some(s.config_generation) {
                ctx.configuration = s.configuration.clone();
                ctx.voices = s.profiles.voices().clone();
                ctx.generation = Some(s.config_generation);
            }
            LiveSignals {
                demand_active: s.latch.is_active(),
                green_confirmed: s.green.confirmed(),
                countdown_active: s.green.is_countdown_active(),
                ambient: s.noise.average(),
                rearm: core::mem::take(&mut s.rearm_pending),
                test_clip: s.test_clip.take(),
            }
        });

        if let Some(clip) = live.test_clip {
            info!("[SCHED] Test clip {}", clip);
            let request = PlaybackRequest::single(clip, DEFAULT_VOLUME_FACTOR);
            self.requests.signal(request.clone());
            return SchedulerOutput {
                request: Some(request),
                ..SchedulerOutput::default()
            };
        }

        if live.rearm {
            ctx.scheduler.rearm_request();
        }

        let inputs = SchedulerInputs {
            profile: &ctx.configuration.profile,
            voices: &ctx.voices,
            demand_active: live.demand_active,
            green_confirmed: live.green_confirmed,
            countdown_active: live.countdown_active,
            voice: self.voice.take(),
            ambient: live.ambient,
            playing: self.playback.is_busy(),
            now_ms,
        };
        let out = ctx.scheduler.pass(&inputs, catalog);

        for fault in &out.faults {
            let mut message: String<64> = String::new();
            let _ = write!(message, "Clip unavailable: {}", fault.clip);
            self.raise_alarm(&message);
        }
        if out.stop {
            self.stop.request();
        }
        if let Some(request) = &out.request {
            self.requests.signal(request.clone());
        }
        out
    }

    /// 1 s tick: countdown step, plan re-resolution, wall clock.
    pub fn clock_tick(&self, plan: &impl PlanSource) {
        let voice = self.with_state(|s| {
            let profile = &s.configuration.profile;
            let (from, to) = (profile.green_count_from, profile.green_count_to);
            let voice = s.countdown.tick(&mut s.green, from, to);

            let next = s.profiles.current(plan, &s.time);
            if next != s.configuration {
                if next.profile_index != s.configuration.profile_index {
                    info!("[CLOCK] Active profile {} at {}", next.profile_index, s.time);
                }
                s.configuration = next;
                s.config_generation = s.config_generation.wrapping_add(1);
            }

            s.time.tick();
            voice
        });

        if let Some(count) = voice {
            self.voice.publish(count);
        }
    }

    /// Wait for the next playback request and play it.
    pub async fn playback_step(&self, player: &mut impl ClipPlayer) {
        let request = self.requests.wait().await;
        if let Err(e) = run_request(player, &request, &self.stop, &self.playback).await {
            warn!("[AUDIO] {} failed: {}", request.first, e);
            let mut message: String<64> = String::new();
            let _ = write!(message, "Playback failed: {}", request.first);
            self.raise_alarm(&message);
        }
    }

    /// Commit every pending write. Failed writes stay pending.
    pub fn persist_pass(&self, store: &mut impl BlobStore) -> PendingWrites {
        let pending = self.persist.take();

        if pending.contains(PersistKind::Profiles) {
            let profiles = self.with_state(|s| s.profiles.profiles().clone());
            let failed = profiles
                .iter()
                .zip(PROFILE_KEYS)
                .any(|(profile, key)| storage::save(store, key, profile).is_err());
            if failed {
                self.commit_failed(PersistKind::Profiles);
            }
        }
        if pending.contains(PersistKind::Voices) {
            let voices = self.with_state(|s| s.voice_names.clone());
            if storage::save(store, VOICES_KEY, &voices).is_err() {
                self.commit_failed(PersistKind::Voices);
            }
        }
        if pending.contains(PersistKind::Alarms) {
            let alarms = self.with_state(|s| s.alarms.clone());
            if storage::save(store, ALARM_KEY, &alarms).is_err() {
                self.commit_failed(PersistKind::Alarms);
            }
        }
        pending
    }

    fn commit_failed(&self, kind: PersistKind) {
        self.persist.retry(kind);
        let added = self.with_state(|s| s.raise("Flash write failed"));
        if added {
            info!("[FLASH] Write failure logged");
        }
    }

    pub async fn wait_persist(&self) {
        self.persist.wait().await
    }

    pub fn has_pending_writes(&self) -> bool {
        self.persist.has_pending()
    }

    /// Replace a stored profile and schedule the write.
    pub fn update_profile(&self, index: usize, profile: AudioProfile) -> bool {
        let stored = self.with_state(|s| {
            let stored = s.profiles.set_profile(index, profile);
            if stored {
                s.config_generation = s.config_generation.wrapping_add(1);
            }
            stored
        });
        if stored {
            self.persist.request(PersistKind::Profiles);
        }
        stored
    }

    /// Replace the countdown voice names and rebuild the lookup table.
    pub fn update_voices(&self, voices: VoiceSet) {
        self.with_state(|s| {
            s.profiles.set_voices(&voices);
            s.voice_names = voices;
            s.config_generation = s.config_generation.wrapping_add(1);
        });
        self.persist.request(PersistKind::Voices);
    }

    /// Queue a clip to be played at the next scheduler pass. Sentinel names are ignored.
    pub fn request_test_clip(&self, name: ClipName) -> bool {
        if configured(&name).is_none() {
            return false;
        }
        self.with_state(|s| s.test_clip = Some(name));
        true
    }

    pub fn remove_alarm(&self, message: &str) -> bool {
        let removed = self.with_state(|s| s.alarms.remove(message));
        if removed {
            self.persist.request(PersistKind::Alarms);
        }
        removed
    }

    pub fn clear_alarms(&self) {
        self.with_state(|s| s.alarms.clear());
        self.persist.request(PersistKind::Alarms);
    }

    pub fn alarms_json<W: Write>(&self, out: &mut W) -> core::fmt::Result {
        self.with_state(|s| s.alarms.write_json(out))
    }

    /// Set the wall clock. Out-of-range times are refused and the clock keeps running.
    pub fn set_time(&self, time: DeviceTime) -> bool {
        if !time.is_valid() {
            warn!("[CLOCK] Ignoring invalid time {}", time);
            return false;
        }
        self.with_state(|s| s.time = time);
        true
    }

    pub fn time(&self) -> DeviceTime {
        self.with_state(|s| s.time)
    }

    pub fn status(&self) -> DeviceStatus {
        self.with_state(|s| s.status)
    }

    pub fn noise_history(&self) -> [u8; NOISE_HISTORY_LEN] {
        self.with_state(|s| *s.noise.history())
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    pub fn playback_status(&self) -> &PlaybackStatus {
        &self.playback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_config::{FixedPlan, clip_name};
    use crate::storage::FlashBlobStore;
    use crate::storage::tests::MemFlash;
    use core::convert::Infallible;
    use embedded_hal::digital::ErrorType;

    struct Level(bool);

    impl ErrorType for Level {
        type Error = Infallible;
    }

    impl InputPin for Level {
        fn is_high(&mut self) -> Result<bool, Self::Error> {
            Ok(self.0)
        }

        fn is_low(&mut self) -> Result<bool, Self::Error> {
            Ok(!self.0)
        }
    }

    struct Quiet;

    impl AmbientSensor for Quiet {
        fn read_average(&mut self, _samples: u32) -> Result<u32, ControllerError> {
            Ok(1000)
        }
    }

    struct Broken;

    impl AmbientSensor for Broken {
        fn read_average(&mut self, _samples: u32) -> Result<u32, ControllerError> {
            Err(ControllerError::Input)
        }
    }

    struct OneSecond;

    impl ClipCatalog for OneSecond {
        fn duration_ms(&mut self, _name: &str) -> Result<u64, ControllerError> {
            Ok(1000)
        }
    }

    const KEYS: [&str; 6] = ["defconf", "alt1conf", "alt2conf", "alt3conf", "audio_configs", "alarm_logs"];

    fn pins(green: bool, demand: bool) -> FeedbackPins<Level, Level, Level> {
        FeedbackPins {
            green: Level(green),
            red: Level(false),
            demand: Level(demand),
        }
    }

    #[test]
    fn demand_press_latches_until_green() {
        let controller = Controller::new();
        let mut now = 0;
        for _ in 0..5 {
            now += 50;
            controller.io_pass(&mut pins(false, true), &mut Quiet, now);
        }
        assert!(controller.with_state(|s| s.latch.is_active()));
        assert!(controller.status().demand_pressed);

        for _ in 0..3 {
            now += 50;
            controller.io_pass(&mut pins(true, false), &mut Quiet, now);
        }
        assert!(!controller.with_state(|s| s.latch.is_active()));
    }

    #[test]
    fn sensor_failure_is_logged_once_and_persisted() {
        let controller = Controller::new();
        controller.io_pass(&mut pins(false, false), &mut Broken, 50);
        controller.io_pass(&mut pins(false, false), &mut Broken, 100);
        assert_eq!(controller.with_state(|s| s.alarms.count()), 1);
        assert!(controller.has_pending_writes());
    }

    #[test]
    fn config_survives_restart() {
        let mut store = FlashBlobStore::new(MemFlash::new(KEYS.len()), 0, &KEYS);
        let controller = Controller::new();
        let mut profile = AudioProfile::default();
        profile.idle_active = true;
        profile.idle_sound = clip_name("idle.wav");
        assert!(controller.update_profile(1, profile.clone()));
        controller.raise_alarm("SD card missing");
        controller.persist_pass(&mut store);
        assert!(!controller.has_pending_writes());

        let restarted = Controller::new();
        restarted.load(&mut store);
        restarted.clock_tick(&FixedPlan(1));
        let active = restarted.with_state(|s| s.configuration.clone());
        assert_eq!(active.profile_index, 1);
        assert_eq!(active.profile, profile);
        assert_eq!(restarted.with_state(|s| s.alarms.count()), 1);
    }

    #[test]
    fn failed_write_stays_pending() {
        let mut flash = MemFlash::new(KEYS.len());
        flash.fail_writes = true;
        let mut store = FlashBlobStore::new(flash, 0, &KEYS);
        let controller = Controller::new();
        controller.clear_alarms();
        let pending = controller.persist_pass(&mut store);
        assert!(pending.contains(PersistKind::Alarms));
        assert!(controller.has_pending_writes());
        assert_eq!(controller.with_state(|s| s.alarms.count()), 1);
    }

    #[test]
    fn invalid_time_is_refused() {
        let controller = Controller::new();
        let valid = DeviceTime::new(25, 6, 10, 8, 0, 0);
        assert!(controller.set_time(valid));
        assert!(!controller.set_time(DeviceTime::new(25, 6, 10, 8, 0, 255)));
        controller.clock_tick(&FixedPlan(0));
        assert_eq!(controller.time(), DeviceTime::new(25, 6, 10, 8, 0, 1));
    }

    #[test]
    fn test_clip_preempts_scheduling() {
        let controller = Controller::new();
        let mut ctx = SchedulerContext::new();
        assert!(!controller.request_test_clip(clip_name("-")));
        assert!(controller.request_test_clip(clip_name("test.wav")));
        let out = controller.scheduler_pass(&mut ctx, &mut OneSecond, 1000);
        assert_eq!(out.request.map(|r| r.first), Some(clip_name("test.wav")));
        let out = controller.scheduler_pass(&mut ctx, &mut OneSecond, 1010);
        assert!(out.request.is_none());
    }

    /// Controller whose second green cycle carries a 12 s countdown.
    fn counting_controller() -> Controller {
        let controller = Controller::new();
        let mut profile = AudioProfile::default();
        profile.green_active = true;
        profile.green_count_from = 10;
        controller.update_profile(0, profile);
        controller.clock_tick(&FixedPlan(0));

        let mut now = 0u64;
        let mut hold = |green: bool, ms: u64| {
            let end = now + ms;
            while now < end {
                now += 50;
                controller.io_pass(&mut pins(green, false), &mut Quiet, now);
            }
        };
        hold(false, 3000);
        hold(true, 12_000);
        hold(false, 30_000);
        hold(true, 1000);
        assert!(controller.with_state(|s| s.green.is_countdown_active()));
        assert_eq!(controller.with_state(|s| s.green.countdown_current()), 12);
        controller
    }

    #[test]
    fn countdown_values_reach_the_scheduler() {
        let controller = counting_controller();
        let mut ctx = SchedulerContext::new();
        controller.clock_tick(&FixedPlan(0)); // 11, silent
        assert!(controller.scheduler_pass(&mut ctx, &mut OneSecond, 100_000).request.is_none());
        controller.clock_tick(&FixedPlan(0)); // 10, spoken
        let out = controller.scheduler_pass(&mut ctx, &mut OneSecond, 101_000);
        assert!(out.flags.green_counter);
        assert_eq!(out.request.map(|r| r.first), Some(clip_name("10.wav")));
    }

    #[test]
    fn countdown_voices_wait_while_speaker_busy() {
        let controller = counting_controller();
        let mut ctx = SchedulerContext::new();
        controller.playback_status().set_busy(true);
        for second in 0..3u64 {
            controller.clock_tick(&FixedPlan(0)); // 11, 10, 9
            let out = controller.scheduler_pass(&mut ctx, &mut OneSecond, 100_000 + second * 1000);
            assert!(out.request.is_none());
        }

        controller.playback_status().set_busy(false);
        let out = controller.scheduler_pass(&mut ctx, &mut OneSecond, 103_000);
        assert_eq!(out.request.map(|r| r.first), Some(clip_name("10.wav")));
        let out = controller.scheduler_pass(&mut ctx, &mut OneSecond, 104_000);
        assert_eq!(out.request.map(|r| r.first), Some(clip_name("9.wav")));
    }
}
