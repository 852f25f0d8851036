//! Playback scheduler
//!
//! Runs every 10 ms. Each pass first resolves which announcement classes may
//! play from the profile flags and the live demand/green signals (the case
//! table in [`resolve_play_flags`]), then applies the timing rules:
//!
//! - at least `MIN_SILENCE_MS` between two idle/request clips,
//! - periodic requests no more often than their configured delay,
//! - one-shot requests once per demand episode,
//! - idle only when a whole idle clip fits before the next request is due.
//!
//! Clip lengths are booked in `last_sound_end_ms` when a clip is handed out,
//! so the next decision never overlaps a sequence that is still playing.
//! Green announcements (green sound, countdown voices, green action) bypass
//! the idle/request gates and take the pass when they hand out a clip.
//! Countdown voices queue up while the speaker is busy and go out in order.

use crate::ControllerError;
use crate::audio_config::{AudioProfile, ClipName, CountdownVoices, RequestPeriod, configured};
use crate::config::{MIN_SILENCE_MS, REQUEST_SEQUENCE_GAP_MS};
use crate::playback::{ClipCatalog, PlaybackRequest};
use heapless::{Deque, Vec};
use log::{info, warn};

/// Profile switches that select a row of the case table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayModes {
    pub idle: bool,
    pub idle_continues: bool,
    pub request: bool,
    pub green: bool,
}

impl PlayModes {
    pub fn of(profile: &AudioProfile) -> Self {
        Self {
            idle: profile.idle_active,
            idle_continues: profile.idle_continues_after_request,
            request: profile.request_active,
            green: profile.green_active,
        }
    }
}

/// Classes allowed to play in this pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayFlags {
    pub idle: bool,
    pub request: bool,
    pub green_counter: bool,
    /// Green override in force; anything playing must be cut off
    pub interrupt: bool,
}

/// Map profile switches and live signals to the classes allowed to play.
pub fn resolve_play_flags(modes: PlayModes, demand_active: bool, green_confirmed: bool) -> PlayFlags {
    let (idle, request) = match (modes.idle, modes.idle_continues, modes.request) {
        // idle until a demand arrives
        (true, false, false) => (!demand_active, false),
        // idle regardless of demand
        (true, true, false) => (true, false),
        // idle only while a demand is pending
        (false, true, false) => (demand_active, false),
        (false, false, false) => (false, false),
        (true, true, true) => (true, demand_active),
        (false, false, true) => (false, demand_active),
        (false, true, true) => (demand_active, demand_active),
        // request replaces idle
        (true, false, true) => (!demand_active, demand_active),
    };

    if modes.green && green_confirmed {
        return PlayFlags {
            idle: false,
            request: false,
            green_counter: true,
            interrupt: true,
        };
    }
    PlayFlags {
        idle,
        request,
        green_counter: false,
        interrupt: false,
    }
}

/// Live inputs to one scheduling pass
#[derive(Debug, Clone, Copy)]
pub struct SchedulerInputs<'a> {
    pub profile: &'a AudioProfile,
    pub voices: &'a CountdownVoices,
    pub demand_active: bool,
    pub green_confirmed: bool,
    pub countdown_active: bool,
    /// Countdown value handed over by the clock tick since the last pass
    pub voice: Option<u32>,
    /// Rolling ambient ADC average
    pub ambient: u32,
    /// The playback task is running a request
    pub playing: bool,
    pub now_ms: u64,
}

/// A clip that could not be measured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipFault {
    pub clip: ClipName,
    pub error: ControllerError,
}

/// Decisions of one pass
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchedulerOutput {
    pub flags: PlayFlags,
    /// Replaces any request the playback task has not started yet
    pub request: Option<PlaybackRequest>,
    /// Raise the stop flag
    pub stop: bool,
    pub faults: Vec<ClipFault, 4>,
}

/// Countdown values waiting for the speaker
const VOICE_QUEUE_LEN: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct PlaybackScheduler {
    last_sound_end_ms: u64,
    last_request_end_ms: Option<u64>,
    idle_cache: Option<(ClipName, Option<u64>)>,
    request_played_once: bool,
    green_voice_played: bool,
    action_armed: bool,
    override_active: bool,
    pending_voices: Deque<u32, VOICE_QUEUE_LEN>,
}

impl PlaybackScheduler {
    pub const fn new() -> Self {
        Self {
            last_sound_end_ms: 0,
            last_request_end_ms: None,
            idle_cache: None,
            request_played_once: false,
            green_voice_played: false,
            action_armed: false,
            override_active: false,
            pending_voices: Deque::new(),
        }
    }

    /// A new demand episode started: a one-shot request may play again.
    pub fn rearm_request(&mut self) {
        self.request_played_once = false;
    }

    pub fn last_sound_end_ms(&self) -> u64 {
        self.last_sound_end_ms
    }

    pub fn pass(&mut self, inputs: &SchedulerInputs<'_>, catalog: &mut impl ClipCatalog) -> SchedulerOutput {
        let profile = inputs.profile;
        let flags = resolve_play_flags(
            PlayModes::of(profile),
            inputs.demand_active,
            inputs.green_confirmed,
        );
        let mut out = SchedulerOutput {
            flags,
            ..SchedulerOutput::default()
        };

        if flags.interrupt && !self.override_active {
            info!("[SCHED] Green override, interrupting playback");
            out.stop = true;
            // the booked clip is being cut off
            self.last_sound_end_ms = self.last_sound_end_ms.min(inputs.now_ms);
        }
        self.override_active = flags.interrupt;

        self.green_announcements(inputs, flags, catalog, &mut out);
        if out.request.is_none() {
            self.idle_and_request(inputs, flags, catalog, &mut out);
        }
        out
    }

    fn idle_and_request(
        &mut self,
        inputs: &SchedulerInputs<'_>,
        flags: PlayFlags,
        catalog: &mut impl ClipCatalog,
        out: &mut SchedulerOutput,
    ) {
        let profile = inputs.profile;
        let now = inputs.now_ms;
        let is_playing = now < self.last_sound_end_ms || inputs.playing;
        let silence_passed = now >= self.last_sound_end_ms + MIN_SILENCE_MS;
        let idle_volume = profile.idle_volume.factor(inputs.ambient);

        if flags.idle {
            self.refresh_idle_cache(profile, catalog, out);
        }

        match (flags.request, profile.request_period()) {
            (true, RequestPeriod::Every(delay)) => {
                let next_request = match self.last_request_end_ms {
                    None => now,
                    Some(end) => (end + delay).max(self.last_sound_end_ms + MIN_SILENCE_MS),
                };
                if is_playing || !silence_passed {
                    return;
                }
                if now >= next_request {
                    let request = self.request_sequence(inputs, catalog, out);
                    out.request = request;
                } else if flags.idle {
                    // Idle only fills the gap if it ends before the request is due.
                    if let Some((name, Some(duration))) = &self.idle_cache {
                        if next_request - now > *duration {
                            info!("[SCHED] Idle {} before next request", name);
                            out.request = Some(PlaybackRequest::single(name.clone(), idle_volume));
                            self.last_sound_end_ms = now + duration;
                        }
                    }
                }
            }
            (true, RequestPeriod::Once) if !self.request_played_once => {
                if is_playing || !silence_passed {
                    return;
                }
                let request = self.request_sequence(inputs, catalog, out);
                out.request = request;
                self.request_played_once = true;
            }
            _ if flags.idle => {
                if is_playing || !silence_passed {
                    return;
                }
                if let Some((name, Some(duration))) = &self.idle_cache {
                    info!("[SCHED] Idle {}", name);
                    out.request = Some(PlaybackRequest::single(name.clone(), idle_volume));
                    self.last_sound_end_ms = now + duration;
                }
            }
            _ => {}
        }
    }

    /// Measure the idle clip once per name; failures are remembered too.
    fn refresh_idle_cache(&mut self, profile: &AudioProfile, catalog: &mut impl ClipCatalog, out: &mut SchedulerOutput) {
        let Some(name) = configured(&profile.idle_sound) else {
            self.idle_cache = None;
            return;
        };
        if matches!(&self.idle_cache, Some((cached, _)) if cached == name) {
            return;
        }
        let duration = measure(catalog, name, out);
        self.idle_cache = Some((name.clone(), duration));
    }

    /// Book and build the request sequence. Clips that cannot be measured are left out.
    fn request_sequence(
        &mut self,
        inputs: &SchedulerInputs<'_>,
        catalog: &mut impl ClipCatalog,
        out: &mut SchedulerOutput,
    ) -> Option<PlaybackRequest> {
        let profile = inputs.profile;
        let mut clips: Vec<ClipName, 2> = Vec::new();
        let mut total = 0u64;

        for name in [&profile.request_sound_1, &profile.request_sound_2] {
            let Some(name) = configured(name) else { continue };
            if let Some(duration) = measure(catalog, name, out) {
                if !clips.is_empty() {
                    total += REQUEST_SEQUENCE_GAP_MS;
                }
                total += duration;
                let _ = clips.push(name.clone());
            }
        }

        let mut clips = clips.into_iter();
        let first = clips.next()?;
        let second = clips.next();

        self.last_sound_end_ms = inputs.now_ms + total;
        self.last_request_end_ms = Some(self.last_sound_end_ms);
        info!("[SCHED] Request {} (+{:?}), {}ms booked", first, second, total);

        Some(PlaybackRequest {
            first,
            second,
            volume: profile.request_volume.factor(inputs.ambient),
        })
    }

    fn green_announcements(
        &mut self,
        inputs: &SchedulerInputs<'_>,
        flags: PlayFlags,
        catalog: &mut impl ClipCatalog,
        out: &mut SchedulerOutput,
    ) {
        let profile = inputs.profile;
        let now = inputs.now_ms;
        let busy = inputs.playing || now < self.last_sound_end_ms;
        let green_volume = profile.green_volume.factor(inputs.ambient);

        // Green sound: once per green episode.
        if inputs.green_confirmed && !self.green_voice_played {
            self.green_voice_played = true;
            if let Some(name) = configured(&profile.green_sound) {
                info!("[SCHED] Green sound {}", name);
                self.announce(name, green_volume, now, catalog, out);
            }
        }
        if !inputs.green_confirmed {
            self.green_voice_played = false;
        }

        // Countdown voices wait for the speaker, one at a time.
        if flags.green_counter {
            if let Some(count) = inputs.voice {
                let from = u32::from(profile.green_count_from);
                let to = u32::from(profile.green_count_to);
                if (to..=from).contains(&count) && inputs.voices.get(count).is_some() {
                    if self.pending_voices.is_full() {
                        if let Some(stale) = self.pending_voices.pop_front() {
                            warn!("[SCHED] Speaker busy, dropping countdown voice {}", stale);
                        }
                    }
                    let _ = self.pending_voices.push_back(count);
                }
            }
            if out.request.is_none() && !busy {
                if let Some(name) = self.pending_voices.pop_front().and_then(|c| inputs.voices.get(c)) {
                    info!("[SCHED] Countdown voice {}", name);
                    self.announce(name, green_volume, now, catalog, out);
                }
            }
        } else {
            self.pending_voices.clear();
        }

        // Green action: after a countdown ends and green is dark again.
        if inputs.countdown_active {
            self.action_armed = true;
        } else if self.action_armed && !inputs.green_confirmed && out.request.is_none() && !busy {
            self.action_armed = false;
            if let Some(name) = configured(&profile.green_action) {
                info!("[SCHED] Green action {}", name);
                self.announce(name, green_volume, now, catalog, out);
            }
        }
    }

    /// Hand out a single clip and book its length. Clips that cannot be measured are skipped.
    fn announce(
        &mut self,
        name: &ClipName,
        volume: f32,
        now: u64,
        catalog: &mut impl ClipCatalog,
        out: &mut SchedulerOutput,
    ) {
        if let Some(duration) = measure(catalog, name, out) {
            out.request = Some(PlaybackRequest::single(name.clone(), volume));
            self.last_sound_end_ms = now + duration;
        }
    }
}

fn measure(catalog: &mut impl ClipCatalog, name: &ClipName, out: &mut SchedulerOutput) -> Option<u64> {
    match catalog.duration_ms(name) {
        Ok(duration) => Some(duration),
        Err(error) => {
            warn!("[SCHED] Skipping {}: {}", name, error);
            let _ = out.faults.push(ClipFault {
                clip: name.clone(),
                error,
            });
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_config::{VoiceSet, clip_name};

    /// Every clip lasts `duration` except the ones listed as missing.
    struct FixedCatalog {
        duration: u64,
        missing: &'static [&'static str],
        lookups: usize,
    }

    impl FixedCatalog {
        fn new(duration: u64) -> Self {
            Self {
                duration,
                missing: &[],
                lookups: 0,
            }
        }
    }

    impl ClipCatalog for FixedCatalog {
        fn duration_ms(&mut self, name: &str) -> Result<u64, ControllerError> {
            self.lookups += 1;
            if self.missing.contains(&name) {
                Err(ControllerError::ClipNotFound)
            } else {
                Ok(self.duration)
            }
        }
    }

    fn profile(idle: bool, cont: bool, req: bool, period: u8) -> AudioProfile {
        AudioProfile {
            idle_active: idle,
            idle_continues_after_request: cont,
            request_active: req,
            green_active: true,
            idle_sound: clip_name("idle.wav"),
            request_sound_1: clip_name("req1.wav"),
            request_sound_2: clip_name("-"),
            request_period: period,
            green_sound: clip_name("-"),
            green_action: clip_name("-"),
            green_count_from: 10,
            green_count_to: 0,
            ..AudioProfile::default()
        }
    }

    struct Bench {
        scheduler: PlaybackScheduler,
        profile: AudioProfile,
        voices: CountdownVoices,
        catalog: FixedCatalog,
        demand: bool,
        green: bool,
        countdown: bool,
        playing: bool,
        now: u64,
    }

    impl Bench {
        fn new(profile: AudioProfile, clip_ms: u64) -> Self {
            Self {
                scheduler: PlaybackScheduler::new(),
                profile,
                voices: CountdownVoices::new(&VoiceSet::default()),
                catalog: FixedCatalog::new(clip_ms),
                demand: false,
                green: false,
                countdown: false,
                playing: false,
                now: 1000,
            }
        }

        fn pass_with_voice(&mut self, voice: Option<u32>) -> SchedulerOutput {
            let inputs = SchedulerInputs {
                profile: &self.profile,
                voices: &self.voices,
                demand_active: self.demand,
                green_confirmed: self.green,
                countdown_active: self.countdown,
                voice,
                ambient: 0,
                playing: self.playing,
                now_ms: self.now,
            };
            self.scheduler.pass(&inputs, &mut self.catalog)
        }

        fn pass(&mut self) -> SchedulerOutput {
            self.pass_with_voice(None)
        }

        /// Run 10 ms passes for `ms`, collecting the names handed out.
        fn run(&mut self, ms: u64) -> std::vec::Vec<(u64, std::string::String)> {
            let mut played = std::vec::Vec::new();
            let end = self.now + ms;
            while self.now < end {
                if let Some(request) = self.pass().request {
                    played.push((self.now, request.first.as_str().into()));
                }
                self.now += 10;
            }
            played
        }
    }

    fn first(out: SchedulerOutput) -> Option<std::string::String> {
        out.request.map(|r| r.first.as_str().into())
    }

    fn names(played: &[(u64, std::string::String)]) -> std::vec::Vec<&str> {
        played.iter().map(|(_, n)| n.as_str()).collect()
    }

    #[test]
    fn case_table_without_green() {
        let rows = [
            // idle, cont, req -> (idle, req) without demand, (idle, req) with demand
            ((true, false, false), (true, false), (false, false)),
            ((true, true, false), (true, false), (true, false)),
            ((false, true, false), (false, false), (true, false)),
            ((false, false, false), (false, false), (false, false)),
            ((true, true, true), (true, false), (true, true)),
            ((false, false, true), (false, false), (false, true)),
            ((false, true, true), (false, false), (true, true)),
            ((true, false, true), (true, false), (false, true)),
        ];
        for ((idle, cont, req), quiet, demanded) in rows {
            let modes = PlayModes {
                idle,
                idle_continues: cont,
                request: req,
                green: true,
            };
            let f = resolve_play_flags(modes, false, false);
            assert_eq!((f.idle, f.request), quiet, "{:?} without demand", modes);
            let f = resolve_play_flags(modes, true, false);
            assert_eq!((f.idle, f.request), demanded, "{:?} with demand", modes);
            assert!(!f.green_counter && !f.interrupt);
        }
    }

    #[test]
    fn green_override_wins_every_case() {
        for bits in 0u8..8 {
            let modes = PlayModes {
                idle: bits & 4 != 0,
                idle_continues: bits & 2 != 0,
                request: bits & 1 != 0,
                green: true,
            };
            for demand in [false, true] {
                let f = resolve_play_flags(modes, demand, true);
                assert!(f.green_counter && f.interrupt);
                assert!(!f.idle && !f.request);
            }
        }
    }

    #[test]
    fn green_ignored_when_not_configured() {
        let modes = PlayModes {
            idle: true,
            idle_continues: true,
            request: false,
            green: false,
        };
        let f = resolve_play_flags(modes, false, true);
        assert!(f.idle && !f.green_counter && !f.interrupt);
    }

    #[test]
    fn idle_repeats_with_minimum_silence() {
        let mut bench = Bench::new(profile(true, false, false, 0), 1500);
        let played = bench.run(5000);
        let starts: std::vec::Vec<u64> = played.iter().map(|(t, _)| *t).collect();
        assert_eq!(starts, [1000, 3200, 5400]);
        assert_eq!(bench.catalog.lookups, 1, "idle duration is cached");
    }

    #[test]
    fn periodic_request_with_idle_filler() {
        let mut bench = Bench::new(profile(true, true, true, 5), 1000);
        bench.demand = true;
        let played = bench.run(7000);
        // request at once, then idle while 5 s pass, then the request again
        assert_eq!(played[0], (1000, "req1.wav".into()));
        assert_eq!(played[1], (2700, "idle.wav".into()));
        assert!(played.iter().any(|(t, n)| n == "req1.wav" && *t == 7000));
        assert!(!played.iter().any(|(t, n)| n == "idle.wav" && *t > 6300 && *t < 7000));
    }

    #[test]
    fn request_only_respects_period() {
        let mut bench = Bench::new(profile(false, false, true, 1), 500);
        bench.demand = true;
        let played = bench.run(4000);
        let starts: std::vec::Vec<u64> = played.iter().map(|(t, _)| *t).collect();
        // booked end 1500, +1000 period = 2500 > silence gate 2200
        assert_eq!(starts, [1000, 2500, 4000]);
    }

    #[test]
    fn two_clip_request_books_gap() {
        let mut p = profile(false, false, true, 1);
        p.request_sound_2 = clip_name("req2.wav");
        let mut bench = Bench::new(p, 400);
        bench.demand = true;
        let out = bench.pass();
        let request = out.request.unwrap();
        assert_eq!(request.second.as_ref().map(|n| n.as_str()), Some("req2.wav"));
        assert_eq!(bench.scheduler.last_sound_end_ms(), 1000 + 400 + 50 + 400);
    }

    #[test]
    fn one_shot_plays_once_until_rearmed() {
        let mut bench = Bench::new(profile(false, false, true, 0), 500);
        bench.demand = true;
        assert_eq!(names(&bench.run(10_000)), ["req1.wav"]);
        bench.scheduler.rearm_request();
        assert_eq!(names(&bench.run(10_000)), ["req1.wav"]);
    }

    #[test]
    fn one_shot_then_idle_resumes() {
        let mut bench = Bench::new(profile(true, true, true, 0), 500);
        bench.demand = true;
        let played = bench.run(3000);
        assert_eq!(names(&played)[..2], ["req1.wav", "idle.wav"]);
        assert!(!names(&played)[1..].contains(&"req1.wav"));
    }

    #[test]
    fn override_asserts_stop_once() {
        let mut bench = Bench::new(profile(true, false, false, 0), 500);
        bench.green = true;
        assert!(bench.pass().stop);
        bench.now += 10;
        assert!(!bench.pass().stop);
        bench.green = false;
        bench.now += 10;
        assert!(!bench.pass().stop);
        bench.green = true;
        bench.now += 10;
        assert!(bench.pass().stop);
    }

    #[test]
    fn green_sound_once_per_episode() {
        let mut p = profile(false, false, false, 0);
        p.green_sound = clip_name("green.wav");
        let mut bench = Bench::new(p, 500);
        bench.green = true;
        assert_eq!(names(&bench.run(2000)), ["green.wav"]);
        bench.green = false;
        assert!(bench.run(100).is_empty());
        bench.green = true;
        assert_eq!(names(&bench.run(100)), ["green.wav"]);
    }

    #[test]
    fn countdown_voice_only_in_range_and_with_counter_flag() {
        let mut bench = Bench::new(profile(false, false, false, 0), 500);
        bench.green = true;
        bench.pass();
        assert_eq!(
            bench.pass_with_voice(Some(7)).request.map(|r| r.first),
            Some(clip_name("7.wav"))
        );
        assert!(bench.pass_with_voice(Some(11)).request.is_none());
        assert!(bench.pass_with_voice(Some(0)).request.is_none());

        bench.green = false;
        assert!(bench.pass_with_voice(Some(5)).request.is_none());
    }

    #[test]
    fn green_action_after_countdown_ends() {
        let mut p = profile(false, false, false, 0);
        p.green_action = clip_name("walk_end.wav");
        let mut bench = Bench::new(p, 500);
        bench.green = true;
        bench.countdown = true;
        assert!(bench.pass().request.is_none());
        bench.countdown = false;
        assert!(bench.pass().request.is_none(), "green still lit");
        bench.green = false;
        assert_eq!(bench.pass().request.map(|r| r.first), Some(clip_name("walk_end.wav")));
        assert!(bench.pass().request.is_none());
    }

    #[test]
    fn unmeasurable_clips_are_skipped_and_reported() {
        let mut bench = Bench::new(profile(true, false, false, 0), 500);
        bench.catalog.missing = &["idle.wav"];
        let out = bench.pass();
        assert!(out.request.is_none());
        assert_eq!(out.faults.len(), 1);
        assert_eq!(out.faults[0].error, ControllerError::ClipNotFound);
        assert!(bench.run(2000).is_empty());
        assert_eq!(bench.catalog.lookups, 1);
    }

    #[test]
    fn countdown_voice_waits_for_the_speaker() {
        let mut bench = Bench::new(profile(false, false, false, 0), 500);
        bench.green = true;
        bench.countdown = true;
        bench.pass();

        bench.playing = true;
        assert!(bench.pass_with_voice(Some(10)).request.is_none());
        bench.now += 1000;
        assert!(bench.pass_with_voice(Some(9)).request.is_none());

        bench.playing = false;
        bench.now += 10;
        assert_eq!(first(bench.pass()).as_deref(), Some("10.wav"));
        bench.now += 10;
        assert!(bench.pass().request.is_none(), "10 is still playing");
        bench.now += 500;
        assert_eq!(first(bench.pass()).as_deref(), Some("9.wav"));
        bench.now += 500;
        assert!(bench.pass().request.is_none());
    }

    #[test]
    fn green_sound_then_countdown_voice_in_order() {
        let mut p = profile(false, false, false, 0);
        p.green_sound = clip_name("green.wav");
        let mut bench = Bench::new(p, 500);
        bench.green = true;
        bench.countdown = true;
        assert_eq!(first(bench.pass_with_voice(Some(10))).as_deref(), Some("green.wav"));
        bench.now += 500;
        assert_eq!(first(bench.pass()).as_deref(), Some("10.wav"));
    }

    #[test]
    fn green_sound_takes_the_pass_from_request() {
        let mut p = profile(false, false, true, 0);
        p.green_active = false;
        p.green_sound = clip_name("green.wav");
        let mut bench = Bench::new(p, 500);
        bench.green = true;
        bench.demand = true;
        assert_eq!(first(bench.pass()).as_deref(), Some("green.wav"));
        assert_eq!(bench.scheduler.last_sound_end_ms(), 1500);

        // the one-shot request was not spent on the pass the green sound took
        let played = bench.run(2000);
        assert_eq!(names(&played), ["req1.wav"]);
        assert_eq!(played[0].0, 2200);
    }
}
