//! The beat driven scheduler of the automatic light show.
//!
//! Lighting and animations are two independent tracks. Each track counts
//! down the beats of its current selection and is reselected when the
//! count runs out, when no beat arrived for too long (dead time), or when
//! a calm selection has been shown for too long (boredom).

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Weak;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::catalog::{Animation, Palette};
use crate::config::{AutoModeConfiguration, ModeCharacter, SharedConfig, TimingConstraint};
use crate::selection::{
    next_animations, next_lighting, AnimationsInstruction, LightingInstruction, SwitchReason,
};

/// Default period of the scheduler loop.
pub const TICK_PERIOD: Duration = Duration::from_millis(5);

/// Whatever the engine drives. Implemented by the visual manager.
pub trait SwitchTarget: Send + Sync {
    fn apply_lighting(&self, instruction: LightingInstruction);
    fn apply_animation(&self, instruction: AnimationsInstruction);
    /// Called on every logical beat.
    fn trigger_beat(&self);
    /// Whether a beat arrived since the last call.
    fn beat_state(&self) -> bool;
    fn animations(&self) -> Vec<Animation>;
    fn palettes(&self) -> Vec<Palette>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum TrackKind {
    Lighting,
    Animation,
}

const TRACKS: [TrackKind; 2] = [TrackKind::Lighting, TrackKind::Animation];

#[derive(Clone, Debug)]
struct Track {
    beats_left: i64,
    dead_time: Option<Instant>,
    boredom: Option<Instant>,
    character: ModeCharacter,
}

impl Default for Track {
    fn default() -> Track {
        Track {
            beats_left: 0,
            dead_time: None,
            boredom: None,
            character: ModeCharacter::Calm,
        }
    }
}

impl Track {
    fn is_calm(&self) -> bool {
        self.character == ModeCharacter::Calm
    }
}

pub struct AutoModeEngine {
    config: SharedConfig,
    lighting: Track,
    animation: Track,
    last_beat: Option<Instant>,
    rng: StdRng,
    dirty: bool,
}

impl AutoModeEngine {
    pub fn new(config: SharedConfig) -> AutoModeEngine {
        AutoModeEngine::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: SharedConfig, rng: StdRng) -> AutoModeEngine {
        AutoModeEngine {
            config,
            lighting: Track::default(),
            animation: Track::default(),
            last_beat: None,
            rng,
            // The first tick makes an initial selection.
            dirty: true,
        }
    }

    /// Reselects both tracks on the next tick.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn track_mut(&mut self, kind: TrackKind) -> &mut Track {
        match kind {
            TrackKind::Lighting => &mut self.lighting,
            TrackKind::Animation => &mut self.animation,
        }
    }

    fn timing(config: &AutoModeConfiguration, kind: TrackKind, character: ModeCharacter) -> TimingConstraint {
        match kind {
            TrackKind::Lighting => config.lighting_timing(character),
            TrackKind::Animation => config.animation_timing(character),
        }
    }

    fn boring_after(config: &AutoModeConfiguration, kind: TrackKind) -> Duration {
        match kind {
            TrackKind::Lighting => config.lighting_calm_mode_boring,
            TrackKind::Animation => config.animation_calm_mode_boring,
        }
    }

    /// Runs one scheduler step at time `now`.
    pub fn tick(&mut self, now: Instant, target: &dyn SwitchTarget) {
        let config = self.config.snapshot();

        if self.dirty {
            self.dirty = false;
            self.last_beat = None;
            for kind in TRACKS {
                *self.track_mut(kind) = Track::default();
                self.reselect(kind, SwitchReason::InCalmMode, now, &config, target);
            }
        }

        // Always read so the edge is consumed, even when beats are ignored.
        let raw_beat = target.beat_state();
        let debounced = self
            .last_beat
            .map_or(true, |last| now.saturating_duration_since(last) >= config.min_time_between_beats);
        if raw_beat && !config.mood.is_calm() && debounced {
            self.on_beat(now, &config, target);
        }

        for kind in TRACKS {
            let track = self.track_mut(kind);
            if track.dead_time.map_or(false, |deadline| now >= deadline) {
                track.dead_time = None;
                self.reselect(kind, SwitchReason::InDeadTime, now, &config, target);
            }
        }

        for kind in TRACKS {
            let track = self.track_mut(kind);
            let bored = track.is_calm() && track.boredom.map_or(false, |deadline| now >= deadline);
            if bored {
                self.reselect(kind, SwitchReason::InCalmMode, now, &config, target);
            }
        }
    }

    fn on_beat(&mut self, now: Instant, config: &AutoModeConfiguration, target: &dyn SwitchTarget) {
        self.last_beat = Some(now);
        target.trigger_beat();

        for kind in TRACKS {
            let track = self.track_mut(kind);
            track.beats_left -= 1;
            if track.beats_left <= 0 {
                let reason = if track.is_calm() {
                    SwitchReason::FirstBeat
                } else {
                    SwitchReason::OnBeat
                };
                self.reselect(kind, reason, now, config, target);
            } else {
                let timing = Self::timing(config, kind, track.character);
                track.dead_time = Some(now + timing.no_beat_dead_time);
            }
        }
    }

    fn reselect(
        &mut self,
        kind: TrackKind,
        reason: SwitchReason,
        now: Instant,
        config: &AutoModeConfiguration,
        target: &dyn SwitchTarget,
    ) {
        let character = match kind {
            TrackKind::Lighting => {
                let palettes = target.palettes();
                match next_lighting(config, reason, &palettes, &mut self.rng) {
                    Ok(instruction) => {
                        let character = instruction.character;
                        target.apply_lighting(instruction);
                        character
                    }
                    Err(e) => {
                        warn!("lighting selection failed: {}", e);
                        return;
                    }
                }
            }
            TrackKind::Animation => {
                let animations = target.animations();
                let instruction = next_animations(config, reason, &animations, &mut self.rng);
                let character = instruction.character;
                target.apply_animation(instruction);
                character
            }
        };
        debug!("{:?} switched to {:?} ({:?})", kind, character, reason);

        let timing = Self::timing(config, kind, character);
        let boring_after = Self::boring_after(config, kind);
        let beats = if reason.is_beat() {
            i64::from(timing.draw_beats(&mut self.rng))
        } else {
            // A calm track wakes up on the next logical beat.
            0
        };

        let track = self.track_mut(kind);
        track.character = character;
        track.beats_left = beats;
        track.dead_time = reason.is_beat().then(|| now + timing.no_beat_dead_time);
        track.boredom = (character == ModeCharacter::Calm).then(|| now + boring_after);
    }

    /// Moves the engine onto its own thread, ticking every `period`.
    ///
    /// The thread ends when the handle is stopped or dropped, or when the
    /// target is gone.
    pub fn spawn(mut self, target: Weak<dyn SwitchTarget>, period: Duration) -> SchedulerHandle {
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            info!("auto mode started");
            loop {
                match rx.recv_timeout(period) {
                    Ok(SchedulerMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    Ok(SchedulerMsg::MarkDirty) => self.mark_dirty(),
                    Err(RecvTimeoutError::Timeout) => (),
                }
                let Some(target) = target.upgrade() else {
                    break;
                };
                self.tick(Instant::now(), target.as_ref());
            }
            info!("auto mode stopped");
        });

        SchedulerHandle {
            thread: Some(thread),
            tx,
        }
    }
}

enum SchedulerMsg {
    Shutdown,
    MarkDirty,
}

pub struct SchedulerHandle {
    thread: Option<thread::JoinHandle<()>>,
    tx: mpsc::Sender<SchedulerMsg>,
}

impl SchedulerHandle {
    pub fn mark_dirty(&self) {
        let _ = self.tx.send(SchedulerMsg::MarkDirty);
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(SchedulerMsg::Shutdown);
        if let Some(handle) = self.thread.take() {
            // The last owner of the target may be the scheduler thread itself.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if let Err(err) = handle.join() {
                warn!("error while joining auto mode: {:?}", err);
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
