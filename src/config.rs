//! Auto mode configuration.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::bus_msg::LightingModeId;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LightingMood {
    Happy,
    Moody,
    Regular,
    Party,
}

impl LightingMood {
    pub const ALL: [LightingMood; 4] = [
        LightingMood::Happy,
        LightingMood::Moody,
        LightingMood::Regular,
        LightingMood::Party,
    ];

    /// Whether the mood has exclusively calm character.
    pub fn is_calm(self) -> bool {
        matches!(self, LightingMood::Happy | LightingMood::Moody)
    }

    /// Lighting modes the auto mode may pick for this mood. Never empty.
    pub fn lighting_modes(self) -> &'static [LightingModeId] {
        match self {
            LightingMood::Happy | LightingMood::Moody => {
                &[LightingModeId::FadeToColor, LightingModeId::PaletteFade]
            }
            LightingMood::Regular | LightingMood::Party => &[
                LightingModeId::PaletteSwitch,
                LightingModeId::PaletteBrightnessFlash,
                LightingModeId::PaletteHueFlash,
            ],
        }
    }

    /// Character of an animation picked for this mood.
    pub fn animation_character(self) -> ModeCharacter {
        match self {
            LightingMood::Happy | LightingMood::Moody => ModeCharacter::Calm,
            LightingMood::Regular => ModeCharacter::Rhythmic,
            LightingMood::Party => ModeCharacter::Frantic,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModeCharacter {
    Calm,
    Rhythmic,
    Frantic,
    Unknown,
}

impl LightingModeId {
    pub fn character(self) -> ModeCharacter {
        match self {
            LightingModeId::SetColor | LightingModeId::FadeToColor | LightingModeId::PaletteFade => {
                ModeCharacter::Calm
            }
            LightingModeId::PaletteSwitch
            | LightingModeId::PaletteBrightnessFlash
            | LightingModeId::PaletteHueFlash => ModeCharacter::Rhythmic,
            LightingModeId::Strobe => ModeCharacter::Frantic,
            LightingModeId::Off => ModeCharacter::Unknown,
        }
    }
}

/// How long a character may stay active.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConstraint {
    /// The least number of beats before switching to the next mode.
    pub min_beats: u32,
    /// Upper bound (exclusive) of beats before switching to the next mode.
    pub max_beats: u32,
    /// Time without a beat after which a calmer mode is forced.
    #[serde(with = "millis")]
    pub no_beat_dead_time: Duration,
}

impl TimingConstraint {
    pub fn new(min_beats: u32, max_beats: u32, no_beat_dead_time: Duration) -> TimingConstraint {
        TimingConstraint {
            min_beats,
            max_beats,
            no_beat_dead_time,
        }
    }

    /// Number of beats until the next switch, uniform in `[min_beats, max_beats)`.
    pub fn draw_beats(&self, rng: &mut impl Rng) -> u32 {
        if self.max_beats <= self.min_beats {
            return self.min_beats;
        }
        rng.gen_range(self.min_beats..self.max_beats)
    }
}

/// Odds of the random choices made while selecting visuals.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionOdds {
    /// Probability that both screens of a unit show the same animation.
    pub mirror_screens: f64,
    /// Probability that the second unit mirrors the first.
    pub mirror_units: f64,
    /// One in this many party animation picks blinks with the beat.
    pub party_blink_chance: u32,
    /// Probability of Moody (instead of Happy) when an energetic mood calms down.
    pub calm_downgrade_to_moody: f64,
}

impl Default for SelectionOdds {
    fn default() -> SelectionOdds {
        SelectionOdds {
            mirror_screens: 0.5,
            mirror_units: 0.5,
            party_blink_chance: 7,
            calm_downgrade_to_moody: 0.5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoModeConfiguration {
    pub mood: LightingMood,
    pub allow_nsfw: bool,
    /// One in this many waking beats strobes. 0 disables the strobe.
    pub strobe_chance: u32,
    /// One in this many selections shifts the palette. 0 disables shifting.
    pub hue_shift_chance: u32,
    /// Largest hue rotation in degrees.
    pub hue_shift_max_amount: u16,
    /// How slow the FadeToColor mode operates.
    pub fade_to_color_cycles: u16,
    /// How slow the PaletteFade mode operates.
    pub palette_fade_cycles: u16,
    pub flash_fadeout_speed: u16,
    pub hue_flash_fadeout_speed: u16,
    pub strobe_frequency: u16,
    pub strobe_rolloff: u8,
    pub flash_target_brightness: u8,
    pub flash_hue_shift: u8,
    /// Brightness decrement per beat for blinking screens.
    pub animation_blink_speed: u16,
    #[serde(with = "millis")]
    pub min_time_between_beats: Duration,
    /// How long until calm lighting gets boring.
    #[serde(with = "millis")]
    pub lighting_calm_mode_boring: Duration,
    /// How long until a calm animation gets boring.
    #[serde(with = "millis")]
    pub animation_calm_mode_boring: Duration,
    pub odds: SelectionOdds,
    pub lighting_mode_timing: BTreeMap<ModeCharacter, TimingConstraint>,
    pub animation_mode_timing: BTreeMap<ModeCharacter, TimingConstraint>,
}

impl Default for AutoModeConfiguration {
    fn default() -> AutoModeConfiguration {
        let lighting_mode_timing = BTreeMap::from([
            (
                ModeCharacter::Calm,
                TimingConstraint::new(4, 16, Duration::from_secs(10)),
            ),
            (
                ModeCharacter::Rhythmic,
                TimingConstraint::new(16, 64, Duration::from_secs(3)),
            ),
            (
                ModeCharacter::Frantic,
                TimingConstraint::new(4, 12, Duration::from_secs(1)),
            ),
        ]);
        let animation_mode_timing = BTreeMap::from([
            (
                ModeCharacter::Calm,
                TimingConstraint::new(8, 32, Duration::from_secs(10)),
            ),
            (
                ModeCharacter::Rhythmic,
                TimingConstraint::new(32, 96, Duration::from_secs(4)),
            ),
            (
                ModeCharacter::Frantic,
                TimingConstraint::new(16, 48, Duration::from_secs(2)),
            ),
        ]);
        AutoModeConfiguration {
            mood: LightingMood::Regular,
            allow_nsfw: false,
            strobe_chance: 12,
            hue_shift_chance: 4,
            hue_shift_max_amount: 60,
            fade_to_color_cycles: 600,
            palette_fade_cycles: 400,
            flash_fadeout_speed: 40,
            hue_flash_fadeout_speed: 60,
            strobe_frequency: 12,
            strobe_rolloff: 30,
            flash_target_brightness: 255,
            flash_hue_shift: 32,
            animation_blink_speed: 2000,
            min_time_between_beats: Duration::from_millis(250),
            lighting_calm_mode_boring: Duration::from_secs(45),
            animation_calm_mode_boring: Duration::from_secs(60),
            odds: SelectionOdds::default(),
            lighting_mode_timing,
            animation_mode_timing,
        }
    }
}

/// Used when a character has no entry in the timing maps.
const FALLBACK_TIMING: TimingConstraint = TimingConstraint {
    min_beats: 8,
    max_beats: 32,
    no_beat_dead_time: Duration::from_secs(5),
};

impl AutoModeConfiguration {
    pub fn lighting_timing(&self, character: ModeCharacter) -> TimingConstraint {
        self.lighting_mode_timing
            .get(&character)
            .copied()
            .unwrap_or(FALLBACK_TIMING)
    }

    pub fn animation_timing(&self, character: ModeCharacter) -> TimingConstraint {
        self.animation_mode_timing
            .get(&character)
            .copied()
            .unwrap_or(FALLBACK_TIMING)
    }
}

/// The configuration as owned by the visual manager and read by the engine.
#[derive(Clone, Default)]
pub struct SharedConfig(Arc<Mutex<AutoModeConfiguration>>);

impl SharedConfig {
    pub fn new(config: AutoModeConfiguration) -> SharedConfig {
        SharedConfig(Arc::new(Mutex::new(config)))
    }

    pub fn lock(&self) -> MutexGuard<'_, AutoModeConfiguration> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> AutoModeConfiguration {
        self.lock().clone()
    }
}

/// (De)serializes a `Duration` as whole milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_every_mood_has_modes() {
        for mood in LightingMood::ALL {
            assert!(!mood.lighting_modes().is_empty());
            for mode in mood.lighting_modes() {
                let calm = mode.character() == ModeCharacter::Calm;
                assert_eq!(calm, mood.is_calm(), "{:?} in {:?}", mode, mood);
            }
        }
    }

    #[test]
    fn test_character_mapping() {
        assert_eq!(LightingModeId::PaletteFade.character(), ModeCharacter::Calm);
        assert_eq!(LightingModeId::PaletteHueFlash.character(), ModeCharacter::Rhythmic);
        assert_eq!(LightingModeId::Strobe.character(), ModeCharacter::Frantic);
        assert_eq!(LightingModeId::Off.character(), ModeCharacter::Unknown);
    }

    #[test]
    fn test_empty_range_draws_minimum() {
        let mut rng = StdRng::seed_from_u64(1);
        let constraint = TimingConstraint::new(5, 5, Duration::ZERO);
        assert_eq!(constraint.draw_beats(&mut rng), 5);
    }

    #[test]
    fn test_json_roundtrip_keeps_durations_in_millis() {
        let config = AutoModeConfiguration::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["min_time_between_beats"], 250);
        assert_eq!(json["lighting_mode_timing"]["Calm"]["no_beat_dead_time"], 10_000);
        let back: AutoModeConfiguration = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: AutoModeConfiguration = serde_json::from_str(r#"{"mood":"Party"}"#).unwrap();
        assert_eq!(config.mood, LightingMood::Party);
        assert_eq!(config.odds.party_blink_chance, 7);
    }

    proptest! {
        #[test]
        fn drawn_beats_stay_in_range(min in 0u32..1000, span in 1u32..1000, seed in any::<u64>()) {
            let constraint = TimingConstraint::new(min, min + span, Duration::from_secs(1));
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..32 {
                let beats = constraint.draw_beats(&mut rng);
                prop_assert!(beats >= min && beats < min + span);
            }
        }
    }
}
