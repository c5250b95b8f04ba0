//! Picks the next lighting effect and animations for the auto mode.

use log::debug;
use palette::{FromColor, Hsv, Hue, Srgb};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::bus_msg::{CodecError, Color, LightingEffect, LightingModeId, MessageBlock};
use crate::catalog::{default_palettes, Animation, Palette};
use crate::config::{AutoModeConfiguration, LightingMood, ModeCharacter, SelectionOdds};
use crate::display_msg::{AnimationId, ServerDisplay, UNIT_COUNT};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwitchReason {
    /// A logical beat used up the track's beats.
    OnBeat,
    /// The first beat after the track was calm.
    FirstBeat,
    /// No beat arrived for too long.
    InDeadTime,
    /// The calm selection got boring, or a fresh start was requested.
    InCalmMode,
}

impl SwitchReason {
    pub fn is_beat(self) -> bool {
        matches!(self, SwitchReason::OnBeat | SwitchReason::FirstBeat)
    }
}

/// Mood to select for. Without a live beat energetic moods calm down.
pub fn effective_mood(
    mood: LightingMood,
    reason: SwitchReason,
    odds: &SelectionOdds,
    rng: &mut impl Rng,
) -> LightingMood {
    if reason.is_beat() || mood.is_calm() {
        return mood;
    }
    if rng.gen_bool(odds.calm_downgrade_to_moody.clamp(0.0, 1.0)) {
        LightingMood::Moody
    } else {
        LightingMood::Happy
    }
}

/// An encoded lighting effect ready for the bus.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LightingInstruction {
    pub effect: LightingEffect,
    pub apply_on_beat: bool,
    pub character: ModeCharacter,
    #[serde(skip)]
    pub block: MessageBlock,
}

impl LightingInstruction {
    pub fn new(effect: LightingEffect, apply_on_beat: bool) -> Result<LightingInstruction, CodecError> {
        let block = effect.encode(apply_on_beat)?;
        Ok(LightingInstruction {
            character: effect.mode_id().character(),
            effect,
            apply_on_beat,
            block,
        })
    }
}

/// One animation and the positions it plays on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimationPlacement {
    pub animation: AnimationId,
    pub displays: ServerDisplay,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnimationsInstruction {
    /// Distinct animations, in the order their first position was picked.
    pub placements: Vec<AnimationPlacement>,
    pub character: ModeCharacter,
    /// Brightness decrement per beat, if the screens should blink.
    pub blink_speed: Option<u16>,
}

impl AnimationsInstruction {
    pub fn empty(character: ModeCharacter) -> AnimationsInstruction {
        AnimationsInstruction {
            placements: Vec::new(),
            character,
            blink_speed: None,
        }
    }

    /// Groups per-position picks by animation.
    pub fn from_positions(
        positions: impl IntoIterator<Item = (AnimationId, ServerDisplay)>,
        character: ModeCharacter,
    ) -> AnimationsInstruction {
        let mut placements: Vec<AnimationPlacement> = Vec::new();
        for (animation, display) in positions {
            match placements.iter_mut().find(|p| p.animation == animation) {
                Some(placement) => placement.displays |= display,
                None => placements.push(AnimationPlacement {
                    animation,
                    displays: display,
                }),
            }
        }
        AnimationsInstruction {
            placements,
            character,
            blink_speed: None,
        }
    }

    pub fn displays(&self) -> ServerDisplay {
        self.placements
            .iter()
            .fold(ServerDisplay::NONE, |acc, p| acc | p.displays)
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    /// The same instruction without the given positions.
    pub fn without(&self, excluded: ServerDisplay) -> AnimationsInstruction {
        let placements = self
            .placements
            .iter()
            .map(|p| AnimationPlacement {
                animation: p.animation,
                displays: p.displays.without(excluded),
            })
            .filter(|p| !p.displays.is_empty())
            .collect();
        AnimationsInstruction {
            placements,
            character: self.character,
            blink_speed: self.blink_speed,
        }
    }
}

fn shift_hue(color: Color, degrees: f32) -> Color {
    let rgb: Srgb = Srgb::new(color.red, color.green, color.blue).into_format();
    let hsv: Hsv = Hsv::from_color(rgb);
    let shifted: Srgb = Srgb::from_color(hsv.shift_hue(degrees));
    let shifted: Srgb<u8> = shifted.into_format();
    Color {
        red: shifted.red,
        green: shifted.green,
        blue: shifted.blue,
        ..color
    }
}

fn pick_palette(mood: LightingMood, palettes: &[Palette], rng: &mut impl Rng) -> Palette {
    let eligible: Vec<&Palette> = palettes
        .iter()
        .filter(|p| p.is_for(mood) && !p.colors.is_empty())
        .collect();
    if let Some(palette) = eligible.choose(rng) {
        return (*palette).clone();
    }
    debug!("no palette for {:?}, using defaults", mood);
    let defaults = default_palettes();
    let index = rng.gen_range(0..defaults.len());
    defaults[index].clone()
}

pub fn next_lighting(
    config: &AutoModeConfiguration,
    reason: SwitchReason,
    palettes: &[Palette],
    rng: &mut impl Rng,
) -> Result<LightingInstruction, CodecError> {
    let apply_on_beat = reason.is_beat();

    if reason == SwitchReason::FirstBeat
        && config.strobe_chance > 0
        && rng.gen_ratio(1, config.strobe_chance)
    {
        let strobe = LightingEffect::Strobe {
            color: Color::WHITE,
            frequency: config.strobe_frequency,
            rolloff: config.strobe_rolloff,
        };
        return LightingInstruction::new(strobe, apply_on_beat);
    }

    let mood = effective_mood(config.mood, reason, &config.odds, rng);
    let modes = mood.lighting_modes();
    let mode = modes[rng.gen_range(0..modes.len())];

    let mut colors = pick_palette(mood, palettes, rng).colors;
    let mut shift = 0;
    if config.hue_shift_chance > 0 && rng.gen_ratio(1, config.hue_shift_chance) {
        shift = rng.gen_range(0..colors.len()) as u8;
        let degrees = rng.gen_range(0..=config.hue_shift_max_amount) as f32;
        for color in colors.iter_mut() {
            *color = shift_hue(*color, degrees);
        }
    }

    let effect = match mode {
        LightingModeId::FadeToColor => {
            let boxi1 = *colors.choose(rng).unwrap_or(&Color::WHITE);
            let boxi2 = *colors.choose(rng).unwrap_or(&Color::WHITE);
            LightingEffect::FadeToColor {
                boxi1,
                boxi2,
                speed: config.fade_to_color_cycles,
            }
        }
        LightingModeId::PaletteFade => LightingEffect::PaletteFade {
            palette: colors,
            speed: config.palette_fade_cycles,
            shift,
        },
        LightingModeId::PaletteSwitch => LightingEffect::PaletteSwitch {
            palette: colors,
            shift,
        },
        LightingModeId::PaletteBrightnessFlash => LightingEffect::PaletteBrightnessFlash {
            palette: colors,
            fade_out_speed: config.flash_fadeout_speed,
            target_brightness: config.flash_target_brightness,
            shift,
        },
        LightingModeId::PaletteHueFlash => LightingEffect::PaletteHueFlash {
            palette: colors,
            fade_out_speed: config.hue_flash_fadeout_speed,
            hue_shift: config.flash_hue_shift,
            shift,
        },
        LightingModeId::Off | LightingModeId::SetColor | LightingModeId::Strobe => {
            LightingEffect::Off
        }
    };
    LightingInstruction::new(effect, apply_on_beat)
}

fn matches_mood(animation: &Animation, mood: LightingMood) -> bool {
    animation.mood == mood || (mood == LightingMood::Party && animation.mood == LightingMood::Regular)
}

/// The two screen contents of one unit.
fn pick_unit(pool: &[&Animation], odds: &SelectionOdds, rng: &mut impl Rng) -> Option<[AnimationId; 2]> {
    let first = *pool.choose(rng)?;
    if let Some(secondary) = first.secondary {
        return Some([first.id, secondary]);
    }
    if rng.gen_bool(odds.mirror_screens.clamp(0.0, 1.0)) {
        return Some([first.id, first.id]);
    }
    let singles: Vec<&Animation> = pool.iter().copied().filter(|a| !a.is_split()).collect();
    let second = singles.choose(rng).map_or(first.id, |a| a.id);
    Some([first.id, second])
}

pub fn next_animations(
    config: &AutoModeConfiguration,
    reason: SwitchReason,
    animations: &[Animation],
    rng: &mut impl Rng,
) -> AnimationsInstruction {
    let mood = effective_mood(config.mood, reason, &config.odds, rng);
    let character = mood.animation_character();

    let allowed: Vec<&Animation> = animations
        .iter()
        .filter(|a| config.allow_nsfw || !a.nsfw)
        .collect();
    let mut pool: Vec<&Animation> = allowed
        .iter()
        .copied()
        .filter(|a| matches_mood(a, mood))
        .collect();
    if pool.is_empty() {
        debug!("no animation for {:?}, using any", mood);
        pool = allowed;
    }

    let Some(first_unit) = pick_unit(&pool, &config.odds, rng) else {
        return AnimationsInstruction::empty(character);
    };
    let mut units = vec![first_unit];
    for _ in 1..UNIT_COUNT {
        let next = if rng.gen_bool(config.odds.mirror_units.clamp(0.0, 1.0)) {
            Some(first_unit)
        } else {
            pick_unit(&pool, &config.odds, rng)
        };
        units.push(next.unwrap_or(first_unit));
    }

    let positions = units.iter().enumerate().flat_map(|(unit, screens)| {
        screens
            .iter()
            .enumerate()
            .map(move |(screen, id)| (*id, ServerDisplay::position(unit as u8, screen as u8)))
    });
    let mut instruction = AnimationsInstruction::from_positions(positions, character);

    let chance = config.odds.party_blink_chance;
    if mood == LightingMood::Party && chance > 0 && rng.gen_ratio(1, chance) {
        instruction.blink_speed = Some(config.animation_blink_speed);
    }
    instruction
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn animation(id: u32, mood: LightingMood) -> Animation {
        Animation {
            id: AnimationId(id),
            name: format!("clip {}", id),
            mood,
            nsfw: false,
            secondary: None,
        }
    }

    #[test]
    fn test_party_beat_is_never_calm() {
        let config = AutoModeConfiguration {
            mood: LightingMood::Party,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        for reason in [SwitchReason::OnBeat, SwitchReason::FirstBeat] {
            for _ in 0..200 {
                let lighting = next_lighting(&config, reason, &[], &mut rng).unwrap();
                assert!(matches!(
                    lighting.character,
                    ModeCharacter::Rhythmic | ModeCharacter::Frantic
                ));
                assert!(lighting.apply_on_beat);
            }
        }
    }

    #[test]
    fn test_without_beat_selection_is_calm() {
        let config = AutoModeConfiguration {
            mood: LightingMood::Party,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..200 {
            let lighting = next_lighting(&config, SwitchReason::InDeadTime, &[], &mut rng).unwrap();
            assert_eq!(lighting.character, ModeCharacter::Calm);
            assert!(!lighting.apply_on_beat);
        }
    }

    #[test]
    fn test_strobe_on_first_beat() {
        let config = AutoModeConfiguration {
            mood: LightingMood::Regular,
            strobe_chance: 1,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(5);
        let lighting = next_lighting(&config, SwitchReason::FirstBeat, &[], &mut rng).unwrap();
        assert_eq!(lighting.effect.mode_id(), LightingModeId::Strobe);
        let regular = next_lighting(&config, SwitchReason::OnBeat, &[], &mut rng).unwrap();
        assert_ne!(regular.effect.mode_id(), LightingModeId::Strobe);
    }

    #[test]
    fn test_hue_shift_keeps_extra_channels() {
        let color = Color::new(255, 0, 0, 10, 20, 30);
        let shifted = shift_hue(color, 120.0);
        assert_eq!((shifted.white, shifted.amber, shifted.ultra_violet), (10, 20, 30));
        assert!(shifted.green > 250 && shifted.red < 5);
    }

    #[test]
    fn test_split_animation_fills_unit() {
        let mut split = animation(1, LightingMood::Happy);
        split.secondary = Some(AnimationId(2));
        let config = AutoModeConfiguration {
            mood: LightingMood::Happy,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(6);
        let instruction = next_animations(&config, SwitchReason::InCalmMode, &[split], &mut rng);
        assert_eq!(instruction.placements.len(), 2);
        assert_eq!(instruction.placements[0].animation, AnimationId(1));
        assert_eq!(
            instruction.placements[0].displays,
            ServerDisplay::BOXI1_D1 | ServerDisplay::BOXI2_D1
        );
        assert_eq!(
            instruction.placements[1].displays,
            ServerDisplay::BOXI1_D2 | ServerDisplay::BOXI2_D2
        );
    }

    #[test]
    fn test_animation_filters() {
        let mut nsfw = animation(1, LightingMood::Party);
        nsfw.nsfw = true;
        let catalog = vec![nsfw, animation(2, LightingMood::Regular), animation(3, LightingMood::Happy)];
        let config = AutoModeConfiguration {
            mood: LightingMood::Party,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let instruction = next_animations(&config, SwitchReason::OnBeat, &catalog, &mut rng);
            assert_eq!(instruction.displays(), ServerDisplay::ALL);
            assert_eq!(instruction.character, ModeCharacter::Frantic);
            for placement in &instruction.placements {
                assert_eq!(placement.animation, AnimationId(2));
            }
        }
    }

    #[test]
    fn test_empty_catalog_gives_empty_instruction() {
        let config = AutoModeConfiguration::default();
        let mut rng = StdRng::seed_from_u64(8);
        let instruction = next_animations(&config, SwitchReason::OnBeat, &[], &mut rng);
        assert!(instruction.is_empty());
    }

    #[test]
    fn test_grouping_and_masking() {
        let positions = [
            (AnimationId(5), ServerDisplay::BOXI1_D1),
            (AnimationId(6), ServerDisplay::BOXI1_D2),
            (AnimationId(5), ServerDisplay::BOXI2_D1),
            (AnimationId(5), ServerDisplay::BOXI2_D2),
        ];
        let instruction = AnimationsInstruction::from_positions(positions, ModeCharacter::Calm);
        assert_eq!(instruction.placements[0].animation, AnimationId(5));
        assert_eq!(instruction.placements.len(), 2);

        let masked = instruction.without(ServerDisplay::BOXI1_D2);
        assert_eq!(masked.placements.len(), 1);
        assert_eq!(
            masked.displays(),
            ServerDisplay::BOXI1_D1 | ServerDisplay::BOXI2_D1 | ServerDisplay::BOXI2_D2
        );
    }
}
