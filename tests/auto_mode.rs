use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;

use boxi::auto_mode::AutoModeEngine;
use boxi::config::{AutoModeConfiguration, LightingMood, ModeCharacter, SharedConfig};
use boxi::display_msg::{AnimationId, ServerDisplay};
use boxi::frames::FrameSource;
use boxi::hardware::{DebugHardware, HardwareCall};
use boxi::selection::AnimationsInstruction;
use boxi::{Stores, VisualManager};

struct NoFrames;

impl FrameSource for NoFrames {
    fn extract(&self, _: AnimationId, _: &Path) -> anyhow::Result<()> {
        Ok(())
    }
    fn extract_split(&self, _: AnimationId, _: AnimationId, _: &Path) -> anyhow::Result<()> {
        Ok(())
    }
    fn list_frames(&self, _: AnimationId) -> anyhow::Result<Vec<PathBuf>> {
        Ok(vec![])
    }
}

fn setup(mood: LightingMood) -> (Arc<VisualManager>, Arc<DebugHardware>, AutoModeEngine) {
    let hardware = Arc::new(DebugHardware::recording(ServerDisplay::ALL));
    let visuals = VisualManager::new(hardware.clone(), Arc::new(NoFrames), Stores::memory());
    let config = SharedConfig::new(AutoModeConfiguration {
        mood,
        strobe_chance: 0,
        ..Default::default()
    });
    let engine = AutoModeEngine::with_rng(config, StdRng::seed_from_u64(23));
    (visuals, hardware, engine)
}

fn animation_calls(calls: &[HardwareCall]) -> Vec<(AnimationId, ServerDisplay)> {
    calls
        .iter()
        .filter_map(|call| match call {
            HardwareCall::Animation(id, displays) => Some((*id, *displays)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_partial_override_keeps_auto_on_other_positions() {
    let (visuals, hardware, mut engine) = setup(LightingMood::Happy);
    let x = visuals
        .import_animation(Path::new("x"), "x", LightingMood::Happy, false, false)
        .unwrap()
        .id;

    let start = Instant::now();
    engine.tick(start, visuals.as_ref());
    assert_eq!(animation_calls(&hardware.take_calls()), vec![(x, ServerDisplay::ALL)]);

    let pinned = AnimationsInstruction::from_positions(
        [(AnimationId(99), ServerDisplay::BOXI1_D1)],
        ModeCharacter::Unknown,
    );
    visuals.set_animations_override(Some(pinned));
    assert_eq!(
        animation_calls(&hardware.take_calls()),
        vec![(AnimationId(99), ServerDisplay::BOXI1_D1)]
    );

    // Calm animations get boring after a minute and are picked again.
    let rest = ServerDisplay::BOXI1_D2 | ServerDisplay::BOXI2_D1 | ServerDisplay::BOXI2_D2;
    for minute in 1..=3u64 {
        engine.tick(start + Duration::from_secs(61 * minute), visuals.as_ref());
        let sent = animation_calls(&hardware.take_calls());
        assert_eq!(sent, vec![(x, rest)]);
    }

    visuals.set_animations_override(None);
    assert_eq!(animation_calls(&hardware.take_calls()), vec![(x, ServerDisplay::ALL)]);
}

#[test]
fn test_party_beat_produces_energetic_lighting() {
    let (visuals, hardware, mut engine) = setup(LightingMood::Party);
    let start = Instant::now();
    engine.tick(start, visuals.as_ref());

    hardware.trigger_beat();
    engine.tick(start + Duration::from_millis(5), visuals.as_ref());

    let lighting = visuals.status().lighting.unwrap();
    assert_ne!(lighting.mode_id().character(), ModeCharacter::Calm);
    assert!(hardware.take_calls().contains(&HardwareCall::Beat(false)));
}

#[test]
fn test_calm_mood_never_reacts_to_beats() {
    let (visuals, hardware, mut engine) = setup(LightingMood::Moody);
    let start = Instant::now();
    engine.tick(start, visuals.as_ref());
    hardware.take_calls();

    for step in 1..=100u64 {
        hardware.trigger_beat();
        engine.tick(start + Duration::from_millis(step * 300), visuals.as_ref());
    }
    let calls = hardware.take_calls();
    assert!(!calls.contains(&HardwareCall::Beat(false)));
    assert!(!calls.iter().any(|call| matches!(call, HardwareCall::Lighting(_))));
    assert_eq!(
        visuals.status().lighting.unwrap().mode_id().character(),
        ModeCharacter::Calm
    );
}
