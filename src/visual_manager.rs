//! Arbitration between the auto mode and manual overrides.
//!
//! The auto mode always reports its selections here. They are remembered
//! so they can be resumed, and forwarded to the hardware only where no
//! override is active. Locks are never held while talking to hardware.

use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::auto_mode::{AutoModeEngine, SchedulerHandle, SwitchTarget, TICK_PERIOD};
use crate::bus_msg::{DisplayStatusCode, LightingEffect};
use crate::catalog::{
    Animation, AnimationCatalog, AnimationMap, CatalogError, Palette, PaletteCatalog, PaletteMap,
};
use crate::config::{AutoModeConfiguration, LightingMood, SharedConfig};
use crate::display_msg::{AnimationId, ServerDisplay};
use crate::frames::FrameSource;
use crate::hardware::Hardware;
use crate::selection::{AnimationsInstruction, LightingInstruction};
use crate::storage::{JsonFileStore, MemoryStore, Store};

/// Text shown on a set of screen positions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextInstruction {
    pub text: String,
    pub displays: ServerDisplay,
}

/// Where catalogs and configuration are persisted.
pub struct Stores {
    pub palettes: Box<dyn Store<PaletteMap>>,
    pub animations: Box<dyn Store<AnimationMap>>,
    pub config: Box<dyn Store<AutoModeConfiguration>>,
}

impl Stores {
    /// `palettes.json`, `animations.json` and `auto_mode.json` in `dir`.
    pub fn json(dir: &Path) -> Stores {
        Stores {
            palettes: Box::new(JsonFileStore::new(dir.join("palettes.json"))),
            animations: Box::new(JsonFileStore::new(dir.join("animations.json"))),
            config: Box::new(JsonFileStore::new(dir.join("auto_mode.json"))),
        }
    }

    pub fn memory() -> Stores {
        Stores {
            palettes: Box::new(MemoryStore::new(None)),
            animations: Box::new(MemoryStore::new(None)),
            config: Box::new(MemoryStore::new(None)),
        }
    }
}

#[derive(Default)]
struct VisualState {
    lighting_auto: Option<LightingInstruction>,
    lighting_override: Option<LightingInstruction>,
    animation_auto: Option<AnimationsInstruction>,
    animation_override: Option<AnimationsInstruction>,
    texts: Option<Vec<TextInstruction>>,
}

/// Snapshot for the control API.
#[derive(Clone, Debug, Serialize)]
pub struct VisualStatus {
    pub mood: LightingMood,
    pub connected_displays: ServerDisplay,
    pub lighting: Option<LightingEffect>,
    pub lighting_overridden: bool,
    pub animations: Option<AnimationsInstruction>,
    pub animations_overridden: Option<ServerDisplay>,
    pub texts: Vec<TextInstruction>,
}

pub struct VisualManager {
    hardware: Arc<dyn Hardware>,
    frames: Arc<dyn FrameSource>,
    palettes: PaletteCatalog,
    animations: AnimationCatalog,
    config: SharedConfig,
    config_store: Box<dyn Store<AutoModeConfiguration>>,
    state: Mutex<VisualState>,
    scheduler: Mutex<Option<SchedulerHandle>>,
    upload_tx: Mutex<Sender<AnimationId>>,
    upload_rx: Mutex<Option<Receiver<AnimationId>>>,
}

impl VisualManager {
    pub fn new(hardware: Arc<dyn Hardware>, frames: Arc<dyn FrameSource>, stores: Stores) -> Arc<VisualManager> {
        let config = stores.config.load().unwrap_or_else(|e| {
            warn!("using default auto mode configuration: {:#}", e);
            AutoModeConfiguration::default()
        });
        let (upload_tx, upload_rx) = mpsc::channel();
        Arc::new(VisualManager {
            hardware,
            frames,
            palettes: PaletteCatalog::load(stores.palettes),
            animations: AnimationCatalog::load(stores.animations),
            config: SharedConfig::new(config),
            config_store: stores.config,
            state: Mutex::new(VisualState::default()),
            scheduler: Mutex::new(None),
            upload_tx: Mutex::new(upload_tx),
            upload_rx: Mutex::new(Some(upload_rx)),
        })
    }

    /// Starts the upload worker, the logon watcher and the auto mode.
    pub fn start(self: &Arc<Self>) {
        self.start_workers();
        self.start_auto_mode();
    }

    pub fn start_workers(self: &Arc<Self>) {
        let Some(uploads) = self.upload_rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            warn!("visual manager workers already running");
            return;
        };
        let hardware = self.hardware.clone();
        thread::spawn(move || {
            for animation in uploads {
                if let Err(e) = hardware.upload_animation(animation) {
                    warn!("upload of animation {} failed: {:#}", animation, e);
                }
            }
        });

        let logons = self.hardware.subscribe_logons();
        let manager = Arc::downgrade(self);
        thread::spawn(move || {
            for unit in logons {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.on_unit_logon(unit);
            }
        });
    }

    pub fn start_auto_mode(self: &Arc<Self>) {
        let weak: Weak<VisualManager> = Arc::downgrade(self);
        let target: Weak<dyn SwitchTarget> = weak;
        let handle = AutoModeEngine::new(self.config.clone()).spawn(target, TICK_PERIOD);
        // Replacing a running scheduler stops it.
        *self.lock_scheduler() = Some(handle);
    }

    pub fn stop_auto_mode(&self) {
        if let Some(handle) = self.lock_scheduler().take() {
            handle.stop();
        }
    }

    /// Forces a fresh selection of lighting and animations.
    pub fn mark_dirty(&self) {
        if let Some(handle) = self.lock_scheduler().as_ref() {
            handle.mark_dirty();
        }
    }

    fn on_unit_logon(&self, unit: u8) {
        info!("screen unit {} logged on, synchronizing animations", unit);
        self.hardware
            .update_status_code(DisplayStatusCode::HostAwake, unit);
        for animation in self.animations.frame_ids() {
            self.queue_upload(animation);
        }
    }

    fn queue_upload(&self, animation: AnimationId) {
        let sent = self
            .upload_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(animation);
        if sent.is_err() {
            warn!("upload queue is closed, animation {} not uploaded", animation);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, VisualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_scheduler(&self) -> MutexGuard<'_, Option<SchedulerHandle>> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forward_animations(&self, instruction: &AnimationsInstruction) {
        for placement in &instruction.placements {
            self.hardware
                .send_animation(placement.animation, placement.displays);
        }
    }

    /// Auto output also carries the blink speed of the screens.
    fn forward_auto_animations(&self, instruction: &AnimationsInstruction) {
        self.forward_animations(instruction);
        self.hardware
            .send_brightness_change(None, instruction.blink_speed.unwrap_or(0));
    }

    /// `None` resumes the auto mode lighting.
    pub fn set_lighting_override(&self, instruction: Option<LightingInstruction>) {
        let block = {
            let mut state = self.lock_state();
            state.lighting_override = instruction;
            match &state.lighting_override {
                Some(latched) => Some(latched.block.clone()),
                None => state.lighting_auto.as_ref().map(|auto| auto.block.clone()),
            }
        };
        if let Some(block) = block {
            self.hardware.send_lighting(&block);
        }
    }

    /// Overrides the positions the instruction covers; the auto mode keeps the others.
    ///
    /// `None` hands all positions back to the auto mode.
    pub fn set_animations_override(&self, instruction: Option<AnimationsInstruction>) {
        let (latched, released) = {
            let mut state = self.lock_state();
            let previous = state
                .animation_override
                .as_ref()
                .map_or(ServerDisplay::NONE, |o| o.displays());
            state.animation_override = instruction;
            let latched = state.animation_override.clone();
            let released = match &latched {
                Some(latched) => {
                    // Positions the new override gives up go back to the auto selection.
                    let freed = previous.without(latched.displays());
                    state
                        .animation_auto
                        .as_ref()
                        .filter(|_| !freed.is_empty())
                        .map(|auto| auto.without(ServerDisplay::ALL.without(freed)))
                }
                None => state.animation_auto.clone(),
            };
            (latched, released)
        };
        if let Some(latched) = latched {
            self.forward_animations(&latched);
        }
        if let Some(released) = released {
            self.forward_auto_animations(&released);
        }
    }

    /// Shows the texts and blanks every other connected position.
    pub fn set_texts(&self, texts: Vec<TextInstruction>) {
        let covered = texts
            .iter()
            .fold(ServerDisplay::NONE, |acc, text| acc | text.displays);
        {
            let mut state = self.lock_state();
            state.texts = (!texts.is_empty()).then(|| texts.clone());
        }

        for text in &texts {
            self.hardware.send_text(&text.text, text.displays);
        }
        let blank = self.hardware.connected_displays().without(covered);
        if !blank.is_empty() {
            self.hardware.send_text("", blank);
        }
    }

    pub fn set_screen_brightness(&self, brightness: f64) {
        let blink_speed = self
            .lock_state()
            .animation_auto
            .as_ref()
            .and_then(|auto| auto.blink_speed)
            .unwrap_or(0);
        self.hardware
            .send_brightness_change(Some(brightness), blink_speed);
    }

    pub fn configuration(&self) -> AutoModeConfiguration {
        self.config.snapshot()
    }

    /// Stores the configuration and restarts the selection with it.
    pub fn update_configuration(&self, config: AutoModeConfiguration) -> anyhow::Result<()> {
        self.config_store.store(&config)?;
        *self.config.lock() = config;
        self.mark_dirty();
        Ok(())
    }

    pub fn palette_catalog(&self) -> &PaletteCatalog {
        &self.palettes
    }

    pub fn animation_catalog(&self) -> &AnimationCatalog {
        &self.animations
    }

    /// Imports a clip and queues its frames for all screen units.
    pub fn import_animation(
        &self,
        source: &Path,
        name: &str,
        mood: LightingMood,
        split: bool,
        nsfw: bool,
    ) -> Result<Animation, CatalogError> {
        let animation = self
            .animations
            .import(self.frames.as_ref(), source, name, mood, split, nsfw)?;
        for id in animation.frame_ids() {
            self.queue_upload(id);
        }
        Ok(animation)
    }

    pub fn connected_displays(&self) -> ServerDisplay {
        self.hardware.connected_displays()
    }

    pub fn status(&self) -> VisualStatus {
        let mood = self.config.lock().mood;
        let state = self.lock_state();
        let lighting = state
            .lighting_override
            .as_ref()
            .or(state.lighting_auto.as_ref())
            .map(|instruction| instruction.effect.clone());
        VisualStatus {
            mood,
            connected_displays: self.hardware.connected_displays(),
            lighting,
            lighting_overridden: state.lighting_override.is_some(),
            animations: state.animation_auto.clone(),
            animations_overridden: state.animation_override.as_ref().map(|o| o.displays()),
            texts: state.texts.clone().unwrap_or_default(),
        }
    }
}

impl SwitchTarget for VisualManager {
    fn apply_lighting(&self, instruction: LightingInstruction) {
        let block = {
            let mut state = self.lock_state();
            let forward = state.lighting_override.is_none();
            let block = forward.then(|| instruction.block.clone());
            state.lighting_auto = Some(instruction);
            block
        };
        if let Some(block) = block {
            self.hardware.send_lighting(&block);
        }
    }

    fn apply_animation(&self, instruction: AnimationsInstruction) {
        let forward = {
            let mut state = self.lock_state();
            let forward = match &state.animation_override {
                Some(latched) => instruction.without(latched.displays()),
                None => instruction.clone(),
            };
            state.animation_auto = Some(instruction);
            forward
        };
        self.forward_auto_animations(&forward);
    }

    fn trigger_beat(&self) {
        self.hardware.send_beat_to_display(false);
    }

    fn beat_state(&self) -> bool {
        self.hardware.beat_state()
    }

    fn animations(&self) -> Vec<Animation> {
        self.animations.all()
    }

    fn palettes(&self) -> Vec<Palette> {
        self.palettes.all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus_msg::Color;
    use crate::config::ModeCharacter;
    use crate::hardware::{DebugHardware, HardwareCall};
    use std::path::PathBuf;

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

    fn manager() -> (Arc<VisualManager>, Arc<DebugHardware>) {
        let hardware = Arc::new(DebugHardware::recording(ServerDisplay::ALL));
        let manager = VisualManager::new(hardware.clone(), Arc::new(NoFrames), Stores::memory());
        (manager, hardware)
    }

    fn color(red: u8) -> LightingInstruction {
        let effect = LightingEffect::SetColor {
            boxi1: Color::new(red, 0, 0, 0, 0, 0),
            boxi2: Color::new(red, 0, 0, 0, 0, 0),
        };
        LightingInstruction::new(effect, false).unwrap()
    }

    fn everywhere(id: u32) -> AnimationsInstruction {
        AnimationsInstruction::from_positions([(AnimationId(id), ServerDisplay::ALL)], ModeCharacter::Calm)
    }

    #[test]
    fn test_lighting_override_latches_and_resumes() {
        let (manager, hardware) = manager();
        manager.apply_lighting(color(1));
        manager.set_lighting_override(Some(color(2)));
        manager.apply_lighting(color(3));
        manager.set_lighting_override(None);

        let calls = hardware.take_calls();
        assert_eq!(
            calls,
            vec![
                HardwareCall::Lighting(color(1).block),
                HardwareCall::Lighting(color(2).block),
                HardwareCall::Lighting(color(3).block),
            ]
        );
    }

    #[test]
    fn test_partial_animation_override() {
        let (manager, hardware) = manager();
        let pinned = AnimationsInstruction::from_positions(
            [(AnimationId(7), ServerDisplay::BOXI1_D1)],
            ModeCharacter::Calm,
        );
        manager.set_animations_override(Some(pinned));
        hardware.take_calls();

        let rest = ServerDisplay::BOXI1_D2 | ServerDisplay::BOXI2_D1 | ServerDisplay::BOXI2_D2;
        for _ in 0..3 {
            manager.apply_animation(everywhere(1));
            let calls = hardware.take_calls();
            assert_eq!(calls[0], HardwareCall::Animation(AnimationId(1), rest));
            assert!(!calls.iter().any(|call| matches!(
                call,
                HardwareCall::Animation(_, displays) if displays.contains(ServerDisplay::BOXI1_D1)
            )));
        }

        manager.set_animations_override(None);
        assert_eq!(
            hardware.take_calls()[0],
            HardwareCall::Animation(AnimationId(1), ServerDisplay::ALL)
        );
    }

    #[test]
    fn test_narrowed_override_releases_positions() {
        let (manager, hardware) = manager();
        let mut blinking = everywhere(1);
        blinking.blink_speed = Some(1200);
        manager.apply_animation(blinking);
        let unit = ServerDisplay::BOXI1_D1 | ServerDisplay::BOXI1_D2;
        manager.set_animations_override(Some(AnimationsInstruction::from_positions(
            [(AnimationId(9), unit)],
            ModeCharacter::Unknown,
        )));
        assert_eq!(
            hardware.take_calls().last(),
            Some(&HardwareCall::Animation(AnimationId(9), unit))
        );

        manager.set_animations_override(Some(AnimationsInstruction::from_positions(
            [(AnimationId(9), ServerDisplay::BOXI1_D1)],
            ModeCharacter::Unknown,
        )));
        assert_eq!(
            hardware.take_calls(),
            vec![
                HardwareCall::Animation(AnimationId(9), ServerDisplay::BOXI1_D1),
                HardwareCall::Animation(AnimationId(1), ServerDisplay::BOXI1_D2),
                HardwareCall::Brightness(None, 1200),
            ]
        );
    }

    #[test]
    fn test_override_keeps_blink_speed() {
        let (manager, hardware) = manager();
        let mut blinking = everywhere(1);
        blinking.blink_speed = Some(1200);
        manager.apply_animation(blinking);
        hardware.take_calls();

        manager.set_animations_override(Some(everywhere(4)));
        assert_eq!(
            hardware.take_calls(),
            vec![HardwareCall::Animation(AnimationId(4), ServerDisplay::ALL)]
        );
    }

    #[test]
    fn test_texts_blank_uncovered_positions() {
        let (manager, hardware) = manager();
        manager.set_texts(vec![TextInstruction {
            text: "hello".to_string(),
            displays: ServerDisplay::BOXI1_D1,
        }]);
        assert_eq!(
            hardware.take_calls(),
            vec![
                HardwareCall::Text("hello".to_string(), ServerDisplay::BOXI1_D1),
                HardwareCall::Text(
                    String::new(),
                    ServerDisplay::BOXI1_D2 | ServerDisplay::BOXI2_D1 | ServerDisplay::BOXI2_D2
                ),
            ]
        );
        assert_eq!(manager.status().texts.len(), 1);
    }

    #[test]
    fn test_brightness_uses_auto_blink_speed() {
        let (manager, hardware) = manager();
        let mut blinking = everywhere(1);
        blinking.blink_speed = Some(1500);
        manager.apply_animation(blinking);
        hardware.take_calls();

        manager.set_screen_brightness(0.25);
        assert_eq!(hardware.take_calls(), vec![HardwareCall::Brightness(Some(0.25), 1500)]);
    }

    #[test]
    fn test_logon_reports_status_and_syncs() {
        let (manager, hardware) = manager();
        let animation = manager
            .import_animation(Path::new("clip"), "split", LightingMood::Happy, true, false)
            .unwrap();
        manager.start_workers();
        hardware.simulate_logon(1);

        let expected = [
            HardwareCall::Status(DisplayStatusCode::HostAwake, 1),
            HardwareCall::Upload(animation.id),
        ];
        let mut calls = Vec::new();
        for _ in 0..200 {
            calls.extend(hardware.take_calls());
            if expected.iter().all(|call| calls.contains(call)) {
                return;
            }
            thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("logon was not handled");
    }

    #[test]
    fn test_auto_mode_drives_manager() {
        let (manager, hardware) = manager();
        manager.start_auto_mode();

        let mut calls = Vec::new();
        for _ in 0..200 {
            calls.extend(hardware.take_calls());
            if calls.iter().any(|call| matches!(call, HardwareCall::Lighting(_))) {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(10));
        }
        manager.stop_auto_mode();
        assert!(calls.iter().any(|call| matches!(call, HardwareCall::Lighting(_))));
        assert!(manager.status().lighting.is_some());
    }

    #[test]
    fn test_configuration_update_is_stored() {
        let (manager, _) = manager();
        let mut config = manager.configuration();
        config.mood = LightingMood::Party;
        manager.update_configuration(config).unwrap();
        assert_eq!(manager.configuration().mood, LightingMood::Party);
        assert_eq!(manager.config_store.load().unwrap().mood, LightingMood::Party);
    }
}
