//! Everything that leaves the host: fixtures on the bus, screen units and the beat input.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use log::{debug, info, warn};

use crate::bus::BusHub;
use crate::bus_msg::{create_display_status_update, DisplayStatusCode, MessageBlock};
use crate::display_msg::{AnimationId, ServerDisplay};
use crate::display_server::DisplayRegistry;
use crate::frames::FrameSource;

pub trait Hardware: Send + Sync {
    fn connected_displays(&self) -> ServerDisplay;
    fn send_lighting(&self, block: &MessageBlock);
    fn send_animation(&self, animation: AnimationId, displays: ServerDisplay);
    fn send_text(&self, text: &str, displays: ServerDisplay);
    /// Updates the screen brightness (if given) and the per-beat blink speed.
    fn send_brightness_change(&self, brightness: Option<f64>, blink_speed: u16);
    /// Pulses the screens. Without `force` this only happens while they blink.
    fn send_beat_to_display(&self, force: bool);
    /// Whether a beat arrived since the last call.
    fn beat_state(&self) -> bool;
    /// Makes sure all connected screen units have the animation.
    fn upload_animation(&self, animation: AnimationId) -> anyhow::Result<()>;
    fn update_status_code(&self, status: DisplayStatusCode, unit: u8);
    /// Ids of screen units as they log on.
    fn subscribe_logons(&self) -> Receiver<u8>;
}

pub trait BeatInput: Send {
    /// True once per rising edge of the beat signal.
    fn poll(&mut self) -> anyhow::Result<bool>;
}

/// A GPIO exported through sysfs, e.g. `/sys/class/gpio/gpio16/value`.
pub struct SysfsBeatPin {
    path: PathBuf,
    high: bool,
}

impl SysfsBeatPin {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<SysfsBeatPin> {
        let path = path.into();
        let high = read_level(&path)?;
        info!("reading beats from {}", path.display());
        Ok(SysfsBeatPin { path, high })
    }
}

fn read_level(path: &Path) -> anyhow::Result<bool> {
    let value = fs::read_to_string(path)
        .with_context(|| format!("beat pin {} is not readable", path.display()))?;
    Ok(value.trim() == "1")
}

impl BeatInput for SysfsBeatPin {
    fn poll(&mut self) -> anyhow::Result<bool> {
        let high = read_level(&self.path)?;
        let rising = high && !self.high;
        self.high = high;
        Ok(rising)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct ScreenState {
    brightness: f64,
    blink_speed: u16,
}

/// The real installation.
pub struct HardwareManager {
    bus: BusHub,
    displays: Arc<DisplayRegistry>,
    frames: Arc<dyn FrameSource>,
    beat: Option<Mutex<Box<dyn BeatInput>>>,
    screen: Mutex<ScreenState>,
}

impl HardwareManager {
    /// Arguments:
    ///   bus:      The serial line of the fixture microcontrollers.
    ///   displays: Registry the screen units connect to.
    ///   frames:   Where uploaded animation frames are read from.
    ///   beat:     The beat detector, if one is attached.
    pub fn new(
        bus: BusHub,
        displays: Arc<DisplayRegistry>,
        frames: Arc<dyn FrameSource>,
        beat: Option<Box<dyn BeatInput>>,
    ) -> HardwareManager {
        HardwareManager {
            bus,
            displays,
            frames,
            beat: beat.map(Mutex::new),
            screen: Mutex::new(ScreenState {
                brightness: 1.0,
                blink_speed: 0,
            }),
        }
    }

    fn screen(&self) -> MutexGuard<'_, ScreenState> {
        self.screen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Hardware for HardwareManager {
    fn connected_displays(&self) -> ServerDisplay {
        self.displays.connected_displays()
    }

    fn send_lighting(&self, block: &MessageBlock) {
        if let Err(e) = self.bus.send(block) {
            warn!("lighting instruction failed: {:#}", anyhow::Error::new(e));
        }
    }

    fn send_animation(&self, animation: AnimationId, displays: ServerDisplay) {
        self.displays.play_animation(animation, displays);
    }

    fn send_text(&self, text: &str, displays: ServerDisplay) {
        self.displays.display_text(text, displays);
    }

    fn send_brightness_change(&self, brightness: Option<f64>, blink_speed: u16) {
        let changed = {
            let mut screen = self.screen();
            let old = *screen;
            if let Some(brightness) = brightness {
                screen.brightness = brightness.clamp(0.0, 1.0);
            }
            screen.blink_speed = blink_speed;
            *screen != old
        };
        if changed {
            self.send_beat_to_display(true);
        }
    }

    fn send_beat_to_display(&self, force: bool) {
        let screen = *self.screen();
        if !force && screen.blink_speed == 0 {
            return;
        }
        self.displays
            .set_brightness(screen.brightness, screen.blink_speed, ServerDisplay::ALL);
    }

    fn beat_state(&self) -> bool {
        let Some(beat) = &self.beat else {
            return false;
        };
        let mut input = beat.lock().unwrap_or_else(PoisonError::into_inner);
        match input.poll() {
            Ok(rising) => rising,
            Err(e) => {
                debug!("beat input failed: {:#}", e);
                false
            }
        }
    }

    fn upload_animation(&self, animation: AnimationId) -> anyhow::Result<()> {
        let frames = self
            .frames
            .list_frames(animation)
            .with_context(|| format!("frames of animation {} are missing", animation))?;
        self.displays
            .upload_animation(animation, &frames, ServerDisplay::ALL)
    }

    fn update_status_code(&self, status: DisplayStatusCode, unit: u8) {
        if let Err(e) = self.bus.send(&create_display_status_update(status, unit)) {
            warn!("status update failed: {:#}", anyhow::Error::new(e));
        }
    }

    fn subscribe_logons(&self) -> Receiver<u8> {
        self.displays.subscribe_logons()
    }
}

/// What the debug hardware was asked to do.
#[derive(Clone, Debug, PartialEq)]
pub enum HardwareCall {
    Lighting(MessageBlock),
    Animation(AnimationId, ServerDisplay),
    Text(String, ServerDisplay),
    Brightness(Option<f64>, u16),
    Beat(bool),
    Upload(AnimationId),
    Status(DisplayStatusCode, u8),
}

/// Logs instead of driving anything. Beats and logons are triggered by hand.
pub struct DebugHardware {
    displays: ServerDisplay,
    beat: AtomicBool,
    calls: Option<Mutex<Vec<HardwareCall>>>,
    logon_subscribers: Mutex<Vec<Sender<u8>>>,
}

impl DebugHardware {
    pub fn new(displays: ServerDisplay) -> DebugHardware {
        DebugHardware {
            displays,
            beat: AtomicBool::new(false),
            calls: None,
            logon_subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Also keeps every call for later inspection.
    pub fn recording(displays: ServerDisplay) -> DebugHardware {
        DebugHardware {
            calls: Some(Mutex::new(Vec::new())),
            ..DebugHardware::new(displays)
        }
    }

    pub fn trigger_beat(&self) {
        self.beat.store(true, Ordering::SeqCst);
    }

    pub fn simulate_logon(&self, unit: u8) {
        self.logon_subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|subscriber| subscriber.send(unit).is_ok());
    }

    /// Returns and forgets the recorded calls.
    pub fn take_calls(&self) -> Vec<HardwareCall> {
        match &self.calls {
            Some(calls) => std::mem::take(&mut *calls.lock().unwrap_or_else(PoisonError::into_inner)),
            None => Vec::new(),
        }
    }

    fn record(&self, call: HardwareCall) {
        info!("debug hardware: {:?}", call);
        if let Some(calls) = &self.calls {
            calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
        }
    }
}

impl Hardware for DebugHardware {
    fn connected_displays(&self) -> ServerDisplay {
        self.displays
    }

    fn send_lighting(&self, block: &MessageBlock) {
        self.record(HardwareCall::Lighting(block.clone()));
    }

    fn send_animation(&self, animation: AnimationId, displays: ServerDisplay) {
        self.record(HardwareCall::Animation(animation, displays));
    }

    fn send_text(&self, text: &str, displays: ServerDisplay) {
        self.record(HardwareCall::Text(text.to_string(), displays));
    }

    fn send_brightness_change(&self, brightness: Option<f64>, blink_speed: u16) {
        self.record(HardwareCall::Brightness(brightness, blink_speed));
    }

    fn send_beat_to_display(&self, force: bool) {
        self.record(HardwareCall::Beat(force));
    }

    fn beat_state(&self) -> bool {
        self.beat.swap(false, Ordering::SeqCst)
    }

    fn upload_animation(&self, animation: AnimationId) -> anyhow::Result<()> {
        self.record(HardwareCall::Upload(animation));
        Ok(())
    }

    fn update_status_code(&self, status: DisplayStatusCode, unit: u8) {
        self.record(HardwareCall::Status(status, unit));
    }

    fn subscribe_logons(&self) -> Receiver<u8> {
        let (tx, rx) = mpsc::channel();
        self.logon_subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display_link::DisplayLink;
    use crate::display_msg::{Instruction, InstructionKind};
    use std::io::{self, Write};

    #[derive(Clone, Default)]
    struct Wire(Arc<Mutex<Vec<u8>>>);

    impl Write for Wire {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

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

    fn manager_with_unit() -> (HardwareManager, Wire, Wire) {
        let bus = Wire::default();
        let screen = Wire::default();
        let registry = DisplayRegistry::new();
        registry.register(Arc::new(DisplayLink::new(0, screen.clone())));
        let manager = HardwareManager::new(
            BusHub::from_writer(bus.clone()),
            registry,
            Arc::new(NoFrames),
            None,
        );
        (manager, bus, screen)
    }

    fn instructions(wire: &Wire) -> Vec<Instruction> {
        let bytes = wire.0.lock().unwrap().clone();
        let mut reader = &bytes[..];
        let mut result = Vec::new();
        while !reader.is_empty() {
            result.push(Instruction::read_from(&mut reader).unwrap());
        }
        result
    }

    #[test]
    fn test_brightness_only_resent_on_change() {
        let (manager, _, screen) = manager_with_unit();
        manager.send_brightness_change(Some(0.5), 0);
        manager.send_brightness_change(Some(0.5), 0);
        manager.send_brightness_change(None, 0);
        let sent = instructions(&screen);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, InstructionKind::SetBrightness);
    }

    #[test]
    fn test_beat_pulses_only_while_blinking() {
        let (manager, _, screen) = manager_with_unit();
        manager.send_beat_to_display(false);
        assert!(instructions(&screen).is_empty());

        manager.send_brightness_change(None, 2000);
        manager.send_beat_to_display(false);
        let sent = instructions(&screen);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].payload, vec![0xFF, 0xFF, 0x07, 0xD0]);
    }

    #[test]
    fn test_status_update_goes_to_bus() {
        let (manager, bus, _) = manager_with_unit();
        manager.update_status_code(DisplayStatusCode::HostAwake, 1);
        assert_eq!(*bus.0.lock().unwrap(), vec![0x55, 0x77, 0x4F, 0x01, 0x01, 0x01]);
    }

    #[test]
    fn test_sysfs_pin_reports_rising_edges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value");
        fs::write(&path, "0\n").unwrap();
        let mut pin = SysfsBeatPin::open(&path).unwrap();

        assert!(!pin.poll().unwrap());
        fs::write(&path, "1\n").unwrap();
        assert!(pin.poll().unwrap());
        assert!(!pin.poll().unwrap());
        fs::write(&path, "0\n").unwrap();
        assert!(!pin.poll().unwrap());
        fs::write(&path, "1\n").unwrap();
        assert!(pin.poll().unwrap());
    }

    #[test]
    fn test_debug_hardware_beat_is_edge_triggered() {
        let hardware = DebugHardware::recording(ServerDisplay::ALL);
        assert!(!hardware.beat_state());
        hardware.trigger_beat();
        assert!(hardware.beat_state());
        assert!(!hardware.beat_state());

        let logons = hardware.subscribe_logons();
        hardware.simulate_logon(1);
        assert_eq!(logons.try_recv().unwrap(), 1);
    }
}
