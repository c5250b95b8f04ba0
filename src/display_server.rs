use std::collections::HashMap;
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use log::{debug, info, warn};

use crate::display_link::DisplayLink;
use crate::display_msg::{
    read_handshake, AnimationId, FrameError, Instruction, InstructionKind, Reply, ServerDisplay,
    UNIT_COUNT,
};

/// How long a new connection may take to send its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tracks the connected screen units and fans instructions out to them.
pub struct DisplayRegistry {
    links: Mutex<HashMap<u8, Arc<DisplayLink>>>,
    logon_subscribers: Mutex<Vec<Sender<u8>>>,
    handshake_timeout: Duration,
}

impl DisplayRegistry {
    pub fn new() -> Arc<DisplayRegistry> {
        DisplayRegistry::with_handshake_timeout(HANDSHAKE_TIMEOUT)
    }

    pub fn with_handshake_timeout(handshake_timeout: Duration) -> Arc<DisplayRegistry> {
        Arc::new(DisplayRegistry {
            links: Mutex::new(HashMap::new()),
            logon_subscribers: Mutex::new(Vec::new()),
            handshake_timeout,
        })
    }

    /// Binds the listening socket and accepts units on a background thread.
    pub fn listen(self: &Arc<Self>, addr: impl ToSocketAddrs) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).context("display server socket could not be bound")?;
        info!("listening for screen units on {}", listener.local_addr()?);
        self.serve(listener);
        Ok(())
    }

    pub fn serve(self: &Arc<Self>, listener: TcpListener) {
        let registry = self.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let registry = registry.clone();
                        thread::spawn(move || registry.handle_unit(stream));
                    }
                    Err(err) => {
                        warn!("couldn't accept screen unit: {}", err);
                        continue;
                    }
                }
            }
        });
    }

    /// Unit ids of every unit that completes the handshake from now on.
    pub fn subscribe_logons(&self) -> Receiver<u8> {
        let (tx, rx) = mpsc::channel();
        self.lock_subscribers().push(tx);
        rx
    }

    /// Serves one connection until it fails; runs on its own thread.
    pub fn handle_unit(&self, stream: TcpStream) {
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        let mut reader = stream;
        if let Err(e) = reader.set_read_timeout(Some(self.handshake_timeout)) {
            warn!("screen unit at {}: handshake timeout not set: {}", peer, e);
            return;
        }
        let handshake = read_handshake(&mut reader).and_then(|unit| {
            reader.set_read_timeout(None)?;
            Ok(unit)
        });
        let unit = match handshake {
            Ok(unit) => unit,
            Err(e) => {
                warn!("rejecting screen unit at {}: {}", peer, e);
                let _ = reader.shutdown(Shutdown::Both);
                return;
            }
        };
        let writer = match reader.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                warn!("unit {}: socket could not be cloned: {}", unit, e);
                return;
            }
        };

        let link = Arc::new(DisplayLink::new(unit, writer));
        self.register(link.clone());
        info!("screen unit {} connected from {}", unit, peer);

        let reason = loop {
            match Reply::read_from(&mut reader) {
                Ok(reply) => {
                    link.resolve(reply);
                }
                Err(e) => break e,
            }
        };
        match reason {
            FrameError::Io(e) => info!("screen unit {} disconnected: {}", unit, e),
            other => warn!("dropping screen unit {}: {}", unit, other),
        }

        self.deregister(&link);
        let _ = reader.shutdown(Shutdown::Both);
    }

    pub fn register(&self, link: Arc<DisplayLink>) {
        let unit = link.unit();
        if self.lock_links().insert(unit, link).is_some() {
            info!("screen unit {} reconnected, replacing old connection", unit);
        }
        self.lock_subscribers()
            .retain(|subscriber| subscriber.send(unit).is_ok());
    }

    /// Removes the link unless the unit already reconnected with a new one.
    pub fn deregister(&self, link: &Arc<DisplayLink>) {
        let mut links = self.lock_links();
        if let Some(current) = links.get(&link.unit()) {
            if Arc::ptr_eq(current, link) {
                links.remove(&link.unit());
            }
        }
    }

    pub fn connected_units(&self) -> Vec<u8> {
        let mut units: Vec<u8> = self.lock_links().keys().copied().collect();
        units.sort_unstable();
        units
    }

    pub fn connected_displays(&self) -> ServerDisplay {
        self.lock_links()
            .keys()
            .fold(ServerDisplay::NONE, |acc, unit| acc | ServerDisplay::unit(*unit))
    }

    fn link(&self, unit: u8) -> Option<Arc<DisplayLink>> {
        self.lock_links().get(&unit).cloned()
    }

    /// Connected links covering any of `displays`, with their local masks.
    fn fan_out(&self, displays: ServerDisplay) -> Vec<(Arc<DisplayLink>, u16)> {
        let mut targets: Vec<_> = self
            .lock_links()
            .values()
            .filter(|link| displays.intersects(ServerDisplay::unit(link.unit())))
            .map(|link| (link.clone(), displays.local_to(link.unit())))
            .collect();
        targets.sort_by_key(|(link, _)| link.unit());
        targets
    }

    fn broadcast(&self, kind: InstructionKind, displays: ServerDisplay, payload: Vec<u8>) {
        for (link, local) in self.fan_out(displays) {
            let instruction = Instruction::new(kind, local, payload.clone());
            if let Err(e) = link.send(&instruction) {
                warn!("unit {}: {:?} could not be sent: {}", link.unit(), kind, e);
            }
        }
    }

    pub fn play_animation(&self, animation: AnimationId, displays: ServerDisplay) {
        self.broadcast(
            InstructionKind::PlayAnimation,
            displays,
            animation.0.to_be_bytes().to_vec(),
        );
    }

    pub fn display_text(&self, text: &str, displays: ServerDisplay) {
        self.broadcast(InstructionKind::ShowText, displays, text.as_bytes().to_vec());
    }

    /// `brightness` in [0, 1]; `blink_speed` is the per-beat brightness decrement, 0 disables blinking.
    pub fn set_brightness(&self, brightness: f64, blink_speed: u16, displays: ServerDisplay) {
        let scaled = (brightness.clamp(0.0, 1.0) * f64::from(u16::MAX)).round() as u16;
        let mut payload = scaled.to_be_bytes().to_vec();
        payload.extend_from_slice(&blink_speed.to_be_bytes());
        self.broadcast(InstructionKind::SetBrightness, displays, payload);
    }

    /// Makes sure every unit covering `displays` has all frames of the animation.
    ///
    /// Units that already report the animation are skipped. A unit that fails
    /// a frame is skipped for the rest of this animation; the others continue.
    pub fn upload_animation(
        &self,
        animation: AnimationId,
        frames: &[PathBuf],
        displays: ServerDisplay,
    ) -> anyhow::Result<()> {
        let id_bytes = animation.0.to_be_bytes();
        let Ok(frame_count) = u16::try_from(frames.len()) else {
            bail!(
                "animation {} has {} frames, at most {} can be uploaded",
                animation,
                frames.len(),
                u16::MAX
            );
        };

        let mut recipients: Vec<u8> = Vec::new();
        for unit in 0..UNIT_COUNT {
            if !displays.intersects(ServerDisplay::unit(unit)) {
                continue;
            }
            let Some(link) = self.link(unit) else {
                continue;
            };
            let exists = link.call(
                InstructionKind::DoesAnimationExist,
                frame_count,
                id_bytes.to_vec(),
            );
            if exists {
                debug!("unit {} already has animation {}", unit, animation);
            } else {
                recipients.push(unit);
            }
        }

        for (index, frame) in (0..frame_count).zip(frames) {
            if recipients.is_empty() {
                break;
            }
            let image = std::fs::read(frame)
                .with_context(|| format!("frame {} could not be read", frame.display()))?;
            let mut payload = id_bytes.to_vec();
            payload.extend_from_slice(&image);

            recipients.retain(|unit| {
                let accepted = self.link(*unit).map_or(false, |link| {
                    link.call(InstructionKind::UploadFrame, index, payload.clone())
                });
                if !accepted {
                    warn!(
                        "unit {} failed frame {} of animation {}, skipping it",
                        unit, index, animation
                    );
                }
                accepted
            });
        }

        info!("animation {} synchronized ({} frames)", animation, frames.len());
        Ok(())
    }

    fn lock_links(&self) -> std::sync::MutexGuard<'_, HashMap<u8, Arc<DisplayLink>>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Sender<u8>>> {
        self.logon_subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
