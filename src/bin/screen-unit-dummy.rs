use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::{info, warn};

use boxi::args::UnitArgs;
use boxi::display_msg::{encode_handshake, Instruction, InstructionKind, Reply, ServerDisplay};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Frame indices received per animation.
type FrameStore = HashMap<u32, BTreeSet<u16>>;

fn animation_id(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    return Some(u32::from_be_bytes(bytes));
}

fn answer(instruction: &Instruction, frames: &mut FrameStore, args: &UnitArgs) -> bool {
    if args.reject {
        return false;
    }
    let Some(id) = animation_id(&instruction.payload) else {
        warn!("{:?} without animation id", instruction.kind);
        return false;
    };
    match instruction.kind {
        InstructionKind::DoesAnimationExist => {
            let known = frames.get(&id).map_or(0, |received| received.len());
            return known >= instruction.param as usize;
        }
        InstructionKind::UploadFrame => {
            frames.entry(id).or_default().insert(instruction.param);
            info!(
                "frame {} of animation {} ({} bytes)",
                instruction.param,
                id,
                instruction.payload.len() - 4
            );
            return true;
        }
        _ => return false,
    }
}

fn display(instruction: &Instruction, unit: u8) {
    let screens = ServerDisplay::from_local(unit, instruction.param);
    match instruction.kind {
        InstructionKind::PlayAnimation => match animation_id(&instruction.payload) {
            Some(id) => info!("playing animation {} on {:?}", id, screens),
            None => warn!("PlayAnimation without animation id"),
        },
        InstructionKind::ShowText => {
            let text = String::from_utf8_lossy(&instruction.payload);
            info!("showing {:?} on {:?}", text, screens);
        }
        InstructionKind::SetBrightness => {
            let value = |offset: usize| {
                instruction
                    .payload
                    .get(offset..offset + 2)
                    .map_or(0, |b| u16::from_be_bytes([b[0], b[1]]))
            };
            info!(
                "brightness {:.2}, blink speed {} on {:?}",
                f64::from(value(0)) / f64::from(u16::MAX),
                value(2),
                screens
            );
        }
        _ => (),
    }
}

fn serve(args: &UnitArgs, frames: &mut FrameStore) -> anyhow::Result<()> {
    let mut stream = TcpStream::connect(&args.server)
        .with_context(|| format!("display server {} unreachable", args.server))?;
    stream.write_all(&encode_handshake(args.unit))?;
    info!("connected to {} as unit {}", args.server, args.unit);

    let mut reader = stream.try_clone()?;
    loop {
        let instruction = Instruction::read_from(&mut reader)?;
        match instruction.correlation {
            Some(correlation) => {
                let success = answer(&instruction, frames, args);
                stream.write_all(&Reply { correlation, success }.encode())?;
            }
            None => display(&instruction, args.unit),
        }
    }
}

/// A screen unit without screens: logs what it would show.
fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = UnitArgs::parse();
    let mut frames = FrameStore::new();
    loop {
        if let Err(err) = serve(&args, &mut frames) {
            warn!("{:#}, reconnecting", err);
        }
        thread::sleep(RECONNECT_DELAY);
    }
}
