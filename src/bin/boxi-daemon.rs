#![allow(unreachable_code)]
#[macro_use]
extern crate rouille;
extern crate serde;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use log::{info, warn};
use rouille::{Request, Response};
use serde::{Deserialize, Serialize};

use boxi::args::DaemonArgs;
use boxi::bus::BusHub;
use boxi::bus_msg::LightingEffect;
use boxi::catalog::{CatalogError, Palette};
use boxi::config::{AutoModeConfiguration, LightingMood, ModeCharacter};
use boxi::display_msg::{AnimationId, ServerDisplay};
use boxi::display_server::DisplayRegistry;
use boxi::frames::{FrameDirectory, FrameSource};
use boxi::hardware::{BeatInput, DebugHardware, Hardware, HardwareManager, SysfsBeatPin};
use boxi::selection::{AnimationPlacement, AnimationsInstruction, LightingInstruction};
use boxi::{Stores, TextInstruction, VisualManager};

/// Screen units need a moment to connect before the first full selection.
const STARTUP_DIRTY_DELAY: Duration = Duration::from_secs(12);

#[derive(Serialize, Debug)]
struct AboutResponse {
    version: String,
}

#[derive(Deserialize, Debug)]
struct LightingOverrideRequest {
    /// `None` resumes the auto mode.
    effect: Option<LightingEffect>,
    #[serde(default)]
    apply_on_beat: bool,
}

#[derive(Deserialize, Debug)]
struct AnimationOverrideRequest {
    animations: Option<Vec<AnimationPlacement>>,
}

#[derive(Deserialize, Debug)]
struct BrightnessRequest {
    brightness: f64,
}

#[derive(Deserialize, Debug)]
struct NewPaletteRequest {
    name: String,
    moods: Vec<LightingMood>,
}

#[derive(Serialize, Debug)]
struct CreatedResponse {
    id: u32,
}

#[derive(Deserialize, Debug)]
struct ImportRequest {
    path: PathBuf,
    name: String,
    mood: LightingMood,
    #[serde(default)]
    split: bool,
    #[serde(default)]
    nsfw: bool,
}

#[derive(Deserialize, Debug)]
struct AnimationUpdateRequest {
    name: String,
    mood: LightingMood,
    #[serde(default)]
    nsfw: bool,
}

#[derive(Deserialize, Debug)]
struct MoodRequest {
    mood: LightingMood,
}

#[derive(Deserialize, Debug)]
struct NsfwRequest {
    allow: bool,
}

fn catalog_error(e: CatalogError) -> Response {
    let status = match e {
        CatalogError::TooManyColors(_) => 400,
        CatalogError::UnknownPalette(_) | CatalogError::UnknownAnimation(_) => 404,
        CatalogError::Storage(_) => 500,
    };
    warn!("catalog request failed: {:#}", e);
    return Response::text(e.to_string()).with_status_code(status);
}

fn server_error(e: anyhow::Error) -> Response {
    warn!("request failed: {:#}", e);
    return Response::text(format!("{:#}", e)).with_status_code(500);
}

fn update_config(visuals: &VisualManager, change: impl FnOnce(&mut AutoModeConfiguration)) -> Response {
    let mut config = visuals.configuration();
    change(&mut config);
    return match visuals.update_configuration(config) {
        Ok(()) => Response::json(&visuals.configuration()),
        Err(e) => server_error(e),
    };
}

fn handle(request: &Request, visuals: &VisualManager, debug: Option<&DebugHardware>) -> Response {
    let version: &str = option_env!("CARGO_PKG_VERSION").unwrap_or("unknown");
    router!(request,
        (GET) (/) => {
            return Response::redirect_302("/api/status");
        },

        (GET) (/api/ping) => {
            return Response::text("");
        },

        (GET) (/api/about) => {
            return Response::json(&AboutResponse { version: version.to_string() });
        },

        (GET) (/api/status) => {
            return Response::json(&visuals.status());
        },

        (POST) (/api/lighting/mode) => {
            let input: LightingOverrideRequest = try_or_400!(rouille::input::json_input(request));
            let instruction = match input.effect {
                Some(effect) => match LightingInstruction::new(effect, input.apply_on_beat) {
                    Ok(instruction) => Some(instruction),
                    Err(e) => return Response::text(e.to_string()).with_status_code(400),
                },
                None => None,
            };
            visuals.set_lighting_override(instruction);
            return Response::text("success");
        },

        (POST) (/api/screen/animation) => {
            let input: AnimationOverrideRequest = try_or_400!(rouille::input::json_input(request));
            let instruction = input.animations.map(|placements| {
                AnimationsInstruction::from_positions(
                    placements.into_iter().map(|p| (p.animation, p.displays)),
                    ModeCharacter::Unknown,
                )
            });
            visuals.set_animations_override(instruction);
            return Response::text("success");
        },

        (POST) (/api/screen/text) => {
            let texts: Vec<TextInstruction> = try_or_400!(rouille::input::json_input(request));
            visuals.set_texts(texts);
            return Response::text("success");
        },

        (POST) (/api/screen/brightness) => {
            let input: BrightnessRequest = try_or_400!(rouille::input::json_input(request));
            if !(0.0..=1.0).contains(&input.brightness) {
                return Response::text("brightness must be within [0, 1]").with_status_code(400);
            }
            visuals.set_screen_brightness(input.brightness);
            return Response::text("success");
        },

        (GET) (/api/screen/connected) => {
            let connected: Vec<ServerDisplay> = visuals.connected_displays().positions().collect();
            return Response::json(&connected);
        },

        (GET) (/api/palettes) => {
            return Response::json(&visuals.palette_catalog().all());
        },

        (POST) (/api/palette) => {
            let input: NewPaletteRequest = try_or_400!(rouille::input::json_input(request));
            return match visuals.palette_catalog().create(&input.name, input.moods) {
                Ok(id) => Response::json(&CreatedResponse { id }),
                Err(e) => catalog_error(e),
            };
        },

        (GET) (/api/palette/{id: u32}) => {
            return match visuals.palette_catalog().get(id) {
                Some(palette) => Response::json(&palette),
                None => Response::empty_404(),
            };
        },

        (PUT) (/api/palette/{id: u32}) => {
            let mut palette: Palette = try_or_400!(rouille::input::json_input(request));
            palette.id = id;
            return match visuals.palette_catalog().set(palette) {
                Ok(()) => Response::text("success"),
                Err(e) => catalog_error(e),
            };
        },

        (DELETE) (/api/palette/{id: u32}) => {
            return match visuals.palette_catalog().remove(id) {
                Ok(_) => Response::text("success"),
                Err(e) => catalog_error(e),
            };
        },

        (GET) (/api/animations) => {
            return Response::json(&visuals.animation_catalog().all());
        },

        (POST) (/api/animation) => {
            let input: ImportRequest = try_or_400!(rouille::input::json_input(request));
            return match visuals.import_animation(&input.path, &input.name, input.mood, input.split, input.nsfw) {
                Ok(animation) => Response::json(&animation),
                Err(e) => catalog_error(e),
            };
        },

        (PUT) (/api/animation/{id: u32}) => {
            let input: AnimationUpdateRequest = try_or_400!(rouille::input::json_input(request));
            return match visuals.animation_catalog().update(AnimationId(id), &input.name, input.mood, input.nsfw) {
                Ok(animation) => Response::json(&animation),
                Err(e) => catalog_error(e),
            };
        },

        (DELETE) (/api/animation/{id: u32}) => {
            return match visuals.animation_catalog().remove(AnimationId(id)) {
                Ok(_) => Response::text("success"),
                Err(e) => catalog_error(e),
            };
        },

        (GET) (/api/config) => {
            return Response::json(&visuals.configuration());
        },

        (PUT) (/api/config) => {
            let config: AutoModeConfiguration = try_or_400!(rouille::input::json_input(request));
            return update_config(visuals, |current| *current = config);
        },

        (POST) (/api/config/mood) => {
            let input: MoodRequest = try_or_400!(rouille::input::json_input(request));
            return update_config(visuals, |config| config.mood = input.mood);
        },

        (POST) (/api/config/nsfw) => {
            let input: NsfwRequest = try_or_400!(rouille::input::json_input(request));
            return update_config(visuals, |config| config.allow_nsfw = input.allow);
        },

        (POST) (/api/beat) => {
            return match debug {
                Some(hardware) => {
                    hardware.trigger_beat();
                    Response::text("success")
                }
                None => Response::empty_404(),
            };
        },

        _ => Response::empty_404()
    )
}

fn open_hardware(args: &DaemonArgs, frames: Arc<dyn FrameSource>) -> anyhow::Result<Arc<dyn Hardware>> {
    let bus = BusHub::open(&args.serial_port, args.baud_rate)?;
    let displays = DisplayRegistry::new();
    displays.listen(args.display_bind.as_str())?;
    let beat: Option<Box<dyn BeatInput>> = match &args.beat_pin {
        Some(path) => Some(Box::new(SysfsBeatPin::open(path)?)),
        None => {
            warn!("no beat pin given, the auto mode will stay calm");
            None
        }
    };
    return Ok(Arc::new(HardwareManager::new(bus, displays, frames, beat)));
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = DaemonArgs::parse();

    let frames: Arc<dyn FrameSource> = Arc::new(FrameDirectory::new(&args.animations_dir));
    let mut debug = None;
    let hardware: Arc<dyn Hardware> = if args.debug_hardware {
        let hardware = Arc::new(DebugHardware::new(ServerDisplay::ALL));
        debug = Some(hardware.clone());
        hardware
    } else {
        open_hardware(&args, frames.clone())?
    };

    let visuals = VisualManager::new(hardware, frames, Stores::json(&args.config_dir));
    visuals.start();

    let delayed = Arc::downgrade(&visuals);
    thread::spawn(move || {
        thread::sleep(STARTUP_DIRTY_DELAY);
        if let Some(visuals) = delayed.upgrade() {
            visuals.mark_dirty();
        }
    });

    info!("starting control api on {}", args.bind);
    rouille::start_server(args.bind, move |request| {
        rouille::log(request, io::stdout(), || {
            handle(request, &visuals, debug.as_deref())
        })
    });
    return Ok(());
}
