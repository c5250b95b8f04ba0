use std::path::PathBuf;

use clap::Parser;

/// Runs the light show of the Boxi installation.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct DaemonArgs {
    /// Serial port of the fixture microcontrollers.
    #[clap(short, long, default_value = "/dev/ttyAMA0")]
    pub serial_port: String,

    /// Baud rate of the serial port. Must match the firmware.
    #[clap(short = 'r', long, default_value = "19200")]
    pub baud_rate: u32,

    /// The address screen units connect to.
    #[clap(short, long, default_value = "0.0.0.0:25621")]
    pub display_bind: String,

    /// The listen address of the control API.
    #[clap(short, long, default_value = "localhost:8080")]
    pub bind: String,

    /// Directory holding palettes.json, animations.json and auto_mode.json.
    #[clap(short, long, default_value = "Configuration")]
    pub config_dir: PathBuf,

    /// Directory holding the frames of every animation.
    #[clap(short, long, default_value = "animations")]
    pub animations_dir: PathBuf,

    /// The sysfs value file of the beat detector pin.
    #[clap(short = 'p', long)]
    pub beat_pin: Option<PathBuf>,

    /// Log hardware instructions instead of sending them.
    #[clap(long)]
    pub debug_hardware: bool,
}

/// Pretends to be a screen unit and logs what it would display.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct UnitArgs {
    /// Address of the daemon's display server.
    #[clap(short, long, default_value = "localhost:25621")]
    pub server: String,

    /// Which unit to pretend to be, 0 or 1.
    #[clap(short, long, default_value = "0")]
    pub unit: u8,

    /// Answer every correlated instruction with failure.
    #[clap(long)]
    pub reject: bool,
}
