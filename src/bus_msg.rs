//! Message blocks for the BoxiBus.
//!
//! Every lighting effect is a sequence of memory field writes. The fixtures
//! latch parameter fields as they arrive and only act once the mode selector
//! and the apply field have been written, so every builder in here emits
//! parameters first, then the mode, then the apply message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest payload a single bus message may carry.
pub const MAX_PAYLOAD_LEN: usize = 6;

/// Number of palette slots reserved in the fixture memory.
pub const PALETTE_SLOTS: usize = 8;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("palette length cannot exceed {PALETTE_SLOTS}, but palette has {0} colors")]
    PaletteTooLarge(usize),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorError {
    #[error("a color needs exactly 6 channels, got {0}")]
    ChannelCount(usize),
    #[error("color channel {index} is {value}, which is outside of [0, 255]")]
    OutOfRange { index: usize, value: i64 },
}

/// Memory field addressed by a bus message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryField {
    StatusCode,
    LightingApply,
    LightingMode,
    LightingColorShift,
    LightingSpeed,
    LightingGeneralPurpose,
    LightingPaletteSize,
    /// One of the eight palette slots, 0-based.
    LightingPalette(u8),
}

impl MemoryField {
    pub fn tag(self) -> u8 {
        match self {
            MemoryField::StatusCode => 0x01,
            MemoryField::LightingApply => 0x02,
            MemoryField::LightingMode => 0x03,
            MemoryField::LightingColorShift => 0x04,
            MemoryField::LightingSpeed => 0x05,
            MemoryField::LightingGeneralPurpose => 0x06,
            MemoryField::LightingPaletteSize => 0x07,
            MemoryField::LightingPalette(slot) => 0x08 + (slot & 0x07),
        }
    }

    /// True for every field that configures an effect without selecting or applying it.
    pub fn is_parameter(self) -> bool {
        !matches!(
            self,
            MemoryField::LightingMode | MemoryField::LightingApply | MemoryField::StatusCode
        )
    }
}

/// A single field write on the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    field: MemoryField,
    payload: Vec<u8>,
}

impl BusMessage {
    fn new(field: MemoryField, payload: &[u8]) -> BusMessage {
        debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);
        BusMessage {
            field,
            payload: payload.to_vec(),
        }
    }

    pub fn field(&self) -> MemoryField {
        self.field
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// An ordered sequence of bus messages forming one complete effect.
pub type MessageBlock = Vec<BusMessage>;

/// One RGBWAU fixture color.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub white: u8,
    pub amber: u8,
    pub ultra_violet: u8,
}

impl Color {
    pub const WHITE: Color = Color::new(255, 255, 255, 255, 0, 0);

    pub const fn new(red: u8, green: u8, blue: u8, white: u8, amber: u8, ultra_violet: u8) -> Color {
        Color {
            red,
            green,
            blue,
            white,
            amber,
            ultra_violet,
        }
    }

    /// Builds a color from untrusted wide integers, e.g. form input.
    pub fn from_channels(channels: &[i64]) -> Result<Color, ColorError> {
        if channels.len() != 6 {
            return Err(ColorError::ChannelCount(channels.len()));
        }
        let mut bytes = [0u8; 6];
        for (index, &value) in channels.iter().enumerate() {
            bytes[index] = u8::try_from(value).map_err(|_| ColorError::OutOfRange { index, value })?;
        }
        Ok(Color::new(bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]))
    }

    pub fn to_bytes(self) -> [u8; 6] {
        [
            self.red,
            self.green,
            self.blue,
            self.white,
            self.amber,
            self.ultra_violet,
        ]
    }
}

/// Effect selector understood by the fixture firmware.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LightingModeId {
    Off = 0x00,
    SetColor = 0x01,
    FadeToColor = 0x02,
    PaletteFade = 0x03,
    PaletteSwitch = 0x04,
    PaletteBrightnessFlash = 0x05,
    PaletteHueFlash = 0x06,
    Strobe = 0x07,
}

/// Status shown by the fixtures while the installation boots or degrades.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DisplayStatusCode {
    Booting = 0x00,
    HostAwake = 0x01,
    HostNoActivity = 0x02,
    DisplayServerFailed = 0x03,
    HostConnectionFailed = 0x04,
    Active = 0x05,
}

fn convert_short(short: u16) -> [u8; 2] {
    short.to_be_bytes()
}

fn convert_bool(input: bool) -> [u8; 1] {
    [input as u8]
}

fn mode_message(mode: LightingModeId) -> BusMessage {
    BusMessage::new(MemoryField::LightingMode, &[mode as u8])
}

fn apply_message(apply_on_beat: bool) -> BusMessage {
    BusMessage::new(MemoryField::LightingApply, &convert_bool(apply_on_beat))
}

fn color_message(slot: u8, color: Color) -> BusMessage {
    BusMessage::new(MemoryField::LightingPalette(slot), &color.to_bytes())
}

fn convert_palette(palette: &[Color]) -> Result<MessageBlock, CodecError> {
    if palette.len() > PALETTE_SLOTS {
        return Err(CodecError::PaletteTooLarge(palette.len()));
    }
    let mut messages = Vec::with_capacity(palette.len() + 1);
    messages.push(BusMessage::new(
        MemoryField::LightingPaletteSize,
        &[palette.len() as u8],
    ));
    for (slot, color) in palette.iter().enumerate() {
        messages.push(color_message(slot as u8, *color));
    }
    Ok(messages)
}

/// Tells the fixtures which status to show for the given screen unit.
pub fn create_display_status_update(status: DisplayStatusCode, unit: u8) -> MessageBlock {
    vec![BusMessage::new(MemoryField::StatusCode, &[status as u8, unit])]
}

pub fn create_lighting_off(apply_on_beat: bool) -> MessageBlock {
    vec![mode_message(LightingModeId::Off), apply_message(apply_on_beat)]
}

pub fn create_lighting_set_color(boxi1: Color, boxi2: Color, apply_on_beat: bool) -> MessageBlock {
    vec![
        color_message(0, boxi1),
        color_message(1, boxi2),
        mode_message(LightingModeId::SetColor),
        apply_message(apply_on_beat),
    ]
}

pub fn create_lighting_fade_to_color(
    boxi1: Color,
    boxi2: Color,
    speed: u16,
    apply_on_beat: bool,
) -> MessageBlock {
    vec![
        color_message(0, boxi1),
        color_message(1, boxi2),
        BusMessage::new(MemoryField::LightingSpeed, &convert_short(speed)),
        mode_message(LightingModeId::FadeToColor),
        apply_message(apply_on_beat),
    ]
}

pub fn create_lighting_palette_fade(
    palette: &[Color],
    speed: u16,
    palette_shift: u8,
    apply_on_beat: bool,
) -> Result<MessageBlock, CodecError> {
    let mut block = convert_palette(palette)?;
    block.push(BusMessage::new(MemoryField::LightingSpeed, &convert_short(speed)));
    block.push(BusMessage::new(MemoryField::LightingColorShift, &[palette_shift]));
    block.push(mode_message(LightingModeId::PaletteFade));
    block.push(apply_message(apply_on_beat));
    Ok(block)
}

pub fn create_lighting_palette_switch(
    palette: &[Color],
    palette_shift: u8,
    apply_on_beat: bool,
) -> Result<MessageBlock, CodecError> {
    let mut block = convert_palette(palette)?;
    block.push(BusMessage::new(MemoryField::LightingColorShift, &[palette_shift]));
    block.push(mode_message(LightingModeId::PaletteSwitch));
    block.push(apply_message(apply_on_beat));
    Ok(block)
}

pub fn create_lighting_palette_brightness_flash(
    palette: &[Color],
    fade_out_speed: u16,
    target_brightness: u8,
    palette_shift: u8,
    apply_on_beat: bool,
) -> Result<MessageBlock, CodecError> {
    let mut block = convert_palette(palette)?;
    block.push(BusMessage::new(
        MemoryField::LightingSpeed,
        &convert_short(fade_out_speed),
    ));
    block.push(BusMessage::new(
        MemoryField::LightingGeneralPurpose,
        &[target_brightness],
    ));
    block.push(BusMessage::new(MemoryField::LightingColorShift, &[palette_shift]));
    block.push(mode_message(LightingModeId::PaletteBrightnessFlash));
    block.push(apply_message(apply_on_beat));
    Ok(block)
}

pub fn create_lighting_palette_hue_flash(
    palette: &[Color],
    fade_out_speed: u16,
    hue_shift: u8,
    palette_shift: u8,
    apply_on_beat: bool,
) -> Result<MessageBlock, CodecError> {
    let mut block = convert_palette(palette)?;
    block.push(BusMessage::new(
        MemoryField::LightingSpeed,
        &convert_short(fade_out_speed),
    ));
    block.push(BusMessage::new(MemoryField::LightingGeneralPurpose, &[hue_shift]));
    block.push(BusMessage::new(MemoryField::LightingColorShift, &[palette_shift]));
    block.push(mode_message(LightingModeId::PaletteHueFlash));
    block.push(apply_message(apply_on_beat));
    Ok(block)
}

pub fn create_lighting_strobe(
    color: Color,
    frequency: u16,
    rolloff: u8,
    apply_on_beat: bool,
) -> MessageBlock {
    vec![
        color_message(0, color),
        BusMessage::new(MemoryField::LightingSpeed, &convert_short(frequency)),
        BusMessage::new(MemoryField::LightingGeneralPurpose, &[rolloff]),
        mode_message(LightingModeId::Strobe),
        apply_message(apply_on_beat),
    ]
}

/// A fully parameterised lighting effect.
///
/// This is what overrides are deserialized into and what the auto mode
/// produces before encoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LightingEffect {
    Off,
    SetColor {
        boxi1: Color,
        boxi2: Color,
    },
    FadeToColor {
        boxi1: Color,
        boxi2: Color,
        speed: u16,
    },
    PaletteFade {
        palette: Vec<Color>,
        speed: u16,
        #[serde(default)]
        shift: u8,
    },
    PaletteSwitch {
        palette: Vec<Color>,
        #[serde(default)]
        shift: u8,
    },
    PaletteBrightnessFlash {
        palette: Vec<Color>,
        fade_out_speed: u16,
        target_brightness: u8,
        #[serde(default)]
        shift: u8,
    },
    PaletteHueFlash {
        palette: Vec<Color>,
        fade_out_speed: u16,
        hue_shift: u8,
        #[serde(default)]
        shift: u8,
    },
    Strobe {
        color: Color,
        frequency: u16,
        rolloff: u8,
    },
}

impl LightingEffect {
    pub fn mode_id(&self) -> LightingModeId {
        match self {
            LightingEffect::Off => LightingModeId::Off,
            LightingEffect::SetColor { .. } => LightingModeId::SetColor,
            LightingEffect::FadeToColor { .. } => LightingModeId::FadeToColor,
            LightingEffect::PaletteFade { .. } => LightingModeId::PaletteFade,
            LightingEffect::PaletteSwitch { .. } => LightingModeId::PaletteSwitch,
            LightingEffect::PaletteBrightnessFlash { .. } => LightingModeId::PaletteBrightnessFlash,
            LightingEffect::PaletteHueFlash { .. } => LightingModeId::PaletteHueFlash,
            LightingEffect::Strobe { .. } => LightingModeId::Strobe,
        }
    }

    pub fn encode(&self, apply_on_beat: bool) -> Result<MessageBlock, CodecError> {
        let block = match self {
            LightingEffect::Off => create_lighting_off(apply_on_beat),
            LightingEffect::SetColor { boxi1, boxi2 } => {
                create_lighting_set_color(*boxi1, *boxi2, apply_on_beat)
            }
            LightingEffect::FadeToColor {
                boxi1,
                boxi2,
                speed,
            } => create_lighting_fade_to_color(*boxi1, *boxi2, *speed, apply_on_beat),
            LightingEffect::PaletteFade {
                palette,
                speed,
                shift,
            } => create_lighting_palette_fade(palette, *speed, *shift, apply_on_beat)?,
            LightingEffect::PaletteSwitch { palette, shift } => {
                create_lighting_palette_switch(palette, *shift, apply_on_beat)?
            }
            LightingEffect::PaletteBrightnessFlash {
                palette,
                fade_out_speed,
                target_brightness,
                shift,
            } => create_lighting_palette_brightness_flash(
                palette,
                *fade_out_speed,
                *target_brightness,
                *shift,
                apply_on_beat,
            )?,
            LightingEffect::PaletteHueFlash {
                palette,
                fade_out_speed,
                hue_shift,
                shift,
            } => create_lighting_palette_hue_flash(
                palette,
                *fade_out_speed,
                *hue_shift,
                *shift,
                apply_on_beat,
            )?,
            LightingEffect::Strobe {
                color,
                frequency,
                rolloff,
            } => create_lighting_strobe(*color, *frequency, *rolloff, apply_on_beat),
        };
        Ok(block)
    }
}
