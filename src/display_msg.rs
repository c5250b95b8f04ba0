//! Wire format between the host and the screen units.
//!
//! ```text
//! handshake (unit -> host):  "hewwo:" | unit id (1B)
//! instruction (host -> unit): "yiff" | kind (1B) | correlation (4B, acknowledged kinds only)
//!                             | param (2B) | payload length (4B) | payload
//! reply (unit -> host):       0xE6 0x21 | correlation (4B) | result (1B)
//! ```
//!
//! All integers are big-endian.

use std::fmt;
use std::io::{self, Read};
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const HANDSHAKE_MAGIC: [u8; 6] = *b"hewwo:";
pub const HANDSHAKE_LEN: usize = HANDSHAKE_MAGIC.len() + 1;
pub const INSTRUCTION_MAGIC: [u8; 4] = *b"yiff";
pub const REPLY_MAGIC: [u8; 2] = [0xE6, 0x21];
pub const REPLY_LEN: usize = REPLY_MAGIC.len() + 4 + 1;

/// Number of screen units the installation is wired for.
pub const UNIT_COUNT: u8 = 2;

/// Upper bound for a single payload; a frame image is far below this.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake is malformed")]
    BadHandshake,
    #[error("unit id {0} is not supported")]
    UnknownUnit(u8),
    #[error("frame has a bad header")]
    BadMagic,
    #[error("unknown instruction kind {0:#04x}")]
    UnknownKind(u8),
    #[error("payload of {0} bytes is too large")]
    PayloadTooLarge(usize),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnimationId(pub u32);

impl fmt::Display for AnimationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Set of physical screen positions.
///
/// Unit `n` owns the two adjacent bits `2n` and `2n + 1`.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerDisplay(u8);

impl ServerDisplay {
    pub const NONE: ServerDisplay = ServerDisplay(0);
    pub const BOXI1_D1: ServerDisplay = ServerDisplay(0b0001);
    pub const BOXI1_D2: ServerDisplay = ServerDisplay(0b0010);
    pub const BOXI2_D1: ServerDisplay = ServerDisplay(0b0100);
    pub const BOXI2_D2: ServerDisplay = ServerDisplay(0b1000);
    pub const ALL: ServerDisplay = ServerDisplay(0b1111);

    const LOCAL_MASK: u8 = 0b11;

    /// Keeps only bits that map to a real position.
    pub fn from_bits(bits: u8) -> ServerDisplay {
        ServerDisplay(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Both positions of a unit.
    pub fn unit(unit: u8) -> ServerDisplay {
        ServerDisplay::from_local(unit, Self::LOCAL_MASK as u16)
    }

    /// Screen `screen` (0 or 1) of `unit`.
    pub fn position(unit: u8, screen: u8) -> ServerDisplay {
        ServerDisplay::from_local(unit, 1 << (screen & 1))
    }

    pub fn from_local(unit: u8, local: u16) -> ServerDisplay {
        if unit >= UNIT_COUNT {
            return ServerDisplay::NONE;
        }
        ServerDisplay::from_bits(((local as u8) & Self::LOCAL_MASK) << (unit * 2))
    }

    /// The unit-local 2-bit mask of this set, as carried in the instruction parameter.
    pub fn local_to(self, unit: u8) -> u16 {
        if unit >= UNIT_COUNT {
            return 0;
        }
        ((self.0 >> (unit * 2)) & Self::LOCAL_MASK) as u16
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: ServerDisplay) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: ServerDisplay) -> bool {
        self.0 & other.0 != 0
    }

    pub fn without(self, other: ServerDisplay) -> ServerDisplay {
        ServerDisplay(self.0 & !other.0)
    }

    /// Single-position sets, in position order.
    pub fn positions(self) -> impl Iterator<Item = ServerDisplay> {
        (0..4u8)
            .map(|bit| ServerDisplay(1 << bit))
            .filter(move |position| self.contains(*position))
    }
}

impl BitOr for ServerDisplay {
    type Output = ServerDisplay;
    fn bitor(self, rhs: ServerDisplay) -> ServerDisplay {
        ServerDisplay(self.0 | rhs.0)
    }
}

impl BitOrAssign for ServerDisplay {
    fn bitor_assign(&mut self, rhs: ServerDisplay) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ServerDisplay {
    type Output = ServerDisplay;
    fn bitand(self, rhs: ServerDisplay) -> ServerDisplay {
        ServerDisplay(self.0 & rhs.0)
    }
}

impl fmt::Debug for ServerDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerDisplay({:#06b})", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum InstructionKind {
    DoesAnimationExist = 0x01,
    UploadFrame = 0x02,
    PlayAnimation = 0x03,
    ShowText = 0x04,
    SetBrightness = 0x05,
}

impl InstructionKind {
    pub fn from_byte(byte: u8) -> Result<InstructionKind, FrameError> {
        match byte {
            0x01 => Ok(InstructionKind::DoesAnimationExist),
            0x02 => Ok(InstructionKind::UploadFrame),
            0x03 => Ok(InstructionKind::PlayAnimation),
            0x04 => Ok(InstructionKind::ShowText),
            0x05 => Ok(InstructionKind::SetBrightness),
            other => Err(FrameError::UnknownKind(other)),
        }
    }

    /// Acknowledged kinds carry a correlation id and get a reply frame.
    pub fn expects_reply(self) -> bool {
        matches!(
            self,
            InstructionKind::DoesAnimationExist | InstructionKind::UploadFrame
        )
    }
}

/// One host to unit instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub kind: InstructionKind,
    /// Present exactly when `kind.expects_reply()`.
    pub correlation: Option<u32>,
    pub param: u16,
    pub payload: Vec<u8>,
}

impl Instruction {
    pub fn new(kind: InstructionKind, param: u16, payload: Vec<u8>) -> Instruction {
        Instruction {
            kind,
            correlation: None,
            param,
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation: u32) -> Instruction {
        self.correlation = Some(correlation);
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(15 + self.payload.len());
        buffer.extend_from_slice(&INSTRUCTION_MAGIC);
        buffer.push(self.kind as u8);
        if self.kind.expects_reply() {
            buffer.extend_from_slice(&self.correlation.unwrap_or(0).to_be_bytes());
        }
        buffer.extend_from_slice(&self.param.to_be_bytes());
        buffer.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buffer.extend_from_slice(&self.payload);
        buffer
    }

    /// Reads exactly one instruction from a stream.
    pub fn read_from(reader: &mut impl Read) -> Result<Instruction, FrameError> {
        let mut head = [0u8; 5];
        reader.read_exact(&mut head)?;
        if head[..4] != INSTRUCTION_MAGIC {
            return Err(FrameError::BadMagic);
        }
        let kind = InstructionKind::from_byte(head[4])?;

        let correlation = if kind.expects_reply() {
            let mut id = [0u8; 4];
            reader.read_exact(&mut id)?;
            Some(u32::from_be_bytes(id))
        } else {
            None
        };

        let mut fixed = [0u8; 6];
        reader.read_exact(&mut fixed)?;
        let param = u16::from_be_bytes([fixed[0], fixed[1]]);
        let len = u32::from_be_bytes([fixed[2], fixed[3], fixed[4], fixed[5]]) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(len));
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        Ok(Instruction {
            kind,
            correlation,
            param,
            payload,
        })
    }
}

/// Acknowledgement of a correlated instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub correlation: u32,
    pub success: bool,
}

impl Reply {
    pub fn encode(&self) -> [u8; REPLY_LEN] {
        let id = self.correlation.to_be_bytes();
        [
            REPLY_MAGIC[0],
            REPLY_MAGIC[1],
            id[0],
            id[1],
            id[2],
            id[3],
            self.success as u8,
        ]
    }

    pub fn decode(buffer: &[u8; REPLY_LEN]) -> Result<Reply, FrameError> {
        if buffer[..2] != REPLY_MAGIC {
            return Err(FrameError::BadMagic);
        }
        Ok(Reply {
            correlation: u32::from_be_bytes([buffer[2], buffer[3], buffer[4], buffer[5]]),
            success: buffer[6] != 0,
        })
    }

    pub fn read_from(reader: &mut impl Read) -> Result<Reply, FrameError> {
        let mut buffer = [0u8; REPLY_LEN];
        reader.read_exact(&mut buffer)?;
        Reply::decode(&buffer)
    }
}

pub fn encode_handshake(unit: u8) -> [u8; HANDSHAKE_LEN] {
    let mut buffer = [0u8; HANDSHAKE_LEN];
    buffer[..HANDSHAKE_MAGIC.len()].copy_from_slice(&HANDSHAKE_MAGIC);
    buffer[HANDSHAKE_MAGIC.len()] = unit;
    buffer
}

/// Reads the welcome message and returns the unit id.
pub fn read_handshake(reader: &mut impl Read) -> Result<u8, FrameError> {
    let mut buffer = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut buffer).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FrameError::BadHandshake,
        _ => FrameError::Io(e),
    })?;
    if buffer[..HANDSHAKE_MAGIC.len()] != HANDSHAKE_MAGIC {
        return Err(FrameError::BadHandshake);
    }
    let unit = buffer[HANDSHAKE_MAGIC.len()];
    if unit >= UNIT_COUNT {
        return Err(FrameError::UnknownUnit(unit));
    }
    Ok(unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_unit_positions() {
        assert_eq!(ServerDisplay::unit(0), ServerDisplay::BOXI1_D1 | ServerDisplay::BOXI1_D2);
        assert_eq!(ServerDisplay::unit(1), ServerDisplay::BOXI2_D1 | ServerDisplay::BOXI2_D2);
        assert_eq!(ServerDisplay::unit(2), ServerDisplay::NONE);
        assert_eq!(ServerDisplay::position(1, 1), ServerDisplay::BOXI2_D2);
        assert_eq!(ServerDisplay::BOXI2_D2.local_to(1), 0b10);
        assert_eq!(ServerDisplay::BOXI2_D2.local_to(0), 0);
        assert_eq!(ServerDisplay::ALL.without(ServerDisplay::BOXI1_D1).bits(), 0b1110);
        assert_eq!(ServerDisplay::from_bits(0xFF), ServerDisplay::ALL);
    }

    #[test]
    fn test_positions_iterates_single_bits() {
        let set = ServerDisplay::BOXI1_D2 | ServerDisplay::BOXI2_D2;
        let positions: Vec<_> = set.positions().collect();
        assert_eq!(positions, vec![ServerDisplay::BOXI1_D2, ServerDisplay::BOXI2_D2]);
    }

    #[test]
    fn test_play_animation_layout() {
        let instruction = Instruction::new(InstructionKind::PlayAnimation, 0b01, vec![0, 0, 0, 7]);
        let bytes = instruction.encode();
        assert_eq!(
            bytes,
            vec![b'y', b'i', b'f', b'f', 0x03, 0x00, 0x01, 0, 0, 0, 4, 0, 0, 0, 7]
        );
    }

    #[test]
    fn test_correlated_layout() {
        let instruction = Instruction::new(InstructionKind::DoesAnimationExist, 12, vec![])
            .with_correlation(0xDEADBEEF);
        let bytes = instruction.encode();
        assert_eq!(&bytes[5..9], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&bytes[9..11], &[0, 12]);
        assert_eq!(bytes.len(), 15);
    }

    #[test]
    fn test_bad_instruction_magic() {
        let mut bytes = Instruction::new(InstructionKind::ShowText, 1, b"hi".to_vec()).encode();
        bytes[0] = b'x';
        assert!(matches!(
            Instruction::read_from(&mut &bytes[..]),
            Err(FrameError::BadMagic)
        ));
    }

    #[test]
    fn test_reply_roundtrip_and_magic() {
        let reply = Reply {
            correlation: 42,
            success: true,
        };
        let bytes = reply.encode();
        assert_eq!(bytes, [0xE6, 0x21, 0, 0, 0, 42, 1]);
        assert_eq!(Reply::decode(&bytes).unwrap(), reply);

        let mut bad = bytes;
        bad[1] = 0x22;
        assert!(matches!(Reply::decode(&bad), Err(FrameError::BadMagic)));
    }

    #[test]
    fn test_handshake() {
        assert_eq!(read_handshake(&mut &encode_handshake(1)[..]).unwrap(), 1);
        assert!(matches!(
            read_handshake(&mut &b"hewwo"[..]),
            Err(FrameError::BadHandshake)
        ));
        assert!(matches!(
            read_handshake(&mut &b"hello:\x00"[..]),
            Err(FrameError::BadHandshake)
        ));
        assert!(matches!(
            read_handshake(&mut &encode_handshake(5)[..]),
            Err(FrameError::UnknownUnit(5))
        ));
    }

    fn arb_kind() -> impl Strategy<Value = InstructionKind> {
        prop_oneof![
            Just(InstructionKind::DoesAnimationExist),
            Just(InstructionKind::UploadFrame),
            Just(InstructionKind::PlayAnimation),
            Just(InstructionKind::ShowText),
            Just(InstructionKind::SetBrightness),
        ]
    }

    proptest! {
        #[test]
        fn instruction_roundtrip(
            kind in arb_kind(),
            correlation in any::<u32>(),
            param in any::<u16>(),
            payload in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let mut instruction = Instruction::new(kind, param, payload);
            if kind.expects_reply() {
                instruction = instruction.with_correlation(correlation);
            }
            let bytes = instruction.encode();
            let mut reader = &bytes[..];
            let decoded = Instruction::read_from(&mut reader).unwrap();
            prop_assert_eq!(decoded, instruction);
            prop_assert!(reader.is_empty());
        }
    }
}
