//! Side-protocol wire types for the networked transport.
//!
//! Two fixed-size UDP protocols run next to CHDR on a networked device:
//! firmware peek/poke (also used for discovery) and the MTU echo probe.
//! Both are big-endian on the wire. The structs are `#[repr(C, packed)]`
//! with zerocopy derives, so parsing is a bounds-checked cast.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Ports ─────────────────────────────────────────────────────────────────────

/// Firmware control (peek/poke and discovery).
pub const FW_COMMS_UDP_PORT: u16 = 49152;

/// CHDR traffic.
pub const CHDR_UDP_PORT: u16 = 49153;

/// MTU echo probe.
pub const MTU_PROBE_UDP_PORT: u16 = 49158;

// ── Firmware control ──────────────────────────────────────────────────────────

pub const FW_COMMS_FLAGS_ACK: u32 = 1 << 0;
pub const FW_COMMS_FLAGS_ERROR: u32 = 1 << 1;
pub const FW_COMMS_FLAGS_POKE32: u32 = 1 << 2;
pub const FW_COMMS_FLAGS_PEEK32: u32 = 1 << 3;

/// Request/reply for a single 32-bit register access.
///
/// The reply echoes `flags`, `sequence` and `addr`; a peek reply carries the
/// register value in `data`. Discovery uses a bare ACK request.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FwCommsPacket {
    pub flags: U32<BigEndian>,
    pub sequence: U32<BigEndian>,
    pub addr: U32<BigEndian>,
    pub data: U32<BigEndian>,
}

assert_eq_size!(FwCommsPacket, [u8; 16]);

impl FwCommsPacket {
    pub fn new(flags: u32, sequence: u32, addr: u32, data: u32) -> Self {
        Self {
            flags: U32::new(flags),
            sequence: U32::new(sequence),
            addr: U32::new(addr),
            data: U32::new(data),
        }
    }

    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    pub fn sequence(&self) -> u32 {
        self.sequence.get()
    }

    pub fn addr(&self) -> u32 {
        self.addr.get()
    }

    pub fn data(&self) -> u32 {
        self.data.get()
    }

    /// Parse from the front of a datagram. Trailing bytes are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        Self::read_from_prefix(bytes).ok_or(WireError::Truncated {
            expected: std::mem::size_of::<Self>(),
            actual: bytes.len(),
        })
    }
}

// ── MTU probe ─────────────────────────────────────────────────────────────────

pub const MTU_PROBE_FLAGS_ECHO_REQUEST: u32 = 1 << 0;
pub const MTU_PROBE_FLAGS_ECHO_REPLY: u32 = 1 << 1;
pub const MTU_PROBE_FLAGS_ERROR: u32 = 1 << 2;

/// Echo request/reply used to measure path MTU.
///
/// An 8-byte request asking for `size` bytes is answered with a `size`-byte
/// datagram (receive direction). A `size`-byte request is answered with an
/// 8-byte reply whose `size` is the byte count that arrived (send direction).
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MtuProbe {
    pub flags: U32<BigEndian>,
    pub size: U32<BigEndian>,
}

assert_eq_size!(MtuProbe, [u8; 8]);

impl MtuProbe {
    pub fn request(size: u32) -> Self {
        Self {
            flags: U32::new(MTU_PROBE_FLAGS_ECHO_REQUEST),
            size: U32::new(size),
        }
    }

    pub fn reply(size: u32) -> Self {
        Self {
            flags: U32::new(MTU_PROBE_FLAGS_ECHO_REPLY),
            size: U32::new(size),
        }
    }

    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    pub fn size(&self) -> u32 {
        self.size.get()
    }

    pub fn is_reply(&self) -> bool {
        self.flags() & MTU_PROBE_FLAGS_ECHO_REPLY != 0
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        Self::read_from_prefix(bytes).ok_or(WireError::Truncated {
            expected: std::mem::size_of::<Self>(),
            actual: bytes.len(),
        })
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Smallest datagram every IPv4 host must accept (576) minus IP and UDP headers.
pub const MIN_UDP_PAYLOAD: usize = 576 - 28;

/// Largest size the MTU search will try.
pub const MAX_PROBE_SIZE: usize = 8000;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unexpected flags in reply: 0x{0:08x}")]
    UnexpectedFlags(u32),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
