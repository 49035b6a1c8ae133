//! cxlsim wire format — on-link types for every flit.
//!
//! A flit is a fixed-size unit: one `FlitHeader`, then `slot_count` slots of
//! (`SlotHeader` + fixed payload region), then an integrity trailer. The slot
//! count and payload region size come from the link's `FlitLayout`; every flit
//! on a link has the same size no matter how many slots are occupied.
//!
//! Multi-byte fields use zerocopy's little-endian wrappers so the layout does
//! not depend on the host. There is no unsafe code in this module.

use std::fmt;

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Flit Header ──────────────────────────────────────────────────────────────

/// Leads every flit.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FlitHeader {
    /// Wire format version. Currently 0x01.
    /// A receiver seeing an unknown version drops the flit.
    pub version: u8,

    /// Number of slots in this flit. Must equal the receiver's layout.
    pub slot_count: u8,

    /// Bit i is set iff slot i carries a packet.
    pub occupancy: U16<LittleEndian>,

    /// Per-link, per-direction flit counter. Wraps.
    pub sequence: U32<LittleEndian>,

    /// Credits handed back to the peer, one byte per protocol
    /// in `ProtocolKind::ALL` order (io, cache, mem).
    pub credit_return: [u8; 3],

    /// Reserved, must be zero.
    pub reserved: u8,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FlitHeader, [u8; 12]);

// ── Slot Header ──────────────────────────────────────────────────────────────

/// Precedes each fixed-size payload region.
///
/// Unused slots are all zeroes: tag `SLOT_EMPTY`, length 0, zero payload.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct SlotHeader {
    /// `ProtocolKind` byte, or `SLOT_EMPTY`.
    pub tag: u8,

    /// Reserved, must be zero.
    pub reserved: u8,

    /// Bytes of the payload region in use. The rest is zero padding.
    pub length: U16<LittleEndian>,
}

assert_eq_size!(SlotHeader, [u8; 4]);

// ── Protocol Kind ────────────────────────────────────────────────────────────

/// The three sub-protocols multiplexed over one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ProtocolKind {
    /// Configuration and memory-mapped I/O. Strictly ordered per address.
    Io = 0x01,

    /// Device-cache coherence: fetches, evictions, snoops.
    Cache = 0x02,

    /// Host-managed device memory reads and writes.
    Mem = 0x03,
}

impl ProtocolKind {
    /// Every kind, in credit-return field order.
    pub const ALL: [ProtocolKind; 3] = [ProtocolKind::Io, ProtocolKind::Cache, ProtocolKind::Mem];

    /// Dense index for per-kind arrays.
    pub fn index(self) -> usize {
        match self {
            ProtocolKind::Io => 0,
            ProtocolKind::Cache => 1,
            ProtocolKind::Mem => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProtocolKind::Io => "io",
            ProtocolKind::Cache => "cache",
            ProtocolKind::Mem => "mem",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for ProtocolKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ProtocolKind::Io),
            0x02 => Ok(ProtocolKind::Cache),
            0x03 => Ok(ProtocolKind::Mem),
            other => Err(WireError::UnknownProtocol(other)),
        }
    }
}

impl From<ProtocolKind> for u8 {
    fn from(k: ProtocolKind) -> u8 {
        k as u8
    }
}

// ── Integrity ────────────────────────────────────────────────────────────────

/// Integrity check over a flit body: the first `INTEGRITY_LEN` bytes of its
/// BLAKE3 hash.
pub fn integrity(body: &[u8]) -> [u8; INTEGRITY_LEN] {
    let hash = blake3::hash(body);
    let mut check = [0u8; INTEGRITY_LEN];
    check.copy_from_slice(&hash.as_bytes()[..INTEGRITY_LEN]);
    check
}

// ── Constants ────────────────────────────────────────────────────────────────

/// Current flit format version.
pub const FLIT_VERSION: u8 = 0x01;

/// Slot tag marking an unused slot.
pub const SLOT_EMPTY: u8 = 0x00;

/// Occupancy is a 16-bit mask, so a flit holds at most 16 slots.
pub const MAX_SLOTS: usize = 16;

/// Length of the integrity trailer.
pub const INTEGRITY_LEN: usize = 8;

pub const FLIT_HEADER_LEN: usize = std::mem::size_of::<FlitHeader>();

pub const SLOT_HEADER_LEN: usize = std::mem::size_of::<SlotHeader>();

/// Default slots per flit.
pub const DEFAULT_SLOTS_PER_FLIT: usize = 4;

/// Default payload region per slot: a packet header plus one cache line,
/// rounded up.
pub const DEFAULT_SLOT_PAYLOAD: usize = 96;

/// Largest credit count one flit can hand back per protocol.
pub const MAX_CREDIT_RETURN: u16 = u8::MAX as u16;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when packing or interpreting wire data.
///
/// All of these are fatal to the one flit (or packet) being processed and
/// never to the link carrying it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("payload length {len} exceeds slot size {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("flit integrity check failed")]
    IntegrityError,

    #[error("malformed flit: {0}")]
    MalformedFlit(String),

    #[error("unknown protocol tag: 0x{0:02x}")]
    UnknownProtocol(u8),

    #[error("unknown {kind} opcode: 0x{opcode:02x}")]
    UnknownOpcode { kind: ProtocolKind, opcode: u8 },

    #[error("unknown response status: 0x{0:02x}")]
    UnknownStatus(u8),

    #[error("unknown flit version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("got {got} bytes, expected {expected}")]
    Truncated { got: usize, expected: usize },

    #[error("{0} slots requested, a flit holds at most {}", MAX_SLOTS)]
    TooManySlots(usize),
}

// ── Tests ────────────────────────────────────────────────────────────────────
