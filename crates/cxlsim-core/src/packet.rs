//! Sub-protocol packets carried one per flit slot.
//!
//! Every packet is a fixed `PacketHeader` followed by `data_len` bytes of data.
//! Opcodes are typed per protocol; the slot tag says which table to decode
//! the opcode byte against.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::wire::{ProtocolKind, WireError};

/// Identifies an endpoint (host or device) on the fabric.
pub type DeviceId = u16;

/// Virtual hierarchy tag.
pub type VhId = u8;

/// Cache lines are 64 bytes.
pub const CACHE_LINE_SIZE: u64 = 64;

/// Bit position of the owning device id inside an address.
pub const DEVICE_SHIFT: u32 = 48;

/// Device that owns `address`.
pub fn device_of(address: u64) -> DeviceId {
    (address >> DEVICE_SHIFT) as DeviceId
}

/// Build an address owned by `device`. `offset` keeps its low 48 bits.
pub fn device_address(device: DeviceId, offset: u64) -> u64 {
    ((device as u64) << DEVICE_SHIFT) | (offset & ((1 << DEVICE_SHIFT) - 1))
}

/// Cache line key for `address`.
pub fn cache_line(address: u64) -> u64 {
    address & !(CACHE_LINE_SIZE - 1)
}

// ── Packet Header ────────────────────────────────────────────────────────────

/// Leads every packet inside a slot.
///
/// Wire size: 20 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PacketHeader {
    /// Opcode byte, decoded against the slot's protocol kind.
    pub opcode: u8,

    /// `Status` byte. Always `Ok` on requests.
    pub status: u8,

    /// Virtual hierarchy the packet travels in.
    pub vh: u8,

    /// Reserved flag bits, must be zero.
    pub flags: u8,

    /// Transaction id assigned by the requester.
    pub tag: U16<LittleEndian>,

    /// Endpoint that issued the request. Responses route back to it.
    pub requester: U16<LittleEndian>,

    /// Target address. The owning device id sits in bits 48..63.
    pub address: U64<LittleEndian>,

    pub data_len: U16<LittleEndian>,

    pub reserved: [u8; 2],
}

assert_eq_size!(PacketHeader, [u8; 20]);

pub const PACKET_HEADER_LEN: usize = std::mem::size_of::<PacketHeader>();

// ── Opcodes ──────────────────────────────────────────────────────────────────

/// I/O and configuration opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IoOpcode {
    MemRd = 0x00,
    MemWr = 0x01,
    CfgRd = 0x02,
    CfgWr = 0x03,
    /// Completion without data.
    Cpl = 0x04,
    /// Completion with data.
    CplD = 0x05,
}

/// Coherence opcodes. Requests from a device cache, snoops from the host,
/// and the responses to both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CacheOpcode {
    RdCurr = 0x01,
    RdOwn = 0x02,
    RdShared = 0x03,
    CleanEvict = 0x09,
    DirtyEvict = 0x0a,
    SnpData = 0x11,
    SnpInv = 0x12,
    SnpCur = 0x13,
    Go = 0x24,
    GoWritePull = 0x25,
    RspSHitSE = 0x31,
    RspIHitI = 0x34,
    RspIFwdM = 0x3f,
}

/// Host-managed device memory opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemOpcode {
    MemInv = 0x00,
    MemRd = 0x01,
    MemSpecRd = 0x08,
    MemWr = 0x11,
    Cmp = 0x20,
    MemData = 0x30,
}

impl TryFrom<u8> for IoOpcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => IoOpcode::MemRd,
            0x01 => IoOpcode::MemWr,
            0x02 => IoOpcode::CfgRd,
            0x03 => IoOpcode::CfgWr,
            0x04 => IoOpcode::Cpl,
            0x05 => IoOpcode::CplD,
            opcode => {
                return Err(WireError::UnknownOpcode {
                    kind: ProtocolKind::Io,
                    opcode,
                })
            }
        })
    }
}

impl TryFrom<u8> for CacheOpcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => CacheOpcode::RdCurr,
            0x02 => CacheOpcode::RdOwn,
            0x03 => CacheOpcode::RdShared,
            0x09 => CacheOpcode::CleanEvict,
            0x0a => CacheOpcode::DirtyEvict,
            0x11 => CacheOpcode::SnpData,
            0x12 => CacheOpcode::SnpInv,
            0x13 => CacheOpcode::SnpCur,
            0x24 => CacheOpcode::Go,
            0x25 => CacheOpcode::GoWritePull,
            0x31 => CacheOpcode::RspSHitSE,
            0x34 => CacheOpcode::RspIHitI,
            0x3f => CacheOpcode::RspIFwdM,
            opcode => {
                return Err(WireError::UnknownOpcode {
                    kind: ProtocolKind::Cache,
                    opcode,
                })
            }
        })
    }
}

impl TryFrom<u8> for MemOpcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => MemOpcode::MemInv,
            0x01 => MemOpcode::MemRd,
            0x08 => MemOpcode::MemSpecRd,
            0x11 => MemOpcode::MemWr,
            0x20 => MemOpcode::Cmp,
            0x30 => MemOpcode::MemData,
            opcode => {
                return Err(WireError::UnknownOpcode {
                    kind: ProtocolKind::Mem,
                    opcode,
                })
            }
        })
    }
}

/// An opcode of any protocol. The variant carries the protocol kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Io(IoOpcode),
    Cache(CacheOpcode),
    Mem(MemOpcode),
}

impl Opcode {
    pub fn kind(self) -> ProtocolKind {
        match self {
            Opcode::Io(_) => ProtocolKind::Io,
            Opcode::Cache(_) => ProtocolKind::Cache,
            Opcode::Mem(_) => ProtocolKind::Mem,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Opcode::Io(op) => op as u8,
            Opcode::Cache(op) => op as u8,
            Opcode::Mem(op) => op as u8,
        }
    }

    pub fn decode(kind: ProtocolKind, code: u8) -> Result<Self, WireError> {
        Ok(match kind {
            ProtocolKind::Io => Opcode::Io(IoOpcode::try_from(code)?),
            ProtocolKind::Cache => Opcode::Cache(CacheOpcode::try_from(code)?),
            ProtocolKind::Mem => Opcode::Mem(MemOpcode::try_from(code)?),
        })
    }

    /// True for opcodes that open a transaction.
    pub fn is_request(self) -> bool {
        match self {
            Opcode::Io(op) => matches!(
                op,
                IoOpcode::MemRd | IoOpcode::MemWr | IoOpcode::CfgRd | IoOpcode::CfgWr
            ),
            Opcode::Cache(op) => matches!(
                op,
                CacheOpcode::RdCurr
                    | CacheOpcode::RdOwn
                    | CacheOpcode::RdShared
                    | CacheOpcode::CleanEvict
                    | CacheOpcode::DirtyEvict
                    | CacheOpcode::SnpData
                    | CacheOpcode::SnpInv
                    | CacheOpcode::SnpCur
            ),
            Opcode::Mem(op) => matches!(
                op,
                MemOpcode::MemInv | MemOpcode::MemRd | MemOpcode::MemSpecRd | MemOpcode::MemWr
            ),
        }
    }

    /// Snoops and invalidations. These wait behind any outstanding request
    /// on the same cache line.
    pub fn is_snoop(self) -> bool {
        matches!(
            self,
            Opcode::Cache(CacheOpcode::SnpData | CacheOpcode::SnpInv | CacheOpcode::SnpCur)
                | Opcode::Mem(MemOpcode::MemInv)
        )
    }

    /// Response used when a request of this kind cannot be served.
    pub fn failure_response(self) -> Opcode {
        match self {
            Opcode::Io(_) => Opcode::Io(IoOpcode::Cpl),
            Opcode::Cache(
                CacheOpcode::SnpData | CacheOpcode::SnpInv | CacheOpcode::SnpCur,
            ) => Opcode::Cache(CacheOpcode::RspIHitI),
            Opcode::Cache(_) => Opcode::Cache(CacheOpcode::Go),
            Opcode::Mem(_) => Opcode::Mem(MemOpcode::Cmp),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Io(op) => write!(f, "io.{op:?}"),
            Opcode::Cache(op) => write!(f, "cache.{op:?}"),
            Opcode::Mem(op) => write!(f, "mem.{op:?}"),
        }
    }
}

impl From<IoOpcode> for Opcode {
    fn from(op: IoOpcode) -> Self {
        Opcode::Io(op)
    }
}

impl From<CacheOpcode> for Opcode {
    fn from(op: CacheOpcode) -> Self {
        Opcode::Cache(op)
    }
}

impl From<MemOpcode> for Opcode {
    fn from(op: MemOpcode) -> Self {
        Opcode::Mem(op)
    }
}

// ── Status ───────────────────────────────────────────────────────────────────

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    /// No route to the target device (io completion status UR).
    Unreachable = 0x01,
    /// The target does not implement the opcode or address.
    Unsupported = 0x02,
}

impl TryFrom<u8> for Status {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Status::Ok),
            0x01 => Ok(Status::Unreachable),
            0x02 => Ok(Status::Unsupported),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

// ── Packet ───────────────────────────────────────────────────────────────────

/// A decoded sub-protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub opcode: Opcode,
    pub status: Status,
    pub vh: VhId,
    pub tag: u16,
    pub requester: DeviceId,
    pub address: u64,
    pub data: Bytes,
}

impl Packet {
    pub fn request(
        opcode: impl Into<Opcode>,
        vh: VhId,
        tag: u16,
        requester: DeviceId,
        address: u64,
        data: Bytes,
    ) -> Self {
        Self {
            opcode: opcode.into(),
            status: Status::Ok,
            vh,
            tag,
            requester,
            address,
            data,
        }
    }

    /// Response to this request, echoing its routing fields.
    pub fn response_to(&self, opcode: impl Into<Opcode>, data: Bytes) -> Self {
        Self {
            opcode: opcode.into(),
            status: Status::Ok,
            vh: self.vh,
            tag: self.tag,
            requester: self.requester,
            address: self.address,
            data,
        }
    }

    /// Data-less failure response to this request.
    pub fn failure(&self, status: Status) -> Self {
        Self {
            status,
            ..self.response_to(self.opcode.failure_response(), Bytes::new())
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        self.opcode.kind()
    }

    pub fn is_request(&self) -> bool {
        self.opcode.is_request()
    }

    /// Endpoint this packet is headed for: the address owner for requests,
    /// the requester for responses.
    pub fn target(&self) -> DeviceId {
        if self.is_request() {
            device_of(self.address)
        } else {
            self.requester
        }
    }

    pub fn line(&self) -> u64 {
        cache_line(self.address)
    }

    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_LEN + self.data.len()
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let data_len = u16::try_from(self.data.len()).map_err(|_| WireError::PayloadTooLarge {
            len: self.data.len(),
            max: u16::MAX as usize,
        })?;
        let header = PacketHeader {
            opcode: self.opcode.code(),
            status: self.status as u8,
            vh: self.vh,
            flags: 0,
            tag: U16::new(self.tag),
            requester: U16::new(self.requester),
            address: U64::new(self.address),
            data_len: U16::new(data_len),
            reserved: [0; 2],
        };
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    /// Decode a slot payload tagged `kind`.
    pub fn decode(kind: ProtocolKind, bytes: &Bytes) -> Result<Self, WireError> {
        let header = PacketHeader::read_from_prefix(&bytes[..]).ok_or(WireError::Truncated {
            got: bytes.len(),
            expected: PACKET_HEADER_LEN,
        })?;
        let data_len = header.data_len.get() as usize;
        let expected = PACKET_HEADER_LEN + data_len;
        if bytes.len() != expected {
            return Err(WireError::Truncated {
                got: bytes.len(),
                expected,
            });
        }
        Ok(Self {
            opcode: Opcode::decode(kind, header.opcode)?,
            status: Status::try_from(header.status)?,
            vh: header.vh,
            tag: header.tag.get(),
            requester: header.requester.get(),
            address: header.address.get(),
            data: bytes.slice(PACKET_HEADER_LEN..),
        })
    }
}
