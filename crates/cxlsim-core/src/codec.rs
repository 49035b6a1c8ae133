//! Flit codec — packs sub-protocol slots into fixed-size flits and back.
//!
//! The codec is a pure transform with no state beyond its layout, so one
//! instance can be copied into every link that shares a layout.

use bytes::{Bytes, BytesMut};
use zerocopy::byteorder::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::wire::{
    integrity, FlitHeader, ProtocolKind, SlotHeader, WireError, DEFAULT_SLOTS_PER_FLIT,
    DEFAULT_SLOT_PAYLOAD, FLIT_HEADER_LEN, FLIT_VERSION, INTEGRITY_LEN, MAX_SLOTS,
    SLOT_EMPTY, SLOT_HEADER_LEN,
};

/// Slot geometry shared by both ends of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlitLayout {
    slots: usize,
    slot_payload: usize,
}

impl FlitLayout {
    pub fn new(slots: usize, slot_payload: usize) -> Result<Self, WireError> {
        if slots == 0 || slots > MAX_SLOTS {
            return Err(WireError::TooManySlots(slots));
        }
        if slot_payload == 0 || slot_payload > u16::MAX as usize {
            return Err(WireError::PayloadTooLarge {
                len: slot_payload,
                max: u16::MAX as usize,
            });
        }
        Ok(Self {
            slots,
            slot_payload,
        })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Largest payload one slot can carry.
    pub fn slot_payload(&self) -> usize {
        self.slot_payload
    }

    pub fn slot_size(&self) -> usize {
        SLOT_HEADER_LEN + self.slot_payload
    }

    /// Packed size of every flit with this layout.
    pub fn flit_size(&self) -> usize {
        FLIT_HEADER_LEN + self.slots * self.slot_size() + INTEGRITY_LEN
    }
}

impl Default for FlitLayout {
    fn default() -> Self {
        Self {
            slots: DEFAULT_SLOTS_PER_FLIT,
            slot_payload: DEFAULT_SLOT_PAYLOAD,
        }
    }
}

/// One occupied slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub kind: ProtocolKind,
    pub payload: Bytes,
}

impl Slot {
    pub fn new(kind: ProtocolKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

/// Credits handed back to the peer, per protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreditReturn([u8; 3]);

impl CreditReturn {
    pub fn get(&self, kind: ProtocolKind) -> u8 {
        self.0[kind.index()]
    }

    pub fn set(&mut self, kind: ProtocolKind, amount: u8) {
        self.0[kind.index()] = amount;
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&c| c == 0)
    }
}

/// A decoded flit. `slots` holds only the occupied slots, in slot order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flit {
    pub sequence: u32,
    pub credit_return: CreditReturn,
    pub slots: Vec<Slot>,
}

/// Stateless flit packer/unpacker for one layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlitCodec {
    layout: FlitLayout,
}

impl FlitCodec {
    pub fn new(layout: FlitLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> FlitLayout {
        self.layout
    }

    /// Pack `flit` into exactly `layout.flit_size()` bytes.
    ///
    /// Occupied slots fill slot positions 0.. in order; the remainder are
    /// written out as explicit empty slots.
    pub fn pack(&self, flit: &Flit) -> Result<Bytes, WireError> {
        let layout = self.layout;
        if flit.slots.len() > layout.slots() {
            return Err(WireError::TooManySlots(flit.slots.len()));
        }
        if let Some(slot) = flit
            .slots
            .iter()
            .find(|s| s.payload.len() > layout.slot_payload())
        {
            return Err(WireError::PayloadTooLarge {
                len: slot.payload.len(),
                max: layout.slot_payload(),
            });
        }

        let occupancy = (0..flit.slots.len()).fold(0u16, |mask, i| mask | (1 << i));
        let header = FlitHeader {
            version: FLIT_VERSION,
            slot_count: layout.slots() as u8,
            occupancy: U16::new(occupancy),
            sequence: U32::new(flit.sequence),
            credit_return: flit.credit_return.0,
            reserved: 0,
        };

        let mut buf = BytesMut::with_capacity(layout.flit_size());
        buf.extend_from_slice(header.as_bytes());

        for index in 0..layout.slots() {
            let region_end = buf.len() + layout.slot_size();
            match flit.slots.get(index) {
                Some(slot) => {
                    let slot_header = SlotHeader {
                        tag: slot.kind.into(),
                        reserved: 0,
                        length: U16::new(slot.payload.len() as u16),
                    };
                    buf.extend_from_slice(slot_header.as_bytes());
                    buf.extend_from_slice(&slot.payload);
                }
                None => buf.extend_from_slice(SlotHeader::new_zeroed().as_bytes()),
            }
            buf.resize(region_end, 0);
        }

        let check = integrity(&buf);
        buf.extend_from_slice(&check);
        Ok(buf.freeze())
    }

    /// Unpack a flit produced by `pack` with the same layout.
    pub fn unpack(&self, bytes: &Bytes) -> Result<Flit, WireError> {
        let layout = self.layout;
        let expected = layout.flit_size();
        if bytes.len() != expected {
            return Err(WireError::Truncated {
                got: bytes.len(),
                expected,
            });
        }

        let body_len = expected - INTEGRITY_LEN;
        if integrity(&bytes[..body_len]) != bytes[body_len..] {
            return Err(WireError::IntegrityError);
        }

        let header = FlitHeader::read_from_prefix(&bytes[..])
            .ok_or_else(|| WireError::MalformedFlit("short flit header".into()))?;
        if header.version != FLIT_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        if header.slot_count as usize != layout.slots() {
            return Err(WireError::MalformedFlit(format!(
                "header declares {} slots, layout has {}",
                header.slot_count,
                layout.slots()
            )));
        }
        let occupancy = header.occupancy.get();
        if (occupancy as u32) >> layout.slots() != 0 {
            return Err(WireError::MalformedFlit(format!(
                "occupancy 0x{occupancy:04x} marks slots beyond {}",
                layout.slots()
            )));
        }

        let mut slots = Vec::with_capacity(occupancy.count_ones() as usize);
        for index in 0..layout.slots() {
            let start = FLIT_HEADER_LEN + index * layout.slot_size();
            let slot_header = SlotHeader::read_from_prefix(&bytes[start..])
                .ok_or_else(|| WireError::MalformedFlit(format!("slot {index} cut short")))?;
            let length = slot_header.length.get() as usize;
            let occupied = occupancy & (1 << index) != 0;

            if !occupied {
                if slot_header.tag != SLOT_EMPTY || length != 0 {
                    return Err(WireError::MalformedFlit(format!(
                        "slot {index} carries data but occupancy marks it empty"
                    )));
                }
                continue;
            }

            if slot_header.tag == SLOT_EMPTY {
                return Err(WireError::MalformedFlit(format!(
                    "slot {index} marked occupied but tagged empty"
                )));
            }
            let kind = ProtocolKind::try_from(slot_header.tag).map_err(|_| {
                WireError::MalformedFlit(format!(
                    "slot {index} has unknown protocol tag 0x{:02x}",
                    slot_header.tag
                ))
            })?;
            if length > layout.slot_payload() {
                return Err(WireError::MalformedFlit(format!(
                    "slot {index} length {length} exceeds slot size {}",
                    layout.slot_payload()
                )));
            }

            let payload_start = start + SLOT_HEADER_LEN;
            slots.push(Slot {
                kind,
                payload: bytes.slice(payload_start..payload_start + length),
            });
        }

        Ok(Flit {
            sequence: header.sequence.get(),
            credit_return: CreditReturn(header.credit_return),
            slots,
        })
    }
}
