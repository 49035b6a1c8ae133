//! Request handlers — what an endpoint does with requests addressed to it.

use std::collections::HashMap;

use bytes::Bytes;
use cxlsim_core::packet::{
    cache_line, CacheOpcode, IoOpcode, MemOpcode, CACHE_LINE_SIZE, DEVICE_SHIFT,
};
use cxlsim_core::{DeviceId, Opcode, Packet, Status};

/// Serves inbound requests. Called once per request, on the endpoint's task.
pub trait RequestHandler: Send {
    /// Produce the response to `request`.
    fn handle(&mut self, request: &Packet) -> Packet;
}

const LINE: usize = CACHE_LINE_SIZE as usize;
const CONFIG_REGISTERS: usize = 64;

/// Line-granular sparse memory plus a small config register file.
///
/// Lines never written read as zero. Config register 0 holds a fixed
/// vendor id and the endpoint id; the rest start at zero.
#[derive(Debug, Clone)]
pub struct SparseMemory {
    id: DeviceId,
    lines: HashMap<u64, [u8; LINE]>,
    config: [u32; CONFIG_REGISTERS],
}

/// Vendor id reported in config register 0.
pub const VENDOR_ID: u16 = 0x1e98;

impl SparseMemory {
    pub fn new(id: DeviceId) -> Self {
        let mut config = [0u32; CONFIG_REGISTERS];
        config[0] = ((id as u32) << 16) | VENDOR_ID as u32;
        Self {
            id,
            lines: HashMap::new(),
            config,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Lines that have been written.
    pub fn lines(&self) -> usize {
        self.lines.len()
    }

    fn offset(address: u64) -> u64 {
        address & ((1 << DEVICE_SHIFT) - 1)
    }

    pub fn read_line(&self, address: u64) -> Bytes {
        let line = cache_line(Self::offset(address));
        match self.lines.get(&line) {
            Some(data) => Bytes::copy_from_slice(data),
            None => Bytes::from_static(&[0u8; LINE]),
        }
    }

    /// Write `data` starting at `address`, clipped to the end of its line.
    pub fn write(&mut self, address: u64, data: &[u8]) {
        let offset = Self::offset(address);
        let start = (offset - cache_line(offset)) as usize;
        let len = data.len().min(LINE - start);
        let line = self.lines.entry(cache_line(offset)).or_insert([0u8; LINE]);
        line[start..start + len].copy_from_slice(&data[..len]);
    }

    fn read_dword(&self, address: u64) -> Bytes {
        let offset = Self::offset(address);
        let start = (offset - cache_line(offset)) as usize;
        let line = self.read_line(address);
        let end = (start + 4).min(LINE);
        line.slice(start..end)
    }

    fn config_index(address: u64) -> Option<usize> {
        let index = (Self::offset(address) / 4) as usize;
        (index < CONFIG_REGISTERS).then_some(index)
    }
}

impl RequestHandler for SparseMemory {
    fn handle(&mut self, request: &Packet) -> Packet {
        let addr = request.address;
        match request.opcode {
            Opcode::Io(IoOpcode::MemRd) => request.response_to(IoOpcode::CplD, self.read_dword(addr)),
            Opcode::Io(IoOpcode::MemWr) => {
                self.write(addr, &request.data);
                request.response_to(IoOpcode::Cpl, Bytes::new())
            }
            Opcode::Io(IoOpcode::CfgRd) => match Self::config_index(addr) {
                Some(i) => request.response_to(
                    IoOpcode::CplD,
                    Bytes::copy_from_slice(&self.config[i].to_le_bytes()),
                ),
                None => request.failure(Status::Unsupported),
            },
            Opcode::Io(IoOpcode::CfgWr) => match Self::config_index(addr) {
                // register 0 is read-only
                Some(i) if i > 0 => {
                    let mut word = [0u8; 4];
                    let n = request.data.len().min(4);
                    word[..n].copy_from_slice(&request.data[..n]);
                    self.config[i] = u32::from_le_bytes(word);
                    request.response_to(IoOpcode::Cpl, Bytes::new())
                }
                _ => request.failure(Status::Unsupported),
            },

            Opcode::Mem(MemOpcode::MemRd | MemOpcode::MemSpecRd) => {
                request.response_to(MemOpcode::MemData, self.read_line(addr))
            }
            Opcode::Mem(MemOpcode::MemWr) => {
                self.write(addr, &request.data);
                request.response_to(MemOpcode::Cmp, Bytes::new())
            }
            Opcode::Mem(MemOpcode::MemInv) => request.response_to(MemOpcode::Cmp, Bytes::new()),

            Opcode::Cache(CacheOpcode::RdCurr | CacheOpcode::RdShared | CacheOpcode::RdOwn) => {
                request.response_to(CacheOpcode::Go, self.read_line(addr))
            }
            Opcode::Cache(CacheOpcode::CleanEvict) => request.response_to(CacheOpcode::Go, Bytes::new()),
            Opcode::Cache(CacheOpcode::DirtyEvict) => {
                if !request.data.is_empty() {
                    self.write(cache_line(addr), &request.data);
                }
                request.response_to(CacheOpcode::GoWritePull, Bytes::new())
            }
            Opcode::Cache(CacheOpcode::SnpData | CacheOpcode::SnpCur) => {
                request.response_to(CacheOpcode::RspSHitSE, Bytes::new())
            }
            Opcode::Cache(CacheOpcode::SnpInv) => {
                request.response_to(CacheOpcode::RspIHitI, Bytes::new())
            }

            _ => request.failure(Status::Unsupported),
        }
    }
}
