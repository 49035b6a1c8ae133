//! cxlsim-core — wire format, packet format, and configuration.
//! All other cxlsim crates depend on this one.

pub mod codec;
pub mod config;
pub mod packet;
pub mod wire;

pub use codec::{CreditReturn, Flit, FlitCodec, FlitLayout, Slot};
pub use config::SimConfig;
pub use packet::{DeviceId, Opcode, Packet, Status, VhId};
pub use wire::{ProtocolKind, WireError};
