//! Port table — which switch port reaches which device, and in which
//! virtual hierarchy.
//!
//! Each device id is reachable through exactly one port. A virtual hierarchy
//! tag partitions ports into disjoint routing domains: a packet tagged H only
//! enters and leaves through ports of H.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use cxlsim_core::{DeviceId, Packet, VhId};
use serde::Serialize;

use crate::topology::TopologyError;

pub type PortId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortRole {
    /// Faces a host (root port).
    Upstream,
    /// Faces a device.
    Downstream,
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRole::Upstream => f.write_str("upstream"),
            PortRole::Downstream => f.write_str("downstream"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("device {device} is unreachable in virtual hierarchy {vh}")]
    Unreachable { device: DeviceId, vh: VhId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortEntry {
    pub port: PortId,
    pub vh: VhId,
    pub role: PortRole,
    pub devices: BTreeSet<DeviceId>,
}

#[derive(Debug, Clone, Default)]
pub struct PortTable {
    ports: BTreeMap<PortId, PortEntry>,
    routes: HashMap<DeviceId, PortId>,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port(&mut self, port: PortId, vh: VhId, role: PortRole) -> Result<(), TopologyError> {
        if self.ports.contains_key(&port) {
            return Err(TopologyError::DuplicatePort(port));
        }
        self.ports.insert(
            port,
            PortEntry {
                port,
                vh,
                role,
                devices: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Make `device` reachable through `port`. Fails, leaving the table
    /// unchanged, if the device already has a route.
    pub fn bind(&mut self, port: PortId, device: DeviceId) -> Result<(), TopologyError> {
        if let Some(&existing) = self.routes.get(&device) {
            return Err(TopologyError::DuplicateDevice {
                device,
                port: existing,
            });
        }
        let entry = self
            .ports
            .get_mut(&port)
            .ok_or(TopologyError::UnknownPort(port))?;
        entry.devices.insert(device);
        self.routes.insert(device, port);
        Ok(())
    }

    /// Remove `device`'s route. Returns the port it was bound to.
    pub fn unbind(&mut self, device: DeviceId) -> Result<PortId, TopologyError> {
        let port = self
            .routes
            .remove(&device)
            .ok_or(TopologyError::UnknownDevice(device))?;
        if let Some(entry) = self.ports.get_mut(&port) {
            entry.devices.remove(&device);
        }
        Ok(port)
    }

    /// Move `port` into virtual hierarchy `vh`.
    pub fn assign_vh(&mut self, port: PortId, vh: VhId) -> Result<VhId, TopologyError> {
        let entry = self
            .ports
            .get_mut(&port)
            .ok_or(TopologyError::UnknownPort(port))?;
        Ok(std::mem::replace(&mut entry.vh, vh))
    }

    /// Port that reaches `device` within `vh`.
    pub fn lookup(&self, device: DeviceId, vh: VhId) -> Result<PortId, RouteError> {
        self.routes
            .get(&device)
            .filter(|port| self.ports.get(port).is_some_and(|e| e.vh == vh))
            .copied()
            .ok_or(RouteError::Unreachable { device, vh })
    }

    /// Egress port for `packet` arriving on `ingress`. The packet's
    /// hierarchy must be the ingress port's and the egress port's.
    pub fn resolve(&self, ingress: PortId, packet: &Packet) -> Result<PortId, RouteError> {
        let unreachable = RouteError::Unreachable {
            device: packet.target(),
            vh: packet.vh,
        };
        match self.ports.get(&ingress) {
            Some(entry) if entry.vh == packet.vh => self.lookup(packet.target(), packet.vh),
            _ => Err(unreachable),
        }
    }

    /// Snapshot of every port and what it reaches.
    pub fn entries(&self) -> Vec<PortEntry> {
        self.ports.values().cloned().collect()
    }
}
