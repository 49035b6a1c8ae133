//! Topology build — validate the configured topology and construct the
//! endpoints and switches it describes, with every link established.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use cxlsim_core::config::{Attach, Credits, EndpointSpec};
use cxlsim_core::packet::{CACHE_LINE_SIZE, PACKET_HEADER_LEN};
use cxlsim_core::{DeviceId, ProtocolKind, SimConfig, VhId, WireError};

use crate::capture::CaptureSink;
use crate::credit::CreditError;
use crate::endpoint::{Endpoint, SparseMemory};
use crate::link::{establish, Link, LinkConfig};
use crate::port::{PortId, PortRole};
use crate::stats::FabricStats;
use crate::switch::Switch;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("device {device} is already reachable through port {port}")]
    DuplicateDevice { device: DeviceId, port: PortId },
    #[error("port {0} already exists")]
    DuplicatePort(PortId),
    #[error("unknown port {0}")]
    UnknownPort(PortId),
    #[error("device {0} is not bound to any port")]
    UnknownDevice(DeviceId),
    #[error("unknown switch {0}")]
    UnknownSwitch(u16),
    #[error("switch {0} is defined twice")]
    DuplicateSwitch(u16),
    #[error("switch {switch} has no port {port}")]
    UnknownSwitchPort { switch: u16, port: PortId },
    #[error("switch {switch} lists port {port} twice")]
    DuplicateSwitchPort { switch: u16, port: PortId },
    #[error("switch {switch} port {port} already has a link")]
    PortInUse { switch: u16, port: PortId },
    #[error("endpoint id {0} is used twice")]
    DuplicateEndpoint(DeviceId),
    #[error("endpoint {0} is attached to an unknown endpoint")]
    UnknownEndpoint(DeviceId),
    #[error("endpoint {0} is attached to itself")]
    SelfLink(DeviceId),
    #[error("endpoint {0} is linked more than once")]
    EndpointLinkedTwice(DeviceId),
    #[error("endpoint {endpoint} advertises zero {kind} credits")]
    ZeroCapacity { endpoint: DeviceId, kind: ProtocolKind },
    #[error("endpoint {endpoint} is in hierarchy {vh} but its port is in {port_vh}")]
    VhMismatch {
        endpoint: DeviceId,
        vh: VhId,
        port_vh: VhId,
    },
    #[error("slot payload of {size} bytes cannot carry a cache line (need {min})")]
    SlotTooSmall { size: usize, min: usize },
    #[error("invalid flit layout: {0}")]
    Layout(#[from] WireError),
    #[error(transparent)]
    Credit(#[from] CreditError),
}

/// Everything the topology describes, ready to run.
#[derive(Debug)]
pub struct Fabric {
    pub hosts: Vec<Endpoint>,
    pub devices: Vec<Endpoint>,
    pub switches: Vec<Switch>,
    pub stats: FabricStats,
}

impl Fabric {
    /// Take the endpoint with `id`, host or device.
    pub fn take_endpoint(&mut self, id: DeviceId) -> Option<Endpoint> {
        for list in [&mut self.hosts, &mut self.devices] {
            if let Some(i) = list.iter().position(|e| e.id() == id) {
                return Some(list.remove(i));
            }
        }
        None
    }

    pub fn take_switch(&mut self, id: u16) -> Option<Switch> {
        let i = self.switches.iter().position(|s| s.id() == id)?;
        Some(self.switches.remove(i))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Host,
    Device,
}

/// Build the fabric `config` describes. Every link gets the configured
/// layout and credits (or the endpoint's override); `capture`, if given,
/// sees every flit on every link.
pub fn build(config: &SimConfig, capture: Option<Arc<dyn CaptureSink>>) -> Result<Fabric, TopologyError> {
    let link_config = LinkConfig::from_settings(&config.link)?;
    let topo = &config.topology;
    let stats = FabricStats::new();

    let endpoints: Vec<(Role, &EndpointSpec)> = topo
        .hosts
        .iter()
        .map(|spec| (Role::Host, spec))
        .chain(topo.devices.iter().map(|spec| (Role::Device, spec)))
        .collect();
    validate(config, &endpoints)?;

    let mut switches: BTreeMap<u16, Switch> = BTreeMap::new();
    let mut port_vh: HashMap<(u16, PortId), VhId> = HashMap::new();
    for spec in &topo.switches {
        switches.insert(spec.id, Switch::new(spec.id, stats.clone()));
        for port in &spec.ports {
            port_vh.insert((spec.id, port.port), port.vh);
        }
    }

    let mut links: HashMap<DeviceId, Link> = HashMap::new();
    for &(role, spec) in &endpoints {
        let credits = link_credits(config, spec);
        match spec.attach {
            Attach::Switch { switch, port } => {
                let (mut near, mut far) =
                    Link::pair(&endpoint_name(role, spec.id), &format!("sw{switch}.{port}"), &link_config);
                establish(&mut near, credits, &mut far, credits)?;
                attach_capture(&mut near, &mut far, &capture);

                let sw = switches
                    .get_mut(&switch)
                    .ok_or(TopologyError::UnknownSwitch(switch))?;
                let vh = port_vh
                    .get(&(switch, port))
                    .copied()
                    .ok_or(TopologyError::UnknownSwitchPort { switch, port })?;
                let port_role = match role {
                    Role::Host => PortRole::Upstream,
                    Role::Device => PortRole::Downstream,
                };
                sw.add_port(port, vh, port_role, far)?;
                sw.bind(port, spec.id)?;
                links.insert(spec.id, near);
            }
            Attach::Endpoint { endpoint } => {
                // each direct pair is built once, by whichever side is listed first
                if links.contains_key(&spec.id) {
                    continue;
                }
                let (peer_role, peer) = endpoints
                    .iter()
                    .find(|(_, e)| e.id == endpoint)
                    .copied()
                    .ok_or(TopologyError::UnknownEndpoint(spec.id))?;
                let (mut near, mut far) = Link::pair(
                    &endpoint_name(role, spec.id),
                    &endpoint_name(peer_role, peer.id),
                    &link_config,
                );
                establish(&mut near, credits, &mut far, link_credits(config, peer))?;
                attach_capture(&mut near, &mut far, &capture);
                links.insert(spec.id, near);
                links.insert(peer.id, far);
            }
        }
    }

    let mut hosts = Vec::new();
    let mut devices = Vec::new();
    for &(role, spec) in &endpoints {
        let Some(link) = links.remove(&spec.id) else {
            continue;
        };
        let endpoint = Endpoint::new(
            spec.id,
            spec.vh,
            link,
            &config.transaction,
            Box::new(SparseMemory::new(spec.id)),
            stats.clone(),
        );
        match role {
            Role::Host => hosts.push(endpoint),
            Role::Device => devices.push(endpoint),
        }
    }

    tracing::info!(
        hosts = hosts.len(),
        devices = devices.len(),
        switches = switches.len(),
        "topology built"
    );
    Ok(Fabric {
        hosts,
        devices,
        switches: switches.into_values().collect(),
        stats,
    })
}

/// Reject malformed topologies before anything is constructed.
fn validate(config: &SimConfig, endpoints: &[(Role, &EndpointSpec)]) -> Result<(), TopologyError> {
    let topo = &config.topology;

    let min = min_slot_payload();
    if config.link.slot_payload_size < min {
        return Err(TopologyError::SlotTooSmall {
            size: config.link.slot_payload_size,
            min,
        });
    }

    let mut switch_ports: HashMap<u16, HashMap<PortId, VhId>> = HashMap::new();
    for spec in &topo.switches {
        if switch_ports.contains_key(&spec.id) {
            return Err(TopologyError::DuplicateSwitch(spec.id));
        }
        let mut ports = HashMap::new();
        for port in &spec.ports {
            if ports.insert(port.port, port.vh).is_some() {
                return Err(TopologyError::DuplicateSwitchPort {
                    switch: spec.id,
                    port: port.port,
                });
            }
        }
        switch_ports.insert(spec.id, ports);
    }

    let mut ids = HashSet::new();
    for (_, spec) in endpoints {
        if !ids.insert(spec.id) {
            return Err(TopologyError::DuplicateEndpoint(spec.id));
        }
    }

    let mut used_ports = HashSet::new();
    let mut direct: HashMap<DeviceId, DeviceId> = HashMap::new();
    for (_, spec) in endpoints {
        let credits = link_credits(config, spec);
        for kind in ProtocolKind::ALL {
            if credits.get(kind) == 0 {
                return Err(TopologyError::ZeroCapacity {
                    endpoint: spec.id,
                    kind,
                });
            }
        }

        match spec.attach {
            Attach::Switch { switch, port } => {
                let ports = switch_ports
                    .get(&switch)
                    .ok_or(TopologyError::UnknownSwitch(switch))?;
                let port_vh = *ports
                    .get(&port)
                    .ok_or(TopologyError::UnknownSwitchPort { switch, port })?;
                if port_vh != spec.vh {
                    return Err(TopologyError::VhMismatch {
                        endpoint: spec.id,
                        vh: spec.vh,
                        port_vh,
                    });
                }
                if !used_ports.insert((switch, port)) {
                    return Err(TopologyError::PortInUse { switch, port });
                }
            }
            Attach::Endpoint { endpoint } => {
                if endpoint == spec.id {
                    return Err(TopologyError::SelfLink(spec.id));
                }
                if !ids.contains(&endpoint) {
                    return Err(TopologyError::UnknownEndpoint(spec.id));
                }
                for (a, b) in [(spec.id, endpoint), (endpoint, spec.id)] {
                    match direct.get(&a) {
                        Some(&peer) if peer != b => return Err(TopologyError::EndpointLinkedTwice(a)),
                        _ => {
                            direct.insert(a, b);
                        }
                    }
                }
            }
        }
    }

    // a directly attached endpoint cannot also hang off a switch
    for (_, spec) in endpoints {
        if matches!(spec.attach, Attach::Switch { .. }) && direct.contains_key(&spec.id) {
            return Err(TopologyError::EndpointLinkedTwice(spec.id));
        }
    }
    Ok(())
}

/// The largest packet the fabric sends: a header plus one cache line of data.
fn min_slot_payload() -> usize {
    PACKET_HEADER_LEN + CACHE_LINE_SIZE as usize
}

fn link_credits(config: &SimConfig, spec: &EndpointSpec) -> Credits {
    spec.credits.unwrap_or(config.link.credits)
}

fn endpoint_name(role: Role, id: DeviceId) -> String {
    match role {
        Role::Host => format!("host{id}"),
        Role::Device => format!("dev{id}"),
    }
}

fn attach_capture(near: &mut Link, far: &mut Link, capture: &Option<Arc<dyn CaptureSink>>) {
    if let Some(sink) = capture {
        near.set_capture(sink.clone());
        far.set_capture(sink.clone());
    }
}
