//! Switch fabric — forwards packets between ports under the port table and
//! each egress link's credits.
//!
//! Every port buffers what it is about to send in an egress queue. Queues
//! drain in arrival order; a blocked io packet holds back every later io
//! packet on that port, while cache and mem requests only wait behind their
//! own kind and responses never wait. The ingress buffer a request occupied
//! is released (and its credit returned upstream) once the request leaves
//! through the egress link, so the two link segments are flow-controlled
//! independently.
//!
//! An unroutable request is dropped and answered from the switch with an
//! `Unreachable` response, so the requester resolves it as a routing failure.

use std::collections::{BTreeMap, VecDeque};

use cxlsim_core::{DeviceId, Packet, ProtocolKind, Status, VhId};
use futures::future::select_all;
use futures::FutureExt;
use tokio::sync::broadcast;

use crate::link::{Link, SendError};
use crate::port::{PortEntry, PortId, PortRole, PortTable, RouteError};
use crate::stats::{Counter, FabricStats};
use crate::topology::TopologyError;

/// A packet waiting for its egress link.
#[derive(Debug)]
struct Queued {
    /// Port whose inbound buffer the packet occupies, for requests.
    ingress: Option<PortId>,
    packet: Packet,
}

struct SwitchPort {
    link: Link,
    egress: VecDeque<Queued>,
}

pub struct Switch {
    id: u16,
    ports: BTreeMap<PortId, SwitchPort>,
    table: PortTable,
    stats: FabricStats,
}

impl Switch {
    pub fn new(id: u16, stats: FabricStats) -> Self {
        Self {
            id,
            ports: BTreeMap::new(),
            table: PortTable::new(),
            stats,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn add_port(
        &mut self,
        port: PortId,
        vh: VhId,
        role: PortRole,
        mut link: Link,
    ) -> Result<(), TopologyError> {
        self.table.add_port(port, vh, role)?;
        link.set_stats(self.stats.clone());
        self.ports.insert(
            port,
            SwitchPort {
                link,
                egress: VecDeque::new(),
            },
        );
        tracing::info!(switch = self.id, port, vh, %role, "port added");
        Ok(())
    }

    // ── Management ───────────────────────────────────────────────────────────

    pub fn bind(&mut self, port: PortId, device: DeviceId) -> Result<(), TopologyError> {
        self.table.bind(port, device)?;
        tracing::info!(switch = self.id, port, device, "device bound");
        Ok(())
    }

    pub fn unbind(&mut self, device: DeviceId) -> Result<PortId, TopologyError> {
        let port = self.table.unbind(device)?;
        tracing::info!(switch = self.id, port, device, "device unbound");
        Ok(port)
    }

    pub fn assign_vh(&mut self, port: PortId, vh: VhId) -> Result<(), TopologyError> {
        let previous = self.table.assign_vh(port, vh)?;
        tracing::info!(switch = self.id, port, previous, vh, "port moved to virtual hierarchy");
        Ok(())
    }

    pub fn routes(&self) -> Vec<PortEntry> {
        self.table.entries()
    }

    pub fn route(&self, ingress: PortId, packet: &Packet) -> Result<PortId, RouteError> {
        self.table.resolve(ingress, packet)
    }

    pub fn link(&self, port: PortId) -> Option<&Link> {
        self.ports.get(&port).map(|p| &p.link)
    }

    /// Packets waiting on `port`'s egress queue.
    pub fn queued(&self, port: PortId) -> usize {
        self.ports.get(&port).map(|p| p.egress.len()).unwrap_or(0)
    }

    // ── Forwarding ───────────────────────────────────────────────────────────

    /// Route everything received, drain egress queues as credits allow, and
    /// flush every link. Returns the number of packets received.
    pub fn poll(&mut self) -> usize {
        let mut received = 0;
        let port_ids: Vec<PortId> = self.ports.keys().copied().collect();

        for &ingress in &port_ids {
            while let Some(packet) = self.ports.get_mut(&ingress).and_then(|p| p.link.poll_receive()) {
                received += 1;
                self.accept(ingress, packet);
            }
        }

        for &port in &port_ids {
            self.drain_egress(port);
        }

        for (&port, p) in self.ports.iter_mut() {
            if let Err(e) = p.link.flush() {
                tracing::warn!(switch = self.id, port, error = %e, "flush failed");
            }
        }
        received
    }

    fn accept(&mut self, ingress: PortId, packet: Packet) {
        let is_request = packet.is_request();
        match self.table.resolve(ingress, &packet) {
            Ok(egress) => {
                tracing::trace!(switch = self.id, ingress, egress, opcode = %packet.opcode, tag = packet.tag, "routing packet");
                if let Some(port) = self.ports.get_mut(&egress) {
                    port.egress.push_back(Queued {
                        ingress: is_request.then_some(ingress),
                        packet,
                    });
                }
            }
            Err(RouteError::Unreachable { device, vh }) => {
                tracing::warn!(
                    switch = self.id,
                    ingress,
                    device,
                    vh,
                    opcode = %packet.opcode,
                    "unreachable, dropping packet"
                );
                self.stats.incr(Counter::Unreachable(vh));
                if !is_request {
                    return;
                }
                let failure = packet.failure(Status::Unreachable);
                if let Some(port) = self.ports.get_mut(&ingress) {
                    port.link.release(packet.kind());
                    port.egress.push_back(Queued {
                        ingress: None,
                        packet: failure,
                    });
                }
            }
        }
    }

    fn drain_egress(&mut self, port: PortId) {
        let Some(p) = self.ports.get_mut(&port) else {
            return;
        };

        let mut blocked = [false; 3];
        let mut kept = VecDeque::new();
        let mut released: Vec<(PortId, ProtocolKind)> = Vec::new();

        for queued in std::mem::take(&mut p.egress) {
            let kind = queued.packet.kind();
            // io never passes io; other kinds only queue behind their own requests
            let wait = blocked[kind.index()] && (kind == ProtocolKind::Io || queued.ingress.is_some());
            if wait {
                kept.push_back(queued);
                continue;
            }

            let sent = match queued.ingress {
                Some(_) => p.link.send_request(&queued.packet),
                None => p.link.send_response(&queued.packet),
            };
            match sent {
                Ok(()) => {
                    self.stats.incr(Counter::Forwarded(kind));
                    if let Some(ingress) = queued.ingress {
                        released.push((ingress, kind));
                    }
                }
                Err(SendError::Backpressure(_)) => {
                    blocked[kind.index()] = true;
                    kept.push_back(queued);
                }
                Err(e) => {
                    tracing::warn!(switch = self.id, port, error = %e, opcode = %queued.packet.opcode, "forward failed, dropping packet");
                    if let Some(ingress) = queued.ingress {
                        released.push((ingress, kind));
                    }
                }
            }
        }
        p.egress = kept;

        for (ingress, kind) in released {
            if let Some(p) = self.ports.get_mut(&ingress) {
                p.link.release(kind);
            }
        }
    }

    /// Forward until shutdown or until every port's peer is gone.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        tracing::info!(switch = self.id, ports = self.ports.len(), "switch running");
        loop {
            self.poll();

            let waits: Vec<_> = self
                .ports
                .values_mut()
                .filter(|p| !p.link.is_peer_closed())
                .map(|p| p.link.fill().boxed())
                .collect();
            if waits.is_empty() {
                tracing::info!(switch = self.id, "all ports disconnected, switch exiting");
                return Ok(());
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(switch = self.id, "switch shutting down");
                    return Ok(());
                }
                _ = select_all(waits) => {}
            }
        }
    }
}

impl std::fmt::Debug for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switch")
            .field("id", &self.id)
            .field("ports", &self.table.entries())
            .finish()
    }
}
