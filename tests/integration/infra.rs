use std::time::Duration;

use anyhow::{Context, Result};
use cxlsim_core::config::{Attach, Credits, EndpointSpec, Topology, TransactionSettings};
use cxlsim_core::{DeviceId, ProtocolKind, SimConfig};
use cxlsim_fabric::{
    establish, topology, Counter, Endpoint, FabricStats, Link, LinkConfig, Outcome, Response, SparseMemory,
    Switch, TransactionHandle,
};
use tokio::time::Instant;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const HOST: DeviceId = 1;
pub const DEV_A: DeviceId = 16;
pub const DEV_B: DeviceId = 17;
pub const TIMEOUT_MS: u64 = 100;

/// Upper bound on poll rounds before `settle` gives up.
const SETTLE_ROUNDS: usize = 64;

pub fn credits(mem: u16) -> Credits {
    Credits {
        mem,
        ..Credits::default()
    }
}

fn with_topology(topology: Topology, link_credits: Credits) -> SimConfig {
    let mut config = SimConfig {
        topology,
        transaction: TransactionSettings {
            timeout_ms: TIMEOUT_MS,
            ..TransactionSettings::default()
        },
        ..SimConfig::default()
    };
    config.link.credits = link_credits;
    config
}

/// Host 1 and devices 16 and 17 behind switch 0, every link with the given
/// credits.
pub fn switched(link_credits: Credits) -> SimConfig {
    with_topology(Topology::demo(), link_credits)
}

/// Host 1 linked straight to device 16.
pub fn direct(link_credits: Credits) -> SimConfig {
    let topology = Topology {
        hosts: vec![EndpointSpec {
            id: HOST,
            vh: 0,
            attach: Attach::Endpoint { endpoint: DEV_A },
            credits: None,
        }],
        devices: vec![EndpointSpec {
            id: DEV_A,
            vh: 0,
            attach: Attach::Endpoint { endpoint: HOST },
            credits: None,
        }],
        switches: Vec::new(),
    };
    with_topology(topology, link_credits)
}

/// A built fabric driven by hand.
pub struct Rig {
    pub host: Endpoint,
    pub devices: Vec<Endpoint>,
    pub switch: Option<Switch>,
    pub stats: FabricStats,
}

impl Rig {
    pub fn build(config: &SimConfig) -> Result<Self> {
        let mut fabric = topology::build(config, None).context("failed to build topology")?;
        let host = fabric.take_endpoint(HOST).context("topology has no host 1")?;
        Ok(Self {
            host,
            devices: std::mem::take(&mut fabric.devices),
            switch: fabric.take_switch(0),
            stats: fabric.stats,
        })
    }

    pub fn device(&mut self, id: DeviceId) -> &mut Endpoint {
        self.devices
            .iter_mut()
            .find(|d| d.id() == id)
            .unwrap_or_else(|| panic!("no device {id}"))
    }

    pub fn switch(&mut self) -> &mut Switch {
        self.switch.as_mut().expect("topology has no switch")
    }

    pub fn step_switch(&mut self) -> usize {
        self.switch.as_mut().map(|s| s.poll()).unwrap_or(0)
    }

    pub fn step_devices(&mut self, now: Instant) -> usize {
        self.devices.iter_mut().map(|d| d.poll(now)).sum()
    }

    /// Poll everything until a full round receives nothing, not even a
    /// credit-only flit.
    pub fn settle(&mut self, now: Instant) {
        for _ in 0..SETTLE_ROUNDS {
            let flits = self.stats.get(Counter::FlitsReceived);
            let moved = self.step_switch()
                + self.step_devices(now)
                + self.step_switch()
                + self.host.poll(now);
            if moved == 0 && self.stats.get(Counter::FlitsReceived) == flits {
                return;
            }
        }
        panic!("fabric did not settle in {SETTLE_ROUNDS} rounds");
    }

    /// Every link end's outbound credits are within the advertised capacity.
    pub fn assert_credits_bounded(&self) {
        let mut ends = vec![self.host.link()];
        ends.extend(self.devices.iter().map(|d| d.link()));
        for link in ends {
            for kind in ProtocolKind::ALL {
                let held = link.held(kind);
                let capacity = link.credits().capacity(cxlsim_fabric::Direction::Outbound, kind);
                assert!(
                    held <= capacity,
                    "{}: {kind} held {held} exceeds capacity {capacity}",
                    link.name()
                );
            }
        }
    }
}

/// Host 1 on one end of a link whose far end the test drives by hand,
/// standing in for a device that can answer out of order.
pub fn host_on_raw_link(link_credits: Credits) -> (Endpoint, Link) {
    let config = direct(link_credits);
    let (mut near, mut far) = Link::pair("host1", "probe", &LinkConfig::default());
    establish(&mut near, link_credits, &mut far, link_credits).expect("fresh links accept credits");
    let host = Endpoint::new(
        HOST,
        0,
        near,
        &config.transaction,
        Box::new(SparseMemory::new(HOST)),
        FabricStats::new(),
    );
    (host, far)
}

pub fn after_timeout(now: Instant) -> Instant {
    now + Duration::from_millis(TIMEOUT_MS + 1)
}

/// Unwrap a resolved completion.
pub fn completed(handle: &mut TransactionHandle) -> Response {
    match handle.try_outcome() {
        Some(Outcome::Completed(response)) => response,
        other => panic!("transaction {} expected to complete, got {other:?}", handle.id()),
    }
}
