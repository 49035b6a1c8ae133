use crate::*;
use bytes::Bytes;
use cxlsim_core::config::Topology;
use cxlsim_core::packet::device_address;
use cxlsim_core::{ProtocolKind, Status};
use cxlsim_fabric::{topology, Counter, Outcome, TopologyError};
use tokio::time::Instant;

/// A request for a device no port owns fails the transaction, is counted,
/// and leaves the port table as it was.
#[test]
fn test_unroutable_request_fails_and_table_unchanged() {
    let mut rig = Rig::build(&switched(credits(8))).unwrap();
    let now = Instant::now();
    let before = rig.switch().routes();

    let mut handle = rig.host.mem_read(device_address(99, 0x40), now).unwrap();
    rig.settle(now);

    assert_eq!(handle.try_outcome(), Some(Outcome::RoutingFailed));
    assert_eq!(rig.switch().routes(), before);
    assert_eq!(rig.stats.unreachable(0), 1);
    assert_eq!(rig.stats.get(Counter::RoutingFailed(ProtocolKind::Mem)), 1);
    // the ingress buffer was released
    assert_eq!(rig.host.link().held(ProtocolKind::Mem), 8);
}

/// A device in another virtual hierarchy is invisible until its port is
/// moved into the host's hierarchy.
#[test]
fn test_virtual_hierarchy_isolation() {
    let mut topo = Topology::demo();
    topo.devices[1].vh = 1;
    topo.switches[0].ports[2].vh = 1;
    let config = cxlsim_core::SimConfig {
        topology: topo,
        ..switched(credits(8))
    };
    let mut rig = Rig::build(&config).unwrap();
    let now = Instant::now();
    let addr = device_address(DEV_B, 0);

    let mut blocked = rig.host.mem_write(addr, Bytes::from_static(b"x"), now).unwrap();
    rig.settle(now);
    assert_eq!(blocked.try_outcome(), Some(Outcome::RoutingFailed));
    assert_eq!(rig.stats.unreachable(0), 1);
    assert_eq!(rig.device(DEV_B).link().credits().held(cxlsim_fabric::Direction::Inbound, ProtocolKind::Mem), 8);

    rig.switch().assign_vh(2, 0).unwrap();
    let mut allowed = rig.host.mem_write(addr, Bytes::from_static(b"x"), now).unwrap();
    rig.settle(now);
    assert_eq!(completed(&mut allowed).status, Status::Ok);
}

/// Moving a device between ports with unbind and bind.
#[test]
fn test_unbind_then_bind_reroutes() {
    let mut rig = Rig::build(&switched(credits(8))).unwrap();
    let now = Instant::now();

    rig.switch().unbind(DEV_A).unwrap();
    let mut lost = rig.host.cfg_read(device_address(DEV_A, 0), now).unwrap();
    rig.settle(now);
    assert_eq!(lost.try_outcome(), Some(Outcome::RoutingFailed));

    rig.switch().bind(1, DEV_A).unwrap();
    let mut found = rig.host.cfg_read(device_address(DEV_A, 0), now).unwrap();
    rig.settle(now);
    assert_eq!(completed(&mut found).data.len(), 4);
}

/// Binding a device that already has a route is refused.
#[test]
fn test_duplicate_bind_rejected() {
    let mut rig = Rig::build(&switched(credits(8))).unwrap();
    let before = rig.switch().routes();
    assert_eq!(
        rig.switch().bind(2, DEV_A),
        Err(TopologyError::DuplicateDevice { device: DEV_A, port: 1 })
    );
    assert_eq!(rig.switch().routes(), before);
}

/// Malformed topologies are refused at setup.
#[test]
fn test_malformed_topology_rejected() {
    let mut config = switched(credits(8));
    config.topology.devices[1].id = DEV_A;
    assert!(matches!(
        topology::build(&config, None),
        Err(TopologyError::DuplicateEndpoint(DEV_A))
    ));

    let config = switched(credits(0));
    assert!(matches!(
        topology::build(&config, None),
        Err(TopologyError::ZeroCapacity { kind: ProtocolKind::Mem, .. })
    ));

    // a 64-byte slot cannot carry a line of read data back
    let mut config = switched(credits(8));
    config.link.slot_payload_size = 64;
    assert!(matches!(
        topology::build(&config, None),
        Err(TopologyError::SlotTooSmall { size: 64, .. })
    ));
}

/// A device answering for an address it does not own reports Unreachable.
#[test]
fn test_misaddressed_request_on_direct_link() {
    let mut rig = Rig::build(&direct(credits(8))).unwrap();
    let now = Instant::now();
    let mut handle = rig.host.io_read(device_address(DEV_B, 0), now).unwrap();
    rig.settle(now);
    assert_eq!(handle.try_outcome(), Some(Outcome::RoutingFailed));
}
