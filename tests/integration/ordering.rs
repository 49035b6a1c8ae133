use crate::*;
use bytes::Bytes;
use cxlsim_core::packet::{device_address, CacheOpcode, IoOpcode, MemOpcode};
use cxlsim_core::{Opcode, ProtocolKind};
use cxlsim_fabric::{Outcome, TxnState};
use tokio::time::Instant;

/// T2's completion arrives first; it is held until T1 completes.
#[test]
fn test_io_same_address_completes_in_issue_order() {
    let (mut host, mut probe) = host_on_raw_link(credits(8));
    let now = Instant::now();
    let addr = device_address(DEV_A, 0x100);

    let mut t1 = host.io_write(addr, Bytes::from_static(b"1111"), now).unwrap();
    let mut t2 = host.io_write(addr, Bytes::from_static(b"2222"), now).unwrap();
    let r1 = probe.poll_receive().unwrap();
    let r2 = probe.poll_receive().unwrap();
    assert_eq!((r1.tag, r2.tag), (t1.id(), t2.id()));

    probe.send_response(&r2.response_to(IoOpcode::Cpl, Bytes::new())).unwrap();
    probe.flush().unwrap();
    host.poll(now);
    assert_eq!(t2.try_outcome(), None);
    assert_eq!(t1.try_outcome(), None);

    probe.send_response(&r1.response_to(IoOpcode::Cpl, Bytes::new())).unwrap();
    probe.flush().unwrap();
    host.poll(now);
    assert!(matches!(t1.try_outcome(), Some(Outcome::Completed(_))));
    assert!(matches!(t2.try_outcome(), Some(Outcome::Completed(_))));
}

/// Different io addresses are independent.
#[test]
fn test_io_different_addresses_complete_independently() {
    let (mut host, mut probe) = host_on_raw_link(credits(8));
    let now = Instant::now();
    let mut t1 = host.io_read(device_address(DEV_A, 0x100), now).unwrap();
    let mut t2 = host.io_read(device_address(DEV_A, 0x200), now).unwrap();
    let _r1 = probe.poll_receive().unwrap();
    let r2 = probe.poll_receive().unwrap();

    probe
        .send_response(&r2.response_to(IoOpcode::CplD, Bytes::from_static(b"\x02\0\0\0")))
        .unwrap();
    probe.flush().unwrap();
    host.poll(now);
    assert_eq!(&completed(&mut t2).data[..], b"\x02\0\0\0");
    assert_eq!(t1.try_outcome(), None);
}

/// An invalidate of line X stays unsent while a fetch of X is outstanding.
#[test]
fn test_snoop_deferred_behind_fetch() {
    let mut rig = Rig::build(&switched(credits(8))).unwrap();
    let now = Instant::now();
    let line = device_address(DEV_A, 0x1c0);

    let mut fetch = rig.host.cache_fetch(line, now).unwrap();
    let mut snoop = rig.host.snoop_invalidate(line + 8, now).unwrap();
    let state = |rig: &Rig, id| rig.host.machine(ProtocolKind::Cache).state(id);
    assert_eq!(state(&rig, fetch.id()), Some(TxnState::AwaitingResponse));
    assert_eq!(state(&rig, snoop.id()), Some(TxnState::PendingSend));

    rig.step_switch();
    rig.device(DEV_A).poll(now);
    rig.step_switch();
    assert_eq!(state(&rig, snoop.id()), Some(TxnState::PendingSend));

    rig.host.poll(now);
    assert_eq!(completed(&mut fetch).opcode, Opcode::Cache(CacheOpcode::Go));
    assert_eq!(state(&rig, snoop.id()), Some(TxnState::AwaitingResponse));

    rig.settle(now);
    assert_eq!(completed(&mut snoop).opcode, Opcode::Cache(CacheOpcode::RspIHitI));
}

/// A snoop of a different line does not wait.
#[test]
fn test_snoop_other_line_not_deferred() {
    let mut rig = Rig::build(&switched(credits(8))).unwrap();
    let now = Instant::now();
    let _fetch = rig.host.cache_fetch(device_address(DEV_A, 0x1c0), now).unwrap();
    let snoop = rig.host.snoop_data(device_address(DEV_A, 0x200), now).unwrap();
    assert_eq!(
        rig.host.machine(ProtocolKind::Cache).state(snoop.id()),
        Some(TxnState::AwaitingResponse)
    );
}

/// mem invalidates follow the same per-line rule as cache snoops.
#[test]
fn test_mem_invalidate_waits_for_read_of_line() {
    let mut rig = Rig::build(&switched(credits(8))).unwrap();
    let now = Instant::now();
    let line = device_address(DEV_B, 0x40);

    let mut read = rig.host.mem_read(line, now).unwrap();
    let mut inv = rig.host.mem_invalidate(line, now).unwrap();
    assert_eq!(
        rig.host.machine(ProtocolKind::Mem).state(inv.id()),
        Some(TxnState::PendingSend)
    );

    rig.settle(now);
    assert_eq!(completed(&mut read).opcode, Opcode::Mem(MemOpcode::MemData));
    assert_eq!(completed(&mut inv).opcode, Opcode::Mem(MemOpcode::Cmp));
}
