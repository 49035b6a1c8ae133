use crate::*;
use bytes::Bytes;
use cxlsim_core::packet::{device_address, IoOpcode};
use cxlsim_core::ProtocolKind;
use cxlsim_fabric::{Counter, IssueError, Outcome, Request};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// A lost request times out exactly once and gives its credit back.
#[test]
fn test_timeout_returns_credit() {
    let mut rig = Rig::build(&direct(credits(1))).unwrap();
    let now = Instant::now();
    let addr = device_address(DEV_A, 0);

    let mut lost = rig.host.mem_read(addr, now).unwrap();
    assert_eq!(
        rig.host.try_issue(Request::mem_read(addr), now).unwrap_err(),
        IssueError::Backpressure(ProtocolKind::Mem)
    );

    let later = after_timeout(now);
    rig.host.poll(later);
    assert_eq!(lost.try_outcome(), Some(Outcome::TimedOut));
    rig.host.poll(later);
    assert_eq!(rig.stats.get(Counter::TimedOut(ProtocolKind::Mem)), 1);
    assert!(rig.host.try_issue(Request::mem_read(addr), later).is_ok());
}

/// The device answers after the host gave up: the answer is discarded, and
/// the duplicate credit return is absorbed.
#[test]
fn test_late_response_discarded() {
    let mut rig = Rig::build(&direct(credits(1))).unwrap();
    let now = Instant::now();
    let addr = device_address(DEV_A, 0x80);

    let mut lost = rig.host.mem_read(addr, now).unwrap();
    let later = after_timeout(now);
    rig.host.poll(later);
    assert_eq!(lost.try_outcome(), Some(Outcome::TimedOut));

    rig.device(DEV_A).poll(later);
    rig.host.poll(later);
    assert_eq!(rig.stats.get(Counter::StrayResponses), 0);
    assert_eq!(rig.stats.get(Counter::Completed(ProtocolKind::Mem)), 0);
    assert_eq!(rig.host.link().held(ProtocolKind::Mem), 1);
    rig.assert_credits_bounded();

    let mut fresh = rig.host.mem_read(addr, later).unwrap();
    rig.settle(later);
    assert_eq!(completed(&mut fresh).data.len(), 64);
}

/// When the first of two io writes to one address times out, the second's
/// held completion is released.
#[test]
fn test_io_timeout_releases_held_successor() {
    let (mut host, mut probe) = host_on_raw_link(credits(8));
    let now = Instant::now();
    let addr = device_address(DEV_A, 0x10);

    let mut t1 = host.io_write(addr, Bytes::from_static(b"one"), now).unwrap();
    let mut t2 = host.io_write(addr, Bytes::from_static(b"two"), now).unwrap();
    let _r1 = probe.poll_receive().unwrap();
    let r2 = probe.poll_receive().unwrap();
    probe.send_response(&r2.response_to(IoOpcode::Cpl, Bytes::new())).unwrap();
    probe.flush().unwrap();
    host.poll(now);
    assert_eq!(t2.try_outcome(), None);

    host.poll(after_timeout(now));
    assert_eq!(t1.try_outcome(), Some(Outcome::TimedOut));
    assert!(matches!(t2.try_outcome(), Some(Outcome::Completed(_))));
}

/// Running tasks under paused time: a device that never polls leaves the
/// host's request to time out.
#[tokio::test(start_paused = true)]
async fn test_silent_device_times_out() {
    let mut rig = Rig::build(&switched(credits(4))).unwrap();
    let handle = rig.host.handle();
    let switch = rig.switch.take().expect("switched topology");
    let (shutdown_tx, _) = broadcast::channel(1);

    let host_task = tokio::spawn(rig.host.run(shutdown_tx.subscribe()));
    let switch_task = tokio::spawn(switch.run(shutdown_tx.subscribe()));

    let outcome = handle
        .call(Request::mem_read(device_address(DEV_A, 0)))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::TimedOut);
    assert_eq!(rig.stats.get(Counter::TimedOut(ProtocolKind::Mem)), 1);

    shutdown_tx.send(()).unwrap();
    host_task.await.unwrap().unwrap();
    switch_task.await.unwrap().unwrap();
    drop(rig.devices);
}
