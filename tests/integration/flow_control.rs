use crate::*;
use cxlsim_core::packet::device_address;
use cxlsim_core::ProtocolKind;
use cxlsim_fabric::{Counter, IssueError, Request};
use tokio::time::Instant;

/// mem capacity 2: the third back-to-back read is refused, and a read goes
/// through again once the device has answered.
#[test]
fn test_mem_backpressure_through_switch() {
    let mut rig = Rig::build(&switched(credits(2))).unwrap();
    let now = Instant::now();
    let line = |n: u64| device_address(DEV_A, n * 64);

    let mut first = rig.host.try_issue(Request::mem_read(line(0)), now).unwrap();
    let _second = rig.host.try_issue(Request::mem_read(line(1)), now).unwrap();
    assert_eq!(
        rig.host.try_issue(Request::mem_read(line(2)), now).unwrap_err(),
        IssueError::Backpressure(ProtocolKind::Mem)
    );
    assert_eq!(rig.host.link().held(ProtocolKind::Mem), 0);

    // switch forwards, device answers, switch relays the answers back
    rig.step_switch();
    rig.device(DEV_A).poll(now);
    rig.step_switch();
    rig.host.poll(now);

    assert_eq!(completed(&mut first).data.len(), 64);
    assert!(rig.host.try_issue(Request::mem_read(line(2)), now).is_ok());
    rig.settle(now);
    assert_eq!(rig.stats.get(Counter::Completed(ProtocolKind::Mem)), 3);
}

/// Same scenario with the host wired straight to the device.
#[test]
fn test_mem_backpressure_direct() {
    let mut rig = Rig::build(&direct(credits(2))).unwrap();
    let now = Instant::now();
    let addr = device_address(DEV_A, 0);

    rig.host.try_issue(Request::mem_read(addr), now).unwrap();
    rig.host.try_issue(Request::mem_read(addr), now).unwrap();
    assert!(matches!(
        rig.host.try_issue(Request::mem_read(addr), now),
        Err(IssueError::Backpressure(ProtocolKind::Mem))
    ));

    rig.device(DEV_A).poll(now);
    rig.host.poll(now);
    assert!(rig.host.try_issue(Request::mem_read(addr), now).is_ok());
}

/// Other protocol kinds keep flowing while mem is out of credits.
#[test]
fn test_backpressure_is_per_protocol() {
    let mut rig = Rig::build(&switched(credits(1))).unwrap();
    let now = Instant::now();
    rig.host.try_issue(Request::mem_read(device_address(DEV_A, 0)), now).unwrap();
    assert!(rig.host.try_issue(Request::mem_read(device_address(DEV_A, 64)), now).is_err());

    let mut cfg = rig.host.try_issue(Request::cfg_read(device_address(DEV_A, 0)), now).unwrap();
    rig.settle(now);
    assert_eq!(completed(&mut cfg).data.len(), 4);
}

/// A mixed burst larger than every credit pool drains completely and never
/// pushes a ledger past its capacity.
#[test]
fn test_credits_stay_within_bounds() {
    let pools = cxlsim_core::config::Credits {
        io: 3,
        cache: 3,
        mem: 3,
    };
    let mut rig = Rig::build(&switched(pools)).unwrap();
    let now = Instant::now();
    let mut handles = Vec::new();

    for i in 0..24u64 {
        let device = if i % 2 == 0 { DEV_A } else { DEV_B };
        let addr = device_address(device, (i % 5) * 64);
        let request = match i % 4 {
            0 => Request::mem_read(addr),
            1 => Request::io_write(addr, bytes::Bytes::from_static(b"abcd")),
            2 => Request::cache_fetch(addr),
            _ => Request::mem_write(addr, bytes::Bytes::from_static(b"data")),
        };
        handles.push(rig.host.issue(request, now).unwrap());

        if i % 3 == 0 {
            rig.step_switch();
            rig.step_devices(now);
            rig.step_switch();
            rig.host.poll(now);
        }
        rig.assert_credits_bounded();
    }

    rig.settle(now);
    rig.assert_credits_bounded();
    for handle in &mut handles {
        completed(handle);
    }
    for kind in ProtocolKind::ALL {
        assert_eq!(rig.host.link().held(kind), 3, "{kind} credits not all returned");
    }
    assert_eq!(rig.host.open_count(), 0);
}
