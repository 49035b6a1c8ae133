use std::sync::Arc;

use crate::*;
use bytes::Bytes;
use cxlsim_core::packet::{device_address, CacheOpcode};
use cxlsim_core::{Opcode, ProtocolKind};
use cxlsim_fabric::{topology, Counter, Direction, MemoryCapture, Outcome, Request};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

fn spawn_all(
    fabric: &mut cxlsim_fabric::Fabric,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<anyhow::Result<()>>> {
    let mut tasks = Vec::new();
    for switch in fabric.switches.drain(..) {
        tasks.push(tokio::spawn(switch.run(shutdown.subscribe())));
    }
    for endpoint in fabric.hosts.drain(..).chain(fabric.devices.drain(..)) {
        tasks.push(tokio::spawn(endpoint.run(shutdown.subscribe())));
    }
    tasks
}

/// Host writes and reads back on both devices through the running fabric.
#[tokio::test]
async fn test_fabric_round_trip_on_tasks() {
    let capture = MemoryCapture::new();
    let mut fabric = topology::build(&switched(credits(2)), Some(Arc::new(capture.clone()))).unwrap();
    let host = fabric.hosts[0].handle();
    let stats = fabric.stats.clone();
    let (shutdown_tx, _) = broadcast::channel(1);
    let tasks = spawn_all(&mut fabric, &shutdown_tx);

    for device in [DEV_A, DEV_B] {
        let line = device_address(device, 0x400);
        let pattern = Bytes::from(vec![device as u8; 64]);
        let write = host.call(Request::mem_write(line, pattern.clone())).await.unwrap();
        assert!(matches!(write, Outcome::Completed(_)));
        match host.call(Request::mem_read(line)).await.unwrap() {
            Outcome::Completed(response) => assert_eq!(response.data, pattern),
            other => panic!("read from {device} did not complete: {other:?}"),
        }
    }

    // more concurrent writes than the mem credit pool holds
    let handles = issue_then_await(&host, 6).await;
    assert!(handles.iter().all(|o| matches!(o, Outcome::Completed(_))));

    shutdown_tx.send(()).unwrap();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(stats.get(Counter::Completed(ProtocolKind::Mem)), 10);
    assert_eq!(stats.get(Counter::CodecErrors), 0);
    let sent = capture
        .records()
        .iter()
        .filter(|r| r.direction == Direction::Outbound)
        .count() as u64;
    assert_eq!(sent, stats.get(Counter::FlitsSent));
}

/// Issue `n` mem writes to device 16 before awaiting any of them.
async fn issue_then_await(host: &cxlsim_fabric::EndpointHandle, n: u64) -> Vec<Outcome> {
    let mut pending = Vec::new();
    for i in 0..n {
        let request = Request::mem_write(device_address(DEV_A, i * 64), Bytes::from_static(b"w"));
        pending.push(host.issue(request).await.unwrap());
    }
    let mut outcomes = Vec::new();
    for handle in pending {
        outcomes.push(handle.outcome().await);
    }
    outcomes
}

/// Fetch and snoop of one line issued together on running tasks both
/// complete, snoop after fetch.
#[tokio::test]
async fn test_fetch_and_snoop_on_tasks() {
    let mut fabric = topology::build(&switched(credits(8)), None).unwrap();
    let host = fabric.hosts[0].handle();
    let (shutdown_tx, _) = broadcast::channel(1);
    let tasks = spawn_all(&mut fabric, &shutdown_tx);

    let line = device_address(DEV_B, 0x80);
    let fetch = host.issue(Request::cache_fetch(line)).await.unwrap();
    let snoop = host.issue(Request::snoop_invalidate(line)).await.unwrap();
    assert!(snoop.id() != fetch.id());

    match fetch.outcome().await {
        Outcome::Completed(r) => assert_eq!(r.opcode, Opcode::Cache(CacheOpcode::Go)),
        other => panic!("fetch: {other:?}"),
    }
    match snoop.outcome().await {
        Outcome::Completed(r) => assert_eq!(r.opcode, Opcode::Cache(CacheOpcode::RspIHitI)),
        other => panic!("snoop: {other:?}"),
    }

    shutdown_tx.send(()).unwrap();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
}

/// Stats serialize to readable JSON after a run.
#[tokio::test]
async fn test_stats_snapshot_after_run() {
    let mut fabric = topology::build(&switched(credits(8)), None).unwrap();
    let host = fabric.hosts[0].handle();
    let stats = fabric.stats.clone();
    let (shutdown_tx, _) = broadcast::channel(1);
    let tasks = spawn_all(&mut fabric, &shutdown_tx);

    let outcome = host.call(Request::cfg_read(device_address(99, 0))).await.unwrap();
    assert_eq!(outcome, Outcome::RoutingFailed);

    shutdown_tx.send(()).unwrap();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let json = serde_json::to_value(stats.snapshot()).unwrap();
    assert_eq!(json["counters"]["unreachable.vh0"], 1);
    assert_eq!(json["counters"]["routing_failed.io"], 1);
}
