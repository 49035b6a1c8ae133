//! Demo workload — exercises every protocol kind from each host against
//! each device and checks what comes back.

use bytes::Bytes;
use cxlsim_core::packet::device_address;
use cxlsim_core::DeviceId;
use cxlsim_fabric::{EndpointHandle, IssueError, Outcome, Request};
use futures::future::join_all;

#[derive(Debug, Default, Clone, Copy)]
pub struct Report {
    pub completed: u64,
    pub timed_out: u64,
    pub routing_failed: u64,
    pub mismatched: u64,
    pub rejected: u64,
}

impl Report {
    fn record(&mut self, outcome: &Result<Outcome, IssueError>) {
        match outcome {
            Ok(Outcome::Completed(_)) => self.completed += 1,
            Ok(Outcome::TimedOut) => self.timed_out += 1,
            Ok(Outcome::RoutingFailed) => self.routing_failed += 1,
            Err(e) => {
                tracing::warn!(error = %e, "request rejected");
                self.rejected += 1;
            }
        }
    }

    fn merge(&mut self, other: Report) {
        self.completed += other.completed;
        self.timed_out += other.timed_out;
        self.routing_failed += other.routing_failed;
        self.mismatched += other.mismatched;
        self.rejected += other.rejected;
    }
}

/// Run `rounds` rounds from every host against every device.
pub async fn run(hosts: Vec<EndpointHandle>, devices: Vec<DeviceId>, rounds: u32) -> Report {
    let runs = hosts.iter().flat_map(|host| {
        devices
            .iter()
            .map(move |&device| exercise(host.clone(), device, rounds))
    });
    let mut report = Report::default();
    for partial in join_all(runs).await {
        report.merge(partial);
    }
    report
}

async fn exercise(host: EndpointHandle, device: DeviceId, rounds: u32) -> Report {
    let mut report = Report::default();
    // keep each host in its own region of the device
    let base = device_address(device, (host.id() as u64) << 16);

    let identity = host.call(Request::cfg_read(device_address(device, 0))).await;
    report.record(&identity);
    if let Ok(Outcome::RoutingFailed) = identity {
        tracing::info!(host = host.id(), device, "device not reachable from host");
        return report;
    }

    for round in 0..rounds {
        let line = base + round as u64 * 64;
        let pattern = Bytes::from(vec![(round as u8).wrapping_add(host.id() as u8); 64]);

        let write = host.call(Request::mem_write(line, pattern.clone())).await;
        report.record(&write);
        let read = host.call(Request::mem_read(line)).await;
        if let Ok(Outcome::Completed(response)) = &read {
            if response.data != pattern {
                tracing::warn!(host = host.id(), device, line = format_args!("{line:#x}"), "read back different data");
                report.mismatched += 1;
            }
        }
        report.record(&read);

        // io writes to one address, issued back to back
        let io = join_all((0..4u32).map(|i| {
            host.call(Request::io_write(line, Bytes::copy_from_slice(&i.to_le_bytes())))
        }))
        .await;
        io.iter().for_each(|o| report.record(o));

        // a fetch and a snoop of the same line: the snoop waits for the fetch
        let (fetch, snoop) = futures::join!(
            host.call(Request::cache_fetch(line)),
            host.call(Request::snoop_invalidate(line)),
        );
        report.record(&fetch);
        report.record(&snoop);

        let evict = host.call(Request::cache_evict(line, Bytes::new())).await;
        report.record(&evict);
    }

    tracing::debug!(host = host.id(), device, completed = report.completed, "device exercised");
    report
}
