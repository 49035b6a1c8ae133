//! cxlsimd — runs a simulated CXL fabric built from the configured topology.
//!
//! Usage: `cxlsimd [rounds]`. Runs the demo workload, prints fabric stats
//! every few seconds, and exits when the workload finishes or on ctrl-c.
//! Set `CXLSIM_CAPTURE=1` to log every flit at trace level.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cxlsim_core::SimConfig;
use cxlsim_fabric::{topology, CaptureSink, TracingCapture};
use tokio::task::JoinHandle;

mod workload;

const DEFAULT_ROUNDS: u32 = 4;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = SimConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SimConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SimConfig::default()
    });

    let rounds = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("rounds must be a number")?,
        None => DEFAULT_ROUNDS,
    };

    let capture: Option<Arc<dyn CaptureSink>> = std::env::var_os("CXLSIM_CAPTURE")
        .map(|_| Arc::new(TracingCapture) as Arc<dyn CaptureSink>);

    let mut fabric = topology::build(&config, capture).context("invalid topology")?;
    let stats = fabric.stats.clone();
    tracing::info!(
        slots = config.link.slots_per_flit,
        slot_payload = config.link.slot_payload_size,
        timeout_ms = config.transaction.timeout_ms,
        rounds,
        "cxlsimd starting"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let hosts: Vec<_> = fabric.hosts.iter().map(|h| h.handle()).collect();
    let devices: Vec<_> = fabric.devices.iter().map(|d| d.id()).collect();

    let mut tasks: Vec<(String, JoinHandle<Result<()>>)> = Vec::new();
    for switch in fabric.switches.drain(..) {
        let name = format!("switch {}", switch.id());
        tasks.push((name, tokio::spawn(switch.run(shutdown_tx.subscribe()))));
    }
    for endpoint in fabric.hosts.drain(..).chain(fabric.devices.drain(..)) {
        let name = format!("endpoint {}", endpoint.id());
        tasks.push((name, tokio::spawn(endpoint.run(shutdown_tx.subscribe()))));
    }

    let stats_printer = {
        let stats = stats.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                stats.print_stats();
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    let workload = workload::run(hosts, devices, rounds);

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        report = workload => {
            tracing::info!(
                completed = report.completed,
                timed_out = report.timed_out,
                routing_failed = report.routing_failed,
                mismatched = report.mismatched,
                rejected = report.rejected,
                "workload finished"
            );
            let _ = shutdown_tx.send(());
        }
    }

    for (name, task) in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(task = %name, error = %e, "task failed"),
            Err(e) => tracing::error!(task = %name, error = %e, "task panicked"),
        }
    }
    stats_printer.abort();

    stats.print_stats();
    println!(
        "{}",
        serde_json::to_string_pretty(&stats.snapshot()).context("failed to encode stats")?
    );
    Ok(())
}
