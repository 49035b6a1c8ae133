//! Fabric statistics — shared counters for every link, switch, and endpoint.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use cxlsim_core::{ProtocolKind, VhId};
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Counter {
    FlitsSent,
    FlitsReceived,
    SequenceGaps,
    CodecErrors,
    CreditOverruns,
    Forwarded(ProtocolKind),
    Completed(ProtocolKind),
    TimedOut(ProtocolKind),
    RoutingFailed(ProtocolKind),
    StrayResponses,
    Unreachable(VhId),
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Counter::FlitsSent => f.write_str("flits_sent"),
            Counter::FlitsReceived => f.write_str("flits_received"),
            Counter::SequenceGaps => f.write_str("sequence_gaps"),
            Counter::CodecErrors => f.write_str("codec_errors"),
            Counter::CreditOverruns => f.write_str("credit_overruns"),
            Counter::Forwarded(kind) => write!(f, "forwarded.{kind}"),
            Counter::Completed(kind) => write!(f, "completed.{kind}"),
            Counter::TimedOut(kind) => write!(f, "timed_out.{kind}"),
            Counter::RoutingFailed(kind) => write!(f, "routing_failed.{kind}"),
            Counter::StrayResponses => f.write_str("stray_responses"),
            Counter::Unreachable(vh) => write!(f, "unreachable.vh{vh}"),
        }
    }
}

/// Counters shared across tasks. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct FabricStats {
    counters: Arc<DashMap<Counter, u64>>,
}

/// Point-in-time copy of every non-zero counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub counters: BTreeMap<String, u64>,
}

impl FabricStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, counter: Counter, n: u64) {
        if n > 0 {
            *self.counters.entry(counter).or_default() += n;
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters.get(&counter).map(|v| *v).unwrap_or(0)
    }

    /// Routing failures in one virtual hierarchy.
    pub fn unreachable(&self, vh: VhId) -> u64 {
        self.get(Counter::Unreachable(vh))
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut entries: Vec<(Counter, u64)> =
            self.counters.iter().map(|e| (*e.key(), *e.value())).collect();
        entries.sort();
        StatsSnapshot {
            counters: entries
                .into_iter()
                .map(|(counter, value)| (counter.to_string(), value))
                .collect(),
        }
    }

    /// Log every counter at info level.
    pub fn print_stats(&self) {
        let snapshot = self.snapshot();
        if snapshot.counters.is_empty() {
            return;
        }
        let completed: u64 = ProtocolKind::ALL
            .iter()
            .map(|k| self.get(Counter::Completed(*k)))
            .sum();
        let timed_out: u64 = ProtocolKind::ALL
            .iter()
            .map(|k| self.get(Counter::TimedOut(*k)))
            .sum();
        tracing::info!(
            flits_sent = self.get(Counter::FlitsSent),
            flits_received = self.get(Counter::FlitsReceived),
            completed,
            timed_out,
            codec_errors = self.get(Counter::CodecErrors),
            "fabric stats"
        );
        for (name, value) in &snapshot.counters {
            tracing::debug!(counter = %name, value, "fabric counter");
        }
    }
}

impl fmt::Debug for FabricStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FabricStats")
            .field("counters", &self.snapshot().counters)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let stats = FabricStats::new();
        let other = stats.clone();
        other.incr(Counter::Unreachable(2));
        other.add(Counter::Forwarded(ProtocolKind::Mem), 3);
        stats.add(Counter::CodecErrors, 0);
        assert_eq!(stats.unreachable(2), 1);
        assert_eq!(stats.unreachable(0), 0);
        assert_eq!(stats.get(Counter::Forwarded(ProtocolKind::Mem)), 3);
        assert_eq!(stats.get(Counter::CodecErrors), 0);
    }

    #[test]
    fn snapshot_serializes_with_readable_names() {
        let stats = FabricStats::new();
        stats.incr(Counter::TimedOut(ProtocolKind::Io));
        stats.incr(Counter::Unreachable(1));
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["counters"]["timed_out.io"], 1);
        assert_eq!(json["counters"]["unreachable.vh1"], 1);
    }
}
