//! Flit capture — every flit a link sends or receives is offered to a sink.
//!
//! The engine never writes capture files itself. `TracingCapture` logs the
//! packed bytes; anything that wants pcap or similar implements `CaptureSink`.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::time::Instant;

use crate::credit::Direction;

#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub timestamp: Instant,
    pub link: Arc<str>,
    pub direction: Direction,
    pub bytes: Bytes,
}

pub trait CaptureSink: Send + Sync {
    fn record(&self, record: CaptureRecord);
}

/// Logs each flit as hex at trace level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCapture;

impl CaptureSink for TracingCapture {
    fn record(&self, record: CaptureRecord) {
        tracing::trace!(
            link = %record.link,
            direction = %record.direction,
            len = record.bytes.len(),
            bytes = %hex::encode(&record.bytes),
            "flit"
        );
    }
}

/// Keeps every record in memory. For tests and post-run inspection.
#[derive(Debug, Default, Clone)]
pub struct MemoryCapture {
    records: Arc<Mutex<Vec<CaptureRecord>>>,
}

impl MemoryCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CaptureRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CaptureSink for MemoryCapture {
    fn record(&self, record: CaptureRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}
