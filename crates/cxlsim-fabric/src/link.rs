//! Link — one end of a bidirectional flit channel.
//!
//! A link end owns the codec, both directions' credit ledgers, the outgoing
//! slot queues, and the sequence counters. Packets are queued with
//! `send_request`/`send_response` and leave in flits on `flush`; received
//! flits are unpacked into an inbound packet queue drained by `poll_receive`.
//!
//! Per-link delivery is FIFO: the two ends are joined by a pair of unbounded
//! tokio channels, one per direction.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use cxlsim_core::config::{Credits, LinkSettings};
use cxlsim_core::wire::MAX_CREDIT_RETURN;
use cxlsim_core::{CreditReturn, Flit, FlitCodec, FlitLayout, Packet, ProtocolKind, Slot, WireError};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::capture::{CaptureRecord, CaptureSink};
use crate::credit::{CreditError, CreditManager, Direction};
use crate::stats::{Counter, FabricStats};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("no {0} credits available")]
    Backpressure(ProtocolKind),
    #[error("link is not active")]
    Inactive,
    #[error("peer has disconnected")]
    Disconnected,
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Flit shape and slot claim order, shared by both ends of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub layout: FlitLayout,
    pub priority: Vec<ProtocolKind>,
}

impl LinkConfig {
    pub fn from_settings(settings: &LinkSettings) -> Result<Self, WireError> {
        Ok(Self {
            layout: settings.layout()?,
            priority: settings.priority_order(),
        })
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            layout: FlitLayout::default(),
            priority: LinkSettings::default().priority_order(),
        }
    }
}

pub struct Link {
    name: Arc<str>,
    codec: FlitCodec,
    priority: Vec<ProtocolKind>,
    credits: CreditManager,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    peer_closed: bool,
    tx_sequence: u32,
    rx_expected: Option<u32>,
    /// Encoded packets waiting for a slot, per protocol.
    pending: [VecDeque<Bytes>; 3],
    /// Inbound credits freed but not yet returned to the peer.
    owed: [u16; 3],
    inbound: VecDeque<Packet>,
    capture: Option<Arc<dyn CaptureSink>>,
    stats: FabricStats,
}

impl Link {
    /// Create both ends of a link. Neither end has credits or is active;
    /// see `establish`.
    pub fn pair(a: &str, b: &str, config: &LinkConfig) -> (Link, Link) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Link::new(format!("{a}->{b}"), config, a_tx, a_rx),
            Link::new(format!("{b}->{a}"), config, b_tx, b_rx),
        )
    }

    fn new(
        name: String,
        config: &LinkConfig,
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            name: Arc::from(name),
            codec: FlitCodec::new(config.layout),
            priority: config.priority.clone(),
            credits: CreditManager::new(),
            tx,
            rx,
            peer_closed: false,
            tx_sequence: 0,
            rx_expected: None,
            pending: Default::default(),
            owed: [0; 3],
            inbound: VecDeque::new(),
            capture: None,
            stats: FabricStats::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_capture(mut self, sink: Arc<dyn CaptureSink>) -> Self {
        self.capture = Some(sink);
        self
    }

    pub fn set_capture(&mut self, sink: Arc<dyn CaptureSink>) {
        self.capture = Some(sink);
    }

    pub fn set_stats(&mut self, stats: FabricStats) {
        self.stats = stats;
    }

    pub fn stats(&self) -> &FabricStats {
        &self.stats
    }

    /// Setup only: fails with `InvalidState` once the link is active.
    pub fn advertise(
        &mut self,
        direction: Direction,
        kind: ProtocolKind,
        capacity: u16,
    ) -> Result<(), CreditError> {
        self.credits.advertise(direction, kind, capacity)
    }

    pub fn activate(&mut self) {
        self.credits.activate();
        tracing::info!(link = %self.name, "link active");
    }

    pub fn is_active(&self) -> bool {
        self.credits.is_active()
    }

    pub fn credits(&self) -> &CreditManager {
        &self.credits
    }

    /// Outbound credits currently held for `kind`.
    pub fn held(&self, kind: ProtocolKind) -> u16 {
        self.credits.held(Direction::Outbound, kind)
    }

    pub fn layout(&self) -> FlitLayout {
        self.codec.layout()
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Queue a request. Takes one outbound credit or fails with
    /// `Backpressure`; nothing is queued on failure.
    pub fn send_request(&mut self, packet: &Packet) -> Result<(), SendError> {
        let bytes = self.encode(packet)?;
        let kind = packet.kind();
        if !self.credits.try_reserve(Direction::Outbound, kind) {
            return Err(SendError::Backpressure(kind));
        }
        self.pending[kind.index()].push_back(bytes);
        Ok(())
    }

    /// Queue a response. Responses ride on the buffer the request reserved
    /// and need no credit.
    pub fn send_response(&mut self, packet: &Packet) -> Result<(), SendError> {
        let bytes = self.encode(packet)?;
        self.pending[packet.kind().index()].push_back(bytes);
        Ok(())
    }

    fn encode(&self, packet: &Packet) -> Result<Bytes, SendError> {
        if !self.is_active() {
            return Err(SendError::Inactive);
        }
        if self.peer_closed || self.tx.is_closed() {
            return Err(SendError::Disconnected);
        }
        let bytes = packet.encode()?;
        let max = self.codec.layout().slot_payload();
        if bytes.len() > max {
            return Err(WireError::PayloadTooLarge {
                len: bytes.len(),
                max,
            }
            .into());
        }
        Ok(bytes)
    }

    /// One inbound buffer of `kind` drained. The credit goes back to the
    /// peer with the next flit.
    pub fn release(&mut self, kind: ProtocolKind) {
        let absorbed = self.credits.on_credit_return(Direction::Inbound, kind, 1);
        if absorbed > 0 {
            tracing::warn!(link = %self.name, %kind, "released a buffer that was not held");
            return;
        }
        self.owed[kind.index()] += 1;
    }

    /// Give back an outbound credit locally, as for a transaction that
    /// timed out. A later return from the peer is absorbed by the clamp.
    pub fn reclaim(&mut self, kind: ProtocolKind) {
        self.credits.on_credit_return(Direction::Outbound, kind, 1);
    }

    pub fn has_outgoing(&self) -> bool {
        self.pending.iter().any(|q| !q.is_empty()) || self.owed.iter().any(|&c| c > 0)
    }

    /// Pack and transmit everything queued, plus any owed credit returns.
    /// Returns the number of flits sent.
    pub fn flush(&mut self) -> Result<usize, SendError> {
        let mut sent = 0;
        while self.has_outgoing() {
            let flit = self.next_flit();
            let bytes = self.codec.pack(&flit)?;
            if self.tx.send(bytes.clone()).is_err() {
                // nothing queued can ever be delivered
                self.pending.iter_mut().for_each(VecDeque::clear);
                self.owed = [0; 3];
                self.mark_peer_closed();
                return Err(SendError::Disconnected);
            }
            self.capture(Direction::Outbound, &bytes);
            self.stats.incr(Counter::FlitsSent);
            tracing::trace!(
                link = %self.name,
                seq = flit.sequence,
                slots = flit.slots.len(),
                "flit sent"
            );
            sent += 1;
        }
        Ok(sent)
    }

    /// Fill slots by priority, FIFO within a protocol, and attach owed
    /// credit returns.
    fn next_flit(&mut self) -> Flit {
        let capacity = self.codec.layout().slots();
        let mut slots = Vec::with_capacity(capacity);
        for kind in &self.priority {
            let queue = &mut self.pending[kind.index()];
            while slots.len() < capacity {
                match queue.pop_front() {
                    Some(payload) => slots.push(Slot {
                        kind: *kind,
                        payload,
                    }),
                    None => break,
                }
            }
        }

        let mut credit_return = CreditReturn::default();
        for kind in ProtocolKind::ALL {
            let owed = &mut self.owed[kind.index()];
            let amount = (*owed).min(MAX_CREDIT_RETURN);
            *owed -= amount;
            credit_return.set(kind, amount as u8);
        }

        let sequence = self.tx_sequence;
        self.tx_sequence = self.tx_sequence.wrapping_add(1);
        Flit {
            sequence,
            credit_return,
            slots,
        }
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    /// Next received packet, unpacking any flits already delivered.
    /// Never waits.
    pub fn poll_receive(&mut self) -> Option<Packet> {
        loop {
            if let Some(packet) = self.inbound.pop_front() {
                return Some(packet);
            }
            match self.rx.try_recv() {
                Ok(bytes) => self.ingest(bytes),
                Err(mpsc::error::TryRecvError::Empty) => return None,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.mark_peer_closed();
                    return None;
                }
            }
        }
    }

    /// Wait for the next flit, or return at once if packets are already
    /// waiting. A credit-only flit also wakes the caller, since it may
    /// unblock queued sends. Returns false once the peer is gone.
    /// Cancel-safe.
    pub async fn fill(&mut self) -> bool {
        if !self.inbound.is_empty() {
            return true;
        }
        match self.rx.recv().await {
            Some(bytes) => {
                self.ingest(bytes);
                true
            }
            None => {
                self.mark_peer_closed();
                false
            }
        }
    }

    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    fn mark_peer_closed(&mut self) {
        if !self.peer_closed {
            self.peer_closed = true;
            tracing::info!(link = %self.name, "peer disconnected");
        }
    }

    /// Unpack one flit. Bad flits and bad slots are dropped and counted.
    fn ingest(&mut self, bytes: Bytes) {
        self.stats.incr(Counter::FlitsReceived);
        self.capture(Direction::Inbound, &bytes);

        let flit = match self.codec.unpack(&bytes) {
            Ok(flit) => flit,
            Err(e) => {
                tracing::warn!(link = %self.name, error = %e, "dropping flit");
                self.stats.incr(Counter::CodecErrors);
                return;
            }
        };

        if let Some(expected) = self.rx_expected {
            if flit.sequence != expected {
                let gap = flit.sequence.wrapping_sub(expected);
                tracing::warn!(link = %self.name, expected, got = flit.sequence, "flit sequence gap");
                self.stats.add(Counter::SequenceGaps, gap as u64);
            }
        }
        self.rx_expected = Some(flit.sequence.wrapping_add(1));

        for kind in ProtocolKind::ALL {
            let amount = flit.credit_return.get(kind) as u16;
            if amount > 0 {
                let absorbed = self.credits.on_credit_return(Direction::Outbound, kind, amount);
                if absorbed > 0 {
                    tracing::debug!(link = %self.name, %kind, absorbed, "credit return clamped");
                }
            }
        }

        for slot in flit.slots {
            let packet = match Packet::decode(slot.kind, &slot.payload) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::warn!(link = %self.name, error = %e, "dropping slot");
                    self.stats.incr(Counter::CodecErrors);
                    continue;
                }
            };
            if packet.is_request() && !self.credits.try_reserve(Direction::Inbound, slot.kind) {
                tracing::warn!(link = %self.name, kind = %slot.kind, tag = packet.tag, "credit overrun, dropping request");
                self.stats.incr(Counter::CreditOverruns);
                continue;
            }
            tracing::trace!(link = %self.name, opcode = %packet.opcode, tag = packet.tag, "packet received");
            self.inbound.push_back(packet);
        }
    }

    fn capture(&self, direction: Direction, bytes: &Bytes) {
        if let Some(sink) = &self.capture {
            sink.record(CaptureRecord {
                timestamp: Instant::now(),
                link: self.name.clone(),
                direction,
                bytes: bytes.clone(),
            });
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .field("tx_sequence", &self.tx_sequence)
            .finish()
    }
}

/// Advertise each side's receive buffers to the other and activate both.
pub fn establish(
    a: &mut Link,
    a_receive: Credits,
    b: &mut Link,
    b_receive: Credits,
) -> Result<(), CreditError> {
    for kind in ProtocolKind::ALL {
        a.advertise(Direction::Inbound, kind, a_receive.get(kind))?;
        a.advertise(Direction::Outbound, kind, b_receive.get(kind))?;
        b.advertise(Direction::Inbound, kind, b_receive.get(kind))?;
        b.advertise(Direction::Outbound, kind, a_receive.get(kind))?;
    }
    a.activate();
    b.activate();
    Ok(())
}
