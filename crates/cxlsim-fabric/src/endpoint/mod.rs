//! Endpoint shell — a host or device on the end of one link.
//!
//! An endpoint owns its link, one transaction state machine per protocol
//! kind, and a `RequestHandler` that serves requests addressed to it. All of
//! it is driven from `poll`, either directly (tests, single-threaded drivers)
//! or from `run` on its own tokio task with an `EndpointHandle` as the
//! command surface.

use std::time::Duration;

use bytes::Bytes;
use cxlsim_core::config::TransactionSettings;
use cxlsim_core::packet::{device_of, CacheOpcode, IoOpcode, MemOpcode, PACKET_HEADER_LEN};
use cxlsim_core::{DeviceId, Opcode, Packet, ProtocolKind, Status, VhId, WireError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};

use crate::link::{Link, SendError};
use crate::stats::{Counter, FabricStats};
use crate::transaction::{
    IssueError, Outcome, ResponseDisposition, StateMachine, TransactionHandle,
};

pub mod backend;

pub use backend::{RequestHandler, SparseMemory};

const COMMAND_QUEUE: usize = 64;

/// One request to issue: opcode, target address, and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub address: u64,
    pub data: Bytes,
}

impl Request {
    pub fn new(opcode: impl Into<Opcode>, address: u64, data: Bytes) -> Self {
        Self {
            opcode: opcode.into(),
            address,
            data,
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        self.opcode.kind()
    }

    pub fn mem_read(address: u64) -> Self {
        Self::new(MemOpcode::MemRd, address, Bytes::new())
    }

    pub fn mem_write(address: u64, data: Bytes) -> Self {
        Self::new(MemOpcode::MemWr, address, data)
    }

    pub fn mem_invalidate(address: u64) -> Self {
        Self::new(MemOpcode::MemInv, address, Bytes::new())
    }

    pub fn io_read(address: u64) -> Self {
        Self::new(IoOpcode::MemRd, address, Bytes::new())
    }

    pub fn io_write(address: u64, data: Bytes) -> Self {
        Self::new(IoOpcode::MemWr, address, data)
    }

    pub fn cfg_read(address: u64) -> Self {
        Self::new(IoOpcode::CfgRd, address, Bytes::new())
    }

    pub fn cfg_write(address: u64, value: u32) -> Self {
        Self::new(
            IoOpcode::CfgWr,
            address,
            Bytes::copy_from_slice(&value.to_le_bytes()),
        )
    }

    /// Shared read of a cache line.
    pub fn cache_fetch(address: u64) -> Self {
        Self::new(CacheOpcode::RdShared, address, Bytes::new())
    }

    /// Evict a line; dirty when `data` is non-empty.
    pub fn cache_evict(address: u64, data: Bytes) -> Self {
        if data.is_empty() {
            Self::new(CacheOpcode::CleanEvict, address, data)
        } else {
            Self::new(CacheOpcode::DirtyEvict, address, data)
        }
    }

    pub fn snoop_invalidate(address: u64) -> Self {
        Self::new(CacheOpcode::SnpInv, address, Bytes::new())
    }

    pub fn snoop_data(address: u64) -> Self {
        Self::new(CacheOpcode::SnpData, address, Bytes::new())
    }
}

enum Command {
    Issue {
        request: Request,
        /// Fail with `Backpressure` instead of queueing.
        immediate: bool,
        reply: oneshot::Sender<Result<TransactionHandle, IssueError>>,
    },
}

pub struct Endpoint {
    id: DeviceId,
    vh: VhId,
    link: Link,
    machines: [StateMachine; 3],
    handler: Box<dyn RequestHandler>,
    stats: FabricStats,
    poll_interval: Duration,
    commands: mpsc::Receiver<Command>,
    command_tx: Option<mpsc::Sender<Command>>,
}

impl Endpoint {
    pub fn new(
        id: DeviceId,
        vh: VhId,
        mut link: Link,
        settings: &TransactionSettings,
        handler: Box<dyn RequestHandler>,
        stats: FabricStats,
    ) -> Self {
        link.set_stats(stats.clone());
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        Self {
            id,
            vh,
            link,
            machines: ProtocolKind::ALL.map(|kind| StateMachine::new(kind, settings)),
            handler,
            stats,
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            commands,
            command_tx: Some(command_tx),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn machine(&self, kind: ProtocolKind) -> &StateMachine {
        &self.machines[kind.index()]
    }

    /// Command surface for use once the endpoint runs on its own task.
    pub fn handle(&self) -> EndpointHandle {
        EndpointHandle {
            id: self.id,
            tx: self.command_tx.clone(),
        }
    }

    /// Open transactions across all protocol kinds.
    pub fn open_count(&self) -> usize {
        self.machines.iter().map(|m| m.open_count()).sum()
    }

    /// Earliest moment an open transaction can time out.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.machines.iter().filter_map(|m| m.next_deadline()).min()
    }

    // ── Issue ────────────────────────────────────────────────────────────────

    /// Open a transaction and send it as soon as a credit allows. Without a
    /// credit it waits in `PendingSend` and goes out on a later poll.
    pub fn issue(&mut self, request: Request, now: Instant) -> Result<TransactionHandle, IssueError> {
        self.check_size(&request)?;
        let kind = request.kind();
        let handle = self.machines[kind.index()].issue(
            request.opcode,
            request.address,
            request.data,
            now,
        )?;
        self.dispatch(kind);
        self.flush();
        Ok(handle)
    }

    /// Like `issue`, but fails with `Backpressure` when no credit is free
    /// for this request right now. Nothing is opened on failure. Snoops held
    /// back behind a request on their line are not waiting for credit and
    /// do not count against it.
    pub fn try_issue(&mut self, request: Request, now: Instant) -> Result<TransactionHandle, IssueError> {
        let kind = request.kind();
        let waiting = self.machines[kind.index()].sendable().len();
        if self.link.held(kind) as usize <= waiting {
            return Err(IssueError::Backpressure(kind));
        }
        self.issue(request, now)
    }

    fn check_size(&self, request: &Request) -> Result<(), IssueError> {
        let len = PACKET_HEADER_LEN + request.data.len();
        let max = self.link.layout().slot_payload();
        if len > max {
            return Err(WireError::PayloadTooLarge { len, max }.into());
        }
        Ok(())
    }

    pub fn mem_read(&mut self, address: u64, now: Instant) -> Result<TransactionHandle, IssueError> {
        self.issue(Request::mem_read(address), now)
    }

    pub fn mem_write(&mut self, address: u64, data: Bytes, now: Instant) -> Result<TransactionHandle, IssueError> {
        self.issue(Request::mem_write(address, data), now)
    }

    pub fn mem_invalidate(&mut self, address: u64, now: Instant) -> Result<TransactionHandle, IssueError> {
        self.issue(Request::mem_invalidate(address), now)
    }

    pub fn io_read(&mut self, address: u64, now: Instant) -> Result<TransactionHandle, IssueError> {
        self.issue(Request::io_read(address), now)
    }

    pub fn io_write(&mut self, address: u64, data: Bytes, now: Instant) -> Result<TransactionHandle, IssueError> {
        self.issue(Request::io_write(address, data), now)
    }

    pub fn cfg_read(&mut self, address: u64, now: Instant) -> Result<TransactionHandle, IssueError> {
        self.issue(Request::cfg_read(address), now)
    }

    pub fn cfg_write(&mut self, address: u64, value: u32, now: Instant) -> Result<TransactionHandle, IssueError> {
        self.issue(Request::cfg_write(address, value), now)
    }

    pub fn cache_fetch(&mut self, address: u64, now: Instant) -> Result<TransactionHandle, IssueError> {
        self.issue(Request::cache_fetch(address), now)
    }

    pub fn cache_evict(&mut self, address: u64, data: Bytes, now: Instant) -> Result<TransactionHandle, IssueError> {
        self.issue(Request::cache_evict(address, data), now)
    }

    pub fn snoop_invalidate(&mut self, address: u64, now: Instant) -> Result<TransactionHandle, IssueError> {
        self.issue(Request::snoop_invalidate(address), now)
    }

    pub fn snoop_data(&mut self, address: u64, now: Instant) -> Result<TransactionHandle, IssueError> {
        self.issue(Request::snoop_data(address), now)
    }

    // ── Poll ─────────────────────────────────────────────────────────────────

    /// Serve received requests, complete received responses, expire overdue
    /// transactions, send what credits allow, and flush. Returns the number
    /// of packets received.
    pub fn poll(&mut self, now: Instant) -> usize {
        let mut received = 0;
        while let Some(packet) = self.link.poll_receive() {
            received += 1;
            if packet.is_request() {
                self.serve(packet);
            } else {
                self.complete(packet);
            }
        }

        for kind in ProtocolKind::ALL {
            for expired in self.machines[kind.index()].expire(now) {
                self.stats.incr(Counter::TimedOut(kind));
                if expired.was_sent {
                    self.link.reclaim(kind);
                }
                tracing::debug!(
                    endpoint = self.id,
                    %kind,
                    id = expired.id,
                    opcode = %expired.opcode,
                    sent = expired.was_sent,
                    "transaction timed out"
                );
            }
        }

        for kind in ProtocolKind::ALL {
            self.dispatch(kind);
        }
        self.flush();
        received
    }

    fn serve(&mut self, request: Packet) {
        let kind = request.kind();
        let response = if device_of(request.address) != self.id {
            tracing::warn!(
                endpoint = self.id,
                target = device_of(request.address),
                opcode = %request.opcode,
                "request for another device"
            );
            self.stats.incr(Counter::Unreachable(request.vh));
            request.failure(Status::Unreachable)
        } else {
            self.handler.handle(&request)
        };
        if let Err(e) = self.link.send_response(&response) {
            tracing::warn!(endpoint = self.id, error = %e, opcode = %response.opcode, "response not sent");
        }
        self.link.release(kind);
    }

    fn complete(&mut self, response: Packet) {
        let kind = response.kind();
        match self.machines[kind.index()].on_response(&response) {
            ResponseDisposition::Completed(n) => {
                self.stats.add(Counter::Completed(kind), n as u64);
                if response.status == Status::Unreachable {
                    self.stats.incr(Counter::RoutingFailed(kind));
                }
            }
            ResponseDisposition::Held => {
                tracing::debug!(endpoint = self.id, %kind, id = response.tag, "response held for ordering");
            }
            ResponseDisposition::Late => {
                tracing::debug!(endpoint = self.id, %kind, id = response.tag, "late response discarded");
            }
            ResponseDisposition::Stray(reason) => {
                tracing::warn!(endpoint = self.id, %kind, id = response.tag, opcode = %response.opcode, reason, "stray response");
                self.stats.incr(Counter::StrayResponses);
            }
        }
    }

    /// Hand sendable transactions of `kind` to the link until credits run out.
    fn dispatch(&mut self, kind: ProtocolKind) {
        let machine = &mut self.machines[kind.index()];
        for id in machine.sendable() {
            let Some(packet) = machine.request_packet(id, self.vh, self.id) else {
                continue;
            };
            match self.link.send_request(&packet) {
                Ok(()) => machine.mark_sent(id),
                Err(SendError::Backpressure(_)) => break,
                Err(e) => {
                    tracing::warn!(endpoint = self.id, %kind, id, error = %e, "send failed");
                    break;
                }
            }
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.link.flush() {
            tracing::warn!(endpoint = self.id, error = %e, "flush failed");
        }
    }

    fn execute(&mut self, command: Command, now: Instant) {
        match command {
            Command::Issue {
                request,
                immediate,
                reply,
            } => {
                let result = if immediate {
                    self.try_issue(request, now)
                } else {
                    self.issue(request, now)
                };
                // the caller may have given up waiting
                let _ = reply.send(result);
            }
        }
    }

    /// Serve the link and the command queue until shutdown. Exits early once
    /// every handle is dropped, the peer is gone, and nothing is in flight.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        drop(self.command_tx.take());
        tracing::info!(endpoint = self.id, vh = self.vh, link = %self.link.name(), "endpoint running");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        loop {
            self.poll(Instant::now());
            if !commands_open && self.link.is_peer_closed() && self.open_count() == 0 {
                tracing::info!(endpoint = self.id, "endpoint idle and disconnected, exiting");
                return Ok(());
            }

            let peer_open = !self.link.is_peer_closed();
            let deadline = self.next_deadline();
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(endpoint = self.id, open = self.open_count(), "endpoint shutting down");
                    return Ok(());
                }
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.execute(command, Instant::now()),
                    None => commands_open = false,
                },
                _ = self.link.fill(), if peer_open => {}
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
                _ = ticker.tick() => {}
            }
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("vh", &self.vh)
            .field("link", &self.link)
            .field("open", &self.open_count())
            .finish()
    }
}

/// Issues requests to an endpoint running on its own task.
#[derive(Clone)]
pub struct EndpointHandle {
    id: DeviceId,
    tx: Option<mpsc::Sender<Command>>,
}

impl EndpointHandle {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Queue `request`; it goes out when a credit frees up.
    pub async fn issue(&self, request: Request) -> Result<TransactionHandle, IssueError> {
        self.submit(request, false).await
    }

    /// Issue only if a credit is free now, otherwise `Backpressure`.
    pub async fn try_issue(&self, request: Request) -> Result<TransactionHandle, IssueError> {
        self.submit(request, true).await
    }

    /// Issue and wait for the outcome.
    pub async fn call(&self, request: Request) -> Result<Outcome, IssueError> {
        Ok(self.issue(request).await?.outcome().await)
    }

    async fn submit(&self, request: Request, immediate: bool) -> Result<TransactionHandle, IssueError> {
        let tx = self.tx.as_ref().ok_or(IssueError::Disconnected)?;
        let (reply, rx) = oneshot::channel();
        tx.send(Command::Issue {
            request,
            immediate,
            reply,
        })
        .await
        .map_err(|_| IssueError::Disconnected)?;
        rx.await.map_err(|_| IssueError::Disconnected)?
    }
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle").field("id", &self.id).finish()
    }
}
