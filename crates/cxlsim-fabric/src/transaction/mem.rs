//! mem state machine: host-managed device memory.
//!
//! Reads answer with `MemData`, writes and invalidations with `Cmp`.
//! `MemInv` is held back like a snoop while a read or write to its line
//! is open.

use cxlsim_core::packet::MemOpcode;
use cxlsim_core::{Opcode, Packet};

use super::{
    complete_unordered, sendable_line_ordered, ResponseDisposition, TransactionTable, TxnId,
};

#[derive(Debug)]
pub struct MemMachine {
    pub(super) table: TransactionTable,
}

fn expects(request: Opcode, response: Opcode) -> bool {
    matches!(
        (request, response),
        (
            Opcode::Mem(MemOpcode::MemRd | MemOpcode::MemSpecRd),
            Opcode::Mem(MemOpcode::MemData)
        ) | (
            Opcode::Mem(MemOpcode::MemWr | MemOpcode::MemInv),
            Opcode::Mem(MemOpcode::Cmp)
        )
    )
}

impl MemMachine {
    pub fn new(table: TransactionTable) -> Self {
        Self { table }
    }

    pub fn sendable(&self) -> Vec<TxnId> {
        sendable_line_ordered(&self.table)
    }

    pub fn on_response(&mut self, packet: &Packet) -> ResponseDisposition {
        complete_unordered(&mut self.table, packet, expects)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{Outcome, StateMachine, TxnState};
    use super::*;
    use cxlsim_core::ProtocolKind;
    use tokio::time::Instant;

    #[test]
    fn invalidate_waits_for_write_on_line() {
        let mut m = StateMachine::new(ProtocolKind::Mem, &settings(100));
        let now = Instant::now();
        let write = issue_sent(&mut m, MemOpcode::MemWr, 0x200, now);
        let inv = m
            .issue(MemOpcode::MemInv.into(), 0x23f, Default::default(), now)
            .unwrap();
        let read_elsewhere = m
            .issue(MemOpcode::MemRd.into(), 0x240, Default::default(), now)
            .unwrap();

        assert_eq!(m.sendable(), vec![read_elsewhere.id()]);
        assert_eq!(m.state(inv.id()), Some(TxnState::PendingSend));

        let cmp = response(&m, write.id(), MemOpcode::Cmp, b"");
        m.on_response(&cmp);
        assert_eq!(m.sendable(), vec![inv.id(), read_elsewhere.id()]);
    }

    #[test]
    fn reads_complete_with_data() {
        let mut m = StateMachine::new(ProtocolKind::Mem, &settings(100));
        let now = Instant::now();
        let mut a = issue_sent(&mut m, MemOpcode::MemRd, 0x0, now);
        let mut b = issue_sent(&mut m, MemOpcode::MemSpecRd, 0x40, now);
        let rb = response(&m, b.id(), MemOpcode::MemData, b"bbbb");
        let ra = response(&m, a.id(), MemOpcode::MemData, b"aaaa");
        m.on_response(&rb);
        m.on_response(&ra);
        assert!(matches!(a.try_outcome(), Some(Outcome::Completed(r)) if &r.data[..] == b"aaaa"));
        assert!(matches!(b.try_outcome(), Some(Outcome::Completed(r)) if &r.data[..] == b"bbbb"));
    }
}
