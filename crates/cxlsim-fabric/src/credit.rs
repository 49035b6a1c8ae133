//! Credit manager — per-protocol buffer credits for both directions of one
//! link end.
//!
//! `Outbound` ledgers count the peer's receive buffers we may still fill.
//! `Inbound` ledgers count our own free receive buffers; a request arriving
//! takes one and draining it gives it back (and owes the peer a return).
//!
//! Ledgers never go negative and never exceed the advertised capacity.
//! Over-returns clamp silently.

use std::fmt;

use cxlsim_core::ProtocolKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Direction::Outbound => 0,
            Direction::Inbound => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("tx"),
            Direction::Inbound => f.write_str("rx"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreditError {
    #[error("credit {direction}/{kind} advertised after the link became active")]
    InvalidState {
        direction: Direction,
        kind: ProtocolKind,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreditLedger {
    pub capacity: u16,
    pub held: u16,
}

#[derive(Debug, Clone, Default)]
pub struct CreditManager {
    ledgers: [[CreditLedger; 3]; 2],
    active: bool,
}

impl CreditManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity of one ledger and fill it. Setup only.
    pub fn advertise(
        &mut self,
        direction: Direction,
        kind: ProtocolKind,
        capacity: u16,
    ) -> Result<(), CreditError> {
        if self.active {
            return Err(CreditError::InvalidState { direction, kind });
        }
        self.ledgers[direction.index()][kind.index()] = CreditLedger {
            capacity,
            held: capacity,
        };
        Ok(())
    }

    /// Freeze capacities. Reservations are only meaningful after this.
    pub fn activate(&mut self) {
        self.active = true;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Take one credit if any are held.
    pub fn try_reserve(&mut self, direction: Direction, kind: ProtocolKind) -> bool {
        let ledger = &mut self.ledgers[direction.index()][kind.index()];
        if ledger.held == 0 {
            return false;
        }
        ledger.held -= 1;
        true
    }

    /// Give back `amount` credits, clamped at capacity. Returns how many were
    /// absorbed by the clamp.
    pub fn on_credit_return(&mut self, direction: Direction, kind: ProtocolKind, amount: u16) -> u16 {
        let ledger = &mut self.ledgers[direction.index()][kind.index()];
        let room = ledger.capacity - ledger.held;
        let accepted = amount.min(room);
        ledger.held += accepted;
        amount - accepted
    }

    pub fn ledger(&self, direction: Direction, kind: ProtocolKind) -> CreditLedger {
        self.ledgers[direction.index()][kind.index()]
    }

    pub fn held(&self, direction: Direction, kind: ProtocolKind) -> u16 {
        self.ledger(direction, kind).held
    }

    pub fn capacity(&self, direction: Direction, kind: ProtocolKind) -> u16 {
        self.ledger(direction, kind).capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(capacity: u16) -> CreditManager {
        let mut m = CreditManager::new();
        for kind in ProtocolKind::ALL {
            m.advertise(Direction::Outbound, kind, capacity).unwrap();
            m.advertise(Direction::Inbound, kind, capacity).unwrap();
        }
        m.activate();
        m
    }

    #[test]
    fn reserve_until_empty() {
        let mut m = manager(2);
        assert!(m.try_reserve(Direction::Outbound, ProtocolKind::Mem));
        assert!(m.try_reserve(Direction::Outbound, ProtocolKind::Mem));
        assert!(!m.try_reserve(Direction::Outbound, ProtocolKind::Mem));
        assert_eq!(m.held(Direction::Outbound, ProtocolKind::Mem), 0);
        // other kinds and directions are independent
        assert!(m.try_reserve(Direction::Outbound, ProtocolKind::Io));
        assert_eq!(m.held(Direction::Inbound, ProtocolKind::Mem), 2);
    }

    #[test]
    fn return_clamps_at_capacity() {
        let mut m = manager(3);
        assert!(m.try_reserve(Direction::Outbound, ProtocolKind::Cache));
        assert_eq!(m.on_credit_return(Direction::Outbound, ProtocolKind::Cache, 5), 4);
        assert_eq!(m.held(Direction::Outbound, ProtocolKind::Cache), 3);
    }

    #[test]
    fn duplicate_return_is_absorbed() {
        let mut m = manager(1);
        assert!(m.try_reserve(Direction::Outbound, ProtocolKind::Io));
        assert_eq!(m.on_credit_return(Direction::Outbound, ProtocolKind::Io, 1), 0);
        assert_eq!(m.on_credit_return(Direction::Outbound, ProtocolKind::Io, 1), 1);
        assert_eq!(m.held(Direction::Outbound, ProtocolKind::Io), 1);
    }

    #[test]
    fn advertise_after_activate_is_invalid() {
        let mut m = manager(4);
        assert_eq!(
            m.advertise(Direction::Inbound, ProtocolKind::Mem, 8),
            Err(CreditError::InvalidState {
                direction: Direction::Inbound,
                kind: ProtocolKind::Mem
            })
        );
        assert_eq!(m.capacity(Direction::Inbound, ProtocolKind::Mem), 4);
    }

    #[test]
    fn held_stays_within_bounds_under_mixed_traffic() {
        let mut m = manager(4);
        for step in 0u16..200 {
            let kind = ProtocolKind::ALL[(step % 3) as usize];
            if step % 5 < 3 {
                m.try_reserve(Direction::Outbound, kind);
            } else {
                m.on_credit_return(Direction::Outbound, kind, step % 4);
            }
            for kind in ProtocolKind::ALL {
                let ledger = m.ledger(Direction::Outbound, kind);
                assert!(ledger.held <= ledger.capacity);
            }
        }
    }
}
