//! The four-valued session close register (spec.md §4.1), a single atomic
//! with linearizable compare-and-set transitions.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseState {
    NotClosed = 0,
    LocallyClosed = 1,
    RemotelyClosed = 2,
    Closed = 3,
}

impl CloseState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CloseState::NotClosed,
            1 => CloseState::LocallyClosed,
            2 => CloseState::RemotelyClosed,
            _ => CloseState::Closed,
        }
    }
}

/// Atomic register driving the close machine. CLOSED is absorbing; every
/// other transition is a single CAS so concurrent triggers (app close, peer
/// GO_AWAY, transport FIN, idle timeout, fatal error) race safely.
#[derive(Debug, Default)]
pub struct CloseRegister {
    state: AtomicU8,
}

impl CloseRegister {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(CloseState::NotClosed as u8),
        }
    }

    pub fn get(&self) -> CloseState {
        CloseState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.get() == CloseState::Closed
    }

    /// Attempts `from -> to`. Returns true iff this call performed the
    /// transition.
    pub fn cas(&self, from: CloseState, to: CloseState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Application-initiated close: NOT_CLOSED -> LOCALLY_CLOSED only.
    /// Returns true iff this call is the one that initiated the close.
    pub fn try_close_locally(&self) -> bool {
        self.cas(CloseState::NotClosed, CloseState::LocallyClosed)
    }

    /// Peer GO_AWAY received: NOT_CLOSED -> REMOTELY_CLOSED only.
    pub fn try_close_remotely(&self) -> bool {
        self.cas(CloseState::NotClosed, CloseState::RemotelyClosed)
    }

    /// Fatal error / abort: any non-CLOSED -> CLOSED. Idempotent — returns
    /// true only for the call that actually performs the transition.
    pub fn force_closed(&self) -> bool {
        loop {
            let current = self.get();
            if current == CloseState::Closed {
                return false;
            }
            if self.cas(current, CloseState::Closed) {
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_one_shot() {
        let reg = CloseRegister::new();
        assert!(reg.try_close_locally());
        assert!(!reg.try_close_locally());
        assert_eq!(reg.get(), CloseState::LocallyClosed);
    }

    #[test]
    fn remote_close_is_one_shot() {
        let reg = CloseRegister::new();
        assert!(reg.try_close_remotely());
        assert!(!reg.try_close_remotely());
        assert!(!reg.try_close_locally());
    }

    #[test]
    fn force_closed_absorbing() {
        let reg = CloseRegister::new();
        assert!(reg.try_close_locally());
        assert!(reg.force_closed());
        assert!(!reg.force_closed());
        assert_eq!(reg.get(), CloseState::Closed);
    }

    #[test]
    fn force_closed_from_not_closed() {
        let reg = CloseRegister::new();
        assert!(reg.force_closed());
        assert_eq!(reg.get(), CloseState::Closed);
    }
}
