//! Stream-id bookkeeping: parity, monotonic allocation, and the
//! closed-vs-unknown distinction from spec.md DESIGN NOTES.
//!
//! Locally initiated ids are handed out here; `lastRemoteStreamId` is just
//! tracked here (it's driven by whatever remote id the frame dispatcher last
//! observed, via `StreamIds::observe_remote`).

use std::sync::atomic::{AtomicU32, Ordering};

use crate::frame::StreamId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// The parity seed: client streams are odd (seed 1), server streams are
    /// even (seed 2).
    fn seed(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Owns `localStreamIds` and `lastRemoteStreamId` from the data model.
#[derive(Debug)]
pub struct StreamIds {
    role: Role,
    /// Last locally-allocated stream id (0 before the first local stream).
    local: AtomicU32,
    /// Highest remote stream id observed so far (monotonic via max).
    last_remote: AtomicU32,
}

impl StreamIds {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            local: AtomicU32::new(0),
            last_remote: AtomicU32::new(0),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Reserves and returns the next local stream id (fetch-and-add by 2).
    /// The very first call returns the role's parity seed.
    pub fn next_local(&self) -> StreamId {
        let seed = self.role.seed();
        loop {
            let current = self.local.load(Ordering::Acquire);
            let next = if current == 0 { seed } else { current + 2 };
            if self
                .local
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return next;
            }
        }
    }

    pub fn last_local(&self) -> StreamId {
        self.local.load(Ordering::Acquire)
    }

    /// Records an inbound remote id, keeping `lastRemoteStreamId` monotonic
    /// via a max update.
    pub fn observe_remote(&self, id: StreamId) {
        self.last_remote.fetch_max(id, Ordering::AcqRel);
    }

    pub fn last_remote(&self) -> StreamId {
        self.last_remote.load(Ordering::Acquire)
    }

    /// `(id & 1) == (localStreamIds seed & 1)` — the parity invariant from
    /// spec.md DATA MODEL.
    pub fn is_local(&self, id: StreamId) -> bool {
        (id & 1) == (self.role.seed() & 1)
    }

    /// An id is *closed* (as opposed to *unknown*) if it is less than or
    /// equal to the highest id ever issued on its side but is no longer (or
    /// never was, for a skipped id) present in the stream table. This
    /// function only answers the "issued" half; absence from the table is
    /// checked by the caller against the stream table.
    pub fn is_within_issued_range(&self, id: StreamId) -> bool {
        if self.is_local(id) {
            id <= self.last_local()
        } else {
            id <= self.last_remote()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_odd_and_monotonic() {
        let ids = StreamIds::new(Role::Client);
        assert_eq!(ids.next_local(), 1);
        assert_eq!(ids.next_local(), 3);
        assert_eq!(ids.next_local(), 5);
    }

    #[test]
    fn server_ids_are_even_and_monotonic() {
        let ids = StreamIds::new(Role::Server);
        assert_eq!(ids.next_local(), 2);
        assert_eq!(ids.next_local(), 4);
    }

    #[test]
    fn parity_invariant_holds() {
        let ids = StreamIds::new(Role::Client);
        assert!(ids.is_local(1));
        assert!(ids.is_local(3));
        assert!(!ids.is_local(2));
        assert!(!ids.is_local(4));
    }

    #[test]
    fn last_remote_is_monotonic_via_max() {
        let ids = StreamIds::new(Role::Server);
        ids.observe_remote(5);
        ids.observe_remote(3);
        assert_eq!(ids.last_remote(), 5);
        ids.observe_remote(9);
        assert_eq!(ids.last_remote(), 9);
    }

    #[test]
    fn issued_range_tracks_each_side_independently() {
        let ids = StreamIds::new(Role::Client);
        ids.next_local(); // 1
        ids.observe_remote(4);
        assert!(ids.is_within_issued_range(1));
        assert!(!ids.is_within_issued_range(3)); // never issued locally
        assert!(ids.is_within_issued_range(4));
        assert!(!ids.is_within_issued_range(6));
    }
}
