//! The concurrent stream table (spec.md §4.2) plus the admission-counting
//! machinery that guards `maxLocalStreams`/`maxRemoteStreams`.
//!
//! `(remoteStreamCount, remoteClosingCount)` is packed into one `AtomicU64`
//! (DESIGN NOTES "Packed atomic pair") so the admission check and the
//! increment are a single CAS; splitting them into two atomics would let a
//! concurrent close slip in between the check and the increment.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::UNBOUNDED;
use crate::frame::StreamId;
use crate::stream::Stream;
use crate::stream_id::{Role, StreamIds};

fn pack(count: u32, closing: u32) -> u64 {
    ((count as u64) << 32) | closing as u64
}

fn unpack(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}

#[derive(Debug)]
pub enum CreateLocalError {
    DuplicateStream,
    LimitExceeded,
}

pub enum CreateRemoteOutcome {
    Created(Arc<Stream>),
    Refused { last_remote_stream_id: StreamId },
    Duplicate,
}

#[derive(Debug)]
pub struct StreamTable {
    table: DashMap<StreamId, Arc<Stream>>,
    ids: StreamIds,
    local_count: AtomicI64,
    /// packed (remote_count, remote_closing)
    remote_pair: AtomicU64,
    local_closing: AtomicI64,
    max_local_streams: AtomicI64,
    max_remote_streams: AtomicI64,
    initial_local_window: AtomicI64,
    initial_remote_window: AtomicI64,
}

impl StreamTable {
    pub fn new(
        role: Role,
        max_local_streams: i64,
        max_remote_streams: i64,
        initial_window: i64,
    ) -> Self {
        Self {
            table: DashMap::new(),
            ids: StreamIds::new(role),
            local_count: AtomicI64::new(0),
            remote_pair: AtomicU64::new(0),
            local_closing: AtomicI64::new(0),
            max_local_streams: AtomicI64::new(max_local_streams),
            max_remote_streams: AtomicI64::new(max_remote_streams),
            initial_local_window: AtomicI64::new(initial_window),
            initial_remote_window: AtomicI64::new(initial_window),
        }
    }

    pub fn ids(&self) -> &StreamIds {
        &self.ids
    }

    pub fn set_max_local_streams(&self, max: i64) {
        self.max_local_streams.store(max, Ordering::Release);
    }

    pub fn set_initial_remote_window(&self, size: i64) {
        self.initial_remote_window.store(size, Ordering::Release);
    }

    pub fn initial_remote_window(&self) -> i64 {
        self.initial_remote_window.load(Ordering::Acquire)
    }

    pub fn set_initial_local_window(&self, size: i64) {
        self.initial_local_window.store(size, Ordering::Release);
    }

    pub fn initial_local_window(&self) -> i64 {
        self.initial_local_window.load(Ordering::Acquire)
    }

    pub fn get(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.table.get(&id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Stream>> {
        self.table.iter().map(|e| e.value().clone()).collect()
    }

    pub fn clear(&self) {
        self.table.clear();
    }

    /// spec.md §4.2 `createLocalStream(id)`: CAS-increment `localStreamCount`
    /// under the max, insert, and on table collision decrement and fail.
    pub fn create_local(&self, id: StreamId) -> Result<Arc<Stream>, CreateLocalError> {
        loop {
            let current = self.local_count.load(Ordering::Acquire);
            let max = self.max_local_streams.load(Ordering::Acquire);
            if max != UNBOUNDED && current - self.local_closing.load(Ordering::Acquire) >= max {
                return Err(CreateLocalError::LimitExceeded);
            }
            if self
                .local_count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let stream = Arc::new(Stream::new(
            id,
            true,
            self.initial_remote_window.load(Ordering::Acquire),
            self.initial_local_window.load(Ordering::Acquire),
        ));
        match self.table.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                self.local_count.fetch_sub(1, Ordering::AcqRel);
                Err(CreateLocalError::DuplicateStream)
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(stream.clone());
                stream.touch_idle();
                Ok(stream)
            }
        }
    }

    /// spec.md §4.2 `createRemoteStream(id)`: single CAS on the packed pair
    /// admits or refuses; table insertion duplicate is a connection error
    /// (returned to caller to fail the connection, not just this call).
    pub fn create_remote(&self, id: StreamId) -> CreateRemoteOutcome {
        self.ids.observe_remote(id);

        loop {
            let packed = self.remote_pair.load(Ordering::Acquire);
            let (count, closing) = unpack(packed);
            let max = self.max_remote_streams.load(Ordering::Acquire);
            if max != UNBOUNDED && (count as i64 - closing as i64) >= max {
                return CreateRemoteOutcome::Refused {
                    last_remote_stream_id: self.ids.last_remote(),
                };
            }
            let next = pack(count + 1, closing);
            if self
                .remote_pair
                .compare_exchange(packed, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let stream = Arc::new(Stream::new(
            id,
            false,
            self.initial_remote_window.load(Ordering::Acquire),
            self.initial_local_window.load(Ordering::Acquire),
        ));
        match self.table.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => CreateRemoteOutcome::Duplicate,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(stream.clone());
                stream.touch_idle();
                CreateRemoteOutcome::Created(stream)
            }
        }
    }

    /// The only mutator of the closing counters (spec.md §4.2
    /// `updateStreamCount`), invoked by a stream's close sub-machine when it
    /// transitions towards removal.
    pub fn update_stream_count(&self, local: bool, delta_count: i64, delta_closing: i64) {
        if local {
            if delta_count != 0 {
                self.local_count.fetch_add(delta_count, Ordering::AcqRel);
            }
            if delta_closing != 0 {
                self.local_closing.fetch_add(delta_closing, Ordering::AcqRel);
            }
        } else if delta_closing != 0 {
            loop {
                let packed = self.remote_pair.load(Ordering::Acquire);
                let (count, closing) = unpack(packed);
                let new_closing = (closing as i64 + delta_closing).max(0) as u32;
                let next = pack(count, new_closing);
                if self
                    .remote_pair
                    .compare_exchange(packed, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }

    /// Removes a stream, satisfying the "no reuse" invariant: once this
    /// returns, `get(id)` returns `None`.
    pub fn remove(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.table.remove(&id).map(|(_, v)| v)
    }

    /// `true` if `id` has been issued on its side but is no longer present
    /// — "closed" per DESIGN NOTES, as opposed to "unknown".
    pub fn is_closed_id(&self, id: StreamId) -> bool {
        self.ids.is_within_issued_range(id) && !self.table.contains_key(&id)
    }

    pub fn is_unknown_id(&self, id: StreamId) -> bool {
        !self.ids.is_within_issued_range(id) && !self.table.contains_key(&id)
    }
}
