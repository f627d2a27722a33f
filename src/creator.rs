//! The stream-id allocator and send-ordering queue (spec.md §4.3): HEADERS
//! must hit the wire in strictly increasing stream-id order even when
//! submitted from concurrent threads, because HPACK's dynamic table is
//! order-dependent.
//!
//! Reservation (id + FIFO slot) happens under one short lock; the possibly
//! slow work of building the stream and the entry happens outside it; only
//! one thread ever drains the queue at a time (`flushing`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::entries::{Entry, EntryContext};
use crate::flusher::Flusher;
use crate::frame::StreamId;
use crate::stream_id::StreamIds;

pub struct Slot {
    entry: Mutex<Option<Box<dyn Entry>>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            entry: Mutex::new(None),
        }
    }
}

struct CreatorState {
    queue: VecDeque<Arc<Slot>>,
}

pub struct StreamCreator {
    state: Mutex<CreatorState>,
    flushing: AtomicBool,
    flusher: Arc<dyn Flusher>,
}

impl StreamCreator {
    pub fn new(flusher: Arc<dyn Flusher>) -> Self {
        Self {
            state: Mutex::new(CreatorState {
                queue: VecDeque::new(),
            }),
            flushing: AtomicBool::new(false),
            flusher,
        }
    }

    /// Reserves the next stream-id (from the shared `StreamIds` counter the
    /// stream table also uses) and an ordered slot in the queue, under one
    /// critical section (spec.md §4.3 step 1) — allocation and queue
    /// position must be assigned together or a slower submitter could land
    /// its lower id behind a faster submitter's higher one.
    pub fn reserve_slot(&self, ids: &StreamIds) -> (StreamId, Arc<Slot>) {
        let slot = Arc::new(Slot::new());
        let id = {
            let mut state = self.state.lock().unwrap();
            let id = ids.next_local();
            state.queue.push_back(slot.clone());
            id
        };
        (id, slot)
    }

    /// Fills a reserved slot with the caller's prepared entry and triggers a
    /// drain (spec.md §4.3 step 3).
    pub fn submit(&self, slot: Arc<Slot>, entry: Box<dyn Entry>, ctx: &dyn EntryContext) {
        *slot.entry.lock().unwrap() = Some(entry);
        self.flush(ctx);
    }

    /// Aborts a reservation before the entry was ever assigned: removes the
    /// slot so it doesn't block the queue forever, and still drives the
    /// drain so trailing entries can progress (spec.md §4.3 "On failure").
    pub fn abort_slot(&self, slot: &Arc<Slot>, ctx: &dyn EntryContext) {
        {
            let mut state = self.state.lock().unwrap();
            state.queue.retain(|s| !Arc::ptr_eq(s, slot));
        }
        self.flush(ctx);
    }

    /// Single-flusher drain: whichever caller claims `flushing` pops ready
    /// slots off the head. A slot with no entry yet means a concurrent
    /// submitter hasn't finished — release and let that submitter's own
    /// `flush()` call resume the drain.
    pub fn flush(&self, ctx: &dyn EntryContext) {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            loop {
                let ready = {
                    let mut state = self.state.lock().unwrap();
                    match state.queue.front() {
                        Some(slot) if slot.entry.lock().unwrap().is_some() => {
                            state.queue.pop_front()
                        }
                        _ => None,
                    }
                };
                match ready {
                    Some(slot) => {
                        let entry = slot.entry.lock().unwrap().take().unwrap();
                        self.flusher.append(entry, ctx);
                    }
                    None => break,
                }
            }
            self.flushing.store(false, Ordering::Release);
            // A submitter may have filled the head slot and called flush()
            // in the narrow window between our last empty check and the
            // release above, and found `flushing` still held, so it
            // returned without draining. Re-check and re-claim if so.
            let head_ready = {
                let state = self.state.lock().unwrap();
                state
                    .queue
                    .front()
                    .map(|s| s.entry.lock().unwrap().is_some())
                    .unwrap_or(false)
            };
            if !head_ready || self.flushing.swap(true, Ordering::AcqRel) {
                break;
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{Endpoint, Generator};
    use crate::error::SessionApiError;
    use crate::flow_control::FlowControlStrategy;
    use crate::stream_id::Role;
    use crate::streams::StreamTable;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct NoopGenerator;
    impl Generator for NoopGenerator {
        fn control_headers(&self, _: u64, _: &crate::frame::Headers) -> usize {
            0
        }
        fn control_rst_stream(&self, _: u64, _: &crate::frame::RstStream) -> usize {
            0
        }
        fn control_settings(&self, _: u64, _: &crate::frame::Settings) -> usize {
            0
        }
        fn control_ping(&self, _: u64, _: &crate::frame::Ping) -> usize {
            0
        }
        fn control_goaway(&self, _: u64, _: &crate::frame::GoAway) -> usize {
            0
        }
        fn control_window_update(&self, _: u64, _: &crate::frame::WindowUpdate) -> usize {
            0
        }
        fn control_priority(&self, _: u64, _: &crate::frame::Priority) -> usize {
            0
        }
        fn control_push_promise(&self, _: u64, _: &crate::frame::PushPromise) -> usize {
            0
        }
        fn data(&self, _: u64, _: StreamId, _: &bytes::Bytes) -> usize {
            0
        }
        fn set_header_table_size(&self, _: u32) {}
        fn set_max_frame_size(&self, _: u32) {}
        fn set_max_header_list_size(&self, _: u32) {}
    }

    #[derive(Debug)]
    struct NoopEndpoint;
    impl Endpoint for NoopEndpoint {
        fn shutdown_output(&self) {}
        fn close(&self) {}
        fn is_open(&self) -> bool {
            true
        }
        fn idle_timeout(&self) -> std::time::Duration {
            std::time::Duration::from_secs(60)
        }
    }

    #[derive(Debug, Default)]
    struct NoopFlowControl;
    impl FlowControlStrategy for NoopFlowControl {
        fn on_stream_created(&self, _: &Arc<crate::stream::Stream>) {}
        fn on_stream_destroyed(&self, _: &Arc<crate::stream::Stream>) {}
        fn on_data_consumed(
            &self,
            _: &crate::window::Window,
            _: Option<&Arc<crate::stream::Stream>>,
            _: i64,
        ) -> crate::flow_control::FlowCredit {
            crate::flow_control::FlowCredit::default()
        }
        fn on_data_sending(&self, _: &Arc<crate::stream::Stream>, _: i64) {}
        fn on_data_sent(&self, _: &Arc<crate::stream::Stream>, _: i64) {}
        fn update_initial_stream_window(&self, _: &[Arc<crate::stream::Stream>], _: i64, _: bool) {}
        fn window_update(&self, _: Option<&Arc<crate::stream::Stream>>, _: &crate::frame::WindowUpdate) {}
    }

    struct FakeCtx {
        flow_control: Arc<dyn FlowControlStrategy>,
        generator: Arc<dyn Generator>,
        endpoint: Arc<dyn Endpoint>,
        streams: StreamTable,
        session_window: crate::window::Window,
        lease: AtomicU64,
    }

    impl EntryContext for FakeCtx {
        fn flow_control(&self) -> &Arc<dyn FlowControlStrategy> {
            &self.flow_control
        }
        fn generator(&self) -> &Arc<dyn Generator> {
            &self.generator
        }
        fn endpoint(&self) -> &Arc<dyn Endpoint> {
            &self.endpoint
        }
        fn streams(&self) -> &StreamTable {
            &self.streams
        }
        fn record_bytes_written(&self, _: u64) {}
        fn on_stream_opened(&self, _: &Arc<crate::stream::Stream>) {}
        fn remove_stream(&self, id: StreamId) {
            self.streams.remove(id);
        }
        fn mark_initial_window_is_local(&self, _: i64) {}
        fn disconnect(&self) {}
        fn next_lease(&self) -> u64 {
            self.lease.fetch_add(1, Ordering::Relaxed)
        }
        fn session_send_window(&self) -> &crate::window::Window {
            &self.session_window
        }
    }

    fn fake_ctx() -> FakeCtx {
        FakeCtx {
            flow_control: Arc::new(NoopFlowControl),
            generator: Arc::new(NoopGenerator),
            endpoint: Arc::new(NoopEndpoint),
            streams: StreamTable::new(Role::Client, -1, -1, 65_535),
            session_window: crate::window::Window::new(65_535),
            lease: AtomicU64::new(0),
        }
    }

    #[derive(Default)]
    struct RecordingFlusher {
        order: StdMutex<Vec<StreamId>>,
    }

    impl Flusher for RecordingFlusher {
        fn append(&self, mut entry: Box<dyn Entry>, ctx: &dyn EntryContext) {
            self.order.lock().unwrap().push(entry.stream_id().unwrap());
            entry.generate(ctx);
            entry.succeeded(ctx);
        }
        fn prepend(&self, entry: Box<dyn Entry>, ctx: &dyn EntryContext) {
            self.append(entry, ctx);
        }
        fn terminate(&self, _cause: SessionApiError) {}
    }

    fn control_entry(id: StreamId) -> Box<dyn Entry> {
        use crate::entries::{ControlEntry, ControlFrame};
        use crate::stream::Stream;
        let stream = Arc::new(Stream::new(id, true, 65_535, 65_535));
        Box::new(ControlEntry::without_completion(
            ControlFrame::Headers(crate::frame::Headers {
                stream_id: id,
                end_stream: false,
                header_block: bytes::Bytes::new(),
                promised_stream_id: None,
            }),
            Some(stream),
        ))
    }

    #[test]
    fn ids_allocated_in_increasing_order() {
        let ids = StreamIds::new(Role::Client);
        let creator = StreamCreator::new(Arc::new(RecordingFlusher::default()));
        let (id1, _) = creator.reserve_slot(&ids);
        let (id2, _) = creator.reserve_slot(&ids);
        let (id3, _) = creator.reserve_slot(&ids);
        assert_eq!((id1, id2, id3), (1, 3, 5));
    }

    #[test]
    fn out_of_order_submission_still_flushes_in_id_order() {
        let ids = StreamIds::new(Role::Client);
        let flusher = Arc::new(RecordingFlusher::default());
        let creator = StreamCreator::new(flusher.clone());
        let ctx = fake_ctx();

        let (id1, slot1) = creator.reserve_slot(&ids);
        let (id2, slot2) = creator.reserve_slot(&ids);
        let (id3, slot3) = creator.reserve_slot(&ids);

        // Submit out of order: id3 first, then id1, then id2. The queue
        // must still drain 1, 2, 3 because slot1's entry isn't filled yet.
        creator.submit(slot3, control_entry(id3), &ctx);
        assert_eq!(creator.queue_len(), 3); // nothing could drain: head (slot1) empty

        creator.submit(slot1, control_entry(id1), &ctx);
        // This drains id1, then finds slot2 empty and stops.
        assert_eq!(creator.queue_len(), 2);

        creator.submit(slot2, control_entry(id2), &ctx);
        assert_eq!(creator.queue_len(), 0);

        assert_eq!(*flusher.order.lock().unwrap(), vec![id1, id2, id3]);
    }

    #[test]
    fn aborted_slot_does_not_block_the_queue() {
        let ids = StreamIds::new(Role::Client);
        let flusher = Arc::new(RecordingFlusher::default());
        let creator = StreamCreator::new(flusher.clone());
        let ctx = fake_ctx();

        let (_id1, slot1) = creator.reserve_slot(&ids);
        let (id2, slot2) = creator.reserve_slot(&ids);

        creator.abort_slot(&slot1, &ctx);
        creator.submit(slot2, control_entry(id2), &ctx);

        assert_eq!(*flusher.order.lock().unwrap(), vec![id2]);
    }
}
