//! Egress entries (spec.md §4.5): the things the stream-id allocator queues
//! and the flusher drains. `ControlEntry` carries every non-DATA frame;
//! `DataEntry` is fragmentable by flow control.
//!
//! Entries never close over the session (DESIGN NOTES "inner classes
//! capturing outer state → explicit back-reference"): every method takes an
//! `&dyn EntryContext` capability instead.

use std::sync::Arc;

use bytes::{Buf, Bytes};

use crate::collaborators::{Endpoint, Generator, Lease};
use crate::completion::Completion;
use crate::error::{ErrorCode, SessionApiError};
use crate::flow_control::FlowControlStrategy;
use crate::frame::{
    GoAway, Headers, Ping, Priority, PushPromise, RstStream, Settings, SettingKey, StreamId,
    WindowUpdate,
};
use crate::stream::{CloseEvent, Stream};
use crate::streams::StreamTable;

/// Capability interface entries use to reach session state, in place of
/// capturing the session by closure.
pub trait EntryContext: Send + Sync {
    fn flow_control(&self) -> &Arc<dyn FlowControlStrategy>;
    fn generator(&self) -> &Arc<dyn Generator>;
    fn endpoint(&self) -> &Arc<dyn Endpoint>;
    fn streams(&self) -> &StreamTable;
    fn record_bytes_written(&self, n: u64);
    fn on_stream_opened(&self, stream: &Arc<Stream>);
    fn remove_stream(&self, stream_id: StreamId);
    fn mark_initial_window_is_local(&self, new_value: i64);
    fn disconnect(&self);
    fn next_lease(&self) -> Lease;
    fn session_send_window(&self) -> &crate::window::Window;
}

pub enum GenerateOutcome {
    Frame(usize),
    DataFrame { bytes: usize, final_frame: bool },
    WindowExhausted,
}

pub trait Entry: Send {
    fn stream_id(&self) -> Option<StreamId>;
    /// `true` for `DataEntry`: the only entry kind whose `generate()` can be
    /// called repeatedly (fragmented by flow control) rather than once.
    fn is_data(&self) -> bool {
        false
    }
    fn generate(&mut self, ctx: &dyn EntryContext) -> GenerateOutcome;
    fn before_send(&mut self, ctx: &dyn EntryContext);
    fn succeeded(self: Box<Self>, ctx: &dyn EntryContext);
    fn failed(self: Box<Self>, ctx: &dyn EntryContext, cause: SessionApiError);
    /// Fails the entry's completion without touching session state — used
    /// only when the session itself is tearing down (spec.md §4.6
    /// `terminate`).
    fn failed_with(self: Box<Self>, cause: SessionApiError);
}

#[derive(Debug)]
pub enum ControlFrame {
    Headers(Headers),
    RstStream(RstStream),
    Settings(Settings),
    Ping(Ping),
    GoAway(GoAway),
    WindowUpdate(WindowUpdate),
    Priority(Priority),
    PushPromise(PushPromise),
    /// Synthetic frame: not on the wire, tears the endpoint down once
    /// flushed (spec.md §4.1 "enqueue DISCONNECT").
    Disconnect,
}

pub struct ControlEntry {
    pub frame: ControlFrame,
    pub stream: Option<Arc<Stream>>,
    pub completion: Option<Completion>,
    frame_bytes: usize,
}

impl ControlEntry {
    pub fn new(frame: ControlFrame, stream: Option<Arc<Stream>>, completion: Completion) -> Self {
        Self {
            frame,
            stream,
            completion: Some(completion),
            frame_bytes: 0,
        }
    }

    pub fn without_completion(frame: ControlFrame, stream: Option<Arc<Stream>>) -> Self {
        Self {
            frame,
            stream,
            completion: None,
            frame_bytes: 0,
        }
    }
}

impl Entry for ControlEntry {
    fn stream_id(&self) -> Option<StreamId> {
        self.stream.as_ref().map(|s| s.stream_id)
    }

    fn generate(&mut self, ctx: &dyn EntryContext) -> GenerateOutcome {
        let lease = ctx.next_lease();
        let bytes = match &self.frame {
            ControlFrame::Headers(f) => ctx.generator().control_headers(lease, f),
            ControlFrame::RstStream(f) => ctx.generator().control_rst_stream(lease, f),
            ControlFrame::Settings(f) => ctx.generator().control_settings(lease, f),
            ControlFrame::Ping(f) => ctx.generator().control_ping(lease, f),
            ControlFrame::GoAway(f) => ctx.generator().control_goaway(lease, f),
            ControlFrame::WindowUpdate(f) => ctx.generator().control_window_update(lease, f),
            ControlFrame::Priority(f) => ctx.generator().control_priority(lease, f),
            ControlFrame::PushPromise(f) => ctx.generator().control_push_promise(lease, f),
            ControlFrame::Disconnect => 0,
        };
        self.frame_bytes = bytes;
        GenerateOutcome::Frame(bytes)
    }

    fn before_send(&mut self, ctx: &dyn EntryContext) {
        match &self.frame {
            ControlFrame::Headers(h) => {
                if let Some(stream) = &self.stream {
                    stream.close.apply(CloseEvent::BeforeSend {
                        end_stream: h.end_stream,
                    });
                }
            }
            ControlFrame::Settings(s) => {
                if let Some(initial_window) = s
                    .values
                    .iter()
                    .find(|v| v.key == SettingKey::InitialWindowSize)
                {
                    ctx.mark_initial_window_is_local(initial_window.value as i64);
                }
            }
            _ => {}
        }
    }

    fn succeeded(self: Box<Self>, ctx: &dyn EntryContext) {
        ctx.record_bytes_written(self.frame_bytes as u64);
        match &self.frame {
            ControlFrame::Headers(h) => {
                if let Some(stream) = &self.stream {
                    ctx.on_stream_opened(stream);
                    let closed = stream.close.apply(CloseEvent::AfterSend {
                        end_stream: h.end_stream,
                    });
                    if closed {
                        ctx.remove_stream(stream.stream_id);
                    }
                }
            }
            ControlFrame::RstStream(r) => {
                if let Some(stream) = &self.stream {
                    stream.close.apply(CloseEvent::ResetSent(r.error_code));
                    ctx.remove_stream(stream.stream_id);
                } else {
                    ctx.remove_stream(r.stream_id);
                }
            }
            ControlFrame::PushPromise(p) => {
                if let Some(stream) = &self.stream {
                    // The pushed stream is implicitly half-closed-remote the
                    // moment the promise goes out (spec.md §4.5).
                    stream
                        .close
                        .apply(CloseEvent::Received { end_stream: false });
                }
                let _ = p;
            }
            ControlFrame::GoAway(_) => {
                ctx.endpoint().shutdown_output();
            }
            ControlFrame::WindowUpdate(w) => {
                ctx.flow_control().window_update(self.stream.as_ref(), w);
            }
            ControlFrame::Disconnect => {
                ctx.disconnect();
            }
            _ => {}
        }
        if let Some(completion) = self.completion {
            completion.succeeded();
        }
    }

    fn failed(self: Box<Self>, _ctx: &dyn EntryContext, cause: SessionApiError) {
        if let Some(completion) = self.completion {
            completion.failed(cause);
        }
    }

    fn failed_with(self: Box<Self>, cause: SessionApiError) {
        if let Some(completion) = self.completion {
            completion.failed(cause);
        }
    }
}

/// DATA is fragmentable: `dataRemaining` tracks bytes not yet handed to the
/// generator, `frameRemaining` tracks bytes of the most recently generated
/// sub-frame not yet flushed to the socket.
pub struct DataEntry {
    pub stream: Arc<Stream>,
    payload: Bytes,
    data_remaining: usize,
    frame_remaining: usize,
    /// Bytes actually handed to the generator across every `generate()` call
    /// for this entry, since `succeeded()` only runs once (on the final
    /// sub-frame) but needs the whole entry's size, not just the last chunk.
    total_sent: usize,
    end_stream: bool,
    completion: Option<Completion>,
}

impl DataEntry {
    pub fn new(stream: Arc<Stream>, payload: Bytes, end_stream: bool, completion: Completion) -> Self {
        let len = payload.len();
        Self {
            stream,
            payload,
            data_remaining: len,
            frame_remaining: 0,
            total_sent: 0,
            end_stream,
            completion: Some(completion),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.data_remaining == 0 && self.frame_remaining == 0
    }
}

impl Entry for DataEntry {
    fn stream_id(&self) -> Option<StreamId> {
        Some(self.stream.stream_id)
    }

    fn is_data(&self) -> bool {
        true
    }

    fn generate(&mut self, ctx: &dyn EntryContext) -> GenerateOutcome {
        if self.data_remaining == 0 {
            return GenerateOutcome::DataFrame {
                bytes: 0,
                final_frame: true,
            };
        }
        let stream_window = self.stream.send_window.get().max(0) as usize;
        let session_window = ctx.session_send_window().get().max(0) as usize;
        let window = stream_window.min(session_window).min(self.data_remaining);
        if window == 0 {
            return GenerateOutcome::WindowExhausted;
        }
        if !ctx.session_send_window().try_debit(window as i64) {
            // A concurrent `Flusher` (legitimate per spec.md §6) raced the
            // session window down between the read above and this debit;
            // retry once the window opens back up instead of writing a
            // frame we no longer have credit for.
            return GenerateOutcome::WindowExhausted;
        }
        let chunk = self.payload.slice(..window);
        let lease = ctx.next_lease();
        let bytes = ctx.generator().data(lease, self.stream.stream_id, &chunk);
        self.payload.advance(bytes);
        ctx.flow_control().on_data_sending(&self.stream, bytes as i64);
        if bytes < window {
            // Generator wrote less than the reserved window; return the
            // unused credit.
            let _ = ctx.session_send_window().try_add((window - bytes) as i64);
        }
        self.data_remaining -= bytes;
        self.frame_remaining = bytes;
        self.total_sent += bytes;
        let final_frame = self.data_remaining == 0;
        if final_frame && self.end_stream {
            self.stream
                .close
                .apply(CloseEvent::BeforeSend { end_stream: true });
        }
        GenerateOutcome::DataFrame {
            bytes,
            final_frame,
        }
    }

    fn before_send(&mut self, _ctx: &dyn EntryContext) {}

    fn succeeded(self: Box<Self>, ctx: &dyn EntryContext) {
        ctx.record_bytes_written(self.total_sent as u64);
        let final_frame = self.data_remaining == 0;
        if final_frame {
            ctx.flow_control()
                .on_data_sent(&self.stream, self.total_sent as i64);
            let closed = self
                .stream
                .close
                .apply(CloseEvent::AfterSend { end_stream: self.end_stream });
            if closed {
                ctx.remove_stream(self.stream.stream_id);
            }
            if let Some(completion) = self.completion {
                completion.succeeded();
            }
        }
        // Intermediate emissions fire no user callback (spec.md §4.5).
    }

    fn failed(self: Box<Self>, _ctx: &dyn EntryContext, cause: SessionApiError) {
        if let Some(completion) = self.completion {
            completion.failed(cause);
        }
    }

    fn failed_with(self: Box<Self>, cause: SessionApiError) {
        if let Some(completion) = self.completion {
            completion.failed(cause);
        }
    }
}

pub fn rst_stream_entry(stream: Arc<Stream>, error_code: ErrorCode) -> ControlEntry {
    let stream_id = stream.stream_id;
    ControlEntry::without_completion(
        ControlFrame::RstStream(RstStream {
            stream_id,
            error_code,
        }),
        Some(stream),
    )
}
