//! A single multiplexed stream. Lifecycle-coupled to its owning `Session`
//! (spec.md DATA MODEL "Stream"): the session creates, looks up and removes
//! streams; the stream itself only advances its own close sub-machine.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::ErrorCode;
use crate::frame::StreamId;
use crate::window::Window;

/// Which side closed (or reset) a half of the stream, used only for
/// diagnostics/listener notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Half {
    Open,
    Closed,
}

/// Internal representation of the close sub-machine. spec.md describes it
/// only via its three events (BEFORE_SEND, AFTER_SEND, RECEIVED); send- and
/// recv-closing are modeled as two independent halves (borrowed from the
/// `h2` crate's `proto::streams::state::State` shape) rather than one
/// open/closed boolean, since a stream can be half-closed in only one
/// direction.
#[derive(Debug, Clone, Copy)]
enum Inner {
    Idle,
    Open { send: Half, recv: Half },
    Reset { code: ErrorCode, by: Peer },
}

impl Inner {
    fn is_closed(self) -> bool {
        matches!(
            self,
            Inner::Open {
                send: Half::Closed,
                recv: Half::Closed,
            } | Inner::Reset { .. }
        )
    }
}

/// The three events spec.md §4.2/DATA MODEL names for the close
/// sub-machine.
#[derive(Debug, Clone, Copy)]
pub enum CloseEvent {
    /// About to hand a frame to the socket. `end_stream` is the frame's
    /// END_STREAM flag.
    BeforeSend { end_stream: bool },
    /// The frame from a prior `BeforeSend` was actually flushed.
    AfterSend { end_stream: bool },
    /// A frame was received from the peer. `end_stream` is its END_STREAM
    /// flag.
    Received { end_stream: bool },
    ResetSent(ErrorCode),
    ResetReceived(ErrorCode),
}

/// Tracks BEFORE_SEND/AFTER_SEND/RECEIVED transitions. `before_send` is
/// speculative — it lets `DataEntry::generate` mark a frame's intent to
/// close without yet committing, since the write may still fail before
/// `after_send` runs; `after_send`/`received` are what actually commit.
#[derive(Debug)]
pub struct CloseSubMachine {
    inner: Mutex<Inner>,
}

impl CloseSubMachine {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::Idle),
        }
    }

    /// Applies an event; returns `true` if the stream is now fully closed
    /// (both halves closed, or reset) and eligible for removal from the
    /// session's stream table.
    pub fn apply(&self, event: CloseEvent) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match event {
            CloseEvent::BeforeSend { .. } => false,
            CloseEvent::AfterSend { end_stream } => {
                if !end_stream {
                    return inner.is_closed();
                }
                *inner = match *inner {
                    Inner::Idle => Inner::Open {
                        send: Half::Closed,
                        recv: Half::Open,
                    },
                    Inner::Open { recv, .. } => Inner::Open {
                        send: Half::Closed,
                        recv,
                    },
                    reset @ Inner::Reset { .. } => reset,
                };
                inner.is_closed()
            }
            CloseEvent::Received { end_stream } => {
                if !end_stream {
                    return inner.is_closed();
                }
                *inner = match *inner {
                    Inner::Idle => Inner::Open {
                        send: Half::Open,
                        recv: Half::Closed,
                    },
                    Inner::Open { send, .. } => Inner::Open {
                        send,
                        recv: Half::Closed,
                    },
                    reset @ Inner::Reset { .. } => reset,
                };
                inner.is_closed()
            }
            CloseEvent::ResetSent(code) => {
                *inner = Inner::Reset {
                    code,
                    by: Peer::Local,
                };
                true
            }
            CloseEvent::ResetReceived(code) => {
                *inner = Inner::Reset {
                    code,
                    by: Peer::Remote,
                };
                true
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().is_closed()
    }

    pub fn reset_info(&self) -> Option<(ErrorCode, Peer)> {
        match *self.inner.lock().unwrap() {
            Inner::Reset { code, by } => Some((code, by)),
            _ => None,
        }
    }
}

/// Opaque per-stream payload the body-level plumbing attaches; the session
/// never inspects it (spec.md §1 "treated as a black-box `Stream`").
pub trait Attachment: Send + Sync + std::fmt::Debug {
    /// Delivered on every frame the session routes to this stream.
    fn process(&self, frame: &crate::frame::Data, end_stream: bool);
}

pub struct Stream {
    pub stream_id: StreamId,
    pub local: bool,
    pub send_window: Window,
    pub recv_window: Window,
    pub close: CloseSubMachine,
    idle_started: AtomicU64,
    bytes_sent: AtomicI64,
    bytes_received: AtomicI64,
    attachment: Mutex<Option<Box<dyn Attachment>>>,
    listener: Mutex<Option<Arc<dyn crate::listener::StreamListener>>>,
    epoch: Instant,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("stream_id", &self.stream_id)
            .field("local", &self.local)
            .field("send_window", &self.send_window)
            .field("recv_window", &self.recv_window)
            .field("close", &self.close)
            .field("idle_started", &self.idle_started)
            .field("bytes_sent", &self.bytes_sent)
            .field("bytes_received", &self.bytes_received)
            .field("attachment", &self.attachment)
            .field("listener", &self.listener.lock().ok().map(|_| "<listener>"))
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl Stream {
    pub fn new(stream_id: StreamId, local: bool, initial_send: i64, initial_recv: i64) -> Self {
        let epoch = Instant::now();
        Self {
            stream_id,
            local,
            send_window: Window::new(initial_send),
            recv_window: Window::new(initial_recv),
            close: CloseSubMachine::new(),
            idle_started: AtomicU64::new(0),
            bytes_sent: AtomicI64::new(0),
            bytes_received: AtomicI64::new(0),
            attachment: Mutex::new(None),
            listener: Mutex::new(None),
            epoch,
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn crate::listener::StreamListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    pub fn listener(&self) -> Option<Arc<dyn crate::listener::StreamListener>> {
        self.listener.lock().unwrap().clone()
    }

    pub fn touch_idle(&self) {
        let elapsed = self.epoch.elapsed().as_nanos() as u64;
        self.idle_started.store(elapsed, Ordering::Release);
    }

    pub fn idle_nanos(&self) -> u64 {
        let elapsed = self.epoch.elapsed().as_nanos() as u64;
        elapsed.saturating_sub(self.idle_started.load(Ordering::Acquire))
    }

    pub fn record_sent(&self, n: i64) {
        self.bytes_sent.fetch_add(n, Ordering::AcqRel);
    }

    pub fn record_received(&self, n: i64) {
        self.bytes_received.fetch_add(n, Ordering::AcqRel);
    }

    pub fn bytes_sent(&self) -> i64 {
        self.bytes_sent.load(Ordering::Acquire)
    }

    pub fn bytes_received(&self) -> i64 {
        self.bytes_received.load(Ordering::Acquire)
    }

    pub fn set_attachment(&self, attachment: Box<dyn Attachment>) {
        *self.attachment.lock().unwrap() = Some(attachment);
    }

    pub fn deliver(&self, frame: &crate::frame::Data, end_stream: bool) {
        if let Some(attachment) = self.attachment.lock().unwrap().as_ref() {
            attachment.process(frame, end_stream);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn before_send_does_not_close() {
        let s = Stream::new(1, true, 100, 100);
        assert!(!s.close.apply(CloseEvent::BeforeSend { end_stream: true }));
        assert!(!s.is_closed());
    }

    #[test]
    fn after_send_end_stream_half_closes() {
        let s = Stream::new(1, true, 100, 100);
        s.close.apply(CloseEvent::BeforeSend { end_stream: true });
        let closed = s.close.apply(CloseEvent::AfterSend { end_stream: true });
        assert!(!closed); // only send-half closed
        assert!(!s.is_closed());
    }

    #[test]
    fn full_close_after_both_halves() {
        let s = Stream::new(1, true, 100, 100);
        s.close.apply(CloseEvent::AfterSend { end_stream: true });
        let closed = s.close.apply(CloseEvent::Received { end_stream: true });
        assert!(closed);
        assert!(s.is_closed());
    }

    #[test]
    fn reset_is_immediately_closed() {
        let s = Stream::new(1, true, 100, 100);
        assert!(s.close.apply(CloseEvent::ResetReceived(ErrorCode::Cancel)));
        assert!(s.is_closed());
        let (code, by) = s.close.reset_info().unwrap();
        assert_eq!(code, ErrorCode::Cancel);
        assert_eq!(by, Peer::Remote);
    }
}
