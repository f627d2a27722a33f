//! The pluggable flow-control policy (spec.md §6 `FlowControlStrategy`).
//! The session debits/credits windows and asks this collaborator when to
//! emit WINDOW_UPDATE and how to react to a SETTINGS INITIAL_WINDOW_SIZE
//! change; it never decides flow control unilaterally.
//!
//! `onDataReceived/Consumed(session, stream, length)` in spec.md §6 takes
//! both the session and the stream, so each hook here is handed the
//! session's receive [`Window`] alongside an optional stream — `stream` is
//! `None` for session-level-only bookkeeping (e.g. DATA on an absent
//! stream, spec.md §4.4).

use std::sync::Arc;

use crate::frame::WindowUpdate;
use crate::stream::Stream;
use crate::window::Window;

/// What the session should emit after a flow-control decision: a
/// session-level WINDOW_UPDATE increment and/or a per-stream one.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowCredit {
    pub session_increment: u32,
    pub stream_increment: u32,
}

impl FlowCredit {
    pub fn is_empty(&self) -> bool {
        self.session_increment == 0 && self.stream_increment == 0
    }
}

pub trait FlowControlStrategy: Send + Sync + std::fmt::Debug {
    fn on_stream_created(&self, stream: &Arc<Stream>);
    fn on_stream_destroyed(&self, stream: &Arc<Stream>);
    /// Application consumed `length` bytes of a DATA payload; decide what
    /// WINDOW_UPDATE credit (session and/or stream) to hand back to the
    /// peer.
    fn on_data_consumed(
        &self,
        session_window: &Window,
        stream: Option<&Arc<Stream>>,
        length: i64,
    ) -> FlowCredit;
    fn on_data_sending(&self, stream: &Arc<Stream>, length: i64);
    fn on_data_sent(&self, stream: &Arc<Stream>, length: i64);
    /// SETTINGS INITIAL_WINDOW_SIZE changed; recompute every open stream's
    /// window by the delta. `local` is true when the initiating SETTINGS
    /// frame is ours (set via the egress entry's `before_send`, DESIGN NOTES
    /// "Callbacks" + spec.md §4.5).
    fn update_initial_stream_window(&self, streams: &[Arc<Stream>], delta: i64, local: bool);
    /// Notifies the strategy that one of *our own* WINDOW_UPDATE frames —
    /// the credit-back `on_data_consumed` asked for — has been flushed to
    /// the peer. A peer-sent WINDOW_UPDATE never reaches this hook; the
    /// session applies those directly to `send_window` (spec.md §4.4) since
    /// that credit must be visible to in-flight sends immediately rather
    /// than queued through the flusher.
    fn window_update(&self, stream: Option<&Arc<Stream>>, frame: &WindowUpdate);
}

/// Simple auto-update strategy: credits back 100% of consumed bytes once
/// half the window has been used, matching the common default used by
/// `h2`-lineage implementations.
#[derive(Debug)]
pub struct AutoFlowControlStrategy {
    initial_window: i64,
}

impl AutoFlowControlStrategy {
    pub fn new(initial_window: i64) -> Self {
        Self { initial_window }
    }

    fn increment_for(&self, window: &Window, length: i64) -> u32 {
        let new_window = match window.try_add(length) {
            Ok(w) => w,
            Err(_) => return 0,
        };
        if new_window > self.initial_window / 2 {
            return 0;
        }
        let increment = (self.initial_window - new_window).max(0) as u32;
        if increment > 0 && window.try_add(increment as i64).is_ok() {
            increment
        } else {
            0
        }
    }
}

impl FlowControlStrategy for AutoFlowControlStrategy {
    fn on_stream_created(&self, _stream: &Arc<Stream>) {}

    fn on_stream_destroyed(&self, _stream: &Arc<Stream>) {}

    fn on_data_consumed(
        &self,
        session_window: &Window,
        stream: Option<&Arc<Stream>>,
        length: i64,
    ) -> FlowCredit {
        let session_increment = self.increment_for(session_window, length);
        let stream_increment = stream
            .map(|s| self.increment_for(&s.recv_window, length))
            .unwrap_or(0);
        FlowCredit {
            session_increment,
            stream_increment,
        }
    }

    fn on_data_sending(&self, stream: &Arc<Stream>, length: i64) {
        stream.send_window.try_debit(length);
    }

    fn on_data_sent(&self, stream: &Arc<Stream>, length: i64) {
        stream.record_sent(length);
    }

    fn update_initial_stream_window(&self, streams: &[Arc<Stream>], delta: i64, _local: bool) {
        for stream in streams {
            let _ = stream.send_window.try_add(delta);
        }
    }

    fn window_update(&self, _stream: Option<&Arc<Stream>>, _frame: &WindowUpdate) {
        // `increment_for` already topped the recv window back up when it
        // computed this increment; nothing left to account for here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credits_back_once_half_consumed() {
        let strategy = AutoFlowControlStrategy::new(100);
        let session_window = Window::new(10); // already low
        let stream = Arc::new(Stream::new(1, true, 100, 10));
        let credit = strategy.on_data_consumed(&session_window, Some(&stream), 5);
        assert!(credit.session_increment > 0 || credit.stream_increment > 0);
    }

    #[test]
    fn session_only_path_ignores_stream() {
        let strategy = AutoFlowControlStrategy::new(100);
        let session_window = Window::new(10);
        let credit = strategy.on_data_consumed(&session_window, None, 5);
        assert_eq!(credit.stream_increment, 0);
    }

    #[test]
    fn window_update_does_not_touch_send_window() {
        // This hook fires when our own outbound WINDOW_UPDATE is flushed,
        // not when the peer's is received (session.rs applies that credit
        // directly) — it must not perturb `send_window`.
        let strategy = AutoFlowControlStrategy::new(100);
        let stream = Arc::new(Stream::new(1, true, 0, 100));
        strategy.window_update(
            Some(&stream),
            &WindowUpdate {
                stream_id: 1,
                increment: 50,
            },
        );
        assert_eq!(stream.send_window.get(), 0);
    }
}
