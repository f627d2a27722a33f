//! Application-facing listener fan-out (spec.md §4.7): every `notify_*`
//! helper swallows a panicking listener instead of letting it unwind into
//! the dispatch loop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{ErrorCode, SessionApiError};
use crate::frame::{GoAway, Headers, Priority, PushPromise, Settings, StreamId};
use crate::stream::Stream;

pub trait SessionListener: Send + Sync {
    fn on_stream_created(&self, _stream: &Arc<Stream>) {}
    fn on_settings(&self, _frame: &Settings) {}
    fn on_ping_ack(&self, _payload: [u8; 8]) {}
    fn on_goaway(&self, _frame: &GoAway) {}
    fn on_priority(&self, _frame: &Priority) {}
    fn on_reset_on_closed_stream(&self, _stream_id: StreamId) {}
    fn on_idle_timeout(&self) -> bool {
        true
    }
    fn on_failure(&self, _error: ErrorCode, _reason: &str) {}
}

pub trait StreamListener: Send + Sync {
    fn on_headers(&self, _headers: &Headers) {}
    fn on_push_promise(&self, _frame: &PushPromise) {}
    fn on_reset(&self, _error: ErrorCode) {}
    fn on_failure(&self, _error: ErrorCode, _reason: &str) {}
}

/// Calls `f`, logging and swallowing a panic instead of propagating it —
/// the Rust analogue of "catch and log listener exceptions" (spec.md §4.7).
/// `f` must not hold a lock across the call since `catch_unwind` may skip
/// unlock-on-drop ordering guarantees callers expect.
pub fn notify<F>(what: &str, f: F)
where
    F: FnOnce() + std::panic::UnwindSafe,
{
    if let Err(panic) = catch_unwind(f) {
        let message = panic_message(&panic);
        tracing::warn!(listener = what, %message, "listener panicked; swallowing");
    }
}

/// Like [`notify`] but accepts a non-`UnwindSafe` closure by wrapping with
/// `AssertUnwindSafe` — appropriate here because listener callbacks never
/// observe session state through a poisoned lock (§5: no coarse session
/// lock; state lives in atomics/DashMap which remain valid after a panic).
pub fn notify_unchecked<F>(what: &str, f: F)
where
    F: FnOnce(),
{
    notify(what, AssertUnwindSafe(f))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Default listener used when the application doesn't supply one; declines
/// to act on idle timeouts (returns `false`, per spec.md §4.1 default) and
/// does nothing else.
#[derive(Debug, Default)]
pub struct NoopSessionListener;
impl SessionListener for NoopSessionListener {
    fn on_idle_timeout(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct NoopStreamListener;
impl StreamListener for NoopStreamListener {}

pub type ApiResult<T> = Result<T, SessionApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_swallows_panics() {
        let mut ran_after = false;
        notify_unchecked("test", || panic!("boom"));
        ran_after = true;
        assert!(ran_after);
    }
}
