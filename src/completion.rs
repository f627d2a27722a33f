//! Completion tokens (DESIGN NOTES "Callbacks → completion tokens"):
//! every asynchronous API takes a completion with `succeeded`/`failed`, and
//! the contract that intermediate DATA emissions never fire it while the
//! final emission fires it exactly once is enforced by callers holding only
//! one `Completion` per logical operation.

use std::sync::Mutex;

use crate::error::SessionApiError;

type Callback = Box<dyn FnOnce(Result<(), SessionApiError>) + Send + 'static>;

/// A one-shot completion. Cloning is intentionally not provided — ownership
/// of "fires exactly once" is easiest to reason about when there is exactly
/// one handle.
pub struct Completion {
    inner: Mutex<Option<Callback>>,
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

impl Completion {
    pub fn new(callback: impl FnOnce(Result<(), SessionApiError>) + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(Some(Box::new(callback))),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn succeeded(self) {
        self.fire(Ok(()));
    }

    pub fn failed(self, cause: SessionApiError) {
        self.fire(Err(cause));
    }

    fn fire(&self, result: Result<(), SessionApiError>) {
        if let Some(cb) = self.inner.lock().unwrap().take() {
            cb(result);
        }
    }
}

/// Awaitable pairing for callers that prefer futures over raw callbacks.
pub fn oneshot_completion() -> (Completion, tokio::sync::oneshot::Receiver<Result<(), SessionApiError>>) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let completion = Completion::new(move |result| {
        let _ = tx.send(result);
    });
    (completion, rx)
}
