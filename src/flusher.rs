//! The write pump external collaborator (spec.md §6 `Flusher`): drains
//! queued entries to the endpoint, the sole owner of window-update effects
//! during active writes (spec.md §4.4/§5).
//!
//! The wire-level write itself is out of scope (no real `Endpoint` byte
//! transport is implemented here); `InProcessFlusher` is the default,
//! in-process drain loop the crate ships so a session is runnable without a
//! hand-rolled external pump, modeled on the teacher's `send_loop` task
//! reading off a `flume` channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::entries::{Entry, EntryContext, GenerateOutcome};
use crate::error::SessionApiError;

type TerminationCause = Arc<Mutex<Option<SessionApiError>>>;

pub trait Flusher: Send + Sync {
    /// Queues an entry for transmission. Returns `false` if the flusher has
    /// already terminated.
    fn append(&self, entry: Box<dyn Entry>, ctx: &dyn EntryContext);
    /// Queues an entry ahead of everything else (used for PING replies,
    /// spec.md §6).
    fn prepend(&self, entry: Box<dyn Entry>, ctx: &dyn EntryContext);
    /// Fails every still-queued entry and stops draining.
    fn terminate(&self, cause: SessionApiError);
}

enum Queued {
    Control(Box<dyn Entry>),
    Data(Box<dyn Entry>),
}

/// A default, in-process flusher: a `flume` channel plus a single drain
/// task, matching the teacher's single-writer `send_loop`. DATA entries
/// that can't progress (window exhausted) are parked and retried when
/// `wake()` is called after a WINDOW_UPDATE.
pub struct InProcessFlusher {
    tx: flume::Sender<Queued>,
    rx: Mutex<Option<flume::Receiver<Queued>>>,
    terminated: Arc<AtomicBool>,
    termination_cause: TerminationCause,
    parked: Arc<std::sync::Mutex<Vec<Box<dyn Entry>>>>,
    wake: Arc<tokio::sync::Notify>,
}

impl InProcessFlusher {
    /// Builds the channel and bookkeeping but does not start draining yet.
    /// The drain task needs an `Arc<dyn EntryContext>` back-reference to the
    /// session, which doesn't exist until the session's own `Arc` is fully
    /// built — see [`Self::start`].
    pub fn new() -> Arc<Self> {
        let (tx, rx) = flume::unbounded::<Queued>();
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            terminated: Arc::new(AtomicBool::new(false)),
            termination_cause: Arc::new(Mutex::new(None)),
            parked: Arc::new(std::sync::Mutex::new(Vec::new())),
            wake: Arc::new(tokio::sync::Notify::new()),
        })
    }

    /// Spawns the drain task against `ctx`. Must be called exactly once,
    /// after the caller has a fully-constructed `Arc<dyn EntryContext>` to
    /// hand in (the session that owns this flusher coerces its own `Arc`
    /// once construction completes).
    pub fn start(self: &Arc<Self>, ctx: Arc<dyn EntryContext>) {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("InProcessFlusher::start called more than once");
        tokio::spawn(drain_loop(
            rx,
            ctx,
            self.terminated.clone(),
            self.termination_cause.clone(),
            self.parked.clone(),
            self.wake.clone(),
        ));
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

async fn drain_loop(
    rx: flume::Receiver<Queued>,
    ctx: Arc<dyn EntryContext>,
    terminated: Arc<AtomicBool>,
    termination_cause: TerminationCause,
    parked: Arc<std::sync::Mutex<Vec<Box<dyn Entry>>>>,
    wake: Arc<tokio::sync::Notify>,
) {
    loop {
        if terminated.load(Ordering::Acquire) {
            let cause = termination_cause
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(SessionApiError::Closed);
            drain_remaining(&rx, cause);
            break;
        }
        tokio::select! {
            item = rx.recv_async() => {
                match item {
                    Ok(Queued::Control(mut entry)) => {
                        drive_control(&mut entry, ctx.as_ref());
                        entry.succeeded(ctx.as_ref());
                    }
                    Ok(Queued::Data(entry)) => {
                        drive_data_or_park(entry, ctx.as_ref(), &parked);
                    }
                    Err(_) => break,
                }
            }
            _ = wake.notified() => {
                retry_parked(&ctx, &parked);
            }
        }
    }
}

/// Fails every entry still sitting in the channel when termination is
/// observed — entries already handed to a live [`Entry::generate`] /
/// `succeeded` call are not included here, only ones that never got that
/// far (spec.md §4.6 `terminate`: "fails every still-queued entry").
fn drain_remaining(rx: &flume::Receiver<Queued>, cause: SessionApiError) {
    while let Ok(queued) = rx.try_recv() {
        let entry = match queued {
            Queued::Control(entry) => entry,
            Queued::Data(entry) => entry,
        };
        entry.failed_with(cause.clone());
    }
}

fn drive_control(entry: &mut Box<dyn Entry>, ctx: &dyn EntryContext) {
    entry.before_send(ctx);
    entry.generate(ctx);
}

fn drive_data_or_park(
    mut entry: Box<dyn Entry>,
    ctx: &dyn EntryContext,
    parked: &Arc<std::sync::Mutex<Vec<Box<dyn Entry>>>>,
) {
    loop {
        match entry.generate(ctx) {
            GenerateOutcome::WindowExhausted => {
                parked.lock().unwrap().push(entry);
                return;
            }
            GenerateOutcome::DataFrame { final_frame, .. } => {
                entry.before_send(ctx);
                if final_frame {
                    entry.succeeded(ctx);
                    return;
                }
                // keep emitting sub-frames while window allows
            }
            GenerateOutcome::Frame(_) => {
                entry.succeeded(ctx);
                return;
            }
        }
    }
}

fn retry_parked(ctx: &Arc<dyn EntryContext>, parked: &Arc<std::sync::Mutex<Vec<Box<dyn Entry>>>>) {
    let pending = std::mem::take(&mut *parked.lock().unwrap());
    for entry in pending {
        drive_data_or_park(entry, ctx.as_ref(), parked);
    }
}

impl Flusher for InProcessFlusher {
    fn append(&self, entry: Box<dyn Entry>, _ctx: &dyn EntryContext) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        let queued = if entry.is_data() {
            Queued::Data(entry)
        } else {
            Queued::Control(entry)
        };
        let _ = self.tx.send(queued);
    }

    fn prepend(&self, entry: Box<dyn Entry>, ctx: &dyn EntryContext) {
        // The in-process channel has no head-insert; PING replies are rare
        // enough relative to DATA that plain FIFO ordering vs. other control
        // entries is an acceptable default implementation.
        self.append(entry, ctx)
    }

    fn terminate(&self, cause: SessionApiError) {
        *self.termination_cause.lock().unwrap() = Some(cause.clone());
        self.terminated.store(true, Ordering::Release);
        let pending = std::mem::take(&mut *self.parked.lock().unwrap());
        for entry in pending {
            entry.failed_with(cause.clone());
        }
        self.wake.notify_one();
    }
}
