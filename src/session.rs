//! The session: per-connection frame dispatch, stream lifecycle, and close
//! orchestration (spec.md §4). Mirrors the teacher's `Session`/`SessionInner`
//! split — a thin `Arc`-wrapped handle plus a shared inner that background
//! tasks and entries reach through an explicit capability (`EntryContext`,
//! `HeadersContext`) rather than a closure capturing `self`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::close_state::{CloseRegister, CloseState};
use crate::collaborators::{Endpoint, Generator, Lease, ParserListener};
use crate::completion::Completion;
use crate::config::Config;
use crate::creator::StreamCreator;
use crate::entries::{ControlEntry, ControlFrame, DataEntry, EntryContext, rst_stream_entry};
use crate::error::{ErrorCode, Result, SessionApiError, SessionError, StreamError};
use crate::flow_control::FlowControlStrategy;
use crate::flusher::{Flusher, InProcessFlusher};
use crate::frame::{
    truncate_goaway_reason, Data, GoAway, Headers, Ping, Priority, PushPromise, RstStream,
    SettingKey, Settings, StreamId, WindowUpdate,
};
use crate::listener::{notify_unchecked, NoopSessionListener, SessionListener, StreamListener};
use crate::stream::{CloseEvent, Stream};
use crate::stream_id::Role;
use crate::streams::{CreateLocalError, CreateRemoteOutcome, StreamTable};
use crate::window::Window;

/// The role-specific half of HEADERS handling (spec.md DESIGN NOTES
/// "Inheritance → variants"): the client/server distinction in the source's
/// `HTTP2Session` subclasses collapses to this one method.
pub trait HeadersHandler: Send + Sync + std::fmt::Debug {
    fn on_headers(&self, ctx: &dyn HeadersContext, frame: Headers);
}

/// Narrow capability `HeadersHandler` impls use to reach session state,
/// mirroring [`EntryContext`]'s role for egress entries.
pub trait HeadersContext: Send + Sync {
    fn streams(&self) -> &StreamTable;
    fn fail_connection(&self, code: ErrorCode, reason: &str);
    fn reply_refused(&self, stream_id: StreamId);
    fn notify_stream_created(&self, stream: &Arc<Stream>);
    fn deliver_headers(&self, stream: &Arc<Stream>, frame: &Headers);
    fn remove_stream(&self, stream_id: StreamId);
}

#[derive(Debug, Default)]
pub struct ClientHeadersHandler;

impl HeadersHandler for ClientHeadersHandler {
    fn on_headers(&self, ctx: &dyn HeadersContext, frame: Headers) {
        if let Some(stream) = ctx.streams().get(frame.stream_id) {
            deliver_and_maybe_close(ctx, &stream, &frame);
        } else if ctx.streams().is_closed_id(frame.stream_id) {
            // Tolerated: response to a stream we've already torn down
            // locally (e.g. reset raced with the peer's HEADERS).
        } else {
            ctx.fail_connection(ErrorCode::ProtocolError, "unexpected_headers_frame");
        }
    }
}

#[derive(Debug, Default)]
pub struct ServerHeadersHandler;

impl HeadersHandler for ServerHeadersHandler {
    fn on_headers(&self, ctx: &dyn HeadersContext, frame: Headers) {
        if let Some(stream) = ctx.streams().get(frame.stream_id) {
            deliver_and_maybe_close(ctx, &stream, &frame);
            return;
        }
        match ctx.streams().create_remote(frame.stream_id) {
            CreateRemoteOutcome::Created(stream) => {
                ctx.notify_stream_created(&stream);
                deliver_and_maybe_close(ctx, &stream, &frame);
            }
            CreateRemoteOutcome::Refused { .. } => {
                ctx.reply_refused(frame.stream_id);
            }
            CreateRemoteOutcome::Duplicate => {
                ctx.fail_connection(ErrorCode::ProtocolError, "duplicate_stream");
            }
        }
    }
}

fn deliver_and_maybe_close(ctx: &dyn HeadersContext, stream: &Arc<Stream>, frame: &Headers) {
    ctx.deliver_headers(stream, frame);
    let closed = stream.close.apply(CloseEvent::Received {
        end_stream: frame.end_stream,
    });
    if closed {
        ctx.remove_stream(stream.stream_id);
    }
}

pub struct SessionInner {
    role: Role,
    config: Config,
    streams: StreamTable,
    creator: StreamCreator,
    flusher: Arc<InProcessFlusher>,
    generator: Arc<dyn Generator>,
    endpoint: Arc<dyn Endpoint>,
    flow_control: Arc<dyn FlowControlStrategy>,
    session_listener: Arc<dyn SessionListener>,
    headers_handler: Arc<dyn HeadersHandler>,
    close: CloseRegister,
    session_send_window: Window,
    session_recv_window: Window,
    push_enabled: AtomicBool,
    bytes_written: AtomicU64,
    idle_time_nanos: AtomicU64,
    epoch: Instant,
    close_frame: Mutex<Option<GoAway>>,
    lease: AtomicU64,
    /// Set by `fail_connection` before the GO_AWAY/disconnect sequence it
    /// kicks off reaches `terminate()`, so queued entries are failed with the
    /// actual protocol fault instead of the generic closed-session error.
    failure_cause: Mutex<Option<SessionApiError>>,
}

impl std::fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInner")
            .field("role", &self.role)
            .field("close", &self.close.get())
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    fn touch_idle(&self) {
        let elapsed = self.epoch.elapsed().as_nanos() as u64;
        self.idle_time_nanos.store(elapsed, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.close.is_closed()
    }

    fn enqueue(&self, entry: Box<dyn crate::entries::Entry>) {
        self.flusher.append(entry, self);
    }

    fn enqueue_priority(&self, entry: Box<dyn crate::entries::Entry>) {
        self.flusher.prepend(entry, self);
    }

    fn enqueue_rst(&self, stream_id: StreamId, code: ErrorCode) {
        let entry = ControlEntry::without_completion(
            ControlFrame::RstStream(RstStream {
                stream_id,
                error_code: code,
            }),
            None,
        );
        self.enqueue(Box::new(entry));
    }

    fn enqueue_window_update(&self, stream: Option<Arc<Stream>>, increment: u32) {
        if increment == 0 {
            return;
        }
        let stream_id = stream.as_ref().map(|s| s.stream_id).unwrap_or(0);
        let entry = ControlEntry::without_completion(
            ControlFrame::WindowUpdate(WindowUpdate {
                stream_id,
                increment,
            }),
            stream,
        );
        self.enqueue(Box::new(entry));
    }

    /// Application- or protocol-initiated graceful close. Only the call
    /// that performs NOT_CLOSED -> LOCALLY_CLOSED actually enqueues
    /// GO_AWAY; everyone else gets an immediately-successful callback
    /// (spec.md §4.1, scenario 4).
    fn close_locally(&self, code: ErrorCode, reason: String, completion: Completion) -> bool {
        if !self.close.try_close_locally() {
            completion.succeeded();
            return false;
        }
        let debug_data = truncate_goaway_reason(&reason);
        let frame = GoAway {
            last_stream_id: self.streams.ids().last_remote(),
            error_code: code,
            debug_data,
        };
        let entry = ControlEntry::new(ControlFrame::GoAway(frame), None, completion);
        self.enqueue(Box::new(entry));
        true
    }

    /// §4.6: a connection-level protocol fault. Fans the failure out to
    /// every open stream and the session listener, then drives the same
    /// GO_AWAY + disconnect sequence as a graceful close.
    fn fail_connection(&self, code: ErrorCode, reason: String) {
        if self.is_closed() {
            return;
        }
        tracing::error!(error = %code, %reason, "connection failure");
        *self.failure_cause.lock().unwrap() = Some(SessionApiError::Connection(
            SessionError::new(code, reason.clone()),
        ));
        for stream in self.streams.all() {
            if let Some(listener) = stream.listener() {
                notify_unchecked("stream.on_failure", || listener.on_failure(code, &reason));
            }
        }
        notify_unchecked("session.on_failure", || {
            self.session_listener.on_failure(code, &reason)
        });
        self.close_locally(code, reason, Completion::noop());
        self.enqueue(Box::new(ControlEntry::new(
            ControlFrame::Disconnect,
            None,
            Completion::noop(),
        )));
    }

    /// §4.6 `abort(cause)`: unrecoverable transport failure, bypasses
    /// GO_AWAY entirely and terminates directly.
    fn abort(&self, cause: crate::error::AbortCause) {
        tracing::warn!(%cause, "aborting session");
        *self.failure_cause.lock().unwrap() = Some(SessionApiError::Connection(
            SessionError::new(ErrorCode::InternalError, cause.to_string()),
        ));
        for stream in self.streams.all() {
            if let Some(listener) = stream.listener() {
                let reason = cause.to_string();
                notify_unchecked("stream.on_failure", || {
                    listener.on_failure(ErrorCode::InternalError, &reason)
                });
            }
        }
        self.terminate();
    }

    /// §4.6 `terminate(cause)`: idempotent teardown — CAS to CLOSED, fail
    /// queued entries, drop every stream, close the endpoint.
    fn terminate(&self) {
        if !self.close.force_closed() {
            return;
        }
        let cause = self
            .failure_cause
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(SessionApiError::Closed);
        self.flusher.terminate(cause);
        for stream in self.streams.all() {
            stream.close.apply(CloseEvent::ResetSent(ErrorCode::Cancel));
        }
        self.streams.clear();
        self.endpoint.close();
    }

    /// spec.md §8 scenario 5 / §4.1 idle-timeout row. Returns whether the
    /// session acted on the timeout (aborted or deferred to the listener).
    fn check_idle_timeout(&self) -> bool {
        let elapsed = Duration::from_nanos(
            self.epoch.elapsed().as_nanos() as u64
                - self.idle_time_nanos.load(Ordering::Acquire),
        );
        if elapsed < self.config.stream_idle_timeout {
            return false;
        }
        match self.close.get() {
            CloseState::NotClosed => {
                let verdict = self.session_listener.on_idle_timeout();
                if verdict {
                    self.abort(crate::error::AbortCause::Timeout);
                }
                verdict
            }
            CloseState::LocallyClosed | CloseState::RemotelyClosed => {
                self.abort(crate::error::AbortCause::Timeout);
                true
            }
            CloseState::Closed => false,
        }
    }
}

impl EntryContext for SessionInner {
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

    fn record_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::AcqRel);
    }

    fn on_stream_opened(&self, stream: &Arc<Stream>) {
        notify_unchecked("session.on_stream_created", || {
            self.session_listener.on_stream_created(stream)
        });
        self.flow_control.on_stream_created(stream);
    }

    fn remove_stream(&self, stream_id: StreamId) {
        if let Some(stream) = self.streams.remove(stream_id) {
            self.flow_control.on_stream_destroyed(&stream);
            self.streams.update_stream_count(stream.local, -1, -1);
        }
    }

    fn mark_initial_window_is_local(&self, new_value: i64) {
        let old = self.streams.initial_local_window();
        self.streams.set_initial_local_window(new_value);
        self.flow_control
            .update_initial_stream_window(&self.streams.all(), new_value - old, true);
    }

    fn disconnect(&self) {
        self.terminate();
    }

    fn next_lease(&self) -> Lease {
        self.lease.fetch_add(1, Ordering::Relaxed)
    }

    fn session_send_window(&self) -> &Window {
        &self.session_send_window
    }
}

impl HeadersContext for SessionInner {
    fn streams(&self) -> &StreamTable {
        &self.streams
    }

    fn fail_connection(&self, code: ErrorCode, reason: &str) {
        SessionInner::fail_connection(self, code, reason.to_string());
    }

    fn reply_refused(&self, stream_id: StreamId) {
        self.enqueue_rst(stream_id, ErrorCode::RefusedStream);
    }

    fn notify_stream_created(&self, stream: &Arc<Stream>) {
        EntryContext::on_stream_opened(self, stream);
    }

    fn deliver_headers(&self, stream: &Arc<Stream>, frame: &Headers) {
        if let Some(listener) = stream.listener() {
            let frame = frame.clone();
            notify_unchecked("stream.on_headers", move || listener.on_headers(&frame));
        }
    }

    fn remove_stream(&self, stream_id: StreamId) {
        EntryContext::remove_stream(self, stream_id);
    }
}

impl ParserListener for SessionInner {
    fn on_data(&self, frame: Data) {
        self.touch_idle();
        let length = frame.flow_controlled_length();
        let stream = self.streams.get(frame.stream_id);

        if stream.is_some() {
            match self.session_recv_window.try_add(-length) {
                Ok(remaining) if remaining >= 0 => {}
                Ok(_) => {
                    self.fail_connection(
                        ErrorCode::FlowControlError,
                        "session_recv_window_underflow".to_string(),
                    );
                    return;
                }
                Err(_) => {
                    self.fail_connection(
                        ErrorCode::FlowControlError,
                        "session_recv_window_overflow".to_string(),
                    );
                    return;
                }
            }
        } else {
            // DESIGN NOTES Open Question: underflow is only checked when a
            // stream is present; an absent-stream frame still credits the
            // session window unconditionally, reproducing the source's
            // asymmetry rather than "fixing" it.
            self.session_recv_window.add_unchecked(-length);
        }

        match stream {
            Some(stream) => {
                stream.record_received(length);
                stream.deliver(&frame, frame.end_stream);
                let closed = stream.close.apply(CloseEvent::Received {
                    end_stream: frame.end_stream,
                });
                if closed {
                    EntryContext::remove_stream(self, stream.stream_id);
                }
                let credit =
                    self.flow_control
                        .on_data_consumed(&self.session_recv_window, Some(&stream), length);
                if credit.session_increment > 0 {
                    self.enqueue_window_update(None, credit.session_increment);
                }
                if credit.stream_increment > 0 {
                    self.enqueue_window_update(Some(stream), credit.stream_increment);
                }
            }
            None => {
                if self.streams.is_closed_id(frame.stream_id) {
                    self.enqueue_rst(frame.stream_id, ErrorCode::StreamClosed);
                } else if self.streams.is_unknown_id(frame.stream_id) {
                    self.fail_connection(
                        ErrorCode::ProtocolError,
                        "unexpected_data_frame".to_string(),
                    );
                    return;
                }
                let credit = self
                    .flow_control
                    .on_data_consumed(&self.session_recv_window, None, length);
                if credit.session_increment > 0 {
                    self.enqueue_window_update(None, credit.session_increment);
                }
            }
        }
    }

    fn on_headers(&self, frame: Headers) {
        self.touch_idle();
        self.headers_handler.on_headers(self, frame);
    }

    fn on_priority(&self, frame: Priority) {
        self.touch_idle();
        notify_unchecked("session.on_priority", || {
            self.session_listener.on_priority(&frame)
        });
    }

    fn on_reset(&self, frame: RstStream) {
        self.touch_idle();
        if let Some(stream) = self.streams.get(frame.stream_id) {
            if let Some(listener) = stream.listener() {
                notify_unchecked("stream.on_reset", || listener.on_reset(frame.error_code));
            }
            stream.close.apply(CloseEvent::ResetReceived(frame.error_code));
            EntryContext::remove_stream(self, frame.stream_id);
        } else if self.streams.is_closed_id(frame.stream_id) {
            notify_unchecked("session.on_reset_on_closed_stream", || {
                self.session_listener
                    .on_reset_on_closed_stream(frame.stream_id)
            });
        } else {
            self.fail_connection(
                ErrorCode::ProtocolError,
                "unexpected_rst_stream_frame".to_string(),
            );
        }
    }

    fn on_settings(&self, frame: Settings) {
        self.touch_idle();
        if frame.ack {
            return;
        }
        for value in &frame.values {
            match value.key {
                SettingKey::HeaderTableSize => self.generator.set_header_table_size(value.value),
                SettingKey::EnablePush => {
                    self.push_enabled.store(value.value != 0, Ordering::Release)
                }
                SettingKey::MaxConcurrentStreams => {
                    self.streams.set_max_local_streams(value.value as i64)
                }
                SettingKey::InitialWindowSize => {
                    let old = self.streams.initial_remote_window();
                    let new = value.value as i64;
                    self.streams.set_initial_remote_window(new);
                    self.flow_control
                        .update_initial_stream_window(&self.streams.all(), new - old, false);
                }
                SettingKey::MaxFrameSize => self.generator.set_max_frame_size(value.value),
                SettingKey::MaxHeaderListSize => {
                    self.generator.set_max_header_list_size(value.value)
                }
                SettingKey::Unknown(_) => {}
            }
        }
        notify_unchecked("session.on_settings", || {
            self.session_listener.on_settings(&frame)
        });
        let reply = ControlEntry::without_completion(
            ControlFrame::Settings(Settings {
                ack: true,
                values: Vec::new(),
            }),
            None,
        );
        self.enqueue(Box::new(reply));
    }

    fn on_push_promise(&self, frame: PushPromise) {
        self.touch_idle();
        if self.role != Role::Client {
            self.fail_connection(
                ErrorCode::ProtocolError,
                "unexpected_push_promise".to_string(),
            );
            return;
        }
        match self.streams.create_remote(frame.promised_stream_id) {
            CreateRemoteOutcome::Created(stream) => {
                EntryContext::on_stream_opened(self, &stream);
                if let Some(listener) = stream.listener() {
                    let frame = frame.clone();
                    notify_unchecked("stream.on_push_promise", move || {
                        listener.on_push_promise(&frame)
                    });
                }
            }
            CreateRemoteOutcome::Refused { .. } => {
                self.enqueue_rst(frame.promised_stream_id, ErrorCode::RefusedStream);
            }
            CreateRemoteOutcome::Duplicate => {
                self.fail_connection(ErrorCode::ProtocolError, "duplicate_stream".to_string());
            }
        }
    }

    fn on_ping(&self, frame: Ping) {
        self.touch_idle();
        if frame.ack {
            notify_unchecked("session.on_ping_ack", || {
                self.session_listener.on_ping_ack(frame.payload)
            });
            return;
        }
        let reply = ControlEntry::without_completion(
            ControlFrame::Ping(Ping {
                ack: true,
                payload: frame.payload,
            }),
            None,
        );
        self.enqueue_priority(Box::new(reply));
    }

    fn on_goaway(&self, frame: GoAway) {
        self.touch_idle();
        if self.close.try_close_remotely() {
            *self.close_frame.lock().unwrap() = Some(frame.clone());
            notify_unchecked("session.on_goaway", || {
                self.session_listener.on_goaway(&frame)
            });
            self.enqueue(Box::new(ControlEntry::new(
                ControlFrame::Disconnect,
                None,
                Completion::noop(),
            )));
        }
        // Already LOCALLY_CLOSED/REMOTELY_CLOSED/CLOSED: ignore, per §4.1.
    }

    fn on_window_update(&self, frame: WindowUpdate) {
        self.touch_idle();
        if frame.stream_id == 0 {
            if self.session_send_window.try_add(frame.increment as i64).is_err() {
                self.fail_connection(
                    ErrorCode::FlowControlError,
                    "session_send_window_overflow".to_string(),
                );
                return;
            }
            self.flusher.wake();
            return;
        }
        if let Some(stream) = self.streams.get(frame.stream_id) {
            if stream.send_window.try_add(frame.increment as i64).is_err() {
                self.enqueue(Box::new(rst_stream_entry(
                    stream,
                    ErrorCode::FlowControlError,
                )));
                return;
            }
            self.flusher.wake();
        }
        // Absent stream: tolerated, no-op (closed streams ignore credit).
    }

    fn on_stream_failure(&self, stream_id: StreamId, error: ErrorCode, reason: String) {
        self.touch_idle();
        if let Some(stream) = self.streams.get(stream_id) {
            let fault = StreamError::new(error, reason);
            tracing::debug!(stream_id, error = %fault.code, reason = %fault.reason, "stream failure");
            if let Some(listener) = stream.listener() {
                notify_unchecked("stream.on_failure", || {
                    listener.on_failure(fault.code, &fault.reason)
                });
            }
            self.enqueue(Box::new(rst_stream_entry(stream, fault.code)));
        }
    }

    fn on_connection_failure(&self, error: ErrorCode, reason: String) {
        self.fail_connection(error, reason);
    }

    fn on_frame(&self) {
        self.fail_connection(ErrorCode::ProtocolError, "upgrade".to_string());
    }

    fn on_shutdown(&self) {
        match self.close.get() {
            CloseState::NotClosed => self.abort(crate::error::AbortCause::ClosedChannel),
            CloseState::LocallyClosed => {
                self.enqueue(Box::new(ControlEntry::new(
                    ControlFrame::Disconnect,
                    None,
                    Completion::noop(),
                )));
            }
            CloseState::RemotelyClosed | CloseState::Closed => {}
        }
    }
}

/// The application-facing handle. Cheaply `Clone`-able; every clone shares
/// the same underlying connection state.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Everything needed to build a session beyond role and config: the external
/// collaborators spec.md §1 keeps out of scope (generator, endpoint,
/// flow-control strategy) plus optional application listener.
pub struct SessionCollaborators {
    pub generator: Arc<dyn Generator>,
    pub endpoint: Arc<dyn Endpoint>,
    pub flow_control: Arc<dyn FlowControlStrategy>,
    pub session_listener: Option<Arc<dyn SessionListener>>,
}

impl Session {
    pub fn new(role: Role, config: Config, collaborators: SessionCollaborators) -> Self {
        let flusher = InProcessFlusher::new();
        let headers_handler: Arc<dyn HeadersHandler> = match role {
            Role::Client => Arc::new(ClientHeadersHandler),
            Role::Server => Arc::new(ServerHeadersHandler),
        };
        let inner = Arc::new(SessionInner {
            role,
            streams: StreamTable::new(
                role,
                config.max_local_streams,
                config.max_remote_streams,
                config.initial_window_size,
            ),
            creator: StreamCreator::new(flusher.clone()),
            flusher,
            generator: collaborators.generator,
            endpoint: collaborators.endpoint,
            flow_control: collaborators.flow_control,
            session_listener: collaborators
                .session_listener
                .unwrap_or_else(|| Arc::new(NoopSessionListener)),
            headers_handler,
            close: CloseRegister::new(),
            session_send_window: Window::new(config.initial_window_size),
            session_recv_window: Window::new(config.initial_window_size),
            push_enabled: AtomicBool::new(config.push_enabled),
            bytes_written: AtomicU64::new(0),
            idle_time_nanos: AtomicU64::new(0),
            epoch: Instant::now(),
            close_frame: Mutex::new(None),
            lease: AtomicU64::new(0),
            failure_cause: Mutex::new(None),
            config,
        });

        let ctx: Arc<dyn EntryContext> = inner.clone();
        inner.flusher.start(ctx);

        Session { inner }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// spec.md §6 "Application facing" `newStream`. Ids are assigned
    /// synchronously (allocator reservation, §4.3); HEADERS transmission
    /// completes asynchronously through `completion`.
    pub fn new_stream(
        &self,
        header_block: Bytes,
        end_stream: bool,
        listener: Option<Arc<dyn StreamListener>>,
        completion: Completion,
    ) -> Result<Arc<Stream>> {
        if self.inner.is_closed() {
            return Err(SessionApiError::Closed);
        }
        let (id, slot) = self.inner.creator.reserve_slot(self.inner.streams.ids());
        match self.inner.streams.create_local(id) {
            Ok(stream) => {
                if let Some(listener) = listener {
                    stream.set_listener(listener);
                }
                let headers = Headers {
                    stream_id: id,
                    end_stream,
                    header_block,
                    promised_stream_id: None,
                };
                let entry = ControlEntry::new(
                    ControlFrame::Headers(headers),
                    Some(stream.clone()),
                    completion,
                );
                self.inner
                    .creator
                    .submit(slot, Box::new(entry), self.inner.as_ref());
                Ok(stream)
            }
            Err(CreateLocalError::LimitExceeded) => {
                self.inner.creator.abort_slot(&slot, self.inner.as_ref());
                Err(SessionApiError::IllegalArgument(
                    "max_local_streams exceeded".to_string(),
                ))
            }
            Err(CreateLocalError::DuplicateStream) => {
                self.inner.creator.abort_slot(&slot, self.inner.as_ref());
                unreachable!("allocator-issued stream ids are unique")
            }
        }
    }

    /// spec.md §6 `push(parentStream, promise, pushPromise, listener)`.
    pub fn push(
        &self,
        parent: &Arc<Stream>,
        header_block: Bytes,
        listener: Option<Arc<dyn StreamListener>>,
        completion: Completion,
    ) -> Result<Arc<Stream>> {
        if self.inner.is_closed() {
            return Err(SessionApiError::Closed);
        }
        if self.role() != Role::Server {
            return Err(SessionApiError::IllegalArgument(
                "only a server may push".to_string(),
            ));
        }
        if !self.is_push_enabled() {
            return Err(SessionApiError::IllegalArgument(
                "push disabled by peer".to_string(),
            ));
        }
        let (id, slot) = self.inner.creator.reserve_slot(self.inner.streams.ids());
        let stream = self
            .inner
            .streams
            .create_local(id)
            .map_err(|_| SessionApiError::IllegalArgument("push stream allocation failed".to_string()))?;
        if let Some(listener) = listener {
            stream.set_listener(listener);
        }
        let frame = PushPromise {
            stream_id: parent.stream_id,
            promised_stream_id: id,
            header_block,
        };
        let entry = ControlEntry::new(
            ControlFrame::PushPromise(frame),
            Some(stream.clone()),
            completion,
        );
        self.inner
            .creator
            .submit(slot, Box::new(entry), self.inner.as_ref());
        Ok(stream)
    }

    /// Enqueues `data` on an open stream. Intermediate emissions fire no
    /// callback; the final emission fires `completion` exactly once
    /// (spec.md §4.5, DESIGN NOTES "Callbacks → completion tokens").
    pub fn send_data(
        &self,
        stream: Arc<Stream>,
        payload: Bytes,
        end_stream: bool,
        completion: Completion,
    ) -> Result<()> {
        if self.inner.is_closed() {
            return Err(SessionApiError::Closed);
        }
        let entry = DataEntry::new(stream, payload, end_stream, completion);
        self.inner.enqueue(Box::new(entry));
        Ok(())
    }

    pub fn settings(&self, values: Vec<crate::frame::SettingValue>, completion: Completion) -> Result<()> {
        if self.inner.is_closed() {
            return Err(SessionApiError::Closed);
        }
        let entry = ControlEntry::new(
            ControlFrame::Settings(Settings { ack: false, values }),
            None,
            completion,
        );
        self.inner.enqueue(Box::new(entry));
        Ok(())
    }

    pub fn ping(&self, payload: [u8; 8], completion: Completion) -> Result<()> {
        if self.inner.is_closed() {
            return Err(SessionApiError::Closed);
        }
        let entry = ControlEntry::new(
            ControlFrame::Ping(Ping {
                ack: false,
                payload,
            }),
            None,
            completion,
        );
        self.inner.enqueue(Box::new(entry));
        Ok(())
    }

    /// spec.md §6 `close(error, reason, callback) -> bool`: true iff this
    /// call is the one that initiated the close.
    pub fn close(&self, code: ErrorCode, reason: impl Into<String>, completion: Completion) -> bool {
        self.inner.close_locally(code, reason.into(), completion)
    }

    /// Unrecoverable transport failure, bypassing GO_AWAY (spec.md §4.6
    /// `abort`).
    pub fn abort(&self, cause: crate::error::AbortCause) {
        self.inner.abort(cause);
    }

    /// Driven by an external timer/scheduler collaborator (out of scope per
    /// spec.md §1); the session only supplies the decision logic.
    pub fn check_idle_timeout(&self) -> bool {
        self.inner.check_idle_timeout()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn is_push_enabled(&self) -> bool {
        self.inner.push_enabled.load(Ordering::Acquire)
    }

    pub fn get_stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.inner.streams.get(id)
    }

    pub fn get_streams(&self) -> Vec<Arc<Stream>> {
        self.inner.streams.all()
    }

    pub fn session_send_window(&self) -> i64 {
        self.inner.session_send_window.get()
    }

    pub fn session_recv_window(&self) -> i64 {
        self.inner.session_recv_window.get()
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Acquire)
    }

    pub fn close_frame(&self) -> Option<GoAway> {
        self.inner.close_frame.lock().unwrap().clone()
    }

    /// Exposes the session as the ingress entry point a real byte-level
    /// parser drives (spec.md §6 "the session implements the
    /// parser-listener interface").
    pub fn as_parser_listener(&self) -> Arc<dyn ParserListener> {
        self.inner.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct RecordingGenerator {
        frames: Mutex<Vec<String>>,
    }

    impl RecordingGenerator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }
        fn record(&self, what: &str) -> usize {
            self.frames.lock().unwrap().push(what.to_string());
            1
        }
    }

    impl Generator for RecordingGenerator {
        fn control_headers(&self, _: Lease, f: &Headers) -> usize {
            self.record(&format!("headers:{}", f.stream_id))
        }
        fn control_rst_stream(&self, _: Lease, f: &RstStream) -> usize {
            self.record(&format!("rst:{}", f.stream_id))
        }
        fn control_settings(&self, _: Lease, _: &Settings) -> usize {
            self.record("settings")
        }
        fn control_ping(&self, _: Lease, _: &Ping) -> usize {
            self.record("ping")
        }
        fn control_goaway(&self, _: Lease, _: &GoAway) -> usize {
            self.record("goaway")
        }
        fn control_window_update(&self, _: Lease, _: &WindowUpdate) -> usize {
            self.record("window_update")
        }
        fn control_priority(&self, _: Lease, _: &Priority) -> usize {
            self.record("priority")
        }
        fn control_push_promise(&self, _: Lease, _: &PushPromise) -> usize {
            self.record("push_promise")
        }
        fn data(&self, _: Lease, _: StreamId, chunk: &Bytes) -> usize {
            chunk.len()
        }
        fn set_header_table_size(&self, _: u32) {}
        fn set_max_frame_size(&self, _: u32) {}
        fn set_max_header_list_size(&self, _: u32) {}
    }

    #[derive(Debug)]
    struct RecordingEndpoint {
        closed: AtomicBool,
    }
    impl Endpoint for RecordingEndpoint {
        fn shutdown_output(&self) {}
        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::Acquire)
        }
        fn idle_timeout(&self) -> Duration {
            Duration::from_secs(60)
        }
    }

    fn make_session(role: Role) -> (Session, Arc<RecordingGenerator>) {
        let generator = RecordingGenerator::new();
        let endpoint = Arc::new(RecordingEndpoint {
            closed: AtomicBool::new(false),
        });
        let session = Session::new(
            role,
            ConfigBuilder::new().build().unwrap(),
            SessionCollaborators {
                generator: generator.clone(),
                endpoint,
                flow_control: Arc::new(crate::flow_control::AutoFlowControlStrategy::new(65_535)),
                session_listener: None,
            },
        );
        (session, generator)
    }

    #[tokio::test]
    async fn new_stream_allocates_odd_ids_for_client() {
        let (session, _gen) = make_session(Role::Client);
        let s1 = session
            .new_stream(Bytes::new(), false, None, Completion::noop())
            .unwrap();
        let s2 = session
            .new_stream(Bytes::new(), false, None, Completion::noop())
            .unwrap();
        assert_eq!(s1.stream_id, 1);
        assert_eq!(s2.stream_id, 3);
    }

    #[tokio::test]
    async fn concurrent_new_stream_flushes_in_id_order() {
        // spec.md §8 scenario 1.
        let session = Arc::new(make_session(Role::Client).0);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                session
                    .new_stream(Bytes::new(), false, None, Completion::noop())
                    .unwrap()
                    .stream_id
            }));
        }
        let mut ids: Vec<StreamId> = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.sort();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn close_returns_false_on_second_call() {
        let (session, _gen) = make_session(Role::Client);
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        assert!(session.close(
            ErrorCode::NoError,
            "bye",
            Completion::new(move |_| {
                c1.fetch_add(1, Ordering::SeqCst);
            })
        ));
        let c2 = count.clone();
        assert!(!session.close(
            ErrorCode::NoError,
            "bye again",
            Completion::new(move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
            })
        ));
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn server_refuses_remote_stream_over_limit() {
        // spec.md §8 scenario 2.
        let generator = RecordingGenerator::new();
        let endpoint = Arc::new(RecordingEndpoint {
            closed: AtomicBool::new(false),
        });
        let session = Session::new(
            Role::Server,
            ConfigBuilder::new().max_remote_streams(2).build().unwrap(),
            SessionCollaborators {
                generator: generator.clone(),
                endpoint,
                flow_control: Arc::new(crate::flow_control::AutoFlowControlStrategy::new(65_535)),
                session_listener: None,
            },
        );
        let listener = session.as_parser_listener();
        listener.on_headers(Headers {
            stream_id: 1,
            end_stream: false,
            header_block: Bytes::new(),
            promised_stream_id: None,
        });
        listener.on_headers(Headers {
            stream_id: 3,
            end_stream: false,
            header_block: Bytes::new(),
            promised_stream_id: None,
        });
        listener.on_headers(Headers {
            stream_id: 5,
            end_stream: false,
            header_block: Bytes::new(),
            promised_stream_id: None,
        });
        tokio::task::yield_now().await;
        assert!(session.get_stream(1).is_some());
        assert!(session.get_stream(3).is_some());
        assert!(session.get_stream(5).is_none());
        assert!(generator
            .frames
            .lock()
            .unwrap()
            .contains(&"rst:5".to_string()));
    }

    #[tokio::test]
    async fn ping_without_ack_triggers_exactly_one_reply() {
        let (session, generator) = make_session(Role::Client);
        let listener = session.as_parser_listener();
        listener.on_ping(Ping {
            ack: false,
            payload: [1; 8],
        });
        tokio::task::yield_now().await;
        let pings = generator
            .frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| *f == "ping")
            .count();
        assert_eq!(pings, 1);
    }

    #[tokio::test]
    async fn ping_ack_triggers_no_reply() {
        // spec.md §8 scenario 6.
        let (session, generator) = make_session(Role::Client);
        let listener = session.as_parser_listener();
        listener.on_ping(Ping {
            ack: true,
            payload: [2; 8],
        });
        tokio::task::yield_now().await;
        assert!(generator.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn goaway_transitions_to_remotely_closed_and_disconnects() {
        // spec.md §8 scenario 4.
        let (session, _gen) = make_session(Role::Client);
        let listener = session.as_parser_listener();
        listener.on_goaway(GoAway {
            last_stream_id: 7,
            error_code: ErrorCode::NoError,
            debug_data: Bytes::new(),
        });
        tokio::task::yield_now().await;
        assert!(session.is_closed());

        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let initiated = session.close(
            ErrorCode::NoError,
            "local",
            Completion::new(move |_| {
                c1.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(!initiated);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn data_on_unknown_stream_fails_connection() {
        let (session, _gen) = make_session(Role::Server);
        let listener = session.as_parser_listener();
        listener.on_data(Data {
            stream_id: 99,
            payload: Bytes::from_static(b"x"),
            padding: 0,
            end_stream: false,
        });
        tokio::task::yield_now().await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn fragmented_data_send_resumes_after_window_update() {
        // spec.md §8 scenario 3: a 40-byte DATA entry sent into a 10-byte
        // window goes out as 10 + 30 across two `generate()` calls, with the
        // entry parked on `GenerateOutcome::WindowExhausted` in between.
        let generator = RecordingGenerator::new();
        let endpoint = Arc::new(RecordingEndpoint {
            closed: AtomicBool::new(false),
        });
        let session = Session::new(
            Role::Client,
            ConfigBuilder::new()
                .initial_window_size(10)
                .build()
                .unwrap(),
            SessionCollaborators {
                generator,
                endpoint,
                flow_control: Arc::new(crate::flow_control::AutoFlowControlStrategy::new(65_535)),
                session_listener: None,
            },
        );
        let stream = session
            .new_stream(Bytes::new(), false, None, Completion::noop())
            .unwrap();
        tokio::task::yield_now().await;

        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        session
            .send_data(
                stream.clone(),
                Bytes::from(vec![7u8; 40]),
                false,
                Completion::new(move |_| {
                    c1.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        tokio::task::yield_now().await;

        // Only the first window's worth went out; the rest is parked until
        // credit comes back, so nothing has committed yet.
        assert_eq!(session.bytes_written(), 0);
        assert_eq!(stream.bytes_sent(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let listener = session.as_parser_listener();
        listener.on_window_update(WindowUpdate {
            stream_id: 0,
            increment: 30,
        });
        listener.on_window_update(WindowUpdate {
            stream_id: stream.stream_id,
            increment: 30,
        });
        tokio::task::yield_now().await;

        assert_eq!(session.bytes_written(), 40);
        assert_eq!(stream.bytes_sent(), 40);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, Default)]
    struct AcceptIdleTimeout;
    impl SessionListener for AcceptIdleTimeout {
        fn on_idle_timeout(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn idle_timeout_aborts_when_listener_accepts() {
        // spec.md §8 scenario 5, NOT_CLOSED arm: the listener is asked and
        // its verdict decides whether the session aborts.
        let generator = RecordingGenerator::new();
        let endpoint = Arc::new(RecordingEndpoint {
            closed: AtomicBool::new(false),
        });
        let session = Session::new(
            Role::Client,
            ConfigBuilder::new()
                .stream_idle_timeout(Duration::from_millis(1))
                .build()
                .unwrap(),
            SessionCollaborators {
                generator,
                endpoint,
                flow_control: Arc::new(crate::flow_control::AutoFlowControlStrategy::new(65_535)),
                session_listener: Some(Arc::new(AcceptIdleTimeout)),
            },
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(session.check_idle_timeout());
        assert!(session.is_closed());

        // CLOSED arm: idempotent, no-op once fully torn down.
        assert!(!session.check_idle_timeout());
    }

    #[tokio::test]
    async fn idle_timeout_always_aborts_once_locally_closed() {
        // spec.md §8 scenario 5, LOCALLY_CLOSED/REMOTELY_CLOSED arm: once a
        // GO_AWAY is already in flight, idle timeout aborts unconditionally
        // without consulting the listener.
        let generator = RecordingGenerator::new();
        let endpoint = Arc::new(RecordingEndpoint {
            closed: AtomicBool::new(false),
        });
        let session = Session::new(
            Role::Client,
            ConfigBuilder::new()
                .stream_idle_timeout(Duration::from_millis(1))
                .build()
                .unwrap(),
            SessionCollaborators {
                generator,
                endpoint,
                flow_control: Arc::new(crate::flow_control::AutoFlowControlStrategy::new(65_535)),
                session_listener: None,
            },
        );
        assert!(session.close(ErrorCode::NoError, "bye", Completion::noop()));
        assert!(!session.is_closed());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(session.check_idle_timeout());
        assert!(session.is_closed());
    }
}
