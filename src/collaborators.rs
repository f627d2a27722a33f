//! Narrow interfaces to the external collaborators spec.md §6 keeps out of
//! scope: byte-level framing/HPACK (`Generator`), the TLS/TCP endpoint
//! (`Endpoint`), and per-stream flow-control policy is in
//! [`crate::flow_control`]. `Session` holds these as `Arc<dyn Trait>` —
//! single-instance-per-connection collaborators, not a hot generic path.

use bytes::Bytes;

use crate::error::ErrorCode;
use crate::frame::{Data, GoAway, Headers, Ping, Priority, PushPromise, RstStream, Settings, StreamId, WindowUpdate};

/// A lease identifies which queued entry is being serialized, so the
/// generator can correlate `frameBytes` accounting back to the entry
/// without the entry exposing its internals.
pub type Lease = u64;

/// Outbound byte-level serialization. A real implementation would run HPACK
/// and frame padding/length-prefixing here; out of scope for this crate
/// (spec.md §1).
pub trait Generator: Send + Sync + std::fmt::Debug {
    fn control_headers(&self, lease: Lease, frame: &Headers) -> usize;
    fn control_rst_stream(&self, lease: Lease, frame: &RstStream) -> usize;
    fn control_settings(&self, lease: Lease, frame: &Settings) -> usize;
    fn control_ping(&self, lease: Lease, frame: &Ping) -> usize;
    fn control_goaway(&self, lease: Lease, frame: &GoAway) -> usize;
    fn control_window_update(&self, lease: Lease, frame: &WindowUpdate) -> usize;
    fn control_priority(&self, lease: Lease, frame: &Priority) -> usize;
    fn control_push_promise(&self, lease: Lease, frame: &PushPromise) -> usize;
    /// Writes as much of `chunk` as fits in the current frame, returning how
    /// many bytes of it were consumed (may be less than `chunk.len()`).
    fn data(&self, lease: Lease, stream_id: StreamId, chunk: &Bytes) -> usize;

    fn set_header_table_size(&self, size: u32);
    fn set_max_frame_size(&self, size: u32);
    fn set_max_header_list_size(&self, size: u32);
}

/// The transport underneath the session: TLS/TCP socket or equivalent.
pub trait Endpoint: Send + Sync + std::fmt::Debug {
    fn shutdown_output(&self);
    fn close(&self);
    fn is_open(&self) -> bool;
    fn idle_timeout(&self) -> std::time::Duration;
}

/// Ingress entry point a real byte-level `Parser` drives once it has decoded
/// a frame off the wire. `Session` implements this directly (spec.md §6
/// "the session implements the parser-listener interface"); kept as a trait
/// so test harnesses can drive the dispatch core without a real parser.
pub trait ParserListener: Send + Sync {
    fn on_data(&self, frame: Data);
    fn on_headers(&self, frame: Headers);
    fn on_priority(&self, frame: Priority);
    fn on_reset(&self, frame: RstStream);
    fn on_settings(&self, frame: Settings);
    fn on_push_promise(&self, frame: PushPromise);
    fn on_ping(&self, frame: Ping);
    fn on_goaway(&self, frame: GoAway);
    fn on_window_update(&self, frame: WindowUpdate);
    fn on_stream_failure(&self, stream_id: StreamId, error: ErrorCode, reason: String);
    fn on_connection_failure(&self, error: ErrorCode, reason: String);
    /// A non-HTTP/2 frame arrived (e.g. an HTTP/1.1 upgrade attempt).
    fn on_frame(&self);
    fn on_shutdown(&self);
}
