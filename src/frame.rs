//! Frame value types dispatched between the session and its external
//! [`crate::collaborators::ParserListener`]/[`crate::collaborators::Generator`].
//!
//! Byte-level framing, padding and HPACK compression are out of scope (§1 of
//! the design) — these are the already-decoded/to-be-encoded values the
//! session reasons about.

use bytes::Bytes;

use crate::error::ErrorCode;

pub type StreamId = u32;

/// A decoded HEADERS block: just enough for the session to make routing and
/// close-state decisions. The actual header list is opaque to the session.
#[derive(Debug, Clone)]
pub struct Headers {
    pub stream_id: StreamId,
    pub end_stream: bool,
    pub header_block: Bytes,
    /// Set when this HEADERS frame is completing a server push promised
    /// earlier with a PUSH_PROMISE on `promised_stream_id`.
    pub promised_stream_id: Option<StreamId>,
}

#[derive(Debug, Clone)]
pub struct Data {
    pub stream_id: StreamId,
    pub payload: Bytes,
    pub padding: u32,
    pub end_stream: bool,
}

impl Data {
    /// Bytes that must be credited back to the session receive window
    /// regardless of whether a stream claims this frame (§4.4).
    pub fn flow_controlled_length(&self) -> i64 {
        self.payload.len() as i64 + self.padding as i64
    }
}

#[derive(Debug, Clone)]
pub struct RstStream {
    pub stream_id: StreamId,
    pub error_code: ErrorCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
    Unknown(u16),
}

#[derive(Debug, Clone, Copy)]
pub struct SettingValue {
    pub key: SettingKey,
    pub value: u32,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub ack: bool,
    pub values: Vec<SettingValue>,
}

#[derive(Debug, Clone)]
pub struct Ping {
    pub ack: bool,
    pub payload: [u8; 8],
}

#[derive(Debug, Clone)]
pub struct GoAway {
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

#[derive(Debug, Clone)]
pub struct WindowUpdate {
    pub stream_id: StreamId,
    pub increment: u32,
}

#[derive(Debug, Clone)]
pub struct Priority {
    pub stream_id: StreamId,
    pub dependency: StreamId,
    pub exclusive: bool,
    pub weight: u8,
}

#[derive(Debug, Clone)]
pub struct PushPromise {
    pub stream_id: StreamId,
    pub promised_stream_id: StreamId,
    pub header_block: Bytes,
}

/// Truncates a GO_AWAY debug reason to the 32-byte UTF-8 boundary mandated
/// by spec.md §6 "Close payload".
pub fn truncate_goaway_reason(reason: &str) -> Bytes {
    const MAX: usize = 32;
    if reason.len() <= MAX {
        return Bytes::copy_from_slice(reason.as_bytes());
    }
    let mut end = MAX;
    while end > 0 && !reason.is_char_boundary(end) {
        end -= 1;
    }
    Bytes::copy_from_slice(reason[..end].as_bytes())
}
