//! Typed errors for the session engine.
//!
//! Protocol faults never unwind out of an ingress handler (§7 of the design):
//! they are classified here as either a [`StreamError`] (reset the one stream,
//! keep the connection) or a [`SessionError`] (tear the whole connection down
//! with GO_AWAY). Both carry an [`ErrorCode`] so the value can be serialized
//! straight into a RST_STREAM or GO_AWAY frame by the generator.

use std::fmt;

/// HTTP/2 error codes (RFC 7540 §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    Unknown(u32),
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        match self {
            ErrorCode::NoError => 0x0,
            ErrorCode::ProtocolError => 0x1,
            ErrorCode::InternalError => 0x2,
            ErrorCode::FlowControlError => 0x3,
            ErrorCode::SettingsTimeout => 0x4,
            ErrorCode::StreamClosed => 0x5,
            ErrorCode::FrameSizeError => 0x6,
            ErrorCode::RefusedStream => 0x7,
            ErrorCode::Cancel => 0x8,
            ErrorCode::CompressionError => 0x9,
            ErrorCode::ConnectError => 0xa,
            ErrorCode::EnhanceYourCalm => 0xb,
            ErrorCode::InadequateSecurity => 0xc,
            ErrorCode::Http11Required => 0xd,
            ErrorCode::Unknown(v) => v,
        }
    }

    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
            ErrorCode::Unknown(v) => return write!(f, "UNKNOWN({v})"),
        };
        f.write_str(name)
    }
}

/// A connection-level fault: the whole session is torn down.
#[derive(Debug, Clone, thiserror::Error)]
#[error("connection error {code}: {reason}")]
pub struct SessionError {
    pub code: ErrorCode,
    pub reason: String,
}

impl SessionError {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolError, reason)
    }

    pub fn flow_control(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::FlowControlError, reason)
    }
}

/// A stream-level fault: only that stream is reset.
#[derive(Debug, Clone, thiserror::Error)]
#[error("stream error {code}: {reason}")]
pub struct StreamError {
    pub code: ErrorCode,
    pub reason: String,
}

impl StreamError {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Abrupt, non-protocol failure: transport died, idle timeout fired. Never
/// emitted on the wire.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AbortCause {
    #[error("channel closed")]
    ClosedChannel,
    #[error("idle timeout")]
    Timeout,
    #[error("io error: {0}")]
    Io(String),
}

/// Errors surfaced from the public, synchronous-looking session API
/// (`new_stream`, `settings`, `ping`, `close`, config building).
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionApiError {
    #[error("session is closed")]
    Closed,
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error(transparent)]
    Connection(#[from] SessionError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

pub type Result<T> = std::result::Result<T, SessionApiError>;
