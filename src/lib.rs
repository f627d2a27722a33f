//! An HTTP/2 endpoint session engine: stream multiplexing, flow control and
//! close orchestration over a pluggable transport (spec.md OVERVIEW).
//!
//! The session itself never touches a socket. It drives frames through a
//! [`collaborators::Generator`] (wire encoding) and a [`collaborators::Endpoint`]
//! (transport lifecycle), and is fed inbound frames by whatever parses them
//! off the wire via [`collaborators::ParserListener`]. The crate ships
//! [`flusher::InProcessFlusher`] as the default egress pump and
//! [`flow_control::AutoFlowControlStrategy`] as the default flow-control
//! policy, but both are swappable.

pub mod close_state;
pub mod collaborators;
pub mod completion;
pub mod config;
pub mod creator;
pub mod entries;
pub mod error;
pub mod flow_control;
pub mod flusher;
pub mod frame;
pub mod listener;
pub mod session;
pub mod stream;
pub mod stream_id;
pub mod streams;
pub mod window;

pub use close_state::CloseState;
pub use collaborators::{Endpoint, Generator, Lease, ParserListener};
pub use completion::{oneshot_completion, Completion};
pub use config::{Config, ConfigBuilder, DEFAULT_WINDOW_SIZE, DEFAULT_WRITE_THRESHOLD, UNBOUNDED};
pub use entries::{
    rst_stream_entry, ControlEntry, ControlFrame, DataEntry, Entry, EntryContext, GenerateOutcome,
};
pub use error::{AbortCause, ErrorCode, Result, SessionApiError, SessionError, StreamError};
pub use flow_control::{AutoFlowControlStrategy, FlowControlStrategy, FlowCredit};
pub use flusher::{Flusher, InProcessFlusher};
pub use frame::{
    truncate_goaway_reason, Data, GoAway, Headers, Ping, Priority, PushPromise, RstStream,
    SettingKey, SettingValue, Settings, StreamId, WindowUpdate,
};
pub use listener::{
    notify, notify_unchecked, ApiResult, NoopSessionListener, NoopStreamListener, SessionListener,
    StreamListener,
};
pub use session::{
    ClientHeadersHandler, HeadersContext, HeadersHandler, ServerHeadersHandler, Session,
    SessionCollaborators,
};
pub use stream::{Attachment, CloseEvent, Peer, Stream};
pub use stream_id::{Role, StreamIds};
pub use streams::{CreateLocalError, CreateRemoteOutcome, StreamTable};
pub use window::{Window, WindowOverflow};
