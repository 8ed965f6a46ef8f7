//! Wire message types for the audit log protocol.
//!
//! Inbound and outbound messages are length-prefixed protocol-buffer
//! encodings. The types below are hand-declared with `prost` derives and
//! mirror the client/server message set one-to-one; the journal sink
//! persists the original encoded bytes verbatim, so re-encoding is never
//! required on the relay path.

pub mod framing;

/// Maximum size of a single framed message, in bytes. Records exceeding
/// this limit are rejected as a protocol violation.
pub const MESSAGE_SIZE_MAX: u32 = 2 * 1024 * 1024;

/// A second/nanosecond pair used for submit times, delays, and resume
/// points.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct TimeSpec {
    #[prost(int64, tag = "1")]
    pub tv_sec: i64,
    #[prost(int32, tag = "2")]
    pub tv_nsec: i32,
}

impl TimeSpec {
    #[must_use]
    pub fn new(tv_sec: i64, tv_nsec: i32) -> Self {
        Self { tv_sec, tv_nsec }
    }
}

/// Session metadata entry supplied by the client at accept/reject time.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InfoMessage {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(oneof = "info_message::Value", tags = "2, 3, 4")]
    pub value: ::core::option::Option<info_message::Value>,
}

pub mod info_message {
    /// An ordered list of strings (e.g. a command's argument vector).
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StringList {
        #[prost(string, repeated, tag = "1")]
        pub strings: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(int64, tag = "2")]
        Numval(i64),
        #[prost(string, tag = "3")]
        Strval(::prost::alloc::string::String),
        #[prost(message, tag = "4")]
        Strlistval(StringList),
    }
}

/// Initial client greeting.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientHello {
    #[prost(string, tag = "1")]
    pub client_version: ::prost::alloc::string::String,
}

/// A policy accept decision opening a session.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AcceptMessage {
    #[prost(message, optional, tag = "1")]
    pub submit_time: ::core::option::Option<TimeSpec>,
    #[prost(message, repeated, tag = "2")]
    pub info_msgs: ::prost::alloc::vec::Vec<InfoMessage>,
    /// Whether the client will stream I/O buffers for this session.
    #[prost(bool, tag = "3")]
    pub expect_iobufs: bool,
}

/// A policy reject decision.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RejectMessage {
    #[prost(message, optional, tag = "1")]
    pub submit_time: ::core::option::Option<TimeSpec>,
    #[prost(string, tag = "2")]
    pub reason: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    pub info_msgs: ::prost::alloc::vec::Vec<InfoMessage>,
}

/// Command completion, terminating the session.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExitMessage {
    #[prost(message, optional, tag = "1")]
    pub run_time: ::core::option::Option<TimeSpec>,
    #[prost(int32, tag = "2")]
    pub exit_value: i32,
    #[prost(bool, tag = "3")]
    pub dumped_core: bool,
    /// Name of the signal that killed the command, without "SIG" prefix.
    #[prost(string, tag = "4")]
    pub signal: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub error: ::prost::alloc::string::String,
}

/// Reconnection request naming an existing log and the elapsed time up to
/// which the client has already been acknowledged.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RestartMessage {
    #[prost(string, tag = "1")]
    pub log_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub resume_point: ::core::option::Option<TimeSpec>,
}

/// Administrative alert raised during the session.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AlertMessage {
    #[prost(message, optional, tag = "1")]
    pub alert_time: ::core::option::Option<TimeSpec>,
    #[prost(string, tag = "2")]
    pub reason: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    pub info_msgs: ::prost::alloc::vec::Vec<InfoMessage>,
}

/// A chunk of captured terminal I/O with its delay from the previous
/// record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IoBuffer {
    #[prost(message, optional, tag = "1")]
    pub delay: ::core::option::Option<TimeSpec>,
    #[prost(bytes = "vec", tag = "2")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

/// Terminal window-size change.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChangeWindowSize {
    #[prost(message, optional, tag = "1")]
    pub delay: ::core::option::Option<TimeSpec>,
    #[prost(int32, tag = "2")]
    pub rows: i32,
    #[prost(int32, tag = "3")]
    pub cols: i32,
}

/// Command suspended or resumed by a signal.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandSuspend {
    #[prost(message, optional, tag = "1")]
    pub delay: ::core::option::Option<TimeSpec>,
    /// Signal name without "SIG" prefix, e.g. "TSTP" or "CONT".
    #[prost(string, tag = "2")]
    pub signal: ::prost::alloc::string::String,
}

/// Envelope for every inbound client message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientMessage {
    #[prost(
        oneof = "client_message::Type",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13"
    )]
    pub r#type: ::core::option::Option<client_message::Type>,
}

pub mod client_message {
    use super::{
        AcceptMessage, AlertMessage, ChangeWindowSize, ClientHello, CommandSuspend, ExitMessage,
        IoBuffer, RejectMessage, RestartMessage,
    };

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "1")]
        AcceptMsg(AcceptMessage),
        #[prost(message, tag = "2")]
        RejectMsg(RejectMessage),
        #[prost(message, tag = "3")]
        ExitMsg(ExitMessage),
        #[prost(message, tag = "4")]
        RestartMsg(RestartMessage),
        #[prost(message, tag = "5")]
        AlertMsg(AlertMessage),
        #[prost(message, tag = "6")]
        TtyinBuf(IoBuffer),
        #[prost(message, tag = "7")]
        TtyoutBuf(IoBuffer),
        #[prost(message, tag = "8")]
        StdinBuf(IoBuffer),
        #[prost(message, tag = "9")]
        StdoutBuf(IoBuffer),
        #[prost(message, tag = "10")]
        StderrBuf(IoBuffer),
        #[prost(message, tag = "11")]
        WinsizeEvent(ChangeWindowSize),
        #[prost(message, tag = "12")]
        SuspendEvent(CommandSuspend),
        #[prost(message, tag = "13")]
        HelloMsg(ClientHello),
    }
}

/// Server greeting sent once per connection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerHello {
    #[prost(string, tag = "1")]
    pub server_version: ::prost::alloc::string::String,
}

/// Envelope for every outbound server message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerMessage {
    #[prost(oneof = "server_message::Type", tags = "1, 2, 3, 4, 5")]
    pub r#type: ::core::option::Option<server_message::Type>,
}

pub mod server_message {
    use super::{ServerHello, TimeSpec};

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "1")]
        Hello(ServerHello),
        /// Elapsed time up to which all records have been durably stored.
        #[prost(message, tag = "2")]
        CommitPoint(TimeSpec),
        /// Identifier the client presents to restart this session.
        #[prost(string, tag = "3")]
        LogId(::prost::alloc::string::String),
        #[prost(string, tag = "4")]
        Error(::prost::alloc::string::String),
        #[prost(string, tag = "5")]
        Abort(::prost::alloc::string::String),
    }
}
