//! Sink-specific message handling.
//!
//! Each inbound client message variant maps to exactly one handler from
//! the sink bound at accept time. The binding is a fixed table of
//! function pointers with one slot per variant; the set of sinks is
//! closed, so the two concrete tables are static.

pub mod journal;
pub mod local;

use crate::config::SinkKind;
use crate::connection::ConnectionClosure;
use crate::errors::Result;
use crate::iolog::IoStream;
use crate::protocol::{
    AcceptMessage, AlertMessage, ChangeWindowSize, CommandSuspend, ExitMessage, IoBuffer,
    RejectMessage, RestartMessage,
};

/// Handler signature for most message variants.
pub type Handler<M> = fn(&M, &[u8], &mut ConnectionClosure) -> Result<()>;

/// Handler signature for I/O buffers, which also carry their stream.
pub type IobufHandler = fn(IoStream, &IoBuffer, &[u8], &mut ConnectionClosure) -> Result<()>;

/// Per-sink dispatch table: one slot per inbound message variant.
///
/// The five I/O-buffer variants share the `iobuf` slot, which receives
/// the stream index. A connection binds exactly one table at accept time
/// and never changes it.
pub struct MessageSwitch {
    pub accept: Handler<AcceptMessage>,
    pub reject: Handler<RejectMessage>,
    pub exit: Handler<ExitMessage>,
    pub restart: Handler<RestartMessage>,
    pub alert: Handler<AlertMessage>,
    pub iobuf: IobufHandler,
    pub suspend: Handler<CommandSuspend>,
    pub winsize: Handler<ChangeWindowSize>,
}

/// Resolve the dispatch table for a sink.
#[must_use]
pub fn switch_for(sink: SinkKind) -> &'static MessageSwitch {
    match sink {
        SinkKind::Local => &local::SWITCH,
        SinkKind::Relay => &journal::SWITCH,
    }
}
