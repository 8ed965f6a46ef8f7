//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Premature end of stream where more data was required.
    Eof(String),
    /// Wire-protocol violation: oversize record, undecodable payload,
    /// unknown message or metadata variant, restart overshoot.
    Protocol(String),
    /// Journal store failure (create, append, finish, reopen).
    Journal(String),
    /// I/O-log store failure (directory tree, stream files, timing file).
    Iolog(String),
    /// Event-log emission failure.
    EventLog(String),
    /// Restart impossibility: completed session, missing session,
    /// target not reachable.
    Restart(String),
    /// Journal lock held by another process.
    Contention(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Eof(msg) => write!(f, "unexpected eof: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Journal(msg) => write!(f, "journal: {msg}"),
            Self::Iolog(msg) => write!(f, "iolog: {msg}"),
            Self::EventLog(msg) => write!(f, "eventlog: {msg}"),
            Self::Restart(msg) => write!(f, "restart: {msg}"),
            Self::Contention(msg) => write!(f, "contention: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<prost::DecodeError> for AppError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Protocol(format!("unable to decode message: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Eof(err.to_string())
        } else {
            Self::Io(err.to_string())
        }
    }
}
