//! Error taxonomy for sources and the transmitter.
//!
//! Errors are split by what the caller should do about them: fatal connect
//! errors are never retried, everything else coming out of a source is
//! transient and handled by the reconnect policy.

use std::io;
use thiserror::Error;

/// Errors produced by sources.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The failure is structural (bad address, rejected credentials).
    /// Retrying cannot help.
    #[error("fatal connect error: {0}")]
    FatalConnect(String),

    /// The reconnect policy ran out of attempts.
    #[error("max reconnect attempts exceeded ({attempts})")]
    AttemptsExceeded {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The source was used before a connection was established.
    #[error("source is not connected")]
    NotConnected,

    /// A connect attempt failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Reading from the underlying connection failed.
    #[error("read failed: {0}")]
    Read(String),

    /// Writing to the underlying connection failed.
    #[error("write failed: {0}")]
    Write(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SourceError {
    /// Wrap a cause as a fatal connect error.
    #[must_use]
    pub fn fatal(cause: impl std::fmt::Display) -> Self {
        Self::FatalConnect(cause.to_string())
    }

    /// Whether retrying is pointless.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalConnect(_))
    }
}

/// Whether an I/O error comes from a connection that was already closed
/// underneath a reader or writer during shutdown.
#[must_use]
pub fn is_closed_connection(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

/// Transmitter errors.
#[derive(Debug, Error)]
pub enum TransmitterError {
    /// Sources were added after the transmitter's token was cancelled.
    #[error("cannot add sources to a closed transmitter")]
    Closed,

    /// `run` was called on a transmitter that is running or has stopped.
    #[error("transmitter has already been started")]
    AlreadyStarted,
}
