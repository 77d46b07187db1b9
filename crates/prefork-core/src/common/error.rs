//! Error types for the prefork RPC server.
//!
//! This module defines the central `Error` enum, which captures every failure
//! the server distinguishes between. The split matters: the session loop
//! treats [`Error::Transport`] as an ordinary disconnect and ends the
//! connection silently, while every other variant is reported.
//!
//! ## Error Cases
//! - `Transport`: The peer closed or reset the connection, or socket I/O
//!   failed.
//! - `Protocol`: A frame could not be decoded or encoded.
//! - `Application`: The processor's handler failed.
//! - `Panicked`: The processor panicked while handling a request.
//! - `Configuration`: The server was configured with an invalid value.
//! - `Listen`: The listening socket could not be bound.
//! - `Spawn`: A worker process could not be created.
//! - `ServiceShutdown`: The server was stopped and cannot serve again.

use std::io;

/// Boxed error returned by application handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the prefork server.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Transport-level failure, including a clean peer disconnect.
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// Malformed or unexpected frame.
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    /// The application handler returned an error.
    #[error("Application error: {0}")]
    Application(#[source] BoxError),

    /// The application handler panicked.
    #[error("Handler panicked: {reason}")]
    Panicked { reason: String },

    /// Invalid server configuration, reported before any worker is spawned.
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// The listening socket could not be created.
    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A worker process could not be started.
    #[error("Worker {index} failed to start: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },

    /// The server has been stopped.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// Wraps an arbitrary handler error.
    pub fn application<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Application(err.into())
    }

    /// Builds a [`Error::Configuration`] from a message.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Returns `true` when the error means the connection is gone.
    ///
    /// Sessions ending with a transport error are not reported.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Error used when a read finds the stream already at EOF.
    pub(crate) fn end_of_stream() -> Self {
        Self::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the connection",
        ))
    }

    /// Classifies an I/O error surfaced by a codec.
    ///
    /// The length-delimited codec reports oversized frames as `InvalidData`
    /// when decoding and `InvalidInput` when encoding. Both are protocol
    /// violations rather than a lost connection.
    pub(crate) fn from_codec(err: io::Error) -> Self {
        if matches!(
            err.kind(),
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput
        ) {
            Self::Protocol {
                reason: err.to_string(),
            }
        } else {
            Self::Transport(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_are_disconnects() {
        assert!(Error::end_of_stream().is_transport());
        assert!(Error::from(io::Error::from(io::ErrorKind::ConnectionReset)).is_transport());
        assert!(!Error::application("boom").is_transport());
        assert!(
            !Error::Protocol {
                reason: "bad frame".to_string()
            }
            .is_transport()
        );
        assert!(
            !Error::Panicked {
                reason: "oops".to_string()
            }
            .is_transport()
        );
    }

    #[test]
    fn codec_errors_are_classified() {
        let oversized = io::Error::new(io::ErrorKind::InvalidData, "frame size too big");
        assert!(matches!(
            Error::from_codec(oversized),
            Error::Protocol { .. }
        ));

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(Error::from_codec(reset).is_transport());
    }

    #[test]
    fn display() {
        assert_eq!(
            Error::configuration("worker count must be at least 1").to_string(),
            "Configuration error: worker count must be at least 1"
        );
        assert_eq!(
            Error::application("boom").to_string(),
            "Application error: boom"
        );
        assert_eq!(
            Error::ServiceShutdown.to_string(),
            "Service is shutting down"
        );
    }
}
