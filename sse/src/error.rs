//! Error types for the `sse` crate.
//!
//! Follows the same pattern as the other library crates: a root `Error` struct
//! holding an error kind tree plus an optional source for error chaining.

use std::error::Error as StdError;
use std::fmt;

/// Top-level error type for the `sse` crate.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors surfaced by the broker and the session registry.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    Transport(TransportErrorKind),
    Session(SessionErrorKind),
    Broker(BrokerErrorKind),
}

/// Errors caused by the underlying transport of a connection attempt.
#[derive(Debug, PartialEq)]
pub enum TransportErrorKind {
    /// The connection cannot flush partial writes, so server push is impossible.
    StreamingUnsupported,
}

/// Errors from session lifecycle operations.
#[derive(Debug, PartialEq)]
pub enum SessionErrorKind {
    /// The secure random source failed while generating a session id.
    Entropy,
}

/// Errors from the broker's request channels.
#[derive(Debug, PartialEq)]
pub enum BrokerErrorKind {
    /// The broker event loop has been stopped.
    ShutDown,
}

impl Error {
    pub fn streaming_unsupported() -> Self {
        Error {
            source: None,
            error_kind: ErrorKind::Transport(TransportErrorKind::StreamingUnsupported),
        }
    }

    pub fn shut_down() -> Self {
        Error {
            source: None,
            error_kind: ErrorKind::Broker(BrokerErrorKind::ShutDown),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Transport(TransportErrorKind::StreamingUnsupported) => {
                write!(f, "SSE Error: transport does not support streaming responses")
            }
            ErrorKind::Session(SessionErrorKind::Entropy) => {
                write!(f, "SSE Error: failed to generate a session id")
            }
            ErrorKind::Broker(BrokerErrorKind::ShutDown) => {
                write!(f, "SSE Error: broker is shut down")
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<rand::Error> for Error {
    fn from(err: rand::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Session(SessionErrorKind::Entropy),
        }
    }
}
