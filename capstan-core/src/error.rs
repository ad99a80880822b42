// Error types for the capstan connection-lifecycle core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A protocol layer asked a connection for an extension type it does
    /// not carry. Raised by the typed accessors on `Connect`.
    #[error("connection does not carry the requested extension type")]
    InvalidConnectionType,

    /// An operation that needs a live transport was invoked after the
    /// connection was shut down or removed from the registry.
    #[error("connection {0} is closed")]
    ConnectionClosed(String),

    /// A lifecycle stage or timeout handler failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// One or more timeout dispatches failed during an inspection sweep.
    /// Every due connection was still processed; only the last failure is
    /// preserved here.
    #[error("inspection completed with errors; last failure: {source}")]
    Inspection {
        #[source]
        source: Box<Error>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a handler failure with a formatted message.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}
