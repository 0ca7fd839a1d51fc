use std::net::SocketAddr;

use thiserror::Error;

/// Errors that may occur in this library.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value does not make sense.
    #[error("Bad configuration. Problem: {0}")]
    BadConfig(String),

    /// The serial device could not be opened.
    #[error("The device `{device}` could not be opened: {source}")]
    OpenFailed {
        /// The device which was attempted opened.
        device: String,

        /// What the serial backend had to say about it.
        source: serialport::Error,
    },

    /// The session is no longer running, so nothing can be sent to it.
    #[error("The session towards `{0}` is closed")]
    SessionClosed(SocketAddr),

    /// The TCP listener could not be set up.
    #[error("Could not listen on TCP port {port}: {source}")]
    Bind {
        /// The requested port.
        port: u16,

        /// The underlying problem.
        source: std::io::Error,
    },

    /// Some other input/output problem.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The message within [`Error::BadConfig`], if that's what this is.
    pub fn try_into_bad_config(self) -> Option<String> {
        match self {
            Error::BadConfig(problem) => Some(problem),
            _ => None,
        }
    }
}
