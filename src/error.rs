//! Error model for the `qmp` crate.

use std::time::Duration;

use thiserror::Error;

/// Convenience result type.
pub type Result<T> = std::result::Result<T, Error>;

/// High-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Socket-level failure: refused, reset, EOF while waiting, or use of a
    /// closed connection.
    Transport,
    /// The greeting was missing, malformed, or never arrived.
    Connect,
    /// The capabilities negotiation was rejected or went unanswered.
    Capabilities,
    /// A bounded wait expired.
    Timeout,
    /// A received message could not be decoded into the expected shape.
    Protocol,
    /// The peer answered a command with an `error` object.
    Command,
}

/// Structured error type.
///
/// This type is designed to be:
/// - **diagnosable** (keeps context when available)
/// - **safe by default** (no message payloads in `Display`)
/// - **extensible** (`#[non_exhaustive]`)
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Socket / file I/O error.
    #[error("I/O error: {source}")]
    Io {
        /// Lower-level error.
        #[from]
        source: std::io::Error,
    },

    /// The connection is not open: never connected, or already closed.
    #[error("QMP connection is not open")]
    Closed,

    /// The peer closed the stream while an event was awaited.
    #[error("QMP connection closed by peer")]
    Disconnected,

    /// The greeting was absent or did not identify a QMP server.
    #[error("QMP connect failed: {message}")]
    Connect {
        /// Human readable message.
        message: String,
    },

    /// `qmp_capabilities` was rejected or not answered.
    #[error("QMP capabilities negotiation failed: {message}")]
    Capabilities {
        /// Human readable message.
        message: String,
    },

    /// A bounded wait expired.
    #[error("QMP wait timed out after {timeout:?}")]
    Timeout {
        /// Timeout value.
        timeout: Duration,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {source}")]
    Json {
        /// Lower-level error.
        #[from]
        source: serde_json::Error,
    },

    /// The QMP peer sent an unexpected or invalid message.
    #[error("QMP protocol error: {message}")]
    Protocol {
        /// Human readable message.
        message: String,
    },

    /// QMP returned an error for an `execute` request.
    #[error("QMP command failed: {class}: {desc}")]
    Qmp {
        /// Command name.
        command: String,
        /// QMP error class.
        class: String,
        /// QMP error description.
        desc: String,
    },
}

impl Error {
    /// Returns a coarse error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::Closed | Self::Disconnected => ErrorKind::Transport,
            Self::Connect { .. } => ErrorKind::Connect,
            Self::Capabilities { .. } => ErrorKind::Capabilities,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Json { .. } | Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Qmp { .. } => ErrorKind::Command,
        }
    }

    /// Whether reconnecting from scratch may succeed.
    ///
    /// The engine never retries on its own; this only classifies.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Connect | ErrorKind::Capabilities
        )
    }

    /// Whether this is a write to a peer that has already gone away.
    #[must_use]
    pub fn is_peer_gone(&self) -> bool {
        match self {
            Self::Io { source } => matches!(
                source.kind(),
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    pub(crate) fn capabilities(message: impl Into<String>) -> Self {
        Self::Capabilities {
            message: message.into(),
        }
    }

    pub(crate) fn qmp(
        command: impl Into<String>,
        class: impl Into<String>,
        desc: impl Into<String>,
    ) -> Self {
        Self::Qmp {
            command: command.into(),
            class: class.into(),
            desc: desc.into(),
        }
    }
}
