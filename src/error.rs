//! Error types shared across the crate.
//!
//! Subsystems with their own failure vocabulary (the WebSocket codec and
//! handshake) define local error enums and convert into [`Error`] at the
//! point where they surface to user callbacks. Everything user-visible is
//! classified by an [`ErrorCode`].

use core::fmt;
use std::io;
use std::sync::Arc;

/// Coarse classification of a failure, stable across the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Not an error.
    NoErr,
    /// Operation is not valid in the object's current state.
    InvalidState,
    /// A caller-supplied parameter was rejected.
    InvalidParam,
    /// The operation failed and will not be retried.
    Failed,
    /// A user-supplied deadline elapsed.
    Timeout,
    /// The poll backend reported an error condition on a descriptor.
    PollError,
    /// The peer closed the connection.
    Closed,
    /// The peer violated the application protocol.
    ProtoError,
    /// The TLS engine failed to establish or continue a session.
    TlsFailed,
    /// The handshake was refused by local policy.
    Rejected,
    /// The requested capability is not compiled in or not available.
    Unsupported,
}

impl ErrorCode {
    /// Short lowercase name, used in log output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoErr => "no_error",
            Self::InvalidState => "invalid_state",
            Self::InvalidParam => "invalid_param",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::PollError => "poll_error",
            Self::Closed => "closed",
            Self::ProtoError => "protocol_error",
            Self::TlsFailed => "tls_failed",
            Self::Rejected => "rejected",
            Self::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type produced by event loop, socket, and connection operations.
#[derive(Debug, Clone)]
pub struct Error {
    code: ErrorCode,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates an error with the given code and no context.
    #[must_use]
    pub const fn new(code: ErrorCode) -> Self {
        Self {
            code,
            context: None,
            source: None,
        }
    }

    /// Attaches a human-readable context string.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Attaches an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Returns true if the code matches.
    #[must_use]
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(ctx) => write!(f, "{}: {ctx}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::TimedOut => ErrorCode::Timeout,
            io::ErrorKind::InvalidInput => ErrorCode::InvalidParam,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ErrorCode::Closed,
            _ => ErrorCode::Failed,
        };
        Self::new(code).with_source(err)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_display_is_stable() {
        assert_eq!(ErrorCode::InvalidState.to_string(), "invalid_state");
        assert_eq!(ErrorCode::ProtoError.to_string(), "protocol_error");
    }

    #[test]
    fn context_shows_in_display() {
        let err = Error::new(ErrorCode::Failed).with_context("connect refused");
        assert_eq!(err.to_string(), "failed: connect refused");
    }

    #[test]
    fn io_error_maps_to_code() {
        let err: Error = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.is(ErrorCode::Closed));
        assert!(std::error::Error::source(&err).is_some());
    }
}
