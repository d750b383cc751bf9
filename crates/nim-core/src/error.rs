//! Error taxonomy for device sessions.
//!
//! Every failure a caller can observe is one variant of [`NimError`]. The variants
//! fall into two groups:
//!
//! - **Command-scoped**: `Validation`, `Protocol`, `Timeout`, `UnknownCommand`. These
//!   are returned to the caller of a single command and never affect the session.
//! - **Session-scoped**: `Transport`. The endpoint is gone or the I/O layer failed; the
//!   session is torn down and observers receive `device_disconnected`.
//!
//! The remaining variants describe registry state (`AlreadyConnected`, `NotFound`),
//! shutdown (`Cancelled`) and startup (`Configuration`).

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using [`NimError`].
pub type NimResult<T> = std::result::Result<T, NimError>;

/// Primary error type for the gateway.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NimError {
    /// Parameter out of range or malformed target.
    ///
    /// Raised before any I/O, so nothing reached the wire and the cache is untouched.
    /// The message is shown verbatim to the client, e.g. `value out of range 0-255`.
    #[error("{0}")]
    Validation(String),

    /// The reply did not have the expected echo/body/prompt shape, or the device
    /// answered with an error line.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No prompt arrived within the command deadline.
    ///
    /// The dispatcher slot is released; late bytes are drained before the next write.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Endpoint closed, write failed, or the device was physically removed.
    ///
    /// Fatal for the session and never retried automatically.
    #[error("transport error: {0}")]
    Transport(String),

    /// The session is shutting down and the command was not (or no longer) executed.
    #[error("command cancelled: {0}")]
    Cancelled(String),

    /// A live or connecting session already owns this identifier or endpoint.
    #[error("Device already connected: {0}")]
    AlreadyConnected(String),

    /// No live session with this identifier.
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The driver does not know the requested operation.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Invalid configuration detected at startup or connect time.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl NimError {
    /// Whether the error ends the session it occurred in.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NimError::Transport(_))
    }

    /// Build a validation error for a value outside an inclusive range.
    pub fn out_of_range(name: &str, min: i64, max: i64) -> Self {
        NimError::Validation(format!("{name} out of range {min}-{max}"))
    }
}

impl From<std::io::Error> for NimError {
    fn from(err: std::io::Error) -> Self {
        NimError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_is_fatal() {
        assert!(NimError::Transport("gone".into()).is_fatal());
        assert!(!NimError::Timeout(Duration::from_millis(5)).is_fatal());
        assert!(!NimError::Protocol("bad echo".into()).is_fatal());
        assert!(!NimError::Validation("x".into()).is_fatal());
        assert!(!NimError::Cancelled("closing".into()).is_fatal());
    }

    #[test]
    fn validation_message_is_verbatim() {
        let err = NimError::out_of_range("value", 0, 255);
        assert_eq!(err.to_string(), "value out of range 0-255");
    }

    #[test]
    fn io_errors_become_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged");
        let err: NimError = io.into();
        assert!(err.is_fatal());
    }
}
