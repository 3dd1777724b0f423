//! Error taxonomy for the runtime core.
//!
//! Errors that cross the wire are carried as `Error{code, message}` envelopes;
//! [`Error::code`] and [`Error::from_wire`] define the mapping in both
//! directions so a remote failure surfaces on the caller's side as the same
//! variant that was raised on the handler's side.

use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Bad header, content type, or JSON body. Reported on the request's
    /// reply channel rather than logged and dropped.
    #[error("failed to decode message: {0}")]
    MessageDecode(String),

    /// No reply arrived within the request timeout. Raised on the caller's
    /// side; the core never retries.
    #[error("no reply within {0:?}")]
    DeliverTimeout(Duration),

    /// Uncaught failure inside a handler.
    #[error("internal error: {0}")]
    Internal(String),

    /// The running handler task was cancelled by a `Cancel` message or a
    /// client disconnect.
    #[error("cancelled")]
    Cancelled,

    /// Duplicate or reserved agent name, invalid topic, and other setup
    /// mistakes. Surfaces synchronously, never on the wire reply path.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A failure reported by the underlying broker binding.
    #[error("channel error: {0}")]
    Channel(String),
}

impl Error {
    /// The wire code used when this error is transported as an `Error`
    /// message.
    pub fn code(&self) -> &'static str {
        match self {
            Error::MessageDecode(_) => "decode_error",
            Error::DeliverTimeout(_) => "timeout",
            Error::Internal(_) => "internal",
            Error::Cancelled => "cancelled",
            Error::Config(_) => "config",
            Error::Channel(_) => "channel",
        }
    }

    /// Reconstruct an error from its wire form.
    ///
    /// Unknown codes collapse to [`Error::Internal`] so that a newer peer
    /// never makes an older client panic.
    pub fn from_wire(code: &str, message: &str) -> Self {
        match code {
            "decode_error" => Error::MessageDecode(message.to_string()),
            "timeout" => Error::DeliverTimeout(Duration::ZERO),
            "cancelled" => Error::Cancelled,
            "config" => Error::Config(message.to_string()),
            "channel" => Error::Channel(message.to_string()),
            "internal" => Error::Internal(message.to_string()),
            other => Error::Internal(format!("{other}: {message}")),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MessageDecode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip_keeps_the_variant() {
        let errors = [
            Error::MessageDecode("bad json".into()),
            Error::Cancelled,
            Error::Config("duplicate name".into()),
            Error::Internal("boom".into()),
        ];
        for err in errors {
            let back = Error::from_wire(err.code(), &err.to_string());
            assert_eq!(back.code(), err.code());
        }
    }

    #[test]
    fn unknown_code_is_internal() {
        let err = Error::from_wire("some_future_code", "details");
        assert_eq!(err.code(), "internal");
    }
}
