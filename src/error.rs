//! Error types for request-piper.

use thiserror::Error;

use crate::piper::TagId;
use crate::protocol::error_names;

/// Main error type for all piper operations.
#[derive(Debug, Error)]
pub enum PiperError {
    /// I/O error during pipe operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Framing violation on a notification pipe.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The pipe was closed, either logically or because every writer went away.
    #[error("Pipe closed")]
    Closed,

    /// A completion arrived for a tag nobody is waiting on.
    #[error("Unknown tag {0}")]
    UnknownTag(TagId),

    /// A deferral was dropped before it was registered.
    #[error("Deferred call abandoned before registration")]
    Abandoned,

    /// The bus or dispatcher went away.
    #[error("Disconnected")]
    Disconnected,

    /// The calling context cannot defer completion.
    #[error("Deferred completion not supported in this context")]
    DeferUnsupported,

    /// Wire access attempted off the dispatch thread.
    #[error("Wire access from a thread other than the dispatch thread")]
    WrongThread,
}

impl PiperError {
    /// Symbolic error identifier used when this error is turned into an error response.
    pub fn name(&self) -> &'static str {
        match self {
            PiperError::MsgPackDecode(_) => error_names::INVALID_ARGS,
            PiperError::Abandoned => error_names::NO_REPLY,
            PiperError::Disconnected => error_names::DISCONNECTED,
            PiperError::UnknownTag(_) => error_names::UNKNOWN_OBJECT,
            _ => error_names::FAILED,
        }
    }
}

impl From<rustix::io::Errno> for PiperError {
    fn from(errno: rustix::io::Errno) -> Self {
        PiperError::Io(errno.into())
    }
}

/// Result type alias using PiperError.
pub type Result<T> = std::result::Result<T, PiperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_names() {
        assert_eq!(PiperError::Closed.name(), error_names::FAILED);
        assert_eq!(PiperError::Abandoned.name(), error_names::NO_REPLY);
        assert_eq!(
            PiperError::UnknownTag(TagId::NULL).name(),
            error_names::UNKNOWN_OBJECT
        );
    }

    #[test]
    fn test_errno_conversion() {
        let err = PiperError::from(rustix::io::Errno::PIPE);
        assert!(matches!(err, PiperError::Io(_)));
    }
}
