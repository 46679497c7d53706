//! Framing error type.

use thiserror::Error;

/// Errors raised while decoding or encoding frames.
///
/// Every variant except [`StompError::Io`] is a protocol violation by the
/// peer; the connection that produced it is not recoverable.
#[derive(Debug, Error)]
pub enum StompError {
    /// The underlying byte stream failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame (or its declared body) exceeds the configured maximum.
    #[error("frame too large: {size} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Observed or declared size.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// The command line named no known command.
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    /// A header line was not `key:value`.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// A header contained an undefined escape sequence or a raw colon.
    #[error("invalid header escape in {0:?}")]
    InvalidEscape(String),

    /// `content-length` was not a non-negative integer.
    #[error("invalid content-length: {0:?}")]
    InvalidContentLength(String),

    /// The body declared by `content-length` was not followed by NUL.
    #[error("frame body not terminated by NUL")]
    MissingTerminator,

    /// Command or header bytes were not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// The stream ended in the middle of a frame.
    #[error("stream closed mid-frame ({0} bytes buffered)")]
    Truncated(usize),

    /// A `heart-beat` header was not `<cx>,<cy>`.
    #[error("invalid heart-beat header: {0:?}")]
    InvalidHeartBeat(String),
}

impl StompError {
    /// Whether the error came from the peer violating the framing rules.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, Self::Io(_) | Self::Truncated(_))
    }
}

/// Result type for framing operations.
pub type Result<T> = std::result::Result<T, StompError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_too_large_display() {
        let err = StompError::FrameTooLarge { size: 10, limit: 5 };
        assert_eq!(err.to_string(), "frame too large: 10 bytes exceeds limit of 5");
    }

    #[test]
    fn io_is_not_protocol_violation() {
        let err: StompError = std::io::Error::other("reset").into();
        assert!(!err.is_protocol_violation());
        assert!(StompError::MissingTerminator.is_protocol_violation());
    }
}
