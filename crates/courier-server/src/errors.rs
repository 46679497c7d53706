//! Server error types.

use thiserror::Error;

/// Errors raised while starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound. Fatal at startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Certificate or key material was rejected.
    #[error("TLS configuration error: {0}")]
    Tls(String),
    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_names_address() {
        let err = ServerError::Bind {
            addr: "127.0.0.1:1".into(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.to_string(), "failed to bind 127.0.0.1:1: in use");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn tls_error_display() {
        let err = ServerError::Tls("no certificates found".into());
        assert_eq!(err.to_string(), "TLS configuration error: no certificates found");
    }
}
