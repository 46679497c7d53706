//! Client error type.

use std::time::Duration;

use courier_rpc::RpcErrorBody;
use courier_rpc::errors::NO_RESPONSE;
use courier_stomp::StompError;

/// Errors surfaced by [`RpcClient`](crate::RpcClient).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No response arrived within the call timeout.
    #[error("no response within {timeout:?}")]
    NoResponse {
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The connection was lost and could not be re-established.
    #[error("disconnected from server")]
    Disconnected,

    /// The client was closed locally.
    #[error("client closed")]
    Closed,

    /// The server answered with an error response.
    #[error("rpc error: {0}")]
    Rpc(RpcErrorBody),

    /// Frames could not be read or written.
    #[error("stomp error: {0}")]
    Stomp(#[from] StompError),

    /// Socket-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Secure-channel setup failed.
    #[error("tls error: {0}")]
    Tls(String),

    /// CONNECT was not answered with CONNECTED.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The server sent an ERROR frame.
    #[error("server error: {0}")]
    Broker(String),

    /// A request could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether the error is a lost connection rather than a call failure.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Closed)
    }

    /// Wire-style error body, where one exists.
    ///
    /// A missing response is reported with the `-27` no-response code.
    pub fn to_error_body(&self) -> Option<RpcErrorBody> {
        match self {
            Self::NoResponse { .. } => Some(RpcErrorBody::new(
                NO_RESPONSE,
                "Message response arrived too late",
            )),
            Self::Rpc(body) => Some(body.clone()),
            _ => None,
        }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_response_maps_to_minus_27() {
        let err = ClientError::NoResponse {
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.to_error_body().unwrap().code, -27);
        assert!(!err.is_disconnect());
    }

    #[test]
    fn disconnect_kinds() {
        assert!(ClientError::Disconnected.is_disconnect());
        assert!(ClientError::Closed.is_disconnect());
        assert!(ClientError::Disconnected.to_error_body().is_none());
    }

    #[test]
    fn rpc_error_body_passes_through() {
        let body = RpcErrorBody::new(-32601, "Method not found");
        let err = ClientError::Rpc(body.clone());
        assert_eq!(err.to_error_body(), Some(body));
        assert!(err.to_string().contains("Method not found"));
    }
}
