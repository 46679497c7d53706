//! RPC error codes and error type.

use serde_json::{Value, json};

use crate::types::RpcErrorBody;

// ── Error code constants ────────────────────────────────────────────

/// Body was not valid JSON.
pub const PARSE_ERROR: i64 = -32700;
/// JSON was not a valid request envelope.
pub const INVALID_REQUEST: i64 = -32600;
/// Method not exposed by the bridge.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid or missing parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Execution failure, handler crash, handler timeout or dispatcher saturation.
pub const INTERNAL_ERROR: i64 = -32603;
/// Client gave up waiting for a response.
pub const NO_RESPONSE: i64 = -27;

/// `error.data.reason` distinguishing dispatcher saturation from other internal errors.
pub const RESOURCE_EXHAUSTED_REASON: &str = "resource_exhausted";

/// RPC error type returned by handlers and by dispatch.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Body was not valid JSON.
    #[error("Parse error: {message}")]
    Parse {
        /// Parser diagnostic.
        message: String,
    },

    /// JSON did not have the request shape.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// What is wrong.
        message: String,
    },

    /// No handler for the method.
    #[error("Method '{method}' not found")]
    MethodNotFound {
        /// Requested method name.
        method: String,
    },

    /// Required parameter missing or wrong type.
    #[error("{message}")]
    InvalidParams {
        /// What is wrong.
        message: String,
    },

    /// Handler or server failure.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },

    /// Dispatcher queue full with every worker busy.
    #[error("{message}")]
    ResourceExhausted {
        /// Description.
        message: String,
    },

    /// Domain-specific error with an arbitrary code.
    #[error("{message}")]
    Custom {
        /// Numeric code.
        code: i64,
        /// Human-readable message.
        message: String,
        /// Optional structured context.
        data: Option<Value>,
    },
}

impl RpcError {
    /// Shorthand for [`RpcError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for [`RpcError::InvalidParams`].
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Wire code for this variant.
    ///
    /// Saturation shares the internal-error code; the error body's `data`
    /// marks it, see [`RpcErrorBody::is_resource_exhausted`].
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse { .. } => PARSE_ERROR,
            Self::InvalidRequest { .. } => INVALID_REQUEST,
            Self::MethodNotFound { .. } => METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::Internal { .. } | Self::ResourceExhausted { .. } => INTERNAL_ERROR,
            Self::Custom { code, .. } => *code,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> RpcErrorBody {
        RpcErrorBody {
            code: self.code(),
            message: self.to_string(),
            data: match self {
                Self::ResourceExhausted { .. } => Some(json!({ "reason": RESOURCE_EXHAUSTED_REASON })),
                Self::Custom { data, .. } => data.clone(),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_codes() {
        assert_eq!(RpcError::Parse { message: "x".into() }.code(), -32700);
        assert_eq!(RpcError::InvalidRequest { message: "x".into() }.code(), -32600);
        assert_eq!(RpcError::MethodNotFound { method: "x".into() }.code(), -32601);
        assert_eq!(RpcError::invalid_params("x").code(), -32602);
        assert_eq!(RpcError::internal("x").code(), -32603);
    }

    #[test]
    fn method_not_found_message() {
        let err = RpcError::MethodNotFound { method: "nope".into() };
        assert_eq!(err.to_string(), "Method 'nope' not found");
    }

    #[test]
    fn resource_exhausted_is_marked_internal() {
        let body = RpcError::ResourceExhausted {
            message: "dispatcher saturated".into(),
        }
        .to_error_body();
        assert_eq!(body.code, INTERNAL_ERROR);
        assert!(body.is_resource_exhausted());
    }

    #[test]
    fn custom_keeps_data() {
        let err = RpcError::Custom {
            code: 100,
            message: "vm down".into(),
            data: Some(json!({"vm": "a"})),
        };
        let body = err.to_error_body();
        assert_eq!(body.code, 100);
        assert_eq!(body.data, Some(json!({"vm": "a"})));
    }

    #[test]
    fn error_body_snapshot() {
        let body = RpcError::MethodNotFound { method: "nope".into() }.to_error_body();
        insta::assert_json_snapshot!(body, @r#"
        {
          "code": -32601,
          "message": "Method 'nope' not found"
        }
        "#);
    }
}
