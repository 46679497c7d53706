//! Frame body ⇄ JSON-RPC envelope.

use serde::Serialize;
use serde_json::Value;

use crate::errors::RpcError;
use crate::types::{Id, JsonRpcRequest, JsonRpcResponse};

/// One envelope member.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    /// A call or notification.
    Request(JsonRpcRequest),
    /// A response.
    Response(JsonRpcResponse),
}

/// A decoded body.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    /// Single object.
    Single(Message),
    /// Ordered, non-empty batch.
    Batch(Vec<Message>),
}

/// Why a body could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Body is not JSON.
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// JSON is not a request/response envelope.
    #[error("Invalid request: {message}")]
    Invalid {
        /// What is wrong.
        message: String,
        /// Id recovered from the offending object, if readable.
        id: Option<Id>,
    },
}

impl EnvelopeError {
    fn invalid(message: impl Into<String>, id: Option<Id>) -> Self {
        Self::Invalid {
            message: message.into(),
            id,
        }
    }

    /// Matching RPC error.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Self::Parse(e) => RpcError::Parse {
                message: e.to_string(),
            },
            Self::Invalid { message, .. } => RpcError::InvalidRequest {
                message: message.clone(),
            },
        }
    }

    /// Error response to send back for this body.
    pub fn to_response(&self) -> JsonRpcResponse {
        let id = match self {
            Self::Parse(_) => None,
            Self::Invalid { id, .. } => id.clone(),
        };
        JsonRpcResponse::error(id, self.to_rpc_error().to_error_body())
    }
}

/// A decoded body whose batch members keep their own outcome.
#[derive(Debug)]
pub enum Members {
    /// Single object.
    Single(Message),
    /// Ordered, non-empty batch; a malformed member is an `Err` at its position.
    Batch(Vec<Result<Message, EnvelopeError>>),
}

/// Decode a frame body, member by member.
///
/// Only a body that is not JSON, an empty batch, or a malformed single object
/// fails as a whole.
pub fn decode_members(body: &[u8]) -> Result<Members, EnvelopeError> {
    let value: Value = serde_json::from_slice(body)?;
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(EnvelopeError::invalid("empty batch", None));
            }
            Ok(Members::Batch(items.into_iter().map(decode_message).collect()))
        }
        other => decode_message(other).map(Members::Single),
    }
}

/// Decode a frame body.
///
/// Strict: one malformed batch member rejects the whole body. Servers use
/// [`decode_members`] instead.
pub fn decode(body: &[u8]) -> Result<Envelope, EnvelopeError> {
    match decode_members(body)? {
        Members::Single(message) => Ok(Envelope::Single(message)),
        Members::Batch(members) => members
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map(Envelope::Batch),
    }
}

fn decode_message(value: Value) -> Result<Message, EnvelopeError> {
    let Value::Object(map) = &value else {
        return Err(EnvelopeError::invalid("expected a JSON object", None));
    };
    let id = map
        .get("id")
        .and_then(|v| serde_json::from_value::<Id>(v.clone()).ok());

    if map.contains_key("method") {
        serde_json::from_value(value)
            .map(Message::Request)
            .map_err(|e| EnvelopeError::invalid(e.to_string(), id))
    } else if map.contains_key("result") || map.contains_key("error") {
        serde_json::from_value(value)
            .map(Message::Response)
            .map_err(|e| EnvelopeError::invalid(e.to_string(), id))
    } else {
        Err(EnvelopeError::invalid("neither a request nor a response", id))
    }
}

/// Encode an envelope into a body.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(envelope)
}

/// Encode a single response.
pub fn encode_response(response: &JsonRpcResponse) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(response)
}

/// Encode a single request.
pub fn encode_request(request: &JsonRpcRequest) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(request)
}

/// Encode the responses of a batch, preserving order.
///
/// Returns `Ok(None)` when every member was a notification: nothing is sent.
pub fn encode_batch_responses(
    responses: Vec<JsonRpcResponse>,
) -> Result<Option<Vec<u8>>, serde_json::Error> {
    if responses.is_empty() {
        return Ok(None);
    }
    let batch = Envelope::Batch(responses.into_iter().map(Message::Response).collect());
    encode(&batch).map(Some)
}
