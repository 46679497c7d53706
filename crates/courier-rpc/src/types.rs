//! JSON-RPC 2.0 wire types.

use std::fmt;

use courier_core::ids::CorrelationId;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{self, RESOURCE_EXHAUSTED_REASON};

/// Protocol version marker. Serializes as `"2.0"` and rejects anything else.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Version;

impl Version {
    /// Wire value.
    pub const STR: &'static str = "2.0";
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(Self::STR)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == Self::STR {
            Ok(Self)
        } else {
            Err(de::Error::custom(format!("unsupported jsonrpc version {raw:?}")))
        }
    }
}

/// Correlation token linking a request to its response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
}

impl Id {
    /// A fresh, unique string id.
    pub fn generate() -> Self {
        Self::String(CorrelationId::new().into_inner())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Id {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// Call parameters: positional or named.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    /// `params: [..]`
    Positional(Vec<Value>),
    /// `params: {..}`
    Named(Map<String, Value>),
}

impl Params {
    /// Look a parameter up by position (positional) or name (named).
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        match self {
            Self::Positional(values) => values.get(index),
            Self::Named(map) => map.get(name),
        }
    }

    /// Whether no parameters were passed.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Positional(values) => values.is_empty(),
            Self::Named(map) => map.is_empty(),
        }
    }

    /// Convert into a plain JSON value.
    pub fn into_value(self) -> Value {
        match self {
            Self::Positional(values) => Value::Array(values),
            Self::Named(map) => Value::Object(map),
        }
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Self::Positional(values)
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self::Named(map)
    }
}

/// A call or notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: Version,
    /// Method name.
    pub method: String,
    /// Optional parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    /// Correlation id. Absent (or null) for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

impl JsonRpcRequest {
    /// Build a call expecting a response.
    pub fn call(method: impl Into<String>, params: Option<Params>, id: impl Into<Id>) -> Self {
        Self {
            jsonrpc: Version,
            method: method.into(),
            params,
            id: Some(id.into()),
        }
    }

    /// Build a notification (no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            jsonrpc: Version,
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Build an event notification, stamping `notify_time` (ms since epoch).
    pub fn event(event_id: impl Into<String>, mut params: Map<String, Value>) -> Self {
        let _ = params.insert(
            "notify_time".to_owned(),
            Value::from(chrono::Utc::now().timestamp_millis()),
        );
        Self::notification(event_id, Some(Params::Named(params)))
    }

    /// Whether no response is expected.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Structured error inside a response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorBody {
    /// Create an error body without extra data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Whether the error reports a saturated dispatcher.
    pub fn is_resource_exhausted(&self) -> bool {
        self.code == errors::INTERNAL_ERROR
            && self
                .data
                .as_ref()
                .and_then(|d| d.get("reason"))
                .and_then(Value::as_str)
                == Some(RESOURCE_EXHAUSTED_REASON)
    }
}

impl fmt::Display for RpcErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Result or error of a call. Exactly one is present on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// `result` member.
    Result(Value),
    /// `error` member.
    Error(RpcErrorBody),
}

/// A response to a call.
#[derive(Clone, Debug, PartialEq)]
pub struct JsonRpcResponse {
    /// Id of the originating request. Null when the request id was unreadable.
    pub id: Option<Id>,
    /// Result or error.
    pub outcome: Outcome,
}

impl JsonRpcResponse {
    /// Build a success response.
    pub fn success(id: Option<Id>, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result),
        }
    }

    /// Build an error response.
    pub fn error(id: Option<Id>, error: RpcErrorBody) -> Self {
        Self {
            id,
            outcome: Outcome::Error(error),
        }
    }

    /// Result value, if successful.
    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Result(v) => Some(v),
            Outcome::Error(_) => None,
        }
    }

    /// Error body, if failed.
    pub fn error_body(&self) -> Option<&RpcErrorBody> {
        match &self.outcome {
            Outcome::Result(_) => None,
            Outcome::Error(e) => Some(e),
        }
    }

    /// Convert into `Result`.
    pub fn into_result(self) -> Result<Value, RpcErrorBody> {
        match self.outcome {
            Outcome::Result(v) => Ok(v),
            Outcome::Error(e) => Err(e),
        }
    }
}

impl Serialize for JsonRpcResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("jsonrpc", &Version)?;
        match &self.outcome {
            Outcome::Result(v) => map.serialize_entry("result", v)?,
            Outcome::Error(e) => map.serialize_entry("error", e)?,
        }
        map.serialize_entry("id", &self.id)?;
        map.end()
    }
}

#[derive(Deserialize)]
struct RawResponse {
    #[allow(dead_code)]
    jsonrpc: Version,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
    #[serde(default)]
    id: Option<Id>,
}

/// Distinguish `"result": null` (present) from an absent member.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl<'de> Deserialize<'de> for JsonRpcResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawResponse::deserialize(deserializer)?;
        let outcome = match (raw.result, raw.error) {
            (Some(v), None) => Outcome::Result(v),
            (None, Some(e)) => Outcome::Error(e),
            _ => {
                return Err(de::Error::custom(
                    "response must carry exactly one of result or error",
                ));
            }
        };
        Ok(Self {
            id: raw.id,
            outcome,
        })
    }
}
