//! Settings sections.

use courier_core::constants::{
    DEFAULT_CALL_TIMEOUT_MS, DEFAULT_INCOMING_HEARTBEAT_MS, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_NR_RETRIES, DEFAULT_OUTGOING_HEARTBEAT_MS, DEFAULT_PORT,
    DEFAULT_RECONNECT_INTERVAL_MS, DEFAULT_REQUEST_DESTINATION, DEFAULT_RESPONSE_DESTINATION,
};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CourierSettings {
    /// Listener and connection handling.
    pub server: ServerSettings,
    /// Bounded dispatcher sizing.
    pub executor: ExecutorSettings,
    /// Client connection behaviour.
    pub client: ClientSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl CourierSettings {
    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.executor.workers == 0 {
            return Err(SettingsError::InvalidValue(
                "executor.workers must be at least 1".into(),
            ));
        }
        if self.server.max_frame_size < 1024 {
            return Err(SettingsError::InvalidValue(
                "server.maxFrameSize must be at least 1024".into(),
            ));
        }
        if self.server.send_queue_size == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueSize must be at least 1".into(),
            ));
        }
        if self.server.request_destination.is_empty() || self.server.response_destination.is_empty()
        {
            return Err(SettingsError::InvalidValue(
                "server destinations must not be empty".into(),
            ));
        }
        if self.server.tls.cert_path.is_some() != self.server.tls.key_path.is_some() {
            return Err(SettingsError::InvalidValue(
                "server.tls requires both certPath and keyPath".into(),
            ));
        }
        Ok(())
    }
}

/// Server listener settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Destination RPC requests are sent to.
    pub request_destination: String,
    /// Default destination of RPC responses.
    pub response_destination: String,
    /// Largest accepted frame in bytes.
    pub max_frame_size: usize,
    /// Outbound frames buffered per connection before deliveries are dropped.
    pub send_queue_size: usize,
    /// Time allowed between accept and the CONNECT frame (ms).
    pub handshake_timeout_ms: u64,
    /// Grace period for in-flight calls at shutdown (ms).
    pub shutdown_grace_ms: u64,
    /// Secure channel material.
    pub tls: TlsSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            request_destination: DEFAULT_REQUEST_DESTINATION.to_string(),
            response_destination: DEFAULT_RESPONSE_DESTINATION.to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            send_queue_size: 1024,
            handshake_timeout_ms: 10_000,
            shutdown_grace_ms: 30_000,
            tls: TlsSettings::default(),
        }
    }
}

/// PEM file locations. TLS is enabled when both are set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsSettings {
    /// Certificate chain (PEM).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<String>,
    /// Private key (PEM).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

impl TlsSettings {
    /// Whether both files are configured.
    pub fn enabled(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }
}

/// Bounded dispatcher settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorSettings {
    /// Worker count.
    pub workers: usize,
    /// Tasks that may wait for a worker.
    pub queue_size: usize,
    /// Per-task execution deadline (ms).
    pub task_timeout_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_size: 256,
            task_timeout_ms: 60_000,
        }
    }
}

/// Client connection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Silence tolerated from the server before the connection is considered lost (ms).
    pub incoming_heartbeat_ms: u64,
    /// Interval of client heart-beats (ms). `0` disables them.
    pub outgoing_heartbeat_ms: u64,
    /// Reconnect attempts after a lost connection.
    pub nr_retries: u32,
    /// Base reconnect delay (ms).
    pub reconnect_interval_ms: u64,
    /// Upper bound of the reconnect delay (ms).
    pub max_reconnect_interval_ms: u64,
    /// Default call timeout (ms).
    pub call_timeout_ms: u64,
    /// Timeout for TCP connect plus CONNECT/CONNECTED (ms).
    pub connect_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            incoming_heartbeat_ms: DEFAULT_INCOMING_HEARTBEAT_MS,
            outgoing_heartbeat_ms: DEFAULT_OUTGOING_HEARTBEAT_MS,
            nr_retries: DEFAULT_NR_RETRIES,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            max_reconnect_interval_ms: 30_000,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
