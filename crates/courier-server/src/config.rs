//! Server configuration.

use std::time::Duration;

use courier_core::constants::{
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT, DEFAULT_REQUEST_DESTINATION,
    DEFAULT_RESPONSE_DESTINATION,
};
use courier_settings::CourierSettings;
use serde::{Deserialize, Serialize};

/// Configuration for the RPC server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Destination carrying RPC requests.
    pub request_destination: String,
    /// Destination responses are addressed to when a request has no `reply-to`.
    pub response_destination: String,
    /// Largest accepted frame in bytes.
    pub max_frame_size: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_size: usize,
    /// Deadline for the secure-channel upgrade plus CONNECT (ms).
    pub handshake_timeout_ms: u64,
    /// Grace period for in-flight requests at shutdown (ms).
    pub shutdown_grace_ms: u64,
    /// Dispatcher sizing.
    pub executor: ExecutorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            request_destination: DEFAULT_REQUEST_DESTINATION.into(),
            response_destination: DEFAULT_RESPONSE_DESTINATION.into(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            send_queue_size: 1024,
            handshake_timeout_ms: 10_000,
            shutdown_grace_ms: 30_000,
            executor: ExecutorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &CourierSettings) -> Self {
        let s = &settings.server;
        Self {
            host: s.host.clone(),
            port: s.port,
            request_destination: s.request_destination.clone(),
            response_destination: s.response_destination.clone(),
            max_frame_size: s.max_frame_size,
            send_queue_size: s.send_queue_size,
            handshake_timeout_ms: s.handshake_timeout_ms,
            shutdown_grace_ms: s.shutdown_grace_ms,
            executor: ExecutorConfig::from_settings(settings),
        }
    }

    /// `host:port`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Bounded dispatcher sizing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorConfig {
    /// Worker count.
    pub workers: usize,
    /// Tasks allowed to wait for a worker.
    pub queue_size: usize,
    /// Per-task deadline (ms).
    pub task_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_size: 256,
            task_timeout_ms: 60_000,
        }
    }
}

impl ExecutorConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &CourierSettings) -> Self {
        let e = &settings.executor;
        Self {
            workers: e.workers,
            queue_size: e.queue_size,
            task_timeout_ms: e.task_timeout_ms,
        }
    }

    /// Workers actually started; a pool always has at least one.
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    /// Tasks admitted at once: running plus queued.
    pub fn capacity(&self) -> usize {
        self.worker_count() + self.queue_size
    }

    /// Per-task deadline.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 54321);
        assert_eq!(cfg.request_destination, "jms.topic.vdsm_requests");
        assert_eq!(cfg.bind_addr(), "127.0.0.1:54321");
        assert_eq!(cfg.executor.capacity(), 264);
    }

    #[test]
    fn from_settings_copies_sections() {
        let mut settings = CourierSettings::default();
        settings.server.port = 4000;
        settings.server.host = "10.0.0.5".into();
        settings.executor.workers = 2;
        settings.executor.queue_size = 3;
        settings.executor.task_timeout_ms = 1500;

        let cfg = ServerConfig::from_settings(&settings);
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.bind_addr(), "10.0.0.5:4000");
        assert_eq!(cfg.executor.capacity(), 5);
        assert_eq!(cfg.executor.task_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn zero_workers_still_counts_one() {
        let cfg = ExecutorConfig {
            workers: 0,
            queue_size: 2,
            task_timeout_ms: 1000,
        };
        assert_eq!(cfg.worker_count(), 1);
        assert_eq!(cfg.capacity(), 3);
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = ServerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("sendQueueSize"));
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
