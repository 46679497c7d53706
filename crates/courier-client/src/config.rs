//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use courier_core::constants::{
    DEFAULT_CALL_TIMEOUT_MS, DEFAULT_INCOMING_HEARTBEAT_MS, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_NR_RETRIES, DEFAULT_OUTGOING_HEARTBEAT_MS, DEFAULT_PORT,
    DEFAULT_RECONNECT_INTERVAL_MS, DEFAULT_REQUEST_DESTINATION, DEFAULT_RESPONSE_DESTINATION,
};
use courier_core::retry::{DEFAULT_JITTER_FACTOR, DEFAULT_MAX_DELAY_MS, RetryConfig};
use courier_settings::CourierSettings;
use courier_stomp::HeartBeat;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use serde::{Deserialize, Serialize};

use crate::errors::{ClientError, Result};

/// Connection parameters for [`RpcClient`](crate::RpcClient).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Upgrade the connection to TLS before CONNECT. Requires [`tls`](Self::tls).
    pub secure: bool,
    /// Silence tolerated from the server (ms). `0` disables the check.
    pub incoming_heartbeat_ms: u64,
    /// Interval of client heart-beats (ms). `0` disables them.
    pub outgoing_heartbeat_ms: u64,
    /// Reconnect attempts after a lost connection. `0` means none.
    pub nr_retries: u32,
    /// Base reconnect delay (ms).
    pub reconnect_interval_ms: u64,
    /// Upper bound of the reconnect delay (ms).
    pub max_reconnect_interval_ms: u64,
    /// Destination requests are sent to.
    pub request_destination: String,
    /// Destination named in `reply-to`.
    pub response_destination: String,
    /// Default timeout of [`call_method`](crate::RpcClient::call_method) (ms).
    pub call_timeout_ms: u64,
    /// Deadline for TCP connect, TLS and CONNECT/CONNECTED (ms).
    pub connect_timeout_ms: u64,
    /// Largest accepted frame in bytes.
    pub max_frame_size: usize,
    /// Trust anchors for [`secure`](Self::secure) connections.
    #[serde(skip)]
    pub tls: Option<ClientTls>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            secure: false,
            incoming_heartbeat_ms: DEFAULT_INCOMING_HEARTBEAT_MS,
            outgoing_heartbeat_ms: DEFAULT_OUTGOING_HEARTBEAT_MS,
            nr_retries: DEFAULT_NR_RETRIES,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            max_reconnect_interval_ms: DEFAULT_MAX_DELAY_MS,
            request_destination: DEFAULT_REQUEST_DESTINATION.into(),
            response_destination: DEFAULT_RESPONSE_DESTINATION.into(),
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            connect_timeout_ms: 10_000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            tls: None,
        }
    }
}

impl ClientConfig {
    /// Client for `host:port` with default behaviour.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Build from loaded settings: target and destinations from the
    /// `server` section, behaviour from the `client` section.
    pub fn from_settings(settings: &CourierSettings) -> Self {
        let s = &settings.server;
        let c = &settings.client;
        Self {
            host: s.host.clone(),
            port: s.port,
            secure: false,
            incoming_heartbeat_ms: c.incoming_heartbeat_ms,
            outgoing_heartbeat_ms: c.outgoing_heartbeat_ms,
            nr_retries: c.nr_retries,
            reconnect_interval_ms: c.reconnect_interval_ms,
            max_reconnect_interval_ms: c.max_reconnect_interval_ms,
            request_destination: s.request_destination.clone(),
            response_destination: s.response_destination.clone(),
            call_timeout_ms: c.call_timeout_ms,
            connect_timeout_ms: c.connect_timeout_ms,
            max_frame_size: s.max_frame_size,
            tls: None,
        }
    }

    /// Enable TLS with the given trust material.
    #[must_use]
    pub fn with_tls(mut self, tls: ClientTls) -> Self {
        self.secure = true;
        self.tls = Some(tls);
        self
    }

    /// Pair advertised in the CONNECT `heart-beat` header.
    pub fn advertised_heartbeat(&self) -> HeartBeat {
        HeartBeat::for_client(self.outgoing_heartbeat_ms, self.incoming_heartbeat_ms)
    }

    /// Reconnect policy.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.nr_retries,
            base_delay_ms: self.reconnect_interval_ms,
            max_delay_ms: self.max_reconnect_interval_ms,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }

    /// Default call timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Connect deadline.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Trust anchors and expected server name for TLS connections.
#[derive(Clone)]
pub struct ClientTls {
    config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
}

impl ClientTls {
    /// Trust the PEM-encoded certificates in `root_pem` and expect the
    /// server to present a certificate for `server_name`.
    pub fn from_root_pem(root_pem: &[u8], server_name: &str) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in CertificateDer::pem_slice_iter(root_pem) {
            let cert =
                cert.map_err(|e| ClientError::Tls(format!("failed to parse certificate: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| ClientError::Tls(format!("invalid root certificate: {e}")))?;
        }
        if roots.is_empty() {
            return Err(ClientError::Tls("no root certificates found".into()));
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ClientError::Tls(format!("protocol versions: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| ClientError::Tls(format!("invalid server name: {e}")))?;

        Ok(Self {
            config: Arc::new(config),
            server_name,
        })
    }

    pub(crate) fn connector(&self) -> tokio_rustls::TlsConnector {
        tokio_rustls::TlsConnector::from(Arc::clone(&self.config))
    }

    pub(crate) fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }
}

impl std::fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}
