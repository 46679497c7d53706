//! # courier
//!
//! `courier serve` runs the demo bridge behind the STOMP RPC server.
//! `courier call` sends one request to a running server and prints the response.

#![deny(unsafe_code)]

mod demo;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use courier_client::{ClientConfig, ClientTls, RpcClient};
use courier_rpc::{Id, JsonRpcRequest, Params};
use courier_server::{RpcServer, ServerConfig, TlsConfig};
use courier_settings::CourierSettings;
use serde_json::Value;

/// STOMP-framed JSON-RPC server and client.
#[derive(Parser, Debug)]
#[command(name = "courier", about = "STOMP-framed JSON-RPC server and client")]
struct Cli {
    /// Settings file (defaults to `~/.courier/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the demo methods until interrupted.
    Serve {
        /// Host to bind (overrides settings).
        #[arg(long)]
        host: Option<String>,

        /// Port to bind, 0 for auto-assign (overrides settings).
        #[arg(long)]
        port: Option<u16>,

        /// PEM certificate chain; requires `--tls-key`.
        #[arg(long, requires = "tls_key")]
        tls_cert: Option<PathBuf>,

        /// PEM private key; requires `--tls-cert`.
        #[arg(long, requires = "tls_cert")]
        tls_key: Option<PathBuf>,
    },

    /// Call one method and print the response.
    Call {
        /// Server host.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Server port (defaults to the configured one).
        #[arg(long)]
        port: Option<u16>,

        /// Method name.
        method: String,

        /// Parameters as a JSON array or object.
        #[arg(default_value = "[]")]
        params: String,

        /// Response deadline in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// PEM root certificate; enables TLS.
        #[arg(long)]
        ca: Option<PathBuf>,

        /// Name to verify the server certificate against (defaults to host).
        #[arg(long, requires = "ca")]
        server_name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli.settings.clone().unwrap_or_else(courier_settings::settings_path);
    let settings = courier_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;

    if settings.logging.json {
        courier_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        courier_core::logging::init_subscriber(&settings.logging.level);
    }

    match cli.command {
        Commands::Serve {
            host,
            port,
            tls_cert,
            tls_key,
        } => serve(&settings, host, port, tls_cert.zip(tls_key)).await,
        Commands::Call {
            host,
            port,
            method,
            params,
            timeout_ms,
            ca,
            server_name,
        } => {
            let mut config = ClientConfig::from_settings(&settings);
            config.host = host;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(ca) = ca {
                let name = server_name.unwrap_or_else(|| config.host.clone());
                config = config.with_tls(client_tls(&ca, &name)?);
            }
            let timeout = timeout_ms.map_or_else(|| config.call_timeout(), Duration::from_millis);
            call(config, &method, parse_params(&params)?, timeout).await
        }
    }
}

async fn serve(
    settings: &CourierSettings,
    host: Option<String>,
    port: Option<u16>,
    tls_files: Option<(PathBuf, PathBuf)>,
) -> Result<()> {
    let mut config = ServerConfig::from_settings(settings);
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let tls_files = tls_files.or_else(|| {
        let tls = &settings.server.tls;
        tls.cert_path
            .as_ref()
            .zip(tls.key_path.as_ref())
            .map(|(cert, key)| (PathBuf::from(cert), PathBuf::from(key)))
    });

    let addr = config.bind_addr();
    let server = RpcServer::new(config, Arc::new(demo::registry()));
    let handle = match &tls_files {
        Some((cert, key)) => {
            let tls = TlsConfig::from_files(cert, key).context("Failed to load TLS material")?;
            server.listen_tls(&addr, &tls).await
        }
        None => server.listen().await,
    }
    .context("Failed to bind server")?;

    tracing::info!(
        addr = %handle.local_addr(),
        tls = tls_files.is_some(),
        request_destination = %server.config().request_destination,
        "courier server listening"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    server.shutdown().await;
    Ok(())
}

async fn call(config: ClientConfig, method: &str, params: Option<Params>, timeout: Duration) -> Result<()> {
    let target = format!("{}:{}", config.host, config.port);
    let client = RpcClient::connect(config)
        .await
        .with_context(|| format!("Failed to connect to {target}"))?;

    let request = JsonRpcRequest::call(method, params, Id::generate());
    let result = client.call(request, timeout).await;
    client.close().await;

    let response = result.with_context(|| format!("Call to {method} failed"))?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn client_tls(ca: &Path, server_name: &str) -> Result<ClientTls> {
    let pem = std::fs::read(ca).with_context(|| format!("Failed to read {}", ca.display()))?;
    ClientTls::from_root_pem(&pem, server_name).context("Invalid root certificate")
}

/// Array → positional, object → named, `null` → no params.
fn parse_params(raw: &str) -> Result<Option<Params>> {
    let value: Value = serde_json::from_str(raw).context("params must be JSON")?;
    match value {
        Value::Null => Ok(None),
        Value::Array(values) => Ok(Some(Params::Positional(values))),
        Value::Object(map) => Ok(Some(Params::Named(map))),
        other => bail!("params must be an array or object, got {other}"),
    }
}
