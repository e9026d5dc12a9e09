use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use futures::stream::{self, StreamExt};
use reqwest::Method;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ratewarden::{HttpClient, WardenConfig};

/// Send rate-limited requests to a remote API.
#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// HTTP method, e.g. GET or POST
    method: String,

    /// Endpoint template relative to the API root, e.g. `channels/{channel_id}`
    template: String,

    /// Path parameter as `name=value`; repeatable
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// JSON request body
    #[arg(short, long)]
    body: Option<String>,

    /// How many times to send the request
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    /// How many requests may be outstanding at once
    #[arg(long, default_value_t = 4)]
    concurrency: usize,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got `{}`", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = WardenConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!(api = ?config.api, "Configuration loaded");

    let method = Method::from_bytes(cli.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| anyhow!("Invalid HTTP method: {}", cli.method))?;
    let body = cli
        .body
        .as_deref()
        .map(|raw| serde_json::from_str::<serde_json::Value>(raw))
        .transpose()
        .context("Request body is not valid JSON")?;

    let client = Arc::new(HttpClient::new(&config)?);
    let params: Vec<(&str, &str)> = cli
        .params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let run = stream::iter(0..cli.repeat)
        .map(|i| {
            let client = client.clone();
            let method = method.clone();
            let body = body.clone();
            let params = &params;
            let template = cli.template.as_str();
            async move { (i, client.request(method, template, params, body).await) }
        })
        .buffer_unordered(cli.concurrency.max(1))
        .fold(0usize, |failures, (i, result)| async move {
            match result {
                Ok(value) => {
                    println!("{}", value);
                    failures
                }
                Err(e) => {
                    error!(request = i, error = %e, "Request failed");
                    failures + 1
                }
            }
        });

    let failures = tokio::select! {
        failures = run => failures,
        _ = shutdown_signal() => {
            info!("Interrupted, abandoning outstanding requests");
            0
        }
    };

    client.shutdown();

    if failures > 0 {
        return Err(anyhow!("{} of {} requests failed", failures, cli.repeat));
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
