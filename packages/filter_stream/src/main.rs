use anyhow::{Context, Result};
use clap::Parser;
use filter_stream::{ClientConfig, ConnectionStatus, InboundBatch, StreamClient, SubscriberId};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "filter-tail")]
#[command(about = "Register stream filters and print every batch they receive")]
struct Cli {
    /// Filter documents: inline JSON, or @path to read one from a file
    #[arg(required = true)]
    filters: Vec<String>,

    /// TOML config file (FILTER_STREAM_* env vars override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stream server host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Stream server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "filter_stream=debug,filter_tail=debug,info"
    } else {
        "filter_stream=info,filter_tail=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let mut config =
        ClientConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(host) = cli.host {
        config.address.host = host;
    }
    if let Some(port) = cli.port {
        config.address.port = port;
    }

    let documents = cli
        .filters
        .iter()
        .map(|arg| read_filter(arg))
        .collect::<Result<Vec<_>>>()?;

    let client = StreamClient::connect(config);
    let handle = client.handle();

    let mut status = handle.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            match current {
                ConnectionStatus::Disconnected { exhausted: true } => {
                    warn!("gave up reconnecting; no further batches will arrive")
                }
                other => info!(status = ?other, "connection status"),
            }
        }
    });

    let mut ids = Vec::with_capacity(documents.len());
    for document in &documents {
        let registration = handle.register(document, print_batch_for)?;
        let id = registration.id().clone();
        match registration.await {
            Ok(()) => info!(subscriber = %id, "registered filter"),
            Err(e) => warn!(subscriber = %id, error = %e, "registered filter, but connect failed"),
        }
        ids.push(id);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("shutting down");
    for id in &ids {
        handle.unregister(id);
    }
    client.shutdown().await;
    Ok(())
}

fn read_filter(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read filter file {path}")),
        None => Ok(arg.to_string()),
    }
}

fn print_batch_for(batch: &InboundBatch) {
    let id = batch
        .subscriber_id()
        .ok()
        .flatten()
        .unwrap_or_else(|| SubscriberId::from("-"));
    let line = match serde_json::to_string(batch) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "failed to serialize batch");
            return;
        }
    };
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{id}\t{line}").and_then(|()| stdout.flush()) {
        debug!(error = %e, "failed to write batch to stdout");
    }
}
