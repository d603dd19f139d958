//! Parley App Server - HTTP API server binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use parley_app_server::{ServerConfig, run_with_shutdown};

/// Parley chat backend
#[derive(Parser)]
#[command(name = "parley-server")]
#[command(about = "HTTP and WebSocket backend for Parley chat sessions")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address (overrides config and PARLEY_LISTEN_ADDR)
    #[arg(short, long)]
    listen: Option<String>,

    /// Session storage directory
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Route echoed prompts through a demo tool call
    #[arg(long)]
    demo_tools: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,
}

fn setup_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

fn load_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::from_env()?,
    };
    if let Some(listen) = &args.listen {
        config.listen_addr = listen.clone();
    }
    if let Some(dir) = &args.storage_dir {
        config.storage_dir = dir.clone();
    }
    if args.demo_tools {
        config.bridge.tool_demo = true;
    }
    Ok(config)
}

async fn shutdown_signal(timeout: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown (timeout: {}s)...", timeout);
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown (timeout: {}s)...", timeout);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    setup_logging(&args.log_level, args.json_logs);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Storing sessions under {}", config.storage_dir.display());
    info!("Press Ctrl+C to stop");

    let timeout = config.shutdown_timeout;
    let server = run_with_shutdown(config, shutdown_signal(timeout));
    let result = tokio::select! {
        result = server => result,
        _ = async {
            shutdown_signal(timeout).await;
            tokio::time::sleep(std::time::Duration::from_secs(timeout)).await;
        } => Err(anyhow::anyhow!("graceful shutdown timed out after {timeout}s")),
    };

    if let Err(e) = result {
        error!("Server error: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("Server stopped");
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "parley-server",
            "--listen",
            "127.0.0.1:9100",
            "--storage-dir",
            "/tmp/parley",
            "--demo-tools",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9100");
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/parley"));
        assert!(config.bridge.tool_demo);
    }
}
