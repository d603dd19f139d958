//! Parley - terminal client for a chat session.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use parley_client::{
    ClientConfig, Command, RunOutcome, SessionApi, SessionClient, TerminalProjector, WsTransport,
};

/// Parley chat client
#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Terminal client for Parley chat sessions")]
#[command(version)]
struct Args {
    /// Backend base URL (overrides PARLEY_SERVER_URL)
    #[arg(short, long)]
    server: Option<String>,

    /// Session to join
    #[arg(long, conflicts_with = "new")]
    session: Option<String>,

    /// Create a new session and join it
    #[arg(long)]
    new: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
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
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn parse_command(line: &str) -> Option<Command> {
    match line.trim() {
        "" => None,
        "/end" => Some(Command::End),
        "/retry" => Some(Command::Retry),
        "/quit" | "/exit" => Some(Command::Shutdown),
        text => Some(Command::Send(text.to_string())),
    }
}

async fn run(args: Args) -> anyhow::Result<RunOutcome> {
    let mut config = ClientConfig::from_env().context("invalid client environment")?;
    if let Some(server) = &args.server {
        config.server_url = ClientConfig::new(server)?.server_url;
    }

    let api = SessionApi::new(config.clone())?;
    let session_id = match (args.session, args.new) {
        (Some(id), _) => id,
        (None, true) => api.create_session().await?.session_id,
        (None, false) => anyhow::bail!("pass --session <id> or --new"),
    };
    info!(%session_id, server = %config.server_url, "Joining session");
    println!("Session {session_id}. Commands: /end, /retry, /quit");

    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Some(command) = parse_command(&line) else {
                continue;
            };
            let stop = matches!(command, Command::Shutdown);
            if tx.send(command).await.is_err() || stop {
                break;
            }
        }
    });

    let mut client = SessionClient::new(
        session_id,
        config.reconnect,
        WsTransport::new(config.clone()),
        Arc::new(api),
    );
    let mut projector = TerminalProjector::new(std::io::stdout());
    Ok(client.run(rx, &mut projector).await?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    setup_logging(&args.log_level, args.json_logs);

    match run(args).await {
        Ok(RunOutcome::Ended) => {
            println!("Session ended.");
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::Shutdown) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
