//! discord-ipc CLI entry point.

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{debug, info};

use discord_ipc_client::cli::{Cli, Command};
use discord_ipc_client::config::ClientConfig;
use discord_ipc_client::error::{ClientError, ClientResult};
use discord_ipc_client::logging::init_logging;
use discord_ipc_client::{Connection, IpcClient, Message, Opcode};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.logging, cli.debug) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            if e.is_disconnect() {
                eprintln!("hint: the connection is no longer usable, run the command again");
            }
            ExitCode::FAILURE
        }
    }
}

/// Reads the config file and applies command-line overrides.
fn load_config(cli: &Cli) -> ClientResult<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load()?,
    };
    if let Some(client_id) = &cli.client_id {
        config.client_id = Some(client_id.clone());
    }
    if cli.pipe.is_some() {
        config.pipe = cli.pipe;
    }
    Ok(config)
}

async fn run(command: Command, config: &ClientConfig) -> ClientResult<()> {
    let client = IpcClient::new(config.require_client_id()?, config.to_options()?);

    match command {
        Command::Handshake => {
            let conn = client.connect().await?;
            print_json(conn.ready())?;
            conn.close().await
        }
        Command::Send { op, payload } => {
            let conn = client.connect().await?;
            if Opcode::expects_reply(op) {
                let response = conn.request(op, &payload).await?;
                print_json(&response)?;
            } else {
                conn.send(op, &payload).await?;
            }
            conn.close().await
        }
        Command::Listen => {
            let printer = Arc::new(|message: Message| {
                if let Ok(line) = serde_json::to_string(&message) {
                    println!("{}", line);
                }
            });
            let conn = client.with_event_handler(&printer).connect().await?;
            info!(path = %conn.path().display(), "listening for events");
            listen(conn).await
        }
    }
}

async fn listen(conn: Connection) -> ClientResult<()> {
    let interrupted = tokio::select! {
        _ = conn.closed() => false,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            true
        }
    };

    if interrupted {
        debug!("interrupted, closing connection");
        conn.close().await
    } else {
        debug!("connection closed by Discord");
        Err(ClientError::PipeClosed)
    }
}

fn print_json<T: Serialize>(value: &T) -> ClientResult<()> {
    let text = serde_json::to_string_pretty(value).map_err(io::Error::from)?;
    println!("{}", text);
    Ok(())
}
