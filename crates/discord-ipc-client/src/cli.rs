//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

/// discord-ipc - Talk to a local Discord client over IPC
#[derive(Debug, Parser)]
#[command(name = "discord-ipc")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "DISCORD_IPC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Application client id (overrides the config file)
    #[arg(long, env = "DISCORD_IPC_CLIENT_ID")]
    pub client_id: Option<String>,

    /// IPC endpoint slot to use instead of probing 0-9
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=9))]
    pub pipe: Option<u8>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Perform the handshake and print the READY payload
    Handshake,

    /// Send one frame and print the response
    Send {
        /// Opcode of the outgoing frame
        #[arg(long, default_value_t = 1)]
        op: u32,

        /// JSON body of the frame
        #[arg(value_parser = parse_json)]
        payload: Value,
    },

    /// Print every event as one JSON line until the connection closes
    Listen,
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {}", e))
}
