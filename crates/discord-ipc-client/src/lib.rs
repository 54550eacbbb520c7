//! Client for the Discord local IPC socket.
//!
//! This crate provides endpoint discovery, the platform transport, the
//! protocol engine and the `discord-ipc` command-line interface.
//!
//! # Example
//!
//! ```no_run
//! use discord_ipc_client::{ClientOptions, IpcClient, Opcode};
//! use serde_json::json;
//!
//! # async fn run() -> discord_ipc_client::ClientResult<()> {
//! let client = IpcClient::new("123456789012345678", ClientOptions::default());
//! let conn = client.connect().await?;
//!
//! let reply = conn
//!     .request(Opcode::Frame, &json!({"cmd": "GET_GUILDS", "args": {}, "nonce": "1"}))
//!     .await?;
//! println!("{:?}", reply.data());
//!
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod transport;

pub use client::{ClientOptions, Connection, ConnectionState, EventHandler, IpcClient};
pub use config::ClientConfig;
pub use endpoint::{EndpointResolver, IpcPathResolver};
pub use error::{ClientError, ClientResult};
pub use transport::{Connector, PlatformConnector};

pub use discord_ipc_protocol::{Message, Opcode};
