//! # Arena Client Library
//!
//! A headless client for the arena session server. It is used to query
//! servers, administer them over rcon and to join a game as a scripted
//! player, which makes it handy for load and soak testing.
//!
//! ## Module Organization
//!
//! ### Query Module (`query`)
//! Connectionless requests: `status`, `info`, `ping`, `getchallenge` and
//! `rcon`, plus parsing of the status reply.
//!
//! ### Network Module (`network`)
//! The session side of a connection:
//! - [`network::Session`] is the socket-free protocol state machine. It owns
//!   the net channel, answers the server's handshake, reassembles delta
//!   compressed frames and builds movement packets.
//! - [`network::Connection`] pairs a session with a UDP socket and runs the
//!   challenge and connect exchange before handing over to the session.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Connection;
//! use client::query;
//! use shared::UserCmd;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = "127.0.0.1:27910".parse()?;
//!     let wait = Duration::from_secs(2);
//!
//!     let status = query::status(server, wait).await?;
//!     println!("{} players on {:?}", status.players.len(), status.info.value_for_key("mapname"));
//!
//!     let mut connection = Connection::connect(server, r"\name\bot", 1234, wait).await?;
//!     let cmd = UserCmd { forward_move: 200, ..Default::default() };
//!     connection.run_for(Duration::from_secs(5), &cmd).await?;
//!     connection.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod query;

use shared::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("no reply from {0}")]
    Timeout(std::net::SocketAddr),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("disconnected by server")]
    Disconnected,
}
