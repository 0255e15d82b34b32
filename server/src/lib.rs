//! # Arena Session Server Library
//!
//! This library provides the authoritative session layer of a dedicated arena
//! server. It owns the fixed table of client slots, admits and drops clients,
//! answers connectionless queries, drives the frame loop and talks to master
//! servers. The game rules themselves live behind the [`game::GameModule`]
//! trait and are injected at startup.
//!
//! ## Core Responsibilities
//!
//! ### Admission
//! Connect requests pass a fixed sequence of gates: protocol version, user
//! info validity, attract loop, challenge, reconnect throttle, free slot and
//! finally the game module itself. Every request gets exactly one reply.
//!
//! ### Frame Loop
//! One host frame checks time-outs, drains the socket, runs the game frame
//! at a fixed 100 ms simulation step, then sends each client its snapshot.
//! Simulation time never runs more than one frame ahead of real time.
//!
//! ### Connectionless Queries
//! `status`, `info`, `ping`, `getchallenge`, `connect` and password
//! protected `rcon` are answered out of band, without a session.
//!
//! ### Master Servers
//! A public dedicated server announces itself with a heartbeat carrying its
//! status every five minutes and says `shutdown` when it stops.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Frame Driver
//! All state is owned by one [`network::Server`] value and mutated only from
//! its frame method, so no locking is involved. The async runtime only paces
//! the frames and waits for Ctrl+C.
//!
//! ### Fixed Tables
//! Client slots and challenges are fixed-size tables allocated at startup.
//! A slot is FREE, ZOMBIE, CONNECTED or SPAWNED; a dropped client lingers as
//! a zombie for a grace period so its final reliable data can go out.
//!
//! ### Pluggable Transport
//! Packets flow through the [`transport::Transport`] trait. The binary uses
//! a non-blocking UDP socket; tests use an in-memory transport.
//!
//! ## Module Organization
//!
//! - `network`: the server context, frame driver, shutdown and masters
//! - `admission`: connect gates and user info derivation
//! - `connectionless`: out-of-band commands, status and rcon
//! - `commands`: the rcon console
//! - `client_message`: sequenced messages from connected clients
//! - `send`: per-frame datagrams, rate limiting and keepalives
//! - `snapshot`: per-client frames and delta compression
//! - `client`, `client_manager`: client records and the slot table
//! - `challenge`: the challenge table
//! - `state`, `master`, `demo`, `config`, `error`, `transport`
//! - `game`: the game module seam; `arena` is the bundled implementation
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::arena::ArenaGame;
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use server::transport::UdpTransport;
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let transport = UdpTransport::bind("0.0.0.0:27910").await?;
//!     let game = ArenaGame::new(config.max_clients);
//!
//!     let mut server = Server::new(config, transport, game);
//!     server.spawn_map("q2dm1", false)?;
//!     server.run(Duration::from_millis(10)).await?;
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod arena;
pub mod challenge;
pub mod client;
pub mod client_manager;
pub mod client_message;
pub mod commands;
pub mod config;
pub mod connectionless;
pub mod demo;
pub mod error;
pub mod game;
pub mod master;
pub mod network;
pub mod send;
pub mod snapshot;
pub mod state;
pub mod transport;

pub use error::ServerError;
