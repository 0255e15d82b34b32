use crate::game::GameError;
use shared::ProtocolError;
use thiserror::Error;

/// Errors that escape a server frame.
///
/// Per-packet and per-client problems are handled where they happen and never
/// show up here; what does is either a configuration mistake at startup or a
/// failure the authoritative simulation cannot continue past.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Game(#[from] GameError),
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invalid configuration: {0}")]
    Config(String),
}
