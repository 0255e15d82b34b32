//! Wire-level pieces shared by the arena server and its clients.
//!
//! Everything that both ends of a session must agree on lives here: protocol
//! constants, out-of-band (connectionless) framing, user info strings, the
//! sequenced net channel and the bincode-encoded session messages.

pub mod info;
pub mod netchan;
pub mod oob;
pub mod protocol;

pub use info::InfoString;
pub use netchan::{NetChannel, Side};
pub use protocol::{
    ClientMessage, EntityState, FrameUpdate, PrintLevel, ServerMessage, UserCmd,
};

use thiserror::Error;

pub const PROTOCOL_VERSION: i32 = 34;

pub const PORT_SERVER: u16 = 27910;
pub const PORT_MASTER: u16 = 27900;

/// Largest datagram either side will build.
pub const MAX_MSGLEN: usize = 1400;

pub const MAX_INFO_STRING: usize = 512;
pub const MAX_INFO_KEY: usize = 64;
pub const MAX_INFO_VALUE: usize = 64;

/// Number of historical frames kept per client for delta compression.
pub const UPDATE_BACKUP: usize = 16;
pub const UPDATE_MASK: usize = UPDATE_BACKUP - 1;

/// Length of one server frame in milliseconds.
pub const FRAME_MSEC: u64 = 100;

pub const MAX_CONFIG_STRINGS: usize = 256;
pub const CS_NAME: usize = 0;
pub const CS_MAXCLIENTS: usize = 1;
pub const CS_MAPNAME: usize = 2;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet truncated")]
    Truncated,
    #[error("message exceeds the maximum datagram size")]
    Overflow,
    #[error("invalid info string: {0}")]
    InvalidInfo(&'static str),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}
