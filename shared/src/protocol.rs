use crate::{ProtocolError, MAX_MSGLEN};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Print filtering levels, lowest first.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PrintLevel {
    Low,
    Medium,
    High,
    Chat,
}

impl PrintLevel {
    pub fn as_level(self) -> i32 {
        self as i32
    }
}

/// One client movement command.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct UserCmd {
    pub msec: u8,
    pub buttons: u8,
    pub angles: [i16; 3],
    pub forward_move: i16,
    pub side_move: i16,
    pub up_move: i16,
}

/// Networked state of one entity as seen in a snapshot.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct EntityState {
    pub number: u16,
    pub origin: [f32; 3],
    pub angles: [f32; 3],
    pub model_index: u16,
    pub frame: u16,
    /// One-shot event, visible for exactly one frame.
    pub event: u8,
}

/// A snapshot relative to `delta_frame`, or a full snapshot when
/// `delta_frame` is -1.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FrameUpdate {
    pub server_frame: i32,
    pub delta_frame: i32,
    pub entities: Vec<EntityState>,
    pub removed: Vec<u16>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum ClientMessage {
    Move { last_frame: i32, cmd: UserCmd },
    UserInfo(String),
    StringCmd(String),
    Begin { spawn_count: u32 },
    NextDownload,
    Disconnect,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum ServerMessage {
    ServerData {
        protocol: i32,
        spawn_count: u32,
        map: String,
        player_num: u16,
    },
    Print {
        level: PrintLevel,
        text: String,
    },
    StuffText(String),
    ConfigString {
        index: u16,
        value: String,
    },
    Baseline(EntityState),
    Frame(FrameUpdate),
    Download {
        size: u64,
        offset: u64,
        data: Vec<u8>,
    },
    DownloadRefused,
    Reconnect,
    Disconnect,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_MSGLEN as u64)
}

pub fn encode_messages<M: Serialize>(messages: &[M]) -> Result<Vec<u8>, ProtocolError> {
    if messages.is_empty() {
        return Ok(Vec::new());
    }
    codec().serialize(messages).map_err(|e| {
        if matches!(*e, bincode::ErrorKind::SizeLimit) {
            ProtocolError::Overflow
        } else {
            ProtocolError::Codec(e)
        }
    })
}

/// Decodes one message block. An empty block holds no messages.
pub fn decode_messages<M: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<M>, ProtocolError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    Ok(codec().deserialize(bytes)?)
}
