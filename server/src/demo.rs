//! Server-side demo recording.
//!
//! A demo is a sequence of length-prefixed records. Each record is a
//! little-endian `u32` byte count followed by one bincode-encoded
//! [`ServerMessage`]. The header repeats what a connecting client receives:
//! server data, config strings and baselines.

use crate::error::ServerError;
use crate::state::FrameState;
use shared::protocol::ServerMessage;
use shared::{FrameUpdate, PROTOCOL_VERSION};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug)]
pub struct DemoRecorder<W: Write = BufWriter<File>> {
    writer: W,
    frames: u32,
}

impl DemoRecorder {
    pub fn create(path: &Path) -> Result<Self, ServerError> {
        let file = File::create(path)?;
        Ok(Self::from_writer(BufWriter::new(file)))
    }
}

impl<W: Write> DemoRecorder<W> {
    pub fn from_writer(writer: W) -> Self {
        Self { writer, frames: 0 }
    }

    fn write_message(&mut self, message: &ServerMessage) -> Result<(), ServerError> {
        let bytes = bincode::serialize(message).map_err(shared::ProtocolError::from)?;
        self.writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.writer.write_all(&bytes)?;
        Ok(())
    }

    /// Writes the connection preamble for the current map.
    pub fn write_header(&mut self, frame: &FrameState, spawn_count: u32) -> Result<(), ServerError> {
        self.write_message(&ServerMessage::ServerData {
            protocol: PROTOCOL_VERSION,
            spawn_count,
            map: frame.name.clone(),
            player_num: 0,
        })?;
        for (index, value) in frame.config_strings.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            self.write_message(&ServerMessage::ConfigString {
                index: index as u16,
                value: value.clone(),
            })?;
        }
        for baseline in &frame.baselines {
            self.write_message(&ServerMessage::Baseline(baseline.clone()))?;
        }
        Ok(())
    }

    pub fn write_frame(&mut self, update: FrameUpdate) -> Result<(), ServerError> {
        self.write_message(&ServerMessage::Frame(update))?;
        self.frames += 1;
        Ok(())
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }

    pub fn finish(mut self) -> Result<W, ServerError> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Reads every record of a demo back. Used by tests and tooling.
pub fn read_demo(mut bytes: &[u8]) -> Result<Vec<ServerMessage>, ServerError> {
    let mut messages = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 4 {
            return Err(shared::ProtocolError::Truncated.into());
        }
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() < 4 + len {
            return Err(shared::ProtocolError::Truncated.into());
        }
        let message = bincode::deserialize(&bytes[4..4 + len]).map_err(shared::ProtocolError::from)?;
        messages.push(message);
        bytes = &bytes[4 + len..];
    }
    Ok(messages)
}
