//! Sequenced datagram channel with a single in-flight reliable block.
//!
//! Packet layout:
//!
//! ```text
//! u32  sequence      (high bit set when a reliable block follows)
//! u32  acknowledge   (high bit mirrors the last reliable block received)
//! u16  qport         (client to server only)
//! u16  reliable length + reliable block   (when flagged)
//! ..   unreliable block                   (rest of the datagram)
//! ```
//!
//! Lost reliable blocks are detected when the peer acknowledges a packet sent
//! after the one that carried the block without flipping its reliable bit.
//! Queued reliable messages are only promoted into the in-flight block once
//! the previous block has been acknowledged, so reliable messages arrive in
//! order and exactly once.

use crate::protocol::{decode_messages, encode_messages};
use crate::{ProtocolError, MAX_MSGLEN};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::net::SocketAddr;

const RELIABLE_BIT: u32 = 1 << 31;

/// Size of the sequence, acknowledge and qport words.
pub const CLIENT_HEADER_LEN: usize = 10;
pub const SERVER_HEADER_LEN: usize = 8;

/// Which end of the session owns a channel. Only clients write the qport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Reads the qport out of a client-originated sequenced packet without
/// touching any channel state.
pub fn peek_qport(data: &[u8]) -> Option<u16> {
    if data.len() < CLIENT_HEADER_LEN {
        return None;
    }
    Some(u16::from_le_bytes([data[8], data[9]]))
}

#[derive(Debug)]
pub struct NetChannel<Out, In> {
    pub side: Side,
    pub remote_address: SocketAddr,
    pub qport: u16,

    pub incoming_sequence: u32,
    pub incoming_acknowledged: u32,
    incoming_reliable_acknowledged: bool,
    incoming_reliable_sequence: bool,

    pub outgoing_sequence: u32,
    reliable_sequence: bool,
    last_reliable_sequence: u32,

    /// Packets the peer sent that never arrived, as of the last accepted one.
    pub dropped: u32,
    pub last_received: u64,
    pub last_sent: u64,

    /// Reliable messages queued for the next free reliable block.
    message: Vec<Out>,
    reliable: Vec<Out>,
    _incoming: PhantomData<fn() -> In>,
}

impl<Out, In> NetChannel<Out, In>
where
    Out: Serialize + Clone,
    In: DeserializeOwned,
{
    pub fn new(side: Side, remote_address: SocketAddr, qport: u16, now: u64) -> Self {
        Self {
            side,
            remote_address,
            qport,
            incoming_sequence: 0,
            incoming_acknowledged: 0,
            incoming_reliable_acknowledged: false,
            incoming_reliable_sequence: false,
            outgoing_sequence: 1,
            reliable_sequence: false,
            last_reliable_sequence: 0,
            dropped: 0,
            last_received: now,
            last_sent: now,
            message: Vec::new(),
            reliable: Vec::new(),
            _incoming: PhantomData,
        }
    }

    /// Queues a message for reliable delivery.
    pub fn send_reliable(&mut self, message: Out) {
        self.message.push(message);
    }

    /// True when reliable data is waiting to go out or is still unacknowledged.
    pub fn has_pending_reliable(&self) -> bool {
        !self.message.is_empty() || !self.reliable.is_empty()
    }

    /// Reliable messages not yet acknowledged, oldest first.
    pub fn pending_reliable(&self) -> impl Iterator<Item = &Out> {
        self.reliable.iter().chain(self.message.iter())
    }

    pub fn clear_reliable(&mut self) {
        self.message.clear();
        self.reliable.clear();
    }

    fn header_len(&self) -> usize {
        match self.side {
            Side::Client => CLIENT_HEADER_LEN,
            Side::Server => SERVER_HEADER_LEN,
        }
    }

    /// Number of queued messages that fit in one reliable block.
    fn reliable_prefix(&self) -> Result<usize, ProtocolError> {
        let budget = MAX_MSGLEN - self.header_len() - 2;
        let mut take = 0;
        while take < self.message.len() {
            match encode_messages(&self.message[..=take]) {
                Ok(block) if block.len() <= budget => take += 1,
                Ok(_) | Err(ProtocolError::Overflow) => break,
                Err(e) => return Err(e),
            }
        }
        if take == 0 {
            return Err(ProtocolError::Overflow);
        }
        Ok(take)
    }

    /// Builds the next datagram, carrying the reliable block when it is new
    /// or needs a resend, followed by `unreliable`.
    ///
    /// If the unreliable block does not fit next to the reliable one it is
    /// left out; the caller's datagram is best-effort anyway.
    pub fn transmit(&mut self, unreliable: &[Out], now: u64) -> Result<Vec<u8>, ProtocolError> {
        let mut send_reliable = self.incoming_acknowledged > self.last_reliable_sequence
            && self.incoming_reliable_acknowledged != self.reliable_sequence;

        if self.reliable.is_empty() && !self.message.is_empty() {
            let take = self.reliable_prefix()?;
            self.reliable = self.message.drain(..take).collect();
            self.reliable_sequence = !self.reliable_sequence;
            send_reliable = true;
        }

        let reliable_block = if send_reliable {
            encode_messages(&self.reliable)?
        } else {
            Vec::new()
        };
        if self.header_len() + 2 + reliable_block.len() > MAX_MSGLEN {
            return Err(ProtocolError::Overflow);
        }
        let unreliable_block = match encode_messages(unreliable) {
            Ok(block) => block,
            Err(ProtocolError::Overflow) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut packet = Vec::with_capacity(MAX_MSGLEN);
        let sequence = self.outgoing_sequence | if send_reliable { RELIABLE_BIT } else { 0 };
        let ack = self.incoming_sequence
            | if self.incoming_reliable_sequence {
                RELIABLE_BIT
            } else {
                0
            };
        packet.extend_from_slice(&sequence.to_le_bytes());
        packet.extend_from_slice(&ack.to_le_bytes());
        if self.side == Side::Client {
            packet.extend_from_slice(&self.qport.to_le_bytes());
        }

        self.outgoing_sequence += 1;
        self.last_sent = now;

        if send_reliable {
            packet.extend_from_slice(&(reliable_block.len() as u16).to_le_bytes());
            packet.extend_from_slice(&reliable_block);
            self.last_reliable_sequence = self.outgoing_sequence;
        }

        if packet.len() + unreliable_block.len() <= MAX_MSGLEN {
            packet.extend_from_slice(&unreliable_block);
        }

        Ok(packet)
    }

    /// Accepts an incoming datagram.
    ///
    /// Returns `Ok(None)` for stale or duplicated packets, which leave the
    /// channel untouched. Returns the decoded messages, reliable ones first,
    /// for a packet that advances the sequence.
    pub fn process(&mut self, data: &[u8], now: u64) -> Result<Option<Vec<In>>, ProtocolError> {
        let header_len = match self.side {
            Side::Client => SERVER_HEADER_LEN,
            Side::Server => CLIENT_HEADER_LEN,
        };
        if data.len() < header_len {
            return Err(ProtocolError::Truncated);
        }

        let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let raw_sequence = word(0);
        let raw_ack = word(4);

        let reliable_message = raw_sequence & RELIABLE_BIT != 0;
        let reliable_ack = raw_ack & RELIABLE_BIT != 0;
        let sequence = raw_sequence & !RELIABLE_BIT;
        let ack = raw_ack & !RELIABLE_BIT;

        if sequence <= self.incoming_sequence {
            return Ok(None);
        }

        let mut rest = &data[header_len..];
        let mut messages = Vec::new();
        if reliable_message {
            if rest.len() < 2 {
                return Err(ProtocolError::Truncated);
            }
            let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
            if rest.len() < 2 + len {
                return Err(ProtocolError::Truncated);
            }
            messages.extend(decode_messages::<In>(&rest[2..2 + len])?);
            rest = &rest[2 + len..];
        }
        messages.extend(decode_messages::<In>(rest)?);

        self.dropped = sequence - (self.incoming_sequence + 1);

        if reliable_ack == self.reliable_sequence {
            self.reliable.clear();
        }

        self.incoming_sequence = sequence;
        self.incoming_acknowledged = ack;
        self.incoming_reliable_acknowledged = reliable_ack;
        if reliable_message {
            self.incoming_reliable_sequence = !self.incoming_reliable_sequence;
        }
        self.last_received = now;

        Ok(Some(messages))
    }
}
