//! The fixed client table and the per-frame bookkeeping over it.
//!
//! The table is an arena of `max_clients` records allocated once. A slot
//! index is the client's identity for the whole connection and maps to
//! entity `slot + 1`. Lookups are linear scans; the table is small and the
//! scan keeps "first free slot" and "same address" semantics obvious.

use crate::client::{ClientRecord, ClientState, COMMAND_MSEC_BUDGET};
use crate::game::{GameError, GameModule};
use log::{debug, info};
use shared::{PrintLevel, ServerMessage};
use std::net::SocketAddr;
use std::ops::{Index, IndexMut};

/// All client slots of the server
///
/// The table provides:
/// - Slot lookup for incoming sequenced packets and reconnects
/// - The drop path shared by kicks, time-outs, overflows and disconnects
/// - Per-frame upkeep: time-outs, pings and the command time budget
/// - Reliable broadcasts to everyone in the game
///
/// It never grows or shrinks; the slot count is fixed at startup.
#[derive(Debug)]
pub struct ClientTable {
    clients: Vec<ClientRecord>,
}

impl ClientTable {
    /// Creates a table of `max_clients` FREE slots
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: (0..max_clients).map(|_| ClientRecord::default()).collect(),
        }
    }

    /// Number of slots, free or not
    pub fn capacity(&self) -> usize {
        self.clients.len()
    }

    pub fn get(&self, slot: usize) -> Option<&ClientRecord> {
        self.clients.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut ClientRecord> {
        self.clients.get_mut(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientRecord> {
        self.clients.iter_mut()
    }

    /// Number of CONNECTED or SPAWNED clients.
    pub fn active_count(&self) -> usize {
        self.clients.iter().filter(|c| c.is_active()).count()
    }

    /// Finds the slot owning a sequenced packet: same IP and same qport.
    /// The port may differ when a NAT box re-mapped it.
    pub fn find_by_address(&self, from: SocketAddr, qport: u16) -> Option<usize> {
        self.clients.iter().position(|c| {
            c.state != ClientState::Free
                && c.address().map(|a| a.ip()) == Some(from.ip())
                && c.qport() == Some(qport)
        })
    }

    /// Finds a slot a reconnecting client may take over: same IP and either
    /// the same qport or the same port.
    pub fn find_reusable(&self, from: SocketAddr, qport: u16) -> Option<usize> {
        self.clients.iter().position(|c| {
            if c.state == ClientState::Free {
                return false;
            }
            match c.address() {
                Some(addr) => {
                    addr.ip() == from.ip() && (c.qport() == Some(qport) || addr.port() == from.port())
                }
                None => false,
            }
        })
    }

    /// Lowest FREE slot. ZOMBIE slots are not reused until their grace
    /// period ends, unless the same client reconnects into them.
    pub fn first_free(&self) -> Option<usize> {
        self.clients.iter().position(|c| c.state == ClientState::Free)
    }

    /// Moves a live client to ZOMBIE.
    ///
    /// Queues a reliable disconnect, tells the game if the client was in the
    /// world, and closes any download. Calling it on a ZOMBIE or FREE slot
    /// does nothing. Returns whether the client was dropped.
    pub fn drop_client(
        &mut self,
        slot: usize,
        game: &mut dyn GameModule,
        now: u64,
    ) -> Result<bool, GameError> {
        let Some(client) = self.clients.get_mut(slot) else {
            return Ok(false);
        };
        if !client.is_active() {
            return Ok(false);
        }

        client.send_reliable(ServerMessage::Disconnect);
        if client.state == ClientState::Spawned {
            game.client_disconnect(client.entity)?;
        }
        client.download = None;
        client.state = ClientState::Zombie;
        client.name.clear();
        // The grace period counts from departure.
        client.last_message = now;
        Ok(true)
    }

    /// Frees zombies past their grace period and drops live clients that
    /// went silent. Returns the slots that timed out this call.
    ///
    /// A `last_message` stamped in the future is pulled back to `now`
    /// first, so a clock reset can never make a client look silent or
    /// keep a zombie alive forever. Everyone in the game hears about each
    /// time-out.
    pub fn check_timeouts(
        &mut self,
        now: u64,
        timeout_ms: u64,
        zombie_ms: u64,
        game: &mut dyn GameModule,
    ) -> Result<Vec<usize>, GameError> {
        let mut timed_out = Vec::new();

        for slot in 0..self.clients.len() {
            let client = &mut self.clients[slot];
            if client.last_message > now {
                client.last_message = now;
            }
            let silent_for = now - client.last_message;

            if client.state == ClientState::Zombie && silent_for > zombie_ms {
                debug!("Slot {} is free again", slot);
                client.state = ClientState::Free;
                continue;
            }

            if client.is_active() && silent_for > timeout_ms {
                let text = format!("{} timed out\n", client.name);
                self.broadcast_print(PrintLevel::High, &text);
                self.drop_client(slot, game, now)?;
                timed_out.push(slot);
            }
        }

        Ok(timed_out)
    }

    /// Recomputes every spawned client's ping and hands it to the game.
    ///
    /// The ping is the mean of the latency samples taken as frames were
    /// acknowledged; frames skipped for rate reasons do not disturb it.
    pub fn calc_pings(&mut self, game: &mut dyn GameModule) {
        for client in self.clients.iter_mut() {
            if client.state != ClientState::Spawned {
                continue;
            }
            client.ping = client.latency.mean();
            game.set_client_ping(client.entity, client.ping);
        }
    }

    /// Refills the command time budget once every 16 frames.
    ///
    /// Every non-FREE client gets `COMMAND_MSEC_BUDGET` milliseconds of
    /// movement to spend until the next refill.
    pub fn give_msec(&mut self, frame_num: u32) {
        if frame_num & 15 != 0 {
            return;
        }
        for client in self.clients.iter_mut() {
            if client.state != ClientState::Free {
                client.command_msec = COMMAND_MSEC_BUDGET;
            }
        }
    }

    /// Reliable print to every spawned client, filtered by message level.
    pub fn broadcast_print(&mut self, level: PrintLevel, text: &str) {
        info!("{}", text.trim_end());
        for client in self.clients.iter_mut() {
            if client.state == ClientState::Spawned {
                client.print(level, text);
            }
        }
    }
}

impl Index<usize> for ClientTable {
    type Output = ClientRecord;

    fn index(&self, slot: usize) -> &ClientRecord {
        &self.clients[slot]
    }
}

impl IndexMut<usize> for ClientTable {
    fn index_mut(&mut self, slot: usize) -> &mut ClientRecord {
        &mut self.clients[slot]
    }
}
