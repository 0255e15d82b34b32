//! The server context and its frame driver.
//!
//! [`Server`] owns everything: the per-map [`FrameState`], the process-wide
//! [`StaticState`] with both fixed tables, the transport and the game module.
//! One call to [`Server::frame`] is one host tick; it runs the steps below
//! strictly in order and is the only place time advances:
//!
//! 1. time-outs, 2. drain the transport, 3. hold back when the simulation is
//! ahead of real time, 4. pings and command budgets, 5. the game frame,
//! 6. per-client datagrams, 7. demo recording, 8. one-shot event cleanup,
//! 9. master server upkeep.
//!
//! Operations that replace the map or stop the server are queued by the
//! console and only applied once the current frame is done.

use crate::client::{ClientRecord, ClientState};
use crate::client_manager::ClientTable;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::game::GameModule;
use crate::master::{MasterList, HEARTBEAT_MSEC};
use crate::state::{FrameState, ServerState, StaticState};
use crate::transport::Transport;
use log::{debug, error, info, warn};
use shared::netchan::peek_qport;
use shared::{oob, ServerMessage, CS_MAPNAME, CS_MAXCLIENTS, CS_NAME, FRAME_MSEC};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Work deferred to the end of the current frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    Map(String),
    Kill,
}

pub struct Server<T: Transport, G: GameModule> {
    pub(crate) config: ServerConfig,
    pub(crate) transport: T,
    pub(crate) game: G,
    pub(crate) sv: FrameState,
    pub(crate) svs: StaticState,
    pub(crate) masters: MasterList,
    pub(crate) pending: Option<PendingAction>,
}

impl<T: Transport, G: GameModule> Server<T, G> {
    pub fn new(config: ServerConfig, transport: T, game: G) -> Self {
        let svs = StaticState::new(config.max_clients);
        let masters = MasterList::new(config.masters.clone());
        Self {
            config,
            transport,
            game,
            sv: FrameState::new(),
            svs,
            masters,
            pending: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn clients(&self) -> &ClientTable {
        &self.svs.clients
    }

    pub fn client(&self, slot: usize) -> Option<&ClientRecord> {
        self.svs.clients.get(slot)
    }

    pub fn frame_state(&self) -> &FrameState {
        &self.sv
    }

    pub fn is_initialized(&self) -> bool {
        self.svs.initialized
    }

    pub fn real_time(&self) -> u64 {
        self.svs.real_time
    }

    pub fn spawn_count(&self) -> u32 {
        self.svs.spawn_count
    }

    pub fn last_heartbeat(&self) -> Option<u64> {
        self.svs.last_heartbeat
    }

    pub fn is_recording(&self) -> bool {
        self.svs.demo.is_some()
    }

    pub fn game(&self) -> &G {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut G {
        &mut self.game
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Changes master address `index` (0-based); picked up on the next frame.
    ///
    /// Only literal `ip[:port]` settings are used. Host names have to go
    /// through [`lookup_masters`](crate::master::lookup_masters) first.
    pub fn set_master(&mut self, index: usize, address: &str) -> bool {
        self.masters.set(index, address)
    }

    /// Pausing only stops the simulation on a single-player server.
    pub fn set_paused(&mut self, paused: bool) {
        self.sv.paused = paused;
    }

    /// Loads `map`, starting the server if needed.
    ///
    /// Every map load bumps the spawn count. Clients already in the game are
    /// told to reconnect and fall back to CONNECTED until they begin again.
    pub fn spawn_map(&mut self, map: &str, attract_loop: bool) -> Result<(), ServerError> {
        info!("------- Server Initialization -------");
        if !self.svs.initialized {
            self.svs.initialized = true;
            self.svs.last_heartbeat = None;
        }
        if attract_loop {
            self.sv.paused = false;
        }

        self.svs.spawn_count += 1;
        if let Some(demo) = self.svs.demo.take() {
            info!("Stopped server demo after {} frames on map change", demo.frames());
            if let Err(e) = demo.finish() {
                error!("Failed to finish server demo: {}", e);
            }
        }

        for client in self.svs.clients.iter_mut() {
            if client.state > ClientState::Connected {
                client.state = ClientState::Connected;
            }
            if client.is_active() {
                client.send_reliable(ServerMessage::Reconnect);
            }
            // Frame numbers start over with the new map.
            client.last_frame = 0;
            client.frames = Default::default();
        }

        self.sv = FrameState::new();
        self.sv.name = map.to_string();
        self.sv.attract_loop = attract_loop;
        self.sv.state = ServerState::Loading;
        self.sv.set_config_string(CS_NAME, map);
        self.sv.set_config_string(CS_MAPNAME, map);
        self.sv.set_config_string(CS_MAXCLIENTS, &self.config.max_clients.to_string());
        self.svs.frame_clock = 0;

        self.game.spawn_entities(map)?;
        self.sv.baselines = self.game.baselines();
        self.sv.baselines.sort_by_key(|b| b.number);
        self.sv.state = ServerState::Game;

        info!("Map {} loaded, spawn count {}", map, self.svs.spawn_count);
        Ok(())
    }

    /// Runs one host frame of `msec` milliseconds.
    ///
    /// A game module failure shuts the server down with a final message to
    /// every client before the error is returned.
    pub fn frame(&mut self, msec: u64) -> Result<(), ServerError> {
        match self.run_frame_steps(msec) {
            Err(ServerError::Game(e)) => {
                error!("Game module failure: {}", e);
                self.shutdown(&format!("Server fatal crashed: {}\n", e), false);
                Err(ServerError::Game(e))
            }
            other => other,
        }
    }

    fn run_frame_steps(&mut self, msec: u64) -> Result<(), ServerError> {
        if !self.svs.initialized {
            return Ok(());
        }

        self.svs.real_time += msec;
        self.svs.frame_clock += msec;

        let now = self.svs.real_time;
        let timeout_ms = self.config.timeout_ms();
        let zombie_ms = self.config.zombie_ms();
        for slot in self
            .svs
            .clients
            .check_timeouts(now, timeout_ms, zombie_ms, &mut self.game)?
        {
            info!("Client in slot {} timed out", slot);
        }

        self.read_packets()?;

        if !self.config.timedemo && self.svs.frame_clock < self.sv.time {
            // Never let the clock fall more than one frame behind.
            if self.sv.time - self.svs.frame_clock > FRAME_MSEC {
                self.svs.frame_clock = self.sv.time - FRAME_MSEC;
            }
            return self.apply_pending();
        }

        self.svs.clients.calc_pings(&mut self.game);
        self.svs.clients.give_msec(self.sv.frame_num);

        self.run_game_frame()?;

        self.send_client_messages()?;

        self.record_demo_message();

        self.game.clear_events();

        if self.config.dedicated && self.config.public {
            if self.masters.is_modified() {
                self.init_master();
            }
            self.master_heartbeat();
        }

        self.apply_pending()
    }

    fn run_game_frame(&mut self) -> Result<(), ServerError> {
        if self.sv.paused && self.config.max_clients == 1 {
            return Ok(());
        }

        self.sv.advance();
        self.game.run_frame(self.sv.frame_num, self.sv.time)?;

        // Never get more than one frame ahead.
        if self.sv.time < self.svs.frame_clock {
            self.svs.frame_clock = self.sv.time;
        }
        Ok(())
    }

    /// Drains the transport, routing each datagram to the connectionless
    /// handler or to the client slot that owns it.
    fn read_packets(&mut self) -> Result<(), ServerError> {
        loop {
            let (from, data) = match self.transport.get_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => return Ok(()),
                Err(e) => {
                    error!("Error receiving packet: {}", e);
                    return Ok(());
                }
            };

            if oob::is_connectionless(&data) {
                self.connectionless_packet(from, &data)?;
                continue;
            }

            let Some(qport) = peek_qport(&data) else {
                debug!("Runt packet from {}", from);
                continue;
            };
            let Some(slot) = self.svs.clients.find_by_address(from, qport) else {
                debug!("Sequenced packet from unknown address {}", from);
                continue;
            };

            let now = self.svs.real_time;
            let client = &mut self.svs.clients[slot];
            let Some(chan) = client.netchan.as_mut() else {
                continue;
            };

            match chan.process(&data, now) {
                Ok(Some(messages)) => {
                    if chan.remote_address.port() != from.port() {
                        warn!("Fixing up a translated port for {}", from);
                        chan.remote_address = from;
                    }
                    if client.state != ClientState::Zombie {
                        client.last_message = now;
                        self.execute_client_messages(slot, messages)?;
                    }
                }
                Ok(None) => debug!("Out of order packet from {}", from),
                Err(e) => {
                    warn!("Illegal packet from {}: {}", from, e);
                    self.svs.clients.drop_client(slot, &mut self.game, now)?;
                }
            }
        }
    }

    fn record_demo_message(&mut self) {
        let Some(demo) = self.svs.demo.as_mut() else {
            return;
        };
        let update = shared::FrameUpdate {
            server_frame: self.sv.frame_num as i32,
            delta_frame: -1,
            entities: self.game.entity_states(0),
            removed: Vec::new(),
        };
        if let Err(e) = demo.write_frame(update) {
            error!("Server demo write failed, recording stopped: {}", e);
            self.svs.demo = None;
        }
    }

    fn apply_pending(&mut self) -> Result<(), ServerError> {
        match self.pending.take() {
            Some(PendingAction::Map(map)) => self.spawn_map(&map, false),
            Some(PendingAction::Kill) => {
                self.shutdown("Server was killed.\n", false);
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub(crate) fn send_oob(&mut self, to: SocketAddr, text: &str) {
        let packet = oob::encode(text);
        if let Err(e) = self.transport.send_packet(to, &packet) {
            error!("Failed to send to {}: {}", to, e);
        }
    }

    /// Resolves the master list and pings each master. The next frame
    /// sends a heartbeat right away.
    pub(crate) fn init_master(&mut self) {
        for address in self.masters.resolve() {
            self.send_oob(address, "ping");
        }
        self.svs.last_heartbeat = None;
    }

    pub(crate) fn master_heartbeat(&mut self) {
        if !self.config.dedicated || !self.config.public {
            return;
        }

        let now = self.svs.real_time;
        if let Some(last) = self.svs.last_heartbeat {
            let last = last.min(now);
            self.svs.last_heartbeat = Some(last);
            if now - last < HEARTBEAT_MSEC {
                return;
            }
        }
        self.svs.last_heartbeat = Some(now);

        let text = format!("heartbeat\n{}", self.status_string());
        let masters: Vec<SocketAddr> = self.masters.addresses().collect();
        for address in masters {
            info!("Sending heartbeat to {}", address);
            self.send_oob(address, &text);
        }
    }

    fn shutdown_master(&mut self) {
        if !self.config.dedicated || !self.config.public {
            return;
        }
        let masters: Vec<SocketAddr> = self.masters.addresses().collect();
        for address in masters {
            info!("Sending shutdown to {}", address);
            self.send_oob(address, "shutdown");
        }
    }

    /// Sends `message` straight to every connected client, twice, followed
    /// by a reconnect or disconnect.
    fn final_message(&mut self, message: &str, reconnect: bool) {
        let messages = [
            ServerMessage::Print {
                level: shared::PrintLevel::High,
                text: message.to_string(),
            },
            if reconnect {
                ServerMessage::Reconnect
            } else {
                ServerMessage::Disconnect
            },
        ];

        let now = self.svs.real_time;
        for _ in 0..2 {
            for client in self.svs.clients.iter_mut() {
                if !client.is_active() {
                    continue;
                }
                let Some(chan) = client.netchan.as_mut() else {
                    continue;
                };
                match chan.transmit(&messages, now) {
                    Ok(packet) => {
                        if let Err(e) = self.transport.send_packet(chan.remote_address, &packet) {
                            error!("Failed to send final message to {}: {}", chan.remote_address, e);
                        }
                    }
                    Err(e) => error!("Failed to build final message: {}", e),
                }
            }
        }
    }

    /// Stops the server: final message to every client, `shutdown` to the
    /// masters, then all state is released. The wall clock keeps running.
    pub fn shutdown(&mut self, message: &str, reconnect: bool) {
        if !self.svs.initialized {
            return;
        }
        info!("------- Server Shutdown -------");

        self.final_message(message, reconnect);
        self.shutdown_master();

        if let Some(demo) = self.svs.demo.take() {
            if let Err(e) = demo.finish() {
                error!("Failed to finish server demo: {}", e);
            }
        }

        let real_time = self.svs.real_time;
        let spawn_count = self.svs.spawn_count;
        self.sv = FrameState::new();
        self.svs = StaticState::new(self.config.max_clients);
        self.svs.real_time = real_time;
        self.svs.spawn_count = spawn_count;
        self.pending = None;
    }

    /// Drives frames from a tokio interval until the server stops or
    /// Ctrl+C arrives.
    pub async fn run(&mut self, tick: Duration) -> Result<(), ServerError> {
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let mut last_frame = Instant::now();
        info!("Server started successfully");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let elapsed = last_frame.elapsed().as_millis() as u64;
                    last_frame += Duration::from_millis(elapsed);
                    self.frame(elapsed)?;
                    if !self.svs.initialized {
                        info!("Server stopped");
                        return Ok(());
                    }
                }
                _ = &mut ctrl_c => {
                    info!("Received Ctrl+C, shutting down gracefully...");
                    self.shutdown("Server quit\n", false);
                    return Ok(());
                }
            }
        }
    }
}
