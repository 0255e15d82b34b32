//! Handling of sequenced messages from connected clients.
//!
//! A packet carries any mix of client messages. They run in order until the
//! client drops out; at most one movement block and a handful of string
//! commands are honoured per packet.

use crate::admission::userinfo_changed;
use crate::client::{ClientRecord, ClientState, Download};
use crate::error::ServerError;
use crate::game::GameModule;
use crate::network::Server;
use crate::transport::Transport;
use log::{debug, info, warn};
use shared::{oob, ClientMessage, InfoString, PrintLevel, ServerMessage, UserCmd, PROTOCOL_VERSION};

/// String commands honoured per packet; the rest are ignored.
pub const MAX_STRINGCMDS: usize = 8;

/// Bytes per download message.
pub const DOWNLOAD_CHUNK: usize = 1024;

/// Download names must stay inside the download directory.
fn valid_download_path(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("..")
        && !name.starts_with('.')
        && !name.starts_with('/')
        && !name.contains('\\')
        && !name.contains(':')
        // Only files inside a subdirectory.
        && name.contains('/')
}

/// Queues the next chunk of the client's download, closing it after the
/// last one.
fn send_download_chunk(client: &mut ClientRecord) {
    let Some(download) = client.download.as_mut() else {
        return;
    };
    let offset = download.offset;
    let end = (offset + DOWNLOAD_CHUNK).min(download.data.len());
    let data = download.data[offset..end].to_vec();
    let size = download.data.len() as u64;
    download.offset = end;
    let done = download.remaining() == 0;
    if done {
        debug!("Download of {} finished", download.name);
    }

    client.send_reliable(ServerMessage::Download {
        size,
        offset: offset as u64,
        data,
    });
    if done {
        client.download = None;
    }
}

impl<T: Transport, G: GameModule> Server<T, G> {
    /// Runs the messages of one accepted packet for `slot`.
    pub(crate) fn execute_client_messages(
        &mut self,
        slot: usize,
        messages: Vec<ClientMessage>,
    ) -> Result<(), ServerError> {
        let mut move_issued = false;
        let mut string_cmds = 0;

        for message in messages {
            match message {
                ClientMessage::Move { last_frame, cmd } => {
                    if move_issued {
                        warn!("Client {} sent two moves in one packet", slot);
                        return Ok(());
                    }
                    move_issued = true;
                    self.client_move(slot, last_frame, cmd)?;
                }
                ClientMessage::UserInfo(text) => self.client_user_info(slot, &text)?,
                ClientMessage::StringCmd(text) => {
                    string_cmds += 1;
                    if string_cmds <= MAX_STRINGCMDS {
                        self.execute_string_command(slot, &text)?;
                    }
                }
                ClientMessage::Begin { spawn_count } => self.client_begin(slot, spawn_count)?,
                ClientMessage::NextDownload => send_download_chunk(&mut self.svs.clients[slot]),
                ClientMessage::Disconnect => {
                    let now = self.svs.real_time;
                    info!("{} disconnected", self.svs.clients[slot].name);
                    self.svs.clients.drop_client(slot, &mut self.game, now)?;
                    return Ok(());
                }
            }

            if self.svs.clients[slot].state == ClientState::Zombie {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Acknowledges a frame and hands the command to the game.
    fn client_move(&mut self, slot: usize, last_frame: i32, cmd: UserCmd) -> Result<(), ServerError> {
        let real_time = self.svs.real_time;
        let client = &mut self.svs.clients[slot];

        if last_frame > client.last_frame {
            client.last_frame = last_frame;
            let acked = client.frame(last_frame);
            if acked.server_frame == last_frame {
                let latency = real_time.saturating_sub(acked.sent_time) as u32;
                client.latency.record(last_frame, latency);
            }
        }

        if client.state != ClientState::Spawned {
            client.last_frame = -1;
            return Ok(());
        }

        client.command_msec -= cmd.msec as i32;
        if client.command_msec < 0 && self.config.enforce_time {
            debug!("Command time underflow from {}", client.name);
        } else {
            self.game.client_think(client.entity, &cmd)?;
        }
        client.last_cmd = cmd;
        Ok(())
    }

    fn client_user_info(&mut self, slot: usize, text: &str) -> Result<(), ServerError> {
        let client = &mut self.svs.clients[slot];
        let mut user_info = match InfoString::parse(text) {
            Ok(info) => info,
            Err(e) => {
                warn!("Ignoring bad userinfo from {}: {}", client.name, e);
                return Ok(());
            }
        };
        if let Some(address) = client.address() {
            if let Err(e) = user_info.set_value_for_key("ip", &address.to_string()) {
                warn!("Ignoring userinfo from {}: {}", client.name, e);
                return Ok(());
            }
        }
        client.user_info = user_info;
        userinfo_changed(client, &mut self.game)?;
        Ok(())
    }

    fn execute_string_command(&mut self, slot: usize, line: &str) -> Result<(), ServerError> {
        let args = oob::tokenize(line);
        let Some(command) = args.first() else {
            return Ok(());
        };

        match command.as_str() {
            "new" => self.send_connection_data(slot),
            "download" => self.begin_download(slot, &args),
            "info" => {
                let mut text = String::new();
                for (key, value) in self.server_info().pairs() {
                    text.push_str(&format!("{:<20}{}\n", key, value));
                }
                self.svs.clients[slot].print(PrintLevel::High, &text);
            }
            _ => {
                let client = &mut self.svs.clients[slot];
                match self.game.client_command(client.entity, &args)? {
                    Some(reply) => client.print(PrintLevel::High, &reply),
                    None => client.print(PrintLevel::High, &format!("Unknown command \"{}\"\n", command)),
                }
            }
        }
        Ok(())
    }

    /// Sends everything a client needs before it can begin: server data,
    /// config strings, baselines and the command to send `begin`.
    fn send_connection_data(&mut self, slot: usize) {
        let client = &mut self.svs.clients[slot];
        if client.state != ClientState::Connected {
            debug!("new from {} ignored, already spawned", client.name);
            return;
        }
        debug!("Sending connection data to {}", client.name);

        client.send_reliable(ServerMessage::ServerData {
            protocol: PROTOCOL_VERSION,
            spawn_count: self.svs.spawn_count,
            map: self.sv.name.clone(),
            player_num: slot as u16,
        });
        for (index, value) in self.sv.config_strings.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            client.send_reliable(ServerMessage::ConfigString {
                index: index as u16,
                value: value.clone(),
            });
        }
        for baseline in &self.sv.baselines {
            client.send_reliable(ServerMessage::Baseline(baseline.clone()));
        }
        client.last_cmd = UserCmd::default();
        client.send_reliable(ServerMessage::StuffText(format!(
            "cmd begin {}\n",
            self.svs.spawn_count
        )));
    }

    fn client_begin(&mut self, slot: usize, spawn_count: u32) -> Result<(), ServerError> {
        if spawn_count != self.svs.spawn_count {
            debug!(
                "begin from {} for spawn count {}, now {}",
                self.svs.clients[slot].name, spawn_count, self.svs.spawn_count
            );
            self.send_connection_data(slot);
            return Ok(());
        }

        let client = &mut self.svs.clients[slot];
        if client.state != ClientState::Connected {
            return Ok(());
        }
        self.game.client_begin(client.entity)?;
        client.state = ClientState::Spawned;
        info!("{} entered the game", client.name);
        Ok(())
    }

    fn begin_download(&mut self, slot: usize, args: &[String]) {
        let name = args.get(1).map(String::as_str).unwrap_or("");
        let requested_offset = args
            .get(2)
            .and_then(|offset| offset.parse::<usize>().ok())
            .unwrap_or(0);

        let client = &mut self.svs.clients[slot];
        client.download = None;

        if !self.config.allow_download || !valid_download_path(name) {
            debug!("Refusing download of {} to {}", name, client.name);
            client.send_reliable(ServerMessage::DownloadRefused);
            return;
        }

        let path = self.config.download_dir.join(name);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                debug!("Couldn't download {} to {}: {}", name, client.name, e);
                client.send_reliable(ServerMessage::DownloadRefused);
                return;
            }
        };

        info!("Downloading {} to {}", name, client.name);
        let offset = requested_offset.min(data.len());
        client.download = Some(Download {
            name: name.to_string(),
            data,
            offset,
        });
        send_download_chunk(client);
    }
}
