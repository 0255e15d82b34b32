//! Server console commands, reached through `rcon`.

use crate::client::ClientState;
use crate::config::MAX_MASTERS;
use crate::connectionless::Redirect;
use crate::demo::DemoRecorder;
use crate::error::ServerError;
use crate::game::GameModule;
use crate::master::parse_master;
use crate::network::{PendingAction, Server};
use crate::state::ServerState;
use crate::transport::Transport;
use log::{error, info};
use shared::{oob, InfoString, PrintLevel};
use std::path::Path;

/// Demo names are plain file names; no directories, no dots up front.
fn valid_demo_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

fn print_info(out: &mut Redirect, info: &InfoString) {
    for (key, value) in info.pairs() {
        out.print(&format!("{:<20}{}\n", key, value));
    }
}

impl<T: Transport, G: GameModule> Server<T, G> {
    /// Runs one console line and returns its output split into packet
    /// bodies.
    pub fn execute_command(&mut self, line: &str) -> Result<Vec<String>, ServerError> {
        let args = oob::tokenize(line);
        let mut out = Redirect::new();

        let Some(command) = args.first() else {
            return Ok(out.finish());
        };

        match command.to_ascii_lowercase().as_str() {
            "status" => self.status_command(&mut out),
            "kick" => self.kick_command(&args, &mut out)?,
            "heartbeat" => {
                self.svs.last_heartbeat = None;
                out.print("Heartbeat forced\n");
            }
            "serverinfo" => {
                out.print("Server info settings:\n");
                print_info(&mut out, &self.server_info());
            }
            "dumpuser" => self.dump_user_command(&args, &mut out),
            "say" => {
                let text = oob::args_from(line, 1);
                let text = text.trim_matches('"');
                let message = format!("console: {}\n", text);
                self.svs.clients.broadcast_print(PrintLevel::Chat, &message);
                out.print(&message);
            }
            "map" => match args.get(1) {
                Some(map) => {
                    out.print(&format!("Changing map to {}\n", map));
                    self.pending = Some(PendingAction::Map(map.clone()));
                }
                None => out.print("Usage: map <mapname>\n"),
            },
            "setmaster" => self.set_master_command(&args, &mut out),
            "sv" => {
                let reply = self.game.server_command(&args[1..])?;
                match (reply, args.get(1)) {
                    (Some(text), _) => out.print(&text),
                    (None, Some(command)) => {
                        out.print(&format!("Unknown server command \"{}\"\n", command))
                    }
                    (None, None) => out.print("Usage: sv <command>\n"),
                }
            }
            "serverrecord" => self.server_record_command(&args, &mut out),
            "serverstoprecord" => self.server_stop_record_command(&mut out),
            "killserver" => {
                if !self.svs.initialized {
                    out.print("Server is not running.\n");
                } else {
                    out.print("Shutting down the server\n");
                    self.pending = Some(PendingAction::Kill);
                }
            }
            _ => out.print(&format!("Unknown command \"{}\"\n", command)),
        }

        Ok(out.finish())
    }

    /// Resolves a `kick`/`dumpuser` target: a slot number or a player name.
    fn find_player(&self, target: &str, out: &mut Redirect) -> Option<usize> {
        if !target.is_empty() && target.chars().all(|c| c.is_ascii_digit()) {
            let slot = target.parse::<usize>().ok();
            return match slot.and_then(|s| self.svs.clients.get(s).map(|c| (s, c))) {
                Some((slot, client)) if client.is_active() => Some(slot),
                Some((slot, _)) => {
                    out.print(&format!("Client {} is not active\n", slot));
                    None
                }
                None => {
                    out.print(&format!("Bad client slot: {}\n", target));
                    None
                }
            };
        }

        let found = self
            .svs
            .clients
            .iter()
            .position(|c| c.is_active() && c.name == target);
        if found.is_none() {
            out.print(&format!("Userid {} is not on the server\n", target));
        }
        found
    }

    /// Replaces the whole master list. Only literal addresses are taken
    /// here; the next frame pings each master and sends a heartbeat.
    fn set_master_command(&mut self, args: &[String], out: &mut Redirect) {
        if !self.config.dedicated {
            out.print("Only dedicated servers use masters.\n");
            return;
        }
        self.config.public = true;

        let mut settings = Vec::new();
        for setting in &args[1..] {
            if settings.len() == MAX_MASTERS {
                out.print(&format!("Too many masters, {} ignored\n", setting));
                continue;
            }
            match parse_master(setting) {
                Some(address) => {
                    out.print(&format!("Master server at {}\n", address));
                    settings.push(setting.clone());
                }
                None => out.print(&format!("Bad address: {}\n", setting)),
            }
        }
        self.masters.replace_all(&settings);
        self.svs.last_heartbeat = None;
    }

    fn status_command(&self, out: &mut Redirect) {
        if !self.svs.initialized {
            out.print("No server running.\n");
            return;
        }
        out.print(&format!("map : {}\n", self.sv.name));
        out.print("num score ping name            lastmsg address               qport\n");
        out.print("--- ----- ---- --------------- ------- --------------------- -----\n");
        for (slot, client) in self.svs.clients.iter().enumerate() {
            if client.state == ClientState::Free {
                continue;
            }
            let ping = match client.state {
                ClientState::Connected => "CNCT".to_string(),
                ClientState::Zombie => "ZMBI".to_string(),
                _ => client.ping.min(9999).to_string(),
            };
            let address = client.address().map(|a| a.to_string()).unwrap_or_default();
            out.print(&format!(
                "{:>3} {:>5} {:>4} {:<15} {:>7} {:<21} {:>5}\n",
                slot,
                self.game.client_score(client.entity),
                ping,
                client.name,
                self.svs.real_time.saturating_sub(client.last_message),
                address,
                client.qport().unwrap_or(0)
            ));
        }
    }

    fn kick_command(&mut self, args: &[String], out: &mut Redirect) -> Result<(), ServerError> {
        let Some(target) = args.get(1) else {
            out.print("Usage: kick <userid>\n");
            return Ok(());
        };
        let Some(slot) = self.find_player(target, out) else {
            return Ok(());
        };

        let now = self.svs.real_time;
        let name = self.svs.clients[slot].name.clone();
        self.svs
            .clients
            .broadcast_print(PrintLevel::High, &format!("{} was kicked\n", name));
        // Only tell the victim directly if the broadcast missed them.
        if self.svs.clients[slot].state != ClientState::Spawned {
            self.svs.clients[slot].print(PrintLevel::High, "You were kicked from the game\n");
        }
        self.svs.clients.drop_client(slot, &mut self.game, now)?;
        info!("Kicked {} from slot {}", name, slot);
        out.print(&format!("{} was kicked\n", name));
        Ok(())
    }

    fn dump_user_command(&self, args: &[String], out: &mut Redirect) {
        let Some(target) = args.get(1) else {
            out.print("Usage: dumpuser <userid>\n");
            return;
        };
        let Some(slot) = self.find_player(target, out) else {
            return;
        };
        out.print("userinfo\n--------\n");
        print_info(out, &self.svs.clients[slot].user_info);
    }

    fn server_record_command(&mut self, args: &[String], out: &mut Redirect) {
        let Some(name) = args.get(1) else {
            out.print("Usage: serverrecord <demoname>\n");
            return;
        };
        if self.svs.demo.is_some() {
            out.print("Already recording.\n");
            return;
        }
        if self.sv.state != ServerState::Game {
            out.print("You must be in a level to record.\n");
            return;
        }
        if !valid_demo_name(name) {
            out.print(&format!("Bad demo name: {}\n", name));
            return;
        }

        let path = self.config.download_dir.join("demos").join(format!("{}.dm2", name));
        match self.start_demo(&path) {
            Ok(demo) => {
                info!("Recording server demo to {}", path.display());
                out.print(&format!("recording to {}.\n", path.display()));
                self.svs.demo = Some(demo);
            }
            Err(e) => {
                error!("Failed to start server demo {}: {}", path.display(), e);
                out.print(&format!("ERROR: couldn't open {}.\n", path.display()));
            }
        }
    }

    fn start_demo(&self, path: &Path) -> Result<DemoRecorder, ServerError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut demo = DemoRecorder::create(path)?;
        demo.write_header(&self.sv, self.svs.spawn_count)?;
        Ok(demo)
    }

    fn server_stop_record_command(&mut self, out: &mut Redirect) {
        let Some(demo) = self.svs.demo.take() else {
            out.print("Not recording a demo.\n");
            return;
        };
        let frames = demo.frames();
        if let Err(e) = demo.finish() {
            error!("Failed to finish server demo: {}", e);
        }
        out.print(&format!("Completed demo, {} frames.\n", frames));
    }
}
