//! Out-of-band commands: queries, challenges, connects and remote console.

use crate::admission::ConnectRequest;
use crate::error::ServerError;
use crate::game::GameModule;
use crate::network::Server;
use crate::transport::Transport;
use log::{debug, info, warn};
use shared::{oob, InfoString, MAX_MSGLEN, PROTOCOL_VERSION};
use std::net::SocketAddr;

/// Largest text body of a status reply or a redirected console packet.
pub const OUTPUTBUF_LENGTH: usize = MAX_MSGLEN - 16;

/// Upper bound on packets one rcon command may produce.
pub const MAX_REDIRECT_PACKETS: usize = 16;

/// Collects console output into packet-sized chunks.
#[derive(Debug, Default)]
pub struct Redirect {
    buffer: String,
    packets: Vec<String>,
    truncated: bool,
}

impl Redirect {
    pub fn new() -> Self {
        Self::default()
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if self.packets.len() < MAX_REDIRECT_PACKETS {
            self.packets.push(std::mem::take(&mut self.buffer));
        } else {
            self.buffer.clear();
            self.truncated = true;
        }
    }

    pub fn print(&mut self, text: &str) {
        let capacity = OUTPUTBUF_LENGTH - 1;
        if self.buffer.len() + text.len() > capacity {
            self.flush();
        }
        let mut rest = text;
        while rest.len() > capacity {
            let mut cut = capacity;
            while !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            self.buffer.push_str(&rest[..cut]);
            self.flush();
            rest = &rest[cut..];
        }
        self.buffer.push_str(rest);
    }

    /// Flushes what is left and returns the packet bodies.
    pub fn finish(mut self) -> Vec<String> {
        self.flush();
        if self.truncated {
            warn!("Console output truncated to {} packets", MAX_REDIRECT_PACKETS);
        }
        self.packets
    }
}

/// Compares two byte strings in time that depends only on their lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn int_arg(args: &[String], index: usize) -> i32 {
    args.get(index)
        .and_then(|arg| arg.trim().parse().ok())
        .unwrap_or(0)
}

impl<T: Transport, G: GameModule> Server<T, G> {
    pub(crate) fn connectionless_packet(
        &mut self,
        from: SocketAddr,
        data: &[u8],
    ) -> Result<(), ServerError> {
        let Some(line) = oob::command_line(data) else {
            return Ok(());
        };
        let args = oob::tokenize(&line);
        let Some(command) = args.first() else {
            debug!("Empty connectionless packet from {}", from);
            return Ok(());
        };
        debug!("Packet {}: {}", from, command);

        match command.to_ascii_lowercase().as_str() {
            "status" => {
                let reply = format!("print\n{}", self.status_string());
                self.send_oob(from, &reply);
            }
            "ack" => info!("Ping acknowledge from {}", from),
            "info" => self.info_reply(from, int_arg(&args, 1)),
            "ping" => self.send_oob(from, "ack"),
            "getchallenge" => {
                let challenge = self.svs.challenges.get_or_create(from, self.svs.real_time);
                self.send_oob(from, &format!("challenge {}", challenge));
            }
            "connect" => {
                let request = ConnectRequest {
                    address: from,
                    protocol: int_arg(&args, 1),
                    qport: int_arg(&args, 2) as u16,
                    challenge: int_arg(&args, 3),
                    user_info: args.get(4).cloned().unwrap_or_default(),
                };
                self.handle_connect_request(request)?;
            }
            "rcon" => self.remote_command(from, &line)?,
            _ => warn!("Bad connectionless packet from {}: {}", from, line),
        }
        Ok(())
    }

    /// Server info as a `\key\value` string.
    pub fn server_info(&self) -> InfoString {
        let mut info = InfoString::new();
        let fields = [
            ("hostname", self.config.host_name.clone()),
            ("maxclients", self.config.max_clients.to_string()),
            ("mapname", self.sv.name.clone()),
            ("protocol", PROTOCOL_VERSION.to_string()),
        ];
        for (key, value) in fields {
            if let Err(e) = info.set_value_for_key(key, &value) {
                debug!("Server info key {} left out: {}", key, e);
            }
        }
        info
    }

    /// The text behind `status` replies and heartbeats: the server info line
    /// and one `frags ping "name"` line per connected client, cut on whole
    /// lines to fit one packet.
    pub fn status_string(&self) -> String {
        let mut status = format!("{}\n", self.server_info());
        for client in self.svs.clients.iter().filter(|c| c.is_active()) {
            let line = format!(
                "{} {} \"{}\"\n",
                self.game.client_score(client.entity),
                client.ping,
                client.name
            );
            if status.len() + line.len() >= OUTPUTBUF_LENGTH {
                break;
            }
            status.push_str(&line);
        }
        status
    }

    fn info_reply(&mut self, from: SocketAddr, version: i32) {
        if self.config.max_clients == 1 {
            return;
        }
        let text = if version != PROTOCOL_VERSION {
            format!("{}: wrong version\n", self.config.host_name)
        } else {
            format!(
                "{:>16} {:>8} {:>2}/{:>2}\n",
                self.config.host_name,
                self.sv.name,
                self.svs.clients.active_count(),
                self.config.max_clients
            )
        };
        self.send_oob(from, &format!("info\n{}", text));
    }

    fn rcon_valid(&self, password: &str) -> bool {
        !self.config.rcon_password.is_empty()
            && constant_time_eq(self.config.rcon_password.as_bytes(), password.as_bytes())
    }

    fn remote_command(&mut self, from: SocketAddr, line: &str) -> Result<(), ServerError> {
        let args = oob::tokenize(line);
        let password = args.get(1).map(String::as_str).unwrap_or("");
        let command = oob::args_from(line, 2);

        if !self.rcon_valid(password) {
            warn!("Bad rcon from {}: {}", from, command);
            if self.config.rcon_failure_notice {
                self.send_oob(from, "print\nBad rcon password\n");
            }
            return Ok(());
        }

        info!("Rcon from {}: {}", from, command);
        for packet in self.execute_command(&command)? {
            self.send_oob(from, &format!("print\n{}", packet));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientState;
    use crate::config::ServerConfig;
    use crate::game::testing::RecordingGame;
    use crate::transport::MemoryTransport;

    type TestServer = Server<MemoryTransport, RecordingGame>;

    fn server(config: ServerConfig) -> TestServer {
        let mut server = Server::new(config, MemoryTransport::new(), RecordingGame::default());
        server.spawn_map("q2dm1", false).unwrap();
        server
    }

    fn from() -> SocketAddr {
        "10.0.0.2:27901".parse().unwrap()
    }

    fn ask(server: &mut TestServer, text: &str) -> Vec<String> {
        server.connectionless_packet(from(), &oob::encode(text)).unwrap();
        server
            .transport
            .take_sent()
            .into_iter()
            .filter_map(|(_, data)| oob::body(&data))
            .collect()
    }

    fn fill(server: &mut TestServer, count: usize, name_len: usize) {
        for slot in 0..count {
            let client = &mut server.svs.clients[slot];
            client.state = ClientState::Connected;
            client.entity = slot + 1;
            client.name = format!("{:0>width$}", slot, width = name_len);
        }
    }

    #[test]
    fn test_ping_and_challenge() {
        let mut server = server(ServerConfig::default());
        assert_eq!(ask(&mut server, "ping"), vec!["ack".to_string()]);

        let first = ask(&mut server, "getchallenge");
        let second = ask(&mut server, "GetChallenge");
        assert_eq!(first, second);
        assert!(first[0].starts_with("challenge "));
    }

    #[test]
    fn test_unknown_and_ack_are_silent() {
        let mut server = server(ServerConfig::default());
        assert!(ask(&mut server, "ack").is_empty());
        assert!(ask(&mut server, "frobnicate now").is_empty());
        assert!(ask(&mut server, "").is_empty());
    }

    #[test]
    fn test_status_lists_connected_clients() {
        let mut server = server(ServerConfig {
            host_name: "arena".to_string(),
            ..Default::default()
        });
        fill(&mut server, 2, 4);
        server.svs.clients[1].ping = 42;
        server.svs.clients[1].state = ClientState::Zombie;

        let reply = ask(&mut server, "status");
        assert_eq!(reply.len(), 1);
        let mut lines = reply[0].lines();
        assert_eq!(lines.next(), Some("print"));
        let info = lines.next().unwrap();
        assert!(info.contains(r"\hostname\arena"));
        assert!(info.contains(r"\mapname\q2dm1"));
        assert_eq!(lines.next(), Some("10 0 \"0000\""));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_status_truncates_on_whole_lines() {
        let mut server = server(ServerConfig {
            max_clients: 64,
            ..Default::default()
        });
        fill(&mut server, 64, 40);

        let status = server.status_string();
        assert!(status.len() < OUTPUTBUF_LENGTH);
        assert!(status.ends_with("\"\n"));
        let players = status.lines().count() - 1;
        assert!(players < 64);

        let line_len = status.lines().last().unwrap().len() + 1;
        assert!(status.len() + line_len >= OUTPUTBUF_LENGTH);
    }

    #[test]
    fn test_info_reply() {
        let mut server = server(ServerConfig {
            host_name: "arena".to_string(),
            ..Default::default()
        });
        fill(&mut server, 3, 4);

        let reply = ask(&mut server, &format!("info {}", PROTOCOL_VERSION));
        assert_eq!(reply, vec![format!("info\n{:>16} {:>8}  3/ 8\n", "arena", "q2dm1")]);

        let reply = ask(&mut server, "info 12");
        assert_eq!(reply, vec!["info\narena: wrong version\n".to_string()]);
    }

    #[test]
    fn test_info_silent_in_single_player() {
        let mut server = server(ServerConfig {
            max_clients: 1,
            ..Default::default()
        });
        assert!(ask(&mut server, &format!("info {}", PROTOCOL_VERSION)).is_empty());
    }

    #[test]
    fn test_connect_over_the_wire() {
        let mut server = server(ServerConfig::default());
        let challenge = ask(&mut server, "getchallenge")[0]
            .trim_start_matches("challenge ")
            .parse::<i32>()
            .unwrap();

        let reply = ask(
            &mut server,
            &format!("connect {} 55 {} \"\\name\\wired\"", PROTOCOL_VERSION, challenge),
        );
        assert_eq!(reply, vec!["client_connect".to_string()]);
        assert_eq!(server.svs.clients[0].qport(), Some(55));
        assert_eq!(server.svs.clients[0].name, "wired");
    }

    #[test]
    fn test_rcon_disabled_by_empty_password() {
        let mut server = server(ServerConfig {
            rcon_failure_notice: true,
            ..Default::default()
        });
        assert_eq!(
            ask(&mut server, "rcon \"\" status"),
            vec!["print\nBad rcon password\n".to_string()]
        );
    }

    #[test]
    fn test_bad_rcon_is_silent_by_default() {
        let mut server = server(ServerConfig {
            rcon_password: "secret".to_string(),
            ..Default::default()
        });
        assert!(ask(&mut server, "rcon wrong status").is_empty());
    }

    #[test]
    fn test_rcon_runs_command() {
        let mut server = server(ServerConfig {
            rcon_password: "secret".to_string(),
            ..Default::default()
        });
        let reply = ask(&mut server, "rcon secret say hello there");
        assert_eq!(reply.len(), 1);
        assert!(reply[0].starts_with("print\n"));
    }

    #[test]
    fn test_redirect_splits_output() {
        let mut redirect = Redirect::new();
        let line = format!("{}\n", "x".repeat(99));
        for _ in 0..30 {
            redirect.print(&line);
        }
        let packets = redirect.finish();
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.len() < OUTPUTBUF_LENGTH));
        assert_eq!(packets.iter().map(String::len).sum::<usize>(), 3000);
    }

    #[test]
    fn test_redirect_is_bounded() {
        let mut redirect = Redirect::new();
        redirect.print(&"y".repeat(OUTPUTBUF_LENGTH * (MAX_REDIRECT_PACKETS + 4)));
        assert_eq!(redirect.finish().len(), MAX_REDIRECT_PACKETS);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret!"));
    }
}
