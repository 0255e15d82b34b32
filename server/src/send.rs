//! Outgoing datagrams, one pass per server frame.

use crate::client::ClientState;
use crate::error::ServerError;
use crate::game::GameModule;
use crate::network::Server;
use crate::snapshot::{build_client_frame, write_frame};
use crate::transport::{is_local_address, Transport};
use log::{error, trace, warn};
use shared::{PrintLevel, ServerMessage};

/// Queued reliable messages a client may fall behind by before it is
/// dropped as overflowed.
pub const MAX_RELIABLE_BACKLOG: usize = 1024;

/// Clients outside the game get a keepalive this often, in milliseconds.
pub const KEEPALIVE_MSEC: u64 = 1000;

impl<T: Transport, G: GameModule> Server<T, G> {
    /// Sends this frame's datagram to every client that is not FREE.
    pub(crate) fn send_client_messages(&mut self) -> Result<(), ServerError> {
        let now = self.svs.real_time;

        for slot in 0..self.svs.clients.capacity() {
            let client = &self.svs.clients[slot];
            if client.state == ClientState::Free {
                continue;
            }
            let backlog = client
                .netchan
                .as_ref()
                .map_or(0, |chan| chan.pending_reliable().count());
            if backlog > MAX_RELIABLE_BACKLOG {
                self.client_overflowed(slot)?;
            }

            if self.svs.clients[slot].state == ClientState::Spawned {
                if self.rate_drop(slot) {
                    continue;
                }
                self.send_client_datagram(slot)?;
            } else {
                let due = self.svs.clients[slot].netchan.as_ref().is_some_and(|chan| {
                    chan.has_pending_reliable() || now.saturating_sub(chan.last_sent) > KEEPALIVE_MSEC
                });
                if due {
                    self.transmit_to(slot, &[])?;
                }
            }
        }
        Ok(())
    }

    /// True when the client already got more than its rate worth of data in
    /// the last second. The skipped frame counts as an empty message.
    fn rate_drop(&mut self, slot: usize) -> bool {
        let frame_num = self.sv.frame_num;
        let client = &mut self.svs.clients[slot];
        if client.address().is_some_and(is_local_address) {
            return false;
        }
        if client.rate_history.total() > client.rate {
            client.suppress_count += 1;
            client.rate_history.set(frame_num, 0);
            trace!("Suppressed a frame for {}", client.name);
            return true;
        }
        false
    }

    /// Builds and sends the frame snapshot plus any queued unreliable data.
    fn send_client_datagram(&mut self, slot: usize) -> Result<(), ServerError> {
        let now = self.svs.real_time;
        let client = &mut self.svs.clients[slot];

        build_client_frame(&self.sv, client, &self.game, now);
        let mut messages = vec![ServerMessage::Frame(write_frame(&self.sv, client))];
        messages.append(&mut client.datagram);

        if let Some(size) = self.transmit_to(slot, &messages)? {
            self.svs.clients[slot]
                .rate_history
                .set(self.sv.frame_num, size as u32);
        }
        Ok(())
    }

    /// Transmits on the client's channel. Returns the datagram size, or
    /// `None` when nothing went out.
    fn transmit_to(
        &mut self,
        slot: usize,
        unreliable: &[ServerMessage],
    ) -> Result<Option<usize>, ServerError> {
        let now = self.svs.real_time;
        let Some(chan) = self.svs.clients[slot].netchan.as_mut() else {
            return Ok(None);
        };

        let packet = match chan.transmit(unreliable, now) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Can't build datagram for slot {}: {}", slot, e);
                self.client_overflowed(slot)?;
                return Ok(None);
            }
        };
        if let Err(e) = self.transport.send_packet(chan.remote_address, &packet) {
            error!("Failed to send to {}: {}", chan.remote_address, e);
        }
        Ok(Some(packet.len()))
    }

    /// Drops a client whose reliable stream can no longer be delivered.
    fn client_overflowed(&mut self, slot: usize) -> Result<(), ServerError> {
        let now = self.svs.real_time;
        let client = &mut self.svs.clients[slot];
        if let Some(chan) = client.netchan.as_mut() {
            chan.clear_reliable();
        }
        client.datagram.clear();

        let text = format!("{} overflowed\n", client.name);
        self.svs.clients.broadcast_print(PrintLevel::High, &text);
        self.svs.clients.drop_client(slot, &mut self.game, now)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientRecord, RATE_MESSAGES};
    use crate::config::ServerConfig;
    use crate::game::testing::RecordingGame;
    use crate::transport::MemoryTransport;
    use shared::{ClientMessage, EntityState, NetChannel, Side};
    use std::net::SocketAddr;

    type TestServer = Server<MemoryTransport, RecordingGame>;
    type ClientEnd = NetChannel<ClientMessage, ServerMessage>;

    fn server() -> TestServer {
        let mut game = RecordingGame::default();
        game.entities = vec![EntityState {
            number: 1,
            origin: [16.0, 0.0, 0.0],
            ..Default::default()
        }];
        let mut server = Server::new(ServerConfig::default(), MemoryTransport::new(), game);
        server.spawn_map("q2dm1", false).unwrap();
        server.sv.advance();
        server
    }

    fn join(server: &mut TestServer, slot: usize, address: &str, state: ClientState) -> SocketAddr {
        let address: SocketAddr = address.parse().unwrap();
        let client = &mut server.svs.clients[slot];
        *client = ClientRecord::default();
        client.state = state;
        client.entity = slot + 1;
        client.name = format!("player{}", slot);
        client.rate = 5000;
        client.netchan = Some(NetChannel::new(Side::Server, address, 3, 0));
        address
    }

    fn client_end() -> ClientEnd {
        NetChannel::new(Side::Client, "10.0.0.1:27910".parse().unwrap(), 3, 0)
    }

    #[test]
    fn test_spawned_client_gets_frame_and_datagram() {
        let mut server = server();
        let address = join(&mut server, 0, "10.0.0.2:27901", ClientState::Spawned);
        let chat = ServerMessage::Print {
            level: PrintLevel::Chat,
            text: "hi\n".to_string(),
        };
        server.svs.clients[0].datagram.push(chat.clone());

        server.send_client_messages().unwrap();

        let sent = server.transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, address);
        let messages = client_end().process(&sent[0].1, 0).unwrap().unwrap();
        match &messages[0] {
            ServerMessage::Frame(update) => {
                assert_eq!(update.server_frame, 1);
                assert_eq!(update.delta_frame, -1);
                assert_eq!(update.entities.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(messages[1], chat);

        let client = &server.svs.clients[0];
        assert!(client.datagram.is_empty());
        assert_eq!(client.frame(1).server_frame, 1);
        assert_eq!(client.rate_history.total(), sent[0].1.len() as u32);
    }

    #[test]
    fn test_rate_limited_client_is_suppressed() {
        let mut server = server();
        join(&mut server, 0, "10.0.0.2:27901", ClientState::Spawned);
        let client = &mut server.svs.clients[0];
        client.rate = 100;
        for frame in 0..RATE_MESSAGES as u32 {
            client.rate_history.set(frame, 50);
        }

        server.send_client_messages().unwrap();

        assert!(server.transport.take_sent().is_empty());
        let client = &server.svs.clients[0];
        assert_eq!(client.suppress_count, 1);
        assert_eq!(client.rate_history.total(), 450);
        assert_eq!(client.state, ClientState::Spawned);
    }

    #[test]
    fn test_loopback_is_never_rate_limited() {
        let mut server = server();
        join(&mut server, 0, "127.0.0.1:27901", ClientState::Spawned);
        let client = &mut server.svs.clients[0];
        client.rate = 100;
        for frame in 0..RATE_MESSAGES as u32 {
            client.rate_history.set(frame, 50);
        }

        server.send_client_messages().unwrap();
        assert_eq!(server.transport.take_sent().len(), 1);
        assert_eq!(server.svs.clients[0].suppress_count, 0);
    }

    #[test]
    fn test_connected_client_keepalive() {
        let mut server = server();
        join(&mut server, 0, "10.0.0.2:27901", ClientState::Connected);

        server.svs.real_time = KEEPALIVE_MSEC;
        server.send_client_messages().unwrap();
        assert!(server.transport.take_sent().is_empty());

        server.svs.real_time = KEEPALIVE_MSEC + 1;
        server.send_client_messages().unwrap();
        assert_eq!(server.transport.take_sent().len(), 1);
        assert_eq!(
            server.svs.clients[0].netchan.as_ref().unwrap().last_sent,
            KEEPALIVE_MSEC + 1
        );
    }

    #[test]
    fn test_pending_reliable_goes_out_at_once() {
        let mut server = server();
        join(&mut server, 0, "10.0.0.2:27901", ClientState::Zombie);
        server.svs.clients[0].send_reliable(ServerMessage::Disconnect);

        server.send_client_messages().unwrap();
        let sent = server.transport.take_sent();
        assert_eq!(sent.len(), 1);
        let messages = client_end().process(&sent[0].1, 0).unwrap().unwrap();
        assert_eq!(messages, vec![ServerMessage::Disconnect]);
    }

    #[test]
    fn test_free_slots_are_skipped() {
        let mut server = server();
        server.svs.real_time = 10 * KEEPALIVE_MSEC;
        server.send_client_messages().unwrap();
        assert!(server.transport.take_sent().is_empty());
    }

    #[test]
    fn test_reliable_backlog_overflow_drops_client() {
        let mut server = server();
        join(&mut server, 0, "10.0.0.2:27901", ClientState::Spawned);
        join(&mut server, 1, "10.0.0.3:27901", ClientState::Spawned);
        for _ in 0..=MAX_RELIABLE_BACKLOG {
            server.svs.clients[0].send_reliable(ServerMessage::Reconnect);
        }

        server.send_client_messages().unwrap();

        assert_eq!(server.svs.clients[0].state, ClientState::Zombie);
        assert_eq!(server.game.disconnects, vec![1]);
        let backlog: Vec<ServerMessage> = server.svs.clients[0]
            .netchan
            .as_ref()
            .unwrap()
            .pending_reliable()
            .cloned()
            .collect();
        // The broadcast reached the dropped client before its disconnect.
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog.last(), Some(&ServerMessage::Disconnect));

        let notice = ServerMessage::Print {
            level: PrintLevel::High,
            text: "player0 overflowed\n".to_string(),
        };
        assert!(server.svs.clients[1]
            .netchan
            .as_ref()
            .unwrap()
            .pending_reliable()
            .any(|m| *m == notice));
    }
}
