use crate::query::{self, local_bind_address};
use crate::ClientError;
use log::{debug, error, info, warn};
use shared::{
    oob, ClientMessage, EntityState, FrameUpdate, NetChannel, ServerMessage, Side, UserCmd,
    FRAME_MSEC, MAX_MSGLEN, PROTOCOL_VERSION, UPDATE_BACKUP, UPDATE_MASK,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep, MissedTickBehavior};

pub type ClientChannel = NetChannel<ClientMessage, ServerMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Loading: waiting for the server data and the go-ahead to begin.
    Connected,
    /// In the game, sending moves.
    Active,
    Disconnected,
}

#[derive(Debug, Clone)]
struct ReceivedFrame {
    server_frame: i32,
    entities: Vec<EntityState>,
}

/// Applies a frame update to the entity list it was delta compressed
/// against. Both lists are sorted by entity number.
pub fn apply_delta(base: &[EntityState], update: &FrameUpdate) -> Vec<EntityState> {
    let mut entities: BTreeMap<u16, EntityState> =
        base.iter().map(|e| (e.number, e.clone())).collect();
    for number in &update.removed {
        entities.remove(number);
    }
    for entity in &update.entities {
        entities.insert(entity.number, entity.clone());
    }
    entities.into_values().collect()
}

/// Client side of one session, independent of any socket.
pub struct Session {
    chan: ClientChannel,
    state: SessionState,
    spawn_count: Option<u32>,
    player_num: Option<u16>,
    map: String,
    config_strings: BTreeMap<u16, String>,
    baselines: Vec<EntityState>,
    frames: Vec<Option<ReceivedFrame>>,
    last_frame: i32,
    entities: Vec<EntityState>,
    prints: Vec<String>,
}

impl Session {
    /// Starts a session right after `client_connect`; the first packet asks
    /// the server for its connection data.
    pub fn new(server: SocketAddr, qport: u16, now: u64) -> Self {
        let mut chan = NetChannel::new(Side::Client, server, qport, now);
        chan.send_reliable(ClientMessage::StringCmd("new".to_string()));
        Self {
            chan,
            state: SessionState::Connected,
            spawn_count: None,
            player_num: None,
            map: String::new(),
            config_strings: BTreeMap::new(),
            baselines: Vec::new(),
            frames: vec![None; UPDATE_BACKUP],
            last_frame: -1,
            entities: Vec::new(),
            prints: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn map(&self) -> &str {
        &self.map
    }

    pub fn player_num(&self) -> Option<u16> {
        self.player_num
    }

    pub fn spawn_count(&self) -> Option<u32> {
        self.spawn_count
    }

    pub fn config_string(&self, index: u16) -> Option<&str> {
        self.config_strings.get(&index).map(String::as_str)
    }

    /// Newest frame received, -1 before the first.
    pub fn last_frame(&self) -> i32 {
        self.last_frame
    }

    /// Entities of the newest frame.
    pub fn entities(&self) -> &[EntityState] {
        &self.entities
    }

    /// Everything the server printed to us so far.
    pub fn prints(&self) -> &[String] {
        &self.prints
    }

    pub fn channel(&self) -> &ClientChannel {
        &self.chan
    }

    /// Queues a console command for the server.
    pub fn string_command(&mut self, text: &str) {
        self.chan.send_reliable(ClientMessage::StringCmd(text.to_string()));
    }

    pub fn set_user_info(&mut self, user_info: &str) {
        self.chan.send_reliable(ClientMessage::UserInfo(user_info.to_string()));
    }

    /// Handles one datagram from the server.
    pub fn process(&mut self, data: &[u8], now: u64) -> Result<(), ClientError> {
        if oob::is_connectionless(data) {
            debug!("Ignoring connectionless packet during session");
            return Ok(());
        }
        let Some(messages) = self.chan.process(data, now)? else {
            return Ok(());
        };
        for message in messages {
            self.handle(message)?;
            if self.state == SessionState::Disconnected {
                break;
            }
        }
        Ok(())
    }

    fn handle(&mut self, message: ServerMessage) -> Result<(), ClientError> {
        match message {
            ServerMessage::ServerData {
                protocol,
                spawn_count,
                map,
                player_num,
            } => {
                if protocol != PROTOCOL_VERSION {
                    return Err(ClientError::UnexpectedReply(format!(
                        "server protocol {}",
                        protocol
                    )));
                }
                info!("Loading {} as player {}", map, player_num);
                self.spawn_count = Some(spawn_count);
                self.player_num = Some(player_num);
                self.map = map;
                self.config_strings.clear();
                self.baselines.clear();
                self.reset_frames();
            }
            ServerMessage::ConfigString { index, value } => {
                self.config_strings.insert(index, value);
            }
            ServerMessage::Baseline(state) => {
                match self.baselines.binary_search_by_key(&state.number, |b| b.number) {
                    Ok(at) => self.baselines[at] = state,
                    Err(at) => self.baselines.insert(at, state),
                }
            }
            ServerMessage::StuffText(text) => self.stuff_text(&text),
            ServerMessage::Frame(update) => self.apply_frame(update),
            ServerMessage::Print { text, .. } => {
                info!("{}", text.trim_end());
                self.prints.push(text);
            }
            ServerMessage::Download { size, offset, data } => {
                debug!("Download chunk at {} of {} ({} bytes)", offset, size, data.len());
            }
            ServerMessage::DownloadRefused => warn!("Download refused"),
            ServerMessage::Reconnect => {
                info!("Server changed map, reconnecting");
                self.state = SessionState::Connected;
                self.reset_frames();
                self.string_command("new");
            }
            ServerMessage::Disconnect => {
                info!("Disconnected by server");
                self.state = SessionState::Disconnected;
            }
        }
        Ok(())
    }

    fn reset_frames(&mut self) {
        self.frames = vec![None; UPDATE_BACKUP];
        self.last_frame = -1;
        self.entities.clear();
    }

    /// The server drives loading through `cmd begin <spawncount>`.
    fn stuff_text(&mut self, text: &str) {
        let args = oob::tokenize(text);
        match args.as_slice() {
            [cmd, begin, count] if cmd == "cmd" && begin == "begin" => match count.parse() {
                Ok(spawn_count) => {
                    self.chan.send_reliable(ClientMessage::Begin { spawn_count });
                    self.state = SessionState::Active;
                }
                Err(_) => warn!("Bad begin command: {}", text.trim_end()),
            },
            _ => debug!("Ignoring stuffed text: {}", text.trim_end()),
        }
    }

    fn apply_frame(&mut self, update: FrameUpdate) {
        let base: &[EntityState] = if update.delta_frame < 0 {
            &self.baselines
        } else {
            match &self.frames[update.delta_frame as usize & UPDATE_MASK] {
                Some(frame) if frame.server_frame == update.delta_frame => &frame.entities,
                _ => {
                    warn!(
                        "Frame {} is a delta from unknown frame {}",
                        update.server_frame, update.delta_frame
                    );
                    return;
                }
            }
        };
        let entities = apply_delta(base, &update);

        self.frames[update.server_frame as usize & UPDATE_MASK] = Some(ReceivedFrame {
            server_frame: update.server_frame,
            entities: entities.clone(),
        });
        if update.server_frame > self.last_frame {
            self.last_frame = update.server_frame;
            self.entities = entities;
        }
    }

    /// Builds the next datagram. Moves only go out once the client is in
    /// the game.
    pub fn transmit(&mut self, cmd: Option<&UserCmd>, now: u64) -> Result<Vec<u8>, ClientError> {
        let unreliable = match (self.state, cmd) {
            (SessionState::Active, Some(cmd)) => vec![ClientMessage::Move {
                last_frame: self.last_frame,
                cmd: cmd.clone(),
            }],
            _ => Vec::new(),
        };
        Ok(self.chan.transmit(&unreliable, now)?)
    }

    /// Queues a disconnect and builds the datagram carrying it.
    pub fn disconnect(&mut self, now: u64) -> Result<Vec<u8>, ClientError> {
        if self.state != SessionState::Disconnected {
            self.chan.send_reliable(ClientMessage::Disconnect);
            self.state = SessionState::Disconnected;
        }
        self.transmit(None, now)
    }
}

/// A session over a UDP socket.
pub struct Connection {
    socket: UdpSocket,
    server: SocketAddr,
    session: Session,
    start: Instant,
}

impl Connection {
    /// Runs the challenge and connect exchange, then asks for the
    /// connection data.
    pub async fn connect(
        server: SocketAddr,
        user_info: &str,
        qport: u16,
        wait: Duration,
    ) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind(local_bind_address(server)).await?;

        let challenge = query::get_challenge_on(&socket, server, wait).await?;
        debug!("Got challenge {} from {}", challenge, server);

        let line = format!(
            "connect {} {} {} \"{}\"",
            PROTOCOL_VERSION, qport, challenge, user_info
        );
        let body = query::request_on(&socket, server, &line, wait).await?;
        if body.trim_end() != "client_connect" {
            return Err(match body.strip_prefix("print\n") {
                Some(reason) => ClientError::Refused(reason.trim_end().to_string()),
                None => ClientError::UnexpectedReply(body),
            });
        }
        info!("Connected to {}", server);

        let mut connection = Self {
            socket,
            server,
            session: Session::new(server, qport, 0),
            start: Instant::now(),
        };
        connection.send(None).await?;
        Ok(connection)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    fn now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    async fn send(&mut self, cmd: Option<&UserCmd>) -> Result<(), ClientError> {
        let packet = self.session.transmit(cmd, self.now())?;
        self.socket.send_to(&packet, self.server).await?;
        Ok(())
    }

    /// Plays `cmd` once per server frame for `duration`.
    pub async fn run_for(&mut self, duration: Duration, cmd: &UserCmd) -> Result<(), ClientError> {
        let mut ticker = interval(Duration::from_millis(FRAME_MSEC));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = sleep(duration);
        tokio::pin!(deadline);

        let mut cmd = cmd.clone();
        cmd.msec = FRAME_MSEC as u8;
        let mut buffer = vec![0u8; MAX_MSGLEN * 2];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, from)) if from == self.server => {
                            let now = self.now();
                            self.session.process(&buffer[..len], now)?;
                            if self.session.state() == SessionState::Disconnected {
                                return Err(ClientError::Disconnected);
                            }
                        }
                        Ok((_, from)) => debug!("Ignoring packet from {}", from),
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                }
                _ = ticker.tick() => {
                    self.send(Some(&cmd)).await?;
                }
                _ = &mut deadline => return Ok(()),
            }
        }
    }

    /// Says goodbye. The disconnect is sent a few times since nothing will
    /// resend it.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        for _ in 0..3 {
            let packet = self.session.disconnect(self.now())?;
            self.socket.send_to(&packet, self.server).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::PrintLevel;

    type ServerEnd = NetChannel<ServerMessage, ClientMessage>;

    fn server_addr() -> SocketAddr {
        "10.0.0.1:27910".parse().unwrap()
    }

    fn server_end() -> ServerEnd {
        NetChannel::new(Side::Server, "10.0.0.2:27901".parse().unwrap(), 9, 0)
    }

    fn entity(number: u16, x: f32) -> EntityState {
        EntityState {
            number,
            origin: [x, 0.0, 0.0],
            ..Default::default()
        }
    }

    /// Server end sends `messages` in one reliable block; the session
    /// receives them.
    fn deliver(server: &mut ServerEnd, session: &mut Session, messages: Vec<ServerMessage>) {
        for message in messages {
            server.send_reliable(message);
        }
        let packet = server.transmit(&[], 0).unwrap();
        session.process(&packet, 0).unwrap();
    }

    fn deliver_unreliable(
        server: &mut ServerEnd,
        session: &mut Session,
        messages: Vec<ServerMessage>,
    ) {
        let packet = server.transmit(&messages, 0).unwrap();
        session.process(&packet, 0).unwrap();
    }

    fn frame(
        server_frame: i32,
        delta_frame: i32,
        entities: Vec<EntityState>,
        removed: Vec<u16>,
    ) -> ServerMessage {
        ServerMessage::Frame(FrameUpdate {
            server_frame,
            delta_frame,
            entities,
            removed,
        })
    }

    #[test]
    fn test_apply_delta() {
        let base = vec![entity(1, 0.0), entity(2, 0.0), entity(5, 0.0)];
        let update = FrameUpdate {
            server_frame: 2,
            delta_frame: 1,
            entities: vec![entity(2, 4.0), entity(3, 1.0)],
            removed: vec![5],
        };
        assert_eq!(
            apply_delta(&base, &update),
            vec![entity(1, 0.0), entity(2, 4.0), entity(3, 1.0)]
        );
    }

    #[test]
    fn test_handshake() {
        let mut server = server_end();
        let mut session = Session::new(server_addr(), 9, 0);

        let packet = session.transmit(None, 0).unwrap();
        let received = server.process(&packet, 0).unwrap().unwrap();
        assert_eq!(received, vec![ClientMessage::StringCmd("new".to_string())]);

        deliver(
            &mut server,
            &mut session,
            vec![
                ServerMessage::ServerData {
                    protocol: PROTOCOL_VERSION,
                    spawn_count: 3,
                    map: "q2dm1".to_string(),
                    player_num: 2,
                },
                ServerMessage::ConfigString {
                    index: 2,
                    value: "q2dm1".to_string(),
                },
                ServerMessage::Baseline(entity(9, 0.0)),
                ServerMessage::StuffText("cmd begin 3\n".to_string()),
            ],
        );
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.player_num(), Some(2));
        assert_eq!(session.map(), "q2dm1");
        assert_eq!(session.config_string(2), Some("q2dm1"));

        let cmd = UserCmd {
            msec: 100,
            ..Default::default()
        };
        let packet = session.transmit(Some(&cmd), 0).unwrap();
        let received = server.process(&packet, 0).unwrap().unwrap();
        assert_eq!(
            received,
            vec![
                ClientMessage::Begin { spawn_count: 3 },
                ClientMessage::Move {
                    last_frame: -1,
                    cmd
                },
            ]
        );
    }

    #[test]
    fn test_moves_wait_for_begin() {
        let mut session = Session::new(server_addr(), 9, 0);
        let mut server = server_end();
        let packet = session.transmit(Some(&UserCmd::default()), 0).unwrap();
        let received = server.process(&packet, 0).unwrap().unwrap();
        assert_eq!(received.len(), 1);
    }

    #[test]
    fn test_frames_are_reassembled() {
        let mut server = server_end();
        let mut session = Session::new(server_addr(), 9, 0);
        deliver(&mut server, &mut session, vec![ServerMessage::Baseline(entity(9, 0.0))]);

        deliver_unreliable(
            &mut server,
            &mut session,
            vec![frame(1, -1, vec![entity(1, 5.0)], vec![])],
        );
        assert_eq!(session.last_frame(), 1);
        assert_eq!(session.entities(), &[entity(1, 5.0), entity(9, 0.0)]);

        deliver_unreliable(
            &mut server,
            &mut session,
            vec![frame(2, 1, vec![entity(1, 6.0)], vec![9])],
        );
        assert_eq!(session.entities(), &[entity(1, 6.0)]);

        // A delta from a frame we never saw is dropped.
        deliver_unreliable(&mut server, &mut session, vec![frame(4, 3, vec![], vec![1])]);
        assert_eq!(session.last_frame(), 2);
        assert_eq!(session.entities(), &[entity(1, 6.0)]);
    }

    #[test]
    fn test_reconnect_asks_for_new_data() {
        let mut server = server_end();
        let mut session = Session::new(server_addr(), 9, 0);
        let packet = session.transmit(None, 0).unwrap();
        server.process(&packet, 0).unwrap();

        deliver(
            &mut server,
            &mut session,
            vec![
                ServerMessage::StuffText("cmd begin 1\n".to_string()),
                frame(1, -1, vec![entity(1, 0.0)], vec![]),
                ServerMessage::Print {
                    level: PrintLevel::High,
                    text: "changing map\n".to_string(),
                },
                ServerMessage::Reconnect,
            ],
        );
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.last_frame(), -1);
        assert_eq!(session.prints(), &["changing map\n".to_string()]);

        let packet = session.transmit(None, 0).unwrap();
        let received = server.process(&packet, 0).unwrap().unwrap();
        assert_eq!(
            received,
            vec![
                ClientMessage::Begin { spawn_count: 1 },
                ClientMessage::StringCmd("new".to_string()),
            ]
        );
    }

    #[test]
    fn test_disconnect() {
        let mut server = server_end();
        let mut session = Session::new(server_addr(), 9, 0);
        deliver(&mut server, &mut session, vec![ServerMessage::Disconnect]);
        assert_eq!(session.state(), SessionState::Disconnected);

        let mut session = Session::new(server_addr(), 9, 0);
        let packet = session.disconnect(0).unwrap();
        let received = server_end().process(&packet, 0).unwrap().unwrap();
        assert_eq!(
            received,
            vec![
                ClientMessage::StringCmd("new".to_string()),
                ClientMessage::Disconnect,
            ]
        );
    }

    #[test]
    fn test_wrong_protocol_is_an_error() {
        let mut server = server_end();
        let mut session = Session::new(server_addr(), 9, 0);
        server.send_reliable(ServerMessage::ServerData {
            protocol: PROTOCOL_VERSION + 1,
            spawn_count: 1,
            map: "q2dm1".to_string(),
            player_num: 0,
        });
        let packet = server.transmit(&[], 0).unwrap();
        assert!(session.process(&packet, 0).is_err());
    }
}
