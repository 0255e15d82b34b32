//! Connect handling.
//!
//! A `connect` request runs through a fixed sequence of gates; the first one
//! that fails decides the refusal text, and exactly one reply goes back to
//! the requester either way.

use crate::client::{
    ClientRecord, ClientState, DEFAULT_RATE, MAX_RATE, MIN_RATE,
};
use crate::error::ServerError;
use crate::game::{GameError, GameModule};
use crate::network::Server;
use crate::transport::{is_local_address, Transport};
use log::{debug, info};
use shared::{InfoString, NetChannel, Side, PROTOCOL_VERSION};
use std::fmt;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub address: SocketAddr,
    pub protocol: i32,
    pub qport: u16,
    pub challenge: i32,
    pub user_info: String,
}

/// Why a connect was refused. `Display` gives the text sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    WrongVersion,
    BadUserInfo,
    AttractLoop,
    NoChallenge,
    BadChallenge,
    ReconnectTooSoon,
    ServerFull,
    /// The game said no, with its `rejmsg` if it gave one.
    Rejected(Option<String>),
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refusal::WrongVersion => write!(f, "Server uses protocol version {}", PROTOCOL_VERSION),
            Refusal::BadUserInfo => f.write_str("Invalid userinfo"),
            Refusal::AttractLoop | Refusal::Rejected(None) => f.write_str("Connection refused"),
            Refusal::NoChallenge => f.write_str("No challenge for address"),
            Refusal::BadChallenge => f.write_str("Bad challenge"),
            Refusal::ReconnectTooSoon => f.write_str("Reconnect too soon"),
            Refusal::ServerFull => f.write_str("Server is full"),
            Refusal::Rejected(Some(reason)) => f.write_str(reason),
        }
    }
}

/// Lets the game react to new user info, then pulls the fields the server
/// itself uses out of it.
pub fn userinfo_changed(
    client: &mut ClientRecord,
    game: &mut dyn GameModule,
) -> Result<(), GameError> {
    game.client_userinfo_changed(client.entity, &mut client.user_info)?;

    client.name = client
        .user_info
        .value_for_key("name")
        .unwrap_or_default()
        .to_string();

    client.rate = match client.user_info.value_for_key("rate") {
        Some(rate) => match rate.trim().parse::<i64>() {
            Ok(rate) => rate.clamp(MIN_RATE as i64, MAX_RATE as i64) as u32,
            Err(_) => DEFAULT_RATE,
        },
        None => DEFAULT_RATE,
    };

    if let Some(Ok(level)) = client
        .user_info
        .value_for_key("msg")
        .map(|msg| msg.trim().parse::<i32>())
    {
        client.message_level = level;
    }
    Ok(())
}

impl<T: Transport, G: GameModule> Server<T, G> {
    /// Runs a connect request through the admission gates and replies with
    /// either `client_connect` or a `print` carrying the refusal.
    ///
    /// Returns the slot on success. Only a game module failure is an error.
    pub fn handle_connect_request(
        &mut self,
        request: ConnectRequest,
    ) -> Result<Result<usize, Refusal>, ServerError> {
        let address = request.address;
        let outcome = self.admit(request)?;
        match &outcome {
            Ok(slot) => {
                info!("Client {} connected to slot {}", address, slot);
                self.send_oob(address, "client_connect");
            }
            Err(refusal) => {
                debug!("Refused connect from {}: {}", address, refusal);
                self.send_oob(address, &format!("print\n{}\n", refusal));
            }
        }
        Ok(outcome)
    }

    fn admit(&mut self, request: ConnectRequest) -> Result<Result<usize, Refusal>, ServerError> {
        let from = request.address;
        let local = is_local_address(from);

        if request.protocol != PROTOCOL_VERSION {
            return Ok(Err(Refusal::WrongVersion));
        }

        // The game can filter on the forced `ip` key.
        let mut user_info = match InfoString::parse(&request.user_info) {
            Ok(info) => info,
            Err(_) => return Ok(Err(Refusal::BadUserInfo)),
        };
        if user_info.set_value_for_key("ip", &from.to_string()).is_err() {
            return Ok(Err(Refusal::BadUserInfo));
        }

        if self.sv.attract_loop && !local {
            return Ok(Err(Refusal::AttractLoop));
        }

        if !local {
            match self.svs.challenges.lookup(from) {
                None => return Ok(Err(Refusal::NoChallenge)),
                Some(challenge) if challenge != request.challenge => {
                    return Ok(Err(Refusal::BadChallenge))
                }
                Some(_) => {}
            }
        }

        let now = self.svs.real_time;
        let slot = match self.svs.clients.find_reusable(from, request.qport) {
            Some(slot) => {
                let since_connect = now.saturating_sub(self.svs.clients[slot].last_connect);
                if !local && since_connect < self.config.reconnect_limit_ms() {
                    return Ok(Err(Refusal::ReconnectTooSoon));
                }
                debug!("{} reconnecting into slot {}", from, slot);
                slot
            }
            None => match self.svs.clients.first_free() {
                Some(slot) => slot,
                None => return Ok(Err(Refusal::ServerFull)),
            },
        };

        let entity = slot + 1;
        if !self.game.client_connect(entity, &mut user_info)? {
            let reason = user_info
                .value_for_key("rejmsg")
                .filter(|reason| !reason.is_empty())
                .map(str::to_string);
            return Ok(Err(Refusal::Rejected(reason)));
        }

        let client = &mut self.svs.clients[slot];
        *client = ClientRecord::default();
        client.entity = entity;
        client.challenge = request.challenge;
        client.user_info = user_info;
        userinfo_changed(client, &mut self.game)?;

        client.netchan = Some(NetChannel::new(Side::Server, from, request.qport, now));
        client.datagram.clear();
        client.last_message = now;
        client.last_connect = now;
        client.state = ClientState::Connected;

        Ok(Ok(slot))
    }
}
