//! A small deathmatch arena: the game module the server binary runs.
//!
//! Players spawn on one of a few pads, run around a flat square arena and
//! frag whoever is closest when they fire. There is no line of sight, so
//! every client sees every entity.

use crate::game::{GameError, GameModule};
use log::{debug, info};
use shared::{EntityState, InfoString, UserCmd};
use std::collections::BTreeMap;

pub const BUTTON_ATTACK: u8 = 1;

pub const EV_NONE: u8 = 0;
pub const EV_PLAYER_TELEPORT: u8 = 6;

/// Model index the client draws players with.
pub const PLAYER_MODEL: u16 = 255;
pub const PAD_MODEL: u16 = 1;

/// Half the side of the arena floor.
pub const ARENA_EXTENT: f32 = 1024.0;
pub const FRAG_RANGE: f32 = 256.0;
/// Milliseconds between two shots of one player.
pub const REFIRE_MSEC: u64 = 1000;

const SPAWN_PADS: [[f32; 3]; 4] = [
    [-512.0, -512.0, 0.0],
    [512.0, -512.0, 0.0],
    [512.0, 512.0, 0.0],
    [-512.0, 512.0, 0.0],
];

fn short_to_angle(value: i16) -> f32 {
    value as f32 * (360.0 / 65536.0)
}

fn distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

#[derive(Debug, Clone, Default)]
pub struct Player {
    pub name: String,
    pub in_world: bool,
    pub origin: [f32; 3],
    pub angles: [f32; 3],
    pub frags: i32,
    pub deaths: i32,
    pub ping: u32,
    pub event: u8,
    last_attack: Option<u64>,
}

#[derive(Debug, Default)]
pub struct ArenaGame {
    max_clients: usize,
    banned_names: Vec<String>,
    players: BTreeMap<usize, Player>,
    map: String,
    time: u64,
    spawns: usize,
}

impl ArenaGame {
    pub fn new(max_clients: usize) -> Self {
        Self {
            max_clients,
            ..Default::default()
        }
    }

    /// Refuses connections from players using `name`, ignoring case.
    pub fn ban_name(&mut self, name: &str) {
        self.banned_names.push(name.to_ascii_lowercase());
    }

    pub fn banned_names(&self) -> &[String] {
        &self.banned_names
    }

    pub fn player(&self, entity: usize) -> Option<&Player> {
        self.players.get(&entity)
    }

    pub fn map(&self) -> &str {
        &self.map
    }

    /// Pads come right after the player entities.
    fn pad_states(&self) -> impl Iterator<Item = EntityState> + '_ {
        SPAWN_PADS.iter().enumerate().map(|(i, origin)| EntityState {
            number: (self.max_clients + 1 + i) as u16,
            origin: *origin,
            model_index: PAD_MODEL,
            ..Default::default()
        })
    }

    /// Puts the player on the next pad in rotation.
    fn respawn(&mut self, entity: usize) -> Result<(), GameError> {
        let pad = SPAWN_PADS[self.spawns % SPAWN_PADS.len()];
        self.spawns += 1;
        let player = self
            .players
            .get_mut(&entity)
            .ok_or(GameError::UnknownEntity(entity))?;
        player.origin = pad;
        player.event = EV_PLAYER_TELEPORT;
        Ok(())
    }

    /// The closest other player in the world within frag range.
    fn target_for(&self, entity: usize, origin: [f32; 3]) -> Option<usize> {
        self.players
            .iter()
            .filter(|(other, p)| **other != entity && p.in_world)
            .map(|(&other, p)| (other, distance(origin, p.origin)))
            .filter(|&(_, d)| d <= FRAG_RANGE)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(other, _)| other)
    }

    fn fire(&mut self, entity: usize) -> Result<(), GameError> {
        let Some(player) = self.players.get(&entity) else {
            return Err(GameError::UnknownEntity(entity));
        };
        if player
            .last_attack
            .is_some_and(|last| self.time < last + REFIRE_MSEC)
        {
            return Ok(());
        }
        let origin = player.origin;
        let Some(victim) = self.target_for(entity, origin) else {
            return Ok(());
        };

        if let Some(attacker) = self.players.get_mut(&entity) {
            attacker.frags += 1;
            attacker.last_attack = Some(self.time);
        }
        if let Some(target) = self.players.get_mut(&victim) {
            target.deaths += 1;
        }
        info!("Entity {} fragged entity {}", entity, victim);
        self.respawn(victim)
    }
}

impl GameModule for ArenaGame {
    fn client_connect(
        &mut self,
        entity: usize,
        user_info: &mut InfoString,
    ) -> Result<bool, GameError> {
        let name = user_info.value_for_key("name").unwrap_or_default().to_ascii_lowercase();
        if self.banned_names.contains(&name) {
            user_info
                .set_value_for_key("rejmsg", "Banned name.")
                .map_err(|e| GameError::Fatal(e.to_string()))?;
            return Ok(false);
        }
        self.players.insert(entity, Player::default());
        Ok(true)
    }

    fn client_disconnect(&mut self, entity: usize) -> Result<(), GameError> {
        if let Some(player) = self.players.remove(&entity) {
            info!("{} left the arena", player.name);
        }
        Ok(())
    }

    fn client_userinfo_changed(
        &mut self,
        entity: usize,
        user_info: &mut InfoString,
    ) -> Result<(), GameError> {
        let name = match user_info.value_for_key("name") {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => {
                user_info
                    .set_value_for_key("name", "player")
                    .map_err(|e| GameError::Fatal(e.to_string()))?;
                "player".to_string()
            }
        };
        let player = self
            .players
            .get_mut(&entity)
            .ok_or(GameError::UnknownEntity(entity))?;
        player.name = name;
        Ok(())
    }

    fn run_frame(&mut self, _frame_num: u32, time: u64) -> Result<(), GameError> {
        self.time = time;
        Ok(())
    }

    fn client_begin(&mut self, entity: usize) -> Result<(), GameError> {
        let player = self
            .players
            .get_mut(&entity)
            .ok_or(GameError::UnknownEntity(entity))?;
        player.in_world = true;
        info!("{} entered the arena", player.name);
        self.respawn(entity)
    }

    fn client_think(&mut self, entity: usize, cmd: &UserCmd) -> Result<(), GameError> {
        let player = self
            .players
            .get_mut(&entity)
            .ok_or(GameError::UnknownEntity(entity))?;
        if !player.in_world {
            return Ok(());
        }

        for (angle, &short) in player.angles.iter_mut().zip(cmd.angles.iter()) {
            *angle = short_to_angle(short);
        }
        let yaw = player.angles[1].to_radians();
        let seconds = cmd.msec as f32 / 1000.0;
        let forward = cmd.forward_move as f32 * seconds;
        let side = cmd.side_move as f32 * seconds;

        player.origin[0] += forward * yaw.cos() + side * yaw.sin();
        player.origin[1] += forward * yaw.sin() - side * yaw.cos();
        player.origin[2] += cmd.up_move as f32 * seconds;
        player.origin[0] = player.origin[0].clamp(-ARENA_EXTENT, ARENA_EXTENT);
        player.origin[1] = player.origin[1].clamp(-ARENA_EXTENT, ARENA_EXTENT);
        player.origin[2] = player.origin[2].clamp(0.0, ARENA_EXTENT);

        if cmd.buttons & BUTTON_ATTACK != 0 {
            self.fire(entity)?;
        }
        Ok(())
    }

    fn client_command(&mut self, entity: usize, args: &[String]) -> Result<Option<String>, GameError> {
        let reply = match args.first().map(String::as_str) {
            Some("score") => {
                let player = self
                    .players
                    .get(&entity)
                    .ok_or(GameError::UnknownEntity(entity))?;
                Some(format!("{} frags, {} deaths\n", player.frags, player.deaths))
            }
            Some("players") => {
                let mut text = String::new();
                for player in self.players.values() {
                    text.push_str(&format!("{:>3} {:>4} {}\n", player.frags, player.ping, player.name));
                }
                Some(text)
            }
            _ => None,
        };
        Ok(reply)
    }

    fn server_command(&mut self, args: &[String]) -> Result<Option<String>, GameError> {
        let reply = match (args.first().map(String::as_str), args.get(1)) {
            (Some("addban"), Some(name)) => {
                self.ban_name(name);
                Some(format!("Banned {}\n", name))
            }
            (Some("removeban"), Some(name)) => {
                let name = name.to_ascii_lowercase();
                let before = self.banned_names.len();
                self.banned_names.retain(|banned| *banned != name);
                if self.banned_names.len() < before {
                    Some(format!("Removed ban on {}\n", name))
                } else {
                    Some(format!("Didn't find {}.\n", name))
                }
            }
            (Some(command @ ("addban" | "removeban")), None) => {
                Some(format!("Usage: sv {} <name>\n", command))
            }
            (Some("listbans"), _) => {
                let mut text = String::from("Banned names:\n");
                for name in &self.banned_names {
                    text.push_str(name);
                    text.push('\n');
                }
                Some(text)
            }
            _ => None,
        };
        Ok(reply)
    }

    fn client_score(&self, entity: usize) -> i32 {
        self.players.get(&entity).map_or(0, |p| p.frags)
    }

    fn set_client_ping(&mut self, entity: usize, ping: u32) {
        if let Some(player) = self.players.get_mut(&entity) {
            player.ping = ping;
        }
    }

    fn spawn_entities(&mut self, map: &str) -> Result<(), GameError> {
        debug!("Spawning arena entities for {}", map);
        self.map = map.to_string();
        self.time = 0;
        self.spawns = 0;
        for player in self.players.values_mut() {
            player.in_world = false;
            player.frags = 0;
            player.deaths = 0;
            player.event = EV_NONE;
            player.last_attack = None;
        }
        Ok(())
    }

    fn baselines(&self) -> Vec<EntityState> {
        self.pad_states().collect()
    }

    fn entity_states(&self, _viewer: usize) -> Vec<EntityState> {
        let players = self
            .players
            .iter()
            .filter(|(_, p)| p.in_world)
            .map(|(&entity, p)| EntityState {
                number: entity as u16,
                origin: p.origin,
                angles: p.angles,
                model_index: PLAYER_MODEL,
                frame: 0,
                event: p.event,
            });
        players.chain(self.pad_states()).collect()
    }

    fn clear_events(&mut self) {
        for player in self.players.values_mut() {
            player.event = EV_NONE;
        }
    }
}
