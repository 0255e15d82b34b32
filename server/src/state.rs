//! Per-map and process-lifetime server state
//!
//! The server keeps two bundles of state with different lifetimes:
//! - [`FrameState`] is rebuilt on every map load and holds the simulation
//!   clock, config strings and baselines of the current map
//! - [`StaticState`] lives from the first map load to shutdown and holds the
//!   client and challenge tables, the wall clock and master bookkeeping

use crate::challenge::ChallengeTable;
use crate::client_manager::ClientTable;
use crate::demo::DemoRecorder;
use shared::{EntityState, FRAME_MSEC, MAX_CONFIG_STRINGS};

/// What the server is currently running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    /// No map loaded
    #[default]
    Dead,
    /// Spawning a map; clients are not serviced yet
    Loading,
    /// Running a playable map
    Game,
    Cinematic,
    Demo,
    Pic,
}

/// State that lives for one map.
///
/// Frame numbers and simulated time restart at zero with every map, which
/// is why clients have to acknowledge a fresh frame after reconnecting.
#[derive(Debug)]
pub struct FrameState {
    /// What the server is running
    pub state: ServerState,
    /// Game frames run on this map
    pub frame_num: u32,
    /// Simulated time, always `frame_num * FRAME_MSEC`.
    pub time: u64,
    /// Map name
    pub name: String,
    /// Demo or cinematic loop that refuses remote connects
    pub attract_loop: bool,
    /// Restored from a saved game rather than spawned fresh.
    pub load_game: bool,
    /// Only honoured on a single-player server
    pub paused: bool,
    /// Indexed strings sent to every client on connect
    pub config_strings: Vec<String>,
    /// Entity states at spawn, sorted by number; full frames delta from these
    pub baselines: Vec<EntityState>,
}

impl FrameState {
    pub fn new() -> Self {
        Self {
            state: ServerState::Dead,
            frame_num: 0,
            time: 0,
            name: String::new(),
            attract_loop: false,
            load_game: false,
            paused: false,
            config_strings: vec![String::new(); MAX_CONFIG_STRINGS],
            baselines: Vec::new(),
        }
    }

    /// Moves to the next game frame, keeping `time` in step
    pub fn advance(&mut self) {
        self.frame_num += 1;
        self.time = self.frame_num as u64 * FRAME_MSEC;
    }

    /// Sets a config string; out-of-range indices are ignored
    pub fn set_config_string(&mut self, index: usize, value: &str) {
        if let Some(slot) = self.config_strings.get_mut(index) {
            *slot = value.to_string();
        }
    }
}

impl Default for FrameState {
    fn default() -> Self {
        Self::new()
    }
}

/// State that survives map changes.
///
/// Shutdown replaces it with a fresh one but carries over `real_time` and
/// `spawn_count`, so clocks never run backwards and spawn counts never
/// repeat within one process.
#[derive(Debug)]
pub struct StaticState {
    /// A map has been loaded and the server is not shut down
    pub initialized: bool,
    /// Monotonic wall clock in milliseconds, advanced every host frame.
    pub real_time: u64,
    /// Accumulated real time the simulation is allowed to consume. Clamped
    /// so the simulation never drifts more than one frame either way.
    pub frame_clock: u64,
    /// Bumped on every map load so stale `begin` commands can be told apart.
    pub spawn_count: u32,
    /// Fixed table of client slots
    pub clients: ClientTable,
    /// Connect challenges handed out, keyed by IP
    pub challenges: ChallengeTable,
    /// `None` forces a heartbeat on the next frame.
    pub last_heartbeat: Option<u64>,
    /// Server demo being recorded
    pub demo: Option<DemoRecorder>,
}

impl StaticState {
    pub fn new(max_clients: usize) -> Self {
        Self {
            initialized: false,
            real_time: 0,
            frame_clock: 0,
            spawn_count: 0,
            clients: ClientTable::new(max_clients),
            challenges: ChallengeTable::new(),
            last_heartbeat: None,
            demo: None,
        }
    }
}
