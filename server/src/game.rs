//! The seam between the session core and game rules.
//!
//! The server never looks inside the game. It hands over connection events,
//! movement commands and frame ticks, and asks back for the entity states each
//! client should see. Hooks that can fail return [`GameError`]; such a failure
//! is fatal for the whole server.

use shared::{EntityState, InfoString, UserCmd};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GameError {
    #[error("game module failure: {0}")]
    Fatal(String),
    #[error("no such entity: {0}")]
    UnknownEntity(usize),
}

/// Game rules injected into the server at startup.
///
/// Entity numbers passed to the hooks are `slot + 1`; entity 0 is the world.
pub trait GameModule {
    /// Decides whether a client may join. The user info can be modified; on
    /// refusal a `rejmsg` key is relayed to the client as the reason.
    fn client_connect(&mut self, entity: usize, user_info: &mut InfoString)
        -> Result<bool, GameError>;

    fn client_disconnect(&mut self, entity: usize) -> Result<(), GameError>;

    /// Called whenever a client's user info changes, including on connect.
    fn client_userinfo_changed(
        &mut self,
        entity: usize,
        user_info: &mut InfoString,
    ) -> Result<(), GameError>;

    /// Advances the simulation by one frame.
    fn run_frame(&mut self, frame_num: u32, time: u64) -> Result<(), GameError>;

    /// The client finished loading and enters the world.
    fn client_begin(&mut self, _entity: usize) -> Result<(), GameError> {
        Ok(())
    }

    fn client_think(&mut self, _entity: usize, _cmd: &UserCmd) -> Result<(), GameError> {
        Ok(())
    }

    /// A string command the server itself does not handle. Returns text to
    /// print back to the client, or `None` when the command is unknown.
    fn client_command(&mut self, _entity: usize, _args: &[String]) -> Result<Option<String>, GameError> {
        Ok(None)
    }

    /// An operator command passed through by the `sv` console command, with
    /// the leading `sv` already stripped. Returns output for the operator,
    /// or `None` when the game does not know the command.
    fn server_command(&mut self, _args: &[String]) -> Result<Option<String>, GameError> {
        Ok(None)
    }

    /// Frag count shown in status replies.
    fn client_score(&self, _entity: usize) -> i32 {
        0
    }

    fn set_client_ping(&mut self, _entity: usize, _ping: u32) {}

    /// Loads the entities of a freshly spawned map.
    fn spawn_entities(&mut self, _map: &str) -> Result<(), GameError> {
        Ok(())
    }

    /// Baseline states sent to clients on connect and used for full frames.
    fn baselines(&self) -> Vec<EntityState> {
        Vec::new()
    }

    /// Entity states visible to `viewer`, sorted by entity number. Viewer 0
    /// asks for everything, as used for server demos.
    fn entity_states(&self, _viewer: usize) -> Vec<EntityState> {
        Vec::new()
    }

    /// Clears one-shot entity events after a frame went out.
    fn clear_events(&mut self) {}
}
