//! Per-client snapshots and delta compression.
//!
//! Every frame each spawned client gets the entity states it can see. The
//! states are stored in the client's frame ring so the next snapshot can be
//! sent as a delta against the newest frame the client acknowledged.

use crate::client::ClientRecord;
use crate::game::GameModule;
use crate::state::FrameState;
use shared::{EntityState, FrameUpdate, UPDATE_BACKUP};

/// Entities in `to` that differ from their counterpart in `from`, plus the
/// numbers present in `from` but gone from `to`. Both lists are sorted by
/// entity number.
pub fn delta_entities(from: &[EntityState], to: &[EntityState]) -> (Vec<EntityState>, Vec<u16>) {
    let mut changed = Vec::new();
    let mut removed = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < from.len() || j < to.len() {
        match (from.get(i), to.get(j)) {
            (Some(old), Some(new)) if old.number == new.number => {
                if old != new {
                    changed.push(new.clone());
                }
                i += 1;
                j += 1;
            }
            (Some(old), Some(new)) if old.number < new.number => {
                removed.push(old.number);
                i += 1;
            }
            (_, Some(new)) => {
                changed.push(new.clone());
                j += 1;
            }
            (Some(old), None) => {
                removed.push(old.number);
                i += 1;
            }
            (None, None) => break,
        }
    }

    (changed, removed)
}

/// Captures what `client` sees this frame into its frame ring.
pub fn build_client_frame(
    frame: &FrameState,
    client: &mut ClientRecord,
    game: &dyn GameModule,
    real_time: u64,
) {
    let entities = game.entity_states(client.entity);
    let slot = client.frame_mut(frame.frame_num as i32);
    slot.server_frame = frame.frame_num as i32;
    slot.sent_time = real_time;
    slot.entities = entities;
}

/// Encodes the current frame against the client's last acknowledged one,
/// falling back to a delta against the map baselines when that frame is
/// unknown or too old.
pub fn write_frame(frame: &FrameState, client: &ClientRecord) -> FrameUpdate {
    let current_num = frame.frame_num as i32;
    let current = client.frame(current_num);

    let old = if client.last_frame <= 0
        || current_num - client.last_frame >= (UPDATE_BACKUP as i32 - 3)
    {
        None
    } else {
        let old = client.frame(client.last_frame);
        // Overwritten slot or a frame from a previous map.
        (old.server_frame == client.last_frame).then_some(old)
    };

    match old {
        Some(old) => {
            let (entities, removed) = delta_entities(&old.entities, &current.entities);
            FrameUpdate {
                server_frame: current_num,
                delta_frame: client.last_frame,
                entities,
                removed,
            }
        }
        None => {
            // Baselines are sorted by entity number like every state list.
            let (entities, removed) = delta_entities(&frame.baselines, &current.entities);
            FrameUpdate {
                server_frame: current_num,
                delta_frame: -1,
                entities,
                removed,
            }
        }
    }
}
