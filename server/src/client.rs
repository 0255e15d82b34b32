//! Per-connection client records
//!
//! A [`ClientRecord`] holds everything the server knows about one slot:
//! - Connection state and the sequenced channel to the client
//! - Frame acknowledgement, latency samples and the computed ping
//! - Outgoing rate history used to suppress frames for slow links
//! - The movement time budget and any file download in progress
//!
//! Records are allocated once per slot and reset in place on reconnect.

use shared::{
    ClientMessage, EntityState, InfoString, NetChannel, PrintLevel, ServerMessage, UserCmd,
    UPDATE_BACKUP, UPDATE_MASK,
};
use std::net::SocketAddr;

/// Latency samples kept per client, indexed by acknowledged frame.
pub const LATENCY_COUNTS: usize = 16;
/// Frames of datagram sizes kept for rate limiting, one second's worth.
pub const RATE_MESSAGES: usize = 10;

/// Bytes per second assumed when a client does not say.
pub const DEFAULT_RATE: u32 = 5000;
pub const MIN_RATE: u32 = 100;
pub const MAX_RATE: u32 = 25000;

/// Command time a client may spend per 16 frames, plus some slop.
pub const COMMAND_MSEC_BUDGET: i32 = 1800;

pub type ServerChannel = NetChannel<ServerMessage, ClientMessage>;

/// Connection state of a slot. Ordered so that `>= Connected` means the
/// slot belongs to a live client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ClientState {
    #[default]
    Free,
    /// Dropped; held for a grace period so final reliable data can go out.
    Zombie,
    Connected,
    Spawned,
}

/// Round-trip samples indexed by acknowledged frame number.
///
/// `None` means no sample; a measured 0 ms round trip is still a sample.
#[derive(Debug, Clone, Default)]
pub struct LatencyRing {
    samples: [Option<u32>; LATENCY_COUNTS],
}

impl LatencyRing {
    pub fn record(&mut self, frame: i32, latency: u32) {
        let cursor = frame as usize % LATENCY_COUNTS;
        self.samples[cursor] = Some(latency);
    }

    /// Mean of the recorded samples, 0 when there are none.
    pub fn mean(&self) -> u32 {
        let (total, count) = self
            .samples
            .iter()
            .flatten()
            .fold((0u64, 0u64), |(total, count), &s| (total + s as u64, count + 1));
        if count == 0 {
            0
        } else {
            (total / count) as u32
        }
    }

    pub fn clear(&mut self) {
        self.samples = [None; LATENCY_COUNTS];
    }
}

/// Sizes of the last `RATE_MESSAGES` datagrams, one slot per frame.
///
/// A suppressed frame still takes its slot with a size of 0, so the window
/// slides forward even when nothing was sent.
#[derive(Debug, Clone, Default)]
pub struct RateHistory {
    sizes: [u32; RATE_MESSAGES],
}

impl RateHistory {
    pub fn total(&self) -> u32 {
        self.sizes.iter().sum()
    }

    pub fn set(&mut self, frame: u32, size: u32) {
        self.sizes[frame as usize % RATE_MESSAGES] = size;
    }
}

/// A file being streamed to the client.
///
/// The whole file is read when the download starts; chunks are handed out
/// from `offset` as the client asks for the next one.
#[derive(Debug, Clone)]
pub struct Download {
    /// Path relative to the download directory, as the client asked for it
    pub name: String,
    /// File contents
    pub data: Vec<u8>,
    /// Bytes already queued to the client
    pub offset: usize,
}

impl Download {
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn percent(&self) -> u64 {
        if self.data.is_empty() {
            100
        } else {
            (self.offset as u64 * 100) / self.data.len() as u64
        }
    }
}

/// A snapshot as it was sent, kept so later frames can be delta compressed
/// against whatever the client acknowledges.
#[derive(Debug, Clone, Default)]
pub struct ClientFrame {
    /// 0 when the slot never held a frame; real frames start at 1.
    pub server_frame: i32,
    pub sent_time: u64,
    pub entities: Vec<EntityState>,
}

/// Everything the server tracks for one client slot
///
/// A record is FREE until a connect request is admitted into it. From then
/// on the slot index is the client's identity: packets are matched to it by
/// IP and qport, and the game sees it as entity `slot + 1`. Dropping a
/// client leaves the record as a ZOMBIE for a grace period so its final
/// reliable messages still go out.
#[derive(Debug, Default)]
pub struct ClientRecord {
    /// Where the slot is in the connection lifecycle
    pub state: ClientState,
    /// The client's `\key\value` settings, with the server's forced `ip` key
    pub user_info: InfoString,

    /// Last frame the client acknowledged, only moves forward within a
    /// connection. 0 or less asks for a full snapshot.
    pub last_frame: i32,
    /// The most recent movement command handed to the game
    pub last_cmd: UserCmd,
    /// Movement time left in this budget window.
    pub command_msec: i32,

    /// Round-trip samples taken when frames are acknowledged
    pub latency: LatencyRing,
    /// Mean of the latency samples, recomputed every frame
    pub ping: u32,

    /// Sizes of recent datagrams, checked against `rate` before each frame
    pub rate_history: RateHistory,
    /// Bytes per second.
    pub rate: u32,
    /// Frames skipped because the client was over its rate
    pub suppress_count: u32,

    /// Game entity number, always `slot + 1`
    pub entity: usize,
    /// Player name taken from the user info
    pub name: String,
    /// Prints below this level are not sent.
    pub message_level: i32,

    /// Unreliable messages for the next datagram.
    pub datagram: Vec<ServerMessage>,
    /// Snapshots as sent, kept for delta compression against later acks
    pub frames: [ClientFrame; UPDATE_BACKUP],

    /// Real time of the last accepted packet; drives time-outs and, for a
    /// ZOMBIE, the grace period before the slot is free again
    pub last_message: u64,
    /// Real time of the last admitted connect, for the reconnect limit
    pub last_connect: u64,
    /// The challenge token the client connected with
    pub challenge: i32,

    /// Sequenced channel to the client; `None` only for a never-used slot
    pub netchan: Option<ServerChannel>,
    /// File download in progress
    pub download: Option<Download>,
}

impl ClientRecord {
    /// True for CONNECTED and SPAWNED clients, the ones that count towards
    /// the player total and appear in status replies.
    pub fn is_active(&self) -> bool {
        self.state >= ClientState::Connected
    }

    /// Remote address of the channel, following NAT port changes.
    pub fn address(&self) -> Option<SocketAddr> {
        self.netchan.as_ref().map(|chan| chan.remote_address)
    }

    /// Client-chosen port id that survives NAT port re-mapping.
    pub fn qport(&self) -> Option<u16> {
        self.netchan.as_ref().map(|chan| chan.qport)
    }

    /// Queues a reliable message. Does nothing for a slot without a channel.
    pub fn send_reliable(&mut self, message: ServerMessage) {
        if let Some(chan) = self.netchan.as_mut() {
            chan.send_reliable(message);
        }
    }

    /// Reliable print, filtered by the client's message level.
    pub fn print(&mut self, level: PrintLevel, text: &str) {
        if level.as_level() < self.message_level {
            return;
        }
        self.send_reliable(ServerMessage::Print {
            level,
            text: text.to_string(),
        });
    }

    /// The snapshot slot `frame` maps to. The slot may hold an older frame;
    /// compare `server_frame` before trusting it.
    pub fn frame(&self, frame: i32) -> &ClientFrame {
        &self.frames[frame as usize & UPDATE_MASK]
    }

    pub fn frame_mut(&mut self, frame: i32) -> &mut ClientFrame {
        &mut self.frames[frame as usize & UPDATE_MASK]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Side;

    #[test]
    fn test_states_are_ordered() {
        assert!(ClientState::Spawned > ClientState::Connected);
        assert!(ClientState::Connected > ClientState::Zombie);
        assert!(ClientState::Zombie > ClientState::Free);
        assert_eq!(ClientState::default(), ClientState::Free);
    }

    #[test]
    fn test_latency_mean_ignores_missing_samples() {
        let mut ring = LatencyRing::default();
        assert_eq!(ring.mean(), 0);

        ring.record(1, 40);
        ring.record(2, 60);
        assert_eq!(ring.mean(), 50);

        // A real zero is a sample.
        ring.record(3, 0);
        assert_eq!(ring.mean(), 33);

        // Frame 17 shares a slot with frame 1.
        ring.record(17, 100);
        assert_eq!(ring.mean(), 53);

        ring.clear();
        assert_eq!(ring.mean(), 0);
    }

    #[test]
    fn test_rate_history_wraps_by_frame() {
        let mut history = RateHistory::default();
        for frame in 0..RATE_MESSAGES as u32 {
            history.set(frame, 100);
        }
        assert_eq!(history.total(), 1000);
        history.set(RATE_MESSAGES as u32, 0);
        assert_eq!(history.total(), 900);
    }

    #[test]
    fn test_print_respects_message_level() {
        let mut client = ClientRecord {
            message_level: PrintLevel::High.as_level(),
            netchan: Some(NetChannel::new(
                Side::Server,
                "10.0.0.2:27901".parse().unwrap(),
                1,
                0,
            )),
            ..Default::default()
        };

        client.print(PrintLevel::Low, "ignored\n");
        assert!(!client.netchan.as_ref().unwrap().has_pending_reliable());

        client.print(PrintLevel::Chat, "hello\n");
        assert!(client.netchan.as_ref().unwrap().has_pending_reliable());
    }

    #[test]
    fn test_frame_ring_uses_update_mask() {
        let mut client = ClientRecord::default();
        client.frame_mut(3).server_frame = 3;
        assert_eq!(client.frame(3 + UPDATE_BACKUP as i32).server_frame, 3);
    }

    #[test]
    fn test_download_progress() {
        let download = Download {
            name: "maps/q2dm1.bsp".to_string(),
            data: vec![0; 4000],
            offset: 1000,
        };
        assert_eq!(download.remaining(), 3000);
        assert_eq!(download.percent(), 25);
    }
}
