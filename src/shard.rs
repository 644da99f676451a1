use crate::connection::ConnectionCommand;
use tokio::sync::{mpsc, watch};

/// Connection status of one shard. Exactly one holds at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShardStatus {
    /// Never connected
    #[default]
    Idle,
    /// First connection attempt in flight
    Connecting,
    /// Socket open, waiting for HELLO
    Nearly,
    /// IDENTIFY queued or sent, waiting for READY
    Identifying,
    /// RESUME sent, waiting for RESUMED
    Resuming,
    /// READY received, guilds still streaming in
    WaitingForGuilds,
    Ready,
    /// Reconnect attempt in flight, or a new session is being started
    Reconnecting,
    /// Socket gone, reconnect pending
    Disconnected,
    /// Torn down for good
    Destroyed,
}

impl ShardStatus {
    /// Whether a socket session is established enough for application frames.
    pub fn accepts_application_frames(self) -> bool {
        matches!(self, ShardStatus::WaitingForGuilds | ShardStatus::Ready)
    }

    /// Statuses in which a missing heartbeat ack is tolerated.
    pub fn tolerates_missing_ack(self) -> bool {
        matches!(
            self,
            ShardStatus::WaitingForGuilds | ShardStatus::Identifying | ShardStatus::Resuming
        )
    }
}

/// Route a key (e.g. a guild id) to the shard that owns it.
pub fn shard_for_key(key: u64, shard_count: u32) -> u32 {
    (key % u64::from(shard_count.max(1))) as u32
}

/// Fleet-side handle to a running shard connection
#[derive(Debug)]
pub struct Shard {
    /// Shard identifier
    pub id: u32,
    /// Command sender for this shard's connection
    command_tx: mpsc::Sender<ConnectionCommand>,
    /// Latest status published by the connection task
    status_rx: watch::Receiver<ShardStatus>,
}

impl Shard {
    pub(crate) fn new(
        id: u32,
        command_tx: mpsc::Sender<ConnectionCommand>,
        status_rx: watch::Receiver<ShardStatus>,
    ) -> Self {
        Self {
            id,
            command_tx,
            status_rx,
        }
    }

    pub fn status(&self) -> ShardStatus {
        *self.status_rx.borrow()
    }

    pub(crate) fn commands(&self) -> mpsc::Sender<ConnectionCommand> {
        self.command_tx.clone()
    }
}
