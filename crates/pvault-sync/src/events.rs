use uuid::Uuid;

/// Published by the server and the scheduler. The daemon turns these into
/// metrics; nothing in this crate depends on them being received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A client-side sync of one vault finished
    Synced {
        vault: Uuid,
        node: Uuid,
        pulled: usize,
        pushed: usize,
    },
    /// A vault failed to sync with a peer
    SyncFailed { vault: Uuid, address: String },
    /// A peer pulled from or pushed to us
    Served { vault: Uuid, node: Uuid },
    /// A scheduler round that attempted at least one sync finished
    RoundFinished { synced: usize, failed: usize },
    PairingCompleted { vault: Uuid, node: Uuid },
    PairingFailed { vault: Uuid },
}
