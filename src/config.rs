use std::time::Duration;

use crate::id::ReplicaId;

/// Election timeout range while no leader is known: short, to converge quickly.
pub const ELECTION_TIMEOUT_LEADERLESS: (Duration, Duration) =
    (Duration::from_millis(50), Duration::from_millis(100));

/// Election timeout range once a leader is known: longer, to avoid false-positive elections.
pub const ELECTION_TIMEOUT_KNOWN_LEADER: (Duration, Duration) =
    (Duration::from_millis(250), Duration::from_millis(400));

/// Leader-only: interval between heartbeats, unthrottled broadcast AppendEntries.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(125);

/// Leader-only: minimum spacing between per-peer catch-up AppendEntries sends.
pub const SEND_FREQ: Duration = Duration::from_millis(25);

/// Maximum number of log entries batched into a single AppendEntries RPC.
pub const APPEND_ENTRIES_BATCH_CAP: usize = 100;

/// How long a buffered client request survives with no known leader before it is failed:
/// `5 * HEARTBEAT_INTERVAL`.
pub const BUFFERED_CLIENT_FAIL_AFTER: Duration = Duration::from_millis(625);

/// How long a pending read survives before it is failed as stale: `3 * HEARTBEAT_INTERVAL`.
pub const PENDING_READ_STALE_AFTER: Duration = Duration::from_millis(375);

/// Transport receive timeout per event loop iteration.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(50);

/// Local-host port convention used by `UdpTransport` to turn a replica id into a socket address:
/// `127.0.0.1:<BASE_PORT + value-of-id-as-hex>`. This lets a whole cluster run on one host for
/// local testing without a separate address book file; it is not part of the wire contract.
pub const BASE_PORT: u16 = 20_000;

/// Static cluster configuration a replica is constructed from: who it is, and who its peers are.
#[derive(Debug, Clone)]
pub struct Config {
    pub self_id: ReplicaId,
    pub peers: Vec<ReplicaId>,
}

impl Config {
    pub fn new(self_id: ReplicaId, peers: Vec<ReplicaId>) -> Self {
        Config { self_id, peers }
    }

    /// Total cluster size, including self.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Strict majority of the full cluster, including self: `ceil((N+1)/2)` where `N` is
    /// `cluster_size()`. Equivalent to `N / 2 + 1` for all `N >= 1`.
    pub fn quorum(&self) -> usize {
        (self.cluster_size() + 1).div_ceil(2)
    }
}
