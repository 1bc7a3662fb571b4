//! Tunables recognized by the pool constructor.

use std::time::Duration;

/// Maximum number of peer addresses discovery returns in one probe.
pub const MAX_PEER_LIST_BATCH_SIZE: usize = 100;

/// Maximum number of connected peers sampled for one discovery round.
pub const MAX_PEER_DISCOVERY_PROBE_SAMPLE_SIZE: usize = 100;

/// Per-connection timeouts and ban duration applied to every peer.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Outbound dial timeout. Default 2s.
    pub connect_timeout: Duration,
    /// Request/response timeout. Default 10s.
    pub ack_timeout: Duration,
    /// Unban delay after a ban is triggered.
    pub ban_time: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(10),
            ban_time: Duration::from_secs(60),
        }
    }
}

/// Top-level pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Per-connection timeouts and ban duration applied to every peer.
    pub connection: ConnectionConfig,
    /// Fan-out limit for `send`. Default 16.
    pub send_peer_limit: usize,
    /// Hard cap on outbound peers.
    pub max_outbound_connections: usize,
    /// Hard cap on inbound peers; exceeding triggers random inbound
    /// eviction.
    pub max_inbound_connections: usize,
    /// Period of the outbound-shuffle timer.
    pub outbound_eviction_interval: Duration,
    /// Accumulated penalty at which a peer is banned.
    ///
    /// Not specified by the source this crate generalizes from (see
    /// DESIGN.md); callers should tune it to their own penalty weights
    /// rather than rely on this default.
    pub ban_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            send_peer_limit: 16,
            max_outbound_connections: 20,
            max_inbound_connections: 20,
            outbound_eviction_interval: Duration::from_secs(5 * 60),
            ban_threshold: 100,
        }
    }
}
