//! Peer and node identity/attribute types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical peer identity: `"{ip_address}:{ws_port}"`.
///
/// This is the unique key for a live peer across the pool's peer map, the
/// directory's new/tried buckets, and the ban table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(ip_address: &str, ws_port: u16) -> Self {
        Self(format!("{}:{}", ip_address, ws_port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&PeerInfo> for PeerId {
    fn from(info: &PeerInfo) -> Self {
        PeerId::new(&info.ip_address, info.ws_port)
    }
}

/// Optional attributes discovered about a remote peer via `fetch_status`
/// or a `getPeers`-equivalent discovery probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredAttributes {
    pub version: Option<String>,
    pub height: Option<u64>,
    pub broadhash: Option<String>,
    pub nonce: Option<u64>,
    pub os: Option<String>,
    pub http_port: Option<u16>,
    pub protocol_version: Option<String>,
}

/// Identity and advertised attributes of a remote node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub ip_address: String,
    pub ws_port: u16,
    pub discovered: Option<DiscoveredAttributes>,
}

impl PeerInfo {
    pub fn new(ip_address: impl Into<String>, ws_port: u16) -> Self {
        Self {
            ip_address: ip_address.into(),
            ws_port,
            discovered: None,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self)
    }
}

/// `PeerInfo` enriched with the attributes returned by a successful status
/// fetch or discovery probe; what `fetch_status_and_create_peers` and
/// `run_discovery` return to the host.
pub type DiscoveredPeerInfo = PeerInfo;

/// The local node's advertised state, propagated to every connected peer
/// whenever it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub version: String,
    pub height: u64,
    pub broadhash: String,
    pub nonce: u64,
    pub os: String,
    pub ws_port: u16,
    pub http_port: u16,
    pub protocol_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_formats_ip_colon_port() {
        let id = PeerId::new("1.2.3.4", 5000);
        assert_eq!(id.as_str(), "1.2.3.4:5000");
    }

    #[test]
    fn peer_id_derived_from_peer_info_matches_fields() {
        let info = PeerInfo::new("10.0.0.1", 5000);
        assert_eq!(info.peer_id(), PeerId::new("10.0.0.1", 5000));
    }
}
