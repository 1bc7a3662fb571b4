//! Peer discovery: probing a sample of connected peers for their peer
//! lists and merging the responses.

use crate::config::{MAX_PEER_DISCOVERY_PROBE_SAMPLE_SIZE, MAX_PEER_LIST_BATCH_SIZE};
use crate::peer_connection::PeerConnection;
use crate::peer_info::{DiscoveredPeerInfo, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// The `getPeers`-equivalent request procedure name.
pub const GET_PEERS_PROCEDURE: &str = "getPeers";

#[derive(Debug, Serialize, Deserialize, Default)]
struct GetPeersResponse {
    peers: Vec<DiscoveredPeerInfo>,
}

/// Result of one discovery round: the deduplicated, blacklist-filtered
/// peer list plus any per-peer probe failures (discovery itself never
/// fails — failures are reported, not propagated).
pub struct DiscoveryOutcome {
    pub discovered: Vec<DiscoveredPeerInfo>,
    pub failures: Vec<(PeerId, String)>,
}

/// Probes each of `sample` for its peer list, bounded to
/// `MAX_PEER_DISCOVERY_PROBE_SAMPLE_SIZE` entries, and returns the merged,
/// deduplicated, blacklist-filtered result.
pub async fn run(
    sample: &[(PeerId, Arc<PeerConnection>)],
    blacklist: &HashSet<String>,
) -> DiscoveryOutcome {
    let bounded_sample = &sample[..sample.len().min(MAX_PEER_DISCOVERY_PROBE_SAMPLE_SIZE)];

    let probes = bounded_sample.iter().map(|(peer_id, conn)| {
        let peer_id = peer_id.clone();
        let conn = conn.clone();
        async move {
            let result = conn.request(GET_PEERS_PROCEDURE, Vec::new()).await;
            (peer_id, result)
        }
    });
    let results = futures::future::join_all(probes).await;

    let mut merged: HashMap<PeerId, DiscoveredPeerInfo> = HashMap::new();
    let mut failures = Vec::new();

    for (peer_id, result) in results {
        match result {
            Ok(payload) => match serde_json::from_slice::<GetPeersResponse>(&payload) {
                Ok(response) => {
                    for info in response.peers.into_iter().take(MAX_PEER_LIST_BATCH_SIZE) {
                        if blacklist.contains(&info.ip_address) {
                            continue;
                        }
                        merged.insert(info.peer_id(), info);
                    }
                }
                Err(err) => failures.push((peer_id, err.to_string())),
            },
            Err(err) => failures.push((peer_id, err.to_string())),
        }
    }

    DiscoveryOutcome {
        discovered: merged.into_values().collect(),
        failures,
    }
}

/// Encodes a peer list as a `getPeers` response payload; the counterpart
/// a pool-wide [`crate::peer_connection::RequestHandler`] uses to answer
/// the procedure discovery issues.
pub fn encode_peer_list(peers: Vec<DiscoveredPeerInfo>) -> Vec<u8> {
    serde_json::to_vec(&GetPeersResponse { peers }).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::peer_connection::PeerKind;
    use crate::peer_info::PeerInfo;
    use crate::socket::{mock_pair, PeerSocket, SocketEvent};

    async fn connected_pair(id_port: u16) -> (Arc<PeerConnection>, crate::socket::MockSocket) {
        let (a, b) = mock_pair();
        let (conn, _events) = PeerConnection::new(
            PeerId::new("127.0.0.1", id_port),
            PeerInfo::new("127.0.0.1", id_port),
            PeerKind::Outbound,
            Some(Arc::new(a)),
            ConnectionConfig::default(),
            100,
            None,
        );
        (conn, b)
    }

    #[tokio::test]
    async fn discovery_merges_responses_and_applies_blacklist() {
        let (conn, remote) = connected_pair(5000).await;
        let mut remote_events = remote.take_events().unwrap();

        tokio::spawn(async move {
            if let Some(SocketEvent::RequestReceived { responder, .. }) =
                remote_events.recv().await
            {
                let payload = encode_peer_list(vec![
                    DiscoveredPeerInfo::new("10.0.0.2", 5000),
                    DiscoveredPeerInfo::new("10.0.0.3", 5000),
                ]);
                let _ = responder.send(payload);
            }
        });

        let mut blacklist = HashSet::new();
        blacklist.insert("10.0.0.2".to_string());

        let sample = vec![(PeerId::new("127.0.0.1", 5000), conn)];
        let outcome = run(&sample, &blacklist).await;

        assert_eq!(outcome.failures.len(), 0);
        let ips: Vec<_> = outcome
            .discovered
            .iter()
            .map(|p| p.ip_address.clone())
            .collect();
        assert_eq!(ips, vec!["10.0.0.3".to_string()]);
    }

    #[tokio::test]
    async fn discovery_swallows_a_failed_probe() {
        let (conn, remote) = connected_pair(5001).await;
        drop(remote);

        let sample = vec![(PeerId::new("127.0.0.1", 5001), conn)];
        let outcome = run(&sample, &HashSet::new()).await;

        assert_eq!(outcome.discovered.len(), 0);
        assert_eq!(outcome.failures.len(), 1);
    }
}
