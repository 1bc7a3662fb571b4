//! Pluggable, pure peer-selection functions.
//!
//! Each selector maps `(candidates, node_info, limit, packet?)` to a chosen
//! subset. The pool never assumes an ordering on the result, only that it
//! is a subset of the input of size at most `peer_limit`.

use crate::peer_connection::PeerKind;
use crate::peer_info::{NodeInfo, PeerId, PeerInfo};
use rand::seq::SliceRandom;
use std::sync::Arc;

/// A read-only view of one live peer, cheap to pass to a pure selector
/// function without holding any lock across the call.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub info: PeerInfo,
    pub kind: PeerKind,
}

pub type SendSelector =
    Arc<dyn Fn(&[PeerSnapshot], Option<&NodeInfo>, usize, &str) -> Vec<PeerId> + Send + Sync>;
pub type RequestSelector =
    Arc<dyn Fn(&[PeerSnapshot], Option<&NodeInfo>, usize, &str) -> Vec<PeerId> + Send + Sync>;
/// Chooses among *candidate* `PeerInfo`s (not yet live connections) for
/// new outbound dials.
pub type ConnectionSelector = Arc<dyn Fn(&[PeerInfo], usize) -> Vec<PeerId> + Send + Sync>;

/// Random selection of up to `peer_limit` candidates, ignoring the
/// outgoing packet and node info. A reasonable default for `send`.
pub fn default_select_for_send() -> SendSelector {
    Arc::new(|peers, _node_info, peer_limit, _packet| random_subset(peers, peer_limit))
}

/// Random selection of up to `peer_limit` candidates for `request`. The
/// pool calls this with `peer_limit = 1`.
pub fn default_select_for_request() -> RequestSelector {
    Arc::new(|peers, _node_info, peer_limit, _packet| random_subset(peers, peer_limit))
}

/// Random selection of up to `peer_limit` candidates for new outbound
/// connections.
pub fn default_select_for_connection() -> ConnectionSelector {
    Arc::new(|candidates, peer_limit| {
        let mut ids: Vec<PeerId> = candidates.iter().map(|info| info.peer_id()).collect();
        ids.shuffle(&mut rand::thread_rng());
        ids.truncate(peer_limit);
        ids
    })
}

fn random_subset(peers: &[PeerSnapshot], limit: usize) -> Vec<PeerId> {
    let mut ids: Vec<PeerId> = peers.iter().map(|p| p.id.clone()).collect();
    ids.shuffle(&mut rand::thread_rng());
    ids.truncate(limit);
    ids
}
