//! Typed event surface.
//!
//! The source this crate generalizes from relies on a string-named event
//! hub with listener arrays. Here every event kind is an enum variant with
//! a statically-typed payload, dispatched over a single
//! [`tokio::sync::broadcast`] channel per pool, so the host subscribes
//! once instead of registering a listener per peer per event name.

use crate::peer_info::{DiscoveredPeerInfo, PeerId, PeerInfo};

/// Lifecycle and traffic events emitted by one [`crate::peer_connection::PeerConnection`].
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The remote issued a request we must answer (host-level requests are
    /// answered through the socket directly; this variant is for hosts
    /// that want visibility into inbound traffic).
    RequestReceived { procedure: String, payload: Vec<u8> },
    /// The remote sent a fire-and-forget message.
    MessageReceived { procedure: String, payload: Vec<u8> },
    /// An outbound dial completed and the socket is connected.
    ConnectOutbound,
    /// An outbound dial was abandoned before completing.
    ConnectAbortOutbound { reason: String },
    /// An outbound connection closed.
    CloseOutbound,
    /// An inbound connection closed.
    CloseInbound,
    /// The outbound socket reported a transport error.
    OutboundSocketError { reason: String },
    /// The inbound socket reported a transport error.
    InboundSocketError { reason: String },
    /// `apply_node_info` on this peer succeeded.
    UpdatedPeerInfo(PeerInfo),
    /// `apply_node_info` on this peer failed.
    FailedPeerInfoUpdate { reason: String },
    /// Accumulated penalty crossed the ban threshold.
    BanPeer,
    /// The ban period elapsed.
    UnbanPeer,
}

/// The full event surface consumed by the host: every [`PeerEvent`]
/// re-emitted with its originating peer, plus pool-level events that have
/// no single owning peer.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A per-peer event, re-emitted with identical semantics to the
    /// connection that produced it.
    Peer { peer_id: PeerId, event: PeerEvent },
    /// Discovery (or a seed status-fetch) turned up a peer not previously
    /// known, or refreshed the info of one already in the map.
    DiscoveredPeer(DiscoveredPeerInfo),
    /// A per-peer status-fetch probe failed; discovery itself never fails.
    FailedToFetchPeerInfo { peer_id: PeerId, reason: String },
    /// A per-peer `apply_node_info` push failed during fan-out.
    FailedToPushNodeInfo { peer_id: PeerId, reason: String },
}
