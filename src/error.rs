//! Error types for the peer pool.
//!
//! This module provides the error taxonomy for peer connection, request,
//! and pool-management operations. Background operations (node-info pushes,
//! status fetches, per-socket errors) never surface these types to a
//! caller — they become events instead (see [`crate::events`]).

use crate::peer_info::PeerId;
use thiserror::Error;

/// Pool and peer-connection operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No peer was available to satisfy a `request`/`send`, or the
    /// selector returned an empty set.
    #[error("request failed: {reason}")]
    RequestFail { reason: String },

    /// A request exceeded its configured ack timeout.
    #[error("request to {peer} timed out after {timeout_ms}ms")]
    RequestTimeout { peer: PeerId, timeout_ms: u64 },

    /// `send`/`send_to_peer` could not reach the destination.
    #[error("send to {peer} failed: {reason}")]
    SendFail { peer: PeerId, reason: String },

    /// `add_inbound_peer` was called with a `peer_id` already present.
    #[error("duplicate peer: {0}")]
    DuplicatePeer(PeerId),

    /// `apply_penalty` (or another peer-targeted operation) referenced an
    /// unknown `peer_id`.
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// The underlying socket reported a transport-level failure.
    #[error("transport error with {peer}: {reason}")]
    Transport { peer: PeerId, reason: String },

    /// An outbound dial did not complete within `connect_timeout`.
    #[error("connection to {peer} timed out after {timeout_ms}ms")]
    ConnectTimeout { peer: PeerId, timeout_ms: u64 },
}

/// Convenience alias for results returned by pool and connection operations.
pub type PoolResult<T> = Result<T, PoolError>;
