//! # peer-pool
//!
//! A gossip-style peer connection manager for a P2P node: bounded inbound
//! and outbound connection pools, request/response and broadcast
//! multiplexing over pluggable transports, peer discovery, reputation
//! penalties and bans, and a single typed event stream tying it all
//! together.
//!
//! ## Architecture
//!
//! - [`socket`] — the [`socket::PeerSocket`] trait abstracts one duplex
//!   channel to a remote; [`socket::Dialer`] abstracts opening one. The
//!   pool is transport-agnostic; tests use the in-memory
//!   [`socket::MockSocket`], and an optional `ws` feature adds a
//!   `tokio-tungstenite`-backed adapter.
//! - [`peer_connection`] — [`peer_connection::PeerConnection`] owns one
//!   live peer's state machine (connecting/connected/closing/closed/banned),
//!   penalty accumulation, and request/send plumbing.
//! - [`directory`] — [`directory::PeerDirectory`] is the bucketed catalog
//!   of known addresses (new vs. tried), independent of which peers are
//!   currently connected.
//! - [`discovery`] — probes a sample of connected peers for their address
//!   lists and merges the results.
//! - [`selectors`] — pluggable, pure functions choosing which peers to
//!   target for `send`, `request`, and new outbound connections.
//! - [`pool`] — [`pool::PeerPool`] ties every component together behind
//!   the public operations a host actually calls.
//!
//! ## Example usage
//!
//! ```no_run
//! use peer_pool::config::PoolConfig;
//! use peer_pool::pool::PeerPool;
//! use peer_pool::selectors::{default_select_for_connection, default_select_for_request, default_select_for_send};
//! use peer_pool::socket::PresetDialer;
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let pool = PeerPool::new(
//!     PoolConfig::default(),
//!     default_select_for_send(),
//!     default_select_for_request(),
//!     default_select_for_connection(),
//!     Arc::new(PresetDialer::new()),
//!     None,
//! );
//!
//! let mut events = pool.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         tracing::debug!(?event, "pool event");
//!     }
//! });
//! # }
//! ```

pub mod config;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod events;
pub mod peer_connection;
pub mod peer_info;
pub mod pool;
pub mod selectors;
pub mod socket;

pub use config::{ConnectionConfig, PoolConfig};
pub use error::{PoolError, PoolResult};
pub use events::{PeerEvent, PoolEvent};
pub use peer_connection::{PeerConnection, PeerKind, PeerState, RequestHandler};
pub use peer_info::{DiscoveredPeerInfo, NodeInfo, PeerId, PeerInfo};
pub use pool::PeerPool;
pub use socket::{Dialer, PeerSocket, SocketError, SocketEvent};
