//! A single live duplex channel to one remote peer.

use crate::config::ConnectionConfig;
use crate::error::{PoolError, PoolResult};
use crate::events::PeerEvent;
use crate::peer_info::{PeerId, PeerInfo};
use crate::socket::{PeerSocket, SocketEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tracing::debug;

/// Whether a connection was dialed by us or accepted from a remote dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Inbound,
    Outbound,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Closing,
    Closed,
    Banned,
}

/// Answers requests the remote issues against us. One handler serves an
/// entire pool, rather than a callback registered per connection.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, peer_id: &PeerId, procedure: &str, payload: Vec<u8>) -> Vec<u8>;
}

struct Inner {
    state: PeerState,
    penalty: u32,
}

/// One live peer. Created when the pool accepts an inbound socket or dials
/// an outbound candidate; destroyed when the socket closes, the peer is
/// evicted, or accumulated penalty triggers a ban.
pub struct PeerConnection {
    pub id: PeerId,
    peer_info: RwLock<PeerInfo>,
    pub kind: PeerKind,
    socket: RwLock<Option<Arc<dyn PeerSocket>>>,
    config: ConnectionConfig,
    ban_threshold: u32,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<PeerEvent>,
    request_handler: Option<Arc<dyn RequestHandler>>,
    event_loop_spawned: AtomicBool,
}

impl PeerConnection {
    /// Builds a connection. `socket` is `None` for an outbound peer added
    /// before its dial completes (dialed lazily); call
    /// [`PeerConnection::attach_socket`] once the dial succeeds, or
    /// [`PeerConnection::abort_dial`] if it fails.
    pub fn new(
        id: PeerId,
        peer_info: PeerInfo,
        kind: PeerKind,
        socket: Option<Arc<dyn PeerSocket>>,
        config: ConnectionConfig,
        ban_threshold: u32,
        request_handler: Option<Arc<dyn RequestHandler>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let initial_state = if socket.is_some() {
            PeerState::Connected
        } else {
            PeerState::Connecting
        };
        let conn = Arc::new(Self {
            id,
            peer_info: RwLock::new(peer_info),
            kind,
            socket: RwLock::new(socket.clone()),
            config,
            ban_threshold,
            inner: Mutex::new(Inner {
                state: initial_state,
                penalty: 0,
            }),
            events,
            request_handler,
            event_loop_spawned: AtomicBool::new(false),
        });
        if let Some(socket) = socket {
            conn.clone().spawn_event_loop(socket);
            if conn.kind == PeerKind::Outbound {
                let _ = conn.events.send(PeerEvent::ConnectOutbound);
            }
        }
        (conn, events_rx)
    }

    /// Completes a lazily-dialed outbound connection.
    pub async fn attach_socket(self: &Arc<Self>, socket: Arc<dyn PeerSocket>) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != PeerState::Connecting {
                return;
            }
            inner.state = PeerState::Connected;
        }
        *self.socket.write().await = Some(socket.clone());
        self.clone().spawn_event_loop(socket);
        let _ = self.events.send(PeerEvent::ConnectOutbound);
    }

    /// Abandons a lazily-dialed outbound connection whose dial failed
    /// before ever reaching `Connected`. Emits `ConnectAbortOutbound`
    /// rather than a close event, since no socket was ever live. No-op if
    /// the connection already left `Connecting` by some other path.
    pub async fn abort_dial(&self, reason: String) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != PeerState::Connecting {
                return;
            }
            inner.state = PeerState::Closed;
        }
        let _ = self.events.send(PeerEvent::ConnectAbortOutbound { reason });
    }

    fn spawn_event_loop(self: Arc<Self>, socket: Arc<dyn PeerSocket>) {
        if self
            .event_loop_spawned
            .swap(true, Ordering::SeqCst)
        {
            return;
        }
        let Some(mut rx) = socket.take_events() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.handle_socket_event(event).await;
            }
        });
    }

    async fn handle_socket_event(&self, event: SocketEvent) {
        match event {
            SocketEvent::RequestReceived {
                procedure,
                payload,
                responder,
            } => {
                let _ = self.events.send(PeerEvent::RequestReceived {
                    procedure: procedure.clone(),
                    payload: payload.clone(),
                });
                let response = match &self.request_handler {
                    Some(handler) => handler.handle_request(&self.id, &procedure, payload).await,
                    None => Vec::new(),
                };
                let _ = responder.send(response);
            }
            SocketEvent::MessageReceived { procedure, payload } => {
                let _ = self
                    .events
                    .send(PeerEvent::MessageReceived { procedure, payload });
            }
            SocketEvent::Closed => {
                let was_banned = {
                    let mut inner = self.inner.lock().await;
                    if inner.state == PeerState::Closed || inner.state == PeerState::Banned {
                        true
                    } else {
                        inner.state = PeerState::Closed;
                        false
                    }
                };
                if !was_banned {
                    let close_event = match self.kind {
                        PeerKind::Outbound => PeerEvent::CloseOutbound,
                        PeerKind::Inbound => PeerEvent::CloseInbound,
                    };
                    let _ = self.events.send(close_event);
                }
            }
            SocketEvent::Error(reason) => {
                // The event loop only ever starts once a socket is live
                // (see `spawn_event_loop`'s callers), so a connection is
                // always past `Connecting` by the time it can observe a
                // transport error here; dial failures are reported
                // separately via `abort_dial`.
                let event = match self.kind {
                    PeerKind::Outbound => PeerEvent::OutboundSocketError { reason },
                    PeerKind::Inbound => PeerEvent::InboundSocketError { reason },
                };
                let _ = self.events.send(event);
            }
        }
    }

    pub async fn state(&self) -> PeerState {
        self.inner.lock().await.state
    }

    pub async fn penalty(&self) -> u32 {
        self.inner.lock().await.penalty
    }

    pub async fn peer_info(&self) -> PeerInfo {
        self.peer_info.read().await.clone()
    }

    /// Sends a request and awaits the correlated reply within `ack_timeout`.
    pub async fn request(&self, procedure: &str, payload: Vec<u8>) -> PoolResult<Vec<u8>> {
        let socket = self.connected_socket().await?;
        match timeout(
            self.config.ack_timeout,
            socket.request(procedure, payload),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(PoolError::RequestFail {
                reason: err.to_string(),
            }),
            Err(_) => Err(PoolError::RequestTimeout {
                peer: self.id.clone(),
                timeout_ms: self.config.ack_timeout.as_millis() as u64,
            }),
        }
    }

    /// Fire-and-forget send.
    pub async fn send(&self, procedure: &str, payload: Vec<u8>) -> PoolResult<()> {
        let socket = self.connected_socket().await?;
        socket
            .send(procedure, payload)
            .await
            .map_err(|err| PoolError::SendFail {
                peer: self.id.clone(),
                reason: err.to_string(),
            })
    }

    /// Convenience request returning the remote's advertised state.
    pub async fn fetch_status(&self) -> PoolResult<Vec<u8>> {
        self.request("fetchStatus", Vec::new()).await
    }

    /// Push-style update of the local node's advertised state to the
    /// remote.
    pub async fn apply_node_info(&self, node_info: Vec<u8>) -> PoolResult<()> {
        self.send("applyNodeInfo", node_info).await
    }

    /// Records `peer_info` as the remote's latest advertised identity,
    /// e.g. after a successful `fetch_status` or discovery probe.
    pub async fn set_peer_info(&self, peer_info: PeerInfo) {
        *self.peer_info.write().await = peer_info.clone();
        let _ = self.events.send(PeerEvent::UpdatedPeerInfo(peer_info));
    }

    pub fn report_failed_peer_info_update(&self, reason: String) {
        let _ = self
            .events
            .send(PeerEvent::FailedPeerInfoUpdate { reason });
    }

    /// Adds `weight` to the accumulated penalty; bans the peer once the
    /// sum reaches `ban_threshold`.
    pub async fn apply_penalty(&self, weight: u32) {
        let newly_banned = {
            let mut inner = self.inner.lock().await;
            if inner.state == PeerState::Closed || inner.state == PeerState::Banned {
                return;
            }
            inner.penalty = inner.penalty.saturating_add(weight);
            if inner.penalty >= self.ban_threshold && inner.state != PeerState::Banned {
                inner.state = PeerState::Banned;
                true
            } else {
                false
            }
        };
        if newly_banned {
            let _ = self.events.send(PeerEvent::BanPeer);
            debug!(peer = %self.id, "peer banned after accumulated penalty");
            // Banning tears the connection down; the accompanying close
            // event is what the pool uses to drop the peer from its map.
            if let Some(socket) = self.socket.read().await.as_ref() {
                socket.close().await;
            }
            let close_event = match self.kind {
                PeerKind::Outbound => PeerEvent::CloseOutbound,
                PeerKind::Inbound => PeerEvent::CloseInbound,
            };
            let _ = self.events.send(close_event);
        }
    }

    /// Emits `UnbanPeer`. Idempotent: a peer already removed by other
    /// means simply has nobody left to observe this event.
    pub fn emit_unban(&self) {
        let _ = self.events.send(PeerEvent::UnbanPeer);
    }

    /// Idempotent disconnect: transitions to `Closing` then `Closed` and
    /// emits the close event appropriate to `kind`.
    pub async fn disconnect(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == PeerState::Closed || inner.state == PeerState::Banned {
                return;
            }
            inner.state = PeerState::Closing;
        }
        if let Some(socket) = self.socket.read().await.as_ref() {
            socket.close().await;
        }
        {
            let mut inner = self.inner.lock().await;
            inner.state = PeerState::Closed;
        }
        let close_event = match self.kind {
            PeerKind::Outbound => PeerEvent::CloseOutbound,
            PeerKind::Inbound => PeerEvent::CloseInbound,
        };
        let _ = self.events.send(close_event);
    }

    async fn connected_socket(&self) -> PoolResult<Arc<dyn PeerSocket>> {
        match self.socket.read().await.as_ref() {
            Some(socket) if socket.is_connected() => Ok(socket.clone()),
            Some(_) => Err(PoolError::SendFail {
                peer: self.id.clone(),
                reason: "socket not connected".to_string(),
            }),
            None => Err(PoolError::SendFail {
                peer: self.id.clone(),
                reason: "dial not yet complete".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::mock_pair;

    fn test_peer_info() -> PeerInfo {
        PeerInfo::new("127.0.0.1", 5000)
    }

    #[tokio::test]
    async fn new_outbound_with_socket_starts_connected_and_emits_connect() {
        let (a, _b) = mock_pair();
        let (conn, mut events) = PeerConnection::new(
            PeerId::new("127.0.0.1", 5000),
            test_peer_info(),
            PeerKind::Outbound,
            Some(Arc::new(a)),
            ConnectionConfig::default(),
            100,
            None,
        );
        assert_eq!(conn.state().await, PeerState::Connected);
        assert!(matches!(events.recv().await, Some(PeerEvent::ConnectOutbound)));
    }

    #[tokio::test]
    async fn lazy_outbound_starts_connecting_until_socket_attached() {
        let (conn, mut events) = PeerConnection::new(
            PeerId::new("127.0.0.1", 5000),
            test_peer_info(),
            PeerKind::Outbound,
            None,
            ConnectionConfig::default(),
            100,
            None,
        );
        assert_eq!(conn.state().await, PeerState::Connecting);

        let (a, _b) = mock_pair();
        conn.attach_socket(Arc::new(a)).await;
        assert_eq!(conn.state().await, PeerState::Connected);
        assert!(matches!(events.recv().await, Some(PeerEvent::ConnectOutbound)));
    }

    #[tokio::test]
    async fn abort_dial_emits_connect_abort_not_close() {
        let (conn, mut events) = PeerConnection::new(
            PeerId::new("127.0.0.1", 5000),
            test_peer_info(),
            PeerKind::Outbound,
            None,
            ConnectionConfig::default(),
            100,
            None,
        );
        assert_eq!(conn.state().await, PeerState::Connecting);

        conn.abort_dial("connect timed out".to_string()).await;
        assert_eq!(conn.state().await, PeerState::Closed);
        assert!(matches!(
            events.recv().await,
            Some(PeerEvent::ConnectAbortOutbound { .. })
        ));

        // Idempotent: aborting again after the state left `Connecting`
        // does nothing.
        conn.abort_dial("second failure".to_string()).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_emits_close_once() {
        let (a, _b) = mock_pair();
        let (conn, mut events) = PeerConnection::new(
            PeerId::new("127.0.0.1", 5000),
            test_peer_info(),
            PeerKind::Inbound,
            Some(Arc::new(a)),
            ConnectionConfig::default(),
            100,
            None,
        );
        conn.disconnect().await;
        conn.disconnect().await;
        assert_eq!(conn.state().await, PeerState::Closed);

        let mut close_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PeerEvent::CloseInbound) {
                close_events += 1;
            }
        }
        assert_eq!(close_events, 1);
    }

    #[tokio::test]
    async fn apply_penalty_bans_exactly_once_past_threshold() {
        let (a, _b) = mock_pair();
        let (conn, mut events) = PeerConnection::new(
            PeerId::new("127.0.0.1", 5000),
            test_peer_info(),
            PeerKind::Outbound,
            Some(Arc::new(a)),
            ConnectionConfig::default(),
            10,
            None,
        );
        // consume the ConnectOutbound event first
        let _ = events.recv().await;

        conn.apply_penalty(6).await;
        assert_eq!(conn.state().await, PeerState::Connected);
        conn.apply_penalty(6).await;
        assert_eq!(conn.state().await, PeerState::Banned);
        conn.apply_penalty(100).await;

        let mut bans = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PeerEvent::BanPeer) {
                bans += 1;
            }
        }
        assert_eq!(bans, 1);
    }

    #[tokio::test]
    async fn request_times_out_past_ack_timeout() {
        let (a, _b) = mock_pair();
        let config = ConnectionConfig {
            ack_timeout: std::time::Duration::from_millis(20),
            ..ConnectionConfig::default()
        };
        let (conn, _events) = PeerConnection::new(
            PeerId::new("127.0.0.1", 5000),
            test_peer_info(),
            PeerKind::Outbound,
            Some(Arc::new(a)),
            config,
            100,
            None,
        );
        // `_b` is dropped, so its receiver is gone and no responder will
        // ever complete; but the mock has already delivered the request
        // event to a channel nobody drains, so the oneshot simply never
        // resolves until timeout fires.
        let result = conn.request("getBlocks", vec![]).await;
        assert!(matches!(result, Err(PoolError::RequestTimeout { .. })));
    }
}
