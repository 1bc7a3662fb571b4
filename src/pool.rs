//! `PeerPool`: the live-peer map, connection limits, discovery, eviction,
//! and bans — the central component tying every other module together.

use crate::config::{PoolConfig, MAX_PEER_DISCOVERY_PROBE_SAMPLE_SIZE};
use crate::directory::{PeerDirectory, Tier};
use crate::discovery;
use crate::error::{PoolError, PoolResult};
use crate::events::{PeerEvent, PoolEvent};
use crate::peer_connection::{PeerConnection, PeerKind, PeerState, RequestHandler};
use crate::peer_info::{DiscoveredPeerInfo, NodeInfo, PeerId, PeerInfo};
use crate::selectors::{ConnectionSelector, PeerSnapshot, RequestSelector, SendSelector};
use crate::socket::{Dialer, PeerSocket};
use rand::seq::{IteratorRandom, SliceRandom};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Owns the live-peer map and coordinates every other component.
pub struct PeerPool {
    config: PoolConfig,
    peers: RwLock<HashMap<PeerId, Arc<PeerConnection>>>,
    node_info: RwLock<Option<NodeInfo>>,
    banned_until: AsyncMutex<HashMap<PeerId, Instant>>,
    directory: AsyncMutex<PeerDirectory>,
    send_selector: SendSelector,
    request_selector: RequestSelector,
    connection_selector: ConnectionSelector,
    dialer: Arc<dyn Dialer>,
    request_handler: Option<Arc<dyn RequestHandler>>,
    event_tx: broadcast::Sender<PoolEvent>,
    shuffle_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    background_tasks: std::sync::Mutex<JoinSet<()>>,
}

impl PeerPool {
    /// `peer_selection_for_send`/`_for_request`/`_for_connection` and
    /// `dialer` are required: there is no sensible default for how a host
    /// chooses peers or opens connections.
    pub fn new(
        config: PoolConfig,
        send_selector: SendSelector,
        request_selector: RequestSelector,
        connection_selector: ConnectionSelector,
        dialer: Arc<dyn Dialer>,
        request_handler: Option<Arc<dyn RequestHandler>>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(1024);
        let secret = rand::random::<u64>();
        let pool = Arc::new(Self {
            config,
            peers: RwLock::new(HashMap::new()),
            node_info: RwLock::new(None),
            banned_until: AsyncMutex::new(HashMap::new()),
            directory: AsyncMutex::new(PeerDirectory::new(secret, 256, 64)),
            send_selector,
            request_selector,
            connection_selector,
            dialer,
            request_handler,
            event_tx,
            shuffle_handle: std::sync::Mutex::new(None),
            background_tasks: std::sync::Mutex::new(JoinSet::new()),
        });
        pool.start_outbound_shuffle();
        pool
    }

    /// Subscribes to the unified event stream (§6): every per-peer event
    /// plus `DiscoveredPeer`, `FailedToFetchPeerInfo`, `FailedToPushNodeInfo`.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.event_tx.subscribe()
    }

    // ---- reads -------------------------------------------------------

    pub async fn get_peers(&self, kind: Option<PeerKind>) -> Vec<Arc<PeerConnection>> {
        self.peers
            .read()
            .await
            .values()
            .filter(|conn| kind.map_or(true, |k| conn.kind == k))
            .cloned()
            .collect()
    }

    pub async fn get_peer(&self, peer_id: &PeerId) -> Option<Arc<PeerConnection>> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn get_all_peer_infos(&self) -> Vec<PeerInfo> {
        let peers: Vec<Arc<PeerConnection>> = self.peers.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(peers.len());
        for conn in peers {
            infos.push(conn.peer_info().await);
        }
        infos
    }

    pub async fn get_peers_count_per_kind(&self) -> (usize, usize) {
        let peers = self.peers.read().await;
        let inbound = peers.values().filter(|c| c.kind == PeerKind::Inbound).count();
        let outbound = peers.values().filter(|c| c.kind == PeerKind::Outbound).count();
        (inbound, outbound)
    }

    // ---- node info -----------------------------------------------------

    /// Stores `info` and asynchronously pushes it to every current peer.
    /// Per-peer failures emit `FailedToPushNodeInfo` and never fail the
    /// call itself.
    pub async fn apply_node_info(self: &Arc<Self>, info: NodeInfo) {
        *self.node_info.write().await = Some(info.clone());
        let payload = serde_json::to_vec(&info).unwrap_or_default();
        let peers: Vec<(PeerId, Arc<PeerConnection>)> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(id, conn)| (id.clone(), conn.clone()))
            .collect();

        let mut tasks = self.background_tasks.lock().expect("background tasks mutex poisoned");
        for (peer_id, conn) in peers {
            let pool = self.clone();
            let payload = payload.clone();
            tasks.spawn(async move {
                if let Err(err) = conn.apply_node_info(payload).await {
                    conn.report_failed_peer_info_update(err.to_string());
                    let _ = pool.event_tx.send(PoolEvent::FailedToPushNodeInfo {
                        peer_id,
                        reason: err.to_string(),
                    });
                }
            });
        }
    }

    // ---- request / send ------------------------------------------------

    /// Selects one peer via `select_for_request` and forwards to it.
    pub async fn request(&self, procedure: &str, payload: Vec<u8>) -> PoolResult<Vec<u8>> {
        let snapshots = self.peer_snapshots().await;
        let node_info = self.node_info.read().await.clone();
        let chosen = (self.request_selector)(&snapshots, node_info.as_ref(), 1, procedure);
        let peer_id = chosen.into_iter().next().ok_or_else(|| PoolError::RequestFail {
            reason: "no peers found in peer selection".to_string(),
        })?;
        self.request_from_peer(&peer_id, procedure, payload).await
    }

    pub async fn request_from_peer(
        &self,
        peer_id: &PeerId,
        procedure: &str,
        payload: Vec<u8>,
    ) -> PoolResult<Vec<u8>> {
        let conn = self
            .peers
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| PoolError::RequestFail {
                reason: format!("peer {} not in map", peer_id),
            })?;
        conn.request(procedure, payload).await
    }

    /// Fans out via `select_for_send`. Per-peer failures are logged, never
    /// propagated: only `apply_node_info`/status-fetch failures have
    /// dedicated events, so a broadcast send failure is an operational log
    /// line rather than an event.
    pub async fn send(&self, procedure: &str, payload: Vec<u8>) {
        let snapshots = self.peer_snapshots().await;
        let node_info = self.node_info.read().await.clone();
        let chosen = (self.send_selector)(
            &snapshots,
            node_info.as_ref(),
            self.config.send_peer_limit,
            procedure,
        );
        for peer_id in chosen {
            if let Err(err) = self.send_to_peer(&peer_id, procedure, payload.clone()).await {
                warn!(peer = %peer_id, error = %err, "send_to_peer failed during fan-out");
            }
        }
    }

    pub async fn send_to_peer(
        &self,
        peer_id: &PeerId,
        procedure: &str,
        payload: Vec<u8>,
    ) -> PoolResult<()> {
        let conn = self
            .peers
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| PoolError::SendFail {
                peer: peer_id.clone(),
                reason: "peer not in map".to_string(),
            })?;
        conn.send(procedure, payload).await
    }

    // ---- discovery / connection lifecycle ------------------------------

    /// Dials each seed, fetches its status, and adds successful ones as
    /// outbound peers. Failures emit `FailedToFetchPeerInfo` and are
    /// filtered from the result.
    pub async fn fetch_status_and_create_peers(
        self: &Arc<Self>,
        seeds: Vec<PeerInfo>,
    ) -> Vec<DiscoveredPeerInfo> {
        let mut discovered = Vec::new();
        for seed in seeds {
            let peer_id = seed.peer_id();
            let (_, outbound_count) = self.get_peers_count_per_kind().await;
            if outbound_count >= self.config.max_outbound_connections {
                self.emit_fetch_failure(peer_id, "max outbound connections reached".to_string());
                continue;
            }
            match timeout(self.config.connection.connect_timeout, self.dialer.dial(&seed)).await {
                Ok(Ok(socket)) => {
                    let conn = self
                        .add_outbound_peer(peer_id.clone(), seed.clone(), Some(socket))
                        .await;
                    match self.fetch_and_apply_status(&conn).await {
                        Ok(info) => discovered.push(info),
                        Err(reason) => self.emit_fetch_failure(peer_id, reason),
                    }
                }
                Ok(Err(err)) => self.emit_fetch_failure(peer_id, err.to_string()),
                Err(_) => self.emit_fetch_failure(peer_id, "connect timed out".to_string()),
            }
        }
        discovered
    }

    /// Ensures every `known_peer` has an outbound entry, samples up to
    /// `MAX_PEER_DISCOVERY_PROBE_SAMPLE_SIZE` connected peers, runs
    /// [`discovery::run`], and refreshes the info of any discovered peer
    /// already in the map.
    pub async fn run_discovery(
        self: &Arc<Self>,
        known_peers: Vec<PeerInfo>,
        blacklist: HashSet<String>,
    ) -> Vec<DiscoveredPeerInfo> {
        for info in &known_peers {
            let id = info.peer_id();
            if self.has_peer(&id).await {
                continue;
            }
            match timeout(self.config.connection.connect_timeout, self.dialer.dial(info)).await {
                Ok(Ok(socket)) => {
                    self.add_outbound_peer(id, info.clone(), Some(socket)).await;
                }
                _ => {
                    // Dialing a known peer is best-effort here; a failure
                    // just leaves it absent from the map for this round.
                    debug!(peer = %id, "could not dial known peer during discovery priming");
                }
            }
        }

        let all: Vec<(PeerId, Arc<PeerConnection>)> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(id, conn)| (id.clone(), conn.clone()))
            .collect();
        let mut connected = Vec::new();
        for (id, conn) in all {
            if conn.state().await == PeerState::Connected {
                connected.push((id, conn));
            }
        }
        let sample: Vec<(PeerId, Arc<PeerConnection>)> = connected
            .choose_multiple(&mut rand::thread_rng(), MAX_PEER_DISCOVERY_PROBE_SAMPLE_SIZE)
            .cloned()
            .collect();

        let outcome = discovery::run(&sample, &blacklist).await;

        for (peer_id, reason) in outcome.failures {
            self.emit_fetch_failure(peer_id, reason);
        }

        for info in &outcome.discovered {
            let id = info.peer_id();
            if let Some(conn) = self.peers.read().await.get(&id).cloned() {
                conn.set_peer_info(info.clone()).await;
            }
            self.directory.lock().await.add(Tier::New, info.clone());
            let _ = self.event_tx.send(PoolEvent::DiscoveredPeer(info.clone()));
        }

        outcome.discovered
    }

    /// Filters `candidates` already present in the map, runs
    /// `select_for_connection` with the remaining outbound headroom, and
    /// adds outbound entries (dialed lazily in the background).
    pub async fn trigger_new_connections(self: &Arc<Self>, candidates: Vec<PeerInfo>) {
        let existing: HashSet<PeerId> = self.peers.read().await.keys().cloned().collect();
        let filtered: Vec<PeerInfo> = candidates
            .into_iter()
            .filter(|c| !existing.contains(&c.peer_id()))
            .collect();
        if filtered.is_empty() {
            return;
        }
        let (_, outbound_count) = self.get_peers_count_per_kind().await;
        let limit = self.config.max_outbound_connections.saturating_sub(outbound_count);
        if limit == 0 {
            return;
        }
        let chosen_ids = (self.connection_selector)(&filtered, limit);

        for id in chosen_ids {
            let Some(info) = filtered.iter().find(|c| c.peer_id() == id).cloned() else {
                continue;
            };
            let conn = self.add_outbound_peer(id.clone(), info.clone(), None).await;
            let conn = conn.clone();
            let dialer = self.dialer.clone();
            let connect_timeout = self.config.connection.connect_timeout;
            tokio::spawn(async move {
                match timeout(connect_timeout, dialer.dial(&info)).await {
                    Ok(Ok(socket)) => conn.attach_socket(socket).await,
                    Ok(Err(err)) => conn.abort_dial(err.to_string()).await,
                    Err(_) => conn.abort_dial("connect timed out".to_string()).await,
                }
            });
        }
    }

    /// Adds an accepted inbound socket. If the inbound pool is at
    /// capacity, evicts one random existing inbound peer first. Fails
    /// with `DuplicatePeer` if `peer_id` is already present.
    pub async fn add_inbound_peer(
        self: &Arc<Self>,
        peer_info: PeerInfo,
        socket: Arc<dyn PeerSocket>,
    ) -> PoolResult<Arc<PeerConnection>> {
        let peer_id = peer_info.peer_id();
        let (conn, events_rx) = PeerConnection::new(
            peer_id.clone(),
            peer_info,
            PeerKind::Inbound,
            Some(socket),
            self.config.connection.clone(),
            self.config.ban_threshold,
            self.request_handler.clone(),
        );

        // Duplicate check, eviction, and insert all happen under one held
        // write lock so two concurrent calls for the same `peer_id` can't
        // both pass the check and both insert.
        let evicted = {
            let mut peers = self.peers.write().await;
            if peers.contains_key(&peer_id) {
                return Err(PoolError::DuplicatePeer(peer_id));
            }
            let inbound_count = peers.values().filter(|c| c.kind == PeerKind::Inbound).count();
            let mut evicted = None;
            if inbound_count >= self.config.max_inbound_connections {
                if let Some(victim_id) = peers
                    .iter()
                    .filter(|(_, c)| c.kind == PeerKind::Inbound)
                    .map(|(id, _)| id.clone())
                    .choose(&mut rand::thread_rng())
                {
                    evicted = peers.remove(&victim_id);
                }
            }
            peers.insert(peer_id, conn.clone());
            evicted
        };
        if let Some(victim) = evicted {
            victim.disconnect().await;
        }

        self.register(conn.clone(), events_rx);
        Ok(conn)
    }

    /// Idempotent: if `peer_id` already exists, updates its `peer_info`
    /// and returns the existing connection instead of creating a new one.
    pub async fn add_outbound_peer(
        self: &Arc<Self>,
        peer_id: PeerId,
        peer_info: PeerInfo,
        socket: Option<Arc<dyn PeerSocket>>,
    ) -> Arc<PeerConnection> {
        if let Some(existing) = self.peers.read().await.get(&peer_id).cloned() {
            existing.set_peer_info(peer_info).await;
            return existing;
        }

        let mut peers = self.peers.write().await;
        if let Some(existing) = peers.get(&peer_id).cloned() {
            drop(peers);
            existing.set_peer_info(peer_info).await;
            return existing;
        }

        let (conn, events_rx) = PeerConnection::new(
            peer_id.clone(),
            peer_info,
            PeerKind::Outbound,
            socket,
            self.config.connection.clone(),
            self.config.ban_threshold,
            self.request_handler.clone(),
        );
        peers.insert(peer_id, conn.clone());
        drop(peers);
        self.register(conn.clone(), events_rx);
        conn
    }

    /// Disconnects, unsubscribes, and removes `peer_id`. Returns `false`
    /// (never throws) if the peer was already absent.
    pub async fn remove_peer(&self, peer_id: &PeerId) -> bool {
        let removed = self.peers.write().await.remove(peer_id);
        match removed {
            Some(conn) => {
                conn.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Forwards to the peer; fails with `PeerNotFound` if absent.
    pub async fn apply_penalty(&self, peer_id: &PeerId, weight: u32) -> PoolResult<()> {
        let conn = self
            .peers
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| PoolError::PeerNotFound(peer_id.clone()))?;
        conn.apply_penalty(weight).await;
        Ok(())
    }

    /// Cancels the periodic outbound-shuffle timer and disconnects every
    /// peer.
    pub async fn remove_all_peers(&self) {
        if let Some(handle) = self
            .shuffle_handle
            .lock()
            .expect("shuffle handle mutex poisoned")
            .take()
        {
            handle.abort();
        }
        let peers: Vec<Arc<PeerConnection>> = {
            let mut map = self.peers.write().await;
            let all = map.values().cloned().collect::<Vec<_>>();
            map.clear();
            all
        };
        for conn in peers {
            conn.disconnect().await;
        }
    }

    // ---- internals ------------------------------------------------------

    async fn peer_snapshots(&self) -> Vec<PeerSnapshot> {
        let peers: Vec<Arc<PeerConnection>> = self.peers.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(peers.len());
        for conn in peers {
            snapshots.push(PeerSnapshot {
                id: conn.id.clone(),
                info: conn.peer_info().await,
                kind: conn.kind,
            });
        }
        snapshots
    }

    fn emit_fetch_failure(&self, peer_id: PeerId, reason: String) {
        let _ = self
            .event_tx
            .send(PoolEvent::FailedToFetchPeerInfo { peer_id, reason });
    }

    async fn fetch_and_apply_status(
        &self,
        conn: &Arc<PeerConnection>,
    ) -> Result<DiscoveredPeerInfo, String> {
        let bytes = conn.fetch_status().await.map_err(|err| err.to_string())?;
        let info: DiscoveredPeerInfo =
            serde_json::from_slice(&bytes).map_err(|err| err.to_string())?;
        conn.set_peer_info(info.clone()).await;
        let mut dir = self.directory.lock().await;
        dir.remove(Tier::New, &info.peer_id());
        dir.add(Tier::Tried, info.clone());
        Ok(info)
    }

    /// Spawns the task that relays one peer's events onto the pool's
    /// broadcast channel, intercepting close (map removal, §4.5 "Close
    /// handling"), ban (unban scheduling, §4.5 "Ban handling"), and
    /// connect (status-fetch kickoff, §4.5 "Connect handling") along the
    /// way.
    fn register(self: &Arc<Self>, conn: Arc<PeerConnection>, events_rx: mpsc::UnboundedReceiver<PeerEvent>) {
        let pool = self.clone();
        let peer_id = conn.id.clone();
        tokio::spawn(pool.relay_peer_events(peer_id, conn, events_rx));
    }

    async fn relay_peer_events(
        self: Arc<Self>,
        peer_id: PeerId,
        conn: Arc<PeerConnection>,
        mut rx: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            // A failed lazy dial (`ConnectAbortOutbound`) never reached a
            // live socket but still occupied a map slot, so it's removed
            // and the relay retired the same as a close.
            let is_terminal = matches!(
                event,
                PeerEvent::CloseOutbound
                    | PeerEvent::CloseInbound
                    | PeerEvent::ConnectAbortOutbound { .. }
            );
            match &event {
                PeerEvent::CloseOutbound
                | PeerEvent::CloseInbound
                | PeerEvent::ConnectAbortOutbound { .. } => {
                    self.peers.write().await.remove(&peer_id);
                }
                PeerEvent::BanPeer => {
                    self.clone().schedule_unban(peer_id.clone()).await;
                }
                PeerEvent::ConnectOutbound => {
                    self.clone().spawn_status_fetch(peer_id.clone(), conn.clone());
                }
                _ => {}
            }
            let _ = self.event_tx.send(PoolEvent::Peer {
                peer_id: peer_id.clone(),
                event,
            });
            if is_terminal {
                break;
            }
        }
    }

    async fn schedule_unban(self: Arc<Self>, peer_id: PeerId) {
        let deadline = Instant::now() + self.config.connection.ban_time;
        self.banned_until.lock().await.insert(peer_id.clone(), deadline);
        let ban_time = self.config.connection.ban_time;
        tokio::spawn(async move {
            tokio::time::sleep(ban_time).await;
            let mut banned = self.banned_until.lock().await;
            if banned.get(&peer_id) == Some(&deadline) {
                banned.remove(&peer_id);
                drop(banned);
                let _ = self.event_tx.send(PoolEvent::Peer {
                    peer_id,
                    event: PeerEvent::UnbanPeer,
                });
            }
        });
    }

    /// On `ConnectOutbound`, asynchronously fetches the remote's status;
    /// success emits `DiscoveredPeer`, failure emits `FailedToFetchPeerInfo`.
    fn spawn_status_fetch(self: Arc<Self>, peer_id: PeerId, conn: Arc<PeerConnection>) {
        tokio::spawn(async move {
            match self.fetch_and_apply_status(&conn).await {
                Ok(info) => {
                    let _ = self.event_tx.send(PoolEvent::DiscoveredPeer(info));
                }
                Err(reason) => self.emit_fetch_failure(peer_id, reason),
            }
        });
    }

    fn start_outbound_shuffle(self: &Arc<Self>) {
        let pool = self.clone();
        let interval = self.config.outbound_eviction_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.evict_random_outbound().await;
            }
        });
        *self
            .shuffle_handle
            .lock()
            .expect("shuffle handle mutex poisoned") = Some(handle);
    }

    async fn evict_random_outbound(&self) {
        let victim = {
            let peers = self.peers.read().await;
            peers
                .iter()
                .filter(|(_, c)| c.kind == PeerKind::Outbound)
                .map(|(id, _)| id.clone())
                .choose(&mut rand::thread_rng())
        };
        let Some(id) = victim else {
            return;
        };
        if let Some(conn) = self.peers.read().await.get(&id).cloned() {
            info!(peer = %id, "evicting outbound peer to keep the set fresh");
            conn.disconnect().await;
        }
    }
}
