//! End-to-end tests driving `PeerPool` through a mock transport.

use peer_pool::config::PoolConfig;
use peer_pool::events::{PeerEvent, PoolEvent};
use peer_pool::peer_info::{NodeInfo, PeerInfo};
use peer_pool::pool::PeerPool;
use peer_pool::selectors::{default_select_for_connection, default_select_for_request, default_select_for_send};
use peer_pool::socket::{mock_pair, PeerSocket, PresetDialer, SocketEvent};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> PoolConfig {
    let mut config = PoolConfig::default();
    config.connection.ban_time = Duration::from_millis(50);
    config.connection.connect_timeout = Duration::from_millis(200);
    config.connection.ack_timeout = Duration::from_millis(200);
    config
}

fn new_pool(config: PoolConfig) -> Arc<PeerPool> {
    PeerPool::new(
        config,
        default_select_for_send(),
        default_select_for_request(),
        default_select_for_connection(),
        Arc::new(PresetDialer::new()),
        None,
    )
}

fn node_info(height: u64) -> NodeInfo {
    NodeInfo {
        version: "1.0".to_string(),
        height,
        broadhash: "deadbeef".to_string(),
        nonce: 1,
        os: "linux".to_string(),
        ws_port: 5000,
        http_port: 6000,
        protocol_version: "3".to_string(),
    }
}

#[tokio::test]
async fn inbound_eviction_keeps_the_pool_at_capacity() {
    let mut config = test_config();
    config.max_inbound_connections = 2;
    let pool = new_pool(config);
    let mut events = pool.subscribe();

    for port in 0..3u16 {
        let (local, _remote) = mock_pair();
        pool.add_inbound_peer(PeerInfo::new("10.0.0.1", port), Arc::new(local))
            .await
            .unwrap();
    }

    let (inbound, _outbound) = pool.get_peers_count_per_kind().await;
    assert_eq!(inbound, 2);

    let mut close_inbound_count = 0;
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::Peer { event: PeerEvent::CloseInbound, .. } = event {
            close_inbound_count += 1;
        }
    }
    assert_eq!(close_inbound_count, 1);
}

#[tokio::test]
async fn discovery_ingests_peers_and_respects_blacklist() {
    let pool = new_pool(test_config());
    let (local, remote) = mock_pair();
    let remote = Arc::new(remote);
    let mut remote_events = remote.take_events().unwrap();

    pool.add_outbound_peer(
        PeerInfo::new("10.0.0.5", 5000).peer_id(),
        PeerInfo::new("10.0.0.5", 5000),
        Some(Arc::new(local)),
    )
    .await;

    tokio::spawn(async move {
        while let Some(event) = remote_events.recv().await {
            if let SocketEvent::RequestReceived { procedure, responder, .. } = event {
                let payload = if procedure == "getPeers" {
                    peer_pool::discovery::encode_peer_list(vec![
                        PeerInfo::new("10.0.0.6", 5000),
                        PeerInfo::new("10.0.0.7", 5000),
                    ])
                } else {
                    Vec::new()
                };
                let _ = responder.send(payload);
            }
        }
    });

    let mut blacklist = HashSet::new();
    blacklist.insert("10.0.0.6".to_string());

    let discovered = pool.run_discovery(vec![], blacklist).await;
    let ips: Vec<_> = discovered.iter().map(|p| p.ip_address.clone()).collect();
    assert_eq!(ips, vec!["10.0.0.7".to_string()]);
}

#[tokio::test]
async fn request_with_no_peers_fails() {
    let pool = new_pool(test_config());
    let result = pool.request("getBlocks", vec![]).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn ban_lifecycle_closes_and_later_unbans() {
    let mut config = test_config();
    config.ban_threshold = 10;
    let pool = new_pool(config);
    let mut events = pool.subscribe();

    let (local, _remote) = mock_pair();
    let peer_info = PeerInfo::new("10.0.0.9", 5000);
    let peer_id = peer_info.peer_id();
    pool.add_inbound_peer(peer_info, Arc::new(local)).await.unwrap();

    pool.apply_penalty(&peer_id, 20).await.unwrap();

    let mut saw_ban = false;
    let mut saw_close = false;
    loop {
        let event = tokio::time::timeout(Duration::from_millis(200), events.recv())
            .await
            .expect("event expected")
            .unwrap();
        match event {
            PoolEvent::Peer { event: PeerEvent::BanPeer, .. } => saw_ban = true,
            PoolEvent::Peer { event: PeerEvent::CloseInbound, .. } => saw_close = true,
            _ => {}
        }
        if saw_ban && saw_close {
            break;
        }
    }
    assert!(!pool.has_peer(&peer_id).await);

    let unban = tokio::time::timeout(Duration::from_millis(500), async {
        loop {
            if let Ok(PoolEvent::Peer { event: PeerEvent::UnbanPeer, .. }) = events.recv().await {
                return true;
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(unban);
}

#[tokio::test]
async fn node_info_fan_out_surfaces_a_single_failure() {
    let pool = new_pool(test_config());
    let mut events = pool.subscribe();

    // Kept alive for the whole test: dropping a mock's peer half closes the
    // paired channel and would make even a healthy `send` fail.
    let mut kept_alive = Vec::new();
    for port in 0..2u16 {
        let (local, remote) = mock_pair();
        kept_alive.push(remote);
        pool.add_outbound_peer(
            PeerInfo::new("10.0.1.1", port).peer_id(),
            PeerInfo::new("10.0.1.1", port),
            Some(Arc::new(local)),
        )
        .await;
    }

    let (local, remote) = mock_pair();
    local.sever();
    kept_alive.push(remote);
    let faulty_id = PeerInfo::new("10.0.1.2", 9000).peer_id();
    pool.add_outbound_peer(
        faulty_id.clone(),
        PeerInfo::new("10.0.1.2", 9000),
        Some(Arc::new(local)),
    )
    .await;

    pool.apply_node_info(node_info(42)).await;

    let mut failures = 0;
    for _ in 0..10 {
        if let Ok(Ok(PoolEvent::FailedToPushNodeInfo { peer_id, .. })) =
            tokio::time::timeout(Duration::from_millis(100), events.recv()).await
        {
            if peer_id == faulty_id {
                failures += 1;
            }
        }
    }
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn duplicate_outbound_add_updates_in_place() {
    let pool = new_pool(test_config());
    let peer_id = PeerInfo::new("10.0.2.1", 5000).peer_id();

    let first = pool
        .add_outbound_peer(peer_id.clone(), PeerInfo::new("10.0.2.1", 5000), None)
        .await;
    let second = pool
        .add_outbound_peer(peer_id.clone(), PeerInfo::new("10.0.2.1", 5000), None)
        .await;

    assert!(Arc::ptr_eq(&first, &second));
    let (_, outbound) = pool.get_peers_count_per_kind().await;
    assert_eq!(outbound, 1);
}

#[tokio::test]
async fn failed_dial_emits_connect_abort_and_removes_peer() {
    let pool = new_pool(test_config());
    let mut events = pool.subscribe();

    // The dialer has no socket registered for this candidate, so the
    // background dial `trigger_new_connections` spawns will fail.
    let candidate = PeerInfo::new("10.0.3.1", 5000);
    pool.trigger_new_connections(vec![candidate.clone()]).await;

    let event = tokio::time::timeout(Duration::from_millis(500), async {
        loop {
            if let Ok(found @ PoolEvent::Peer { event: PeerEvent::ConnectAbortOutbound { .. }, .. }) =
                events.recv().await
            {
                return found;
            }
        }
    })
    .await
    .expect("ConnectAbortOutbound expected");
    assert!(matches!(
        event,
        PoolEvent::Peer { event: PeerEvent::ConnectAbortOutbound { .. }, .. }
    ));

    assert!(!pool.has_peer(&candidate.peer_id()).await);
}
