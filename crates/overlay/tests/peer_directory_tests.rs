//! Integration tests for the persistent peer directory and ban list.

mod common;

use common::{crank, link, Node};
use fba_overlay::{
    unix_now, BanManager, OverlayConfig, PeerAddress, PeerManager, PeerRecord, StoredPeerType,
    REALLY_DEAD_NUM_FAILURES_CUTOFF,
};
use std::net::Ipv4Addr;
use std::time::Instant;
use tempfile::TempDir;

fn addr(last: u8) -> PeerAddress {
    PeerAddress::new(Ipv4Addr::new(4, 4, 4, last), 11625)
}

#[test]
fn test_directory_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("peers.db");
    let now_unix = unix_now() as i64;

    {
        let config = OverlayConfig::default()
            .with_known_peers(vec![addr(1)])
            .with_preferred_peers(vec![addr(2)]);
        let node = Node::with_peer_manager(1, config, PeerManager::open(&path).unwrap());
        assert_eq!(node.manager.peer_manager().peer_count(), 2);
    }

    let reopened = PeerManager::open(&path).unwrap();
    let (record, found) = reopened.load(&addr(1), now_unix);
    assert!(found);
    assert_eq!(record.peer_type, StoredPeerType::Outbound);
    let (record, found) = reopened.load(&addr(2), now_unix);
    assert!(found);
    assert_eq!(record.peer_type, StoredPeerType::Preferred);
}

#[test]
fn test_dead_peers_purged_at_startup() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("peers.db");
    let now_unix = unix_now() as i64;

    let directory = PeerManager::open(&path).unwrap();
    let dead = PeerRecord {
        num_failures: REALLY_DEAD_NUM_FAILURES_CUTOFF,
        ..PeerRecord::new(now_unix)
    };
    let flaky = PeerRecord {
        num_failures: REALLY_DEAD_NUM_FAILURES_CUTOFF - 1,
        ..PeerRecord::new(now_unix)
    };
    directory.store(&addr(1), &dead, false);
    directory.store(&addr(2), &flaky, false);
    drop(directory);

    let directory = PeerManager::open(&path).unwrap();
    let node = Node::with_peer_manager(1, OverlayConfig::default(), directory);
    let known: Vec<_> = node
        .manager
        .peer_manager()
        .get_all_peers()
        .into_iter()
        .map(|(address, _)| address)
        .collect();
    assert_eq!(known, vec![addr(2)]);
}

#[test]
fn test_persistent_ban_refuses_node() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bans.db");
    let now = Instant::now();

    let mut a = Node::new(1, OverlayConfig::default());
    let mut b = Node::new(2, OverlayConfig::default());
    BanManager::open(&path)
        .unwrap()
        .ban_node(&b.public_key())
        .unwrap();

    a.manager = a.manager.with_ban_manager(BanManager::open(&path).unwrap());
    let (ia, ib, _) = link(&mut a, &mut b, now);
    crank(&mut [&mut a, &mut b], now);

    assert!(a.manager.authenticated_peers().is_empty());
    assert_eq!(a.drop_reason(ia).as_deref(), Some("node is banned"));
    assert_eq!(b.drop_reason(ib).as_deref(), Some("ERR_AUTH (node is banned)"));
}
