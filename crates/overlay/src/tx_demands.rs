//! Transaction demand scheduling for pull-mode flooding.
//!
//! In pull mode, peers advertise transaction hashes they have and we
//! "demand" the bodies of the ones we lack. [`TxDemandsManager`]:
//!
//! - runs the periodic demand round across all pull-mode peers
//! - tracks, per hash, which peers were asked and when
//! - retries other peers with linear backoff, up to [`MAX_RETRY_COUNT`]
//! - records pull latency when a demanded transaction arrives
//! - forgets demands after the retention window, counting the ones that
//!   were never fulfilled
//!
//! # Demand Lifecycle
//!
//! 1. A peer sends `FLOOD_ADVERT`; its [`TxAdverts`] queues the hashes
//! 2. The demand round pops hashes, at most one new demand per peer per
//!    pass, and decides each via [`TxDemandsManager::demand_status`]
//! 3. Hashes that must wait go back on the peer's retry list
//! 4. When the transaction arrives its pull latency is recorded

use crate::metrics::{names, OverlayMetrics};
use crate::tx_adverts::TxAdverts;
use fba_crypto::PublicKey;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use stellar_xdr::curr::Hash;
use tracing::{debug, trace};

/// Maximum number of peers asked for one transaction.
pub const MAX_RETRY_COUNT: usize = 15;

/// Upper bound of the retry backoff.
const MAX_DELAY_DEMAND: Duration = Duration::from_secs(2);

/// Backoff added per peer already asked.
const BACKOFF_DELAY: Duration = Duration::from_millis(50);

/// Demand records older than this are forgotten.
pub const MAX_RETENTION: Duration =
    Duration::from_secs(MAX_DELAY_DEMAND.as_secs() * MAX_RETRY_COUNT as u64 * 2);

/// Whether the node already has a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKnownStatus {
    Unknown,
    Known,
    Banned,
}

/// Decision for one advertised hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemandStatus {
    Demand,
    RetryLater,
    Discard,
}

#[derive(Debug, Clone)]
struct DemandHistory {
    first_demanded: Instant,
    last_demanded: Instant,
    peers: HashMap<PublicKey, Instant>,
    latency_recorded: bool,
}

impl DemandHistory {
    fn new(now: Instant) -> Self {
        Self {
            first_demanded: now,
            last_demanded: now,
            peers: HashMap::new(),
            latency_recorded: false,
        }
    }
}

/// A pull-mode peer taking part in a demand round.
pub struct DemandCandidate<'a> {
    pub node_id: PublicKey,
    pub adverts: &'a mut TxAdverts,
}

/// Pull latency of a received transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxPullLatency {
    /// From the first demand to receipt.
    pub total_latency: Duration,
    /// From demanding it of the sender to receipt, if we asked the sender.
    pub peer_latency: Option<Duration>,
    pub peers_asked: usize,
}

/// Demand scheduler shared by all connections.
#[derive(Debug)]
pub struct TxDemandsManager {
    demand_history: HashMap<Hash, DemandHistory>,
    /// Hashes in first-demand order, for expiry.
    pending_demands: VecDeque<Hash>,
    metrics: std::sync::Arc<OverlayMetrics>,
}

impl TxDemandsManager {
    pub fn new(metrics: std::sync::Arc<OverlayMetrics>) -> Self {
        Self {
            demand_history: HashMap::new(),
            pending_demands: VecDeque::new(),
            metrics,
        }
    }

    /// Linear backoff: `min(50ms × attempts, 2s)`.
    pub fn retry_delay(num_attempts: usize) -> Duration {
        (BACKOFF_DELAY * num_attempts as u32).min(MAX_DELAY_DEMAND)
    }

    /// Decides whether to demand `tx_hash` from `peer` now.
    pub fn demand_status(
        &self,
        tx_hash: &Hash,
        peer: &PublicKey,
        known: TxKnownStatus,
        now: Instant,
    ) -> DemandStatus {
        if known != TxKnownStatus::Unknown {
            return DemandStatus::Discard;
        }

        let Some(history) = self.demand_history.get(tx_hash) else {
            return DemandStatus::Demand;
        };
        if history.peers.contains_key(peer) {
            return DemandStatus::Discard;
        }

        let num_demanded = history.peers.len();
        if num_demanded < MAX_RETRY_COUNT {
            let delay = Self::retry_delay(num_demanded);
            if now.saturating_duration_since(history.last_demanded) >= delay {
                DemandStatus::Demand
            } else {
                DemandStatus::RetryLater
            }
        } else {
            DemandStatus::Discard
        }
    }

    fn record_demand(&mut self, tx_hash: &Hash, peer: &PublicKey, now: Instant) {
        if !self.demand_history.contains_key(tx_hash) {
            self.pending_demands.push_back(tx_hash.clone());
        }
        let history = self
            .demand_history
            .entry(tx_hash.clone())
            .or_insert_with(|| DemandHistory::new(now));
        history.peers.insert(*peer, now);
        history.last_demanded = now;

        if history.peers.len() > 1 {
            trace!(
                tx = %hex::encode(&tx_hash.0[..4]),
                attempt = history.peers.len(),
                peer = %peer,
                "Retrying demand"
            );
        }
    }

    /// Runs one demand round.
    ///
    /// Peers are visited in a random order, and each pass over them takes at
    /// most one new demand per peer, so hashes advertised by several peers
    /// are spread across them. Returns the hashes to demand, aligned with
    /// `peers`. Hashes that must wait are pushed back on each peer's retry
    /// list.
    pub fn demand_round<R: Rng + ?Sized>(
        &mut self,
        peers: &mut [DemandCandidate<'_>],
        tx_status: &dyn Fn(&Hash) -> TxKnownStatus,
        max_demand_size: usize,
        queue_limit: usize,
        now: Instant,
        rng: &mut R,
    ) -> Vec<Vec<Hash>> {
        self.cleanup(now);

        let mut order: Vec<usize> = (0..peers.len()).collect();
        order.shuffle(rng);

        let mut demands: Vec<Vec<Hash>> = vec![Vec::new(); peers.len()];
        let mut retries: Vec<Vec<Hash>> = vec![Vec::new(); peers.len()];

        let mut any_new_demand = true;
        while any_new_demand {
            any_new_demand = false;
            for &i in &order {
                let peer = &mut peers[i];
                if demands[i].len() >= max_demand_size {
                    continue;
                }
                while let Some(hash) = peer.adverts.pop_incoming_advert() {
                    match self.demand_status(&hash, &peer.node_id, tx_status(&hash), now) {
                        DemandStatus::Demand => {
                            self.record_demand(&hash, &peer.node_id, now);
                            demands[i].push(hash);
                            any_new_demand = true;
                            break;
                        }
                        DemandStatus::RetryLater => retries[i].push(hash),
                        DemandStatus::Discard => {}
                    }
                }
            }
        }

        for (peer, retry) in peers.iter_mut().zip(retries) {
            if !retry.is_empty() {
                peer.adverts.retry_incoming_advert(retry, queue_limit);
            }
        }

        let total: usize = demands.iter().map(Vec::len).sum();
        self.metrics.mark_n(names::FLOOD_DEMANDED, total as u64);
        if total > 0 {
            trace!(total, peers = peers.len(), "Demand round");
        }
        demands
    }

    /// Records receipt of a transaction from `peer`; returns its pull
    /// latency the first time a demanded transaction arrives.
    pub fn record_tx_received(
        &mut self,
        tx_hash: &Hash,
        peer: &PublicKey,
        now: Instant,
    ) -> Option<TxPullLatency> {
        let history = self.demand_history.get_mut(tx_hash)?;
        if history.latency_recorded {
            return None;
        }
        history.latency_recorded = true;

        let latency = TxPullLatency {
            total_latency: now.saturating_duration_since(history.first_demanded),
            peer_latency: history
                .peers
                .get(peer)
                .map(|&asked| now.saturating_duration_since(asked)),
            peers_asked: history.peers.len(),
        };
        self.metrics
            .record(names::PULL_LATENCY, latency.total_latency);
        debug!(
            tx = %hex::encode(&tx_hash.0[..4]),
            latency = ?latency.total_latency,
            peers_asked = latency.peers_asked,
            "Pulled transaction"
        );
        Some(latency)
    }

    /// Forgets demands past the retention window; returns how many of them
    /// were never fulfilled.
    pub fn cleanup(&mut self, now: Instant) -> usize {
        let mut abandoned = 0;
        while let Some(hash) = self.pending_demands.front() {
            let expired = self
                .demand_history
                .get(hash)
                .map_or(true, |h| now.saturating_duration_since(h.first_demanded) >= MAX_RETENTION);
            if !expired {
                break;
            }
            if let Some(history) = self.demand_history.remove(hash) {
                if !history.latency_recorded {
                    abandoned += 1;
                }
            }
            self.pending_demands.pop_front();
        }
        self.metrics
            .mark_n(names::FLOOD_ABANDONED_DEMANDS, abandoned as u64);
        abandoned
    }

    /// Hashes with a live demand record.
    pub fn pending_count(&self) -> usize {
        self.pending_demands.len()
    }

    /// Peers asked so far for `tx_hash`.
    pub fn peers_asked(&self, tx_hash: &Hash) -> usize {
        self.demand_history
            .get(tx_hash)
            .map_or(0, |history| history.peers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fba_crypto::SecretKey;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn make_hash(id: u8) -> Hash {
        Hash([id; 32])
    }

    fn make_peer_id(id: u8) -> PublicKey {
        SecretKey::from_seed(&[id; 32]).public_key()
    }

    fn unknown(_: &Hash) -> TxKnownStatus {
        TxKnownStatus::Unknown
    }

    fn manager() -> (TxDemandsManager, Arc<OverlayMetrics>) {
        let metrics = Arc::new(OverlayMetrics::new());
        (TxDemandsManager::new(Arc::clone(&metrics)), metrics)
    }

    #[test]
    fn test_retry_delay() {
        assert_eq!(TxDemandsManager::retry_delay(0), Duration::ZERO);
        assert_eq!(TxDemandsManager::retry_delay(3), Duration::from_millis(150));
        assert_eq!(TxDemandsManager::retry_delay(100), MAX_DELAY_DEMAND);
    }

    #[test]
    fn test_demand_status() {
        let (mut manager, _) = manager();
        let now = Instant::now();
        let hash = make_hash(1);
        let peer1 = make_peer_id(1);
        let peer2 = make_peer_id(2);

        assert_eq!(
            manager.demand_status(&hash, &peer1, TxKnownStatus::Unknown, now),
            DemandStatus::Demand
        );
        assert_eq!(
            manager.demand_status(&hash, &peer1, TxKnownStatus::Known, now),
            DemandStatus::Discard
        );
        assert_eq!(
            manager.demand_status(&hash, &peer1, TxKnownStatus::Banned, now),
            DemandStatus::Discard
        );

        manager.record_demand(&hash, &peer1, now);
        assert_eq!(
            manager.demand_status(&hash, &peer1, TxKnownStatus::Unknown, now),
            DemandStatus::Discard
        );
        assert_eq!(
            manager.demand_status(&hash, &peer2, TxKnownStatus::Unknown, now),
            DemandStatus::RetryLater
        );
        assert_eq!(
            manager.demand_status(
                &hash,
                &peer2,
                TxKnownStatus::Unknown,
                now + Duration::from_millis(50)
            ),
            DemandStatus::Demand
        );
    }

    #[test]
    fn test_demand_status_max_retries() {
        let (mut manager, _) = manager();
        let now = Instant::now();
        let hash = make_hash(1);
        for id in 0..MAX_RETRY_COUNT as u8 {
            manager.record_demand(&hash, &make_peer_id(id + 1), now);
        }
        assert_eq!(
            manager.demand_status(
                &hash,
                &make_peer_id(100),
                TxKnownStatus::Unknown,
                now + Duration::from_secs(10)
            ),
            DemandStatus::Discard
        );
    }

    #[test]
    fn test_demand_round_fair_split() {
        let (mut manager, metrics) = manager();
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(7);

        let hashes: Vec<Hash> = (0..10).map(make_hash).collect();
        let mut queues: Vec<TxAdverts> = (0..3)
            .map(|_| {
                let mut adverts = TxAdverts::new(Duration::from_millis(500));
                adverts.queue_incoming_advert(&hashes, 100);
                adverts
            })
            .collect();
        let ids: Vec<PublicKey> = (1..=3).map(make_peer_id).collect();
        let mut peers: Vec<DemandCandidate<'_>> = queues
            .iter_mut()
            .zip(&ids)
            .map(|(adverts, id)| DemandCandidate {
                node_id: *id,
                adverts,
            })
            .collect();

        let demands = manager.demand_round(&mut peers, &unknown, 100, 100, now, &mut rng);

        let mut seen = HashSet::new();
        for per_peer in &demands {
            assert!((3..=4).contains(&per_peer.len()), "{:?}", per_peer.len());
            for hash in per_peer {
                assert!(seen.insert(hash.clone()), "hash demanded twice");
            }
        }
        assert_eq!(seen.len(), 10);
        assert_eq!(metrics.count(names::FLOOD_DEMANDED), 10);
        assert_eq!(manager.pending_count(), 10);
    }

    #[test]
    fn test_demand_round_respects_max_demand_size() {
        let (mut manager, _) = manager();
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(1);
        let mut adverts = TxAdverts::new(Duration::from_millis(500));
        adverts.queue_incoming_advert(&(0..5).map(make_hash).collect::<Vec<_>>(), 100);

        let mut peers = [DemandCandidate {
            node_id: make_peer_id(1),
            adverts: &mut adverts,
        }];
        let demands = manager.demand_round(&mut peers, &unknown, 2, 100, now, &mut rng);
        assert_eq!(demands[0].len(), 2);
        assert_eq!(adverts.size(), 3);
    }

    #[test]
    fn test_readvertised_hash_not_demanded_again() {
        let (mut manager, _) = manager();
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(1);
        let peer = make_peer_id(1);
        let mut adverts = TxAdverts::new(Duration::from_millis(500));

        adverts.queue_incoming_advert(&[make_hash(1)], 100);
        let mut peers = [DemandCandidate {
            node_id: peer,
            adverts: &mut adverts,
        }];
        assert_eq!(
            manager.demand_round(&mut peers, &unknown, 10, 100, now, &mut rng)[0].len(),
            1
        );

        peers[0].adverts.queue_incoming_advert(&[make_hash(1)], 100);
        let later = now + Duration::from_secs(1);
        assert!(manager
            .demand_round(&mut peers, &unknown, 10, 100, later, &mut rng)[0]
            .is_empty());
        assert_eq!(manager.peers_asked(&make_hash(1)), 1);
    }

    #[test]
    fn test_retry_later_goes_back_to_queue() {
        let (mut manager, _) = manager();
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(1);
        manager.record_demand(&make_hash(1), &make_peer_id(9), now);

        let mut adverts = TxAdverts::new(Duration::from_millis(500));
        adverts.queue_incoming_advert(&[make_hash(1)], 100);
        let mut peers = [DemandCandidate {
            node_id: make_peer_id(1),
            adverts: &mut adverts,
        }];
        assert!(manager
            .demand_round(&mut peers, &unknown, 10, 100, now, &mut rng)[0]
            .is_empty());
        assert_eq!(adverts.size(), 1);
    }

    #[test]
    fn test_record_tx_received_latency() {
        let (mut manager, metrics) = manager();
        let now = Instant::now();
        let hash = make_hash(1);
        let peer = make_peer_id(1);

        assert!(manager.record_tx_received(&hash, &peer, now).is_none());
        manager.record_demand(&hash, &peer, now);

        let latency = manager
            .record_tx_received(&hash, &peer, now + Duration::from_millis(30))
            .unwrap();
        assert_eq!(latency.total_latency, Duration::from_millis(30));
        assert_eq!(latency.peer_latency, Some(Duration::from_millis(30)));
        assert_eq!(latency.peers_asked, 1);
        assert_eq!(metrics.timer_count(names::PULL_LATENCY), 1);

        assert!(manager
            .record_tx_received(&hash, &peer, now + Duration::from_millis(40))
            .is_none());
    }

    #[test]
    fn test_cleanup_counts_abandoned() {
        let (mut manager, metrics) = manager();
        let now = Instant::now();
        let peer = make_peer_id(1);
        manager.record_demand(&make_hash(1), &peer, now);
        manager.record_demand(&make_hash(2), &peer, now);
        manager.record_tx_received(&make_hash(2), &peer, now);
        manager.record_demand(&make_hash(3), &peer, now + Duration::from_secs(30));

        assert_eq!(manager.cleanup(now + Duration::from_secs(59)), 0);
        assert_eq!(manager.cleanup(now + MAX_RETENTION), 1);
        assert_eq!(manager.pending_count(), 1);
        assert_eq!(metrics.count(names::FLOOD_ABANDONED_DEMANDS), 1);
    }
}
