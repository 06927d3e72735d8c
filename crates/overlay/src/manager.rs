//! The overlay event loop.
//!
//! [`OverlayManager`] owns every live connection in an arena keyed by
//! [`ConnectionId`] together with the engine-wide state the peers share:
//! admission slots, the peer directory, the ban list and the demand
//! scheduler. Everything runs on one logical thread, so nothing here is
//! locked.
//!
//! # Driving the engine
//!
//! Each entry point takes the current [`Instant`] and does a bounded amount
//! of synchronous work:
//!
//! | Call | Period | Work |
//! |------|--------|------|
//! | [`process_io`](OverlayManager::process_io) | on wakeup | transport events, message dispatch |
//! | [`tick`](OverlayManager::tick) | 1s | liveness timers, admission sweep, outbound dialing |
//! | [`flush_adverts`](OverlayManager::flush_adverts) | advert period | send due advert batches |
//! | [`run_demand`](OverlayManager::run_demand) | demand period | demand round over pull-mode peers |
//!
//! [`run`](OverlayManager::run) wires these to a TCP listener and tokio
//! timers. Tests call them directly with virtual time over
//! [`LoopbackTransport`](crate::LoopbackTransport)s.

use crate::admission::Admission;
use crate::auth::unix_now;
use crate::ban_manager::BanManager;
use crate::connection::{Listener, TcpDialer};
use crate::metrics::{names, OverlayMetrics};
use crate::peer::{DropDirection, DropMode, DropReason, Peer, PeerContext};
use crate::peer_manager::{
    BackOffUpdate, PeerManager, PeerQuery, PeerTypeFilter, StoredPeerType,
    REALLY_DEAD_NUM_FAILURES_CUTOFF,
};
use crate::transport::{Dialer, Transport};
use crate::tx_adverts::max_batch_size;
use crate::tx_demands::{DemandCandidate, TxDemandsManager};
use crate::{
    ConnectionId, LedgerProvider, LocalNode, MessageHandler, OverlayConfig, OverlayError,
    PeerAddress, PeerRole, Result,
};
use fba_crypto::{xdr_sha256, PublicKey};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stellar_xdr::curr::{FloodDemand, Hash, StellarMessage};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

/// Period of the manager's housekeeping tick.
const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Something the application may want to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    PeerAuthenticated {
        id: ConnectionId,
        node_id: PublicKey,
        role: PeerRole,
    },
    PeerDropped {
        id: ConnectionId,
        node_id: Option<PublicKey>,
        reason: DropReason,
    },
}

/// Owner of all connections and shared overlay state.
pub struct OverlayManager {
    config: OverlayConfig,
    local: LocalNode,
    ledger: Box<dyn LedgerProvider>,
    handler: Box<dyn MessageHandler>,
    peer_manager: PeerManager,
    ban_manager: BanManager,
    admission: Admission,
    demands: TxDemandsManager,
    metrics: Arc<OverlayMetrics>,
    rng: StdRng,
    dialer: Option<Box<dyn Dialer>>,

    peers: BTreeMap<ConnectionId, Peer>,
    next_id: u64,
    /// Authenticated connections already reported.
    announced: HashSet<ConnectionId>,
    evictions: Vec<ConnectionId>,
    events: Vec<OverlayEvent>,
}

impl OverlayManager {
    /// Creates a manager.
    ///
    /// Purges directory records that failed too often and records the
    /// configured known and preferred peers as ready to dial.
    pub fn new(
        config: OverlayConfig,
        local: LocalNode,
        ledger: Box<dyn LedgerProvider>,
        handler: Box<dyn MessageHandler>,
        peer_manager: PeerManager,
    ) -> Self {
        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let metrics = Arc::new(OverlayMetrics::new());

        peer_manager.remove_peers_with_many_failures(REALLY_DEAD_NUM_FAILURES_CUTOFF, None);
        let now_unix = unix_now() as i64;
        for address in &config.known_peers {
            peer_manager.update(
                address,
                StoredPeerType::Outbound,
                false,
                BackOffUpdate::HardReset,
                now_unix,
                &mut rng,
            );
        }
        for address in &config.preferred_peers {
            peer_manager.update(
                address,
                StoredPeerType::Preferred,
                true,
                BackOffUpdate::HardReset,
                now_unix,
                &mut rng,
            );
        }

        info!(
            node = %local.public_key().short_id(),
            port = config.peer_port,
            known = config.known_peers.len(),
            preferred = config.preferred_peers.len(),
            "Overlay created"
        );

        Self {
            admission: Admission::new(&config),
            demands: TxDemandsManager::new(Arc::clone(&metrics)),
            config,
            local,
            ledger,
            handler,
            peer_manager,
            ban_manager: BanManager::new_in_memory(),
            metrics,
            rng,
            dialer: None,
            peers: BTreeMap::new(),
            next_id: 1,
            announced: HashSet::new(),
            evictions: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Uses `ban_manager` instead of an empty in-memory ban list.
    pub fn with_ban_manager(mut self, ban_manager: BanManager) -> Self {
        self.ban_manager = ban_manager;
        self
    }

    /// Uses `dialer` for outbound connections.
    pub fn with_dialer(mut self, dialer: Box<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn local(&self) -> &LocalNode {
        &self.local
    }

    pub fn metrics(&self) -> &Arc<OverlayMetrics> {
        &self.metrics
    }

    pub fn peer_manager(&self) -> &PeerManager {
        &self.peer_manager
    }

    pub fn ban_manager(&self) -> &BanManager {
        &self.ban_manager
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn demands(&self) -> &TxDemandsManager {
        &self.demands
    }

    pub fn peer(&self, id: ConnectionId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Live connections, in id order.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn authenticated_peers(&self) -> Vec<ConnectionId> {
        self.peers
            .values()
            .filter(|p| p.is_authenticated())
            .map(Peer::id)
            .collect()
    }

    /// Connection currently authenticated as `node_id`.
    pub fn connection_for(&self, node_id: &PublicKey) -> Option<ConnectionId> {
        self.admission.authenticated_connection(node_id)
    }

    /// Events since the last call.
    pub fn take_events(&mut self) -> Vec<OverlayEvent> {
        std::mem::take(&mut self.events)
    }

    /// Splits the manager into its connection arena and the context peer
    /// handlers run with.
    fn split(&mut self) -> (&mut BTreeMap<ConnectionId, Peer>, PeerContext<'_>) {
        let ctx = PeerContext {
            config: &self.config,
            local: &self.local,
            ledger: &*self.ledger,
            handler: &mut *self.handler,
            peer_manager: &self.peer_manager,
            ban_manager: &self.ban_manager,
            admission: &mut self.admission,
            demands: &mut self.demands,
            metrics: &self.metrics,
            rng: &mut self.rng,
            unix_now: unix_now(),
            evictions: &mut self.evictions,
        };
        (&mut self.peers, ctx)
    }

    fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Takes ownership of a connection the remote opened.
    pub fn add_inbound(&mut self, transport: Box<dyn Transport>, now: Instant) -> ConnectionId {
        let id = self.allocate_id();
        let remote_ip = transport.remote_ip();
        self.admission
            .add_pending(id, PeerRole::RemoteCalledUs, remote_ip);
        self.metrics.mark(names::CONNECTION_ATTEMPT);
        debug!(peer = %id, remote = ?remote_ip, "Inbound connection");

        let (peers, mut ctx) = self.split();
        let peer = Peer::new(id, PeerRole::RemoteCalledUs, transport, None, &mut ctx, now);
        peers.insert(id, peer);
        id
    }

    /// Takes ownership of a connection we opened to `address`.
    pub fn add_outbound(
        &mut self,
        transport: Box<dyn Transport>,
        address: PeerAddress,
        now: Instant,
    ) -> ConnectionId {
        let id = self.allocate_id();
        self.admission
            .add_pending(id, PeerRole::WeCalledRemote, Some(address.ip));
        self.metrics.mark(names::CONNECTION_ATTEMPT);
        debug!(peer = %id, %address, "Outbound connection");

        let (peers, mut ctx) = self.split();
        let peer = Peer::new(
            id,
            PeerRole::WeCalledRemote,
            transport,
            Some(address),
            &mut ctx,
            now,
        );
        peers.insert(id, peer);
        id
    }

    fn is_connected_to(&self, address: &PeerAddress) -> bool {
        self.peers
            .values()
            .any(|p| !p.is_closing() && p.address() == Some(address))
    }

    /// Dials `address` through the configured dialer.
    pub fn connect_to(&mut self, address: PeerAddress, now: Instant) -> Result<ConnectionId> {
        if self.is_connected_to(&address) {
            return Err(OverlayError::ConnectionFailed(format!(
                "already connected to {}",
                address
            )));
        }
        if !self.admission.has_outbound_pending_space() {
            return Err(OverlayError::ConnectionFailed(
                "no outbound pending slot".to_string(),
            ));
        }
        let transport = match self.dialer.as_mut() {
            Some(dialer) => dialer.dial(address),
            None => {
                return Err(OverlayError::ConnectionFailed(
                    "no dialer configured".to_string(),
                ))
            }
        };
        Ok(self.add_outbound(transport, address, now))
    }

    /// Polls every connection's transport and handles what arrived.
    pub fn process_io(&mut self, now: Instant) {
        {
            let (peers, mut ctx) = self.split();
            for peer in peers.values_mut() {
                peer.process_io(&mut ctx, now);
            }
        }
        self.after_dispatch(now);
    }

    /// Liveness timers, admission sweep, outbound dialing.
    pub fn tick(&mut self, now: Instant) {
        {
            let (peers, mut ctx) = self.split();
            for peer in peers.values_mut() {
                peer.recurrent_timer(&mut ctx, now);
            }
        }

        for id in self.admission.sweep() {
            if let Some(peer) = self.peers.get_mut(&id) {
                debug!(peer = %id, "Closing pending connection beyond limits");
                self.metrics.mark(names::CONNECTION_REJECT);
                peer.drop(
                    "peer rejected",
                    DropDirection::WeDroppedRemote,
                    DropMode::IgnoreWriteQueue,
                );
            }
        }

        self.demands.cleanup(now);
        self.after_dispatch(now);
        self.fill_outbound_slots(now);
    }

    fn fill_outbound_slots(&mut self, now: Instant) {
        if self.dialer.is_none() {
            return;
        }
        let mut slots = self.admission.outbound_slots_to_fill();
        if slots == 0 {
            return;
        }

        let now_unix = unix_now() as i64;
        let mut candidates: Vec<PeerAddress> = Vec::new();
        for type_filter in [
            PeerTypeFilter::PreferredOnly,
            PeerTypeFilter::OutboundOnly,
            PeerTypeFilter::InboundOnly,
        ] {
            let query = PeerQuery {
                use_next_attempt: true,
                max_num_failures: None,
                type_filter,
            };
            for address in
                self.peer_manager
                    .load_random_peers(&query, slots, now_unix, &mut self.rng)
            {
                if !candidates.contains(&address) && !self.is_connected_to(&address) {
                    candidates.push(address);
                }
            }
        }

        for address in candidates {
            if slots == 0 {
                break;
            }
            match self.connect_to(address, now) {
                Ok(id) => {
                    trace!(peer = %id, %address, "Dialing");
                    slots -= 1;
                }
                Err(e) => {
                    debug!(%address, error = %e, "Not dialing");
                    break;
                }
            }
        }
    }

    /// Sends advert batches whose timer has fired.
    pub fn flush_adverts(&mut self, now: Instant) {
        {
            let (peers, mut ctx) = self.split();
            for peer in peers.values_mut().filter(|p| p.is_pull_mode()) {
                peer.flush_adverts_on_timer(&mut ctx, now);
            }
        }
        self.after_dispatch(now);
    }

    /// Runs a demand round over all pull-mode peers and sends the demands.
    pub fn run_demand(&mut self, now: Instant) {
        let max_ops = self.ledger.max_tx_set_size_ops();
        let max_demand_size = max_batch_size(max_ops, self.config.flood_demand_period);
        let queue_limit = max_ops as usize;

        let demanded = {
            let handler = self.handler.as_ref();
            let mut ids = Vec::new();
            let mut candidates = Vec::new();
            for peer in self
                .peers
                .values_mut()
                .filter(|p| p.is_authenticated() && p.is_pull_mode())
            {
                let Some(node_id) = peer.peer_id().copied() else {
                    continue;
                };
                ids.push(peer.id());
                candidates.push(DemandCandidate {
                    node_id,
                    adverts: peer.adverts_mut(),
                });
            }
            let demands = self.demands.demand_round(
                &mut candidates,
                &|hash: &Hash| handler.tx_status(hash),
                max_demand_size,
                queue_limit,
                now,
                &mut self.rng,
            );
            ids.into_iter().zip(demands).collect::<Vec<_>>()
        };

        {
            let (peers, mut ctx) = self.split();
            for (id, hashes) in demanded {
                if hashes.is_empty() {
                    continue;
                }
                let Some(peer) = peers.get_mut(&id) else {
                    continue;
                };
                let count = hashes.len();
                match hashes.try_into() {
                    Ok(tx_hashes) => {
                        trace!(peer = %id, count, "Demanding transactions");
                        peer.send_message(
                            &mut ctx,
                            StellarMessage::FloodDemand(FloodDemand { tx_hashes }),
                            now,
                        );
                    }
                    Err(e) => warn!(peer = %id, count, error = %e, "Demand too large"),
                }
            }
        }
        self.after_dispatch(now);
    }

    /// Floods a message to every authenticated peer.
    ///
    /// Transactions go to pull-mode peers as an advert of their hash.
    /// Returns the number of peers the message or advert was queued for.
    pub fn broadcast(&mut self, message: StellarMessage, now: Instant) -> Result<usize> {
        let tx_hash = match &message {
            StellarMessage::Transaction(envelope) => Some(Hash(xdr_sha256(envelope)?)),
            _ => None,
        };
        let max_advert_size = max_batch_size(
            self.ledger.max_tx_set_size_ops(),
            self.config.flood_advert_period,
        );

        let mut sent = 0;
        {
            let (peers, mut ctx) = self.split();
            for peer in peers.values_mut().filter(|p| p.is_authenticated()) {
                match &tx_hash {
                    Some(hash) if peer.is_pull_mode() => {
                        if peer.queue_tx_hash_to_advertise(
                            &mut ctx,
                            hash.clone(),
                            max_advert_size,
                            now,
                        ) {
                            ctx.metrics.mark(names::FLOOD_ADVERTISED);
                        }
                    }
                    _ => peer.send_message(&mut ctx, message.clone(), now),
                }
                sent += 1;
            }
        }
        self.after_dispatch(now);
        Ok(sent)
    }

    /// Sends a message on one connection.
    pub fn send_to(&mut self, id: ConnectionId, message: StellarMessage, now: Instant) -> Result<()> {
        {
            let (peers, mut ctx) = self.split();
            let peer = peers
                .get_mut(&id)
                .ok_or(OverlayError::UnknownConnection(id.0))?;
            peer.send_message(&mut ctx, message, now);
        }
        self.after_dispatch(now);
        Ok(())
    }

    /// Drops a connection on behalf of the application.
    pub fn disconnect(&mut self, id: ConnectionId, reason: &str, now: Instant) -> Result<()> {
        let peer = self
            .peers
            .get_mut(&id)
            .ok_or(OverlayError::UnknownConnection(id.0))?;
        peer.drop(
            reason,
            DropDirection::WeDroppedRemote,
            DropMode::FlushWriteQueue,
        );
        self.after_dispatch(now);
        Ok(())
    }

    /// Bans a node and drops its connections.
    pub fn ban_node(&mut self, node_id: &PublicKey, now: Instant) -> Result<()> {
        self.ban_manager.ban_node(node_id)?;
        for peer in self.peers.values_mut() {
            if peer.peer_id() == Some(node_id) {
                peer.drop(
                    "node is banned",
                    DropDirection::WeDroppedRemote,
                    DropMode::IgnoreWriteQueue,
                );
            }
        }
        self.after_dispatch(now);
        Ok(())
    }

    pub fn unban_node(&mut self, node_id: &PublicKey) -> Result<()> {
        self.ban_manager.unban_node(node_id)
    }

    /// Applies evictions, reports new authentications and removes closed
    /// connections.
    fn after_dispatch(&mut self, now: Instant) {
        for id in std::mem::take(&mut self.evictions) {
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.drop(
                    "preferred peer selected instead",
                    DropDirection::WeDroppedRemote,
                    DropMode::FlushWriteQueue,
                );
            }
        }

        for peer in self.peers.values() {
            if peer.authenticated_at().is_some() && self.announced.insert(peer.id()) {
                if let Some(node_id) = peer.peer_id() {
                    self.events.push(OverlayEvent::PeerAuthenticated {
                        id: peer.id(),
                        node_id: *node_id,
                        role: peer.role(),
                    });
                }
            }
        }

        let closed: Vec<ConnectionId> = self
            .peers
            .values()
            .filter(|p| p.is_closing())
            .map(Peer::id)
            .collect();
        for id in closed {
            if let Some(peer) = self.peers.remove(&id) {
                self.reap(peer, now);
            }
        }
    }

    fn reap(&mut self, peer: Peer, now: Instant) {
        let id = peer.id();
        self.admission.remove(id);
        self.announced.remove(&id);

        if peer.role() == PeerRole::WeCalledRemote && peer.authenticated_at().is_none() {
            if let Some(address) = peer.address().copied() {
                let record = self.peer_manager.update_backoff(
                    &address,
                    BackOffUpdate::Increase,
                    unix_now() as i64,
                    &mut self.rng,
                );
                if record.num_failures >= self.config.max_failures_before_purge {
                    self.peer_manager.remove_peers_with_many_failures(
                        self.config.max_failures_before_purge,
                        Some(&address),
                    );
                }
            }
        }

        let reason = peer.drop_reason().cloned().unwrap_or(DropReason {
            reason: "connection closed".to_string(),
            direction: DropDirection::WeDroppedRemote,
        });
        let lifetime = peer
            .authenticated_at()
            .map(|at| now.saturating_duration_since(at));
        debug!(
            peer = %id,
            reason = %reason.reason,
            direction = ?reason.direction,
            ?lifetime,
            "Removed connection"
        );
        self.events.push(OverlayEvent::PeerDropped {
            id,
            node_id: peer.peer_id().copied(),
            reason,
        });
    }

    /// Runs the overlay over TCP until an I/O error stops the listener.
    ///
    /// Accepts inbound connections on the configured port, dials from the
    /// peer directory and drives all timers from tokio intervals.
    pub async fn run(mut self) -> Result<()> {
        let wakeup = Arc::new(Notify::new());
        let listener = Listener::bind(self.config.peer_port).await?;
        if self.dialer.is_none() {
            self.dialer = Some(Box::new(TcpDialer::new(Arc::clone(&wakeup))));
        }
        info!(addr = %listener.local_addr(), "Overlay running");

        let mut tick = tokio::time::interval(TICK_PERIOD);
        let mut advert = tokio::time::interval(self.config.flood_advert_period);
        let mut demand = tokio::time::interval(self.config.flood_demand_period);

        loop {
            tokio::select! {
                _ = wakeup.notified() => {}
                accepted = listener.accept(Arc::clone(&wakeup)) => match accepted {
                    Ok(transport) => {
                        self.add_inbound(Box::new(transport), Instant::now());
                    }
                    Err(e) if e.is_retriable() => warn!(error = %e, "Failed to accept connection"),
                    Err(e) => return Err(e),
                },
                _ = tick.tick() => self.tick(Instant::now()),
                _ = advert.tick() => self.flush_adverts(Instant::now()),
                _ = demand.tick() => self.run_demand(Instant::now()),
            }
            self.process_io(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LoopbackTransport, StaticLedger};
    use fba_crypto::SecretKey;
    use std::net::Ipv4Addr;

    struct Quiet;
    impl MessageHandler for Quiet {}

    fn manager(seed: u8, config: OverlayConfig) -> OverlayManager {
        let config = config.with_rng_seed(seed as u64);
        let local = LocalNode::from_config(SecretKey::from_seed(&[seed; 32]), &config);
        OverlayManager::new(
            config,
            local,
            Box::new(StaticLedger::default()),
            Box::new(Quiet),
            PeerManager::new_in_memory(),
        )
    }

    fn addr(last: u8) -> PeerAddress {
        PeerAddress::new(Ipv4Addr::new(8, 8, 8, last), 11625)
    }

    fn link(a: &mut OverlayManager, b: &mut OverlayManager, now: Instant) -> (ConnectionId, ConnectionId) {
        let (t1, t2) = LoopbackTransport::pair(
            Some(Ipv4Addr::new(127, 0, 0, 1)),
            Some(Ipv4Addr::new(127, 0, 0, 2)),
        );
        let address = PeerAddress::new(Ipv4Addr::new(127, 0, 0, 2), b.config().peer_port);
        let ia = a.add_outbound(Box::new(t1), address, now);
        let ib = b.add_inbound(Box::new(t2), now);
        (ia, ib)
    }

    fn crank(a: &mut OverlayManager, b: &mut OverlayManager, now: Instant) {
        for _ in 0..20 {
            a.process_io(now);
            b.process_io(now);
        }
    }

    #[test]
    fn test_new_stores_configured_peers() {
        let config = OverlayConfig::default()
            .with_known_peers(vec![addr(1)])
            .with_preferred_peers(vec![addr(2)]);
        let m = manager(1, config);
        let peers = m.peer_manager().get_all_peers();
        assert_eq!(peers.len(), 2);
        let preferred = peers.iter().find(|(a, _)| *a == addr(2)).unwrap();
        assert_eq!(preferred.1.peer_type, StoredPeerType::Preferred);
        let known = peers.iter().find(|(a, _)| *a == addr(1)).unwrap();
        assert_eq!(known.1.peer_type, StoredPeerType::Outbound);
    }

    #[test]
    fn test_connect_without_dialer() {
        let mut m = manager(1, OverlayConfig::default());
        assert!(matches!(
            m.connect_to(addr(1), Instant::now()),
            Err(OverlayError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_handshake_events() {
        let now = Instant::now();
        let mut a = manager(1, OverlayConfig::default());
        let mut b = manager(2, OverlayConfig::default());
        let (ia, ib) = link(&mut a, &mut b, now);
        crank(&mut a, &mut b, now);

        assert_eq!(a.authenticated_peers(), vec![ia]);
        assert_eq!(b.authenticated_peers(), vec![ib]);
        assert_eq!(
            a.take_events(),
            vec![OverlayEvent::PeerAuthenticated {
                id: ia,
                node_id: b.local().public_key(),
                role: PeerRole::WeCalledRemote,
            }]
        );
        assert_eq!(a.connection_for(&b.local().public_key()), Some(ia));

        a.disconnect(ia, "done", now).unwrap();
        crank(&mut a, &mut b, now);
        assert!(a.peer(ia).is_none());
        assert!(b.peer(ib).is_none());
        let events = b.take_events();
        assert!(matches!(
            events.last(),
            Some(OverlayEvent::PeerDropped { reason, .. }) if reason.reason == "connection closed"
        ));
    }

    #[test]
    fn test_ban_drops_connection() {
        let now = Instant::now();
        let mut a = manager(1, OverlayConfig::default());
        let mut b = manager(2, OverlayConfig::default());
        let (ia, _) = link(&mut a, &mut b, now);
        crank(&mut a, &mut b, now);

        let key = b.local().public_key();
        a.ban_node(&key, now).unwrap();
        assert!(a.peer(ia).is_none());
        assert!(a.ban_manager().is_banned(&key));

        // Reconnecting is refused during the handshake.
        link(&mut a, &mut b, now);
        crank(&mut a, &mut b, now);
        assert!(a.authenticated_peers().is_empty());
        a.unban_node(&key).unwrap();
        assert!(!a.ban_manager().is_banned(&key));
    }

    #[test]
    fn test_failed_outbound_backs_off_and_purges() {
        let now = Instant::now();
        let config = OverlayConfig {
            max_failures_before_purge: 2,
            ..OverlayConfig::default()
        };
        let mut a = manager(1, config);
        let target = addr(9);
        a.peer_manager().ensure_exists(&target, unix_now() as i64);

        for _ in 0..2 {
            let (t1, t2) = LoopbackTransport::pair(None, None);
            let mut remote: Box<dyn Transport> = Box::new(t2);
            remote.close(false);
            a.add_outbound(Box::new(t1), target, now);
            a.process_io(now);
        }
        // Second failure reaches the purge threshold.
        assert!(a.peer_manager().get_all_peers().is_empty());
        assert_eq!(a.metrics().count(names::CONNECTION_DROP), 2);
    }
}
