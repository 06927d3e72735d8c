//! Connection slot accounting and admission decisions.
//!
//! Connections are tracked in two lists per direction: *pending* (still in
//! the handshake, in arrival order) and *authenticated*. Caps:
//!
//! | List | Cap |
//! |------|-----|
//! | inbound pending | `max_inbound_pending_connections` (+2 for possibly preferred) |
//! | outbound pending | `max_outbound_pending_connections` |
//! | inbound authenticated | `max_additional_peer_connections` |
//! | outbound authenticated | `target_peer_connections` |
//!
//! Pending connections beyond their cap are closed by [`Admission::sweep`],
//! newest first. A preferred peer that authenticates while its list is full
//! displaces a non-preferred one.

use crate::{ConnectionId, OverlayConfig, PeerAddress, PeerRole};
use fba_crypto::PublicKey;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Extra inbound pending slots for addresses on the preferred list.
pub const POSSIBLY_PREFERRED_EXTRA: usize = 2;

/// Outcome of [`Admission::accept_authenticated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Admitted; `evicted` must be dropped to make room.
    Accepted { evicted: Option<ConnectionId> },
    Rejected,
}

#[derive(Debug, Clone, Copy)]
struct AuthenticatedEntry {
    preferred: bool,
}

#[derive(Debug, Default)]
struct PeersList {
    /// Arrival order.
    pending: Vec<ConnectionId>,
    authenticated: BTreeMap<ConnectionId, AuthenticatedEntry>,
}

impl PeersList {
    fn remove(&mut self, id: ConnectionId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| *p != id);
        self.authenticated.remove(&id).is_some() || self.pending.len() != before
    }
}

/// Slot bookkeeping for every live connection.
#[derive(Debug)]
pub struct Admission {
    max_inbound_pending: usize,
    max_outbound_pending: usize,
    max_inbound_authenticated: usize,
    max_outbound_authenticated: usize,
    preferred_peers_only: bool,

    preferred_addresses: HashSet<PeerAddress>,
    preferred_ips: HashSet<Ipv4Addr>,
    preferred_keys: HashSet<PublicKey>,

    inbound: PeersList,
    outbound: PeersList,
    /// Node ids learned from HELLO.
    node_ids: HashMap<ConnectionId, PublicKey>,
    /// Inbound connections from an address on the preferred list.
    possibly_preferred: HashSet<ConnectionId>,
}

impl Admission {
    pub fn new(config: &OverlayConfig) -> Self {
        Self {
            max_inbound_pending: config.max_inbound_pending_connections,
            max_outbound_pending: config.max_outbound_pending_connections,
            max_inbound_authenticated: config.max_additional_peer_connections,
            max_outbound_authenticated: config.target_peer_connections,
            preferred_peers_only: config.preferred_peers_only,
            preferred_addresses: config.preferred_peers.iter().copied().collect(),
            preferred_ips: config.preferred_peers.iter().map(|a| a.ip).collect(),
            preferred_keys: config.preferred_peer_keys.iter().copied().collect(),
            inbound: PeersList::default(),
            outbound: PeersList::default(),
            node_ids: HashMap::new(),
            possibly_preferred: HashSet::new(),
        }
    }

    fn list(&self, role: PeerRole) -> &PeersList {
        match role {
            PeerRole::RemoteCalledUs => &self.inbound,
            PeerRole::WeCalledRemote => &self.outbound,
        }
    }

    fn list_mut(&mut self, role: PeerRole) -> &mut PeersList {
        match role {
            PeerRole::RemoteCalledUs => &mut self.inbound,
            PeerRole::WeCalledRemote => &mut self.outbound,
        }
    }

    fn max_authenticated(&self, role: PeerRole) -> usize {
        match role {
            PeerRole::RemoteCalledUs => self.max_inbound_authenticated,
            PeerRole::WeCalledRemote => self.max_outbound_authenticated,
        }
    }

    /// An inbound connection from this IP may turn out to be preferred.
    pub fn is_possibly_preferred(&self, ip: Option<Ipv4Addr>) -> bool {
        ip.is_some_and(|ip| self.preferred_ips.contains(&ip))
    }

    /// Preferred by listening address or by node key.
    pub fn is_preferred(&self, address: Option<&PeerAddress>, node_id: Option<&PublicKey>) -> bool {
        address.is_some_and(|a| self.preferred_addresses.contains(a))
            || node_id.is_some_and(|k| self.preferred_keys.contains(k))
    }

    pub fn is_preferred_address(&self, address: &PeerAddress) -> bool {
        self.preferred_addresses.contains(address)
    }

    /// Whether another outbound connection may be started now.
    pub fn has_outbound_pending_space(&self) -> bool {
        self.outbound.pending.len() < self.max_outbound_pending
    }

    /// Outbound slots left before reaching the target.
    pub fn outbound_slots_to_fill(&self) -> usize {
        self.max_outbound_authenticated
            .saturating_sub(self.outbound.authenticated.len() + self.outbound.pending.len())
    }

    /// Registers a new connection as pending.
    pub fn add_pending(&mut self, id: ConnectionId, role: PeerRole, remote_ip: Option<Ipv4Addr>) {
        if role == PeerRole::RemoteCalledUs && self.is_possibly_preferred(remote_ip) {
            self.possibly_preferred.insert(id);
        }
        self.list_mut(role).pending.push(id);
    }

    /// Records the node id a connection claimed in its HELLO.
    pub fn set_node_id(&mut self, id: ConnectionId, node_id: PublicKey) {
        self.node_ids.insert(id, node_id);
    }

    /// True if `node_id` is on a connection other than `except`.
    pub fn is_node_connected(&self, node_id: &PublicKey, except: ConnectionId) -> bool {
        self.node_ids
            .iter()
            .any(|(id, known)| *id != except && known == node_id)
    }

    /// Connection currently holding `node_id`, if it is authenticated.
    pub fn authenticated_connection(&self, node_id: &PublicKey) -> Option<ConnectionId> {
        self.node_ids
            .iter()
            .find(|(id, known)| *known == node_id && self.is_authenticated(**id))
            .map(|(id, _)| *id)
    }

    pub fn is_authenticated(&self, id: ConnectionId) -> bool {
        self.inbound.authenticated.contains_key(&id) || self.outbound.authenticated.contains_key(&id)
    }

    /// Moves a connection from pending to authenticated if there is room.
    ///
    /// A preferred peer arriving at a full list evicts a non-preferred
    /// authenticated peer of the same direction. With `preferred_peers_only`
    /// every non-preferred peer is rejected.
    pub fn accept_authenticated(
        &mut self,
        id: ConnectionId,
        role: PeerRole,
        preferred: bool,
    ) -> AdmissionDecision {
        let max = self.max_authenticated(role);
        let list = self.list(role);
        let full = list.authenticated.len() >= max;

        let decision = if preferred {
            let evicted = if full {
                list.authenticated
                    .iter()
                    .rev()
                    .find(|(_, entry)| !entry.preferred)
                    .map(|(victim, _)| *victim)
            } else {
                None
            };
            if full && evicted.is_none() {
                AdmissionDecision::Rejected
            } else {
                AdmissionDecision::Accepted { evicted }
            }
        } else if self.preferred_peers_only || full {
            AdmissionDecision::Rejected
        } else {
            AdmissionDecision::Accepted { evicted: None }
        };

        match decision {
            AdmissionDecision::Accepted { evicted } => {
                if let Some(victim) = evicted {
                    info!(
                        connection = %id,
                        evicted = %victim,
                        "Evicting non-preferred peer for preferred peer"
                    );
                    self.remove(victim);
                }
                let list = self.list_mut(role);
                list.pending.retain(|p| *p != id);
                list.authenticated
                    .insert(id, AuthenticatedEntry { preferred });
                self.possibly_preferred.remove(&id);
            }
            AdmissionDecision::Rejected => {
                debug!(connection = %id, ?role, preferred, "Rejecting authenticated peer");
            }
        }
        decision
    }

    /// Forgets a connection.
    pub fn remove(&mut self, id: ConnectionId) {
        if !self.inbound.remove(id) {
            self.outbound.remove(id);
        }
        self.node_ids.remove(&id);
        self.possibly_preferred.remove(&id);
    }

    /// Pending connections beyond the caps, newest first.
    ///
    /// Possibly-preferred inbound connections may use up to
    /// [`POSSIBLY_PREFERRED_EXTRA`] slots beyond the inbound cap.
    pub fn sweep(&self) -> Vec<ConnectionId> {
        let mut excess = Vec::new();

        let mut kept = 0;
        let mut kept_extra = 0;
        for &id in &self.inbound.pending {
            if kept < self.max_inbound_pending {
                kept += 1;
            } else if self.possibly_preferred.contains(&id) && kept_extra < POSSIBLY_PREFERRED_EXTRA
            {
                kept_extra += 1;
            } else {
                excess.push(id);
            }
        }
        excess.extend(
            self.outbound
                .pending
                .iter()
                .skip(self.max_outbound_pending)
                .copied(),
        );

        excess.sort_by(|a, b| b.cmp(a));
        excess
    }

    pub fn pending_count(&self, role: PeerRole) -> usize {
        self.list(role).pending.len()
    }

    pub fn authenticated_count(&self, role: PeerRole) -> usize {
        self.list(role).authenticated.len()
    }

    /// Authenticated connections, inbound first, in id order.
    pub fn authenticated_ids(&self) -> Vec<ConnectionId> {
        self.inbound
            .authenticated
            .keys()
            .chain(self.outbound.authenticated.keys())
            .copied()
            .collect()
    }
}
