//! Peer-to-peer overlay engine for a federated-Byzantine-agreement ledger node.
//!
//! This crate implements the connection layer between validators: how nodes
//! authenticate each other, how much traffic each side may push, and how
//! transactions spread through the network. It provides:
//!
//! - **Authenticated connections** - Curve25519 key agreement bound to the
//!   node's Ed25519 identity, with HMAC-SHA256 on every message
//! - **Flow control** - credit-based `SEND_MORE` accounting with prioritized
//!   outbound queues
//! - **Pull-mode flooding** - transactions are advertised by hash and
//!   demanded by the peers that lack them
//! - **Peer directory and admission** - an address book with backoff, and
//!   slot limits for pending and authenticated connections
//!
//! # Architecture
//!
//! - [`OverlayManager`] - owns every connection and drives the timers; one
//!   logical thread, no per-connection locks
//! - [`Peer`] - the handshake state machine and message handlers of one
//!   connection
//! - [`FlowControl`] - capacity accounting and the outbound queues
//! - [`TxAdverts`] / [`TxDemandsManager`] - advert batching and the demand
//!   scheduler
//! - [`PeerManager`] / [`Admission`] - who to connect to, and who to keep
//! - [`Transport`] - the byte pipe underneath a peer ([`TcpTransport`] or
//!   [`LoopbackTransport`])
//!
//! Handlers take the current [`Instant`](std::time::Instant) as an argument,
//! so the whole engine can run under virtual time in tests.
//!
//! # Protocol Overview
//!
//! 1. Both sides exchange `HELLO` with an auth certificate and a nonce
//! 2. Both derive per-direction MAC keys from ECDH and the nonces
//! 3. The caller sends `AUTH`, the acceptor answers with `AUTH` and `PEERS`
//! 4. Each side grants reading capacity with `SEND_MORE`
//!
//! # Example
//!
//! ```rust,no_run
//! use fba_crypto::{sha256, SecretKey};
//! use fba_overlay::{
//!     LocalNode, MessageHandler, OverlayConfig, OverlayManager, PeerManager, StaticLedger,
//! };
//!
//! struct Ignore;
//! impl MessageHandler for Ignore {}
//!
//! # async fn example() -> fba_overlay::Result<()> {
//! let config = OverlayConfig::default().with_network_passphrase("my network");
//! let local = LocalNode::from_config(SecretKey::from_seed(&sha256(b"seed")), &config);
//! let manager = OverlayManager::new(
//!     config,
//!     local,
//!     Box::new(StaticLedger::default()),
//!     Box::new(Ignore),
//!     PeerManager::new_in_memory(),
//! );
//! manager.run().await
//! # }
//! ```

mod admission;
mod auth;
mod ban_manager;
mod codec;
mod connection;
mod error;
mod flow_control;
mod manager;
mod metrics;
mod peer;
mod peer_manager;
mod transport;
mod tx_adverts;
mod tx_demands;

pub use admission::{Admission, AdmissionDecision, POSSIBLY_PREFERRED_EXTRA};
pub use auth::{unix_now, AuthCert, AuthContext, MacFailure, AUTH_CERT_EXPIRATION_SECONDS};
pub use ban_manager::BanManager;
pub use codec::{
    helpers as message_helpers, MessageCodec, MessageFrame, MAX_MESSAGE_SIZE,
    MAX_UNAUTHENTICATED_MESSAGE_SIZE,
};
pub use connection::{Listener, TcpDialer, TcpTransport, DEFAULT_CONNECT_TIMEOUT};
pub use error::OverlayError;
pub use flow_control::{
    FlowControl, FlowControlConfig, FlowControlError, FlowControlState, MessagePriority,
    QueueLimits, QueuedOutboundMessage, FIRST_VERSION_SUPPORTING_FLOW_CONTROL,
};
pub use manager::{OverlayEvent, OverlayManager};
pub use metrics::{names as metric_names, Counter, OverlayMetrics, Timer, TimerSnapshot};
pub use peer::{
    DropDirection, DropMode, DropReason, Peer, PeerContext, PeerState,
    FIRST_VERSION_SUPPORTING_PULL_MODE, PULL_MODE_AUTH_FLAG,
};
pub use peer_manager::{
    BackOffUpdate, MemoryPeerStore, PeerManager, PeerQuery, PeerRecord, PeerStore,
    PeerTypeFilter, SqlitePeerStore, StoredPeerType, TypeUpdate, MAX_PEERS_TO_SEND,
    REALLY_DEAD_NUM_FAILURES_CUTOFF,
};
pub use transport::{Dialer, LoopbackTransport, Transport, TransportEvent};
pub use tx_adverts::{max_batch_size, OutgoingAdvert, TxAdverts, TX_ADVERT_VECTOR_MAX_SIZE};
pub use tx_demands::{
    DemandStatus, TxDemandsManager, TxKnownStatus, TxPullLatency, MAX_RETENTION, MAX_RETRY_COUNT,
};

use fba_crypto::{sha256, PublicKey, SecretKey};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use stellar_xdr::curr::{self as xdr, Hash, StellarMessage, TransactionEnvelope};

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Passphrase of the network a default configuration joins.
pub const DEFAULT_NETWORK_PASSPHRASE: &str = "Standalone Network ; February 2017";

const VERSION_STRING: &str = concat!("fba-overlay ", env!("CARGO_PKG_VERSION"));
const LEDGER_VERSION: u32 = 22;
const OVERLAY_VERSION: u32 = 38;
const OVERLAY_MIN_VERSION: u32 = 35;
const DEFAULT_PEER_PORT: u16 = 11625;

/// Configuration for the overlay.
///
/// Plain data with sensible defaults. Tests usually start from
/// `OverlayConfig::default()` and adjust a few fields with the `with_*`
/// helpers or struct update syntax.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// SHA-256 of the network passphrase. Peers on another network are
    /// refused during the handshake.
    pub network_id: [u8; 32],

    pub ledger_version: u32,
    pub overlay_version: u32,
    /// Oldest overlay version accepted from a peer.
    pub overlay_min_version: u32,
    /// Sent in HELLO.
    pub version_str: String,

    /// Port we listen on and advertise in HELLO.
    pub peer_port: u16,

    /// Outbound connections to maintain; also the outbound authenticated cap.
    pub target_peer_connections: usize,
    /// Inbound authenticated cap.
    pub max_additional_peer_connections: usize,
    pub max_inbound_pending_connections: usize,
    pub max_outbound_pending_connections: usize,

    /// Addresses to connect to at startup.
    pub known_peers: Vec<PeerAddress>,
    /// Addresses always worth a slot.
    pub preferred_peers: Vec<PeerAddress>,
    /// Node keys always worth a slot.
    pub preferred_peer_keys: Vec<PublicKey>,
    /// Refuse every peer that is not preferred.
    pub preferred_peers_only: bool,

    /// I/O timeout before the handshake completes.
    pub peer_authentication_timeout: Duration,
    /// I/O timeout once authenticated.
    pub peer_timeout: Duration,
    /// Longest a write may sit in the queue before the peer is dropped.
    pub peer_straggler_timeout: Duration,

    pub peer_flood_reading_capacity: u32,
    pub peer_reading_capacity: u32,
    pub flow_control_send_more_batch_size: u32,

    pub enable_pull_mode: bool,
    pub flood_advert_period: Duration,
    pub flood_demand_period: Duration,

    /// A failing outbound address is forgotten after this many failures.
    pub max_failures_before_purge: u32,

    /// Accept loopback addresses from PEERS messages.
    pub allow_localhost_for_testing: bool,

    /// Seed for the engine's RNG; OS entropy when `None`.
    pub rng_seed: Option<u64>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            network_id: sha256(DEFAULT_NETWORK_PASSPHRASE.as_bytes()),
            ledger_version: LEDGER_VERSION,
            overlay_version: OVERLAY_VERSION,
            overlay_min_version: OVERLAY_MIN_VERSION,
            version_str: VERSION_STRING.to_string(),
            peer_port: DEFAULT_PEER_PORT,
            target_peer_connections: 8,
            max_additional_peer_connections: 64,
            max_inbound_pending_connections: 64,
            max_outbound_pending_connections: 56,
            known_peers: Vec::new(),
            preferred_peers: Vec::new(),
            preferred_peer_keys: Vec::new(),
            preferred_peers_only: false,
            peer_authentication_timeout: Duration::from_secs(2),
            peer_timeout: Duration::from_secs(30),
            peer_straggler_timeout: Duration::from_secs(120),
            peer_flood_reading_capacity: flow_control::DEFAULT_PEER_FLOOD_READING_CAPACITY,
            peer_reading_capacity: flow_control::DEFAULT_PEER_READING_CAPACITY,
            flow_control_send_more_batch_size: flow_control::DEFAULT_SEND_MORE_BATCH_SIZE,
            enable_pull_mode: true,
            flood_advert_period: Duration::from_millis(500),
            flood_demand_period: Duration::from_millis(500),
            max_failures_before_purge: 10,
            allow_localhost_for_testing: false,
            rng_seed: None,
        }
    }
}

impl OverlayConfig {
    pub fn with_network_passphrase(mut self, passphrase: &str) -> Self {
        self.network_id = sha256(passphrase.as_bytes());
        self
    }

    pub fn with_peer_port(mut self, port: u16) -> Self {
        self.peer_port = port;
        self
    }

    pub fn with_overlay_versions(mut self, min_version: u32, version: u32) -> Self {
        self.overlay_min_version = min_version;
        self.overlay_version = version;
        self
    }

    pub fn with_reading_capacity(mut self, flood: u32, total: u32, batch: u32) -> Self {
        self.peer_flood_reading_capacity = flood;
        self.peer_reading_capacity = total;
        self.flow_control_send_more_batch_size = batch;
        self
    }

    pub fn with_pull_mode(mut self, enabled: bool) -> Self {
        self.enable_pull_mode = enabled;
        self
    }

    pub fn with_preferred_peers(mut self, peers: Vec<PeerAddress>) -> Self {
        self.preferred_peers = peers;
        self
    }

    pub fn with_known_peers(mut self, peers: Vec<PeerAddress>) -> Self {
        self.known_peers = peers;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Capacities handed to each connection's [`FlowControl`].
    pub fn flow_control_config(&self) -> FlowControlConfig {
        FlowControlConfig {
            peer_flood_reading_capacity: self.peer_flood_reading_capacity,
            peer_reading_capacity: self.peer_reading_capacity,
            send_more_batch_size: self.flow_control_send_more_batch_size,
        }
    }
}

/// IPv4 address and port of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerAddress {
    /// # Example
    ///
    /// ```rust
    /// use fba_overlay::PeerAddress;
    /// use std::net::Ipv4Addr;
    ///
    /// let addr = PeerAddress::new(Ipv4Addr::new(1, 2, 3, 4), 11625);
    /// assert_eq!(addr.to_string(), "1.2.3.4:11625");
    /// assert_eq!("1.2.3.4:11625".parse::<PeerAddress>().unwrap(), addr);
    /// ```
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// RFC 1918 ranges: 10/8, 172.16/12, 192.168/16.
    pub fn is_private(&self) -> bool {
        self.ip.is_private()
    }

    pub fn is_localhost(&self) -> bool {
        self.ip.is_loopback()
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.port))
    }

    pub fn to_xdr(&self, num_failures: u32) -> xdr::PeerAddress {
        xdr::PeerAddress {
            ip: xdr::PeerAddressIp::IPv4(self.ip.octets()),
            port: u32::from(self.port),
            num_failures,
        }
    }

    /// `None` for IPv6 and for ports outside `1..=65535`.
    pub fn from_xdr(address: &xdr::PeerAddress) -> Option<Self> {
        let xdr::PeerAddressIp::IPv4(octets) = address.ip else {
            return None;
        };
        let port = u16::try_from(address.port).ok().filter(|p| *p != 0)?;
        Some(Self::new(Ipv4Addr::from(octets), port))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| OverlayError::InvalidPeerAddress(format!("missing port: {}", s)))?;
        let ip = ip
            .parse::<Ipv4Addr>()
            .map_err(|e| OverlayError::InvalidPeerAddress(format!("{}: {}", s, e)))?;
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| OverlayError::InvalidPeerAddress(format!("bad port: {}", s)))?;
        Ok(Self::new(ip, port))
    }
}

/// Arena key of a live connection. Never reused within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    WeCalledRemote,
    RemoteCalledUs,
}

/// Identity and protocol versions this node presents in HELLO.
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub secret_key: SecretKey,
    pub network_id: [u8; 32],
    pub version_string: String,
    pub ledger_version: u32,
    pub overlay_version: u32,
    pub overlay_min_version: u32,
    pub listening_port: u16,
}

impl LocalNode {
    /// Node on the network named by `network_passphrase`, with default
    /// versions and port.
    pub fn new(secret_key: SecretKey, network_passphrase: &str) -> Self {
        let config = OverlayConfig::default().with_network_passphrase(network_passphrase);
        Self::from_config(secret_key, &config)
    }

    pub fn from_config(secret_key: SecretKey, config: &OverlayConfig) -> Self {
        Self {
            secret_key,
            network_id: config.network_id,
            version_string: config.version_str.clone(),
            ledger_version: config.ledger_version,
            overlay_version: config.overlay_version,
            overlay_min_version: config.overlay_min_version,
            listening_port: config.peer_port,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret_key.public_key()
    }
}

/// Ledger-side limits the overlay sizes its queues by.
pub trait LedgerProvider: Send {
    /// Operations in a full transaction set.
    fn max_tx_set_size_ops(&self) -> u32;

    fn ledger_version(&self) -> u32;

    /// SCP statements for older slots are obsolete.
    fn min_slot_to_remember(&self) -> u64;
}

/// Fixed ledger limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticLedger {
    pub max_tx_set_ops: u32,
    pub ledger_version: u32,
    pub min_slot_to_remember: u64,
}

impl Default for StaticLedger {
    fn default() -> Self {
        Self {
            max_tx_set_ops: 1000,
            ledger_version: LEDGER_VERSION,
            min_slot_to_remember: 0,
        }
    }
}

impl LedgerProvider for StaticLedger {
    fn max_tx_set_size_ops(&self) -> u32 {
        self.max_tx_set_ops
    }

    fn ledger_version(&self) -> u32 {
        self.ledger_version
    }

    fn min_slot_to_remember(&self) -> u64 {
        self.min_slot_to_remember
    }
}

/// What a node has for a demanded transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxLookup {
    Found(TransactionEnvelope),
    Banned,
    Unknown,
}

/// Application side of the overlay.
///
/// Receives every authenticated message the overlay does not consume itself
/// (SCP, transactions, tx sets, quorum sets, state requests) and answers the
/// lookups that pull-mode flooding needs. All methods have no-op defaults.
pub trait MessageHandler: Send {
    /// Handles a message from `from` on connection `connection`.
    ///
    /// Returned messages are sent back on the same connection. An empty
    /// answer to `GET_TX_SET` or `GET_SCP_QUORUMSET` is answered with
    /// `DONT_HAVE`.
    fn handle_message(
        &mut self,
        from: &PublicKey,
        connection: ConnectionId,
        message: &StellarMessage,
    ) -> Vec<StellarMessage> {
        let _ = (from, connection, message);
        Vec::new()
    }

    /// The transaction to send for a demand.
    fn tx_lookup(&self, tx_hash: &Hash) -> TxLookup {
        let _ = tx_hash;
        TxLookup::Unknown
    }

    /// Whether `tx_hash` is already known, so it need not be demanded.
    fn tx_status(&self, tx_hash: &Hash) -> TxKnownStatus {
        let _ = tx_hash;
        TxKnownStatus::Unknown
    }
}
