//! Shared fixtures for the overlay integration tests.
//!
//! Nodes talk over [`LoopbackTransport`] pairs and every test drives time by
//! hand, so nothing here sleeps or spawns.

#![allow(dead_code)]

use bytes::BytesMut;
use fba_crypto::{xdr_sha256, PublicKey, SecretKey};
use fba_overlay::{
    AuthCert, AuthContext, ConnectionId, Dialer, LocalNode, LoopbackTransport, MessageCodec,
    MessageHandler, OverlayConfig, OverlayEvent, OverlayManager, PeerAddress, PeerManager,
    StaticLedger, Transport, TransportEvent, TxKnownStatus, TxLookup, PULL_MODE_AUTH_FLAG,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;
use stellar_xdr::curr::{
    self as xdr, AuthenticatedMessage, Hash, Hello, Memo, MuxedAccount, Preconditions,
    SequenceNumber, StellarMessage, Transaction, TransactionEnvelope, TransactionExt,
    TransactionV1Envelope, Uint256, VecM,
};
use tokio_util::codec::Decoder;

/// Installs a test subscriber once; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A transaction that differs per `seq`.
pub fn make_tx(seq: i64) -> TransactionEnvelope {
    TransactionEnvelope::Tx(TransactionV1Envelope {
        tx: Transaction {
            source_account: MuxedAccount::Ed25519(Uint256([7; 32])),
            fee: 100,
            seq_num: SequenceNumber(seq),
            cond: Preconditions::None,
            memo: Memo::None,
            operations: VecM::default(),
            ext: TransactionExt::V0,
        },
        signatures: VecM::default(),
    })
}

pub fn tx_hash(tx: &TransactionEnvelope) -> Hash {
    Hash(xdr_sha256(tx).unwrap())
}

/// What a node's application layer has seen and knows.
#[derive(Default)]
pub struct AppState {
    pub received: Vec<(PublicKey, StellarMessage)>,
    pub txs: HashMap<Hash, TransactionEnvelope>,
}

impl AppState {
    pub fn transactions(&self) -> Vec<TransactionEnvelope> {
        self.received
            .iter()
            .filter_map(|(_, message)| match message {
                StellarMessage::Transaction(tx) => Some(tx.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Records every message and serves demands from its transaction set.
pub struct RecordingHandler {
    state: Arc<Mutex<AppState>>,
}

impl MessageHandler for RecordingHandler {
    fn handle_message(
        &mut self,
        from: &PublicKey,
        _connection: ConnectionId,
        message: &StellarMessage,
    ) -> Vec<StellarMessage> {
        let mut state = self.state.lock();
        if let StellarMessage::Transaction(tx) = message {
            state.txs.insert(tx_hash(tx), tx.clone());
        }
        state.received.push((*from, message.clone()));
        Vec::new()
    }

    fn tx_lookup(&self, hash: &Hash) -> TxLookup {
        match self.state.lock().txs.get(hash) {
            Some(tx) => TxLookup::Found(tx.clone()),
            None => TxLookup::Unknown,
        }
    }

    fn tx_status(&self, hash: &Hash) -> TxKnownStatus {
        if self.state.lock().txs.contains_key(hash) {
            TxKnownStatus::Known
        } else {
            TxKnownStatus::Unknown
        }
    }
}

/// Transports handed out by [`LoopbackDialer`], waiting to be accepted.
pub type DialQueue = Arc<Mutex<Vec<(PeerAddress, LoopbackTransport)>>>;

/// Dialer whose connections are delivered by the test.
pub struct LoopbackDialer {
    local_ip: Ipv4Addr,
    queue: DialQueue,
}

impl Dialer for LoopbackDialer {
    fn dial(&mut self, address: PeerAddress) -> Box<dyn Transport> {
        let (initiator, acceptor) = LoopbackTransport::pair(Some(self.local_ip), Some(address.ip));
        self.queue.lock().push((address, acceptor));
        Box::new(initiator)
    }
}

/// An overlay manager plus the application state behind it.
pub struct Node {
    pub manager: OverlayManager,
    pub app: Arc<Mutex<AppState>>,
    pub ip: Ipv4Addr,
    pub dials: DialQueue,
}

impl Node {
    /// Node `seed` listens on `127.0.0.{seed}`.
    pub fn new(seed: u8, config: OverlayConfig) -> Self {
        Self::with_peer_manager(seed, config, PeerManager::new_in_memory())
    }

    pub fn with_peer_manager(seed: u8, config: OverlayConfig, peer_manager: PeerManager) -> Self {
        let config = config.with_rng_seed(u64::from(seed));
        let local = LocalNode::from_config(SecretKey::from_seed(&[seed; 32]), &config);
        let app = Arc::new(Mutex::new(AppState::default()));
        let ip = Ipv4Addr::new(127, 0, 0, seed);
        let dials = DialQueue::default();
        let manager = OverlayManager::new(
            config,
            local,
            Box::new(StaticLedger::default()),
            Box::new(RecordingHandler {
                state: Arc::clone(&app),
            }),
            peer_manager,
        )
        .with_dialer(Box::new(LoopbackDialer {
            local_ip: ip,
            queue: Arc::clone(&dials),
        }));
        Self {
            manager,
            app,
            ip,
            dials,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.manager.local().public_key()
    }

    pub fn address(&self) -> PeerAddress {
        PeerAddress::new(self.ip, self.manager.config().peer_port)
    }

    /// Adds `tx` to what the application knows.
    pub fn know_tx(&self, tx: &TransactionEnvelope) {
        self.app.lock().txs.insert(tx_hash(tx), tx.clone());
    }

    pub fn process_io(&mut self, now: Instant) {
        self.manager.process_io(now);
    }

    /// Reason the connection to `id` was dropped, from the event log.
    pub fn drop_reason(&mut self, id: ConnectionId) -> Option<String> {
        self.manager.take_events().into_iter().find_map(|event| match event {
            OverlayEvent::PeerDropped { id: dropped, reason, .. } if dropped == id => {
                Some(reason.reason)
            }
            _ => None,
        })
    }
}

/// Connects `a` to `b`; returns each side's connection id and a handle on
/// `a`'s end of the pipe.
pub fn link(
    a: &mut Node,
    b: &mut Node,
    now: Instant,
) -> (ConnectionId, ConnectionId, LoopbackTransport) {
    let (initiator, acceptor) = LoopbackTransport::pair(Some(a.ip), Some(b.ip));
    let handle = initiator.clone();
    let ia = a.manager.add_outbound(Box::new(initiator), b.address(), now);
    let ib = b.manager.add_inbound(Box::new(acceptor), now);
    (ia, ib, handle)
}

/// Hands connections `from` dialed to the nodes listening on those addresses.
pub fn deliver_dials(from: &Node, nodes: &mut [&mut Node], now: Instant) -> usize {
    let dials: Vec<_> = from.dials.lock().drain(..).collect();
    let mut delivered = 0;
    for (address, transport) in dials {
        if let Some(node) = nodes.iter_mut().find(|n| n.address() == address) {
            node.manager.add_inbound(Box::new(transport), now);
            delivered += 1;
        }
    }
    delivered
}

pub fn crank(nodes: &mut [&mut Node], now: Instant) {
    for _ in 0..20 {
        for node in nodes.iter_mut() {
            node.process_io(now);
        }
    }
}

/// A hand-driven remote that speaks the wire protocol directly, for
/// sending what a well-behaved node never would.
pub struct RawPeer {
    pub local: LocalNode,
    transport: LoopbackTransport,
    auth: AuthContext,
    codec: MessageCodec,
    buf: BytesMut,
    authenticated: bool,
    pub received: Vec<StellarMessage>,
    pub closed: bool,
}

impl RawPeer {
    /// Dials `node` and sends HELLO.
    pub fn connect(node: &mut Node, seed: u8, now: Instant) -> (RawPeer, ConnectionId) {
        Self::connect_with(node, seed, OverlayConfig::default(), now)
    }

    /// Like [`RawPeer::connect`], advertising the versions in `config`.
    pub fn connect_with(
        node: &mut Node,
        seed: u8,
        config: OverlayConfig,
        now: Instant,
    ) -> (RawPeer, ConnectionId) {
        let local = LocalNode::from_config(SecretKey::from_seed(&[seed; 32]), &config);
        let mut rng = StdRng::seed_from_u64(u64::from(seed));
        let auth = AuthContext::new(&local, true, fba_overlay::unix_now(), &mut rng);

        let (initiator, acceptor) =
            LoopbackTransport::pair(Some(Ipv4Addr::new(127, 0, 1, seed)), Some(node.ip));
        let id = node.manager.add_inbound(Box::new(acceptor), now);

        let mut raw = RawPeer {
            local,
            transport: initiator,
            auth,
            codec: MessageCodec::new(),
            buf: BytesMut::new(),
            authenticated: false,
            received: Vec::new(),
            closed: false,
        };
        let hello = Hello {
            ledger_version: raw.local.ledger_version,
            overlay_version: raw.local.overlay_version,
            overlay_min_version: raw.local.overlay_min_version,
            network_id: Hash(raw.local.network_id),
            version_str: "raw-peer".try_into().unwrap(),
            listening_port: 11625,
            peer_id: xdr::NodeId::from(&raw.local.public_key()),
            cert: raw.auth.cert().to_xdr(),
            nonce: Uint256(*raw.auth.local_nonce()),
        };
        raw.send(StellarMessage::Hello(hello));
        (raw, id)
    }

    /// Runs the handshake against `node` to completion.
    pub fn handshake(node: &mut Node, seed: u8, now: Instant) -> (RawPeer, ConnectionId) {
        Self::handshake_with(node, seed, OverlayConfig::default(), now)
    }

    pub fn handshake_with(
        node: &mut Node,
        seed: u8,
        config: OverlayConfig,
        now: Instant,
    ) -> (RawPeer, ConnectionId) {
        let (mut raw, id) = Self::connect_with(node, seed, config, now);
        for _ in 0..10 {
            node.process_io(now);
            raw.poll();
            if raw.authenticated || raw.closed {
                break;
            }
        }
        assert!(raw.authenticated, "raw peer failed to authenticate");
        node.process_io(now);
        raw.poll();
        (raw, id)
    }

    pub fn send(&mut self, message: StellarMessage) {
        let sealed = self.auth.seal(message).unwrap();
        let frame = MessageCodec::encode_message(&sealed).unwrap();
        self.transport.send(frame);
    }

    /// Reads everything the node sent; answers HELLO with AUTH.
    pub fn poll(&mut self) {
        while let Some(event) = self.transport.poll_event() {
            match event {
                TransportEvent::Data(bytes) => self.buf.extend_from_slice(&bytes),
                TransportEvent::Closed => self.closed = true,
                TransportEvent::Connected | TransportEvent::Written(_) => {}
            }
        }
        while let Some(frame) = self.codec.decode(&mut self.buf).unwrap() {
            let AuthenticatedMessage::V0(v0) = frame.message;
            match &v0.message {
                StellarMessage::Hello(hello) => {
                    let cert = AuthCert::from_xdr(&hello.cert).unwrap();
                    self.auth.derive_keys(&cert.pubkey, &hello.nonce.0);
                    self.send(StellarMessage::Auth(xdr::Auth {
                        flags: PULL_MODE_AUTH_FLAG,
                    }));
                }
                StellarMessage::ErrorMsg(_) => {}
                message => {
                    assert!(self.auth.open(&v0).unwrap().is_ok());
                    if matches!(message, StellarMessage::Auth(_)) {
                        self.authenticated = true;
                        self.codec.set_authenticated();
                    }
                }
            }
            self.received.push(v0.message);
        }
    }

    pub fn received_transactions(&self) -> usize {
        self.received
            .iter()
            .filter(|m| matches!(m, StellarMessage::Transaction(_)))
            .count()
    }
}
