//! A single overlay connection.
//!
//! [`Peer`] owns the transport of one connection and runs its whole life
//! cycle: the HELLO/AUTH handshake, MAC checking, flow-control accounting,
//! message dispatch and the liveness timers.
//!
//! # States
//!
//! ```text
//! Connecting ──connect──▶ Connected ──HELLO──▶ GotHello ──AUTH──▶ GotAuth
//!      │                      │                   │                  │
//!      └──────────────────────┴───────────────────┴──────────────────┴──▶ Closing
//! ```
//!
//! Outbound connections start in `Connecting` and send HELLO once the
//! transport reports the connection; inbound ones start in `Connected` and
//! answer the caller's HELLO with their own.
//!
//! # Dispatch
//!
//! Handshake messages are handled as soon as they are decoded, since the
//! MAC keys they produce are needed for the very next frame. Once
//! authenticated, decoded frames first pass the read-time checks (MAC,
//! `SEND_MORE` accounting, flood capacity) and are then processed in arrival
//! order. Capacity taken at decode time is returned after processing, and a
//! `SEND_MORE` goes out for every full batch of flood messages.
//!
//! Protocol violations never surface as `Err`: they end the connection with
//! a [`DropReason`].

use crate::admission::AdmissionDecision;
use crate::auth::{AuthCert, AuthContext, MacFailure};
use crate::ban_manager::BanManager;
use crate::codec::helpers::{is_flood_message, message_type_name};
use crate::codec::MessageCodec;
use crate::flow_control::{FlowControl, FlowControlState, QueueLimits};
use crate::metrics::{names, OverlayMetrics};
use crate::peer_manager::{BackOffUpdate, PeerManager, StoredPeerType, MAX_PEERS_TO_SEND};
use crate::transport::{Transport, TransportEvent};
use crate::tx_adverts::{OutgoingAdvert, TxAdverts};
use crate::tx_demands::TxDemandsManager;
use crate::{
    Admission, ConnectionId, LedgerProvider, LocalNode, MessageHandler, OverlayConfig,
    OverlayError, PeerAddress, PeerRole, TxLookup, FIRST_VERSION_SUPPORTING_FLOW_CONTROL,
};
use bytes::BytesMut;
use fba_crypto::{sha256, xdr_sha256, PublicKey};
use rand::rngs::StdRng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stellar_xdr::curr::{
    self as xdr, AuthenticatedMessage, DontHave, ErrorCode, FloodAdvert, Hash, Hello,
    MessageType, PeerAddressIp, SError, SendMore, StellarMessage, Uint256, VecM,
};
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace};

/// First overlay version that understands `FLOOD_ADVERT`/`FLOOD_DEMAND`.
pub const FIRST_VERSION_SUPPORTING_PULL_MODE: u32 = 24;

/// AUTH flags announcing pull-mode support.
pub const PULL_MODE_AUTH_FLAG: i32 = 100;

/// Period of the liveness timer.
const RECURRENT_TIMER_PERIOD: Duration = Duration::from_secs(5);

/// How long outbound credit may stay exhausted before the peer is dropped.
const PEER_SEND_MODE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// First ledger version with generalized transaction sets.
const FIRST_GENERALIZED_TX_SET_VERSION: u32 = 20;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerState {
    Connecting,
    Connected,
    GotHello,
    GotAuth,
    Closing,
}

/// Which side ended the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropDirection {
    WeDroppedRemote,
    RemoteDroppedUs,
}

/// What happens to queued writes when a connection is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropMode {
    FlushWriteQueue,
    IgnoreWriteQueue,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropReason {
    pub reason: String,
    pub direction: DropDirection,
}

/// Engine-wide state a peer needs while handling an event.
///
/// Built by the [`OverlayManager`](crate::OverlayManager) for each call, so
/// a peer never holds references to shared state between events.
pub struct PeerContext<'a> {
    pub config: &'a OverlayConfig,
    pub local: &'a LocalNode,
    pub ledger: &'a dyn LedgerProvider,
    pub handler: &'a mut dyn MessageHandler,
    pub peer_manager: &'a PeerManager,
    pub ban_manager: &'a BanManager,
    pub admission: &'a mut Admission,
    pub demands: &'a mut TxDemandsManager,
    pub metrics: &'a Arc<OverlayMetrics>,
    pub rng: &'a mut StdRng,
    /// Wall-clock time, for certificates and peer records.
    pub unix_now: u64,
    /// Connections to drop because a preferred peer took their slot.
    pub evictions: &'a mut Vec<ConnectionId>,
}

/// One overlay connection.
pub struct Peer {
    id: ConnectionId,
    role: PeerRole,
    state: PeerState,

    transport: Box<dyn Transport>,
    codec: MessageCodec,
    read_buf: BytesMut,
    read_paused: bool,

    auth: AuthContext,
    flow_control: FlowControl,
    adverts: TxAdverts,
    metrics: Arc<OverlayMetrics>,

    created_at: Instant,
    last_read: Instant,
    last_write: Instant,
    enqueue_time_of_last_write: Instant,
    /// Enqueue time of every frame handed to the transport and not yet
    /// written.
    pending_writes: VecDeque<Instant>,
    next_recurrent: Instant,

    peer_id: Option<PublicKey>,
    address: Option<PeerAddress>,
    remote_overlay_version: u32,
    remote_overlay_min_version: u32,
    remote_version: String,
    pull_mode: bool,

    authenticated_at: Option<Instant>,
    ping: Option<(Uint256, Instant)>,
    last_ping: Option<Duration>,

    /// Authenticated messages decoded and awaiting processing, with whether
    /// they took reading capacity.
    inbound: VecDeque<(StellarMessage, bool)>,
    drop_reason: Option<DropReason>,
}

impl Peer {
    /// Creates a connection over `transport`.
    ///
    /// `address` is the dialed address for outbound connections; inbound
    /// ones learn it from HELLO.
    pub fn new(
        id: ConnectionId,
        role: PeerRole,
        transport: Box<dyn Transport>,
        address: Option<PeerAddress>,
        ctx: &mut PeerContext<'_>,
        now: Instant,
    ) -> Self {
        let we_called_remote = role == PeerRole::WeCalledRemote;
        let auth = AuthContext::new(ctx.local, we_called_remote, ctx.unix_now, &mut *ctx.rng);
        let state = if we_called_remote {
            PeerState::Connecting
        } else {
            PeerState::Connected
        };

        Self {
            id,
            role,
            state,
            transport,
            codec: MessageCodec::new(),
            read_buf: BytesMut::new(),
            read_paused: false,
            auth,
            flow_control: FlowControl::new(
                ctx.config.flow_control_config(),
                Arc::clone(ctx.metrics),
                now,
            ),
            adverts: TxAdverts::new(ctx.config.flood_advert_period),
            metrics: Arc::clone(ctx.metrics),
            created_at: now,
            last_read: now,
            last_write: now,
            enqueue_time_of_last_write: now,
            pending_writes: VecDeque::new(),
            next_recurrent: now + RECURRENT_TIMER_PERIOD,
            peer_id: None,
            address,
            remote_overlay_version: 0,
            remote_overlay_min_version: 0,
            remote_version: String::new(),
            pull_mode: false,
            authenticated_at: None,
            ping: None,
            last_ping: None,
            inbound: VecDeque::new(),
            drop_reason: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Node key from HELLO, once received.
    pub fn peer_id(&self) -> Option<&PublicKey> {
        self.peer_id.as_ref()
    }

    /// Dialed address, or `(remote ip, listening port)` after HELLO.
    pub fn address(&self) -> Option<&PeerAddress> {
        self.address.as_ref()
    }

    pub fn remote_version(&self) -> &str {
        &self.remote_version
    }

    pub fn remote_overlay_version(&self) -> u32 {
        self.remote_overlay_version
    }

    pub fn remote_overlay_min_version(&self) -> u32 {
        self.remote_overlay_min_version
    }

    pub fn drop_reason(&self) -> Option<&DropReason> {
        self.drop_reason.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == PeerState::GotAuth
    }

    /// When AUTH completed; kept after the connection starts closing.
    pub fn authenticated_at(&self) -> Option<Instant> {
        self.authenticated_at
    }

    pub fn is_closing(&self) -> bool {
        self.state == PeerState::Closing
    }

    pub fn is_pull_mode(&self) -> bool {
        self.pull_mode
    }

    pub fn flow_control(&self) -> &FlowControl {
        &self.flow_control
    }

    pub fn adverts_mut(&mut self) -> &mut TxAdverts {
        &mut self.adverts
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// Round trip of the last answered ping.
    pub fn last_ping(&self) -> Option<Duration> {
        self.last_ping
    }

    pub fn next_recurrent(&self) -> Instant {
        self.next_recurrent
    }

    /// Drains transport events and processes whatever became readable.
    pub fn process_io(&mut self, ctx: &mut PeerContext<'_>, now: Instant) {
        let mut closed = false;
        while let Some(event) = self.transport.poll_event() {
            match event {
                TransportEvent::Connected => {
                    if self.state == PeerState::Connecting {
                        self.state = PeerState::Connected;
                        debug!(peer = %self.id, "Connected");
                        self.send_hello(ctx, now);
                    }
                }
                TransportEvent::Data(bytes) => {
                    self.last_read = now;
                    self.metrics.mark_n(names::BYTE_READ, bytes.len() as u64);
                    self.read_buf.extend_from_slice(&bytes);
                }
                TransportEvent::Written(count) => {
                    self.last_write = now;
                    for _ in 0..count {
                        if let Some(enqueued) = self.pending_writes.pop_front() {
                            self.enqueue_time_of_last_write = enqueued;
                        }
                    }
                }
                TransportEvent::Closed => closed = true,
            }
        }

        self.read_messages(ctx, now);

        if closed && !self.is_closing() {
            let reason = if self.state == PeerState::Connecting {
                "unable to connect"
            } else {
                "connection closed"
            };
            self.drop(reason, DropDirection::RemoteDroppedUs, DropMode::IgnoreWriteQueue);
        }
    }

    fn read_messages(&mut self, ctx: &mut PeerContext<'_>, now: Instant) {
        loop {
            let mut progress = false;
            while !self.is_closing() && self.flow_control.has_reading_capacity() {
                match self.codec.decode(&mut self.read_buf) {
                    Ok(Some(frame)) => {
                        progress = true;
                        self.recv_frame(ctx, frame.message, now);
                    }
                    Ok(None) => break,
                    Err(OverlayError::MessageTooLarge { size, limit }) => {
                        debug!(peer = %self.id, size, limit, "Oversized frame");
                        self.drop(
                            "message size unacceptable",
                            DropDirection::WeDroppedRemote,
                            DropMode::IgnoreWriteQueue,
                        );
                    }
                    Err(e) => {
                        debug!(peer = %self.id, error = %e, "Undecodable frame");
                        self.drop(
                            "received corrupted message",
                            DropDirection::WeDroppedRemote,
                            DropMode::IgnoreWriteQueue,
                        );
                    }
                }
            }

            if !self.is_closing() && !self.flow_control.has_reading_capacity() && !self.read_paused
            {
                debug!(peer = %self.id, "Throttling reads, no reading capacity");
                self.transport.set_read_enabled(false);
                self.read_paused = true;
            }

            progress |= self.process_inbound(ctx, now);
            if !progress || self.is_closing() {
                break;
            }
        }

        if self.read_paused && !self.is_closing() && self.flow_control.has_reading_capacity() {
            self.transport.set_read_enabled(true);
            self.read_paused = false;
        }
    }

    /// Read-time handling of one decoded frame.
    fn recv_frame(
        &mut self,
        ctx: &mut PeerContext<'_>,
        message: AuthenticatedMessage,
        now: Instant,
    ) {
        let AuthenticatedMessage::V0(v0) = message;
        self.metrics.mark(names::MESSAGE_READ);

        if self.state >= PeerState::GotHello && !matches!(v0.message, StellarMessage::ErrorMsg(_))
        {
            match self.auth.open(&v0) {
                Ok(Ok(())) => {}
                Ok(Err(MacFailure::UnexpectedSequence { expected, got })) => {
                    debug!(peer = %self.id, expected, got, "Unexpected sequence");
                    self.send_error_and_drop(
                        ErrorCode::Auth,
                        "unexpected auth sequence",
                        DropMode::IgnoreWriteQueue,
                        now,
                    );
                    return;
                }
                Ok(Err(MacFailure::BadMac)) => {
                    self.send_error_and_drop(
                        ErrorCode::Auth,
                        "unexpected MAC",
                        DropMode::IgnoreWriteQueue,
                        now,
                    );
                    return;
                }
                Err(e) => {
                    debug!(peer = %self.id, error = %e, "Failed to check MAC");
                    self.drop(
                        "received corrupted message",
                        DropDirection::WeDroppedRemote,
                        DropMode::IgnoreWriteQueue,
                    );
                    return;
                }
            }
        }

        let message = v0.message;
        if !self.is_authenticated() {
            self.recv_raw_message(ctx, &message, now);
            return;
        }

        match &message {
            StellarMessage::SendMore(send_more) => {
                if self.remote_overlay_version < FIRST_VERSION_SUPPORTING_FLOW_CONTROL {
                    self.drop(
                        "Peer sent SEND_MORE that it doesn't support",
                        DropDirection::WeDroppedRemote,
                        DropMode::IgnoreWriteQueue,
                    );
                    return;
                }
                if ctx.local.overlay_version < FIRST_VERSION_SUPPORTING_FLOW_CONTROL {
                    self.drop(
                        "does not support SEND_MORE",
                        DropDirection::WeDroppedRemote,
                        DropMode::IgnoreWriteQueue,
                    );
                    return;
                }
                if let Err(e) = self.flow_control.receive_send_more(send_more.num_messages) {
                    self.drop(
                        e.reason(),
                        DropDirection::WeDroppedRemote,
                        DropMode::IgnoreWriteQueue,
                    );
                    return;
                }
            }
            StellarMessage::FloodAdvert(_) | StellarMessage::FloodDemand(_) if !self.pull_mode => {
                let reason = format!(
                    "Peer sent {}, but pull mode is disabled",
                    message_type_name(&message)
                );
                self.drop(reason, DropDirection::WeDroppedRemote, DropMode::IgnoreWriteQueue);
                return;
            }
            _ => {}
        }

        let counted = self.flow_control.is_enabled();
        if let Err(e) = self.flow_control.begin_message_processing(&message) {
            self.drop(
                e.reason(),
                DropDirection::WeDroppedRemote,
                DropMode::IgnoreWriteQueue,
            );
            return;
        }
        self.inbound.push_back((message, counted));
    }

    fn process_inbound(&mut self, ctx: &mut PeerContext<'_>, now: Instant) -> bool {
        let mut processed = false;
        while let Some((message, counted)) = self.inbound.pop_front() {
            processed = true;
            self.recv_raw_message(ctx, &message, now);
            if self.is_closing() {
                self.inbound.clear();
                break;
            }
            if counted {
                if let Some(num_messages) = self.flow_control.end_message_processing(&message) {
                    self.send_message(
                        ctx,
                        StellarMessage::SendMore(SendMore { num_messages }),
                        now,
                    );
                }
            }
        }
        processed
    }

    fn recv_raw_message(
        &mut self,
        ctx: &mut PeerContext<'_>,
        message: &StellarMessage,
        now: Instant,
    ) {
        if self.is_closing() {
            return;
        }

        let type_name = message_type_name(message);
        if !self.is_authenticated()
            && !matches!(
                message,
                StellarMessage::Hello(_) | StellarMessage::Auth(_) | StellarMessage::ErrorMsg(_)
            )
        {
            self.drop(
                format!("received {} before completed handshake", type_name),
                DropDirection::WeDroppedRemote,
                DropMode::IgnoreWriteQueue,
            );
            return;
        }

        self.metrics.mark(&names::recv(type_name));
        trace!(peer = %self.id, message = type_name, "Received message");

        match message {
            StellarMessage::ErrorMsg(error) => self.recv_error(error),
            StellarMessage::Hello(hello) => self.recv_hello(ctx, hello, now),
            StellarMessage::Auth(auth) => self.recv_auth(ctx, auth, now),
            StellarMessage::GetPeers => self.send_peers(ctx, now),
            StellarMessage::Peers(peers) => self.recv_peers(ctx, peers),
            StellarMessage::SendMore(_) => self.maybe_send_next_batch(now),
            StellarMessage::FloodAdvert(advert) => {
                let limit = ctx.ledger.max_tx_set_size_ops() as usize;
                self.adverts
                    .queue_incoming_advert(advert.tx_hashes.as_slice(), limit);
            }
            StellarMessage::FloodDemand(demand) => {
                for tx_hash in demand.tx_hashes.iter() {
                    self.fulfill_demand(ctx, tx_hash, now);
                }
            }
            StellarMessage::DontHave(dont_have) => {
                self.maybe_process_ping_response(&dont_have.req_hash, now);
                self.forward(ctx, message, now);
            }
            StellarMessage::ScpQuorumset(qset) => {
                if let Ok(hash) = xdr_sha256(qset) {
                    self.maybe_process_ping_response(&Uint256(hash), now);
                }
                self.forward(ctx, message, now);
            }
            StellarMessage::GetTxSet(hash) => {
                let kind = if ctx.ledger.ledger_version() >= FIRST_GENERALIZED_TX_SET_VERSION {
                    MessageType::GeneralizedTxSet
                } else {
                    MessageType::TxSet
                };
                if !self.forward(ctx, message, now) {
                    self.send_dont_have(ctx, kind, hash, now);
                }
            }
            StellarMessage::GetScpQuorumset(hash) => {
                if !self.forward(ctx, message, now) {
                    self.send_dont_have(ctx, MessageType::ScpQuorumset, hash, now);
                }
            }
            StellarMessage::Transaction(envelope) => {
                if self.pull_mode {
                    if let (Some(peer_id), Ok(hash)) = (self.peer_id, xdr_sha256(envelope)) {
                        ctx.demands.record_tx_received(&Hash(hash), &peer_id, now);
                    }
                }
                self.forward(ctx, message, now);
            }
            _ => {
                self.forward(ctx, message, now);
            }
        }
    }

    /// Hands a message to the application and sends its replies. Returns
    /// whether there were any.
    fn forward(&mut self, ctx: &mut PeerContext<'_>, message: &StellarMessage, now: Instant) -> bool {
        let Some(from) = self.peer_id else {
            return false;
        };
        let replies = ctx.handler.handle_message(&from, self.id, message);
        let answered = !replies.is_empty();
        for reply in replies {
            self.send_message(ctx, reply, now);
        }
        answered
    }

    fn send_dont_have(
        &mut self,
        ctx: &mut PeerContext<'_>,
        type_: MessageType,
        req_hash: &Uint256,
        now: Instant,
    ) {
        let message = StellarMessage::DontHave(DontHave {
            type_,
            req_hash: req_hash.clone(),
        });
        self.send_message(ctx, message, now);
    }

    fn fulfill_demand(&mut self, ctx: &mut PeerContext<'_>, tx_hash: &Hash, now: Instant) {
        match ctx.handler.tx_lookup(tx_hash) {
            TxLookup::Found(envelope) => {
                self.metrics.mark(names::FLOOD_FULFILLED);
                self.send_message(ctx, StellarMessage::Transaction(envelope), now);
            }
            TxLookup::Banned => self.metrics.mark(names::FLOOD_UNFULFILLED_BANNED),
            TxLookup::Unknown => self.metrics.mark(names::FLOOD_UNFULFILLED_UNKNOWN),
        }
    }

    fn recv_error(&mut self, error: &SError) {
        let code = match error.code {
            ErrorCode::Misc => "ERR_MISC",
            ErrorCode::Data => "ERR_DATA",
            ErrorCode::Conf => "ERR_CONF",
            ErrorCode::Auth => "ERR_AUTH",
            ErrorCode::Load => "ERR_LOAD",
        };
        let reason = format!("{} ({})", code, sanitize(&error.msg.to_string()));
        self.drop(reason, DropDirection::RemoteDroppedUs, DropMode::IgnoreWriteQueue);
    }

    fn send_hello(&mut self, ctx: &mut PeerContext<'_>, now: Instant) {
        let local = ctx.local;
        let hello = Hello {
            ledger_version: local.ledger_version,
            overlay_version: local.overlay_version,
            overlay_min_version: local.overlay_min_version,
            network_id: Hash(local.network_id),
            version_str: local.version_string.clone().try_into().unwrap_or_default(),
            listening_port: i32::from(local.listening_port),
            peer_id: xdr::NodeId::from(&local.public_key()),
            cert: self.auth.cert().to_xdr(),
            nonce: Uint256(*self.auth.local_nonce()),
        };
        debug!(peer = %self.id, "Sending HELLO");
        self.send_message(ctx, StellarMessage::Hello(hello), now);
    }

    fn recv_hello(&mut self, ctx: &mut PeerContext<'_>, hello: &Hello, now: Instant) {
        if self.state >= PeerState::GotHello {
            self.drop(
                "received unexpected HELLO",
                DropDirection::WeDroppedRemote,
                DropMode::IgnoreWriteQueue,
            );
            return;
        }

        let remote_key = PublicKey::try_from(&hello.peer_id.0).ok();
        let cert = AuthCert::from_xdr(&hello.cert);
        let (remote_key, cert) = match (remote_key, cert) {
            (Some(key), Some(cert)) if cert.verify(&ctx.local.network_id, &key, ctx.unix_now) => {
                (key, cert)
            }
            _ => {
                self.send_error_and_drop(
                    ErrorCode::Auth,
                    "failed to verify auth cert",
                    DropMode::IgnoreWriteQueue,
                    now,
                );
                return;
            }
        };

        if ctx.ban_manager.is_banned(&remote_key) {
            debug!(peer = %self.id, node = %remote_key.short_id(), "Refusing banned node");
            self.send_error_and_drop(ErrorCode::Auth, "node is banned", DropMode::IgnoreWriteQueue, now);
            return;
        }

        self.remote_overlay_version = hello.overlay_version;
        self.remote_overlay_min_version = hello.overlay_min_version;
        self.remote_version = hello.version_str.to_string();
        self.peer_id = Some(remote_key);
        self.auth.derive_keys(&cert.pubkey, &hello.nonce.0);
        self.state = PeerState::GotHello;
        ctx.admission.set_node_id(self.id, remote_key);
        debug!(
            peer = %self.id,
            node = %remote_key.short_id(),
            version = %self.remote_version,
            overlay_version = hello.overlay_version,
            "Received HELLO"
        );

        let Some(ip) = self.transport.remote_ip() else {
            self.send_error_and_drop(
                ErrorCode::Misc,
                "failed to determine remote address",
                DropMode::IgnoreWriteQueue,
                now,
            );
            return;
        };

        // The caller still expects an unauthenticated HELLO before any
        // ERROR it may get.
        let mode = if self.role == PeerRole::RemoteCalledUs {
            self.send_hello(ctx, now);
            DropMode::FlushWriteQueue
        } else {
            DropMode::IgnoreWriteQueue
        };

        let local = ctx.local;
        if hello.overlay_min_version > hello.overlay_version
            || hello.overlay_version < local.overlay_min_version
            || hello.overlay_min_version > local.overlay_version
            || hello.overlay_version < FIRST_VERSION_SUPPORTING_FLOW_CONTROL
        {
            debug!(
                peer = %self.id,
                remote_min = hello.overlay_min_version,
                remote = hello.overlay_version,
                local_min = local.overlay_min_version,
                local = local.overlay_version,
                "Incompatible overlay versions"
            );
            self.send_error_and_drop(ErrorCode::Conf, "wrong protocol version", mode, now);
            return;
        }

        if remote_key == local.public_key() {
            self.send_error_and_drop(ErrorCode::Conf, "connecting to self", mode, now);
            return;
        }

        if hello.network_id.0 != local.network_id {
            self.send_error_and_drop(ErrorCode::Conf, "wrong network passphrase", mode, now);
            return;
        }

        let port = match u16::try_from(hello.listening_port) {
            Ok(port) if port > 0 => port,
            _ => {
                self.send_error_and_drop(
                    ErrorCode::Conf,
                    "bad address",
                    DropMode::IgnoreWriteQueue,
                    now,
                );
                return;
            }
        };
        let address = PeerAddress::new(ip, port);
        self.address = Some(address);

        let observed = if ctx.admission.is_preferred(Some(&address), Some(&remote_key)) {
            StoredPeerType::Preferred
        } else if self.role == PeerRole::WeCalledRemote {
            StoredPeerType::Outbound
        } else {
            StoredPeerType::Inbound
        };
        ctx.peer_manager
            .update_type(&address, observed, true, ctx.unix_now as i64);

        if ctx.admission.is_node_connected(&remote_key, self.id) {
            let reason = format!("already-connected peer: {}", remote_key.short_id());
            self.send_error_and_drop(ErrorCode::Conf, &reason, mode, now);
            return;
        }

        if self.role == PeerRole::WeCalledRemote {
            self.send_auth(ctx, now);
        }
    }

    fn send_auth(&mut self, ctx: &mut PeerContext<'_>, now: Instant) {
        let flags = if ctx.config.enable_pull_mode {
            PULL_MODE_AUTH_FLAG
        } else {
            0
        };
        self.send_message(ctx, StellarMessage::Auth(xdr::Auth { flags }), now);
    }

    fn recv_auth(&mut self, ctx: &mut PeerContext<'_>, auth: &xdr::Auth, now: Instant) {
        if self.state != PeerState::GotHello {
            self.send_error_and_drop(
                ErrorCode::Misc,
                "out-of-order AUTH message",
                DropMode::IgnoreWriteQueue,
                now,
            );
            return;
        }

        let preferred = ctx
            .admission
            .is_preferred(self.address.as_ref(), self.peer_id.as_ref());
        match ctx.admission.accept_authenticated(self.id, self.role, preferred) {
            AdmissionDecision::Rejected => {
                self.metrics.mark(names::CONNECTION_REJECT);
                self.send_error_and_drop(
                    ErrorCode::Load,
                    "peer rejected",
                    DropMode::FlushWriteQueue,
                    now,
                );
                return;
            }
            AdmissionDecision::Accepted { evicted } => {
                ctx.evictions.extend(evicted);
            }
        }

        self.state = PeerState::GotAuth;
        self.authenticated_at = Some(now);
        self.codec.set_authenticated();

        if self.role == PeerRole::RemoteCalledUs {
            self.send_auth(ctx, now);
            self.send_peers(ctx, now);
        } else if let Some(address) = self.address {
            ctx.peer_manager.update_backoff(
                &address,
                BackOffUpdate::Reset,
                ctx.unix_now as i64,
                &mut *ctx.rng,
            );
        }

        let local_version = ctx.local.overlay_version;
        if local_version >= FIRST_VERSION_SUPPORTING_FLOW_CONTROL
            && self.remote_overlay_version >= FIRST_VERSION_SUPPORTING_FLOW_CONTROL
        {
            // A zero grant tells the remote we read without credit.
            let num_messages = ctx.config.peer_flood_reading_capacity;
            if num_messages == 0 {
                debug!(peer = %self.id, "No flood reading capacity, disabling flow control");
                self.flow_control.disable();
            }
            self.send_message(ctx, StellarMessage::SendMore(SendMore { num_messages }), now);
        } else {
            self.flow_control.disable();
        }

        self.pull_mode = ctx.config.enable_pull_mode
            && auth.flags == PULL_MODE_AUTH_FLAG
            && local_version >= FIRST_VERSION_SUPPORTING_PULL_MODE
            && self.remote_overlay_version >= FIRST_VERSION_SUPPORTING_PULL_MODE;

        let min_slot = u32::try_from(ctx.ledger.min_slot_to_remember()).unwrap_or(u32::MAX);
        self.send_message(ctx, StellarMessage::GetScpState(min_slot), now);

        self.metrics.mark(names::CONNECTION_ESTABLISH);
        info!(
            peer = %self.id,
            node = %self.peer_id.map(|k| k.short_id()).unwrap_or_default(),
            role = ?self.role,
            pull_mode = self.pull_mode,
            "Authenticated peer"
        );
    }

    fn send_peers(&mut self, ctx: &mut PeerContext<'_>, now: Instant) {
        let Some(exclude) = self.address else {
            return;
        };
        let peers: Vec<xdr::PeerAddress> = ctx
            .peer_manager
            .get_peers_to_send(MAX_PEERS_TO_SEND, &exclude)
            .iter()
            .map(|address| address.to_xdr(0))
            .collect();
        if peers.is_empty() {
            return;
        }
        match VecM::try_from(peers) {
            Ok(peers) => self.send_message(ctx, StellarMessage::Peers(peers), now),
            Err(e) => debug!(peer = %self.id, error = %e, "Failed to build PEERS"),
        }
    }

    fn recv_peers(&mut self, ctx: &mut PeerContext<'_>, peers: &VecM<xdr::PeerAddress, 100>) {
        let own_address = self
            .transport
            .remote_ip()
            .map(|ip| PeerAddress::new(ip, ctx.config.peer_port));

        for entry in peers.iter() {
            if entry.port == 0 || entry.port > u32::from(u16::MAX) {
                debug!(peer = %self.id, port = entry.port, "Ignoring peer with bad port");
                continue;
            }
            if matches!(entry.ip, PeerAddressIp::IPv6(_)) {
                debug!(peer = %self.id, "Ignoring IPv6 peer");
                continue;
            }
            let Some(address) = PeerAddress::from_xdr(entry) else {
                continue;
            };
            if address.is_private() {
                debug!(peer = %self.id, %address, "Ignoring private address");
                continue;
            }
            if Some(address) == own_address {
                debug!(peer = %self.id, %address, "Ignoring own address");
                continue;
            }
            if address.is_localhost() && !ctx.config.allow_localhost_for_testing {
                debug!(peer = %self.id, %address, "Ignoring localhost");
                continue;
            }
            ctx.peer_manager.ensure_exists(&address, ctx.unix_now as i64);
        }
    }

    fn maybe_process_ping_response(&mut self, hash: &Uint256, now: Instant) {
        let Some((ping_hash, sent)) = &self.ping else {
            return;
        };
        if ping_hash != hash {
            return;
        }
        let latency = now.saturating_duration_since(*sent);
        self.metrics.record(names::CONNECTION_LATENCY, latency);
        self.last_ping = Some(latency);
        self.ping = None;
        trace!(peer = %self.id, ?latency, "Ping answered");
    }

    fn ping(&mut self, ctx: &mut PeerContext<'_>, now: Instant) {
        if !self.is_authenticated() || self.ping.is_some() {
            return;
        }
        let nanos = now.saturating_duration_since(self.created_at).as_nanos();
        let hash = Uint256(sha256(&nanos.to_be_bytes()));
        self.ping = Some((hash.clone(), now));
        self.send_message(ctx, StellarMessage::GetScpQuorumset(hash), now);
    }

    /// Sends a message to the remote.
    ///
    /// Flood messages go through flow control: dropped while it is
    /// undecided, queued while it is enabled, and sent as-is once it is
    /// disabled.
    pub fn send_message(&mut self, ctx: &mut PeerContext<'_>, message: StellarMessage, now: Instant) {
        if self.is_closing() {
            return;
        }
        self.metrics.mark(&names::send(message_type_name(&message)));

        if !is_flood_message(&message) {
            self.send_authenticated(message, now);
            return;
        }

        match self.flow_control.state() {
            FlowControlState::DontKnow => {
                trace!(
                    peer = %self.id,
                    message = message_type_name(&message),
                    "Dropping flood message before flow control is known"
                );
            }
            FlowControlState::Enabled => {
                let limits = QueueLimits {
                    max_tx_set_ops: ctx.ledger.max_tx_set_size_ops(),
                    min_slot_to_remember: ctx.ledger.min_slot_to_remember(),
                };
                self.flow_control
                    .add_msg_and_maybe_trim_queue(message, now, limits);
                self.maybe_send_next_batch(now);
            }
            FlowControlState::Disabled => self.send_authenticated(message, now),
        }
    }

    fn maybe_send_next_batch(&mut self, now: Instant) {
        for message in self.flow_control.next_batch(now) {
            self.send_authenticated(message, now);
        }
    }

    fn send_authenticated(&mut self, message: StellarMessage, now: Instant) {
        let type_name = message_type_name(&message);
        let frame = self
            .auth
            .seal(message)
            .and_then(|sealed| MessageCodec::encode_message(&sealed));
        match frame {
            Ok(bytes) => {
                self.metrics.mark(names::MESSAGE_WRITE);
                self.metrics.mark_n(names::BYTE_WRITE, bytes.len() as u64);
                self.pending_writes.push_back(now);
                self.transport.send(bytes);
            }
            Err(e) => {
                debug!(peer = %self.id, message = type_name, error = %e, "Failed to encode message");
            }
        }
    }

    /// Queues a transaction hash for the next advert to this peer. False if
    /// the outgoing batch was full and the hash was dropped.
    pub fn queue_tx_hash_to_advertise(
        &mut self,
        ctx: &mut PeerContext<'_>,
        tx_hash: Hash,
        max_advert_size: usize,
        now: Instant,
    ) -> bool {
        match self
            .adverts
            .queue_outgoing_advert(tx_hash, max_advert_size, now)
        {
            OutgoingAdvert::Dropped => false,
            OutgoingAdvert::Queued => true,
            OutgoingAdvert::Ready(advert) => {
                self.send_advert(ctx, advert, now);
                true
            }
        }
    }

    /// Sends the outgoing advert batch if the advert timer has fired.
    pub fn flush_adverts_on_timer(&mut self, ctx: &mut PeerContext<'_>, now: Instant) {
        if let Some(advert) = self.adverts.maybe_flush_on_timer(now) {
            self.send_advert(ctx, advert, now);
        }
    }

    fn send_advert(&mut self, ctx: &mut PeerContext<'_>, advert: FloodAdvert, now: Instant) {
        self.send_message(ctx, StellarMessage::FloodAdvert(advert), now);
    }

    /// Sends ERROR and drops the connection.
    pub fn send_error_and_drop(&mut self, code: ErrorCode, message: &str, mode: DropMode, now: Instant) {
        if self.is_closing() {
            return;
        }
        let error = SError {
            code,
            msg: message.try_into().unwrap_or_default(),
        };
        self.metrics.mark(&names::send("ERROR"));
        self.send_authenticated(StellarMessage::ErrorMsg(error), now);
        self.drop(message, DropDirection::WeDroppedRemote, mode);
    }

    /// Ends the connection. Only the first call has any effect.
    pub fn drop(&mut self, reason: impl Into<String>, direction: DropDirection, mode: DropMode) {
        if self.is_closing() {
            return;
        }
        let reason = reason.into();
        debug!(peer = %self.id, %reason, ?direction, ?mode, "Dropping peer");

        self.state = PeerState::Closing;
        self.transport.close(mode == DropMode::FlushWriteQueue);
        self.flow_control.clear();
        self.adverts.clear();
        self.inbound.clear();
        self.ping = None;
        self.metrics.mark(names::CONNECTION_DROP);
        self.drop_reason = Some(DropReason { reason, direction });
    }

    /// Liveness checks and ping, run every 5 seconds.
    pub fn recurrent_timer(&mut self, ctx: &mut PeerContext<'_>, now: Instant) {
        if self.is_closing() || now < self.next_recurrent {
            return;
        }
        self.next_recurrent = now + RECURRENT_TIMER_PERIOD;

        let io_timeout = if self.is_authenticated() {
            ctx.config.peer_timeout
        } else {
            ctx.config.peer_authentication_timeout
        };
        if now.saturating_duration_since(self.last_read) >= io_timeout
            && now.saturating_duration_since(self.last_write) >= io_timeout
        {
            self.metrics.mark(names::TIMEOUT_IDLE);
            self.drop(
                "idle timeout",
                DropDirection::WeDroppedRemote,
                DropMode::IgnoreWriteQueue,
            );
            return;
        }

        if self
            .flow_control
            .is_send_mode_idle(now, PEER_SEND_MODE_IDLE_TIMEOUT)
        {
            self.drop(
                "idle timeout (no new flood requests)",
                DropDirection::WeDroppedRemote,
                DropMode::IgnoreWriteQueue,
            );
            return;
        }

        if now.saturating_duration_since(self.enqueue_time_of_last_write)
            >= ctx.config.peer_straggler_timeout
        {
            self.metrics.mark(names::TIMEOUT_STRAGGLER);
            self.drop(
                "straggling (cannot keep up)",
                DropDirection::WeDroppedRemote,
                DropMode::IgnoreWriteQueue,
            );
            return;
        }

        self.ping(ctx, now);
    }
}

/// Keeps ASCII alphanumerics and spaces of a remote error text.
fn sanitize(message: &str) -> String {
    message
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == ' ' {
                c
            } else {
                '*'
            }
        })
        .collect()
}
