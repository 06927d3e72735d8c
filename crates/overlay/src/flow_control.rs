//! Credit-based flow control for a single connection.
//!
//! Each side grants the other a number of messages it is willing to read
//! (via `SEND_MORE`). The receive side tracks how much of its own grant is
//! still outstanding; the send side tracks how much credit the remote has
//! granted us and queues flood traffic until credit arrives.
//!
//! # Receive side
//!
//! Every message read while flow control is enabled consumes one unit of
//! total capacity, and flood messages additionally consume flood capacity.
//! A flood message arriving at zero flood capacity is a protocol violation.
//! After a batch of flood messages has been processed, a `SEND_MORE` for the
//! batch size is due.
//!
//! # Send side
//!
//! Outbound flood messages sit in four priority lanes:
//!
//! | Lane | Priority | Trim policy |
//! |------|----------|-------------|
//! | SCP | 0 (highest) | obsolete slots, superseded statements |
//! | Transaction | 1 | oldest beyond the limit |
//! | Flood demand | 2 | total hash count |
//! | Flood advert | 3 (lowest) | total hash count |
//!
//! Lanes are drained strictly in priority order while outbound credit lasts.
//!
//! A side with no flood capacity to offer grants `SEND_MORE(0)`. Both ends
//! then run disabled: nothing is counted and flood traffic skips the lanes.

use crate::codec::helpers::is_flood_message;
use crate::metrics::{names, OverlayMetrics};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use stellar_xdr::curr::{ScpStatement, ScpStatementPledges, StellarMessage};
use tracing::{debug, trace};

/// First overlay version that understands `SEND_MORE`.
pub const FIRST_VERSION_SUPPORTING_FLOW_CONTROL: u32 = 20;

/// Default flood reading capacity.
pub const DEFAULT_PEER_FLOOD_READING_CAPACITY: u32 = 200;

/// Default total reading capacity.
pub const DEFAULT_PEER_READING_CAPACITY: u32 = 201;

/// Default `SEND_MORE` batch size.
pub const DEFAULT_SEND_MORE_BATCH_SIZE: u32 = 40;

/// Reading capacities and batch size for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlConfig {
    pub peer_flood_reading_capacity: u32,
    pub peer_reading_capacity: u32,
    pub send_more_batch_size: u32,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            peer_flood_reading_capacity: DEFAULT_PEER_FLOOD_READING_CAPACITY,
            peer_reading_capacity: DEFAULT_PEER_READING_CAPACITY,
            send_more_batch_size: DEFAULT_SEND_MORE_BATCH_SIZE,
        }
    }
}

/// Whether flow control governs this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlState {
    /// No `SEND_MORE` received yet.
    DontKnow,
    Enabled,
    /// One of the endpoints predates flow control.
    Disabled,
}

/// Outbound lane, lower value drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessagePriority {
    Scp = 0,
    Transaction = 1,
    FloodDemand = 2,
    FloodAdvert = 3,
}

impl MessagePriority {
    pub const ALL: [MessagePriority; 4] = [
        MessagePriority::Scp,
        MessagePriority::Transaction,
        MessagePriority::FloodDemand,
        MessagePriority::FloodAdvert,
    ];

    /// Lane for a flood message; `None` for anything else.
    pub fn from_message(message: &StellarMessage) -> Option<Self> {
        match message {
            StellarMessage::ScpMessage(_) => Some(MessagePriority::Scp),
            StellarMessage::Transaction(_) => Some(MessagePriority::Transaction),
            StellarMessage::FloodDemand(_) => Some(MessagePriority::FloodDemand),
            StellarMessage::FloodAdvert(_) => Some(MessagePriority::FloodAdvert),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    fn drop_meter(self) -> &'static str {
        match self {
            MessagePriority::Scp => names::QUEUE_DROP_SCP,
            MessagePriority::Transaction => names::QUEUE_DROP_TXS,
            MessagePriority::FloodDemand => names::QUEUE_DROP_DEMAND,
            MessagePriority::FloodAdvert => names::QUEUE_DROP_ADVERT,
        }
    }

    fn delay_timer(self) -> &'static str {
        match self {
            MessagePriority::Scp => names::QUEUE_DELAY_SCP,
            MessagePriority::Transaction => names::QUEUE_DELAY_TXS,
            MessagePriority::FloodDemand => names::QUEUE_DELAY_DEMAND,
            MessagePriority::FloodAdvert => names::QUEUE_DELAY_ADVERT,
        }
    }
}

/// A message waiting for outbound credit.
#[derive(Debug, Clone)]
pub struct QueuedOutboundMessage {
    pub message: StellarMessage,
    pub time_emplaced: Instant,
}

/// Bounds applied when trimming the outbound lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Maximum queued transactions, and maximum queued hashes per
    /// advert/demand lane.
    pub max_tx_set_ops: u32,
    /// SCP statements for older slots are obsolete.
    pub min_slot_to_remember: u64,
}

/// A flow-control rule broken by the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlError {
    /// Zero-sized `SEND_MORE` after flow control was enabled.
    UnexpectedSendMore,
    /// The grant would overflow the outbound capacity counter.
    CapacityOverflow,
    /// Flood message arrived with no flood capacity left.
    FloodAtCapacity,
}

impl FlowControlError {
    /// Drop reason recorded on the connection.
    pub fn reason(self) -> &'static str {
        match self {
            FlowControlError::UnexpectedSendMore => "unexpected SEND_MORE message",
            FlowControlError::CapacityOverflow => "Peer capacity overflow",
            FlowControlError::FloodAtCapacity => "unexpected flood message, peer at capacity",
        }
    }
}

/// Per-connection flow control state.
///
/// Owned by its [`Peer`](crate::Peer); all methods take `&mut self` and the
/// caller supplies the current time.
#[derive(Debug)]
pub struct FlowControl {
    config: FlowControlConfig,
    state: FlowControlState,
    disabled: bool,

    flood_capacity: u32,
    total_capacity: u32,
    flood_processed: u32,

    outbound_capacity: u64,
    no_outbound_capacity: Option<Instant>,

    queues: [VecDeque<QueuedOutboundMessage>; 4],
    advert_hash_count: usize,
    demand_hash_count: usize,

    metrics: Arc<OverlayMetrics>,
}

impl FlowControl {
    pub fn new(config: FlowControlConfig, metrics: Arc<OverlayMetrics>, now: Instant) -> Self {
        Self {
            config,
            state: FlowControlState::DontKnow,
            disabled: false,
            flood_capacity: config.peer_flood_reading_capacity,
            total_capacity: config.peer_reading_capacity,
            flood_processed: 0,
            outbound_capacity: 0,
            no_outbound_capacity: Some(now),
            queues: Default::default(),
            advert_hash_count: 0,
            demand_hash_count: 0,
            metrics,
        }
    }

    pub fn config(&self) -> &FlowControlConfig {
        &self.config
    }

    /// Effective state. `Disabled` once either endpoint has opted out of
    /// the credit scheme.
    pub fn state(&self) -> FlowControlState {
        match self.state {
            FlowControlState::DontKnow => FlowControlState::DontKnow,
            _ if self.disabled => FlowControlState::Disabled,
            state => state,
        }
    }

    /// Opts this connection out of the credit scheme. Flood traffic is then
    /// written directly and reads are no longer counted.
    pub fn disable(&mut self) {
        self.disabled = true;
        self.state = FlowControlState::Disabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == FlowControlState::Enabled
    }

    pub fn flood_capacity(&self) -> u32 {
        self.flood_capacity
    }

    pub fn total_capacity(&self) -> u32 {
        self.total_capacity
    }

    pub fn outbound_capacity(&self) -> u64 {
        self.outbound_capacity
    }

    /// When outbound credit last ran out, if it is currently exhausted.
    pub fn no_outbound_capacity_since(&self) -> Option<Instant> {
        self.no_outbound_capacity
    }

    /// Reads may continue unless flow control is on and the total grant is
    /// used up.
    pub fn has_reading_capacity(&self) -> bool {
        !self.is_enabled() || self.total_capacity > 0
    }

    /// Accounts for a message about to be processed.
    pub fn begin_message_processing(
        &mut self,
        message: &StellarMessage,
    ) -> Result<(), FlowControlError> {
        if !self.is_enabled() {
            return Ok(());
        }

        self.total_capacity = self.total_capacity.saturating_sub(1);
        if is_flood_message(message) {
            if self.flood_capacity == 0 {
                return Err(FlowControlError::FloodAtCapacity);
            }
            self.flood_capacity -= 1;
            if self.flood_capacity == 0 {
                debug!("No flood capacity left");
            }
        }
        Ok(())
    }

    /// Returns capacity consumed by [`begin_message_processing`] and, once a
    /// full batch of flood messages has been processed, the size of the
    /// `SEND_MORE` to grant.
    ///
    /// [`begin_message_processing`]: FlowControl::begin_message_processing
    pub fn end_message_processing(&mut self, message: &StellarMessage) -> Option<u32> {
        if !self.is_enabled() {
            return None;
        }

        self.total_capacity = self.total_capacity.saturating_add(1);
        if !is_flood_message(message) {
            return None;
        }

        self.flood_capacity = self.flood_capacity.saturating_add(1);
        self.flood_processed += 1;
        if self.flood_processed == self.config.send_more_batch_size {
            self.flood_processed = 0;
            return Some(self.config.send_more_batch_size);
        }
        None
    }

    /// Applies a `SEND_MORE` from the remote.
    ///
    /// A first grant of zero means the remote reads without credit, which
    /// disables flow control for the connection. Zero after enabling is a
    /// violation.
    pub fn receive_send_more(&mut self, num_messages: u32) -> Result<(), FlowControlError> {
        if self.disabled {
            trace!(num_messages, "Ignoring SEND_MORE, flow control disabled");
            return Ok(());
        }
        if num_messages == 0 {
            if self.state == FlowControlState::Enabled {
                return Err(FlowControlError::UnexpectedSendMore);
            }
            debug!("Remote granted no flood capacity, disabling flow control");
            self.disable();
            return Ok(());
        }

        self.state = FlowControlState::Enabled;

        self.outbound_capacity = self
            .outbound_capacity
            .checked_add(num_messages as u64)
            .ok_or(FlowControlError::CapacityOverflow)?;
        if self.no_outbound_capacity.take().is_some() {
            debug!(granted = num_messages, "Got outbound capacity");
        }
        Ok(())
    }

    /// True once outbound credit has been exhausted for at least `timeout`.
    pub fn is_send_mode_idle(&self, now: Instant, timeout: std::time::Duration) -> bool {
        self.is_enabled()
            && self
                .no_outbound_capacity
                .is_some_and(|since| now.saturating_duration_since(since) >= timeout)
    }

    /// Queues a flood message and trims its lane.
    ///
    /// Non-flood messages are ignored; they never wait for credit.
    pub fn add_msg_and_maybe_trim_queue(
        &mut self,
        message: StellarMessage,
        now: Instant,
        limits: QueueLimits,
    ) {
        let Some(priority) = MessagePriority::from_message(&message) else {
            return;
        };
        match &message {
            StellarMessage::FloodDemand(demand) => self.demand_hash_count += demand.tx_hashes.len(),
            StellarMessage::FloodAdvert(advert) => self.advert_hash_count += advert.tx_hashes.len(),
            _ => {}
        }

        self.queues[priority.index()].push_back(QueuedOutboundMessage {
            message,
            time_emplaced: now,
        });

        let dropped = self.trim(priority, limits);
        if dropped > 0 {
            self.metrics.mark_n(priority.drop_meter(), dropped as u64);
            trace!(?priority, dropped, "Trimmed outbound queue");
        }
    }

    fn trim(&mut self, priority: MessagePriority, limits: QueueLimits) -> usize {
        let limit = limits.max_tx_set_ops as usize;
        let queue = &mut self.queues[priority.index()];
        match priority {
            MessagePriority::Transaction => {
                let excess = queue.len().saturating_sub(limit);
                queue.drain(..excess);
                excess
            }
            MessagePriority::Scp => {
                let mut dropped = trim_scp_queue(queue, limits.min_slot_to_remember);
                let excess = queue.len().saturating_sub(limit);
                queue.drain(..excess);
                dropped += excess;
                dropped
            }
            MessagePriority::FloodDemand => {
                trim_by_hash_count(queue, &mut self.demand_hash_count, limit)
            }
            MessagePriority::FloodAdvert => {
                trim_by_hash_count(queue, &mut self.advert_hash_count, limit)
            }
        }
    }

    /// Pops messages for which outbound credit is available, highest
    /// priority first. Only meaningful while flow control is enabled.
    pub fn next_batch(&mut self, now: Instant) -> Vec<StellarMessage> {
        let mut batch = Vec::new();
        if !self.is_enabled() {
            return batch;
        }

        for priority in MessagePriority::ALL {
            while self.outbound_capacity > 0 {
                let Some(front) = self.queues[priority.index()].pop_front() else {
                    break;
                };
                self.outbound_capacity -= 1;
                self.metrics.record(
                    priority.delay_timer(),
                    now.saturating_duration_since(front.time_emplaced),
                );
                match &front.message {
                    StellarMessage::FloodDemand(demand) => {
                        self.demand_hash_count -= demand.tx_hashes.len()
                    }
                    StellarMessage::FloodAdvert(advert) => {
                        self.advert_hash_count -= advert.tx_hashes.len()
                    }
                    _ => {}
                }
                if self.outbound_capacity == 0 {
                    debug!("No outbound capacity left");
                    self.no_outbound_capacity = Some(now);
                }
                batch.push(front.message);
            }
        }

        if !batch.is_empty() {
            trace!(count = batch.len(), "Sending next flood batch");
        }
        batch
    }

    pub fn queue_len(&self, priority: MessagePriority) -> usize {
        self.queues[priority.index()].len()
    }

    pub fn queued_advert_hashes(&self) -> usize {
        self.advert_hash_count
    }

    pub fn queued_demand_hashes(&self) -> usize {
        self.demand_hash_count
    }

    /// Discards every queued message.
    pub fn clear(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
        self.advert_hash_count = 0;
        self.demand_hash_count = 0;
    }
}

fn trim_by_hash_count(
    queue: &mut VecDeque<QueuedOutboundMessage>,
    hash_count: &mut usize,
    limit: usize,
) -> usize {
    let mut dropped = 0;
    while *hash_count > limit {
        let Some(front) = queue.pop_front() else {
            break;
        };
        let hashes = match &front.message {
            StellarMessage::FloodDemand(demand) => demand.tx_hashes.len(),
            StellarMessage::FloodAdvert(advert) => advert.tx_hashes.len(),
            _ => 0,
        };
        *hash_count -= hashes;
        dropped += 1;
    }
    dropped
}

/// Removes statements for forgotten slots and lets the newest statement
/// take the place of at most one entry it supersedes.
fn trim_scp_queue(queue: &mut VecDeque<QueuedOutboundMessage>, min_slot_to_remember: u64) -> usize {
    let before = queue.len();
    queue.retain(|entry| scp_statement(&entry.message).map_or(true, |st| st.slot_index >= min_slot_to_remember));
    let mut dropped = before - queue.len();

    let Some(newest) = queue.back().and_then(|entry| scp_statement(&entry.message)) else {
        return dropped;
    };
    let last = queue.len() - 1;
    let superseded = queue
        .iter()
        .take(last)
        .position(|entry| scp_statement(&entry.message).is_some_and(|st| is_superseded_by(st, newest)));

    if let Some(index) = superseded {
        queue.swap_remove_back(index);
        dropped += 1;
    }
    dropped
}

fn scp_statement(message: &StellarMessage) -> Option<&ScpStatement> {
    match message {
        StellarMessage::ScpMessage(envelope) => Some(&envelope.statement),
        _ => None,
    }
}

fn statement_rank(statement: &ScpStatement) -> u8 {
    match statement.pledges {
        ScpStatementPledges::Nominate(_) => 0,
        ScpStatementPledges::Prepare(_) => 1,
        ScpStatementPledges::Confirm(_) => 2,
        ScpStatementPledges::Externalize(_) => 3,
    }
}

/// Same node, same slot, strictly later phase.
fn is_superseded_by(old: &ScpStatement, new: &ScpStatement) -> bool {
    old.node_id == new.node_id
        && old.slot_index == new.slot_index
        && statement_rank(new) > statement_rank(old)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellar_xdr::curr::{
        FloodAdvert, FloodDemand, Hash, NodeId, PublicKey, ScpBallot, ScpEnvelope, ScpNomination,
        ScpStatementExternalize, SendMore, Signature, TransactionEnvelope, TransactionV0,
        TransactionV0Envelope, TransactionV0Ext, Uint256, Value, VecM,
    };
    use std::time::Duration;

    const LIMITS: QueueLimits = QueueLimits {
        max_tx_set_ops: 3,
        min_slot_to_remember: 10,
    };

    fn make_tx_message(seq: i64) -> StellarMessage {
        StellarMessage::Transaction(TransactionEnvelope::TxV0(TransactionV0Envelope {
            tx: TransactionV0 {
                source_account_ed25519: Uint256([0u8; 32]),
                fee: 100,
                seq_num: stellar_xdr::curr::SequenceNumber(seq),
                time_bounds: None,
                memo: stellar_xdr::curr::Memo::None,
                operations: vec![].try_into().unwrap(),
                ext: TransactionV0Ext::V0,
            },
            signatures: vec![].try_into().unwrap(),
        }))
    }

    fn node(byte: u8) -> NodeId {
        NodeId(PublicKey::PublicKeyTypeEd25519(Uint256([byte; 32])))
    }

    fn make_scp_message(node_byte: u8, slot: u64, pledges: ScpStatementPledges) -> StellarMessage {
        StellarMessage::ScpMessage(ScpEnvelope {
            statement: ScpStatement {
                node_id: node(node_byte),
                slot_index: slot,
                pledges,
            },
            signature: Signature::default(),
        })
    }

    fn nominate() -> ScpStatementPledges {
        ScpStatementPledges::Nominate(ScpNomination {
            quorum_set_hash: Hash([0u8; 32]),
            votes: VecM::default(),
            accepted: VecM::default(),
        })
    }

    fn externalize() -> ScpStatementPledges {
        ScpStatementPledges::Externalize(ScpStatementExternalize {
            commit: ScpBallot {
                counter: 1,
                value: Value::default(),
            },
            n_h: 1,
            commit_quorum_set_hash: Hash([0u8; 32]),
        })
    }

    fn hashes(n: usize) -> Vec<Hash> {
        (0..n).map(|i| Hash([i as u8; 32])).collect()
    }

    fn advert(n: usize) -> StellarMessage {
        StellarMessage::FloodAdvert(FloodAdvert {
            tx_hashes: hashes(n).try_into().unwrap(),
        })
    }

    fn demand(n: usize) -> StellarMessage {
        StellarMessage::FloodDemand(FloodDemand {
            tx_hashes: hashes(n).try_into().unwrap(),
        })
    }

    fn flow_control(config: FlowControlConfig) -> (FlowControl, Arc<OverlayMetrics>, Instant) {
        let metrics = Arc::new(OverlayMetrics::new());
        let now = Instant::now();
        (FlowControl::new(config, Arc::clone(&metrics), now), metrics, now)
    }

    #[test]
    fn test_initial_state() {
        let (fc, _, _) = flow_control(FlowControlConfig::default());
        assert_eq!(fc.state(), FlowControlState::DontKnow);
        assert_eq!(fc.flood_capacity(), 200);
        assert_eq!(fc.total_capacity(), 201);
        assert_eq!(fc.outbound_capacity(), 0);
        assert!(fc.has_reading_capacity());
    }

    #[test]
    fn test_send_more_enables() {
        let (mut fc, _, _) = flow_control(FlowControlConfig::default());
        fc.receive_send_more(200).unwrap();
        assert_eq!(fc.state(), FlowControlState::Enabled);
        assert_eq!(fc.outbound_capacity(), 200);
        assert!(fc.no_outbound_capacity_since().is_none());
        assert_eq!(
            fc.receive_send_more(0),
            Err(FlowControlError::UnexpectedSendMore)
        );
    }

    #[test]
    fn test_send_more_overflow() {
        let (mut fc, _, _) = flow_control(FlowControlConfig::default());
        fc.receive_send_more(1).unwrap();
        fc.outbound_capacity = u64::MAX - 1;
        assert_eq!(
            fc.receive_send_more(2),
            Err(FlowControlError::CapacityOverflow)
        );
        assert_eq!(fc.outbound_capacity(), u64::MAX - 1);
    }

    #[test]
    fn test_zero_first_grant_disables() {
        let (mut fc, _, now) = flow_control(FlowControlConfig::default());
        fc.receive_send_more(0).unwrap();
        assert_eq!(fc.state(), FlowControlState::Disabled);
        assert!(!fc.is_send_mode_idle(now + Duration::from_secs(600), Duration::from_secs(60)));

        // Later grants change nothing.
        fc.receive_send_more(50).unwrap();
        fc.receive_send_more(0).unwrap();
        assert_eq!(fc.state(), FlowControlState::Disabled);
        assert_eq!(fc.outbound_capacity(), 0);
    }

    #[test]
    fn test_disabled_ignores_accounting() {
        let (mut fc, _, _) = flow_control(FlowControlConfig::default());
        fc.disable();
        fc.receive_send_more(10).unwrap();
        assert_eq!(fc.state(), FlowControlState::Disabled);
        fc.begin_message_processing(&make_tx_message(1)).unwrap();
        assert_eq!(fc.flood_capacity(), 200);
        assert_eq!(fc.end_message_processing(&make_tx_message(1)), None);
    }

    #[test]
    fn test_receive_capacity_and_send_more_batch() {
        let config = FlowControlConfig {
            peer_flood_reading_capacity: 2,
            peer_reading_capacity: 3,
            send_more_batch_size: 2,
        };
        let (mut fc, _, _) = flow_control(config);
        fc.receive_send_more(5).unwrap();

        let tx = make_tx_message(1);
        fc.begin_message_processing(&tx).unwrap();
        fc.begin_message_processing(&tx).unwrap();
        assert_eq!(fc.flood_capacity(), 0);
        assert_eq!(fc.total_capacity(), 1);
        assert_eq!(
            fc.begin_message_processing(&tx),
            Err(FlowControlError::FloodAtCapacity)
        );

        assert_eq!(fc.end_message_processing(&tx), None);
        assert_eq!(fc.end_message_processing(&tx), Some(2));
        assert_eq!(fc.flood_capacity(), 2);
    }

    #[test]
    fn test_reading_capacity_throttles() {
        let config = FlowControlConfig {
            peer_flood_reading_capacity: 1,
            peer_reading_capacity: 1,
            send_more_batch_size: 1,
        };
        let (mut fc, _, _) = flow_control(config);
        fc.receive_send_more(1).unwrap();

        let ctrl = StellarMessage::SendMore(SendMore { num_messages: 1 });
        fc.begin_message_processing(&ctrl).unwrap();
        assert!(!fc.has_reading_capacity());
        assert_eq!(fc.end_message_processing(&ctrl), None);
        assert!(fc.has_reading_capacity());
    }

    #[test]
    fn test_priority_order() {
        let (mut fc, metrics, now) = flow_control(FlowControlConfig::default());
        fc.receive_send_more(3).unwrap();
        let limits = QueueLimits {
            max_tx_set_ops: 100,
            min_slot_to_remember: 0,
        };

        fc.add_msg_and_maybe_trim_queue(advert(1), now, limits);
        fc.add_msg_and_maybe_trim_queue(make_tx_message(1), now, limits);
        fc.add_msg_and_maybe_trim_queue(demand(1), now, limits);
        fc.add_msg_and_maybe_trim_queue(make_scp_message(1, 20, nominate()), now, limits);

        let batch = fc.next_batch(now + Duration::from_millis(3));
        assert_eq!(batch.len(), 3);
        assert!(matches!(batch[0], StellarMessage::ScpMessage(_)));
        assert!(matches!(batch[1], StellarMessage::Transaction(_)));
        assert!(matches!(batch[2], StellarMessage::FloodDemand(_)));
        assert_eq!(fc.queue_len(MessagePriority::FloodAdvert), 1);
        assert_eq!(fc.outbound_capacity(), 0);
        assert_eq!(fc.no_outbound_capacity_since(), Some(now + Duration::from_millis(3)));
        assert_eq!(metrics.timer_count(names::QUEUE_DELAY_SCP), 1);
        assert_eq!(fc.queued_demand_hashes(), 0);
        assert_eq!(fc.queued_advert_hashes(), 1);
    }

    #[test]
    fn test_dont_know_sends_nothing() {
        let (mut fc, _, now) = flow_control(FlowControlConfig::default());
        fc.add_msg_and_maybe_trim_queue(make_tx_message(1), now, LIMITS);
        assert!(fc.next_batch(now).is_empty());
    }

    #[test]
    fn test_tx_queue_trims_oldest() {
        let (mut fc, metrics, now) = flow_control(FlowControlConfig::default());
        for seq in 0..5 {
            fc.add_msg_and_maybe_trim_queue(make_tx_message(seq), now, LIMITS);
        }
        assert_eq!(fc.queue_len(MessagePriority::Transaction), 3);
        assert_eq!(metrics.count(names::QUEUE_DROP_TXS), 2);

        fc.receive_send_more(1).unwrap();
        match &fc.next_batch(now)[0] {
            StellarMessage::Transaction(TransactionEnvelope::TxV0(env)) => {
                assert_eq!(env.tx.seq_num.0, 2)
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_scp_queue_drops_old_slots() {
        let (mut fc, metrics, now) = flow_control(FlowControlConfig::default());
        let limits = QueueLimits {
            max_tx_set_ops: 100,
            min_slot_to_remember: 0,
        };
        fc.add_msg_and_maybe_trim_queue(make_scp_message(1, 5, nominate()), now, limits);
        fc.add_msg_and_maybe_trim_queue(make_scp_message(2, 8, nominate()), now, limits);
        assert_eq!(fc.queue_len(MessagePriority::Scp), 2);

        fc.add_msg_and_maybe_trim_queue(make_scp_message(3, 12, nominate()), now, LIMITS);
        assert_eq!(fc.queue_len(MessagePriority::Scp), 1);
        assert_eq!(metrics.count(names::QUEUE_DROP_SCP), 2);
    }

    #[test]
    fn test_scp_newer_statement_replaces_superseded() {
        let (mut fc, metrics, now) = flow_control(FlowControlConfig::default());
        let limits = QueueLimits {
            max_tx_set_ops: 100,
            min_slot_to_remember: 0,
        };
        fc.add_msg_and_maybe_trim_queue(make_scp_message(1, 20, nominate()), now, limits);
        fc.add_msg_and_maybe_trim_queue(make_scp_message(2, 20, nominate()), now, limits);
        fc.add_msg_and_maybe_trim_queue(make_scp_message(1, 20, externalize()), now, limits);

        assert_eq!(fc.queue_len(MessagePriority::Scp), 2);
        assert_eq!(metrics.count(names::QUEUE_DROP_SCP), 1);

        fc.receive_send_more(2).unwrap();
        let batch = fc.next_batch(now);
        let first = scp_statement(&batch[0]).unwrap();
        assert_eq!(first.node_id, node(1));
        assert_eq!(statement_rank(first), 3);
        assert_eq!(scp_statement(&batch[1]).unwrap().node_id, node(2));
    }

    #[test]
    fn test_scp_equal_rank_not_replaced() {
        let (mut fc, _, now) = flow_control(FlowControlConfig::default());
        let limits = QueueLimits {
            max_tx_set_ops: 100,
            min_slot_to_remember: 0,
        };
        fc.add_msg_and_maybe_trim_queue(make_scp_message(1, 20, nominate()), now, limits);
        fc.add_msg_and_maybe_trim_queue(make_scp_message(1, 20, nominate()), now, limits);
        fc.add_msg_and_maybe_trim_queue(make_scp_message(1, 21, externalize()), now, limits);
        assert_eq!(fc.queue_len(MessagePriority::Scp), 3);
    }

    #[test]
    fn test_advert_queue_trims_by_hash_count() {
        let (mut fc, metrics, now) = flow_control(FlowControlConfig::default());
        let limits = QueueLimits {
            max_tx_set_ops: 4,
            min_slot_to_remember: 0,
        };
        fc.add_msg_and_maybe_trim_queue(advert(2), now, limits);
        fc.add_msg_and_maybe_trim_queue(advert(2), now, limits);
        assert_eq!(fc.queued_advert_hashes(), 4);
        fc.add_msg_and_maybe_trim_queue(advert(3), now, limits);
        assert_eq!(fc.queue_len(MessagePriority::FloodAdvert), 1);
        assert_eq!(fc.queued_advert_hashes(), 3);
        assert_eq!(metrics.count(names::QUEUE_DROP_ADVERT), 2);

        fc.add_msg_and_maybe_trim_queue(demand(5), now, limits);
        assert_eq!(fc.queue_len(MessagePriority::FloodDemand), 0);
        assert_eq!(fc.queued_demand_hashes(), 0);
        assert_eq!(metrics.count(names::QUEUE_DROP_DEMAND), 1);
    }

    #[test]
    fn test_send_mode_idle() {
        let (mut fc, _, now) = flow_control(FlowControlConfig::default());
        let timeout = Duration::from_secs(60);
        assert!(!fc.is_send_mode_idle(now + timeout, timeout));

        fc.receive_send_more(1).unwrap();
        fc.add_msg_and_maybe_trim_queue(make_tx_message(1), now, LIMITS);
        assert_eq!(fc.next_batch(now).len(), 1);
        assert!(!fc.is_send_mode_idle(now + Duration::from_secs(59), timeout));
        assert!(fc.is_send_mode_idle(now + timeout, timeout));

        fc.receive_send_more(1).unwrap();
        assert!(!fc.is_send_mode_idle(now + timeout, timeout));
    }

    #[test]
    fn test_clear() {
        let (mut fc, _, now) = flow_control(FlowControlConfig::default());
        fc.add_msg_and_maybe_trim_queue(advert(2), now, LIMITS);
        fc.add_msg_and_maybe_trim_queue(make_tx_message(1), now, LIMITS);
        fc.clear();
        assert_eq!(fc.queue_len(MessagePriority::Transaction), 0);
        assert_eq!(fc.queued_advert_hashes(), 0);
    }
}
