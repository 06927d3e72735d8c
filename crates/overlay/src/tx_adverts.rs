//! Per-connection transaction advertisement queues for pull-mode flooding.
//!
//! # Overview
//!
//! - Incoming adverts are queued until the demand round pops them
//! - Hashes whose demand must wait are pushed back on a retry list, which is
//!   popped before fresh adverts
//! - Outgoing hashes are batched and flushed either when the batch reaches
//!   the maximum advert size or when the advert timer fires
//!
//! Both incoming lists together are bounded by the ledger's maximum tx-set
//! operation count; the oldest hashes are dropped first.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use stellar_xdr::curr::{FloodAdvert, Hash, TxAdvertVector};
use tracing::trace;

/// Result of adding a hash to the outgoing batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingAdvert {
    /// The batch was full; the hash was not queued.
    Dropped,
    /// Queued; the batch waits for the advert timer.
    Queued,
    /// Queued, and the batch reached its size and must be sent now.
    Ready(FloodAdvert),
}

/// Maximum number of hashes in an advert message.
pub const TX_ADVERT_VECTOR_MAX_SIZE: usize = 1000;

/// Ledger close time assumed when sizing advert and demand batches.
pub const EXPECTED_LEDGER_CLOSE_TIME: Duration = Duration::from_secs(5);

/// Number of hashes worth sending per `period`, if a full tx set's worth of
/// operations is flooded every ledger. Clamped to `1..=1000`.
pub fn max_batch_size(max_tx_set_ops: u32, period: Duration) -> usize {
    let per_ledger = max_tx_set_ops as u128 * period.as_millis();
    let close = EXPECTED_LEDGER_CLOSE_TIME.as_millis();
    let size = per_ledger.div_ceil(close) as usize;
    size.clamp(1, TX_ADVERT_VECTOR_MAX_SIZE)
}

/// Advert queues of one connection.
#[derive(Debug)]
pub struct TxAdverts {
    incoming: VecDeque<Hash>,
    retry: VecDeque<Hash>,

    outgoing: Vec<Hash>,
    /// Set when the first hash enters an empty outgoing batch.
    flush_deadline: Option<Instant>,
    advert_period: Duration,
}

impl TxAdverts {
    pub fn new(advert_period: Duration) -> Self {
        Self {
            incoming: VecDeque::new(),
            retry: VecDeque::new(),
            outgoing: Vec::new(),
            flush_deadline: None,
            advert_period,
        }
    }

    /// Hashes waiting to be demanded, retries included.
    pub fn size(&self) -> usize {
        self.incoming.len() + self.retry.len()
    }

    pub fn has_advert(&self) -> bool {
        self.size() > 0
    }

    /// Queues hashes advertised by the remote.
    ///
    /// Hashes that would be trimmed straight away are never pushed.
    pub fn queue_incoming_advert(&mut self, tx_hashes: &[Hash], limit: usize) {
        let skip = tx_hashes.len().saturating_sub(limit);
        self.incoming.extend(tx_hashes[skip..].iter().cloned());
        self.trim(limit);
    }

    /// Puts hashes back to be tried again in a later demand round.
    pub fn retry_incoming_advert(&mut self, hashes: Vec<Hash>, limit: usize) {
        self.retry.extend(hashes);
        self.trim(limit);
    }

    fn trim(&mut self, limit: usize) {
        while self.size() > limit {
            self.pop_incoming_advert();
        }
    }

    /// Next hash to consider demanding; retries come first.
    pub fn pop_incoming_advert(&mut self) -> Option<Hash> {
        self.retry.pop_front().or_else(|| self.incoming.pop_front())
    }

    /// Adds a hash to the outgoing batch.
    ///
    /// The batch is handed back once it reaches `max_advert_size`. A batch
    /// already at [`TX_ADVERT_VECTOR_MAX_SIZE`] drops the hash.
    pub fn queue_outgoing_advert(
        &mut self,
        tx_hash: Hash,
        max_advert_size: usize,
        now: Instant,
    ) -> OutgoingAdvert {
        if self.outgoing.is_empty() {
            self.flush_deadline = Some(now + self.advert_period);
        }

        if self.outgoing.len() >= TX_ADVERT_VECTOR_MAX_SIZE {
            trace!("Outgoing advert batch is full, dropping tx hash");
            return OutgoingAdvert::Dropped;
        }

        self.outgoing.push(tx_hash);
        if self.outgoing.len() >= max_advert_size {
            if let Some(advert) = self.flush() {
                return OutgoingAdvert::Ready(advert);
            }
        }
        OutgoingAdvert::Queued
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Flushes the outgoing batch if the advert timer has fired.
    pub fn maybe_flush_on_timer(&mut self, now: Instant) -> Option<FloodAdvert> {
        match self.flush_deadline {
            Some(deadline) if now >= deadline => self.flush(),
            _ => None,
        }
    }

    /// Takes the outgoing batch, if any.
    pub fn flush(&mut self) -> Option<FloodAdvert> {
        self.flush_deadline = None;
        if self.outgoing.is_empty() {
            return None;
        }
        let hashes = std::mem::take(&mut self.outgoing);
        trace!(count = hashes.len(), "Flushing outgoing adverts");
        let tx_hashes = TxAdvertVector::try_from(hashes).ok()?;
        Some(FloodAdvert { tx_hashes })
    }

    pub fn clear(&mut self) {
        self.incoming.clear();
        self.retry.clear();
        self.outgoing.clear();
        self.flush_deadline = None;
    }
}
