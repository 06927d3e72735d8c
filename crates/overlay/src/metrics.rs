//! Named meters and timers for the overlay.
//!
//! Every drop, timeout, queue trim and advert/demand event is counted under
//! a stable dotted name (see [`names`]). Other components and tests look
//! metrics up by name, so the names are part of the public contract.
//!
//! All counters use atomic operations; the registry itself is behind a
//! `parking_lot::RwLock` and hands out `Arc`s so hot paths can hold on to a
//! handle instead of looking it up repeatedly.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Stable metric names.
pub mod names {
    pub const TIMEOUT_IDLE: &str = "timeout.idle";
    pub const TIMEOUT_STRAGGLER: &str = "timeout.straggler";

    pub const CONNECTION_ATTEMPT: &str = "connection.attempt";
    pub const CONNECTION_ESTABLISH: &str = "connection.establish";
    pub const CONNECTION_DROP: &str = "connection.drop";
    pub const CONNECTION_REJECT: &str = "connection.reject";
    pub const CONNECTION_LATENCY: &str = "connection.latency";

    pub const FLOOD_ADVERTISED: &str = "flood.advertised";
    pub const FLOOD_DEMANDED: &str = "flood.demanded";
    pub const FLOOD_FULFILLED: &str = "flood.fulfilled";
    pub const FLOOD_UNFULFILLED_UNKNOWN: &str = "flood.unfulfilled-unknown";
    pub const FLOOD_UNFULFILLED_BANNED: &str = "flood.unfulfilled-banned";
    pub const FLOOD_ABANDONED_DEMANDS: &str = "flood.abandoned-demands";

    pub const QUEUE_DROP_SCP: &str = "outbound-queue-drop.scp";
    pub const QUEUE_DROP_TXS: &str = "outbound-queue-drop.txs";
    pub const QUEUE_DROP_DEMAND: &str = "outbound-queue-drop.demand";
    pub const QUEUE_DROP_ADVERT: &str = "outbound-queue-drop.advert";

    pub const QUEUE_DELAY_SCP: &str = "outbound-queue-delay.scp";
    pub const QUEUE_DELAY_TXS: &str = "outbound-queue-delay.txs";
    pub const QUEUE_DELAY_DEMAND: &str = "outbound-queue-delay.demand";
    pub const QUEUE_DELAY_ADVERT: &str = "outbound-queue-delay.advert";

    pub const PULL_LATENCY: &str = "recv-transaction.pull-latency";

    pub const MESSAGE_READ: &str = "message.read";
    pub const MESSAGE_WRITE: &str = "message.write";
    pub const BYTE_READ: &str = "byte.read";
    pub const BYTE_WRITE: &str = "byte.write";

    /// `message.send.{TYPE}` for a wire message type name.
    pub fn send(type_name: &str) -> String {
        format!("message.send.{}", type_name)
    }

    /// `message.recv.{TYPE}` for a wire message type name.
    pub fn recv(type_name: &str) -> String {
        format!("message.recv.{}", type_name)
    }
}

/// Atomic counter, the unit of every meter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Latency timer tracking count, total, min and max.
#[derive(Debug)]
pub struct Timer {
    total_us: AtomicU64,
    count: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            total_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }
}

impl Timer {
    pub fn record(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.min_us.fetch_min(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let count = self.count();
        let total = Duration::from_micros(self.total_us.load(Ordering::Relaxed));
        let min = match self.min_us.load(Ordering::Relaxed) {
            u64::MAX => Duration::ZERO,
            us => Duration::from_micros(us),
        };
        TimerSnapshot {
            count,
            total,
            avg: if count == 0 {
                Duration::ZERO
            } else {
                total / count as u32
            },
            min,
            max: Duration::from_micros(self.max_us.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time view of a [`Timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub count: u64,
    pub total: Duration,
    pub avg: Duration,
    pub min: Duration,
    pub max: Duration,
}

/// Registry of named meters and timers.
#[derive(Debug, Default)]
pub struct OverlayMetrics {
    meters: RwLock<BTreeMap<String, Arc<Counter>>>,
    timers: RwLock<BTreeMap<String, Arc<Timer>>>,
}

impl OverlayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the meter registered under `name`, creating it on first use.
    pub fn meter(&self, name: &str) -> Arc<Counter> {
        if let Some(counter) = self.meters.read().get(name) {
            return Arc::clone(counter);
        }
        Arc::clone(self.meters.write().entry(name.to_string()).or_default())
    }

    /// Returns the timer registered under `name`, creating it on first use.
    pub fn timer(&self, name: &str) -> Arc<Timer> {
        if let Some(timer) = self.timers.read().get(name) {
            return Arc::clone(timer);
        }
        Arc::clone(self.timers.write().entry(name.to_string()).or_default())
    }

    pub fn mark(&self, name: &str) {
        self.meter(name).inc();
    }

    pub fn mark_n(&self, name: &str, n: u64) {
        if n > 0 {
            self.meter(name).add(n);
        }
    }

    pub fn record(&self, name: &str, duration: Duration) {
        self.timer(name).record(duration);
    }

    /// Current value of a meter; zero if it was never marked.
    pub fn count(&self, name: &str) -> u64 {
        self.meters.read().get(name).map(|c| c.get()).unwrap_or(0)
    }

    /// Number of samples recorded by a timer; zero if it was never used.
    pub fn timer_count(&self, name: &str) -> u64 {
        self.timers.read().get(name).map(|t| t.count()).unwrap_or(0)
    }

    /// All non-zero meters, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        self.meters
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), c.get()))
            .filter(|(_, v)| *v > 0)
            .collect()
    }
}
