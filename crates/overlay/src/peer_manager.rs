//! Address book of known peers with failure tracking and backoff scheduling.
//!
//! # Overview
//!
//! - Peers are keyed by [`PeerAddress`] (IPv4 + port)
//! - Failure counts track how reliable a peer is
//! - Next attempt time implements randomized exponential backoff
//! - Peer types: INBOUND, OUTBOUND, PREFERRED
//!
//! Records are read and written through a [`PeerStore`]. Storage failures
//! never reach the caller: they are logged and the connection proceeds with
//! a default record.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE peers (
//!     ip VARCHAR(15) NOT NULL,
//!     port INT NOT NULL CHECK (port > 0 AND port <= 65535),
//!     nextattempt INTEGER NOT NULL,
//!     numfailures INT DEFAULT 0 CHECK (numfailures >= 0) NOT NULL,
//!     type INT NOT NULL,
//!     PRIMARY KEY (ip, port)
//! );
//! ```

use crate::{PeerAddress, Result};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, info, trace, warn};

/// Records with at least this many failures are purged when the overlay starts.
pub const REALLY_DEAD_NUM_FAILURES_CUTOFF: u32 = 120;

/// Maximum number of addresses sent in one PEERS message.
pub const MAX_PEERS_TO_SEND: usize = 50;

/// Seconds per backoff unit.
const SECONDS_PER_BACKOFF: i64 = 10;

/// Maximum backoff exponent.
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Peer type stored in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StoredPeerType {
    /// Peer connected to us.
    Inbound = 0,
    /// Peer we connected to.
    Outbound = 1,
    /// Preferred peer (always try to connect).
    Preferred = 2,
}

impl StoredPeerType {
    fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Outbound,
            2 => Self::Preferred,
            _ => Self::Inbound,
        }
    }
}

/// Filter for querying peers.
#[derive(Debug, Clone, Copy)]
pub enum PeerTypeFilter {
    InboundOnly,
    OutboundOnly,
    PreferredOnly,
    /// Outbound or preferred.
    AnyOutbound,
}

impl PeerTypeFilter {
    fn matches(self, peer_type: StoredPeerType) -> bool {
        match self {
            PeerTypeFilter::InboundOnly => peer_type == StoredPeerType::Inbound,
            PeerTypeFilter::OutboundOnly => peer_type == StoredPeerType::Outbound,
            PeerTypeFilter::PreferredOnly => peer_type == StoredPeerType::Preferred,
            PeerTypeFilter::AnyOutbound => peer_type != StoredPeerType::Inbound,
        }
    }
}

/// What the directory knows about one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRecord {
    /// Earliest time (unix seconds) to try connecting again.
    pub next_attempt: i64,
    pub num_failures: u32,
    pub peer_type: StoredPeerType,
}

impl PeerRecord {
    /// Fresh inbound record, ready to be tried at `now_unix`.
    pub fn new(now_unix: i64) -> Self {
        Self {
            next_attempt: now_unix,
            num_failures: 0,
            peer_type: StoredPeerType::Inbound,
        }
    }

    pub fn is_ready(&self, now_unix: i64) -> bool {
        self.next_attempt <= now_unix
    }
}

/// Type of update to apply to a peer's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeUpdate {
    /// Promote an inbound record to outbound.
    EnsureOutbound,
    SetPreferred,
    /// Downgrade a preferred record to outbound.
    EnsureNotPreferred,
}

/// Type of update to apply to a peer's backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackOffUpdate {
    /// Clear failures and allow an immediate retry.
    HardReset,
    /// Clear failures, next attempt after the minimum backoff.
    Reset,
    /// One more failure, next attempt after an exponentially growing delay.
    Increase,
}

/// Query for [`PeerManager::load_random_peers`].
#[derive(Debug, Clone, Copy)]
pub struct PeerQuery {
    /// Skip peers whose next attempt is in the future.
    pub use_next_attempt: bool,
    pub max_num_failures: Option<u32>,
    pub type_filter: PeerTypeFilter,
}

/// Key-value storage behind the address book.
pub trait PeerStore: Send + Sync {
    /// The stored record, or `None` if the address is unknown.
    fn load(&self, address: &PeerAddress) -> Result<Option<PeerRecord>>;

    /// Writes a record; `in_database` tells whether it already exists.
    fn store(&self, address: &PeerAddress, record: &PeerRecord, in_database: bool) -> Result<()>;

    /// Removes records with at least `min_num_failures` failures, limited to
    /// `address` when given. Returns the number of removed records.
    /// Deletes matching records and returns their addresses, oldest
    /// `next_attempt` first.
    fn remove_peers_with_many_failures(
        &self,
        min_num_failures: u32,
        address: Option<&PeerAddress>,
    ) -> Result<Vec<PeerAddress>>;

    fn load_all(&self) -> Result<Vec<(PeerAddress, PeerRecord)>>;
}

/// Records kept in a map; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryPeerStore {
    peers: Mutex<BTreeMap<PeerAddress, PeerRecord>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerStore for MemoryPeerStore {
    fn load(&self, address: &PeerAddress) -> Result<Option<PeerRecord>> {
        Ok(self.peers.lock().get(address).copied())
    }

    fn store(&self, address: &PeerAddress, record: &PeerRecord, _in_database: bool) -> Result<()> {
        self.peers.lock().insert(*address, *record);
        Ok(())
    }

    fn remove_peers_with_many_failures(
        &self,
        min_num_failures: u32,
        address: Option<&PeerAddress>,
    ) -> Result<Vec<PeerAddress>> {
        let mut peers = self.peers.lock();
        let mut doomed: Vec<(i64, PeerAddress)> = peers
            .iter()
            .filter(|(addr, r)| {
                r.num_failures >= min_num_failures && address.map_or(true, |a| a == *addr)
            })
            .map(|(addr, r)| (r.next_attempt, *addr))
            .collect();
        doomed.sort();
        for (_, addr) in &doomed {
            peers.remove(addr);
        }
        Ok(doomed.into_iter().map(|(_, addr)| addr).collect())
    }

    fn load_all(&self) -> Result<Vec<(PeerAddress, PeerRecord)>> {
        Ok(self.peers.lock().iter().map(|(a, r)| (*a, *r)).collect())
    }
}

/// Records in the SQLite `peers` table.
pub struct SqlitePeerStore {
    conn: Mutex<Connection>,
}

impl SqlitePeerStore {
    /// Opens (or creates) the peers table in the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS peers (
                ip VARCHAR(15) NOT NULL,
                port INT NOT NULL CHECK (port > 0 AND port <= 65535),
                nextattempt INTEGER NOT NULL,
                numfailures INT DEFAULT 0 CHECK (numfailures >= 0) NOT NULL,
                type INT NOT NULL,
                PRIMARY KEY (ip, port)
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn record_from_row(next_attempt: i64, num_failures: i64, peer_type: i32) -> PeerRecord {
    PeerRecord {
        next_attempt,
        num_failures: num_failures.clamp(0, u32::MAX as i64) as u32,
        peer_type: StoredPeerType::from_i32(peer_type),
    }
}

impl PeerStore for SqlitePeerStore {
    fn load(&self, address: &PeerAddress) -> Result<Option<PeerRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT nextattempt, numfailures, type FROM peers WHERE ip = ?1 AND port = ?2",
                params![address.ip.to_string(), address.port],
                |row| Ok(record_from_row(row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(record)
    }

    fn store(&self, address: &PeerAddress, record: &PeerRecord, in_database: bool) -> Result<()> {
        let conn = self.conn.lock();
        let sql = if in_database {
            "UPDATE peers SET nextattempt = ?3, numfailures = ?4, type = ?5
             WHERE ip = ?1 AND port = ?2"
        } else {
            "INSERT INTO peers (ip, port, nextattempt, numfailures, type)
             VALUES (?1, ?2, ?3, ?4, ?5)"
        };
        let changed = conn.execute(
            sql,
            params![
                address.ip.to_string(),
                address.port,
                record.next_attempt,
                record.num_failures,
                record.peer_type as i32
            ],
        )?;
        if changed != 1 {
            return Err(rusqlite::Error::StatementChangedRows(changed).into());
        }
        Ok(())
    }

    fn remove_peers_with_many_failures(
        &self,
        min_num_failures: u32,
        address: Option<&PeerAddress>,
    ) -> Result<Vec<PeerAddress>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let doomed = {
            let mut stmt = tx.prepare(
                "SELECT ip, port FROM peers WHERE numfailures >= ?1
                 ORDER BY nextattempt ASC, ip ASC, port ASC",
            )?;
            let rows = stmt.query_map(params![min_num_failures], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u16>(1)?))
            })?;
            let mut doomed = Vec::new();
            for row in rows {
                let (ip, port) = row?;
                let Ok(ip) = ip.parse::<Ipv4Addr>() else {
                    continue;
                };
                let candidate = PeerAddress::new(ip, port);
                if address.map_or(true, |a| *a == candidate) {
                    doomed.push(candidate);
                }
            }
            doomed
        };
        for candidate in &doomed {
            tx.execute(
                "DELETE FROM peers WHERE ip = ?1 AND port = ?2",
                params![candidate.ip.to_string(), candidate.port],
            )?;
        }
        tx.commit()?;
        Ok(doomed)
    }

    fn load_all(&self) -> Result<Vec<(PeerAddress, PeerRecord)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT ip, port, nextattempt, numfailures, type FROM peers")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u16>(1)?,
                record_from_row(row.get(2)?, row.get(3)?, row.get(4)?),
            ))
        })?;

        let mut peers = Vec::new();
        for row in rows {
            let (ip, port, record) = row?;
            match ip.parse::<Ipv4Addr>() {
                Ok(ip) => peers.push((PeerAddress::new(ip, port), record)),
                Err(_) => warn!(ip = %ip, "Ignoring malformed address in peers table"),
            }
        }
        Ok(peers)
    }
}

/// Directory of known peers.
///
/// All mutation goes through this synchronous API; the store serializes
/// its own access.
pub struct PeerManager {
    store: Box<dyn PeerStore>,
}

impl PeerManager {
    pub fn new(store: Box<dyn PeerStore>) -> Self {
        Self { store }
    }

    pub fn new_in_memory() -> Self {
        Self::new(Box::new(MemoryPeerStore::new()))
    }

    /// Directory backed by the SQLite database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let store = SqlitePeerStore::open(path)?;
        info!(path = %path.display(), "Opened peer database");
        Ok(Self::new(Box::new(store)))
    }

    /// Loads the record for `address`, and whether it was stored.
    ///
    /// Unknown addresses and storage failures yield a fresh inbound record.
    pub fn load(&self, address: &PeerAddress, now_unix: i64) -> (PeerRecord, bool) {
        match self.store.load(address) {
            Ok(Some(record)) => (record, true),
            Ok(None) => (PeerRecord::new(now_unix), false),
            Err(e) => {
                warn!(peer = %address, error = %e, "Failed to load peer record");
                (PeerRecord::new(now_unix), false)
            }
        }
    }

    /// Writes a record, logging storage failures.
    pub fn store(&self, address: &PeerAddress, record: &PeerRecord, in_database: bool) {
        trace!(
            peer = %address,
            failures = record.num_failures,
            peer_type = ?record.peer_type,
            "Storing peer record"
        );
        if let Err(e) = self.store.store(address, record, in_database) {
            warn!(peer = %address, error = %e, "Failed to store peer record");
        }
    }

    /// Adds `address` with a fresh record if it is not known yet.
    pub fn ensure_exists(&self, address: &PeerAddress, now_unix: i64) {
        let (record, in_database) = self.load(address, now_unix);
        if !in_database {
            debug!(peer = %address, "Learned new peer address");
            self.store(address, &record, false);
        }
    }

    /// Updates the type of a record from the direction of a connection.
    ///
    /// `preferred_type_known` means the caller knows whether the peer is
    /// preferred, so an outbound observation may downgrade a preferred record.
    pub fn update_type(
        &self,
        address: &PeerAddress,
        observed_type: StoredPeerType,
        preferred_type_known: bool,
        now_unix: i64,
    ) {
        let (mut record, in_database) = self.load(address, now_unix);
        let update = get_type_update(&record, observed_type, preferred_type_known);
        apply_type_update(&mut record, update);
        self.store(address, &record, in_database);
    }

    /// Updates failure count and next attempt time.
    pub fn update_backoff<R: Rng + ?Sized>(
        &self,
        address: &PeerAddress,
        backoff: BackOffUpdate,
        now_unix: i64,
        rng: &mut R,
    ) -> PeerRecord {
        let (mut record, in_database) = self.load(address, now_unix);
        apply_backoff_update(&mut record, backoff, now_unix, rng);
        self.store(address, &record, in_database);
        record
    }

    /// Updates type and backoff in a single write.
    pub fn update<R: Rng + ?Sized>(
        &self,
        address: &PeerAddress,
        observed_type: StoredPeerType,
        preferred_type_known: bool,
        backoff: BackOffUpdate,
        now_unix: i64,
        rng: &mut R,
    ) {
        let (mut record, in_database) = self.load(address, now_unix);
        let update = get_type_update(&record, observed_type, preferred_type_known);
        apply_type_update(&mut record, update);
        apply_backoff_update(&mut record, backoff, now_unix, rng);
        self.store(address, &record, in_database);
    }

    /// Removes records with at least `min_num_failures` failures, limited to
    /// `address` when given. Returns what was removed, the records that have
    /// waited longest for a retry first.
    pub fn remove_peers_with_many_failures(
        &self,
        min_num_failures: u32,
        address: Option<&PeerAddress>,
    ) -> Vec<PeerAddress> {
        match self
            .store
            .remove_peers_with_many_failures(min_num_failures, address)
        {
            Ok(removed) => {
                for purged in &removed {
                    debug!(address = %purged, "Purging failing peer");
                }
                if !removed.is_empty() {
                    info!(removed = removed.len(), min_num_failures, "Purged failing peers");
                }
                removed
            }
            Err(e) => {
                warn!(error = %e, "Failed to purge failing peers");
                Vec::new()
            }
        }
    }

    fn load_all(&self) -> Vec<(PeerAddress, PeerRecord)> {
        self.store.load_all().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load peer records");
            Vec::new()
        })
    }

    /// Up to `size` random peers matching `query`.
    pub fn load_random_peers<R: Rng + ?Sized>(
        &self,
        query: &PeerQuery,
        size: usize,
        now_unix: i64,
        rng: &mut R,
    ) -> Vec<PeerAddress> {
        let mut candidates: Vec<PeerAddress> = self
            .load_all()
            .into_iter()
            .filter(|(_, r)| {
                if query.use_next_attempt && !r.is_ready(now_unix) {
                    return false;
                }
                if let Some(max_failures) = query.max_num_failures {
                    if r.num_failures > max_failures {
                        return false;
                    }
                }
                query.type_filter.matches(r.peer_type)
            })
            .map(|(address, _)| address)
            .collect();

        candidates.shuffle(rng);
        candidates.truncate(size);
        candidates
    }

    /// Addresses to send in a PEERS message, never including `exclude`.
    pub fn get_peers_to_send(&self, size: usize, exclude: &PeerAddress) -> Vec<PeerAddress> {
        let mut candidates: Vec<(PeerAddress, PeerRecord)> = self
            .load_all()
            .into_iter()
            .filter(|(address, _)| address != exclude && !address.is_private())
            .collect();

        // Prefer outbound peers
        candidates.sort_by_key(|(address, r)| {
            let rank = match r.peer_type {
                StoredPeerType::Preferred => 0,
                StoredPeerType::Outbound => 1,
                StoredPeerType::Inbound => 2,
            };
            (rank, r.num_failures, *address)
        });

        candidates
            .into_iter()
            .take(size)
            .map(|(address, _)| address)
            .collect()
    }

    pub fn get_all_peers(&self) -> Vec<(PeerAddress, PeerRecord)> {
        self.load_all()
    }

    pub fn peer_count(&self) -> usize {
        self.load_all().len()
    }
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

/// Determine what type update to apply.
fn get_type_update(
    record: &PeerRecord,
    observed_type: StoredPeerType,
    preferred_type_known: bool,
) -> TypeUpdate {
    let is_preferred_in_db = record.peer_type == StoredPeerType::Preferred;

    match observed_type {
        StoredPeerType::Preferred => TypeUpdate::SetPreferred,
        StoredPeerType::Outbound => {
            if is_preferred_in_db && preferred_type_known {
                TypeUpdate::EnsureNotPreferred
            } else {
                TypeUpdate::EnsureOutbound
            }
        }
        StoredPeerType::Inbound => TypeUpdate::EnsureNotPreferred,
    }
}

fn apply_type_update(record: &mut PeerRecord, update: TypeUpdate) {
    match update {
        TypeUpdate::EnsureOutbound => {
            if record.peer_type == StoredPeerType::Inbound {
                record.peer_type = StoredPeerType::Outbound;
            }
        }
        TypeUpdate::SetPreferred => {
            record.peer_type = StoredPeerType::Preferred;
        }
        TypeUpdate::EnsureNotPreferred => {
            if record.peer_type == StoredPeerType::Preferred {
                record.peer_type = StoredPeerType::Outbound;
            }
        }
    }
}

/// Random delay in `1..=2^min(failures, 10)` backoff units.
fn compute_backoff<R: Rng + ?Sized>(num_failures: u32, rng: &mut R) -> i64 {
    let backoff_count = num_failures.min(MAX_BACKOFF_EXPONENT);
    let units = rng.gen_range(1..=(1i64 << backoff_count));
    units * SECONDS_PER_BACKOFF
}

fn apply_backoff_update<R: Rng + ?Sized>(
    record: &mut PeerRecord,
    update: BackOffUpdate,
    now_unix: i64,
    rng: &mut R,
) {
    match update {
        BackOffUpdate::HardReset => {
            record.num_failures = 0;
            record.next_attempt = now_unix;
        }
        BackOffUpdate::Reset => {
            record.num_failures = 0;
            record.next_attempt = now_unix + compute_backoff(0, rng);
        }
        BackOffUpdate::Increase => {
            record.num_failures = record.num_failures.saturating_add(1);
            record.next_attempt = now_unix + compute_backoff(record.num_failures, rng);
        }
    }
}
