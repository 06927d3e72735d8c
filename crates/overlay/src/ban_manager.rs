//! Persistent list of banned nodes.
//!
//! A HELLO from a banned node ends the connection with "node is banned".
//! Bans live in memory and, when a database is attached, in the `ban` table:
//!
//! ```sql
//! CREATE TABLE ban (
//!     nodeid CHARACTER(64) NOT NULL PRIMARY KEY
//! );
//! ```
//!
//! Node ids are stored as lowercase hex of the Ed25519 public key.

use crate::Result;
use fba_crypto::PublicKey;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Ban list with an in-memory cache in front of optional SQLite storage.
pub struct BanManager {
    cache: RwLock<HashSet<PublicKey>>,
    db: Option<Mutex<Connection>>,
}

impl BanManager {
    /// Bans kept in memory only.
    pub fn new_in_memory() -> Self {
        Self {
            cache: RwLock::new(HashSet::new()),
            db: None,
        }
    }

    /// Opens (or creates) the ban table in the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let manager = Self::from_connection(Connection::open(path)?)?;
        let loaded = manager.ban_count();
        if loaded > 0 {
            info!(count = loaded, "Loaded banned nodes");
        }
        Ok(manager)
    }

    /// Uses an existing connection, creating the table if needed.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS ban (
                nodeid CHARACTER(64) NOT NULL PRIMARY KEY
            )",
            [],
        )?;

        let mut cache = HashSet::new();
        {
            let mut stmt = conn.prepare("SELECT nodeid FROM ban")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                match parse_node_id(&row?) {
                    Some(node_id) => {
                        cache.insert(node_id);
                    }
                    None => warn!("Ignoring malformed node id in ban table"),
                }
            }
        }

        Ok(Self {
            cache: RwLock::new(cache),
            db: Some(Mutex::new(conn)),
        })
    }

    /// Bans a node. Banning twice is a no-op.
    pub fn ban_node(&self, node_id: &PublicKey) -> Result<()> {
        if self.is_banned(node_id) {
            debug!(node = %node_id, "Node already banned");
            return Ok(());
        }

        info!(node = %node_id, "Banning node");
        if let Some(db) = &self.db {
            db.lock().execute(
                "INSERT OR IGNORE INTO ban (nodeid) VALUES (?1)",
                [hex::encode(node_id.as_bytes())],
            )?;
        }
        self.cache.write().insert(*node_id);
        Ok(())
    }

    /// Lifts a ban. Unbanning an unknown node is a no-op.
    pub fn unban_node(&self, node_id: &PublicKey) -> Result<()> {
        info!(node = %node_id, "Unbanning node");
        if let Some(db) = &self.db {
            db.lock().execute(
                "DELETE FROM ban WHERE nodeid = ?1",
                [hex::encode(node_id.as_bytes())],
            )?;
        }
        self.cache.write().remove(node_id);
        Ok(())
    }

    pub fn is_banned(&self, node_id: &PublicKey) -> bool {
        self.cache.read().contains(node_id)
    }

    pub fn banned_nodes(&self) -> Vec<PublicKey> {
        self.cache.read().iter().copied().collect()
    }

    pub fn ban_count(&self) -> usize {
        self.cache.read().len()
    }
}

impl Default for BanManager {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

fn parse_node_id(hex_str: &str) -> Option<PublicKey> {
    let bytes: [u8; 32] = hex::decode(hex_str).ok()?.try_into().ok()?;
    PublicKey::from_bytes(&bytes).ok()
}
