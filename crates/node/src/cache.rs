//! Durable local peer cache
//!
//! A small SQLite mirror of the registry's view, reloadable across
//! restarts. Any SQLite failure here is treated as corruption of the
//! local store: the caller renames it aside and restarts fresh rather
//! than running on unreliable state.

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use weftnet_common::wire::PeerEntry;
use weftnet_common::{Error, Result};

#[derive(Clone)]
pub struct PeerCache {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl PeerCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(corruption)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(corruption)?;
        let cache = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.as_ref().to_path_buf()),
        };
        cache.init_schema()?;
        info!("Opened peer cache at {:?}", path.as_ref());
        Ok(cache)
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(corruption)?;
        let cache = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        };
        cache.init_schema()?;
        Ok(cache)
    }

    /// Path of the on-disk store, if any. Used for backup-and-restart.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS peers (
                    prefix TEXT PRIMARY KEY NOT NULL,
                    address TEXT NOT NULL
                );
                "#,
            )
            .map_err(corruption)?;
        Ok(())
    }

    pub fn upsert(&self, prefix: &str, address: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO peers (prefix, address) VALUES (?1, ?2)",
                params![prefix, address],
            )
            .map_err(corruption)?;
        Ok(())
    }

    pub fn merge(&self, peers: &[PeerEntry]) -> Result<()> {
        let conn = self.conn.lock();
        for peer in peers {
            conn.execute(
                "INSERT OR REPLACE INTO peers (prefix, address) VALUES (?1, ?2)",
                params![peer.prefix, peer.address],
            )
            .map_err(corruption)?;
        }
        Ok(())
    }

    pub fn remove(&self, prefix: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM peers WHERE prefix = ?1", params![prefix])
            .map_err(corruption)?;
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<PeerEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT prefix, address FROM peers")
            .map_err(corruption)?;
        let rows = stmt
            .query_map([], |r| {
                Ok(PeerEntry {
                    prefix: r.get(0)?,
                    address: r.get(1)?,
                })
            })
            .map_err(corruption)?;
        let mut peers = Vec::new();
        for row in rows {
            peers.push(row.map_err(corruption)?);
        }
        Ok(peers)
    }

    pub fn is_empty(&self) -> Result<bool> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM peers", [], |r| r.get(0))
            .map_err(corruption)?;
        Ok(count == 0)
    }
}

fn corruption(e: rusqlite::Error) -> Error {
    Error::PersistenceCorruption(e.to_string())
}
