//! SQLite store for the registry
//!
//! Three tables: the allocation trie (`vpn`), single-use issuance
//! tokens (`tokens`) and the peer liveness directory (`peers`). The
//! trie root is the empty prefix, inserted when the schema is created.

use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use weftnet_common::Result;

/// Sentinel stored in `vpn.cert` for the permanently reserved all-zero
/// leaf. Distinct from NULL (free) and from a real certificate PEM.
pub const RESERVED_CERT: &str = "reserved";

/// Database wrapper for registry persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        info!("Opened registry database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS peers (
                prefix TEXT PRIMARY KEY NOT NULL,
                address TEXT NOT NULL,
                date INTEGER DEFAULT (strftime('%s','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_peers_date ON peers(date);

            CREATE TABLE IF NOT EXISTS tokens (
                token TEXT PRIMARY KEY NOT NULL,
                email TEXT NOT NULL,
                prefix_len INTEGER NOT NULL,
                date INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vpn (
                prefix TEXT PRIMARY KEY NOT NULL,
                email TEXT,
                cert TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_vpn_len ON vpn(length(prefix));
            "#,
        )?;
        // Trie root: the whole managed space starts as one free node.
        conn.execute(
            "INSERT OR IGNORE INTO vpn (prefix, email, cert) VALUES ('', NULL, NULL)",
            [],
        )?;
        debug!("Registry schema initialized");
        Ok(())
    }

    /// Run a closure against the connection.
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run a closure inside a transaction; rolls back on error.
    pub fn with_tx<T>(&self, f: impl FnOnce(&rusqlite::Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_seeds_trie_root() {
        let db = Database::open_memory().unwrap();
        let (prefix, cert): (String, Option<String>) = db
            .with(|conn| {
                Ok(conn.query_row("SELECT prefix, cert FROM vpn", [], |r| {
                    Ok((r.get(0)?, r.get(1)?))
                })?)
            })
            .unwrap();
        assert_eq!(prefix, "");
        assert!(cert.is_none());
    }

    #[test]
    fn tx_rolls_back_on_error() {
        let db = Database::open_memory().unwrap();
        let r: Result<()> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO tokens (token, email, prefix_len, date) VALUES ('t', 'a@b', 16, 0)",
                [],
            )?;
            Err(weftnet_common::Error::UnknownToken)
        });
        assert!(r.is_err());
        let count: i64 = db
            .with(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM tokens", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }
}
