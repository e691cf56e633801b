//! Peer liveness directory
//!
//! Maps assigned prefixes to their last advertised address. Writes are
//! authorized purely by the source address falling under the managed
//! network, never by caller-supplied identity claims.

use crate::db::{Database, RESERVED_CERT};
use rusqlite::{params, OptionalExtension};
use std::net::Ipv6Addr;
use tracing::{debug, info, warn};
use weftnet_common::wire::PeerEntry;
use weftnet_common::{Error, Network, Prefix, Result};

/// Entries older than this are dropped by the staleness sweep.
pub const PEER_TIMEOUT_SECS: i64 = 86_400;

/// Minimum spacing between two staleness sweeps.
pub const SWEEP_INTERVAL_SECS: i64 = 600;

pub struct PeerDirectory {
    network: Network,
    /// Prefixes preferred by `bootstrap_peer`, if configured.
    bootstrap: Vec<Prefix>,
    last_sweep: i64,
}

impl PeerDirectory {
    pub fn new(network: Network, bootstrap: Vec<Prefix>) -> Self {
        Self {
            network,
            bootstrap,
            last_sweep: chrono::Utc::now().timestamp(),
        }
    }

    /// Host bits of the caller under the managed network, or None for
    /// addresses outside the trust boundary.
    fn authorized_remainder(&self, source: Ipv6Addr) -> Option<String> {
        match self.network.remainder(source) {
            Some(rem) => Some(rem),
            None => {
                warn!(
                    "Unauthorized connection from {} which is not under {}",
                    source, self.network
                );
                None
            }
        }
    }

    /// Resolve the caller's derived host bits to an assigned allocation:
    /// exact match first, then the longest assigned prefix of the bits.
    fn find_assigned(&self, db: &Database, remainder: &str) -> Result<Option<String>> {
        db.with(|conn| {
            let exact: Option<String> = conn
                .query_row(
                    "SELECT prefix FROM vpn
                     WHERE prefix = ?1 AND cert IS NOT NULL AND cert != ?2",
                    params![remainder, RESERVED_CERT],
                    |r| r.get(0),
                )
                .optional()?;
            if exact.is_some() {
                return Ok(exact);
            }
            // The prefix column only holds '0'/'1' characters, so LIKE
            // with the row as the pattern head is a prefix match.
            Ok(conn
                .query_row(
                    "SELECT prefix FROM vpn
                     WHERE cert IS NOT NULL AND cert != ?2 AND ?1 LIKE prefix || '%'
                     ORDER BY length(prefix) DESC LIMIT 1",
                    params![remainder, RESERVED_CERT],
                    |r| r.get(0),
                )
                .optional()?)
        })
    }

    /// Record the advertised address of the caller. Returns false
    /// (without mutating anything) for unauthorized sources.
    pub fn declare(&self, db: &Database, source: Ipv6Addr, address: &str) -> Result<bool> {
        let Some(remainder) = self.authorized_remainder(source) else {
            return Ok(false);
        };
        let Some(prefix) = self.find_assigned(db, &remainder)? else {
            warn!("declare from {} matches no assigned prefix", source);
            return Ok(false);
        };
        db.with(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO peers (prefix, address) VALUES (?1, ?2)",
                params![prefix, address],
            )?;
            Ok(())
        })?;
        debug!("Declared {} at {}", prefix, address);
        Ok(true)
    }

    /// Random sample of up to `n` peers. Runs the staleness sweep
    /// opportunistically, at most once per sweep interval.
    pub fn list(&mut self, db: &Database, n: usize, source: Ipv6Addr) -> Result<Vec<PeerEntry>> {
        if self.authorized_remainder(source).is_none() {
            return Err(Error::UnauthorizedSource {
                address: source.to_string(),
            });
        }
        if !(1..1000).contains(&n) {
            return Err(Error::InvalidConfig(format!("peer count {} out of range", n)));
        }
        let now = chrono::Utc::now().timestamp();
        if now >= self.last_sweep + SWEEP_INTERVAL_SECS {
            self.sweep(db, now)?;
        }
        db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT prefix, address FROM peers ORDER BY random() LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![n as i64], |r| {
                Ok(PeerEntry {
                    prefix: r.get(0)?,
                    address: r.get(1)?,
                })
            })?;
            let mut peers = Vec::new();
            for row in rows {
                peers.push(row?);
            }
            Ok(peers)
        })
    }

    /// Drop entries not refreshed within the timeout.
    fn sweep(&mut self, db: &Database, now: i64) -> Result<()> {
        let dropped = db.with(|conn| {
            Ok(conn.execute(
                "DELETE FROM peers WHERE date + ?1 <= ?2",
                params![PEER_TIMEOUT_SECS, now],
            )?)
        })?;
        if dropped > 0 {
            info!("Dropped {} stale peers", dropped);
        }
        self.last_sweep = now;
        Ok(())
    }

    /// One peer record for a freshly joined node, encrypted under its
    /// own certificate so only that node can read it.
    pub fn bootstrap_peer(&self, db: &Database, client_prefix: &Prefix) -> Result<Vec<u8>> {
        let cert: Option<String> = db.with(|conn| {
            Ok(conn
                .query_row(
                    "SELECT cert FROM vpn WHERE prefix = ?1 AND cert IS NOT NULL AND cert != ?2",
                    params![client_prefix.as_str(), RESERVED_CERT],
                    |r| r.get(0),
                )
                .optional()?)
        })?;
        let Some(cert) = cert else {
            return Err(Error::InvalidPrefix(client_prefix.to_string()));
        };

        let picked = self
            .configured_bootstrap(db)?
            .map(Ok)
            .unwrap_or_else(|| self.random_peer(db))?;
        let (prefix, address) = picked;
        info!("Sending bootstrap peer ({}, {})", prefix, address);
        weftnet_common::crypto::encrypt_for_cert(
            &cert,
            format!("{} {}", prefix, address).as_bytes(),
        )
    }

    fn configured_bootstrap(&self, db: &Database) -> Result<Option<(String, String)>> {
        for candidate in &self.bootstrap {
            let found: Option<(String, String)> = db.with(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT prefix, address FROM peers WHERE prefix = ?1",
                        params![candidate.as_str()],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?)
            })?;
            if found.is_some() {
                return Ok(found);
            }
            info!("Bootstrap peer {} unknown, falling back", candidate);
        }
        Ok(None)
    }

    fn random_peer(&self, db: &Database) -> Result<(String, String)> {
        db.with(|conn| {
            conn.query_row(
                "SELECT prefix, address FROM peers ORDER BY random() LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| Error::Internal("no peer available for bootstrap".to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn network() -> Network {
        let cidr: ipnetwork::Ipv6Network = "2001:db8:42::/48".parse().unwrap();
        Network::from_cidr(cidr).unwrap()
    }

    fn assign(db: &Database, prefix: &str) {
        db.with(|conn| {
            conn.execute(
                "INSERT INTO vpn (prefix, email, cert) VALUES (?1, 'a@b', 'PEM')",
                params![prefix],
            )?;
            Ok(())
        })
        .unwrap();
    }

    fn inside_addr(net: &Network, prefix: &str) -> Ipv6Addr {
        let p = Prefix::parse(prefix).unwrap();
        net.address_of(&p).unwrap()
    }

    #[test]
    fn declare_outside_network_never_mutates() {
        let net = network();
        let db = Database::open_memory().unwrap();
        let dir = PeerDirectory::new(net, Vec::new());
        let ok = dir
            .declare(&db, "fe80::1".parse().unwrap(), "192.0.2.1,1194,udp")
            .unwrap();
        assert!(!ok);
        let count: i64 = db
            .with(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM peers", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn declare_upserts_by_longest_assigned_prefix() {
        let net = network();
        let db = Database::open_memory().unwrap();
        assign(&db, "0000000000000001");
        let dir = PeerDirectory::new(net.clone(), Vec::new());
        let source = inside_addr(&net, "0000000000000001");

        assert!(dir.declare(&db, source, "192.0.2.1,1194,udp").unwrap());
        assert!(dir.declare(&db, source, "192.0.2.2,1194,udp").unwrap());

        let (prefix, address): (String, String) = db
            .with(|conn| {
                Ok(conn.query_row("SELECT prefix, address FROM peers", [], |r| {
                    Ok((r.get(0)?, r.get(1)?))
                })?)
            })
            .unwrap();
        assert_eq!(prefix, "0000000000000001");
        assert_eq!(address, "192.0.2.2,1194,udp");
    }

    #[test]
    fn list_enforces_authorization_and_bounds() {
        let net = network();
        let db = Database::open_memory().unwrap();
        assign(&db, "0000000000000001");
        let mut dir = PeerDirectory::new(net.clone(), Vec::new());
        let source = inside_addr(&net, "0000000000000001");
        dir.declare(&db, source, "192.0.2.1,1194,udp").unwrap();

        let err = dir.list(&db, 5, "fe80::1".parse().unwrap()).unwrap_err();
        assert!(matches!(err, Error::UnauthorizedSource { .. }));
        assert!(dir.list(&db, 0, source).is_err());
        assert!(dir.list(&db, 1000, source).is_err());

        let peers = dir.list(&db, 10, source).unwrap();
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn sweep_drops_stale_entries_once_per_interval() {
        let net = network();
        let db = Database::open_memory().unwrap();
        assign(&db, "0000000000000001");
        let mut dir = PeerDirectory::new(net.clone(), Vec::new());
        let source = inside_addr(&net, "0000000000000001");

        // A stale row, inserted behind the directory's back.
        db.with(|conn| {
            conn.execute(
                "INSERT INTO peers (prefix, address, date) VALUES ('0000000000000001', 'x', 0)",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        // Force the sweep window open.
        dir.last_sweep = 0;
        let peers = dir.list(&db, 10, source).unwrap();
        assert!(peers.is_empty());

        // Re-declare, backdate, and verify the throttle: no second
        // sweep inside the interval.
        dir.declare(&db, source, "192.0.2.1,1194,udp").unwrap();
        db.with(|conn| {
            conn.execute("UPDATE peers SET date = 0", [])?;
            Ok(())
        })
        .unwrap();
        let peers = dir.list(&db, 10, source).unwrap();
        assert_eq!(peers.len(), 1);
    }
}
