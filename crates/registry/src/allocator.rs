//! Hierarchical address allocator
//!
//! The `vpn` table is a binary trie over bit-string prefixes. A free
//! node is split on demand by renaming it to its '1' child and
//! inserting a fresh '0' sibling, so every split point always has
//! exactly two persisted children and no "parent" row lingers. The
//! all-zero leaf at maximum depth is the network's own address and is
//! marked reserved instead of being handed out.

use crate::db::RESERVED_CERT;
use rusqlite::{params, OptionalExtension, Transaction};
use tracing::{debug, warn};
use weftnet_common::{Error, Network, Prefix, Result};

pub struct Allocator {
    max_len: usize,
}

impl Allocator {
    pub fn new(network: &Network) -> Self {
        Self {
            max_len: network.max_prefix_len(),
        }
    }

    /// Allocate a free prefix of exactly `prefix_len` bits inside the
    /// given transaction. The returned row stays free; the caller marks
    /// it assigned by writing its certificate.
    pub fn allocate(&self, tx: &Transaction, prefix_len: u8) -> Result<Prefix> {
        let prefix_len = prefix_len as usize;
        if prefix_len == 0 || prefix_len > self.max_len {
            return Err(Error::InvalidConfig(format!(
                "prefix length {} out of range 1..={}",
                prefix_len, self.max_len
            )));
        }
        // Retry loop instead of recursion: at most one retry can happen
        // per call chain for the reserved all-zero leaf, but the loop
        // keeps the stack flat even under repeated exhaustion.
        loop {
            // The longest free node not longer than requested needs the
            // fewest further splits.
            let found: Option<String> = tx
                .query_row(
                    "SELECT prefix FROM vpn
                     WHERE length(prefix) <= ?1 AND cert IS NULL
                     ORDER BY length(prefix) DESC LIMIT 1",
                    params![prefix_len],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(mut prefix) = found else {
                warn!("No more free /{} prefix available", prefix_len);
                return Err(Error::AddressSpaceExhausted {
                    prefix_len: prefix_len as u8,
                });
            };
            while prefix.len() < prefix_len {
                // The node being split becomes its own '1' child; the
                // fresh '0' sibling is the path we keep descending.
                tx.execute(
                    "UPDATE vpn SET prefix = ?1 WHERE prefix = ?2",
                    params![format!("{}1", prefix), prefix],
                )?;
                prefix.push('0');
                tx.execute(
                    "INSERT INTO vpn (prefix, email, cert) VALUES (?1, NULL, NULL)",
                    params![prefix],
                )?;
            }
            if prefix.len() < self.max_len || prefix.contains('1') {
                debug!("Allocated prefix {}", prefix);
                return Prefix::parse(&prefix);
            }
            // All-zero host address at maximum depth: never allocatable.
            tx.execute(
                "UPDATE vpn SET cert = ?1 WHERE prefix = ?2",
                params![RESERVED_CERT, prefix],
            )?;
            debug!("Reserved the all-zero leaf {}", prefix);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::collections::HashSet;

    fn test_allocator(network_bits: &str) -> (Database, Allocator) {
        let network = Network::parse(network_bits).unwrap();
        (Database::open_memory().unwrap(), Allocator::new(&network))
    }

    fn allocate(db: &Database, alloc: &Allocator, len: u8) -> Result<Prefix> {
        db.with_tx(|tx| alloc.allocate(tx, len))
    }

    fn mark_assigned(db: &Database, prefix: &Prefix) {
        db.with(|conn| {
            conn.execute(
                "UPDATE vpn SET cert = 'PEM' WHERE prefix = ?1",
                params![prefix.as_str()],
            )?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn allocations_are_distinct_and_sized() {
        let (db, alloc) = test_allocator("0010");
        let mut seen = HashSet::new();
        for _ in 0..3 {
            let p = allocate(&db, &alloc, 4).unwrap();
            assert_eq!(p.len(), 4);
            assert!(p.contains_one() || p.len() < 124);
            assert!(seen.insert(p.clone()), "duplicate prefix {}", p);
            mark_assigned(&db, &p);
        }
    }

    #[test]
    fn split_keeps_sibling_free() {
        let (db, alloc) = test_allocator("0010");
        let p = allocate(&db, &alloc, 2).unwrap();
        mark_assigned(&db, &p);
        // Splitting '' down to length 2 leaves '1' and the sibling of
        // the allocated node free.
        let free: i64 = db
            .with(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM vpn WHERE cert IS NULL",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(free, 2);
    }

    #[test]
    fn exhaustion_is_reported() {
        // Tiny network: only 4 host bits, so /1 can be allocated twice
        // at most (and one of those splits further down).
        let network = Network::parse(&"0".repeat(124)).unwrap();
        let db = Database::open_memory().unwrap();
        let alloc = Allocator::new(&network);
        let a = db.with_tx(|tx| alloc.allocate(tx, 1)).unwrap();
        mark_assigned(&db, &a);
        let b = db.with_tx(|tx| alloc.allocate(tx, 1)).unwrap();
        mark_assigned(&db, &b);
        assert_ne!(a, b);
        let err = db.with_tx(|tx| alloc.allocate(tx, 1)).unwrap_err();
        assert!(matches!(err, Error::AddressSpaceExhausted { prefix_len: 1 }));
    }

    #[test]
    fn all_zero_leaf_is_reserved_not_allocated() {
        // max_len = 2: allocating at full depth first walks into '00',
        // which must be reserved and skipped in favour of '01'.
        let network = Network::parse(&"0".repeat(126)).unwrap();
        let db = Database::open_memory().unwrap();
        let alloc = Allocator::new(&network);
        let p = db.with_tx(|tx| alloc.allocate(tx, 2)).unwrap();
        assert_eq!(p.as_str(), "01");
        let reserved: String = db
            .with(|conn| {
                Ok(conn.query_row(
                    "SELECT prefix FROM vpn WHERE cert = ?1",
                    params![RESERVED_CERT],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(reserved, "00");
    }

    #[test]
    fn rejects_out_of_range_length() {
        let network = Network::parse("0010").unwrap();
        let db = Database::open_memory().unwrap();
        let alloc = Allocator::new(&network);
        assert!(db.with_tx(|tx| alloc.allocate(tx, 0)).is_err());
        assert!(db.with_tx(|tx| alloc.allocate(tx, 125)).is_err());
    }
}
