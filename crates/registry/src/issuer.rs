//! Token-gated certificate issuance
//!
//! A token authorizes exactly one issuance. Consuming the token,
//! allocating the prefix, signing the CSR and persisting the binding
//! all happen in one SQLite transaction, so a failure at any step
//! leaves the token unconsumed and the prefix unassigned.

use crate::allocator::Allocator;
use crate::db::Database;
use rand::Rng;
use rusqlite::{params, OptionalExtension};
use tracing::{info, warn};
use weftnet_common::crypto::CertSigner;
use weftnet_common::{Error, Network, Prefix, Result};

/// Prefix length granted to email-token registrations.
pub const TOKEN_PREFIX_LEN: u8 = 16;

const TOKEN_CHARS: usize = 8;

pub struct Issuer {
    signer: CertSigner,
    allocator: Allocator,
}

impl Issuer {
    pub fn new(network: &Network, ca_cert_pem: &str, ca_key_pem: &str) -> Result<Self> {
        Ok(Self {
            signer: CertSigner::new(ca_cert_pem, ca_key_pem)?,
            allocator: Allocator::new(network),
        })
    }

    /// Create and persist a fresh single-use token, retrying on the
    /// unlikely primary-key collision.
    pub fn create_token(&self, db: &Database, email: &str) -> Result<String> {
        loop {
            let token: String = {
                let mut rng = rand::thread_rng();
                (0..TOKEN_CHARS)
                    .map(|_| rng.gen_range(b'a'..=b'z') as char)
                    .collect()
            };
            let inserted = db.with(|conn| {
                match conn.execute(
                    "INSERT INTO tokens (token, email, prefix_len, date) VALUES (?1, ?2, ?3, ?4)",
                    params![token, email, TOKEN_PREFIX_LEN, chrono::Utc::now().timestamp()],
                ) {
                    Ok(_) => Ok(true),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            })?;
            if inserted {
                info!("Created token for {}", email);
                return Ok(token);
            }
        }
    }

    /// Consume a token and issue a certificate for the CSR. Atomic:
    /// either the token is gone, a prefix is assigned and the returned
    /// certificate persisted, or nothing changed at all.
    pub fn request_certificate(
        &self,
        db: &Database,
        token: &str,
        csr_pem: &str,
    ) -> Result<(Prefix, String)> {
        db.with_tx(|tx| {
            let row: Option<(String, u8)> = tx
                .query_row(
                    "SELECT email, prefix_len FROM tokens WHERE token = ?1",
                    params![token],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let Some((email, prefix_len)) = row else {
                warn!("Rejected certificate request with unknown token");
                return Err(Error::UnknownToken);
            };
            tx.execute("DELETE FROM tokens WHERE token = ?1", params![token])?;

            let prefix = self.allocator.allocate(tx, prefix_len)?;
            let cert_pem = self.signer.issue(csr_pem, &prefix)?;

            tx.execute(
                "UPDATE vpn SET email = ?1, cert = ?2 WHERE prefix = ?3",
                params![email, cert_pem, prefix.as_str()],
            )?;
            info!("Issued certificate for {} to {}", prefix, email);
            Ok((prefix, cert_pem))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weftnet_common::crypto::{self, generate_ca};

    fn setup() -> (Database, Issuer, String) {
        let cidr: ipnetwork::Ipv6Network = "2001:db8:42::/48".parse().unwrap();
        let network = Network::from_cidr(cidr).unwrap();
        let (ca_pem, ca_key) = generate_ca(&network, "weftnet test registry").unwrap();
        let issuer = Issuer::new(&network, &ca_pem, &ca_key).unwrap();
        let db = Database::open_memory().unwrap();
        let node_key = crypto::generate_node_key().unwrap();
        let csr = crypto::make_csr(&node_key, "node@example.net").unwrap();
        (db, issuer, csr)
    }

    #[test]
    fn token_is_single_use() {
        let (db, issuer, csr) = setup();
        let token = issuer.create_token(&db, "node@example.net").unwrap();
        assert_eq!(token.len(), TOKEN_CHARS);

        let (prefix, cert) = issuer.request_certificate(&db, &token, &csr).unwrap();
        assert_eq!(prefix.len(), TOKEN_PREFIX_LEN as usize);
        assert_eq!(crypto::cert_prefix(&cert).unwrap(), prefix);

        let err = issuer.request_certificate(&db, &token, &csr).unwrap_err();
        assert!(matches!(err, Error::UnknownToken));
    }

    #[test]
    fn unknown_token_changes_nothing() {
        let (db, issuer, csr) = setup();
        let err = issuer.request_certificate(&db, "nosuchtok", &csr).unwrap_err();
        assert!(matches!(err, Error::UnknownToken));
        let rows: i64 = db
            .with(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM vpn", [], |r| r.get(0))?))
            .unwrap();
        // Only the trie root exists, nothing was split.
        assert_eq!(rows, 1);
    }

    #[test]
    fn failed_issuance_rolls_back_token() {
        let (db, issuer, _csr) = setup();
        let token = issuer.create_token(&db, "node@example.net").unwrap();
        // A malformed CSR fails after the token row was deleted inside
        // the transaction; the rollback must restore it.
        let err = issuer
            .request_certificate(&db, &token, "not a csr")
            .unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
        let tokens: i64 = db
            .with(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM tokens", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(tokens, 1);
        let assigned: i64 = db
            .with(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM vpn WHERE cert IS NOT NULL",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(assigned, 0);
    }

    #[test]
    fn issued_certificates_get_distinct_prefixes() {
        let (db, issuer, csr) = setup();
        let t1 = issuer.create_token(&db, "a@example.net").unwrap();
        let t2 = issuer.create_token(&db, "b@example.net").unwrap();
        let (p1, _) = issuer.request_certificate(&db, &t1, &csr).unwrap();
        let (p2, _) = issuer.request_certificate(&db, &t2, &csr).unwrap();
        assert_ne!(p1, p2);
    }
}
