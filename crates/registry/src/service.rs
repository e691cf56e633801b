//! Registry service context
//!
//! One explicit context object owning the database, CA material and
//! peer directory, passed to every handler. The six RPC operations are
//! exposed through the `RegistryApi` trait and serialized by the HTTP
//! layer through a single mutex, so handlers never run concurrently.

use crate::config::RegistryConfig;
use crate::db::Database;
use crate::issuer::Issuer;
use crate::mailer::Mailer;
use crate::peers::PeerDirectory;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv6Addr};
use tracing::info;
use weftnet_common::crypto::CaInfo;
use weftnet_common::wire::PeerEntry;
use weftnet_common::{Error, Prefix, Result};

/// The six registry RPC operations.
#[async_trait]
pub trait RegistryApi: Send {
    async fn request_token(&mut self, email: &str) -> Result<()>;
    async fn request_certificate(&mut self, token: &str, csr_pem: &str) -> Result<String>;
    async fn ca_certificate(&self) -> Result<String>;
    async fn declare(&mut self, source: IpAddr, address: &str) -> Result<bool>;
    async fn peer_list(&mut self, n: usize, source: IpAddr) -> Result<Vec<PeerEntry>>;
    async fn bootstrap_peer(&mut self, client_prefix: &str) -> Result<Vec<u8>>;
}

pub struct RegistryService {
    db: Database,
    ca: CaInfo,
    issuer: Issuer,
    directory: PeerDirectory,
    mailer: Mailer,
}

impl RegistryService {
    pub fn open(config: &RegistryConfig) -> Result<Self> {
        let ca_pem = std::fs::read_to_string(&config.ca_path)?;
        let key_pem = std::fs::read_to_string(&config.key_path)?;
        let ca = CaInfo::parse(&ca_pem)?;
        info!("Network prefix: {}", ca.network);

        let mut bootstrap = Vec::new();
        for bits in &config.bootstrap {
            bootstrap.push(Prefix::parse(bits)?);
        }

        let issuer = Issuer::new(&ca.network, &ca_pem, &key_pem)?;
        let directory = PeerDirectory::new(ca.network.clone(), bootstrap);
        let db = Database::open(&config.db_path)?;
        let mailer = Mailer::new(config.mailhost.clone(), config.mail_from.clone());

        Ok(Self {
            db,
            ca,
            issuer,
            directory,
            mailer,
        })
    }

    #[cfg(test)]
    pub fn open_memory(ca_pem: &str, key_pem: &str, bootstrap: Vec<Prefix>) -> Result<Self> {
        let ca = CaInfo::parse(ca_pem)?;
        Ok(Self {
            db: Database::open_memory()?,
            issuer: Issuer::new(&ca.network, ca_pem, key_pem)?,
            directory: PeerDirectory::new(ca.network.clone(), bootstrap),
            mailer: Mailer::new(None, "postmaster@weftnet.invalid".to_string()),
            ca,
        })
    }

    /// Authorization is keyed on IPv6 sources only; IPv4 and
    /// v4-mapped callers can never be under the managed network.
    fn source_v6(source: IpAddr) -> Option<Ipv6Addr> {
        match source {
            IpAddr::V6(ip) if ip.to_ipv4_mapped().is_none() => Some(ip),
            _ => None,
        }
    }
}

#[async_trait]
impl RegistryApi for RegistryService {
    async fn request_token(&mut self, email: &str) -> Result<()> {
        let token = self.issuer.create_token(&self.db, email)?;
        self.mailer.send_token(email, &token).await
    }

    async fn request_certificate(&mut self, token: &str, csr_pem: &str) -> Result<String> {
        let (_prefix, cert_pem) = self.issuer.request_certificate(&self.db, token, csr_pem)?;
        Ok(cert_pem)
    }

    async fn ca_certificate(&self) -> Result<String> {
        Ok(self.ca.cert_pem.clone())
    }

    async fn declare(&mut self, source: IpAddr, address: &str) -> Result<bool> {
        let Some(source) = Self::source_v6(source) else {
            return Ok(false);
        };
        self.directory.declare(&self.db, source, address)
    }

    async fn peer_list(&mut self, n: usize, source: IpAddr) -> Result<Vec<PeerEntry>> {
        let Some(source) = Self::source_v6(source) else {
            return Err(Error::UnauthorizedSource {
                address: source.to_string(),
            });
        };
        self.directory.list(&self.db, n, source)
    }

    async fn bootstrap_peer(&mut self, client_prefix: &str) -> Result<Vec<u8>> {
        let prefix = Prefix::parse(client_prefix)?;
        self.directory.bootstrap_peer(&self.db, &prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weftnet_common::crypto::{self, generate_ca};
    use weftnet_common::Network;

    fn service() -> RegistryService {
        let cidr: ipnetwork::Ipv6Network = "2001:db8:42::/48".parse().unwrap();
        let network = Network::from_cidr(cidr).unwrap();
        let (ca_pem, ca_key) = generate_ca(&network, "weftnet test registry").unwrap();
        RegistryService::open_memory(&ca_pem, &ca_key, Vec::new()).unwrap()
    }

    #[tokio::test]
    async fn end_to_end_issue_declare_bootstrap() {
        let mut svc = service();

        svc.request_token("node@example.net").await.unwrap();
        let token: String = svc
            .db
            .with(|conn| Ok(conn.query_row("SELECT token FROM tokens", [], |r| r.get(0))?))
            .unwrap();

        let node_key = crypto::generate_node_key().unwrap();
        let csr = crypto::make_csr(&node_key, "node@example.net").unwrap();
        let cert = svc.request_certificate(&token, &csr).await.unwrap();
        let prefix = crypto::cert_prefix(&cert).unwrap();

        // Declare from the node's own VPN address.
        let source = svc.ca.network.address_of(&prefix).unwrap();
        let ok = svc
            .declare(IpAddr::V6(source), "192.0.2.1,1194,udp")
            .await
            .unwrap();
        assert!(ok);

        let peers = svc.peer_list(10, IpAddr::V6(source)).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].prefix, prefix.as_str());

        let blob = svc.bootstrap_peer(prefix.as_str()).await.unwrap();
        let plain = crypto::decrypt_with_key(&node_key, &blob).unwrap();
        let plain = String::from_utf8(plain).unwrap();
        assert!(plain.starts_with(prefix.as_str()));
        assert!(plain.ends_with("192.0.2.1,1194,udp"));
    }

    #[tokio::test]
    async fn ipv4_source_is_outside_trust_boundary() {
        let mut svc = service();
        let v4: IpAddr = "203.0.113.9".parse().unwrap();
        assert!(!svc.declare(v4, "192.0.2.1,1194,udp").await.unwrap());
        assert!(svc.peer_list(10, v4).await.is_err());
    }
}
