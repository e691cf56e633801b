//! Peer manager
//!
//! Keeps the local candidate pool fresh against the registry and
//! republishes this node's reachable address. The tunnel manager draws
//! candidates from here; peers of tunnels that failed to establish are
//! deprioritized for one churn cycle, not blacklisted.

use crate::cache::PeerCache;
use crate::events::TunnelEvent;
use crate::registry_client::RegistryClient;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use weftnet_common::{crypto, Prefix, Result};

pub struct PeerManager {
    cache: PeerCache,
    client: RegistryClient,
    own_prefix: Prefix,
    key_pem: String,
    /// Externally reachable endpoints, re-declared on every refresh
    /// when set (automatic mode).
    advertised: Option<String>,
    refresh_interval: Duration,
    sample_size: usize,
    deprioritized: HashSet<String>,
    pub next_refresh: Instant,
}

impl PeerManager {
    pub fn new(
        cache: PeerCache,
        client: RegistryClient,
        own_prefix: Prefix,
        key_pem: String,
        advertised: Option<String>,
        refresh_interval: Duration,
        sample_size: usize,
    ) -> Self {
        Self {
            cache,
            client,
            own_prefix,
            key_pem,
            advertised,
            refresh_interval,
            sample_size,
            deprioritized: HashSet::new(),
            next_refresh: Instant::now(),
        }
    }

    /// Pull a fresh sample from the registry, merge it into the cache
    /// and republish our own address.
    pub async fn refresh(&mut self) -> Result<()> {
        self.next_refresh = Instant::now() + self.refresh_interval;
        match self.client.get_peer_list(self.sample_size).await {
            Ok(peers) => {
                debug!("Merging {} peers into cache", peers.len());
                self.cache.merge(&peers)?;
            }
            Err(e) => warn!("Peer list refresh failed: {}", e),
        }
        if let Some(address) = &self.advertised {
            match self.client.declare(address).await {
                Ok(true) => debug!("Re-declared own address"),
                Ok(false) => warn!("Registry refused our declare"),
                Err(e) => warn!("Declare failed: {}", e),
            }
        }
        Ok(())
    }

    /// Seed an empty cache through the encrypted bootstrap channel.
    pub async fn bootstrap(&mut self) -> Result<()> {
        if !self.cache.is_empty()? {
            return Ok(());
        }
        info!("Peer cache empty, requesting bootstrap peer");
        let blob = self
            .client
            .get_bootstrap_peer(self.own_prefix.as_str())
            .await?;
        let plain = crypto::decrypt_with_key(&self.key_pem, &blob)?;
        let plain = String::from_utf8(plain)
            .map_err(|e| weftnet_common::Error::Registry(format!("bootstrap blob: {}", e)))?;
        if let Some((prefix, address)) = plain.split_once(' ') {
            Prefix::parse(prefix)?;
            self.cache.upsert(prefix, address)?;
            info!("Bootstrapped with peer {}", prefix);
        }
        Ok(())
    }

    /// Candidate peers for new tunnels: everything cached except
    /// ourselves, already-connected peers and this cycle's
    /// deprioritized set, in random order.
    pub fn candidates(&self, exclude: &HashSet<String>) -> Result<Vec<(Prefix, String)>> {
        let mut out = Vec::new();
        for entry in self.cache.all()? {
            if entry.prefix == *self.own_prefix.as_str()
                || exclude.contains(&entry.prefix)
                || self.deprioritized.contains(&entry.prefix)
            {
                continue;
            }
            let Ok(prefix) = Prefix::parse(&entry.prefix) else {
                continue;
            };
            out.push((prefix, entry.address));
        }
        out.shuffle(&mut rand::thread_rng());
        Ok(out)
    }

    /// Skip this peer when drawing candidates, until the next churn
    /// cycle clears the set.
    pub fn deprioritize(&mut self, prefix: &Prefix) {
        self.deprioritized.insert(prefix.as_str().to_string());
    }

    pub fn clear_deprioritized(&mut self) {
        self.deprioritized.clear();
    }

    /// Liveness hints from the subprocess event stream. Lines of the
    /// form `peer <prefix> <address>` feed the cache directly.
    pub fn handle_message(&mut self, event: &TunnelEvent) -> Result<()> {
        if let TunnelEvent::Liveness(line) = event {
            let mut words = line.split_whitespace();
            if let (Some("peer"), Some(prefix), Some(address)) =
                (words.next(), words.next(), words.next())
            {
                if Prefix::parse(prefix).is_ok() {
                    debug!("Learned peer {} from event stream", prefix);
                    self.cache.upsert(prefix, address)?;
                }
            }
        }
        Ok(())
    }
}
