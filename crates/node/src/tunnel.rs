//! Tunnel manager
//!
//! Maintains the bounded, churned set of encrypted point-to-point
//! tunnels. Slots move `connecting -> established` on up-events from
//! the subprocess stream; every churn tick replaces at most
//! `refresh_count` of the oldest established tunnels so the routing
//! daemon never sees more than a bounded disturbance. Interface names
//! are pooled and reused across tunnel generations.

use crate::events::TunnelEvent;
use crate::peer_manager::PeerManager;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use weftnet_common::wire::{parse_address, Endpoint};
use weftnet_common::{Prefix, Result};

/// A running tunnel subprocess. Termination must tolerate processes
/// that already exited.
#[async_trait]
pub trait TunnelHandle: Send {
    async fn terminate(&mut self);
}

/// Seam between tunnel bookkeeping and the VPN binary.
#[async_trait]
pub trait TunnelSpawner: Send + Sync {
    async fn spawn_tunnel(&self, iface: &str, endpoint: &Endpoint)
        -> Result<Box<dyn TunnelHandle>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Connecting,
    Established,
}

struct TunnelSlot {
    prefix: Prefix,
    state: SlotState,
    created: Instant,
    handle: Box<dyn TunnelHandle>,
}

pub struct TunnelManager {
    spawner: Box<dyn TunnelSpawner>,
    /// Live slots keyed by interface name.
    slots: HashMap<String, TunnelSlot>,
    free_interfaces: BTreeSet<String>,
    connection_count: usize,
    refresh_count: usize,
    tunnel_refresh: Duration,
    pub next_refresh: Instant,
}

impl TunnelManager {
    pub fn new(
        spawner: Box<dyn TunnelSpawner>,
        connection_count: usize,
        refresh_count: usize,
        tunnel_refresh: Duration,
    ) -> Self {
        let free_interfaces = (0..connection_count).map(|i| format!("wn{}", i)).collect();
        Self {
            spawner,
            slots: HashMap::new(),
            free_interfaces,
            connection_count,
            refresh_count,
            tunnel_refresh,
            // Forced at startup.
            next_refresh: Instant::now(),
        }
    }

    /// All pooled interface names, for the routing daemon's command
    /// line. The pool is fixed at startup, bound or not.
    pub fn pool_interfaces(&self) -> Vec<String> {
        (0..self.connection_count).map(|i| format!("wn{}", i)).collect()
    }

    pub fn connected_prefixes(&self) -> HashSet<String> {
        self.slots
            .values()
            .map(|s| s.prefix.as_str().to_string())
            .collect()
    }

    pub fn established_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.state == SlotState::Established)
            .count()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// One churn cycle: tear down tunnels that never came up, replace
    /// a bounded number of the oldest established ones, then refill
    /// from the candidate pool.
    pub async fn refresh(&mut self, peers: &mut PeerManager) -> Result<()> {
        self.next_refresh = Instant::now() + self.tunnel_refresh;
        peers.clear_deprioritized();

        // Tunnels still connecting since the last tick are failures:
        // tear down and deprioritize the peer for this cycle only.
        let stale: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, s)| s.state == SlotState::Connecting)
            .map(|(iface, _)| iface.clone())
            .collect();
        for iface in stale {
            if let Some(slot) = self.teardown(&iface).await {
                info!("Tunnel on {} never established, deprioritizing {}", iface, slot.prefix);
                peers.deprioritize(&slot.prefix);
            }
        }

        // Churn only at capacity, bounded by refresh_count.
        if self.slots.len() >= self.connection_count {
            let mut established: Vec<(Instant, String)> = self
                .slots
                .iter()
                .filter(|(_, s)| s.state == SlotState::Established)
                .map(|(iface, s)| (s.created, iface.clone()))
                .collect();
            established.sort();
            for (_, iface) in established.into_iter().take(self.refresh_count) {
                info!("Churning tunnel on {}", iface);
                self.teardown(&iface).await;
            }
        }

        self.fill(peers).await
    }

    async fn fill(&mut self, peers: &mut PeerManager) -> Result<()> {
        let exclude = self.connected_prefixes();
        let mut candidates = peers.candidates(&exclude)?.into_iter();
        while self.slots.len() < self.connection_count {
            let Some((prefix, address)) = candidates.next() else {
                debug!("Out of tunnel candidates ({} live)", self.slots.len());
                break;
            };
            let Some(endpoint) = pick_endpoint(&address) else {
                debug!("Peer {} advertises no usable endpoint", prefix);
                continue;
            };
            let Some(iface) = self.free_interfaces.pop_first() else {
                break;
            };
            match self.spawner.spawn_tunnel(&iface, &endpoint).await {
                Ok(handle) => {
                    info!("Opening tunnel to {} on {} via {}", prefix, iface, endpoint);
                    self.slots.insert(
                        iface,
                        TunnelSlot {
                            prefix,
                            state: SlotState::Connecting,
                            created: Instant::now(),
                            handle,
                        },
                    );
                }
                Err(e) => {
                    warn!("Failed to spawn tunnel to {}: {}", prefix, e);
                    peers.deprioritize(&prefix);
                    self.free_interfaces.insert(iface);
                }
            }
        }
        Ok(())
    }

    /// Consume one event from the subprocess stream.
    pub async fn handle_event(&mut self, event: &TunnelEvent) {
        match event {
            TunnelEvent::InterfaceUp(iface) => {
                if let Some(slot) = self.slots.get_mut(iface) {
                    if slot.state == SlotState::Connecting {
                        info!("Tunnel to {} on {} established", slot.prefix, iface);
                        slot.state = SlotState::Established;
                    }
                }
            }
            TunnelEvent::InterfaceDown(iface) => {
                if self.slots.contains_key(iface) {
                    info!("Tunnel on {} went down", iface);
                    self.teardown(iface).await;
                }
            }
            TunnelEvent::Liveness(_) => {}
        }
    }

    /// Terminate a slot's subprocess and return its interface to the
    /// pool. Tolerates already-dead processes.
    async fn teardown(&mut self, iface: &str) -> Option<TunnelSlot> {
        let mut slot = self.slots.remove(iface)?;
        slot.handle.terminate().await;
        self.free_interfaces.insert(iface.to_string());
        Some(slot)
    }

    /// Terminate every tracked subprocess and release all interfaces.
    /// Idempotent; runs on every shutdown path.
    pub async fn kill_all(&mut self) {
        let ifaces: Vec<String> = self.slots.keys().cloned().collect();
        for iface in ifaces {
            self.teardown(&iface).await;
        }
    }
}

/// Choose the endpoint to dial: the first address entry, with server
/// protocols flipped to their client side.
fn pick_endpoint(address: &str) -> Option<Endpoint> {
    parse_address(address).into_iter().next().map(|ep| Endpoint {
        proto: ep.proto.client_side(),
        ..ep
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PeerCache;
    use crate::registry_client::RegistryClient;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use weftnet_common::wire::PeerEntry;
    use weftnet_common::Error;

    #[derive(Default)]
    struct SpawnLog {
        spawned: Vec<String>,
        terminated: Vec<String>,
    }

    struct FakeSpawner {
        log: Arc<Mutex<SpawnLog>>,
        fail: bool,
    }

    struct FakeHandle {
        iface: String,
        log: Arc<Mutex<SpawnLog>>,
    }

    #[async_trait]
    impl TunnelHandle for FakeHandle {
        async fn terminate(&mut self) {
            self.log.lock().terminated.push(self.iface.clone());
        }
    }

    #[async_trait]
    impl TunnelSpawner for FakeSpawner {
        async fn spawn_tunnel(
            &self,
            iface: &str,
            _endpoint: &Endpoint,
        ) -> Result<Box<dyn TunnelHandle>> {
            if self.fail {
                return Err(Error::SubprocessSpawn("fake".to_string()));
            }
            self.log.lock().spawned.push(iface.to_string());
            Ok(Box::new(FakeHandle {
                iface: iface.to_string(),
                log: self.log.clone(),
            }))
        }
    }

    fn peer_manager(prefixes: &[&str]) -> PeerManager {
        let cache = PeerCache::open_memory().unwrap();
        let entries: Vec<PeerEntry> = prefixes
            .iter()
            .map(|p| PeerEntry {
                prefix: p.to_string(),
                address: "192.0.2.1,1194,udp".to_string(),
            })
            .collect();
        cache.merge(&entries).unwrap();
        PeerManager::new(
            cache,
            RegistryClient::new("http://registry.invalid"),
            Prefix::parse("1111111111111111").unwrap(),
            String::new(),
            None,
            Duration::from_secs(3600),
            200,
        )
    }

    fn manager(count: usize, churn: usize) -> (TunnelManager, Arc<Mutex<SpawnLog>>) {
        let log = Arc::new(Mutex::new(SpawnLog::default()));
        let mgr = TunnelManager::new(
            Box::new(FakeSpawner {
                log: log.clone(),
                fail: false,
            }),
            count,
            churn,
            Duration::from_secs(300),
        );
        (mgr, log)
    }

    fn many_peers(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{:016b}", i)).collect()
    }

    async fn establish_all(mgr: &mut TunnelManager) {
        let ifaces: Vec<String> = mgr.slots.keys().cloned().collect();
        for iface in ifaces {
            mgr.handle_event(&TunnelEvent::InterfaceUp(iface)).await;
        }
    }

    #[tokio::test]
    async fn fills_to_connection_count_and_never_beyond() {
        let peers = many_peers(20);
        let refs: Vec<&str> = peers.iter().map(String::as_str).collect();
        let mut pm = peer_manager(&refs);
        let (mut mgr, _log) = manager(5, 2);

        mgr.refresh(&mut pm).await.unwrap();
        assert_eq!(mgr.slot_count(), 5);
        assert_eq!(mgr.established_count(), 0);

        establish_all(&mut mgr).await;
        assert_eq!(mgr.established_count(), 5);
    }

    #[tokio::test]
    async fn churn_replaces_at_most_refresh_count() {
        let peers = many_peers(20);
        let refs: Vec<&str> = peers.iter().map(String::as_str).collect();
        let mut pm = peer_manager(&refs);
        let (mut mgr, log) = manager(5, 2);

        mgr.refresh(&mut pm).await.unwrap();
        establish_all(&mut mgr).await;
        let before = mgr.connected_prefixes();

        mgr.refresh(&mut pm).await.unwrap();
        establish_all(&mut mgr).await;
        let after = mgr.connected_prefixes();

        assert_eq!(mgr.established_count(), 5);
        assert_eq!(log.lock().terminated.len(), 2);
        let new: Vec<_> = after.difference(&before).collect();
        assert!(new.len() <= 2, "churned {} peers", new.len());
    }

    #[tokio::test]
    async fn unestablished_tunnels_are_torn_down_and_deprioritized() {
        let mut pm = peer_manager(&["0000000000000001"]);
        let (mut mgr, log) = manager(3, 1);

        mgr.refresh(&mut pm).await.unwrap();
        assert_eq!(mgr.slot_count(), 1);

        // Never established: the next tick drops it and skips the peer
        // for this cycle.
        mgr.refresh(&mut pm).await.unwrap();
        assert_eq!(mgr.slot_count(), 0);
        assert_eq!(log.lock().terminated.len(), 1);

        // The cycle after that, the peer is eligible again.
        mgr.refresh(&mut pm).await.unwrap();
        assert_eq!(mgr.slot_count(), 1);
    }

    #[tokio::test]
    async fn down_event_frees_interface_for_reuse() {
        let peers = many_peers(10);
        let refs: Vec<&str> = peers.iter().map(String::as_str).collect();
        let mut pm = peer_manager(&refs);
        let (mut mgr, _log) = manager(2, 1);

        mgr.refresh(&mut pm).await.unwrap();
        establish_all(&mut mgr).await;
        let iface = mgr.slots.keys().next().unwrap().clone();

        mgr.handle_event(&TunnelEvent::InterfaceDown(iface.clone()))
            .await;
        assert_eq!(mgr.slot_count(), 1);
        assert!(mgr.free_interfaces.contains(&iface));

        mgr.refresh(&mut pm).await.unwrap();
        assert_eq!(mgr.slot_count(), 2);
    }

    #[tokio::test]
    async fn kill_all_is_idempotent() {
        let peers = many_peers(10);
        let refs: Vec<&str> = peers.iter().map(String::as_str).collect();
        let mut pm = peer_manager(&refs);
        let (mut mgr, log) = manager(3, 1);

        mgr.refresh(&mut pm).await.unwrap();
        mgr.kill_all().await;
        assert_eq!(mgr.slot_count(), 0);
        assert_eq!(mgr.free_interfaces.len(), 3);
        let killed = log.lock().terminated.len();

        mgr.kill_all().await;
        assert_eq!(log.lock().terminated.len(), killed);
    }

    #[tokio::test]
    async fn spawn_failure_deprioritizes_and_returns_interface() {
        let mut pm = peer_manager(&["0000000000000001"]);
        let log = Arc::new(Mutex::new(SpawnLog::default()));
        let mut mgr = TunnelManager::new(
            Box::new(FakeSpawner {
                log: log.clone(),
                fail: true,
            }),
            2,
            1,
            Duration::from_secs(300),
        );

        mgr.refresh(&mut pm).await.unwrap();
        assert_eq!(mgr.slot_count(), 0);
        assert_eq!(mgr.free_interfaces.len(), 2);
        // Deprioritized for this cycle: no candidates remain.
        assert!(pm.candidates(&HashSet::new()).unwrap().is_empty());
    }
}
