//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One advertised listener: other nodes connect to us here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortProto {
    pub port: u16,
    pub proto: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Base URL of the registry
    pub registry: String,

    /// State directory (identity files, peer cache, babeld state)
    pub state_dir: PathBuf,

    /// Seconds between peer cache refreshes
    pub peers_db_refresh: u64,

    /// Seconds between tunnel churn cycles
    pub tunnel_refresh: u64,

    /// Number of client tunnels to maintain
    pub connection_count: usize,

    /// Established tunnels replaced per churn cycle
    pub refresh_count: usize,

    /// Hello interval for the routing daemon, in seconds
    pub hello: u64,

    /// Treat all interfaces as wireless for routing
    #[serde(default)]
    pub wireless: bool,

    /// Listeners advertised to other nodes
    pub pp: Vec<PortProto>,

    /// Externally reachable endpoints (`ip,port,proto`); declared to
    /// the registry on every peer refresh when non-empty
    #[serde(default)]
    pub address: Vec<String>,

    /// Extra arguments passed verbatim to every openvpn invocation
    #[serde(default)]
    pub openvpn_args: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            registry: "http://localhost:8078".to_string(),
            state_dir: PathBuf::from("/var/lib/weftnet"),
            peers_db_refresh: 3600,
            tunnel_refresh: 300,
            connection_count: 10,
            refresh_count: 1,
            hello: 15,
            wireless: false,
            pp: vec![
                PortProto {
                    port: 1194,
                    proto: "udp".to_string(),
                },
                PortProto {
                    port: 1194,
                    proto: "tcp-server".to_string(),
                },
            ],
            address: Vec::new(),
            openvpn_args: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file, or defaults if it does not exist
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }
}
