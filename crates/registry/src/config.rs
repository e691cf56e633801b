//! Registry configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Port served on both address families
    pub port: u16,

    /// Path to the registry database
    pub db_path: PathBuf,

    /// Path to the CA certificate
    pub ca_path: PathBuf,

    /// Path to the CA private key
    pub key_path: PathBuf,

    /// SMTP host for token delivery; tokens are logged when unset
    pub mailhost: Option<String>,

    /// Sender address for token mail
    pub mail_from: String,

    /// Prefixes (bit-strings) preferred as bootstrap peers
    #[serde(default)]
    pub bootstrap: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            port: 8078,
            db_path: PathBuf::from("/var/lib/weftnet/registry.db"),
            ca_path: PathBuf::from("/etc/weftnet/ca.crt"),
            key_path: PathBuf::from("/etc/weftnet/ca.key"),
            mailhost: None,
            mail_from: "postmaster@weftnet.invalid".to_string(),
            bootstrap: Vec::new(),
        }
    }
}

impl RegistryConfig {
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
