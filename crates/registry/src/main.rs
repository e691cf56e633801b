//! Weftnet registry
//!
//! Hands out IPv6 sub-prefixes and X.509 identities to joining nodes
//! and runs the peer discovery directory.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use weftnet_common::Network;

mod allocator;
mod config;
mod db;
mod http;
mod issuer;
mod mailer;
mod peers;
mod service;

use config::RegistryConfig;

#[derive(Parser)]
#[command(name = "weftnet-registry")]
#[command(about = "Weftnet registry - prefix allocation, certificates and peer discovery")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a CA whose serial number encodes the managed network
    Init {
        /// Managed network, e.g. 2001:db8:42::/48
        #[arg(long)]
        prefix: ipnetwork::Ipv6Network,

        /// Where to write the CA certificate
        #[arg(long, default_value = "/etc/weftnet/ca.crt")]
        ca: PathBuf,

        /// Where to write the CA private key
        #[arg(long, default_value = "/etc/weftnet/ca.key")]
        key: PathBuf,

        /// CA subject common name
        #[arg(long, default_value = "weftnet registry")]
        common_name: String,
    },

    /// Serve the registry
    Serve {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (both address families)
        #[arg(short, long)]
        port: Option<u16>,

        /// Path to the registry database
        #[arg(long)]
        db: Option<PathBuf>,

        /// Path to the CA certificate
        #[arg(long)]
        ca: Option<PathBuf>,

        /// Path to the CA private key
        #[arg(long)]
        key: Option<PathBuf>,

        /// SMTP host for token delivery
        #[arg(long)]
        mailhost: Option<String>,

        /// Prefix (bit-string) to prefer as bootstrap peer; repeatable
        #[arg(long)]
        bootstrap: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    info!("Weftnet registry v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Init {
            prefix,
            ca,
            key,
            common_name,
        } => {
            let network = Network::from_cidr(prefix)?;
            let (cert_pem, key_pem) = weftnet_common::crypto::generate_ca(&network, &common_name)?;
            if let Some(parent) = ca.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&ca, cert_pem)?;
            std::fs::write(&key, key_pem)?;
            info!("Wrote CA for {} to {:?} (key: {:?})", network, ca, key);
        }
        Command::Serve {
            config,
            port,
            db,
            ca,
            key,
            mailhost,
            bootstrap,
        } => {
            let mut cfg = match config {
                Some(path) => RegistryConfig::load(&path)?,
                None => RegistryConfig::default(),
            };
            if let Some(port) = port {
                cfg.port = port;
            }
            if let Some(db) = db {
                cfg.db_path = db;
            }
            if let Some(ca) = ca {
                cfg.ca_path = ca;
            }
            if let Some(key) = key {
                cfg.key_path = key;
            }
            if mailhost.is_some() {
                cfg.mailhost = mailhost;
            }
            if !bootstrap.is_empty() {
                cfg.bootstrap = bootstrap;
            }

            let service = service::RegistryService::open(&cfg)?;
            http::serve(service, cfg.port).await?;
        }
    }

    Ok(())
}
