//! Weftnet node
//!
//! Joins a certificate-addressed IPv6 mesh: registers an identity with
//! the registry, keeps a bounded churned set of encrypted tunnels to
//! random peers and lets the routing daemon compute routes over them.

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use weftnet_common::crypto::{self, CaInfo};
use weftnet_common::wire::Protocol;
use weftnet_common::{Error, Result};

mod cache;
mod config;
mod events;
mod peer_manager;
mod registry_client;
mod router;
mod tunnel;
mod vpn;

use cache::PeerCache;
use config::NodeConfig;
use events::TunnelEvent;
use peer_manager::PeerManager;
use registry_client::RegistryClient;
use tunnel::TunnelManager;
use vpn::OpenVpnSpawner;

#[derive(Parser)]
#[command(name = "weftnet-node")]
#[command(about = "Weftnet node - mesh VPN tunnel orchestration")]
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
    /// Obtain an identity from the registry
    Register {
        /// Base URL of the registry
        #[arg(long)]
        registry: String,

        /// Email the enrolment token is sent to
        #[arg(long)]
        email: String,

        /// Enrolment token received by mail; without it, one is
        /// requested and the command must be re-run
        #[arg(long)]
        token: Option<String>,

        /// State directory for the identity files
        #[arg(short, long, default_value = "/var/lib/weftnet")]
        state: PathBuf,
    },

    /// Run the node
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Base URL of the registry
        #[arg(long)]
        registry: Option<String>,

        /// State directory
        #[arg(short, long)]
        state: Option<PathBuf>,

        /// Number of client tunnels to maintain
        #[arg(long)]
        connection_count: Option<usize>,

        /// Treat all interfaces as wireless for routing
        #[arg(short, long)]
        wireless: bool,
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

    info!("Weftnet node v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Register {
            registry,
            email,
            token,
            state,
        } => register(&registry, &email, token.as_deref(), &state).await?,
        Command::Run {
            config,
            registry,
            state,
            connection_count,
            wireless,
        } => {
            let mut cfg = match config {
                Some(path) => NodeConfig::load(&path)?,
                None => NodeConfig::default(),
            };
            if let Some(registry) = registry {
                cfg.registry = registry;
            }
            if let Some(state) = state {
                cfg.state_dir = state;
            }
            if let Some(count) = connection_count {
                cfg.connection_count = count;
            }
            if wireless {
                cfg.wireless = true;
            }

            if let Err(e) = run(&cfg).await {
                if let Error::PersistenceCorruption(detail) = &e {
                    error!("Peer cache corrupted ({}), restarting fresh", detail);
                    let db = cfg.state_dir.join("peers.db");
                    let _ = std::fs::rename(&db, db.with_extension("db.bak"));
                    let mut args = std::env::args();
                    let argv0 = args.next().unwrap_or_else(|| "weftnet-node".to_string());
                    let exec_err = std::process::Command::new(argv0).args(args).exec();
                    return Err(anyhow!("re-exec failed: {}", exec_err));
                }
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Request a token, or trade a token for a signed certificate. The
/// private key never leaves the state directory.
async fn register(
    registry: &str,
    email: &str,
    token: Option<&str>,
    state: &Path,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(state)?;
    let client = RegistryClient::new(registry);

    let key_path = state.join("node.key");
    let key_pem = if key_path.exists() {
        std::fs::read_to_string(&key_path)?
    } else {
        let key_pem = crypto::generate_node_key()?;
        std::fs::write(&key_path, &key_pem)?;
        info!("Generated node key at {:?}", key_path);
        key_pem
    };

    let Some(token) = token else {
        client.request_token(email).await?;
        info!("Token requested; check {} and re-run with --token", email);
        return Ok(());
    };

    let ca_pem = client.get_ca().await?;
    let ca = CaInfo::parse(&ca_pem)?;
    std::fs::write(state.join("ca.crt"), &ca_pem)?;

    let csr_pem = crypto::make_csr(&key_pem, email)?;
    let cert_pem = client.request_certificate(token, &csr_pem).await?;
    let prefix = crypto::cert_prefix(&cert_pem)?;
    std::fs::write(state.join("cert.crt"), &cert_pem)?;

    let address = ca.network.address_of(&prefix)?;
    info!("Registered in {} with address {}", ca.network, address);
    Ok(())
}

async fn run(cfg: &NodeConfig) -> Result<()> {
    let state = cfg.state_dir.as_path();
    let ca_pem = std::fs::read_to_string(state.join("ca.crt"))?;
    let cert_pem = std::fs::read_to_string(state.join("cert.crt"))?;
    let key_pem = std::fs::read_to_string(state.join("node.key"))?;

    let ca = CaInfo::parse(&ca_pem)?;
    let prefix = crypto::cert_prefix(&cert_pem)?;
    let internal_ip = ca.network.address_of(&prefix)?;
    let subnet_len = ca.network.len() + prefix.len();
    info!(
        "Joining {} as {} (address {})",
        ca.network, prefix, internal_ip
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let vpn_options = vpn::options_from(state, cfg.hello, cfg.openvpn_args.clone());

    let mut tunnels = TunnelManager::new(
        Box::new(OpenVpnSpawner::new(vpn_options.clone(), tx.clone())),
        cfg.connection_count,
        cfg.refresh_count,
        Duration::from_secs(cfg.tunnel_refresh),
    );

    let mut interfaces = tunnels.pool_interfaces();
    let mut servers = Vec::new();
    for pp in &cfg.pp {
        let proto = Protocol::parse(&pp.proto)?;
        interfaces.push(format!("wns-{}", proto.as_str()));
        servers.push(vpn::spawn_server(
            &vpn_options,
            pp.port,
            proto,
            cfg.connection_count,
            &tx,
        )?);
    }

    let router_options = router::RouterOptions {
        hello_interval: cfg.hello,
        state_path: state.join("babeld.state"),
        wireless: cfg.wireless,
        redistribute: format!("{}/{}", internal_ip, subnet_len),
    };
    let mut router = router::spawn_router(&router_options, &interfaces, &tx)?;

    let advertised = if cfg.address.is_empty() {
        None
    } else {
        Some(cfg.address.join(";"))
    };
    let cache = PeerCache::open(state.join("peers.db"))?;
    let mut peers = PeerManager::new(
        cache,
        RegistryClient::new(&cfg.registry),
        prefix,
        key_pem,
        advertised,
        Duration::from_secs(cfg.peers_db_refresh),
        200,
    );

    if let Err(e) = peers.bootstrap().await {
        warn!("Bootstrap failed: {}", e);
    }

    let result = control_loop(&mut peers, &mut tunnels, rx).await;

    tunnels.kill_all().await;
    router.terminate().await;
    for mut server in servers {
        server.terminate().await;
    }
    result
}

/// Single-task control loop: subprocess events, periodic refreshes and
/// shutdown all funnel through here, so no state needs locking.
async fn control_loop(
    peers: &mut PeerManager,
    tunnels: &mut TunnelManager,
    mut rx: UnboundedReceiver<TunnelEvent>,
) -> Result<()> {
    peers.refresh().await?;
    tunnels.refresh(peers).await?;

    loop {
        let deadline = peers.next_refresh.min(tunnels.next_refresh);
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                return Ok(());
            }
            event = rx.recv() => {
                let Some(event) = event else { return Ok(()) };
                peers.handle_message(&event)?;
                tunnels.handle_event(&event).await;
            }
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let now = Instant::now();
        if now >= peers.next_refresh {
            peers.refresh().await?;
        }
        if now >= tunnels.next_refresh {
            tunnels.refresh(peers).await?;
        }
    }
}
