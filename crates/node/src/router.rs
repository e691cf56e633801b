//! Routing daemon wrapper
//!
//! Runs one babeld over the pooled tunnel interfaces plus the local
//! listener interfaces. Route computation is entirely babeld's job;
//! this module only builds its command line and supervises the
//! process.

use crate::events::TunnelEvent;
use crate::vpn::ProcessHandle;
use crate::{events, vpn};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use weftnet_common::{Error, Result};

pub struct RouterOptions {
    pub hello_interval: u64,
    pub state_path: PathBuf,
    pub wireless: bool,
    /// Local subnet announced into the mesh, `ip/plen`.
    pub redistribute: String,
}

pub fn build_args(options: &RouterOptions, interfaces: &[String]) -> Vec<String> {
    let mut args = vec![
        "-h".to_string(),
        options.hello_interval.to_string(),
        "-H".to_string(),
        options.hello_interval.to_string(),
        "-S".to_string(),
        options.state_path.display().to_string(),
        "-C".to_string(),
        format!("redistribute local ip {}", options.redistribute),
        "-C".to_string(),
        "redistribute local deny".to_string(),
        "-s".to_string(),
    ];
    if options.wireless {
        args.push("-w".to_string());
    }
    args.extend(interfaces.iter().cloned());
    args
}

pub fn spawn_router(
    options: &RouterOptions,
    interfaces: &[String],
    events: &UnboundedSender<TunnelEvent>,
) -> Result<ProcessHandle> {
    let args = build_args(options, interfaces);
    debug!("Spawning: babeld {}", args.join(" "));
    let mut child = Command::new("babeld")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::SubprocessSpawn(format!("babeld: {}", e)))?;
    if let Some(stdout) = child.stdout.take() {
        events::supervise("babeld".to_string(), stdout, events.clone());
    }
    Ok(vpn::ProcessHandle::new(child))
}
