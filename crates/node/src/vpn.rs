//! OpenVPN subprocess wrappers
//!
//! Builds the openvpn command lines for tunnel clients and the local
//! listening servers, spawns them with supervised stdout, and wraps
//! the child in a handle whose termination tolerates already-dead
//! processes.

use crate::events::{self, TunnelEvent};
use crate::tunnel::{TunnelHandle, TunnelSpawner};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use weftnet_common::wire::{Endpoint, Protocol};
use weftnet_common::{Error, Result};

/// Identity material and shared tunnel options.
#[derive(Clone)]
pub struct VpnOptions {
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub dh_path: PathBuf,
    pub hello_interval: u64,
    /// Extra arguments appended verbatim to every openvpn invocation.
    pub extra_args: Vec<String>,
}

impl VpnOptions {
    fn base_args(&self, iface: &str) -> Vec<String> {
        let mut args = vec![
            "--dev-type".to_string(),
            "tap".to_string(),
            "--dev".to_string(),
            iface.to_string(),
            "--ca".to_string(),
            self.ca_path.display().to_string(),
            "--cert".to_string(),
            self.cert_path.display().to_string(),
            "--key".to_string(),
            self.key_path.display().to_string(),
            "--persist-tun".to_string(),
            "--persist-key".to_string(),
            "--script-security".to_string(),
            "2".to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Arguments for a client tunnel dialing `endpoint`.
    pub fn client_args(&self, iface: &str, endpoint: &Endpoint) -> Vec<String> {
        let mut args = self.base_args(iface);
        args.extend([
            "--nobind".to_string(),
            "--tls-client".to_string(),
            "--remote".to_string(),
            endpoint.ip.to_string(),
            endpoint.port.to_string(),
            endpoint.proto.client_side().as_str().to_string(),
        ]);
        args
    }

    /// Arguments for a listening server on `port`/`proto`. The server
    /// accepts every certificate signed by the network CA, so
    /// duplicate common names must be allowed.
    pub fn server_args(
        &self,
        iface: &str,
        port: u16,
        proto: Protocol,
        max_clients: usize,
    ) -> Vec<String> {
        let mut args = self.base_args(iface);
        args.extend([
            "--tls-server".to_string(),
            "--mode".to_string(),
            "server".to_string(),
            "--duplicate-cn".to_string(),
            "--keepalive".to_string(),
            self.hello_interval.to_string(),
            (self.hello_interval * 4).to_string(),
            "--max-clients".to_string(),
            max_clients.to_string(),
            "--dh".to_string(),
            self.dh_path.display().to_string(),
            "--port".to_string(),
            port.to_string(),
            "--proto".to_string(),
            proto.as_str().to_string(),
        ]);
        args
    }
}

/// A supervised subprocess. Terminate is best-effort: a process that
/// already exited is not an error.
pub struct ProcessHandle {
    child: Child,
}

impl ProcessHandle {
    pub fn new(child: Child) -> Self {
        Self { child }
    }

    /// SIGTERM with a grace period, then SIGKILL.
    pub async fn terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            let grace = Duration::from_secs(5);
            if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
                return;
            }
        }
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

#[async_trait]
impl TunnelHandle for ProcessHandle {
    async fn terminate(&mut self) {
        ProcessHandle::terminate(self).await;
    }
}

fn spawn_supervised(
    program: &str,
    args: &[String],
    iface: &str,
    tx: &UnboundedSender<TunnelEvent>,
) -> Result<ProcessHandle> {
    debug!("Spawning: {} {}", program, args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::SubprocessSpawn(format!("{}: {}", program, e)))?;
    if let Some(stdout) = child.stdout.take() {
        events::supervise(iface.to_string(), stdout, tx.clone());
    }
    Ok(ProcessHandle::new(child))
}

/// Spawns real openvpn client processes for the tunnel manager.
pub struct OpenVpnSpawner {
    options: VpnOptions,
    events: UnboundedSender<TunnelEvent>,
}

impl OpenVpnSpawner {
    pub fn new(options: VpnOptions, events: UnboundedSender<TunnelEvent>) -> Self {
        Self { options, events }
    }
}

#[async_trait]
impl TunnelSpawner for OpenVpnSpawner {
    async fn spawn_tunnel(
        &self,
        iface: &str,
        endpoint: &Endpoint,
    ) -> Result<Box<dyn TunnelHandle>> {
        let args = self.options.client_args(iface, endpoint);
        let handle = spawn_supervised("openvpn", &args, iface, &self.events)?;
        Ok(Box::new(handle))
    }
}

/// Launch one listening server per advertised port/protocol pair.
pub fn spawn_server(
    options: &VpnOptions,
    port: u16,
    proto: Protocol,
    max_clients: usize,
    events: &UnboundedSender<TunnelEvent>,
) -> Result<ProcessHandle> {
    let iface = format!("wns-{}", proto.as_str());
    let args = options.server_args(&iface, port, proto, max_clients);
    spawn_supervised("openvpn", &args, &iface, events)
}

pub fn options_from(
    state_dir: &Path,
    hello_interval: u64,
    extra_args: Vec<String>,
) -> VpnOptions {
    VpnOptions {
        ca_path: state_dir.join("ca.crt"),
        cert_path: state_dir.join("cert.crt"),
        key_path: state_dir.join("node.key"),
        dh_path: state_dir.join("dh.pem"),
        hello_interval,
        extra_args,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> VpnOptions {
        options_from(Path::new("/var/lib/weftnet"), 15, vec![])
    }

    #[test]
    fn client_args_dial_the_client_side_protocol() {
        let endpoint = Endpoint {
            ip: "192.0.2.1".to_string(),
            port: 1194,
            proto: Protocol::TcpServer,
        };
        let args = options().client_args("wn2", &endpoint);
        let joined = args.join(" ");
        assert!(joined.contains("--dev wn2"));
        assert!(joined.contains("--tls-client"));
        assert!(joined.contains("--remote 192.0.2.1 1194 tcp-client"));
        assert!(joined.contains("--ca /var/lib/weftnet/ca.crt"));
    }

    #[test]
    fn server_args_allow_duplicate_common_names() {
        let args = options().server_args("wns-udp", 1194, Protocol::Udp, 10);
        let joined = args.join(" ");
        assert!(joined.contains("--mode server"));
        assert!(joined.contains("--duplicate-cn"));
        assert!(joined.contains("--max-clients 10"));
        assert!(joined.contains("--port 1194"));
        assert!(joined.contains("--proto udp"));
        assert!(joined.contains("--keepalive 15 60"));
    }

    #[test]
    fn extra_args_are_appended() {
        let opts = options_from(
            Path::new("/tmp/s"),
            15,
            vec!["--verb".to_string(), "3".to_string()],
        );
        let endpoint = Endpoint {
            ip: "127.0.0.1".to_string(),
            port: 1194,
            proto: Protocol::Udp,
        };
        assert!(opts.client_args("wn0", &endpoint).join(" ").contains("--verb 3"));
    }
}
