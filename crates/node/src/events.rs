//! Subprocess event channel
//!
//! Every supervised subprocess (tunnel clients/servers, the routing
//! daemon) gets one supervisor task reading its stdout line by line and
//! forwarding structured events into a single ordered channel. The
//! control loop is the only consumer, so all state mutation stays on
//! one task.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStdout;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Event delivered from a subprocess to the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// A tunnel interface came up.
    InterfaceUp(String),
    /// A tunnel interface went down (or its process exited).
    InterfaceDown(String),
    /// Any other line, kept as a liveness hint for the peer manager.
    Liveness(String),
}

/// Parse one output line of the process bound to `iface`.
///
/// Recognized forms are explicit `<iface> up` / `<iface> down` markers
/// (written by up/down hook scripts) and OpenVPN's own completion and
/// restart messages.
pub fn parse_line(iface: &str, line: &str) -> Option<TunnelEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut words = trimmed.split_whitespace();
    if let (Some(first), Some(second)) = (words.next(), words.next()) {
        if first == iface {
            match second {
                "up" => return Some(TunnelEvent::InterfaceUp(iface.to_string())),
                "down" => return Some(TunnelEvent::InterfaceDown(iface.to_string())),
                _ => {}
            }
        }
    }
    if trimmed.contains("Initialization Sequence Completed") {
        return Some(TunnelEvent::InterfaceUp(iface.to_string()));
    }
    if trimmed.contains("Inactivity timeout") || trimmed.contains("Connection reset") {
        return Some(TunnelEvent::InterfaceDown(iface.to_string()));
    }
    Some(TunnelEvent::Liveness(trimmed.to_string()))
}

/// Spawn the supervisor task for one subprocess stdout. Sends a final
/// down event when the stream closes so a dying tunnel is never missed.
pub fn supervise(iface: String, stdout: ChildStdout, tx: UnboundedSender<TunnelEvent>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(ev) = parse_line(&iface, &line) {
                if tx.send(ev).is_err() {
                    return;
                }
            }
        }
        debug!("Event stream from {} closed", iface);
        let _ = tx.send(TunnelEvent::InterfaceDown(iface));
    });
}
