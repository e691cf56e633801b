//! Wire types for the registry RPC surface
//!
//! The registry speaks JSON over HTTP. Peer addresses travel as opaque
//! strings of `ip,port,proto` endpoints joined by `;`, the format the
//! tunnel layer understands.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub token: String,
    pub csr_pem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateReply {
    pub cert_pem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclareRequest {
    /// Externally reachable endpoints, `ip,port,proto` joined by `;`.
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclareReply {
    pub registered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub prefix: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerListReply {
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapReply {
    /// Peer record encrypted under the client certificate, base64.
    pub blob: String,
}

/// Tunnel transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Udp,
    TcpClient,
    TcpServer,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::TcpClient => "tcp-client",
            Protocol::TcpServer => "tcp-server",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "udp" => Ok(Protocol::Udp),
            "tcp-client" => Ok(Protocol::TcpClient),
            "tcp-server" => Ok(Protocol::TcpServer),
            _ => Err(Error::InvalidAddress(format!("unknown protocol {}", s))),
        }
    }

    /// The client-side protocol matching a server listener.
    pub fn client_side(&self) -> Self {
        match self {
            Protocol::TcpServer => Protocol::TcpClient,
            p => *p,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reachable endpoint of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
    pub proto: Protocol,
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self> {
        let mut it = s.split(',');
        let (ip, port, proto) = match (it.next(), it.next(), it.next(), it.next()) {
            (Some(ip), Some(port), Some(proto), None) => (ip, port, proto),
            _ => return Err(Error::InvalidAddress(s.to_string())),
        };
        Ok(Endpoint {
            ip: ip.to_string(),
            port: port
                .parse()
                .map_err(|_| Error::InvalidAddress(s.to_string()))?,
            proto: Protocol::parse(proto)?,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.ip, self.port, self.proto)
    }
}

/// Parse a `;`-joined endpoint list, skipping malformed entries.
pub fn parse_address(s: &str) -> Vec<Endpoint> {
    s.split(';')
        .filter(|part| !part.is_empty())
        .filter_map(|part| Endpoint::parse(part).ok())
        .collect()
}

/// Join endpoints into the on-wire address string.
pub fn format_address(endpoints: &[Endpoint]) -> String {
    endpoints
        .iter()
        .map(Endpoint::to_string)
        .collect::<Vec<_>>()
        .join(";")
}
