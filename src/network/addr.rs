//! Peer addresses as they appear in configuration.
//!
//! Two forms are accepted:
//! - `host:port`
//! - `/ip4/<ip>/tcp/<port>[/p2p/<peer id>]` (also `/ip6/` and `/dns4/`, `/dns6/`, `/dns/`)

use crate::identity::PeerId;
use multiaddr::{Multiaddr, Protocol};
use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
    pub peer_id: Option<PeerId>,
}

impl PeerAddr {
    /// `host:port` string suitable for `TcpStream::connect`.
    pub fn dial_target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Only TCP over an IP or DNS host is dialable; anything else (ws, quic,
    /// circuit relays) is rejected.
    pub fn from_multiaddr(addr: &Multiaddr) -> Result<Self, String> {
        let mut host = None;
        let mut port = None;
        let mut peer_id = None;

        for protocol in addr.iter() {
            match protocol {
                Protocol::Ip4(ip) => host = Some(ip.to_string()),
                Protocol::Ip6(ip) => host = Some(ip.to_string()),
                Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
                    host = Some(name.into_owned())
                }
                Protocol::Tcp(p) => port = Some(p),
                Protocol::P2p(id) => {
                    let peer = PeerId::from_multihash(&id.to_bytes()).map_err(|e| e.to_string())?;
                    peer_id = Some(peer);
                }
                other => return Err(format!("unsupported protocol {} in {}", other, addr)),
            }
        }

        Ok(Self {
            host: host.ok_or("multiaddr has no host")?,
            port: port.ok_or("multiaddr has no /tcp port")?,
            peer_id,
        })
    }

    /// The transport part (`/ip4|ip6|dns/<host>/tcp/<port>`).
    pub fn to_multiaddr(&self) -> Multiaddr {
        let mut addr = Multiaddr::empty();
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => addr.push(Protocol::Ip4(ip)),
            Ok(IpAddr::V6(ip)) => addr.push(Protocol::Ip6(ip)),
            Err(_) => addr.push(Protocol::Dns(Cow::Borrowed(self.host.as_str()))),
        }
        addr.push(Protocol::Tcp(self.port));
        addr
    }
}

impl FromStr for PeerAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with('/') {
            let addr: Multiaddr = s
                .parse()
                .map_err(|e| format!("bad multiaddr {}: {}", s, e))?;
            return Self::from_multiaddr(&addr);
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("address {} has no port", s))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("bad port in {}: {}", s, e))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("address {} has no host", s));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            peer_id: None,
        })
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_multiaddr())?;
        if let Some(peer) = &self.peer_id {
            write!(f, "/p2p/{}", peer)?;
        }
        Ok(())
    }
}
