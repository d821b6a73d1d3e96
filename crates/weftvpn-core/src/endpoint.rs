//! Peer endpoints and transport addresses

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Default secure channel service port
pub const DEFAULT_PORT: u16 = 12000;

/// A resolved transport address (IP family, address bytes, UDP port)
///
/// Unlike `SocketAddr`, equality and hashing ignore the IPv6 flow label
/// and scope id: two addresses naming the same (family, bytes, port) are
/// the same peer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress {
    addr: SocketAddr,
}

impl PeerAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            addr: SocketAddr::new(ip, port),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.addr.ip() == other.addr.ip() && self.addr.port() == other.addr.port()
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.ip().hash(state);
        self.addr.port().hash(state);
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl FromStr for PeerAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = s
            .parse()
            .map_err(|_| CoreError::InvalidEndpoint(s.to_string()))?;
        Ok(Self { addr })
    }
}

/// A user-supplied peer locator
///
/// Either a literal transport address or a hostname to resolve. A missing
/// port means the default secure channel service port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    /// A literal address, resolving to itself
    Address(PeerAddress),
    /// A hostname requiring DNS resolution
    Host { name: String, port: Option<u16> },
}

impl Endpoint {
    pub fn host(name: impl Into<String>, port: Option<u16>) -> Self {
        Self::Host {
            name: name.into(),
            port,
        }
    }

    /// The port to use, defaulting to the secure channel service port
    pub fn port_or_default(&self) -> u16 {
        match self {
            Self::Address(addr) => addr.port(),
            Self::Host { port, .. } => port.unwrap_or(DEFAULT_PORT),
        }
    }
}

impl From<PeerAddress> for Endpoint {
    fn from(addr: PeerAddress) -> Self {
        Self::Address(addr)
    }
}

impl FromStr for Endpoint {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(CoreError::InvalidEndpoint(s.to_string()));
        }

        // Literal with port ("203.0.113.7:12000", "[2001:db8::1]:12000")
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Address(addr.into()));
        }

        // Bare literal ("203.0.113.7", "2001:db8::1")
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Self::Address(PeerAddress::new(ip, DEFAULT_PORT)));
        }

        // Hostname with optional port ("peer.example:12000", "peer.example")
        match s.rsplit_once(':') {
            Some((name, port)) if !name.is_empty() && !name.contains(':') => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| CoreError::InvalidEndpoint(s.to_string()))?;
                Ok(Self::host(name, Some(port)))
            }
            None => Ok(Self::host(s, None)),
            Some(_) => Err(CoreError::InvalidEndpoint(s.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(addr) => write!(f, "{addr}"),
            Self::Host { name, port: Some(port) } => write!(f, "{name}:{port}"),
            Self::Host { name, port: None } => write!(f, "{name}"),
        }
    }
}
