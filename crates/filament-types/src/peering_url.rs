//! Peering URLs.
//!
//! A peering URL names one transport endpoint of a router in the form
//! `scheme://host:port`. The host must be an IP literal; DNS names are not
//! accepted because listeners bind and advertise concrete addresses.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

/// Errors from parsing a peering URL.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeeringUrlError {
    /// The URL is missing the `scheme://` separator.
    #[error("missing scheme in peering URL")]
    MissingScheme,

    /// The host part is not an IP literal.
    #[error("host must be an IP literal, got {0:?}")]
    HostNotIp(String),

    /// The port is missing or not a number.
    #[error("missing or invalid port")]
    BadPort,
}

/// A transport endpoint of a router: scheme plus remote address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeeringUrl {
    scheme: String,
    addr: SocketAddr,
}

impl PeeringUrl {
    /// Create a URL from its parts.
    pub fn new(scheme: &str, addr: SocketAddr) -> Self {
        Self {
            scheme: scheme.to_string(),
            addr,
        }
    }

    /// The transport scheme, e.g. `tcp`.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The socket address the URL points at.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl FromStr for PeeringUrl {
    type Err = PeeringUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or(PeeringUrlError::MissingScheme)?;

        // rsplit: IPv6 literals contain colons, the port comes after the last one.
        let (host, port) = rest.rsplit_once(':').ok_or(PeeringUrlError::BadPort)?;
        let port: u16 = port.parse().map_err(|_| PeeringUrlError::BadPort)?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = host
            .parse()
            .map_err(|_| PeeringUrlError::HostNotIp(host.to_string()))?;

        Ok(Self {
            scheme: scheme.to_string(),
            addr: SocketAddr::new(ip, port),
        })
    }
}

impl std::fmt::Display for PeeringUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.addr)
    }
}
