//! Network-tagged endpoint addresses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport family selector.
///
/// Every [`Addr`] carries exactly one network tag; transports validate the
/// tag before listening or dialing, so a TCP address can never be handed to
/// the inproc transport by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// TCP sockets
    Tcp,
    /// Unix domain sockets
    Unix,
    /// UDP, used by the QUIC transport
    Udp,
    /// In-process transport
    Inproc,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
            Self::Udp => "udp",
            Self::Inproc => "inproc",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            "udp" => Ok(Self::Udp),
            "inproc" => Ok(Self::Inproc),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// A network endpoint address: a `(network, string)` pair.
///
/// Addresses are immutable, freely clonable, and compare structurally. The
/// string component is opaque to everything except the owning transport
/// (`"127.0.0.1:4040"` for TCP, a filesystem path for Unix sockets, an
/// arbitrary name such as `"/echo"` for inproc).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    network: Network,
    addr: String,
}

impl Addr {
    pub fn new(network: Network, addr: impl Into<String>) -> Self {
        Self {
            network,
            addr: addr.into(),
        }
    }

    /// TCP address, e.g. `Addr::tcp("127.0.0.1:4040")`.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::new(Network::Tcp, addr)
    }

    /// Unix domain socket address (a filesystem path).
    pub fn unix(addr: impl Into<String>) -> Self {
        Self::new(Network::Unix, addr)
    }

    /// QUIC address (UDP host:port).
    pub fn quic(addr: impl Into<String>) -> Self {
        Self::new(Network::Udp, addr)
    }

    /// In-process address, e.g. `Addr::inproc("/echo")`.
    pub fn inproc(addr: impl Into<String>) -> Self {
        Self::new(Network::Inproc, addr)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn as_str(&self) -> &str {
        &self.addr
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.addr)
    }
}

/// The two endpoints of a connection or stream.
///
/// Streams inherit their connection's pair; the accepting side of an inproc
/// dial sees the dialer's *dialback* address as `remote`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointPair {
    pub local: Addr,
    pub remote: Addr,
}

impl EndpointPair {
    pub fn new(local: Addr, remote: Addr) -> Self {
        Self { local, remote }
    }

    /// The same pair as seen from the other side.
    pub fn flipped(&self) -> Self {
        Self {
            local: self.remote.clone(),
            remote: self.local.clone(),
        }
    }
}

impl fmt::Display for EndpointPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality() {
        assert_eq!(Addr::inproc("/a"), Addr::new(Network::Inproc, "/a"));
        assert_ne!(Addr::inproc("/a"), Addr::inproc("/b"));
        // Same string, different network.
        assert_ne!(Addr::tcp("/a"), Addr::inproc("/a"));
    }

    #[test]
    fn display_forms() {
        assert_eq!(Addr::tcp("127.0.0.1:80").to_string(), "tcp://127.0.0.1:80");
        assert_eq!(Network::Udp.to_string(), "udp");
        assert_eq!("inproc".parse::<Network>().unwrap(), Network::Inproc);
        assert!("ipx".parse::<Network>().is_err());
    }

    #[test]
    fn flipped_swaps_endpoints() {
        let ep = EndpointPair::new(Addr::inproc("/local"), Addr::inproc("/remote"));
        let flipped = ep.flipped();
        assert_eq!(flipped.local, Addr::inproc("/remote"));
        assert_eq!(flipped.remote, Addr::inproc("/local"));
        assert_eq!(flipped.flipped(), ep);
    }
}
