//! Peer addressing and the transport seam.
//!
//! The engine never opens sockets itself. It hands fully formed envelopes to
//! a [`Transport`] implementation which owns the per-peer sessions,
//! reconnecting and keepalive included, and it receives incoming envelopes
//! through [`crate::Raft::deliver`].

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use crate::error::AddressError;
use crate::raft::Envelope;
use crate::ServerId;

/// The port used when an address does not carry one.
pub const DEFAULT_PORT: u16 = 6641;

/// The connection scheme of a peer address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scheme {
    Tcp,
    Ssl,
}

impl Scheme {
    fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Ssl => "ssl",
        }
    }
}

/// A peer address of the form `tcp:HOST[:PORT]` or `ssl:HOST[:PORT]`.
///
/// `HOST` may be an IPv4 address, a bracketed IPv6 address, or a name. The
/// passive (listening) form swaps host and port and prefixes the scheme with
/// `p`, e.g. `tcp:10.0.0.1:6641` listens as `ptcp:6641:10.0.0.1`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    fn host_str(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// The passive form used to listen for incoming sessions.
    pub fn passive(&self) -> String {
        format!("p{}:{}:{}", self.scheme.as_str(), self.port, self.host_str())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.scheme.as_str(), self.host_str(), self.port)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = match s.split_once(':') {
            Some(("tcp", rest)) => (Scheme::Tcp, rest),
            Some(("ssl", rest)) => (Scheme::Ssl, rest),
            _ => return Err(AddressError::UnknownScheme(s.to_string())),
        };

        let (host, port) = if let Some(rest) = rest.strip_prefix('[') {
            // Bracketed IPv6 literal.
            let end = rest.find(']').ok_or_else(|| AddressError::MissingHost(s.to_string()))?;
            let host = &rest[..end];
            let port = match &rest[end + 1..] {
                "" => None,
                p => Some(p.strip_prefix(':').ok_or_else(|| AddressError::InvalidPort(s.to_string()))?),
            };
            (host, port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(AddressError::MissingHost(s.to_string()));
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| AddressError::InvalidPort(s.to_string()))?,
            None => DEFAULT_PORT,
        };

        Ok(Address {
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// The session layer carrying envelopes between this server and its peers.
///
/// Sessions are reliable and message framed per connection, but the engine
/// never assumes delivery: a send to an unreachable peer simply vanishes and
/// the protocol retries through its timers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send to a peer whose server id is already known to the session layer.
    async fn send_to_peer(&self, to: ServerId, env: Envelope) -> Result<()>;

    /// Send to a raw address, used before the server id behind it is known
    /// (joining a cluster, answering a first contact).
    async fn send_to_address(&self, addr: &Address, env: Envelope) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let a: Address = "tcp:10.1.2.3:6641".parse().unwrap();
        assert_eq!(a, Address::new(Scheme::Tcp, "10.1.2.3", 6641));
        assert_eq!(a.to_string(), "tcp:10.1.2.3:6641");
    }

    #[test]
    fn default_port_applies() {
        let a: Address = "ssl:db-0.internal".parse().unwrap();
        assert_eq!(a.scheme, Scheme::Ssl);
        assert_eq!(a.host, "db-0.internal");
        assert_eq!(a.port, DEFAULT_PORT);
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let a: Address = "tcp:[fe80::1]:7000".parse().unwrap();
        assert_eq!(a.host, "fe80::1");
        assert_eq!(a.port, 7000);
        assert_eq!(a.to_string(), "tcp:[fe80::1]:7000");

        let b: Address = "tcp:[::1]".parse().unwrap();
        assert_eq!(b.port, DEFAULT_PORT);
    }

    #[test]
    fn passive_form_reorders() {
        let a: Address = "tcp:10.1.2.3:6641".parse().unwrap();
        assert_eq!(a.passive(), "ptcp:6641:10.1.2.3");
    }

    #[test]
    fn rejects_bad_input() {
        assert!("udp:10.0.0.1".parse::<Address>().is_err());
        assert!("tcp:10.0.0.1:notaport".parse::<Address>().is_err());
        assert!("tcp::6641".parse::<Address>().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let a: Address = "ssl:[::1]:16641".parse().unwrap();
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"ssl:[::1]:16641\"");
        let b: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(a, b);
    }
}
