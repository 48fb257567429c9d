//! Seed and peer host addresses.

use std::fmt;
use std::net::SocketAddr;

use aerospike_core::{Error, Result};

/// Host name or IP literal, optional TLS name and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    /// Host name or IP address. IPv6 literals are stored without brackets.
    pub name: String,
    /// Name expected on the node's TLS certificate.
    pub tls_name: Option<String>,
    /// Service port.
    pub port: u16,
}

impl Host {
    /// Creates a host without a TLS name.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            tls_name: None,
            port,
        }
    }

    /// Creates a host with a TLS name.
    pub fn with_tls_name(name: impl Into<String>, tls_name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            tls_name: Some(tls_name.into()),
            port,
        }
    }

    /// Parses a comma separated host list.
    ///
    /// Each entry is `host`, `host:port`, `host:tls_name:port` or
    /// `[ipv6]:port`. Entries without a port use `default_port`.
    pub fn parse_hosts(list: &str, default_port: u16) -> Result<Vec<Host>> {
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| Self::parse(entry, default_port))
            .collect()
    }

    /// Parses a single host entry.
    pub fn parse(entry: &str, default_port: u16) -> Result<Host> {
        let invalid = || Error::InvalidArgument(format!("invalid host `{}`", entry));

        if let Some(rest) = entry.strip_prefix('[') {
            let (addr, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let mut host = Host::new(addr, default_port);
            let tail = match tail.strip_prefix(':') {
                Some(t) => t,
                None if tail.is_empty() => return Ok(host),
                None => return Err(invalid()),
            };
            match tail.split_once(':') {
                Some((tls_name, port)) => {
                    host.tls_name = Some(tls_name.to_string());
                    host.port = port.parse().map_err(|_| invalid())?;
                }
                None => host.port = tail.parse().map_err(|_| invalid())?,
            }
            return Ok(host);
        }

        let parts: Vec<&str> = entry.split(':').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Host::new(*name, default_port)),
            [name, port] if !name.is_empty() => {
                Ok(Host::new(*name, port.parse().map_err(|_| invalid())?))
            }
            [name, tls_name, port] if !name.is_empty() => Ok(Host::with_tls_name(
                *name,
                *tls_name,
                port.parse().map_err(|_| invalid())?,
            )),
            _ => Err(invalid()),
        }
    }

    /// Resolves the host to socket addresses.
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.name.as_str(), self.port))
            .await
            .map_err(|e| Error::Connection(format!("failed to resolve {}: {}", self, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::Connection(format!("{} resolved to no address", self)));
        }
        Ok(addrs)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.contains(':') {
            write!(f, "[{}]:{}", self.name, self.port)
        } else {
            write!(f, "{}:{}", self.name, self.port)
        }
    }
}

impl From<SocketAddr> for Host {
    fn from(addr: SocketAddr) -> Self {
        Host::new(addr.ip().to_string(), addr.port())
    }
}
