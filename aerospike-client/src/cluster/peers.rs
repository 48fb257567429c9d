//! Peer list parsing and the per-tend staging area for discovered nodes.
//!
//! A `peers-*` info reply looks like
//! `gen,default_port,[[name,tls_name,[host[:port],...]],...]` where IPv6
//! literals are bracketed, e.g. `[2001:db8::1]:3100`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use aerospike_core::{Error, Result};

use super::host::Host;
use super::node::Node;

/// A node advertised by another node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Node name.
    pub node_name: String,
    /// TLS name, when the cluster uses TLS.
    pub tls_name: Option<String>,
    /// Addresses the node can be reached on.
    pub hosts: Vec<Host>,
}

/// Parsed peers reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerList {
    /// Peers generation reported alongside the list.
    pub generation: u32,
    /// Advertised peers.
    pub peers: Vec<Peer>,
}

/// Parses a `peers-clear-std` style reply.
///
/// Host names found in `ip_map` are rewritten to the mapped value.
pub fn parse_peers(reply: &str, ip_map: &HashMap<String, String>) -> Result<PeerList> {
    PeerParser {
        src: reply.trim().as_bytes(),
        pos: 0,
        ip_map,
    }
    .parse()
}

struct PeerParser<'a> {
    src: &'a [u8],
    pos: usize,
    ip_map: &'a HashMap<String, String>,
}

impl PeerParser<'_> {
    fn error(&self, what: &str) -> Error {
        Error::Protocol(format!(
            "invalid peers reply at offset {}: {}: {}",
            self.pos,
            what,
            String::from_utf8_lossy(self.src)
        ))
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected `{}`", byte as char)))
        }
    }

    fn skip(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Reads up to, not including, any of the stop bytes.
    fn token(&mut self, stops: &[u8]) -> &str {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if stops.contains(&b) {
                break;
            }
            self.pos += 1;
        }
        std::str::from_utf8(&self.src[start..self.pos]).unwrap_or_default()
    }

    fn number<T: std::str::FromStr>(&mut self, what: &str) -> Result<T> {
        let parsed = self.token(b",]").parse().ok();
        parsed.ok_or_else(|| self.error(what))
    }

    fn parse(mut self) -> Result<PeerList> {
        let generation = self.number("peers generation")?;
        self.expect(b',')?;
        let default_port: u16 = if self.peek() == Some(b',') {
            3000
        } else {
            self.number("default port")?
        };
        self.expect(b',')?;
        self.expect(b'[')?;

        let mut peers = Vec::new();
        if !self.skip(b']') {
            loop {
                peers.push(self.peer(default_port)?);
                if self.skip(b']') {
                    break;
                }
                self.expect(b',')?;
            }
        }

        Ok(PeerList { generation, peers })
    }

    fn peer(&mut self, default_port: u16) -> Result<Peer> {
        self.expect(b'[')?;
        let node_name = self.token(b",").to_string();
        if node_name.is_empty() {
            return Err(self.error("empty node name"));
        }
        self.expect(b',')?;
        let tls_name = Some(self.token(b",").to_string()).filter(|s| !s.is_empty());
        self.expect(b',')?;
        self.expect(b'[')?;

        let mut hosts = Vec::new();
        if !self.skip(b']') {
            loop {
                let mut host = self.host(default_port)?;
                host.tls_name = tls_name.clone();
                hosts.push(host);
                if self.skip(b']') {
                    break;
                }
                self.expect(b',')?;
            }
        }
        self.expect(b']')?;

        Ok(Peer {
            node_name,
            tls_name,
            hosts,
        })
    }

    fn host(&mut self, default_port: u16) -> Result<Host> {
        let name = if self.skip(b'[') {
            let name = self.token(b"]").to_string();
            self.expect(b']')?;
            name
        } else {
            self.token(b":,]").to_string()
        };
        if name.is_empty() {
            return Err(self.error("empty host"));
        }

        let port = if self.skip(b':') {
            self.number("host port")?
        } else {
            default_port
        };

        let name = self.ip_map.get(&name).cloned().unwrap_or(name);
        Ok(Host::new(name, port))
    }
}

/// Shared state filled in by concurrent node refreshes during one tend.
#[derive(Debug, Default)]
pub struct Peers {
    peers: Mutex<HashMap<String, Peer>>,
    nodes: Mutex<HashMap<String, Arc<Node>>>,
    invalid_hosts: Mutex<HashSet<Host>>,
    refresh_count: AtomicUsize,
    gen_changed: AtomicBool,
}

impl Peers {
    /// Creates an empty staging area.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records peers advertised by a node.
    pub fn add_peers(&self, peers: Vec<Peer>) {
        let mut map = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        for peer in peers {
            map.entry(peer.node_name.clone()).or_insert(peer);
        }
    }

    /// Returns a copy of the advertised peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of distinct advertised peers.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Stages a newly validated node.
    pub fn add_node(&self, node: Arc<Node>) {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.name().to_string(), node);
    }

    /// Returns a staged node by name.
    pub fn node_by_name(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Takes the staged nodes.
    pub fn take_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, node)| node)
            .collect()
    }

    /// Remembers a host that failed validation during this tend.
    pub fn fail(&self, host: Host) {
        self.invalid_hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host);
    }

    /// Number of hosts that failed validation.
    pub fn invalid_count(&self) -> usize {
        self.invalid_hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Counts a node whose peers were refreshed.
    pub fn increment_refresh_count(&self) {
        self.refresh_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of nodes that refreshed successfully.
    pub fn refresh_count(&self) -> usize {
        self.refresh_count.load(Ordering::Acquire)
    }

    /// Restarts the refresh count before peer refresh.
    pub fn reset_refresh_count(&self) {
        self.refresh_count.store(0, Ordering::Release);
    }

    /// Flags that some node reported a new peers generation.
    pub fn set_gen_changed(&self) {
        self.gen_changed.store(true, Ordering::Release);
    }

    /// True when some node reported a new peers generation.
    pub fn gen_changed(&self) -> bool {
        self.gen_changed.load(Ordering::Acquire)
    }
}
