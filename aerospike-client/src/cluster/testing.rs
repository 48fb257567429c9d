//! Test nodes and a mock server for info and admin requests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use aerospike_core::protocol::{
    AdminCommand, AdminField, Frame, ADMIN_HEADER_REMAINING, AS_ADMIN_MESSAGE_TYPE,
    AS_INFO_MESSAGE_TYPE, PARTITIONS,
};
use aerospike_core::ResultCode;

use super::context::ClusterContext;
use super::host::Host;
use super::node::{Features, Node, NodeInfo};
use crate::config::ClientPolicy;

/// Canned info replies.
#[derive(Debug, Clone)]
pub(crate) struct MockInfo {
    pub name: String,
    pub cluster_name: String,
    pub partition_generation: i64,
    pub peers_generation: i64,
    pub peers: String,
    pub replicas: String,
    pub statistics: String,
    pub features: String,
    pub cluster_key: String,
    /// Drop connections instead of answering.
    pub fail: bool,
    /// Answer LOGIN with `InvalidCommand` like servers predating it.
    pub legacy_auth: bool,
    /// TTL handed out with session tokens.
    pub session_ttl: u32,
    /// LOGIN requests received.
    pub logins: u32,
    /// AUTHENTICATE requests received.
    pub authentications: u32,
}

impl Default for MockInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            cluster_name: String::new(),
            partition_generation: 1,
            peers_generation: 1,
            peers: "1,3000,[]".into(),
            replicas: format!("test:0,1,{}", full_bitmap()),
            statistics: "cluster_size=1;migrate_partitions_remaining=0".into(),
            features: "peers;pscans;query-show".into(),
            cluster_key: "9A4C11F0".into(),
            fail: false,
            legacy_auth: false,
            session_ttl: 3600,
            logins: 0,
            authentications: 0,
        }
    }
}

impl MockInfo {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    fn reply(&self, command: &str) -> String {
        match command {
            "node" => self.name.clone(),
            "cluster-name" => self.cluster_name.clone(),
            "partition-generation" => self.partition_generation.to_string(),
            "peers-generation" => self.peers_generation.to_string(),
            "rebalance-generation" => "1".into(),
            "racks:" => format!("ns=test:rack_1={};", self.name),
            "replicas" => self.replicas.clone(),
            "statistics" => self.statistics.clone(),
            "features" => self.features.clone(),
            c if c.starts_with("peers-") => self.peers.clone(),
            c if c.starts_with("cluster-stable:") => self.cluster_key.clone(),
            c if c.starts_with("service-") => String::new(),
            _ => "ERROR::unknown command".into(),
        }
    }

    /// Answers an admin request body.
    fn admin(&mut self, body: &[u8]) -> BytesMut {
        let command = body.get(2).copied().unwrap_or_default();
        let mut fields: Vec<(AdminField, Vec<u8>)> = Vec::new();
        let code = if command == AdminCommand::Login as u8 {
            self.logins += 1;
            if self.legacy_auth {
                ResultCode::InvalidCommand
            } else {
                fields.push((AdminField::SessionToken, format!("token-{}", self.logins).into_bytes()));
                fields.push((AdminField::SessionTtl, self.session_ttl.to_be_bytes().to_vec()));
                ResultCode::Ok
            }
        } else if command == AdminCommand::Authenticate as u8 {
            self.authentications += 1;
            ResultCode::Ok
        } else {
            ResultCode::InvalidCommand
        };

        let mut out = BytesMut::new();
        out.resize(ADMIN_HEADER_REMAINING, 0);
        out[1] = code.value() as u8;
        out[3] = fields.len() as u8;
        for (id, data) in fields {
            out.extend_from_slice(&(data.len() as u32 + 1).to_be_bytes());
            out.extend_from_slice(&[id as u8]);
            out.extend_from_slice(&data);
        }
        out
    }
}

/// Replica bitmap claiming every partition.
pub(crate) fn full_bitmap() -> String {
    bitmap(0..PARTITIONS)
}

/// Replica bitmap claiming `pids`.
pub(crate) fn bitmap(pids: impl Iterator<Item = usize>) -> String {
    let mut bytes = vec![0u8; PARTITIONS / 8];
    for pid in pids {
        bytes[pid >> 3] |= 0x80 >> (pid & 7);
    }
    STANDARD.encode(bytes)
}

/// Answers info and admin requests from a shared [`MockInfo`].
pub(crate) struct InfoServer {
    pub addr: SocketAddr,
    info: Arc<Mutex<MockInfo>>,
}

impl InfoServer {
    pub async fn start(info: MockInfo) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info = Arc::new(Mutex::new(info));
        let shared = Arc::clone(&info);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&shared)));
            }
        });
        Self { addr, info }
    }

    pub fn host(&self) -> Host {
        Host::from(self.addr)
    }

    /// Changes the replies for later requests.
    pub fn update(&self, f: impl FnOnce(&mut MockInfo)) {
        f(&mut self.info.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Current replies and counters.
    pub fn info(&self) -> MockInfo {
        self.info.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

async fn serve(mut stream: TcpStream, info: Arc<Mutex<MockInfo>>) {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let frame = loop {
            match Frame::read_from(&mut buf) {
                Ok(Some(frame)) => break frame,
                Ok(None) => {}
                Err(_) => return,
            }
            match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        };
        let reply = {
            let mut info = info.lock().unwrap_or_else(PoisonError::into_inner);
            if info.fail {
                return;
            }
            match frame.message_type {
                AS_INFO_MESSAGE_TYPE => Frame::info(
                    String::from_utf8_lossy(&frame.body)
                        .split('\n')
                        .filter(|c| !c.is_empty())
                        .map(|c| format!("{}\t{}\n", c, info.reply(c)))
                        .collect::<String>(),
                ),
                AS_ADMIN_MESSAGE_TYPE => Frame::new(AS_ADMIN_MESSAGE_TYPE, info.admin(&frame.body)),
                _ => return,
            }
        };
        let mut out = BytesMut::new();
        reply.write_to(&mut out);
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

pub(crate) fn test_node(name: &str) -> Arc<Node> {
    test_node_with_policy(name, ClientPolicy::default())
}

pub(crate) fn test_node_with_policy(name: &str, policy: ClientPolicy) -> Arc<Node> {
    let address: SocketAddr = ([127, 0, 0, 1], 3000).into();
    node_at(name, address, policy)
}

pub(crate) async fn mock_node(name: &str, info: MockInfo) -> Arc<Node> {
    mock_node_with_policy(name, info, ClientPolicy::default()).await
}

pub(crate) async fn mock_node_with_policy(
    name: &str,
    mut info: MockInfo,
    policy: ClientPolicy,
) -> Arc<Node> {
    if info.name.is_empty() {
        info.name = name.to_string();
    }
    let server = InfoServer::start(info).await;
    node_at(name, server.addr, policy)
}

pub(crate) fn node_at(name: &str, address: SocketAddr, policy: ClientPolicy) -> Arc<Node> {
    let context = Arc::new(ClusterContext::new(policy).unwrap());
    let node = Node::new(
        NodeInfo {
            name: name.to_string(),
            host: Host::from(address),
            address,
            aliases: vec![Host::from(address)],
            features: Features::parse("pscans;query-show"),
            session: None,
            conn: None,
        },
        context,
    );
    node.set_partition_generation(0);
    Arc::new(node)
}
