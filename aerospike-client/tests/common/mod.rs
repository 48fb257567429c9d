//! In-process mock server for integration tests.
//!
//! One [`MockServer`] plays one node. Alone it is a single-node cluster that
//! owns every partition of its namespaces; peers and replica rows can be set
//! to form larger clusters. It answers info requests and data messages
//! against an in-memory store.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use aerospike_client::core::key::partition_id;
use aerospike_client::core::protocol::*;
use aerospike_client::{Client, ClientPolicy, Host, Key, ResultCode, Value};

/// A record held by the mock store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub namespace: String,
    pub set_name: String,
    pub bins: BTreeMap<String, Value>,
    pub generation: u32,
    pub expiration: u32,
}

#[derive(Debug)]
struct State {
    name: String,
    cluster_name: String,
    cluster_key: String,
    namespaces: Vec<String>,
    records: HashMap<[u8; DIGEST_SIZE], StoredRecord>,
    peers: Vec<(String, SocketAddr)>,
    peers_generation: u32,
    partition_generation: u32,
    replica_row: usize,
    replica_count: usize,
    dead: bool,
    regime: u32,
    drop_requests: u32,
    fail_requests: u32,
    fail_code: ResultCode,
    next_cluster_key: Option<String>,
    data_requests: u64,
    compressed_requests: u64,
}

/// Mock single-node cluster bound to an ephemeral port.
pub struct MockServer {
    pub addr: SocketAddr,
    state: Arc<Mutex<State>>,
}

impl MockServer {
    pub async fn start(name: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State {
            name: name.to_string(),
            cluster_name: String::new(),
            cluster_key: "6F1D0A3C".to_string(),
            namespaces: vec!["test".to_string()],
            records: HashMap::new(),
            peers: Vec::new(),
            peers_generation: 1,
            partition_generation: 1,
            replica_row: 0,
            replica_count: 1,
            dead: false,
            regime: 0,
            drop_requests: 0,
            fail_requests: 0,
            fail_code: ResultCode::Ok,
            next_cluster_key: None,
            data_requests: 0,
            compressed_requests: 0,
        }));
        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&shared)));
            }
        });
        Self { addr, state }
    }

    pub fn host(&self) -> Host {
        Host::from(self.addr)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_cluster_name(&self, name: &str) {
        self.state().cluster_name = name.to_string();
    }

    pub fn set_cluster_key(&self, key: &str) {
        self.state().cluster_key = key.to_string();
    }

    pub fn name(&self) -> String {
        self.state().name.clone()
    }

    /// Advertises `peers` under a new peers generation.
    pub fn set_peers(&self, generation: u32, peers: &[&MockServer]) {
        let peers = peers.iter().map(|p| (p.name(), p.addr)).collect();
        let mut state = self.state();
        state.peers = peers;
        state.peers_generation = generation;
    }

    /// Claims every partition in replica `row` of `count` rows under a new
    /// partition generation.
    pub fn set_replica_row(&self, generation: u32, row: usize, count: usize) {
        let mut state = self.state();
        state.replica_row = row;
        state.replica_count = count;
        state.partition_generation = generation;
    }

    /// Closes every connection on its next request, info included.
    pub fn kill(&self) {
        self.state().dead = true;
    }

    /// Closes the connection of the next `count` data requests unanswered.
    pub fn drop_next(&self, count: u32) {
        self.state().drop_requests = count;
    }

    /// Answers the next `count` data requests with `code` alone.
    pub fn fail_next(&self, count: u32, code: ResultCode) {
        let mut state = self.state();
        state.fail_requests = count;
        state.fail_code = code;
    }

    /// Reports namespaces under a strong consistency regime.
    pub fn set_regime(&self, regime: u32) {
        self.state().regime = regime;
    }

    /// Switches the cluster key once the next data request arrives.
    pub fn change_cluster_key_on_next_request(&self, key: &str) {
        self.state().next_cluster_key = Some(key.to_string());
    }

    /// Data requests received so far, dropped ones included.
    pub fn data_requests(&self) -> u64 {
        self.state().data_requests
    }

    /// Data requests that arrived compressed.
    pub fn compressed_requests(&self) -> u64 {
        self.state().compressed_requests
    }

    pub fn insert(&self, key: &Key, bins: &[(&str, Value)]) {
        let record = StoredRecord {
            namespace: key.namespace().to_string(),
            set_name: key.set_name().to_string(),
            bins: bins.iter().map(|(n, v)| (n.to_string(), v.clone())).collect(),
            generation: 1,
            expiration: 0,
        };
        self.state().records.insert(*key.digest(), record);
    }

    pub fn record(&self, key: &Key) -> Option<StoredRecord> {
        self.state().records.get(key.digest()).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }
}

pub fn test_policy() -> ClientPolicy {
    ClientPolicy::builder()
        .timeout(Duration::from_secs(2))
        .tend_interval(Duration::from_millis(50))
        .build()
        .expect("failed to build policy")
}

pub async fn connect(server: &MockServer) -> Client {
    Client::new(test_policy(), vec![server.host()])
        .await
        .expect("failed to connect to mock server")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn key(set_name: &str, user_key: &str) -> Key {
    Key::new("test", set_name, user_key).unwrap()
}

// Connection loop

async fn serve(mut stream: TcpStream, state: Arc<Mutex<State>>) {
    let mut buf = BytesMut::with_capacity(4096);
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

        let compressed = frame.message_type == AS_MSG_TYPE_COMPRESSED;
        let (message_type, body) = if compressed {
            match compression::inflate_body(&frame.body) {
                Ok(inflated) => inflated,
                Err(_) => return,
            }
        } else {
            (frame.message_type, frame.body)
        };

        let replies = {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.dead {
                return;
            }
            match message_type {
                AS_INFO_MESSAGE_TYPE => vec![Frame::info(state.info(&body))],
                AS_MSG_TYPE => {
                    state.data_requests += 1;
                    if compressed {
                        state.compressed_requests += 1;
                    }
                    if let Some(key) = state.next_cluster_key.take() {
                        state.cluster_key = key;
                    }
                    if state.drop_requests > 0 {
                        state.drop_requests -= 1;
                        return;
                    }
                    if state.fail_requests > 0 {
                        state.fail_requests -= 1;
                        let mut out = BytesMut::new();
                        header_only(state.fail_code, 0, 0).write_to(&mut out);
                        single(out)
                    } else {
                        match Request::parse(body.freeze()) {
                            Some(request) => state.handle(request),
                            None => return,
                        }
                    }
                }
                _ => return,
            }
        };

        let mut out = BytesMut::new();
        for reply in replies {
            if compressed {
                let mut packed = BytesMut::new();
                reply.write_to(&mut packed);
                if compression::compress_request(&mut packed).is_err() {
                    return;
                }
                out.put_slice(&packed);
            } else {
                reply.write_to(&mut out);
            }
        }
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

// Request decoding

struct Op {
    op_type: u8,
    name: String,
    value: Value,
}

struct Request {
    header: MessageHeader,
    fields: Vec<(u8, Bytes)>,
    ops: Vec<Op>,
}

impl Request {
    fn parse(mut body: Bytes) -> Option<Self> {
        let header = MessageHeader::read_from(&mut body).ok()?;
        let fields = read_fields(&mut body, header.field_count)?;
        let ops = read_ops(&mut body, header.op_count)?;
        Some(Self { header, fields, ops })
    }

    fn field(&self, field_type: FieldType) -> Option<&Bytes> {
        self.fields
            .iter()
            .find(|(t, _)| *t == field_type as u8)
            .map(|(_, data)| data)
    }

    fn field_str(&self, field_type: FieldType) -> String {
        self.field(field_type)
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .unwrap_or_default()
    }

    /// Applies the filter expression field, if any.
    fn passes(&self, record: &StoredRecord) -> bool {
        match self.field(FieldType::FilterExp) {
            None => true,
            Some(data) => {
                let mut src = data.clone();
                Packed::parse(&mut src).is_some_and(|exp| exp.truthy(record))
            }
        }
    }

    fn digest(&self) -> Option<[u8; DIGEST_SIZE]> {
        let data = self.field(FieldType::DigestRipe)?;
        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(data.get(..DIGEST_SIZE)?);
        Some(digest)
    }
}

fn read_fields(src: &mut Bytes, count: u16) -> Option<Vec<(u8, Bytes)>> {
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if src.remaining() < FIELD_HEADER_SIZE {
            return None;
        }
        let size = src.get_u32() as usize;
        let field_type = src.get_u8();
        if size == 0 || src.remaining() < size - 1 {
            return None;
        }
        fields.push((field_type, src.split_to(size - 1)));
    }
    Some(fields)
}

fn read_ops(src: &mut Bytes, count: u16) -> Option<Vec<Op>> {
    let mut ops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if src.remaining() < OPERATION_HEADER_SIZE {
            return None;
        }
        let size = src.get_u32() as usize;
        let op_type = src.get_u8();
        let particle_type = src.get_u8();
        src.advance(1);
        let name_len = src.get_u8() as usize;
        if size < 4 + name_len || src.remaining() < size - 4 {
            return None;
        }
        let name = String::from_utf8_lossy(&src.split_to(name_len)).into_owned();
        let data = src.split_to(size - 4 - name_len);
        let value = Value::from_particle(particle_type, &data).ok()?;
        ops.push(Op {
            op_type,
            name,
            value,
        });
    }
    Some(ops)
}

// Reply encoding

fn code(result: ResultCode) -> u8 {
    result.value() as u8
}

fn header_only(result: ResultCode, generation: u32, expiration: u32) -> MessageHeader {
    MessageHeader {
        result_code: code(result),
        generation,
        expiration,
        ..MessageHeader::default()
    }
}

fn put_bins<'a>(out: &mut BytesMut, bins: impl Iterator<Item = (&'a String, &'a Value)>) -> u16 {
    let mut count = 0;
    for (name, value) in bins {
        let size = value.estimate_size().unwrap_or(0);
        out.put_u32((4 + name.len() + size) as u32);
        out.put_u8(1);
        out.put_u8(value.particle_type() as u8);
        out.put_u8(0);
        out.put_u8(name.len() as u8);
        out.put_slice(name.as_bytes());
        let _ = value.write_to(out);
        count += 1;
    }
    count
}

fn put_field(out: &mut BytesMut, field_type: FieldType, data: &[u8]) {
    out.put_u32(data.len() as u32 + 1);
    out.put_u8(field_type as u8);
    out.put_slice(data);
}

/// Appends one message with its key fields and selected bins.
fn put_message(
    out: &mut BytesMut,
    mut header: MessageHeader,
    key: Option<(&[u8; DIGEST_SIZE], &StoredRecord)>,
    bins: &[(&String, &Value)],
) {
    let mut rest = BytesMut::new();
    if let Some((digest, record)) = key {
        put_field(&mut rest, FieldType::Namespace, record.namespace.as_bytes());
        if !record.set_name.is_empty() {
            put_field(&mut rest, FieldType::Table, record.set_name.as_bytes());
        }
        put_field(&mut rest, FieldType::DigestRipe, digest);
        header.field_count = if record.set_name.is_empty() { 2 } else { 3 };
    }
    header.op_count = put_bins(&mut rest, bins.iter().copied());
    header.write_to(out);
    out.put_slice(&rest);
}

fn last_message(out: &mut BytesMut, result: ResultCode) {
    MessageHeader {
        info3: INFO3_LAST,
        result_code: code(result),
        ..MessageHeader::default()
    }
    .write_to(out);
}

fn single(body: BytesMut) -> Vec<Frame> {
    vec![Frame::message(body)]
}

/// Bins a read returns given its attributes and requested names.
fn select<'a>(record: &'a StoredRecord, read_attr: u8, names: &[String]) -> Vec<(&'a String, &'a Value)> {
    if read_attr & INFO1_NOBINDATA != 0 {
        return Vec::new();
    }
    if read_attr & INFO1_GET_ALL != 0 || names.is_empty() {
        return record.bins.iter().collect();
    }
    record
        .bins
        .iter()
        .filter(|(name, _)| names.contains(name))
        .collect()
}

// Command handling

impl State {
    fn info(&self, body: &[u8]) -> BytesMut {
        let full = STANDARD.encode(vec![0xFFu8; PARTITIONS / 8]);
        let empty = STANDARD.encode(vec![0u8; PARTITIONS / 8]);
        let bitmaps: Vec<&str> = (0..self.replica_count)
            .map(|row| if row == self.replica_row { full.as_str() } else { empty.as_str() })
            .collect();
        let peers: Vec<String> = self
            .peers
            .iter()
            .map(|(name, addr)| format!("[{},,[{}]]", name, Host::from(*addr)))
            .collect();
        String::from_utf8_lossy(body)
            .split('\n')
            .filter(|c| !c.is_empty())
            .map(|command| {
                let value = match command {
                    "node" => self.name.clone(),
                    "cluster-name" => self.cluster_name.clone(),
                    "partition-generation" => self.partition_generation.to_string(),
                    "peers-generation" => self.peers_generation.to_string(),
                    "rebalance-generation" => "1".to_string(),
                    "features" => "peers;pscans;query-show".to_string(),
                    "replicas" => self
                        .namespaces
                        .iter()
                        .map(|ns| {
                            format!("{}:{},{},{};", ns, self.regime, self.replica_count, bitmaps.join(","))
                        })
                        .collect(),
                    "statistics" => "cluster_size=1;migrate_partitions_remaining=0".to_string(),
                    "namespaces" => self.namespaces.join(";"),
                    c if c.starts_with("peers-") => {
                        format!("{},3000,[{}]", self.peers_generation, peers.join(","))
                    }
                    c if c.starts_with("cluster-stable:") => self.cluster_key.clone(),
                    c if c.starts_with("service-") => String::new(),
                    c if c.starts_with("racks:") => format!("ns=test:rack_1={};", self.name),
                    _ => "ERROR::unknown command".to_string(),
                };
                format!("{}\t{}\n", command, value)
            })
            .collect::<String>()
            .as_bytes()
            .into()
    }

    fn handle(&mut self, request: Request) -> Vec<Frame> {
        let h = request.header;
        if h.info1 & INFO1_BATCH != 0 {
            return self.batch(&request);
        }
        if request.digest().is_none() {
            return if request.field(FieldType::IndexRange).is_some() {
                self.query(&request)
            } else {
                self.scan(&request)
            };
        }
        if request.field(FieldType::UdfPackageName).is_some() {
            return self.udf(&request);
        }
        if h.info2 & INFO2_WRITE != 0 {
            return self.write(&request);
        }
        self.read(&request)
    }

    fn read(&self, request: &Request) -> Vec<Frame> {
        let mut out = BytesMut::new();
        let digest = request.digest().unwrap_or_default();
        match self.records.get(&digest) {
            None => header_only(ResultCode::KeyNotFoundError, 0, 0).write_to(&mut out),
            Some(record) if !request.passes(record) => {
                header_only(ResultCode::FilteredOut, 0, 0).write_to(&mut out)
            }
            Some(record) => {
                let names: Vec<String> = request.ops.iter().map(|op| op.name.clone()).collect();
                let bins = select(record, request.header.info1, &names);
                put_message(
                    &mut out,
                    header_only(ResultCode::Ok, record.generation, record.expiration),
                    None,
                    &bins,
                );
            }
        }
        single(out)
    }

    fn write(&mut self, request: &Request) -> Vec<Frame> {
        let h = request.header;
        let digest = request.digest().unwrap_or_default();
        let mut out = BytesMut::new();
        let existing = self.records.get(&digest).cloned();

        if existing.as_ref().is_some_and(|r| !request.passes(r)) {
            header_only(ResultCode::FilteredOut, 0, 0).write_to(&mut out);
            return single(out);
        }
        if h.info2 & INFO2_DELETE != 0 {
            let result = match self.records.remove(&digest) {
                Some(_) => ResultCode::Ok,
                None => ResultCode::KeyNotFoundError,
            };
            header_only(result, 0, 0).write_to(&mut out);
            return single(out);
        }

        let fail = |out: &mut BytesMut, result: ResultCode| {
            header_only(result, 0, 0).write_to(out);
        };
        if let Some(record) = &existing {
            if !request.passes(record) {
                fail(&mut out, ResultCode::FilteredOut);
                return single(out);
            }
            if h.info2 & INFO2_CREATE_ONLY != 0 {
                fail(&mut out, ResultCode::KeyExistsError);
                return single(out);
            }
            if h.info2 & INFO2_GENERATION != 0 && record.generation != h.generation {
                fail(&mut out, ResultCode::GenerationError);
                return single(out);
            }
            if h.info2 & INFO2_GENERATION_GT != 0 && h.generation <= record.generation {
                fail(&mut out, ResultCode::GenerationError);
                return single(out);
            }
        } else {
            let touch = request.ops.iter().any(|op| op.op_type == 11);
            if h.info3 & (INFO3_UPDATE_ONLY | INFO3_REPLACE_ONLY) != 0 || touch {
                fail(&mut out, ResultCode::KeyNotFoundError);
                return single(out);
            }
        }

        let mut record = existing.unwrap_or_else(|| StoredRecord {
            namespace: request.field_str(FieldType::Namespace),
            set_name: request.field_str(FieldType::Table),
            bins: BTreeMap::new(),
            generation: 0,
            expiration: 0,
        });
        if h.info3 & (INFO3_CREATE_OR_REPLACE | INFO3_REPLACE_ONLY) != 0 {
            record.bins.clear();
        }

        let mut results: Vec<(String, Value)> = Vec::new();
        let mut deleted = false;
        for op in &request.ops {
            match op.op_type {
                1 if op.name.is_empty() => {
                    results.extend(record.bins.iter().map(|(n, v)| (n.clone(), v.clone())))
                }
                1 => {
                    if let Some(value) = record.bins.get(&op.name) {
                        results.push((op.name.clone(), value.clone()));
                    }
                }
                2 if op.value.is_nil() => {
                    record.bins.remove(&op.name);
                }
                2 => {
                    record.bins.insert(op.name.clone(), op.value.clone());
                }
                5 => {
                    let current = record.bins.get(&op.name).cloned().unwrap_or(Value::Int(0));
                    let sum = match (&current, &op.value) {
                        (Value::Int(a), Value::Int(b)) => Value::Int(a + b),
                        (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
                        _ => {
                            fail(&mut out, ResultCode::BinTypeError);
                            return single(out);
                        }
                    };
                    record.bins.insert(op.name.clone(), sum);
                }
                9 | 10 => {
                    let current = record
                        .bins
                        .get(&op.name)
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let Some(piece) = op.value.as_str() else {
                        fail(&mut out, ResultCode::BinTypeError);
                        return single(out);
                    };
                    let joined = if op.op_type == 9 {
                        format!("{}{}", current, piece)
                    } else {
                        format!("{}{}", piece, current)
                    };
                    record.bins.insert(op.name.clone(), Value::String(joined));
                }
                11 => {}
                14 => deleted = true,
                _ => {
                    fail(&mut out, ResultCode::ParameterError);
                    return single(out);
                }
            }
        }

        if h.info1 & INFO1_GET_ALL != 0 {
            results = record.bins.iter().map(|(n, v)| (n.clone(), v.clone())).collect();
        }

        if deleted {
            self.records.remove(&digest);
        } else {
            record.generation += 1;
            record.expiration = h.expiration;
            self.records.insert(digest, record.clone());
        }

        let bins: Vec<(&String, &Value)> = results.iter().map(|(n, v)| (n, v)).collect();
        put_message(
            &mut out,
            header_only(ResultCode::Ok, record.generation, record.expiration),
            None,
            &bins,
        );
        single(out)
    }

    // `echo` returns its first argument; anything else fails like a
    // missing function.
    fn udf(&mut self, request: &Request) -> Vec<Frame> {
        let mut out = BytesMut::new();
        let function = request.field_str(FieldType::UdfFunction);
        let args = request
            .field(FieldType::UdfArglist)
            .and_then(|data| Value::from_particle(ParticleType::List as u8, data).ok())
            .unwrap_or(Value::Nil);

        let (result, name, value) = if function == "echo" {
            let first = args.as_list().and_then(|a| a.first()).cloned().unwrap_or(Value::Nil);
            (ResultCode::Ok, "SUCCESS".to_string(), first)
        } else {
            (
                ResultCode::UdfBadResponse,
                "FAILURE".to_string(),
                Value::String(format!("function not found: {}", function)),
            )
        };
        put_message(&mut out, header_only(result, 1, 0), None, &[(&name, &value)]);
        single(out)
    }

    fn batch(&self, request: &Request) -> Vec<Frame> {
        let field = request
            .field(FieldType::BatchIndex)
            .or_else(|| request.field(FieldType::BatchIndexWithSet))
            .cloned()
            .unwrap_or_default();
        let mut src = field;
        let mut out = BytesMut::new();

        let count = src.get_u32();
        src.advance(1);
        let mut read_attr = 0;
        let mut names: Vec<String> = Vec::new();
        for _ in 0..count {
            let index = src.get_u32();
            let mut digest = [0u8; DIGEST_SIZE];
            src.copy_to_slice(&mut digest);
            if src.get_u8() == 0 {
                read_attr = src.get_u8();
                let field_count = src.get_u16();
                let op_count = src.get_u16();
                let _ = read_fields(&mut src, field_count);
                names = read_ops(&mut src, op_count)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|op| op.name)
                    .collect();
            }

            match self.records.get(&digest) {
                Some(record) if !request.passes(record) => MessageHeader {
                    timeout: index,
                    ..header_only(ResultCode::FilteredOut, 0, 0)
                }
                .write_to(&mut out),
                Some(record) => {
                    let bins = select(record, read_attr, &names);
                    let header = MessageHeader {
                        timeout: index,
                        ..header_only(ResultCode::Ok, record.generation, record.expiration)
                    };
                    put_message(&mut out, header, None, &bins);
                }
                None => MessageHeader {
                    timeout: index,
                    ..header_only(ResultCode::KeyNotFoundError, 0, 0)
                }
                .write_to(&mut out),
            }
        }
        last_message(&mut out, ResultCode::Ok);
        single(out)
    }

    fn matching<'a>(
        &'a self,
        request: &Request,
    ) -> Vec<(&'a [u8; DIGEST_SIZE], &'a StoredRecord)> {
        let namespace = request.field_str(FieldType::Namespace);
        let set_name = request.field_str(FieldType::Table);
        let mut matched: Vec<_> = self
            .records
            .iter()
            .filter(|(_, r)| r.namespace == namespace && (set_name.is_empty() || r.set_name == set_name))
            .filter(|(_, r)| request.passes(r))
            .collect();
        matched.sort_by_key(|(digest, _)| (partition_id(digest), **digest));
        matched
    }

    fn scan(&self, request: &Request) -> Vec<Frame> {
        let pids: Vec<usize> = match request.field(FieldType::PidArray) {
            Some(data) => data
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]) as usize)
                .collect(),
            None => (0..PARTITIONS).collect(),
        };
        let names: Vec<String> = request.ops.iter().map(|op| op.name.clone()).collect();

        let mut records = BytesMut::new();
        for (digest, record) in self.matching(request) {
            if !pids.contains(&partition_id(digest)) {
                continue;
            }
            let bins = select(record, request.header.info1, &names);
            put_message(
                &mut records,
                header_only(ResultCode::Ok, record.generation, record.expiration),
                Some((digest, record)),
                &bins,
            );
        }

        let mut markers = BytesMut::new();
        for pid in pids {
            MessageHeader {
                info3: INFO3_PARTITION_DONE,
                generation: pid as u32,
                ..MessageHeader::default()
            }
            .write_to(&mut markers);
        }
        last_message(&mut markers, ResultCode::Ok);

        let mut frames = Vec::new();
        if !records.is_empty() {
            frames.push(Frame::message(records));
        }
        frames.push(Frame::message(markers));
        frames
    }

    fn query(&self, request: &Request) -> Vec<Frame> {
        let Some(filter) = request.field(FieldType::IndexRange).and_then(|d| RangeFilter::parse(d.clone())) else {
            let mut out = BytesMut::new();
            last_message(&mut out, ResultCode::ParameterError);
            return single(out);
        };
        let mut names: Vec<String> = request.ops.iter().map(|op| op.name.clone()).collect();
        if let Some(mut list) = request.field(FieldType::QueryBinlist).cloned() {
            let count = list.get_u8();
            for _ in 0..count {
                let len = list.get_u8() as usize;
                names.push(String::from_utf8_lossy(&list.split_to(len)).into_owned());
            }
        }

        let mut out = BytesMut::new();
        for (digest, record) in self.matching(request) {
            if !record.bins.get(&filter.bin).is_some_and(|v| filter.matches(v)) {
                continue;
            }
            let bins = select(record, request.header.info1, &names);
            put_message(
                &mut out,
                header_only(ResultCode::Ok, record.generation, record.expiration),
                Some((digest, record)),
                &bins,
            );
        }
        last_message(&mut out, ResultCode::Ok);
        single(out)
    }
}

struct RangeFilter {
    bin: String,
    begin: Value,
    end: Value,
}

impl RangeFilter {
    fn parse(mut data: Bytes) -> Option<Self> {
        let _count = data.get_u8();
        let name_len = data.get_u8() as usize;
        let bin = String::from_utf8_lossy(&data.split_to(name_len)).into_owned();
        let particle_type = data.get_u8();
        let begin_len = data.get_u32() as usize;
        let begin = Value::from_particle(particle_type, &data.split_to(begin_len)).ok()?;
        let end_len = data.get_u32() as usize;
        let end = Value::from_particle(particle_type, &data.split_to(end_len)).ok()?;
        Some(Self { bin, begin, end })
    }

    fn matches(&self, value: &Value) -> bool {
        match (value, &self.begin, &self.end) {
            (Value::List(items), _, _) => items.iter().any(|v| self.matches(v)),
            (Value::Int(v), Value::Int(b), Value::Int(e)) => b <= v && v <= e,
            (v, b, _) => v == b,
        }
    }
}

/// The subset of packed filter expressions the mock evaluates: comparisons
/// of bins with literals combined by `and`, `or` and `not`.
#[derive(Debug)]
enum Packed {
    Int(i64),
    Str(Vec<u8>),
    Array(Vec<Packed>),
}

impl Packed {
    fn parse(src: &mut Bytes) -> Option<Self> {
        if !src.has_remaining() {
            return None;
        }
        let b = src.get_u8();
        Some(match b {
            0x00..=0x7f => Packed::Int(b as i64),
            0xe0..=0xff => Packed::Int(b as i8 as i64),
            0xa0..=0xbf => Packed::Str(src.split_to((b & 0x1f) as usize).to_vec()),
            0xda => {
                let len = src.get_u16() as usize;
                Packed::Str(src.split_to(len).to_vec())
            }
            0x90..=0x9f => {
                let items = (0..(b & 0x0f)).map(|_| Packed::parse(src)).collect::<Option<Vec<_>>>()?;
                Packed::Array(items)
            }
            0xcc => Packed::Int(src.get_u8() as i64),
            0xcd => Packed::Int(src.get_u16() as i64),
            0xce => Packed::Int(src.get_u32() as i64),
            0xcf => Packed::Int(src.get_u64() as i64),
            0xd0 => Packed::Int(src.get_i8() as i64),
            0xd1 => Packed::Int(src.get_i16() as i64),
            0xd2 => Packed::Int(src.get_i32() as i64),
            0xd3 => Packed::Int(src.get_i64()),
            _ => return None,
        })
    }

    fn truthy(&self, record: &StoredRecord) -> bool {
        let Packed::Array(items) = self else {
            return false;
        };
        let Some(Packed::Int(op)) = items.first() else {
            return false;
        };
        let args = &items[1..];
        match op {
            1..=6 => {
                let (Some(left), Some(right)) = (
                    args.first().and_then(|a| a.operand(record)),
                    args.get(1).and_then(|a| a.operand(record)),
                ) else {
                    return false;
                };
                if std::mem::discriminant(&left) != std::mem::discriminant(&right) {
                    return false;
                }
                match (op, left.partial_cmp(&right)) {
                    (1, Some(o)) => o.is_eq(),
                    (2, Some(o)) => o.is_ne(),
                    (3, Some(o)) => o.is_gt(),
                    (4, Some(o)) => o.is_ge(),
                    (5, Some(o)) => o.is_lt(),
                    (6, Some(o)) => o.is_le(),
                    _ => false,
                }
            }
            16 => args.iter().all(|a| a.truthy(record)),
            17 => args.iter().any(|a| a.truthy(record)),
            18 => !args.first().is_some_and(|a| a.truthy(record)),
            _ => false,
        }
    }

    fn operand(&self, record: &StoredRecord) -> Option<Operand> {
        match self {
            Packed::Int(v) => Some(Operand::Int(*v)),
            Packed::Str(s) if s.first() == Some(&(ParticleType::String as u8)) => {
                Some(Operand::Str(String::from_utf8_lossy(&s[1..]).into_owned()))
            }
            Packed::Array(items) => match items.as_slice() {
                [Packed::Int(81), Packed::Int(_), Packed::Str(name)] => {
                    match record.bins.get(&*String::from_utf8_lossy(name))? {
                        Value::Int(v) => Some(Operand::Int(*v)),
                        Value::String(s) => Some(Operand::Str(s.clone())),
                        _ => None,
                    }
                }
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, PartialOrd)]
enum Operand {
    Int(i64),
    Str(String),
}
