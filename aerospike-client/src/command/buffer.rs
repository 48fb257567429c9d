//! Request encoding and reply decoding shared by every command.
//!
//! Requests are built in two passes: an [`Estimate`] walks the inputs to
//! validate them and size the buffer, then a [`RequestWriter`] fills the
//! connection's buffer. Replies are decoded from the body of a frame.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use aerospike_core::bin::validate_bin_name;
use aerospike_core::protocol::*;
use aerospike_core::{Bin, Error, Key, Operation, OperationType, Result, Value};

use crate::policy::{
    BasePolicy, CommitLevel, GenerationPolicy, ReadModeAP, ReadModeSC, RecordExistsAction,
    WritePolicy,
};

/// Running size and field count of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    /// Bytes needed, proto header included.
    pub size: usize,
    /// Fields counted so far.
    pub fields: u16,
}

impl Default for Estimate {
    fn default() -> Self {
        Self::new()
    }
}

impl Estimate {
    /// Starts with the proto and message headers.
    pub fn new() -> Self {
        Self {
            size: MSG_TOTAL_HEADER_SIZE,
            fields: 0,
        }
    }

    /// Counts one field carrying `len` bytes.
    pub fn field(&mut self, len: usize) {
        self.size += FIELD_HEADER_SIZE + len;
        self.fields += 1;
    }

    /// Counts the namespace, set, digest and optionally user key fields.
    pub fn key(&mut self, key: &Key, send_key: bool) -> Result<()> {
        if !key.namespace().is_empty() {
            self.field(key.namespace().len());
        }
        if !key.set_name().is_empty() {
            self.field(key.set_name().len());
        }
        self.field(DIGEST_SIZE);
        if send_key {
            if let Some(user_key) = key.user_key() {
                self.field(user_key.estimate_size()? + 1);
            }
        }
        Ok(())
    }

    /// Packs the policy's filter expression and counts its field.
    ///
    /// The packed bytes go to [`RequestWriter::filter`].
    pub fn filter(&mut self, policy: &BasePolicy) -> Result<Option<Bytes>> {
        let Some(exp) = &policy.filter_expression else {
            return Ok(None);
        };
        let packed = exp.pack()?;
        self.field(packed.len());
        Ok(Some(packed))
    }

    /// Counts an operation.
    pub fn operation(&mut self, op: &Operation) -> Result<()> {
        self.size += op.estimate_size()?;
        Ok(())
    }

    /// Counts a bin written with a value.
    pub fn bin(&mut self, bin: &Bin) -> Result<()> {
        validate_bin_name(&bin.name)?;
        self.size += OPERATION_HEADER_SIZE + bin.name.len() + bin.value.estimate_size()?;
        Ok(())
    }

    /// Counts a read of one bin.
    pub fn bin_name(&mut self, name: &str) -> Result<()> {
        validate_bin_name(name)?;
        self.size += OPERATION_HEADER_SIZE + name.len();
        Ok(())
    }
}

/// Fills a request buffer.
///
/// The proto header is reserved by [`RequestWriter::begin`] and patched by
/// [`RequestWriter::finish`] once the length is known.
#[derive(Debug)]
pub struct RequestWriter<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> RequestWriter<'a> {
    /// Clears `buf` and reserves room for the estimated request plus the
    /// head room compression needs.
    pub fn begin(buf: &'a mut BytesMut, estimate: &Estimate) -> Self {
        buf.clear();
        buf.reserve(estimate.size + MSG_HEADER_PAD + ZLIB_HEADER_PAD);
        buf.put_u64(0);
        Self { buf }
    }

    /// Writes the message header for reads and other non-write requests.
    pub fn header(
        &mut self,
        policy: &BasePolicy,
        read_attr: u8,
        write_attr: u8,
        field_count: u16,
        op_count: u16,
    ) {
        let (read_attr, info3) = read_attributes(policy, read_attr, 0);
        MessageHeader {
            info1: read_attr,
            info2: write_attr,
            info3,
            field_count,
            op_count,
            ..MessageHeader::default()
        }
        .write_to(self.buf);
    }

    /// Writes the message header for writes, applying the record-exists,
    /// generation, commit level and expiration settings.
    pub fn write_header(
        &mut self,
        policy: &WritePolicy,
        read_attr: u8,
        write_attr: u8,
        field_count: u16,
        op_count: u16,
    ) {
        let mut write_attr = write_attr;
        let mut info3 = 0;
        match policy.record_exists_action {
            RecordExistsAction::Update => {}
            RecordExistsAction::UpdateOnly => info3 |= INFO3_UPDATE_ONLY,
            RecordExistsAction::Replace => info3 |= INFO3_CREATE_OR_REPLACE,
            RecordExistsAction::ReplaceOnly => info3 |= INFO3_REPLACE_ONLY,
            RecordExistsAction::CreateOnly => write_attr |= INFO2_CREATE_ONLY,
        }

        let generation = match policy.generation_policy {
            GenerationPolicy::None => 0,
            GenerationPolicy::ExpectGenEqual => {
                write_attr |= INFO2_GENERATION;
                policy.generation
            }
            GenerationPolicy::ExpectGenGreater => {
                write_attr |= INFO2_GENERATION_GT;
                policy.generation
            }
        };

        if policy.commit_level == CommitLevel::CommitMaster {
            info3 |= INFO3_COMMIT_MASTER;
        }
        if policy.durable_delete {
            write_attr |= INFO2_DURABLE_DELETE;
        }

        let (read_attr, info3) = read_attributes(&policy.base, read_attr, info3);
        MessageHeader {
            info1: read_attr,
            info2: write_attr,
            info3,
            generation,
            expiration: policy.expiration.value(),
            field_count,
            op_count,
            ..MessageHeader::default()
        }
        .write_to(self.buf);
    }

    /// Writes the key fields.
    pub fn key(&mut self, key: &Key, send_key: bool) -> Result<()> {
        if !key.namespace().is_empty() {
            self.field_str(key.namespace(), FieldType::Namespace);
        }
        if !key.set_name().is_empty() {
            self.field_str(key.set_name(), FieldType::Table);
        }
        self.field_bytes(key.digest(), FieldType::DigestRipe);
        if send_key {
            if let Some(user_key) = key.user_key() {
                self.field_header(user_key.estimate_size()? + 1, FieldType::Key);
                self.buf.put_u8(user_key.particle_type() as u8);
                user_key.write_to(&mut *self.buf)?;
            }
        }
        Ok(())
    }

    /// Writes a field header for `size` bytes of payload.
    pub fn field_header(&mut self, size: usize, field_type: FieldType) {
        self.buf.put_u32((size + 1) as u32);
        self.buf.put_u8(field_type as u8);
    }

    /// Writes a string field.
    pub fn field_str(&mut self, value: &str, field_type: FieldType) {
        self.field_bytes(value.as_bytes(), field_type);
    }

    /// Writes a byte field.
    pub fn field_bytes(&mut self, value: &[u8], field_type: FieldType) {
        self.field_header(value.len(), field_type);
        self.buf.put_slice(value);
    }

    /// Writes a 4-byte integer field.
    pub fn field_u32(&mut self, value: u32, field_type: FieldType) {
        self.field_header(4, field_type);
        self.buf.put_u32(value);
    }

    /// Writes an 8-byte integer field.
    pub fn field_u64(&mut self, value: u64, field_type: FieldType) {
        self.field_header(8, field_type);
        self.buf.put_u64(value);
    }

    /// Writes the filter expression packed by [`Estimate::filter`].
    pub fn filter(&mut self, packed: Option<&Bytes>) {
        if let Some(packed) = packed {
            self.field_bytes(packed, FieldType::FilterExp);
        }
    }

    /// Writes an operation.
    pub fn operation(&mut self, op: &Operation) -> Result<()> {
        op.write_to(&mut *self.buf)
    }

    /// Writes a bin with the given operation code.
    pub fn bin(&mut self, bin: &Bin, op_type: OperationType) -> Result<()> {
        let value_size = bin.value.estimate_size()?;
        self.buf.put_u32((bin.name.len() + value_size + 4) as u32);
        self.buf.put_u8(op_type as u8);
        self.buf.put_u8(bin.value.particle_type() as u8);
        self.buf.put_u8(0);
        self.buf.put_u8(bin.name.len() as u8);
        self.buf.put_slice(bin.name.as_bytes());
        bin.value.write_to(&mut *self.buf)
    }

    /// Writes a read of one bin.
    pub fn read_bin(&mut self, name: &str) {
        self.buf.put_u32((name.len() + 4) as u32);
        self.buf.put_u8(OperationType::Read as u8);
        self.buf.put_u8(ParticleType::Null as u8);
        self.buf.put_u8(0);
        self.buf.put_u8(name.len() as u8);
        self.buf.put_slice(name.as_bytes());
    }

    /// Raw access for layouts the helpers do not cover.
    pub fn buf(&mut self) -> &mut BytesMut {
        self.buf
    }

    /// Patches the proto header and returns the request length.
    pub fn finish(self) -> usize {
        let len = self.buf.len();
        let header = ProtoHeader::new(AS_MSG_TYPE, len - PROTO_HEADER_SIZE).to_u64();
        self.buf[..PROTO_HEADER_SIZE].copy_from_slice(&header.to_be_bytes());
        len
    }
}

fn read_attributes(policy: &BasePolicy, mut read_attr: u8, mut info3: u8) -> (u8, u8) {
    match policy.read_mode_sc {
        ReadModeSC::Session => {}
        ReadModeSC::Linearize => info3 |= INFO3_SC_READ_TYPE,
        ReadModeSC::AllowReplica => info3 |= INFO3_SC_READ_RELAX,
        ReadModeSC::AllowUnavailable => info3 |= INFO3_SC_READ_TYPE | INFO3_SC_READ_RELAX,
    }
    if policy.read_mode_ap == ReadModeAP::All {
        read_attr |= INFO1_READ_MODE_AP_ALL;
    }
    if policy.use_compression {
        read_attr |= INFO1_COMPRESS_RESPONSE;
    }
    (read_attr, info3)
}

/// Writes the server timeout into a finished request.
pub fn set_server_timeout(buf: &mut BytesMut, timeout_ms: u32) {
    if buf.len() >= SERVER_TIMEOUT_OFFSET + 4 {
        buf[SERVER_TIMEOUT_OFFSET..SERVER_TIMEOUT_OFFSET + 4]
            .copy_from_slice(&timeout_ms.to_be_bytes());
    }
}

fn ensure(src: &impl Buf, len: usize, what: &str) -> Result<()> {
    if src.remaining() < len {
        return Err(Error::Protocol(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            len,
            src.remaining()
        )));
    }
    Ok(())
}

/// Key fields found in a streamed record.
#[derive(Debug, Default)]
pub struct KeyFields {
    /// Namespace field.
    pub namespace: Option<String>,
    /// Set field.
    pub set_name: Option<String>,
    /// Digest field.
    pub digest: Option<[u8; DIGEST_SIZE]>,
    /// User key field.
    pub user_key: Option<Value>,
}

impl KeyFields {
    /// Builds a key; fails when the digest is missing.
    pub fn into_key(self) -> Result<Key> {
        let digest = self
            .digest
            .ok_or_else(|| Error::Protocol("record has no digest field".to_string()))?;
        Ok(Key::with_digest(
            self.namespace.unwrap_or_default(),
            self.set_name.unwrap_or_default(),
            digest,
        )
        .with_user_key(self.user_key))
    }
}

/// Reads `count` fields, keeping the ones that identify a record.
pub fn parse_fields(src: &mut Bytes, count: u16) -> Result<KeyFields> {
    let mut fields = KeyFields::default();
    for _ in 0..count {
        ensure(src, FIELD_HEADER_SIZE, "field header")?;
        let size = src.get_u32() as usize;
        if size == 0 {
            return Err(Error::Protocol("zero-length field".to_string()));
        }
        let field_type = src.get_u8();
        let len = size - 1;
        ensure(src, len, "field")?;
        let data = src.split_to(len);

        match FieldType::from_u8(field_type) {
            Some(FieldType::DigestRipe) if len == DIGEST_SIZE => {
                let mut digest = [0u8; DIGEST_SIZE];
                digest.copy_from_slice(&data);
                fields.digest = Some(digest);
            }
            Some(FieldType::Namespace) => {
                fields.namespace = Some(String::from_utf8_lossy(&data).into_owned())
            }
            Some(FieldType::Table) => {
                fields.set_name = Some(String::from_utf8_lossy(&data).into_owned())
            }
            Some(FieldType::Key) if len > 0 => {
                fields.user_key = Some(Value::from_particle(data[0], &data[1..])?);
            }
            _ => {}
        }
    }
    Ok(fields)
}

/// Reads `count` operation results into bins.
///
/// A bin named more than once (operate with several reads of the same bin)
/// collects its results into a list in reply order.
pub fn parse_bins(src: &mut Bytes, count: u16) -> Result<HashMap<String, Value>> {
    let mut bins: HashMap<String, Value> = HashMap::with_capacity(count as usize);
    let mut repeated: HashMap<String, usize> = HashMap::new();
    for _ in 0..count {
        ensure(src, OPERATION_HEADER_SIZE, "operation header")?;
        let size = src.get_u32() as usize;
        let _op = src.get_u8();
        let particle_type = src.get_u8();
        let _version = src.get_u8();
        let name_len = src.get_u8() as usize;
        if size < name_len + 4 {
            return Err(Error::Protocol(format!(
                "operation size {} smaller than its name",
                size
            )));
        }
        ensure(src, size - 4, "operation")?;
        let name = String::from_utf8_lossy(&src.split_to(name_len)).into_owned();
        let data = src.split_to(size - 4 - name_len);
        let value = Value::from_particle(particle_type, &data)?;

        match bins.remove(&name) {
            None => {
                bins.insert(name, value);
            }
            Some(previous) => {
                let count = repeated.entry(name.clone()).or_insert(1);
                let list = match previous {
                    Value::List(mut items) if *count > 1 => {
                        items.push(value);
                        items
                    }
                    other => vec![other, value],
                };
                *count += 1;
                bins.insert(name, Value::List(list));
            }
        }
    }
    Ok(bins)
}

/// Skips `count` operations without decoding them.
pub fn skip_bins(src: &mut Bytes, count: u16) -> Result<()> {
    for _ in 0..count {
        ensure(src, 4, "operation header")?;
        let size = src.get_u32() as usize;
        ensure(src, size, "operation")?;
        src.advance(size);
    }
    Ok(())
}

/// Reads the next message header of a reply body.
pub fn parse_header(src: &mut Bytes) -> Result<MessageHeader> {
    MessageHeader::read_from(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Expiration;
    use aerospike_core::Expression;

    #[test]
    fn test_put_request_layout() {
        let key = Key::new("ns1", "s1", "alpha").unwrap();
        let bin = Bin::new("a", 42);

        let mut estimate = Estimate::new();
        estimate.key(&key, false).unwrap();
        estimate.bin(&bin).unwrap();

        let mut buf = BytesMut::new();
        let mut writer = RequestWriter::begin(&mut buf, &estimate);
        writer.write_header(&WritePolicy::default(), 0, INFO2_WRITE, estimate.fields, 1);
        writer.key(&key, false).unwrap();
        writer.bin(&bin, OperationType::Write).unwrap();
        let len = writer.finish();

        assert_eq!(len, estimate.size);
        assert_eq!(&buf[..8], &[2, 3, 0, 0, 0, 0, 0, (len - 8) as u8]);
        assert_eq!(
            &buf[8..30],
            &[
                0x16, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 3, 0, 1
            ]
        );
        assert_eq!(&buf[30..34], &[0, 0, 0, 4]);
        assert_eq!(buf[34], FieldType::Namespace as u8);
        assert_eq!(&buf[35..38], b"ns1");
        assert_eq!(&buf[buf.len() - 8..], &42i64.to_be_bytes());
    }

    #[test]
    fn test_write_header_flags() {
        let policy = WritePolicy {
            record_exists_action: RecordExistsAction::CreateOnly,
            generation_policy: GenerationPolicy::ExpectGenEqual,
            generation: 7,
            expiration: Expiration::Seconds(60),
            commit_level: CommitLevel::CommitMaster,
            durable_delete: true,
            ..WritePolicy::default()
        };
        let mut buf = BytesMut::new();
        let mut writer = RequestWriter::begin(&mut buf, &Estimate::new());
        writer.write_header(&policy, 0, INFO2_WRITE, 0, 0);
        writer.finish();

        let header = MessageHeader::read_from(&mut &buf[8..]).unwrap();
        assert_eq!(
            header.info2,
            INFO2_WRITE | INFO2_CREATE_ONLY | INFO2_GENERATION | INFO2_DURABLE_DELETE
        );
        assert_eq!(header.info3, INFO3_COMMIT_MASTER);
        assert_eq!(header.generation, 7);
        assert_eq!(header.expiration, 60);
    }

    #[test]
    fn test_read_header_sc_and_compression() {
        let policy = BasePolicy {
            read_mode_sc: ReadModeSC::AllowUnavailable,
            read_mode_ap: ReadModeAP::All,
            use_compression: true,
            ..BasePolicy::default()
        };
        let mut buf = BytesMut::new();
        let mut writer = RequestWriter::begin(&mut buf, &Estimate::new());
        writer.header(&policy, INFO1_READ, 0, 0, 0);
        writer.finish();

        let header = MessageHeader::read_from(&mut &buf[8..]).unwrap();
        assert_eq!(
            header.info1,
            INFO1_READ | INFO1_READ_MODE_AP_ALL | INFO1_COMPRESS_RESPONSE
        );
        assert_eq!(header.info3, INFO3_SC_READ_TYPE | INFO3_SC_READ_RELAX);
    }

    #[test]
    fn test_send_key_field() {
        let key = Key::new("test", "", 7).unwrap();
        let mut estimate = Estimate::new();
        estimate.key(&key, true).unwrap();
        assert_eq!(estimate.fields, 3);

        let mut buf = BytesMut::new();
        let mut writer = RequestWriter::begin(&mut buf, &estimate);
        writer.header(&BasePolicy::default(), INFO1_READ, 0, estimate.fields, 0);
        writer.key(&key, true).unwrap();
        assert_eq!(writer.finish(), estimate.size);

        let mut body = Bytes::copy_from_slice(&buf[MSG_TOTAL_HEADER_SIZE..]);
        let fields = parse_fields(&mut body, 3).unwrap();
        assert_eq!(fields.user_key, Some(Value::Int(7)));
        assert_eq!(fields.into_key().unwrap(), key);
    }

    #[test]
    fn test_server_timeout_offset() {
        let mut buf = BytesMut::new();
        let mut writer = RequestWriter::begin(&mut buf, &Estimate::new());
        writer.header(&BasePolicy::default(), INFO1_READ, 0, 0, 0);
        writer.finish();
        set_server_timeout(&mut buf, 1500);
        let header = MessageHeader::read_from(&mut &buf[8..]).unwrap();
        assert_eq!(header.timeout, 1500);
    }

    #[test]
    fn test_parse_bins_collects_repeats() {
        let mut buf = BytesMut::new();
        let mut writer = RequestWriter::begin(&mut buf, &Estimate::new());
        writer.bin(&Bin::new("a", 1), OperationType::Read).unwrap();
        writer.bin(&Bin::new("a", 2), OperationType::Read).unwrap();
        writer.bin(&Bin::new("a", 3), OperationType::Read).unwrap();
        writer.bin(&Bin::new("b", "x"), OperationType::Read).unwrap();

        let mut body = Bytes::copy_from_slice(&buf[8..]);
        let bins = parse_bins(&mut body, 4).unwrap();
        assert_eq!(
            bins["a"],
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(bins["b"], Value::from("x"));
        assert!(body.is_empty());
    }

    #[test]
    fn test_truncated_operation_fails() {
        let mut body = Bytes::from_static(&[0, 0, 0, 20, 1, 1, 0, 1, b'a']);
        assert!(parse_bins(&mut body, 1).is_err());
    }

    #[test]
    fn test_filter_expression_field() {
        let key = Key::new("test", "", 7).unwrap();
        let policy = BasePolicy {
            filter_expression: Some(Expression::eq(Expression::int_bin("a"), Expression::int(1))),
            ..BasePolicy::default()
        };
        let mut estimate = Estimate::new();
        estimate.key(&key, false).unwrap();
        let filter = estimate.filter(&policy).unwrap();
        assert_eq!(estimate.fields, 3);

        let mut buf = BytesMut::new();
        let mut writer = RequestWriter::begin(&mut buf, &estimate);
        writer.header(&policy, INFO1_READ, 0, estimate.fields, 0);
        writer.key(&key, false).unwrap();
        writer.filter(filter.as_ref());
        assert_eq!(writer.finish(), estimate.size);

        let packed = filter.unwrap();
        let tail = &buf[buf.len() - packed.len() - FIELD_HEADER_SIZE..];
        assert_eq!(&tail[..4], &(packed.len() as u32 + 1).to_be_bytes());
        assert_eq!(tail[4], FieldType::FilterExp as u8);
        assert_eq!(&tail[5..], packed.as_ref());
    }

    #[test]
    fn test_no_filter_expression_adds_nothing() {
        let mut estimate = Estimate::new();
        assert!(estimate.filter(&BasePolicy::default()).unwrap().is_none());
        assert_eq!(estimate, Estimate::new());
    }

    #[test]
    fn test_invalid_bin_name_rejected() {
        let mut estimate = Estimate::new();
        assert!(estimate.bin_name(&"x".repeat(20)).is_err());
    }
}
