//! Protocol constants for the Aerospike binary wire protocol.

/// Size of the proto header (version, type, 48-bit length).
pub const PROTO_HEADER_SIZE: usize = 8;

/// Size of the message header that follows the proto header.
pub const MSG_REMAINING_HEADER_SIZE: usize = 22;

/// Proto header plus message header.
pub const MSG_TOTAL_HEADER_SIZE: usize = PROTO_HEADER_SIZE + MSG_REMAINING_HEADER_SIZE;

/// Size of a field header (u32 length + type byte).
pub const FIELD_HEADER_SIZE: usize = 5;

/// Size of an operation header (u32 size, op, particle type, version, name length).
pub const OPERATION_HEADER_SIZE: usize = 8;

/// Size of a RIPEMD-160 digest.
pub const DIGEST_SIZE: usize = 20;

/// Requests at or below this size are never compressed.
pub const COMPRESS_THRESHOLD: usize = 128;

/// Space reserved ahead of a request so it can be compressed in place:
/// a second proto header plus the uncompressed length.
pub const MSG_HEADER_PAD: usize = 16;

/// Extra head room kept for the zlib stream header.
pub const ZLIB_HEADER_PAD: usize = 2;

/// Largest message accepted from the wire.
pub const MAX_BUFFER_SIZE: usize = 120 * 1024 * 1024;

/// Number of partitions in every namespace.
pub const PARTITIONS: usize = 4096;

/// Byte offset of the server timeout inside a request.
pub const SERVER_TIMEOUT_OFFSET: usize = 22;

/// Byte offset of the result code inside a single-record response.
pub const RESULT_CODE_OFFSET: usize = 13;

/// Protocol version carried in every proto header.
pub const CL_MSG_VERSION: u8 = 2;

/// Info (text) message type.
pub const AS_INFO_MESSAGE_TYPE: u8 = 1;

/// Administrative (security) message type.
pub const AS_ADMIN_MESSAGE_TYPE: u8 = 2;

/// Regular data message type.
pub const AS_MSG_TYPE: u8 = 3;

/// Compressed data message type.
pub const AS_MSG_TYPE_COMPRESSED: u8 = 4;

// Info1 (read attributes).

/// Read the record.
pub const INFO1_READ: u8 = 1;
/// Read all bins.
pub const INFO1_GET_ALL: u8 = 1 << 1;
/// Batch request.
pub const INFO1_BATCH: u8 = 1 << 3;
/// Do not return bin data.
pub const INFO1_NOBINDATA: u8 = 1 << 5;
/// Involve all replicas in read (AP).
pub const INFO1_READ_MODE_AP_ALL: u8 = 1 << 6;
/// Ask the server to compress the response.
pub const INFO1_COMPRESS_RESPONSE: u8 = 1 << 7;

// Info2 (write attributes).

/// Write the record.
pub const INFO2_WRITE: u8 = 1;
/// Delete the record.
pub const INFO2_DELETE: u8 = 1 << 1;
/// Apply write only if generation equals.
pub const INFO2_GENERATION: u8 = 1 << 2;
/// Apply write only if generation is greater.
pub const INFO2_GENERATION_GT: u8 = 1 << 3;
/// Leave a tombstone on delete.
pub const INFO2_DURABLE_DELETE: u8 = 1 << 4;
/// Create only; fail if the record exists.
pub const INFO2_CREATE_ONLY: u8 = 1 << 5;
/// Return a result for every operation.
pub const INFO2_RESPOND_ALL_OPS: u8 = 1 << 7;

// Info3 (other attributes).

/// Last message of a multi-record stream.
pub const INFO3_LAST: u8 = 1;
/// Commit on master only.
pub const INFO3_COMMIT_MASTER: u8 = 1 << 1;
/// Partition finished during a partition scan.
pub const INFO3_PARTITION_DONE: u8 = 1 << 2;
/// Update only; fail if the record is missing.
pub const INFO3_UPDATE_ONLY: u8 = 1 << 3;
/// Create or completely replace the record.
pub const INFO3_CREATE_OR_REPLACE: u8 = 1 << 4;
/// Replace only; fail if the record is missing.
pub const INFO3_REPLACE_ONLY: u8 = 1 << 5;
/// Linearized strong consistency read.
pub const INFO3_SC_READ_TYPE: u8 = 1 << 6;
/// Relaxed strong consistency read.
pub const INFO3_SC_READ_RELAX: u8 = 1 << 7;

/// Message field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    /// Namespace name.
    Namespace = 0,
    /// Set name.
    Table = 1,
    /// User key.
    Key = 2,
    /// Record digest.
    DigestRipe = 4,
    /// Task id of a scan or query.
    TranId = 7,
    /// Legacy scan options.
    ScanOptions = 8,
    /// Socket idle timeout for a scan.
    ScanTimeout = 9,
    /// Partition ids to scan.
    PidArray = 11,
    /// Digests to resume a partial partition scan from.
    DigestArray = 12,
    /// Maximum records to return.
    ScanMaxRecords = 13,
    /// Secondary index name.
    IndexName = 21,
    /// Secondary index range filter.
    IndexRange = 22,
    /// Secondary index collection type.
    IndexType = 26,
    /// UDF package.
    UdfPackageName = 30,
    /// UDF function.
    UdfFunction = 31,
    /// UDF argument list.
    UdfArglist = 32,
    /// UDF operation kind.
    UdfOp = 33,
    /// Bins returned by a query.
    QueryBinlist = 40,
    /// Batch index request.
    BatchIndex = 41,
    /// Batch index request carrying set names.
    BatchIndexWithSet = 42,
    /// Filter expression.
    FilterExp = 150,
    /// Throttle for scans and queries.
    RecordsPerSecond = 151,
}

impl FieldType {
    /// Maps a wire byte back to a field type.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Namespace,
            1 => Self::Table,
            2 => Self::Key,
            4 => Self::DigestRipe,
            7 => Self::TranId,
            8 => Self::ScanOptions,
            9 => Self::ScanTimeout,
            11 => Self::PidArray,
            12 => Self::DigestArray,
            13 => Self::ScanMaxRecords,
            21 => Self::IndexName,
            22 => Self::IndexRange,
            26 => Self::IndexType,
            30 => Self::UdfPackageName,
            31 => Self::UdfFunction,
            32 => Self::UdfArglist,
            33 => Self::UdfOp,
            40 => Self::QueryBinlist,
            41 => Self::BatchIndex,
            42 => Self::BatchIndexWithSet,
            150 => Self::FilterExp,
            151 => Self::RecordsPerSecond,
            _ => return None,
        })
    }
}

/// Particle (value) types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ParticleType {
    /// No value.
    Null = 0,
    /// 64-bit signed integer.
    Integer = 1,
    /// 64-bit float.
    Float = 2,
    /// UTF-8 string.
    String = 3,
    /// Raw bytes.
    Blob = 4,
    /// Boolean.
    Bool = 17,
    /// MsgPack map.
    Map = 19,
    /// MsgPack list.
    List = 20,
    /// Large data type (legacy).
    Ldt = 21,
    /// GeoJSON.
    GeoJson = 23,
    /// HyperLogLog.
    Hll = 24,
}

impl ParticleType {
    /// Maps a wire byte back to a particle type.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Null,
            1 => Self::Integer,
            2 => Self::Float,
            3 => Self::String,
            4 => Self::Blob,
            17 => Self::Bool,
            19 => Self::Map,
            20 => Self::List,
            21 => Self::Ldt,
            23 => Self::GeoJson,
            24 => Self::Hll,
            _ => return None,
        })
    }
}

// Admin protocol.

/// Admin header size after the proto header.
pub const ADMIN_HEADER_REMAINING: usize = 16;
/// Admin header size including the proto header.
pub const ADMIN_HEADER_SIZE: usize = PROTO_HEADER_SIZE + ADMIN_HEADER_REMAINING;
/// Byte offset of the result code in an admin reply.
pub const ADMIN_RESULT_CODE_OFFSET: usize = 9;

/// Admin commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdminCommand {
    /// Authenticate with a credential or session token.
    Authenticate = 0,
    /// Create a user.
    CreateUser = 1,
    /// Drop a user.
    DropUser = 2,
    /// Set a password (administrator).
    SetPassword = 3,
    /// Change own password.
    ChangePassword = 4,
    /// Grant roles to a user.
    GrantRoles = 5,
    /// Revoke roles from a user.
    RevokeRoles = 6,
    /// Query users.
    QueryUsers = 9,
    /// Create a role.
    CreateRole = 10,
    /// Drop a role.
    DropRole = 11,
    /// Grant privileges to a role.
    GrantPrivileges = 12,
    /// Revoke privileges from a role.
    RevokePrivileges = 13,
    /// Set a role whitelist.
    SetWhitelist = 14,
    /// Query roles.
    QueryRoles = 16,
    /// Login and obtain a session token.
    Login = 20,
}

/// Admin field ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdminField {
    /// User name.
    User = 0,
    /// Hashed password.
    Password = 1,
    /// Previous hashed password.
    OldPassword = 2,
    /// Hashed credential.
    Credential = 3,
    /// Clear-text password (external auth).
    ClearPassword = 4,
    /// Session token.
    SessionToken = 5,
    /// Session time-to-live in seconds.
    SessionTtl = 6,
    /// Role list.
    Roles = 10,
}
