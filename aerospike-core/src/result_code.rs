//! Result codes returned by the server or raised by the client.

use std::fmt;

macro_rules! result_codes {
    ($( $(#[$doc:meta])* $variant:ident = $value:literal, $text:literal; )*) => {
        /// Database result code.
        ///
        /// Non-negative values are sent by the server in byte 5 of the message
        /// header. Negative values never cross the wire and are produced by the
        /// client itself.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ResultCode {
            $( $(#[$doc])* $variant, )*
            /// A code this client does not know about.
            Unknown(i32),
        }

        impl ResultCode {
            /// Returns the numeric value of this code.
            pub fn value(&self) -> i32 {
                match self {
                    $( Self::$variant => $value, )*
                    Self::Unknown(v) => *v,
                }
            }

            /// Maps a numeric code to its variant.
            pub fn from_value(value: i32) -> Self {
                match value {
                    $( $value => Self::$variant, )*
                    other => Self::Unknown(other),
                }
            }

            /// Human readable description.
            pub fn description(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text, )*
                    Self::Unknown(_) => "unknown result code",
                }
            }
        }
    };
}

result_codes! {
    /// Recordset was closed by the consumer.
    RecordsetClosed = -19, "recordset has been closed";
    /// Seed or peer reported a different cluster name.
    ClusterNameMismatch = -18, "cluster name does not match the configured name";
    /// Socket level failure.
    NetworkError = -17, "network error";
    /// Partition map failed validation.
    InvalidClusterPartitionMap = -16, "invalid cluster partition map";
    /// No node had a pooled connection available.
    NoAvailableConnectionsToNode = -15, "no available connections to node";
    /// Node has no rack for the namespace.
    RackNotDefined = -13, "rack not defined for namespace";
    /// Node refused dispatch because its error rate window is exhausted.
    MaxErrorRate = -12, "max error rate exceeded";
    /// Value type cannot be sent to the server.
    TypeNotSupported = -11, "type not supported";
    /// Value could not be serialized.
    SerializeError = -10, "serialization error";
    /// No node could be reached.
    ServerNotAvailable = -8, "server not available";
    /// Connection pool limit reached.
    NoMoreConnections = -7, "no more connections available";
    /// Generic client error.
    CommonError = -6, "common error";
    /// Query was cancelled by the consumer.
    QueryTerminated = -5, "query terminated";
    /// Scan was cancelled by the consumer.
    ScanTerminated = -4, "scan terminated";
    /// Node could not be resolved.
    InvalidNodeError = -3, "invalid node";
    /// Response could not be parsed.
    ParseError = -2, "parse error";
    /// Success.
    Ok = 0, "ok";
    /// Unknown server failure.
    ServerError = 1, "server error";
    /// Record does not exist.
    KeyNotFoundError = 2, "key not found";
    /// Generation check failed.
    GenerationError = 3, "generation error";
    /// Bad request parameter.
    ParameterError = 4, "parameter error";
    /// Record already exists.
    KeyExistsError = 5, "key already exists";
    /// Bin already exists.
    BinExistsError = 6, "bin already exists";
    /// Cluster key changed during a scan or query.
    ClusterKeyMismatch = 7, "cluster key mismatch";
    /// Server is out of memory.
    ServerMemError = 8, "server memory error";
    /// Server side timeout.
    Timeout = 9, "timeout";
    /// Operation is never allowed.
    AlwaysForbidden = 10, "operation not allowed";
    /// Partition is unavailable.
    PartitionUnavailable = 11, "partition unavailable";
    /// Bin type mismatch.
    BinTypeError = 12, "bin type error";
    /// Record exceeds the write block size.
    RecordTooBig = 13, "record too big";
    /// Too many concurrent operations on the record.
    KeyBusy = 14, "hot key";
    /// Scan aborted by the server.
    ScanAbort = 15, "scan aborted";
    /// Feature not supported by the server.
    UnsupportedFeature = 16, "unsupported feature";
    /// Bin does not exist.
    BinNotFound = 17, "bin not found";
    /// Storage device is overloaded.
    DeviceOverload = 18, "device overload";
    /// Stored key does not match.
    KeyMismatch = 19, "key mismatch";
    /// Namespace is not configured.
    InvalidNamespace = 20, "namespace not found";
    /// Bin name longer than 15 bytes.
    BinNameTooLong = 21, "bin name too long";
    /// Operation forbidden by configuration.
    FailForbidden = 22, "operation forbidden";
    /// CDT element not found.
    FailElementNotFound = 23, "element not found";
    /// CDT element already exists.
    FailElementExists = 24, "element already exists";
    /// Enterprise-only feature.
    EnterpriseOnly = 25, "enterprise only";
    /// Operation cannot be applied to the current bin value.
    OpNotApplicable = 26, "operation not applicable";
    /// Filter expression excluded the record.
    FilteredOut = 27, "filtered out";
    /// Write lost a conflict resolution.
    LostConflict = 28, "lost conflict";
    /// No more records in a query stream.
    QueryEnd = 50, "query end";
    /// Security is not supported.
    SecurityNotSupported = 51, "security not supported";
    /// Security is not enabled.
    SecurityNotEnabled = 52, "security not enabled";
    /// Security scheme is not supported.
    SecuritySchemeNotSupported = 53, "security scheme not supported";
    /// Unknown administrative command.
    InvalidCommand = 54, "invalid command";
    /// Invalid administrative field.
    InvalidField = 55, "invalid field";
    /// Security protocol violation.
    IllegalState = 56, "illegal state";
    /// User does not exist.
    InvalidUser = 60, "invalid user";
    /// User already exists.
    UserAlreadyExists = 61, "user already exists";
    /// Password is invalid.
    InvalidPassword = 62, "invalid password";
    /// Password has expired.
    ExpiredPassword = 63, "expired password";
    /// Password cannot be reused.
    ForbiddenPassword = 64, "forbidden password";
    /// Credential is invalid.
    InvalidCredential = 65, "invalid credential";
    /// Session token has expired.
    ExpiredSession = 66, "expired session";
    /// Role does not exist.
    InvalidRole = 70, "invalid role";
    /// Role already exists.
    RoleAlreadyExists = 71, "role already exists";
    /// Privilege is invalid.
    InvalidPrivilege = 72, "invalid privilege";
    /// Whitelist is invalid.
    InvalidWhitelist = 73, "invalid whitelist";
    /// User must authenticate first.
    NotAuthenticated = 80, "not authenticated";
    /// User lacks the required role.
    RoleViolation = 81, "role violation";
    /// UDF returned an error.
    UdfBadResponse = 100, "UDF bad response";
    /// Batch is disabled on the server.
    BatchDisabled = 150, "batch disabled";
    /// Batch request count exceeded.
    BatchMaxRequestsExceeded = 151, "batch max requests exceeded";
    /// All batch queues are full.
    BatchQueuesFull = 152, "batch queues full";
    /// Invalid GeoJSON value.
    GeoInvalidGeoJson = 160, "invalid GeoJSON";
    /// Secondary index already exists.
    IndexFound = 200, "index already exists";
    /// Secondary index not found.
    IndexNotFound = 201, "index not found";
    /// Secondary index out of memory.
    IndexOom = 202, "index out of memory";
    /// Secondary index not readable.
    IndexNotReadable = 203, "index not readable";
    /// Generic secondary index error.
    IndexGeneric = 204, "index error";
    /// Query aborted because the cluster changed.
    QueryAborted = 210, "query aborted";
    /// Query queue is full.
    QueryQueueFull = 211, "query queue full";
    /// Query timed out on the server.
    QueryTimeout = 212, "query timeout";
    /// Generic query error.
    QueryGeneric = 213, "query error";
}

impl ResultCode {
    /// Decodes the unsigned code byte carried in a message header.
    pub fn from_wire(byte: u8) -> Self {
        Self::from_value(byte as i32)
    }

    /// Returns true for codes that indicate success or a benign miss inside a batch.
    pub fn is_batch_tolerated(&self) -> bool {
        matches!(self, Self::Ok | Self::KeyNotFoundError | Self::FilteredOut)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.value())
    }
}
