//! Error types for Aerospike operations.

use std::io;
use thiserror::Error;

use crate::result_code::ResultCode;

/// The main error type for Aerospike operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-related errors (refused, reset, closed by peer).
    #[error("connection error: {0}")]
    Connection(String),

    /// Protocol-related errors (bad header, bad size, unknown message type).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Client-side deadline exceeded.
    #[error("timeout error: {0}")]
    Timeout(String),

    /// Authentication errors (invalid credentials, failed login).
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Configuration errors (invalid settings).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No usable node for the request.
    #[error("invalid node: {0}")]
    InvalidNode(String),

    /// Node pool had no idle connection; a new one is being opened.
    #[error("connection pool empty: {0}")]
    PoolEmpty(String),

    /// Node pool is at its connection limit.
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// Result code returned by the server.
    #[error("server error: {code}: {message}")]
    Server {
        /// Code carried in the response header.
        code: ResultCode,
        /// Additional context.
        message: String,
    },

    /// Result code raised by the client itself.
    #[error("client error: {code}: {message}")]
    Client {
        /// Client-side code.
        code: ResultCode,
        /// Additional context.
        message: String,
    },

    /// Terminal command failure annotated with the attempt context.
    #[error("{source} (node: {node}, iteration: {iteration}, in doubt: {in_doubt})")]
    Command {
        /// The underlying failure.
        #[source]
        source: Box<Error>,
        /// Node of the last attempt.
        node: String,
        /// Number of attempts made.
        iteration: u32,
        /// Whether a write may have been applied.
        in_doubt: bool,
    },

    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Creates a server error for the given code.
    pub fn server(code: ResultCode, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            message: message.into(),
        }
    }

    /// Creates a client error for the given code.
    pub fn client(code: ResultCode, message: impl Into<String>) -> Self {
        Self::Client {
            code,
            message: message.into(),
        }
    }

    /// Returns the result code best describing this error.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::Connection(_) | Self::Io(_) => ResultCode::NetworkError,
            Self::Protocol(_) => ResultCode::ParseError,
            Self::Serialization(_) => ResultCode::SerializeError,
            Self::Timeout(_) => ResultCode::Timeout,
            Self::Authentication(_) => ResultCode::NotAuthenticated,
            Self::Configuration(_) | Self::InvalidArgument(_) => ResultCode::ParameterError,
            Self::InvalidNode(_) => ResultCode::InvalidNodeError,
            Self::PoolEmpty(_) => ResultCode::NoAvailableConnectionsToNode,
            Self::PoolExhausted(_) => ResultCode::NoMoreConnections,
            Self::Server { code, .. } | Self::Client { code, .. } => *code,
            Self::Command { source, .. } => source.result_code(),
        }
    }

    /// Returns true if this is a client-side timeout.
    pub fn is_client_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Command { source, .. } => source.is_client_timeout(),
            _ => false,
        }
    }

    /// Returns true for socket failures and client-side timeouts.
    pub fn is_network_error(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Io(_) | Self::Timeout(_) => true,
            Self::Command { source, .. } => source.is_network_error(),
            _ => false,
        }
    }

    /// Returns true when the server gave up on the request before the
    /// client deadline.
    pub fn is_server_timeout(&self) -> bool {
        match self {
            Self::Server {
                code: ResultCode::Timeout,
                ..
            } => true,
            Self::Command { source, .. } => source.is_server_timeout(),
            _ => false,
        }
    }

    /// Returns true if a connection that produced this error can be reused.
    ///
    /// Only errors decoded from a complete server reply leave the stream
    /// positioned on a message boundary.
    pub fn keep_connection(&self) -> bool {
        match self {
            Self::Server { code, .. } => !matches!(
                code,
                ResultCode::ScanAbort | ResultCode::QueryAborted
            ),
            _ => false,
        }
    }

    /// Returns whether a write may have been applied despite the failure.
    pub fn in_doubt(&self) -> bool {
        match self {
            Self::Command { in_doubt, .. } => *in_doubt,
            _ => false,
        }
    }

    /// Wraps this error with the context of the last attempt.
    pub fn annotate(self, node: impl Into<String>, iteration: u32, in_doubt: bool) -> Self {
        match self {
            already @ Self::Command { .. } => already,
            other => Self::Command {
                source: Box::new(other),
                node: node.into(),
                iteration,
                in_doubt,
            },
        }
    }

    /// Returns true if the error carries the given result code.
    pub fn matches(&self, code: ResultCode) -> bool {
        self.result_code() == code
    }
}

/// A specialized `Result` type for Aerospike operations.
pub type Result<T> = std::result::Result<T, Error>;
