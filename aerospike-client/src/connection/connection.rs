//! Single connection to a cluster node.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;

use aerospike_core::protocol::{info, Frame, ProtoCodec, AS_INFO_MESSAGE_TYPE};
use aerospike_core::{Error, Result};

use super::buffer_pool::BufferPool;
#[cfg(feature = "tls")]
use crate::security::TlsContext;

/// Smallest per-I/O timeout applied when a deadline is close.
const MIN_IO_TIMEOUT: Duration = Duration::from_millis(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new unique connection ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Settings shared by every connection a cluster opens.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Deadline for the TCP connect and TLS handshake.
    pub timeout: Duration,
    /// Close pooled connections unused for this long; zero disables.
    pub idle_timeout: Duration,
    /// Free list the data buffer is drawn from.
    pub buffers: Arc<BufferPool>,
    /// TLS connector, when enabled.
    #[cfg(feature = "tls")]
    pub tls: Option<TlsContext>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            idle_timeout: Duration::ZERO,
            buffers: Arc::new(BufferPool::default()),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

enum Stream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A connection to a single cluster node.
///
/// Every read and write is bounded by the smaller of the socket timeout and
/// the time left until the command deadline. Any I/O failure marks the
/// connection closed so it is never returned to a pool.
pub struct Connection {
    id: ConnectionId,
    address: SocketAddr,
    stream: Stream,
    codec: ProtoCodec,
    read_buffer: BytesMut,
    buffer: BytesMut,
    buffers: Arc<BufferPool>,
    socket_timeout: Duration,
    deadline: Option<Instant>,
    idle_timeout: Duration,
    idle_deadline: Option<Instant>,
    created_at: Instant,
    closed: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Establishes a new connection to the given address.
    ///
    /// `host` and `tls_name` select the certificate name when TLS is on.
    pub async fn connect(
        address: SocketAddr,
        host: &str,
        tls_name: Option<&str>,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let connect = async {
            let stream = TcpStream::connect(address).await.map_err(|e| {
                Error::Connection(format!("failed to connect to {}: {}", address, e))
            })?;

            stream.set_nodelay(true).map_err(|e| {
                Error::Connection(format!("failed to set TCP_NODELAY: {}", e))
            })?;

            #[cfg(feature = "tls")]
            if let Some(tls) = &options.tls {
                let tls_stream = tls.handshake(stream, host, tls_name).await?;
                return Ok(Stream::Tls(Box::new(tls_stream)));
            }
            #[cfg(not(feature = "tls"))]
            let _ = (host, tls_name);

            Ok::<_, Error>(Stream::Plain(stream))
        };

        let stream = if options.timeout.is_zero() {
            connect.await?
        } else {
            tokio::time::timeout(options.timeout, connect)
                .await
                .map_err(|_| {
                    Error::Timeout(format!(
                        "connection to {} timed out after {:?}",
                        address, options.timeout
                    ))
                })??
        };

        let now = Instant::now();
        let conn = Self {
            id: ConnectionId::new(),
            address,
            stream,
            codec: ProtoCodec::new(),
            read_buffer: BytesMut::with_capacity(8192),
            buffer: options.buffers.take(),
            buffers: Arc::clone(&options.buffers),
            socket_timeout: Duration::ZERO,
            deadline: None,
            idle_timeout: options.idle_timeout,
            idle_deadline: (!options.idle_timeout.is_zero()).then(|| now + options.idle_timeout),
            created_at: now,
            closed: false,
        };
        tracing::debug!(id = %conn.id, address = %address, "established connection");
        Ok(conn)
    }

    /// Returns the connection's unique identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the remote address of this connection.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Returns when this connection was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Sets the bounds applied to subsequent reads and writes.
    ///
    /// A zero `socket_timeout` and a `None` deadline mean unbounded.
    pub fn set_timeout(&mut self, deadline: Option<Instant>, socket_timeout: Duration) {
        self.deadline = deadline;
        self.socket_timeout = socket_timeout;
    }

    /// Returns the request data buffer.
    pub fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Returns true until the connection is closed or fails.
    pub fn is_connected(&self) -> bool {
        !self.closed
    }

    /// Returns true when the connection sat unused past its idle deadline.
    pub fn is_idle(&self) -> bool {
        self.idle_deadline.is_some_and(|at| Instant::now() >= at)
    }

    /// Extends the idle deadline after a successful use.
    pub fn refresh(&mut self) {
        if !self.idle_timeout.is_zero() {
            self.idle_deadline = Some(Instant::now() + self.idle_timeout);
        }
        self.codec = ProtoCodec::new();
    }

    fn io_timeout(&self) -> Result<Option<Duration>> {
        let socket = (!self.socket_timeout.is_zero()).then_some(self.socket_timeout);
        let remaining = match self.deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout(format!(
                        "deadline passed before I/O on {}",
                        self.address
                    )));
                }
                Some(deadline - now)
            }
            None => None,
        };

        let limit = match (socket, remaining) {
            (Some(s), Some(r)) => Some(s.min(r)),
            (s, r) => s.or(r),
        };
        Ok(limit.map(|l| l.max(MIN_IO_TIMEOUT)))
    }

    async fn bounded<T>(
        limit: Option<Duration>,
        address: SocketAddr,
        what: &str,
        fut: impl Future<Output = io::Result<T>>,
    ) -> Result<T> {
        let result = match limit {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                Error::Timeout(format!("{} on {} timed out after {:?}", what, address, limit))
            })?,
            None => fut.await,
        };
        result.map_err(|e| Error::Connection(format!("failed to {} {}: {}", what, address, e)))
    }

    /// Writes raw bytes.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let result = match self.io_timeout() {
            Ok(limit) => Self::bounded(limit, self.address, "write to", self.stream.write_all(data)).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.closed = true;
        }
        result
    }

    /// Writes the request data buffer.
    pub async fn flush_buffer(&mut self) -> Result<()> {
        let result = match self.io_timeout() {
            Ok(limit) => {
                Self::bounded(limit, self.address, "write to", self.stream.write_all(&self.buffer))
                    .await
            }
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.closed = true;
        }
        result
    }

    /// Reads one proto frame, inflating compressed frames.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let result = self.read_frame_inner().await;
        if result.is_err() {
            self.closed = true;
        }
        result
    }

    async fn read_frame_inner(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buffer)? {
                return Ok(frame);
            }

            let limit = self.io_timeout()?;
            let bytes_read = Self::bounded(
                limit,
                self.address,
                "read from",
                self.stream.read_buf(&mut self.read_buffer),
            )
            .await?;

            if bytes_read == 0 {
                return Err(Error::Connection(format!(
                    "connection to {} closed by peer",
                    self.address
                )));
            }
        }
    }

    /// Sends info commands and returns the `name -> value` reply map.
    pub async fn request_info<S: AsRef<str>>(
        &mut self,
        commands: &[S],
    ) -> Result<HashMap<String, String>> {
        let mut out = BytesMut::new();
        info::encode_request(commands).write_to(&mut out);
        self.write(&out).await?;

        let frame = self.read_frame().await?;
        if frame.message_type != AS_INFO_MESSAGE_TYPE {
            self.closed = true;
            return Err(Error::Protocol(format!(
                "expected info reply, got message type {}",
                frame.message_type
            )));
        }
        info::parse_response(&frame.body)
    }

    /// Marks the connection unusable.
    pub fn invalidate(&mut self) {
        self.closed = true;
    }

    /// Closes this connection.
    pub fn close(mut self) {
        self.closed = true;
        tracing::debug!(id = %self.id, address = %self.address, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.buffers.give(std::mem::take(&mut self.buffer));
    }
}
