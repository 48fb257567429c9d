//! The command contract and the retry loop that drives every command.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::instrument;

use aerospike_core::protocol::compression::{compress_request, should_compress};
use aerospike_core::protocol::{MessageHeader, AS_MSG_TYPE};
use aerospike_core::{Error, Result, ResultCode};

use super::buffer::{parse_header, set_server_timeout};
use crate::cluster::{Cluster, Node};
use crate::connection::Connection;
use crate::policy::BasePolicy;

/// Wait for a pooled connection when neither timeout bounds it.
const DEFAULT_POOL_WAIT: Duration = Duration::from_secs(1);

/// A request/response exchange with one node.
///
/// [`execute`] owns the retry loop; implementations only encode the
/// request, pick the node and decode the reply, keeping whatever result
/// they produce in their own state.
#[async_trait]
pub trait Command: Send {
    /// Timeouts, retries and compression settings.
    fn policy(&self) -> &BasePolicy;

    /// Encodes the request into `buf`.
    fn write_buffer(&mut self, buf: &mut BytesMut) -> Result<()>;

    /// Picks the node for the next attempt.
    fn get_node(&mut self, cluster: &Cluster) -> Result<Arc<Node>>;

    /// Reads and decodes the reply.
    async fn parse_result(&mut self, conn: &mut Connection) -> Result<()>;

    /// Moves routing state forward before a retry.
    fn prepare_retry(&mut self, _is_client_timeout: bool) {}

    /// True if the command may change a record.
    fn is_write(&self) -> bool {
        false
    }

    /// True if the reply is a record stream that cannot be replayed.
    fn is_streaming(&self) -> bool {
        false
    }
}

/// Runs `command` until it succeeds, fails for good, runs out of retries
/// or passes its deadline.
///
/// Network failures close the connection and retry, except for streaming
/// commands whose partial output has already been delivered. A server
/// timeout retries the same way but keeps the connection. Any other server
/// result code ends the command. A failed write that reached the wire at
/// least once is reported as in doubt.
#[instrument(name = "command.execute", skip_all, fields(write = command.is_write()))]
pub async fn execute<C: Command + ?Sized>(cluster: &Cluster, command: &mut C) -> Result<()> {
    let policy = command.policy().clone();
    let deadline = policy.deadline();
    let socket_timeout = policy.effective_socket_timeout();
    let is_write = command.is_write();

    let mut interval = policy.sleep_between_retries;
    let mut iterations: u32 = 0;
    let mut sent: u32 = 0;
    let mut is_client_timeout = false;
    let mut last: Option<Error> = None;
    let mut node_name = String::new();
    let mut first = true;

    loop {
        iterations += 1;
        if iterations > policy.max_retries.saturating_add(1) {
            break;
        }

        if !first {
            if !interval.is_zero() {
                if deadline.is_some_and(|d| Instant::now() + interval > d) {
                    break;
                }
                tokio::time::sleep(interval).await;
                interval = next_interval(interval, policy.sleep_multiplier, deadline);
            }
            let not_available = last
                .as_ref()
                .is_some_and(|e| e.matches(ResultCode::ServerNotAvailable));
            command.prepare_retry(is_client_timeout || not_available);
        }
        first = false;
        is_client_timeout = false;

        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }

        let node = match command.get_node(cluster) {
            Ok(node) if node.is_active() => node,
            Ok(node) => {
                last = Some(Error::client(
                    ResultCode::ServerNotAvailable,
                    format!("node {} is not active", node.name()),
                ));
                continue;
            }
            Err(e) => {
                last = Some(e);
                continue;
            }
        };
        node_name.clear();
        node_name.push_str(node.name());

        if let Err(e) = node.validate_error_count() {
            last = Some(e);
            continue;
        }

        let mut conn = match acquire(&node, &policy, deadline, socket_timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                let exhausted = matches!(e, Error::PoolExhausted(_));
                if exhausted && policy.exit_fast_on_exhausted_connection_pool {
                    return Err(e.annotate(node_name, iterations, false));
                }
                if matches!(e, Error::PoolEmpty(_) | Error::PoolExhausted(_)) {
                    is_client_timeout = true;
                    // A busy pool is not an attempt; a node nobody can
                    // connect to is.
                    if node.connection_count() > 0 {
                        iterations -= 1;
                    }
                }
                tracing::debug!(node = %node, error = %e, "no connection for command");
                last = Some(e);
                continue;
            }
        };

        if let Err(e) = command.write_buffer(conn.buffer()) {
            node.close_connection(conn);
            return Err(e.annotate(node_name, iterations, false));
        }

        let server_timeout = deadline.map_or(0, |d| {
            d.saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1))
                .as_millis()
                .min(u32::MAX as u128) as u32
        });
        let buf = conn.buffer();
        set_server_timeout(buf, server_timeout);
        if should_compress(policy.use_compression, buf.len()) {
            if let Err(e) = compress_request(buf) {
                node.close_connection(conn);
                return Err(e.annotate(node_name, iterations, false));
            }
        }

        if let Err(e) = conn.flush_buffer().await {
            tracing::debug!(node = %node, error = %e, "failed to send command");
            node.increment_error_count();
            node.close_connection(conn);
            last = Some(e);
            continue;
        }
        sent += 1;

        match command.parse_result(&mut conn).await {
            Ok(()) => {
                node.put_connection(conn);
                return Ok(());
            }
            Err(e) if e.is_network_error() => {
                tracing::debug!(node = %node, error = %e, iteration = iterations, "command failed on the network");
                is_client_timeout = e.is_client_timeout();
                node.increment_error_count();
                node.close_connection(conn);
                if command.is_streaming() {
                    return Err(e.annotate(node_name, iterations, is_write && sent > 0));
                }
                last = Some(e);
            }
            Err(e) if e.is_server_timeout() => {
                tracing::debug!(node = %node, iteration = iterations, "server timed out the command");
                if conn.is_connected() {
                    node.put_connection(conn);
                } else {
                    node.close_connection(conn);
                }
                if command.is_streaming() {
                    return Err(e.annotate(node_name, iterations, is_write && sent > 0));
                }
                last = Some(e);
            }
            Err(e) => {
                if e.matches(ResultCode::DeviceOverload) {
                    node.increment_error_count();
                }
                if conn.is_connected() && e.keep_connection() {
                    node.put_connection(conn);
                } else {
                    node.close_connection(conn);
                }
                return Err(e.annotate(node_name, iterations, false));
            }
        }
    }

    let timed_out = deadline.is_some_and(|d| Instant::now() >= d);
    let err = match last {
        Some(e) if !timed_out => e,
        Some(e) => Error::Timeout(format!(
            "command timed out after {} attempts: {}",
            iterations.saturating_sub(1),
            e
        )),
        None => Error::Timeout(format!(
            "command timed out after {} attempts",
            iterations.saturating_sub(1)
        )),
    };
    Err(err.annotate(node_name, iterations.saturating_sub(1), is_write && sent > 0))
}

/// Reads the next data frame and returns its body.
pub(crate) async fn read_body(conn: &mut Connection) -> Result<Bytes> {
    let frame = conn.read_frame().await?;
    if frame.message_type != AS_MSG_TYPE {
        conn.invalidate();
        return Err(Error::Protocol(format!(
            "expected a data message, got message type {}",
            frame.message_type
        )));
    }
    Ok(frame.body.freeze())
}

/// Reads a single-record reply: its header and the fields and operations
/// that follow it.
pub(crate) async fn read_message(conn: &mut Connection) -> Result<(MessageHeader, Bytes)> {
    let mut body = read_body(conn).await?;
    let header = parse_header(&mut body)?;
    Ok((header, body))
}

/// Takes a pooled connection, waiting a bounded time when the pool is empty.
async fn acquire(
    node: &Arc<Node>,
    policy: &BasePolicy,
    deadline: Option<Instant>,
    socket_timeout: Duration,
) -> Result<Connection> {
    let hint = rand::random::<u8>();
    match node.get_connection(hint, deadline, socket_timeout) {
        Ok(conn) => Ok(conn),
        Err(Error::PoolExhausted(msg)) if policy.exit_fast_on_exhausted_connection_pool => {
            Err(Error::PoolExhausted(msg))
        }
        Err(e @ (Error::PoolEmpty(_) | Error::PoolExhausted(_))) => {
            let mut wait = if socket_timeout.is_zero() {
                DEFAULT_POOL_WAIT
            } else {
                socket_timeout
            };
            if let Some(d) = deadline {
                wait = wait.min(d.saturating_duration_since(Instant::now()));
            }
            node.poll_connection(hint, deadline, socket_timeout, wait)
                .await
                .ok_or(e)
        }
        Err(e) => Err(e),
    }
}

/// Grows the retry pause by `multiplier`, never past the deadline.
pub(crate) fn next_interval(current: Duration, multiplier: f64, deadline: Option<Instant>) -> Duration {
    let next = if multiplier > 1.0 {
        Duration::from_secs_f64(current.as_secs_f64() * multiplier)
    } else {
        current
    };
    match deadline {
        Some(d) => next.min(d.saturating_duration_since(Instant::now())).max(current),
        None => next,
    }
}
