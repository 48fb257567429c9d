//! Checks that a host is a live cluster node before it joins the cluster.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use aerospike_core::{Error, Result, ResultCode};

use super::context::ClusterContext;
use super::host::Host;
use super::node::{Features, NodeInfo};
use crate::connection::Connection;

/// Connects to candidate hosts and collects their identity.
#[derive(Debug)]
pub struct NodeValidator<'a> {
    context: &'a Arc<ClusterContext>,
}

impl<'a> NodeValidator<'a> {
    /// Creates a validator using the cluster's connection settings.
    pub fn new(context: &'a Arc<ClusterContext>) -> Self {
        Self { context }
    }

    /// Validates a seed host.
    ///
    /// Seeds given by name may sit behind a load balancer, so the node's
    /// advertised service addresses are preferred when the seed is not
    /// among them.
    pub async fn validate_seed(&self, host: &Host) -> Result<NodeInfo> {
        let detect_load_balancer = host.name.parse::<IpAddr>().is_err();
        self.validate(host, detect_load_balancer).await
    }

    /// Validates a host advertised in a peers reply.
    pub async fn validate_peer(&self, host: &Host) -> Result<NodeInfo> {
        self.validate(host, false).await
    }

    async fn validate(&self, host: &Host, detect_load_balancer: bool) -> Result<NodeInfo> {
        let addresses = host.resolve().await?;
        let aliases: Vec<Host> = addresses
            .iter()
            .map(|addr| {
                let mut alias = Host::from(*addr);
                alias.tls_name = host.tls_name.clone();
                alias
            })
            .collect();

        let mut last = None;
        for address in addresses {
            match self.validate_address(host, address, detect_load_balancer).await {
                Ok((info, service)) => {
                    let mut info = match service {
                        Some(service) => self.prefer_service(info, service).await,
                        None => info,
                    };
                    for alias in &aliases {
                        if !info.aliases.contains(alias) {
                            info.aliases.push(alias.clone());
                        }
                    }
                    return Ok(info);
                }
                Err(e) => {
                    tracing::debug!(host = %host, address = %address, error = %e, "address failed validation");
                    if fatal(&e) {
                        return Err(e);
                    }
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::InvalidNode(format!("{} has no usable address", host))))
    }

    async fn validate_address(
        &self,
        host: &Host,
        address: SocketAddr,
        detect_load_balancer: bool,
    ) -> Result<(NodeInfo, Option<Host>)> {
        let mut conn = self.context.connect(address, host).await?;
        let session = match self.context.login(&mut conn).await {
            Ok(session) => session,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };

        match self.identify(&mut conn, host, detect_load_balancer).await {
            Ok(identity) => Ok((
                NodeInfo {
                    name: identity.name,
                    host: host.clone(),
                    address,
                    aliases: vec![host.clone()],
                    features: identity.features,
                    session,
                    conn: Some(conn),
                },
                identity.service,
            )),
            Err(e) => {
                conn.close();
                Err(e)
            }
        }
    }

    /// Switches a load-balanced seed to the node's advertised address.
    ///
    /// Keeps the seed connection when the advertised address is unusable
    /// or answers with a different node name.
    async fn prefer_service(&self, seed: NodeInfo, service: Host) -> NodeInfo {
        let addresses = match service.resolve().await {
            Ok(addresses) => addresses,
            Err(e) => {
                tracing::debug!(service = %service, error = %e, "advertised service address unresolvable");
                return seed;
            }
        };
        for address in addresses {
            match self.validate_address(&service, address, false).await {
                Ok((info, _)) if info.name == seed.name => {
                    tracing::debug!(seed = %seed.host, service = %service, "seed is behind a load balancer");
                    if let Some(conn) = seed.conn {
                        conn.close();
                    }
                    return info;
                }
                Ok((info, _)) => {
                    tracing::debug!(service = %service, node = %info.name, expected = %seed.name, "service address answered as another node");
                    if let Some(conn) = info.conn {
                        conn.close();
                    }
                }
                Err(e) => {
                    tracing::debug!(service = %service, error = %e, "advertised service address failed validation")
                }
            }
        }
        seed
    }

    async fn identify(
        &self,
        conn: &mut Connection,
        host: &Host,
        detect_load_balancer: bool,
    ) -> Result<Identity> {
        let policy = self.context.policy();
        let service_command = format!("service-{}", policy.service_suffix());

        let mut commands = vec!["node".to_string(), "partition-generation".to_string(), "features".to_string()];
        if policy.cluster_name().is_some() {
            commands.push("cluster-name".to_string());
        }
        if detect_load_balancer {
            commands.push(service_command.clone());
        }

        let timeout = policy.timeout();
        conn.set_timeout(Some(std::time::Instant::now() + timeout), timeout);
        let values = conn.request_info(&commands).await?;
        conn.set_timeout(None, std::time::Duration::ZERO);

        let name = values
            .get("node")
            .filter(|n| !n.is_empty())
            .cloned()
            .ok_or_else(|| Error::InvalidNode(format!("{} did not report a node name", host)))?;

        let generation: i64 = values
            .get("partition-generation")
            .and_then(|g| g.trim().parse().ok())
            .ok_or_else(|| Error::InvalidNode(format!("{} reported no partition generation", host)))?;
        if generation == -1 {
            return Err(Error::InvalidNode(format!(
                "node {} at {} is not fully initialized",
                name, host
            )));
        }

        if let Some(expected) = policy.cluster_name() {
            let actual = values.get("cluster-name").map(String::as_str).unwrap_or("");
            if actual != expected {
                return Err(Error::client(
                    ResultCode::ClusterNameMismatch,
                    format!(
                        "node {} at {} belongs to cluster `{}`, expected `{}`",
                        name, host, actual, expected
                    ),
                ));
            }
        }

        let features = values
            .get("features")
            .map(|f| Features::parse(f))
            .unwrap_or_default();

        let service = values
            .get(&service_command)
            .and_then(|reply| pick_service(reply, host, policy.ip_map()));

        Ok(Identity {
            name,
            features,
            service,
        })
    }
}

struct Identity {
    name: String,
    features: Features,
    service: Option<Host>,
}

/// Returns an advertised service address when `host` is not one of them.
fn pick_service(
    reply: &str,
    host: &Host,
    ip_map: &std::collections::HashMap<String, String>,
) -> Option<Host> {
    let advertised: Vec<Host> = reply
        .split(';')
        .filter(|s| !s.is_empty())
        .filter_map(|entry| Host::parse(entry, host.port).ok())
        .map(|mut h| {
            if let Some(mapped) = ip_map.get(&h.name) {
                h.name = mapped.clone();
            }
            h.tls_name = host.tls_name.clone();
            h
        })
        .collect();

    if advertised.is_empty() || advertised.iter().any(|h| h.name == host.name && h.port == host.port) {
        return None;
    }
    advertised.into_iter().next()
}

/// Errors that make trying other addresses of the same host pointless.
fn fatal(error: &Error) -> bool {
    matches!(error, Error::Authentication(_)) || error.matches(ResultCode::ClusterNameMismatch)
}
