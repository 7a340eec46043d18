//! DNS query client.
//!
//! Issues raw A queries over UDP against a single server instance, and
//! polls until an expected record appears (or disappears) within a
//! deadline. Queries carry the AD bit, recursion-desired, and an EDNS
//! OPT record, matching what the servers under test historically
//! received.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

/// Per-query response timeout, carried over from the original harness.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval between propagation polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid domain name {name:?}")]
    BadName {
        name: String,
        #[source]
        source: ProtoError,
    },

    #[error("malformed DNS message from {server}")]
    BadMessage {
        server: SocketAddr,
        #[source]
        source: ProtoError,
    },

    #[error("timeout waiting for response from {server}")]
    Timeout { server: SocketAddr },

    #[error("name {fqdn:?} did not propagate to {server} within {deadline:?}")]
    Propagation {
        fqdn: String,
        server: SocketAddr,
        deadline: Duration,
    },

    #[error("name {fqdn:?} still resolves at {server} after {deadline:?}")]
    Removal {
        fqdn: String,
        server: SocketAddr,
        deadline: Duration,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// DNS client bound to one server instance.
pub struct DnsClient {
    server: SocketAddr,
    query_timeout: Duration,
}

impl DnsClient {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            query_timeout: QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Resolve A records for `name` at this server.
    ///
    /// Returns the answered addresses; an authoritative negative answer
    /// (NXDOMAIN or an empty answer section) yields an empty vector. A
    /// server that never answers yields [`ResolveError::Timeout`].
    pub async fn resolve_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, ResolveError> {
        let fqdn = ensure_fqdn(name);
        let query = build_a_query(&fqdn)?;
        let id = query.id();
        let bytes = query.to_vec().map_err(|source| ResolveError::BadName {
            name: fqdn.clone(),
            source,
        })?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(&bytes, self.server).await?;
        debug!(server = %self.server, %fqdn, id, "sent DNS query");

        let deadline = Instant::now() + self.query_timeout;
        let mut buf = [0u8; 4096];
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(ResolveError::Timeout {
                    server: self.server,
                })?;
            let (len, from) = timeout(remaining, socket.recv_from(&mut buf))
                .await
                .map_err(|_| ResolveError::Timeout {
                    server: self.server,
                })??;

            let response =
                Message::from_vec(&buf[..len]).map_err(|source| ResolveError::BadMessage {
                    server: self.server,
                    source,
                })?;
            // Stray datagram or answer to an earlier query
            if from.ip() != self.server.ip() || response.id() != id {
                continue;
            }

            let addrs: Vec<Ipv4Addr> = response
                .answers()
                .iter()
                .filter_map(|record| match record.data() {
                    Some(RData::A(a)) => Some(a.0),
                    _ => None,
                })
                .collect();
            debug!(server = %self.server, %fqdn, code = %response.response_code(), ?addrs, "received DNS answer");
            return Ok(addrs);
        }
    }

    /// Poll until `name` resolves to `expected` at this server.
    ///
    /// Per-query timeouts count as "not yet" and are retried until the
    /// overall deadline elapses.
    pub async fn wait_for_name(
        &self,
        name: &str,
        expected: Ipv4Addr,
        deadline: Duration,
    ) -> Result<(), ResolveError> {
        let fqdn = ensure_fqdn(name);
        let start = Instant::now();
        loop {
            match self.resolve_a(&fqdn).await {
                Ok(addrs) if addrs.contains(&expected) => {
                    info!(server = %self.server, %fqdn, %expected, elapsed = ?start.elapsed(), "name propagated");
                    return Ok(());
                }
                Ok(addrs) => {
                    debug!(server = %self.server, %fqdn, ?addrs, "name not propagated yet")
                }
                Err(ResolveError::Timeout { .. }) => {
                    debug!(server = %self.server, %fqdn, "query timed out, retrying")
                }
                Err(err) => return Err(err),
            }
            if start.elapsed() >= deadline {
                return Err(ResolveError::Propagation {
                    fqdn,
                    server: self.server,
                    deadline,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll until `name` no longer resolves at this server.
    pub async fn wait_for_removal(&self, name: &str, deadline: Duration) -> Result<(), ResolveError> {
        let fqdn = ensure_fqdn(name);
        let start = Instant::now();
        loop {
            match self.resolve_a(&fqdn).await {
                Ok(addrs) if addrs.is_empty() => {
                    info!(server = %self.server, %fqdn, elapsed = ?start.elapsed(), "name removed");
                    return Ok(());
                }
                Ok(addrs) => debug!(server = %self.server, %fqdn, ?addrs, "name still present"),
                Err(ResolveError::Timeout { .. }) => {
                    debug!(server = %self.server, %fqdn, "query timed out, retrying")
                }
                Err(err) => return Err(err),
            }
            if start.elapsed() >= deadline {
                return Err(ResolveError::Removal {
                    fqdn,
                    server: self.server,
                    deadline,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

/// Append the root label if the name is not already absolute.
pub fn ensure_fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

fn build_a_query(fqdn: &str) -> Result<Message, ResolveError> {
    let name = Name::from_ascii(fqdn).map_err(|source| ResolveError::BadName {
        name: fqdn.to_string(),
        source,
    })?;

    let mut message = Message::new();
    message
        .set_id(rand::rng().random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .set_authentic_data(true)
        .add_query(Query::query(name, RecordType::A));

    // EDNS OPT pseudo-record advertising a larger UDP payload, matching
    // what stub resolvers send the servers under test.
    let mut edns = Edns::new();
    edns.set_max_payload(4096);
    message.set_edns(edns);

    Ok(message)
}
