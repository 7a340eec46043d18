//! Stub server-under-test for harness self-tests.
//!
//! Implements just enough of a WeaveDNS-style server for the harness's
//! integration tests to run without the real executable:
//! - the launch contract (`--iface`, `--http-port`, `--dns-port`, `--debug`)
//! - the `/name` management API and `/status` readiness endpoint
//! - an A-record responder over UDP
//! - zone propagation between instances over UDP multicast on the mDNS
//!   group, standing in for the real server's discovery protocol

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::Router;
use clap::Parser;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const GOSSIP_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const GOSSIP_PORT: u16 = 6786;
const RECORD_TTL: u32 = 30;

/// Minimal WeaveDNS stand-in.
#[derive(Parser, Debug)]
#[command(name = "fakedns")]
struct Cli {
    /// Data interface (informational; sockets bind to the wildcard).
    #[arg(long)]
    iface: Option<String>,

    #[arg(long, default_value_t = 6785)]
    http_port: u16,

    #[arg(long, default_value_t = 53)]
    dns_port: u16,

    #[arg(long, default_value_t = false)]
    debug: bool,
}

/// In-memory zone: lowercased FQDN -> address.
#[derive(Clone, Default)]
struct ZoneStore {
    names: Arc<Mutex<HashMap<String, Ipv4Addr>>>,
}

impl ZoneStore {
    fn insert(&self, fqdn: &str, ip: Ipv4Addr) {
        self.names
            .lock()
            .unwrap()
            .insert(Self::key(fqdn), ip);
    }

    fn remove(&self, fqdn: &str) {
        self.names.lock().unwrap().remove(&Self::key(fqdn));
    }

    fn lookup(&self, fqdn: &str) -> Option<Ipv4Addr> {
        self.names.lock().unwrap().get(&Self::key(fqdn)).copied()
    }

    fn key(fqdn: &str) -> String {
        let mut key = fqdn.to_ascii_lowercase();
        if !key.ends_with('.') {
            key.push('.');
        }
        key
    }
}

/// Zone update relayed between instances.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
enum Gossip {
    Put { fqdn: String, ip: Ipv4Addr },
    Del { fqdn: String },
}

impl Gossip {
    fn apply(&self, store: &ZoneStore) {
        match self {
            Gossip::Put { fqdn, ip } => store.insert(fqdn, *ip),
            Gossip::Del { fqdn } => store.remove(fqdn),
        }
    }
}

#[derive(Clone)]
struct AppState {
    store: ZoneStore,
    gossip: Arc<UdpSocket>,
}

impl AppState {
    async fn broadcast(&self, update: &Gossip) {
        match serde_json::to_vec(update) {
            Ok(bytes) => {
                if let Err(err) = self
                    .gossip
                    .send_to(&bytes, (GOSSIP_GROUP, GOSSIP_PORT))
                    .await
                {
                    warn!(%err, "gossip send failed");
                }
            }
            Err(err) => warn!(%err, "gossip encode failed"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!(iface = ?cli.iface, http = cli.http_port, dns = cli.dns_port, "fakedns starting");

    let store = ZoneStore::default();

    let gossip = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, GOSSIP_PORT))
        .await
        .context("binding gossip socket")?;
    gossip
        .join_multicast_v4(GOSSIP_GROUP, Ipv4Addr::UNSPECIFIED)
        .context("joining gossip group")?;
    gossip.set_multicast_loop_v4(false)?;
    let gossip = Arc::new(gossip);

    let dns = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, cli.dns_port))
        .await
        .context("binding DNS socket")?;

    let state = AppState {
        store: store.clone(),
        gossip: gossip.clone(),
    };
    let app = Router::new()
        .route("/name/{container}/{ip}", put(put_name).delete(delete_name))
        .route("/status", get(|| async { "OK" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, cli.http_port))
        .await
        .context("binding HTTP listener")?;

    let dns_store = store.clone();
    let dns_task = tokio::spawn(async move { serve_dns(dns, dns_store).await });
    let gossip_store = store.clone();
    let gossip_task = tokio::spawn(async move { serve_gossip(gossip, gossip_store).await });
    let http_task = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        r = dns_task => warn!("DNS task exited: {r:?}"),
        r = gossip_task => warn!("gossip task exited: {r:?}"),
        r = http_task => warn!("HTTP task exited: {r:?}"),
    }
    Ok(())
}

#[derive(Deserialize)]
struct NameParams {
    fqdn: String,
}

async fn put_name(
    State(state): State<AppState>,
    Path((container, ip)): Path<(String, Ipv4Addr)>,
    Query(params): Query<NameParams>,
) -> StatusCode {
    info!(%container, %ip, fqdn = %params.fqdn, "publish");
    state.store.insert(&params.fqdn, ip);
    state
        .broadcast(&Gossip::Put {
            fqdn: params.fqdn,
            ip,
        })
        .await;
    StatusCode::OK
}

async fn delete_name(
    State(state): State<AppState>,
    Path((container, ip)): Path<(String, Ipv4Addr)>,
    Query(params): Query<NameParams>,
) -> StatusCode {
    info!(%container, %ip, fqdn = %params.fqdn, "delete");
    state.store.remove(&params.fqdn);
    state.broadcast(&Gossip::Del { fqdn: params.fqdn }).await;
    StatusCode::OK
}

/// Answer A queries from the zone store; NXDOMAIN for unknown names.
async fn serve_dns(socket: UdpSocket, store: ZoneStore) {
    let mut buf = [0u8; 4096];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                warn!(%err, "DNS recv failed");
                continue;
            }
        };
        let request = match Message::from_vec(&buf[..len]) {
            Ok(m) => m,
            Err(err) => {
                debug!(%from, %err, "ignoring malformed DNS message");
                continue;
            }
        };

        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(request.recursion_desired())
            .set_authoritative(true);

        for query in request.queries() {
            response.add_query(query.clone());
            let name = query.name().to_ascii();
            match store.lookup(&name) {
                Some(ip) if query.query_type() == RecordType::A => {
                    debug!(%from, %name, %ip, "answering");
                    response.add_answer(Record::from_rdata(
                        query.name().clone(),
                        RECORD_TTL,
                        RData::A(A(ip)),
                    ));
                }
                Some(_) => {}
                None => {
                    debug!(%from, %name, "NXDOMAIN");
                    response.set_response_code(ResponseCode::NXDomain);
                }
            }
        }

        match response.to_vec() {
            Ok(bytes) => {
                let _ = socket.send_to(&bytes, from).await;
            }
            Err(err) => warn!(%err, "DNS encode failed"),
        }
    }
}

/// Apply zone updates gossiped by peer instances.
async fn serve_gossip(socket: Arc<UdpSocket>, store: ZoneStore) {
    let mut buf = [0u8; 2048];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                warn!(%err, "gossip recv failed");
                continue;
            }
        };
        match serde_json::from_slice::<Gossip>(&buf[..len]) {
            Ok(update) => {
                debug!(%from, ?update, "applying gossip");
                update.apply(&store);
            }
            Err(err) => debug!(%from, %err, "ignoring malformed gossip"),
        }
    }
}
