//! End-to-end run driver.
//!
//! Brings up the topology, launches one server per host, publishes a
//! name at the first instance, and polls every instance over DNS until
//! the name is visible — the origin confirming local registration, the
//! others confirming propagation. Deletion is asserted symmetrically. The
//! run fails (non-zero exit from the binary) if any step or assertion
//! fails; teardown happens regardless.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{error, info};
use weavedns_netsim::connectivity;
use weavedns_netsim::test_util::check_privileges;
use weavedns_netsim::topology::{Topology, MAX_HOSTS};

use crate::admin::AdminClient;
use crate::resolve::DnsClient;
use crate::server::{ServerConfig, ServerInstance};

/// Deadline for an instance's management API to come up after launch.
const READY_DEADLINE: Duration = Duration::from_secs(5);

/// Stagger between instance launches, carried over from the original
/// harness to avoid multicast join races at startup.
const LAUNCH_STAGGER: Duration = Duration::from_secs(1);

/// Full configuration for one harness run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub server_exe: PathBuf,
    pub num_hosts: usize,
    /// Overall propagation deadline per assertion.
    pub settle: Duration,
    pub conn_check: bool,
    pub debug: bool,
    pub http_port: u16,
    pub dns_port: u16,
    /// Name published during the run.
    pub fqdn: String,
    /// Address the published name maps to. Deliberately outside the
    /// topology's host range.
    pub record_ip: Ipv4Addr,
    /// Container identity the name is registered under.
    pub container: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            server_exe: PathBuf::from("weavedns/weavedns"),
            num_hosts: 2,
            settle: Duration::from_secs(10),
            conn_check: false,
            debug: false,
            http_port: 6785,
            dns_port: 53,
            fqdn: "test1.weave.local.".to_string(),
            record_ip: Ipv4Addr::new(10, 9, 9, 9),
            container: "c1".to_string(),
        }
    }
}

/// Execute one full run. Returns an error on the first failed assertion;
/// namespaces, bridge, and server processes are torn down either way.
pub async fn run(config: RunConfig) -> Result<()> {
    preflight(&config)?;

    let tag = format!("wd{:x}", std::process::id() % 0xFFFF);
    let topology = Topology::up(&tag, config.num_hosts)
        .context("bringing up namespace topology")?;
    info!(
        bridge = topology.bridge_name(),
        hosts = topology.hosts.len(),
        "topology up"
    );

    if config.conn_check {
        let (a, b) = (&topology.hosts[0], &topology.hosts[1]);
        connectivity::ping_check(a, b).context("ping check")?;
        connectivity::multicast_check(a, b).context("multicast check")?;
    }

    let server_config = ServerConfig {
        exe: config.server_exe.clone(),
        http_port: config.http_port,
        dns_port: config.dns_port,
        debug: config.debug,
    };

    let mut instances = Vec::with_capacity(topology.hosts.len());
    for host in &topology.hosts {
        let instance = ServerInstance::spawn(host, &server_config)
            .with_context(|| format!("launching server at {}", host.ip))?;
        instances.push(instance);
        tokio::time::sleep(LAUNCH_STAGGER).await;
    }

    let result = exercise(&config, &instances).await;

    if config.debug {
        for host in &topology.hosts {
            if let Ok(lines) = host.iface_info() {
                for line in lines {
                    info!("[{}] {}", host.ns.name, line);
                }
            }
        }
    }

    for instance in &mut instances {
        if let Err(err) = instance.stop_and_dump() {
            error!(host = %instance.ident, %err, "failed to stop server cleanly");
        }
    }
    drop(topology);

    result
}

fn preflight(config: &RunConfig) -> Result<()> {
    if !config.server_exe.exists() {
        bail!(
            "could not find server executable at {}",
            config.server_exe.display()
        );
    }
    if config.num_hosts < 2 {
        bail!("a propagation run needs at least two hosts");
    }
    if config.num_hosts > MAX_HOSTS {
        bail!("a topology supports at most {MAX_HOSTS} hosts, {} requested", config.num_hosts);
    }
    if !check_privileges() {
        bail!("root privileges and `ip netns` support are required");
    }
    Ok(())
}

/// The actual scenario: publish at the first instance, watch the name
/// appear everywhere, delete it, watch it disappear everywhere.
async fn exercise(config: &RunConfig, instances: &[ServerInstance]) -> Result<()> {
    for instance in instances {
        AdminClient::new(http_addr(instance, config))
            .wait_ready(READY_DEADLINE)
            .await
            .with_context(|| format!("server {} readiness", instance.ident))?;
    }

    let origin = &instances[0];
    let admin = AdminClient::new(http_addr(origin, config));
    admin
        .publish(&config.container, config.record_ip, &config.fqdn)
        .await
        .with_context(|| format!("publishing {} at {}", config.fqdn, origin.ident))?;

    for instance in instances {
        DnsClient::new(dns_addr(instance, config))
            .wait_for_name(&config.fqdn, config.record_ip, config.settle)
            .await
            .with_context(|| format!("propagation to {}", instance.ident))?;
    }
    info!(fqdn = %config.fqdn, "name visible at all instances");

    admin
        .delete(&config.container, config.record_ip, &config.fqdn)
        .await
        .with_context(|| format!("deleting {} at {}", config.fqdn, origin.ident))?;

    for instance in instances {
        DnsClient::new(dns_addr(instance, config))
            .wait_for_removal(&config.fqdn, config.settle)
            .await
            .with_context(|| format!("removal at {}", instance.ident))?;
    }
    info!(fqdn = %config.fqdn, "name removed at all instances");

    Ok(())
}

fn http_addr(instance: &ServerInstance, config: &RunConfig) -> SocketAddr {
    SocketAddr::from((instance.ip, config.http_port))
}

fn dns_addr(instance: &ServerInstance, config: &RunConfig) -> SocketAddr {
    SocketAddr::from((instance.ip, config.dns_port))
}
