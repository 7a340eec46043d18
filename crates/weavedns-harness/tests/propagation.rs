//! End-to-end propagation test over real Linux network namespaces.
//!
//! Exercises the full harness path — topology, server launch, HTTP zone
//! mutation, DNS polling — against the `fakedns` stub instead of a real
//! server executable.
//!
//! **Requirements:**
//! - Linux with `ip netns` support
//! - Root / passwordless sudo
//! - `fakedns` binary (built automatically if missing)
//!
//! Run:
//! ```bash
//! sudo cargo test -p weavedns-harness --test propagation -- --nocapture
//! ```

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use weavedns_harness::admin::AdminClient;
use weavedns_harness::driver::{self, RunConfig};
use weavedns_harness::resolve::DnsClient;
use weavedns_harness::server::{ServerConfig, ServerInstance};
use weavedns_netsim::test_util::{check_privileges, unique_tag};
use weavedns_netsim::topology::Topology;

/// Ensure the fakedns binary is built and return its path.
fn fakedns_binary() -> PathBuf {
    if let Ok(p) = std::env::var("FAKEDNS_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return path;
        }
    }

    static BUILD: std::sync::Once = std::sync::Once::new();
    BUILD.call_once(|| {
        let _ = Command::new("cargo")
            .args(["build", "-p", "weavedns-harness", "--bin", "fakedns"])
            .status();
    });

    // Walk up from the test binary to find target/debug/fakedns
    let mut path = std::env::current_exe().expect("current_exe");
    path.pop(); // deps
    path.pop(); // debug
    path.push("fakedns");

    if !path.exists() {
        let cwd = std::env::current_dir().unwrap();
        for candidate in ["target/debug/fakedns", "../../target/debug/fakedns"] {
            let try_path = cwd.join(candidate);
            if try_path.exists() {
                return try_path;
            }
        }
        panic!("fakedns binary not found at {:?}", path);
    }
    path
}

/// Guard that requires privileges. Returns the stub path or skips the test.
fn require_privileged_env() -> Option<PathBuf> {
    if !check_privileges() {
        eprintln!("Skipping test: requires root/netns privileges");
        return None;
    }
    Some(fakedns_binary())
}

/// Publish at h1, watch propagation to h2, delete, watch removal —
/// first driving the library pieces directly, then the full driver run.
///
/// One test on purpose: every topology uses the fixed 10.0.0.0/8 host
/// addressing, so concurrent topologies in the root namespace would
/// collide.
#[tokio::test(flavor = "multi_thread")]
async fn name_propagates_between_instances() {
    let Some(bin) = require_privileged_env() else {
        return;
    };

    let tag = unique_tag("wp");
    let topology = Topology::up(&tag, 2).expect("Failed to bring up topology");

    let server_config = ServerConfig {
        exe: bin.clone(),
        http_port: 6785,
        dns_port: 53,
        debug: true,
    };
    let mut instances: Vec<ServerInstance> = topology
        .hosts
        .iter()
        .map(|host| ServerInstance::spawn(host, &server_config).expect("Failed to spawn fakedns"))
        .collect();

    for instance in &instances {
        AdminClient::new((instance.ip, 6785).into())
            .wait_ready(Duration::from_secs(5))
            .await
            .expect("fakedns never became ready");
    }

    let fqdn = "something.weave.local.";
    let record_ip = Ipv4Addr::new(10, 9, 9, 9);
    let origin = AdminClient::new((instances[0].ip, 6785).into());
    origin
        .publish("container", record_ip, fqdn)
        .await
        .expect("publish failed");

    // The mutation must become visible at the *other* instance.
    DnsClient::new((instances[1].ip, 53).into())
        .wait_for_name(fqdn, record_ip, Duration::from_secs(10))
        .await
        .expect("name did not propagate to second instance");

    origin
        .delete("container", record_ip, fqdn)
        .await
        .expect("delete failed");

    DnsClient::new((instances[1].ip, 53).into())
        .wait_for_removal(fqdn, Duration::from_secs(10))
        .await
        .expect("name was not removed at second instance");

    for instance in &mut instances {
        instance.stop_and_dump().expect("Failed to stop fakedns");
    }
    drop(topology);

    // Full driver run against the stub: exactly what
    // `sudo weavedns-harness -w fakedns` would do.
    driver::run(RunConfig {
        server_exe: bin,
        num_hosts: 2,
        settle: Duration::from_secs(10),
        conn_check: false,
        debug: false,
        ..Default::default()
    })
    .await
    .expect("driver run failed");
}
