use std::io;
use std::net::Ipv4Addr;
use std::process::{Command, Output};

use tracing::debug;

/// Address the root namespace claims on the bridge. Gives the driver a
/// route into `10.0.0.0/8` so it can reach every virtual host directly.
pub const ROOT_IP: Ipv4Addr = Ipv4Addr::new(10, 123, 123, 1);

/// mDNS multicast group. Each host gets an explicit route for it out its
/// data interface, otherwise multicast-based server discovery is silently
/// routed nowhere.
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// Upper bound on hosts per topology. Host addresses occupy the final
/// octet (`10.0.0.1` .. `10.0.0.254`); anything larger would wrap into
/// the network address or alias an earlier host.
pub const MAX_HOSTS: usize = 254;

fn run_checked(cmd: &str, args: &[&str]) -> io::Result<Output> {
    let output = Command::new("sudo").arg(cmd).args(args).output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "`{cmd} {}` failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(output)
}

/// A Linux network namespace managed via `ip netns`.
///
/// Creates the namespace on construction, initializes loopback, and
/// deletes the namespace on drop. Commands can be executed inside the
/// namespace with [`Namespace::exec`].
#[derive(Debug)]
pub struct Namespace {
    pub name: String,
}

impl Namespace {
    pub fn new(name: &str) -> io::Result<Self> {
        // cleanup any leftover namespace from a crashed previous run
        let _ = Command::new("sudo")
            .args(["ip", "netns", "del", name])
            .output();

        run_checked("ip", &["netns", "add", name])?;

        // Loopback up, best effort
        let _ = Command::new("sudo")
            .args(["ip", "netns", "exec", name, "ip", "link", "set", "lo", "up"])
            .output();

        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Run a command inside the namespace, returning its raw output.
    pub fn exec(&self, cmd: &str, args: &[&str]) -> io::Result<Output> {
        Command::new("sudo")
            .args(["ip", "netns", "exec", &self.name, cmd])
            .args(args)
            .output()
    }

    /// Like [`Namespace::exec`] but treats a non-zero exit as an error.
    pub fn exec_checked(&self, cmd: &str, args: &[&str]) -> io::Result<Output> {
        let output = self.exec(cmd, args)?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "`{cmd} {}` in netns {} failed: {}",
                args.join(" "),
                self.name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(output)
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        let _ = Command::new("sudo")
            .args(["ip", "netns", "del", &self.name])
            .status();
    }
}

/// A Linux bridge in the root namespace, standing in for the original
/// harness's single switch. Carries [`ROOT_IP`] so the root namespace can
/// reach attached hosts.
#[derive(Debug)]
pub struct Bridge {
    pub name: String,
}

impl Bridge {
    pub fn new(name: &str) -> io::Result<Self> {
        let _ = Command::new("sudo")
            .args(["ip", "link", "del", name])
            .output();

        run_checked("ip", &["link", "add", "name", name, "type", "bridge"])?;
        run_checked("ip", &["addr", "add", &format!("{ROOT_IP}/8"), "dev", name])?;
        run_checked("ip", &["link", "set", name, "up"])?;

        Ok(Self {
            name: name.to_string(),
        })
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let _ = Command::new("sudo")
            .args(["ip", "link", "del", &self.name])
            .status();
    }
}

/// One virtual host: a namespace with a single data interface attached to
/// the topology bridge.
#[derive(Debug)]
pub struct Host {
    pub ns: Namespace,
    pub ip: Ipv4Addr,
    /// Data interface name inside the namespace.
    pub iface: String,
}

impl Host {
    /// Dump the host's data interface configuration, one line at a time.
    pub fn iface_info(&self) -> io::Result<Vec<String>> {
        let out = self.exec_checked("ip", &["addr", "show", "dev", &self.iface])?;
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    pub fn exec(&self, cmd: &str, args: &[&str]) -> io::Result<Output> {
        self.ns.exec(cmd, args)
    }

    pub fn exec_checked(&self, cmd: &str, args: &[&str]) -> io::Result<Output> {
        self.ns.exec_checked(cmd, args)
    }
}

/// A bridge-backed star topology: `n` namespaced hosts addressed
/// `10.0.0.1/8 .. 10.0.0.n/8`, all attached to one bridge that the root
/// namespace also sits on.
///
/// Field order matters: hosts must drop (deleting their namespaces and
/// veth pairs) before the bridge goes away.
#[derive(Debug)]
pub struct Topology {
    pub hosts: Vec<Host>,
    bridge: Bridge,
}

impl Topology {
    /// Bring up the bridge and `num_hosts` attached hosts.
    ///
    /// `tag` distinguishes concurrent topologies; interface and namespace
    /// names derived from it must fit the 15-character kernel limit.
    pub fn up(tag: &str, num_hosts: usize) -> io::Result<Self> {
        if num_hosts > MAX_HOSTS {
            return Err(io::Error::other(format!(
                "{num_hosts} hosts requested, topology supports at most {MAX_HOSTS}"
            )));
        }

        let bridge = Bridge::new(&format!("br_{tag}"))?;
        debug!(bridge = %bridge.name, "bridge up");

        let mut hosts = Vec::with_capacity(num_hosts);
        for idx in 0..num_hosts {
            let host = Self::add_host(&bridge, tag, idx)?;
            debug!(ns = %host.ns.name, ip = %host.ip, iface = %host.iface, "host up");
            hosts.push(host);
        }

        Ok(Self { hosts, bridge })
    }

    pub fn bridge_name(&self) -> &str {
        &self.bridge.name
    }

    fn add_host(bridge: &Bridge, tag: &str, idx: usize) -> io::Result<Host> {
        let ns = Namespace::new(&format!("h{}_{tag}", idx + 1))?;
        let ip = Ipv4Addr::new(10, 0, 0, (idx + 1) as u8);
        let veth_host = format!("vh{idx}_{tag}");
        let veth_ns = format!("vn{idx}_{tag}");

        let _ = Command::new("sudo")
            .args(["ip", "link", "del", &veth_host])
            .output();

        run_checked(
            "ip",
            &[
                "link", "add", &veth_host, "type", "veth", "peer", "name", &veth_ns,
            ],
        )?;
        // Host side joins the bridge
        run_checked("ip", &["link", "set", &veth_host, "master", &bridge.name])?;
        run_checked("ip", &["link", "set", &veth_host, "up"])?;
        // Peer side moves into the namespace and gets the host address
        run_checked("ip", &["link", "set", &veth_ns, "netns", &ns.name])?;
        ns.exec_checked("ip", &["addr", "add", &format!("{ip}/8"), "dev", &veth_ns])?;
        ns.exec_checked("ip", &["link", "set", &veth_ns, "up"])?;
        // mDNS fix: pin the multicast group to the data interface
        ns.exec_checked(
            "ip",
            &["route", "add", &MDNS_GROUP.to_string(), "dev", &veth_ns],
        )?;

        Ok(Host {
            ns,
            ip,
            iface: veth_ns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{check_privileges, unique_tag};

    #[test]
    fn oversized_topology_is_rejected() {
        // Fails before any namespace or bridge is touched, so no
        // privileges are needed.
        let err = Topology::up("tovr", MAX_HOSTS + 1).unwrap_err();
        assert!(err.to_string().contains("at most 254"), "{err}");
    }

    #[test]
    fn topology_up_and_ping() {
        if !check_privileges() {
            eprintln!("Skipping test, insufficient privileges or missing tools");
            return;
        }

        let tag = unique_tag("tp");
        let topo = Topology::up(&tag, 2).expect("Failed to bring up topology");
        assert_eq!(topo.hosts.len(), 2);

        // h1 -> h2
        let out = topo.hosts[0]
            .exec("ping", &["-c", "1", "-W", "1", "10.0.0.2"])
            .expect("Failed to exec ping");
        assert!(
            out.status.success(),
            "Ping h1->h2 failed:\n{}\n{}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        );

        // Root namespace -> h1, over the bridge uplink
        let out = Command::new("ping")
            .args(["-c", "1", "-W", "1", "10.0.0.1"])
            .output()
            .expect("Failed to exec ping");
        assert!(out.status.success(), "Ping root->h1 failed");
    }

    #[test]
    fn iface_info_reports_address() {
        if !check_privileges() {
            eprintln!("Skipping test, insufficient privileges or missing tools");
            return;
        }

        let tag = unique_tag("ti");
        let topo = Topology::up(&tag, 1).expect("Failed to bring up topology");
        let lines = topo.hosts[0].iface_info().expect("iface_info failed");
        assert!(
            lines.iter().any(|l| l.contains("10.0.0.1")),
            "interface dump missing host address: {lines:?}"
        );
    }
}
