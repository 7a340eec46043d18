//! Server instance management.
//!
//! Spawns one copy of the server under test inside a virtual host's
//! namespace, captures its output, and shuts it down with SIGINT before
//! escalating to SIGKILL. Captured output is dumped line by line, tagged
//! with the host identity, so interleaved multi-instance logs stay
//! readable.

use std::io;
use std::net::Ipv4Addr;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use tracing::{info, warn};
use weavedns_netsim::topology::Host;

/// Grace period between SIGINT and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Launch parameters shared by all instances of a run.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub exe: PathBuf,
    pub http_port: u16,
    pub dns_port: u16,
    pub debug: bool,
}

/// A running server-under-test instance.
pub struct ServerInstance {
    /// Identity used when dumping output, e.g. `h1/10.0.0.1`.
    pub ident: String,
    pub ip: Ipv4Addr,
    child: Option<Child>,
}

impl ServerInstance {
    /// Spawn the server inside `host`'s namespace, bound to its data
    /// interface.
    ///
    /// The `sudo` wrapper is made a process-group leader so the whole
    /// tree (sudo, `ip netns exec`, the server itself) can be reaped
    /// with one group signal.
    pub fn spawn(host: &Host, config: &ServerConfig) -> io::Result<Self> {
        let ident = format!("{}/{}", host.ns.name, host.ip);
        info!(host = %ident, iface = %host.iface, exe = %config.exe.display(), "launching server");

        let mut cmd = Command::new("sudo");
        cmd.args(["ip", "netns", "exec", &host.ns.name])
            .arg(&config.exe)
            .args(["--iface", &host.iface])
            .args(["--http-port", &config.http_port.to_string()])
            .args(["--dns-port", &config.dns_port.to_string()])
            .process_group(0)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if config.debug {
            cmd.arg("--debug");
        }

        let child = cmd.spawn()?;
        Ok(Self {
            ident,
            ip: host.ip,
            child: Some(child),
        })
    }

    /// Stop the instance: SIGINT, wait out the grace period, SIGKILL if
    /// still alive, then dump everything it wrote.
    pub fn stop_and_dump(&mut self) -> io::Result<()> {
        let Some(child) = self.child.take() else {
            return Ok(());
        };
        info!(host = %self.ident, "stopping server");

        let output = shutdown(child, &self.ident)?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if !line.is_empty() {
                info!("[{}] {}", self.ident, line);
            }
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            if !line.is_empty() {
                warn!("[{}] {}", self.ident, line);
            }
        }
        Ok(())
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        // Normal teardown goes through stop_and_dump; this is the
        // last-resort path when the driver errors out mid-run.
        if let Some(mut child) = self.child.take() {
            kill_group(child.id());
            let _ = child.wait();
        }
    }
}

/// SIGINT the group leader (relayed to the server by sudo), wait out the
/// grace period, then SIGKILL the whole group. sudo cannot relay SIGKILL,
/// so the group kill is what actually reaps a server that ignores SIGINT
/// instead of leaving it orphaned inside the namespace.
fn shutdown(mut child: Child, ident: &str) -> io::Result<Output> {
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGINT);
    }
    let deadline = Instant::now() + STOP_GRACE;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    if matches!(child.try_wait(), Ok(None)) {
        warn!(host = %ident, "server ignored SIGINT, killing process group");
        kill_group(child.id());
    }
    child.wait_with_output()
}

/// SIGKILL every process in the child's group. The child was spawned as
/// group leader, so its pid doubles as the pgid and descendants spawned
/// through sudo and `ip netns exec` are included.
fn kill_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_reaps_a_sigint_ignoring_process_tree() {
        // sh traps SIGINT and its `sleep` grandchild inherits the stdout
        // pipe, so this only returns within the grace window if the
        // escalation kills the whole group. A leaked sleep would hold
        // the pipe open and stall `wait_with_output` for ~30s.
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "trap '' INT; sleep 30"])
            .process_group(0)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd.spawn().expect("Failed to spawn sh");

        let start = Instant::now();
        let output = shutdown(child, "test").expect("shutdown failed");

        assert!(
            start.elapsed() < Duration::from_secs(10),
            "shutdown took {:?} — process tree was not reaped",
            start.elapsed()
        );
        assert!(
            !output.status.success(),
            "SIGKILLed tree reported success: {:?}",
            output.status
        );
    }

    #[test]
    fn shutdown_is_quick_for_cooperative_process() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30")
            .process_group(0)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd.spawn().expect("Failed to spawn sleep");

        let start = Instant::now();
        // sleep exits on SIGINT, so no escalation is needed
        shutdown(child, "test").expect("shutdown failed");
        assert!(start.elapsed() < STOP_GRACE + Duration::from_secs(1));
    }
}
