use std::io;
use std::process::{Child, Command, Stdio};

use tracing::{info, warn};

use crate::topology::{Host, MDNS_GROUP};

/// Bidirectional ping check between two hosts. Fails if either direction
/// loses its single echo request.
pub fn ping_check(a: &Host, b: &Host) -> io::Result<()> {
    info!(from = %a.ip, to = %b.ip, "connectivity check: ping");
    ping_one(a, b)?;
    info!(from = %b.ip, to = %a.ip, "connectivity check: ping");
    ping_one(b, a)?;
    Ok(())
}

fn ping_one(from: &Host, to: &Host) -> io::Result<()> {
    let out = from.exec("ping", &["-c", "1", "-W", "1", &to.ip.to_string()])?;
    if !out.status.success() {
        return Err(io::Error::other(format!(
            "ping {} -> {} failed: {}",
            from.ip,
            to.ip,
            String::from_utf8_lossy(&out.stdout)
        )));
    }
    Ok(())
}

/// Multicast connectivity check between two hosts using `iperf` on the
/// mDNS group. Best effort: outputs are logged rather than asserted on,
/// so a missing `iperf` does not abort a run. Multicast delivery problems
/// show up in the logged receiver output.
pub fn multicast_check(receiver: &Host, sender: &Host) -> io::Result<()> {
    info!(group = %MDNS_GROUP, rx = %receiver.ip, tx = %sender.ip, "connectivity check: multicast");

    let group = MDNS_GROUP.to_string();
    let rx = spawn_in_ns(
        receiver,
        "timeout",
        &["3s", "iperf", "-s", "-u", "-B", &group, "-i", "1", "-t", "3"],
    )?;
    let tx = spawn_in_ns(
        sender,
        "timeout",
        &["3s", "iperf", "-c", &group, "-u", "-T", "32", "-i", "1", "-t", "3"],
    )?;

    let rx_quiet = dump_output(rx, "mcast/rx")?;
    let tx_quiet = dump_output(tx, "mcast/tx")?;
    if rx_quiet && tx_quiet {
        warn!("multicast check produced no output; iperf may be missing");
    }
    Ok(())
}

fn spawn_in_ns(host: &Host, cmd: &str, args: &[&str]) -> io::Result<Child> {
    Command::new("sudo")
        .args(["ip", "netns", "exec", &host.ns.name, cmd])
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

/// Wait for a check process and log its output line by line under the
/// given identifier. Returns `true` if the process produced no output.
fn dump_output(child: Child, ident: &str) -> io::Result<bool> {
    let out = child.wait_with_output()?;
    let stdout = String::from_utf8_lossy(&out.stdout);
    let stderr = String::from_utf8_lossy(&out.stderr);
    for line in stdout.lines().filter(|l| !l.is_empty()) {
        info!("[{ident}] {line}");
    }
    for line in stderr.lines().filter(|l| !l.is_empty()) {
        info!("[{ident}] ERROR: {line}");
    }
    Ok(stdout.trim().is_empty() && stderr.trim().is_empty())
}
