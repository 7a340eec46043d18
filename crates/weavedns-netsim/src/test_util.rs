use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonically increasing counter for generating unique test resource names.
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Check whether we have sufficient privileges (root/sudo) and tools (`ip`)
/// available to create network namespaces. Returns `false` if the
/// environment cannot support namespace-based harness runs.
pub fn check_privileges() -> bool {
    match Command::new("sudo").args(["ip", "netns"]).output() {
        Ok(o) => o.status.success(),
        Err(_) => false,
    }
}

/// Generates a unique topology tag with the given prefix.
///
/// Combines the prefix, process ID, and an atomic counter to avoid
/// collisions when tests run in parallel. Tags must stay short: derived
/// interface names prepend up to 6 characters (`vh<idx>_` with a
/// three-digit host index) and are subject to the 15-character Linux
/// interface name limit.
pub fn unique_tag(prefix: &str) -> String {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let tag = format!("{}{:x}{}", prefix, pid % 0xFFFF, seq);
    if tag.len() > 9 {
        tag[..9].to_string()
    } else {
        tag
    }
}
