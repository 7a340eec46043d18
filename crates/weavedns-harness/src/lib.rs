//! Distributed propagation test harness for WeaveDNS-style DNS servers.
//!
//! The harness brings up a bridge-backed namespace topology, launches one
//! server instance per virtual host, publishes a name through one
//! instance's HTTP management API, and polls every instance over DNS —
//! the origin confirming local registration, the others confirming
//! propagation — until the name is visible (or a deadline expires).
//!
//! This crate contains:
//! - **DNS client** — raw A queries over UDP with per-query timeouts and
//!   propagation polling ([`resolve`])
//! - **Admin client** — the server's `/name` publish/delete HTTP API and
//!   readiness polling ([`admin`])
//! - **Server management** — spawning instances inside namespaces,
//!   graceful shutdown, output capture ([`server`])
//! - **Driver** — the end-to-end scenario ([`driver`])

pub mod admin;
pub mod driver;
pub mod resolve;
pub mod server;
