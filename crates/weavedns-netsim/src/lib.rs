//! Network namespace topology for harness runs.
//!
//! Provides Linux network namespace management, a bridge-backed star
//! topology (one virtual host per namespace, all on `10.0.0.0/8`), and
//! connectivity checks for validating the emulated network before any
//! server under test is launched.

pub mod connectivity;
pub mod topology;

pub mod test_util;
