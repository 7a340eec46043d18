//! WeaveDNS propagation harness CLI.
//!
//! Run as root:
//! ```bash
//! sudo weavedns-harness -w path/to/weavedns
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use weavedns_harness::driver::{self, RunConfig};

/// Distributed propagation tests for a DNS server executable.
#[derive(Parser, Debug)]
#[command(name = "weavedns-harness", about = "WeaveDNS propagation test harness")]
struct Cli {
    /// Path to the DNS server executable under test.
    #[arg(short = 'w', long = "weavedns", alias = "exe", default_value = "weavedns/weavedns")]
    weavedns: PathBuf,

    /// Number of virtual hosts.
    #[arg(short = 'n', long = "num", default_value_t = 2)]
    num: usize,

    /// Propagation deadline in seconds.
    #[arg(short = 't', long = "time", default_value_t = 10)]
    time: u64,

    /// Verbose logging and per-host interface dumps.
    #[arg(short = 'd', long = "debug", default_value_t = false)]
    debug: bool,

    /// Run ping and multicast connectivity checks before launching servers.
    #[arg(short = 'c', long = "conn-check", default_value_t = false)]
    conn_check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!(exe = %cli.weavedns.display(), num = cli.num, "starting harness run");

    driver::run(RunConfig {
        server_exe: cli.weavedns,
        num_hosts: cli.num,
        settle: Duration::from_secs(cli.time),
        conn_check: cli.conn_check,
        debug: cli.debug,
        ..Default::default()
    })
    .await
}
