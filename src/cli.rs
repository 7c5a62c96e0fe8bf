use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "signal-processor")]
#[command(about = "SignalProcessing controller for AI-driven remediation triage")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// Manage the SignalProcessing CRD
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Start the SignalProcessing operator
    Run {
        /// Directory the policy bundle is mounted into
        #[arg(long, default_value = "/etc/kubernaut/policies")]
        policy_dir: PathBuf,

        /// Audit sink base URL (dispatch disabled when omitted)
        #[arg(long)]
        audit_url: Option<String>,

        /// Per-phase processing timeout in seconds
        #[arg(long, default_value_t = 300)]
        phase_timeout_secs: u64,

        /// Enrichment cache TTL in seconds
        #[arg(long, default_value_t = 30)]
        cache_ttl_secs: u64,

        /// Owner-chain traversal depth bound
        #[arg(long, default_value_t = 10)]
        owner_chain_depth: usize,

        /// Prometheus metrics listen address
        #[arg(long, default_value = "0.0.0.0:9090")]
        metrics_addr: SocketAddr,

        /// Health/readiness probe listen address
        #[arg(long, default_value = "0.0.0.0:8081")]
        probe_addr: SocketAddr,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRD into the connected cluster
    Install,
}
