use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::audit::AuditConfig;
use crate::enrich::EnrichConfig;
use crate::retry::BackoffConfig;

/// Everything the operator reads at startup. Built from `run` subcommand
/// flags; each field has a compiled-in default.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Directory the policy bundle is mounted into.
    pub policy_dir: PathBuf,

    /// Audit sink base URL; `None` disables dispatch.
    pub audit_endpoint: Option<String>,

    /// Per-phase processing timeout before the degraded-mode advance.
    pub phase_timeout: Duration,

    /// Hard per-evaluation Rego timeout.
    pub eval_timeout: Duration,

    pub enrich: EnrichConfig,
    pub backoff: BackoffConfig,
    pub audit: AuditConfig,

    pub cache_ttl: Duration,

    /// GVK of the orchestrator parent, used to repair missing owner refs.
    pub parent_api_version: String,
    pub parent_kind: String,

    /// Audit drain deadline on shutdown.
    pub drain_deadline: Duration,

    pub metrics_addr: SocketAddr,
    pub probe_addr: SocketAddr,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            policy_dir: PathBuf::from("/etc/kubernaut/policies"),
            audit_endpoint: None,
            phase_timeout: Duration::from_secs(300),
            eval_timeout: Duration::from_secs(5),
            enrich: EnrichConfig::default(),
            backoff: BackoffConfig::default(),
            audit: AuditConfig::default(),
            cache_ttl: Duration::from_secs(30),
            parent_api_version: "kubernaut.io/v1alpha1".to_string(),
            parent_kind: "RemediationOrchestration".to_string(),
            drain_deadline: Duration::from_secs(30),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            probe_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = OperatorConfig::default();
        assert_eq!(config.phase_timeout, Duration::from_secs(300));
        assert_eq!(config.eval_timeout, Duration::from_secs(5));
        assert_eq!(config.backoff.base, Duration::from_secs(30));
        assert_eq!(config.backoff.cap, Duration::from_secs(300));
        assert_eq!(config.enrich.owner_chain_depth, 10);
        assert_eq!(config.drain_deadline, Duration::from_secs(30));
        assert_ne!(config.metrics_addr.port(), config.probe_addr.port());
    }
}
