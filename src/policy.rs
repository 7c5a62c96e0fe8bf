use std::sync::{Arc, LazyLock};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

/* ============================= POLICY NAMES ============================= */

pub const PRIORITY_POLICY: &str = "priority";
pub const ENVIRONMENT_POLICY: &str = "environment";
pub const SEVERITY_POLICY: &str = "severity";
pub const CUSTOM_LABELS_POLICY: &str = "customlabels";

/// Bundle files recognized by the loader, in digest order.
pub const BUNDLE_FILES: &[&str] = &[
    "customlabels.rego",
    "environment.rego",
    "priority.rego",
    "severity.rego",
];

/* ============================= ERRORS ============================= */

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy {file} failed to compile: {message}")]
    Compile { file: String, message: String },

    #[error("policy evaluation error: {0}")]
    Evaluation(String),

    #[error("policy evaluation exceeded {0:?}")]
    Timeout(std::time::Duration),

    /// The policy's `result` rule was undefined for this input.
    #[error("policy produced no result")]
    Undefined,

    #[error("policy produced invalid output: {0}")]
    InvalidOutput(String),
}

/* ============================= COMPILED POLICY ============================= */

/// A single named policy compiled into its own Rego engine.
///
/// The engine is cloned per evaluation; evaluation mutates engine state, so
/// the stored instance is never evaluated directly.
#[derive(Clone)]
pub struct CompiledPolicy {
    pub name: String,
    pub digest: String,
    engine: regorus::Engine,
    entrypoint: String,
}

impl std::fmt::Debug for CompiledPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPolicy")
            .field("name", &self.name)
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

impl CompiledPolicy {
    /// Evaluate `data.signalprocessing.<name>.result` against `input`.
    ///
    /// Returns `PolicyError::Undefined` when the rule does not match.
    pub fn evaluate(&self, input: &serde_json::Value) -> Result<serde_json::Value, PolicyError> {
        let mut engine = self.engine.clone();

        let input_value = regorus::Value::from_json_str(&input.to_string())
            .map_err(|e| PolicyError::Evaluation(e.to_string()))?;
        engine.set_input(input_value);

        let value = engine
            .eval_rule(self.entrypoint.clone())
            .map_err(|e| {
                let msg = e.to_string();
                // regorus reports an undefined rule as an error; treat it as
                // "no match" rather than an evaluation failure.
                if msg.contains("not found") || msg.contains("undefined") {
                    PolicyError::Undefined
                } else {
                    PolicyError::Evaluation(msg)
                }
            })?;

        if value == regorus::Value::Undefined {
            return Err(PolicyError::Undefined);
        }

        let json = value
            .to_json_str()
            .map_err(|e| PolicyError::Evaluation(e.to_string()))?;
        serde_json::from_str(&json).map_err(|e| PolicyError::Evaluation(e.to_string()))
    }
}

/// Compile `source` as the policy named `name` (e.g. "priority").
pub fn compile(name: &str, source: &str) -> Result<CompiledPolicy, PolicyError> {
    let mut engine = regorus::Engine::new();
    engine.set_rego_v0(true);
    engine
        .add_policy(format!("{name}.rego"), source.to_string())
        .map_err(|e| PolicyError::Compile {
            file: format!("{name}.rego"),
            message: e.to_string(),
        })?;

    Ok(CompiledPolicy {
        name: name.to_string(),
        digest: content_digest(source.as_bytes()),
        engine,
        entrypoint: format!("data.signalprocessing.{name}.result"),
    })
}

/* ============================= DIGEST ============================= */

fn content_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Stable content digest over a set of named sources, independent of order.
pub fn bundle_digest(sources: &[(String, String)]) -> String {
    let mut sorted: Vec<_> = sources.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (name, source) in sorted {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/* ============================= BUNDLE ============================= */

/// The compiled policy set currently in force.
///
/// Missing slots mean the operator did not mount that file; the classifiers
/// fall back per their documented rules.
#[derive(Debug, Default, Clone)]
pub struct PolicyBundle {
    pub priority: Option<CompiledPolicy>,
    pub environment: Option<CompiledPolicy>,
    pub severity: Option<CompiledPolicy>,
    pub custom_labels: Option<CompiledPolicy>,
    pub digest: String,
}

impl PolicyBundle {
    /// Bundle with no policies at all: every classifier is fallback-only.
    pub fn empty() -> Self {
        PolicyBundle {
            digest: bundle_digest(&[]),
            ..Default::default()
        }
    }

    /// Compile a bundle from `(file name, source)` pairs.
    ///
    /// Unrecognized file names are ignored. Any compile error fails the
    /// whole bundle so the caller can keep the previous one.
    pub fn from_sources(sources: &[(String, String)]) -> Result<Self, PolicyError> {
        let mut bundle = PolicyBundle {
            digest: bundle_digest(sources),
            ..Default::default()
        };

        for (file, source) in sources {
            let slot = match file.as_str() {
                "priority.rego" => &mut bundle.priority,
                "environment.rego" => &mut bundle.environment,
                "severity.rego" => &mut bundle.severity,
                "customlabels.rego" => &mut bundle.custom_labels,
                _ => continue,
            };
            let name = file.trim_end_matches(".rego");
            *slot = Some(compile(name, source)?);
        }

        Ok(bundle)
    }
}

/// The shared bundle: readers snapshot the `Arc`, the hot-reloader holds the
/// writer lock only for the swap.
pub type SharedBundle = Arc<RwLock<Arc<PolicyBundle>>>;

pub fn shared(bundle: PolicyBundle) -> SharedBundle {
    Arc::new(RwLock::new(Arc::new(bundle)))
}

/// Snapshot the current bundle without holding the lock across evaluation.
pub async fn snapshot(shared: &SharedBundle) -> Arc<PolicyBundle> {
    shared.read().await.clone()
}

/* ============================= BUILT-IN SEVERITY ============================= */

/// Default severity-normalization policy, used when the operator bundle has
/// no severity.rego. Maps common external schemes onto
/// {critical, warning, info}; anything else is left undefined so the
/// classifier returns the "unknown"/fallback pair. It never yields
/// "warning" for an unrecognized value.
pub const DEFAULT_SEVERITY_POLICY: &str = r#"package signalprocessing.severity

critical_values := {"critical", "fatal", "emergency", "sev1", "p0"}

warning_values := {"warning", "warn", "minor", "sev2"}

info_values := {"info", "informational", "notice", "sev3"}

result := {"severity": "critical", "source": "rego-policy"} {
    normalized := lower(input.signal.severity)
    critical_values[normalized]
}

result := {"severity": "warning", "source": "rego-policy"} {
    normalized := lower(input.signal.severity)
    warning_values[normalized]
}

result := {"severity": "info", "source": "rego-policy"} {
    normalized := lower(input.signal.severity)
    info_values[normalized]
}
"#;

static BUILTIN_SEVERITY: LazyLock<CompiledPolicy> = LazyLock::new(|| {
    compile(SEVERITY_POLICY, DEFAULT_SEVERITY_POLICY)
        .expect("built-in severity policy compiles")
});

/// The compiled built-in severity policy.
pub fn builtin_severity() -> &'static CompiledPolicy {
    &BUILTIN_SEVERITY
}

/* ============================= TESTS ============================= */
