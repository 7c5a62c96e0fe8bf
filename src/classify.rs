use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::crd::{
    BusinessClassification, DetectedLabels, EnvironmentClassification, PriorityAssignment,
    SeverityClassification, Signal,
};
use crate::metrics;
use crate::policy::{CompiledPolicy, PolicyBundle, PolicyError, builtin_severity};

/* ============================= SOURCES ============================= */

pub const SOURCE_REGO_POLICY: &str = "rego-policy";
pub const SOURCE_REGO_INFERENCE: &str = "rego-inference";
pub const SOURCE_NAMESPACE_LABELS: &str = "namespace-labels";
pub const SOURCE_FALLBACK: &str = "fallback";
pub const SOURCE_DEFAULT: &str = "default";

/// Every source value a classification field may carry.
pub const ALLOWED_SOURCES: &[&str] = &[
    SOURCE_REGO_POLICY,
    SOURCE_REGO_INFERENCE,
    SOURCE_NAMESPACE_LABELS,
    SOURCE_FALLBACK,
    SOURCE_DEFAULT,
];

/// The operator-controlled namespace label consulted for environment and the
/// business-classification label family.
pub const ENVIRONMENT_NS_LABEL: &str = "kubernaut.ai/environment";
pub const BUSINESS_UNIT_NS_LABEL: &str = "kubernaut.ai/business-unit";
pub const SERVICE_OWNER_NS_LABEL: &str = "kubernaut.ai/service-owner";
pub const CRITICALITY_NS_LABEL: &str = "kubernaut.ai/criticality";
pub const SLA_TIER_NS_LABEL: &str = "kubernaut.ai/sla-tier";

pub const NORMALIZED_SEVERITIES: &[&str] = &["critical", "warning", "info", "unknown"];

pub const UNKNOWN: &str = "unknown";

/* ============================= FALLBACK MATRIX ============================= */

/// Deterministic severity-only priority matrix used whenever the policy path
/// yields nothing. Total: every input maps to a valid priority.
pub fn fallback_priority(severity: &str) -> &'static str {
    match severity {
        "critical" => "P1",
        "warning" => "P2",
        "info" => "P3",
        _ => "P2",
    }
}

/* ============================= INPUTS ============================= */

/// Namespace facts handed to the environment classifier. Absent entirely when
/// enrichment ran degraded.
#[derive(Debug, Clone, Default)]
pub struct NamespaceInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Signal fields exposed to classification policies.
///
/// Labels and annotations are deliberately omitted: their source is external
/// and potentially adversarial, so they never influence environment,
/// priority, or severity decisions.
pub fn sanitized_signal(signal: &Signal) -> serde_json::Value {
    json!({
        "fingerprint": signal.fingerprint,
        "type": signal.signal_type,
        "severity": signal.severity,
        "source": signal.source,
        "target_resource": signal.target_resource.as_ref().map(|t| {
            json!({"kind": t.kind, "name": t.name, "namespace": t.namespace})
        }),
    })
}

/* ============================= EVALUATION ============================= */

/// Evaluate a policy on a blocking worker under the hard per-evaluation
/// timeout, recording the rego duration histogram.
pub(crate) async fn evaluate_with_timeout(
    policy: &CompiledPolicy,
    input: serde_json::Value,
    timeout: Duration,
) -> Result<serde_json::Value, PolicyError> {
    let policy = policy.clone();
    let timer = metrics::REGO_DURATION.start_timer();
    let outcome = tokio::time::timeout(
        timeout,
        tokio::task::spawn_blocking(move || policy.evaluate(&input)),
    )
    .await;
    timer.observe_duration();

    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(PolicyError::Evaluation(join.to_string())),
        Err(_) => Err(PolicyError::Timeout(timeout)),
    }
}

fn string_field(output: &serde_json::Value, field: &str) -> Option<String> {
    output
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/* ============================= ENVIRONMENT ============================= */

/// Classify the environment.
///
/// Outcomes: policy match with a declared source of `namespace-labels` or
/// `rego-inference`; `unknown`/`fallback` when the policy exists but fails or
/// does not match; `unknown`/`default` when there is no policy or no usable
/// namespace context.
pub async fn classify_environment(
    bundle: &PolicyBundle,
    namespace: Option<&NamespaceInfo>,
    signal: &Signal,
    timeout: Duration,
    now: &str,
) -> EnvironmentClassification {
    let default = EnvironmentClassification {
        environment: UNKNOWN.to_string(),
        source: SOURCE_DEFAULT.to_string(),
        classified_at: Some(now.to_string()),
    };

    let Some(namespace) = namespace else {
        return default;
    };
    let Some(policy) = &bundle.environment else {
        return default;
    };

    let input = json!({
        "namespace": {
            "name": namespace.name,
            "labels": namespace.labels,
            "annotations": namespace.annotations,
        },
        "signal": {
            "type": signal.signal_type,
            "severity": signal.severity,
            "source": signal.source,
        },
    });

    match evaluate_with_timeout(policy, input, timeout).await {
        Ok(output) => {
            let environment = string_field(&output, "environment");
            let source = string_field(&output, "source");
            match (environment, source) {
                (Some(environment), Some(source))
                    if source == SOURCE_NAMESPACE_LABELS || source == SOURCE_REGO_INFERENCE =>
                {
                    EnvironmentClassification {
                        environment,
                        source,
                        classified_at: Some(now.to_string()),
                    }
                }
                _ => {
                    warn!(output = %output, "environment_policy_output_invalid");
                    environment_fallback(now)
                }
            }
        }
        Err(PolicyError::Undefined) => environment_fallback(now),
        Err(e) => {
            warn!(error = %e, "environment_policy_evaluation_failed");
            environment_fallback(now)
        }
    }
}

fn environment_fallback(now: &str) -> EnvironmentClassification {
    EnvironmentClassification {
        environment: UNKNOWN.to_string(),
        source: SOURCE_FALLBACK.to_string(),
        classified_at: Some(now.to_string()),
    }
}

/* ============================= PRIORITY ============================= */

/// Assign a priority.
///
/// The policy path feeds the sanitized signal plus trusted enrichment
/// context; everything else lands on the severity-only fallback matrix, so
/// the result is total.
#[allow(clippy::too_many_arguments)]
pub async fn classify_priority(
    bundle: &PolicyBundle,
    signal: &Signal,
    environment: &str,
    namespace_labels: &BTreeMap<String, String>,
    deployment_labels: &BTreeMap<String, String>,
    detected_labels: &DetectedLabels,
    severity: &str,
    timeout: Duration,
    now: &str,
) -> PriorityAssignment {
    if let Some(policy) = &bundle.priority {
        let input = json!({
            "signal": sanitized_signal(signal),
            "environment": environment,
            "namespace_labels": namespace_labels,
            "deployment_labels": deployment_labels,
            "detected_labels": detected_labels,
        });

        match evaluate_with_timeout(policy, input, timeout).await {
            Ok(output) => {
                if let Some(priority) = string_field(&output, "priority") {
                    let score = output.get("score").and_then(|v| v.as_f64());
                    return PriorityAssignment {
                        priority,
                        source: SOURCE_REGO_POLICY.to_string(),
                        score,
                        classified_at: Some(now.to_string()),
                    };
                }
                warn!(output = %output, "priority_policy_output_invalid");
            }
            Err(PolicyError::Undefined) => {
                debug!("priority_policy_no_match");
            }
            Err(e) => {
                warn!(error = %e, "priority_policy_evaluation_failed");
            }
        }
    }

    PriorityAssignment {
        priority: fallback_priority(severity).to_string(),
        source: SOURCE_FALLBACK.to_string(),
        score: None,
        classified_at: Some(now.to_string()),
    }
}

/* ============================= SEVERITY ============================= */

/// Normalize the external severity string.
///
/// Uses the bundle's severity policy when mounted, otherwise the built-in
/// normalization policy. No match yields `unknown`/`fallback`; the engine
/// never synthesizes "warning" as a default.
pub async fn classify_severity(
    bundle: &PolicyBundle,
    external: Option<&str>,
    timeout: Duration,
    now: &str,
) -> SeverityClassification {
    let fallback = |external: Option<&str>| SeverityClassification {
        severity: UNKNOWN.to_string(),
        external_value: external.map(str::to_string),
        source: SOURCE_FALLBACK.to_string(),
        classified_at: Some(now.to_string()),
    };

    let Some(external) = external else {
        return fallback(None);
    };

    let policy = bundle.severity.as_ref().unwrap_or_else(|| builtin_severity());
    let input = json!({"signal": {"severity": external}});

    match evaluate_with_timeout(policy, input, timeout).await {
        Ok(output) => {
            match string_field(&output, "severity") {
                Some(severity) if NORMALIZED_SEVERITIES.contains(&severity.as_str()) => {
                    SeverityClassification {
                        severity,
                        external_value: Some(external.to_string()),
                        source: SOURCE_REGO_POLICY.to_string(),
                        classified_at: Some(now.to_string()),
                    }
                }
                _ => {
                    warn!(output = %output, "severity_policy_output_invalid");
                    fallback(Some(external))
                }
            }
        }
        Err(PolicyError::Undefined) => fallback(Some(external)),
        Err(e) => {
            warn!(error = %e, external, "severity_policy_evaluation_failed");
            fallback(Some(external))
        }
    }
}

/* ============================= BUSINESS ============================= */

/// Result of the business classifier, with any length-bound violation.
pub struct BusinessOutcome {
    pub classification: BusinessClassification,
    /// Condition reason when a field violated its length bound.
    pub invalid_reason: Option<&'static str>,
}

/// Classify business ownership from the operator-controlled namespace label
/// family. Missing labels yield `unknown` with source `fallback`.
pub fn classify_business(
    namespace_labels: Option<&BTreeMap<String, String>>,
    now: &str,
) -> BusinessOutcome {
    let lookup = |label: &str| -> Option<String> {
        namespace_labels
            .and_then(|labels| labels.get(label))
            .filter(|v| !v.is_empty())
            .cloned()
    };

    let business_unit = lookup(BUSINESS_UNIT_NS_LABEL);
    let service_owner = lookup(SERVICE_OWNER_NS_LABEL);
    let criticality = lookup(CRITICALITY_NS_LABEL);
    let sla_tier = lookup(SLA_TIER_NS_LABEL);

    let any_found = [&business_unit, &service_owner, &criticality, &sla_tier]
        .iter()
        .any(|v| v.is_some());

    let invalid_reason = if business_unit.as_deref().is_some_and(|v| v.len() > 63) {
        Some(crate::conditions::REASON_INVALID_BUSINESS_UNIT)
    } else if sla_tier.as_deref().is_some_and(|v| v.len() > 63) {
        Some(crate::conditions::REASON_INVALID_SLA_TIER)
    } else {
        None
    };

    let source = if any_found {
        SOURCE_NAMESPACE_LABELS
    } else {
        SOURCE_FALLBACK
    };

    BusinessOutcome {
        classification: BusinessClassification {
            business_unit: business_unit.unwrap_or_else(|| UNKNOWN.to_string()),
            service_owner: service_owner.unwrap_or_else(|| UNKNOWN.to_string()),
            criticality: criticality.unwrap_or_else(|| UNKNOWN.to_string()),
            sla_tier: sla_tier.unwrap_or_else(|| UNKNOWN.to_string()),
            source: source.to_string(),
            classified_at: Some(now.to_string()),
        },
        invalid_reason,
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::compile;

    const NOW: &str = "2026-01-01T00:00:00Z";
    const EVAL_TIMEOUT: Duration = Duration::from_secs(5);

    fn signal(severity: Option<&str>) -> Signal {
        Signal {
            fingerprint: "fp-1".to_string(),
            severity: severity.map(str::to_string),
            signal_type: Some("prometheus-alert".to_string()),
            source: Some("alertmanager".to_string()),
            ..Default::default()
        }
    }

    fn bundle_with(slot: &str, source: &str) -> PolicyBundle {
        let mut bundle = PolicyBundle::empty();
        let compiled = compile(slot, source).expect("test policy compiles");
        match slot {
            "priority" => bundle.priority = Some(compiled),
            "environment" => bundle.environment = Some(compiled),
            "severity" => bundle.severity = Some(compiled),
            _ => panic!("unexpected slot"),
        }
        bundle
    }

    const ENVIRONMENT_SOURCE: &str = r#"package signalprocessing.environment

result := {"environment": env, "source": "namespace-labels"} {
    env := input.namespace.labels["kubernaut.ai/environment"]
}
"#;

    const PRIORITY_SOURCE: &str = r#"package signalprocessing.priority

result := {"priority": "P0"} {
    input.environment == "production"
    input.signal.severity == "critical"
}
"#;

    // ── Fallback matrix (pure, deterministic) ──

    #[test]
    fn test_fallback_matrix() {
        assert_eq!(fallback_priority("critical"), "P1");
        assert_eq!(fallback_priority("warning"), "P2");
        assert_eq!(fallback_priority("info"), "P3");
        assert_eq!(fallback_priority("unknown"), "P2");
        assert_eq!(fallback_priority("anything-else"), "P2");
    }

    // ── Sanitized signal (untrusted isolation) ──

    #[test]
    fn test_sanitized_signal_excludes_labels_and_annotations() {
        let mut s = signal(Some("critical"));
        s.labels.insert("environment".to_string(), "hacked".to_string());
        s.annotations.insert("note".to_string(), "evil".to_string());

        let sanitized = sanitized_signal(&s);
        assert!(sanitized.get("labels").is_none());
        assert!(sanitized.get("annotations").is_none());
        assert_eq!(sanitized["fingerprint"], "fp-1");
        assert_eq!(sanitized["severity"], "critical");
    }

    // ── Environment ──

    #[tokio::test]
    async fn test_environment_from_namespace_label() {
        let bundle = bundle_with("environment", ENVIRONMENT_SOURCE);
        let ns = NamespaceInfo {
            name: "prod-web".to_string(),
            labels: [(ENVIRONMENT_NS_LABEL.to_string(), "production".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };

        let result =
            classify_environment(&bundle, Some(&ns), &signal(Some("critical")), EVAL_TIMEOUT, NOW)
                .await;
        assert_eq!(result.environment, "production");
        assert_eq!(result.source, SOURCE_NAMESPACE_LABELS);
    }

    #[tokio::test]
    async fn test_environment_no_policy_is_default() {
        let bundle = PolicyBundle::empty();
        let ns = NamespaceInfo {
            name: "prod-web".to_string(),
            ..Default::default()
        };

        let result =
            classify_environment(&bundle, Some(&ns), &signal(Some("critical")), EVAL_TIMEOUT, NOW)
                .await;
        assert_eq!(result.environment, UNKNOWN);
        assert_eq!(result.source, SOURCE_DEFAULT);
    }

    #[tokio::test]
    async fn test_environment_degraded_enrichment_is_default() {
        let bundle = bundle_with("environment", ENVIRONMENT_SOURCE);
        let result =
            classify_environment(&bundle, None, &signal(Some("critical")), EVAL_TIMEOUT, NOW).await;
        assert_eq!(result.environment, UNKNOWN);
        assert_eq!(result.source, SOURCE_DEFAULT);
    }

    #[tokio::test]
    async fn test_environment_policy_no_match_is_fallback() {
        let bundle = bundle_with("environment", ENVIRONMENT_SOURCE);
        let ns = NamespaceInfo {
            name: "scratch".to_string(),
            ..Default::default()
        };

        let result =
            classify_environment(&bundle, Some(&ns), &signal(Some("critical")), EVAL_TIMEOUT, NOW)
                .await;
        assert_eq!(result.environment, UNKNOWN);
        assert_eq!(result.source, SOURCE_FALLBACK);
    }

    #[tokio::test]
    async fn test_environment_invalid_source_rejected() {
        let bundle = bundle_with(
            "environment",
            r#"package signalprocessing.environment

result := {"environment": "production", "source": "crystal-ball"} { true }
"#,
        );
        let ns = NamespaceInfo {
            name: "prod".to_string(),
            ..Default::default()
        };

        let result =
            classify_environment(&bundle, Some(&ns), &signal(None), EVAL_TIMEOUT, NOW).await;
        assert_eq!(result.source, SOURCE_FALLBACK);
    }

    // ── Priority ──

    #[tokio::test]
    async fn test_priority_policy_match() {
        let bundle = bundle_with("priority", PRIORITY_SOURCE);
        let result = classify_priority(
            &bundle,
            &signal(Some("critical")),
            "production",
            &BTreeMap::new(),
            &BTreeMap::new(),
            &DetectedLabels::default(),
            "critical",
            EVAL_TIMEOUT,
            NOW,
        )
        .await;

        assert_eq!(result.priority, "P0");
        assert_eq!(result.source, SOURCE_REGO_POLICY);
    }

    #[tokio::test]
    async fn test_priority_no_policy_uses_matrix() {
        let result = classify_priority(
            &PolicyBundle::empty(),
            &signal(Some("critical")),
            UNKNOWN,
            &BTreeMap::new(),
            &BTreeMap::new(),
            &DetectedLabels::default(),
            "critical",
            EVAL_TIMEOUT,
            NOW,
        )
        .await;

        assert_eq!(result.priority, "P1");
        assert_eq!(result.source, SOURCE_FALLBACK);
    }

    #[tokio::test]
    async fn test_priority_policy_no_match_uses_matrix() {
        let bundle = bundle_with("priority", PRIORITY_SOURCE);
        let result = classify_priority(
            &bundle,
            &signal(Some("warning")),
            "staging",
            &BTreeMap::new(),
            &BTreeMap::new(),
            &DetectedLabels::default(),
            "warning",
            EVAL_TIMEOUT,
            NOW,
        )
        .await;

        assert_eq!(result.priority, "P2");
        assert_eq!(result.source, SOURCE_FALLBACK);
    }

    // ── Severity ──

    #[tokio::test]
    async fn test_severity_builtin_normalizes_critical() {
        let result =
            classify_severity(&PolicyBundle::empty(), Some("critical"), EVAL_TIMEOUT, NOW).await;
        assert_eq!(result.severity, "critical");
        assert_eq!(result.source, SOURCE_REGO_POLICY);
        assert_eq!(result.external_value.as_deref(), Some("critical"));
    }

    #[tokio::test]
    async fn test_severity_builtin_normalizes_sev1() {
        let result =
            classify_severity(&PolicyBundle::empty(), Some("Sev1"), EVAL_TIMEOUT, NOW).await;
        assert_eq!(result.severity, "critical");
    }

    #[tokio::test]
    async fn test_severity_unrecognized_is_unknown_fallback() {
        let result =
            classify_severity(&PolicyBundle::empty(), Some("shrug"), EVAL_TIMEOUT, NOW).await;
        assert_eq!(result.severity, UNKNOWN);
        assert_eq!(result.source, SOURCE_FALLBACK);
        assert_eq!(result.external_value.as_deref(), Some("shrug"));
    }

    #[tokio::test]
    async fn test_severity_missing_external_is_unknown() {
        let result = classify_severity(&PolicyBundle::empty(), None, EVAL_TIMEOUT, NOW).await;
        assert_eq!(result.severity, UNKNOWN);
        assert_eq!(result.source, SOURCE_FALLBACK);
        assert_eq!(result.external_value, None);
    }

    #[tokio::test]
    async fn test_severity_policy_emitting_invalid_value_falls_back() {
        let bundle = bundle_with(
            "severity",
            r#"package signalprocessing.severity

result := {"severity": "catastrophic", "source": "rego-policy"} { true }
"#,
        );
        let result = classify_severity(&bundle, Some("critical"), EVAL_TIMEOUT, NOW).await;
        assert_eq!(result.severity, UNKNOWN);
        assert_eq!(result.source, SOURCE_FALLBACK);
    }

    // ── Business ──

    #[test]
    fn test_business_from_namespace_labels() {
        let labels: BTreeMap<String, String> = [
            (BUSINESS_UNIT_NS_LABEL, "payments"),
            (SERVICE_OWNER_NS_LABEL, "team-payments"),
            (CRITICALITY_NS_LABEL, "high"),
            (SLA_TIER_NS_LABEL, "gold"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let outcome = classify_business(Some(&labels), NOW);
        assert_eq!(outcome.classification.business_unit, "payments");
        assert_eq!(outcome.classification.sla_tier, "gold");
        assert_eq!(outcome.classification.source, SOURCE_NAMESPACE_LABELS);
        assert!(outcome.invalid_reason.is_none());
    }

    #[test]
    fn test_business_missing_labels_is_fallback() {
        let outcome = classify_business(Some(&BTreeMap::new()), NOW);
        assert_eq!(outcome.classification.business_unit, UNKNOWN);
        assert_eq!(outcome.classification.source, SOURCE_FALLBACK);
    }

    #[test]
    fn test_business_degraded_is_fallback() {
        let outcome = classify_business(None, NOW);
        assert_eq!(outcome.classification.service_owner, UNKNOWN);
        assert_eq!(outcome.classification.source, SOURCE_FALLBACK);
    }

    #[test]
    fn test_business_oversized_sla_tier_flagged() {
        let labels: BTreeMap<String, String> =
            [(SLA_TIER_NS_LABEL.to_string(), "x".repeat(64))].into_iter().collect();
        let outcome = classify_business(Some(&labels), NOW);
        assert_eq!(
            outcome.invalid_reason,
            Some(crate::conditions::REASON_INVALID_SLA_TIER)
        );
    }

    // ── Untrusted isolation (I8) ──

    #[tokio::test]
    async fn test_signal_labels_cannot_change_classification() {
        let bundle = bundle_with("priority", PRIORITY_SOURCE);

        let mut tainted = signal(Some("critical"));
        tainted
            .labels
            .insert("environment".to_string(), "production".to_string());
        tainted
            .labels
            .insert("priority".to_string(), "P9".to_string());

        let clean_result = classify_priority(
            &bundle,
            &signal(Some("critical")),
            "production",
            &BTreeMap::new(),
            &BTreeMap::new(),
            &DetectedLabels::default(),
            "critical",
            EVAL_TIMEOUT,
            NOW,
        )
        .await;
        let tainted_result = classify_priority(
            &bundle,
            &tainted,
            "production",
            &BTreeMap::new(),
            &BTreeMap::new(),
            &DetectedLabels::default(),
            "critical",
            EVAL_TIMEOUT,
            NOW,
        )
        .await;

        assert_eq!(clean_result.priority, tainted_result.priority);
        assert_eq!(clean_result.source, tainted_result.source);
    }
}
