#![allow(dead_code)]

use std::collections::BTreeMap;

use signal_processor::crd::{
    FailureData, ParentRef, Signal, SignalProcessing, SignalProcessingSpec, TargetResource,
};
use signal_processor::policy::{PolicyBundle, compile};

pub const NOW: &str = "2026-02-24T10:00:00Z";

pub fn make_signal(severity: Option<&str>, target: Option<(&str, &str, &str)>) -> Signal {
    Signal {
        fingerprint: "fp-e2e-1".to_string(),
        severity: severity.map(str::to_string),
        signal_type: Some("prometheus-alert".to_string()),
        source: Some("alertmanager".to_string()),
        target_resource: target.map(|(kind, name, namespace)| TargetResource {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
        }),
        ..Default::default()
    }
}

pub fn make_spec(severity: Option<&str>, target: Option<(&str, &str, &str)>) -> SignalProcessingSpec {
    SignalProcessingSpec {
        parent_ref: ParentRef {
            name: "remediation-1".to_string(),
            namespace: "kubernaut-system".to_string(),
        },
        signal: make_signal(severity, target),
        ..Default::default()
    }
}

pub fn make_signal_processing(name: &str, spec: SignalProcessingSpec) -> SignalProcessing {
    SignalProcessing::new(name, spec)
}

pub fn make_recovery_spec(failure_data: Option<FailureData>) -> SignalProcessingSpec {
    SignalProcessingSpec {
        is_recovery_attempt: true,
        recovery_attempt_number: Some(2),
        failed_workflow_ref: Some("workflow-42".to_string()),
        failed_step: Some(3),
        failure_reason: Some("scale-up timed out".to_string()),
        failure_data,
        ..make_spec(Some("critical"), Some(("Pod", "web-7", "prod-web")))
    }
}

pub fn labels(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/* ── Policy sources mirroring an operator's default bundle ── */

pub const PRIORITY_POLICY: &str = r#"package signalprocessing.priority

result := {"priority": "P0", "source": "rego-policy"} {
    input.environment == "production"
    input.signal.severity == "critical"
}

result := {"priority": "P2", "source": "rego-policy"} {
    input.environment == "production"
    input.signal.severity == "warning"
}
"#;

pub const ENVIRONMENT_POLICY: &str = r#"package signalprocessing.environment

result := {"environment": env, "source": "namespace-labels"} {
    env := input.namespace.labels["kubernaut.ai/environment"]
}

result := {"environment": "production", "source": "rego-inference"} {
    not input.namespace.labels["kubernaut.ai/environment"]
    contains(input.namespace.name, "prod")
}
"#;

pub const CUSTOM_LABELS_POLICY: &str = r#"package signalprocessing.customlabels

result := {"team": ["payments"], "region": ["eu-west-1"]} { true }
"#;

pub const INJECTION_CUSTOM_LABELS_POLICY: &str = r#"package signalprocessing.customlabels

result := {"environment": ["hacked"], "team": ["payments"]} { true }
"#;

pub fn default_bundle() -> PolicyBundle {
    let mut bundle = PolicyBundle::empty();
    bundle.priority = Some(compile("priority", PRIORITY_POLICY).expect("priority compiles"));
    bundle.environment =
        Some(compile("environment", ENVIRONMENT_POLICY).expect("environment compiles"));
    bundle
}
