use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;

/* ============================= PHASE ============================= */

/// Processing phase of a SignalProcessing resource.
///
/// Phases advance along Pending → Enriching → Classifying → Categorizing →
/// Completed; Failed is terminal and reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ProcessingPhase {
    #[default]
    Pending,
    Enriching,
    Classifying,
    Categorizing,
    Completed,
    Failed,
}

impl ProcessingPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingPhase::Completed | ProcessingPhase::Failed)
    }

    /// The next phase on a successful transition, `None` for terminal phases.
    pub fn next(self) -> Option<ProcessingPhase> {
        match self {
            ProcessingPhase::Pending => Some(ProcessingPhase::Enriching),
            ProcessingPhase::Enriching => Some(ProcessingPhase::Classifying),
            ProcessingPhase::Classifying => Some(ProcessingPhase::Categorizing),
            ProcessingPhase::Categorizing => Some(ProcessingPhase::Completed),
            ProcessingPhase::Completed | ProcessingPhase::Failed => None,
        }
    }
}

impl std::fmt::Display for ProcessingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessingPhase::Pending => "Pending",
            ProcessingPhase::Enriching => "Enriching",
            ProcessingPhase::Classifying => "Classifying",
            ProcessingPhase::Categorizing => "Categorizing",
            ProcessingPhase::Completed => "Completed",
            ProcessingPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/* ============================= SPEC ============================= */

/// Reference to the orchestrator resource that owns this SignalProcessing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    pub name: String,
    pub namespace: String,
}

/// Coordinates of the Kubernetes resource the signal fired against.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TargetResource {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// The raw signal as admitted by the upstream gateway.
///
/// `labels` and `annotations` originate outside the cluster and are
/// untrusted: they are never consulted for environment, priority, or
/// severity decisions.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    /// Opaque identifier assigned upstream for this class of signal.
    pub fingerprint: String,

    /// External severity string as received (e.g. "Sev1", "P0", "critical").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub signal_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_resource: Option<TargetResource>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Outcome record of a previous remediation attempt, embedded by the
/// orchestrator on recovery signals.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FailureData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_snapshot: Option<BTreeMap<String, String>>,
}

/// SignalProcessing carries one operational signal through enrichment,
/// classification, and categorization for downstream AI analysis.
///
/// Created by the orchestrator; only the status subresource is mutated by
/// this controller.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "signalprocessing.kubernaut.io",
    version = "v1",
    kind = "SignalProcessing",
    plural = "signalprocessings",
    shortname = "sigproc",
    status = "SignalProcessingStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SignalProcessingSpec {
    /// The orchestrator resource that owns this one.
    pub parent_ref: ParentRef,

    /// The raw signal to process.
    pub signal: Signal,

    /// True when this signal re-fires after a failed remediation workflow.
    #[serde(default)]
    pub is_recovery_attempt: bool,

    /// 1-based attempt counter, set when `isRecoveryAttempt` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_attempt_number: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_workflow_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Fully-populated record of the previous attempt's outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_data: Option<FailureData>,

    /// Storm grouping passed through from the gateway, opaque here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storm_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storm_window: Option<String>,
}

/* ============================= ENRICHMENT STATUS ============================= */

/// Pod-level facts captured during enrichment.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodDetails {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_count: Option<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_names: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Facts about the top-most controller owning the target.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ControllerDetails {
    pub kind: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Facts about the node hosting the target pod.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeDetails {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubelet_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_image: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// The typed snapshot of cluster context assembled by the enricher.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub namespace_labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub namespace_annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeDetails>,
}

/// One link of the owner chain. An empty namespace marks a cluster-scoped
/// owner.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub struct OwnerLink {
    #[serde(default)]
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

/// Auto-detected cluster facts.
///
/// Booleans are only ever set to `true`; absence means false or unknown.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DetectedLabels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ops_managed: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ops_tool: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdb_protected: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hpa_enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_managed: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_isolated: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_security_level: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_mesh: Option<String>,
}

impl DetectedLabels {
    /// Number of facts carrying a value, for the detected-labels gauge.
    pub fn count(&self) -> usize {
        let bools = [
            self.git_ops_managed,
            self.pdb_protected,
            self.hpa_enabled,
            self.stateful,
            self.helm_managed,
            self.network_isolated,
        ];
        let strings = [
            &self.git_ops_tool,
            &self.pod_security_level,
            &self.service_mesh,
        ];
        bools.iter().filter(|b| b.is_some()).count()
            + strings.iter().filter(|s| s.is_some()).count()
    }
}

/// Quality of the recovery context materialized from spec.failureData.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ContextQuality {
    Complete,
    Degraded,
}

/// Context of the previous failed attempt, built during enrichment of
/// recovery signals.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_snapshot: Option<BTreeMap<String, String>>,

    pub context_quality: ContextQuality,
}

/// Everything the enrichment phase produced.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_context: Option<KubernetesContext>,

    /// Ordered chain from the target up to the top-most controller owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_chain: Option<Vec<OwnerLink>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_labels: Option<DetectedLabels>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_context: Option<RecoveryContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_mode: Option<bool>,
}

/* ============================= CLASSIFICATION STATUS ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentClassification {
    pub environment: String,
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classified_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PriorityAssignment {
    pub priority: String,
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classified_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SeverityClassification {
    /// Normalized severity: critical, warning, info, or unknown.
    pub severity: String,

    /// The external severity string as received on the signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_value: Option<String>,

    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classified_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BusinessClassification {
    pub business_unit: String,
    pub service_owner: String,
    pub criticality: String,
    pub sla_tier: String,
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classified_at: Option<String>,
}

/* ============================= STATUS ============================= */

/// SignalProcessingStatus is written only by this controller.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SignalProcessingStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ProcessingPhase>,

    /// RFC 3339 timestamp of the current phase's start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_start_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    /// Wall-clock duration from startTime to completedAt, e.g. "4.2s".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_duration: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<EnrichmentStatus>,

    /// Characteristic names whose probe failed non-benignly (RBAC denied,
    /// timeout, network error), as opposed to a negative probe result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_detections: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_classification: Option<EnvironmentClassification>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_assignment: Option<PriorityAssignment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_classification: Option<SeverityClassification>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_classification: Option<BusinessClassification>,

    /// Operator-defined subdomain → values map. Never contains reserved keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_labels: Option<BTreeMap<String, Vec<String>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consecutive_failures: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl SignalProcessingStatus {
    pub fn phase(&self) -> ProcessingPhase {
        self.phase.unwrap_or_default()
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_crd_generates_valid_yaml() {
        let crd = SignalProcessing::crd();
        let yaml = serde_yaml::to_string(&crd).expect("CRD should serialize to YAML");
        assert!(yaml.contains("signalprocessing.kubernaut.io"));
        assert!(yaml.contains("SignalProcessing"));
        assert!(yaml.contains("signalprocessings"));
    }

    #[test]
    fn test_crd_short_name() {
        let crd = SignalProcessing::crd();
        let short = crd.spec.names.short_names.unwrap_or_default();
        assert!(short.contains(&"sigproc".to_string()));
    }

    #[test]
    fn test_crd_is_namespaced() {
        let crd = SignalProcessing::crd();
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn test_phase_dag() {
        assert_eq!(ProcessingPhase::Pending.next(), Some(ProcessingPhase::Enriching));
        assert_eq!(ProcessingPhase::Enriching.next(), Some(ProcessingPhase::Classifying));
        assert_eq!(ProcessingPhase::Classifying.next(), Some(ProcessingPhase::Categorizing));
        assert_eq!(ProcessingPhase::Categorizing.next(), Some(ProcessingPhase::Completed));
        assert_eq!(ProcessingPhase::Completed.next(), None);
        assert_eq!(ProcessingPhase::Failed.next(), None);
    }

    #[test]
    fn test_phase_terminality() {
        assert!(ProcessingPhase::Completed.is_terminal());
        assert!(ProcessingPhase::Failed.is_terminal());
        assert!(!ProcessingPhase::Pending.is_terminal());
        assert!(!ProcessingPhase::Categorizing.is_terminal());
    }

    #[test]
    fn test_phase_serializes_as_pascal_case() {
        let json = serde_json::to_string(&ProcessingPhase::Enriching).expect("should serialize");
        assert_eq!(json, r#""Enriching""#);
    }

    #[test]
    fn test_spec_serialization_roundtrip() {
        let spec = SignalProcessingSpec {
            parent_ref: ParentRef {
                name: "remediation-1".to_string(),
                namespace: "kubernaut-system".to_string(),
            },
            signal: Signal {
                fingerprint: "fp-123".to_string(),
                severity: Some("critical".to_string()),
                signal_type: Some("prometheus-alert".to_string()),
                source: Some("alertmanager".to_string()),
                target_resource: Some(TargetResource {
                    kind: "Pod".to_string(),
                    name: "web-7".to_string(),
                    namespace: Some("prod-web".to_string()),
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let json = serde_json::to_string(&spec).expect("should serialize");
        let deserialized: SignalProcessingSpec =
            serde_json::from_str(&json).expect("should deserialize");

        assert_eq!(deserialized.parent_ref.name, "remediation-1");
        assert_eq!(deserialized.signal.fingerprint, "fp-123");
        assert_eq!(
            deserialized.signal.target_resource.as_ref().unwrap().kind,
            "Pod"
        );
        assert!(!deserialized.is_recovery_attempt);
        assert_eq!(deserialized.failure_data, None);
    }

    #[test]
    fn test_signal_type_uses_type_key() {
        let signal = Signal {
            fingerprint: "fp".to_string(),
            signal_type: Some("alert".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&signal).expect("should serialize");
        assert!(json.contains(r#""type":"alert""#));
        assert!(!json.contains("signalType"));
    }

    #[test]
    fn test_recovery_spec_roundtrip() {
        let spec = SignalProcessingSpec {
            parent_ref: ParentRef::default(),
            signal: Signal {
                fingerprint: "fp".to_string(),
                ..Default::default()
            },
            is_recovery_attempt: true,
            recovery_attempt_number: Some(2),
            failed_step: Some(3),
            failure_data: Some(FailureData {
                step: Some(3),
                error_type: Some("timeout".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let json = serde_json::to_string(&spec).expect("should serialize");
        let deserialized: SignalProcessingSpec =
            serde_json::from_str(&json).expect("should deserialize");

        assert!(deserialized.is_recovery_attempt);
        assert_eq!(deserialized.recovery_attempt_number, Some(2));
        assert_eq!(
            deserialized.failure_data.as_ref().unwrap().error_type.as_deref(),
            Some("timeout")
        );
    }

    #[test]
    fn test_status_default_omits_everything() {
        let status = SignalProcessingStatus::default();
        let json = serde_json::to_string(&status).expect("should serialize");
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_status_phase_accessor_defaults_to_pending() {
        let status = SignalProcessingStatus::default();
        assert_eq!(status.phase(), ProcessingPhase::Pending);
    }

    #[test]
    fn test_owner_link_cluster_scoped_empty_namespace() {
        let link = OwnerLink {
            namespace: String::new(),
            kind: "Node".to_string(),
            name: "worker-1".to_string(),
        };
        let json = serde_json::to_string(&link).expect("should serialize");
        let deserialized: OwnerLink = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(deserialized.namespace, "");
    }

    #[test]
    fn test_detected_labels_omit_absent_facts() {
        let labels = DetectedLabels {
            git_ops_managed: Some(true),
            git_ops_tool: Some("argocd".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&labels).expect("should serialize");
        assert!(json.contains("gitOpsManaged"));
        assert!(json.contains("argocd"));
        assert!(!json.contains("pdbProtected"));
        assert!(!json.contains("serviceMesh"));
    }

    #[test]
    fn test_detected_labels_count() {
        let labels = DetectedLabels {
            git_ops_managed: Some(true),
            git_ops_tool: Some("flux".to_string()),
            stateful: Some(true),
            ..Default::default()
        };
        assert_eq!(labels.count(), 3);
        assert_eq!(DetectedLabels::default().count(), 0);
    }

    #[test]
    fn test_context_quality_serializes_lowercase() {
        let json = serde_json::to_string(&ContextQuality::Complete).expect("should serialize");
        assert_eq!(json, r#""complete""#);
        let json = serde_json::to_string(&ContextQuality::Degraded).expect("should serialize");
        assert_eq!(json, r#""degraded""#);
    }

    #[test]
    fn test_status_serialization_roundtrip() {
        let status = SignalProcessingStatus {
            phase: Some(ProcessingPhase::Completed),
            start_time: Some("2026-02-24T10:00:00Z".to_string()),
            completed_at: Some("2026-02-24T10:00:04Z".to_string()),
            processing_duration: Some("4.0s".to_string()),
            environment_classification: Some(EnvironmentClassification {
                environment: "production".to_string(),
                source: "namespace-labels".to_string(),
                classified_at: Some("2026-02-24T10:00:02Z".to_string()),
            }),
            priority_assignment: Some(PriorityAssignment {
                priority: "P0".to_string(),
                source: "rego-policy".to_string(),
                score: None,
                classified_at: None,
            }),
            consecutive_failures: Some(0),
            ..Default::default()
        };

        let json = serde_json::to_string(&status).expect("should serialize");
        let deserialized: SignalProcessingStatus =
            serde_json::from_str(&json).expect("should deserialize");

        assert_eq!(deserialized.phase, Some(ProcessingPhase::Completed));
        assert_eq!(
            deserialized.environment_classification.unwrap().environment,
            "production"
        );
        assert_eq!(deserialized.priority_assignment.unwrap().priority, "P0");
        assert_eq!(deserialized.consecutive_failures, Some(0));
    }

    #[test]
    fn test_custom_labels_serialization() {
        let mut labels = BTreeMap::new();
        labels.insert("team".to_string(), vec!["payments".to_string()]);

        let status = SignalProcessingStatus {
            custom_labels: Some(labels),
            ..Default::default()
        };
        let json = serde_json::to_string(&status).expect("should serialize");
        assert!(json.contains(r#""customLabels":{"team":["payments"]}"#));
    }
}
