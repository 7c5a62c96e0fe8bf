use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= TYPES ============================= */

pub const ENRICHMENT_COMPLETE: &str = "EnrichmentComplete";
pub const CLASSIFICATION_COMPLETE: &str = "ClassificationComplete";
pub const CATEGORIZATION_COMPLETE: &str = "CategorizationComplete";
pub const PROCESSING_COMPLETE: &str = "ProcessingComplete";
pub const PHASE_TIMEOUT: &str = "PhaseTimeout";

/* ============================= REASONS ============================= */

pub const REASON_ENRICHMENT_SUCCEEDED: &str = "EnrichmentSucceeded";
pub const REASON_ENRICHMENT_FAILED: &str = "EnrichmentFailed";
pub const REASON_K8S_API_TIMEOUT: &str = "K8sAPITimeout";
pub const REASON_RESOURCE_NOT_FOUND: &str = "ResourceNotFound";
pub const REASON_RBAC_DENIED: &str = "RBACDenied";
pub const REASON_DEGRADED_MODE: &str = "DegradedMode";

pub const REASON_CLASSIFICATION_SUCCEEDED: &str = "ClassificationSucceeded";
pub const REASON_CLASSIFICATION_FAILED: &str = "ClassificationFailed";
pub const REASON_REGO_EVALUATION_ERROR: &str = "RegoEvaluationError";
pub const REASON_POLICY_NOT_FOUND: &str = "PolicyNotFound";
pub const REASON_INVALID_NAMESPACE_LABELS: &str = "InvalidNamespaceLabels";
pub const REASON_SEVERITY_FALLBACK: &str = "SeverityFallback";

pub const REASON_CATEGORIZATION_SUCCEEDED: &str = "CategorizationSucceeded";
pub const REASON_CATEGORIZATION_FAILED: &str = "CategorizationFailed";
pub const REASON_INVALID_BUSINESS_UNIT: &str = "InvalidBusinessUnit";
pub const REASON_INVALID_SLA_TIER: &str = "InvalidSLATier";

pub const REASON_PROCESSING_SUCCEEDED: &str = "ProcessingSucceeded";
pub const REASON_PROCESSING_FAILED: &str = "ProcessingFailed";
pub const REASON_AUDIT_WRITE_FAILED: &str = "AuditWriteFailed";
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";

/* ============================= CONDITION ============================= */

/// One entry of `status.conditions`.
///
/// `last_transition_time` moves only when `status` changes, matching the
/// Kubernetes condition convention.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False", or "Unknown".
    pub status: String,

    pub reason: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    pub last_transition_time: String,
}

/// Upsert `type_` into `conditions`, bumping `lastTransitionTime` only when
/// the truth value actually changed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    now: &str,
) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let transition = existing.status != status;
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        if transition {
            existing.status = status.to_string();
            existing.last_transition_time = now.to_string();
        }
        return;
    }

    conditions.push(Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: now.to_string(),
    });
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == "True")
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_inserts_new() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            ENRICHMENT_COMPLETE,
            "True",
            REASON_ENRICHMENT_SUCCEEDED,
            "",
            "2026-01-01T00:00:00Z",
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, ENRICHMENT_COMPLETE);
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].last_transition_time, "2026-01-01T00:00:00Z");
    }

    #[test]
    fn test_set_condition_same_status_keeps_transition_time() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            CLASSIFICATION_COMPLETE,
            "True",
            REASON_CLASSIFICATION_SUCCEEDED,
            "",
            "2026-01-01T00:00:00Z",
        );
        set_condition(
            &mut conditions,
            CLASSIFICATION_COMPLETE,
            "True",
            REASON_SEVERITY_FALLBACK,
            "severity fell back",
            "2026-01-01T00:05:00Z",
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, "2026-01-01T00:00:00Z");
        assert_eq!(conditions[0].reason, REASON_SEVERITY_FALLBACK);
        assert_eq!(conditions[0].message, "severity fell back");
    }

    #[test]
    fn test_set_condition_status_change_bumps_transition_time() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            PROCESSING_COMPLETE,
            "Unknown",
            REASON_PROCESSING_FAILED,
            "",
            "2026-01-01T00:00:00Z",
        );
        set_condition(
            &mut conditions,
            PROCESSING_COMPLETE,
            "True",
            REASON_PROCESSING_SUCCEEDED,
            "",
            "2026-01-01T00:10:00Z",
        );

        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].last_transition_time, "2026-01-01T00:10:00Z");
    }

    #[test]
    fn test_set_condition_keeps_other_types() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, ENRICHMENT_COMPLETE, "True", "a", "", "t0");
        set_condition(&mut conditions, CLASSIFICATION_COMPLETE, "True", "b", "", "t1");

        assert_eq!(conditions.len(), 2);
        assert!(is_condition_true(&conditions, ENRICHMENT_COMPLETE));
        assert!(is_condition_true(&conditions, CLASSIFICATION_COMPLETE));
    }

    #[test]
    fn test_is_condition_true_false_when_absent() {
        assert!(!is_condition_true(&[], PROCESSING_COMPLETE));
    }

    #[test]
    fn test_condition_serializes_type_key() {
        let c = Condition {
            type_: ENRICHMENT_COMPLETE.to_string(),
            status: "True".to_string(),
            reason: REASON_ENRICHMENT_SUCCEEDED.to_string(),
            message: String::new(),
            last_transition_time: "2026-01-01T00:00:00Z".to_string(),
        };
        let json = serde_json::to_string(&c).expect("should serialize");
        assert!(json.contains(r#""type":"EnrichmentComplete""#));
        assert!(json.contains("lastTransitionTime"));
        assert!(!json.contains("message"));
    }
}
