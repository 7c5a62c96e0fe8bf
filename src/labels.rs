use std::collections::BTreeMap;
use std::time::Duration;

use tracing::warn;

use crate::metrics;
use crate::policy::{CompiledPolicy, PolicyError};

/* ============================= LIMITS ============================= */

pub const MAX_KEYS: usize = 10;
pub const MAX_VALUES_PER_KEY: usize = 5;
pub const MAX_KEY_LEN: usize = 63;
pub const MAX_VALUE_LEN: usize = 100;

/// Names that customer policy output may never claim, directly or through a
/// namespaced variant.
pub const RESERVED_LABELS: &[&str] = &[
    "environment",
    "priority",
    "component",
    "signal_type",
    "severity",
];

/* ============================= SECURITY WRAPPER ============================= */

/// True when `key` collides with a reserved name.
///
/// Matches the bare name, a `prefix/<reserved>` form, and a `<reserved>.suffix`
/// form, case-insensitively.
pub fn is_reserved_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    RESERVED_LABELS.iter().any(|reserved| {
        lower == *reserved
            || lower.rsplit('/').next() == Some(reserved)
            || lower.split('.').next() == Some(*reserved)
    })
}

/// Strip reserved keys from raw policy output.
///
/// Returns the surviving map and the list of blocked keys. This wrapper is
/// applied unconditionally; operators cannot disable it.
pub fn strip_reserved(
    raw: BTreeMap<String, Vec<String>>,
) -> (BTreeMap<String, Vec<String>>, Vec<String>) {
    let mut blocked = Vec::new();
    let mut kept = BTreeMap::new();

    for (key, values) in raw {
        if is_reserved_key(&key) {
            blocked.push(key);
        } else {
            kept.insert(key, values);
        }
    }

    (kept, blocked)
}

/* ============================= VALIDATION ============================= */

/// Check the post-strip output against the size limits. Any violation drops
/// the entire result.
pub fn validate_limits(labels: &BTreeMap<String, Vec<String>>) -> Result<(), String> {
    if labels.len() > MAX_KEYS {
        return Err(format!("{} keys exceeds limit of {MAX_KEYS}", labels.len()));
    }
    for (key, values) in labels {
        if key.len() > MAX_KEY_LEN {
            return Err(format!("key '{key}' exceeds {MAX_KEY_LEN} characters"));
        }
        if values.len() > MAX_VALUES_PER_KEY {
            return Err(format!(
                "key '{key}' has {} values, limit is {MAX_VALUES_PER_KEY}",
                values.len()
            ));
        }
        if let Some(v) = values.iter().find(|v| v.len() > MAX_VALUE_LEN) {
            let head: String = v.chars().take(16).collect();
            return Err(format!(
                "value '{head}…' under key '{key}' exceeds {MAX_VALUE_LEN} characters"
            ));
        }
    }
    Ok(())
}

/* ============================= EXTRACTION ============================= */

fn parse_output(output: serde_json::Value) -> Result<BTreeMap<String, Vec<String>>, String> {
    let serde_json::Value::Object(map) = output else {
        return Err("output is not an object".to_string());
    };

    let mut labels = BTreeMap::new();
    for (key, value) in map {
        let serde_json::Value::Array(items) = value else {
            return Err(format!("key '{key}' does not map to an array"));
        };
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            match item {
                serde_json::Value::String(s) => values.push(s),
                other => return Err(format!("key '{key}' has non-string value: {other}")),
            }
        }
        labels.insert(key, values);
    }
    Ok(labels)
}

/// Run the custom-labels policy and post-process its output: parse, strip
/// reserved keys (logged and counted per key), then enforce the size limits.
///
/// Every failure mode degrades to `None`: custom labels are optional and
/// never fail the phase.
pub async fn extract_custom_labels(
    policy: &CompiledPolicy,
    input: serde_json::Value,
    timeout: Duration,
) -> Option<BTreeMap<String, Vec<String>>> {
    let policy = policy.clone();
    let evaluated = tokio::time::timeout(
        timeout,
        tokio::task::spawn_blocking(move || policy.evaluate(&input)),
    )
    .await;

    let output = match evaluated {
        Ok(Ok(Ok(output))) => output,
        Ok(Ok(Err(PolicyError::Undefined))) => return None,
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "custom_labels_evaluation_failed");
            return None;
        }
        Ok(Err(join)) => {
            warn!(error = %join, "custom_labels_evaluation_panicked");
            return None;
        }
        Err(_) => {
            warn!(timeout = ?timeout, "custom_labels_evaluation_timed_out");
            return None;
        }
    };

    let raw = match parse_output(output) {
        Ok(raw) => raw,
        Err(reason) => {
            warn!(%reason, "custom_labels_output_rejected");
            return None;
        }
    };

    let (kept, blocked) = strip_reserved(raw);
    if !blocked.is_empty() {
        warn!(blocked = ?blocked, "custom_labels_reserved_keys_stripped");
        for key in &blocked {
            metrics::REGO_SECURITY_BLOCKS.with_label_values(&[key]).inc();
        }
    }

    if let Err(reason) = validate_limits(&kept) {
        warn!(%reason, "custom_labels_limits_exceeded_dropping_all");
        return None;
    }

    if kept.is_empty() { None } else { Some(kept) }
}

/* ============================= TESTS ============================= */
