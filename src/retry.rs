use std::time::Duration;

use rand::Rng;

use crate::error::Error;
use crate::policy::PolicyError;

/* ============================= TAXONOMY ============================= */

/// Whether an error is worth retrying with backoff or must surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with a backoff-jittered requeue.
    Transient,
    /// Do not retry; surface on status.
    Terminal,
}

/// HTTP status codes the Kubernetes API returns for retryable conditions.
const TRANSIENT_API_CODES: &[u16] = &[408, 429, 500, 502, 503, 504];

fn classify_kube(err: &kube::Error) -> ErrorClass {
    match err {
        kube::Error::Api(resp) => {
            if TRANSIENT_API_CODES.contains(&resp.code) {
                return ErrorClass::Transient;
            }
            match resp.reason.as_str() {
                "Timeout" | "ServerTimeout" | "TooManyRequests" | "ServiceUnavailable" => {
                    ErrorClass::Transient
                }
                _ => ErrorClass::Terminal,
            }
        }
        // Connection-level failures: the API server is unreachable or the
        // request was cut short.
        kube::Error::HyperError(_) | kube::Error::Service(_) => ErrorClass::Transient,
        _ => ErrorClass::Terminal,
    }
}

/// Classify a reconcile-path error.
///
/// Context cancellation during shutdown is modeled as `Error::Shutdown` and
/// stays transient: the next leader resumes the work.
pub fn classify(err: &Error) -> ErrorClass {
    match err {
        Error::Kube(e) => classify_kube(e),
        Error::Shutdown => ErrorClass::Transient,
        Error::StatusConflict(_) => ErrorClass::Transient,
        Error::Policy(PolicyError::Timeout(_)) => ErrorClass::Transient,
        Error::Validation(_)
        | Error::Policy(_)
        | Error::Serde(_)
        | Error::Enrichment(_) => ErrorClass::Terminal,
    }
}

/* ============================= BACKOFF ============================= */

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    /// Uniform jitter fraction, e.g. 0.1 for ±10%.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            base: Duration::from_secs(30),
            multiplier: 2.0,
            cap: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

/// Deterministic part of the delay: `min(base * multiplier^(n-1), cap)`.
///
/// `n` is the consecutive-failure count; `n == 0` is treated as the first
/// failure.
pub fn base_delay(config: &BackoffConfig, consecutive_failures: u32) -> Duration {
    let n = consecutive_failures.max(1);
    let factor = config.multiplier.powi(n as i32 - 1);
    let raw = config.base.as_secs_f64() * factor;
    Duration::from_secs_f64(raw.min(config.cap.as_secs_f64()))
}

/// Full delay with uniform jitter in `[-jitter, +jitter]` applied, spreading
/// retries after a shared-cause failure.
pub fn delay(config: &BackoffConfig, consecutive_failures: u32) -> Duration {
    let base = base_delay(config, consecutive_failures);
    if config.jitter <= 0.0 {
        return base;
    }
    let spread = rand::thread_rng().gen_range(-config.jitter..=config.jitter);
    Duration::from_secs_f64((base.as_secs_f64() * (1.0 + spread)).max(0.0))
}

/* ============================= TESTS ============================= */
