use crate::policy::PolicyError;

/// Errors surfaced from the reconcile path.
///
/// The retry layer inspects these to decide between a backoff-jittered
/// requeue and a terminal `Failed` phase (see `crate::retry`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("spec validation failed: {0}")]
    Validation(String),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("enrichment failed: {0}")]
    Enrichment(String),

    #[error("status update failed after retries: {0}")]
    StatusConflict(String),

    #[error("shutting down")]
    Shutdown,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
