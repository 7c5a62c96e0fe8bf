use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;

/* ============================= EVENT TYPES ============================= */

pub const EVENT_PHASE_TRANSITION: &str = "signalprocessing.phase.transition";
pub const EVENT_ENRICHMENT_COMPLETED: &str = "signalprocessing.enrichment.completed";
pub const EVENT_CLASSIFICATION_DECISION: &str = "signalprocessing.classification.decision";
pub const EVENT_BUSINESS_CLASSIFIED: &str = "signalprocessing.business.classified";
pub const EVENT_SIGNAL_PROCESSED: &str = "signalprocessing.signal.processed";
pub const EVENT_ERROR_OCCURRED: &str = "signalprocessing.error.occurred";

/* ============================= EVENT ============================= */

/// One structured audit record posted to the external sink.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub signal_id: String,
    pub correlation_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<String>,

    pub duration_ms: u64,

    /// Event-specific payload, flattened into the JSON body.
    #[serde(flatten)]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl AuditEvent {
    pub fn new(event_type: &str, signal_id: &str, correlation_id: &str) -> Self {
        AuditEvent {
            event_type: event_type.to_string(),
            signal_id: signal_id.to_string(),
            correlation_id: correlation_id.to_string(),
            environment: None,
            priority: None,
            severity: None,
            policy_version: None,
            duration_ms: 0,
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

/* ============================= CONFIG ============================= */

#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Sink base URL; `None` disables dispatch (events are logged only).
    pub endpoint: Option<String>,
    pub buffer_size: usize,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            endpoint: None,
            buffer_size: 256,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
        }
    }
}

pub const AUDIT_PATH: &str = "/api/v1/audit/signal-processing";

/* ============================= EMITTER ============================= */

/// Fire-and-forget buffered publisher to the audit sink.
///
/// `emit` never blocks reconciliation: a full buffer drops the event with a
/// metric. The worker retries sink failures internally and drains the queue
/// when the emitter handle is dropped at shutdown.
#[derive(Clone)]
pub struct AuditEmitter {
    tx: mpsc::Sender<AuditEvent>,
    healthy: Arc<AtomicBool>,
}

impl AuditEmitter {
    /// Spawn the dispatch worker and return the emitter plus its join
    /// handle for the shutdown drain.
    pub fn spawn(config: AuditConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let healthy = Arc::new(AtomicBool::new(true));

        let worker_health = healthy.clone();
        let handle = tokio::spawn(async move {
            dispatch_loop(rx, config, worker_health).await;
        });

        (AuditEmitter { tx, healthy }, handle)
    }

    /// Enqueue an event; drops with a metric when the buffer is full.
    pub fn emit(&self, event: AuditEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                metrics::AUDIT_EVENTS_DROPPED.inc();
                warn!(event_type = %event.event_type, "audit_buffer_full_event_dropped");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(event_type = %event.event_type, "audit_worker_stopped_event_dropped");
            }
        }
    }

    /// False once the worker exhausted retries against the sink; used for
    /// the terminal-phase AuditWriteFailed condition reason.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<AuditEvent>,
    config: AuditConfig,
    healthy: Arc<AtomicBool>,
) {
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .unwrap_or_default();

    let url = config.endpoint.as_ref().map(|e| {
        format!("{}{}", e.trim_end_matches('/'), AUDIT_PATH)
    });

    while let Some(event) = rx.recv().await {
        let Some(url) = &url else {
            debug!(event_type = %event.event_type, "audit_sink_disabled_event_logged");
            continue;
        };

        let mut delivered = false;
        for attempt in 1..=config.retry_attempts.max(1) {
            match client.post(url).json(&event).send().await {
                Ok(resp) if resp.status().is_success() => {
                    delivered = true;
                    break;
                }
                Ok(resp) => {
                    warn!(
                        event_type = %event.event_type,
                        status = %resp.status(),
                        attempt,
                        "audit_sink_rejected_event"
                    );
                }
                Err(e) => {
                    warn!(event_type = %event.event_type, error = %e, attempt, "audit_sink_unreachable");
                }
            }
            if attempt < config.retry_attempts {
                tokio::time::sleep(config.retry_delay).await;
            }
        }

        if delivered {
            healthy.store(true, Ordering::Relaxed);
        } else {
            healthy.store(false, Ordering::Relaxed);
            metrics::AUDIT_DISPATCH_FAILURES.inc();
        }
    }

    info!("audit_dispatch_drained");
}

/* ============================= TESTS ============================= */
