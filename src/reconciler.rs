use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt, discovery};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{self, AuditEmitter, AuditEvent};
use crate::cache::TtlCache;
use crate::classify::{self, NamespaceInfo};
use crate::conditions;
use crate::config::OperatorConfig;
use crate::crd::{
    ProcessingPhase, SignalProcessing, SignalProcessingSpec, SignalProcessingStatus,
};
use crate::enrich::Enricher;
use crate::error::{Error, Result};
use crate::labels;
use crate::metrics;
use crate::policy;
use crate::retry::{self, ErrorClass};

pub const FINALIZER: &str = "signalprocessing.kubernaut.io/cleanup";
const FIELD_MANAGER: &str = "signal-processor";
const STATUS_WRITE_ATTEMPTS: u32 = 3;

/* ============================= CONTEXT ============================= */

pub struct Context {
    pub client: Client,
    pub bundle: policy::SharedBundle,
    pub audit: AuditEmitter,
    pub cache: Arc<TtlCache>,
    pub config: OperatorConfig,
    pub reporter: Reporter,
}

impl Context {
    fn enricher(&self) -> Enricher {
        Enricher::new(self.client.clone(), self.cache.clone(), self.config.enrich)
    }
}

/* ============================= PURE HELPERS ============================= */

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Correlation id propagated to the audit sink: the orchestrator parent's
/// coordinates.
pub fn correlation_id(spec: &SignalProcessingSpec) -> String {
    format!("{}/{}", spec.parent_ref.namespace, spec.parent_ref.name)
}

/// True when the current phase has run past the configured timeout.
pub fn phase_deadline_exceeded(
    status: &SignalProcessingStatus,
    now: DateTime<Utc>,
    timeout: Duration,
) -> bool {
    let Some(started) = status
        .phase_start_time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
    else {
        return false;
    };
    let elapsed = now.signed_duration_since(started.with_timezone(&Utc));
    elapsed.num_seconds() >= 0 && elapsed.to_std().is_ok_and(|e| e > timeout)
}

/// Where a timed-out phase advances to under the degraded-mode policy.
pub fn degraded_advance_target(phase: ProcessingPhase) -> Option<ProcessingPhase> {
    match phase {
        ProcessingPhase::Enriching => Some(ProcessingPhase::Classifying),
        ProcessingPhase::Classifying => Some(ProcessingPhase::Categorizing),
        ProcessingPhase::Categorizing => Some(ProcessingPhase::Completed),
        _ => None,
    }
}

/// Record a successful transition: new phase, fresh phase clock, and the
/// consecutive-failure counter reset.
pub fn transition(status: &mut SignalProcessingStatus, phase: ProcessingPhase, now: &str) {
    status.phase = Some(phase);
    status.phase_start_time = Some(now.to_string());
    status.consecutive_failures = Some(0);
}

pub fn has_finalizer(sp: &SignalProcessing) -> bool {
    sp.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == FINALIZER))
}

fn format_duration(from: &str, to: &str) -> Option<String> {
    let from = DateTime::parse_from_rfc3339(from).ok()?;
    let to = DateTime::parse_from_rfc3339(to).ok()?;
    let elapsed = to.signed_duration_since(from).to_std().ok()?;
    Some(format!("{:.1}s", elapsed.as_secs_f64()))
}

fn duration_ms(from: Option<&str>, to: &str) -> u64 {
    let Some(from) = from.and_then(|t| DateTime::parse_from_rfc3339(t).ok()) else {
        return 0;
    };
    let Ok(to) = DateTime::parse_from_rfc3339(to) else {
        return 0;
    };
    to.signed_duration_since(from)
        .num_milliseconds()
        .try_into()
        .unwrap_or(0)
}

/* ============================= RECONCILE ============================= */

pub async fn reconcile(sp: Arc<SignalProcessing>, ctx: Arc<Context>) -> Result<Action> {
    let name = sp.name_any();
    let namespace = sp.namespace().unwrap_or_default();

    if sp.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&sp, &ctx).await;
    }

    ensure_finalizer(&sp, &ctx.client).await?;
    ensure_owner_reference(&sp, &ctx).await;

    let mut status = sp.status.clone().unwrap_or_default();
    let phase = status.phase();

    // Terminal resources are never touched again (finalizer removal aside).
    if phase.is_terminal() {
        debug!(resource = %name, %phase, "reconcile_skip_terminal");
        return Ok(Action::await_change());
    }

    let now = now_rfc3339();

    // Empty phase: initialize to Pending and come back immediately.
    if status.phase.is_none() {
        status.start_time = Some(now.clone());
        transition(&mut status, ProcessingPhase::Pending, &now);
        write_status(&ctx.client, &namespace, &name, &status).await?;
        info!(resource = %name, namespace = %namespace, "reconcile_initialized");
        return Ok(Action::requeue(Duration::ZERO));
    }

    // Degraded-mode advance when the phase overran its timeout.
    if phase_deadline_exceeded(&status, Utc::now(), ctx.config.phase_timeout) {
        return apply_phase_timeout(&sp, &ctx, status, phase, &now).await;
    }

    info!(resource = %name, namespace = %namespace, %phase, "reconcile_dispatch");
    let timer = metrics::PROCESSING_DURATION
        .with_label_values(&[&phase.to_string()])
        .start_timer();

    // The whole handler is bounded by the phase timeout so outbound calls
    // observe cancellation; the next pass applies the degraded advance.
    let handled = match tokio::time::timeout(
        ctx.config.phase_timeout,
        dispatch(&sp, &ctx, &mut status, &now),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("phase {phase} exceeded {:?}", ctx.config.phase_timeout),
            reason: "Timeout".to_string(),
            code: 504,
        }))),
    };
    timer.observe_duration();

    match handled {
        Ok(()) => {
            metrics::PROCESSING_TOTAL
                .with_label_values(&[&phase.to_string(), "success"])
                .inc();
            write_status(&ctx.client, &namespace, &name, &status).await?;
            if status.phase().is_terminal() {
                Ok(Action::await_change())
            } else {
                Ok(Action::requeue(Duration::ZERO))
            }
        }
        Err(e) => handle_phase_error(&sp, &ctx, status, phase, e, &now).await,
    }
}

async fn dispatch(
    sp: &SignalProcessing,
    ctx: &Context,
    status: &mut SignalProcessingStatus,
    now: &str,
) -> Result<()> {
    match status.phase() {
        ProcessingPhase::Pending => handle_pending(sp, ctx, status, now).await,
        ProcessingPhase::Enriching => handle_enriching(sp, ctx, status, now).await,
        ProcessingPhase::Classifying => handle_classifying(sp, ctx, status, now).await,
        ProcessingPhase::Categorizing => handle_categorizing(sp, ctx, status, now).await,
        ProcessingPhase::Completed | ProcessingPhase::Failed => Ok(()),
    }
}

/* ============================= PHASE HANDLERS ============================= */

async fn handle_pending(
    sp: &SignalProcessing,
    ctx: &Context,
    status: &mut SignalProcessingStatus,
    now: &str,
) -> Result<()> {
    let signal = &sp.spec.signal;
    if signal.fingerprint.is_empty() {
        return Err(Error::Validation("signal.fingerprint is required".to_string()));
    }
    if signal.target_resource.is_none() {
        return Err(Error::Validation("signal.targetResource is required".to_string()));
    }

    transition(status, ProcessingPhase::Enriching, now);
    emit_phase_transition(ctx, sp, ProcessingPhase::Pending, ProcessingPhase::Enriching, status);
    publish_event(
        ctx,
        sp,
        EventType::Normal,
        "PhaseTransition",
        format!("Validated signal {}; enriching", signal.fingerprint),
    )
    .await;
    Ok(())
}

async fn handle_enriching(
    sp: &SignalProcessing,
    ctx: &Context,
    status: &mut SignalProcessingStatus,
    now: &str,
) -> Result<()> {
    let outcome = ctx.enricher().enrich(&sp.spec).await?;

    status.enrichment = Some(outcome.enrichment);
    status.failed_detections = if outcome.failed_detections.is_empty() {
        None
    } else {
        Some(outcome.failed_detections)
    };

    let conditions_vec = status.conditions.get_or_insert_with(Vec::new);
    conditions::set_condition(
        conditions_vec,
        conditions::ENRICHMENT_COMPLETE,
        "True",
        outcome.condition_reason,
        "",
        now,
    );

    transition(status, ProcessingPhase::Classifying, now);
    emit_phase_transition(ctx, sp, ProcessingPhase::Enriching, ProcessingPhase::Classifying, status);

    let mut event = AuditEvent::new(
        audit::EVENT_ENRICHMENT_COMPLETED,
        &sp.spec.signal.fingerprint,
        &correlation_id(&sp.spec),
    );
    event.duration_ms = duration_ms(status.start_time.as_deref(), now);
    ctx.audit.emit(event.with_detail("degraded", json!(outcome.degraded)));

    let event_type = if outcome.degraded {
        EventType::Warning
    } else {
        EventType::Normal
    };
    publish_event(
        ctx,
        sp,
        event_type,
        outcome.condition_reason,
        "Enrichment complete; classifying".to_string(),
    )
    .await;
    Ok(())
}

/// Namespace facts for the classifiers, absent when enrichment ran degraded.
fn namespace_info(status: &SignalProcessingStatus) -> Option<NamespaceInfo> {
    let enrichment = status.enrichment.as_ref()?;
    if enrichment.degraded_mode == Some(true) {
        return None;
    }
    let context = enrichment.kubernetes_context.as_ref()?;
    Some(NamespaceInfo {
        name: context.namespace.clone()?,
        labels: context.namespace_labels.clone(),
        annotations: context.namespace_annotations.clone(),
    })
}

async fn handle_classifying(
    sp: &SignalProcessing,
    ctx: &Context,
    status: &mut SignalProcessingStatus,
    now: &str,
) -> Result<()> {
    let bundle = policy::snapshot(&ctx.bundle).await;
    let signal = &sp.spec.signal;
    let eval_timeout = ctx.config.eval_timeout;

    let ns_info = namespace_info(status);
    let context = status
        .enrichment
        .as_ref()
        .and_then(|e| e.kubernetes_context.as_ref());
    let detected = status
        .enrichment
        .as_ref()
        .and_then(|e| e.detected_labels.clone())
        .unwrap_or_default();
    let deployment_labels = context
        .and_then(|c| c.controller.as_ref())
        .map(|c| c.labels.clone())
        .unwrap_or_default();
    let namespace_labels = context
        .map(|c| c.namespace_labels.clone())
        .unwrap_or_default();

    let severity = classify::classify_severity(
        &bundle,
        signal.severity.as_deref(),
        eval_timeout,
        now,
    )
    .await;
    let environment =
        classify::classify_environment(&bundle, ns_info.as_ref(), signal, eval_timeout, now).await;
    let priority = classify::classify_priority(
        &bundle,
        signal,
        &environment.environment,
        &namespace_labels,
        &deployment_labels,
        &detected,
        &severity.severity,
        eval_timeout,
        now,
    )
    .await;

    let reason = if severity.source == classify::SOURCE_FALLBACK {
        conditions::REASON_SEVERITY_FALLBACK
    } else {
        conditions::REASON_CLASSIFICATION_SUCCEEDED
    };

    let mut event = AuditEvent::new(
        audit::EVENT_CLASSIFICATION_DECISION,
        &signal.fingerprint,
        &correlation_id(&sp.spec),
    );
    event.environment = Some(environment.environment.clone());
    event.priority = Some(priority.priority.clone());
    event.severity = Some(severity.severity.clone());
    event.policy_version = Some(bundle.digest.clone());
    event.duration_ms = duration_ms(status.start_time.as_deref(), now);
    ctx.audit.emit(event);

    status.environment_classification = Some(environment);
    status.priority_assignment = Some(priority);
    status.severity_classification = Some(severity);

    let conditions_vec = status.conditions.get_or_insert_with(Vec::new);
    conditions::set_condition(
        conditions_vec,
        conditions::CLASSIFICATION_COMPLETE,
        "True",
        reason,
        "",
        now,
    );

    transition(status, ProcessingPhase::Categorizing, now);
    emit_phase_transition(ctx, sp, ProcessingPhase::Classifying, ProcessingPhase::Categorizing, status);
    publish_event(
        ctx,
        sp,
        EventType::Normal,
        reason,
        "Classification complete; categorizing".to_string(),
    )
    .await;
    Ok(())
}

/// Input handed to the custom-labels policy: the enrichment context and
/// classifications, with signal labels/annotations only under the clearly
/// marked untrusted key.
fn custom_labels_input(sp: &SignalProcessing, status: &SignalProcessingStatus) -> serde_json::Value {
    let signal = &sp.spec.signal;
    let enrichment = status.enrichment.as_ref();
    json!({
        "signal": classify::sanitized_signal(signal),
        "environment": status
            .environment_classification
            .as_ref()
            .map(|e| e.environment.clone()),
        "priority": status.priority_assignment.as_ref().map(|p| p.priority.clone()),
        "severity": status
            .severity_classification
            .as_ref()
            .map(|s| s.severity.clone()),
        "kubernetes_context": enrichment.and_then(|e| e.kubernetes_context.clone()),
        "detected_labels": enrichment.and_then(|e| e.detected_labels.clone()),
        "owner_chain": enrichment.and_then(|e| e.owner_chain.clone()),
        "untrusted": {
            "signal_labels": signal.labels,
            "signal_annotations": signal.annotations,
        },
    })
}

async fn handle_categorizing(
    sp: &SignalProcessing,
    ctx: &Context,
    status: &mut SignalProcessingStatus,
    now: &str,
) -> Result<()> {
    let bundle = policy::snapshot(&ctx.bundle).await;

    let namespace_labels = status
        .enrichment
        .as_ref()
        .and_then(|e| e.kubernetes_context.as_ref())
        .map(|c| c.namespace_labels.clone());
    let business = classify::classify_business(namespace_labels.as_ref(), now);

    let reason = business
        .invalid_reason
        .unwrap_or(conditions::REASON_CATEGORIZATION_SUCCEEDED);
    status.business_classification = Some(business.classification.clone());

    if let Some(policy) = &bundle.custom_labels {
        let input = custom_labels_input(sp, status);
        status.custom_labels =
            labels::extract_custom_labels(policy, input, ctx.config.eval_timeout).await;
    }

    let conditions_vec = status.conditions.get_or_insert_with(Vec::new);
    conditions::set_condition(
        conditions_vec,
        conditions::CATEGORIZATION_COMPLETE,
        "True",
        reason,
        "",
        now,
    );

    let mut event = AuditEvent::new(
        audit::EVENT_BUSINESS_CLASSIFIED,
        &sp.spec.signal.fingerprint,
        &correlation_id(&sp.spec),
    );
    event.duration_ms = duration_ms(status.start_time.as_deref(), now);
    ctx.audit.emit(
        event
            .with_detail("business_unit", json!(business.classification.business_unit))
            .with_detail("sla_tier", json!(business.classification.sla_tier)),
    );

    complete(sp, ctx, status, now);
    publish_event(
        ctx,
        sp,
        EventType::Normal,
        reason,
        "Categorization complete; processing finished".to_string(),
    )
    .await;
    Ok(())
}

/// Finish processing: terminal Completed phase, duration bookkeeping, the
/// ProcessingComplete condition, and exactly one terminal audit event.
fn complete(
    sp: &SignalProcessing,
    ctx: &Context,
    status: &mut SignalProcessingStatus,
    now: &str,
) {
    status.completed_at = Some(now.to_string());
    if let Some(start) = status.start_time.as_deref() {
        status.processing_duration = format_duration(start, now);
    }

    let (reason, message) = if ctx.audit.is_healthy() {
        (conditions::REASON_PROCESSING_SUCCEEDED, String::new())
    } else {
        (
            conditions::REASON_AUDIT_WRITE_FAILED,
            "audit sink unavailable; events may be missing".to_string(),
        )
    };
    let conditions_vec = status.conditions.get_or_insert_with(Vec::new);
    conditions::set_condition(
        conditions_vec,
        conditions::PROCESSING_COMPLETE,
        "True",
        reason,
        &message,
        now,
    );

    let from = status.phase();
    transition(status, ProcessingPhase::Completed, now);
    emit_phase_transition(ctx, sp, from, ProcessingPhase::Completed, status);

    let mut event = AuditEvent::new(
        audit::EVENT_SIGNAL_PROCESSED,
        &sp.spec.signal.fingerprint,
        &correlation_id(&sp.spec),
    );
    event.environment = status
        .environment_classification
        .as_ref()
        .map(|e| e.environment.clone());
    event.priority = status.priority_assignment.as_ref().map(|p| p.priority.clone());
    event.severity = status
        .severity_classification
        .as_ref()
        .map(|s| s.severity.clone());
    event.duration_ms = duration_ms(status.start_time.as_deref(), now);
    ctx.audit.emit(event);

    info!(
        resource = %sp.name_any(),
        duration = status.processing_duration.as_deref().unwrap_or("unknown"),
        "signal_processed"
    );
}

/* ============================= FAILURE & TIMEOUT ============================= */

/// Fill any classification field a timed-out phase left empty so the
/// degraded advance still satisfies the total-function invariant.
fn fill_fallback_classifications(status: &mut SignalProcessingStatus, now: &str) {
    if status.severity_classification.is_none() {
        status.severity_classification = Some(crate::crd::SeverityClassification {
            severity: classify::UNKNOWN.to_string(),
            external_value: None,
            source: classify::SOURCE_FALLBACK.to_string(),
            classified_at: Some(now.to_string()),
        });
    }
    if status.environment_classification.is_none() {
        status.environment_classification = Some(crate::crd::EnvironmentClassification {
            environment: classify::UNKNOWN.to_string(),
            source: classify::SOURCE_FALLBACK.to_string(),
            classified_at: Some(now.to_string()),
        });
    }
    if status.priority_assignment.is_none() {
        let severity = status
            .severity_classification
            .as_ref()
            .map(|s| s.severity.clone())
            .unwrap_or_else(|| classify::UNKNOWN.to_string());
        status.priority_assignment = Some(crate::crd::PriorityAssignment {
            priority: classify::fallback_priority(&severity).to_string(),
            source: classify::SOURCE_FALLBACK.to_string(),
            score: None,
            classified_at: Some(now.to_string()),
        });
    }
    if status.business_classification.is_none() {
        status.business_classification =
            Some(classify::classify_business(None, now).classification);
    }
}

async fn apply_phase_timeout(
    sp: &SignalProcessing,
    ctx: &Context,
    mut status: SignalProcessingStatus,
    phase: ProcessingPhase,
    now: &str,
) -> Result<Action> {
    let name = sp.name_any();
    let namespace = sp.namespace().unwrap_or_default();

    let Some(target) = degraded_advance_target(phase) else {
        // Pending has no degraded form; restart its clock and try again.
        status.phase_start_time = Some(now.to_string());
        write_status(&ctx.client, &namespace, &name, &status).await?;
        return Ok(Action::requeue(Duration::ZERO));
    };

    warn!(resource = %name, %phase, advance_to = %target, "phase_timeout_degraded_advance");
    metrics::PROCESSING_TOTAL
        .with_label_values(&[&phase.to_string(), "timeout"])
        .inc();

    let conditions_vec = status.conditions.get_or_insert_with(Vec::new);
    conditions::set_condition(
        conditions_vec,
        conditions::PHASE_TIMEOUT,
        "True",
        &phase.to_string(),
        &format!("phase {phase} exceeded {:?}", ctx.config.phase_timeout),
        now,
    );

    match phase {
        ProcessingPhase::Enriching => {
            let enrichment = status.enrichment.get_or_insert_with(Default::default);
            enrichment.degraded_mode = Some(true);
            let conditions_vec = status.conditions.get_or_insert_with(Vec::new);
            conditions::set_condition(
                conditions_vec,
                conditions::ENRICHMENT_COMPLETE,
                "True",
                conditions::REASON_DEGRADED_MODE,
                "enrichment timed out; continuing with partial context",
                now,
            );
        }
        ProcessingPhase::Classifying => {
            fill_fallback_classifications(&mut status, now);
            let conditions_vec = status.conditions.get_or_insert_with(Vec::new);
            conditions::set_condition(
                conditions_vec,
                conditions::CLASSIFICATION_COMPLETE,
                "True",
                conditions::REASON_SEVERITY_FALLBACK,
                "classification timed out; fallback values applied",
                now,
            );
        }
        ProcessingPhase::Categorizing => {
            fill_fallback_classifications(&mut status, now);
            let conditions_vec = status.conditions.get_or_insert_with(Vec::new);
            conditions::set_condition(
                conditions_vec,
                conditions::CATEGORIZATION_COMPLETE,
                "True",
                conditions::REASON_CATEGORIZATION_FAILED,
                "categorization timed out; fallback values applied",
                now,
            );
        }
        _ => {}
    }

    publish_event(
        ctx,
        sp,
        EventType::Warning,
        "PhaseTimeout",
        format!("Phase {phase} timed out; advancing to {target} in degraded mode"),
    )
    .await;

    if target == ProcessingPhase::Completed {
        complete(sp, ctx, &mut status, now);
    } else {
        transition(&mut status, target, now);
        emit_phase_transition(ctx, sp, phase, target, &status);
    }

    write_status(&ctx.client, &namespace, &name, &status).await?;
    if status.phase().is_terminal() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(Duration::ZERO))
    }
}

async fn handle_phase_error(
    sp: &SignalProcessing,
    ctx: &Context,
    mut status: SignalProcessingStatus,
    phase: ProcessingPhase,
    err: Error,
    now: &str,
) -> Result<Action> {
    let name = sp.name_any();
    let namespace = sp.namespace().unwrap_or_default();

    match retry::classify(&err) {
        ErrorClass::Transient => {
            let failures = status.consecutive_failures.unwrap_or(0) + 1;
            status.consecutive_failures = Some(failures);
            status.last_failure_time = Some(now.to_string());
            status.last_error = Some(truncate(&err.to_string(), 256));

            metrics::PROCESSING_TOTAL
                .with_label_values(&[&phase.to_string(), "retry"])
                .inc();

            let delay = retry::delay(&ctx.config.backoff, failures);
            warn!(
                resource = %name,
                %phase,
                error = %err,
                consecutive_failures = failures,
                delay_secs = delay.as_secs(),
                "reconcile_transient_error"
            );

            write_status(&ctx.client, &namespace, &name, &status).await?;
            Ok(Action::requeue(delay))
        }
        ErrorClass::Terminal => {
            metrics::PROCESSING_TOTAL
                .with_label_values(&[&phase.to_string(), "failed"])
                .inc();

            let reason = match &err {
                Error::Validation(_) => conditions::REASON_VALIDATION_FAILED,
                Error::Policy(_) => conditions::REASON_REGO_EVALUATION_ERROR,
                _ => conditions::REASON_PROCESSING_FAILED,
            };
            fail(sp, ctx, &mut status, reason, &err.to_string(), now);

            publish_event(
                ctx,
                sp,
                EventType::Warning,
                reason,
                format!("Processing failed during {phase}: {err}"),
            )
            .await;

            write_status(&ctx.client, &namespace, &name, &status).await?;
            Ok(Action::await_change())
        }
    }
}

/// Terminal failure: Failed phase, ProcessingComplete False, and the
/// error audit event.
fn fail(
    sp: &SignalProcessing,
    ctx: &Context,
    status: &mut SignalProcessingStatus,
    reason: &str,
    message: &str,
    now: &str,
) {
    status.last_error = Some(truncate(message, 256));
    status.completed_at = Some(now.to_string());
    if let Some(start) = status.start_time.as_deref() {
        status.processing_duration = format_duration(start, now);
    }

    let conditions_vec = status.conditions.get_or_insert_with(Vec::new);
    conditions::set_condition(
        conditions_vec,
        conditions::PROCESSING_COMPLETE,
        "False",
        reason,
        message,
        now,
    );

    let from = status.phase();
    transition(status, ProcessingPhase::Failed, now);
    emit_phase_transition(ctx, sp, from, ProcessingPhase::Failed, status);

    let mut event = AuditEvent::new(
        audit::EVENT_ERROR_OCCURRED,
        &sp.spec.signal.fingerprint,
        &correlation_id(&sp.spec),
    );
    event.duration_ms = duration_ms(status.start_time.as_deref(), now);
    ctx.audit.emit(
        event
            .with_detail("reason", json!(reason))
            .with_detail("message", json!(message)),
    );

    warn!(resource = %sp.name_any(), %reason, %message, "signal_processing_failed");
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

/* ============================= DELETION ============================= */

async fn handle_deletion(sp: &SignalProcessing, ctx: &Context) -> Result<Action> {
    let name = sp.name_any();
    let namespace = sp.namespace().unwrap_or_default();

    if has_finalizer(sp) {
        // Attempt the terminal audit before letting the resource go.
        let phase = sp.status.as_ref().map(|s| s.phase()).unwrap_or_default();
        if !phase.is_terminal() {
            let event = AuditEvent::new(
                audit::EVENT_ERROR_OCCURRED,
                &sp.spec.signal.fingerprint,
                &correlation_id(&sp.spec),
            )
            .with_detail("reason", json!("DeletedBeforeCompletion"))
            .with_detail("phase", json!(phase.to_string()));
            ctx.audit.emit(event);
        }

        remove_finalizer(sp, &ctx.client).await?;
        info!(resource = %name, namespace = %namespace, "finalizer_removed");
    }

    Ok(Action::await_change())
}

/* ============================= METADATA ============================= */

async fn ensure_finalizer(sp: &SignalProcessing, client: &Client) -> Result<()> {
    if has_finalizer(sp) {
        return Ok(());
    }

    let name = sp.name_any();
    let namespace = sp.namespace().unwrap_or_default();
    let api: Api<SignalProcessing> = Api::namespaced(client.clone(), &namespace);

    let mut finalizers = sp.metadata.finalizers.clone().unwrap_or_default();
    finalizers.push(FINALIZER.to_string());

    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    debug!(resource = %name, "finalizer_added");
    Ok(())
}

async fn remove_finalizer(sp: &SignalProcessing, client: &Client) -> Result<()> {
    let name = sp.name_any();
    let namespace = sp.namespace().unwrap_or_default();
    let api: Api<SignalProcessing> = Api::namespaced(client.clone(), &namespace);

    let finalizers: Vec<String> = sp
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != FINALIZER)
        .collect();

    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Repair a missing owner reference to the orchestrator parent. Best-effort:
/// the orchestrator normally sets this at creation, and processing continues
/// without it.
async fn ensure_owner_reference(sp: &SignalProcessing, ctx: &Context) {
    let parent = &sp.spec.parent_ref;
    let already_owned = sp
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.name == parent.name));
    if already_owned || parent.name.is_empty() {
        return;
    }

    let gvk = match ctx.config.parent_api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, &ctx.config.parent_kind),
        None => GroupVersionKind::gvk("", &ctx.config.parent_api_version, &ctx.config.parent_kind),
    };
    let resource = discovery::ApiResource::from_gvk(&gvk);
    let api: Api<DynamicObject> =
        Api::namespaced_with(ctx.client.clone(), &parent.namespace, &resource);

    let parent_obj = match api.get(&parent.name).await {
        Ok(obj) => obj,
        Err(e) => {
            warn!(parent = %parent.name, error = %e, "owner_reference_repair_skipped");
            return;
        }
    };
    let Some(uid) = parent_obj.metadata.uid.clone() else {
        return;
    };

    let mut refs = sp.metadata.owner_references.clone().unwrap_or_default();
    refs.push(OwnerReference {
        api_version: ctx.config.parent_api_version.clone(),
        kind: ctx.config.parent_kind.clone(),
        name: parent.name.clone(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    });

    let name = sp.name_any();
    let namespace = sp.namespace().unwrap_or_default();
    let api: Api<SignalProcessing> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = json!({"metadata": {"ownerReferences": refs}});
    if let Err(e) = api
        .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        warn!(resource = %name, error = %e, "owner_reference_patch_failed");
    } else {
        info!(resource = %name, parent = %parent.name, "owner_reference_repaired");
    }
}

/* ============================= STATUS WRITES ============================= */

/// Merge-patch the status subresource, retrying bounded times on optimistic
/// concurrency conflicts.
pub async fn write_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &SignalProcessingStatus,
) -> Result<()> {
    let api: Api<SignalProcessing> = Api::namespaced(client.clone(), namespace);
    let patch = json!({"status": status});

    let mut last_conflict = String::new();
    for attempt in 1..=STATUS_WRITE_ATTEMPTS {
        match api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                debug!(resource = %name, attempt, "status_write_conflict_retry");
                last_conflict = resp.message;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::StatusConflict(last_conflict))
}

/* ============================= EVENTS & AUDIT ============================= */

fn emit_phase_transition(
    ctx: &Context,
    sp: &SignalProcessing,
    from: ProcessingPhase,
    to: ProcessingPhase,
    status: &SignalProcessingStatus,
) {
    let mut event = AuditEvent::new(
        audit::EVENT_PHASE_TRANSITION,
        &sp.spec.signal.fingerprint,
        &correlation_id(&sp.spec),
    );
    event.duration_ms = duration_ms(status.start_time.as_deref(), &now_rfc3339());
    ctx.audit.emit(
        event
            .with_detail("from", json!(from.to_string()))
            .with_detail("to", json!(to.to_string())),
    );
}

async fn publish_event(
    ctx: &Context,
    sp: &SignalProcessing,
    event_type: EventType,
    reason: &str,
    note: String,
) {
    let recorder = Recorder::new(ctx.client.clone(), ctx.reporter.clone(), sp.object_ref(&()));
    // Event emission is advisory; failures never affect reconciliation.
    let _ = recorder
        .publish(Event {
            type_: event_type,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        })
        .await;
}

/* ============================= ERROR POLICY ============================= */

pub fn error_policy(sp: Arc<SignalProcessing>, error: &Error, ctx: Arc<Context>) -> Action {
    let failures = sp
        .status
        .as_ref()
        .and_then(|s| s.consecutive_failures)
        .unwrap_or(0)
        + 1;
    let delay = retry::delay(&ctx.config.backoff, failures);

    warn!(
        resource = %sp.name_any(),
        error = %error,
        consecutive_failures = failures,
        delay_secs = delay.as_secs(),
        "reconcile_error_requeued"
    );
    Action::requeue(delay)
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ParentRef, Signal};

    fn spec() -> SignalProcessingSpec {
        SignalProcessingSpec {
            parent_ref: ParentRef {
                name: "remediation-1".to_string(),
                namespace: "kubernaut-system".to_string(),
            },
            signal: Signal {
                fingerprint: "fp-1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_correlation_id_uses_parent_coordinates() {
        assert_eq!(correlation_id(&spec()), "kubernaut-system/remediation-1");
    }

    #[test]
    fn test_transition_resets_failure_counter() {
        let mut status = SignalProcessingStatus {
            consecutive_failures: Some(4),
            ..Default::default()
        };
        transition(&mut status, ProcessingPhase::Enriching, "2026-01-01T00:00:00Z");

        assert_eq!(status.phase, Some(ProcessingPhase::Enriching));
        assert_eq!(status.consecutive_failures, Some(0));
        assert_eq!(status.phase_start_time.as_deref(), Some("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn test_degraded_advance_targets() {
        assert_eq!(
            degraded_advance_target(ProcessingPhase::Enriching),
            Some(ProcessingPhase::Classifying)
        );
        assert_eq!(
            degraded_advance_target(ProcessingPhase::Classifying),
            Some(ProcessingPhase::Categorizing)
        );
        assert_eq!(
            degraded_advance_target(ProcessingPhase::Categorizing),
            Some(ProcessingPhase::Completed)
        );
        assert_eq!(degraded_advance_target(ProcessingPhase::Pending), None);
        assert_eq!(degraded_advance_target(ProcessingPhase::Completed), None);
    }

    #[test]
    fn test_phase_deadline_not_exceeded_when_fresh() {
        let now = Utc::now();
        let status = SignalProcessingStatus {
            phase_start_time: Some(now.to_rfc3339()),
            ..Default::default()
        };
        assert!(!phase_deadline_exceeded(&status, now, Duration::from_secs(300)));
    }

    #[test]
    fn test_phase_deadline_exceeded_after_timeout() {
        let now = Utc::now();
        let started = now - chrono::Duration::seconds(301);
        let status = SignalProcessingStatus {
            phase_start_time: Some(started.to_rfc3339()),
            ..Default::default()
        };
        assert!(phase_deadline_exceeded(&status, now, Duration::from_secs(300)));
    }

    #[test]
    fn test_phase_deadline_missing_start_time() {
        let status = SignalProcessingStatus::default();
        assert!(!phase_deadline_exceeded(&status, Utc::now(), Duration::from_secs(300)));
    }

    #[test]
    fn test_format_duration() {
        let d = format_duration("2026-01-01T00:00:00Z", "2026-01-01T00:00:04Z");
        assert_eq!(d.as_deref(), Some("4.0s"));
    }

    #[test]
    fn test_duration_ms() {
        assert_eq!(
            duration_ms(Some("2026-01-01T00:00:00Z"), "2026-01-01T00:00:01Z"),
            1000
        );
        assert_eq!(duration_ms(None, "2026-01-01T00:00:01Z"), 0);
    }

    #[test]
    fn test_has_finalizer() {
        let mut sp = SignalProcessing::new("sig-1", spec());
        assert!(!has_finalizer(&sp));

        sp.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        assert!(has_finalizer(&sp));

        sp.metadata.finalizers = Some(vec!["other/finalizer".to_string()]);
        assert!(!has_finalizer(&sp));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 256), "short");
        let long = "é".repeat(300);
        let truncated = truncate(&long, 256);
        assert!(truncated.len() <= 256);
    }

    #[test]
    fn test_fill_fallback_classifications_total() {
        let mut status = SignalProcessingStatus::default();
        fill_fallback_classifications(&mut status, "2026-01-01T00:00:00Z");

        let severity = status.severity_classification.expect("severity set");
        let environment = status.environment_classification.expect("environment set");
        let priority = status.priority_assignment.expect("priority set");
        let business = status.business_classification.expect("business set");

        assert_eq!(severity.severity, "unknown");
        assert_eq!(environment.environment, "unknown");
        assert_eq!(priority.priority, "P2");
        assert_eq!(priority.source, classify::SOURCE_FALLBACK);
        assert_eq!(business.business_unit, "unknown");
    }

    #[test]
    fn test_fill_fallback_keeps_existing_values() {
        let mut status = SignalProcessingStatus {
            severity_classification: Some(crate::crd::SeverityClassification {
                severity: "critical".to_string(),
                external_value: Some("Sev1".to_string()),
                source: classify::SOURCE_REGO_POLICY.to_string(),
                classified_at: None,
            }),
            ..Default::default()
        };
        fill_fallback_classifications(&mut status, "2026-01-01T00:00:00Z");

        assert_eq!(status.severity_classification.unwrap().severity, "critical");
        // Priority derives from the already-known severity.
        assert_eq!(status.priority_assignment.unwrap().priority, "P1");
    }

    #[test]
    fn test_namespace_info_absent_when_degraded() {
        let status = SignalProcessingStatus {
            enrichment: Some(crate::crd::EnrichmentStatus {
                degraded_mode: Some(true),
                kubernetes_context: Some(crate::crd::KubernetesContext {
                    namespace: Some("prod".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(namespace_info(&status).is_none());
    }

    #[test]
    fn test_namespace_info_present_for_full_enrichment() {
        let status = SignalProcessingStatus {
            enrichment: Some(crate::crd::EnrichmentStatus {
                kubernetes_context: Some(crate::crd::KubernetesContext {
                    namespace: Some("prod".to_string()),
                    namespace_labels: [(
                        classify::ENVIRONMENT_NS_LABEL.to_string(),
                        "production".to_string(),
                    )]
                    .into_iter()
                    .collect(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let info = namespace_info(&status).expect("namespace info");
        assert_eq!(info.name, "prod");
        assert_eq!(
            info.labels.get(classify::ENVIRONMENT_NS_LABEL).map(String::as_str),
            Some("production")
        );
    }

    #[test]
    fn test_custom_labels_input_marks_untrusted() {
        let mut sp_spec = spec();
        sp_spec
            .signal
            .labels
            .insert("environment".to_string(), "hacked".to_string());
        let sp = SignalProcessing::new("sig-1", sp_spec);
        let status = SignalProcessingStatus::default();

        let input = custom_labels_input(&sp, &status);
        // Signal labels appear only under the untrusted key.
        assert_eq!(input["untrusted"]["signal_labels"]["environment"], "hacked");
        assert!(input["signal"].get("labels").is_none());
    }
}
