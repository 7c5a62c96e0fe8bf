use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::{Api, DynamicObject};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, TtlCache};
use crate::conditions;
use crate::crd::{
    ContextQuality, ControllerDetails, EnrichmentStatus, KubernetesContext, NodeDetails,
    OwnerLink, PodDetails, RecoveryContext, Signal, SignalProcessingSpec,
};
use crate::detect::{DetectionInput, Detector};
use crate::error::{Error, Result};
use crate::metrics;
use crate::owners::{ApiOwnerLookup, walk_owner_chain};
use crate::retry::{self, ErrorClass};

/* ============================= CONFIG ============================= */

#[derive(Debug, Clone, Copy)]
pub struct EnrichConfig {
    pub owner_chain_depth: usize,
    /// Per-fetch timeout for individual API probes.
    pub fetch_timeout: Duration,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        EnrichConfig {
            owner_chain_depth: crate::owners::DEFAULT_MAX_DEPTH,
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/* ============================= OUTCOME ============================= */

pub struct EnrichmentOutcome {
    pub enrichment: EnrichmentStatus,
    pub failed_detections: Vec<String>,
    pub degraded: bool,
    /// Reason for the EnrichmentComplete condition.
    pub condition_reason: &'static str,
}

/* ============================= RECOVERY CONTEXT ============================= */

/// Materialize the recovery context from spec fields.
///
/// `complete` quality requires the orchestrator's full failureData; the
/// minimal form built from failedWorkflowRef/failedStep is `degraded`.
pub fn build_recovery_context(spec: &SignalProcessingSpec) -> Option<RecoveryContext> {
    if !spec.is_recovery_attempt {
        return None;
    }

    if let Some(data) = &spec.failure_data {
        return Some(RecoveryContext {
            workflow_ref: data.workflow_ref.clone(),
            step: data.step,
            action: data.action.clone(),
            error_type: data.error_type.clone(),
            reason: data.reason.clone(),
            duration: data.duration.clone(),
            timestamp: data.timestamp.clone(),
            resource_snapshot: data.resource_snapshot.clone(),
            context_quality: ContextQuality::Complete,
        });
    }

    Some(RecoveryContext {
        workflow_ref: spec.failed_workflow_ref.clone(),
        step: spec.failed_step,
        action: None,
        error_type: None,
        reason: spec.failure_reason.clone(),
        duration: None,
        timestamp: None,
        resource_snapshot: None,
        context_quality: ContextQuality::Degraded,
    })
}

/* ============================= DEGRADED CONTEXT ============================= */

/// Minimal context assembled purely from the signal when the target cannot
/// be fetched at all.
pub fn degraded_context(signal: &Signal) -> KubernetesContext {
    let namespace = signal
        .target_resource
        .as_ref()
        .and_then(|t| t.namespace.clone())
        .or_else(|| signal.labels.get("namespace").cloned());

    let pod = signal
        .target_resource
        .as_ref()
        .filter(|t| t.kind == "Pod")
        .map(|t| PodDetails {
            name: t.name.clone(),
            ..Default::default()
        });

    KubernetesContext {
        namespace,
        pod,
        ..Default::default()
    }
}

/* ============================= SNAPSHOT HELPERS ============================= */

pub fn pod_details(pod: &Pod) -> PodDetails {
    let restart_count = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| statuses.iter().map(|cs| cs.restart_count).sum());

    PodDetails {
        name: pod.name_any(),
        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        phase: pod.status.as_ref().and_then(|s| s.phase.clone()),
        restart_count,
        container_names: pod
            .spec
            .as_ref()
            .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default(),
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        annotations: pod.metadata.annotations.clone().unwrap_or_default(),
    }
}

pub fn node_details(node: &Node) -> NodeDetails {
    let info = node.status.as_ref().and_then(|s| s.node_info.as_ref());
    NodeDetails {
        name: node.name_any(),
        kubelet_version: info.map(|i| i.kubelet_version.clone()),
        os_image: info.map(|i| i.os_image.clone()),
        labels: node.metadata.labels.clone().unwrap_or_default(),
    }
}

fn controller_details(link: &OwnerLink, obj: &DynamicObject) -> ControllerDetails {
    ControllerDetails {
        kind: link.kind.clone(),
        name: link.name.clone(),
        replicas: obj
            .data
            .get("spec")
            .and_then(|s| s.get("replicas"))
            .and_then(|r| r.as_i64())
            .map(|r| r as i32),
        labels: obj.metadata.labels.clone().unwrap_or_default(),
        annotations: obj.metadata.annotations.clone().unwrap_or_default(),
    }
}

/* ============================= ENRICHER ============================= */

pub struct Enricher {
    client: Client,
    cache: Arc<TtlCache>,
    config: EnrichConfig,
}

impl Enricher {
    pub fn new(client: Client, cache: Arc<TtlCache>, config: EnrichConfig) -> Self {
        Enricher {
            client,
            cache,
            config,
        }
    }

    /// Assemble the enrichment snapshot for one signal.
    ///
    /// Transient failures on critical fetches (namespace, target) surface as
    /// errors so the reconciler requeues; everything else degrades: not-found
    /// and RBAC-denied targets produce a minimal signal-derived context, and
    /// failed non-critical probes land in `failed_detections`.
    pub async fn enrich(&self, spec: &SignalProcessingSpec) -> Result<EnrichmentOutcome> {
        let signal = &spec.signal;
        let recovery_context = build_recovery_context(spec);

        let Some(target) = signal.target_resource.as_ref() else {
            info!(fingerprint = %signal.fingerprint, "enrichment_degraded_no_target");
            return Ok(EnrichmentOutcome {
                enrichment: EnrichmentStatus {
                    kubernetes_context: Some(degraded_context(signal)),
                    recovery_context,
                    degraded_mode: Some(true),
                    ..Default::default()
                },
                failed_detections: Vec::new(),
                degraded: true,
                condition_reason: conditions::REASON_DEGRADED_MODE,
            });
        };

        let namespace_name = target
            .namespace
            .clone()
            .or_else(|| signal.labels.get("namespace").cloned())
            .unwrap_or_else(|| "default".to_string());

        let mut failed_detections = Vec::new();

        // Namespace and target fetches are independent.
        let (namespace, target_outcome) = tokio::join!(
            self.fetch_namespace(&namespace_name),
            self.fetch_target(target, &namespace_name),
        );
        let namespace = namespace?;

        let (target_labels, pod) = match target_outcome? {
            TargetFetch::Pod(pod) => (pod.metadata.labels.clone().unwrap_or_default(), Some(pod)),
            TargetFetch::Other { labels } => (labels, None),
            TargetFetch::Unreachable(reason) => {
                warn!(
                    kind = %target.kind,
                    name = %target.name,
                    namespace = %namespace_name,
                    %reason,
                    "enrichment_degraded_target_unreachable"
                );
                metrics::ENRICHMENT_ERRORS
                    .with_label_values(&["target_fetch"])
                    .inc();
                let mut context = degraded_context(signal);
                context.namespace = Some(namespace_name.clone());
                if let Some(ns) = &namespace {
                    context.namespace_labels = ns.metadata.labels.clone().unwrap_or_default();
                    context.namespace_annotations =
                        ns.metadata.annotations.clone().unwrap_or_default();
                }
                return Ok(EnrichmentOutcome {
                    enrichment: EnrichmentStatus {
                        kubernetes_context: Some(context),
                        recovery_context,
                        degraded_mode: Some(true),
                        ..Default::default()
                    },
                    failed_detections: vec!["target".to_string()],
                    degraded: true,
                    condition_reason: if reason == "not_found" {
                        conditions::REASON_RESOURCE_NOT_FOUND
                    } else {
                        conditions::REASON_RBAC_DENIED
                    },
                });
            }
        };

        // Owner chain, walked through discovery so arbitrary kinds resolve.
        let start = OwnerLink {
            namespace: namespace_name.clone(),
            kind: target.kind.clone(),
            name: target.name.clone(),
        };
        let owner_chain = match ApiOwnerLookup::discover(self.client.clone(), self.cache.clone()).await {
            Ok(lookup) => {
                let chain =
                    walk_owner_chain(start.clone(), &lookup, self.config.owner_chain_depth).await;
                if !chain.complete {
                    failed_detections.push("ownerChain".to_string());
                }
                // Top-most controller beyond the target itself.
                let controller = match chain.links.last() {
                    Some(top) if chain.links.len() > 1 => {
                        self.fetch_controller(&lookup, top).await
                    }
                    _ => None,
                };
                (chain.links, controller)
            }
            Err(e) => {
                warn!(error = %e, "owner_chain_discovery_failed");
                metrics::ENRICHMENT_ERRORS
                    .with_label_values(&["discovery"])
                    .inc();
                failed_detections.push("ownerChain".to_string());
                (vec![start.clone()], None)
            }
        };
        let (chain_links, controller) = owner_chain;

        // Node details only exist for scheduled pods.
        let node = match pod.as_ref().and_then(|p| p.spec.as_ref()).and_then(|s| s.node_name.clone())
        {
            Some(node_name) => match self.fetch_node(&node_name).await {
                Ok(node) => node.as_ref().map(node_details),
                Err(e) => {
                    warn!(node = %node_name, error = %e, "node_fetch_failed");
                    metrics::ENRICHMENT_ERRORS
                        .with_label_values(&["node_fetch"])
                        .inc();
                    failed_detections.push("node".to_string());
                    None
                }
            },
            None => None,
        };

        let namespace_labels = namespace
            .as_ref()
            .and_then(|ns| ns.metadata.labels.clone())
            .unwrap_or_default();
        let namespace_annotations = namespace
            .as_ref()
            .and_then(|ns| ns.metadata.annotations.clone())
            .unwrap_or_default();

        // Characteristic detection over everything gathered so far.
        let detector = Detector::new(self.client.clone());
        let detection = detector
            .detect(&DetectionInput {
                namespace: &namespace_name,
                namespace_labels: &namespace_labels,
                target_labels: &target_labels,
                pod: pod.as_ref(),
                controller: controller.as_ref(),
                owner_chain: &chain_links,
            })
            .await;
        failed_detections.extend(detection.failed);

        let context = KubernetesContext {
            namespace: Some(namespace_name),
            namespace_labels,
            namespace_annotations,
            pod: pod.as_ref().map(pod_details),
            controller,
            node,
        };

        debug!(
            chain_length = chain_links.len(),
            detected = detection.labels.count(),
            failed = failed_detections.len(),
            "enrichment_assembled"
        );

        Ok(EnrichmentOutcome {
            enrichment: EnrichmentStatus {
                kubernetes_context: Some(context),
                owner_chain: Some(chain_links),
                detected_labels: Some(detection.labels),
                recovery_context,
                degraded_mode: None,
            },
            failed_detections,
            degraded: false,
            condition_reason: conditions::REASON_ENRICHMENT_SUCCEEDED,
        })
    }

    async fn fetch_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let key = CacheKey::new("Namespace", "", name);
        if let Some(cached) = self.cache.get::<Namespace>(&key) {
            return Ok(Some(cached));
        }

        let api: Api<Namespace> = Api::all(self.client.clone());
        match self.timed(api.get(name)).await {
            Ok(ns) => {
                self.cache.insert(key, &ns);
                Ok(Some(ns))
            }
            Err(Error::Kube(kube::Error::Api(resp))) if resp.code == 404 => Ok(None),
            Err(e) if retry::classify(&e) == ErrorClass::Transient => Err(e),
            Err(e) => {
                warn!(namespace = name, error = %e, "namespace_fetch_failed");
                Ok(None)
            }
        }
    }

    async fn fetch_target(
        &self,
        target: &crate::crd::TargetResource,
        namespace: &str,
    ) -> Result<TargetFetch> {
        if target.kind == "Pod" {
            let key = CacheKey::new("Pod", namespace, &target.name);
            if let Some(cached) = self.cache.get::<Pod>(&key) {
                return Ok(TargetFetch::Pod(cached));
            }

            let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
            return match self.timed(api.get(&target.name)).await {
                Ok(pod) => {
                    self.cache.insert(key, &pod);
                    Ok(TargetFetch::Pod(pod))
                }
                Err(Error::Kube(kube::Error::Api(resp))) if resp.code == 404 => {
                    Ok(TargetFetch::Unreachable("not_found".to_string()))
                }
                Err(Error::Kube(kube::Error::Api(resp))) if resp.code == 403 => {
                    Ok(TargetFetch::Unreachable("forbidden".to_string()))
                }
                Err(e) => Err(e),
            };
        }

        // Non-pod targets resolve through discovery; only their labels feed
        // the detector. The lookup routes the fetch through the TTL cache.
        let lookup = match ApiOwnerLookup::discover(self.client.clone(), self.cache.clone()).await {
            Ok(lookup) => lookup,
            Err(e) => {
                let err = Error::Kube(e);
                if retry::classify(&err) == ErrorClass::Transient {
                    return Err(err);
                }
                return Ok(TargetFetch::Unreachable("discovery_failed".to_string()));
            }
        };
        let link = OwnerLink {
            namespace: namespace.to_string(),
            kind: target.kind.clone(),
            name: target.name.clone(),
        };

        match self.timed(lookup.fetch_object(&link)).await {
            Ok(Some(obj)) => Ok(TargetFetch::Other {
                labels: obj.metadata.labels.unwrap_or_default(),
            }),
            Ok(None) => Ok(TargetFetch::Unreachable("not_found".to_string())),
            Err(Error::Kube(kube::Error::Api(resp))) if resp.code == 403 => {
                Ok(TargetFetch::Unreachable("forbidden".to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_node(&self, name: &str) -> Result<Option<Node>> {
        let key = CacheKey::new("Node", "", name);
        if let Some(cached) = self.cache.get::<Node>(&key) {
            return Ok(Some(cached));
        }

        let api: Api<Node> = Api::all(self.client.clone());
        match self.timed(api.get(name)).await {
            Ok(node) => {
                self.cache.insert(key, &node);
                Ok(Some(node))
            }
            Err(Error::Kube(kube::Error::Api(resp))) if resp.code == 404 => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch_controller(
        &self,
        lookup: &ApiOwnerLookup,
        link: &OwnerLink,
    ) -> Option<ControllerDetails> {
        match self.timed(lookup.fetch_object(link)).await {
            Ok(Some(obj)) => Some(controller_details(link, &obj)),
            Ok(None) => None,
            Err(e) => {
                debug!(kind = %link.kind, name = %link.name, error = %e, "controller_fetch_failed");
                None
            }
        }
    }

    /// Wrap a fetch future with the per-probe timeout; elapsing maps to a
    /// transient server-timeout error.
    async fn timed<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, kube::Error>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.fetch_timeout, fut).await {
            Ok(result) => result.map_err(Error::Kube),
            Err(_) => Err(Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("fetch exceeded {:?}", self.config.fetch_timeout),
                reason: "ServerTimeout".to_string(),
                code: 504,
            }))),
        }
    }
}

enum TargetFetch {
    Pod(Pod),
    Other { labels: BTreeMap<String, String> },
    Unreachable(String),
}

/* ============================= TESTS ============================= */
