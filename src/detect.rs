use std::collections::BTreeMap;

use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ListParams;
use kube::{Api, Client};
use tracing::error;

use crate::crd::{ControllerDetails, DetectedLabels, OwnerLink};
use crate::metrics;

/* ============================= MARKERS ============================= */

const ARGOCD_INSTANCE_LABEL: &str = "argocd.argoproj.io/instance";
const ARGOCD_TRACKING_ANNOTATION: &str = "argocd.argoproj.io/tracking-id";
const FLUX_KUSTOMIZE_LABEL: &str = "kustomize.toolkit.fluxcd.io/name";
const FLUX_HELM_LABEL: &str = "helm.toolkit.fluxcd.io/name";

const HELM_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const HELM_CHART_ANNOTATION: &str = "helm.sh/chart";
const HELM_CHART_LABEL: &str = "helm.sh/chart";

const POD_SECURITY_ENFORCE_LABEL: &str = "pod-security.kubernetes.io/enforce";

const ISTIO_SIDECAR_CONTAINER: &str = "istio-proxy";
const ISTIO_STATUS_ANNOTATION: &str = "sidecar.istio.io/status";
const LINKERD_SIDECAR_CONTAINER: &str = "linkerd-proxy";
const LINKERD_INJECT_ANNOTATION: &str = "linkerd.io/inject";

/* ============================= PURE PROBES ============================= */

/// GitOps tool recognized from controller labels/annotations, if any.
pub fn detect_gitops(
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> Option<&'static str> {
    if labels.contains_key(ARGOCD_INSTANCE_LABEL)
        || annotations.contains_key(ARGOCD_TRACKING_ANNOTATION)
    {
        return Some("argocd");
    }
    if labels.contains_key(FLUX_KUSTOMIZE_LABEL) || labels.contains_key(FLUX_HELM_LABEL) {
        return Some("flux");
    }
    None
}

pub fn detect_helm(
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> bool {
    labels.get(HELM_MANAGED_BY_LABEL).map(String::as_str) == Some("Helm")
        || annotations.contains_key(HELM_CHART_ANNOTATION)
        || labels.contains_key(HELM_CHART_LABEL)
}

/// Pod Security Standards level enforced on the namespace, if labeled.
pub fn pod_security_level(namespace_labels: &BTreeMap<String, String>) -> Option<String> {
    namespace_labels
        .get(POD_SECURITY_ENFORCE_LABEL)
        .filter(|level| matches!(level.as_str(), "privileged" | "baseline" | "restricted"))
        .cloned()
}

/// Service mesh detected from a sidecar container or injection annotation.
pub fn detect_service_mesh(
    container_names: &[String],
    annotations: &BTreeMap<String, String>,
) -> Option<&'static str> {
    let has_container = |name: &str| container_names.iter().any(|c| c == name);

    if has_container(ISTIO_SIDECAR_CONTAINER) || annotations.contains_key(ISTIO_STATUS_ANNOTATION) {
        return Some("istio");
    }
    if has_container(LINKERD_SIDECAR_CONTAINER)
        || annotations.get(LINKERD_INJECT_ANNOTATION).map(String::as_str) == Some("enabled")
    {
        return Some("linkerd");
    }
    None
}

/// Stateful when the owner chain contains a StatefulSet or the pod mounts a
/// PersistentVolumeClaim.
pub fn detect_stateful(owner_chain: &[OwnerLink], pod: Option<&Pod>) -> bool {
    if owner_chain.iter().any(|link| link.kind == "StatefulSet") {
        return true;
    }
    pod.and_then(|p| p.spec.as_ref())
        .and_then(|spec| spec.volumes.as_ref())
        .is_some_and(|volumes| {
            volumes
                .iter()
                .any(|v| v.persistent_volume_claim.is_some())
        })
}

/* ============================= SELECTOR MATCHING ============================= */

/// Kubernetes label-selector semantics over a flat label map.
///
/// An empty selector matches everything; a `NotIn` expression is satisfied by
/// a missing key.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let actual = labels.get(&expr.key);
            let values = expr.values.as_deref().unwrap_or_default();
            let satisfied = match expr.operator.as_str() {
                "In" => actual.is_some_and(|v| values.iter().any(|candidate| candidate == v)),
                "NotIn" => !actual.is_some_and(|v| values.iter().any(|candidate| candidate == v)),
                "Exists" => actual.is_some(),
                "DoesNotExist" => actual.is_none(),
                _ => false,
            };
            if !satisfied {
                return false;
            }
        }
    }

    true
}

/* ============================= DETECTOR ============================= */

/// Everything the detector needs, assembled by the enricher from objects it
/// already fetched.
pub struct DetectionInput<'a> {
    pub namespace: &'a str,
    pub namespace_labels: &'a BTreeMap<String, String>,
    pub target_labels: &'a BTreeMap<String, String>,
    pub pod: Option<&'a Pod>,
    pub controller: Option<&'a ControllerDetails>,
    pub owner_chain: &'a [OwnerLink],
}

pub struct DetectionOutcome {
    pub labels: DetectedLabels,
    /// Characteristic names whose probe failed (RBAC, timeout, network);
    /// negative probe results are never listed here.
    pub failed: Vec<String>,
}

pub struct Detector {
    client: Client,
}

impl Detector {
    pub fn new(client: Client) -> Self {
        Detector { client }
    }

    /// Run all probes. API probes that fail record the characteristic name
    /// and log at error level; pure probes cannot fail.
    pub async fn detect(&self, input: &DetectionInput<'_>) -> DetectionOutcome {
        let mut labels = DetectedLabels::default();
        let mut failed = Vec::new();

        // Pure probes first: computed from objects already in hand.
        if let Some(controller) = input.controller {
            if let Some(tool) = detect_gitops(&controller.labels, &controller.annotations) {
                labels.git_ops_managed = Some(true);
                labels.git_ops_tool = Some(tool.to_string());
            }
            if detect_helm(&controller.labels, &controller.annotations) {
                labels.helm_managed = Some(true);
            }
        }
        if labels.helm_managed.is_none() {
            let empty = BTreeMap::new();
            let pod_annotations = input
                .pod
                .and_then(|p| p.metadata.annotations.as_ref())
                .unwrap_or(&empty);
            if detect_helm(input.target_labels, pod_annotations) {
                labels.helm_managed = Some(true);
            }
        }

        if detect_stateful(input.owner_chain, input.pod) {
            labels.stateful = Some(true);
        }

        if let Some(level) = pod_security_level(input.namespace_labels) {
            labels.pod_security_level = Some(level);
        }

        if let Some(pod) = input.pod {
            let container_names: Vec<String> = pod
                .spec
                .as_ref()
                .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default();
            let empty = BTreeMap::new();
            let annotations = pod.metadata.annotations.as_ref().unwrap_or(&empty);
            if let Some(mesh) = detect_service_mesh(&container_names, annotations) {
                labels.service_mesh = Some(mesh.to_string());
            }
        }

        // API probes: each failure is a failed detection, not a negative.
        match self.pdb_protected(input.namespace, input.target_labels).await {
            Ok(true) => labels.pdb_protected = Some(true),
            Ok(false) => {}
            Err(e) => record_probe_failure("pdbProtected", &e, &mut failed),
        }

        match self.hpa_enabled(input.namespace, input.owner_chain).await {
            Ok(true) => labels.hpa_enabled = Some(true),
            Ok(false) => {}
            Err(e) => record_probe_failure("hpaEnabled", &e, &mut failed),
        }

        match self
            .network_isolated(input.namespace, input.target_labels)
            .await
        {
            Ok(true) => labels.network_isolated = Some(true),
            Ok(false) => {}
            Err(e) => record_probe_failure("networkIsolated", &e, &mut failed),
        }

        metrics::DETECTED_LABELS_COUNT.set(labels.count() as i64);

        DetectionOutcome { labels, failed }
    }

    /// A PodDisruptionBudget in the namespace selects the target's labels.
    async fn pdb_protected(
        &self,
        namespace: &str,
        target_labels: &BTreeMap<String, String>,
    ) -> Result<bool, kube::Error> {
        let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;

        Ok(list.items.iter().any(|pdb| {
            pdb.spec
                .as_ref()
                .and_then(|s| s.selector.as_ref())
                .is_some_and(|selector| selector_matches(selector, target_labels))
        }))
    }

    /// A HorizontalPodAutoscaler targets any controller in the owner chain.
    async fn hpa_enabled(
        &self,
        namespace: &str,
        owner_chain: &[OwnerLink],
    ) -> Result<bool, kube::Error> {
        if owner_chain.len() < 2 {
            return Ok(false);
        }
        let api: Api<HorizontalPodAutoscaler> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;

        Ok(list.items.iter().any(|hpa| {
            hpa.spec.as_ref().is_some_and(|spec| {
                owner_chain[1..].iter().any(|link| {
                    spec.scale_target_ref.kind == link.kind && spec.scale_target_ref.name == link.name
                })
            })
        }))
    }

    /// Any NetworkPolicy in the namespace selects the target's labels.
    async fn network_isolated(
        &self,
        namespace: &str,
        target_labels: &BTreeMap<String, String>,
    ) -> Result<bool, kube::Error> {
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;

        Ok(list.items.iter().any(|policy| {
            policy
                .spec
                .as_ref()
                .is_some_and(|spec| selector_matches(&spec.pod_selector, target_labels))
        }))
    }
}

fn record_probe_failure(name: &str, err: &kube::Error, failed: &mut Vec<String>) {
    error!(characteristic = name, error = %err, "detection_probe_failed");
    metrics::ENRICHMENT_ERRORS
        .with_label_values(&["detection_probe"])
        .inc();
    failed.push(name.to_string());
}

/* ============================= TESTS ============================= */
