use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DynamicObject};
use kube::{Client, discovery};
use tracing::{debug, warn};

use crate::cache::{CacheKey, TtlCache};
use crate::crd::OwnerLink;

pub const DEFAULT_MAX_DEPTH: usize = 10;

/* ============================= LOOKUP ============================= */

/// Outcome of resolving one object while walking the chain.
pub enum LookupResult {
    /// The object exists; these are its owner references.
    Found(Vec<OwnerReference>),
    /// The object is gone; the chain ends cleanly here.
    NotFound,
    /// The fetch failed (RBAC, timeout, network); the chain is partial.
    Failed(String),
}

/// Resolves an owner link to its owner references. Abstracted so the
/// traversal is testable without a cluster.
pub trait OwnerLookup: Sync {
    fn owner_refs<'a>(&'a self, link: &'a OwnerLink) -> BoxFuture<'a, LookupResult>;
}

/* ============================= CHAIN ============================= */

/// Ordered owner chain starting at the target. `complete` is false when a
/// transient lookup failure cut the walk short.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerChain {
    pub links: Vec<OwnerLink>,
    pub complete: bool,
}

/// First owner reference flagged as the controller, if any.
pub fn controller_owner(refs: &[OwnerReference]) -> Option<&OwnerReference> {
    refs.iter().find(|r| r.controller == Some(true))
}

/// Kinds that live outside any namespace; their chain entries carry an empty
/// namespace string.
pub fn is_cluster_scoped_kind(kind: &str) -> bool {
    matches!(
        kind,
        "Node"
            | "Namespace"
            | "PersistentVolume"
            | "ClusterRole"
            | "ClusterRoleBinding"
            | "StorageClass"
            | "CustomResourceDefinition"
    )
}

/// The chain entry for an owner of `child`: cluster-scoped owners get an
/// empty namespace, everything else inherits the child's.
pub fn link_for_owner(owner: &OwnerReference, child_namespace: &str) -> OwnerLink {
    OwnerLink {
        namespace: if is_cluster_scoped_kind(&owner.kind) {
            String::new()
        } else {
            child_namespace.to_string()
        },
        kind: owner.kind.clone(),
        name: owner.name.clone(),
    }
}

/// Walk controller-owners from `start` until the top-most controller, the
/// depth bound, or a cycle. The chain always begins with `start` itself.
pub async fn walk_owner_chain(
    start: OwnerLink,
    lookup: &dyn OwnerLookup,
    max_depth: usize,
) -> OwnerChain {
    let mut links = vec![start.clone()];
    let mut visited: HashSet<OwnerLink> = HashSet::from([start.clone()]);
    let mut current = start;

    for _ in 0..max_depth {
        let refs = match lookup.owner_refs(&current).await {
            LookupResult::Found(refs) => refs,
            LookupResult::NotFound => {
                debug!(kind = %current.kind, name = %current.name, "owner_chain_link_gone");
                return OwnerChain { links, complete: true };
            }
            LookupResult::Failed(reason) => {
                warn!(kind = %current.kind, name = %current.name, %reason, "owner_chain_lookup_failed");
                return OwnerChain { links, complete: false };
            }
        };

        let Some(owner) = controller_owner(&refs) else {
            return OwnerChain { links, complete: true };
        };

        let next = link_for_owner(owner, &current.namespace);
        if !visited.insert(next.clone()) {
            warn!(kind = %next.kind, name = %next.name, "owner_chain_cycle_detected");
            return OwnerChain { links, complete: true };
        }

        links.push(next.clone());
        current = next;
    }

    debug!(depth = max_depth, "owner_chain_depth_bound_reached");
    OwnerChain { links, complete: true }
}

/* ============================= API LOOKUP ============================= */

/// Cluster-backed lookup resolving arbitrary owner kinds through API
/// discovery. Discovery runs once at construction; per-link fetches reuse it
/// and are routed through the TTL cache keyed by (kind, namespace, name).
pub struct ApiOwnerLookup {
    client: Client,
    cache: Arc<TtlCache>,
    discovery: discovery::Discovery,
}

impl ApiOwnerLookup {
    /// Run API discovery and build a lookup. Discovery failure is reported
    /// to the caller as a transient enrichment error.
    pub async fn discover(client: Client, cache: Arc<TtlCache>) -> Result<Self, kube::Error> {
        let discovery = discovery::Discovery::new(client.clone()).run().await?;
        Ok(ApiOwnerLookup {
            client,
            cache,
            discovery,
        })
    }

    /// Resolve a kind to its preferred ApiResource + capabilities.
    pub fn resolve_kind(&self, kind: &str) -> Option<(discovery::ApiResource, discovery::ApiCapabilities)> {
        self.discovery
            .groups()
            .flat_map(|g| g.recommended_resources())
            .find(|(ar, _)| ar.kind == kind)
    }

    /// Fetch the object a chain link points at, consulting the TTL cache
    /// first. `Ok(None)` covers both a 404 and an owner kind the API server
    /// no longer serves; not-found results are never cached.
    pub async fn fetch_object(&self, link: &OwnerLink) -> Result<Option<DynamicObject>, kube::Error> {
        let key = CacheKey::new(&link.kind, &link.namespace, &link.name);
        if let Some(cached) = self.cache.get::<DynamicObject>(&key) {
            return Ok(Some(cached));
        }

        let Some((resource, caps)) = self.resolve_kind(&link.kind) else {
            return Ok(None);
        };

        let api: Api<DynamicObject> = if caps.scope == discovery::Scope::Cluster {
            Api::all_with(self.client.clone(), &resource)
        } else {
            Api::namespaced_with(self.client.clone(), &link.namespace, &resource)
        };

        match api.get(&link.name).await {
            Ok(obj) => {
                self.cache.insert(key, &obj);
                Ok(Some(obj))
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch(&self, link: &OwnerLink) -> LookupResult {
        match self.fetch_object(link).await {
            Ok(Some(obj)) => {
                LookupResult::Found(obj.metadata.owner_references.unwrap_or_default())
            }
            Ok(None) => LookupResult::NotFound,
            Err(e) => LookupResult::Failed(e.to_string()),
        }
    }
}

impl OwnerLookup for ApiOwnerLookup {
    fn owner_refs<'a>(&'a self, link: &'a OwnerLink) -> BoxFuture<'a, LookupResult> {
        Box::pin(self.fetch(link))
    }
}

/* ============================= TESTS ============================= */
