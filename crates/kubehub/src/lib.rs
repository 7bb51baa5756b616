//! nodeclaim kubehub: control-plane side of claim preparation.
//!
//! Fetches `resource.k8s.io/v1alpha2` ResourceClaims and answers the questions
//! the orchestrator asks about a pod: which claim does a pod claim entry
//! resolve to, may this pod use that claim, and does any container need it.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use k8s_openapi::api::core::v1::{Container, Pod, PodResourceClaim};
use k8s_openapi::api::resource::v1alpha2::ResourceClaim;
use kube::{api::Api, Client};
use nodeclaim_core::{ClaimRecord, DraError, DraResult, ResourceHandle};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Read-only access to ResourceClaim objects.
#[async_trait::async_trait]
pub trait ClaimLookup: Send + Sync {
    /// `NotFound` if the claim does not exist, `ControlPlane` for anything else.
    async fn fetch_claim(&self, namespace: &str, name: &str) -> DraResult<ResourceClaim>;
}

/// Lookup against the API server via kube-rs.
pub struct KubeClaimLookup {
    client: Client,
}

impl KubeClaimLookup {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Use the in-cluster or kubeconfig client.
    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }
}

#[async_trait::async_trait]
impl ClaimLookup for KubeClaimLookup {
    async fn fetch_claim(&self, namespace: &str, name: &str) -> DraResult<ResourceClaim> {
        let api: Api<ResourceClaim> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(claim) => Ok(claim),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                Err(DraError::NotFound(format!("ResourceClaim {}/{}", namespace, name)))
            }
            Err(e) => Err(DraError::ControlPlane(format!("fetching ResourceClaim {}/{}: {}", namespace, name, e))),
        }
    }
}

/// Fixed set of claims served from memory.
#[derive(Default)]
pub struct StaticClaimLookup {
    claims: RwLock<FxHashMap<(String, String), ResourceClaim>>,
    fetches: AtomicUsize,
}

impl StaticClaimLookup {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, claim: ResourceClaim) {
        let key = (
            claim.metadata.namespace.clone().unwrap_or_default(),
            claim.metadata.name.clone().unwrap_or_default(),
        );
        if let Ok(mut claims) = self.claims.write() {
            claims.insert(key, claim);
        }
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        if let Ok(mut claims) = self.claims.write() {
            claims.remove(&(namespace.to_string(), name.to_string()));
        }
    }

    /// Number of `fetch_claim` calls served so far.
    pub fn fetches(&self) -> usize { self.fetches.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl ClaimLookup for StaticClaimLookup {
    async fn fetch_claim(&self, namespace: &str, name: &str) -> DraResult<ResourceClaim> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let claims = self.claims.read().map_err(|_| DraError::ControlPlane("static lookup lock poisoned".into()))?;
        claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| DraError::NotFound(format!("ResourceClaim {}/{}", namespace, name)))
    }
}

// ---- pod helpers ----

pub fn pod_name(pod: &Pod) -> &str { pod.metadata.name.as_deref().unwrap_or("") }

pub fn pod_namespace(pod: &Pod) -> &str { pod.metadata.namespace.as_deref().unwrap_or("default") }

pub fn pod_uid(pod: &Pod) -> DraResult<&str> {
    pod.metadata
        .uid
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| DraError::Validation(format!("pod {}/{} has no uid", pod_namespace(pod), pod_name(pod))))
}

/// The pod's `spec.resourceClaims`.
pub fn pod_resource_claims(pod: &Pod) -> &[PodResourceClaim] {
    pod.spec.as_ref().and_then(|s| s.resource_claims.as_deref()).unwrap_or(&[])
}

/// Names of the pod claims a container lists under `resources.claims`.
pub fn container_claim_names(container: &Container) -> impl Iterator<Item = &str> {
    container
        .resources
        .as_ref()
        .and_then(|r| r.claims.as_deref())
        .unwrap_or(&[])
        .iter()
        .map(|c| c.name.as_str())
}

/// Outcome of resolving a pod claim entry to a ResourceClaim name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClaim {
    pub name: String,
    /// Claims generated from a template must be owned by the pod.
    pub must_check_owner: bool,
}

/// Resolve a pod claim entry. `Ok(None)` means no claim was generated for it
/// and none is needed.
pub fn resolve_claim_name(pod: &Pod, pod_claim: &PodResourceClaim) -> DraResult<Option<ResolvedClaim>> {
    let source = pod_claim.source.as_ref();
    if let Some(name) = source.and_then(|s| s.resource_claim_name.as_ref()) {
        return Ok(Some(ResolvedClaim { name: name.clone(), must_check_owner: false }));
    }
    if source.and_then(|s| s.resource_claim_template_name.as_ref()).is_some() {
        let statuses = pod.status.as_ref().and_then(|s| s.resource_claim_statuses.as_deref()).unwrap_or(&[]);
        return match statuses.iter().find(|s| s.name == pod_claim.name) {
            Some(status) => Ok(status
                .resource_claim_name
                .clone()
                .map(|name| ResolvedClaim { name, must_check_owner: true })),
            None => Err(DraError::Validation(format!(
                "pod {}/{}: claim for {:?} has not been created yet",
                pod_namespace(pod),
                pod_name(pod),
                pod_claim.name
            ))),
        };
    }
    Err(DraError::Validation(format!(
        "pod {}/{}, spec.resourceClaim {:?}: unsupported claim source",
        pod_namespace(pod),
        pod_name(pod),
        pod_claim.name
    )))
}

/// The claim must be controlled by the pod.
pub fn is_for_pod(pod: &Pod, claim: &ResourceClaim) -> DraResult<()> {
    let uid = pod_uid(pod)?;
    let owned = claim
        .metadata
        .owner_references
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .any(|o| o.controller == Some(true) && o.uid == uid);
    if owned {
        Ok(())
    } else {
        Err(DraError::Validation(format!(
            "ResourceClaim {}/{} was not created for pod {}/{} (pod is not owner)",
            claim.metadata.namespace.as_deref().unwrap_or(""),
            claim.metadata.name.as_deref().unwrap_or(""),
            pod_namespace(pod),
            pod_name(pod)
        )))
    }
}

/// Whether the claim's `status.reservedFor` lists the pod.
pub fn is_reserved_for_pod(pod: &Pod, claim: &ResourceClaim) -> bool {
    let Ok(uid) = pod_uid(pod) else { return false };
    claim
        .status
        .as_ref()
        .and_then(|s| s.reserved_for.as_deref())
        .unwrap_or(&[])
        .iter()
        .any(|r| r.uid == uid)
}

/// Whether any init or regular container consumes the pod claim.
pub fn claim_is_used_by_pod(pod_claim: &PodResourceClaim, pod: &Pod) -> bool {
    let Some(spec) = pod.spec.as_ref() else { return false };
    spec.init_containers
        .iter()
        .flatten()
        .chain(spec.containers.iter())
        .any(|c| container_claim_names(c).any(|n| n == pod_claim.name))
}

/// Fresh cache record for an allocated claim. A claim allocated without
/// resource handles gets one empty handle, routed to the claim's driver.
pub fn record_from_claim(claim: &ResourceClaim) -> DraResult<ClaimRecord> {
    let namespace = claim.metadata.namespace.clone().unwrap_or_default();
    let name = claim.metadata.name.clone().unwrap_or_default();
    let uid = claim
        .metadata
        .uid
        .clone()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| DraError::Validation(format!("ResourceClaim {}/{} has no uid", namespace, name)))?;
    let status = claim.status.as_ref();
    let allocation = status
        .and_then(|s| s.allocation.as_ref())
        .ok_or_else(|| DraError::Validation(format!("ResourceClaim {}/{} is not allocated", namespace, name)))?;
    let driver_name = status.and_then(|s| s.driver_name.clone()).unwrap_or_default();

    let mut handles = Vec::new();
    for h in allocation.resource_handles.iter().flatten() {
        let structured_data = h
            .structured_data
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| DraError::Validation(format!("ResourceClaim {}/{}: structured handle: {}", namespace, name, e)))?;
        handles.push(ResourceHandle {
            driver_name: h.driver_name.clone().unwrap_or_default(),
            data: h.data.clone().unwrap_or_default(),
            structured_data,
        });
    }
    if handles.is_empty() {
        handles.push(ResourceHandle { driver_name: String::new(), data: String::new(), structured_data: None });
    }
    debug!(claim = %format!("{}/{}", namespace, name), handles = handles.len(), driver = %driver_name, "claim record built");
    Ok(ClaimRecord::new(uid, name, namespace, driver_name, handles))
}
