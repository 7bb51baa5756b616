//! nodeclaim core types: claim records, snapshots and errors.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

mod error;

pub use error::{DraError, DraResult};

/// Prefix of the container annotations that carry CDI device names.
pub const CDI_ANNOTATION_PREFIX: &str = "cdi.k8s.io/";

/// Cache key of a claim: namespace plus claim name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimKey {
    pub namespace: String,
    pub name: String,
}

impl ClaimKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One grant issued by a driver for a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Empty means "use the claim's driver".
    #[serde(default)]
    pub driver_name: String,
    /// Opaque payload handed to the plugin as-is.
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_data: Option<serde_json::Value>,
}

/// Container annotation derived from prepared devices.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    pub value: String,
}

/// What a container needs from its prepared claims.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub annotations: Vec<Annotation>,
    pub devices: Vec<String>,
}

/// Preparation state of one claim on this node.
///
/// Identity fields and resource handles are fixed at construction. Pod
/// references, per-plugin devices and the prepared flag only change through
/// the methods below, which the claim cache calls from inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    claim_uid: String,
    claim_name: String,
    namespace: String,
    driver_name: String,
    resource_handles: Vec<ResourceHandle>,
    #[serde(default)]
    pod_uids: BTreeSet<String>,
    #[serde(default)]
    prepared_devices: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    annotations: BTreeMap<String, Vec<Annotation>>,
    #[serde(default)]
    prepared: bool,
    /// Set while an unprepare call has release RPCs in flight. Never persisted.
    #[serde(skip)]
    releasing: bool,
    /// Set while a prepare call has plugin RPCs in flight. Never persisted.
    #[serde(skip)]
    preparing: bool,
}

impl ClaimRecord {
    pub fn new(
        claim_uid: impl Into<String>,
        claim_name: impl Into<String>,
        namespace: impl Into<String>,
        driver_name: impl Into<String>,
        resource_handles: Vec<ResourceHandle>,
    ) -> Self {
        Self {
            claim_uid: claim_uid.into(),
            claim_name: claim_name.into(),
            namespace: namespace.into(),
            driver_name: driver_name.into(),
            resource_handles,
            pod_uids: BTreeSet::new(),
            prepared_devices: BTreeMap::new(),
            annotations: BTreeMap::new(),
            prepared: false,
            releasing: false,
            preparing: false,
        }
    }

    pub fn key(&self) -> ClaimKey { ClaimKey::new(self.namespace.clone(), self.claim_name.clone()) }
    pub fn claim_uid(&self) -> &str { &self.claim_uid }
    pub fn claim_name(&self) -> &str { &self.claim_name }
    pub fn namespace(&self) -> &str { &self.namespace }
    pub fn driver_name(&self) -> &str { &self.driver_name }
    pub fn resource_handles(&self) -> &[ResourceHandle] { &self.resource_handles }
    pub fn is_prepared(&self) -> bool { self.prepared }
    pub fn is_releasing(&self) -> bool { self.releasing }
    pub fn is_preparing(&self) -> bool { self.preparing }

    /// Plugin serving `handle`: the handle's own driver if set, else the claim's driver.
    pub fn plugin_for<'a>(&'a self, handle: &'a ResourceHandle) -> &'a str {
        if handle.driver_name.is_empty() { &self.driver_name } else { &handle.driver_name }
    }

    /// Distinct plugins referenced by the resource handles.
    pub fn plugin_names(&self) -> BTreeSet<String> {
        self.resource_handles.iter().map(|h| self.plugin_for(h).to_string()).collect()
    }

    /// Returns true if the reference was not held before.
    pub fn add_pod_reference(&mut self, pod_uid: &str) -> bool { self.pod_uids.insert(pod_uid.to_string()) }

    /// Returns true if the reference was held.
    pub fn delete_pod_reference(&mut self, pod_uid: &str) -> bool { self.pod_uids.remove(pod_uid) }

    pub fn has_pod_reference(&self, pod_uid: &str) -> bool { self.pod_uids.contains(pod_uid) }
    pub fn pod_reference_count(&self) -> usize { self.pod_uids.len() }
    pub fn pod_uids(&self) -> impl Iterator<Item = &str> { self.pod_uids.iter().map(String::as_str) }

    pub fn set_prepared(&mut self) { self.prepared = true; }
    pub fn set_releasing(&mut self, releasing: bool) { self.releasing = releasing; }
    pub fn set_preparing(&mut self, preparing: bool) { self.preparing = preparing; }

    /// Store the devices `plugin` returned and regenerate its annotations.
    /// The record becomes prepared once every plugin it references has reported.
    pub fn record_plugin_result(&mut self, plugin: &str, devices: Vec<String>) {
        let annotations = cdi_annotations(plugin, &self.claim_uid, &devices);
        self.annotations.insert(plugin.to_string(), annotations);
        self.prepared_devices.insert(plugin.to_string(), devices);
        if self.plugin_names().iter().all(|p| self.prepared_devices.contains_key(p)) {
            self.prepared = true;
        }
    }

    pub fn devices_for(&self, plugin: &str) -> Option<&[String]> {
        self.prepared_devices.get(plugin).map(Vec::as_slice)
    }

    /// All prepared devices, ordered by plugin name.
    pub fn devices_as_list(&self) -> Vec<String> {
        self.prepared_devices.values().flatten().cloned().collect()
    }

    /// All annotations, ordered by plugin name.
    pub fn annotations_as_list(&self) -> Vec<Annotation> {
        self.annotations.values().flatten().cloned().collect()
    }

    /// Detached copy for callers outside the cache lock.
    pub fn snapshot(&self) -> ClaimSnapshot {
        ClaimSnapshot {
            claim_uid: self.claim_uid.clone(),
            claim_name: self.claim_name.clone(),
            namespace: self.namespace.clone(),
            driver_name: self.driver_name.clone(),
            resource_handles: self.resource_handles.clone(),
            pod_uids: self.pod_uids.iter().cloned().collect(),
            prepared_devices: self.prepared_devices.clone(),
            annotations: self.annotations_as_list(),
            prepared: self.prepared,
        }
    }
}

/// Owned, read-only view of a claim record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimSnapshot {
    pub claim_uid: String,
    pub claim_name: String,
    pub namespace: String,
    pub driver_name: String,
    pub resource_handles: Vec<ResourceHandle>,
    pub pod_uids: Vec<String>,
    pub prepared_devices: BTreeMap<String, Vec<String>>,
    pub annotations: Vec<Annotation>,
    pub prepared: bool,
}

/// CDI annotation for the devices one plugin prepared for one claim.
/// No devices, no annotation.
pub fn cdi_annotations(plugin: &str, claim_uid: &str, devices: &[String]) -> Vec<Annotation> {
    if devices.is_empty() {
        return Vec::new();
    }
    let name = format!("{}{}_{}", CDI_ANNOTATION_PREFIX, plugin.replace('/', "_"), claim_uid);
    vec![Annotation { name, value: devices.join(",") }]
}

pub mod prelude {
    pub use super::{Annotation, ClaimKey, ClaimRecord, ClaimSnapshot, ContainerInfo, DraError, DraResult, ResourceHandle};
}
