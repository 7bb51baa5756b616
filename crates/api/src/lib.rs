//! nodeclaim API: the claim orchestrator.
//!
//! [`DraManager`] is what a node agent calls when a pod is admitted or torn
//! down. [`ClaimOrchestrator`] implements it on top of the claim cache, a
//! control-plane [`ClaimLookup`] and a [`PluginConnector`]. Plugin calls are
//! batched per plugin and always made outside the cache lock.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use k8s_openapi::api::core::v1::{Container, Pod};
use metrics::counter;
use nodeclaim_core::{ClaimKey, ClaimRecord, ClaimSnapshot, ContainerInfo, DraError, DraResult};
use nodeclaim_kubehub::{
    claim_is_used_by_pod, container_claim_names, is_for_pod, is_reserved_for_pod, pod_name, pod_namespace,
    pod_resource_claims, pod_uid, record_from_claim, resolve_claim_name, ClaimLookup,
};
use nodeclaim_plugin::{call_plugin, requests_by_plugin, ClaimOutcome, ClaimRequest, PluginConnector, PluginOp};
use nodeclaim_store::ClaimCache;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

mod config;
mod guard;

pub use config::{ManagerConfig, DEFAULT_PLUGIN_TIMEOUT, DEFAULT_STATE_DIR};
use guard::{Compensation, Undo};

/// Node-level claim preparation surface.
#[async_trait::async_trait]
pub trait DraManager: Send + Sync {
    /// Prepare every claim the pod's containers use and take a reference on each.
    async fn prepare_resources(&self, pod: &Pod) -> DraResult<()>;

    /// Drop the pod's references; release claims nobody else holds. Idempotent.
    async fn unprepare_resources(&self, pod: &Pod) -> DraResult<()>;

    /// CDI annotations and devices for one container of a prepared pod.
    fn get_resources(&self, pod: &Pod, container: &Container) -> DraResult<ContainerInfo>;

    /// Copies of the cached records behind the claims a container uses.
    fn get_container_claim_infos(&self, pod: &Pod, container: &Container) -> DraResult<Vec<ClaimSnapshot>>;

    /// Whether any cached claim still references the pod.
    fn pod_might_need_to_unprepare_resources(&self, pod_uid: &str) -> bool;
}

type Batches = BTreeMap<String, Vec<ClaimRequest>>;

/// In-process [`DraManager`].
pub struct ClaimOrchestrator {
    cache: Arc<ClaimCache>,
    lookup: Arc<dyn ClaimLookup>,
    plugins: Arc<dyn PluginConnector>,
    plugin_timeout: Duration,
}

impl ClaimOrchestrator {
    pub fn new(
        cache: Arc<ClaimCache>,
        lookup: Arc<dyn ClaimLookup>,
        plugins: Arc<dyn PluginConnector>,
        plugin_timeout: Duration,
    ) -> Self {
        Self { cache, lookup, plugins, plugin_timeout }
    }

    /// Open (or create) the checkpoint under `cfg.state_dir` and restore from it.
    pub fn from_config(
        cfg: &ManagerConfig,
        lookup: Arc<dyn ClaimLookup>,
        plugins: Arc<dyn PluginConnector>,
    ) -> DraResult<Self> {
        let cache = ClaimCache::open(cfg.checkpoint_path())?;
        Ok(Self::new(Arc::new(cache), lookup, plugins, cfg.plugin_timeout))
    }

    pub fn cache(&self) -> &ClaimCache { &self.cache }

    async fn prepare_pod(&self, pod: &Pod) -> DraResult<()> {
        let pod_uid = pod_uid(pod)?;
        let namespace = pod_namespace(pod);

        // Authorize every claim before taking any reference.
        let mut wanted: Vec<(ClaimKey, DraResult<ClaimRecord>)> = Vec::new();
        for pod_claim in pod_resource_claims(pod) {
            let Some(resolved) = resolve_claim_name(pod, pod_claim)? else {
                debug!(pod = %pod_name(pod), pod_claim = %pod_claim.name, "no claim generated, skipping");
                continue;
            };
            let claim = self.lookup.fetch_claim(namespace, &resolved.name).await?;
            if resolved.must_check_owner {
                is_for_pod(pod, &claim)?;
            }
            if !is_reserved_for_pod(pod, &claim) {
                return Err(DraError::Validation(format!(
                    "pod {}/{} ({}) is not allowed to use ResourceClaim {}/{}: not reserved for it",
                    namespace,
                    pod_name(pod),
                    pod_uid,
                    namespace,
                    resolved.name
                )));
            }
            if !claim_is_used_by_pod(pod_claim, pod) {
                debug!(pod = %pod_name(pod), claim = %resolved.name, "claim not used by any container, skipping");
                continue;
            }
            // Only needed if the claim is not cached yet.
            wanted.push((ClaimKey::new(namespace, resolved.name), record_from_claim(&claim)));
        }

        let mut guard = Compensation::new(&self.cache);
        let mut batches = Batches::new();
        let mut owners: FxHashMap<String, ClaimKey> = FxHashMap::default();
        let mut touched: BTreeSet<ClaimKey> = BTreeSet::new();
        for (key, candidate) in wanted {
            if !touched.insert(key.clone()) {
                continue;
            }
            let requests = self.cache.with_exclusive(|txn| {
                if txn.get(&key).is_none() {
                    txn.add(candidate?)?;
                }
                let rec = txn.get_mut(&key).ok_or_else(|| missing_claim(&key))?;
                if rec.is_releasing() {
                    return Err(DraError::Conflict(format!("claim {} is being released", key)));
                }
                if rec.is_preparing() && !rec.is_prepared() {
                    return Err(DraError::Conflict(format!("claim {} is being prepared by another call", key)));
                }
                if rec.add_pod_reference(pod_uid) {
                    guard.push(key.clone(), Undo::RemoveReference(pod_uid.to_string()));
                }
                if rec.is_prepared() {
                    return Ok(Vec::new());
                }
                let requests: Vec<_> =
                    requests_by_plugin(rec).into_iter().filter(|(p, _)| rec.devices_for(p).is_none()).collect();
                if !requests.is_empty() {
                    rec.set_preparing(true);
                    guard.push(key.clone(), Undo::ClearPreparing);
                }
                Ok(requests)
            })?;
            for (plugin, req) in requests {
                owners.insert(req.uid.clone(), key.clone());
                batches.entry(plugin).or_default().push(req);
            }
        }

        for (plugin, res) in self.dispatch(PluginOp::Prepare, batches).await {
            let outcomes = res?;
            self.cache.with_exclusive(|txn| {
                for ClaimOutcome { uid, devices } in outcomes {
                    let Some(key) = owners.get(&uid) else { continue };
                    let rec = txn.get_mut(key).ok_or_else(|| missing_claim(key))?;
                    debug!(claim = %rec.key(), plugin = %plugin, devices = devices.len(), "claim prepared by plugin");
                    rec.record_plugin_result(&plugin, devices);
                }
                Ok(())
            })?;
        }

        self.cache.with_exclusive(|txn| {
            for key in &touched {
                let rec = txn.get_mut(key).ok_or_else(|| missing_claim(key))?;
                if let Some(plugin) = rec.plugin_names().into_iter().find(|p| rec.devices_for(p).is_none()) {
                    return Err(DraError::incomplete(plugin, format!("no prepare result for claim {}", key)));
                }
                rec.set_prepared();
                rec.set_preparing(false);
            }
            txn.sync_to_checkpoint()
        })?;
        guard.disarm();
        Ok(())
    }

    async fn unprepare_pod(&self, pod: &Pod) -> DraResult<()> {
        let pod_uid = pod_uid(pod)?;
        let namespace = pod_namespace(pod);

        let mut guard = Compensation::new(&self.cache);
        let mut batches = Batches::new();
        let mut owners: FxHashMap<String, ClaimKey> = FxHashMap::default();
        // plugins that still have to release each claim
        let mut pending: BTreeMap<ClaimKey, BTreeSet<String>> = BTreeMap::new();
        let mut seen: BTreeSet<ClaimKey> = BTreeSet::new();
        for pod_claim in pod_resource_claims(pod) {
            let Some(resolved) = resolve_claim_name(pod, pod_claim)? else { continue };
            let key = ClaimKey::new(namespace, resolved.name);
            if !seen.insert(key.clone()) {
                continue;
            }
            let requests = self.cache.with_exclusive(|txn| {
                let Some(rec) = txn.get_mut(&key) else {
                    debug!(claim = %key, "claim not cached, nothing to release");
                    return Ok(Vec::new());
                };
                if rec.is_releasing() {
                    return Err(DraError::Conflict(format!("claim {} is already being released", key)));
                }
                if rec.pod_uids().any(|u| u != pod_uid) {
                    if rec.delete_pod_reference(pod_uid) {
                        debug!(claim = %key, remaining = rec.pod_reference_count(), "dropped pod reference");
                    }
                    return Ok(Vec::new());
                }
                if rec.is_preparing() {
                    return Err(DraError::Conflict(format!("claim {} is being prepared", key)));
                }
                let requests = requests_by_plugin(rec);
                if requests.is_empty() {
                    txn.delete(&key);
                    return Ok(requests);
                }
                rec.set_releasing(true);
                guard.push(key.clone(), Undo::ClearReleasing);
                Ok(requests)
            })?;
            for (plugin, req) in requests {
                owners.insert(req.uid.clone(), key.clone());
                pending.entry(key.clone()).or_default().insert(plugin.clone());
                batches.entry(plugin).or_default().push(req);
            }
        }

        for (plugin, res) in self.dispatch(PluginOp::Unprepare, batches).await {
            let outcomes = res?;
            self.cache.with_exclusive(|txn| {
                for ClaimOutcome { uid, .. } in outcomes {
                    let Some(key) = owners.get(&uid) else { continue };
                    let Some(left) = pending.get_mut(key) else { continue };
                    left.remove(&plugin);
                    if left.is_empty() && txn.delete(key).is_some() {
                        guard.mark_dirty();
                        debug!(claim = %key, "claim released");
                    }
                }
                Ok(())
            })?;
        }
        guard.disarm();

        self.cache.with_shared(|view| view.sync_to_checkpoint())
    }

    /// Call every plugin with its batch concurrently. Results come back in
    /// plugin-name order.
    async fn dispatch(&self, op: PluginOp, batches: Batches) -> Vec<(String, DraResult<Vec<ClaimOutcome>>)> {
        let calls = batches.into_iter().map(|(plugin, claims)| async move {
            let res = match self.plugins.connect(&plugin) {
                Ok(client) => call_plugin(op, &plugin, client.as_ref(), &claims, self.plugin_timeout).await,
                Err(e) => Err(e),
            };
            (plugin, res)
        });
        join_all(calls).await
    }

    /// Cache keys of the claims `container` uses, in pod spec order.
    fn container_claim_keys(pod: &Pod, container: &Container) -> DraResult<Vec<ClaimKey>> {
        let used: BTreeSet<&str> = container_claim_names(container).collect();
        let mut keys = Vec::new();
        for pod_claim in pod_resource_claims(pod) {
            if !used.contains(pod_claim.name.as_str()) {
                continue;
            }
            if let Some(resolved) = resolve_claim_name(pod, pod_claim)? {
                keys.push(ClaimKey::new(pod_namespace(pod), resolved.name));
            }
        }
        Ok(keys)
    }
}

fn missing_claim(key: &ClaimKey) -> DraError {
    DraError::NotFound(format!("claim {} left the cache while the call was in flight", key))
}

#[async_trait::async_trait]
impl DraManager for ClaimOrchestrator {
    async fn prepare_resources(&self, pod: &Pod) -> DraResult<()> {
        let t0 = Instant::now();
        counter!("nodeclaim_prepare_total").increment(1);
        info!(pod = %pod_name(pod), ns = %pod_namespace(pod), "prepare start");
        let res = self.prepare_pod(pod).await;
        match &res {
            Ok(()) => info!(pod = %pod_name(pod), took_ms = %t0.elapsed().as_millis(), "prepare ok"),
            Err(e) => {
                counter!("nodeclaim_prepare_errors_total").increment(1);
                warn!(pod = %pod_name(pod), error = %e, retryable = e.is_retryable(), took_ms = %t0.elapsed().as_millis(), "prepare failed");
            }
        }
        res
    }

    async fn unprepare_resources(&self, pod: &Pod) -> DraResult<()> {
        let t0 = Instant::now();
        counter!("nodeclaim_unprepare_total").increment(1);
        info!(pod = %pod_name(pod), ns = %pod_namespace(pod), "unprepare start");
        let res = self.unprepare_pod(pod).await;
        match &res {
            Ok(()) => info!(pod = %pod_name(pod), took_ms = %t0.elapsed().as_millis(), "unprepare ok"),
            Err(e) => {
                counter!("nodeclaim_unprepare_errors_total").increment(1);
                warn!(pod = %pod_name(pod), error = %e, retryable = e.is_retryable(), took_ms = %t0.elapsed().as_millis(), "unprepare failed");
            }
        }
        res
    }

    fn get_resources(&self, pod: &Pod, container: &Container) -> DraResult<ContainerInfo> {
        let keys = Self::container_claim_keys(pod, container)?;
        self.cache.with_shared(|view| {
            let mut info = ContainerInfo::default();
            for key in &keys {
                let rec = view
                    .get(key)
                    .ok_or_else(|| DraError::NotFound(format!("no prepared claim {} for container {}", key, container.name)))?;
                info.annotations.extend(rec.annotations_as_list());
                info.devices.extend(rec.devices_as_list());
            }
            Ok(info)
        })
    }

    fn get_container_claim_infos(&self, pod: &Pod, container: &Container) -> DraResult<Vec<ClaimSnapshot>> {
        let keys = Self::container_claim_keys(pod, container)?;
        self.cache.with_shared(|view| {
            keys.iter()
                .map(|key| {
                    view.get(key)
                        .map(ClaimRecord::snapshot)
                        .ok_or_else(|| DraError::NotFound(format!("claim {} is not cached", key)))
                })
                .collect()
        })
    }

    fn pod_might_need_to_unprepare_resources(&self, pod_uid: &str) -> bool {
        match self.cache.with_shared(|view| Ok(view.has_pod_reference(pod_uid))) {
            Ok(held) => held,
            Err(e) => {
                // Err on the side of running unprepare again.
                warn!(pod_uid = %pod_uid, error = %e, "cannot inspect claim cache");
                true
            }
        }
    }
}
