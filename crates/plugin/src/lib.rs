//! nodeclaim plugin gateway.
//!
//! Resource plugins are reached through [`PluginConnector::connect`], which
//! hands out a [`PluginClient`] able to prepare or unprepare a batch of claims
//! in one call. The wire transport behind a client is not this crate's
//! concern; [`PluginRegistry`] is the in-process connector plugins register with.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use nodeclaim_core::{ClaimRecord, DraError, DraResult, ResourceHandle};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One claim (one resource handle of it) as sent to a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub namespace: String,
    pub uid: String,
    pub name: String,
    pub resource_handle: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub structured_resource_handle: Vec<serde_json::Value>,
}

impl ClaimRequest {
    pub fn for_handle(record: &ClaimRecord, handle: &ResourceHandle) -> Self {
        Self {
            namespace: record.namespace().to_string(),
            uid: record.claim_uid().to_string(),
            name: record.claim_name().to_string(),
            resource_handle: handle.data.clone(),
            structured_resource_handle: handle.structured_data.iter().cloned().collect(),
        }
    }
}

/// One request per resource handle of `record`, paired with the plugin serving it.
pub fn requests_by_plugin(record: &ClaimRecord) -> Vec<(String, ClaimRequest)> {
    record
        .resource_handles()
        .iter()
        .map(|h| (record.plugin_for(h).to_string(), ClaimRequest::for_handle(record, h)))
        .collect()
}

/// Per-claim answer. `error` set (and non-empty) means the claim failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimResult {
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ClaimResult {
    pub fn devices(devices: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { devices: devices.into_iter().map(Into::into).collect(), error: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { devices: Vec::new(), error: Some(message.into()) }
    }

    fn error(&self) -> Option<&str> { self.error.as_deref().filter(|e| !e.is_empty()) }
}

/// Answers keyed by claim UID.
pub type BatchResponse = HashMap<String, ClaimResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginOp {
    Prepare,
    Unprepare,
}

impl PluginOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginOp::Prepare => "prepare",
            PluginOp::Unprepare => "unprepare",
        }
    }
}

/// Batched RPC surface of one resource plugin.
#[async_trait::async_trait]
pub trait PluginClient: Send + Sync {
    /// Make the claims usable on this node. Errors mean the call as a whole failed.
    async fn prepare(&self, claims: &[ClaimRequest]) -> DraResult<BatchResponse>;
    /// Release the claims on this node.
    async fn unprepare(&self, claims: &[ClaimRequest]) -> DraResult<BatchResponse>;
}

/// Resolves a plugin name to a client.
pub trait PluginConnector: Send + Sync {
    fn connect(&self, plugin: &str) -> DraResult<Arc<dyn PluginClient>>;
}

/// Plugins currently registered on this node, by name.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<FxHashMap<String, Arc<dyn PluginClient>>>,
}

impl PluginRegistry {
    pub fn new() -> Self { Self::default() }

    /// Register (or replace) the client for `name`.
    pub fn register(&self, name: impl Into<String>, client: Arc<dyn PluginClient>) {
        let name = name.into();
        match self.plugins.write() {
            Ok(mut plugins) => {
                if plugins.insert(name.clone(), client).is_some() {
                    info!(plugin = %name, "plugin re-registered");
                } else {
                    info!(plugin = %name, "plugin registered");
                }
            }
            Err(_) => warn!(plugin = %name, "plugin registry lock poisoned; registration dropped"),
        }
    }

    /// Returns true if the plugin was registered.
    pub fn deregister(&self, name: &str) -> bool {
        let removed = self.plugins.write().map(|mut p| p.remove(name).is_some()).unwrap_or(false);
        if removed {
            info!(plugin = %name, "plugin deregistered");
        }
        removed
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().map(|p| p.keys().cloned().collect()).unwrap_or_default();
        names.sort();
        names
    }
}

impl PluginConnector for PluginRegistry {
    fn connect(&self, plugin: &str) -> DraResult<Arc<dyn PluginClient>> {
        let plugins = self.plugins.read().map_err(|_| DraError::transport(plugin, "plugin registry lock poisoned"))?;
        plugins
            .get(plugin)
            .cloned()
            .ok_or_else(|| DraError::transport(plugin, "plugin is not registered"))
    }
}

/// Devices a plugin reported for one claim UID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub uid: String,
    pub devices: Vec<String>,
}

/// Send one batch to `plugin` under `deadline` and validate the whole answer.
/// Nothing is returned unless every requested claim succeeded.
pub async fn call_plugin(
    op: PluginOp,
    plugin: &str,
    client: &dyn PluginClient,
    claims: &[ClaimRequest],
    deadline: Duration,
) -> DraResult<Vec<ClaimOutcome>> {
    let t0 = Instant::now();
    debug!(plugin = %plugin, op = op.as_str(), claims = claims.len(), "plugin call start");
    let call = async {
        match op {
            PluginOp::Prepare => client.prepare(claims).await,
            PluginOp::Unprepare => client.unprepare(claims).await,
        }
    };
    let res = match tokio::time::timeout(deadline, call).await {
        Ok(res) => res,
        Err(_) => Err(DraError::transport(plugin, format!("{} did not answer within {:?}", op.as_str(), deadline))),
    };
    histogram!("nodeclaim_plugin_rpc_ms", "plugin" => plugin.to_string(), "op" => op.as_str())
        .record(t0.elapsed().as_secs_f64() * 1000.0);
    let checked = res.and_then(|response| validate_response(op, plugin, claims, &response));
    match &checked {
        Ok(outcomes) => debug!(plugin = %plugin, op = op.as_str(), claims = outcomes.len(), took_ms = %t0.elapsed().as_millis(), "plugin call ok"),
        Err(e) => {
            counter!("nodeclaim_plugin_rpc_errors_total", "plugin" => plugin.to_string(), "op" => op.as_str()).increment(1);
            warn!(plugin = %plugin, op = op.as_str(), error = %e, took_ms = %t0.elapsed().as_millis(), "plugin call failed");
        }
    }
    checked
}

/// Check that `response` answers exactly the claims in `claims`, without errors.
/// A claim with several handles for the same plugin appears once in the answer.
pub fn validate_response(
    op: PluginOp,
    plugin: &str,
    claims: &[ClaimRequest],
    response: &BatchResponse,
) -> DraResult<Vec<ClaimOutcome>> {
    let requested: HashSet<&str> = claims.iter().map(|c| c.uid.as_str()).collect();
    let mut unknown: Vec<&str> = response.keys().map(String::as_str).filter(|u| !requested.contains(u)).collect();
    if !unknown.is_empty() {
        unknown.sort_unstable();
        return Err(DraError::incomplete(plugin, format!("{} returned results for unknown claim UIDs {:?}", op.as_str(), unknown)));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut outcomes = Vec::with_capacity(requested.len());
    let mut missing = 0usize;
    for req in claims {
        if !seen.insert(req.uid.as_str()) {
            continue;
        }
        match response.get(&req.uid) {
            Some(result) => {
                if let Some(message) = result.error() {
                    return Err(DraError::ClaimFailed {
                        plugin: plugin.to_string(),
                        claim: format!("{}/{}", req.namespace, req.name),
                        message: message.to_string(),
                    });
                }
                outcomes.push(ClaimOutcome { uid: req.uid.clone(), devices: result.devices.clone() });
            }
            None => missing += 1,
        }
    }
    if missing != 0 {
        return Err(DraError::incomplete(plugin, format!("{} left out {} claims", op.as_str(), missing)));
    }
    Ok(outcomes)
}
