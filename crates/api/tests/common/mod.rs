#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::api::resource::v1alpha2::ResourceClaim;
use nodeclaim_api::ClaimOrchestrator;
use nodeclaim_core::DraResult;
use nodeclaim_kubehub::StaticClaimLookup;
use nodeclaim_persist::MemoryCheckpointer;
use nodeclaim_plugin::{BatchResponse, ClaimRequest, ClaimResult, PluginClient, PluginOp, PluginRegistry};
use nodeclaim_store::ClaimCache;

pub const GPU: &str = "gpu.example.com";
pub const NET: &str = "net.example.com";

/// Plugin double that records every batch it receives.
pub struct FakePlugin {
    pub name: String,
    calls: Mutex<Vec<(PluginOp, Vec<String>)>>,
    devices: Mutex<Option<Vec<String>>>,
    omit: Mutex<Option<String>>,
    fail_claim: Mutex<Option<String>>,
    delay: Mutex<Duration>,
}

impl FakePlugin {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: Mutex::new(Vec::new()),
            devices: Mutex::new(None),
            omit: Mutex::new(None),
            fail_claim: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Answer every prepare with exactly these devices.
    pub fn set_devices(&self, devices: &[&str]) {
        *self.devices.lock().unwrap() = Some(devices.iter().map(|d| d.to_string()).collect());
    }
    pub fn set_omit(&self, uid: Option<&str>) { *self.omit.lock().unwrap() = uid.map(String::from); }
    pub fn set_fail_claim(&self, uid: Option<&str>) { *self.fail_claim.lock().unwrap() = uid.map(String::from); }
    pub fn set_delay(&self, d: Duration) { *self.delay.lock().unwrap() = d; }

    pub fn calls(&self, op: PluginOp) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().iter().filter(|(o, _)| *o == op).map(|(_, uids)| uids.clone()).collect()
    }

    async fn answer(&self, op: PluginOp, claims: &[ClaimRequest]) -> DraResult<BatchResponse> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut uids: Vec<String> = claims.iter().map(|c| c.uid.clone()).collect();
        uids.dedup();
        self.calls.lock().unwrap().push((op, uids));

        let omit = self.omit.lock().unwrap().clone();
        let fail = self.fail_claim.lock().unwrap().clone();
        let fixed = self.devices.lock().unwrap().clone();
        let mut seen = HashSet::new();
        let mut resp = BatchResponse::new();
        for c in claims {
            if !seen.insert(c.uid.clone()) || omit.as_deref() == Some(c.uid.as_str()) {
                continue;
            }
            let result = if fail.as_deref() == Some(c.uid.as_str()) {
                ClaimResult::failed("device is wedged")
            } else if op == PluginOp::Unprepare {
                ClaimResult::default()
            } else {
                match &fixed {
                    Some(devices) => ClaimResult::devices(devices.clone()),
                    None => ClaimResult::devices([format!("{}/{}", self.name, c.name)]),
                }
            };
            resp.insert(c.uid.clone(), result);
        }
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl PluginClient for FakePlugin {
    async fn prepare(&self, claims: &[ClaimRequest]) -> DraResult<BatchResponse> { self.answer(PluginOp::Prepare, claims).await }
    async fn unprepare(&self, claims: &[ClaimRequest]) -> DraResult<BatchResponse> { self.answer(PluginOp::Unprepare, claims).await }
}

/// Allocated claim in namespace `ns`, reserved for the given pod UIDs.
/// Each handle is (driver name, opaque data); an empty driver falls back to `driver`.
pub fn claim(name: &str, driver: &str, handles: &[(&str, &str)], reserved_for: &[&str]) -> ResourceClaim {
    let handles: Vec<serde_json::Value> = handles
        .iter()
        .map(|(d, data)| {
            if d.is_empty() {
                serde_json::json!({ "data": data })
            } else {
                serde_json::json!({ "driverName": d, "data": data })
            }
        })
        .collect();
    let reserved: Vec<serde_json::Value> = reserved_for
        .iter()
        .map(|uid| serde_json::json!({ "resource": "pods", "name": format!("pod-{}", uid), "uid": uid }))
        .collect();
    serde_json::from_value(serde_json::json!({
        "metadata": { "name": name, "namespace": "ns", "uid": format!("uid-{}", name) },
        "spec": { "resourceClassName": "example" },
        "status": {
            "driverName": driver,
            "allocation": { "resourceHandles": handles },
            "reservedFor": reserved
        }
    }))
    .unwrap()
}

/// Pod in namespace `ns` whose only container uses every listed claim by name.
pub fn pod(uid: &str, claims: &[&str]) -> Pod {
    let pod_claims: Vec<serde_json::Value> = claims
        .iter()
        .map(|c| serde_json::json!({ "name": format!("pc-{}", c), "source": { "resourceClaimName": c } }))
        .collect();
    let used: Vec<serde_json::Value> = claims.iter().map(|c| serde_json::json!({ "name": format!("pc-{}", c) })).collect();
    serde_json::from_value(serde_json::json!({
        "metadata": { "name": format!("pod-{}", uid), "namespace": "ns", "uid": uid },
        "spec": {
            "resourceClaims": pod_claims,
            "containers": [ { "name": "main", "resources": { "claims": used } } ]
        }
    }))
    .unwrap()
}

pub fn main_container(pod: &Pod) -> Container {
    pod.spec.as_ref().unwrap().containers[0].clone()
}

pub struct Harness {
    pub lookup: Arc<StaticClaimLookup>,
    pub registry: Arc<PluginRegistry>,
    pub checkpoint: Arc<MemoryCheckpointer>,
    pub gpu: Arc<FakePlugin>,
    pub net: Arc<FakePlugin>,
    pub mgr: ClaimOrchestrator,
}

impl Harness {
    pub fn new() -> Self {
        let lookup = Arc::new(StaticClaimLookup::new());
        let registry = Arc::new(PluginRegistry::new());
        let gpu = FakePlugin::new(GPU);
        let net = FakePlugin::new(NET);
        registry.register(GPU, gpu.clone());
        registry.register(NET, net.clone());
        let checkpoint = Arc::new(MemoryCheckpointer::new());
        let cache = Arc::new(ClaimCache::new(checkpoint.clone()).unwrap());
        let mgr = ClaimOrchestrator::new(cache, lookup.clone(), registry.clone(), Duration::from_secs(5));
        Self { lookup, registry, checkpoint, gpu, net, mgr }
    }

    pub fn add_claim(&self, claim: ResourceClaim) { self.lookup.insert(claim); }
}

pub fn temp_dir(tag: &str) -> std::path::PathBuf {
    let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
    std::env::temp_dir().join(format!("nodeclaim-{}-{}-{}", tag, std::process::id(), nanos))
}
