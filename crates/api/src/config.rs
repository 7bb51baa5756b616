//! Runtime configuration of the orchestrator.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_STATE_DIR: &str = "/var/lib/kubelet";
pub const DEFAULT_PLUGIN_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Directory holding the checkpoint file.
    pub state_dir: PathBuf,
    /// Deadline for one batched plugin call.
    pub plugin_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { state_dir: PathBuf::from(DEFAULT_STATE_DIR), plugin_timeout: DEFAULT_PLUGIN_TIMEOUT }
    }
}

impl ManagerConfig {
    /// Defaults overridden by `NODECLAIM_STATE_DIR` and `NODECLAIM_PLUGIN_TIMEOUT_SECS`.
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(dir) = get("NODECLAIM_STATE_DIR").filter(|s| !s.trim().is_empty()) {
            cfg.state_dir = PathBuf::from(dir);
        }
        if let Some(secs) = get("NODECLAIM_PLUGIN_TIMEOUT_SECS").and_then(|s| s.trim().parse::<u64>().ok()).filter(|s| *s > 0) {
            cfg.plugin_timeout = Duration::from_secs(secs);
        }
        cfg
    }

    pub fn checkpoint_path(&self) -> PathBuf { nodeclaim_persist::checkpoint_path(&self.state_dir) }
}
