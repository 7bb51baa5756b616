//! nodeclaim persistence: durable checkpoint of the claim cache.
//! One SQLite file per node; every sync replaces the whole record set in one transaction.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use nodeclaim_core::ClaimRecord;
use rusqlite::OptionalExtension;
use tracing::{debug, info};

/// File name of the checkpoint inside the state directory.
pub const CHECKPOINT_FILE_NAME: &str = "dra_manager_state";

/// Layout version written into every checkpoint.
pub const SCHEMA_VERSION: i64 = 1;

/// Root causes callers may want to tell apart from plain I/O failures.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint schema version {found} is not supported (this build reads version {supported})")]
    Incompatible { found: i64, supported: i64 },
    #[error("checkpoint entry {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Durable storage for the full set of claim records.
pub trait Checkpointer: Send + Sync {
    /// Replace whatever was stored before with `records`.
    fn store(&self, records: &[&ClaimRecord]) -> Result<()>;
    /// Everything stored by the last successful `store`; empty on a cold start.
    fn load(&self) -> Result<Vec<ClaimRecord>>;
}

pub fn checkpoint_path(state_dir: impl AsRef<Path>) -> PathBuf {
    state_dir.as_ref().join(CHECKPOINT_FILE_NAME)
}

/// SQLite-backed checkpoint. Synchronous; callers hold the cache lock anyway.
pub struct SqliteCheckpointer {
    path: PathBuf,
    db: Mutex<rusqlite::Connection>,
}

impl SqliteCheckpointer {
    /// Open (or create) the checkpoint at `path` and verify its layout version.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let started = std::time::Instant::now();
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("creating state dir {}", parent.display()))?;
        }
        let db = rusqlite::Connection::open(&path).with_context(|| format!("opening checkpoint at {}", path.display()))?;
        db.pragma_update(None, "synchronous", "FULL").context("setting synchronous=FULL")?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .context("creating meta table")?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS claims (
                namespace TEXT NOT NULL,
                name      TEXT NOT NULL,
                uid       TEXT NOT NULL,
                payload   BLOB NOT NULL,
                PRIMARY KEY (namespace, name)
            )",
            [],
        )
        .context("creating claims table")?;

        let found: Option<String> = db
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| row.get(0))
            .optional()
            .context("reading schema version")?;
        match found {
            None => {
                db.execute(
                    "INSERT INTO meta(key, value) VALUES ('schema_version', ?1)",
                    [SCHEMA_VERSION.to_string()],
                )
                .context("writing schema version")?;
                debug!(path = %path.display(), "initialized empty checkpoint");
            }
            Some(v) => {
                let found = v.trim().parse::<i64>().map_err(|e| CheckpointError::Corrupt {
                    key: "meta/schema_version".into(),
                    reason: e.to_string(),
                })?;
                if found != SCHEMA_VERSION {
                    return Err(CheckpointError::Incompatible { found, supported: SCHEMA_VERSION }.into());
                }
            }
        }

        histogram!("nodeclaim_checkpoint_open_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        info!(path = %path.display(), "checkpoint opened");
        Ok(Self { path, db: Mutex::new(db) })
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Unix seconds of the last successful store, if any.
    pub fn saved_at(&self) -> Result<Option<i64>> {
        let db = self.db.lock().map_err(|_| anyhow!("checkpoint connection lock poisoned"))?;
        let v: Option<String> = db
            .query_row("SELECT value FROM meta WHERE key = 'saved_at'", [], |row| row.get(0))
            .optional()?;
        Ok(v.and_then(|s| s.parse().ok()))
    }
}

impl Checkpointer for SqliteCheckpointer {
    fn store(&self, records: &[&ClaimRecord]) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.db.lock().map_err(|_| anyhow!("checkpoint connection lock poisoned"))?;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM claims", [])?;
        for rec in records {
            tx.execute(
                "INSERT INTO claims(namespace, name, uid, payload) VALUES (?1, ?2, ?3, ?4)",
                (rec.namespace(), rec.claim_name(), rec.claim_uid(), encode_record(rec)?),
            )
            .with_context(|| format!("writing claim {}", rec.key()))?;
        }
        tx.execute(
            "INSERT INTO meta(key, value) VALUES ('saved_at', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [now_ts().to_string()],
        )?;
        tx.commit().context("committing checkpoint")?;
        histogram!("nodeclaim_checkpoint_sync_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        counter!("nodeclaim_checkpoint_sync_total").increment(1);
        debug!(records = records.len(), "checkpoint stored");
        Ok(())
    }

    fn load(&self) -> Result<Vec<ClaimRecord>> {
        let db = self.db.lock().map_err(|_| anyhow!("checkpoint connection lock poisoned"))?;
        let mut stmt = db.prepare("SELECT namespace, name, payload FROM claims ORDER BY namespace, name")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let namespace: String = row.get(0)?;
            let name: String = row.get(1)?;
            let payload: Vec<u8> = row.get(2)?;
            let key = format!("{}/{}", namespace, name);
            let rec = decode_record(&payload).map_err(|e| CheckpointError::Corrupt { key: key.clone(), reason: e.to_string() })?;
            if rec.namespace() != namespace || rec.claim_name() != name {
                return Err(CheckpointError::Corrupt { key, reason: format!("payload describes {}", rec.key()) }.into());
            }
            out.push(rec);
        }
        Ok(out)
    }
}

/// In-memory checkpoint with switchable write failures, for tests and dry runs.
#[derive(Default)]
pub struct MemoryCheckpointer {
    records: Mutex<Vec<ClaimRecord>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryCheckpointer {
    pub fn new() -> Self { Self::default() }

    /// Pre-populate as if a previous process had stored `records`.
    pub fn with_records(records: Vec<ClaimRecord>) -> Self {
        Self { records: Mutex::new(records), ..Self::default() }
    }

    pub fn set_fail_writes(&self, fail: bool) { self.fail_writes.store(fail, Ordering::SeqCst); }

    /// Number of successful stores so far.
    pub fn writes(&self) -> u64 { self.writes.load(Ordering::SeqCst) }

    pub fn stored(&self) -> Vec<ClaimRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Checkpointer for MemoryCheckpointer {
    fn store(&self, records: &[&ClaimRecord]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("checkpoint storage unavailable"));
        }
        let mut slot = self.records.lock().map_err(|_| anyhow!("memory checkpoint lock poisoned"))?;
        *slot = records.iter().map(|r| (*r).clone()).collect();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self) -> Result<Vec<ClaimRecord>> {
        let slot = self.records.lock().map_err(|_| anyhow!("memory checkpoint lock poisoned"))?;
        Ok(slot.clone())
    }
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

fn encode_record(rec: &ClaimRecord) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(rec).with_context(|| format!("serializing claim {}", rec.key()))?;
    Ok(maybe_compress(json))
}

fn decode_record(blob: &[u8]) -> Result<ClaimRecord> {
    let json = maybe_decompress(blob);
    Ok(serde_json::from_slice(&json)?)
}

fn maybe_compress(json: Vec<u8>) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("NODECLAIM_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        if let Ok(packed) = zstd::encode_all(json.as_slice(), lvl) {
            return packed;
        }
    }
    json
}

fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeclaim_core::ResourceHandle;

    fn temp_path() -> PathBuf {
        let dir = std::env::temp_dir();
        let f = format!("nodeclaim-test-{}", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).join(CHECKPOINT_FILE_NAME)
    }

    fn record(name: &str, pod: &str) -> ClaimRecord {
        let handle = ResourceHandle { driver_name: String::new(), data: "opaque".into(), structured_data: Some(serde_json::json!({"nodeName": "n1"})) };
        let mut rec = ClaimRecord::new(format!("uid-{}", name), name, "default", "gpu.example.com", vec![handle]);
        rec.add_pod_reference(pod);
        rec.record_plugin_result("gpu.example.com", vec!["/dev/acc0".into()]);
        rec
    }

    #[test]
    fn store_load_replaces_full_set() {
        let path = temp_path();
        let cp = SqliteCheckpointer::open(&path).unwrap();
        assert!(cp.load().unwrap().is_empty());
        assert_eq!(cp.saved_at().unwrap(), None);

        let a = record("a", "pod-1");
        let b = record("b", "pod-2");
        cp.store(&[&a, &b]).unwrap();
        cp.store(&[&b]).unwrap();
        assert!(cp.saved_at().unwrap().is_some());
        drop(cp);

        let reopened = SqliteCheckpointer::open(&path).unwrap();
        let loaded = reopened.load().unwrap();
        assert_eq!(loaded, vec![b]);
        assert!(loaded[0].is_prepared());
        assert_eq!(loaded[0].devices_for("gpu.example.com"), Some(&["/dev/acc0".to_string()][..]));
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let path = temp_path();
        drop(SqliteCheckpointer::open(&path).unwrap());
        {
            let db = rusqlite::Connection::open(&path).unwrap();
            db.execute("UPDATE meta SET value = '99' WHERE key = 'schema_version'", []).unwrap();
        }
        let err = SqliteCheckpointer::open(&path).err().expect("must reject");
        match err.downcast_ref::<CheckpointError>() {
            Some(CheckpointError::Incompatible { found, supported }) => {
                assert_eq!(*found, 99);
                assert_eq!(*supported, SCHEMA_VERSION);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn garbage_payload_is_reported_as_corrupt() {
        let path = temp_path();
        drop(SqliteCheckpointer::open(&path).unwrap());
        {
            let db = rusqlite::Connection::open(&path).unwrap();
            db.execute(
                "INSERT INTO claims(namespace, name, uid, payload) VALUES ('ns', 'x', 'u', ?1)",
                [b"not json".to_vec()],
            )
            .unwrap();
        }
        let cp = SqliteCheckpointer::open(&path).unwrap();
        let err = cp.load().unwrap_err();
        assert!(matches!(err.downcast_ref::<CheckpointError>(), Some(CheckpointError::Corrupt { .. })));
    }

    #[test]
    fn memory_checkpointer_can_fail_writes() {
        let cp = MemoryCheckpointer::new();
        let a = record("a", "pod-1");
        cp.store(&[&a]).unwrap();
        cp.set_fail_writes(true);
        assert!(cp.store(&[]).is_err());
        assert_eq!(cp.writes(), 1);
        assert_eq!(cp.load().unwrap(), vec![a]);
    }
}
