//! nodeclaim store: the claim cache.
//!
//! Records live behind a single `RwLock`. They are only reachable through the
//! transaction handles passed to [`ClaimCache::with_exclusive`] and
//! [`ClaimCache::with_shared`], so every read-modify-write on a claim happens
//! inside one critical section. The lock is synchronous: never hold a
//! transaction across an `.await`, and never open a transaction from inside
//! another one.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::{Arc, RwLock};

use metrics::counter;
use nodeclaim_core::{ClaimKey, ClaimRecord, DraError, DraResult};
use nodeclaim_persist::{CheckpointError, Checkpointer, SqliteCheckpointer};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

type Records = FxHashMap<ClaimKey, ClaimRecord>;

/// Concurrency-safe, checkpointed store of claim records.
pub struct ClaimCache {
    records: RwLock<Records>,
    checkpointer: Arc<dyn Checkpointer>,
}

impl ClaimCache {
    /// Build a cache over `checkpointer`, restoring whatever it holds.
    pub fn new(checkpointer: Arc<dyn Checkpointer>) -> DraResult<Self> {
        let cache = Self { records: RwLock::new(Records::default()), checkpointer };
        cache.restore_from_checkpoint()?;
        Ok(cache)
    }

    /// Cache backed by the SQLite checkpoint at `path` (created if absent).
    pub fn open(path: impl AsRef<Path>) -> DraResult<Self> {
        let cp = SqliteCheckpointer::open(path).map_err(checkpoint_read_error)?;
        Self::new(Arc::new(cp))
    }

    fn restore_from_checkpoint(&self) -> DraResult<()> {
        let restored = self.checkpointer.load().map_err(checkpoint_read_error)?;
        let mut records = self.records.write().map_err(|_| poisoned("restore"))?;
        for rec in restored {
            let key = rec.key();
            if records.insert(key.clone(), rec).is_some() {
                return Err(DraError::CheckpointCorrupt(format!("claim {} stored twice", key)));
            }
        }
        info!(claims = records.len(), "claim cache restored from checkpoint");
        Ok(())
    }

    /// Run `f` with the write lock held. The lock is released on every exit path.
    pub fn with_exclusive<R>(&self, f: impl FnOnce(&mut ClaimTxn<'_>) -> DraResult<R>) -> DraResult<R> {
        let mut guard = self.records.write().map_err(|_| poisoned("exclusive transaction"))?;
        let mut txn = ClaimTxn { records: &mut guard, checkpointer: self.checkpointer.as_ref() };
        f(&mut txn)
    }

    /// Run `f` with the read lock held.
    pub fn with_shared<R>(&self, f: impl FnOnce(&ClaimView<'_>) -> DraResult<R>) -> DraResult<R> {
        let guard = self.records.read().map_err(|_| poisoned("shared transaction"))?;
        let view = ClaimView { records: &guard, checkpointer: self.checkpointer.as_ref() };
        f(&view)
    }
}

/// Read/write access to the cache for the duration of one exclusive transaction.
pub struct ClaimTxn<'a> {
    records: &'a mut Records,
    checkpointer: &'a dyn Checkpointer,
}

impl ClaimTxn<'_> {
    pub fn get(&self, key: &ClaimKey) -> Option<&ClaimRecord> { self.records.get(key) }
    pub fn get_mut(&mut self, key: &ClaimKey) -> Option<&mut ClaimRecord> { self.records.get_mut(key) }
    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }

    /// Insert a new record; fails if the key is already cached.
    pub fn add(&mut self, record: ClaimRecord) -> DraResult<&mut ClaimRecord> {
        let key = record.key();
        match self.records.entry(key) {
            std::collections::hash_map::Entry::Occupied(e) => Err(DraError::AlreadyExists(e.key().to_string())),
            std::collections::hash_map::Entry::Vacant(e) => {
                debug!(claim = %e.key(), uid = %record.claim_uid(), "claim cached");
                Ok(e.insert(record))
            }
        }
    }

    /// Remove a record unconditionally.
    pub fn delete(&mut self, key: &ClaimKey) -> Option<ClaimRecord> {
        let removed = self.records.remove(key);
        if removed.is_some() {
            debug!(claim = %key, "claim dropped from cache");
        }
        removed
    }

    pub fn has_pod_reference(&self, pod_uid: &str) -> bool { has_pod_reference(&*self.records, pod_uid) }

    pub fn sync_to_checkpoint(&self) -> DraResult<()> { sync(&*self.records, self.checkpointer) }
}

/// Read-only access to the cache for the duration of one shared transaction.
pub struct ClaimView<'a> {
    records: &'a Records,
    checkpointer: &'a dyn Checkpointer,
}

impl ClaimView<'_> {
    pub fn get(&self, key: &ClaimKey) -> Option<&ClaimRecord> { self.records.get(key) }
    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }

    /// All records, ordered by key.
    pub fn records(&self) -> Vec<&ClaimRecord> { sorted(self.records) }

    pub fn has_pod_reference(&self, pod_uid: &str) -> bool { has_pod_reference(&*self.records, pod_uid) }

    pub fn sync_to_checkpoint(&self) -> DraResult<()> { sync(&*self.records, self.checkpointer) }
}

fn sorted(records: &Records) -> Vec<&ClaimRecord> {
    let mut all: Vec<&ClaimRecord> = records.values().collect();
    all.sort_by(|a, b| (a.namespace(), a.claim_name()).cmp(&(b.namespace(), b.claim_name())));
    all
}

fn has_pod_reference(records: &Records, pod_uid: &str) -> bool {
    records.values().any(|r| r.has_pod_reference(pod_uid))
}

fn sync(records: &Records, checkpointer: &dyn Checkpointer) -> DraResult<()> {
    let all = sorted(records);
    checkpointer.store(&all).map_err(|e| {
        counter!("nodeclaim_checkpoint_errors_total").increment(1);
        warn!(error = %e, claims = all.len(), "checkpoint write failed");
        DraError::CheckpointWriteFailed(format!("{:#}", e))
    })
}

fn checkpoint_read_error(e: anyhow::Error) -> DraError {
    match e.downcast_ref::<CheckpointError>() {
        Some(CheckpointError::Incompatible { .. }) => DraError::CheckpointIncompatible(e.to_string()),
        Some(CheckpointError::Corrupt { .. }) => DraError::CheckpointCorrupt(e.to_string()),
        None => DraError::CheckpointCorrupt(format!("reading checkpoint: {:#}", e)),
    }
}

fn poisoned(what: &str) -> DraError {
    DraError::LockPoisoned(format!("claim cache lock poisoned before {}", what))
}
