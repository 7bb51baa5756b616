//! Compensation for a failed or cancelled orchestration call.

use nodeclaim_core::ClaimKey;
use nodeclaim_store::ClaimCache;
use tracing::{debug, warn};

/// What to undo on one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Undo {
    /// Drop the reference a prepare call added for this pod.
    RemoveReference(String),
    /// Let other calls touch a record this unprepare call marked as releasing.
    ClearReleasing,
    /// Let other calls touch a record this prepare call marked as preparing.
    ClearPreparing,
}

/// Undo actions recorded during one call. Dropping the guard without
/// [`Compensation::disarm`] runs them in one exclusive transaction, so an
/// error return, a panic and a dropped future all roll back the same way.
pub(crate) struct Compensation<'a> {
    cache: &'a ClaimCache,
    pending: Vec<(ClaimKey, Undo)>,
    /// Memory changed in a way the checkpoint has not seen yet.
    dirty: bool,
}

impl<'a> Compensation<'a> {
    pub(crate) fn new(cache: &'a ClaimCache) -> Self { Self { cache, pending: Vec::new(), dirty: false } }

    pub(crate) fn push(&mut self, key: ClaimKey, undo: Undo) { self.pending.push((key, undo)); }

    /// Checkpoint on rollback even if no undo action needs it.
    pub(crate) fn mark_dirty(&mut self) { self.dirty = true; }

    pub(crate) fn disarm(mut self) {
        self.pending.clear();
        self.dirty = false;
    }
}

impl Drop for Compensation<'_> {
    fn drop(&mut self) {
        if self.pending.is_empty() && !self.dirty {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        let must_sync = self.dirty || pending.iter().any(|(_, u)| matches!(u, Undo::RemoveReference(_)));
        let res = self.cache.with_exclusive(|txn| {
            for (key, undo) in &pending {
                let Some(rec) = txn.get_mut(key) else { continue };
                match undo {
                    Undo::RemoveReference(pod_uid) => {
                        rec.delete_pod_reference(pod_uid);
                    }
                    Undo::ClearReleasing => rec.set_releasing(false),
                    Undo::ClearPreparing => rec.set_preparing(false),
                }
                debug!(claim = %key, undo = ?undo, "compensated");
            }
            if must_sync {
                txn.sync_to_checkpoint()?;
            }
            Ok(())
        });
        if let Err(e) = res {
            warn!(error = %e, actions = pending.len(), "compensation incomplete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeclaim_core::ClaimRecord;
    use nodeclaim_persist::MemoryCheckpointer;
    use std::sync::Arc;

    fn cache_with(pods: &[&str]) -> (Arc<MemoryCheckpointer>, ClaimCache) {
        let cp = Arc::new(MemoryCheckpointer::new());
        let cache = ClaimCache::new(cp.clone()).unwrap();
        cache
            .with_exclusive(|txn| {
                let rec = txn.add(ClaimRecord::new("uid-1", "gpu", "ns", "drv", Vec::new()))?;
                for p in pods {
                    rec.add_pod_reference(p);
                }
                rec.set_releasing(true);
                rec.set_preparing(true);
                Ok(())
            })
            .unwrap();
        (cp, cache)
    }

    #[test]
    fn dropping_armed_guard_undoes_and_checkpoints() {
        let (cp, cache) = cache_with(&["pod-a", "pod-b"]);
        {
            let mut g = Compensation::new(&cache);
            g.push(ClaimKey::new("ns", "gpu"), Undo::RemoveReference("pod-a".into()));
            g.push(ClaimKey::new("ns", "gpu"), Undo::ClearReleasing);
            g.push(ClaimKey::new("ns", "gpu"), Undo::ClearPreparing);
        }
        let (refs, releasing, preparing) = cache
            .with_shared(|v| {
                let rec = v.get(&ClaimKey::new("ns", "gpu")).unwrap();
                Ok((rec.pod_uids().map(String::from).collect::<Vec<_>>(), rec.is_releasing(), rec.is_preparing()))
            })
            .unwrap();
        assert_eq!(refs, vec!["pod-b".to_string()]);
        assert!(!releasing);
        assert!(!preparing);
        assert_eq!(cp.writes(), 1);
    }

    #[test]
    fn disarmed_guard_does_nothing() {
        let (cp, cache) = cache_with(&["pod-a"]);
        let mut g = Compensation::new(&cache);
        g.push(ClaimKey::new("ns", "gpu"), Undo::RemoveReference("pod-a".into()));
        g.disarm();
        assert!(cache.with_shared(|v| Ok(v.has_pod_reference("pod-a"))).unwrap());
        assert_eq!(cp.writes(), 0);
    }

    #[test]
    fn clearing_releasing_alone_skips_the_checkpoint() {
        let (cp, cache) = cache_with(&["pod-a"]);
        drop({
            let mut g = Compensation::new(&cache);
            g.push(ClaimKey::new("ns", "gpu"), Undo::ClearReleasing);
            g
        });
        assert_eq!(cp.writes(), 0);
        assert!(!cache.with_shared(|v| Ok(v.get(&ClaimKey::new("ns", "gpu")).unwrap().is_releasing())).unwrap());
    }

    #[test]
    fn dirty_guard_checkpoints_on_rollback() {
        let (cp, cache) = cache_with(&["pod-a"]);
        {
            let mut g = Compensation::new(&cache);
            cache.with_exclusive(|txn| Ok(txn.delete(&ClaimKey::new("ns", "gpu")))).unwrap();
            g.mark_dirty();
        }
        assert_eq!(cp.writes(), 1);
        assert!(cp.stored().is_empty());

        let g = {
            let mut g = Compensation::new(&cache);
            g.mark_dirty();
            g
        };
        g.disarm();
        assert_eq!(cp.writes(), 1);
    }
}
