#![forbid(unsafe_code)]

use nodeclaim_core::{ClaimKey, ClaimRecord, DraError, ResourceHandle};
use nodeclaim_persist::checkpoint_path;
use nodeclaim_store::ClaimCache;

fn state_dir(tag: &str) -> std::path::PathBuf {
    let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
    std::env::temp_dir().join(format!("nodeclaim-store-{}-{}", tag, nanos))
}

fn handle(driver: &str) -> ResourceHandle {
    ResourceHandle { driver_name: driver.to_string(), data: "opaque".into(), structured_data: None }
}

#[test]
fn synced_records_come_back_after_reopen() {
    let path = checkpoint_path(state_dir("reopen"));
    {
        let cache = ClaimCache::open(&path).unwrap();
        cache
            .with_exclusive(|txn| {
                let rec = txn.add(ClaimRecord::new("uid-a", "a", "ns", "gpu.example.com", vec![handle(""), handle("net.example.com")]))?;
                rec.add_pod_reference("pod-1");
                rec.record_plugin_result("gpu.example.com", vec!["/dev/acc0".into()]);
                rec.record_plugin_result("net.example.com", Vec::new());
                rec.set_releasing(true);
                txn.add(ClaimRecord::new("uid-b", "b", "ns", "gpu.example.com", vec![handle("")]))?;
                txn.sync_to_checkpoint()
            })
            .unwrap();
        // not synced: lost on restart
        cache.with_exclusive(|txn| Ok(txn.delete(&ClaimKey::new("ns", "b")))).unwrap();
        cache.with_exclusive(|txn| txn.add(ClaimRecord::new("uid-c", "c", "ns", "drv", Vec::new())).map(|_| ())).unwrap();
    }

    let cache = ClaimCache::open(&path).unwrap();
    let names: Vec<String> = cache.with_shared(|v| Ok(v.records().iter().map(|r| r.claim_name().to_string()).collect())).unwrap();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    let a = cache.with_shared(|v| Ok(v.get(&ClaimKey::new("ns", "a")).unwrap().snapshot())).unwrap();
    assert!(a.prepared);
    assert_eq!(a.pod_uids, vec!["pod-1".to_string()]);
    assert_eq!(a.annotations.len(), 1);
    assert!(!cache.with_shared(|v| Ok(v.get(&ClaimKey::new("ns", "a")).unwrap().is_releasing())).unwrap());
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn unknown_schema_version_refuses_to_start() {
    let path = checkpoint_path(state_dir("version"));
    drop(ClaimCache::open(&path).unwrap());
    {
        let db = rusqlite::Connection::open(&path).unwrap();
        db.execute("UPDATE meta SET value = '2' WHERE key = 'schema_version'", []).unwrap();
    }
    let err = ClaimCache::open(&path).err().expect("newer layout must be rejected");
    assert!(matches!(err, DraError::CheckpointIncompatible(_)));
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}
