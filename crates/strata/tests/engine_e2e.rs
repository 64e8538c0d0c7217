//! Whole-engine scenarios: checkpoint frontier durability across
//! restarts, multi-store flushes, and the replicated device's journaled
//! write path with out-of-line values.

use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use strata::{
    BlockId, DeviceSpec, Engine, EngineConfig, FamilyKind, IoFlag, LogRecord, Lsn,
    ProvisionParams, RecordType, ReplListener,
};
use tempfile::TempDir;

const DEV_SIZE: u64 = 256 << 20;

fn test_config() -> EngineConfig {
    EngineConfig {
        max_vdevs: 8,
        max_chunks: 64,
        // Long automatic timers: tests drive checkpoints explicitly.
        cp_timer: Duration::from_secs(600),
        cp_watchdog_timer: Duration::from_secs(600),
        flush_threshold_bytes: 8 * 1024,
        flush_timer: Duration::from_millis(20),
        flush_multiple: 16,
        ..EngineConfig::default()
    }
}

fn provision() -> ProvisionParams {
    ProvisionParams {
        log_vdev_size: 8 << 20,
        data_vdev_size: 16 << 20,
        blk_size: 4096,
    }
}

fn boot(dev: &Path, listener: Option<Arc<dyn ReplListener>>) -> Arc<Engine> {
    Engine::start(
        vec![DeviceSpec::new(dev, DEV_SIZE)],
        test_config(),
        IoFlag::Buffered,
        provision(),
        listener,
    )
    .unwrap()
}

/// Listener that records commits and lets tests wait for the Nth one.
#[derive(Default)]
struct RecordingListener {
    commits: Mutex<Vec<(Lsn, Vec<u8>, Vec<u8>, Option<BlockId>)>>,
    pre_commits: Mutex<Vec<Lsn>>,
    cv: Condvar,
}

impl RecordingListener {
    fn wait_for_commits(&self, n: usize) {
        let mut commits = self.commits.lock();
        while commits.len() < n {
            self.cv.wait(&mut commits);
        }
    }

    fn commits(&self) -> Vec<(Lsn, Vec<u8>, Vec<u8>, Option<BlockId>)> {
        self.commits.lock().clone()
    }
}

impl ReplListener for RecordingListener {
    fn on_pre_commit(&self, lsn: Lsn, _header: &[u8], _key: &[u8]) {
        self.pre_commits.lock().push(lsn);
    }

    fn on_commit(&self, lsn: Lsn, header: &[u8], key: &[u8], blkid: Option<BlockId>) {
        self.commits
            .lock()
            .push((lsn, header.to_vec(), key.to_vec(), blkid));
        self.cv.notify_all();
    }
}

#[test]
fn cp_frontier_survives_restart() {
    let dir = TempDir::new().unwrap();
    let dev = dir.path().join("dev0.dat");

    let engine = boot(&dev, None);
    assert!(engine.is_first_time_boot());
    let triggered = engine.cp_manager().cur_cp_id();
    assert!(engine.trigger_cp_flush(false).wait());
    assert_eq!(engine.cp_manager().last_flushed_cp(), triggered);
    engine.shutdown();
    // Shutdown's final forced checkpoint advances the frontier once
    // more.
    let at_shutdown = engine.cp_manager().last_flushed_cp();
    assert_eq!(at_shutdown.0, triggered.0 + 1);
    drop(engine);

    let engine = boot(&dev, None);
    assert!(!engine.is_first_time_boot());
    assert!(
        engine.cp_manager().last_flushed_cp() >= at_shutdown,
        "restart observes at least the persisted frontier"
    );
    assert_eq!(
        engine.cp_manager().cur_cp_id().0,
        engine.cp_manager().last_flushed_cp().0 + 1
    );
    engine.shutdown();
}

#[test]
fn two_stores_flush_in_one_checkpoint() {
    let dir = TempDir::new().unwrap();
    let dev = dir.path().join("dev0.dat");

    let engine = boot(&dev, None);
    let a = engine
        .log_service()
        .create_new_log_store(FamilyKind::Data, true)
        .unwrap();
    let b = engine
        .log_service()
        .create_new_log_store(FamilyKind::Data, true)
        .unwrap();
    let (a_id, b_id) = (a.store_id(), b.store_id());

    a.append(
        LogRecord::inline(vec![1], vec![10], vec![100; 64]),
        Box::new(|res| assert!(res.is_ok())),
    )
    .unwrap();
    b.append(
        LogRecord::inline(vec![2], vec![20], vec![200; 64]),
        Box::new(|res| assert!(res.is_ok())),
    )
    .unwrap();

    let triggered = engine.cp_manager().cur_cp_id();
    assert!(engine.trigger_cp_flush(false).wait());
    assert_eq!(engine.cp_manager().last_flushed_cp(), triggered);

    // Crash image taken after the checkpoint: both records and the
    // frontier must be in it.
    let crash_image: PathBuf = dir.path().join("crash.dat");
    std::fs::copy(&dev, &crash_image).unwrap();
    engine.shutdown();

    let engine = boot(&crash_image, None);
    assert!(engine.cp_manager().last_flushed_cp() >= triggered);

    for (store_id, tag) in [(a_id, 100_u8), (b_id, 200_u8)] {
        let recovered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&recovered);
        let _store = engine
            .log_service()
            .open_log_store(FamilyKind::Data, store_id, true, move |store| {
                let sink = Arc::clone(&sink);
                store.register_log_found_cb(Box::new(move |lsn, rec| {
                    sink.lock().push((lsn, rec.clone()));
                }));
            })
            .unwrap();
        let recovered = recovered.lock().clone();
        assert_eq!(recovered.len(), 1, "store {store_id} replays its record");
        assert_eq!(recovered[0].0, Lsn(1));
        assert_eq!(recovered[0].1.payload, vec![tag; 64]);
    }
    engine.shutdown();
}

#[test]
fn repl_dev_inline_and_out_of_line_writes() {
    let dir = TempDir::new().unwrap();
    let dev = dir.path().join("dev0.dat");

    let listener = Arc::new(RecordingListener::default());
    let engine = boot(&dev, Some(Arc::clone(&listener) as _));
    let repl = engine.repl_dev();

    // Header-only entry goes straight to the journal.
    repl.async_alloc_write(b"hdr-1".to_vec(), b"key-1".to_vec(), Vec::new())
        .unwrap();
    // A large value is written out-of-line first.
    let value = vec![0xEE_u8; 10_000];
    repl.async_alloc_write(b"hdr-2".to_vec(), b"key-2".to_vec(), value.clone())
        .unwrap();
    listener.wait_for_commits(2);

    let commits = listener.commits();
    let inline = commits.iter().find(|c| c.2 == b"key-1").unwrap();
    assert!(inline.3.is_none(), "empty value journals inline");
    let large = commits.iter().find(|c| c.2 == b"key-2").unwrap();
    let blkid = large.3.expect("large value carries a block id");

    // The out-of-line bytes read back intact.
    let bytes = repl.read(blkid).unwrap();
    assert_eq!(&bytes[..value.len()], value.as_slice());
    assert!(engine.data_service().is_committed(blkid));

    // The journal record carries the serialized block id, tagged as
    // large data.
    let journal = engine
        .log_service()
        .family(FamilyKind::Data)
        .get_store(repl.journal_id())
        .unwrap();
    let record = journal.read(large.0).unwrap();
    assert_eq!(record.rtype, RecordType::LargeData);
    assert_eq!(record.payload.len(), BlockId::SERIALIZED_SIZE);
    assert_eq!(BlockId::deserialize(&record.payload).unwrap(), blkid);

    engine.shutdown();
}

#[test]
fn repl_dev_crash_replay_redrives_listener() {
    let dir = TempDir::new().unwrap();
    let dev = dir.path().join("dev0.dat");
    let crash_image = dir.path().join("crash.dat");

    let commits_before;
    {
        let listener = Arc::new(RecordingListener::default());
        let engine = boot(&dev, Some(Arc::clone(&listener) as _));
        let repl = engine.repl_dev();

        repl.async_alloc_write(b"h1".to_vec(), b"k1".to_vec(), Vec::new())
            .unwrap();
        repl.async_alloc_write(b"h2".to_vec(), b"k2".to_vec(), vec![7_u8; 5000])
            .unwrap();
        listener.wait_for_commits(2);
        commits_before = listener.commits();

        // Crash before any checkpoint: the journal is the only record
        // of these writes.
        std::fs::copy(&dev, &crash_image).unwrap();
        engine.shutdown();
    }

    let listener = Arc::new(RecordingListener::default());
    let engine = boot(&crash_image, Some(Arc::clone(&listener) as _));
    let commits_after = listener.commits();
    assert_eq!(commits_after.len(), 2, "recovery replays both journal entries");
    for (before, after) in commits_before.iter().zip(&commits_after) {
        assert_eq!(before.0, after.0, "lsn preserved");
        assert_eq!(before.1, after.1, "header preserved");
        assert_eq!(before.2, after.2, "key preserved");
        assert_eq!(before.3, after.3, "block id preserved");
    }
    assert_eq!(engine.repl_dev().commit_upto(), commits_before[1].0);

    // The replayed out-of-line blocks are committed again.
    if let Some(blkid) = commits_after[1].3 {
        assert!(engine.data_service().is_committed(blkid));
    }
    engine.shutdown();
}

#[test]
fn clean_shutdown_truncates_repl_journal() {
    let dir = TempDir::new().unwrap();
    let dev = dir.path().join("dev0.dat");

    {
        let listener = Arc::new(RecordingListener::default());
        let engine = boot(&dev, Some(Arc::clone(&listener) as _));
        engine
            .repl_dev()
            .async_alloc_write(b"h".to_vec(), b"k".to_vec(), Vec::new())
            .unwrap();
        listener.wait_for_commits(1);
        // Shutdown's forced checkpoint persists the commit frontier and
        // truncates the journal behind it.
        engine.shutdown();
    }

    let listener = Arc::new(RecordingListener::default());
    let engine = boot(&dev, Some(Arc::clone(&listener) as _));
    assert_eq!(
        listener.commits().len(),
        0,
        "checkpointed entries do not replay"
    );
    assert_eq!(engine.repl_dev().commit_upto(), Lsn(1));
    engine.shutdown();
}
