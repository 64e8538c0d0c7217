//! End-to-end log store scenarios over file-backed devices:
//! format/boot, durable append with replay after restart, crash-image
//! prefixes, per-store and device truncation, and flush batching.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata_device::{DeviceManager, DeviceSpec, VirtualDev};
use strata_device::manager::{AllocKind, VdevParams};
use strata_error::StrataError;
use strata_logstore::{FamilyKind, LogDevConfig, LogRecord, LogStore, LogStoreService};
use strata_meta::MetaService;
use strata_types::{DevTier, EngineConfig, IoFlag, Lsn, PlacementPolicy, StoreId};
use tempfile::TempDir;

const DEV_SIZE: u64 = 64 << 20;
const BLK_SIZE: u32 = 4096;

fn test_config() -> EngineConfig {
    EngineConfig {
        max_vdevs: 8,
        max_chunks: 64,
        flush_threshold_bytes: 8 * 1024,
        flush_timer: Duration::from_millis(20),
        flush_multiple: 16,
        ..EngineConfig::default()
    }
}

fn dev_config(config: &EngineConfig) -> LogDevConfig {
    LogDevConfig {
        buffer_capacity: BLK_SIZE as usize * config.flush_multiple,
        flush_threshold: config.flush_threshold_bytes,
        flush_timer: config.flush_timer,
    }
}

struct TestEngine {
    dm: Arc<DeviceManager>,
    svc: Arc<LogStoreService>,
}

impl TestEngine {
    fn log_vdev(dm: &Arc<DeviceManager>, name: &str) -> Arc<VirtualDev> {
        dm.create_vdev(VdevParams {
            name: name.to_owned(),
            vdev_size: 8 << 20,
            blk_size: BLK_SIZE,
            num_chunks: 1,
            placement: PlacementPolicy::SinglePdev,
            tier: DevTier::Data,
            alloc_kind: AllocKind::Append,
            context: Vec::new(),
        })
        .unwrap()
    }

    fn boot(dev_path: &Path) -> Self {
        let config = test_config();
        let dm = DeviceManager::new(
            vec![DeviceSpec::new(dev_path, DEV_SIZE)],
            config.clone(),
            IoFlag::Buffered,
        )
        .unwrap();

        let format = dm.is_first_time_boot();
        let (data_vdev, ctrl_vdev, meta, svc);
        if format {
            dm.format_devices().unwrap();
            meta = Arc::new(MetaService::new(dm.meta_pdev().unwrap()));
            svc = LogStoreService::new(&meta);
            meta.format().unwrap();
            data_vdev = Self::log_vdev(&dm, FamilyKind::Data.vdev_name());
            ctrl_vdev = Self::log_vdev(&dm, FamilyKind::Ctrl.vdev_name());
        } else {
            dm.load_devices().unwrap();
            meta = Arc::new(MetaService::new(dm.meta_pdev().unwrap()));
            svc = LogStoreService::new(&meta);
            meta.replay().unwrap();
            data_vdev = dm.get_vdev_by_name(FamilyKind::Data.vdev_name()).unwrap();
            ctrl_vdev = dm.get_vdev_by_name(FamilyKind::Ctrl.vdev_name()).unwrap();
        }
        svc.start(format, data_vdev, ctrl_vdev, &dev_config(&config))
            .unwrap();
        Self { dm, svc }
    }

    fn stop(&self) {
        self.svc.stop();
    }
}

fn record(tag: u8, len: usize) -> LogRecord {
    LogRecord::inline(vec![tag], vec![tag, tag], vec![tag; len])
}

/// Open a store and collect everything its replay callback delivers.
fn open_collecting(
    svc: &LogStoreService,
    store_id: StoreId,
) -> (Arc<LogStore>, Arc<Mutex<Vec<(Lsn, LogRecord)>>>) {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    let store = svc
        .open_log_store(FamilyKind::Data, store_id, true, move |store| {
            let sink = Arc::clone(&sink);
            store.register_log_found_cb(Box::new(move |lsn, rec| {
                sink.lock().unwrap().push((lsn, rec.clone()));
            }));
        })
        .unwrap();
    (store, collected)
}

#[test]
fn append_restart_replays_in_lsn_order() {
    let dir = TempDir::new().unwrap();
    let dev = dir.path().join("dev0.dat");

    let engine = TestEngine::boot(&dev);
    let store = engine
        .svc
        .create_new_log_store(FamilyKind::Data, true)
        .unwrap();
    let store_id = store.store_id();

    let mut appended = Vec::new();
    for i in 0..10_u8 {
        let rec = record(i, 128);
        let lsn = store.append_sync(rec.clone()).unwrap();
        assert_eq!(lsn, Lsn(u64::from(i) + 1), "LSNs are dense from 1");
        appended.push((lsn, rec));
    }
    engine.stop();

    let engine = TestEngine::boot(&dev);
    let (_store, collected) = open_collecting(&engine.svc, store_id);
    let collected = collected.lock().unwrap().clone();
    assert_eq!(collected, appended);
    engine.stop();
}

#[test]
fn lsn_callbacks_fire_in_order() {
    let dir = TempDir::new().unwrap();
    let engine = TestEngine::boot(&dir.path().join("dev0.dat"));
    let store = engine
        .svc
        .create_new_log_store(FamilyKind::Data, true)
        .unwrap();

    let last_seen = Arc::new(AtomicU64::new(0));
    for _ in 0..200 {
        let last_seen = Arc::clone(&last_seen);
        store
            .append(
                record(1, 16),
                Box::new(move |res| {
                    let lsn = res.unwrap().0;
                    let prev = last_seen.swap(lsn, Ordering::SeqCst);
                    assert!(lsn > prev, "callback order violates LSN order: {lsn} after {prev}");
                }),
            )
            .unwrap();
    }
    engine.svc.flush_sync().unwrap();
    assert_eq!(last_seen.load(Ordering::SeqCst), 200);
    engine.stop();
}

#[test]
fn crash_image_recovers_exact_prefix() {
    let dir = TempDir::new().unwrap();
    let dev = dir.path().join("dev0.dat");
    let crash_image: PathBuf = dir.path().join("crash.dat");

    let engine = TestEngine::boot(&dev);
    let store = engine
        .svc
        .create_new_log_store(FamilyKind::Data, true)
        .unwrap();
    let store_id = store.store_id();

    let mut first_seven = Vec::new();
    for i in 0..7_u8 {
        let rec = record(i, 128);
        let lsn = store.append_sync(rec.clone()).unwrap();
        first_seven.push((lsn, rec));
    }
    // Snapshot the device at the instant the 7th callback fired; this
    // is the crash image.
    std::fs::copy(&dev, &crash_image).unwrap();

    for i in 7..10_u8 {
        store.append_sync(record(i, 128)).unwrap();
    }
    engine.stop();

    let engine = TestEngine::boot(&crash_image);
    let (store, collected) = open_collecting(&engine.svc, store_id);
    let collected = collected.lock().unwrap().clone();
    assert_eq!(collected, first_seven, "exactly the pre-crash prefix replays");
    assert!(store.read(Lsn(8)).is_err());
    engine.stop();
}

#[test]
fn per_store_truncation_survives_restart() {
    let dir = TempDir::new().unwrap();
    let dev = dir.path().join("dev0.dat");

    let engine = TestEngine::boot(&dev);
    let store = engine
        .svc
        .create_new_log_store(FamilyKind::Data, true)
        .unwrap();
    let store_id = store.store_id();
    for i in 0..10_u8 {
        store.append_sync(record(i, 64)).unwrap();
    }

    store.truncate(Lsn(4));
    // Idempotent and monotonic: truncating below is a no-op.
    store.truncate(Lsn(2));
    assert_eq!(store.truncation_point(), Lsn(4));
    assert!(store.read(Lsn(4)).is_err());
    assert!(store.read(Lsn(5)).is_ok());

    engine.svc.device_truncate(None, true, false).unwrap();
    engine.stop();

    let engine = TestEngine::boot(&dev);
    let (store, collected) = open_collecting(&engine.svc, store_id);
    let lsns: Vec<u64> = collected.lock().unwrap().iter().map(|(l, _)| l.0).collect();
    assert_eq!(lsns, vec![5, 6, 7, 8, 9, 10]);
    assert!(store.read(Lsn(4)).is_err());
    engine.stop();
}

#[test]
fn device_truncation_point_is_min_over_stores() {
    let dir = TempDir::new().unwrap();
    let engine = TestEngine::boot(&dir.path().join("dev0.dat"));

    let stores: Vec<Arc<LogStore>> = (0..3)
        .map(|_| engine.svc.create_new_log_store(FamilyKind::Data, true).unwrap())
        .collect();
    for store in &stores {
        for i in 0..160_u8 {
            store.append_sync(record(i, 16)).unwrap();
        }
    }

    // First-needed LSNs become 100, 150, 80.
    stores[0].truncate(Lsn(99));
    stores[1].truncate(Lsn(149));
    stores[2].truncate(Lsn(79));

    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    engine
        .svc
        .device_truncate(
            Some(Box::new(move |kind, first_needed| {
                sink.lock().unwrap().push((kind, first_needed));
            })),
            true,
            false,
        )
        .unwrap();

    let reported = reported.lock().unwrap().clone();
    let data_min = reported
        .iter()
        .find(|(kind, _)| *kind == FamilyKind::Data)
        .and_then(|(_, min)| *min);
    assert_eq!(data_min, Some(Lsn(80)), "family frontier is the min over stores");

    assert!(stores[2].read(Lsn(79)).is_err());
    assert!(stores[2].read(Lsn(80)).is_ok());
    engine.stop();
}

#[test]
fn records_in_one_family_share_flush_batches() {
    let dir = TempDir::new().unwrap();
    let engine = TestEngine::boot(&dir.path().join("dev0.dat"));

    let a = engine.svc.create_new_log_store(FamilyKind::Data, true).unwrap();
    let b = engine.svc.create_new_log_store(FamilyKind::Data, true).unwrap();

    a.append(record(1, 32), Box::new(|res| assert!(res.is_ok()))).unwrap();
    b.append(record(2, 32), Box::new(|res| assert!(res.is_ok()))).unwrap();
    engine.svc.flush_sync().unwrap();

    let stats = engine.svc.family(FamilyKind::Data).stats().unwrap();
    assert_eq!(stats.records_flushed, 2);
    assert!(
        stats.flush_by_size + stats.flush_by_timer >= 1,
        "at least one flush happened"
    );
    engine.stop();
}

#[test]
fn size_threshold_triggers_flush() {
    let dir = TempDir::new().unwrap();
    let engine = TestEngine::boot(&dir.path().join("dev0.dat"));
    let store = engine.svc.create_new_log_store(FamilyKind::Data, true).unwrap();

    // Each record is ~4 KiB; eight queued back-to-back cross the 8 KiB
    // threshold well before the 20 ms timer.
    for i in 0..8_u8 {
        store
            .append(record(i, 4000), Box::new(|res| assert!(res.is_ok())))
            .unwrap();
    }
    engine.svc.flush_sync().unwrap();
    let stats = engine.svc.family(FamilyKind::Data).stats().unwrap();
    assert!(stats.flush_by_size >= 1, "expected a size-triggered flush");
    engine.stop();
}

#[test]
fn oversize_record_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = TestEngine::boot(&dir.path().join("dev0.dat"));
    let store = engine.svc.create_new_log_store(FamilyKind::Data, true).unwrap();

    let capacity = BLK_SIZE as usize * test_config().flush_multiple;
    let res = store.append_sync(record(0, capacity + 1));
    assert!(matches!(res, Err(StrataError::InvalidArgument(_))));
    engine.stop();
}

#[test]
fn unknown_store_id_rejected_on_open() {
    let dir = TempDir::new().unwrap();
    let engine = TestEngine::boot(&dir.path().join("dev0.dat"));
    let res = engine
        .svc
        .open_log_store(FamilyKind::Data, StoreId(42), true, |_| {});
    assert!(matches!(res, Err(StrataError::InvalidArgument(_))));
    engine.stop();
}

#[test]
fn removed_store_records_become_reclaimable() {
    let dir = TempDir::new().unwrap();
    let dev = dir.path().join("dev0.dat");
    let engine = TestEngine::boot(&dev);

    let doomed = engine.svc.create_new_log_store(FamilyKind::Data, true).unwrap();
    let doomed_id = doomed.store_id();
    for i in 0..4_u8 {
        doomed.append_sync(record(i, 64)).unwrap();
    }
    engine.svc.remove_log_store(FamilyKind::Data, doomed_id).unwrap();
    engine.svc.device_truncate(None, true, false).unwrap();
    engine.stop();

    let engine = TestEngine::boot(&dev);
    let res = engine
        .svc
        .open_log_store(FamilyKind::Data, doomed_id, true, |_| {});
    assert!(res.is_err(), "removed store must not reopen");
    engine.stop();
}

#[test]
fn format_load_topology_roundtrip() {
    let dir = TempDir::new().unwrap();
    let dev = dir.path().join("dev0.dat");

    let engine = TestEngine::boot(&dev);
    let vdevs_before: Vec<_> = engine
        .dm
        .vdevs()
        .iter()
        .map(|v| (v.vdev_id(), v.name(), v.size(), v.num_chunks()))
        .collect();
    let uuid_before = engine.dm.system_uuid();
    engine.stop();

    let engine = TestEngine::boot(&dev);
    let vdevs_after: Vec<_> = engine
        .dm
        .vdevs()
        .iter()
        .map(|v| (v.vdev_id(), v.name(), v.size(), v.num_chunks()))
        .collect();
    assert_eq!(vdevs_before, vdevs_after);
    assert_eq!(uuid_before, engine.dm.system_uuid());
    engine.stop();
}
