//! Topology scenarios over file-backed devices: striped and mirrored
//! vdev geometry, format/load round trips, mirror read fall-through,
//! free-chunk coalescing, and dangling-chunk crash recovery.

use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_device::manager::{AllocKind, VdevParams};
use strata_device::superblock::{SuperBlkLayout, VdevInfo, VDEV_INFO_SIZE};
use strata_device::{DeviceManager, DeviceSpec};
use strata_types::{DevTier, EngineConfig, IoFlag, PlacementPolicy, VdevId};
use tempfile::TempDir;

const GIB: u64 = 1 << 30;
const MIB: u64 = 1 << 20;

fn test_config() -> EngineConfig {
    EngineConfig {
        max_vdevs: 8,
        max_chunks: 64,
        ..EngineConfig::default()
    }
}

fn two_dev_paths(dir: &TempDir) -> Vec<PathBuf> {
    vec![dir.path().join("dev0.dat"), dir.path().join("dev1.dat")]
}

fn boot(paths: &[PathBuf], dev_size: u64) -> Arc<DeviceManager> {
    let specs = paths
        .iter()
        .map(|p| DeviceSpec::new(p, dev_size))
        .collect();
    let dm = DeviceManager::new(specs, test_config(), IoFlag::Buffered).unwrap();
    if dm.is_first_time_boot() {
        dm.format_devices().unwrap();
    } else {
        dm.load_devices().unwrap();
    }
    dm
}

fn striped_params(size: u64, num_chunks: u32) -> VdevParams {
    VdevParams {
        name: "user_data".to_owned(),
        vdev_size: size,
        blk_size: 4096,
        num_chunks,
        placement: PlacementPolicy::Striped,
        tier: DevTier::Data,
        alloc_kind: AllocKind::Append,
        context: vec![0xAB, 0xCD],
    }
}

fn read_vdev_slot(path: &Path, vdev_id: VdevId) -> Vec<u8> {
    let config = test_config();
    let layout = SuperBlkLayout::new(
        config.max_vdevs,
        config.max_chunks,
        config.atomic_phys_page_size,
    );
    let file = std::fs::File::open(path).unwrap();
    let mut buf = vec![0_u8; VDEV_INFO_SIZE];
    file.read_exact_at(&mut buf, layout.vdev_slot_offset(vdev_id))
        .unwrap();
    buf
}

#[test]
fn striped_vdev_geometry_across_two_devices() {
    let dir = TempDir::new().unwrap();
    let paths = two_dev_paths(&dir);
    let dm = boot(&paths, GIB);

    let vdev = dm.create_vdev(striped_params(512 * MIB, 4)).unwrap();
    assert_eq!(vdev.size(), 512 * MIB);
    assert_eq!(vdev.num_chunks(), 4);
    assert_eq!(vdev.chunk_size(), 128 * MIB);

    // Two chunks of 128 MiB land on each device.
    for pdev in dm.pdevs() {
        let on_this_dev: Vec<_> = vdev
            .chunks()
            .into_iter()
            .filter(|c| c.pdev_id() == pdev.pdev_id())
            .collect();
        assert_eq!(on_this_dev.len(), 2);
        for chunk in on_this_dev {
            assert_eq!(chunk.size(), 128 * MIB);
        }
    }

    // Stripe order is the chunk-id order `chunks()` returns; it must
    // cycle the devices so consecutive stripes never share a pdev.
    let stripe_pdevs: Vec<u32> = vdev.chunks().iter().map(|c| c.pdev_id().0).collect();
    assert_eq!(stripe_pdevs, vec![0, 1, 0, 1]);
    for pair in stripe_pdevs.windows(2) {
        assert_ne!(
            pair[0], pair[1],
            "consecutive stripes resolve to the same device"
        );
    }

    let info = vdev.info();
    assert_eq!(info.num_primary_chunks, 2, "stripe width equals pdev count");
    assert_eq!(info.num_mirrors, 0);

    // Both devices carry byte-identical vdev records.
    let slot0 = read_vdev_slot(&paths[0], vdev.vdev_id());
    let slot1 = read_vdev_slot(&paths[1], vdev.vdev_id());
    assert_eq!(slot0, slot1);
    let parsed = VdevInfo::deserialize(&slot0).unwrap();
    assert_eq!(parsed.num_primary_chunks, 2);
    assert_eq!(parsed.vdev_size, 512 * MIB);
    assert_eq!(parsed.context, vec![0xAB, 0xCD]);
}

#[test]
fn format_then_load_yields_identical_topology() {
    let dir = TempDir::new().unwrap();
    let paths = two_dev_paths(&dir);

    let dm = boot(&paths, GIB);
    let vdev = dm.create_vdev(striped_params(512 * MIB, 4)).unwrap();
    let chunks_before: Vec<_> = vdev
        .chunks()
        .iter()
        .map(|c| (c.chunk_id(), c.pdev_id(), c.start_offset(), c.size()))
        .collect();
    let uuid = dm.system_uuid();
    drop(dm);

    let dm = boot(&paths, GIB);
    assert_eq!(dm.system_uuid(), uuid);
    let vdev = dm.get_vdev_by_name("user_data").unwrap();
    let mut chunks_after: Vec<_> = vdev
        .chunks()
        .iter()
        .map(|c| (c.chunk_id(), c.pdev_id(), c.start_offset(), c.size()))
        .collect();
    chunks_after.sort();
    let mut chunks_before = chunks_before;
    chunks_before.sort();
    assert_eq!(chunks_before, chunks_after);
}

#[test]
fn every_chunk_is_free_xor_owned_and_sizes_sum() {
    let dir = TempDir::new().unwrap();
    let paths = two_dev_paths(&dir);
    let dm = boot(&paths, GIB);
    let vdev = dm.create_vdev(striped_params(512 * MIB, 4)).unwrap();

    let total: u64 = vdev.chunks().iter().map(|c| c.size()).sum();
    assert_eq!(total, vdev.size());

    for chunk in vdev.chunks() {
        assert!(chunk.is_busy());
        assert_eq!(chunk.vdev_id(), vdev.vdev_id());
    }
}

#[test]
fn mirrored_read_falls_through_to_replica() {
    let dir = TempDir::new().unwrap();
    let paths = two_dev_paths(&dir);
    let dm = boot(&paths, GIB);

    let vdev = dm
        .create_vdev(VdevParams {
            name: "mirrored_idx".to_owned(),
            vdev_size: 64 * MIB,
            blk_size: 4096,
            num_chunks: 1,
            placement: PlacementPolicy::Mirrored,
            tier: DevTier::Data,
            alloc_kind: AllocKind::Bitmap,
            context: Vec::new(),
        })
        .unwrap();

    let info = vdev.info();
    assert_eq!(info.num_mirrors, 2);
    assert_eq!(info.num_mirrors * info.num_primary_chunks, vdev.num_chunks() as u32);

    let block = vec![0x5A_u8; 4096];
    vdev.sync_write(&block, 0).unwrap();

    // Fault the primary copy's whole chunk on device 0.
    let chunks = vdev.chunks();
    let primary = chunks
        .iter()
        .find(|c| !c.primary_chunk_id().is_valid())
        .unwrap();
    primary
        .pdev()
        .faults()
        .arm_read_fault(primary.start_offset(), primary.size());

    let mut readback = vec![0_u8; 4096];
    vdev.sync_read(&mut readback, 0).unwrap();
    assert_eq!(readback, block, "read served byte-identical from the replica");

    primary.pdev().faults().clear();
}

#[test]
fn freed_vdev_chunks_coalesce_and_get_reused() {
    let dir = TempDir::new().unwrap();
    let paths = vec![dir.path().join("dev0.dat")];
    let dm = boot(&paths, GIB);

    let make = |name: &str, size: u64| VdevParams {
        name: name.to_owned(),
        vdev_size: size,
        blk_size: 4096,
        num_chunks: 2,
        placement: PlacementPolicy::SinglePdev,
        tier: DevTier::Data,
        alloc_kind: AllocKind::Append,
        context: Vec::new(),
    };

    let a = dm.create_vdev(make("a", 64 * MIB)).unwrap();
    let b = dm.create_vdev(make("b", 64 * MIB)).unwrap();
    let a_start = a
        .chunks()
        .iter()
        .map(|c| c.start_offset())
        .min()
        .unwrap();
    let a_id = a.vdev_id();

    dm.free_vdev(a_id).unwrap();
    assert!(dm.get_vdev(a_id).is_none());

    // The two freed 32 MiB chunks coalesced into one 64 MiB free chunk
    // starting where vdev `a` began; a single-chunk vdev of the same
    // size takes it over exactly.
    let c = dm
        .create_vdev(VdevParams {
            num_chunks: 1,
            ..make("c", 64 * MIB)
        })
        .unwrap();
    let c_chunks = c.chunks();
    assert_eq!(c_chunks.len(), 1);
    assert_eq!(c_chunks[0].start_offset(), a_start);
    assert_eq!(c_chunks[0].size(), 64 * MIB);

    // `b` is untouched.
    assert!(dm.get_vdev(b.vdev_id()).is_some());
}

#[test]
fn dangling_chunks_are_dropped_so_create_can_retry() {
    let dir = TempDir::new().unwrap();
    let paths = two_dev_paths(&dir);

    let (vdev_id, num_chunks) = {
        let dm = boot(&paths, GIB);
        let vdev = dm.create_vdev(striped_params(256 * MIB, 4)).unwrap();
        (vdev.vdev_id(), vdev.num_chunks())
    };
    assert_eq!(num_chunks, 4);

    // Simulate a crash between chunk persistence and the vdev record
    // write: wipe the vdev slot on every device, leaving the chunk
    // records behind.
    let config = test_config();
    let layout = SuperBlkLayout::new(
        config.max_vdevs,
        config.max_chunks,
        config.atomic_phys_page_size,
    );
    for path in &paths {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.write_all_at(&[0_u8; VDEV_INFO_SIZE], layout.vdev_slot_offset(vdev_id))
            .unwrap();
        file.sync_all().unwrap();
    }

    let dm = boot(&paths, GIB);
    assert!(
        dm.get_vdev_by_name("user_data").is_none(),
        "half-created vdev does not load"
    );

    // The upper layer retries; the dangling chunks were dropped so the
    // space and ids are available again.
    let vdev = dm.create_vdev(striped_params(256 * MIB, 4)).unwrap();
    assert_eq!(vdev.num_chunks(), 4);
}

#[test]
fn foreign_device_is_refused() {
    let dir = TempDir::new().unwrap();
    let paths = two_dev_paths(&dir);

    // Two independently formatted single-device systems.
    {
        let dm = DeviceManager::new(
            vec![DeviceSpec::new(&paths[0], GIB)],
            test_config(),
            IoFlag::Buffered,
        )
        .unwrap();
        dm.format_devices().unwrap();
    }
    {
        let dm = DeviceManager::new(
            vec![DeviceSpec::new(&paths[1], GIB)],
            test_config(),
            IoFlag::Buffered,
        )
        .unwrap();
        dm.format_devices().unwrap();
    }

    // Loading them as one system must fail: either the uuids differ or
    // the formatted pdev count does not match the presented count.
    let dm = DeviceManager::new(
        paths.iter().map(|p| DeviceSpec::new(p, GIB)).collect(),
        test_config(),
        IoFlag::Buffered,
    )
    .unwrap();
    assert!(!dm.is_first_time_boot());
    assert!(dm.load_devices().is_err());
}
