#![forbid(unsafe_code)]
//! Strata public API facade.
//!
//! [`Engine`] wires the subsystems together in boot order: device
//! manager (format or load), meta service construction, handler
//! registration, meta replay, log families, data service, checkpoint
//! manager, and the solo replicated device. Every subsystem receives
//! what it needs at construction; nothing reaches out to a global.

pub use strata_cp::{Cp, CpAwait, CpCallbacks, CpConsumerKind, CpGuard, CpManager, CpStatus};
pub use strata_data::{BlockId, DataService};
pub use strata_device::{Chunk, DeviceManager, DeviceSpec, PhysicalDev, VdevParams, VirtualDev};
pub use strata_error::{Result, StrataError};
pub use strata_logstore::{
    FamilyKind, LogRecord, LogStore, LogStoreService, RecordType, StoreAppendCb,
};
pub use strata_meta::MetaService;
pub use strata_repl::{KeyRange, ReplListener, SoloReplDev};
pub use strata_types::{
    ChunkId, CpId, DevTier, EngineConfig, IoFlag, Lsn, PdevId, PlacementPolicy, StoreId, VdevId,
};

use std::sync::Arc;
use strata_cp::CpConfig;
use strata_device::manager::AllocKind;
use strata_logstore::LogDevConfig;
use tracing::info;

/// Sizes of the vdevs the engine provisions on first boot.
#[derive(Debug, Clone)]
pub struct ProvisionParams {
    pub log_vdev_size: u64,
    pub data_vdev_size: u64,
    pub blk_size: u32,
}

impl Default for ProvisionParams {
    fn default() -> Self {
        Self {
            log_vdev_size: 32 << 20,
            data_vdev_size: 64 << 20,
            blk_size: 4096,
        }
    }
}

/// Adapter registering the log store service as a checkpoint consumer:
/// a checkpoint flush drains both families' write buffers, and cleanup
/// kicks a device truncation pass.
struct LogStoreCpConsumer {
    service: Arc<LogStoreService>,
}

impl CpCallbacks for LogStoreCpConsumer {
    fn on_switchover_cp(
        &self,
        _cur_cp: Option<&Cp>,
        _new_cp: &Cp,
    ) -> Option<strata_cp::CpContext> {
        None
    }

    fn cp_flush(&self, cp: &Arc<Cp>) -> CpAwait {
        match self.service.flush_sync() {
            Ok(()) => CpAwait::ready(true),
            Err(e) => {
                tracing::error!(
                    target: "strata::engine",
                    cp_id = cp.id().0,
                    error = %e,
                    "log_store_cp_flush_failed"
                );
                CpAwait::ready(false)
            }
        }
    }

    fn cp_cleanup(&self, _cp: &Cp) {
        // Reclamation is asynchronous; the truncation worker owns the
        // blocking part.
        let _ = self.service.device_truncate(None, false, false);
    }

    fn cp_progress_percent(&self) -> u32 {
        100
    }
}

/// The engine handle owning every subsystem.
pub struct Engine {
    dm: Arc<DeviceManager>,
    meta: Arc<MetaService>,
    log_service: Arc<LogStoreService>,
    data_service: Arc<DataService>,
    cp_manager: Arc<CpManager>,
    repl_dev: Arc<SoloReplDev>,
    first_time_boot: bool,
}

impl Engine {
    /// Boot the engine over the given devices, formatting them on first
    /// use. `repl_listener` must be supplied before the replicated
    /// device recovers, which is why it is wired here rather than after
    /// boot.
    pub fn start(
        specs: Vec<DeviceSpec>,
        config: EngineConfig,
        io_flag: IoFlag,
        provision: ProvisionParams,
        repl_listener: Option<Arc<dyn ReplListener>>,
    ) -> Result<Arc<Self>> {
        let dm = DeviceManager::new(specs, config.clone(), io_flag)?;
        let first_time_boot = dm.is_first_time_boot();
        if first_time_boot {
            dm.format_devices()?;
        } else {
            dm.load_devices()?;
        }

        // Construct every service (registering meta handlers) before
        // the meta region replays; replay must reach each handler
        // before its component starts I/O.
        let meta = Arc::new(MetaService::new(dm.meta_pdev()?));
        let log_service = LogStoreService::new(&meta);
        let data_service = DataService::new(&meta);
        let cp_manager = CpManager::new(
            Arc::clone(&meta),
            CpConfig {
                cp_timer: config.cp_timer,
                watchdog_timer: config.cp_watchdog_timer,
            },
        );
        let repl_dev = SoloReplDev::new(&meta, &data_service);

        if first_time_boot {
            meta.format()?;
        } else {
            meta.replay()?;
        }

        let (data_log_vdev, ctrl_log_vdev, user_data_vdev) = if first_time_boot {
            let log_vdev = |name: &str| {
                dm.create_vdev(VdevParams {
                    name: name.to_owned(),
                    vdev_size: provision.log_vdev_size,
                    blk_size: provision.blk_size,
                    num_chunks: 1,
                    placement: PlacementPolicy::Striped,
                    tier: DevTier::Fast,
                    alloc_kind: AllocKind::Append,
                    context: Vec::new(),
                })
            };
            let data_log = log_vdev(FamilyKind::Data.vdev_name())?;
            let ctrl_log = log_vdev(FamilyKind::Ctrl.vdev_name())?;
            let user_data = dm.create_vdev(VdevParams {
                name: "user_data".to_owned(),
                vdev_size: provision.data_vdev_size,
                blk_size: provision.blk_size,
                num_chunks: 1,
                placement: PlacementPolicy::Striped,
                tier: DevTier::Data,
                alloc_kind: AllocKind::Bitmap,
                context: Vec::new(),
            })?;
            (data_log, ctrl_log, user_data)
        } else {
            let lookup = |name: &str| {
                dm.get_vdev_by_name(name)
                    .ok_or_else(|| StrataError::NotFound(format!("vdev {name}")))
            };
            (
                lookup(FamilyKind::Data.vdev_name())?,
                lookup(FamilyKind::Ctrl.vdev_name())?,
                lookup("user_data")?,
            )
        };

        let dev_config = LogDevConfig {
            buffer_capacity: provision.blk_size as usize * config.flush_multiple,
            flush_threshold: config.flush_threshold_bytes,
            flush_timer: config.flush_timer,
        };
        log_service.start(first_time_boot, data_log_vdev, ctrl_log_vdev, &dev_config)?;
        data_service.start(first_time_boot, user_data_vdev)?;
        cp_manager.start(first_time_boot)?;
        if let Some(listener) = repl_listener {
            repl_dev.set_listener(listener);
        }
        repl_dev.start(first_time_boot, dm.system_uuid(), &log_service)?;

        cp_manager.register_consumer(
            CpConsumerKind::LogStore,
            Arc::new(LogStoreCpConsumer {
                service: Arc::clone(&log_service),
            }),
        );
        cp_manager.register_consumer(
            CpConsumerKind::BlockData,
            Arc::clone(&data_service) as Arc<dyn CpCallbacks>,
        );
        cp_manager.register_consumer(
            CpConsumerKind::Replication,
            Arc::clone(&repl_dev) as Arc<dyn CpCallbacks>,
        );

        info!(
            target: "strata::engine",
            first_time_boot,
            num_pdevs = dm.pdevs().len(),
            "engine_started"
        );
        Ok(Arc::new(Self {
            dm,
            meta,
            log_service,
            data_service,
            cp_manager,
            repl_dev,
            first_time_boot,
        }))
    }

    #[must_use]
    pub fn device_manager(&self) -> &Arc<DeviceManager> {
        &self.dm
    }

    #[must_use]
    pub fn meta_service(&self) -> &Arc<MetaService> {
        &self.meta
    }

    #[must_use]
    pub fn log_service(&self) -> &Arc<LogStoreService> {
        &self.log_service
    }

    #[must_use]
    pub fn data_service(&self) -> &Arc<DataService> {
        &self.data_service
    }

    #[must_use]
    pub fn cp_manager(&self) -> &Arc<CpManager> {
        &self.cp_manager
    }

    #[must_use]
    pub fn repl_dev(&self) -> &Arc<SoloReplDev> {
        &self.repl_dev
    }

    #[must_use]
    pub fn is_first_time_boot(&self) -> bool {
        self.first_time_boot
    }

    /// Trigger a checkpoint flush; see
    /// [`CpManager::trigger_cp_flush`] for the force semantics.
    pub fn trigger_cp_flush(&self, force: bool) -> CpAwait {
        self.cp_manager.trigger_cp_flush(force)
    }

    /// Final checkpoint, then stop every background worker and close
    /// the devices.
    pub fn shutdown(&self) {
        info!(target: "strata::engine", "engine_shutdown");
        self.cp_manager.shutdown();
        // One synchronous truncation pass so every store's final
        // truncation point reaches the persisted registry.
        let _ = self.log_service.device_truncate(None, true, false);
        self.log_service.stop();
        self.data_service.stop();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("first_time_boot", &self.first_time_boot)
            .field("device_manager", &self.dm)
            .finish()
    }
}
