#![forbid(unsafe_code)]
//! Log store service: crash-safe append-only logs multiplexed over
//! virtual devices.
//!
//! Two families (DATA and CTRL) each own one log device and host many
//! logical stores. Appends are asynchronous with exactly-once durable
//! completion callbacks; truncation and registry persistence run on a
//! dedicated worker thread, the only place this crate does blocking
//! meta-region I/O.

pub mod family;
pub mod log_dev;
pub mod records;
pub mod store;

pub use family::{FamilyKind, LogStoreFamily};
pub use log_dev::{FlushStatsSnapshot, LogDev, LogDevConfig, RecoveryReport};
pub use records::{EnvelopedRecord, LogRecord, RecordType};
pub use store::{LogFoundCb, LogStore, StoreAppendCb};

use parking_lot::{Condvar, Mutex};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use strata_device::VirtualDev;
use strata_error::{Result, StrataError};
use strata_meta::MetaService;
use strata_types::{Lsn, StoreId};
use tracing::{debug, info};

/// Per-family notification from [`LogStoreService::device_truncate`]:
/// the family and its post-truncation first-needed LSN.
pub type DeviceTruncateCb = Box<dyn Fn(FamilyKind, Option<Lsn>) + Send + Sync>;

struct TruncateReq {
    cb: Option<DeviceTruncateCb>,
    dry_run: bool,
    done: Option<Arc<(Mutex<bool>, Condvar)>>,
}

/// Front door for both log store families.
pub struct LogStoreService {
    families: Vec<Arc<LogStoreFamily>>,
    trunc_tx: Mutex<Option<mpsc::Sender<TruncateReq>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogStoreService {
    /// Create the families and register their meta-blob handlers. Must
    /// run before the meta service replays.
    pub fn new(meta: &Arc<MetaService>) -> Arc<Self> {
        let families = vec![
            LogStoreFamily::new(FamilyKind::Data, Arc::clone(meta)),
            LogStoreFamily::new(FamilyKind::Ctrl, Arc::clone(meta)),
        ];
        for family in &families {
            let handler_family = Arc::clone(family);
            meta.register_handler(
                family.kind().meta_name(),
                Box::new(move |blob| handler_family.on_meta_blob(blob)),
            );
        }
        Arc::new(Self {
            families,
            trunc_tx: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Start both families over their vdevs and spawn the truncation
    /// worker (the blocking-I/O thread for this service).
    pub fn start(
        self: &Arc<Self>,
        format: bool,
        data_vdev: Arc<VirtualDev>,
        ctrl_vdev: Arc<VirtualDev>,
        dev_config: &LogDevConfig,
    ) -> Result<()> {
        self.family(FamilyKind::Data)
            .start(format, data_vdev, dev_config.clone())?;
        self.family(FamilyKind::Ctrl)
            .start(format, ctrl_vdev, dev_config.clone())?;

        let (tx, rx) = mpsc::channel::<TruncateReq>();
        let families = self.families.clone();
        let handle = std::thread::Builder::new()
            .name("strata-log-truncater".to_owned())
            .spawn(move || {
                while let Ok(req) = rx.recv() {
                    for family in &families {
                        match family.device_truncate(req.dry_run) {
                            Ok(first_needed) => {
                                if let Some(cb) = &req.cb {
                                    cb(family.kind(), first_needed);
                                }
                            }
                            Err(e) => {
                                tracing::error!(
                                    target: "strata::logstore",
                                    family = family.kind().meta_name(),
                                    error = %e,
                                    "device_truncate_failed"
                                );
                            }
                        }
                    }
                    if let Some(done) = &req.done {
                        let (flag, cv) = &**done;
                        *flag.lock() = true;
                        cv.notify_all();
                    }
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn truncation thread: {e}"));
        *self.trunc_tx.lock() = Some(tx);
        *self.worker.lock() = Some(handle);
        info!(target: "strata::logstore", format, "log_store_service_started");
        Ok(())
    }

    /// Stop the truncation worker and both families, draining pending
    /// appends.
    pub fn stop(&self) {
        self.trunc_tx.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        for family in &self.families {
            family.stop();
        }
        info!(target: "strata::logstore", "log_store_service_stopped");
    }

    #[must_use]
    pub fn family(&self, kind: FamilyKind) -> &Arc<LogStoreFamily> {
        match kind {
            FamilyKind::Data => &self.families[0],
            FamilyKind::Ctrl => &self.families[1],
        }
    }

    pub fn create_new_log_store(&self, kind: FamilyKind, append_mode: bool) -> Result<Arc<LogStore>> {
        self.family(kind).create_new_log_store(append_mode)
    }

    pub fn open_log_store(
        &self,
        kind: FamilyKind,
        store_id: StoreId,
        append_mode: bool,
        on_open_cb: impl FnOnce(Arc<LogStore>),
    ) -> Result<Arc<LogStore>> {
        self.family(kind).open_log_store(store_id, append_mode, on_open_cb)
    }

    pub fn remove_log_store(&self, kind: FamilyKind, store_id: StoreId) -> Result<()> {
        self.family(kind).remove_log_store(store_id)
    }

    /// Flush both families' devices; every record appended before the
    /// call is durable when it returns.
    pub fn flush_sync(&self) -> Result<()> {
        for family in &self.families {
            family.flush_sync()?;
        }
        Ok(())
    }

    /// Submit a truncation pass over every family to the truncation
    /// worker. `cb` fires per family with its post-truncation
    /// first-needed LSN; `wait_till_done` suspends the caller until the
    /// pass completes; `dry_run` computes without applying.
    pub fn device_truncate(
        &self,
        cb: Option<DeviceTruncateCb>,
        wait_till_done: bool,
        dry_run: bool,
    ) -> Result<()> {
        let done = wait_till_done.then(|| Arc::new((Mutex::new(false), Condvar::new())));
        let req = TruncateReq {
            cb,
            dry_run,
            done: done.clone(),
        };
        self.trunc_tx
            .lock()
            .as_ref()
            .ok_or_else(|| {
                StrataError::InvalidArgument("log store service not started".to_owned())
            })?
            .send(req)
            .map_err(|_| {
                StrataError::InvalidArgument("truncation worker has shut down".to_owned())
            })?;

        if let Some(done) = done {
            let (flag, cv) = &*done;
            let mut guard = flag.lock();
            while !*guard {
                cv.wait(&mut guard);
            }
            debug!(target: "strata::logstore", dry_run, "device_truncate_complete");
        }
        Ok(())
    }
}

impl std::fmt::Debug for LogStoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStoreService")
            .field("families", &self.families)
            .finish()
    }
}
