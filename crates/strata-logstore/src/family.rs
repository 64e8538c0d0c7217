//! A log store family: many logical stores sharing one log device.
//!
//! Each family persists a registry blob in the meta service under its
//! stable handler name: the device reclamation frontier plus, per
//! store, its id and truncation point. Recovery demultiplexes the log
//! device's records by the store id carried in each record envelope and
//! stashes them until the owner opens the store.

use crate::log_dev::{LogDev, LogDevConfig, RecoveryReport};
use crate::records::LogRecord;
use crate::store::LogStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use strata_device::VirtualDev;
use strata_error::{Result, StrataError};
use strata_meta::MetaService;
use strata_types::{put_le_u16, put_le_u32, put_le_u64, read_le_u16, read_le_u32, read_le_u64, Lsn, StoreId};
use tracing::{debug, info, warn};

const REGISTRY_VERSION: u16 = 1;
const REGISTRY_HEADER_SIZE: usize = 16;
const REGISTRY_ENTRY_SIZE: usize = 12;

/// The two fixed families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FamilyKind {
    Data,
    Ctrl,
}

impl FamilyKind {
    /// Stable meta-block handler name.
    #[must_use]
    pub fn meta_name(self) -> &'static str {
        match self {
            Self::Data => "data_log",
            Self::Ctrl => "ctrl_log",
        }
    }

    /// Name of the vdev backing this family's log device.
    #[must_use]
    pub fn vdev_name(self) -> &'static str {
        match self {
            Self::Data => "data_logdev",
            Self::Ctrl => "ctrl_logdev",
        }
    }
}

#[derive(Default)]
struct FamilyState {
    next_store_id: u32,
    stores: HashMap<u32, Arc<LogStore>>,
    /// Persisted per-store truncation points, including stores that are
    /// registered but not currently open.
    registry: HashMap<u32, Lsn>,
    start_offset: u64,
    /// Records recovered for stores not opened yet.
    recovered: HashMap<u32, Vec<(Lsn, LogRecord)>>,
}

pub struct LogStoreFamily {
    kind: FamilyKind,
    meta: Arc<MetaService>,
    dev: Mutex<Option<Arc<LogDev>>>,
    state: Mutex<FamilyState>,
}

impl LogStoreFamily {
    #[must_use]
    pub fn new(kind: FamilyKind, meta: Arc<MetaService>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            meta,
            dev: Mutex::new(None),
            state: Mutex::new(FamilyState::default()),
        })
    }

    #[must_use]
    pub fn kind(&self) -> FamilyKind {
        self.kind
    }

    /// Replay handler for the family's meta blob. Runs on boot before
    /// the family starts I/O.
    pub fn on_meta_blob(&self, blob: &[u8]) {
        match Self::parse_registry(blob) {
            Ok((start_offset, registry)) => {
                let mut state = self.state.lock();
                state.next_store_id = registry.keys().max().map_or(0, |id| id + 1);
                state.start_offset = start_offset;
                state.registry = registry;
                debug!(
                    target: "strata::logstore::family",
                    family = self.kind.meta_name(),
                    stores = state.registry.len(),
                    start_offset,
                    "family_registry_loaded"
                );
            }
            Err(e) => {
                // A torn registry is a format-level problem; the log
                // device itself is still scanned from offset zero.
                warn!(
                    target: "strata::logstore::family",
                    family = self.kind.meta_name(),
                    error = %e,
                    "family_registry_blob_corrupt"
                );
            }
        }
    }

    fn parse_registry(blob: &[u8]) -> Result<(u64, HashMap<u32, Lsn>)> {
        let bad = |e: strata_types::ParseError| StrataError::DeviceFormat(e.to_string());
        let version = read_le_u16(blob, 0).map_err(bad)?;
        if version != REGISTRY_VERSION {
            return Err(StrataError::DeviceFormat(format!(
                "log family registry version {version} unsupported"
            )));
        }
        let num_stores = read_le_u32(blob, 4).map_err(bad)? as usize;
        let start_offset = read_le_u64(blob, 8).map_err(bad)?;
        let mut registry = HashMap::with_capacity(num_stores);
        let mut cursor = REGISTRY_HEADER_SIZE;
        for _ in 0..num_stores {
            let id = read_le_u32(blob, cursor).map_err(bad)?;
            let tp = read_le_u64(blob, cursor + 4).map_err(bad)?;
            registry.insert(id, Lsn(tp));
            cursor += REGISTRY_ENTRY_SIZE;
        }
        Ok((start_offset, registry))
    }

    fn persist_registry_locked(&self, state: &FamilyState) -> Result<()> {
        let mut blob =
            vec![0_u8; REGISTRY_HEADER_SIZE + state.registry.len() * REGISTRY_ENTRY_SIZE];
        put_le_u16(&mut blob, 0, REGISTRY_VERSION);
        put_le_u32(&mut blob, 4, state.registry.len() as u32);
        put_le_u64(&mut blob, 8, state.start_offset);
        let mut cursor = REGISTRY_HEADER_SIZE;
        let mut entries: Vec<_> = state.registry.iter().collect();
        entries.sort_by_key(|(id, _)| **id);
        for (id, tp) in entries {
            put_le_u32(&mut blob, cursor, *id);
            put_le_u64(&mut blob, cursor + 4, tp.0);
            cursor += REGISTRY_ENTRY_SIZE;
        }
        self.meta.write_meta_blk(self.kind.meta_name(), blob)
    }

    /// Bring the family online over its vdev. On format the device is
    /// initialized clean; otherwise the log is recovered and records
    /// are stashed per store for replay at open.
    pub fn start(
        &self,
        format: bool,
        vdev: Arc<VirtualDev>,
        dev_config: LogDevConfig,
    ) -> Result<Option<RecoveryReport>> {
        let dev = LogDev::new(vdev, dev_config)?;

        let report = if format {
            dev.initialize()?;
            let state = self.state.lock();
            self.persist_registry_locked(&state)?;
            None
        } else {
            let start_offset = self.state.lock().start_offset;
            let mut stash: HashMap<u32, Vec<(Lsn, LogRecord)>> = HashMap::new();
            let report = dev.recover(start_offset, |env| {
                stash
                    .entry(env.store_id.0)
                    .or_default()
                    .push((env.lsn, env.record));
            })?;
            let mut state = self.state.lock();
            for (store_id, records) in &stash {
                if !state.registry.contains_key(store_id) {
                    warn!(
                        target: "strata::logstore::family",
                        family = self.kind.meta_name(),
                        store_id,
                        records = records.len(),
                        "recovered_records_for_unregistered_store"
                    );
                }
            }
            state.recovered = stash;
            Some(report)
        };

        dev.start();
        *self.dev.lock() = Some(dev);
        info!(
            target: "strata::logstore::family",
            family = self.kind.meta_name(),
            format,
            "family_started"
        );
        Ok(report)
    }

    /// Drain pending appends and stop the log device.
    pub fn stop(&self) {
        if let Some(dev) = self.dev.lock().take() {
            dev.flush_sync();
            dev.stop();
        }
    }

    fn device(&self) -> Result<Arc<LogDev>> {
        self.dev
            .lock()
            .clone()
            .ok_or_else(|| StrataError::InvalidArgument("log family not started".to_owned()))
    }

    /// Block until every record appended so far is durable.
    pub fn flush_sync(&self) -> Result<()> {
        self.device()?.flush_sync();
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> Option<crate::log_dev::FlushStatsSnapshot> {
        self.dev.lock().as_ref().map(|d| d.stats())
    }

    /// Allocate a fresh store id and return the store handle.
    pub fn create_new_log_store(&self, append_mode: bool) -> Result<Arc<LogStore>> {
        let dev = self.device()?;
        let mut state = self.state.lock();
        let id = state.next_store_id;
        state.next_store_id += 1;
        state.registry.insert(id, Lsn(0));
        self.persist_registry_locked(&state)?;

        let store = LogStore::new(StoreId(id), append_mode, dev, Lsn(0), Vec::new());
        state.stores.insert(id, Arc::clone(&store));
        info!(
            target: "strata::logstore::family",
            family = self.kind.meta_name(),
            store_id = id,
            "log_store_created"
        );
        Ok(store)
    }

    /// Reopen an existing store. `on_open_cb` fires once the store has
    /// been populated from the recovered log device; recovered records
    /// are then replayed through the store's log-found callback.
    pub fn open_log_store(
        &self,
        store_id: StoreId,
        append_mode: bool,
        on_open_cb: impl FnOnce(Arc<LogStore>),
    ) -> Result<Arc<LogStore>> {
        let dev = self.device()?;
        let store = {
            let mut state = self.state.lock();
            let Some(truncation_point) = state.registry.get(&store_id.0).copied() else {
                return Err(StrataError::InvalidArgument(format!(
                    "unknown log store id {store_id} in family {}",
                    self.kind.meta_name()
                )));
            };
            let recovered = state.recovered.remove(&store_id.0).unwrap_or_default();
            let store = LogStore::new(store_id, append_mode, dev, truncation_point, recovered);
            state.stores.insert(store_id.0, Arc::clone(&store));
            store
        };

        on_open_cb(Arc::clone(&store));
        store.replay_found();
        Ok(store)
    }

    /// Delete a store; its records become reclaimable at the next
    /// truncation.
    pub fn remove_log_store(&self, store_id: StoreId) -> Result<()> {
        let mut state = self.state.lock();
        if state.registry.remove(&store_id.0).is_none() {
            return Err(StrataError::InvalidArgument(format!(
                "unknown log store id {store_id} in family {}",
                self.kind.meta_name()
            )));
        }
        state.stores.remove(&store_id.0);
        state.recovered.remove(&store_id.0);
        self.persist_registry_locked(&state)?;
        info!(
            target: "strata::logstore::family",
            family = self.kind.meta_name(),
            store_id = store_id.0,
            "log_store_removed"
        );
        Ok(())
    }

    #[must_use]
    pub fn get_store(&self, store_id: StoreId) -> Option<Arc<LogStore>> {
        self.state.lock().stores.get(&store_id.0).cloned()
    }

    /// The family truncation point: the smallest first-needed LSN over
    /// all live stores, or `None` when the family has no stores.
    #[must_use]
    pub fn min_first_needed(&self) -> Option<Lsn> {
        let state = self.state.lock();
        state
            .stores
            .values()
            .map(|s| s.first_needed_lsn())
            .min()
            .or_else(|| state.registry.values().map(|tp| Lsn(tp.0 + 1)).min())
    }

    /// Advance the device reclamation frontier past every flush group
    /// whose records are reclaimable by their stores, then persist the
    /// registry. Runs blocking I/O; only the truncation worker calls it.
    pub fn device_truncate(&self, dry_run: bool) -> Result<Option<Lsn>> {
        let dev = self.device()?;
        let points: HashMap<u32, u64> = {
            let mut state = self.state.lock();
            // Refresh the persisted registry from the live stores.
            let live: Vec<(u32, Lsn)> = state
                .stores
                .iter()
                .map(|(id, s)| (*id, s.truncation_point()))
                .collect();
            for (id, tp) in live {
                state.registry.insert(id, tp);
            }
            state.registry.iter().map(|(id, tp)| (*id, tp.0)).collect()
        };

        let new_start = dev.truncate(
            |store, lsn| match points.get(&store.0) {
                Some(tp) => lsn.0 <= *tp,
                // Removed store: all of its records are reclaimable.
                None => true,
            },
            dry_run,
        );

        if !dry_run {
            let mut state = self.state.lock();
            state.start_offset = new_start;
            self.persist_registry_locked(&state)?;
        }

        Ok(self.min_first_needed())
    }
}

impl std::fmt::Debug for LogStoreFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LogStoreFamily")
            .field("kind", &self.kind)
            .field("stores", &state.stores.len())
            .field("registered", &state.registry.len())
            .field("start_offset", &state.start_offset)
            .finish()
    }
}
