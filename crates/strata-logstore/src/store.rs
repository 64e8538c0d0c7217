//! A log store: one logical stream multiplexed over a family's log
//! device, with its own LSN space and truncation point.

use crate::log_dev::LogDev;
use crate::records::{encode_record, LogRecord};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use strata_error::{Result, StrataError};
use strata_types::{Lsn, StoreId};
use tracing::{debug, trace};

/// Completion callback for a store append; receives the record's LSN
/// once it is durable, or the flush failure.
pub type StoreAppendCb = Box<dyn FnOnce(Result<Lsn>) + Send>;

/// Replay callback registered by the store's owner; invoked in LSN
/// order for every recovered record.
pub type LogFoundCb = Box<dyn Fn(Lsn, &LogRecord) + Send + Sync>;

struct StoreState {
    /// Next LSN to hand out. LSNs start at 1.
    next_lsn: u64,
    /// Records with LSN <= this are reclaimable.
    truncation_point: u64,
    records: BTreeMap<u64, LogRecord>,
    log_found_cb: Option<LogFoundCb>,
    /// Recovered records awaiting replay to the owner.
    pending_replay: Vec<(Lsn, LogRecord)>,
}

pub struct LogStore {
    store_id: StoreId,
    append_mode: bool,
    dev: Arc<LogDev>,
    state: Mutex<StoreState>,
}

impl LogStore {
    pub(crate) fn new(
        store_id: StoreId,
        append_mode: bool,
        dev: Arc<LogDev>,
        truncation_point: Lsn,
        recovered: Vec<(Lsn, LogRecord)>,
    ) -> Arc<Self> {
        let next_lsn = recovered
            .iter()
            .map(|(lsn, _)| lsn.0)
            .max()
            .unwrap_or(truncation_point.0)
            .max(truncation_point.0)
            + 1;
        let mut records = BTreeMap::new();
        for (lsn, rec) in &recovered {
            if lsn.0 > truncation_point.0 {
                records.insert(lsn.0, rec.clone());
            }
        }
        debug!(
            target: "strata::logstore::store",
            store_id = store_id.0,
            next_lsn,
            truncation_point = truncation_point.0,
            recovered = recovered.len(),
            "log_store_opened"
        );
        Arc::new(Self {
            store_id,
            append_mode,
            dev,
            state: Mutex::new(StoreState {
                next_lsn,
                truncation_point: truncation_point.0,
                records,
                log_found_cb: None,
                pending_replay: recovered,
            }),
        })
    }

    #[must_use]
    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    #[must_use]
    pub fn append_mode(&self) -> bool {
        self.append_mode
    }

    /// Highest LSN handed out so far; 0 before the first append.
    #[must_use]
    pub fn tail_lsn(&self) -> Lsn {
        Lsn(self.state.lock().next_lsn - 1)
    }

    /// Records with LSN <= this point are reclaimable.
    #[must_use]
    pub fn truncation_point(&self) -> Lsn {
        Lsn(self.state.lock().truncation_point)
    }

    /// First LSN this store still needs on the device.
    #[must_use]
    pub fn first_needed_lsn(&self) -> Lsn {
        Lsn(self.state.lock().truncation_point + 1)
    }

    /// Enqueue a record; returns immediately. `cb(lsn)` fires exactly
    /// once after the record is durable. Successive appends get strictly
    /// increasing LSNs and their callbacks fire in LSN order.
    ///
    /// `cb` runs on the flush path: it must not block on further
    /// appends to the same family.
    pub fn append(&self, record: LogRecord, cb: StoreAppendCb) -> Result<Lsn> {
        // The store lock is held across the device enqueue so the
        // device's ordering matches LSN assignment order.
        let mut state = self.state.lock();
        let lsn = Lsn(state.next_lsn);
        let encoded = encode_record(self.store_id, lsn, &record);
        trace!(
            target: "strata::logstore::store",
            store_id = self.store_id.0,
            lsn = lsn.0,
            bytes = encoded.len(),
            "store_append"
        );
        self.dev.append(
            encoded,
            self.store_id,
            lsn,
            Box::new(move |res| cb(res.map(|()| lsn))),
        )?;
        state.next_lsn += 1;
        state.records.insert(lsn.0, record);
        Ok(lsn)
    }

    /// Append and suspend the caller until the record is durable.
    pub fn append_sync(&self, record: LogRecord) -> Result<Lsn> {
        let (tx, rx) = mpsc::channel();
        self.append(
            record,
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        )?;
        rx.recv()
            .map_err(|_| StrataError::InvalidArgument("log device dropped the append".to_owned()))?
    }

    /// Read a record back by LSN. Truncated or never-written LSNs are
    /// not found.
    pub fn read(&self, lsn: Lsn) -> Result<LogRecord> {
        let state = self.state.lock();
        if lsn.0 <= state.truncation_point {
            return Err(StrataError::NotFound(format!(
                "store {} lsn {} is truncated",
                self.store_id, lsn
            )));
        }
        state.records.get(&lsn.0).cloned().ok_or_else(|| {
            StrataError::NotFound(format!("store {} lsn {}", self.store_id, lsn))
        })
    }

    /// Mark all records with LSN <= `upto` reclaimable. Idempotent and
    /// monotonic: truncating below the current point is a no-op.
    pub fn truncate(&self, upto: Lsn) {
        let mut state = self.state.lock();
        if upto.0 <= state.truncation_point {
            return;
        }
        state.truncation_point = upto.0;
        let keep = state.records.split_off(&(upto.0 + 1));
        let dropped = state.records.len();
        state.records = keep;
        debug!(
            target: "strata::logstore::store",
            store_id = self.store_id.0,
            upto = upto.0,
            dropped,
            "store_truncated"
        );
    }

    /// Register the replay callback. Recovered records are delivered
    /// through it when the family finishes opening this store.
    pub fn register_log_found_cb(&self, cb: LogFoundCb) {
        self.state.lock().log_found_cb = Some(cb);
    }

    /// Deliver recovered records to the registered callback, in LSN
    /// order, skipping anything at or below the truncation point.
    pub(crate) fn replay_found(&self) {
        let (replay, cb, truncation_point) = {
            let mut state = self.state.lock();
            let replay = std::mem::take(&mut state.pending_replay);
            (replay, state.log_found_cb.take(), state.truncation_point)
        };
        if let Some(cb) = cb {
            let mut replay: Vec<_> = replay
                .into_iter()
                .filter(|(lsn, _)| lsn.0 > truncation_point)
                .collect();
            replay.sort_by_key(|(lsn, _)| lsn.0);
            for (lsn, record) in &replay {
                cb(*lsn, record);
            }
            self.state.lock().log_found_cb = Some(cb);
        }
    }
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LogStore")
            .field("store_id", &self.store_id.0)
            .field("next_lsn", &state.next_lsn)
            .field("truncation_point", &state.truncation_point)
            .field("live_records", &state.records.len())
            .finish()
    }
}
