#![forbid(unsafe_code)]
//! Single-node replicated device.
//!
//! Journals every write through a DATA-family log store. Large values
//! are written out-of-line to the block data service first; the journal
//! entry then carries the serialized block id instead of the bytes.
//! The listener sees `on_pre_commit` when the journal entry is durable
//! and `on_commit` once the referenced blocks are committed, both on
//! the original write path and again during recovery replay.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_cp::{Cp, CpAwait, CpCallbacks, CpContext};
use strata_data::{BlockId, DataService};
use strata_error::{Result, StrataError};
use strata_logstore::{FamilyKind, LogRecord, LogStore, LogStoreService, RecordType};
use strata_meta::MetaService;
use strata_types::{put_le_u16, put_le_u32, put_le_u64, read_le_u32, read_le_u64, Lsn, StoreId};
use tracing::{debug, error, info, warn};

pub const REPL_DEV_META_NAME: &str = "repl_dev";

const RD_SB_VERSION: u16 = 1;
const RD_SB_SIZE: usize = 40;

/// Half-open key range `[start, end)`, byte-lexicographic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && key < self.end.as_slice()
    }
}

/// Callbacks the owner of a replicated device receives for every
/// journaled write, in LSN order, both live and during replay.
pub trait ReplListener: Send + Sync {
    fn on_pre_commit(&self, lsn: Lsn, header: &[u8], key: &[u8]);
    fn on_commit(&self, lsn: Lsn, header: &[u8], key: &[u8], blkid: Option<BlockId>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReplSuperBlk {
    group_id: [u8; 16],
    journal_id: u32,
    commit_lsn: u64,
    checkpoint_lsn: u64,
}

impl ReplSuperBlk {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; RD_SB_SIZE];
        put_le_u16(&mut buf, 0, RD_SB_VERSION);
        put_le_u32(&mut buf, 4, self.journal_id);
        put_le_u64(&mut buf, 8, self.commit_lsn);
        put_le_u64(&mut buf, 16, self.checkpoint_lsn);
        buf[24..40].copy_from_slice(&self.group_id);
        buf
    }

    fn deserialize(blob: &[u8]) -> Result<Self> {
        let bad = |e: strata_types::ParseError| StrataError::DeviceFormat(e.to_string());
        let version = strata_types::read_le_u16(blob, 0).map_err(bad)?;
        if version != RD_SB_VERSION {
            return Err(StrataError::DeviceFormat(format!(
                "repl dev super-block version {version} unsupported"
            )));
        }
        let mut group_id = [0_u8; 16];
        group_id.copy_from_slice(
            strata_types::ensure_slice(blob, 24, 16).map_err(bad)?,
        );
        Ok(Self {
            group_id,
            journal_id: read_le_u32(blob, 4).map_err(bad)?,
            commit_lsn: read_le_u64(blob, 8).map_err(bad)?,
            checkpoint_lsn: read_le_u64(blob, 16).map_err(bad)?,
        })
    }
}

/// A replicated device with a single (local) member.
pub struct SoloReplDev {
    meta: Arc<MetaService>,
    data: Arc<DataService>,
    journal: Mutex<Option<Arc<LogStore>>>,
    listener: Mutex<Option<Arc<dyn ReplListener>>>,
    sb: Mutex<ReplSuperBlk>,
    replayed_sb: Mutex<Option<ReplSuperBlk>>,
    commit_upto: AtomicU64,
}

impl SoloReplDev {
    /// Build the device and register its meta handler. Must run before
    /// the meta service replays.
    pub fn new(meta: &Arc<MetaService>, data: &Arc<DataService>) -> Arc<Self> {
        let dev = Arc::new(Self {
            meta: Arc::clone(meta),
            data: Arc::clone(data),
            journal: Mutex::new(None),
            listener: Mutex::new(None),
            sb: Mutex::new(ReplSuperBlk {
                group_id: [0; 16],
                journal_id: 0,
                commit_lsn: 0,
                checkpoint_lsn: 0,
            }),
            replayed_sb: Mutex::new(None),
            commit_upto: AtomicU64::new(0),
        });
        let replay_dev = Arc::downgrade(&dev);
        meta.register_handler(
            REPL_DEV_META_NAME,
            Box::new(move |blob| {
                let Some(dev) = replay_dev.upgrade() else {
                    return;
                };
                match ReplSuperBlk::deserialize(blob) {
                    Ok(sb) => *dev.replayed_sb.lock() = Some(sb),
                    Err(e) => {
                        error!(target: "strata::repl", error = %e, "repl_super_block_corrupt");
                        panic!("invalid replicated-device meta-block: {e}");
                    }
                }
            }),
        );
        dev
    }

    /// The listener receives commit callbacks; register it before
    /// `start` so recovery replay has somewhere to go.
    pub fn set_listener(&self, listener: Arc<dyn ReplListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Create the data journal (first boot) or reopen it and replay.
    pub fn start(
        self: &Arc<Self>,
        first_time_boot: bool,
        group_id: [u8; 16],
        log_service: &LogStoreService,
    ) -> Result<()> {
        if first_time_boot {
            let journal = log_service.create_new_log_store(FamilyKind::Data, true)?;
            {
                let mut sb = self.sb.lock();
                sb.group_id = group_id;
                sb.journal_id = journal.store_id().0;
                self.meta.write_meta_blk(REPL_DEV_META_NAME, sb.serialize())?;
            }
            *self.journal.lock() = Some(journal);
            info!(target: "strata::repl", "repl_dev_created");
        } else {
            let replayed = self.replayed_sb.lock().take().ok_or_else(|| {
                StrataError::DeviceFormat(
                    "replicated device meta-block missing after replay".to_owned(),
                )
            })?;
            self.commit_upto.store(replayed.commit_lsn, Ordering::Release);
            *self.sb.lock() = replayed;

            let found_dev = Arc::clone(self);
            let journal = log_service.open_log_store(
                FamilyKind::Data,
                StoreId(replayed.journal_id),
                true,
                move |store| {
                    let dev = Arc::clone(&found_dev);
                    store.register_log_found_cb(Box::new(move |lsn, record| {
                        dev.on_log_found(lsn, record);
                    }));
                },
            )?;
            *self.journal.lock() = Some(journal);
            info!(
                target: "strata::repl",
                journal_id = replayed.journal_id,
                commit_lsn = replayed.commit_lsn,
                "repl_dev_opened"
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn journal_id(&self) -> StoreId {
        StoreId(self.sb.lock().journal_id)
    }

    #[must_use]
    pub fn commit_upto(&self) -> Lsn {
        Lsn(self.commit_upto.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn group_id(&self) -> [u8; 16] {
        self.sb.lock().group_id
    }

    fn journal(&self) -> Result<Arc<LogStore>> {
        self.journal
            .lock()
            .clone()
            .ok_or_else(|| StrataError::InvalidArgument("replicated device not started".to_owned()))
    }

    fn listener(&self) -> Result<Arc<dyn ReplListener>> {
        self.listener
            .lock()
            .clone()
            .ok_or_else(|| StrataError::InvalidArgument("no listener registered".to_owned()))
    }

    /// Journal a write. A non-empty value is written out-of-line first;
    /// the journal entry then carries its block id. The listener's
    /// `on_pre_commit`/`on_commit` fire once the entry is durable.
    pub fn async_alloc_write(
        self: &Arc<Self>,
        header: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<()> {
        self.listener()?;
        if value.is_empty() {
            return self.write_journal(header, key, None);
        }

        let blkid = self.data.alloc_blocks(value.len())?;
        let dev = Arc::clone(self);
        self.data.async_write(
            blkid,
            value,
            Box::new(move |res| {
                if let Err(e) = res {
                    // Data-region loss under a journaled write has no
                    // recovery path at this layer.
                    error!(target: "strata::repl", error = %e, "out_of_line_write_failed");
                    panic!("replicated device data write failed: {e}");
                }
                if let Err(e) = dev.write_journal(header, key, Some(blkid)) {
                    error!(target: "strata::repl", error = %e, "journal_append_failed");
                }
            }),
        );
        Ok(())
    }

    fn write_journal(self: &Arc<Self>, header: Vec<u8>, key: Vec<u8>, blkid: Option<BlockId>) -> Result<()> {
        let journal = self.journal()?;
        let payload = blkid.map(|b| b.serialize()).unwrap_or_default();
        let record = LogRecord::large_data(header.clone(), key.clone(), payload);
        let dev = Arc::clone(self);
        journal.append(
            record,
            Box::new(move |res| {
                let lsn = match res {
                    Ok(lsn) => lsn,
                    Err(e) => {
                        error!(target: "strata::repl", error = %e, "journal_flush_failed");
                        panic!("replicated device journal write failed: {e}");
                    }
                };
                dev.complete_commit(lsn, &header, &key, blkid);
            }),
        )?;
        Ok(())
    }

    fn complete_commit(&self, lsn: Lsn, header: &[u8], key: &[u8], blkid: Option<BlockId>) {
        let listener = match self.listener() {
            Ok(l) => l,
            Err(_) => return,
        };
        listener.on_pre_commit(lsn, header, key);
        self.advance_commit(lsn);
        if let Some(blkid) = blkid {
            self.data.commit_blocks(blkid);
        }
        listener.on_commit(lsn, header, key, blkid);
    }

    fn advance_commit(&self, lsn: Lsn) {
        let mut cur = self.commit_upto.load(Ordering::Acquire);
        while cur < lsn.0 {
            match self.commit_upto.compare_exchange(
                cur,
                lsn.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Replay one recovered journal entry to the listener.
    fn on_log_found(&self, lsn: Lsn, record: &LogRecord) {
        if record.rtype != RecordType::LargeData {
            warn!(
                target: "strata::repl",
                lsn = lsn.0,
                "unexpected_record_type_in_data_journal"
            );
            return;
        }
        let blkid = if record.payload.is_empty() {
            None
        } else {
            match BlockId::deserialize(&record.payload) {
                Ok(b) => Some(b),
                Err(e) => {
                    warn!(
                        target: "strata::repl",
                        lsn = lsn.0,
                        error = %e,
                        "journal_entry_blkid_corrupt"
                    );
                    return;
                }
            }
        };
        debug!(
            target: "strata::repl",
            lsn = lsn.0,
            has_blkid = blkid.is_some(),
            "journal_entry_replayed"
        );
        self.complete_commit(lsn, &record.user_header, &record.key, blkid);
    }

    /// Read an out-of-line value back by its block id.
    pub fn read(&self, blkid: BlockId) -> Result<Vec<u8>> {
        self.data.read(blkid)
    }

    /// Release the blocks of a superseded value.
    pub fn free_blocks(&self, blkid: BlockId) {
        self.data.free_blocks(blkid);
    }
}

impl CpCallbacks for SoloReplDev {
    fn on_switchover_cp(&self, _cur_cp: Option<&Cp>, _new_cp: &Cp) -> Option<CpContext> {
        None
    }

    fn cp_flush(&self, cp: &Arc<Cp>) -> CpAwait {
        let lsn = self.commit_upto.load(Ordering::Acquire);
        let blob = {
            let mut sb = self.sb.lock();
            sb.commit_lsn = lsn;
            sb.checkpoint_lsn = lsn;
            sb.serialize()
        };
        match self.meta.write_meta_blk(REPL_DEV_META_NAME, blob) {
            Ok(()) => {
                debug!(
                    target: "strata::repl",
                    cp_id = cp.id().0,
                    checkpoint_lsn = lsn,
                    "repl_frontier_persisted"
                );
                CpAwait::ready(true)
            }
            Err(e) => {
                error!(
                    target: "strata::repl",
                    cp_id = cp.id().0,
                    error = %e,
                    "repl_frontier_persist_failed"
                );
                CpAwait::ready(false)
            }
        }
    }

    fn cp_cleanup(&self, _cp: &Cp) {
        let checkpoint_lsn = Lsn(self.sb.lock().checkpoint_lsn);
        if let Ok(journal) = self.journal() {
            journal.truncate(checkpoint_lsn);
        }
    }

    fn cp_progress_percent(&self) -> u32 {
        100
    }
}

impl std::fmt::Debug for SoloReplDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sb = self.sb.lock();
        f.debug_struct("SoloReplDev")
            .field("journal_id", &sb.journal_id)
            .field("commit_lsn", &sb.commit_lsn)
            .field("checkpoint_lsn", &sb.checkpoint_lsn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn super_block_roundtrip() {
        let sb = ReplSuperBlk {
            group_id: [9; 16],
            journal_id: 4,
            commit_lsn: 77,
            checkpoint_lsn: 70,
        };
        let blob = sb.serialize();
        assert_eq!(blob.len(), RD_SB_SIZE);
        assert_eq!(ReplSuperBlk::deserialize(&blob).unwrap(), sb);
    }

    #[test]
    fn super_block_bad_version_rejected() {
        let sb = ReplSuperBlk {
            group_id: [0; 16],
            journal_id: 1,
            commit_lsn: 0,
            checkpoint_lsn: 0,
        };
        let mut blob = sb.serialize();
        blob[0] = 0xFF;
        assert!(ReplSuperBlk::deserialize(&blob).is_err());
    }

    #[test]
    fn key_range_is_half_open() {
        let range = KeyRange {
            start: b"b".to_vec(),
            end: b"d".to_vec(),
        };
        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c"));
        assert!(range.contains(b"cz"));
        assert!(!range.contains(b"d"));
    }
}
