//! Append-only log device over a virtual device.
//!
//! Owns a rolling write buffer of one flush unit (vdev block size times
//! a batch factor). Appends enqueue into the buffer and return; a
//! dedicated flusher thread groups buffered records and writes them as
//! checksummed flush groups, fsyncing before completion callbacks fire.
//! Callbacks are invoked in enqueue order, so per-store LSN order equals
//! callback order. A saturated buffer blocks the appender until the
//! in-flight flush drains.
//!
//! Flush group framing on the device:
//!
//! ```text
//! [magic: u32][records_len: u32][num_records: u32][crc32c: u32]
//! [records ...] [zero padding to the vdev block size]
//! ```

use crate::records::{decode_record, DecodeOutcome, EnvelopedRecord};
use parking_lot::{Condvar, Mutex};
use strata_device::AlignedBuf;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use strata_device::VirtualDev;
use strata_error::{Result, StrataError};
use strata_types::{put_le_u32, read_le_u32, round_up, Lsn, StoreId};
use tracing::{debug, error, info, warn};

const GROUP_MAGIC: u32 = u32::from_le_bytes(*b"SGRP");
const GROUP_HEADER_SIZE: usize = 16;

/// Completion callback for one appended record. The error slot carries
/// the flush failure, if any.
pub type AppendCb = Box<dyn FnOnce(Result<()>) + Send>;

/// Log device tunables, derived from the engine config by the service.
#[derive(Debug, Clone)]
pub struct LogDevConfig {
    /// Rolling buffer capacity == one flush unit.
    pub buffer_capacity: usize,
    /// Accumulated-byte mark that triggers an early flush.
    pub flush_threshold: usize,
    /// Periodic flush timer.
    pub flush_timer: Duration,
}

/// Counters surfaced for observability.
#[derive(Debug, Default)]
pub struct FlushStats {
    flush_by_size: AtomicU64,
    flush_by_timer: AtomicU64,
    back_to_back_flushes: AtomicU64,
    records_flushed: AtomicU64,
    bytes_flushed: AtomicU64,
}

/// Frozen snapshot of [`FlushStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushStatsSnapshot {
    pub flush_by_size: u64,
    pub flush_by_timer: u64,
    pub back_to_back_flushes: u64,
    pub records_flushed: u64,
    pub bytes_flushed: u64,
}

/// One durable flush group's bookkeeping, kept for truncation.
#[derive(Debug, Clone)]
pub struct GroupMeta {
    pub offset: u64,
    pub padded_len: u64,
    pub records: Vec<(StoreId, Lsn)>,
}

struct PendingRecord {
    store_id: StoreId,
    lsn: Lsn,
    cb: AppendCb,
}

struct DevState {
    buffer: Vec<u8>,
    pending: Vec<PendingRecord>,
    /// Where the next flush group lands. Block aligned.
    write_offset: u64,
    /// Recovery scan frontier; groups before it are reclaimed.
    start_offset: u64,
    groups: VecDeque<GroupMeta>,
    flush_in_progress: bool,
    /// Records arrived while the previous flush was in flight; flush
    /// again immediately instead of waiting for threshold or timer.
    back_to_back_pending: bool,
    /// A waiter asked for an immediate flush regardless of threshold.
    flush_requested: bool,
    stop: bool,
}

/// Result of a recovery scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub groups_scanned: u64,
    pub records_replayed: u64,
    pub tail_offset: u64,
    /// True when the scan stopped on a corrupt or torn tail.
    pub corrupt_tail: bool,
}

pub struct LogDev {
    vdev: Arc<VirtualDev>,
    config: LogDevConfig,
    state: Mutex<DevState>,
    /// Signals the flusher that work (or shutdown) is pending.
    flush_nudge: Condvar,
    /// Signals appenders and sync-waiters that a flush drained.
    flush_done: Condvar,
    stats: FlushStats,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl LogDev {
    pub fn new(vdev: Arc<VirtualDev>, config: LogDevConfig) -> Result<Arc<Self>> {
        let blk_size = vdev.blk_size() as usize;
        if config.buffer_capacity == 0 || config.buffer_capacity % blk_size != 0 {
            return Err(StrataError::InvalidArgument(format!(
                "log buffer capacity {} must be a non-zero multiple of blk_size {blk_size}",
                config.buffer_capacity
            )));
        }
        if config.flush_threshold == 0 || config.flush_threshold > config.buffer_capacity {
            return Err(StrataError::InvalidArgument(
                "flush threshold must be in (0, buffer_capacity]".to_owned(),
            ));
        }

        Ok(Arc::new(Self {
            vdev,
            config,
            state: Mutex::new(DevState {
                buffer: Vec::new(),
                pending: Vec::new(),
                write_offset: 0,
                start_offset: 0,
                groups: VecDeque::new(),
                flush_in_progress: false,
                back_to_back_pending: false,
                flush_requested: false,
                stop: false,
            }),
            flush_nudge: Condvar::new(),
            flush_done: Condvar::new(),
            stats: FlushStats::default(),
            flusher: Mutex::new(None),
        }))
    }

    #[must_use]
    pub fn stats(&self) -> FlushStatsSnapshot {
        FlushStatsSnapshot {
            flush_by_size: self.stats.flush_by_size.load(Ordering::Relaxed),
            flush_by_timer: self.stats.flush_by_timer.load(Ordering::Relaxed),
            back_to_back_flushes: self.stats.back_to_back_flushes.load(Ordering::Relaxed),
            records_flushed: self.stats.records_flushed.load(Ordering::Relaxed),
            bytes_flushed: self.stats.bytes_flushed.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.state.lock().start_offset
    }

    #[must_use]
    pub fn tail_offset(&self) -> u64 {
        self.state.lock().write_offset
    }

    /// Start the background flusher.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("strata-log-flusher".to_owned())
            .spawn(move || this.flusher_loop())
            .unwrap_or_else(|e| panic!("failed to spawn log flusher thread: {e}"));
        *self.flusher.lock() = Some(handle);
        info!(
            target: "strata::logstore::dev",
            vdev = %self.vdev.name(),
            buffer_capacity = self.config.buffer_capacity,
            flush_threshold = self.config.flush_threshold,
            "log_dev_started"
        );
    }

    /// Drain the buffer and stop the flusher.
    pub fn stop(&self) {
        {
            let mut st = self.state.lock();
            st.stop = true;
        }
        self.flush_nudge.notify_all();
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
        info!(
            target: "strata::logstore::dev",
            vdev = %self.vdev.name(),
            "log_dev_stopped"
        );
    }

    /// Enqueue an encoded record. `cb` fires exactly once after the
    /// record's flush group is durable, in enqueue order.
    ///
    /// Blocks the calling thread only when the rolling buffer is
    /// saturated, until the in-flight flush completes.
    pub fn append(&self, encoded: Vec<u8>, store_id: StoreId, lsn: Lsn, cb: AppendCb) -> Result<()> {
        let max_record = self.config.buffer_capacity - GROUP_HEADER_SIZE;
        if encoded.len() > max_record {
            return Err(StrataError::InvalidArgument(format!(
                "record of {} bytes exceeds the flush unit ({max_record})",
                encoded.len()
            )));
        }

        let mut st = self.state.lock();
        if st.stop {
            return Err(StrataError::InvalidArgument(
                "append on a stopped log device".to_owned(),
            ));
        }

        // Back-pressure: a full buffer parks the appender until the
        // flusher drains it.
        while st.buffer.len() + encoded.len() > max_record {
            st.flush_requested = true;
            self.flush_nudge.notify_all();
            self.flush_done.wait(&mut st);
            if st.stop {
                return Err(StrataError::InvalidArgument(
                    "append on a stopped log device".to_owned(),
                ));
            }
        }

        let flush_unit = self.config.buffer_capacity as u64;
        if st.write_offset + flush_unit > self.vdev.logical_data_size() {
            return Err(StrataError::OutOfResource("log device space exhausted"));
        }

        st.buffer.extend_from_slice(&encoded);
        st.pending.push(PendingRecord { store_id, lsn, cb });
        if st.buffer.len() >= self.config.flush_threshold {
            self.flush_nudge.notify_all();
        }
        Ok(())
    }

    /// Block until everything appended so far is durable.
    pub fn flush_sync(&self) {
        let mut st = self.state.lock();
        while !st.buffer.is_empty() || st.flush_in_progress {
            st.flush_requested = true;
            self.flush_nudge.notify_all();
            self.flush_done.wait(&mut st);
        }
    }

    fn flusher_loop(self: Arc<Self>) {
        loop {
            let (records_bytes, pending, offset, by_size) = {
                let mut st = self.state.lock();
                loop {
                    if st.buffer.is_empty() {
                        if st.stop {
                            return;
                        }
                        self.flush_nudge.wait(&mut st);
                        continue;
                    }
                    if st.buffer.len() >= self.config.flush_threshold
                        || st.back_to_back_pending
                        || st.flush_requested
                        || st.stop
                    {
                        break;
                    }
                    let timed_out = self
                        .flush_nudge
                        .wait_for(&mut st, self.config.flush_timer)
                        .timed_out();
                    if timed_out && !st.buffer.is_empty() {
                        break;
                    }
                }
                let by_size = st.buffer.len() >= self.config.flush_threshold;
                st.back_to_back_pending = false;
                st.flush_requested = false;
                st.flush_in_progress = true;
                let records_bytes = std::mem::take(&mut st.buffer);
                let pending = std::mem::take(&mut st.pending);
                (records_bytes, pending, st.write_offset, by_size)
            };

            if by_size {
                self.stats.flush_by_size.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.flush_by_timer.fetch_add(1, Ordering::Relaxed);
            }

            let result = self.write_group(&records_bytes, &pending, offset);
            let padded_len = match &result {
                Ok(padded) => *padded,
                Err(e) => {
                    error!(
                        target: "strata::logstore::dev",
                        vdev = %self.vdev.name(),
                        offset,
                        error = %e,
                        "flush_group_write_failed"
                    );
                    0
                }
            };

            {
                let mut st = self.state.lock();
                if padded_len > 0 {
                    st.groups.push_back(GroupMeta {
                        offset,
                        padded_len,
                        records: pending.iter().map(|p| (p.store_id, p.lsn)).collect(),
                    });
                    st.write_offset = offset + padded_len;
                }
                st.flush_in_progress = false;
                if !st.buffer.is_empty() {
                    st.back_to_back_pending = true;
                    self.stats
                        .back_to_back_flushes
                        .fetch_add(1, Ordering::Relaxed);
                }
            }

            self.stats
                .records_flushed
                .fetch_add(pending.len() as u64, Ordering::Relaxed);
            self.stats
                .bytes_flushed
                .fetch_add(records_bytes.len() as u64, Ordering::Relaxed);
            debug!(
                target: "strata::logstore::dev",
                vdev = %self.vdev.name(),
                offset,
                records = pending.len(),
                bytes = records_bytes.len(),
                ok = result.is_ok(),
                "flush_group_complete"
            );

            // Completion callbacks fire outside the lock, in enqueue
            // order; per-store that equals LSN order.
            for rec in pending {
                let cb_result = match &result {
                    Ok(_) => Ok(()),
                    Err(_) => Err(StrataError::DeviceIo {
                        dev: self.vdev.name(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "log flush group write failed",
                        ),
                    }),
                };
                (rec.cb)(cb_result);
            }
            self.flush_done.notify_all();
        }
    }

    fn write_group(&self, records: &[u8], pending: &[PendingRecord], offset: u64) -> Result<u64> {
        let blk_size = u64::from(self.vdev.blk_size());
        let padded_len = round_up((GROUP_HEADER_SIZE + records.len()) as u64, blk_size);

        // Direct I/O devices require the group buffer itself aligned.
        let mut group = AlignedBuf::zeroed(padded_len as usize, blk_size as usize);
        let buf = group.as_mut_slice();
        put_le_u32(buf, 0, GROUP_MAGIC);
        put_le_u32(buf, 4, records.len() as u32);
        put_le_u32(buf, 8, pending.len() as u32);
        put_le_u32(buf, 12, crc32c::crc32c(records));
        buf[GROUP_HEADER_SIZE..GROUP_HEADER_SIZE + records.len()].copy_from_slice(records);

        self.vdev.sync_write(group.as_slice(), offset)?;
        self.vdev.sync()?;
        Ok(padded_len)
    }

    /// Kill any stale flush-group magic at the head of a freshly carved
    /// vdev, so the first recovery scan finds a clean device.
    pub fn initialize(&self) -> Result<()> {
        let zero = vec![0_u8; self.vdev.blk_size() as usize];
        self.vdev.sync_write(&zero, 0)?;
        self.vdev.sync()
    }

    /// Replay flush groups from `start_offset`, delivering each record.
    ///
    /// A group whose magic, size, or checksum fails terminates the scan;
    /// the tail past the last good group is considered truncated. A
    /// record from a future major version is fatal.
    pub fn recover(
        &self,
        start_offset: u64,
        mut on_record: impl FnMut(EnvelopedRecord),
    ) -> Result<RecoveryReport> {
        let blk_size = u64::from(self.vdev.blk_size());
        let logical_size = self.vdev.logical_data_size();
        let mut report = RecoveryReport::default();
        let mut offset = start_offset;
        let mut groups = VecDeque::new();

        'scan: while offset + blk_size <= logical_size {
            let mut head = vec![0_u8; blk_size as usize];
            self.vdev.sync_read(&mut head, offset)?;

            let magic = read_le_u32(&head, 0).unwrap_or(0);
            if magic != GROUP_MAGIC {
                break;
            }
            let records_len = read_le_u32(&head, 4).unwrap_or(0) as usize;
            let num_records = read_le_u32(&head, 8).unwrap_or(0);
            let stored_crc = read_le_u32(&head, 12).unwrap_or(0);
            if GROUP_HEADER_SIZE + records_len > self.config.buffer_capacity {
                warn!(
                    target: "strata::logstore::dev",
                    offset,
                    records_len,
                    "recovery_group_oversize_tail_truncated"
                );
                report.corrupt_tail = true;
                break;
            }

            let padded_len = round_up((GROUP_HEADER_SIZE + records_len) as u64, blk_size);
            if offset + padded_len > logical_size {
                report.corrupt_tail = true;
                break;
            }
            let mut group = vec![0_u8; padded_len as usize];
            self.vdev.sync_read(&mut group, offset)?;
            let records = &group[GROUP_HEADER_SIZE..GROUP_HEADER_SIZE + records_len];
            if crc32c::crc32c(records) != stored_crc {
                warn!(
                    target: "strata::logstore::dev",
                    offset,
                    "recovery_group_crc_mismatch_tail_truncated"
                );
                report.corrupt_tail = true;
                break;
            }

            let mut meta = GroupMeta {
                offset,
                padded_len,
                records: Vec::with_capacity(num_records as usize),
            };
            let mut cursor = 0_usize;
            while cursor < records.len() {
                match decode_record(&records[cursor..]) {
                    DecodeOutcome::Record(env, consumed) => {
                        meta.records.push((env.store_id, env.lsn));
                        report.records_replayed += 1;
                        on_record(env);
                        cursor += consumed;
                    }
                    DecodeOutcome::VersionMismatch(major) => {
                        return Err(StrataError::DeviceFormat(format!(
                            "log record major version {major} is newer than supported"
                        )));
                    }
                    DecodeOutcome::Truncated | DecodeOutcome::Corrupt(_) => {
                        warn!(
                            target: "strata::logstore::dev",
                            offset,
                            cursor,
                            "recovery_record_corrupt_tail_truncated"
                        );
                        report.corrupt_tail = true;
                        groups.push_back(meta);
                        report.groups_scanned += 1;
                        offset += padded_len;
                        break 'scan;
                    }
                }
            }

            groups.push_back(meta);
            report.groups_scanned += 1;
            offset += padded_len;
        }

        report.tail_offset = offset;
        let mut st = self.state.lock();
        st.start_offset = start_offset;
        st.write_offset = offset;
        st.groups = groups;
        info!(
            target: "strata::logstore::dev",
            vdev = %self.vdev.name(),
            groups = report.groups_scanned,
            records = report.records_replayed,
            tail_offset = report.tail_offset,
            corrupt_tail = report.corrupt_tail,
            "log_dev_recovered"
        );
        Ok(report)
    }

    /// Advance the reclamation frontier past every leading flush group
    /// whose records are all reclaimable. Returns the new start offset.
    ///
    /// Idempotent and monotonic: a predicate that reclaims nothing new
    /// leaves the frontier where it is.
    pub fn truncate(&self, is_reclaimable: impl Fn(StoreId, Lsn) -> bool, dry_run: bool) -> u64 {
        let mut st = self.state.lock();
        let mut new_start = st.start_offset;
        let mut dropped = 0_usize;

        let mut probe = st.groups.iter();
        while let Some(group) = probe.next() {
            if group
                .records
                .iter()
                .all(|(store, lsn)| is_reclaimable(*store, *lsn))
            {
                new_start = group.offset + group.padded_len;
                dropped += 1;
            } else {
                break;
            }
        }
        drop(probe);

        if !dry_run && dropped > 0 {
            st.groups.drain(..dropped);
            st.start_offset = new_start;
            debug!(
                target: "strata::logstore::dev",
                vdev = %self.vdev.name(),
                groups_dropped = dropped,
                new_start,
                "log_dev_truncated"
            );
        }
        new_start
    }
}

impl std::fmt::Debug for LogDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("LogDev")
            .field("vdev", &self.vdev.name())
            .field("buffered_bytes", &st.buffer.len())
            .field("pending_records", &st.pending.len())
            .field("write_offset", &st.write_offset)
            .field("start_offset", &st.start_offset)
            .field("groups", &st.groups.len())
            .finish()
    }
}
