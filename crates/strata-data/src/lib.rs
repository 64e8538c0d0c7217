#![forbid(unsafe_code)]
//! Block data service.
//!
//! Stores out-of-line payloads (large log record values) in
//! bitmap-allocated blocks of a dedicated virtual device. Allocation is
//! two-phase: `alloc_blocks` reserves blocks in memory, and
//! `commit_blocks` marks them live once the referencing journal entry
//! is durable. Only the committed bitmap is persisted — at checkpoint
//! flush — so allocations whose journal entry never landed are released
//! for free by a crash.

use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use strata_cp::{Cp, CpAwait, CpCallbacks, CpContext};
use strata_device::manager::{bitmap_clear, bitmap_get, bitmap_set};
use strata_device::VirtualDev;
use strata_error::{Result, StrataError};
use strata_meta::MetaService;
use strata_types::{put_le_u32, put_le_u64, read_le_u32, read_le_u64};
use tracing::{debug, info, trace, warn};

pub const DATA_SVC_META_NAME: &str = "data_svc";

/// Identifier of a contiguous block run on the data vdev.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub blk_num: u64,
    pub count: u32,
}

impl BlockId {
    pub const SERIALIZED_SIZE: usize = 12;

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; Self::SERIALIZED_SIZE];
        put_le_u64(&mut buf, 0, self.blk_num);
        put_le_u32(&mut buf, 8, self.count);
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let bad = |e: strata_types::ParseError| StrataError::InvalidArgument(e.to_string());
        Ok(Self {
            blk_num: read_le_u64(data, 0).map_err(bad)?,
            count: read_le_u32(data, 8).map_err(bad)?,
        })
    }
}

struct AllocState {
    /// Blocks reserved (allocated but possibly uncommitted).
    allocated: Vec<u8>,
    /// Blocks whose referencing journal entry is durable.
    committed: Vec<u8>,
    num_blocks: u64,
}

impl AllocState {
    /// First-fit search for `count` contiguous free blocks.
    fn find_contiguous(&self, count: u32) -> Option<u64> {
        if count == 0 {
            return None;
        }
        let mut run_start = 0_u64;
        let mut run_len = 0_u32;
        for idx in 0..self.num_blocks {
            if bitmap_get(&self.allocated, idx as u32) {
                run_start = idx + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len >= count {
                    return Some(run_start);
                }
            }
        }
        None
    }
}

type WriteJob = Box<dyn FnOnce() + Send>;

/// Bitmap-allocated block storage over one vdev.
pub struct DataService {
    meta: Arc<MetaService>,
    vdev: Mutex<Option<Arc<VirtualDev>>>,
    state: Mutex<AllocState>,
    replayed_bitmap: Mutex<Option<Vec<u8>>>,
    dispatch_tx: Mutex<Option<mpsc::Sender<WriteJob>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl DataService {
    /// Build the service and register its meta handler. Must run before
    /// the meta service replays.
    pub fn new(meta: &Arc<MetaService>) -> Arc<Self> {
        let svc = Arc::new(Self {
            meta: Arc::clone(meta),
            vdev: Mutex::new(None),
            state: Mutex::new(AllocState {
                allocated: Vec::new(),
                committed: Vec::new(),
                num_blocks: 0,
            }),
            replayed_bitmap: Mutex::new(None),
            dispatch_tx: Mutex::new(None),
            dispatcher: Mutex::new(None),
        });
        let replay_svc = Arc::downgrade(&svc);
        meta.register_handler(
            DATA_SVC_META_NAME,
            Box::new(move |blob| {
                if let Some(svc) = replay_svc.upgrade() {
                    *svc.replayed_bitmap.lock() = Some(blob.to_vec());
                }
            }),
        );
        svc
    }

    /// Bring the service online over its vdev and start the write
    /// dispatcher.
    pub fn start(self: &Arc<Self>, format: bool, vdev: Arc<VirtualDev>) -> Result<()> {
        let num_blocks = vdev.logical_data_size() / u64::from(vdev.blk_size());
        let bitmap_len = num_blocks.div_ceil(8) as usize;
        {
            let mut state = self.state.lock();
            state.num_blocks = num_blocks;
            if format {
                state.allocated = vec![0_u8; bitmap_len];
                state.committed = vec![0_u8; bitmap_len];
                self.persist_committed_locked(&state)?;
            } else {
                let replayed = self.replayed_bitmap.lock().take().unwrap_or_default();
                let mut bitmap = replayed;
                bitmap.resize(bitmap_len, 0);
                state.allocated = bitmap.clone();
                state.committed = bitmap;
            }
        }
        *self.vdev.lock() = Some(vdev);

        let (tx, rx) = mpsc::channel::<WriteJob>();
        *self.dispatch_tx.lock() = Some(tx);
        let handle = std::thread::Builder::new()
            .name("strata-data-writer".to_owned())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn data writer thread: {e}"));
        *self.dispatcher.lock() = Some(handle);
        info!(
            target: "strata::data",
            num_blocks,
            format,
            "data_service_started"
        );
        Ok(())
    }

    pub fn stop(&self) {
        self.dispatch_tx.lock().take();
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
    }

    fn device(&self) -> Result<Arc<VirtualDev>> {
        self.vdev
            .lock()
            .clone()
            .ok_or_else(|| StrataError::InvalidArgument("data service not started".to_owned()))
    }

    #[must_use]
    pub fn blk_size(&self) -> u32 {
        self.vdev.lock().as_ref().map_or(0, |v| v.blk_size())
    }

    /// Reserve a contiguous run large enough for `bytes`.
    pub fn alloc_blocks(&self, bytes: usize) -> Result<BlockId> {
        let blk_size = self.blk_size();
        if blk_size == 0 {
            return Err(StrataError::InvalidArgument(
                "data service not started".to_owned(),
            ));
        }
        let count = (bytes as u64).div_ceil(u64::from(blk_size)) as u32;
        let mut state = self.state.lock();
        let Some(start) = state.find_contiguous(count) else {
            return Err(StrataError::OutOfResource("no free data blocks"));
        };
        for blk in start..start + u64::from(count) {
            bitmap_set(&mut state.allocated, blk as u32);
        }
        trace!(
            target: "strata::data",
            blk_num = start,
            count,
            "blocks_allocated"
        );
        Ok(BlockId {
            blk_num: start,
            count,
        })
    }

    /// Mark an allocated run live. Called once the journal entry
    /// referencing it is durable; persisted at the next checkpoint.
    pub fn commit_blocks(&self, blkid: BlockId) {
        let mut state = self.state.lock();
        for blk in blkid.blk_num..blkid.blk_num + u64::from(blkid.count) {
            // Replay after crash commits runs that were never
            // re-allocated in this incarnation; reserve them too.
            bitmap_set(&mut state.allocated, blk as u32);
            bitmap_set(&mut state.committed, blk as u32);
        }
        debug!(
            target: "strata::data",
            blk_num = blkid.blk_num,
            count = blkid.count,
            "blocks_committed"
        );
    }

    /// Release a run back to the free pool.
    pub fn free_blocks(&self, blkid: BlockId) {
        let mut state = self.state.lock();
        for blk in blkid.blk_num..blkid.blk_num + u64::from(blkid.count) {
            bitmap_clear(&mut state.allocated, blk as u32);
            bitmap_clear(&mut state.committed, blk as u32);
        }
    }

    #[must_use]
    pub fn is_committed(&self, blkid: BlockId) -> bool {
        let state = self.state.lock();
        (blkid.blk_num..blkid.blk_num + u64::from(blkid.count))
            .all(|blk| bitmap_get(&state.committed, blk as u32))
    }

    /// Write `data` into the run synchronously, padding the final block.
    pub fn write(&self, blkid: BlockId, data: &[u8]) -> Result<()> {
        let vdev = self.device()?;
        let blk_size = vdev.blk_size() as usize;
        let capacity = blk_size * blkid.count as usize;
        if data.len() > capacity {
            return Err(StrataError::InvalidArgument(format!(
                "payload of {} bytes exceeds run capacity {capacity}",
                data.len()
            )));
        }
        let mut padded = vec![0_u8; capacity];
        padded[..data.len()].copy_from_slice(data);
        vdev.sync_write(&padded, blkid.blk_num * blk_size as u64)?;
        vdev.sync()
    }

    /// Write on the dispatcher thread; `cb` fires when the data is on
    /// media.
    pub fn async_write(
        self: &Arc<Self>,
        blkid: BlockId,
        data: Vec<u8>,
        cb: Box<dyn FnOnce(Result<()>) + Send>,
    ) {
        let svc = Arc::clone(self);
        let job: WriteJob = Box::new(move || {
            let result = svc.write(blkid, &data);
            cb(result);
        });
        let rejected = {
            let tx = self.dispatch_tx.lock();
            match tx.as_ref() {
                Some(tx) => tx.send(job).err().map(|e| e.0),
                None => Some(job),
            }
        };
        if let Some(job) = rejected {
            warn!(target: "strata::data", "data_dispatcher_unavailable_running_inline");
            job();
        }
    }

    /// Read the run back; returns `count * blk_size` bytes.
    pub fn read(&self, blkid: BlockId) -> Result<Vec<u8>> {
        let vdev = self.device()?;
        let blk_size = vdev.blk_size() as usize;
        let mut buf = vec![0_u8; blk_size * blkid.count as usize];
        vdev.sync_read(&mut buf, blkid.blk_num * blk_size as u64)?;
        Ok(buf)
    }

    fn persist_committed_locked(&self, state: &AllocState) -> Result<()> {
        self.meta
            .write_meta_blk(DATA_SVC_META_NAME, state.committed.clone())
    }
}

impl CpCallbacks for DataService {
    fn on_switchover_cp(&self, _cur_cp: Option<&Cp>, _new_cp: &Cp) -> Option<CpContext> {
        None
    }

    fn cp_flush(&self, cp: &Arc<Cp>) -> CpAwait {
        let state = self.state.lock();
        match self.persist_committed_locked(&state) {
            Ok(()) => {
                debug!(
                    target: "strata::data",
                    cp_id = cp.id().0,
                    "allocator_bitmap_persisted"
                );
                CpAwait::ready(true)
            }
            Err(e) => {
                tracing::error!(
                    target: "strata::data",
                    cp_id = cp.id().0,
                    error = %e,
                    "allocator_bitmap_persist_failed"
                );
                CpAwait::ready(false)
            }
        }
    }

    fn cp_cleanup(&self, _cp: &Cp) {}

    fn cp_progress_percent(&self) -> u32 {
        100
    }
}

impl std::fmt::Debug for DataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DataService")
            .field("num_blocks", &state.num_blocks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(num_blocks: u64) -> AllocState {
        AllocState {
            allocated: vec![0_u8; num_blocks.div_ceil(8) as usize],
            committed: vec![0_u8; num_blocks.div_ceil(8) as usize],
            num_blocks,
        }
    }

    #[test]
    fn blockid_roundtrip() {
        let id = BlockId {
            blk_num: 42,
            count: 3,
        };
        let bytes = id.serialize();
        assert_eq!(bytes.len(), BlockId::SERIALIZED_SIZE);
        assert_eq!(BlockId::deserialize(&bytes).unwrap(), id);
        assert!(BlockId::deserialize(&bytes[..8]).is_err());
    }

    #[test]
    fn contiguous_search_skips_used_runs() {
        let mut st = state(16);
        bitmap_set(&mut st.allocated, 2);
        bitmap_set(&mut st.allocated, 7);

        // [0,1] free but len 2 < 3; [3..6] is the first free run of 3.
        assert_eq!(st.find_contiguous(3), Some(3));
        assert_eq!(st.find_contiguous(8), Some(8));
        assert_eq!(st.find_contiguous(16), None);
    }

    #[test]
    fn contiguous_search_exhaustion() {
        let mut st = state(8);
        for i in 0..8 {
            bitmap_set(&mut st.allocated, i);
        }
        assert_eq!(st.find_contiguous(1), None);
    }
}
