//! A chunk: fixed-size contiguous region of one physical device.
//!
//! Chunks are the unit of allocation. The device manager owns them for
//! their whole lifetime; virtual devices borrow them by `Arc` but never
//! outlive the manager. Chunk ids are dense and never reused within a
//! system instance, though a freed chunk's table slot may be recycled.

use crate::pdev::PhysicalDev;
use crate::superblock::ChunkInfo;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use strata_error::{Result, StrataError};
use strata_types::{ChunkId, PdevId, VdevId};

pub struct Chunk {
    pdev: Arc<PhysicalDev>,
    info: RwLock<ChunkInfo>,
}

impl Chunk {
    #[must_use]
    pub fn new(pdev: Arc<PhysicalDev>, info: ChunkInfo) -> Self {
        debug_assert_eq!(pdev.pdev_id(), info.pdev_id);
        Self {
            pdev,
            info: RwLock::new(info),
        }
    }

    #[must_use]
    pub fn pdev(&self) -> &Arc<PhysicalDev> {
        &self.pdev
    }

    #[must_use]
    pub fn chunk_id(&self) -> ChunkId {
        self.info.read().chunk_id
    }

    #[must_use]
    pub fn pdev_id(&self) -> PdevId {
        self.info.read().pdev_id
    }

    #[must_use]
    pub fn vdev_id(&self) -> VdevId {
        self.info.read().vdev_id
    }

    #[must_use]
    pub fn primary_chunk_id(&self) -> ChunkId {
        self.info.read().primary_chunk_id
    }

    #[must_use]
    pub fn prev_chunk_id(&self) -> ChunkId {
        self.info.read().prev_chunk_id
    }

    #[must_use]
    pub fn next_chunk_id(&self) -> ChunkId {
        self.info.read().next_chunk_id
    }

    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.info.read().start_offset
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.info.read().size
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.info.read().is_busy()
    }

    /// Snapshot of the serializable record.
    #[must_use]
    pub fn info(&self) -> ChunkInfo {
        *self.info.read()
    }

    pub(crate) fn set_vdev(&self, vdev_id: VdevId, primary: ChunkId) {
        let mut info = self.info.write();
        info.vdev_id = vdev_id;
        info.primary_chunk_id = primary;
    }

    pub(crate) fn set_free(&self) {
        let mut info = self.info.write();
        info.vdev_id = VdevId::INVALID;
        info.primary_chunk_id = ChunkId::INVALID;
        info.is_sb_chunk = false;
    }

    pub(crate) fn free_slot(&self) {
        self.info.write().slot_allocated = false;
    }

    pub(crate) fn set_prev(&self, prev: ChunkId) {
        self.info.write().prev_chunk_id = prev;
    }

    pub(crate) fn set_next(&self, next: ChunkId) {
        self.info.write().next_chunk_id = next;
    }

    pub(crate) fn grow(&self, new_size: u64) {
        self.info.write().size = new_size;
    }

    fn span_check(&self, offset: u64, len: usize) -> Result<u64> {
        let size = self.size();
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| StrataError::InvalidArgument("chunk offset overflow".to_owned()))?;
        if end > size {
            return Err(StrataError::InvalidArgument(format!(
                "I/O past chunk end: chunk={} offset={offset} len={len} size={size}",
                self.chunk_id()
            )));
        }
        Ok(self.start_offset() + offset)
    }

    /// Write within the chunk; `offset` is chunk-relative.
    pub fn sync_write(&self, data: &[u8], offset: u64) -> Result<()> {
        let dev_offset = self.span_check(offset, data.len())?;
        self.pdev.sync_write(data, dev_offset)
    }

    /// Read within the chunk; `offset` is chunk-relative.
    pub fn sync_read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let dev_offset = self.span_check(offset, buf.len())?;
        self.pdev.sync_read(buf, dev_offset)
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info.read();
        f.debug_struct("Chunk")
            .field("chunk_id", &info.chunk_id.0)
            .field("pdev_id", &info.pdev_id.0)
            .field("vdev_id", &info.vdev_id.0)
            .field("start_offset", &info.start_offset)
            .field("size", &info.size)
            .field("busy", &info.is_busy())
            .finish()
    }
}
