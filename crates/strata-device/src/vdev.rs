//! Virtual device: a logical block device composed from chunks.
//!
//! The logical address space is the concatenation of the primary chunks
//! in chunk-id order. A block address decomposes into
//! `(stripe_index = addr / chunk_size, offset_within_chunk)`; the stripe
//! index picks a primary chunk. `create_vdev` carves one stripe at a
//! time, cycling the tier's pdevs and taking chunk ids in carve order,
//! so the id-sorted stripe sequence alternates devices and consecutive
//! stripes land on distinct pdevs for striped placement.
//!
//! Mirrored placement fans every write out to the primary and all of its
//! replicas; the write completes only when every copy acknowledged.
//! Reads try the primary and fall through to replicas on a device I/O
//! error. Alignment and block size come straight from the underlying
//! pdevs; callers must issue block-aligned requests.

use crate::chunk::Chunk;
use crate::superblock::VdevInfo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use strata_error::{Result, StrataError};
use strata_types::{ChunkId, PlacementPolicy, VdevId};
use tracing::{debug, warn};

#[derive(Default)]
struct ChunkSet {
    /// Primary chunks sorted by chunk id; index == stripe index.
    primaries: Vec<Arc<Chunk>>,
    /// Replica chunks keyed by their primary's id.
    mirrors: HashMap<ChunkId, Vec<Arc<Chunk>>>,
}

pub struct VirtualDev {
    info: RwLock<VdevInfo>,
    chunks: RwLock<ChunkSet>,
}

impl VirtualDev {
    #[must_use]
    pub fn new(info: VdevInfo) -> Self {
        Self {
            info: RwLock::new(info),
            chunks: RwLock::new(ChunkSet::default()),
        }
    }

    #[must_use]
    pub fn vdev_id(&self) -> VdevId {
        self.info.read().vdev_id
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.info.read().name.clone()
    }

    #[must_use]
    pub fn blk_size(&self) -> u32 {
        self.info.read().blk_size
    }

    /// Total size across all chunks, replicas included.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.info.read().vdev_size
    }

    #[must_use]
    pub fn placement(&self) -> PlacementPolicy {
        self.info.read().placement
    }

    #[must_use]
    pub fn num_mirrors(&self) -> u32 {
        self.info.read().num_mirrors
    }

    #[must_use]
    pub fn info(&self) -> VdevInfo {
        self.info.read().clone()
    }

    /// Replace the user-opaque context blob. The device manager persists
    /// the updated record.
    pub fn set_context(&self, context: Vec<u8>) {
        self.info.write().context = context;
    }

    #[must_use]
    pub fn num_chunks(&self) -> usize {
        let set = self.chunks.read();
        set.primaries.len() + set.mirrors.values().map(Vec::len).sum::<usize>()
    }

    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        self.chunks
            .read()
            .primaries
            .first()
            .map_or(0, |c| c.size())
    }

    /// Addressable bytes: the primary chunks' capacity.
    #[must_use]
    pub fn logical_data_size(&self) -> u64 {
        let set = self.chunks.read();
        set.primaries.iter().map(|c| c.size()).sum()
    }

    /// Every chunk of this vdev, primaries first.
    #[must_use]
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        let set = self.chunks.read();
        let mut out = set.primaries.clone();
        for replicas in set.mirrors.values() {
            out.extend(replicas.iter().cloned());
        }
        out
    }

    /// Attach a chunk. Chunks carrying a valid `primary_chunk_id` join
    /// that primary's replica set; all others become primaries in chunk
    /// id order.
    pub fn add_chunk(&self, chunk: Arc<Chunk>, fresh: bool) {
        debug!(
            target: "strata::device::vdev",
            vdev_id = self.vdev_id().0,
            chunk_id = chunk.chunk_id().0,
            pdev_id = chunk.pdev_id().0,
            fresh,
            "vdev_add_chunk"
        );
        let mut set = self.chunks.write();
        let primary_id = chunk.primary_chunk_id();
        if primary_id.is_valid() {
            set.mirrors.entry(primary_id).or_default().push(chunk);
        } else {
            let pos = set
                .primaries
                .partition_point(|c| c.chunk_id() < chunk.chunk_id());
            set.primaries.insert(pos, chunk);
        }
    }

    fn locate(&self, offset: u64, len: usize) -> Result<(usize, u64, usize)> {
        let blk_size = u64::from(self.blk_size());
        if offset % blk_size != 0 || len as u64 % blk_size != 0 {
            return Err(StrataError::InvalidArgument(format!(
                "unaligned vdev I/O: offset={offset} len={len} blk_size={blk_size}"
            )));
        }
        let set = self.chunks.read();
        let chunk_size = set
            .primaries
            .first()
            .map(|c| c.size())
            .ok_or_else(|| StrataError::InvalidArgument("vdev has no chunks".to_owned()))?;
        let stripe = usize::try_from(offset / chunk_size)
            .map_err(|_| StrataError::InvalidArgument("vdev offset overflow".to_owned()))?;
        if stripe >= set.primaries.len() {
            return Err(StrataError::InvalidArgument(format!(
                "vdev offset past end: offset={offset} logical_size={}",
                chunk_size * set.primaries.len() as u64
            )));
        }
        let within = offset % chunk_size;
        // Clamp the segment to the current chunk; the caller loops.
        let seg_len = len.min((chunk_size - within) as usize);
        Ok((stripe, within, seg_len))
    }

    /// Write `data` at logical `offset`. Spans chunk boundaries by
    /// splitting into per-chunk segments; mirrored placement requires
    /// every replica to acknowledge.
    pub fn sync_write(&self, data: &[u8], offset: u64) -> Result<()> {
        let mut cur_off = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let (stripe, within, seg_len) = self.locate(cur_off, rest.len())?;
            let (seg, tail) = rest.split_at(seg_len);
            {
                let set = self.chunks.read();
                let primary = &set.primaries[stripe];
                primary.sync_write(seg, within)?;
                if let Some(replicas) = set.mirrors.get(&primary.chunk_id()) {
                    for replica in replicas {
                        replica.sync_write(seg, within)?;
                    }
                }
            }
            rest = tail;
            cur_off += seg_len as u64;
        }
        Ok(())
    }

    /// Read into `buf` from logical `offset`, falling through to mirror
    /// replicas when the primary fails with a device I/O error.
    pub fn sync_read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut cur_off = offset;
        let mut filled = 0_usize;
        while filled < buf.len() {
            let remaining = buf.len() - filled;
            let (stripe, within, seg_len) = self.locate(cur_off, remaining)?;
            let seg = &mut buf[filled..filled + seg_len];
            {
                let set = self.chunks.read();
                let primary = &set.primaries[stripe];
                match primary.sync_read(seg, within) {
                    Ok(()) => {}
                    Err(StrataError::DeviceIo { dev, source }) => {
                        let replicas = set.mirrors.get(&primary.chunk_id());
                        let mut recovered = false;
                        if let Some(replicas) = replicas {
                            warn!(
                                target: "strata::device::vdev",
                                vdev_id = self.vdev_id().0,
                                chunk_id = primary.chunk_id().0,
                                dev = %dev,
                                error = %source,
                                "primary_read_failed_trying_mirrors"
                            );
                            for replica in replicas {
                                if replica.sync_read(seg, within).is_ok() {
                                    recovered = true;
                                    break;
                                }
                            }
                        }
                        if !recovered {
                            return Err(StrataError::DeviceIo { dev, source });
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            filled += seg_len;
            cur_off += seg_len as u64;
        }
        Ok(())
    }

    /// Flush every pdev backing this vdev.
    pub fn sync(&self) -> Result<()> {
        let set = self.chunks.read();
        let mut synced = Vec::new();
        for chunk in set
            .primaries
            .iter()
            .chain(set.mirrors.values().flatten())
        {
            let pdev_id = chunk.pdev_id();
            if !synced.contains(&pdev_id) {
                chunk.pdev().sync()?;
                synced.push(pdev_id);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for VirtualDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info.read();
        f.debug_struct("VirtualDev")
            .field("vdev_id", &info.vdev_id.0)
            .field("name", &info.name)
            .field("size", &info.vdev_size)
            .field("blk_size", &info.blk_size)
            .field("placement", &info.placement)
            .field("num_chunks", &self.num_chunks())
            .finish()
    }
}
