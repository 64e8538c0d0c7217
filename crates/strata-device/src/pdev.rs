//! Physical device: an opened raw device or file with a persisted first
//! block and super-block region.
//!
//! All I/O is positional (`pread`/`pwrite` semantics) and synchronous at
//! this layer; asynchrony lives above, in the log device's flusher and
//! the data service's dispatcher. Super-block region I/O is mirrored at
//! the tail of rotational devices and any failure there is treated as a
//! format-level (fatal) error by callers.

use crate::fault::FaultSet;
use crate::superblock::{FirstBlock, SuperBlkLayout, ATOMIC_FB_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use strata_error::{Result, StrataError};
use strata_types::{EngineConfig, IoFlag, ParseError, PdevId};
use tracing::{debug, info, trace};

fn open_options(io_flag: IoFlag, rotational: bool, direct_io_mode: bool) -> OpenOptions {
    let mut opts = OpenOptions::new();
    match io_flag {
        IoFlag::ReadOnly => {
            opts.read(true);
        }
        IoFlag::Buffered => {
            opts.read(true).write(true).create(true);
        }
        IoFlag::Direct => {
            opts.read(true).write(true).create(true);
            // Rotational media takes buffered I/O unless the config
            // explicitly opts into direct mode for it.
            if !rotational || direct_io_mode {
                opts.custom_flags(libc::O_DIRECT);
            }
        }
    }
    opts
}

/// An open physical device.
#[derive(Debug)]
pub struct PhysicalDev {
    path: PathBuf,
    name: String,
    file: File,
    dev_size: u64,
    info: FirstBlock,
    layout: SuperBlkLayout,
    num_streams: u32,
    faults: FaultSet,
}

impl PhysicalDev {
    /// Read and validate the first block of `path` without keeping the
    /// device open. Returns `Ok(None)` for an unformatted device.
    ///
    /// A torn primary falls back to the mirrored copy kept at the tail
    /// of rotational devices, located through the layout the engine
    /// config implies.
    pub fn probe_first_block(path: &Path, config: &EngineConfig) -> Result<Option<FirstBlock>> {
        let file = match OpenOptions::new().read(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StrataError::Io(e)),
        };
        let dev_size = file.metadata().map_err(StrataError::Io)?.len();
        if dev_size < ATOMIC_FB_SIZE as u64 {
            return Ok(None);
        }

        let page = u64::from(config.atomic_phys_page_size).min(dev_size);
        let mut buf = vec![0_u8; page as usize];
        file.read_exact_at(&mut buf, 0).map_err(StrataError::Io)?;

        match FirstBlock::probe(&buf) {
            Ok(fb) => Ok(fb),
            Err(ParseError::ChecksumMismatch { .. }) => {
                // Primary is torn; try the mirror at the device tail.
                let layout = SuperBlkLayout::new(
                    config.max_vdevs,
                    config.max_chunks,
                    config.atomic_phys_page_size,
                );
                let Some(mirror_base) = dev_size.checked_sub(layout.total_size) else {
                    return Err(StrataError::DeviceFormat(format!(
                        "{}: first block checksum mismatch and no room for a mirror",
                        path.display()
                    )));
                };
                file.read_exact_at(&mut buf, mirror_base)
                    .map_err(StrataError::Io)?;
                FirstBlock::probe(&buf).map_err(|e| {
                    StrataError::DeviceFormat(format!(
                        "{}: first block corrupt on both copies: {e}",
                        path.display()
                    ))
                })
            }
            Err(e) => Err(StrataError::DeviceFormat(format!(
                "{}: invalid first block: {e}",
                path.display()
            ))),
        }
    }

    /// Open a device that already carries (or is being stamped with) the
    /// given first block.
    pub fn open(
        path: &Path,
        io_flag: IoFlag,
        info: FirstBlock,
        config: &EngineConfig,
        num_streams: u32,
    ) -> Result<Self> {
        let rotational = info.mirror_super_block;
        let file = open_options(io_flag, rotational, config.direct_io_mode)
            .open(path)
            .map_err(|e| StrataError::DeviceIo {
                dev: path.display().to_string(),
                source: e,
            })?;

        let mut dev_size = file.metadata().map_err(StrataError::Io)?.len();
        let min_size = info.data_offset + info.data_size + if rotational {
            SuperBlkLayout::new(info.max_vdevs, info.max_chunks, info.atomic_page_size).total_size
        } else {
            0
        };
        if dev_size < min_size {
            // File-backed devices are grown to their formatted size.
            file.set_len(min_size).map_err(|e| StrataError::DeviceIo {
                dev: path.display().to_string(),
                source: e,
            })?;
            dev_size = min_size;
        }

        let layout = SuperBlkLayout::new(info.max_vdevs, info.max_chunks, info.atomic_page_size);
        debug!(
            target: "strata::device::pdev",
            dev = %path.display(),
            pdev_id = info.pdev_id.0,
            dev_size,
            data_offset = info.data_offset,
            mirror_super_block = rotational,
            "pdev_open"
        );

        Ok(Self {
            name: path.display().to_string(),
            path: path.to_path_buf(),
            file,
            dev_size,
            info,
            layout,
            num_streams: num_streams.max(1),
            faults: FaultSet::new(),
        })
    }

    #[must_use]
    pub fn pdev_id(&self) -> PdevId {
        self.info.pdev_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn dev_size(&self) -> u64 {
        self.dev_size
    }

    #[must_use]
    pub fn data_offset(&self) -> u64 {
        self.info.data_offset
    }

    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.info.data_size
    }

    #[must_use]
    pub fn align_size(&self) -> u32 {
        self.info.align_size
    }

    #[must_use]
    pub fn atomic_page_size(&self) -> u32 {
        self.info.atomic_page_size
    }

    #[must_use]
    pub fn num_streams(&self) -> u32 {
        self.num_streams
    }

    #[must_use]
    pub fn first_block(&self) -> &FirstBlock {
        &self.info
    }

    #[must_use]
    pub fn layout(&self) -> &SuperBlkLayout {
        &self.layout
    }

    /// Fault injection points consulted on the data path.
    #[must_use]
    pub fn faults(&self) -> &FaultSet {
        &self.faults
    }

    fn bounds_check(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| StrataError::InvalidArgument("device offset overflow".to_owned()))?;
        if end > self.dev_size {
            return Err(StrataError::InvalidArgument(format!(
                "I/O past device end: offset={offset} len={len} dev_size={}",
                self.dev_size
            )));
        }
        Ok(())
    }

    fn io_err(&self, e: std::io::Error) -> StrataError {
        StrataError::DeviceIo {
            dev: self.name.clone(),
            source: e,
        }
    }

    /// Positional read into `buf` from the data region.
    pub fn sync_read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.bounds_check(offset, buf.len())?;
        self.faults
            .check_read(&self.name, offset, buf.len() as u64)
            .map_err(|e| self.io_err(e))?;
        trace!(
            target: "strata::device::io",
            dev = %self.name,
            offset,
            len = buf.len(),
            "sync_read"
        );
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| self.io_err(e))
    }

    /// Positional write of `data` into the data region.
    pub fn sync_write(&self, data: &[u8], offset: u64) -> Result<()> {
        self.bounds_check(offset, data.len())?;
        self.faults
            .check_write(&self.name, offset, data.len() as u64)
            .map_err(|e| self.io_err(e))?;
        trace!(
            target: "strata::device::io",
            dev = %self.name,
            offset,
            len = data.len(),
            "sync_write"
        );
        self.file
            .write_all_at(data, offset)
            .map_err(|e| self.io_err(e))
    }

    /// Gathered write: the segments land contiguously at `offset`.
    pub fn sync_writev(&self, segments: &[&[u8]], offset: u64) -> Result<()> {
        let mut cur = offset;
        for seg in segments {
            self.sync_write(seg, cur)?;
            cur = cur
                .checked_add(seg.len() as u64)
                .ok_or_else(|| StrataError::InvalidArgument("writev overflow".to_owned()))?;
        }
        Ok(())
    }

    /// Scattered read: fills the buffers from contiguous bytes at `offset`.
    pub fn sync_readv(&self, bufs: &mut [&mut [u8]], offset: u64) -> Result<()> {
        let mut cur = offset;
        for buf in bufs.iter_mut() {
            self.sync_read(buf, cur)?;
            cur = cur
                .checked_add(buf.len() as u64)
                .ok_or_else(|| StrataError::InvalidArgument("readv overflow".to_owned()))?;
        }
        Ok(())
    }

    /// Flush device caches.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(|e| self.io_err(e))
    }

    fn mirror_base(&self) -> Option<u64> {
        self.info
            .mirror_super_block
            .then(|| self.dev_size - self.layout.total_size)
    }

    /// Write into the super-block region at `offset` (an offset within
    /// the super-block area, not the data region). Mirrored to the tail
    /// copy on rotational media and fsynced before returning.
    ///
    /// Callers treat any failure here as fatal: a half-written
    /// super-block means the topology can no longer be trusted.
    pub fn write_super_block(&self, data: &[u8], offset: u64) -> Result<()> {
        let end = offset + data.len() as u64;
        if end > self.layout.total_size {
            return Err(StrataError::InvalidArgument(format!(
                "super-block write past region: offset={offset} len={}",
                data.len()
            )));
        }

        self.file
            .write_all_at(data, offset)
            .map_err(|e| StrataError::DeviceFormat(format!("{}: super-block write: {e}", self.name)))?;
        if let Some(base) = self.mirror_base() {
            self.file
                .write_all_at(data, base + offset)
                .map_err(|e| {
                    StrataError::DeviceFormat(format!("{}: super-block mirror write: {e}", self.name))
                })?;
        }
        self.file
            .sync_all()
            .map_err(|e| StrataError::DeviceFormat(format!("{}: super-block sync: {e}", self.name)))
    }

    /// Read from the super-block region at `offset`, falling back to the
    /// tail mirror on rotational media when the primary read fails.
    pub fn read_super_block(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.layout.total_size {
            return Err(StrataError::InvalidArgument(format!(
                "super-block read past region: offset={offset} len={}",
                buf.len()
            )));
        }

        match self.file.read_exact_at(buf, offset) {
            Ok(()) => Ok(()),
            Err(primary_err) => {
                let Some(base) = self.mirror_base() else {
                    return Err(StrataError::DeviceFormat(format!(
                        "{}: super-block read: {primary_err}",
                        self.name
                    )));
                };
                info!(
                    target: "strata::device::pdev",
                    dev = %self.name,
                    offset,
                    "super_block_mirror_fallback"
                );
                self.file.read_exact_at(buf, base + offset).map_err(|e| {
                    StrataError::DeviceFormat(format!(
                        "{}: super-block read failed on both copies: primary={primary_err} mirror={e}",
                        self.name
                    ))
                })
            }
        }
    }
}
