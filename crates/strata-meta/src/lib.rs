#![forbid(unsafe_code)]
//! Meta-block service.
//!
//! Small on-disk records registered under stable names and replayed to
//! their owners on boot, before any component starts I/O. The registry
//! lives in the meta region of pdev 0's super-block and is rewritten
//! wholesale on every update; the write path is blocking by design and
//! only ever driven from blocking-capable threads (checkpoint persist,
//! truncation, boot).
//!
//! Region format:
//!
//! ```text
//! +------------+--------+
//! | magic      | 4 bytes|
//! | version    | 2 bytes|
//! | num_records| 2 bytes|
//! +------------+--------+
//! | per record:         |
//! |   name_len | 2 bytes|
//! |   name     | N bytes|
//! |   blob_len | 4 bytes|
//! |   blob     | M bytes|
//! +------------+--------+
//! | crc32c     | 4 bytes| over everything before this field
//! +------------+--------+
//! ```

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strata_device::PhysicalDev;
use strata_error::{Result, StrataError};
use strata_types::{put_le_u16, put_le_u32, read_le_u16, read_le_u32};
use tracing::{debug, info, warn};

const META_MAGIC: u32 = u32::from_le_bytes(*b"SMTA");
const META_VERSION: u16 = 1;
const META_HEADER_SIZE: usize = 8;
const META_CRC_SIZE: usize = 4;

/// Callback invoked during replay with the stored blob.
pub type MetaFoundCb = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Named small-blob registry persisted in the super-block meta region.
///
/// Lock order: `handlers` before `blobs`, never the reverse — a replay
/// handler is allowed to write a blob.
pub struct MetaService {
    pdev: Arc<PhysicalDev>,
    region_offset: u64,
    region_size: usize,
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    handlers: Mutex<BTreeMap<String, MetaFoundCb>>,
    replayed: AtomicBool,
}

impl MetaService {
    #[must_use]
    pub fn new(pdev: Arc<PhysicalDev>) -> Self {
        let layout = *pdev.layout();
        Self {
            pdev,
            region_offset: layout.meta_region_offset,
            region_size: layout.meta_region_size as usize,
            blobs: Mutex::new(BTreeMap::new()),
            handlers: Mutex::new(BTreeMap::new()),
            replayed: AtomicBool::new(false),
        }
    }

    /// Register a replay handler under a stable name. Must happen before
    /// [`replay`](Self::replay); late registrations are a programming
    /// error caught in debug builds.
    pub fn register_handler(&self, name: &str, cb: MetaFoundCb) {
        debug_assert!(
            !self.replayed.load(Ordering::Acquire),
            "meta handler {name} registered after replay"
        );
        debug!(target: "strata::meta", name, "meta_handler_registered");
        self.handlers.lock().insert(name.to_owned(), cb);
    }

    /// Initialize an empty registry on a freshly formatted system.
    pub fn format(&self) -> Result<()> {
        let mut blobs = self.blobs.lock();
        blobs.clear();
        self.replayed.store(true, Ordering::Release);
        self.persist_locked(&blobs)
    }

    /// Load the registry and replay every stored blob to its registered
    /// handler. Blobs without a handler are kept but flagged.
    pub fn replay(&self) -> Result<()> {
        let mut region = vec![0_u8; self.region_size];
        self.pdev.read_super_block(&mut region, self.region_offset)?;

        let magic = read_le_u32(&region, 0).map_err(|e| StrataError::DeviceFormat(e.to_string()))?;
        if magic != META_MAGIC {
            return Err(StrataError::DeviceFormat(format!(
                "meta region magic mismatch: got {magic:#x}"
            )));
        }
        let version =
            read_le_u16(&region, 4).map_err(|e| StrataError::DeviceFormat(e.to_string()))?;
        if version != META_VERSION {
            return Err(StrataError::DeviceFormat(format!(
                "meta region version {version} unsupported"
            )));
        }
        let num_records =
            read_le_u16(&region, 6).map_err(|e| StrataError::DeviceFormat(e.to_string()))?;

        let take = |cursor: usize, len: usize| {
            strata_types::ensure_slice(&region, cursor, len)
                .map_err(|e| StrataError::DeviceFormat(format!("meta region truncated: {e}")))
        };

        let mut parsed: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut cursor = META_HEADER_SIZE;
        for _ in 0..num_records {
            let name_len = usize::from(
                read_le_u16(&region, cursor)
                    .map_err(|e| StrataError::DeviceFormat(e.to_string()))?,
            );
            cursor += 2;
            let name = String::from_utf8_lossy(take(cursor, name_len)?).into_owned();
            cursor += name_len;
            let blob_len = read_le_u32(&region, cursor)
                .map_err(|e| StrataError::DeviceFormat(e.to_string()))?
                as usize;
            cursor += 4;
            let blob = take(cursor, blob_len)?.to_vec();
            cursor += blob_len;
            parsed.insert(name, blob);
        }

        let stored_crc = read_le_u32(&region, cursor)
            .map_err(|e| StrataError::DeviceFormat(e.to_string()))?;
        let computed = crc32c::crc32c(&region[..cursor]);
        if stored_crc != computed {
            return Err(StrataError::DeviceFormat(format!(
                "meta region crc mismatch: stored {stored_crc:#x} computed {computed:#x}"
            )));
        }

        info!(
            target: "strata::meta",
            num_records,
            "meta_region_replaying"
        );
        *self.blobs.lock() = parsed.clone();

        let handlers = self.handlers.lock();
        for (name, blob) in &parsed {
            match handlers.get(name) {
                Some(cb) => cb(blob),
                None => warn!(
                    target: "strata::meta",
                    name = %name,
                    blob_len = blob.len(),
                    "meta_blob_has_no_handler"
                ),
            }
        }
        drop(handlers);
        self.replayed.store(true, Ordering::Release);
        Ok(())
    }

    /// Store (or overwrite) a named blob and persist the registry.
    pub fn write_meta_blk(&self, name: &str, blob: Vec<u8>) -> Result<()> {
        let mut blobs = self.blobs.lock();
        blobs.insert(name.to_owned(), blob);
        self.persist_locked(&blobs)
    }

    /// Remove a named blob and persist the registry.
    pub fn remove_meta_blk(&self, name: &str) -> Result<()> {
        let mut blobs = self.blobs.lock();
        blobs.remove(name);
        self.persist_locked(&blobs)
    }

    #[must_use]
    pub fn read_meta_blk(&self, name: &str) -> Option<Vec<u8>> {
        self.blobs.lock().get(name).cloned()
    }

    fn persist_locked(&self, blobs: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let mut needed = META_HEADER_SIZE + META_CRC_SIZE;
        for (name, blob) in blobs {
            needed += 2 + name.len() + 4 + blob.len();
        }
        if needed > self.region_size {
            return Err(StrataError::OutOfResource("meta region full"));
        }

        let mut region = vec![0_u8; self.region_size];
        put_le_u32(&mut region, 0, META_MAGIC);
        put_le_u16(&mut region, 4, META_VERSION);
        put_le_u16(&mut region, 6, blobs.len() as u16);

        let mut cursor = META_HEADER_SIZE;
        for (name, blob) in blobs {
            put_le_u16(&mut region, cursor, name.len() as u16);
            cursor += 2;
            region[cursor..cursor + name.len()].copy_from_slice(name.as_bytes());
            cursor += name.len();
            put_le_u32(&mut region, cursor, blob.len() as u32);
            cursor += 4;
            region[cursor..cursor + blob.len()].copy_from_slice(blob);
            cursor += blob.len();
        }
        let crc = crc32c::crc32c(&region[..cursor]);
        put_le_u32(&mut region, cursor, crc);

        debug!(
            target: "strata::meta",
            num_records = blobs.len(),
            used_bytes = cursor + META_CRC_SIZE,
            "meta_region_persist"
        );
        self.pdev.write_super_block(&region, self.region_offset)
    }
}

impl std::fmt::Debug for MetaService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaService")
            .field("num_blobs", &self.blobs.lock().len())
            .field("num_handlers", &self.handlers.lock().len())
            .field("replayed", &self.replayed.load(Ordering::Relaxed))
            .finish()
    }
}
