//! Device manager: discovers raw devices, formats or loads the
//! persistent topology, allocates chunks, and assembles virtual devices.
//!
//! Ownership: the manager exclusively owns every pdev and chunk. Virtual
//! devices borrow chunks; the manager decides their lifetime. One mutex
//! guards all topology mutations; reads go through copy-on-write dense
//! tables published with `ArcSwap`, so id lookups never lock.

use crate::chunk::Chunk;
use crate::pdev::PhysicalDev;
use crate::superblock::{
    ChunkInfo, FirstBlock, SuperBlkLayout, VdevInfo, CHUNK_INFO_SIZE, CURRENT_VERSION,
    PRODUCT_NAME, VDEV_INFO_SIZE,
};
use crate::vdev::VirtualDev;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use strata_error::{Result, StrataError};
use strata_types::{
    round_up, ChunkId, DevTier, EngineConfig, IoFlag, PdevId, PlacementPolicy, VdevId,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Id bitmap
// ---------------------------------------------------------------------------

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Allocation bitmap over dense ids with a rotating start hint, so a
/// freed id is not handed out again until the space wraps.
#[derive(Debug)]
struct IdBitmap {
    bits: Vec<u8>,
    capacity: u32,
    next_hint: u32,
}

impl IdBitmap {
    fn new(capacity: u32) -> Self {
        Self {
            bits: vec![0_u8; capacity.div_ceil(8) as usize],
            capacity,
            next_hint: 0,
        }
    }

    fn alloc(&mut self) -> Option<u32> {
        for probe in 0..self.capacity {
            let idx = (self.next_hint + probe) % self.capacity;
            if !bitmap_get(&self.bits, idx) {
                bitmap_set(&mut self.bits, idx);
                self.next_hint = (idx + 1) % self.capacity;
                return Some(idx);
            }
        }
        None
    }

    fn set(&mut self, idx: u32) {
        bitmap_set(&mut self.bits, idx);
    }

    fn clear(&mut self, idx: u32) {
        bitmap_clear(&mut self.bits, idx);
    }
}

// ---------------------------------------------------------------------------
// Input descriptors
// ---------------------------------------------------------------------------

/// Description of one raw device/file handed to the manager.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub path: PathBuf,
    /// Device size; 0 means "use the existing file size".
    pub size: u64,
    pub tier: DevTier,
    /// Rotational media mirrors its super-block and defaults to
    /// buffered I/O.
    pub rotational: bool,
    /// Concurrent write streams the device sustains.
    pub num_streams: u32,
}

impl DeviceSpec {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            tier: DevTier::Data,
            rotational: false,
            num_streams: 1,
        }
    }

    #[must_use]
    pub fn with_tier(mut self, tier: DevTier) -> Self {
        self.tier = tier;
        self
    }

    #[must_use]
    pub fn rotational(mut self, rotational: bool) -> Self {
        self.rotational = rotational;
        self
    }
}

/// Allocator kind recorded in the vdev table for the upper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AllocKind {
    Append = 0,
    Bitmap = 1,
}

/// Parameters for [`DeviceManager::create_vdev`].
#[derive(Debug, Clone)]
pub struct VdevParams {
    pub name: String,
    pub vdev_size: u64,
    pub blk_size: u32,
    /// Requested chunk count; rounded up to satisfy the placement.
    pub num_chunks: u32,
    pub placement: PlacementPolicy,
    pub tier: DevTier,
    pub alloc_kind: AllocKind,
    pub context: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Device manager
// ---------------------------------------------------------------------------

type Table<T> = ArcSwap<Vec<Option<Arc<T>>>>;

pub struct DeviceManager {
    config: EngineConfig,
    io_flag: IoFlag,
    specs: Vec<DeviceSpec>,
    layout: SuperBlkLayout,
    first_time_boot: bool,
    boot_gen: u64,
    system_uuid: Mutex<[u8; 16]>,

    /// Guards every topology mutation. Lookups never take it.
    topology: Mutex<TopologyState>,
    pdevs: Table<PhysicalDev>,
    chunks: Table<Chunk>,
    vdevs: Table<VirtualDev>,
    pdevs_by_tier: Mutex<HashMap<DevTier, Vec<PdevId>>>,
}

struct TopologyState {
    vdev_bm: IdBitmap,
    chunk_bm: IdBitmap,
}

impl DeviceManager {
    /// Probe all devices and prepare a manager. Whether this is a
    /// first-time boot is decided here, by the absence of any valid
    /// first block.
    pub fn new(specs: Vec<DeviceSpec>, config: EngineConfig, io_flag: IoFlag) -> Result<Arc<Self>> {
        let config = config
            .validate()
            .map_err(|e| StrataError::InvalidArgument(e.to_string()))?;
        if specs.is_empty() {
            return Err(StrataError::InvalidArgument(
                "at least one device is required".to_owned(),
            ));
        }

        let layout = SuperBlkLayout::new(
            config.max_vdevs,
            config.max_chunks,
            config.atomic_phys_page_size,
        );

        let mut first_time_boot = true;
        let mut boot_gen = 0_u64;
        for spec in &specs {
            if let Some(fb) = PhysicalDev::probe_first_block(&spec.path, &config)? {
                first_time_boot = false;
                boot_gen = boot_gen.max(fb.gen_number);
            }
        }

        info!(
            target: "strata::device::manager",
            num_devices = specs.len(),
            first_time_boot,
            boot_gen,
            "device_manager_probe"
        );

        let max_chunks = config.max_chunks;
        let max_vdevs = config.max_vdevs;
        Ok(Arc::new(Self {
            config,
            io_flag,
            layout,
            first_time_boot,
            boot_gen,
            system_uuid: Mutex::new([0; 16]),
            topology: Mutex::new(TopologyState {
                vdev_bm: IdBitmap::new(max_vdevs),
                chunk_bm: IdBitmap::new(max_chunks),
            }),
            pdevs: ArcSwap::from_pointee(vec![None; specs.len()]),
            chunks: ArcSwap::from_pointee(vec![None; max_chunks as usize]),
            vdevs: ArcSwap::from_pointee(vec![None; max_vdevs as usize]),
            pdevs_by_tier: Mutex::new(HashMap::new()),
            specs,
        }))
    }

    #[must_use]
    pub fn is_first_time_boot(&self) -> bool {
        self.first_time_boot
    }

    #[must_use]
    pub fn system_uuid(&self) -> [u8; 16] {
        *self.system_uuid.lock()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stamp every device with a fresh system identity and an empty
    /// topology. First-time boot only.
    pub fn format_devices(&self) -> Result<()> {
        let uuid = *Uuid::new_v4().as_bytes();
        let gen_number = self.boot_gen + 1;
        *self.system_uuid.lock() = uuid;

        for (idx, spec) in self.specs.iter().enumerate() {
            let pdev = self.format_one(spec, PdevId(idx as u32), uuid, gen_number)?;
            self.register_pdev(pdev, spec.tier);
        }
        info!(
            target: "strata::device::manager",
            num_pdevs = self.specs.len(),
            gen_number,
            "format_complete"
        );
        Ok(())
    }

    fn format_one(
        &self,
        spec: &DeviceSpec,
        pdev_id: PdevId,
        uuid: [u8; 16],
        gen_number: u64,
    ) -> Result<Arc<PhysicalDev>> {
        let sb_footprint = self.layout.total_size * if spec.rotational { 2 } else { 1 };
        let dev_size = if spec.size != 0 {
            spec.size
        } else {
            std::fs::metadata(&spec.path)
                .map(|m| m.len())
                .unwrap_or(0)
        };
        if dev_size < sb_footprint + self.layout.page_size {
            return Err(StrataError::DeviceFormat(format!(
                "{}: device too small for the super-block: size={dev_size} needed>{sb_footprint}",
                spec.path.display()
            )));
        }

        let data_offset = self.layout.total_size;
        let data_size = dev_size - data_offset - if spec.rotational {
            self.layout.total_size
        } else {
            0
        };

        let fb = FirstBlock {
            version: CURRENT_VERSION,
            gen_number,
            product_name: PRODUCT_NAME.to_owned(),
            system_uuid: uuid,
            num_pdevs: self.specs.len() as u32,
            max_vdevs: self.config.max_vdevs,
            max_chunks: self.config.max_chunks,
            pdev_id,
            data_offset,
            data_size,
            align_size: 512,
            atomic_page_size: self.config.atomic_phys_page_size,
            mirror_super_block: spec.rotational,
        };

        let pdev = PhysicalDev::open(&spec.path, self.io_flag, fb.clone(), &self.config, spec.num_streams)?;
        info!(
            target: "strata::device::manager",
            dev = %spec.path.display(),
            pdev_id = pdev_id.0,
            dev_size,
            data_offset,
            "formatting_device"
        );

        // Zero the vdev, chunk, and meta regions before stamping the
        // first block, so a crash mid-format leaves no magic behind.
        let zero_span = (self.layout.total_size - self.layout.vdev_region_offset) as usize;
        let zeros = crate::AlignedBuf::zeroed(zero_span, fb.align_size as usize);
        pdev.write_super_block(zeros.as_slice(), self.layout.vdev_region_offset)?;
        pdev.write_super_block(&fb.serialize(self.layout.page_size as usize), 0)?;
        Ok(Arc::new(pdev))
    }

    /// Load a previously formatted topology. Hard-fails when the device
    /// set does not match what was formatted.
    pub fn load_devices(&self) -> Result<()> {
        let mut blocks = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let fb = PhysicalDev::probe_first_block(&spec.path, &self.config)?.ok_or_else(|| {
                StrataError::DeviceFormat(format!(
                    "{}: no valid first block; the system was formatted with a different device set",
                    spec.path.display()
                ))
            })?;
            blocks.push(fb);
        }

        let head = &blocks[0];
        if head.version != CURRENT_VERSION {
            return Err(StrataError::DeviceFormat(format!(
                "super-block version {} is not supported (current {CURRENT_VERSION}); no in-place upgrade",
                head.version
            )));
        }
        if head.num_pdevs != self.specs.len() as u32 {
            return Err(StrataError::DeviceFormat(format!(
                "formatted with {} devices but restarted with {}; dynamic add/remove is unsupported",
                head.num_pdevs,
                self.specs.len()
            )));
        }
        if head.max_vdevs != self.config.max_vdevs
            || head.max_chunks != self.config.max_chunks
            || head.atomic_page_size != self.config.atomic_phys_page_size
        {
            // The super-block region offsets derive from these limits;
            // a mismatch would mis-address every record.
            return Err(StrataError::DeviceFormat(format!(
                "system limits changed since format: on-disk max_vdevs={} max_chunks={} page={} vs configured {}/{}/{}",
                head.max_vdevs,
                head.max_chunks,
                head.atomic_page_size,
                self.config.max_vdevs,
                self.config.max_chunks,
                self.config.atomic_phys_page_size
            )));
        }
        for (spec, fb) in self.specs.iter().zip(&blocks) {
            if fb.system_uuid != head.system_uuid {
                return Err(StrataError::DeviceFormat(format!(
                    "{}: system uuid differs from the rest of the set; device belongs to another system",
                    spec.path.display()
                )));
            }
        }
        *self.system_uuid.lock() = head.system_uuid;

        for (spec, fb) in self.specs.iter().zip(blocks) {
            let pdev = Arc::new(PhysicalDev::open(
                &spec.path,
                self.io_flag,
                fb,
                &self.config,
                spec.num_streams,
            )?);
            info!(
                target: "strata::device::manager",
                dev = %spec.path.display(),
                pdev_id = pdev.pdev_id().0,
                "loading_device"
            );
            self.register_pdev(pdev, spec.tier);
        }

        self.load_vdevs()?;
        self.load_chunks()?;
        Ok(())
    }

    fn register_pdev(&self, pdev: Arc<PhysicalDev>, tier: DevTier) {
        let id = pdev.pdev_id();
        let mut table = (**self.pdevs.load()).clone();
        if table.len() <= id.0 as usize {
            table.resize(id.0 as usize + 1, None);
        }
        table[id.0 as usize] = Some(pdev);
        self.pdevs.store(Arc::new(table));
        self.pdevs_by_tier.lock().entry(tier).or_default().push(id);
    }

    fn load_vdevs(&self) -> Result<()> {
        let mut topo = self.topology.lock();
        let pdev = self.get_pdev(PdevId(0)).ok_or_else(|| {
            StrataError::DeviceFormat("pdev 0 missing after load".to_owned())
        })?;

        let mut region = vec![0_u8; self.layout.vdev_region_size as usize];
        pdev.read_super_block(&mut region, self.layout.vdev_region_offset)?;

        for slot in 0..self.config.max_vdevs {
            let off = slot as usize * VDEV_INFO_SIZE;
            let bytes = &region[off..off + VDEV_INFO_SIZE];
            if bytes.iter().all(|b| *b == 0) {
                continue;
            }
            let vinfo = VdevInfo::deserialize(bytes).map_err(|e| {
                error!(
                    target: "strata::device::manager",
                    vdev_slot = slot,
                    error = %e,
                    "vdev_record_corrupt"
                );
                StrataError::DeviceFormat(format!("vdev record {slot}: {e}"))
            })?;
            if !vinfo.slot_allocated {
                continue;
            }
            debug!(
                target: "strata::device::manager",
                vdev_id = vinfo.vdev_id.0,
                name = %vinfo.name,
                size = vinfo.vdev_size,
                "vdev_loaded"
            );
            topo.vdev_bm.set(vinfo.vdev_id.0);
            self.publish_vdev(vinfo.vdev_id, Some(Arc::new(VirtualDev::new(vinfo))));
        }
        Ok(())
    }

    fn load_chunks(&self) -> Result<()> {
        let mut topo = self.topology.lock();
        for pdev in self.pdevs() {
            let mut bitmap = vec![0_u8; self.layout.chunk_bitmap_size as usize];
            pdev.read_super_block(&mut bitmap, self.layout.chunk_bitmap_offset())?;

            for slot in 0..self.config.max_chunks {
                if !bitmap_get(&bitmap, slot) {
                    continue;
                }
                let mut rec = vec![0_u8; CHUNK_INFO_SIZE];
                pdev.read_super_block(&mut rec, self.layout.chunk_slot_offset(ChunkId(slot)))?;
                let cinfo = ChunkInfo::deserialize(&rec).map_err(|e| {
                    StrataError::DeviceFormat(format!(
                        "{}: chunk record {slot}: {e}",
                        pdev.name()
                    ))
                })?;
                if !cinfo.slot_allocated {
                    warn!(
                        target: "strata::device::manager",
                        dev = %pdev.name(),
                        chunk_slot = slot,
                        "chunk_bitmap_set_but_slot_free"
                    );
                    continue;
                }

                // Crash window: chunk written, owning vdev record never
                // made it. Drop the chunk so the upper layer can retry
                // the vdev creation.
                if cinfo.vdev_id.is_valid() && self.get_vdev(cinfo.vdev_id).is_none() {
                    warn!(
                        target: "strata::device::manager",
                        chunk_id = cinfo.chunk_id.0,
                        vdev_id = cinfo.vdev_id.0,
                        "dangling_chunk_ignored"
                    );
                    continue;
                }

                let chunk = Arc::new(Chunk::new(Arc::clone(&pdev), cinfo));
                topo.chunk_bm.set(cinfo.chunk_id.0);
                self.publish_chunk(cinfo.chunk_id, Some(Arc::clone(&chunk)));
                if let Some(vdev) = cinfo.vdev_id.is_valid().then(|| self.get_vdev(cinfo.vdev_id)).flatten() {
                    vdev.add_chunk(chunk, false);
                }
            }
        }
        Ok(())
    }

    // -- lock-free lookups --------------------------------------------------

    #[must_use]
    pub fn get_pdev(&self, id: PdevId) -> Option<Arc<PhysicalDev>> {
        self.pdevs.load().get(id.0 as usize)?.clone()
    }

    #[must_use]
    pub fn get_chunk(&self, id: ChunkId) -> Option<Arc<Chunk>> {
        if !id.is_valid() {
            return None;
        }
        self.chunks.load().get(id.0 as usize)?.clone()
    }

    #[must_use]
    pub fn get_vdev(&self, id: VdevId) -> Option<Arc<VirtualDev>> {
        if !id.is_valid() {
            return None;
        }
        self.vdevs.load().get(id.0 as usize)?.clone()
    }

    #[must_use]
    pub fn get_vdev_by_name(&self, name: &str) -> Option<Arc<VirtualDev>> {
        self.vdevs
            .load()
            .iter()
            .flatten()
            .find(|v| v.name() == name)
            .cloned()
    }

    #[must_use]
    pub fn pdevs(&self) -> Vec<Arc<PhysicalDev>> {
        self.pdevs.load().iter().flatten().cloned().collect()
    }

    #[must_use]
    pub fn vdevs(&self) -> Vec<Arc<VirtualDev>> {
        self.vdevs.load().iter().flatten().cloned().collect()
    }

    #[must_use]
    pub fn total_capacity(&self, tier: DevTier) -> u64 {
        self.tier_pdevs(tier).iter().map(|p| p.data_size()).sum()
    }

    /// The device hosting the meta-block region.
    pub fn meta_pdev(&self) -> Result<Arc<PhysicalDev>> {
        self.get_pdev(PdevId(0))
            .ok_or_else(|| StrataError::NotFound("pdev 0".to_owned()))
    }

    #[must_use]
    pub fn layout(&self) -> &SuperBlkLayout {
        &self.layout
    }

    fn tier_pdevs(&self, tier: DevTier) -> Vec<Arc<PhysicalDev>> {
        let by_tier = self.pdevs_by_tier.lock();
        let ids = by_tier
            .get(&tier)
            .filter(|v| !v.is_empty())
            .or_else(|| by_tier.get(&DevTier::Data));
        ids.map(|ids| ids.iter().filter_map(|id| self.get_pdev(*id)).collect())
            .unwrap_or_default()
    }

    fn publish_chunk(&self, id: ChunkId, chunk: Option<Arc<Chunk>>) {
        let mut table = (**self.chunks.load()).clone();
        if table.len() <= id.0 as usize {
            table.resize(id.0 as usize + 1, None);
        }
        table[id.0 as usize] = chunk;
        self.chunks.store(Arc::new(table));
    }

    fn publish_vdev(&self, id: VdevId, vdev: Option<Arc<VirtualDev>>) {
        let mut table = (**self.vdevs.load()).clone();
        if table.len() <= id.0 as usize {
            table.resize(id.0 as usize + 1, None);
        }
        table[id.0 as usize] = vdev;
        self.vdevs.store(Arc::new(table));
    }

    // -- vdev creation ------------------------------------------------------

    /// Create a virtual device, carving chunks across the chosen tier
    /// and persisting the records. `num_chunks` and `vdev_size` are
    /// rounded up to the nearest layout-satisfying multiples.
    pub fn create_vdev(&self, mut params: VdevParams) -> Result<Arc<VirtualDev>> {
        let mut topo = self.topology.lock();

        let vdev_id = VdevId(
            topo.vdev_bm
                .alloc()
                .ok_or(StrataError::OutOfResource("no free vdev slot"))?,
        );

        let mut pdevs = self.tier_pdevs(params.tier);
        if pdevs.is_empty() {
            topo.vdev_bm.clear(vdev_id.0);
            return Err(StrataError::OutOfResource("no pdevs available in any tier"));
        }

        // Round the chunk count up to what the placement needs.
        let num_mirrors;
        match params.placement {
            PlacementPolicy::Striped => {
                let total_streams: u32 = pdevs.iter().map(|p| p.num_streams()).sum();
                params.num_chunks =
                    round_up(u64::from(params.num_chunks.max(1)), u64::from(total_streams)) as u32;
                num_mirrors = 0;
            }
            PlacementPolicy::Mirrored => {
                let streams = pdevs[0].num_streams();
                let primaries =
                    round_up(u64::from(params.num_chunks.max(1)), u64::from(streams)) as u32;
                params.num_chunks = primaries * pdevs.len() as u32;
                num_mirrors = pdevs.len() as u32;
            }
            PlacementPolicy::SinglePdev => {
                pdevs.truncate(1);
                params.num_chunks = params.num_chunks.max(1);
                num_mirrors = 0;
            }
        }

        let input_size = params.vdev_size;
        params.vdev_size = round_up(
            params.vdev_size,
            u64::from(params.num_chunks) * u64::from(params.blk_size),
        );
        let chunk_size = params.vdev_size / u64::from(params.num_chunks);
        if input_size != params.vdev_size {
            info!(
                target: "strata::device::manager",
                name = %params.name,
                requested = input_size,
                adjusted = params.vdev_size,
                "vdev_size_rounded"
            );
        }

        // Stripe width for striped placement; replicated-set width for
        // mirrored placement.
        let num_primary_chunks = match params.placement {
            PlacementPolicy::Striped => pdevs.len() as u32,
            PlacementPolicy::Mirrored => params.num_chunks / pdevs.len() as u32,
            PlacementPolicy::SinglePdev => 1,
        };

        let vinfo = VdevInfo {
            vdev_id,
            vdev_size: params.vdev_size,
            blk_size: params.blk_size,
            num_mirrors,
            num_primary_chunks,
            placement: params.placement,
            alloc_type: params.alloc_kind as u8,
            chunk_sel: 0,
            slot_allocated: true,
            name: params.name.clone(),
            context: params.context.clone(),
        };
        let vdev = Arc::new(VirtualDev::new(vinfo.clone()));

        info!(
            target: "strata::device::manager",
            name = %params.name,
            vdev_id = vdev_id.0,
            vdev_size = params.vdev_size,
            num_chunks = params.num_chunks,
            chunk_size,
            placement = ?params.placement,
            num_pdevs = pdevs.len(),
            "creating_vdev"
        );

        // Carve stripe by stripe, cycling the pdevs within each stripe.
        // Chunk ids are handed out in carve order and the vdev orders
        // its stripes by chunk id, so consecutive stripes land on
        // distinct devices. For mirrored placement, pdev 0 hosts the
        // stripe's primary and every other pdev a replica of it.
        let per_pdev = params.num_chunks / pdevs.len() as u32;
        let mut created: Vec<Arc<Chunk>> = Vec::with_capacity(params.num_chunks as usize);
        let mut result: Result<()> = Ok(());

        'carve: for _stripe in 0..per_pdev {
            let mut stripe_primary = ChunkId::INVALID;
            for (pdev_idx, pdev) in pdevs.iter().enumerate() {
                let primary = if params.placement == PlacementPolicy::Mirrored && pdev_idx > 0 {
                    stripe_primary
                } else {
                    ChunkId::INVALID
                };
                match self.alloc_chunk_locked(&mut topo, pdev, vdev_id, chunk_size, primary) {
                    Ok(chunk) => {
                        if pdev_idx == 0 {
                            stripe_primary = chunk.chunk_id();
                        }
                        created.push(chunk);
                    }
                    Err(e) => {
                        result = Err(e);
                        break 'carve;
                    }
                }
            }
        }

        if let Err(e) = result {
            // Roll the partial carve back; the on-disk records written so
            // far describe chunks pointing at a vdev that will never be
            // persisted, which load_devices ignores by design.
            for chunk in created {
                self.free_chunk_locked(&mut topo, &chunk)?;
            }
            topo.vdev_bm.clear(vdev_id.0);
            return Err(e);
        }

        for chunk in &created {
            vdev.add_chunk(Arc::clone(chunk), true);
        }

        // Persist the vdev record last: chunks-then-vdev ordering is what
        // makes the dangling-chunk recovery path safe.
        let record = vinfo
            .serialize()
            .map_err(|e| StrataError::InvalidArgument(e.to_string()))?;
        for pdev in self.pdevs() {
            pdev.write_super_block(&record, self.layout.vdev_slot_offset(vdev_id))?;
        }

        self.publish_vdev(vdev_id, Some(Arc::clone(&vdev)));
        info!(
            target: "strata::device::manager",
            name = %params.name,
            vdev_id = vdev_id.0,
            "vdev_created"
        );
        Ok(vdev)
    }

    /// Allocate one chunk of `size` bytes on `pdev`, preferring the
    /// best-fitting free chunk and splitting it when oversized; falls
    /// back to carving fresh space past the last chunk.
    fn alloc_chunk_locked(
        &self,
        topo: &mut TopologyState,
        pdev: &Arc<PhysicalDev>,
        vdev_id: VdevId,
        size: u64,
        primary: ChunkId,
    ) -> Result<Arc<Chunk>> {
        let pdev_chunks = self.pdev_chunks_sorted(pdev.pdev_id());

        // Best-fit search over free chunks.
        let best_free = pdev_chunks
            .iter()
            .filter(|c| !c.is_busy() && c.size() >= size)
            .min_by_key(|c| c.size())
            .cloned();

        let chunk = if let Some(free) = best_free {
            if free.size() > size {
                self.split_free_chunk_locked(topo, pdev, &free, size)?;
            }
            free.set_vdev(vdev_id, primary);
            free
        } else {
            // Carve past the end of the last chunk.
            let data_end = pdev.data_offset() + pdev.data_size();
            let carve_start = pdev_chunks
                .last()
                .map_or(pdev.data_offset(), |c| c.start_offset() + c.size());
            if carve_start + size > data_end {
                return Err(StrataError::OutOfResource("no free space on pdev"));
            }
            let chunk_id = ChunkId(
                topo.chunk_bm
                    .alloc()
                    .ok_or(StrataError::OutOfResource("no free chunk slot"))?,
            );
            let mut cinfo = ChunkInfo::new_free(chunk_id, pdev.pdev_id(), carve_start, size);
            cinfo.vdev_id = vdev_id;
            cinfo.primary_chunk_id = primary;
            cinfo.prev_chunk_id = pdev_chunks.last().map_or(ChunkId::INVALID, |c| c.chunk_id());
            let chunk = Arc::new(Chunk::new(Arc::clone(pdev), cinfo));
            if let Some(prev) = pdev_chunks.last() {
                prev.set_next(chunk_id);
                self.write_chunk_record(prev)?;
            }
            self.publish_chunk(chunk_id, Some(Arc::clone(&chunk)));
            chunk
        };

        self.write_chunk_record(&chunk)?;
        self.write_chunk_bitmap(pdev)?;
        debug!(
            target: "strata::device::manager",
            chunk_id = chunk.chunk_id().0,
            pdev_id = pdev.pdev_id().0,
            vdev_id = vdev_id.0,
            size,
            "chunk_allocated"
        );
        Ok(chunk)
    }

    /// Shrink `free` down to `size` and create a fresh free chunk for
    /// the remainder, linked right after it.
    fn split_free_chunk_locked(
        &self,
        topo: &mut TopologyState,
        pdev: &Arc<PhysicalDev>,
        free: &Arc<Chunk>,
        size: u64,
    ) -> Result<()> {
        let remainder = free.size() - size;
        let rem_id = ChunkId(
            topo.chunk_bm
                .alloc()
                .ok_or(StrataError::OutOfResource("no free chunk slot"))?,
        );
        let mut rem_info =
            ChunkInfo::new_free(rem_id, pdev.pdev_id(), free.start_offset() + size, remainder);
        rem_info.prev_chunk_id = free.chunk_id();
        rem_info.next_chunk_id = free.next_chunk_id();
        let rem = Arc::new(Chunk::new(Arc::clone(pdev), rem_info));

        if let Some(next) = self.get_chunk(free.next_chunk_id()) {
            next.set_prev(rem_id);
            self.write_chunk_record(&next)?;
        }
        free.grow(size);
        free.set_next(rem_id);
        self.publish_chunk(rem_id, Some(Arc::clone(&rem)));
        self.write_chunk_record(&rem)?;
        Ok(())
    }

    /// Free a chunk and coalesce it with free neighbors on the same pdev.
    pub fn free_chunk(&self, chunk_id: ChunkId) -> Result<()> {
        let mut topo = self.topology.lock();
        let chunk = self
            .get_chunk(chunk_id)
            .ok_or_else(|| StrataError::NotFound(format!("chunk {chunk_id}")))?;
        self.free_chunk_locked(&mut topo, &chunk)
    }

    fn free_chunk_locked(&self, topo: &mut TopologyState, chunk: &Arc<Chunk>) -> Result<()> {
        chunk.set_free();

        // Merge a free predecessor into this chunk, then this chunk into
        // a free successor; each merge removes one record.
        if let Some(prev) = self.get_chunk(chunk.prev_chunk_id()) {
            if !prev.is_busy() {
                self.merge_into_locked(topo, &prev, chunk)?;
                // `chunk`'s slot was absorbed; continue from prev.
                return self.try_merge_next_locked(topo, &prev);
            }
        }
        self.write_chunk_record(chunk)?;
        self.try_merge_next_locked(topo, chunk)?;
        let pdev = Arc::clone(chunk.pdev());
        self.write_chunk_bitmap(&pdev)
    }

    fn try_merge_next_locked(&self, topo: &mut TopologyState, chunk: &Arc<Chunk>) -> Result<()> {
        if let Some(next) = self.get_chunk(chunk.next_chunk_id()) {
            if !next.is_busy() {
                self.merge_into_locked(topo, chunk, &next)?;
            }
        }
        let pdev = Arc::clone(chunk.pdev());
        self.write_chunk_bitmap(&pdev)
    }

    /// Absorb `victim` (the chunk right after `keeper`) into `keeper`.
    fn merge_into_locked(
        &self,
        topo: &mut TopologyState,
        keeper: &Arc<Chunk>,
        victim: &Arc<Chunk>,
    ) -> Result<()> {
        debug_assert_eq!(keeper.next_chunk_id(), victim.chunk_id());
        keeper.grow(keeper.size() + victim.size());
        keeper.set_next(victim.next_chunk_id());
        if let Some(after) = self.get_chunk(victim.next_chunk_id()) {
            after.set_prev(keeper.chunk_id());
            self.write_chunk_record(&after)?;
        }

        victim.free_slot();
        topo.chunk_bm.clear(victim.chunk_id().0);
        self.write_chunk_record(victim)?;
        self.publish_chunk(victim.chunk_id(), None);
        self.write_chunk_record(keeper)?;
        debug!(
            target: "strata::device::manager",
            keeper = keeper.chunk_id().0,
            victim = victim.chunk_id().0,
            merged_size = keeper.size(),
            "free_chunks_coalesced"
        );
        Ok(())
    }

    /// Free a vdev: return its chunks to the free pool and clear its
    /// table slot on every pdev.
    pub fn free_vdev(&self, vdev_id: VdevId) -> Result<()> {
        let vdev = self
            .get_vdev(vdev_id)
            .ok_or_else(|| StrataError::NotFound(format!("vdev {vdev_id}")))?;

        let mut topo = self.topology.lock();
        for chunk in vdev.chunks() {
            self.free_chunk_locked(&mut topo, &chunk)?;
        }

        let zero = [0_u8; VDEV_INFO_SIZE];
        for pdev in self.pdevs() {
            pdev.write_super_block(&zero, self.layout.vdev_slot_offset(vdev_id))?;
        }
        topo.vdev_bm.clear(vdev_id.0);
        self.publish_vdev(vdev_id, None);
        info!(
            target: "strata::device::manager",
            vdev_id = vdev_id.0,
            "vdev_freed"
        );
        Ok(())
    }

    /// Persist an updated user-context blob for a vdev.
    pub fn update_vdev_context(&self, vdev_id: VdevId, context: Vec<u8>) -> Result<()> {
        let vdev = self
            .get_vdev(vdev_id)
            .ok_or_else(|| StrataError::NotFound(format!("vdev {vdev_id}")))?;
        let _guard = self.topology.lock();
        vdev.set_context(context);
        let record = vdev
            .info()
            .serialize()
            .map_err(|e| StrataError::InvalidArgument(e.to_string()))?;
        for pdev in self.pdevs() {
            pdev.write_super_block(&record, self.layout.vdev_slot_offset(vdev_id))?;
        }
        Ok(())
    }

    // -- persistence helpers ------------------------------------------------

    fn pdev_chunks_sorted(&self, pdev_id: PdevId) -> Vec<Arc<Chunk>> {
        let mut chunks: Vec<Arc<Chunk>> = self
            .chunks
            .load()
            .iter()
            .flatten()
            .filter(|c| c.pdev_id() == pdev_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.start_offset());
        chunks
    }

    fn write_chunk_record(&self, chunk: &Arc<Chunk>) -> Result<()> {
        let record = chunk.info().serialize();
        chunk
            .pdev()
            .write_super_block(&record, self.layout.chunk_slot_offset(chunk.chunk_id()))
    }

    fn write_chunk_bitmap(&self, pdev: &Arc<PhysicalDev>) -> Result<()> {
        // The persisted bitmap covers the slots used on this pdev.
        let mut bitmap = vec![0_u8; self.layout.chunk_bitmap_size as usize];
        for chunk in self.chunks.load().iter().flatten() {
            if chunk.pdev_id() == pdev.pdev_id() && chunk.info().slot_allocated {
                bitmap_set(&mut bitmap, chunk.chunk_id().0);
            }
        }
        pdev.write_super_block(&bitmap, self.layout.chunk_bitmap_offset())
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("num_pdevs", &self.pdevs.load().iter().flatten().count())
            .field("num_vdevs", &self.vdevs.load().iter().flatten().count())
            .field("num_chunks", &self.chunks.load().iter().flatten().count())
            .field("first_time_boot", &self.first_time_boot)
            .finish()
    }
}
