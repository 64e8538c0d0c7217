//! On-disk super-block layouts.
//!
//! Every physical device carries, before its data region:
//!
//! ```text
//!  ______________   ____________________________________________________
//! |              | |                  |                    |            |
//! |  First block | |  VDev info table | Chunk bitmap+table | Meta region|
//! |______________| |__________________|____________________|____________|
//! ```
//!
//! All structures are serialized field by field into aligned byte
//! buffers; nothing is transmuted in place. The first block is padded to
//! the device's atomic write size and checksummed with CRC32-IEEE over
//! its atomic prefix; vdev and chunk records carry a CRC16-T10DIF over
//! their own bytes.

use crc::{Crc, CRC_16_T10_DIF, CRC_32_ISO_HDLC};
use strata_types::{
    ensure_slice, put_le_u16, put_le_u32, put_le_u64, put_nul_padded, read_fixed, read_le_u16,
    read_le_u32, read_le_u64, round_up, trim_nul_padded, ChunkId, ParseError, PdevId,
    PlacementPolicy, VdevId, INVALID_ID32,
};

/// 8-byte magic at offset 0 of every formatted device.
pub const STRATA_MAGIC: u64 = u64::from_le_bytes(*b"STRATBLK");

/// First-block structure version. Older on-disk versions are a hard
/// error; there is no in-place upgrade.
pub const CURRENT_VERSION: u32 = 1;

pub const PRODUCT_NAME: &str = "StrataStore";
pub const PRODUCT_NAME_SIZE: usize = 64;

/// The checksummed prefix of the first block. Must stay within the
/// smallest atomic write unit any supported device offers.
pub const ATOMIC_FB_SIZE: usize = 512;

pub const VDEV_NAME_SIZE: usize = 64;
pub const VDEV_CONTEXT_SIZE: usize = 512;
/// Serialized size of one [`VdevInfo`] record.
pub const VDEV_INFO_SIZE: usize = 608;

/// Serialized size of one [`ChunkInfo`] record.
pub const CHUNK_INFO_SIZE: usize = 44;

/// Capacity reserved for the meta-block region, before page rounding.
pub const META_REGION_CAPACITY: usize = 64 * 1024;

const CRC32_IEEE: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_T10_DIF);

// First-block field offsets.
const FB_MAGIC: usize = 0;
const FB_CHECKSUM: usize = 8;
const FB_VERSION: usize = 12;
const FB_GEN_NUMBER: usize = 16;
const FB_PRODUCT_NAME: usize = 24;
const FB_SYSTEM_UUID: usize = 88;
const FB_NUM_PDEVS: usize = 104;
const FB_MAX_VDEVS: usize = 108;
const FB_MAX_CHUNKS: usize = 112;
const FB_PDEV_ID: usize = 116;
const FB_DATA_OFFSET: usize = 120;
const FB_DATA_SIZE: usize = 128;
const FB_ALIGN_SIZE: usize = 136;
const FB_ATOMIC_PAGE_SIZE: usize = 140;
const FB_MIRROR_SB: usize = 144;
const FB_END: usize = 145;

/// Parsed first block of a physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstBlock {
    pub version: u32,
    pub gen_number: u64,
    pub product_name: String,
    pub system_uuid: [u8; 16],
    pub num_pdevs: u32,
    pub max_vdevs: u32,
    pub max_chunks: u32,
    pub pdev_id: PdevId,
    /// Start of the data region (everything before it is super-block).
    pub data_offset: u64,
    /// Usable data bytes past `data_offset`.
    pub data_size: u64,
    pub align_size: u32,
    pub atomic_page_size: u32,
    /// Super-block region mirrored at the end of the device (HDD media).
    pub mirror_super_block: bool,
}

impl FirstBlock {
    /// Serialize into a buffer of `page_size` bytes (the device's atomic
    /// write granularity), computing the checksum last.
    #[must_use]
    pub fn serialize(&self, page_size: usize) -> Vec<u8> {
        debug_assert!(page_size >= ATOMIC_FB_SIZE && FB_END <= ATOMIC_FB_SIZE);
        let mut buf = vec![0_u8; page_size];
        put_le_u64(&mut buf, FB_MAGIC, STRATA_MAGIC);
        // Checksum slot stays zero until the end.
        put_le_u32(&mut buf, FB_VERSION, self.version);
        put_le_u64(&mut buf, FB_GEN_NUMBER, self.gen_number);
        put_nul_padded(&mut buf, FB_PRODUCT_NAME, PRODUCT_NAME_SIZE, &self.product_name);
        buf[FB_SYSTEM_UUID..FB_SYSTEM_UUID + 16].copy_from_slice(&self.system_uuid);
        put_le_u32(&mut buf, FB_NUM_PDEVS, self.num_pdevs);
        put_le_u32(&mut buf, FB_MAX_VDEVS, self.max_vdevs);
        put_le_u32(&mut buf, FB_MAX_CHUNKS, self.max_chunks);
        put_le_u32(&mut buf, FB_PDEV_ID, self.pdev_id.0);
        put_le_u64(&mut buf, FB_DATA_OFFSET, self.data_offset);
        put_le_u64(&mut buf, FB_DATA_SIZE, self.data_size);
        put_le_u32(&mut buf, FB_ALIGN_SIZE, self.align_size);
        put_le_u32(&mut buf, FB_ATOMIC_PAGE_SIZE, self.atomic_page_size);
        buf[FB_MIRROR_SB] = u8::from(self.mirror_super_block);

        let crc = CRC32_IEEE.checksum(&buf[..ATOMIC_FB_SIZE]);
        put_le_u32(&mut buf, FB_CHECKSUM, crc);
        buf
    }

    /// Probe a raw buffer for a first block.
    ///
    /// Returns `Ok(None)` when no magic is present (unformatted device),
    /// an error when the magic is present but the block is torn or from
    /// an unsupported version, and the parsed block otherwise.
    pub fn probe(data: &[u8]) -> Result<Option<Self>, ParseError> {
        let magic = read_le_u64(data, FB_MAGIC)?;
        if magic != STRATA_MAGIC {
            return Ok(None);
        }

        let atomic = ensure_slice(data, 0, ATOMIC_FB_SIZE)?;
        let stored_crc = read_le_u32(atomic, FB_CHECKSUM)?;
        let mut scratch = atomic.to_vec();
        put_le_u32(&mut scratch, FB_CHECKSUM, 0);
        let computed = CRC32_IEEE.checksum(&scratch);
        if computed != stored_crc {
            return Err(ParseError::ChecksumMismatch {
                expected: u64::from(stored_crc),
                actual: u64::from(computed),
            });
        }

        Ok(Some(Self {
            version: read_le_u32(data, FB_VERSION)?,
            gen_number: read_le_u64(data, FB_GEN_NUMBER)?,
            product_name: trim_nul_padded(ensure_slice(data, FB_PRODUCT_NAME, PRODUCT_NAME_SIZE)?),
            system_uuid: read_fixed::<16>(data, FB_SYSTEM_UUID)?,
            num_pdevs: read_le_u32(data, FB_NUM_PDEVS)?,
            max_vdevs: read_le_u32(data, FB_MAX_VDEVS)?,
            max_chunks: read_le_u32(data, FB_MAX_CHUNKS)?,
            pdev_id: PdevId(read_le_u32(data, FB_PDEV_ID)?),
            data_offset: read_le_u64(data, FB_DATA_OFFSET)?,
            data_size: read_le_u64(data, FB_DATA_SIZE)?,
            align_size: read_le_u32(data, FB_ALIGN_SIZE)?,
            atomic_page_size: read_le_u32(data, FB_ATOMIC_PAGE_SIZE)?,
            mirror_super_block: data
                .get(FB_MIRROR_SB)
                .copied()
                .ok_or(ParseError::InsufficientData {
                    needed: 1,
                    offset: FB_MIRROR_SB,
                    actual: data.len(),
                })?
                != 0,
        }))
    }
}

// VDev record field offsets.
const VI_VDEV_ID: usize = 0;
const VI_VDEV_SIZE: usize = 4;
const VI_BLK_SIZE: usize = 12;
const VI_NUM_MIRRORS: usize = 16;
const VI_NUM_PRIMARY: usize = 20;
const VI_PLACEMENT: usize = 24;
const VI_ALLOC_TYPE: usize = 25;
const VI_CHUNK_SEL: usize = 26;
const VI_SLOT_ALLOCATED: usize = 27;
const VI_NAME: usize = 28;
const VI_CONTEXT_SIZE: usize = 92;
const VI_CONTEXT: usize = 94;
const VI_CHECKSUM: usize = 606;

/// One slot of the vdev info table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VdevInfo {
    pub vdev_id: VdevId,
    pub vdev_size: u64,
    pub blk_size: u32,
    /// Total copies of each primary chunk (0 for unmirrored placement).
    pub num_mirrors: u32,
    pub num_primary_chunks: u32,
    pub placement: PlacementPolicy,
    pub alloc_type: u8,
    pub chunk_sel: u8,
    pub slot_allocated: bool,
    pub name: String,
    /// User-opaque context blob, at most [`VDEV_CONTEXT_SIZE`] bytes.
    pub context: Vec<u8>,
}

impl VdevInfo {
    pub fn serialize(&self) -> Result<[u8; VDEV_INFO_SIZE], ParseError> {
        if self.context.len() > VDEV_CONTEXT_SIZE {
            return Err(ParseError::InvalidField {
                field: "context",
                reason: "user context blob exceeds slot capacity",
            });
        }

        let mut buf = [0_u8; VDEV_INFO_SIZE];
        put_le_u32(&mut buf, VI_VDEV_ID, self.vdev_id.0);
        put_le_u64(&mut buf, VI_VDEV_SIZE, self.vdev_size);
        put_le_u32(&mut buf, VI_BLK_SIZE, self.blk_size);
        put_le_u32(&mut buf, VI_NUM_MIRRORS, self.num_mirrors);
        put_le_u32(&mut buf, VI_NUM_PRIMARY, self.num_primary_chunks);
        buf[VI_PLACEMENT] = self.placement.to_wire();
        buf[VI_ALLOC_TYPE] = self.alloc_type;
        buf[VI_CHUNK_SEL] = self.chunk_sel;
        buf[VI_SLOT_ALLOCATED] = u8::from(self.slot_allocated);
        put_nul_padded(&mut buf, VI_NAME, VDEV_NAME_SIZE, &self.name);
        put_le_u16(&mut buf, VI_CONTEXT_SIZE, self.context.len() as u16);
        buf[VI_CONTEXT..VI_CONTEXT + self.context.len()].copy_from_slice(&self.context);

        let crc = CRC16.checksum(&buf[..VI_CHECKSUM]);
        put_le_u16(&mut buf, VI_CHECKSUM, crc);
        Ok(buf)
    }

    /// Deserialize one slot, verifying its CRC when the slot carries one.
    pub fn deserialize(data: &[u8]) -> Result<Self, ParseError> {
        let slot = ensure_slice(data, 0, VDEV_INFO_SIZE)?;
        let stored_crc = read_le_u16(slot, VI_CHECKSUM)?;
        if stored_crc != 0 {
            let computed = CRC16.checksum(&slot[..VI_CHECKSUM]);
            if computed != stored_crc {
                return Err(ParseError::ChecksumMismatch {
                    expected: u64::from(stored_crc),
                    actual: u64::from(computed),
                });
            }
        }

        let context_size = usize::from(read_le_u16(slot, VI_CONTEXT_SIZE)?);
        if context_size > VDEV_CONTEXT_SIZE {
            return Err(ParseError::InvalidField {
                field: "context_size",
                reason: "exceeds slot capacity",
            });
        }

        Ok(Self {
            vdev_id: VdevId(read_le_u32(slot, VI_VDEV_ID)?),
            vdev_size: read_le_u64(slot, VI_VDEV_SIZE)?,
            blk_size: read_le_u32(slot, VI_BLK_SIZE)?,
            num_mirrors: read_le_u32(slot, VI_NUM_MIRRORS)?,
            num_primary_chunks: read_le_u32(slot, VI_NUM_PRIMARY)?,
            placement: PlacementPolicy::from_wire(slot[VI_PLACEMENT])?,
            alloc_type: slot[VI_ALLOC_TYPE],
            chunk_sel: slot[VI_CHUNK_SEL],
            slot_allocated: slot[VI_SLOT_ALLOCATED] != 0,
            name: trim_nul_padded(&slot[VI_NAME..VI_NAME + VDEV_NAME_SIZE]),
            context: slot[VI_CONTEXT..VI_CONTEXT + context_size].to_vec(),
        })
    }
}

// Chunk record field offsets.
const CI_CHUNK_ID: usize = 0;
const CI_PDEV_ID: usize = 4;
const CI_VDEV_ID: usize = 8;
const CI_START_OFFSET: usize = 12;
const CI_SIZE: usize = 20;
const CI_PRIMARY: usize = 28;
const CI_PREV: usize = 32;
const CI_NEXT: usize = 36;
const CI_SLOT_ALLOCATED: usize = 40;
const CI_IS_SB_CHUNK: usize = 41;
const CI_CHECKSUM: usize = 42;

/// One slot of a pdev's chunk table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub chunk_id: ChunkId,
    pub pdev_id: PdevId,
    /// Owning vdev, or [`VdevId::INVALID`] when free.
    pub vdev_id: VdevId,
    pub start_offset: u64,
    pub size: u64,
    /// Valid when this chunk mirrors another chunk.
    pub primary_chunk_id: ChunkId,
    pub prev_chunk_id: ChunkId,
    pub next_chunk_id: ChunkId,
    pub slot_allocated: bool,
    pub is_sb_chunk: bool,
}

impl ChunkInfo {
    #[must_use]
    pub fn new_free(chunk_id: ChunkId, pdev_id: PdevId, start_offset: u64, size: u64) -> Self {
        Self {
            chunk_id,
            pdev_id,
            vdev_id: VdevId::INVALID,
            start_offset,
            size,
            primary_chunk_id: ChunkId::INVALID,
            prev_chunk_id: ChunkId::INVALID,
            next_chunk_id: ChunkId::INVALID,
            slot_allocated: true,
            is_sb_chunk: false,
        }
    }

    #[must_use]
    pub fn serialize(&self) -> [u8; CHUNK_INFO_SIZE] {
        let mut buf = [0_u8; CHUNK_INFO_SIZE];
        put_le_u32(&mut buf, CI_CHUNK_ID, self.chunk_id.0);
        put_le_u32(&mut buf, CI_PDEV_ID, self.pdev_id.0);
        put_le_u32(&mut buf, CI_VDEV_ID, self.vdev_id.0);
        put_le_u64(&mut buf, CI_START_OFFSET, self.start_offset);
        put_le_u64(&mut buf, CI_SIZE, self.size);
        put_le_u32(&mut buf, CI_PRIMARY, self.primary_chunk_id.0);
        put_le_u32(&mut buf, CI_PREV, self.prev_chunk_id.0);
        put_le_u32(&mut buf, CI_NEXT, self.next_chunk_id.0);
        buf[CI_SLOT_ALLOCATED] = u8::from(self.slot_allocated);
        buf[CI_IS_SB_CHUNK] = u8::from(self.is_sb_chunk);

        let crc = CRC16.checksum(&buf[..CI_CHECKSUM]);
        put_le_u16(&mut buf, CI_CHECKSUM, crc);
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, ParseError> {
        let slot = ensure_slice(data, 0, CHUNK_INFO_SIZE)?;
        let stored_crc = read_le_u16(slot, CI_CHECKSUM)?;
        if stored_crc != 0 {
            let computed = CRC16.checksum(&slot[..CI_CHECKSUM]);
            if computed != stored_crc {
                return Err(ParseError::ChecksumMismatch {
                    expected: u64::from(stored_crc),
                    actual: u64::from(computed),
                });
            }
        }

        Ok(Self {
            chunk_id: ChunkId(read_le_u32(slot, CI_CHUNK_ID)?),
            pdev_id: PdevId(read_le_u32(slot, CI_PDEV_ID)?),
            vdev_id: VdevId(read_le_u32(slot, CI_VDEV_ID)?),
            start_offset: read_le_u64(slot, CI_START_OFFSET)?,
            size: read_le_u64(slot, CI_SIZE)?,
            primary_chunk_id: ChunkId(read_le_u32(slot, CI_PRIMARY)?),
            prev_chunk_id: ChunkId(read_le_u32(slot, CI_PREV)?),
            next_chunk_id: ChunkId(read_le_u32(slot, CI_NEXT)?),
            slot_allocated: slot[CI_SLOT_ALLOCATED] != 0,
            is_sb_chunk: slot[CI_IS_SB_CHUNK] != 0,
        })
    }

    /// A chunk is busy when a vdev owns it or it hosts super-block data.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.vdev_id.0 != INVALID_ID32 || self.is_sb_chunk
    }
}

/// Byte offsets of every super-block region, derived from the system
/// limits and the device's atomic page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlkLayout {
    pub page_size: u64,
    pub max_vdevs: u32,
    pub max_chunks: u32,
    pub vdev_region_offset: u64,
    pub vdev_region_size: u64,
    pub chunk_region_offset: u64,
    pub chunk_bitmap_size: u64,
    pub chunk_region_size: u64,
    pub meta_region_offset: u64,
    pub meta_region_size: u64,
    /// Total super-block footprint; the data region starts here.
    pub total_size: u64,
}

impl SuperBlkLayout {
    #[must_use]
    pub fn new(max_vdevs: u32, max_chunks: u32, page_size: u32) -> Self {
        let page = u64::from(page_size);
        let vdev_region_offset = page;
        let vdev_region_size = round_up(u64::from(max_vdevs) * VDEV_INFO_SIZE as u64, page);
        let chunk_region_offset = vdev_region_offset + vdev_region_size;
        let chunk_bitmap_size = u64::from(max_chunks).div_ceil(8);
        let chunk_region_size = round_up(
            chunk_bitmap_size + u64::from(max_chunks) * CHUNK_INFO_SIZE as u64,
            page,
        );
        let meta_region_offset = chunk_region_offset + chunk_region_size;
        let meta_region_size = round_up(META_REGION_CAPACITY as u64, page);
        let total_size = meta_region_offset + meta_region_size;
        Self {
            page_size: page,
            max_vdevs,
            max_chunks,
            vdev_region_offset,
            vdev_region_size,
            chunk_region_offset,
            chunk_bitmap_size,
            chunk_region_size,
            meta_region_offset,
            meta_region_size,
            total_size,
        }
    }

    #[must_use]
    pub fn vdev_slot_offset(&self, vdev_id: VdevId) -> u64 {
        self.vdev_region_offset + u64::from(vdev_id.0) * VDEV_INFO_SIZE as u64
    }

    #[must_use]
    pub fn chunk_bitmap_offset(&self) -> u64 {
        self.chunk_region_offset
    }

    #[must_use]
    pub fn chunk_slot_offset(&self, chunk_id: ChunkId) -> u64 {
        self.chunk_region_offset + self.chunk_bitmap_size + u64::from(chunk_id.0) * CHUNK_INFO_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_first_block() -> FirstBlock {
        FirstBlock {
            version: CURRENT_VERSION,
            gen_number: 3,
            product_name: PRODUCT_NAME.to_owned(),
            system_uuid: [0xAB; 16],
            num_pdevs: 2,
            max_vdevs: 16,
            max_chunks: 128,
            pdev_id: PdevId(1),
            data_offset: 1 << 20,
            data_size: (1 << 30) - (1 << 20),
            align_size: 512,
            atomic_page_size: 4096,
            mirror_super_block: false,
        }
    }

    #[test]
    fn first_block_roundtrip() {
        let fb = sample_first_block();
        let buf = fb.serialize(4096);
        assert_eq!(buf.len(), 4096);
        let parsed = FirstBlock::probe(&buf).unwrap().unwrap();
        assert_eq!(parsed, fb);
    }

    #[test]
    fn first_block_absent_magic() {
        let buf = vec![0_u8; 4096];
        assert_eq!(FirstBlock::probe(&buf).unwrap(), None);
    }

    #[test]
    fn first_block_torn_write_detected() {
        let fb = sample_first_block();
        let mut buf = fb.serialize(4096);
        buf[FB_GEN_NUMBER] ^= 0xFF;
        assert!(matches!(
            FirstBlock::probe(&buf),
            Err(ParseError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn vdev_info_roundtrip() {
        let vi = VdevInfo {
            vdev_id: VdevId(3),
            vdev_size: 512 << 20,
            blk_size: 4096,
            num_mirrors: 0,
            num_primary_chunks: 2,
            placement: PlacementPolicy::Striped,
            alloc_type: 1,
            chunk_sel: 0,
            slot_allocated: true,
            name: "data_log".to_owned(),
            context: vec![1, 2, 3, 4],
        };
        let buf = vi.serialize().unwrap();
        let parsed = VdevInfo::deserialize(&buf).unwrap();
        assert_eq!(parsed, vi);
    }

    #[test]
    fn vdev_info_crc_corruption_detected() {
        let vi = VdevInfo {
            vdev_id: VdevId(0),
            vdev_size: 1 << 20,
            blk_size: 512,
            num_mirrors: 2,
            num_primary_chunks: 1,
            placement: PlacementPolicy::Mirrored,
            alloc_type: 0,
            chunk_sel: 0,
            slot_allocated: true,
            name: "idx".to_owned(),
            context: Vec::new(),
        };
        let mut buf = vi.serialize().unwrap();
        buf[VI_VDEV_SIZE] ^= 0x01;
        assert!(matches!(
            VdevInfo::deserialize(&buf),
            Err(ParseError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn vdev_info_oversize_context_rejected() {
        let vi = VdevInfo {
            vdev_id: VdevId(0),
            vdev_size: 1 << 20,
            blk_size: 512,
            num_mirrors: 0,
            num_primary_chunks: 1,
            placement: PlacementPolicy::SinglePdev,
            alloc_type: 0,
            chunk_sel: 0,
            slot_allocated: true,
            name: "x".to_owned(),
            context: vec![0; VDEV_CONTEXT_SIZE + 1],
        };
        assert!(vi.serialize().is_err());
    }

    #[test]
    fn chunk_info_roundtrip() {
        let ci = ChunkInfo {
            chunk_id: ChunkId(7),
            pdev_id: PdevId(1),
            vdev_id: VdevId(2),
            start_offset: 128 << 20,
            size: 128 << 20,
            primary_chunk_id: ChunkId(5),
            prev_chunk_id: ChunkId(6),
            next_chunk_id: ChunkId::INVALID,
            slot_allocated: true,
            is_sb_chunk: false,
        };
        let buf = ci.serialize();
        assert_eq!(ChunkInfo::deserialize(&buf).unwrap(), ci);
        assert!(ci.is_busy());

        let free = ChunkInfo::new_free(ChunkId(9), PdevId(0), 0, 1 << 20);
        assert!(!free.is_busy());
    }

    #[test]
    fn layout_regions_are_page_aligned_and_disjoint() {
        let layout = SuperBlkLayout::new(16, 128, 4096);
        assert_eq!(layout.vdev_region_offset % 4096, 0);
        assert_eq!(layout.chunk_region_offset % 4096, 0);
        assert_eq!(layout.meta_region_offset % 4096, 0);
        assert!(layout.vdev_region_offset + layout.vdev_region_size <= layout.chunk_region_offset);
        assert!(layout.chunk_region_offset + layout.chunk_region_size <= layout.meta_region_offset);
        assert_eq!(
            layout.total_size,
            layout.meta_region_offset + layout.meta_region_size
        );
        // Slot offsets land inside their regions.
        assert!(layout.vdev_slot_offset(VdevId(15)) + VDEV_INFO_SIZE as u64
            <= layout.chunk_region_offset);
        assert!(layout.chunk_slot_offset(ChunkId(127)) + CHUNK_INFO_SIZE as u64
            <= layout.meta_region_offset);
    }
}
