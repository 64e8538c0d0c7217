#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Sentinel for "no id" in on-wire u32 id fields.
pub const INVALID_ID32: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PdevId(pub u32);

impl PdevId {
    pub const INVALID: Self = Self(INVALID_ID32);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != INVALID_ID32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub u32);

impl ChunkId {
    pub const INVALID: Self = Self(INVALID_ID32);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != INVALID_ID32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VdevId(pub u32);

impl VdevId {
    pub const INVALID: Self = Self(INVALID_ID32);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != INVALID_ID32
    }
}

/// Opaque log store identifier, stable across restarts within a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreId(pub u32);

/// Log sequence number. Monotonic per log store; assigned at enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Checkpoint identifier. Monotonic across the engine lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CpId(pub u64);

/// Byte offset on a physical device (pread/pwrite semantics).
///
/// Unit-carrying wrapper to prevent mixing bytes with block addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Device tier used for vdev placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DevTier {
    Data,
    Fast,
}

/// Open mode for a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoFlag {
    Buffered,
    Direct,
    ReadOnly,
}

/// VDev placement policy across physical devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementPolicy {
    /// Primary chunks spread round-robin across all pdevs of the tier.
    Striped,
    /// Every primary chunk replicated on each pdev of the tier.
    Mirrored,
    /// All chunks on the first pdev of the tier.
    SinglePdev,
}

impl PlacementPolicy {
    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Striped => 0,
            Self::Mirrored => 1,
            Self::SinglePdev => 2,
        }
    }

    pub fn from_wire(tag: u8) -> Result<Self, ParseError> {
        match tag {
            0 => Ok(Self::Striped),
            1 => Ok(Self::Mirrored),
            2 => Ok(Self::SinglePdev),
            _ => Err(ParseError::InvalidField {
                field: "placement",
                reason: "unknown policy tag",
            }),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u64, actual: u64 },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn put_le_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_le_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_le_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Copy `src` into a fixed-size NUL-padded field at `offset`, truncating
/// over-length input at the field boundary.
pub fn put_nul_padded(buf: &mut [u8], offset: usize, len: usize, src: &str) {
    let field = &mut buf[offset..offset + len];
    field.fill(0);
    let bytes = src.as_bytes();
    let copy = bytes.len().min(len);
    field[..copy].copy_from_slice(&bytes[..copy]);
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Round `value` up to the next multiple of `multiple` (which must be > 0).
#[must_use]
pub fn round_up(value: u64, multiple: u64) -> u64 {
    debug_assert!(multiple > 0);
    value.div_ceil(multiple) * multiple
}

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

/// Engine-wide tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Period between automatic checkpoint triggers.
    pub cp_timer: Duration,
    /// Checkpoint watchdog sample period.
    pub cp_watchdog_timer: Duration,
    /// Honor the `Direct` open flag on rotational media.
    pub direct_io_mode: bool,
    /// Maximum vdev slots in the system super-block.
    pub max_vdevs: u32,
    /// Maximum chunk slots across the system.
    pub max_chunks: u32,
    /// Super-block write granularity; also the first-block padded size.
    pub atomic_phys_page_size: u32,
    /// Accumulated-byte high-water mark that triggers a log flush.
    pub flush_threshold_bytes: usize,
    /// Periodic log flush timer.
    pub flush_timer: Duration,
    /// Rolling log write buffer size, in multiples of the vdev block size.
    pub flush_multiple: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cp_timer: Duration::from_millis(60_000),
            cp_watchdog_timer: Duration::from_secs(30),
            direct_io_mode: false,
            max_vdevs: 16,
            max_chunks: 128,
            atomic_phys_page_size: 4096,
            flush_threshold_bytes: 64 * 1024,
            flush_timer: Duration::from_millis(500),
            flush_multiple: 16,
        }
    }
}

impl EngineConfig {
    pub fn validate(self) -> Result<Self, ParseError> {
        if self.max_vdevs == 0 || self.max_chunks == 0 {
            return Err(ParseError::InvalidField {
                field: "max_vdevs/max_chunks",
                reason: "must be > 0",
            });
        }
        if !self.atomic_phys_page_size.is_power_of_two() || self.atomic_phys_page_size < 512 {
            return Err(ParseError::InvalidField {
                field: "atomic_phys_page_size",
                reason: "must be a power of two >= 512",
            });
        }
        if self.flush_multiple == 0 {
            return Err(ParseError::InvalidField {
                field: "flush_multiple",
                reason: "must be > 0",
            });
        }
        if self.cp_timer.is_zero() || self.cp_watchdog_timer.is_zero() || self.flush_timer.is_zero()
        {
            return Err(ParseError::InvalidField {
                field: "timers",
                reason: "must be > 0",
            });
        }
        Ok(self)
    }
}

impl fmt::Display for PdevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VdevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_roundtrip() {
        let mut buf = vec![0_u8; 16];
        put_le_u16(&mut buf, 0, 0xBEEF);
        put_le_u32(&mut buf, 2, 0xDEAD_BEEF);
        put_le_u64(&mut buf, 6, 0x0123_4567_89AB_CDEF);
        assert_eq!(read_le_u16(&buf, 0).unwrap(), 0xBEEF);
        assert_eq!(read_le_u32(&buf, 2).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_le_u64(&buf, 6).unwrap(), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn ensure_slice_bounds() {
        let buf = [0_u8; 4];
        assert!(ensure_slice(&buf, 0, 4).is_ok());
        assert!(matches!(
            ensure_slice(&buf, 2, 4),
            Err(ParseError::InsufficientData { .. })
        ));
        assert!(ensure_slice(&buf, usize::MAX, 2).is_err());
    }

    #[test]
    fn nul_padded_roundtrip() {
        let mut buf = vec![0xFF_u8; 16];
        put_nul_padded(&mut buf, 0, 16, "strata");
        assert_eq!(trim_nul_padded(&buf[..16]), "strata");

        put_nul_padded(&mut buf, 0, 4, "overlong");
        assert_eq!(&buf[..4], b"over");
    }

    #[test]
    fn round_up_multiples() {
        assert_eq!(round_up(0, 4), 0);
        assert_eq!(round_up(1, 4), 4);
        assert_eq!(round_up(4, 4), 4);
        assert_eq!(round_up(9, 4), 12);
    }

    #[test]
    fn sentinel_ids() {
        assert!(!ChunkId::INVALID.is_valid());
        assert!(ChunkId(0).is_valid());
        assert!(!VdevId::INVALID.is_valid());
    }

    #[test]
    fn config_validation() {
        assert!(EngineConfig::default().validate().is_ok());

        let bad = EngineConfig {
            atomic_phys_page_size: 1000,
            ..EngineConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = EngineConfig {
            flush_multiple: 0,
            ..EngineConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
