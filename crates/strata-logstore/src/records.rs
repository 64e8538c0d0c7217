//! Log record wire codec.
//!
//! Record layout:
//!
//! ```text
//! +------------------+--------+
//! | major            | 2 bytes|
//! | minor            | 2 bytes|
//! | type             | 1 byte |
//! | reserved         | 1 byte |
//! | user_header_size | 2 bytes|
//! | key_size         | 2 bytes|
//! | payload_size     | 4 bytes|
//! | crc32c           | 4 bytes| over the record with this field zeroed
//! | store_id         | 4 bytes|
//! | lsn              | 8 bytes|
//! +------------------+--------+
//! | user_header      | N bytes|
//! | key              | M bytes|
//! | payload_or_blkid | P bytes|
//! +------------------+--------+
//! ```
//!
//! `type == LargeData` marks a payload slot carrying a serialized block
//! identifier instead of inline bytes; the bytes themselves live in the
//! block data service.

use strata_types::{
    put_le_u16, put_le_u32, put_le_u64, read_le_u16, read_le_u32, read_le_u64, Lsn, StoreId,
};

pub const LOG_RECORD_MAJOR: u16 = 1;
pub const LOG_RECORD_MINOR: u16 = 0;

/// Fixed header size preceding the three variable sections.
pub const RECORD_HEADER_SIZE: usize = 30;

const OFF_MAJOR: usize = 0;
const OFF_MINOR: usize = 2;
const OFF_TYPE: usize = 4;
const OFF_HEADER_SIZE: usize = 6;
const OFF_KEY_SIZE: usize = 8;
const OFF_PAYLOAD_SIZE: usize = 10;
const OFF_CRC: usize = 14;
const OFF_STORE_ID: usize = 18;
const OFF_LSN: usize = 22;

/// Record type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Payload bytes are inline.
    Inline = 0,
    /// Payload slot carries a serialized block id; the data was written
    /// out-of-line to the block data service.
    LargeData = 1,
}

impl RecordType {
    fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Inline),
            1 => Some(Self::LargeData),
            _ => None,
        }
    }
}

/// A log record as the caller sees it: opaque header, key, and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub rtype: RecordType,
    pub user_header: Vec<u8>,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

impl LogRecord {
    #[must_use]
    pub fn inline(user_header: Vec<u8>, key: Vec<u8>, payload: Vec<u8>) -> Self {
        Self {
            rtype: RecordType::Inline,
            user_header,
            key,
            payload,
        }
    }

    #[must_use]
    pub fn large_data(user_header: Vec<u8>, key: Vec<u8>, blkid: Vec<u8>) -> Self {
        Self {
            rtype: RecordType::LargeData,
            user_header,
            key,
            payload: blkid,
        }
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.user_header.len() + self.key.len() + self.payload.len()
    }
}

/// A record stamped with its family envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopedRecord {
    pub store_id: StoreId,
    pub lsn: Lsn,
    pub record: LogRecord,
}

/// Encode one record with its envelope.
#[must_use]
pub fn encode_record(store_id: StoreId, lsn: Lsn, record: &LogRecord) -> Vec<u8> {
    let mut buf = vec![0_u8; record.encoded_len()];
    put_le_u16(&mut buf, OFF_MAJOR, LOG_RECORD_MAJOR);
    put_le_u16(&mut buf, OFF_MINOR, LOG_RECORD_MINOR);
    buf[OFF_TYPE] = record.rtype as u8;
    put_le_u16(&mut buf, OFF_HEADER_SIZE, record.user_header.len() as u16);
    put_le_u16(&mut buf, OFF_KEY_SIZE, record.key.len() as u16);
    put_le_u32(&mut buf, OFF_PAYLOAD_SIZE, record.payload.len() as u32);
    put_le_u32(&mut buf, OFF_STORE_ID, store_id.0);
    put_le_u64(&mut buf, OFF_LSN, lsn.0);

    let mut cursor = RECORD_HEADER_SIZE;
    buf[cursor..cursor + record.user_header.len()].copy_from_slice(&record.user_header);
    cursor += record.user_header.len();
    buf[cursor..cursor + record.key.len()].copy_from_slice(&record.key);
    cursor += record.key.len();
    buf[cursor..cursor + record.payload.len()].copy_from_slice(&record.payload);

    let crc = crc32c::crc32c(&buf);
    put_le_u32(&mut buf, OFF_CRC, crc);
    buf
}

/// Outcome of decoding one record from a byte stream.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A record and the bytes it consumed.
    Record(EnvelopedRecord, usize),
    /// The buffer ends mid-record.
    Truncated,
    /// The bytes are not a valid record (bad CRC, bad type tag).
    Corrupt(&'static str),
    /// The record's major version is from a future format.
    VersionMismatch(u16),
}

/// Decode one record from the front of `data`.
#[must_use]
pub fn decode_record(data: &[u8]) -> DecodeOutcome {
    if data.len() < RECORD_HEADER_SIZE {
        return DecodeOutcome::Truncated;
    }
    let Ok(major) = read_le_u16(data, OFF_MAJOR) else {
        return DecodeOutcome::Truncated;
    };
    if major != LOG_RECORD_MAJOR {
        return DecodeOutcome::VersionMismatch(major);
    }
    let Some(rtype) = RecordType::from_wire(data[OFF_TYPE]) else {
        return DecodeOutcome::Corrupt("unknown record type tag");
    };

    let header_size = read_le_u16(data, OFF_HEADER_SIZE).unwrap_or(0) as usize;
    let key_size = read_le_u16(data, OFF_KEY_SIZE).unwrap_or(0) as usize;
    let payload_size = read_le_u32(data, OFF_PAYLOAD_SIZE).unwrap_or(0) as usize;
    let total = RECORD_HEADER_SIZE + header_size + key_size + payload_size;
    if data.len() < total {
        return DecodeOutcome::Truncated;
    }

    let stored_crc = match read_le_u32(data, OFF_CRC) {
        Ok(v) => v,
        Err(_) => return DecodeOutcome::Truncated,
    };
    let mut scratch = data[..total].to_vec();
    put_le_u32(&mut scratch, OFF_CRC, 0);
    if crc32c::crc32c(&scratch) != stored_crc {
        return DecodeOutcome::Corrupt("record crc mismatch");
    }

    let store_id = StoreId(read_le_u32(data, OFF_STORE_ID).unwrap_or(0));
    let lsn = Lsn(read_le_u64(data, OFF_LSN).unwrap_or(0));

    let mut cursor = RECORD_HEADER_SIZE;
    let user_header = data[cursor..cursor + header_size].to_vec();
    cursor += header_size;
    let key = data[cursor..cursor + key_size].to_vec();
    cursor += key_size;
    let payload = data[cursor..cursor + payload_size].to_vec();

    DecodeOutcome::Record(
        EnvelopedRecord {
            store_id,
            lsn,
            record: LogRecord {
                rtype,
                user_header,
                key,
                payload,
            },
        },
        total,
    )
}
