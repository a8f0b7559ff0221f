//! On-disk framing for the log store.
//!
//! ```text
//! [store header: 64 bytes]
//! [record header: 24 bytes][body] [record header][body] ...
//! ```
//!
//! Record header layout (little-endian):
//!
//! | offset | size | field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 4    | body length                            |
//! | 4      | 4    | CRC32 of bytes 0..4, 8..24 and body    |
//! | 8      | 1    | record kind                            |
//! | 9      | 3    | padding                                |
//! | 12     | 8    | insertion sequence (inserts only)      |
//! | 20     | 4    | reserved                               |

use crc32fast::Hasher;

use crate::item::{Item, ItemFlags};
use crate::{Error, Result};

pub const STORE_HEADER_SIZE: usize = 64;
pub const STORE_MAGIC: u32 = 0x4452_5131; // 'DRQ1'
pub const STORE_VERSION: u32 = 1;

pub const RECORD_HEADER_SIZE: usize = 24;
pub const LEN_OFFSET: usize = 0;
pub const CRC_OFFSET: usize = 4;
pub const KIND_OFFSET: usize = 8;
pub const SEQ_OFFSET: usize = 12;

pub const MAX_NAME_LEN: usize = u16::MAX as usize;
const INSERT_FIXED_LEN: usize = 2 + 2 + 8 + 4 + 4;
pub const MAX_DATA_LEN: usize = u32::MAX as usize - INSERT_FIXED_LEN - 2 * MAX_NAME_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHeader {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
}

impl StoreHeader {
    pub fn current() -> Self {
        Self {
            magic: STORE_MAGIC,
            version: STORE_VERSION,
            flags: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; STORE_HEADER_SIZE] {
        let mut buf = [0u8; STORE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    /// Parses and validates a store header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STORE_HEADER_SIZE {
            return Err(Error::Corrupt("store header truncated"));
        }
        let magic = read_u32(bytes, 0);
        let version = read_u32(bytes, 4);
        let flags = read_u32(bytes, 8);
        if magic != STORE_MAGIC {
            return Err(Error::Corrupt("store magic mismatch"));
        }
        if version != STORE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        Ok(Self {
            magic,
            version,
            flags,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Insert = 1,
    Delete = 2,
    SetTtl = 3,
}

impl RecordKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordKind::Insert),
            2 => Some(RecordKind::Delete),
            3 => Some(RecordKind::SetTtl),
            _ => None,
        }
    }
}

/// A record to be appended, borrowing its fields.
#[derive(Debug, Clone, Copy)]
pub enum RecordRef<'a> {
    Insert {
        seq: u64,
        queue: &'a str,
        item: &'a Item,
    },
    Delete {
        uuid: &'a str,
    },
    SetTtl {
        uuid: &'a str,
        ttl: f64,
    },
}

/// A record read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Insert { seq: u64, queue: String, item: Item },
    Delete { uuid: String },
    SetTtl { uuid: String, ttl: f64 },
}

/// Checks an item against the field limits before anything is written.
pub fn validate_insert(queue: &str, item: &Item) -> Result<()> {
    check_name("queue name", queue)?;
    check_name("uuid", &item.uuid)?;
    if item.data.len() > MAX_DATA_LEN {
        return Err(Error::FieldTooLarge {
            field: "data",
            max: MAX_DATA_LEN,
        });
    }
    Ok(())
}

fn check_name(field: &'static str, value: &str) -> Result<()> {
    if value.len() > MAX_NAME_LEN {
        return Err(Error::FieldTooLarge {
            field,
            max: MAX_NAME_LEN,
        });
    }
    Ok(())
}

impl RecordRef<'_> {
    fn kind(&self) -> RecordKind {
        match self {
            RecordRef::Insert { .. } => RecordKind::Insert,
            RecordRef::Delete { .. } => RecordKind::Delete,
            RecordRef::SetTtl { .. } => RecordKind::SetTtl,
        }
    }

    /// Appends the framed record to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        match *self {
            RecordRef::Insert { queue, item, .. } => validate_insert(queue, item)?,
            RecordRef::Delete { uuid } | RecordRef::SetTtl { uuid, .. } => check_name("uuid", uuid)?,
        }

        let start = buf.len();
        buf.resize(start + RECORD_HEADER_SIZE, 0);

        let seq = match *self {
            RecordRef::Insert { seq, queue, item } => {
                put_str(buf, queue);
                put_str(buf, &item.uuid);
                buf.extend_from_slice(&item.ttl.to_le_bytes());
                buf.extend_from_slice(&item.flags.bits().to_le_bytes());
                buf.extend_from_slice(&(item.data.len() as u32).to_le_bytes());
                buf.extend_from_slice(&item.data);
                seq
            }
            RecordRef::Delete { uuid } => {
                put_str(buf, uuid);
                0
            }
            RecordRef::SetTtl { uuid, ttl } => {
                put_str(buf, uuid);
                buf.extend_from_slice(&ttl.to_le_bytes());
                0
            }
        };

        let body_len = (buf.len() - start - RECORD_HEADER_SIZE) as u32;
        let header = &mut buf[start..start + RECORD_HEADER_SIZE];
        header[LEN_OFFSET..LEN_OFFSET + 4].copy_from_slice(&body_len.to_le_bytes());
        header[KIND_OFFSET] = self.kind() as u8;
        header[SEQ_OFFSET..SEQ_OFFSET + 8].copy_from_slice(&seq.to_le_bytes());
        let crc = record_crc(&buf[start..start + RECORD_HEADER_SIZE], &buf[start + RECORD_HEADER_SIZE..]);
        buf[start + CRC_OFFSET..start + CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(())
    }
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

pub fn record_crc(header: &[u8], body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&header[LEN_OFFSET..LEN_OFFSET + 4]);
    hasher.update(&header[KIND_OFFSET..RECORD_HEADER_SIZE]);
    hasher.update(body);
    hasher.finalize()
}

/// Result of scanning the record area of a store.
#[derive(Debug)]
pub struct Scan {
    pub records: Vec<Record>,
    /// Offset just past the last intact record.
    pub valid_end: usize,
    /// Why the scan stopped early, if it did.
    pub torn: Option<&'static str>,
}

/// Decodes records from a whole store image (header included).
///
/// Scanning stops at a truncated last record, or a last record that fails its
/// checksum; everything before it is returned. A checksum failure with more
/// bytes after it, or a record that passes its checksum but cannot be
/// decoded, is reported as corruption.
pub fn scan(bytes: &[u8]) -> Result<Scan> {
    let mut records = Vec::new();
    let mut offset = STORE_HEADER_SIZE;
    let torn = loop {
        let remaining = bytes.len().saturating_sub(offset);
        if remaining == 0 {
            break None;
        }
        if remaining < RECORD_HEADER_SIZE {
            break Some("truncated record header");
        }
        let header = &bytes[offset..offset + RECORD_HEADER_SIZE];
        let body_len = read_u32(header, LEN_OFFSET) as usize;
        if body_len > remaining - RECORD_HEADER_SIZE {
            break Some("truncated record body");
        }
        let body_start = offset + RECORD_HEADER_SIZE;
        let body = &bytes[body_start..body_start + body_len];
        if read_u32(header, CRC_OFFSET) != record_crc(header, body) {
            if body_start + body_len < bytes.len() {
                return Err(Error::Corrupt("record checksum mismatch before end of store"));
            }
            break Some("record checksum mismatch");
        }
        let kind = RecordKind::from_u8(header[KIND_OFFSET])
            .ok_or(Error::Corrupt("unknown record kind"))?;
        let seq = read_u64(header, SEQ_OFFSET);
        records.push(decode_body(kind, seq, body)?);
        offset = body_start + body_len;
    };

    Ok(Scan {
        records,
        valid_end: offset,
        torn,
    })
}

fn decode_body(kind: RecordKind, seq: u64, body: &[u8]) -> Result<Record> {
    let mut reader = BodyReader { buf: body, pos: 0 };
    let record = match kind {
        RecordKind::Insert => {
            let queue = reader.string()?;
            let uuid = reader.string()?;
            let ttl = reader.f64()?;
            let flags = ItemFlags::from_bits_retain(reader.u32()?);
            let data_len = reader.u32()? as usize;
            let data = reader.bytes(data_len)?.to_vec();
            Record::Insert {
                seq,
                queue,
                item: Item {
                    uuid,
                    data,
                    ttl,
                    flags,
                },
            }
        }
        RecordKind::Delete => Record::Delete {
            uuid: reader.string()?,
        },
        RecordKind::SetTtl => {
            let uuid = reader.string()?;
            let ttl = reader.f64()?;
            Record::SetTtl { uuid, ttl }
        }
    };
    if reader.pos != body.len() {
        return Err(Error::Corrupt("trailing bytes in record body"));
    }
    Ok(record)
}

struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(Error::Corrupt("record body too short"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        let raw = self.bytes(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(read_u32(self.bytes(4)?, 0))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(read_u64(self.bytes(8)?, 0)))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| Error::Corrupt("record string is not utf-8"))
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("slice length"))
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().expect("slice length"))
}
