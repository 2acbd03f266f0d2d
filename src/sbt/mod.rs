//! SBT, the self-describing binary trace container.
//!
//! An SBT file is a fixed 64-byte header followed by four sections whose
//! offsets the header records: capture metadata, the string table, the device
//! table and the event stream. All integers are little-endian. Event records
//! are variable length: a fixed header plus optional payload blocks, each
//! length-prefixed so readers can skip blocks they do not understand.

use std::io;

use thiserror::Error;

pub mod reader;
pub mod writer;

pub use reader::SbtReader;
pub use writer::SbtWriter;

/// `S B T \0`
pub const SBT_MAGIC: [u8; 4] = *b"SBT\0";
pub const SBT_VERSION_MAJOR: u16 = 1;
pub const SBT_VERSION_MINOR: u16 = 0;
pub const SBT_HEADER_SIZE: u32 = 64;

/// Header flag: file carries a string table.
pub const FLAG_HAS_STRING_TABLE: u32 = 1 << 0;
/// Header flag: the event stream is sorted by timestamp.
pub const FLAG_EVENTS_SORTED: u32 = 1 << 1;
/// All other header flag bits are reserved and written as zero.
pub const FLAG_KNOWN_MASK: u32 = FLAG_HAS_STRING_TABLE | FLAG_EVENTS_SORTED;

/// Per-event flag bits signalling which optional blocks follow the fixed
/// record header.
pub const EVENT_FLAG_KERNEL_PARAMS: u8 = 1 << 0;
pub const EVENT_FLAG_MEMORY_PARAMS: u8 = 1 << 1;
pub const EVENT_FLAG_CALL_STACK: u8 = 1 << 2;
pub const EVENT_FLAG_FLOW_INFO: u8 = 1 << 3;
pub const EVENT_FLAG_METADATA: u8 = 1 << 4;

/// Fixed part of one event record: kind, flags, ids, timing, name reference.
pub const EVENT_RECORD_HEADER_SIZE: usize = 1 + 1 + 4 + 4 + 8 + 4 + 8 + 8 + 4;

/// Metadata key used to preserve the numeric kind of event records whose kind
/// byte this reader version does not know.
pub const RAW_KIND_KEY: &str = "raw_kind";

#[derive(Debug, Error)]
pub enum SbtError {
    #[error("bad magic: {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unsupported SBT major version: {0}")]
    UnsupportedVersion(u16),
    #[error("bad header size: {0} (expected {SBT_HEADER_SIZE})")]
    BadHeaderSize(u32),
    #[error("truncated file while reading {0}")]
    Truncated(&'static str),
    #[error("section offset out of range: {section} at {offset:#x}, file is {file_size} bytes")]
    OffsetOutOfRange {
        section: &'static str,
        offset: u64,
        file_size: u64,
    },
    #[error("string table index {0} out of range")]
    BadStringRef(u32),
    #[error("invalid UTF-8 in string table entry {0}")]
    BadUtf8(u32),
    #[error("{0}")]
    InvalidState(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SbtError>;

/// Decoded file header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SbtHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: u32,
    pub event_count: u64,
    pub metadata_offset: u64,
    pub string_table_offset: u64,
    pub device_info_offset: u64,
    pub events_offset: u64,
}

impl SbtHeader {
    /// Serialise to the fixed 64-byte on-disk form.
    pub fn encode(&self) -> [u8; SBT_HEADER_SIZE as usize] {
        let mut buf = [0u8; SBT_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&SBT_MAGIC);
        buf[4..6].copy_from_slice(&self.version_major.to_le_bytes());
        buf[6..8].copy_from_slice(&self.version_minor.to_le_bytes());
        buf[8..12].copy_from_slice(&SBT_HEADER_SIZE.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..24].copy_from_slice(&self.event_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.metadata_offset.to_le_bytes());
        buf[32..40].copy_from_slice(&self.string_table_offset.to_le_bytes());
        buf[40..48].copy_from_slice(&self.device_info_offset.to_le_bytes());
        buf[48..56].copy_from_slice(&self.events_offset.to_le_bytes());
        // bytes 56..64 stay zero (reserved)
        buf
    }

    /// Parse and validate the fixed header. Version minor is informational;
    /// version major must match exactly.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SBT_HEADER_SIZE as usize {
            return Err(SbtError::Truncated("header"));
        }

        let magic = <[u8; 4]>::try_from(&buf[0..4]).unwrap();
        if magic != SBT_MAGIC {
            return Err(SbtError::BadMagic(magic));
        }

        let version_major = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version_major != SBT_VERSION_MAJOR {
            return Err(SbtError::UnsupportedVersion(version_major));
        }
        let version_minor = u16::from_le_bytes(buf[6..8].try_into().unwrap());

        let header_size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if header_size != SBT_HEADER_SIZE {
            return Err(SbtError::BadHeaderSize(header_size));
        }

        Ok(SbtHeader {
            version_major,
            version_minor,
            // Unknown flag bits are preserved but ignored.
            flags: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            event_count: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            metadata_offset: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            string_table_offset: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            device_info_offset: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            events_offset: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = SbtHeader {
            version_major: SBT_VERSION_MAJOR,
            version_minor: SBT_VERSION_MINOR,
            flags: FLAG_HAS_STRING_TABLE,
            event_count: 1234,
            metadata_offset: 64,
            string_table_offset: 128,
            device_info_offset: 512,
            events_offset: 1024,
        };
        let buf = header.encode();
        assert_eq!(buf.len(), 64);
        let decoded = SbtHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut buf = SbtHeader::default().encode();
        buf[0] = b'X';
        assert!(matches!(
            SbtHeader::decode(&buf),
            Err(SbtError::BadMagic(_))
        ));
    }

    #[test]
    fn test_header_rejects_wrong_major_version() {
        let header = SbtHeader {
            version_major: SBT_VERSION_MAJOR,
            ..Default::default()
        };
        let mut buf = header.encode();
        buf[4..6].copy_from_slice(&(SBT_VERSION_MAJOR + 1).to_le_bytes());
        assert!(matches!(
            SbtHeader::decode(&buf),
            Err(SbtError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_header_rejects_bad_size() {
        let header = SbtHeader {
            version_major: SBT_VERSION_MAJOR,
            ..Default::default()
        };
        let mut buf = header.encode();
        buf[8..12].copy_from_slice(&32u32.to_le_bytes());
        assert!(matches!(
            SbtHeader::decode(&buf),
            Err(SbtError::BadHeaderSize(32))
        ));
    }

    #[test]
    fn test_header_tolerates_unknown_flags() {
        let header = SbtHeader {
            version_major: SBT_VERSION_MAJOR,
            flags: FLAG_HAS_STRING_TABLE | (1 << 7),
            ..Default::default()
        };
        let decoded = SbtHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.flags & FLAG_HAS_STRING_TABLE, FLAG_HAS_STRING_TABLE);
    }
}
