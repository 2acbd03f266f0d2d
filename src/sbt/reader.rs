//! SBT file reader.
//!
//! `open` validates only the fixed header; `read_all` then decodes the
//! sections into a [`TraceRecord`]. Readers tolerate two kinds of future
//! extension: unknown optional-block bits (skipped via the block length
//! prefix) and unknown event kinds (surfaced as `Custom` with the raw kind
//! preserved in metadata).

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::events::{
    CallStack, DeviceInfo, EventKind, FlowInfo, KernelParams, MemoryParams, StackFrame,
    TraceEvent, TraceMetadata, TraceRecord,
};
use crate::sbt::{
    Result, SbtError, SbtHeader, EVENT_FLAG_CALL_STACK, EVENT_FLAG_FLOW_INFO,
    EVENT_FLAG_KERNEL_PARAMS, EVENT_FLAG_MEMORY_PARAMS, EVENT_FLAG_METADATA,
    EVENT_RECORD_HEADER_SIZE, RAW_KIND_KEY, SBT_HEADER_SIZE,
};

/// Validating reader for one SBT file. The whole file is loaded up front;
/// traces that need streaming reads should be windowed by the caller.
pub struct SbtReader {
    path: PathBuf,
    data: Vec<u8>,
    header: SbtHeader,
    strings: Vec<String>,
    valid: bool,
}

impl SbtReader {
    /// Open and validate the header. On a structurally invalid header the
    /// constructor returns the error; `is_valid` reflects the outcome for
    /// readers that were constructed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;

        let header = SbtHeader::decode(&data)?;
        let file_size = data.len() as u64;
        for (section, offset) in [
            ("metadata", header.metadata_offset),
            ("string table", header.string_table_offset),
            ("device info", header.device_info_offset),
            ("events", header.events_offset),
        ] {
            if offset < SBT_HEADER_SIZE as u64 || offset > file_size {
                return Err(SbtError::OffsetOutOfRange {
                    section,
                    offset,
                    file_size,
                });
            }
        }

        let mut reader = SbtReader {
            path,
            data,
            header,
            strings: Vec::new(),
            valid: true,
        };
        reader.strings = reader.decode_string_table()?;
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &SbtHeader {
        &self.header
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn event_count(&self) -> u64 {
        self.header.event_count
    }

    /// Look up one interned string. Index 0 is the empty string.
    pub fn string(&self, index: u32) -> Result<&str> {
        self.strings
            .get(index as usize)
            .map(String::as_str)
            .ok_or(SbtError::BadStringRef(index))
    }

    /// Decode metadata, devices and the full event stream into `record`.
    pub fn read_all(&self, record: &mut TraceRecord) -> Result<()> {
        if !self.valid {
            return Err(SbtError::InvalidState("reader is not valid"));
        }

        record.metadata = self.decode_metadata()?;
        record.devices = self.decode_devices()?;

        let mut cursor = Cursor::new(&self.data, self.header.events_offset as usize);
        for _ in 0..self.header.event_count {
            record.push_event(self.decode_event(&mut cursor)?);
        }
        Ok(())
    }

    fn decode_string_table(&self) -> Result<Vec<String>> {
        let mut cursor = Cursor::new(&self.data, self.header.string_table_offset as usize);
        let count = cursor.read_u32("string table count")?;
        let mut strings = Vec::with_capacity(count as usize);
        for i in 0..count {
            let len = cursor.read_u32("string length")? as usize;
            let bytes = cursor.read_bytes(len, "string bytes")?;
            let s = std::str::from_utf8(bytes).map_err(|_| SbtError::BadUtf8(i))?;
            strings.push(s.to_string());
        }
        Ok(strings)
    }

    fn decode_metadata(&self) -> Result<TraceMetadata> {
        let mut cursor = Cursor::new(&self.data, self.header.metadata_offset as usize);
        let app_ref = cursor.read_u32("metadata app ref")?;
        let cmd_ref = cursor.read_u32("metadata cmdline ref")?;
        let start_timestamp = cursor.read_u64("metadata start")?;
        let end_timestamp = cursor.read_u64("metadata end")?;
        let count = cursor.read_u32("metadata pair count")?;
        let mut extra = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let k = cursor.read_u32("metadata key ref")?;
            let v = cursor.read_u32("metadata value ref")?;
            extra.push((self.string(k)?.to_string(), self.string(v)?.to_string()));
        }
        Ok(TraceMetadata {
            application: self.string(app_ref)?.to_string(),
            command_line: self.string(cmd_ref)?.to_string(),
            start_timestamp,
            end_timestamp,
            extra,
        })
    }

    fn decode_devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut cursor = Cursor::new(&self.data, self.header.device_info_offset as usize);
        let count = cursor.read_u32("device count")?;
        let mut devices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let device_id = cursor.read_u32("device id")?;
            let vendor_ref = cursor.read_u32("device vendor ref")?;
            let name_ref = cursor.read_u32("device name ref")?;
            let compute_major = cursor.read_u32("device compute major")?;
            let compute_minor = cursor.read_u32("device compute minor")?;
            let total_memory = cursor.read_u64("device total memory")?;
            let multiprocessor_count = cursor.read_u32("device mp count")?;
            let clock_rate_khz = cursor.read_u32("device clock rate")?;
            let meta_count = cursor.read_u32("device metadata count")?;
            let mut metadata = Vec::with_capacity(meta_count as usize);
            for _ in 0..meta_count {
                let k = cursor.read_u32("device metadata key")?;
                let v = cursor.read_u32("device metadata value")?;
                metadata.push((self.string(k)?.to_string(), self.string(v)?.to_string()));
            }
            devices.push(DeviceInfo {
                device_id,
                vendor: self.string(vendor_ref)?.to_string(),
                name: self.string(name_ref)?.to_string(),
                compute_major,
                compute_minor,
                total_memory,
                multiprocessor_count,
                clock_rate_khz,
                metadata,
            });
        }
        Ok(devices)
    }

    fn decode_event(&self, cursor: &mut Cursor<'_>) -> Result<TraceEvent> {
        let header = cursor.read_bytes(EVENT_RECORD_HEADER_SIZE, "event record header")?;
        let raw_kind = header[0];
        let flags = header[1];
        let stream_id = u32::from_le_bytes(header[2..6].try_into().unwrap());
        let device_id = u32::from_le_bytes(header[6..10].try_into().unwrap());
        let correlation_id = u64::from_le_bytes(header[10..18].try_into().unwrap());
        let thread_id = u32::from_le_bytes(header[18..22].try_into().unwrap());
        let timestamp = u64::from_le_bytes(header[22..30].try_into().unwrap());
        let duration = u64::from_le_bytes(header[30..38].try_into().unwrap());
        let name_ref = u32::from_le_bytes(header[38..42].try_into().unwrap());

        let kind = EventKind::from_u8(raw_kind);
        let mut event = TraceEvent::new(kind.unwrap_or(EventKind::Custom));
        event.timestamp = timestamp;
        event.duration = duration;
        event.device_id = device_id;
        event.stream_id = stream_id;
        event.correlation_id = correlation_id;
        event.thread_id = thread_id;
        event.name = self.string(name_ref)?.to_string();

        if flags & EVENT_FLAG_KERNEL_PARAMS != 0 {
            let block = cursor.read_block("kernel params block")?;
            event.kernel_params = decode_kernel_params(block);
        }
        if flags & EVENT_FLAG_MEMORY_PARAMS != 0 {
            let block = cursor.read_block("memory params block")?;
            event.memory_params = decode_memory_params(block);
        }
        if flags & EVENT_FLAG_CALL_STACK != 0 {
            let block = cursor.read_block("call stack block")?;
            event.call_stack = self.decode_call_stack(block)?;
        }
        if flags & EVENT_FLAG_FLOW_INFO != 0 {
            let block = cursor.read_block("flow info block")?;
            event.flow_info = decode_flow_info(block);
        }
        if flags & EVENT_FLAG_METADATA != 0 {
            let block = cursor.read_block("metadata block")?;
            self.decode_event_metadata(block, &mut event)?;
        }
        // Skip optional blocks this reader version does not know about.
        let known = EVENT_FLAG_KERNEL_PARAMS
            | EVENT_FLAG_MEMORY_PARAMS
            | EVENT_FLAG_CALL_STACK
            | EVENT_FLAG_FLOW_INFO
            | EVENT_FLAG_METADATA;
        let mut unknown = flags & !known;
        while unknown != 0 {
            cursor.read_block("unknown optional block")?;
            unknown &= unknown - 1;
        }

        if kind.is_none() {
            event.set_metadata(RAW_KIND_KEY, raw_kind.to_string());
        }
        Ok(event)
    }

    fn decode_call_stack(&self, block: &[u8]) -> Result<Option<CallStack>> {
        if block.len() < 4 {
            return Ok(None);
        }
        let count = u32::from_le_bytes(block[0..4].try_into().unwrap()) as usize;
        let mut frames = Vec::with_capacity(count);
        let mut off = 4;
        for _ in 0..count {
            if off + 20 > block.len() {
                return Err(SbtError::Truncated("call stack frame"));
            }
            let address = u64::from_le_bytes(block[off..off + 8].try_into().unwrap());
            let func_ref = u32::from_le_bytes(block[off + 8..off + 12].try_into().unwrap());
            let file_ref = u32::from_le_bytes(block[off + 12..off + 16].try_into().unwrap());
            let line = u32::from_le_bytes(block[off + 16..off + 20].try_into().unwrap());
            frames.push(StackFrame {
                address,
                function: non_empty(self.string(func_ref)?),
                file: non_empty(self.string(file_ref)?),
                line: if line == 0 { None } else { Some(line) },
            });
            off += 20;
        }
        Ok(Some(CallStack { frames }))
    }

    fn decode_event_metadata(&self, block: &[u8], event: &mut TraceEvent) -> Result<()> {
        if block.len() < 4 {
            return Ok(());
        }
        let count = u32::from_le_bytes(block[0..4].try_into().unwrap()) as usize;
        let mut off = 4;
        for _ in 0..count {
            if off + 8 > block.len() {
                return Err(SbtError::Truncated("event metadata pair"));
            }
            let k = u32::from_le_bytes(block[off..off + 4].try_into().unwrap());
            let v = u32::from_le_bytes(block[off + 4..off + 8].try_into().unwrap());
            let key = self.string(k)?.to_string();
            let value = self.string(v)?.to_string();
            event.set_metadata(&key, value);
            off += 8;
        }
        Ok(())
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn decode_kernel_params(block: &[u8]) -> Option<KernelParams> {
    if block.len() < 36 {
        return None;
    }
    let word = |i: usize| u32::from_le_bytes(block[i * 4..i * 4 + 4].try_into().unwrap());
    Some(KernelParams {
        grid: (word(0), word(1), word(2)),
        block: (word(3), word(4), word(5)),
        shared_mem_bytes: word(6),
        registers_per_thread: word(7),
        warp_size: word(8),
    })
}

fn decode_memory_params(block: &[u8]) -> Option<MemoryParams> {
    if block.len() < 25 {
        return None;
    }
    Some(MemoryParams {
        src_addr: u64::from_le_bytes(block[0..8].try_into().unwrap()),
        dst_addr: u64::from_le_bytes(block[8..16].try_into().unwrap()),
        bytes: u64::from_le_bytes(block[16..24].try_into().unwrap()),
        is_async: block[24] != 0,
    })
}

fn decode_flow_info(block: &[u8]) -> Option<FlowInfo> {
    if block.len() < 10 {
        return None;
    }
    Some(FlowInfo {
        id: u64::from_le_bytes(block[0..8].try_into().unwrap()),
        flow_type: block[8],
        is_start: block[9] != 0,
    })
}

/// Bounds-checked reading position over the loaded file.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        Cursor { data, pos }
    }

    fn read_bytes(&mut self, len: usize, what: &'static str) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(SbtError::Truncated(what));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32> {
        let bytes = self.read_bytes(4, what)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(&mut self, what: &'static str) -> Result<u64> {
        let bytes = self.read_bytes(8, what)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Read one length-prefixed optional block.
    fn read_block(&mut self, what: &'static str) -> Result<&'a [u8]> {
        let len = self.read_u32(what)? as usize;
        self.read_bytes(len, what)
    }
}
