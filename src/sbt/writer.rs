//! SBT file writer.
//!
//! Events are encoded into an in-memory stream region as they arrive so the
//! per-event cost is an append plus string interning; the four sections and
//! the final header are laid out once at `finalize`. A partially written
//! file (open but never finalized, or finalize failed) is left on disk for
//! inspection.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::events::{DeviceInfo, TraceEvent, TraceMetadata};
use crate::sbt::{
    Result, SbtError, SbtHeader, EVENT_FLAG_CALL_STACK, EVENT_FLAG_FLOW_INFO,
    EVENT_FLAG_KERNEL_PARAMS, EVENT_FLAG_MEMORY_PARAMS, EVENT_FLAG_METADATA, FLAG_EVENTS_SORTED,
    FLAG_HAS_STRING_TABLE, SBT_HEADER_SIZE, SBT_VERSION_MAJOR, SBT_VERSION_MINOR,
};

/// String table under construction. Index 0 is always the empty string.
#[derive(Default)]
struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, u32>,
}

impl StringTable {
    fn new() -> Self {
        let mut table = StringTable::default();
        table.strings.push(String::new());
        table.index.insert(String::new(), 0);
        table
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), idx);
        idx
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
        for s in &self.strings {
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        buf
    }
}

/// Streaming writer for one SBT file.
pub struct SbtWriter {
    file: File,
    path: PathBuf,
    strings: StringTable,
    metadata: Option<TraceMetadata>,
    devices: Option<Vec<DeviceInfo>>,
    /// Encoded event records, appended as events arrive.
    event_region: Vec<u8>,
    event_count: u64,
    events_sorted: bool,
    finalized: bool,
}

impl SbtWriter {
    /// Create the output file. Fails if the path cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(SbtWriter {
            file,
            path,
            strings: StringTable::new(),
            metadata: None,
            devices: None,
            event_region: Vec::new(),
            event_count: 0,
            events_sorted: false,
            finalized: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    /// Declare that the caller has sorted the event stream by timestamp; sets
    /// the corresponding header flag.
    pub fn mark_events_sorted(&mut self) {
        self.events_sorted = true;
    }

    /// Buffer trace metadata for layout at finalize. At most one call, before
    /// the first event.
    pub fn write_metadata(&mut self, metadata: &TraceMetadata) -> Result<()> {
        self.check_open()?;
        if self.metadata.is_some() {
            return Err(SbtError::InvalidState("metadata written twice"));
        }
        if self.event_count > 0 {
            return Err(SbtError::InvalidState("metadata must precede events"));
        }
        self.metadata = Some(metadata.clone());
        Ok(())
    }

    /// Buffer the device table for layout at finalize. At most one call,
    /// before the first event.
    pub fn write_device_info(&mut self, devices: &[DeviceInfo]) -> Result<()> {
        self.check_open()?;
        if self.devices.is_some() {
            return Err(SbtError::InvalidState("device info written twice"));
        }
        if self.event_count > 0 {
            return Err(SbtError::InvalidState("device info must precede events"));
        }
        self.devices = Some(devices.to_vec());
        Ok(())
    }

    /// Append one event to the stream region. O(1) amortised.
    pub fn write_event(&mut self, event: &TraceEvent) -> Result<()> {
        self.check_open()?;
        encode_event(event, &mut self.strings, &mut self.event_region);
        self.event_count += 1;
        Ok(())
    }

    pub fn write_events<'a>(&mut self, events: impl IntoIterator<Item = &'a TraceEvent>) -> Result<()> {
        for event in events {
            self.write_event(event)?;
        }
        Ok(())
    }

    /// Lay out all sections and write the file. The header is written first
    /// as a zeroed placeholder, then rewritten with final offsets once every
    /// section landed. No writes are permitted afterwards.
    pub fn finalize(&mut self) -> Result<()> {
        self.check_open()?;
        self.finalized = true;

        let metadata = self.metadata.take().unwrap_or_default();
        let devices = self.devices.take().unwrap_or_default();
        let metadata_section = encode_metadata(&metadata, &mut self.strings);
        let device_section = encode_devices(&devices, &mut self.strings);
        // String table last: metadata and device encoding intern into it.
        let string_section = self.strings.encode();

        let metadata_offset = SBT_HEADER_SIZE as u64;
        let string_table_offset = metadata_offset + metadata_section.len() as u64;
        let device_info_offset = string_table_offset + string_section.len() as u64;
        let events_offset = device_info_offset + device_section.len() as u64;

        let mut flags = FLAG_HAS_STRING_TABLE;
        if self.events_sorted {
            flags |= FLAG_EVENTS_SORTED;
        }

        let header = SbtHeader {
            version_major: SBT_VERSION_MAJOR,
            version_minor: SBT_VERSION_MINOR,
            flags,
            event_count: self.event_count,
            metadata_offset,
            string_table_offset,
            device_info_offset,
            events_offset,
        };

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&[0u8; SBT_HEADER_SIZE as usize])?;
        self.file.write_all(&metadata_section)?;
        self.file.write_all(&string_section)?;
        self.file.write_all(&device_section)?;
        self.file.write_all(&self.event_region)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.encode())?;
        self.file.flush()?;
        Ok(())
    }

    pub fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn check_open(&self) -> Result<()> {
        if self.finalized {
            return Err(SbtError::InvalidState("writer already finalized"));
        }
        Ok(())
    }
}

fn encode_metadata(metadata: &TraceMetadata, strings: &mut StringTable) -> Vec<u8> {
    let app_ref = strings.intern(&metadata.application);
    let cmd_ref = strings.intern(&metadata.command_line);
    let pairs: Vec<(u32, u32)> = metadata
        .extra
        .iter()
        .map(|(k, v)| (strings.intern(k), strings.intern(v)))
        .collect();

    let mut buf = Vec::new();
    buf.extend_from_slice(&app_ref.to_le_bytes());
    buf.extend_from_slice(&cmd_ref.to_le_bytes());
    buf.extend_from_slice(&metadata.start_timestamp.to_le_bytes());
    buf.extend_from_slice(&metadata.end_timestamp.to_le_bytes());
    buf.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
    for (k, v) in pairs {
        buf.extend_from_slice(&k.to_le_bytes());
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

fn encode_devices(devices: &[DeviceInfo], strings: &mut StringTable) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(devices.len() as u32).to_le_bytes());
    for dev in devices {
        let vendor_ref = strings.intern(&dev.vendor);
        let name_ref = strings.intern(&dev.name);
        buf.extend_from_slice(&dev.device_id.to_le_bytes());
        buf.extend_from_slice(&vendor_ref.to_le_bytes());
        buf.extend_from_slice(&name_ref.to_le_bytes());
        buf.extend_from_slice(&dev.compute_major.to_le_bytes());
        buf.extend_from_slice(&dev.compute_minor.to_le_bytes());
        buf.extend_from_slice(&dev.total_memory.to_le_bytes());
        buf.extend_from_slice(&dev.multiprocessor_count.to_le_bytes());
        buf.extend_from_slice(&dev.clock_rate_khz.to_le_bytes());
        buf.extend_from_slice(&(dev.metadata.len() as u32).to_le_bytes());
        for (k, v) in &dev.metadata {
            let k_ref = strings.intern(k);
            let v_ref = strings.intern(v);
            buf.extend_from_slice(&k_ref.to_le_bytes());
            buf.extend_from_slice(&v_ref.to_le_bytes());
        }
    }
    buf
}

fn encode_event(event: &TraceEvent, strings: &mut StringTable, out: &mut Vec<u8>) {
    let mut flags = 0u8;
    if event.kernel_params.is_some() {
        flags |= EVENT_FLAG_KERNEL_PARAMS;
    }
    if event.memory_params.is_some() {
        flags |= EVENT_FLAG_MEMORY_PARAMS;
    }
    if event.call_stack.is_some() {
        flags |= EVENT_FLAG_CALL_STACK;
    }
    if event.flow_info.is_some() {
        flags |= EVENT_FLAG_FLOW_INFO;
    }
    if !event.metadata.is_empty() {
        flags |= EVENT_FLAG_METADATA;
    }

    let name_ref = strings.intern(&event.name);

    out.push(event.kind as u8);
    out.push(flags);
    out.extend_from_slice(&event.stream_id.to_le_bytes());
    out.extend_from_slice(&event.device_id.to_le_bytes());
    out.extend_from_slice(&event.correlation_id.to_le_bytes());
    out.extend_from_slice(&event.thread_id.to_le_bytes());
    out.extend_from_slice(&event.timestamp.to_le_bytes());
    out.extend_from_slice(&event.duration.to_le_bytes());
    out.extend_from_slice(&name_ref.to_le_bytes());

    if let Some(params) = &event.kernel_params {
        let mut block = Vec::with_capacity(36);
        for v in [
            params.grid.0,
            params.grid.1,
            params.grid.2,
            params.block.0,
            params.block.1,
            params.block.2,
            params.shared_mem_bytes,
            params.registers_per_thread,
            params.warp_size,
        ] {
            block.extend_from_slice(&v.to_le_bytes());
        }
        push_block(out, &block);
    }

    if let Some(params) = &event.memory_params {
        let mut block = Vec::with_capacity(25);
        block.extend_from_slice(&params.src_addr.to_le_bytes());
        block.extend_from_slice(&params.dst_addr.to_le_bytes());
        block.extend_from_slice(&params.bytes.to_le_bytes());
        block.push(params.is_async as u8);
        push_block(out, &block);
    }

    if let Some(stack) = &event.call_stack {
        let mut block = Vec::with_capacity(4 + stack.frames.len() * 20);
        block.extend_from_slice(&(stack.frames.len() as u32).to_le_bytes());
        for frame in &stack.frames {
            let func_ref = frame
                .function
                .as_deref()
                .map(|f| strings.intern(f))
                .unwrap_or(0);
            let file_ref = frame
                .file
                .as_deref()
                .map(|f| strings.intern(f))
                .unwrap_or(0);
            block.extend_from_slice(&frame.address.to_le_bytes());
            block.extend_from_slice(&func_ref.to_le_bytes());
            block.extend_from_slice(&file_ref.to_le_bytes());
            block.extend_from_slice(&frame.line.unwrap_or(0).to_le_bytes());
        }
        push_block(out, &block);
    }

    if let Some(flow) = &event.flow_info {
        let mut block = Vec::with_capacity(10);
        block.extend_from_slice(&flow.id.to_le_bytes());
        block.push(flow.flow_type);
        block.push(flow.is_start as u8);
        push_block(out, &block);
    }

    if !event.metadata.is_empty() {
        let mut block = Vec::with_capacity(4 + event.metadata.len() * 8);
        block.extend_from_slice(&(event.metadata.len() as u32).to_le_bytes());
        for (k, v) in &event.metadata {
            let k_ref = strings.intern(k);
            let v_ref = strings.intern(v);
            block.extend_from_slice(&k_ref.to_le_bytes());
            block.extend_from_slice(&v_ref.to_le_bytes());
        }
        push_block(out, &block);
    }
}

fn push_block(out: &mut Vec<u8>, block: &[u8]) {
    out.extend_from_slice(&(block.len() as u32).to_le_bytes());
    out.extend_from_slice(block);
}
