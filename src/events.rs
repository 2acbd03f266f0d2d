//! The cross-vendor event model.
//!
//! Every capture adapter translates its vendor's activity records into
//! [`TraceEvent`] values; everything downstream (the SBT container, the
//! timeline builder, the state machine, the debug engine) consumes only this
//! representation. Optional payloads are stored by value and flagged by
//! presence, mirroring the on-disk block layout.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::Serialize;

/// Nanoseconds since a capture-scoped epoch. Monotonic within one capture.
pub type Timestamp = u64;
/// Adapter-assigned token pairing a launch with its completion.
pub type CorrelationId = u64;
pub type DeviceId = u32;
pub type StreamId = u32;
pub type ThreadId = u32;

/// GPU/NPU runtime families TraceSmith can capture from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PlatformKind {
    Cuda,
    Rocm,
    Metal,
    Maca,
    Ascend,
    Simulation,
    Unknown,
}

impl PlatformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Rocm => "rocm",
            Self::Metal => "metal",
            Self::Maca => "maca",
            Self::Ascend => "ascend",
            Self::Simulation => "sim",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for PlatformKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "cuda" => Ok(Self::Cuda),
            "rocm" | "hip" => Ok(Self::Rocm),
            "metal" => Ok(Self::Metal),
            "maca" | "metax" => Ok(Self::Maca),
            "ascend" | "cann" => Ok(Self::Ascend),
            "sim" | "simulation" => Ok(Self::Simulation),
            _ => bail!("Unknown platform: {s}. Must be one of: cuda, rocm, metal, maca, ascend, sim"),
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened. The numeric values are the on-disk encoding and must not be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum EventKind {
    KernelLaunch = 0,
    KernelComplete = 1,
    MemcpyH2D = 2,
    MemcpyD2H = 3,
    MemcpyD2D = 4,
    MemsetDevice = 5,
    StreamSync = 6,
    DeviceSync = 7,
    EventRecord = 8,
    EventSync = 9,
    StreamCreate = 10,
    StreamDestroy = 11,
    MemAlloc = 12,
    MemFree = 13,
    Marker = 14,
    RangeStart = 15,
    RangeEnd = 16,
    Custom = 17,
}

impl EventKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::KernelLaunch,
            1 => Self::KernelComplete,
            2 => Self::MemcpyH2D,
            3 => Self::MemcpyD2H,
            4 => Self::MemcpyD2D,
            5 => Self::MemsetDevice,
            6 => Self::StreamSync,
            7 => Self::DeviceSync,
            8 => Self::EventRecord,
            9 => Self::EventSync,
            10 => Self::StreamCreate,
            11 => Self::StreamDestroy,
            12 => Self::MemAlloc,
            13 => Self::MemFree,
            14 => Self::Marker,
            15 => Self::RangeStart,
            16 => Self::RangeEnd,
            17 => Self::Custom,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KernelLaunch => "KernelLaunch",
            Self::KernelComplete => "KernelComplete",
            Self::MemcpyH2D => "MemcpyH2D",
            Self::MemcpyD2H => "MemcpyD2H",
            Self::MemcpyD2D => "MemcpyD2D",
            Self::MemsetDevice => "MemsetDevice",
            Self::StreamSync => "StreamSync",
            Self::DeviceSync => "DeviceSync",
            Self::EventRecord => "EventRecord",
            Self::EventSync => "EventSync",
            Self::StreamCreate => "StreamCreate",
            Self::StreamDestroy => "StreamDestroy",
            Self::MemAlloc => "MemAlloc",
            Self::MemFree => "MemFree",
            Self::Marker => "Marker",
            Self::RangeStart => "RangeStart",
            Self::RangeEnd => "RangeEnd",
            Self::Custom => "Custom",
        }
    }

    /// Kinds that transfer or clear device memory.
    pub fn is_memory_transfer(&self) -> bool {
        matches!(
            self,
            Self::MemcpyH2D | Self::MemcpyD2H | Self::MemcpyD2D | Self::MemsetDevice
        )
    }

    /// Kinds that act as a synchronisation barrier.
    pub fn is_sync(&self) -> bool {
        matches!(self, Self::StreamSync | Self::DeviceSync | Self::EventSync)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Launch geometry and occupancy hints for a kernel, when the vendor exposes
/// them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KernelParams {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_mem_bytes: u32,
    pub registers_per_thread: u32,
    pub warp_size: u32,
}

impl KernelParams {
    /// Total threads across the whole grid.
    pub fn total_threads(&self) -> u64 {
        let blocks = self.grid.0 as u64 * self.grid.1 as u64 * self.grid.2 as u64;
        let threads = self.block.0 as u64 * self.block.1 as u64 * self.block.2 as u64;
        blocks * threads
    }
}

/// Source/destination of a memory operation. For allocations and frees only
/// `dst_addr` and `bytes` are meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryParams {
    pub src_addr: u64,
    pub dst_addr: u64,
    pub bytes: u64,
    pub is_async: bool,
}

impl MemoryParams {
    /// Transfer bandwidth in bytes per nanosecond. Bandwidth is derived at
    /// analysis time from the event duration, never stored at capture.
    pub fn bandwidth(&self, duration_ns: u64) -> f64 {
        if duration_ns == 0 {
            0.0
        } else {
            self.bytes as f64 / duration_ns as f64
        }
    }
}

/// One resolved (or unresolved) host stack frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub address: u64,
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// Ordered host call stack, innermost frame first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallStack {
    pub frames: Vec<StackFrame>,
}

impl CallStack {
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Flow classifications used to link a CPU-side submission to its GPU-side
/// execution.
pub const FLOW_TYPE_KERNEL: u8 = 0;
pub const FLOW_TYPE_MEMCPY: u8 = 1;
pub const FLOW_TYPE_USER: u8 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlowInfo {
    pub id: u64,
    pub flow_type: u8,
    pub is_start: bool,
}

/// A single captured event. Optional payloads are populated only when they
/// carry information for the event's kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEvent {
    pub kind: EventKind,
    pub timestamp: Timestamp,
    /// 0 for instantaneous events.
    pub duration: u64,
    pub device_id: DeviceId,
    pub stream_id: StreamId,
    pub correlation_id: CorrelationId,
    pub thread_id: ThreadId,
    /// Kernel or marker name. May be empty.
    pub name: String,
    pub kernel_params: Option<KernelParams>,
    pub memory_params: Option<MemoryParams>,
    pub call_stack: Option<CallStack>,
    pub flow_info: Option<FlowInfo>,
    /// Ordered key/value pairs; keys are unique within one event.
    pub metadata: Vec<(String, String)>,
}

impl TraceEvent {
    pub fn new(kind: EventKind) -> Self {
        TraceEvent {
            kind,
            timestamp: 0,
            duration: 0,
            device_id: 0,
            stream_id: 0,
            correlation_id: 0,
            thread_id: 0,
            name: String::new(),
            kernel_params: None,
            memory_params: None,
            call_stack: None,
            flow_info: None,
            metadata: Vec::new(),
        }
    }

    /// Insert or replace a metadata entry, keeping keys unique and insertion
    /// order stable.
    pub fn set_metadata(&mut self, key: &str, value: impl Into<String>) {
        if let Some(entry) = self.metadata.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value.into();
        } else {
            self.metadata.push((key.to_string(), value.into()));
        }
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// End of the interval this event covers, `timestamp` for instants.
    pub fn end_timestamp(&self) -> Timestamp {
        self.timestamp + self.duration
    }
}

/// Static description of one device as reported by its runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub vendor: String,
    pub name: String,
    pub compute_major: u32,
    pub compute_minor: u32,
    pub total_memory: u64,
    pub multiprocessor_count: u32,
    /// Core clock in kHz.
    pub clock_rate_khz: u32,
    pub metadata: Vec<(String, String)>,
}

/// Capture-wide metadata persisted in the SBT container.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceMetadata {
    pub application: String,
    pub command_line: String,
    pub start_timestamp: Timestamp,
    pub end_timestamp: Timestamp,
    pub extra: Vec<(String, String)>,
}

/// The in-memory form of one trace: metadata, devices and the flat event
/// sequence. Append-only during capture, immutable after [`finalize`].
///
/// [`finalize`]: TraceRecord::finalize
#[derive(Debug, Clone, Default)]
pub struct TraceRecord {
    pub metadata: TraceMetadata,
    pub devices: Vec<DeviceInfo>,
    events: Vec<TraceEvent>,
    finalized: bool,
}

impl TraceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Append one event. Appends after `finalize` are dropped with a warning.
    pub fn push_event(&mut self, event: TraceEvent) {
        if self.finalized {
            tracing::warn!("dropping event appended to a finalized trace record");
            return;
        }
        self.events.push(event);
    }

    pub fn extend_events(&mut self, events: impl IntoIterator<Item = TraceEvent>) {
        for event in events {
            self.push_event(event);
        }
    }

    /// Seal the record. Fills in the end timestamp from the last event if the
    /// caller has not set one.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        if self.metadata.end_timestamp == 0 {
            self.metadata.end_timestamp = self
                .events
                .iter()
                .map(TraceEvent::end_timestamp)
                .max()
                .unwrap_or(0);
        }
        self.finalized = true;
    }

    /// Sort events by timestamp, stably, so ties keep insertion order. Only
    /// ever done on explicit request.
    pub fn sort_by_timestamp(&mut self) {
        self.events.sort_by_key(|e| e.timestamp);
    }
}

/// Monotonic clock read in nanoseconds, the timebase used for capture-side
/// timestamps.
pub fn monotonic_now() -> Timestamp {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64 * 1_000_000_000) + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_round_trip() {
        for raw in 0u8..=17 {
            let kind = EventKind::from_u8(raw).unwrap();
            assert_eq!(kind as u8, raw);
        }
        assert!(EventKind::from_u8(18).is_none());
        assert!(EventKind::from_u8(255).is_none());
    }

    #[test]
    fn test_metadata_keys_unique() {
        let mut event = TraceEvent::new(EventKind::Marker);
        event.set_metadata("color", "red");
        event.set_metadata("shape", "square");
        event.set_metadata("color", "blue");
        assert_eq!(event.metadata.len(), 2);
        assert_eq!(event.metadata_value("color"), Some("blue"));
        assert_eq!(event.metadata[0].0, "color");
    }

    #[test]
    fn test_record_immutable_after_finalize() {
        let mut record = TraceRecord::new();
        let mut event = TraceEvent::new(EventKind::Marker);
        event.timestamp = 100;
        event.duration = 50;
        record.push_event(event.clone());
        record.finalize();
        record.push_event(event);
        assert_eq!(record.event_count(), 1);
        assert_eq!(record.metadata.end_timestamp, 150);
    }

    #[test]
    fn test_bandwidth_derivation() {
        let params = MemoryParams {
            bytes: 1 << 20,
            ..Default::default()
        };
        // 1 MiB in 1 ms is roughly 1 GiB/s, expressed in bytes per ns.
        assert!((params.bandwidth(1_000_000) - 1.048576).abs() < 1e-6);
        assert_eq!(params.bandwidth(0), 0.0);
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("cuda".parse::<PlatformKind>().unwrap(), PlatformKind::Cuda);
        assert_eq!("hip".parse::<PlatformKind>().unwrap(), PlatformKind::Rocm);
        assert!("quantum".parse::<PlatformKind>().is_err());
    }
}
