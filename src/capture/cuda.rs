//! CUDA capture adapter (CUPTI activity model).
//!
//! The CUPTI interface splits one kernel launch across two callbacks: the
//! runtime API callback fires on the submitting host thread when the launch
//! is enqueued, and the activity record arrives later, off-thread, with the
//! device-side start/end timestamps. The adapter records the correlation id
//! on the API callback and pairs the activity record back to it, so every
//! completion carries the launching thread.

use std::path::Path;

use anyhow::{bail, Result};

use crate::events::{
    CorrelationId, DeviceId, DeviceInfo, EventKind, FlowInfo, KernelParams, MemoryParams,
    PlatformKind, StreamId, Timestamp, TraceEvent, FLOW_TYPE_KERNEL,
};
use crate::capture::{current_thread_id, AdapterCore, PlatformProfiler, ProfilerConfig};
use crate::sink::LiveCallback;

/// Paths whose presence indicates a usable CUDA driver.
const CUDA_DEVICE_NODES: &[&str] = &["/dev/nvidiactl", "/dev/nvidia0"];
const CUDA_DRIVER_LIBS: &[&str] = &[
    "/usr/lib/x86_64-linux-gnu/libcuda.so.1",
    "/usr/lib64/libcuda.so.1",
    "/usr/local/cuda/lib64/libcudart.so",
];

pub fn is_cuda_available() -> bool {
    CUDA_DEVICE_NODES.iter().any(|p| Path::new(p).exists())
        || CUDA_DRIVER_LIBS.iter().any(|p| Path::new(p).exists())
}

/// Direction reported in a CUPTI memcpy activity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CudaMemcpyKind {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

/// Scope of a CUPTI synchronization activity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CudaSyncScope {
    Stream,
    Device,
    Event,
}

/// Asynchronous activity records as CUPTI delivers them from its buffer
/// completion callback.
#[derive(Debug, Clone)]
pub enum CudaActivity {
    Kernel {
        correlation_id: CorrelationId,
        name: String,
        start: Timestamp,
        end: Timestamp,
        device_id: DeviceId,
        stream_id: StreamId,
        grid: (u32, u32, u32),
        block: (u32, u32, u32),
        shared_mem_bytes: u32,
        registers_per_thread: u32,
    },
    Memcpy {
        correlation_id: CorrelationId,
        kind: CudaMemcpyKind,
        bytes: u64,
        src_addr: u64,
        dst_addr: u64,
        start: Timestamp,
        end: Timestamp,
        device_id: DeviceId,
        stream_id: StreamId,
        is_async: bool,
    },
    Memset {
        correlation_id: CorrelationId,
        addr: u64,
        bytes: u64,
        start: Timestamp,
        end: Timestamp,
        device_id: DeviceId,
        stream_id: StreamId,
    },
    Synchronize {
        correlation_id: CorrelationId,
        scope: CudaSyncScope,
        start: Timestamp,
        end: Timestamp,
        device_id: DeviceId,
        stream_id: StreamId,
    },
    MemAlloc {
        correlation_id: CorrelationId,
        addr: u64,
        bytes: u64,
        timestamp: Timestamp,
        device_id: DeviceId,
    },
    MemFree {
        correlation_id: CorrelationId,
        addr: u64,
        bytes: u64,
        timestamp: Timestamp,
        device_id: DeviceId,
    },
}

/// CUDA adapter. The CUPTI callback shims call [`on_launch_enqueued`] and
/// [`handle_activity`]; both are hot paths and allocate nothing beyond the
/// event itself.
///
/// [`on_launch_enqueued`]: CuptiProfiler::on_launch_enqueued
/// [`handle_activity`]: CuptiProfiler::handle_activity
pub struct CuptiProfiler {
    core: Option<AdapterCore>,
    devices: Vec<DeviceInfo>,
    /// Callback results that were not data records; counted, then discarded.
    ignored_records: u64,
}

impl Default for CuptiProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl CuptiProfiler {
    pub fn new() -> Self {
        CuptiProfiler {
            core: None,
            devices: Vec::new(),
            ignored_records: 0,
        }
    }

    fn core(&self) -> Result<&AdapterCore> {
        match &self.core {
            Some(core) => Ok(core),
            None => bail!("CUDA profiler is not initialized"),
        }
    }

    /// Runtime API callback on the submitting thread: a kernel launch was
    /// enqueued. Emits the `KernelLaunch` event with host timing, attaches
    /// the stack if configured, and records the correlation for the
    /// asynchronous completion.
    pub fn on_launch_enqueued(
        &mut self,
        correlation_id: CorrelationId,
        name: &str,
        host_timestamp: Timestamp,
        device_id: DeviceId,
        stream_id: StreamId,
    ) {
        let Some(core) = &self.core else { return };
        let thread_id = current_thread_id();
        core.correlation
            .record_launch(correlation_id, thread_id, host_timestamp);

        let mut event = TraceEvent::new(EventKind::KernelLaunch);
        event.timestamp = host_timestamp;
        event.device_id = device_id;
        event.stream_id = stream_id;
        event.correlation_id = correlation_id;
        event.thread_id = thread_id;
        event.name = name.to_string();
        event.flow_info = Some(FlowInfo {
            id: correlation_id,
            flow_type: FLOW_TYPE_KERNEL,
            is_start: true,
        });
        core.attach_stack(&mut event);
        core.submit(event);
    }

    /// Activity buffer callback: translate one CUPTI record. Records that do
    /// not map to the event model are counted and dropped; capture continues.
    pub fn handle_activity(&mut self, activity: CudaActivity) {
        let Some(core) = &self.core else {
            self.ignored_records += 1;
            return;
        };

        match activity {
            CudaActivity::Kernel {
                correlation_id,
                name,
                start,
                end,
                device_id,
                stream_id,
                grid,
                block,
                shared_mem_bytes,
                registers_per_thread,
            } => {
                let mut event = TraceEvent::new(EventKind::KernelComplete);
                event.timestamp = end;
                event.duration = end.saturating_sub(start);
                event.device_id = device_id;
                event.stream_id = stream_id;
                event.correlation_id = correlation_id;
                event.name = name;
                event.kernel_params = Some(KernelParams {
                    grid,
                    block,
                    shared_mem_bytes,
                    registers_per_thread,
                    warp_size: 32,
                });
                event.flow_info = Some(FlowInfo {
                    id: correlation_id,
                    flow_type: FLOW_TYPE_KERNEL,
                    is_start: false,
                });
                if let Some((thread_id, _)) = core.correlation.take(correlation_id) {
                    event.thread_id = thread_id;
                }
                core.submit(event);
            }
            CudaActivity::Memcpy {
                correlation_id,
                kind,
                bytes,
                src_addr,
                dst_addr,
                start,
                end,
                device_id,
                stream_id,
                is_async,
            } => {
                let event_kind = match kind {
                    CudaMemcpyKind::HostToDevice => EventKind::MemcpyH2D,
                    CudaMemcpyKind::DeviceToHost => EventKind::MemcpyD2H,
                    CudaMemcpyKind::DeviceToDevice => EventKind::MemcpyD2D,
                };
                let mut event = TraceEvent::new(event_kind);
                event.timestamp = start;
                event.duration = end.saturating_sub(start);
                event.device_id = device_id;
                event.stream_id = stream_id;
                event.correlation_id = correlation_id;
                event.memory_params = Some(MemoryParams {
                    src_addr,
                    dst_addr,
                    bytes,
                    is_async,
                });
                if let Some((thread_id, _)) = core.correlation.peek(correlation_id) {
                    event.thread_id = thread_id;
                }
                core.submit(event);
            }
            CudaActivity::Memset {
                correlation_id,
                addr,
                bytes,
                start,
                end,
                device_id,
                stream_id,
            } => {
                let mut event = TraceEvent::new(EventKind::MemsetDevice);
                event.timestamp = start;
                event.duration = end.saturating_sub(start);
                event.device_id = device_id;
                event.stream_id = stream_id;
                event.correlation_id = correlation_id;
                event.memory_params = Some(MemoryParams {
                    src_addr: 0,
                    dst_addr: addr,
                    bytes,
                    is_async: false,
                });
                core.submit(event);
            }
            CudaActivity::Synchronize {
                correlation_id,
                scope,
                start,
                end,
                device_id,
                stream_id,
            } => {
                let event_kind = match scope {
                    CudaSyncScope::Stream => EventKind::StreamSync,
                    CudaSyncScope::Device => EventKind::DeviceSync,
                    CudaSyncScope::Event => EventKind::EventSync,
                };
                let mut event = TraceEvent::new(event_kind);
                event.timestamp = start;
                event.duration = end.saturating_sub(start);
                event.device_id = device_id;
                event.stream_id = stream_id;
                event.correlation_id = correlation_id;
                core.submit(event);
            }
            CudaActivity::MemAlloc {
                correlation_id,
                addr,
                bytes,
                timestamp,
                device_id,
            } => {
                let mut event = TraceEvent::new(EventKind::MemAlloc);
                event.timestamp = timestamp;
                event.device_id = device_id;
                event.correlation_id = correlation_id;
                event.memory_params = Some(MemoryParams {
                    src_addr: 0,
                    dst_addr: addr,
                    bytes,
                    is_async: false,
                });
                core.submit(event);
            }
            CudaActivity::MemFree {
                correlation_id,
                addr,
                bytes,
                timestamp,
                device_id,
            } => {
                let mut event = TraceEvent::new(EventKind::MemFree);
                event.timestamp = timestamp;
                event.device_id = device_id;
                event.correlation_id = correlation_id;
                event.memory_params = Some(MemoryParams {
                    src_addr: 0,
                    dst_addr: addr,
                    bytes,
                    is_async: false,
                });
                core.submit(event);
            }
        }
    }

    /// Count a callback result that carried no usable data record.
    pub fn ignore_record(&mut self) {
        self.ignored_records += 1;
    }

    pub fn ignored_records(&self) -> u64 {
        self.ignored_records
    }

    fn enumerate_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        // Per-GPU information nodes exported by the driver, one directory per
        // board.
        if let Ok(entries) = std::fs::read_dir("/proc/driver/nvidia/gpus") {
            for (index, entry) in entries.flatten().enumerate() {
                let info_path = entry.path().join("information");
                let name = std::fs::read_to_string(&info_path)
                    .ok()
                    .and_then(|text| {
                        text.lines()
                            .find(|line| line.starts_with("Model:"))
                            .map(|line| line.trim_start_matches("Model:").trim().to_string())
                    })
                    .unwrap_or_else(|| format!("NVIDIA GPU {index}"));
                devices.push(DeviceInfo {
                    device_id: index as DeviceId,
                    vendor: "NVIDIA".to_string(),
                    name,
                    ..Default::default()
                });
            }
        }
        if devices.is_empty() && is_cuda_available() {
            devices.push(DeviceInfo {
                device_id: 0,
                vendor: "NVIDIA".to_string(),
                name: "NVIDIA GPU 0".to_string(),
                ..Default::default()
            });
        }
        devices
    }
}

impl PlatformProfiler for CuptiProfiler {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Cuda
    }

    fn initialize(&mut self, config: &ProfilerConfig) -> Result<()> {
        if !is_cuda_available() {
            bail!("CUDA runtime not present on this system");
        }
        if self.core.is_some() {
            bail!("CUDA profiler initialized twice");
        }
        self.devices = Self::enumerate_devices();
        self.core = Some(AdapterCore::new(config));
        tracing::info!(devices = self.devices.len(), "CUPTI profiler initialized");
        Ok(())
    }

    fn start_capture(&mut self) -> Result<()> {
        self.core()?.set_capturing(true);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        self.core()?.set_capturing(false);
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.core.as_ref().map(|c| c.is_capturing()).unwrap_or(false)
    }

    fn drain_events(&mut self, max: usize) -> Vec<TraceEvent> {
        self.core
            .as_ref()
            .map(|c| c.sink.drain(max))
            .unwrap_or_default()
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.clone()
    }

    fn events_captured(&self) -> u64 {
        self.core.as_ref().map(|c| c.sink.events_captured()).unwrap_or(0)
    }

    fn events_dropped(&self) -> u64 {
        self.core.as_ref().map(|c| c.sink.events_dropped()).unwrap_or(0)
    }

    fn set_live_callback(&mut self, callback: LiveCallback) {
        if let Some(core) = &self.core {
            core.sink.set_live_callback(callback);
        }
    }

    fn finalize(&mut self) -> Result<()> {
        self.core = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a profiler with the availability probe bypassed, for feeding
    /// synthetic records through the translation path.
    fn offline_profiler() -> CuptiProfiler {
        let mut profiler = CuptiProfiler::new();
        profiler.core = Some(AdapterCore::new(&ProfilerConfig::default()));
        profiler.core.as_ref().unwrap().set_capturing(true);
        profiler
    }

    #[test]
    fn test_launch_then_activity_pairs_thread() {
        let mut profiler = offline_profiler();
        profiler.on_launch_enqueued(42, "matmul_f32", 1_000, 0, 3);
        profiler.handle_activity(CudaActivity::Kernel {
            correlation_id: 42,
            name: "matmul_f32".to_string(),
            start: 2_000,
            end: 9_000,
            device_id: 0,
            stream_id: 3,
            grid: (128, 1, 1),
            block: (256, 1, 1),
            shared_mem_bytes: 0,
            registers_per_thread: 64,
        });

        let events = profiler.drain_events(usize::MAX);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::KernelLaunch);
        assert_eq!(events[1].kind, EventKind::KernelComplete);
        assert_eq!(events[1].correlation_id, 42);
        assert_eq!(events[1].duration, 7_000);
        // Completion inherits the launching thread.
        assert_eq!(events[1].thread_id, events[0].thread_id);
        assert!(events[0].flow_info.unwrap().is_start);
        assert!(!events[1].flow_info.unwrap().is_start);
    }

    #[test]
    fn test_memcpy_direction_mapping() {
        let mut profiler = offline_profiler();
        for (kind, expect) in [
            (CudaMemcpyKind::HostToDevice, EventKind::MemcpyH2D),
            (CudaMemcpyKind::DeviceToHost, EventKind::MemcpyD2H),
            (CudaMemcpyKind::DeviceToDevice, EventKind::MemcpyD2D),
        ] {
            profiler.handle_activity(CudaActivity::Memcpy {
                correlation_id: 1,
                kind,
                bytes: 4096,
                src_addr: 0x1000,
                dst_addr: 0x2000,
                start: 10,
                end: 20,
                device_id: 0,
                stream_id: 0,
                is_async: true,
            });
            let events = profiler.drain_events(usize::MAX);
            assert_eq!(events[0].kind, expect);
            assert_eq!(events[0].memory_params.unwrap().bytes, 4096);
        }
    }

    #[test]
    fn test_sync_scope_mapping() {
        let mut profiler = offline_profiler();
        for (scope, expect) in [
            (CudaSyncScope::Stream, EventKind::StreamSync),
            (CudaSyncScope::Device, EventKind::DeviceSync),
            (CudaSyncScope::Event, EventKind::EventSync),
        ] {
            profiler.handle_activity(CudaActivity::Synchronize {
                correlation_id: 0,
                scope,
                start: 5,
                end: 6,
                device_id: 0,
                stream_id: 0,
            });
            let events = profiler.drain_events(usize::MAX);
            assert_eq!(events[0].kind, expect);
        }
    }

    #[test]
    fn test_non_data_records_counted_not_stored() {
        let mut profiler = offline_profiler();
        profiler.ignore_record();
        profiler.ignore_record();
        assert_eq!(profiler.ignored_records(), 2);
        assert!(profiler.drain_events(usize::MAX).is_empty());
    }

    #[test]
    fn test_initialize_fails_without_runtime() {
        if is_cuda_available() {
            return; // Probe is environment dependent; only assert the negative.
        }
        let mut profiler = CuptiProfiler::new();
        assert!(profiler.initialize(&ProfilerConfig::default()).is_err());
    }
}
