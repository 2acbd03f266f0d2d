//! ROCm capture adapter (roctracer model).
//!
//! HIP API callbacks fire synchronously on the submitting thread; HIP
//! activity records arrive later from the roctracer async queue carrying
//! device timestamps. Some roctracer versions do not expose the memcpy
//! direction on the activity record; those records map to host-to-device
//! and are tagged `direction=unknown` so consumers can tell them apart.

use std::path::Path;

use anyhow::{bail, Result};

use crate::capture::{current_thread_id, AdapterCore, PlatformProfiler, ProfilerConfig};
use crate::events::{
    CorrelationId, DeviceId, DeviceInfo, EventKind, FlowInfo, KernelParams, MemoryParams,
    PlatformKind, StreamId, Timestamp, TraceEvent, FLOW_TYPE_KERNEL,
};
use crate::sink::LiveCallback;

const ROCM_DEVICE_NODES: &[&str] = &["/dev/kfd"];
const ROCM_DRIVER_LIBS: &[&str] = &[
    "/opt/rocm/lib/libamdhip64.so",
    "/usr/lib/x86_64-linux-gnu/libamdhip64.so",
];

pub fn is_rocm_available() -> bool {
    ROCM_DEVICE_NODES.iter().any(|p| Path::new(p).exists())
        || ROCM_DRIVER_LIBS.iter().any(|p| Path::new(p).exists())
}

/// Memcpy direction as far as the roctracer record exposes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HipMemcpyKind {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    /// Record did not carry a direction.
    Unknown,
}

/// Async activity records delivered by the roctracer pool callback.
#[derive(Debug, Clone)]
pub enum HipActivity {
    KernelDispatch {
        correlation_id: CorrelationId,
        kernel_name: String,
        begin: Timestamp,
        end: Timestamp,
        device_id: DeviceId,
        queue_id: StreamId,
        grid: (u32, u32, u32),
        workgroup: (u32, u32, u32),
        group_segment_bytes: u32,
        vgpr_count: u32,
    },
    Copy {
        correlation_id: CorrelationId,
        kind: HipMemcpyKind,
        bytes: u64,
        src_addr: u64,
        dst_addr: u64,
        begin: Timestamp,
        end: Timestamp,
        device_id: DeviceId,
        queue_id: StreamId,
        is_async: bool,
    },
    Barrier {
        correlation_id: CorrelationId,
        device_wide: bool,
        begin: Timestamp,
        end: Timestamp,
        device_id: DeviceId,
        queue_id: StreamId,
    },
}

/// ROCm adapter. AMD wavefronts are 64 lanes wide; that constant lands on
/// every kernel params block.
pub struct RocmProfiler {
    core: Option<AdapterCore>,
    devices: Vec<DeviceInfo>,
    ignored_records: u64,
}

impl Default for RocmProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl RocmProfiler {
    pub fn new() -> Self {
        RocmProfiler {
            core: None,
            devices: Vec::new(),
            ignored_records: 0,
        }
    }

    fn core(&self) -> Result<&AdapterCore> {
        match &self.core {
            Some(core) => Ok(core),
            None => bail!("ROCm profiler is not initialized"),
        }
    }

    /// HIP API callback on the submitting thread: a kernel dispatch was
    /// enqueued.
    pub fn on_dispatch_enqueued(
        &mut self,
        correlation_id: CorrelationId,
        kernel_name: &str,
        host_timestamp: Timestamp,
        device_id: DeviceId,
        queue_id: StreamId,
    ) {
        let Some(core) = &self.core else { return };
        let thread_id = current_thread_id();
        core.correlation
            .record_launch(correlation_id, thread_id, host_timestamp);

        let mut event = TraceEvent::new(EventKind::KernelLaunch);
        event.timestamp = host_timestamp;
        event.device_id = device_id;
        event.stream_id = queue_id;
        event.correlation_id = correlation_id;
        event.thread_id = thread_id;
        event.name = kernel_name.to_string();
        event.flow_info = Some(FlowInfo {
            id: correlation_id,
            flow_type: FLOW_TYPE_KERNEL,
            is_start: true,
        });
        core.attach_stack(&mut event);
        core.submit(event);
    }

    /// Translate one roctracer activity record.
    pub fn handle_activity(&mut self, activity: HipActivity) {
        let Some(core) = &self.core else {
            self.ignored_records += 1;
            return;
        };

        match activity {
            HipActivity::KernelDispatch {
                correlation_id,
                kernel_name,
                begin,
                end,
                device_id,
                queue_id,
                grid,
                workgroup,
                group_segment_bytes,
                vgpr_count,
            } => {
                let mut event = TraceEvent::new(EventKind::KernelComplete);
                event.timestamp = end;
                event.duration = end.saturating_sub(begin);
                event.device_id = device_id;
                event.stream_id = queue_id;
                event.correlation_id = correlation_id;
                event.name = kernel_name;
                event.kernel_params = Some(KernelParams {
                    grid,
                    block: workgroup,
                    shared_mem_bytes: group_segment_bytes,
                    registers_per_thread: vgpr_count,
                    warp_size: 64,
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
            HipActivity::Copy {
                correlation_id,
                kind,
                bytes,
                src_addr,
                dst_addr,
                begin,
                end,
                device_id,
                queue_id,
                is_async,
            } => {
                let (event_kind, direction_unknown) = match kind {
                    HipMemcpyKind::HostToDevice => (EventKind::MemcpyH2D, false),
                    HipMemcpyKind::DeviceToHost => (EventKind::MemcpyD2H, false),
                    HipMemcpyKind::DeviceToDevice => (EventKind::MemcpyD2D, false),
                    HipMemcpyKind::Unknown => (EventKind::MemcpyH2D, true),
                };
                let mut event = TraceEvent::new(event_kind);
                event.timestamp = begin;
                event.duration = end.saturating_sub(begin);
                event.device_id = device_id;
                event.stream_id = queue_id;
                event.correlation_id = correlation_id;
                event.memory_params = Some(MemoryParams {
                    src_addr,
                    dst_addr,
                    bytes,
                    is_async,
                });
                if direction_unknown {
                    event.set_metadata("direction", "unknown");
                }
                if let Some((thread_id, _)) = core.correlation.peek(correlation_id) {
                    event.thread_id = thread_id;
                }
                core.submit(event);
            }
            HipActivity::Barrier {
                correlation_id,
                device_wide,
                begin,
                end,
                device_id,
                queue_id,
            } => {
                let mut event = TraceEvent::new(if device_wide {
                    EventKind::DeviceSync
                } else {
                    EventKind::StreamSync
                });
                event.timestamp = begin;
                event.duration = end.saturating_sub(begin);
                event.device_id = device_id;
                event.stream_id = queue_id;
                event.correlation_id = correlation_id;
                core.submit(event);
            }
        }
    }

    pub fn ignore_record(&mut self) {
        self.ignored_records += 1;
    }

    pub fn ignored_records(&self) -> u64 {
        self.ignored_records
    }

    fn enumerate_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        // KFD topology: one directory per node, GPUs have a non-zero
        // simd_count property.
        if let Ok(entries) = std::fs::read_dir("/sys/class/kfd/kfd/topology/nodes") {
            let mut index = 0u32;
            for entry in entries.flatten() {
                let name = std::fs::read_to_string(entry.path().join("name"))
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                if name.is_empty() || name == "cpu" {
                    continue;
                }
                devices.push(DeviceInfo {
                    device_id: index,
                    vendor: "AMD".to_string(),
                    name,
                    ..Default::default()
                });
                index += 1;
            }
        }
        if devices.is_empty() && is_rocm_available() {
            devices.push(DeviceInfo {
                device_id: 0,
                vendor: "AMD".to_string(),
                name: "AMD GPU 0".to_string(),
                ..Default::default()
            });
        }
        devices
    }
}

impl PlatformProfiler for RocmProfiler {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Rocm
    }

    fn initialize(&mut self, config: &ProfilerConfig) -> Result<()> {
        if !is_rocm_available() {
            bail!("ROCm runtime not present on this system");
        }
        if self.core.is_some() {
            bail!("ROCm profiler initialized twice");
        }
        self.devices = Self::enumerate_devices();
        self.core = Some(AdapterCore::new(config));
        tracing::info!(devices = self.devices.len(), "roctracer profiler initialized");
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

    fn offline_profiler() -> RocmProfiler {
        let mut profiler = RocmProfiler::new();
        profiler.core = Some(AdapterCore::new(&ProfilerConfig::default()));
        profiler.core.as_ref().unwrap().set_capturing(true);
        profiler
    }

    #[test]
    fn test_unknown_direction_tagged() {
        let mut profiler = offline_profiler();
        profiler.handle_activity(HipActivity::Copy {
            correlation_id: 1,
            kind: HipMemcpyKind::Unknown,
            bytes: 1024,
            src_addr: 0x1000,
            dst_addr: 0x2000,
            begin: 10,
            end: 30,
            device_id: 0,
            queue_id: 0,
            is_async: false,
        });
        let events = profiler.drain_events(usize::MAX);
        assert_eq!(events[0].kind, EventKind::MemcpyH2D);
        assert_eq!(events[0].metadata_value("direction"), Some("unknown"));
    }

    #[test]
    fn test_dispatch_pairing_uses_wavefront_width() {
        let mut profiler = offline_profiler();
        profiler.on_dispatch_enqueued(9, "reduce_sum", 100, 0, 1);
        profiler.handle_activity(HipActivity::KernelDispatch {
            correlation_id: 9,
            kernel_name: "reduce_sum".to_string(),
            begin: 200,
            end: 900,
            device_id: 0,
            queue_id: 1,
            grid: (64, 1, 1),
            workgroup: (256, 1, 1),
            group_segment_bytes: 8192,
            vgpr_count: 96,
        });
        let events = profiler.drain_events(usize::MAX);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kernel_params.unwrap().warp_size, 64);
        assert_eq!(events[1].thread_id, events[0].thread_id);
    }

    #[test]
    fn test_barrier_scope() {
        let mut profiler = offline_profiler();
        profiler.handle_activity(HipActivity::Barrier {
            correlation_id: 2,
            device_wide: true,
            begin: 0,
            end: 5,
            device_id: 0,
            queue_id: 0,
        });
        let events = profiler.drain_events(usize::MAX);
        assert_eq!(events[0].kind, EventKind::DeviceSync);
    }
}
