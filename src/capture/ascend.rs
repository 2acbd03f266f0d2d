//! Huawei Ascend capture adapter (CANN/AscendCL model).
//!
//! CANN profiling subscriptions report whole operator executions after the
//! fact: one record per op with task timestamps, no separate enqueue
//! callback. Each op record therefore expands into a launch/complete pair
//! here, and memcpy records carry an explicit direction code.

use std::path::Path;

use anyhow::{bail, Result};

use crate::capture::{current_thread_id, AdapterCore, PlatformProfiler, ProfilerConfig};
use crate::events::{
    CorrelationId, DeviceId, DeviceInfo, EventKind, MemoryParams, PlatformKind, StreamId,
    Timestamp, TraceEvent,
};
use crate::sink::LiveCallback;

const ASCEND_DEVICE_NODES: &[&str] = &["/dev/davinci0", "/dev/davinci_manager"];
const ASCEND_INSTALL_ROOTS: &[&str] = &["/usr/local/Ascend", "/opt/Ascend"];

pub fn is_ascend_available() -> bool {
    ASCEND_DEVICE_NODES.iter().any(|p| Path::new(p).exists())
        || ASCEND_INSTALL_ROOTS.iter().any(|p| Path::new(p).exists())
}

/// aclrtMemcpy direction codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclMemcpyKind {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

/// Profiling records from the CANN subscription callback.
#[derive(Debug, Clone)]
pub enum AclRecord {
    /// One operator execution on an NPU task queue.
    OpExecute {
        op_name: String,
        op_type: String,
        start: Timestamp,
        end: Timestamp,
        device_id: DeviceId,
        stream_id: StreamId,
        /// Number of AI-core tasks the op was tiled into.
        task_count: u32,
    },
    Memcpy {
        kind: AclMemcpyKind,
        bytes: u64,
        src_addr: u64,
        dst_addr: u64,
        start: Timestamp,
        end: Timestamp,
        device_id: DeviceId,
        stream_id: StreamId,
    },
    StreamSynchronize {
        start: Timestamp,
        end: Timestamp,
        device_id: DeviceId,
        stream_id: StreamId,
    },
}

pub struct AscendProfiler {
    core: Option<AdapterCore>,
    devices: Vec<DeviceInfo>,
}

impl Default for AscendProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl AscendProfiler {
    pub fn new() -> Self {
        AscendProfiler {
            core: None,
            devices: Vec::new(),
        }
    }

    fn core(&self) -> Result<&AdapterCore> {
        match &self.core {
            Some(core) => Ok(core),
            None => bail!("Ascend profiler is not initialized"),
        }
    }

    /// Translate one CANN profiling record.
    pub fn handle_record(&mut self, record: AclRecord) {
        let Some(core) = &self.core else { return };
        let thread_id = current_thread_id();

        match record {
            AclRecord::OpExecute {
                op_name,
                op_type,
                start,
                end,
                device_id,
                stream_id,
                task_count,
            } => {
                let correlation: CorrelationId = core.next_correlation_id();
                core.correlation.record_launch(correlation, thread_id, start);

                let mut launch = TraceEvent::new(EventKind::KernelLaunch);
                launch.timestamp = start;
                launch.device_id = device_id;
                launch.stream_id = stream_id;
                launch.correlation_id = correlation;
                launch.thread_id = thread_id;
                launch.name = op_name.clone();
                launch.set_metadata("op_type", op_type);
                launch.set_metadata("task_count", task_count.to_string());
                core.attach_stack(&mut launch);
                core.submit(launch);

                let mut complete = TraceEvent::new(EventKind::KernelComplete);
                complete.timestamp = end;
                complete.duration = end.saturating_sub(start);
                complete.device_id = device_id;
                complete.stream_id = stream_id;
                complete.correlation_id = correlation;
                complete.name = op_name;
                if let Some((launch_thread, _)) = core.correlation.take(correlation) {
                    complete.thread_id = launch_thread;
                }
                core.submit(complete);
            }
            AclRecord::Memcpy {
                kind,
                bytes,
                src_addr,
                dst_addr,
                start,
                end,
                device_id,
                stream_id,
            } => {
                let event_kind = match kind {
                    AclMemcpyKind::HostToDevice => EventKind::MemcpyH2D,
                    AclMemcpyKind::DeviceToHost => EventKind::MemcpyD2H,
                    AclMemcpyKind::DeviceToDevice => EventKind::MemcpyD2D,
                };
                let mut event = TraceEvent::new(event_kind);
                event.timestamp = start;
                event.duration = end.saturating_sub(start);
                event.device_id = device_id;
                event.stream_id = stream_id;
                event.correlation_id = core.next_correlation_id();
                event.thread_id = thread_id;
                event.memory_params = Some(MemoryParams {
                    src_addr,
                    dst_addr,
                    bytes,
                    is_async: false,
                });
                core.submit(event);
            }
            AclRecord::StreamSynchronize {
                start,
                end,
                device_id,
                stream_id,
            } => {
                let mut event = TraceEvent::new(EventKind::StreamSync);
                event.timestamp = start;
                event.duration = end.saturating_sub(start);
                event.device_id = device_id;
                event.stream_id = stream_id;
                event.correlation_id = core.next_correlation_id();
                event.thread_id = thread_id;
                core.submit(event);
            }
        }
    }

    fn enumerate_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        // One /dev/davinciN node per NPU.
        for index in 0..64u32 {
            if Path::new(&format!("/dev/davinci{index}")).exists() {
                devices.push(DeviceInfo {
                    device_id: index,
                    vendor: "Huawei".to_string(),
                    name: format!("Ascend NPU {index}"),
                    ..Default::default()
                });
            }
        }
        if devices.is_empty() && is_ascend_available() {
            devices.push(DeviceInfo {
                device_id: 0,
                vendor: "Huawei".to_string(),
                name: "Ascend NPU 0".to_string(),
                ..Default::default()
            });
        }
        devices
    }
}

impl PlatformProfiler for AscendProfiler {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Ascend
    }

    fn initialize(&mut self, config: &ProfilerConfig) -> Result<()> {
        if !is_ascend_available() {
            bail!("Ascend CANN runtime not present on this system");
        }
        if self.core.is_some() {
            bail!("Ascend profiler initialized twice");
        }
        self.devices = Self::enumerate_devices();
        self.core = Some(AdapterCore::new(config));
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

    #[test]
    fn test_op_record_expands_to_pair() {
        let mut profiler = AscendProfiler::new();
        profiler.core = Some(AdapterCore::new(&ProfilerConfig::default()));
        profiler.core.as_ref().unwrap().set_capturing(true);

        profiler.handle_record(AclRecord::OpExecute {
            op_name: "MatMulV2".to_string(),
            op_type: "MatMul".to_string(),
            start: 1_000,
            end: 5_000,
            device_id: 0,
            stream_id: 1,
            task_count: 4,
        });

        let events = profiler.drain_events(usize::MAX);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::KernelLaunch);
        assert_eq!(events[0].metadata_value("op_type"), Some("MatMul"));
        assert_eq!(events[1].kind, EventKind::KernelComplete);
        assert_eq!(events[1].duration, 4_000);
        assert_eq!(events[0].correlation_id, events[1].correlation_id);
    }
}
