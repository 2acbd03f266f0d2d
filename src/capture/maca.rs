//! MetaX MACA capture adapter (MCPTI model).
//!
//! MCPTI mirrors the CUPTI split: a runtime callback on the submitting
//! thread at enqueue time, asynchronous activity records with device
//! timestamps afterwards. The record shapes differ enough from CUPTI to
//! warrant their own types, but the pairing discipline is identical.

use std::path::Path;

use anyhow::{bail, Result};

use crate::capture::{current_thread_id, AdapterCore, PlatformProfiler, ProfilerConfig};
use crate::events::{
    CorrelationId, DeviceId, DeviceInfo, EventKind, FlowInfo, KernelParams, MemoryParams,
    PlatformKind, StreamId, Timestamp, TraceEvent, FLOW_TYPE_KERNEL,
};
use crate::sink::LiveCallback;

const MACA_DEVICE_NODES: &[&str] = &["/dev/mxcd", "/dev/metax0"];
const MACA_DRIVER_LIBS: &[&str] = &[
    "/opt/maca/lib/libmcruntime.so",
    "/opt/maca/lib64/libmcruntime.so",
];

pub fn is_maca_available() -> bool {
    MACA_DEVICE_NODES.iter().any(|p| Path::new(p).exists())
        || MACA_DRIVER_LIBS.iter().any(|p| Path::new(p).exists())
}

/// Direction codes as MCPTI reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McMemcpyKind {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

/// Asynchronous MCPTI activity records.
#[derive(Debug, Clone)]
pub enum McActivity {
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
    },
    Memcpy {
        correlation_id: CorrelationId,
        kind: McMemcpyKind,
        bytes: u64,
        src_addr: u64,
        dst_addr: u64,
        start: Timestamp,
        end: Timestamp,
        device_id: DeviceId,
        stream_id: StreamId,
        is_async: bool,
    },
    StreamSynchronize {
        correlation_id: CorrelationId,
        start: Timestamp,
        end: Timestamp,
        device_id: DeviceId,
        stream_id: StreamId,
    },
}

pub struct McptiProfiler {
    core: Option<AdapterCore>,
    devices: Vec<DeviceInfo>,
}

impl Default for McptiProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl McptiProfiler {
    pub fn new() -> Self {
        McptiProfiler {
            core: None,
            devices: Vec::new(),
        }
    }

    fn core(&self) -> Result<&AdapterCore> {
        match &self.core {
            Some(core) => Ok(core),
            None => bail!("MACA profiler is not initialized"),
        }
    }

    /// Runtime callback: a kernel launch was enqueued on this thread.
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

    /// Translate one MCPTI activity record.
    pub fn handle_activity(&mut self, activity: McActivity) {
        let Some(core) = &self.core else { return };

        match activity {
            McActivity::Kernel {
                correlation_id,
                name,
                start,
                end,
                device_id,
                stream_id,
                grid,
                block,
                shared_mem_bytes,
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
                    registers_per_thread: 0,
                    warp_size: 64,
                });
                if let Some((thread_id, _)) = core.correlation.take(correlation_id) {
                    event.thread_id = thread_id;
                }
                core.submit(event);
            }
            McActivity::Memcpy {
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
                    McMemcpyKind::HostToDevice => EventKind::MemcpyH2D,
                    McMemcpyKind::DeviceToHost => EventKind::MemcpyD2H,
                    McMemcpyKind::DeviceToDevice => EventKind::MemcpyD2D,
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
                core.submit(event);
            }
            McActivity::StreamSynchronize {
                correlation_id,
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
                event.correlation_id = correlation_id;
                core.submit(event);
            }
        }
    }
}

impl PlatformProfiler for McptiProfiler {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Maca
    }

    fn initialize(&mut self, config: &ProfilerConfig) -> Result<()> {
        if !is_maca_available() {
            bail!("MACA runtime not present on this system");
        }
        if self.core.is_some() {
            bail!("MACA profiler initialized twice");
        }
        self.devices = vec![DeviceInfo {
            device_id: 0,
            vendor: "MetaX".to_string(),
            name: "MetaX GPU 0".to_string(),
            ..Default::default()
        }];
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
    fn test_kernel_record_translation() {
        let mut profiler = McptiProfiler::new();
        profiler.core = Some(AdapterCore::new(&ProfilerConfig::default()));
        profiler.core.as_ref().unwrap().set_capturing(true);

        profiler.on_launch_enqueued(3, "layer_norm", 50, 0, 0);
        profiler.handle_activity(McActivity::Kernel {
            correlation_id: 3,
            name: "layer_norm".to_string(),
            start: 100,
            end: 400,
            device_id: 0,
            stream_id: 0,
            grid: (8, 1, 1),
            block: (128, 1, 1),
            shared_mem_bytes: 1024,
        });
        let events = profiler.drain_events(usize::MAX);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].duration, 300);
        assert_eq!(events[0].correlation_id, events[1].correlation_id);
    }
}
