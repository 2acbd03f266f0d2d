//! Metal capture adapter.
//!
//! Metal has no CUPTI-style activity queue; timing comes from command-buffer
//! completion handlers, which deliver whole buffers after the GPU retires
//! them. Each handled buffer expands into launch/complete pairs (one per
//! encoded dispatch) plus optional blit events, all sharing the buffer's
//! scheduling thread.

use anyhow::{bail, Result};

use crate::capture::{current_thread_id, AdapterCore, PlatformProfiler, ProfilerConfig};
use crate::events::{
    CorrelationId, DeviceId, DeviceInfo, EventKind, KernelParams, MemoryParams, PlatformKind,
    StreamId, Timestamp, TraceEvent,
};
use crate::sink::LiveCallback;

pub fn is_metal_available() -> bool {
    // Metal ships with the OS; any macOS host qualifies.
    cfg!(target_os = "macos")
}

/// One compute dispatch encoded in a completed command buffer.
#[derive(Debug, Clone)]
pub struct MetalDispatch {
    pub pipeline_name: String,
    pub gpu_start: Timestamp,
    pub gpu_end: Timestamp,
    pub threadgroups: (u32, u32, u32),
    pub threads_per_group: (u32, u32, u32),
}

/// One blit (copy) encoded in a completed command buffer.
#[derive(Debug, Clone)]
pub struct MetalBlit {
    pub to_device: bool,
    pub bytes: u64,
    pub gpu_start: Timestamp,
    pub gpu_end: Timestamp,
}

/// A retired command buffer as the completion handler sees it.
#[derive(Debug, Clone)]
pub struct MetalCommandBuffer {
    pub device_id: DeviceId,
    /// Command queues play the role of streams.
    pub queue_id: StreamId,
    pub dispatches: Vec<MetalDispatch>,
    pub blits: Vec<MetalBlit>,
}

pub struct MetalProfiler {
    core: Option<AdapterCore>,
    devices: Vec<DeviceInfo>,
}

impl Default for MetalProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetalProfiler {
    pub fn new() -> Self {
        MetalProfiler {
            core: None,
            devices: vec![DeviceInfo {
                device_id: 0,
                vendor: "Apple".to_string(),
                name: "Apple GPU".to_string(),
                ..Default::default()
            }],
        }
    }

    fn core(&self) -> Result<&AdapterCore> {
        match &self.core {
            Some(core) => Ok(core),
            None => bail!("Metal profiler is not initialized"),
        }
    }

    /// Completion handler: expand one retired command buffer into events.
    pub fn on_command_buffer_completed(&mut self, buffer: MetalCommandBuffer) {
        let Some(core) = &self.core else { return };
        let thread_id = current_thread_id();

        for dispatch in buffer.dispatches {
            let correlation: CorrelationId = core.next_correlation_id();
            core.correlation
                .record_launch(correlation, thread_id, dispatch.gpu_start);

            let mut launch = TraceEvent::new(EventKind::KernelLaunch);
            launch.timestamp = dispatch.gpu_start;
            launch.device_id = buffer.device_id;
            launch.stream_id = buffer.queue_id;
            launch.correlation_id = correlation;
            launch.thread_id = thread_id;
            launch.name = dispatch.pipeline_name.clone();
            launch.kernel_params = Some(KernelParams {
                grid: dispatch.threadgroups,
                block: dispatch.threads_per_group,
                shared_mem_bytes: 0,
                registers_per_thread: 0,
                warp_size: 32,
            });
            core.attach_stack(&mut launch);
            core.submit(launch);

            let mut complete = TraceEvent::new(EventKind::KernelComplete);
            complete.timestamp = dispatch.gpu_end;
            complete.duration = dispatch.gpu_end.saturating_sub(dispatch.gpu_start);
            complete.device_id = buffer.device_id;
            complete.stream_id = buffer.queue_id;
            complete.correlation_id = correlation;
            complete.name = dispatch.pipeline_name;
            if let Some((launch_thread, _)) = core.correlation.take(correlation) {
                complete.thread_id = launch_thread;
            }
            core.submit(complete);
        }

        for blit in buffer.blits {
            let mut event = TraceEvent::new(if blit.to_device {
                EventKind::MemcpyH2D
            } else {
                EventKind::MemcpyD2H
            });
            event.timestamp = blit.gpu_start;
            event.duration = blit.gpu_end.saturating_sub(blit.gpu_start);
            event.device_id = buffer.device_id;
            event.stream_id = buffer.queue_id;
            event.correlation_id = core.next_correlation_id();
            event.thread_id = thread_id;
            event.memory_params = Some(MemoryParams {
                src_addr: 0,
                dst_addr: 0,
                bytes: blit.bytes,
                is_async: true,
            });
            core.submit(event);
        }
    }
}

impl PlatformProfiler for MetalProfiler {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Metal
    }

    fn initialize(&mut self, config: &ProfilerConfig) -> Result<()> {
        if !is_metal_available() {
            bail!("Metal runtime not present on this system");
        }
        if self.core.is_some() {
            bail!("Metal profiler initialized twice");
        }
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

    fn offline_profiler() -> MetalProfiler {
        let mut profiler = MetalProfiler::new();
        profiler.core = Some(AdapterCore::new(&ProfilerConfig::default()));
        profiler.core.as_ref().unwrap().set_capturing(true);
        profiler
    }

    #[test]
    fn test_command_buffer_expands_to_pairs() {
        let mut profiler = offline_profiler();
        profiler.on_command_buffer_completed(MetalCommandBuffer {
            device_id: 0,
            queue_id: 2,
            dispatches: vec![MetalDispatch {
                pipeline_name: "softmax_rows".to_string(),
                gpu_start: 1_000,
                gpu_end: 4_000,
                threadgroups: (32, 1, 1),
                threads_per_group: (64, 1, 1),
            }],
            blits: vec![MetalBlit {
                to_device: true,
                bytes: 2048,
                gpu_start: 500,
                gpu_end: 800,
            }],
        });

        let events = profiler.drain_events(usize::MAX);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EventKind::KernelLaunch);
        assert_eq!(events[1].kind, EventKind::KernelComplete);
        assert_eq!(events[0].correlation_id, events[1].correlation_id);
        assert_eq!(events[2].kind, EventKind::MemcpyH2D);
        assert_eq!(events[1].duration, 3_000);
    }
}
