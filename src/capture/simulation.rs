//! Deterministic in-process adapter.
//!
//! Stands in for a vendor runtime wherever none is present: tests, demos and
//! `record --platform sim`. Workloads are generated from a fixed schedule so
//! two runs with the same parameters produce identical event sequences apart
//! from the capture epoch.

use anyhow::{bail, Result};

use crate::capture::{current_thread_id, AdapterCore, PlatformProfiler, ProfilerConfig};
use crate::events::{
    DeviceInfo, EventKind, KernelParams, MemoryParams, PlatformKind, TraceEvent,
};
use crate::sink::LiveCallback;

const SIM_KERNEL_NAMES: &[&str] = &[
    "vector_add",
    "matmul_f32",
    "softmax_rows",
    "layer_norm",
    "reduce_sum",
];

/// Parameters for one synthetic workload burst.
#[derive(Debug, Clone)]
pub struct SimWorkload {
    pub kernels: usize,
    pub streams: u32,
    /// Nanoseconds between successive launches.
    pub launch_interval_ns: u64,
    /// Kernel execution time.
    pub kernel_duration_ns: u64,
    /// Emit a host-to-device copy before each kernel.
    pub with_memcpy: bool,
    /// Close the burst with one StreamSync per stream.
    pub with_sync: bool,
}

impl Default for SimWorkload {
    fn default() -> Self {
        SimWorkload {
            kernels: 16,
            streams: 2,
            launch_interval_ns: 50_000,
            kernel_duration_ns: 40_000,
            with_memcpy: false,
            with_sync: true,
        }
    }
}

/// Adapter emitting a scripted event stream through the standard capture
/// plumbing (sink, correlation tracking, stack attachment).
pub struct SimulationProfiler {
    core: Option<AdapterCore>,
    devices: Vec<DeviceInfo>,
    /// Synthetic clock, nanoseconds. Advances as workloads are emitted.
    clock: u64,
}

impl Default for SimulationProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulationProfiler {
    pub fn new() -> Self {
        SimulationProfiler {
            core: None,
            devices: vec![DeviceInfo {
                device_id: 0,
                vendor: "TraceSmith".to_string(),
                name: "Simulated Accelerator".to_string(),
                compute_major: 1,
                compute_minor: 0,
                total_memory: 8 << 30,
                multiprocessor_count: 32,
                clock_rate_khz: 1_500_000,
                metadata: vec![("backend".to_string(), "simulation".to_string())],
            }],
            clock: 1_000_000,
        }
    }

    fn core(&self) -> Result<&AdapterCore> {
        match &self.core {
            Some(core) => Ok(core),
            None => bail!("simulation profiler is not initialized"),
        }
    }

    /// Emit one workload burst. Only valid while capturing.
    pub fn emit_workload(&mut self, workload: &SimWorkload) -> Result<()> {
        let core = self.core()?;
        if !core.is_capturing() {
            bail!("cannot emit workload: capture is not running");
        }

        let thread_id = current_thread_id();
        let mut clock = self.clock;

        for i in 0..workload.kernels {
            let stream = (i as u32) % workload.streams.max(1);
            let name = SIM_KERNEL_NAMES[i % SIM_KERNEL_NAMES.len()];
            let correlation = core.next_correlation_id();

            if workload.with_memcpy {
                let copy_correlation = core.next_correlation_id();
                let mut copy = TraceEvent::new(EventKind::MemcpyH2D);
                copy.timestamp = clock;
                copy.duration = 5_000;
                copy.stream_id = stream;
                copy.correlation_id = copy_correlation;
                copy.thread_id = thread_id;
                copy.memory_params = Some(MemoryParams {
                    src_addr: 0x7f00_0000_0000 + (i as u64) * 0x1000,
                    dst_addr: 0xd000_0000 + (i as u64) * 0x1000,
                    bytes: 1 << 20,
                    is_async: true,
                });
                core.submit(copy);
                clock += 10_000;
            }

            let mut launch = TraceEvent::new(EventKind::KernelLaunch);
            launch.timestamp = clock;
            launch.stream_id = stream;
            launch.correlation_id = correlation;
            launch.thread_id = thread_id;
            launch.name = name.to_string();
            launch.kernel_params = Some(KernelParams {
                grid: (256, 1, 1),
                block: (128, 1, 1),
                shared_mem_bytes: 4096,
                registers_per_thread: 40,
                warp_size: 32,
            });
            core.attach_stack(&mut launch);
            core.correlation.record_launch(correlation, thread_id, clock);
            core.submit(launch);

            let complete_ts = clock + workload.kernel_duration_ns;
            let mut complete = TraceEvent::new(EventKind::KernelComplete);
            complete.timestamp = complete_ts;
            complete.duration = workload.kernel_duration_ns;
            complete.stream_id = stream;
            complete.correlation_id = correlation;
            complete.name = name.to_string();
            if let Some((launch_thread, _)) = core.correlation.take(correlation) {
                complete.thread_id = launch_thread;
            }
            core.submit(complete);

            clock += workload.launch_interval_ns;
        }

        if workload.with_sync {
            for stream in 0..workload.streams.max(1) {
                let mut sync = TraceEvent::new(EventKind::StreamSync);
                sync.timestamp = clock;
                sync.duration = 1_000;
                sync.stream_id = stream;
                sync.correlation_id = core.next_correlation_id();
                sync.thread_id = thread_id;
                core.submit(sync);
            }
            clock += 10_000;
        }

        self.clock = clock;
        Ok(())
    }

    /// Emit a scripted allocation/free pair, for ledger exercising.
    pub fn emit_alloc_free(&mut self, addr: u64, bytes: u64) -> Result<()> {
        let core = self.core()?;
        let thread_id = current_thread_id();

        let mut alloc = TraceEvent::new(EventKind::MemAlloc);
        alloc.timestamp = self.clock;
        alloc.thread_id = thread_id;
        alloc.correlation_id = core.next_correlation_id();
        alloc.memory_params = Some(MemoryParams {
            src_addr: 0,
            dst_addr: addr,
            bytes,
            is_async: false,
        });
        core.submit(alloc);

        let mut free = TraceEvent::new(EventKind::MemFree);
        free.timestamp = self.clock + 1_000;
        free.thread_id = thread_id;
        free.correlation_id = core.next_correlation_id();
        free.memory_params = Some(MemoryParams {
            src_addr: 0,
            dst_addr: addr,
            bytes,
            is_async: false,
        });
        core.submit(free);

        self.clock += 2_000;
        Ok(())
    }
}

impl PlatformProfiler for SimulationProfiler {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Simulation
    }

    fn initialize(&mut self, config: &ProfilerConfig) -> Result<()> {
        if self.core.is_some() {
            bail!("simulation profiler initialized twice");
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

    fn ready_profiler() -> SimulationProfiler {
        let mut profiler = SimulationProfiler::new();
        profiler.initialize(&ProfilerConfig::default()).unwrap();
        profiler.start_capture().unwrap();
        profiler
    }

    #[test]
    fn test_launch_complete_pairing_within_drain() {
        let mut profiler = ready_profiler();
        profiler.emit_workload(&SimWorkload::default()).unwrap();
        let events = profiler.drain_events(usize::MAX);

        let mut seen_launches = std::collections::HashSet::new();
        for event in &events {
            match event.kind {
                EventKind::KernelLaunch => {
                    seen_launches.insert(event.correlation_id);
                }
                EventKind::KernelComplete => {
                    assert!(
                        seen_launches.contains(&event.correlation_id),
                        "completion {} has no prior launch in drain",
                        event.correlation_id
                    );
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_workload_is_deterministic_in_shape() {
        let collect = || {
            let mut profiler = ready_profiler();
            profiler.emit_workload(&SimWorkload::default()).unwrap();
            profiler
                .drain_events(usize::MAX)
                .into_iter()
                .map(|e| (e.kind, e.timestamp, e.stream_id, e.name))
                .collect::<Vec<_>>()
        };
        assert_eq!(collect(), collect());
    }

    #[test]
    fn test_requires_capture_window() {
        let mut profiler = SimulationProfiler::new();
        profiler.initialize(&ProfilerConfig::default()).unwrap();
        assert!(profiler.emit_workload(&SimWorkload::default()).is_err());
    }

    #[test]
    fn test_thread_id_tagged() {
        let mut profiler = ready_profiler();
        profiler
            .emit_workload(&SimWorkload {
                kernels: 1,
                ..SimWorkload::default()
            })
            .unwrap();
        let events = profiler.drain_events(usize::MAX);
        let tid = current_thread_id();
        assert!(events.iter().all(|e| e.thread_id == tid));
    }
}
