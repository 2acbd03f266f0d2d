//! Vendor capture adapters.
//!
//! Each adapter translates one runtime's callback/activity interface into
//! [`TraceEvent`]s submitted to a shared [`EventSink`]. The factory probes
//! platforms in a fixed order and returns nothing for runtimes that are not
//! present, so a front end can fall through to the next candidate.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::events::{
    CorrelationId, DeviceInfo, PlatformKind, ThreadId, Timestamp, TraceEvent,
};
use crate::sink::{EventSink, LiveCallback, SubmitResult};
use crate::stack::{StackCapturer, StackConfig};

pub mod ascend;
pub mod cuda;
pub mod maca;
pub mod metal;
pub mod rocm;
pub mod simulation;

pub use ascend::AscendProfiler;
pub use cuda::CuptiProfiler;
pub use maca::McptiProfiler;
pub use metal::MetalProfiler;
pub use rocm::RocmProfiler;
pub use simulation::SimulationProfiler;

/// Capture tuning shared by all adapters.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// Event buffer capacity; overflow is counted, not stored.
    pub buffer_capacity: usize,
    /// Snapshot a host call stack on each launch event.
    pub capture_callstacks: bool,
    pub callstack_depth: usize,
    pub resolve_symbols: bool,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        ProfilerConfig {
            buffer_capacity: EventSink::DEFAULT_CAPACITY,
            capture_callstacks: false,
            callstack_depth: 32,
            resolve_symbols: false,
        }
    }
}

/// The uniform adapter contract: configure, start, drain, stop.
///
/// `initialize` must fail when the vendor runtime is absent; between `start`
/// and `stop` every vendor callback turns into zero or more sink submissions.
pub trait PlatformProfiler: Send {
    fn platform(&self) -> PlatformKind;
    fn initialize(&mut self, config: &ProfilerConfig) -> Result<()>;
    fn start_capture(&mut self) -> Result<()>;
    fn stop_capture(&mut self) -> Result<()>;
    fn is_capturing(&self) -> bool;
    /// Move up to `max` captured events out, in submission order.
    fn drain_events(&mut self, max: usize) -> Vec<TraceEvent>;
    fn devices(&self) -> Vec<DeviceInfo>;
    fn events_captured(&self) -> u64;
    fn events_dropped(&self) -> u64;
    /// Observe each event on the producer thread, ahead of buffering.
    fn set_live_callback(&mut self, callback: LiveCallback);
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Kernel-side thread id, for tagging events with their submitting thread.
pub fn current_thread_id() -> ThreadId {
    (unsafe { libc::syscall(libc::SYS_gettid) }) as ThreadId
}

/// Launch bookkeeping shared by the adapters: the launch records
/// `(correlation -> thread, host timestamp)`, the asynchronous completion
/// record picks both up again so paired spans reconstruct downstream.
///
/// Vendor callbacks can arrive in parallel, so the map lives behind a lock.
#[derive(Default)]
pub struct CorrelationTracker {
    launches: Mutex<std::collections::HashMap<CorrelationId, (ThreadId, Timestamp)>>,
}

impl CorrelationTracker {
    pub fn record_launch(&self, correlation: CorrelationId, thread: ThreadId, host_ts: Timestamp) {
        self.launches
            .lock()
            .unwrap()
            .insert(correlation, (thread, host_ts));
    }

    /// Consume the launch entry for a completion record.
    pub fn take(&self, correlation: CorrelationId) -> Option<(ThreadId, Timestamp)> {
        self.launches.lock().unwrap().remove(&correlation)
    }

    pub fn peek(&self, correlation: CorrelationId) -> Option<(ThreadId, Timestamp)> {
        self.launches.lock().unwrap().get(&correlation).copied()
    }

    pub fn pending(&self) -> usize {
        self.launches.lock().unwrap().len()
    }
}

/// State every vendor adapter shares: the sink, correlation bookkeeping,
/// correlation id allocation and the optional stack capturer.
pub struct AdapterCore {
    pub sink: Arc<EventSink>,
    pub correlation: CorrelationTracker,
    capturing: AtomicBool,
    next_correlation: AtomicU64,
    stack_capturer: Option<StackCapturer>,
}

impl AdapterCore {
    pub fn new(config: &ProfilerConfig) -> Self {
        let stack_capturer = if config.capture_callstacks {
            Some(StackCapturer::new(StackConfig {
                max_depth: config.callstack_depth,
                resolve_symbols: config.resolve_symbols,
                ..StackConfig::default()
            }))
        } else {
            None
        };
        AdapterCore {
            sink: Arc::new(EventSink::new(config.buffer_capacity)),
            correlation: CorrelationTracker::default(),
            capturing: AtomicBool::new(false),
            next_correlation: AtomicU64::new(1),
            stack_capturer,
        }
    }

    pub fn set_capturing(&self, on: bool) {
        self.capturing.store(on, Ordering::SeqCst);
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    pub fn next_correlation_id(&self) -> CorrelationId {
        self.next_correlation.fetch_add(1, Ordering::Relaxed)
    }

    /// Submit if capturing; events arriving outside a capture window are
    /// discarded without touching the drop counter.
    pub fn submit(&self, event: TraceEvent) -> SubmitResult {
        if !self.is_capturing() {
            return SubmitResult::Dropped;
        }
        self.sink.submit(event)
    }

    /// Attach a host stack to a launch event when stack capture is on.
    pub fn attach_stack(&self, event: &mut TraceEvent) {
        if let Some(capturer) = &self.stack_capturer {
            let stack = capturer.capture_resolved();
            if !stack.is_empty() {
                event.call_stack = Some(stack);
            }
        }
    }
}

/// Probe platforms in the order the capture stack prefers them and report
/// the first whose runtime answers.
pub fn detect_platform() -> PlatformKind {
    if cuda::is_cuda_available() {
        return PlatformKind::Cuda;
    }
    if maca::is_maca_available() {
        return PlatformKind::Maca;
    }
    if metal::is_metal_available() {
        return PlatformKind::Metal;
    }
    if ascend::is_ascend_available() {
        return PlatformKind::Ascend;
    }
    if rocm::is_rocm_available() {
        return PlatformKind::Rocm;
    }
    PlatformKind::Unknown
}

/// Build the adapter for one platform, or `None` when its runtime is absent.
/// The simulation adapter is always available.
pub fn create_profiler(kind: PlatformKind) -> Option<Box<dyn PlatformProfiler>> {
    match kind {
        PlatformKind::Cuda if cuda::is_cuda_available() => {
            Some(Box::new(CuptiProfiler::new()))
        }
        PlatformKind::Rocm if rocm::is_rocm_available() => {
            Some(Box::new(RocmProfiler::new()))
        }
        PlatformKind::Metal if metal::is_metal_available() => {
            Some(Box::new(MetalProfiler::new()))
        }
        PlatformKind::Maca if maca::is_maca_available() => {
            Some(Box::new(McptiProfiler::new()))
        }
        PlatformKind::Ascend if ascend::is_ascend_available() => {
            Some(Box::new(AscendProfiler::new()))
        }
        PlatformKind::Simulation => Some(Box::new(SimulationProfiler::new())),
        _ => None,
    }
}

/// Build the first adapter whose runtime answers, falling through the probe
/// order when a platform yields nothing.
pub fn create_any_profiler() -> Option<Box<dyn PlatformProfiler>> {
    for kind in [
        PlatformKind::Cuda,
        PlatformKind::Maca,
        PlatformKind::Metal,
        PlatformKind::Ascend,
        PlatformKind::Rocm,
    ] {
        if let Some(profiler) = create_profiler(kind) {
            return Some(profiler);
        }
    }
    None
}

/// Parse a `--platform` style argument, `auto` meaning detection.
pub fn platform_from_arg(arg: &str) -> Result<Option<PlatformKind>> {
    if arg == "auto" {
        return Ok(None);
    }
    Ok(Some(PlatformKind::from_str(arg)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_tracker_pairs() {
        let tracker = CorrelationTracker::default();
        tracker.record_launch(7, 1234, 1_000);
        assert_eq!(tracker.pending(), 1);
        assert_eq!(tracker.take(7), Some((1234, 1_000)));
        assert_eq!(tracker.take(7), None);
    }

    #[test]
    fn test_core_discards_outside_capture_window() {
        let core = AdapterCore::new(&ProfilerConfig::default());
        let event = TraceEvent::new(crate::events::EventKind::Marker);
        assert_eq!(core.submit(event.clone()), SubmitResult::Dropped);
        assert_eq!(core.sink.events_captured(), 0);

        core.set_capturing(true);
        assert_eq!(core.submit(event), SubmitResult::Ok);
        assert_eq!(core.sink.events_captured(), 1);
    }

    #[test]
    fn test_correlation_ids_monotonic() {
        let core = AdapterCore::new(&ProfilerConfig::default());
        let a = core.next_correlation_id();
        let b = core.next_correlation_id();
        assert!(b > a);
    }

    #[test]
    fn test_simulation_always_constructible() {
        assert!(create_profiler(PlatformKind::Simulation).is_some());
    }
}
