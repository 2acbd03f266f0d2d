//! GPU debug engine.
//!
//! Aggregates a capture adapter, the GPU state machine, GPU breakpoints,
//! bounded event/kernel histories and the replay cursor behind one facade
//! the RSP handler drives. Every drained event flows through the same five
//! steps: history, state machine, kernel history, breakpoint check, user
//! callback.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::capture::{create_any_profiler, create_profiler, PlatformProfiler, ProfilerConfig};
use crate::events::{
    CallStack, CorrelationId, DeviceId, DeviceInfo, EventKind, KernelParams, PlatformKind,
    StreamId, Timestamp, TraceEvent, TraceMetadata, TraceRecord,
};
use crate::replay::{ReplayCursor, ReplayStatus};
use crate::sbt::{SbtReader, SbtWriter};
use crate::state_machine::{GpuState, GpuStateMachine, MemoryUsage};

/// Event classes a GPU breakpoint can trigger on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuBreakpointKind {
    KernelLaunch,
    KernelComplete,
    MemAlloc,
    MemFree,
    MemcpyH2D,
    MemcpyD2H,
    MemcpyD2D,
    Synchronize,
    AnyEvent,
}

impl GpuBreakpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KernelLaunch => "KernelLaunch",
            Self::KernelComplete => "KernelComplete",
            Self::MemAlloc => "MemAlloc",
            Self::MemFree => "MemFree",
            Self::MemcpyH2D => "MemcpyH2D",
            Self::MemcpyD2H => "MemcpyD2H",
            Self::MemcpyD2D => "MemcpyD2D",
            Self::Synchronize => "Synchronize",
            Self::AnyEvent => "AnyEvent",
        }
    }

    fn matches_kind(&self, kind: EventKind) -> bool {
        match self {
            Self::KernelLaunch => kind == EventKind::KernelLaunch,
            Self::KernelComplete => kind == EventKind::KernelComplete,
            Self::MemAlloc => kind == EventKind::MemAlloc,
            Self::MemFree => kind == EventKind::MemFree,
            Self::MemcpyH2D => kind == EventKind::MemcpyH2D,
            Self::MemcpyD2H => kind == EventKind::MemcpyD2H,
            Self::MemcpyD2D => kind == EventKind::MemcpyD2D,
            Self::Synchronize => kind.is_sync(),
            Self::AnyEvent => true,
        }
    }
}

/// A breakpoint over the GPU event stream. Matching is a pure function of
/// `(breakpoint, event)`; hit counting happens in the engine, not here.
#[derive(Debug, Clone)]
pub struct GpuBreakpoint {
    pub id: u32,
    pub kind: GpuBreakpointKind,
    /// Shell-style wildcard over the event name; empty matches anything.
    pub kernel_pattern: String,
    pub device_filter: Option<DeviceId>,
    pub enabled: bool,
    pub hit_count: u64,
}

impl GpuBreakpoint {
    pub fn new(kind: GpuBreakpointKind) -> Self {
        GpuBreakpoint {
            id: 0,
            kind,
            kernel_pattern: String::new(),
            device_filter: None,
            enabled: true,
            hit_count: 0,
        }
    }

    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.kernel_pattern = pattern.to_string();
        self
    }

    pub fn with_device(mut self, device: DeviceId) -> Self {
        self.device_filter = Some(device);
        self
    }

    /// Pure matching: disabled, wrong kind or filtered device never match;
    /// the pattern globs against the event name.
    pub fn matches(&self, event: &TraceEvent) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.kind.matches_kind(event.kind) {
            return false;
        }
        if let Some(device) = self.device_filter {
            if device != event.device_id {
                return false;
            }
        }
        wildcard_match(&self.kernel_pattern, &event.name)
    }
}

/// Glob match with `*` and `?`, anchored over the whole name. Empty
/// patterns match everything.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    match Regex::new(&regex) {
        Ok(re) => re.is_match(name),
        Err(_) => false,
    }
}

/// One kernel invocation in the history ring.
#[derive(Debug, Clone)]
pub struct KernelCallInfo {
    pub correlation_id: CorrelationId,
    pub kernel_name: String,
    pub launch_time: Timestamp,
    /// 0 while the kernel is still running.
    pub complete_time: Timestamp,
    pub device_id: DeviceId,
    pub stream_id: StreamId,
    pub params: Option<KernelParams>,
    pub host_callstack: Option<CallStack>,
}

impl KernelCallInfo {
    pub fn is_complete(&self) -> bool {
        self.complete_time > 0
    }

    pub fn duration(&self) -> u64 {
        if self.is_complete() {
            self.complete_time.saturating_sub(self.launch_time)
        } else {
            0
        }
    }
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub event_history_size: usize,
    pub kernel_history_size: usize,
    /// Events surfaced in a state snapshot.
    pub recent_events: usize,
    pub profiler: ProfilerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            event_history_size: 1024,
            kernel_history_size: 1024,
            recent_events: 10,
            profiler: ProfilerConfig::default(),
        }
    }
}

/// Full state snapshot for `ts status` style queries.
#[derive(Debug, Clone, Default)]
pub struct GpuStateSnapshot {
    pub timestamp: Timestamp,
    pub devices: Vec<DeviceInfo>,
    pub memory_states: Vec<(DeviceId, MemoryUsage)>,
    pub stream_states: Vec<(DeviceId, StreamId, GpuState, usize)>,
    pub active_kernels: Vec<KernelCallInfo>,
    pub recent_events: Vec<TraceEvent>,
}

/// Callback observing each processed event and any breakpoint it tripped.
pub type EngineEventCallback = Box<dyn Fn(&TraceEvent, Option<&GpuBreakpoint>) + Send>;

pub struct GpuDebugEngine {
    config: EngineConfig,
    profiler: Option<Box<dyn PlatformProfiler>>,
    state_machine: GpuStateMachine,
    cursor: ReplayCursor,
    /// Guarded per the locking discipline: held only for list mutation and
    /// match scans.
    breakpoints: Mutex<Vec<GpuBreakpoint>>,
    next_bp_id: u32,
    event_history: VecDeque<TraceEvent>,
    kernel_history: VecDeque<KernelCallInfo>,
    captured: Vec<TraceEvent>,
    capturing: bool,
    callback: Option<EngineEventCallback>,
    target_pid: Option<i32>,
}

impl Default for GpuDebugEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl GpuDebugEngine {
    pub fn new(config: EngineConfig) -> Self {
        GpuDebugEngine {
            config,
            profiler: None,
            state_machine: GpuStateMachine::new(),
            cursor: ReplayCursor::new(),
            breakpoints: Mutex::new(Vec::new()),
            next_bp_id: 1,
            event_history: VecDeque::new(),
            kernel_history: VecDeque::new(),
            captured: Vec::new(),
            capturing: false,
            callback: None,
            target_pid: None,
        }
    }

    /// Bind to a debug target and bring up whichever capture adapter the
    /// host offers. A host with no GPU still debugs; it just has no live
    /// event flow.
    pub fn initialize(&mut self, target_pid: i32) -> Result<()> {
        self.target_pid = Some(target_pid);
        if self.profiler.is_some() {
            bail!("debug engine initialized twice");
        }
        match create_any_profiler() {
            Some(mut profiler) => {
                profiler
                    .initialize(&self.config.profiler)
                    .context("initializing capture adapter")?;
                tracing::info!(platform = %profiler.platform(), "GPU capture adapter ready");
                self.profiler = Some(profiler);
            }
            None => {
                tracing::info!("no GPU runtime detected; debugging without live capture");
            }
        }
        Ok(())
    }

    /// Use a specific platform's adapter (tests and `--platform` overrides).
    pub fn initialize_with_platform(&mut self, platform: PlatformKind) -> Result<()> {
        let Some(mut profiler) = create_profiler(platform) else {
            bail!("platform {platform} is not available");
        };
        profiler.initialize(&self.config.profiler)?;
        self.profiler = Some(profiler);
        Ok(())
    }

    pub fn target_pid(&self) -> Option<i32> {
        self.target_pid
    }

    pub fn profiler_mut(&mut self) -> Option<&mut Box<dyn PlatformProfiler>> {
        self.profiler.as_mut()
    }

    pub fn set_event_callback(&mut self, callback: EngineEventCallback) {
        self.callback = Some(callback);
    }

    /// Feed one event through the processing pipeline. Returns the first
    /// matching breakpoint, hit count already bumped.
    pub fn process_event(&mut self, event: TraceEvent) -> Option<GpuBreakpoint> {
        self.event_history.push_back(event.clone());
        while self.event_history.len() > self.config.event_history_size {
            self.event_history.pop_front();
        }

        self.state_machine.process_event(&event);
        self.track_kernel(&event);

        if self.capturing {
            self.captured.push(event.clone());
        }

        let matched = {
            let mut breakpoints = self.breakpoints.lock().unwrap();
            breakpoints.iter_mut().find_map(|bp| {
                if bp.matches(&event) {
                    bp.hit_count += 1;
                    Some(bp.clone())
                } else {
                    None
                }
            })
        };

        if let Some(callback) = &self.callback {
            callback(&event, matched.as_ref());
        }
        matched
    }

    /// Drain the adapter and process everything. Returns the first
    /// breakpoint hit in the batch, if any, with its triggering event.
    pub fn poll_events(&mut self) -> Option<(TraceEvent, GpuBreakpoint)> {
        let events = match &mut self.profiler {
            Some(profiler) => profiler.drain_events(usize::MAX),
            None => return None,
        };
        let mut first_hit = None;
        for event in events {
            let hit = self.process_event(event.clone());
            if first_hit.is_none() {
                if let Some(bp) = hit {
                    first_hit = Some((event, bp));
                }
            }
        }
        first_hit
    }

    fn track_kernel(&mut self, event: &TraceEvent) {
        match event.kind {
            EventKind::KernelLaunch => {
                self.kernel_history.push_back(KernelCallInfo {
                    correlation_id: event.correlation_id,
                    kernel_name: event.name.clone(),
                    launch_time: event.timestamp,
                    complete_time: 0,
                    device_id: event.device_id,
                    stream_id: event.stream_id,
                    params: event.kernel_params,
                    host_callstack: event.call_stack.clone(),
                });
                while self.kernel_history.len() > self.config.kernel_history_size {
                    self.kernel_history.pop_front();
                }
            }
            EventKind::KernelComplete => {
                for info in self.kernel_history.iter_mut().rev() {
                    if info.correlation_id == event.correlation_id && !info.is_complete() {
                        info.complete_time = event.timestamp;
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    // ---- breakpoints ----

    pub fn add_breakpoint(&mut self, mut breakpoint: GpuBreakpoint) -> u32 {
        breakpoint.id = self.next_bp_id;
        breakpoint.hit_count = 0;
        self.next_bp_id += 1;
        let id = breakpoint.id;
        self.breakpoints.lock().unwrap().push(breakpoint);
        id
    }

    pub fn remove_breakpoint(&mut self, id: u32) -> bool {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        let before = breakpoints.len();
        breakpoints.retain(|bp| bp.id != id);
        breakpoints.len() != before
    }

    pub fn enable_breakpoint(&mut self, id: u32, enable: bool) -> bool {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        match breakpoints.iter_mut().find(|bp| bp.id == id) {
            Some(bp) => {
                bp.enabled = enable;
                true
            }
            None => false,
        }
    }

    pub fn breakpoints(&self) -> Vec<GpuBreakpoint> {
        self.breakpoints.lock().unwrap().clone()
    }

    // ---- kernels ----

    /// Most recent first.
    pub fn kernel_history(&self, count: usize) -> Vec<KernelCallInfo> {
        self.kernel_history
            .iter()
            .rev()
            .take(count)
            .cloned()
            .collect()
    }

    pub fn active_kernels(&self) -> Vec<KernelCallInfo> {
        self.kernel_history
            .iter()
            .filter(|info| !info.is_complete())
            .cloned()
            .collect()
    }

    pub fn find_kernels(&self, pattern: &str) -> Vec<KernelCallInfo> {
        self.kernel_history
            .iter()
            .filter(|info| wildcard_match(pattern, &info.kernel_name))
            .cloned()
            .collect()
    }

    // ---- state queries ----

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.profiler
            .as_ref()
            .map(|p| p.devices())
            .unwrap_or_default()
    }

    pub fn memory_usage(&self, device: DeviceId) -> MemoryUsage {
        self.state_machine.memory_usage(device)
    }

    pub fn allocations(&self, device: DeviceId) -> Vec<(u64, u64)> {
        self.state_machine.allocations(device)
    }

    pub fn stream_states(&self) -> Vec<(DeviceId, StreamId, GpuState, usize)> {
        self.state_machine.streams()
    }

    pub fn state_machine(&self) -> &GpuStateMachine {
        &self.state_machine
    }

    pub fn snapshot(&self) -> GpuStateSnapshot {
        let recent = self
            .event_history
            .iter()
            .rev()
            .take(self.config.recent_events)
            .cloned()
            .collect();
        GpuStateSnapshot {
            timestamp: crate::events::monotonic_now(),
            devices: self.devices(),
            memory_states: self
                .state_machine
                .devices()
                .into_iter()
                .map(|d| (d, self.state_machine.memory_usage(d)))
                .collect(),
            stream_states: self.state_machine.streams(),
            active_kernels: self.active_kernels(),
            recent_events: recent,
        }
    }

    /// Reading device memory needs a vendor API this build does not link;
    /// callers get an empty answer, never an error.
    pub fn read_gpu_memory(&self, _device: DeviceId, _addr: u64, _len: usize) -> Vec<u8> {
        Vec::new()
    }

    // ---- capture ----

    pub fn start_capture(&mut self) -> bool {
        if self.capturing {
            return false;
        }
        self.captured.clear();
        if let Some(profiler) = &mut self.profiler {
            if profiler.start_capture().is_err() {
                return false;
            }
        }
        self.capturing = true;
        true
    }

    pub fn stop_capture(&mut self) -> bool {
        if !self.capturing {
            return false;
        }
        if let Some(profiler) = &mut self.profiler {
            let _ = profiler.stop_capture();
        }
        self.poll_events();
        self.capturing = false;
        true
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn captured_events(&self) -> &[TraceEvent] {
        &self.captured
    }

    /// Persist the captured events as SBT.
    pub fn save_trace(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.captured.is_empty() {
            bail!("no captured events to save");
        }
        let mut writer = SbtWriter::open(&path)?;
        let mut metadata = TraceMetadata::default();
        metadata.application = "tracesmith-gdbserver".to_string();
        metadata.start_timestamp = self.captured.first().map(|e| e.timestamp).unwrap_or(0);
        metadata.end_timestamp = self.captured.last().map(|e| e.end_timestamp()).unwrap_or(0);
        writer.write_metadata(&metadata)?;
        writer.write_device_info(&self.devices())?;
        writer.write_events(self.captured.iter())?;
        writer.finalize()?;
        Ok(())
    }

    // ---- replay ----

    /// Load an SBT file into the replay cursor.
    pub fn load_trace(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path_buf = PathBuf::from(path.as_ref());
        let reader = SbtReader::open(&path_buf)?;
        let mut record = TraceRecord::new();
        reader.read_all(&mut record)?;
        let events = record.into_events();
        if events.is_empty() {
            bail!("trace contains no events");
        }
        let count = events.len();
        self.cursor.load(events, Some(path_buf));
        Ok(count)
    }

    pub fn replay_cursor(&mut self) -> &mut ReplayCursor {
        &mut self.cursor
    }

    pub fn replay_status(&self) -> ReplayStatus {
        self.cursor.status()
    }

    pub fn current_replay_event(&self) -> Option<&TraceEvent> {
        self.cursor.current_event()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel_launch(name: &str, correlation: u64, device: u32, ts: u64) -> TraceEvent {
        let mut event = TraceEvent::new(EventKind::KernelLaunch);
        event.name = name.to_string();
        event.correlation_id = correlation;
        event.device_id = device;
        event.timestamp = ts;
        event
    }

    fn kernel_complete(correlation: u64, ts: u64) -> TraceEvent {
        let mut event = TraceEvent::new(EventKind::KernelComplete);
        event.correlation_id = correlation;
        event.timestamp = ts;
        event
    }

    #[test]
    fn test_breakpoint_pattern_matching() {
        let bp = GpuBreakpoint::new(GpuBreakpointKind::KernelLaunch).with_pattern("matmul*");
        assert!(bp.matches(&kernel_launch("matmul_f32", 1, 0, 0)));
        assert!(!bp.matches(&kernel_launch("conv2d", 2, 0, 0)));

        let mut disabled = bp.clone();
        disabled.enabled = false;
        assert!(!disabled.matches(&kernel_launch("matmul_f32", 3, 0, 0)));
    }

    #[test]
    fn test_breakpoint_matching_is_pure() {
        let bp = GpuBreakpoint::new(GpuBreakpointKind::KernelLaunch).with_pattern("matmul*");
        let event = kernel_launch("matmul_f32", 1, 0, 0);
        for _ in 0..3 {
            assert!(bp.matches(&event));
        }
        assert_eq!(bp.hit_count, 0);
    }

    #[test]
    fn test_breakpoint_device_filter() {
        let bp = GpuBreakpoint::new(GpuBreakpointKind::KernelLaunch).with_device(1);
        assert!(!bp.matches(&kernel_launch("k", 1, 0, 0)));
        assert!(bp.matches(&kernel_launch("k", 1, 1, 0)));
    }

    #[test]
    fn test_breakpoint_kind_filter() {
        let bp = GpuBreakpoint::new(GpuBreakpointKind::MemAlloc);
        assert!(!bp.matches(&kernel_launch("k", 1, 0, 0)));
        let alloc = TraceEvent::new(EventKind::MemAlloc);
        assert!(bp.matches(&alloc));

        let sync_bp = GpuBreakpoint::new(GpuBreakpointKind::Synchronize);
        assert!(sync_bp.matches(&TraceEvent::new(EventKind::StreamSync)));
        assert!(sync_bp.matches(&TraceEvent::new(EventKind::DeviceSync)));
        assert!(sync_bp.matches(&TraceEvent::new(EventKind::EventSync)));
    }

    #[test]
    fn test_wildcard_semantics() {
        assert!(wildcard_match("", "anything"));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("a?c", "abc"));
        assert!(!wildcard_match("a?c", "abbc"));
        assert!(wildcard_match("*add*", "vector_add_f32"));
        assert!(!wildcard_match("matmul", "matmul_f32"));
        // Regex metacharacters in names are literal.
        assert!(wildcard_match("op[1]*", "op[1]_fused"));
    }

    #[test]
    fn test_engine_hit_counting_first_match_wins() {
        let mut engine = GpuDebugEngine::default();
        let first = engine.add_breakpoint(
            GpuBreakpoint::new(GpuBreakpointKind::KernelLaunch).with_pattern("matmul*"),
        );
        let second = engine
            .add_breakpoint(GpuBreakpoint::new(GpuBreakpointKind::AnyEvent));

        let hit = engine.process_event(kernel_launch("matmul_f32", 1, 0, 10));
        assert_eq!(hit.unwrap().id, first);

        let breakpoints = engine.breakpoints();
        assert_eq!(breakpoints[0].hit_count, 1);
        // The list stops at the first match.
        assert_eq!(breakpoints[1].hit_count, 0);

        engine.enable_breakpoint(first, false);
        let hit = engine.process_event(kernel_launch("matmul_f64", 2, 0, 20));
        assert_eq!(hit.unwrap().id, second);
    }

    #[test]
    fn test_kernel_history_pairing() {
        let mut engine = GpuDebugEngine::default();
        engine.process_event(kernel_launch("k1", 1, 0, 100));
        engine.process_event(kernel_launch("k2", 2, 0, 150));
        assert_eq!(engine.active_kernels().len(), 2);

        engine.process_event(kernel_complete(1, 300));
        let active = engine.active_kernels();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].correlation_id, 2);

        let history = engine.kernel_history(10);
        assert_eq!(history.len(), 2);
        // Most recent first.
        assert_eq!(history[0].kernel_name, "k2");
        let k1 = history.iter().find(|k| k.correlation_id == 1).unwrap();
        assert!(k1.is_complete());
        assert_eq!(k1.duration(), 200);
    }

    #[test]
    fn test_find_kernels_wildcard() {
        let mut engine = GpuDebugEngine::default();
        engine.process_event(kernel_launch("matmul_f32", 1, 0, 0));
        engine.process_event(kernel_launch("conv2d", 2, 0, 10));
        engine.process_event(kernel_launch("matmul_f64", 3, 0, 20));
        assert_eq!(engine.find_kernels("matmul*").len(), 2);
        assert_eq!(engine.find_kernels("conv*").len(), 1);
        assert_eq!(engine.find_kernels("").len(), 3);
    }

    #[test]
    fn test_capture_collects_events() {
        let mut engine = GpuDebugEngine::default();
        assert!(engine.start_capture());
        assert!(!engine.start_capture());
        engine.process_event(kernel_launch("k", 1, 0, 0));
        engine.process_event(kernel_complete(1, 10));
        assert!(engine.stop_capture());
        assert!(!engine.stop_capture());
        assert_eq!(engine.captured_events().len(), 2);
    }

    #[test]
    fn test_event_history_bounded() {
        let mut engine = GpuDebugEngine::new(EngineConfig {
            event_history_size: 4,
            ..EngineConfig::default()
        });
        for i in 0..10u64 {
            engine.process_event(kernel_launch("k", i, 0, i));
        }
        assert_eq!(engine.snapshot().recent_events.len(), 4);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sbt");

        let mut engine = GpuDebugEngine::default();
        engine.start_capture();
        engine.process_event(kernel_launch("k", 1, 0, 100));
        engine.process_event(kernel_complete(1, 200));
        engine.stop_capture();
        engine.save_trace(&path).unwrap();

        let count = engine.load_trace(&path).unwrap();
        assert_eq!(count, 2);
        let status = engine.replay_status();
        assert_eq!(status.total_events, 2);
        assert_eq!(status.current_index, 0);
    }

    #[test]
    fn test_save_empty_fails() {
        let dir = tempfile::tempdir().unwrap();
        let engine = GpuDebugEngine::default();
        assert!(engine.save_trace(dir.path().join("x.sbt")).is_err());
    }
}
