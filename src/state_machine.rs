//! Per-(device, stream) execution state driven by the event flow, plus a
//! per-device memory ledger.
//!
//! The machine is a single-threaded consumer: feed it events in drain order
//! and query snapshots between batches. Anomalies (orphan completions,
//! double frees) become warnings, never failures.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::events::{CorrelationId, DeviceId, EventKind, StreamId, Timestamp, TraceEvent};

/// Execution state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GpuState {
    Idle,
    Launching,
    Executing,
    Synchronizing,
    /// Reserved. Adapters count and discard vendor error records before
    /// they reach the event stream, so no transition targets this state
    /// today; it exists for callers that persist or display stream states.
    Error,
}

impl GpuState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Launching => "launching",
            Self::Executing => "executing",
            Self::Synchronizing => "synchronizing",
            Self::Error => "error",
        }
    }
}

/// Mutable state for one (device, stream) pair.
#[derive(Debug, Clone, Serialize)]
pub struct StreamState {
    pub state: GpuState,
    /// Correlation ids of launches with no completion yet.
    pub pending: Vec<CorrelationId>,
    pub last_transition: Timestamp,
}

impl Default for StreamState {
    fn default() -> Self {
        StreamState {
            state: GpuState::Idle,
            pending: Vec::new(),
            last_transition: 0,
        }
    }
}

/// Live-allocation accounting for one device.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryLedger {
    live: HashMap<u64, u64>,
    pub live_bytes: u64,
    pub peak_bytes: u64,
    /// Total allocations observed, frees included.
    pub allocation_count: u64,
}

impl MemoryLedger {
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    /// Live (address, size) pairs, address ordered.
    pub fn allocations(&self) -> Vec<(u64, u64)> {
        let mut all: Vec<(u64, u64)> = self.live.iter().map(|(&a, &s)| (a, s)).collect();
        all.sort_unstable();
        all
    }

    fn alloc(&mut self, addr: u64, bytes: u64) {
        self.live.insert(addr, bytes);
        self.live_bytes += bytes;
        self.peak_bytes = self.peak_bytes.max(self.live_bytes);
        self.allocation_count += 1;
    }

    /// Returns false when the address was not live (double free).
    fn free(&mut self, addr: u64) -> bool {
        match self.live.remove(&addr) {
            Some(bytes) => {
                self.live_bytes = self.live_bytes.saturating_sub(bytes);
                true
            }
            None => false,
        }
    }
}

/// Per-device operation counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DeviceCounters {
    pub kernels_launched: u64,
    pub kernels_completed: u64,
    pub memory_transfers: u64,
    pub syncs: u64,
}

/// Non-fatal anomaly recorded during event processing.
#[derive(Debug, Clone, Serialize)]
pub struct StateWarning {
    pub timestamp: Timestamp,
    pub device_id: DeviceId,
    pub stream_id: StreamId,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
struct DeviceState {
    ledger: MemoryLedger,
    counters: DeviceCounters,
}

/// Point-in-time view of all streams and ledgers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateSnapshot {
    pub streams: Vec<(DeviceId, StreamId, GpuState, usize)>,
    pub devices: Vec<(DeviceId, MemoryUsage)>,
    pub warning_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub live_bytes: u64,
    pub peak_bytes: u64,
    pub allocation_count: u64,
    pub live_allocations: u64,
}

/// State transitions per event kind:
/// launch moves the stream to `Launching`, the matching completion back to
/// `Idle` (through `Executing`), sync kinds to `Synchronizing` until the next
/// event on that stream. Memory operations leave stream state untouched and
/// feed the ledger and counters. Devices are created lazily on first sight.
#[derive(Debug, Default)]
pub struct GpuStateMachine {
    streams: BTreeMap<(DeviceId, StreamId), StreamState>,
    devices: BTreeMap<DeviceId, DeviceState>,
    warnings: Vec<StateWarning>,
    events_processed: u64,
}

impl GpuStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    pub fn process_event(&mut self, event: &TraceEvent) {
        self.events_processed += 1;
        self.devices.entry(event.device_id).or_default();

        // A stream sitting in Synchronizing leaves it when any further event
        // arrives on that stream.
        let key = (event.device_id, event.stream_id);
        if let Some(stream) = self.streams.get_mut(&key) {
            if stream.state == GpuState::Synchronizing && !event.kind.is_sync() {
                stream.state = GpuState::Idle;
                stream.last_transition = event.timestamp;
            }
        }

        match event.kind {
            EventKind::KernelLaunch => {
                let stream = self.streams.entry(key).or_default();
                stream.state = GpuState::Launching;
                stream.pending.push(event.correlation_id);
                stream.last_transition = event.timestamp;
                self.device_mut(event.device_id).counters.kernels_launched += 1;
            }
            EventKind::KernelComplete => {
                let stream = self.streams.entry(key).or_default();
                if let Some(pos) = stream
                    .pending
                    .iter()
                    .position(|&c| c == event.correlation_id)
                {
                    stream.pending.remove(pos);
                    // Executing collapses into Idle at the completion
                    // timestamp; outstanding launches keep the stream hot.
                    stream.state = if stream.pending.is_empty() {
                        GpuState::Idle
                    } else {
                        GpuState::Executing
                    };
                    stream.last_transition = event.timestamp;
                    self.device_mut(event.device_id).counters.kernels_completed += 1;
                } else {
                    self.warn(
                        event,
                        format!(
                            "orphan completion: correlation {} has no pending launch",
                            event.correlation_id
                        ),
                    );
                }
            }
            EventKind::StreamSync | EventKind::EventSync => {
                self.enter_sync(key, event);
                self.device_mut(event.device_id).counters.syncs += 1;
            }
            EventKind::DeviceSync => {
                let mut device_streams: Vec<(DeviceId, StreamId)> = self
                    .streams
                    .keys()
                    .filter(|(device, _)| *device == event.device_id)
                    .copied()
                    .collect();
                // The sync's own stream exists even if nothing ran on it yet.
                if !device_streams.contains(&key) {
                    device_streams.push(key);
                }
                for stream_key in device_streams {
                    self.enter_sync(stream_key, event);
                }
                self.device_mut(event.device_id).counters.syncs += 1;
            }
            EventKind::MemAlloc => {
                if let Some(params) = &event.memory_params {
                    self.device_mut(event.device_id)
                        .ledger
                        .alloc(params.dst_addr, params.bytes);
                } else {
                    self.warn(event, "MemAlloc without memory params".to_string());
                }
            }
            EventKind::MemFree => {
                if let Some(params) = &event.memory_params {
                    let freed = self.device_mut(event.device_id).ledger.free(params.dst_addr);
                    if !freed {
                        self.warn(
                            event,
                            format!("double free of {:#x}", params.dst_addr),
                        );
                    }
                } else {
                    self.warn(event, "MemFree without memory params".to_string());
                }
            }
            kind if kind.is_memory_transfer() => {
                self.streams.entry(key).or_default();
                self.device_mut(event.device_id).counters.memory_transfers += 1;
            }
            _ => {
                self.streams.entry(key).or_default();
            }
        }
    }

    pub fn process_events<'a>(&mut self, events: impl IntoIterator<Item = &'a TraceEvent>) {
        for event in events {
            self.process_event(event);
        }
    }

    fn enter_sync(&mut self, key: (DeviceId, StreamId), event: &TraceEvent) {
        let stream = self.streams.entry(key).or_default();
        // A sync with a duration covering the wait completes immediately.
        if event.duration > 0 {
            stream.state = GpuState::Idle;
            stream.pending.clear();
            stream.last_transition = event.end_timestamp();
        } else {
            stream.state = GpuState::Synchronizing;
            stream.last_transition = event.timestamp;
        }
    }

    fn device_mut(&mut self, device_id: DeviceId) -> &mut DeviceState {
        self.devices.entry(device_id).or_default()
    }

    fn warn(&mut self, event: &TraceEvent, message: String) {
        tracing::debug!(
            device = event.device_id,
            stream = event.stream_id,
            "{message}"
        );
        self.warnings.push(StateWarning {
            timestamp: event.timestamp,
            device_id: event.device_id,
            stream_id: event.stream_id,
            message,
        });
    }

    pub fn stream_state(&self, device_id: DeviceId, stream_id: StreamId) -> Option<GpuState> {
        self.streams.get(&(device_id, stream_id)).map(|s| s.state)
    }

    /// All known streams with their state and pending-launch count.
    pub fn streams(&self) -> Vec<(DeviceId, StreamId, GpuState, usize)> {
        self.streams
            .iter()
            .map(|(&(d, s), state)| (d, s, state.state, state.pending.len()))
            .collect()
    }

    /// Correlation ids of launches with no completion yet, across streams.
    pub fn active_kernels(&self) -> Vec<CorrelationId> {
        let mut seen = HashSet::new();
        let mut active = Vec::new();
        for state in self.streams.values() {
            for &correlation in &state.pending {
                if seen.insert(correlation) {
                    active.push(correlation);
                }
            }
        }
        active
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }

    pub fn memory_usage(&self, device_id: DeviceId) -> MemoryUsage {
        self.devices
            .get(&device_id)
            .map(|d| MemoryUsage {
                live_bytes: d.ledger.live_bytes,
                peak_bytes: d.ledger.peak_bytes,
                allocation_count: d.ledger.allocation_count,
                live_allocations: d.ledger.live_allocations() as u64,
            })
            .unwrap_or_default()
    }

    /// Live (address, size) pairs on one device.
    pub fn allocations(&self, device_id: DeviceId) -> Vec<(u64, u64)> {
        self.devices
            .get(&device_id)
            .map(|d| d.ledger.allocations())
            .unwrap_or_default()
    }

    pub fn counters(&self, device_id: DeviceId) -> DeviceCounters {
        self.devices
            .get(&device_id)
            .map(|d| d.counters)
            .unwrap_or_default()
    }

    pub fn warnings(&self) -> &[StateWarning] {
        &self.warnings
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            streams: self.streams(),
            devices: self
                .devices
                .keys()
                .map(|&d| (d, self.memory_usage(d)))
                .collect(),
            warning_count: self.warnings.len(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryParams;

    fn event(kind: EventKind, correlation: u64, stream: u32, ts: u64) -> TraceEvent {
        let mut event = TraceEvent::new(kind);
        event.correlation_id = correlation;
        event.stream_id = stream;
        event.timestamp = ts;
        event
    }

    fn mem_event(kind: EventKind, addr: u64, bytes: u64, ts: u64) -> TraceEvent {
        let mut e = TraceEvent::new(kind);
        e.timestamp = ts;
        e.memory_params = Some(MemoryParams {
            src_addr: 0,
            dst_addr: addr,
            bytes,
            is_async: false,
        });
        e
    }

    #[test]
    fn test_launch_complete_cycle() {
        let mut machine = GpuStateMachine::new();
        machine.process_event(&event(EventKind::KernelLaunch, 1, 0, 100));
        assert_eq!(machine.stream_state(0, 0), Some(GpuState::Launching));
        assert_eq!(machine.active_kernels(), vec![1]);

        machine.process_event(&event(EventKind::KernelComplete, 1, 0, 200));
        assert_eq!(machine.stream_state(0, 0), Some(GpuState::Idle));
        assert!(machine.active_kernels().is_empty());
        assert!(machine.warnings().is_empty());
    }

    #[test]
    fn test_orphan_completion_warns() {
        let mut machine = GpuStateMachine::new();
        machine.process_event(&event(EventKind::KernelComplete, 42, 0, 100));
        assert_eq!(machine.warnings().len(), 1);
        assert!(machine.warnings()[0].message.contains("orphan"));
    }

    #[test]
    fn test_sync_until_next_event() {
        let mut machine = GpuStateMachine::new();
        machine.process_event(&event(EventKind::StreamSync, 0, 0, 100));
        assert_eq!(machine.stream_state(0, 0), Some(GpuState::Synchronizing));

        machine.process_event(&event(EventKind::KernelLaunch, 1, 0, 200));
        assert_eq!(machine.stream_state(0, 0), Some(GpuState::Launching));
    }

    #[test]
    fn test_sync_with_duration_returns_to_idle() {
        let mut machine = GpuStateMachine::new();
        machine.process_event(&event(EventKind::KernelLaunch, 1, 0, 100));
        let mut sync = event(EventKind::StreamSync, 0, 0, 200);
        sync.duration = 50;
        machine.process_event(&sync);
        assert_eq!(machine.stream_state(0, 0), Some(GpuState::Idle));
        assert!(machine.active_kernels().is_empty());
    }

    #[test]
    fn test_event_sync_ends_synchronizing() {
        let mut machine = GpuStateMachine::new();
        machine.process_event(&event(EventKind::StreamSync, 0, 0, 100));
        let mut sync = event(EventKind::EventSync, 0, 0, 150);
        sync.duration = 1;
        machine.process_event(&sync);
        assert_eq!(machine.stream_state(0, 0), Some(GpuState::Idle));
    }

    #[test]
    fn test_device_sync_touches_all_streams() {
        let mut machine = GpuStateMachine::new();
        machine.process_event(&event(EventKind::KernelLaunch, 1, 0, 0));
        machine.process_event(&event(EventKind::KernelLaunch, 2, 1, 0));
        machine.process_event(&event(EventKind::DeviceSync, 0, 0, 100));
        assert_eq!(machine.stream_state(0, 0), Some(GpuState::Synchronizing));
        assert_eq!(machine.stream_state(0, 1), Some(GpuState::Synchronizing));
    }

    #[test]
    fn test_memory_ledger_peak_and_double_free() {
        let mut machine = GpuStateMachine::new();
        machine.process_event(&mem_event(EventKind::MemAlloc, 0x1000, 1024, 0));
        machine.process_event(&mem_event(EventKind::MemAlloc, 0x2000, 2048, 1));
        let usage = machine.memory_usage(0);
        assert_eq!(usage.live_bytes, 3072);
        assert_eq!(usage.peak_bytes, 3072);
        assert_eq!(usage.allocation_count, 2);
        assert_eq!(usage.live_allocations, 2);

        machine.process_event(&mem_event(EventKind::MemFree, 0x1000, 0, 2));
        assert_eq!(machine.memory_usage(0).live_bytes, 2048);
        assert_eq!(machine.memory_usage(0).peak_bytes, 3072);

        // Freeing again warns and leaves the ledger untouched.
        machine.process_event(&mem_event(EventKind::MemFree, 0x1000, 0, 3));
        assert_eq!(machine.memory_usage(0).live_bytes, 2048);
        assert_eq!(machine.warnings().len(), 1);
        assert!(machine.warnings()[0].message.contains("double free"));
    }

    #[test]
    fn test_memory_ops_leave_stream_state() {
        let mut machine = GpuStateMachine::new();
        machine.process_event(&event(EventKind::KernelLaunch, 1, 0, 0));
        let mut copy = event(EventKind::MemcpyH2D, 7, 0, 10);
        copy.memory_params = Some(MemoryParams::default());
        machine.process_event(&copy);
        assert_eq!(machine.stream_state(0, 0), Some(GpuState::Launching));
        assert_eq!(machine.counters(0).memory_transfers, 1);
    }

    #[test]
    fn test_lazy_device_creation() {
        let mut machine = GpuStateMachine::new();
        let mut e = event(EventKind::Marker, 0, 3, 5);
        e.device_id = 7;
        machine.process_event(&e);
        assert_eq!(machine.devices(), vec![7]);
        assert_eq!(machine.stream_state(7, 3), Some(GpuState::Idle));
    }
}
