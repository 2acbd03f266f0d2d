//! Deterministic trace replay.
//!
//! [`ReplayCursor`] is a positional cursor over a loaded event sequence; it
//! observes, it never executes. [`ReplayEngine`] drives a cursor under one of
//! the replay modes and reports ordering validation plus a determinism check
//! (two traversals must agree step for step and end in the same state).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use anyhow::bail;
use serde::Serialize;

use crate::events::{EventKind, StreamId, Timestamp, TraceEvent};
use crate::state_machine::{GpuStateMachine, StateSnapshot};

/// Positional cursor over a loaded trace.
#[derive(Debug, Default)]
pub struct ReplayCursor {
    events: Vec<TraceEvent>,
    index: usize,
    active: bool,
    paused: bool,
    trace_file: Option<PathBuf>,
}

/// Externally visible cursor status, shaped for the `ts replay status`
/// monitor command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayStatus {
    pub active: bool,
    pub paused: bool,
    pub current_index: usize,
    pub total_events: usize,
    pub current_timestamp: Timestamp,
    pub total_duration: u64,
    pub trace_file: Option<String>,
}

impl ReplayCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an ordered event sequence, resetting position.
    pub fn load(&mut self, events: Vec<TraceEvent>, trace_file: Option<PathBuf>) {
        self.events = events;
        self.index = 0;
        self.active = false;
        self.paused = false;
        self.trace_file = trace_file;
    }

    pub fn is_loaded(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn total_events(&self) -> usize {
        self.events.len()
    }

    pub fn current_index(&self) -> usize {
        self.index
    }

    /// Timestamp of the event under the cursor; the last event's timestamp
    /// once the cursor has run off the end.
    pub fn current_timestamp(&self) -> Timestamp {
        if self.events.is_empty() {
            return 0;
        }
        let idx = self.index.min(self.events.len() - 1);
        self.events[idx].timestamp
    }

    pub fn current_event(&self) -> Option<&TraceEvent> {
        self.events.get(self.index)
    }

    pub fn at_end(&self) -> bool {
        self.index >= self.events.len()
    }

    pub fn start(&mut self) {
        self.active = true;
        self.paused = false;
        self.index = 0;
    }

    pub fn stop(&mut self) {
        self.active = false;
        self.paused = false;
        self.index = 0;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Advance one event. Returns the event now under the cursor, or `None`
    /// at end of trace (index clamps to `total_events`).
    pub fn step_event(&mut self) -> Option<&TraceEvent> {
        if self.index < self.events.len() {
            self.index += 1;
        }
        self.current_event()
    }

    /// Advance to the next `KernelLaunch`. Returns it, or `None` if the
    /// remainder of the trace has no further launch.
    pub fn step_kernel(&mut self) -> Option<&TraceEvent> {
        while self.index < self.events.len() {
            self.index += 1;
            match self.events.get(self.index) {
                Some(event) if event.kind == EventKind::KernelLaunch => {
                    return self.events.get(self.index);
                }
                Some(_) => continue,
                None => break,
            }
        }
        None
    }

    /// Position on the first event whose timestamp is `>= target`. A target
    /// beyond the last event clamps to end of trace.
    pub fn goto_timestamp(&mut self, target: Timestamp) {
        self.index = self
            .events
            .partition_point(|event| event.timestamp < target);
    }

    /// Position on an absolute index, clamped to `total_events`.
    pub fn goto_event(&mut self, index: usize) {
        self.index = index.min(self.events.len());
    }

    pub fn status(&self) -> ReplayStatus {
        let total_duration = match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => last.end_timestamp().saturating_sub(first.timestamp),
            _ => 0,
        };
        ReplayStatus {
            active: self.active,
            paused: self.paused,
            current_index: self.index,
            total_events: self.events.len(),
            current_timestamp: self.current_timestamp(),
            total_duration,
            trace_file: self
                .trace_file
                .as_ref()
                .map(|p| p.display().to_string()),
        }
    }
}

/// How much of the trace a replay run covers. Only `DryRun` is guaranteed
/// available; the other modes validate ordering and dependencies without
/// submitting work to any vendor runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplayMode {
    Full,
    Partial,
    DryRun,
    StreamSpecific,
}

impl ReplayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
            Self::DryRun => "dry-run",
            Self::StreamSpecific => "stream",
        }
    }
}

impl FromStr for ReplayMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "full" => Ok(Self::Full),
            "partial" => Ok(Self::Partial),
            "dry-run" | "dryrun" | "dry" => Ok(Self::DryRun),
            "stream" | "stream-specific" => Ok(Self::StreamSpecific),
            _ => bail!("Invalid replay mode: {s}. Must be one of: full, partial, dry-run, stream"),
        }
    }
}

/// Outcome of one replay run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub success: bool,
    pub deterministic: bool,
    pub operations_total: usize,
    pub operations_executed: usize,
    pub operations_failed: usize,
    pub replay_duration_ns: u64,
    pub errors: Vec<String>,
}

/// Drives a [`ReplayCursor`] under a chosen mode.
#[derive(Debug)]
pub struct ReplayEngine {
    mode: ReplayMode,
    stream_filter: Option<StreamId>,
}

impl Default for ReplayEngine {
    fn default() -> Self {
        ReplayEngine {
            mode: ReplayMode::DryRun,
            stream_filter: None,
        }
    }
}

impl ReplayEngine {
    pub fn new(mode: ReplayMode) -> Self {
        ReplayEngine {
            mode,
            stream_filter: None,
        }
    }

    pub fn with_stream_filter(mut self, stream: StreamId) -> Self {
        self.stream_filter = Some(stream);
        self
    }

    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    /// Traverse the whole loaded trace, validating ordering and feeding a
    /// fresh state machine. Runs the traversal twice and compares the step
    /// sequences and final snapshots for the determinism verdict.
    pub fn run(&self, cursor: &mut ReplayCursor) -> ReplayReport {
        let started = Instant::now();
        let mut report = ReplayReport {
            operations_total: cursor.total_events(),
            deterministic: true,
            ..Default::default()
        };

        if !cursor.is_loaded() {
            report.errors.push("no trace loaded".to_string());
            return report;
        }

        // No mode submits work to a vendor runtime; all of them validate
        // ordering and the inferred dependency structure.
        let analyzer = crate::analysis::InstructionStreamAnalyzer::new();
        let deps = analyzer.analyze(cursor.events());
        if !analyzer.is_acyclic(&deps) {
            report
                .errors
                .push("dependency graph contains a cycle".to_string());
        }

        let (first_steps, first_snapshot) = self.traverse(cursor, &mut report);
        let mut second_report = ReplayReport::default();
        let (second_steps, second_snapshot) = self.traverse(cursor, &mut second_report);

        if first_steps != second_steps {
            report.deterministic = false;
            report
                .errors
                .push("replay traversals diverged in step sequence".to_string());
        }
        if !snapshots_equal(&first_snapshot, &second_snapshot) {
            report.deterministic = false;
            report
                .errors
                .push("replay traversals diverged in final state".to_string());
        }

        report.success = report.operations_failed == 0 && report.errors.is_empty();
        report.replay_duration_ns = started.elapsed().as_nanos() as u64;
        report
    }

    /// One full pass; returns the `(index, timestamp)` step sequence and the
    /// final state-machine snapshot.
    fn traverse(
        &self,
        cursor: &mut ReplayCursor,
        report: &mut ReplayReport,
    ) -> (Vec<(usize, Timestamp)>, StateSnapshot) {
        let mut machine = GpuStateMachine::new();
        let mut steps = Vec::with_capacity(cursor.total_events());
        let mut last_ts_per_stream: std::collections::HashMap<(u32, u32), Timestamp> =
            std::collections::HashMap::new();

        cursor.start();
        while let Some(event) = cursor.current_event() {
            let event = event.clone();
            steps.push((cursor.current_index(), event.timestamp));

            let skip = match self.mode {
                ReplayMode::StreamSpecific => self
                    .stream_filter
                    .map(|stream| event.stream_id != stream)
                    .unwrap_or(false),
                _ => false,
            };

            if !skip {
                // Ordering validation: per-stream timestamps must not run
                // backwards.
                let key = (event.device_id, event.stream_id);
                if let Some(&prev) = last_ts_per_stream.get(&key) {
                    if event.timestamp < prev {
                        report.operations_failed += 1;
                        report.errors.push(format!(
                            "out-of-order event on device {} stream {}: {} after {}",
                            event.device_id, event.stream_id, event.timestamp, prev
                        ));
                    }
                }
                last_ts_per_stream.insert(key, event.timestamp);

                machine.process_event(&event);
                report.operations_executed += 1;
            }

            cursor.step_event();
        }
        cursor.stop();

        (steps, machine.snapshot())
    }
}

fn snapshots_equal(a: &StateSnapshot, b: &StateSnapshot) -> bool {
    a.streams == b.streams && a.devices == b.devices && a.warning_count == b.warning_count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_at(kind: EventKind, ts: u64) -> TraceEvent {
        let mut event = TraceEvent::new(kind);
        event.timestamp = ts;
        event.correlation_id = ts;
        event
    }

    fn five_event_trace() -> Vec<TraceEvent> {
        [100, 200, 300, 400, 500]
            .iter()
            .map(|&ts| event_at(EventKind::Marker, ts))
            .collect()
    }

    #[test]
    fn test_step_event() {
        let mut cursor = ReplayCursor::new();
        cursor.load(five_event_trace(), None);
        cursor.start();
        assert_eq!(cursor.current_index(), 0);
        assert_eq!(cursor.current_timestamp(), 100);

        cursor.step_event();
        assert_eq!(cursor.current_index(), 1);
        assert_eq!(cursor.current_timestamp(), 200);
    }

    #[test]
    fn test_goto_timestamp() {
        let mut cursor = ReplayCursor::new();
        cursor.load(five_event_trace(), None);
        cursor.goto_timestamp(350);
        assert_eq!(cursor.current_index(), 3);
        assert_eq!(cursor.current_timestamp(), 400);

        cursor.goto_timestamp(9_999);
        assert_eq!(cursor.current_index(), 5);
        assert!(cursor.at_end());
    }

    #[test]
    fn test_goto_event_clamps() {
        let mut cursor = ReplayCursor::new();
        cursor.load(five_event_trace(), None);
        cursor.goto_event(10);
        assert_eq!(cursor.current_index(), 5);
        assert!(cursor.at_end());
        assert!(cursor.current_event().is_none());
    }

    #[test]
    fn test_step_kernel() {
        let mut events = five_event_trace();
        events[3] = event_at(EventKind::KernelLaunch, 400);
        let mut cursor = ReplayCursor::new();
        cursor.load(events, None);
        cursor.start();
        let kernel = cursor.step_kernel().cloned();
        assert_eq!(kernel.unwrap().timestamp, 400);
        assert_eq!(cursor.current_index(), 3);
        // No more launches ahead.
        assert!(cursor.step_kernel().is_none());
        assert!(cursor.at_end());
    }

    #[test]
    fn test_pause_resume_flags() {
        let mut cursor = ReplayCursor::new();
        cursor.load(five_event_trace(), None);
        cursor.start();
        cursor.pause();
        assert!(cursor.is_paused());
        cursor.resume();
        assert!(!cursor.is_paused());
        cursor.stop();
        assert!(!cursor.is_active());
        assert_eq!(cursor.current_index(), 0);
    }

    #[test]
    fn test_dry_run_report() {
        let mut cursor = ReplayCursor::new();
        let mut events = Vec::new();
        for i in 0..10u64 {
            let mut launch = event_at(EventKind::KernelLaunch, i * 100);
            launch.correlation_id = i;
            events.push(launch);
            let mut complete = event_at(EventKind::KernelComplete, i * 100 + 50);
            complete.correlation_id = i;
            events.push(complete);
        }
        cursor.load(events, None);
        let report = ReplayEngine::new(ReplayMode::DryRun).run(&mut cursor);
        assert!(report.success);
        assert!(report.deterministic);
        assert_eq!(report.operations_total, 20);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_out_of_order_fails_validation() {
        let mut cursor = ReplayCursor::new();
        cursor.load(
            vec![
                event_at(EventKind::Marker, 500),
                event_at(EventKind::Marker, 100),
            ],
            None,
        );
        let report = ReplayEngine::new(ReplayMode::DryRun).run(&mut cursor);
        assert!(!report.success);
        assert!(report.operations_failed > 0);
        // Divergence is about ordering, not determinism.
        assert!(report.deterministic);
    }

    #[test]
    fn test_stream_specific_filters() {
        let mut events = Vec::new();
        for i in 0..6u64 {
            let mut e = event_at(EventKind::KernelLaunch, i * 10);
            e.stream_id = (i % 2) as u32;
            events.push(e);
        }
        let mut cursor = ReplayCursor::new();
        cursor.load(events, None);
        let report = ReplayEngine::new(ReplayMode::StreamSpecific)
            .with_stream_filter(0)
            .run(&mut cursor);
        // The verification pass does not count; only stream 0 executes.
        assert_eq!(report.operations_executed, 3);
    }
}
