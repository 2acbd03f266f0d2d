//! Timeline reconstruction from a flat event sequence.
//!
//! Launch/complete pairs sharing a correlation id become spans; completes
//! that carry their own duration become spans without a paired launch;
//! everything else falls through as a zero-length instant. Utilisation is
//! measured over the merged union of span intervals so overlapping work on
//! different streams is not double counted.

use std::collections::HashMap;

use serde::Serialize;

use crate::events::{CorrelationId, DeviceId, EventKind, StreamId, Timestamp, TraceEvent};

/// One reconstructed operation interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineSpan {
    pub correlation_id: CorrelationId,
    pub device_id: DeviceId,
    pub stream_id: StreamId,
    pub kind: EventKind,
    pub name: String,
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimelineSpan {
    pub fn duration(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

/// Reconstructed timeline plus its aggregate metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Timeline {
    pub spans: Vec<TimelineSpan>,
    pub total_duration: u64,
    /// Fraction of the trace wall time covered by at least one span, in [0,1].
    pub gpu_utilization: f64,
    pub max_concurrent_ops: usize,
}

/// Aggregate statistics for one kernel name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KernelStats {
    pub name: String,
    pub invocations: usize,
    pub total_duration: u64,
    pub max_duration: u64,
}

impl KernelStats {
    pub fn average_duration(&self) -> u64 {
        if self.invocations == 0 {
            0
        } else {
            self.total_duration / self.invocations as u64
        }
    }
}

#[derive(Debug, Default)]
pub struct TimelineBuilder;

impl TimelineBuilder {
    pub fn new() -> Self {
        TimelineBuilder
    }

    /// Build a timeline from events in capture order.
    pub fn build(&self, events: &[TraceEvent]) -> Timeline {
        let spans = self.build_spans(events);
        if spans.is_empty() {
            return Timeline::default();
        }

        let start = spans.iter().map(|s| s.start).min().unwrap_or(0);
        let end = spans.iter().map(|s| s.end).max().unwrap_or(0);
        let total_duration = end.saturating_sub(start);

        Timeline {
            gpu_utilization: utilization(&spans, total_duration),
            max_concurrent_ops: max_concurrency(&spans),
            spans,
            total_duration,
        }
    }

    fn build_spans(&self, events: &[TraceEvent]) -> Vec<TimelineSpan> {
        // First pass: launch timestamps per correlation id.
        let mut launches: HashMap<CorrelationId, &TraceEvent> = HashMap::new();
        for event in events {
            if event.kind == EventKind::KernelLaunch {
                launches.entry(event.correlation_id).or_insert(event);
            }
        }

        let mut spans = Vec::new();
        let mut paired: HashMap<CorrelationId, bool> = HashMap::new();
        for event in events {
            match event.kind {
                EventKind::KernelLaunch => {
                    // Emitted when its completion shows up; unmatched launches
                    // fall through below.
                }
                EventKind::KernelComplete => {
                    if let Some(launch) = launches.get(&event.correlation_id) {
                        paired.insert(event.correlation_id, true);
                        spans.push(TimelineSpan {
                            correlation_id: event.correlation_id,
                            device_id: launch.device_id,
                            stream_id: launch.stream_id,
                            kind: EventKind::KernelLaunch,
                            name: if launch.name.is_empty() {
                                event.name.clone()
                            } else {
                                launch.name.clone()
                            },
                            start: launch.timestamp,
                            end: event.timestamp.max(launch.timestamp),
                        });
                    } else {
                        // Complete without a launch: trust its own duration.
                        spans.push(span_from_single(event));
                    }
                }
                _ => spans.push(span_from_single(event)),
            }
        }

        // Launches that never completed become instants at their launch time.
        for (correlation_id, launch) in launches {
            if !paired.contains_key(&correlation_id) {
                spans.push(span_from_single(launch));
            }
        }

        spans.sort_by_key(|s| (s.start, s.end));
        spans
    }

    /// Heaviest kernels by cumulative span time, longest first.
    pub fn top_kernels(&self, timeline: &Timeline, limit: usize) -> Vec<KernelStats> {
        let mut by_name: HashMap<&str, KernelStats> = HashMap::new();
        for span in &timeline.spans {
            if span.kind != EventKind::KernelLaunch || span.name.is_empty() {
                continue;
            }
            let stats = by_name.entry(span.name.as_str()).or_insert_with(|| KernelStats {
                name: span.name.clone(),
                ..Default::default()
            });
            stats.invocations += 1;
            stats.total_duration += span.duration();
            stats.max_duration = stats.max_duration.max(span.duration());
        }
        let mut all: Vec<KernelStats> = by_name.into_values().collect();
        all.sort_by(|a, b| b.total_duration.cmp(&a.total_duration));
        all.truncate(limit);
        all
    }
}

fn span_from_single(event: &TraceEvent) -> TimelineSpan {
    TimelineSpan {
        correlation_id: event.correlation_id,
        device_id: event.device_id,
        stream_id: event.stream_id,
        kind: event.kind,
        name: event.name.clone(),
        start: event.timestamp,
        end: event.end_timestamp(),
    }
}

/// Merged-interval busy time over total duration.
fn utilization(spans: &[TimelineSpan], total_duration: u64) -> f64 {
    if total_duration == 0 {
        return 0.0;
    }

    let mut intervals: Vec<(Timestamp, Timestamp)> = spans
        .iter()
        .filter(|s| s.end > s.start)
        .map(|s| (s.start, s.end))
        .collect();
    intervals.sort_unstable();

    let mut busy = 0u64;
    let mut current: Option<(Timestamp, Timestamp)> = None;
    for (start, end) in intervals {
        match current {
            Some((cur_start, cur_end)) if start <= cur_end => {
                current = Some((cur_start, cur_end.max(end)));
            }
            Some((cur_start, cur_end)) => {
                busy += cur_end - cur_start;
                current = Some((start, end));
            }
            None => current = Some((start, end)),
        }
    }
    if let Some((cur_start, cur_end)) = current {
        busy += cur_end - cur_start;
    }

    (busy as f64 / total_duration as f64).clamp(0.0, 1.0)
}

/// Sweep-line maximum of simultaneously open spans. Ends sort before starts
/// at equal timestamps so back-to-back operations do not count as
/// overlapping.
fn max_concurrency(spans: &[TimelineSpan]) -> usize {
    let mut edges: Vec<(Timestamp, i32)> = Vec::with_capacity(spans.len() * 2);
    for span in spans {
        if span.end > span.start {
            edges.push((span.start, 1));
            edges.push((span.end, -1));
        }
    }
    edges.sort_by_key(|&(ts, delta)| (ts, delta));

    let mut open = 0i32;
    let mut max_open = 0i32;
    for (_, delta) in edges {
        open += delta;
        max_open = max_open.max(open);
    }
    max_open as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch(correlation: u64, stream: u32, ts: u64) -> TraceEvent {
        let mut event = TraceEvent::new(EventKind::KernelLaunch);
        event.correlation_id = correlation;
        event.stream_id = stream;
        event.timestamp = ts;
        event.name = format!("k{correlation}");
        event
    }

    fn complete(correlation: u64, stream: u32, ts: u64) -> TraceEvent {
        let mut event = TraceEvent::new(EventKind::KernelComplete);
        event.correlation_id = correlation;
        event.stream_id = stream;
        event.timestamp = ts;
        event
    }

    #[test]
    fn test_overlapping_spans_metrics() {
        // Spans [0,100], [50,150], [200,250] on one stream.
        let events = vec![
            launch(1, 0, 0),
            launch(2, 0, 50),
            complete(1, 0, 100),
            complete(2, 0, 150),
            launch(3, 0, 200),
            complete(3, 0, 250),
        ];
        let timeline = TimelineBuilder::new().build(&events);
        assert_eq!(timeline.spans.len(), 3);
        assert_eq!(timeline.total_duration, 250);
        // Busy time: [0,150] merged plus [200,250] = 200 of 250.
        assert!((timeline.gpu_utilization - 0.80).abs() < 1e-9);
        assert_eq!(timeline.max_concurrent_ops, 2);
    }

    #[test]
    fn test_fully_concurrent_streams() {
        let mut events = Vec::new();
        for stream in 0..4u32 {
            events.push(launch(stream as u64 + 1, stream, 0));
            events.push(complete(stream as u64 + 1, stream, 1000));
        }
        let timeline = TimelineBuilder::new().build(&events);
        assert_eq!(timeline.max_concurrent_ops, 4);
        assert!((timeline.gpu_utilization - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_complete_without_launch_uses_duration() {
        let mut event = complete(9, 1, 500);
        event.duration = 250;
        let timeline = TimelineBuilder::new().build(&[event]);
        assert_eq!(timeline.spans[0].start, 500);
        assert_eq!(timeline.spans[0].end, 750);
    }

    #[test]
    fn test_instants_are_zero_length() {
        let mut marker = TraceEvent::new(EventKind::Marker);
        marker.timestamp = 42;
        let timeline = TimelineBuilder::new().build(&[marker]);
        assert_eq!(timeline.spans[0].start, timeline.spans[0].end);
        assert_eq!(timeline.max_concurrent_ops, 0);
    }

    #[test]
    fn test_adjacent_spans_do_not_overlap() {
        let events = vec![
            launch(1, 0, 0),
            complete(1, 0, 100),
            launch(2, 0, 100),
            complete(2, 0, 200),
        ];
        let timeline = TimelineBuilder::new().build(&events);
        assert_eq!(timeline.max_concurrent_ops, 1);
    }

    #[test]
    fn test_utilization_bounds() {
        let events = vec![launch(1, 0, 10), complete(1, 0, 20)];
        let timeline = TimelineBuilder::new().build(&events);
        assert!(timeline.gpu_utilization >= 0.0);
        assert!(timeline.gpu_utilization <= 1.0);
    }

    #[test]
    fn test_top_kernels_orders_by_total_time() {
        let mut events = Vec::new();
        // "hot" runs twice for 100 each, "cold" once for 150.
        for (i, (name, dur)) in [("hot", 100), ("cold", 150), ("hot", 100)].iter().enumerate() {
            let base = i as u64 * 1000;
            let mut l = launch(i as u64 + 1, 0, base);
            l.name = name.to_string();
            events.push(l);
            events.push(complete(i as u64 + 1, 0, base + dur));
        }
        let builder = TimelineBuilder::new();
        let timeline = builder.build(&events);
        let top = builder.top_kernels(&timeline, 10);
        assert_eq!(top[0].name, "hot");
        assert_eq!(top[0].invocations, 2);
        assert_eq!(top[0].total_duration, 200);
        assert_eq!(top[1].name, "cold");
    }
}
