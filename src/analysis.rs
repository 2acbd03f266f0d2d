//! Inter-event dependency inference over the instruction stream.
//!
//! Three rules only: sequential ordering on one stream, synchronisation
//! barriers, and overlapping memory ranges between transfers on one device.
//! Every inferred edge points from a strictly earlier event to a later one,
//! so the resulting graph is a DAG by construction.

use std::collections::HashMap;
use std::fmt::Write as _;

use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use serde::Serialize;

use crate::events::{CorrelationId, DeviceId, EventKind, StreamId, TraceEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DependencyType {
    Sequential,
    Synchronization,
    MemoryDependency,
    Other,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Synchronization => "sync",
            Self::MemoryDependency => "memory",
            Self::Other => "other",
        }
    }
}

/// One inferred ordering edge between two operations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dependency {
    pub from_correlation: CorrelationId,
    pub to_correlation: CorrelationId,
    pub dep_type: DependencyType,
    pub description: String,
}

/// Aggregate view of one analysis run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisStats {
    pub total_events: usize,
    pub events_per_stream: HashMap<String, usize>,
    pub sequential: usize,
    pub synchronization: usize,
    pub memory: usize,
}

impl AnalysisStats {
    pub fn total_dependencies(&self) -> usize {
        self.sequential + self.synchronization + self.memory
    }
}

/// Chain membership for the sequential rule. Completions and event records
/// mark progress of an already chained operation and never start edges of
/// their own.
fn chains(kind: EventKind) -> bool {
    !matches!(kind, EventKind::KernelComplete | EventKind::EventRecord)
}

/// Operations a synchronisation barrier waits on.
fn is_stream_op(kind: EventKind) -> bool {
    matches!(kind, EventKind::KernelLaunch) || kind.is_memory_transfer()
}

#[derive(Debug, Default)]
pub struct InstructionStreamAnalyzer;

impl InstructionStreamAnalyzer {
    pub fn new() -> Self {
        InstructionStreamAnalyzer
    }

    /// Infer dependencies from events in capture order. Ties keep insertion
    /// order.
    pub fn analyze(&self, events: &[TraceEvent]) -> Vec<Dependency> {
        let mut deps = Vec::new();
        // Last chained event per (device, stream): correlation, end timestamp.
        let mut last: HashMap<(DeviceId, StreamId), (CorrelationId, u64)> = HashMap::new();
        // Operations issued since the last barrier per (device, stream).
        let mut in_flight: HashMap<(DeviceId, StreamId), Vec<(CorrelationId, String)>> =
            HashMap::new();
        // Transfer destinations per device, for the memory-overlap rule.
        let mut writes: HashMap<DeviceId, Vec<(u64, u64, CorrelationId)>> = HashMap::new();

        for event in events {
            let key = (event.device_id, event.stream_id);

            if event.kind.is_sync() {
                let affected: Vec<(DeviceId, StreamId)> = match event.kind {
                    EventKind::DeviceSync => in_flight
                        .keys()
                        .filter(|(device, _)| *device == event.device_id)
                        .copied()
                        .collect(),
                    _ => vec![key],
                };
                for stream_key in affected {
                    for (correlation, name) in in_flight.remove(&stream_key).unwrap_or_default() {
                        if correlation == event.correlation_id {
                            continue;
                        }
                        deps.push(Dependency {
                            from_correlation: correlation,
                            to_correlation: event.correlation_id,
                            dep_type: DependencyType::Synchronization,
                            description: format!(
                                "{} waits on {} (stream {})",
                                event.kind, name, stream_key.1
                            ),
                        });
                    }
                }
                last.insert(key, (event.correlation_id, event.end_timestamp()));
                continue;
            }

            if !chains(event.kind) {
                continue;
            }

            if let Some(&(prev_correlation, prev_end)) = last.get(&key) {
                if event.timestamp >= prev_end && prev_correlation != event.correlation_id {
                    deps.push(Dependency {
                        from_correlation: prev_correlation,
                        to_correlation: event.correlation_id,
                        dep_type: DependencyType::Sequential,
                        description: format!(
                            "in-order on device {} stream {}",
                            event.device_id, event.stream_id
                        ),
                    });
                }
            }
            last.insert(key, (event.correlation_id, event.end_timestamp()));

            if is_stream_op(event.kind) {
                in_flight
                    .entry(key)
                    .or_default()
                    .push((event.correlation_id, display_name(event)));
            }

            if event.kind.is_memory_transfer() {
                if let Some(params) = &event.memory_params {
                    let src_range = (params.src_addr, params.src_addr + params.bytes);
                    let device_writes = writes.entry(event.device_id).or_default();
                    for &(write_start, write_end, writer) in device_writes.iter() {
                        if writer != event.correlation_id
                            && ranges_overlap((write_start, write_end), src_range)
                        {
                            deps.push(Dependency {
                                from_correlation: writer,
                                to_correlation: event.correlation_id,
                                dep_type: DependencyType::MemoryDependency,
                                description: format!(
                                    "reads [{:#x},{:#x}) written by {}",
                                    src_range.0, src_range.1, writer
                                ),
                            });
                        }
                    }
                    device_writes.push((
                        params.dst_addr,
                        params.dst_addr + params.bytes,
                        event.correlation_id,
                    ));
                }
            }
        }

        deps
    }

    pub fn stats(&self, events: &[TraceEvent], deps: &[Dependency]) -> AnalysisStats {
        let mut stats = AnalysisStats {
            total_events: events.len(),
            ..Default::default()
        };
        for event in events {
            let key = format!("d{}/s{}", event.device_id, event.stream_id);
            *stats.events_per_stream.entry(key).or_default() += 1;
        }
        for dep in deps {
            match dep.dep_type {
                DependencyType::Sequential => stats.sequential += 1,
                DependencyType::Synchronization => stats.synchronization += 1,
                DependencyType::MemoryDependency => stats.memory += 1,
                DependencyType::Other => {}
            }
        }
        stats
    }

    /// Build the dependency graph keyed by correlation id.
    pub fn graph(&self, deps: &[Dependency]) -> DiGraphMap<CorrelationId, DependencyType> {
        let mut graph = DiGraphMap::new();
        for dep in deps {
            graph.add_edge(dep.from_correlation, dep.to_correlation, dep.dep_type);
        }
        graph
    }

    /// True when the inferred graph contains no cycle. Holds for any input by
    /// construction; exposed for validation passes.
    pub fn is_acyclic(&self, deps: &[Dependency]) -> bool {
        !is_cyclic_directed(&self.graph(deps))
    }

    /// Render the dependency graph as DOT: one node per correlation id
    /// labelled with the event name, one edge per dependency labelled with
    /// its type.
    pub fn export_dot(&self, events: &[TraceEvent], deps: &[Dependency]) -> String {
        let mut names: HashMap<CorrelationId, &str> = HashMap::new();
        for event in events {
            if !event.name.is_empty() {
                names.entry(event.correlation_id).or_insert(&event.name);
            }
        }

        let graph = self.graph(deps);
        let mut out = String::from("digraph instruction_stream {\n");
        out.push_str("  rankdir=LR;\n");
        for node in graph.nodes() {
            let label = names
                .get(&node)
                .map(|n| n.to_string())
                .unwrap_or_else(|| format!("op_{node}"));
            let _ = writeln!(out, "  n{} [label=\"{}\"];", node, escape_dot(&label));
        }
        for (from, to, dep_type) in graph.all_edges() {
            let _ = writeln!(out, "  n{} -> n{} [label=\"{}\"];", from, to, dep_type.as_str());
        }
        out.push_str("}\n");
        out
    }
}

fn display_name(event: &TraceEvent) -> String {
    if event.name.is_empty() {
        event.kind.to_string()
    } else {
        event.name.clone()
    }
}

fn ranges_overlap(a: (u64, u64), b: (u64, u64)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

fn escape_dot(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryParams;

    fn launch(correlation: u64, stream: u32, ts: u64, dur: u64) -> TraceEvent {
        let mut event = TraceEvent::new(EventKind::KernelLaunch);
        event.correlation_id = correlation;
        event.stream_id = stream;
        event.timestamp = ts;
        event.duration = dur;
        event.name = format!("k{correlation}");
        event
    }

    fn stream_sync(correlation: u64, stream: u32, ts: u64) -> TraceEvent {
        let mut event = TraceEvent::new(EventKind::StreamSync);
        event.correlation_id = correlation;
        event.stream_id = stream;
        event.timestamp = ts;
        event
    }

    fn memcpy(correlation: u64, src: u64, dst: u64, bytes: u64, ts: u64) -> TraceEvent {
        let mut event = TraceEvent::new(EventKind::MemcpyD2D);
        event.correlation_id = correlation;
        event.timestamp = ts;
        event.memory_params = Some(MemoryParams {
            src_addr: src,
            dst_addr: dst,
            bytes,
            is_async: true,
        });
        event
    }

    #[test]
    fn test_sync_then_sequential() {
        let events = vec![
            launch(1, 0, 0, 10),
            stream_sync(5, 0, 20),
            launch(2, 0, 30, 5),
        ];
        let deps = InstructionStreamAnalyzer::new().analyze(&events);
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].from_correlation, 1);
        assert_eq!(deps[0].to_correlation, 5);
        assert_eq!(deps[0].dep_type, DependencyType::Synchronization);
        assert_eq!(deps[1].from_correlation, 5);
        assert_eq!(deps[1].to_correlation, 2);
        assert_eq!(deps[1].dep_type, DependencyType::Sequential);
    }

    #[test]
    fn test_sequential_requires_non_overlap() {
        // Second launch starts before the first ends: no sequential edge.
        let events = vec![launch(1, 0, 0, 100), launch(2, 0, 50, 10)];
        let deps = InstructionStreamAnalyzer::new().analyze(&events);
        assert!(deps.is_empty());
    }

    #[test]
    fn test_device_sync_gathers_all_streams() {
        let mut sync = TraceEvent::new(EventKind::DeviceSync);
        sync.correlation_id = 9;
        sync.timestamp = 100;
        let events = vec![launch(1, 0, 0, 10), launch(2, 1, 0, 10), sync];
        let deps = InstructionStreamAnalyzer::new().analyze(&events);
        let sync_deps: Vec<_> = deps
            .iter()
            .filter(|d| d.dep_type == DependencyType::Synchronization)
            .collect();
        assert_eq!(sync_deps.len(), 2);
        assert!(sync_deps.iter().all(|d| d.to_correlation == 9));
    }

    #[test]
    fn test_memory_overlap_dependency() {
        let events = vec![
            memcpy(1, 0x9000, 0x1000, 0x100, 0),
            memcpy(2, 0x1080, 0x2000, 0x100, 10),
        ];
        let deps = InstructionStreamAnalyzer::new().analyze(&events);
        let mem: Vec<_> = deps
            .iter()
            .filter(|d| d.dep_type == DependencyType::MemoryDependency)
            .collect();
        assert_eq!(mem.len(), 1);
        assert_eq!(mem[0].from_correlation, 1);
        assert_eq!(mem[0].to_correlation, 2);
    }

    #[test]
    fn test_disjoint_ranges_no_memory_dependency() {
        let events = vec![
            memcpy(1, 0x9000, 0x1000, 0x100, 0),
            memcpy(2, 0x5000, 0x2000, 0x100, 10),
        ];
        let deps = InstructionStreamAnalyzer::new().analyze(&events);
        assert!(deps
            .iter()
            .all(|d| d.dep_type != DependencyType::MemoryDependency));
    }

    #[test]
    fn test_graph_is_acyclic() {
        let mut events = Vec::new();
        for i in 0..20u64 {
            events.push(launch(i + 1, (i % 3) as u32, i * 10, 8));
            if i % 5 == 4 {
                events.push(stream_sync(100 + i, (i % 3) as u32, i * 10 + 9));
            }
        }
        let analyzer = InstructionStreamAnalyzer::new();
        let deps = analyzer.analyze(&events);
        assert!(!deps.is_empty());
        assert!(analyzer.is_acyclic(&deps));
    }

    #[test]
    fn test_dot_export_shape() {
        let events = vec![
            launch(1, 0, 0, 10),
            stream_sync(5, 0, 20),
            launch(2, 0, 30, 5),
        ];
        let analyzer = InstructionStreamAnalyzer::new();
        let deps = analyzer.analyze(&events);
        let dot = analyzer.export_dot(&events, &deps);
        assert!(dot.starts_with("digraph instruction_stream {"));
        assert!(dot.contains("n1 [label=\"k1\"]"));
        assert!(dot.contains("n1 -> n5 [label=\"sync\"]"));
        assert!(dot.contains("n5 -> n2 [label=\"sequential\"]"));
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn test_stats_counts() {
        let events = vec![
            launch(1, 0, 0, 10),
            stream_sync(5, 0, 20),
            launch(2, 0, 30, 5),
        ];
        let analyzer = InstructionStreamAnalyzer::new();
        let deps = analyzer.analyze(&events);
        let stats = analyzer.stats(&events, &deps);
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.sequential, 1);
        assert_eq!(stats.synchronization, 1);
        assert_eq!(stats.total_dependencies(), 2);
    }
}
