use std::fmt::Write as _;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracesmith::analysis::InstructionStreamAnalyzer;
use tracesmith::events::TraceEvent;
use tracesmith::timeline::TimelineBuilder;

use crate::cmds::load_trace;
use crate::ExportOpts;

pub fn export(opts: ExportOpts) -> Result<()> {
    let mut record = load_trace(&opts.file)?;
    // Exports want a global order; ties keep capture order.
    record.sort_by_timestamp();

    let (extension, content) = match opts.format.as_str() {
        "chrome" => ("json", chrome_trace(record.events())?),
        "csv" => ("csv", csv_export(record.events())),
        "dot" => ("dot", dot_export(record.events())),
        other => bail!("Unknown export format: {other}. Must be one of: chrome, csv, dot"),
    };

    let output = match opts.output {
        Some(output) => output,
        None => Path::new(&opts.file)
            .with_extension(extension)
            .display()
            .to_string(),
    };
    std::fs::write(&output, content).with_context(|| format!("writing {output}"))?;
    println!("Exported {} events to {output}", record.event_count());
    Ok(())
}

/// Chrome trace event format: complete events for spans, instant events for
/// the rest; device becomes pid, stream becomes tid, timestamps in
/// microseconds.
fn chrome_trace(events: &[TraceEvent]) -> Result<String> {
    let timeline = TimelineBuilder::new().build(events);
    let mut entries = Vec::with_capacity(timeline.spans.len());
    for span in &timeline.spans {
        let name = if span.name.is_empty() {
            span.kind.as_str().to_string()
        } else {
            span.name.clone()
        };
        if span.end > span.start {
            entries.push(json!({
                "name": name,
                "cat": span.kind.as_str(),
                "ph": "X",
                "ts": span.start as f64 / 1000.0,
                "dur": (span.end - span.start) as f64 / 1000.0,
                "pid": span.device_id,
                "tid": span.stream_id,
                "args": {"correlation": span.correlation_id},
            }));
        } else {
            entries.push(json!({
                "name": name,
                "cat": span.kind.as_str(),
                "ph": "i",
                "ts": span.start as f64 / 1000.0,
                "pid": span.device_id,
                "tid": span.stream_id,
                "s": "t",
            }));
        }
    }
    Ok(serde_json::to_string_pretty(
        &json!({"traceEvents": entries, "displayTimeUnit": "ns"}),
    )?)
}

fn csv_export(events: &[TraceEvent]) -> String {
    let mut out =
        String::from("timestamp,kind,device_id,stream_id,correlation_id,thread_id,duration,name\n");
    for event in events {
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{}",
            event.timestamp,
            event.kind.as_str(),
            event.device_id,
            event.stream_id,
            event.correlation_id,
            event.thread_id,
            event.duration,
            event.name.replace(',', ";")
        );
    }
    out
}

fn dot_export(events: &[TraceEvent]) -> String {
    let analyzer = InstructionStreamAnalyzer::new();
    let deps = analyzer.analyze(events);
    analyzer.export_dot(events, &deps)
}
