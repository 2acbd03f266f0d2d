use anyhow::Result;
use tracesmith::analysis::InstructionStreamAnalyzer;
use tracesmith::state_machine::GpuStateMachine;
use tracesmith::timeline::TimelineBuilder;

use crate::cmds::load_trace;
use crate::AnalyzeOpts;

pub fn analyze(opts: AnalyzeOpts) -> Result<()> {
    let record = load_trace(&opts.file)?;
    let events = record.events();

    let builder = TimelineBuilder::new();
    let timeline = builder.build(events);

    println!("Timeline analysis for {}", opts.file);
    println!("  Events:              {}", events.len());
    println!("  Spans:               {}", timeline.spans.len());
    println!("  Total duration:      {} ns", timeline.total_duration);
    println!(
        "  GPU utilization:     {:.1}%",
        timeline.gpu_utilization * 100.0
    );
    println!("  Max concurrent ops:  {}", timeline.max_concurrent_ops);

    let top = builder.top_kernels(&timeline, opts.top);
    if !top.is_empty() {
        println!();
        println!("Top kernels by total time:");
        for (i, stats) in top.iter().enumerate() {
            println!(
                "  {:>2}. {:<32} {:>6} calls  {:>12} ns total  {:>10} ns avg",
                i + 1,
                stats.name,
                stats.invocations,
                stats.total_duration,
                stats.average_duration()
            );
        }
    }

    let analyzer = InstructionStreamAnalyzer::new();
    let deps = analyzer.analyze(events);
    let stats = analyzer.stats(events, &deps);
    println!();
    println!("Dependency analysis:");
    println!("  Total dependencies:  {}", stats.total_dependencies());
    println!("    Sequential:        {}", stats.sequential);
    println!("    Synchronization:   {}", stats.synchronization);
    println!("    Memory:            {}", stats.memory);
    println!(
        "  Graph is acyclic:    {}",
        if analyzer.is_acyclic(&deps) { "yes" } else { "NO" }
    );

    // Memcpy throughput, derived from event durations.
    let mut transfer_bytes = 0u64;
    let mut transfer_ns = 0u64;
    for event in events {
        if event.kind.is_memory_transfer() && event.duration > 0 {
            if let Some(params) = &event.memory_params {
                transfer_bytes += params.bytes;
                transfer_ns += event.duration;
            }
        }
    }
    if transfer_ns > 0 {
        println!();
        println!(
            "Memory transfers: {} bytes in {} ns ({:.2} GB/s effective)",
            transfer_bytes,
            transfer_ns,
            transfer_bytes as f64 / transfer_ns as f64
        );
    }

    let mut machine = GpuStateMachine::new();
    machine.process_events(events.iter());
    let warnings = machine.warnings();
    if !warnings.is_empty() {
        println!();
        println!("State machine warnings ({}):", warnings.len());
        for warning in warnings.iter().take(10) {
            println!(
                "  [{}] d{}/s{}: {}",
                warning.timestamp, warning.device_id, warning.stream_id, warning.message
            );
        }
    }
    for device in machine.devices() {
        let usage = machine.memory_usage(device);
        if usage.allocation_count > 0 {
            println!();
            println!(
                "Device {device} memory: {} bytes live, {} bytes peak, {} allocations",
                usage.live_bytes, usage.peak_bytes, usage.allocation_count
            );
        }
    }
    Ok(())
}
