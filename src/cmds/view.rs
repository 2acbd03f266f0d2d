use std::collections::BTreeMap;

use anyhow::Result;
use tracesmith::sbt::SbtReader;

use crate::cmds::load_trace;
use crate::{InfoOpts, ViewOpts};

pub fn view(opts: ViewOpts) -> Result<()> {
    let record = load_trace(&opts.file)?;

    if opts.stats {
        let mut by_kind: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut by_stream: BTreeMap<(u32, u32), usize> = BTreeMap::new();
        for event in record.events() {
            *by_kind.entry(event.kind.as_str()).or_default() += 1;
            *by_stream
                .entry((event.device_id, event.stream_id))
                .or_default() += 1;
        }

        println!("Trace statistics for {}", opts.file);
        println!("  Total events: {}", record.event_count());
        println!();
        println!("  By kind:");
        for (kind, count) in by_kind {
            println!("    {kind:<16} {count}");
        }
        println!();
        println!("  By device/stream:");
        for ((device, stream), count) in by_stream {
            println!("    d{device}/s{stream:<12} {count}");
        }
        return Ok(());
    }

    println!(
        "{:<12} {:<16} {:>6} {:>6} {:>10} {:>12} name",
        "timestamp", "kind", "dev", "strm", "corr", "duration"
    );
    for event in record.events().iter().take(opts.limit) {
        println!(
            "{:<12} {:<16} {:>6} {:>6} {:>10} {:>12} {}",
            event.timestamp,
            event.kind.as_str(),
            event.device_id,
            event.stream_id,
            event.correlation_id,
            event.duration,
            event.name
        );
    }
    if record.event_count() > opts.limit {
        println!("... {} more events", record.event_count() - opts.limit);
    }
    Ok(())
}

pub fn info(opts: InfoOpts) -> Result<()> {
    let reader = SbtReader::open(&opts.file)?;
    let header = reader.header();

    println!("SBT file: {}", opts.file);
    println!(
        "  Version:        {}.{}",
        header.version_major, header.version_minor
    );
    println!("  Flags:          {:#06x}", header.flags);
    println!("  Events:         {}", header.event_count);
    println!("  Metadata at:    {:#x}", header.metadata_offset);
    println!("  Strings at:     {:#x}", header.string_table_offset);
    println!("  Devices at:     {:#x}", header.device_info_offset);
    println!("  Event stream:   {:#x}", header.events_offset);

    let mut record = tracesmith::TraceRecord::new();
    reader.read_all(&mut record)?;

    println!();
    println!("  Application:    {}", record.metadata.application);
    println!("  Command line:   {}", record.metadata.command_line);
    println!(
        "  Time range:     {} .. {} ns",
        record.metadata.start_timestamp, record.metadata.end_timestamp
    );
    for (key, value) in &record.metadata.extra {
        println!("  {key}: {value}");
    }

    println!();
    println!("  Devices: {}", record.devices.len());
    for dev in &record.devices {
        println!(
            "    {}: {} ({}), {} MB, {} SMs",
            dev.device_id,
            dev.name,
            dev.vendor,
            dev.total_memory / (1024 * 1024),
            dev.multiprocessor_count
        );
    }
    Ok(())
}
