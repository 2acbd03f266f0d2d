use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracesmith::capture::simulation::SimWorkload;
use tracesmith::capture::{
    create_profiler, detect_platform, platform_from_arg, PlatformProfiler, ProfilerConfig,
    SimulationProfiler,
};
use tracesmith::events::{monotonic_now, PlatformKind, TraceMetadata};
use tracesmith::sbt::SbtWriter;

use crate::RecordOpts;

pub fn record(opts: RecordOpts) -> Result<()> {
    let requested = platform_from_arg(&opts.platform)?;
    let platform = match requested {
        Some(platform) => platform,
        None => match detect_platform() {
            PlatformKind::Unknown => {
                bail!("no GPU runtime detected; use --platform sim for a synthetic capture")
            }
            platform => platform,
        },
    };

    let config = ProfilerConfig {
        buffer_capacity: opts.buffer_size,
        capture_callstacks: opts.stacks,
        ..ProfilerConfig::default()
    };

    if platform == PlatformKind::Simulation {
        let mut profiler = SimulationProfiler::new();
        profiler.initialize(&config)?;
        profiler.start_capture()?;
        let mut writer = open_writer(&opts, platform, &mut profiler)?;
        // The synthetic clock only moves forward, so the stream is sorted.
        writer.mark_events_sorted();
        profiler.emit_workload(&SimWorkload {
            kernels: opts.sim_kernels,
            streams: opts.sim_streams,
            with_memcpy: true,
            ..SimWorkload::default()
        })?;
        finish(&mut profiler, &mut writer, &opts.output)
    } else {
        let mut profiler = create_profiler(platform)
            .with_context(|| format!("platform {platform} is not available"))?;
        profiler.initialize(&config)?;
        profiler.start_capture()?;
        let mut writer = open_writer(&opts, platform, profiler.as_mut())?;

        // Poll the sink until the requested duration elapses.
        let deadline = Instant::now() + Duration::from_secs(opts.duration);
        while Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
            for event in profiler.drain_events(usize::MAX) {
                writer.write_event(&event)?;
            }
        }
        finish(profiler.as_mut(), &mut writer, &opts.output)
    }
}

fn open_writer(
    opts: &RecordOpts,
    platform: PlatformKind,
    profiler: &mut dyn PlatformProfiler,
) -> Result<SbtWriter> {
    let devices = profiler.devices();
    println!("Recording on {platform}");
    for dev in &devices {
        println!("  Device {}: {} ({})", dev.device_id, dev.name, dev.vendor);
    }

    let mut writer =
        SbtWriter::open(&opts.output).with_context(|| format!("creating {}", opts.output))?;
    let metadata = TraceMetadata {
        application: "tracesmith".to_string(),
        command_line: std::env::args().collect::<Vec<_>>().join(" "),
        start_timestamp: monotonic_now(),
        end_timestamp: 0,
        extra: vec![("platform".to_string(), platform.to_string())],
    };
    writer.write_metadata(&metadata)?;
    writer.write_device_info(&devices)?;
    Ok(writer)
}

fn finish(
    profiler: &mut dyn PlatformProfiler,
    writer: &mut SbtWriter,
    output: &str,
) -> Result<()> {
    profiler.stop_capture()?;
    for event in profiler.drain_events(usize::MAX) {
        writer.write_event(&event)?;
    }
    writer.finalize()?;

    println!();
    println!("Capture complete");
    println!("  Events captured: {}", profiler.events_captured());
    println!("  Events dropped:  {}", profiler.events_dropped());
    println!("  Output:          {output}");
    println!("  File size:       {} bytes", writer.file_size()?);
    println!();
    println!("Next: tracesmith view {output} --stats");
    Ok(())
}
