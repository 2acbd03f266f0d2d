use anyhow::Result;
use tracesmith::capture::{create_profiler, ProfilerConfig};
use tracesmith::events::PlatformKind;

pub fn devices() -> Result<()> {
    let platforms = [
        PlatformKind::Cuda,
        PlatformKind::Rocm,
        PlatformKind::Metal,
        PlatformKind::Maca,
        PlatformKind::Ascend,
    ];

    let mut found = 0usize;
    for platform in platforms {
        let Some(mut profiler) = create_profiler(platform) else {
            println!("{platform:<8} not available");
            continue;
        };
        if profiler.initialize(&ProfilerConfig::default()).is_err() {
            println!("{platform:<8} runtime present but failed to initialize");
            continue;
        }
        let devices = profiler.devices();
        println!("{platform:<8} {} device(s)", devices.len());
        for dev in devices {
            println!("  {}: {} ({})", dev.device_id, dev.name, dev.vendor);
            found += 1;
        }
    }

    if found == 0 {
        println!();
        println!("No GPU devices found. The simulation platform is always available:");
        println!("  tracesmith record --platform sim -o trace.sbt");
    }
    Ok(())
}
