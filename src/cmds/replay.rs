use anyhow::Result;
use tracesmith::replay::{ReplayCursor, ReplayEngine, ReplayMode};

use crate::cmds::load_trace;
use crate::ReplayOpts;

pub fn replay(opts: ReplayOpts) -> Result<()> {
    let mode: ReplayMode = opts.mode.parse()?;
    let record = load_trace(&opts.file)?;

    let mut cursor = ReplayCursor::new();
    cursor.load(record.into_events(), Some(opts.file.clone().into()));

    let mut engine = ReplayEngine::new(mode);
    if let Some(stream) = opts.stream {
        engine = engine.with_stream_filter(stream);
    }

    println!("Replaying {} in {} mode", opts.file, mode.as_str());
    let report = engine.run(&mut cursor);

    println!();
    println!("Replay report");
    println!("  Success:        {}", report.success);
    println!("  Deterministic:  {}", report.deterministic);
    println!("  Operations:     {}", report.operations_total);
    println!("  Executed:       {}", report.operations_executed);
    println!("  Failed:         {}", report.operations_failed);
    println!("  Duration:       {} ns", report.replay_duration_ns);
    for error in &report.errors {
        println!("  error: {error}");
    }

    if !report.success {
        anyhow::bail!("replay validation failed");
    }
    Ok(())
}
