pub mod analyze;
pub mod devices;
pub mod export;
pub mod record;
pub mod replay;
pub mod view;

use anyhow::{Context, Result};
use tracesmith::{SbtReader, TraceRecord};

/// Open and fully decode one SBT file, the shared front half of every
/// trace-consuming subcommand.
pub fn load_trace(path: &str) -> Result<TraceRecord> {
    let reader = SbtReader::open(path).with_context(|| format!("opening {path}"))?;
    let mut record = TraceRecord::new();
    reader
        .read_all(&mut record)
        .with_context(|| format!("reading {path}"))?;
    Ok(record)
}
