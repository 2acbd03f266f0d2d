use anyhow::Result;
use clap::{Args, Parser, Subcommand};

mod cmds;

#[derive(Debug, Parser)]
#[command(name = "tracesmith", version, about = "GPU/NPU trace capture, analysis and replay")]
struct Command {
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Record GPU events to a trace file
    Record(RecordOpts),
    /// View contents of a trace file
    View(ViewOpts),
    /// Show detailed information about a trace file
    Info(InfoOpts),
    /// Export a trace to Chrome trace, CSV or DOT
    Export(ExportOpts),
    /// Analyze a trace for timeline and dependency insights
    Analyze(AnalyzeOpts),
    /// Replay a captured trace
    Replay(ReplayOpts),
    /// List available GPU devices
    Devices,
}

#[derive(Debug, Args)]
pub struct RecordOpts {
    /// Output trace file
    #[arg(short, long, default_value = "trace.sbt")]
    output: String,
    /// Capture duration in seconds (vendor platforms)
    #[arg(short, long, default_value = "5")]
    duration: u64,
    /// Platform: auto, cuda, rocm, metal, maca, ascend, sim
    #[arg(short, long, default_value = "auto")]
    platform: String,
    /// Capture host call stacks on kernel launches
    #[arg(long)]
    stacks: bool,
    /// Event buffer capacity
    #[arg(long, default_value = "65536")]
    buffer_size: usize,
    /// Synthetic kernels to emit per stream (simulation platform)
    #[arg(long, default_value = "1000")]
    sim_kernels: usize,
    /// Streams for the synthetic workload (simulation platform)
    #[arg(long, default_value = "2")]
    sim_streams: u32,
}

#[derive(Debug, Args)]
pub struct ViewOpts {
    /// Trace file to view
    file: String,
    /// Maximum events to print
    #[arg(short, long, default_value = "50")]
    limit: usize,
    /// Print aggregate statistics instead of events
    #[arg(long)]
    stats: bool,
}

#[derive(Debug, Args)]
pub struct InfoOpts {
    /// Trace file to inspect
    file: String,
}

#[derive(Debug, Args)]
pub struct ExportOpts {
    /// Trace file to export
    file: String,
    /// Output format: chrome, csv, dot
    #[arg(short, long, default_value = "chrome")]
    format: String,
    /// Output file (default: input with a new extension)
    #[arg(short, long)]
    output: Option<String>,
}

#[derive(Debug, Args)]
pub struct AnalyzeOpts {
    /// Trace file to analyze
    file: String,
    /// Top kernels to show
    #[arg(long, default_value = "10")]
    top: usize,
}

#[derive(Debug, Args)]
pub struct ReplayOpts {
    /// Trace file to replay
    file: String,
    /// Replay mode: full, partial, dry-run, stream
    #[arg(short, long, default_value = "dry-run")]
    mode: String,
    /// Stream filter (stream mode)
    #[arg(short, long)]
    stream: Option<u32>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let opts = Command::parse();
    match opts.subcmd {
        SubCommand::Record(opts) => cmds::record::record(opts),
        SubCommand::View(opts) => cmds::view::view(opts),
        SubCommand::Info(opts) => cmds::view::info(opts),
        SubCommand::Export(opts) => cmds::export::export(opts),
        SubCommand::Analyze(opts) => cmds::analyze::analyze(opts),
        SubCommand::Replay(opts) => cmds::replay::replay(opts),
        SubCommand::Devices => cmds::devices::devices(),
    }
}
