//! Standalone GDB server exposing TraceSmith's GPU debugging over RSP.
//!
//! Attach to a running process or spawn one under trace, then point GDB at
//! the listen port:
//!
//! ```text
//! tracesmith-gdbserver --attach 1234
//! tracesmith-gdbserver --port 2159 -- ./my_app --flag
//! (gdb) target remote :1234
//! (gdb) monitor ts help
//! ```

use anyhow::{bail, Result};
use clap::Parser;
use tracesmith::gdb::{RspConfig, RspHandler};

#[derive(Debug, Parser)]
#[command(name = "tracesmith-gdbserver", version)]
struct Opts {
    /// TCP port to listen on
    #[arg(short, long, default_value = "1234")]
    port: u16,
    /// Listen on a unix domain socket instead of TCP
    #[arg(long)]
    unix_socket: Option<std::path::PathBuf>,
    /// Attach to an existing process
    #[arg(short, long)]
    attach: Option<i32>,
    /// Command to spawn under trace (after --)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();
    let config = RspConfig {
        port: opts.port,
        unix_socket: opts.unix_socket,
        ..RspConfig::default()
    };

    let mut handler = RspHandler::new(config);
    match (opts.attach, opts.command.is_empty()) {
        (Some(pid), _) => handler.attach(pid)?,
        (None, false) => handler.spawn(&opts.command)?,
        (None, true) => bail!("nothing to debug: pass --attach PID or a command after --"),
    }

    handler.listen_and_serve()
}
