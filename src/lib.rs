//! TraceSmith library - cross-vendor GPU/NPU trace capture and debugging.
//!
//! TraceSmith captures events from GPU runtime callbacks (CUDA, ROCm, Metal,
//! MACA, Ascend, or a deterministic simulator), persists them in the SBT
//! binary container, reconstructs timelines and dependencies, and exposes a
//! GDB Remote Serial Protocol backend with GPU-level breakpoints and
//! deterministic trace replay.
//!
//! # Modules
//!
//! - [`events`] - the unified event model all components consume
//! - [`capture`] - per-vendor adapters and the profiler factory
//! - [`sink`] - the bounded event buffer between producers and consumer
//! - [`stack`] - host call-stack capture and symbol resolution
//! - [`sbt`] - the SBT trace container (writer and reader)
//! - [`timeline`] - span reconstruction and utilisation metrics
//! - [`analysis`] - instruction-stream dependency inference
//! - [`state_machine`] - per-stream GPU state and memory accounting
//! - [`replay`] - deterministic replay cursor and engine
//! - [`gdb`] - process control, RSP stub and the GPU debug engine
//!
//! # Example
//!
//! ```no_run
//! use tracesmith::capture::{create_profiler, PlatformProfiler, ProfilerConfig};
//! use tracesmith::events::PlatformKind;
//! use tracesmith::sbt::SbtWriter;
//!
//! let mut profiler = create_profiler(PlatformKind::Simulation).unwrap();
//! profiler.initialize(&ProfilerConfig::default()).unwrap();
//! profiler.start_capture().unwrap();
//! // ... workload runs ...
//! profiler.stop_capture().unwrap();
//!
//! let mut writer = SbtWriter::open("trace.sbt").unwrap();
//! for event in profiler.drain_events(usize::MAX) {
//!     writer.write_event(&event).unwrap();
//! }
//! writer.finalize().unwrap();
//! ```

pub mod analysis;
pub mod capture;
pub mod events;
pub mod gdb;
pub mod replay;
pub mod sbt;
pub mod sink;
pub mod stack;
pub mod state_machine;
pub mod timeline;

// Re-export the types nearly every consumer touches.
pub use events::{
    DeviceInfo, EventKind, PlatformKind, TraceEvent, TraceMetadata, TraceRecord,
};
pub use sbt::{SbtReader, SbtWriter};
pub use sink::{EventSink, SubmitResult};
