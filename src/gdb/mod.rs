//! GDB remote debugging backend.
//!
//! Four layers: [`packet`] does RSP framing, [`process`] drives the host
//! process over ptrace, [`engine`] owns GPU-side state and breakpoints, and
//! [`handler`] ties them together behind a socket.

pub mod engine;
pub mod handler;
pub mod packet;
pub mod process;

pub use engine::{GpuBreakpoint, GpuBreakpointKind, GpuDebugEngine, KernelCallInfo};
pub use handler::{RspConfig, RspHandler};
pub use process::{ProcessController, RegisterSet, StopEvent, StopReason};
