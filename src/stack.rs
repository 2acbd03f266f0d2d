//! Best-effort host call-stack capture.
//!
//! Capture records raw instruction addresses only; symbol resolution is a
//! separate, deferred step so the capture hot path never touches debug info.
//! If the platform cannot produce a backtrace the capture simply reports
//! depth 0.

use blazesym::symbolize::source::{Process, Source};
use blazesym::symbolize::{Input, Sym, Symbolized, Symbolizer};
use blazesym::Pid;

use crate::events::{CallStack, StackFrame};

/// Stack capture tuning. `skip_frames` hides the capture machinery itself
/// from recorded stacks.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub max_depth: usize,
    pub resolve_symbols: bool,
    pub demangle: bool,
    pub skip_frames: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            max_depth: 32,
            resolve_symbols: false,
            demangle: true,
            skip_frames: 2,
        }
    }
}

/// Captures host stacks for launch events and resolves them on demand.
/// Symbolizers are built per resolution batch; the capture side never
/// touches debug info.
pub struct StackCapturer {
    config: StackConfig,
}

impl Default for StackCapturer {
    fn default() -> Self {
        Self::new(StackConfig::default())
    }
}

impl StackCapturer {
    pub fn new(config: StackConfig) -> Self {
        StackCapturer { config }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Walk the current thread's stack and append raw frame addresses to
    /// `out`. Returns the recorded depth. Non-blocking; a failed unwind
    /// yields depth 0 and is still a success.
    pub fn capture(&self, out: &mut CallStack) -> usize {
        let mut skipped = 0usize;
        let mut depth = 0usize;
        let max_depth = self.config.max_depth;
        let skip = self.config.skip_frames;

        backtrace::trace(|frame| {
            if skipped < skip {
                skipped += 1;
                return true;
            }
            if depth >= max_depth {
                return false;
            }
            out.frames.push(StackFrame {
                address: frame.ip() as u64,
                function: None,
                file: None,
                line: None,
            });
            depth += 1;
            true
        });

        depth
    }

    /// Capture and, if configured, resolve in one call.
    pub fn capture_resolved(&self) -> CallStack {
        let mut stack = CallStack::default();
        self.capture(&mut stack);
        if self.config.resolve_symbols {
            self.resolve(&mut stack);
        }
        stack
    }

    /// Fill in function/file/line for frames that only carry addresses.
    /// Frames the symbolizer cannot place keep their raw address.
    pub fn resolve(&self, stack: &mut CallStack) {
        let symbolizer = Symbolizer::new();
        let pid = std::process::id();
        let src = Source::Process(Process::new(Pid::from(pid)));

        for frame in stack.frames.iter_mut() {
            if frame.function.is_some() {
                continue;
            }
            match symbolizer.symbolize_single(&src, Input::AbsAddr(frame.address)) {
                Ok(Symbolized::Sym(Sym {
                    name, code_info, ..
                })) => {
                    frame.function = Some(name.to_string());
                    if let Some(info) = code_info {
                        frame.file = Some(info.to_path().display().to_string());
                        frame.line = info.line;
                    }
                }
                _ => {}
            }
        }
    }
}
