//! Host process control over ptrace.
//!
//! Wraps attach/spawn, execution control, register and memory access, and
//! software breakpoints (0xCC on x86_64). Every operation reports failure as
//! `false`/empty rather than an error; the controller never panics across
//! the RSP boundary and `detach` always tries to restore every byte it
//! patched.

use std::collections::{BTreeSet, HashMap};

use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// Why the target stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    None,
    Breakpoint,
    Signal,
    Exited,
    /// Synthesised by the RSP layer when a GPU breakpoint fires.
    GpuBreakpoint,
}

/// One stop report from `wait_for_stop`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopEvent {
    pub reason: StopReason,
    pub signal: i32,
    pub exit_code: i32,
    pub pc: u64,
    pub thread_id: i32,
}

/// x86_64 general-purpose register file, in GDB's transfer order. Values
/// serialise little-endian, 16 hex digits per register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterSet {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl RegisterSet {
    const COUNT: usize = 24;

    fn as_array(&self) -> [u64; Self::COUNT] {
        [
            self.rax, self.rbx, self.rcx, self.rdx, self.rsi, self.rdi, self.rbp, self.rsp,
            self.r8, self.r9, self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
            self.rip, self.rflags, self.cs, self.ss, self.ds, self.es, self.fs, self.gs,
        ]
    }

    fn from_array(values: [u64; Self::COUNT]) -> Self {
        RegisterSet {
            rax: values[0],
            rbx: values[1],
            rcx: values[2],
            rdx: values[3],
            rsi: values[4],
            rdi: values[5],
            rbp: values[6],
            rsp: values[7],
            r8: values[8],
            r9: values[9],
            r10: values[10],
            r11: values[11],
            r12: values[12],
            r13: values[13],
            r14: values[14],
            r15: values[15],
            rip: values[16],
            rflags: values[17],
            cs: values[18],
            ss: values[19],
            ds: values[20],
            es: values[21],
            fs: values[22],
            gs: values[23],
        }
    }

    /// Flat hex form for the `g` packet.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(Self::COUNT * 16);
        for value in self.as_array() {
            out.push_str(&crate::gdb::packet::to_hex(&value.to_le_bytes()));
        }
        out
    }

    /// Parse the `G` packet payload. Missing trailing registers read as 0.
    pub fn from_hex(hex: &str) -> Self {
        let mut values = [0u64; Self::COUNT];
        for (i, value) in values.iter_mut().enumerate() {
            let off = i * 16;
            if off + 16 > hex.len() {
                break;
            }
            let bytes = crate::gdb::packet::from_hex(&hex[off..off + 16]);
            let mut le = [0u8; 8];
            le[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
            *value = u64::from_le_bytes(le);
        }
        Self::from_array(values)
    }

    /// GDB register numbering: 0..=15 are rax..r15, 16 is rip, 17 rflags.
    pub fn get(&self, reg_num: usize) -> Option<u64> {
        self.as_array().get(reg_num).copied()
    }

    pub fn set(&mut self, reg_num: usize, value: u64) -> bool {
        if reg_num >= Self::COUNT {
            return false;
        }
        let mut values = self.as_array();
        values[reg_num] = value;
        *self = Self::from_array(values);
        true
    }
}

#[cfg(target_arch = "x86_64")]
impl From<libc::user_regs_struct> for RegisterSet {
    fn from(regs: libc::user_regs_struct) -> Self {
        RegisterSet {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rbp: regs.rbp,
            rsp: regs.rsp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rip: regs.rip,
            rflags: regs.eflags,
            cs: regs.cs,
            ss: regs.ss,
            ds: regs.ds,
            es: regs.es,
            fs: regs.fs,
            gs: regs.gs,
        }
    }
}

/// One software breakpoint and the byte it displaced.
#[derive(Debug, Clone, Copy)]
pub struct SwBreakpoint {
    pub id: u32,
    pub address: u64,
    pub original_byte: u8,
    pub enabled: bool,
    pub hit_count: u64,
}

/// The int3 opcode.
const TRAP_INSTRUCTION: u8 = 0xCC;

/// ptrace-backed controller for one traced process and its threads.
pub struct ProcessController {
    pid: i32,
    current_thread: i32,
    attached: bool,
    threads: BTreeSet<i32>,
    breakpoints: HashMap<u32, SwBreakpoint>,
    addr_to_bp: HashMap<u64, u32>,
    next_bp_id: u32,
}

impl Default for ProcessController {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        if self.attached {
            self.detach();
        }
    }
}

impl ProcessController {
    pub fn new() -> Self {
        ProcessController {
            pid: 0,
            current_thread: 0,
            attached: false,
            threads: BTreeSet::new(),
            breakpoints: HashMap::new(),
            addr_to_bp: HashMap::new(),
            next_bp_id: 1,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn current_thread(&self) -> i32 {
        self.current_thread
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Attach to a running process and wait for it to stop.
    pub fn attach(&mut self, pid: i32) -> bool {
        if self.attached {
            return false;
        }
        let target = Pid::from_raw(pid);
        if ptrace::attach(target).is_err() {
            return false;
        }
        match waitpid(target, None) {
            Ok(WaitStatus::Stopped(_, _)) => {}
            _ => {
                let _ = ptrace::detach(target, None);
                return false;
            }
        }
        let _ = ptrace::setoptions(
            target,
            ptrace::Options::PTRACE_O_TRACECLONE
                | ptrace::Options::PTRACE_O_TRACEFORK
                | ptrace::Options::PTRACE_O_TRACEVFORK,
        );

        self.pid = pid;
        self.current_thread = pid;
        self.attached = true;
        self.refresh_threads();
        true
    }

    /// Fork and exec `argv` under trace, stopped at the initial SIGTRAP.
    pub fn spawn(&mut self, argv: &[String]) -> bool {
        if self.attached || argv.is_empty() {
            return false;
        }

        let program = match std::ffi::CString::new(argv[0].as_str()) {
            Ok(c) => c,
            Err(_) => return false,
        };
        let args: Vec<std::ffi::CString> = argv
            .iter()
            .filter_map(|a| std::ffi::CString::new(a.as_str()).ok())
            .collect();
        if args.len() != argv.len() {
            return false;
        }

        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Child) => {
                let _ = ptrace::traceme();
                let _ = nix::unistd::execvp(&program, &args);
                // exec failed; exit without running any parent atexit state.
                unsafe { libc::_exit(127) };
            }
            Ok(nix::unistd::ForkResult::Parent { child }) => {
                match waitpid(child, None) {
                    Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {}
                    _ => {
                        let _ = kill(child, Signal::SIGKILL);
                        let _ = waitpid(child, None);
                        return false;
                    }
                }
                let _ = ptrace::setoptions(
                    child,
                    ptrace::Options::PTRACE_O_TRACECLONE
                        | ptrace::Options::PTRACE_O_TRACEFORK
                        | ptrace::Options::PTRACE_O_TRACEVFORK,
                );
                self.pid = child.as_raw();
                self.current_thread = self.pid;
                self.attached = true;
                self.threads.insert(self.pid);
                true
            }
            Err(_) => false,
        }
    }

    /// Restore all patched bytes and release every thread.
    pub fn detach(&mut self) -> bool {
        if !self.attached {
            return false;
        }
        let breakpoints: Vec<SwBreakpoint> = self.breakpoints.values().copied().collect();
        for bp in breakpoints {
            if bp.enabled {
                self.restore_byte(bp.address, bp.original_byte);
            }
        }
        self.breakpoints.clear();
        self.addr_to_bp.clear();

        self.refresh_threads();
        for &tid in &self.threads {
            let _ = ptrace::detach(Pid::from_raw(tid), None);
        }

        self.pid = 0;
        self.current_thread = 0;
        self.attached = false;
        self.threads.clear();
        true
    }

    pub fn kill(&mut self) -> bool {
        if !self.attached {
            return false;
        }
        let _ = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
        let _ = waitpid(Pid::from_raw(self.pid), None);
        self.pid = 0;
        self.current_thread = 0;
        self.attached = false;
        self.threads.clear();
        self.breakpoints.clear();
        self.addr_to_bp.clear();
        true
    }

    pub fn cont(&mut self, signal: i32) -> bool {
        if !self.attached {
            return false;
        }
        ptrace::cont(Pid::from_raw(self.current_thread), signal_from(signal)).is_ok()
    }

    pub fn single_step(&mut self, signal: i32) -> bool {
        if !self.attached {
            return false;
        }
        ptrace::step(Pid::from_raw(self.current_thread), signal_from(signal)).is_ok()
    }

    /// Asynchronous interrupt: SIGSTOP the whole process.
    pub fn interrupt(&mut self) -> bool {
        if !self.attached {
            return false;
        }
        kill(Pid::from_raw(self.pid), Signal::SIGSTOP).is_ok()
    }

    /// Block until any thread stops, classifying breakpoint traps and
    /// rewinding the program counter over the trap byte.
    pub fn wait_for_stop(&mut self) -> StopEvent {
        let mut event = StopEvent::default();
        if !self.attached {
            return event;
        }

        let status = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL));
        match status {
            Ok(WaitStatus::Exited(pid, code)) => {
                event.reason = StopReason::Exited;
                event.exit_code = code;
                event.thread_id = pid.as_raw();
                self.attached = false;
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                event.reason = StopReason::Signal;
                event.signal = signal as i32;
                event.thread_id = pid.as_raw();
            }
            Ok(WaitStatus::Stopped(pid, signal)) => {
                event.thread_id = pid.as_raw();
                self.current_thread = pid.as_raw();
                if signal == Signal::SIGTRAP {
                    let regs = self.read_registers();
                    event.pc = regs.rip;
                    // int3 has executed, so rip sits one past the trap byte.
                    let bp_addr = regs.rip.wrapping_sub(1);
                    if self.has_enabled_breakpoint_at(bp_addr) {
                        event.reason = StopReason::Breakpoint;
                        event.signal = Signal::SIGTRAP as i32;
                        event.pc = bp_addr;
                        let mut rewound = regs;
                        rewound.rip = bp_addr;
                        self.write_registers(&rewound);
                        if let Some(&id) = self.addr_to_bp.get(&bp_addr) {
                            if let Some(bp) = self.breakpoints.get_mut(&id) {
                                bp.hit_count += 1;
                            }
                        }
                    } else {
                        event.reason = StopReason::Signal;
                        event.signal = Signal::SIGTRAP as i32;
                    }
                } else {
                    event.reason = StopReason::Signal;
                    event.signal = signal as i32;
                }
            }
            Ok(WaitStatus::PtraceEvent(pid, signal, _)) => {
                // Thread create/fork notifications surface as plain stops.
                event.reason = StopReason::Signal;
                event.signal = signal as i32;
                event.thread_id = pid.as_raw();
                self.current_thread = pid.as_raw();
                self.refresh_threads();
            }
            _ => {}
        }
        event
    }

    // ---- threads ----

    pub fn threads(&mut self) -> Vec<i32> {
        self.refresh_threads();
        self.threads.iter().copied().collect()
    }

    pub fn select_thread(&mut self, tid: i32) -> bool {
        self.refresh_threads();
        if self.threads.contains(&tid) {
            self.current_thread = tid;
            return true;
        }
        false
    }

    pub fn is_thread_alive(&mut self, tid: i32) -> bool {
        self.refresh_threads();
        self.threads.contains(&tid)
    }

    fn refresh_threads(&mut self) {
        if self.pid == 0 {
            return;
        }
        self.threads.clear();
        let task_dir = format!("/proc/{}/task", self.pid);
        if let Ok(entries) = std::fs::read_dir(task_dir) {
            for entry in entries.flatten() {
                if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
                    self.threads.insert(tid);
                }
            }
        }
        self.threads.insert(self.pid);
    }

    // ---- registers ----

    pub fn read_registers(&self) -> RegisterSet {
        if !self.attached {
            return RegisterSet::default();
        }
        #[cfg(target_arch = "x86_64")]
        {
            match ptrace::getregs(Pid::from_raw(self.current_thread)) {
                Ok(regs) => RegisterSet::from(regs),
                Err(_) => RegisterSet::default(),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        RegisterSet::default()
    }

    pub fn write_registers(&self, regs: &RegisterSet) -> bool {
        if !self.attached {
            return false;
        }
        #[cfg(target_arch = "x86_64")]
        {
            let pid = Pid::from_raw(self.current_thread);
            let mut raw = match ptrace::getregs(pid) {
                Ok(raw) => raw,
                Err(_) => return false,
            };
            raw.rax = regs.rax;
            raw.rbx = regs.rbx;
            raw.rcx = regs.rcx;
            raw.rdx = regs.rdx;
            raw.rsi = regs.rsi;
            raw.rdi = regs.rdi;
            raw.rbp = regs.rbp;
            raw.rsp = regs.rsp;
            raw.r8 = regs.r8;
            raw.r9 = regs.r9;
            raw.r10 = regs.r10;
            raw.r11 = regs.r11;
            raw.r12 = regs.r12;
            raw.r13 = regs.r13;
            raw.r14 = regs.r14;
            raw.r15 = regs.r15;
            raw.rip = regs.rip;
            raw.eflags = regs.rflags;
            raw.cs = regs.cs;
            raw.ss = regs.ss;
            raw.ds = regs.ds;
            raw.es = regs.es;
            raw.fs = regs.fs;
            raw.gs = regs.gs;
            ptrace::setregs(pid, raw).is_ok()
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = regs;
            false
        }
    }

    pub fn read_register(&self, reg_num: usize) -> u64 {
        self.read_registers().get(reg_num).unwrap_or(0)
    }

    pub fn write_register(&self, reg_num: usize, value: u64) -> bool {
        let mut regs = self.read_registers();
        if !regs.set(reg_num, value) {
            return false;
        }
        self.write_registers(&regs)
    }

    // ---- memory ----

    /// Word-at-a-time read; a fault truncates the result at the last good
    /// word.
    pub fn read_memory(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        if !self.attached || len == 0 {
            return out;
        }
        let pid = Pid::from_raw(self.current_thread);
        let word_size = std::mem::size_of::<libc::c_long>();
        let mut offset = 0usize;
        while offset < len {
            let word = match ptrace::read(pid, (addr + offset as u64) as ptrace::AddressType) {
                Ok(word) => word,
                Err(_) => break,
            };
            let bytes = word.to_ne_bytes();
            let take = word_size.min(len - offset);
            out.extend_from_slice(&bytes[..take]);
            offset += word_size;
        }
        out
    }

    /// Word-at-a-time write with a read-modify-write tail.
    pub fn write_memory(&self, addr: u64, data: &[u8]) -> bool {
        if !self.attached || data.is_empty() {
            return false;
        }
        let pid = Pid::from_raw(self.current_thread);
        let word_size = std::mem::size_of::<libc::c_long>();
        let mut offset = 0usize;
        while offset < data.len() {
            let target = (addr + offset as u64) as ptrace::AddressType;
            let remaining = data.len() - offset;
            let mut bytes = if remaining < word_size {
                match ptrace::read(pid, target) {
                    Ok(word) => word.to_ne_bytes(),
                    Err(_) => return false,
                }
            } else {
                [0u8; std::mem::size_of::<libc::c_long>()]
            };
            let take = word_size.min(remaining);
            bytes[..take].copy_from_slice(&data[offset..offset + take]);
            if ptrace::write(pid, target, libc::c_long::from_ne_bytes(bytes)).is_err() {
                return false;
            }
            offset += word_size;
        }
        true
    }

    // ---- breakpoints ----

    /// Insert a trap at `addr`, remembering the displaced byte. Returns the
    /// breakpoint id, or the existing id when one is already set there.
    pub fn set_breakpoint(&mut self, addr: u64) -> Option<u32> {
        if !self.attached {
            return None;
        }
        if let Some(&id) = self.addr_to_bp.get(&addr) {
            return Some(id);
        }
        let original = self.patch_byte(addr, TRAP_INSTRUCTION)?;
        let id = self.next_bp_id;
        self.next_bp_id += 1;
        self.breakpoints.insert(
            id,
            SwBreakpoint {
                id,
                address: addr,
                original_byte: original,
                enabled: true,
                hit_count: 0,
            },
        );
        self.addr_to_bp.insert(addr, id);
        Some(id)
    }

    pub fn remove_breakpoint(&mut self, id: u32) -> bool {
        let Some(bp) = self.breakpoints.remove(&id) else {
            return false;
        };
        if bp.enabled {
            self.restore_byte(bp.address, bp.original_byte);
        }
        self.addr_to_bp.remove(&bp.address);
        true
    }

    pub fn remove_breakpoint_at(&mut self, addr: u64) -> bool {
        match self.addr_to_bp.get(&addr).copied() {
            Some(id) => self.remove_breakpoint(id),
            None => false,
        }
    }

    pub fn enable_breakpoint(&mut self, id: u32, enable: bool) -> bool {
        let Some(bp) = self.breakpoints.get(&id).copied() else {
            return false;
        };
        if bp.enabled == enable {
            return true;
        }
        let ok = if enable {
            self.patch_byte(bp.address, TRAP_INSTRUCTION).is_some()
        } else {
            self.restore_byte(bp.address, bp.original_byte)
        };
        if ok {
            if let Some(bp) = self.breakpoints.get_mut(&id) {
                bp.enabled = enable;
            }
        }
        ok
    }

    /// After a hit: restore the instruction, step over it, re-insert the
    /// trap. The ordering is load-bearing; re-arming before the step would
    /// re-trap on the same instruction.
    pub fn step_over_breakpoint(&mut self, id: u32) -> bool {
        let Some(bp) = self.breakpoints.get(&id).copied() else {
            return false;
        };
        if !bp.enabled {
            return self.single_step(0);
        }
        if !self.restore_byte(bp.address, bp.original_byte) {
            return false;
        }
        if !self.single_step(0) {
            self.patch_byte(bp.address, TRAP_INSTRUCTION);
            return false;
        }
        let _ = waitpid(Pid::from_raw(self.current_thread), Some(WaitPidFlag::__WALL));
        self.patch_byte(bp.address, TRAP_INSTRUCTION).is_some()
    }

    pub fn breakpoints(&self) -> Vec<SwBreakpoint> {
        let mut all: Vec<SwBreakpoint> = self.breakpoints.values().copied().collect();
        all.sort_by_key(|bp| bp.id);
        all
    }

    pub fn breakpoint(&self, id: u32) -> Option<SwBreakpoint> {
        self.breakpoints.get(&id).copied()
    }

    pub fn has_enabled_breakpoint_at(&self, addr: u64) -> bool {
        self.addr_to_bp
            .get(&addr)
            .and_then(|id| self.breakpoints.get(id))
            .map(|bp| bp.enabled)
            .unwrap_or(false)
    }

    /// Replace the byte at `addr`, returning the previous value.
    fn patch_byte(&self, addr: u64, byte: u8) -> Option<u8> {
        let pid = Pid::from_raw(self.current_thread);
        let aligned = addr as ptrace::AddressType;
        let word = ptrace::read(pid, aligned).ok()?;
        let mut bytes = word.to_ne_bytes();
        let original = bytes[0];
        bytes[0] = byte;
        ptrace::write(pid, aligned, libc::c_long::from_ne_bytes(bytes)).ok()?;
        Some(original)
    }

    fn restore_byte(&self, addr: u64, original: u8) -> bool {
        self.patch_byte(addr, original).is_some()
    }
}

fn signal_from(signal: i32) -> Option<Signal> {
    if signal == 0 {
        None
    } else {
        Signal::try_from(signal).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_hex_round_trip() {
        let mut regs = RegisterSet::default();
        regs.rax = 0xdeadbeef;
        regs.rip = 0x401000;
        regs.r15 = u64::MAX;
        let hex = regs.to_hex();
        assert_eq!(hex.len(), 24 * 16);
        assert_eq!(RegisterSet::from_hex(&hex), regs);
    }

    #[test]
    fn test_register_numbering() {
        let mut regs = RegisterSet::default();
        assert!(regs.set(0, 1));
        assert!(regs.set(16, 0x401000));
        assert!(regs.set(17, 0x246));
        assert!(!regs.set(24, 0));
        assert_eq!(regs.rax, 1);
        assert_eq!(regs.rip, 0x401000);
        assert_eq!(regs.rflags, 0x246);
        assert_eq!(regs.get(16), Some(0x401000));
        assert_eq!(regs.get(99), None);
    }

    #[test]
    fn test_operations_fail_when_detached() {
        let mut controller = ProcessController::new();
        assert!(!controller.is_attached());
        assert!(!controller.cont(0));
        assert!(!controller.single_step(0));
        assert!(!controller.interrupt());
        assert!(!controller.detach());
        assert!(!controller.kill());
        assert!(controller.read_memory(0x1000, 16).is_empty());
        assert!(!controller.write_memory(0x1000, &[0x90]));
        assert!(controller.set_breakpoint(0x1000).is_none());
        assert_eq!(controller.read_registers(), RegisterSet::default());
    }

    // Live ptrace coverage (spawn, breakpoint byte preservation) lives in
    // tests/process_control.rs and is ignored by default because it needs
    // ptrace permissions.
}
