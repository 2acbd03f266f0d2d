//! GDB Remote Serial Protocol stub.
//!
//! A single-threaded loop over one client connection: read packet, dispatch,
//! answer. Standard commands map onto the process controller; everything
//! TraceSmith-specific travels through the `qRcmd` monitor namespace under
//! the `ts` prefix. GPU events are consumed at two well-defined points: after
//! `wait_for_stop` returns and after each packet dispatch.

use std::fmt::Write as _;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::events::TraceEvent;
use crate::gdb::engine::{GpuBreakpoint, GpuBreakpointKind, GpuDebugEngine};
use crate::gdb::packet;
use crate::gdb::process::{ProcessController, RegisterSet, StopEvent, StopReason};

/// Transport and sizing knobs for the stub.
#[derive(Debug, Clone)]
pub struct RspConfig {
    /// TCP listen port; ignored when a unix socket path is set.
    pub port: u16,
    pub unix_socket: Option<PathBuf>,
    pub max_packet_size: usize,
}

impl Default for RspConfig {
    fn default() -> Self {
        RspConfig {
            port: 1234,
            unix_socket: None,
            max_packet_size: 4096,
        }
    }
}

pub struct RspHandler {
    config: RspConfig,
    process: ProcessController,
    engine: GpuDebugEngine,
    no_ack_mode: bool,
    running: bool,
    /// Last GPU breakpoint hit, kept for `ts status` after a synthetic stop.
    last_gpu_hit: Option<(TraceEvent, GpuBreakpoint)>,
}

impl RspHandler {
    pub fn new(config: RspConfig) -> Self {
        RspHandler {
            config,
            process: ProcessController::new(),
            engine: GpuDebugEngine::default(),
            no_ack_mode: false,
            running: false,
            last_gpu_hit: None,
        }
    }

    /// Attach to a live process and bring up the GPU engine.
    pub fn attach(&mut self, pid: i32) -> Result<()> {
        if !self.process.attach(pid) {
            anyhow::bail!("failed to attach to pid {pid} (ptrace denied or no such process)");
        }
        self.engine.initialize(pid)?;
        Ok(())
    }

    /// Spawn a target under trace and bring up the GPU engine.
    pub fn spawn(&mut self, argv: &[String]) -> Result<()> {
        if !self.process.spawn(argv) {
            anyhow::bail!("failed to spawn {:?} under trace", argv.first());
        }
        let pid = self.process.pid();
        self.engine.initialize(pid)?;
        Ok(())
    }

    pub fn engine_mut(&mut self) -> &mut GpuDebugEngine {
        &mut self.engine
    }

    pub fn process_mut(&mut self) -> &mut ProcessController {
        &mut self.process
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Bind, accept one debugger connection and serve it to completion.
    pub fn listen_and_serve(&mut self) -> Result<()> {
        if let Some(path) = self.config.unix_socket.clone() {
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path)
                .with_context(|| format!("binding unix socket {}", path.display()))?;
            tracing::info!(socket = %path.display(), "waiting for GDB connection");
            let (mut stream, _) = listener.accept()?;
            self.serve(&mut stream)
        } else {
            let listener = TcpListener::bind(("0.0.0.0", self.config.port))
                .with_context(|| format!("binding TCP port {}", self.config.port))?;
            tracing::info!(port = self.config.port, "waiting for GDB connection");
            let (mut stream, peer) = listener.accept()?;
            tracing::info!(%peer, "GDB connected");
            self.serve(&mut stream)
        }
    }

    /// The packet loop over an established connection.
    pub fn serve<S: Read + Write>(&mut self, stream: &mut S) -> Result<()> {
        self.running = true;
        while self.running {
            let Some(payload) = self.read_packet(stream)? else {
                break; // client disconnected
            };
            let reply = self.dispatch(&payload);
            self.send_packet(stream, reply.as_bytes())?;
            // Consult the GPU event queue between packets.
            if let Some(hit) = self.engine.poll_events() {
                self.last_gpu_hit = Some(hit);
            }
        }
        self.running = false;
        tracing::info!("GDB disconnected");
        Ok(())
    }

    /// Read one framed packet, handling acks, interrupts and checksum
    /// failures. `None` means the peer went away.
    fn read_packet<S: Read + Write>(&mut self, stream: &mut S) -> Result<Option<Vec<u8>>> {
        // Hunt for '$', reacting to interrupts and swallowing stray acks.
        loop {
            let Some(byte) = read_byte(stream)? else {
                return Ok(None);
            };
            match byte {
                0x03 => {
                    self.process.interrupt();
                }
                b'+' | b'-' => {}
                b'$' => break,
                _ => {}
            }
        }

        let mut raw = vec![b'$'];
        loop {
            let Some(byte) = read_byte(stream)? else {
                return Ok(None);
            };
            raw.push(byte);
            if byte == b'#' {
                break;
            }
            if raw.len() > self.config.max_packet_size + 4 {
                // Overlong garbage; force a checksum failure below.
                break;
            }
        }
        for _ in 0..2 {
            let Some(byte) = read_byte(stream)? else {
                return Ok(None);
            };
            raw.push(byte);
        }

        match packet::decode(&raw) {
            Some(payload) => {
                if !self.no_ack_mode {
                    stream.write_all(b"+")?;
                }
                Ok(Some(payload))
            }
            None => {
                // Checksum mismatch: NACK and resynchronise on the next '$'.
                stream.write_all(b"-")?;
                self.read_packet(stream)
            }
        }
    }

    fn send_packet<S: Read + Write>(&mut self, stream: &mut S, payload: &[u8]) -> Result<()> {
        let framed = packet::encode(payload);
        stream.write_all(&framed)?;
        stream.flush()?;
        if !self.no_ack_mode {
            // Swallow the ack; a NACK would mean retransmission, which one
            // retry covers in practice.
            if let Some(b'-') = read_byte(stream)? {
                stream.write_all(&framed)?;
                stream.flush()?;
            }
        }
        Ok(())
    }

    /// Decode one command payload into its reply payload. Every well-formed
    /// packet gets an answer; the empty payload means "unsupported".
    pub fn dispatch(&mut self, payload: &[u8]) -> String {
        if payload.is_empty() {
            return String::new();
        }
        let text = String::from_utf8_lossy(payload).into_owned();

        match payload[0] {
            b'g' => self.process.read_registers().to_hex(),
            b'G' => {
                let regs = RegisterSet::from_hex(&text[1..]);
                if self.process.write_registers(&regs) {
                    packet::reply_ok()
                } else {
                    packet::reply_error(1)
                }
            }
            b'm' => self.cmd_read_memory(&text[1..]),
            b'M' => self.cmd_write_memory(&text[1..]),
            b'X' => self.cmd_binary_write(payload),
            b'c' => self.resume_and_wait(0, false),
            b'C' => self.resume_and_wait(packet::hex_u64(&text[1..text.len().min(3)]) as i32, false),
            b's' => self.resume_and_wait(0, true),
            b'S' => self.resume_and_wait(packet::hex_u64(&text[1..text.len().min(3)]) as i32, true),
            b'k' => {
                self.process.kill();
                self.running = false;
                packet::reply_ok()
            }
            b'D' => {
                self.process.detach();
                self.running = false;
                packet::reply_ok()
            }
            b'Z' | b'z' => self.cmd_breakpoint(payload[0] == b'Z', &text),
            b'?' => packet::stop_reply_signal(5),
            b'H' => self.cmd_set_thread(&text),
            b'T' => {
                let tid = packet::hex_u64(&text[1..]) as i32;
                if self.process.is_thread_alive(tid) {
                    packet::reply_ok()
                } else {
                    packet::reply_error(1)
                }
            }
            b'!' => packet::reply_ok(),
            b'v' => self.cmd_v(&text[1..]),
            b'q' => self.cmd_query(&text[1..]),
            b'Q' => self.cmd_query_set(&text[1..]),
            _ => String::new(),
        }
    }

    // ---- standard commands ----

    fn cmd_read_memory(&mut self, args: &str) -> String {
        let Some((addr, len)) = args.split_once(',') else {
            return packet::reply_error(1);
        };
        let addr = packet::hex_u64(addr);
        let len = packet::hex_u64(len) as usize;
        let data = self.process.read_memory(addr, len);
        if data.is_empty() {
            return packet::reply_error(1);
        }
        packet::to_hex(&data)
    }

    fn cmd_write_memory(&mut self, args: &str) -> String {
        let Some((head, hex_data)) = args.split_once(':') else {
            return packet::reply_error(1);
        };
        let Some((addr, _len)) = head.split_once(',') else {
            return packet::reply_error(1);
        };
        let addr = packet::hex_u64(addr);
        let data = packet::from_hex(hex_data);
        if self.process.write_memory(addr, &data) {
            packet::reply_ok()
        } else {
            packet::reply_error(1)
        }
    }

    /// `X<addr>,<len>:<raw bytes>`; the payload is already unescaped.
    fn cmd_binary_write(&mut self, payload: &[u8]) -> String {
        let Some(colon) = payload.iter().position(|&b| b == b':') else {
            return packet::reply_error(1);
        };
        let head = String::from_utf8_lossy(&payload[1..colon]);
        let Some((addr, len)) = head.split_once(',') else {
            return packet::reply_error(1);
        };
        let addr = packet::hex_u64(addr);
        let len = packet::hex_u64(len) as usize;
        let data = &payload[colon + 1..];
        if data.len() != len {
            return packet::reply_error(1);
        }
        if len == 0 {
            // Zero-length probe: GDB uses it to test X support.
            return packet::reply_ok();
        }
        if self.process.write_memory(addr, data) {
            packet::reply_ok()
        } else {
            packet::reply_error(1)
        }
    }

    fn cmd_breakpoint(&mut self, insert: bool, text: &str) -> String {
        let mut parts = text[1..].split(',');
        let bp_type = parts.next().unwrap_or("");
        let addr = parts.next().map(packet::hex_u64);
        if bp_type != "0" {
            return String::new(); // only software breakpoints
        }
        let Some(addr) = addr else {
            return packet::reply_error(1);
        };
        let ok = if insert {
            self.process.set_breakpoint(addr).is_some()
        } else {
            self.process.remove_breakpoint_at(addr)
        };
        if ok {
            packet::reply_ok()
        } else {
            packet::reply_error(1)
        }
    }

    fn cmd_set_thread(&mut self, text: &str) -> String {
        // H<op><tid>; tid -1 or 0 means any thread.
        if text.len() < 2 {
            return packet::reply_error(1);
        }
        let args = &text[2..];
        if args.is_empty() || args == "-1" || args == "0" {
            return packet::reply_ok();
        }
        let tid = packet::hex_u64(args) as i32;
        if self.process.select_thread(tid) {
            packet::reply_ok()
        } else {
            packet::reply_error(1)
        }
    }

    fn cmd_v(&mut self, cmd: &str) -> String {
        if cmd == "Cont?" {
            return "vCont;c;C;s;S".to_string();
        }
        if let Some(actions) = cmd.strip_prefix("Cont;") {
            let action = actions.split(&[';', ':'][..]).next().unwrap_or("");
            return match action.chars().next() {
                Some('c') => self.resume_and_wait(0, false),
                Some('C') => {
                    self.resume_and_wait(packet::hex_u64(&action[1..]) as i32, false)
                }
                Some('s') => self.resume_and_wait(0, true),
                Some('S') => self.resume_and_wait(packet::hex_u64(&action[1..]) as i32, true),
                _ => String::new(),
            };
        }
        String::new()
    }

    fn cmd_query(&mut self, query: &str) -> String {
        // qRcmd separates its hex argument with a comma, unlike the
        // colon-delimited queries.
        if let Some(hex) = query.strip_prefix("Rcmd,") {
            let bytes = packet::from_hex(hex);
            let cmd = String::from_utf8_lossy(&bytes).into_owned();
            return self.handle_monitor(&cmd);
        }

        // The client's own feature list after the colon is irrelevant here;
        // we only answer with our features.
        let name = query.split_once(':').map(|(name, _)| name).unwrap_or(query);
        match name {
            "Supported" => format!(
                "PacketSize={:x};QStartNoAckMode+;qXfer:features:read+;multiprocess+",
                self.config.max_packet_size
            ),
            "Attached" => "1".to_string(),
            "fThreadInfo" => {
                let threads = self.process.threads();
                if threads.is_empty() {
                    return "l".to_string();
                }
                let mut out = String::from("m");
                for (i, tid) in threads.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{tid:x}");
                }
                out
            }
            "sThreadInfo" => "l".to_string(),
            "C" => format!("QC{:x}", self.process.current_thread()),
            _ => String::new(),
        }
    }

    fn cmd_query_set(&mut self, query: &str) -> String {
        if query == "StartNoAckMode" {
            self.no_ack_mode = true;
            return packet::reply_ok();
        }
        String::new()
    }

    /// Continue or step, wait for the next stop, then consult the GPU event
    /// queue. A GPU breakpoint that fired during the run is reported as a
    /// synthetic SIGTRAP on the most recently active thread so stock GDB
    /// stays happy.
    fn resume_and_wait(&mut self, signal: i32, step: bool) -> String {
        // Resuming on top of our own trap byte would re-trap immediately:
        // restore, single-step, re-arm, then continue.
        if !step {
            let pc = self.process.read_registers().rip;
            if self.process.has_enabled_breakpoint_at(pc) {
                if let Some(bp) = self
                    .process
                    .breakpoints()
                    .into_iter()
                    .find(|bp| bp.address == pc)
                {
                    self.process.step_over_breakpoint(bp.id);
                }
            }
        }
        let resumed = if step {
            self.process.single_step(signal)
        } else {
            self.process.cont(signal)
        };
        if !resumed {
            return packet::reply_error(1);
        }

        let stop = self.process.wait_for_stop();
        let gpu_hit = self.engine.poll_events();
        if let Some(hit) = gpu_hit {
            self.last_gpu_hit = Some(hit);
            if stop.reason != StopReason::Exited {
                return packet::stop_reply_thread(5, self.process.current_thread());
            }
        }
        self.format_stop_reply(&stop)
    }

    fn format_stop_reply(&mut self, stop: &StopEvent) -> String {
        match stop.reason {
            StopReason::Exited => {
                self.running = false;
                packet::exit_reply(stop.exit_code as u8)
            }
            StopReason::Breakpoint => packet::stop_reply_thread(5, stop.thread_id),
            StopReason::Signal => {
                packet::stop_reply_thread(stop.signal as u8, stop.thread_id)
            }
            StopReason::GpuBreakpoint => {
                packet::stop_reply_thread(5, self.process.current_thread())
            }
            StopReason::None => packet::stop_reply_signal(5),
        }
    }

    // ---- monitor namespace ----

    /// `monitor ts ...`. Free-form ASCII out, hex-wrapped for qRcmd.
    pub fn handle_monitor(&mut self, cmd: &str) -> String {
        let words: Vec<&str> = cmd.split_whitespace().collect();
        if words.is_empty() {
            return hex_text("Error: empty command\n");
        }
        if words[0] != "ts" {
            return hex_text("Error: unknown command. Use 'monitor ts help'\n");
        }
        let reply = match words.get(1).copied() {
            None | Some("help") => ts_help(),
            Some("status") => self.ts_status(),
            Some("devices") => self.ts_devices(),
            Some("memory") => self.ts_memory(words.get(2).copied()),
            Some("streams") => self.ts_streams(),
            Some("kernels") => self.ts_kernels(words.get(2).copied()),
            Some("kernel-search") => self.ts_kernel_search(words.get(2).copied()),
            Some("break") => self.ts_break(&words[2..]),
            Some("gpu") => self.ts_gpu(&words[2..]),
            Some("allocs") => self.ts_allocs(words.get(2).copied()),
            Some("trace") => self.ts_trace(&words[2..]),
            Some("replay") => self.ts_replay(&words[2..]),
            Some(other) => format!("Error: unknown command '{other}'\n"),
        };
        hex_text(&reply)
    }

    fn ts_status(&mut self) -> String {
        let snapshot = self.engine.snapshot();
        let mut out = String::from("GPU Status\n==========\n");
        let _ = writeln!(out, "Devices: {}", snapshot.devices.len());
        for dev in &snapshot.devices {
            let _ = writeln!(out, "  {}: {} ({})", dev.device_id, dev.name, dev.vendor);
        }
        if !snapshot.memory_states.is_empty() {
            out.push_str("\nMemory:\n");
            for (device, usage) in &snapshot.memory_states {
                let _ = writeln!(
                    out,
                    "  Device {}: {:.1} MB live, {:.1} MB peak, {} allocations",
                    device,
                    usage.live_bytes as f64 / (1024.0 * 1024.0),
                    usage.peak_bytes as f64 / (1024.0 * 1024.0),
                    usage.live_allocations
                );
            }
        }
        let _ = writeln!(
            out,
            "\nCapturing: {}",
            if self.engine.is_capturing() { "Yes" } else { "No" }
        );
        if let Some((event, bp)) = &self.last_gpu_hit {
            let _ = writeln!(
                out,
                "Last GPU breakpoint: #{} {} '{}'",
                bp.id,
                bp.kind.as_str(),
                event.name
            );
        }
        let replay = self.engine.replay_status();
        if let Some(file) = &replay.trace_file {
            let _ = writeln!(out, "Replay loaded: {file}");
            let _ = writeln!(
                out,
                "  Events: {}/{}",
                replay.current_index, replay.total_events
            );
        }
        out
    }

    fn ts_devices(&mut self) -> String {
        let devices = self.engine.devices();
        if devices.is_empty() {
            return "No GPU devices found\n".to_string();
        }
        let mut out = String::from("GPU Devices\n===========\n");
        for dev in devices {
            let _ = writeln!(out, "\nDevice {}: {}", dev.device_id, dev.name);
            let _ = writeln!(out, "  Vendor: {}", dev.vendor);
            let _ = writeln!(out, "  Compute: {}.{}", dev.compute_major, dev.compute_minor);
            let _ = writeln!(out, "  Memory: {} MB", dev.total_memory / (1024 * 1024));
            let _ = writeln!(out, "  SMs: {}", dev.multiprocessor_count);
            let _ = writeln!(out, "  Clock: {} MHz", dev.clock_rate_khz / 1000);
        }
        out
    }

    fn ts_memory(&mut self, device: Option<&str>) -> String {
        let device = match device {
            Some(arg) => match arg.parse::<u32>() {
                Ok(device) => device,
                Err(_) => return "Error: invalid device ID\n".to_string(),
            },
            None => 0,
        };
        let usage = self.engine.memory_usage(device);
        let mut out = String::from("GPU Memory\n==========\n");
        let _ = writeln!(
            out,
            "Current: {:.2} MB",
            usage.live_bytes as f64 / (1024.0 * 1024.0)
        );
        let _ = writeln!(
            out,
            "Peak: {:.2} MB",
            usage.peak_bytes as f64 / (1024.0 * 1024.0)
        );
        let _ = writeln!(out, "Live allocations: {}", usage.live_allocations);
        let _ = writeln!(out, "Total allocations: {}", usage.allocation_count);
        out
    }

    fn ts_streams(&mut self) -> String {
        let streams = self.engine.stream_states();
        if streams.is_empty() {
            return "No streams recorded\n".to_string();
        }
        let mut out = String::from("Stream States\n=============\n");
        for (device, stream, state, pending) in streams {
            let _ = writeln!(
                out,
                "Device {device} Stream {stream}: {} ({pending} pending)",
                state.as_str()
            );
        }
        out
    }

    fn ts_kernels(&mut self, count: Option<&str>) -> String {
        let count = count.and_then(|c| c.parse().ok()).unwrap_or(10usize);
        let kernels = self.engine.kernel_history(count);
        if kernels.is_empty() {
            return "No kernels recorded\n".to_string();
        }
        let mut out = format!("Kernel History (last {})\n", kernels.len());
        out.push_str(&"=".repeat(40));
        out.push('\n');
        for (i, kernel) in kernels.iter().enumerate() {
            let _ = write!(out, "#{} {}", i + 1, kernel.kernel_name);
            if let Some(params) = &kernel.params {
                let _ = write!(
                    out,
                    " <<<({},{},{}),({},{},{})>>>",
                    params.grid.0,
                    params.grid.1,
                    params.grid.2,
                    params.block.0,
                    params.block.1,
                    params.block.2
                );
            }
            if kernel.is_complete() {
                let _ = write!(out, " {:.1}us", kernel.duration() as f64 / 1000.0);
            } else {
                let _ = write!(out, " [running]");
            }
            out.push('\n');
        }
        out
    }

    fn ts_kernel_search(&mut self, pattern: Option<&str>) -> String {
        let Some(pattern) = pattern else {
            return "Usage: monitor ts kernel-search PATTERN\n".to_string();
        };
        let kernels = self.engine.find_kernels(pattern);
        let mut out = format!("Found {} kernels matching '{pattern}'\n", kernels.len());
        for kernel in kernels {
            let _ = writeln!(out, "  {} (device {})", kernel.kernel_name, kernel.device_id);
        }
        out
    }

    fn ts_break(&mut self, args: &[&str]) -> String {
        match args.first().copied() {
            Some("list") => {
                let breakpoints = self.engine.breakpoints();
                if breakpoints.is_empty() {
                    return "No GPU breakpoints set\n".to_string();
                }
                let mut out = String::from("GPU Breakpoints\n===============\n");
                for bp in breakpoints {
                    let _ = write!(out, "#{} {}", bp.id, bp.kind.as_str());
                    if !bp.kernel_pattern.is_empty() {
                        let _ = write!(out, " '{}'", bp.kernel_pattern);
                    }
                    if let Some(device) = bp.device_filter {
                        let _ = write!(out, " device={device}");
                    }
                    let _ = write!(out, " hits={}", bp.hit_count);
                    if !bp.enabled {
                        let _ = write!(out, " [disabled]");
                    }
                    out.push('\n');
                }
                out
            }
            Some("delete") => match args.get(1).and_then(|a| a.parse().ok()) {
                Some(id) => {
                    if self.engine.remove_breakpoint(id) {
                        format!("Deleted GPU breakpoint {id}\n")
                    } else {
                        "Breakpoint not found\n".to_string()
                    }
                }
                None => "Usage: monitor ts break delete ID\n".to_string(),
            },
            Some(action @ ("enable" | "disable")) => {
                match args.get(1).and_then(|a| a.parse().ok()) {
                    Some(id) => {
                        if self.engine.enable_breakpoint(id, action == "enable") {
                            "OK\n".to_string()
                        } else {
                            "Breakpoint not found\n".to_string()
                        }
                    }
                    None => "Usage: monitor ts break enable/disable ID\n".to_string(),
                }
            }
            Some("kernel") => {
                let pattern = args.get(1).copied().unwrap_or("");
                let bp =
                    GpuBreakpoint::new(GpuBreakpointKind::KernelLaunch).with_pattern(pattern);
                let id = self.engine.add_breakpoint(bp);
                if pattern.is_empty() {
                    format!("GPU breakpoint {id}: kernel launch\n")
                } else {
                    format!("GPU breakpoint {id}: kernel launch '{pattern}'\n")
                }
            }
            Some("memcpy") => {
                let kind = match args.get(1).copied() {
                    Some("d2h") => GpuBreakpointKind::MemcpyD2H,
                    Some("d2d") => GpuBreakpointKind::MemcpyD2D,
                    _ => GpuBreakpointKind::MemcpyH2D,
                };
                let id = self.engine.add_breakpoint(GpuBreakpoint::new(kind));
                format!("GPU breakpoint {id}: {}\n", kind.as_str())
            }
            Some("alloc") => {
                let id = self
                    .engine
                    .add_breakpoint(GpuBreakpoint::new(GpuBreakpointKind::MemAlloc));
                format!("GPU breakpoint {id}: memory allocation\n")
            }
            Some("free") => {
                let id = self
                    .engine
                    .add_breakpoint(GpuBreakpoint::new(GpuBreakpointKind::MemFree));
                format!("GPU breakpoint {id}: memory free\n")
            }
            Some("sync") => {
                let id = self
                    .engine
                    .add_breakpoint(GpuBreakpoint::new(GpuBreakpointKind::Synchronize));
                format!("GPU breakpoint {id}: synchronize\n")
            }
            _ => {
                "Usage: monitor ts break <kernel|memcpy|alloc|free|sync|list|delete|enable|disable>\n"
                    .to_string()
            }
        }
    }

    fn ts_gpu(&mut self, args: &[&str]) -> String {
        if args.first().copied() != Some("read") || args.len() < 4 {
            return "Usage: monitor ts gpu read DEV ADDR LEN\n".to_string();
        }
        let device = args[1].parse::<u32>().unwrap_or(0);
        let addr = packet::hex_u64(args[2].trim_start_matches("0x"));
        let len = args[3].parse::<usize>().unwrap_or(0);
        let data = self.engine.read_gpu_memory(device, addr, len);
        if data.is_empty() {
            return "Failed to read GPU memory\n".to_string();
        }
        let mut out = format!("GPU memory at {addr:#x}:\n");
        for chunk_start in (0..data.len()).step_by(16) {
            let _ = write!(out, "{:08x}: ", addr + chunk_start as u64);
            for byte in data.iter().skip(chunk_start).take(16) {
                let _ = write!(out, "{byte:02x} ");
            }
            out.push('\n');
        }
        out
    }

    fn ts_allocs(&mut self, device: Option<&str>) -> String {
        let device = device.and_then(|a| a.parse().ok()).unwrap_or(0u32);
        let allocations = self.engine.allocations(device);
        let mut out = String::from("GPU Memory Allocations\n======================\n");
        let _ = writeln!(out, "Count: {}\n", allocations.len());
        for (addr, size) in allocations {
            let _ = writeln!(out, "{addr:#x}: {size} bytes");
        }
        out
    }

    fn ts_trace(&mut self, args: &[&str]) -> String {
        match args.first().copied() {
            Some("start") => {
                if self.engine.start_capture() {
                    "GPU trace capture started\n".to_string()
                } else {
                    "Failed to start trace capture\n".to_string()
                }
            }
            Some("stop") => {
                if self.engine.stop_capture() {
                    format!(
                        "GPU trace capture stopped\nCaptured {} events\n",
                        self.engine.captured_events().len()
                    )
                } else {
                    "No capture in progress\n".to_string()
                }
            }
            Some("save") => match args.get(1) {
                Some(file) => match self.engine.save_trace(file) {
                    Ok(()) => format!("Trace saved to {file}\n"),
                    Err(err) => format!("Failed to save trace: {err}\n"),
                },
                None => "Usage: monitor ts trace save FILENAME\n".to_string(),
            },
            Some("load") => match args.get(1) {
                Some(file) => match self.engine.load_trace(file) {
                    Ok(count) => format!("Loaded trace: {file}\nEvents: {count}\n"),
                    Err(err) => format!("Failed to load trace: {err}\n"),
                },
                None => "Usage: monitor ts trace load FILENAME\n".to_string(),
            },
            _ => "Usage: monitor ts trace <start|stop|save FILE|load FILE>\n".to_string(),
        }
    }

    fn ts_replay(&mut self, args: &[&str]) -> String {
        let action = args.first().copied().unwrap_or("");
        if action == "status" {
            let status = self.engine.replay_status();
            let mut out = String::from("Replay Status\n=============\n");
            match &status.trace_file {
                Some(file) => {
                    let _ = writeln!(out, "File: {file}");
                    let _ = writeln!(
                        out,
                        "Events: {}/{}",
                        status.current_index, status.total_events
                    );
                    let _ = writeln!(out, "Active: {}", if status.active { "Yes" } else { "No" });
                    let _ = writeln!(out, "Paused: {}", if status.paused { "Yes" } else { "No" });
                }
                None => out.push_str("No trace loaded\n"),
            }
            return out;
        }

        let cursor = self.engine.replay_cursor();
        if cursor.total_events() == 0 {
            return "No trace loaded\n".to_string();
        }
        match action {
            "start" => cursor.start(),
            "stop" => cursor.stop(),
            "pause" => cursor.pause(),
            "resume" => cursor.resume(),
            "step" => {
                cursor.step_event();
            }
            "step-kernel" => {
                cursor.step_kernel();
            }
            "goto" => match args.get(1).and_then(|a| a.parse().ok()) {
                Some(ts) => cursor.goto_timestamp(ts),
                None => return "Usage: monitor ts replay goto TIMESTAMP\n".to_string(),
            },
            _ => {
                return "Usage: monitor ts replay <start|stop|pause|resume|step|step-kernel|goto|status>\n"
                    .to_string()
            }
        }
        match self.engine.current_replay_event() {
            Some(event) => format!("Current event: {} {}\n", event.kind, event.name),
            None => "OK (end of trace)\n".to_string(),
        }
    }
}

fn read_byte<S: Read>(stream: &mut S) -> Result<Option<u8>> {
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(buf[0])),
        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => read_byte(stream),
        Err(err) => Err(err.into()),
    }
}

fn hex_text(text: &str) -> String {
    packet::to_hex(text.as_bytes())
}

fn ts_help() -> String {
    let mut out = String::new();
    out.push_str("TraceSmith GDB Extensions\n");
    out.push_str("=========================\n\n");
    out.push_str("GPU Status & Info:\n");
    out.push_str("  monitor ts status              Show GPU status summary\n");
    out.push_str("  monitor ts devices             List all GPU devices\n");
    out.push_str("  monitor ts memory [DEV]        Show GPU memory usage\n");
    out.push_str("  monitor ts streams             Show stream states\n\n");
    out.push_str("Kernel History:\n");
    out.push_str("  monitor ts kernels [N]         Show last N kernel calls\n");
    out.push_str("  monitor ts kernel-search PAT   Search kernels by pattern\n\n");
    out.push_str("GPU Breakpoints:\n");
    out.push_str("  monitor ts break kernel NAME   Break on kernel launch\n");
    out.push_str("  monitor ts break memcpy [DIR]  Break on memcpy (h2d/d2h/d2d)\n");
    out.push_str("  monitor ts break alloc         Break on allocation\n");
    out.push_str("  monitor ts break free          Break on free\n");
    out.push_str("  monitor ts break sync          Break on synchronize\n");
    out.push_str("  monitor ts break list          List GPU breakpoints\n");
    out.push_str("  monitor ts break delete N      Delete breakpoint\n");
    out.push_str("  monitor ts break enable N      Enable breakpoint\n");
    out.push_str("  monitor ts break disable N     Disable breakpoint\n\n");
    out.push_str("GPU Memory:\n");
    out.push_str("  monitor ts gpu read DEV ADDR LEN  Read device memory\n");
    out.push_str("  monitor ts allocs [DEV]        List live allocations\n\n");
    out.push_str("Trace:\n");
    out.push_str("  monitor ts trace start         Start capture\n");
    out.push_str("  monitor ts trace stop          Stop capture\n");
    out.push_str("  monitor ts trace save FILE     Save trace to SBT\n");
    out.push_str("  monitor ts trace load FILE     Load trace for replay\n\n");
    out.push_str("Replay:\n");
    out.push_str("  monitor ts replay start        Start replay\n");
    out.push_str("  monitor ts replay step         Step one event\n");
    out.push_str("  monitor ts replay step-kernel  Step to next kernel launch\n");
    out.push_str("  monitor ts replay goto TS      Seek to timestamp\n");
    out.push_str("  monitor ts replay status       Show replay status\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn handler() -> RspHandler {
        RspHandler::new(RspConfig::default())
    }

    fn monitor(handler: &mut RspHandler, cmd: &str) -> String {
        let hex = handler.handle_monitor(cmd);
        String::from_utf8(packet::from_hex(&hex)).unwrap()
    }

    #[test]
    fn test_qsupported_advertises_noack() {
        let mut h = handler();
        let reply = h.dispatch(b"qSupported:multiprocess+;xmlRegisters=i386");
        assert!(reply.contains("PacketSize=1000"));
        assert!(reply.contains("QStartNoAckMode+"));
    }

    #[test]
    fn test_stop_reason_initial() {
        let mut h = handler();
        assert_eq!(h.dispatch(b"?"), "S05");
    }

    #[test]
    fn test_unsupported_is_empty() {
        let mut h = handler();
        assert_eq!(h.dispatch(b"Bunknown"), "");
        assert_eq!(h.dispatch(b"Z1,1000,1"), "");
    }

    #[test]
    fn test_no_ack_mode_set() {
        let mut h = handler();
        assert_eq!(h.dispatch(b"QStartNoAckMode"), "OK");
        assert!(h.no_ack_mode);
    }

    #[test]
    fn test_extended_mode_ok() {
        let mut h = handler();
        assert_eq!(h.dispatch(b"!"), "OK");
    }

    #[test]
    fn test_vcont_query() {
        let mut h = handler();
        assert_eq!(h.dispatch(b"vCont?"), "vCont;c;C;s;S");
    }

    #[test]
    fn test_memory_read_detached_errors() {
        let mut h = handler();
        assert_eq!(h.dispatch(b"m1000,10"), "E01");
        assert_eq!(h.dispatch(b"m_garbage"), "E01");
    }

    #[test]
    fn test_monitor_help() {
        let mut h = handler();
        let text = monitor(&mut h, "ts help");
        assert!(text.contains("TraceSmith GDB Extensions"));
        assert!(text.contains("monitor ts break kernel"));
    }

    #[test]
    fn test_monitor_unknown_prefix() {
        let mut h = handler();
        let text = monitor(&mut h, "reset board");
        assert!(text.contains("unknown command"));
    }

    #[test]
    fn test_monitor_break_lifecycle() {
        let mut h = handler();
        let text = monitor(&mut h, "ts break kernel matmul*");
        assert!(text.contains("GPU breakpoint 1"));

        let listing = monitor(&mut h, "ts break list");
        assert!(listing.contains("#1 KernelLaunch 'matmul*'"));

        let text = monitor(&mut h, "ts break disable 1");
        assert!(text.contains("OK"));
        let listing = monitor(&mut h, "ts break list");
        assert!(listing.contains("[disabled]"));

        let text = monitor(&mut h, "ts break delete 1");
        assert!(text.contains("Deleted"));
        let listing = monitor(&mut h, "ts break list");
        assert!(listing.contains("No GPU breakpoints"));
    }

    #[test]
    fn test_monitor_kernels_from_engine() {
        let mut h = handler();
        let mut launch = TraceEvent::new(EventKind::KernelLaunch);
        launch.name = "vector_add".to_string();
        launch.correlation_id = 1;
        launch.timestamp = 100;
        h.engine_mut().process_event(launch);

        let text = monitor(&mut h, "ts kernels");
        assert!(text.contains("vector_add"));
        assert!(text.contains("[running]"));

        let text = monitor(&mut h, "ts kernel-search vec*");
        assert!(text.contains("Found 1 kernels"));
    }

    #[test]
    fn test_monitor_replay_without_trace() {
        let mut h = handler();
        let text = monitor(&mut h, "ts replay step");
        assert!(text.contains("No trace loaded"));
        let text = monitor(&mut h, "ts replay status");
        assert!(text.contains("No trace loaded"));
    }

    #[test]
    fn test_qrcmd_hex_round_trip() {
        let mut h = handler();
        // "ts help" in hex.
        let hex_cmd = packet::to_hex(b"ts help");
        let reply = h.dispatch(format!("qRcmd,{hex_cmd}").as_bytes());
        let text = String::from_utf8(packet::from_hex(&reply)).unwrap();
        assert!(text.contains("TraceSmith"));
    }

    #[test]
    fn test_serve_loop_over_in_memory_stream() {
        use std::collections::VecDeque;

        // A duplex stream scripted with client bytes.
        struct Scripted {
            input: VecDeque<u8>,
            output: Vec<u8>,
        }
        impl Read for Scripted {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                match self.input.pop_front() {
                    Some(byte) => {
                        buf[0] = byte;
                        Ok(1)
                    }
                    None => Ok(0),
                }
            }
        }
        impl Write for Scripted {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.output.extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        // No-ack first so the server never waits for client acks.
        let mut input = VecDeque::new();
        input.extend(packet::encode(b"QStartNoAckMode"));
        input.extend(packet::encode(b"?"));
        let mut stream = Scripted {
            input,
            output: Vec::new(),
        };

        let mut h = handler();
        h.serve(&mut stream).unwrap();
        let output = String::from_utf8_lossy(&stream.output);
        assert!(output.contains("$OK#9a"));
        assert!(output.contains("$S05#b8"));
    }
}
