//! Live ptrace tests for the process controller.
//!
//! These spawn real children under trace and therefore need ptrace
//! permission (unrestricted yama/ptrace_scope or root). They are ignored by
//! default:
//!
//! ```text
//! cargo test --test process_control -- --ignored
//! ```

use tracesmith::gdb::{ProcessController, StopReason};

#[test]
#[ignore] // Requires ptrace permission
fn test_spawn_read_registers_and_memory() {
    let mut controller = ProcessController::new();
    assert!(controller.spawn(&["/bin/sleep".to_string(), "10".to_string()]));
    assert!(controller.is_attached());
    assert!(controller.pid() > 0);

    let regs = controller.read_registers();
    assert!(regs.rip != 0, "program counter should be set after exec stop");

    let code = controller.read_memory(regs.rip, 16);
    assert!(!code.is_empty(), "text segment should be readable");

    assert!(controller.kill());
    assert!(!controller.is_attached());
}

#[test]
#[ignore] // Requires ptrace permission
fn test_breakpoint_byte_preserved() {
    let mut controller = ProcessController::new();
    assert!(controller.spawn(&["/bin/sleep".to_string(), "10".to_string()]));

    let addr = controller.read_registers().rip;
    let before = controller.read_memory(addr, 1);
    assert_eq!(before.len(), 1);

    let id = controller.set_breakpoint(addr).expect("set breakpoint");
    let trapped = controller.read_memory(addr, 1);
    assert_eq!(trapped[0], 0xCC);

    assert!(controller.remove_breakpoint(id));
    let after = controller.read_memory(addr, 1);
    assert_eq!(after, before, "original byte must be restored");

    controller.kill();
}

#[test]
#[ignore] // Requires ptrace permission
fn test_disable_and_reenable_breakpoint() {
    let mut controller = ProcessController::new();
    assert!(controller.spawn(&["/bin/sleep".to_string(), "10".to_string()]));

    let addr = controller.read_registers().rip;
    let before = controller.read_memory(addr, 1)[0];
    let id = controller.set_breakpoint(addr).unwrap();

    assert!(controller.enable_breakpoint(id, false));
    assert_eq!(controller.read_memory(addr, 1)[0], before);

    assert!(controller.enable_breakpoint(id, true));
    assert_eq!(controller.read_memory(addr, 1)[0], 0xCC);

    controller.kill();
}

#[test]
#[ignore] // Requires ptrace permission
fn test_step_over_rearms_trap() {
    let mut controller = ProcessController::new();
    assert!(controller.spawn(&["/bin/sleep".to_string(), "10".to_string()]));

    let addr = controller.read_registers().rip;
    let id = controller.set_breakpoint(addr).unwrap();

    // Step over the displaced instruction; the trap must be re-armed after.
    assert!(controller.step_over_breakpoint(id));
    assert_eq!(controller.read_memory(addr, 1)[0], 0xCC);

    controller.kill();
}

#[test]
#[ignore] // Requires ptrace permission
fn test_exit_reported() {
    let mut controller = ProcessController::new();
    assert!(controller.spawn(&["/bin/true".to_string()]));
    assert!(controller.cont(0));
    let stop = controller.wait_for_stop();
    assert_eq!(stop.reason, StopReason::Exited);
    assert_eq!(stop.exit_code, 0);
}

#[test]
#[ignore] // Requires ptrace permission
fn test_thread_listing() {
    let mut controller = ProcessController::new();
    assert!(controller.spawn(&["/bin/sleep".to_string(), "10".to_string()]));
    let threads = controller.threads();
    assert_eq!(threads, vec![controller.pid()]);
    assert!(controller.is_thread_alive(controller.pid()));
    assert!(!controller.is_thread_alive(1));
    controller.kill();
}
