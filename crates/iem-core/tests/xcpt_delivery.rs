mod common;

use common::*;
use iem_core::state::{gpr, RFLAGS_IF, RFLAGS_RF};
use iem_core::xcpt::{XCPT_AC, XCPT_BP, XCPT_DB, XCPT_DE, XCPT_DF, XCPT_GP, XCPT_NMI, XCPT_PF, XCPT_TS};
use iem_core::{
    evaluate_recursive_xcpt, CpuVendor, Exit, FlatBus, Info, PendingTrap, RecursiveXcpt,
    SilentDebugPolicy, Vcpu, XcptFlags,
};
use iem_mmu::MemoryBus;

/// EFLAGS image pushed for a fault or external interrupt taken with `efl`.
fn with_rf(efl: u32) -> u32 {
    efl | RFLAGS_RF as u32
}

fn stack_dwords(cpu: &Vcpu<FlatBus>, esp: u64, n: usize) -> Vec<u32> {
    (0..n).map(|i| read_u32(cpu, esp + i as u64 * 4)).collect()
}

#[test]
fn recursive_exception_classes() {
    let cpu = XcptFlags::CPU_XCPT;
    let cases = [
        (XCPT_DE, XCPT_GP, RecursiveXcpt::DoubleFault),
        (XCPT_TS, XCPT_GP, RecursiveXcpt::DoubleFault),
        (XCPT_PF, XCPT_PF, RecursiveXcpt::DoubleFault),
        (XCPT_PF, XCPT_GP, RecursiveXcpt::DoubleFault),
        (XCPT_GP, XCPT_PF, RecursiveXcpt::Current),
        (XCPT_DF, XCPT_GP, RecursiveXcpt::TripleFault),
        (XCPT_DF, XCPT_PF, RecursiveXcpt::TripleFault),
        (XCPT_DF, XCPT_DB, RecursiveXcpt::Current),
        (XCPT_DB, XCPT_GP, RecursiveXcpt::Current),
        (XCPT_NMI, XCPT_PF, RecursiveXcpt::Current),
        (XCPT_AC, XCPT_AC, RecursiveXcpt::CpuHang),
    ];
    for (prev, cur, expected) in cases {
        assert_eq!(
            evaluate_recursive_xcpt(cpu, prev, cpu, cur),
            expected,
            "prev={prev} cur={cur}"
        );
    }

    // Software interrupts and external interrupts never escalate.
    assert_eq!(
        evaluate_recursive_xcpt(XcptFlags::SOFT_INT | XcptFlags::BP_INSTR, XCPT_BP, cpu, XCPT_GP),
        RecursiveXcpt::Current
    );
    assert_eq!(
        evaluate_recursive_xcpt(cpu, XCPT_GP, XcptFlags::EXT_INT, 0x20),
        RecursiveXcpt::Current
    );
}

#[test]
fn int_from_ring3_switches_to_the_tss_stack() {
    // int 0x80
    let mut cpu = protected_guest(&[0xcd, 0x80]);
    enter_user_mode(&mut cpu);
    cpu.state.set_rflags(0x202);

    assert_eq!(cpu.execute_one(), Ok(Info::Done));

    assert_eq!(cpu.state.rip(), handler_for(0x80) as u64);
    assert_eq!(cpu.state.cpl(), 0);
    assert_eq!(cpu.state.segments.cs.selector, KCODE);
    assert_eq!(cpu.state.segments.ss.selector, KDATA);
    let esp = (KERNEL_STACK - 20) as u64;
    assert_eq!(cpu.state.gpr_u64(gpr::RSP), esp);
    assert_eq!(
        stack_dwords(&cpu, esp, 5),
        vec![CODE as u32 + 2, UCODE as u32, 0x202, USER_STACK, UDATA as u32]
    );
    assert!(!cpu.state.get_flag(RFLAGS_IF));
    assert_eq!(cpu.stats.instructions, 1);
}

#[test]
fn int_at_ring0_stays_on_the_current_stack() {
    let mut cpu = protected_guest(&[0xcd, 0x80]);

    assert_eq!(cpu.execute_one(), Ok(Info::Done));

    assert_eq!(cpu.state.segments.ss.selector, KDATA);
    assert_eq!(cpu.state.gpr_u64(gpr::RSP), 0x8000 - 12);
    assert_eq!(
        stack_dwords(&cpu, 0x8000 - 12, 3),
        vec![CODE as u32 + 2, KCODE as u32, 0x2]
    );
}

#[test]
fn int_through_a_ring0_gate_from_ring3_faults() {
    // int 0x21 targets an interrupt gate with DPL 0.
    let mut cpu = protected_guest(&[0xcd, 0x21]);
    write_idt_gate32(&mut cpu.platform, 0x21, KCODE, handler_for(0x21), 0x8e);
    enter_user_mode(&mut cpu);

    assert_eq!(cpu.execute_one(), Ok(Info::Done));

    assert_eq!(cpu.state.rip(), handler_for(XCPT_GP) as u64);
    let esp = (KERNEL_STACK - 24) as u64;
    // #GP(vector << 3 | IDT) pushed below the ring 3 frame.
    assert_eq!(read_u32(&cpu, esp), (0x21 << 3) | 2);
    assert_eq!(read_u32(&cpu, esp + 4), CODE as u32);
}

#[test]
fn page_fault_reports_cr2_and_error_code() {
    // mov eax, [0x40000]
    let mut cpu = protected_guest(&[0xa1, 0x00, 0x00, 0x04, 0x00]);
    enable_paging(&mut cpu);

    assert_eq!(cpu.execute_one(), Ok(Info::Done));

    assert_eq!(cpu.state.control.cr2, 0x40000);
    assert_eq!(cpu.state.rip(), handler_for(XCPT_PF) as u64);
    assert_eq!(
        stack_dwords(&cpu, 0x8000 - 16, 4),
        vec![0, CODE as u32, KCODE as u32, with_rf(0x2)]
    );
    assert_eq!(cpu.mappings().active(), 0);
    assert_eq!(cpu.stats.exceptions_raised, 1);
}

#[test]
fn user_page_fault_sets_the_us_bit() {
    let mut cpu = protected_guest(&[0xa1, 0x00, 0x00, 0x04, 0x00]);
    enable_paging(&mut cpu);
    enter_user_mode(&mut cpu);

    assert_eq!(cpu.execute_one(), Ok(Info::Done));

    let esp = (KERNEL_STACK - 24) as u64;
    assert_eq!(cpu.state.gpr_u64(gpr::RSP), esp);
    assert_eq!(
        stack_dwords(&cpu, esp, 6),
        vec![4, CODE as u32, UCODE as u32, with_rf(0x2), USER_STACK, UDATA as u32]
    );
    // The faulting instruction did not complete.
    assert_eq!(cpu.state.gpr_u64(gpr::RAX), 0);
}

#[test]
fn gp_during_gp_delivery_becomes_a_double_fault() {
    // mov ds, ax with a selector past the GDT limit.
    let mut cpu = protected_guest(&[0x8e, 0xd8]);
    cpu.state.set_gpr_u64(gpr::RAX, 0x7ff8);
    // The #GP gate names a code selector outside the GDT as well.
    write_idt_gate32(&mut cpu.platform, XCPT_GP, 0x48, handler_for(XCPT_GP), 0x8e);

    assert_eq!(cpu.execute_one(), Ok(Info::Done));

    assert_eq!(cpu.state.rip(), handler_for(XCPT_DF) as u64);
    assert_eq!(
        stack_dwords(&cpu, 0x8000 - 16, 4),
        vec![0, CODE as u32, KCODE as u32, with_rf(0x2)]
    );
    assert_eq!(cpu.state.segments.ds.selector, KDATA);
}

#[test]
fn fault_during_double_fault_shuts_down() {
    let mut cpu = protected_guest(&[0x8e, 0xd8]);
    cpu.state.set_gpr_u64(gpr::RAX, 0x7ff8);
    write_idt_gate32(&mut cpu.platform, XCPT_GP, 0x48, handler_for(XCPT_GP), 0x8e);
    write_idt_gate32(&mut cpu.platform, XCPT_DF, 0x48, handler_for(XCPT_DF), 0x8e);

    assert_eq!(cpu.execute_one(), Err(Exit::TripleFault));
    assert_eq!(cpu.mappings().active(), 0);
}

#[test]
fn exception_handler_runs_to_its_hlt() {
    // ud2
    let mut cpu = protected_guest(&[0x0f, 0x0b]);
    let (res, n) = cpu.execute_many(8);
    assert_eq!(res, Ok(Info::Halt));
    // ud2 (delivered as #UD) and the handler's hlt.
    assert_eq!(n, 2);
    assert_eq!(cpu.state.rip(), handler_for(6) as u64 + 1);
}

/// Protected guest with a ring 0 interrupt gate for the timer vector.
fn guest_with_timer_gate() -> Vcpu<FlatBus> {
    let mut cpu = protected_guest(&[0x90, 0x90]);
    write_idt_gate32(&mut cpu.platform, 0x20, KCODE, handler_for(0x20), 0x8e);
    cpu.platform.load(handler_for(0x20) as u64, &[0xf4]);
    cpu
}

#[test]
fn external_interrupt_waits_for_if() {
    let mut cpu = guest_with_timer_gate();
    cpu.set_pending_trap(PendingTrap::hardware_int(0x20));

    assert_eq!(cpu.inject_pending_event(), Ok(false));
    assert_eq!(cpu.pending_trap(), Some(PendingTrap::hardware_int(0x20)));
    assert_eq!(cpu.state.rip(), CODE);

    cpu.state.set_rflags(0x202);
    assert_eq!(cpu.inject_pending_event(), Ok(true));
    assert_eq!(cpu.pending_trap(), None);
    assert_eq!(cpu.state.rip(), handler_for(0x20) as u64);
    // External interrupts resume at the interrupted instruction.
    assert_eq!(
        stack_dwords(&cpu, 0x8000 - 12, 3),
        vec![CODE as u32, KCODE as u32, with_rf(0x202)]
    );
    assert!(!cpu.state.get_flag(RFLAGS_IF));
}

#[test]
fn external_interrupt_waits_out_the_sti_shadow() {
    let mut cpu = guest_with_timer_gate();
    cpu.state.set_rflags(0x202);
    cpu.state.inhibit_shadow = Some(CODE);
    cpu.set_pending_trap(PendingTrap::hardware_int(0x20));

    assert_eq!(cpu.inject_pending_event(), Ok(false));
    assert!(cpu.pending_trap().is_some());

    // The shadowed instruction runs, then the interrupt is taken.
    assert_eq!(cpu.execute_one(), Ok(Info::Done));
    assert_eq!(cpu.state.rip(), CODE + 1);
    assert_eq!(cpu.inject_pending_event(), Ok(true));
    assert_eq!(cpu.state.rip(), handler_for(0x20) as u64);
    assert_eq!(read_u32(&cpu, 0x8000 - 12), CODE as u32 + 1);
}

#[test]
fn nmi_waits_while_nmis_are_blocked() {
    let mut cpu = protected_guest(&[0x90]);
    cpu.state.nmi_blocked = true;
    cpu.set_pending_trap(PendingTrap::exception(XCPT_NMI, None));

    assert_eq!(cpu.inject_pending_event(), Ok(false));
    assert_eq!(cpu.state.rip(), CODE);

    cpu.state.nmi_blocked = false;
    assert_eq!(cpu.inject_pending_event(), Ok(true));
    assert_eq!(cpu.state.rip(), handler_for(XCPT_NMI) as u64);
    // Delivering the NMI blocks the next one.
    assert!(cpu.state.nmi_blocked);
}

#[test]
fn delivery_wakes_a_halted_cpu() {
    // hlt
    let mut cpu = guest_with_timer_gate();
    cpu.platform.load(CODE, &[0xf4]);
    cpu.state.set_rflags(0x202);

    assert_eq!(cpu.execute_one(), Ok(Info::Halt));
    assert!(cpu.state.halted);

    cpu.set_pending_trap(PendingTrap::hardware_int(0x20));
    assert_eq!(cpu.inject_pending_event(), Ok(true));
    assert!(!cpu.state.halted);
    assert_eq!(read_u32(&cpu, 0x8000 - 12), CODE as u32 + 1);
}

/// Run `int 0x80` with a DR0 hit already recorded; returns the DR6 B bits
/// reported by the #DB that follows.
fn int_with_pending_breakpoint_hit(vendor: CpuVendor, policy: SilentDebugPolicy) -> u64 {
    let mut cpu = protected_guest(&[0xcd, 0x80]);
    cpu.config.vendor = vendor;
    cpu.config.silent_soft_int_debug = policy;
    cpu.state.dbg_hits.drx = 1;

    assert_eq!(cpu.execute_one(), Ok(Info::Done));

    assert_eq!(cpu.state.rip(), handler_for(XCPT_DB) as u64);
    // #DB frame on top of the INT frame.
    assert_eq!(
        stack_dwords(&cpu, 0x8000 - 24, 2),
        vec![handler_for(0x80), KCODE as u32]
    );
    cpu.state.dr[6] & 0xf
}

#[test]
fn soft_int_debug_policy_controls_reported_hits() {
    assert_eq!(int_with_pending_breakpoint_hit(CpuVendor::Intel, SilentDebugPolicy::Never), 1);
    assert_eq!(int_with_pending_breakpoint_hit(CpuVendor::Amd, SilentDebugPolicy::Never), 1);
    assert_eq!(int_with_pending_breakpoint_hit(CpuVendor::Intel, SilentDebugPolicy::IntelOnly), 0);
    assert_eq!(int_with_pending_breakpoint_hit(CpuVendor::Amd, SilentDebugPolicy::IntelOnly), 1);
    assert_eq!(int_with_pending_breakpoint_hit(CpuVendor::Amd, SilentDebugPolicy::Always), 0);
}

#[test]
fn int_through_a_16bit_gate_pushes_words() {
    // int 0x83
    let mut cpu = protected_guest(&[0xcd, 0x83]);
    write_idt_gate32(&mut cpu.platform, 0x83, KCODE, 0xf000, 0x86);
    cpu.platform.load(0xf000, &[0xf4]);
    cpu.state.set_rflags(0x202);

    assert_eq!(cpu.execute_one(), Ok(Info::Done));

    assert_eq!(cpu.state.rip(), 0xf000);
    assert_eq!(cpu.state.gpr_u64(gpr::RSP), 0x8000 - 6);
    // IP, CS and FLAGS, 16 bits each; IP keeps only its low word.
    assert_eq!(cpu.platform.read_u16(0x8000 - 6), (CODE as u16).wrapping_add(2));
    assert_eq!(cpu.platform.read_u16(0x8000 - 4), KCODE);
    assert_eq!(cpu.platform.read_u16(0x8000 - 2), 0x202);
    assert!(!cpu.state.get_flag(RFLAGS_IF));
}

#[test]
fn ring3_handler_frame_respects_supervisor_pages() {
    // int 0x82 through a DPL 3 gate into ring 3 code.
    let mut cpu = protected_guest(&[0xcd, 0x82]);
    write_idt_gate32(&mut cpu.platform, 0x82, UCODE, handler_for(0x82), 0xee);
    cpu.platform.load(handler_for(0x82) as u64, &[0xf4]);
    enable_paging(&mut cpu);
    // The page under the user stack pointer is supervisor only.
    cpu.platform.write_u32(PAGE_TABLE + 6 * 4, 0x6000 | 0x3);
    enter_user_mode(&mut cpu);

    assert_eq!(cpu.execute_one(), Ok(Info::Done));

    assert_eq!(cpu.state.rip(), handler_for(XCPT_PF) as u64);
    assert_eq!(cpu.state.control.cr2, USER_STACK as u64 - 12);
    let esp = (KERNEL_STACK - 24) as u64;
    // Present, write, user.
    assert_eq!(
        stack_dwords(&cpu, esp, 6),
        vec![7, CODE as u32, UCODE as u32, with_rf(0x2), USER_STACK, UDATA as u32]
    );
}
