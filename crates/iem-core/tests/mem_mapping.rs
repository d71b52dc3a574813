mod common;

use common::*;
use iem_core::state::{gpr, CR0_AM, RFLAGS_AC};
use iem_core::xcpt::{XCPT_AC, XCPT_GP, XCPT_PF};
use iem_core::{Access, Align, Exit, Info, PhysPageKind, SegReg};
use iem_mmu::MemoryBus;
use proptest::prelude::*;

#[test]
fn failed_write_back_leaves_no_mapping_open() {
    // mov [0x2ffe], eax straddles two pages and goes through a bounce buffer.
    let mut cpu = protected_guest(&[0xa3, 0xfe, 0x2f, 0x00, 0x00]);
    cpu.platform.fail_writes = true;

    assert_eq!(cpu.execute_one(), Err(Exit::PhysAccess(0x2ffe)));

    assert_eq!(cpu.mappings().active(), 0);
    assert_eq!(cpu.mappings().pending(), 0);
    assert_eq!(cpu.state.rip(), CODE);
    assert_eq!(cpu.stats.instructions, 0);
}

#[test]
fn fault_on_the_second_page_opens_nothing() {
    // mov [0x3fffe], eax: the second page is not present.
    let mut cpu = protected_guest(&[0xa3, 0xfe, 0xff, 0x03, 0x00]);
    enable_paging(&mut cpu);
    cpu.state.set_gpr_u64(gpr::RAX, 0xdead_beef);

    assert_eq!(cpu.execute_one(), Ok(Info::Done));

    assert_eq!(cpu.state.rip(), handler_for(XCPT_PF) as u64);
    assert_eq!(cpu.state.control.cr2, 0x40000);
    // Write to a not-present page from ring 0.
    assert_eq!(read_u32(&cpu, 0x8000 - 16), 2);
    assert_eq!(cpu.platform.slice(0x3fffe, 2), &[0, 0]);
    assert_eq!(cpu.mappings().active(), 0);
}

#[test]
fn bounce_buffer_splits_across_physical_pages() {
    let mut cpu = protected_guest(&[]);
    enable_paging(&mut cpu);
    map_page(&mut cpu, 0x30000, 0x50000);
    map_page(&mut cpu, 0x31000, 0x38000);

    let pattern = [1u8, 2, 3, 4, 5, 6, 7, 8];
    let token = cpu
        .mem_map(Some(SegReg::Ds), 0x30ffc, 8, Access::DATA_W, Align::NONE)
        .unwrap();
    assert_eq!(cpu.mappings().active(), 1);
    cpu.mapped_mut(token).unwrap().copy_from_slice(&pattern);
    cpu.mem_commit(token).unwrap();
    assert_eq!(cpu.mappings().active(), 0);

    assert_eq!(cpu.platform.slice(0x50ffc, 4), &pattern[..4]);
    assert_eq!(cpu.platform.slice(0x38000, 4), &pattern[4..]);
    assert_eq!(
        cpu.fetch_data_u64(SegReg::Ds, 0x30ffc).unwrap(),
        u64::from_le_bytes(pattern)
    );
}

#[test]
fn rollback_discards_bounced_bytes() {
    let mut cpu = protected_guest(&[]);
    cpu.platform.load(0x4ffe, &[0xaa; 4]);

    let token = cpu
        .mem_map(Some(SegReg::Ds), 0x4ffe, 4, Access::DATA_RW, Align::NONE)
        .unwrap();
    assert_eq!(cpu.mapped_mut(token).unwrap(), &[0xaa; 4]);
    cpu.mapped_mut(token).unwrap().fill(0x55);
    cpu.mem_rollback(token).unwrap();

    assert_eq!(cpu.platform.slice(0x4ffe, 4), &[0xaa; 4]);
    assert_eq!(cpu.mappings().active(), 0);
    // The token is dead once rolled back.
    assert!(matches!(cpu.mem_commit(token), Err(Exit::InvalidToken(_))));
}

#[test]
fn mmio_writes_go_through_the_platform() {
    // mov [0xa0000], eax
    let mut cpu = protected_guest(&[0xa3, 0x00, 0x00, 0x0a, 0x00]);
    cpu.platform.set_page_kind(0xa0000, PhysPageKind::CatchAll);
    cpu.state.set_gpr_u64(gpr::RAX, 0x1234_5678);

    assert_eq!(cpu.execute_one(), Ok(Info::Done));

    assert_eq!(
        cpu.platform.mmio_writes,
        vec![(0xa0000, vec![0x78, 0x56, 0x34, 0x12])]
    );
}

#[test]
fn split_write_reports_the_stronger_half_status() {
    // mov [0x9fffe], eax: RAM below 0xa0000, MMIO above.
    let mut cpu = protected_guest(&[0xa3, 0xfe, 0xff, 0x09, 0x00]);
    cpu.platform.set_page_kind(0xa0000, PhysPageKind::CatchAll);
    cpu.platform.mmio_write_info = Some(Info::Reschedule);
    cpu.state.set_gpr_u64(gpr::RAX, 0x1234_5678);

    assert_eq!(cpu.execute_one(), Ok(Info::Reschedule));

    assert_eq!(cpu.platform.slice(0x9fffe, 2), &[0x78, 0x56]);
    assert_eq!(cpu.platform.mmio_writes, vec![(0xa0000, vec![0x34, 0x12])]);
    assert_eq!(cpu.state.rip(), CODE + 5);
    assert_eq!(cpu.mappings().active(), 0);
}

#[test]
fn physical_flush_sends_a_cached_page_through_the_platform() {
    let mut cpu = protected_guest(&[]);
    let token = cpu
        .mem_map(Some(SegReg::Ds), 0xa0010, 4, Access::DATA_W, Align::NONE)
        .unwrap();
    cpu.mapped_mut(token).unwrap().copy_from_slice(&[1, 2, 3, 4]);
    cpu.mem_commit(token).unwrap();
    assert!(cpu.platform.mmio_writes.is_empty());
    let loads = cpu.tlb.data.stats().loads;

    cpu.platform.set_page_kind(0xa0000, PhysPageKind::CatchAll);
    cpu.invalidate_tlb_physical();

    let token = cpu
        .mem_map(Some(SegReg::Ds), 0xa0010, 4, Access::DATA_W, Align::NONE)
        .unwrap();
    cpu.mapped_mut(token).unwrap().copy_from_slice(&[5, 6, 7, 8]);
    cpu.mem_commit(token).unwrap();

    assert_eq!(cpu.platform.mmio_writes, vec![(0xa0010, vec![5, 6, 7, 8])]);
    // The linear translation was kept; only its physical side was refreshed.
    assert_eq!(cpu.tlb.data.stats().loads, loads);
    assert_eq!(cpu.tlb.data.stats().phys_flushes, 1);
}

#[test]
fn long_access_faulting_on_the_second_page_reports_an_address_in_it() {
    let mut cpu = protected_guest(&[]);
    enable_paging(&mut cpu);

    // 16 bytes on the mapped page, 84 on the missing one.
    let res = cpu.mem_map(Some(SegReg::Ds), 0x3fff0, 100, Access::DATA_W, Align::NONE);

    assert_eq!(res, Err(Exit::RaisedXcpt));
    assert_eq!(cpu.state.rip(), handler_for(XCPT_PF) as u64);
    assert_eq!(cpu.state.control.cr2, 0x40053);
    assert_eq!(cpu.mappings().active(), 0);
}

#[test]
fn long_access_faulting_on_the_first_page_stays_in_it() {
    let mut cpu = protected_guest(&[]);
    enable_paging(&mut cpu);
    cpu.platform.write_u32(PAGE_TABLE + 0x3e * 4, 0);

    // 96 bytes on the missing page, 16 on the next one.
    let res = cpu.mem_map(Some(SegReg::Ds), 0x3efa0, 112, Access::DATA_R, Align::NONE);

    assert_eq!(res, Err(Exit::RaisedXcpt));
    assert_eq!(cpu.state.control.cr2, 0x3efff);
}

/// Ring 3 with CR0.AM and EFLAGS.AC set.
fn user_with_alignment_checks(cpu: &mut iem_core::Vcpu<iem_core::FlatBus>) {
    enter_user_mode(cpu);
    cpu.state.control.cr0 |= CR0_AM;
    cpu.state.set_rflags(0x2 | RFLAGS_AC);
}

#[test]
fn misaligned_load_raises_ac_only_under_alignment_checking() {
    // mov eax, [0x5001]
    let mut cpu = protected_guest(&[0xa1, 0x01, 0x50, 0x00, 0x00]);
    user_with_alignment_checks(&mut cpu);

    assert_eq!(cpu.execute_one(), Ok(Info::Done));

    assert_eq!(cpu.state.rip(), handler_for(XCPT_AC) as u64);
    let esp = (KERNEL_STACK - 24) as u64;
    assert_eq!(cpu.state.gpr_u64(gpr::RSP), esp);
    assert_eq!(read_u32(&cpu, esp), 0);
    assert_eq!(read_u32(&cpu, esp + 4), CODE as u32);

    // Same load with EFLAGS.AC clear.
    let mut cpu = protected_guest(&[0xa1, 0x01, 0x50, 0x00, 0x00]);
    enter_user_mode(&mut cpu);
    cpu.state.control.cr0 |= CR0_AM;
    cpu.platform.load(0x5001, &[0x11, 0x22, 0x33, 0x44]);

    assert_eq!(cpu.execute_one(), Ok(Info::Done));
    assert_eq!(cpu.state.gpr_u64(gpr::RAX), 0x4433_2211);
}

#[test]
fn gp_alignment_faults_even_without_alignment_checking() {
    let mut cpu = protected_guest(&[]);

    let res = cpu.mem_map(Some(SegReg::Ds), 0x5008, 16, Access::DATA_R, Align::gp(15));

    assert_eq!(res, Err(Exit::RaisedXcpt));
    assert_eq!(cpu.state.rip(), handler_for(XCPT_GP) as u64);
    assert_eq!(read_u32(&cpu, 0x8000 - 16), 0);

    let mut cpu = protected_guest(&[]);
    let token = cpu
        .mem_map(Some(SegReg::Ds), 0x5010, 16, Access::DATA_R, Align::gp(15))
        .unwrap();
    cpu.mem_commit(token).unwrap();
}

#[test]
fn gp_or_ac_alignment_picks_ac_for_dword_misalignment() {
    let mut cpu = protected_guest(&[]);
    user_with_alignment_checks(&mut cpu);
    let res = cpu.mem_map(Some(SegReg::Ds), 0x5002, 16, Access::DATA_R, Align::gp_or_ac(15));
    assert_eq!(res, Err(Exit::RaisedXcpt));
    assert_eq!(cpu.state.rip(), handler_for(XCPT_AC) as u64);

    // Dword aligned but not 16-byte aligned.
    let mut cpu = protected_guest(&[]);
    user_with_alignment_checks(&mut cpu);
    let res = cpu.mem_map(Some(SegReg::Ds), 0x5004, 16, Access::DATA_R, Align::gp_or_ac(15));
    assert_eq!(res, Err(Exit::RaisedXcpt));
    assert_eq!(cpu.state.rip(), handler_for(XCPT_GP) as u64);

    // Without alignment checking every misalignment is #GP(0).
    let mut cpu = protected_guest(&[]);
    let res = cpu.mem_map(Some(SegReg::Ds), 0x5002, 16, Access::DATA_R, Align::gp_or_ac(15));
    assert_eq!(res, Err(Exit::RaisedXcpt));
    assert_eq!(cpu.state.rip(), handler_for(XCPT_GP) as u64);
}

#[test]
fn postponed_write_is_replayed_before_the_next_instruction() {
    // mov [0x3ffe], eax ; nop
    let mut cpu = protected_guest(&[0xa3, 0xfe, 0x3f, 0x00, 0x00, 0x90]);
    cpu.config.postpone_failed_writes = true;
    cpu.platform.defer_writes = 1;
    cpu.state.set_gpr_u64(gpr::RAX, 0x1122_3344);

    assert_eq!(cpu.execute_one(), Ok(Info::PendingWrite));
    assert_eq!(cpu.state.rip(), CODE + 5);
    assert_eq!(cpu.mappings().pending(), 1);
    assert_eq!(cpu.platform.slice(0x3ffe, 4), &[0, 0, 0, 0]);

    assert_eq!(cpu.execute_one(), Ok(Info::Done));
    assert_eq!(cpu.platform.slice(0x3ffe, 4), &[0x44, 0x33, 0x22, 0x11]);
    assert_eq!(cpu.stats.pending_write_replays, 1);
    assert_eq!(cpu.mappings().pending(), 0);
    assert_eq!(cpu.state.rip(), CODE + 6);
}

#[test]
fn postponed_write_blocks_the_batch() {
    let mut cpu = protected_guest(&[0xa3, 0xfe, 0x3f, 0x00, 0x00, 0x90, 0x90]);
    cpu.config.postpone_failed_writes = true;
    cpu.platform.defer_writes = 1;

    let (res, n) = cpu.execute_many(8);
    assert_eq!(res, Ok(Info::PendingWrite));
    assert_eq!(n, 1);

    let (res, n) = cpu.execute_many(2);
    assert_eq!(res, Ok(Info::Done));
    assert_eq!(n, 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn stores_never_leave_mappings_open(
        addr in 0x2000u32..0x6000,
        dword in any::<bool>(),
        fail in any::<bool>(),
        val in any::<u32>(),
    ) {
        // mov [addr], al / mov [addr], eax
        let mut code = vec![if dword { 0xa3 } else { 0xa2 }];
        code.extend_from_slice(&addr.to_le_bytes());
        let mut cpu = protected_guest(&code);
        cpu.platform.fail_writes = fail;
        cpu.state.set_gpr_u64(gpr::RAX, val as u64);

        let res = cpu.execute_one();

        prop_assert_eq!(cpu.mappings().active(), 0);
        if res.is_ok() {
            let len = if dword { 4 } else { 1 };
            prop_assert_eq!(cpu.platform.slice(addr as u64, len), &val.to_le_bytes()[..len]);
            prop_assert_eq!(cpu.state.rip(), CODE + 5);
        } else {
            prop_assert_eq!(res, Err(Exit::PhysAccess(addr as u64)));
            prop_assert_eq!(cpu.state.rip(), CODE);
        }
    }
}
