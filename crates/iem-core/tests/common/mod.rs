#![allow(dead_code)]

use iem_core::state::{gpr, DescriptorTable, ATTR_P, CR0_PG, SYS_TSS_386_BUSY};
use iem_core::{CpuState, FlatBus, Segment, Vcpu};
use iem_mmu::MemoryBus;

pub const MEM_SIZE: usize = 0x10_0000;

pub const GDT_BASE: u64 = 0x500;
pub const GDT_LIMIT: u32 = 0x3f;
pub const TSS_A: u64 = 0x800;
pub const TSS_B: u64 = 0x900;
pub const IDT_BASE: u64 = 0x3000;
pub const CODE: u64 = 0x10000;
pub const HANDLERS: u32 = 0x11000;
pub const KERNEL_STACK: u32 = 0x9000;
pub const USER_STACK: u32 = 0x7000;
pub const PAGE_DIR: u64 = 0x20000;
pub const PAGE_TABLE: u64 = 0x21000;

pub const KCODE: u16 = 0x08;
pub const KDATA: u16 = 0x10;
pub const UCODE: u16 = 0x1b;
pub const UDATA: u16 = 0x23;
pub const TSS_A_SEL: u16 = 0x28;
pub const TSS_B_SEL: u16 = 0x30;

/// Encode a legacy segment descriptor.
pub fn seg_desc(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let base = base as u64;
    let limit = limit as u64;
    (limit & 0xffff)
        | ((base & 0xff_ffff) << 16)
        | ((access as u64) << 40)
        | (((limit >> 16) & 0xf) << 48)
        | (((flags as u64) & 0xf) << 52)
        | (((base >> 24) & 0xff) << 56)
}

pub fn write_gdt_entry(bus: &mut FlatBus, index: u64, raw: u64) {
    bus.write_u64(GDT_BASE + index * 8, raw);
}

pub fn write_idt_gate32(bus: &mut FlatBus, vector: u8, selector: u16, offset: u32, type_attr: u8) {
    let addr = IDT_BASE + vector as u64 * 8;
    bus.write_u16(addr, (offset & 0xffff) as u16);
    bus.write_u16(addr + 2, selector);
    bus.write_u8(addr + 4, 0);
    bus.write_u8(addr + 5, type_attr);
    bus.write_u16(addr + 6, (offset >> 16) as u16);
}

pub fn handler_for(vector: u8) -> u32 {
    HANDLERS + vector as u32 * 0x10
}

pub fn read_u32(cpu: &Vcpu<FlatBus>, addr: u64) -> u32 {
    u32::from_le_bytes(cpu.platform.slice(addr, 4).try_into().unwrap())
}

pub fn read_u8(cpu: &Vcpu<FlatBus>, addr: u64) -> u8 {
    cpu.platform.slice(addr, 1)[0]
}

/// Type byte of a GDT entry.
pub fn gdt_access_byte(cpu: &Vcpu<FlatBus>, sel: u16) -> u8 {
    read_u8(cpu, GDT_BASE + (sel & !7) as u64 + 5)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A 32-bit protected-mode guest at CPL 0.
///
/// The GDT holds ring 0 and ring 3 flat segments and two 32-bit TSSs; TSS A is
/// the current task. Every exception vector has an interrupt gate to its own
/// `HLT` handler, and vector 0x80 is reachable from ring 3.
pub fn protected_guest(code: &[u8]) -> Vcpu<FlatBus> {
    init_tracing();
    let mut bus = FlatBus::new(MEM_SIZE);
    write_gdt_entry(&mut bus, 1, seg_desc(0, 0xfffff, 0x9b, 0xc));
    write_gdt_entry(&mut bus, 2, seg_desc(0, 0xfffff, 0x93, 0xc));
    write_gdt_entry(&mut bus, 3, seg_desc(0, 0xfffff, 0xfb, 0xc));
    write_gdt_entry(&mut bus, 4, seg_desc(0, 0xfffff, 0xf3, 0xc));
    write_gdt_entry(&mut bus, 5, seg_desc(TSS_A as u32, 0x67, 0x8b, 0));
    write_gdt_entry(&mut bus, 6, seg_desc(TSS_B as u32, 0x67, 0x89, 0));

    // Ring 0 stack of TSS A.
    bus.write_u32(TSS_A + 4, KERNEL_STACK);
    bus.write_u32(TSS_A + 8, KDATA as u32);

    for vector in 0..32u8 {
        write_idt_gate32(&mut bus, vector, KCODE, handler_for(vector), 0x8e);
        bus.load(handler_for(vector) as u64, &[0xf4]);
    }
    write_idt_gate32(&mut bus, 0x80, KCODE, handler_for(0x80), 0xee);
    bus.load(handler_for(0x80) as u64, &[0xf4]);

    bus.load(CODE, code);

    let mut state = CpuState::new_protected_flat();
    state.gdtr = DescriptorTable {
        base: GDT_BASE,
        limit: GDT_LIMIT,
    };
    state.idtr = DescriptorTable {
        base: IDT_BASE,
        limit: 0x7ff,
    };
    state.tr = Segment {
        selector: TSS_A_SEL,
        base: TSS_A,
        limit: 0x67,
        attr: ATTR_P | SYS_TSS_386_BUSY,
    };
    state.set_rip(CODE);
    state.set_rflags(0x2);
    state.set_gpr_u64(gpr::RSP, 0x8000);
    Vcpu::new(state, bus)
}

/// Drop the guest to ring 3 on the user stack.
pub fn enter_user_mode(cpu: &mut Vcpu<FlatBus>) {
    let seg = &mut cpu.state.segments;
    seg.cs = Segment::flat(UCODE, true, 3);
    seg.ss = Segment::flat(UDATA, false, 3);
    seg.ds = Segment::flat(UDATA, false, 3);
    seg.es = Segment::flat(UDATA, false, 3);
    cpu.state.set_gpr_u64(gpr::RSP, USER_STACK as u64);
}

/// Turn on 32-bit paging with the low 256K identity mapped as user pages.
pub fn enable_paging(cpu: &mut Vcpu<FlatBus>) {
    cpu.platform.write_u32(PAGE_DIR, PAGE_TABLE as u32 | 0x7);
    for page in 0..0x40u64 {
        map_page(cpu, page << 12, page << 12);
    }
    cpu.state.control.cr0 |= CR0_PG;
    cpu.set_cr3(PAGE_DIR);
}

/// Point the PTE of `vaddr` (below 4M) at `paddr`.
pub fn map_page(cpu: &mut Vcpu<FlatBus>, vaddr: u64, paddr: u64) {
    let pte = PAGE_TABLE + (vaddr >> 12) * 4;
    cpu.platform.write_u32(pte, (paddr as u32 & !0xfff) | 0x7);
}
