//! Guest register and mode state.

use iced_x86::Register;
use iem_mmu::PagingContext;
pub use iem_mmu::{CR0_PG, CR0_WP, CR4_PAE, CR4_PCIDE, CR4_PGE, CR4_PSE, EFER_LMA, EFER_LME, EFER_NXE};

pub mod gpr {
    pub const RAX: usize = 0;
    pub const RCX: usize = 1;
    pub const RDX: usize = 2;
    pub const RBX: usize = 3;
    pub const RSP: usize = 4;
    pub const RBP: usize = 5;
    pub const RSI: usize = 6;
    pub const RDI: usize = 7;
}

pub const RFLAGS_CF: u64 = 1 << 0;
pub const RFLAGS_RESERVED1: u64 = 1 << 1;
pub const RFLAGS_TF: u64 = 1 << 8;
pub const RFLAGS_IF: u64 = 1 << 9;
pub const RFLAGS_DF: u64 = 1 << 10;
pub const RFLAGS_OF: u64 = 1 << 11;
pub const RFLAGS_IOPL_MASK: u64 = 3 << 12;
pub const RFLAGS_NT: u64 = 1 << 14;
pub const RFLAGS_RF: u64 = 1 << 16;
pub const RFLAGS_VM: u64 = 1 << 17;
pub const RFLAGS_AC: u64 = 1 << 18;
pub const RFLAGS_VIF: u64 = 1 << 19;
pub const RFLAGS_VIP: u64 = 1 << 20;
pub const RFLAGS_ID: u64 = 1 << 21;
/// Bits of EFLAGS that exist architecturally.
pub const RFLAGS_LIVE_MASK: u64 = 0x003f_7fd5;

pub const CR0_PE: u64 = 1 << 0;
pub const CR0_TS: u64 = 1 << 3;
pub const CR0_AM: u64 = 1 << 18;

pub const DR6_B_MASK: u64 = 0xf;
pub const DR6_BS: u64 = 1 << 14;
pub const DR6_INIT: u64 = 0xffff_0ff0;
pub const DR7_LE_ALL: u64 = 0x300;
pub const DR7_GD: u64 = 1 << 13;
pub const DR7_INIT: u64 = 0x400;

// Hidden segment attributes.
pub const ATTR_TYPE_MASK: u32 = 0xf;
pub const ATTR_S: u32 = 1 << 4;
pub const ATTR_DPL_SHIFT: u32 = 5;
pub const ATTR_DPL_MASK: u32 = 3 << ATTR_DPL_SHIFT;
pub const ATTR_P: u32 = 1 << 7;
pub const ATTR_AVL: u32 = 1 << 12;
pub const ATTR_L: u32 = 1 << 13;
pub const ATTR_D: u32 = 1 << 14;
pub const ATTR_G: u32 = 1 << 15;
pub const ATTR_UNUSABLE: u32 = 1 << 16;

// Code/data type bits.
pub const SEL_TYPE_ACCESSED: u32 = 1;
pub const SEL_TYPE_WRITE: u32 = 2;
pub const SEL_TYPE_READ: u32 = 2;
pub const SEL_TYPE_DOWN: u32 = 4;
pub const SEL_TYPE_CONF: u32 = 4;
pub const SEL_TYPE_CODE: u32 = 8;

// System descriptor types.
pub const SYS_TSS_286_AVAIL: u32 = 0x1;
pub const SYS_LDT: u32 = 0x2;
pub const SYS_TSS_286_BUSY: u32 = 0x3;
pub const SYS_CALL_GATE_286: u32 = 0x4;
pub const SYS_TASK_GATE: u32 = 0x5;
pub const SYS_INT_GATE_286: u32 = 0x6;
pub const SYS_TRAP_GATE_286: u32 = 0x7;
pub const SYS_TSS_386_AVAIL: u32 = 0x9;
pub const SYS_TSS_386_BUSY: u32 = 0xb;
pub const SYS_CALL_GATE_386: u32 = 0xc;
pub const SYS_INT_GATE_386: u32 = 0xe;
pub const SYS_TRAP_GATE_386: u32 = 0xf;
pub const SYS_TSS_BUSY_MASK: u32 = 0x2;

/// Attributes of a flat, present, accessed read/write data segment.
pub const ATTR_DATA_RW: u32 = ATTR_P | ATTR_S | SEL_TYPE_WRITE | SEL_TYPE_ACCESSED;
/// Attributes every segment register carries in virtual-8086 mode.
pub const ATTR_V86: u32 = ATTR_DATA_RW | (3 << ATTR_DPL_SHIFT);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    pub fn from_register(reg: Register) -> Option<Self> {
        match reg {
            Register::ES => Some(SegReg::Es),
            Register::CS => Some(SegReg::Cs),
            Register::SS => Some(SegReg::Ss),
            Register::DS => Some(SegReg::Ds),
            Register::FS => Some(SegReg::Fs),
            Register::GS => Some(SegReg::Gs),
            _ => None,
        }
    }
}

/// A segment register with its hidden descriptor cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub attr: u32,
}

impl Segment {
    pub fn real_mode(selector: u16) -> Self {
        Self {
            selector,
            base: (selector as u64) << 4,
            limit: 0xffff,
            attr: ATTR_DATA_RW,
        }
    }

    /// A flat 4G segment with the given DPL, code or data.
    pub fn flat(selector: u16, code: bool, dpl: u8) -> Self {
        let ty = if code {
            SEL_TYPE_CODE | SEL_TYPE_READ | SEL_TYPE_ACCESSED
        } else {
            SEL_TYPE_WRITE | SEL_TYPE_ACCESSED
        };
        Self {
            selector,
            base: 0,
            limit: 0xffff_ffff,
            attr: ATTR_P | ATTR_S | ATTR_D | ATTR_G | ((dpl as u32) << ATTR_DPL_SHIFT) | ty,
        }
    }

    /// A null selector load; the register becomes unusable.
    pub fn null(selector: u16) -> Self {
        Self {
            selector,
            base: 0,
            limit: 0,
            attr: ATTR_UNUSABLE,
        }
    }

    #[inline]
    pub fn typ(&self) -> u32 {
        self.attr & ATTR_TYPE_MASK
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        ((self.attr & ATTR_DPL_MASK) >> ATTR_DPL_SHIFT) as u8
    }

    #[inline]
    pub fn rpl(&self) -> u8 {
        (self.selector & 3) as u8
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.attr & ATTR_P != 0
    }

    #[inline]
    pub fn is_unusable(&self) -> bool {
        self.attr & ATTR_UNUSABLE != 0
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.attr & ATTR_S != 0 && self.typ() & SEL_TYPE_CODE != 0
    }

    #[inline]
    pub fn is_expand_down(&self) -> bool {
        !self.is_code() && self.typ() & SEL_TYPE_DOWN != 0
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        !self.is_code() && self.typ() & SEL_TYPE_WRITE != 0
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        !self.is_code() || self.typ() & SEL_TYPE_READ != 0
    }

    #[inline]
    pub fn is_big(&self) -> bool {
        self.attr & ATTR_D != 0
    }

    #[inline]
    pub fn is_long(&self) -> bool {
        self.attr & ATTR_L != 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segments {
    pub es: Segment,
    pub cs: Segment,
    pub ss: Segment,
    pub ds: Segment,
    pub fs: Segment,
    pub gs: Segment,
}

impl Segments {
    pub fn get(&self, seg: SegReg) -> &Segment {
        match seg {
            SegReg::Es => &self.es,
            SegReg::Cs => &self.cs,
            SegReg::Ss => &self.ss,
            SegReg::Ds => &self.ds,
            SegReg::Fs => &self.fs,
            SegReg::Gs => &self.gs,
        }
    }

    pub fn get_mut(&mut self, seg: SegReg) -> &mut Segment {
        match seg {
            SegReg::Es => &mut self.es,
            SegReg::Cs => &mut self.cs,
            SegReg::Ss => &mut self.ss,
            SegReg::Ds => &mut self.ds,
            SegReg::Fs => &mut self.fs,
            SegReg::Gs => &mut self.gs,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlRegs {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

/// Operating mode, derived from CR0/EFER/EFLAGS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Protected,
    Vm86,
    Long,
}

/// Data breakpoint hits observed during the current instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugHits {
    /// DR0..DR3 hits, in DR6 B0..B3 layout.
    pub drx: u8,
    /// A hit that raises #DB without reporting B bits in DR6.
    pub silent: bool,
}

impl DebugHits {
    #[inline]
    pub fn any(&self) -> bool {
        self.drx != 0 || self.silent
    }

    #[inline]
    pub fn clear(&mut self) {
        *self = DebugHits::default();
    }
}

#[derive(Debug, Clone)]
pub struct CpuState {
    gpr: [u64; 16],
    rip: u64,
    rflags: u64,
    pub segments: Segments,
    pub ldtr: Segment,
    pub tr: Segment,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub control: ControlRegs,
    pub dr: [u64; 8],
    pub dbg_hits: DebugHits,
    /// Interrupts are inhibited until the instruction at this RIP retires.
    pub inhibit_shadow: Option<u64>,
    pub nmi_blocked: bool,
    pub halted: bool,
    pub mode: CpuMode,
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new_real()
    }
}

impl CpuState {
    /// Reset state: real mode, CS:IP = F000:FFF0.
    pub fn new_real() -> Self {
        let mut segments = Segments {
            es: Segment::real_mode(0),
            cs: Segment::real_mode(0xf000),
            ss: Segment::real_mode(0),
            ds: Segment::real_mode(0),
            fs: Segment::real_mode(0),
            gs: Segment::real_mode(0),
        };
        segments.cs.base = 0xffff_0000;
        segments.cs.attr = ATTR_P | ATTR_S | SEL_TYPE_CODE | SEL_TYPE_READ | SEL_TYPE_ACCESSED;
        let mut dr = [0u64; 8];
        dr[6] = DR6_INIT;
        dr[7] = DR7_INIT;
        Self {
            gpr: [0; 16],
            rip: 0xfff0,
            rflags: RFLAGS_RESERVED1,
            segments,
            ldtr: Segment::null(0),
            tr: Segment {
                selector: 0,
                base: 0,
                limit: 0xffff,
                attr: ATTR_P | SYS_TSS_386_BUSY,
            },
            gdtr: DescriptorTable {
                base: 0,
                limit: 0xffff,
            },
            idtr: DescriptorTable {
                base: 0,
                limit: 0x3ff,
            },
            control: ControlRegs {
                cr0: 0x6000_0010,
                ..ControlRegs::default()
            },
            dr,
            dbg_hits: DebugHits::default(),
            inhibit_shadow: None,
            nmi_blocked: false,
            halted: false,
            mode: CpuMode::Real,
        }
    }

    /// Flat 32-bit protected mode at CPL 0 with paging off.
    pub fn new_protected_flat() -> Self {
        let mut s = Self::new_real();
        s.control.cr0 = CR0_PE | 0x10;
        s.segments.cs = Segment::flat(0x08, true, 0);
        for seg in [SegReg::Ds, SegReg::Es, SegReg::Ss, SegReg::Fs, SegReg::Gs] {
            *s.segments.get_mut(seg) = Segment::flat(0x10, false, 0);
        }
        s.rip = 0;
        s.update_mode();
        s
    }

    /// 64-bit mode at CPL 0. Paging structures are the caller's business.
    pub fn new_long() -> Self {
        let mut s = Self::new_protected_flat();
        s.control.cr0 |= CR0_PG;
        s.control.cr4 |= CR4_PAE;
        s.control.efer |= EFER_LME | EFER_LMA;
        s.segments.cs.attr = (s.segments.cs.attr & !ATTR_D) | ATTR_L;
        s.update_mode();
        s
    }

    /// Recompute the cached operating mode from the control registers.
    pub fn update_mode(&mut self) {
        self.mode = if self.control.cr0 & CR0_PE == 0 {
            CpuMode::Real
        } else if self.control.efer & EFER_LMA != 0 {
            CpuMode::Long
        } else if self.rflags & RFLAGS_VM != 0 {
            CpuMode::Vm86
        } else {
            CpuMode::Protected
        };
    }

    #[inline]
    pub fn cpl(&self) -> u8 {
        match self.mode {
            CpuMode::Real => 0,
            CpuMode::Vm86 => 3,
            CpuMode::Protected | CpuMode::Long => self.segments.ss.dpl(),
        }
    }

    /// Whether the current code segment executes 64-bit code.
    #[inline]
    pub fn is_64bit_code(&self) -> bool {
        self.mode == CpuMode::Long && self.segments.cs.is_long()
    }

    pub fn bitness(&self) -> u32 {
        if self.is_64bit_code() {
            64
        } else if self.mode != CpuMode::Real
            && self.mode != CpuMode::Vm86
            && self.segments.cs.is_big()
        {
            32
        } else {
            16
        }
    }

    #[inline]
    pub fn ip_mask(&self) -> u64 {
        mask_bits(self.bitness())
    }

    pub fn paging(&self) -> PagingContext {
        PagingContext {
            cr0: self.control.cr0,
            cr3: self.control.cr3,
            cr4: self.control.cr4,
            efer: self.control.efer,
        }
    }

    #[inline]
    pub fn rip(&self) -> u64 {
        self.rip
    }

    #[inline]
    pub fn set_rip(&mut self, rip: u64) {
        self.rip = rip;
    }

    pub fn advance_rip(&mut self, delta: u64) {
        self.rip = self.rip.wrapping_add(delta) & self.ip_mask();
    }

    #[inline]
    pub fn rflags(&self) -> u64 {
        self.rflags
    }

    pub fn set_rflags(&mut self, flags: u64) {
        self.rflags = (flags & RFLAGS_LIVE_MASK) | RFLAGS_RESERVED1;
        if matches!(self.mode, CpuMode::Protected | CpuMode::Vm86) {
            self.update_mode();
        }
    }

    #[inline]
    pub fn get_flag(&self, mask: u64) -> bool {
        self.rflags & mask != 0
    }

    pub fn set_flag(&mut self, mask: u64, val: bool) {
        if val {
            self.set_rflags(self.rflags | mask);
        } else {
            self.set_rflags(self.rflags & !mask);
        }
    }

    #[inline]
    pub fn iopl(&self) -> u8 {
        ((self.rflags & RFLAGS_IOPL_MASK) >> 12) as u8
    }

    #[inline]
    pub fn gpr_u64(&self, index: usize) -> u64 {
        self.gpr[index]
    }

    #[inline]
    pub fn set_gpr_u64(&mut self, index: usize, val: u64) {
        self.gpr[index] = val;
    }

    pub fn read_gpr32(&self, index: usize) -> u32 {
        self.gpr[index] as u32
    }

    pub fn write_gpr32(&mut self, index: usize, val: u32) {
        self.gpr[index] = val as u64;
    }

    pub fn write_gpr16(&mut self, index: usize, val: u16) {
        self.gpr[index] = (self.gpr[index] & !0xffff) | val as u64;
    }

    pub fn read_reg(&self, reg: Register) -> u64 {
        if let Some((idx, bits, high8)) = gpr_info(reg) {
            let full = self.gpr[idx];
            return match (bits, high8) {
                (8, false) => full & 0xff,
                (8, true) => (full >> 8) & 0xff,
                (16, _) => full & 0xffff,
                (32, _) => full & 0xffff_ffff,
                _ => full,
            };
        }
        match reg {
            Register::RIP | Register::EIP => self.rip,
            _ => SegReg::from_register(reg)
                .map(|s| self.segments.get(s).selector as u64)
                .unwrap_or(0),
        }
    }

    pub fn write_reg(&mut self, reg: Register, val: u64) {
        if let Some((idx, bits, high8)) = gpr_info(reg) {
            let cur = self.gpr[idx];
            self.gpr[idx] = match (bits, high8) {
                (64, _) => val,
                // 32-bit writes zero the upper half.
                (32, _) => val & 0xffff_ffff,
                (16, _) => (cur & !0xffff) | (val & 0xffff),
                (8, false) => (cur & !0xff) | (val & 0xff),
                (8, true) => (cur & !0xff00) | ((val & 0xff) << 8),
                _ => cur,
            };
        }
    }

    /// Width of the stack pointer in bits, from the SS descriptor.
    pub fn stack_bits(&self) -> u32 {
        if self.is_64bit_code() {
            64
        } else if self.mode != CpuMode::Real && self.segments.ss.is_big() {
            32
        } else {
            16
        }
    }

    pub fn stack_ptr(&self) -> u64 {
        self.gpr[gpr::RSP] & mask_bits(self.stack_bits())
    }

    pub fn set_stack_ptr(&mut self, val: u64) {
        match self.stack_bits() {
            64 => self.gpr[gpr::RSP] = val,
            32 => self.gpr[gpr::RSP] = val & 0xffff_ffff,
            _ => self.write_gpr16(gpr::RSP, val as u16),
        }
    }
}

pub fn mask_bits(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn gpr_info(reg: Register) -> Option<(usize, u32, bool)> {
    use Register::*;
    let (idx, bits, high8) = match reg {
        AL => (0, 8, false),
        CL => (1, 8, false),
        DL => (2, 8, false),
        BL => (3, 8, false),
        AH => (0, 8, true),
        CH => (1, 8, true),
        DH => (2, 8, true),
        BH => (3, 8, true),
        SPL => (4, 8, false),
        BPL => (5, 8, false),
        SIL => (6, 8, false),
        DIL => (7, 8, false),
        R8L => (8, 8, false),
        R9L => (9, 8, false),
        R10L => (10, 8, false),
        R11L => (11, 8, false),
        R12L => (12, 8, false),
        R13L => (13, 8, false),
        R14L => (14, 8, false),
        R15L => (15, 8, false),

        AX => (0, 16, false),
        CX => (1, 16, false),
        DX => (2, 16, false),
        BX => (3, 16, false),
        SP => (4, 16, false),
        BP => (5, 16, false),
        SI => (6, 16, false),
        DI => (7, 16, false),
        R8W => (8, 16, false),
        R9W => (9, 16, false),
        R10W => (10, 16, false),
        R11W => (11, 16, false),
        R12W => (12, 16, false),
        R13W => (13, 16, false),
        R14W => (14, 16, false),
        R15W => (15, 16, false),

        EAX => (0, 32, false),
        ECX => (1, 32, false),
        EDX => (2, 32, false),
        EBX => (3, 32, false),
        ESP => (4, 32, false),
        EBP => (5, 32, false),
        ESI => (6, 32, false),
        EDI => (7, 32, false),
        R8D => (8, 32, false),
        R9D => (9, 32, false),
        R10D => (10, 32, false),
        R11D => (11, 32, false),
        R12D => (12, 32, false),
        R13D => (13, 32, false),
        R14D => (14, 32, false),
        R15D => (15, 32, false),

        RAX => (0, 64, false),
        RCX => (1, 64, false),
        RDX => (2, 64, false),
        RBX => (3, 64, false),
        RSP => (4, 64, false),
        RBP => (5, 64, false),
        RSI => (6, 64, false),
        RDI => (7, 64, false),
        R8 => (8, 64, false),
        R9 => (9, 64, false),
        R10 => (10, 64, false),
        R11 => (11, 64, false),
        R12 => (12, 64, false),
        R13 => (13, 64, false),
        R14 => (14, 64, false),
        R15 => (15, 64, false),

        _ => return Option::None,
    };
    Some((idx, bits, high8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_byte_registers_alias_low_word() {
        let mut s = CpuState::new_real();
        s.write_reg(Register::EAX, 0x1234_5678);
        s.write_reg(Register::AH, 0xab);
        assert_eq!(s.read_reg(Register::AX), 0xab78);
        assert_eq!(s.read_reg(Register::AL), 0x78);
    }

    #[test]
    fn writing_32bit_register_clears_upper_half() {
        let mut s = CpuState::new_long();
        s.write_reg(Register::RAX, u64::MAX);
        s.write_reg(Register::EAX, 1);
        assert_eq!(s.read_reg(Register::RAX), 1);
    }

    #[test]
    fn mode_follows_control_registers() {
        let mut s = CpuState::new_real();
        assert_eq!(s.mode, CpuMode::Real);
        assert_eq!(s.cpl(), 0);

        s = CpuState::new_protected_flat();
        assert_eq!(s.mode, CpuMode::Protected);
        assert_eq!(s.bitness(), 32);

        s.set_rflags(s.rflags() | RFLAGS_VM);
        assert_eq!(s.mode, CpuMode::Vm86);
        assert_eq!(s.cpl(), 3);

        let s = CpuState::new_long();
        assert!(s.is_64bit_code());
        assert_eq!(s.bitness(), 64);
    }

    #[test]
    fn sixteen_bit_stack_pointer_preserves_upper_bits() {
        let mut s = CpuState::new_real();
        s.set_gpr_u64(gpr::RSP, 0xdead_0000);
        s.set_stack_ptr(0x1_fffe);
        assert_eq!(s.gpr_u64(gpr::RSP), 0xdead_fffe);
        assert_eq!(s.stack_ptr(), 0xfffe);
    }
}
