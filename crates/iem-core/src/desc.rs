//! Segment and gate descriptors, descriptor-table access and segment register
//! loads.

use tracing::debug;

use crate::platform::Platform;
use crate::state::{
    CpuMode, SegReg, Segment, ATTR_D, ATTR_DPL_SHIFT, ATTR_G, ATTR_L, ATTR_P, ATTR_S,
    ATTR_TYPE_MASK, SEL_TYPE_ACCESSED, SEL_TYPE_CODE, SEL_TYPE_CONF, SEL_TYPE_READ,
    SEL_TYPE_WRITE,
};
use crate::status::{Exit, IemResult};
use crate::vcpu::Vcpu;
use crate::xcpt::{XCPT_GP, XCPT_NP, XCPT_SS};

/// Table indicator bit of a selector.
pub const SEL_TI_LDT: u16 = 0x4;
pub const SEL_RPL_MASK: u16 = 0x3;

/// A raw 8-byte descriptor, plus the upper half of 16-byte system descriptors
/// in long mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub raw: u64,
    pub high: u64,
}

impl Descriptor {
    pub fn new(raw: u64) -> Self {
        Self { raw, high: 0 }
    }

    /// Hidden-register attribute layout: type, S, DPL, P, AVL, L, D/B, G.
    #[inline]
    pub fn attr(&self) -> u32 {
        (((self.raw >> 40) & 0xff) | (((self.raw >> 52) & 0xf) << 12)) as u32
    }

    #[inline]
    pub fn typ(&self) -> u32 {
        self.attr() & ATTR_TYPE_MASK
    }

    /// S=0: system segment or gate.
    #[inline]
    pub fn is_system(&self) -> bool {
        self.attr() & ATTR_S == 0
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        !self.is_system() && self.typ() & SEL_TYPE_CODE != 0
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        ((self.attr() >> ATTR_DPL_SHIFT) & 3) as u8
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.attr() & ATTR_P != 0
    }

    #[inline]
    pub fn is_long(&self) -> bool {
        self.attr() & ATTR_L != 0
    }

    #[inline]
    pub fn is_big(&self) -> bool {
        self.attr() & ATTR_D != 0
    }

    /// The 20-bit limit field as stored.
    #[inline]
    pub fn raw_limit(&self) -> u32 {
        ((self.raw & 0xffff) | (((self.raw >> 48) & 0xf) << 16)) as u32
    }

    /// Byte-granular limit.
    pub fn limit(&self) -> u32 {
        let raw = self.raw_limit();
        if self.attr() & ATTR_G != 0 {
            (raw << 12) | 0xfff
        } else {
            raw
        }
    }

    pub fn base(&self) -> u64 {
        let low = ((self.raw >> 16) & 0xff_ffff) | (((self.raw >> 56) & 0xff) << 24);
        if self.is_system() {
            low | ((self.high & 0xffff_ffff) << 32)
        } else {
            low
        }
    }

    /// Target selector of a gate.
    #[inline]
    pub fn gate_selector(&self) -> u16 {
        (self.raw >> 16) as u16
    }

    /// Target offset of a gate; 64 bits wide for long-mode gates.
    pub fn gate_offset(&self) -> u64 {
        (self.raw & 0xffff) | (((self.raw >> 48) & 0xffff) << 16) | ((self.high & 0xffff_ffff) << 32)
    }

    #[inline]
    pub fn gate_ist(&self) -> u8 {
        ((self.raw >> 32) & 7) as u8
    }

    /// Hidden segment state for a selector loaded with this descriptor.
    pub fn to_segment(&self, selector: u16) -> Segment {
        Segment {
            selector,
            base: self.base(),
            limit: self.limit(),
            attr: self.attr(),
        }
    }

    #[inline]
    pub(crate) fn set_accessed(&mut self) {
        self.raw |= (SEL_TYPE_ACCESSED as u64) << 40;
    }
}

impl<P: Platform> Vcpu<P> {
    /// Read the descriptor `sel` refers to, raising `vector` with `err` when the
    /// selector lies outside its table.
    pub(crate) fn fetch_sel_desc_with_err(
        &mut self,
        sel: u16,
        vector: u8,
        err: u16,
    ) -> IemResult<Descriptor> {
        let (base, limit) = if sel & SEL_TI_LDT != 0 {
            let ldtr = self.state.ldtr;
            if !ldtr.is_present() || ldtr.is_unusable() || (sel | 7) as u32 > ldtr.limit {
                debug!(sel, ldt_limit = ldtr.limit, "selector beyond the LDT");
                return Err(self.raise_cpu_xcpt_err(vector, err));
            }
            (ldtr.base, ldtr.limit)
        } else {
            let gdtr = self.state.gdtr;
            if (sel | 7) as u32 > gdtr.limit {
                debug!(sel, gdt_limit = gdtr.limit, "selector beyond the GDT");
                return Err(self.raise_cpu_xcpt_err(vector, err));
            }
            (gdtr.base, gdtr.limit)
        };

        let mut desc = Descriptor::new(self.read_sys_u64(base + (sel & !7) as u64)?);
        if self.state.mode == CpuMode::Long && desc.is_system() {
            if (sel | 7) as u32 + 8 > limit {
                return Err(self.raise_cpu_xcpt_err(vector, err));
            }
            desc.high = self.read_sys_u64(base + (sel & !7) as u64 + 8)?;
        }
        Ok(desc)
    }

    /// Read a descriptor; out-of-table selectors fault with the selector as error code.
    pub(crate) fn fetch_sel_desc(&mut self, sel: u16, vector: u8) -> IemResult<Descriptor> {
        self.fetch_sel_desc_with_err(sel, vector, sel & !SEL_RPL_MASK)
    }

    /// Set the accessed bit of the descriptor `sel` refers to.
    pub(crate) fn mark_sel_desc_accessed(&mut self, sel: u16) -> IemResult<()> {
        let table = if sel & SEL_TI_LDT != 0 {
            self.state.ldtr.base
        } else {
            self.state.gdtr.base
        };
        // The type byte is byte 5 of the descriptor.
        let addr = table + (sel & !7) as u64 + 5;
        let token = self.mem_map(None, addr, 1, crate::mem::Access::SYS_RW, crate::mem::Align::NONE)?;
        self.mapped_mut(token)?[0] |= SEL_TYPE_ACCESSED as u8;
        self.mem_commit(token)
    }

    /// Load a data segment register (DS, ES, FS, GS) from a selector, as
    /// `MOV Sreg` does in protected mode.
    pub(crate) fn load_data_sreg(&mut self, sreg: SegReg, sel: u16) -> IemResult<()> {
        if matches!(self.state.mode, CpuMode::Real | CpuMode::Vm86) {
            self.load_sreg_real(sreg, sel);
            return Ok(());
        }
        if sel & !SEL_RPL_MASK == 0 {
            *self.state.segments.get_mut(sreg) = Segment::null(sel);
            return Ok(());
        }

        let mut desc = self.fetch_sel_desc(sel, XCPT_GP)?;
        let err = sel & !SEL_RPL_MASK;
        if desc.is_system() {
            return Err(self.raise_gp(err));
        }
        let ty = desc.typ();
        if ty & SEL_TYPE_CODE != 0 && ty & SEL_TYPE_READ == 0 {
            return Err(self.raise_gp(err));
        }
        let conforming_code = ty & (SEL_TYPE_CODE | SEL_TYPE_CONF) == (SEL_TYPE_CODE | SEL_TYPE_CONF);
        if !conforming_code {
            let rpl = (sel & SEL_RPL_MASK) as u8;
            if rpl > desc.dpl() || self.state.cpl() > desc.dpl() {
                return Err(self.raise_gp(err));
            }
        }
        if !desc.is_present() {
            return Err(self.raise_cpu_xcpt_err(XCPT_NP, err));
        }
        if ty & SEL_TYPE_ACCESSED == 0 {
            self.mark_sel_desc_accessed(sel)?;
            desc.set_accessed();
        }
        *self.state.segments.get_mut(sreg) = desc.to_segment(sel);
        Ok(())
    }

    /// Load SS from a selector (`MOV SS`, `POP SS`).
    pub(crate) fn load_ss(&mut self, sel: u16) -> IemResult<()> {
        if matches!(self.state.mode, CpuMode::Real | CpuMode::Vm86) {
            self.load_sreg_real(SegReg::Ss, sel);
            return Ok(());
        }
        let cpl = self.state.cpl();
        if sel & !SEL_RPL_MASK == 0 {
            // 64-bit code may run with a null SS below ring 3.
            if self.state.is_64bit_code() && cpl != 3 && (sel & SEL_RPL_MASK) as u8 == cpl {
                let mut ss = Segment::null(sel);
                ss.attr |= (cpl as u32) << ATTR_DPL_SHIFT;
                self.state.segments.ss = ss;
                return Ok(());
            }
            return Err(self.raise_gp(0));
        }

        let mut desc = self.fetch_sel_desc(sel, XCPT_GP)?;
        let err = sel & !SEL_RPL_MASK;
        let ty = desc.typ();
        if desc.is_system() || ty & SEL_TYPE_CODE != 0 || ty & SEL_TYPE_WRITE == 0 {
            return Err(self.raise_gp(err));
        }
        if (sel & SEL_RPL_MASK) as u8 != cpl || desc.dpl() != cpl {
            return Err(self.raise_gp(err));
        }
        if !desc.is_present() {
            return Err(self.raise_cpu_xcpt_err(XCPT_SS, err));
        }
        if ty & SEL_TYPE_ACCESSED == 0 {
            self.mark_sel_desc_accessed(sel)?;
            desc.set_accessed();
        }
        self.state.segments.ss = desc.to_segment(sel);
        Ok(())
    }

    /// Real and V86 mode loads only change selector and base.
    pub(crate) fn load_sreg_real(&mut self, sreg: SegReg, sel: u16) {
        let vm86 = self.state.mode == CpuMode::Vm86;
        let s = self.state.segments.get_mut(sreg);
        s.selector = sel;
        s.base = (sel as u64) << 4;
        if vm86 {
            s.limit = 0xffff;
            s.attr = crate::state::ATTR_V86;
        }
    }

    /// Make `sel` the new CS after a far transfer validated the descriptor.
    pub(crate) fn commit_cs(&mut self, sel: u16, mut desc: Descriptor, cpl: u8) -> IemResult<()> {
        if desc.typ() & SEL_TYPE_ACCESSED == 0 {
            self.mark_sel_desc_accessed(sel)?;
            desc.set_accessed();
        }
        let sel = (sel & !SEL_RPL_MASK) | cpl as u16;
        self.state.segments.cs = desc.to_segment(sel);
        Ok(())
    }
}

/// Whether a selector addresses the null descriptor.
#[inline]
pub fn is_null_selector(sel: u16) -> bool {
    sel & !SEL_RPL_MASK == 0
}
