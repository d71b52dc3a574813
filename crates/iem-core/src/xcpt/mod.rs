//! Exception and interrupt delivery.
//!
//! Everything funnels through [`Vcpu::raise_xcpt_or_int`]: it classifies the
//! event against the one currently being delivered (escalating to #DF, triple
//! fault or a CPU hang), then hands off to the real, protected or long mode
//! delivery path. Faults raised while delivering re-enter the same function,
//! which is the only recursion in the engine.

mod iret;
mod long;
mod protected;
mod real;
mod task;

pub use task::TaskSwitch;

use bitflags::bitflags;
use tracing::debug;

use crate::platform::Platform;
use crate::state::{CpuMode, DR6_B_MASK, DR7_GD, RFLAGS_VM};
use crate::status::{Exit, IemResult};
use crate::vcpu::Vcpu;

pub const XCPT_DE: u8 = 0;
pub const XCPT_DB: u8 = 1;
pub const XCPT_NMI: u8 = 2;
pub const XCPT_BP: u8 = 3;
pub const XCPT_OF: u8 = 4;
pub const XCPT_BR: u8 = 5;
pub const XCPT_UD: u8 = 6;
pub const XCPT_NM: u8 = 7;
pub const XCPT_DF: u8 = 8;
pub const XCPT_TS: u8 = 10;
pub const XCPT_NP: u8 = 11;
pub const XCPT_SS: u8 = 12;
pub const XCPT_GP: u8 = 13;
pub const XCPT_PF: u8 = 14;
pub const XCPT_MF: u8 = 16;
pub const XCPT_AC: u8 = 17;
pub const XCPT_MC: u8 = 18;
pub const XCPT_XF: u8 = 19;
pub const XCPT_SX: u8 = 30;

/// Error code bit: the event was caused by something external to the program.
pub const ERR_EXT: u16 = 1 << 0;
/// Error code bit: the selector index refers to an IDT entry.
pub const ERR_IDT: u16 = 1 << 1;

/// Nested deliveries deeper than this are not emulated.
const MAX_XCPT_DEPTH: u8 = 4;

bitflags! {
    /// What kind of event is being delivered and what comes with it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct XcptFlags: u32 {
        const CPU_XCPT = 1 << 0;
        const EXT_INT = 1 << 1;
        const SOFT_INT = 1 << 2;
        /// An error code is pushed.
        const ERR = 1 << 8;
        /// CR2 is loaded with the fault address.
        const CR2 = 1 << 9;
        /// Raised by INT3.
        const BP_INSTR = 1 << 10;
        /// Raised by INT1 (ICEBP).
        const ICEBP_INSTR = 1 << 11;
        /// Raised by INTO.
        const OF_INSTR = 1 << 12;
        /// #DB for an instruction breakpoint; RF is not set in the pushed image.
        const DRX_INSTR_BP = 1 << 13;
    }
}

/// Error code identifying an IDT entry.
#[inline]
pub(crate) fn idt_error_code(vector: u8) -> u16 {
    ERR_IDT | ((vector as u16) << 3)
}

/// Severity class of an exception vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XcptClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

pub fn xcpt_class(vector: u8) -> XcptClass {
    match vector {
        XCPT_DE | XCPT_TS | XCPT_NP | XCPT_SS | XCPT_GP | XCPT_SX => XcptClass::Contributory,
        XCPT_PF => XcptClass::PageFault,
        XCPT_DF => XcptClass::DoubleFault,
        _ => XcptClass::Benign,
    }
}

/// How to proceed with an event raised while another is being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecursiveXcpt {
    /// Deliver the new event as is.
    Current,
    DoubleFault,
    TripleFault,
    CpuHang,
}

/// Decide what happens when `cur_vector` is raised while delivering `prev_vector`.
pub fn evaluate_recursive_xcpt(
    prev_flags: XcptFlags,
    prev_vector: u8,
    cur_flags: XcptFlags,
    cur_vector: u8,
) -> RecursiveXcpt {
    if !prev_flags.contains(XcptFlags::CPU_XCPT) || !cur_flags.contains(XcptFlags::CPU_XCPT) {
        return RecursiveXcpt::Current;
    }
    let prev = xcpt_class(prev_vector);
    let cur = xcpt_class(cur_vector);
    match (prev, cur) {
        (XcptClass::PageFault, XcptClass::PageFault | XcptClass::Contributory) => {
            RecursiveXcpt::DoubleFault
        }
        (XcptClass::Contributory, XcptClass::Contributory) => RecursiveXcpt::DoubleFault,
        (XcptClass::DoubleFault, XcptClass::Contributory | XcptClass::PageFault) => {
            RecursiveXcpt::TripleFault
        }
        (XcptClass::Benign, _) if prev_vector == XCPT_AC && cur_vector == XCPT_AC => {
            RecursiveXcpt::CpuHang
        }
        _ => RecursiveXcpt::Current,
    }
}

/// The delivery currently in progress, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct XcptNesting {
    pub depth: u8,
    pub vector: u8,
    pub flags: XcptFlags,
}

impl<P: Platform> Vcpu<P> {
    /// Deliver an exception, external interrupt or software interrupt.
    ///
    /// `cb_instr` is the length of the instruction for software interrupts. CPU
    /// exceptions answer `Err(Exit::RaisedXcpt)` once delivered, so the
    /// faulting instruction is abandoned; interrupts answer `Ok(())`.
    pub(crate) fn raise_xcpt_or_int(
        &mut self,
        cb_instr: u8,
        vector: u8,
        flags: XcptFlags,
        err: u16,
        cr2: u64,
    ) -> IemResult<()> {
        let mut vector = vector;
        let mut flags = flags;
        let mut err = err;

        // INT n in V86 mode needs IOPL 3; INT3, INTO and INT1 are exempt.
        let soft_kind = flags
            & (XcptFlags::SOFT_INT
                | XcptFlags::BP_INSTR
                | XcptFlags::ICEBP_INSTR
                | XcptFlags::OF_INSTR);
        if soft_kind == XcptFlags::SOFT_INT
            && self.state.rflags() & RFLAGS_VM != 0
            && self.state.iopl() != 3
        {
            debug!(vector, "INT n in V86 mode with IOPL < 3");
            return Err(self.raise_gp(0));
        }

        if vector == XCPT_NMI && flags.contains(XcptFlags::CPU_XCPT) {
            self.state.nmi_blocked = true;
        }

        if flags.contains(XcptFlags::SOFT_INT)
            && self.state.dbg_hits.drx != 0
            && self.config.silences_soft_int_debug()
        {
            debug!(hits = self.state.dbg_hits.drx, "breakpoint hits turned silent by INT n");
            self.state.dbg_hits.drx = 0;
            self.state.dbg_hits.silent = true;
        }

        if self.xcpt.depth > 0 {
            if self.xcpt.depth >= MAX_XCPT_DEPTH {
                debug!(depth = self.xcpt.depth, vector, "exception nesting too deep");
                return Err(Exit::Unimplemented("exception nesting deeper than four levels"));
            }
            let prev = self.xcpt;
            match evaluate_recursive_xcpt(prev.flags, prev.vector, flags, vector) {
                RecursiveXcpt::Current => {}
                RecursiveXcpt::DoubleFault => {
                    debug!(prev = prev.vector, cur = vector, "escalating to #DF");
                    vector = XCPT_DF;
                    flags = XcptFlags::CPU_XCPT | XcptFlags::ERR;
                    err = 0;
                }
                RecursiveXcpt::TripleFault => {
                    debug!(prev = prev.vector, cur = vector, "triple fault");
                    return Err(Exit::TripleFault);
                }
                RecursiveXcpt::CpuHang => {
                    debug!("recursive #AC, cpu hang");
                    return Err(Exit::CpuHang);
                }
            }
            if prev
                .flags
                .intersects(XcptFlags::CPU_XCPT | XcptFlags::EXT_INT | XcptFlags::ICEBP_INSTR)
                && flags.contains(XcptFlags::ERR)
                && vector != XCPT_PF
                && vector != XCPT_DF
            {
                err |= ERR_EXT;
            }
        }

        debug!(
            vector,
            ?flags,
            err,
            cr2,
            depth = self.xcpt.depth,
            mode = ?self.state.mode,
            "delivering event"
        );

        if vector == XCPT_PF && flags.contains(XcptFlags::CR2) {
            self.invalidate_tlb_page(cr2);
        }

        let outer = self.xcpt;
        self.xcpt = XcptNesting {
            depth: outer.depth + 1,
            vector,
            flags,
        };
        self.state.halted = false;
        let res = match self.state.mode {
            CpuMode::Real => self.deliver_real(cb_instr, vector, flags),
            CpuMode::Long => self.deliver_long(cb_instr, vector, flags, err, cr2),
            CpuMode::Protected | CpuMode::Vm86 => {
                self.deliver_protected(cb_instr, vector, flags, err, cr2)
            }
        };
        self.xcpt = outer;
        self.fetch.flush();

        res?;
        if flags.contains(XcptFlags::CPU_XCPT) {
            self.stats.exceptions_raised += 1;
            return Err(Exit::RaisedXcpt);
        }
        Ok(())
    }

    /// Raise a CPU exception; the result is what the faulting helper returns.
    pub(crate) fn raise_cpu_xcpt(&mut self, vector: u8, flags: XcptFlags, err: u16, cr2: u64) -> Exit {
        match self.raise_xcpt_or_int(0, vector, flags | XcptFlags::CPU_XCPT, err, cr2) {
            Ok(()) => Exit::RaisedXcpt,
            Err(e) => e,
        }
    }

    #[inline]
    pub(crate) fn raise_cpu_xcpt_err(&mut self, vector: u8, err: u16) -> Exit {
        self.raise_cpu_xcpt(vector, XcptFlags::ERR, err, 0)
    }

    pub(crate) fn raise_gp(&mut self, err: u16) -> Exit {
        self.raise_cpu_xcpt_err(XCPT_GP, err)
    }

    pub(crate) fn raise_ss(&mut self, err: u16) -> Exit {
        self.raise_cpu_xcpt_err(XCPT_SS, err)
    }

    pub(crate) fn raise_ts(&mut self, err: u16) -> Exit {
        self.raise_cpu_xcpt_err(XCPT_TS, err)
    }

    pub(crate) fn raise_np(&mut self, err: u16) -> Exit {
        self.raise_cpu_xcpt_err(XCPT_NP, err)
    }

    pub(crate) fn raise_ac(&mut self) -> Exit {
        self.raise_cpu_xcpt_err(XCPT_AC, 0)
    }

    pub(crate) fn raise_ud(&mut self) -> Exit {
        self.raise_cpu_xcpt(XCPT_UD, XcptFlags::empty(), 0, 0)
    }

    pub(crate) fn raise_db(&mut self) -> Exit {
        self.raise_cpu_xcpt(XCPT_DB, XcptFlags::empty(), 0, 0)
    }

    /// Vector-specific state changes once a CPU exception has been delivered.
    fn adjust_state_for_xcpt(&mut self, vector: u8) {
        if vector == XCPT_DB {
            self.state.dr[7] &= !DR7_GD;
        }
    }

    /// Common tail of every successful delivery: breakpoint hits recorded by
    /// a software interrupt become a #DB, anything else is dropped together
    /// with the interrupt shadow.
    fn finish_delivery(&mut self, vector: u8, flags: XcptFlags) -> IemResult<()> {
        if flags.contains(XcptFlags::CPU_XCPT) {
            self.adjust_state_for_xcpt(vector);
        }
        self.state.inhibit_shadow = None;
        let hits = self.state.dbg_hits;
        if !flags.contains(XcptFlags::SOFT_INT) || !hits.any() {
            self.state.dbg_hits.clear();
            return Ok(());
        }
        self.state.dr[6] |= hits.drx as u64 & DR6_B_MASK;
        self.state.dbg_hits.clear();
        Err(self.raise_db())
    }

    /// EFLAGS image pushed for an event.
    fn pushed_eflags(&self, flags: XcptFlags) -> u64 {
        let efl = self.state.rflags();
        if flags.intersects(XcptFlags::DRX_INSTR_BP | XcptFlags::SOFT_INT) {
            efl & !crate::state::RFLAGS_RF
        } else {
            efl | crate::state::RFLAGS_RF
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPU: XcptFlags = XcptFlags::CPU_XCPT;

    #[test]
    fn vector_classes() {
        for v in [XCPT_DE, XCPT_TS, XCPT_NP, XCPT_SS, XCPT_GP, XCPT_SX] {
            assert_eq!(xcpt_class(v), XcptClass::Contributory, "vector {v}");
        }
        assert_eq!(xcpt_class(XCPT_PF), XcptClass::PageFault);
        assert_eq!(xcpt_class(XCPT_DF), XcptClass::DoubleFault);
        for v in [XCPT_DB, XCPT_NMI, XCPT_BP, XCPT_UD, XCPT_NM, XCPT_MF, XCPT_AC, 0x20] {
            assert_eq!(xcpt_class(v), XcptClass::Benign, "vector {v}");
        }
    }

    #[test]
    fn contributory_after_page_fault_escalates_but_not_the_reverse() {
        assert_eq!(
            evaluate_recursive_xcpt(CPU, XCPT_PF, CPU, XCPT_GP),
            RecursiveXcpt::DoubleFault
        );
        assert_eq!(
            evaluate_recursive_xcpt(CPU, XCPT_GP, CPU, XCPT_PF),
            RecursiveXcpt::Current
        );
    }

    #[test]
    fn interrupts_never_escalate() {
        assert_eq!(
            evaluate_recursive_xcpt(XcptFlags::EXT_INT, 0x20, CPU, XCPT_GP),
            RecursiveXcpt::Current
        );
        assert_eq!(
            evaluate_recursive_xcpt(CPU, XCPT_GP, XcptFlags::SOFT_INT, XCPT_GP),
            RecursiveXcpt::Current
        );
    }

    #[test]
    fn alignment_check_inside_alignment_check_hangs() {
        assert_eq!(
            evaluate_recursive_xcpt(CPU, XCPT_AC, CPU, XCPT_AC),
            RecursiveXcpt::CpuHang
        );
    }

    #[test]
    fn idt_error_code_layout() {
        assert_eq!(idt_error_code(0x0d), 0x6a);
        assert_eq!(idt_error_code(0x80), 0x402);
    }
}
