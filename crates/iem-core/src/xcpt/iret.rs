//! Return from an interrupt or exception handler.

use iem_mmu::is_canonical_48;
use tracing::debug;

use super::{TaskSwitch, XcptFlags, XCPT_GP, XCPT_TS};
use crate::desc::{is_null_selector, Descriptor, SEL_RPL_MASK, SEL_TI_LDT};
use crate::mem::{Access, Align};
use crate::platform::Platform;
use crate::state::{
    gpr, mask_bits, CpuMode, SegReg, Segment, ATTR_DPL_SHIFT, ATTR_V86, RFLAGS_AC, RFLAGS_ID,
    RFLAGS_IF, RFLAGS_IOPL_MASK, RFLAGS_NT, RFLAGS_RF, RFLAGS_VIF, RFLAGS_VIP, RFLAGS_VM,
    SEL_TYPE_ACCESSED, SEL_TYPE_CODE, SEL_TYPE_CONF, SEL_TYPE_WRITE, SYS_TSS_286_BUSY,
    SYS_TSS_386_BUSY,
};
use crate::status::IemResult;
use crate::vcpu::Vcpu;

/// Arithmetic flags plus TF, DF and NT: always loaded by IRET.
const IRET_BASE_FLAGS: u64 = 0x4dd5 | (1 << 8);

/// Merge the EFLAGS image popped by IRET into the live flags.
///
/// IF changes only when CPL <= IOPL, IOPL only at CPL 0, VIF/VIP only at CPL 0.
pub(crate) fn iret_eflags(old: u64, popped: u64, cpl: u8, op_bits: u32) -> u64 {
    let mut mask = IRET_BASE_FLAGS;
    if op_bits >= 32 {
        mask |= RFLAGS_RF | RFLAGS_AC | RFLAGS_ID;
        if cpl == 0 {
            mask |= RFLAGS_VIF | RFLAGS_VIP;
        }
    }
    let iopl = ((old & RFLAGS_IOPL_MASK) >> 12) as u8;
    if cpl <= iopl {
        mask |= RFLAGS_IF;
    }
    if cpl == 0 {
        mask |= RFLAGS_IOPL_MASK;
    }
    if op_bits == 16 {
        mask &= 0xffff;
    }
    (old & !mask) | (popped & mask)
}

fn read_slots(buf: &[u8], size: usize, count: usize) -> [u64; 6] {
    let mut out = [0u64; 6];
    for (i, slot) in out.iter_mut().enumerate().take(count) {
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(&buf[i * size..(i + 1) * size]);
        *slot = u64::from_le_bytes(raw);
    }
    out
}

impl<P: Platform> Vcpu<P> {
    /// `IRET` with an operand size of 16, 32 or 64 bits.
    pub(crate) fn iret(&mut self, op_bits: u32) -> IemResult<()> {
        let res = match self.state.mode {
            CpuMode::Real | CpuMode::Vm86 => self.iret_real_v86(op_bits),
            CpuMode::Protected => self.iret_protected(op_bits),
            CpuMode::Long => self.iret_long(op_bits),
        };
        if res.is_ok() {
            self.state.nmi_blocked = false;
        }
        res
    }

    fn iret_real_v86(&mut self, op_bits: u32) -> IemResult<()> {
        let vm86 = self.state.mode == CpuMode::Vm86;
        if vm86 && self.state.iopl() != 3 {
            debug!(iopl = self.state.iopl(), "IRET in V86 mode with IOPL < 3");
            return Err(self.raise_gp(0));
        }
        let size = (op_bits / 8) as usize;
        let (token, new_sp) = self.stack_pop_begin(3 * size)?;
        let [ip, cs, popped, ..] = read_slots(self.mapped_mut(token)?, size, 3);
        self.mem_commit(token)?;

        if op_bits == 32 && ip > 0xffff && !vm86 {
            return Err(self.raise_gp(0));
        }
        let old = self.state.rflags();
        let mut mask = IRET_BASE_FLAGS | RFLAGS_IF;
        if op_bits == 32 {
            mask |= RFLAGS_RF | RFLAGS_AC | RFLAGS_ID;
        } else {
            mask &= 0xffff;
        }
        if !vm86 {
            mask |= RFLAGS_IOPL_MASK;
        }
        let new_flags = (old & !mask) | (popped & mask);

        self.state.set_stack_ptr(new_sp);
        self.load_sreg_real(SegReg::Cs, cs as u16);
        self.state.set_rip(ip & mask_bits(op_bits));
        self.state.set_rflags(new_flags);
        Ok(())
    }

    fn iret_protected(&mut self, op_bits: u32) -> IemResult<()> {
        if self.state.get_flag(RFLAGS_NT) {
            return self.iret_to_linked_task();
        }

        let cpl = self.state.cpl();
        let size = (op_bits / 8) as usize;
        let (token, sp_after) = self.stack_pop_begin(3 * size)?;
        let [new_eip, cs_raw, popped, ..] = read_slots(self.mapped_mut(token)?, size, 3);
        self.mem_commit(token)?;
        let new_cs = cs_raw as u16;

        if popped & RFLAGS_VM != 0 && cpl == 0 && op_bits == 32 {
            return self.iret_to_v86(new_eip, new_cs, popped, sp_after);
        }

        let cs_desc = self.check_return_cs(new_cs)?;
        let rpl = (new_cs & SEL_RPL_MASK) as u8;
        let old_flags = self.state.rflags();

        if rpl == cpl {
            if new_eip > cs_desc.limit() as u64 {
                debug!(new_eip, limit = cs_desc.limit(), "IRET target beyond CS limit");
                return Err(self.raise_gp(0));
            }
            self.commit_cs(new_cs, cs_desc, cpl)?;
            self.state.set_rip(new_eip);
            self.state.set_stack_ptr(sp_after);
            self.state
                .set_rflags(iret_eflags(old_flags, popped, cpl, op_bits));
            return Ok(());
        }

        // Return to an outer ring: the frame continues with ESP and SS.
        let token = self.mem_map(
            Some(SegReg::Ss),
            sp_after,
            2 * size,
            Access::STACK_R,
            Align::NONE,
        )?;
        let [new_esp, ss_raw, ..] = read_slots(self.mapped_mut(token)?, size, 2);
        self.mem_commit(token)?;
        let new_ss = ss_raw as u16;

        let ss_desc = self.check_return_ss(new_ss, rpl)?;
        if new_eip > cs_desc.limit() as u64 {
            return Err(self.raise_gp(0));
        }

        self.commit_cs(new_cs, cs_desc, rpl)?;
        self.load_return_ss(new_ss, ss_desc)?;
        if ss_desc.is_big() {
            self.state.set_gpr_u64(gpr::RSP, new_esp & 0xffff_ffff);
        } else {
            self.state.write_gpr16(gpr::RSP, new_esp as u16);
        }
        self.state.set_rip(new_eip);
        self.state
            .set_rflags(iret_eflags(old_flags, popped, cpl, op_bits));
        self.null_inaccessible_data_segments(rpl);
        debug!(new_cs, new_ss, rpl, "IRET to outer privilege");
        Ok(())
    }

    /// IRET with NT set returns to the task in the back link.
    fn iret_to_linked_task(&mut self) -> IemResult<()> {
        let link = self.read_sys_u16(self.state.tr.base)?;
        let err = link & !SEL_RPL_MASK;
        if link & SEL_TI_LDT != 0 {
            debug!(link, "IRET back link points into the LDT");
            return Err(self.raise_ts(err));
        }
        let desc = self.fetch_sel_desc(link, XCPT_TS)?;
        if !desc.is_system() || !matches!(desc.typ(), SYS_TSS_286_BUSY | SYS_TSS_386_BUSY) {
            debug!(link, ty = desc.typ(), "IRET back link is not a busy TSS");
            return Err(self.raise_ts(err));
        }
        if !desc.is_present() {
            return Err(self.raise_np(err));
        }
        let next_eip = self.state.rip().wrapping_add(self.cb_instr as u64) as u32;
        self.task_switch(TaskSwitch::Iret, next_eip, XcptFlags::empty(), 0, 0, link, desc)
    }

    fn iret_to_v86(&mut self, eip: u64, cs: u16, popped: u64, sp_after: u64) -> IemResult<()> {
        let token = self.mem_map(Some(SegReg::Ss), sp_after, 24, Access::STACK_R, Align::NONE)?;
        let [esp, ss, es, ds, fs, gs] = read_slots(self.mapped_mut(token)?, 4, 6);
        self.mem_commit(token)?;

        debug!(cs, eip, ss, esp, "IRET to V86 mode");
        self.state.set_rflags(popped | RFLAGS_VM);
        for (sreg, sel) in [
            (SegReg::Cs, cs),
            (SegReg::Ss, ss as u16),
            (SegReg::Es, es as u16),
            (SegReg::Ds, ds as u16),
            (SegReg::Fs, fs as u16),
            (SegReg::Gs, gs as u16),
        ] {
            *self.state.segments.get_mut(sreg) = Segment {
                selector: sel,
                base: (sel as u64) << 4,
                limit: 0xffff,
                attr: ATTR_V86,
            };
        }
        self.state.set_gpr_u64(gpr::RSP, esp & 0xffff_ffff);
        self.state.set_rip(eip & 0xffff);
        self.state.update_mode();
        Ok(())
    }

    fn iret_long(&mut self, op_bits: u32) -> IemResult<()> {
        if self.state.get_flag(RFLAGS_NT) {
            debug!("IRET with NT set in long mode");
            return Err(self.raise_gp(0));
        }
        let cpl = self.state.cpl();
        let size = (op_bits / 8) as usize;
        let (token, _) = self.stack_pop_begin(5 * size)?;
        let [new_rip, cs_raw, popped, new_rsp, ss_raw, ..] =
            read_slots(self.mapped_mut(token)?, size, 5);
        self.mem_commit(token)?;
        let new_cs = cs_raw as u16;
        let new_ss = ss_raw as u16;

        let cs_desc = self.check_return_cs(new_cs)?;
        let rpl = (new_cs & SEL_RPL_MASK) as u8;
        let to_64bit = cs_desc.is_long() && !cs_desc.is_big();

        let ss_desc = if is_null_selector(new_ss) && to_64bit && rpl != 3 {
            None
        } else {
            Some(self.check_return_ss(new_ss, rpl)?)
        };

        if to_64bit {
            if !is_canonical_48(new_rip) {
                return Err(self.raise_gp(0));
            }
        } else if new_rip > cs_desc.limit() as u64 {
            return Err(self.raise_gp(0));
        }

        let old_flags = self.state.rflags();
        self.commit_cs(new_cs, cs_desc, rpl)?;
        match ss_desc {
            Some(desc) => self.load_return_ss(new_ss, desc)?,
            None => {
                let mut ss = Segment::null(new_ss);
                ss.attr |= (rpl as u32) << ATTR_DPL_SHIFT;
                self.state.segments.ss = ss;
            }
        }
        self.state.set_gpr_u64(gpr::RSP, new_rsp);
        self.state.set_rip(new_rip);
        self.state
            .set_rflags(iret_eflags(old_flags, popped, cpl, op_bits) & !RFLAGS_VM);
        if rpl > cpl {
            self.null_inaccessible_data_segments(rpl);
        }
        Ok(())
    }

    /// CS checks shared by every protected-mode IRET.
    fn check_return_cs(&mut self, cs: u16) -> IemResult<Descriptor> {
        let cpl = self.state.cpl();
        let err = cs & !SEL_RPL_MASK;
        if is_null_selector(cs) {
            return Err(self.raise_gp(0));
        }
        let desc = self.fetch_sel_desc(cs, XCPT_GP)?;
        if !desc.is_code() {
            debug!(cs, "IRET to a non-code segment");
            return Err(self.raise_gp(err));
        }
        let rpl = (cs & SEL_RPL_MASK) as u8;
        if rpl < cpl {
            debug!(cs, cpl, "IRET to an inner ring");
            return Err(self.raise_gp(err));
        }
        let conforming = desc.typ() & SEL_TYPE_CONF != 0;
        if (conforming && desc.dpl() > rpl) || (!conforming && desc.dpl() != rpl) {
            debug!(cs, rpl, dpl = desc.dpl(), "IRET CS privilege mismatch");
            return Err(self.raise_gp(err));
        }
        if !desc.is_present() {
            return Err(self.raise_np(err));
        }
        Ok(desc)
    }

    fn check_return_ss(&mut self, ss: u16, rpl: u8) -> IemResult<Descriptor> {
        let err = ss & !SEL_RPL_MASK;
        if is_null_selector(ss) {
            return Err(self.raise_gp(0));
        }
        if (ss & SEL_RPL_MASK) as u8 != rpl {
            return Err(self.raise_gp(err));
        }
        let desc = self.fetch_sel_desc(ss, XCPT_GP)?;
        if desc.is_system() || desc.typ() & (SEL_TYPE_CODE | SEL_TYPE_WRITE) != SEL_TYPE_WRITE {
            debug!(ss, "IRET to a non-writable stack segment");
            return Err(self.raise_gp(err));
        }
        if desc.dpl() != rpl {
            return Err(self.raise_gp(err));
        }
        if !desc.is_present() {
            return Err(self.raise_ss(err));
        }
        Ok(desc)
    }

    fn load_return_ss(&mut self, ss: u16, mut desc: Descriptor) -> IemResult<()> {
        if desc.typ() & SEL_TYPE_ACCESSED == 0 {
            self.mark_sel_desc_accessed(ss)?;
            desc.set_accessed();
        }
        self.state.segments.ss = desc.to_segment(ss);
        Ok(())
    }

    /// After a return to an outer ring, data segments the new CPL may not
    /// use are loaded with null.
    pub(crate) fn null_inaccessible_data_segments(&mut self, new_cpl: u8) {
        for sreg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            let s = *self.state.segments.get(sreg);
            if s.is_unusable() {
                continue;
            }
            let conforming_code = s.is_code() && s.typ() & SEL_TYPE_CONF != 0;
            if !conforming_code && s.dpl() < new_cpl {
                debug!(?sreg, sel = s.selector, "nulling segment inaccessible at the new CPL");
                *self.state.segments.get_mut(sreg) = Segment::null(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iret_flags_respect_privilege() {
        // Ring 3 with IOPL 0: neither IF nor IOPL change.
        let old = RFLAGS_IF;
        let popped = 0x3000 | 0x1; // IOPL 3, CF, IF clear
        let new = iret_eflags(old, popped, 3, 32);
        assert_eq!(new & RFLAGS_IF, RFLAGS_IF);
        assert_eq!(new & RFLAGS_IOPL_MASK, 0);
        assert_eq!(new & 1, 1);

        // Ring 0 takes everything.
        let new = iret_eflags(old, popped, 0, 32);
        assert_eq!(new & RFLAGS_IF, 0);
        assert_eq!(new & RFLAGS_IOPL_MASK, 0x3000);
    }

    #[test]
    fn sixteen_bit_iret_keeps_upper_flags() {
        let old = RFLAGS_AC | RFLAGS_ID;
        let new = iret_eflags(old, 0, 0, 16);
        assert_eq!(new & (RFLAGS_AC | RFLAGS_ID), RFLAGS_AC | RFLAGS_ID);
    }
}
