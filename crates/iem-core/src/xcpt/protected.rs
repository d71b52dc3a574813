use tracing::debug;

use super::{idt_error_code, TaskSwitch, XcptFlags, XCPT_GP, XCPT_TS};
use crate::desc::{is_null_selector, Descriptor, SEL_RPL_MASK, SEL_TI_LDT};
use crate::mem::{Access, Align};
use crate::platform::Platform;
use crate::state::{
    gpr, SegReg, Segment, RFLAGS_IF, RFLAGS_NT, RFLAGS_RF, RFLAGS_TF, RFLAGS_VM, SEL_TYPE_ACCESSED,
    SEL_TYPE_CONF, SEL_TYPE_WRITE, SYS_INT_GATE_286, SYS_INT_GATE_386, SYS_TASK_GATE,
    SYS_TRAP_GATE_286, SYS_TRAP_GATE_386, SYS_TSS_286_AVAIL, SYS_TSS_286_BUSY, SYS_TSS_386_AVAIL,
    SYS_TSS_386_BUSY,
};
use crate::status::{Exit, IemResult};
use crate::vcpu::Vcpu;

/// Little-endian frame writer for 16- or 32-bit slots.
struct FrameWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
    wide: bool,
}

impl<'a> FrameWriter<'a> {
    fn new(buf: &'a mut [u8], wide: bool) -> Self {
        Self { buf, pos: 0, wide }
    }

    fn put(&mut self, val: u32) {
        if self.wide {
            self.buf[self.pos..self.pos + 4].copy_from_slice(&val.to_le_bytes());
            self.pos += 4;
        } else {
            self.buf[self.pos..self.pos + 2].copy_from_slice(&(val as u16).to_le_bytes());
            self.pos += 2;
        }
    }
}

impl<P: Platform> Vcpu<P> {
    /// Protected-mode (and V86) delivery through the IDT.
    pub(super) fn deliver_protected(
        &mut self,
        cb_instr: u8,
        vector: u8,
        flags: XcptFlags,
        err: u16,
        cr2: u64,
    ) -> IemResult<()> {
        let idt_err = idt_error_code(vector);
        let idtr = self.state.idtr;
        let entry_off = 8 * vector as u32;
        if idtr.limit < entry_off + 7 {
            debug!(vector, limit = idtr.limit, "vector beyond the IDT limit");
            return Err(self.raise_gp(idt_err));
        }
        let gate = Descriptor::new(self.read_sys_u64(idtr.base + entry_off as u64)?);
        if !gate.is_system() {
            debug!(vector, raw = gate.raw, "IDT entry is not a system descriptor");
            return Err(self.raise_gp(idt_err));
        }

        let mut clear = RFLAGS_TF | RFLAGS_NT | RFLAGS_RF | RFLAGS_VM;
        let gate16 = match gate.typ() {
            SYS_INT_GATE_286 => {
                clear |= RFLAGS_IF;
                true
            }
            SYS_TRAP_GATE_286 => true,
            SYS_INT_GATE_386 => {
                clear |= RFLAGS_IF;
                false
            }
            SYS_TRAP_GATE_386 | SYS_TASK_GATE => false,
            ty => {
                debug!(vector, ty, "bad IDT gate type");
                return Err(self.raise_gp(idt_err));
            }
        };

        let cpl = self.state.cpl();
        if flags.contains(XcptFlags::SOFT_INT)
            && !flags.contains(XcptFlags::ICEBP_INSTR)
            && cpl > gate.dpl()
        {
            debug!(vector, cpl, dpl = gate.dpl(), "INT n through a gate above CPL");
            return Err(self.raise_gp(idt_err));
        }
        if !gate.is_present() {
            return Err(self.raise_np(idt_err));
        }

        if gate.typ() == SYS_TASK_GATE {
            return self.deliver_via_task_gate(cb_instr, gate, flags, err, cr2);
        }

        let cs_sel = gate.gate_selector();
        if is_null_selector(cs_sel) {
            return Err(self.raise_gp(0));
        }
        let cs_desc = self.fetch_sel_desc(cs_sel, XCPT_GP)?;
        let cs_err = cs_sel & !SEL_RPL_MASK;
        if cs_desc.is_system() || !cs_desc.is_code() {
            debug!(cs_sel, "gate target is not a code segment");
            return Err(self.raise_gp(cs_err));
        }
        if cs_desc.dpl() > cpl {
            debug!(cs_sel, cpl, dpl = cs_desc.dpl(), "gate target DPL above CPL");
            return Err(self.raise_gp(cs_err));
        }
        if !cs_desc.is_present() {
            return Err(self.raise_np(cs_err));
        }

        let new_eip = if gate16 {
            gate.gate_offset() & 0xffff
        } else {
            gate.gate_offset() & 0xffff_ffff
        };
        if new_eip > cs_desc.limit() as u64 {
            debug!(new_eip, limit = cs_desc.limit(), "handler beyond CS limit");
            return Err(self.raise_gp(0));
        }

        let efl = self.pushed_eflags(flags);
        let new_cpl = if cs_desc.typ() & SEL_TYPE_CONF != 0 {
            cpl
        } else {
            cs_desc.dpl()
        };
        let from_v86 = efl & RFLAGS_VM != 0;
        if from_v86 && new_cpl != 0 {
            debug!(cs_sel, new_cpl, "V86 interrupt to a handler outside ring 0");
            return Err(self.raise_gp(cs_err));
        }

        let wide = !gate16;
        let has_err = flags.contains(XcptFlags::ERR);
        let mut ret_eip = self.state.rip();
        if flags.contains(XcptFlags::SOFT_INT) {
            ret_eip += cb_instr as u64;
        }
        let old_cs = self.state.segments.cs.selector;
        let old_ss = self.state.segments.ss.selector;
        let old_esp = self.state.gpr_u64(gpr::RSP) as u32;

        if new_cpl != cpl {
            let (new_ss, tss_esp) = self.tss_stack_for_cpl(new_cpl)?;
            let ss_desc = self.check_inner_ss(new_ss, new_cpl)?;
            let esp = if ss_desc.is_big() {
                tss_esp
            } else {
                tss_esp & 0xffff
            };

            let slots: u32 = match (from_v86, has_err) {
                (false, false) => 5,
                (false, true) => 6,
                (true, false) => 9,
                (true, true) => 10,
            };
            let frame_len = slots * if wide { 4 } else { 2 };
            if !stack_frame_fits(&ss_desc, esp, frame_len) {
                debug!(new_ss, esp, frame_len, "frame does not fit the new stack");
                return Err(self.raise_ss(new_ss & !SEL_RPL_MASK));
            }

            let new_esp = esp.wrapping_sub(frame_len);
            let linear = ss_desc.base().wrapping_add(new_esp as u64) & 0xffff_ffff;
            let token = self.mem_map(None, linear, frame_len as usize, Access::STACK_W | Access::SYS, Align::NONE)?;
            {
                let seg = self.state.segments;
                let buf = self.mapped_mut(token)?;
                let mut w = FrameWriter::new(buf, wide);
                if has_err {
                    w.put(err as u32);
                }
                w.put(ret_eip as u32);
                let pushed_cs = if from_v86 {
                    old_cs
                } else {
                    (old_cs & !SEL_RPL_MASK) | cpl as u16
                };
                w.put(pushed_cs as u32);
                w.put(efl as u32);
                w.put(old_esp);
                w.put(old_ss as u32);
                if from_v86 {
                    w.put(seg.es.selector as u32);
                    w.put(seg.ds.selector as u32);
                    w.put(seg.fs.selector as u32);
                    w.put(seg.gs.selector as u32);
                }
            }
            self.mem_commit(token)?;

            let mut ss_desc = ss_desc;
            if ss_desc.typ() & SEL_TYPE_ACCESSED == 0 {
                self.mark_sel_desc_accessed(new_ss)?;
                ss_desc.set_accessed();
            }
            self.state.segments.ss = ss_desc.to_segment(new_ss);
            if ss_desc.is_big() {
                self.state.set_gpr_u64(gpr::RSP, new_esp as u64);
            } else {
                self.state.write_gpr16(gpr::RSP, new_esp as u16);
            }
            if from_v86 {
                for sreg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
                    *self.state.segments.get_mut(sreg) = Segment::null(0);
                }
            }
        } else {
            let frame_len = if has_err { 4 } else { 3 } * if wide { 4 } else { 2 };
            let (token, new_sp) = self.stack_push_begin(frame_len)?;
            {
                let buf = self.mapped_mut(token)?;
                let mut w = FrameWriter::new(buf, wide);
                if has_err {
                    w.put(err as u32);
                }
                w.put(ret_eip as u32);
                w.put(((old_cs & !SEL_RPL_MASK) | cpl as u16) as u32);
                w.put(efl as u32);
            }
            self.stack_push_commit(token, new_sp)?;
        }

        self.commit_cs(cs_sel, cs_desc, new_cpl)?;
        self.state.set_rip(new_eip);
        self.state.set_rflags(efl & !clear);
        if flags.contains(XcptFlags::CR2) {
            self.state.control.cr2 = cr2;
        }
        self.state.update_mode();
        debug!(vector, cs = cs_sel, eip = new_eip, new_cpl, "handler entered");

        self.finish_delivery(vector, flags)
    }

    /// Dispatch through a task gate in the IDT.
    fn deliver_via_task_gate(
        &mut self,
        cb_instr: u8,
        gate: Descriptor,
        flags: XcptFlags,
        err: u16,
        cr2: u64,
    ) -> IemResult<()> {
        let ext = if flags.contains(XcptFlags::SOFT_INT) && !flags.contains(XcptFlags::ICEBP_INSTR) {
            0
        } else {
            1
        };
        let tss_sel = gate.gate_selector();
        let tss_err = (tss_sel & !SEL_RPL_MASK) | ext;
        if tss_sel & SEL_TI_LDT != 0 {
            debug!(tss_sel, "task gate points into the LDT");
            return Err(self.raise_gp(tss_err));
        }
        let tss_desc = self.fetch_sel_desc_with_err(tss_sel, XCPT_GP, tss_err)?;
        if !tss_desc.is_system()
            || !matches!(tss_desc.typ(), SYS_TSS_286_AVAIL | SYS_TSS_386_AVAIL)
        {
            debug!(tss_sel, ty = tss_desc.typ(), "task gate target is not an available TSS");
            return Err(self.raise_gp(tss_err));
        }
        if !tss_desc.is_present() {
            return Err(self.raise_np(tss_err));
        }

        let mut next_eip = self.state.rip();
        if flags.contains(XcptFlags::SOFT_INT) {
            next_eip += cb_instr as u64;
        }
        self.task_switch(TaskSwitch::IntXcpt, next_eip as u32, flags, err, cr2, tss_sel, tss_desc)
    }

    /// Ring `cpl` stack from the current TSS: (SS, ESP).
    fn tss_stack_for_cpl(&mut self, cpl: u8) -> IemResult<(u16, u32)> {
        let tr = self.state.tr;
        let tr_err = tr.selector & !SEL_RPL_MASK;
        match tr.typ() {
            SYS_TSS_286_AVAIL | SYS_TSS_286_BUSY => {
                let off = cpl as u32 * 4 + 2;
                if off + 4 > tr.limit {
                    debug!(cpl, limit = tr.limit, "16-bit TSS too small for the stack slot");
                    return Err(self.raise_ts(tr_err));
                }
                let v = self.read_sys_u32(tr.base + off as u64)?;
                Ok(((v >> 16) as u16, v & 0xffff))
            }
            SYS_TSS_386_AVAIL | SYS_TSS_386_BUSY => {
                let off = cpl as u32 * 8 + 4;
                if off + 7 > tr.limit {
                    debug!(cpl, limit = tr.limit, "32-bit TSS too small for the stack slot");
                    return Err(self.raise_ts(tr_err));
                }
                let v = self.read_sys_u64(tr.base + off as u64)?;
                Ok(((v >> 32) as u16, v as u32))
            }
            _ => Err(Exit::Unimplemented("task register does not hold a TSS")),
        }
    }

    /// Validate the stack segment an inter-privilege transfer switches to.
    fn check_inner_ss(&mut self, ss: u16, new_cpl: u8) -> IemResult<Descriptor> {
        let ss_err = ss & !SEL_RPL_MASK;
        if is_null_selector(ss) {
            debug!("null SS in the TSS");
            return Err(self.raise_ts(0));
        }
        if (ss & SEL_RPL_MASK) as u8 != new_cpl {
            debug!(ss, new_cpl, "SS RPL does not match the new CPL");
            return Err(self.raise_ts(ss_err));
        }
        let desc = self.fetch_sel_desc(ss, XCPT_TS)?;
        if desc.is_system() || desc.is_code() || desc.typ() & SEL_TYPE_WRITE == 0 {
            debug!(ss, ty = desc.typ(), "new SS is not a writable data segment");
            return Err(self.raise_ts(ss_err));
        }
        if desc.dpl() != new_cpl {
            debug!(ss, dpl = desc.dpl(), new_cpl, "new SS DPL does not match the new CPL");
            return Err(self.raise_ts(ss_err));
        }
        if !desc.is_present() {
            return Err(self.raise_ss(ss_err));
        }
        Ok(desc)
    }
}

/// Whether `len` bytes can be pushed below `esp` on the stack described by `ss`.
pub(super) fn stack_frame_fits(ss: &Descriptor, esp: u32, len: u32) -> bool {
    let limit = ss.limit();
    let upper = if ss.is_big() { 0xffff_ffff } else { 0xffff };
    if esp < len {
        // Wrapping below zero only works for expand-down stacks, and not at all here.
        return false;
    }
    let low = esp - len;
    let high = esp - 1;
    if ss.typ() & crate::state::SEL_TYPE_DOWN != 0 {
        low > limit && high <= upper
    } else {
        high <= limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_fit_on_normal_and_expand_down_stacks() {
        // 32-bit flat data, limit 0xfffff (byte granular).
        let normal = Descriptor::new(0x0040_9200_0000_ffff | (0xf << 48));
        assert!(stack_frame_fits(&normal, 0x1000, 20));
        assert!(!stack_frame_fits(&normal, 0x10, 20));
        assert!(!stack_frame_fits(&normal, 0x20_0000, 20));

        // Expand-down, limit 0x0fff, big.
        let down = Descriptor::new(0x0040_9600_0000_0fff);
        assert!(stack_frame_fits(&down, 0x2000, 20));
        assert!(!stack_frame_fits(&down, 0x1008, 20));
    }
}
