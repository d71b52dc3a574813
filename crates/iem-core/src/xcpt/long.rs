use iem_mmu::is_canonical_48;
use tracing::debug;

use super::{idt_error_code, XcptFlags, XCPT_GP};
use crate::desc::{is_null_selector, Descriptor, SEL_RPL_MASK};
use crate::mem::{Access, Align};
use crate::platform::Platform;
use crate::state::{
    gpr, Segment, ATTR_DPL_SHIFT, ATTR_UNUSABLE, RFLAGS_IF, RFLAGS_NT, RFLAGS_RF, RFLAGS_TF,
    RFLAGS_VM, SEL_TYPE_CONF, SYS_INT_GATE_386, SYS_TRAP_GATE_386,
};
use crate::status::IemResult;
use crate::vcpu::Vcpu;

impl<P: Platform> Vcpu<P> {
    /// Long-mode delivery through 16-byte IDT gates.
    pub(super) fn deliver_long(
        &mut self,
        cb_instr: u8,
        vector: u8,
        flags: XcptFlags,
        err: u16,
        cr2: u64,
    ) -> IemResult<()> {
        let idt_err = idt_error_code(vector);
        let idtr = self.state.idtr;
        let entry_off = (vector as u64) << 4;
        if (idtr.limit as u64) < entry_off + 15 {
            debug!(vector, limit = idtr.limit, "vector beyond the IDT limit");
            return Err(self.raise_gp(idt_err));
        }
        let low = self.read_sys_u64(idtr.base + entry_off)?;
        let high = self.read_sys_u64(idtr.base + entry_off + 8)?;
        let gate = Descriptor { raw: low, high };
        if !gate.is_system() {
            return Err(self.raise_gp(idt_err));
        }
        let mut clear = RFLAGS_TF | RFLAGS_NT | RFLAGS_RF | RFLAGS_VM;
        match gate.typ() {
            SYS_INT_GATE_386 => clear |= RFLAGS_IF,
            SYS_TRAP_GATE_386 => {}
            ty => {
                debug!(vector, ty, "bad 64-bit IDT gate type");
                return Err(self.raise_gp(idt_err));
            }
        }

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

        let cs_sel = gate.gate_selector();
        if is_null_selector(cs_sel) {
            return Err(self.raise_gp(0));
        }
        let cs_desc = self.fetch_sel_desc(cs_sel, XCPT_GP)?;
        let cs_err = cs_sel & !SEL_RPL_MASK;
        if !cs_desc.is_code() || !cs_desc.is_long() || cs_desc.is_big() {
            debug!(cs_sel, "gate target is not a 64-bit code segment");
            return Err(self.raise_gp(cs_err));
        }
        if cs_desc.dpl() > cpl {
            return Err(self.raise_gp(cs_err));
        }
        if !cs_desc.is_present() {
            return Err(self.raise_np(cs_err));
        }

        let new_rip = gate.gate_offset();
        if !is_canonical_48(new_rip) {
            debug!(new_rip, "non-canonical handler address");
            return Err(self.raise_gp(0));
        }

        let new_cpl = if cs_desc.typ() & SEL_TYPE_CONF != 0 {
            cpl
        } else {
            cs_desc.dpl()
        };
        let ist = gate.gate_ist();
        let old_rsp = self.state.gpr_u64(gpr::RSP);
        let stack = if new_cpl != cpl || ist != 0 {
            self.tss64_stack(new_cpl, ist)?
        } else {
            old_rsp
        };
        let rsp = stack & !0xf;

        let efl = self.pushed_eflags(flags);
        let mut ret_rip = self.state.rip();
        if flags.contains(XcptFlags::SOFT_INT) {
            ret_rip += cb_instr as u64;
        }
        let has_err = flags.contains(XcptFlags::ERR);
        let frame_len: u64 = if has_err { 48 } else { 40 };
        let frame_addr = rsp.wrapping_sub(frame_len);
        // A ring 3 handler's frame is a user access.
        let frame_access = if new_cpl == 3 {
            Access::STACK_W
        } else {
            Access::STACK_W | Access::SYS
        };
        let token = self.mem_map(None, frame_addr, frame_len as usize, frame_access, Align::NONE)?;
        {
            let old_cs = self.state.segments.cs.selector;
            let old_ss = self.state.segments.ss.selector;
            let mut slots = Vec::with_capacity(6);
            if has_err {
                slots.push(err as u64);
            }
            slots.push(ret_rip);
            slots.push(((old_cs & !SEL_RPL_MASK) | cpl as u16) as u64);
            slots.push(efl);
            slots.push(old_rsp);
            slots.push(old_ss as u64);
            let buf = self.mapped_mut(token)?;
            for (chunk, val) in buf.chunks_exact_mut(8).zip(slots) {
                chunk.copy_from_slice(&val.to_le_bytes());
            }
        }
        self.mem_commit(token)?;

        if new_cpl != cpl {
            self.state.segments.ss = Segment {
                selector: new_cpl as u16,
                base: 0,
                limit: 0xffff_ffff,
                attr: ATTR_UNUSABLE | ((new_cpl as u32) << ATTR_DPL_SHIFT),
            };
        }
        self.state.set_gpr_u64(gpr::RSP, frame_addr);
        self.commit_cs(cs_sel, cs_desc, new_cpl)?;
        self.state.set_rip(new_rip);
        self.state.set_rflags(efl & !clear);
        if flags.contains(XcptFlags::CR2) {
            self.state.control.cr2 = cr2;
        }
        self.state.update_mode();
        debug!(vector, cs = cs_sel, rip = new_rip, new_cpl, ist, "handler entered");

        self.finish_delivery(vector, flags)
    }

    /// Stack pointer from the 64-bit TSS: RSPn for a privilege change, or an IST slot.
    fn tss64_stack(&mut self, new_cpl: u8, ist: u8) -> IemResult<u64> {
        let tr = self.state.tr;
        let off = if ist != 0 {
            (ist as u32 - 1) * 8 + 0x24
        } else {
            new_cpl as u32 * 8 + 4
        };
        if off + 7 > tr.limit {
            debug!(off, limit = tr.limit, ist, "64-bit TSS too small for the stack slot");
            return Err(self.raise_ts(tr.selector & !SEL_RPL_MASK));
        }
        self.read_sys_u64(tr.base + off as u64)
    }
}
