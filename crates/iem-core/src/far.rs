//! Far JMP and far CALL.

use iem_mmu::is_canonical_48;
use tracing::debug;

use crate::desc::{is_null_selector, Descriptor, SEL_RPL_MASK, SEL_TI_LDT};
use crate::platform::Platform;
use crate::state::{
    mask_bits, CpuMode, SegReg, SEL_TYPE_CONF, SYS_CALL_GATE_286, SYS_CALL_GATE_386,
    SYS_TASK_GATE, SYS_TSS_286_AVAIL, SYS_TSS_286_BUSY, SYS_TSS_386_AVAIL, SYS_TSS_386_BUSY,
};
use crate::status::{Exit, IemResult};
use crate::vcpu::Vcpu;
use crate::xcpt::{TaskSwitch, XcptFlags, XCPT_GP};

/// Far JMP or far CALL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FarKind {
    Jmp,
    Call,
}

impl FarKind {
    fn task_switch(self) -> TaskSwitch {
        match self {
            FarKind::Jmp => TaskSwitch::Jump,
            FarKind::Call => TaskSwitch::Call,
        }
    }
}

impl<P: Platform> Vcpu<P> {
    /// Transfer to `sel:offset`. RIP still addresses the transferring
    /// instruction; its length is in `cb_instr`.
    pub(crate) fn far_transfer(
        &mut self,
        kind: FarKind,
        sel: u16,
        offset: u64,
        op_bits: u32,
    ) -> IemResult<()> {
        let next_ip = self.state.rip().wrapping_add(self.cb_instr as u64) & self.state.ip_mask();

        if matches!(self.state.mode, CpuMode::Real | CpuMode::Vm86) {
            let new_ip = offset & mask_bits(op_bits);
            if new_ip > self.state.segments.cs.limit as u64 {
                return Err(self.raise_gp(0));
            }
            if kind == FarKind::Call {
                self.push_return_address(next_ip, op_bits)?;
            }
            self.load_sreg_real(SegReg::Cs, sel);
            self.state.set_rip(new_ip);
            return Ok(());
        }

        if is_null_selector(sel) {
            debug!(?kind, "far transfer to a null selector");
            return Err(self.raise_gp(0));
        }
        let desc = self.fetch_sel_desc(sel, XCPT_GP)?;
        if desc.is_system() {
            return self.far_transfer_system(kind, sel, desc, next_ip);
        }

        let err = sel & !SEL_RPL_MASK;
        let cpl = self.state.cpl();
        if !desc.is_code() {
            debug!(sel, "far transfer to a data segment");
            return Err(self.raise_gp(err));
        }
        let rpl = (sel & SEL_RPL_MASK) as u8;
        if desc.typ() & SEL_TYPE_CONF != 0 {
            if desc.dpl() > cpl {
                return Err(self.raise_gp(err));
            }
        } else if rpl > cpl || desc.dpl() != cpl {
            debug!(sel, cpl, rpl, dpl = desc.dpl(), "far transfer privilege mismatch");
            return Err(self.raise_gp(err));
        }
        if !desc.is_present() {
            return Err(self.raise_np(err));
        }

        let to_64bit = self.state.mode == CpuMode::Long && desc.is_long() && !desc.is_big();
        let new_ip = if to_64bit {
            if !is_canonical_48(offset) {
                return Err(self.raise_gp(0));
            }
            offset
        } else {
            let ip = offset & mask_bits(op_bits.min(32));
            if ip > desc.limit() as u64 {
                debug!(ip, limit = desc.limit(), "far transfer beyond CS limit");
                return Err(self.raise_gp(0));
            }
            ip
        };

        if kind == FarKind::Call {
            self.push_return_address(next_ip, op_bits)?;
        }
        self.commit_cs(sel, desc, cpl)?;
        self.state.set_rip(new_ip);
        self.state.update_mode();
        Ok(())
    }

    /// Push CS and the return offset as one stack access.
    fn push_return_address(&mut self, next_ip: u64, op_bits: u32) -> IemResult<()> {
        let size = (op_bits / 8) as usize;
        let cs = self.state.segments.cs.selector as u64;
        let (token, new_sp) = self.stack_push_begin(2 * size)?;
        {
            let buf = self.mapped_mut(token)?;
            buf[..size].copy_from_slice(&next_ip.to_le_bytes()[..size]);
            buf[size..2 * size].copy_from_slice(&cs.to_le_bytes()[..size]);
        }
        self.stack_push_commit(token, new_sp)
    }

    fn far_transfer_system(
        &mut self,
        kind: FarKind,
        sel: u16,
        desc: Descriptor,
        next_ip: u64,
    ) -> IemResult<()> {
        let err = sel & !SEL_RPL_MASK;
        if self.state.mode == CpuMode::Long {
            if matches!(desc.typ(), SYS_CALL_GATE_286 | SYS_CALL_GATE_386) {
                return Err(Exit::Unimplemented("far transfer through a call gate"));
            }
            return Err(self.raise_gp(err));
        }
        let cpl = self.state.cpl();
        let rpl = (sel & SEL_RPL_MASK) as u8;
        match desc.typ() {
            SYS_TSS_286_AVAIL | SYS_TSS_386_AVAIL => {
                if desc.dpl() < cpl || desc.dpl() < rpl {
                    debug!(sel, cpl, rpl, dpl = desc.dpl(), "TSS not reachable from here");
                    return Err(self.raise_gp(err));
                }
                if !desc.is_present() {
                    return Err(self.raise_np(err));
                }
                self.task_switch(
                    kind.task_switch(),
                    next_ip as u32,
                    XcptFlags::empty(),
                    0,
                    0,
                    sel,
                    desc,
                )
            }
            SYS_TSS_286_BUSY | SYS_TSS_386_BUSY => {
                debug!(sel, "far transfer to a busy TSS");
                Err(self.raise_gp(err))
            }
            SYS_TASK_GATE => {
                if desc.dpl() < cpl || desc.dpl() < rpl {
                    return Err(self.raise_gp(err));
                }
                if !desc.is_present() {
                    return Err(self.raise_np(err));
                }
                let tss_sel = desc.gate_selector();
                let tss_err = tss_sel & !SEL_RPL_MASK;
                if tss_sel & SEL_TI_LDT != 0 {
                    return Err(self.raise_gp(tss_err));
                }
                let tss_desc = self.fetch_sel_desc(tss_sel, XCPT_GP)?;
                if !tss_desc.is_system()
                    || !matches!(tss_desc.typ(), SYS_TSS_286_AVAIL | SYS_TSS_386_AVAIL)
                {
                    debug!(tss_sel, ty = tss_desc.typ(), "task gate to a non-available TSS");
                    return Err(self.raise_gp(tss_err));
                }
                if !tss_desc.is_present() {
                    return Err(self.raise_np(tss_err));
                }
                self.task_switch(
                    kind.task_switch(),
                    next_ip as u32,
                    XcptFlags::empty(),
                    0,
                    0,
                    tss_sel,
                    tss_desc,
                )
            }
            SYS_CALL_GATE_286 | SYS_CALL_GATE_386 => {
                Err(Exit::Unimplemented("far transfer through a call gate"))
            }
            ty => {
                debug!(sel, ty, "far transfer to a system descriptor of the wrong type");
                Err(self.raise_gp(err))
            }
        }
    }
}
