//! Hardware task switching.

use tracing::debug;

use super::{XcptFlags, ERR_EXT, XCPT_TS};
use crate::desc::{is_null_selector, Descriptor, SEL_RPL_MASK, SEL_TI_LDT};
use crate::mem::{Access, Align};
use crate::platform::Platform;
use crate::state::{
    SegReg, Segment, ATTR_V86, CR0_PG, CR0_TS, DR7_LE_ALL, RFLAGS_LIVE_MASK, RFLAGS_NT,
    RFLAGS_RESERVED1, RFLAGS_VM, SEL_TYPE_ACCESSED, SEL_TYPE_CODE, SEL_TYPE_CONF, SEL_TYPE_READ,
    SEL_TYPE_WRITE, SYS_LDT, SYS_TSS_386_AVAIL, SYS_TSS_386_BUSY, SYS_TSS_BUSY_MASK,
};
use crate::status::IemResult;
use crate::vcpu::Vcpu;

/// What started a task switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSwitch {
    Jump,
    Call,
    Iret,
    /// Interrupt or exception through a task gate.
    IntXcpt,
}

/// Smallest legal limits of a 32-bit and a 16-bit TSS.
const TSS32_MIN_LIMIT: u32 = 0x67;
const TSS16_MIN_LIMIT: u32 = 0x2b;
/// Bytes of the outgoing TSS the switch writes, as a limit.
const TSS32_SAVE_LIMIT: u32 = 0x5f;
const TSS16_SAVE_LIMIT: u32 = 0x29;

/// Register image read from the incoming TSS.
#[derive(Debug, Clone, Copy, Default)]
struct TaskImage {
    cr3: u64,
    eip: u32,
    eflags: u32,
    gprs: [u32; 8],
    /// ES, CS, SS, DS, FS, GS in `SegReg` order.
    sregs: [u16; 6],
    ldt: u16,
}

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn put16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

fn put32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

impl TaskImage {
    fn parse_386(buf: &[u8]) -> Self {
        let mut gprs = [0u32; 8];
        for (i, r) in gprs.iter_mut().enumerate() {
            *r = le32(buf, 0x28 + 4 * i);
        }
        let mut sregs = [0u16; 6];
        for (i, s) in sregs.iter_mut().enumerate() {
            *s = le16(buf, 0x48 + 4 * i);
        }
        Self {
            cr3: le32(buf, 0x1c) as u64,
            eip: le32(buf, 0x20),
            eflags: le32(buf, 0x24),
            gprs,
            sregs,
            ldt: le16(buf, 0x60),
        }
    }

    fn parse_286(buf: &[u8]) -> Self {
        // 16-bit tasks leave the upper halves of the GPRs set.
        let mut gprs = [0u32; 8];
        for (i, r) in gprs.iter_mut().enumerate() {
            *r = 0xffff_0000 | le16(buf, 0x12 + 2 * i) as u32;
        }
        let mut sregs = [0u16; 6];
        // ES, CS, SS, DS; FS and GS do not exist.
        for (i, s) in sregs.iter_mut().take(4).enumerate() {
            *s = le16(buf, 0x22 + 2 * i);
        }
        Self {
            cr3: 0,
            eip: le16(buf, 0x0e) as u32,
            eflags: le16(buf, 0x10) as u32,
            gprs,
            sregs,
            ldt: le16(buf, 0x2a),
        }
    }
}

impl<P: Platform> Vcpu<P> {
    /// Switch to the task described by `tss_sel`/`tss_desc`.
    ///
    /// `next_eip` is the EIP saved for the outgoing task. Faults found after
    /// the new task's state is loaded are delivered in the new task.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn task_switch(
        &mut self,
        kind: TaskSwitch,
        next_eip: u32,
        flags: XcptFlags,
        err: u16,
        cr2: u64,
        tss_sel: u16,
        tss_desc: Descriptor,
    ) -> IemResult<()> {
        let new_is_386 = matches!(tss_desc.typ(), SYS_TSS_386_AVAIL | SYS_TSS_386_BUSY);
        let tss_err = tss_sel & !SEL_RPL_MASK;
        debug!(?kind, tss_sel, new_is_386, cur_tr = self.state.tr.selector, "task switch");

        if flags.contains(XcptFlags::CR2) {
            self.state.control.cr2 = cr2;
        }

        let new_min = if new_is_386 { TSS32_MIN_LIMIT } else { TSS16_MIN_LIMIT };
        if tss_desc.raw_limit() < new_min {
            debug!(tss_sel, limit = tss_desc.raw_limit(), "incoming TSS too small");
            return Err(self.raise_ts(tss_err));
        }
        let cur_min = if new_is_386 { TSS32_SAVE_LIMIT } else { TSS16_SAVE_LIMIT };
        if self.state.tr.limit < cur_min {
            debug!(limit = self.state.tr.limit, "outgoing TSS too small");
            return Err(self.raise_ts(tss_err));
        }

        // The incoming TSS stays mapped until its image has been read.
        let new_base = tss_desc.base();
        let new_len = new_min as usize + 1;
        let new_tss = self.mem_map(None, new_base, new_len, Access::SYS_RW, Align::NONE)?;

        let mut efl = self.state.rflags();
        if matches!(kind, TaskSwitch::Jump | TaskSwitch::Iret) {
            let cur_sel = self.state.tr.selector;
            self.update_tss_busy(cur_sel, false)?;
            if kind == TaskSwitch::Iret {
                efl &= !RFLAGS_NT;
            }
        }

        self.save_task_state(new_is_386, next_eip, efl as u32)?;

        if matches!(kind, TaskSwitch::Call | TaskSwitch::IntXcpt) {
            let link = self.state.tr.selector;
            put16(self.mapped_mut(new_tss)?, 0, link);
        }

        let img = {
            let buf = self.mapped_mut(new_tss)?;
            if new_is_386 {
                TaskImage::parse_386(buf)
            } else {
                TaskImage::parse_286(buf)
            }
        };
        self.mem_commit(new_tss)?;

        let mut new_attr = tss_desc.attr();
        if kind != TaskSwitch::Iret {
            self.update_tss_busy(tss_sel, true)?;
            new_attr |= SYS_TSS_BUSY_MASK;
        }

        // From here on the outgoing task is gone.
        self.state.tr = Segment {
            selector: tss_sel,
            base: new_base,
            limit: tss_desc.limit(),
            attr: new_attr,
        };
        let mut new_efl = img.eflags as u64;
        if matches!(kind, TaskSwitch::Call | TaskSwitch::IntXcpt) {
            new_efl |= RFLAGS_NT;
        }
        self.state.control.cr0 |= CR0_TS;
        self.state.set_rip(img.eip as u64);
        for (i, v) in img.gprs.iter().enumerate() {
            self.state.write_gpr32(i, *v);
        }
        self.state.set_rflags((new_efl & RFLAGS_LIVE_MASK) | RFLAGS_RESERVED1);
        for (sreg, sel) in SegReg::ALL.iter().zip(img.sregs) {
            *self.state.segments.get_mut(*sreg) = Segment::null(sel);
        }
        self.state.ldtr = Segment::null(img.ldt);

        if new_is_386 && self.state.control.cr0 & CR0_PG != 0 {
            self.set_cr3(img.cr3);
        }

        self.load_task_ldt(img.ldt)?;
        if new_efl & RFLAGS_VM != 0 {
            for (sreg, sel) in SegReg::ALL.iter().zip(img.sregs) {
                *self.state.segments.get_mut(*sreg) = Segment {
                    selector: sel,
                    base: (sel as u64) << 4,
                    limit: 0xffff,
                    attr: ATTR_V86,
                };
            }
            self.state.update_mode();
        } else {
            self.load_task_segments(&img)?;
        }

        self.state.dr[7] &= !DR7_LE_ALL;

        let ext = if kind == TaskSwitch::IntXcpt
            && (!flags.contains(XcptFlags::SOFT_INT) || flags.contains(XcptFlags::ICEBP_INSTR))
        {
            ERR_EXT
        } else {
            0
        };

        if flags.contains(XcptFlags::ERR) {
            let len: u32 = if new_is_386 { 4 } else { 2 };
            let ss = self.state.segments.ss;
            let esp = self.state.stack_ptr() as u32;
            let fits = if ss.is_expand_down() {
                esp.wrapping_sub(len) > ss.limit
            } else {
                esp >= len && esp - 1 <= ss.limit
            };
            if !fits {
                debug!(esp, limit = ss.limit, "no room for the error code on the new stack");
                return Err(self.raise_ss(ext));
            }
            if new_is_386 {
                self.push_u32(err as u32)?;
            } else {
                self.push_u16(err)?;
            }
        }

        if self.state.rip() > self.state.segments.cs.limit as u64 {
            debug!(eip = self.state.rip(), limit = self.state.segments.cs.limit, "new EIP beyond CS limit");
            return Err(self.raise_gp(ext));
        }
        Ok(())
    }

    /// Set or clear the busy bit of a TSS descriptor in the GDT.
    fn update_tss_busy(&mut self, sel: u16, busy: bool) -> IemResult<()> {
        let addr = self.state.gdtr.base + (sel & !7) as u64 + 5;
        let token = self.mem_map(None, addr, 1, Access::SYS_RW, Align::NONE)?;
        let byte = &mut self.mapped_mut(token)?[0];
        if busy {
            *byte |= SYS_TSS_BUSY_MASK as u8;
        } else {
            *byte &= !(SYS_TSS_BUSY_MASK as u8);
        }
        self.mem_commit(token)
    }

    /// Store the dynamic fields of the outgoing task into its TSS. The layout
    /// follows the incoming TSS type.
    fn save_task_state(&mut self, as_386: bool, eip: u32, eflags: u32) -> IemResult<()> {
        let base = self.state.tr.base;
        let seg = self.state.segments;
        let sels = [seg.es, seg.cs, seg.ss, seg.ds, seg.fs, seg.gs].map(|s| s.selector);
        let (off, len) = if as_386 { (0x20, 0x40) } else { (0x0e, 0x1c) };
        let token = self.mem_map(None, base + off, len, Access::SYS_RW, Align::NONE)?;
        let gprs: [u32; 8] = std::array::from_fn(|i| self.state.read_gpr32(i));
        let buf = self.mapped_mut(token)?;
        if as_386 {
            put32(buf, 0x00, eip);
            put32(buf, 0x04, eflags);
            for (i, v) in gprs.iter().enumerate() {
                put32(buf, 0x08 + 4 * i, *v);
            }
            for (i, s) in sels.iter().enumerate() {
                put16(buf, 0x28 + 4 * i, *s);
            }
        } else {
            put16(buf, 0x00, eip as u16);
            put16(buf, 0x02, eflags as u16);
            for (i, v) in gprs.iter().enumerate() {
                put16(buf, 0x04 + 2 * i, *v as u16);
            }
            for (i, s) in sels.iter().take(4).enumerate() {
                put16(buf, 0x14 + 2 * i, *s);
            }
        }
        self.mem_commit(token)
    }

    fn load_task_ldt(&mut self, ldt: u16) -> IemResult<()> {
        if is_null_selector(ldt) {
            self.state.ldtr = Segment::null(ldt);
            return Ok(());
        }
        let err = ldt & !SEL_RPL_MASK;
        if ldt & SEL_TI_LDT != 0 {
            return Err(self.raise_ts(err));
        }
        let desc = self.fetch_sel_desc(ldt, XCPT_TS)?;
        if !desc.is_present() || !desc.is_system() || desc.typ() != SYS_LDT {
            debug!(ldt, ty = desc.typ(), "bad LDT in the incoming TSS");
            return Err(self.raise_ts(err));
        }
        self.state.ldtr = desc.to_segment(ldt);
        Ok(())
    }

    /// Protected-mode segment loads for the incoming task, SS first so the new
    /// CPL is in force for the data segment checks.
    fn load_task_segments(&mut self, img: &TaskImage) -> IemResult<()> {
        let [es, cs, ss, ds, fs, gs] = img.sregs;
        let new_cpl = (cs & SEL_RPL_MASK) as u8;

        let ss_err = ss & !SEL_RPL_MASK;
        if is_null_selector(ss) {
            return Err(self.raise_ts(0));
        }
        let mut ss_desc = self.fetch_sel_desc(ss, XCPT_TS)?;
        if ss_desc.is_system()
            || ss_desc.typ() & (SEL_TYPE_CODE | SEL_TYPE_WRITE) != SEL_TYPE_WRITE
        {
            debug!(ss, ty = ss_desc.typ(), "task SS is not a writable data segment");
            return Err(self.raise_ts(ss_err));
        }
        if (ss & SEL_RPL_MASK) as u8 != new_cpl || ss_desc.dpl() != new_cpl {
            debug!(ss, new_cpl, dpl = ss_desc.dpl(), "task SS privilege mismatch");
            return Err(self.raise_ts(ss_err));
        }
        if !ss_desc.is_present() {
            return Err(self.raise_ss(ss_err));
        }
        if ss_desc.typ() & SEL_TYPE_ACCESSED == 0 {
            self.mark_sel_desc_accessed(ss)?;
            ss_desc.set_accessed();
        }
        self.state.segments.ss = ss_desc.to_segment(ss);
        self.state.update_mode();

        for (sreg, sel) in [(SegReg::Es, es), (SegReg::Ds, ds), (SegReg::Fs, fs), (SegReg::Gs, gs)] {
            self.load_task_data_sreg(sreg, sel, new_cpl)?;
        }

        let cs_err = cs & !SEL_RPL_MASK;
        if is_null_selector(cs) {
            return Err(self.raise_ts(0));
        }
        let cs_desc = self.fetch_sel_desc(cs, XCPT_TS)?;
        if !cs_desc.is_code() {
            debug!(cs, "task CS is not a code segment");
            return Err(self.raise_ts(cs_err));
        }
        let rpl = (cs & SEL_RPL_MASK) as u8;
        let conforming = cs_desc.typ() & SEL_TYPE_CONF != 0;
        if (conforming && cs_desc.dpl() > rpl) || (!conforming && cs_desc.dpl() != rpl) {
            debug!(cs, rpl, dpl = cs_desc.dpl(), "task CS privilege mismatch");
            return Err(self.raise_ts(cs_err));
        }
        if !cs_desc.is_present() {
            return Err(self.raise_np(cs_err));
        }
        self.commit_cs(cs, cs_desc, rpl)?;
        self.state.update_mode();
        Ok(())
    }

    fn load_task_data_sreg(&mut self, sreg: SegReg, sel: u16, cpl: u8) -> IemResult<()> {
        if is_null_selector(sel) {
            *self.state.segments.get_mut(sreg) = Segment::null(sel);
            return Ok(());
        }
        let err = sel & !SEL_RPL_MASK;
        let mut desc = self.fetch_sel_desc(sel, XCPT_TS)?;
        let ty = desc.typ();
        if desc.is_system() || (ty & SEL_TYPE_CODE != 0 && ty & SEL_TYPE_READ == 0) {
            debug!(sel, ty, ?sreg, "task data segment has the wrong type");
            return Err(self.raise_ts(err));
        }
        let conforming_code = ty & (SEL_TYPE_CODE | SEL_TYPE_CONF) == (SEL_TYPE_CODE | SEL_TYPE_CONF);
        if !conforming_code {
            let rpl = (sel & SEL_RPL_MASK) as u8;
            if rpl > desc.dpl() || cpl > desc.dpl() {
                debug!(sel, rpl, cpl, dpl = desc.dpl(), ?sreg, "task data segment privilege");
                return Err(self.raise_ts(err));
            }
        }
        if !desc.is_present() {
            return Err(self.raise_np(err));
        }
        if ty & SEL_TYPE_ACCESSED == 0 {
            self.mark_sel_desc_accessed(sel)?;
            desc.set_accessed();
        }
        *self.state.segments.get_mut(sreg) = desc.to_segment(sel);
        Ok(())
    }
}
