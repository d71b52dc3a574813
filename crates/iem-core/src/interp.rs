//! Decoding with `iced-x86` and the handlers for the instructions the
//! interpreter supports.
//!
//! Handlers run with RIP still addressing the instruction and its length in
//! `cb_instr`. They either fall through to the next instruction, transfer
//! control themselves, or deliver an event.

use iced_x86::{
    Code, Decoder, DecoderError, DecoderOptions, Instruction, MemorySize, Mnemonic, OpKind,
    Register,
};
use iem_mmu::is_canonical_48;
use tracing::{debug, trace};

use crate::far::FarKind;
use crate::mem::{Access, Align};
use crate::platform::Platform;
use crate::state::{
    gpr, mask_bits, CpuMode, SegReg, CR0_PE, CR0_PG, CR0_WP, CR4_PAE, CR4_PCIDE, CR4_PGE, CR4_PSE,
    EFER_LMA, EFER_LME, RFLAGS_DF, RFLAGS_IF, RFLAGS_OF,
};
use crate::status::{Exit, IemResult, Info};
use crate::vcpu::Vcpu;
use crate::xcpt::{XcptFlags, XCPT_BP, XCPT_DB, XCPT_OF};

/// How an instruction left RIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Continue with the following instruction.
    Next,
    /// The handler loaded RIP itself.
    Branch,
    /// A software interrupt was delivered.
    Event,
}

impl<P: Platform> Vcpu<P> {
    /// Decode the instruction at CS:RIP, reading the next code page when the
    /// decoder runs out of bytes.
    pub(crate) fn decode_current(&mut self) -> IemResult<Instruction> {
        self.prefetch_opcodes()?;
        loop {
            let (instr, error) = {
                let mut decoder = Decoder::with_ip(
                    self.state.bitness(),
                    self.fetch.bytes(),
                    self.state.rip(),
                    DecoderOptions::NONE,
                );
                let instr = decoder.decode();
                (instr, decoder.last_error())
            };
            match error {
                DecoderError::None => {
                    self.cb_instr = instr.len() as u8;
                    return Ok(instr);
                }
                DecoderError::NoMoreBytes => self.fetch_more_opcodes()?,
                _ => {
                    debug!(rip = self.state.rip(), bytes = ?self.fetch.bytes(), "invalid opcode");
                    return Err(self.raise_ud());
                }
            }
        }
    }

    /// Execute a decoded instruction.
    pub(crate) fn dispatch(&mut self, instr: &Instruction) -> IemResult<Step> {
        trace!(rip = self.state.rip(), code = ?instr.code(), "dispatch");
        let step = match instr.mnemonic() {
            Mnemonic::Nop => Step::Next,
            Mnemonic::Hlt => self.op_hlt()?,
            Mnemonic::Mov => self.op_mov(instr)?,
            Mnemonic::Push => self.op_push(instr)?,
            Mnemonic::Pop => self.op_pop(instr)?,
            Mnemonic::Jmp => self.op_jmp(instr)?,
            Mnemonic::Call if is_far(instr) => self.op_far(instr, FarKind::Call)?,
            Mnemonic::Int => {
                let vector = instr.immediate8();
                self.raise_xcpt_or_int(self.cb_instr, vector, XcptFlags::SOFT_INT, 0, 0)?;
                Step::Event
            }
            Mnemonic::Int3 => {
                let flags = XcptFlags::SOFT_INT | XcptFlags::BP_INSTR;
                self.raise_xcpt_or_int(self.cb_instr, XCPT_BP, flags, 0, 0)?;
                Step::Event
            }
            Mnemonic::Int1 => {
                let flags = XcptFlags::SOFT_INT | XcptFlags::ICEBP_INSTR;
                self.raise_xcpt_or_int(self.cb_instr, XCPT_DB, flags, 0, 0)?;
                Step::Event
            }
            Mnemonic::Into => {
                if !self.state.get_flag(RFLAGS_OF) {
                    Step::Next
                } else {
                    let flags = XcptFlags::SOFT_INT | XcptFlags::OF_INSTR;
                    self.raise_xcpt_or_int(self.cb_instr, XCPT_OF, flags, 0, 0)?;
                    Step::Event
                }
            }
            Mnemonic::Iret | Mnemonic::Iretd | Mnemonic::Iretq => {
                let op_bits = match instr.code() {
                    Code::Iretw => 16,
                    Code::Iretd => 32,
                    _ => 64,
                };
                self.iret(op_bits)?;
                Step::Branch
            }
            Mnemonic::Cli => {
                self.check_if_change()?;
                self.state.set_flag(RFLAGS_IF, false);
                Step::Next
            }
            Mnemonic::Sti => {
                self.check_if_change()?;
                if !self.state.get_flag(RFLAGS_IF) {
                    self.state.set_flag(RFLAGS_IF, true);
                    self.inhibit_after_this();
                }
                Step::Next
            }
            Mnemonic::Movsb => self.op_movsb(instr)?,
            Mnemonic::Xchg => self.op_xchg(instr)?,
            Mnemonic::Ud2 => return Err(self.raise_ud()),
            Mnemonic::Invlpg => {
                self.require_cpl0()?;
                let (seg, off) = self.memory_operand(instr)?;
                let base = seg.map_or(0, |s| self.state.segments.get(s).base);
                let linear = base.wrapping_add(off);
                debug!(linear, "invlpg");
                self.invalidate_tlb_page(linear);
                Step::Next
            }
            mnemonic => {
                debug!(?mnemonic, code = ?instr.code(), "instruction not handled");
                return Err(Exit::Unimplemented("instruction not handled by the interpreter"));
            }
        };
        if step == Step::Next {
            self.state.advance_rip(self.cb_instr as u64);
        }
        Ok(step)
    }

    fn op_hlt(&mut self) -> IemResult<Step> {
        self.require_cpl0()?;
        debug!(rip = self.state.rip(), "hlt");
        self.state.halted = true;
        self.pass_up = self.pass_up.merge(Info::Halt);
        Ok(Step::Next)
    }

    fn require_cpl0(&mut self) -> IemResult<()> {
        if self.state.cpl() != 0 {
            return Err(self.raise_gp(0));
        }
        Ok(())
    }

    /// CLI and STI need CPL <= IOPL in protected mode and IOPL 3 in V86 mode.
    fn check_if_change(&mut self) -> IemResult<()> {
        let allowed = match self.state.mode {
            CpuMode::Real => true,
            CpuMode::Vm86 => self.state.iopl() == 3,
            CpuMode::Protected | CpuMode::Long => self.state.cpl() <= self.state.iopl(),
        };
        if !allowed {
            return Err(self.raise_gp(0));
        }
        Ok(())
    }

    /// Block interrupts until the following instruction has retired.
    fn inhibit_after_this(&mut self) {
        let next = self.state.rip().wrapping_add(self.cb_instr as u64) & self.state.ip_mask();
        self.state.inhibit_shadow = Some(next);
    }

    fn op_mov(&mut self, instr: &Instruction) -> IemResult<Step> {
        let dst_reg = reg_operand(instr, 0);
        let src_reg = reg_operand(instr, 1);

        if let Some(cr) = dst_reg.filter(|r| r.is_cr()) {
            self.require_cpl0()?;
            let val = self.read_operand(instr, 1)?;
            self.write_cr(cr, val)?;
            return Ok(Step::Next);
        }
        if let Some(cr) = src_reg.filter(|r| r.is_cr()) {
            self.require_cpl0()?;
            let val = self.read_cr(cr)?;
            self.write_operand(instr, 0, val)?;
            return Ok(Step::Next);
        }
        if dst_reg.is_some_and(|r| r.is_dr()) || src_reg.is_some_and(|r| r.is_dr()) {
            return Err(Exit::Unimplemented("debug register moves"));
        }

        if let Some(sreg) = dst_reg.and_then(SegReg::from_register) {
            let sel = self.read_operand(instr, 1)? as u16;
            return self.load_sreg_for_mov(sreg, sel);
        }

        let val = self.read_operand(instr, 1)?;
        self.write_operand(instr, 0, val)?;
        Ok(Step::Next)
    }

    /// `MOV Sreg` and `POP Sreg`. Loading SS opens an interrupt shadow.
    fn load_sreg_for_mov(&mut self, sreg: SegReg, sel: u16) -> IemResult<Step> {
        match sreg {
            SegReg::Cs => return Err(self.raise_ud()),
            SegReg::Ss => {
                self.load_ss(sel)?;
                self.inhibit_after_this();
            }
            _ => self.load_data_sreg(sreg, sel)?,
        }
        Ok(Step::Next)
    }

    fn read_cr(&mut self, cr: Register) -> IemResult<u64> {
        let c = &self.state.control;
        Ok(match cr {
            Register::CR0 => c.cr0,
            Register::CR2 => c.cr2,
            Register::CR3 => c.cr3,
            Register::CR4 => c.cr4,
            _ => return Err(Exit::Unimplemented("control register")),
        })
    }

    fn write_cr(&mut self, cr: Register, val: u64) -> IemResult<()> {
        match cr {
            Register::CR0 => {
                let old = self.state.control.cr0;
                self.state.control.cr0 = val;
                if val & CR0_PG != 0 && self.state.control.efer & EFER_LME != 0 {
                    self.state.control.efer |= EFER_LMA;
                } else {
                    self.state.control.efer &= !EFER_LMA;
                }
                self.state.update_mode();
                if (old ^ val) & (CR0_PG | CR0_WP | CR0_PE) != 0 {
                    self.invalidate_tlb_all(true);
                }
                debug!(old, new = val, mode = ?self.state.mode, "cr0 load");
            }
            Register::CR2 => self.state.control.cr2 = val,
            Register::CR3 => self.set_cr3(val),
            Register::CR4 => {
                let old = self.state.control.cr4;
                self.state.control.cr4 = val;
                if (old ^ val) & (CR4_PGE | CR4_PAE | CR4_PSE | CR4_PCIDE) != 0 {
                    self.invalidate_tlb_all(true);
                }
                debug!(old, new = val, "cr4 load");
            }
            _ => return Err(Exit::Unimplemented("control register")),
        }
        Ok(())
    }

    fn op_push(&mut self, instr: &Instruction) -> IemResult<Step> {
        let len = (-instr.stack_pointer_increment()) as usize;
        let val = self.read_operand(instr, 0)?;
        self.push_sized(len, val)?;
        Ok(Step::Next)
    }

    fn op_pop(&mut self, instr: &Instruction) -> IemResult<Step> {
        let len = instr.stack_pointer_increment() as usize;
        let saved_rsp = self.state.gpr_u64(gpr::RSP);
        let val = self.pop_sized(len)?;

        // The stack pointer only moves once the destination has been written.
        let res = match reg_operand(instr, 0).and_then(SegReg::from_register) {
            Some(sreg) => self.load_sreg_for_mov(sreg, val as u16),
            None => self.write_operand(instr, 0, val).map(|()| Step::Next),
        };
        if res.is_err() {
            self.state.set_gpr_u64(gpr::RSP, saved_rsp);
        }
        res
    }

    fn op_jmp(&mut self, instr: &Instruction) -> IemResult<Step> {
        if is_far(instr) {
            return self.op_far(instr, FarKind::Jmp);
        }
        let target = match instr.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                instr.near_branch_target()
            }
            _ => self.read_operand(instr, 0)?,
        };
        self.near_branch(target)?;
        Ok(Step::Branch)
    }

    fn near_branch(&mut self, target: u64) -> IemResult<()> {
        if self.state.is_64bit_code() {
            if !is_canonical_48(target) {
                return Err(self.raise_gp(0));
            }
        } else if target > self.state.segments.cs.limit as u64 {
            debug!(target, limit = self.state.segments.cs.limit, "jump beyond CS limit");
            return Err(self.raise_gp(0));
        }
        self.state.set_rip(target);
        Ok(())
    }

    /// Far JMP or CALL through an immediate pointer or a memory operand.
    fn op_far(&mut self, instr: &Instruction, kind: FarKind) -> IemResult<Step> {
        let (sel, offset, op_bits) = match instr.op0_kind() {
            OpKind::FarBranch16 => (instr.far_branch_selector(), instr.far_branch16() as u64, 16),
            OpKind::FarBranch32 => (instr.far_branch_selector(), instr.far_branch32() as u64, 32),
            OpKind::Memory => {
                let size = instr.memory_size().size();
                let (seg, off) = self.memory_operand(instr)?;
                let token = self.mem_map(seg, off, size, Access::DATA_R, Align::NONE)?;
                let mut raw = [0u8; 10];
                raw[..size].copy_from_slice(self.mapped_mut(token)?);
                self.mem_commit(token)?;
                let off_len = size - 2;
                let mut off_bytes = [0u8; 8];
                off_bytes[..off_len].copy_from_slice(&raw[..off_len]);
                let sel = u16::from_le_bytes([raw[off_len], raw[off_len + 1]]);
                (sel, u64::from_le_bytes(off_bytes), (off_len * 8) as u32)
            }
            _ => return Err(Exit::Unimplemented("far branch operand")),
        };
        self.far_transfer(kind, sel, offset, op_bits)?;
        Ok(Step::Branch)
    }

    fn op_xchg(&mut self, instr: &Instruction) -> IemResult<Step> {
        if instr.op0_kind() == OpKind::Memory || instr.op1_kind() == OpKind::Memory {
            let reg = if instr.op0_kind() == OpKind::Memory {
                instr.op1_register()
            } else {
                instr.op0_register()
            };
            let size = instr.memory_size().size();
            let (seg, off) = self.memory_operand(instr)?;
            let token = self.mem_map(seg, off, size, Access::DATA_RW, Align::natural(size))?;
            let new = self.state.read_reg(reg);
            let mut old = [0u8; 8];
            {
                let buf = self.mapped_mut(token)?;
                old[..size].copy_from_slice(buf);
                buf.copy_from_slice(&new.to_le_bytes()[..size]);
            }
            self.mem_commit(token)?;
            self.state.write_reg(reg, u64::from_le_bytes(old));
        } else {
            let (a, b) = (instr.op0_register(), instr.op1_register());
            let (va, vb) = (self.state.read_reg(a), self.state.read_reg(b));
            self.state.write_reg(a, vb);
            self.state.write_reg(b, va);
        }
        Ok(Step::Next)
    }

    /// MOVSB, with or without REP.
    fn op_movsb(&mut self, instr: &Instruction) -> IemResult<Step> {
        let addr_bits = match instr.op0_kind() {
            OpKind::MemoryESDI => 16,
            OpKind::MemoryESEDI => 32,
            _ => 64,
        };
        let mask = mask_bits(addr_bits);
        let src_seg = SegReg::from_register(instr.memory_segment()).unwrap_or(SegReg::Ds);
        let step: u64 = if self.state.get_flag(RFLAGS_DF) {
            u64::MAX
        } else {
            1
        };
        let rep = instr.has_rep_prefix() || instr.has_repe_prefix();

        loop {
            let count = self.state.gpr_u64(gpr::RCX) & mask;
            if rep && count == 0 {
                break;
            }
            let si = self.state.gpr_u64(gpr::RSI) & mask;
            let di = self.state.gpr_u64(gpr::RDI) & mask;
            let byte = self.fetch_data_u8(src_seg, si)?;
            let es = if self.state.mode == CpuMode::Long {
                None
            } else {
                Some(SegReg::Es)
            };
            let token = self.mem_map(es, di, 1, Access::DATA_W, Align::NONE)?;
            self.mapped_mut(token)?[0] = byte;
            self.mem_commit(token)?;

            self.write_masked(gpr::RSI, si.wrapping_add(step), addr_bits);
            self.write_masked(gpr::RDI, di.wrapping_add(step), addr_bits);
            if !rep {
                break;
            }
            self.write_masked(gpr::RCX, count - 1, addr_bits);
        }
        Ok(Step::Next)
    }

    /// Write the low `bits` of a register the way an address-sized update does.
    fn write_masked(&mut self, index: usize, val: u64, bits: u32) {
        match bits {
            16 => self.state.write_gpr16(index, val as u16),
            32 => self.state.write_gpr32(index, val as u32),
            _ => self.state.set_gpr_u64(index, val),
        }
    }

    /// Segment and offset of the memory operand.
    ///
    /// In 64-bit mode only FS and GS contribute a base; the others are flat.
    pub(crate) fn memory_operand(&mut self, instr: &Instruction) -> IemResult<(Option<SegReg>, u64)> {
        let off = self.effective_address(instr);
        let seg = SegReg::from_register(instr.memory_segment());
        let seg = match seg {
            Some(s) if self.state.mode == CpuMode::Long => {
                matches!(s, SegReg::Fs | SegReg::Gs).then_some(s)
            }
            Some(s) => Some(s),
            None => return Err(Exit::Unimplemented("memory operand segment")),
        };
        Ok((seg, off))
    }

    fn effective_address(&self, instr: &Instruction) -> u64 {
        if instr.is_ip_rel_memory_operand() {
            return instr.ip_rel_memory_address();
        }
        let base = instr.memory_base();
        let index = instr.memory_index();
        let mut ea = instr.memory_displacement64();
        if base != Register::None {
            ea = ea.wrapping_add(self.state.read_reg(base));
        }
        if index != Register::None {
            ea = ea.wrapping_add(self.state.read_reg(index) * instr.memory_index_scale() as u64);
        }
        let addr_bits = if base != Register::None {
            base.size() as u32 * 8
        } else if index != Register::None {
            index.size() as u32 * 8
        } else {
            match instr.memory_displ_size() {
                2 => 16,
                4 if !self.state.is_64bit_code() => 32,
                1 | 4 | 8 => 64,
                _ => self.state.bitness(),
            }
        };
        ea & mask_bits(addr_bits)
    }

    fn read_operand(&mut self, instr: &Instruction, n: u32) -> IemResult<u64> {
        match instr.op_kind(n) {
            OpKind::Register => Ok(self.state.read_reg(instr.op_register(n))),
            OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Ok(instr.immediate(n)),
            OpKind::Memory => {
                let (seg, off) = self.memory_operand(instr)?;
                self.read_memory_sized(seg, off, instr.memory_size().size())
            }
            kind => {
                debug!(?kind, "operand kind not handled");
                Err(Exit::Unimplemented("operand kind"))
            }
        }
    }

    fn write_operand(&mut self, instr: &Instruction, n: u32, val: u64) -> IemResult<()> {
        match instr.op_kind(n) {
            OpKind::Register => {
                self.state.write_reg(instr.op_register(n), val);
                Ok(())
            }
            OpKind::Memory => {
                let (seg, off) = self.memory_operand(instr)?;
                let size = instr.memory_size().size();
                let token = self.mem_map(seg, off, size, Access::DATA_W, Align::natural(size))?;
                self.mapped_mut(token)?.copy_from_slice(&val.to_le_bytes()[..size]);
                self.mem_commit(token)
            }
            kind => {
                debug!(?kind, "destination kind not handled");
                Err(Exit::Unimplemented("operand kind"))
            }
        }
    }

    fn read_memory_sized(&mut self, seg: Option<SegReg>, off: u64, size: usize) -> IemResult<u64> {
        if size == 0 || size > 8 {
            return Err(Exit::Unimplemented("operand size"));
        }
        let token = self.mem_map(seg, off, size, Access::DATA_R, Align::natural(size))?;
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(self.mapped_mut(token)?);
        self.mem_commit(token)?;
        Ok(u64::from_le_bytes(raw))
    }
}

fn reg_operand(instr: &Instruction, n: u32) -> Option<Register> {
    (n < instr.op_count() && instr.op_kind(n) == OpKind::Register).then(|| instr.op_register(n))
}

fn is_far(instr: &Instruction) -> bool {
    matches!(instr.op0_kind(), OpKind::FarBranch16 | OpKind::FarBranch32)
        || (instr.op0_kind() == OpKind::Memory
            && matches!(
                instr.memory_size(),
                MemorySize::SegPtr16 | MemorySize::SegPtr32 | MemorySize::SegPtr64
            ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FlatBus;
    use crate::state::CpuState;

    fn run(cpu: &mut Vcpu<FlatBus>) -> IemResult<Step> {
        let instr = cpu.decode_current()?;
        cpu.dispatch(&instr)
    }

    fn flat(code: &[u8]) -> Vcpu<FlatBus> {
        let mut cpu = Vcpu::new(CpuState::new_protected_flat(), FlatBus::new(0x10_000));
        cpu.platform.load(0x1000, code);
        cpu.state.set_rip(0x1000);
        cpu.state.set_gpr_u64(gpr::RSP, 0x8000);
        cpu
    }

    #[test]
    fn mov_to_memory_and_back() {
        // mov dword [0x2000], 0x11223344 ; mov eax, [0x2000]
        let mut cpu = flat(&[
            0xc7, 0x05, 0x00, 0x20, 0x00, 0x00, 0x44, 0x33, 0x22, 0x11, 0xa1, 0x00, 0x20, 0x00,
            0x00,
        ]);
        run(&mut cpu).unwrap();
        assert_eq!(cpu.platform.slice(0x2000, 4), &[0x44, 0x33, 0x22, 0x11]);
        run(&mut cpu).unwrap();
        assert_eq!(cpu.state.read_gpr32(gpr::RAX), 0x1122_3344);
        assert_eq!(cpu.state.rip(), 0x100f);
    }

    #[test]
    fn push_pop_round_trip() {
        // push 0x1234 ; pop ebx
        let mut cpu = flat(&[0x68, 0x34, 0x12, 0x00, 0x00, 0x5b]);
        run(&mut cpu).unwrap();
        assert_eq!(cpu.state.gpr_u64(gpr::RSP), 0x7ffc);
        run(&mut cpu).unwrap();
        assert_eq!(cpu.state.read_gpr32(gpr::RBX), 0x1234);
        assert_eq!(cpu.state.gpr_u64(gpr::RSP), 0x8000);
    }

    #[test]
    fn sti_opens_an_interrupt_shadow() {
        let mut cpu = flat(&[0xfb, 0x90]);
        cpu.state.set_flag(RFLAGS_IF, false);
        run(&mut cpu).unwrap();
        assert!(cpu.state.get_flag(RFLAGS_IF));
        assert_eq!(cpu.state.inhibit_shadow, Some(0x1001));
    }

    #[test]
    fn rep_movsb_copies_forward() {
        let mut cpu = flat(&[0xf3, 0xa4]);
        cpu.platform.load(0x3000, b"hello");
        cpu.state.set_gpr_u64(gpr::RSI, 0x3000);
        cpu.state.set_gpr_u64(gpr::RDI, 0x4000);
        cpu.state.set_gpr_u64(gpr::RCX, 5);
        run(&mut cpu).unwrap();
        assert_eq!(cpu.platform.slice(0x4000, 5), b"hello");
        assert_eq!(cpu.state.gpr_u64(gpr::RCX), 0);
        assert_eq!(cpu.state.gpr_u64(gpr::RSI), 0x3005);
        assert_eq!(cpu.state.rip(), 0x1002);
    }

    #[test]
    fn xchg_with_memory() {
        // xchg [0x2000], ecx
        let mut cpu = flat(&[0x87, 0x0d, 0x00, 0x20, 0x00, 0x00]);
        cpu.platform.load(0x2000, &[1, 0, 0, 0]);
        cpu.state.set_gpr_u64(gpr::RCX, 7);
        run(&mut cpu).unwrap();
        assert_eq!(cpu.state.gpr_u64(gpr::RCX), 1);
        assert_eq!(cpu.platform.slice(0x2000, 4), &[7, 0, 0, 0]);
    }

    #[test]
    fn jmp_rel_past_cs_limit_faults() {
        let mut cpu = flat(&[0xeb, 0x10]);
        cpu.state.segments.cs.limit = 0x1008;
        let err = run(&mut cpu).unwrap_err();
        assert!(err.is_guest_event(), "{err:?}");
    }

    #[test]
    fn unsupported_instruction_is_reported() {
        // add eax, ebx
        let mut cpu = flat(&[0x01, 0xd8]);
        assert!(matches!(run(&mut cpu), Err(Exit::Unimplemented(_))));
    }

    #[test]
    fn hlt_outside_ring_zero_faults() {
        let mut cpu = flat(&[0xf4]);
        cpu.state.segments.ss.attr |= 3 << crate::state::ATTR_DPL_SHIFT;
        let err = run(&mut cpu).unwrap_err();
        assert!(err.is_guest_event());
        assert!(!cpu.state.halted);
    }
}
