//! Instruction byte fetching.
//!
//! The bytes of the next instruction are read through the code TLB into a
//! 15-byte buffer. The physical page behind the current code page is cached
//! together with the CPL and the physical revision it was resolved under, so
//! straight-line code does not hit the TLB for every instruction.

use iem_mmu::{is_canonical_48, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use tracing::trace;

use crate::mem::Access;
use crate::platform::Platform;
use crate::status::{Exit, IemResult};
use crate::vcpu::Vcpu;

/// Longest legal x86 instruction.
pub const MAX_INSTR_LEN: usize = 15;

/// A resolved code page and the virtual page-number range it stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CodePage {
    linear_page: u64,
    phys_page: u64,
    cpl: u8,
    phys_rev: u32,
    /// First and last 4K page numbers of the (possibly large) page.
    vpn_first: u64,
    vpn_last: u64,
}

impl CodePage {
    #[inline]
    fn covers(&self, vpn: u64) -> bool {
        (self.vpn_first..=self.vpn_last).contains(&vpn)
    }
}

/// Prefetched instruction bytes.
#[derive(Debug, Clone, Default)]
pub struct OpcodeBuf {
    bytes: [u8; MAX_INSTR_LEN],
    len: usize,
    /// Linear address of `bytes[0]`.
    linear: u64,
    page: Option<CodePage>,
    /// Page holding the tail of an instruction that straddles a page boundary.
    next_page: Option<CodePage>,
}

impl OpcodeBuf {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn flush(&mut self) {
        self.len = 0;
        self.page = None;
        self.next_page = None;
    }

    /// Whether the cached pages translate the 4K page `vpn`.
    pub fn covers(&self, vpn: u64) -> bool {
        self.page.is_some_and(|p| p.covers(vpn)) || self.next_page.is_some_and(|p| p.covers(vpn))
    }
}

impl<P: Platform> Vcpu<P> {
    /// Read the bytes at CS:RIP into the opcode buffer, up to the end of the
    /// page, the CS limit, or 15 bytes.
    pub(crate) fn prefetch_opcodes(&mut self) -> IemResult<()> {
        let rip = self.state.rip();
        let (linear, avail) = self.code_linear(rip)?;
        let in_page = (PAGE_SIZE - (linear & !PAGE_MASK)) as usize;
        let n = MAX_INSTR_LEN.min(in_page).min(avail);

        let page = self.code_page(linear, false)?;
        let paddr = page.phys_page | (linear & !PAGE_MASK);
        self.read_code(paddr, 0, n)?;
        self.fetch.len = n;
        self.fetch.linear = linear;
        self.fetch.next_page = None;
        trace!(rip, linear, n, "opcode prefetch");
        Ok(())
    }

    /// Append bytes from the following page once the decoder ran out.
    ///
    /// Raises #GP(0) when the instruction would exceed 15 bytes or the CS limit.
    pub(crate) fn fetch_more_opcodes(&mut self) -> IemResult<()> {
        let have = self.fetch.len;
        if have >= MAX_INSTR_LEN {
            return Err(self.raise_gp(0));
        }
        let next_off = self.state.rip().wrapping_add(have as u64);
        let (linear, avail) = self.code_linear(next_off)?;
        if linear & !PAGE_MASK != 0 {
            // The prefetch stopped at the CS limit, not at a page boundary.
            return Err(self.raise_gp(0));
        }
        let n = (MAX_INSTR_LEN - have).min(avail);
        let page = self.code_page(linear, true)?;
        self.read_code(page.phys_page, have, n)?;
        self.fetch.len = have + n;
        trace!(linear, n, "opcode fetch across page boundary");
        Ok(())
    }

    /// Linear address of CS:`off` and how many bytes the CS limit allows from there.
    fn code_linear(&mut self, off: u64) -> IemResult<(u64, usize)> {
        if self.state.is_64bit_code() {
            if !is_canonical_48(off) {
                return Err(self.raise_gp(0));
            }
            return Ok((off, MAX_INSTR_LEN));
        }
        let cs = self.state.segments.cs;
        let off = off & 0xffff_ffff;
        if off > cs.limit as u64 {
            return Err(self.raise_gp(0));
        }
        let avail = (cs.limit as u64 - off + 1).min(MAX_INSTR_LEN as u64) as usize;
        Ok((cs.base.wrapping_add(off) & 0xffff_ffff, avail))
    }

    /// Resolve the code page holding `linear`, reusing the cached one when still valid.
    fn code_page(&mut self, linear: u64, second: bool) -> IemResult<CodePage> {
        let cpl = self.state.cpl();
        let live = self.tlb.code.phys_rev();
        let cached = if second {
            self.fetch.next_page
        } else {
            self.fetch.page
        };
        if let Some(p) = cached {
            if p.linear_page == linear & PAGE_MASK && p.cpl == cpl && p.phys_rev == live {
                return Ok(p);
            }
        }

        let r = self.translate(linear, 1, Access::EXEC | Access::CODE | Access::READ)?;
        let vpn = linear >> PAGE_SHIFT;
        let page = CodePage {
            linear_page: linear & PAGE_MASK,
            phys_page: r.paddr & PAGE_MASK,
            cpl,
            phys_rev: self.tlb.code.phys_rev(),
            vpn_first: vpn & !r.large_mask,
            vpn_last: vpn | r.large_mask,
        };
        if second {
            self.fetch.next_page = Some(page);
        } else {
            self.fetch.page = Some(page);
        }
        Ok(page)
    }

    fn read_code(&mut self, paddr: u64, at: usize, n: usize) -> IemResult<()> {
        let dst = &mut self.fetch.bytes[at..at + n];
        if !self.platform.read_phys(paddr, dst).is_success() {
            return Err(Exit::PhysAccess(paddr));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FlatBus;
    use crate::state::CpuState;

    fn vcpu() -> Vcpu<FlatBus> {
        Vcpu::new(CpuState::new_protected_flat(), FlatBus::new(0x10_000))
    }

    #[test]
    fn prefetch_stops_at_the_page_end() {
        let mut cpu = vcpu();
        cpu.platform.load(0x1ffc, &[0x90, 0x90, 0x90, 0x90]);
        cpu.platform.load(0x2000, &[0xcc]);
        cpu.state.set_rip(0x1ffc);
        cpu.prefetch_opcodes().unwrap();
        assert_eq!(cpu.fetch.bytes(), &[0x90; 4]);

        cpu.fetch_more_opcodes().unwrap();
        assert_eq!(cpu.fetch.bytes().len(), 15);
        assert_eq!(cpu.fetch.bytes()[4], 0xcc);
        assert!(cpu.fetch.covers(0x1));
        assert!(cpu.fetch.covers(0x2));
    }

    #[test]
    fn code_page_is_reused_until_invalidated() {
        let mut cpu = vcpu();
        cpu.state.set_rip(0x100);
        cpu.prefetch_opcodes().unwrap();
        let misses = cpu.tlb.code.stats().misses;
        cpu.state.set_rip(0x200);
        cpu.prefetch_opcodes().unwrap();
        assert_eq!(cpu.tlb.code.stats().misses, misses);

        cpu.invalidate_tlb_page(0x200);
        assert!(!cpu.fetch.covers(0));
        cpu.prefetch_opcodes().unwrap();
        assert_eq!(cpu.tlb.code.stats().misses, misses + 1);
    }

    #[test]
    fn fetch_past_cs_limit_faults() {
        let mut cpu = vcpu();
        cpu.state.segments.cs.limit = 0x104;
        cpu.state.set_rip(0x100);
        cpu.prefetch_opcodes().unwrap();
        assert_eq!(cpu.fetch.bytes().len(), 5);
        // No IDT: the #GP escalates all the way to a shutdown.
        let err = cpu.fetch_more_opcodes().unwrap_err();
        assert!(err.is_guest_event(), "{err:?}");
    }
}
