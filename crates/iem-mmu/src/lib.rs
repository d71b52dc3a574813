//! Guest physical memory access, x86 page walking and the interpreter TLB.
//!
//! The walker covers the paging modes the interpreter has to emulate:
//! - No paging (identity mapping)
//! - 32-bit paging (4KB / 4MB pages)
//! - PAE paging (4KB / 2MB pages)
//! - 4-level long mode paging (4KB / 2MB / 1GB pages)
//!
//! The TLB does not cache permission *decisions*; it caches the permission bits
//! of the translation so that the access layer can re-check them against the
//! current privilege level on every hit.

mod tlb;
mod walk;

pub use tlb::{Tlb, TlbEntry, TlbFlags, TlbSet, TlbStats, TLB_ENTRY_PAIRS};
pub use walk::{mark_dirty, walk, PageSize, PagingContext, PagingMode, Translation};

pub const PAGE_SIZE: u64 = 0x1000;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);
pub const PAGE_SHIFT: u32 = 12;

/// Physical memory access used for page-table walking and guest data.
pub trait MemoryBus {
    fn read_u8(&mut self, paddr: u64) -> u8;
    fn read_u16(&mut self, paddr: u64) -> u16;
    fn read_u32(&mut self, paddr: u64) -> u32;
    fn read_u64(&mut self, paddr: u64) -> u64;

    fn write_u8(&mut self, paddr: u64, value: u8);
    fn write_u16(&mut self, paddr: u64, value: u16);
    fn write_u32(&mut self, paddr: u64, value: u32);
    fn write_u64(&mut self, paddr: u64, value: u64);

    /// Read a byte slice from physical memory.
    ///
    /// The default implementation falls back to byte-at-a-time reads via
    /// [`MemoryBus::read_u8`].
    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.read_u8(paddr.wrapping_add(i as u64));
        }
    }

    /// Write a byte slice to physical memory.
    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        for (i, byte) in src.iter().copied().enumerate() {
            self.write_u8(paddr.wrapping_add(i as u64), byte);
        }
    }
}

impl<T: MemoryBus + ?Sized> MemoryBus for &mut T {
    #[inline]
    fn read_u8(&mut self, paddr: u64) -> u8 {
        <T as MemoryBus>::read_u8(&mut **self, paddr)
    }

    #[inline]
    fn read_u16(&mut self, paddr: u64) -> u16 {
        <T as MemoryBus>::read_u16(&mut **self, paddr)
    }

    #[inline]
    fn read_u32(&mut self, paddr: u64) -> u32 {
        <T as MemoryBus>::read_u32(&mut **self, paddr)
    }

    #[inline]
    fn read_u64(&mut self, paddr: u64) -> u64 {
        <T as MemoryBus>::read_u64(&mut **self, paddr)
    }

    #[inline]
    fn write_u8(&mut self, paddr: u64, value: u8) {
        <T as MemoryBus>::write_u8(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u16(&mut self, paddr: u64, value: u16) {
        <T as MemoryBus>::write_u16(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u32(&mut self, paddr: u64, value: u32) {
        <T as MemoryBus>::write_u32(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u64(&mut self, paddr: u64, value: u64) {
        <T as MemoryBus>::write_u64(&mut **self, paddr, value)
    }

    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        <T as MemoryBus>::read_bytes(&mut **self, paddr, dst)
    }

    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        <T as MemoryBus>::write_bytes(&mut **self, paddr, src)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }

    #[inline]
    pub fn is_execute(self) -> bool {
        matches!(self, AccessType::Execute)
    }
}

/// Why a translation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    /// A paging-structure entry on the walk had P=0.
    NotPresent,
    /// A present entry had a reserved bit set.
    ReservedBits,
    /// The translation exists but forbids the access.
    Protection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub addr: u64,
    pub reason: FaultReason,
}

impl PageFault {
    #[inline]
    pub fn new(addr: u64, reason: FaultReason) -> Self {
        Self { addr, reason }
    }

    /// Architectural #PF error code for this fault.
    ///
    /// `report_fetch` selects whether instruction fetches set the I/D bit; the
    /// CPU only reports it when no-execute paging is active.
    pub fn error_code(&self, access: AccessType, is_user: bool, report_fetch: bool) -> u32 {
        let present = self.reason != FaultReason::NotPresent;
        let rsvd = self.reason == FaultReason::ReservedBits;
        pf_error_code(present, access, is_user, rsvd, report_fetch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateFault {
    PageFault(PageFault),
    NonCanonical(u64),
}

impl From<PageFault> for TranslateFault {
    fn from(value: PageFault) -> Self {
        Self::PageFault(value)
    }
}

pub const PF_ERR_P: u32 = 1 << 0;
pub const PF_ERR_RW: u32 = 1 << 1;
pub const PF_ERR_US: u32 = 1 << 2;
pub const PF_ERR_RSVD: u32 = 1 << 3;
pub const PF_ERR_ID: u32 = 1 << 4;

#[inline]
pub fn pf_error_code(
    present: bool,
    access: AccessType,
    is_user: bool,
    rsvd: bool,
    report_fetch: bool,
) -> u32 {
    let mut code = 0u32;
    if present {
        code |= PF_ERR_P;
    }
    if access.is_write() {
        code |= PF_ERR_RW;
    }
    if is_user {
        code |= PF_ERR_US;
    }
    if rsvd {
        code |= PF_ERR_RSVD;
    }
    if access.is_execute() && report_fetch {
        code |= PF_ERR_ID;
    }
    code
}

#[inline]
pub fn is_canonical_48(vaddr: u64) -> bool {
    // Bits 47..63 must be all zeros or all ones.
    (((vaddr >> 47).wrapping_add(1)) & 0x1fffe) == 0
}

pub const CR0_WP: u64 = 1 << 16;
pub const CR0_PG: u64 = 1 << 31;

pub const CR4_PSE: u64 = 1 << 4;
pub const CR4_PAE: u64 = 1 << 5;
pub const CR4_PGE: u64 = 1 << 7;
pub const CR4_PCIDE: u64 = 1 << 17;

pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NXE: u64 = 1 << 11;

pub const PTE_P: u64 = 1 << 0;
pub const PTE_RW: u64 = 1 << 1;
pub const PTE_US: u64 = 1 << 2;
pub const PTE_A: u64 = 1 << 5;
pub const PTE_D: u64 = 1 << 6;
pub const PTE_PS: u64 = 1 << 7;
pub const PTE_G: u64 = 1 << 8;
pub const PTE_NX: u64 = 1 << 63;
