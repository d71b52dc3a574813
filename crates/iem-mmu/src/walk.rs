use crate::{
    is_canonical_48, AccessType, FaultReason, MemoryBus, PageFault, TranslateFault, CR0_PG,
    CR0_WP, CR4_PAE, CR4_PCIDE, CR4_PGE, CR4_PSE, EFER_LMA, EFER_NXE, PTE_A, PTE_D, PTE_G, PTE_NX,
    PTE_P, PTE_PS, PTE_RW, PTE_US,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size4M,
    Size1G,
}

impl PageSize {
    #[inline]
    pub const fn bytes(self) -> u64 {
        match self {
            PageSize::Size4K => 4 * 1024,
            PageSize::Size2M => 2 * 1024 * 1024,
            PageSize::Size4M => 4 * 1024 * 1024,
            PageSize::Size1G => 1024 * 1024 * 1024,
        }
    }

    /// Mask of the 4K page-number bits that lie inside one page of this size.
    #[inline]
    pub const fn vpn_mask(self) -> u64 {
        (self.bytes() >> 12) - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    Disabled,
    Legacy32,
    Pae,
    Long4,
}

/// Control-register snapshot the walker needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagingContext {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

impl PagingContext {
    pub fn mode(&self) -> PagingMode {
        if self.cr0 & CR0_PG == 0 {
            PagingMode::Disabled
        } else if self.efer & EFER_LMA != 0 {
            PagingMode::Long4
        } else if self.cr4 & CR4_PAE != 0 {
            PagingMode::Pae
        } else {
            PagingMode::Legacy32
        }
    }

    /// NX is only meaningful with 64-bit paging structures.
    #[inline]
    pub fn nx_enabled(&self) -> bool {
        self.efer & EFER_NXE != 0 && matches!(self.mode(), PagingMode::Pae | PagingMode::Long4)
    }

    #[inline]
    pub fn write_protect(&self) -> bool {
        self.cr0 & CR0_WP != 0
    }

    #[inline]
    pub fn global_pages(&self) -> bool {
        self.cr4 & CR4_PGE != 0
    }

    /// Address-space id used to tag non-global TLB entries.
    #[inline]
    pub fn pcid(&self) -> u16 {
        if self.cr4 & CR4_PCIDE != 0 && self.mode() == PagingMode::Long4 {
            (self.cr3 & 0xfff) as u16
        } else {
            0
        }
    }
}

/// Result of a successful walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub paddr: u64,
    pub page_size: PageSize,
    pub user: bool,
    pub writable: bool,
    pub no_exec: bool,
    pub dirty: bool,
    pub global: bool,
    /// Physical address of the leaf entry, for setting the dirty bit later.
    pub leaf_addr: u64,
    pub leaf_wide: bool,
}

impl Translation {
    fn identity(vaddr: u64) -> Self {
        Self {
            paddr: vaddr,
            page_size: PageSize::Size4K,
            user: true,
            writable: true,
            no_exec: false,
            dirty: true,
            global: false,
            leaf_addr: 0,
            leaf_wide: false,
        }
    }
}

const ADDR_MASK_52: u64 = 0x000f_ffff_ffff_f000;
// Bits 52..=62 are available to software in 64-bit entries.
const IGNORED_HIGH: u64 = 0x7ff << 52;
const LEGACY32_4MB_RESERVED_MASK: u64 = 0x003f_e000;
const PDPTE_PAE_RESERVED: u64 = (1 << 1) | (1 << 2) | (0xf << 5);

/// Translate `vaddr` by walking the guest page tables.
///
/// Accessed bits are set on every entry visited. The dirty bit is left alone;
/// the caller sets it through [`mark_dirty`] once the write has passed the
/// permission checks.
pub fn walk<B: MemoryBus + ?Sized>(
    bus: &mut B,
    ctx: &PagingContext,
    vaddr: u64,
    _access: AccessType,
) -> Result<Translation, TranslateFault> {
    match ctx.mode() {
        PagingMode::Disabled => Ok(Translation::identity(vaddr & 0xffff_ffff)),
        PagingMode::Legacy32 => walk_legacy32(bus, ctx, vaddr).map_err(Into::into),
        PagingMode::Pae => walk_pae(bus, ctx, vaddr).map_err(Into::into),
        PagingMode::Long4 => {
            if !is_canonical_48(vaddr) {
                return Err(TranslateFault::NonCanonical(vaddr));
            }
            walk_long4(bus, ctx, vaddr).map_err(Into::into)
        }
    }
}

/// Set the dirty bit in the leaf entry a translation came from.
pub fn mark_dirty<B: MemoryBus + ?Sized>(bus: &mut B, t: &Translation) {
    if t.dirty {
        return;
    }
    if t.leaf_wide {
        let e = bus.read_u64(t.leaf_addr);
        bus.write_u64(t.leaf_addr, e | PTE_D);
    } else {
        let e = bus.read_u32(t.leaf_addr);
        bus.write_u32(t.leaf_addr, e | PTE_D as u32);
    }
}

#[inline]
fn touch32<B: MemoryBus + ?Sized>(bus: &mut B, addr: u64, entry: u64) {
    if entry & PTE_A == 0 {
        bus.write_u32(addr, (entry | PTE_A) as u32);
    }
}

#[inline]
fn touch64<B: MemoryBus + ?Sized>(bus: &mut B, addr: u64, entry: u64) {
    if entry & PTE_A == 0 {
        bus.write_u64(addr, entry | PTE_A);
    }
}

fn walk_legacy32<B: MemoryBus + ?Sized>(
    bus: &mut B,
    ctx: &PagingContext,
    vaddr: u64,
) -> Result<Translation, PageFault> {
    let vaddr = vaddr & 0xffff_ffff;
    let not_present = PageFault::new(vaddr, FaultReason::NotPresent);

    let pde_addr = (ctx.cr3 & 0xffff_f000) + ((vaddr >> 22) & 0x3ff) * 4;
    let pde = bus.read_u32(pde_addr) as u64;
    if pde & PTE_P == 0 {
        return Err(not_present);
    }

    if pde & PTE_PS != 0 && ctx.cr4 & CR4_PSE != 0 {
        if pde & LEGACY32_4MB_RESERVED_MASK != 0 {
            return Err(PageFault::new(vaddr, FaultReason::ReservedBits));
        }
        touch32(bus, pde_addr, pde);
        return Ok(Translation {
            paddr: (pde & 0xffc0_0000) | (vaddr & 0x003f_ffff),
            page_size: PageSize::Size4M,
            user: pde & PTE_US != 0,
            writable: pde & PTE_RW != 0,
            no_exec: false,
            dirty: pde & PTE_D != 0,
            global: pde & PTE_G != 0 && ctx.global_pages(),
            leaf_addr: pde_addr,
            leaf_wide: false,
        });
    }
    touch32(bus, pde_addr, pde);

    let pte_addr = (pde & 0xffff_f000) + ((vaddr >> 12) & 0x3ff) * 4;
    let pte = bus.read_u32(pte_addr) as u64;
    if pte & PTE_P == 0 {
        return Err(not_present);
    }
    touch32(bus, pte_addr, pte);

    Ok(Translation {
        paddr: (pte & 0xffff_f000) | (vaddr & 0xfff),
        page_size: PageSize::Size4K,
        user: pde & pte & PTE_US != 0,
        writable: pde & pte & PTE_RW != 0,
        no_exec: false,
        dirty: pte & PTE_D != 0,
        global: pte & PTE_G != 0 && ctx.global_pages(),
        leaf_addr: pte_addr,
        leaf_wide: false,
    })
}

/// Reserved-bit check for a present 64-bit paging-structure entry.
fn reserved64(ctx: &PagingContext, entry: u64, large_shift: Option<u32>) -> bool {
    if entry & PTE_NX != 0 && !ctx.nx_enabled() {
        return true;
    }
    let mut allowed = ADDR_MASK_52 | 0xfff | IGNORED_HIGH | PTE_NX;
    if let Some(shift) = large_shift {
        // PAT lives in bit 12; the rest of the low address bits must be zero.
        let low = ((1u64 << shift) - 1) & !0x1fff;
        allowed &= !low;
    }
    entry & !allowed != 0
}

fn walk_pae<B: MemoryBus + ?Sized>(
    bus: &mut B,
    ctx: &PagingContext,
    vaddr: u64,
) -> Result<Translation, PageFault> {
    let vaddr = vaddr & 0xffff_ffff;
    let not_present = PageFault::new(vaddr, FaultReason::NotPresent);
    let rsvd = PageFault::new(vaddr, FaultReason::ReservedBits);

    let pdpte_addr = (ctx.cr3 & 0xffff_ffe0) + ((vaddr >> 30) & 0x3) * 8;
    let pdpte = bus.read_u64(pdpte_addr);
    if pdpte & PTE_P == 0 {
        return Err(not_present);
    }
    if pdpte & PDPTE_PAE_RESERVED != 0 || pdpte & PTE_NX != 0 || pdpte & !(ADDR_MASK_52 | 0xfff) != 0
    {
        return Err(rsvd);
    }

    let pde_addr = (pdpte & ADDR_MASK_52) + ((vaddr >> 21) & 0x1ff) * 8;
    let pde = bus.read_u64(pde_addr);
    if pde & PTE_P == 0 {
        return Err(not_present);
    }
    let large = pde & PTE_PS != 0;
    if reserved64(ctx, pde, large.then_some(21)) {
        return Err(rsvd);
    }
    touch64(bus, pde_addr, pde);

    let nxe = ctx.nx_enabled();
    if large {
        return Ok(Translation {
            paddr: (pde & ADDR_MASK_52 & !0x1f_ffff) | (vaddr & 0x1f_ffff),
            page_size: PageSize::Size2M,
            user: pde & PTE_US != 0,
            writable: pde & PTE_RW != 0,
            no_exec: nxe && pde & PTE_NX != 0,
            dirty: pde & PTE_D != 0,
            global: pde & PTE_G != 0 && ctx.global_pages(),
            leaf_addr: pde_addr,
            leaf_wide: true,
        });
    }

    let pte_addr = (pde & ADDR_MASK_52) + ((vaddr >> 12) & 0x1ff) * 8;
    let pte = bus.read_u64(pte_addr);
    if pte & PTE_P == 0 {
        return Err(not_present);
    }
    if reserved64(ctx, pte, None) {
        return Err(rsvd);
    }
    touch64(bus, pte_addr, pte);

    Ok(Translation {
        paddr: (pte & ADDR_MASK_52) | (vaddr & 0xfff),
        page_size: PageSize::Size4K,
        user: pde & pte & PTE_US != 0,
        writable: pde & pte & PTE_RW != 0,
        no_exec: nxe && (pde | pte) & PTE_NX != 0,
        dirty: pte & PTE_D != 0,
        global: pte & PTE_G != 0 && ctx.global_pages(),
        leaf_addr: pte_addr,
        leaf_wide: true,
    })
}

fn walk_long4<B: MemoryBus + ?Sized>(
    bus: &mut B,
    ctx: &PagingContext,
    vaddr: u64,
) -> Result<Translation, PageFault> {
    let not_present = PageFault::new(vaddr, FaultReason::NotPresent);
    let rsvd = PageFault::new(vaddr, FaultReason::ReservedBits);
    let nxe = ctx.nx_enabled();

    let pml4e_addr = (ctx.cr3 & ADDR_MASK_52) + ((vaddr >> 39) & 0x1ff) * 8;
    let pml4e = bus.read_u64(pml4e_addr);
    if pml4e & PTE_P == 0 {
        return Err(not_present);
    }
    if pml4e & PTE_PS != 0 || reserved64(ctx, pml4e, None) {
        return Err(rsvd);
    }
    touch64(bus, pml4e_addr, pml4e);

    let mut user = pml4e & PTE_US != 0;
    let mut writable = pml4e & PTE_RW != 0;
    let mut no_exec = nxe && pml4e & PTE_NX != 0;

    let pdpte_addr = (pml4e & ADDR_MASK_52) + ((vaddr >> 30) & 0x1ff) * 8;
    let pdpte = bus.read_u64(pdpte_addr);
    if pdpte & PTE_P == 0 {
        return Err(not_present);
    }
    let huge = pdpte & PTE_PS != 0;
    if reserved64(ctx, pdpte, huge.then_some(30)) {
        return Err(rsvd);
    }
    touch64(bus, pdpte_addr, pdpte);
    user &= pdpte & PTE_US != 0;
    writable &= pdpte & PTE_RW != 0;
    no_exec |= nxe && pdpte & PTE_NX != 0;

    if huge {
        return Ok(Translation {
            paddr: (pdpte & ADDR_MASK_52 & !0x3fff_ffff) | (vaddr & 0x3fff_ffff),
            page_size: PageSize::Size1G,
            user,
            writable,
            no_exec,
            dirty: pdpte & PTE_D != 0,
            global: pdpte & PTE_G != 0 && ctx.global_pages(),
            leaf_addr: pdpte_addr,
            leaf_wide: true,
        });
    }

    let pde_addr = (pdpte & ADDR_MASK_52) + ((vaddr >> 21) & 0x1ff) * 8;
    let pde = bus.read_u64(pde_addr);
    if pde & PTE_P == 0 {
        return Err(not_present);
    }
    let large = pde & PTE_PS != 0;
    if reserved64(ctx, pde, large.then_some(21)) {
        return Err(rsvd);
    }
    touch64(bus, pde_addr, pde);
    user &= pde & PTE_US != 0;
    writable &= pde & PTE_RW != 0;
    no_exec |= nxe && pde & PTE_NX != 0;

    if large {
        return Ok(Translation {
            paddr: (pde & ADDR_MASK_52 & !0x1f_ffff) | (vaddr & 0x1f_ffff),
            page_size: PageSize::Size2M,
            user,
            writable,
            no_exec,
            dirty: pde & PTE_D != 0,
            global: pde & PTE_G != 0 && ctx.global_pages(),
            leaf_addr: pde_addr,
            leaf_wide: true,
        });
    }

    let pte_addr = (pde & ADDR_MASK_52) + ((vaddr >> 12) & 0x1ff) * 8;
    let pte = bus.read_u64(pte_addr);
    if pte & PTE_P == 0 {
        return Err(not_present);
    }
    if reserved64(ctx, pte, None) {
        return Err(rsvd);
    }
    touch64(bus, pte_addr, pte);

    Ok(Translation {
        paddr: (pte & ADDR_MASK_52) | (vaddr & 0xfff),
        page_size: PageSize::Size4K,
        user: user && pte & PTE_US != 0,
        writable: writable && pte & PTE_RW != 0,
        no_exec: no_exec || nxe && pte & PTE_NX != 0,
        dirty: pte & PTE_D != 0,
        global: pte & PTE_G != 0 && ctx.global_pages(),
        leaf_addr: pte_addr,
        leaf_wide: true,
    })
}
