//! Guest memory access: segmentation, translation through the TLB and the
//! map/commit/rollback protocol.
//!
//! Every access an instruction makes goes through [`Vcpu::mem_map`], which hands
//! out a [`MapToken`] for one of a small fixed number of slots. A slot either
//! refers to guest RAM in place, or owns a bounce buffer holding a private copy
//! of the bytes when the access straddles two pages or hits memory the platform
//! must see (MMIO, write-tracked pages, holes). Bounce buffers are written back
//! by [`Vcpu::mem_commit`]; [`Vcpu::mem_rollback`] drops them.

use bitflags::bitflags;
use iem_mmu::{
    is_canonical_48, mark_dirty, pf_error_code, AccessType, FaultReason, PageSize, TlbFlags,
    TranslateFault, CR4_PAE, EFER_NXE, PAGE_MASK, PAGE_SIZE,
};
use tracing::{debug, trace};

use crate::platform::{ForcedActions, PhysPageKind, Platform};
use crate::state::{CpuMode, SegReg, CR0_AM, CR0_WP, RFLAGS_AC};
use crate::status::{Exit, IemResult, Info, PhysStatus};
use crate::vcpu::Vcpu;
use crate::xcpt::{XcptFlags, XCPT_PF};

/// Concurrently open mappings one instruction may hold.
pub const MAPPING_SLOTS: usize = 3;
/// Largest single access (FXSAVE-sized).
pub const BOUNCE_BUFFER_SIZE: usize = 512;

bitflags! {
    /// What an access does and on whose behalf.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Access: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// The write does not cover every mapped byte; the buffer is loaded first.
        const PARTIAL_WRITE = 1 << 3;

        const DATA = 1 << 4;
        const STACK = 1 << 5;
        /// Implicit supervisor access to a system structure (GDT, LDT, IDT, TSS).
        const SYS = 1 << 6;
        const CODE = 1 << 7;

        const DATA_R = Self::DATA.bits() | Self::READ.bits();
        const DATA_W = Self::DATA.bits() | Self::WRITE.bits();
        const DATA_RW = Self::DATA.bits() | Self::READ.bits() | Self::WRITE.bits();
        const STACK_R = Self::STACK.bits() | Self::READ.bits();
        const STACK_W = Self::STACK.bits() | Self::WRITE.bits();
        const SYS_R = Self::SYS.bits() | Self::READ.bits();
        const SYS_W = Self::SYS.bits() | Self::WRITE.bits();
        const SYS_RW = Self::SYS.bits() | Self::READ.bits() | Self::WRITE.bits();
    }
}

impl Access {
    const TYPE_MASK: u32 = 0xf;

    #[inline]
    fn is_write(self) -> bool {
        self.contains(Access::WRITE)
    }

    #[inline]
    fn is_sys(self) -> bool {
        self.contains(Access::SYS)
    }

    fn access_type(self) -> AccessType {
        if self.contains(Access::EXEC) {
            AccessType::Execute
        } else if self.is_write() {
            AccessType::Write
        } else {
            AccessType::Read
        }
    }

    /// Whether the bytes currently in memory must be loaded into a bounce buffer.
    fn needs_load(self) -> bool {
        self.intersects(Access::READ | Access::EXEC | Access::PARTIAL_WRITE)
    }
}

/// Which fault a misaligned access raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignMode {
    /// #AC when alignment checking is active, otherwise nothing.
    Ac,
    /// #GP(0) unconditionally (SSE-style aligned operands).
    Gp,
    /// #AC for a dword-misaligned address under alignment checking, #GP(0) otherwise.
    GpOrAc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Align {
    pub mask: u64,
    pub mode: AlignMode,
}

impl Align {
    pub const NONE: Align = Align {
        mask: 0,
        mode: AlignMode::Ac,
    };

    /// Natural alignment of an operand of `len` bytes, checked via #AC.
    pub const fn natural(len: usize) -> Align {
        Align {
            mask: len as u64 - 1,
            mode: AlignMode::Ac,
        }
    }

    pub const fn gp(mask: u64) -> Align {
        Align {
            mask,
            mode: AlignMode::Gp,
        }
    }

    pub const fn gp_or_ac(mask: u64) -> Align {
        Align {
            mask,
            mode: AlignMode::GpOrAc,
        }
    }
}

/// Handle of an open mapping: slot index, a marker bit and the access type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapToken(u8);

impl MapToken {
    const VALID: u8 = 0x08;

    fn new(slot: usize, access: Access) -> Self {
        MapToken(slot as u8 | Self::VALID | (((access.bits() & Access::TYPE_MASK) as u8) << 4))
    }

    #[inline]
    pub fn raw(self) -> u8 {
        self.0
    }

    #[inline]
    fn slot(self) -> usize {
        (self.0 & 0x7) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BounceMap {
    first: u64,
    len1: usize,
    /// Physical address of the second page; only meaningful with `len2 != 0`.
    second: u64,
    len2: usize,
    unassigned: bool,
    pending_first: bool,
    pending_second: bool,
}

impl BounceMap {
    #[inline]
    fn is_pending(&self) -> bool {
        self.pending_first || self.pending_second
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Free,
    /// Guest RAM accessed in place.
    Direct { paddr: u64, len: usize },
    Bounce(BounceMap),
}

#[derive(Debug, Clone)]
struct MapSlot {
    kind: SlotKind,
    access: Access,
    buf: [u8; BOUNCE_BUFFER_SIZE],
}

impl Default for MapSlot {
    fn default() -> Self {
        Self {
            kind: SlotKind::Free,
            access: Access::empty(),
            buf: [0; BOUNCE_BUFFER_SIZE],
        }
    }
}

impl MapSlot {
    #[inline]
    fn is_active(&self) -> bool {
        match self.kind {
            SlotKind::Free => false,
            SlotKind::Direct { .. } => true,
            SlotKind::Bounce(b) => !b.is_pending(),
        }
    }
}

/// Mapping slots of one vCPU.
#[derive(Debug, Clone, Default)]
pub struct MemMappings {
    slots: [MapSlot; MAPPING_SLOTS],
}

impl MemMappings {
    /// Mappings opened and neither committed nor rolled back yet.
    pub fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_active()).count()
    }

    /// Slots holding a postponed write-back.
    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.kind, SlotKind::Bounce(b) if b.is_pending()))
            .count()
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.kind == SlotKind::Free)
    }
}

/// Outcome of translating one linear address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Resolved {
    pub paddr: u64,
    pub flags: TlbFlags,
    /// Page-number bits inside the large page backing the address, zero for 4K pages.
    pub large_mask: u64,
}

/// Physical-page half of a TLB entry for a page of the given kind.
pub(crate) fn phys_flags(kind: PhysPageKind) -> TlbFlags {
    match kind {
        PhysPageKind::Ram => TlbFlags::HOST_DIRECT,
        PhysPageKind::CatchWrite => TlbFlags::PG_NO_WRITE,
        PhysPageKind::CatchAll => TlbFlags::PG_NO_WRITE | TlbFlags::PG_NO_READ,
        PhysPageKind::Unassigned => {
            TlbFlags::PG_NO_WRITE | TlbFlags::PG_NO_READ | TlbFlags::PG_UNASSIGNED
        }
    }
}

/// Data breakpoint hits for an access, in DR6 B0..B3 layout.
fn data_breakpoint_hits(dr: &[u64; 8], linear: u64, len: usize, write: bool) -> u8 {
    let dr7 = dr[7];
    if dr7 & 0xff == 0 {
        return 0;
    }
    let last = linear.wrapping_add(len as u64 - 1);
    let mut hits = 0u8;
    for i in 0..4 {
        if (dr7 >> (i * 2)) & 3 == 0 {
            continue;
        }
        let rw = (dr7 >> (16 + i * 4)) & 3;
        let matches_kind = match rw {
            0b01 => write,
            0b11 => true,
            // Instruction and I/O breakpoints are not data accesses.
            _ => false,
        };
        if !matches_kind {
            continue;
        }
        let bp_len: u64 = match (dr7 >> (18 + i * 4)) & 3 {
            0 => 1,
            1 => 2,
            2 => 8,
            _ => 4,
        };
        let bp_first = dr[i] & !(bp_len - 1);
        let bp_last = bp_first + bp_len - 1;
        if linear <= bp_last && bp_first <= last {
            hits |= 1 << i;
        }
    }
    hits
}

/// Stack slots are checked for natural alignment; multi-value frames are not.
fn stack_align(len: usize) -> Align {
    if len.is_power_of_two() && len <= 8 {
        Align::natural(len)
    } else {
        Align::NONE
    }
}

impl<P: Platform> Vcpu<P> {
    /// Map `len` bytes at `seg:off` for the given access.
    ///
    /// Raises the architectural fault (and returns [`Exit::RaisedXcpt`]) when
    /// segmentation, alignment or paging forbid the access.
    pub fn mem_map(
        &mut self,
        seg: Option<SegReg>,
        off: u64,
        len: usize,
        access: Access,
        align: Align,
    ) -> IemResult<MapToken> {
        if len == 0 || len > BOUNCE_BUFFER_SIZE {
            return Err(Exit::Unimplemented("memory access size"));
        }
        let slot = self.mem.free_slot().ok_or(Exit::MappingOverflow)?;

        let linear = self.apply_segment(seg, off, len, access)?;
        self.check_alignment(linear, access, align)?;

        let in_first_page = (PAGE_SIZE - (linear & !PAGE_MASK)) as usize;
        if len > in_first_page {
            let second_linear = self.wrap_linear(linear.wrapping_add(in_first_page as u64));
            let first = self.translate(linear, in_first_page, access)?;
            let second = self.translate(second_linear, len - in_first_page, access)?;
            let unassigned = first.flags.contains(TlbFlags::PG_UNASSIGNED)
                && second.flags.contains(TlbFlags::PG_UNASSIGNED);
            let bounce = BounceMap {
                first: first.paddr,
                len1: in_first_page,
                second: second.paddr,
                len2: len - in_first_page,
                unassigned,
                pending_first: false,
                pending_second: false,
            };
            return self.map_bounce(slot, access, bounce);
        }

        let Resolved { paddr, flags, .. } = self.translate(linear, len, access)?;
        let wants_bounce = (access.is_write() && flags.contains(TlbFlags::PG_NO_WRITE))
            || (access.needs_load() && flags.contains(TlbFlags::PG_NO_READ))
            || !flags.contains(TlbFlags::HOST_DIRECT);
        if !wants_bounce && self.platform.ram_page_mut(paddr & PAGE_MASK).is_some() {
            let s = &mut self.mem.slots[slot];
            s.kind = SlotKind::Direct { paddr, len };
            s.access = access;
            trace!(linear, paddr, len, ?access, "mem map direct");
            return Ok(MapToken::new(slot, access));
        }

        let bounce = BounceMap {
            first: paddr,
            len1: len,
            second: 0,
            len2: 0,
            unassigned: flags.contains(TlbFlags::PG_UNASSIGNED),
            pending_first: false,
            pending_second: false,
        };
        self.map_bounce(slot, access, bounce)
    }

    fn map_bounce(&mut self, slot: usize, access: Access, bounce: BounceMap) -> IemResult<MapToken> {
        let s = &mut self.mem.slots[slot];
        if access.needs_load() {
            if bounce.unassigned {
                s.buf[..bounce.len1 + bounce.len2].fill(0xff);
            } else {
                let (a, b) = s.buf.split_at_mut(bounce.len1);
                let st = self.platform.read_phys(bounce.first, a);
                if !st.is_success() {
                    return Err(Exit::PhysAccess(bounce.first));
                }
                if bounce.len2 != 0 {
                    let st = self.platform.read_phys(bounce.second, &mut b[..bounce.len2]);
                    if !st.is_success() {
                        return Err(Exit::PhysAccess(bounce.second));
                    }
                }
            }
        } else {
            // Never leak a previous mapping's bytes into a write-only buffer.
            s.buf[..bounce.len1 + bounce.len2].fill(0xcc);
        }
        s.kind = SlotKind::Bounce(bounce);
        s.access = access;
        trace!(
            first = bounce.first,
            len1 = bounce.len1,
            second = bounce.second,
            len2 = bounce.len2,
            ?access,
            "mem map bounce"
        );
        Ok(MapToken::new(slot, access))
    }

    fn check_token(&self, token: MapToken) -> IemResult<usize> {
        let slot = token.slot();
        let raw = token.raw();
        if raw & MapToken::VALID == 0 || slot >= MAPPING_SLOTS {
            return Err(Exit::InvalidToken(raw));
        }
        let s = &self.mem.slots[slot];
        if !s.is_active() || (s.access.bits() & Access::TYPE_MASK) as u8 != raw >> 4 {
            return Err(Exit::InvalidToken(raw));
        }
        Ok(slot)
    }

    /// The bytes of an open mapping.
    pub fn mapped_mut(&mut self, token: MapToken) -> IemResult<&mut [u8]> {
        let slot = self.check_token(token)?;
        match self.mem.slots[slot].kind {
            SlotKind::Direct { paddr, len } => {
                let off = (paddr & !PAGE_MASK) as usize;
                match self.platform.ram_page_mut(paddr & PAGE_MASK) {
                    Some(page) if off + len <= page.len() => Ok(&mut page[off..off + len]),
                    _ => Err(Exit::PhysAccess(paddr)),
                }
            }
            SlotKind::Bounce(b) => Ok(&mut self.mem.slots[slot].buf[..b.len1 + b.len2]),
            SlotKind::Free => Err(Exit::InvalidToken(token.raw())),
        }
    }

    /// Finish a mapping, writing bounce-buffered bytes back to guest memory.
    ///
    /// Informational results from the platform are folded into the pass-up
    /// status of the current instruction.
    pub fn mem_commit(&mut self, token: MapToken) -> IemResult<()> {
        let slot = self.check_token(token)?;
        let s = &mut self.mem.slots[slot];
        match s.kind {
            SlotKind::Direct { .. } => {
                s.kind = SlotKind::Free;
                Ok(())
            }
            SlotKind::Bounce(_) if !s.access.is_write() => {
                s.kind = SlotKind::Free;
                Ok(())
            }
            SlotKind::Bounce(b) => {
                if b.unassigned {
                    trace!(addr = b.first, "write to unassigned memory dropped");
                    s.kind = SlotKind::Free;
                    return Ok(());
                }
                self.bounce_write_back(slot, b)
            }
            SlotKind::Free => Err(Exit::InvalidToken(token.raw())),
        }
    }

    fn bounce_write_back(&mut self, slot: usize, mut b: BounceMap) -> IemResult<()> {
        let postpone = self.config.postpone_failed_writes;
        let s = &mut self.mem.slots[slot];
        let (first_half, rest) = s.buf.split_at(b.len1);

        let st1 = self.platform.write_phys(b.first, first_half);
        let st2 = if b.len2 == 0 {
            PhysStatus::Ok
        } else if st1.is_success() {
            self.platform.write_phys(b.second, &rest[..b.len2])
        } else {
            // The second half is not attempted once the first one is held back.
            st1
        };
        match st1.merge(st2) {
            PhysStatus::Ok => {}
            PhysStatus::Info(info) => self.pass_up = self.pass_up.merge(info),
            PhysStatus::Defer if postpone => {
                if let PhysStatus::Info(info) = st1 {
                    self.pass_up = self.pass_up.merge(info);
                }
                b.pending_first = st1 == PhysStatus::Defer;
                b.pending_second = st2 == PhysStatus::Defer;
            }
            PhysStatus::Defer | PhysStatus::Failed => {
                let addr = if st1.is_success() { b.second } else { b.first };
                s.kind = SlotKind::Free;
                debug!(addr, "bounce write-back failed");
                return Err(Exit::PhysAccess(addr));
            }
        }

        if b.is_pending() {
            debug!(
                first = b.pending_first,
                second = b.pending_second,
                "bounce write-back postponed"
            );
            s.kind = SlotKind::Bounce(b);
            self.local_ff |= ForcedActions::IEM_PENDING_WRITE;
            self.pass_up = self.pass_up.merge(Info::PendingWrite);
        } else {
            s.kind = SlotKind::Free;
        }
        Ok(())
    }

    /// Drop a mapping without writing anything back.
    pub fn mem_rollback(&mut self, token: MapToken) -> IemResult<()> {
        let slot = self.check_token(token)?;
        self.mem.slots[slot].kind = SlotKind::Free;
        Ok(())
    }

    /// Drop every active mapping. Postponed write-backs are kept.
    pub fn rollback_all(&mut self) {
        let mut dropped = 0;
        for s in self.mem.slots.iter_mut().filter(|s| s.is_active()) {
            s.kind = SlotKind::Free;
            dropped += 1;
        }
        if dropped != 0 {
            debug!(dropped, "rolled back open memory mappings");
            self.stats.rollbacks += dropped;
        }
    }

    /// Mapping slots of this vCPU, for inspection.
    pub fn mappings(&self) -> &MemMappings {
        &self.mem
    }

    /// Replay postponed bounce-buffer write-backs.
    pub fn process_pending_writes(&mut self) -> IemResult<Info> {
        let mut info = Info::Done;
        for slot in 0..MAPPING_SLOTS {
            let SlotKind::Bounce(mut b) = self.mem.slots[slot].kind else {
                continue;
            };
            if !b.is_pending() {
                continue;
            }
            let buf = &self.mem.slots[slot].buf;
            if b.pending_first {
                match self.platform.write_phys(b.first, &buf[..b.len1]) {
                    PhysStatus::Ok => {}
                    PhysStatus::Info(i) => info = info.merge(i),
                    PhysStatus::Defer => return Ok(Info::PendingWrite),
                    PhysStatus::Failed => {
                        self.mem.slots[slot].kind = SlotKind::Free;
                        return Err(Exit::PhysAccess(b.first));
                    }
                }
                b.pending_first = false;
                self.mem.slots[slot].kind = SlotKind::Bounce(b);
            }
            let buf = &self.mem.slots[slot].buf;
            if b.pending_second {
                match self
                    .platform
                    .write_phys(b.second, &buf[b.len1..b.len1 + b.len2])
                {
                    PhysStatus::Ok => {}
                    PhysStatus::Info(i) => info = info.merge(i),
                    PhysStatus::Defer => return Ok(Info::PendingWrite),
                    PhysStatus::Failed => {
                        self.mem.slots[slot].kind = SlotKind::Free;
                        return Err(Exit::PhysAccess(b.second));
                    }
                }
            }
            self.mem.slots[slot].kind = SlotKind::Free;
            self.stats.pending_write_replays += 1;
        }
        self.local_ff.remove(ForcedActions::IEM_PENDING_WRITE);
        Ok(info)
    }

    #[inline]
    fn wrap_linear(&self, linear: u64) -> u64 {
        if self.state.mode == CpuMode::Long {
            linear
        } else {
            linear & 0xffff_ffff
        }
    }

    fn raise_seg_fault(&mut self, seg: SegReg) -> Exit {
        if seg == SegReg::Ss {
            self.raise_ss(0)
        } else {
            self.raise_gp(0)
        }
    }

    /// Apply segmentation to an effective address; `None` means a linear address.
    pub(crate) fn apply_segment(
        &mut self,
        seg: Option<SegReg>,
        off: u64,
        len: usize,
        access: Access,
    ) -> IemResult<u64> {
        let Some(sreg) = seg else {
            return Ok(off);
        };
        let last_off = (len - 1) as u64;

        if self.state.mode == CpuMode::Long {
            let base = match sreg {
                SegReg::Fs | SegReg::Gs => self.state.segments.get(sreg).base,
                _ => 0,
            };
            let first = off.wrapping_add(base);
            let last = first.wrapping_add(last_off);
            if !is_canonical_48(first) || !is_canonical_48(last) {
                return Err(self.raise_seg_fault(sreg));
            }
            return Ok(first);
        }

        let s = *self.state.segments.get(sreg);
        if s.is_unusable() || !s.is_present() {
            return Err(self.raise_gp(0));
        }
        let first = off & 0xffff_ffff;
        let last = first + last_off;
        let legacy_mode = matches!(self.state.mode, CpuMode::Real | CpuMode::Vm86);

        if !s.is_code() {
            if access.is_write() && !s.is_writable() {
                return Err(self.raise_seg_fault(sreg));
            }
            let limit = s.limit as u64;
            let out_of_bounds = if s.is_expand_down() {
                let upper = if s.is_big() { 0xffff_ffff } else { 0xffff };
                first < limit + 1 || last > upper
            } else {
                first > limit || last > limit
            };
            if out_of_bounds {
                return Err(self.raise_seg_fault(sreg));
            }
        } else {
            if (access.is_write() || !s.is_readable()) && !legacy_mode {
                return Err(self.raise_seg_fault(sreg));
            }
            if first > s.limit as u64 || last > s.limit as u64 {
                return Err(self.raise_seg_fault(sreg));
            }
        }
        Ok(first.wrapping_add(s.base) & 0xffff_ffff)
    }

    fn alignment_check_enabled(&self) -> bool {
        self.config.align_check
            && self.state.control.cr0 & CR0_AM != 0
            && self.state.rflags() & RFLAGS_AC != 0
            && self.state.cpl() == 3
    }

    fn check_alignment(&mut self, linear: u64, access: Access, align: Align) -> IemResult<()> {
        if align.mask == 0 || linear & align.mask == 0 || access.is_sys() {
            return Ok(());
        }
        match align.mode {
            AlignMode::Ac => {
                if self.alignment_check_enabled() {
                    return Err(self.raise_ac());
                }
                Ok(())
            }
            AlignMode::Gp => Err(self.raise_gp(0)),
            AlignMode::GpOrAc => {
                if linear & 3 != 0 && self.alignment_check_enabled() {
                    Err(self.raise_ac())
                } else {
                    Err(self.raise_gp(0))
                }
            }
        }
    }

    /// Raise #PF for an access that failed translation.
    pub(crate) fn raise_pf(
        &mut self,
        vaddr: u64,
        len: usize,
        access: Access,
        reason: FaultReason,
    ) -> Exit {
        let ctl = self.state.control;
        let report_fetch = ctl.cr4 & CR4_PAE != 0 && ctl.efer & EFER_NXE != 0;
        let present = reason != FaultReason::NotPresent;
        let rsvd = reason == FaultReason::ReservedBits;
        let err = pf_error_code(
            present,
            access.access_type(),
            self.state.cpl() == 3,
            rsvd,
            report_fetch,
        );
        // Large operands (FXSAVE and friends) report the last byte.
        let addr = if len > 64 {
            vaddr.wrapping_add(len as u64 - 1)
        } else {
            vaddr
        };
        debug!(addr, err, ?access, "page fault");
        self.raise_cpu_xcpt(
            XCPT_PF,
            XcptFlags::ERR | XcptFlags::CR2,
            err as u16,
            addr,
        )
    }

    fn check_page_permissions(
        &mut self,
        vaddr: u64,
        len: usize,
        access: Access,
        flags: TlbFlags,
    ) -> IemResult<()> {
        let user = self.state.cpl() == 3 && !access.is_sys();
        let denied = (access.is_write()
            && flags.contains(TlbFlags::NO_WRITE)
            && (user || self.state.control.cr0 & CR0_WP != 0))
            || (user && flags.contains(TlbFlags::NO_USER))
            || (access.contains(Access::EXEC) && flags.contains(TlbFlags::NO_EXEC));
        if denied {
            return Err(self.raise_pf(vaddr, len, access, FaultReason::Protection));
        }
        Ok(())
    }

    /// Translate a linear address for `access`, going through the code or data TLB.
    ///
    /// Pages with an armed data breakpoint are translated without being cached.
    pub(crate) fn translate(
        &mut self,
        vaddr: u64,
        len: usize,
        access: Access,
    ) -> IemResult<Resolved> {
        let exec = access.contains(Access::EXEC);
        let bp_hits = if exec {
            0
        } else {
            data_breakpoint_hits(&self.state.dr, vaddr, len, access.is_write())
        };

        if bp_hits == 0 {
            let set = if exec {
                &mut self.tlb.code
            } else {
                &mut self.tlb.data
            };
            if let Some(idx) = set.lookup_index(vaddr) {
                let e = *set.entry(idx);
                // A write through an entry loaded without D must set it first.
                if !(access.is_write() && e.flags.contains(TlbFlags::NO_DIRTY)) {
                    let live = set.phys_rev();
                    self.check_page_permissions(vaddr, len, access, e.flags)?;
                    let flags = if e.phys_current(live) {
                        e.flags
                    } else {
                        let kind = self.platform.page_kind(e.phys_page);
                        let set = if exec {
                            &mut self.tlb.code
                        } else {
                            &mut self.tlb.data
                        };
                        set.restamp(idx, phys_flags(kind));
                        set.entry(idx).flags
                    };
                    return Ok(Resolved {
                        paddr: e.phys_page | (vaddr & !PAGE_MASK),
                        flags,
                        large_mask: e.large_mask,
                    });
                }
            }
        } else {
            trace!(vaddr, bp_hits, "data breakpoint hit");
            self.state.dbg_hits.drx |= bp_hits;
        }

        let ctx = self.state.paging();
        let t = match self.platform.walk(&ctx, vaddr, access.access_type()) {
            Ok(t) => t,
            Err(TranslateFault::PageFault(pf)) => {
                return Err(self.raise_pf(vaddr, len, access, pf.reason))
            }
            Err(TranslateFault::NonCanonical(_)) => {
                return Err(if access.contains(Access::STACK) {
                    self.raise_ss(0)
                } else {
                    self.raise_gp(0)
                })
            }
        };

        let mut flags = TlbFlags::empty();
        if !t.writable {
            flags |= TlbFlags::NO_WRITE;
        }
        if !t.user {
            flags |= TlbFlags::NO_USER;
        }
        if t.no_exec && ctx.nx_enabled() {
            flags |= TlbFlags::NO_EXEC;
        }
        self.check_page_permissions(vaddr, len, access, flags)?;

        if access.is_write() {
            mark_dirty(&mut self.platform, &t);
        } else if !t.dirty {
            flags |= TlbFlags::NO_DIRTY;
        }
        flags |= phys_flags(self.platform.page_kind(t.paddr));

        let large_mask = match t.page_size {
            PageSize::Size4K => 0,
            size => size.vpn_mask(),
        };
        if bp_hits == 0 {
            // Global entries are only loaded from ring 0.
            let global = t.global && ctx.global_pages() && self.state.cpl() == 0;
            let set = if exec {
                &mut self.tlb.code
            } else {
                &mut self.tlb.data
            };
            set.insert(vaddr, global, flags, t.paddr & PAGE_MASK, large_mask);
        }
        Ok(Resolved {
            paddr: t.paddr,
            flags,
            large_mask,
        })
    }

    fn read_mem<const N: usize>(
        &mut self,
        seg: Option<SegReg>,
        off: u64,
        access: Access,
        align: Align,
    ) -> IemResult<[u8; N]> {
        let token = self.mem_map(seg, off, N, access, align)?;
        let mut out = [0u8; N];
        out.copy_from_slice(self.mapped_mut(token)?);
        self.mem_commit(token)?;
        Ok(out)
    }

    fn write_mem(
        &mut self,
        seg: Option<SegReg>,
        off: u64,
        bytes: &[u8],
        access: Access,
        align: Align,
    ) -> IemResult<()> {
        let token = self.mem_map(seg, off, bytes.len(), access, align)?;
        self.mapped_mut(token)?.copy_from_slice(bytes);
        self.mem_commit(token)
    }

    pub fn fetch_data_u8(&mut self, seg: SegReg, off: u64) -> IemResult<u8> {
        Ok(self.read_mem::<1>(Some(seg), off, Access::DATA_R, Align::NONE)?[0])
    }

    pub fn fetch_data_u16(&mut self, seg: SegReg, off: u64) -> IemResult<u16> {
        let b = self.read_mem::<2>(Some(seg), off, Access::DATA_R, Align::natural(2))?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn fetch_data_u32(&mut self, seg: SegReg, off: u64) -> IemResult<u32> {
        let b = self.read_mem::<4>(Some(seg), off, Access::DATA_R, Align::natural(4))?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn fetch_data_u64(&mut self, seg: SegReg, off: u64) -> IemResult<u64> {
        let b = self.read_mem::<8>(Some(seg), off, Access::DATA_R, Align::natural(8))?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn store_data_u8(&mut self, seg: SegReg, off: u64, val: u8) -> IemResult<()> {
        self.write_mem(Some(seg), off, &[val], Access::DATA_W, Align::NONE)
    }

    pub fn store_data_u16(&mut self, seg: SegReg, off: u64, val: u16) -> IemResult<()> {
        self.write_mem(Some(seg), off, &val.to_le_bytes(), Access::DATA_W, Align::natural(2))
    }

    pub fn store_data_u32(&mut self, seg: SegReg, off: u64, val: u32) -> IemResult<()> {
        self.write_mem(Some(seg), off, &val.to_le_bytes(), Access::DATA_W, Align::natural(4))
    }

    pub fn store_data_u64(&mut self, seg: SegReg, off: u64, val: u64) -> IemResult<()> {
        self.write_mem(Some(seg), off, &val.to_le_bytes(), Access::DATA_W, Align::natural(8))
    }

    pub(crate) fn read_sys_u16(&mut self, linear: u64) -> IemResult<u16> {
        Ok(u16::from_le_bytes(
            self.read_mem::<2>(None, linear, Access::SYS_R, Align::NONE)?,
        ))
    }

    pub(crate) fn read_sys_u32(&mut self, linear: u64) -> IemResult<u32> {
        Ok(u32::from_le_bytes(
            self.read_mem::<4>(None, linear, Access::SYS_R, Align::NONE)?,
        ))
    }

    pub(crate) fn read_sys_u64(&mut self, linear: u64) -> IemResult<u64> {
        Ok(u64::from_le_bytes(
            self.read_mem::<8>(None, linear, Access::SYS_R, Align::NONE)?,
        ))
    }

    /// Open the stack bytes a push of `len` bytes writes. Returns the token and
    /// the stack pointer to install once the push commits.
    pub(crate) fn stack_push_begin(&mut self, len: usize) -> IemResult<(MapToken, u64)> {
        let new_sp = self
            .state
            .stack_ptr()
            .wrapping_sub(len as u64)
            & crate::state::mask_bits(self.state.stack_bits());
        let token = self.mem_map(Some(SegReg::Ss), new_sp, len, Access::STACK_W, stack_align(len))?;
        Ok((token, new_sp))
    }

    pub(crate) fn stack_push_commit(&mut self, token: MapToken, new_sp: u64) -> IemResult<()> {
        self.mem_commit(token)?;
        self.state.set_stack_ptr(new_sp);
        Ok(())
    }

    /// Open `len` bytes at the top of the stack for popping.
    pub(crate) fn stack_pop_begin(&mut self, len: usize) -> IemResult<(MapToken, u64)> {
        let sp = self.state.stack_ptr();
        let token = self.mem_map(Some(SegReg::Ss), sp, len, Access::STACK_R, stack_align(len))?;
        let new_sp = sp.wrapping_add(len as u64) & crate::state::mask_bits(self.state.stack_bits());
        Ok((token, new_sp))
    }

    pub fn push_u16(&mut self, val: u16) -> IemResult<()> {
        let (token, sp) = self.stack_push_begin(2)?;
        self.mapped_mut(token)?.copy_from_slice(&val.to_le_bytes());
        self.stack_push_commit(token, sp)
    }

    pub fn push_u32(&mut self, val: u32) -> IemResult<()> {
        let (token, sp) = self.stack_push_begin(4)?;
        self.mapped_mut(token)?.copy_from_slice(&val.to_le_bytes());
        self.stack_push_commit(token, sp)
    }

    pub fn push_u64(&mut self, val: u64) -> IemResult<()> {
        let (token, sp) = self.stack_push_begin(8)?;
        self.mapped_mut(token)?.copy_from_slice(&val.to_le_bytes());
        self.stack_push_commit(token, sp)
    }

    /// Pop a value of `len` bytes (2, 4 or 8), zero extended.
    pub fn pop_sized(&mut self, len: usize) -> IemResult<u64> {
        let (token, sp) = self.stack_pop_begin(len)?;
        let mut raw = [0u8; 8];
        raw[..len].copy_from_slice(self.mapped_mut(token)?);
        self.mem_commit(token)?;
        self.state.set_stack_ptr(sp);
        Ok(u64::from_le_bytes(raw))
    }

    /// Push a value of `len` bytes (2, 4 or 8).
    pub fn push_sized(&mut self, len: usize, val: u64) -> IemResult<()> {
        match len {
            2 => self.push_u16(val as u16),
            4 => self.push_u32(val as u32),
            _ => self.push_u64(val),
        }
    }
}
