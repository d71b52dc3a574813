//! Revision-tagged software TLB.
//!
//! Each [`TlbSet`] is a direct-mapped array of entry pairs. The even entry of a
//! pair caches non-global translations and is matched against the live
//! non-global revision (and address-space id); the odd entry caches global
//! translations and is matched against the global revision. Flushing bumps a
//! revision counter instead of touching entries, so an entry is only ever
//! "valid" relative to the counters it was loaded under. Revision zero is never
//! live, which lets a counter wrap by sweeping the affected half back to zero.
//!
//! A second counter, the physical revision, stamps the physical-page half of
//! an entry (host access kind and mapping-derived flags). It is bumped when the
//! guest-physical to host mapping changes while virtual translations remain
//! correct.

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::PAGE_SHIFT;

/// Number of even/odd entry pairs in one TLB.
pub const TLB_ENTRY_PAIRS: usize = 256;

bitflags! {
    /// Cached attributes of a TLB entry.
    ///
    /// The low byte is derived from the page tables and is stored inverted so
    /// that a zero bit means "allowed". The high bits describe the physical page
    /// and are only meaningful while the entry's physical revision is current.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TlbFlags: u32 {
        const NO_EXEC = 1 << 0;
        const NO_WRITE = 1 << 1;
        const NO_USER = 1 << 2;
        const NO_DIRTY = 1 << 3;
        const LARGE_PAGE = 1 << 4;

        /// Writes must go through the bounce-buffer path.
        const PG_NO_WRITE = 1 << 8;
        /// Reads must go through the bounce-buffer path.
        const PG_NO_READ = 1 << 9;
        /// Nothing is mapped at the physical address.
        const PG_UNASSIGNED = 1 << 10;
        /// The platform offers a direct host view of the page.
        const HOST_DIRECT = 1 << 11;
    }
}

impl TlbFlags {
    /// Bits derived from the physical page rather than the page tables.
    pub const PHYS_MASK: TlbFlags = TlbFlags::PG_NO_WRITE
        .union(TlbFlags::PG_NO_READ)
        .union(TlbFlags::PG_UNASSIGNED)
        .union(TlbFlags::HOST_DIRECT);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbEntry {
    /// Virtual page number.
    pub tag: u64,
    /// Revision the entry was loaded under; zero never matches.
    pub revision: u32,
    pub asid: u16,
    pub flags: TlbFlags,
    /// Physical address of the 4K page.
    pub phys_page: u64,
    /// Physical revision stamp of the `PG_*`/`HOST_DIRECT` flags.
    pub phys_rev: u32,
    /// For entries split from a large page: the page-number bits inside it.
    pub large_mask: u64,
}

impl TlbEntry {
    /// Whether the physical-page half of this entry may be used as is.
    #[inline]
    pub fn phys_current(&self, live_phys_rev: u32) -> bool {
        self.phys_rev == live_phys_rev
    }

    #[inline]
    fn covers_large(&self, vpn: u64) -> bool {
        self.flags.contains(TlbFlags::LARGE_PAGE)
            && (self.tag & !self.large_mask) == (vpn & !self.large_mask)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TlbStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub flushes: u64,
    pub global_flushes: u64,
    pub page_invalidations: u64,
    pub large_page_scans: u64,
    pub revision_rollovers: u64,
    pub phys_flushes: u64,
    pub phys_sweeps: u64,
}

/// Virtual page-number range covered by cached large pages, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LargeRange {
    first: u64,
    last: u64,
}

impl LargeRange {
    fn extend(range: &mut Option<LargeRange>, first: u64, last: u64) {
        match range {
            Some(r) => {
                r.first = r.first.min(first);
                r.last = r.last.max(last);
            }
            None => *range = Some(LargeRange { first, last }),
        }
    }

    #[inline]
    fn contains(range: &Option<LargeRange>, vpn: u64) -> bool {
        matches!(range, Some(r) if (r.first..=r.last).contains(&vpn))
    }
}

const EVEN: usize = 0;
const ODD: usize = 1;

/// One TLB (code or data).
#[derive(Debug, Clone)]
pub struct TlbSet {
    entries: Vec<TlbEntry>,
    revision: u32,
    global_revision: u32,
    phys_rev: u32,
    asid: u16,
    large: [Option<LargeRange>; 2],
    stats: TlbStats,
}

impl Default for TlbSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TlbSet {
    pub fn new() -> Self {
        Self {
            entries: vec![TlbEntry::default(); TLB_ENTRY_PAIRS * 2],
            revision: 1,
            global_revision: 1,
            phys_rev: 1,
            asid: 0,
            large: [None, None],
            stats: TlbStats::default(),
        }
    }

    #[inline]
    fn even_index(vpn: u64) -> usize {
        (vpn as usize & (TLB_ENTRY_PAIRS - 1)) * 2
    }

    #[inline]
    pub fn stats(&self) -> &TlbStats {
        &self.stats
    }

    #[inline]
    pub fn revision(&self) -> u32 {
        self.revision
    }

    #[inline]
    pub fn global_revision(&self) -> u32 {
        self.global_revision
    }

    #[inline]
    pub fn phys_rev(&self) -> u32 {
        self.phys_rev
    }

    /// Switch the address-space id that non-global hits must match.
    #[inline]
    pub fn set_asid(&mut self, asid: u16) {
        self.asid = asid;
    }

    #[inline]
    pub fn asid(&self) -> u16 {
        self.asid
    }

    #[inline]
    fn even_matches(&self, e: &TlbEntry, vpn: u64) -> bool {
        e.tag == vpn && e.revision == self.revision && e.asid == self.asid
    }

    #[inline]
    fn odd_matches(&self, e: &TlbEntry, vpn: u64) -> bool {
        e.tag == vpn && e.revision == self.global_revision
    }

    /// Index of the live entry for `vaddr`, if any.
    pub fn lookup_index(&mut self, vaddr: u64) -> Option<usize> {
        let vpn = vaddr >> PAGE_SHIFT;
        let idx = Self::even_index(vpn);
        let hit = if self.even_matches(&self.entries[idx + EVEN], vpn) {
            Some(idx + EVEN)
        } else if self.odd_matches(&self.entries[idx + ODD], vpn) {
            Some(idx + ODD)
        } else {
            None
        };
        if hit.is_some() {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        hit
    }

    pub fn lookup(&mut self, vaddr: u64) -> Option<&TlbEntry> {
        let idx = self.lookup_index(vaddr)?;
        Some(&self.entries[idx])
    }

    #[inline]
    pub fn entry(&self, idx: usize) -> &TlbEntry {
        &self.entries[idx]
    }

    #[inline]
    pub fn entry_mut(&mut self, idx: usize) -> &mut TlbEntry {
        &mut self.entries[idx]
    }

    /// Load a translation for `vaddr`, overwriting whatever occupied the slot.
    ///
    /// `large_mask` is zero for 4K pages and the page-number mask of the large
    /// page otherwise. Returns the entry index.
    pub fn insert(
        &mut self,
        vaddr: u64,
        global: bool,
        mut flags: TlbFlags,
        phys_page: u64,
        large_mask: u64,
    ) -> usize {
        let vpn = vaddr >> PAGE_SHIFT;
        let half = if global { ODD } else { EVEN };
        let idx = Self::even_index(vpn) + half;

        if large_mask != 0 {
            flags |= TlbFlags::LARGE_PAGE;
            LargeRange::extend(&mut self.large[half], vpn & !large_mask, vpn | large_mask);
        } else {
            flags.remove(TlbFlags::LARGE_PAGE);
        }

        self.entries[idx] = TlbEntry {
            tag: vpn,
            revision: if global {
                self.global_revision
            } else {
                self.revision
            },
            asid: if global { 0 } else { self.asid },
            flags,
            phys_page,
            phys_rev: self.phys_rev,
            large_mask,
        };
        self.stats.loads += 1;
        trace!(vaddr, phys_page, global, ?flags, "tlb load");
        idx
    }

    /// Drop every translation, or only the non-global ones.
    pub fn invalidate_all(&mut self, global: bool) {
        self.stats.flushes += 1;
        if bump(&mut self.revision) {
            self.rollover_sweep(EVEN);
        }
        self.large[EVEN] = None;

        if global {
            self.stats.global_flushes += 1;
            if bump(&mut self.global_revision) {
                self.rollover_sweep(ODD);
            }
            self.large[ODD] = None;
        }
    }

    fn rollover_sweep(&mut self, half: usize) {
        debug!(half, "tlb revision rollover, sweeping entries");
        self.stats.revision_rollovers += 1;
        for e in self.entries.iter_mut().skip(half).step_by(2) {
            e.tag = 0;
            e.revision = 0;
        }
    }

    /// Drop the translation of the page containing `vaddr`, including any
    /// entry split from a cached large page that covers it.
    pub fn invalidate_page(&mut self, vaddr: u64) {
        self.stats.page_invalidations += 1;
        let vpn = vaddr >> PAGE_SHIFT;
        let idx = Self::even_index(vpn);

        if self.entries[idx + EVEN].tag == vpn && self.entries[idx + EVEN].revision == self.revision
        {
            self.entries[idx + EVEN].revision = 0;
        }
        if self.entries[idx + ODD].tag == vpn
            && self.entries[idx + ODD].revision == self.global_revision
        {
            self.entries[idx + ODD].revision = 0;
        }

        for half in [EVEN, ODD] {
            if LargeRange::contains(&self.large[half], vpn) {
                self.scan_large_pages(half, vpn);
            }
        }
    }

    fn scan_large_pages(&mut self, half: usize, vpn: u64) {
        self.stats.large_page_scans += 1;
        let live = if half == EVEN {
            self.revision
        } else {
            self.global_revision
        };
        for e in self.entries.iter_mut().skip(half).step_by(2) {
            if e.revision == live && e.covers_large(vpn) {
                e.revision = 0;
            }
        }
    }

    /// Invalidate the physical half of every entry.
    pub fn invalidate_all_physical(&mut self) {
        self.stats.phys_flushes += 1;
        if bump(&mut self.phys_rev) {
            debug!("tlb physical revision rollover, sweeping entries");
            self.stats.phys_sweeps += 1;
            for e in self.entries.iter_mut() {
                e.phys_rev = 0;
                e.flags.remove(TlbFlags::PHYS_MASK);
            }
        }
    }

    /// Refresh the physical half of an entry after re-resolving its page.
    pub fn restamp(&mut self, idx: usize, phys_flags: TlbFlags) {
        let live = self.phys_rev;
        let e = &mut self.entries[idx];
        e.flags = (e.flags - TlbFlags::PHYS_MASK) | (phys_flags & TlbFlags::PHYS_MASK);
        e.phys_rev = live;
    }

    /// Force the revision counters, for exercising rollover.
    #[doc(hidden)]
    pub fn set_revisions_for_test(&mut self, revision: u32, global_revision: u32, phys_rev: u32) {
        self.revision = revision;
        self.global_revision = global_revision;
        self.phys_rev = phys_rev;
    }
}

/// Advance a revision counter; returns true when it wrapped.
#[inline]
fn bump(rev: &mut u32) -> bool {
    *rev = rev.wrapping_add(1);
    if *rev == 0 {
        *rev = 1;
        true
    } else {
        false
    }
}

/// Code and data TLBs of one virtual CPU.
#[derive(Debug, Clone, Default)]
pub struct Tlb {
    pub code: TlbSet,
    pub data: TlbSet,
}

impl Tlb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate_all(&mut self, global: bool) {
        debug!(global, "tlb flush");
        self.code.invalidate_all(global);
        self.data.invalidate_all(global);
    }

    pub fn invalidate_page(&mut self, vaddr: u64) {
        self.code.invalidate_page(vaddr);
        self.data.invalidate_page(vaddr);
    }

    pub fn invalidate_all_physical(&mut self) {
        self.code.invalidate_all_physical();
        self.data.invalidate_all_physical();
    }

    pub fn set_asid(&mut self, asid: u16) {
        self.code.set_asid(asid);
        self.data.set_asid(asid);
    }
}
