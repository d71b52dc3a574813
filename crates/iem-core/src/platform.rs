//! Services the engine consumes from the rest of the virtual machine.

use std::collections::HashMap;

use bitflags::bitflags;
use iem_mmu::{AccessType, MemoryBus, PagingContext, TranslateFault, Translation, PAGE_MASK, PAGE_SIZE};

use crate::status::{Info, PhysStatus};

/// How a guest physical page is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhysPageKind {
    /// Plain RAM; may be accessed in place.
    #[default]
    Ram,
    /// Reads go straight to RAM, writes must go through [`Platform::write_phys`].
    CatchWrite,
    /// Every access must go through the platform (MMIO).
    CatchAll,
    /// Nothing is mapped; reads return all ones and writes are dropped.
    Unassigned,
}

bitflags! {
    /// Conditions that end a batch of instructions early.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ForcedActions: u32 {
        const INTERRUPT_PIC = 1 << 0;
        const INTERRUPT_APIC = 1 << 1;
        const NMI = 1 << 2;
        const TIMER = 1 << 3;
        /// The host wants the vCPU back.
        const HOST_REQUEST = 1 << 4;
        /// A postponed guest write must be replayed before resuming.
        const IEM_PENDING_WRITE = 1 << 5;
    }
}

impl ForcedActions {
    /// Actions that only matter when the guest can take an interrupt.
    pub const GUEST_INTERRUPTS: ForcedActions = ForcedActions::INTERRUPT_PIC
        .union(ForcedActions::INTERRUPT_APIC)
        .union(ForcedActions::NMI);
}

/// Guest physical memory plus the scheduling hooks of the virtual machine.
pub trait Platform: MemoryBus {
    fn page_kind(&mut self, paddr: u64) -> PhysPageKind;

    /// Host view of the RAM page at `page` (page aligned), if it can be accessed in place.
    fn ram_page_mut(&mut self, page: u64) -> Option<&mut [u8]>;

    /// Read `dst.len()` bytes at `paddr`; never crosses a page.
    fn read_phys(&mut self, paddr: u64, dst: &mut [u8]) -> PhysStatus;

    /// Write `src` at `paddr`; never crosses a page.
    fn write_phys(&mut self, paddr: u64, src: &[u8]) -> PhysStatus;

    /// Translate a linear address through the guest page tables.
    fn walk(
        &mut self,
        ctx: &PagingContext,
        vaddr: u64,
        access: AccessType,
    ) -> Result<Translation, TranslateFault> {
        iem_mmu::walk(self, ctx, vaddr, access)
    }

    fn forced_actions(&self) -> ForcedActions {
        ForcedActions::empty()
    }

    /// Run expired timers. Returns true when that produced work for the vCPU.
    fn poll_timers(&mut self) -> bool {
        false
    }
}

/// Identity-mapped physical memory for tests and small embedders.
///
/// Pages default to RAM; individual pages can be turned into MMIO or holes, and
/// the next writes can be made to answer [`PhysStatus::Defer`].
#[derive(Debug, Clone)]
pub struct FlatBus {
    mem: Vec<u8>,
    kinds: HashMap<u64, PhysPageKind>,
    /// Writes that reached a catch page, in order.
    pub mmio_writes: Vec<(u64, Vec<u8>)>,
    /// Status a write to a catch page answers once it is done.
    pub mmio_write_info: Option<Info>,
    /// Number of upcoming `write_phys` calls that answer `Defer`.
    pub defer_writes: u32,
    pub fail_writes: bool,
    pub forced: ForcedActions,
    pub timer_polls: u64,
}

impl FlatBus {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            kinds: HashMap::new(),
            mmio_writes: Vec::new(),
            mmio_write_info: None,
            defer_writes: 0,
            fail_writes: false,
            forced: ForcedActions::empty(),
            timer_polls: 0,
        }
    }

    pub fn load(&mut self, addr: u64, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        self.mem[start..end].copy_from_slice(data);
    }

    pub fn slice(&self, addr: u64, len: usize) -> &[u8] {
        let start = addr as usize;
        let end = start + len;
        &self.mem[start..end]
    }

    pub fn set_page_kind(&mut self, paddr: u64, kind: PhysPageKind) {
        let page = paddr & PAGE_MASK;
        if kind == PhysPageKind::Ram {
            self.kinds.remove(&page);
        } else {
            self.kinds.insert(page, kind);
        }
    }

    fn kind_of(&self, paddr: u64) -> PhysPageKind {
        if paddr as usize >= self.mem.len() {
            return PhysPageKind::Unassigned;
        }
        self.kinds
            .get(&(paddr & PAGE_MASK))
            .copied()
            .unwrap_or_default()
    }

    fn range(&self, paddr: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(paddr).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.mem.len()).then_some(start..end)
    }
}

impl MemoryBus for FlatBus {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.mem.get(paddr as usize).copied().unwrap_or(0xff)
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        let mut buf = [0u8; 2];
        self.read_bytes(paddr, &mut buf);
        u16::from_le_bytes(buf)
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(paddr, &mut buf);
        u64::from_le_bytes(buf)
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        if let Some(slot) = self.mem.get_mut(paddr as usize) {
            *slot = value;
        }
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }
}

impl Platform for FlatBus {
    fn page_kind(&mut self, paddr: u64) -> PhysPageKind {
        self.kind_of(paddr)
    }

    fn ram_page_mut(&mut self, page: u64) -> Option<&mut [u8]> {
        if self.kind_of(page) != PhysPageKind::Ram {
            return None;
        }
        let range = self.range(page & PAGE_MASK, PAGE_SIZE as usize)?;
        Some(&mut self.mem[range])
    }

    fn read_phys(&mut self, paddr: u64, dst: &mut [u8]) -> PhysStatus {
        if self.kind_of(paddr) == PhysPageKind::Unassigned {
            dst.fill(0xff);
            return PhysStatus::Ok;
        }
        match self.range(paddr, dst.len()) {
            Some(range) => {
                dst.copy_from_slice(&self.mem[range]);
                PhysStatus::Ok
            }
            None => PhysStatus::Failed,
        }
    }

    fn write_phys(&mut self, paddr: u64, src: &[u8]) -> PhysStatus {
        if self.fail_writes {
            return PhysStatus::Failed;
        }
        if self.defer_writes > 0 {
            self.defer_writes -= 1;
            return PhysStatus::Defer;
        }
        let kind = self.kind_of(paddr);
        if kind == PhysPageKind::Unassigned {
            return PhysStatus::Ok;
        }
        let Some(range) = self.range(paddr, src.len()) else {
            return PhysStatus::Failed;
        };
        self.mem[range].copy_from_slice(src);
        if kind != PhysPageKind::Ram {
            self.mmio_writes.push((paddr, src.to_vec()));
            if let Some(info) = self.mmio_write_info {
                return PhysStatus::Info(info);
            }
        }
        PhysStatus::Ok
    }

    fn forced_actions(&self) -> ForcedActions {
        self.forced
    }

    fn poll_timers(&mut self) -> bool {
        self.timer_polls += 1;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_pages_are_directly_accessible() {
        let mut bus = FlatBus::new(0x4000);
        bus.load(0x1000, &[1, 2, 3]);
        let page = bus.ram_page_mut(0x1000).unwrap();
        assert_eq!(&page[..3], &[1, 2, 3]);
        page[3] = 4;
        assert_eq!(bus.slice(0x1000, 4), &[1, 2, 3, 4]);
    }

    #[test]
    fn catch_pages_are_not_direct_and_log_writes() {
        let mut bus = FlatBus::new(0x4000);
        bus.set_page_kind(0x2000, PhysPageKind::CatchAll);
        assert!(bus.ram_page_mut(0x2000).is_none());
        assert_eq!(bus.write_phys(0x2010, &[0xaa, 0xbb]), PhysStatus::Ok);
        assert_eq!(bus.mmio_writes, vec![(0x2010, vec![0xaa, 0xbb])]);
    }

    #[test]
    fn unassigned_reads_all_ones() {
        let mut bus = FlatBus::new(0x2000);
        let mut buf = [0u8; 4];
        assert_eq!(bus.read_phys(0x8000, &mut buf), PhysStatus::Ok);
        assert_eq!(buf, [0xff; 4]);
        assert_eq!(bus.page_kind(0x8000), PhysPageKind::Unassigned);
    }

    #[test]
    fn catch_page_writes_can_report_info() {
        let mut bus = FlatBus::new(0x4000);
        bus.set_page_kind(0x2000, PhysPageKind::CatchWrite);
        bus.mmio_write_info = Some(Info::Reschedule);
        assert_eq!(bus.write_phys(0x1000, &[1]), PhysStatus::Ok);
        assert_eq!(bus.write_phys(0x2000, &[1]), PhysStatus::Info(Info::Reschedule));
    }

    #[test]
    fn deferred_writes_count_down() {
        let mut bus = FlatBus::new(0x2000);
        bus.defer_writes = 1;
        assert_eq!(bus.write_phys(0x10, &[1]), PhysStatus::Defer);
        assert_eq!(bus.write_phys(0x10, &[1]), PhysStatus::Ok);
        assert_eq!(bus.slice(0x10, 1), &[1]);
    }
}
