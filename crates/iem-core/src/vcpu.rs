//! The virtual CPU: guest state plus everything the engine keeps between
//! instructions.

use iem_mmu::{Tlb, CR4_PCIDE, PAGE_SHIFT};
use tracing::debug;

use crate::config::IemConfig;
use crate::fetch::OpcodeBuf;
use crate::mem::MemMappings;
use crate::platform::{ForcedActions, Platform};
use crate::state::{CpuState, CR4_PGE, RFLAGS_IF};
use crate::status::{Exit, IemResult, Info};
use crate::xcpt::{XcptFlags, XcptNesting, XCPT_NMI};

/// Counters kept across the life of a vCPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VcpuStats {
    pub instructions: u64,
    pub exceptions_raised: u64,
    pub rollbacks: u64,
    pub pending_write_replays: u64,
}

/// Origin of a queued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// External interrupt from the PIC or APIC.
    HardwareInt,
    /// `INT n` that still has to be delivered.
    SoftwareInt,
    /// CPU exception, NMI included.
    Exception,
}

/// An event waiting to be delivered before the next instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTrap {
    pub vector: u8,
    pub kind: TrapKind,
    pub error_code: Option<u16>,
    pub cr2: Option<u64>,
    /// Length of the instruction that raised it, for software interrupts.
    pub instr_len: u8,
}

impl PendingTrap {
    pub fn hardware_int(vector: u8) -> Self {
        Self {
            vector,
            kind: TrapKind::HardwareInt,
            error_code: None,
            cr2: None,
            instr_len: 0,
        }
    }

    pub fn exception(vector: u8, error_code: Option<u16>) -> Self {
        Self {
            vector,
            kind: TrapKind::Exception,
            error_code,
            cr2: None,
            instr_len: 0,
        }
    }

    fn flags(&self) -> XcptFlags {
        let mut flags = match self.kind {
            TrapKind::HardwareInt => XcptFlags::EXT_INT,
            TrapKind::SoftwareInt => XcptFlags::SOFT_INT,
            TrapKind::Exception => XcptFlags::CPU_XCPT,
        };
        if self.error_code.is_some() {
            flags |= XcptFlags::ERR;
        }
        if self.cr2.is_some() {
            flags |= XcptFlags::CR2;
        }
        flags
    }
}

pub struct Vcpu<P: Platform> {
    pub state: CpuState,
    pub platform: P,
    pub tlb: Tlb,
    pub config: IemConfig,
    pub stats: VcpuStats,
    pub(crate) mem: MemMappings,
    pub(crate) fetch: OpcodeBuf,
    pub(crate) xcpt: XcptNesting,
    pub(crate) pending_trap: Option<PendingTrap>,
    /// Forced actions raised by the engine itself.
    pub(crate) local_ff: ForcedActions,
    /// Informational status to hand back once the current instruction retires.
    pub(crate) pass_up: Info,
    /// Length of the instruction being executed.
    pub(crate) cb_instr: u8,
}

impl<P: Platform> Vcpu<P> {
    pub fn new(state: CpuState, platform: P) -> Self {
        Self::with_config(state, platform, IemConfig::default())
    }

    pub fn with_config(state: CpuState, platform: P, config: IemConfig) -> Self {
        let mut tlb = Tlb::new();
        if state.control.cr4 & CR4_PCIDE != 0 {
            tlb.set_asid((state.control.cr3 & 0xfff) as u16);
        }
        Self {
            state,
            platform,
            tlb,
            config,
            stats: VcpuStats::default(),
            mem: MemMappings::default(),
            fetch: OpcodeBuf::default(),
            xcpt: XcptNesting::default(),
            pending_trap: None,
            local_ff: ForcedActions::empty(),
            pass_up: Info::Done,
            cb_instr: 0,
        }
    }

    /// Forced actions from the platform and from the engine combined.
    pub fn forced_actions(&self) -> ForcedActions {
        self.platform.forced_actions() | self.local_ff
    }

    /// `INVLPG` semantics: drop one page from both TLBs and the opcode cache.
    pub fn invalidate_tlb_page(&mut self, vaddr: u64) {
        self.tlb.invalidate_page(vaddr);
        if self.fetch.covers(vaddr >> PAGE_SHIFT) {
            self.fetch.flush();
        }
    }

    /// Drop every non-global translation, and the global ones too when `global` is set.
    pub fn invalidate_tlb_all(&mut self, global: bool) {
        self.tlb.invalidate_all(global);
        self.fetch.flush();
    }

    /// The guest-physical memory map changed; cached physical facts are stale.
    pub fn invalidate_tlb_physical(&mut self) {
        self.tlb.invalidate_all_physical();
        self.fetch.flush();
    }

    /// Load CR3 the way `MOV CR3` does.
    pub fn set_cr3(&mut self, cr3: u64) {
        debug!(old = self.state.control.cr3, new = cr3, "cr3 load");
        self.state.control.cr3 = cr3;
        if self.state.control.cr4 & CR4_PCIDE != 0 {
            self.tlb.set_asid((cr3 & 0xfff) as u16);
            self.fetch.flush();
            return;
        }
        self.invalidate_tlb_all(self.state.control.cr4 & CR4_PGE == 0);
    }

    /// Queue an event for delivery at the next instruction boundary.
    pub fn set_pending_trap(&mut self, trap: PendingTrap) {
        debug!(vector = trap.vector, kind = ?trap.kind, "trap queued");
        self.pending_trap = Some(trap);
    }

    pub fn pending_trap(&self) -> Option<PendingTrap> {
        self.pending_trap
    }

    /// Deliver the queued event if the guest can take it now.
    ///
    /// External interrupts wait for EFLAGS.IF and the end of an interrupt
    /// shadow; NMIs wait while NMIs are blocked. Returns whether an event was
    /// delivered.
    pub fn inject_pending_event(&mut self) -> IemResult<bool> {
        let Some(trap) = self.pending_trap else {
            return Ok(false);
        };
        let shadowed = self.state.inhibit_shadow == Some(self.state.rip());
        let deliverable = match trap.kind {
            TrapKind::HardwareInt => self.state.get_flag(RFLAGS_IF) && !shadowed,
            TrapKind::Exception if trap.vector == XCPT_NMI => !self.state.nmi_blocked && !shadowed,
            _ => true,
        };
        if !deliverable {
            return Ok(false);
        }
        self.pending_trap = None;
        self.state.halted = false;
        debug!(vector = trap.vector, kind = ?trap.kind, "injecting pending trap");
        let res = self.raise_xcpt_or_int(
            trap.instr_len,
            trap.vector,
            trap.flags(),
            trap.error_code.unwrap_or(0),
            trap.cr2.unwrap_or(0),
        );
        match res {
            Ok(()) | Err(Exit::RaisedXcpt) => Ok(true),
            Err(e) => {
                self.rollback_all();
                Err(e)
            }
        }
    }

    /// Deliver an exception or interrupt from outside the instruction stream.
    ///
    /// `error_code` and `fault_addr` set the ERR and CR2 flags. An
    /// `Err(Exit::RaisedXcpt)` answer means the CPU exception was delivered.
    pub fn raise_exception(
        &mut self,
        vector: u8,
        flags: XcptFlags,
        error_code: Option<u16>,
        fault_addr: Option<u64>,
    ) -> IemResult<()> {
        let mut flags = flags;
        if error_code.is_some() {
            flags |= XcptFlags::ERR;
        }
        if fault_addr.is_some() {
            flags |= XcptFlags::CR2;
        }
        let res = self.raise_xcpt_or_int(
            self.cb_instr,
            vector,
            flags,
            error_code.unwrap_or(0),
            fault_addr.unwrap_or(0),
        );
        if res.is_err() {
            self.rollback_all();
        }
        res
    }
}

impl<P: Platform + std::fmt::Debug> std::fmt::Debug for Vcpu<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vcpu")
            .field("state", &self.state)
            .field("platform", &self.platform)
            .field("stats", &self.stats)
            .field("mem", &self.mem)
            .finish_non_exhaustive()
    }
}
