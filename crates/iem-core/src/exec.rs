//! The execute loop: one instruction at a time, or a batch bounded by an
//! instruction budget and the forced actions of the platform.

use tracing::{debug, trace};

use crate::interp::Step;
use crate::platform::{ForcedActions, Platform};
use crate::state::{DR6_B_MASK, DR6_BS, RFLAGS_IF, RFLAGS_RF, RFLAGS_TF};
use crate::status::{Exit, IemResult, Info};
use crate::vcpu::{TrapKind, Vcpu};
use crate::xcpt::XCPT_NMI;

impl<P: Platform> Vcpu<P> {
    /// Execute a single instruction.
    ///
    /// When the instruction opens an interrupt shadow (STI, MOV SS, POP SS)
    /// the following instruction is executed as well, so the caller never
    /// sees a state in which an interrupt would have to be held back.
    pub fn execute_one(&mut self) -> IemResult<Info> {
        if let Some(info) = self.replay_pending_writes()? {
            return Ok(info);
        }
        let mut res = self.step();
        if res.is_ok() && self.state.inhibit_shadow == Some(self.state.rip()) {
            trace!(rip = self.state.rip(), "executing the instruction in the interrupt shadow");
            res = self.step();
        }
        self.finish_status(res)
    }

    /// Execute up to `max` instructions.
    ///
    /// The batch ends early when the host wants the vCPU back, when an
    /// interrupt the guest can take is pending, when the guest halts, or when
    /// polling the timers produced work. Returns the status and the number of
    /// instructions executed.
    pub fn execute_many(&mut self, max: u32) -> (IemResult<Info>, u32) {
        match self.replay_pending_writes() {
            Ok(None) => {}
            Ok(Some(info)) => return (Ok(info), 0),
            Err(e) => return (Err(e), 0),
        }

        let mut executed = 0;
        let mut info = Info::Done;
        while executed < max {
            if self.state.halted {
                info = info.merge(Info::Halt);
                break;
            }
            if let Err(e) = self.step() {
                self.pass_up = Info::Done;
                return (Err(e), executed);
            }
            executed += 1;

            if self.batch_should_stop() {
                break;
            }
            let remaining = max - executed;
            if remaining & self.config.poll_rate_mask == 0 && self.platform.poll_timers() {
                trace!(executed, "timer work pending");
                info = info.merge(Info::Reschedule);
                break;
            }
        }
        debug!(executed, max, ?info, "batch done");
        (self.finish_status(Ok(())).map(|i| i.merge(info)), executed)
    }

    /// Whether a forced action ends the batch at this boundary.
    fn batch_should_stop(&self) -> bool {
        let ff = self.forced_actions();
        if ff.intersects(
            ForcedActions::HOST_REQUEST | ForcedActions::IEM_PENDING_WRITE | ForcedActions::TIMER,
        ) {
            return true;
        }
        let guest = ff & ForcedActions::GUEST_INTERRUPTS;
        if guest.is_empty() && self.pending_trap.is_none() {
            return false;
        }
        // Nothing can be delivered inside an interrupt shadow.
        if self.state.inhibit_shadow == Some(self.state.rip()) {
            return false;
        }
        let can_take_int = self.state.get_flag(RFLAGS_IF)
            && guest.intersects(ForcedActions::INTERRUPT_PIC | ForcedActions::INTERRUPT_APIC);
        let can_take_nmi = guest.contains(ForcedActions::NMI) && !self.state.nmi_blocked;
        let trap_ready = self.pending_trap.is_some_and(|t| match t.kind {
            TrapKind::HardwareInt => self.state.get_flag(RFLAGS_IF),
            TrapKind::Exception if t.vector == XCPT_NMI => !self.state.nmi_blocked,
            _ => true,
        });
        can_take_int || can_take_nmi || trap_ready
    }

    /// Replay postponed writes before anything else runs. Returns the status
    /// to hand back when they still cannot be written.
    fn replay_pending_writes(&mut self) -> IemResult<Option<Info>> {
        if !self.local_ff.contains(ForcedActions::IEM_PENDING_WRITE) {
            return Ok(None);
        }
        match self.process_pending_writes()? {
            Info::PendingWrite => Ok(Some(Info::PendingWrite)),
            info => {
                self.pass_up = self.pass_up.merge(info);
                Ok(None)
            }
        }
    }

    /// One instruction, including the rollback of any mapping it left open.
    ///
    /// A CPU exception delivered to the guest counts as a completed
    /// instruction.
    fn step(&mut self) -> IemResult<()> {
        if self.mem.active() != 0 {
            debug!(active = self.mem.active(), "mappings left open by the previous instruction");
            self.rollback_all();
        }

        let rip = self.state.rip();
        match self.state.inhibit_shadow {
            Some(at) if at == rip => {}
            Some(_) => self.state.inhibit_shadow = None,
            None => {}
        }
        let in_shadow = self.state.inhibit_shadow.is_some();
        let single_step = self.state.get_flag(RFLAGS_TF);

        let res = self
            .decode_current()
            .and_then(|instr| self.dispatch(&instr))
            .and_then(|step| self.finish_instruction(step, single_step));

        // The shadow covers one instruction; a second STI or MOV SS does not extend it.
        if in_shadow {
            self.state.inhibit_shadow = None;
        }

        match res {
            Ok(()) => {
                self.stats.instructions += 1;
                Ok(())
            }
            Err(Exit::RaisedXcpt) => {
                self.rollback_all();
                self.stats.instructions += 1;
                Ok(())
            }
            Err(e) => {
                debug!(rip, error = %e, "instruction aborted");
                self.rollback_all();
                Err(e)
            }
        }
    }

    /// Retire an instruction: clear RF and raise the #DB that single-stepping
    /// or data breakpoint hits call for.
    fn finish_instruction(&mut self, step: Step, single_step: bool) -> IemResult<()> {
        if step == Step::Event {
            return Ok(());
        }
        self.state.set_flag(RFLAGS_RF, false);

        let hits = self.state.dbg_hits;
        if !single_step && !hits.any() {
            return Ok(());
        }
        let mut dr6 = self.state.dr[6] & !(DR6_B_MASK | DR6_BS);
        dr6 |= hits.drx as u64 & DR6_B_MASK;
        if single_step {
            dr6 |= DR6_BS;
        }
        self.state.dr[6] = dr6;
        self.state.dbg_hits.clear();
        debug!(dr6, "debug trap after instruction");
        Err(self.raise_db())
    }

    /// Fold the informational status collected during execution into the result.
    fn finish_status(&mut self, res: IemResult<()>) -> IemResult<Info> {
        let pass_up = std::mem::take(&mut self.pass_up);
        res.map(|()| pass_up)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FlatBus;
    use crate::state::{gpr, CpuState};
    use crate::vcpu::PendingTrap;

    fn flat(code: &[u8]) -> Vcpu<FlatBus> {
        let mut cpu = Vcpu::new(CpuState::new_protected_flat(), FlatBus::new(0x10_000));
        cpu.platform.load(0x1000, code);
        cpu.state.set_rip(0x1000);
        cpu.state.set_gpr_u64(gpr::RSP, 0x8000);
        cpu
    }

    #[test]
    fn execute_one_runs_through_the_sti_shadow() {
        // sti ; nop ; nop
        let mut cpu = flat(&[0xfb, 0x90, 0x90]);
        cpu.state.set_flag(RFLAGS_IF, false);
        assert_eq!(cpu.execute_one(), Ok(Info::Done));
        assert_eq!(cpu.state.rip(), 0x1002);
        assert_eq!(cpu.stats.instructions, 2);
        assert_eq!(cpu.state.inhibit_shadow, None);
    }

    #[test]
    fn hlt_is_passed_up() {
        let mut cpu = flat(&[0xf4]);
        assert_eq!(cpu.execute_one(), Ok(Info::Halt));
        assert!(cpu.state.halted);
        assert_eq!(cpu.state.rip(), 0x1001);
    }

    #[test]
    fn batch_respects_the_budget() {
        let mut cpu = flat(&[0x90; 16]);
        let (res, n) = cpu.execute_many(10);
        assert_eq!(res, Ok(Info::Done));
        assert_eq!(n, 10);
        assert_eq!(cpu.state.rip(), 0x100a);
    }

    #[test]
    fn batch_stops_on_host_request() {
        let mut cpu = flat(&[0x90; 16]);
        cpu.platform.forced = ForcedActions::HOST_REQUEST;
        let (_, n) = cpu.execute_many(10);
        assert_eq!(n, 1);
    }

    #[test]
    fn batch_stops_at_hlt() {
        let mut cpu = flat(&[0x90, 0xf4, 0x90]);
        let (res, n) = cpu.execute_many(10);
        assert_eq!(res, Ok(Info::Halt));
        assert_eq!(n, 2);
    }

    #[test]
    fn pending_interrupt_waits_for_if() {
        let mut cpu = flat(&[0x90; 16]);
        cpu.platform.forced = ForcedActions::INTERRUPT_PIC;
        cpu.state.set_flag(RFLAGS_IF, false);
        let (_, n) = cpu.execute_many(4);
        assert_eq!(n, 4);
        cpu.state.set_flag(RFLAGS_IF, true);
        let (_, n) = cpu.execute_many(4);
        assert_eq!(n, 1);
    }

    #[test]
    fn blocked_nmi_does_not_end_the_batch() {
        let mut cpu = flat(&[0x90; 16]);
        cpu.platform.forced = ForcedActions::NMI;
        cpu.state.nmi_blocked = true;
        let (_, n) = cpu.execute_many(4);
        assert_eq!(n, 4);
        cpu.state.nmi_blocked = false;
        let (_, n) = cpu.execute_many(4);
        assert_eq!(n, 1);
    }

    #[test]
    fn queued_interrupt_ends_the_batch_once_if_is_set() {
        let mut cpu = flat(&[0x90; 16]);
        cpu.set_pending_trap(PendingTrap::hardware_int(0x20));
        cpu.state.set_flag(RFLAGS_IF, false);
        let (_, n) = cpu.execute_many(4);
        assert_eq!(n, 4);
        cpu.state.set_flag(RFLAGS_IF, true);
        let (_, n) = cpu.execute_many(4);
        assert_eq!(n, 1);
    }

    #[test]
    fn timers_are_polled_by_the_mask() {
        let mut cpu = flat(&[0x90; 32]);
        cpu.config.poll_rate_mask = 3;
        let (_, n) = cpu.execute_many(16);
        assert_eq!(n, 16);
        // remaining = 12, 8, 4, 0
        assert_eq!(cpu.platform.timer_polls, 4);
    }

    #[test]
    fn hard_errors_roll_back_and_propagate() {
        // add eax, ebx
        let mut cpu = flat(&[0x01, 0xd8]);
        let (res, n) = cpu.execute_many(4);
        assert!(matches!(res, Err(Exit::Unimplemented(_))));
        assert_eq!(n, 0);
        assert_eq!(cpu.mappings().active(), 0);
    }

    #[test]
    fn single_step_sets_bs_and_raises_db() {
        let mut cpu = flat(&[0x90, 0x90]);
        cpu.state.set_flag(RFLAGS_TF, true);
        // No IDT: the #DB shuts the guest down, which is enough to see it was raised.
        let res = cpu.execute_one();
        assert!(matches!(res, Err(Exit::TripleFault)), "{res:?}");
        assert_ne!(cpu.state.dr[6] & DR6_BS, 0);
    }
}
