use tracing::debug;

use super::XcptFlags;
use crate::platform::Platform;
use crate::state::{RFLAGS_AC, RFLAGS_IF, RFLAGS_TF};
use crate::status::IemResult;
use crate::vcpu::Vcpu;

impl<P: Platform> Vcpu<P> {
    /// Real-mode delivery through the interrupt vector table.
    pub(super) fn deliver_real(&mut self, cb_instr: u8, vector: u8, flags: XcptFlags) -> IemResult<()> {
        let idtr = self.state.idtr;
        let entry_off = 4 * vector as u32;
        if idtr.limit < entry_off + 3 {
            debug!(vector, limit = idtr.limit, "vector beyond the IVT limit");
            return Err(self.raise_gp(super::idt_error_code(vector)));
        }
        let entry = self.read_sys_u32(idtr.base + entry_off as u64)?;
        let new_ip = entry as u16;
        let new_cs = (entry >> 16) as u16;

        let efl = self.state.rflags();
        let mut ip = self.state.rip();
        if flags.contains(XcptFlags::SOFT_INT) {
            ip += cb_instr as u64;
        }

        let (token, new_sp) = self.stack_push_begin(6)?;
        {
            let old_cs = self.state.segments.cs.selector;
            let frame = self.mapped_mut(token)?;
            frame[0..2].copy_from_slice(&(ip as u16).to_le_bytes());
            frame[2..4].copy_from_slice(&old_cs.to_le_bytes());
            frame[4..6].copy_from_slice(&(efl as u16).to_le_bytes());
        }
        self.stack_push_commit(token, new_sp)?;

        let cs = &mut self.state.segments.cs;
        cs.selector = new_cs;
        cs.base = (new_cs as u64) << 4;
        self.state.set_rip(new_ip as u64);
        self.state.set_rflags(efl & !(RFLAGS_IF | RFLAGS_TF | RFLAGS_AC));

        self.finish_delivery(vector, flags)
    }
}
