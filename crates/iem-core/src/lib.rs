//! An instruction-level x86 execution engine.
//!
//! [`Vcpu`] owns the guest register state, the code and data TLBs, the
//! per-instruction memory mapping slots and the opcode buffer. It executes
//! guest code one instruction at a time ([`Vcpu::execute_one`]) or in batches
//! ([`Vcpu::execute_many`]) and delivers exceptions, interrupts and task
//! switches the way the processor does.
//!
//! Guest memory and scheduling hooks come from a [`Platform`]; [`FlatBus`] is
//! a ready-made one backed by a flat byte vector.

pub mod config;
pub mod desc;
mod exec;
mod far;
mod fetch;
mod interp;
pub mod mem;
pub mod platform;
pub mod state;
pub mod status;
mod vcpu;
pub mod xcpt;

pub use config::{CpuVendor, IemConfig, SilentDebugPolicy};
pub use desc::Descriptor;
pub use fetch::MAX_INSTR_LEN;
pub use mem::{Access, Align, AlignMode, MapToken, MemMappings, BOUNCE_BUFFER_SIZE, MAPPING_SLOTS};
pub use platform::{FlatBus, ForcedActions, PhysPageKind, Platform};
pub use state::{CpuMode, CpuState, SegReg, Segment};
pub use status::{Exit, IemResult, Info, PhysStatus};
pub use vcpu::{PendingTrap, TrapKind, Vcpu, VcpuStats};
pub use xcpt::{evaluate_recursive_xcpt, xcpt_class, RecursiveXcpt, TaskSwitch, XcptClass, XcptFlags};
