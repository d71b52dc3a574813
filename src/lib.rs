//! x86 instruction-level execution engine.
//!
//! The engine lives in [`iem_core`]; the translation lookaside buffers and the
//! page walker it sits on are re-exported as [`mmu`].

pub use iem_core::*;
pub use iem_mmu as mmu;
