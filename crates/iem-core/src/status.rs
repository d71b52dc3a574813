//! Outcome types threaded through the engine.

use thiserror::Error;

/// Informational result of an operation that completed.
///
/// Variants are ordered by importance; merging two results keeps the more
/// important one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Info {
    #[default]
    Done,
    /// The platform asked for the vCPU to be rescheduled at the next boundary.
    Reschedule,
    /// A guest memory write is waiting to be replayed, see
    /// [`crate::Vcpu::process_pending_writes`].
    PendingWrite,
    /// The guest executed HLT.
    Halt,
}

impl Info {
    #[inline]
    #[must_use]
    pub fn merge(self, other: Info) -> Info {
        self.max(other)
    }
}

/// Reasons an operation did not complete normally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Exit {
    /// An exception was delivered to the guest; the current instruction is abandoned.
    #[error("exception delivered to the guest")]
    RaisedXcpt,
    /// A fault occurred while delivering a double fault.
    #[error("triple fault: guest cpu shutdown")]
    TripleFault,
    #[error("guest cpu hang (recursive alignment check)")]
    CpuHang,
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),
    #[error("physical memory access at {0:#x} failed")]
    PhysAccess(u64),
    #[error("invalid memory unmap token {0:#04x}")]
    InvalidToken(u8),
    #[error("all memory mapping slots are in use")]
    MappingOverflow,
}

impl Exit {
    /// Whether the exit reports a guest-visible event rather than an engine failure.
    #[inline]
    pub fn is_guest_event(&self) -> bool {
        matches!(self, Exit::RaisedXcpt | Exit::TripleFault | Exit::CpuHang)
    }
}

pub type IemResult<T> = Result<T, Exit>;

/// Answer of the platform to a physical read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysStatus {
    Ok,
    /// Done, with something for the caller to pass up.
    Info(Info),
    /// Cannot be done in the current context; retry at a safe point.
    Defer,
    Failed,
}

impl PhysStatus {
    #[inline]
    pub fn is_success(self) -> bool {
        matches!(self, PhysStatus::Ok | PhysStatus::Info(_))
    }

    /// Combine the status of two halves of one access.
    ///
    /// Informational results merge; a hard failure on either half wins.
    pub fn merge(self, other: PhysStatus) -> PhysStatus {
        use PhysStatus::*;
        match (self, other) {
            (Failed, _) | (_, Failed) => Failed,
            (Defer, _) | (_, Defer) => Defer,
            (Info(a), Info(b)) => Info(a.merge(b)),
            (Info(a), Ok) | (Ok, Info(a)) => Info(a),
            (Ok, Ok) => Ok,
        }
    }
}
