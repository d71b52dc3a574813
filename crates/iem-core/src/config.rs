/// Guest CPU vendor; selects vendor-specific corner cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuVendor {
    #[default]
    Intel,
    Amd,
}

/// When breakpoint hits pending at a software interrupt are reported silently.
///
/// Intel parts report the #DB that follows an `INT n` without the DR6 hit bits
/// the instruction itself produced; some guests depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SilentDebugPolicy {
    Never,
    #[default]
    IntelOnly,
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IemConfig {
    pub vendor: CpuVendor,
    pub silent_soft_int_debug: SilentDebugPolicy,
    /// Timers are polled when `remaining & poll_rate_mask == 0`.
    pub poll_rate_mask: u32,
    /// Keep bounce-buffer writes the platform defers instead of failing them.
    pub postpone_failed_writes: bool,
    /// Honour CR0.AM/EFLAGS.AC alignment checking at CPL 3.
    pub align_check: bool,
}

impl Default for IemConfig {
    fn default() -> Self {
        Self {
            vendor: CpuVendor::Intel,
            silent_soft_int_debug: SilentDebugPolicy::IntelOnly,
            poll_rate_mask: 511,
            postpone_failed_writes: false,
            align_check: true,
        }
    }
}

impl IemConfig {
    pub(crate) fn silences_soft_int_debug(&self) -> bool {
        match self.silent_soft_int_debug {
            SilentDebugPolicy::Never => false,
            SilentDebugPolicy::IntelOnly => self.vendor == CpuVendor::Intel,
            SilentDebugPolicy::Always => true,
        }
    }
}
