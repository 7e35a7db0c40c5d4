//! OS primitives behind narrow traits.
//!
//! The fault translator, interrupt delivery and the profiler only see
//! [`ThreadControl`] and [`TimerResolution`]. On Windows these are backed
//! by `SuspendThread`/`GetThreadContext` and the multimedia timer; other
//! hosts supply their own (tests use a recording implementation).

#[cfg(all(windows, target_arch = "x86_64"))]
pub mod windows;

use faultline_runtime::{MachineContext, ThreadHandle};

use crate::error::PlatformError;

// =============================================================================
// ThreadControl
// =============================================================================

/// Suspend, inspect and resume another OS thread.
pub trait ThreadControl: Send + Sync {
    /// Stop `thread` at an instruction boundary.
    fn suspend(&self, thread: ThreadHandle) -> Result<(), PlatformError>;

    /// Read the saved context of a suspended thread.
    fn get_context(&self, thread: ThreadHandle) -> Result<MachineContext, PlatformError>;

    /// Overwrite the saved context of a suspended thread.
    fn set_context(&self, thread: ThreadHandle, context: &MachineContext)
    -> Result<(), PlatformError>;

    /// Let a suspended thread run again.
    fn resume(&self, thread: ThreadHandle) -> Result<(), PlatformError>;
}

// =============================================================================
// TimerResolution
// =============================================================================

/// System timer granularity control used while profiling.
pub trait TimerResolution: Send + Sync {
    /// Finest supported period in milliseconds; `0` means nothing to adjust.
    fn min_period(&self) -> Result<u32, PlatformError>;

    /// Request `period_ms` resolution.
    fn begin(&self, period_ms: u32) -> Result<(), PlatformError>;

    /// Release a previous [`begin`](Self::begin).
    fn end(&self, period_ms: u32);
}

/// Timer for hosts whose sleep granularity needs no adjustment.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedTimer;

impl TimerResolution for FixedTimer {
    fn min_period(&self) -> Result<u32, PlatformError> {
        Ok(0)
    }

    fn begin(&self, _period_ms: u32) -> Result<(), PlatformError> {
        Ok(())
    }

    fn end(&self, _period_ms: u32) {}
}

/// Timer resolution control native to this host.
pub fn native_timer() -> Box<dyn TimerResolution> {
    #[cfg(all(windows, target_arch = "x86_64"))]
    {
        Box::new(windows::MultimediaTimer)
    }
    #[cfg(not(all(windows, target_arch = "x86_64")))]
    {
        Box::new(FixedTimer)
    }
}

// =============================================================================
// Clocks and CPU state
// =============================================================================

/// Monotonic cycle counter; never zero.
#[inline]
pub fn cycleclock() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: rdtsc has no preconditions on x86_64.
        let ticks = unsafe { core::arch::x86_64::_rdtsc() };
        ticks.max(1)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::sync::OnceLock;
        use std::time::Instant;

        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = *EPOCH.get_or_init(Instant::now);
        (epoch.elapsed().as_nanos() as u64).max(1)
    }
}

/// Reset the floating-point unit after an arithmetic trap.
///
/// Clears sticky exception flags and restores default masks so the handler
/// does not re-trap on its first floating-point instruction.
pub fn reset_fp_env() {
    #[cfg(target_arch = "x86_64")]
    {
        const MXCSR_DEFAULT: u32 = 0x1F80;
        let mxcsr = MXCSR_DEFAULT;
        // SAFETY: fninit and ldmxcsr only touch FPU/SSE control state; the
        // operand lives on our stack for the duration of the asm block.
        unsafe {
            core::arch::asm!(
                "fninit",
                "ldmxcsr [{ptr}]",
                ptr = in(reg) &mxcsr as *const u32,
                options(nostack, preserves_flags),
            );
        }
    }
}

/// Raise the calling thread above normal scheduling priority, best effort.
pub fn raise_current_thread_priority() {
    #[cfg(all(windows, target_arch = "x86_64"))]
    windows::raise_current_thread_priority();
}
