//! Collaborator interfaces the signal layer calls out to.
//!
//! Backtrace capture and code-location printing belong to the unwinder;
//! waking a blocked I/O wait belongs to the event loop. Both are invoked
//! from fault context or with a thread frozen, so implementations must not
//! allocate or take locks the interrupted thread may hold.

use std::fmt;

use faultline_runtime::MachineContext;

// =============================================================================
// Backtracer
// =============================================================================

/// Stack walker over a saved machine context.
pub trait Backtracer: Send + Sync {
    /// Fill `frames` with return addresses, innermost first, starting at
    /// `context`. Returns the number of entries written, at most
    /// `frames.len()`. Entries are nonzero.
    ///
    /// `gc_stack` is the task's GC root-stack pointer, when known.
    fn capture(&self, frames: &mut [usize], context: &MachineContext, gc_stack: Option<usize>)
    -> usize;

    /// Best-effort description of the code at `ip`.
    fn write_code_location(&self, ip: usize, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "unknown function (ip: 0x{ip:x})")
    }
}

/// Records only the faulting instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeafFrameBacktracer;

impl Backtracer for LeafFrameBacktracer {
    fn capture(&self, frames: &mut [usize], context: &MachineContext, _: Option<usize>) -> usize {
        match frames.first_mut() {
            Some(slot) if context.ip != 0 => {
                *slot = context.ip;
                1
            }
            _ => 0,
        }
    }
}

// =============================================================================
// IoWaker
// =============================================================================

/// Wakes a thread blocked in the event loop.
pub trait IoWaker: Send + Sync {
    fn wake(&self);
}

impl<F> IoWaker for F
where
    F: Fn() + Send + Sync,
{
    #[inline]
    fn wake(&self) {
        self()
    }
}

/// Waker for runtimes with no event loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIoWaker;

impl IoWaker for NoopIoWaker {
    #[inline]
    fn wake(&self) {}
}
