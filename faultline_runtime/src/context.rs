//! Saved machine state and resumable continuations.
//!
//! A [`MachineContext`] is the portable view of the register state the OS
//! hands to a fault handler (or returns from a thread-context query). A
//! [`Continuation`] is the subset of that state captured when a protected
//! region is entered; writing a continuation into a saved context makes the
//! thread resume at the recovery point as if a non-local jump had happened
//! there.
//!
//! ```text
//!   faulting thread                      handler frame
//!   ┌──────────────┐   resume_in()      ┌──────────────┐
//!   │ ip = fault   │ ◀───────────────── │ ip = landing │
//!   │ sp = deep    │                    │ sp = frame   │
//!   │ callee-saved │                    │ callee-saved │
//!   └──────────────┘                    └──────────────┘
//! ```

// =============================================================================
// Constants
// =============================================================================

/// Number of callee-saved general purpose registers tracked.
///
/// Covers the Windows x64 nonvolatile set minus the frame pointer:
/// rbx, rsi, rdi, r12, r13, r14, r15.
pub const CALLEE_SAVED_REGS: usize = 7;

/// Value observed in the return register after a simulated non-local jump.
pub const LONGJMP_VALUE: usize = 1;

// =============================================================================
// MachineContext
// =============================================================================

/// Register state of a stopped (faulting or frozen) thread.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MachineContext {
    /// Instruction pointer.
    pub ip: usize,
    /// Stack pointer.
    pub sp: usize,
    /// Frame pointer.
    pub fp: usize,
    /// Return-value register (rax).
    pub ret: usize,
    /// First argument register (rcx on Windows x64).
    pub arg0: usize,
    /// Callee-saved registers in [`CALLEE_SAVED_REGS`] order.
    pub callee_saved: [usize; CALLEE_SAVED_REGS],
}

impl MachineContext {
    /// Create a context with only the control registers set.
    pub const fn new(ip: usize, sp: usize, fp: usize) -> Self {
        MachineContext {
            ip,
            sp,
            fp,
            ret: 0,
            arg0: 0,
            callee_saved: [0; CALLEE_SAVED_REGS],
        }
    }
}

// =============================================================================
// Continuation
// =============================================================================

/// Machine state needed to resume at a recovery point.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continuation {
    /// Landing address.
    pub ip: usize,
    /// Stack pointer at the landing address.
    pub sp: usize,
    /// Frame pointer at the landing address.
    pub fp: usize,
    /// Callee-saved registers restored on landing.
    pub callee_saved: [usize; CALLEE_SAVED_REGS],
}

impl Continuation {
    /// Create a continuation with zeroed callee-saved registers.
    pub const fn new(ip: usize, sp: usize, fp: usize) -> Self {
        Continuation {
            ip,
            sp,
            fp,
            callee_saved: [0; CALLEE_SAVED_REGS],
        }
    }

    /// Snapshot the resumable part of a context.
    pub fn capture(context: &MachineContext) -> Self {
        Continuation {
            ip: context.ip,
            sp: context.sp,
            fp: context.fp,
            callee_saved: context.callee_saved,
        }
    }

    /// Whether this continuation can be landed on at all.
    ///
    /// A null landing address or stack pointer means the frame that recorded
    /// it was never initialised.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.ip != 0 && self.sp != 0
    }

    /// Rewrite `context` so resuming it lands on this continuation.
    ///
    /// The return register receives [`LONGJMP_VALUE`], matching what a
    /// direct non-local jump would observe. Returns `false` and leaves
    /// `context` untouched when the continuation is not valid.
    pub fn resume_in(&self, context: &mut MachineContext) -> bool {
        if !self.is_valid() {
            return false;
        }
        context.ip = self.ip;
        context.sp = self.sp;
        context.fp = self.fp;
        context.callee_saved = self.callee_saved;
        context.ret = LONGJMP_VALUE;
        true
    }
}

// =============================================================================
// Tests
// =============================================================================
