//! Fault-to-exception translation.
//!
//! Given a fault record and the faulting thread's saved context, the
//! translator either rewrites the context so that resuming it lands in the
//! task's innermost exception handler with the right exception pending, or
//! reports that the fault is fatal.
//!
//! # Dispatch
//!
//! | Fault                                    | Requires            | Result                    |
//! |------------------------------------------|---------------------|---------------------------|
//! | any, record flags set                    |                     | continue search           |
//! | integer divide by zero                   | handler frame       | `DivideError`             |
//! | stack overflow                           | handler frame       | `StackOverflowError`      |
//! | access violation at the safepoint page   |                     | GC wait, maybe interrupt  |
//! | access violation, restore point set      |                     | land on restore point     |
//! | access violation writing                 | handler frame       | `ReadOnlyMemoryError`     |
//! | anything else                            |                     | unhandled                 |
//!
//! A registered safe-restore point takes precedence over the handler frame
//! for every redirect.

use faultline_runtime::{
    Continuation, ExceptionKind, HandlerChainBusy, MachineContext, Task, ThreadState,
};

use crate::fault::{AccessKind, CrtSignal, FPE_ZERODIVIDE, FaultCode, FaultRecord};
use crate::local;
use crate::platform::reset_fp_env;
use crate::runtime::SignalRuntime;

// =============================================================================
// Disposition
// =============================================================================

/// Outcome of translating one fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The context now lands on the top handler frame with `kind` pending.
    Redirected(ExceptionKind),
    /// The context now lands on the thread's safe-restore point.
    Restored,
    /// Safepoint arrival; resume at the faulting instruction.
    Resumed,
    /// Not ours to look at; let the next handler see it.
    ContinueSearch,
    /// Report and terminate.
    Unhandled,
    /// `kind` was selected but the task has no handler frame.
    NoHandler(ExceptionKind),
    /// `kind` was selected but the handler chain was mid-update; nothing
    /// was changed and the fault may be retried.
    HandlerBusy(ExceptionKind),
    /// The landing continuation is unusable; the process must abort.
    CorruptContinuation,
}

impl Disposition {
    /// Whether the faulting thread should continue with its (possibly
    /// rewritten) context.
    #[inline]
    pub fn resumes(self) -> bool {
        matches!(
            self,
            Disposition::Redirected(_) | Disposition::Restored | Disposition::Resumed
        )
    }
}

/// Outcome of a C runtime signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrtAction {
    /// Raise `kind` on the current thread.
    Raise(ExceptionKind),
    /// Jump to the safe-restore point.
    Restore(Continuation),
    /// Nothing to do.
    Ignore,
    /// Terminate with this status.
    Exit(i32),
    /// A floating-point trap other than integer division.
    UnexpectedFpe(i32),
    /// Report and re-raise with the default disposition.
    Fatal(CrtSignal),
}

// =============================================================================
// FaultTranslator
// =============================================================================

/// Translator bound to a runtime.
#[derive(Debug, Clone, Copy)]
pub struct FaultTranslator<'a> {
    rt: &'a SignalRuntime,
}

impl<'a> FaultTranslator<'a> {
    pub(crate) fn new(rt: &'a SignalRuntime) -> Self {
        FaultTranslator { rt }
    }

    /// Translate a fault raised on the calling thread.
    pub fn translate_current(&self, record: &FaultRecord, ctx: &mut MachineContext) -> Disposition {
        let restore = local::safe_restore();
        local::with_current_thread(|thread| self.translate(thread, restore, record, ctx))
    }

    /// Translate a fault raised on `thread` with `restore` registered.
    pub fn translate(
        &self,
        thread: Option<&ThreadState>,
        restore: Option<Continuation>,
        record: &FaultRecord,
        ctx: &mut MachineContext,
    ) -> Disposition {
        if record.flags != 0 {
            return Disposition::ContinueSearch;
        }

        let Some(thread) = thread else {
            return self.translate_unregistered(restore, record, ctx);
        };
        let Some(task) = thread.try_current_task() else {
            return self.translate_unregistered(restore, record, ctx);
        };
        if thread.gc_waiting() {
            return self.unhandled();
        }

        // A chain caught mid-update still has a frame to land on.
        let has_handler = !matches!(task.top_handler(), Ok(None));
        match record.code {
            FaultCode::IntDivideByZero if has_handler => {
                reset_fp_env();
                self.throw_in_context(thread, &task, ExceptionKind::DivideError, restore, ctx)
            }
            FaultCode::StackOverflow if has_handler => {
                thread.mark_needs_stack_guard_reset();
                self.throw_in_context(thread, &task, ExceptionKind::StackOverflow, restore, ctx)
            }
            FaultCode::AccessViolation => {
                if self.rt.safepoint().addr_is_safepoint(record.data_address()) {
                    return self.safepoint_arrival(thread, &task, restore, ctx);
                }
                if let Some(point) = restore {
                    return self.restore_to(point, ctx);
                }
                if has_handler && record.access_kind() == Some(AccessKind::Write) {
                    return self.throw_in_context(
                        thread,
                        &task,
                        ExceptionKind::ReadOnlyMemory,
                        restore,
                        ctx,
                    );
                }
                self.unhandled()
            }
            _ => self.unhandled(),
        }
    }

    /// Redirect `ctx` to raise `kind` in `task`.
    ///
    /// Resolves the innermost handler frame first; without one nothing is
    /// touched. Otherwise captures the backtrace, marks `kind` pending,
    /// clears the I/O-wait flag and rewrites `ctx` to land on that frame.
    /// With a restore point registered, lands there instead and touches
    /// nothing else.
    pub fn throw_in_context(
        &self,
        thread: &ThreadState,
        task: &Task,
        kind: ExceptionKind,
        restore: Option<Continuation>,
        ctx: &mut MachineContext,
    ) -> Disposition {
        if let Some(point) = restore {
            return self.restore_to(point, ctx);
        }

        let frame = match task.top_handler() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Disposition::NoHandler(kind),
            Err(HandlerChainBusy) => return Disposition::HandlerBusy(kind),
        };

        let backtracer = self.rt.backtracer();
        if kind == ExceptionKind::StackOverflow {
            if self.rt.overflow().capture(thread, &*ctx, backtracer.as_ref()) {
                self.rt.stats().record_overflow_capture();
            }
        } else if let Some(mut buffer) = thread.try_backtrace() {
            let gc_stack = task.gc_stack();
            buffer.overwrite_with(|frames| backtracer.capture(frames, &*ctx, gc_stack));
        }

        thread.set_pending_exception(kind);
        thread.set_io_wait(false);

        if !frame.continuation.resume_in(ctx) {
            return Disposition::CorruptContinuation;
        }
        self.rt.stats().record_redirect(kind);
        Disposition::Redirected(kind)
    }

    /// Decide what a C runtime signal on the calling thread does.
    pub fn crt_signal(
        &self,
        thread: Option<&ThreadState>,
        restore: Option<Continuation>,
        signal: CrtSignal,
        fpe_code: i32,
    ) -> CrtAction {
        match signal {
            CrtSignal::Fpe => {
                reset_fp_env();
                if fpe_code == FPE_ZERODIVIDE {
                    CrtAction::Raise(ExceptionKind::DivideError)
                } else {
                    CrtAction::UnexpectedFpe(fpe_code)
                }
            }
            CrtSignal::Int => {
                let policy = self.rt.interrupt_policy();
                if policy.is_ignored() {
                    CrtAction::Ignore
                } else if policy.exit_on_sigint() {
                    CrtAction::Exit(signal.exit_status())
                } else if thread.is_some_and(|t| self.rt.interrupts().poll_current(t)) {
                    CrtAction::Raise(ExceptionKind::Interrupt)
                } else {
                    CrtAction::Ignore
                }
            }
            CrtSignal::Segv => match restore {
                Some(point) => CrtAction::Restore(point),
                None => CrtAction::Fatal(signal),
            },
            other => CrtAction::Fatal(other),
        }
    }

    fn safepoint_arrival(
        &self,
        thread: &ThreadState,
        task: &Task,
        restore: Option<Continuation>,
        ctx: &mut MachineContext,
    ) -> Disposition {
        let safepoint = self.rt.safepoint();
        self.rt.stats().record_safepoint_arrival();
        safepoint.set_gc_and_wait(thread);

        if !thread.is_main() {
            return Disposition::Resumed;
        }
        if thread.signals_deferred() {
            safepoint.defer_sigint();
            return Disposition::Resumed;
        }
        // Leave the interrupt armed until the chain can be read.
        if task.top_handler().is_err() {
            return Disposition::Resumed;
        }
        if safepoint.consume_sigint() {
            self.rt.interrupt_policy().clear_force();
            return self.throw_in_context(thread, task, ExceptionKind::Interrupt, restore, ctx);
        }
        Disposition::Resumed
    }

    /// Faults on threads with no runtime state or no task.
    fn translate_unregistered(
        &self,
        restore: Option<Continuation>,
        record: &FaultRecord,
        ctx: &mut MachineContext,
    ) -> Disposition {
        match (record.code, restore) {
            (FaultCode::AccessViolation, Some(point)) => self.restore_to(point, ctx),
            _ => self.unhandled(),
        }
    }

    fn restore_to(&self, point: Continuation, ctx: &mut MachineContext) -> Disposition {
        if !point.resume_in(ctx) {
            return Disposition::CorruptContinuation;
        }
        self.rt.stats().record_restore();
        Disposition::Restored
    }

    fn unhandled(&self) -> Disposition {
        self.rt.stats().record_unhandled();
        Disposition::Unhandled
    }
}
