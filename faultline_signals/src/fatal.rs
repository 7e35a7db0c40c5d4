//! Diagnostics and termination for faults nobody can handle.
//!
//! Report text is produced by plain `fmt::Write` functions so it can be
//! checked against a [`FixedBuf`](crate::diagnostics::FixedBuf); the `!`
//! entry points stream the same text to [`SafeStderr`] and end the process.

use std::fmt::{self, Write};
use std::sync::atomic::{AtomicU32, Ordering};

use faultline_runtime::{MachineContext, RuntimeException};

use crate::diagnostics::SafeStderr;
use crate::fault::{CrtSignal, FaultCode, FaultRecord};
use crate::hooks::Backtracer;

/// Frames dumped by a critical error report.
pub const CRITICAL_BACKTRACE_FRAMES: usize = 64;

// =============================================================================
// FatalState
// =============================================================================

/// How the fatal path was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalEntry {
    /// First time: print diagnostics, then exit through the runtime.
    First,
    /// A fault while already reporting one: exit immediately.
    Reentrant,
}

/// Recursion counter for the fatal path.
#[derive(Debug, Default)]
pub struct FatalState {
    depth: AtomicU32,
}

impl FatalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> FatalEntry {
        if self.depth.fetch_add(1, Ordering::SeqCst) == 0 {
            FatalEntry::First
        } else {
            FatalEntry::Reentrant
        }
    }

    /// Times the fatal path has been entered.
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Report text
// =============================================================================

/// Note printed ahead of the report for an illegal instruction.
pub fn write_illegal_instruction<W: Write + ?Sized>(out: &mut W, ip: usize) -> fmt::Result {
    writeln!(out, "Invalid instruction at 0x{ip:x}")
}

/// Bug-report banner with the fault name and location.
pub fn write_fault_report<W: Write + ?Sized>(
    out: &mut W,
    record: &FaultRecord,
    backtracer: &dyn Backtracer,
) -> fmt::Result {
    if record.code == FaultCode::IllegalInstruction {
        write_illegal_instruction(out, record.address)?;
    }
    out.write_str(
        "\nPlease submit a bug report with steps to reproduce this fault, and any error messages that follow (in their entirety). Thanks.\nException: ",
    )?;
    out.write_str(record.code.name())?;
    write!(out, " at 0x{:x} -- ", record.address)?;
    let mut sink = DynSink(&mut *out);
    backtracer.write_code_location(record.address, &mut sink)?;
    out.write_char('\n')
}

/// Signal header and backtrace dump of `context`.
///
/// `signal` is `None` for hardware exceptions, which carry no signal number.
pub fn write_critical_error<W: Write + ?Sized>(
    out: &mut W,
    signal: Option<CrtSignal>,
    context: &MachineContext,
    backtracer: &dyn Backtracer,
) -> fmt::Result {
    if let Some(sig) = signal {
        writeln!(
            out,
            "\n[{}] signal {}: {}",
            std::process::id(),
            sig.raw(),
            sig.name()
        )?;
    }
    let mut frames = [0usize; CRITICAL_BACKTRACE_FRAMES];
    let n = backtracer
        .capture(&mut frames, context, None)
        .min(CRITICAL_BACKTRACE_FRAMES);
    for &ip in &frames[..n] {
        out.write_str("in ")?;
        let mut sink = DynSink(&mut *out);
        backtracer.write_code_location(ip, &mut sink)?;
        out.write_char('\n')?;
    }
    Ok(())
}

/// Report for an exception raised where no handler frame exists.
pub fn write_no_handler<W: Write + ?Sized>(
    out: &mut W,
    exception: &RuntimeException,
) -> fmt::Result {
    writeln!(
        out,
        "fatal: error thrown and no exception handler available.\n{exception}"
    )
}

/// Adapter from a generic writer to `&mut dyn Write`.
struct DynSink<'a, W: Write + ?Sized>(&'a mut W);

impl<W: Write + ?Sized> Write for DynSink<'_, W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s)
    }
}

// =============================================================================
// Termination
// =============================================================================

/// Terminate without running exit handlers.
pub fn hard_exit(code: i32) -> ! {
    #[cfg(unix)]
    {
        // SAFETY: `_exit` is async-signal-safe and never returns.
        unsafe { libc::_exit(code) }
    }
    #[cfg(not(unix))]
    {
        std::process::exit(code)
    }
}

/// Print the full report for an unhandled fault and terminate.
pub fn die_unhandled(
    state: &FatalState,
    record: &FaultRecord,
    context: &MachineContext,
    backtracer: &dyn Backtracer,
) -> ! {
    if state.enter() == FatalEntry::Reentrant {
        hard_exit(1);
    }
    let mut out = SafeStderr;
    let _ = write_fault_report(&mut out, record, backtracer);
    let _ = write_critical_error(&mut out, None, context, backtracer);
    std::process::exit(1)
}

/// Print a signal report and terminate.
pub fn die_on_signal(
    state: &FatalState,
    signal: CrtSignal,
    context: &MachineContext,
    backtracer: &dyn Backtracer,
) -> ! {
    if state.enter() == FatalEntry::Reentrant {
        hard_exit(1);
    }
    let mut out = SafeStderr;
    if signal == CrtSignal::Ill {
        let _ = write_illegal_instruction(&mut out, context.ip);
    }
    let _ = write_critical_error(&mut out, Some(signal), context, backtracer);
    std::process::exit(1)
}

/// Report an exception with no handler to catch it and terminate.
pub fn die_no_handler(state: &FatalState, exception: &RuntimeException) -> ! {
    if state.enter() == FatalEntry::Reentrant {
        hard_exit(1);
    }
    let _ = write_no_handler(&mut SafeStderr, exception);
    std::process::exit(1)
}

/// Abort after failing to land on a continuation.
pub fn die_corrupt_continuation() -> ! {
    let _ = SafeStderr.write_str("fatal: corrupt exception handler continuation\n");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use faultline_runtime::ExceptionKind;

    use super::*;
    use crate::diagnostics::FixedBuf;
    use crate::hooks::LeafFrameBacktracer;

    struct Named;

    impl Backtracer for Named {
        fn capture(&self, frames: &mut [usize], ctx: &MachineContext, _: Option<usize>) -> usize {
            frames[0] = ctx.ip;
            frames[1] = ctx.ip + 0x10;
            2
        }

        fn write_code_location(&self, ip: usize, out: &mut dyn Write) -> fmt::Result {
            write!(out, "f{ip:x} at sample.rs:1")
        }
    }

    #[test]
    fn test_recursion_counter() {
        let state = FatalState::new();
        assert_eq!(state.enter(), FatalEntry::First);
        assert_eq!(state.enter(), FatalEntry::Reentrant);
        assert_eq!(state.depth(), 2);
    }

    #[test]
    fn test_fault_report_text() {
        let mut out = FixedBuf::<512>::new();
        let record = FaultRecord::new(FaultCode::AccessViolation, 0xabc);
        write_fault_report(&mut out, &record, &LeafFrameBacktracer).unwrap();
        assert_eq!(
            out.as_str(),
            "\nPlease submit a bug report with steps to reproduce this fault, and any error messages that follow (in their entirety). Thanks.\n\
             Exception: EXCEPTION_ACCESS_VIOLATION at 0xabc -- unknown function (ip: 0xabc)\n"
        );
    }

    #[test]
    fn test_unknown_code_and_illegal_instruction() {
        let mut out = FixedBuf::<512>::new();
        write_fault_report(&mut out, &FaultRecord::new(FaultCode::Unknown(0x42), 0x10), &Named)
            .unwrap();
        assert!(out.as_str().contains("Exception: UNKNOWN at 0x10 -- f10 at sample.rs:1"));

        out.clear();
        write_fault_report(
            &mut out,
            &FaultRecord::new(FaultCode::IllegalInstruction, 0x20),
            &Named,
        )
        .unwrap();
        assert!(out.as_str().starts_with("Invalid instruction at 0x20\n"));
    }

    #[test]
    fn test_critical_error_dump() {
        let mut out = FixedBuf::<512>::new();
        let ctx = MachineContext::new(0x100, 0x200, 0x210);
        write_critical_error(&mut out, Some(CrtSignal::Segv), &ctx, &Named).unwrap();
        let text = out.as_str();
        assert!(text.contains("signal 11: SIGSEGV"));
        assert!(text.contains("in f100 at sample.rs:1\n"));
        assert!(text.contains("in f110 at sample.rs:1\n"));
    }

    #[test]
    fn test_no_handler_text() {
        let mut out = FixedBuf::<256>::new();
        write_no_handler(&mut out, ExceptionKind::DivideError.singleton()).unwrap();
        assert_eq!(
            out.as_str(),
            "fatal: error thrown and no exception handler available.\nDivideError: integer division error\n"
        );
    }
}
