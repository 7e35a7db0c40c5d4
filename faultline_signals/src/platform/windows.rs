//! Windows x64 glue.
//!
//! Everything here is a thin adapter: OS callbacks convert the native
//! records into [`FaultRecord`]/[`MachineContext`], ask the installed
//! [`SignalRuntime`] what to do, and write the answer back.
//!
//! | OS entry point              | Routed to                                |
//! |-----------------------------|------------------------------------------|
//! | unhandled exception filter  | [`FaultTranslator::translate_current`]   |
//! | CRT `signal` handlers       | [`FaultTranslator::crt_signal`]          |
//! | console control handler     | [`InterruptDelivery::request`]           |
//!
//! [`FaultTranslator::translate_current`]: crate::translator::FaultTranslator::translate_current
//! [`FaultTranslator::crt_signal`]: crate::translator::FaultTranslator::crt_signal
//! [`InterruptDelivery::request`]: crate::interrupt::InterruptDelivery::request

use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};
use windows_sys::Win32::Foundation::{BOOL, DuplicateHandle, HANDLE};
use windows_sys::Win32::Media::{TIMECAPS, timeBeginPeriod, timeEndPeriod, timeGetDevCaps};
use windows_sys::Win32::System::Console::SetConsoleCtrlHandler;
use windows_sys::Win32::System::Diagnostics::Debug::{
    CONTEXT, EXCEPTION_POINTERS, EXCEPTION_RECORD, GetThreadContext, RtlCaptureContext,
    RtlRestoreContext, SetThreadContext, SetUnhandledExceptionFilter,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentThread, ResumeThread, SetThreadPriority, SuspendThread,
    THREAD_GET_CONTEXT, THREAD_PRIORITY_ABOVE_NORMAL, THREAD_QUERY_INFORMATION,
    THREAD_SET_CONTEXT, THREAD_SUSPEND_RESUME,
};

use faultline_runtime::{ExceptionKind, MachineContext, ThreadHandle};

use crate::error::{PlatformError, SignalError};
use crate::fatal::{self, FatalEntry};
use crate::fault::{CrtSignal, FaultCode, FaultRecord};
use crate::interrupt::{DeliveryOutcome, console_event_signal};
use crate::local;
use crate::platform::{ThreadControl, TimerResolution};
use crate::runtime::SignalRuntime;
use crate::safe_print;
use crate::translator::{CrtAction, Disposition};

const CONTEXT_AMD64: u32 = 0x0010_0000;
const CONTEXT_CONTROL: u32 = CONTEXT_AMD64 | 0x1;
const CONTEXT_INTEGER: u32 = CONTEXT_AMD64 | 0x2;
const CONTEXT_FULL: u32 = CONTEXT_AMD64 | 0xB;

const TIMERR_NOERROR: u32 = 0;

const SIG_DFL: libc::sighandler_t = 0;
const SIG_ERR: libc::sighandler_t = !0;

// =============================================================================
// Context conversion
// =============================================================================

#[repr(align(16))]
struct AlignedContext(CONTEXT);

impl AlignedContext {
    fn zeroed(flags: u32) -> Self {
        // SAFETY: CONTEXT is plain old data; all-zero is a valid value.
        let mut ctx = unsafe { std::mem::zeroed::<AlignedContext>() };
        ctx.0.ContextFlags = flags;
        ctx
    }
}

fn read_context(ctx: &CONTEXT) -> MachineContext {
    MachineContext {
        ip: ctx.Rip as usize,
        sp: ctx.Rsp as usize,
        fp: ctx.Rbp as usize,
        ret: ctx.Rax as usize,
        arg0: ctx.Rcx as usize,
        callee_saved: [
            ctx.Rbx as usize,
            ctx.Rsi as usize,
            ctx.Rdi as usize,
            ctx.R12 as usize,
            ctx.R13 as usize,
            ctx.R14 as usize,
            ctx.R15 as usize,
        ],
    }
}

fn write_context(ctx: &mut CONTEXT, state: &MachineContext) {
    ctx.Rip = state.ip as u64;
    ctx.Rsp = state.sp as u64;
    ctx.Rbp = state.fp as u64;
    ctx.Rax = state.ret as u64;
    ctx.Rcx = state.arg0 as u64;
    let [rbx, rsi, rdi, r12, r13, r14, r15] = state.callee_saved;
    ctx.Rbx = rbx as u64;
    ctx.Rsi = rsi as u64;
    ctx.Rdi = rdi as u64;
    ctx.R12 = r12 as u64;
    ctx.R13 = r13 as u64;
    ctx.R14 = r14 as u64;
    ctx.R15 = r15 as u64;
}

fn fault_record(record: &EXCEPTION_RECORD) -> FaultRecord {
    FaultRecord {
        code: FaultCode::from_raw(record.ExceptionCode as u32),
        flags: record.ExceptionFlags,
        address: record.ExceptionAddress as usize,
        info: [record.ExceptionInformation[0], record.ExceptionInformation[1]],
    }
}

#[inline]
fn as_handle(thread: ThreadHandle) -> HANDLE {
    thread.as_raw() as HANDLE
}

// =============================================================================
// Thread control
// =============================================================================

/// [`ThreadControl`] over `SuspendThread`/`GetThreadContext`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Win32ThreadControl;

impl ThreadControl for Win32ThreadControl {
    fn suspend(&self, thread: ThreadHandle) -> Result<(), PlatformError> {
        // SAFETY: the handle was duplicated with THREAD_SUSPEND_RESUME.
        if unsafe { SuspendThread(as_handle(thread)) } == u32::MAX {
            return Err(PlatformError::last_os_error("SuspendThread"));
        }
        Ok(())
    }

    fn get_context(&self, thread: ThreadHandle) -> Result<MachineContext, PlatformError> {
        let mut ctx = AlignedContext::zeroed(CONTEXT_CONTROL | CONTEXT_INTEGER);
        // SAFETY: `ctx` is a 16-byte aligned CONTEXT with its flags set.
        if unsafe { GetThreadContext(as_handle(thread), &mut ctx.0) } == 0 {
            return Err(PlatformError::last_os_error("GetThreadContext"));
        }
        Ok(read_context(&ctx.0))
    }

    fn set_context(
        &self,
        thread: ThreadHandle,
        context: &MachineContext,
    ) -> Result<(), PlatformError> {
        let handle = as_handle(thread);
        let mut ctx = AlignedContext::zeroed(CONTEXT_FULL);
        // SAFETY: as above; the thread is suspended, so the context read
        // here is the one we overwrite.
        if unsafe { GetThreadContext(handle, &mut ctx.0) } == 0 {
            return Err(PlatformError::last_os_error("GetThreadContext"));
        }
        write_context(&mut ctx.0, context);
        // SAFETY: `ctx` holds a complete context for this thread.
        if unsafe { SetThreadContext(handle, &ctx.0) } == 0 {
            return Err(PlatformError::last_os_error("SetThreadContext"));
        }
        Ok(())
    }

    fn resume(&self, thread: ThreadHandle) -> Result<(), PlatformError> {
        // SAFETY: the handle was duplicated with THREAD_SUSPEND_RESUME.
        if unsafe { ResumeThread(as_handle(thread)) } == u32::MAX {
            return Err(PlatformError::last_os_error("ResumeThread"));
        }
        Ok(())
    }
}

/// A real handle to the calling thread, usable from other threads.
pub fn current_thread_handle() -> Result<ThreadHandle, PlatformError> {
    let mut handle: HANDLE = std::ptr::null_mut();
    let access =
        THREAD_SUSPEND_RESUME | THREAD_GET_CONTEXT | THREAD_SET_CONTEXT | THREAD_QUERY_INFORMATION;
    // SAFETY: pseudo handles of the current process and thread are always
    // valid; `handle` receives the duplicate.
    let ok = unsafe {
        let process = GetCurrentProcess();
        DuplicateHandle(
            process,
            GetCurrentThread(),
            process,
            &mut handle,
            access,
            0,
            0,
        )
    };
    if ok == 0 {
        return Err(PlatformError::last_os_error("DuplicateHandle"));
    }
    Ok(ThreadHandle::from_raw(handle as usize))
}

pub(crate) fn raise_current_thread_priority() {
    // SAFETY: the pseudo handle always refers to the calling thread.
    if unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_ABOVE_NORMAL) } == 0 {
        debug!("SetThreadPriority failed");
    }
}

unsafe extern "C" {
    fn _resetstkoflw() -> i32;
}

pub(crate) fn reset_stack_overflow_guard() {
    // SAFETY: called from ordinary code after the overflowing frames are gone.
    if unsafe { _resetstkoflw() } == 0 {
        warn!("failed to reset the stack overflow guard page");
    }
}

// =============================================================================
// Timer resolution
// =============================================================================

/// [`TimerResolution`] over the multimedia timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultimediaTimer;

impl TimerResolution for MultimediaTimer {
    fn min_period(&self) -> Result<u32, PlatformError> {
        let mut caps = TIMECAPS {
            wPeriodMin: 0,
            wPeriodMax: 0,
        };
        // SAFETY: `caps` is a valid TIMECAPS of the size passed.
        let rc = unsafe { timeGetDevCaps(&mut caps, std::mem::size_of::<TIMECAPS>() as u32) };
        if rc != TIMERR_NOERROR {
            return Err(PlatformError::CallFailed {
                call: "timeGetDevCaps",
                code: rc as i32,
            });
        }
        Ok(caps.wPeriodMin)
    }

    fn begin(&self, period_ms: u32) -> Result<(), PlatformError> {
        // SAFETY: no pointer arguments.
        let rc = unsafe { timeBeginPeriod(period_ms) };
        if rc != TIMERR_NOERROR {
            return Err(PlatformError::CallFailed {
                call: "timeBeginPeriod",
                code: rc as i32,
            });
        }
        Ok(())
    }

    fn end(&self, period_ms: u32) {
        // SAFETY: paired with a successful `begin`.
        unsafe { timeEndPeriod(period_ms) };
    }
}

// =============================================================================
// Installation
// =============================================================================

static RUNTIME: OnceLock<Arc<SignalRuntime>> = OnceLock::new();

fn installed() -> Option<&'static SignalRuntime> {
    RUNTIME.get().map(Arc::as_ref)
}

fn bind_runtime(rt: &Arc<SignalRuntime>) -> Result<(), SignalError> {
    let bound = RUNTIME.get_or_init(|| Arc::clone(rt));
    if Arc::ptr_eq(bound, rt) {
        Ok(())
    } else {
        Err(SignalError::AlreadyInstalled)
    }
}

type CrtHandler = extern "C" fn(i32, i32);

const CRT_SIGNALS: [(i32, &str); 6] = [
    (libc::SIGFPE, "SIGFPE"),
    (libc::SIGILL, "SIGILL"),
    (libc::SIGINT, "SIGINT"),
    (libc::SIGSEGV, "SIGSEGV"),
    (libc::SIGTERM, "SIGTERM"),
    (libc::SIGABRT, "SIGABRT"),
];

fn set_crt_handler(sig: i32) -> bool {
    let handler: CrtHandler = crt_signal_handler;
    // SAFETY: the CRT passes the FPE sub-code as a second argument to
    // SIGFPE handlers and ignores it for the others.
    unsafe { libc::signal(sig, handler as libc::sighandler_t) != SIG_ERR }
}

/// Install the process-wide fault and signal handlers for `rt`.
pub fn install_default_handlers(rt: &Arc<SignalRuntime>) -> Result<(), SignalError> {
    bind_runtime(rt)?;
    for (sig, name) in CRT_SIGNALS {
        if !set_crt_handler(sig) {
            return Err(SignalError::SignalInstall(name));
        }
    }
    // SAFETY: the filter is a plain function valid for the process lifetime.
    unsafe { SetUnhandledExceptionFilter(Some(exception_filter)) };
    debug!("default fault handlers installed");
    Ok(())
}

/// Route console control events to interrupt delivery.
pub fn install_sigint_handler(rt: &Arc<SignalRuntime>) -> Result<(), SignalError> {
    bind_runtime(rt)?;
    // SAFETY: the routine is a plain function valid for the process lifetime.
    if unsafe { SetConsoleCtrlHandler(Some(console_ctrl_handler), 1) } == 0 {
        return Err(PlatformError::last_os_error("SetConsoleCtrlHandler").into());
    }
    debug!("console interrupt handler installed");
    Ok(())
}

/// Give Ctrl-C back to the default console behaviour.
pub fn restore_signals() -> Result<(), PlatformError> {
    // SAFETY: a null routine with FALSE re-enables default Ctrl-C handling.
    if unsafe { SetConsoleCtrlHandler(None, 0) } == 0 {
        return Err(PlatformError::last_os_error("SetConsoleCtrlHandler"));
    }
    Ok(())
}

// =============================================================================
// OS callbacks
// =============================================================================

unsafe extern "system" fn exception_filter(info: *const EXCEPTION_POINTERS) -> i32 {
    const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
    const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

    let Some(rt) = installed() else {
        return EXCEPTION_CONTINUE_SEARCH;
    };
    // SAFETY: the OS passes valid record and context pointers for the
    // duration of the callback.
    let (record, context) = unsafe { (&*(*info).ExceptionRecord, &mut *(*info).ContextRecord) };
    let record = fault_record(record);
    let mut state = read_context(context);

    match rt.translator().translate_current(&record, &mut state) {
        Disposition::Redirected(_) | Disposition::Restored => {
            write_context(context, &state);
            EXCEPTION_CONTINUE_EXECUTION
        }
        // Nothing was written; the instruction faults again and retries.
        Disposition::Resumed | Disposition::HandlerBusy(_) => EXCEPTION_CONTINUE_EXECUTION,
        Disposition::ContinueSearch => EXCEPTION_CONTINUE_SEARCH,
        Disposition::Unhandled => {
            fatal::die_unhandled(rt.fatal_state(), &record, &state, rt.backtracer().as_ref())
        }
        Disposition::NoHandler(kind) => fatal::die_no_handler(rt.fatal_state(), kind.singleton()),
        Disposition::CorruptContinuation => fatal::die_corrupt_continuation(),
    }
}

extern "C" fn crt_signal_handler(sig: i32, fpe_code: i32) {
    let signal = CrtSignal::from_raw(sig);
    let Some(rt) = installed() else {
        reraise_default(sig);
        return;
    };

    let restore = local::safe_restore();
    let action = local::with_current_thread(|thread| {
        rt.translator().crt_signal(thread, restore, signal, fpe_code)
    });

    match action {
        CrtAction::Raise(kind) => {
            set_crt_handler(sig);
            raise_here(rt, kind);
        }
        CrtAction::Restore(point) => {
            set_crt_handler(sig);
            let mut ctx = capture_context();
            let mut state = read_context(&ctx.0);
            if !point.resume_in(&mut state) {
                fatal::die_corrupt_continuation();
            }
            jump_to(&mut ctx, &state);
        }
        CrtAction::Ignore => {
            set_crt_handler(sig);
        }
        CrtAction::Exit(status) => std::process::exit(status),
        CrtAction::UnexpectedFpe(code) => {
            if rt.fatal_state().enter() == FatalEntry::Reentrant {
                fatal::hard_exit(1);
            }
            safe_print!("Unexpected FPE Error 0x{code:X}\n");
            std::process::exit(1)
        }
        CrtAction::Fatal(signal) => {
            let ctx = capture_context();
            let state = read_context(&ctx.0);
            if rt.fatal_state().enter() == FatalEntry::Reentrant {
                fatal::hard_exit(1);
            }
            let mut out = crate::diagnostics::SafeStderr;
            if signal == CrtSignal::Ill {
                let _ = fatal::write_illegal_instruction(&mut out, state.ip);
            }
            let _ = fatal::write_critical_error(
                &mut out,
                Some(signal),
                &state,
                rt.backtracer().as_ref(),
            );
            reraise_default(sig);
        }
    }
}

/// Raise `kind` on the calling thread from inside a CRT handler.
fn raise_here(rt: &SignalRuntime, kind: ExceptionKind) {
    let mut ctx = capture_context();
    let mut state = read_context(&ctx.0);
    let restore = local::safe_restore();
    loop {
        let disposition = local::with_current_thread(|thread| match thread {
            Some(thread) => match thread.try_current_task() {
                Some(task) => rt
                    .translator()
                    .throw_in_context(thread, &task, kind, restore, &mut state),
                None => Disposition::NoHandler(kind),
            },
            None => Disposition::NoHandler(kind),
        });
        match disposition {
            Disposition::Redirected(_) | Disposition::Restored => jump_to(&mut ctx, &state),
            Disposition::HandlerBusy(_) => std::hint::spin_loop(),
            Disposition::CorruptContinuation => fatal::die_corrupt_continuation(),
            _ => fatal::die_no_handler(rt.fatal_state(), kind.singleton()),
        }
    }
}

fn capture_context() -> AlignedContext {
    let mut ctx = AlignedContext::zeroed(CONTEXT_FULL);
    // SAFETY: `ctx` is a writable, aligned CONTEXT.
    unsafe { RtlCaptureContext(&mut ctx.0) };
    ctx
}

fn jump_to(ctx: &mut AlignedContext, state: &MachineContext) -> ! {
    write_context(&mut ctx.0, state);
    // SAFETY: `ctx` was captured on this thread and now points at a live
    // continuation frame further up the stack.
    unsafe { RtlRestoreContext(&ctx.0, std::ptr::null::<EXCEPTION_RECORD>()) };
    std::process::abort()
}

fn reraise_default(sig: i32) {
    // SAFETY: restoring the default disposition and raising are plain CRT
    // calls with valid arguments.
    unsafe {
        libc::signal(sig, SIG_DFL);
        libc::raise(sig);
    }
}

unsafe extern "system" fn console_ctrl_handler(event: u32) -> BOOL {
    let Some(rt) = installed() else {
        return 0;
    };
    match rt.interrupts().request(console_event_signal(event)) {
        DeliveryOutcome::Exit(status) => std::process::exit(status),
        DeliveryOutcome::NoHandler => {
            let exception = ExceptionKind::Interrupt.singleton();
            fatal::die_no_handler(rt.fatal_state(), exception)
        }
        DeliveryOutcome::CorruptContinuation => fatal::die_corrupt_continuation(),
        outcome => debug!(?outcome, event, "console event handled"),
    }
    1
}
