//! Hardware fault and interrupt handling for a managed runtime on Windows.
//!
//! This crate provides:
//! - Translation of hardware faults into runtime exceptions raised at the
//!   faulting task's innermost handler frame
//! - Cross-thread interrupt delivery by freezing and rewriting the main
//!   thread's context
//! - The stack-walk lock and the freeze/resume primitive
//! - Stack-overflow backtrace capture on a dedicated stack
//! - A sampling profiler over the main thread
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      platform::windows                           │
//! │   exception filter    CRT signals    console control handler     │
//! └────────┬──────────────────┬──────────────────┬───────────────────┘
//!          ▼                  ▼                  ▼
//! ┌─────────────────┐  ┌─────────────┐  ┌──────────────────────┐
//! │ FaultTranslator │◄─┤  CrtAction  │  │  InterruptDelivery   │
//! └───────┬─────────┘  └─────────────┘  └──────────┬───────────┘
//!         │                                        │
//!         ▼                                        ▼
//! ┌─────────────────┐  ┌─────────────────┐  ┌─────────────┐  ┌──────────┐
//! │ OverflowCapture │  │   StackWalker   │◄─┤  Profiler   │  │ Safepoint│
//! └─────────────────┘  └─────────────────┘  └─────────────┘  └──────────┘
//! ```
//!
//! All state lives in a [`SignalRuntime`]; the OS callbacks reach it through
//! a once-initialised slot set by [`install_default_handlers`].

#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fatal;
pub mod fault;
mod fiber;
pub mod hooks;
pub mod interrupt;
pub mod local;
pub mod overflow;
pub mod platform;
pub mod profiler;
pub mod runtime;
pub mod stackwalk;
pub mod stats;
pub mod translator;

use std::sync::Arc;

pub use config::SignalConfig;
pub use error::{PlatformError, SignalError};
pub use fault::{AccessKind, CrtSignal, FaultCode, FaultRecord};
pub use hooks::{Backtracer, IoWaker, LeafFrameBacktracer, NoopIoWaker};
pub use interrupt::{DeliveryOutcome, InterruptDelivery, InterruptPolicy, SigintSuppressed};
pub use local::SafeRestoreScope;
pub use platform::{ThreadControl, TimerResolution};
pub use profiler::{ProfileBuffer, Profiler, ProfilerConfig, ProfilerError};
pub use runtime::{SignalRuntime, SignalRuntimeBuilder};
pub use stackwalk::{FreezeError, FrozenThread, StackWalkGuard, StackWalker};
pub use stats::{SignalStats, StatsSnapshot};
pub use translator::{CrtAction, Disposition, FaultTranslator};

/// Install the process-wide fault handlers and CRT signal handlers for `rt`.
pub fn install_default_handlers(rt: &Arc<SignalRuntime>) -> Result<(), SignalError> {
    #[cfg(all(windows, target_arch = "x86_64"))]
    {
        platform::windows::install_default_handlers(rt)
    }
    #[cfg(not(all(windows, target_arch = "x86_64")))]
    {
        let _ = rt;
        Err(SignalError::UnsupportedPlatform)
    }
}

/// Route console interrupts (Ctrl-C) to `rt`.
pub fn install_sigint_handler(rt: &Arc<SignalRuntime>) -> Result<(), SignalError> {
    #[cfg(all(windows, target_arch = "x86_64"))]
    {
        platform::windows::install_sigint_handler(rt)
    }
    #[cfg(not(all(windows, target_arch = "x86_64")))]
    {
        let _ = rt;
        Err(SignalError::UnsupportedPlatform)
    }
}

/// Return console interrupts to their default behaviour.
pub fn restore_signals() -> Result<(), SignalError> {
    #[cfg(all(windows, target_arch = "x86_64"))]
    {
        platform::windows::restore_signals().map_err(SignalError::from)
    }
    #[cfg(not(all(windows, target_arch = "x86_64")))]
    {
        Err(SignalError::UnsupportedPlatform)
    }
}
