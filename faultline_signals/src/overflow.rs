//! Backtrace capture for stack-overflow faults.
//!
//! A thread that overflowed has no stack left to run the unwinder on. The
//! capture switches the faulting thread onto a [`CaptureFiber`] with its own
//! stack, walks the faulting context into the thread's backtrace buffer and
//! switches back. The fiber is built lazily by the first per-thread install
//! and shared by the whole process; a spin lock keeps one capture in flight
//! at a time without parking on the exhausted stack.

use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use faultline_runtime::{MachineContext, ThreadState};

use crate::diagnostics::warn_stack_overflow_once;
use crate::error::SignalError;
use crate::fiber::CaptureFiber;
use crate::hooks::Backtracer;

// =============================================================================
// OverflowRequest
// =============================================================================

/// Pointers published to the fiber for one capture.
///
/// Valid only for the duration of the switch made by
/// [`OverflowCapture::capture`].
#[derive(Clone, Copy)]
struct OverflowRequest {
    context: *const MachineContext,
    thread: *const ThreadState,
    backtracer: *const dyn Backtracer,
}

// SAFETY: the pointees are Sync and outlive the switch; the fiber switches
// back before `capture` returns.
unsafe impl Send for OverflowRequest {}

#[inline(never)]
fn collect_overflow_backtrace(request: &OverflowRequest) {
    warn_stack_overflow_once();
    // SAFETY: see `OverflowRequest`.
    let (context, thread, backtracer) =
        unsafe { (&*request.context, &*request.thread, &*request.backtracer) };
    if let Some(mut buffer) = thread.try_backtrace() {
        buffer.overwrite_with(|frames| backtracer.capture(frames, context, None));
    }
}

// =============================================================================
// OverflowCapture
// =============================================================================

/// Process-wide overflow capture context.
pub struct OverflowCapture {
    stack_size: usize,
    installed: AtomicBool,
    fiber: Mutex<Option<CaptureFiber<OverflowRequest>>>,
}

impl OverflowCapture {
    pub fn new(stack_size: usize) -> Self {
        OverflowCapture {
            stack_size,
            installed: AtomicBool::new(false),
            fiber: Mutex::new(None),
        }
    }

    /// Build the capture context if nobody has yet.
    pub fn install(&self) -> Result<(), SignalError> {
        if self.is_installed() {
            return Ok(());
        }
        let mut slot = self.fiber.lock();
        if slot.is_none() {
            let fiber = CaptureFiber::new(self.stack_size, collect_overflow_backtrace)
                .map_err(SignalError::OverflowStack)?;
            *slot = Some(fiber);
            self.installed.store(true, Ordering::Release);
            debug!(stack_size = self.stack_size, "overflow capture context installed");
        }
        Ok(())
    }

    #[inline]
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Capture `thread`'s backtrace from `context` on the fiber stack.
    ///
    /// Runs on the calling thread. Without an installed context the buffer
    /// is left empty. Returns whether a capture ran.
    pub fn capture(
        &self,
        thread: &ThreadState,
        context: &MachineContext,
        backtracer: &(dyn Backtracer + 'static),
    ) -> bool {
        if !self.is_installed() {
            if let Some(mut buffer) = thread.try_backtrace() {
                buffer.clear();
            }
            return false;
        }
        let mut slot = loop {
            if let Some(slot) = self.fiber.try_lock() {
                break slot;
            }
            hint::spin_loop();
        };
        let Some(fiber) = slot.as_mut() else {
            return false;
        };
        fiber.switch_in(OverflowRequest {
            context,
            thread,
            backtracer,
        });
        true
    }
}

impl fmt::Debug for OverflowCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverflowCapture")
            .field("stack_size", &self.stack_size)
            .field("installed", &self.is_installed())
            .finish()
    }
}
