//! Secondary execution context with its own stack.
//!
//! A `CaptureFiber` is a suspended coroutine on a small dedicated stack. The
//! caller switches into it on its own thread; the fiber runs its entry on
//! the fiber stack and switches straight back:
//!
//! ```text
//!   caller stack                   fiber stack
//!   ────────────                   ───────────
//!   resume(Some(r)) ──switch──►    entry(&r)
//!                   ◄──switch──    suspend(())
//!   returns                        parked until the next resume
//! ```
//!
//! No other thread is involved and nothing is allocated per request. Only
//! one request may be in flight; callers serialise externally.

use std::fmt;
use std::io;
use std::ops::Range;

use corosensei::stack::{DefaultStack, Stack};
use corosensei::{Coroutine, CoroutineResult};

/// Dedicated-stack executor for one request at a time.
pub struct CaptureFiber<T: 'static> {
    coroutine: Coroutine<Option<T>, (), (), DefaultStack>,
    stack: Range<usize>,
}

// SAFETY: the coroutine body owns nothing but a `fn` pointer and, between
// switches, no request; it reads no thread-local state, so the suspended
// stack may be resumed from any thread.
unsafe impl<T: Send + 'static> Send for CaptureFiber<T> {}

impl<T: 'static> CaptureFiber<T> {
    /// Build the fiber with a `stack_size`-byte stack running `entry` per request.
    pub fn new(stack_size: usize, entry: fn(&T)) -> io::Result<Self> {
        let stack = DefaultStack::new(stack_size)?;
        let range = stack.limit().get()..stack.base().get();
        let coroutine = Coroutine::with_stack(stack, move |yielder, mut request: Option<T>| {
            while let Some(r) = request.take() {
                entry(&r);
                request = yielder.suspend(());
            }
        });
        Ok(CaptureFiber {
            coroutine,
            stack: range,
        })
    }

    /// Run `request` on the fiber stack and return once it switches back.
    ///
    /// A fiber that has already finished ignores the request.
    pub fn switch_in(&mut self, request: T) {
        if self.coroutine.done() {
            return;
        }
        match self.coroutine.resume(Some(request)) {
            CoroutineResult::Yield(()) | CoroutineResult::Return(()) => {}
        }
    }

    /// Address range of the fiber stack.
    #[inline]
    pub fn stack_range(&self) -> Range<usize> {
        self.stack.clone()
    }
}

impl<T: 'static> Drop for CaptureFiber<T> {
    fn drop(&mut self) {
        if self.coroutine.started() && !self.coroutine.done() {
            let _ = self.coroutine.resume(None);
        }
    }
}

impl<T: 'static> fmt::Debug for CaptureFiber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureFiber")
            .field("stack", &format_args!("{:#x}..{:#x}", self.stack.start, self.stack.end))
            .finish()
    }
}
