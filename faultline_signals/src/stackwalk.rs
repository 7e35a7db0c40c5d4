//! Stack-walk coordination and the freeze/resume primitive.
//!
//! Anything that stops another thread to look at its stack (interrupt
//! delivery, the profiler, external walkers) takes the two-level lock first:
//!
//! ```text
//!   stack-walk mutex ──► profiler mutex ──► [profile buffer lock] ──► freeze
//!        outer               inner               (profiler only)
//! ```
//!
//! A frozen thread may be holding any lock at all, so nothing done while it
//! is frozen may block on a lock it could own; readers use try-lock
//! accessors and give up when contended.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

use faultline_runtime::{MachineContext, ThreadRegistry, ThreadState};

use crate::error::PlatformError;
use crate::platform::ThreadControl;
use crate::safe_print;

// =============================================================================
// Errors
// =============================================================================

/// Why a thread could not be frozen.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FreezeError {
    /// No live record, or the thread has no current task.
    #[error("thread {0} is not running runtime code")]
    NotAlive(usize),
    /// The suspend call failed; the thread was never stopped.
    #[error("failed to suspend thread {tid}: {source}")]
    Suspend {
        tid: usize,
        #[source]
        source: PlatformError,
    },
    /// Suspended, but its context could not be read; it has been resumed.
    #[error("failed to read context of thread {tid}: {source}")]
    GetContext {
        tid: usize,
        #[source]
        source: PlatformError,
    },
}

// =============================================================================
// StackWalker
// =============================================================================

/// Owner of the stack-walk locks and the freeze primitive.
pub struct StackWalker {
    walk: Mutex<()>,
    profile: Mutex<()>,
    registry: Arc<ThreadRegistry>,
    control: Arc<dyn ThreadControl>,
}

/// Proof that both stack-walk locks are held.
///
/// Fields drop in declaration order, releasing inner before outer.
pub struct StackWalkGuard<'a> {
    _profile: MutexGuard<'a, ()>,
    _walk: MutexGuard<'a, ()>,
}

impl StackWalker {
    pub fn new(registry: Arc<ThreadRegistry>, control: Arc<dyn ThreadControl>) -> Self {
        StackWalker {
            walk: Mutex::new(()),
            profile: Mutex::new(()),
            registry,
            control,
        }
    }

    /// Take the outer, then the inner lock.
    pub fn lock(&self) -> StackWalkGuard<'_> {
        let walk = self.walk.lock();
        let profile = self.profile.lock();
        StackWalkGuard {
            _profile: profile,
            _walk: walk,
        }
    }

    /// Take both locks only if neither is contended.
    pub fn try_lock(&self) -> Option<StackWalkGuard<'_>> {
        let walk = self.walk.try_lock()?;
        let profile = self.profile.try_lock()?;
        Some(StackWalkGuard {
            _profile: profile,
            _walk: walk,
        })
    }

    /// Run `f` with the stack-walk lock held.
    pub fn with_lock<R>(&self, f: impl FnOnce(&StackWalkGuard<'_>) -> R) -> R {
        let guard = self.lock();
        f(&guard)
    }

    /// Whether either lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.walk.is_locked() || self.profile.is_locked()
    }

    #[inline]
    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    #[inline]
    pub fn control(&self) -> &Arc<dyn ThreadControl> {
        &self.control
    }

    /// Suspend thread `tid` and read its context.
    ///
    /// The thread runs again when the returned [`FrozenThread`] drops.
    pub fn freeze<'a>(
        &'a self,
        _guard: &StackWalkGuard<'_>,
        tid: usize,
    ) -> Result<FrozenThread<'a>, FreezeError> {
        let thread = self
            .registry
            .get(tid)
            .filter(|state| state.try_current_task().is_some())
            .ok_or(FreezeError::NotAlive(tid))?;

        let handle = thread.system_id();
        self.control
            .suspend(handle)
            .map_err(|source| FreezeError::Suspend { tid, source })?;

        match self.control.get_context(handle) {
            Ok(context) => Ok(FrozenThread {
                walker: self,
                thread,
                context,
                armed: true,
            }),
            Err(source) => {
                resume_or_abort(self.control.as_ref(), &thread);
                Err(FreezeError::GetContext { tid, source })
            }
        }
    }

    /// Freeze `tid` and leave it suspended.
    ///
    /// Pair with [`resume`](Self::resume) under the same lock scope.
    pub fn suspend_and_get_state(
        &self,
        guard: &StackWalkGuard<'_>,
        tid: usize,
    ) -> Result<MachineContext, FreezeError> {
        self.freeze(guard, tid).map(FrozenThread::detach)
    }

    /// Resume a thread left suspended by
    /// [`suspend_and_get_state`](Self::suspend_and_get_state).
    ///
    /// Aborts the process if the thread cannot be resumed.
    pub fn resume(&self, _guard: &StackWalkGuard<'_>, tid: usize) {
        match self.registry.get(tid) {
            Some(thread) => resume_or_abort(self.control.as_ref(), &thread),
            None => {
                safe_print!("failed to resume thread {tid}! aborting.\n");
                std::process::abort();
            }
        }
    }
}

impl fmt::Debug for StackWalker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackWalker")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

fn resume_or_abort(control: &dyn ThreadControl, thread: &ThreadState) {
    if control.resume(thread.system_id()).is_err() {
        safe_print!("failed to resume thread {}! aborting.\n", thread.tid());
        std::process::abort();
    }
}

// =============================================================================
// FrozenThread
// =============================================================================

/// A suspended thread and its saved context.
///
/// Resumes the thread on drop; a failed resume aborts the process.
pub struct FrozenThread<'a> {
    walker: &'a StackWalker,
    thread: Arc<ThreadState>,
    context: MachineContext,
    armed: bool,
}

impl FrozenThread<'_> {
    /// Context as read at freeze time, or as last written.
    #[inline]
    pub fn context(&self) -> MachineContext {
        self.context
    }

    #[inline]
    pub fn thread(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    /// Write `context` back so the thread continues there when resumed.
    pub fn set_context(&mut self, context: &MachineContext) -> Result<(), PlatformError> {
        self.walker
            .control
            .set_context(self.thread.system_id(), context)?;
        self.context = *context;
        Ok(())
    }

    /// Leave the thread suspended and return its context.
    pub fn detach(mut self) -> MachineContext {
        self.armed = false;
        debug!(tid = self.thread.tid(), "thread left suspended");
        self.context
    }
}

impl Drop for FrozenThread<'_> {
    fn drop(&mut self) {
        if self.armed {
            resume_or_abort(self.walker.control.as_ref(), &self.thread);
        }
    }
}

impl fmt::Debug for FrozenThread<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrozenThread")
            .field("tid", &self.thread.tid())
            .field("context", &self.context)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use faultline_runtime::{Task, ThreadHandle};

    use super::*;

    #[derive(Default)]
    struct CountingControl {
        suspended: AtomicUsize,
        resumed: AtomicUsize,
        fail_suspend: AtomicBool,
        fail_context: AtomicBool,
        written: Mutex<Option<MachineContext>>,
    }

    impl ThreadControl for CountingControl {
        fn suspend(&self, _: ThreadHandle) -> Result<(), PlatformError> {
            if self.fail_suspend.load(Ordering::Relaxed) {
                return Err(PlatformError::CallFailed {
                    call: "SuspendThread",
                    code: 5,
                });
            }
            self.suspended.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn get_context(&self, _: ThreadHandle) -> Result<MachineContext, PlatformError> {
            if self.fail_context.load(Ordering::Relaxed) {
                return Err(PlatformError::CallFailed {
                    call: "GetThreadContext",
                    code: 6,
                });
            }
            Ok(MachineContext::new(0x1000, 0x2000, 0x2010))
        }

        fn set_context(&self, _: ThreadHandle, ctx: &MachineContext) -> Result<(), PlatformError> {
            *self.written.lock() = Some(*ctx);
            Ok(())
        }

        fn resume(&self, _: ThreadHandle) -> Result<(), PlatformError> {
            self.resumed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn walker_with_main(task: bool) -> (StackWalker, Arc<CountingControl>) {
        let registry = Arc::new(ThreadRegistry::new(4, 16));
        let main = registry.register(ThreadHandle::from_raw(1)).unwrap();
        if task {
            main.set_current_task(Some(Arc::new(Task::new())));
        }
        let control = Arc::new(CountingControl::default());
        let walker = StackWalker::new(registry, control.clone());
        (walker, control)
    }

    #[test]
    fn test_freeze_resumes_on_drop() {
        let (walker, control) = walker_with_main(true);
        walker.with_lock(|guard| {
            let frozen = walker.freeze(guard, 0).unwrap();
            assert_eq!(frozen.context().ip, 0x1000);
            assert_eq!(control.resumed.load(Ordering::Relaxed), 0);
        });
        assert_eq!(control.suspended.load(Ordering::Relaxed), 1);
        assert_eq!(control.resumed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_freeze_requires_task() {
        let (walker, control) = walker_with_main(false);
        let guard = walker.lock();
        assert_eq!(walker.freeze(&guard, 0).unwrap_err(), FreezeError::NotAlive(0));
        assert_eq!(walker.freeze(&guard, 3).unwrap_err(), FreezeError::NotAlive(3));
        assert_eq!(control.suspended.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_suspend_failure_does_not_resume() {
        let (walker, control) = walker_with_main(true);
        control.fail_suspend.store(true, Ordering::Relaxed);
        let guard = walker.lock();
        assert!(matches!(
            walker.freeze(&guard, 0),
            Err(FreezeError::Suspend { tid: 0, .. })
        ));
        assert_eq!(control.resumed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_context_failure_resumes() {
        let (walker, control) = walker_with_main(true);
        control.fail_context.store(true, Ordering::Relaxed);
        let guard = walker.lock();
        assert!(matches!(
            walker.freeze(&guard, 0),
            Err(FreezeError::GetContext { tid: 0, .. })
        ));
        assert_eq!(control.suspended.load(Ordering::Relaxed), 1);
        assert_eq!(control.resumed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_set_context_writes_through() {
        let (walker, control) = walker_with_main(true);
        let guard = walker.lock();
        let mut frozen = walker.freeze(&guard, 0).unwrap();
        let target = MachineContext::new(0x5000, 0x6000, 0x6010);
        frozen.set_context(&target).unwrap();
        assert_eq!(frozen.context(), target);
        drop(frozen);
        assert_eq!(*control.written.lock(), Some(target));
    }

    #[test]
    fn test_detached_thread_needs_explicit_resume() {
        let (walker, control) = walker_with_main(true);
        let guard = walker.lock();
        let ctx = walker.suspend_and_get_state(&guard, 0).unwrap();
        assert_eq!(ctx.sp, 0x2000);
        assert_eq!(control.resumed.load(Ordering::Relaxed), 0);
        walker.resume(&guard, 0);
        assert_eq!(control.resumed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_try_lock_is_exclusive() {
        let (walker, _) = walker_with_main(true);
        let guard = walker.lock();
        assert!(walker.is_locked());
        assert!(walker.try_lock().is_none());
        drop(guard);
        assert!(!walker.is_locked());
        assert!(walker.try_lock().is_some());
    }
}
