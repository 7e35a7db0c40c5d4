//! Per-thread runtime state.
//!
//! One [`ThreadState`] exists for every OS thread known to the runtime. The
//! owning thread mutates most fields; the fault layer reads them from fault
//! context, and the interrupt and profiler paths read them from other
//! threads while the owner is frozen. Every field touched from those paths
//! is either atomic or guarded by a lock that is only ever *tried*.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::exception::ExceptionKind;
use crate::task::Task;

/// Index of the initial thread; the only interrupt-delivery target.
pub const MAIN_THREAD_INDEX: usize = 0;

// =============================================================================
// ThreadHandle
// =============================================================================

/// Opaque OS thread handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(usize);

impl ThreadHandle {
    /// Wrap a raw OS handle value.
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        ThreadHandle(raw)
    }

    /// The raw OS handle value.
    #[inline]
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

// =============================================================================
// BacktraceBuffer
// =============================================================================

/// Fixed-capacity instruction-pointer buffer holding the latest capture.
#[derive(Debug)]
pub struct BacktraceBuffer {
    frames: Box<[usize]>,
    len: usize,
}

impl BacktraceBuffer {
    /// Preallocate a buffer of `capacity` frames.
    pub fn with_capacity(capacity: usize) -> Self {
        BacktraceBuffer {
            frames: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Maximum number of frames.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Frames recorded by the latest capture.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the latest capture recorded nothing.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The latest capture.
    #[inline]
    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.len]
    }

    /// Discard the latest capture.
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Overwrite the buffer with a new capture.
    ///
    /// `capture` receives the whole backing slice and returns how many
    /// frames it wrote; the count is clamped to the capacity.
    pub fn overwrite_with<F>(&mut self, capture: F) -> usize
    where
        F: FnOnce(&mut [usize]) -> usize,
    {
        let written = capture(&mut self.frames);
        self.len = written.min(self.frames.len());
        self.len
    }
}

// =============================================================================
// ThreadState
// =============================================================================

/// Runtime state of one OS thread.
#[derive(Debug)]
pub struct ThreadState {
    tid: usize,
    system_id: ThreadHandle,
    current_task: RwLock<Option<Arc<Task>>>,
    defer_signal: AtomicU32,
    io_wait: AtomicBool,
    sleeping: AtomicBool,
    gc_waiting: AtomicBool,
    needs_stack_guard_reset: AtomicBool,
    pending_exception: AtomicU8,
    backtrace: Mutex<BacktraceBuffer>,
}

impl ThreadState {
    /// Create the state record for thread `tid`.
    pub fn new(tid: usize, system_id: ThreadHandle, backtrace_capacity: usize) -> Self {
        ThreadState {
            tid,
            system_id,
            current_task: RwLock::new(None),
            defer_signal: AtomicU32::new(0),
            io_wait: AtomicBool::new(false),
            sleeping: AtomicBool::new(false),
            gc_waiting: AtomicBool::new(false),
            needs_stack_guard_reset: AtomicBool::new(false),
            pending_exception: AtomicU8::new(0),
            backtrace: Mutex::new(BacktraceBuffer::with_capacity(backtrace_capacity)),
        }
    }

    /// Registry index.
    #[inline]
    pub fn tid(&self) -> usize {
        self.tid
    }

    /// Whether this is the designated main thread.
    #[inline]
    pub fn is_main(&self) -> bool {
        self.tid == MAIN_THREAD_INDEX
    }

    /// OS handle used to freeze and resume the thread.
    #[inline]
    pub fn system_id(&self) -> ThreadHandle {
        self.system_id
    }

    // -------------------------------------------------------------------------
    // Current task
    // -------------------------------------------------------------------------

    /// Task currently running on this thread.
    pub fn current_task(&self) -> Option<Arc<Task>> {
        self.current_task.read().clone()
    }

    /// Task currently running on this thread, without blocking.
    ///
    /// `None` if the scheduler is switching tasks right now.
    pub fn try_current_task(&self) -> Option<Arc<Task>> {
        self.current_task.try_read().and_then(|task| task.clone())
    }

    /// Install the running task (scheduler-owned).
    pub fn set_current_task(&self, task: Option<Arc<Task>>) {
        *self.current_task.write() = task;
    }

    // -------------------------------------------------------------------------
    // Signal deferral
    // -------------------------------------------------------------------------

    /// Enter a region where asynchronous interrupts must not be raised.
    #[inline]
    pub fn begin_defer_signal(&self) {
        self.defer_signal.fetch_add(1, Ordering::AcqRel);
    }

    /// Leave a deferral region.
    #[inline]
    pub fn end_defer_signal(&self) {
        let _ = self
            .defer_signal
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Whether interrupts are currently deferred.
    #[inline]
    pub fn signals_deferred(&self) -> bool {
        self.defer_signal.load(Ordering::Acquire) != 0
    }

    // -------------------------------------------------------------------------
    // Status flags
    // -------------------------------------------------------------------------

    /// Whether the thread is blocked in the event loop.
    #[inline]
    pub fn io_wait(&self) -> bool {
        self.io_wait.load(Ordering::Acquire)
    }

    /// Mark the thread as entering or leaving an I/O wait.
    #[inline]
    pub fn set_io_wait(&self, waiting: bool) {
        self.io_wait.store(waiting, Ordering::Release);
    }

    /// Whether the scheduler considers the thread asleep.
    #[inline]
    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }

    /// Update the sleep state (scheduler-owned).
    #[inline]
    pub fn set_sleeping(&self, sleeping: bool) {
        self.sleeping.store(sleeping, Ordering::Release);
    }

    /// Whether the thread is parked waiting for a collection.
    #[inline]
    pub fn gc_waiting(&self) -> bool {
        self.gc_waiting.load(Ordering::Acquire)
    }

    /// Update the GC wait state (safepoint-owned).
    #[inline]
    pub fn set_gc_waiting(&self, waiting: bool) {
        self.gc_waiting.store(waiting, Ordering::Release);
    }

    /// Record that the stack guard page was consumed by an overflow.
    #[inline]
    pub fn mark_needs_stack_guard_reset(&self) {
        self.needs_stack_guard_reset.store(true, Ordering::Release);
    }

    /// Consume the guard-reset request.
    #[inline]
    pub fn take_needs_stack_guard_reset(&self) -> bool {
        self.needs_stack_guard_reset.swap(false, Ordering::AcqRel)
    }

    // -------------------------------------------------------------------------
    // Pending exception
    // -------------------------------------------------------------------------

    /// Store the exception the thread will raise when it resumes.
    #[inline]
    pub fn set_pending_exception(&self, kind: ExceptionKind) {
        self.pending_exception.store(kind as u8, Ordering::Release);
    }

    /// Exception waiting to be raised, if any.
    #[inline]
    pub fn pending_exception(&self) -> Option<ExceptionKind> {
        ExceptionKind::from_u8(self.pending_exception.load(Ordering::Acquire))
    }

    /// Take the pending exception, clearing the slot.
    #[inline]
    pub fn take_pending_exception(&self) -> Option<ExceptionKind> {
        ExceptionKind::from_u8(self.pending_exception.swap(0, Ordering::AcqRel))
    }

    // -------------------------------------------------------------------------
    // Backtrace buffer
    // -------------------------------------------------------------------------

    /// Lock the backtrace buffer if nobody else holds it.
    #[inline]
    pub fn try_backtrace(&self) -> Option<MutexGuard<'_, BacktraceBuffer>> {
        self.backtrace.try_lock()
    }

    /// Copy of the latest capture.
    pub fn backtrace_frames(&self) -> Vec<usize> {
        self.backtrace.lock().frames().to_vec()
    }

    /// Capacity of the backtrace buffer.
    pub fn backtrace_capacity(&self) -> usize {
        self.backtrace.lock().capacity()
    }
}

// =============================================================================
// Tests
// =============================================================================
