//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use faultline_runtime::{
    Continuation, HandlerFrame, MachineContext, Safepoint, StackBounds, Task, ThreadHandle,
    ThreadRegistry, ThreadState,
};
use faultline_signals::{
    Backtracer, PlatformError, SignalConfig, SignalRuntime, ThreadControl,
};

// =============================================================================
// RecordingThreadControl
// =============================================================================

/// Calls seen by [`RecordingThreadControl`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCall {
    Suspend(ThreadHandle),
    GetContext(ThreadHandle),
    SetContext(ThreadHandle),
    Resume(ThreadHandle),
}

impl ControlCall {
    pub fn thread(self) -> ThreadHandle {
        match self {
            ControlCall::Suspend(t)
            | ControlCall::GetContext(t)
            | ControlCall::SetContext(t)
            | ControlCall::Resume(t) => t,
        }
    }
}

/// [`ThreadControl`] that records every call and serves a fixed context.
///
/// Each `get_context` advances the served instruction pointer by 0x10 so
/// consecutive samples differ.
#[derive(Debug)]
pub struct RecordingThreadControl {
    calls: Mutex<Vec<ControlCall>>,
    context: Mutex<MachineContext>,
    written: Mutex<Option<MachineContext>>,
    reads: AtomicUsize,
    pub fail_suspend: AtomicBool,
    pub fail_get_context: AtomicBool,
    pub fail_set_context: AtomicBool,
}

impl RecordingThreadControl {
    pub fn new(context: MachineContext) -> Self {
        RecordingThreadControl {
            calls: Mutex::new(Vec::new()),
            context: Mutex::new(context),
            written: Mutex::new(None),
            reads: AtomicUsize::new(0),
            fail_suspend: AtomicBool::new(false),
            fail_get_context: AtomicBool::new(false),
            fail_set_context: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.lock().clone()
    }

    pub fn suspends(&self) -> usize {
        self.count(|c| matches!(c, ControlCall::Suspend(_)))
    }

    pub fn resumes(&self) -> usize {
        self.count(|c| matches!(c, ControlCall::Resume(_)))
    }

    pub fn writes(&self) -> usize {
        self.count(|c| matches!(c, ControlCall::SetContext(_)))
    }

    /// Context passed to the last successful `set_context`.
    pub fn written(&self) -> Option<MachineContext> {
        *self.written.lock()
    }

    fn count(&self, pred: impl Fn(&ControlCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn fail(call: &'static str) -> PlatformError {
        PlatformError::CallFailed { call, code: 5 }
    }
}

impl ThreadControl for RecordingThreadControl {
    fn suspend(&self, thread: ThreadHandle) -> Result<(), PlatformError> {
        if self.fail_suspend.load(Ordering::Relaxed) {
            return Err(Self::fail("SuspendThread"));
        }
        self.calls.lock().push(ControlCall::Suspend(thread));
        Ok(())
    }

    fn get_context(&self, thread: ThreadHandle) -> Result<MachineContext, PlatformError> {
        if self.fail_get_context.load(Ordering::Relaxed) {
            return Err(Self::fail("GetThreadContext"));
        }
        self.calls.lock().push(ControlCall::GetContext(thread));
        let n = self.reads.fetch_add(1, Ordering::Relaxed);
        let mut ctx = *self.context.lock();
        ctx.ip += n * 0x10;
        Ok(ctx)
    }

    fn set_context(&self, thread: ThreadHandle, ctx: &MachineContext) -> Result<(), PlatformError> {
        if self.fail_set_context.load(Ordering::Relaxed) {
            return Err(Self::fail("SetThreadContext"));
        }
        self.calls.lock().push(ControlCall::SetContext(thread));
        *self.written.lock() = Some(*ctx);
        Ok(())
    }

    fn resume(&self, thread: ThreadHandle) -> Result<(), PlatformError> {
        self.calls.lock().push(ControlCall::Resume(thread));
        Ok(())
    }
}

// =============================================================================
// SteppingBacktracer
// =============================================================================

/// Deterministic walker: `depth` frames `ip, ip + 1, ...`.
///
/// Remembers which OS thread ran each capture.
#[derive(Debug)]
pub struct SteppingBacktracer {
    depth: usize,
    captured_on: Mutex<Vec<ThreadId>>,
}

impl SteppingBacktracer {
    pub fn new(depth: usize) -> Self {
        SteppingBacktracer {
            depth,
            captured_on: Mutex::new(Vec::new()),
        }
    }

    pub fn captured_on(&self) -> Vec<ThreadId> {
        self.captured_on.lock().clone()
    }
}

impl Backtracer for SteppingBacktracer {
    fn capture(&self, frames: &mut [usize], ctx: &MachineContext, _: Option<usize>) -> usize {
        self.captured_on.lock().push(thread::current().id());
        let n = self.depth.min(frames.len());
        for (i, slot) in frames[..n].iter_mut().enumerate() {
            *slot = ctx.ip + i;
        }
        n
    }
}

// =============================================================================
// Builders
// =============================================================================

pub const FAULT_IP: usize = 0x4000_1000;
pub const FAULT_SP: usize = 0x7ff0_0000;
pub const FAULT_FP: usize = 0x7ff0_0040;

pub const LANDING: Continuation = Continuation {
    ip: 0x4000_9000,
    sp: 0x7ff1_0000,
    fp: 0x7ff1_0020,
    callee_saved: [1, 2, 3, 4, 5, 6, 7],
};

pub fn fault_context() -> MachineContext {
    MachineContext::new(FAULT_IP, FAULT_SP, FAULT_FP)
}

pub fn handler_frame() -> HandlerFrame {
    HandlerFrame {
        continuation: LANDING,
        bounds: StackBounds {
            lo: 0x7fe0_0000,
            hi: 0x7ff2_0000,
        },
    }
}

/// A nested frame distinguishable from [`handler_frame`] in every register.
pub fn inner_frame() -> HandlerFrame {
    HandlerFrame {
        continuation: Continuation {
            ip: 0x4000_a000,
            sp: 0x7ff0_8000,
            fp: 0x7ff0_8020,
            callee_saved: [0x20; 7],
        },
        bounds: StackBounds {
            lo: 0x7fe0_0000,
            hi: 0x7ff0_9000,
        },
    }
}

/// A runtime wired to recording collaborators.
pub struct Harness {
    pub runtime: Arc<SignalRuntime>,
    pub registry: Arc<ThreadRegistry>,
    pub control: Arc<RecordingThreadControl>,
    pub safepoint: Arc<Safepoint>,
    pub backtracer: Arc<SteppingBacktracer>,
    pub wakes: Arc<AtomicUsize>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SignalConfig) -> Self {
        let registry = Arc::new(ThreadRegistry::new(8, config.backtrace_capacity));
        let control = Arc::new(RecordingThreadControl::new(fault_context()));
        let safepoint = Arc::new(Safepoint::new().expect("safepoint page"));
        let backtracer = Arc::new(SteppingBacktracer::new(4));
        let wakes = Arc::new(AtomicUsize::new(0));
        let waker_count = Arc::clone(&wakes);

        let runtime = SignalRuntime::builder(registry.clone(), control.clone())
            .config(config)
            .safepoint(safepoint.clone())
            .backtracer(backtracer.clone())
            .io_waker(Arc::new(move || {
                waker_count.fetch_add(1, Ordering::Relaxed);
            }))
            .build()
            .expect("runtime");

        Harness {
            runtime: Arc::new(runtime),
            registry,
            control,
            safepoint,
            backtracer,
            wakes,
        }
    }

    /// Register a thread with a running task and one handler frame.
    pub fn thread_with_handler(&self, handle: usize) -> (Arc<ThreadState>, Arc<Task>) {
        let (thread, task) = self.thread_with_task(handle);
        task.push_handler(handler_frame());
        (thread, task)
    }

    /// Register a thread with a running task and no handler frame.
    pub fn thread_with_task(&self, handle: usize) -> (Arc<ThreadState>, Arc<Task>) {
        let thread = self
            .registry
            .register(ThreadHandle::from_raw(handle))
            .expect("register");
        let task = Arc::new(Task::new());
        thread.set_current_task(Some(task.clone()));
        (thread, task)
    }
}

pub fn test_config() -> SignalConfig {
    SignalConfig {
        backtrace_capacity: 16,
        profile_buffer_words: 4096,
        ..SignalConfig::default()
    }
}
