//! Sampling profiler against a spinning main thread.

mod common;

use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use faultline_runtime::{Task, ThreadHandle};
use faultline_signals::platform::{FixedTimer, TimerResolution};
use faultline_signals::profiler::{
    NoTaskSampler, ProfileBuffer, RECORD_TRAILER_WORDS, STATE_NOT_SLEEPING, STATE_SLEEPING,
    TaskSampler,
};
use faultline_signals::{PlatformError, Profiler, ProfilerConfig, StackWalker};

use common::{FAULT_IP, Harness};

fn config(buffer_words: usize) -> ProfilerConfig {
    ProfilerConfig {
        interval: Duration::from_millis(1),
        buffer_words,
        autostop: None,
    }
}

fn profiler(h: &Harness, config: ProfilerConfig) -> Profiler {
    Profiler::with_parts(
        h.runtime.clone(),
        config,
        Box::new(FixedTimer),
        Arc::new(NoTaskSampler),
    )
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

/// A real thread spinning under a registered main-thread record.
struct Spinner {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    task: Arc<Task>,
}

impl Spinner {
    fn start(h: &Harness) -> Self {
        let (_main, task) = h.thread_with_task(1);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            let mut n = 0u64;
            while !flag.load(Ordering::Relaxed) {
                n = hint::black_box(n.wrapping_add(1));
            }
        });
        Spinner {
            stop,
            handle: Some(handle),
            task,
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// Sampling
// =============================================================================

#[test]
fn test_samples_spinning_main_thread() {
    let h = Harness::new();
    let spinner = Spinner::start(&h);
    let profiler = profiler(&h, config(4096));

    let started = Instant::now();
    profiler.start(false).unwrap();
    assert!(profiler.is_running());
    assert!(!profiler.samples_all_tasks());
    assert!(wait_until(Duration::from_secs(5), || {
        started.elapsed() >= Duration::from_millis(10) && !profiler.buffer().lock().is_empty()
    }));
    profiler.stop();
    assert!(!profiler.is_running());
    check_records(&profiler, &spinner);

    drop(profiler);
    assert_eq!(h.control.suspends(), h.control.resumes());
    assert!(h.runtime.stats().snapshot().profile_samples >= 1);
    assert!(!h.runtime.stackwalk().is_locked());
}

fn check_records(profiler: &Profiler, spinner: &Spinner) {
    let buffer = profiler.buffer().lock();
    assert!(buffer.len() <= buffer.capacity());
    let mut count = 0;
    for record in buffer.records() {
        assert_eq!(record.frames.len(), 4);
        assert!(record.frames[0] >= FAULT_IP);
        assert_eq!(record.metadata.thread_marker, 1);
        assert_eq!(record.metadata.task_id, spinner.task.id() as usize);
        assert_ne!(record.metadata.cycles, 0);
        assert_eq!(record.metadata.state, STATE_NOT_SLEEPING);
        count += 1;
    }
    assert!(count >= 1);
}

#[test]
fn test_sleeping_state_is_recorded() {
    let h = Harness::new();
    let (main, _task) = h.thread_with_task(1);
    main.set_sleeping(true);
    let profiler = profiler(&h, config(4096));

    profiler.start(false).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        !profiler.buffer().lock().is_empty()
    }));
    profiler.stop();

    let buffer = profiler.buffer().lock();
    let first = buffer.records().next().unwrap();
    assert_eq!(first.metadata.state, STATE_SLEEPING);
}

#[test]
fn test_full_buffer_stops_profiling() {
    let h = Harness::new();
    let _spinner = Spinner::start(&h);
    // Room for exactly two four-frame records.
    let words = 2 * (4 + RECORD_TRAILER_WORDS);
    let profiler = profiler(&h, config(words));

    profiler.start(false).unwrap();
    assert!(wait_until(Duration::from_secs(5), || !profiler.is_running()));

    let buffer = profiler.buffer().lock();
    assert!(buffer.is_full());
    assert_eq!(buffer.len(), words);
    assert_eq!(buffer.records().count(), 2);
}

#[test]
fn test_autostop() {
    let h = Harness::new();
    let _spinner = Spinner::start(&h);
    let profiler = profiler(
        &h,
        ProfilerConfig {
            autostop: Some(Duration::from_millis(20)),
            ..config(1 << 16)
        },
    );

    profiler.start(false).unwrap();
    assert!(wait_until(Duration::from_secs(5), || !profiler.is_running()));
    assert!(profiler.has_thread());
}

#[test]
fn test_main_thread_without_task_is_skipped() {
    let h = Harness::new();
    let _main = h.registry.register(ThreadHandle::from_raw(1)).unwrap();
    let profiler = profiler(&h, config(4096));

    profiler.start(false).unwrap();
    thread::sleep(Duration::from_millis(20));

    assert!(profiler.is_running());
    assert!(profiler.buffer().lock().is_empty());
    assert!(h.control.calls().is_empty());
    profiler.stop();
}

#[test]
fn test_suspend_failure_aborts_and_restarts() {
    let h = Harness::new();
    let _spinner = Spinner::start(&h);
    h.control.fail_suspend.store(true, Ordering::Relaxed);
    let profiler = profiler(&h, config(4096));

    profiler.start(false).unwrap();
    assert!(wait_until(Duration::from_secs(5), || !profiler.has_thread()));
    assert!(!profiler.is_running());
    assert_eq!(h.runtime.stats().snapshot().profile_aborts, 1);

    h.control.fail_suspend.store(false, Ordering::Relaxed);
    profiler.start(false).unwrap();
    assert!(profiler.has_thread());
    assert!(wait_until(Duration::from_secs(5), || {
        !profiler.buffer().lock().is_empty()
    }));
    profiler.stop();
}

#[test]
fn test_clear_and_interval() {
    let h = Harness::new();
    let _spinner = Spinner::start(&h);
    let profiler = profiler(&h, config(4096));
    assert_eq!(profiler.interval(), Duration::from_millis(1));
    profiler.set_interval(Duration::from_micros(200));
    assert_eq!(profiler.interval(), Duration::from_micros(200));

    profiler.start(false).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        !profiler.buffer().lock().is_empty()
    }));
    profiler.stop();
    profiler.clear();
    assert!(profiler.buffer().lock().is_empty());
}

// =============================================================================
// Lifecycle
// =============================================================================

#[derive(Default)]
struct TimerCalls {
    begins: AtomicUsize,
    ends: AtomicUsize,
    fail_query: bool,
}

struct CountingTimer(Arc<TimerCalls>);

impl TimerResolution for CountingTimer {
    fn min_period(&self) -> Result<u32, PlatformError> {
        if self.0.fail_query {
            return Err(PlatformError::CallFailed {
                call: "timeGetDevCaps",
                code: 97,
            });
        }
        Ok(1)
    }

    fn begin(&self, _: u32) -> Result<(), PlatformError> {
        self.0.begins.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn end(&self, _: u32) {
        self.0.ends.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn test_timer_resolution_is_paired() {
    let h = Harness::new();
    let _spinner = Spinner::start(&h);
    let timer = Arc::new(TimerCalls::default());
    let profiler = Profiler::with_parts(
        h.runtime.clone(),
        config(4096),
        Box::new(CountingTimer(timer.clone())),
        Arc::new(NoTaskSampler),
    );

    assert_eq!(profiler.start_timer(false), 0);
    assert_eq!(profiler.start_timer(false), 0);
    assert_eq!(timer.begins.load(Ordering::Relaxed), 1);

    profiler.stop();
    profiler.stop();
    assert_eq!(timer.ends.load(Ordering::Relaxed), 1);
}

#[test]
fn test_timer_query_failure_status() {
    let h = Harness::new();
    let timer = Arc::new(TimerCalls {
        fail_query: true,
        ..TimerCalls::default()
    });
    let profiler = Profiler::with_parts(
        h.runtime.clone(),
        config(4096),
        Box::new(CountingTimer(timer)),
        Arc::new(NoTaskSampler),
    );

    assert_eq!(profiler.start_timer(false), -2);
    assert!(!profiler.is_running());
    assert!(!profiler.has_thread());
}

#[derive(Default)]
struct RecordingSampler {
    calls: AtomicUsize,
    saw_lock_free: Mutex<bool>,
}

impl TaskSampler for RecordingSampler {
    fn sample_tasks(&self, stackwalk: &StackWalker, _: &Mutex<ProfileBuffer>) {
        *self.saw_lock_free.lock() = !stackwalk.is_locked();
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn test_all_tasks_mode_delegates_to_sampler() {
    let h = Harness::new();
    let _spinner = Spinner::start(&h);
    let sampler = Arc::new(RecordingSampler::default());
    let profiler = Profiler::with_parts(
        h.runtime.clone(),
        config(4096),
        Box::new(FixedTimer),
        sampler.clone(),
    );

    profiler.start(true).unwrap();
    assert!(profiler.samples_all_tasks());
    assert!(wait_until(Duration::from_secs(5), || {
        sampler.calls.load(Ordering::Relaxed) > 0
    }));
    profiler.stop();
    assert!(!profiler.samples_all_tasks());

    assert!(*sampler.saw_lock_free.lock());
    assert!(h.control.calls().is_empty());
}
