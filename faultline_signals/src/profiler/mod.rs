//! Sampling profiler.
//!
//! A background thread wakes every interval, freezes the main thread, walks
//! its stack into the shared [`ProfileBuffer`] and lets it go:
//!
//! ```text
//!  profiler thread                               main thread
//!  ───────────────                               ───────────
//!  sleep(interval)
//!  lock stack-walk ─► lock buffer ─► freeze ───► (suspended)
//!  capture frames + metadata
//!  resume ◄──────────────────────────────────── (running)
//!  unlock, check auto-stop
//! ```
//!
//! While stopped the thread parks; `start` unparks it. A freeze failure
//! ends the thread; the next `start` spawns a new one.
//!
//! # Status codes
//!
//! | Code | Meaning                    |
//! |------|----------------------------|
//! | 0    | started                    |
//! | -1   | thread creation failed     |
//! | -2   | timer capability query failed |
//! | -3   | parked thread could not be resumed |

pub mod buffer;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

use faultline_runtime::MAIN_THREAD_INDEX;

pub use buffer::{
    ProfileBuffer, ProfileRecord, RECORD_METADATA_WORDS, RECORD_TERMINATOR_WORDS,
    RECORD_TRAILER_WORDS, Records, STATE_NOT_SLEEPING, STATE_SLEEPING, SampleMetadata,
};

use crate::error::PlatformError;
use crate::platform::{self, TimerResolution, cycleclock};
use crate::runtime::SignalRuntime;
use crate::stackwalk::{FreezeError, StackWalker};

// =============================================================================
// Errors and configuration
// =============================================================================

#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("failed to create profiler thread: {0}")]
    ThreadCreate(#[source] std::io::Error),
    #[error("failed to query timer resolution: {0}")]
    TimerQuery(#[source] PlatformError),
    #[error("failed to resume profiler thread")]
    Resume,
}

impl ProfilerError {
    /// Numeric status reported to embedders.
    pub fn status_code(&self) -> i32 {
        match self {
            ProfilerError::ThreadCreate(_) => -1,
            ProfilerError::TimerQuery(_) => -2,
            ProfilerError::Resume => -3,
        }
    }
}

/// Static profiler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilerConfig {
    /// Time between samples; anything under 1 ms sleeps 1 ms.
    pub interval: Duration,
    /// Profile buffer length in words.
    pub buffer_words: usize,
    /// Stop automatically this long after `start`.
    pub autostop: Option<Duration>,
}

impl From<&crate::config::SignalConfig> for ProfilerConfig {
    fn from(config: &crate::config::SignalConfig) -> Self {
        ProfilerConfig {
            interval: config.profile_interval,
            buffer_words: config.profile_buffer_words,
            autostop: config.profile_autostop,
        }
    }
}

// =============================================================================
// TaskSampler
// =============================================================================

/// Samples every task when the profiler runs in all-tasks mode.
///
/// Task scheduling is owned by the embedding runtime, so this walk is
/// delegated. Implementations append records with
/// [`ProfileBuffer::record_sample`].
pub trait TaskSampler: Send + Sync {
    fn sample_tasks(&self, stackwalk: &StackWalker, buffer: &Mutex<ProfileBuffer>);
}

/// Sampler for embedders without task-level profiling.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTaskSampler;

impl TaskSampler for NoTaskSampler {
    fn sample_tasks(&self, _: &StackWalker, _: &Mutex<ProfileBuffer>) {}
}

// =============================================================================
// Profiler
// =============================================================================

struct Shared {
    runtime: Arc<SignalRuntime>,
    buffer: Mutex<ProfileBuffer>,
    running: AtomicBool,
    all_tasks: AtomicBool,
    interval_ns: AtomicU64,
    autostop: Option<Duration>,
    deadline: Mutex<Option<Instant>>,
    timer: Box<dyn TimerResolution>,
    timer_caps: AtomicU32,
    timer_period: AtomicU32,
    sampler: Arc<dyn TaskSampler>,
    shutdown: AtomicBool,
}

pub struct Profiler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Profiler {
    pub fn new(runtime: Arc<SignalRuntime>, config: ProfilerConfig) -> Self {
        Self::with_parts(runtime, config, platform::native_timer(), Arc::new(NoTaskSampler))
    }

    /// Profiler with explicit timer control and task sampler.
    pub fn with_parts(
        runtime: Arc<SignalRuntime>,
        config: ProfilerConfig,
        timer: Box<dyn TimerResolution>,
        sampler: Arc<dyn TaskSampler>,
    ) -> Self {
        Profiler {
            shared: Arc::new(Shared {
                runtime,
                buffer: Mutex::new(ProfileBuffer::with_capacity(config.buffer_words)),
                running: AtomicBool::new(false),
                all_tasks: AtomicBool::new(false),
                interval_ns: AtomicU64::new(config.interval.as_nanos() as u64),
                autostop: config.autostop,
                deadline: Mutex::new(None),
                timer,
                timer_caps: AtomicU32::new(0),
                timer_period: AtomicU32::new(0),
                sampler,
                shutdown: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start sampling, spawning or waking the profiler thread.
    pub fn start(&self, all_tasks: bool) -> Result<(), ProfilerError> {
        let shared = &self.shared;
        let mut worker = self.worker.lock();

        if worker.as_ref().is_some_and(|w| w.is_finished()) {
            if let Some(finished) = worker.take() {
                if finished.join().is_err() {
                    return Err(ProfilerError::Resume);
                }
            }
        }

        if worker.is_none() {
            let caps = shared.timer.min_period().map_err(ProfilerError::TimerQuery)?;
            shared.timer_caps.store(caps, Ordering::Relaxed);
            let thread_shared = Arc::clone(shared);
            let handle = thread::Builder::new()
                .name("faultline-profiler".into())
                .spawn(move || Shared::run(&thread_shared))
                .map_err(ProfilerError::ThreadCreate)?;
            debug!("profiler thread started");
            *worker = Some(handle);
        }

        if !shared.running.load(Ordering::Acquire) {
            let period = shared.timer_caps.load(Ordering::Relaxed);
            let granted = if period != 0 && shared.timer.begin(period).is_ok() {
                period
            } else {
                0
            };
            shared.timer_period.store(granted, Ordering::Relaxed);
        }

        *shared.deadline.lock() = shared.autostop.map(|d| Instant::now() + d);
        shared.all_tasks.store(all_tasks, Ordering::Release);
        shared.running.store(true, Ordering::Release);

        if let Some(handle) = worker.as_ref() {
            handle.thread().unpark();
        }
        Ok(())
    }

    /// [`start`](Self::start) as a status code.
    pub fn start_timer(&self, all_tasks: bool) -> i32 {
        match self.start(all_tasks) {
            Ok(()) => 0,
            Err(err) => {
                warn!(%err, "profiler failed to start");
                err.status_code()
            }
        }
    }

    /// Stop sampling. Idempotent; an in-flight sample completes.
    pub fn stop(&self) {
        self.shared.stop();
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn samples_all_tasks(&self) -> bool {
        self.shared.all_tasks.load(Ordering::Acquire)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.shared.interval_ns.load(Ordering::Relaxed))
    }

    pub fn set_interval(&self, interval: Duration) {
        self.shared
            .interval_ns
            .store(interval.as_nanos() as u64, Ordering::Relaxed);
    }

    /// The shared sample buffer.
    pub fn buffer(&self) -> &Mutex<ProfileBuffer> {
        &self.shared.buffer
    }

    /// Discard collected samples.
    pub fn clear(&self) {
        self.shared.buffer.lock().reset();
    }

    /// Whether the profiler thread is alive.
    pub fn has_thread(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.is_finished())
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        self.shared.stop();
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for Profiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profiler")
            .field("running", &self.is_running())
            .field("all_tasks", &self.samples_all_tasks())
            .field("interval", &self.interval())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Profiler thread
// =============================================================================

impl Shared {
    fn run(shared: &Shared) {
        platform::raise_current_thread_priority();
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            if !shared.running.load(Ordering::Acquire) {
                thread::park();
                continue;
            }

            let interval = Duration::from_nanos(shared.interval_ns.load(Ordering::Relaxed));
            thread::sleep(interval.max(Duration::from_millis(1)));
            if !shared.running.load(Ordering::Acquire) {
                continue;
            }

            if shared.buffer.lock().is_full() {
                debug!("profile buffer full, stopping");
                shared.stop();
                continue;
            }

            if shared.all_tasks.load(Ordering::Acquire) {
                shared
                    .sampler
                    .sample_tasks(shared.runtime.stackwalk(), &shared.buffer);
            } else if let Err(err) = shared.sample_main() {
                error!(%err, "failed to suspend main thread. aborting profiling.");
                shared.runtime.stats().record_profile_abort();
                shared.stop();
                break;
            }

            if shared.autostop_due() {
                debug!("profiler auto-stop");
                shared.stop();
            }
        }
        shared.stop();
    }

    fn sample_main(&self) -> Result<(), FreezeError> {
        let rt = &self.runtime;
        let walker = rt.stackwalk();
        let guard = walker.lock();
        let mut buffer = self.buffer.lock();
        if buffer.is_full() || !self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        let frozen = match walker.freeze(&guard, MAIN_THREAD_INDEX) {
            Ok(frozen) => frozen,
            Err(FreezeError::NotAlive(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        let thread = frozen.thread();
        let Some(task) = thread.try_current_task() else {
            return Ok(());
        };
        let ctx = frozen.context();
        let metadata = SampleMetadata::new(
            thread.tid(),
            task.id(),
            cycleclock(),
            thread.is_sleeping(),
        );
        let backtracer = rt.backtracer();
        buffer.record_sample(
            |frames| backtracer.capture(frames, &ctx, task.gc_stack()),
            metadata,
        );
        drop(frozen);

        rt.stats().record_profile_sample();
        Ok(())
    }

    fn autostop_due(&self) -> bool {
        self.deadline
            .lock()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn stop(&self) {
        let _buffer = self.buffer.lock();
        if self.running.load(Ordering::Acquire) {
            let period = self.timer_period.swap(0, Ordering::Relaxed);
            if period != 0 {
                self.timer.end(period);
            }
        }
        self.running.store(false, Ordering::Release);
        self.all_tasks.store(false, Ordering::Release);
    }
}
