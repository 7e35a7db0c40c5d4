//! The signal runtime: all process-wide fault handling state in one place.
//!
//! OS callbacks reach a single `SignalRuntime` through a once-initialised
//! slot; everything else receives it by reference.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use faultline_runtime::{Safepoint, SafepointControl, ThreadHandle, ThreadRegistry, ThreadState};

use crate::config::SignalConfig;
use crate::error::SignalError;
use crate::fatal::FatalState;
use crate::hooks::{Backtracer, IoWaker, LeafFrameBacktracer, NoopIoWaker};
use crate::interrupt::{InterruptDelivery, InterruptPolicy};
use crate::local;
use crate::overflow::OverflowCapture;
use crate::platform::ThreadControl;
use crate::stackwalk::StackWalker;
use crate::stats::SignalStats;
use crate::translator::FaultTranslator;

// =============================================================================
// SignalRuntime
// =============================================================================

pub struct SignalRuntime {
    config: SignalConfig,
    safepoint: Arc<dyn SafepointControl>,
    backtracer: Arc<dyn Backtracer>,
    io_waker: Arc<dyn IoWaker>,
    stackwalk: StackWalker,
    overflow: OverflowCapture,
    policy: InterruptPolicy,
    fatal: FatalState,
    stats: SignalStats,
}

impl SignalRuntime {
    /// Start building a runtime over `registry`, using `control` to freeze
    /// threads.
    pub fn builder(
        registry: Arc<ThreadRegistry>,
        control: Arc<dyn ThreadControl>,
    ) -> SignalRuntimeBuilder {
        SignalRuntimeBuilder {
            registry,
            control,
            config: None,
            safepoint: None,
            backtracer: None,
            io_waker: None,
        }
    }

    // =========================================================================
    // Components
    // =========================================================================

    #[inline]
    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        self.stackwalk.registry()
    }

    #[inline]
    pub fn safepoint(&self) -> &Arc<dyn SafepointControl> {
        &self.safepoint
    }

    #[inline]
    pub fn backtracer(&self) -> &Arc<dyn Backtracer> {
        &self.backtracer
    }

    #[inline]
    pub fn io_waker(&self) -> &Arc<dyn IoWaker> {
        &self.io_waker
    }

    #[inline]
    pub fn stackwalk(&self) -> &StackWalker {
        &self.stackwalk
    }

    #[inline]
    pub fn overflow(&self) -> &OverflowCapture {
        &self.overflow
    }

    #[inline]
    pub fn interrupt_policy(&self) -> &InterruptPolicy {
        &self.policy
    }

    #[inline]
    pub fn fatal_state(&self) -> &FatalState {
        &self.fatal
    }

    #[inline]
    pub fn stats(&self) -> &SignalStats {
        &self.stats
    }

    #[inline]
    pub fn translator(&self) -> FaultTranslator<'_> {
        FaultTranslator::new(self)
    }

    #[inline]
    pub fn interrupts(&self) -> InterruptDelivery<'_> {
        InterruptDelivery::new(self)
    }

    // =========================================================================
    // Thread lifecycle
    // =========================================================================

    /// Register the calling OS thread under `handle` and install its
    /// fault-handling state.
    pub fn register_current_thread(
        &self,
        handle: ThreadHandle,
    ) -> Result<Arc<ThreadState>, SignalError> {
        let state = self.registry().register(handle)?;
        self.install_thread_handler(&state)?;
        Ok(state)
    }

    /// Per-thread install: binds `state` to the calling OS thread and makes
    /// sure the overflow capture context exists.
    pub fn install_thread_handler(&self, state: &Arc<ThreadState>) -> Result<(), SignalError> {
        self.overflow.install()?;
        local::bind_current_thread(Arc::clone(state));
        debug!(tid = state.tid(), "thread fault handling installed");
        Ok(())
    }

    /// Undo [`register_current_thread`](Self::register_current_thread) on
    /// the calling thread.
    pub fn retire_current_thread(&self) {
        if let Some(state) = local::unbind_current_thread() {
            self.registry().retire(state.tid());
        }
    }

    /// Restore the guard page of a thread that overflowed its stack, once
    /// it has unwound far enough to run normal code.
    ///
    /// Returns whether a reset was pending.
    pub fn reset_stack_guard(&self, thread: &ThreadState) -> bool {
        if !thread.take_needs_stack_guard_reset() {
            return false;
        }
        #[cfg(all(windows, target_arch = "x86_64"))]
        crate::platform::windows::reset_stack_overflow_guard();
        true
    }
}

impl fmt::Debug for SignalRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalRuntime")
            .field("config", &self.config)
            .field("stackwalk", &self.stackwalk)
            .field("overflow", &self.overflow)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SignalRuntime`]; unset collaborators get defaults.
pub struct SignalRuntimeBuilder {
    registry: Arc<ThreadRegistry>,
    control: Arc<dyn ThreadControl>,
    config: Option<SignalConfig>,
    safepoint: Option<Arc<dyn SafepointControl>>,
    backtracer: Option<Arc<dyn Backtracer>>,
    io_waker: Option<Arc<dyn IoWaker>>,
}

impl SignalRuntimeBuilder {
    /// Configuration; defaults to [`SignalConfig::default`].
    pub fn config(mut self, config: SignalConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Safepoint; defaults to a fresh page-protection [`Safepoint`].
    pub fn safepoint(mut self, safepoint: Arc<dyn SafepointControl>) -> Self {
        self.safepoint = Some(safepoint);
        self
    }

    /// Stack walker; defaults to [`LeafFrameBacktracer`].
    pub fn backtracer(mut self, backtracer: Arc<dyn Backtracer>) -> Self {
        self.backtracer = Some(backtracer);
        self
    }

    /// I/O waker; defaults to [`NoopIoWaker`].
    pub fn io_waker(mut self, io_waker: Arc<dyn IoWaker>) -> Self {
        self.io_waker = Some(io_waker);
        self
    }

    pub fn build(self) -> Result<SignalRuntime, SignalError> {
        let config = self.config.unwrap_or_default();
        let safepoint: Arc<dyn SafepointControl> = match self.safepoint {
            Some(safepoint) => safepoint,
            None => Arc::new(Safepoint::new()?),
        };
        let backtracer: Arc<dyn Backtracer> = match self.backtracer {
            Some(backtracer) => backtracer,
            None => Arc::new(LeafFrameBacktracer),
        };
        let io_waker: Arc<dyn IoWaker> = match self.io_waker {
            Some(io_waker) => io_waker,
            None => Arc::new(NoopIoWaker),
        };
        Ok(SignalRuntime {
            safepoint,
            backtracer,
            io_waker,
            stackwalk: StackWalker::new(self.registry, self.control),
            overflow: OverflowCapture::new(config.overflow_stack_size),
            policy: InterruptPolicy::new(&config),
            fatal: FatalState::new(),
            stats: SignalStats::new(),
            config,
        })
    }
}
