//! Cross-thread interrupt delivery.
//!
//! An interrupt (console Ctrl-C, or the C runtime's SIGINT) is always aimed
//! at the main thread. Delivery first arms the safepoint so the main thread
//! traps at its next poll. If the main thread is blocked in I/O with
//! deferral off, or the user has insisted, the interrupt is injected right
//! away by freezing the thread and rewriting its context:
//!
//! ```text
//!  request ─► suppressed? ─yes─► Ignored
//!                │ no
//!                ▼
//!          exit-on-sigint? ─yes─► Exit(128 + sig)
//!                │ no
//!                ▼
//!   lock stack-walk ─► interrupt already in flight? ─yes─► AlreadyPending
//!                │ no
//!                ▼
//!        arm main safepoint, wake I/O, freeze main
//!                │
//!        forced or (in I/O and not deferring)? ─no─► Declined (resume)
//!                │ yes
//!                ▼
//!   claim, inject Interrupt into the frozen context, write back, resume
//! ```
//!
//! While the main thread is frozen only lock-free state is touched; it may
//! have been suspended holding any runtime lock. Poll protection is settled
//! once it runs again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use faultline_runtime::{ExceptionKind, MAIN_THREAD_INDEX, ThreadState};

use crate::config::SignalConfig;
use crate::fault::CrtSignal;
use crate::runtime::SignalRuntime;
use crate::safe_print;
use crate::stackwalk::FreezeError;
use crate::translator::Disposition;

/// Console event number for Ctrl-C.
pub const CTRL_C_EVENT: u32 = 0;

/// Signal a console control event stands for.
pub fn console_event_signal(event: u32) -> CrtSignal {
    if event == CTRL_C_EVENT {
        CrtSignal::Int
    } else {
        CrtSignal::Term
    }
}

// =============================================================================
// ForceDetector
// =============================================================================

/// Detects a user hammering Ctrl-C.
///
/// Each request adds a fixed weight to an accumulator that decays
/// exponentially with a one-second time constant; crossing the threshold
/// forces delivery. Five requests in quick succession are enough.
#[derive(Debug, Default)]
pub struct ForceDetector {
    last_ns: AtomicU64,
    weight_bits: AtomicU64,
}

impl ForceDetector {
    const STEP: f64 = 0.3;
    const THRESHOLD: f64 = 1.0;

    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request at `now_ns` (nonzero) and report whether to force.
    pub fn record_at(&self, now_ns: u64) -> bool {
        let now_ns = now_ns.max(1);
        let last = self.last_ns.swap(now_ns, Ordering::AcqRel);
        if last == 0 {
            self.weight_bits.store(0f64.to_bits(), Ordering::Release);
            return false;
        }
        let dt = now_ns.saturating_sub(last) as f64 / 1e9;
        let weight = f64::from_bits(self.weight_bits.load(Ordering::Acquire));
        let mut next = weight * (-dt).exp() + Self::STEP;
        if !next.is_normal() {
            next = 0.0;
        }
        self.weight_bits.store(next.to_bits(), Ordering::Release);
        if next > Self::THRESHOLD {
            self.clear();
            return true;
        }
        false
    }

    /// Forget past requests.
    pub fn clear(&self) {
        self.last_ns.store(0, Ordering::Release);
    }
}

// =============================================================================
// InterruptPolicy
// =============================================================================

/// Process-wide rules for whether and how interrupts are acted on.
#[derive(Debug)]
pub struct InterruptPolicy {
    epoch: Instant,
    exit_on_sigint: AtomicBool,
    suppress_depth: AtomicU32,
    grace_until_ns: AtomicU64,
    force: ForceDetector,
}

impl InterruptPolicy {
    pub fn new(config: &SignalConfig) -> Self {
        let policy = InterruptPolicy {
            epoch: Instant::now(),
            exit_on_sigint: AtomicBool::new(config.exit_on_sigint),
            suppress_depth: AtomicU32::new(0),
            grace_until_ns: AtomicU64::new(0),
            force: ForceDetector::new(),
        };
        if let Some(grace) = config.sigint_grace {
            policy.start_grace(grace);
        }
        policy
    }

    #[inline]
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64 + 1
    }

    #[inline]
    pub fn exit_on_sigint(&self) -> bool {
        self.exit_on_sigint.load(Ordering::Relaxed)
    }

    pub fn set_exit_on_sigint(&self, exit: bool) {
        self.exit_on_sigint.store(exit, Ordering::Relaxed);
    }

    /// Ignore interrupts for `grace` from now.
    pub fn start_grace(&self, grace: Duration) {
        let until = self.now_ns().saturating_add(grace.as_nanos() as u64);
        self.grace_until_ns.store(until, Ordering::Relaxed);
    }

    /// Ignore interrupts until the guard drops. Nests.
    pub fn suppress(&self) -> SigintSuppressed<'_> {
        self.suppress_depth.fetch_add(1, Ordering::AcqRel);
        SigintSuppressed { policy: self }
    }

    /// Whether an interrupt arriving now should be dropped.
    pub fn is_ignored(&self) -> bool {
        self.suppress_depth.load(Ordering::Acquire) > 0
            || self.now_ns() < self.grace_until_ns.load(Ordering::Relaxed)
    }

    /// Count a request toward forcing; `true` once the user has insisted.
    pub fn check_force(&self) -> bool {
        self.force.record_at(self.now_ns())
    }

    pub fn clear_force(&self) {
        self.force.clear();
    }
}

/// Scope during which interrupts are ignored.
#[must_use = "interrupts are only suppressed while the guard is alive"]
#[derive(Debug)]
pub struct SigintSuppressed<'a> {
    policy: &'a InterruptPolicy,
}

impl Drop for SigintSuppressed<'_> {
    fn drop(&mut self) {
        self.policy.suppress_depth.fetch_sub(1, Ordering::AcqRel);
    }
}

// =============================================================================
// Delivery
// =============================================================================

/// What an interrupt request ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Suppressed by policy; nothing touched.
    Ignored,
    /// Exit-on-interrupt is configured; terminate with this status.
    Exit(i32),
    /// The main thread has no runtime state or no task.
    NoTarget,
    /// The main thread could not be suspended.
    FreezeFailed,
    /// The main thread's context could not be read.
    ContextReadFailed,
    /// Left pending for the main thread's next safepoint poll.
    Declined,
    /// An interrupt was already pending on the main thread.
    AlreadyPending,
    /// Injected into the main thread.
    Delivered,
    /// Injected context could not be written back.
    ContextWriteFailed,
    /// The main thread has no handler frame to catch it.
    NoHandler,
    /// The handler continuation is unusable.
    CorruptContinuation,
}

/// Interrupt delivery bound to a runtime.
#[derive(Debug, Clone, Copy)]
pub struct InterruptDelivery<'a> {
    rt: &'a SignalRuntime,
}

impl<'a> InterruptDelivery<'a> {
    pub(crate) fn new(rt: &'a SignalRuntime) -> Self {
        InterruptDelivery { rt }
    }

    /// Handle an interrupt request from a thread other than the target.
    pub fn request(&self, signal: CrtSignal) -> DeliveryOutcome {
        let policy = self.rt.interrupt_policy();
        if policy.is_ignored() {
            debug!(signal = signal.name(), "interrupt ignored");
            return DeliveryOutcome::Ignored;
        }
        if policy.exit_on_sigint() {
            return DeliveryOutcome::Exit(signal.exit_status());
        }
        self.deliver_to_main()
    }

    /// Try to raise an interrupt in the main thread right now.
    pub fn deliver_to_main(&self) -> DeliveryOutcome {
        let rt = self.rt;
        let stats = rt.stats();
        let walker = rt.stackwalk();
        let guard = walker.lock();

        let in_flight = |thread: &ThreadState| {
            thread.pending_exception() == Some(ExceptionKind::Interrupt)
        };
        if rt.registry().main_thread().is_some_and(|main| in_flight(&main)) {
            return DeliveryOutcome::AlreadyPending;
        }

        rt.safepoint().enable_sigint();
        rt.io_waker().wake();

        let mut frozen = match walker.freeze(&guard, MAIN_THREAD_INDEX) {
            Ok(frozen) => frozen,
            Err(FreezeError::NotAlive(_)) => return DeliveryOutcome::NoTarget,
            Err(err @ FreezeError::Suspend { .. }) => {
                warn!(%err, "error: SuspendThread failed");
                stats.record_interrupt_failed();
                return DeliveryOutcome::FreezeFailed;
            }
            Err(err @ FreezeError::GetContext { .. }) => {
                warn!(%err, "error: GetThreadContext failed");
                stats.record_interrupt_failed();
                return DeliveryOutcome::ContextReadFailed;
            }
        };
        let target = Arc::clone(frozen.thread());

        // Only lock-free safepoint calls until `frozen` is dropped; the main
        // thread may be suspended inside any of the blocking ones.
        if in_flight(&target) {
            rt.safepoint().take_sigint();
            drop(frozen);
            rt.safepoint().settle_sigint();
            return DeliveryOutcome::AlreadyPending;
        }

        let force = rt.interrupt_policy().check_force();
        if !force && !(!target.signals_deferred() && target.io_wait()) {
            stats.record_interrupt_declined();
            return DeliveryOutcome::Declined;
        }

        let Some(task) = target.try_current_task() else {
            stats.record_interrupt_declined();
            return DeliveryOutcome::Declined;
        };
        match task.top_handler() {
            Ok(Some(_)) => {}
            Ok(None) => {
                stats.record_interrupt_failed();
                return DeliveryOutcome::NoHandler;
            }
            Err(_) => {
                stats.record_interrupt_declined();
                return DeliveryOutcome::Declined;
            }
        }

        if !rt.safepoint().take_sigint() {
            // The main thread claimed it at a poll just before the freeze.
            drop(frozen);
            rt.safepoint().settle_sigint();
            return DeliveryOutcome::AlreadyPending;
        }
        if force {
            safe_print!("WARNING: Force throwing a SIGINT\n");
        }
        rt.interrupt_policy().clear_force();

        let mut ctx = frozen.context();
        let mut write_error = None;
        let outcome = match rt.translator().throw_in_context(
            &target,
            &task,
            ExceptionKind::Interrupt,
            None,
            &mut ctx,
        ) {
            Disposition::Redirected(_) => match frozen.set_context(&ctx) {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(err) => {
                    write_error = Some(err);
                    DeliveryOutcome::ContextWriteFailed
                }
            },
            Disposition::HandlerBusy(_) => DeliveryOutcome::Declined,
            Disposition::NoHandler(_) => DeliveryOutcome::NoHandler,
            _ => DeliveryOutcome::CorruptContinuation,
        };
        drop(frozen);

        if let Some(err) = write_error {
            warn!(%err, "error: SetThreadContext failed");
        }

        if outcome == DeliveryOutcome::Declined {
            // Hand the interrupt back to the safepoint.
            rt.safepoint().enable_sigint();
        } else {
            rt.safepoint().settle_sigint();
        }

        match outcome {
            DeliveryOutcome::Delivered => stats.record_interrupt_delivered(),
            DeliveryOutcome::Declined => stats.record_interrupt_declined(),
            _ => stats.record_interrupt_failed(),
        }
        debug!(?outcome, "interrupt delivery finished");
        outcome
    }

    /// Interrupt check for a SIGINT arriving on `thread` itself.
    ///
    /// Returns `true` when the caller should raise the interrupt now.
    pub fn poll_current(&self, thread: &ThreadState) -> bool {
        let rt = self.rt;
        if thread.pending_exception() == Some(ExceptionKind::Interrupt) {
            return false;
        }
        rt.safepoint().enable_sigint();
        rt.io_waker().wake();
        let force = rt.interrupt_policy().check_force();
        if force || (!thread.signals_deferred() && thread.io_wait()) {
            rt.safepoint().consume_sigint();
            if force {
                safe_print!("WARNING: Force throwing a SIGINT\n");
            }
            rt.interrupt_policy().clear_force();
            return true;
        }
        false
    }
}
