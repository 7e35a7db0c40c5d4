//! Counters for fault translation, interrupt delivery and profiling.
//!
//! All counters are relaxed atomics so they can be bumped from fault
//! context.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use faultline_runtime::ExceptionKind;

// =============================================================================
// SignalStats
// =============================================================================

#[derive(Debug, Default)]
pub struct SignalStats {
    redirected: [AtomicU64; 4],
    unhandled: AtomicU64,
    restored: AtomicU64,
    safepoint_arrivals: AtomicU64,
    interrupts_delivered: AtomicU64,
    interrupts_declined: AtomicU64,
    interrupts_failed: AtomicU64,
    overflow_captures: AtomicU64,
    profile_samples: AtomicU64,
    profile_aborts: AtomicU64,
}

impl SignalStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn slot(kind: ExceptionKind) -> usize {
        kind as usize - 1
    }

    /// Record a fault redirected to a handler.
    #[inline]
    pub fn record_redirect(&self, kind: ExceptionKind) {
        self.redirected[Self::slot(kind)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unhandled(&self) {
        self.unhandled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a resume onto a safe-restore point.
    #[inline]
    pub fn record_restore(&self) {
        self.restored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_safepoint_arrival(&self) {
        self.safepoint_arrivals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_interrupt_delivered(&self) {
        self.interrupts_delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_interrupt_declined(&self) {
        self.interrupts_declined.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_interrupt_failed(&self) {
        self.interrupts_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_overflow_capture(&self) {
        self.overflow_captures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_profile_sample(&self) {
        self.profile_samples.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_profile_abort(&self) {
        self.profile_aborts.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            interrupts_raised: load(&self.redirected[Self::slot(ExceptionKind::Interrupt)]),
            divide_errors: load(&self.redirected[Self::slot(ExceptionKind::DivideError)]),
            stack_overflows: load(&self.redirected[Self::slot(ExceptionKind::StackOverflow)]),
            read_only_faults: load(&self.redirected[Self::slot(ExceptionKind::ReadOnlyMemory)]),
            unhandled: load(&self.unhandled),
            restored: load(&self.restored),
            safepoint_arrivals: load(&self.safepoint_arrivals),
            interrupts_delivered: load(&self.interrupts_delivered),
            interrupts_declined: load(&self.interrupts_declined),
            interrupts_failed: load(&self.interrupts_failed),
            overflow_captures: load(&self.overflow_captures),
            profile_samples: load(&self.profile_samples),
            profile_aborts: load(&self.profile_aborts),
        }
    }

    /// Reset all counters.
    pub fn reset(&self) {
        for counter in self.redirected.iter().chain([
            &self.unhandled,
            &self.restored,
            &self.safepoint_arrivals,
            &self.interrupts_delivered,
            &self.interrupts_declined,
            &self.interrupts_failed,
            &self.overflow_captures,
            &self.profile_samples,
            &self.profile_aborts,
        ]) {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// StatsSnapshot
// =============================================================================

/// Point-in-time copy of [`SignalStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub interrupts_raised: u64,
    pub divide_errors: u64,
    pub stack_overflows: u64,
    pub read_only_faults: u64,
    pub unhandled: u64,
    pub restored: u64,
    pub safepoint_arrivals: u64,
    pub interrupts_delivered: u64,
    pub interrupts_declined: u64,
    pub interrupts_failed: u64,
    pub overflow_captures: u64,
    pub profile_samples: u64,
    pub profile_aborts: u64,
}

impl StatsSnapshot {
    /// Faults redirected to any handler.
    pub fn total_redirects(&self) -> u64 {
        self.interrupts_raised + self.divide_errors + self.stack_overflows + self.read_only_faults
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Signal Statistics:")?;
        writeln!(f, "  Redirects:          {}", self.total_redirects())?;
        writeln!(f, "    interrupt:        {}", self.interrupts_raised)?;
        writeln!(f, "    divide error:     {}", self.divide_errors)?;
        writeln!(f, "    stack overflow:   {}", self.stack_overflows)?;
        writeln!(f, "    read-only memory: {}", self.read_only_faults)?;
        writeln!(f, "  Unhandled:          {}", self.unhandled)?;
        writeln!(f, "  Restored:           {}", self.restored)?;
        writeln!(f, "  Safepoint arrivals: {}", self.safepoint_arrivals)?;
        writeln!(
            f,
            "  Interrupts:         {} delivered, {} declined, {} failed",
            self.interrupts_delivered, self.interrupts_declined, self.interrupts_failed
        )?;
        writeln!(f, "  Overflow captures:  {}", self.overflow_captures)?;
        write!(
            f,
            "  Profile samples:    {} ({} aborts)",
            self.profile_samples, self.profile_aborts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirects_are_counted_per_kind() {
        let stats = SignalStats::new();
        stats.record_redirect(ExceptionKind::DivideError);
        stats.record_redirect(ExceptionKind::DivideError);
        stats.record_redirect(ExceptionKind::Interrupt);

        let snap = stats.snapshot();
        assert_eq!(snap.divide_errors, 2);
        assert_eq!(snap.interrupts_raised, 1);
        assert_eq!(snap.total_redirects(), 3);
    }

    #[test]
    fn test_reset() {
        let stats = SignalStats::new();
        stats.record_unhandled();
        stats.record_profile_sample();
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_display() {
        let stats = SignalStats::new();
        stats.record_overflow_capture();
        let text = stats.snapshot().to_string();
        assert!(text.contains("Overflow captures:  1"));
    }
}
