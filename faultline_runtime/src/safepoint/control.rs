//! Interrupt-pending state machine and GC gate layered on the poll pages.
//!
//! Two pages are kept. Worker threads poll the worker page, which only a
//! collection arms. The main thread polls the main page, which both a
//! collection and a pending interrupt arm, so an interrupt aimed at the main
//! thread never stops the workers:
//!
//! | Requester          | worker page | main page |
//! |--------------------|-------------|-----------|
//! | `request_gc`       | armed       | armed     |
//! | `enable_sigint`    |             | armed     |
//!
//! The interrupt state is a single atomic so it can be claimed while the
//! main thread is suspended holding any lock. Bringing the main page's
//! protection in line with the state is a separate step that may block.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use super::{SafepointError, SafepointPage};
use crate::thread::ThreadState;

// =============================================================================
// SafepointControl
// =============================================================================

/// The narrow safepoint interface the fault layer depends on.
pub trait SafepointControl: Send + Sync {
    /// Whether a faulting data address is a safepoint poll location.
    fn addr_is_safepoint(&self, addr: usize) -> bool;

    /// Mark an interrupt pending and arm polls so the main thread traps.
    fn enable_sigint(&self);

    /// Claim a pending or deferred interrupt; `true` if one was pending.
    ///
    /// Never blocks. The main thread's poll may stay armed until
    /// [`settle_sigint`](Self::settle_sigint) runs.
    fn take_sigint(&self) -> bool;

    /// Bring poll protection in line with the current interrupt state.
    ///
    /// May block; never call it while another thread is suspended.
    fn settle_sigint(&self);

    /// Clear a pending or deferred interrupt; `true` if one was pending.
    fn consume_sigint(&self) -> bool {
        let had_signal = self.take_sigint();
        self.settle_sigint();
        had_signal
    }

    /// Keep the interrupt pending but stop trapping on it.
    fn defer_sigint(&self);

    /// Current interrupt state.
    fn sigint_state(&self) -> SigintState;

    /// Park `thread` for the duration of any requested collection.
    ///
    /// Called on the faulting thread from fault context.
    fn set_gc_and_wait(&self, thread: &ThreadState);
}

/// Interrupt state tracked by the safepoint.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigintState {
    /// Nothing pending.
    None = 0,
    /// Pending; the main thread's polls are armed.
    Pending = 1,
    /// Pending but deferred; polls are not armed on its behalf.
    Deferred = 2,
}

impl SigintState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SigintState::Pending,
            2 => SigintState::Deferred,
            _ => SigintState::None,
        }
    }
}

// =============================================================================
// Safepoint
// =============================================================================

/// Default [`SafepointControl`] backed by two [`SafepointPage`]s.
#[derive(Debug)]
pub struct Safepoint {
    worker_page: SafepointPage,
    main_page: SafepointPage,
    sigint: AtomicU8,
    /// Whether the main page currently carries an arm for the interrupt.
    sigint_armed: Mutex<bool>,
    gc_requested: Mutex<bool>,
    gc_done: Condvar,
}

impl Safepoint {
    /// Allocate the pages and start with nothing pending.
    pub fn new() -> Result<Self, SafepointError> {
        Ok(Safepoint {
            worker_page: SafepointPage::new()?,
            main_page: SafepointPage::new()?,
            sigint: AtomicU8::new(SigintState::None as u8),
            sigint_armed: Mutex::new(false),
            gc_requested: Mutex::new(false),
            gc_done: Condvar::new(),
        })
    }

    /// Page polled by every thread except the main one.
    #[inline]
    pub fn worker_page(&self) -> &SafepointPage {
        &self.worker_page
    }

    /// Page polled by the main thread.
    #[inline]
    pub fn main_page(&self) -> &SafepointPage {
        &self.main_page
    }

    /// Address a thread's compiled code should poll.
    #[inline]
    pub fn poll_address(&self, main: bool) -> usize {
        if main {
            self.main_page.poll_address()
        } else {
            self.worker_page.poll_address()
        }
    }

    /// Ask every mutator to stop at its next poll.
    pub fn request_gc(&self) -> Result<(), SafepointError> {
        let mut requested = self.gc_requested.lock();
        if !*requested {
            self.worker_page.arm()?;
            if let Err(err) = self.main_page.arm() {
                let _ = self.worker_page.disarm();
                return Err(err);
            }
            *requested = true;
        }
        Ok(())
    }

    /// Release mutators parked in [`SafepointControl::set_gc_and_wait`].
    pub fn finish_gc(&self) -> Result<(), SafepointError> {
        let mut requested = self.gc_requested.lock();
        if *requested {
            *requested = false;
            self.gc_done.notify_all();
            self.worker_page.disarm()?;
            self.main_page.disarm()?;
        }
        Ok(())
    }

    /// Whether a collection is currently requested.
    pub fn gc_requested(&self) -> bool {
        *self.gc_requested.lock()
    }

    #[inline]
    fn state(&self) -> SigintState {
        SigintState::from_u8(self.sigint.load(Ordering::Acquire))
    }
}

impl SafepointControl for Safepoint {
    #[inline]
    fn addr_is_safepoint(&self, addr: usize) -> bool {
        self.main_page.contains_address(addr) || self.worker_page.contains_address(addr)
    }

    fn enable_sigint(&self) {
        self.sigint
            .store(SigintState::Pending as u8, Ordering::Release);
        self.settle_sigint();
    }

    fn take_sigint(&self) -> bool {
        let prev = self.sigint.swap(SigintState::None as u8, Ordering::AcqRel);
        SigintState::from_u8(prev) != SigintState::None
    }

    fn settle_sigint(&self) {
        let mut armed = self.sigint_armed.lock();
        let want = self.state() == SigintState::Pending;
        if want == *armed {
            return;
        }
        let result = if want {
            self.main_page.arm()
        } else {
            self.main_page.disarm()
        };
        match result {
            Ok(()) => *armed = want,
            // A failed disarm only means a spare trap later.
            Err(err) if want => warn!(%err, "failed to arm safepoint for interrupt"),
            Err(_) => {}
        }
    }

    fn defer_sigint(&self) {
        let deferred = self
            .sigint
            .compare_exchange(
                SigintState::Pending as u8,
                SigintState::Deferred as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if deferred {
            self.settle_sigint();
        }
    }

    fn sigint_state(&self) -> SigintState {
        self.state()
    }

    fn set_gc_and_wait(&self, thread: &ThreadState) {
        let mut requested = self.gc_requested.lock();
        if !*requested {
            return;
        }
        thread.set_gc_waiting(true);
        while *requested {
            self.gc_done.wait(&mut requested);
        }
        thread.set_gc_waiting(false);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::thread::ThreadHandle;

    #[test]
    fn test_enable_then_consume() {
        let sp = Safepoint::new().unwrap();
        assert_eq!(sp.sigint_state(), SigintState::None);

        sp.enable_sigint();
        assert_eq!(sp.sigint_state(), SigintState::Pending);
        assert!(sp.main_page().is_armed());

        assert!(sp.consume_sigint());
        assert_eq!(sp.sigint_state(), SigintState::None);
        assert!(!sp.main_page().is_armed());

        assert!(!sp.consume_sigint());
    }

    #[test]
    fn test_interrupt_never_arms_worker_page() {
        let sp = Safepoint::new().unwrap();
        sp.enable_sigint();
        assert!(sp.main_page().is_armed());
        assert!(!sp.worker_page().is_armed());

        // Workers can keep polling while the interrupt waits for main.
        let poll = sp.poll_address(false) as *const u8;
        // SAFETY: the worker page is mapped readable while unarmed.
        let _ = unsafe { std::ptr::read_volatile(poll) };
        sp.consume_sigint();
    }

    #[test]
    fn test_take_leaves_trap_until_settled() {
        let sp = Safepoint::new().unwrap();
        sp.enable_sigint();

        assert!(sp.take_sigint());
        assert_eq!(sp.sigint_state(), SigintState::None);
        assert!(sp.main_page().is_armed());
        assert!(!sp.take_sigint());

        sp.settle_sigint();
        assert!(!sp.main_page().is_armed());
    }

    #[test]
    fn test_take_does_not_wait_on_a_held_settle_lock() {
        let sp = Safepoint::new().unwrap();
        sp.enable_sigint();
        let _held = sp.sigint_armed.lock();
        assert!(sp.take_sigint());
        assert_eq!(sp.sigint_state(), SigintState::None);
    }

    #[test]
    fn test_repeated_enable_arms_once() {
        let sp = Safepoint::new().unwrap();
        sp.enable_sigint();
        sp.enable_sigint();
        assert_eq!(sp.main_page().arm_count(), 1);
        assert!(sp.consume_sigint());
        assert_eq!(sp.main_page().arm_count(), 0);
    }

    #[test]
    fn test_defer_keeps_signal_pending_but_disarms() {
        let sp = Safepoint::new().unwrap();
        sp.enable_sigint();
        sp.defer_sigint();
        assert_eq!(sp.sigint_state(), SigintState::Deferred);
        assert!(!sp.main_page().is_armed());

        // Re-enabling a deferred interrupt re-arms the page.
        sp.enable_sigint();
        assert!(sp.main_page().is_armed());
        sp.defer_sigint();

        assert!(sp.consume_sigint());
        assert_eq!(sp.main_page().arm_count(), 0);
    }

    #[test]
    fn test_defer_without_pending_is_noop() {
        let sp = Safepoint::new().unwrap();
        sp.defer_sigint();
        assert_eq!(sp.sigint_state(), SigintState::None);
    }

    #[test]
    fn test_gc_arms_both_pages_and_shares_main() {
        let sp = Safepoint::new().unwrap();
        sp.request_gc().unwrap();
        assert!(sp.worker_page().is_armed());
        sp.enable_sigint();
        assert_eq!(sp.main_page().arm_count(), 2);

        sp.finish_gc().unwrap();
        assert!(!sp.worker_page().is_armed());
        assert!(sp.main_page().is_armed());
        sp.consume_sigint();
        assert!(!sp.main_page().is_armed());
    }

    #[test]
    fn test_both_pages_are_safepoints() {
        let sp = Safepoint::new().unwrap();
        assert!(sp.addr_is_safepoint(sp.poll_address(true)));
        assert!(sp.addr_is_safepoint(sp.poll_address(false)));
        assert_ne!(sp.poll_address(true), sp.poll_address(false));
        assert!(!sp.addr_is_safepoint(0x10));
    }

    #[test]
    fn test_set_gc_and_wait_returns_immediately_without_gc() {
        let sp = Safepoint::new().unwrap();
        let ts = ThreadState::new(0, ThreadHandle::from_raw(1), 4);
        sp.set_gc_and_wait(&ts);
        assert!(!ts.gc_waiting());
    }

    #[test]
    fn test_set_gc_and_wait_parks_until_finished() {
        let sp = Arc::new(Safepoint::new().unwrap());
        let ts = Arc::new(ThreadState::new(1, ThreadHandle::from_raw(2), 4));
        sp.request_gc().unwrap();

        let waiter = {
            let sp = Arc::clone(&sp);
            let ts = Arc::clone(&ts);
            std::thread::spawn(move || sp.set_gc_and_wait(&ts))
        };

        while !ts.gc_waiting() {
            std::thread::sleep(Duration::from_millis(1));
        }
        sp.finish_gc().unwrap();
        waiter.join().unwrap();
        assert!(!ts.gc_waiting());
    }
}
