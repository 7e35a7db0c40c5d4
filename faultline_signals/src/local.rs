//! Per-OS-thread fault handling state.
//!
//! Two thread-local slots are consulted by the OS callbacks:
//!
//! | Slot            | Set by                          | Read by                 |
//! |-----------------|---------------------------------|-------------------------|
//! | current thread  | [`bind_current_thread`]         | fault and signal glue   |
//! | safe restore    | [`SafeRestoreScope::enter`]     | translator, CRT SIGSEGV |
//!
//! A safe-restore point is a continuation a runtime routine registers while
//! it reads memory that may not be mapped; any memory fault on that thread
//! resumes there instead of reaching the user's handler chain.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::Arc;

use faultline_runtime::{Continuation, ThreadState};

thread_local! {
    static CURRENT_THREAD: RefCell<Option<Arc<ThreadState>>> = const { RefCell::new(None) };
    static SAFE_RESTORE: Cell<Option<Continuation>> = const { Cell::new(None) };
}

// =============================================================================
// Current thread
// =============================================================================

/// Associate the calling OS thread with its runtime state.
pub fn bind_current_thread(state: Arc<ThreadState>) {
    CURRENT_THREAD.with(|slot| *slot.borrow_mut() = Some(state));
}

/// Drop the calling thread's association, returning it.
pub fn unbind_current_thread() -> Option<Arc<ThreadState>> {
    CURRENT_THREAD.with(|slot| slot.borrow_mut().take())
}

/// Run `f` with the calling thread's runtime state, if bound.
///
/// Threads that were never bound (and threads being torn down) see `None`.
pub fn with_current_thread<R>(f: impl FnOnce(Option<&ThreadState>) -> R) -> R {
    let state = CURRENT_THREAD
        .try_with(|slot| slot.try_borrow().ok().and_then(|s| s.clone()))
        .ok()
        .flatten();
    f(state.as_deref())
}

// =============================================================================
// Safe restore
// =============================================================================

/// The calling thread's registered safe-restore point.
#[inline]
pub fn safe_restore() -> Option<Continuation> {
    SAFE_RESTORE.try_with(Cell::get).ok().flatten()
}

/// Registration of a safe-restore point; the previous one is reinstated on
/// drop.
#[must_use = "the restore point is unregistered when the scope is dropped"]
pub struct SafeRestoreScope {
    previous: Option<Continuation>,
    _not_send: PhantomData<*const ()>,
}

impl SafeRestoreScope {
    pub fn enter(point: Continuation) -> Self {
        let previous = SAFE_RESTORE.with(|slot| slot.replace(Some(point)));
        SafeRestoreScope {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for SafeRestoreScope {
    fn drop(&mut self) {
        let previous = self.previous;
        let _ = SAFE_RESTORE.try_with(|slot| slot.set(previous));
    }
}

#[cfg(test)]
mod tests {
    use faultline_runtime::ThreadHandle;

    use super::*;

    #[test]
    fn test_unbound_thread_sees_none() {
        std::thread::spawn(|| {
            assert!(with_current_thread(|t| t.is_none()));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_bind_and_unbind() {
        std::thread::spawn(|| {
            let state = Arc::new(ThreadState::new(3, ThreadHandle::from_raw(9), 4));
            bind_current_thread(Arc::clone(&state));
            assert_eq!(with_current_thread(|t| t.map(|t| t.tid())), Some(3));
            assert!(unbind_current_thread().is_some());
            assert!(with_current_thread(|t| t.is_none()));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_restore_scopes_nest() {
        std::thread::spawn(|| {
            assert!(safe_restore().is_none());
            let outer = Continuation::new(0x10, 0x20, 0x30);
            let inner = Continuation::new(0x40, 0x50, 0x60);
            {
                let _outer = SafeRestoreScope::enter(outer);
                assert_eq!(safe_restore(), Some(outer));
                {
                    let _inner = SafeRestoreScope::enter(inner);
                    assert_eq!(safe_restore(), Some(inner));
                }
                assert_eq!(safe_restore(), Some(outer));
            }
            assert!(safe_restore().is_none());
        })
        .join()
        .unwrap();
    }
}
