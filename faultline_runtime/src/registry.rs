//! Process-wide table of per-thread state, indexed by thread index.
//!
//! Slots are filled when a thread starts and cleared when it exits. A
//! retired slot is reused by the next registration so indices stay dense.
//! Index [`MAIN_THREAD_INDEX`] always belongs to the first registered
//! thread.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::thread::{MAIN_THREAD_INDEX, ThreadHandle, ThreadState};

/// Registration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The OS thread already owns a live record.
    #[error("thread handle {0:#x} is already registered")]
    AlreadyRegistered(usize),
    /// The table has no free slot.
    #[error("thread registry is full ({0} slots)")]
    Full(usize),
}

// =============================================================================
// ThreadRegistry
// =============================================================================

/// Indexed table of live [`ThreadState`] records.
#[derive(Debug)]
pub struct ThreadRegistry {
    slots: RwLock<Vec<Option<Arc<ThreadState>>>>,
    max_threads: usize,
    backtrace_capacity: usize,
}

impl ThreadRegistry {
    /// Create an empty registry.
    ///
    /// Every record created through it gets a backtrace buffer of
    /// `backtrace_capacity` frames.
    pub fn new(max_threads: usize, backtrace_capacity: usize) -> Self {
        ThreadRegistry {
            slots: RwLock::new(Vec::new()),
            max_threads,
            backtrace_capacity,
        }
    }

    /// Create and publish the record for a starting thread.
    pub fn register(&self, system_id: ThreadHandle) -> Result<Arc<ThreadState>, RegistryError> {
        let mut slots = self.slots.write();

        let duplicate = slots
            .iter()
            .flatten()
            .any(|state| state.system_id() == system_id);
        if duplicate {
            return Err(RegistryError::AlreadyRegistered(system_id.as_raw()));
        }

        let tid = match slots.iter().position(Option::is_none) {
            Some(free) => free,
            None if slots.len() < self.max_threads => {
                slots.push(None);
                slots.len() - 1
            }
            None => return Err(RegistryError::Full(self.max_threads)),
        };

        let state = Arc::new(ThreadState::new(tid, system_id, self.backtrace_capacity));
        slots[tid] = Some(Arc::clone(&state));
        debug!(tid, handle = system_id.as_raw(), "registered thread");
        Ok(state)
    }

    /// Retire the record of an exiting thread.
    pub fn retire(&self, tid: usize) -> Option<Arc<ThreadState>> {
        let mut slots = self.slots.write();
        let retired = slots.get_mut(tid).and_then(Option::take);
        if retired.is_some() {
            debug!(tid, "retired thread");
        }
        retired
    }

    /// Live record at `tid`.
    pub fn get(&self, tid: usize) -> Option<Arc<ThreadState>> {
        self.slots.read().get(tid).cloned().flatten()
    }

    /// Live record of the main thread.
    #[inline]
    pub fn main_thread(&self) -> Option<Arc<ThreadState>> {
        self.get(MAIN_THREAD_INDEX)
    }

    /// Number of live records.
    pub fn live_count(&self) -> usize {
        self.slots.read().iter().flatten().count()
    }

    /// Snapshot of all live records in index order.
    pub fn live_threads(&self) -> Vec<Arc<ThreadState>> {
        self.slots.read().iter().flatten().cloned().collect()
    }

    /// Backtrace capacity given to new records.
    #[inline]
    pub fn backtrace_capacity(&self) -> usize {
        self.backtrace_capacity
    }
}

// =============================================================================
// Tests
// =============================================================================
