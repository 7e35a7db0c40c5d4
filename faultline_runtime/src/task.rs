//! Logical tasks and their exception-handler chains.
//!
//! The fault layer only ever reads a task: it looks at the innermost
//! handler frame and the saved GC-stack root. Frames are pushed and popped
//! by the owning thread as it enters and leaves protected regions.
//!
//! The innermost frame is mirrored into a sequence-locked snapshot so it can
//! be read from another thread while the owner is suspended at an arbitrary
//! instruction, including halfway through a push or pop:
//!
//! ```text
//!   owner (push/pop)                 reader (fault / interrupt path)
//!   ────────────────                 ───────────────────────────────
//!   seq += 1        (odd)            s1 = seq; odd? retry
//!   write frame words                read frame words
//!   seq += 1        (even)           s2 = seq; s1 != s2? retry
//! ```
//!
//! A reader that keeps seeing an odd sequence gets [`HandlerChainBusy`] and
//! must treat the chain as unknown, never as empty.

use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering, fence};

use parking_lot::Mutex;
use smallvec::SmallVec;
use thiserror::Error;

use crate::context::{CALLEE_SAVED_REGS, Continuation};

/// Inline capacity of the handler chain before it spills to the heap.
const INLINE_HANDLERS: usize = 4;

/// Words in an encoded [`HandlerFrame`]: ip, sp, fp, callee-saved, lo, hi.
const FRAME_WORDS: usize = 3 + CALLEE_SAVED_REGS + 2;

/// Snapshot reads attempted before reporting the chain busy.
const READ_ATTEMPTS: usize = 8;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// StackBounds / HandlerFrame
// =============================================================================

/// Stack region active when a handler frame was pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// Lowest usable address.
    pub lo: usize,
    /// One past the highest usable address.
    pub hi: usize,
}

impl StackBounds {
    /// Whether `addr` falls inside the region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.lo && addr < self.hi
    }
}

/// One protected region's recovery point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerFrame {
    /// Where a raised exception resumes.
    pub continuation: Continuation,
    /// Stack bounds at push time.
    pub bounds: StackBounds,
}

impl HandlerFrame {
    fn encode(&self) -> [usize; FRAME_WORDS] {
        let c = &self.continuation;
        let mut words = [0; FRAME_WORDS];
        words[0] = c.ip;
        words[1] = c.sp;
        words[2] = c.fp;
        words[3..3 + CALLEE_SAVED_REGS].copy_from_slice(&c.callee_saved);
        words[FRAME_WORDS - 2] = self.bounds.lo;
        words[FRAME_WORDS - 1] = self.bounds.hi;
        words
    }

    fn decode(words: &[usize; FRAME_WORDS]) -> Self {
        let mut callee_saved = [0; CALLEE_SAVED_REGS];
        callee_saved.copy_from_slice(&words[3..3 + CALLEE_SAVED_REGS]);
        HandlerFrame {
            continuation: Continuation {
                ip: words[0],
                sp: words[1],
                fp: words[2],
                callee_saved,
            },
            bounds: StackBounds {
                lo: words[FRAME_WORDS - 2],
                hi: words[FRAME_WORDS - 1],
            },
        }
    }
}

/// The innermost handler frame was being replaced when it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("handler chain is being updated")]
pub struct HandlerChainBusy;

// =============================================================================
// TopFrame
// =============================================================================

/// Sequence-locked copy of the innermost handler frame.
///
/// One writer at a time (the chain mutex holder); any number of readers,
/// none of which ever block.
#[derive(Debug)]
struct TopFrame {
    seq: AtomicUsize,
    present: AtomicBool,
    words: [AtomicUsize; FRAME_WORDS],
}

impl TopFrame {
    fn new() -> Self {
        TopFrame {
            seq: AtomicUsize::new(0),
            present: AtomicBool::new(false),
            words: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    fn publish(&self, frame: Option<&HandlerFrame>) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        match frame {
            Some(frame) => {
                for (slot, word) in self.words.iter().zip(frame.encode()) {
                    slot.store(word, Ordering::Relaxed);
                }
                self.present.store(true, Ordering::Relaxed);
            }
            None => self.present.store(false, Ordering::Relaxed),
        }

        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    fn read(&self) -> Result<Option<HandlerFrame>, HandlerChainBusy> {
        for _ in 0..READ_ATTEMPTS {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                hint::spin_loop();
                continue;
            }

            let present = self.present.load(Ordering::Relaxed);
            let mut words = [0; FRAME_WORDS];
            for (word, slot) in words.iter_mut().zip(&self.words) {
                *word = slot.load(Ordering::Relaxed);
            }

            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return Ok(present.then(|| HandlerFrame::decode(&words)));
            }
        }
        Err(HandlerChainBusy)
    }
}

// =============================================================================
// Task
// =============================================================================

/// A unit of sequential execution.
#[derive(Debug)]
pub struct Task {
    id: u64,
    handlers: Mutex<SmallVec<[HandlerFrame; INLINE_HANDLERS]>>,
    top: TopFrame,
    gc_stack: AtomicUsize,
}

impl Task {
    /// Create a task with an empty protection stack.
    pub fn new() -> Self {
        Task {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            handlers: Mutex::new(SmallVec::new()),
            top: TopFrame::new(),
            gc_stack: AtomicUsize::new(0),
        }
    }

    /// Process-unique identity; never zero.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Enter a protected region.
    pub fn push_handler(&self, frame: HandlerFrame) {
        let mut chain = self.handlers.lock();
        chain.push(frame);
        self.top.publish(Some(&frame));
    }

    /// Leave the innermost protected region.
    pub fn pop_handler(&self) -> Option<HandlerFrame> {
        let mut chain = self.handlers.lock();
        let popped = chain.pop();
        self.top.publish(chain.last());
        popped
    }

    /// Number of active handler frames.
    pub fn handler_depth(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Innermost handler frame, without blocking.
    ///
    /// `Ok(None)` means the chain is empty. [`HandlerChainBusy`] means the
    /// owner was stopped partway through a push or pop.
    #[inline]
    pub fn top_handler(&self) -> Result<Option<HandlerFrame>, HandlerChainBusy> {
        self.top.read()
    }

    /// Whether a handler frame is known to be active, without blocking.
    #[inline]
    pub fn has_handler(&self) -> bool {
        matches!(self.top_handler(), Ok(Some(_)))
    }

    /// Saved GC-stack root used when walking this task.
    #[inline]
    pub fn gc_stack(&self) -> Option<usize> {
        match self.gc_stack.load(Ordering::Acquire) {
            0 => None,
            root => Some(root),
        }
    }

    /// Record the GC-stack root (scheduler-owned).
    #[inline]
    pub fn set_gc_stack(&self, root: usize) {
        self.gc_stack.store(root, Ordering::Release);
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ip: usize) -> HandlerFrame {
        HandlerFrame {
            continuation: Continuation::new(ip, 0x8000, 0x8010),
            bounds: StackBounds { lo: 0x1000, hi: 0x9000 },
        }
    }

    #[test]
    fn test_task_ids_are_unique_and_nonzero() {
        let a = Task::new();
        let b = Task::new();
        assert_ne!(a.id(), 0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_handler_chain_is_lifo() {
        let task = Task::new();
        assert!(!task.has_handler());

        task.push_handler(frame(0x10));
        task.push_handler(frame(0x20));
        assert_eq!(task.handler_depth(), 2);
        assert_eq!(top_ip(&task), Some(0x20));

        task.pop_handler();
        assert_eq!(top_ip(&task), Some(0x10));
        task.pop_handler();
        assert!(!task.has_handler());
        assert_eq!(task.top_handler(), Ok(None));
    }

    fn top_ip(task: &Task) -> Option<usize> {
        task.top_handler().unwrap().map(|f| f.continuation.ip)
    }

    #[test]
    fn test_top_handler_does_not_block_while_chain_is_locked() {
        let task = Task::new();
        task.push_handler(frame(0x10));
        let _held = task.handlers.lock();
        assert_eq!(top_ip(&task), Some(0x10));
    }

    #[test]
    fn test_top_handler_is_busy_mid_update() {
        let task = Task::new();
        task.push_handler(frame(0x10));

        // Owner stopped between the two sequence bumps.
        task.top.seq.fetch_add(1, Ordering::Relaxed);
        assert_eq!(task.top_handler(), Err(HandlerChainBusy));
        assert!(!task.has_handler());

        task.top.seq.fetch_add(1, Ordering::Relaxed);
        assert_eq!(top_ip(&task), Some(0x10));
    }

    #[test]
    fn test_frame_words_round_trip_every_register() {
        let mut f = frame(0x40);
        f.continuation.callee_saved = [11, 12, 13, 14, 15, 16, 17];
        assert_eq!(HandlerFrame::decode(&f.encode()), f);
    }

    #[test]
    fn test_concurrent_reader_never_sees_a_torn_frame() {
        use std::sync::Arc;

        let task = Arc::new(Task::new());
        task.push_handler(frame(0x10));
        let stop = Arc::new(AtomicBool::new(false));

        let churn = {
            let task = Arc::clone(&task);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let mut inner = frame(0x20);
                    inner.continuation.callee_saved = [0x20; CALLEE_SAVED_REGS];
                    task.push_handler(inner);
                    task.pop_handler();
                }
            })
        };

        for _ in 0..20_000 {
            if let Ok(top) = task.top_handler() {
                let f = top.expect("base frame is always present");
                let ip = f.continuation.ip;
                assert!(ip == 0x10 || ip == 0x20);
                if ip == 0x20 {
                    assert_eq!(f.continuation.callee_saved, [0x20; CALLEE_SAVED_REGS]);
                } else {
                    assert_eq!(f.continuation.callee_saved, [0; CALLEE_SAVED_REGS]);
                }
            }
        }
        stop.store(true, Ordering::Relaxed);
        churn.join().unwrap();
    }

    #[test]
    fn test_gc_stack_root() {
        let task = Task::new();
        assert_eq!(task.gc_stack(), None);
        task.set_gc_stack(0xabc0);
        assert_eq!(task.gc_stack(), Some(0xabc0));
    }

    #[test]
    fn test_stack_bounds_contains() {
        let b = StackBounds { lo: 0x100, hi: 0x200 };
        assert!(b.contains(0x100));
        assert!(b.contains(0x1ff));
        assert!(!b.contains(0x200));
    }
}
