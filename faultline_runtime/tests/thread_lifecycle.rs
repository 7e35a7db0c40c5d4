//! Registry and task lifecycle across real threads.

use std::sync::Arc;
use std::thread;

use faultline_runtime::{
    Continuation, HandlerFrame, MAIN_THREAD_INDEX, StackBounds, Task, ThreadHandle, ThreadRegistry,
};

#[test]
fn test_worker_threads_register_and_retire() {
    let registry = Arc::new(ThreadRegistry::new(16, 32));
    let main = registry.register(ThreadHandle::from_raw(1)).unwrap();
    assert_eq!(main.tid(), MAIN_THREAD_INDEX);

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let state = registry.register(ThreadHandle::from_raw(100 + i)).unwrap();
                assert_ne!(state.tid(), MAIN_THREAD_INDEX);
                let tid = state.tid();
                registry.retire(tid);
                tid
            })
        })
        .collect();

    let mut tids: Vec<usize> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    tids.sort_unstable();
    tids.dedup();
    assert!(!tids.is_empty());
    assert_eq!(registry.live_count(), 1);
}

#[test]
fn test_scheduler_switches_tasks_visible_to_readers() {
    let registry = ThreadRegistry::new(4, 32);
    let main = registry.register(ThreadHandle::from_raw(1)).unwrap();

    let task = Arc::new(Task::new());
    task.push_handler(HandlerFrame {
        continuation: Continuation::new(0x4000, 0x9000, 0x9010),
        bounds: StackBounds { lo: 0x1000, hi: 0xa000 },
    });
    main.set_current_task(Some(Arc::clone(&task)));

    let seen = registry
        .get(MAIN_THREAD_INDEX)
        .and_then(|state| state.try_current_task())
        .unwrap();
    assert_eq!(seen.id(), task.id());
    assert!(seen.has_handler());

    main.set_current_task(None);
    assert!(registry.main_thread().unwrap().current_task().is_none());
}
