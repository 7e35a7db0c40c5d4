//! Runtime-side state consumed by the fault translation layer.
//!
//! This crate provides:
//! - Per-thread state records and the indexed thread registry
//! - Logical tasks with their exception-handler chains
//! - Portable machine contexts and resumable continuations
//! - The preallocated exception singletons
//! - A page-protection safepoint with interrupt-pending tracking

#![deny(unsafe_op_in_unsafe_fn)]

pub mod context;
pub mod exception;
pub mod registry;
pub mod safepoint;
pub mod task;
pub mod thread;

pub use context::{CALLEE_SAVED_REGS, Continuation, LONGJMP_VALUE, MachineContext};
pub use exception::{ExceptionKind, RuntimeException};
pub use registry::{RegistryError, ThreadRegistry};
pub use safepoint::{Safepoint, SafepointControl, SafepointError, SafepointPage, SigintState};
pub use task::{HandlerChainBusy, HandlerFrame, StackBounds, Task};
pub use thread::{BacktraceBuffer, MAIN_THREAD_INDEX, ThreadHandle, ThreadState};
