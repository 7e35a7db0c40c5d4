//! Safepoint collaborator consumed by the fault layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SafepointPage                            │
//! │  one OS page, readable when idle                            │
//! │  arm()  → no access  → next poll faults                     │
//! │  disarm → readable   → polls succeed                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Safepoint (SafepointControl)                               │
//! │  - worker page: armed by a GC request                       │
//! │  - main page: armed by a GC request or a pending interrupt  │
//! │  - interrupt pending state: None → Pending ⇄ Deferred       │
//! │  - GC gate: request_gc() / finish_gc(), set_gc_and_wait()   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The fault layer only sees the [`SafepointControl`] trait, so tests and
//! embedders can substitute their own safepoint protocol.

mod control;
mod page;

use thiserror::Error;

pub use control::{Safepoint, SafepointControl, SigintState};
pub use page::SafepointPage;

/// Safepoint page failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafepointError {
    /// Failed to allocate the page.
    #[error("safepoint allocation failed: {0}")]
    AllocationFailed(String),
    /// Failed to change page protection.
    #[error("safepoint protection change failed: {0}")]
    ProtectionFailed(String),
    /// Disarm without a matching arm.
    #[error("safepoint page is not armed")]
    NotArmed,
}
