//! Preallocated exception singletons raised by the fault layer.
//!
//! Faults never allocate: each translated fault selects one of these
//! process-wide values and stores its kind in the faulting thread's pending
//! exception slot.

use std::fmt;

// =============================================================================
// ExceptionKind
// =============================================================================

/// Which singleton a translated fault raises.
///
/// Discriminants start at 1 so that 0 can encode "nothing pending" in an
/// atomic slot.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// User interrupt (Ctrl-C).
    Interrupt = 1,
    /// Integer division by zero.
    DivideError = 2,
    /// Stack exhausted.
    StackOverflow = 3,
    /// Write to read-only memory.
    ReadOnlyMemory = 4,
}

impl ExceptionKind {
    /// All kinds, in discriminant order.
    pub const ALL: [ExceptionKind; 4] = [
        ExceptionKind::Interrupt,
        ExceptionKind::DivideError,
        ExceptionKind::StackOverflow,
        ExceptionKind::ReadOnlyMemory,
    ];

    /// Decode a raw slot value.
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ExceptionKind::Interrupt),
            2 => Some(ExceptionKind::DivideError),
            3 => Some(ExceptionKind::StackOverflow),
            4 => Some(ExceptionKind::ReadOnlyMemory),
            _ => None,
        }
    }

    /// The shared exception value for this kind.
    #[inline]
    pub fn singleton(self) -> &'static RuntimeException {
        match self {
            ExceptionKind::Interrupt => &INTERRUPT_EXCEPTION,
            ExceptionKind::DivideError => &DIVIDE_ERROR_EXCEPTION,
            ExceptionKind::StackOverflow => &STACK_OVERFLOW_EXCEPTION,
            ExceptionKind::ReadOnlyMemory => &READ_ONLY_MEMORY_EXCEPTION,
        }
    }
}

// =============================================================================
// RuntimeException
// =============================================================================

/// An immutable, shared exception value.
#[derive(Debug, PartialEq, Eq)]
pub struct RuntimeException {
    kind: ExceptionKind,
    type_name: &'static str,
    message: &'static str,
}

impl RuntimeException {
    /// Which fault class produced this value.
    #[inline]
    pub fn kind(&self) -> ExceptionKind {
        self.kind
    }

    /// Language-level type name.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Human-readable description.
    #[inline]
    pub fn message(&self) -> &'static str {
        self.message
    }
}

impl fmt::Display for RuntimeException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// Raised into the main task on user interrupt.
pub static INTERRUPT_EXCEPTION: RuntimeException = RuntimeException {
    kind: ExceptionKind::Interrupt,
    type_name: "InterruptException",
    message: "interrupted by user",
};

/// Raised on integer division by zero.
pub static DIVIDE_ERROR_EXCEPTION: RuntimeException = RuntimeException {
    kind: ExceptionKind::DivideError,
    type_name: "DivideError",
    message: "integer division error",
};

/// Raised when a task exhausts its stack.
pub static STACK_OVERFLOW_EXCEPTION: RuntimeException = RuntimeException {
    kind: ExceptionKind::StackOverflow,
    type_name: "StackOverflowError",
    message: "stack overflow",
};

/// Raised on a write to read-only memory.
pub static READ_ONLY_MEMORY_EXCEPTION: RuntimeException = RuntimeException {
    kind: ExceptionKind::ReadOnlyMemory,
    type_name: "ReadOnlyMemoryError",
    message: "tried to write to read-only memory",
};

// =============================================================================
// Tests
// =============================================================================
