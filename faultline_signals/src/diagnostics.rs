//! Allocation-free diagnostic output for fault context.
//!
//! Nothing here takes a lock or touches the heap: a faulting thread may hold
//! the allocator lock, the stdio lock, or have almost no stack left. Text is
//! formatted through `core::fmt` straight into raw writes on the standard
//! error descriptor.
//!
//! ```text
//! safe_print!("...{}", x)
//!        │
//!        ▼
//!   SafeStderr ──(fmt::Write)──► write(2, ...) / WriteFile(STD_ERROR_HANDLE)
//! ```

use std::fmt::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

/// One-time warning emitted on the first overflow capture.
pub const STACK_OVERFLOW_WARNING: &str = "Warning: detected a stack overflow; program state may be corrupted, so further execution might be unreliable.\n";

static OVERFLOW_WARNED: AtomicBool = AtomicBool::new(false);

// =============================================================================
// SafeStderr
// =============================================================================

/// Unbuffered standard error writer usable from fault context.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafeStderr;

impl fmt::Write for SafeStderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_stderr(s.as_bytes());
        Ok(())
    }
}

/// Format `args` directly to standard error.
#[doc(hidden)]
pub fn safe_print_args(args: fmt::Arguments<'_>) {
    let _ = SafeStderr.write_fmt(args);
}

/// Print to standard error without allocating or locking.
#[macro_export]
macro_rules! safe_print {
    ($($arg:tt)*) => {
        $crate::diagnostics::safe_print_args(format_args!($($arg)*))
    };
}

#[cfg(unix)]
fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: writing an initialised buffer to a descriptor we don't own
        // the lifetime of; failure is ignored.
        let n = unsafe { libc::write(2, bytes.as_ptr().cast(), bytes.len()) };
        if n <= 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

#[cfg(windows)]
fn write_stderr(mut bytes: &[u8]) {
    use windows_sys::Win32::Storage::FileSystem::WriteFile;
    use windows_sys::Win32::System::Console::{GetStdHandle, STD_ERROR_HANDLE};

    // SAFETY: the std handle is process-owned; the buffer outlives the call.
    unsafe {
        let handle = GetStdHandle(STD_ERROR_HANDLE);
        while !bytes.is_empty() {
            let mut written = 0u32;
            let len = bytes.len().min(u32::MAX as usize) as u32;
            if WriteFile(
                handle,
                bytes.as_ptr(),
                len,
                &mut written,
                std::ptr::null_mut(),
            ) == 0
                || written == 0
            {
                return;
            }
            bytes = &bytes[written as usize..];
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn write_stderr(_bytes: &[u8]) {}

// =============================================================================
// FixedBuf
// =============================================================================

/// Fixed-capacity text sink; output past capacity is dropped.
///
/// Used where a report must be assembled before it is emitted, and by
/// tests that inspect fault-context output.
pub struct FixedBuf<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> FixedBuf<N> {
    pub const fn new() -> Self {
        FixedBuf {
            bytes: [0; N],
            len: 0,
        }
    }

    /// Text written so far.
    pub fn as_str(&self) -> &str {
        // Truncation happens on char boundaries in `write_str`.
        std::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Emit the buffered text to standard error.
    pub fn flush_to_stderr(&self) {
        write_stderr(&self.bytes[..self.len]);
    }
}

impl<const N: usize> Default for FixedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

impl<const N: usize> fmt::Debug for FixedBuf<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FixedBuf").field(&self.as_str()).finish()
    }
}

// =============================================================================
// One-time warnings
// =============================================================================

/// Print the stack-overflow warning the first time only.
///
/// Returns whether this call printed it.
pub fn warn_stack_overflow_once() -> bool {
    if OVERFLOW_WARNED.swap(true, Ordering::Relaxed) {
        return false;
    }
    write_stderr(STACK_OVERFLOW_WARNING.as_bytes());
    true
}
