//! Error types for installation and platform calls.
//!
//! Fault and interrupt paths never return these to their caller; they
//! report dispositions instead. Only installation, the freeze/resume
//! primitive and the profiler lifecycle surface errors.

use faultline_runtime::{RegistryError, SafepointError};
use thiserror::Error;

/// A failed OS primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// The named call reported failure.
    #[error("{call} failed (os error {code})")]
    CallFailed {
        /// OS function name.
        call: &'static str,
        /// Raw OS error code.
        code: i32,
    },
    /// The primitive has no implementation on this platform.
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl PlatformError {
    /// Capture the calling thread's last OS error for `call`.
    pub fn last_os_error(call: &'static str) -> Self {
        PlatformError::CallFailed {
            call,
            code: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

/// Installation and runtime setup failures.
#[derive(Debug, Error)]
pub enum SignalError {
    /// A CRT signal handler could not be registered.
    #[error("fatal error: Couldn't set {0}")]
    SignalInstall(&'static str),
    /// An OS call failed.
    #[error(transparent)]
    Platform(#[from] PlatformError),
    /// The thread registry rejected a registration.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The safepoint page could not be set up.
    #[error(transparent)]
    Safepoint(#[from] SafepointError),
    /// The overflow capture context could not be created.
    #[error("fatal error allocating signal stack: {0}")]
    OverflowStack(#[source] std::io::Error),
    /// Default handlers were installed for a different runtime.
    #[error("fault handlers are already installed for another runtime")]
    AlreadyInstalled,
    /// Fault delivery is not implemented on this platform.
    #[error("fault handling is not supported on this platform")]
    UnsupportedPlatform,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_error_display() {
        let err = PlatformError::CallFailed {
            call: "SuspendThread",
            code: 5,
        };
        assert_eq!(err.to_string(), "SuspendThread failed (os error 5)");
    }

    #[test]
    fn test_signal_error_wraps_platform_error() {
        let err: SignalError = PlatformError::Unsupported("GetThreadContext").into();
        assert_eq!(
            err.to_string(),
            "GetThreadContext is not supported on this platform"
        );
    }
}
