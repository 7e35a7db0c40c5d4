//! Signal layer configuration resolved from the environment.
//!
//! Settings are resolved once, before handlers are installed; fault and
//! interrupt paths only read the resolved copy held by the runtime.

use std::time::Duration;

/// Stack reserved for the overflow capture context.
pub const OVERFLOW_STACK_SIZE: usize = 128 * 1024;

/// Default profiler sampling interval.
pub const DEFAULT_PROFILE_INTERVAL_NS: u64 = 1_000_000;

/// Default profile buffer length in words.
pub const DEFAULT_PROFILE_BUFFER_WORDS: usize = 1 << 20;

/// Default per-thread backtrace buffer length in frames.
pub const DEFAULT_BACKTRACE_CAPACITY: usize = 80_000;

/// Default maximum number of registered runtime threads.
pub const DEFAULT_MAX_THREADS: usize = 1024;

// =============================================================================
// SignalConfig
// =============================================================================

/// Complete signal layer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalConfig {
    /// Exit with `128 + signal` on an interrupt instead of raising (`FAULTLINE_EXIT_ON_SIGINT`).
    pub exit_on_sigint: bool,

    /// Profiler sampling interval (`FAULTLINE_PROFILE_INTERVAL_NS`).
    pub profile_interval: Duration,

    /// Profile buffer capacity in words (`FAULTLINE_PROFILE_BUFFER_WORDS`).
    pub profile_buffer_words: usize,

    /// Per-thread backtrace capacity in frames (`FAULTLINE_BACKTRACE_CAPACITY`).
    pub backtrace_capacity: usize,

    /// Stop profiling automatically after this long (`FAULTLINE_PROFILE_AUTOSTOP_MS`).
    pub profile_autostop: Option<Duration>,

    /// Ignore interrupts for this long after install (`FAULTLINE_SIGINT_GRACE_MS`).
    pub sigint_grace: Option<Duration>,

    /// Registry size.
    pub max_threads: usize,

    /// Stack size of the overflow capture context.
    pub overflow_stack_size: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        SignalConfig {
            exit_on_sigint: false,
            profile_interval: Duration::from_nanos(DEFAULT_PROFILE_INTERVAL_NS),
            profile_buffer_words: DEFAULT_PROFILE_BUFFER_WORDS,
            backtrace_capacity: DEFAULT_BACKTRACE_CAPACITY,
            profile_autostop: None,
            sigint_grace: None,
            max_threads: DEFAULT_MAX_THREADS,
            overflow_stack_size: OVERFLOW_STACK_SIZE,
        }
    }
}

impl SignalConfig {
    /// Defaults overridden by any `FAULTLINE_*` variables that are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Resolve against an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = SignalConfig::default();

        config.exit_on_sigint = Self::env_bool(&lookup, "FAULTLINE_EXIT_ON_SIGINT");

        if let Some(ns) = Self::env_parse::<u64, _>(&lookup, "FAULTLINE_PROFILE_INTERVAL_NS") {
            if ns > 0 {
                config.profile_interval = Duration::from_nanos(ns);
            }
        }

        if let Some(words) = Self::env_parse::<usize, _>(&lookup, "FAULTLINE_PROFILE_BUFFER_WORDS") {
            if words > 0 {
                config.profile_buffer_words = words;
            }
        }

        if let Some(frames) = Self::env_parse::<usize, _>(&lookup, "FAULTLINE_BACKTRACE_CAPACITY") {
            if frames > 0 {
                config.backtrace_capacity = frames;
            }
        }

        config.profile_autostop = Self::env_parse::<u64, _>(&lookup, "FAULTLINE_PROFILE_AUTOSTOP_MS")
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis);

        config.sigint_grace = Self::env_parse::<u64, _>(&lookup, "FAULTLINE_SIGINT_GRACE_MS")
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis);

        config
    }

    /// Sampling interval actually slept between samples.
    pub fn effective_profile_interval(&self) -> Duration {
        self.profile_interval.max(Duration::from_millis(1))
    }

    /// Check if a variable is set to a non-empty, truthy value.
    #[inline]
    fn env_bool<F>(lookup: &F, var: &str) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup(var).map(|v| !v.is_empty() && v != "0").unwrap_or(false)
    }

    fn env_parse<T, F>(lookup: &F, var: &str) -> Option<T>
    where
        T: std::str::FromStr,
        F: Fn(&str) -> Option<String>,
    {
        lookup(var).and_then(|v| v.trim().parse().ok())
    }
}
