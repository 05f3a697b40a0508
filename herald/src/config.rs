use std::time::Duration;

pub const DEFAULT_POOL_MAX_SIZE: usize = 10;
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "herald-looper";

// --- Configuration Enums ---

/// Defines what `MessagePool::acquire` does when the free list is empty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Allocate a fresh message; the pool only bounds how many are kept for reuse.
    #[default]
    Allocate,
    /// Refuse with `PoolError::Exhausted`. Combine with `prefill` to cap the
    /// number of messages that can be in flight at once.
    Fail,
}

// --- Pool Configuration ---

/// Configuration for a `MessagePool`.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Maximum number of recycled messages kept on the free list.
    pub max_size: usize,

    /// Number of messages allocated up front. Clamped to `max_size`.
    pub prefill: usize,

    /// Behaviour when the free list is empty.
    pub exhaustion: ExhaustionPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_MAX_SIZE,
            prefill: 0,
            exhaustion: ExhaustionPolicy::Allocate,
        }
    }
}

// --- Looper Configuration ---

/// Configuration applied when a `Looper` is prepared.
#[derive(Clone, Debug)]
pub struct LooperConfig {
    /// Pool created for this looper when no shared pool is supplied.
    pub pool: PoolConfig,

    /// Whether `quit()` is accepted. Always false for the main looper.
    pub quit_allowed: bool,

    /// Dispatches slower than this are reported with a warning.
    pub slow_dispatch_threshold: Option<Duration>,

    /// Name prefix for threads spawned by `LooperThread`.
    pub thread_name_prefix: String,
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            quit_allowed: true,
            slow_dispatch_threshold: None,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}

impl LooperConfig {
    /// Configuration used for the process main looper.
    pub fn main() -> Self {
        Self {
            quit_allowed: false,
            ..Default::default()
        }
    }
}
