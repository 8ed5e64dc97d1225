//! Error types for the Windowguard rate limiter.

use thiserror::Error;

/// Main error type for Windowguard operations.
#[derive(Error, Debug)]
pub enum WindowguardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule or per-subject rule override that cannot be used
    #[error("Invalid rate limit rule: {0}")]
    InvalidRule(String),

    /// Administrative call with an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The entity is over one of its limits.
    #[error("Rate limited, retry in {wait_seconds:.3}s")]
    RateLimited {
        /// Seconds until the entity may try again
        wait_seconds: f64,
    },

    /// Call history kept changing underneath the optimistic record loop.
    #[error("Could not record call for {key} after {attempts} attempts")]
    LockingFailure {
        /// Entity key whose history was contended
        key: String,
        /// Number of attempts made
        attempts: usize,
    },

    /// A stored call timestamp could not be parsed
    #[error("Corrupt call history for {key}: {value:?}")]
    CorruptHistory {
        /// Entity key
        key: String,
        /// The raw stored value
        value: String,
    },

    /// Shared store errors
    #[error("Storage backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WindowguardError {
    /// Whole seconds a throttled caller should wait, for `Retry-After` style hints.
    ///
    /// Only [`WindowguardError::RateLimited`] carries a wait time.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            WindowguardError::RateLimited { wait_seconds } => {
                Some(wait_seconds.max(0.0).ceil() as u64)
            }
            _ => None,
        }
    }
}

/// Result type alias for Windowguard operations.
pub type Result<T> = std::result::Result<T, WindowguardError>;
