//! Outcomes of rate limit checks.

use serde::{Deserialize, Serialize};

/// Read-only decision produced by a backend before anything is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Whether a block flag or any rule denies the call
    pub denied: bool,
    /// Seconds until the binding constraint frees up (0 when allowed)
    pub wait_seconds: f64,
}

impl Evaluation {
    /// An evaluation that allows the call.
    pub fn allowed() -> Self {
        Self {
            denied: false,
            wait_seconds: 0.0,
        }
    }

    /// An evaluation that denies the call for `wait_seconds`.
    pub fn denied(wait_seconds: f64) -> Self {
        Self {
            denied: true,
            wait_seconds,
        }
    }
}

/// Remaining budget in a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaLeft {
    /// Calls still available in the window
    pub remaining: u32,
    /// Seconds until the oldest counted call leaves the window (0 if none)
    pub reset_in: f64,
}

/// The result of a check, handed back to the calling layer.
///
/// A denied verdict always reports zero remaining calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether the call was refused
    pub denied: bool,
    /// When denied, seconds until a retry can succeed; when allowed, seconds
    /// until the widest window's quota resets
    pub wait_seconds: f64,
    /// Calls left in the widest window
    pub remaining: u32,
}

impl Verdict {
    /// A permitted call.
    pub fn allowed(remaining: u32, reset_in: f64) -> Self {
        Self {
            denied: false,
            wait_seconds: reset_in,
            remaining,
        }
    }

    /// A refused call.
    pub fn denied(wait_seconds: f64) -> Self {
        Self {
            denied: true,
            wait_seconds,
            remaining: 0,
        }
    }

    /// `ceil(wait_seconds)` for throttling responses, only when denied.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.denied.then(|| self.wait_seconds.max(0.0).ceil() as u64)
    }
}
