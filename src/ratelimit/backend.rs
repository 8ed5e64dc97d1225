//! Storage backend trait and the pieces of the sliding-window algorithm
//! shared by every implementation.
//!
//! Per entity key a backend keeps:
//! - a most-recent-first list of call timestamps, capped at the largest
//!   `max_calls` of the entity's rules,
//! - a range-queryable set over the same timestamps,
//! - an optional block flag with its own expiry.
//!
//! The list and the set both expire after the largest window once the
//! entity goes idle.
//!
//! `evaluate` and `record` are separate round trips. Two callers racing on
//! the same key can both see room under a limit and both record, so a busy
//! entity may briefly overshoot `max_calls` by the number of racing callers.

use async_trait::async_trait;

use super::rules::RuleSet;
use super::verdict::{Evaluation, QuotaLeft};
use crate::error::Result;

/// Attempts at the optimistic read-modify-write in `record` before giving up
/// with [`crate::WindowguardError::LockingFailure`].
pub const MAX_RECORD_ATTEMPTS: usize = 10;

/// Wait reported when a block flag exists but its TTL could not be read, and
/// for denials caused by record contention.
pub const FALLBACK_WAIT_SECS: f64 = 0.5;

/// Trait for rate limiter storage backends.
///
/// Backends hold no per-entity state in the process: everything mutable lives
/// in the store, so one instance can be shared across tasks.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Decide whether the next call for `key` is allowed under `rules`.
    ///
    /// Read-only; a block flag short-circuits the rules.
    async fn evaluate(&self, key: &str, rules: &RuleSet) -> Result<Evaluation>;

    /// Record a call for `key` now.
    ///
    /// Pushes the timestamp, trims the history to `max_calls`, keeps the range
    /// set in step and refreshes both expiries to `max_window`. Retries on
    /// concurrent modification up to [`MAX_RECORD_ATTEMPTS`] times. An empty
    /// rule set records nothing.
    async fn record(
        &self,
        key: &str,
        rules: &RuleSet,
        max_calls: u32,
        max_window: u64,
    ) -> Result<()>;

    /// Calls left for `key` in the last `window_secs` seconds.
    async fn quota_left(&self, key: &str, window_secs: u64, max_calls: u32) -> Result<QuotaLeft>;

    /// Deny every call for `key` during the next `seconds` seconds.
    async fn block(&self, key: &str, seconds: u64) -> Result<()>;

    /// Lift a block early.
    async fn unblock(&self, key: &str) -> Result<()>;

    /// Forget the call history and block flag of `key`.
    async fn clear(&self, key: &str) -> Result<()>;
}

/// Namespace prepended to every store key a backend touches.
///
/// Separate test runs (or tenants) sharing one store use distinct prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPrefix(String);

impl KeyPrefix {
    /// Use `prefix` verbatim.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    /// `"<test_name>:<pid>:"`.
    pub fn for_test(test_name: &str) -> Self {
        Self(format!("{}:{}:", test_name, std::process::id()))
    }

    /// A random namespace nothing else will share.
    pub fn isolated() -> Self {
        Self(format!("test:{}:", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store keys holding the state of `entity_key`.
    pub fn keys(&self, entity_key: &str) -> StoreKeys {
        let base = format!("{}ratelimit:{}", self.0, entity_key);
        StoreKeys {
            list: format!("{}:list", base),
            range: format!("{}:zset", base),
            block: format!("{}:block", base),
        }
    }
}

/// The three store keys of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    /// Most-recent-first timestamp list
    pub list: String,
    /// Range-queryable timestamp set
    pub range: String,
    /// Block flag
    pub block: String,
}

/// Check the rules against the history, finest window first.
///
/// `nth_recent[i]` is the `rules[i].max_calls`-th most recent timestamp, if
/// the history is that long. The first rule whose window still contains that
/// timestamp denies, and its remaining time is the wait.
pub fn first_violation(rules: &RuleSet, nth_recent: &[Option<f64>], now: f64) -> Evaluation {
    for (rule, timestamp) in rules.iter().zip(nth_recent) {
        let Some(timestamp) = timestamp else {
            continue;
        };
        let boundary = timestamp + rule.window_secs as f64;
        if boundary >= now {
            return Evaluation::denied(boundary - now);
        }
    }
    Evaluation::allowed()
}

/// Evaluation for an existing block flag with `ttl_secs` left, if known.
pub fn blocked(ttl_secs: Option<f64>) -> Evaluation {
    match ttl_secs {
        Some(ttl) if ttl > 0.0 => Evaluation::denied(ttl),
        _ => Evaluation::denied(FALLBACK_WAIT_SECS),
    }
}

/// Quota arithmetic over `count` calls in the window, the oldest at `oldest`.
pub fn quota(
    window_secs: u64,
    max_calls: u32,
    now: f64,
    count: u64,
    oldest: Option<f64>,
) -> QuotaLeft {
    let used = u32::try_from(count).unwrap_or(u32::MAX);
    let reset_in = match oldest {
        Some(oldest) => (window_secs as f64 - (now - oldest)).max(0.0),
        None => 0.0,
    };
    QuotaLeft {
        remaining: max_calls.saturating_sub(used),
        reset_in,
    }
}
