//! Sliding-window rate limiting and its storage backends.

mod backend;
mod entity;
mod limiter;
mod memory;
mod redis_backend;
mod rules;
mod verdict;

pub use backend::{
    KeyPrefix, RateLimiterBackend, StoreKeys, FALLBACK_WAIT_SECS, MAX_RECORD_ATTEMPTS,
};
pub use entity::{RateLimitedEntity, RateLimitedSubject, RateLimitedUser};
pub use limiter::RateLimiter;
pub use memory::{InMemoryBackend, SWEEP_INTERVAL_SECS};
pub use redis_backend::RedisBackend;
pub use rules::{Rule, RuleSet, RuleTable, RuleTableConfig, DEFAULT_USER_DOMAIN};
pub use verdict::{Evaluation, QuotaLeft, Verdict};
