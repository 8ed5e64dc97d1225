//! Redis-backed storage backend.
//!
//! Per entity the store holds a list (`LPUSH`/`LTRIM`, most recent first), a
//! sorted set scored by timestamp for range counts, and a block flag with a
//! TTL. Each recorded call is stored as `"<timestamp>:<uuid>"` in both the
//! list and the set so that calls with identical timestamps stay distinct
//! set members.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace};

use super::backend::{self, KeyPrefix, RateLimiterBackend, MAX_RECORD_ATTEMPTS};
use super::rules::RuleSet;
use super::verdict::{Evaluation, QuotaLeft};
use crate::clock::{Clock, SystemClock};
use crate::config::RedisConfig;
use crate::error::{Result, WindowguardError};

/// Backend sharing call history through Redis.
///
/// Cheap to clone. Reads, blocks and clears go through one shared
/// [`ConnectionManager`], opened on first use and reconnecting on failure.
/// `record` opens its own connection so its `WATCH` state is never shared
/// with another call.
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    shared: Arc<OnceCell<ConnectionManager>>,
    prefix: KeyPrefix,
    clock: Arc<dyn Clock>,
}

impl RedisBackend {
    /// Create a backend with a configured client and key prefix.
    pub fn new(client: redis::Client, prefix: KeyPrefix) -> Self {
        Self {
            client,
            shared: Arc::new(OnceCell::new()),
            prefix,
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a backend from service configuration.
    pub fn from_config(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| WindowguardError::Config(format!("invalid redis url: {}", e)))?;
        Ok(Self::new(client, KeyPrefix::new(config.key_prefix.clone())))
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn prefix(&self) -> &KeyPrefix {
        &self.prefix
    }

    /// The shared connection for commands that keep no per-connection state.
    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .shared
            .get_or_try_init(|| async {
                debug!("Opening shared redis connection");
                ConnectionManager::new(self.client.clone()).await
            })
            .await?;
        Ok(manager.clone())
    }

    /// A connection owned by a single `WATCH`/`EXEC` cycle.
    async fn dedicated_connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

fn encode_entry(now: f64) -> String {
    format!("{:.6}:{}", now, uuid::Uuid::new_v4().simple())
}

fn decode_entry(key: &str, entry: &str) -> Result<f64> {
    let stamp = entry.split_once(':').map_or(entry, |(stamp, _)| stamp);
    stamp
        .parse::<f64>()
        .map_err(|_| WindowguardError::CorruptHistory {
            key: key.to_string(),
            value: entry.to_string(),
        })
}

#[async_trait]
impl RateLimiterBackend for RedisBackend {
    async fn evaluate(&self, key: &str, rules: &RuleSet) -> Result<Evaluation> {
        let keys = self.prefix.keys(key);
        let mut con = self.connection().await?;

        // Existence and TTL are read in one transaction so a flag expiring in
        // between cannot yield a bogus wait.
        let (blocked, pttl_ms): (bool, i64) = redis::pipe()
            .atomic()
            .exists(&keys.block)
            .pttl(&keys.block)
            .query_async(&mut con)
            .await?;
        if blocked {
            let ttl = (pttl_ms > 0).then(|| pttl_ms as f64 / 1000.0);
            debug!(key = %key, ?ttl, "Entity is blocked");
            return Ok(backend::blocked(ttl));
        }
        if rules.is_empty() {
            return Ok(Evaluation::allowed());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for rule in rules {
            pipe.lindex(&keys.list, (rule.max_calls as isize - 1).max(0));
        }
        let entries: Vec<Option<String>> = pipe.query_async(&mut con).await?;

        let nth_recent = entries
            .iter()
            .map(|entry| entry.as_deref().map(|e| decode_entry(key, e)).transpose())
            .collect::<Result<Vec<Option<f64>>>>()?;

        let now = self.clock.now();
        trace!(key = %key, ?nth_recent, "Evaluating rules");
        Ok(backend::first_violation(rules, &nth_recent, now))
    }

    async fn record(
        &self,
        key: &str,
        rules: &RuleSet,
        max_calls: u32,
        max_window: u64,
    ) -> Result<()> {
        if rules.is_empty() || max_calls == 0 {
            return Ok(());
        }
        let keys = self.prefix.keys(key);
        let last_index = max_calls as isize - 1;
        let ttl = i64::try_from(max_window).unwrap_or(i64::MAX);
        let mut con = self.dedicated_connection().await?;

        for attempt in 1..=MAX_RECORD_ATTEMPTS {
            // Abort the write if another caller touches the list between
            // reading the entry we are about to trim and trimming it.
            redis::cmd("WATCH")
                .arg(&keys.list)
                .query_async::<()>(&mut con)
                .await?;
            let evicted: Option<String> = con.lindex(&keys.list, last_index).await?;

            let now = self.clock.now();
            let entry = encode_entry(now);

            let mut pipe = redis::pipe();
            pipe.atomic()
                .lpush(&keys.list, &entry)
                .ignore()
                .ltrim(&keys.list, 0, last_index)
                .ignore()
                .zadd(&keys.range, &entry, now)
                .ignore();
            if let Some(evicted) = evicted {
                pipe.zrem(&keys.range, evicted).ignore();
            }
            pipe.expire(&keys.list, ttl)
                .ignore()
                .expire(&keys.range, ttl)
                .ignore();

            let committed: Option<()> = pipe.query_async(&mut con).await?;
            if committed.is_some() {
                return Ok(());
            }
            debug!(key = %key, attempt, "Call history changed during record, retrying");
        }

        Err(WindowguardError::LockingFailure {
            key: key.to_string(),
            attempts: MAX_RECORD_ATTEMPTS,
        })
    }

    async fn quota_left(&self, key: &str, window_secs: u64, max_calls: u32) -> Result<QuotaLeft> {
        let keys = self.prefix.keys(key);
        let now = self.clock.now();
        let boundary = now - window_secs as f64;
        let mut con = self.connection().await?;

        let (count, oldest): (u64, Vec<(String, f64)>) = redis::pipe()
            .atomic()
            .zcount(&keys.range, boundary, now)
            .zrangebyscore_limit_withscores(&keys.range, boundary, now, 0, 1)
            .query_async(&mut con)
            .await?;

        let oldest = oldest.first().map(|(_, score)| *score);
        Ok(backend::quota(window_secs, max_calls, now, count, oldest))
    }

    async fn block(&self, key: &str, seconds: u64) -> Result<()> {
        if seconds == 0 {
            return Err(WindowguardError::InvalidArgument(
                "block duration must be greater than zero".to_string(),
            ));
        }
        let keys = self.prefix.keys(key);
        let mut con = self.connection().await?;
        con.set_ex::<_, _, ()>(&keys.block, 1, seconds).await?;

        info!(key = %key, seconds, "Blocked entity");
        Ok(())
    }

    async fn unblock(&self, key: &str) -> Result<()> {
        let keys = self.prefix.keys(key);
        let mut con = self.connection().await?;
        con.del::<_, ()>(&keys.block).await?;

        info!(key = %key, "Unblocked entity");
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let keys = self.prefix.keys(key);
        let mut con = self.connection().await?;
        con.del::<_, ()>(&[keys.list.as_str(), keys.range.as_str(), keys.block.as_str()])
            .await?;

        info!(key = %key, "Cleared call history");
        Ok(())
    }
}
