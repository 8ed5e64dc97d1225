//! In-process storage backend.
//!
//! Suitable for single-process deployments and tests. Record uses the same
//! optimistic scheme as the shared store: read a version, compute, and
//! commit only if the version is unchanged. Expired histories and blocks are
//! dropped when their key is next read, and by a sweep over all keys that
//! `record` runs at most once per [`SWEEP_INTERVAL_SECS`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::backend::{self, KeyPrefix, RateLimiterBackend, MAX_RECORD_ATTEMPTS};
use super::rules::RuleSet;
use super::verdict::{Evaluation, QuotaLeft};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, WindowguardError};

/// Minimum time between two sweeps triggered by `record`.
pub const SWEEP_INTERVAL_SECS: f64 = 60.0;

#[derive(Debug, Clone)]
struct CallHistory {
    version: u64,
    /// Most recent first
    recent: VecDeque<f64>,
    /// Ascending, may hold duplicates
    ordered: Vec<f64>,
    expires_at: f64,
}

impl CallHistory {
    fn is_live(&self, now: f64) -> bool {
        self.expires_at > now
    }
}

/// Backend keeping all state in process memory.
pub struct InMemoryBackend {
    histories: DashMap<String, CallHistory>,
    blocks: DashMap<String, f64>,
    versions: AtomicU64,
    next_sweep: Mutex<f64>,
    prefix: KeyPrefix,
    clock: Arc<dyn Clock>,
}

impl InMemoryBackend {
    /// Create an empty backend on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty backend reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            histories: DashMap::new(),
            blocks: DashMap::new(),
            versions: AtomicU64::new(0),
            next_sweep: Mutex::new(f64::NEG_INFINITY),
            prefix: KeyPrefix::default(),
            clock,
        }
    }

    /// Namespace all keys under `prefix`.
    pub fn with_prefix(mut self, prefix: KeyPrefix) -> Self {
        self.prefix = prefix;
        self
    }

    /// Number of timestamps currently held for `key`.
    pub fn history_len(&self, key: &str) -> usize {
        let keys = self.prefix.keys(key);
        let now = self.clock.now();
        self.histories
            .get(&keys.list)
            .filter(|h| h.is_live(now))
            .map_or(0, |h| h.recent.len())
    }

    /// Drop every expired history and block. Returns how many entries were
    /// removed.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let before = self.histories.len() + self.blocks.len();
        self.histories.retain(|_, history| history.is_live(now));
        self.blocks.retain(|_, expires_at| *expires_at > now);
        let removed = before.saturating_sub(self.histories.len() + self.blocks.len());
        if removed > 0 {
            debug!(removed, "Swept expired rate limit state");
        }
        removed
    }

    /// Sweep if the last sweep is older than [`SWEEP_INTERVAL_SECS`]. Callers
    /// that lose the race for the schedule skip the sweep.
    fn maybe_cleanup(&self, now: f64) {
        let due = match self.next_sweep.try_lock() {
            Some(mut next) if now >= *next => {
                *next = now + SWEEP_INTERVAL_SECS;
                true
            }
            _ => false,
        };
        if due {
            self.cleanup();
        }
    }

    fn block_ttl(&self, block_key: &str, now: f64) -> Option<f64> {
        self.blocks.remove_if(block_key, |_, expires_at| *expires_at <= now);
        self.blocks.get(block_key).map(|expires_at| *expires_at - now)
    }

    /// Read phase of record: the version seen and the timestamp the trim
    /// would evict. Expired history is left for `commit` to reset.
    fn snapshot(&self, list_key: &str, trim_len: usize) -> (Option<u64>, Option<f64>) {
        match self.histories.get(list_key) {
            Some(history) => (
                Some(history.version),
                history.recent.get(trim_len - 1).copied(),
            ),
            None => (None, None),
        }
    }

    /// Write phase of record. Returns `false` if the history changed since
    /// `seen_version` was read.
    fn commit(
        &self,
        list_key: &str,
        seen_version: Option<u64>,
        evicted: Option<f64>,
        trim_len: usize,
        now: f64,
        ttl: f64,
    ) -> bool {
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entry = self
            .histories
            .entry(list_key.to_string())
            .or_insert_with(|| CallHistory {
                version,
                recent: VecDeque::new(),
                ordered: Vec::new(),
                expires_at: f64::NEG_INFINITY,
            });
        let history = entry.value_mut();

        let current = (history.version != version).then_some(history.version);
        if current != seen_version {
            return false;
        }
        if !history.is_live(now) {
            history.recent.clear();
            history.ordered.clear();
        } else if let Some(evicted) = evicted {
            let at = history.ordered.partition_point(|t| *t < evicted);
            if history.ordered.get(at) == Some(&evicted) {
                history.ordered.remove(at);
            }
        }

        history.recent.push_front(now);
        history.recent.truncate(trim_len);
        let at = history.ordered.partition_point(|t| *t <= now);
        history.ordered.insert(at, now);

        history.version = version;
        history.expires_at = now + ttl;
        true
    }

    /// The record retry loop. `before_commit` runs between the read and the
    /// write of every attempt.
    fn record_with(
        &self,
        key: &str,
        trim_len: usize,
        ttl: f64,
        mut before_commit: impl FnMut(),
    ) -> Result<()> {
        let keys = self.prefix.keys(key);

        for attempt in 1..=MAX_RECORD_ATTEMPTS {
            let (version, evicted) = self.snapshot(&keys.list, trim_len);
            before_commit();
            let now = self.clock.now();
            if self.commit(&keys.list, version, evicted, trim_len, now, ttl) {
                self.maybe_cleanup(now);
                return Ok(());
            }
            debug!(key = %key, attempt, "Call history changed during record, retrying");
        }

        Err(WindowguardError::LockingFailure {
            key: key.to_string(),
            attempts: MAX_RECORD_ATTEMPTS,
        })
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterBackend for InMemoryBackend {
    async fn evaluate(&self, key: &str, rules: &RuleSet) -> Result<Evaluation> {
        let keys = self.prefix.keys(key);
        let now = self.clock.now();

        if let Some(ttl) = self.block_ttl(&keys.block, now) {
            return Ok(backend::blocked(Some(ttl)));
        }
        if rules.is_empty() {
            return Ok(Evaluation::allowed());
        }

        let history = self.histories.get(&keys.list).filter(|h| h.is_live(now));
        let nth_recent: Vec<Option<f64>> = rules
            .iter()
            .map(|rule| {
                let n = (rule.max_calls as usize).saturating_sub(1);
                history.as_ref().and_then(|h| h.recent.get(n).copied())
            })
            .collect();
        drop(history);

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
        self.record_with(key, max_calls as usize, max_window as f64, || {})
    }

    async fn quota_left(&self, key: &str, window_secs: u64, max_calls: u32) -> Result<QuotaLeft> {
        let keys = self.prefix.keys(key);
        let now = self.clock.now();
        let boundary = now - window_secs as f64;

        let (count, oldest) = match self.histories.get(&keys.list).filter(|h| h.is_live(now)) {
            Some(history) => {
                let start = history.ordered.partition_point(|t| *t < boundary);
                let end = history.ordered.partition_point(|t| *t <= now);
                let counted = &history.ordered[start..end.max(start)];
                (counted.len() as u64, counted.first().copied())
            }
            None => (0, None),
        };

        Ok(backend::quota(window_secs, max_calls, now, count, oldest))
    }

    async fn block(&self, key: &str, seconds: u64) -> Result<()> {
        if seconds == 0 {
            return Err(WindowguardError::InvalidArgument(
                "block duration must be greater than zero".to_string(),
            ));
        }
        let keys = self.prefix.keys(key);
        let expires_at = self.clock.now() + seconds as f64;
        self.blocks.insert(keys.block, expires_at);

        info!(key = %key, seconds, "Blocked entity");
        Ok(())
    }

    async fn unblock(&self, key: &str) -> Result<()> {
        let keys = self.prefix.keys(key);
        self.blocks.remove(&keys.block);

        info!(key = %key, "Unblocked entity");
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let keys = self.prefix.keys(key);
        self.histories.remove(&keys.list);
        self.blocks.remove(&keys.block);

        info!(key = %key, "Cleared call history");
        Ok(())
    }
}
