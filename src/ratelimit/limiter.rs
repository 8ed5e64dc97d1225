//! Core rate limiter: binds entities to a storage backend.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::backend::{RateLimiterBackend, FALLBACK_WAIT_SECS};
use super::entity::RateLimitedEntity;
use super::rules::RuleSet;
use super::verdict::{QuotaLeft, Verdict};
use crate::error::{Result, WindowguardError};
use crate::metrics::{MetricsSink, NoopMetrics};

/// Evaluates entities against their rules using a shared backend.
///
/// This struct holds no per-entity state and can be shared across tasks.
#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn RateLimiterBackend>,
    metrics: Arc<dyn MetricsSink>,
}

impl RateLimiter {
    /// Create a rate limiter over `backend` that drops metrics events.
    pub fn new(backend: Arc<dyn RateLimiterBackend>) -> Self {
        Self {
            backend,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Send denial counters to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Check the entity's limits and, if allowed, record the call.
    ///
    /// Denials are not recorded. If the record step cannot get through
    /// concurrent writers the call is denied rather than let through
    /// uncounted. The returned verdict has `remaining == 0`; use
    /// [`RateLimiter::enforce`] for quota metadata.
    pub async fn check_and_record<E>(&self, entity: &E) -> Result<Verdict>
    where
        E: RateLimitedEntity + ?Sized,
    {
        let key = entity.key();
        let rules = entity.rules()?;
        self.check_and_record_key(&key, &rules).await
    }

    /// Like [`RateLimiter::check_and_record`], but a denial is returned as
    /// [`WindowguardError::RateLimited`] and an allowed verdict carries the
    /// remaining quota of the widest window.
    pub async fn enforce<E>(&self, entity: &E) -> Result<Verdict>
    where
        E: RateLimitedEntity + ?Sized,
    {
        let key = entity.key();
        let rules = entity.rules()?;

        let verdict = self.check_and_record_key(&key, &rules).await?;
        if verdict.denied {
            return Err(WindowguardError::RateLimited {
                wait_seconds: verdict.wait_seconds,
            });
        }

        let quota = self.quota_for_rules(&key, &rules).await?;
        Ok(Verdict::allowed(quota.remaining, quota.reset_in))
    }

    /// Remaining quota in the entity's widest window.
    pub async fn quota_left<E>(&self, entity: &E) -> Result<QuotaLeft>
    where
        E: RateLimitedEntity + ?Sized,
    {
        let key = entity.key();
        let rules = entity.rules()?;
        self.quota_for_rules(&key, &rules).await
    }

    /// Deny every call of the entity for `seconds` seconds.
    pub async fn block<E>(&self, entity: &E, seconds: u64) -> Result<()>
    where
        E: RateLimitedEntity + ?Sized,
    {
        self.backend.block(&entity.key(), seconds).await
    }

    /// Remove a block placed with [`RateLimiter::block`].
    pub async fn unblock<E>(&self, entity: &E) -> Result<()>
    where
        E: RateLimitedEntity + ?Sized,
    {
        self.backend.unblock(&entity.key()).await
    }

    /// Forget the entity's call history and block.
    pub async fn clear_history<E>(&self, entity: &E) -> Result<()>
    where
        E: RateLimitedEntity + ?Sized,
    {
        self.backend.clear(&entity.key()).await
    }

    async fn check_and_record_key(&self, key: &str, rules: &RuleSet) -> Result<Verdict> {
        trace!(key = %key, rules = rules.len(), "Checking rate limit");

        let evaluation = self.backend.evaluate(key, rules).await?;
        if evaluation.denied {
            debug!(key = %key, wait_seconds = evaluation.wait_seconds, "Rate limit exceeded");
            self.count_denial(key);
            return Ok(Verdict::denied(evaluation.wait_seconds));
        }

        match self
            .backend
            .record(key, rules, rules.max_calls(), rules.max_window())
            .await
        {
            Ok(()) => Ok(Verdict::allowed(0, 0.0)),
            Err(WindowguardError::LockingFailure { attempts, .. }) => {
                warn!(key = %key, attempts, "Deadlock trying to record rate limited call");
                self.count_denial(key);
                Ok(Verdict::denied(FALLBACK_WAIT_SECS))
            }
            Err(e) => Err(e),
        }
    }

    async fn quota_for_rules(&self, key: &str, rules: &RuleSet) -> Result<QuotaLeft> {
        match rules.widest() {
            Some(rule) => {
                self.backend
                    .quota_left(key, rule.window_secs, rule.max_calls)
                    .await
            }
            None => Ok(QuotaLeft {
                remaining: u32::MAX,
                reset_in: 0.0,
            }),
        }
    }

    fn count_denial(&self, key: &str) {
        self.metrics.incr_counter(&format!("ratelimiter.limited.{}", key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::entity::{RateLimitedSubject, RateLimitedUser};
    use crate::ratelimit::memory::InMemoryBackend;
    use crate::ratelimit::rules::{RuleTable, DEFAULT_USER_DOMAIN};
    use crate::ratelimit::verdict::Evaluation;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct RecordingMetrics {
        counters: Mutex<Vec<String>>,
    }

    impl MetricsSink for RecordingMetrics {
        fn incr_counter(&self, name: &str) {
            self.counters.lock().push(name.to_string());
        }
    }

    /// Backend whose history is always contended.
    struct ContendedBackend;

    #[async_trait]
    impl RateLimiterBackend for ContendedBackend {
        async fn evaluate(&self, _key: &str, _rules: &RuleSet) -> Result<Evaluation> {
            Ok(Evaluation::allowed())
        }

        async fn record(&self, key: &str, _: &RuleSet, _: u32, _: u64) -> Result<()> {
            Err(WindowguardError::LockingFailure {
                key: key.to_string(),
                attempts: 10,
            })
        }

        async fn quota_left(&self, _: &str, _: u64, max_calls: u32) -> Result<QuotaLeft> {
            Ok(QuotaLeft {
                remaining: max_calls,
                reset_in: 0.0,
            })
        }

        async fn block(&self, _: &str, _: u64) -> Result<()> {
            Ok(())
        }

        async fn unblock(&self, _: &str) -> Result<()> {
            Ok(())
        }

        async fn clear(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        table: Arc<RuleTable>,
        limiter: RateLimiter,
        metrics: Arc<RecordingMetrics>,
    }

    fn harness(pairs: &[(u64, u32)]) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000_000.0));
        let table = Arc::new(RuleTable::new());
        table.set_rules(DEFAULT_USER_DOMAIN, RuleSet::from_pairs(pairs).unwrap());
        let metrics = Arc::new(RecordingMetrics::default());
        let backend = Arc::new(InMemoryBackend::with_clock(clock.clone()));
        let limiter = RateLimiter::new(backend).with_metrics(metrics.clone());
        Harness {
            clock,
            table,
            limiter,
            metrics,
        }
    }

    #[tokio::test]
    async fn test_ten_per_minute() {
        let h = harness(&[(60, 10)]);
        let user = RateLimitedUser::new(1, h.table.clone());

        for i in 0..10 {
            let verdict = h.limiter.check_and_record(&user).await.unwrap();
            assert!(!verdict.denied, "call {} should be allowed", i + 1);
            h.clock.advance(1.0);
        }

        let verdict = h.limiter.check_and_record(&user).await.unwrap();
        assert!(verdict.denied);
        assert_eq!(verdict.remaining, 0);
        assert!(verdict.wait_seconds > 0.0 && verdict.wait_seconds <= 60.0);
    }

    #[tokio::test]
    async fn test_quota_recovers_after_window() {
        let h = harness(&[(60, 10)]);
        let user = RateLimitedUser::new(1, h.table.clone());

        for _ in 0..10 {
            h.limiter.check_and_record(&user).await.unwrap();
        }
        assert_eq!(h.limiter.quota_left(&user).await.unwrap().remaining, 0);

        h.clock.advance(61.0);
        let quota = h.limiter.quota_left(&user).await.unwrap();
        assert_eq!(quota, QuotaLeft { remaining: 10, reset_in: 0.0 });
        assert!(!h.limiter.check_and_record(&user).await.unwrap().denied);
    }

    #[tokio::test]
    async fn test_finer_rule_denies_first() {
        let h = harness(&[(1, 2), (60, 10)]);
        let user = RateLimitedUser::new(1, h.table.clone());

        assert!(!h.limiter.check_and_record(&user).await.unwrap().denied);
        h.clock.advance(0.2);
        assert!(!h.limiter.check_and_record(&user).await.unwrap().denied);
        h.clock.advance(0.2);

        let verdict = h.limiter.check_and_record(&user).await.unwrap();
        assert!(verdict.denied);
        assert!((verdict.wait_seconds - 0.6).abs() < 1e-6);

        // The minute budget is nowhere near spent.
        assert_eq!(h.limiter.quota_left(&user).await.unwrap().remaining, 8);
    }

    #[tokio::test]
    async fn test_two_per_minute_scenario() {
        let h = harness(&[(60, 2)]);
        let user = RateLimitedUser::new(1, h.table.clone());
        let start = 1_000_000.0;

        let verdict = assert_ok!(h.limiter.enforce(&user).await);
        assert_eq!(verdict.remaining, 1);

        h.clock.set(start + 1.0);
        let verdict = assert_ok!(h.limiter.enforce(&user).await);
        assert_eq!(verdict.remaining, 0);

        h.clock.set(start + 2.0);
        let err = assert_err!(h.limiter.enforce(&user).await);
        match err {
            WindowguardError::RateLimited { wait_seconds } => {
                assert!((wait_seconds - 58.0).abs() < 1e-6);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
        assert_eq!(err_retry_after(&h, &user).await, Some(58));

        // The t=0 call has aged out; the t=1 call is still inside [1, 61].
        h.clock.set(start + 61.0);
        let verdict = assert_ok!(h.limiter.enforce(&user).await);
        assert_eq!(verdict.remaining, 0);

        h.clock.set(start + 62.0);
        let quota = h.limiter.quota_left(&user).await.unwrap();
        assert_eq!(quota.remaining, 1);
    }

    async fn err_retry_after(h: &Harness, user: &RateLimitedUser) -> Option<u64> {
        h.limiter
            .enforce(user)
            .await
            .err()
            .and_then(|e| e.retry_after_secs())
    }

    #[tokio::test]
    async fn test_denied_calls_are_not_recorded() {
        let h = harness(&[(60, 2)]);
        let user = RateLimitedUser::new(1, h.table.clone());

        for _ in 0..5 {
            h.limiter.check_and_record(&user).await.unwrap();
        }
        let quota = h.limiter.quota_left(&user).await.unwrap();
        assert_eq!(quota.remaining, 0);

        // Only the two allowed calls are in history, so both age out together.
        h.clock.advance(60.5);
        assert_eq!(h.limiter.quota_left(&user).await.unwrap().remaining, 2);
    }

    #[tokio::test]
    async fn test_block_and_unblock() {
        let h = harness(&[(60, 100)]);
        let user = RateLimitedUser::new(1, h.table.clone());

        h.limiter.block(&user, 30).await.unwrap();
        for _ in 0..3 {
            let verdict = h.limiter.check_and_record(&user).await.unwrap();
            assert!(verdict.denied);
            assert!(verdict.wait_seconds > 0.0 && verdict.wait_seconds <= 30.0);
            h.clock.advance(5.0);
        }

        h.limiter.unblock(&user).await.unwrap();
        assert!(!h.limiter.check_and_record(&user).await.unwrap().denied);
    }

    #[tokio::test]
    async fn test_clear_history_resets_quota() {
        let h = harness(&[(60, 5)]);
        let user = RateLimitedUser::new(1, h.table.clone());

        for _ in 0..5 {
            h.limiter.check_and_record(&user).await.unwrap();
        }
        assert!(h.limiter.check_and_record(&user).await.unwrap().denied);

        h.limiter.clear_history(&user).await.unwrap();
        let quota = h.limiter.quota_left(&user).await.unwrap();
        assert_eq!(quota, QuotaLeft { remaining: 5, reset_in: 0.0 });
    }

    #[tokio::test]
    async fn test_entities_do_not_share_history() {
        let h = harness(&[(60, 1)]);
        h.table
            .set_rules("email_mirror_by_realm", RuleSet::from_pairs(&[(60, 1)]).unwrap());
        let alice = RateLimitedUser::new(1, h.table.clone());
        let bob = RateLimitedUser::new(2, h.table.clone());
        let realm = RateLimitedSubject::new(
            "RateLimitedRealm",
            "1",
            "email_mirror_by_realm",
            h.table.clone(),
        );

        assert!(!h.limiter.check_and_record(&alice).await.unwrap().denied);
        assert!(h.limiter.check_and_record(&alice).await.unwrap().denied);
        assert!(!h.limiter.check_and_record(&bob).await.unwrap().denied);
        assert!(!h.limiter.check_and_record(&realm).await.unwrap().denied);
    }

    #[tokio::test]
    async fn test_rule_mutation_applies_to_next_check() {
        let h = harness(&[(60, 10)]);
        let user = RateLimitedUser::new(1, h.table.clone());

        h.limiter.check_and_record(&user).await.unwrap();
        h.limiter.check_and_record(&user).await.unwrap();

        h.table.add_rule(DEFAULT_USER_DOMAIN, 10, 2).unwrap();
        assert!(h.limiter.check_and_record(&user).await.unwrap().denied);

        h.table.remove_rule(DEFAULT_USER_DOMAIN, 10, 2);
        assert!(!h.limiter.check_and_record(&user).await.unwrap().denied);
    }

    #[tokio::test]
    async fn test_custom_rules_override_domain() {
        let h = harness(&[(60, 100)]);
        let user = RateLimitedUser::new(1, h.table.clone()).with_custom_rules("60:1");

        assert!(!h.limiter.check_and_record(&user).await.unwrap().denied);
        assert!(h.limiter.check_and_record(&user).await.unwrap().denied);
    }

    #[tokio::test]
    async fn test_bad_custom_rules_fail_before_store() {
        let h = harness(&[(60, 100)]);
        let user = RateLimitedUser::new(1, h.table.clone()).with_custom_rules("60:ten");

        let result = h.limiter.check_and_record(&user).await;
        assert!(matches!(result, Err(WindowguardError::InvalidRule(_))));
        assert!(h.metrics.counters.lock().is_empty());
    }

    #[tokio::test]
    async fn test_denials_emit_counter() {
        let h = harness(&[(60, 1)]);
        let user = RateLimitedUser::new(9, h.table.clone());

        h.limiter.check_and_record(&user).await.unwrap();
        h.limiter.check_and_record(&user).await.unwrap();
        h.limiter.check_and_record(&user).await.unwrap();

        let counters = h.metrics.counters.lock().clone();
        assert_eq!(
            counters,
            vec![
                "ratelimiter.limited.RateLimitedUser:9:api_by_user".to_string(),
                "ratelimiter.limited.RateLimitedUser:9:api_by_user".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_locking_failure_fails_closed() {
        let table = Arc::new(RuleTable::new());
        table.set_rules(DEFAULT_USER_DOMAIN, RuleSet::from_pairs(&[(60, 10)]).unwrap());
        let metrics = Arc::new(RecordingMetrics::default());
        let limiter = RateLimiter::new(Arc::new(ContendedBackend)).with_metrics(metrics.clone());
        let user = RateLimitedUser::new(3, table);

        let verdict = limiter.check_and_record(&user).await.unwrap();
        assert!(verdict.denied);
        assert_eq!(verdict.remaining, 0);
        assert!(verdict.wait_seconds > 0.0);
        assert_eq!(metrics.counters.lock().len(), 1);

        let err = assert_err!(limiter.enforce(&user).await);
        assert!(matches!(err, WindowguardError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_empty_rules_are_unlimited() {
        let h = harness(&[(60, 1)]);
        h.table.remove_rule(DEFAULT_USER_DOMAIN, 60, 1);
        let user = RateLimitedUser::new(1, h.table.clone());

        for _ in 0..20 {
            let verdict = assert_ok!(h.limiter.enforce(&user).await);
            assert_eq!(verdict.remaining, u32::MAX);
        }
    }

    #[tokio::test]
    async fn test_limiter_works_through_trait_objects() {
        let h = harness(&[(60, 1)]);
        let entities: Vec<Box<dyn RateLimitedEntity>> = vec![
            Box::new(RateLimitedUser::new(1, h.table.clone())),
            Box::new(RateLimitedUser::new(2, h.table.clone())),
        ];

        for entity in &entities {
            assert!(!h.limiter.check_and_record(entity.as_ref()).await.unwrap().denied);
        }
        for entity in &entities {
            assert!(h.limiter.check_and_record(entity.as_ref()).await.unwrap().denied);
        }
    }
}
