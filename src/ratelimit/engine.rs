//! The rate limiting decision engine.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::counter::CounterStore;
use super::decision::{Decision, UsageSnapshot};
use super::events::{EventNotifier, RateLimitEvent};
use super::policy::{Policy, PolicyPage, PolicySort, PolicyStore, Upserted};
use crate::error::{Result, ValidationError};

/// Longest accepted API key, in characters.
pub const MAX_API_KEY_LEN: usize = 255;

/// Caller context reported on exceedance when none is supplied.
pub const UNKNOWN_CALLER: &str = "unknown";

/// Orchestrates policy lookups, window counting and event publishing.
///
/// The engine holds no state of its own. Every per-key mutation goes through
/// one of the injected stores, which are responsible for making their
/// single-key operations atomic. The two stores are never updated in a
/// shared transaction: a check racing a policy change may briefly see the
/// old policy against a freshly reset counter, or the reverse.
///
/// Event publishing never changes the outcome of an operation. A failed
/// publish is logged and dropped.
#[derive(Debug, Clone)]
pub struct RateLimiterEngine {
    /// Durable key → policy mapping
    policies: Arc<dyn PolicyStore>,
    /// Volatile window counters
    counters: Arc<dyn CounterStore>,
    /// Event sink
    notifier: Arc<dyn EventNotifier>,
}

impl RateLimiterEngine {
    /// Create an engine over the given stores and event sink.
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        counters: Arc<dyn CounterStore>,
        notifier: Arc<dyn EventNotifier>,
    ) -> Self {
        Self {
            policies,
            counters,
            notifier,
        }
    }

    /// Check a policy definition, reporting every bad field at once.
    pub fn validate(
        api_key: &str,
        limit: u32,
        window_seconds: u32,
    ) -> std::result::Result<(), ValidationError> {
        let mut errors = ValidationError::default();

        if api_key.trim().is_empty() {
            errors.push("api_key", "must not be blank");
        } else if api_key.chars().count() > MAX_API_KEY_LEN {
            errors.push(
                "api_key",
                format!("must not exceed {MAX_API_KEY_LEN} characters"),
            );
        }
        if limit < 1 {
            errors.push("limit", "must be at least 1");
        }
        if window_seconds < 1 {
            errors.push("window_seconds", "must be at least 1");
        }

        errors.into_result()
    }

    /// Create the key's policy or replace its limit and window.
    ///
    /// Any open window for the key is discarded, even when the new values
    /// equal the old ones; the next check starts a fresh window under the
    /// new limit.
    pub async fn create_or_update(
        &self,
        api_key: &str,
        limit: u32,
        window_seconds: u32,
    ) -> Result<Upserted> {
        Self::validate(api_key, limit, window_seconds)?;

        let upserted = self.policies.upsert(api_key, limit, window_seconds).await?;

        match self.counters.delete(api_key).await {
            Ok(cleared) => trace!(api_key = %api_key, cleared = cleared, "Reset counter window"),
            Err(e) => warn!(
                api_key = %api_key,
                error = %e,
                "Failed to reset counter window, it will expire on its own"
            ),
        }

        let event = if upserted.created {
            info!(
                api_key = %api_key,
                limit = limit,
                window_seconds = window_seconds,
                "Created rate limit"
            );
            RateLimitEvent::policy_created(&upserted.policy)
        } else {
            info!(
                api_key = %api_key,
                limit = limit,
                window_seconds = window_seconds,
                "Updated rate limit"
            );
            RateLimitEvent::policy_updated(&upserted.policy)
        };
        self.notify(event).await;

        Ok(upserted)
    }

    /// Count one request against the key's window and decide admission.
    pub async fn check(&self, api_key: &str) -> Result<Decision> {
        self.check_with_context(api_key, UNKNOWN_CALLER).await
    }

    /// Like [`check`](Self::check), reporting `caller_context` (for example
    /// the client address) if the request is rejected.
    ///
    /// Every call on a key with a policy consumes one slot, including calls
    /// that end up rejected. The request that takes the count from `limit`
    /// to `limit + 1` is the first one rejected.
    pub async fn check_with_context(
        &self,
        api_key: &str,
        caller_context: &str,
    ) -> Result<Decision> {
        trace!(api_key = %api_key, "Checking rate limit");

        let Some(policy) = self.policies.get(api_key).await? else {
            debug!(api_key = %api_key, "No rate limit configured");
            return Ok(Decision::policy_not_found(api_key));
        };

        let count = self.counters.increment(api_key, policy.window_seconds).await?;

        if count > u64::from(policy.limit) {
            warn!(
                api_key = %api_key,
                count = count,
                limit = policy.limit,
                "Rate limit exceeded"
            );
            self.notify(RateLimitEvent::limit_exceeded(
                api_key,
                count,
                policy.limit,
                caller_context,
            ))
            .await;
            return Ok(Decision::exceeded(&policy, count));
        }

        let ttl = self.window_ttl(api_key).await;
        let decision = Decision::allowed(&policy, count, ttl);
        debug!(
            api_key = %api_key,
            count = count,
            remaining = decision.remaining_quota,
            "Request allowed"
        );
        Ok(decision)
    }

    /// Current usage of the key's window without consuming quota.
    ///
    /// Returns `None` when the key has no policy.
    pub async fn usage(&self, api_key: &str) -> Result<Option<UsageSnapshot>> {
        let Some(policy) = self.policies.get(api_key).await? else {
            debug!(api_key = %api_key, "No rate limit configured");
            return Ok(None);
        };

        let current = self.counters.current_count(api_key).await;
        let ttl = self.window_ttl(api_key).await;

        Ok(Some(UsageSnapshot::new(&policy, current, ttl)))
    }

    /// Remove the key's policy and its counter.
    ///
    /// Returns false, changing nothing, when the key had no policy. A
    /// counter that cannot be removed is left to expire.
    pub async fn delete(&self, api_key: &str) -> Result<bool> {
        let Some(removed) = self.policies.remove(api_key).await? else {
            debug!(api_key = %api_key, "No rate limit to delete");
            return Ok(false);
        };

        if let Err(e) = self.counters.delete(api_key).await {
            warn!(
                api_key = %api_key,
                error = %e,
                "Failed to clear counter for deleted rate limit, it will expire on its own"
            );
        }

        info!(api_key = %api_key, "Deleted rate limit");
        self.notify(RateLimitEvent::policy_deleted(api_key, Some(&removed)))
            .await;

        Ok(true)
    }

    /// One page of configured policies.
    pub async fn list(
        &self,
        offset: u64,
        page_size: u32,
        sort: PolicySort,
    ) -> Result<PolicyPage> {
        Ok(self.policies.list(offset, page_size, sort).await?)
    }

    /// The key's policy, if any.
    pub async fn get_policy(&self, api_key: &str) -> Result<Option<Policy>> {
        Ok(self.policies.get(api_key).await?)
    }

    /// Whether the key has a policy.
    pub async fn exists(&self, api_key: &str) -> Result<bool> {
        Ok(self.get_policy(api_key).await?.is_some())
    }

    /// Remaining window time, treating a non-positive value as unknown.
    async fn window_ttl(&self, api_key: &str) -> Option<u64> {
        self.counters.remaining_ttl(api_key).await.filter(|ttl| *ttl > 0)
    }

    async fn notify(&self, event: RateLimitEvent) {
        if let Err(e) = self.notifier.publish(&event).await {
            warn!(
                api_key = %event.api_key(),
                tag = event.kind.tag(),
                error = %e,
                "Failed to publish rate limit event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatekeeperError, NotificationError, StoreError};
    use crate::ratelimit::clock::MockClock;
    use crate::ratelimit::counter::InMemoryCounterStore;
    use crate::ratelimit::decision::DecisionReason;
    use crate::ratelimit::events::{EventKind, EventPayload};
    use crate::ratelimit::policy::InMemoryPolicyStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<RateLimitEvent>>,
    }

    impl RecordingNotifier {
        fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().iter().map(|e| e.kind).collect()
        }
    }

    #[async_trait]
    impl EventNotifier for RecordingNotifier {
        async fn publish(
            &self,
            event: &RateLimitEvent,
        ) -> std::result::Result<(), NotificationError> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FailingNotifier;

    #[async_trait]
    impl EventNotifier for FailingNotifier {
        async fn publish(
            &self,
            _event: &RateLimitEvent,
        ) -> std::result::Result<(), NotificationError> {
            Err(NotificationError::Transport("broker unreachable".to_string()))
        }
    }

    /// Counter store whose backend is down.
    #[derive(Debug)]
    struct UnreachableCounterStore;

    #[async_trait]
    impl CounterStore for UnreachableCounterStore {
        async fn increment(
            &self,
            _api_key: &str,
            _window_seconds: u32,
        ) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Unavailable {
                store: "counter store",
                message: "connection refused".to_string(),
            })
        }

        async fn current_count(&self, _api_key: &str) -> u64 {
            0
        }

        async fn remaining_ttl(&self, _api_key: &str) -> Option<u64> {
            None
        }

        async fn delete(&self, _api_key: &str) -> std::result::Result<bool, StoreError> {
            Err(StoreError::Unavailable {
                store: "counter store",
                message: "connection refused".to_string(),
            })
        }
    }

    struct Harness {
        engine: RateLimiterEngine,
        counters: Arc<InMemoryCounterStore>,
        notifier: Arc<RecordingNotifier>,
        clock: MockClock,
    }

    fn harness() -> Harness {
        let clock = MockClock::default();
        let counters = Arc::new(InMemoryCounterStore::with_clock(Arc::new(clock.clone())));
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = RateLimiterEngine::new(
            Arc::new(InMemoryPolicyStore::new()),
            counters.clone(),
            notifier.clone(),
        );
        Harness {
            engine,
            counters,
            notifier,
            clock,
        }
    }

    #[tokio::test]
    async fn test_first_n_checks_allowed_then_exceeded() {
        let h = harness();
        h.engine.create_or_update("k", 5, 60).await.unwrap();

        for i in 1..=5u64 {
            let decision = h.engine.check("k").await.unwrap();
            assert!(decision.allowed, "request {} should be allowed", i);
            assert_eq!(decision.current_usage, i);
            assert_eq!(decision.remaining_quota, 5 - i);
            assert_eq!(decision.limit, Some(5));
        }

        let decision = h.engine.check("k").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::Exceeded);
        assert_eq!(decision.current_usage, 6);
        assert_eq!(decision.remaining_quota, 0);
    }

    #[tokio::test]
    async fn test_walkthrough_example() {
        let h = harness();
        h.engine.create_or_update("k1", 2, 60).await.unwrap();

        let first = h.engine.check("k1").await.unwrap();
        assert!(first.allowed);
        assert_eq!((first.current_usage, first.remaining_quota), (1, 1));

        let second = h.engine.check("k1").await.unwrap();
        assert!(second.allowed);
        assert_eq!((second.current_usage, second.remaining_quota), (2, 0));

        let third = h.engine.check("k1").await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.current_usage, 3);

        let usage = h.engine.usage("k1").await.unwrap().unwrap();
        assert_eq!(usage.current_usage, 3);
        assert_eq!(usage.remaining_quota, 0);

        assert!(h.engine.delete("k1").await.unwrap());
        let after = h.engine.check("k1").await.unwrap();
        assert_eq!(after.reason, DecisionReason::PolicyNotFound);
    }

    #[tokio::test]
    async fn test_check_without_policy_touches_nothing() {
        let h = harness();

        for _ in 0..3 {
            let decision = h.engine.check("nobody").await.unwrap();
            assert!(!decision.allowed);
            assert_eq!(decision.reason, DecisionReason::PolicyNotFound);
            assert_eq!(decision.limit, None);
        }

        assert!(h.counters.is_empty());
        assert!(h.notifier.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_usage_is_read_only() {
        let h = harness();
        h.engine.create_or_update("k", 10, 60).await.unwrap();
        h.engine.check("k").await.unwrap();
        h.engine.check("k").await.unwrap();

        for _ in 0..5 {
            let usage = h.engine.usage("k").await.unwrap().unwrap();
            assert_eq!(usage.current_usage, 2);
            assert_eq!(usage.remaining_quota, 8);
            assert_eq!(usage.window_seconds, 60);
            assert_eq!(usage.window_ttl_seconds, Some(60));
        }

        assert_eq!(h.engine.check("k").await.unwrap().current_usage, 3);
    }

    #[tokio::test]
    async fn test_usage_without_policy_is_none() {
        let h = harness();
        assert_eq!(h.engine.usage("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_usage_before_first_check() {
        let h = harness();
        h.engine.create_or_update("k", 3, 60).await.unwrap();

        let usage = h.engine.usage("k").await.unwrap().unwrap();
        assert_eq!(usage.current_usage, 0);
        assert_eq!(usage.remaining_quota, 3);
        assert_eq!(usage.window_ttl_seconds, None);
    }

    #[tokio::test]
    async fn test_policy_change_resets_window() {
        let h = harness();
        h.engine.create_or_update("k", 10, 60).await.unwrap();
        for _ in 0..4 {
            h.engine.check("k").await.unwrap();
        }

        // Same values still reset the window
        let upserted = h.engine.create_or_update("k", 10, 60).await.unwrap();
        assert!(!upserted.created);
        assert_eq!(h.engine.check("k").await.unwrap().current_usage, 1);

        for _ in 0..4 {
            h.engine.check("k").await.unwrap();
        }
        h.engine.create_or_update("k", 3, 30).await.unwrap();
        let decision = h.engine.check("k").await.unwrap();
        assert_eq!(decision.current_usage, 1);
        assert_eq!(decision.remaining_quota, 2);
        assert_eq!(decision.window_ttl_seconds, Some(30));
    }

    #[tokio::test]
    async fn test_window_expiry_restores_quota() {
        let h = harness();
        h.engine.create_or_update("k", 1, 10).await.unwrap();

        assert!(h.engine.check("k").await.unwrap().allowed);
        assert!(!h.engine.check("k").await.unwrap().allowed);

        h.clock.advance(Duration::from_secs(4));
        assert!(!h.engine.check("k").await.unwrap().allowed);

        h.clock.advance(Duration::from_secs(6));
        let decision = h.engine.check("k").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.current_usage, 1);
        assert_eq!(decision.window_ttl_seconds, Some(10));
    }

    #[tokio::test]
    async fn test_delete() {
        let h = harness();

        assert!(!h.engine.delete("k").await.unwrap());
        assert!(h.notifier.kinds().is_empty());

        h.engine.create_or_update("k", 4, 20).await.unwrap();
        h.engine.check("k").await.unwrap();
        assert!(h.engine.delete("k").await.unwrap());

        assert!(h.counters.is_empty());
        assert!(!h.engine.exists("k").await.unwrap());
        assert_eq!(
            h.engine.check("k").await.unwrap().reason,
            DecisionReason::PolicyNotFound
        );

        let events = h.notifier.events.lock();
        let deleted = events.last().unwrap();
        assert_eq!(deleted.kind, EventKind::PolicyDeleted);
        match &deleted.payload {
            EventPayload::PolicyChange(change) => {
                assert_eq!(change.limit, 4);
                assert_eq!(change.window_seconds, 20);
            }
            EventPayload::LimitExceeded(_) => panic!("expected a policy change"),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_events_in_order() {
        let h = harness();
        h.engine.create_or_update("k", 1, 60).await.unwrap();
        h.engine.create_or_update("k", 1, 60).await.unwrap();
        h.engine.check("k").await.unwrap();
        h.engine.check_with_context("k", "203.0.113.9").await.unwrap();
        h.engine.delete("k").await.unwrap();

        assert_eq!(
            h.notifier.kinds(),
            vec![
                EventKind::PolicyCreated,
                EventKind::PolicyUpdated,
                EventKind::LimitExceeded,
                EventKind::PolicyDeleted,
            ]
        );

        let events = h.notifier.events.lock();
        match &events[2].payload {
            EventPayload::LimitExceeded(exceeded) => {
                assert_eq!(exceeded.current_usage, 2);
                assert_eq!(exceeded.limit, 1);
                assert_eq!(exceeded.caller_context, "203.0.113.9");
            }
            EventPayload::PolicyChange(_) => panic!("expected an exceedance"),
        }
    }

    #[tokio::test]
    async fn test_plain_check_reports_unknown_caller() {
        let h = harness();
        h.engine.create_or_update("k", 1, 60).await.unwrap();
        h.engine.check("k").await.unwrap();
        h.engine.check("k").await.unwrap();

        let events = h.notifier.events.lock();
        match &events.last().unwrap().payload {
            EventPayload::LimitExceeded(exceeded) => {
                assert_eq!(exceeded.caller_context, UNKNOWN_CALLER)
            }
            EventPayload::PolicyChange(_) => panic!("expected an exceedance"),
        }
    }

    #[tokio::test]
    async fn test_validation_rejects_before_store() {
        let h = harness();

        let err = h.engine.create_or_update("  ", 0, 0).await.unwrap_err();
        match err {
            GatekeeperError::Validation(v) => {
                let fields: Vec<&str> = v.fields.iter().map(|f| f.field).collect();
                assert_eq!(fields, vec!["api_key", "limit", "window_seconds"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let long_key = "x".repeat(MAX_API_KEY_LEN + 1);
        assert!(matches!(
            h.engine.create_or_update(&long_key, 1, 1).await,
            Err(GatekeeperError::Validation(_))
        ));

        let max_key = "x".repeat(MAX_API_KEY_LEN);
        assert!(h.engine.create_or_update(&max_key, 1, 1).await.is_ok());

        assert!(!h.engine.exists("  ").await.unwrap());
        assert_eq!(h.notifier.kinds(), vec![EventKind::PolicyCreated]);
    }

    #[tokio::test]
    async fn test_notification_failures_are_absorbed() {
        let counters = Arc::new(InMemoryCounterStore::new());
        let engine = RateLimiterEngine::new(
            Arc::new(InMemoryPolicyStore::new()),
            counters.clone(),
            Arc::new(FailingNotifier),
        );

        let upserted = engine.create_or_update("k", 1, 60).await.unwrap();
        assert!(upserted.created);
        assert!(engine.check("k").await.unwrap().allowed);

        let blocked = engine.check("k").await.unwrap();
        assert_eq!(blocked.reason, DecisionReason::Exceeded);
        assert_eq!(counters.current_count("k").await, 2);

        assert!(engine.delete("k").await.unwrap());
        assert!(!engine.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_counter_store_outage_fails_check() {
        let policies = Arc::new(InMemoryPolicyStore::new());
        let engine = RateLimiterEngine::new(
            policies.clone(),
            Arc::new(UnreachableCounterStore),
            Arc::new(RecordingNotifier::default()),
        );

        // Counter reset failure does not undo the policy write
        engine.create_or_update("k", 5, 60).await.unwrap();
        assert_eq!(policies.len(), 1);

        let err = engine.check("k").await.unwrap_err();
        assert!(matches!(
            err,
            GatekeeperError::StoreUnavailable(StoreError::Unavailable { .. })
        ));

        // Reads degrade instead of failing
        let usage = engine.usage("k").await.unwrap().unwrap();
        assert_eq!(usage.current_usage, 0);
        assert_eq!(usage.window_ttl_seconds, None);

        // The policy stays deleted even though the counter could not be cleared
        assert!(engine.delete("k").await.unwrap());
        assert!(policies.is_empty());
    }

    #[tokio::test]
    async fn test_list_delegates() {
        let h = harness();
        for key in ["a", "b", "c"] {
            h.engine.create_or_update(key, 1, 1).await.unwrap();
        }

        let page = h.engine.list(1, 1, PolicySort::default()).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].api_key, "b");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_checks_admit_exactly_limit() {
        const LIMIT: u32 = 20;
        const CALLS: u64 = 75;

        let counters = Arc::new(InMemoryCounterStore::new());
        let engine = Arc::new(RateLimiterEngine::new(
            Arc::new(InMemoryPolicyStore::new()),
            counters.clone(),
            Arc::new(RecordingNotifier::default()),
        ));
        engine.create_or_update("hot", LIMIT, 60).await.unwrap();

        let handles: Vec<_> = (0..CALLS)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.check("hot").await.unwrap() })
            })
            .collect();

        let decisions: Vec<Decision> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let admitted = decisions.iter().filter(|d| d.allowed).count() as u64;
        let blocked = decisions.iter().filter(|d| !d.allowed).count() as u64;
        assert_eq!(admitted, u64::from(LIMIT));
        assert_eq!(blocked, CALLS - u64::from(LIMIT));

        let mut usages: Vec<u64> = decisions.iter().map(|d| d.current_usage).collect();
        usages.sort_unstable();
        assert_eq!(usages, (1..=CALLS).collect::<Vec<u64>>());
        assert_eq!(counters.current_count("hot").await, CALLS);
    }
}
