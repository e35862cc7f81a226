//! Confirmation deadlines of dispatched tasks.
//!
//! Deadlines live in one sorted set scored by whole Unix seconds. Equal
//! scores are ordered by member, so expiry order within a second is by task
//! id text.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use taskrelay_core::TaskId;
use taskrelay_infra::ResilientStoreClient;
use taskrelay_observability::{Counter, Gauge, MetricsSink, Outcome};

use crate::error::LifecycleResult;

/// Sorted set holding the deadlines.
pub const TIMEOUTS_KEY: &str = "dispatched_timeouts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeoutStats {
    /// Deadlines currently tracked
    pub tracked: u64,
    /// Tracked deadlines at or before the reference time
    pub expired: u64,
}

#[derive(Debug, Clone)]
pub struct ExpirationTracker {
    client: ResilientStoreClient,
    ttl: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl ExpirationTracker {
    pub fn new(client: ResilientStoreClient, ttl: Duration, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            client,
            ttl,
            metrics,
        }
    }

    /// Track a deadline `timeout` from now. Returns the deadline as stored
    /// (truncated to whole seconds).
    pub async fn add_deadline(
        &self,
        task_id: TaskId,
        timeout: Duration,
    ) -> LifecycleResult<DateTime<Utc>> {
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| Utc::now().checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.add_deadline_at(task_id, deadline).await
    }

    /// Track an explicit deadline, replacing any previous one for the task.
    pub async fn add_deadline_at(
        &self,
        task_id: TaskId,
        deadline: DateTime<Utc>,
    ) -> LifecycleResult<DateTime<Utc>> {
        let score = deadline.timestamp();
        let result = self
            .client
            .zadd(TIMEOUTS_KEY, &task_id.to_string(), score as f64)
            .await;
        self.metrics
            .increment(Counter::TimeoutOperations, "add", Outcome::from_result(&result));
        result?;

        if let Err(e) = self.client.expire(TIMEOUTS_KEY, self.ttl).await {
            warn!(task_id = %task_id, error = %e, "failed to refresh timeout set TTL");
        }
        debug!(task_id = %task_id, deadline = score, "deadline tracked");
        Ok(from_score(score as f64).unwrap_or(deadline))
    }

    /// Tasks whose deadline is at or before `now`.
    pub async fn get_expired(&self, now: DateTime<Utc>) -> LifecycleResult<Vec<TaskId>> {
        let result = self
            .client
            .zrange_by_score(TIMEOUTS_KEY, 0.0, now.timestamp() as f64)
            .await;
        let outcome = match &result {
            Ok(members) if members.is_empty() => Outcome::Empty,
            Ok(_) => Outcome::Success,
            Err(_) => Outcome::Failure,
        };
        self.metrics
            .increment(Counter::TimeoutOperations, "get_expired", outcome);

        let ids = result?
            .into_iter()
            .filter_map(|member| match member.parse::<TaskId>() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(member = %member, error = %e, "skipping malformed timeout member");
                    None
                }
            })
            .collect();
        Ok(ids)
    }

    pub async fn remove_deadline(&self, task_id: TaskId) -> LifecycleResult<bool> {
        let result = self.client.zrem(TIMEOUTS_KEY, &task_id.to_string()).await;
        self.metrics
            .increment(Counter::TimeoutOperations, "remove", Outcome::from_result(&result));
        Ok(result?)
    }

    /// Remove many deadlines in one round trip. Returns how many existed.
    pub async fn remove_deadlines(&self, task_ids: &[TaskId]) -> LifecycleResult<usize> {
        if task_ids.is_empty() {
            return Ok(0);
        }
        let members: Vec<String> = task_ids.iter().map(TaskId::to_string).collect();
        let result = self.client.zrem_many(TIMEOUTS_KEY, &members).await;
        self.metrics
            .increment(Counter::TimeoutOperations, "remove", Outcome::from_result(&result));
        Ok(usize::try_from(result?).unwrap_or(usize::MAX))
    }

    pub async fn deadline_of(&self, task_id: TaskId) -> LifecycleResult<Option<DateTime<Utc>>> {
        let score = self.client.zscore(TIMEOUTS_KEY, &task_id.to_string()).await?;
        Ok(score.and_then(from_score))
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> LifecycleResult<TimeoutStats> {
        let tracked = self.client.zcard(TIMEOUTS_KEY).await?;
        let expired = self
            .client
            .zcount(TIMEOUTS_KEY, 0.0, now.timestamp() as f64)
            .await?;
        self.metrics
            .gauge(Gauge::TrackedTimeouts, TIMEOUTS_KEY, tracked as f64);
        Ok(TimeoutStats { tracked, expired })
    }
}

fn from_score(score: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(score as i64, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use taskrelay_infra::{ClientConfig, InMemoryBackend, RecoveryConfig};
    use taskrelay_observability::NoopMetrics;

    async fn tracker() -> ExpirationTracker {
        let backend = Arc::new(InMemoryBackend::new());
        let config = ClientConfig::default().with_recovery(RecoveryConfig::disabled());
        let client = ResilientStoreClient::connect(backend, config).await.unwrap();
        ExpirationTracker::new(client, Duration::from_secs(7200), Arc::new(NoopMetrics))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn expired_includes_deadline_equal_to_now() {
        let tracker = tracker().await;
        tracker.add_deadline_at(TaskId::new(1), at(1_000)).await.unwrap();
        tracker.add_deadline_at(TaskId::new(2), at(1_001)).await.unwrap();

        assert_eq!(tracker.get_expired(at(999)).await.unwrap(), vec![]);
        assert_eq!(tracker.get_expired(at(1_000)).await.unwrap(), vec![TaskId::new(1)]);
        assert_eq!(
            tracker.get_expired(at(5_000)).await.unwrap(),
            vec![TaskId::new(1), TaskId::new(2)]
        );
    }

    #[tokio::test]
    async fn add_deadline_is_relative_to_now() {
        let tracker = tracker().await;
        let before = Utc::now().timestamp();
        let deadline = tracker
            .add_deadline(TaskId::new(42), Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(deadline.timestamp() >= before + 3600);
        assert!(deadline.timestamp() <= Utc::now().timestamp() + 3600);
        assert_eq!(tracker.deadline_of(TaskId::new(42)).await.unwrap(), Some(deadline));
        assert!(tracker.get_expired(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_removal_reports_existing_members() {
        let tracker = tracker().await;
        for id in 1..=3 {
            tracker.add_deadline_at(TaskId::new(id), at(100)).await.unwrap();
        }

        let removed = tracker
            .remove_deadlines(&[TaskId::new(1), TaskId::new(3), TaskId::new(99)])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(tracker.remove_deadlines(&[]).await.unwrap(), 0);
        assert!(tracker.remove_deadline(TaskId::new(2)).await.unwrap());
        assert!(!tracker.remove_deadline(TaskId::new(2)).await.unwrap());
    }

    #[tokio::test]
    async fn stats_count_tracked_and_expired() {
        let tracker = tracker().await;
        tracker.add_deadline_at(TaskId::new(1), at(10)).await.unwrap();
        tracker.add_deadline_at(TaskId::new(2), at(20)).await.unwrap();
        tracker.add_deadline_at(TaskId::new(3), at(30)).await.unwrap();

        assert_eq!(
            tracker.stats(at(20)).await.unwrap(),
            TimeoutStats {
                tracked: 3,
                expired: 2
            }
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn expired_set_matches_deadlines(
            deadlines in proptest::collection::btree_map(1i64..500, 0i64..1_000, 0..40),
            removed in proptest::collection::vec(1i64..500, 0..10),
            now in 0i64..1_000,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            runtime.block_on(async {
                let tracker = tracker().await;
                for (id, deadline) in &deadlines {
                    tracker.add_deadline_at(TaskId::new(*id), at(*deadline)).await.unwrap();
                }
                let removed: Vec<TaskId> = removed.iter().copied().map(TaskId::new).collect();
                tracker.remove_deadlines(&removed).await.unwrap();

                let mut expired = tracker.get_expired(at(now)).await.unwrap();
                expired.sort();
                let expected: Vec<TaskId> = deadlines
                    .iter()
                    .filter(|(id, deadline)| **deadline <= now && !removed.contains(&TaskId::new(**id)))
                    .map(|(id, _)| TaskId::new(*id))
                    .collect();
                prop_assert_eq!(expired, expected);
                Ok(())
            })?;
        }
    }
}
