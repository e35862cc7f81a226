//! Resilient store client.
//!
//! [`ResilientStoreClient`] wraps a [`StoreBackend`] with:
//! - per-attempt timeouts and retries with exponential backoff + jitter
//!   (transport errors only, see [`StoreError::is_retryable`])
//! - per-operation call metrics and monitoring hooks
//! - a background health loop that reconnects with backoff when the store
//!   stops answering (see [`health`])
//! - distributed locks with per-acquisition tokens (see [`crate::lock`])
//!
//! The client is constructed once and cloned into every component; clones
//! share the same connection, configuration, and health loop.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskrelay_core::EntryId;

use crate::config::{ClientConfig, RecoveryConfig, RetryConfig};
use crate::retry::{RetryError, RetryExecutor};
use crate::store::{
    Fields, GroupCreation, MoveEntry, PendingEntry, PendingSummary, ReadGroupRequest,
    StoreBackend, StoreError, StoreResult, StreamEntry,
};

pub mod health;
pub mod hooks;
pub mod metrics;

pub use health::{ConnectionStatus, HealthCheckResult};
pub use hooks::MonitoringHooks;
pub use metrics::OperationMetrics;

use metrics::MetricsTable;

#[derive(Debug, Default)]
struct StatusState {
    connected: bool,
    last_health_check: Option<DateTime<Utc>>,
}

struct ClientInner {
    backend: Arc<dyn StoreBackend>,
    config: RwLock<ClientConfig>,
    hooks: RwLock<MonitoringHooks>,
    metrics: Mutex<MetricsTable>,
    status: Mutex<StatusState>,
    recovering: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn config(&self) -> ClientConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn hooks(&self) -> MonitoringHooks {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn metrics(&self) -> MutexGuard<'_, MetricsTable> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> MutexGuard<'_, StatusState> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Store client with retries, recovery, metrics and hooks. Cheap to clone.
#[derive(Clone)]
pub struct ResilientStoreClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ResilientStoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientStoreClient")
            .field("backend", &self.inner.backend.name())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ResilientStoreClient {
    /// Validate `config`, verify the store answers a ping (under the retry
    /// policy) and start the health loop when recovery is enabled.
    pub async fn connect(backend: Arc<dyn StoreBackend>, config: ClientConfig) -> StoreResult<Self> {
        config
            .validate()
            .map_err(|e| StoreError::invalid_argument(e.to_string()))?;

        let recovery_enabled = config.recovery.enabled;
        let client = Self {
            inner: Arc::new(ClientInner {
                backend,
                config: RwLock::new(config),
                hooks: RwLock::new(MonitoringHooks::default()),
                metrics: Mutex::new(MetricsTable::default()),
                status: Mutex::new(StatusState::default()),
                recovering: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                health_task: Mutex::new(None),
            }),
        };

        client.ping().await?;
        {
            let mut status = client.inner.status();
            status.connected = true;
            status.last_health_check = Some(Utc::now());
        }
        info!(backend = client.inner.backend.name(), "store client connected");

        if recovery_enabled {
            client.spawn_health_loop();
        }
        Ok(client)
    }

    /// Connect to Redis using `config.store`.
    #[cfg(feature = "redis")]
    pub async fn connect_redis(config: ClientConfig) -> StoreResult<Self> {
        let backend = crate::store::RedisBackend::connect(&config.store).await?;
        Self::connect(Arc::new(backend), config).await
    }

    pub fn config(&self) -> ClientConfig {
        self.inner.config()
    }

    /// Replace the retry policy used by subsequent operations.
    pub fn set_retry_config(&self, retry: RetryConfig) {
        self.inner.config.write().unwrap_or_else(PoisonError::into_inner).retry = retry;
    }

    /// Replace the recovery policy used by subsequent recoveries.
    pub fn set_recovery_config(&self, recovery: RecoveryConfig) {
        self.inner.config.write().unwrap_or_else(PoisonError::into_inner).recovery = recovery;
    }

    pub fn set_hooks(&self, hooks: MonitoringHooks) {
        *self.inner.hooks.write().unwrap_or_else(PoisonError::into_inner) = hooks;
    }

    /// Snapshot of per-operation counters, keyed by operation name.
    pub fn operation_metrics(&self) -> HashMap<String, OperationMetrics> {
        self.inner.metrics().snapshot()
    }

    pub fn reset_operation_metrics(&self) {
        self.inner.metrics().reset();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop the health loop. Later operations fail with [`StoreError::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();

        let handle = self
            .inner
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "store health loop ended abnormally");
            }
        }
        info!("store client closed");
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    async fn execute<T, F, Fut>(&self, operation: &'static str, call: F) -> StoreResult<T>
    where
        F: Fn(Arc<dyn StoreBackend>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.execute_bounded(operation, Duration::ZERO, call).await
    }

    async fn execute_bounded<T, F, Fut>(
        &self,
        operation: &'static str,
        extra: Duration,
        call: F,
    ) -> StoreResult<T>
    where
        F: Fn(Arc<dyn StoreBackend>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.execute_with(operation, extra, StoreError::is_retryable, call)
            .await
    }

    /// Run `call` under the retry policy, retrying errors `is_retryable`
    /// accepts. Each attempt gets `operation_timeout + extra` before it counts
    /// as a timeout.
    async fn execute_with<T, F, Fut>(
        &self,
        operation: &'static str,
        extra: Duration,
        is_retryable: fn(&StoreError) -> bool,
        call: F,
    ) -> StoreResult<T>
    where
        F: Fn(Arc<dyn StoreBackend>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.ensure_open()?;

        let config = self.inner.config();
        let retry = config.retry;
        let bound = config.store.operation_timeout + extra;
        let hooks = self.inner.hooks();
        let executor = RetryExecutor::new(retry.max_attempts, retry.backoff());

        hooks.operation_started(operation);
        let started = Instant::now();
        let mut retries = 0u32;

        let result = executor
            .run(
                |_| {
                    let attempt = call(self.inner.backend.clone());
                    async move {
                        match tokio::time::timeout(bound, attempt).await {
                            Ok(result) => result,
                            Err(_) => Err(StoreError::Timeout(format!(
                                "{} did not complete within {:?}",
                                operation, bound
                            ))),
                        }
                    }
                },
                is_retryable,
                |attempt, error, delay| {
                    retries += 1;
                    if retry.log_retry_attempts {
                        warn!(
                            operation,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "store operation failed, retrying"
                        );
                    }
                    hooks.retry_attempted(operation, attempt, error);
                },
            )
            .await;

        let result = result.map_err(|err| match err {
            RetryError::Aborted { error, .. } => error,
            RetryError::Exhausted { attempts, last } => StoreError::RetriesExhausted {
                operation: operation.to_string(),
                attempts,
                source: Box::new(last),
            },
        });

        let latency = started.elapsed();
        self.inner.metrics().record(
            operation,
            latency,
            retries,
            result.as_ref().err().map(ToString::to_string),
        );
        hooks.operation_ended(operation, latency, result.as_ref().err());

        if let Err(StoreError::RetriesExhausted { source, .. }) = &result {
            debug!(operation, error = %source, "store retry budget exhausted");
            if source.is_retryable() {
                self.spawn_recovery(format!("{} exhausted retries: {}", operation, source));
            }
        }
        result
    }

    // -- keys -----------------------------------------------------------

    pub async fn ping(&self) -> StoreResult<()> {
        self.execute("ping", |b| async move { b.ping().await }).await
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.execute("get", |b| async move { b.get(key).await }).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.execute("set", |b| async move { b.set(key, value, ttl).await })
            .await
    }

    pub async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.execute("set_nx", |b| async move { b.set_nx(key, value, ttl).await })
            .await
    }

    pub async fn del(&self, key: &str) -> StoreResult<bool> {
        self.execute("del", |b| async move { b.del(key).await }).await
    }

    pub(crate) async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.execute("compare_and_delete", |b| async move {
            b.compare_and_delete(key, expected).await
        })
        .await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.execute("expire", |b| async move { b.expire(key, ttl).await })
            .await
    }

    pub async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.execute("ttl", |b| async move { b.ttl(key).await }).await
    }

    // -- hashes ---------------------------------------------------------

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.execute("hset", |b| async move { b.hset(key, field, value).await })
            .await
    }

    pub async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.execute("hget", |b| async move { b.hget(key, field).await })
            .await
    }

    pub async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.execute("hdel", |b| async move { b.hdel(key, field).await })
            .await
    }

    /// Delete `field` only while it still holds `expected`.
    pub async fn hdel_if_eq(&self, key: &str, field: &str, expected: &str) -> StoreResult<bool> {
        self.execute("hdel_if_eq", |b| async move {
            b.hdel_if_eq(key, field, expected).await
        })
        .await
    }

    // -- sorted sets ----------------------------------------------------

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.execute("zadd", |b| async move { b.zadd(key, member, score).await })
            .await
    }

    pub async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        self.execute("zrange_by_score", |b| async move {
            b.zrange_by_score(key, min, max).await
        })
        .await
    }

    pub async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let members = [member.to_string()];
        let members = &members;
        self.execute("zrem", |b| async move { b.zrem(key, members).await })
            .await
            .map(|removed| removed > 0)
    }

    /// Remove many members in one round trip.
    pub async fn zrem_many(&self, key: &str, members: &[String]) -> StoreResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        self.execute("zrem_many", |b| async move { b.zrem(key, members).await })
            .await
    }

    pub async fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.execute("zcard", |b| async move { b.zcard(key).await }).await
    }

    pub async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        self.execute("zcount", |b| async move { b.zcount(key, min, max).await })
            .await
    }

    pub async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        self.execute("zscore", |b| async move { b.zscore(key, member).await })
            .await
    }

    // -- streams --------------------------------------------------------

    pub async fn create_stream_if_absent(&self, stream: &str, ttl: Duration) -> StoreResult<bool> {
        self.execute("create_stream_if_absent", |b| async move {
            b.create_stream_if_absent(stream, ttl).await
        })
        .await
    }

    pub async fn create_consumer_group(&self, stream: &str, group: &str) -> StoreResult<GroupCreation> {
        self.execute("create_consumer_group", |b| async move {
            b.create_group(stream, group).await
        })
        .await
    }

    /// Append an entry, trimming the stream to about `max_len` entries.
    pub async fn append(&self, stream: &str, fields: &Fields, max_len: Option<usize>) -> StoreResult<EntryId> {
        self.execute("xadd", |b| async move { b.xadd(stream, fields, max_len).await })
            .await
    }

    pub async fn len(&self, stream: &str) -> StoreResult<u64> {
        self.execute("xlen", |b| async move { b.xlen(stream).await }).await
    }

    pub async fn range(
        &self,
        stream: &str,
        start: Option<EntryId>,
        end: Option<EntryId>,
        count: Option<usize>,
    ) -> StoreResult<Vec<StreamEntry>> {
        self.execute("xrange", |b| async move {
            b.xrange(stream, start, end, count).await
        })
        .await
    }

    /// The single entry `id`, if it still exists.
    pub async fn entry(&self, stream: &str, id: EntryId) -> StoreResult<Option<StreamEntry>> {
        let mut entries = self.range(stream, Some(id), Some(id), Some(1)).await?;
        Ok(entries.pop())
    }

    /// The newest `count` entries, newest first.
    pub async fn rev_range(&self, stream: &str, count: usize) -> StoreResult<Vec<StreamEntry>> {
        self.execute("xrevrange", |b| async move { b.xrevrange(stream, count).await })
            .await
    }

    pub async fn read_group(&self, request: &ReadGroupRequest) -> StoreResult<Vec<StreamEntry>> {
        let extra = request.block.unwrap_or_default();
        self.execute_bounded("xreadgroup", extra, |b| async move {
            b.xread_group(request).await
        })
        .await
    }

    pub async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.execute("xack", |b| async move { b.xack(stream, group, ids).await })
            .await
    }

    pub async fn delete_entries(&self, stream: &str, ids: &[EntryId]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.execute("xdel", |b| async move { b.xdel(stream, ids).await })
            .await
    }

    pub async fn pending_summary(&self, stream: &str, group: &str) -> StoreResult<PendingSummary> {
        self.execute("xpending", |b| async move { b.xpending(stream, group).await })
            .await
    }

    pub async fn pending_entries(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> StoreResult<Vec<PendingEntry>> {
        self.execute("xpending_entries", |b| async move {
            b.xpending_entries(stream, group, count).await
        })
        .await
    }

    pub async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> StoreResult<Vec<StreamEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.execute("xclaim", |b| async move {
            b.xclaim(stream, group, consumer, min_idle, ids).await
        })
        .await
    }

    /// Atomic entry transition; `None` if the source entry was already gone.
    ///
    /// A timed-out attempt may still have committed, and a second attempt
    /// would then report the entry as gone, so timeouts are returned to the
    /// caller instead of retried.
    pub async fn move_entry(&self, request: &MoveEntry) -> StoreResult<Option<EntryId>> {
        self.execute_with(
            "move_entry",
            Duration::ZERO,
            |e| e.is_retryable() && !matches!(e, StoreError::Timeout(_)),
            |b| async move { b.move_entry(request).await },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBackend;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> ClientConfig {
        ClientConfig::default()
            .with_retry(
                RetryConfig::default()
                    .with_max_attempts(3)
                    .with_delays(Duration::from_millis(10), Duration::from_millis(50)),
            )
            .with_recovery(RecoveryConfig::disabled())
    }

    async fn connected(backend: &Arc<InMemoryBackend>) -> ResilientStoreClient {
        ResilientStoreClient::connect(backend.clone(), fast_config())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let backend = Arc::new(InMemoryBackend::new());
        let client = connected(&backend).await;

        backend.fail_next_n(2, StoreError::connection("connection reset by peer"));
        client.set("k", "v", None).await.unwrap();
        assert_eq!(client.get("k").await.unwrap().as_deref(), Some("v"));

        let metrics = client.operation_metrics();
        assert_eq!(metrics["set"].retry_count, 2);
        assert_eq!(metrics["set"].success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_fail_immediately() {
        let backend = Arc::new(InMemoryBackend::new());
        let client = connected(&backend).await;

        backend.fail_next(StoreError::command("WRONGTYPE Operation against a key"));
        let err = client.get("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Command(_)));
        assert_eq!(client.operation_metrics()["get"].retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_names_operation_and_attempts() {
        let backend = Arc::new(InMemoryBackend::new());
        let client = connected(&backend).await;

        backend.fail_next_n(3, StoreError::Timeout("slow".into()));
        let err = client.hget("h", "f").await.unwrap_err();
        match err {
            StoreError::RetriesExhausted { operation, attempts, .. } => {
                assert_eq!(operation, "hget");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_moves_are_not_retried() {
        let backend = Arc::new(InMemoryBackend::new());
        let client = connected(&backend).await;
        let fields = vec![("task".to_string(), "{}".to_string())];
        let id = client.append("src", &fields, None).await.unwrap();
        let request = MoveEntry {
            from: "src".into(),
            to: "dst".into(),
            entry_id: id,
            ack_groups: Vec::new(),
            fields,
            max_len: 100,
            ttl: Duration::from_secs(60),
        };

        backend.fail_next(StoreError::Timeout("reply lost".into()));
        let err = client.move_entry(&request).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        assert_eq!(client.operation_metrics()["move_entry"].retry_count, 0);

        // Connection failures never reach the server and are still retried.
        backend.fail_next(StoreError::connection("connection refused"));
        assert!(client.move_entry(&request).await.unwrap().is_some());
        assert_eq!(client.operation_metrics()["move_entry"].retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hash_field_is_deleted_only_while_unchanged() {
        let backend = Arc::new(InMemoryBackend::new());
        let client = connected(&backend).await;
        client.hset("h", "f", "old").await.unwrap();

        assert!(!client.hdel_if_eq("h", "f", "other").await.unwrap());
        assert_eq!(client.hget("h", "f").await.unwrap().as_deref(), Some("old"));
        assert!(client.hdel_if_eq("h", "f", "old").await.unwrap());
        assert_eq!(client.hget("h", "f").await.unwrap(), None);
        assert!(!client.hdel_if_eq("h", "f", "old").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_fails_when_store_is_down() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.set_available(false);
        let result = ResilientStoreClient::connect(backend.clone(), fast_config()).await;
        assert!(matches!(result, Err(StoreError::RetriesExhausted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_is_rejected() {
        let backend = Arc::new(InMemoryBackend::new());
        let config = fast_config().with_retry(RetryConfig::default().with_max_attempts(0));
        let result = ResilientStoreClient::connect(backend, config).await;
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn hooks_observe_operations_and_retries() {
        let backend = Arc::new(InMemoryBackend::new());
        let client = connected(&backend).await;

        let starts = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let failures = Arc::new(AtomicU32::new(0));
        client.set_hooks(
            MonitoringHooks::new()
                .on_operation_start({
                    let starts = starts.clone();
                    move |_| {
                        starts.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .on_retry_attempt({
                    let retries = retries.clone();
                    move |op, _, _| {
                        assert_eq!(op, "zadd");
                        retries.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .on_operation_end({
                    let failures = failures.clone();
                    move |_, _, error| {
                        if error.is_some() {
                            failures.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }),
        );

        backend.fail_next(StoreError::connection("broken pipe"));
        client.zadd("z", "a", 1.0).await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(retries.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn operations_fail_after_close() {
        let backend = Arc::new(InMemoryBackend::new());
        let client = connected(&backend).await;

        client.close().await;
        client.close().await;
        assert!(client.is_closed());
        assert_eq!(client.ping().await, Err(StoreError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_timeout_cancels_backoff() {
        let backend = Arc::new(InMemoryBackend::new());
        let client = connected(&backend).await;
        client.set_retry_config(
            RetryConfig::default()
                .with_max_attempts(10)
                .with_delays(Duration::from_secs(30), Duration::from_secs(30)),
        );

        backend.set_available(false);
        let outcome = tokio::time::timeout(Duration::from_secs(1), client.ping()).await;
        assert!(outcome.is_err(), "the caller deadline should win over the retry loop");
    }
}
