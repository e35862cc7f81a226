//! Distributed lock with per-acquisition tokens.
//!
//! Acquisition is `SET key token NX PX ttl`; release deletes the key only if
//! it still holds this lock's token, so a holder whose lease expired can never
//! release someone else's lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::client::ResilientStoreClient;
use crate::retry::{BackoffPolicy, RetryError, RetryExecutor};
use crate::store::{StoreError, StoreResult};

/// How `acquire` behaves under contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStrategy {
    /// Additional attempts after the first
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryStrategy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }
}

#[derive(Debug)]
enum AcquireError {
    Contended,
    Store(StoreError),
}

/// A named lease in the store.
#[derive(Debug)]
pub struct DistributedLock {
    client: ResilientStoreClient,
    key: String,
    token: String,
    ttl: Duration,
    strategy: RetryStrategy,
    held: AtomicBool,
}

impl ResilientStoreClient {
    /// Create a lock handle with a fresh token. Nothing is written until
    /// [`DistributedLock::acquire`].
    pub fn new_lock(
        &self,
        key: impl Into<String>,
        ttl: Duration,
        strategy: RetryStrategy,
    ) -> StoreResult<DistributedLock> {
        if ttl.is_zero() {
            return Err(StoreError::invalid_argument("lock TTL must be greater than zero"));
        }
        Ok(DistributedLock {
            client: self.clone(),
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            ttl,
            strategy,
            held: AtomicBool::new(false),
        })
    }
}

impl DistributedLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Token written on acquisition; unique per lock handle.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether this handle believes it holds the lease. The lease may still
    /// have expired in the store.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Try to take the lock. `Ok(false)` means another holder kept it for
    /// every attempt; store failures are returned as errors.
    #[instrument(skip(self), fields(key = %self.key), err)]
    pub async fn acquire(&self) -> StoreResult<bool> {
        let executor = RetryExecutor::new(
            self.strategy.max_retries.saturating_add(1),
            BackoffPolicy::fixed(self.strategy.delay),
        );

        let result = executor
            .run(
                |_| async move {
                    match self.client.set_nx(&self.key, &self.token, self.ttl).await {
                        Ok(true) => Ok(()),
                        Ok(false) => Err(AcquireError::Contended),
                        Err(e) => Err(AcquireError::Store(e)),
                    }
                },
                |e| matches!(e, AcquireError::Contended),
                |attempt, _, delay| {
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "lock contended, waiting");
                },
            )
            .await;

        match result {
            Ok(()) => {
                self.held.store(true, Ordering::SeqCst);
                debug!("lock acquired");
                Ok(true)
            }
            Err(RetryError::Exhausted { .. }) => Ok(false),
            Err(RetryError::Aborted { error, .. }) => match error {
                AcquireError::Store(e) => Err(e),
                AcquireError::Contended => Ok(false),
            },
        }
    }

    /// Release the lease if this handle's token still owns it.
    ///
    /// Fails with [`StoreError::LockNotAcquired`] when the key is missing or
    /// held by another token.
    #[instrument(skip(self), fields(key = %self.key), err)]
    pub async fn release(&self) -> StoreResult<()> {
        let deleted = self.client.compare_and_delete(&self.key, &self.token).await?;
        self.held.store(false, Ordering::SeqCst);
        if !deleted {
            return Err(StoreError::LockNotAcquired);
        }
        debug!("lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{ClientConfig, RecoveryConfig};
    use crate::store::InMemoryBackend;

    async fn client() -> (Arc<InMemoryBackend>, ResilientStoreClient) {
        let backend = Arc::new(InMemoryBackend::new());
        let config = ClientConfig::default().with_recovery(RecoveryConfig::disabled());
        let client = ResilientStoreClient::connect(backend.clone(), config)
            .await
            .unwrap();
        (backend, client)
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_is_rejected() {
        let (_, client) = client().await;
        let err = client
            .new_lock("performer:3", Duration::ZERO, RetryStrategy::no_retry())
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::invalid_argument("lock TTL must be greater than zero")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_holder_is_refused_until_release() {
        let (_, client) = client().await;
        let first = client
            .new_lock("performer:3", Duration::from_secs(10), RetryStrategy::no_retry())
            .unwrap();
        let second = client
            .new_lock("performer:3", Duration::from_secs(10), RetryStrategy::no_retry())
            .unwrap();
        assert_ne!(first.token(), second.token());

        assert!(first.acquire().await.unwrap());
        assert!(!second.acquire().await.unwrap());
        assert!(!second.is_held());

        first.release().await.unwrap();
        assert!(second.acquire().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn release_with_foreign_token_is_refused() {
        let (_, client) = client().await;
        let owner = client
            .new_lock("performer:3", Duration::from_secs(10), RetryStrategy::no_retry())
            .unwrap();
        let intruder = client
            .new_lock("performer:3", Duration::from_secs(10), RetryStrategy::no_retry())
            .unwrap();

        owner.acquire().await.unwrap();
        assert_eq!(intruder.release().await, Err(StoreError::LockNotAcquired));
        assert!(owner.is_held());
        owner.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_acquire_succeeds_after_lease_expires() {
        let (_, client) = client().await;
        let holder = client
            .new_lock("performer:3", Duration::from_millis(300), RetryStrategy::no_retry())
            .unwrap();
        let waiter = client
            .new_lock(
                "performer:3",
                Duration::from_secs(10),
                RetryStrategy::fixed(5, Duration::from_millis(100)),
            )
            .unwrap();

        assert!(holder.acquire().await.unwrap());
        assert!(waiter.acquire().await.unwrap());
        assert_eq!(holder.release().await, Err(StoreError::LockNotAcquired));
    }

    #[tokio::test(start_paused = true)]
    async fn store_errors_propagate() {
        let (backend, client) = client().await;
        client.set_retry_config(crate::config::RetryConfig::no_retry());
        let lock = client
            .new_lock(
                "performer:3",
                Duration::from_secs(10),
                RetryStrategy::fixed(3, Duration::from_millis(10)),
            )
            .unwrap();

        backend.fail_next(StoreError::command("ERR unknown command"));
        assert_eq!(
            lock.acquire().await,
            Err(StoreError::command("ERR unknown command"))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_concurrent_holder() {
        let (_, client) = client().await;
        let mut handles = Vec::new();
        for _ in 0..16 {
            let lock = client
                .new_lock("performer:3", Duration::from_secs(30), RetryStrategy::no_retry())
                .unwrap();
            handles.push(tokio::spawn(async move { lock.acquire().await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
