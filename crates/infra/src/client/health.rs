//! Connection health checks and automatic recovery.
//!
//! When recovery is enabled, [`ResilientStoreClient::connect`] spawns a loop
//! that pings the store every `check_interval`. A failed ping (or an operation
//! that exhausts its retries on a transport error) starts a recovery episode:
//! reconnect + ping with exponential backoff, up to `max_retries` attempts.
//! Only one episode runs at a time.

use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ResilientStoreClient;
use crate::config::{RecoveryConfig, duration_ms};
use crate::store::{StoreError, StoreResult};

const PROBE_TTL: Duration = Duration::from_secs(10);

/// Point-in-time view of the connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub recovering: bool,
    pub last_health_check: Option<DateTime<Utc>>,
    pub recovery: RecoveryConfig,
}

/// Outcome of [`ResilientStoreClient::health_check`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    pub checked_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl ResilientStoreClient {
    pub fn connection_status(&self) -> ConnectionStatus {
        let status = self.inner.status();
        ConnectionStatus {
            connected: status.connected,
            recovering: self.inner.recovering.load(Ordering::SeqCst),
            last_health_check: status.last_health_check,
            recovery: self.inner.config().recovery,
        }
    }

    /// Probe the store end to end: ping, then write, read back and delete a
    /// short-lived key. Each step runs once (no retries).
    pub async fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let outcome = match self.ensure_open() {
            Ok(()) => self.probe().await,
            Err(e) => Err(e),
        };
        let checked_at = Utc::now();
        self.inner.status().last_health_check = Some(checked_at);

        HealthCheckResult {
            healthy: outcome.is_ok(),
            latency: started.elapsed(),
            checked_at,
            error: outcome.err().map(|e| e.to_string()),
        }
    }

    async fn probe(&self) -> StoreResult<()> {
        let bound = self.inner.config().store.operation_timeout;
        let backend = self.inner.backend.clone();
        let key = format!("taskrelay:health:{}", Uuid::new_v4());

        let steps = async {
            backend.ping().await?;
            backend.set(&key, "ok", Some(PROBE_TTL)).await?;
            let read = backend.get(&key).await?;
            backend.del(&key).await?;
            if read.as_deref() != Some("ok") {
                return Err(StoreError::protocol("health probe read back a different value"));
            }
            Ok(())
        };

        tokio::time::timeout(bound * 4, steps)
            .await
            .unwrap_or_else(|_| Err(StoreError::Timeout("health probe".to_string())))
    }

    /// Run one recovery episode now. Returns whether the connection is back.
    ///
    /// Returns `false` immediately if another episode is already running.
    pub async fn attempt_recovery(&self, reason: &str) -> bool {
        if self.inner.recovering.swap(true, Ordering::SeqCst) {
            debug!(reason, "store recovery already in progress");
            return false;
        }

        let config = self.inner.config();
        let recovery = config.recovery;
        let connect_bound = config.store.connect_timeout + config.store.operation_timeout;
        let hooks = self.inner.hooks();
        let backoff = recovery.backoff();

        warn!(reason, "store connection lost, starting recovery");
        self.set_connected(false);
        hooks.recovery_started(reason);
        let started = Instant::now();

        let mut recovered = false;
        for attempt in 1..=recovery.max_retries.max(1) {
            let backend = self.inner.backend.clone();
            let reconnect = async move {
                backend.reconnect().await?;
                backend.ping().await
            };
            let result = tokio::time::timeout(connect_bound, reconnect)
                .await
                .unwrap_or_else(|_| Err(StoreError::Timeout("reconnect".to_string())));

            match result {
                Ok(()) => {
                    recovered = true;
                    break;
                }
                Err(e) if attempt < recovery.max_retries => {
                    let delay = backoff.base_delay(attempt);
                    warn!(
                        attempt,
                        max_retries = recovery.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "store reconnect failed"
                    );
                    tokio::select! {
                        _ = self.inner.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "store reconnect failed");
                }
            }
        }

        let elapsed = started.elapsed();
        self.inner.recovering.store(false, Ordering::SeqCst);
        if recovered {
            self.inner.status().last_health_check = Some(Utc::now());
            self.set_connected(true);
            info!(elapsed_ms = elapsed.as_millis() as u64, "store connection recovered");
        } else {
            error!(
                elapsed_ms = elapsed.as_millis() as u64,
                "store recovery gave up"
            );
        }
        hooks.recovery_ended(recovered, elapsed);
        recovered
    }

    /// Start a recovery episode in the background, if enabled and idle.
    pub(super) fn spawn_recovery(&self, reason: String) {
        if self.is_closed()
            || !self.inner.config().recovery.enabled
            || self.inner.recovering.load(Ordering::SeqCst)
        {
            return;
        }
        let client = self.clone();
        let token = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = client.attempt_recovery(&reason) => {}
            }
        });
    }

    pub(super) fn spawn_health_loop(&self) {
        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        let interval = self.inner.config().recovery.check_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                let client = ResilientStoreClient { inner };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = client.health_tick() => {}
                }
            }
            debug!("store health loop stopped");
        });

        *self
            .inner
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn health_tick(&self) {
        let bound = self.inner.config().store.operation_timeout;
        let result = tokio::time::timeout(bound, self.inner.backend.ping())
            .await
            .unwrap_or_else(|_| Err(StoreError::Timeout("ping".to_string())));
        self.inner.status().last_health_check = Some(Utc::now());

        match result {
            Ok(()) => self.set_connected(true),
            Err(e) => {
                if !self.inner.recovering.load(Ordering::SeqCst) {
                    self.attempt_recovery(&format!("health check failed: {}", e))
                        .await;
                }
            }
        }
    }

    fn set_connected(&self, connected: bool) {
        let changed = {
            let mut status = self.inner.status();
            let changed = status.connected != connected;
            status.connected = connected;
            changed
        };
        if changed {
            debug!(connected, "store connection status changed");
            self.inner.hooks().connection_status_changed(connected);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32};

    use super::*;
    use crate::config::{ClientConfig, RetryConfig};
    use crate::store::InMemoryBackend;
    use crate::client::MonitoringHooks;

    fn config(recovery: RecoveryConfig) -> ClientConfig {
        ClientConfig::default()
            .with_retry(RetryConfig::no_retry())
            .with_recovery(recovery)
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_reports_probe_result() {
        let backend = Arc::new(InMemoryBackend::new());
        let client = ResilientStoreClient::connect(backend.clone(), config(RecoveryConfig::disabled()))
            .await
            .unwrap();

        let ok = client.health_check().await;
        assert!(ok.healthy);
        assert!(ok.error.is_none());

        backend.set_available(false);
        let failed = client.health_check().await;
        assert!(!failed.healthy);
        assert!(failed.error.unwrap().contains("connection refused"));
        assert!(client.connection_status().last_health_check.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_reconnects_once_store_returns() {
        let backend = Arc::new(InMemoryBackend::new());
        let client = ResilientStoreClient::connect(
            backend.clone(),
            config(
                RecoveryConfig::disabled()
                    .with_backoff(Duration::from_millis(100), Duration::from_secs(1))
                    .with_max_retries(5),
            ),
        )
        .await
        .unwrap();

        let ended = Arc::new(AtomicBool::new(false));
        let status_changes = Arc::new(AtomicU32::new(0));
        client.set_hooks(
            MonitoringHooks::new()
                .on_recovery_end({
                    let ended = ended.clone();
                    move |recovered, _| ended.store(recovered, Ordering::SeqCst)
                })
                .on_connection_status_change({
                    let changes = status_changes.clone();
                    move |_| {
                        changes.fetch_add(1, Ordering::SeqCst);
                    }
                }),
        );

        backend.set_available(false);
        let flip = {
            let backend = backend.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                backend.set_available(true);
            })
        };

        assert!(client.attempt_recovery("test outage").await);
        flip.await.unwrap();
        assert!(ended.load(Ordering::SeqCst));
        assert!(backend.reconnect_count() >= 1);
        assert_eq!(status_changes.load(Ordering::SeqCst), 2);
        assert!(client.connection_status().connected);
        assert!(!client.connection_status().recovering);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_gives_up_after_max_retries() {
        let backend = Arc::new(InMemoryBackend::new());
        let client = ResilientStoreClient::connect(
            backend.clone(),
            config(
                RecoveryConfig::disabled()
                    .with_backoff(Duration::from_millis(10), Duration::from_millis(10))
                    .with_max_retries(3),
            ),
        )
        .await
        .unwrap();

        backend.set_available(false);
        assert!(!client.attempt_recovery("permanent outage").await);
        assert!(!client.connection_status().connected);
        assert_eq!(backend.reconnect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn health_loop_detects_outage_and_recovers() {
        let backend = Arc::new(InMemoryBackend::new());
        let client = ResilientStoreClient::connect(
            backend.clone(),
            config(
                RecoveryConfig::default()
                    .with_check_interval(Duration::from_secs(1))
                    .with_backoff(Duration::from_millis(100), Duration::from_millis(100))
                    .with_max_retries(50),
            ),
        )
        .await
        .unwrap();

        backend.set_available(false);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!client.connection_status().connected);

        backend.set_available(true);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(client.connection_status().connected);
        assert!(backend.reconnect_count() >= 1);

        client.close().await;
    }
}
