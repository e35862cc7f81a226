//! Background workers.
//!
//! Every worker is a tokio task selecting on one shared
//! [`CancellationToken`]; [`WorkerSet::shutdown`] cancels the token and joins
//! each handle, aborting the ones that outlive the timeout.
//!
//! | Worker                 | Period                     | Work                              |
//! |------------------------|----------------------------|-----------------------------------|
//! | `timeout-checker`      | `timeout_check_interval`   | [`TaskLifecycleManager::check_timeouts`] |
//! | `stream-health`        | `health_check_interval`    | [`TaskLifecycleManager::check_stream_health`], plus pending cleanup every `pending_cleanup_interval` |
//! | `retry-redispatcher`   | `retry_poll_interval`      | [`TaskLifecycleManager::redispatch_ready`] |
//! | `confirmation-pump`    | `confirmation_poll_interval` | [`ConfirmationPump::poll_once`] |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskrelay_events::ConfirmationSource;

use crate::confirmations::ConfirmationPump;
use crate::manager::TaskLifecycleManager;

/// Handles of running workers sharing one cancellation token.
#[derive(Debug, Default)]
pub struct WorkerSet {
    token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(worker = name, "spawning worker");
        self.handles.push((name, tokio::spawn(worker)));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    /// Cancel every worker and wait up to `timeout` for all of them.
    /// Returns how many had to be aborted.
    pub async fn shutdown(self, timeout: Duration) -> usize {
        self.token.cancel();
        let deadline = Instant::now() + timeout;

        let mut aborted = 0;
        for (name, mut handle) in self.handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(worker = name, "worker stopped"),
                Ok(Err(e)) => warn!(worker = name, error = %e, "worker ended abnormally"),
                Err(_) => {
                    warn!(worker = name, "worker did not stop in time, aborting");
                    handle.abort();
                    aborted += 1;
                }
            }
        }
        aborted
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Run `tick` every `period` until `token` is cancelled. Cancellation also
/// interrupts a tick in progress.
pub async fn run_periodic<F, Fut>(name: &'static str, token: CancellationToken, period: Duration, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick() => {}
        }
    }
    debug!(worker = name, "worker loop exited");
}

pub(crate) fn spawn_all(
    manager: &TaskLifecycleManager,
    confirmations: Option<Arc<dyn ConfirmationSource>>,
) -> WorkerSet {
    let config = manager.config().clone();
    let mut set = WorkerSet::new();
    let token = set.token();

    let m = manager.clone();
    set.spawn(
        "timeout-checker",
        run_periodic("timeout-checker", token.clone(), config.timeout_check_interval, move || {
            let m = m.clone();
            async move {
                if let Err(e) = m.check_timeouts(Utc::now()).await {
                    warn!(error = %e, "timeout sweep failed");
                }
            }
        }),
    );

    let m = manager.clone();
    set.spawn("stream-health", stream_health(m, token.clone()));

    let m = manager.clone();
    let consumer = config.consumer_name.clone();
    set.spawn(
        "retry-redispatcher",
        run_periodic("retry-redispatcher", token.clone(), config.retry_poll_interval, move || {
            let m = m.clone();
            let consumer = consumer.clone();
            async move {
                match m.redispatch_ready(&consumer).await {
                    Ok(0) => {}
                    Ok(n) => info!(redispatched = n, "staged retries re-dispatched"),
                    Err(e) => warn!(error = %e, "retry re-dispatch failed"),
                }
            }
        }),
    );

    if let Some(source) = confirmations {
        let pump = ConfirmationPump::new(manager.clone(), source);
        set.spawn(
            "confirmation-pump",
            pump.run(token, config.confirmation_poll_interval),
        );
    }

    set
}

async fn stream_health(manager: TaskLifecycleManager, token: CancellationToken) {
    let config = manager.config().clone();
    let mut health = ticker(config.health_check_interval);
    let mut cleanup = ticker(config.pending_cleanup_interval);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = health.tick() => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = manager.check_stream_health() => match result {
                        Ok(report) if !report.is_healthy() => {
                            warn!(warnings = report.warnings.len(), "stream health degraded");
                        }
                        Ok(_) => debug!("streams healthy"),
                        Err(e) => warn!(error = %e, "stream health check failed"),
                    },
                }
            }
            _ = cleanup.tick() => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = manager.cleanup_pending(config.pending_idle_threshold) => {
                        if let Err(e) = result {
                            warn!(error = %e, "pending cleanup failed");
                        }
                    }
                }
            }
        }
    }
    debug!(worker = "stream-health", "worker loop exited");
}
