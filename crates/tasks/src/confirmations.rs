//! Applies confirmation events to the lifecycle.
//!
//! `Completed` → [`TaskLifecycleManager::mark_completed`],
//! `Rejected { reason }` → [`TaskLifecycleManager::mark_failed`]. The cursor
//! only moves past an event once it has been applied, so a failed batch is
//! retried from the first unapplied event.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskrelay_events::{
    ConfirmationCursor, ConfirmationOutcome, ConfirmationSource, CursorTracker,
};

use crate::error::{LifecycleError, LifecycleResult};
use crate::manager::{TaskLifecycleManager, TransitionOutcome};

/// Effect of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PumpReport {
    pub completed: usize,
    pub rejected: usize,
    /// Events whose task was unknown or already terminal
    pub already_processed: usize,
}

impl PumpReport {
    pub fn applied(&self) -> usize {
        self.completed + self.rejected + self.already_processed
    }
}

pub struct ConfirmationPump {
    manager: TaskLifecycleManager,
    source: Arc<dyn ConfirmationSource>,
    tracker: CursorTracker,
}

impl ConfirmationPump {
    pub fn new(manager: TaskLifecycleManager, source: Arc<dyn ConfirmationSource>) -> Self {
        Self {
            manager,
            source,
            tracker: CursorTracker::new(),
        }
    }

    /// Start after a previously persisted position.
    pub fn resume_from(mut self, cursor: ConfirmationCursor) -> Self {
        self.tracker = CursorTracker::resume_from(cursor);
        self
    }

    pub fn cursor(&self) -> ConfirmationCursor {
        self.tracker.position()
    }

    /// Fetch and apply the next batch.
    pub async fn poll_once(&mut self) -> LifecycleResult<PumpReport> {
        let batch = self
            .source
            .next_batch(self.tracker.position())
            .await
            .map_err(|e| LifecycleError::Source(format!("{:#}", e)))?;

        let mut report = PumpReport::default();
        for event in &batch.events {
            let mut next = self.tracker.clone();
            next.observe(event)?;

            let outcome = match &event.outcome {
                ConfirmationOutcome::Completed => self.manager.mark_completed(event.task_id).await?,
                ConfirmationOutcome::Rejected { reason } => {
                    self.manager.mark_failed(event.task_id, reason).await?
                }
            };
            match (outcome, &event.outcome) {
                (TransitionOutcome::AlreadyProcessed, _) => report.already_processed += 1,
                (_, ConfirmationOutcome::Completed) => report.completed += 1,
                (_, ConfirmationOutcome::Rejected { .. }) => report.rejected += 1,
            }
            self.tracker = next;
        }

        self.tracker.advance_to(batch.cursor)?;
        if report.applied() > 0 {
            debug!(
                completed = report.completed,
                rejected = report.rejected,
                already_processed = report.already_processed,
                cursor = self.tracker.position().last_sequence(),
                "confirmation batch applied"
            );
        }
        Ok(report)
    }

    /// Poll every `interval` until `token` is cancelled. A non-empty batch is
    /// followed immediately by another poll.
    pub async fn run(mut self, token: CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'outer: loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            loop {
                let result = tokio::select! {
                    _ = token.cancelled() => break 'outer,
                    result = self.poll_once() => result,
                };
                match result {
                    Ok(report) if report.applied() > 0 => continue,
                    Ok(_) => break,
                    Err(e) => {
                        warn!(error = %e, "confirmation poll failed");
                        break;
                    }
                }
            }
        }
        info!(cursor = self.cursor().last_sequence(), "confirmation pump stopped");
    }
}
