//! Task lifecycle manager.
//!
//! Owns the four lifecycle streams and moves tasks between them. Terminal
//! transitions are one atomic store step (check source entry, ack, delete,
//! append to destination); whichever caller performs that step wins, and any
//! concurrent caller sees [`TransitionOutcome::AlreadyProcessed`].
//!
//! Index and timeout bookkeeping after a successful primary mutation is
//! best-effort: failures are logged and counted, never returned.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use taskrelay_core::{DomainError, DomainResult, EntryId, LifecycleStream, TaskId, TaskRecord};
use taskrelay_events::ConfirmationSource;
use taskrelay_infra::store::{
    Fields, GroupCreation, MoveEntry, PendingSummary, ReadGroupRequest, StreamEntry,
};
use taskrelay_infra::{ResilientStoreClient, StoreError};
use taskrelay_observability::{Counter, Gauge, MetricsSink, Outcome};

use crate::config::LifecycleConfig;
use crate::delivery::DeliverySink;
use crate::error::{LifecycleError, LifecycleResult};
use crate::expiration::ExpirationTracker;
use crate::index::TaskIndex;
use crate::workers::{self, WorkerSet};

/// Reads and acknowledges on every stream.
pub const TASK_PROCESSORS_GROUP: &str = "task-processors";
/// Timeout scanner's group on `dispatched`.
pub const TIMEOUT_CHECKER_GROUP: &str = "timeout-checker";
/// Lookup group on `dispatched`.
pub const TASK_FINDER_GROUP: &str = "task-finder";
/// Failure reason recorded by the timeout worker.
pub const TIMEOUT_REASON: &str = "dispatched timeout";

const FIELD_TASK: &str = "task";
const FIELD_TASK_ID: &str = "task_id";
const FIELD_CREATED_AT: &str = "created_at";

/// Pending entries inspected per group in one cleanup pass.
const CLEANUP_BATCH: usize = 100;

fn default_groups(stream: LifecycleStream) -> &'static [&'static str] {
    match stream {
        LifecycleStream::Dispatched => &[
            TASK_PROCESSORS_GROUP,
            TIMEOUT_CHECKER_GROUP,
            TASK_FINDER_GROUP,
        ],
        _ => &[TASK_PROCESSORS_GROUP],
    }
}

/// A task together with the entry that currently holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedTask {
    pub stream: LifecycleStream,
    pub entry_id: EntryId,
    pub task: TaskRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Moved {
        from: LifecycleStream,
        to: LifecycleStream,
    },
    /// The task was unknown or another caller moved it first.
    AlreadyProcessed,
}

impl TransitionOutcome {
    pub fn is_moved(&self) -> bool {
        matches!(self, TransitionOutcome::Moved { .. })
    }
}

/// Result of staging a failed task for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryStaging {
    Scheduled {
        entry_id: EntryId,
        scheduled_for: DateTime<Utc>,
        retry_count: u32,
    },
    /// Retry budget spent; the task was moved to `failed`.
    Exhausted { entry_id: EntryId, retry_count: u32 },
    AlreadyProcessed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Appended; no delivery sink is configured.
    Enqueued { entry_id: EntryId },
    Delivered { entry_id: EntryId },
    DeliveryFailed {
        entry_id: EntryId,
        error: String,
        staging: RetryStaging,
    },
}

impl DispatchOutcome {
    pub fn entry_id(&self) -> EntryId {
        match self {
            DispatchOutcome::Enqueued { entry_id }
            | DispatchOutcome::Delivered { entry_id }
            | DispatchOutcome::DeliveryFailed { entry_id, .. } => *entry_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub stream: LifecycleStream,
    pub length: u64,
    /// Remaining TTL; `None` when the stream is missing or persistent
    #[serde(with = "optional_secs")]
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub streams: Vec<StreamStats>,
    pub max_length: usize,
    /// Distinct (stream, group) pairs known to this manager
    pub consumer_groups: usize,
}

impl StreamInfo {
    pub fn stats(&self, stream: LifecycleStream) -> Option<&StreamStats> {
        self.streams.iter().find(|s| s.stream == stream)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingGroupInfo {
    pub stream: LifecycleStream,
    pub group: String,
    pub summary: PendingSummary,
}

/// One pass of the timeout worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimeoutSweep {
    /// Deadlines at or before the sweep time
    pub expired: usize,
    /// Tasks moved from `dispatched` to `failed`
    pub moved: usize,
    /// Expired ids no longer in `dispatched`
    pub missing: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHealthReport {
    pub info: StreamInfo,
    pub pending: Vec<PendingGroupInfo>,
    pub warnings: Vec<String>,
}

impl StreamHealthReport {
    pub fn is_healthy(&self) -> bool {
        self.warnings.is_empty()
    }
}

mod optional_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }
}

struct ManagerInner {
    client: ResilientStoreClient,
    config: LifecycleConfig,
    metrics: Arc<dyn MetricsSink>,
    index: TaskIndex,
    expirations: ExpirationTracker,
    delivery: RwLock<Option<Arc<dyn DeliverySink>>>,
    groups: tokio::sync::RwLock<HashSet<(LifecycleStream, String)>>,
    workers: Mutex<Option<WorkerSet>>,
    closed: AtomicBool,
}

/// Moves tasks through the lifecycle streams. Cheap to clone.
///
/// Running workers hold a clone; call [`close`](Self::close) to stop them.
#[derive(Clone)]
pub struct TaskLifecycleManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for TaskLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskLifecycleManager")
            .field("consumer", &self.inner.config.consumer_name)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl TaskLifecycleManager {
    pub fn new(
        client: ResilientStoreClient,
        config: LifecycleConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> LifecycleResult<Self> {
        config.validate().map_err(LifecycleError::Config)?;

        let index = TaskIndex::new(client.clone(), config.index_ttl, metrics.clone());
        let expirations =
            ExpirationTracker::new(client.clone(), config.timeout_set_ttl, metrics.clone());

        Ok(Self {
            inner: Arc::new(ManagerInner {
                client,
                config,
                metrics,
                index,
                expirations,
                delivery: RwLock::new(None),
                groups: tokio::sync::RwLock::new(HashSet::new()),
                workers: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    pub fn client(&self) -> &ResilientStoreClient {
        &self.inner.client
    }

    pub fn index(&self) -> &TaskIndex {
        &self.inner.index
    }

    pub fn expirations(&self) -> &ExpirationTracker {
        &self.inner.expirations
    }

    /// Install the sink used by [`dispatch`](Self::dispatch).
    pub fn set_delivery_sink(&self, sink: Arc<dyn DeliverySink>) {
        *self
            .inner
            .delivery
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    fn delivery_sink(&self) -> Option<Arc<dyn DeliverySink>> {
        self.inner
            .delivery
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> LifecycleResult<()> {
        if self.is_closed() {
            return Err(LifecycleError::Closed);
        }
        Ok(())
    }

    // -- setup ----------------------------------------------------------

    /// Create missing streams (seed entry + TTL) and the default consumer
    /// groups. Safe to run any number of times.
    #[instrument(skip(self), err)]
    pub async fn initialize(&self) -> LifecycleResult<()> {
        self.ensure_open()?;

        for stream in LifecycleStream::ALL {
            self.ensure_stream(stream)
                .await
                .map_err(LifecycleError::Initialization)?;
        }

        info!("lifecycle streams initialized");
        Ok(())
    }

    /// Create `stream` if absent, then every known group on it. Returns
    /// whether the stream was created.
    async fn ensure_stream(&self, stream: LifecycleStream) -> Result<bool, StoreError> {
        let created = self
            .inner
            .client
            .create_stream_if_absent(stream.key(), self.inner.config.ttl_for(stream))
            .await?;
        if created {
            info!(stream = %stream, "lifecycle stream created");
        }
        for group in self.groups_for(stream).await {
            self.create_group(stream, &group).await?;
        }
        Ok(created)
    }

    /// Streams expire after their TTL and take their groups with them; a
    /// later append recreates the key bare.
    async fn restore_groups(&self, stream: LifecycleStream) -> LifecycleResult<()> {
        warn!(stream = %stream, "consumer groups missing, recreating");
        self.ensure_stream(stream).await?;
        Ok(())
    }

    /// Group read that recreates missing groups and retries once.
    async fn read_group_restoring(
        &self,
        stream: LifecycleStream,
        request: &ReadGroupRequest,
    ) -> LifecycleResult<Vec<StreamEntry>> {
        match self.inner.client.read_group(request).await {
            Err(e) if is_missing_group(&e) => {
                self.restore_groups(stream).await?;
                Ok(self.inner.client.read_group(request).await?)
            }
            result => Ok(result?),
        }
    }

    /// Register a consumer group on `stream`. Existing groups are left as is.
    #[instrument(skip(self), fields(stream = %stream), err)]
    pub async fn register_consumer_group(
        &self,
        stream: LifecycleStream,
        group: &str,
    ) -> LifecycleResult<GroupCreation> {
        self.ensure_open()?;
        if group.trim().is_empty() {
            return Err(DomainError::validation("consumer group name must not be empty").into());
        }
        Ok(self.create_group(stream, group).await?)
    }

    async fn create_group(&self, stream: LifecycleStream, group: &str) -> Result<GroupCreation, StoreError> {
        let creation = self
            .inner
            .client
            .create_consumer_group(stream.key(), group)
            .await?;
        if creation == GroupCreation::Created {
            debug!(stream = %stream, group, "consumer group created");
        }
        self.inner
            .groups
            .write()
            .await
            .insert((stream, group.to_string()));
        Ok(creation)
    }

    /// Default groups of `stream` plus every group registered on it.
    async fn groups_for(&self, stream: LifecycleStream) -> Vec<String> {
        let registered = self.inner.groups.read().await;
        let groups: BTreeSet<String> = default_groups(stream)
            .iter()
            .map(|g| g.to_string())
            .chain(
                registered
                    .iter()
                    .filter(|(s, _)| *s == stream)
                    .map(|(_, g)| g.clone()),
            )
            .collect();
        groups.into_iter().collect()
    }

    // -- dispatch -------------------------------------------------------

    /// Append `task` to `dispatched` and track it.
    ///
    /// Sets `dispatched_at` if unset. Index and deadline writes are
    /// best-effort; only the append can fail the call.
    #[instrument(skip(self, task), fields(task_id = %task.task_id), err)]
    pub async fn enqueue(&self, mut task: TaskRecord) -> LifecycleResult<EntryId> {
        self.enqueue_record(&mut task).await
    }

    async fn enqueue_record(&self, task: &mut TaskRecord) -> LifecycleResult<EntryId> {
        self.ensure_open()?;
        task.validate()?;
        if task.dispatched_at.is_none() {
            task.mark_dispatched(Utc::now());
        }

        let stream = LifecycleStream::Dispatched;
        let fields = encode(task)?;
        let result = self
            .inner
            .client
            .append(stream.key(), &fields, Some(self.inner.config.max_stream_length))
            .await;
        self.inner
            .metrics
            .increment(Counter::TasksAppended, stream.name(), Outcome::from_result(&result));
        let entry_id = result?;

        self.refresh_stream_ttl(stream).await;

        if let Err(e) = self.inner.index.store(task.task_id, stream, entry_id).await {
            warn!(task_id = %task.task_id, error = %e, "failed to index task");
        }
        if let Some(timeout) = task.timeout() {
            if let Err(e) = self.inner.expirations.add_deadline(task.task_id, timeout).await {
                warn!(task_id = %task.task_id, error = %e, "failed to track task deadline");
            }
        }

        debug!(task_id = %task.task_id, entry_id = %entry_id, "task enqueued");
        Ok(entry_id)
    }

    /// Enqueue, then hand the task to the delivery sink.
    ///
    /// A delivery failure stages the task for retry (or fails it once the
    /// retry budget is spent); the call itself still succeeds.
    #[instrument(skip(self, task), fields(task_id = %task.task_id), err)]
    pub async fn dispatch(&self, mut task: TaskRecord) -> LifecycleResult<DispatchOutcome> {
        let entry_id = self.enqueue_record(&mut task).await?;

        let Some(sink) = self.delivery_sink() else {
            return Ok(DispatchOutcome::Enqueued { entry_id });
        };

        match sink.deliver(&task).await {
            Ok(()) => Ok(DispatchOutcome::Delivered { entry_id }),
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "task delivery failed");
                let staging = self.stage_retry(task.task_id, &e.to_string()).await?;
                Ok(DispatchOutcome::DeliveryFailed {
                    entry_id,
                    error: e.to_string(),
                    staging,
                })
            }
        }
    }

    // -- lookup ---------------------------------------------------------

    /// Locate a live task: index first, then a bounded scan of the newest
    /// `dispatched` entries.
    #[instrument(skip(self), fields(task_id = %task_id), err)]
    pub async fn find_by_id(&self, task_id: TaskId) -> LifecycleResult<Option<LocatedTask>> {
        self.ensure_open()?;

        match self.inner.index.get(task_id).await {
            Ok(Some(entry)) => match self.load(entry.stream, entry.entry_id).await {
                Ok(Some(task)) if task.task_id == task_id => {
                    return Ok(Some(LocatedTask {
                        stream: entry.stream,
                        entry_id: entry.entry_id,
                        task,
                    }));
                }
                Ok(_) => {
                    debug!(task_id = %task_id, entry_id = %entry.entry_id, "dangling task index entry");
                    self.drop_index_if_unchanged(task_id, entry.stream, entry.entry_id).await;
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "indexed entry unreadable, scanning");
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "task index lookup failed, scanning");
            }
        }

        self.scan_dispatched(task_id).await
    }

    async fn load(&self, stream: LifecycleStream, entry_id: EntryId) -> LifecycleResult<Option<TaskRecord>> {
        let Some(entry) = self.inner.client.entry(stream.key(), entry_id).await? else {
            return Ok(None);
        };
        match decode(&entry) {
            Some(task) => Ok(Some(task?)),
            None => Ok(None),
        }
    }

    async fn scan_dispatched(&self, task_id: TaskId) -> LifecycleResult<Option<LocatedTask>> {
        let stream = LifecycleStream::Dispatched;
        let limit = self.inner.config.scan_limit();
        let wanted = task_id.to_string();
        let entries = self.inner.client.rev_range(stream.key(), limit).await?;

        for entry in entries {
            if entry.field(FIELD_TASK_ID) != Some(wanted.as_str()) {
                continue;
            }
            match decode(&entry) {
                Some(Ok(task)) if task.task_id == task_id => {
                    debug!(task_id = %task_id, entry_id = %entry.id, "task found by scan");
                    return Ok(Some(LocatedTask {
                        stream,
                        entry_id: entry.id,
                        task,
                    }));
                }
                Some(Err(e)) => {
                    warn!(entry_id = %entry.id, error = %e, "skipping malformed entry");
                }
                _ => {}
            }
        }
        Ok(None)
    }

    // -- transitions ----------------------------------------------------

    /// Move a live task to `completed`.
    #[instrument(skip(self), fields(task_id = %task_id), err)]
    pub async fn mark_completed(&self, task_id: TaskId) -> LifecycleResult<TransitionOutcome> {
        self.finish(task_id, LifecycleStream::Completed, |task| {
            task.mark_completed(Utc::now())
        })
        .await
    }

    /// Move a live task to `failed`, counting one more failure.
    #[instrument(skip(self, reason), fields(task_id = %task_id), err)]
    pub async fn mark_failed(&self, task_id: TaskId, reason: &str) -> LifecycleResult<TransitionOutcome> {
        self.finish(task_id, LifecycleStream::Failed, |task| {
            task.mark_failed(reason, Utc::now())
        })
        .await
    }

    async fn finish(
        &self,
        task_id: TaskId,
        to: LifecycleStream,
        update: impl FnOnce(&mut TaskRecord),
    ) -> LifecycleResult<TransitionOutcome> {
        let Some(located) = self.find_by_id(task_id).await? else {
            warn!(task_id = %task_id, to = %to, "task not found, treating as already processed");
            self.count_terminal(to, Outcome::Empty);
            return Ok(TransitionOutcome::AlreadyProcessed);
        };
        self.finish_located(located, to, update, true).await
    }

    async fn finish_located(
        &self,
        located: LocatedTask,
        to: LifecycleStream,
        update: impl FnOnce(&mut TaskRecord),
        remove_deadline: bool,
    ) -> LifecycleResult<TransitionOutcome> {
        let task_id = located.task.task_id;
        let from = located.stream;
        if from.is_terminal() {
            self.count_terminal(to, Outcome::Empty);
            return Ok(TransitionOutcome::AlreadyProcessed);
        }

        let mut task = located.task.clone();
        update(&mut task);

        let moved = match self.transition(&located, to, &task).await {
            Ok(moved) => moved,
            Err(e) => {
                self.count_terminal(to, Outcome::Failure);
                return Err(e);
            }
        };

        match moved {
            Some(entry_id) => {
                self.count_terminal(to, Outcome::Success);
                self.forget(task_id, remove_deadline).await;
                info!(task_id = %task_id, from = %from, to = %to, entry_id = %entry_id, "task transitioned");
                Ok(TransitionOutcome::Moved { from, to })
            }
            None => {
                self.count_terminal(to, Outcome::Empty);
                warn!(task_id = %task_id, from = %from, to = %to, "task already processed");
                self.drop_index_if_unchanged(task_id, from, located.entry_id).await;
                Ok(TransitionOutcome::AlreadyProcessed)
            }
        }
    }

    fn count_terminal(&self, to: LifecycleStream, outcome: Outcome) {
        let counter = match to {
            LifecycleStream::Completed => Counter::TasksCompleted,
            _ => Counter::TasksFailed,
        };
        self.inner.metrics.increment(counter, to.name(), outcome);
    }

    /// Atomically move the located entry to `to` carrying `record`.
    /// `None` when the entry was already gone.
    async fn transition(
        &self,
        located: &LocatedTask,
        to: LifecycleStream,
        record: &TaskRecord,
    ) -> LifecycleResult<Option<EntryId>> {
        let request = MoveEntry {
            from: located.stream.key().to_string(),
            to: to.key().to_string(),
            entry_id: located.entry_id,
            ack_groups: self.groups_for(located.stream).await,
            fields: encode(record)?,
            max_len: self.inner.config.max_stream_length,
            ttl: self.inner.config.ttl_for(to),
        };
        Ok(self.inner.client.move_entry(&request).await?)
    }

    /// Best-effort removal of the index entry and (optionally) the deadline.
    async fn forget(&self, task_id: TaskId, remove_deadline: bool) {
        if let Err(e) = self.inner.index.remove(task_id).await {
            warn!(task_id = %task_id, error = %e, "failed to remove task index entry");
        }
        if !remove_deadline {
            return;
        }
        if let Err(e) = self.inner.expirations.remove_deadline(task_id).await {
            warn!(task_id = %task_id, error = %e, "failed to remove task deadline");
        }
    }

    /// Drop the index pointer to a vanished entry unless it has since been
    /// repointed.
    async fn drop_index_if_unchanged(&self, task_id: TaskId, stream: LifecycleStream, entry_id: EntryId) {
        match self
            .inner
            .index
            .remove_if_points_to(task_id, stream, entry_id)
            .await
        {
            Ok(true) => debug!(task_id = %task_id, entry_id = %entry_id, "removed dangling task index entry"),
            Ok(false) => {}
            Err(e) => warn!(task_id = %task_id, error = %e, "failed to remove dangling task index entry"),
        }
    }

    async fn refresh_stream_ttl(&self, stream: LifecycleStream) {
        if let Err(e) = self
            .inner
            .client
            .expire(stream.key(), self.inner.config.ttl_for(stream))
            .await
        {
            warn!(stream = %stream, error = %e, "failed to refresh stream TTL");
        }
    }

    // -- retry staging --------------------------------------------------

    /// Count a failure against a dispatched task and stage it for another
    /// attempt, or fail it for good once the retry budget is spent.
    ///
    /// Staged tasks leave the timeout set; they get a new deadline when
    /// re-dispatched.
    #[instrument(skip(self, reason), fields(task_id = %task_id), err)]
    pub async fn stage_retry(&self, task_id: TaskId, reason: &str) -> LifecycleResult<RetryStaging> {
        let Some(located) = self.find_by_id(task_id).await? else {
            warn!(task_id = %task_id, "task not found, nothing to stage");
            return Ok(RetryStaging::AlreadyProcessed);
        };
        if located.stream != LifecycleStream::Dispatched {
            debug!(task_id = %task_id, stream = %located.stream, "task not dispatched, nothing to stage");
            return Ok(RetryStaging::AlreadyProcessed);
        }

        let now = Utc::now();
        let mut task = located.task.clone();
        task.mark_failed(reason, now);
        let retry_count = task.retry_count;

        if retry_count > self.inner.config.max_retry_attempts {
            let failed = LifecycleStream::Failed;
            return match self.transition(&located, failed, &task).await? {
                Some(entry_id) => {
                    self.count_terminal(failed, Outcome::Success);
                    self.forget(task_id, true).await;
                    warn!(task_id = %task_id, retry_count, "retry budget exhausted, task failed");
                    Ok(RetryStaging::Exhausted {
                        entry_id,
                        retry_count,
                    })
                }
                None => {
                    self.drop_index_if_unchanged(task_id, located.stream, located.entry_id)
                        .await;
                    Ok(RetryStaging::AlreadyProcessed)
                }
            };
        }

        let delay = self.inner.config.retry_backoff().delay_for_attempt(retry_count);
        let scheduled_for = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        task.schedule_retry(scheduled_for);

        let retry = LifecycleStream::Retry;
        let result = self.transition(&located, retry, &task).await;
        self.inner.metrics.increment(
            Counter::TasksRetried,
            retry.name(),
            match &result {
                Ok(Some(_)) => Outcome::Success,
                Ok(None) => Outcome::Empty,
                Err(_) => Outcome::Failure,
            },
        );
        let Some(entry_id) = result? else {
            self.drop_index_if_unchanged(task_id, located.stream, located.entry_id)
                .await;
            return Ok(RetryStaging::AlreadyProcessed);
        };

        if let Err(e) = self.inner.index.store(task_id, retry, entry_id).await {
            warn!(task_id = %task_id, error = %e, "failed to repoint task index to retry entry");
        }
        if let Err(e) = self.inner.expirations.remove_deadline(task_id).await {
            warn!(task_id = %task_id, error = %e, "failed to remove task deadline");
        }

        info!(
            task_id = %task_id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "task staged for retry"
        );
        Ok(RetryStaging::Scheduled {
            entry_id,
            scheduled_for,
            retry_count,
        })
    }

    /// Re-dispatch every staged task that is due. Returns how many moved.
    ///
    /// First takes over `retry` entries other consumers have left pending for
    /// `retry_claim_idle`, then reads this consumer's pending entries and new
    /// ones. Entries not yet due stay pending and are revisited on the next
    /// call.
    #[instrument(skip(self), err)]
    pub async fn redispatch_ready(&self, consumer: &str) -> LifecycleResult<usize> {
        self.ensure_open()?;

        let stream = LifecycleStream::Retry;
        let count = self.inner.config.read_count;
        let claimed = self
            .claim_stale_entries(
                stream,
                TASK_PROCESSORS_GROUP,
                consumer,
                self.inner.config.retry_claim_idle,
                count,
            )
            .await?;
        if !claimed.is_empty() {
            info!(consumer, claimed = claimed.len(), "took over stale retry entries");
        }

        // Claimed entries now belong to this consumer and come back with
        // its pending read.
        let pending = ReadGroupRequest::new(stream.key(), TASK_PROCESSORS_GROUP, consumer, count).pending();
        let fresh = ReadGroupRequest::new(stream.key(), TASK_PROCESSORS_GROUP, consumer, count);
        let mut entries = self.read_group_restoring(stream, &pending).await?;
        entries.extend(self.read_group_restoring(stream, &fresh).await?);
        self.count_read(stream, entries.len());

        let now = Utc::now();
        let mut redispatched = 0;
        for entry in entries {
            let mut task = match decode(&entry) {
                Some(Ok(task)) => task,
                Some(Err(e)) => {
                    warn!(entry_id = %entry.id, error = %e, "dropping malformed retry entry");
                    self.discard_retry_entry(entry.id).await;
                    continue;
                }
                None => {
                    if let Err(e) = self.inner.client.ack(stream.key(), TASK_PROCESSORS_GROUP, &[entry.id]).await {
                        warn!(entry_id = %entry.id, error = %e, "failed to acknowledge seed entry");
                    }
                    continue;
                }
            };
            if !task.is_due(now) {
                continue;
            }

            task.mark_dispatched(now);
            let entry_id = self.enqueue_record(&mut task).await?;
            self.discard_retry_entry(entry.id).await;

            info!(
                task_id = %task.task_id,
                retry_count = task.retry_count,
                entry_id = %entry_id,
                "task re-dispatched"
            );
            redispatched += 1;
        }
        Ok(redispatched)
    }

    async fn discard_retry_entry(&self, entry_id: EntryId) {
        let key = LifecycleStream::Retry.key();
        if let Err(e) = self.inner.client.ack(key, TASK_PROCESSORS_GROUP, &[entry_id]).await {
            warn!(entry_id = %entry_id, error = %e, "failed to acknowledge retry entry");
        }
        if let Err(e) = self.inner.client.delete_entries(key, &[entry_id]).await {
            warn!(entry_id = %entry_id, error = %e, "failed to delete retry entry");
        }
    }

    // -- consumer groups ------------------------------------------------

    /// Blocking group read of at most `count` tasks. Seed entries are
    /// acknowledged and skipped.
    #[instrument(skip(self), fields(stream = %stream), err)]
    pub async fn read_tasks(
        &self,
        stream: LifecycleStream,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> LifecycleResult<Vec<LocatedTask>> {
        self.ensure_open()?;

        let request = ReadGroupRequest::new(stream.key(), group, consumer, count)
            .blocking(self.inner.config.read_block);
        let result = self.read_group_restoring(stream, &request).await;
        if result.is_err() {
            self.inner
                .metrics
                .increment(Counter::TasksRead, stream.name(), Outcome::Failure);
        }
        let entries = result?;

        let (tasks, skipped) = self.decode_entries(stream, entries);
        self.count_read(stream, tasks.len());
        if !skipped.is_empty() {
            self.inner.client.ack(stream.key(), group, &skipped).await?;
        }
        Ok(tasks)
    }

    /// Acknowledge one entry for `group`. Returns whether it was pending.
    #[instrument(skip(self), fields(stream = %stream), err)]
    pub async fn acknowledge(
        &self,
        stream: LifecycleStream,
        group: &str,
        entry_id: EntryId,
    ) -> LifecycleResult<bool> {
        self.ensure_open()?;
        let result = self.inner.client.ack(stream.key(), group, &[entry_id]).await;
        let outcome = match &result {
            Ok(0) => Outcome::Empty,
            Ok(_) => Outcome::Success,
            Err(_) => Outcome::Failure,
        };
        self.inner
            .metrics
            .increment(Counter::TasksAcknowledged, stream.name(), outcome);
        Ok(result? > 0)
    }

    /// Pending summary of every known (stream, group) pair. Groups missing
    /// from the store are skipped.
    pub async fn pending_info(&self) -> LifecycleResult<Vec<PendingGroupInfo>> {
        self.ensure_open()?;

        let mut infos = Vec::new();
        for stream in LifecycleStream::ALL {
            for group in self.groups_for(stream).await {
                match self.inner.client.pending_summary(stream.key(), &group).await {
                    Ok(summary) => {
                        self.inner.metrics.gauge(
                            Gauge::PendingEntries,
                            &format!("{}:{}", stream.name(), group),
                            summary.count as f64,
                        );
                        infos.push(PendingGroupInfo {
                            stream,
                            group,
                            summary,
                        });
                    }
                    Err(e) if is_missing_group(&e) => {
                        warn!(stream = %stream, group = %group, "consumer group missing");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(infos)
    }

    /// Acknowledge pending entries idle longer than `idle_threshold`, up to
    /// a fixed batch per group. Returns how many were acknowledged.
    ///
    /// `retry` entries of the processors group are never acknowledged here.
    #[instrument(skip(self), err)]
    pub async fn cleanup_pending(&self, idle_threshold: Duration) -> LifecycleResult<usize> {
        self.ensure_open()?;

        let mut cleaned = 0usize;
        for stream in LifecycleStream::ALL {
            for group in self.groups_for(stream).await {
                // Staged retries stay pending until re-dispatched or claimed.
                if stream == LifecycleStream::Retry && group == TASK_PROCESSORS_GROUP {
                    continue;
                }
                let pending = match self
                    .inner
                    .client
                    .pending_entries(stream.key(), &group, CLEANUP_BATCH)
                    .await
                {
                    Ok(pending) => pending,
                    Err(e) if is_missing_group(&e) => continue,
                    Err(e) => return Err(e.into()),
                };

                let stale: Vec<EntryId> = pending
                    .iter()
                    .filter(|p| p.idle >= idle_threshold)
                    .map(|p| p.id)
                    .collect();
                if stale.is_empty() {
                    continue;
                }

                let acked = self.inner.client.ack(stream.key(), &group, &stale).await?;
                info!(stream = %stream, group = %group, acked, "acknowledged stale pending entries");
                cleaned += usize::try_from(acked).unwrap_or(usize::MAX);
            }
        }
        Ok(cleaned)
    }

    /// Take over entries other consumers left pending for at least
    /// `min_idle`.
    #[instrument(skip(self), fields(stream = %stream), err)]
    pub async fn claim_stale(
        &self,
        stream: LifecycleStream,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> LifecycleResult<Vec<LocatedTask>> {
        self.ensure_open()?;

        let claimed = self
            .claim_stale_entries(stream, group, consumer, min_idle, count)
            .await?;
        let (tasks, skipped) = self.decode_entries(stream, claimed);
        if !skipped.is_empty() {
            self.inner.client.ack(stream.key(), group, &skipped).await?;
        }
        if !tasks.is_empty() {
            info!(stream = %stream, group, consumer, claimed = tasks.len(), "claimed stale entries");
        }
        Ok(tasks)
    }

    /// Claim up to `count` entries of other consumers idle for `min_idle`.
    /// A missing group is recreated and yields nothing.
    async fn claim_stale_entries(
        &self,
        stream: LifecycleStream,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> LifecycleResult<Vec<StreamEntry>> {
        let pending = match self
            .inner
            .client
            .pending_entries(stream.key(), group, count.max(CLEANUP_BATCH))
            .await
        {
            Ok(pending) => pending,
            Err(e) if is_missing_group(&e) => {
                self.restore_groups(stream).await?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let ids: Vec<EntryId> = pending
            .iter()
            .filter(|p| p.consumer != consumer && p.idle >= min_idle)
            .map(|p| p.id)
            .take(count)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        Ok(self
            .inner
            .client
            .claim(stream.key(), group, consumer, min_idle, &ids)
            .await?)
    }

    /// Split entries into tasks and ids to acknowledge without processing
    /// (seed and malformed entries).
    fn decode_entries(
        &self,
        stream: LifecycleStream,
        entries: Vec<StreamEntry>,
    ) -> (Vec<LocatedTask>, Vec<EntryId>) {
        let mut tasks = Vec::with_capacity(entries.len());
        let mut skipped = Vec::new();
        for entry in entries {
            match decode(&entry) {
                Some(Ok(task)) => tasks.push(LocatedTask {
                    stream,
                    entry_id: entry.id,
                    task,
                }),
                Some(Err(e)) => {
                    warn!(stream = %stream, entry_id = %entry.id, error = %e, "skipping malformed entry");
                    skipped.push(entry.id);
                }
                None => skipped.push(entry.id),
            }
        }
        (tasks, skipped)
    }

    fn count_read(&self, stream: LifecycleStream, read: usize) {
        let outcome = if read == 0 {
            Outcome::Empty
        } else {
            Outcome::Success
        };
        self.inner
            .metrics
            .increment(Counter::TasksRead, stream.name(), outcome);
    }

    // -- timeouts -------------------------------------------------------

    /// Fail every dispatched task whose deadline is at or before `now`.
    ///
    /// Expired ids no longer in `dispatched` are dropped. Every processed id
    /// leaves the timeout set in one batch; ids that hit a store error stay
    /// for the next pass.
    #[instrument(skip(self), err)]
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> LifecycleResult<TimeoutSweep> {
        self.ensure_open()?;

        let expired = self.inner.expirations.get_expired(now).await?;
        let mut sweep = TimeoutSweep {
            expired: expired.len(),
            ..TimeoutSweep::default()
        };
        let mut processed = Vec::with_capacity(expired.len());

        for task_id in expired {
            let located = match self.find_by_id(task_id).await {
                Ok(located) => located,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "timeout lookup failed");
                    continue;
                }
            };

            match located {
                Some(located) if located.stream == LifecycleStream::Dispatched => {
                    let outcome = self
                        .finish_located(
                            located,
                            LifecycleStream::Failed,
                            |task| task.mark_failed(TIMEOUT_REASON, now),
                            false,
                        )
                        .await;
                    match outcome {
                        Ok(TransitionOutcome::Moved { .. }) => {
                            warn!(task_id = %task_id, "task timed out");
                            sweep.moved += 1;
                        }
                        Ok(TransitionOutcome::AlreadyProcessed) => sweep.missing += 1,
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "failed to time out task");
                            continue;
                        }
                    }
                }
                _ => sweep.missing += 1,
            }
            processed.push(task_id);
        }

        if let Err(e) = self.inner.expirations.remove_deadlines(&processed).await {
            warn!(count = processed.len(), error = %e, "failed to remove processed deadlines");
        }
        if sweep.expired > 0 {
            info!(
                expired = sweep.expired,
                moved = sweep.moved,
                missing = sweep.missing,
                "timeout sweep finished"
            );
        }
        Ok(sweep)
    }

    // -- monitoring -----------------------------------------------------

    /// Length and TTL of every stream. Publishes stream length gauges.
    pub async fn stream_info(&self) -> LifecycleResult<StreamInfo> {
        self.ensure_open()?;

        let mut streams = Vec::with_capacity(LifecycleStream::ALL.len());
        let mut consumer_groups = 0;
        for stream in LifecycleStream::ALL {
            let length = self.inner.client.len(stream.key()).await?;
            let ttl = self.inner.client.ttl(stream.key()).await?;
            self.inner
                .metrics
                .gauge(Gauge::StreamLength, stream.name(), length as f64);
            consumer_groups += self.groups_for(stream).await.len();
            streams.push(StreamStats {
                stream,
                length,
                ttl,
            });
        }

        Ok(StreamInfo {
            streams,
            max_length: self.inner.config.max_stream_length,
            consumer_groups,
        })
    }

    /// Stream lengths and pending counts, with a warning for each threshold
    /// crossed. `failed` is exempt from the length check.
    pub async fn check_stream_health(&self) -> LifecycleResult<StreamHealthReport> {
        let info = self.stream_info().await?;
        let pending = self.pending_info().await?;
        let config = &self.inner.config;

        let mut warnings = Vec::new();
        for stats in &info.streams {
            debug!(stream = %stats.stream, length = stats.length, "stream length");
            if stats.stream != LifecycleStream::Failed
                && stats.length > config.length_warning_threshold
            {
                warn!(
                    stream = %stats.stream,
                    length = stats.length,
                    threshold = config.length_warning_threshold,
                    "stream is backing up"
                );
                warnings.push(format!(
                    "{} holds {} entries (threshold {})",
                    stats.stream, stats.length, config.length_warning_threshold
                ));
            }
        }
        for group in &pending {
            if group.summary.count > config.pending_warning_threshold {
                warn!(
                    stream = %group.stream,
                    group = %group.group,
                    pending = group.summary.count,
                    "consumer group has many pending entries"
                );
                warnings.push(format!(
                    "{}/{} has {} pending entries (threshold {})",
                    group.stream, group.group, group.summary.count, config.pending_warning_threshold
                ));
            }
        }

        Ok(StreamHealthReport {
            info,
            pending,
            warnings,
        })
    }

    // -- workers --------------------------------------------------------

    /// Start the background workers. Returns `false` if they already run.
    pub fn spawn_workers(
        &self,
        confirmations: Option<Arc<dyn ConfirmationSource>>,
    ) -> LifecycleResult<bool> {
        self.ensure_open()?;
        let mut slot = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(false);
        }
        let set = workers::spawn_all(self, confirmations);
        info!(workers = set.len(), "lifecycle workers started");
        *slot = Some(set);
        Ok(true)
    }

    pub fn workers_running(&self) -> bool {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop the workers (waiting at most `timeout`), then close the store
    /// client. Later calls return immediately.
    pub async fn close(&self, timeout: Duration) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let set = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(set) = set {
            let aborted = set.shutdown(timeout).await;
            if aborted > 0 {
                warn!(aborted, "lifecycle workers did not stop in time");
            }
        }

        self.inner.client.close().await;
        info!("task lifecycle manager closed");
    }
}

fn encode(task: &TaskRecord) -> DomainResult<Fields> {
    Ok(vec![
        (FIELD_TASK.to_string(), task.to_json()?),
        (FIELD_TASK_ID.to_string(), task.task_id.to_string()),
        (FIELD_CREATED_AT.to_string(), task.created_at.to_rfc3339()),
    ])
}

/// `None` for entries without a task (stream seed entries).
fn decode(entry: &StreamEntry) -> Option<DomainResult<TaskRecord>> {
    entry.field(FIELD_TASK).map(TaskRecord::from_json)
}

fn is_missing_group(error: &StoreError) -> bool {
    match error {
        StoreError::Command(msg) => msg.contains("NOGROUP"),
        StoreError::RetriesExhausted { source, .. } => is_missing_group(source),
        _ => false,
    }
}
