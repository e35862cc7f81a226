//! Task id → current stream entry.
//!
//! One hash field per live task, holding the stream and entry id as JSON. The
//! hash TTL is refreshed on every write and always outlives the streams, so a
//! lost cleanup leaves at worst a dangling pointer that the lookup path
//! detects and falls back from.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use taskrelay_core::{EntryId, LifecycleStream, TaskId};
use taskrelay_infra::ResilientStoreClient;
use taskrelay_observability::{Counter, MetricsSink, Outcome};

use crate::error::LifecycleResult;

/// Hash holding the index.
pub const INDEX_KEY: &str = "task_id_to_message_id";

/// Where a task currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub stream: LifecycleStream,
    pub entry_id: EntryId,
}

#[derive(Debug, Clone)]
pub struct TaskIndex {
    client: ResilientStoreClient,
    ttl: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl TaskIndex {
    pub fn new(client: ResilientStoreClient, ttl: Duration, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            client,
            ttl,
            metrics,
        }
    }

    /// Point `task_id` at `entry_id` in `stream`, replacing any previous entry.
    pub async fn store(
        &self,
        task_id: TaskId,
        stream: LifecycleStream,
        entry_id: EntryId,
    ) -> LifecycleResult<()> {
        let value = serde_json::to_string(&IndexEntry { stream, entry_id })
            .map_err(|e| taskrelay_core::DomainError::malformed(e.to_string()))?;

        let result = self
            .client
            .hset(INDEX_KEY, &task_id.to_string(), &value)
            .await;
        self.metrics
            .increment(Counter::IndexOperations, "store", Outcome::from_result(&result));
        result?;

        if let Err(e) = self.client.expire(INDEX_KEY, self.ttl).await {
            warn!(task_id = %task_id, error = %e, "failed to refresh task index TTL");
        }
        Ok(())
    }

    /// Current location of `task_id`, if indexed.
    ///
    /// An unparseable value is logged and treated as a miss.
    pub async fn get(&self, task_id: TaskId) -> LifecycleResult<Option<IndexEntry>> {
        let raw = match self.client.hget(INDEX_KEY, &task_id.to_string()).await {
            Ok(raw) => raw,
            Err(e) => {
                self.metrics
                    .increment(Counter::IndexOperations, "get", Outcome::Failure);
                return Err(e.into());
            }
        };

        let Some(raw) = raw else {
            self.metrics
                .increment(Counter::IndexOperations, "get", Outcome::Empty);
            return Ok(None);
        };

        match serde_json::from_str::<IndexEntry>(&raw) {
            Ok(entry) => {
                self.metrics
                    .increment(Counter::IndexOperations, "get", Outcome::Success);
                Ok(Some(entry))
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "ignoring malformed task index entry");
                self.metrics
                    .increment(Counter::IndexOperations, "get", Outcome::Failure);
                Ok(None)
            }
        }
    }

    /// Drop the entry for `task_id`. Returns whether one existed.
    pub async fn remove(&self, task_id: TaskId) -> LifecycleResult<bool> {
        let result = self.client.hdel(INDEX_KEY, &task_id.to_string()).await;
        self.metrics
            .increment(Counter::IndexOperations, "remove", Outcome::from_result(&result));
        Ok(result?)
    }

    /// Drop the entry for `task_id` only while it still points at `entry_id`
    /// in `stream`. A concurrent re-index is left untouched.
    pub async fn remove_if_points_to(
        &self,
        task_id: TaskId,
        stream: LifecycleStream,
        entry_id: EntryId,
    ) -> LifecycleResult<bool> {
        let expected = serde_json::to_string(&IndexEntry { stream, entry_id })
            .map_err(|e| taskrelay_core::DomainError::malformed(e.to_string()))?;
        let result = self
            .client
            .hdel_if_eq(INDEX_KEY, &task_id.to_string(), &expected)
            .await;
        self.metrics
            .increment(Counter::IndexOperations, "remove", Outcome::from_result(&result));
        Ok(result?)
    }
}
