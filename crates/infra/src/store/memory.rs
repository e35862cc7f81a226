//! In-memory store backend for tests/dev.
//!
//! Emulates the subset of Redis semantics the lifecycle engine relies on:
//! stream ids, consumer groups with pending-entry lists, approximate trimming,
//! key expiry, sorted sets and hashes. Everything happens under one mutex, so
//! every call is atomic just like a server-side script.
//!
//! Outages can be simulated with [`InMemoryBackend::set_available`] and
//! individual failures injected with [`InMemoryBackend::fail_next`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use taskrelay_core::EntryId;

use super::{
    Fields, GroupCreation, MoveEntry, PendingEntry, PendingSummary, ReadGroupRequest, ReadStart,
    StoreBackend, StoreError, StoreResult, StreamEntry,
};

const MAX_ENTRY_ID: EntryId = EntryId::new(u64::MAX, u64::MAX);

#[derive(Debug, Clone)]
struct PendingMeta {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Debug)]
struct MemGroup {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingMeta>,
}

#[derive(Debug)]
struct MemStream {
    entries: BTreeMap<EntryId, Fields>,
    last_id: EntryId,
    groups: HashMap<String, MemGroup>,
}

impl Default for MemStream {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            last_id: EntryId::MIN,
            groups: HashMap::new(),
        }
    }
}

impl MemStream {
    fn append(&mut self, fields: Fields, max_len: Option<usize>) -> EntryId {
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let id = if now_ms > self.last_id.millis() {
            EntryId::new(now_ms, 0)
        } else {
            self.last_id.successor()
        };

        self.entries.insert(id, fields);
        self.last_id = id;

        if let Some(max_len) = max_len {
            while self.entries.len() > max_len {
                self.entries.pop_first();
            }
        }
        id
    }

    fn entry(&self, id: &EntryId) -> Option<StreamEntry> {
        self.entries.get(id).map(|fields| to_entry(*id, fields))
    }
}

fn to_entry(id: EntryId, fields: &Fields) -> StreamEntry {
    StreamEntry {
        id,
        fields: fields.iter().cloned().collect(),
    }
}

fn no_group(stream: &str, group: &str) -> StoreError {
    StoreError::command(format!(
        "NOGROUP No such key '{}' or consumer group '{}'",
        stream, group
    ))
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::command(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value ({})",
        key
    ))
}

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    streams: HashMap<String, MemStream>,
    expiries: HashMap<String, Instant>,
}

impl State {
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            self.remove_key(&key);
        }
    }

    fn exists(&self, key: &str) -> bool {
        self.kind_of(key).is_some()
    }

    fn remove_key(&mut self, key: &str) -> bool {
        self.expiries.remove(key);
        self.strings.remove(key).is_some()
            | self.hashes.remove(key).is_some()
            | self.zsets.remove(key).is_some()
            | self.streams.remove(key).is_some()
    }

    fn kind_of(&self, key: &str) -> Option<KeyKind> {
        if self.strings.contains_key(key) {
            Some(KeyKind::String)
        } else if self.hashes.contains_key(key) {
            Some(KeyKind::Hash)
        } else if self.zsets.contains_key(key) {
            Some(KeyKind::ZSet)
        } else if self.streams.contains_key(key) {
            Some(KeyKind::Stream)
        } else {
            None
        }
    }

    fn ensure_free_for(&self, key: &str, kind: KeyKind) -> StoreResult<()> {
        match self.kind_of(key) {
            Some(held) if held != kind => Err(wrong_type(key)),
            _ => Ok(()),
        }
    }

    fn stream_mut(&mut self, key: &str) -> StoreResult<&mut MemStream> {
        self.ensure_free_for(key, KeyKind::Stream)?;
        Ok(self.streams.entry(key.to_string()).or_default())
    }

    fn group_mut(
        &mut self,
        stream: &str,
        group: &str,
    ) -> StoreResult<(&mut MemGroup, &BTreeMap<EntryId, Fields>)> {
        let mem = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let MemStream { entries, groups, .. } = mem;
        let group_state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        Ok((group_state, entries))
    }

    fn drop_empty_zset(&mut self, key: &str) {
        if self.zsets.get(key).is_some_and(|set| set.is_empty()) {
            self.zsets.remove(key);
            self.expiries.remove(key);
        }
    }

    fn drop_empty_hash(&mut self, key: &str) {
        if self.hashes.get(key).is_some_and(|hash| hash.is_empty()) {
            self.hashes.remove(key);
            self.expiries.remove(key);
        }
    }

    fn read_group(&mut self, request: &ReadGroupRequest, now: Instant) -> StoreResult<Vec<StreamEntry>> {
        let count = request.count.max(1);
        let (group, entries) = self.group_mut(&request.stream, &request.group)?;

        match request.start {
            ReadStart::New => {
                let delivered: Vec<StreamEntry> = entries
                    .range(group.last_delivered.successor()..)
                    .take(count)
                    .map(|(id, fields)| to_entry(*id, fields))
                    .collect();

                for entry in &delivered {
                    group.pending.insert(
                        entry.id,
                        PendingMeta {
                            consumer: request.consumer.clone(),
                            delivered_at: now,
                            deliveries: 1,
                        },
                    );
                    group.last_delivered = entry.id;
                }
                Ok(delivered)
            }
            ReadStart::Pending => {
                // Re-reading history counts as a delivery.
                let mut delivered = Vec::new();
                for (id, meta) in group.pending.iter_mut() {
                    if delivered.len() == count {
                        break;
                    }
                    if meta.consumer != request.consumer {
                        continue;
                    }
                    let Some(fields) = entries.get(id) else {
                        continue;
                    };
                    meta.delivered_at = now;
                    meta.deliveries += 1;
                    delivered.push(to_entry(*id, fields));
                }
                Ok(delivered)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    String,
    Hash,
    ZSet,
    Stream,
}

/// Single-process store emulation.
#[derive(Debug)]
pub struct InMemoryBackend {
    state: Mutex<State>,
    appended: Notify,
    available: AtomicBool,
    failures: Mutex<VecDeque<StoreError>>,
    reconnects: AtomicU64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            appended: Notify::new(),
            available: AtomicBool::new(true),
            failures: Mutex::new(VecDeque::new()),
            reconnects: AtomicU64::new(0),
        }
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (`false`) or its end (`true`).
    ///
    /// While unavailable every call fails with a "connection refused" error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Make the next call fail with `error`.
    pub fn fail_next(&self, error: StoreError) {
        self.failures_lock().push_back(error);
    }

    /// Make the next `n` calls fail with `error`.
    pub fn fail_next_n(&self, n: usize, error: StoreError) {
        let mut failures = self.failures_lock();
        failures.extend(std::iter::repeat_n(error, n));
    }

    /// Number of successful `reconnect` calls.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        if !self.is_available() {
            return Err(StoreError::connection("connection refused"));
        }
        match self.failures_lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.check()?;
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.purge_expired(Instant::now());
        Ok(guard)
    }

    fn failures_lock(&self) -> MutexGuard<'_, VecDeque<StoreError>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StoreBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }

    async fn reconnect(&self) -> StoreResult<()> {
        if !self.is_available() {
            return Err(StoreError::connection("connection refused"));
        }
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let state = self.state()?;
        state.ensure_free_for(key, KeyKind::String)?;
        Ok(state.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut state = self.state()?;
        state.ensure_free_for(key, KeyKind::String)?;
        state.strings.insert(key.to_string(), value.to_string());
        match ttl {
            Some(ttl) => state.expiries.insert(key.to_string(), Instant::now() + ttl),
            None => state.expiries.remove(key),
        };
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state()?;
        if state.exists(key) {
            return Ok(false);
        }
        state.strings.insert(key.to_string(), value.to_string());
        state.expiries.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        Ok(self.state()?.remove_key(key))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut state = self.state()?;
        if state.strings.get(key).map(String::as_str) == Some(expected) {
            state.remove_key(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state()?;
        if !state.exists(key) {
            return Ok(false);
        }
        state.expiries.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let state = self.state()?;
        if !state.exists(key) {
            return Ok(None);
        }
        let now = Instant::now();
        Ok(state.expiries.get(key).map(|at| at.saturating_duration_since(now)))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut state = self.state()?;
        state.ensure_free_for(key, KeyKind::Hash)?;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let state = self.state()?;
        state.ensure_free_for(key, KeyKind::Hash)?;
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut state = self.state()?;
        state.ensure_free_for(key, KeyKind::Hash)?;
        let removed = state
            .hashes
            .get_mut(key)
            .is_some_and(|h| h.remove(field).is_some());
        state.drop_empty_hash(key);
        Ok(removed)
    }

    async fn hdel_if_eq(&self, key: &str, field: &str, expected: &str) -> StoreResult<bool> {
        let mut state = self.state()?;
        state.ensure_free_for(key, KeyKind::Hash)?;
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(false);
        };
        if hash.get(field).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        hash.remove(field);
        state.drop_empty_hash(key);
        Ok(true)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut state = self.state()?;
        state.ensure_free_for(key, KeyKind::ZSet)?;
        state
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        let state = self.state()?;
        state.ensure_free_for(key, KeyKind::ZSet)?;
        let Some(set) = state.zsets.get(key) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<(&String, f64)> = set
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (member, *score))
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(hits.into_iter().map(|(member, _)| member.clone()).collect())
    }

    async fn zrem(&self, key: &str, members: &[String]) -> StoreResult<u64> {
        let mut state = self.state()?;
        state.ensure_free_for(key, KeyKind::ZSet)?;
        let removed = match state.zsets.get_mut(key) {
            Some(set) => members.iter().filter(|m| set.remove(m.as_str()).is_some()).count() as u64,
            None => 0,
        };
        state.drop_empty_zset(key);
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let state = self.state()?;
        state.ensure_free_for(key, KeyKind::ZSet)?;
        Ok(state.zsets.get(key).map_or(0, |set| set.len() as u64))
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let state = self.state()?;
        state.ensure_free_for(key, KeyKind::ZSet)?;
        Ok(state.zsets.get(key).map_or(0, |set| {
            set.values().filter(|s| **s >= min && **s <= max).count() as u64
        }))
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        let state = self.state()?;
        state.ensure_free_for(key, KeyKind::ZSet)?;
        Ok(state.zsets.get(key).and_then(|set| set.get(member)).copied())
    }

    async fn create_stream_if_absent(&self, stream: &str, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state()?;
        if state.exists(stream) {
            return Ok(false);
        }
        let mem = state.stream_mut(stream)?;
        mem.append(vec![("init".to_string(), "1".to_string())], None);
        state.expiries.insert(stream.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn create_group(&self, stream: &str, group: &str) -> StoreResult<GroupCreation> {
        let mut state = self.state()?;
        let mem = state.stream_mut(stream)?;
        if mem.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }
        mem.groups.insert(
            group.to_string(),
            MemGroup {
                last_delivered: EntryId::MIN,
                pending: BTreeMap::new(),
            },
        );
        Ok(GroupCreation::Created)
    }

    async fn xadd(&self, stream: &str, fields: &Fields, max_len: Option<usize>) -> StoreResult<EntryId> {
        let id = {
            let mut state = self.state()?;
            state.stream_mut(stream)?.append(fields.clone(), max_len)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn xlen(&self, stream: &str) -> StoreResult<u64> {
        let state = self.state()?;
        state.ensure_free_for(stream, KeyKind::Stream)?;
        Ok(state.streams.get(stream).map_or(0, |s| s.entries.len() as u64))
    }

    async fn xrange(
        &self,
        stream: &str,
        start: Option<EntryId>,
        end: Option<EntryId>,
        count: Option<usize>,
    ) -> StoreResult<Vec<StreamEntry>> {
        let state = self.state()?;
        state.ensure_free_for(stream, KeyKind::Stream)?;
        let start = start.unwrap_or(EntryId::MIN);
        let end = end.unwrap_or(MAX_ENTRY_ID);
        let Some(mem) = state.streams.get(stream) else {
            return Ok(Vec::new());
        };
        if start > end {
            return Ok(Vec::new());
        }

        Ok(mem
            .entries
            .range(start..=end)
            .take(count.unwrap_or(usize::MAX))
            .map(|(id, fields)| to_entry(*id, fields))
            .collect())
    }

    async fn xrevrange(&self, stream: &str, count: usize) -> StoreResult<Vec<StreamEntry>> {
        let state = self.state()?;
        state.ensure_free_for(stream, KeyKind::Stream)?;
        Ok(state.streams.get(stream).map_or_else(Vec::new, |mem| {
            mem.entries
                .iter()
                .rev()
                .take(count)
                .map(|(id, fields)| to_entry(*id, fields))
                .collect()
        }))
    }

    async fn xread_group(&self, request: &ReadGroupRequest) -> StoreResult<Vec<StreamEntry>> {
        let deadline = request.block.map(|block| Instant::now() + block);

        loop {
            // Registered before reading so an append in between still wakes us.
            let appended = self.appended.notified();
            {
                let mut state = self.state()?;
                let entries = state.read_group(request, Instant::now())?;
                if !entries.is_empty() || request.start == ReadStart::Pending {
                    return Ok(entries);
                }
            }

            let Some(deadline) = deadline else {
                return Ok(Vec::new());
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, appended).await;
        }
    }

    async fn xack(&self, stream: &str, group: &str, ids: &[EntryId]) -> StoreResult<u64> {
        let mut state = self.state()?;
        let (group, _) = state.group_mut(stream, group)?;
        Ok(ids.iter().filter(|id| group.pending.remove(id).is_some()).count() as u64)
    }

    async fn xdel(&self, stream: &str, ids: &[EntryId]) -> StoreResult<u64> {
        let mut state = self.state()?;
        state.ensure_free_for(stream, KeyKind::Stream)?;
        let Some(mem) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| mem.entries.remove(id).is_some()).count() as u64)
    }

    async fn xpending(&self, stream: &str, group: &str) -> StoreResult<PendingSummary> {
        let mut state = self.state()?;
        let (group, _) = state.group_mut(stream, group)?;

        let mut per_consumer: BTreeMap<String, u64> = BTreeMap::new();
        for meta in group.pending.values() {
            *per_consumer.entry(meta.consumer.clone()).or_insert(0) += 1;
        }

        Ok(PendingSummary {
            count: group.pending.len() as u64,
            lowest: group.pending.keys().next().copied(),
            highest: group.pending.keys().next_back().copied(),
            consumers: per_consumer.into_iter().collect(),
        })
    }

    async fn xpending_entries(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> StoreResult<Vec<PendingEntry>> {
        let mut state = self.state()?;
        let now = Instant::now();
        let (group, _) = state.group_mut(stream, group)?;
        Ok(group
            .pending
            .iter()
            .take(count)
            .map(|(id, meta)| PendingEntry {
                id: *id,
                consumer: meta.consumer.clone(),
                idle: now.saturating_duration_since(meta.delivered_at),
                deliveries: meta.deliveries,
            })
            .collect())
    }

    async fn xclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut state = self.state()?;
        let now = Instant::now();
        let (group, entries) = state.group_mut(stream, group)?;

        let mut claimed = Vec::new();
        for id in ids {
            let Some(meta) = group.pending.get_mut(id) else {
                continue;
            };
            if now.saturating_duration_since(meta.delivered_at) < min_idle {
                continue;
            }
            match entries.get(id) {
                Some(fields) => {
                    meta.consumer = consumer.to_string();
                    meta.delivered_at = now;
                    meta.deliveries += 1;
                    claimed.push(to_entry(*id, fields));
                }
                // Deleted entries are dropped from the pending list.
                None => {
                    group.pending.remove(id);
                }
            }
        }
        Ok(claimed)
    }

    async fn move_entry(&self, request: &MoveEntry) -> StoreResult<Option<EntryId>> {
        let id = {
            let mut state = self.state()?;
            state.ensure_free_for(&request.to, KeyKind::Stream)?;

            let Some(source) = state.streams.get_mut(&request.from) else {
                return Ok(None);
            };
            if source.entry(&request.entry_id).is_none() {
                return Ok(None);
            }
            for group in &request.ack_groups {
                if let Some(g) = source.groups.get_mut(group) {
                    g.pending.remove(&request.entry_id);
                }
            }
            source.entries.remove(&request.entry_id);

            let id = state
                .stream_mut(&request.to)?
                .append(request.fields.clone(), Some(request.max_len));
            state
                .expiries
                .insert(request.to.clone(), Instant::now() + request.ttl);
            id
        };
        self.appended.notify_waiters();
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn stream_ids_are_strictly_increasing() {
        let backend = InMemoryBackend::new();
        let mut last = EntryId::MIN;
        for i in 0..50 {
            let id = backend
                .xadd("s", &fields(&[("n", &i.to_string())]), None)
                .await
                .unwrap();
            assert!(id > last);
            last = id;
        }
        assert_eq!(backend.xlen("s").await.unwrap(), 50);
    }

    #[tokio::test]
    async fn max_len_trims_oldest_entries() {
        let backend = InMemoryBackend::new();
        for i in 0..10 {
            backend
                .xadd("s", &fields(&[("n", &i.to_string())]), Some(3))
                .await
                .unwrap();
        }
        let entries = backend.xrange("s", None, None, None).await.unwrap();
        let values: Vec<&str> = entries.iter().map(|e| e.field("n").unwrap()).collect();
        assert_eq!(values, vec!["7", "8", "9"]);
    }

    #[tokio::test]
    async fn group_read_tracks_pending_until_ack() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.create_group("s", "g").await.unwrap(), GroupCreation::Created);
        assert_eq!(backend.create_group("s", "g").await.unwrap(), GroupCreation::AlreadyExists);

        let id = backend.xadd("s", &fields(&[("k", "v")]), None).await.unwrap();
        let read = backend
            .xread_group(&ReadGroupRequest::new("s", "g", "c1", 10))
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].id, id);

        // Nothing new for the group, but c1 still owns the entry.
        let again = backend
            .xread_group(&ReadGroupRequest::new("s", "g", "c1", 10))
            .await
            .unwrap();
        assert!(again.is_empty());
        let pending = backend
            .xread_group(&ReadGroupRequest::new("s", "g", "c1", 10).pending())
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        let summary = backend.xpending("s", "g").await.unwrap();
        assert_eq!(summary.count, 1);
        assert_eq!(summary.consumers, vec![("c1".to_string(), 1)]);

        assert_eq!(backend.xack("s", "g", &[id]).await.unwrap(), 1);
        assert_eq!(backend.xack("s", "g", &[id]).await.unwrap(), 0);
        assert_eq!(backend.xpending("s", "g").await.unwrap().count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_read_wakes_on_append() {
        let backend = std::sync::Arc::new(InMemoryBackend::new());
        backend.create_group("s", "g").await.unwrap();

        let reader = {
            let backend = backend.clone();
            tokio::spawn(async move {
                backend
                    .xread_group(&ReadGroupRequest::new("s", "g", "c", 1).blocking(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        backend.xadd("s", &fields(&[("k", "v")]), None).await.unwrap();

        let read = reader.await.unwrap().unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn claim_transfers_idle_entries() {
        let backend = InMemoryBackend::new();
        backend.create_group("s", "g").await.unwrap();
        let id = backend.xadd("s", &fields(&[("k", "v")]), None).await.unwrap();
        backend
            .xread_group(&ReadGroupRequest::new("s", "g", "dead", 1))
            .await
            .unwrap();

        let early = backend
            .xclaim("s", "g", "alive", Duration::from_secs(60), &[id])
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        let claimed = backend
            .xclaim("s", "g", "alive", Duration::from_secs(60), &[id])
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let pending = backend.xpending_entries("s", "g", 10).await.unwrap();
        assert_eq!(pending[0].consumer, "alive");
        assert_eq!(pending[0].deliveries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_reread_counts_as_delivery() {
        let backend = InMemoryBackend::new();
        backend.create_group("s", "g").await.unwrap();
        let id = backend.xadd("s", &fields(&[("k", "v")]), None).await.unwrap();
        backend
            .xread_group(&ReadGroupRequest::new("s", "g", "c1", 1))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        let reread = backend
            .xread_group(&ReadGroupRequest::new("s", "g", "c1", 10).pending())
            .await
            .unwrap();
        assert_eq!(reread[0].id, id);

        let pending = backend.xpending_entries("s", "g", 10).await.unwrap();
        assert_eq!(pending[0].idle, Duration::ZERO);
        assert_eq!(pending[0].deliveries, 2);

        // Only the owner's re-read refreshes the entry.
        tokio::time::advance(Duration::from_secs(30)).await;
        backend
            .xread_group(&ReadGroupRequest::new("s", "g", "c2", 10).pending())
            .await
            .unwrap();
        let pending = backend.xpending_entries("s", "g", 10).await.unwrap();
        assert_eq!(pending[0].idle, Duration::from_secs(30));
        assert_eq!(pending[0].deliveries, 2);
    }

    #[tokio::test]
    async fn move_entry_happens_once() {
        let backend = InMemoryBackend::new();
        backend.create_group("from", "g").await.unwrap();
        let id = backend.xadd("from", &fields(&[("task", "1")]), None).await.unwrap();
        backend
            .xread_group(&ReadGroupRequest::new("from", "g", "c", 1))
            .await
            .unwrap();

        let request = MoveEntry {
            from: "from".into(),
            to: "to".into(),
            entry_id: id,
            ack_groups: vec!["g".into(), "missing".into()],
            fields: fields(&[("task", "1-done")]),
            max_len: 100,
            ttl: Duration::from_secs(3600),
        };

        assert!(backend.move_entry(&request).await.unwrap().is_some());
        assert!(backend.move_entry(&request).await.unwrap().is_none());
        assert_eq!(backend.xlen("from").await.unwrap(), 0);
        assert_eq!(backend.xlen("to").await.unwrap(), 1);
        assert_eq!(backend.xpending("from", "g").await.unwrap().count, 0);
        assert!(backend.ttl("to").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire() {
        let backend = InMemoryBackend::new();
        backend.set("k", "v", Some(Duration::from_secs(5))).await.unwrap();
        assert!(backend.create_stream_if_absent("s", Duration::from_secs(5)).await.unwrap());
        assert!(!backend.create_stream_if_absent("s", Duration::from_secs(5)).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert_eq!(backend.xlen("s").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn outages_and_injected_failures() {
        let backend = InMemoryBackend::new();
        backend.fail_next(StoreError::Timeout("injected".into()));
        assert!(matches!(backend.ping().await, Err(StoreError::Timeout(_))));
        assert!(backend.ping().await.is_ok());

        backend.set_available(false);
        assert!(matches!(backend.get("k").await, Err(StoreError::Connection(_))));
        assert!(backend.reconnect().await.is_err());

        backend.set_available(true);
        backend.reconnect().await.unwrap();
        assert_eq!(backend.reconnect_count(), 1);
    }

    #[tokio::test]
    async fn sorted_set_range_is_inclusive_and_ordered() {
        let backend = InMemoryBackend::new();
        backend.zadd("z", "b", 20.0).await.unwrap();
        backend.zadd("z", "a", 10.0).await.unwrap();
        backend.zadd("z", "c", 30.0).await.unwrap();

        assert_eq!(backend.zrange_by_score("z", 0.0, 20.0).await.unwrap(), vec!["a", "b"]);
        assert_eq!(backend.zcount("z", 0.0, 20.0).await.unwrap(), 2);
        assert_eq!(backend.zrem("z", &["a".into(), "zz".into()]).await.unwrap(), 1);
        assert_eq!(backend.zcard("z").await.unwrap(), 2);
        assert_eq!(backend.zscore("z", "c").await.unwrap(), Some(30.0));
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let backend = InMemoryBackend::new();
        backend.set("k", "v", None).await.unwrap();
        let err = backend.hset("k", "f", "v").await.unwrap_err();
        assert!(err.to_string().contains("WRONGTYPE"));
    }
}
