//! Redis-backed [`StoreBackend`].
//!
//! Uses one multiplexed [`ConnectionManager`] for all commands except
//! blocking group reads, which each hold a connection of their own so a
//! `BLOCK` never stalls the commands queued behind it. Multi-step
//! operations (stream seeding, lock release, entry moves) run as Lua scripts
//! so they are atomic on the server.
//!
//! Stream replies are parsed by hand from [`redis::Value`]; deleted entries
//! (which Redis reports with a nil field list) are skipped.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{IntoConnectionInfo, Script, Value};
use tracing::{debug, info};

use taskrelay_core::EntryId;

use super::scripts;
use super::{
    Fields, GroupCreation, MoveEntry, PendingEntry, PendingSummary, ReadGroupRequest, ReadStart,
    StoreBackend, StoreError, StoreResult, StreamEntry,
};
use crate::config::StoreConfig;

/// Idle blocking-read connections kept for reuse.
const MAX_IDLE_READERS: usize = 8;

/// Connections checked out by one blocking read at a time.
#[derive(Debug)]
struct IdlePool<C> {
    idle: Mutex<Vec<C>>,
    max_idle: usize,
}

impl<C> IdlePool<C> {
    fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    fn take(&self) -> Option<C> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop()
    }

    /// Return a healthy connection; extras beyond `max_idle` are dropped.
    fn put(&self, conn: C) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }

    fn clear(&self) {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn len(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub struct RedisBackend {
    client: redis::Client,
    connect_timeout: Duration,
    connection: RwLock<ConnectionManager>,
    readers: IdlePool<MultiplexedConnection>,
    create_stream: Script,
    compare_and_delete: Script,
    hash_compare_and_delete: Script,
    move_entry: Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("addr", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Open a client and establish the managed connection.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let mut info = config
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| StoreError::invalid_argument(format!("invalid store url: {}", e)))?;
        if let Some(password) = &config.password {
            info.redis.password = Some(password.clone());
        }

        let client = redis::Client::open(info)?;
        let manager = open_manager(&client, config.connect_timeout).await?;
        info!(addr = %client.get_connection_info().addr, "connected to redis");

        Ok(Self {
            client,
            connect_timeout: config.connect_timeout,
            connection: RwLock::new(manager),
            readers: IdlePool::new(MAX_IDLE_READERS),
            create_stream: Script::new(scripts::CREATE_STREAM_IF_ABSENT),
            compare_and_delete: Script::new(scripts::COMPARE_AND_DELETE),
            hash_compare_and_delete: Script::new(scripts::HASH_COMPARE_AND_DELETE),
            move_entry: Script::new(scripts::MOVE_ENTRY),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> StoreResult<T> {
        let mut conn = self.conn();
        Ok(cmd.query_async(&mut conn).await?)
    }

    /// Run `cmd` on a reader connection. The connection goes back to the
    /// pool only after a reply; a failed or cancelled read drops it.
    async fn query_blocking<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> StoreResult<T> {
        let mut conn = match self.readers.take() {
            Some(conn) => conn,
            None => self.open_reader().await?,
        };
        let reply = cmd.query_async(&mut conn).await?;
        self.readers.put(conn);
        Ok(reply)
    }

    async fn open_reader(&self) -> StoreResult<MultiplexedConnection> {
        match tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(result) => {
                let conn = result?;
                debug!(idle = self.readers.len(), "opened blocking-read connection");
                Ok(conn)
            }
            Err(_) => Err(StoreError::Timeout(format!(
                "reader connect did not finish within {:?}",
                self.connect_timeout
            ))),
        }
    }
}

async fn open_manager(client: &redis::Client, timeout: Duration) -> StoreResult<ConnectionManager> {
    match tokio::time::timeout(timeout, ConnectionManager::new(client.clone())).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StoreError::Timeout(format!(
            "connect did not finish within {:?}",
            timeout
        ))),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn secs(duration: Duration) -> u64 {
    duration.as_secs().max(1)
}

fn ids_arg(ids: &[EntryId]) -> Vec<String> {
    ids.iter().map(EntryId::to_string).collect()
}

#[async_trait]
impl StoreBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> StoreResult<()> {
        let reply: String = self.query(&redis::cmd("PING")).await?;
        if reply != "PONG" {
            return Err(StoreError::protocol(format!("unexpected PING reply: {}", reply)));
        }
        Ok(())
    }

    async fn reconnect(&self) -> StoreResult<()> {
        let manager = open_manager(&self.client, self.connect_timeout).await?;
        *self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = manager;
        self.readers.clear();
        debug!("redis connection re-established");
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = self.query(&cmd).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let reply: Option<String> = self
            .query(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(ttl)),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let removed: u64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let set: i64 = self
            .query(redis::cmd("PEXPIRE").arg(key).arg(millis(ttl)))
            .await?;
        Ok(set == 1)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let remaining: i64 = self.query(redis::cmd("PTTL").arg(key)).await?;
        // -2: missing, -1: no expiry
        Ok(u64::try_from(remaining).ok().map(Duration::from_millis))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let _: i64 = self
            .query(redis::cmd("HSET").arg(key).arg(field).arg(value))
            .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let removed: u64 = self.query(redis::cmd("HDEL").arg(key).arg(field)).await?;
        Ok(removed > 0)
    }

    async fn hdel_if_eq(&self, key: &str, field: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = self
            .hash_compare_and_delete
            .key(key)
            .arg(field)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let _: i64 = self
            .query(redis::cmd("ZADD").arg(key).arg(score).arg(member))
            .await?;
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        self.query(redis::cmd("ZRANGEBYSCORE").arg(key).arg(min).arg(max))
            .await
    }

    async fn zrem(&self, key: &str, members: &[String]) -> StoreResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("ZREM").arg(key).arg(members)).await
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.query(redis::cmd("ZCARD").arg(key)).await
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        self.query(redis::cmd("ZCOUNT").arg(key).arg(min).arg(max))
            .await
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        self.query(redis::cmd("ZSCORE").arg(key).arg(member)).await
    }

    async fn create_stream_if_absent(&self, stream: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn();
        let created: i64 = self
            .create_stream
            .key(stream)
            .arg(secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(created == 1)
    }

    async fn create_group(&self, stream: &str, group: &str) -> StoreResult<GroupCreation> {
        let mut conn = self.conn();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(GroupCreation::Created),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(GroupCreation::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn xadd(&self, stream: &str, fields: &Fields, max_len: Option<usize>) -> StoreResult<EntryId> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max_len) = max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }

        let id: String = self.query(&cmd).await?;
        parse_id(&id)
    }

    async fn xlen(&self, stream: &str) -> StoreResult<u64> {
        self.query(redis::cmd("XLEN").arg(stream)).await
    }

    async fn xrange(
        &self,
        stream: &str,
        start: Option<EntryId>,
        end: Option<EntryId>,
        count: Option<usize>,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(stream)
            .arg(start.map_or_else(|| "-".to_string(), |id| id.to_string()))
            .arg(end.map_or_else(|| "+".to_string(), |id| id.to_string()));
        if let Some(count) = count {
            cmd.arg("COUNT").arg(count);
        }

        let reply: Value = self.query(&cmd).await?;
        parse_entries(reply)
    }

    async fn xrevrange(&self, stream: &str, count: usize) -> StoreResult<Vec<StreamEntry>> {
        let reply: Value = self
            .query(
                redis::cmd("XREVRANGE")
                    .arg(stream)
                    .arg("+")
                    .arg("-")
                    .arg("COUNT")
                    .arg(count),
            )
            .await?;
        parse_entries(reply)
    }

    async fn xread_group(&self, request: &ReadGroupRequest) -> StoreResult<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&request.group)
            .arg(&request.consumer)
            .arg("COUNT")
            .arg(request.count.max(1));
        if let Some(block) = request.block {
            cmd.arg("BLOCK").arg(millis(block));
        }
        cmd.arg("STREAMS").arg(&request.stream).arg(match request.start {
            ReadStart::New => ">",
            ReadStart::Pending => "0",
        });

        let reply: Value = if request.block.is_some() {
            self.query_blocking(&cmd).await?
        } else {
            self.query(&cmd).await?
        };
        parse_read_reply(reply, &request.stream)
    }

    async fn xack(&self, stream: &str, group: &str, ids: &[EntryId]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("XACK").arg(stream).arg(group).arg(ids_arg(ids)))
            .await
    }

    async fn xdel(&self, stream: &str, ids: &[EntryId]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("XDEL").arg(stream).arg(ids_arg(ids)))
            .await
    }

    async fn xpending(&self, stream: &str, group: &str) -> StoreResult<PendingSummary> {
        let reply: Value = self
            .query(redis::cmd("XPENDING").arg(stream).arg(group))
            .await?;
        parse_pending_summary(reply)
    }

    async fn xpending_entries(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> StoreResult<Vec<PendingEntry>> {
        let reply: Value = self
            .query(
                redis::cmd("XPENDING")
                    .arg(stream)
                    .arg(group)
                    .arg("-")
                    .arg("+")
                    .arg(count),
            )
            .await?;
        parse_pending_entries(reply)
    }

    async fn xclaim(
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
        let reply: Value = self
            .query(
                redis::cmd("XCLAIM")
                    .arg(stream)
                    .arg(group)
                    .arg(consumer)
                    .arg(u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX))
                    .arg(ids_arg(ids)),
            )
            .await?;
        parse_entries(reply)
    }

    async fn move_entry(&self, request: &MoveEntry) -> StoreResult<Option<EntryId>> {
        let mut invocation = self.move_entry.prepare_invoke();
        invocation
            .key(&request.from)
            .key(&request.to)
            .arg(request.entry_id.to_string())
            .arg(request.max_len)
            .arg(secs(request.ttl))
            .arg(request.ack_groups.len());
        for group in &request.ack_groups {
            invocation.arg(group);
        }
        for (field, value) in &request.fields {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.conn();
        let new_id: Option<String> = invocation.invoke_async(&mut conn).await?;
        new_id.as_deref().map(parse_id).transpose()
    }
}

// -- reply parsing ------------------------------------------------------------

fn parse_id(raw: &str) -> StoreResult<EntryId> {
    raw.parse()
        .map_err(|e| StoreError::protocol(format!("invalid entry id {:?}: {}", raw, e)))
}

fn value_to_string(value: &Value) -> StoreResult<String> {
    match value {
        Value::Data(data) => Ok(String::from_utf8_lossy(data).into_owned()),
        Value::Status(status) => Ok(status.clone()),
        Value::Int(n) => Ok(n.to_string()),
        Value::Okay => Ok("OK".to_string()),
        other => Err(StoreError::protocol(format!("expected string, got {:?}", other))),
    }
}

fn value_to_u64(value: &Value) -> StoreResult<u64> {
    match value {
        Value::Int(n) => u64::try_from(*n)
            .map_err(|_| StoreError::protocol(format!("negative count {}", n))),
        other => value_to_string(other)?
            .parse()
            .map_err(|e| StoreError::protocol(format!("invalid count: {}", e))),
    }
}

fn into_bulk(value: Value) -> StoreResult<Vec<Value>> {
    match value {
        Value::Bulk(items) => Ok(items),
        Value::Nil => Ok(Vec::new()),
        other => Err(StoreError::protocol(format!("expected array, got {:?}", other))),
    }
}

/// `[id, [field, value, ...]]`; `None` when the field list is nil.
fn parse_entry(value: Value) -> StoreResult<Option<StreamEntry>> {
    let parts = match value {
        Value::Nil => return Ok(None),
        Value::Bulk(parts) if parts.len() == 2 => parts,
        other => return Err(StoreError::protocol(format!("malformed stream entry: {:?}", other))),
    };
    let mut parts = parts.into_iter();
    let (Some(id), Some(body)) = (parts.next(), parts.next()) else {
        return Err(StoreError::protocol("stream entry too short"));
    };

    let id = parse_id(&value_to_string(&id)?)?;
    let raw_fields = match body {
        Value::Nil => return Ok(None),
        Value::Bulk(raw) => raw,
        other => return Err(StoreError::protocol(format!("malformed entry fields: {:?}", other))),
    };

    let mut fields = HashMap::with_capacity(raw_fields.len() / 2);
    for pair in raw_fields.chunks(2) {
        if let [name, value] = pair {
            fields.insert(value_to_string(name)?, value_to_string(value)?);
        }
    }
    Ok(Some(StreamEntry { id, fields }))
}

fn parse_entries(reply: Value) -> StoreResult<Vec<StreamEntry>> {
    let mut entries = Vec::new();
    for raw in into_bulk(reply)? {
        if let Some(entry) = parse_entry(raw)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// `[[stream, [entry, ...]], ...]` or nil when a blocking read timed out.
fn parse_read_reply(reply: Value, stream: &str) -> StoreResult<Vec<StreamEntry>> {
    for per_stream in into_bulk(reply)? {
        let mut parts = into_bulk(per_stream)?.into_iter();
        let (Some(name), Some(entries)) = (parts.next(), parts.next()) else {
            return Err(StoreError::protocol("malformed read reply"));
        };
        if value_to_string(&name)? == stream {
            return parse_entries(entries);
        }
    }
    Ok(Vec::new())
}

/// `[count, lowest, highest, [[consumer, count], ...]]`
fn parse_pending_summary(reply: Value) -> StoreResult<PendingSummary> {
    let parts = into_bulk(reply)?;
    let [count, lowest, highest, consumers] = <[Value; 4]>::try_from(parts)
        .map_err(|parts| StoreError::protocol(format!("malformed XPENDING reply: {:?}", parts)))?;

    let optional_id = |value: &Value| -> StoreResult<Option<EntryId>> {
        match value {
            Value::Nil => Ok(None),
            other => parse_id(&value_to_string(other)?).map(Some),
        }
    };

    let mut per_consumer = Vec::new();
    for consumer in into_bulk(consumers)? {
        match into_bulk(consumer)?.as_slice() {
            [name, pending] => per_consumer.push((value_to_string(name)?, value_to_u64(pending)?)),
            other => {
                return Err(StoreError::protocol(format!(
                    "malformed XPENDING consumer: {:?}",
                    other
                )));
            }
        }
    }

    Ok(PendingSummary {
        count: value_to_u64(&count)?,
        lowest: optional_id(&lowest)?,
        highest: optional_id(&highest)?,
        consumers: per_consumer,
    })
}

/// `[[id, consumer, idle_ms, deliveries], ...]`
fn parse_pending_entries(reply: Value) -> StoreResult<Vec<PendingEntry>> {
    let mut entries = Vec::new();
    for raw in into_bulk(reply)? {
        match into_bulk(raw)?.as_slice() {
            [id, consumer, idle, deliveries] => entries.push(PendingEntry {
                id: parse_id(&value_to_string(id)?)?,
                consumer: value_to_string(consumer)?,
                idle: Duration::from_millis(value_to_u64(idle)?),
                deliveries: value_to_u64(deliveries)?,
            }),
            other => {
                return Err(StoreError::protocol(format!(
                    "malformed XPENDING entry: {:?}",
                    other
                )));
            }
        }
    }
    Ok(entries)
}
