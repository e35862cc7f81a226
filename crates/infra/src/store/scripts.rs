//! Lua scripts for multi-step store operations.
//!
//! Each script runs atomically on the server, so concurrent callers never
//! observe a half-applied step.

/// Create a stream with a seed entry and TTL unless the key exists.
///
/// KEYS[1] = stream, ARGV[1] = ttl seconds. Returns 1 if created, 0 otherwise.
pub(crate) const CREATE_STREAM_IF_ABSENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('XADD', KEYS[1], '*', 'init', '1')
redis.call('EXPIRE', KEYS[1], ARGV[1])
return 1
"#;

/// Delete a key only if it still holds the caller's token.
///
/// KEYS[1] = key, ARGV[1] = token. Returns 1 if deleted, 0 otherwise.
pub(crate) const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Delete a hash field only if it still holds the expected value.
///
/// KEYS[1] = hash, ARGV[1] = field, ARGV[2] = expected value. Returns 1 if
/// deleted, 0 otherwise.
pub(crate) const HASH_COMPARE_AND_DELETE: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
    return redis.call('HDEL', KEYS[1], ARGV[1])
end
return 0
"#;

/// Move one entry between streams.
///
/// KEYS[1] = source stream, KEYS[2] = destination stream.
/// ARGV[1] = entry id, ARGV[2] = destination max length, ARGV[3] = destination
/// ttl seconds, ARGV[4] = number of groups (n), ARGV[5..5+n) = groups to ack,
/// remaining ARGV = field/value pairs for the new entry.
///
/// Returns the new entry id, or nil if the source entry no longer exists.
pub(crate) const MOVE_ENTRY: &str = r#"
local found = redis.call('XRANGE', KEYS[1], ARGV[1], ARGV[1])
if #found == 0 then
    return false
end
local group_count = tonumber(ARGV[4])
for i = 1, group_count do
    redis.pcall('XACK', KEYS[1], ARGV[4 + i], ARGV[1])
end
redis.call('XDEL', KEYS[1], ARGV[1])
local fields = {}
for i = 5 + group_count, #ARGV do
    fields[#fields + 1] = ARGV[i]
end
local id = redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[2], '*', unpack(fields))
redis.call('EXPIRE', KEYS[2], ARGV[3])
return id
"#;
