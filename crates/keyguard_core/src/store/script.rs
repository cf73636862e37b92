/// Server-side scripts the engines know how to run.
///
/// The set is closed: stores either ship the Lua source below to the server or execute the same
/// semantics natively (see `MemoryStore`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Script {
    /// Lazy-refill token bucket.
    ///
    /// `KEYS[1]` is the bucket hash, `ARGV` is `quota, period_ms, quantity, capacity, now_secs`.
    /// Replies `{granted (0|1), tokens}`.
    TokenBucket,

    /// Deletes `KEYS[1]` only if it holds `ARGV[1]`. Replies `1` if deleted, `0` otherwise.
    CompareAndDelete,
}

impl Script {
    pub const fn name(&self) -> &'static str {
        match self {
            Script::TokenBucket => "token_bucket",
            Script::CompareAndDelete => "compare_and_delete",
        }
    }

    pub const fn source(&self) -> &'static str {
        match self {
            Script::TokenBucket => TOKEN_BUCKET_LUA,
            Script::CompareAndDelete => COMPARE_AND_DELETE_LUA,
        }
    }
}

const TOKEN_BUCKET_LUA: &str = r#"
local key = KEYS[1]
local quota = tonumber(ARGV[1])
local period_ms = tonumber(ARGV[2])
local quantity = tonumber(ARGV[3])
local capacity = tonumber(ARGV[4])
local now = tonumber(ARGV[5])
local period = period_ms / 1000

local tokens = tonumber(redis.call('HGET', key, 'tokens'))
local last_refill = tonumber(redis.call('HGET', key, 'last_refill'))
local dirty = false

if tokens == nil or last_refill == nil then
  tokens = capacity
  last_refill = now
  dirty = true
else
  local clamped = math.max(0, math.min(tokens, capacity))
  if clamped ~= tokens then
    tokens = clamped
    dirty = true
  end
  local refill = ((now - last_refill) / period) * quota
  if refill > 0 then
    tokens = math.min(tokens + refill, capacity)
    last_refill = now
    dirty = true
  end
end

local granted = 0
if tokens >= quantity then
  tokens = math.max(0, tokens - quantity)
  granted = 1
  dirty = true
end

if dirty then
  redis.call('HSET', key, 'tokens', tostring(tokens), 'last_refill', tostring(last_refill))
  redis.call('PEXPIRE', key, period_ms)
end

return {granted, tostring(tokens)}
"#;

const COMPARE_AND_DELETE_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// A scalar element of a script reply.
#[derive(Clone, Debug, PartialEq)]
pub enum ScriptValue {
    Nil,
    Int(i64),
    Text(String),
}

impl ScriptValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScriptValue::Int(value) => Some(*value),
            ScriptValue::Text(text) => text.parse().ok(),
            ScriptValue::Nil => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScriptValue::Int(value) => Some(*value as f64),
            ScriptValue::Text(text) => text.parse().ok(),
            ScriptValue::Nil => None,
        }
    }
}
