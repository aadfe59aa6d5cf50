//! Server-side Lua scripts.
//!
//! Both scripts run as one indivisible unit inside Redis; no client can
//! observe an entry that has left the source list but not reached the
//! destination.

/// `KEYS[1]` source, `KEYS[2]` destination, `ARGV[1]` count.
///
/// Pops from the source tail and pushes each entry onto the destination head.
/// Returns the moved entries in pop order (empty when the source is empty).
pub(crate) const MRPOP_LPUSH_SRC_DEST: &str = r#"
local src = KEYS[1]
local dest = KEYS[2]
local count = tonumber(ARGV[1])
local moved = {}
for i = 1, count do
  local entry = redis.call('RPOP', src)
  if not entry then
    break
  end
  redis.call('LPUSH', dest, entry)
  moved[i] = entry
end
return moved
"#;

/// `KEYS[1]` source, `KEYS[2]` destination, `ARGV[1]` limit.
///
/// Pops from the source head and appends to the destination tail, so the
/// moved entries keep their relative order and are the next ones a
/// tail-popping consumer sees. Returns `{remaining, moved}`.
pub(crate) const LPOP_RPUSH_SRC_DEST: &str = r#"
local src = KEYS[1]
local dest = KEYS[2]
local limit = tonumber(ARGV[1])
local moved = 0
while moved < limit do
  local entry = redis.call('LPOP', src)
  if not entry then
    break
  end
  redis.call('RPUSH', dest, entry)
  moved = moved + 1
end
return {redis.call('LLEN', src), moved}
"#;
