//! Queue broker adapter.
//!
//! All inter-worker coordination lives in named sets and hashes on a shared
//! Redis instance; this module is the only place that talks to it. The one
//! non-trivial operation is [`Broker::lease_pop`], a server-side script that
//! pops an import task and records its lease in the working set in a single
//! atomic step; a non-atomic pop-then-tag would lose tasks on crash.

use crate::task::Lease;
use anyhow::Context;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

/// Namespaced key names for everything the pipeline keeps in the broker.
///
/// The prefix is configurable so test runs can operate on throwaway
/// namespaces; production uses the default `tumblr`.
#[derive(Debug, Clone)]
pub struct BrokerKeys {
    prefix: String,
}

impl BrokerKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    /// Pending fetch tasks (JSON-encoded [`crate::ImportTask`]s).
    pub fn import(&self) -> String {
        self.key("queue:import")
    }

    /// Leased tasks, as `"<epoch>;<task>"` composites.
    pub fn import_working(&self) -> String {
        self.key("queue:import:working")
    }

    /// Raw post documents awaiting ingestion.
    pub fn posts_staging(&self) -> String {
        self.key("queue:posts")
    }

    /// Raw blog envelopes awaiting ingestion.
    pub fn blogs_staging(&self) -> String {
        self.key("queue:blogs")
    }

    /// Operator-supplied re-crawl targets (plain blog names).
    pub fn manual_queue(&self) -> String {
        self.key("queue:manualqueue")
    }

    /// Hash of blog name -> catalogue id, shared cache for author resolution.
    pub fn blog_ids(&self) -> String {
        self.key("blogids")
    }

    /// Hash of worker identity -> fetched-record count. Best-effort only.
    pub fn work_stats(&self) -> String {
        self.key("work_stats")
    }

    pub fn done(&self) -> String {
        self.key("done")
    }

    pub fn not_found(&self) -> String {
        self.key("404")
    }

    pub fn bad_info(&self) -> String {
        self.key("badinfo")
    }

    pub fn urls(&self) -> String {
        self.key("urls")
    }
}

impl Default for BrokerKeys {
    fn default() -> Self {
        Self::new("tumblr")
    }
}

/// Typed operations over the shared key/value store.
///
/// Workers hold this as `Arc<dyn Broker>`; production wires [`RedisBroker`],
/// tests wire [`MemoryBroker`].
#[async_trait]
pub trait Broker: Send + Sync {
    /// Add a member to a set. Returns `true` when the member was new.
    async fn sadd(&self, set: &str, member: &str) -> anyhow::Result<bool>;

    /// Remove a member from a set. Returns `true` when the member existed.
    async fn srem(&self, set: &str, member: &str) -> anyhow::Result<bool>;

    async fn scard(&self, set: &str) -> anyhow::Result<u64>;

    async fn smembers(&self, set: &str) -> anyhow::Result<Vec<String>>;

    async fn sismember(&self, set: &str, member: &str) -> anyhow::Result<bool>;

    /// Pop up to `count` arbitrary members from a set.
    async fn spop(&self, set: &str, count: usize) -> anyhow::Result<Vec<String>>;

    /// Members of `a` that are not members of `b`.
    async fn sdiff(&self, a: &str, b: &str) -> anyhow::Result<Vec<String>>;

    async fn hincrby(&self, hash: &str, field: &str, delta: i64) -> anyhow::Result<i64>;

    async fn hget(&self, hash: &str, field: &str) -> anyhow::Result<Option<String>>;

    async fn hset(&self, hash: &str, field: &str, value: &str) -> anyhow::Result<()>;

    /// Atomically pop one member from `queue` and record `"<epoch>;<member>"`
    /// in `working`, using the broker's clock for the epoch. Returns `None`
    /// when the queue is empty.
    async fn lease_pop(&self, queue: &str, working: &str) -> anyhow::Result<Option<Lease>>;
}

const LEASE_POP_SCRIPT: &str = r#"
-- TIME is non-deterministic; switch to effects replication before writing.
redis.replicate_commands()
local time = redis.call('TIME')[1]
local item = redis.call('SPOP', KEYS[1])

if not item then
    return nil
end

redis.call('SADD', KEYS[2], time .. ';' .. item)
return { tonumber(time), item }
"#;

/// Broker adapter over a live Redis instance.
pub struct RedisBroker {
    conn: redis::aio::ConnectionManager,
    lease_pop: redis::Script,
}

impl RedisBroker {
    /// Connect to `redis://host:port/db`. The connection manager multiplexes
    /// and reconnects; clones share the underlying connection.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).with_context(|| format!("open redis url {url}"))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .with_context(|| format!("connect redis at {url}"))?;
        Ok(Self {
            conn,
            lease_pop: redis::Script::new(LEASE_POP_SCRIPT),
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn sadd(&self, set: &str, member: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = conn
            .sadd(set, member)
            .await
            .with_context(|| format!("SADD {set}"))?;
        Ok(added > 0)
    }

    async fn srem(&self, set: &str, member: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .srem(set, member)
            .await
            .with_context(|| format!("SREM {set}"))?;
        Ok(removed > 0)
    }

    async fn scard(&self, set: &str) -> anyhow::Result<u64> {
        let mut conn = self.conn.clone();
        conn.scard(set).await.with_context(|| format!("SCARD {set}"))
    }

    async fn smembers(&self, set: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(set)
            .await
            .with_context(|| format!("SMEMBERS {set}"))
    }

    async fn sismember(&self, set: &str, member: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        conn.sismember(set, member)
            .await
            .with_context(|| format!("SISMEMBER {set}"))
    }

    async fn spop(&self, set: &str, count: usize) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("SPOP")
            .arg(set)
            .arg(count)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("SPOP {set} {count}"))
    }

    async fn sdiff(&self, a: &str, b: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.sdiff(&[a, b])
            .await
            .with_context(|| format!("SDIFF {a} {b}"))
    }

    async fn hincrby(&self, hash: &str, field: &str, delta: i64) -> anyhow::Result<i64> {
        let mut conn = self.conn.clone();
        conn.hincr(hash, field, delta)
            .await
            .with_context(|| format!("HINCRBY {hash} {field}"))
    }

    async fn hget(&self, hash: &str, field: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.hget(hash, field)
            .await
            .with_context(|| format!("HGET {hash} {field}"))
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        conn.hset(hash, field, value)
            .await
            .with_context(|| format!("HSET {hash} {field}"))
    }

    async fn lease_pop(&self, queue: &str, working: &str) -> anyhow::Result<Option<Lease>> {
        let mut conn = self.conn.clone();
        let popped: Option<(i64, String)> = self
            .lease_pop
            .key(queue)
            .key(working)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("lease-pop {queue} -> {working}"))?;
        Ok(popped.map(|(epoch, payload)| Lease { epoch, payload }))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    sets: HashMap<String, BTreeSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// In-process broker with the same contract as [`RedisBroker`], including an
/// atomic lease-pop. Backs the integration tests that exercise worker logic
/// without a live Redis.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // The lock is never held across an await and the closures cannot
        // panic while holding it, so poisoning is unreachable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn sadd(&self, set: &str, member: &str) -> anyhow::Result<bool> {
        Ok(self
            .lock()
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, set: &str, member: &str) -> anyhow::Result<bool> {
        Ok(self
            .lock()
            .sets
            .get_mut(set)
            .map_or(false, |s| s.remove(member)))
    }

    async fn scard(&self, set: &str) -> anyhow::Result<u64> {
        Ok(self.lock().sets.get(set).map_or(0, |s| s.len() as u64))
    }

    async fn smembers(&self, set: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .lock()
            .sets
            .get(set)
            .map_or_else(Vec::new, |s| s.iter().cloned().collect()))
    }

    async fn sismember(&self, set: &str, member: &str) -> anyhow::Result<bool> {
        Ok(self.lock().sets.get(set).map_or(false, |s| s.contains(member)))
    }

    async fn spop(&self, set: &str, count: usize) -> anyhow::Result<Vec<String>> {
        let mut state = self.lock();
        let Some(members) = state.sets.get_mut(set) else {
            return Ok(Vec::new());
        };
        let mut popped = Vec::new();
        while popped.len() < count {
            match members.pop_first() {
                Some(member) => popped.push(member),
                None => break,
            }
        }
        Ok(popped)
    }

    async fn sdiff(&self, a: &str, b: &str) -> anyhow::Result<Vec<String>> {
        let state = self.lock();
        let left = state.sets.get(a).cloned().unwrap_or_default();
        let right = state.sets.get(b).cloned().unwrap_or_default();
        Ok(left.difference(&right).cloned().collect())
    }

    async fn hincrby(&self, hash: &str, field: &str, delta: i64) -> anyhow::Result<i64> {
        let mut state = self.lock();
        let fields = state.hashes.entry(hash.to_string()).or_default();
        let current = fields
            .get(field)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        fields.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hget(&self, hash: &str, field: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .lock()
            .hashes
            .get(hash)
            .and_then(|fields| fields.get(field).cloned()))
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> anyhow::Result<()> {
        self.lock()
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn lease_pop(&self, queue: &str, working: &str) -> anyhow::Result<Option<Lease>> {
        let mut state = self.lock();
        let Some(payload) = state.sets.get_mut(queue).and_then(BTreeSet::pop_first) else {
            return Ok(None);
        };
        let lease = Lease {
            epoch: chrono::Utc::now().timestamp(),
            payload,
        };
        state
            .sets
            .entry(working.to_string())
            .or_default()
            .insert(lease.entry());
        Ok(Some(lease))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_prefix() {
        let keys = BrokerKeys::default();
        assert_eq!(keys.import(), "tumblr:queue:import");
        assert_eq!(keys.import_working(), "tumblr:queue:import:working");
        assert_eq!(keys.manual_queue(), "tumblr:queue:manualqueue");
        assert_eq!(keys.not_found(), "tumblr:404");

        let keys = BrokerKeys::new("test_ns");
        assert_eq!(keys.posts_staging(), "test_ns:queue:posts");
    }

    #[tokio::test]
    async fn memory_sets_behave_like_sets() -> anyhow::Result<()> {
        let broker = MemoryBroker::new();
        assert!(broker.sadd("s", "a").await?);
        assert!(!broker.sadd("s", "a").await?);
        assert!(broker.sadd("s", "b").await?);
        assert_eq!(broker.scard("s").await?, 2);
        assert!(broker.sismember("s", "a").await?);
        assert!(broker.srem("s", "a").await?);
        assert!(!broker.srem("s", "a").await?);
        assert_eq!(broker.smembers("s").await?, vec!["b".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn memory_spop_drains_in_batches() -> anyhow::Result<()> {
        let broker = MemoryBroker::new();
        for n in 0..5 {
            broker.sadd("s", &format!("m{n}")).await?;
        }
        let first = broker.spop("s", 3).await?;
        assert_eq!(first.len(), 3);
        let rest = broker.spop("s", 10).await?;
        assert_eq!(rest.len(), 2);
        assert!(broker.spop("s", 1).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn memory_sdiff_subtracts_members() -> anyhow::Result<()> {
        let broker = MemoryBroker::new();
        for m in ["a", "b", "c"] {
            broker.sadd("all", m).await?;
        }
        broker.sadd("done", "b").await?;
        let mut remaining = broker.sdiff("all", "done").await?;
        remaining.sort();
        assert_eq!(remaining, vec!["a".to_string(), "c".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn memory_hash_counters_accumulate() -> anyhow::Result<()> {
        let broker = MemoryBroker::new();
        assert_eq!(broker.hincrby("stats", "w1", 20).await?, 20);
        assert_eq!(broker.hincrby("stats", "w1", 5).await?, 25);
        assert_eq!(broker.hget("stats", "w1").await?, Some("25".to_string()));
        broker.hset("stats", "w2", "7").await?;
        assert_eq!(broker.hincrby("stats", "w2", 1).await?, 8);
        assert_eq!(broker.hget("stats", "missing").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn memory_lease_pop_moves_task_into_working_set() -> anyhow::Result<()> {
        let broker = MemoryBroker::new();
        broker.sadd("import", "task-payload").await?;

        let lease = broker.lease_pop("import", "working").await?.unwrap();
        assert_eq!(lease.payload, "task-payload");
        assert_eq!(broker.scard("import").await?, 0);
        assert!(broker.sismember("working", &lease.entry()).await?);

        assert!(broker.lease_pop("import", "working").await?.is_none());
        Ok(())
    }
}
