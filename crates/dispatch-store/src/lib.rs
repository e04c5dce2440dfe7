//! The durable write path for sessions, per-request traces, per-session
//! stats, user-action errors, successful responses, and worker/global
//! metrics (C9).
//!
//! [`ContextStore`] is a thin policy-free trait over hash/list/sorted-set/
//! TTL primitives, grounded method-for-method on the retrieval pack's
//! `common_redis::Client` trait (`PostHog-posthog/rust/common/redis`):
//! `hincrby`, `zrangebyscore`, `set_nx_ex`/`setex` reappear here under the
//! same names, extended with `hset`/`lpush`/`zadd`/`expire` since the
//! contract (§6 of the engine this store backs) needs the full hash/list/
//! sorted-set primitive set, not just the subset that pack's callers used.
//! [`RedisStore`] wraps the `redis` crate's `MultiplexedConnection` the same
//! way `common_redis::RedisClient` does; [`InMemoryStore`] is the test
//! double, grounded on that pack's `mock.rs` trait-mock pattern.

pub mod error;
pub mod memory;
pub mod redis_store;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Durable key-value store contract: hash, list, sorted-set, and scalar
/// primitives with TTL, used throughout the engine's key namespace
/// (`session:<id>`, `apirequests:<sessionId>`, `metrics:*`, ...).
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// `SET key value EX ttl`. TTL is set on first insertion per the
    /// contract's "TTL-on-insert" policy.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// `SET key value` with no expiry.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// `EXPIRE key ttl`. Called on every mutation of a TTL-bearing key per
    /// the contract's "refresh-on-mutation" policy.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// `HINCRBY key field by`, returning the new value.
    async fn hincrby(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError>;

    /// Pushes to the head of a list (`LPUSH`).
    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// `LRANGE key start stop`.
    async fn lrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    /// `LTRIM key start stop`, used to cap list length (e.g.
    /// `metrics:errorTimestamps` trimmed to the last 100 entries).
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError>;

    /// `ZADD key score member`.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// `ZRANGEBYSCORE key min max`.
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64)
        -> Result<Vec<String>, StoreError>;

    /// Atomically increments every field in `fields` and refreshes `ttl`,
    /// the "multi-key updates must be pipelined when possible" requirement
    /// for `SessionStats` increments (`total`, `success|failure`,
    /// `status:<code>`) in one round-trip.
    async fn hincrby_many(
        &self,
        key: &str,
        fields: &[(&str, i64)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;
}
