//! Redis-backed [`ContextStore`], grounded on `common_redis::RedisClient`'s
//! use of a cloned `MultiplexedConnection` per call and `redis::pipe()` for
//! multi-key round-trips.

use crate::{ContextStore, StoreError};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(addr: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(addr)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { connection })
    }

    pub fn from_connection(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl ContextStore for RedisStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64)
            .await?;
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.connection.clone();
        let value: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(value)
    }

    async fn hincrby(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        let value: i64 = conn.hincr(key, field, by).await?;
        Ok(value)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        let values: Vec<String> = conn.lrange(key, start, stop).await?;
        Ok(values)
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.ltrim::<_, ()>(key, start, stop).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        let values: Vec<String> = conn.zrangebyscore(key, min, max).await?;
        Ok(values)
    }

    async fn hincrby_many(
        &self,
        key: &str,
        fields: &[(&str, i64)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        for (field, by) in fields {
            pipe.cmd("HINCRBY").arg(key).arg(*field).arg(*by).ignore();
        }
        if let Some(ttl) = ttl {
            pipe.cmd("EXPIRE")
                .arg(key)
                .arg(ttl.as_secs().max(1))
                .ignore();
        }
        let mut conn = self.connection.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
