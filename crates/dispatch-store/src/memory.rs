//! In-memory [`ContextStore`] double, grounded on the retrieval pack's
//! `common_redis::mock` trait-mock pattern: a shared `Mutex`-guarded map
//! standing in for the real backend, exposing the exact same trait so
//! tests elsewhere in the workspace don't need a live Redis.

use crate::{ContextStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Entry {
    scalar: Option<String>,
    hash: HashMap<String, String>,
    list: Vec<String>,
    zset: Vec<(String, f64)>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<HashMap<String, Entry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live_entry<T>(&self, key: &str, f: impl FnOnce(&Entry) -> T, default: T) -> T {
        let mut data = self.data.lock().unwrap();
        match data.get(key) {
            Some(entry) if entry.is_live() => f(entry),
            Some(_) => {
                data.remove(key);
                default
            }
            None => default,
        }
    }
}

#[async_trait]
impl ContextStore for InMemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        let entry = data.entry(key.to_string()).or_default();
        entry.scalar = Some(value.to_string());
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        data.entry(key.to_string()).or_default().scalar = Some(value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.with_live_entry(key, |e| e.scalar.clone(), None))
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(entry) = self.data.lock().unwrap().get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        data.entry(key.to_string())
            .or_default()
            .hash
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self.with_live_entry(key, |e| e.hash.get(field).cloned(), None))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.with_live_entry(key, |e| e.hash.clone(), HashMap::new()))
    }

    async fn hincrby(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let mut data = self.data.lock().unwrap();
        let entry = data.entry(key.to_string()).or_default();
        let current: i64 = entry
            .hash
            .get(field)
            .map(|v| v.parse().unwrap_or(0))
            .unwrap_or(0);
        let updated = current + by;
        entry.hash.insert(field.to_string(), updated.to_string());
        Ok(updated)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        data.entry(key.to_string())
            .or_default()
            .list
            .insert(0, value.to_string());
        Ok(())
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self.with_live_entry(
            key,
            |e| {
                let len = e.list.len() as isize;
                let norm = |i: isize| -> isize {
                    if i < 0 {
                        (len + i).max(0)
                    } else {
                        i.min(len)
                    }
                };
                let (s, t) = (norm(start), norm(stop));
                if s > t || len == 0 {
                    return Vec::new();
                }
                e.list[s as usize..=(t as usize).min(len as usize - 1)].to_vec()
            },
            Vec::new(),
        ))
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
        let trimmed = self.lrange(key, start, stop).await?;
        if let Some(entry) = self.data.lock().unwrap().get_mut(key) {
            entry.list = trimmed;
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        let entry = data.entry(key.to_string()).or_default();
        entry.zset.retain(|(m, _)| m != member);
        entry.zset.push((member.to_string(), score));
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self.with_live_entry(
            key,
            |e| {
                let mut matches: Vec<(String, f64)> = e
                    .zset
                    .iter()
                    .filter(|(_, score)| *score >= min && *score <= max)
                    .cloned()
                    .collect();
                matches.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
                matches.into_iter().map(|(member, _)| member).collect()
            },
            Vec::new(),
        ))
    }

    async fn hincrby_many(
        &self,
        key: &str,
        fields: &[(&str, i64)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        for (field, by) in fields {
            self.hincrby(key, field, *by).await?;
        }
        if let Some(ttl) = ttl {
            self.expire(key, ttl).await?;
        }
        Ok(())
    }
}
