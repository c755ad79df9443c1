//! 内存存储：单进程开发与测试用
//!
//! 读到过期键时立即删除；从不再被读的键由 [`KvStore::purge_expired`] 定期清理。

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{KvStore, StoreError};

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前保存的键数（含尚未清理的过期键）
    pub async fn key_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// 取出未过期的条目；过期则顺手删除
    async fn live_entry(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return None,
                Some(e) if !e.is_expired(now) => return Some(e.clone()),
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        None
    }

    /// 剩余存活时间（测试用）
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.expires_at - now)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.live_entry(key).await {
            Some(Entry {
                value: StoredValue::Text(v),
                ..
            }) => Ok(Some(v)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: StoredValue::Text(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn append_bounded(
        &self,
        key: &str,
        item: &str,
        max_len: usize,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: StoredValue::List(VecDeque::new()),
            expires_at: now + ttl,
        });
        let StoredValue::List(items) = &mut entry.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        items.push_back(item.to_string());
        while items.len() > max_len {
            items.pop_front();
        }
        entry.expires_at = now + ttl;
        Ok(())
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match self.live_entry(key).await {
            Some(Entry {
                value: StoredValue::List(items),
                ..
            }) => Ok(items.into_iter().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }
}
