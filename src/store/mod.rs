//! 会话存储抽象层
//!
//! 带过期时间的键值存储，按文档 id 划分三类键：环境句柄、续接令牌、对话记录。
//! 支持内存和 Upstash Redis（REST）两种实现，由配置选择。

pub mod memory;
pub mod sessions;
pub mod upstash;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{StoreBackend, StoreSection};

pub use memory::MemoryKvStore;
pub use sessions::{DocumentSessions, EnvironmentHandle, TranscriptEntry, TranscriptRole};
pub use upstash::UpstashKvStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    /// 键存在但类型不对（如对列表执行 GET）
    #[error("Wrong type for key {0}")]
    WrongType(String),

    #[error("Store not configured: {0}")]
    NotConfigured(String),
}

/// 键值存储接口（TTL 由服务端执行）
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// 写入并设置过期时间（覆盖旧值）
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// 追加到列表尾部，只保留最近 max_len 项，并刷新整个列表的过期时间
    async fn append_bounded(
        &self,
        key: &str,
        item: &str,
        max_len: usize,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// 读取整个列表（按追加顺序）
    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// 清理已过期的键，返回清理数量。服务端自行过期的后端无需实现。
    async fn purge_expired(&self) -> usize {
        0
    }
}

/// 按配置创建存储
pub fn create_kv_store(cfg: &StoreSection) -> Result<Arc<dyn KvStore>, StoreError> {
    match cfg.backend {
        StoreBackend::Memory => {
            tracing::info!("Using in-memory session store");
            Ok(Arc::new(MemoryKvStore::new()))
        }
        StoreBackend::Upstash => {
            let url = cfg
                .url
                .clone()
                .or_else(|| std::env::var(&cfg.url_env).ok())
                .ok_or_else(|| StoreError::NotConfigured(format!("{} is not set", cfg.url_env)))?;
            let token = std::env::var(&cfg.token_env)
                .map_err(|_| StoreError::NotConfigured(format!("{} is not set", cfg.token_env)))?;
            tracing::info!(url = %url, "Using Upstash session store");
            Ok(Arc::new(UpstashKvStore::new(
                &url,
                &token,
                Duration::from_secs(cfg.request_timeout_secs),
            )?))
        }
    }
}
