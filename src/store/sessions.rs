//! 按文档划分的会话状态
//!
//! 三类键互不相交，且都以文档 id 作用域：
//! - `env:{doc}:handle` 执行环境 id（仅环境生命周期管理器写入）
//! - `agent:{doc}:continuation` Agent 续接令牌
//! - `transcript:{doc}:entries` 有界对话记录（JSON 列表）

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{KvStore, StoreError};

fn environment_key(document_id: &str) -> String {
    format!("env:{}:handle", document_id)
}

fn continuation_key(document_id: &str) -> String {
    format!("agent:{}:continuation", document_id)
}

fn transcript_key(document_id: &str) -> String {
    format!("transcript:{}:entries", document_id)
}

/// 最近一次已知的执行环境
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentHandle {
    pub environment_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Assistant,
}

/// 对话记录中的一条
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TranscriptRole::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TranscriptRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 会话存储的类型化门面，作为依赖注入到编排器
#[derive(Clone)]
pub struct DocumentSessions {
    store: Arc<dyn KvStore>,
}

impl DocumentSessions {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub async fn environment_handle(
        &self,
        document_id: &str,
    ) -> Result<Option<EnvironmentHandle>, StoreError> {
        Ok(self
            .store
            .get(&environment_key(document_id))
            .await?
            .filter(|id| !id.is_empty())
            .map(|environment_id| EnvironmentHandle { environment_id }))
    }

    pub async fn save_environment_handle(
        &self,
        document_id: &str,
        handle: &EnvironmentHandle,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.store
            .set(&environment_key(document_id), &handle.environment_id, ttl)
            .await
    }

    pub async fn continuation_token(&self, document_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(&continuation_key(document_id))
            .await?
            .filter(|t| !t.is_empty()))
    }

    pub async fn save_continuation_token(
        &self,
        document_id: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.store.set(&continuation_key(document_id), token, ttl).await
    }

    pub async fn append_transcript(
        &self,
        document_id: &str,
        entry: &TranscriptEntry,
        max_entries: usize,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let item = serde_json::to_string(entry)?;
        self.store
            .append_bounded(&transcript_key(document_id), &item, max_entries, ttl)
            .await
    }

    /// 读取对话记录；无法解析的条目跳过
    pub async fn transcript(&self, document_id: &str) -> Result<Vec<TranscriptEntry>, StoreError> {
        let items = self.store.list(&transcript_key(document_id)).await?;
        Ok(items
            .iter()
            .filter_map(|item| match serde_json::from_str(item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(document_id, error = %e, "skipping unreadable transcript entry");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    fn sessions() -> DocumentSessions {
        DocumentSessions::new(Arc::new(MemoryKvStore::new()))
    }

    #[tokio::test]
    async fn test_key_families_do_not_collide() {
        let s = sessions();
        let ttl = Duration::from_secs(60);
        s.save_environment_handle(
            "doc",
            &EnvironmentHandle {
                environment_id: "env-1".into(),
            },
            ttl,
        )
        .await
        .unwrap();
        s.save_continuation_token("doc", "token-1", ttl).await.unwrap();

        assert_eq!(
            s.environment_handle("doc").await.unwrap().map(|h| h.environment_id),
            Some("env-1".to_string())
        );
        assert_eq!(s.continuation_token("doc").await.unwrap().as_deref(), Some("token-1"));
        assert_eq!(s.continuation_token("doc:handle").await.unwrap(), None);
        assert_eq!(s.environment_handle("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transcript_is_bounded_and_ordered() {
        let s = sessions();
        let ttl = Duration::from_secs(60);
        for i in 0..4 {
            s.append_transcript("doc", &TranscriptEntry::user(format!("m{}", i)), 3, ttl)
                .await
                .unwrap();
        }
        let entries = s.transcript("doc").await.unwrap();
        let contents: Vec<_> = entries.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["m1", "m2", "m3"]);
        assert!(entries.iter().all(|e| e.role == TranscriptRole::User));
    }
}
