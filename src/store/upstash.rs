//! Upstash Redis（REST 协议）存储
//!
//! 每条命令是一个 JSON 字符串数组，POST 到根地址；多条命令走 `/pipeline`。
//! 响应为 `{"result": ...}` 或 `{"error": "..."}`。

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{KvStore, StoreError};

pub struct UpstashKvStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl CommandReply {
    fn into_result(self) -> Result<Value, StoreError> {
        match self.error {
            Some(e) => Err(StoreError::Backend(e)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

fn ttl_secs(ttl: Duration) -> String {
    ttl.as_secs().max(1).to_string()
}

impl UpstashKvStore {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn command(&self, args: &[&str]) -> Result<Value, StoreError> {
        let reply: CommandReply = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await?
            .json()
            .await?;
        reply.into_result()
    }

    async fn pipeline(&self, commands: &[Vec<&str>]) -> Result<Vec<Value>, StoreError> {
        let replies: Vec<CommandReply> = self
            .client
            .post(format!("{}/pipeline", self.base_url))
            .bearer_auth(&self.token)
            .json(&commands)
            .send()
            .await?
            .json()
            .await?;
        replies.into_iter().map(CommandReply::into_result).collect()
    }
}

#[async_trait]
impl KvStore for UpstashKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.command(&["GET", key]).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let secs = ttl_secs(ttl);
        self.command(&["SET", key, value, "EX", secs.as_str()]).await?;
        Ok(())
    }

    async fn append_bounded(
        &self,
        key: &str,
        item: &str,
        max_len: usize,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let start = format!("-{}", max_len.max(1));
        let secs = ttl_secs(ttl);
        self.pipeline(&[
            vec!["RPUSH", key, item],
            vec!["LTRIM", key, start.as_str(), "-1"],
            vec!["EXPIRE", key, secs.as_str()],
        ])
        .await?;
        Ok(())
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match self.command(&["LRANGE", key, "0", "-1"]).await? {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => Ok(items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect()),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }
}
