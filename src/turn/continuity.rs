//! 多轮续接策略
//!
//! 两种做法二选一（配置 `agent.continuity`）：
//! - **resume**：Agent 自己记得上下文，保存它返回的续接令牌，下一轮带 `--resume <token>`
//! - **transcript**：Agent 不记事，保存有界对话记录，每轮作为提示上下文回放

use std::time::Duration;

use async_trait::async_trait;

use crate::core::TurnError;
use crate::store::{DocumentSessions, TranscriptEntry};

use super::prompt::{first_turn_prompt, restated_prompt, transcript_prompt};

/// 构造提示词所需的本轮信息
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub document_id: &'a str,
    pub user_message: &'a str,
    /// 当前文档为空
    pub is_first_message: bool,
    /// 本轮新建了环境；旧环境里的 Agent 会话已不存在
    pub freshly_created: bool,
}

/// 发给 Agent 的内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPlan {
    pub prompt: String,
    pub resume_token: Option<String>,
}

/// Agent 跑完后需要持久化的内容
#[derive(Debug, Clone, Copy)]
pub struct TurnRecord<'a> {
    pub document_id: &'a str,
    /// 本轮叙述（含工具提示）
    pub narration: &'a str,
    pub continuation_token: Option<&'a str>,
}

#[async_trait]
pub trait ConversationContinuity: Send + Sync {
    fn name(&self) -> &'static str;

    async fn prepare(&self, ctx: &PromptContext<'_>) -> Result<PromptPlan, TurnError>;

    async fn record(&self, record: &TurnRecord<'_>) -> Result<(), TurnError>;
}

pub struct ResumeContinuity {
    sessions: DocumentSessions,
    token_ttl: Duration,
}

impl ResumeContinuity {
    pub fn new(sessions: DocumentSessions, token_ttl: Duration) -> Self {
        Self {
            sessions,
            token_ttl,
        }
    }
}

#[async_trait]
impl ConversationContinuity for ResumeContinuity {
    fn name(&self) -> &'static str {
        "resume"
    }

    async fn prepare(&self, ctx: &PromptContext<'_>) -> Result<PromptPlan, TurnError> {
        let stored = self.sessions.continuation_token(ctx.document_id).await?;
        let token = if ctx.freshly_created {
            if stored.is_some() {
                tracing::debug!(
                    document_id = ctx.document_id,
                    "ignoring continuation token from previous environment"
                );
            }
            None
        } else {
            stored
        };

        let prompt = if ctx.is_first_message {
            first_turn_prompt(ctx.user_message)
        } else if token.is_some() {
            ctx.user_message.to_string()
        } else {
            restated_prompt(ctx.user_message)
        };
        Ok(PromptPlan {
            prompt,
            resume_token: token,
        })
    }

    async fn record(&self, record: &TurnRecord<'_>) -> Result<(), TurnError> {
        if let Some(token) = record.continuation_token {
            self.sessions
                .save_continuation_token(record.document_id, token, self.token_ttl)
                .await?;
            tracing::debug!(document_id = record.document_id, "continuation token saved");
        }
        Ok(())
    }
}

pub struct TranscriptContinuity {
    sessions: DocumentSessions,
    max_entries: usize,
    ttl: Duration,
}

impl TranscriptContinuity {
    pub fn new(sessions: DocumentSessions, max_entries: usize, ttl: Duration) -> Self {
        Self {
            sessions,
            max_entries,
            ttl,
        }
    }
}

#[async_trait]
impl ConversationContinuity for TranscriptContinuity {
    fn name(&self) -> &'static str {
        "transcript"
    }

    async fn prepare(&self, ctx: &PromptContext<'_>) -> Result<PromptPlan, TurnError> {
        let history = self.sessions.transcript(ctx.document_id).await?;
        let base = if ctx.is_first_message {
            first_turn_prompt(ctx.user_message)
        } else {
            restated_prompt(ctx.user_message)
        };
        let prompt = transcript_prompt(&base, &history);

        self.sessions
            .append_transcript(
                ctx.document_id,
                &TranscriptEntry::user(ctx.user_message),
                self.max_entries,
                self.ttl,
            )
            .await?;

        Ok(PromptPlan {
            prompt,
            resume_token: None,
        })
    }

    async fn record(&self, record: &TurnRecord<'_>) -> Result<(), TurnError> {
        let narration = record.narration.trim();
        if narration.is_empty() {
            return Ok(());
        }
        self.sessions
            .append_transcript(
                record.document_id,
                &TranscriptEntry::assistant(narration),
                self.max_entries,
                self.ttl,
            )
            .await?;
        Ok(())
    }
}
