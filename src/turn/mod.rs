//! 对话轮次：一次 HTTP 请求驱动的一轮 Agent 编辑
//!
//! - **executor**：状态机，串起环境、文件同步、Agent 调用、解码与持久化
//! - **continuity**：多轮续接策略（resume / transcript）
//! - **prompt**：提示词模板
//! - **sink**：轮次到响应流的通道

pub mod continuity;
pub mod executor;
pub mod prompt;
pub mod sink;

use std::sync::Arc;

use crate::config::{AppConfig, ContinuityMode};
use crate::environment::{EnvironmentManager, EnvironmentProvider, EnvironmentSpec, ReferenceFiles};
use crate::store::{DocumentSessions, KvStore};

pub use continuity::{
    ConversationContinuity, PromptContext, PromptPlan, ResumeContinuity, TranscriptContinuity,
    TurnRecord,
};
pub use executor::{AgentInvocation, TurnExecutor, TurnOutcome, TurnPhase, TurnRequest};
pub use sink::TurnSink;

/// 按配置装配执行器
pub fn build_executor(
    config: &AppConfig,
    store: Arc<dyn KvStore>,
    provider: Arc<dyn EnvironmentProvider>,
    references: ReferenceFiles,
) -> TurnExecutor {
    let sessions = DocumentSessions::new(store);
    let environments = EnvironmentManager::new(
        provider,
        sessions.clone(),
        EnvironmentSpec::from_config(&config.environment),
        config.environment.handle_ttl(),
        config.agent.install_command.clone(),
        references,
    );
    let continuity: Arc<dyn ConversationContinuity> = match config.agent.continuity {
        ContinuityMode::Resume => Arc::new(ResumeContinuity::new(
            sessions,
            config.agent.continuation_ttl(),
        )),
        ContinuityMode::Transcript => Arc::new(TranscriptContinuity::new(
            sessions,
            config.store.transcript_max_entries,
            config.store.transcript_ttl(),
        )),
    };
    tracing::info!(continuity = continuity.name(), "turn executor ready");
    TurnExecutor::new(
        environments,
        continuity,
        AgentInvocation::from_config(&config.agent),
    )
}
