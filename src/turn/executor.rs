//! 单轮执行
//!
//! 阶段：ResolveEnv → SyncFiles → InvokeAgent → DecodeStream → PersistState → ReadResult → EmitFinal。
//! Agent 运行期间 stdout 逐行解码并立刻送入 sink；续接状态在检查退出码之前持久化，
//! 之后的失败不会回滚它。任何致命错误都转成一条 `WireEvent::Error`，流随后正常关闭。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::config::AgentSection;
use crate::core::error::{stderr_or_unknown, TurnError};
use crate::environment::files::{read_file_command, shell_quote, DOCUMENT_FILE};
use crate::environment::manager::write_file;
use crate::environment::{CommandPurpose, CommandRequest, EnvironmentManager};
use crate::observability::Metrics;
use crate::protocol::{decode_line, AgentEvent, IgnoreReason, NarrationLog, WireEvent};

use super::continuity::{ConversationContinuity, PromptContext, PromptPlan, TurnRecord};
use super::sink::TurnSink;

/// 一轮请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub document_id: String,
    pub user_message: String,
    /// 客户端持有的当前文档全文
    pub current_content: String,
}

impl TurnRequest {
    pub fn is_first_message(&self) -> bool {
        self.current_content.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    ResolveEnv,
    SyncFiles,
    InvokeAgent,
    DecodeStream,
    PersistState,
    ReadResult,
    EmitFinal,
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnPhase::ResolveEnv => "resolve_env",
            TurnPhase::SyncFiles => "sync_files",
            TurnPhase::InvokeAgent => "invoke_agent",
            TurnPhase::DecodeStream => "decode_stream",
            TurnPhase::PersistState => "persist_state",
            TurnPhase::ReadResult => "read_result",
            TurnPhase::EmitFinal => "emit_final",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Done,
    Failed { phase: TurnPhase, reason: String },
}

/// Agent 命令行的组装方式
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub command: String,
    pub args: Vec<String>,
    pub resume_flag: String,
    pub api_key_env: String,
    pub api_key: Option<String>,
}

impl AgentInvocation {
    /// API Key 从宿主环境变量读取
    pub fn from_config(cfg: &AgentSection) -> Self {
        let api_key = std::env::var(&cfg.api_key_env).ok();
        if api_key.is_none() {
            tracing::warn!(env = %cfg.api_key_env, "agent API key is not set");
        }
        Self {
            command: cfg.command.clone(),
            args: cfg.args.clone(),
            resume_flag: cfg.resume_flag.clone(),
            api_key_env: cfg.api_key_env.clone(),
            api_key,
        }
    }

    /// 经登录 shell 执行；每个参数都用单引号包裹，提示词里的任何字符都不会被 shell 解释
    pub fn command_for(&self, plan: &PromptPlan) -> CommandRequest {
        let mut words = vec!["exec".to_string(), shell_quote(&self.command)];
        words.extend(self.args.iter().map(|a| shell_quote(a)));
        if let Some(token) = &plan.resume_token {
            words.push(shell_quote(&self.resume_flag));
            words.push(shell_quote(token));
        }
        words.push(shell_quote(&plan.prompt));

        let request = CommandRequest::login_shell(CommandPurpose::Agent, words.join(" "));
        match &self.api_key {
            Some(key) => request.env(self.api_key_env.as_str(), key.as_str()),
            None => request,
        }
    }
}

pub struct TurnExecutor {
    environments: EnvironmentManager,
    continuity: Arc<dyn ConversationContinuity>,
    agent: AgentInvocation,
    /// 同一文档的轮次串行执行
    document_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TurnExecutor {
    pub fn new(
        environments: EnvironmentManager,
        continuity: Arc<dyn ConversationContinuity>,
        agent: AgentInvocation,
    ) -> Self {
        Self {
            environments,
            continuity,
            agent,
            document_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn environments(&self) -> &EnvironmentManager {
        &self.environments
    }

    pub fn continuity_name(&self) -> &'static str {
        self.continuity.name()
    }

    /// 执行一轮；结果同时写进 sink（最终内容或错误）并作为返回值
    pub async fn run_turn(&self, request: TurnRequest, sink: TurnSink) -> TurnOutcome {
        let metrics = Metrics::global();
        metrics.turn_started();

        let lock = self.document_lock(&request.document_id).await;
        let guard = lock.lock().await;

        let mut phase = TurnPhase::ResolveEnv;
        let result = self.execute(&request, &sink, &mut phase).await;

        drop(guard);
        drop(lock);
        self.prune_locks().await;

        match result {
            Ok(()) => {
                metrics.turn_completed();
                tracing::info!(document_id = %request.document_id, "turn completed");
                TurnOutcome::Done
            }
            Err(e) => {
                metrics.turn_failed();
                tracing::error!(
                    document_id = %request.document_id,
                    phase = %phase,
                    kind = e.kind(),
                    error = %e,
                    "turn failed"
                );
                let reason = e.to_string();
                sink.emit(WireEvent::Error(reason.clone()));
                TurnOutcome::Failed { phase, reason }
            }
        }
    }

    async fn document_lock(&self, document_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.document_locks.lock().await;
        Arc::clone(locks.entry(document_id.to_string()).or_default())
    }

    async fn prune_locks(&self) {
        self.document_locks
            .lock()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    async fn execute(
        &self,
        request: &TurnRequest,
        sink: &TurnSink,
        phase: &mut TurnPhase,
    ) -> Result<(), TurnError> {
        let document_id = request.document_id.as_str();

        *phase = TurnPhase::ResolveEnv;
        let acquired = self.environments.acquire(document_id, sink).await?;
        let environment = acquired.environment.as_ref();

        *phase = TurnPhase::SyncFiles;
        if !acquired.freshly_created {
            self.environments.write_references(environment).await?;
        }
        write_file(environment, DOCUMENT_FILE, &request.current_content).await?;
        if acquired.freshly_created {
            sink.narrate("[Files setup complete...]\n\n");
            sink.narrate("[Running AI agent...]\n\n");
        }

        *phase = TurnPhase::InvokeAgent;
        let plan = self
            .continuity
            .prepare(&PromptContext {
                document_id,
                user_message: &request.user_message,
                is_first_message: request.is_first_message(),
                freshly_created: acquired.freshly_created,
            })
            .await?;
        let command = self.agent.command_for(&plan);
        tracing::info!(
            document_id,
            environment_id = %environment.id(),
            continuity = self.continuity.name(),
            resume = plan.resume_token.is_some(),
            "invoking agent"
        );

        *phase = TurnPhase::DecodeStream;
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let decode = async {
            let mut log = NarrationLog::default();
            while let Some(line) = line_rx.recv().await {
                let event = decode_line(&line);
                if let AgentEvent::Ignored {
                    reason: IgnoreReason::Malformed(e),
                } = &event
                {
                    Metrics::global().malformed_line();
                    tracing::debug!(document_id, error = %e, "skipping malformed agent output line");
                }
                if let Some(wire) = WireEvent::from_agent_event(&event) {
                    sink.emit(wire);
                }
                log.apply(&event);
            }
            log
        };
        let (run_result, log) = tokio::join!(environment.run(&command, Some(line_tx)), decode);

        *phase = TurnPhase::PersistState;
        if let Some(duration_ms) = log.duration_ms {
            tracing::info!(document_id, duration_ms, "agent completed");
        }
        let record = TurnRecord {
            document_id,
            narration: &log.narration,
            continuation_token: log.continuation_token.as_deref(),
        };
        if let Err(e) = self.continuity.record(&record).await {
            tracing::warn!(document_id, error = %e, "failed to persist conversation state");
        }

        *phase = TurnPhase::InvokeAgent;
        let output = run_result.map_err(|e| TurnError::AgentInvocationFailed(e.to_string()))?;
        if !output.success() {
            return Err(TurnError::AgentInvocationFailed(stderr_or_unknown(&output.stderr)));
        }

        *phase = TurnPhase::ReadResult;
        let read_failed = |reason: String| TurnError::ResultReadFailed {
            file: DOCUMENT_FILE.to_string(),
            reason,
        };
        let read = environment
            .run(&read_file_command(DOCUMENT_FILE), None)
            .await
            .map_err(|e| read_failed(e.to_string()))?;
        if !read.success() {
            return Err(read_failed(stderr_or_unknown(&read.stderr)));
        }

        *phase = TurnPhase::EmitFinal;
        sink.emit(WireEvent::FinalContent(read.stdout));
        Ok(())
    }
}
