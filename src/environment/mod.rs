//! 执行环境
//!
//! 每个文档绑定一个短生命周期的隔离环境，Agent 在其中运行并编辑 `presentation.md`。
//! 编排器只依赖三种能力：按规格创建、按 id 找回、在环境内执行命令（拿到退出码 / stdout / stderr）。
//!
//! - **local**：本机目录 + 子进程，空闲超时后失效
//! - **mock**：内存模拟，回放预设的 Agent 输出（测试与离线演示）
//! - **manager**：获取或创建环境（含一次性安装），维护存储中的环境句柄

pub mod files;
pub mod local;
pub mod manager;
pub mod mock;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{EnvironmentBackend, EnvironmentSection};

pub use files::ReferenceFiles;
pub use local::LocalEnvironmentProvider;
pub use manager::{AcquiredEnvironment, EnvironmentManager};
pub use mock::{MockAgentScript, MockEnvironmentProvider, AGENT_FINISHED, AGENT_STARTED};

#[derive(Error, Debug)]
pub enum EnvironmentError {
    #[error("Environment {0} not found")]
    NotFound(String),

    #[error("Environment {0} expired")]
    Expired(String),

    #[error("Failed to create environment: {0}")]
    Create(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 命令用途，仅用于日志与模拟环境分派，不影响执行
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPurpose {
    Setup,
    WriteFile,
    Agent,
    ReadFile,
}

impl fmt::Display for CommandPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandPurpose::Setup => "setup",
            CommandPurpose::WriteFile => "write_file",
            CommandPurpose::Agent => "agent",
            CommandPurpose::ReadFile => "read_file",
        };
        f.write_str(s)
    }
}

/// 在环境内执行的命令（argv 语义，不经过 shell）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub purpose: CommandPurpose,
    pub cmd: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// 写入子进程 stdin 的内容；None 时 stdin 为空
    pub stdin: Option<String>,
}

impl CommandRequest {
    pub fn new(purpose: CommandPurpose, cmd: impl Into<String>) -> Self {
        Self {
            purpose,
            cmd: cmd.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
        }
    }

    /// `bash -c <script>`
    pub fn bash(purpose: CommandPurpose, script: impl Into<String>) -> Self {
        Self::new(purpose, "bash").arg("-c").arg(script)
    }

    /// `bash -lc <script>`：登录 shell，能找到安装到用户目录的二进制
    pub fn login_shell(purpose: CommandPurpose, script: impl Into<String>) -> Self {
        Self::new(purpose, "bash").arg("-lc").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, body: impl Into<String>) -> Self {
        self.stdin = Some(body.into());
        self
    }

    /// 传给 shell 的脚本（`bash -c` / `bash -lc` 的最后一个参数）
    pub fn script(&self) -> Option<&str> {
        match self.args.first().map(String::as_str) {
            Some("-c") | Some("-lc") if self.cmd == "bash" => self.args.get(1).map(String::as_str),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// 创建环境时声明的规格
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    pub vcpus: u32,
    pub idle_timeout: Duration,
    pub runtime: String,
}

impl EnvironmentSpec {
    pub fn from_config(cfg: &EnvironmentSection) -> Self {
        Self {
            vcpus: cfg.vcpus,
            idle_timeout: cfg.idle_timeout(),
            runtime: cfg.runtime.clone(),
        }
    }
}

/// 一个活着的执行环境
#[async_trait]
pub trait Environment: Send + Sync {
    fn id(&self) -> &str;

    /// 执行命令；提供 stdout_lines 时，stdout 每读到一行就立即转发（不含换行符）。
    /// 返回的 stdout 总是完整原文。
    async fn run(
        &self,
        request: &CommandRequest,
        stdout_lines: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<CommandOutput, EnvironmentError>;
}

/// 环境的创建与找回
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    async fn create(&self, spec: &EnvironmentSpec) -> Result<Arc<dyn Environment>, EnvironmentError>;

    /// 找回已创建的环境；过期、被回收或不可达都返回错误
    async fn resolve(&self, environment_id: &str) -> Result<Arc<dyn Environment>, EnvironmentError>;

    /// 回收所有已超时的环境，返回回收数量。托管后端自行回收时无需实现。
    async fn sweep_expired(&self) -> usize {
        0
    }
}

/// 按配置创建环境后端
pub async fn create_provider(cfg: &EnvironmentSection) -> Arc<dyn EnvironmentProvider> {
    match cfg.backend {
        EnvironmentBackend::Local => {
            let root = cfg.root.clone().unwrap_or_else(|| "environments".into());
            tracing::info!(root = %root.display(), "Using local execution environments");
            Arc::new(LocalEnvironmentProvider::open(root).await)
        }
        EnvironmentBackend::Mock => {
            tracing::warn!("Using mock execution environments, agent output is replayed");
            Arc::new(MockEnvironmentProvider::new(MockAgentScript {
                lines: cfg.mock_agent_lines.clone(),
                ..MockAgentScript::default()
            }))
        }
    }
}
