//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DECKMIND__*` 覆盖（双下划线表示嵌套，如 `DECKMIND__AGENT__CONTINUITY=transcript`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub server: ServerSection,
    pub environment: EnvironmentSection,
    pub agent: AgentSection,
    pub store: StoreSection,
    pub slides: SlidesSection,
    pub references: ReferencesSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [server] 段：监听地址与关闭时等待进行中轮次的时长
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_drain_timeout_secs() -> u64 {
    30
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// 执行环境后端
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentBackend {
    /// 本机目录 + 子进程
    #[default]
    Local,
    /// 内存模拟（不运行真实命令，回放 mock_agent_lines）
    Mock,
}

/// [environment] 段：沙箱规格与租约
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentSection {
    #[serde(default)]
    pub backend: EnvironmentBackend,
    /// local 后端的根目录，未设置时用 ./environments
    pub root: Option<PathBuf>,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// 空闲多久后环境自动失效
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// 存储中环境句柄的 TTL，必须小于 idle_timeout_secs
    #[serde(default = "default_handle_ttl_secs")]
    pub handle_ttl_secs: u64,
    /// mock 后端回放的 Agent 输出行
    #[serde(default)]
    pub mock_agent_lines: Vec<String>,
}

fn default_vcpus() -> u32 {
    2
}

fn default_runtime() -> String {
    "node22".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    15 * 60
}

fn default_handle_ttl_secs() -> u64 {
    14 * 60
}

impl Default for EnvironmentSection {
    fn default() -> Self {
        Self {
            backend: EnvironmentBackend::default(),
            root: None,
            vcpus: default_vcpus(),
            runtime: default_runtime(),
            idle_timeout_secs: default_idle_timeout_secs(),
            handle_ttl_secs: default_handle_ttl_secs(),
            mock_agent_lines: Vec::new(),
        }
    }
}

impl EnvironmentSection {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn handle_ttl(&self) -> Duration {
        Duration::from_secs(self.handle_ttl_secs)
    }
}

/// 多轮续接策略
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContinuityMode {
    /// Agent 自带记忆：保存续接令牌，下一轮带 --resume
    #[default]
    Resume,
    /// Agent 无记忆：保存有界对话记录，作为提示上下文回放
    Transcript,
}

/// [agent] 段：命令行 Agent 的调用方式
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    #[serde(default = "default_resume_flag")]
    pub resume_flag: String,
    /// API Key 所在的环境变量名（同名传入沙箱）
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// 新环境的一次性安装命令；为空则跳过安装
    #[serde(default = "default_install_command")]
    pub install_command: Option<String>,
    #[serde(default)]
    pub continuity: ContinuityMode,
    /// 续接令牌 TTL，不得超过环境空闲超时
    #[serde(default = "default_continuation_ttl_secs")]
    pub continuation_ttl_secs: u64,
}

fn default_agent_command() -> String {
    "cursor-agent".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec![
        "-p".into(),
        "--force".into(),
        "--output-format".into(),
        "stream-json".into(),
        "--stream-partial-output".into(),
    ]
}

fn default_resume_flag() -> String {
    "--resume".to_string()
}

fn default_api_key_env() -> String {
    "CURSOR_API_KEY".to_string()
}

fn default_install_command() -> Option<String> {
    Some("curl https://cursor.com/install -fsSL | bash".to_string())
}

fn default_continuation_ttl_secs() -> u64 {
    14 * 60
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
            resume_flag: default_resume_flag(),
            api_key_env: default_api_key_env(),
            install_command: default_install_command(),
            continuity: ContinuityMode::default(),
            continuation_ttl_secs: default_continuation_ttl_secs(),
        }
    }
}

impl AgentSection {
    pub fn continuation_ttl(&self) -> Duration {
        Duration::from_secs(self.continuation_ttl_secs)
    }
}

/// 会话存储后端
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    /// Upstash Redis REST
    Upstash,
}

/// [store] 段：会话存储与对话记录
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    /// REST 地址；未设置时读 url_env 指向的环境变量
    pub url: Option<String>,
    #[serde(default = "default_url_env")]
    pub url_env: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_transcript_max_entries")]
    pub transcript_max_entries: usize,
    #[serde(default = "default_transcript_ttl_secs")]
    pub transcript_ttl_secs: u64,
}

fn default_url_env() -> String {
    "UPSTASH_REDIS_REST_URL".to_string()
}

fn default_token_env() -> String {
    "UPSTASH_REDIS_REST_TOKEN".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_transcript_max_entries() -> usize {
    50
}

fn default_transcript_ttl_secs() -> u64 {
    60 * 60
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            url_env: default_url_env(),
            token_env: default_token_env(),
            request_timeout_secs: default_request_timeout_secs(),
            transcript_max_entries: default_transcript_max_entries(),
            transcript_ttl_secs: default_transcript_ttl_secs(),
        }
    }
}

impl StoreSection {
    pub fn transcript_ttl(&self) -> Duration {
        Duration::from_secs(self.transcript_ttl_secs)
    }
}

/// [slides] 段
#[derive(Debug, Clone, Deserialize)]
pub struct SlidesSection {
    /// 多少个前导空格视为「观众可见」
    #[serde(default = "default_visible_indent")]
    pub visible_indent: usize,
}

fn default_visible_indent() -> usize {
    crate::slides::DEFAULT_VISIBLE_INDENT
}

impl Default for SlidesSection {
    fn default() -> Self {
        Self {
            visible_indent: default_visible_indent(),
        }
    }
}

/// [references] 段：写入沙箱的静态参考文件；未设置时使用内置版本
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReferencesSection {
    pub rules_path: Option<PathBuf>,
    pub sample_path: Option<PathBuf>,
}

/// 配置语义校验失败
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("environment.handle_ttl_secs ({handle}) must be less than environment.idle_timeout_secs ({idle})")]
    HandleOutlivesEnvironment { handle: u64, idle: u64 },

    #[error("agent.continuation_ttl_secs ({token}) must not exceed environment.idle_timeout_secs ({idle})")]
    TokenOutlivesEnvironment { token: u64, idle: u64 },

    #[error("store.transcript_max_entries must be at least 1")]
    EmptyTranscript,
}

impl AppConfig {
    /// 租约关系校验：存储里的指针不能比它指向的环境活得更久
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let idle = self.environment.idle_timeout_secs;
        if self.environment.handle_ttl_secs >= idle {
            return Err(ConfigValidationError::HandleOutlivesEnvironment {
                handle: self.environment.handle_ttl_secs,
                idle,
            });
        }
        if self.agent.continuation_ttl_secs > idle {
            return Err(ConfigValidationError::TokenOutlivesEnvironment {
                token: self.agent.continuation_ttl_secs,
                idle,
            });
        }
        if self.store.transcript_max_entries == 0 {
            return Err(ConfigValidationError::EmptyTranscript);
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 DECKMIND__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DECKMIND__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DECKMIND")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.environment.idle_timeout_secs, 900);
        assert_eq!(cfg.environment.handle_ttl_secs, 840);
        assert_eq!(cfg.store.transcript_max_entries, 50);
        assert_eq!(cfg.agent.continuity, ContinuityMode::Resume);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_handle_ttl_must_be_shorter_than_idle_timeout() {
        let mut cfg = AppConfig::default();
        cfg.environment.handle_ttl_secs = cfg.environment.idle_timeout_secs;
        assert_eq!(
            cfg.validate(),
            Err(ConfigValidationError::HandleOutlivesEnvironment { handle: 900, idle: 900 })
        );
    }

    #[test]
    fn test_token_ttl_may_equal_idle_timeout() {
        let mut cfg = AppConfig::default();
        cfg.agent.continuation_ttl_secs = cfg.environment.idle_timeout_secs;
        assert!(cfg.validate().is_ok());
        cfg.agent.continuation_ttl_secs += 1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigValidationError::TokenOutlivesEnvironment { .. })
        ));
    }

    #[test]
    fn test_partial_toml_keeps_section_defaults() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[agent]\ncontinuity = \"transcript\"\n[environment]\nbackend = \"mock\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .and_then(|c| c.try_deserialize())
            .unwrap();
        assert_eq!(cfg.agent.continuity, ContinuityMode::Transcript);
        assert_eq!(cfg.agent.command, "cursor-agent");
        assert_eq!(cfg.environment.backend, EnvironmentBackend::Mock);
        assert_eq!(cfg.environment.vcpus, 2);
    }
}
