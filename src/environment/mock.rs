//! 内存模拟环境：不执行任何真实命令
//!
//! 写文件命令被解析回 (路径, 内容) 存进内存；读文件直接返回；
//! Agent 命令按 [`MockAgentScript`] 逐行回放 stdout，并可选地改写文档。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::files::{parse_write_command, DOCUMENT_FILE};
use super::{
    CommandOutput, CommandPurpose, CommandRequest, Environment, EnvironmentError,
    EnvironmentProvider, EnvironmentSpec,
};

/// 模拟 Agent 的一次运行
#[derive(Debug, Clone, Default)]
pub struct MockAgentScript {
    /// 依次输出到 stdout 的行
    pub lines: Vec<String>,
    pub exit_code: i32,
    pub stderr: String,
    /// 运行结束后写入 presentation.md 的内容；None 表示不改动
    pub document_after: Option<String>,
    /// 安装步骤失败时的 stderr
    pub setup_failure: Option<String>,
    /// 每输出一行后的停顿
    pub line_delay: Duration,
}

/// Agent 运行的起止记录
pub const AGENT_STARTED: &str = "agent_started";
pub const AGENT_FINISHED: &str = "agent_finished";

pub struct MockEnvironment {
    id: String,
    script: Arc<RwLock<MockAgentScript>>,
    files: Mutex<HashMap<String, String>>,
    commands: Mutex<Vec<CommandRequest>>,
    agent_log: Arc<Mutex<Vec<String>>>,
}

impl MockEnvironment {
    /// 迄今收到的全部命令
    pub async fn commands(&self) -> Vec<CommandRequest> {
        self.commands.lock().await.clone()
    }

    pub async fn file(&self, path: &str) -> Option<String> {
        self.files.lock().await.get(path).cloned()
    }

    pub async fn put_file(&self, path: &str, content: &str) {
        self.files
            .lock()
            .await
            .insert(path.to_string(), content.to_string());
    }
}

fn exit(code: i32, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

#[async_trait]
impl Environment for MockEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &self,
        request: &CommandRequest,
        stdout_lines: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<CommandOutput, EnvironmentError> {
        self.commands.lock().await.push(request.clone());

        let output = match request.purpose {
            CommandPurpose::Setup => match &self.script.read().await.setup_failure {
                Some(stderr) => exit(1, stderr.clone()),
                None => exit(0, ""),
            },
            CommandPurpose::WriteFile => match parse_write_command(request) {
                Some((path, content)) => {
                    self.files.lock().await.insert(path, content);
                    exit(0, "")
                }
                None => exit(2, "unrecognised write command"),
            },
            CommandPurpose::ReadFile => {
                let path = request.args.first().map(String::as_str).unwrap_or_default();
                match self.files.lock().await.get(path) {
                    Some(content) => CommandOutput {
                        exit_code: 0,
                        stdout: content.clone(),
                        stderr: String::new(),
                    },
                    None => exit(1, format!("cat: {}: No such file or directory", path)),
                }
            }
            CommandPurpose::Agent => {
                let script = self.script.read().await.clone();
                self.agent_log.lock().await.push(AGENT_STARTED.to_string());
                let mut stdout = String::new();
                for line in &script.lines {
                    stdout.push_str(line);
                    stdout.push('\n');
                    if let Some(tx) = &stdout_lines {
                        let _ = tx.send(line.clone());
                    }
                    if script.line_delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(script.line_delay).await;
                    }
                }
                if let Some(doc) = script.document_after {
                    self.files.lock().await.insert(DOCUMENT_FILE.to_string(), doc);
                }
                self.agent_log.lock().await.push(AGENT_FINISHED.to_string());
                CommandOutput {
                    exit_code: script.exit_code,
                    stdout,
                    stderr: script.stderr,
                }
            }
        };
        Ok(output)
    }
}

/// 模拟环境后端；所有环境共享同一份 Agent 脚本
pub struct MockEnvironmentProvider {
    script: Arc<RwLock<MockAgentScript>>,
    environments: RwLock<HashMap<String, Arc<MockEnvironment>>>,
    created: AtomicUsize,
    create_failure: RwLock<Option<String>>,
    agent_log: Arc<Mutex<Vec<String>>>,
}

impl MockEnvironmentProvider {
    pub fn new(script: MockAgentScript) -> Self {
        Self {
            script: Arc::new(RwLock::new(script)),
            environments: RwLock::new(HashMap::new()),
            created: AtomicUsize::new(0),
            create_failure: RwLock::new(None),
            agent_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 替换之后所有 Agent 运行的脚本
    pub async fn set_script(&self, script: MockAgentScript) {
        *self.script.write().await = script;
    }

    /// Some(reason) 时 create 一律失败
    pub async fn fail_creation(&self, reason: Option<String>) {
        *self.create_failure.write().await = reason;
    }

    /// 所有环境里 Agent 运行的起止顺序（[`AGENT_STARTED`] / [`AGENT_FINISHED`]）
    pub async fn agent_log(&self) -> Vec<String> {
        self.agent_log.lock().await.clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub async fn environment(&self, environment_id: &str) -> Option<Arc<MockEnvironment>> {
        self.environments.read().await.get(environment_id).cloned()
    }

    /// 模拟环境被回收
    pub async fn expire(&self, environment_id: &str) -> bool {
        self.environments
            .write()
            .await
            .remove(environment_id)
            .is_some()
    }
}

#[async_trait]
impl EnvironmentProvider for MockEnvironmentProvider {
    async fn create(&self, _spec: &EnvironmentSpec) -> Result<Arc<dyn Environment>, EnvironmentError> {
        if let Some(reason) = self.create_failure.read().await.clone() {
            return Err(EnvironmentError::Create(reason));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let env = Arc::new(MockEnvironment {
            id: format!("mock-env-{}", n),
            script: Arc::clone(&self.script),
            files: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            agent_log: Arc::clone(&self.agent_log),
        });
        self.environments
            .write()
            .await
            .insert(env.id.clone(), Arc::clone(&env));
        Ok(env)
    }

    async fn resolve(&self, environment_id: &str) -> Result<Arc<dyn Environment>, EnvironmentError> {
        match self.environment(environment_id).await {
            Some(env) => Ok(env),
            None => Err(EnvironmentError::NotFound(environment_id.to_string())),
        }
    }
}
