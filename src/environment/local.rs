//! 本机执行环境：每个环境是根目录下的一个私有工作目录
//!
//! 命令通过 tokio 子进程在该目录内执行；每次执行都会续期，命令运行期间环境不会过期。
//! 空闲超过 idle_timeout 后在 resolve / sweep 时删除目录并视为失效。
//! 上一个进程留下的 `env_*` 目录不在内存表里，打开后端时一并清掉。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::{
    CommandOutput, CommandRequest, Environment, EnvironmentError, EnvironmentProvider,
    EnvironmentSpec,
};

/// 环境目录名前缀
const ENV_DIR_PREFIX: &str = "env_";

pub struct LocalEnvironment {
    id: String,
    dir: PathBuf,
    idle_timeout: Duration,
    last_active: Mutex<Instant>,
    /// 正在执行的命令数
    running: AtomicUsize,
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LocalEnvironment {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn touch(&self) {
        *self.last_active.lock().await = Instant::now();
    }

    async fn is_expired(&self) -> bool {
        if self.running.load(Ordering::SeqCst) > 0 {
            return false;
        }
        self.last_active.lock().await.elapsed() > self.idle_timeout
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &self,
        request: &CommandRequest,
        stdout_lines: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<CommandOutput, EnvironmentError> {
        let _running = RunningGuard::enter(&self.running);
        self.touch().await;
        tracing::debug!(
            environment_id = %self.id,
            purpose = %request.purpose,
            cmd = %request.cmd,
            stdin_bytes = request.stdin.as_ref().map_or(0, String::len),
            "running command"
        );

        let stdin_mode = if request.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let mut child = Command::new(&request.cmd)
            .args(&request.args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.dir)
            .stdin(stdin_mode)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let write_stdin = async {
            if let (Some(mut pipe), Some(body)) = (stdin, request.stdin.as_deref()) {
                match pipe.write_all(body.as_bytes()).await {
                    // 子进程提前退出，以退出码为准
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                    other => other?,
                }
            }
            Ok::<_, std::io::Error>(())
        };

        let read_stdout = async move {
            let mut all = Vec::new();
            if let Some(out) = stdout {
                let mut reader = BufReader::new(out);
                let mut line = Vec::new();
                loop {
                    line.clear();
                    if reader.read_until(b'\n', &mut line).await? == 0 {
                        break;
                    }
                    all.extend_from_slice(&line);
                    if let Some(tx) = &stdout_lines {
                        let text = String::from_utf8_lossy(&line);
                        let _ = tx.send(text.trim_end_matches(&['\n', '\r'][..]).to_string());
                    }
                }
            }
            Ok::<_, std::io::Error>(all)
        };
        let read_stderr = async move {
            let mut buf = Vec::new();
            if let Some(mut err) = stderr {
                err.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };

        let ((), out, err) = tokio::try_join!(write_stdin, read_stdout, read_stderr)?;
        let status = child.wait().await?;
        self.touch().await;

        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
        })
    }
}

pub struct LocalEnvironmentProvider {
    root: PathBuf,
    environments: RwLock<HashMap<String, Arc<LocalEnvironment>>>,
}

impl LocalEnvironmentProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            environments: RwLock::new(HashMap::new()),
        }
    }

    /// 创建后端并清理根目录下遗留的环境目录
    pub async fn open(root: impl Into<PathBuf>) -> Self {
        let provider = Self::new(root);
        let removed = provider.remove_stale_directories().await;
        if removed > 0 {
            tracing::info!(removed, root = %provider.root.display(), "stale environment directories removed");
        }
        provider
    }

    /// 删除根目录下不属于任何已知环境的 `env_*` 目录，返回删除数量
    pub async fn remove_stale_directories(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                tracing::warn!(root = %self.root.display(), error = %e, "failed to list environment root");
                return 0;
            }
        };

        let known: Vec<String> = self.environments.read().await.keys().cloned().collect();
        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read environment root entry");
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(ENV_DIR_PREFIX) || known.contains(&name) {
                continue;
            }
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(dir = %name, error = %e, "failed to remove stale environment directory"),
            }
        }
        removed
    }

    async fn discard(&self, env: &LocalEnvironment) {
        self.environments.write().await.remove(&env.id);
        if let Err(e) = tokio::fs::remove_dir_all(&env.dir).await {
            tracing::warn!(environment_id = %env.id, error = %e, "failed to remove expired environment");
        }
    }
}

#[async_trait]
impl EnvironmentProvider for LocalEnvironmentProvider {
    async fn create(&self, spec: &EnvironmentSpec) -> Result<Arc<dyn Environment>, EnvironmentError> {
        let id = format!("{}{}", ENV_DIR_PREFIX, uuid::Uuid::new_v4().simple());
        let dir = self.root.join(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EnvironmentError::Create(format!("{}: {}", dir.display(), e)))?;

        let env = Arc::new(LocalEnvironment {
            id: id.clone(),
            dir,
            idle_timeout: spec.idle_timeout,
            last_active: Mutex::new(Instant::now()),
            running: AtomicUsize::new(0),
        });
        self.environments.write().await.insert(id.clone(), Arc::clone(&env));
        tracing::info!(
            environment_id = %id,
            vcpus = spec.vcpus,
            runtime = %spec.runtime,
            idle_timeout_secs = spec.idle_timeout.as_secs(),
            "local environment created"
        );
        Ok(env)
    }

    async fn resolve(&self, environment_id: &str) -> Result<Arc<dyn Environment>, EnvironmentError> {
        let env = self
            .environments
            .read()
            .await
            .get(environment_id)
            .cloned()
            .ok_or_else(|| EnvironmentError::NotFound(environment_id.to_string()))?;
        if env.is_expired().await {
            self.discard(&env).await;
            return Err(EnvironmentError::Expired(environment_id.to_string()));
        }
        Ok(env)
    }

    async fn sweep_expired(&self) -> usize {
        let all: Vec<Arc<LocalEnvironment>> =
            self.environments.read().await.values().cloned().collect();
        let mut removed = 0;
        for env in all {
            if env.is_expired().await {
                self.discard(&env).await;
                removed += 1;
            }
        }
        removed
    }
}
