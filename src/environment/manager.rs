//! 环境生命周期管理
//!
//! 每个文档至多对应一个「最近已知」环境，其 id 存在会话存储里。
//! 找得回就复用并续期句柄；找不回（过期、被回收）就新建，并只在新建时做一次性安装。
//! 环境从不由这里主动销毁，空闲超时后由后端自行回收。

use std::sync::Arc;
use std::time::Duration;

use crate::core::error::{stderr_or_unknown, TurnError};
use crate::observability::Metrics;
use crate::store::{DocumentSessions, EnvironmentHandle};
use crate::turn::TurnSink;

use super::files::{write_file_command, ReferenceFiles};
use super::{
    CommandPurpose, CommandRequest, Environment, EnvironmentError, EnvironmentProvider,
    EnvironmentSpec,
};

/// acquire 的结果
pub struct AcquiredEnvironment {
    pub environment: Arc<dyn Environment>,
    /// 本轮新建（已完成安装）；复用时为 false
    pub freshly_created: bool,
}

pub struct EnvironmentManager {
    provider: Arc<dyn EnvironmentProvider>,
    sessions: DocumentSessions,
    spec: EnvironmentSpec,
    handle_ttl: Duration,
    install_command: Option<String>,
    references: ReferenceFiles,
}

impl EnvironmentManager {
    pub fn new(
        provider: Arc<dyn EnvironmentProvider>,
        sessions: DocumentSessions,
        spec: EnvironmentSpec,
        handle_ttl: Duration,
        install_command: Option<String>,
        references: ReferenceFiles,
    ) -> Self {
        Self {
            provider,
            sessions,
            spec,
            handle_ttl,
            install_command,
            references,
        }
    }

    pub fn provider(&self) -> &Arc<dyn EnvironmentProvider> {
        &self.provider
    }

    pub fn references(&self) -> &ReferenceFiles {
        &self.references
    }

    /// 取得文档的执行环境：优先复用存储中的句柄，否则新建并安装
    pub async fn acquire(
        &self,
        document_id: &str,
        sink: &TurnSink,
    ) -> Result<AcquiredEnvironment, TurnError> {
        if let Some(handle) = self.sessions.environment_handle(document_id).await? {
            match self.provider.resolve(&handle.environment_id).await {
                Ok(environment) => {
                    self.save_handle(document_id, environment.as_ref()).await?;
                    Metrics::global().environment_reused();
                    tracing::info!(
                        document_id,
                        environment_id = %handle.environment_id,
                        "reusing environment"
                    );
                    return Ok(AcquiredEnvironment {
                        environment,
                        freshly_created: false,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        document_id,
                        environment_id = %handle.environment_id,
                        error = %e,
                        "stored environment is unavailable, creating a new one"
                    );
                }
            }
        }

        sink.narrate("[Creating secure environment...]\n\n");
        let environment = self.provider.create(&self.spec).await.map_err(|e| {
            let reason = match e {
                EnvironmentError::Create(reason) => reason,
                other => other.to_string(),
            };
            TurnError::EnvironmentUnavailable(reason)
        })?;
        Metrics::global().environment_created();
        tracing::info!(
            document_id,
            environment_id = %environment.id(),
            "environment created"
        );

        self.setup(environment.as_ref(), sink).await?;
        self.save_handle(document_id, environment.as_ref()).await?;

        Ok(AcquiredEnvironment {
            environment,
            freshly_created: true,
        })
    }

    /// 新环境的一次性准备：安装 Agent 运行时，写入参考文件
    async fn setup(&self, environment: &dyn Environment, sink: &TurnSink) -> Result<(), TurnError> {
        if let Some(install) = self.install_command.as_deref().filter(|c| !c.trim().is_empty()) {
            sink.narrate("[Installing agent runtime...]\n\n");
            let output = environment
                .run(&CommandRequest::bash(CommandPurpose::Setup, install), None)
                .await
                .map_err(|e| TurnError::SetupFailed(e.to_string()))?;
            if !output.success() {
                tracing::error!(
                    environment_id = %environment.id(),
                    exit_code = output.exit_code,
                    "agent runtime install failed"
                );
                return Err(TurnError::SetupFailed(stderr_or_unknown(&output.stderr)));
            }
            sink.narrate("[Agent runtime installed]\n\n");
        }

        sink.narrate("[Setting up files...]\n\n");
        self.write_references(environment).await
    }

    /// 写入两份参考文件
    pub async fn write_references(&self, environment: &dyn Environment) -> Result<(), TurnError> {
        for (name, content) in self.references.files() {
            write_file(environment, name, content).await?;
        }
        Ok(())
    }

    async fn save_handle(
        &self,
        document_id: &str,
        environment: &dyn Environment,
    ) -> Result<(), TurnError> {
        let handle = EnvironmentHandle {
            environment_id: environment.id().to_string(),
        };
        self.sessions
            .save_environment_handle(document_id, &handle, self.handle_ttl)
            .await?;
        Ok(())
    }
}

/// 把内容原样写入环境内的文件
pub async fn write_file(
    environment: &dyn Environment,
    path: &str,
    content: &str,
) -> Result<(), TurnError> {
    let sync_failed = |reason: String| TurnError::FileSyncFailed {
        file: path.to_string(),
        reason,
    };
    let output = environment
        .run(&write_file_command(path, content), None)
        .await
        .map_err(|e| sync_failed(e.to_string()))?;
    if !output.success() {
        return Err(sync_failed(stderr_or_unknown(&output.stderr)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::files::{RULES_FILE, SAMPLE_FILE};
    use crate::environment::{MockAgentScript, MockEnvironmentProvider};
    use crate::store::MemoryKvStore;

    struct Fixture {
        provider: Arc<MockEnvironmentProvider>,
        sessions: DocumentSessions,
        manager: EnvironmentManager,
    }

    fn fixture(script: MockAgentScript) -> Fixture {
        let provider = Arc::new(MockEnvironmentProvider::new(script));
        let sessions = DocumentSessions::new(Arc::new(MemoryKvStore::new()));
        let manager = EnvironmentManager::new(
            provider.clone(),
            sessions.clone(),
            EnvironmentSpec {
                vcpus: 2,
                idle_timeout: Duration::from_secs(900),
                runtime: "node22".into(),
            },
            Duration::from_secs(840),
            Some("install-agent".into()),
            ReferenceFiles {
                rules: "rules".into(),
                sample: "sample".into(),
            },
        );
        Fixture {
            provider,
            sessions,
            manager,
        }
    }

    async fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<crate::protocol::WireEvent>) -> String {
        let mut out = String::new();
        while let Ok(event) = rx.try_recv() {
            out.push_str(&event.encode());
        }
        out
    }

    #[tokio::test]
    async fn test_fresh_then_reuse() {
        let f = fixture(MockAgentScript::default());
        let (sink, mut rx) = TurnSink::channel();

        let first = f.manager.acquire("doc", &sink).await.unwrap();
        assert!(first.freshly_created);
        let narration = drain(&mut rx).await;
        assert!(narration.contains("[Creating secure environment...]"));
        assert!(narration.contains("[Agent runtime installed]"));

        let id = first.environment.id().to_string();
        assert_eq!(
            f.sessions.environment_handle("doc").await.unwrap(),
            Some(EnvironmentHandle {
                environment_id: id.clone()
            })
        );
        let mock = f.provider.environment(&id).await.unwrap();
        assert_eq!(mock.file(RULES_FILE).await.as_deref(), Some("rules"));
        assert_eq!(mock.file(SAMPLE_FILE).await.as_deref(), Some("sample"));
        let setup_commands = mock.commands().await.len();

        let second = f.manager.acquire("doc", &sink).await.unwrap();
        assert!(!second.freshly_created);
        assert_eq!(second.environment.id(), id);
        assert_eq!(mock.commands().await.len(), setup_commands);
        assert_eq!(drain(&mut rx).await, "");
        assert_eq!(f.provider.created_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_handle_creates_new_environment() {
        let f = fixture(MockAgentScript::default());
        let (sink, _rx) = TurnSink::channel();
        let first = f.manager.acquire("doc", &sink).await.unwrap();
        f.provider.expire(first.environment.id()).await;

        let second = f.manager.acquire("doc", &sink).await.unwrap();
        assert!(second.freshly_created);
        assert_ne!(second.environment.id(), first.environment.id());
        assert_eq!(
            f.sessions
                .environment_handle("doc")
                .await
                .unwrap()
                .map(|h| h.environment_id),
            Some(second.environment.id().to_string())
        );
    }

    #[tokio::test]
    async fn test_setup_failure_does_not_store_handle() {
        let f = fixture(MockAgentScript {
            setup_failure: Some("curl: network unreachable".into()),
            ..Default::default()
        });
        let (sink, _rx) = TurnSink::channel();
        let err = f.manager.acquire("doc", &sink).await.err().unwrap();
        assert!(matches!(err, TurnError::SetupFailed(ref s) if s == "curl: network unreachable"));
        assert_eq!(f.sessions.environment_handle("doc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_failure_is_environment_unavailable() {
        let f = fixture(MockAgentScript::default());
        f.provider.fail_creation(Some("quota exceeded".into())).await;
        let (sink, _rx) = TurnSink::channel();
        let err = f.manager.acquire("doc", &sink).await.err().unwrap();
        assert_eq!(err.to_string(), "Failed to create environment: quota exceeded");
    }
}
