//! 轮次错误类型
//!
//! 所有致命错误都在轮次边界被捕获，转成一段可读文本追加到仍然打开的响应流末尾，再正常关闭流。
//! 单行事件解码失败不属于这里：它是 `AgentEvent::Ignored`，记录日志后跳过。

use thiserror::Error;

use crate::store::StoreError;

/// 一轮对话中可能出现的致命错误
#[derive(Error, Debug)]
pub enum TurnError {
    /// 环境创建失败（不重试：创建代价高，重试可能级联）
    #[error("Failed to create environment: {0}")]
    EnvironmentUnavailable(String),

    /// 新环境的一次性安装失败
    #[error("Failed to install agent runtime: {0}")]
    SetupFailed(String),

    #[error("Failed to write {file}: {reason}")]
    FileSyncFailed { file: String, reason: String },

    /// Agent 进程非零退出，附带 stderr
    #[error("Agent CLI failed: {0}")]
    AgentInvocationFailed(String),

    /// Agent 跑完后读不回文档；客户端手里的旧内容仍是最后的有效版本
    #[error("Failed to read {file}: {reason}")]
    ResultReadFailed { file: String, reason: String },

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),
}

impl TurnError {
    /// 日志与指标用的短标签
    pub fn kind(&self) -> &'static str {
        match self {
            TurnError::EnvironmentUnavailable(_) => "environment_unavailable",
            TurnError::SetupFailed(_) => "setup_failed",
            TurnError::FileSyncFailed { .. } => "file_sync_failed",
            TurnError::AgentInvocationFailed(_) => "agent_invocation_failed",
            TurnError::ResultReadFailed { .. } => "result_read_failed",
            TurnError::Store(_) => "store",
        }
    }
}

/// 命令失败时的 stderr 摘要；空 stderr 用 "Unknown error"
pub(crate) fn stderr_or_unknown(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        "Unknown error".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_human_readable() {
        let err = TurnError::AgentInvocationFailed(stderr_or_unknown("  \n"));
        assert_eq!(err.to_string(), "Agent CLI failed: Unknown error");
        assert_eq!(err.kind(), "agent_invocation_failed");

        let err = TurnError::ResultReadFailed {
            file: "presentation.md".into(),
            reason: "exit 1".into(),
        };
        assert_eq!(err.to_string(), "Failed to read presentation.md: exit 1");
    }
}
