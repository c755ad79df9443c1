//! 环境内文件读写
//!
//! 写文件走 bash heredoc。heredoc 不加引号时会展开 `$`、反引号与反斜杠，所以正文先转义这三个字符；
//! 结束标记每次随机生成，正文里的任何一行都无法提前关闭 heredoc。
//! heredoc 总会在末尾多出一个换行，写入前用 `${BODY%?}` 去掉，读回的字节与原文完全一致。
//!
//! 脚本是 `bash -c` 的单个参数，Linux 上单个参数不能超过 128 KiB；
//! 超过 [`INLINE_WRITE_LIMIT`] 的内容改为 `cat > path`，正文经 stdin 传入。

use std::path::Path;

use crate::config::ReferencesSection;

use super::{CommandPurpose, CommandRequest};

/// Agent 编辑的文档
pub const DOCUMENT_FILE: &str = "presentation.md";
/// 格式规则参考
pub const RULES_FILE: &str = "RULES.md";
/// 示例参考
pub const SAMPLE_FILE: &str = "sample.md";

const BODY_VAR: &str = "DECKMIND_BODY";

/// heredoc 正文的最大字节数（转义后）
pub const INLINE_WRITE_LIMIT: usize = 64 * 1024;

/// 转义 heredoc 正文中的 `\`、`$`、反引号
pub fn escape_heredoc(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for c in content.chars() {
        if matches!(c, '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// escape_heredoc 的逆操作
pub fn unescape_heredoc(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if matches!(next, '\\' | '$' | '`') {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// 单引号包裹；内部的 `'` 写成 `'\''`。单引号内没有任何字符有特殊含义。
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn shell_unquote(quoted: &str) -> Option<String> {
    let inner = quoted.strip_prefix('\'')?.strip_suffix('\'')?;
    Some(inner.replace(r"'\''", "'"))
}

/// 生成写文件命令
pub fn write_file_command(path: &str, content: &str) -> CommandRequest {
    let body = escape_heredoc(content);
    if body.len() > INLINE_WRITE_LIMIT {
        let script = format!("cat > {}", shell_quote(path));
        return CommandRequest::bash(CommandPurpose::WriteFile, script).stdin(content);
    }

    let marker = format!("DECKMIND_EOF_{}", uuid::Uuid::new_v4().simple());
    let script = format!(
        "IFS= read -r -d '' {var} <<{marker} || true\n{body}\n{marker}\nprintf '%s' \"${{{var}%?}}\" > {path}",
        var = BODY_VAR,
        marker = marker,
        body = body,
        path = shell_quote(path),
    );
    CommandRequest::bash(CommandPurpose::WriteFile, script)
}

/// 从 write_file_command 生成的命令中还原 (路径, 内容)；模拟环境用它来维护文件
pub fn parse_write_command(request: &CommandRequest) -> Option<(String, String)> {
    let script = request.script()?;
    if let Some(content) = &request.stdin {
        let path = shell_unquote(script.strip_prefix("cat > ")?)?;
        return Some((path, content.clone()));
    }
    let (header, rest) = script.split_once('\n')?;
    let marker = header.split_once("<<")?.1.split_whitespace().next()?;
    let (body, tail) = rest.rsplit_once(&format!("\n{}\n", marker))?;
    let path = shell_unquote(tail.rsplit_once("> ")?.1.trim())?;
    Some((path, unescape_heredoc(body)))
}

/// 生成读文件命令（原样输出到 stdout）
pub fn read_file_command(path: &str) -> CommandRequest {
    CommandRequest::new(CommandPurpose::ReadFile, "cat").arg(path)
}

/// 每轮写入环境的两份静态参考文件，内容不做解释
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceFiles {
    pub rules: String,
    pub sample: String,
}

impl ReferenceFiles {
    /// 内置版本
    pub fn bundled() -> Self {
        Self {
            rules: include_str!("../../assets/RULES.md").to_string(),
            sample: include_str!("../../assets/sample.md").to_string(),
        }
    }

    /// 按配置加载，未配置的使用内置版本
    pub async fn load(cfg: &ReferencesSection) -> std::io::Result<Self> {
        let bundled = Self::bundled();
        let rules = read_or(cfg.rules_path.as_deref(), bundled.rules).await?;
        let sample = read_or(cfg.sample_path.as_deref(), bundled.sample).await?;
        Ok(Self { rules, sample })
    }

    /// (文件名, 内容)
    pub fn files(&self) -> [(&'static str, &str); 2] {
        [(RULES_FILE, self.rules.as_str()), (SAMPLE_FILE, self.sample.as_str())]
    }
}

async fn read_or(path: Option<&Path>, fallback: String) -> std::io::Result<String> {
    match path {
        Some(p) => tokio::fs::read_to_string(p).await,
        None => Ok(fallback),
    }
}
