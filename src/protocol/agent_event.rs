//! Agent 输出事件解码
//!
//! Agent 以 `--output-format stream-json` 运行，每行一个 JSON 对象：
//! - `{"type":"assistant","message":{"content":[{"text":"..."}]}}` → 叙述片段
//! - `{"type":"tool_call","subtype":"started","tool_call":{"writeToolCall":{"args":{"path":"..."}}}}` → 工具提示
//! - `{"type":"result","duration_ms":1234,"session_id":"..."}` → 本轮结束（带续接令牌）
//!
//! 解码是宽松的：非 JSON、未知 type、缺字段都落到 `Ignored`，绝不中断后续行。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 工具调用类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Write,
    Read,
    Edit,
}

impl ToolKind {
    fn verb(self) -> &'static str {
        match self {
            ToolKind::Write => "Writing",
            ToolKind::Read => "Reading",
            ToolKind::Edit => "Editing",
        }
    }

    /// 展示给用户的短提示，如 `\n[Writing presentation.md...]\n`
    pub fn notice(self, path: &str) -> String {
        format!("\n[{} {}...]\n", self.verb(), path)
    }
}

/// 单行解码结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Narration { text: String },
    ToolNotice { kind: ToolKind, path: String },
    Completion {
        duration_ms: u64,
        continuation_token: Option<String>,
    },
    Ignored { reason: IgnoreReason },
}

/// 为什么跳过这一行
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    Blank,
    /// 不是合法 JSON，或结构与已知事件不符
    Malformed(String),
    UnknownType(String),
    /// 合法但无需展示（如 tool_call completed、无文本的 assistant 消息）
    Uninteresting,
}

impl AgentEvent {
    pub fn is_ignored(&self) -> bool {
        matches!(self, AgentEvent::Ignored { .. })
    }

    fn ignored(reason: IgnoreReason) -> Self {
        AgentEvent::Ignored { reason }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawEvent {
    Assistant {
        #[serde(default)]
        message: Option<RawMessage>,
    },
    ToolCall {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        tool_call: Option<RawToolCall>,
    },
    Result {
        #[serde(default)]
        duration_ms: Option<f64>,
        #[serde(default)]
        session_id: Option<String>,
    },
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Vec<RawContentBlock>,
}

#[derive(Deserialize)]
struct RawContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct RawToolCall {
    #[serde(rename = "writeToolCall")]
    write: Option<RawToolArgs>,
    #[serde(rename = "readToolCall")]
    read: Option<RawToolArgs>,
    #[serde(rename = "editToolCall")]
    edit: Option<RawToolArgs>,
}

#[derive(Deserialize)]
struct RawToolArgs {
    #[serde(default)]
    args: Option<RawPathArgs>,
}

#[derive(Deserialize)]
struct RawPathArgs {
    #[serde(default)]
    path: Option<String>,
}

const KNOWN_TYPES: &[&str] = &["assistant", "tool_call", "result"];

/// 解码一行 Agent 输出
pub fn decode_line(line: &str) -> AgentEvent {
    let line = line.trim();
    if line.is_empty() {
        return AgentEvent::ignored(IgnoreReason::Blank);
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return AgentEvent::ignored(IgnoreReason::Malformed(e.to_string())),
    };

    let event_type = value.get("type").and_then(Value::as_str).unwrap_or_default();
    if !KNOWN_TYPES.contains(&event_type) {
        return AgentEvent::ignored(IgnoreReason::UnknownType(event_type.to_string()));
    }

    let raw: RawEvent = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => return AgentEvent::ignored(IgnoreReason::Malformed(e.to_string())),
    };

    match raw {
        RawEvent::Assistant { message } => message
            .and_then(|m| m.content.into_iter().find_map(|block| block.text))
            .filter(|text| !text.is_empty())
            .map(|text| AgentEvent::Narration { text })
            .unwrap_or_else(|| AgentEvent::ignored(IgnoreReason::Uninteresting)),
        RawEvent::ToolCall { subtype, tool_call } => {
            if subtype.as_deref() != Some("started") {
                return AgentEvent::ignored(IgnoreReason::Uninteresting);
            }
            let Some(call) = tool_call else {
                return AgentEvent::ignored(IgnoreReason::Uninteresting);
            };
            let (kind, args) = if let Some(args) = call.write {
                (ToolKind::Write, args)
            } else if let Some(args) = call.read {
                (ToolKind::Read, args)
            } else if let Some(args) = call.edit {
                (ToolKind::Edit, args)
            } else {
                return AgentEvent::ignored(IgnoreReason::Uninteresting);
            };
            let path = args
                .args
                .and_then(|a| a.path)
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "file".to_string());
            AgentEvent::ToolNotice { kind, path }
        }
        RawEvent::Result {
            duration_ms,
            session_id,
        } => AgentEvent::Completion {
            duration_ms: duration_ms.filter(|d| d.is_finite() && *d > 0.0).unwrap_or(0.0) as u64,
            continuation_token: session_id.filter(|s| !s.is_empty()),
        },
    }
}

/// 调用方按到达顺序累积的本轮结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NarrationLog {
    /// 叙述文本与工具提示，按到达顺序拼接
    pub narration: String,
    pub continuation_token: Option<String>,
    pub duration_ms: Option<u64>,
    pub ignored_lines: usize,
}

impl NarrationLog {
    pub fn apply(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::Narration { text } => self.narration.push_str(text),
            AgentEvent::ToolNotice { kind, path } => self.narration.push_str(&kind.notice(path)),
            AgentEvent::Completion {
                duration_ms,
                continuation_token,
            } => {
                self.duration_ms = Some(*duration_ms);
                if continuation_token.is_some() {
                    self.continuation_token = continuation_token.clone();
                }
            }
            AgentEvent::Ignored { .. } => self.ignored_lines += 1,
        }
    }

    /// 解码整段输出（测试与非流式调用方使用）
    pub fn from_output(stdout: &str) -> Self {
        let mut log = Self::default();
        for line in stdout.lines() {
            log.apply(&decode_line(line));
        }
        log
    }
}
