//! 客户端可见的响应流（协议版本 1）
//!
//! 整个响应体是一段 `text/plain`：
//!
//! ```text
//! <叙述字节（任意）> __FINAL_CONTENT__ <最终文档原文>
//! ```
//!
//! 哨兵之后不再有任何字节。客户端按哨兵**首次**出现的位置切分；
//! 没有哨兵说明本轮失败，叙述末尾会带一段 `Error: ...`。

use super::agent_event::{AgentEvent, ToolKind};

pub const PROTOCOL_VERSION: u32 = 1;

/// 叙述与最终内容之间的分隔符，属于协议常量
pub const FINAL_CONTENT_SENTINEL: &str = "__FINAL_CONTENT__";

/// 叙述里若意外出现哨兵，替换成这个，保证首次出现一定是真正的分隔
const SENTINEL_ESCAPED: &str = "__FINAL_CONTENT\u{200B}__";

/// 写往客户端的一条事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Narration(String),
    ToolNotice { kind: ToolKind, path: String },
    /// 最后一条：哨兵 + 文档全文
    FinalContent(String),
    /// 轮次失败，流随后关闭
    Error(String),
}

impl WireEvent {
    /// 需要实时展示的 Agent 事件；Completion 与 Ignored 不上线
    pub fn from_agent_event(event: &AgentEvent) -> Option<Self> {
        match event {
            AgentEvent::Narration { text } => Some(WireEvent::Narration(text.clone())),
            AgentEvent::ToolNotice { kind, path } => Some(WireEvent::ToolNotice {
                kind: *kind,
                path: path.clone(),
            }),
            AgentEvent::Completion { .. } | AgentEvent::Ignored { .. } => None,
        }
    }

    pub fn narration(text: impl Into<String>) -> Self {
        WireEvent::Narration(text.into())
    }

    /// 编码成响应体片段
    pub fn encode(&self) -> String {
        match self {
            WireEvent::Narration(text) => text.replace(FINAL_CONTENT_SENTINEL, SENTINEL_ESCAPED),
            WireEvent::ToolNotice { kind, path } => kind
                .notice(path)
                .replace(FINAL_CONTENT_SENTINEL, SENTINEL_ESCAPED),
            WireEvent::FinalContent(content) => format!("{}{}", FINAL_CONTENT_SENTINEL, content),
            WireEvent::Error(message) => format!(
                "\n\nError: {}",
                message.replace(FINAL_CONTENT_SENTINEL, SENTINEL_ESCAPED)
            ),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WireEvent::FinalContent(_) | WireEvent::Error(_))
    }
}

/// 客户端侧切分结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitResponse<'a> {
    pub narration: &'a str,
    /// None 表示本轮没有产出最终内容
    pub final_content: Option<&'a str>,
}

/// 按哨兵首次出现切分响应体
pub fn split_response(body: &str) -> SplitResponse<'_> {
    match body.split_once(FINAL_CONTENT_SENTINEL) {
        Some((narration, content)) => SplitResponse {
            narration,
            final_content: Some(content),
        },
        None => SplitResponse {
            narration: body,
            final_content: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(events: &[WireEvent]) -> String {
        events.iter().map(WireEvent::encode).collect()
    }

    #[test]
    fn test_encode_and_split() {
        let body = encode_all(&[
            WireEvent::narration("Thinking. "),
            WireEvent::ToolNotice {
                kind: ToolKind::Write,
                path: "presentation.md".into(),
            },
            WireEvent::FinalContent("# Deck\n---\n# Two".into()),
        ]);
        let split = split_response(&body);
        assert_eq!(split.narration, "Thinking. \n[Writing presentation.md...]\n");
        assert_eq!(split.final_content, Some("# Deck\n---\n# Two"));
    }

    #[test]
    fn test_sentinel_inside_narration_cannot_split_early() {
        let body = encode_all(&[
            WireEvent::narration(format!("agent said {} oddly", FINAL_CONTENT_SENTINEL)),
            WireEvent::FinalContent(format!("content mentioning {}", FINAL_CONTENT_SENTINEL)),
        ]);
        let split = split_response(&body);
        assert!(split.narration.starts_with("agent said"));
        assert_eq!(
            split.final_content.map(str::to_string),
            Some(format!("content mentioning {}", FINAL_CONTENT_SENTINEL))
        );
    }

    #[test]
    fn test_error_without_sentinel() {
        let body = encode_all(&[
            WireEvent::narration("partial"),
            WireEvent::Error("Agent CLI failed: boom".into()),
        ]);
        let split = split_response(&body);
        assert_eq!(split.final_content, None);
        assert_eq!(split.narration, "partial\n\nError: Agent CLI failed: boom");
        assert!(WireEvent::Error(String::new()).is_terminal());
    }

    #[test]
    fn test_completion_is_not_streamed() {
        let completion = AgentEvent::Completion {
            duration_ms: 5,
            continuation_token: Some("t".into()),
        };
        assert_eq!(WireEvent::from_agent_event(&completion), None);
    }
}
