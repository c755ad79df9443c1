//! 流式协议
//!
//! - **agent_event**：Agent 进程 stdout 的逐行 JSON 解码（宽松：无法识别的行显式落到 Ignored）
//! - **wire**：发给客户端的单一字节流（叙述文本 + 哨兵 + 最终文档）

pub mod agent_event;
pub mod wire;

pub use agent_event::{decode_line, AgentEvent, IgnoreReason, NarrationLog, ToolKind};
pub use wire::{split_response, SplitResponse, WireEvent, FINAL_CONTENT_SENTINEL, PROTOCOL_VERSION};
