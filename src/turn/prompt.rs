//! 发给 Agent 的提示词
//!
//! 参考文件与文档都已写进环境，提示词只给出文件名指引，不内嵌内容。

use crate::environment::files::{DOCUMENT_FILE, RULES_FILE, SAMPLE_FILE};
use crate::store::{TranscriptEntry, TranscriptRole};

/// 首轮（文档为空）：完整创作指令
pub fn first_turn_prompt(user_request: &str) -> String {
    format!(
        "Create a compelling presentation based on this user request:\n\n\
         <user_request>\n{request}\n</user_request>\n\n\
         <rules>\nRead {rules} for the complete formatting rules.\n</rules>\n\n\
         <reference>\nSee {sample} for a real example of proper formatting.\n</reference>\n\n\
         Create 5-10 well-structured slides and save the result to {doc}.",
        request = user_request,
        rules = RULES_FILE,
        sample = SAMPLE_FILE,
        doc = DOCUMENT_FILE,
    )
}

/// 后续轮次但 Agent 没有记忆：重新说明上下文
pub fn restated_prompt(user_request: &str) -> String {
    format!(
        "You are editing an existing presentation. Its current content is in {doc}.\n\n\
         <rules>\nRead {rules} for the complete formatting rules.\n</rules>\n\n\
         <reference>\nSee {sample} for a real example of proper formatting.\n</reference>\n\n\
         Apply the following request to {doc} and save the result there:\n\n\
         <user_request>\n{request}\n</user_request>",
        request = user_request,
        rules = RULES_FILE,
        sample = SAMPLE_FILE,
        doc = DOCUMENT_FILE,
    )
}

/// 对话记录回放：在基础提示前附上 `<conversation_history>`
pub fn transcript_prompt(base: &str, history: &[TranscriptEntry]) -> String {
    if history.is_empty() {
        return base.to_string();
    }
    let mut out = String::from("<conversation_history>\n");
    for entry in history {
        let speaker = match entry.role {
            TranscriptRole::User => "User",
            TranscriptRole::Assistant => "Assistant",
        };
        out.push_str(speaker);
        out.push_str(": ");
        out.push_str(entry.content.trim());
        out.push('\n');
    }
    out.push_str("</conversation_history>\n\n");
    out.push_str(base);
    out
}
