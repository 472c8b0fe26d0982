// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Summary prompt construction.
//!
//! The prefix is serialized into plain text (tool calls and results
//! rendered compactly, long results truncated head+tail) and wrapped in a
//! fixed nine-section XML template.  Prompts longer than the batch limit
//! are split and summarized sequentially with a lighter batch template.

use qrelay_protocol::{ChatMessage, ContentBlock, Role, ToolResultBlock};

/// Truncation threshold for a single tool-result text.
const TOOL_RESULT_MAX_CHARS: usize = 2_000;
const TOOL_RESULT_HEAD: usize = 800;
const TOOL_RESULT_TAIL: usize = 800;

/// The nine mandatory summary sections, in output order.
pub const SECTIONS: [&str; 9] = [
    "primary_request",
    "technical_concepts",
    "files_and_code",
    "errors_and_fixes",
    "problem_solving",
    "user_messages",
    "pending_tasks",
    "current_work",
    "next_steps",
];

/// Full summarization prompt for one prefix.
pub fn summary_prompt(history_text: &str, target_chars: usize) -> String {
    let sections: String = SECTIONS
        .iter()
        .map(|s| format!("<{s}>…</{s}>\n"))
        .collect();
    format!(
        "你是对话压缩助手。请将下面的历史对话压缩成一份结构化摘要，\
         严格按照以下九个 XML 段落输出，不得增减段落，总长度不超过 {target_chars} 字符。\
         保留文件名、命令、错误信息、技术决策等关键细节：\n\n{sections}\n\
         <history>\n{history_text}\n</history>"
    )
}

/// Lighter template for one batch of an oversized prefix.  Batch summaries
/// are concatenated in order and carried as one block.
pub fn batch_prompt(batch_text: &str, index: usize, total: usize, target_chars: usize) -> String {
    format!(
        "你是对话压缩助手。这是长对话的第 {part} / {total} 段，请将其压缩成不超过 \
         {target_chars} 字符的密集摘要，保留文件名、命令、错误信息与技术决策：\n\n\
         <history_part>\n{batch_text}\n</history_part>",
        part = index + 1,
    )
}

/// Serialize messages into the plain-text form embedded in the prompt.
pub fn serialize_messages(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(render_message)
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_message(message: &ChatMessage) -> String {
    let role = match message.role {
        Role::User => "User",
        Role::Assistant => "Assistant",
    };
    let parts: Vec<String> = message
        .blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } if text.is_empty() => None,
            ContentBlock::Text { text } => Some(text.clone()),
            ContentBlock::Image { .. } => Some("[图片]".to_string()),
            ContentBlock::ToolUse { id, name, input } => {
                let args = input
                    .as_object()
                    .map(|o| o.keys().cloned().collect::<Vec<_>>().join(", "))
                    .unwrap_or_default();
                Some(format!("[调用工具: {name}({args}) id={id}]"))
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let text = content
                    .iter()
                    .map(|c| match c {
                        ToolResultBlock::Text { text } => text.clone(),
                        ToolResultBlock::Json { json } => json.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                let status = if *is_error { "错误" } else { "结果" };
                Some(format!(
                    "[工具{status} id={tool_use_id}] {}",
                    truncate_tool_result(&text)
                ))
            }
        })
        .collect();
    format!("{role}: {}", parts.join("\n"))
}

/// Head + tail truncation with an omission marker, in characters so CJK
/// text never splits mid-codepoint.
fn truncate_tool_result(text: &str) -> String {
    let total = text.chars().count();
    if total <= TOOL_RESULT_MAX_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(TOOL_RESULT_HEAD).collect();
    let tail: String = {
        let skip = total - TOOL_RESULT_TAIL;
        text.chars().skip(skip).collect()
    };
    let omitted = total - TOOL_RESULT_HEAD - TOOL_RESULT_TAIL;
    format!("{head}…省略 {omitted} 字符…{tail}")
}

/// Split serialized history into batches of at most `max_chars` characters,
/// preferring message boundaries (blank lines) over hard cuts.
pub fn split_batches(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }
    let mut batches = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for paragraph in text.split("\n\n") {
        let para_chars = paragraph.chars().count();
        if current_chars > 0 && current_chars + para_chars + 2 > max_chars {
            batches.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        // A single paragraph larger than the budget is hard-cut.
        if para_chars > max_chars {
            let mut chunk = String::new();
            let mut n = 0usize;
            for c in paragraph.chars() {
                chunk.push(c);
                n += 1;
                if n == max_chars {
                    batches.push(std::mem::take(&mut chunk));
                    n = 0;
                }
            }
            if !chunk.is_empty() {
                current = chunk;
                current_chars = n;
            }
            continue;
        }
        if current_chars > 0 {
            current.push_str("\n\n");
            current_chars += 2;
        }
        current.push_str(paragraph);
        current_chars += para_chars;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
