// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Input-token estimation.
//!
//! A chars/4 heuristic tuned against Claude tokenization stands in for a
//! real tokenizer: compression triggers and `count_tokens` only need to be
//! in the right ballpark, and the heuristic has no model-file dependency.
//! Fixed overheads: 4 tokens per message, 3 for a system prompt.

use qrelay_protocol::{ChatMessage, ChatRequest, ContentBlock, ToolResultBlock};

const PER_MESSAGE_OVERHEAD: usize = 4;
const PER_SYSTEM_OVERHEAD: usize = 3;
/// Flat estimate per attached image (tile-based counting upper bound).
const PER_IMAGE_TOKENS: usize = 765;

fn chars_to_tokens(chars: usize) -> usize {
    chars.div_ceil(4)
}

/// Estimated tokens for one message, content only (no per-message overhead).
pub fn estimate_message_tokens(message: &ChatMessage) -> usize {
    message
        .blocks
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text } => chars_to_tokens(text.chars().count()),
            ContentBlock::Image { .. } => PER_IMAGE_TOKENS,
            ContentBlock::ToolUse { name, input, .. } => {
                chars_to_tokens(name.chars().count() + input.to_string().chars().count())
            }
            ContentBlock::ToolResult { content, .. } => content
                .iter()
                .map(|c| match c {
                    ToolResultBlock::Text { text } => chars_to_tokens(text.chars().count()),
                    ToolResultBlock::Json { json } => {
                        chars_to_tokens(json.to_string().chars().count())
                    }
                })
                .sum(),
        })
        .sum()
}

/// Estimated input tokens for a whole request: messages, tool schemas, and
/// the system prompt, with fixed overheads applied.
pub fn estimate_request_tokens(request: &ChatRequest) -> usize {
    let mut total = 0usize;
    for m in &request.messages {
        total += estimate_message_tokens(m) + PER_MESSAGE_OVERHEAD;
    }
    if let Some(system) = &request.system {
        total += chars_to_tokens(system.chars().count()) + PER_SYSTEM_OVERHEAD;
    }
    for tool in &request.tools {
        total += chars_to_tokens(
            tool.name.chars().count()
                + tool.description.chars().count()
                + tool.input_schema.to_string().chars().count(),
        );
    }
    total
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
