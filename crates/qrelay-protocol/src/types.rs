// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── Normalized conversation model ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One content block inside a normalized message.
///
/// Both inbound dialects collapse into this vocabulary: Anthropic blocks map
/// directly, OpenAI `tool_calls` become [`ContentBlock::ToolUse`] and
/// `role: "tool"` messages become user turns carrying
/// [`ContentBlock::ToolResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        /// Short format token accepted upstream: `jpeg`, `png`, `gif`,
        /// `webp`, or `bmp`.
        format: String,
        /// Raw base64 payload (no data-URL prefix).
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ToolResultBlock>,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultBlock {
    Text { text: String },
    Json { json: serde_json::Value },
}

impl ToolResultBlock {
    /// Comparable text rendering, used when deduplicating merged results.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Json { json } => json.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            blocks: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            blocks: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Concatenated text of every `Text` block.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for b in &self.blocks {
            if let ContentBlock::Text { text } = b {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.blocks.iter().filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => {
                Some((id.as_str(), name.as_str(), input))
            }
            _ => None,
        })
    }

    pub fn has_tool_results(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
    }

    /// A user turn that exists only to carry tool results back.
    ///
    /// Such turns do not count as "the user spoke" for the infinite-loop
    /// guard — an agent stuck re-issuing the same call produces exactly this
    /// alternation.
    pub fn is_tool_result_only(&self) -> bool {
        self.role == Role::User
            && self.has_tool_results()
            && self.blocks.iter().all(|b| match b {
                ContentBlock::ToolResult { .. } => true,
                ContentBlock::Text { text } => text.trim().is_empty(),
                _ => false,
            })
    }
}

/// Tool schema offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Any,
    Tool { name: String },
    None,
}

/// Dialect-independent chat request, produced by the inbound parsers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model name as the client sent it (mapped later, see `map_model_id`).
    pub model: String,
    /// Flattened system prompt.  Segmented system blocks are joined with
    /// newlines at parse time.
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: Option<ToolChoice>,
    pub stream: bool,
    /// Interleaved-thinking request flag.
    pub thinking: bool,
    /// Caller-provided conversation id, if any.
    pub conversation_id: Option<String>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Total number of image blocks across all messages.
    pub fn image_count(&self) -> usize {
        self.messages
            .iter()
            .flat_map(|m| m.blocks.iter())
            .filter(|b| matches!(b, ContentBlock::Image { .. }))
            .count()
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Translation failures that map to client-visible 400s.
#[derive(Debug, Error, PartialEq)]
pub enum TranslateError {
    #[error("请求体无法解析: {0}")]
    Malformed(String),
    #[error("请求中没有任何可用的消息内容")]
    NoContent,
    #[error("检测到模型陷入重复调用同一工具的循环，请调整提示后重试")]
    LoopDetected,
    #[error("图片处理失败: {0}")]
    Image(#[from] crate::images::ImageError),
}

impl TranslateError {
    /// Stable machine-readable code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "INVALID_REQUEST",
            Self::NoContent => "NO_CONTENT",
            Self::LoopDetected => "LOOP_DETECTED",
            Self::Image(_) => "INVALID_IMAGE",
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_text_joins_text_blocks() {
        let m = ChatMessage {
            role: Role::User,
            blocks: vec![
                ContentBlock::Text { text: "a".into() },
                ContentBlock::Image {
                    format: "png".into(),
                    data: "AAAA".into(),
                },
                ContentBlock::Text { text: "b".into() },
            ],
        };
        assert_eq!(m.text(), "a\nb");
    }

    #[test]
    fn tool_result_only_detection() {
        let m = ChatMessage {
            role: Role::User,
            blocks: vec![ContentBlock::ToolResult {
                tool_use_id: "t1".into(),
                content: vec![ToolResultBlock::Text { text: "out".into() }],
                is_error: false,
            }],
        };
        assert!(m.is_tool_result_only());
    }

    #[test]
    fn tool_result_with_real_text_is_not_result_only() {
        let m = ChatMessage {
            role: Role::User,
            blocks: vec![
                ContentBlock::ToolResult {
                    tool_use_id: "t1".into(),
                    content: vec![],
                    is_error: false,
                },
                ContentBlock::Text {
                    text: "also look at this".into(),
                },
            ],
        };
        assert!(!m.is_tool_result_only());
    }

    #[test]
    fn assistant_turn_is_never_result_only() {
        let m = ChatMessage::assistant("hi");
        assert!(!m.is_tool_result_only());
    }

    #[test]
    fn tool_uses_iterates_in_block_order() {
        let m = ChatMessage {
            role: Role::Assistant,
            blocks: vec![
                ContentBlock::ToolUse {
                    id: "a".into(),
                    name: "one".into(),
                    input: json!({}),
                },
                ContentBlock::ToolUse {
                    id: "b".into(),
                    name: "two".into(),
                    input: json!({}),
                },
            ],
        };
        let ids: Vec<&str> = m.tool_uses().map(|(id, _, _)| id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn translate_error_codes_are_stable() {
        assert_eq!(TranslateError::LoopDetected.code(), "LOOP_DETECTED");
        assert_eq!(TranslateError::NoContent.code(), "NO_CONTENT");
        assert_eq!(
            TranslateError::Malformed("x".into()).code(),
            "INVALID_REQUEST"
        );
    }
}
