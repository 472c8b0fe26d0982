// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI Chat Completions dialect: request parsing and response building.
//!
//! The OpenAI shape diverges from the normalized model in two ways that are
//! repaired here rather than downstream: assistant `tool_calls` become
//! `tool_use` blocks, and `role: "tool"` messages fold into user turns
//! carrying `tool_result` blocks (consecutive tool messages merge into one
//! turn so alternation survives).

use serde_json::{json, Value};

use crate::images::{decode_data_url, validate_image};
use crate::sse::CollectedResponse;
use crate::types::{
    ChatMessage, ChatRequest, ContentBlock, Role, ToolChoice, ToolResultBlock, ToolSchema,
    TranslateError,
};

/// Parse an OpenAI Chat Completions body into the normalized request.
pub fn parse_openai_request(body: &Value) -> Result<ChatRequest, TranslateError> {
    let model = body["model"].as_str().unwrap_or_default().to_string();

    let raw_messages = body["messages"]
        .as_array()
        .ok_or_else(|| TranslateError::Malformed("messages 必须是数组".into()))?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<ChatMessage> = Vec::new();

    for m in raw_messages {
        match m["role"].as_str() {
            Some("system") | Some("developer") => {
                if let Some(s) = m["content"].as_str() {
                    system_parts.push(s.to_string());
                }
            }
            Some("user") => messages.push(ChatMessage {
                role: Role::User,
                blocks: parse_user_content(&m["content"])?,
            }),
            Some("assistant") => messages.push(parse_assistant(m)?),
            Some("tool") => {
                let result = ContentBlock::ToolResult {
                    tool_use_id: m["tool_call_id"].as_str().unwrap_or_default().to_string(),
                    content: vec![ToolResultBlock::Text {
                        text: content_as_text(&m["content"]),
                    }],
                    is_error: false,
                };
                // Fold consecutive tool messages into one user turn.
                match messages.last_mut() {
                    Some(last) if last.role == Role::User && last.is_tool_result_only() => {
                        last.blocks.push(result);
                    }
                    _ => messages.push(ChatMessage {
                        role: Role::User,
                        blocks: vec![result],
                    }),
                }
            }
            other => {
                return Err(TranslateError::Malformed(format!(
                    "不支持的消息角色: {other:?}"
                )))
            }
        }
    }

    let tools = body["tools"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter(|t| t["type"].as_str() == Some("function"))
                .map(|t| ToolSchema {
                    name: t["function"]["name"].as_str().unwrap_or_default().to_string(),
                    description: t["function"]["description"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: t["function"]
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object"})),
                })
                .collect()
        })
        .unwrap_or_default();

    let tool_choice = match &body["tool_choice"] {
        Value::String(s) => match s.as_str() {
            "auto" => Some(ToolChoice::Auto),
            "none" => Some(ToolChoice::None),
            // OpenAI "required" forces some tool call — the closest
            // Anthropic notion is `any`.
            "required" => Some(ToolChoice::Any),
            _ => None,
        },
        Value::Object(_) => body["tool_choice"]["function"]["name"]
            .as_str()
            .map(|name| ToolChoice::Tool {
                name: name.to_string(),
            }),
        _ => None,
    };

    Ok(ChatRequest {
        model,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n"))
        },
        messages,
        tools,
        tool_choice,
        stream: body["stream"].as_bool().unwrap_or(false),
        thinking: false,
        conversation_id: body["conversation_id"].as_str().map(str::to_string),
        max_tokens: body["max_tokens"]
            .as_u64()
            .or_else(|| body["max_completion_tokens"].as_u64())
            .map(|v| v as u32),
    })
}

fn parse_user_content(content: &Value) -> Result<Vec<ContentBlock>, TranslateError> {
    match content {
        Value::String(s) => Ok(vec![ContentBlock::Text { text: s.clone() }]),
        Value::Array(parts) => {
            let mut blocks = Vec::with_capacity(parts.len());
            for p in parts {
                match p["type"].as_str() {
                    Some("text") => blocks.push(ContentBlock::Text {
                        text: p["text"].as_str().unwrap_or_default().to_string(),
                    }),
                    Some("image_url") => {
                        let url = p["image_url"]["url"].as_str().unwrap_or_default();
                        let (media_type, data) = decode_data_url(url)?;
                        let format = validate_image(&media_type, &data)?;
                        blocks.push(ContentBlock::Image { format, data });
                    }
                    other => {
                        return Err(TranslateError::Malformed(format!(
                            "不支持的内容块类型: {other:?}"
                        )))
                    }
                }
            }
            Ok(blocks)
        }
        _ => Err(TranslateError::Malformed(
            "content 必须是字符串或数组".into(),
        )),
    }
}

fn parse_assistant(m: &Value) -> Result<ChatMessage, TranslateError> {
    let mut blocks = Vec::new();
    if let Some(s) = m["content"].as_str() {
        if !s.is_empty() {
            blocks.push(ContentBlock::Text { text: s.to_string() });
        }
    }
    if let Some(calls) = m["tool_calls"].as_array() {
        for c in calls {
            let arguments = c["function"]["arguments"].as_str().unwrap_or("{}");
            blocks.push(ContentBlock::ToolUse {
                id: c["id"].as_str().unwrap_or_default().to_string(),
                name: c["function"]["name"].as_str().unwrap_or_default().to_string(),
                input: serde_json::from_str(arguments).unwrap_or_else(|_| json!({})),
            });
        }
    }
    Ok(ChatMessage {
        role: Role::Assistant,
        blocks,
    })
}

fn content_as_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

// ─── Response building ────────────────────────────────────────────────────────

/// Build the non-streaming Chat Completions response body.
pub fn openai_response_json(
    collected: &CollectedResponse,
    model: &str,
    input_tokens: u32,
) -> Value {
    let tool_calls: Vec<Value> = collected
        .tool_uses
        .iter()
        .map(|tu| {
            json!({
                "id": tu.id,
                "type": "function",
                "function": {
                    "name": tu.name,
                    "arguments": tu.input.to_string(),
                }
            })
        })
        .collect();

    let mut message = json!({ "role": "assistant" });
    message["content"] = if collected.text.is_empty() && !tool_calls.is_empty() {
        Value::Null
    } else {
        Value::String(collected.text.clone())
    };
    if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
    }

    let finish_reason = if collected.tool_uses.is_empty() {
        "stop"
    } else {
        "tool_calls"
    };

    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": collected.output_tokens,
            "total_tokens": input_tokens + collected.output_tokens,
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
