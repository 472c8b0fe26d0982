// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic Messages dialect: request parsing and response building.

use serde_json::{json, Value};

use crate::images::validate_image;
use crate::sse::CollectedResponse;
use crate::types::{
    ChatMessage, ChatRequest, ContentBlock, Role, ToolChoice, ToolResultBlock, ToolSchema,
    TranslateError,
};

/// Parse an Anthropic Messages API body into the normalized request.
pub fn parse_claude_request(body: &Value) -> Result<ChatRequest, TranslateError> {
    let model = body["model"].as_str().unwrap_or_default().to_string();

    let system = match &body["system"] {
        Value::String(s) => Some(s.clone()),
        // Segmented system blocks are flattened; prompt-cache markers and
        // other block metadata have no meaning upstream.
        Value::Array(blocks) => {
            let joined: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b["text"].as_str())
                .collect();
            if joined.is_empty() {
                None
            } else {
                Some(joined.join("\n"))
            }
        }
        _ => None,
    };

    let raw_messages = body["messages"]
        .as_array()
        .ok_or_else(|| TranslateError::Malformed("messages 必须是数组".into()))?;

    let mut messages = Vec::with_capacity(raw_messages.len());
    for m in raw_messages {
        messages.push(parse_message(m)?);
    }

    let tools = body["tools"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .map(|t| ToolSchema {
                    name: t["name"].as_str().unwrap_or_default().to_string(),
                    description: t["description"].as_str().unwrap_or_default().to_string(),
                    input_schema: t
                        .get("input_schema")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object"})),
                })
                .collect()
        })
        .unwrap_or_default();

    let tool_choice = match body["tool_choice"]["type"].as_str() {
        Some("auto") => Some(ToolChoice::Auto),
        Some("any") => Some(ToolChoice::Any),
        Some("none") => Some(ToolChoice::None),
        Some("tool") => Some(ToolChoice::Tool {
            name: body["tool_choice"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        }),
        _ => None,
    };

    Ok(ChatRequest {
        model,
        system,
        messages,
        tools,
        tool_choice,
        stream: body["stream"].as_bool().unwrap_or(false),
        thinking: body["thinking"]["type"].as_str() == Some("enabled"),
        conversation_id: body["conversation_id"].as_str().map(str::to_string),
        max_tokens: body["max_tokens"].as_u64().map(|v| v as u32),
    })
}

fn parse_message(m: &Value) -> Result<ChatMessage, TranslateError> {
    let role = match m["role"].as_str() {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        other => {
            return Err(TranslateError::Malformed(format!(
                "不支持的消息角色: {other:?}"
            )))
        }
    };

    let blocks = match &m["content"] {
        Value::String(s) => vec![ContentBlock::Text { text: s.clone() }],
        Value::Array(parts) => {
            let mut blocks = Vec::with_capacity(parts.len());
            for p in parts {
                if let Some(b) = parse_block(p)? {
                    blocks.push(b);
                }
            }
            blocks
        }
        _ => {
            return Err(TranslateError::Malformed(
                "content 必须是字符串或数组".into(),
            ))
        }
    };

    Ok(ChatMessage { role, blocks })
}

fn parse_block(p: &Value) -> Result<Option<ContentBlock>, TranslateError> {
    let block = match p["type"].as_str() {
        Some("text") => Some(ContentBlock::Text {
            text: p["text"].as_str().unwrap_or_default().to_string(),
        }),
        Some("image") => {
            if p["source"]["type"].as_str() != Some("base64") {
                return Err(TranslateError::Malformed(
                    "图片 source.type 仅支持 base64".into(),
                ));
            }
            let media_type = p["source"]["media_type"].as_str().unwrap_or_default();
            let data = p["source"]["data"].as_str().unwrap_or_default();
            let format = validate_image(media_type, data)?;
            Some(ContentBlock::Image {
                format,
                data: data.to_string(),
            })
        }
        Some("tool_use") => Some(ContentBlock::ToolUse {
            id: p["id"].as_str().unwrap_or_default().to_string(),
            name: p["name"].as_str().unwrap_or_default().to_string(),
            input: p.get("input").cloned().unwrap_or_else(|| json!({})),
        }),
        Some("tool_result") => {
            let content = match &p["content"] {
                Value::String(s) => vec![ToolResultBlock::Text { text: s.clone() }],
                Value::Array(parts) => parts
                    .iter()
                    .filter_map(|c| match c["type"].as_str() {
                        Some("text") => Some(ToolResultBlock::Text {
                            text: c["text"].as_str().unwrap_or_default().to_string(),
                        }),
                        Some("json") => Some(ToolResultBlock::Json {
                            json: c.get("json").cloned().unwrap_or(Value::Null),
                        }),
                        // Image results have no upstream representation.
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            Some(ContentBlock::ToolResult {
                tool_use_id: p["tool_use_id"].as_str().unwrap_or_default().to_string(),
                content,
                is_error: p["is_error"].as_bool().unwrap_or(false),
            })
        }
        // Thinking/redacted-thinking blocks from earlier assistant turns are
        // dropped — the upstream history format has nowhere to carry them.
        Some("thinking") | Some("redacted_thinking") => None,
        other => {
            return Err(TranslateError::Malformed(format!(
                "不支持的内容块类型: {other:?}"
            )))
        }
    };
    Ok(block)
}

// ─── Response building ────────────────────────────────────────────────────────

/// Build the non-streaming Anthropic Messages response body.
pub fn claude_response_json(
    collected: &CollectedResponse,
    model: &str,
    input_tokens: u32,
) -> Value {
    let mut content = Vec::new();
    if !collected.text.is_empty() || collected.tool_uses.is_empty() {
        content.push(json!({ "type": "text", "text": collected.text }));
    }
    for tu in &collected.tool_uses {
        content.push(json!({
            "type": "tool_use",
            "id": tu.id,
            "name": tu.name,
            "input": tu.input,
        }));
    }

    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": collected.stop_reason(),
        "stop_sequence": null,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": collected.output_tokens,
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::CollectedToolUse;

    #[test]
    fn parses_minimal_request() {
        let body = json!({
            "model": "claude-sonnet-4.5",
            "messages": [{ "role": "user", "content": "Hi" }],
            "max_tokens": 16
        });
        let req = parse_claude_request(&body).unwrap();
        assert_eq!(req.model, "claude-sonnet-4.5");
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].text(), "Hi");
        assert_eq!(req.max_tokens, Some(16));
        assert!(!req.stream);
        assert!(!req.thinking);
    }

    #[test]
    fn parses_segmented_system_blocks() {
        let body = json!({
            "model": "m",
            "system": [
                { "type": "text", "text": "part one" },
                { "type": "text", "text": "part two" }
            ],
            "messages": [{ "role": "user", "content": "x" }]
        });
        let req = parse_claude_request(&body).unwrap();
        assert_eq!(req.system.as_deref(), Some("part one\npart two"));
    }

    #[test]
    fn parses_tool_use_and_result_blocks() {
        let body = json!({
            "model": "m",
            "messages": [
                { "role": "assistant", "content": [
                    { "type": "tool_use", "id": "t1", "name": "search", "input": {"q": "rust"} }
                ]},
                { "role": "user", "content": [
                    { "type": "tool_result", "tool_use_id": "t1",
                      "content": [{ "type": "text", "text": "found" }], "is_error": false }
                ]}
            ]
        });
        let req = parse_claude_request(&body).unwrap();
        assert!(matches!(
            &req.messages[0].blocks[0],
            ContentBlock::ToolUse { name, .. } if name == "search"
        ));
        assert!(req.messages[1].has_tool_results());
    }

    #[test]
    fn tool_result_string_content_becomes_text_block() {
        let body = json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [{ "type": "tool_result", "tool_use_id": "t", "content": "plain" }]
            }]
        });
        let req = parse_claude_request(&body).unwrap();
        match &req.messages[0].blocks[0] {
            ContentBlock::ToolResult { content, .. } => {
                assert_eq!(content[0].as_text(), "plain");
            }
            other => panic!("expected ToolResult, got {other:?}"),
        }
    }

    #[test]
    fn thinking_flag_from_thinking_block() {
        let body = json!({
            "model": "m",
            "thinking": { "type": "enabled", "budget_tokens": 8000 },
            "messages": [{ "role": "user", "content": "x" }]
        });
        assert!(parse_claude_request(&body).unwrap().thinking);
    }

    #[test]
    fn historic_thinking_blocks_are_dropped() {
        let body = json!({
            "model": "m",
            "messages": [
                { "role": "assistant", "content": [
                    { "type": "thinking", "thinking": "private", "signature": "s" },
                    { "type": "text", "text": "visible" }
                ]},
                { "role": "user", "content": "next" }
            ]
        });
        let req = parse_claude_request(&body).unwrap();
        assert_eq!(req.messages[0].blocks.len(), 1);
        assert_eq!(req.messages[0].text(), "visible");
    }

    #[test]
    fn tool_choice_variants() {
        for (raw, expected) in [
            (json!({"type": "auto"}), ToolChoice::Auto),
            (json!({"type": "any"}), ToolChoice::Any),
            (json!({"type": "tool", "name": "t"}), ToolChoice::Tool { name: "t".into() }),
        ] {
            let body = json!({
                "model": "m",
                "tool_choice": raw,
                "messages": [{ "role": "user", "content": "x" }]
            });
            assert_eq!(parse_claude_request(&body).unwrap().tool_choice, Some(expected));
        }
    }

    #[test]
    fn missing_messages_is_malformed() {
        let body = json!({ "model": "m" });
        assert!(matches!(
            parse_claude_request(&body),
            Err(TranslateError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_role_is_malformed() {
        let body = json!({
            "model": "m",
            "messages": [{ "role": "tool", "content": "x" }]
        });
        assert!(matches!(
            parse_claude_request(&body),
            Err(TranslateError::Malformed(_))
        ));
    }

    #[test]
    fn url_image_source_is_rejected() {
        let body = json!({
            "model": "m",
            "messages": [{ "role": "user", "content": [
                { "type": "image", "source": { "type": "url", "url": "https://x/y.png" } }
            ]}]
        });
        assert!(parse_claude_request(&body).is_err());
    }

    // ── Response building ─────────────────────────────────────────────────────

    #[test]
    fn response_has_text_and_usage() {
        let collected = CollectedResponse {
            text: "Hello".into(),
            tool_uses: vec![],
            output_tokens: 5,
        };
        let v = claude_response_json(&collected, "claude-sonnet-4.5", 12);
        assert_eq!(v["content"][0]["text"], "Hello");
        assert_eq!(v["stop_reason"], "end_turn");
        assert_eq!(v["usage"]["input_tokens"], 12);
        assert_eq!(v["usage"]["output_tokens"], 5);
    }

    #[test]
    fn response_with_tool_use_sets_stop_reason() {
        let collected = CollectedResponse {
            text: String::new(),
            tool_uses: vec![CollectedToolUse {
                id: "t1".into(),
                name: "run".into(),
                input: json!({"cmd": "ls"}),
            }],
            output_tokens: 10,
        };
        let v = claude_response_json(&collected, "m", 1);
        assert_eq!(v["stop_reason"], "tool_use");
        assert_eq!(v["content"][0]["type"], "tool_use");
        assert_eq!(v["content"][0]["input"]["cmd"], "ls");
    }

    #[test]
    fn empty_response_still_carries_one_text_block() {
        let collected = CollectedResponse {
            text: String::new(),
            tool_uses: vec![],
            output_tokens: 0,
        };
        let v = claude_response_json(&collected, "m", 1);
        assert_eq!(v["content"].as_array().unwrap().len(), 1);
        assert_eq!(v["content"][0]["type"], "text");
    }
}
