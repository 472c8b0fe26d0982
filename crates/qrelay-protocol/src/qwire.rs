// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Amazon Q `conversationState` wire encoding.
//!
//! Field order is wire-significant: the upstream service validates key order
//! inside `conversationState`, `userInputMessage`, `envState`, and
//! `toolSpecification`.  Serde serializes struct fields in declaration
//! order, so every struct below declares its fields in exactly the order the
//! wire requires — do not reorder them.  The JSON-Schema payload inside
//! `inputSchema.json` is rebuilt through [`reorder_input_schema`] because it
//! arrives as free-form JSON.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::normalize::{
    append_thinking_hint, normalize_history, reorder_tool_results, retain_recent_images,
    scan_for_tool_loop, user_content_or_sentinel,
};
use crate::types::{
    ChatMessage, ChatRequest, ContentBlock, Role, ToolChoice, ToolResultBlock, TranslateError,
};

/// Longest tool description forwarded upstream.
const MAX_TOOL_DESCRIPTION: usize = 10_000;

// ─── Wire structs (field order = wire order) ──────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct QRequest {
    #[serde(rename = "conversationState")]
    pub conversation_state: ConversationState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationState {
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    pub history: Vec<HistoryEntry>,
    #[serde(rename = "currentMessage")]
    pub current_message: CurrentMessage,
    #[serde(rename = "chatTriggerType")]
    pub chat_trigger_type: ChatTriggerType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChatTriggerType {
    #[serde(rename = "MANUAL")]
    Manual,
    #[serde(rename = "AUTO")]
    Auto,
}

#[derive(Debug, Clone, Serialize)]
pub enum HistoryEntry {
    #[serde(rename = "userInputMessage")]
    User(UserInputMessage),
    #[serde(rename = "assistantResponseMessage")]
    Assistant(AssistantResponseMessage),
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentMessage {
    #[serde(rename = "userInputMessage")]
    pub user_input_message: UserInputMessage,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserInputMessage {
    pub content: String,
    #[serde(rename = "userInputMessageContext")]
    pub context: UserInputMessageContext,
    pub origin: String,
    #[serde(rename = "modelId")]
    pub model_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageBlock>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UserInputMessageContext {
    #[serde(rename = "envState")]
    pub env_state: EnvState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpecWrapper>,
    #[serde(rename = "toolResults", skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<QToolResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvState {
    #[serde(rename = "operatingSystem")]
    pub operating_system: String,
    #[serde(rename = "currentWorkingDirectory")]
    pub current_working_directory: String,
}

impl EnvState {
    pub fn current() -> Self {
        Self {
            operating_system: std::env::consts::OS.to_string(),
            current_working_directory: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "/".to_string()),
        }
    }
}

impl Default for EnvState {
    fn default() -> Self {
        Self::current()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpecWrapper {
    #[serde(rename = "toolSpecification")]
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputSchema {
    pub json: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct QToolResult {
    #[serde(rename = "toolUseId")]
    pub tool_use_id: String,
    pub content: Vec<Value>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantResponseMessage {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub content: String,
    #[serde(rename = "toolUses", skip_serializing_if = "Vec::is_empty")]
    pub tool_uses: Vec<QToolUse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QToolUse {
    #[serde(rename = "toolUseId")]
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageBlock {
    pub format: String,
    pub source: ImageSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSource {
    pub bytes: String,
}

// ─── Translation ──────────────────────────────────────────────────────────────

/// Rewrite a normalized [`ChatRequest`] into the Amazon Q wire request.
///
/// `conversation_id` has already been resolved by the pipeline; `model_id`
/// is the mapped short id.  The rewrite applies, in order: the infinite-loop
/// guard, image retention, tool-result reordering, current/history split,
/// the system-prompt injection pair, alternation repair, and the sentinel /
/// thinking-hint content rules.
pub fn build_conversation(
    req: &ChatRequest,
    conversation_id: &str,
    model_id: &str,
) -> Result<QRequest, TranslateError> {
    scan_for_tool_loop(&req.messages)?;
    if req.messages.is_empty() && req.system.is_none() {
        return Err(TranslateError::NoContent);
    }

    let mut messages = req.messages.clone();
    retain_recent_images(&mut messages);
    reorder_tool_results(&mut messages);

    // The final user turn becomes `currentMessage`; a history that ends on
    // an assistant turn gets a synthetic continuation turn instead.
    let current = if matches!(messages.last(), Some(m) if m.role == Role::User) {
        messages.pop().expect("matched non-empty")
    } else {
        ChatMessage {
            role: Role::User,
            blocks: Vec::new(),
        }
    };

    let history = normalize_history(messages);
    let tools_declared = !req.tools.is_empty();

    // History numbering: the injected system pair takes msg-001/msg-002 and
    // normal history resumes at msg-003.  User entries consume a number but
    // the wire only carries it on assistant entries.
    let mut next_id = 1usize;
    let mut entries: Vec<HistoryEntry> = Vec::with_capacity(history.len() + 2);

    if let Some(system) = req.system.as_deref().filter(|s| !s.trim().is_empty()) {
        next_id += 1; // msg-001: the system text as a user entry
        entries.push(HistoryEntry::User(build_user_entry(
            system.to_string(),
            &[],
            &[],
            model_id,
            tools_declared,
            false,
        )));
        entries.push(HistoryEntry::Assistant(AssistantResponseMessage {
            message_id: message_id(&mut next_id), // msg-002
            content: "OK".to_string(),
            tool_uses: Vec::new(),
        }));
    }

    for msg in &history {
        match msg.role {
            Role::User => {
                next_id += 1;
                entries.push(HistoryEntry::User(user_entry_from_message(
                    msg,
                    model_id,
                    tools_declared,
                    req.thinking,
                )));
            }
            Role::Assistant => {
                entries.push(HistoryEntry::Assistant(assistant_entry_from_message(
                    msg,
                    &mut next_id,
                )));
            }
        }
    }

    let mut current_entry = user_entry_from_message(&current, model_id, tools_declared, req.thinking);
    current_entry.context.tools = build_tool_specs(&req.tools);

    let chat_trigger_type = if tools_declared
        && matches!(
            req.tool_choice,
            Some(ToolChoice::Any) | Some(ToolChoice::Tool { .. })
        ) {
        ChatTriggerType::Auto
    } else {
        ChatTriggerType::Manual
    };

    Ok(QRequest {
        conversation_state: ConversationState {
            conversation_id: conversation_id.to_string(),
            history: entries,
            current_message: CurrentMessage {
                user_input_message: current_entry,
            },
            chat_trigger_type,
        },
    })
}

fn message_id(next: &mut usize) -> String {
    let id = format!("msg-{:03}", *next);
    *next += 1;
    id
}

fn user_entry_from_message(
    msg: &ChatMessage,
    model_id: &str,
    tools_declared: bool,
    thinking: bool,
) -> UserInputMessage {
    let tool_results: Vec<QToolResult> = msg
        .blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(QToolResult {
                tool_use_id: tool_use_id.clone(),
                content: content.iter().map(tool_result_value).collect(),
                status: if *is_error { "error" } else { "success" }.to_string(),
            }),
            _ => None,
        })
        .collect();

    let images: Vec<ImageBlock> = msg
        .blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Image { format, data } => Some(ImageBlock {
                format: format.clone(),
                source: ImageSource {
                    bytes: data.clone(),
                },
            }),
            _ => None,
        })
        .collect();

    build_user_entry(
        msg.text(),
        &tool_results,
        &images,
        model_id,
        tools_declared,
        thinking,
    )
}

fn build_user_entry(
    text: String,
    tool_results: &[QToolResult],
    images: &[ImageBlock],
    model_id: &str,
    tools_declared: bool,
    thinking: bool,
) -> UserInputMessage {
    let mut content = user_content_or_sentinel(text, !tool_results.is_empty(), tools_declared);
    if thinking {
        append_thinking_hint(&mut content);
    }
    UserInputMessage {
        content,
        context: UserInputMessageContext {
            env_state: EnvState::current(),
            tools: Vec::new(),
            tool_results: tool_results.to_vec(),
        },
        origin: "AI_EDITOR".to_string(),
        model_id: model_id.to_string(),
        images: images.to_vec(),
    }
}

fn assistant_entry_from_message(
    msg: &ChatMessage,
    next_id: &mut usize,
) -> AssistantResponseMessage {
    let tool_uses: Vec<QToolUse> = msg
        .tool_uses()
        .map(|(id, name, input)| QToolUse {
            tool_use_id: id.to_string(),
            name: name.to_string(),
            input: input.clone(),
        })
        .collect();
    let text = msg.text();
    AssistantResponseMessage {
        message_id: message_id(next_id),
        content: if text.is_empty() && !tool_uses.is_empty() {
            // Upstream rejects fully empty assistant content.
            "...".to_string()
        } else if text.is_empty() {
            "OK".to_string()
        } else {
            text
        },
        tool_uses,
    }
}

fn tool_result_value(block: &ToolResultBlock) -> Value {
    match block {
        ToolResultBlock::Text { text } => serde_json::json!({ "text": text }),
        ToolResultBlock::Json { json } => serde_json::json!({ "json": json }),
    }
}

fn build_tool_specs(tools: &[crate::types::ToolSchema]) -> Vec<ToolSpecWrapper> {
    tools
        .iter()
        .map(|t| {
            let mut description = if t.description.trim().is_empty() {
                "...".to_string()
            } else {
                t.description.clone()
            };
            if description.chars().count() > MAX_TOOL_DESCRIPTION {
                description = description.chars().take(MAX_TOOL_DESCRIPTION).collect();
            }
            ToolSpecWrapper {
                tool_specification: ToolSpecification {
                    name: t.name.clone(),
                    description,
                    input_schema: InputSchema {
                        json: reorder_input_schema(&t.input_schema),
                    },
                },
            }
        })
        .collect()
}

// ─── JSON-Schema reordering ───────────────────────────────────────────────────

/// Rebuild a JSON-Schema object with the upstream's required key order:
/// `type → properties → required → everything else`, where `properties`
/// lists required names first (in `required` order) and the remainder
/// alphabetically.  Nested property schemas are reordered recursively.
pub fn reorder_input_schema(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return schema.clone();
    };

    let required_names: Vec<String> = obj
        .get("required")
        .and_then(|r| r.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let mut out = Map::new();
    if let Some(t) = obj.get("type") {
        out.insert("type".to_string(), t.clone());
    }
    if let Some(props) = obj.get("properties").and_then(|p| p.as_object()) {
        out.insert(
            "properties".to_string(),
            Value::Object(reorder_properties(props, &required_names)),
        );
    }
    if let Some(r) = obj.get("required") {
        out.insert("required".to_string(), r.clone());
    }
    for (k, v) in obj {
        if !out.contains_key(k) {
            out.insert(k.clone(), v.clone());
        }
    }
    Value::Object(out)
}

fn reorder_properties(props: &Map<String, Value>, required: &[String]) -> Map<String, Value> {
    let mut out = Map::new();
    for name in required {
        if let Some(v) = props.get(name) {
            out.insert(name.clone(), reorder_input_schema(v));
        }
    }
    let mut rest: Vec<&String> = props.keys().filter(|k| !out.contains_key(*k)).collect();
    rest.sort();
    for name in rest {
        out.insert(name.clone(), reorder_input_schema(&props[name]));
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
