// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Protocol translation for the qrelay gateway.
//!
//! Inbound: Anthropic Messages and OpenAI Chat Completions request bodies are
//! parsed into one normalized conversation model ([`ChatRequest`]).  Outbound:
//! the normalized model is rewritten into the Amazon Q `conversationState`
//! wire shape with its order-significant JSON fields, and upstream event-
//! stream events are re-emitted as Claude SSE, OpenAI SSE, console SSE, or a
//! buffered JSON body.

mod claude;
mod events;
mod images;
mod models;
mod normalize;
mod openai;
mod qwire;
mod sse;
mod types;

pub use claude::{claude_response_json, parse_claude_request};
pub use events::{parse_upstream_event, QEvent, ToolUseRef};
pub use images::{decode_data_url, validate_image, ImageError, MAX_IMAGE_BYTES};
pub use models::{known_short_ids, map_model_id, DEFAULT_MODEL_ID};
pub use normalize::{
    normalize_history, reorder_tool_results, scan_for_tool_loop, THINKING_HINT,
};
pub use openai::{openai_response_json, parse_openai_request};
pub use qwire::{
    build_conversation, reorder_input_schema, ChatTriggerType, ConversationState, EnvState,
    HistoryEntry, QRequest,
};
pub use sse::{
    ClaudeSse, CollectedResponse, CollectedToolUse, ConsoleSse, EventCollector, OpenAiSse,
    SseMessage, ThinkingSplitter,
};
pub use types::*;
