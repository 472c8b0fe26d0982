// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-dialect stream state machines.
//!
//! Each emitter converts the upstream [`QEvent`] sequence into its client
//! dialect: canonical Claude SSE framing, OpenAI `chat.completion.chunk`
//! lines, or the console UI's simplified schema.  All emitters share two
//! rules: events are re-emitted in upstream arrival order, and `finish()`
//! always produces a well-formed terminator — a client that disconnects
//! mid-stream still receives balanced start/stop framing.
//!
//! Output tokens are counted by summing the character counts of emitted
//! content deltas, never by re-tokenizing the accumulated body; the count
//! therefore stays correct when a response is assembled across retries.

use serde_json::{json, Value};

use crate::events::QEvent;

/// One SSE line pair ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct SseMessage {
    /// `event:` field; omitted for dialects that use bare `data:` lines.
    pub event: Option<String>,
    pub data: String,
}

impl SseMessage {
    pub fn named(event: &str, data: Value) -> Self {
        Self {
            event: Some(event.to_string()),
            data: data.to_string(),
        }
    }

    pub fn bare(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    /// Render as wire bytes, trailing blank line included.
    pub fn render(&self) -> String {
        match &self.event {
            Some(e) => format!("event: {}\ndata: {}\n\n", e, self.data),
            None => format!("data: {}\n\n", self.data),
        }
    }
}

// ─── Claude SSE ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum OpenBlock {
    Text,
    Tool { id: String },
}

/// State machine emitting the canonical Claude event sequence:
/// `message_start`, block start/delta/stop per content block,
/// `message_delta`, `message_stop`.
pub struct ClaudeSse {
    message_id: String,
    model: String,
    input_tokens: u32,
    started: bool,
    finished: bool,
    block_index: usize,
    open_block: Option<OpenBlock>,
    saw_tool_use: bool,
    output_chars: usize,
}

impl ClaudeSse {
    pub fn new(model: impl Into<String>, input_tokens: u32) -> Self {
        Self {
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            input_tokens,
            started: false,
            finished: false,
            block_index: 0,
            open_block: None,
            saw_tool_use: false,
            output_chars: 0,
        }
    }

    /// Characters of content emitted so far (the output-token count).
    pub fn output_tokens(&self) -> u32 {
        self.output_chars as u32
    }

    pub fn on_event(&mut self, ev: &QEvent) -> Vec<SseMessage> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);

        match ev {
            QEvent::Text { content } => {
                if content.is_empty() {
                    return out;
                }
                self.close_tool_block(&mut out);
                if self.open_block.is_none() {
                    out.push(SseMessage::named(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": self.block_index,
                            "content_block": { "type": "text", "text": "" }
                        }),
                    ));
                    self.open_block = Some(OpenBlock::Text);
                }
                self.output_chars += content.chars().count();
                out.push(SseMessage::named(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": { "type": "text_delta", "text": content }
                    }),
                ));
            }
            QEvent::ToolUse {
                tool_use_id,
                name,
                input,
                stop,
            } => {
                self.saw_tool_use = true;
                let same_tool = matches!(
                    &self.open_block,
                    Some(OpenBlock::Tool { id }) if id == tool_use_id
                );
                if !same_tool {
                    self.close_any_block(&mut out);
                    out.push(SseMessage::named(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": self.block_index,
                            "content_block": {
                                "type": "tool_use",
                                "id": tool_use_id,
                                "name": name,
                                "input": {}
                            }
                        }),
                    ));
                    self.open_block = Some(OpenBlock::Tool {
                        id: tool_use_id.clone(),
                    });
                }
                if !input.is_empty() {
                    self.output_chars += input.chars().count();
                    out.push(SseMessage::named(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": self.block_index,
                            "delta": { "type": "input_json_delta", "partial_json": input }
                        }),
                    ));
                }
                if *stop {
                    self.close_any_block(&mut out);
                }
            }
            QEvent::CodeReference { tool_uses } => {
                for tu in tool_uses {
                    self.saw_tool_use = true;
                    self.close_any_block(&mut out);
                    out.push(SseMessage::named(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": self.block_index,
                            "content_block": {
                                "type": "tool_use",
                                "id": tu.tool_use_id,
                                "name": tu.name,
                                "input": {}
                            }
                        }),
                    ));
                    let args = tu.input.to_string();
                    self.output_chars += args.chars().count();
                    out.push(SseMessage::named(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": self.block_index,
                            "delta": { "type": "input_json_delta", "partial_json": args }
                        }),
                    ));
                    self.open_block = Some(OpenBlock::Tool {
                        id: tu.tool_use_id.clone(),
                    });
                    self.close_any_block(&mut out);
                }
            }
            QEvent::Other { .. } => {}
        }
        out
    }

    /// Emit the terminator framing.  Idempotent; safe on premature
    /// disconnect before any upstream event arrived.
    pub fn finish(&mut self) -> Vec<SseMessage> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_any_block(&mut out);
        let stop_reason = if self.saw_tool_use { "tool_use" } else { "end_turn" };
        out.push(SseMessage::named(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                "usage": { "output_tokens": self.output_chars }
            }),
        ));
        out.push(SseMessage::named(
            "message_stop",
            json!({ "type": "message_stop" }),
        ));
        out
    }

    pub fn stop_reason(&self) -> &'static str {
        if self.saw_tool_use {
            "tool_use"
        } else {
            "end_turn"
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<SseMessage>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(SseMessage::named(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "usage": { "input_tokens": self.input_tokens, "output_tokens": 0 }
                }
            }),
        ));
    }

    fn close_tool_block(&mut self, out: &mut Vec<SseMessage>) {
        if matches!(self.open_block, Some(OpenBlock::Tool { .. })) {
            self.close_any_block(out);
        }
    }

    fn close_any_block(&mut self, out: &mut Vec<SseMessage>) {
        if self.open_block.take().is_some() {
            out.push(SseMessage::named(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": self.block_index }),
            ));
            self.block_index += 1;
        }
    }
}

// ─── OpenAI SSE ───────────────────────────────────────────────────────────────

/// Emitter for `chat.completion.chunk` lines with a `[DONE]` sentinel.
pub struct OpenAiSse {
    id: String,
    model: String,
    created: i64,
    sent_role: bool,
    finished: bool,
    /// Tool ids in first-seen order; index in this vec = wire `index`.
    tool_ids: Vec<String>,
    saw_tool_use: bool,
    output_chars: usize,
}

impl OpenAiSse {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            sent_role: false,
            finished: false,
            tool_ids: Vec::new(),
            saw_tool_use: false,
            output_chars: 0,
        }
    }

    pub fn output_tokens(&self) -> u32 {
        self.output_chars as u32
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> SseMessage {
        SseMessage::bare(
            json!({
                "id": self.id,
                "object": "chat.completion.chunk",
                "created": self.created,
                "model": self.model,
                "choices": [{
                    "index": 0,
                    "delta": delta,
                    "finish_reason": finish_reason
                }]
            })
            .to_string(),
        )
    }

    pub fn on_event(&mut self, ev: &QEvent) -> Vec<SseMessage> {
        let mut out = Vec::new();
        if !self.sent_role {
            self.sent_role = true;
            out.push(self.chunk(json!({ "role": "assistant" }), None));
        }
        match ev {
            QEvent::Text { content } => {
                if !content.is_empty() {
                    self.output_chars += content.chars().count();
                    out.push(self.chunk(json!({ "content": content }), None));
                }
            }
            QEvent::ToolUse {
                tool_use_id,
                name,
                input,
                ..
            } => {
                self.saw_tool_use = true;
                let (index, first) = match self.tool_ids.iter().position(|id| id == tool_use_id) {
                    Some(i) => (i, false),
                    None => {
                        self.tool_ids.push(tool_use_id.clone());
                        (self.tool_ids.len() - 1, true)
                    }
                };
                let call = if first {
                    json!({
                        "index": index,
                        "id": tool_use_id,
                        "type": "function",
                        "function": { "name": name, "arguments": input }
                    })
                } else {
                    json!({
                        "index": index,
                        "function": { "arguments": input }
                    })
                };
                self.output_chars += input.chars().count();
                out.push(self.chunk(json!({ "tool_calls": [call] }), None));
            }
            QEvent::CodeReference { tool_uses } => {
                for tu in tool_uses {
                    self.saw_tool_use = true;
                    self.tool_ids.push(tu.tool_use_id.clone());
                    let index = self.tool_ids.len() - 1;
                    let args = tu.input.to_string();
                    self.output_chars += args.chars().count();
                    out.push(self.chunk(
                        json!({
                            "tool_calls": [{
                                "index": index,
                                "id": tu.tool_use_id,
                                "type": "function",
                                "function": { "name": tu.name, "arguments": args }
                            }]
                        }),
                        None,
                    ));
                }
            }
            QEvent::Other { .. } => {}
        }
        out
    }

    pub fn finish(&mut self) -> Vec<SseMessage> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let reason = if self.saw_tool_use { "tool_calls" } else { "stop" };
        vec![
            self.chunk(json!({}), Some(reason)),
            SseMessage::bare("[DONE]"),
        ]
    }
}

// ─── Console SSE ──────────────────────────────────────────────────────────────

/// Simplified `meta` / `thinking_delta` / `answer_delta` / `done` schema for
/// the internal console UI.
pub struct ConsoleSse {
    conversation_id: String,
    model: String,
    sent_meta: bool,
    finished: bool,
    splitter: Option<ThinkingSplitter>,
    output_chars: usize,
}

impl ConsoleSse {
    pub fn new(conversation_id: impl Into<String>, model: impl Into<String>, thinking: bool) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            model: model.into(),
            sent_meta: false,
            finished: false,
            splitter: thinking.then(ThinkingSplitter::default),
            output_chars: 0,
        }
    }

    pub fn output_tokens(&self) -> u32 {
        self.output_chars as u32
    }

    pub fn on_event(&mut self, ev: &QEvent) -> Vec<SseMessage> {
        let mut out = Vec::new();
        if !self.sent_meta {
            self.sent_meta = true;
            out.push(SseMessage::bare(
                json!({
                    "type": "meta",
                    "conversation_id": self.conversation_id,
                    "model": self.model
                })
                .to_string(),
            ));
        }
        if let QEvent::Text { content } = ev {
            if content.is_empty() {
                return out;
            }
            self.output_chars += content.chars().count();
            let parts = match &mut self.splitter {
                Some(s) => s.push(content),
                None => vec![(false, content.clone())],
            };
            for (thinking, text) in parts {
                let kind = if thinking { "thinking_delta" } else { "answer_delta" };
                out.push(SseMessage::bare(
                    json!({ "type": kind, "text": text }).to_string(),
                ));
            }
        }
        out
    }

    pub fn finish(&mut self) -> Vec<SseMessage> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut out = Vec::new();
        if let Some(s) = &mut self.splitter {
            for (thinking, text) in s.flush() {
                let kind = if thinking { "thinking_delta" } else { "answer_delta" };
                out.push(SseMessage::bare(
                    json!({ "type": kind, "text": text }).to_string(),
                ));
            }
        }
        out.push(SseMessage::bare(
            json!({ "type": "done", "output_tokens": self.output_chars }).to_string(),
        ));
        out
    }
}

/// Routes text inside `<thinking>…</thinking>` markers to the thinking
/// channel.  Tags may be split across deltas, so a suffix that could still
/// grow into a tag is withheld until disambiguated.
#[derive(Debug, Default)]
pub struct ThinkingSplitter {
    inside: bool,
    pending: String,
}

const THINKING_OPEN: &str = "<thinking>";
const THINKING_CLOSE: &str = "</thinking>";

impl ThinkingSplitter {
    /// Feed a delta; returns `(is_thinking, text)` runs ready to emit.
    pub fn push(&mut self, text: &str) -> Vec<(bool, String)> {
        self.pending.push_str(text);
        let mut out = Vec::new();
        loop {
            let tag = if self.inside { THINKING_CLOSE } else { THINKING_OPEN };
            let (emit, found) = take_until_tag(&mut self.pending, tag);
            if !emit.is_empty() {
                out.push((self.inside, emit));
            }
            if found {
                self.inside = !self.inside;
            } else {
                break;
            }
        }
        out
    }

    /// Drain whatever is withheld, including a dangling partial tag.
    pub fn flush(&mut self) -> Vec<(bool, String)> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let text = std::mem::take(&mut self.pending);
        vec![(self.inside, text)]
    }
}

/// Remove and return everything before `tag` in `buf`.  When the tag is
/// absent, everything except a suffix that is a strict prefix of the tag is
/// returned (the suffix might complete into the tag on the next delta).
fn take_until_tag(buf: &mut String, tag: &str) -> (String, bool) {
    if let Some(pos) = buf.find(tag) {
        let before = buf[..pos].to_string();
        buf.drain(..pos + tag.len());
        return (before, true);
    }
    let keep = longest_suffix_matching_tag_prefix(buf, tag);
    let emit = buf[..buf.len() - keep].to_string();
    buf.drain(..buf.len() - keep);
    (emit, false)
}

fn longest_suffix_matching_tag_prefix(buf: &str, tag: &str) -> usize {
    let max = tag.len().min(buf.len());
    for k in (1..=max).rev() {
        if buf.is_char_boundary(buf.len() - k) && tag.as_bytes()[..k] == buf.as_bytes()[buf.len() - k..] {
            return k;
        }
    }
    0
}

// ─── Non-streaming collector ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CollectedToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone)]
pub struct CollectedResponse {
    pub text: String,
    pub tool_uses: Vec<CollectedToolUse>,
    pub output_tokens: u32,
}

impl CollectedResponse {
    pub fn stop_reason(&self) -> &'static str {
        if self.tool_uses.is_empty() {
            "end_turn"
        } else {
            "tool_use"
        }
    }
}

/// Buffers all upstream events into one response body.
///
/// Tool-use input fragments arrive as ordered string chunks; the collector
/// concatenates them per tool id (first-seen order preserved) and parses the
/// concatenation as JSON on `finish()`.
#[derive(Debug, Default)]
pub struct EventCollector {
    text: String,
    tools: Vec<(String, String, String)>, // (id, name, input fragments)
    output_chars: usize,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&mut self, ev: &QEvent) {
        match ev {
            QEvent::Text { content } => {
                self.output_chars += content.chars().count();
                self.text.push_str(content);
            }
            QEvent::ToolUse {
                tool_use_id,
                name,
                input,
                ..
            } => {
                self.output_chars += input.chars().count();
                match self.tools.iter_mut().find(|(id, _, _)| id == tool_use_id) {
                    Some(entry) => {
                        if entry.1.is_empty() {
                            entry.1 = name.clone();
                        }
                        entry.2.push_str(input);
                    }
                    None => {
                        self.tools
                            .push((tool_use_id.clone(), name.clone(), input.clone()));
                    }
                }
            }
            QEvent::CodeReference { tool_uses } => {
                for tu in tool_uses {
                    let args = tu.input.to_string();
                    self.output_chars += args.chars().count();
                    self.tools
                        .push((tu.tool_use_id.clone(), tu.name.clone(), args));
                }
            }
            QEvent::Other { .. } => {}
        }
    }

    pub fn finish(self) -> CollectedResponse {
        let tool_uses = self
            .tools
            .into_iter()
            .map(|(id, name, fragments)| CollectedToolUse {
                id,
                name,
                input: if fragments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&fragments).unwrap_or_else(|_| json!({}))
                },
            })
            .collect();
        CollectedResponse {
            text: self.text,
            tool_uses,
            output_tokens: self.output_chars as u32,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
