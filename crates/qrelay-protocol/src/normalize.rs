// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! History normalization applied before the Amazon Q rewrite.
//!
//! Upstream rejects histories that do not strictly alternate user/assistant,
//! histories that end on a user turn, and tool results whose order disagrees
//! with the tool uses that produced them.  Client SDKs violate all three in
//! practice, so every request passes through this module first.

use crate::types::{ChatMessage, ContentBlock, Role, ToolResultBlock, TranslateError};

/// Literal hint appended to user content when interleaved thinking is on.
/// The exact byte sequence matters upstream; do not reformat.
pub const THINKING_HINT: &str =
    "<thinking_mode>interleaved</thinking_mode><max_thinking_length>16000</max_thinking_length>";

/// Placeholder inserted when alternation has to be rescued.
const RESCUE_PLACEHOLDER: &str = "...";
/// Acknowledgment content for injected assistant turns.
const ACK: &str = "OK";

/// How many trailing messages the loop guard inspects.
const LOOP_WINDOW: usize = 10;
/// Identical consecutive tool calls required to declare a loop.
const LOOP_LIMIT: usize = 3;

// ─── Infinite-loop guard ──────────────────────────────────────────────────────

/// Fail with [`TranslateError::LoopDetected`] when the tail of the
/// conversation shows the model re-issuing one identical tool call.
///
/// A call is "identical" when both the tool name and the exact input JSON
/// match.  User turns that carry only tool results do not break the run —
/// that alternation is precisely what a looping agent produces.  A user turn
/// with real content resets the count.
pub fn scan_for_tool_loop(messages: &[ChatMessage]) -> Result<(), TranslateError> {
    let start = messages.len().saturating_sub(LOOP_WINDOW);
    let mut last_call: Option<(String, String)> = None;
    let mut run = 0usize;

    for msg in &messages[start..] {
        match msg.role {
            Role::User => {
                if !msg.is_tool_result_only() {
                    last_call = None;
                    run = 0;
                }
            }
            Role::Assistant => {
                for (_, name, input) in msg.tool_uses() {
                    let key = (name.to_string(), input.to_string());
                    if last_call.as_ref() == Some(&key) {
                        run += 1;
                    } else {
                        last_call = Some(key);
                        run = 1;
                    }
                    if run >= LOOP_LIMIT {
                        return Err(TranslateError::LoopDetected);
                    }
                }
            }
        }
    }
    Ok(())
}

// ─── Tool-result reordering ───────────────────────────────────────────────────

/// Rewrite every user turn that carries tool results so that the results
/// appear in the id order the preceding assistant turn emitted them.
///
/// Duplicates (same `tool_use_id`) are merged: content arrays concatenate
/// with per-text dedup, and an error status on any contributor makes the
/// merged result an error.  Results with no matching tool use in the
/// preceding assistant turn are dropped — upstream rejects orphans outright.
///
/// The pass is idempotent: reordering an already-ordered history is a no-op.
pub fn reorder_tool_results(messages: &mut [ChatMessage]) {
    for i in 1..messages.len() {
        if messages[i].role != Role::User || !messages[i].has_tool_results() {
            continue;
        }
        if messages[i - 1].role != Role::Assistant {
            continue;
        }
        let id_order: Vec<String> = messages[i - 1]
            .tool_uses()
            .map(|(id, _, _)| id.to_string())
            .collect();
        reorder_one_turn(&mut messages[i], &id_order);
    }
}

fn reorder_one_turn(msg: &mut ChatMessage, id_order: &[String]) {
    let mut merged: Vec<(String, Vec<ToolResultBlock>, bool)> = Vec::new();
    let mut rest: Vec<ContentBlock> = Vec::new();

    for block in msg.blocks.drain(..) {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                if let Some(entry) = merged.iter_mut().find(|(id, _, _)| *id == tool_use_id) {
                    for c in content {
                        let text = c.as_text();
                        if !entry.1.iter().any(|have| have.as_text() == text) {
                            entry.1.push(c);
                        }
                    }
                    entry.2 |= is_error;
                } else {
                    merged.push((tool_use_id, content, is_error));
                }
            }
            other => rest.push(other),
        }
    }

    let mut ordered: Vec<ContentBlock> = Vec::with_capacity(merged.len());
    for wanted in id_order {
        if let Some(pos) = merged.iter().position(|(id, _, _)| id == wanted) {
            let (tool_use_id, content, is_error) = merged.remove(pos);
            ordered.push(ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            });
        }
    }
    // Anything left in `merged` had no matching tool use: dropped.

    ordered.extend(rest);
    msg.blocks = ordered;
}

// ─── Alternation ──────────────────────────────────────────────────────────────

/// Enforce strict user/assistant alternation on a history slice.
///
/// - consecutive same-role turns get an opposite-role `"..."` placeholder
///   between them;
/// - a history that opens on an assistant turn gets a `"..."` user turn
///   prepended;
/// - a history that ends on a user turn gets an `"OK"` assistant appended.
pub fn normalize_history(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len() + 2);

    for msg in messages {
        match out.last() {
            None => {
                if msg.role == Role::Assistant {
                    out.push(ChatMessage::user(RESCUE_PLACEHOLDER));
                }
            }
            Some(prev) if prev.role == msg.role => {
                let placeholder = match msg.role {
                    Role::User => ChatMessage::assistant(RESCUE_PLACEHOLDER),
                    Role::Assistant => ChatMessage::user(RESCUE_PLACEHOLDER),
                };
                out.push(placeholder);
            }
            _ => {}
        }
        out.push(msg);
    }

    if matches!(out.last(), Some(m) if m.role == Role::User) {
        out.push(ChatMessage::assistant(ACK));
    }
    out
}

// ─── Content sentinels & thinking hint ────────────────────────────────────────

/// Replace empty user content with the sentinel the upstream tolerates.
pub fn user_content_or_sentinel(
    text: String,
    has_tool_results: bool,
    tools_declared: bool,
) -> String {
    if !text.trim().is_empty() {
        return text;
    }
    if has_tool_results {
        "Tool results provided.".to_string()
    } else if tools_declared {
        "执行工具任务".to_string()
    } else {
        "Continue".to_string()
    }
}

/// Append the interleaved-thinking hint to non-empty content, exactly once.
pub fn append_thinking_hint(content: &mut String) {
    if content.is_empty() || content.contains(THINKING_HINT) {
        return;
    }
    content.push_str(THINKING_HINT);
}

// ─── Image retention ──────────────────────────────────────────────────────────

/// Strip image blocks from every message except the final two turns.
///
/// Images dominate the request size; on merged histories only the latest
/// exchange still benefits from them.
pub fn retain_recent_images(messages: &mut [ChatMessage]) {
    let keep_from = messages.len().saturating_sub(2);
    for msg in &mut messages[..keep_from] {
        msg.blocks
            .retain(|b| !matches!(b, ContentBlock::Image { .. }));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_use(id: &str, name: &str, input: serde_json::Value) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    fn tool_result(id: &str, text: &str) -> ContentBlock {
        ContentBlock::ToolResult {
            tool_use_id: id.into(),
            content: vec![ToolResultBlock::Text { text: text.into() }],
            is_error: false,
        }
    }

    fn assistant_call(id: &str, name: &str, input: serde_json::Value) -> ChatMessage {
        ChatMessage {
            role: Role::Assistant,
            blocks: vec![tool_use(id, name, input)],
        }
    }

    fn result_turn(blocks: Vec<ContentBlock>) -> ChatMessage {
        ChatMessage {
            role: Role::User,
            blocks,
        }
    }

    // ── scan_for_tool_loop ────────────────────────────────────────────────────

    #[test]
    fn three_identical_calls_trip_the_guard() {
        let msgs = vec![
            assistant_call("a", "search", json!({"q": "x"})),
            result_turn(vec![tool_result("a", "nothing")]),
            assistant_call("b", "search", json!({"q": "x"})),
            result_turn(vec![tool_result("b", "nothing")]),
            assistant_call("c", "search", json!({"q": "x"})),
        ];
        assert_eq!(scan_for_tool_loop(&msgs), Err(TranslateError::LoopDetected));
    }

    #[test]
    fn different_input_does_not_trip() {
        let msgs = vec![
            assistant_call("a", "search", json!({"q": "x"})),
            result_turn(vec![tool_result("a", "n")]),
            assistant_call("b", "search", json!({"q": "y"})),
            result_turn(vec![tool_result("b", "n")]),
            assistant_call("c", "search", json!({"q": "x"})),
        ];
        assert!(scan_for_tool_loop(&msgs).is_ok());
    }

    #[test]
    fn different_name_does_not_trip() {
        let msgs = vec![
            assistant_call("a", "search", json!({})),
            result_turn(vec![tool_result("a", "n")]),
            assistant_call("b", "fetch", json!({})),
            result_turn(vec![tool_result("b", "n")]),
            assistant_call("c", "search", json!({})),
        ];
        assert!(scan_for_tool_loop(&msgs).is_ok());
    }

    #[test]
    fn real_user_message_resets_the_run() {
        let msgs = vec![
            assistant_call("a", "search", json!({"q": "x"})),
            result_turn(vec![tool_result("a", "n")]),
            assistant_call("b", "search", json!({"q": "x"})),
            ChatMessage::user("try harder"),
            assistant_call("c", "search", json!({"q": "x"})),
        ];
        assert!(scan_for_tool_loop(&msgs).is_ok());
    }

    #[test]
    fn two_identical_calls_pass() {
        let msgs = vec![
            assistant_call("a", "search", json!({"q": "x"})),
            result_turn(vec![tool_result("a", "n")]),
            assistant_call("b", "search", json!({"q": "x"})),
        ];
        assert!(scan_for_tool_loop(&msgs).is_ok());
    }

    #[test]
    fn loop_outside_window_is_ignored() {
        let mut msgs = vec![
            assistant_call("a", "search", json!({"q": "x"})),
            result_turn(vec![tool_result("a", "n")]),
            assistant_call("b", "search", json!({"q": "x"})),
            result_turn(vec![tool_result("b", "n")]),
            assistant_call("c", "search", json!({"q": "x"})),
        ];
        // Bury the loop under ten fresh messages.
        for i in 0..5 {
            msgs.push(ChatMessage::user(format!("q{i}")));
            msgs.push(ChatMessage::assistant(format!("a{i}")));
        }
        assert!(scan_for_tool_loop(&msgs).is_ok());
    }

    // ── reorder_tool_results ──────────────────────────────────────────────────

    #[test]
    fn results_follow_tool_use_order() {
        let mut msgs = vec![
            ChatMessage {
                role: Role::Assistant,
                blocks: vec![
                    tool_use("a", "t", json!({})),
                    tool_use("b", "t", json!({})),
                    tool_use("c", "t", json!({})),
                ],
            },
            result_turn(vec![
                tool_result("c", "3"),
                tool_result("a", "1"),
                tool_result("b", "2"),
            ]),
        ];
        reorder_tool_results(&mut msgs);
        let ids: Vec<String> = msgs[1]
            .blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn reorder_is_idempotent() {
        let mut msgs = vec![
            ChatMessage {
                role: Role::Assistant,
                blocks: vec![tool_use("a", "t", json!({})), tool_use("b", "t", json!({}))],
            },
            result_turn(vec![tool_result("b", "2"), tool_result("a", "1")]),
        ];
        reorder_tool_results(&mut msgs);
        let once = msgs.clone();
        reorder_tool_results(&mut msgs);
        assert_eq!(msgs, once);
    }

    #[test]
    fn duplicate_results_merge_with_text_dedup() {
        let mut msgs = vec![
            assistant_call("a", "t", json!({})),
            result_turn(vec![
                tool_result("a", "same"),
                tool_result("a", "same"),
                tool_result("a", "extra"),
            ]),
        ];
        reorder_tool_results(&mut msgs);
        match &msgs[1].blocks[0] {
            ContentBlock::ToolResult { content, .. } => {
                let texts: Vec<String> = content.iter().map(|c| c.as_text()).collect();
                assert_eq!(texts, vec!["same", "extra"]);
            }
            other => panic!("expected ToolResult, got {other:?}"),
        }
    }

    #[test]
    fn merged_error_status_wins() {
        let mut msgs = vec![
            assistant_call("a", "t", json!({})),
            result_turn(vec![
                tool_result("a", "fine"),
                ContentBlock::ToolResult {
                    tool_use_id: "a".into(),
                    content: vec![ToolResultBlock::Text { text: "boom".into() }],
                    is_error: true,
                },
            ]),
        ];
        reorder_tool_results(&mut msgs);
        match &msgs[1].blocks[0] {
            ContentBlock::ToolResult { is_error, .. } => assert!(is_error),
            other => panic!("expected ToolResult, got {other:?}"),
        }
    }

    #[test]
    fn orphan_results_are_dropped() {
        let mut msgs = vec![
            assistant_call("a", "t", json!({})),
            result_turn(vec![tool_result("a", "ok"), tool_result("ghost", "??")]),
        ];
        reorder_tool_results(&mut msgs);
        let ids: Vec<String> = msgs[1]
            .blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["a"]);
    }

    // ── normalize_history ─────────────────────────────────────────────────────

    fn roles(msgs: &[ChatMessage]) -> Vec<Role> {
        msgs.iter().map(|m| m.role).collect()
    }

    #[test]
    fn alternation_inserted_between_same_role_turns() {
        let msgs = vec![
            ChatMessage::user("one"),
            ChatMessage::user("two"),
            ChatMessage::assistant("reply"),
        ];
        let out = normalize_history(msgs);
        assert_eq!(
            roles(&out),
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(out[1].text(), "...");
    }

    #[test]
    fn history_always_ends_with_assistant() {
        let out = normalize_history(vec![ChatMessage::user("hi")]);
        assert_eq!(roles(&out), vec![Role::User, Role::Assistant]);
        assert_eq!(out[1].text(), "OK");
    }

    #[test]
    fn history_opening_on_assistant_gets_user_placeholder() {
        let out = normalize_history(vec![ChatMessage::assistant("hello")]);
        assert_eq!(roles(&out), vec![Role::User, Role::Assistant]);
        assert_eq!(out[0].text(), "...");
    }

    #[test]
    fn already_alternating_history_is_untouched() {
        let msgs = vec![
            ChatMessage::user("q"),
            ChatMessage::assistant("a"),
            ChatMessage::user("q2"),
            ChatMessage::assistant("a2"),
        ];
        let out = normalize_history(msgs.clone());
        assert_eq!(out, msgs);
    }

    #[test]
    fn empty_history_stays_empty() {
        assert!(normalize_history(vec![]).is_empty());
    }

    // ── sentinels & thinking hint ─────────────────────────────────────────────

    #[test]
    fn sentinel_for_tool_results() {
        assert_eq!(
            user_content_or_sentinel(String::new(), true, true),
            "Tool results provided."
        );
    }

    #[test]
    fn sentinel_for_declared_tools_without_results() {
        assert_eq!(user_content_or_sentinel(String::new(), false, true), "执行工具任务");
    }

    #[test]
    fn sentinel_for_plain_empty_content() {
        assert_eq!(user_content_or_sentinel(String::new(), false, false), "Continue");
    }

    #[test]
    fn non_empty_content_is_kept_verbatim() {
        assert_eq!(
            user_content_or_sentinel("hello".into(), true, true),
            "hello"
        );
    }

    #[test]
    fn thinking_hint_appended_once() {
        let mut c = "question".to_string();
        append_thinking_hint(&mut c);
        append_thinking_hint(&mut c);
        assert_eq!(c.matches("<thinking_mode>").count(), 1);
        assert!(c.starts_with("question"));
    }

    #[test]
    fn thinking_hint_skips_empty_content() {
        let mut c = String::new();
        append_thinking_hint(&mut c);
        assert!(c.is_empty());
    }

    // ── retain_recent_images ──────────────────────────────────────────────────

    #[test]
    fn images_survive_only_in_final_two_turns() {
        let img = ContentBlock::Image {
            format: "png".into(),
            data: "AAAA".into(),
        };
        let mut msgs = vec![
            ChatMessage {
                role: Role::User,
                blocks: vec![img.clone(), ContentBlock::Text { text: "old".into() }],
            },
            ChatMessage::assistant("seen"),
            ChatMessage {
                role: Role::User,
                blocks: vec![img.clone()],
            },
            ChatMessage {
                role: Role::Assistant,
                blocks: vec![img.clone()],
            },
        ];
        retain_recent_images(&mut msgs);
        assert_eq!(msgs[0].blocks.len(), 1, "old image stripped");
        assert_eq!(msgs[2].blocks.len(), 1, "recent image kept");
        assert_eq!(msgs[3].blocks.len(), 1, "final image kept");
    }
}
