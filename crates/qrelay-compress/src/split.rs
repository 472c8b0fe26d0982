// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Split-point search.
//!
//! Compression replaces `messages[..split_idx]` with a summary and keeps
//! the suffix verbatim.  The suffix must stay tool-consistent: a
//! `tool_result` whose producing `tool_use` was summarized away would be an
//! orphan upstream.  The search starts at `len - keep` and walks backward
//! until the suffix is consistent, bounded by `max_lookback` steps.

use std::collections::HashSet;

use qrelay_protocol::{ChatMessage, ContentBlock};

/// Largest `split_idx ≤ len - keep` whose suffix is tool-consistent, or
/// `None` when the history is too short or no consistent point exists
/// within the lookback budget.
pub fn find_split_point(
    messages: &[ChatMessage],
    keep: usize,
    max_lookback: usize,
) -> Option<usize> {
    if messages.len() <= keep {
        return None;
    }
    let start = messages.len() - keep;
    let lowest = start.saturating_sub(max_lookback);
    (lowest..=start)
        .rev()
        .find(|&idx| idx > 0 && suffix_tool_consistent(&messages[idx..]))
}

/// Every `tool_result` in the slice has its producing `tool_use` in the
/// slice as well.
fn suffix_tool_consistent(suffix: &[ChatMessage]) -> bool {
    let produced: HashSet<&str> = suffix
        .iter()
        .flat_map(|m| m.blocks.iter())
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
            _ => None,
        })
        .collect();

    suffix
        .iter()
        .flat_map(|m| m.blocks.iter())
        .all(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => produced.contains(tool_use_id.as_str()),
            _ => true,
        })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use qrelay_protocol::{Role, ToolResultBlock};
    use serde_json::json;

    fn plain_history(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("q{i}"))
                } else {
                    ChatMessage::assistant(format!("a{i}"))
                }
            })
            .collect()
    }

    fn tool_use_msg(id: &str) -> ChatMessage {
        ChatMessage {
            role: Role::Assistant,
            blocks: vec![ContentBlock::ToolUse {
                id: id.into(),
                name: "t".into(),
                input: json!({}),
            }],
        }
    }

    fn tool_result_msg(id: &str) -> ChatMessage {
        ChatMessage {
            role: Role::User,
            blocks: vec![ContentBlock::ToolResult {
                tool_use_id: id.into(),
                content: vec![ToolResultBlock::Text { text: "r".into() }],
                is_error: false,
            }],
        }
    }

    #[test]
    fn plain_history_splits_at_len_minus_keep() {
        let msgs = plain_history(20);
        assert_eq!(find_split_point(&msgs, 6, 10), Some(14));
    }

    #[test]
    fn short_history_is_not_split() {
        let msgs = plain_history(6);
        assert!(find_split_point(&msgs, 6, 10).is_none());
        assert!(find_split_point(&plain_history(3), 6, 10).is_none());
    }

    #[test]
    fn split_never_returns_zero() {
        let msgs = plain_history(7);
        // start = 1; idx 1 is fine, idx 0 excluded.
        assert_eq!(find_split_point(&msgs, 6, 10), Some(1));
    }

    #[test]
    fn split_walks_back_over_orphan_results() {
        // Index:      0..13 plain, 14 = tool_use, 15 = tool_result, 16..19 plain
        let mut msgs = plain_history(14);
        msgs.push(tool_use_msg("t-1")); // 14
        msgs.push(tool_result_msg("t-1")); // 15
        msgs.extend(plain_history(4)); // 16..19
        // len = 20, keep = 5 → start = 15.  A split at 15 orphans t-1's
        // result; walking back one step to 14 keeps the pair together.
        let split = find_split_point(&msgs, 5, 10).unwrap();
        assert_eq!(split, 14);
        assert!(suffix_tool_consistent(&msgs[split..]));
    }

    #[test]
    fn lookback_budget_bounds_the_walk() {
        // A long chain of result-only turns directly before the keep window
        // whose tool uses sit far earlier than the lookback allows.
        let mut msgs = plain_history(4);
        msgs.push(tool_use_msg("far")); // idx 4
        for _ in 0..12 {
            msgs.push(tool_result_msg("far"));
        }
        // len = 17, keep = 6 → start = 11; every idx in [1, 11] that is > 4
        // orphans a result, and lookback 3 cannot reach 4.
        assert!(find_split_point(&msgs, 6, 3).is_none());
    }

    #[test]
    fn consistent_pair_inside_suffix_is_fine() {
        let mut msgs = plain_history(12);
        msgs.push(tool_use_msg("x")); // 12
        msgs.push(tool_result_msg("x")); // 13
        msgs.push(ChatMessage::assistant("done")); // 14
        // keep = 3 → start = 12; suffix [12..] holds the whole pair.
        assert_eq!(find_split_point(&msgs, 3, 10), Some(12));
    }

    #[test]
    fn suffix_consistency_helper() {
        assert!(suffix_tool_consistent(&[tool_use_msg("a"), tool_result_msg("a")]));
        assert!(!suffix_tool_consistent(&[tool_result_msg("ghost")]));
        assert!(suffix_tool_consistent(&plain_history(4)));
    }
}
