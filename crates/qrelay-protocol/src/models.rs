// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Claude model-name mapping.
//!
//! Clients send either the canonical dated Anthropic id
//! (`claude-sonnet-4-5-20250929`) or the short form (`claude-sonnet-4.5`).
//! The upstream only understands the short ids, so everything funnels
//! through this table; names not listed fall back to the default.

/// Short id sent upstream when the requested model is unknown.
pub const DEFAULT_MODEL_ID: &str = "claude-sonnet-4.5";

/// `(canonical dated id, Q short id)` pairs.  Short ids map to themselves.
const MODEL_TABLE: &[(&str, &str)] = &[
    ("claude-sonnet-4-5-20250929", "claude-sonnet-4.5"),
    ("claude-sonnet-4-20250514", "claude-sonnet-4"),
    ("claude-opus-4-1-20250805", "claude-opus-4.1"),
    ("claude-opus-4-20250514", "claude-opus-4"),
    ("claude-3-7-sonnet-20250219", "claude-3.7-sonnet"),
    ("claude-3-5-haiku-20241022", "claude-3.5-haiku"),
];

/// All short ids the gateway advertises, in table order.
pub fn known_short_ids() -> Vec<&'static str> {
    MODEL_TABLE.iter().map(|(_, short)| *short).collect()
}

/// Map a client-supplied model name onto the upstream short id.
pub fn map_model_id(requested: &str) -> &'static str {
    for (canonical, short) in MODEL_TABLE {
        if requested == *canonical || requested == *short {
            return short;
        }
    }
    DEFAULT_MODEL_ID
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
