// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context compression for long conversations.
//!
//! When a request's estimated input size crosses the configured thresholds,
//! the history prefix is summarized (via a caller-supplied self-call) and
//! replaced by one compact exchange, keyed in a prefix-hash cache so
//! follow-up turns of the same conversation reuse earlier summaries instead
//! of re-summarizing.

mod cache;
mod compressor;
mod estimate;
mod prompt;
mod split;

pub use cache::{CacheEntry, SummaryBlock, SummaryCache};
pub use compressor::{CompressOutcome, Compressor, Summarizer};
pub use estimate::{estimate_message_tokens, estimate_request_tokens};
pub use prompt::{batch_prompt, serialize_messages, split_batches, summary_prompt};
pub use split::find_split_point;
