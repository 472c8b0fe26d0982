// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Compression orchestration: trigger, split, cache reuse, summary
//! injection.
//!
//! Summarization is delegated to a caller-supplied [`Summarizer`] — the
//! server re-enters itself through a fresh account.  That self-call must be
//! dispatched with compression disabled, otherwise a long summary prompt
//! would recurse into another compression.

use async_trait::async_trait;
use chrono::Utc;
use qrelay_config::CompressionConfig;
use qrelay_protocol::{ChatMessage, ChatRequest};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::cache::{CacheEntry, SummaryBlock, SummaryCache};
use crate::estimate::estimate_request_tokens;
use crate::prompt::{batch_prompt, serialize_messages, split_batches, summary_prompt};
use crate::split::find_split_point;

/// Produces a summary for a serialized history prompt.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str, model: &str) -> anyhow::Result<String>;
}

#[derive(Debug)]
pub struct CompressOutcome {
    pub request: ChatRequest,
    pub compressed: bool,
    /// Pre-compression input estimate (also serves `count_tokens`).
    pub estimated_tokens: usize,
}

pub struct Compressor {
    config: CompressionConfig,
    cache: SummaryCache,
}

impl Compressor {
    pub fn new(config: CompressionConfig, data_dir: Option<std::path::PathBuf>) -> Self {
        let cache = SummaryCache::new(config.cache_ttl_hours, data_dir);
        Self { config, cache }
    }

    pub fn cache(&self) -> &SummaryCache {
        &self.cache
    }

    /// Either threshold trips the compressor.
    pub fn should_compress(&self, request: &ChatRequest, estimated_tokens: usize) -> bool {
        self.config.enabled
            && (estimated_tokens > self.config.token_threshold
                || request.messages.len() > self.config.message_threshold)
    }

    /// Collapse the history prefix when thresholds are exceeded; otherwise
    /// the request passes through untouched.
    pub async fn compress(
        &self,
        request: ChatRequest,
        summarizer: &dyn Summarizer,
        model: &str,
    ) -> anyhow::Result<CompressOutcome> {
        let estimated_tokens = estimate_request_tokens(&request);
        if !self.should_compress(&request, estimated_tokens) {
            return Ok(CompressOutcome {
                request,
                compressed: false,
                estimated_tokens,
            });
        }

        let Some(split_idx) = find_split_point(
            &request.messages,
            self.config.keep_messages,
            self.config.max_tool_lookback,
        ) else {
            debug!("no tool-consistent split point, skipping compression");
            return Ok(CompressOutcome {
                request,
                compressed: false,
                estimated_tokens,
            });
        };

        let prefix_hash = hash_messages(&request.messages[..split_idx]);

        // Longest cached prefix of this conversation, if any.
        let (mut blocks, covered) = match self.cache.get(&prefix_hash) {
            Some(entry) => (entry.blocks, split_idx),
            None => self.best_partial_match(&request.messages, split_idx),
        };

        if covered < split_idx {
            let tail = &request.messages[covered..split_idx];
            let summary = self.summarize_range(tail, summarizer, model).await?;
            let token_count = summary.chars().count().div_ceil(4);
            blocks.push(SummaryBlock {
                block_id: format!("blk-{}", &hash_messages(tail)[..12]),
                msg_start_idx: covered,
                msg_end_idx: split_idx,
                msg_hash: hash_messages(tail),
                summary_text: summary,
                token_count,
                created_at: Utc::now(),
            });
        }

        let total_tokens = blocks.iter().map(|b| b.token_count).sum();
        let entry = CacheEntry {
            prefix_hash,
            blocks,
            total_compressed_msg: split_idx,
            total_tokens,
            updated_at: Utc::now(),
        };
        self.cache.save(entry.clone());

        info!(
            split_idx,
            blocks = entry.blocks.len(),
            estimated_tokens,
            "history prefix compressed"
        );

        let mut messages = Vec::with_capacity(request.messages.len() - split_idx + 2);
        messages.push(ChatMessage::user(format!(
            "[对话摘要]\n\n{}",
            entry.joined_summary()
        )));
        messages.push(ChatMessage::assistant("OK"));
        messages.extend_from_slice(&request.messages[split_idx..]);

        Ok(CompressOutcome {
            request: ChatRequest { messages, ..request },
            compressed: true,
            estimated_tokens,
        })
    }

    /// Probe cached coverage sizes, longest first, for a prefix of ours.
    fn best_partial_match(
        &self,
        messages: &[ChatMessage],
        split_idx: usize,
    ) -> (Vec<SummaryBlock>, usize) {
        for total in self.cache.candidate_totals(split_idx) {
            let hash = hash_messages(&messages[..total]);
            if let Some(entry) = self.cache.get(&hash) {
                debug!(covered = total, "reusing cached summary prefix");
                return (entry.blocks, total);
            }
        }
        (Vec::new(), 0)
    }

    async fn summarize_range(
        &self,
        messages: &[ChatMessage],
        summarizer: &dyn Summarizer,
        model: &str,
    ) -> anyhow::Result<String> {
        let text = serialize_messages(messages);
        // Tokens-to-characters allowance for the generated summary.
        let target_chars = self.config.max_single_summary_tokens * 3 / 2;
        let batches = split_batches(&text, self.config.max_batch_chars);

        if batches.len() == 1 {
            return summarizer
                .summarize(&summary_prompt(&batches[0], target_chars), model)
                .await;
        }

        let total = batches.len();
        let per_batch_target = (target_chars / total).max(500);
        let mut parts = Vec::with_capacity(total);
        for (i, batch) in batches.iter().enumerate() {
            let part = summarizer
                .summarize(&batch_prompt(batch, i, total, per_batch_target), model)
                .await?;
            parts.push(part);
        }
        Ok(parts.join("\n\n"))
    }
}

/// SHA-256 over the canonical serialization of a message slice.
fn hash_messages(messages: &[ChatMessage]) -> String {
    let mut hasher = Sha256::new();
    for m in messages {
        let line = serde_json::to_string(m).expect("message always serializes");
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
