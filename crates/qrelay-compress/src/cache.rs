// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Prefix-hash summary cache.
//!
//! Entries are keyed by the SHA-256 of the normalized message prefix they
//! summarize.  A secondary index groups entries by how many messages they
//! cover, descending, so a follow-up request can find the longest cached
//! prefix of its own history in O(#group) hash probes.  One RW lock covers
//! both structures; disk persistence happens under the lock but is
//! best-effort (a dead disk degrades to in-memory caching).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One contiguous run of summarized messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryBlock {
    pub block_id: String,
    pub msg_start_idx: usize,
    pub msg_end_idx: usize,
    /// Hash of the exact messages this block replaced.
    pub msg_hash: String,
    pub summary_text: String,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Cached summary state for one conversation prefix.
///
/// Invariant: blocks are contiguous, non-overlapping, and cover
/// `[0, total_compressed_msg)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub prefix_hash: String,
    pub blocks: Vec<SummaryBlock>,
    pub total_compressed_msg: usize,
    pub total_tokens: usize,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Joined summary text of all blocks, oldest first.
    pub fn joined_summary(&self) -> String {
        self.blocks
            .iter()
            .map(|b| b.summary_text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Default)]
struct CacheInner {
    primary: HashMap<String, CacheEntry>,
    /// `total_compressed_msg → prefix hashes`, iterated in reverse for
    /// longest-prefix-first lookup.
    by_total: BTreeMap<usize, Vec<String>>,
}

pub struct SummaryCache {
    inner: RwLock<CacheInner>,
    ttl: Duration,
    disk_path: Option<PathBuf>,
}

impl SummaryCache {
    /// `data_dir = None` keeps the cache purely in memory.
    pub fn new(ttl_hours: u64, data_dir: Option<PathBuf>) -> Self {
        let disk_path = data_dir.map(|d| d.join("summary_cache.json"));
        let cache = Self {
            inner: RwLock::new(CacheInner::default()),
            ttl: Duration::hours(ttl_hours.max(1) as i64),
            disk_path,
        };
        cache.load_from_disk();
        cache
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("cache lock poisoned").primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry for an exact prefix hash, if present and unexpired.
    pub fn get(&self, prefix_hash: &str) -> Option<CacheEntry> {
        let now = Utc::now();
        let inner = self.inner.read().expect("cache lock poisoned");
        inner
            .primary
            .get(prefix_hash)
            .filter(|e| now - e.updated_at < self.ttl)
            .cloned()
    }

    /// Coverage sizes with live entries, descending, capped at `max`.
    pub fn candidate_totals(&self, max: usize) -> Vec<usize> {
        let inner = self.inner.read().expect("cache lock poisoned");
        inner
            .by_total
            .range(..=max)
            .rev()
            .map(|(total, _)| *total)
            .collect()
    }

    /// Insert an entry, evicting every existing entry whose block set is a
    /// strict subset of the new one (they can never be a better match
    /// again).
    pub fn save(&self, entry: CacheEntry) {
        let mut inner = self.inner.write().expect("cache lock poisoned");

        let new_ids: Vec<&str> = entry.blocks.iter().map(|b| b.block_id.as_str()).collect();
        let subsumed: Vec<String> = inner
            .primary
            .values()
            .filter(|existing| {
                existing.prefix_hash != entry.prefix_hash
                    && existing.blocks.len() < entry.blocks.len()
                    && existing
                        .blocks
                        .iter()
                        .all(|b| new_ids.contains(&b.block_id.as_str()))
            })
            .map(|e| e.prefix_hash.clone())
            .collect();
        for hash in subsumed {
            debug!(prefix = %hash, "evicting subsumed summary entry");
            remove_entry(&mut inner, &hash);
        }

        remove_entry(&mut inner, &entry.prefix_hash);
        inner
            .by_total
            .entry(entry.total_compressed_msg)
            .or_default()
            .push(entry.prefix_hash.clone());
        inner.primary.insert(entry.prefix_hash.clone(), entry);

        self.persist(&inner);
    }

    /// Drop entries past their TTL.
    pub fn purge_expired(&self) {
        let now = Utc::now();
        let mut inner = self.inner.write().expect("cache lock poisoned");
        let expired: Vec<String> = inner
            .primary
            .values()
            .filter(|e| now - e.updated_at >= self.ttl)
            .map(|e| e.prefix_hash.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for hash in expired {
            remove_entry(&mut inner, &hash);
        }
        self.persist(&inner);
    }

    fn load_from_disk(&self) {
        let Some(path) = &self.disk_path else { return };
        if !path.is_file() {
            return;
        }
        let entries: Vec<CacheEntry> = match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|t| serde_json::from_str(&t).map_err(|e| e.to_string()))
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "summary cache load failed, starting empty");
                return;
            }
        };
        let mut inner = self.inner.write().expect("cache lock poisoned");
        for entry in entries {
            inner
                .by_total
                .entry(entry.total_compressed_msg)
                .or_default()
                .push(entry.prefix_hash.clone());
            inner.primary.insert(entry.prefix_hash.clone(), entry);
        }
    }

    fn persist(&self, inner: &CacheInner) {
        let Some(path) = &self.disk_path else { return };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let entries: Vec<&CacheEntry> = inner.primary.values().collect();
        match serde_json::to_vec(&entries) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    warn!(path = %path.display(), error = %e, "summary cache persist failed");
                }
            }
            Err(e) => warn!(error = %e, "summary cache serialize failed"),
        }
    }
}

fn remove_entry(inner: &mut CacheInner, prefix_hash: &str) {
    if let Some(entry) = inner.primary.remove(prefix_hash) {
        if let Some(group) = inner.by_total.get_mut(&entry.total_compressed_msg) {
            group.retain(|h| h != prefix_hash);
            if group.is_empty() {
                inner.by_total.remove(&entry.total_compressed_msg);
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
