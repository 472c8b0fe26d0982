// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Request-log fan-out for live-tail consumers.
//!
//! Each subscriber owns a bounded channel; a subscriber that cannot keep up
//! loses entries rather than ever blocking the request path.  Entries are
//! mirrored to `tracing` so ordinary log collection works without a
//! subscriber.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

/// Per-subscriber buffer depth.
const SUBSCRIBER_BUFFER: usize = 128;

#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    pub time: DateTime<Utc>,
    pub conversation_id: String,
    pub user: String,
    pub dialect: &'static str,
    pub model: String,
    pub account_id: Option<String>,
    /// `ok` or the terminal error code.
    pub outcome: String,
    pub duration_ms: u64,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Default)]
pub struct LogHub {
    subscribers: Mutex<Vec<mpsc::Sender<RequestLogEntry>>>,
}

impl LogHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<RequestLogEntry> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().expect("loghub lock poisoned").push(tx);
        rx
    }

    /// Deliver to every live subscriber; full channels drop the entry and
    /// closed channels are pruned.
    pub fn publish(&self, entry: RequestLogEntry) {
        info!(
            conversation_id = %entry.conversation_id,
            account_id = entry.account_id.as_deref().unwrap_or("-"),
            dialect = entry.dialect,
            model = %entry.model,
            outcome = %entry.outcome,
            duration_ms = entry.duration_ms,
            output_tokens = entry.output_tokens,
            "request finished"
        );
        let mut subscribers = self.subscribers.lock().expect("loghub lock poisoned");
        subscribers.retain(|tx| match tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("loghub lock poisoned").len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
