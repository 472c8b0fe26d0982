// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Scripted collaborator doubles for pipeline tests.
//!
//! Each call to a scripted double pops the next response from the front of
//! its queue, so tests specify exact fail-over sequences — including
//! classified upstream errors — without network access.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use qrelay_account::Account;
use qrelay_auth::TokenRefresh;
use qrelay_upstream::{DispatchError, QuotaSnapshot};
use serde_json::json;

use crate::pipeline::{ChatDispatch, EventByteStream};
use crate::ready::TokenFlows;

/// Build the framed byte chunks for a plain text answer.
pub fn text_answer_chunks(parts: &[&str]) -> Vec<Vec<u8>> {
    parts
        .iter()
        .map(|p| {
            qrelay_eventstream::encode_event(
                "assistantResponseEvent",
                &json!({ "content": p }),
            )
        })
        .collect()
}

/// Build the framed chunks for a streamed tool call.
pub fn tool_answer_chunks(id: &str, name: &str, input_fragments: &[&str]) -> Vec<Vec<u8>> {
    let last = input_fragments.len().saturating_sub(1);
    input_fragments
        .iter()
        .enumerate()
        .map(|(i, frag)| {
            qrelay_eventstream::encode_event(
                "toolUseEvent",
                &json!({
                    "toolUseId": id,
                    "name": name,
                    "input": frag,
                    "stop": i == last,
                }),
            )
        })
        .collect()
}

/// Scripted [`ChatDispatch`]: each `send_chat` pops the next script entry;
/// every call's account id is recorded for assertions.
pub struct ScriptedDispatch {
    chat_scripts: Mutex<Vec<Result<Vec<Vec<u8>>, DispatchError>>>,
    quota_scripts: Mutex<Vec<Result<QuotaSnapshot, DispatchError>>>,
    pub chat_calls: Mutex<Vec<String>>,
    /// Access token presented on each chat call, in call order.
    pub tokens_seen: Mutex<Vec<String>>,
    pub quota_calls: Mutex<Vec<String>>,
}

impl ScriptedDispatch {
    pub fn new(chat_scripts: Vec<Result<Vec<Vec<u8>>, DispatchError>>) -> Self {
        Self {
            chat_scripts: Mutex::new(chat_scripts),
            quota_scripts: Mutex::new(Vec::new()),
            chat_calls: Mutex::new(Vec::new()),
            tokens_seen: Mutex::new(Vec::new()),
            quota_calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue quota probe results; when empty, probes succeed with a roomy
    /// default quota.
    pub fn with_quota(self, scripts: Vec<Result<QuotaSnapshot, DispatchError>>) -> Self {
        *self.quota_scripts.lock().unwrap() = scripts;
        self
    }

    pub fn chat_call_count(&self) -> usize {
        self.chat_calls.lock().unwrap().len()
    }
}

fn default_quota() -> QuotaSnapshot {
    QuotaSnapshot {
        usage_current: 0,
        usage_limit: 1_000,
        subscription_type: Some("PRO".into()),
        token_expiry: None,
    }
}

#[async_trait]
impl ChatDispatch for ScriptedDispatch {
    async fn send_chat(
        &self,
        account_id: &str,
        access_token: &str,
        _machine_id: &str,
        _payload: Vec<u8>,
    ) -> Result<EventByteStream, DispatchError> {
        self.chat_calls.lock().unwrap().push(account_id.to_string());
        self.tokens_seen
            .lock()
            .unwrap()
            .push(access_token.to_string());
        let next = {
            let mut scripts = self.chat_scripts.lock().unwrap();
            if scripts.is_empty() {
                Ok(text_answer_chunks(&["[no more scripts]"]))
            } else {
                scripts.remove(0)
            }
        };
        let chunks = next?;
        let stream = futures::stream::iter(chunks.into_iter().map(Ok));
        Ok(Box::pin(stream))
    }

    async fn fetch_quota(
        &self,
        account_id: &str,
        _access_token: &str,
        _machine_id: &str,
    ) -> Result<QuotaSnapshot, DispatchError> {
        self.quota_calls.lock().unwrap().push(account_id.to_string());
        let mut scripts = self.quota_scripts.lock().unwrap();
        if scripts.is_empty() {
            Ok(default_quota())
        } else {
            scripts.remove(0)
        }
    }
}

/// [`TokenFlows`] double that always mints the same access token and counts
/// refresh calls.
pub struct StaticTokens {
    pub token: String,
    pub calls: AtomicUsize,
}

impl StaticTokens {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenFlows for StaticTokens {
    async fn refresh(&self, _account: &Account) -> anyhow::Result<TokenRefresh> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Hold the refresh open long enough that concurrent callers pile
        // onto the single-flight state instead of racing past it.
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        Ok(TokenRefresh {
            access_token: self.token.clone(),
            refresh_token: None,
            expires_in: Some(3600),
        })
    }
}

/// [`TokenFlows`] double that always fails.
pub struct FailingTokens;

#[async_trait]
impl TokenFlows for FailingTokens {
    async fn refresh(&self, _account: &Account) -> anyhow::Result<TokenRefresh> {
        anyhow::bail!("refresh token is revoked")
    }
}
