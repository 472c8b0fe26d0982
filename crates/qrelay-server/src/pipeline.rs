// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The request pipeline: force-model override, conversation-id resolution,
//! pre-dispatch compression, the account fail-over loop, and the streaming
//! bridge from the upstream event stream to the client dialect.
//!
//! Cancellation is structural: when the client disconnects, axum drops the
//! response stream, dropping the producer's channel and the in-flight
//! upstream body with it.  No retry runs after that point.  Success and
//! failure accounting rides on a drop guard so both completion and
//! disconnect record the request.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use qrelay_account::Account;
use qrelay_compress::{estimate_request_tokens, Summarizer};
use qrelay_eventstream::FrameDecoder;
use qrelay_protocol::{
    build_conversation, claude_response_json, map_model_id, openai_response_json,
    parse_upstream_event, ChatMessage, ChatRequest, ClaudeSse, EventCollector, OpenAiSse, QEvent,
};
use qrelay_upstream::{DispatchError, QuotaSnapshot, UpstreamClient};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::loghub::RequestLogEntry;
use crate::ready::{ensure_ready, status_for_code};
use crate::state::Gateway;

/// Accounts tried per client request before giving up.
const MAX_ACCOUNTS: usize = 3;
/// Bounded buffer between the upstream producer task and the serving task.
const EVENT_CHANNEL_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Claude,
    OpenAi,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::OpenAi => "openai",
        }
    }
}

/// Raw upstream body chunks, abstracted so tests can script them.
pub type EventByteStream = Pin<Box<dyn Stream<Item = anyhow::Result<Vec<u8>>> + Send>>;

/// The upstream seam consumed by the pipeline and the readiness gate.
#[async_trait]
pub trait ChatDispatch: Send + Sync {
    async fn send_chat(
        &self,
        account_id: &str,
        access_token: &str,
        machine_id: &str,
        payload: Vec<u8>,
    ) -> Result<EventByteStream, DispatchError>;

    async fn fetch_quota(
        &self,
        account_id: &str,
        access_token: &str,
        machine_id: &str,
    ) -> Result<QuotaSnapshot, DispatchError>;
}

#[async_trait]
impl ChatDispatch for UpstreamClient {
    async fn send_chat(
        &self,
        account_id: &str,
        access_token: &str,
        machine_id: &str,
        payload: Vec<u8>,
    ) -> Result<EventByteStream, DispatchError> {
        let response = UpstreamClient::send_chat(self, account_id, access_token, machine_id, payload)
            .await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(anyhow::Error::from));
        Ok(Box::pin(stream))
    }

    async fn fetch_quota(
        &self,
        account_id: &str,
        access_token: &str,
        machine_id: &str,
    ) -> Result<QuotaSnapshot, DispatchError> {
        UpstreamClient::fetch_quota(self, account_id, access_token, machine_id).await
    }
}

/// What the route layer turns into an HTTP response.
pub enum ChatReply {
    Json {
        body: serde_json::Value,
        conversation_id: String,
    },
    Sse {
        lines: Pin<Box<dyn Stream<Item = String> + Send>>,
        conversation_id: String,
    },
}

impl std::fmt::Debug for ChatReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatReply::Json { body, conversation_id } => f
                .debug_struct("Json")
                .field("body", body)
                .field("conversation_id", conversation_id)
                .finish(),
            ChatReply::Sse { conversation_id, .. } => f
                .debug_struct("Sse")
                .field("conversation_id", conversation_id)
                .finish(),
        }
    }
}

// ─── Entry point ──────────────────────────────────────────────────────────────

pub async fn handle_chat(
    gw: Arc<Gateway>,
    mut request: ChatRequest,
    dialect: Dialect,
    user: String,
    header_conversation_id: Option<String>,
) -> Result<ChatReply, GatewayError> {
    let start = Instant::now();
    let settings = gw.store.settings().await.unwrap_or_default();

    // Force-model override; haiku-class requests are exempt so the cheap
    // tier stays cheap.
    if let Some(force) = &settings.force_model {
        if !request.model.contains("haiku") {
            request.model = force.clone();
        }
    }

    let conversation_id = request
        .conversation_id
        .clone()
        .or(header_conversation_id)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let model_id = map_model_id(&request.model).to_string();

    // Compression runs before account selection so the post-compress
    // payload is the one dispatched.
    let summarizer = SelfSummarizer { gw: gw.clone() };
    let outcome = gw
        .compressor
        .compress(request, &summarizer, &settings.compression_model)
        .await
        .map_err(GatewayError::Internal)?;
    let request = outcome.request;
    let input_tokens = outcome.estimated_tokens.min(u32::MAX as usize) as u32;

    let payload = translate(&request, &conversation_id, &model_id)?;
    let (account, byte_stream) = acquire_and_send(&gw, payload).await?;

    let entry = RequestLogEntry {
        time: Utc::now(),
        conversation_id: conversation_id.clone(),
        user,
        dialect: dialect.as_str(),
        model: model_id.clone(),
        account_id: Some(account.id.clone()),
        outcome: "ok".into(),
        duration_ms: 0,
        input_tokens,
        output_tokens: 0,
    };
    let guard = CompletionGuard {
        gw: gw.clone(),
        account_id: account.id.clone(),
        max_error_count: settings.max_error_count,
        entry,
        start,
        output_tokens: AtomicU32::new(0),
        failed: AtomicBool::new(false),
    };

    if request.stream {
        Ok(stream_reply(
            byte_stream,
            dialect,
            model_id,
            conversation_id,
            input_tokens,
            guard,
        ))
    } else {
        buffered_reply(
            byte_stream,
            dialect,
            &model_id,
            conversation_id,
            input_tokens,
            guard,
        )
        .await
    }
}

fn translate(
    request: &ChatRequest,
    conversation_id: &str,
    model_id: &str,
) -> Result<Vec<u8>, GatewayError> {
    let wire = build_conversation(request, conversation_id, model_id)
        .map_err(GatewayError::from_translate)?;
    serde_json::to_vec(&wire).map_err(|e| GatewayError::Internal(e.into()))
}

// ─── Account loop ─────────────────────────────────────────────────────────────

/// Walk up to [`MAX_ACCOUNTS`] eligible accounts: readiness, dispatch,
/// classified fail-over.  Request errors abort immediately; account errors
/// mark the account and rotate.
async fn acquire_and_send(
    gw: &Arc<Gateway>,
    payload: Vec<u8>,
) -> Result<(Account, EventByteStream), GatewayError> {
    let settings = gw.store.settings().await.unwrap_or_default();
    let mut tried: Vec<String> = Vec::new();
    let mut last_code: Option<String> = None;

    while tried.len() < MAX_ACCOUNTS {
        let Some(candidate) = gw.pool.get_excluding(&tried, settings.selection).await else {
            break;
        };

        let account = match ensure_ready(gw, candidate.clone()).await {
            Ok(a) => a,
            Err(e) => {
                debug!(account_id = %candidate.id, error = %e, "account not ready, rotating");
                tried.push(candidate.id);
                last_code.get_or_insert_with(|| "ACCOUNT_NOT_READY".into());
                continue;
            }
        };

        match gw
            .dispatch
            .send_chat(
                &account.id,
                &account.access_token,
                &account.machine_id,
                payload.clone(),
            )
            .await
        {
            Ok(stream) => return Ok((account, stream)),
            Err(DispatchError::Request(c)) => {
                // Terminal for the whole request: no rotation, no stats.
                return Err(GatewayError::from_request_classified(&c));
            }
            Err(DispatchError::Account(c)) => {
                warn!(account_id = %account.id, code = c.code, "account error, rotating");
                if let Some(status) = status_for_code(c.code) {
                    let _ = gw.store.update_status(&account.id, status, c.code).await;
                    gw.pool.invalidate();
                }
                let _ = gw
                    .store
                    .update_stats(&account.id, 0, false, settings.max_error_count)
                    .await;
                last_code = Some(c.code.to_string());
                tried.push(account.id);
            }
            Err(DispatchError::Network(e)) => {
                warn!(account_id = %account.id, error = %e, "network exhaustion, rotating");
                let _ = gw
                    .store
                    .update_stats(&account.id, 0, false, settings.max_error_count)
                    .await;
                last_code = Some("NETWORK_ERROR".to_string());
                tried.push(account.id);
            }
        }
    }

    match last_code {
        None => Err(GatewayError::NoAccount),
        Some(code) => Err(GatewayError::Upstream {
            code,
            message: "所有可用账号均请求失败".to_string(),
        }),
    }
}

// ─── Streaming bridge ─────────────────────────────────────────────────────────

/// Decode upstream bytes on a dedicated producer task feeding a bounded
/// channel; errors surface on a separate channel so the serving side can
/// distinguish "done" from "died".
fn spawn_producer(
    mut bytes: EventByteStream,
) -> (mpsc::Receiver<QEvent>, mpsc::Receiver<String>) {
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (error_tx, error_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = error_tx.try_send(format!("{e:#}"));
                    return;
                }
            };
            let frames = match decoder.feed(&chunk) {
                Ok(f) => f,
                Err(e) => {
                    let _ = error_tx.try_send(e.to_string());
                    return;
                }
            };
            for frame in frames {
                if let Some(event) = parse_upstream_event(&frame) {
                    if event_tx.send(event).await.is_err() {
                        // Consumer (client) is gone; stop reading upstream.
                        return;
                    }
                }
            }
        }
    });

    (event_rx, error_rx)
}

enum Emitter {
    Claude(ClaudeSse),
    OpenAi(OpenAiSse),
}

impl Emitter {
    fn new(dialect: Dialect, model: &str, input_tokens: u32) -> Self {
        match dialect {
            Dialect::Claude => Self::Claude(ClaudeSse::new(model, input_tokens)),
            Dialect::OpenAi => Self::OpenAi(OpenAiSse::new(model)),
        }
    }

    fn on_event(&mut self, ev: &QEvent) -> Vec<qrelay_protocol::SseMessage> {
        match self {
            Self::Claude(s) => s.on_event(ev),
            Self::OpenAi(s) => s.on_event(ev),
        }
    }

    fn finish(&mut self) -> Vec<qrelay_protocol::SseMessage> {
        match self {
            Self::Claude(s) => s.finish(),
            Self::OpenAi(s) => s.finish(),
        }
    }

    fn output_tokens(&self) -> u32 {
        match self {
            Self::Claude(s) => s.output_tokens(),
            Self::OpenAi(s) => s.output_tokens(),
        }
    }
}

fn stream_reply(
    bytes: EventByteStream,
    dialect: Dialect,
    model_id: String,
    conversation_id: String,
    input_tokens: u32,
    guard: CompletionGuard,
) -> ChatReply {
    let (mut events, mut errors) = spawn_producer(bytes);

    let lines = async_stream::stream! {
        let guard = guard;
        let mut emitter = Emitter::new(dialect, &model_id, input_tokens);
        while let Some(event) = events.recv().await {
            for message in emitter.on_event(&event) {
                yield message.render();
            }
        }
        if let Ok(error) = errors.try_recv() {
            warn!(error = %error, "upstream stream terminated abnormally");
            guard.failed.store(true, Ordering::Relaxed);
        }
        // Well-formed terminator regardless of how the upstream ended.
        for message in emitter.finish() {
            yield message.render();
        }
        guard
            .output_tokens
            .store(emitter.output_tokens(), Ordering::Relaxed);
    };

    ChatReply::Sse {
        lines: Box::pin(lines),
        conversation_id,
    }
}

async fn buffered_reply(
    bytes: EventByteStream,
    dialect: Dialect,
    model_id: &str,
    conversation_id: String,
    input_tokens: u32,
    guard: CompletionGuard,
) -> Result<ChatReply, GatewayError> {
    let collected = collect_events(bytes, &guard).await?;
    guard
        .output_tokens
        .store(collected.output_tokens, Ordering::Relaxed);

    let body = match dialect {
        Dialect::Claude => claude_response_json(&collected, model_id, input_tokens),
        Dialect::OpenAi => openai_response_json(&collected, model_id, input_tokens),
    };
    Ok(ChatReply::Json {
        body,
        conversation_id,
    })
}

async fn collect_events(
    bytes: EventByteStream,
    guard: &CompletionGuard,
) -> Result<qrelay_protocol::CollectedResponse, GatewayError> {
    let (mut events, mut errors) = spawn_producer(bytes);
    let mut collector = EventCollector::new();
    while let Some(event) = events.recv().await {
        collector.on_event(&event);
    }
    if let Ok(error) = errors.try_recv() {
        guard.failed.store(true, Ordering::Relaxed);
        return Err(GatewayError::Upstream {
            code: "STREAM_ERROR".to_string(),
            message: format!("上游流式响应中断: {error}"),
        });
    }
    Ok(collector.finish())
}

// ─── Completion accounting ────────────────────────────────────────────────────

/// Records the request outcome when the response (stream) is dropped —
/// which covers both normal completion and client disconnect.
struct CompletionGuard {
    gw: Arc<Gateway>,
    account_id: String,
    max_error_count: u32,
    entry: RequestLogEntry,
    start: Instant,
    output_tokens: AtomicU32,
    failed: AtomicBool,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let gw = self.gw.clone();
        let account_id = self.account_id.clone();
        let max_error_count = self.max_error_count;
        let failed = self.failed.load(Ordering::Relaxed);
        let mut entry = self.entry.clone();
        entry.duration_ms = self.start.elapsed().as_millis() as u64;
        entry.output_tokens = self.output_tokens.load(Ordering::Relaxed);
        if failed {
            entry.outcome = "STREAM_ERROR".to_string();
        }

        tokio::spawn(async move {
            let result = if failed {
                gw.store
                    .update_stats(&account_id, 0, false, max_error_count)
                    .await
            } else {
                gw.store
                    .update_stats(&account_id, 1, true, max_error_count)
                    .await
            };
            if let Err(e) = result {
                warn!(account_id = %account_id, error = %e, "recording request stats failed");
            }
            gw.log_hub.publish(entry);
        });
    }
}

// ─── Compression self-call ────────────────────────────────────────────────────

/// Summarizes by re-entering the gateway's own dispatch loop with a fresh
/// single-turn request.  Compression is structurally absent here — the
/// request goes straight to the account loop — so a long summary prompt can
/// never recurse.
struct SelfSummarizer {
    gw: Arc<Gateway>,
}

#[async_trait]
impl Summarizer for SelfSummarizer {
    async fn summarize(&self, prompt: &str, model: &str) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::user(prompt)],
            ..Default::default()
        };
        let conversation_id = uuid::Uuid::new_v4().to_string();
        let model_id = map_model_id(&request.model).to_string();
        let payload = translate(&request, &conversation_id, &model_id)
            .map_err(|e| anyhow::anyhow!("summary translate: {e}"))?;
        let (account, bytes) = acquire_and_send(&self.gw, payload)
            .await
            .map_err(|e| anyhow::anyhow!("summary dispatch: {e}"))?;

        let settings = self.gw.store.settings().await.unwrap_or_default();
        let guard = CompletionGuard {
            gw: self.gw.clone(),
            account_id: account.id.clone(),
            max_error_count: settings.max_error_count,
            entry: RequestLogEntry {
                time: Utc::now(),
                conversation_id,
                user: "system".into(),
                dialect: "summary",
                model: model_id,
                account_id: Some(account.id),
                outcome: "ok".into(),
                duration_ms: 0,
                input_tokens: estimate_request_tokens(&request) as u32,
                output_tokens: 0,
            },
            start: Instant::now(),
            output_tokens: AtomicU32::new(0),
            failed: AtomicBool::new(false),
        };

        let collected = collect_events(bytes, &guard)
            .await
            .map_err(|e| anyhow::anyhow!("summary stream: {e}"))?;
        guard
            .output_tokens
            .store(collected.output_tokens, Ordering::Relaxed);
        Ok(collected.text)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_names() {
        assert_eq!(Dialect::Claude.as_str(), "claude");
        assert_eq!(Dialect::OpenAi.as_str(), "openai");
    }

    #[tokio::test]
    async fn producer_decodes_framed_events() {
        let mut buf = qrelay_eventstream::encode_event(
            "assistantResponseEvent",
            &serde_json::json!({ "content": "hi" }),
        );
        buf.extend_from_slice(&qrelay_eventstream::encode_event(
            "assistantResponseEvent",
            &serde_json::json!({ "content": "!" }),
        ));
        let stream: EventByteStream =
            Box::pin(futures::stream::iter(vec![Ok(buf)]));
        let (mut events, mut errors) = spawn_producer(stream);

        let mut texts = Vec::new();
        while let Some(ev) = events.recv().await {
            if let QEvent::Text { content } = ev {
                texts.push(content);
            }
        }
        assert_eq!(texts, vec!["hi", "!"]);
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn producer_surfaces_transport_error() {
        let stream: EventByteStream = Box::pin(futures::stream::iter(vec![
            Err(anyhow::anyhow!("connection reset by peer")),
        ]));
        let (mut events, mut errors) = spawn_producer(stream);
        assert!(events.recv().await.is_none());
        let err = errors.recv().await.unwrap();
        assert!(err.contains("connection reset"));
    }

    #[tokio::test]
    async fn producer_handles_byte_split_chunks() {
        let frame = qrelay_eventstream::encode_event(
            "assistantResponseEvent",
            &serde_json::json!({ "content": "split" }),
        );
        let chunks: Vec<anyhow::Result<Vec<u8>>> =
            frame.iter().map(|b| Ok(vec![*b])).collect();
        let stream: EventByteStream = Box::pin(futures::stream::iter(chunks));
        let (mut events, _errors) = spawn_producer(stream);
        let ev = events.recv().await.unwrap();
        assert_eq!(ev, QEvent::Text { content: "split".into() });
        assert!(events.recv().await.is_none());
    }
}
