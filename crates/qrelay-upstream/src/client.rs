// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Amazon Q chat POST and quota probe with retry classification.
//!
//! Network faults and 5xx responses retry with linear backoff
//! (`500 ms × attempt`, three attempts).  4xx bodies go through the
//! classifier: request errors surface to the caller unretried, account
//! errors tell the pipeline to rotate credentials.  Cancellation is the
//! caller dropping the future — reqwest aborts the in-flight call, and no
//! retry runs afterwards.

use std::time::Duration;

use chrono::{DateTime, Utc};
use qrelay_auth::{chat_user_agent, user_agent};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::classify::{classify_or_unknown, Classified};
use crate::transport::TransportPool;

const MAX_RETRIES: u32 = 3;
const BACKOFF_STEP: Duration = Duration::from_millis(500);
const QUOTA_TIMEOUT: Duration = Duration::from_secs(60);

const CHAT_TARGET: &str = "AmazonCodeWhispererStreamingService.GenerateAssistantResponse";
const QUOTA_QUERY: &[(&str, &str)] = &[
    ("isEmailRequired", "true"),
    ("origin", "AI_EDITOR"),
    ("resourceType", "AGENTIC_REQUEST"),
];

/// Network error markers that warrant a retry (§ retry policy).
const RETRIABLE_MARKERS: &[&str] = &[
    "unexpected EOF",
    "EOF",
    "connection reset by peer",
    "broken pipe",
];

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The request itself was rejected: terminal, fail the client.
    #[error("{}", .0.message)]
    Request(Classified),
    /// The account is at fault: rotate to the next credential.
    #[error("{}", .0.message)]
    Account(Classified),
    /// Transport-level failure that survived all retries.
    #[error("上游网络错误: {0}")]
    Network(String),
}

impl DispatchError {
    pub fn classified(&self) -> Option<&Classified> {
        match self {
            Self::Request(c) | Self::Account(c) => Some(c),
            Self::Network(_) => None,
        }
    }

    pub fn is_request_error(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

/// Quota reading from `getUsageLimits`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaSnapshot {
    pub usage_current: u64,
    pub usage_limit: u64,
    pub subscription_type: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
}

pub struct UpstreamClient {
    transports: TransportPool,
    chat_endpoint: String,
    quota_endpoint: String,
}

impl UpstreamClient {
    pub fn new(
        transports: TransportPool,
        chat_endpoint: impl Into<String>,
        quota_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            transports,
            chat_endpoint: chat_endpoint.into(),
            quota_endpoint: quota_endpoint.into(),
        }
    }

    /// POST a serialized Amazon Q request and hand back the streaming
    /// response without reading its body.
    pub async fn send_chat(
        &self,
        account_id: &str,
        access_token: &str,
        machine_id: &str,
        payload: Vec<u8>,
    ) -> Result<reqwest::Response, DispatchError> {
        let client = self.transports.client_for(account_id);

        for attempt in 1..=MAX_RETRIES {
            let response = client
                .post(&self.chat_endpoint)
                .header("Content-Type", "application/x-amz-json-1.0")
                .header("X-Amz-Target", CHAT_TARGET)
                .header("Authorization", format!("Bearer {access_token}"))
                .header(reqwest::header::USER_AGENT, chat_user_agent(machine_id))
                .header("X-Amz-User-Agent", user_agent(machine_id))
                .header("Amz-Sdk-Request", format!("attempt={attempt}; max={MAX_RETRIES}"))
                .header("Amz-Sdk-Invocation-Id", uuid::Uuid::new_v4().to_string())
                .header("X-Amzn-Codewhisperer-Optout", "false")
                .body(payload.clone())
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    let detail = format!("{e:#}");
                    if is_retriable_network(&e, &detail) && attempt < MAX_RETRIES {
                        debug!(attempt, error = %detail, "retriable network fault");
                        tokio::time::sleep(BACKOFF_STEP * attempt).await;
                        continue;
                    }
                    return Err(DispatchError::Network(detail));
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                if attempt < MAX_RETRIES {
                    warn!(attempt, %status, "upstream 5xx, backing off");
                    tokio::time::sleep(BACKOFF_STEP * attempt).await;
                    continue;
                }
                return Err(DispatchError::Account(classify_or_unknown(&body)));
            }

            // 4xx: classify, never retried at the network level.
            let classified = classify_or_unknown(&body);
            debug!(code = classified.code, %status, "upstream rejected request");
            return Err(if classified.is_request_error() {
                DispatchError::Request(classified)
            } else {
                DispatchError::Account(classified)
            });
        }
        unreachable!("retry loop always returns")
    }

    /// GET the account's usage limits.
    pub async fn fetch_quota(
        &self,
        account_id: &str,
        access_token: &str,
        machine_id: &str,
    ) -> Result<QuotaSnapshot, DispatchError> {
        let client = self.transports.client_for(account_id);
        let response = client
            .get(&self.quota_endpoint)
            .query(QUOTA_QUERY)
            .header("Authorization", format!("Bearer {access_token}"))
            .header(reqwest::header::USER_AGENT, user_agent(machine_id))
            .timeout(QUOTA_TIMEOUT)
            .send()
            .await
            .map_err(|e| DispatchError::Network(format!("{e:#}")))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let classified = classify_or_unknown(&body);
            return Err(if classified.is_request_error() {
                DispatchError::Request(classified)
            } else {
                DispatchError::Account(classified)
            });
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| DispatchError::Network(format!("quota response parse: {e}")))?;
        Ok(parse_quota_response(&value))
    }
}

fn is_retriable_network(err: &reqwest::Error, detail: &str) -> bool {
    err.is_connect()
        || err.is_timeout()
        || RETRIABLE_MARKERS.iter().any(|m| detail.contains(m))
}

/// Tolerant reader for the `getUsageLimits` shape: prefers the
/// `AGENTIC_REQUEST` entry of `usageLimits`, falls back to top-level
/// fields.
fn parse_quota_response(value: &Value) -> QuotaSnapshot {
    let entry = value["usageLimits"]
        .as_array()
        .and_then(|limits| {
            limits
                .iter()
                .find(|l| l["resourceType"].as_str() == Some("AGENTIC_REQUEST"))
                .or_else(|| limits.first())
        })
        .unwrap_or(value);

    let usage_current = entry["currentUsage"]
        .as_u64()
        .or_else(|| entry["usageCurrent"].as_u64())
        .unwrap_or(0);
    let usage_limit = entry["maxLimit"]
        .as_u64()
        .or_else(|| entry["usageLimit"].as_u64())
        .unwrap_or(0);
    let subscription_type = value["subscriptionType"]
        .as_str()
        .or_else(|| value["subscription"]["type"].as_str())
        .map(str::to_string);
    let token_expiry = value["tokenExpiry"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    QuotaSnapshot {
        usage_current,
        usage_limit,
        subscription_type,
        token_expiry,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
