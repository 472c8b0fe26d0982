// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use anyhow::{bail, Context};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::machine::user_agent;

/// Hard floor on the device-authorization poll interval.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound on poll attempts regardless of the provider deadline.
const MAX_POLLS: u32 = 120;

/// Result of a successful token refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRefresh {
    pub access_token: String,
    /// New refresh token, when the provider rotated it.  `None` keeps the
    /// old one.
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// Device-authorization grant handles returned by the start call.
#[derive(Debug, Clone)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub interval_secs: u64,
    pub expires_in_secs: u64,
}

/// Client for both upstream token flavors.
pub struct TokenClient {
    http: reqwest::Client,
    oidc_endpoint: String,
    social_endpoint: String,
}

impl TokenClient {
    pub fn new(oidc_endpoint: impl Into<String>, social_endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("reqwest client construction cannot fail with static options"),
            oidc_endpoint: oidc_endpoint.into(),
            social_endpoint: social_endpoint.into(),
        }
    }

    /// IdC flavor: refresh-token grant with client credentials.
    pub async fn refresh_idc(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
        machine_id: &str,
    ) -> anyhow::Result<TokenRefresh> {
        debug!("refreshing IdC access token");
        let resp = self
            .http
            .post(&self.oidc_endpoint)
            .header(reqwest::header::USER_AGENT, user_agent(machine_id))
            .json(&json!({
                "grantType": "refresh_token",
                "clientId": client_id,
                "clientSecret": client_secret,
                "refreshToken": refresh_token,
            }))
            .send()
            .await
            .context("IdC token request failed")?;

        let status = resp.status();
        let body: Value = resp.json().await.context("IdC token response parse failed")?;
        if !status.is_success() {
            bail!("IdC token refresh failed ({status}): {body}");
        }
        parse_token_response(&body)
    }

    /// Social flavor: bare refresh token, no client credentials.
    pub async fn refresh_social(
        &self,
        refresh_token: &str,
        machine_id: &str,
    ) -> anyhow::Result<TokenRefresh> {
        debug!("refreshing social access token");
        let resp = self
            .http
            .post(&self.social_endpoint)
            .header(reqwest::header::USER_AGENT, user_agent(machine_id))
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .context("social token request failed")?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("social token response parse failed")?;
        if !status.is_success() {
            bail!("social token refresh failed ({status}): {body}");
        }
        parse_token_response(&body)
    }

    /// Start a device-authorization grant: obtain the codes the user needs
    /// to approve the device, plus the poll parameters.
    pub async fn start_device_authorization(
        &self,
        client_id: &str,
        client_secret: &str,
        machine_id: &str,
    ) -> anyhow::Result<DeviceAuthorization> {
        let endpoint = self
            .oidc_endpoint
            .replace("/token", "/device_authorization");
        let resp = self
            .http
            .post(&endpoint)
            .header(reqwest::header::USER_AGENT, user_agent(machine_id))
            .json(&json!({
                "clientId": client_id,
                "clientSecret": client_secret,
            }))
            .send()
            .await
            .context("device authorization request failed")?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("device authorization response parse failed")?;
        if !status.is_success() {
            bail!("device authorization failed ({status}): {body}");
        }
        parse_device_authorization(&body)
    }

    /// Poll the token endpoint until the user approves the device grant.
    ///
    /// Stops on success, on any error other than `authorization_pending`, on
    /// the provider-supplied deadline, or after [`MAX_POLLS`] attempts.
    pub async fn poll_device_token(
        &self,
        client_id: &str,
        client_secret: &str,
        auth: &DeviceAuthorization,
        machine_id: &str,
    ) -> anyhow::Result<TokenRefresh> {
        let interval = Duration::from_secs(auth.interval_secs).max(MIN_POLL_INTERVAL);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(auth.expires_in_secs);

        for attempt in 1..=MAX_POLLS {
            tokio::time::sleep(interval).await;
            if tokio::time::Instant::now() >= deadline {
                bail!("device authorization expired before approval");
            }

            let resp = self
                .http
                .post(&self.oidc_endpoint)
                .header(reqwest::header::USER_AGENT, user_agent(machine_id))
                .json(&json!({
                    "grantType": "urn:ietf:params:oauth:grant-type:device_code",
                    "clientId": client_id,
                    "clientSecret": client_secret,
                    "deviceCode": auth.device_code,
                }))
                .send()
                .await
                .context("device token poll failed")?;

            let status = resp.status();
            let body: Value = resp
                .json()
                .await
                .context("device token response parse failed")?;

            if status.is_success() {
                return parse_token_response(&body);
            }
            match pending_error(&body) {
                Some(true) => {
                    debug!(attempt, "device authorization still pending");
                }
                _ => bail!("device authorization failed ({status}): {body}"),
            }
        }
        warn!("device authorization poll budget exhausted");
        bail!("device authorization was not approved within {MAX_POLLS} polls")
    }
}

/// True when the error body signals `authorization_pending`.
fn pending_error(body: &Value) -> Option<bool> {
    let code = body["error"]
        .as_str()
        .or_else(|| body["__type"].as_str())?;
    Some(code.contains("AuthorizationPending") || code == "authorization_pending")
}

fn parse_device_authorization(body: &Value) -> anyhow::Result<DeviceAuthorization> {
    Ok(DeviceAuthorization {
        device_code: body["deviceCode"]
            .as_str()
            .or_else(|| body["device_code"].as_str())
            .context("device authorization is missing the device code")?
            .to_string(),
        user_code: body["userCode"]
            .as_str()
            .or_else(|| body["user_code"].as_str())
            .unwrap_or_default()
            .to_string(),
        verification_uri: body["verificationUriComplete"]
            .as_str()
            .or_else(|| body["verificationUri"].as_str())
            .or_else(|| body["verification_uri"].as_str())
            .unwrap_or_default()
            .to_string(),
        interval_secs: body["interval"].as_u64().unwrap_or(5),
        expires_in_secs: body["expiresIn"]
            .as_u64()
            .or_else(|| body["expires_in"].as_u64())
            .unwrap_or(600),
    })
}

/// Accepts both the camelCase AWS shape and the snake_case OAuth shape.
fn parse_token_response(body: &Value) -> anyhow::Result<TokenRefresh> {
    let access_token = body["accessToken"]
        .as_str()
        .or_else(|| body["access_token"].as_str())
        .context("token response is missing the access token")?
        .to_string();
    let refresh_token = body["refreshToken"]
        .as_str()
        .or_else(|| body["refresh_token"].as_str())
        .map(str::to_string)
        .filter(|t| !t.is_empty());
    let expires_in = body["expiresIn"]
        .as_u64()
        .or_else(|| body["expires_in"].as_u64());
    Ok(TokenRefresh {
        access_token,
        refresh_token,
        expires_in,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
