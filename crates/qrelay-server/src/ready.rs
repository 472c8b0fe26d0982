// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Readiness gate: a chosen account must hold a fresh access token and a
//! fresh, non-exhausted quota reading before dispatch.
//!
//! Token refreshes funnel through the single-flight refresher so a burst of
//! requests landing on the same cold account triggers exactly one OIDC
//! call.  Every status transition invalidates the pool cache so the next
//! pick sees the store's truth.

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use qrelay_account::{Account, AccountStatus, AuthKind};
use qrelay_auth::{ensure_machine_id, is_valid_machine_id, TokenClient, TokenRefresh};
use qrelay_upstream::DispatchError;
use tracing::{debug, warn};

use crate::state::Gateway;

/// Access tokens older than this are refreshed before use.
const TOKEN_MAX_AGE_MINUTES: i64 = 25;

/// The refresh flow seam, mockable in tests.
#[async_trait]
pub trait TokenFlows: Send + Sync {
    async fn refresh(&self, account: &Account) -> anyhow::Result<TokenRefresh>;
}

#[async_trait]
impl TokenFlows for TokenClient {
    async fn refresh(&self, account: &Account) -> anyhow::Result<TokenRefresh> {
        match account.auth_kind {
            AuthKind::Idc => {
                self.refresh_idc(
                    &account.client_id,
                    &account.client_secret,
                    &account.refresh_token,
                    &account.machine_id,
                )
                .await
            }
            AuthKind::Social => {
                self.refresh_social(&account.refresh_token, &account.machine_id)
                    .await
            }
        }
    }
}

/// Status transition implied by a classifier code, if any.  Codes without a
/// transition (throttling, capacity) only rotate the pipeline.
pub fn status_for_code(code: &str) -> Option<AccountStatus> {
    match code {
        "QUOTA_EXCEEDED" => Some(AccountStatus::Exhausted),
        "TEMPORARILY_SUSPENDED" => Some(AccountStatus::Suspended),
        "UNAUTHORIZED" | "EXPIRED_TOKEN" | "INVALID_TOKEN" => Some(AccountStatus::Expired),
        "ACCESS_DENIED" => Some(AccountStatus::Disabled),
        _ => None,
    }
}

/// Bring `account` to readiness, returning its refreshed state.
pub async fn ensure_ready(gw: &Gateway, account: Account) -> anyhow::Result<Account> {
    let settings = gw.store.settings().await.unwrap_or_default();
    let mut account = account;

    // A broken machine id would poison every upstream call's User-Agent.
    if !is_valid_machine_id(&account.machine_id) {
        let (machine_id, _) = ensure_machine_id(&account.machine_id);
        gw.store
            .update_machine_id(&account.id, &machine_id)
            .await
            .context("persisting regenerated machine id")?;
        account.machine_id = machine_id;
    }

    // ── Access token ─────────────────────────────────────────────────────────
    let token_stale = account.access_token.is_empty()
        || account
            .last_refresh
            .map(|t| Utc::now() - t > Duration::minutes(TOKEN_MAX_AGE_MINUTES))
            .unwrap_or(true);
    if token_stale {
        refresh_via_singleflight(gw, &account).await?;
        account = reload(gw, &account.id).await?;
        if account.access_token.is_empty() {
            bail!("refresh completed but account still has no access token");
        }
    }

    // ── Quota ────────────────────────────────────────────────────────────────
    let quota_stale = account
        .quota_refreshed_at
        .map(|t| Utc::now() - t > Duration::seconds(settings.quota_refresh_interval_secs as i64))
        .unwrap_or(true);
    if quota_stale {
        match probe_and_record(gw, &account).await {
            Ok(()) => {}
            Err(ProbeFailure::Auth(code)) => {
                debug!(account_id = %account.id, code, "quota probe hit auth error, refreshing once");
                gw.store
                    .update_status(&account.id, AccountStatus::Expired, code)
                    .await?;
                gw.pool.invalidate();
                refresh_via_singleflight(gw, &account).await?;
                account = reload(gw, &account.id).await?;
                if let Err(e) = probe_and_record(gw, &account).await {
                    bail!("quota probe failed after token refresh: {e}");
                }
            }
            Err(ProbeFailure::Suspended) => {
                gw.store
                    .update_status(&account.id, AccountStatus::Suspended, "TEMPORARILY_SUSPENDED")
                    .await?;
                gw.pool.invalidate();
                bail!("account is temporarily suspended upstream");
            }
            Err(ProbeFailure::Exhausted) => {
                bail!("account quota is exhausted");
            }
            Err(ProbeFailure::Other(e)) => {
                bail!("quota probe failed: {e}");
            }
        }
        account = reload(gw, &account.id).await?;
    }

    Ok(account)
}

async fn refresh_via_singleflight(gw: &Gateway, account: &Account) -> anyhow::Result<()> {
    let snapshot = account.clone();
    let outcome = gw
        .refresher
        .try_refresh(&account.id, || async {
            let token = gw.tokens.refresh(&snapshot).await?;
            gw.store
                .update_tokens(
                    &snapshot.id,
                    &token.access_token,
                    token.refresh_token.as_deref().unwrap_or(""),
                    AccountStatus::Normal,
                )
                .await?;
            gw.pool.invalidate();
            Ok(())
        })
        .await;
    if let Some(err) = outcome.error {
        warn!(account_id = %account.id, error = %err, "token refresh failed");
        bail!("token refresh failed: {err}");
    }
    Ok(())
}

enum ProbeFailure {
    Auth(&'static str),
    Suspended,
    Exhausted,
    Other(String),
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth(code) => write!(f, "auth error ({code})"),
            Self::Suspended => write!(f, "temporarily suspended"),
            Self::Exhausted => write!(f, "quota exhausted"),
            Self::Other(e) => write!(f, "{e}"),
        }
    }
}

async fn probe_and_record(gw: &Gateway, account: &Account) -> Result<(), ProbeFailure> {
    let quota = match gw
        .dispatch
        .fetch_quota(&account.id, &account.access_token, &account.machine_id)
        .await
    {
        Ok(q) => q,
        Err(e) => {
            let code = match &e {
                DispatchError::Request(c) | DispatchError::Account(c) => c.code,
                DispatchError::Network(msg) => {
                    return Err(ProbeFailure::Other(msg.clone()));
                }
            };
            return Err(match code {
                "INVALID_TOKEN" | "UNAUTHORIZED" | "EXPIRED_TOKEN" => ProbeFailure::Auth(code),
                "TEMPORARILY_SUSPENDED" => ProbeFailure::Suspended,
                other => ProbeFailure::Other(other.to_string()),
            });
        }
    };

    if let Err(e) = gw
        .store
        .update_quota(
            &account.id,
            quota.usage_current,
            quota.usage_limit,
            quota.subscription_type.clone(),
            quota.token_expiry,
        )
        .await
    {
        return Err(ProbeFailure::Other(format!("recording quota: {e}")));
    }

    if quota.usage_limit > 0 && quota.usage_current >= quota.usage_limit {
        let _ = gw
            .store
            .update_status(&account.id, AccountStatus::Exhausted, "quota exhausted")
            .await;
        gw.pool.invalidate();
        return Err(ProbeFailure::Exhausted);
    }
    Ok(())
}

async fn reload(gw: &Gateway, id: &str) -> anyhow::Result<Account> {
    gw.store
        .get(id)
        .await?
        .with_context(|| format!("account {id} disappeared from the store"))
}
