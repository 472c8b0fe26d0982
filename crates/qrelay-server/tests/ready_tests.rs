// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Readiness-gate behavior: token freshness, quota probing, and the status
//! transitions driven by probe failures.

use std::sync::Arc;

use chrono::Utc;
use qrelay_account::{Account, AccountStatus, AccountStore, MemoryStore};
use qrelay_config::Config;
use qrelay_server::testing::{FailingTokens, ScriptedDispatch, StaticTokens};
use qrelay_server::{ensure_ready, ChatDispatch, Gateway, GatewayBuilder, TokenFlows};
use qrelay_upstream::{classify, DispatchError, QuotaSnapshot};

const MACHINE_ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

fn base_account(id: &str) -> Account {
    let mut a = Account::new(id);
    a.access_token = "valid-token".into();
    a.refresh_token = "refresh".into();
    a.machine_id = MACHINE_ID.into();
    a.last_refresh = Some(Utc::now());
    a.quota_refreshed_at = Some(Utc::now());
    a.usage_limit = 100;
    a
}

async fn gateway(
    account: Account,
    dispatch: Arc<ScriptedDispatch>,
    tokens: Arc<dyn TokenFlows>,
) -> (Arc<MemoryStore>, Arc<Gateway>) {
    let store = Arc::new(MemoryStore::new());
    store.insert(account).await;
    let gw = GatewayBuilder::new(Arc::new(Config::default()), store.clone())
        .dispatch(dispatch as Arc<dyn ChatDispatch>)
        .tokens(tokens)
        .build()
        .unwrap();
    (store, gw)
}

fn ok_quota(current: u64, limit: u64) -> Result<QuotaSnapshot, DispatchError> {
    Ok(QuotaSnapshot {
        usage_current: current,
        usage_limit: limit,
        subscription_type: Some("PRO".into()),
        token_expiry: None,
    })
}

#[tokio::test]
async fn fresh_account_passes_without_upstream_calls() {
    let dispatch = Arc::new(ScriptedDispatch::new(vec![]));
    let tokens = Arc::new(StaticTokens::new("new-token"));
    let (_, gw) = gateway(base_account("a"), dispatch.clone(), tokens.clone()).await;

    let account = gw.store.get("a").await.unwrap().unwrap();
    let ready = ensure_ready(&gw, account).await.unwrap();
    assert_eq!(ready.access_token, "valid-token");
    assert_eq!(tokens.call_count(), 0);
    assert!(dispatch.quota_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_token_triggers_refresh() {
    let dispatch = Arc::new(ScriptedDispatch::new(vec![]));
    let tokens = Arc::new(StaticTokens::new("minted"));
    let mut account = base_account("a");
    account.access_token = String::new();
    let (store, gw) = gateway(account, dispatch, tokens.clone()).await;

    let account = store.get("a").await.unwrap().unwrap();
    let ready = ensure_ready(&gw, account).await.unwrap();
    assert_eq!(ready.access_token, "minted");
    assert_eq!(tokens.call_count(), 1);
    assert!(store.get("a").await.unwrap().unwrap().last_refresh.is_some());
}

#[tokio::test]
async fn aged_token_triggers_refresh() {
    let dispatch = Arc::new(ScriptedDispatch::new(vec![]));
    let tokens = Arc::new(StaticTokens::new("minted"));
    let mut account = base_account("a");
    account.last_refresh = Some(Utc::now() - chrono::Duration::minutes(26));
    let (store, gw) = gateway(account, dispatch, tokens.clone()).await;

    let account = store.get("a").await.unwrap().unwrap();
    let ready = ensure_ready(&gw, account).await.unwrap();
    assert_eq!(ready.access_token, "minted");
    assert_eq!(tokens.call_count(), 1);
}

#[tokio::test]
async fn failed_refresh_propagates_error() {
    let dispatch = Arc::new(ScriptedDispatch::new(vec![]));
    let mut account = base_account("a");
    account.access_token = String::new();
    let (store, gw) = gateway(account, dispatch, Arc::new(FailingTokens)).await;

    let account = store.get("a").await.unwrap().unwrap();
    let err = ensure_ready(&gw, account).await.unwrap_err();
    assert!(err.to_string().contains("refresh"), "unexpected: {err}");
}

#[tokio::test]
async fn stale_quota_is_probed_and_recorded() {
    let dispatch =
        Arc::new(ScriptedDispatch::new(vec![]).with_quota(vec![ok_quota(40, 200)]));
    let tokens = Arc::new(StaticTokens::new("unused"));
    let mut account = base_account("a");
    account.quota_refreshed_at = None;
    let (store, gw) = gateway(account, dispatch.clone(), tokens).await;

    let account = store.get("a").await.unwrap().unwrap();
    ensure_ready(&gw, account).await.unwrap();
    assert_eq!(*dispatch.quota_calls.lock().unwrap(), vec!["a"]);
    let a = store.get("a").await.unwrap().unwrap();
    assert_eq!(a.usage_current, 40);
    assert_eq!(a.usage_limit, 200);
    assert!(a.quota_refreshed_at.is_some());
}

#[tokio::test]
async fn exhausted_quota_marks_account_and_fails() {
    let dispatch =
        Arc::new(ScriptedDispatch::new(vec![]).with_quota(vec![ok_quota(200, 200)]));
    let tokens = Arc::new(StaticTokens::new("unused"));
    let mut account = base_account("a");
    account.quota_refreshed_at = None;
    let (store, gw) = gateway(account, dispatch, tokens).await;

    let account = store.get("a").await.unwrap().unwrap();
    assert!(ensure_ready(&gw, account).await.is_err());
    assert_eq!(
        store.get("a").await.unwrap().unwrap().status,
        AccountStatus::Exhausted
    );
}

#[tokio::test]
async fn suspended_probe_marks_account_and_fails() {
    let suspended = DispatchError::Account(classify("TEMPORARILY_SUSPENDED").unwrap());
    let dispatch = Arc::new(ScriptedDispatch::new(vec![]).with_quota(vec![Err(suspended)]));
    let tokens = Arc::new(StaticTokens::new("unused"));
    let mut account = base_account("a");
    account.quota_refreshed_at = None;
    let (store, gw) = gateway(account, dispatch, tokens).await;

    let account = store.get("a").await.unwrap().unwrap();
    assert!(ensure_ready(&gw, account).await.is_err());
    assert_eq!(
        store.get("a").await.unwrap().unwrap().status,
        AccountStatus::Suspended
    );
}

#[tokio::test]
async fn auth_error_probe_refreshes_and_retries_once() {
    let expired = DispatchError::Account(classify("ExpiredTokenException").unwrap());
    let dispatch = Arc::new(
        ScriptedDispatch::new(vec![]).with_quota(vec![Err(expired), ok_quota(1, 100)]),
    );
    let tokens = Arc::new(StaticTokens::new("re-minted"));
    let mut account = base_account("a");
    account.quota_refreshed_at = None;
    let (store, gw) = gateway(account, dispatch.clone(), tokens.clone()).await;

    let account = store.get("a").await.unwrap().unwrap();
    let ready = ensure_ready(&gw, account).await.unwrap();

    assert_eq!(tokens.call_count(), 1, "one refresh between the two probes");
    assert_eq!(dispatch.quota_calls.lock().unwrap().len(), 2);
    assert_eq!(ready.access_token, "re-minted");
    // The successful refresh restored the account to normal.
    assert_eq!(
        store.get("a").await.unwrap().unwrap().status,
        AccountStatus::Normal
    );
}

#[tokio::test]
async fn invalid_machine_id_is_regenerated_and_persisted() {
    let dispatch = Arc::new(ScriptedDispatch::new(vec![]));
    let tokens = Arc::new(StaticTokens::new("unused"));
    let mut account = base_account("a");
    account.machine_id = "not-hex".into();
    let (store, gw) = gateway(account, dispatch, tokens).await;

    let account = store.get("a").await.unwrap().unwrap();
    let ready = ensure_ready(&gw, account).await.unwrap();
    assert!(qrelay_auth::is_valid_machine_id(&ready.machine_id));
    assert_eq!(
        store.get("a").await.unwrap().unwrap().machine_id,
        ready.machine_id,
        "regenerated id must be persisted"
    );
}
