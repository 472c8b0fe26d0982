// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
/// Integration tests for the assembled gateway: file-backed account store,
/// scripted upstream, full request path in both dialects.
use std::sync::Arc;

use chrono::Utc;
use qrelay_account::{Account, AccountStore, JsonFileStore};
use qrelay_config::Config;
use qrelay_server::testing::{text_answer_chunks, ScriptedDispatch, StaticTokens};
use qrelay_server::{handle_chat, ChatDispatch, ChatReply, Dialect, GatewayBuilder, TokenFlows};
use serde_json::json;

const MACHINE_ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

fn ready_account(id: &str) -> Account {
    let mut a = Account::new(id);
    a.access_token = format!("token-{id}");
    a.refresh_token = format!("refresh-{id}");
    a.machine_id = MACHINE_ID.into();
    a.last_refresh = Some(Utc::now());
    a.quota_refreshed_at = Some(Utc::now());
    a.usage_limit = 1_000;
    a
}

#[tokio::test]
async fn file_store_gateway_serves_both_dialects() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accounts.json");

    let store = JsonFileStore::open(&path).await.unwrap();
    store.insert_account(ready_account("file-acct")).await;
    let store: Arc<dyn AccountStore> = Arc::new(store);

    let dispatch = Arc::new(ScriptedDispatch::new(vec![
        Ok(text_answer_chunks(&["claude says hi"])),
        Ok(text_answer_chunks(&["openai says hi"])),
    ]));
    let tokens: Arc<dyn TokenFlows> = Arc::new(StaticTokens::new("unused"));

    let gw = GatewayBuilder::new(Arc::new(Config::default()), store)
        .dispatch(dispatch.clone() as Arc<dyn ChatDispatch>)
        .tokens(tokens)
        .build()
        .unwrap();
    gw.pool.refresh().await.unwrap();

    // Claude dialect.
    let request = qrelay_protocol::parse_claude_request(&json!({
        "model": "claude-sonnet-4.5",
        "messages": [{ "role": "user", "content": "Hi" }]
    }))
    .unwrap();
    let reply = handle_chat(gw.clone(), request, Dialect::Claude, "it".into(), None)
        .await
        .unwrap();
    let ChatReply::Json { body, .. } = reply else {
        panic!("expected JSON reply")
    };
    assert_eq!(body["content"][0]["text"], "claude says hi");

    // OpenAI dialect against the same pool.
    let request = qrelay_protocol::parse_openai_request(&json!({
        "model": "claude-sonnet-4.5",
        "messages": [{ "role": "user", "content": "Hi" }]
    }))
    .unwrap();
    let reply = handle_chat(gw.clone(), request, Dialect::OpenAi, "it".into(), None)
        .await
        .unwrap();
    let ChatReply::Json { body, .. } = reply else {
        panic!("expected JSON reply")
    };
    assert_eq!(body["choices"][0]["message"]["content"], "openai says hi");
    assert_eq!(
        *dispatch.chat_calls.lock().unwrap(),
        vec!["file-acct", "file-acct"]
    );
}

#[tokio::test]
async fn stats_survive_store_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accounts.json");

    {
        let store = JsonFileStore::open(&path).await.unwrap();
        store.insert_account(ready_account("durable")).await;
        let store: Arc<dyn AccountStore> = Arc::new(store);
        let dispatch = Arc::new(ScriptedDispatch::new(vec![Ok(text_answer_chunks(&["ok"]))]));
        let tokens: Arc<dyn TokenFlows> = Arc::new(StaticTokens::new("unused"));
        let gw = GatewayBuilder::new(Arc::new(Config::default()), store)
            .dispatch(dispatch as Arc<dyn ChatDispatch>)
            .tokens(tokens)
            .build()
            .unwrap();
        gw.pool.refresh().await.unwrap();

        let request = qrelay_protocol::parse_claude_request(&json!({
            "model": "claude-sonnet-4.5",
            "messages": [{ "role": "user", "content": "Hi" }]
        }))
        .unwrap();
        handle_chat(gw, request, Dialect::Claude, "it".into(), None)
            .await
            .unwrap();
        // Let the completion guard's spawned accounting task run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    let reopened = JsonFileStore::open(&path).await.unwrap();
    let account = reopened.get("durable").await.unwrap().unwrap();
    assert_eq!(account.success_count, 1);
    assert!(account.last_used_at.is_some());
}

#[tokio::test]
async fn upstream_request_error_maps_to_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::open(dir.path().join("a.json")).await.unwrap();
    store.insert_account(ready_account("a")).await;
    let store: Arc<dyn AccountStore> = Arc::new(store);

    let dispatch = Arc::new(ScriptedDispatch::new(vec![Err(
        qrelay_upstream::DispatchError::Request(
            qrelay_upstream::classify("Improperly formed request").unwrap(),
        ),
    )]));
    let tokens: Arc<dyn TokenFlows> = Arc::new(StaticTokens::new("unused"));
    let gw = GatewayBuilder::new(Arc::new(Config::default()), store)
        .dispatch(dispatch as Arc<dyn ChatDispatch>)
        .tokens(tokens)
        .build()
        .unwrap();
    gw.pool.refresh().await.unwrap();

    let request = qrelay_protocol::parse_claude_request(&json!({
        "model": "claude-sonnet-4.5",
        "messages": [{ "role": "user", "content": "Hi" }]
    }))
    .unwrap();
    let err = handle_chat(gw, request, Dialect::Claude, "it".into(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_REQUEST");
}
