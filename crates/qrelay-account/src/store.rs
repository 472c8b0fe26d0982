// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The persistent-store collaborator interface.
//!
//! The real account store lives outside this codebase; the gateway only
//! depends on the [`AccountStore`] trait.  Two implementations ship here:
//! [`MemoryStore`] for tests and [`JsonFileStore`] so the binary runs
//! stand-alone against a local accounts file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qrelay_config::{ListOrder, Settings};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::account::{Account, AccountStatus};

/// Store surface the request path consumes.
///
/// Implementations must serialize status writes per account — callers rely
/// on the store as the serialization point for transitions (the in-memory
/// pool is reconciled afterwards by invalidation).
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Eligible (`normal`, enabled) accounts in the requested order.
    /// `limit == 0` means unlimited.  Implementations auto-recover
    /// `exhausted` accounts whose transition is at least 30 days old.
    async fn list_normal_accounts(
        &self,
        order: &ListOrder,
        limit: usize,
    ) -> anyhow::Result<Vec<Account>>;

    async fn get(&self, id: &str) -> anyhow::Result<Option<Account>>;

    /// Persist refreshed tokens.  An empty `refresh` keeps the old refresh
    /// token.  Setting `status` to `normal` resets the error counter — a
    /// successful refresh always clears the failure history.
    async fn update_tokens(
        &self,
        id: &str,
        access: &str,
        refresh: &str,
        status: AccountStatus,
    ) -> anyhow::Result<()>;

    async fn update_status(
        &self,
        id: &str,
        status: AccountStatus,
        reason: &str,
    ) -> anyhow::Result<()>;

    async fn update_quota(
        &self,
        id: &str,
        current: u64,
        limit: u64,
        subscription_type: Option<String>,
        token_expiry: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;

    /// Record a request outcome.  `success_delta > 0` bumps the success
    /// counter (and clears errors when `reset_errors_on_success`);
    /// `success_delta == 0` records a failure, force-disabling the account
    /// once `max_error_count` consecutive failures accumulate.
    async fn update_stats(
        &self,
        id: &str,
        success_delta: u64,
        reset_errors_on_success: bool,
        max_error_count: u32,
    ) -> anyhow::Result<()>;

    /// Pin a freshly generated 64-hex device id to the account.
    async fn update_machine_id(&self, id: &str, machine_id: &str) -> anyhow::Result<()>;

    /// Runtime-tunable knobs (selection mode, force model, …).
    async fn settings(&self) -> anyhow::Result<Settings>;

    /// Resolve an API key to a user id, if the key is known.
    async fn lookup_api_key(&self, key: &str) -> anyhow::Result<Option<String>>;
}

/// Narrow status-transition capability.
///
/// Error classification runs inside the dispatch loop, which was fed by the
/// pool, which watches the store — handing the full [`AccountStore`] to the
/// classifier side would close that loop.  Consumers that only flip status
/// take this trait instead.
#[async_trait]
pub trait AccountStatusSink: Send + Sync {
    async fn set_status(
        &self,
        id: &str,
        status: AccountStatus,
        reason: &str,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl<S: AccountStore + ?Sized> AccountStatusSink for S {
    async fn set_status(
        &self,
        id: &str,
        status: AccountStatus,
        reason: &str,
    ) -> anyhow::Result<()> {
        self.update_status(id, status, reason).await
    }
}

// ─── In-memory store ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    accounts: RwLock<HashMap<String, Account>>,
    settings: RwLock<Settings>,
    api_keys: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, account: Account) {
        self.accounts
            .write()
            .await
            .insert(account.id.clone(), account);
    }

    pub async fn set_settings(&self, settings: Settings) {
        *self.settings.write().await = settings;
    }

    pub async fn add_api_key(&self, key: impl Into<String>, user: impl Into<String>) {
        self.api_keys
            .write()
            .await
            .insert(key.into(), user.into());
    }

    pub async fn dump_accounts(&self) -> Vec<Account> {
        self.accounts.read().await.values().cloned().collect()
    }

    async fn mutate<F>(&self, id: &str, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Account),
    {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(id)
            .with_context(|| format!("account {id} not found"))?;
        f(account);
        Ok(())
    }
}

fn apply_status(account: &mut Account, status: AccountStatus) {
    if account.status != status {
        account.status_changed_at = Some(Utc::now());
    }
    account.status = status;
    if status == AccountStatus::Disabled {
        account.enabled = false;
    }
}

fn sort_accounts(accounts: &mut [Account], order: &ListOrder) {
    match order.field.as_str() {
        "last_used_at" => accounts.sort_by_key(|a| a.last_used_at),
        "id" => accounts.sort_by(|a, b| a.id.cmp(&b.id)),
        _ => accounts.sort_by_key(|a| a.created_at),
    }
    if order.descending {
        accounts.reverse();
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn list_normal_accounts(
        &self,
        order: &ListOrder,
        limit: usize,
    ) -> anyhow::Result<Vec<Account>> {
        let now = Utc::now();
        let mut accounts = self.accounts.write().await;

        // Exhaustion recovery happens lazily on listing.
        for account in accounts.values_mut() {
            if account.exhaustion_recovered(now) {
                info!(account_id = %account.id, "exhausted account recovered");
                apply_status(account, AccountStatus::Normal);
            }
        }

        let mut eligible: Vec<Account> = accounts
            .values()
            .filter(|a| a.status == AccountStatus::Normal && a.enabled)
            .cloned()
            .collect();
        drop(accounts);

        sort_accounts(&mut eligible, order);
        if limit > 0 {
            eligible.truncate(limit);
        }
        Ok(eligible)
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Account>> {
        Ok(self.accounts.read().await.get(id).cloned())
    }

    async fn update_tokens(
        &self,
        id: &str,
        access: &str,
        refresh: &str,
        status: AccountStatus,
    ) -> anyhow::Result<()> {
        self.mutate(id, |a| {
            a.access_token = access.to_string();
            if !refresh.is_empty() {
                a.refresh_token = refresh.to_string();
            }
            apply_status(a, status);
            if status == AccountStatus::Normal {
                a.error_count = 0;
            }
            a.last_refresh = Some(Utc::now());
        })
        .await
    }

    async fn update_status(
        &self,
        id: &str,
        status: AccountStatus,
        reason: &str,
    ) -> anyhow::Result<()> {
        info!(account_id = %id, ?status, reason, "account status transition");
        self.mutate(id, |a| apply_status(a, status)).await
    }

    async fn update_quota(
        &self,
        id: &str,
        current: u64,
        limit: u64,
        subscription_type: Option<String>,
        token_expiry: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        self.mutate(id, |a| {
            a.usage_current = current;
            a.usage_limit = limit;
            a.subscription_type = subscription_type;
            a.token_expiry = token_expiry;
            a.quota_refreshed_at = Some(Utc::now());
        })
        .await
    }

    async fn update_stats(
        &self,
        id: &str,
        success_delta: u64,
        reset_errors_on_success: bool,
        max_error_count: u32,
    ) -> anyhow::Result<()> {
        self.mutate(id, |a| {
            if success_delta > 0 {
                a.success_count += success_delta;
                a.last_used_at = Some(Utc::now());
                if reset_errors_on_success {
                    a.error_count = 0;
                }
            } else {
                a.error_count += 1;
                if max_error_count > 0 && a.error_count >= max_error_count {
                    warn!(account_id = %id, errors = a.error_count, "error budget spent, disabling account");
                    apply_status(a, AccountStatus::Disabled);
                }
            }
        })
        .await
    }

    async fn update_machine_id(&self, id: &str, machine_id: &str) -> anyhow::Result<()> {
        self.mutate(id, |a| a.machine_id = machine_id.to_string())
            .await
    }

    async fn settings(&self) -> anyhow::Result<Settings> {
        Ok(self.settings.read().await.clone())
    }

    async fn lookup_api_key(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.api_keys.read().await.get(key).cloned())
    }
}

// ─── JSON-file store ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileState {
    #[serde(default)]
    accounts: Vec<Account>,
    #[serde(default)]
    settings: Option<Settings>,
    #[serde(default)]
    api_keys: HashMap<String, String>,
}

/// File-backed store for stand-alone deployments.
///
/// Every mutation rewrites the whole file; account counts are small enough
/// (tens, not millions) that this is simpler and safer than partial writes.
pub struct JsonFileStore {
    inner: MemoryStore,
    path: PathBuf,
}

impl JsonFileStore {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = MemoryStore::new();
        if path.is_file() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let state: FileState = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            for account in state.accounts {
                inner.insert(account).await;
            }
            if let Some(settings) = state.settings {
                inner.set_settings(settings).await;
            }
            for (key, user) in state.api_keys {
                inner.add_api_key(key, user).await;
            }
        }
        Ok(Self { inner, path })
    }

    /// Insert (or replace) an account and persist immediately.
    pub async fn insert_account(&self, account: Account) {
        self.inner.insert(account).await;
        self.persist().await;
    }

    /// Persist current state.  Failures are logged and swallowed: a broken
    /// disk must not take down live request handling.
    async fn persist(&self) {
        let state = FileState {
            accounts: self.inner.dump_accounts().await,
            settings: Some(self.inner.settings.read().await.clone()),
            api_keys: self.inner.api_keys.read().await.clone(),
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_vec_pretty(&state) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    warn!(path = %self.path.display(), error = %e, "failed to persist account store");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize account store"),
        }
    }
}

#[async_trait]
impl AccountStore for JsonFileStore {
    async fn list_normal_accounts(
        &self,
        order: &ListOrder,
        limit: usize,
    ) -> anyhow::Result<Vec<Account>> {
        self.inner.list_normal_accounts(order, limit).await
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Account>> {
        self.inner.get(id).await
    }

    async fn update_tokens(
        &self,
        id: &str,
        access: &str,
        refresh: &str,
        status: AccountStatus,
    ) -> anyhow::Result<()> {
        self.inner.update_tokens(id, access, refresh, status).await?;
        self.persist().await;
        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        status: AccountStatus,
        reason: &str,
    ) -> anyhow::Result<()> {
        self.inner.update_status(id, status, reason).await?;
        self.persist().await;
        Ok(())
    }

    async fn update_quota(
        &self,
        id: &str,
        current: u64,
        limit: u64,
        subscription_type: Option<String>,
        token_expiry: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        self.inner
            .update_quota(id, current, limit, subscription_type, token_expiry)
            .await?;
        self.persist().await;
        Ok(())
    }

    async fn update_stats(
        &self,
        id: &str,
        success_delta: u64,
        reset_errors_on_success: bool,
        max_error_count: u32,
    ) -> anyhow::Result<()> {
        self.inner
            .update_stats(id, success_delta, reset_errors_on_success, max_error_count)
            .await?;
        self.persist().await;
        Ok(())
    }

    async fn update_machine_id(&self, id: &str, machine_id: &str) -> anyhow::Result<()> {
        self.inner.update_machine_id(id, machine_id).await?;
        self.persist().await;
        Ok(())
    }

    async fn settings(&self) -> anyhow::Result<Settings> {
        self.inner.settings().await
    }

    async fn lookup_api_key(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.inner.lookup_api_key(key).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
