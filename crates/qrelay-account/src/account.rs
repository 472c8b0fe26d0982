// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Days after which an `exhausted` account becomes eligible again.
pub(crate) const EXHAUSTED_RECOVERY_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Normal,
    Disabled,
    Suspended,
    Exhausted,
    Expired,
}

/// Which refresh flow the account's refresh token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    /// IdC device-grant credentials (client id/secret + refresh token).
    #[default]
    Idc,
    /// Social-login credentials (refresh token only).
    Social,
}

/// One set of upstream credentials with its status, counters, and quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub q_user_id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,

    // ── Credentials ──────────────────────────────────────────────────────────
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub refresh_token: String,
    /// May be empty pending the first refresh.
    #[serde(default)]
    pub access_token: String,
    /// 64-hex device identifier, generated once and persisted on first use.
    #[serde(default)]
    pub machine_id: String,
    #[serde(default)]
    pub auth_kind: AuthKind,

    // ── Status & counters ────────────────────────────────────────────────────
    pub status: AccountStatus,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub error_count: u32,

    // ── Quota ────────────────────────────────────────────────────────────────
    #[serde(default)]
    pub usage_current: u64,
    #[serde(default)]
    pub usage_limit: u64,
    #[serde(default)]
    pub subscription_type: Option<String>,
    #[serde(default)]
    pub quota_refreshed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub token_expiry: Option<DateTime<Utc>>,

    // ── Bookkeeping ──────────────────────────────────────────────────────────
    /// Last successful access-token refresh.
    #[serde(default)]
    pub last_refresh: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status_changed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl Account {
    /// Bare account with credentials; everything else defaulted.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            q_user_id: None,
            label: None,
            client_id: String::new(),
            client_secret: String::new(),
            refresh_token: String::new(),
            access_token: String::new(),
            machine_id: String::new(),
            auth_kind: AuthKind::Idc,
            status: AccountStatus::Normal,
            enabled: true,
            success_count: 0,
            error_count: 0,
            usage_current: 0,
            usage_limit: 0,
            subscription_type: None,
            quota_refreshed_at: None,
            token_expiry: None,
            last_refresh: None,
            last_used_at: None,
            status_changed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Fraction of quota still available, when a limit is known.
    pub fn quota_remaining_ratio(&self) -> Option<f64> {
        if self.usage_limit == 0 {
            return None;
        }
        let used = self.usage_current.min(self.usage_limit) as f64;
        Some(1.0 - used / self.usage_limit as f64)
    }

    /// Success fraction over recorded attempts, when any were recorded.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.success_count + self.error_count as u64;
        if total == 0 {
            return None;
        }
        Some(self.success_count as f64 / total as f64)
    }

    /// Selection weight for the weighted-random strategy.
    ///
    /// `1 + 10·quota_remaining + min(idle_hours·0.5, 5) + 3·success_rate`,
    /// with median defaults (5, 3, 1.5) substituted for unknown terms so a
    /// fresh account competes fairly against well-measured ones.
    pub fn selection_weight(&self, now: DateTime<Utc>) -> f64 {
        let quota_term = self
            .quota_remaining_ratio()
            .map(|r| 10.0 * r)
            .unwrap_or(5.0);
        let idle_term = self
            .last_used_at
            .map(|t| {
                let hours = (now - t).num_seconds().max(0) as f64 / 3600.0;
                (hours * 0.5).min(5.0)
            })
            .unwrap_or(3.0);
        let success_term = self.success_rate().map(|r| 3.0 * r).unwrap_or(1.5);
        1.0 + quota_term + idle_term + success_term
    }

    /// Whether an `exhausted` account has aged past the recovery window.
    pub fn exhaustion_recovered(&self, now: DateTime<Utc>) -> bool {
        self.status == AccountStatus::Exhausted
            && self
                .status_changed_at
                .map(|at| now - at >= Duration::days(EXHAUSTED_RECOVERY_DAYS))
                .unwrap_or(false)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
