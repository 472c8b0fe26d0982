// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Snapshot cache of eligible accounts with pluggable selection.
//!
//! Readers work against an `Arc<Vec<Account>>` snapshot swapped in whole by
//! the refresh path, so selection never blocks on the store.  Concurrent
//! refreshes collapse through a compare-and-swap flag; a pool whose snapshot
//! is older than twice the refresh interval is stale and refreshed inline
//! before the next pick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use qrelay_config::{ListOrder, PoolConfig, SelectionMode};
use rand::Rng;
use tracing::{debug, warn};

use crate::account::Account;
use crate::store::AccountStore;

pub struct AccountPool {
    store: Arc<dyn AccountStore>,
    order: ListOrder,
    lazy_limit: usize,
    refresh_interval: Duration,
    snapshot: RwLock<Arc<Vec<Account>>>,
    last_refresh: RwLock<Option<Instant>>,
    refreshing: AtomicBool,
    rr_counter: AtomicU64,
}

impl AccountPool {
    pub fn new(store: Arc<dyn AccountStore>, config: &PoolConfig) -> Self {
        Self {
            store,
            order: config.order.clone(),
            lazy_limit: config.lazy_limit,
            refresh_interval: Duration::from_secs(config.refresh_interval_secs.max(1)),
            snapshot: RwLock::new(Arc::new(Vec::new())),
            last_refresh: RwLock::new(None),
            refreshing: AtomicBool::new(false),
            rr_counter: AtomicU64::new(0),
        }
    }

    /// Number of accounts in the current snapshot.
    pub fn len(&self) -> usize {
        self.snapshot.read().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild the snapshot from the store.  Collapses with any refresh
    /// already in flight; the loser returns immediately and keeps serving
    /// the old snapshot.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let result = self
            .store
            .list_normal_accounts(&self.order, self.lazy_limit)
            .await;
        self.refreshing.store(false, Ordering::Release);

        let accounts = result?;
        debug!(count = accounts.len(), "account pool refreshed");
        *self.snapshot.write().expect("pool lock poisoned") = Arc::new(accounts);
        *self.last_refresh.write().expect("pool lock poisoned") = Some(Instant::now());
        Ok(())
    }

    /// Drop freshness so the next pick re-reads the store.  Called after
    /// every status transition.
    pub fn invalidate(&self) {
        *self.last_refresh.write().expect("pool lock poisoned") = None;
    }

    pub fn is_stale(&self) -> bool {
        match *self.last_refresh.read().expect("pool lock poisoned") {
            None => true,
            Some(at) => at.elapsed() > 2 * self.refresh_interval,
        }
    }

    /// Pick an eligible account not in `exclude`, refreshing first when the
    /// snapshot is stale.  Returns `None` when no candidate remains.
    pub async fn get_excluding(
        &self,
        exclude: &[String],
        mode: SelectionMode,
    ) -> Option<Account> {
        if self.is_stale() {
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "pool refresh failed, serving stale snapshot");
            }
        }
        let snapshot = self.snapshot.read().expect("pool lock poisoned").clone();
        let candidates: Vec<&Account> = snapshot
            .iter()
            .filter(|a| !exclude.iter().any(|id| id == &a.id))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let picked = match mode {
            SelectionMode::Sequential => candidates[0],
            SelectionMode::Random => candidates[rand::thread_rng().gen_range(0..candidates.len())],
            SelectionMode::RoundRobin => {
                let n = self.rr_counter.fetch_add(1, Ordering::Relaxed);
                candidates[(n % candidates.len() as u64) as usize]
            }
            SelectionMode::WeightedRandom => {
                weighted_pick(&candidates, rand::thread_rng().gen::<f64>())
            }
        };
        Some(picked.clone())
    }

    /// Background refresh loop; exits when the shutdown signal flips.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "background pool refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("pool refresh loop stopping");
                        return;
                    }
                }
            }
        }
    }
}

/// Cumulative-sum scan over selection weights against a uniform roll in
/// `[0, 1)`.  The final candidate backstops floating-point drift.
fn weighted_pick<'a>(candidates: &[&'a Account], roll: f64) -> &'a Account {
    let now = Utc::now();
    let weights: Vec<f64> = candidates.iter().map(|a| a.selection_weight(now)).collect();
    let total: f64 = weights.iter().sum();
    let target = roll * total;
    let mut cumulative = 0.0;
    for (account, weight) in candidates.iter().zip(&weights) {
        cumulative += weight;
        if target < cumulative {
            return account;
        }
    }
    candidates[candidates.len() - 1]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
