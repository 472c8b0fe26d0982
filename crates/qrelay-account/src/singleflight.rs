// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Single-flight deduplication for per-account refresh work.
//!
//! Many concurrent requests can select the same account whose token needs
//! refreshing; only one of them may hit the OIDC endpoint.  The first caller
//! runs the work, late arrivals wait on the shared state in 100 ms ticks,
//! and a fresh success stays "sticky" for five seconds so a thundering herd
//! right after the refresh does not re-trigger it.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Sticky window during which a finished refresh is reused outright.
const SUCCESS_TTL: Duration = Duration::from_secs(5);
/// Poll cadence for waiters.
const WAIT_TICK: Duration = Duration::from_millis(100);
/// Give-up horizon for waiters.
const WAIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Completed states older than this are dropped by `cleanup`.
const STATE_MAX_AGE: Duration = Duration::from_secs(60);

#[derive(Debug)]
enum Phase {
    Idle,
    Running,
    Done {
        at: Instant,
        error: Option<String>,
    },
}

#[derive(Debug)]
struct State {
    phase: Phase,
    waiters: usize,
}

/// Outcome of a `try_refresh` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Error message of the executed (or reused) refresh, if it failed.
    pub error: Option<String>,
    /// The call neither executed nor observed a fresh result (sticky hit or
    /// waiter timeout).
    pub skipped: bool,
    /// This caller executed the work itself.
    pub was_first: bool,
}

#[derive(Default)]
pub struct SingleFlight {
    states: DashMap<String, Arc<Mutex<State>>>,
    wait_tick: Option<Duration>,
    wait_timeout: Option<Duration>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: shrink the waiter cadence/timeout.
    #[doc(hidden)]
    pub fn with_wait_params(tick: Duration, timeout: Duration) -> Self {
        Self {
            states: DashMap::new(),
            wait_tick: Some(tick),
            wait_timeout: Some(timeout),
        }
    }

    /// Run `work` for `id` unless an equivalent run is in flight or just
    /// finished.
    ///
    /// - first caller (or stale state): executes `work`, records the result;
    /// - result younger than 5 s: returned as-is with `skipped = true`;
    /// - run in flight: waits up to 30 s in 100 ms ticks for its result;
    ///   on timeout returns `skipped = true` with no error.
    pub async fn try_refresh<F, Fut>(&self, id: &str, work: F) -> RefreshOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let state = self
            .states
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(State {
                    phase: Phase::Idle,
                    waiters: 0,
                }))
            })
            .clone();

        // Decide our role under the state lock.
        {
            let mut s = state.lock().await;
            let inner = &mut *s;
            match &inner.phase {
                Phase::Done { at, error } if at.elapsed() < SUCCESS_TTL => {
                    debug!(account_id = %id, "refresh result reused within sticky window");
                    let error = error.clone();
                    return RefreshOutcome {
                        error,
                        skipped: true,
                        was_first: false,
                    };
                }
                Phase::Running => {
                    inner.waiters += 1;
                    drop(s);
                    return self.wait_for_result(id, &state).await;
                }
                Phase::Idle | Phase::Done { .. } => {
                    inner.phase = Phase::Running;
                }
            }
        }

        let error = work().await.err().map(|e| format!("{e:#}"));
        let mut s = state.lock().await;
        s.phase = Phase::Done {
            at: Instant::now(),
            error: error.clone(),
        };
        RefreshOutcome {
            error,
            skipped: false,
            was_first: true,
        }
    }

    async fn wait_for_result(&self, id: &str, state: &Arc<Mutex<State>>) -> RefreshOutcome {
        let tick = self.wait_tick.unwrap_or(WAIT_TICK);
        let timeout = self.wait_timeout.unwrap_or(WAIT_TIMEOUT);
        let deadline = Instant::now() + timeout;

        loop {
            tokio::time::sleep(tick).await;
            let mut s = state.lock().await;
            if let Phase::Done { error, .. } = &s.phase {
                let error = error.clone();
                s.waiters -= 1;
                return RefreshOutcome {
                    error,
                    skipped: false,
                    was_first: false,
                };
            }
            if Instant::now() >= deadline {
                debug!(account_id = %id, "gave up waiting for in-flight refresh");
                s.waiters -= 1;
                return RefreshOutcome {
                    error: None,
                    skipped: true,
                    was_first: false,
                };
            }
        }
    }

    /// Drop completed states that nobody waits on and that have aged out.
    pub async fn cleanup(&self) {
        let mut stale: Vec<String> = Vec::new();
        for entry in self.states.iter() {
            let s = entry.value().lock().await;
            if s.waiters == 0 {
                if let Phase::Done { at, .. } = s.phase {
                    if at.elapsed() > STATE_MAX_AGE {
                        stale.push(entry.key().clone());
                    }
                }
            }
        }
        for key in stale {
            self.states.remove(&key);
        }
    }

    /// Number of tracked states (test observability).
    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    /// Background cleanup loop; exits when the shutdown signal flips.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(STATE_MAX_AGE);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cleanup().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn first_caller_executes_work() {
        let sf = SingleFlight::new();
        let calls = AtomicUsize::new(0);
        let outcome = sf
            .try_refresh("a", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(outcome.was_first);
        assert!(!outcome.skipped);
        assert!(outcome.error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_collapse_to_one_execution() {
        let sf = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = sf.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                sf.try_refresh("acct", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok(())
                })
                .await
            }));
        }

        let outcomes: Vec<RefreshOutcome> =
            futures::future::join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1, "work must run exactly once");
        assert_eq!(outcomes.iter().filter(|o| o.was_first).count(), 1);
        for o in outcomes.iter().filter(|o| !o.was_first) {
            assert!(o.error.is_none());
        }
    }

    #[tokio::test]
    async fn waiters_receive_the_runner_error() {
        let sf = Arc::new(SingleFlight::new());

        let runner = {
            let sf = sf.clone();
            tokio::spawn(async move {
                sf.try_refresh("acct", || async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    anyhow::bail!("oidc says no")
                })
                .await
            })
        };
        // Give the runner time to take the Running phase.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let waiter = sf.try_refresh("acct", || async { Ok(()) }).await;

        let runner = runner.await.unwrap();
        assert!(runner.was_first);
        assert!(runner.error.as_deref().unwrap().contains("oidc says no"));
        assert!(!waiter.was_first);
        assert_eq!(waiter.error, runner.error, "waiter sees the same error value");
    }

    #[tokio::test]
    async fn sticky_success_suppresses_immediate_retry() {
        let sf = SingleFlight::new();
        let calls = AtomicUsize::new(0);

        let first = sf
            .try_refresh("a", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        let second = sf
            .try_refresh("a", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(first.was_first);
        assert!(second.skipped, "second call within 5 s must be skipped");
        assert!(!second.was_first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_collapse() {
        let sf = SingleFlight::new();
        let calls = AtomicUsize::new(0);
        for id in ["a", "b"] {
            let o = sf
                .try_refresh(id, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert!(o.was_first);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn waiter_timeout_returns_skipped_without_error() {
        let sf = Arc::new(SingleFlight::with_wait_params(
            Duration::from_millis(20),
            Duration::from_millis(60),
        ));

        let runner = {
            let sf = sf.clone();
            tokio::spawn(async move {
                sf.try_refresh("slow", || async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let waiter = sf.try_refresh("slow", || async { Ok(()) }).await;

        assert!(waiter.skipped);
        assert!(waiter.error.is_none());
        assert!(!waiter.was_first);
        let _ = runner.await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_retains_young_and_waited_states() {
        let sf = SingleFlight::new();
        sf.try_refresh("young", || async { Ok(()) }).await;
        assert_eq!(sf.tracked(), 1);
        // Young done-state survives cleanup.
        sf.cleanup().await;
        assert_eq!(sf.tracked(), 1);
    }
}
