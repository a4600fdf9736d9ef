use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use store::Journal;
use tokio::sync::mpsc;

use crate::{
    AccountKey, ProviderLimits, QuotaAccount, QuotaErr, QuotaWindow, Result,
    account::week_start,
    shutdown::{DrainSignal, ShutdownTimers},
};

/// The quota ledger: sole writer of per-account usage state.
///
/// Mutations for one account are serialized through a per-account write gate;
/// the committed map is readable synchronously and may be slightly stale,
/// which is fine because dispatch admission is re-checked on the write path.
pub struct Ledger {
    accounts: RwLock<HashMap<AccountKey, QuotaAccount>>,
    gates: Mutex<HashMap<AccountKey, Arc<tokio::sync::Mutex<()>>>>,
    journal: Journal<QuotaAccount>,
    drain_tx: mpsc::Sender<DrainSignal>,
    timers: ShutdownTimers,
}

impl Ledger {
    /// Opens the ledger, replaying any persisted accounts.
    ///
    /// # Arguments
    /// * `state_dir` - Directory holding the accounts journal.
    /// * `drain_tx` - Channel the auto-shutdown timers signal on.
    pub async fn open(state_dir: &Path, drain_tx: mpsc::Sender<DrainSignal>) -> Result<Self> {
        let journal = Journal::open(state_dir.join("accounts.jsonl")).await?;
        let replayed = journal.replay().await?;

        let accounts: HashMap<_, _> = replayed
            .into_values()
            .map(|account: QuotaAccount| (account.key.clone(), account))
            .collect();

        if !accounts.is_empty() {
            info!(count = accounts.len(); "replayed quota accounts");
        }

        Ok(Self {
            accounts: RwLock::new(accounts),
            gates: Mutex::new(HashMap::new()),
            journal,
            drain_tx,
            timers: ShutdownTimers::default(),
        })
    }

    /// Creates the account if it does not exist yet.
    pub async fn open_account(
        &self,
        key: AccountKey,
        limits: ProviderLimits,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let gate = self.gate(&key);
        let _guard = gate.lock().await;

        if self.accounts.read().contains_key(&key) {
            return Ok(());
        }

        let account = QuotaAccount::new(key.clone(), limits, now);
        self.journal.append(&account).await?;
        self.accounts.write().insert(key, account);
        Ok(())
    }

    /// Marks the start of a new remote session and arms its auto-shutdown.
    ///
    /// Session counters reset; the previous shutdown timer (if any) is
    /// replaced.
    pub async fn begin_session(&self, key: &AccountKey, now: DateTime<Utc>) -> Result<()> {
        {
            let gate = self.gate(key);
            let _guard = gate.lock().await;

            let mut account = self.committed(key)?;
            account.session_started_at = Some(now);
            account.session_used_seconds = 0;
            account.next_auto_shutdown_at = None;

            self.journal.append(&account).await?;
            self.accounts.write().insert(key.clone(), account);
        }

        self.schedule_auto_shutdown(key, now).await?;
        Ok(())
    }

    /// Computes `session_start + session_limit × (1 − margin)` and arms a
    /// timer that emits a [`DrainSignal`] at that point.
    ///
    /// # Returns
    /// The instant the account's workers will be told to drain.
    pub async fn schedule_auto_shutdown(
        &self,
        key: &AccountKey,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let gate = self.gate(key);
        let _guard = gate.lock().await;

        let mut account = self.committed(key)?;
        let Some(started_at) = account.session_started_at else {
            return Err(QuotaErr::NoActiveSession(key.clone()));
        };

        let cap = account.limits.session_cap_seconds();
        let shutdown_at = started_at + chrono::Duration::seconds(cap as i64);
        account.next_auto_shutdown_at = Some(shutdown_at);

        self.journal.append(&account).await?;
        self.accounts.write().insert(key.clone(), account);

        let delay = (shutdown_at - now).to_std().unwrap_or(Duration::ZERO);
        self.timers.arm(key.clone(), delay, self.drain_tx.clone());

        debug!(account = key.to_string(), shutdown_at = shutdown_at.to_rfc3339();
            "auto-shutdown armed");
        Ok(shutdown_at)
    }

    /// Adds `elapsed_seconds` to the session and weekly counters.
    ///
    /// Fails closed: if the projected total would cross `limit × (1 − margin)`
    /// for either window, the counter is clamped at the cap, the account is
    /// signalled to drain, and `QuotaErr::Exceeded` is returned. The caller
    /// must treat that as a dispatch block, not a warning.
    pub async fn record_usage(
        &self,
        key: &AccountKey,
        elapsed_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let gate = self.gate(key);
        let _guard = gate.lock().await;

        let mut account = self.committed(key)?;

        // Weekly rollover happens lazily on the first usage past the boundary.
        if account.week_elapsed(now) {
            account.weekly_used_seconds = 0;
            account.week_start = week_start(now);
        }

        let session_cap = account.limits.session_cap_seconds();
        let weekly_cap = account.limits.weekly_cap_seconds();
        let projected_session = account.session_used_seconds.saturating_add(elapsed_seconds);
        let projected_weekly = account.weekly_used_seconds.saturating_add(elapsed_seconds);

        let exceeded = if projected_session > session_cap {
            Some((QuotaWindow::Session, projected_session, session_cap))
        } else if projected_weekly > weekly_cap {
            Some((QuotaWindow::Weekly, projected_weekly, weekly_cap))
        } else {
            None
        };

        account.session_used_seconds = projected_session.min(session_cap);
        account.weekly_used_seconds = projected_weekly.min(weekly_cap);

        self.journal.append(&account).await?;
        self.accounts.write().insert(key.clone(), account);

        match exceeded {
            None => Ok(()),
            Some((window, used, cap)) => {
                warn!(account = key.to_string(), window = window.to_string(), used, cap;
                    "usage crossed the safety cap, draining account");

                if self
                    .drain_tx
                    .send(DrainSignal {
                        account: key.clone(),
                    })
                    .await
                    .is_err()
                {
                    warn!("drain receiver dropped, quota drain signal lost");
                }

                Err(QuotaErr::Exceeded {
                    key: key.clone(),
                    window,
                    used,
                    cap,
                })
            }
        }
    }

    /// Ends the account's session: session counters reset, the auto-shutdown
    /// timer is cancelled.
    pub async fn end_session(&self, key: &AccountKey) -> Result<()> {
        let gate = self.gate(key);
        let _guard = gate.lock().await;

        let mut account = self.committed(key)?;
        account.session_started_at = None;
        account.session_used_seconds = 0;
        account.next_auto_shutdown_at = None;

        self.journal.append(&account).await?;
        self.accounts.write().insert(key.clone(), account);
        self.timers.cancel(key);
        Ok(())
    }

    /// Resets the weekly counter for one account.
    pub async fn reset_weekly(&self, key: &AccountKey, now: DateTime<Utc>) -> Result<()> {
        let gate = self.gate(key);
        let _guard = gate.lock().await;

        let mut account = self.committed(key)?;
        account.weekly_used_seconds = 0;
        account.week_start = week_start(now);

        self.journal.append(&account).await?;
        self.accounts.write().insert(key.clone(), account);
        Ok(())
    }

    /// Resets every account whose accounting week has rolled over.
    ///
    /// # Returns
    /// The number of accounts reset.
    pub async fn sweep_weekly(&self, now: DateTime<Utc>) -> Result<usize> {
        let due: Vec<AccountKey> = self
            .accounts
            .read()
            .values()
            .filter(|account| account.week_elapsed(now))
            .map(|account| account.key.clone())
            .collect();

        for key in &due {
            self.reset_weekly(key, now).await?;
        }

        Ok(due.len())
    }

    /// Whether dispatch against this account is currently permitted.
    ///
    /// Unknown accounts never admit work.
    pub fn admits(&self, key: &AccountKey) -> bool {
        self.accounts
            .read()
            .get(key)
            .is_some_and(QuotaAccount::admits)
    }

    /// Seconds left under the session safety cap, if the account exists.
    pub fn remaining_session_seconds(&self, key: &AccountKey) -> Option<u64> {
        self.accounts
            .read()
            .get(key)
            .map(QuotaAccount::remaining_session_seconds)
    }

    /// A point-in-time copy of one account.
    pub fn get(&self, key: &AccountKey) -> Option<QuotaAccount> {
        self.accounts.read().get(key).cloned()
    }

    /// A point-in-time copy of every account, for status and scaling.
    pub fn snapshot(&self) -> Vec<QuotaAccount> {
        self.accounts.read().values().cloned().collect()
    }

    fn committed(&self, key: &AccountKey) -> Result<QuotaAccount> {
        self.accounts
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| QuotaErr::UnknownAccount(key.clone()))
    }

    fn gate(&self, key: &AccountKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.gates
                .lock()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn limits() -> ProviderLimits {
        ProviderLimits {
            session_limit_seconds: 100,
            weekly_limit_seconds: 1000,
            safety_margin_ratio: 0.3,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 5, 12, 0, 0).unwrap()
    }

    async fn open_ledger(dir: &Path) -> (Ledger, mpsc::Receiver<DrainSignal>) {
        let (tx, rx) = mpsc::channel(8);
        let ledger = Ledger::open(dir, tx).await.unwrap();
        (ledger, rx)
    }

    #[tokio::test]
    async fn usage_past_margin_is_rejected_and_blocks_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, mut drain_rx) = open_ledger(dir.path()).await;

        let key = AccountKey::new("colab", "a");
        ledger.open_account(key.clone(), limits(), t0()).await.unwrap();
        ledger.begin_session(&key, t0()).await.unwrap();

        // sessionLimit=100, margin=0.3 -> effective cap 70s.
        let err = ledger.record_usage(&key, 71, t0()).await.unwrap_err();
        let QuotaErr::Exceeded { window, cap, .. } = err else {
            panic!("expected Exceeded, got {err:?}");
        };
        assert_eq!(window, QuotaWindow::Session);
        assert_eq!(cap, 70);

        assert!(!ledger.admits(&key));
        assert_eq!(drain_rx.recv().await.unwrap().account, key);
    }

    #[tokio::test]
    async fn usage_is_monotonic_and_never_exceeds_cap() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, _drain_rx) = open_ledger(dir.path()).await;

        let key = AccountKey::new("colab", "a");
        ledger.open_account(key.clone(), limits(), t0()).await.unwrap();
        ledger.begin_session(&key, t0()).await.unwrap();

        let mut last = 0;
        for elapsed in [10, 0, 25, 30, 40] {
            let _ = ledger.record_usage(&key, elapsed, t0()).await;
            let account = ledger.get(&key).unwrap();
            assert!(account.session_used_seconds >= last);
            assert!(account.session_used_seconds <= 70);
            last = account.session_used_seconds;
        }

        // Explicit session reset brings the counter back down.
        ledger.end_session(&key).await.unwrap();
        assert_eq!(ledger.get(&key).unwrap().session_used_seconds, 0);
    }

    #[tokio::test]
    async fn weekly_counter_rolls_over_at_the_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, _drain_rx) = open_ledger(dir.path()).await;

        let key = AccountKey::new("kaggle", "b");
        ledger.open_account(key.clone(), limits(), t0()).await.unwrap();
        ledger.begin_session(&key, t0()).await.unwrap();
        ledger.record_usage(&key, 50, t0()).await.unwrap();
        assert_eq!(ledger.get(&key).unwrap().weekly_used_seconds, 50);

        // New session next week; weekly usage resets lazily.
        ledger.end_session(&key).await.unwrap();
        let next_week = t0() + chrono::Duration::days(7);
        ledger.begin_session(&key, next_week).await.unwrap();
        ledger.record_usage(&key, 10, next_week).await.unwrap();

        let account = ledger.get(&key).unwrap();
        assert_eq!(account.weekly_used_seconds, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_shutdown_signals_drain_at_the_safety_cap() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, mut drain_rx) = open_ledger(dir.path()).await;

        let key = AccountKey::new("colab", "a");
        ledger.open_account(key.clone(), limits(), t0()).await.unwrap();
        ledger.begin_session(&key, t0()).await.unwrap();

        let account = ledger.get(&key).unwrap();
        let shutdown_at = account.next_auto_shutdown_at.unwrap();
        assert_eq!(shutdown_at, t0() + chrono::Duration::seconds(70));

        // Nothing before the cap...
        tokio::time::advance(Duration::from_secs(69)).await;
        assert!(drain_rx.try_recv().is_err());

        // ...and the drain signal right at it.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(drain_rx.recv().await.unwrap().account, key);
    }

    #[tokio::test]
    async fn accounts_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = AccountKey::new("colab", "a");

        {
            let (ledger, _rx) = open_ledger(dir.path()).await;
            ledger.open_account(key.clone(), limits(), t0()).await.unwrap();
            ledger.begin_session(&key, t0()).await.unwrap();
            ledger.record_usage(&key, 42, t0()).await.unwrap();
        }

        let (ledger, _rx) = open_ledger(dir.path()).await;
        let account = ledger.get(&key).unwrap();
        assert_eq!(account.session_used_seconds, 42);
        assert_eq!(account.weekly_used_seconds, 42);
    }
}
