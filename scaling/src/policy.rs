use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use ledger::QuotaAccount;
use log::{debug, warn};
use registry::{Worker, WorkerStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Stagger policy knobs, from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ScalingConfig {
    /// How much consecutive session windows overlap, so the next session is
    /// warm before the previous one drains.
    pub handover_overlap: Duration,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            handover_overlap: Duration::from_secs(120),
        }
    }
}

/// One recommended session window for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationEntry {
    pub provider: String,
    pub account_id: String,
    pub activate_at: DateTime<Utc>,
    pub deactivate_at: DateTime<Utc>,
}

/// The full rotation recommendation handed to the provisioning collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationSchedule {
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<ActivationEntry>,
}

/// Computes activation schedules from registry and ledger snapshots.
pub struct PolicyEngine {
    cfg: ScalingConfig,
    tx: mpsc::Sender<ActivationSchedule>,
}

impl PolicyEngine {
    pub fn new(cfg: ScalingConfig, tx: mpsc::Sender<ActivationSchedule>) -> Self {
        Self { cfg, tx }
    }

    /// Recalculates on a new registration and emits the schedule.
    pub async fn on_worker_registered(
        &self,
        workers: &[Worker],
        accounts: &[QuotaAccount],
        now: DateTime<Utc>,
    ) {
        let schedule = self.recalculate(workers, accounts, now);
        self.emit(schedule).await;
    }

    /// Staggers same-provider accounts' session windows to approximate
    /// continuous wall-clock coverage from many short sessions.
    ///
    /// Accounts with a live session anchor the chain; idle accounts are
    /// queued behind it ordered by remaining weekly headroom, each window
    /// overlapping the previous by the configured handover. Accounts without
    /// weekly headroom are left out entirely.
    pub fn recalculate(
        &self,
        workers: &[Worker],
        accounts: &[QuotaAccount],
        now: DateTime<Utc>,
    ) -> ActivationSchedule {
        let overlap = chrono::Duration::from_std(self.cfg.handover_overlap)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));

        let mut by_provider: BTreeMap<&str, Vec<&QuotaAccount>> = BTreeMap::new();
        for account in accounts {
            by_provider
                .entry(account.key.provider.as_str())
                .or_default()
                .push(account);
        }

        let mut entries = Vec::new();

        for (provider, provider_accounts) in by_provider {
            // A session only counts as covering if some worker of the account
            // is actually reachable.
            let is_covering = |account: &QuotaAccount| {
                account.session_started_at.is_some()
                    && workers.iter().any(|worker| {
                        worker.account_key() == account.key
                            && worker.status != WorkerStatus::Offline
                    })
            };

            let mut cursor = now;

            for account in provider_accounts.iter().filter(|a| is_covering(a)) {
                let deactivate_at = account.next_auto_shutdown_at.unwrap_or_else(|| {
                    now + chrono::Duration::seconds(account.remaining_session_seconds() as i64)
                });

                entries.push(ActivationEntry {
                    provider: provider.to_string(),
                    account_id: account.key.account_id.clone(),
                    activate_at: account.session_started_at.unwrap_or(now),
                    deactivate_at,
                });

                cursor = cursor.max(deactivate_at - overlap);
            }

            // Idle accounts queue up behind the live coverage, the freshest
            // weekly budget first.
            let mut idle: Vec<&QuotaAccount> = provider_accounts
                .iter()
                .copied()
                .filter(|a| !is_covering(a))
                .filter(|a| a.remaining_weekly_seconds() > 0)
                .collect();
            idle.sort_by_key(|a| std::cmp::Reverse(a.remaining_weekly_seconds()));

            for account in idle {
                let window_seconds = account
                    .limits
                    .session_cap_seconds()
                    .min(account.remaining_weekly_seconds());
                let activate_at = cursor;
                let deactivate_at = activate_at + chrono::Duration::seconds(window_seconds as i64);

                entries.push(ActivationEntry {
                    provider: provider.to_string(),
                    account_id: account.key.account_id.clone(),
                    activate_at,
                    deactivate_at,
                });

                cursor = deactivate_at - overlap;
            }
        }

        debug!(entries = entries.len(); "activation schedule recalculated");

        ActivationSchedule {
            generated_at: now,
            entries,
        }
    }

    /// Hands the schedule to the provisioning collaborator's channel.
    pub async fn emit(&self, schedule: ActivationSchedule) {
        if self.tx.send(schedule).await.is_err() {
            warn!("provisioning collaborator dropped the schedule channel");
        }
    }
}
