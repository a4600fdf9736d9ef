use std::fmt;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use store::Record;

/// Identifies one provider account. All quota state is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    pub provider: String,
    pub account_id: String,
}

impl AccountKey {
    pub fn new(provider: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            account_id: account_id.into(),
        }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.account_id)
    }
}

/// Per-provider ceilings and the safety margin, loaded from configuration.
///
/// Different providers impose different real limits, so none of these are
/// constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProviderLimits {
    pub session_limit_seconds: u64,
    pub weekly_limit_seconds: u64,
    /// Fraction of the real limit kept in reserve, in `[0, 1)`.
    pub safety_margin_ratio: f64,
}

impl ProviderLimits {
    /// The session ceiling after the safety margin: `limit × (1 − margin)`.
    pub fn session_cap_seconds(&self) -> u64 {
        apply_margin(self.session_limit_seconds, self.safety_margin_ratio)
    }

    /// The weekly ceiling after the safety margin.
    pub fn weekly_cap_seconds(&self) -> u64 {
        apply_margin(self.weekly_limit_seconds, self.safety_margin_ratio)
    }
}

fn apply_margin(limit: u64, margin: f64) -> u64 {
    let margin = margin.clamp(0.0, 1.0);
    (limit as f64 * (1.0 - margin)).floor() as u64
}

/// Per-provider limit configuration with a fallback for unlisted providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderLimitsMap {
    pub default: ProviderLimits,
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ProviderLimits>,
}

impl ProviderLimitsMap {
    pub fn new(default: ProviderLimits) -> Self {
        Self {
            default,
            providers: std::collections::HashMap::new(),
        }
    }

    /// The limits for `provider`, falling back to the default.
    pub fn for_provider(&self, provider: &str) -> ProviderLimits {
        self.providers.get(provider).copied().unwrap_or(self.default)
    }
}

/// One provider account's quota counters.
///
/// Session fields reset when the session explicitly ends; weekly fields reset
/// on the fixed weekly boundary. Usage is monotonic within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaAccount {
    pub key: AccountKey,
    pub limits: ProviderLimits,
    pub session_started_at: Option<DateTime<Utc>>,
    pub session_used_seconds: u64,
    pub weekly_used_seconds: u64,
    /// Start of the accounting week (Monday 00:00 UTC).
    pub week_start: DateTime<Utc>,
    pub next_auto_shutdown_at: Option<DateTime<Utc>>,
}

impl QuotaAccount {
    pub fn new(key: AccountKey, limits: ProviderLimits, now: DateTime<Utc>) -> Self {
        Self {
            key,
            limits,
            session_started_at: None,
            session_used_seconds: 0,
            weekly_used_seconds: 0,
            week_start: week_start(now),
            next_auto_shutdown_at: None,
        }
    }

    /// Seconds left under the session safety cap.
    pub fn remaining_session_seconds(&self) -> u64 {
        self.limits
            .session_cap_seconds()
            .saturating_sub(self.session_used_seconds)
    }

    /// Seconds left under the weekly safety cap.
    pub fn remaining_weekly_seconds(&self) -> u64 {
        self.limits
            .weekly_cap_seconds()
            .saturating_sub(self.weekly_used_seconds)
    }

    /// Whether new work may be dispatched against this account.
    ///
    /// Both windows must be strictly under their safety caps.
    pub fn admits(&self) -> bool {
        self.remaining_session_seconds() > 0 && self.remaining_weekly_seconds() > 0
    }

    /// Whether `now` has rolled past this account's accounting week.
    pub fn week_elapsed(&self, now: DateTime<Utc>) -> bool {
        week_start(now) > self.week_start
    }
}

impl Record for QuotaAccount {
    fn key(&self) -> String {
        self.key.to_string()
    }
}

/// The fixed weekly boundary: Monday 00:00 UTC of the week containing `now`.
pub(crate) fn week_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let monday = now.date_naive().week(Weekday::Mon).first_day();
    monday.and_time(NaiveTime::MIN).and_utc()
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

    #[test]
    fn margin_is_applied_to_both_windows() {
        let limits = limits();
        assert_eq!(limits.session_cap_seconds(), 70);
        assert_eq!(limits.weekly_cap_seconds(), 700);
    }

    #[test]
    fn week_start_is_monday_midnight() {
        // 2026-08-07 is a Friday.
        let now = Utc.with_ymd_and_hms(2026, 8, 7, 15, 30, 0).unwrap();
        let start = week_start(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 8, 3, 0, 0, 0).unwrap());

        let sunday = Utc.with_ymd_and_hms(2026, 8, 9, 23, 59, 59).unwrap();
        assert_eq!(week_start(sunday), start);

        let next_monday = Utc.with_ymd_and_hms(2026, 8, 10, 0, 0, 0).unwrap();
        assert_ne!(week_start(next_monday), start);
    }

    #[test]
    fn admits_requires_headroom_in_both_windows() {
        let now = Utc.with_ymd_and_hms(2026, 8, 7, 0, 0, 0).unwrap();
        let mut account = QuotaAccount::new(AccountKey::new("colab", "a"), limits(), now);
        assert!(account.admits());

        account.session_used_seconds = 70;
        assert!(!account.admits());

        account.session_used_seconds = 0;
        account.weekly_used_seconds = 700;
        assert!(!account.admits());
    }
}
