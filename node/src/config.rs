use std::{path::PathBuf, time::Duration};

use ledger::{ProviderLimits, ProviderLimitsMap};
use registry::HealthConfig;
use rounds::RoundConfig;
use scaling::ScalingConfig;
use scheduler::SchedulerConfig;
use serde::Deserialize;

/// The coordinator's full configuration, loaded from a JSON file.
///
/// Provider limits are always configuration: every provider imposes its own
/// real ceilings and the safety margin differs between them.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    pub limits: ProviderLimitsMap,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub rounds: RoundsSection,
    #[serde(default)]
    pub scaling: ScalingSection,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub heartbeat_interval_seconds: u64,
    pub missed_heartbeats: u32,
    pub offline_retention_seconds: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 60,
            missed_heartbeats: 3,
            offline_retention_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub max_retries: u32,
    pub dispatch_timeout_seconds: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            dispatch_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RoundsSection {
    pub round_deadline_seconds: u64,
    pub max_consecutive_failures: u32,
    pub retry_backoff_base_seconds: u64,
    pub retry_backoff_cap_seconds: u64,
}

impl Default for RoundsSection {
    fn default() -> Self {
        Self {
            round_deadline_seconds: 300,
            max_consecutive_failures: 3,
            retry_backoff_base_seconds: 5,
            retry_backoff_cap_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ScalingSection {
    pub handover_overlap_seconds: u64,
}

impl Default for ScalingSection {
    fn default() -> Self {
        Self {
            handover_overlap_seconds: 120,
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

impl CoordinatorConfig {
    /// Loads the configuration from a JSON file.
    ///
    /// # Errors
    /// Returns a human-readable string if the file cannot be read or parsed.
    pub fn load(path: &str) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("cannot read '{path}': {e}"))?;

        serde_json::from_str(&content).map_err(|e| format!("invalid config '{path}': {e}"))
    }

    /// A minimal config for one provider, useful for tests and local runs.
    pub fn single_provider(state_dir: PathBuf, limits: ProviderLimits) -> Self {
        Self {
            listen_addr: default_listen_addr(),
            state_dir,
            limits: ProviderLimitsMap::new(limits),
            health: HealthSection::default(),
            dispatch: DispatchSection::default(),
            rounds: RoundsSection::default(),
            scaling: ScalingSection::default(),
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            heartbeat_interval: Duration::from_secs(self.health.heartbeat_interval_seconds),
            missed_heartbeats: self.health.missed_heartbeats,
            offline_retention: Duration::from_secs(self.health.offline_retention_seconds),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_retries: self.dispatch.max_retries,
            dispatch_timeout: Duration::from_secs(self.dispatch.dispatch_timeout_seconds),
        }
    }

    pub fn round_config(&self) -> RoundConfig {
        RoundConfig {
            round_deadline: Duration::from_secs(self.rounds.round_deadline_seconds),
            max_consecutive_failures: self.rounds.max_consecutive_failures,
            retry_backoff_base: Duration::from_secs(self.rounds.retry_backoff_base_seconds),
            retry_backoff_cap: Duration::from_secs(self.rounds.retry_backoff_cap_seconds),
        }
    }

    pub fn scaling_config(&self) -> ScalingConfig {
        ScalingConfig {
            handover_overlap: Duration::from_secs(self.scaling.handover_overlap_seconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let json = r#"{
            "limits": {
                "default": {
                    "session_limit_seconds": 43200,
                    "weekly_limit_seconds": 108000,
                    "safety_margin_ratio": 0.3
                },
                "providers": {
                    "kaggle": {
                        "session_limit_seconds": 32400,
                        "weekly_limit_seconds": 108000,
                        "safety_margin_ratio": 0.08
                    }
                }
            }
        }"#;

        let config: CoordinatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:7400");
        assert_eq!(config.health.missed_heartbeats, 3);
        assert_eq!(config.limits.for_provider("kaggle").safety_margin_ratio, 0.08);
        assert_eq!(
            config.limits.for_provider("colab").session_limit_seconds,
            43200
        );
    }
}
