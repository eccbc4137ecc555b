use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// What happens to a step whose connector call failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRetryMode {
    /// Re-enqueue until `step_max_attempts` is reached, then dead-letter
    #[default]
    Bounded,
    /// Dead-letter on the first failure
    Immediate,
}

/// Engine tuning, loaded from the `[engine]` section of the server config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,

    #[serde(default = "default_step_max_attempts")]
    pub step_max_attempts: u32,

    #[serde(default)]
    pub step_retry: StepRetryMode,

    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,

    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: usize,

    /// Connector key to secret, handed to actions as `ctx.credential`
    #[serde(default, skip_serializing)]
    pub credentials: BTreeMap<String, String>,
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_transaction_timeout_ms() -> u64 {
    20_000
}

fn default_step_max_attempts() -> u32 {
    3
}

fn default_dispatch_interval_ms() -> u64 {
    1_000
}

fn default_reconcile_interval_ms() -> u64 {
    30_000
}

fn default_dispatch_batch_size() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: default_worker_concurrency(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
            step_max_attempts: default_step_max_attempts(),
            step_retry: StepRetryMode::default(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            dispatch_batch_size: default_dispatch_batch_size(),
            credentials: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    /// Attempts a new step gets; immediate mode never retries
    pub fn effective_max_attempts(&self) -> u32 {
        match self.step_retry {
            StepRetryMode::Bounded => self.step_max_attempts.max(1),
            StepRetryMode::Immediate => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_value(serde_json::json!({"step_retry": "immediate"})).unwrap();

        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.transaction_timeout(), Duration::from_secs(20));
        assert_eq!(config.step_retry, StepRetryMode::Immediate);
        assert_eq!(config.effective_max_attempts(), 1);
    }

    #[test]
    fn test_bounded_never_below_one_attempt() {
        let config = EngineConfig {
            step_max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(config.effective_max_attempts(), 1);
        assert_eq!(EngineConfig::default().effective_max_attempts(), 3);
    }
}
