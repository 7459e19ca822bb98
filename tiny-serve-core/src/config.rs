//! Configuration for the admission scheduler and the instance pool.
//!
//! All budgets are validated eagerly at construction; a bad configuration is
//! a startup error, never a request-time error.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::instance::InstanceRole;
use crate::selector::SelectionPolicy;

/// Default settings matching the reference implementation.
pub mod settings {
    /// Maximum number of requests running concurrently.
    pub const MAX_RUNNING_REQUESTS: usize = 32;
    /// Max tokens that can be batched together in a single cycle.
    pub const MAX_TOKENS_PER_BATCH: usize = 4096;
    /// Max prompt tokens admitted for one request in one cycle.
    pub const MAX_PROMPT_TOKENS: usize = 2048;
    /// Prompts longer than this are admitted in chunks when chunking is on.
    pub const CHUNK_TOKEN_THRESHOLD: usize = 512;
    /// Age after which a waiting request starts receiving a priority boost.
    pub const MAX_QUEUE_AGE_MS: u64 = 30_000;
    /// Cadence of the starvation-prevention pass.
    pub const AGING_INTERVAL_MS: u64 = 1_000;
    /// Scheduling loop tick.
    pub const CYCLE_INTERVAL_MS: u64 = 10;
    /// Consecutive non-admission cycles before a deadline request fails.
    pub const DEADLINE_FAIL_CYCLES: u32 = 10;
    /// How long cached scheduler outputs are retained.
    pub const OUTPUT_RETENTION_MS: u64 = 60_000;
    /// Rolling window of cycle latencies kept for observability.
    pub const LATENCY_WINDOW: usize = 100;
    /// Interval between instance health probes.
    pub const HEALTH_CHECK_INTERVAL_MS: u64 = 5_000;
    /// Per-probe timeout.
    pub const HEALTH_CHECK_TIMEOUT_MS: u64 = 2_000;
    /// Consecutive probe failures before an instance is deregistered.
    pub const HEALTH_FAILURE_THRESHOLD: u32 = 3;
}

/// Errors detected while validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be positive")]
    NonPositiveBudget(&'static str),
    #[error("{0} must be a non-zero interval")]
    ZeroInterval(&'static str),
    #[error("chunk_token_threshold ({threshold}) exceeds max_tokens_per_batch ({budget})")]
    ChunkExceedsBudget { threshold: usize, budget: usize },
    #[error(
        "max_prompt_tokens ({limit}) exceeds max_tokens_per_batch ({budget}) \
         with chunked prefill disabled"
    )]
    PromptExceedsBudget { limit: usize, budget: usize },
    #[error("unrecognized preemption mode {0:?} (expected \"swap\" or \"recompute\")")]
    InvalidPreemptionMode(String),
}

/// What happens to a preempted request's engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreemptionMode {
    /// The engine hands back an opaque saved state for later resumption.
    Swap,
    /// State is discarded; the request restarts its prefill.
    Recompute,
}

impl FromStr for PreemptionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "swap" => Ok(PreemptionMode::Swap),
            "recompute" => Ok(PreemptionMode::Recompute),
            other => Err(ConfigError::InvalidPreemptionMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServeConfig {
    pub max_running_requests: usize,
    pub max_tokens_per_batch: usize,
    pub max_prompt_tokens: usize,
    pub preemption_enabled: bool,
    pub preemption_mode: PreemptionMode,
    pub chunked_prefill_enabled: bool,
    pub chunk_token_threshold: usize,
    pub starvation_prevention: bool,
    pub deadline_scheduling: bool,
    /// Admission queue capacity; `None` means unbounded.
    pub queue_capacity: Option<usize>,
    pub max_queue_age_ms: u64,
    pub aging_interval_ms: u64,
    pub cycle_interval_ms: u64,
    pub deadline_fail_cycles: u32,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            max_running_requests: settings::MAX_RUNNING_REQUESTS,
            max_tokens_per_batch: settings::MAX_TOKENS_PER_BATCH,
            max_prompt_tokens: settings::MAX_PROMPT_TOKENS,
            preemption_enabled: true,
            preemption_mode: PreemptionMode::Swap,
            chunked_prefill_enabled: true,
            chunk_token_threshold: settings::CHUNK_TOKEN_THRESHOLD,
            starvation_prevention: true,
            deadline_scheduling: false,
            queue_capacity: None,
            max_queue_age_ms: settings::MAX_QUEUE_AGE_MS,
            aging_interval_ms: settings::AGING_INTERVAL_MS,
            cycle_interval_ms: settings::CYCLE_INTERVAL_MS,
            deadline_fail_cycles: settings::DEADLINE_FAIL_CYCLES,
        }
    }
}

impl ServeConfig {
    /// Reject invalid budgets before any request is accepted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_running_requests == 0 {
            return Err(ConfigError::NonPositiveBudget("max_running_requests"));
        }
        if self.max_tokens_per_batch == 0 {
            return Err(ConfigError::NonPositiveBudget("max_tokens_per_batch"));
        }
        if self.max_prompt_tokens == 0 {
            return Err(ConfigError::NonPositiveBudget("max_prompt_tokens"));
        }
        if self.chunk_token_threshold == 0 {
            return Err(ConfigError::NonPositiveBudget("chunk_token_threshold"));
        }
        if self.chunked_prefill_enabled && self.chunk_token_threshold > self.max_tokens_per_batch {
            return Err(ConfigError::ChunkExceedsBudget {
                threshold: self.chunk_token_threshold,
                budget: self.max_tokens_per_batch,
            });
        }
        // without chunking, an admission can cost up to max_prompt_tokens in
        // one cycle; a cost the batch can never hold would be unschedulable
        if !self.chunked_prefill_enabled && self.max_prompt_tokens > self.max_tokens_per_batch {
            return Err(ConfigError::PromptExceedsBudget {
                limit: self.max_prompt_tokens,
                budget: self.max_tokens_per_batch,
            });
        }
        if self.cycle_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("cycle_interval_ms"));
        }
        if self.aging_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("aging_interval_ms"));
        }
        if self.deadline_fail_cycles == 0 {
            return Err(ConfigError::NonPositiveBudget("deadline_fail_cycles"));
        }
        Ok(())
    }

    pub fn max_queue_age(&self) -> Duration {
        Duration::from_millis(self.max_queue_age_ms)
    }

    pub fn aging_interval(&self) -> Duration {
        Duration::from_millis(self.aging_interval_ms)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }
}

/// Operator-provided description of one serving instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceDescriptor {
    pub id: String,
    pub role: InstanceRole,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub handshake_port: u16,
    #[serde(default)]
    pub notify_port: u16,
    #[serde(default = "one")]
    pub tp_size: u32,
    #[serde(default = "one")]
    pub dp_size: u32,
    #[serde(default)]
    pub dp_rank: u32,
}

fn one() -> u32 {
    1
}

/// Instance pool configuration for disaggregated serving.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InstancePoolConfig {
    pub prefill_instances: Vec<InstanceDescriptor>,
    pub decode_instances: Vec<InstanceDescriptor>,
    pub prefill_policy: SelectionPolicy,
    pub decode_policy: SelectionPolicy,
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    pub health_failure_threshold: u32,
}

impl Default for InstancePoolConfig {
    fn default() -> Self {
        Self {
            prefill_instances: Vec::new(),
            decode_instances: Vec::new(),
            prefill_policy: SelectionPolicy::RoundRobin,
            decode_policy: SelectionPolicy::LeastLoaded,
            health_check_interval_ms: settings::HEALTH_CHECK_INTERVAL_MS,
            health_check_timeout_ms: settings::HEALTH_CHECK_TIMEOUT_MS,
            health_failure_threshold: settings::HEALTH_FAILURE_THRESHOLD,
        }
    }
}

impl InstancePoolConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_roundtrip() {
        let mut cfg = ServeConfig::default();
        cfg.deadline_scheduling = true;
        cfg.preemption_mode = PreemptionMode::Recompute;
        let json = serde_json::to_string(&cfg).unwrap();
        let decoded: ServeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, decoded);
    }

    #[test]
    fn test_validate_rejects_zero_budgets() {
        let cfg = ServeConfig { max_tokens_per_batch: 0, ..Default::default() };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NonPositiveBudget("max_tokens_per_batch"))
        ));

        let cfg = ServeConfig { max_running_requests: 0, ..Default::default() };
        assert!(cfg.validate().is_err());

        assert!(ServeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_chunk() {
        let cfg = ServeConfig {
            chunked_prefill_enabled: true,
            chunk_token_threshold: 8192,
            max_tokens_per_batch: 4096,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::ChunkExceedsBudget { .. })));
    }

    #[test]
    fn test_validate_rejects_unchunkable_prompt_budget() {
        let cfg = ServeConfig {
            chunked_prefill_enabled: false,
            max_prompt_tokens: 4096,
            max_tokens_per_batch: 2048,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::PromptExceedsBudget { limit: 4096, budget: 2048 })
        ));

        // with chunking on the same pair is fine: admissions cap at the
        // chunk threshold
        let cfg = ServeConfig {
            chunked_prefill_enabled: true,
            max_prompt_tokens: 4096,
            max_tokens_per_batch: 2048,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_preemption_mode_from_str() {
        assert_eq!("swap".parse::<PreemptionMode>().unwrap(), PreemptionMode::Swap);
        assert_eq!(
            "recompute".parse::<PreemptionMode>().unwrap(),
            PreemptionMode::Recompute
        );
        assert!("discard".parse::<PreemptionMode>().is_err());
    }
}
