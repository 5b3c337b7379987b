use serde::{Deserialize, Serialize};

use fleetflow_model::HuntRateLimit;

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so deployments can override a single section
/// without supplying a full configuration payload.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Flow lease TTL, acquisition retries and housekeeping cadence.
    pub lease: LeaseConfig,
    /// Worker pool sizing and channel polling.
    pub scheduler: SchedulerConfig,
    /// Per-flow limits: request TTL, log retention, transition rounds.
    pub flows: FlowConfig,
    /// Duplicate launch suppression.
    pub throttle: ThrottleConfig,
    /// Hunt expansion cadence and defaults for new hunts.
    pub hunts: HuntConfig,
    /// Optimistic write retry policy.
    pub retry: RetryConfig,
    /// In-process event bus sizing.
    pub events: EventsConfig,
}

/// Lease/heartbeat tuning for flow workers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// TTL for flow leases (seconds)
    pub lease_ttl_secs: i64,
    /// How many times a worker tries to take a busy lease before giving up
    pub acquire_attempts: u32,
    /// Pause between acquisition attempts (ms)
    pub acquire_backoff_ms: u64,
    /// Housekeeping cadence for request expiry and orphan recovery (ms)
    pub housekeeper_interval_ms: u64,
}

impl LeaseConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 30,
            acquire_attempts: 3,
            acquire_backoff_ms: 25,
            housekeeper_interval_ms: 15_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub workers: usize,
    /// Maximum responses pulled from the channel per poll.
    pub poll_batch_size: usize,
    pub poll_interval_ms: u64,
    /// Delay before re-queueing a flow whose lease was busy.
    pub busy_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_batch_size: 256,
            poll_interval_ms: 50,
            busy_backoff_ms: 100,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Requests unanswered after this many seconds fail the flow.
    pub request_ttl_secs: i64,
    pub max_log_entries: usize,
    /// Upper bound on local hops processed in one lease.
    pub max_transition_rounds: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            request_ttl_secs: 60 * 60 * 24 * 7,
            max_log_entries: 200,
            max_transition_rounds: 64,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Window in which an identical launch against the same client is
    /// rejected. Zero disables duplicate suppression.
    pub dup_interval_secs: i64,
}

impl ThrottleConfig {
    pub fn window(&self) -> Option<chrono::Duration> {
        (self.dup_interval_secs > 0)
            .then(|| chrono::Duration::seconds(self.dup_interval_secs))
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            dup_interval_secs: 20 * 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HuntConfig {
    pub tick_interval_ms: u64,
    /// Applied to hunts created without an explicit rate limit.
    pub default_rate_limit: HuntRateLimit,
    pub default_max_error_fraction: f64,
    /// Auto-pause only considers hunts with at least this many finished
    /// flows.
    pub min_finished_for_error_rate: u64,
}

impl Default for HuntConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            default_rate_limit: HuntRateLimit {
                max_new_per_interval: Some(100),
                interval_secs: 60,
                max_concurrent: Some(1_000),
            },
            default_max_error_fraction: 1.0,
            min_finished_for_error_rate: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> core::time::Duration {
        core::time::Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> core::time::Duration {
        core::time::Duration::from_millis(self.backoff_max_ms)
    }

    /// Exponential delay for the given (1-based) attempt with jitter applied.
    pub fn delay_for(&self, attempt: u16) -> core::time::Duration {
        use rand::Rng;

        let exp = u32::from(attempt.saturating_sub(1)).min(16);
        let base = self.backoff_base_ms.saturating_mul(1u64 << exp);
        let capped = base.min(self.backoff_max_ms);
        let spread = (capped as f64 * f64::from(self.jitter_ratio)) as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::rng().random_range(0..=spread)
        };
        core::time::Duration::from_millis(capped.saturating_add(jitter))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff_base_ms: 2,
            backoff_max_ms: 200,
            jitter_ratio: 0.25,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_sections_keep_defaults() {
        let cfg: OrchestratorConfig = serde_json::from_str(
            r#"{"scheduler": {"workers": 9}, "throttle": {"dup_interval_secs": 0}}"#,
        )
        .expect("config");
        assert_eq!(cfg.scheduler.workers, 9);
        assert_eq!(cfg.scheduler.poll_batch_size, 256);
        assert!(cfg.throttle.window().is_none());
        assert_eq!(cfg.lease.lease_ttl_secs, 30);
    }

    #[test]
    fn retry_delay_is_capped() {
        let retry = RetryConfig {
            max_attempts: 10,
            backoff_base_ms: 10,
            backoff_max_ms: 50,
            jitter_ratio: 0.0,
        };
        assert_eq!(retry.delay_for(1).as_millis(), 10);
        assert_eq!(retry.delay_for(2).as_millis(), 20);
        assert_eq!(retry.delay_for(9).as_millis(), 50);
    }
}
