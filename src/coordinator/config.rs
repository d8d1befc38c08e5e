use serde::Deserialize;

use crate::resilience::{BackoffStrategy, RetryPolicy};

/// Configuration for the task coordinator
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Maximum account tasks executing concurrently
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Attempts per task before it is marked Failed and alerted
    #[serde(default = "default_task_max_attempts")]
    pub task_max_attempts: u32,
    /// Backoff applied between task attempts
    #[serde(default = "default_requeue_policy")]
    pub requeue: RetryPolicy,
    /// How long terminal tasks stay queryable before archival (seconds)
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Upper bound on how long the run loop sleeps with nothing due (seconds)
    #[serde(default = "default_idle_wait_secs")]
    pub idle_wait_secs: u64,
}

fn default_max_concurrency() -> usize {
    3
}

fn default_task_max_attempts() -> u32 {
    3
}

fn default_requeue_policy() -> RetryPolicy {
    RetryPolicy {
        strategy: BackoffStrategy::Exponential,
        base_delay_ms: 5_000,
        max_delay_ms: 60_000,
        max_attempts: 3,
        jitter: true,
    }
}

fn default_retention_secs() -> u64 {
    86_400
}

fn default_idle_wait_secs() -> u64 {
    5
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            task_max_attempts: default_task_max_attempts(),
            requeue: default_requeue_policy(),
            retention_secs: default_retention_secs(),
            idle_wait_secs: default_idle_wait_secs(),
        }
    }
}
