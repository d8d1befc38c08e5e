use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::OrderSide;

/// Task priority, Critical schedules ahead of everything else
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Critical => write!(f, "critical"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::Low => write!(f, "low"),
        }
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    /// Failed at least once, waiting out backoff before the next attempt
    Retrying,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Queued => write!(f, "queued"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Retrying => write!(f, "retrying"),
        }
    }
}

/// The closed set of account-scoped jobs the coordinator dispatches.
///
/// Each variant maps to a resource key; two tasks sharing a key never run
/// concurrently for the same account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Initiate a new execution plan from a rebalance delta
    Rebalance {
        symbol: String,
        side: OrderSide,
        total_amount: Decimal,
        atr_pct: Decimal,
    },
    /// Drive the account's due slices through one scheduling pass
    AdvanceSlices,
    /// Probe gateway liveness and balances for the account
    HealthCheck,
    /// Operator purge of failed plans so a new plan may be initiated
    PurgeFailedPlans { symbol: String },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Rebalance { .. } => "rebalance",
            TaskKind::AdvanceSlices => "advance_slices",
            TaskKind::HealthCheck => "health_check",
            TaskKind::PurgeFailedPlans { .. } => "purge_failed_plans",
        }
    }

    /// Mutual-exclusion key. Everything that mutates execution state for an
    /// account shares the "execution" key.
    pub fn resource_key(&self) -> &'static str {
        match self {
            TaskKind::Rebalance { .. }
            | TaskKind::AdvanceSlices
            | TaskKind::PurgeFailedPlans { .. } => "execution",
            TaskKind::HealthCheck => "health",
        }
    }
}

/// An account-scoped unit of work managed by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountTask {
    pub id: Uuid,
    pub account_id: String,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub state: TaskState,
    pub attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    /// Recurrence interval; a successful run enqueues the next occurrence
    pub every_secs: Option<u64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl AccountTask {
    pub fn new(account_id: &str, kind: TaskKind, priority: TaskPriority) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            kind,
            priority,
            state: TaskState::Queued,
            attempts: 0,
            scheduled_at: now,
            every_secs: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = scheduled_at;
        self
    }

    pub fn recurring(mut self, every_secs: u64) -> Self {
        self.every_secs = Some(every_secs);
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, TaskState::Queued | TaskState::Retrying) && self.scheduled_at <= now
    }

    pub fn resource_key(&self) -> (String, &'static str) {
        (self.account_id.clone(), self.kind.resource_key())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
