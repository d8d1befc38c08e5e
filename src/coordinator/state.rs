//! Snapshot types for the operator-facing status surface.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

use crate::domain::{ExecutionPlan, OrderSide, PlanStatus, TaskState, VolatilityRegime};
use crate::resilience::CircuitBreakerState;

/// Per-state task counts
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskStateCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retrying: usize,
}

impl TaskStateCounts {
    pub fn record(&mut self, state: TaskState) {
        match state {
            TaskState::Queued => self.queued += 1,
            TaskState::Running => self.running += 1,
            TaskState::Succeeded => self.succeeded += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Retrying => self.retrying += 1,
        }
    }
}

/// Coordinator health aggregated per account and per task kind
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub queue_depth: usize,
    pub running: usize,
    pub available_workers: usize,
    pub by_account: HashMap<String, TaskStateCounts>,
    pub by_kind: HashMap<String, TaskStateCounts>,
    pub generated_at: DateTime<Utc>,
}

/// Progress of one execution plan
#[derive(Debug, Clone, Serialize)]
pub struct PlanProgress {
    pub plan_id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: PlanStatus,
    pub regime: VolatilityRegime,
    pub filled_slices: usize,
    pub slice_count: u32,
    pub executed_amount: Decimal,
    pub remaining_amount: Decimal,
    pub remaining_secs: i64,
    pub failure: Option<String>,
}

impl PlanProgress {
    pub fn from_plan(plan: &ExecutionPlan, now: DateTime<Utc>) -> Self {
        Self {
            plan_id: plan.id.to_string(),
            account_id: plan.account_id.clone(),
            symbol: plan.symbol.clone(),
            side: plan.side,
            status: plan.status,
            regime: plan.regime,
            filled_slices: plan.filled_slices(),
            slice_count: plan.slice_count,
            executed_amount: plan.executed_amount(),
            remaining_amount: plan.remaining_amount(),
            remaining_secs: plan.remaining_window(now).num_seconds(),
            failure: plan.failure.as_ref().map(|f| f.message.clone()),
        }
    }
}

/// Everything the operator CLI renders
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub plans: Vec<PlanProgress>,
    pub tasks: HealthReport,
    pub breakers: Vec<CircuitBreakerState>,
    pub generated_at: DateTime<Utc>,
}
