use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureClass;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Market regime classified from ATR, drives slice count and spacing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityRegime {
    Stable,
    Volatile,
}

impl std::fmt::Display for VolatilityRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolatilityRegime::Stable => write!(f, "stable"),
            VolatilityRegime::Volatile => write!(f, "volatile"),
        }
    }
}

/// Plan status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanStatus {
    /// Plan created, no slice submitted yet
    Pending,
    /// At least one slice submitted
    Active,
    /// All slices resolved, none terminally blocking
    Completed,
    /// Stopped by a non-recoverable failure
    Failed,
    /// Cancelled by the operator or superseded by a newer plan
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }
}

/// Slice status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SliceStatus {
    /// Waiting for its scheduled time
    Pending,
    /// Sent to the gateway, outcome unknown
    Submitted,
    /// Confirmed filled
    Filled,
    /// Retries exhausted or rejected
    Failed,
    /// Abandoned because the plan failed non-recoverably
    Skipped,
    /// Plan was cancelled before submission
    Cancelled,
}

impl SliceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SliceStatus::Pending | SliceStatus::Submitted)
    }
}

/// Why a plan stopped, kept for the status surface and alerts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFailure {
    pub class: FailureClass,
    pub message: String,
}

/// One sub-order of an execution plan, tied to a scheduled time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slice {
    pub plan_id: Uuid,
    pub index: u32,
    pub scheduled_at: DateTime<Utc>,
    pub amount: Decimal,
    pub status: SliceStatus,
    pub order_id: Option<String>,
    pub filled_amount: Decimal,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Slice {
    pub fn new(plan_id: Uuid, index: u32, scheduled_at: DateTime<Utc>, amount: Decimal) -> Self {
        Self {
            plan_id,
            index,
            scheduled_at,
            amount,
            status: SliceStatus::Pending,
            order_id: None,
            filled_amount: Decimal::ZERO,
            retry_count: 0,
            last_error: None,
            submitted_at: None,
            resolved_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SliceStatus::Pending && self.scheduled_at <= now
    }
}

/// A time-sliced rebalance order for one (account, symbol) pair.
///
/// The plan aggregate owns its slices; all mutation goes through the
/// persistence adapter's compare-and-swap update keyed on `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: Uuid,
    pub account_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub total_amount: Decimal,
    pub slice_count: u32,
    pub slice_interval_secs: u64,
    pub regime: VolatilityRegime,
    pub status: PlanStatus,
    pub slices: Vec<Slice>,
    pub failure: Option<PlanFailure>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl ExecutionPlan {
    /// The next slice that may act: the lowest-index slice that is not yet
    /// terminal. Strict index ordering means nothing past it is eligible.
    pub fn next_open_slice(&self) -> Option<&Slice> {
        self.slices.iter().find(|s| !s.status.is_terminal())
    }

    pub fn next_open_slice_index(&self) -> Option<usize> {
        self.slices.iter().position(|s| !s.status.is_terminal())
    }

    pub fn all_slices_terminal(&self) -> bool {
        self.slices.iter().all(|s| s.status.is_terminal())
    }

    pub fn executed_amount(&self) -> Decimal {
        self.slices.iter().map(|s| s.filled_amount).sum()
    }

    pub fn remaining_amount(&self) -> Decimal {
        self.slices
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.amount)
            .sum()
    }

    pub fn filled_slices(&self) -> usize {
        self.slices
            .iter()
            .filter(|s| s.status == SliceStatus::Filled)
            .count()
    }

    /// Time until the last pending slice comes due, zero when nothing waits.
    pub fn remaining_window(&self, now: DateTime<Utc>) -> Duration {
        self.slices
            .iter()
            .filter(|s| s.status == SliceStatus::Pending)
            .map(|s| (s.scheduled_at - now).max(Duration::zero()))
            .max()
            .unwrap_or_else(Duration::zero)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
