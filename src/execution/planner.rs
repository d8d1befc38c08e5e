//! Execution planning.
//!
//! Turns a rebalance delta into a time-sliced plan. Slice count and spacing
//! follow the volatility regime; slice amounts are quantized to the smallest
//! currency unit with the final slice absorbing the remainder so the sum is
//! exact.

use chrono::{Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::domain::{
    ExecutionPlan, OrderSide, PlanStatus, Slice, SliceStatus, VolatilityRegime,
};
use crate::error::{FailureClass, Result, TempoError};
use crate::persistence::PersistenceAdapter;

/// Stable market: finish within 6 hours, 30-minute spacing.
const STABLE_SLICE_COUNT: u32 = 12;
const STABLE_INTERVAL_SECS: u64 = 30 * 60;

/// Volatile market: stretch over 24 hours, 60-minute spacing.
const VOLATILE_SLICE_COUNT: u32 = 24;
const VOLATILE_INTERVAL_SECS: u64 = 60 * 60;

pub struct ExecutionPlanner {
    config: ExecutionConfig,
    store: Arc<dyn PersistenceAdapter>,
}

impl ExecutionPlanner {
    pub fn new(config: ExecutionConfig, store: Arc<dyn PersistenceAdapter>) -> Self {
        Self { config, store }
    }

    /// ATR as a percentage of price decides the regime.
    pub fn classify_regime(&self, atr_pct: Decimal) -> VolatilityRegime {
        if atr_pct > self.config.atr_volatile_threshold_pct {
            VolatilityRegime::Volatile
        } else {
            VolatilityRegime::Stable
        }
    }

    fn regime_parameters(regime: VolatilityRegime) -> (u32, u64) {
        match regime {
            VolatilityRegime::Stable => (STABLE_SLICE_COUNT, STABLE_INTERVAL_SECS),
            VolatilityRegime::Volatile => (VOLATILE_SLICE_COUNT, VOLATILE_INTERVAL_SECS),
        }
    }

    /// Build a plan without persisting it.
    pub fn build_plan(
        &self,
        account_id: &str,
        symbol: &str,
        side: OrderSide,
        total_amount: Decimal,
        atr_pct: Decimal,
    ) -> Result<ExecutionPlan> {
        if total_amount <= Decimal::ZERO {
            return Err(TempoError::InvalidDelta(format!(
                "total_amount must be positive, got {total_amount}"
            )));
        }
        if !self.config.symbols.iter().any(|s| s == symbol) {
            return Err(TempoError::InvalidDelta(format!(
                "unsupported symbol: {symbol}"
            )));
        }

        let regime = self.classify_regime(atr_pct);
        let (mut slice_count, interval_secs) = Self::regime_parameters(regime);

        // Small deltas are not worth spreading out.
        if total_amount < self.config.immediate_floor {
            slice_count = 1;
        }

        // Shrink the count until every slice clears the exchange minimum,
        // bottoming out at a single immediate slice.
        let min = self.config.min_order_amount;
        if slice_count > 1 && total_amount / Decimal::from(slice_count) < min {
            let fitting = (total_amount / min).floor();
            let reduced = fitting
                .to_u32()
                .map(|n| n.clamp(1, slice_count))
                .unwrap_or(1);
            warn!(
                symbol,
                %total_amount,
                from = slice_count,
                to = reduced,
                "reducing slice count to clear the minimum order amount"
            );
            slice_count = reduced;
        }

        let unit = self.config.currency_unit;
        let per_slice = ((total_amount / Decimal::from(slice_count)) / unit).floor() * unit;
        let last = total_amount - per_slice * Decimal::from(slice_count - 1);

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let slices = (0..slice_count)
            .map(|i| {
                let amount = if i == slice_count - 1 { last } else { per_slice };
                let scheduled_at =
                    created_at + Duration::seconds((interval_secs * i as u64) as i64);
                Slice::new(id, i, scheduled_at, amount)
            })
            .collect();

        Ok(ExecutionPlan {
            id,
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            side,
            total_amount,
            slice_count,
            slice_interval_secs: interval_secs,
            regime,
            status: PlanStatus::Pending,
            slices,
            failure: None,
            cancel_requested: false,
            created_at,
            updated_at: created_at,
            version: 0,
        })
    }

    /// Build, supersede any prior plan for the same (account, symbol), and
    /// persist.
    ///
    /// A prior plan that failed on insufficient balance blocks initiation
    /// until the operator purges it; resubmitting against a known-bad
    /// balance would only loop.
    pub async fn initiate(
        &self,
        account_id: &str,
        symbol: &str,
        side: OrderSide,
        total_amount: Decimal,
        atr_pct: Decimal,
    ) -> Result<ExecutionPlan> {
        let existing = self.store.find_plans(account_id, symbol).await?;

        if let Some(blocked) = existing.iter().find(|p| {
            p.status == PlanStatus::Failed
                && p.failure
                    .as_ref()
                    .map(|f| f.class == FailureClass::InsufficientBalance)
                    .unwrap_or(false)
        }) {
            return Err(TempoError::PlanRequiresClearance(format!(
                "plan {} for {}/{} failed on insufficient balance and must be purged first",
                blocked.id, account_id, symbol
            )));
        }

        for prior in existing.into_iter().filter(|p| !p.status.is_terminal()) {
            self.supersede(prior).await?;
        }

        let plan = self.build_plan(account_id, symbol, side, total_amount, atr_pct)?;
        self.store.insert_plan(&plan).await?;
        info!(
            plan_id = %plan.id,
            account_id,
            symbol,
            %total_amount,
            regime = %plan.regime,
            slices = plan.slice_count,
            interval_secs = plan.slice_interval_secs,
            "execution plan initiated"
        );
        Ok(plan)
    }

    /// Cancel a stale plan's pending slices in favor of a newer one. A slice
    /// already at the gateway is left to resolve; the scheduler finalizes
    /// the plan once it does.
    async fn supersede(&self, mut plan: ExecutionPlan) -> Result<()> {
        let now = Utc::now();
        for slice in plan
            .slices
            .iter_mut()
            .filter(|s| s.status == SliceStatus::Pending)
        {
            slice.status = SliceStatus::Cancelled;
            slice.resolved_at = Some(now);
        }
        plan.cancel_requested = true;
        if !plan
            .slices
            .iter()
            .any(|s| s.status == SliceStatus::Submitted)
        {
            plan.status = PlanStatus::Cancelled;
        }
        plan.touch();
        self.store.update_plan(&plan).await?;
        warn!(plan_id = %plan.id, account_id = %plan.account_id, symbol = %plan.symbol, "superseded stale plan");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use rust_decimal_macros::dec;

    fn planner() -> ExecutionPlanner {
        ExecutionPlanner::new(ExecutionConfig::default(), Arc::new(MemoryStore::new()))
    }

    #[test]
    fn stable_regime_yields_twelve_half_hour_slices() {
        let plan = planner()
            .build_plan("acct-1", "BTC", OrderSide::Buy, dec!(100000), dec!(3))
            .unwrap();

        assert_eq!(plan.regime, VolatilityRegime::Stable);
        assert_eq!(plan.slice_count, 12);
        assert_eq!(plan.slice_interval_secs, 1800);
        assert_eq!(plan.slices.len(), 12);

        // 100,000 / 12 = 8,333 with the last slice absorbing the remainder.
        for slice in &plan.slices[..11] {
            assert_eq!(slice.amount, dec!(8333));
        }
        assert_eq!(plan.slices[11].amount, dec!(8337));
        let sum: Decimal = plan.slices.iter().map(|s| s.amount).sum();
        assert_eq!(sum, dec!(100000));
    }

    #[test]
    fn atr_above_threshold_yields_volatile_hourly_slices() {
        let plan = planner()
            .build_plan("acct-1", "BTC", OrderSide::Sell, dec!(2400000), dec!(7))
            .unwrap();

        assert_eq!(plan.regime, VolatilityRegime::Volatile);
        assert_eq!(plan.slice_count, 24);
        assert_eq!(plan.slice_interval_secs, 3600);
    }

    #[test]
    fn slice_spacing_follows_the_interval() {
        let plan = planner()
            .build_plan("acct-1", "ETH", OrderSide::Buy, dec!(120000), dec!(2))
            .unwrap();

        for pair in plan.slices.windows(2) {
            let gap = pair[1].scheduled_at - pair[0].scheduled_at;
            assert_eq!(gap.num_seconds(), 1800);
        }
        assert_eq!(plan.slices[0].scheduled_at, plan.created_at);
    }

    #[test]
    fn slice_count_shrinks_to_clear_the_minimum() {
        // 55,000 over 12 slices would be 4,583 each, below the 5,000 floor.
        let plan = planner()
            .build_plan("acct-1", "XRP", OrderSide::Buy, dec!(55000), dec!(1))
            .unwrap();

        assert_eq!(plan.slice_count, 11);
        assert!(plan
            .slices
            .iter()
            .all(|s| s.amount >= dec!(5000)));
        let sum: Decimal = plan.slices.iter().map(|s| s.amount).sum();
        assert_eq!(sum, dec!(55000));
    }

    #[test]
    fn small_delta_becomes_a_single_immediate_slice() {
        let plan = planner()
            .build_plan("acct-1", "BTC", OrderSide::Buy, dec!(30000), dec!(3))
            .unwrap();

        assert_eq!(plan.slice_count, 1);
        assert_eq!(plan.slices[0].amount, dec!(30000));
        assert_eq!(plan.slices[0].scheduled_at, plan.created_at);
    }

    #[test]
    fn non_positive_delta_is_rejected() {
        let err = planner()
            .build_plan("acct-1", "BTC", OrderSide::Buy, dec!(0), dec!(3))
            .unwrap_err();
        assert!(matches!(err, TempoError::InvalidDelta(_)));

        let err = planner()
            .build_plan("acct-1", "BTC", OrderSide::Buy, dec!(-500), dec!(3))
            .unwrap_err();
        assert!(matches!(err, TempoError::InvalidDelta(_)));
    }

    #[test]
    fn unsupported_symbol_is_rejected() {
        let err = planner()
            .build_plan("acct-1", "DOGE", OrderSide::Buy, dec!(100000), dec!(3))
            .unwrap_err();
        assert!(matches!(err, TempoError::InvalidDelta(_)));
    }

    #[tokio::test]
    async fn initiation_supersedes_prior_active_plan() {
        let store = Arc::new(MemoryStore::new());
        let planner = ExecutionPlanner::new(ExecutionConfig::default(), store.clone());

        let first = planner
            .initiate("acct-1", "BTC", OrderSide::Buy, dec!(100000), dec!(3))
            .await
            .unwrap();
        let second = planner
            .initiate("acct-1", "BTC", OrderSide::Buy, dec!(200000), dec!(3))
            .await
            .unwrap();

        let stale = store.get_plan(first.id).await.unwrap().unwrap();
        assert_eq!(stale.status, PlanStatus::Cancelled);
        assert!(stale
            .slices
            .iter()
            .all(|s| s.status == SliceStatus::Cancelled));

        let fresh = store.get_plan(second.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, PlanStatus::Pending);
    }

    #[tokio::test]
    async fn insufficient_balance_failure_blocks_initiation_until_purged() {
        let store = Arc::new(MemoryStore::new());
        let planner = ExecutionPlanner::new(ExecutionConfig::default(), store.clone());

        let mut failed = planner
            .initiate("acct-1", "BTC", OrderSide::Buy, dec!(100000), dec!(3))
            .await
            .unwrap();
        failed.status = PlanStatus::Failed;
        failed.failure = Some(crate::domain::PlanFailure {
            class: FailureClass::InsufficientBalance,
            message: "requested 8333, available 12".into(),
        });
        store.update_plan(&failed).await.unwrap();

        let err = planner
            .initiate("acct-1", "BTC", OrderSide::Buy, dec!(50000), dec!(3))
            .await
            .unwrap_err();
        assert!(matches!(err, TempoError::PlanRequiresClearance(_)));

        // Purging the failed plan unblocks the account/symbol pair.
        store.delete_plan(failed.id).await.unwrap();
        assert!(planner
            .initiate("acct-1", "BTC", OrderSide::Buy, dec!(50000), dec!(3))
            .await
            .is_ok());
    }
}
