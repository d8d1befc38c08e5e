//! Slice scheduling.
//!
//! Drives execution plans slice by slice: the earliest due slice across all
//! active plans goes first, slices within a plan go strictly in index order,
//! and every transition is persisted through the store's CAS before the
//! scheduler moves on. A process restart resumes from the store; a slice
//! recorded Submitted at crash time is reconciled against the gateway and
//! never resubmitted.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alert::AlertManager;
use crate::domain::{ExecutionPlan, PlanFailure, PlanStatus, SliceStatus};
use crate::error::{FailureClass, GatewayError, Result, TempoError};
use crate::gateway::{OrderGateway, OrderState};
use crate::persistence::PersistenceAdapter;
use crate::resilience::{BreakerRegistry, RetryManager, RetryPolicy};

/// Summary of one scheduling pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    /// Slices handed to the gateway
    pub submitted: usize,
    /// Slices confirmed filled
    pub filled: usize,
    /// Slices that gave up (retries exhausted, rejected, balance)
    pub failed: usize,
    /// Slices pushed back because the circuit is open
    pub deferred: usize,
    /// Plans that reached Completed
    pub completed_plans: usize,
    /// Plans that reached Failed
    pub failed_plans: usize,
}

enum StepOutcome {
    /// A slice reached a terminal state; the plan may have more due work
    Progress,
    /// Nothing more can happen for this plan within this tick
    Blocked,
}

pub struct SliceScheduler {
    store: Arc<dyn PersistenceAdapter>,
    gateway: Arc<dyn OrderGateway>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryManager,
    alerts: Arc<AlertManager>,
}

impl SliceScheduler {
    pub fn new(
        store: Arc<dyn PersistenceAdapter>,
        gateway: Arc<dyn OrderGateway>,
        breakers: Arc<BreakerRegistry>,
        retry_policy: RetryPolicy,
        alerts: Arc<AlertManager>,
    ) -> Self {
        Self {
            store,
            gateway,
            breakers,
            retry: RetryManager::new(retry_policy),
            alerts,
        }
    }

    fn service_id(account_id: &str) -> String {
        format!("gateway:{account_id}")
    }

    /// Reconcile persisted state after a restart.
    ///
    /// A slice recorded Submitted with no order id cannot be matched to
    /// anything at the exchange, so it fails safe (never resubmitted) and is
    /// alerted for operator review. Slices with an order id are reconciled
    /// lazily by the next tick; overdue Pending slices simply become due.
    pub async fn resume(&self) -> Result<usize> {
        let plans = self.store.list_active_plans().await?;
        let open = plans.len();
        for mut plan in plans {
            let unresolved = plan
                .slices
                .iter()
                .position(|s| s.status == SliceStatus::Submitted && s.order_id.is_none());
            if let Some(idx) = unresolved {
                let index = plan.slices[idx].index;
                {
                    let slice = &mut plan.slices[idx];
                    slice.status = SliceStatus::Failed;
                    slice.last_error = Some("submission outcome unknown after restart".into());
                    slice.resolved_at = Some(Utc::now());
                }
                plan.touch();
                plan.version = self.store.update_plan(&plan).await?;
                self.alerts
                    .slice_failed(
                        &plan.id.to_string(),
                        index,
                        "submission outcome unknown after restart, marked failed without resubmitting",
                    )
                    .await;
            }
        }
        info!(plans = open, "resumed execution state from store");
        Ok(open)
    }

    /// Advance all due work once.
    pub async fn tick(&self) -> Result<TickOutcome> {
        self.run_tick(None).await
    }

    /// Advance due work for a single account.
    pub async fn tick_account(&self, account_id: &str) -> Result<TickOutcome> {
        self.run_tick(Some(account_id)).await
    }

    async fn run_tick(&self, account: Option<&str>) -> Result<TickOutcome> {
        let mut outcome = TickOutcome::default();
        let mut skip: HashSet<Uuid> = HashSet::new();

        loop {
            let now = Utc::now();
            let mut plans = self.store.list_active_plans().await?;
            if let Some(acct) = account {
                plans.retain(|p| p.account_id == acct);
            }
            plans.retain(|p| !skip.contains(&p.id));

            // Earliest actionable slice across all plans goes first.
            let mut candidate: Option<ExecutionPlan> = None;
            let mut candidate_due = None;
            for plan in plans {
                match plan.next_open_slice() {
                    None => {
                        let plan_id = plan.id;
                        if let Err(err) = self.finalize(plan, &mut outcome).await {
                            self.note_conflict(plan_id, err, &mut skip)?;
                        }
                    }
                    Some(slice) => {
                        let actionable =
                            slice.status == SliceStatus::Submitted || slice.is_due(now);
                        if actionable
                            && candidate_due.map(|d| slice.scheduled_at < d).unwrap_or(true)
                        {
                            candidate_due = Some(slice.scheduled_at);
                            candidate = Some(plan);
                        }
                    }
                }
            }

            let Some(plan) = candidate else { break };
            let plan_id = plan.id;
            match self.step(plan, &mut outcome).await {
                Ok(StepOutcome::Progress) => {}
                Ok(StepOutcome::Blocked) => {
                    skip.insert(plan_id);
                }
                Err(err) => self.note_conflict(plan_id, err, &mut skip)?,
            }
        }

        if let Err(err) = self.breakers.persist_all(self.store.as_ref()).await {
            warn!(error = %err, "failed to persist breaker snapshots");
        }
        Ok(outcome)
    }

    /// A CAS conflict means another writer advanced the plan; leave it to
    /// them. Anything else propagates.
    fn note_conflict(
        &self,
        plan_id: Uuid,
        err: TempoError,
        skip: &mut HashSet<Uuid>,
    ) -> Result<()> {
        match err {
            TempoError::VersionConflict { .. } => {
                warn!(plan_id = %plan_id, "plan advanced by another writer, skipping");
                skip.insert(plan_id);
                Ok(())
            }
            other => Err(other),
        }
    }

    async fn step(
        &self,
        mut plan: ExecutionPlan,
        outcome: &mut TickOutcome,
    ) -> Result<StepOutcome> {
        let Some(idx) = plan.next_open_slice_index() else {
            self.finalize(plan, outcome).await?;
            return Ok(StepOutcome::Progress);
        };

        if plan.slices[idx].status == SliceStatus::Submitted {
            return self.resolve_submitted(plan, idx, outcome).await;
        }

        // Persist the Submitted transition before touching the gateway so a
        // crash in between can never lead to a double submission.
        {
            let slice = &mut plan.slices[idx];
            slice.status = SliceStatus::Submitted;
            slice.submitted_at = Some(Utc::now());
        }
        if plan.status == PlanStatus::Pending {
            plan.status = PlanStatus::Active;
        }
        plan.touch();
        plan.version = self.store.update_plan(&plan).await?;

        let breaker = self.breakers.get(&Self::service_id(&plan.account_id));
        let gateway = self.gateway.clone();
        let account_id = plan.account_id.clone();
        let symbol = plan.symbol.clone();
        let side = plan.side;
        let amount = plan.slices[idx].amount;

        let placed = self
            .retry
            .execute("place_order", || {
                let breaker = breaker.clone();
                let gateway = gateway.clone();
                let account_id = account_id.clone();
                let symbol = symbol.clone();
                async move {
                    breaker
                        .call(|| async {
                            gateway.place_order(&account_id, &symbol, side, amount).await
                        })
                        .await
                }
            })
            .await;

        match placed {
            Ok(ack) => {
                plan.slices[idx].order_id = Some(ack.order_id);
                plan.touch();
                plan.version = self.store.update_plan(&plan).await?;
                outcome.submitted += 1;
                self.resolve_submitted(plan, idx, outcome).await
            }
            Err(err) => self.handle_submit_failure(plan, idx, err, outcome).await,
        }
    }

    /// Settle a Submitted slice against the gateway's view of the order.
    async fn resolve_submitted(
        &self,
        mut plan: ExecutionPlan,
        idx: usize,
        outcome: &mut TickOutcome,
    ) -> Result<StepOutcome> {
        let Some(order_id) = plan.slices[idx].order_id.clone() else {
            // resume() normally fails these before a tick sees them.
            let index = plan.slices[idx].index;
            {
                let slice = &mut plan.slices[idx];
                slice.status = SliceStatus::Failed;
                slice.last_error = Some("submission outcome unknown".into());
                slice.resolved_at = Some(Utc::now());
            }
            plan.touch();
            plan.version = self.store.update_plan(&plan).await?;
            outcome.failed += 1;
            self.alerts
                .slice_failed(&plan.id.to_string(), index, "submission outcome unknown")
                .await;
            return Ok(StepOutcome::Progress);
        };

        let breaker = self.breakers.get(&Self::service_id(&plan.account_id));
        let gateway = self.gateway.clone();
        let account_id = plan.account_id.clone();

        let fill = self
            .retry
            .execute("get_order_status", || {
                let breaker = breaker.clone();
                let gateway = gateway.clone();
                let account_id = account_id.clone();
                let order_id = order_id.clone();
                async move {
                    breaker
                        .call(|| async {
                            gateway.get_order_status(&account_id, &order_id).await
                        })
                        .await
                }
            })
            .await;

        match fill {
            Ok(f) if f.state == OrderState::Filled => {
                let amount = plan.slices[idx].amount;
                {
                    let slice = &mut plan.slices[idx];
                    slice.status = SliceStatus::Filled;
                    slice.filled_amount = if f.filled_amount > rust_decimal::Decimal::ZERO {
                        f.filled_amount
                    } else {
                        amount
                    };
                    slice.resolved_at = Some(Utc::now());
                }
                plan.touch();
                plan.version = self.store.update_plan(&plan).await?;
                outcome.filled += 1;
                debug!(
                    plan_id = %plan.id,
                    slice = plan.slices[idx].index,
                    of = plan.slice_count,
                    "slice filled"
                );
                Ok(StepOutcome::Progress)
            }
            Ok(f) if f.state == OrderState::Failed => {
                let index = plan.slices[idx].index;
                {
                    let slice = &mut plan.slices[idx];
                    slice.status = SliceStatus::Failed;
                    slice.last_error = Some("order failed at the exchange".into());
                    slice.resolved_at = Some(Utc::now());
                }
                plan.touch();
                plan.version = self.store.update_plan(&plan).await?;
                outcome.failed += 1;
                self.alerts
                    .slice_failed(&plan.id.to_string(), index, "order failed at the exchange")
                    .await;
                Ok(StepOutcome::Progress)
            }
            Ok(_) => {
                // Still working at the exchange; check again next tick.
                debug!(plan_id = %plan.id, %order_id, "order still open, leaving in flight");
                Ok(StepOutcome::Blocked)
            }
            Err(err) => {
                warn!(
                    plan_id = %plan.id,
                    %order_id,
                    error = %err,
                    "could not confirm order status, leaving in flight"
                );
                Ok(StepOutcome::Blocked)
            }
        }
    }

    async fn handle_submit_failure(
        &self,
        mut plan: ExecutionPlan,
        idx: usize,
        err: GatewayError,
        outcome: &mut TickOutcome,
    ) -> Result<StepOutcome> {
        let index = plan.slices[idx].index;
        match err.class() {
            FailureClass::CircuitOpen => {
                // Deferred, not failed: the slice waits for the breaker to
                // allow a probe and its retry count is untouched.
                {
                    let slice = &mut plan.slices[idx];
                    slice.status = SliceStatus::Pending;
                    slice.submitted_at = None;
                }
                plan.touch();
                plan.version = self.store.update_plan(&plan).await?;
                outcome.deferred += 1;
                debug!(plan_id = %plan.id, slice = index, "slice deferred, circuit open");
                self.alerts
                    .breaker_opened(&Self::service_id(&plan.account_id))
                    .await;
                Ok(StepOutcome::Blocked)
            }
            FailureClass::Transient => {
                {
                    let slice = &mut plan.slices[idx];
                    slice.status = SliceStatus::Failed;
                    slice.retry_count = self.retry.policy().max_attempts;
                    slice.last_error = Some(err.to_string());
                    slice.resolved_at = Some(Utc::now());
                }
                plan.touch();
                plan.version = self.store.update_plan(&plan).await?;
                outcome.failed += 1;
                self.alerts
                    .slice_failed(&plan.id.to_string(), index, &err.to_string())
                    .await;
                Ok(StepOutcome::Progress)
            }
            FailureClass::Permanent => {
                {
                    let slice = &mut plan.slices[idx];
                    slice.status = SliceStatus::Failed;
                    slice.retry_count = 1;
                    slice.last_error = Some(err.to_string());
                    slice.resolved_at = Some(Utc::now());
                }
                plan.touch();
                plan.version = self.store.update_plan(&plan).await?;
                outcome.failed += 1;
                self.alerts
                    .slice_failed(&plan.id.to_string(), index, &err.to_string())
                    .await;
                Ok(StepOutcome::Progress)
            }
            FailureClass::InsufficientBalance => {
                // Non-recoverable by design: fail the whole plan and require
                // operator clearance before this account/symbol runs again.
                let now = Utc::now();
                {
                    let slice = &mut plan.slices[idx];
                    slice.status = SliceStatus::Failed;
                    slice.retry_count = 1;
                    slice.last_error = Some(err.to_string());
                    slice.resolved_at = Some(now);
                }
                for slice in plan
                    .slices
                    .iter_mut()
                    .filter(|s| s.status == SliceStatus::Pending)
                {
                    slice.status = SliceStatus::Skipped;
                    slice.resolved_at = Some(now);
                }
                plan.status = PlanStatus::Failed;
                plan.failure = Some(PlanFailure {
                    class: FailureClass::InsufficientBalance,
                    message: err.to_string(),
                });
                plan.touch();
                plan.version = self.store.update_plan(&plan).await?;
                outcome.failed += 1;
                outcome.failed_plans += 1;
                self.alerts
                    .plan_failed(&plan.id.to_string(), &plan.account_id, &err.to_string())
                    .await;
                Ok(StepOutcome::Progress)
            }
        }
    }

    /// Close out a plan whose slices have all resolved.
    async fn finalize(&self, mut plan: ExecutionPlan, outcome: &mut TickOutcome) -> Result<()> {
        if plan.status.is_terminal() || !plan.all_slices_terminal() {
            return Ok(());
        }
        if plan.cancel_requested {
            plan.status = PlanStatus::Cancelled;
            info!(plan_id = %plan.id, "plan cancelled");
        } else {
            plan.status = PlanStatus::Completed;
            outcome.completed_plans += 1;
            info!(
                plan_id = %plan.id,
                account_id = %plan.account_id,
                symbol = %plan.symbol,
                executed = %plan.executed_amount(),
                "plan completed"
            );
        }
        plan.touch();
        self.store.update_plan(&plan).await?;
        Ok(())
    }

    /// Cooperative cancellation: pending slices are cancelled immediately,
    /// an in-flight submission resolves normally before the plan finalizes.
    pub async fn cancel_plan(&self, plan_id: Uuid) -> Result<()> {
        let mut plan = self
            .store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| TempoError::NotFound(format!("plan {plan_id}")))?;
        if plan.status.is_terminal() {
            return Ok(());
        }
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
        info!(plan_id = %plan_id, "plan cancellation requested");
        Ok(())
    }
}
