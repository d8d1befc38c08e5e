//! Execution runtime: maps coordinator tasks onto the planner and slice
//! scheduler, and carries the operator command surface the external CLI
//! calls (status, advance-due, clear-failed).

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::alert::AlertManager;
use crate::config::AppConfig;
use crate::domain::{AccountTask, PlanStatus, TaskKind};
use crate::error::Result;
use crate::execution::{ExecutionPlanner, SliceScheduler, TickOutcome};
use crate::gateway::OrderGateway;
use crate::persistence::PersistenceAdapter;
use crate::resilience::{BreakerRegistry, RetryManager};

use super::coordinator::{TaskCoordinator, TaskRunner};
use super::state::{PlanProgress, StatusReport};

pub struct ExecutionRuntime {
    store: Arc<dyn PersistenceAdapter>,
    gateway: Arc<dyn OrderGateway>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryManager,
    planner: ExecutionPlanner,
    scheduler: SliceScheduler,
    alerts: Arc<AlertManager>,
}

impl ExecutionRuntime {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn PersistenceAdapter>,
        gateway: Arc<dyn OrderGateway>,
        breakers: Arc<BreakerRegistry>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        let planner = ExecutionPlanner::new(config.execution.clone(), store.clone());
        let scheduler = SliceScheduler::new(
            store.clone(),
            gateway.clone(),
            breakers.clone(),
            config.resilience.retry.clone(),
            alerts.clone(),
        );
        Self {
            store,
            gateway,
            breakers,
            retry: RetryManager::new(config.resilience.retry.clone()),
            planner,
            scheduler,
            alerts,
        }
    }

    pub fn planner(&self) -> &ExecutionPlanner {
        &self.planner
    }

    pub fn scheduler(&self) -> &SliceScheduler {
        &self.scheduler
    }

    /// Resume persisted execution state after a restart.
    pub async fn resume(&self) -> Result<usize> {
        self.scheduler.resume().await
    }

    /// Manual "advance due work" trigger.
    pub async fn advance_due(&self) -> Result<TickOutcome> {
        self.scheduler.tick().await
    }

    /// Purge failed plans for an account/symbol so a new plan may be
    /// initiated. This is the explicit operator clearance required after an
    /// insufficient-balance failure.
    pub async fn clear_failed_plans(&self, account_id: &str, symbol: &str) -> Result<usize> {
        let plans = self.store.find_plans(account_id, symbol).await?;
        let mut cleared = 0;
        for plan in plans
            .into_iter()
            .filter(|p| p.status == PlanStatus::Failed)
        {
            if self.store.delete_plan(plan.id).await? {
                cleared += 1;
            }
        }
        if cleared > 0 {
            info!(account_id, symbol, cleared, "failed plans cleared");
            self.alerts
                .info(
                    "runtime",
                    "plans_cleared",
                    &format!("{cleared} failed plan(s) cleared for {account_id}/{symbol}"),
                )
                .await;
        }
        Ok(cleared)
    }

    /// Status query for the operator surface.
    pub async fn status(&self, coordinator: &TaskCoordinator) -> Result<StatusReport> {
        let now = Utc::now();
        let plans = self
            .store
            .list_active_plans()
            .await?
            .iter()
            .map(|p| PlanProgress::from_plan(p, now))
            .collect();
        Ok(StatusReport {
            plans,
            tasks: coordinator.health().await?,
            breakers: self.breakers.snapshots().await,
            generated_at: now,
        })
    }

    async fn health_check(&self, account_id: &str) -> Result<()> {
        let breaker = self.breakers.get(&format!("gateway:{account_id}"));
        let gateway = self.gateway.clone();
        let account = account_id.to_string();
        let holdings = self
            .retry
            .execute("get_balance", || {
                let breaker = breaker.clone();
                let gateway = gateway.clone();
                let account = account.clone();
                async move {
                    breaker
                        .call(|| async { gateway.get_balance(&account).await })
                        .await
                }
            })
            .await?;
        debug!(account_id, assets = holdings.len(), "health check passed");
        Ok(())
    }
}

#[async_trait]
impl TaskRunner for ExecutionRuntime {
    async fn run(&self, task: &AccountTask) -> Result<()> {
        match &task.kind {
            TaskKind::Rebalance {
                symbol,
                side,
                total_amount,
                atr_pct,
            } => {
                self.planner
                    .initiate(&task.account_id, symbol, *side, *total_amount, *atr_pct)
                    .await?;
                // The first slice is due at creation; execute it right away.
                self.scheduler.tick_account(&task.account_id).await?;
                Ok(())
            }
            TaskKind::AdvanceSlices => {
                self.scheduler.tick_account(&task.account_id).await?;
                Ok(())
            }
            TaskKind::HealthCheck => self.health_check(&task.account_id).await,
            TaskKind::PurgeFailedPlans { symbol } => {
                self.clear_failed_plans(&task.account_id, symbol)
                    .await
                    .map(|_| ())
            }
        }
    }
}
