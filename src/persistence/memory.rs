//! In-memory reference store.
//!
//! Honors the versioning contract exactly, so tests exercise the same CAS
//! semantics a database-backed adapter must provide.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{AccountTask, ExecutionPlan};
use crate::error::{Result, TempoError};
use crate::resilience::CircuitBreakerState;

use super::PersistenceAdapter;

#[derive(Default)]
pub struct MemoryStore {
    plans: RwLock<HashMap<Uuid, ExecutionPlan>>,
    tasks: RwLock<HashMap<Uuid, AccountTask>>,
    archived_tasks: RwLock<Vec<AccountTask>>,
    breakers: RwLock<HashMap<String, CircuitBreakerState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archived tasks, newest last. Test and status-surface helper.
    pub async fn archived_tasks(&self) -> Vec<AccountTask> {
        self.archived_tasks.read().await.clone()
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryStore {
    async fn insert_plan(&self, plan: &ExecutionPlan) -> Result<()> {
        let mut plans = self.plans.write().await;
        if plans.contains_key(&plan.id) {
            return Err(TempoError::Validation(format!(
                "plan {} already exists",
                plan.id
            )));
        }
        plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> Result<Option<ExecutionPlan>> {
        Ok(self.plans.read().await.get(&id).cloned())
    }

    async fn update_plan(&self, plan: &ExecutionPlan) -> Result<u64> {
        let mut plans = self.plans.write().await;
        let stored = plans
            .get_mut(&plan.id)
            .ok_or_else(|| TempoError::NotFound(format!("plan {}", plan.id)))?;
        if stored.version != plan.version {
            return Err(TempoError::VersionConflict {
                entity: "plan",
                id: plan.id.to_string(),
                expected: plan.version,
                stored: stored.version,
            });
        }
        let mut updated = plan.clone();
        updated.version += 1;
        let new_version = updated.version;
        *stored = updated;
        Ok(new_version)
    }

    async fn list_active_plans(&self) -> Result<Vec<ExecutionPlan>> {
        let mut plans: Vec<ExecutionPlan> = self
            .plans
            .read()
            .await
            .values()
            .filter(|p| !p.status.is_terminal())
            .cloned()
            .collect();
        plans.sort_by_key(|p| p.created_at);
        Ok(plans)
    }

    async fn find_plans(&self, account_id: &str, symbol: &str) -> Result<Vec<ExecutionPlan>> {
        let mut plans: Vec<ExecutionPlan> = self
            .plans
            .read()
            .await
            .values()
            .filter(|p| p.account_id == account_id && p.symbol == symbol)
            .cloned()
            .collect();
        plans.sort_by_key(|p| p.created_at);
        Ok(plans)
    }

    async fn delete_plan(&self, id: Uuid) -> Result<bool> {
        Ok(self.plans.write().await.remove(&id).is_some())
    }

    async fn insert_task(&self, task: &AccountTask) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(TempoError::Validation(format!(
                "task {} already exists",
                task.id
            )));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<AccountTask>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn update_task(&self, task: &AccountTask) -> Result<u64> {
        let mut tasks = self.tasks.write().await;
        let stored = tasks
            .get_mut(&task.id)
            .ok_or_else(|| TempoError::NotFound(format!("task {}", task.id)))?;
        if stored.version != task.version {
            return Err(TempoError::VersionConflict {
                entity: "task",
                id: task.id.to_string(),
                expected: task.version,
                stored: stored.version,
            });
        }
        let mut updated = task.clone();
        updated.version += 1;
        let new_version = updated.version;
        *stored = updated;
        Ok(new_version)
    }

    async fn list_open_tasks(&self) -> Result<Vec<AccountTask>> {
        let mut tasks: Vec<AccountTask> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| !t.state.is_terminal())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.scheduled_at);
        Ok(tasks)
    }

    async fn list_tasks(&self) -> Result<Vec<AccountTask>> {
        let mut tasks: Vec<AccountTask> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by_key(|t| t.scheduled_at);
        Ok(tasks)
    }

    async fn archive_tasks_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut tasks = self.tasks.write().await;
        let stale: Vec<Uuid> = tasks
            .values()
            .filter(|t| t.state.is_terminal() && t.updated_at < cutoff)
            .map(|t| t.id)
            .collect();
        let mut archived = self.archived_tasks.write().await;
        for id in &stale {
            if let Some(task) = tasks.remove(id) {
                archived.push(task);
            }
        }
        Ok(stale.len())
    }

    async fn save_breaker(&self, state: &CircuitBreakerState) -> Result<u64> {
        let mut breakers = self.breakers.write().await;
        match breakers.get_mut(&state.service_id) {
            Some(stored) if stored.version > state.version => Err(TempoError::VersionConflict {
                entity: "breaker",
                id: state.service_id.clone(),
                expected: state.version,
                stored: stored.version,
            }),
            Some(stored) => {
                let mut updated = state.clone();
                updated.version = state.version + 1;
                let new_version = updated.version;
                *stored = updated;
                Ok(new_version)
            }
            None => {
                let mut inserted = state.clone();
                inserted.version = state.version + 1;
                let new_version = inserted.version;
                breakers.insert(state.service_id.clone(), inserted);
                Ok(new_version)
            }
        }
    }

    async fn list_breakers(&self) -> Result<Vec<CircuitBreakerState>> {
        Ok(self.breakers.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderSide, PlanStatus, Slice, TaskKind, TaskPriority, VolatilityRegime};
    use rust_decimal_macros::dec;

    fn sample_plan() -> ExecutionPlan {
        let id = Uuid::new_v4();
        let now = Utc::now();
        ExecutionPlan {
            id,
            account_id: "acct-1".into(),
            symbol: "BTC".into(),
            side: OrderSide::Buy,
            total_amount: dec!(10000),
            slice_count: 1,
            slice_interval_secs: 0,
            regime: VolatilityRegime::Stable,
            status: PlanStatus::Pending,
            slices: vec![Slice::new(id, 0, now, dec!(10000))],
            failure: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[tokio::test]
    async fn cas_update_bumps_version() {
        let store = MemoryStore::new();
        let plan = sample_plan();
        store.insert_plan(&plan).await.unwrap();

        let mut loaded = store.get_plan(plan.id).await.unwrap().unwrap();
        loaded.status = PlanStatus::Active;
        let v = store.update_plan(&loaded).await.unwrap();
        assert_eq!(v, 1);
    }

    #[tokio::test]
    async fn stale_version_is_rejected_and_leaves_state_untouched() {
        let store = MemoryStore::new();
        let plan = sample_plan();
        store.insert_plan(&plan).await.unwrap();

        let mut first = store.get_plan(plan.id).await.unwrap().unwrap();
        let mut second = first.clone();

        first.status = PlanStatus::Active;
        store.update_plan(&first).await.unwrap();

        second.status = PlanStatus::Cancelled;
        let err = store.update_plan(&second).await.unwrap_err();
        assert!(matches!(err, TempoError::VersionConflict { .. }));

        let stored = store.get_plan(plan.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PlanStatus::Active);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn active_listing_excludes_terminal_plans() {
        let store = MemoryStore::new();
        let mut done = sample_plan();
        done.status = PlanStatus::Completed;
        let open = sample_plan();
        store.insert_plan(&done).await.unwrap();
        store.insert_plan(&open).await.unwrap();

        let active = store.list_active_plans().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, open.id);
    }

    #[tokio::test]
    async fn archive_moves_old_terminal_tasks_only() {
        let store = MemoryStore::new();
        let mut old_done = AccountTask::new("acct-1", TaskKind::HealthCheck, TaskPriority::Low);
        old_done.state = crate::domain::TaskState::Succeeded;
        old_done.updated_at = Utc::now() - chrono::Duration::days(2);
        let running = AccountTask::new("acct-1", TaskKind::AdvanceSlices, TaskPriority::High);
        store.insert_task(&old_done).await.unwrap();
        store.insert_task(&running).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let archived = store.archive_tasks_before(cutoff).await.unwrap();
        assert_eq!(archived, 1);
        assert!(store.get_task(old_done.id).await.unwrap().is_none());
        assert!(store.get_task(running.id).await.unwrap().is_some());
        assert_eq!(store.archived_tasks().await.len(), 1);
    }
}
