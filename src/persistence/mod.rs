//! Persistence capability.
//!
//! The store is the single source of truth for plans, tasks and breaker
//! snapshots. Every update is a compare-and-swap on the entity's version so
//! a crashed-and-resumed process can never double-submit a slice or lose a
//! completed one. The storage engine itself is an external concern; this
//! crate ships the trait and an in-memory reference implementation.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{AccountTask, ExecutionPlan};
use crate::error::Result;
use crate::resilience::CircuitBreakerState;

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    // --- execution plans (slices ride inside the plan aggregate) ---

    async fn insert_plan(&self, plan: &ExecutionPlan) -> Result<()>;

    async fn get_plan(&self, id: Uuid) -> Result<Option<ExecutionPlan>>;

    /// Compare-and-swap update keyed on `plan.version`; returns the new
    /// version on success and `VersionConflict` when the stored version
    /// moved underneath the caller.
    async fn update_plan(&self, plan: &ExecutionPlan) -> Result<u64>;

    /// All plans in a non-terminal status, for resumption after restart.
    async fn list_active_plans(&self) -> Result<Vec<ExecutionPlan>>;

    async fn find_plans(&self, account_id: &str, symbol: &str) -> Result<Vec<ExecutionPlan>>;

    /// Remove a plan outright (operator purge). Returns whether it existed.
    async fn delete_plan(&self, id: Uuid) -> Result<bool>;

    // --- account tasks ---

    async fn insert_task(&self, task: &AccountTask) -> Result<()>;

    async fn get_task(&self, id: Uuid) -> Result<Option<AccountTask>>;

    /// CAS update keyed on `task.version`, same contract as `update_plan`.
    async fn update_task(&self, task: &AccountTask) -> Result<u64>;

    /// All tasks in a non-terminal state, for resumption after restart.
    async fn list_open_tasks(&self) -> Result<Vec<AccountTask>>;

    async fn list_tasks(&self) -> Result<Vec<AccountTask>>;

    /// Move terminal tasks last updated before `cutoff` out of the live
    /// set. Returns how many were archived.
    async fn archive_tasks_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    // --- circuit breaker snapshots ---

    /// Insert or CAS-update a breaker snapshot; returns the new version.
    async fn save_breaker(&self, state: &CircuitBreakerState) -> Result<u64>;

    async fn list_breakers(&self) -> Result<Vec<CircuitBreakerState>>;
}
