//! Task coordination.
//!
//! A single logical scheduler: account tasks wait in a priority queue
//! (Critical > High > Medium > Low, ties broken by earliest due time) and a
//! bounded worker pool executes them. No two tasks sharing an
//! (account, resource) key ever run concurrently. Failed tasks requeue with
//! backoff up to an attempt cap, then fail loudly.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alert::AlertManager;
use crate::domain::{AccountTask, TaskPriority, TaskState};
use crate::error::{Result, TempoError};
use crate::persistence::PersistenceAdapter;

use super::config::CoordinatorConfig;
use super::state::{HealthReport, TaskStateCounts};

/// Executes one task. The coordinator stays ignorant of what the work is;
/// the runtime wires this to the planner and scheduler.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &AccountTask) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    priority: TaskPriority,
    scheduled_at: DateTime<Utc>,
    seq: u64,
    task_id: Uuid,
}

// BinaryHeap is a max-heap; invert so the "largest" entry is the most
// urgent one: lowest priority value, then earliest due, then submit order.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then(other.scheduled_at.cmp(&self.scheduled_at))
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    config: CoordinatorConfig,
    store: Arc<dyn PersistenceAdapter>,
    runner: Arc<dyn TaskRunner>,
    alerts: Arc<AlertManager>,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    /// (account_id, resource key) pairs currently held by workers
    running: Mutex<HashSet<(String, &'static str)>>,
    workers: Arc<Semaphore>,
    notify: Notify,
    seq: AtomicU64,
}

/// Clone-friendly handle; all clones share one queue and worker pool.
#[derive(Clone)]
pub struct TaskCoordinator {
    inner: Arc<Inner>,
}

impl TaskCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn PersistenceAdapter>,
        runner: Arc<dyn TaskRunner>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                runner,
                alerts,
                queue: Mutex::new(BinaryHeap::new()),
                running: Mutex::new(HashSet::new()),
                workers,
                notify: Notify::new(),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Persist and enqueue a task.
    pub async fn submit(&self, task: AccountTask) -> Result<Uuid> {
        let id = task.id;
        self.inner.store.insert_task(&task).await?;
        self.inner
            .queue
            .lock()
            .unwrap()
            .push(self.inner.entry_for(&task));
        self.inner.notify.notify_one();
        debug!(
            task_id = %id,
            account_id = %task.account_id,
            kind = task.kind.name(),
            priority = %task.priority,
            "task submitted"
        );
        Ok(id)
    }

    /// Reload open tasks from the store after a restart. Tasks caught in
    /// Running at crash time go back to Queued; the plan-level CAS makes
    /// re-execution safe.
    pub async fn restore(&self) -> Result<usize> {
        let mut restored = 0;
        for mut task in self.inner.store.list_open_tasks().await? {
            if task.state == TaskState::Running {
                task.state = TaskState::Queued;
                task.touch();
                task.version = self.inner.store.update_task(&task).await?;
            }
            self.inner
                .queue
                .lock()
                .unwrap()
                .push(self.inner.entry_for(&task));
            restored += 1;
        }
        if restored > 0 {
            info!(tasks = restored, "restored open tasks from store");
        }
        self.inner.notify.notify_one();
        Ok(restored)
    }

    /// Mark a queued task failed before it runs. A Running task finishes
    /// normally; in-flight work is never aborted.
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool> {
        let Some(mut task) = self.inner.store.get_task(task_id).await? else {
            return Ok(false);
        };
        if !matches!(task.state, TaskState::Queued | TaskState::Retrying) {
            return Ok(false);
        }
        task.state = TaskState::Failed;
        task.last_error = Some("cancelled by operator".into());
        task.touch();
        self.inner.store.update_task(&task).await?;
        info!(task_id = %task_id, "task cancelled");
        Ok(true)
    }

    /// Pop everything due, spawn workers up to the concurrency bound, and
    /// report when the next queued task comes due.
    async fn dispatch_ready(&self) -> Result<(Vec<JoinHandle<()>>, Option<DateTime<Utc>>)> {
        let now = Utc::now();

        // The heap orders by priority before time, so a not-yet-due entry
        // can sit above a due one. Drain fully, keep future entries.
        let (due, future): (Vec<QueueEntry>, Vec<QueueEntry>) = {
            let mut queue = self.inner.queue.lock().unwrap();
            let mut due = Vec::new();
            let mut future = Vec::new();
            while let Some(entry) = queue.pop() {
                if entry.scheduled_at <= now {
                    due.push(entry);
                } else {
                    future.push(entry);
                }
            }
            for entry in &future {
                queue.push(*entry);
            }
            (due, future)
        };
        let mut next_due = future.iter().map(|e| e.scheduled_at).min();

        let mut handles = Vec::new();
        let mut requeue = Vec::new();
        let mut pending: std::collections::VecDeque<QueueEntry> = due.into();
        while let Some(entry) = pending.pop_front() {
            let Some(task) = self.inner.store.get_task(entry.task_id).await? else {
                continue; // archived or purged underneath us
            };
            if !task.is_ready(now) {
                continue; // stale entry, e.g. cancelled while queued
            }

            let key = task.resource_key();
            {
                let mut running = self.inner.running.lock().unwrap();
                if running.contains(&key) {
                    requeue.push(entry);
                    continue;
                }
                running.insert(key.clone());
            }

            let permit = match self.inner.workers.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    // Pool exhausted; put the key, this entry, and the rest
                    // of the due list back and wait for a worker to finish.
                    self.inner.running.lock().unwrap().remove(&key);
                    requeue.push(entry);
                    requeue.extend(pending.drain(..));
                    next_due = Some(next_due.map_or(now, |d| d.min(now)));
                    break;
                }
            };

            let inner = Arc::clone(&self.inner);
            handles.push(tokio::spawn(async move {
                inner.execute(task, key).await;
                drop(permit);
                inner.notify.notify_one();
            }));
        }

        if !requeue.is_empty() {
            let mut queue = self.inner.queue.lock().unwrap();
            for entry in requeue {
                queue.push(entry);
            }
        }
        Ok((handles, next_due))
    }

    /// Archive terminal tasks past the retention window.
    pub async fn cleanup(&self) -> Result<usize> {
        let cutoff =
            Utc::now() - ChronoDuration::seconds(self.inner.config.retention_secs as i64);
        let archived = self.inner.store.archive_tasks_before(cutoff).await?;
        if archived > 0 {
            debug!(archived, "archived terminal tasks past retention");
        }
        Ok(archived)
    }

    /// Dispatch everything that is ready and wait for those workers to
    /// finish, repeating until nothing more can start. Used by the manual
    /// advance trigger and tests; the run loop dispatches without waiting.
    pub async fn drain_ready(&self) -> Result<usize> {
        let mut completed = 0;
        loop {
            let (handles, _) = self.dispatch_ready().await?;
            if handles.is_empty() {
                break;
            }
            completed += handles.len();
            for handle in handles {
                let _ = handle.await;
            }
        }
        Ok(completed)
    }

    /// The scheduling loop. Wakes on task completion, new submissions, the
    /// next due time, or shutdown; waits are timer-driven, never blocking
    /// sleeps inside workers.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        info!(
            max_concurrency = self.inner.config.max_concurrency,
            "task coordinator started"
        );
        loop {
            let next_due = match self.dispatch_ready().await {
                Ok((_, next_due)) => next_due,
                Err(err) => {
                    error!(error = %err, "dispatch failed");
                    None
                }
            };

            if let Err(err) = self.cleanup().await {
                warn!(error = %err, "task retention cleanup failed");
            }

            let idle_cap = std::time::Duration::from_secs(self.inner.config.idle_wait_secs);
            let wait = next_due
                .map(|due| {
                    (due - Utc::now())
                        .to_std()
                        .unwrap_or(std::time::Duration::ZERO)
                })
                .map(|d| d.min(idle_cap))
                .unwrap_or(idle_cap);

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("task coordinator shutting down");
                    break;
                }
                _ = self.inner.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Aggregate per-account and per-kind state counts for the status
    /// surface.
    pub async fn health(&self) -> Result<HealthReport> {
        let tasks = self.inner.store.list_tasks().await?;
        let mut report = HealthReport {
            queue_depth: self.inner.queue.lock().unwrap().len(),
            running: self.inner.running.lock().unwrap().len(),
            available_workers: self.inner.workers.available_permits(),
            by_account: Default::default(),
            by_kind: Default::default(),
            generated_at: Utc::now(),
        };
        for task in &tasks {
            report
                .by_account
                .entry(task.account_id.clone())
                .or_insert_with(TaskStateCounts::default)
                .record(task.state);
            report
                .by_kind
                .entry(task.kind.name().to_string())
                .or_insert_with(TaskStateCounts::default)
                .record(task.state);
        }
        Ok(report)
    }
}

impl Inner {
    fn entry_for(&self, task: &AccountTask) -> QueueEntry {
        QueueEntry {
            priority: task.priority,
            scheduled_at: task.scheduled_at,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            task_id: task.id,
        }
    }

    async fn execute(&self, mut task: AccountTask, key: (String, &'static str)) {
        let outcome = self.execute_inner(&mut task).await;
        self.running.lock().unwrap().remove(&key);
        if let Err(err) = outcome {
            // Persistence trouble, not task failure; surface loudly.
            error!(task_id = %task.id, error = %err, "task bookkeeping failed");
        }
    }

    async fn execute_inner(&self, task: &mut AccountTask) -> Result<()> {
        task.state = TaskState::Running;
        task.attempts += 1;
        task.touch();
        task.version = self.store.update_task(task).await?;
        debug!(
            task_id = %task.id,
            account_id = %task.account_id,
            kind = task.kind.name(),
            attempt = task.attempts,
            "task started"
        );

        match self.runner.run(task).await {
            Ok(()) => {
                task.state = TaskState::Succeeded;
                task.last_error = None;
                task.touch();
                task.version = self.store.update_task(task).await?;
                info!(
                    task_id = %task.id,
                    account_id = %task.account_id,
                    kind = task.kind.name(),
                    "task succeeded"
                );
                if let Some(every) = task.every_secs {
                    self.schedule_next_occurrence(task, every).await?;
                }
                Ok(())
            }
            Err(err) => self.handle_failure(task, err).await,
        }
    }

    async fn handle_failure(&self, task: &mut AccountTask, err: TempoError) -> Result<()> {
        if task.attempts < self.config.task_max_attempts {
            let delay = self.config.requeue.next_delay(task.attempts);
            task.state = TaskState::Retrying;
            task.last_error = Some(err.to_string());
            task.scheduled_at =
                Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64);
            task.touch();
            task.version = self.store.update_task(task).await?;
            warn!(
                task_id = %task.id,
                account_id = %task.account_id,
                attempt = task.attempts,
                max_attempts = self.config.task_max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "task failed, requeued with backoff"
            );
            self.queue.lock().unwrap().push(self.entry_for(task));
            self.notify.notify_one();
        } else {
            task.state = TaskState::Failed;
            task.last_error = Some(err.to_string());
            task.touch();
            task.version = self.store.update_task(task).await?;
            self.alerts
                .task_failed(
                    &task.id.to_string(),
                    &task.account_id,
                    task.attempts,
                    &err.to_string(),
                )
                .await;
        }
        Ok(())
    }

    async fn schedule_next_occurrence(&self, task: &AccountTask, every: u64) -> Result<()> {
        let next = AccountTask::new(&task.account_id, task.kind.clone(), task.priority)
            .at(Utc::now() + ChronoDuration::seconds(every as i64))
            .recurring(every);
        let next_id = next.id;
        self.store.insert_task(&next).await?;
        self.queue.lock().unwrap().push(self.entry_for(&next));
        debug!(
            task_id = %task.id,
            next_task_id = %next_id,
            every_secs = every,
            "recurring task rescheduled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskKind;
    use crate::persistence::MemoryStore;
    use crate::resilience::{BackoffStrategy, RetryPolicy};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    /// Runner double that records per-key and global concurrency.
    struct TrackingRunner {
        delay: std::time::Duration,
        fail: bool,
        active: Mutex<HashMap<(String, &'static str), usize>>,
        global_active: AtomicUsize,
        max_per_key: AtomicUsize,
        max_global: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    impl TrackingRunner {
        fn new(delay_ms: u64, fail: bool) -> Self {
            Self {
                delay: std::time::Duration::from_millis(delay_ms),
                fail,
                active: Mutex::new(HashMap::new()),
                global_active: AtomicUsize::new(0),
                max_per_key: AtomicUsize::new(0),
                max_global: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TaskRunner for TrackingRunner {
        async fn run(&self, task: &AccountTask) -> Result<()> {
            let key = task.resource_key();
            {
                let mut active = self.active.lock().unwrap();
                let slot = active.entry(key.clone()).or_insert(0);
                *slot += 1;
                self.max_per_key.fetch_max(*slot, Ordering::SeqCst);
            }
            let global = self.global_active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_global.fetch_max(global, Ordering::SeqCst);
            self.order.lock().unwrap().push(task.account_id.clone());

            tokio::time::sleep(self.delay).await;

            self.global_active.fetch_sub(1, Ordering::SeqCst);
            *self.active.lock().unwrap().get_mut(&key).unwrap() -= 1;

            if self.fail {
                Err(TempoError::Internal("scripted failure".into()))
            } else {
                Ok(())
            }
        }
    }

    fn coordinator(
        runner: Arc<TrackingRunner>,
        config: CoordinatorConfig,
    ) -> (TaskCoordinator, Arc<MemoryStore>, Arc<AlertManager>) {
        let store = Arc::new(MemoryStore::new());
        let alerts = Arc::new(AlertManager::with_defaults());
        let coordinator = TaskCoordinator::new(config, store.clone(), runner, alerts.clone());
        (coordinator, store, alerts)
    }

    fn fast_requeue() -> RetryPolicy {
        RetryPolicy {
            strategy: BackoffStrategy::Fixed,
            base_delay_ms: 50,
            max_delay_ms: 50,
            max_attempts: 3,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn no_two_tasks_share_an_account_resource_concurrently() {
        let runner = Arc::new(TrackingRunner::new(5, false));
        let (coordinator, store, _) = coordinator(
            runner.clone(),
            CoordinatorConfig {
                max_concurrency: 8,
                ..Default::default()
            },
        );

        // 50 tasks across 10 accounts, five per account on the same
        // resource key.
        for account in 0..10 {
            for _ in 0..5 {
                let task = AccountTask::new(
                    &format!("acct-{account}"),
                    TaskKind::AdvanceSlices,
                    TaskPriority::Medium,
                );
                coordinator.submit(task).await.unwrap();
            }
        }

        let completed = coordinator.drain_ready().await.unwrap();
        assert_eq!(completed, 50);
        assert_eq!(runner.max_per_key.load(Ordering::SeqCst), 1);
        assert!(runner.max_global.load(Ordering::SeqCst) <= 8);

        let tasks = store.list_tasks().await.unwrap();
        assert!(tasks.iter().all(|t| t.state == TaskState::Succeeded));
    }

    #[tokio::test]
    async fn worker_pool_is_bounded() {
        let runner = Arc::new(TrackingRunner::new(5, false));
        let (coordinator, _, _) = coordinator(
            runner.clone(),
            CoordinatorConfig {
                max_concurrency: 3,
                ..Default::default()
            },
        );

        for account in 0..12 {
            let task = AccountTask::new(
                &format!("acct-{account}"),
                TaskKind::AdvanceSlices,
                TaskPriority::Medium,
            );
            coordinator.submit(task).await.unwrap();
        }

        coordinator.drain_ready().await.unwrap();
        assert!(runner.max_global.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn critical_tasks_run_before_low_priority_ones() {
        let runner = Arc::new(TrackingRunner::new(1, false));
        let (coordinator, _, _) = coordinator(
            runner.clone(),
            CoordinatorConfig {
                max_concurrency: 1,
                ..Default::default()
            },
        );

        // Low submitted first, Critical second; Critical must still win.
        coordinator
            .submit(AccountTask::new(
                "acct-low",
                TaskKind::HealthCheck,
                TaskPriority::Low,
            ))
            .await
            .unwrap();
        coordinator
            .submit(AccountTask::new(
                "acct-critical",
                TaskKind::HealthCheck,
                TaskPriority::Critical,
            ))
            .await
            .unwrap();

        coordinator.drain_ready().await.unwrap();
        let order = runner.order.lock().unwrap().clone();
        assert_eq!(order, vec!["acct-critical", "acct-low"]);
    }

    #[tokio::test]
    async fn failed_task_retries_then_fails_with_alert() {
        let runner = Arc::new(TrackingRunner::new(0, true));
        let (coordinator, store, alerts) = coordinator(
            runner.clone(),
            CoordinatorConfig {
                max_concurrency: 2,
                task_max_attempts: 2,
                requeue: fast_requeue(),
                ..Default::default()
            },
        );
        let mut events = alerts.subscribe();

        let task = AccountTask::new("acct-1", TaskKind::AdvanceSlices, TaskPriority::High);
        let task_id = coordinator.submit(task).await.unwrap();

        coordinator.drain_ready().await.unwrap();
        // First attempt failed and requeued with backoff.
        let stored = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Retrying);
        assert_eq!(stored.attempts, 1);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        coordinator.drain_ready().await.unwrap();

        let stored = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Failed);
        assert_eq!(stored.attempts, 2);

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, "task_failed");
    }

    #[tokio::test]
    async fn recurring_task_enqueues_its_next_occurrence() {
        let runner = Arc::new(TrackingRunner::new(0, false));
        let (coordinator, store, _) = coordinator(runner, CoordinatorConfig::default());

        let task = AccountTask::new("acct-1", TaskKind::HealthCheck, TaskPriority::Low)
            .recurring(3600);
        let first_id = coordinator.submit(task).await.unwrap();

        coordinator.drain_ready().await.unwrap();

        let tasks = store.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 2);
        let next = tasks.iter().find(|t| t.id != first_id).unwrap();
        assert_eq!(next.state, TaskState::Queued);
        assert!(next.scheduled_at > Utc::now() + ChronoDuration::minutes(50));
    }

    #[tokio::test]
    async fn restore_requeues_open_tasks_and_resets_crashed_runners() {
        let runner = Arc::new(TrackingRunner::new(0, false));
        let (coordinator, store, _) = coordinator(runner, CoordinatorConfig::default());

        let queued = AccountTask::new("acct-1", TaskKind::AdvanceSlices, TaskPriority::High);
        let mut crashed = AccountTask::new("acct-2", TaskKind::AdvanceSlices, TaskPriority::High);
        crashed.state = TaskState::Running;
        store.insert_task(&queued).await.unwrap();
        store.insert_task(&crashed).await.unwrap();

        let restored = coordinator.restore().await.unwrap();
        assert_eq!(restored, 2);

        let stored = store.get_task(crashed.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Queued);

        let completed = coordinator.drain_ready().await.unwrap();
        assert_eq!(completed, 2);
    }

    #[tokio::test]
    async fn cancel_stops_a_queued_task() {
        let runner = Arc::new(TrackingRunner::new(0, false));
        let (coordinator, store, _) = coordinator(runner.clone(), CoordinatorConfig::default());

        let task = AccountTask::new("acct-1", TaskKind::AdvanceSlices, TaskPriority::Low)
            .at(Utc::now() + ChronoDuration::hours(1));
        let task_id = coordinator.submit(task).await.unwrap();

        assert!(coordinator.cancel(task_id).await.unwrap());
        let stored = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Failed);

        coordinator.drain_ready().await.unwrap();
        assert!(runner.order.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_aggregates_by_account_and_kind() {
        let runner = Arc::new(TrackingRunner::new(0, false));
        let (coordinator, _, _) = coordinator(runner, CoordinatorConfig::default());

        for account in ["acct-1", "acct-1", "acct-2"] {
            coordinator
                .submit(AccountTask::new(
                    account,
                    TaskKind::HealthCheck,
                    TaskPriority::Low,
                ))
                .await
                .unwrap();
        }
        coordinator.drain_ready().await.unwrap();

        let health = coordinator.health().await.unwrap();
        assert_eq!(health.by_account["acct-1"].succeeded, 2);
        assert_eq!(health.by_account["acct-2"].succeeded, 1);
        assert_eq!(health.by_kind["health_check"].succeeded, 3);
        assert_eq!(health.running, 0);
    }
}
