pub mod alert;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod logging;
pub mod persistence;
pub mod resilience;

pub use alert::{AlertEvent, AlertManager, AlertManagerConfig, AlertPort, AlertSeverity};
pub use config::{AppConfig, ExecutionConfig, LoggingConfig, ResilienceConfig};
pub use coordinator::{
    CoordinatorConfig, ExecutionRuntime, HealthReport, PlanProgress, StatusReport,
    TaskCoordinator, TaskRunner, TaskStateCounts,
};
pub use domain::{
    AccountTask, ExecutionPlan, OrderSide, PlanFailure, PlanStatus, Slice, SliceStatus, TaskKind,
    TaskPriority, TaskState, VolatilityRegime,
};
pub use error::{FailureClass, GatewayError, GatewayResult, Result, TempoError};
pub use execution::{ExecutionPlanner, SliceScheduler, TickOutcome};
pub use gateway::{OrderAck, OrderFill, OrderGateway, OrderState};
pub use persistence::{MemoryStore, PersistenceAdapter};
pub use resilience::{
    BackoffStrategy, BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState,
    CircuitState, RetryManager, RetryPolicy,
};
