mod config;
mod coordinator;
mod runtime;
mod state;

pub use config::CoordinatorConfig;
pub use coordinator::{TaskCoordinator, TaskRunner};
pub use runtime::ExecutionRuntime;
pub use state::{HealthReport, PlanProgress, StatusReport, TaskStateCounts};
