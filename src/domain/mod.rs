mod plan;
mod task;

pub use plan::{
    ExecutionPlan, OrderSide, PlanFailure, PlanStatus, Slice, SliceStatus, VolatilityRegime,
};
pub use task::{AccountTask, TaskKind, TaskPriority, TaskState};
