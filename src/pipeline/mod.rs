//! # Execution Planning
//!
//! Turns a declared stage into runnable work: flattening its task graph,
//! injecting synthetic before/after/parallel stages, and the built-in
//! time-window and wait stage types.

pub mod errors;
pub mod stage_definition;
pub mod synthetic;
pub mod task_graph;
pub mod time_window;
pub mod wait;

pub use errors::{PlanningError, PlanningResult};
pub use stage_definition::{StageBuilderRegistry, StageDefinitionBuilder, StageRequest};
pub use synthetic::{plan_stage, synthetic_stage_id, StagePlan};
pub use task_graph::{TaskDefinition, TaskGraph, TaskGraphBuilder, TaskNode};
pub use time_window::{
    RestrictExecutionDuringTimeWindowStage, RestrictedExecutionWindow, TimeWindow,
    WaitForTimeWindowTask, WAIT_FOR_TIME_WINDOW_TASK,
};
pub use wait::{WaitStage, WaitTask, WAIT_STAGE_TYPE, WAIT_TASK};

/// Stage type of the synthetic time-window restriction stage
pub const TIME_WINDOW_STAGE_TYPE: &str = "restrictExecutionDuringTimeWindow";
