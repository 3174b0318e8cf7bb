//! # Execution Models
//!
//! The execution aggregate (`Execution` → `Stage` → `Task`) the queue handlers
//! read and mutate, plus phase assignment and the derived-state helpers.

pub mod execution;
pub mod navigation;
pub mod phase;
pub mod stage;
pub mod task;

pub use execution::{Execution, ExecutionType, PausedDetails, StagePosition};
pub use phase::{assign_phases, topological_order};
pub use stage::{Stage, SyntheticStageOwner};
pub use task::Task;
