//! # Messaging
//!
//! The typed message vocabulary driving the execution state machine.

pub mod message;

pub use message::{
    CancelExecution, CompleteTask, ContinueParentStage, ExecutionAddress, InvalidTaskType,
    Message, MessageKind, RestartStage, RunTask, StageAddress, StartWaitingExecutions,
    TaskAddress, RUN_TASK_ACK_TIMEOUT,
};
