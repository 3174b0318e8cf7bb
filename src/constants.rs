//! # System Constants
//!
//! Execution status values shared by executions, stages and tasks, plus the
//! status groups that message handlers branch on when deciding whether to
//! advance, wait or fail a piece of work.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an execution, stage or task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    #[default]
    NotStarted,
    Running,
    Paused,
    Suspended,
    Succeeded,
    FailedContinue,
    Terminal,
    Canceled,
    Redirect,
    Stopped,
    Skipped,
    Buffered,
}

impl ExecutionStatus {
    /// Whether the status is final for the unit of work carrying it
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::FailedContinue
                | Self::Terminal
                | Self::Canceled
                | Self::Stopped
                | Self::Skipped
        )
    }

    /// Whether the status halts the surrounding flow
    pub fn is_halt(&self) -> bool {
        matches!(self, Self::Terminal | Self::Canceled | Self::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Suspended => "SUSPENDED",
            Self::Succeeded => "SUCCEEDED",
            Self::FailedContinue => "FAILED_CONTINUE",
            Self::Terminal => "TERMINAL",
            Self::Canceled => "CANCELED",
            Self::Redirect => "REDIRECT",
            Self::Stopped => "STOPPED",
            Self::Skipped => "SKIPPED",
            Self::Buffered => "BUFFERED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status groupings used by the derived-state helpers
pub mod status_groups {
    use super::ExecutionStatus;

    /// Statuses that let downstream work proceed
    pub const COMPLETED_OK: &[ExecutionStatus] = &[
        ExecutionStatus::Succeeded,
        ExecutionStatus::FailedContinue,
        ExecutionStatus::Skipped,
    ];

    /// Statuses that block downstream work
    pub const FAILED: &[ExecutionStatus] = &[
        ExecutionStatus::Terminal,
        ExecutionStatus::Stopped,
        ExecutionStatus::Canceled,
    ];

    pub fn is_completed_ok(status: ExecutionStatus) -> bool {
        COMPLETED_OK.contains(&status)
    }

    pub fn is_failed(status: ExecutionStatus) -> bool {
        FAILED.contains(&status)
    }
}

/// Well-known context keys read or written by the queue handlers
pub mod context_keys {
    pub const RESTRICT_EXECUTION_DURING_TIME_WINDOW: &str = "restrictExecutionDuringTimeWindow";
    pub const RESTRICTED_EXECUTION_WINDOW: &str = "restrictedExecutionWindow";
    pub const STAGE_TIMEOUT_MS: &str = "stageTimeoutMs";
    pub const CONTINUE_PIPELINE: &str = "continuePipeline";
    pub const FAIL_PIPELINE: &str = "failPipeline";
    pub const MANUAL_SKIP: &str = "manualSkip";
    pub const MARK_SUCCESSFUL_ON_TIMEOUT: &str = "markSuccessfulOnTimeout";
    pub const BEFORE_STAGE_PLANNING_FAILED: &str = "beforeStagePlanningFailed";
    pub const EXCEPTION: &str = "exception";
    pub const RESTART_DETAILS: &str = "restartDetails";
    pub const SKIP_REMAINING_WAIT: &str = "skipRemainingWait";
    pub const WAIT_TIME: &str = "waitTime";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_and_halt_groups() {
        assert!(ExecutionStatus::Succeeded.is_complete());
        assert!(ExecutionStatus::Skipped.is_complete());
        assert!(!ExecutionStatus::Running.is_complete());
        assert!(!ExecutionStatus::Redirect.is_complete());

        assert!(ExecutionStatus::Stopped.is_halt());
        assert!(!ExecutionStatus::FailedContinue.is_halt());
    }

    #[test]
    fn test_status_groups_are_disjoint() {
        for status in status_groups::COMPLETED_OK {
            assert!(!status_groups::is_failed(*status));
        }
    }

    #[test]
    fn test_status_serialization_matches_wire_names() {
        let json = serde_json::to_string(&ExecutionStatus::FailedContinue).unwrap();
        assert_eq!(json, "\"FAILED_CONTINUE\"");

        let parsed: ExecutionStatus = serde_json::from_str("\"NOT_STARTED\"").unwrap();
        assert_eq!(parsed, ExecutionStatus::NotStarted);
        assert_eq!(parsed.to_string(), "NOT_STARTED");
    }
}
