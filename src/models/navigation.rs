//! # Derived Execution State
//!
//! Read-only queries over an [`Execution`] that message handlers branch on:
//! stage graph navigation (upstream, downstream, synthetic children) and the
//! status roll-ups for stages and whole executions.
//!
//! Stages do not hold a reference to their execution, so every helper takes
//! the stage being asked about as an argument.

use super::execution::Execution;
use super::stage::{Stage, SyntheticStageOwner};
use crate::constants::{context_keys, status_groups, ExecutionStatus};
use std::collections::{HashSet, VecDeque};

impl Execution {
    /// Top-level stages with no requisites
    pub fn initial_stages(&self) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|s| s.parent_stage_id.is_none() && s.is_initial())
            .collect()
    }

    pub fn top_level_stages(&self) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|s| s.parent_stage_id.is_none())
            .collect()
    }

    pub fn synthetic_stages(&self, stage_id: &str) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|s| s.parent_stage_id.as_deref() == Some(stage_id))
            .collect()
    }

    pub fn before_stages(&self, stage_id: &str) -> Vec<&Stage> {
        self.owned_stages(stage_id, SyntheticStageOwner::StageBefore)
    }

    pub fn after_stages(&self, stage_id: &str) -> Vec<&Stage> {
        self.owned_stages(stage_id, SyntheticStageOwner::StageAfter)
    }

    /// Before stages that do not wait on a sibling
    pub fn first_before_stages(&self, stage_id: &str) -> Vec<&Stage> {
        self.before_stages(stage_id)
            .into_iter()
            .filter(|s| s.is_initial())
            .collect()
    }

    pub fn first_after_stages(&self, stage_id: &str) -> Vec<&Stage> {
        self.after_stages(stage_id)
            .into_iter()
            .filter(|s| s.is_initial())
            .collect()
    }

    /// Every stage nested beneath `stage_id`, children before grandchildren
    pub fn descendant_stages(&self, stage_id: &str) -> Vec<&Stage> {
        let mut found = Vec::new();
        let mut pending = VecDeque::from([stage_id.to_string()]);
        while let Some(parent) = pending.pop_front() {
            for child in self.synthetic_stages(&parent) {
                pending.push_back(child.id.clone());
                found.push(child);
            }
        }
        found
    }

    pub fn parent(&self, stage: &Stage) -> Option<&Stage> {
        stage
            .parent_stage_id
            .as_deref()
            .and_then(|id| self.stage_by_id(id))
    }

    /// Stages whose ref id appears in `stage`'s requisites
    pub fn upstream_stages(&self, stage: &Stage) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|s| stage.requisite_stage_ref_ids.contains(&s.ref_id))
            .collect()
    }

    /// Stages that list `stage` as a requisite
    pub fn downstream_stages(&self, stage: &Stage) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|s| s.requisite_stage_ref_ids.contains(&stage.ref_id))
            .collect()
    }

    /// Transitive closure of [`Execution::downstream_stages`]
    pub fn all_downstream_stages(&self, stage: &Stage) -> Vec<&Stage> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut found = Vec::new();
        let mut pending: VecDeque<&Stage> = VecDeque::from([stage]);
        while let Some(current) = pending.pop_front() {
            for next in self.downstream_stages(current) {
                if seen.insert(next.id.as_str()) {
                    found.push(next);
                    pending.push_back(next);
                }
            }
        }
        found
    }

    pub fn all_upstream_stages_complete(&self, stage: &Stage) -> bool {
        self.upstream_stages(stage)
            .iter()
            .all(|s| status_groups::is_completed_ok(s.status))
    }

    /// True when an upstream failed, or a not-started upstream can never run
    /// because one of its own upstreams failed
    pub fn any_upstream_stages_failed(&self, stage: &Stage) -> bool {
        let mut visited = HashSet::new();
        self.upstream_failed(stage, &mut visited)
    }

    fn upstream_failed<'a>(&'a self, stage: &'a Stage, visited: &mut HashSet<&'a str>) -> bool {
        if !visited.insert(stage.id.as_str()) {
            return false;
        }
        self.upstream_stages(stage).into_iter().any(|upstream| {
            status_groups::is_failed(upstream.status)
                || (upstream.status == ExecutionStatus::NotStarted
                    && self.upstream_failed(upstream, visited))
        })
    }

    pub fn all_before_stages_successful(&self, stage_id: &str) -> bool {
        self.before_stages(stage_id)
            .iter()
            .all(|s| status_groups::is_completed_ok(s.status))
    }

    pub fn any_before_stages_failed(&self, stage_id: &str) -> bool {
        self.before_stages(stage_id)
            .iter()
            .any(|s| status_groups::is_failed(s.status))
    }

    pub fn all_after_stages_complete(&self, stage_id: &str) -> bool {
        self.after_stages(stage_id)
            .iter()
            .all(|s| s.status.is_complete())
    }

    /// Stage or any ancestor flagged for manual skip
    pub fn is_manually_skipped(&self, stage: &Stage) -> bool {
        let mut current = Some(stage);
        let mut depth = 0;
        while let Some(s) = current {
            if s.context_flag(context_keys::MANUAL_SKIP) {
                return true;
            }
            depth += 1;
            if depth > self.stages.len() {
                break;
            }
            current = self.parent(s);
        }
        false
    }

    /// Nearest stage (self or ancestor) carrying a stage timeout
    pub fn parent_with_timeout<'a>(&'a self, stage: &'a Stage) -> Option<&'a Stage> {
        let mut current = Some(stage);
        let mut depth = 0;
        while let Some(s) = current {
            if s.context_u64(context_keys::STAGE_TIMEOUT_MS).is_some() {
                return Some(s);
            }
            depth += 1;
            if depth > self.stages.len() {
                break;
            }
            current = self.parent(s);
        }
        None
    }

    /// Milliseconds `stage` spent waiting in its time-window before stage
    pub fn time_window_ms(&self, stage: &Stage) -> i64 {
        self.before_stages(&stage.id)
            .into_iter()
            .filter(|s| s.stage_type == crate::pipeline::TIME_WINDOW_STAGE_TYPE)
            .filter_map(|s| match (s.start_time, s.end_time) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
                _ => None,
            })
            .sum()
    }

    /// Roll a stage's status up from its tasks and synthetic children.
    ///
    /// After stages that have not started yet are left out, so a stage whose
    /// own work is done reports success and the caller can kick them off.
    pub fn stage_determine_status(&self, stage: &Stage) -> ExecutionStatus {
        let after_started = self
            .after_stages(&stage.id)
            .iter()
            .any(|s| s.status != ExecutionStatus::NotStarted);

        let mut statuses: Vec<ExecutionStatus> = self
            .synthetic_stages(&stage.id)
            .into_iter()
            .filter(|s| after_started || s.synthetic_stage_owner != Some(SyntheticStageOwner::StageAfter))
            .map(|s| s.status)
            .collect();
        statuses.extend(stage.tasks.iter().map(|t| t.status));
        if stage.has_planning_failure() {
            statuses.push(stage.failure_status(ExecutionStatus::Terminal));
        }

        if statuses.is_empty() {
            return ExecutionStatus::Succeeded;
        }
        if statuses.contains(&ExecutionStatus::Terminal) {
            return stage.failure_status(ExecutionStatus::Terminal);
        }
        if statuses.contains(&ExecutionStatus::Stopped) {
            return ExecutionStatus::Stopped;
        }
        if statuses.contains(&ExecutionStatus::Canceled) {
            return ExecutionStatus::Canceled;
        }
        if statuses.contains(&ExecutionStatus::FailedContinue) {
            return ExecutionStatus::FailedContinue;
        }
        if statuses
            .iter()
            .all(|s| matches!(s, ExecutionStatus::Succeeded | ExecutionStatus::Skipped))
        {
            return ExecutionStatus::Succeeded;
        }
        if statuses.iter().any(|s| !s.is_complete()) {
            return ExecutionStatus::Running;
        }
        ExecutionStatus::Terminal
    }

    /// Final status from the top-level stages; `Running` while undecided
    pub fn execution_determine_status(&self) -> ExecutionStatus {
        let top_level = self.top_level_stages();
        let statuses: Vec<ExecutionStatus> = top_level.iter().map(|s| s.status).collect();

        if statuses.iter().all(|s| status_groups::is_completed_ok(*s)) {
            return ExecutionStatus::Succeeded;
        }
        if statuses.contains(&ExecutionStatus::Terminal) {
            return ExecutionStatus::Terminal;
        }
        if statuses.contains(&ExecutionStatus::Canceled) {
            return ExecutionStatus::Canceled;
        }
        if statuses.contains(&ExecutionStatus::Stopped) && !self.other_branches_incomplete() {
            return ExecutionStatus::Succeeded;
        }
        if self.canceled && !statuses.contains(&ExecutionStatus::Running) {
            return ExecutionStatus::Canceled;
        }
        ExecutionStatus::Running
    }

    /// Whether some top-level branch can still make progress
    fn other_branches_incomplete(&self) -> bool {
        self.top_level_stages().into_iter().any(|s| {
            s.status == ExecutionStatus::Running
                || (s.status == ExecutionStatus::NotStarted && self.all_upstream_stages_complete(s))
        })
    }

    fn owned_stages(&self, stage_id: &str, owner: SyntheticStageOwner) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|s| {
                s.parent_stage_id.as_deref() == Some(stage_id)
                    && s.synthetic_stage_owner == Some(owner)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Task;

    fn child(parent: &Stage, ref_id: &str, owner: SyntheticStageOwner, requisites: &[&str]) -> Stage {
        let mut stage = Stage::new("wait", ref_id, ref_id).with_requisites(requisites.iter().copied());
        stage.parent_stage_id = Some(parent.id.clone());
        stage.synthetic_stage_owner = Some(owner);
        stage
    }

    #[test]
    fn test_upstream_failure_propagates_through_not_started() {
        let mut a = Stage::new("wait", "a", "1");
        a.status = ExecutionStatus::Terminal;
        let b = Stage::new("wait", "b", "2").with_requisites(["1"]);
        let c = Stage::new("wait", "c", "3").with_requisites(["2"]);
        let execution = Execution::pipeline("app").with_stage(a).with_stage(b).with_stage(c);

        let c = execution.stage_by_ref("3").unwrap();
        assert!(execution.any_upstream_stages_failed(c));
        assert!(!execution.all_upstream_stages_complete(c));
    }

    #[test]
    fn test_before_and_after_groups() {
        let parent = Stage::new("wait", "parent", "1");
        let before_1 = child(&parent, "1<1", SyntheticStageOwner::StageBefore, &[]);
        let before_2 = child(&parent, "1<2", SyntheticStageOwner::StageBefore, &["1<1"]);
        let after_1 = child(&parent, "1>1", SyntheticStageOwner::StageAfter, &[]);
        let parent_id = parent.id.clone();
        let execution = Execution::pipeline("app")
            .with_stage(before_1)
            .with_stage(before_2)
            .with_stage(parent)
            .with_stage(after_1);

        let firsts: Vec<&str> = execution
            .first_before_stages(&parent_id)
            .iter()
            .map(|s| s.ref_id.as_str())
            .collect();
        assert_eq!(firsts, vec!["1<1"]);
        assert_eq!(execution.first_after_stages(&parent_id).len(), 1);
        assert_eq!(execution.initial_stages().len(), 1);
        assert_eq!(execution.descendant_stages(&parent_id).len(), 3);
        assert!(!execution.all_before_stages_successful(&parent_id));
    }

    #[test]
    fn test_stage_status_ignores_unstarted_after_stages() {
        let mut parent = Stage::new("wait", "parent", "1");
        let mut task = Task::new("1", "wait", "WaitTask");
        task.status = ExecutionStatus::Succeeded;
        parent.tasks.push(task);
        let after = child(&parent, "1>1", SyntheticStageOwner::StageAfter, &[]);
        let execution = Execution::pipeline("app").with_stage(parent).with_stage(after);

        let parent = &execution.stages[0];
        assert_eq!(execution.stage_determine_status(parent), ExecutionStatus::Succeeded);
    }

    #[test]
    fn test_stopped_branch_succeeds_when_nothing_else_runs() {
        let mut a = Stage::new("wait", "a", "1");
        a.status = ExecutionStatus::Stopped;
        let mut b = Stage::new("wait", "b", "2");
        b.status = ExecutionStatus::Running;
        let mut execution = Execution::pipeline("app").with_stage(a).with_stage(b);

        assert_eq!(execution.execution_determine_status(), ExecutionStatus::Running);
        execution.stages[1].status = ExecutionStatus::Succeeded;
        assert_eq!(execution.execution_determine_status(), ExecutionStatus::Succeeded);
    }

    #[test]
    fn test_canceled_execution_with_nothing_running() {
        let mut execution = Execution::pipeline("app").with_stage(Stage::new("wait", "a", "1"));
        execution.canceled = true;
        assert_eq!(execution.execution_determine_status(), ExecutionStatus::Canceled);
    }
}
