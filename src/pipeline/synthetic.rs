//! # Synthetic Stage Planning
//!
//! Expands one stage of an execution into its tasks and the synthetic stages
//! its builder requests. Planning is a pure function of the execution, the
//! stage and the builder registry; [`StagePlan::apply`] splices the result
//! into the execution's flat stage list.
//!
//! Ref ids of synthetic stages derive from the parent's ref id:
//!
//! | group    | ref id       | requisites                          |
//! |----------|--------------|-------------------------------------|
//! | before   | `parent<i`   | the previous before stage           |
//! | parallel | `parent=i`   | the time-window stage, if any       |
//! | after    | `parent>i`   | the previous after stage            |
//!
//! When the parent's context sets `restrictExecutionDuringTimeWindow`, a
//! time-window stage is always the first before stage. Its context is the
//! parent's minus that flag; every other synthetic stage has both time-window
//! keys removed so the restriction is never planned twice.

use super::errors::{PlanningError, PlanningResult};
use super::stage_definition::{StageBuilderRegistry, StageRequest};
use super::TIME_WINDOW_STAGE_TYPE;
use crate::constants::context_keys;
use crate::models::{Execution, Stage, StagePosition, SyntheticStageOwner};
use uuid::Uuid;

/// Planned stage plus the synthetic stages to splice around it
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    pub stage: Stage,
    /// Before and parallel stages, in execution order
    pub before: Vec<Stage>,
    pub after: Vec<Stage>,
}

impl StagePlan {
    /// Write the planned stage back and insert its synthetic stages next to
    /// it. Synthetic stages already present are replaced in place.
    pub fn apply(self, execution: &mut Execution) {
        let placements = self.placements(&self.stage.id);
        execution.upsert_stage(self.stage);

        for (stage, position) in placements {
            execution.place_stage(stage, &position);
        }
    }

    /// Synthetic stages paired with where they go, in insertion order
    pub fn placements(&self, parent_id: &str) -> Vec<(Stage, StagePosition)> {
        let before = self
            .before
            .iter()
            .map(|s| (s.clone(), StagePosition::Before(parent_id.to_string())));
        let after = self
            .after
            .iter()
            .rev()
            .map(|s| (s.clone(), StagePosition::After(parent_id.to_string())));
        before.chain(after).collect()
    }

    pub fn synthetic_count(&self) -> usize {
        self.before.len() + self.after.len()
    }
}

/// Plan `stage_id`: flatten its task graph and build its synthetic stages
pub fn plan_stage(
    execution: &Execution,
    stage_id: &str,
    registry: &StageBuilderRegistry,
) -> PlanningResult<StagePlan> {
    let parent = execution
        .stage_by_id(stage_id)
        .ok_or_else(|| PlanningError::stage_not_found(stage_id))?;
    let builder = registry.get(&parent.stage_type)?;

    let mut stage = parent.clone();
    stage.tasks = builder.task_graph(parent).flatten();

    let mut before = Vec::new();
    let mut time_window_ref = None;
    if parent.context_flag(context_keys::RESTRICT_EXECUTION_DURING_TIME_WINDOW)
        && parent.stage_type != TIME_WINDOW_STAGE_TYPE
    {
        let mut context = parent.context.clone();
        context.remove(context_keys::RESTRICT_EXECUTION_DURING_TIME_WINDOW);
        let request = StageRequest::new(TIME_WINDOW_STAGE_TYPE, "Restrict Execution During")
            .with_context(context);
        let window = synthetic(execution, parent, &request, format!("{}<1", parent.ref_id), SyntheticStageOwner::StageBefore);
        time_window_ref = Some(window.ref_id.clone());
        before.push(window);
    }

    let mut previous = time_window_ref.clone();
    for request in builder.before_stages(parent) {
        let ref_id = format!("{}<{}", parent.ref_id, before.len() + 1);
        let mut child = synthetic(execution, parent, &sanitized(request), ref_id, SyntheticStageOwner::StageBefore);
        child.requisite_stage_ref_ids = previous.iter().cloned().collect();
        previous = Some(child.ref_id.clone());
        before.push(child);
    }

    for (index, request) in builder.parallel_stages(parent).into_iter().enumerate() {
        let ref_id = format!("{}={}", parent.ref_id, index + 1);
        let mut child = synthetic(execution, parent, &sanitized(request), ref_id, SyntheticStageOwner::StageBefore);
        child.requisite_stage_ref_ids = time_window_ref.iter().cloned().collect();
        before.push(child);
    }

    let mut after: Vec<Stage> = Vec::new();
    for (index, request) in builder.after_stages(parent).into_iter().enumerate() {
        let ref_id = format!("{}>{}", parent.ref_id, index + 1);
        let mut child = synthetic(execution, parent, &sanitized(request), ref_id, SyntheticStageOwner::StageAfter);
        child.requisite_stage_ref_ids = after.last().map(|s| s.ref_id.clone()).into_iter().collect();
        after.push(child);
    }

    Ok(StagePlan { stage, before, after })
}

fn sanitized(mut request: StageRequest) -> StageRequest {
    if request.stage_type != TIME_WINDOW_STAGE_TYPE {
        request.context.remove(context_keys::RESTRICT_EXECUTION_DURING_TIME_WINDOW);
        request.context.remove(context_keys::RESTRICTED_EXECUTION_WINDOW);
    }
    request
}

fn synthetic(
    execution: &Execution,
    parent: &Stage,
    request: &StageRequest,
    ref_id: String,
    owner: SyntheticStageOwner,
) -> Stage {
    let id = synthetic_stage_id(&execution.id, &parent.id, &ref_id);
    let mut stage = Stage::new(&request.stage_type, &request.name, ref_id).with_id(id);
    stage.context = request.context.clone();
    stage.parent_stage_id = Some(parent.id.clone());
    stage.synthetic_stage_owner = Some(owner);
    stage
}

/// Deterministic id so replanning the same stage yields the same children
pub fn synthetic_stage_id(execution_id: &str, parent_id: &str, ref_id: &str) -> String {
    let name = format!("{execution_id}/{parent_id}/{ref_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}
