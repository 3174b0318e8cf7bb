//! # Phase Assignment
//!
//! A stage's phase is its topological rank over `requisite_stage_ref_ids`:
//! zero without requisites, otherwise one more than the highest requisite
//! phase. Values are relaxed in repeated passes until nothing changes. A
//! requisite graph with a cycle never settles, so the pass count is bounded by
//! the stage count and exceeding it is reported as
//! [`PlanningError::CyclicRequisites`].
//!
//! Requisite ref ids that do not name a stage in the input are ignored.

use super::stage::Stage;
use crate::pipeline::PlanningError;
use std::collections::HashMap;

/// Phase per stage ref id
pub fn assign_phases(stages: &[Stage]) -> Result<HashMap<String, usize>, PlanningError> {
    let mut phases: HashMap<String, usize> =
        stages.iter().map(|s| (s.ref_id.clone(), 0)).collect();

    for _ in 0..=stages.len() + 1 {
        let mut changed = Vec::new();
        for stage in stages {
            let phase = stage
                .requisite_stage_ref_ids
                .iter()
                .filter_map(|r| phases.get(r))
                .max()
                .map(|p| p + 1)
                .unwrap_or(0);
            if phases.get(&stage.ref_id) != Some(&phase) {
                phases.insert(stage.ref_id.clone(), phase);
                changed.push(stage.ref_id.clone());
            }
        }
        if changed.is_empty() {
            return Ok(phases);
        }
    }

    let mut ref_ids: Vec<String> = stages
        .iter()
        .filter(|s| {
            s.requisite_stage_ref_ids
                .iter()
                .any(|r| phases.contains_key(r))
        })
        .map(|s| s.ref_id.clone())
        .collect();
    ref_ids.sort();
    Err(PlanningError::CyclicRequisites { ref_ids })
}

/// Stages sorted by `(phase, ref_id)`
pub fn topological_order(stages: &[Stage]) -> Result<Vec<&Stage>, PlanningError> {
    let phases = assign_phases(stages)?;
    let mut ordered: Vec<&Stage> = stages.iter().collect();
    ordered.sort_by(|a, b| {
        let pa = phases.get(&a.ref_id).copied().unwrap_or(0);
        let pb = phases.get(&b.ref_id).copied().unwrap_or(0);
        pa.cmp(&pb).then_with(|| a.ref_id.cmp(&b.ref_id))
    });
    Ok(ordered)
}
