use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("Stage requisites form a cycle: {ref_ids:?}")]
    CyclicRequisites { ref_ids: Vec<String> },

    #[error("No stage definition builder registered for type '{stage_type}'")]
    UnknownStageType { stage_type: String },

    #[error("Stage not found in execution: {stage_id}")]
    StageNotFound { stage_id: String },
}

impl PlanningError {
    pub fn unknown_stage_type(stage_type: impl Into<String>) -> Self {
        Self::UnknownStageType {
            stage_type: stage_type.into(),
        }
    }

    pub fn stage_not_found(stage_id: impl Into<String>) -> Self {
        Self::StageNotFound {
            stage_id: stage_id.into(),
        }
    }
}

pub type PlanningResult<T> = Result<T, PlanningError>;
