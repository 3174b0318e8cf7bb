mod common;

use common::strategies::*;
use common::{pipeline, test_system};
use orca_queue::models::{assign_phases, topological_order, Stage};
use orca_queue::pipeline::PlanningError;
use orca_queue::ExecutionStatus;
use proptest::prelude::*;
use std::collections::HashMap;

fn position_of(order: &[&Stage]) -> HashMap<String, usize> {
    order
        .iter()
        .enumerate()
        .map(|(i, stage)| (stage.ref_id.clone(), i))
        .collect()
}

proptest! {
    /// Property: every stage sits in a later phase than each of its requisites
    #[test]
    fn phases_respect_requisites(stages in stage_dag_strategy(12)) {
        let phases = assign_phases(&stages).expect("acyclic graphs settle");

        for stage in &stages {
            let phase = phases[&stage.ref_id];
            if stage.requisite_stage_ref_ids.is_empty() {
                prop_assert_eq!(phase, 0);
            }
            for requisite in &stage.requisite_stage_ref_ids {
                prop_assert!(phases[requisite] < phase, "{} must follow {}", stage.ref_id, requisite);
            }
        }
    }

    /// Property: topological order never places a stage before its requisites
    #[test]
    fn topological_order_follows_requisites(stages in stage_dag_strategy(12)) {
        let order = topological_order(&stages).expect("acyclic graphs order");
        prop_assert_eq!(order.len(), stages.len());

        let position = position_of(&order);
        for stage in &stages {
            for requisite in &stage.requisite_stage_ref_ids {
                prop_assert!(position[requisite] < position[&stage.ref_id]);
            }
        }
    }

    /// Property: a stage that requires itself is always reported as a cycle
    #[test]
    fn self_requisite_is_a_cycle(stages in stage_dag_strategy(8), pick in any::<prop::sample::Index>()) {
        let mut stages = stages;
        let target = pick.index(stages.len());
        let ref_id = stages[target].ref_id.clone();
        stages[target].requisite_stage_ref_ids.insert(ref_id.clone());

        match assign_phases(&stages) {
            Err(PlanningError::CyclicRequisites { ref_ids }) => prop_assert!(ref_ids.contains(&ref_id)),
            other => prop_assert!(false, "expected a cycle, got {:?}", other),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Property: any acyclic graph of zero-length waits runs to success
    #[test]
    fn acyclic_pipelines_run_to_success(stages in stage_dag_strategy(8)) {
        let stored = tokio_test::block_on(async {
            let t = test_system().await;
            let execution = stages
                .iter()
                .cloned()
                .fold(pipeline(), |execution, stage| execution.with_stage(stage));
            let address = t.submit(&execution).await;
            t.run().await;
            t.execution(&address).await
        });

        prop_assert_eq!(stored.status, ExecutionStatus::Succeeded);
        for stage in &stored.stages {
            prop_assert_eq!(stage.status, ExecutionStatus::Succeeded, "stage {}", &stage.ref_id);
        }
    }
}
