use orca_queue::models::Stage;
use proptest::prelude::*;
use proptest::sample::Index;

/// Strategy for stage graphs that are acyclic by construction: each stage may
/// only depend on stages generated before it
pub fn stage_dag_strategy(max_stages: usize) -> impl Strategy<Value = Vec<Stage>> {
    prop::collection::vec(prop::collection::vec(any::<Index>(), 0..3), 1..=max_stages).prop_map(
        |requisites| {
            requisites
                .into_iter()
                .enumerate()
                .map(|(i, picks)| {
                    let upstream: Vec<String> = if i == 0 {
                        Vec::new()
                    } else {
                        picks.iter().map(|pick| (pick.index(i) + 1).to_string()).collect()
                    };
                    Stage::new("wait", format!("stage {}", i + 1), (i + 1).to_string())
                        .with_requisites(upstream)
                })
                .collect()
        },
    )
}
