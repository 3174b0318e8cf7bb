//! Orca Queue Demo
//!
//! Runs a small diamond-shaped pipeline of wait stages on the in-process
//! queue and logs every transition until it finishes or Ctrl-C is pressed.

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use orca_queue::bootstrap::OrcaQueueSystem;
use orca_queue::config::ConfigLoader;
use orca_queue::models::{Execution, Stage};
use orca_queue::queue::OtelQueueMetrics;
use orca_queue::repository::ExecutionRepository;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    orca_queue::logging::init_structured_logging();

    let config = ConfigLoader::new().load()?;
    let system = OrcaQueueSystem::builder()
        .with_config(config)
        .with_metrics(Arc::new(OtelQueueMetrics::new()))
        .build()
        .await?;
    system.start();

    let execution = Execution::pipeline("demo")
        .with_name("diamond")
        .with_stage(Stage::new("wait", "prepare", "1").with_context("waitTime", json!(1)))
        .with_stage(
            Stage::new("wait", "left", "2")
                .with_requisites(["1"])
                .with_context("waitTime", json!(2)),
        )
        .with_stage(
            Stage::new("wait", "right", "3")
                .with_requisites(["1"])
                .with_context("waitTime", json!(1)),
        )
        .with_stage(Stage::new("wait", "finish", "4").with_requisites(["2", "3"]));
    let address = system.submit(&execution).await?;
    info!(execution_id = %address.execution_id, "Demo pipeline submitted");

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                warn!("Interrupted, canceling demo pipeline");
                system.cancel(&address, Some("demo"), Some("interrupted")).await?;
                break;
            }
            _ = ticker.tick() => {
                let current = system
                    .repository()
                    .retrieve(address.execution_type, &address.execution_id)
                    .await?;
                if current.status.is_complete() {
                    info!(
                        execution_id = %current.id,
                        status = %current.status,
                        "✅ Demo pipeline finished"
                    );
                    break;
                }
            }
        }
    }

    system.shutdown().await?;
    Ok(())
}
