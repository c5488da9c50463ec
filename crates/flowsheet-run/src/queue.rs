//! Job dispatch.
//!
//! The interactive path never runs a stage inline: it enqueues work by run
//! id and polls status. Delivery is at-least-once: job bodies tolerate
//! redelivery because stages re-run from the top and converge on the same
//! target status.

use crate::Orchestrator;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Extraction,
    Generation,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Extraction => "extraction",
            JobStage::Generation => "generation",
        }
    }
}

/// Fire-and-forget job trigger.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, stage: JobStage, run_id: Uuid);
}

/// Queue that runs jobs as spawned tokio tasks in the current process.
pub struct LocalQueue {
    orchestrator: Arc<Orchestrator>,
}

impl LocalQueue {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

impl JobQueue for LocalQueue {
    fn enqueue(&self, stage: JobStage, run_id: Uuid) {
        info!(run_id = %run_id, stage = stage.as_str(), "enqueued job");
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            match stage {
                JobStage::Extraction => orchestrator.extraction_job(run_id).await,
                JobStage::Generation => orchestrator.generation_job(run_id).await,
            }
        });
    }
}
