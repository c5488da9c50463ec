//! Background jobs and the retry policy around them.
//!
//! Jobs are dispatched by run id and re-run from the top of their stage on
//! retry; stages are not checkpointed mid-way. A job never raises past its
//! boundary: once the retry budget is exhausted the run is marked failed
//! with the error message, and the error is logged.

use crate::{Run, RunError, RunStatus, RunStore};
use flowsheet_ingest_dxf::{extract_schema, ExtractOptions};
use flowsheet_pipeline::stages::{
    run_extraction_graph, run_generation_graph, ExtractionState, GenerationState,
};
use flowsheet_pipeline::{AgentRegistry, LlmError};
use flowsheet_review::RowPatch;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Title of the markdown projection handed to the narrative stage.
pub const FINAL_TABLE_TITLE: &str = "Modified Table after Human Review";

const MAX_ATTEMPTS: u32 = 3;

pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    registry: Arc<AgentRegistry>,
    options: ExtractOptions,
    /// Base retry delay; attempt `n` waits `n * base` before re-running.
    retry_base_delay: Duration,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn RunStore>, registry: Arc<AgentRegistry>) -> Self {
        Self {
            store,
            registry,
            options: ExtractOptions::default(),
            retry_base_delay: Duration::from_secs(60),
        }
    }

    pub fn with_options(mut self, options: ExtractOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Run creation and review surface
    // ------------------------------------------------------------------

    pub fn create_run(&self, name: &str, source_path: &Path) -> Result<Run, RunError> {
        let run = Run::new(name, source_path);
        info!(run_id = %run.id, name, "created run");
        self.store.insert(run.clone())?;
        Ok(run)
    }

    pub fn open_review(&self, run_id: Uuid) -> Result<Run, RunError> {
        self.with_run(run_id, |run| run.open_review())
    }

    pub fn approve_row(&self, run_id: Uuid, index: usize) -> Result<Run, RunError> {
        self.with_run(run_id, |run| run.approve_row(index))
    }

    pub fn submit_row_changes(
        &self,
        run_id: Uuid,
        index: usize,
        patch: RowPatch,
    ) -> Result<Run, RunError> {
        self.with_run(run_id, |run| run.submit_row_changes(index, patch))
    }

    pub fn save_row_draft(
        &self,
        run_id: Uuid,
        index: usize,
        patch: RowPatch,
    ) -> Result<Run, RunError> {
        self.with_run(run_id, |run| run.save_row_draft(index, patch))
    }

    /// Freeze the overlay and move to narrative generation. The caller
    /// enqueues the generation job afterwards.
    pub fn finalize(&self, run_id: Uuid, completed_by: &str) -> Result<Run, RunError> {
        self.with_run(run_id, |run| {
            run.finalize(completed_by)?;
            info!(run_id = %run.id, completed_by, "review finalized");
            Ok(())
        })
    }

    /// Read-modify-update one run. A rejected mutation leaves the store
    /// untouched.
    fn with_run(
        &self,
        run_id: Uuid,
        mutate: impl FnOnce(&mut Run) -> Result<(), RunError>,
    ) -> Result<Run, RunError> {
        let mut run = self.store.get(run_id)?;
        mutate(&mut run)?;
        self.store.update(run.clone())?;
        Ok(run)
    }

    // ------------------------------------------------------------------
    // Stage bodies
    // ------------------------------------------------------------------

    /// One attempt at the extraction stage: materialize the drawing into a
    /// scoped temp file, extract the entity graph, run the two reasoning
    /// stages, store the auditor's corrected table.
    async fn extraction_stage(&self, run_id: Uuid) -> Result<(), RunError> {
        let mut run = self.store.get(run_id)?;

        // Delivery is at-least-once. A redelivered job for a run that
        // already reached its target status must leave the run alone.
        if !matches!(run.status(), RunStatus::Pending | RunStatus::Processing) {
            info!(run_id = %run.id, status = %run.status(), "extraction already done, ignoring redelivery");
            return Ok(());
        }
        run.start_processing()?;
        self.store.update(run.clone())?;

        // The temp file is removed on drop, on every exit path out of this
        // block, including the error paths.
        let graph = {
            let mut temp = tempfile::NamedTempFile::new()?;
            let mut source = File::open(&run.source_path)?;
            std::io::copy(&mut source, temp.as_file_mut())?;
            extract_schema(temp.path(), self.options)?
        };

        let state = ExtractionState::new(graph.to_json_pretty());
        let state = run_extraction_graph(&self.registry, state).await?;
        let table = state.corrected_equipment_table.ok_or_else(|| {
            LlmError::Api("extraction graph produced no corrected table".to_string())
        })?;

        run.complete_processing(table.rows)?;
        self.store.update(run.clone())?;
        info!(run_id = %run.id, rows = run.equipment_count(), "extraction complete");
        Ok(())
    }

    /// One attempt at the narrative stage: render the final (post-review)
    /// table and turn it into prose.
    async fn generation_stage(&self, run_id: Uuid) -> Result<(), RunError> {
        let run = self.store.get(run_id)?;

        // Check the run can accept the result before spending a reasoning
        // call. A redelivered job for a completed run is a no-op.
        match run.status() {
            RunStatus::Completed => {
                info!(run_id = %run.id, "narrative already generated, ignoring redelivery");
                return Ok(());
            }
            RunStatus::GeneratingDescription => {}
            other => {
                return Err(RunError::InvalidTransition {
                    from: other,
                    to: RunStatus::Completed,
                })
            }
        }

        let markdown = run
            .overlay()
            .final_table_to_markdown(run.original_table(), FINAL_TABLE_TITLE);

        let state = GenerationState::new(markdown);
        let state = run_generation_graph(&self.registry, state).await?;
        let text = state.process_description.ok_or_else(|| {
            LlmError::Api("narrative stage produced no process description".to_string())
        })?;

        self.with_run(run_id, |run| run.complete_generation(&text))?;
        info!(run_id = %run_id, "narrative generation complete");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Retrying job wrappers
    // ------------------------------------------------------------------

    pub async fn extraction_job(&self, run_id: Uuid) {
        self.run_job("extraction", run_id, || self.extraction_stage(run_id))
            .await;
    }

    pub async fn generation_job(&self, run_id: Uuid) {
        self.run_job("generation", run_id, || self.generation_stage(run_id))
            .await;
    }

    /// Retry loop shared by both jobs: up to [`MAX_ATTEMPTS`] attempts,
    /// waiting `attempt * base delay` between them. Fatal errors stop
    /// immediately. Errors never escape the job.
    async fn run_job<'a, F, Fut>(&'a self, stage: &str, run_id: Uuid, mut attempt_fn: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), RunError>> + 'a,
    {
        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match attempt_fn().await {
                Ok(()) => return,
                Err(err) => {
                    let retryable = err.is_retryable();
                    warn!(run_id = %run_id, stage, attempt, %err, retryable, "stage attempt failed");
                    last_error = Some(err);
                    if !retryable {
                        break;
                    }
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(self.retry_base_delay * attempt).await;
                    }
                }
            }
        }

        let err = last_error.expect("loop ran at least once");
        error!(run_id = %run_id, stage, %err, "stage failed permanently");

        // Lookup and transition errors are caller bugs, not run failures;
        // marking the run failed here would clobber a status some other
        // path legitimately set.
        if matches!(
            err,
            RunError::NotFound(_) | RunError::InvalidTransition { .. }
        ) {
            return;
        }
        match self.with_run(run_id, |run| run.fail(&err.to_string())) {
            Ok(_) => {}
            Err(mark_err) => {
                error!(run_id = %run_id, stage, %mark_err, "could not mark run failed");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryRunStore, RunStatus};
    use flowsheet_pipeline::providers::MockModel;
    use std::io::Write;

    const DRAWING: &str = "0\nSECTION\n2\nENTITIES\n\
        0\nINSERT\n8\nEquipment\n2\nPUMP\n10\n0.0\n20\n0.0\n\
        0\nATTRIB\n2\nTAG\n1\nP-101\n\
        0\nSEQEND\n\
        0\nLINE\n8\nProcess\n10\n5.0\n20\n0.0\n11\n50.0\n21\n50.0\n\
        0\nENDSEC\n0\nEOF\n";

    fn producer_response() -> String {
        serde_json::json!({
            "rows": [{
                "tag": "P-101",
                "equipment_type": "Pump",
                "inlet_streams": "None traced",
                "inlet_count": 0,
                "outlet_streams": "To T-200",
                "outlet_count": 1,
                "remarks": ""
            }]
        })
        .to_string()
    }

    fn auditor_response() -> String {
        serde_json::json!({
            "audit_findings": {"findings": []},
            "corrected_equipment_table": {
                "title": "Final Corrected Table",
                "rows": [{
                    "tag": "P-101",
                    "equipment_type": "Centrifugal pump",
                    "inlet_streams": "None traced",
                    "inlet_count": 0,
                    "outlet_streams": "To T-200",
                    "outlet_count": 1,
                    "remarks": ""
                }]
            }
        })
        .to_string()
    }

    fn orchestrator_with(model: Arc<MockModel>) -> Orchestrator {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let registry = Arc::new(AgentRegistry::uniform(model));
        Orchestrator::new(store, registry).with_retry_base_delay(Duration::from_millis(1))
    }

    fn drawing_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn extraction_job_stores_the_corrected_table() {
        let model = Arc::new(MockModel::scripted(vec![
            producer_response(),
            auditor_response(),
        ]));
        let orch = orchestrator_with(model);
        let file = drawing_file(DRAWING);

        let run = orch.create_run("demo", file.path()).unwrap();
        orch.extraction_job(run.id).await;

        let run = orch.store().get(run.id).unwrap();
        assert_eq!(run.status(), RunStatus::ReadyForReview);
        // The auditor's table is authoritative, not the producer's.
        assert_eq!(run.original_table()[0].equipment_type, "Centrifugal pump");
        assert!(run.processing_completed_at.is_some());
    }

    #[tokio::test]
    async fn redelivered_extraction_job_leaves_a_finished_run_alone() {
        let model = Arc::new(MockModel::scripted(vec![
            producer_response(),
            auditor_response(),
        ]));
        let orch = orchestrator_with(model.clone());
        let file = drawing_file(DRAWING);

        let run = orch.create_run("demo", file.path()).unwrap();
        orch.extraction_job(run.id).await;
        assert_eq!(
            orch.store().get(run.id).unwrap().status(),
            RunStatus::ReadyForReview
        );

        // Delivery is at-least-once: the same job can arrive again. It must
        // not disturb the finished run, and must not re-run the pipeline.
        orch.extraction_job(run.id).await;

        let run = orch.store().get(run.id).unwrap();
        assert_eq!(run.status(), RunStatus::ReadyForReview);
        assert!(run.error.is_none());
        assert_eq!(run.original_table().len(), 1);
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn redelivered_generation_job_skips_the_reasoning_engine() {
        let narrative = serde_json::json!({
            "process_description": "Pump P-101 transfers feed to T-200."
        })
        .to_string();
        let model = Arc::new(MockModel::scripted(vec![
            producer_response(),
            auditor_response(),
            narrative,
        ]));
        let orch = orchestrator_with(model.clone());
        let file = drawing_file(DRAWING);

        let run = orch.create_run("demo", file.path()).unwrap();
        orch.extraction_job(run.id).await;
        orch.open_review(run.id).unwrap();
        orch.finalize(run.id, "reviewer").unwrap();
        orch.generation_job(run.id).await;
        assert_eq!(
            orch.store().get(run.id).unwrap().status(),
            RunStatus::Completed
        );

        orch.generation_job(run.id).await;

        let run = orch.store().get(run.id).unwrap();
        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(
            run.generated_text.as_deref(),
            Some("Pump P-101 transfers feed to T-200.")
        );
        // The redelivered job never consulted the reasoning engine.
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn generation_job_requires_a_finalized_run() {
        let model = Arc::new(MockModel::always("{}"));
        let orch = orchestrator_with(model.clone());
        let file = drawing_file(DRAWING);

        let run = orch.create_run("demo", file.path()).unwrap();
        orch.generation_job(run.id).await;

        // The premature job is rejected without a reasoning call, and the
        // rejection does not overwrite the run's status.
        assert_eq!(model.call_count(), 0);
        assert_eq!(orch.store().get(run.id).unwrap().status(), RunStatus::Pending);
    }

    #[tokio::test]
    async fn schema_violations_retry_until_the_budget_is_exhausted() {
        let model = Arc::new(MockModel::always("not json at all"));
        let orch = orchestrator_with(model.clone());
        let file = drawing_file(DRAWING);

        let run = orch.create_run("demo", file.path()).unwrap();
        orch.extraction_job(run.id).await;

        assert_eq!(model.call_count(), 3);
        let run = orch.store().get(run.id).unwrap();
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("schema violation"));
        assert!(run.processing_completed_at.is_some());
    }

    #[tokio::test]
    async fn unreadable_drawings_fail_without_retry() {
        let model = Arc::new(MockModel::always("{}"));
        let orch = orchestrator_with(model.clone());
        let file = drawing_file("not a drawing");

        let run = orch.create_run("demo", file.path()).unwrap();
        orch.extraction_job(run.id).await;

        // The reasoning engine was never consulted.
        assert_eq!(model.call_count(), 0);
        let run = orch.store().get(run.id).unwrap();
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("unreadable drawing"));
    }

    #[tokio::test]
    async fn generation_reads_the_post_review_table() {
        let narrative = serde_json::json!({
            "process_description": "Pump P-101A transfers feed to T-200."
        })
        .to_string();
        let model = Arc::new(MockModel::scripted(vec![
            producer_response(),
            auditor_response(),
            narrative,
        ]));
        let orch = orchestrator_with(model.clone());
        let file = drawing_file(DRAWING);

        let run = orch.create_run("demo", file.path()).unwrap();
        orch.extraction_job(run.id).await;

        orch.open_review(run.id).unwrap();
        orch.submit_row_changes(
            run.id,
            0,
            RowPatch {
                tag: Some("P-101A".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        orch.finalize(run.id, "reviewer@plant").unwrap();
        orch.generation_job(run.id).await;

        let run = orch.store().get(run.id).unwrap();
        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(
            run.generated_text.as_deref(),
            Some("Pump P-101A transfers feed to T-200.")
        );

        // The generator saw the reviewer's edit, flagged as modified.
        let generator_input = &model.call(2)[1].content;
        assert!(generator_input.starts_with("### Modified Table after Human Review"));
        assert!(generator_input.contains("| P-101A |"));
        assert!(generator_input.contains("| Yes |"));
    }

    #[tokio::test]
    async fn finalize_requires_a_reviewable_run() {
        let model = Arc::new(MockModel::always("{}"));
        let orch = orchestrator_with(model);
        let file = drawing_file(DRAWING);

        let run = orch.create_run("demo", file.path()).unwrap();
        let err = orch.finalize(run.id, "reviewer").unwrap_err();
        assert!(matches!(err, RunError::InvalidTransition { .. }));
        // The rejection left the stored run untouched.
        assert_eq!(orch.store().get(run.id).unwrap().status(), RunStatus::Pending);
    }
}
