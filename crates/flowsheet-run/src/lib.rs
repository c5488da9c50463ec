//! Run lifecycle and orchestration.
//!
//! A run is one extraction attempt over one drawing, moving through a fixed
//! state machine:
//!
//! ```text
//!  pending ──► processing ──► ready_for_review ──► under_review ◄──► draft
//!                                                        │              │
//!                                                        └──► generating_description ──► completed
//!
//!  failed: reachable from any non-terminal state
//! ```
//!
//! `completed` is terminal. The original table is immutable once the
//! pipeline stores it; after that point only the review overlay changes, and
//! only while the run is in a review state.

pub mod orchestrator;
pub mod queue;
pub mod store;

pub use orchestrator::{Orchestrator, FINAL_TABLE_TITLE};
pub use queue::{JobQueue, JobStage, LocalQueue};
pub use store::{InMemoryRunStore, RunStore};

use chrono::{DateTime, Utc};
use flowsheet_ingest_dxf::DxfError;
use flowsheet_pipeline::LlmError;
use flowsheet_review::{ReviewOverlay, RowPatch};
use flowsheet_schema::EquipmentRow;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("run {0} not found")]
    NotFound(Uuid),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
    #[error("run is {0}; review mutations are rejected")]
    ReviewClosed(RunStatus),
    #[error("row {index} is out of range for a table of {len} rows")]
    RowOutOfRange { index: usize, len: usize },
    #[error(transparent)]
    Drawing(#[from] DxfError),
    #[error(transparent)]
    Pipeline(#[from] LlmError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// Whether a retrying job runner should attempt this failure again.
    /// Unreadable input never becomes readable; transition and lookup
    /// failures are caller bugs. Everything transient retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            RunError::Pipeline(
                LlmError::SchemaViolation(_)
                | LlmError::Network(_)
                | LlmError::RateLimited { .. },
            ) => true,
            RunError::Io(_) => true,
            _ => false,
        }
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Processing,
    ReadyForReview,
    UnderReview,
    Draft,
    GeneratingDescription,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Processing => "processing",
            RunStatus::ReadyForReview => "ready_for_review",
            RunStatus::UnderReview => "under_review",
            RunStatus::Draft => "draft",
            RunStatus::GeneratingDescription => "generating_description",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Whether the state machine permits moving to `to` from here.
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        use RunStatus::*;
        if to == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, ReadyForReview)
                | (ReadyForReview, UnderReview)
                | (UnderReview, Draft)
                | (Draft, UnderReview)
                | (UnderReview, GeneratingDescription)
                | (Draft, GeneratingDescription)
                | (GeneratingDescription, Completed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "processing" => Ok(RunStatus::Processing),
            "ready_for_review" => Ok(RunStatus::ReadyForReview),
            "under_review" => Ok(RunStatus::UnderReview),
            "draft" => Ok(RunStatus::Draft),
            "generating_description" => Ok(RunStatus::GeneratingDescription),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

// ============================================================================
// Run aggregate
// ============================================================================

/// One extraction attempt over one drawing.
///
/// The extracted table and the review overlay are private: every mutation
/// goes through a method that validates the state machine first, and a
/// rejected transition leaves the run untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub name: String,
    pub source_path: PathBuf,
    status: RunStatus,
    /// Producer/auditor output. Set exactly once, by `complete_processing`.
    #[serde(default)]
    original_table: Vec<EquipmentRow>,
    #[serde(default)]
    overlay: ReviewOverlay,
    pub generated_text: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub review_completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<String>,
}

impl Run {
    pub fn new(name: &str, source_path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            source_path: source_path.into(),
            status: RunStatus::Pending,
            original_table: Vec::new(),
            overlay: ReviewOverlay::new(),
            generated_text: None,
            error: None,
            created_at: Utc::now(),
            processing_started_at: None,
            processing_completed_at: None,
            review_completed_at: None,
            completed_by: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn original_table(&self) -> &[EquipmentRow] {
        &self.original_table
    }

    pub fn overlay(&self) -> &ReviewOverlay {
        &self.overlay
    }

    fn transition(&mut self, to: RunStatus) -> Result<(), RunError> {
        if !self.status.can_transition_to(to) {
            return Err(RunError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Processing lifecycle
    // ------------------------------------------------------------------

    /// Move into `processing`. Idempotent under job redelivery: a run
    /// already processing stays processing.
    pub fn start_processing(&mut self) -> Result<(), RunError> {
        if self.status == RunStatus::Processing {
            return Ok(());
        }
        self.transition(RunStatus::Processing)?;
        self.processing_started_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    /// Store the pipeline's corrected table and open the run for review.
    pub fn complete_processing(&mut self, rows: Vec<EquipmentRow>) -> Result<(), RunError> {
        self.transition(RunStatus::ReadyForReview)?;
        self.original_table = rows;
        self.processing_completed_at = Some(Utc::now());
        self.error = None;
        Ok(())
    }

    /// Mark the run failed with the error that killed it.
    pub fn fail(&mut self, message: &str) -> Result<(), RunError> {
        self.transition(RunStatus::Failed)?;
        self.error = Some(message.to_string());
        self.processing_completed_at = Some(Utc::now());
        Ok(())
    }

    /// Open (or re-open) the review surface.
    pub fn open_review(&mut self) -> Result<(), RunError> {
        if self.status == RunStatus::UnderReview {
            return Ok(());
        }
        self.transition(RunStatus::UnderReview)
    }

    /// Freeze the overlay and hand off to narrative generation.
    pub fn finalize(&mut self, completed_by: &str) -> Result<(), RunError> {
        self.transition(RunStatus::GeneratingDescription)?;
        self.review_completed_at = Some(Utc::now());
        self.completed_by = Some(completed_by.to_string());
        Ok(())
    }

    pub fn complete_generation(&mut self, text: &str) -> Result<(), RunError> {
        self.transition(RunStatus::Completed)?;
        self.generated_text = Some(text.to_string());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Review mutations
    // ------------------------------------------------------------------

    fn ensure_review_open(&self, index: usize) -> Result<(), RunError> {
        match self.status {
            RunStatus::UnderReview | RunStatus::Draft => {}
            other => return Err(RunError::ReviewClosed(other)),
        }
        if index >= self.original_table.len() {
            return Err(RunError::RowOutOfRange {
                index,
                len: self.original_table.len(),
            });
        }
        Ok(())
    }

    fn advance_from(&mut self, index: usize) {
        let next = self
            .overlay
            .advance_after_review(index, self.original_table.len());
        self.overlay.set_current_index(next);
    }

    pub fn approve_row(&mut self, index: usize) -> Result<(), RunError> {
        self.ensure_review_open(index)?;
        self.overlay.approve(index);
        self.advance_from(index);
        Ok(())
    }

    pub fn submit_row_changes(&mut self, index: usize, patch: RowPatch) -> Result<(), RunError> {
        self.ensure_review_open(index)?;
        self.overlay.submit_changes(index, patch);
        self.advance_from(index);
        Ok(())
    }

    /// Store edits without marking the row reviewed; forces the run into
    /// `draft`.
    pub fn save_row_draft(&mut self, index: usize, patch: RowPatch) -> Result<(), RunError> {
        self.ensure_review_open(index)?;
        self.overlay.save_draft(index, patch);
        self.overlay.set_current_index(index);
        if self.status == RunStatus::UnderReview {
            self.transition(RunStatus::Draft)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Projections and progress
    // ------------------------------------------------------------------

    /// The post-review table: overlay applied over the original rows.
    pub fn final_table(&self) -> Vec<EquipmentRow> {
        self.overlay.final_table(&self.original_table)
    }

    pub fn equipment_count(&self) -> usize {
        self.original_table.len()
    }

    pub fn reviewed_count(&self) -> usize {
        self.overlay.reviewed_count()
    }

    pub fn has_modifications(&self) -> bool {
        self.overlay.modified_count() > 0
    }

    pub fn all_reviewed(&self) -> bool {
        self.overlay.all_reviewed(self.original_table.len())
    }

    pub fn progress_display(&self) -> String {
        format!("{}/{} reviewed", self.reviewed_count(), self.equipment_count())
    }
}

// ============================================================================
// Tests
// ============================================================================
