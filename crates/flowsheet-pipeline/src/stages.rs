//! Pipeline stages and the linear state graphs that run them.
//!
//! Each stage is a pure function `(prior state) -> new state` over an
//! accumulating state record. The extraction graph has exactly two nodes
//! with a fixed edge producer → auditor → end; the narrative graph has one.
//! There is no branching, no cycle, and no retry here; stages are
//! deterministic only up to the reasoning engine's own nondeterminism.

use crate::prompts::{AUDITOR_SYSTEM_PROMPT, GENERATOR_SYSTEM_PROMPT, PRODUCER_SYSTEM_PROMPT};
use crate::{AgentRegistry, LlmError, Message, StageName, StructuredAgent};
use flowsheet_schema::{
    audited_tables_schema, equipment_table_schema, narrative_schema, AuditFindingsTable,
    AuditedTables, EquipmentTable, NarrativeOutput,
};
use tracing::info;

// ============================================================================
// State records
// ============================================================================

/// Accumulating state of the extraction graph.
#[derive(Debug, Clone, Default)]
pub struct ExtractionState {
    /// Serialized entity graph (the transformed input from the drawing).
    pub entity_graph_json: String,
    /// Conversation history across stages.
    pub messages: Vec<Message>,
    /// Producer output.
    pub equipment_table: Option<EquipmentTable>,
    /// Auditor outputs.
    pub audit_findings: Option<AuditFindingsTable>,
    pub corrected_equipment_table: Option<EquipmentTable>,
}

impl ExtractionState {
    pub fn new(entity_graph_json: String) -> Self {
        Self {
            entity_graph_json,
            ..Default::default()
        }
    }
}

/// Accumulating state of the narrative graph.
#[derive(Debug, Clone, Default)]
pub struct GenerationState {
    /// The final (post-review) table, in canonical markdown.
    pub connectivity_markdown: String,
    pub messages: Vec<Message>,
    pub process_description: Option<String>,
}

impl GenerationState {
    pub fn new(connectivity_markdown: String) -> Self {
        Self {
            connectivity_markdown,
            ..Default::default()
        }
    }
}

// ============================================================================
// Stages
// ============================================================================

/// Producer stage: entity graph → candidate equipment table.
pub async fn producer_stage(
    registry: &AgentRegistry,
    mut state: ExtractionState,
) -> Result<ExtractionState, LlmError> {
    info!("entered producer stage");

    let model = registry.model_for(StageName::Producer)?;
    let agent = StructuredAgent::<EquipmentTable>::new(model, equipment_table_schema());

    let messages = vec![
        Message::system(PRODUCER_SYSTEM_PROMPT),
        Message::user(&state.entity_graph_json),
    ];
    let table = agent.invoke(&messages).await?;
    table
        .validate()
        .map_err(|e| LlmError::SchemaViolation(e.to_string()))?;

    state.messages.extend(messages);
    state.equipment_table = Some(table);

    info!("left producer stage");
    Ok(state)
}

/// Auditor stage: entity graph + producer table (as markdown) → findings +
/// corrected table. The corrected table is the stage's authoritative output.
pub async fn auditor_stage(
    registry: &AgentRegistry,
    mut state: ExtractionState,
) -> Result<ExtractionState, LlmError> {
    info!("entered auditor stage");

    let candidate = state
        .equipment_table
        .as_ref()
        .ok_or_else(|| LlmError::Api("auditor stage ran before producer stage".to_string()))?;
    let table_markdown = candidate.to_markdown();

    let model = registry.model_for(StageName::Auditor)?;
    let agent = StructuredAgent::<AuditedTables>::new(model, audited_tables_schema());

    let messages = vec![
        Message::system(AUDITOR_SYSTEM_PROMPT),
        Message::user(&format!(
            "1) The original JSON data file containing the Process Flow Diagram extract:\n{}\n\n\
             2) The candidate markdown table produced by the junior engineer:\n{}",
            state.entity_graph_json, table_markdown
        )),
    ];
    let audited = agent.invoke(&messages).await?;
    audited
        .corrected_equipment_table
        .validate()
        .map_err(|e| LlmError::SchemaViolation(e.to_string()))?;

    state.messages.extend(messages);
    state.audit_findings = Some(audited.audit_findings);
    state.corrected_equipment_table = Some(audited.corrected_equipment_table);

    info!("left auditor stage");
    Ok(state)
}

/// Generator stage: final table markdown → process description.
pub async fn generator_stage(
    registry: &AgentRegistry,
    mut state: GenerationState,
) -> Result<GenerationState, LlmError> {
    info!("entered generator stage");

    let model = registry.model_for(StageName::Generator)?;
    let agent = StructuredAgent::<NarrativeOutput>::new(model, narrative_schema());

    let messages = vec![
        Message::system(GENERATOR_SYSTEM_PROMPT),
        Message::user(&state.connectivity_markdown),
    ];
    let output = agent.invoke(&messages).await?;

    state.messages.extend(messages);
    state.process_description = Some(output.process_description);

    info!("left generator stage");
    Ok(state)
}

// ============================================================================
// Graphs
// ============================================================================

/// First leg of the workflow: producer then auditor; the output is reviewed
/// by a human afterwards.
pub async fn run_extraction_graph(
    registry: &AgentRegistry,
    state: ExtractionState,
) -> Result<ExtractionState, LlmError> {
    let state = producer_stage(registry, state).await?;
    auditor_stage(registry, state).await
}

/// Second leg: after human review, turn the final table into prose.
pub async fn run_generation_graph(
    registry: &AgentRegistry,
    state: GenerationState,
) -> Result<GenerationState, LlmError> {
    generator_stage(registry, state).await
}

// ============================================================================
// Tests
// ============================================================================
