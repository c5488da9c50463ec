//! Structured table types for the flowsheet extraction pipeline.
//!
//! Everything that crosses a stage boundary is one of these types: the
//! equipment/stream table the producer emits, the findings + corrected table
//! the auditor emits, and the narrative the generator emits. The markdown
//! projections defined here are the wire format between reasoning stages, so
//! they must be byte-reproducible for a given table: the reasoning engine
//! receives them verbatim.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// Equipment table
// ============================================================================

/// A single row of the equipment/stream summary table.
///
/// Row order inside a table is significant: the row index is the merge key
/// used by the review overlay, so rows are never reordered once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentRow {
    /// Equipment tag identifier (e.g. "P-101"). Must be non-empty.
    pub tag: String,
    /// Type/description of the equipment.
    pub equipment_type: String,
    /// Description of inlet streams.
    pub inlet_streams: String,
    /// Number of inlet streams.
    pub inlet_count: u32,
    /// Description of outlet streams.
    pub outlet_streams: String,
    /// Number of outlet streams.
    pub outlet_count: u32,
    /// Additional remarks (empty when the drawing raised no oddities).
    #[serde(default)]
    pub remarks: String,
}

impl EquipmentRow {
    /// Cells in canonical column order, as strings.
    pub fn as_cells(&self) -> [String; 7] {
        [
            self.tag.clone(),
            self.equipment_type.clone(),
            self.inlet_streams.clone(),
            self.inlet_count.to_string(),
            self.outlet_streams.clone(),
            self.outlet_count.to_string(),
            self.remarks.clone(),
        ]
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.tag.trim().is_empty() {
            return Err(SchemaError::EmptyTag);
        }
        Ok(())
    }
}

/// Canonical column headers for the equipment table projection.
pub const EQUIPMENT_COLUMNS: [&str; 7] = [
    "Tag",
    "Equipment type",
    "Inlet streams",
    "Inlet count",
    "Outlet streams",
    "Outlet count",
    "Remarks",
];

/// Container for all equipment rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentTable {
    /// Table title (e.g. "Final Corrected Table").
    #[serde(default)]
    pub title: Option<String>,
    /// Ordered equipment rows.
    pub rows: Vec<EquipmentRow>,
}

impl EquipmentTable {
    pub fn new(rows: Vec<EquipmentRow>) -> Self {
        Self { title: None, rows }
    }

    pub fn with_title(title: &str, rows: Vec<EquipmentRow>) -> Self {
        Self {
            title: Some(title.to_string()),
            rows,
        }
    }

    /// Validate every row against the row schema.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (index, row) in self.rows.iter().enumerate() {
            row.validate()
                .map_err(|source| SchemaError::Row { index, source: Box::new(source) })?;
        }
        Ok(())
    }

    /// Render the canonical markdown projection.
    ///
    /// This is write-only: nothing in the system parses it back. It is
    /// deterministic: the same table always yields the identical string.
    pub fn to_markdown(&self) -> String {
        let mut lines = Vec::new();

        if let Some(title) = &self.title {
            lines.push(format!("### {}\n", title));
        }

        lines.push(format!("| {} |", EQUIPMENT_COLUMNS.join(" | ")));
        lines.push("|---|---|---|---|---|---|---|".to_string());

        for row in &self.rows {
            lines.push(format!(
                "| {} | {} | {} | {} | {} | {} | {} |",
                row.tag,
                row.equipment_type,
                row.inlet_streams,
                row.inlet_count,
                row.outlet_streams,
                row.outlet_count,
                row.remarks
            ));
        }

        lines.join("\n")
    }
}

// ============================================================================
// Audit findings
// ============================================================================

/// One correction the auditor made relative to the producer's table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFinding {
    /// Equipment tag with the error.
    pub tag: String,
    /// Column(s) that contained the error.
    pub column_with_error: String,
    /// Original incorrect value.
    pub original_value: String,
    /// Corrected value.
    pub corrected_value: String,
    /// Explanation for the correction.
    pub justification: String,
}

/// Container for audit findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFindingsTable {
    #[serde(default)]
    pub title: Option<String>,
    pub findings: Vec<AuditFinding>,
}

impl AuditFindingsTable {
    pub fn to_markdown(&self) -> String {
        let mut lines = Vec::new();

        if let Some(title) = &self.title {
            lines.push(format!("### {}\n", title));
        }

        lines.push(
            "| Tag | Column with Error | Original Value | Corrected Value | Justification |"
                .to_string(),
        );
        lines.push("|---|---|---|---|---|".to_string());

        for row in &self.findings {
            lines.push(format!(
                "| {} | {} | {} | {} | {} |",
                row.tag,
                row.column_with_error,
                row.original_value,
                row.corrected_value,
                row.justification
            ));
        }

        lines.join("\n")
    }
}

/// Complete output of the audit stage: the findings log plus the corrected
/// table. The corrected table, not the producer's, is the stage's
/// authoritative output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditedTables {
    pub audit_findings: AuditFindingsTable,
    pub corrected_equipment_table: EquipmentTable,
}

// ============================================================================
// Narrative output
// ============================================================================

/// Output of the narrative generation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeOutput {
    /// Detailed process description based on the connectivity table.
    pub process_description: String,
}

// ============================================================================
// JSON response schemas
// ============================================================================
//
// The contracts handed to the reasoning engine. Each stage requires a
// response conforming exactly to its schema; any deviation is a schema
// violation of that stage, not a silent partial result.

fn equipment_row_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "tag": {"type": "string", "minLength": 1},
            "equipment_type": {"type": "string"},
            "inlet_streams": {"type": "string"},
            "inlet_count": {"type": "integer", "minimum": 0},
            "outlet_streams": {"type": "string"},
            "outlet_count": {"type": "integer", "minimum": 0},
            "remarks": {"type": "string"}
        },
        "required": [
            "tag", "equipment_type", "inlet_streams", "inlet_count",
            "outlet_streams", "outlet_count"
        ]
    })
}

/// Response schema for the producer stage.
pub fn equipment_table_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "title": {"type": ["string", "null"]},
            "rows": {"type": "array", "items": equipment_row_schema()}
        },
        "required": ["rows"]
    })
}

/// Response schema for the auditor stage.
pub fn audited_tables_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "audit_findings": {
                "type": "object",
                "properties": {
                    "title": {"type": ["string", "null"]},
                    "findings": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "tag": {"type": "string"},
                                "column_with_error": {"type": "string"},
                                "original_value": {"type": "string"},
                                "corrected_value": {"type": "string"},
                                "justification": {"type": "string"}
                            },
                            "required": [
                                "tag", "column_with_error", "original_value",
                                "corrected_value", "justification"
                            ]
                        }
                    }
                },
                "required": ["findings"]
            },
            "corrected_equipment_table": equipment_table_schema()
        },
        "required": ["audit_findings", "corrected_equipment_table"]
    })
}

/// Response schema for the narrative generation stage.
pub fn narrative_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "process_description": {"type": "string"}
        },
        "required": ["process_description"]
    })
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("equipment tag must be non-empty")]
    EmptyTag,
    #[error("row {index}: {source}")]
    Row {
        index: usize,
        source: Box<SchemaError>,
    },
}

// ============================================================================
// Tests
// ============================================================================
