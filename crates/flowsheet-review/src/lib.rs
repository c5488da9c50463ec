//! Human review reconciliation over an immutable extracted table.
//!
//! The extracted equipment table is never edited in place. Review state is a
//! sparse overlay kept next to it:
//!
//! ```text
//!  original rows (frozen)      overlay                    final table
//!  ┌──────────────────┐   ┌──────────────────┐   ┌──────────────────────┐
//!  │ 0: P-101 …       │   │ reviewed: {0, 2} │   │ 0: P-101 … (patched) │
//!  │ 1: E-102 …       │ + │ patches:         │ = │ 1: E-102 …           │
//!  │ 2: T-103 …       │   │   0: {tag: …}    │   │ 2: T-103 …           │
//!  └──────────────────┘   └──────────────────┘   └──────────────────────┘
//! ```
//!
//! The final table is a pure projection, computable at any time and stored
//! nowhere. Discarding the overlay recovers the original exactly.

use flowsheet_schema::{EquipmentRow, EQUIPMENT_COLUMNS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// Row patches
// ============================================================================

/// A sparse edit to one equipment row: only the fields the reviewer changed.
///
/// Field-level, not row-level: merging a later patch overwrites exactly the
/// fields it carries and leaves the rest of the earlier patch intact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inlet_streams: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inlet_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlet_streams: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlet_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
}

impl RowPatch {
    pub fn is_empty(&self) -> bool {
        self.tag.is_none()
            && self.equipment_type.is_none()
            && self.inlet_streams.is_none()
            && self.inlet_count.is_none()
            && self.outlet_streams.is_none()
            && self.outlet_count.is_none()
            && self.remarks.is_none()
    }

    /// Drop text fields submitted as empty strings. Review forms post blanks
    /// for untouched fields; a blank is "no edit", not "set to empty".
    fn discard_blank_fields(&mut self) {
        for field in [
            &mut self.tag,
            &mut self.equipment_type,
            &mut self.inlet_streams,
            &mut self.outlet_streams,
            &mut self.remarks,
        ] {
            if field.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *field = None;
            }
        }
    }

    /// Fold `later` into `self`, field by field. `later` wins where both are
    /// set; fields absent from `later` survive from `self`.
    fn merge(&mut self, later: RowPatch) {
        macro_rules! take {
            ($field:ident) => {
                if later.$field.is_some() {
                    self.$field = later.$field;
                }
            };
        }
        take!(tag);
        take!(equipment_type);
        take!(inlet_streams);
        take!(inlet_count);
        take!(outlet_streams);
        take!(outlet_count);
        take!(remarks);
    }

    /// Overwrite the patched fields of `row`. Idempotent.
    pub fn apply_to(&self, row: &mut EquipmentRow) {
        macro_rules! put {
            ($field:ident) => {
                if let Some(value) = &self.$field {
                    row.$field = value.clone();
                }
            };
        }
        put!(tag);
        put!(equipment_type);
        put!(inlet_streams);
        put!(outlet_streams);
        put!(remarks);
        if let Some(value) = self.inlet_count {
            row.inlet_count = value;
        }
        if let Some(value) = self.outlet_count {
            row.outlet_count = value;
        }
    }
}

// ============================================================================
// Review overlay
// ============================================================================

/// Persisted form of the overlay. Patch keys are row indices encoded as
/// decimal strings, a constraint of the JSON object representation.
#[derive(Serialize, Deserialize)]
struct OverlayDoc {
    #[serde(default)]
    reviewed_indices: Vec<usize>,
    #[serde(default)]
    equipment_data: BTreeMap<String, RowPatch>,
    #[serde(default)]
    current_index: usize,
}

/// Review progress and pending edits for one run.
///
/// The overlay knows nothing about the table it annotates except row
/// indices; projections take the original rows as a parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "OverlayDoc", from = "OverlayDoc")]
pub struct ReviewOverlay {
    reviewed: BTreeSet<usize>,
    patches: BTreeMap<usize, RowPatch>,
    current_index: usize,
}

impl From<ReviewOverlay> for OverlayDoc {
    fn from(overlay: ReviewOverlay) -> Self {
        OverlayDoc {
            reviewed_indices: overlay.reviewed.into_iter().collect(),
            equipment_data: overlay
                .patches
                .into_iter()
                .map(|(index, patch)| (index.to_string(), patch))
                .collect(),
            current_index: overlay.current_index,
        }
    }
}

impl From<OverlayDoc> for ReviewOverlay {
    fn from(doc: OverlayDoc) -> Self {
        ReviewOverlay {
            reviewed: doc.reviewed_indices.into_iter().collect(),
            patches: doc
                .equipment_data
                .into_iter()
                .filter_map(|(key, patch)| Some((key.parse().ok()?, patch)))
                .collect(),
            current_index: doc.current_index,
        }
    }
}

impl ReviewOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Review actions
    // ------------------------------------------------------------------

    /// Accept the row as extracted. Any pending edits for the row are
    /// discarded: approval means "the original is right".
    pub fn approve(&mut self, index: usize) {
        self.patches.remove(&index);
        self.reviewed.insert(index);
    }

    /// Record the reviewer's edits for the row and mark it reviewed. Blank
    /// text fields are dropped; the edits merge field-by-field into any
    /// earlier patch for the same row.
    pub fn submit_changes(&mut self, index: usize, mut patch: RowPatch) {
        patch.discard_blank_fields();
        if !patch.is_empty() {
            self.patches.entry(index).or_default().merge(patch);
        }
        self.reviewed.insert(index);
    }

    /// Store edits without marking the row reviewed; the reviewer is
    /// stepping away mid-row.
    pub fn save_draft(&mut self, index: usize, mut patch: RowPatch) {
        patch.discard_blank_fields();
        if !patch.is_empty() {
            self.patches.entry(index).or_default().merge(patch);
        }
    }

    // ------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn set_current_index(&mut self, index: usize) {
        self.current_index = index;
    }

    /// Lowest unreviewed row index, or 0 when every row is reviewed.
    pub fn next_unreviewed(&self, total: usize) -> usize {
        (0..total).find(|i| !self.reviewed.contains(i)).unwrap_or(0)
    }

    /// Where to land after acting on `current`: the lowest unreviewed row,
    /// except when everything is reviewed, where it steps forward and clamps
    /// to the last row.
    pub fn advance_after_review(&self, current: usize, total: usize) -> usize {
        let next = self.next_unreviewed(total);
        if next == 0 && total > 0 && self.reviewed.len() >= total {
            return (current + 1).min(total - 1);
        }
        next
    }

    /// Whether reviewing `index` now keeps the pass strictly in order: it is
    /// the next unreviewed row, or everything before it is already reviewed.
    pub fn is_sequential(&self, index: usize, total: usize) -> bool {
        index == self.next_unreviewed(total) || (0..index).all(|i| self.reviewed.contains(&i))
    }

    // ------------------------------------------------------------------
    // Progress
    // ------------------------------------------------------------------

    pub fn is_reviewed(&self, index: usize) -> bool {
        self.reviewed.contains(&index)
    }

    /// A row counts as modified only when a patch for it exists.
    pub fn is_modified(&self, index: usize) -> bool {
        self.patches.contains_key(&index)
    }

    pub fn reviewed_count(&self) -> usize {
        self.reviewed.len()
    }

    pub fn modified_count(&self) -> usize {
        self.patches.len()
    }

    pub fn all_reviewed(&self, total: usize) -> bool {
        (0..total).all(|i| self.reviewed.contains(&i))
    }

    pub fn patch(&self, index: usize) -> Option<&RowPatch> {
        self.patches.get(&index)
    }

    // ------------------------------------------------------------------
    // Projections
    // ------------------------------------------------------------------

    /// The post-review table: original rows with patches applied. Pure;
    /// the overlay and the original are left untouched.
    pub fn final_table(&self, original: &[EquipmentRow]) -> Vec<EquipmentRow> {
        original
            .iter()
            .enumerate()
            .map(|(index, row)| {
                let mut row = row.clone();
                if let Some(patch) = self.patches.get(&index) {
                    patch.apply_to(&mut row);
                }
                row
            })
            .collect()
    }

    /// Markdown projection of the final table with a trailing `Modified`
    /// column flagging the rows a patch touched.
    pub fn final_table_to_markdown(&self, original: &[EquipmentRow], title: &str) -> String {
        let mut lines = Vec::new();

        lines.push(format!("### {}\n", title));
        lines.push(format!("| {} | Modified |", EQUIPMENT_COLUMNS.join(" | ")));
        lines.push("|---|---|---|---|---|---|---|---|".to_string());

        for (index, row) in self.final_table(original).iter().enumerate() {
            let modified = if self.is_modified(index) { "Yes" } else { "No" };
            lines.push(format!(
                "| {} | {} |",
                row.as_cells().join(" | "),
                modified
            ));
        }

        lines.join("\n")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn row(tag: &str) -> EquipmentRow {
        EquipmentRow {
            tag: tag.to_string(),
            equipment_type: "Pump".to_string(),
            inlet_streams: "From T-100".to_string(),
            inlet_count: 1,
            outlet_streams: "To E-102".to_string(),
            outlet_count: 1,
            remarks: String::new(),
        }
    }

    fn four_rows() -> Vec<EquipmentRow> {
        vec![row("P-101"), row("E-102"), row("T-103"), row("K-104")]
    }

    #[test]
    fn empty_overlay_projects_the_original() {
        let original = four_rows();
        let overlay = ReviewOverlay::new();
        assert_eq!(overlay.final_table(&original), original);
    }

    #[test]
    fn patches_merge_field_by_field() {
        let original = four_rows();
        let mut overlay = ReviewOverlay::new();

        overlay.submit_changes(
            0,
            RowPatch {
                tag: Some("P-101A".to_string()),
                ..Default::default()
            },
        );
        overlay.submit_changes(
            0,
            RowPatch {
                remarks: Some("Spared by P-101B".to_string()),
                ..Default::default()
            },
        );

        let final_rows = overlay.final_table(&original);
        assert_eq!(final_rows[0].tag, "P-101A");
        assert_eq!(final_rows[0].remarks, "Spared by P-101B");
        // Untouched fields and rows come through unchanged.
        assert_eq!(final_rows[0].inlet_count, 1);
        assert_eq!(final_rows[1], original[1]);
    }

    #[test]
    fn later_patch_wins_per_field() {
        let mut overlay = ReviewOverlay::new();
        overlay.submit_changes(
            2,
            RowPatch {
                inlet_count: Some(3),
                ..Default::default()
            },
        );
        overlay.submit_changes(
            2,
            RowPatch {
                inlet_count: Some(2),
                ..Default::default()
            },
        );

        let final_rows = overlay.final_table(&four_rows());
        assert_eq!(final_rows[2].inlet_count, 2);
    }

    #[test]
    fn approve_discards_pending_edits() {
        let original = four_rows();
        let mut overlay = ReviewOverlay::new();

        overlay.save_draft(
            1,
            RowPatch {
                equipment_type: Some("Heat exchanger".to_string()),
                ..Default::default()
            },
        );
        overlay.approve(1);

        assert!(overlay.is_reviewed(1));
        assert!(!overlay.is_modified(1));
        assert_eq!(overlay.final_table(&original), original);
    }

    #[test]
    fn approve_after_submit_restores_the_original_row() {
        let original = four_rows();
        let mut overlay = ReviewOverlay::new();

        overlay.submit_changes(
            0,
            RowPatch {
                tag: Some("WRONG".to_string()),
                ..Default::default()
            },
        );
        overlay.approve(0);

        assert_eq!(overlay.final_table(&original)[0], original[0]);
    }

    #[test]
    fn blank_text_fields_are_not_edits() {
        let mut overlay = ReviewOverlay::new();
        overlay.submit_changes(
            0,
            RowPatch {
                tag: Some("  ".to_string()),
                remarks: Some(String::new()),
                ..Default::default()
            },
        );

        assert!(overlay.is_reviewed(0));
        assert!(!overlay.is_modified(0));
    }

    #[test]
    fn draft_stores_without_marking_reviewed() {
        let mut overlay = ReviewOverlay::new();
        overlay.save_draft(
            3,
            RowPatch {
                outlet_count: Some(2),
                ..Default::default()
            },
        );

        assert!(!overlay.is_reviewed(3));
        assert!(overlay.is_modified(3));
        assert_eq!(overlay.final_table(&four_rows())[3].outlet_count, 2);
    }

    #[test]
    fn navigation_targets_lowest_unreviewed() {
        let mut overlay = ReviewOverlay::new();
        overlay.approve(0);
        overlay.approve(2);

        assert_eq!(overlay.next_unreviewed(4), 1);
        assert_eq!(overlay.advance_after_review(2, 4), 1);
        assert!(!overlay.all_reviewed(4));
    }

    #[test]
    fn navigation_when_all_reviewed_steps_forward_and_clamps() {
        let mut overlay = ReviewOverlay::new();
        for i in 0..4 {
            overlay.approve(i);
        }

        // The sentinel 0 means "nothing left"; advancing falls back to
        // stepping forward, clamped to the last row.
        assert_eq!(overlay.next_unreviewed(4), 0);
        assert_eq!(overlay.advance_after_review(1, 4), 2);
        assert_eq!(overlay.advance_after_review(3, 4), 3);
        assert!(overlay.all_reviewed(4));
    }

    #[test]
    fn sequential_check() {
        let mut overlay = ReviewOverlay::new();
        overlay.approve(0);
        overlay.approve(1);

        assert!(overlay.is_sequential(2, 4));
        assert!(!overlay.is_sequential(3, 4));
        // Reviewed rows stay sequential: everything below them is reviewed.
        assert!(overlay.is_sequential(1, 4));
    }

    #[test]
    fn wire_format_uses_string_keys() {
        let mut overlay = ReviewOverlay::new();
        overlay.approve(0);
        overlay.submit_changes(
            2,
            RowPatch {
                tag: Some("T-103A".to_string()),
                ..Default::default()
            },
        );
        overlay.set_current_index(3);

        let value = serde_json::to_value(&overlay).unwrap();
        assert_eq!(value["reviewed_indices"], serde_json::json!([0, 2]));
        assert_eq!(value["equipment_data"]["2"]["tag"], "T-103A");
        assert_eq!(value["current_index"], 3);
        // Patches serialize sparsely.
        assert!(value["equipment_data"]["2"].get("remarks").is_none());

        let back: ReviewOverlay = serde_json::from_value(value).unwrap();
        assert_eq!(back, overlay);
    }

    #[test]
    fn deserializes_the_stored_shape() {
        let overlay: ReviewOverlay = serde_json::from_str(
            r#"{
                "reviewed_indices": [0, 1],
                "equipment_data": {"1": {"inlet_count": 2}},
                "current_index": 2
            }"#,
        )
        .unwrap();

        assert!(overlay.is_reviewed(1));
        assert_eq!(overlay.patch(1).unwrap().inlet_count, Some(2));
        assert_eq!(overlay.current_index(), 2);
    }

    #[test]
    fn modified_column_in_markdown() {
        let mut overlay = ReviewOverlay::new();
        overlay.submit_changes(
            1,
            RowPatch {
                inlet_count: Some(2),
                ..Default::default()
            },
        );

        let md = overlay.final_table_to_markdown(&four_rows(), "Modified Table after Human Review");
        assert!(md.starts_with("### Modified Table after Human Review\n"));
        assert!(md.contains("| Tag | Equipment type | Inlet streams | Inlet count | Outlet streams | Outlet count | Remarks | Modified |"));
        assert!(md.contains("|---|---|---|---|---|---|---|---|"));
        assert!(md.contains("| E-102 | Pump | From T-100 | 2 | To E-102 | 1 |  | Yes |"));
        assert!(md.contains("| P-101 | Pump | From T-100 | 1 | To E-102 | 1 |  | No |"));
    }

    proptest! {
        /// Approving every row always recovers the original table, no
        /// matter what edits happened beforehand.
        #[test]
        fn approve_all_is_identity(edits in proptest::collection::vec((0usize..4, ".{0,8}"), 0..12)) {
            let original = four_rows();
            let mut overlay = ReviewOverlay::new();
            for (index, text) in edits {
                overlay.submit_changes(index, RowPatch {
                    remarks: Some(text),
                    ..Default::default()
                });
            }
            for i in 0..original.len() {
                overlay.approve(i);
            }
            prop_assert_eq!(overlay.final_table(&original), original);
        }

        /// The projection never adds, drops or reorders rows, whatever the
        /// overlay holds.
        #[test]
        fn projection_preserves_row_count_and_order(
            edits in proptest::collection::vec((0usize..4, "[A-Z]-[0-9]{3}"), 0..12),
        ) {
            let original = four_rows();
            let mut overlay = ReviewOverlay::new();
            for (index, tag) in edits {
                overlay.save_draft(index, RowPatch { tag: Some(tag), ..Default::default() });
            }

            let projected = overlay.final_table(&original);
            prop_assert_eq!(projected.len(), original.len());
            for (index, row) in projected.iter().enumerate() {
                if !overlay.is_modified(index) {
                    prop_assert_eq!(row, &original[index]);
                }
                prop_assert_eq!(&row.equipment_type, &original[index].equipment_type);
            }
        }

        /// Serde round-trips preserve the overlay exactly.
        #[test]
        fn overlay_roundtrips(
            reviewed in proptest::collection::btree_set(0usize..8, 0..8),
            patched in proptest::collection::btree_map(0usize..8, "[a-z]{1,6}", 0..8),
            current in 0usize..8,
        ) {
            let mut overlay = ReviewOverlay::new();
            for &i in &reviewed {
                overlay.approve(i);
            }
            for (&i, tag) in &patched {
                overlay.save_draft(i, RowPatch { tag: Some(tag.clone()), ..Default::default() });
            }
            overlay.set_current_index(current);

            let json = serde_json::to_string(&overlay).unwrap();
            let back: ReviewOverlay = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, overlay);
        }
    }
}
