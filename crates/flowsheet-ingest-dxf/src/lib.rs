//! DXF entity-graph extraction for flowsheet.
//!
//! Reads a DXF process-flow diagram and normalizes it into a generic entity
//! graph: blocks (with attributes), lines (uniform vertex lists), texts,
//! circles, arcs and arrow markers, plus a drawing-level summary of layer and
//! block names. Simple and generic: no assumptions about layer names or
//! block types. The graph is the only bridge between the raw CAD geometry
//! and the reasoning stages, so its serialized form must be stable: all
//! coordinates are rounded to two decimals, and repeated extraction of the
//! same file is byte-identical.

pub mod parser;

use parser::parse_entities;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

// ============================================================================
// Entity graph
// ============================================================================

/// An inserted block with its attributes and proximity link count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub block_name: String,
    pub layer: String,
    /// 2D insertion point, rounded to two decimals.
    pub position: [f64; 2],
    pub rotation: f64,
    /// Attribute tag → value; empty values are dropped.
    pub attributes: BTreeMap<String, String>,
    /// Number of extracted lines with an endpoint near this block.
    pub near_lines: u32,
}

/// A line or polyline, stored uniformly as a vertex list (≥ 2 vertices;
/// polylines preserved in full, plain segments as 2 vertices).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineRecord {
    pub layer: String,
    pub vertices: Vec<[f64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRecord {
    pub text_string: String,
    pub layer: String,
    pub position: [f64; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleRecord {
    pub center: [f64; 2],
    pub radius: f64,
    pub layer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcRecord {
    pub center: [f64; 2],
    pub radius: f64,
    pub start_angle: f64,
    pub end_angle: f64,
    pub layer: String,
}

/// A block that looks like a flow-direction marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrowRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub block_name: String,
    pub position: [f64; 2],
    pub rotation: f64,
    pub layer: String,
}

/// Drawing-level summary: deduplicated, sorted name sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrawingSchema {
    pub layers: Vec<String>,
    pub block_names: Vec<String>,
}

/// Categorized entity records, in extraction order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    pub blocks: Vec<BlockRecord>,
    pub lines: Vec<LineRecord>,
    pub texts: Vec<TextRecord>,
    pub circles: Vec<CircleRecord>,
    pub arcs: Vec<ArcRecord>,
    pub arrows: Vec<ArrowRecord>,
}

/// Normalized extraction result handed to the reasoning pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityGraph {
    pub drawing_schema: DrawingSchema,
    pub entities: Entities,
}

impl EntityGraph {
    /// Serialized form handed to the pipeline. Field order is fixed by the
    /// struct definitions and BTreeMaps, so this is deterministic.
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).expect("entity graph serializes")
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Extraction options.
#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    /// Distance threshold for counting nearby line endpoints.
    pub proximity_threshold: f64,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            proximity_threshold: 15.0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DxfError {
    #[error("unreadable drawing: {0}")]
    Unreadable(String),
    #[error("unreadable drawing: {0}")]
    Io(#[from] std::io::Error),
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Extract the entity graph from a DXF file on disk.
pub fn extract_schema(path: &Path, options: ExtractOptions) -> Result<EntityGraph, DxfError> {
    let content = std::fs::read_to_string(path)?;
    extract_schema_from_str(&content, options)
}

/// Extract the entity graph from raw DXF content.
///
/// Unsupported entity kinds are silently skipped; only unreadable input is
/// fatal. The proximity pass is O(blocks × lines): every line's first and
/// last vertex is checked against every block position. That is quadratic by
/// design: drawings are bounded in entity count, and endpoint-only checking
/// is an intentional approximation of line-segment distance.
pub fn extract_schema_from_str(
    content: &str,
    options: ExtractOptions,
) -> Result<EntityGraph, DxfError> {
    let raw = parse_entities(content)?;

    let mut layers = BTreeSet::new();
    let mut block_names = BTreeSet::new();
    let mut entities = Entities::default();

    let mut i = 0;
    while i < raw.len() {
        let entity = &raw[i];
        match entity.kind.as_str() {
            "INSERT" => {
                let layer = entity.layer();
                let name = entity.first(2).unwrap_or("").to_string();
                let position = [round2(entity.float(10)), round2(entity.float(20))];
                let rotation = round2(entity.float(50));

                layers.insert(layer.clone());
                block_names.insert(name.clone());

                // Trailing ATTRIB entities (up to SEQEND) belong to this insert.
                let mut attributes = BTreeMap::new();
                while i + 1 < raw.len() && raw[i + 1].kind == "ATTRIB" {
                    let attrib = &raw[i + 1];
                    let tag = attrib.first(2).unwrap_or("").trim().to_string();
                    let value = attrib.first(1).unwrap_or("").trim().to_string();
                    if !value.is_empty() {
                        attributes.insert(tag, value);
                    }
                    i += 1;
                }
                if i + 1 < raw.len() && raw[i + 1].kind == "SEQEND" {
                    i += 1;
                }

                // Flow-direction markers are tracked separately as well.
                let lowered = name.to_lowercase();
                if lowered.contains("arrow") || lowered.contains("flow") {
                    entities.arrows.push(ArrowRecord {
                        kind: "block".to_string(),
                        block_name: name.clone(),
                        position,
                        rotation,
                        layer: layer.clone(),
                    });
                }

                entities.blocks.push(BlockRecord {
                    block_name: name,
                    layer,
                    position,
                    rotation,
                    attributes,
                    near_lines: 0,
                });
            }
            "LINE" => {
                layers.insert(entity.layer());
                entities.lines.push(LineRecord {
                    layer: entity.layer(),
                    vertices: vec![
                        [round2(entity.float(10)), round2(entity.float(20))],
                        [round2(entity.float(11)), round2(entity.float(21))],
                    ],
                    width: None,
                });
            }
            "LWPOLYLINE" => {
                let xs = entity.all(10);
                let ys = entity.all(20);
                let vertices: Vec<[f64; 2]> = xs
                    .iter()
                    .zip(ys.iter())
                    .map(|(x, y)| {
                        [
                            round2(x.trim().parse().unwrap_or(0.0)),
                            round2(y.trim().parse().unwrap_or(0.0)),
                        ]
                    })
                    .collect();
                if vertices.len() > 1 {
                    layers.insert(entity.layer());
                    let width = entity
                        .first(43)
                        .and_then(|v| v.trim().parse::<f64>().ok())
                        .map(round2);
                    entities.lines.push(LineRecord {
                        layer: entity.layer(),
                        vertices,
                        width,
                    });
                }
            }
            "CIRCLE" => {
                layers.insert(entity.layer());
                entities.circles.push(CircleRecord {
                    center: [round2(entity.float(10)), round2(entity.float(20))],
                    radius: round2(entity.float(40)),
                    layer: entity.layer(),
                });
            }
            "ARC" => {
                layers.insert(entity.layer());
                entities.arcs.push(ArcRecord {
                    center: [round2(entity.float(10)), round2(entity.float(20))],
                    radius: round2(entity.float(40)),
                    start_angle: round2(entity.float(50)),
                    end_angle: round2(entity.float(51)),
                    layer: entity.layer(),
                });
            }
            "TEXT" => {
                let text = entity.first(1).unwrap_or("").trim().to_string();
                if !text.is_empty() {
                    layers.insert(entity.layer());
                    entities.texts.push(TextRecord {
                        text_string: text,
                        layer: entity.layer(),
                        position: [round2(entity.float(10)), round2(entity.float(20))],
                    });
                }
            }
            "MTEXT" => {
                // Long MTEXT bodies are split across code-3 chunks with the
                // final chunk in code 1.
                let mut text = entity.all(3).concat();
                text.push_str(entity.first(1).unwrap_or(""));
                let text = text.trim().to_string();
                if !text.is_empty() {
                    layers.insert(entity.layer());
                    entities.texts.push(TextRecord {
                        text_string: text,
                        layer: entity.layer(),
                        position: [round2(entity.float(10)), round2(entity.float(20))],
                    });
                }
            }
            other => {
                debug!(kind = other, "skipping unsupported entity kind");
            }
        }
        i += 1;
    }

    link_nearby_lines(&mut entities, options.proximity_threshold);

    Ok(EntityGraph {
        drawing_schema: DrawingSchema {
            layers: layers.into_iter().collect(),
            block_names: block_names.into_iter().collect(),
        },
        entities,
    })
}

/// Count, for every block, the lines with a first or last vertex within the
/// threshold of the block position. Squared distances avoid the sqrt; the
/// comparison is strict.
fn link_nearby_lines(entities: &mut Entities, threshold: f64) {
    let threshold_sq = threshold * threshold;

    for block in &mut entities.blocks {
        let mut near_lines = 0;
        for line in &entities.lines {
            let start = line.vertices[0];
            let end = line.vertices[line.vertices.len() - 1];
            if dist_sq(start, block.position) < threshold_sq
                || dist_sq(end, block.position) < threshold_sq
            {
                near_lines += 1;
            }
        }
        block.near_lines = near_lines;
    }
}

fn dist_sq(a: [f64; 2], b: [f64; 2]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    dx * dx + dy * dy
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const PUMP_DRAWING: &str = "0\nSECTION\n2\nENTITIES\n\
        0\nINSERT\n8\nEquipment\n2\nPUMP\n66\n1\n10\n0.0\n20\n0.0\n50\n90.0\n\
        0\nATTRIB\n2\nTAG\n1\nP-101\n\
        0\nATTRIB\n2\nNOTE\n1\n\n\
        0\nSEQEND\n\
        0\nLINE\n8\nProcess\n10\n10.0\n20\n0.0\n11\n50.0\n21\n50.0\n\
        0\nLINE\n8\nProcess\n10\n20.0\n20\n0.0\n11\n50.0\n21\n50.0\n\
        0\nLWPOLYLINE\n8\nProcess\n43\n0.5\n10\n301.0\n20\n302.0\n10\n303.0\n20\n304.0\n10\n305.0\n20\n306.0\n\
        0\nTEXT\n8\nText\n1\nFeed water\n10\n12.345\n20\n7.891\n\
        0\nMTEXT\n8\nText\n3\nTo storage \n1\ntank T-200\n10\n1.0\n20\n1.0\n\
        0\nCIRCLE\n8\nSymbols\n10\n4.0\n20\n4.0\n40\n2.5\n\
        0\nARC\n8\nSymbols\n10\n0.0\n20\n0.0\n40\n1.0\n50\n0.0\n51\n180.0\n\
        0\nINSERT\n8\nSymbols\n2\nFLOW_ARROW\n10\n30.0\n20\n30.0\n\
        0\nSOLID\n8\nSymbols\n\
        0\nENDSEC\n0\nEOF\n";

    fn extract() -> EntityGraph {
        extract_schema_from_str(PUMP_DRAWING, ExtractOptions::default()).unwrap()
    }

    #[test]
    fn blocks_carry_attributes_and_rotation() {
        let graph = extract();
        let pump = &graph.entities.blocks[0];
        assert_eq!(pump.block_name, "PUMP");
        assert_eq!(pump.layer, "Equipment");
        assert_relative_eq!(pump.rotation, 90.0);
        assert_eq!(pump.attributes.get("TAG").unwrap(), "P-101");
        // Empty attribute values are dropped.
        assert!(!pump.attributes.contains_key("NOTE"));
    }

    #[test]
    fn proximity_counts_endpoints_only() {
        // Block at (0,0) with threshold 15: a line starting at (10,0) is
        // near, one starting at (20,0) is not; only first/last vertices
        // are checked. The polyline sits far from every block.
        let graph = extract();
        assert_eq!(graph.entities.blocks[0].near_lines, 1);
    }

    #[test]
    fn proximity_threshold_is_strict() {
        let content = "0\nSECTION\n2\nENTITIES\n\
            0\nINSERT\n8\nE\n2\nB\n10\n0.0\n20\n0.0\n\
            0\nLINE\n8\nP\n10\n15.0\n20\n0.0\n11\n99.0\n21\n99.0\n\
            0\nENDSEC\n";
        let graph = extract_schema_from_str(content, ExtractOptions::default()).unwrap();
        assert_eq!(graph.entities.blocks[0].near_lines, 0);
    }

    #[test]
    fn polylines_keep_all_vertices() {
        let graph = extract();
        let polyline = graph
            .entities
            .lines
            .iter()
            .find(|l| l.vertices.len() > 2)
            .unwrap();
        assert_eq!(polyline.vertices.len(), 3);
        assert_eq!(polyline.width, Some(0.5));
    }

    #[test]
    fn drawing_schema_is_sorted_and_deduplicated() {
        let graph = extract();
        assert_eq!(
            graph.drawing_schema.layers,
            vec!["Equipment", "Process", "Symbols", "Text"]
        );
        assert_eq!(graph.drawing_schema.block_names, vec!["FLOW_ARROW", "PUMP"]);
    }

    #[test]
    fn arrow_blocks_are_tracked_separately() {
        let graph = extract();
        assert_eq!(graph.entities.arrows.len(), 1);
        assert_eq!(graph.entities.arrows[0].block_name, "FLOW_ARROW");
        assert_eq!(graph.entities.arrows[0].kind, "block");
        // The arrow block still appears in the block list.
        assert_eq!(graph.entities.blocks.len(), 2);
    }

    #[test]
    fn mtext_chunks_are_joined() {
        let graph = extract();
        assert!(graph
            .entities
            .texts
            .iter()
            .any(|t| t.text_string == "To storage tank T-200"));
    }

    #[test]
    fn unsupported_kinds_are_skipped_not_fatal() {
        // The SOLID entity in the fixture must not fail extraction.
        let graph = extract();
        assert_eq!(graph.entities.circles.len(), 1);
        assert_eq!(graph.entities.arcs.len(), 1);
    }

    #[test]
    fn repeated_extraction_is_byte_identical() {
        let a = extract().to_json_pretty();
        let b = extract().to_json_pretty();
        assert_eq!(a, b);
    }

    #[test]
    fn coordinates_are_rounded_to_two_decimals() {
        let graph = extract();
        let text = graph
            .entities
            .texts
            .iter()
            .find(|t| t.text_string == "Feed water")
            .unwrap();
        assert_relative_eq!(text.position[0], 12.35);
        assert_relative_eq!(text.position[1], 7.89);
    }

    #[test]
    fn unreadable_input_is_a_typed_error() {
        let err = extract_schema_from_str("garbage", ExtractOptions::default()).unwrap_err();
        assert!(err.to_string().contains("unreadable drawing"));
    }
}
