//! Low-level ASCII DXF reader.
//!
//! A DXF file is a flat stream of tag pairs: one line holding an integer
//! group code, the next holding the value. Entities live between
//! `(0, SECTION) (2, ENTITIES)` and the matching `(0, ENDSEC)`; each
//! `(0, <TYPE>)` tag starts a new entity whose remaining tags run until the
//! next code-0 tag. This module only splits the stream into typed raw
//! entities; interpretation happens in the extraction layer.

use crate::DxfError;

/// One group-code/value pair.
#[derive(Debug, Clone, PartialEq)]
pub struct DxfTag {
    pub code: i32,
    pub value: String,
}

/// A raw entity: its DXF type name plus the tags that followed it.
#[derive(Debug, Clone)]
pub struct RawEntity {
    pub kind: String,
    pub tags: Vec<DxfTag>,
}

impl RawEntity {
    /// First value for a group code, if present.
    pub fn first(&self, code: i32) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.code == code)
            .map(|t| t.value.as_str())
    }

    /// All values for a group code, in file order.
    pub fn all(&self, code: i32) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| t.code == code)
            .map(|t| t.value.as_str())
            .collect()
    }

    /// First value for a group code parsed as f64 (0.0 when absent/garbled).
    pub fn float(&self, code: i32) -> f64 {
        self.first(code)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0.0)
    }

    /// Layer name (group code 8), defaulting to layer "0" as DXF does.
    pub fn layer(&self) -> String {
        self.first(8).unwrap_or("0").to_string()
    }
}

/// Split raw file content into tag pairs.
fn read_tags(content: &str) -> Result<Vec<DxfTag>, DxfError> {
    let mut tags = Vec::new();
    let mut lines = content.lines();

    while let Some(code_line) = lines.next() {
        let code_str = code_line.trim();
        if code_str.is_empty() && lines.clone().next().is_none() {
            break; // trailing blank line
        }
        let code: i32 = code_str
            .parse()
            .map_err(|_| DxfError::Unreadable(format!("invalid group code line: {:?}", code_str)))?;
        let value = lines
            .next()
            .ok_or_else(|| DxfError::Unreadable(format!("group code {} has no value line", code)))?;
        // Values keep their spacing (MTEXT chunks carry meaningful trailing
        // spaces); only a carriage return from CRLF files is stripped.
        tags.push(DxfTag {
            code,
            value: value.trim_end_matches('\r').to_string(),
        });
    }

    Ok(tags)
}

/// Parse the ENTITIES section into raw entities.
///
/// Anything outside the ENTITIES section (header, tables, blocks) is ignored.
/// A file without an ENTITIES section is unreadable as a drawing.
pub fn parse_entities(content: &str) -> Result<Vec<RawEntity>, DxfError> {
    let tags = read_tags(content)?;

    // Locate the ENTITIES section: (0, SECTION) followed by (2, ENTITIES).
    let mut start = None;
    for (i, window) in tags.windows(2).enumerate() {
        if window[0].code == 0
            && window[0].value == "SECTION"
            && window[1].code == 2
            && window[1].value == "ENTITIES"
        {
            start = Some(i + 2);
            break;
        }
    }
    let start =
        start.ok_or_else(|| DxfError::Unreadable("no ENTITIES section found".to_string()))?;

    let mut entities = Vec::new();
    let mut current: Option<RawEntity> = None;

    for tag in &tags[start..] {
        if tag.code == 0 {
            if let Some(entity) = current.take() {
                entities.push(entity);
            }
            if tag.value == "ENDSEC" {
                return Ok(entities);
            }
            current = Some(RawEntity {
                kind: tag.value.clone(),
                tags: Vec::new(),
            });
        } else if let Some(entity) = current.as_mut() {
            entity.tags.push(tag.clone());
        }
    }

    Err(DxfError::Unreadable(
        "ENTITIES section not terminated by ENDSEC".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY: &str = "0\nSECTION\n2\nENTITIES\n0\nLINE\n8\nProcess\n10\n1.0\n20\n2.0\n11\n3.0\n21\n4.0\n0\nENDSEC\n0\nEOF\n";

    #[test]
    fn splits_tag_pairs() {
        let entities = parse_entities(TINY).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].kind, "LINE");
        assert_eq!(entities[0].first(8), Some("Process"));
        assert_eq!(entities[0].float(10), 1.0);
        assert_eq!(entities[0].float(21), 4.0);
    }

    #[test]
    fn missing_entities_section_is_unreadable() {
        let err = parse_entities("0\nSECTION\n2\nHEADER\n0\nENDSEC\n0\nEOF\n").unwrap_err();
        assert!(matches!(err, DxfError::Unreadable(_)));
    }

    #[test]
    fn garbled_group_code_is_unreadable() {
        let err = parse_entities("not a dxf file at all").unwrap_err();
        assert!(matches!(err, DxfError::Unreadable(_)));
    }

    #[test]
    fn unterminated_section_is_unreadable() {
        let err = parse_entities("0\nSECTION\n2\nENTITIES\n0\nLINE\n8\nA\n").unwrap_err();
        assert!(matches!(err, DxfError::Unreadable(_)));
    }

    #[test]
    fn layer_defaults_to_zero() {
        let entities =
            parse_entities("0\nSECTION\n2\nENTITIES\n0\nLINE\n10\n0.0\n20\n0.0\n11\n1.0\n21\n1.0\n0\nENDSEC\n").unwrap();
        assert_eq!(entities[0].layer(), "0");
    }
}
