//! Utility functions for working with A2A Part objects and artifact
//! normalization.
//!
//! Node code may hand the engine artifacts in a legacy shape where parts
//! are tagged with `type` instead of `kind`. [`normalize_artifact_value`]
//! is the ingest path that canonicalizes those before anything reaches the
//! wire — every published `artifact-update` uses the `kind` discriminator.

use serde_json::Value;
use uuid::Uuid;

use crate::types::{Artifact, FileContent, Part};

/// Whether a part is a text part.
pub fn is_text_part(part: &Part) -> bool {
    matches!(part, Part::Text { .. })
}

/// Whether a part is a file part.
pub fn is_file_part(part: &Part) -> bool {
    matches!(part, Part::File { .. })
}

/// Whether a part is a structured data part.
pub fn is_data_part(part: &Part) -> bool {
    matches!(part, Part::Data { .. })
}

/// Extracts text content from all text parts in a list.
pub fn get_text_parts(parts: &[Part]) -> Vec<String> {
    parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

/// Extracts data content from all data parts in a list.
pub fn get_data_parts(parts: &[Part]) -> Vec<Value> {
    parts
        .iter()
        .filter_map(|part| match part {
            Part::Data { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect()
}

/// Extracts file content from all file parts in a list.
pub fn get_file_parts(parts: &[Part]) -> Vec<FileContent> {
    parts
        .iter()
        .filter_map(|part| match part {
            Part::File { file, .. } => Some(file.clone()),
            _ => None,
        })
        .collect()
}

/// Normalize a raw artifact value produced by node code into the canonical
/// A2A shape.
///
/// - Parts tagged with the legacy `type` key are rewritten to `kind`.
/// - A missing `artifactId` is backfilled with a fresh UUID.
/// - Parts that still fail to parse are preserved as data parts rather than
///   dropped.
pub fn normalize_artifact_value(raw: &Value) -> Artifact {
    let artifact_id = raw
        .get("artifactId")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let name = raw
        .get("name")
        .and_then(|v| v.as_str())
        .map(String::from);
    let description = raw
        .get("description")
        .and_then(|v| v.as_str())
        .map(String::from);
    let metadata = raw.get("metadata").cloned().filter(|v| !v.is_null());

    let parts = raw
        .get("parts")
        .and_then(|v| v.as_array())
        .map(|parts| parts.iter().map(normalize_part_value).collect())
        .unwrap_or_default();

    Artifact {
        artifact_id,
        name,
        description,
        parts,
        metadata,
    }
}

/// Normalize one raw part value, accepting the legacy `type` tag.
fn normalize_part_value(raw: &Value) -> Part {
    let mut value = raw.clone();

    if let Some(obj) = value.as_object_mut() {
        if !obj.contains_key("kind") {
            if let Some(legacy) = obj.remove("type") {
                obj.insert("kind".to_string(), legacy);
            }
        }
    }

    serde_json::from_value(value).unwrap_or_else(|_| Part::data(raw.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn predicates_match_variants() {
        assert!(is_text_part(&Part::text("x")));
        assert!(is_data_part(&Part::data(json!({"k": 1}))));
        assert!(is_file_part(&Part::file_from_uri(
            "https://example.com/f.pdf",
            None,
            None
        )));
        assert!(!is_text_part(&Part::data(json!(1))));
    }

    #[test]
    fn get_text_parts_collects_in_order() {
        let parts = vec![
            Part::text("Hello"),
            Part::data(json!({"skip": true})),
            Part::text("World"),
        ];
        assert_eq!(get_text_parts(&parts), vec!["Hello", "World"]);
    }

    #[test]
    fn normalize_rewrites_legacy_type_tag() {
        let raw = json!({
            "artifactId": "a1",
            "parts": [{"type": "text", "text": "legacy"}]
        });
        let artifact = normalize_artifact_value(&raw);
        assert_eq!(artifact.artifact_id, "a1");
        assert_eq!(artifact.parts.len(), 1);
        match &artifact.parts[0] {
            Part::Text { text, .. } => assert_eq!(text, "legacy"),
            other => panic!("expected text part, got {:?}", other),
        }

        // Canonical output uses `kind`, never `type`.
        let value = serde_json::to_value(&artifact).unwrap();
        assert_eq!(value["parts"][0]["kind"], "text");
        assert!(value["parts"][0].get("type").is_none());
    }

    #[test]
    fn normalize_backfills_artifact_id() {
        let raw = json!({"parts": [{"kind": "text", "text": "x"}]});
        let artifact = normalize_artifact_value(&raw);
        assert!(!artifact.artifact_id.is_empty());
        assert!(Uuid::parse_str(&artifact.artifact_id).is_ok());
    }

    #[test]
    fn normalize_keeps_kind_when_both_tags_present() {
        let raw = json!({
            "artifactId": "a1",
            "parts": [{"kind": "text", "type": "data", "text": "x"}]
        });
        let artifact = normalize_artifact_value(&raw);
        assert!(is_text_part(&artifact.parts[0]));
    }

    #[test]
    fn unparseable_part_becomes_data_part() {
        let raw = json!({
            "artifactId": "a1",
            "parts": [{"weird": "shape"}]
        });
        let artifact = normalize_artifact_value(&raw);
        assert!(is_data_part(&artifact.parts[0]));
    }
}
