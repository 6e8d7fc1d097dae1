// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Classifier response schemas and tolerant JSON extraction.
//!
//! Models wrap JSON in prose and code fences more often than not; the
//! extractor peels those off before strict schema validation. Anything that
//! survives extraction but fails validation is a malformed response, which
//! for batches triggers the per-file fallback.

use serde::{Deserialize, Serialize};

use crate::ClassifierError;

/// One POI as the classifier reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoiSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub poi_type: String,
    pub start_line: u32,
    #[serde(default)]
    pub end_line: u32,
    #[serde(default)]
    pub is_exported: bool,
}

/// One relationship candidate as the classifier reports it. Endpoints are
/// names or semantic ids, never database identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipSpec {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

fn default_confidence() -> f64 {
    0.8
}

/// Single-file response shape: `{ pois: [...], relationships: [...] }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SingleFileResponse {
    #[serde(default)]
    pub pois: Vec<PoiSpec>,
    #[serde(default)]
    pub relationships: Vec<RelationshipSpec>,
}

/// Per-file entry in a batch response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFileResult {
    #[serde(rename = "filePath", alias = "file_path")]
    pub file_path: String,
    #[serde(default)]
    pub pois: Vec<PoiSpec>,
    #[serde(default)]
    pub relationships: Vec<RelationshipSpec>,
}

/// Batch response shape: `{ files: [ { filePath, pois, ... }, ... ] }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub files: Vec<BatchFileResult>,
}

/// Triangulation-role response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssessment {
    pub confidence: f64,
    pub evidence_strength: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Pull the first JSON object out of model output: strips code fences and
/// leading prose, then matches braces (string-aware).
pub fn extract_json(text: &str) -> Result<&str, ClassifierError> {
    let start = text
        .find('{')
        .ok_or_else(|| ClassifierError::MalformedResponse("no JSON object in response".to_string()))?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    Err(ClassifierError::MalformedResponse(
        "unbalanced JSON object in response".to_string(),
    ))
}

fn check_unit_interval(value: f64, field: &str) -> Result<(), ClassifierError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ClassifierError::MalformedResponse(format!(
            "{field} {value} outside [0, 1]"
        )));
    }
    Ok(())
}

fn validate_pois(pois: &[PoiSpec]) -> Result<(), ClassifierError> {
    for poi in pois {
        if poi.name.is_empty() {
            return Err(ClassifierError::MalformedResponse(
                "POI with empty name".to_string(),
            ));
        }
        if poi.end_line != 0 && poi.end_line < poi.start_line {
            return Err(ClassifierError::MalformedResponse(format!(
                "POI {} has end_line {} before start_line {}",
                poi.name, poi.end_line, poi.start_line
            )));
        }
    }
    Ok(())
}

fn validate_relationships(relationships: &[RelationshipSpec]) -> Result<(), ClassifierError> {
    for rel in relationships {
        if rel.source.is_empty() || rel.target.is_empty() || rel.rel_type.is_empty() {
            return Err(ClassifierError::MalformedResponse(
                "relationship with empty endpoint or type".to_string(),
            ));
        }
        check_unit_interval(rel.confidence, "relationship confidence")?;
    }
    Ok(())
}

/// Parse and validate a single-file response.
pub fn parse_single(text: &str) -> Result<SingleFileResponse, ClassifierError> {
    let json = extract_json(text)?;
    let response: SingleFileResponse = serde_json::from_str(json)
        .map_err(|e| ClassifierError::MalformedResponse(e.to_string()))?;
    validate_pois(&response.pois)?;
    validate_relationships(&response.relationships)?;
    Ok(response)
}

/// Parse and validate a batch response against the requested file set.
/// A response naming a file that was never sent is malformed.
pub fn parse_batch(text: &str, expected_paths: &[String]) -> Result<BatchResponse, ClassifierError> {
    let json = extract_json(text)?;
    let response: BatchResponse = serde_json::from_str(json)
        .map_err(|e| ClassifierError::MalformedResponse(e.to_string()))?;
    for file in &response.files {
        if !expected_paths.iter().any(|p| p == &file.file_path) {
            return Err(ClassifierError::MalformedResponse(format!(
                "batch response names unknown file {}",
                file.file_path
            )));
        }
        validate_pois(&file.pois)?;
        validate_relationships(&file.relationships)?;
    }
    Ok(response)
}

/// Parse and validate a role assessment.
pub fn parse_role(text: &str) -> Result<RoleAssessment, ClassifierError> {
    let json = extract_json(text)?;
    let assessment: RoleAssessment = serde_json::from_str(json)
        .map_err(|e| ClassifierError::MalformedResponse(e.to_string()))?;
    check_unit_interval(assessment.confidence, "confidence")?;
    check_unit_interval(assessment.evidence_strength, "evidence_strength")?;
    Ok(assessment)
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_output() {
        let text = "Here is the analysis:\n```json\n{\"pois\": []}\n```\nDone.";
        assert_eq!(extract_json(text).unwrap(), "{\"pois\": []}");
    }

    #[test]
    fn test_extract_json_handles_braces_in_strings() {
        let text = "{\"reason\": \"calls f({) weird\"} trailing";
        assert_eq!(extract_json(text).unwrap(), "{\"reason\": \"calls f({) weird\"}");
    }

    #[test]
    fn test_extract_json_rejects_proseless_garbage() {
        assert!(extract_json("no json here").is_err());
        assert!(extract_json("{\"unbalanced\": true").is_err());
    }

    #[test]
    fn test_parse_single_happy_path() {
        let text = r#"{
            "pois": [
                {"name": "createUser", "type": "FunctionDefinition", "start_line": 10, "end_line": 20, "is_exported": true}
            ],
            "relationships": [
                {"source": "createUser", "target": "hashPassword", "type": "CALLS", "confidence": 0.9}
            ]
        }"#;
        let response = parse_single(text).unwrap();
        assert_eq!(response.pois.len(), 1);
        assert_eq!(response.relationships[0].rel_type, "CALLS");
    }

    #[test]
    fn test_parse_single_rejects_bad_confidence() {
        let text = r#"{"relationships": [{"source": "a", "target": "b", "type": "CALLS", "confidence": 1.5}]}"#;
        assert!(matches!(
            parse_single(text),
            Err(ClassifierError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_batch_validates_file_set() {
        let expected = vec!["a.js".to_string(), "b.js".to_string()];
        let ok = r#"{"files": [{"filePath": "a.js", "pois": []}]}"#;
        assert!(parse_batch(ok, &expected).is_ok());

        let unknown = r#"{"files": [{"filePath": "z.js", "pois": []}]}"#;
        assert!(parse_batch(unknown, &expected).is_err());
    }

    #[test]
    fn test_parse_batch_accepts_snake_case_alias() {
        let expected = vec!["a.js".to_string()];
        let text = r#"{"files": [{"file_path": "a.js"}]}"#;
        let response = parse_batch(text, &expected).unwrap();
        assert_eq!(response.files[0].file_path, "a.js");
    }

    #[test]
    fn test_parse_batch_rejects_invalid_json() {
        let expected = vec!["a.js".to_string()];
        assert!(matches!(
            parse_batch("{\"files\": oops}", &expected),
            Err(ClassifierError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_role() {
        let text = r#"{"confidence": 0.72, "evidence_strength": 0.8, "reasoning": "direct call observed"}"#;
        let assessment = parse_role(text).unwrap();
        assert!((assessment.confidence - 0.72).abs() < 1e-9);

        let bad = r#"{"confidence": -0.1, "evidence_strength": 0.8}"#;
        assert!(parse_role(bad).is_err());
    }

    #[test]
    fn test_relationship_confidence_defaults() {
        let text = r#"{"relationships": [{"source": "a", "target": "b", "type": "USES"}]}"#;
        let response = parse_single(text).unwrap();
        assert!((response.relationships[0].confidence - 0.8).abs() < 1e-9);
    }
}
