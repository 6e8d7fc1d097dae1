// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use serde::{Deserialize, Serialize};

use crate::hashing;

/// Kind of code entity the classifier extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoiType {
    ClassDefinition,
    FunctionDefinition,
    MethodDefinition,
    VariableDeclaration,
    ImportStatement,
    ExportStatement,
    /// Classifier-reported type outside the known set. Kept verbatim so
    /// nothing the classifier finds is silently discarded.
    #[serde(untagged)]
    Other(String),
}

impl PoiType {
    /// Storage representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ClassDefinition => "ClassDefinition",
            Self::FunctionDefinition => "FunctionDefinition",
            Self::MethodDefinition => "MethodDefinition",
            Self::VariableDeclaration => "VariableDeclaration",
            Self::ImportStatement => "ImportStatement",
            Self::ExportStatement => "ExportStatement",
            Self::Other(s) => s,
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "ClassDefinition" => Self::ClassDefinition,
            "FunctionDefinition" => Self::FunctionDefinition,
            "MethodDefinition" => Self::MethodDefinition,
            "VariableDeclaration" => Self::VariableDeclaration,
            "ImportStatement" => Self::ImportStatement,
            "ExportStatement" => Self::ExportStatement,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A Point of Interest: a named code entity extracted by the classifier.
///
/// POIs are append-only within a run. `semantic_id` is unique per
/// `(run_id, file_id)`; `hash` is unique per run and is the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poi {
    /// Database identifier (`None` until persisted).
    pub id: Option<i64>,
    pub file_id: Option<i64>,
    pub file_path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub poi_type: PoiType,
    pub start_line: u32,
    pub end_line: u32,
    pub is_exported: bool,
    /// Stable textual key, e.g. `a.js::createUser`.
    pub semantic_id: String,
    /// `sha256(name:type:file_path:start_line)`.
    pub hash: String,
    pub run_id: String,
    /// Raw classifier output for this POI, kept for diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_output: Option<serde_json::Value>,
}

impl Poi {
    /// Build a POI from classifier output, deriving `semantic_id` and `hash`.
    #[must_use]
    pub fn from_classifier(
        file_path: impl Into<String>,
        name: impl Into<String>,
        poi_type: PoiType,
        start_line: u32,
        end_line: u32,
        is_exported: bool,
        run_id: impl Into<String>,
    ) -> Self {
        let file_path = file_path.into();
        let name = name.into();
        let hash = hashing::poi_hash(&name, poi_type.as_str(), &file_path, start_line);
        let semantic_id = format!("{file_path}::{name}");
        Self {
            id: None,
            file_id: None,
            file_path,
            name,
            poi_type,
            start_line,
            end_line: end_line.max(start_line),
            is_exported,
            semantic_id,
            hash,
            run_id: run_id.into(),
            llm_output: None,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poi_type_round_trip() {
        assert_eq!(PoiType::parse("FunctionDefinition"), PoiType::FunctionDefinition);
        assert_eq!(
            PoiType::parse("DecoratorDefinition"),
            PoiType::Other("DecoratorDefinition".to_string())
        );
        assert_eq!(PoiType::Other("X".to_string()).as_str(), "X");
    }

    #[test]
    fn test_from_classifier_derives_keys() {
        let poi = Poi::from_classifier(
            "src/a.js",
            "createUser",
            PoiType::FunctionDefinition,
            10,
            20,
            true,
            "run-1",
        );
        assert_eq!(poi.semantic_id, "src/a.js::createUser");
        assert_eq!(
            poi.hash,
            hashing::poi_hash("createUser", "FunctionDefinition", "src/a.js", 10)
        );
        assert!(poi.id.is_none());
    }

    #[test]
    fn test_end_line_never_precedes_start_line() {
        let poi = Poi::from_classifier(
            "a.js",
            "x",
            PoiType::VariableDeclaration,
            8,
            3,
            false,
            "run-1",
        );
        assert_eq!(poi.end_line, 8);
    }

    #[test]
    fn test_poi_serde_uses_type_tag() {
        let poi = Poi::from_classifier("a.js", "x", PoiType::ClassDefinition, 1, 2, false, "r");
        let json = serde_json::to_value(&poi).unwrap();
        assert_eq!(json["type"], "ClassDefinition");
    }
}
