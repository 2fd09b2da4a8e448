//! Definition documents: the authored form of a workflow definition.
//!
//! A document carries the name, optional description and manager, with the
//! state machine's `startAt` and `states` at the top level. Documents are
//! JSON or YAML; the format is chosen by file extension.

use std::path::Path;

use serde::{Deserialize, Serialize};
use stepflow_types::definition::{Manager, StateMachine};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Request to create (or add a version to) a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionDocument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub manager: Manager,
    #[serde(flatten)]
    pub state_machine: StateMachine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    /// Format implied by a path's extension; anything but `.json` is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => DocumentFormat::Json,
            _ => DocumentFormat::Yaml,
        }
    }
}

/// Parse a definition document from a string.
pub fn parse_document(content: &str, format: DocumentFormat) -> Result<DefinitionDocument, DocumentError> {
    match format {
        DocumentFormat::Json => {
            serde_json::from_str(content).map_err(|e| DocumentError::Parse(e.to_string()))
        }
        DocumentFormat::Yaml => {
            serde_yaml_ng::from_str(content).map_err(|e| DocumentError::Parse(e.to_string()))
        }
    }
}

/// Serialize a document in the given format.
pub fn render_document(doc: &DefinitionDocument, format: DocumentFormat) -> Result<String, DocumentError> {
    match format {
        DocumentFormat::Json => {
            serde_json::to_string_pretty(doc).map_err(|e| DocumentError::Parse(e.to_string()))
        }
        DocumentFormat::Yaml => {
            serde_yaml_ng::to_string(doc).map_err(|e| DocumentError::Parse(e.to_string()))
        }
    }
}

/// Load a definition document from disk.
pub fn load_document(path: &Path) -> Result<DefinitionDocument, DocumentError> {
    let content = std::fs::read_to_string(path)?;
    parse_document(&content, DocumentFormat::from_path(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const YAML_DOC: &str = r#"
name: nightly-report
description: Build and mail the nightly report
manager: batch
startAt: gather
states:
  gather:
    type: task
    resource: gather-data
    next: render
    retry:
      - errorPatterns: [States.ALL]
        maxAttempts: 2
  render:
    type: task
    resource: render-report
    end: true
"#;

    #[test]
    fn test_parse_yaml_document() {
        let doc = parse_document(YAML_DOC, DocumentFormat::Yaml).unwrap();
        assert_eq!(doc.name, "nightly-report");
        assert_eq!(doc.manager, Manager::Batch);
        assert_eq!(doc.state_machine.start_at, "gather");
        assert_eq!(doc.state_machine.states.len(), 2);
        assert_eq!(doc.state_machine.states["gather"].retry()[0].max_attempts, 2);
    }

    #[test]
    fn test_json_render_and_parse() {
        let doc = parse_document(YAML_DOC, DocumentFormat::Yaml).unwrap();
        let json = render_document(&doc, DocumentFormat::Json).unwrap();
        assert!(json.contains(r#""startAt": "gather""#));
        let parsed = parse_document(&json, DocumentFormat::Json).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn test_parse_invalid_document() {
        let err = parse_document("name: x\nstates: 7\n", DocumentFormat::Yaml).unwrap_err();
        assert!(matches!(err, DocumentError::Parse(_)));
    }

    #[test]
    fn test_load_document_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nightly.yaml");
        std::fs::write(&path, YAML_DOC).unwrap();
        let doc = load_document(&path).unwrap();
        assert_eq!(doc.name, "nightly-report");

        let missing = load_document(&dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(DocumentError::Io(_))));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(DocumentFormat::from_path(&PathBuf::from("a.JSON")), DocumentFormat::Json);
        assert_eq!(DocumentFormat::from_path(&PathBuf::from("a.yml")), DocumentFormat::Yaml);
    }
}
