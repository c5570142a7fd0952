//! Pipeline document loading (YAML or JSON).

use std::path::Path;

use serde::{Deserialize, Serialize};

use cairn_types::{CairnError, Result};

use crate::definition::{PipelineDefinition, PipelineSet};
use crate::ledger::Budgets;

/// A file of pipeline definitions with optional run budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDocument {
    pub pipelines: Vec<PipelineDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budgets: Option<Budgets>,
}

impl PipelineDocument {
    /// Index the pipelines by name, rejecting duplicates.
    pub fn to_set(&self) -> Result<PipelineSet> {
        PipelineSet::from_definitions(self.pipelines.iter().cloned())
    }

    /// The pipeline named `name`, or the first one when `name` is `None`.
    pub fn entry(&self, name: Option<&str>) -> Result<&PipelineDefinition> {
        match name {
            Some(name) => self
                .pipelines
                .iter()
                .find(|p| p.name == name)
                .ok_or_else(|| CairnError::UnknownPipeline(name.to_string())),
            None => self
                .pipelines
                .first()
                .ok_or_else(|| CairnError::ValidationError("document defines no pipelines".into())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    /// `.json` files are JSON; everything else is read as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => DocumentFormat::Json,
            _ => DocumentFormat::Yaml,
        }
    }
}

pub fn parse_document(source: &str, format: DocumentFormat) -> Result<PipelineDocument> {
    let doc = match format {
        DocumentFormat::Yaml => serde_yaml::from_str(source)?,
        DocumentFormat::Json => serde_json::from_str(source)?,
    };
    Ok(doc)
}

pub fn load_document(path: impl AsRef<Path>) -> Result<PipelineDocument> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path)?;
    let doc = parse_document(&source, DocumentFormat::from_path(path))?;
    tracing::debug!(
        path = %path.display(),
        pipelines = doc.pipelines.len(),
        "Loaded pipeline document"
    );
    Ok(doc)
}
