//! Shared typed models used across scanning, storage, and scoring layers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::CohesionError;

// ---------------------------------------------------------------------------
// 1. DefinitionKind
// ---------------------------------------------------------------------------

/// Kind of a top-level definition. Stored as `"function"` / `"class"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    Function,
    Class,
}

impl DefinitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefinitionKind::Function => "function",
            DefinitionKind::Class => "class",
        }
    }
}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DefinitionKind {
    type Err = CohesionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "function" => Ok(DefinitionKind::Function),
            "class" => Ok(DefinitionKind::Class),
            other => Err(CohesionError::Parse(format!(
                "unknown definition kind: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// 2. DefinitionRecord
// ---------------------------------------------------------------------------

/// A persisted top-level function or class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefinitionRecord {
    pub id: i64,
    pub kind: DefinitionKind,
    pub name: String,
    pub start_line: i64,
    pub end_line: i64,
    pub file_path: String,
}

// ---------------------------------------------------------------------------
// 3. TransitiveImportRecord
// ---------------------------------------------------------------------------

/// One module that appeared in the runtime registry after executing an
/// import node in isolation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransitiveImportRecord {
    /// First dotted component, underscores replaced by hyphens.
    pub root: String,
    pub module: String,
    pub path: Option<String>,
    pub version: Option<String>,
    /// Canonical text of the owning import node.
    pub code_str: String,
}

/// Root label of a qualified module name: `google_auth.transport` -> `google-auth`.
pub fn root_label(module: &str) -> String {
    module
        .split('.')
        .next()
        .unwrap_or_default()
        .replace('_', "-")
}

// ---------------------------------------------------------------------------
// 4. Resolution status
// ---------------------------------------------------------------------------

/// Persisted state of an import node's isolated execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    Resolved,
    Failed,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Resolved => "resolved",
            ResolutionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "resolved" => Some(ResolutionStatus::Resolved),
            "failed" => Some(ResolutionStatus::Failed),
            _ => None,
        }
    }
}

/// Outcome of resolving one import node.
#[derive(Clone, Debug, PartialEq)]
pub enum ResolutionOutcome {
    Resolved(Vec<TransitiveImportRecord>),
    Failed(String),
}

impl ResolutionOutcome {
    pub fn status(&self) -> ResolutionStatus {
        match self {
            ResolutionOutcome::Resolved(_) => ResolutionStatus::Resolved,
            ResolutionOutcome::Failed(_) => ResolutionStatus::Failed,
        }
    }

    /// Records of a successful resolution; a failed one contributes nothing.
    pub fn records(&self) -> &[TransitiveImportRecord] {
        match self {
            ResolutionOutcome::Resolved(records) => records,
            ResolutionOutcome::Failed(_) => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// 5. Scores
// ---------------------------------------------------------------------------

/// Weights and cohesion of one definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefinitionScore {
    pub definition_id: i64,
    pub kind: DefinitionKind,
    pub name: String,
    pub start_line: i64,
    pub end_line: i64,
    pub file_path: String,
    pub ideal_weight: u64,
    pub actual_weight: u64,
    pub cohesion_score: f64,
    /// Package labels behind `ideal_weight`, sorted.
    pub ideal_packages: Vec<String>,
    /// Package labels behind `actual_weight`, sorted.
    pub actual_packages: Vec<String>,
}

/// Result of one scoring run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub definitions: Vec<DefinitionScore>,
    pub aggregate_score: f64,
}

impl ScoreReport {
    pub fn find(&self, file_path: &str, name: &str) -> Option<&DefinitionScore> {
        self.definitions
            .iter()
            .find(|d| d.file_path == file_path && d.name == name)
    }
}
